//! Opening an existing piece file.
//!
//! The write-ahead log is drained before a single byte of the file is
//! trusted: every transaction logged but not marked complete is re-applied
//! in log order, then the metadata, key table and chunk table are read.
//!
//! ```text
//! Unopened -> ReplayingLog -> ReadingMetadata -> Ready
//!                  ^                |
//!                  +-- disk fault --+
//! ```
//!
//! A disk fault leaves the loader in `ReplayingLog` so the caller may try
//! again once the device is healthy. How often to try is the caller's call.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::apply;
use crate::deps::Dependencies;
use crate::error::Result;
use crate::file::PieceFile;
use crate::wal::Wal;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadState {
    Unopened,
    ReplayingLog,
    ReadingMetadata,
    Ready,
}

/// What a log replay re-applied.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplayReport {
    pub transactions: usize,
    pub updates: usize,
}

/// Open the log at `wal_path` and re-apply its incomplete transactions.
///
/// A transaction is marked complete only after all of its updates were
/// applied and synced. Any error, disk fault or not, stops the replay with
/// the failing transaction still pending in the log.
pub fn replay_wal(wal_path: &Path, deps: &dyn Dependencies) -> Result<(Arc<Wal>, ReplayReport)> {
    let (pending, wal) = Wal::open(wal_path)?;
    let mut report = ReplayReport::default();
    for txn in &pending {
        info!(txn = txn.id(), updates = txn.updates().len(), "replaying transaction");
        if let Err(err) = apply::apply_updates(deps, txn.updates()) {
            if err.is_disk_fault() {
                warn!(txn = txn.id(), error = %err, "disk fault during replay");
            }
            return Err(err);
        }
        wal.signal_applied(txn)?;
        report.transactions += 1;
        report.updates += txn.updates().len();
    }
    Ok((wal, report))
}

/// Drives one piece file from its log and backing file to a loaded
/// [`PieceFile`].
#[derive(Debug)]
pub struct Loader {
    file_path: PathBuf,
    wal_path: PathBuf,
    deps: Arc<dyn Dependencies>,
    state: LoadState,
    attempts: u32,
    replayed: ReplayReport,
}

impl Loader {
    pub fn new(
        file_path: impl Into<PathBuf>,
        wal_path: impl Into<PathBuf>,
        deps: Arc<dyn Dependencies>,
    ) -> Self {
        Self {
            file_path: file_path.into(),
            wal_path: wal_path.into(),
            deps,
            state: LoadState::Unopened,
            attempts: 0,
            replayed: ReplayReport::default(),
        }
    }

    pub fn state(&self) -> LoadState {
        self.state
    }

    /// Number of calls to [`Loader::load`] so far.
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    /// Totals over every replay this loader ran.
    pub fn replayed(&self) -> ReplayReport {
        self.replayed
    }

    /// Run one attempt. On a disk fault the state returns to
    /// [`LoadState::ReplayingLog`] and calling again is safe. Other errors
    /// are structural and leave the state where the failure happened.
    pub fn load(&mut self) -> Result<PieceFile> {
        self.attempts += 1;
        self.state = LoadState::ReplayingLog;
        let (wal, report) = replay_wal(&self.wal_path, self.deps.as_ref())?;
        self.replayed.transactions += report.transactions;
        self.replayed.updates += report.updates;

        self.state = LoadState::ReadingMetadata;
        match PieceFile::load(&self.file_path, wal, Arc::clone(&self.deps)) {
            Ok(file) => {
                self.state = LoadState::Ready;
                debug!(path = %self.file_path.display(), attempts = self.attempts, "piece file ready");
                Ok(file)
            }
            Err(err) => {
                if err.is_disk_fault() {
                    self.state = LoadState::ReplayingLog;
                }
                Err(err)
            }
        }
    }
}

/// Single attempt at replaying the log and loading the file.
pub fn open(
    file_path: impl Into<PathBuf>,
    wal_path: impl Into<PathBuf>,
    deps: Arc<dyn Dependencies>,
) -> Result<PieceFile> {
    Loader::new(file_path, wal_path, deps).load()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deps::{FaultyDisk, ProductionDependencies};
    use crate::error::Error;
    use crate::update::create_update;

    #[test]
    fn replay_applies_pending_then_empties_log() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        let wal_path = dir.path().join("wal");
        {
            let (_, wal) = Wal::open(&wal_path).unwrap();
            wal.new_transaction(vec![create_update(&target, 3, b"abc").unwrap()]).unwrap();
        }
        let (wal, report) = replay_wal(&wal_path, &ProductionDependencies).unwrap();
        assert_eq!(report, ReplayReport { transactions: 1, updates: 1 });
        assert_eq!(std::fs::read(&target).unwrap(), b"\0\0\0abc");
        assert_eq!(wal.incomplete().unwrap(), 0);
        drop(wal);
        let (pending, _) = Wal::open(&wal_path).unwrap();
        assert!(pending.is_empty());
    }

    #[test]
    fn fault_during_replay_keeps_transaction_and_state() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        let wal_path = dir.path().join("wal");
        {
            let (_, wal) = Wal::open(&wal_path).unwrap();
            wal.new_transaction(vec![create_update(&target, 0, b"payload").unwrap()]).unwrap();
        }
        let disk = FaultyDisk::with_seed(1, 3);
        let mut loader = Loader::new(&target, &wal_path, Arc::new(disk.clone()));
        let err = loader.load().unwrap_err();
        assert!(err.is_disk_fault(), "{err:?}");
        assert_eq!(loader.state(), LoadState::ReplayingLog);

        let (pending, wal) = Wal::open(&wal_path).unwrap();
        assert_eq!(pending.len(), 1);
        drop(wal);

        disk.disable();
        let (_, report) = replay_wal(&wal_path, &disk).unwrap();
        assert_eq!(report.transactions, 1);
        assert_eq!(std::fs::read(&target).unwrap(), b"payload");
    }

    #[test]
    fn malformed_logged_record_is_fatal_and_stays_logged() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("t");
        let wal_path = dir.path().join("wal");
        {
            let (_, wal) = Wal::open(&wal_path).unwrap();
            let garbage = crate::wal::Update {
                name: crate::update::UPDATE_INSERT.into(),
                instructions: vec![1, 2, 3],
            };
            wal.new_transaction(vec![create_update(&target, 0, b"ok").unwrap(), garbage])
                .unwrap();
        }
        let mut loader = Loader::new(&target, &wal_path, Arc::new(ProductionDependencies));
        let err = loader.load().unwrap_err();
        assert!(matches!(err, Error::MalformedUpdate(_)), "{err:?}");
        assert!(!err.is_disk_fault());
        assert_eq!(loader.state(), LoadState::ReplayingLog);
        assert!(!target.exists());

        let (pending, _) = Wal::open(&wal_path).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].updates().len(), 2);
    }
}
