//! Write-ahead log used as a durable-append service.
//!
//! The log is an append-only sequence of frames:
//!
//! ```text
//! magic   u32  "PFWL"
//! kind    u8   1 = begin, 2 = complete
//! txn_id  u64
//! len     u32  payload length
//! crc32   u32  over kind, txn_id, len and payload
//! payload      bincode Vec<Update> for begin, empty for complete
//! ```
//!
//! Every frame is synced before the append returns. A frame that fails its
//! checks ends the log: it and everything after it are truncated on open.
//! A transaction whose begin frame was torn was never logged.

use crc32fast::Hasher as Crc32;
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{debug, info, warn};

use crate::encoding;
use crate::error::{Error, Result};

const FRAME_MAGIC: &[u8; 4] = b"PFWL";
const FRAME_HEADER_LEN: usize = 4 + 1 + 8 + 4 + 4;
const KIND_BEGIN: u8 = 1;
const KIND_COMPLETE: u8 = 2;

/// A named, opaque instruction. The log never looks inside `instructions`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Update {
    pub name: String,
    pub instructions: Vec<u8>,
}

/// A durably logged, ordered group of updates.
#[derive(Clone, Debug)]
pub struct Transaction {
    id: u64,
    updates: Vec<Update>,
}

impl Transaction {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn updates(&self) -> &[Update] {
        &self.updates
    }
}

#[derive(Debug)]
struct WalInner {
    file: File,
    next_id: u64,
    outstanding: BTreeSet<u64>,
}

#[derive(Debug)]
pub struct Wal {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl Wal {
    /// Open (or create) the log at `path` and take an exclusive lock on it.
    /// Returns the transactions that were logged but never completed, in
    /// log order. They stay outstanding until `signal_applied` is called.
    pub fn open(path: impl Into<PathBuf>) -> Result<(Vec<Transaction>, Arc<Wal>)> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let mut file = OpenOptions::new().create(true).read(true).append(true).open(&path)?;
        file.try_lock_exclusive()
            .map_err(|e| Error::Wal(format!("{} is locked by another owner: {e}", path.display())))?;

        let mut raw = Vec::new();
        file.read_to_end(&mut raw)?;
        let scan = scan_frames(&raw)?;
        if scan.valid_len < raw.len() as u64 {
            warn!(
                path = %path.display(),
                valid = scan.valid_len,
                total = raw.len(),
                "truncating torn write-ahead log tail"
            );
            file.set_len(scan.valid_len)?;
            file.sync_all()?;
        }
        if scan.pending.is_empty() && scan.valid_len > 0 {
            file.set_len(0)?;
            file.sync_all()?;
        }

        let outstanding = scan.pending.iter().map(|t| t.id).collect();
        info!(path = %path.display(), incomplete = scan.pending.len(), "opened write-ahead log");
        let wal = Wal {
            path,
            inner: Mutex::new(WalInner { file, next_id: scan.max_id + 1, outstanding }),
        };
        Ok((scan.pending, Arc::new(wal)))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Durably log `updates` as one transaction. Returns once the begin
    /// frame is on stable storage.
    pub fn new_transaction(&self, updates: Vec<Update>) -> Result<Transaction> {
        if updates.is_empty() {
            return Err(Error::Wal("transaction has no updates".into()));
        }
        let payload = encoding::encode(&updates, "transaction")?;
        let mut inner = self.lock()?;
        let id = inner.next_id;
        append_frame(&mut inner.file, KIND_BEGIN, id, &payload)?;
        inner.next_id += 1;
        inner.outstanding.insert(id);
        debug!(txn = id, updates = updates.len(), "logged transaction");
        Ok(Transaction { id, updates })
    }

    /// Record that every update of `txn` has been applied. Once nothing is
    /// outstanding the log is emptied.
    pub fn signal_applied(&self, txn: &Transaction) -> Result<()> {
        let mut inner = self.lock()?;
        if !inner.outstanding.contains(&txn.id) {
            return Err(Error::Wal(format!("transaction {} is not outstanding", txn.id)));
        }
        append_frame(&mut inner.file, KIND_COMPLETE, txn.id, &[])?;
        inner.outstanding.remove(&txn.id);
        debug!(txn = txn.id, "transaction complete");
        if inner.outstanding.is_empty() {
            inner.file.set_len(0)?;
            inner.file.sync_all()?;
        }
        Ok(())
    }

    /// Number of logged transactions not yet signalled as applied.
    pub fn incomplete(&self) -> Result<usize> {
        Ok(self.lock()?.outstanding.len())
    }

    fn lock(&self) -> Result<MutexGuard<'_, WalInner>> {
        self.inner.lock().map_err(|_| Error::Wal("log mutex poisoned".into()))
    }
}

fn frame_crc(kind: u8, id: u64, len: u32, payload: &[u8]) -> u32 {
    let mut h = Crc32::new();
    h.update(&[kind]);
    h.update(&id.to_le_bytes());
    h.update(&len.to_le_bytes());
    h.update(payload);
    h.finalize()
}

fn append_frame(file: &mut File, kind: u8, id: u64, payload: &[u8]) -> Result<()> {
    let len = u32::try_from(payload.len())
        .map_err(|_| Error::Wal(format!("payload of {} bytes too large", payload.len())))?;
    let mut buf = Vec::with_capacity(FRAME_HEADER_LEN + payload.len());
    buf.extend_from_slice(FRAME_MAGIC);
    buf.push(kind);
    buf.extend_from_slice(&id.to_le_bytes());
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&frame_crc(kind, id, len, payload).to_le_bytes());
    buf.extend_from_slice(payload);
    file.write_all(&buf)?;
    file.sync_data()?;
    Ok(())
}

struct Scan {
    pending: Vec<Transaction>,
    valid_len: u64,
    max_id: u64,
}

fn scan_frames(raw: &[u8]) -> Result<Scan> {
    let mut pending: Vec<Transaction> = Vec::new();
    let mut max_id = 0u64;
    let mut pos = 0usize;
    while raw.len() - pos >= FRAME_HEADER_LEN {
        let hdr = &raw[pos..pos + FRAME_HEADER_LEN];
        if &hdr[0..4] != FRAME_MAGIC {
            break;
        }
        let kind = hdr[4];
        let mut id8 = [0u8; 8];
        id8.copy_from_slice(&hdr[5..13]);
        let mut len4 = [0u8; 4];
        len4.copy_from_slice(&hdr[13..17]);
        let mut crc4 = [0u8; 4];
        crc4.copy_from_slice(&hdr[17..21]);
        let id = u64::from_le_bytes(id8);
        let len = u32::from_le_bytes(len4);
        let start = pos + FRAME_HEADER_LEN;
        let Some(payload) = raw.get(start..start + len as usize) else {
            break;
        };
        if frame_crc(kind, id, len, payload) != u32::from_le_bytes(crc4) {
            break;
        }
        match kind {
            KIND_BEGIN => {
                // The checksum matched, so a decode failure is real corruption.
                let updates: Vec<Update> = encoding::decode_exact(payload, "transaction")?;
                pending.push(Transaction { id, updates });
            }
            KIND_COMPLETE => pending.retain(|t| t.id != id),
            other => return Err(Error::Wal(format!("unknown frame kind {other} at offset {pos}"))),
        }
        max_id = max_id.max(id);
        pos = start + len as usize;
    }
    Ok(Scan { pending, valid_len: pos as u64, max_id })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn upd(name: &str, bytes: &[u8]) -> Update {
        Update { name: name.into(), instructions: bytes.to_vec() }
    }

    #[test]
    fn incomplete_transactions_survive_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.wal");
        {
            let (pending, wal) = Wal::open(&path).unwrap();
            assert!(pending.is_empty());
            let a = wal.new_transaction(vec![upd("a", b"1")]).unwrap();
            let b = wal.new_transaction(vec![upd("b", b"2")]).unwrap();
            let c = wal.new_transaction(vec![upd("c", b"3"), upd("c", b"4")]).unwrap();
            wal.signal_applied(&b).unwrap();
            assert_eq!(wal.incomplete().unwrap(), 2);
            let _ = (a, c);
        }
        let (pending, wal) = Wal::open(&path).unwrap();
        let names: Vec<_> = pending.iter().map(|t| t.updates()[0].name.clone()).collect();
        assert_eq!(names, ["a", "c"]);
        assert_eq!(pending[1].updates().len(), 2);
        for t in &pending {
            wal.signal_applied(t).unwrap();
        }
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn torn_tail_is_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.wal");
        {
            let (_, wal) = Wal::open(&path).unwrap();
            wal.new_transaction(vec![upd("keep", b"x")]).unwrap();
            wal.new_transaction(vec![upd("torn", &[7u8; 64])]).unwrap();
        }
        let len = fs::metadata(&path).unwrap().len();
        OpenOptions::new().write(true).open(&path).unwrap().set_len(len - 10).unwrap();

        let (pending, wal) = Wal::open(&path).unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].updates()[0].name, "keep");
        // New ids continue after the surviving ones.
        let next = wal.new_transaction(vec![upd("next", b"y")]).unwrap();
        assert!(next.id() > pending[0].id());
    }

    #[test]
    fn second_owner_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log.wal");
        let (_, _wal) = Wal::open(&path).unwrap();
        assert!(matches!(Wal::open(&path), Err(Error::Wal(_))));
    }

    #[test]
    fn empty_transaction_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let (_, wal) = Wal::open(dir.path().join("log.wal")).unwrap();
        assert!(wal.new_transaction(Vec::new()).is_err());
    }
}
