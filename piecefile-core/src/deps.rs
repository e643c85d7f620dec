//! I/O dependency seam.
//!
//! The apply engine and the loader touch the disk only through
//! [`Dependencies`]. Production uses [`ProductionDependencies`]; tests swap
//! in [`FaultyDisk`], which starts failing after a configurable number of
//! mutating operations.

use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use crate::error::{Error, Result};

/// An open file handle.
pub trait DepFile: Send + fmt::Debug {
    /// Write all of `data` at `offset`. Writing past the end extends the
    /// file; the gap reads back as zeros.
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()>;

    /// Fill `buf` from `offset`. Short files are an error.
    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()>;

    fn size(&mut self) -> Result<u64>;

    fn sync(&mut self) -> Result<()>;
}

pub trait Dependencies: Send + Sync + fmt::Debug {
    /// Open `path` for reading and writing, creating it if missing.
    fn open(&self, path: &Path) -> Result<Box<dyn DepFile>>;

    /// Open an existing file for reading.
    fn open_read(&self, path: &Path) -> Result<Box<dyn DepFile>>;

    fn remove(&self, path: &Path) -> Result<()>;

    fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)?;
        Ok(())
    }
}

#[derive(Debug)]
struct OsFile {
    file: File,
}

impl DepFile for OsFile {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(data)?;
        Ok(())
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buf)?;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn sync(&mut self) -> Result<()> {
        self.file.sync_all()?;
        Ok(())
    }
}

/// Direct file-system I/O.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProductionDependencies;

impl Dependencies for ProductionDependencies {
    fn open(&self, path: &Path) -> Result<Box<dyn DepFile>> {
        let file =
            OpenOptions::new().create(true).read(true).write(true).truncate(false).open(path)?;
        Ok(Box::new(OsFile { file }))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn DepFile>> {
        Ok(Box::new(OsFile { file: File::open(path)? }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        fs::remove_file(path)?;
        Ok(())
    }
}

#[derive(Debug)]
struct FaultState {
    enabled: bool,
    write_limit: u64,
    remaining: u64,
    failed: bool,
    faults: u64,
    rng: fastrand::Rng,
}

impl FaultState {
    /// Count one mutating operation; true once the limit has been reached.
    fn try_fail(&mut self) -> bool {
        if !self.enabled {
            return false;
        }
        if !self.failed {
            self.remaining = self.remaining.saturating_sub(1);
            if self.remaining == 0 {
                self.failed = true;
            }
        }
        if self.failed {
            self.faults += 1;
        }
        self.failed
    }

    fn is_failed(&self) -> bool {
        self.enabled && self.failed
    }
}

/// Fault-injecting substitute for [`ProductionDependencies`].
///
/// Writes, syncs and removes are counted. The operation that exhausts the
/// limit and every one after it fails with [`Error::DiskFault`] until
/// [`FaultyDisk::reset`]. A failing write may persist a random prefix of
/// its payload, like a torn sector write. While failed, opens and reads
/// fail too. Clones share state.
#[derive(Debug, Clone)]
pub struct FaultyDisk {
    state: Arc<Mutex<FaultState>>,
}

impl FaultyDisk {
    pub fn new(write_limit: u64) -> Self {
        Self::with_seed(write_limit, fastrand::u64(..))
    }

    pub fn with_seed(write_limit: u64, seed: u64) -> Self {
        let state = FaultState {
            enabled: true,
            write_limit,
            remaining: write_limit,
            failed: false,
            faults: 0,
            rng: fastrand::Rng::with_seed(seed),
        };
        Self { state: Arc::new(Mutex::new(state)) }
    }

    /// Stop injecting faults without forgetting the counter.
    pub fn disable(&self) {
        self.lock().enabled = false;
    }

    pub fn enable(&self) {
        self.lock().enabled = true;
    }

    /// Repair the disk: clear the failure and restart the countdown.
    pub fn reset(&self) {
        let mut s = self.lock();
        s.failed = false;
        s.remaining = s.write_limit;
    }

    pub fn is_failed(&self) -> bool {
        self.lock().is_failed()
    }

    /// Number of operations that were failed so far.
    pub fn faults(&self) -> u64 {
        self.lock().faults
    }

    fn lock(&self) -> MutexGuard<'_, FaultState> {
        // A panic while holding this lock can only come from a test thread;
        // the counters stay usable.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Dependencies for FaultyDisk {
    fn open(&self, path: &Path) -> Result<Box<dyn DepFile>> {
        if self.is_failed() {
            return Err(Error::disk_fault("open", path));
        }
        let inner = ProductionDependencies.open(path)?;
        Ok(Box::new(FaultyFile { inner, path: path.to_path_buf(), disk: self.clone() }))
    }

    fn open_read(&self, path: &Path) -> Result<Box<dyn DepFile>> {
        if self.is_failed() {
            return Err(Error::disk_fault("open", path));
        }
        let inner = ProductionDependencies.open_read(path)?;
        Ok(Box::new(FaultyFile { inner, path: path.to_path_buf(), disk: self.clone() }))
    }

    fn remove(&self, path: &Path) -> Result<()> {
        if self.lock().try_fail() {
            return Err(Error::disk_fault("remove", path));
        }
        ProductionDependencies.remove(path)
    }
}

#[derive(Debug)]
struct FaultyFile {
    inner: Box<dyn DepFile>,
    path: PathBuf,
    disk: FaultyDisk,
}

impl DepFile for FaultyFile {
    fn write_at(&mut self, offset: u64, data: &[u8]) -> Result<()> {
        let torn = {
            let mut s = self.disk.lock();
            if s.try_fail() {
                Some(s.rng.usize(..=data.len()))
            } else {
                None
            }
        };
        match torn {
            None => self.inner.write_at(offset, data),
            Some(n) => {
                if n > 0 {
                    // Best effort; the caller sees the fault either way.
                    let _ = self.inner.write_at(offset, &data[..n]);
                }
                Err(Error::disk_fault("write", &self.path))
            }
        }
    }

    fn read_at(&mut self, offset: u64, buf: &mut [u8]) -> Result<()> {
        if self.disk.is_failed() {
            return Err(Error::disk_fault("read", &self.path));
        }
        self.inner.read_at(offset, buf)
    }

    fn size(&mut self) -> Result<u64> {
        self.inner.size()
    }

    fn sync(&mut self) -> Result<()> {
        if self.disk.lock().try_fail() {
            return Err(Error::disk_fault("sync", &self.path));
        }
        self.inner.sync()
    }
}

/// True for a missing-file I/O error.
pub(crate) fn not_found(err: &Error) -> bool {
    matches!(err, Error::Io(e) if e.kind() == io::ErrorKind::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn production_write_past_end_zero_fills() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let mut f = ProductionDependencies.open(&path).unwrap();
        f.write_at(10, b"xy").unwrap();
        f.sync().unwrap();
        assert_eq!(f.size().unwrap(), 12);
        let mut buf = [0xFFu8; 12];
        f.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf[..10], &[0u8; 10]);
        assert_eq!(&buf[10..], b"xy");
    }

    #[test]
    fn faulty_disk_fails_from_nth_operation_until_reset() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("f");
        let disk = FaultyDisk::with_seed(3, 1);
        let mut f = disk.open(&path).unwrap();
        f.write_at(0, b"a").unwrap();
        f.sync().unwrap();
        assert!(f.write_at(1, b"b").unwrap_err().is_disk_fault());
        assert!(f.sync().unwrap_err().is_disk_fault());
        assert!(disk.open(&path).unwrap_err().is_disk_fault());
        assert_eq!(disk.faults(), 2);

        disk.reset();
        assert!(!disk.is_failed());
        let mut f = disk.open(&path).unwrap();
        f.write_at(1, b"b").unwrap();
        let mut buf = [0u8; 2];
        f.read_at(0, &mut buf).unwrap();
        assert_eq!(&buf, b"ab");
    }

    #[test]
    fn disabled_disk_never_fails() {
        let dir = tempfile::tempdir().unwrap();
        let disk = FaultyDisk::with_seed(1, 7);
        disk.disable();
        let mut f = disk.open(&dir.path().join("f")).unwrap();
        for i in 0..10 {
            f.write_at(i, b"z").unwrap();
        }
        disk.enable();
        assert!(f.write_at(0, b"z").unwrap_err().is_disk_fault());
    }
}
