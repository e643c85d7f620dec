use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum Error {
    /// Transient device failure. Retrying the whole operation after the
    /// condition clears is safe because replayed updates are idempotent.
    #[error("disk fault during {op} on {}", path.display())]
    DiskFault { op: &'static str, path: PathBuf },

    #[error("version mismatch: found {found}, expected {expected}")]
    VersionMismatch { found: u32, expected: u32 },

    #[error("truncated {what}")]
    Truncated { what: &'static str },

    #[error("corrupt {what}: {reason}")]
    Corrupt { what: &'static str, reason: String },

    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    #[error("field '{field}' differs")]
    FieldMismatch { field: &'static str },

    #[error("layout mismatch: {field} is {stored} on disk but computes to {computed}")]
    LayoutMismatch { field: &'static str, stored: u64, computed: u64 },

    #[error("{what} index {index} out of bounds (len {len})")]
    OutOfBounds { what: &'static str, index: u64, len: u64 },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("a logged transaction was not applied; reopen the file to recover")]
    NeedsRecovery,

    #[error("file has been deleted")]
    Deleted,

    #[error("erasure coding: {0}")]
    Erasure(String),

    #[error("write-ahead log: {0}")]
    Wal(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// True for the retryable class; everything else is fatal to the
    /// current open/apply attempt.
    pub fn is_disk_fault(&self) -> bool {
        matches!(self, Error::DiskFault { .. })
    }

    pub(crate) fn disk_fault(op: &'static str, path: impl Into<PathBuf>) -> Self {
        Error::DiskFault { op, path: path.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_fault_is_distinguished() {
        let fault = Error::disk_fault("write", "/tmp/x");
        assert!(fault.is_disk_fault());
        assert!(fault.to_string().contains("/tmp/x"));
        assert!(!Error::Truncated { what: "metadata" }.is_disk_fault());
        assert!(!Error::Io(io::Error::new(io::ErrorKind::Other, "boom")).is_disk_fault());
    }
}
