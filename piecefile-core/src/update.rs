//! Update records: replayable "write these bytes at this offset of this
//! named file" and "remove this named file" instructions.
//!
//! Insert wire format: length-prefixed path, i64 offset, length-prefixed
//! payload. Paths must be absolute: a record logged before a crash replays
//! against the same file whatever the working directory is at recovery.

use std::path::{Path, PathBuf};

use crate::encoding;
use crate::error::{Error, Result};
use crate::wal::Update;

pub const UPDATE_INSERT: &str = "PieceFileInsert";
pub const UPDATE_DELETE: &str = "PieceFileDelete";

fn path_str(path: &Path) -> Result<&str> {
    let s = path
        .to_str()
        .ok_or_else(|| Error::MalformedUpdate(format!("non UTF-8 path {}", path.display())))?;
    if s.is_empty() {
        return Err(Error::MalformedUpdate("empty path".into()));
    }
    if !path.is_absolute() {
        return Err(Error::MalformedUpdate(format!("relative path {s}")));
    }
    Ok(s)
}

/// Build an insert record. `data` is copied.
pub fn create_update(path: &Path, offset: u64, data: &[u8]) -> Result<Update> {
    let offset = i64::try_from(offset)
        .map_err(|_| Error::MalformedUpdate(format!("offset {offset} out of range")))?;
    let instructions = encoding::encode(&(path_str(path)?, offset, data), "update")?;
    Ok(Update { name: UPDATE_INSERT.to_string(), instructions })
}

/// Inverse of [`create_update`].
pub fn read_update(update: &Update) -> Result<(PathBuf, u64, Vec<u8>)> {
    if update.name != UPDATE_INSERT {
        return Err(Error::MalformedUpdate(format!("expected insert, got {:?}", update.name)));
    }
    let (path, offset, data): (String, i64, Vec<u8>) =
        encoding::decode_exact(&update.instructions, "update")
            .map_err(|e| Error::MalformedUpdate(e.to_string()))?;
    path_str(Path::new(&path))?;
    let offset = u64::try_from(offset)
        .map_err(|_| Error::MalformedUpdate(format!("negative offset {offset}")))?;
    Ok((PathBuf::from(path), offset, data))
}

pub fn create_delete_update(path: &Path) -> Result<Update> {
    let instructions = encoding::encode(path_str(path)?, "update")?;
    Ok(Update { name: UPDATE_DELETE.to_string(), instructions })
}

pub fn read_delete_update(update: &Update) -> Result<PathBuf> {
    if update.name != UPDATE_DELETE {
        return Err(Error::MalformedUpdate(format!("expected delete, got {:?}", update.name)));
    }
    let path: String = encoding::decode_exact(&update.instructions, "update")
        .map_err(|e| Error::MalformedUpdate(e.to_string()))?;
    path_str(Path::new(&path))?;
    Ok(PathBuf::from(path))
}
