use std::collections::HashMap;
use std::path::PathBuf;
use tracing::debug;

use crate::deps::{self, DepFile, Dependencies};
use crate::error::{Error, Result};
use crate::update::{read_delete_update, read_update, UPDATE_DELETE, UPDATE_INSERT};
use crate::wal::Update;

enum Op {
    Write { path: PathBuf, offset: u64, data: Vec<u8> },
    Remove { path: PathBuf },
}

fn decode(update: &Update) -> Result<Op> {
    match update.name.as_str() {
        UPDATE_INSERT => {
            let (path, offset, data) = read_update(update)?;
            Ok(Op::Write { path, offset, data })
        }
        UPDATE_DELETE => Ok(Op::Remove { path: read_delete_update(update)? }),
        other => Err(Error::MalformedUpdate(format!("unknown update {other:?}"))),
    }
}

/// Apply `updates` in order through `deps`, then sync every touched file.
///
/// All records are decoded before the first byte is written, so a
/// malformed record never leaves a half-applied set behind. Re-applying
/// the same records is harmless: writes land on the same bytes and removing
/// an absent file succeeds. I/O errors, including disk faults, are returned
/// unchanged.
pub fn apply_updates(deps: &dyn Dependencies, updates: &[Update]) -> Result<()> {
    let ops = updates.iter().map(decode).collect::<Result<Vec<_>>>()?;
    let mut open: HashMap<PathBuf, Box<dyn DepFile>> = HashMap::new();
    for op in ops {
        match op {
            Op::Write { path, offset, data } => {
                if !open.contains_key(&path) {
                    let file = deps.open(&path).map_err(|e| {
                        if deps::not_found(&e) {
                            Error::MalformedUpdate(format!("cannot resolve {}", path.display()))
                        } else {
                            e
                        }
                    })?;
                    open.insert(path.clone(), file);
                }
                if let Some(file) = open.get_mut(&path) {
                    file.write_at(offset, &data)?;
                }
            }
            Op::Remove { path } => {
                open.remove(&path);
                match deps.remove(&path) {
                    Err(e) if deps::not_found(&e) => {}
                    other => other?,
                }
            }
        }
    }
    for (path, file) in open.iter_mut() {
        file.sync()?;
        debug!(path = %path.display(), "synced");
    }
    Ok(())
}
