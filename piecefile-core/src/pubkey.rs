use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;

use crate::encoding;
use crate::error::{Error, Result};

pub const SPECIFIER_SIZE: usize = 16;

/// Fixed-size algorithm tag, zero padded.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Specifier(pub [u8; SPECIFIER_SIZE]);

impl Specifier {
    pub const ED25519: Specifier = Specifier::from_name("ed25519");

    /// Names longer than the tag are cut off.
    pub const fn from_name(name: &str) -> Self {
        let bytes = name.as_bytes();
        let mut out = [0u8; SPECIFIER_SIZE];
        let mut i = 0;
        while i < bytes.len() && i < SPECIFIER_SIZE {
            out[i] = bytes[i];
            i += 1;
        }
        Specifier(out)
    }
}

/// The name for tags built by [`Specifier::from_name`], hex otherwise.
impl fmt::Display for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let end = self.0.iter().position(|&b| b == 0).unwrap_or(SPECIFIER_SIZE);
        let named = end > 0 && self.0[end..].iter().all(|&b| b == 0);
        match std::str::from_utf8(&self.0[..end]) {
            Ok(s) if named && s.chars().all(|c| c.is_ascii_graphic()) => f.write_str(s),
            _ => self.0.iter().try_for_each(|b| write!(f, "{b:02x}")),
        }
    }
}

impl fmt::Debug for Specifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Specifier({self})")
    }
}

/// Public key of a remote host holding pieces.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq, Hash)]
pub struct HostPublicKey {
    pub algorithm: Specifier,
    pub key: Vec<u8>,
}

impl HostPublicKey {
    pub fn new(algorithm: Specifier, key: impl Into<Vec<u8>>) -> Self {
        Self { algorithm, key: key.into() }
    }
}

/// Append-only arena of host keys. Pieces refer to entries by position, so
/// an entry is never moved or removed once it has an index.
#[derive(Serialize, Deserialize, Clone, Debug, Default, PartialEq, Eq)]
#[serde(transparent)]
pub struct PublicKeyTable {
    keys: Vec<HostPublicKey>,
}

impl PublicKeyTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.keys.len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.is_empty()
    }

    pub fn get(&self, index: u32) -> Option<&HostPublicKey> {
        self.keys.get(index as usize)
    }

    pub fn iter(&self) -> impl Iterator<Item = &HostPublicKey> {
        self.keys.iter()
    }

    pub fn index_of(&self, key: &HostPublicKey) -> Option<u32> {
        self.keys.iter().position(|k| k == key).map(|i| i as u32)
    }

    /// Return the index of `key`, appending it first if it is new. The bool
    /// reports whether the table grew.
    pub fn insert(&mut self, key: HostPublicKey) -> Result<(u32, bool)> {
        if let Some(i) = self.index_of(&key) {
            return Ok((i, false));
        }
        let index = u32::try_from(self.keys.len()).map_err(|_| Error::OutOfBounds {
            what: "host key",
            index: self.keys.len() as u64,
            len: u64::from(u32::MAX),
        })?;
        self.keys.push(key);
        Ok((index, true))
    }

    pub fn check_index(&self, index: u32) -> Result<()> {
        if (index as usize) < self.keys.len() {
            Ok(())
        } else {
            Err(Error::OutOfBounds {
                what: "host key",
                index: u64::from(index),
                len: self.keys.len() as u64,
            })
        }
    }
}

impl FromIterator<HostPublicKey> for PublicKeyTable {
    fn from_iter<I: IntoIterator<Item = HostPublicKey>>(iter: I) -> Self {
        Self { keys: iter.into_iter().collect() }
    }
}

/// Entry count (u64), then per entry the 16-byte specifier and the
/// length-prefixed key bytes.
pub fn marshal_pub_key_table(table: &PublicKeyTable) -> Result<Vec<u8>> {
    encoding::encode(table, "public key table")
}

/// Decode a table that occupies exactly `data`.
pub fn unmarshal_pub_key_table(data: &[u8]) -> Result<PublicKeyTable> {
    encoding::decode_exact(data, "public key table")
}

/// Decode a table from the front of `data`, returning it together with the
/// number of bytes it occupied.
pub(crate) fn unmarshal_pub_key_table_prefix(data: &[u8]) -> Result<(PublicKeyTable, u64)> {
    let mut cursor = Cursor::new(data);
    let table = encoding::decode_from(&mut cursor, "public key table")?;
    Ok((table, cursor.position()))
}
