//! Shared bincode configuration for every on-disk structure.
//!
//! Integers are fixed-width little-endian; strings, byte vectors and
//! sequences carry a u64 length prefix. Changing any of this changes the
//! file format.

use bincode::Options;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::io::{self, Read};

use crate::error::{Error, Result};

fn options() -> impl Options {
    bincode::DefaultOptions::new().with_fixint_encoding().with_little_endian()
}

pub(crate) fn encode<T: Serialize + ?Sized>(value: &T, what: &'static str) -> Result<Vec<u8>> {
    options().serialize(value).map_err(|e| map_err(e, what))
}

/// Decode a value that must occupy all of `data`.
pub(crate) fn decode_exact<T: DeserializeOwned>(data: &[u8], what: &'static str) -> Result<T> {
    options().deserialize(data).map_err(|e| map_err(e, what))
}

/// Decode one value from the front of `reader`; trailing input is left unread.
pub(crate) fn decode_from<R: Read, T: DeserializeOwned>(reader: R, what: &'static str) -> Result<T> {
    options().allow_trailing_bytes().deserialize_from(reader).map_err(|e| map_err(e, what))
}

pub(crate) fn map_err(err: bincode::Error, what: &'static str) -> Error {
    match *err {
        bincode::ErrorKind::Io(ref e) if e.kind() == io::ErrorKind::UnexpectedEof => {
            Error::Truncated { what }
        }
        other => Error::Corrupt { what, reason: other.to_string() },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strings_are_u64_length_prefixed() {
        let raw = encode("abc", "test").unwrap();
        assert_eq!(raw, [3, 0, 0, 0, 0, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn short_input_is_truncated() {
        let raw = encode(&(7u64, 9u64), "test").unwrap();
        let err = decode_exact::<(u64, u64)>(&raw[..12], "pair").unwrap_err();
        assert!(matches!(err, Error::Truncated { what: "pair" }));
    }

    #[test]
    fn trailing_bytes_rejected_by_exact_decode() {
        let mut raw = encode(&1u32, "test").unwrap();
        raw.push(0);
        assert!(decode_exact::<u32>(&raw, "u32").is_err());
        let v: u32 = decode_from(&raw[..], "u32").unwrap();
        assert_eq!(v, 1);
    }
}
