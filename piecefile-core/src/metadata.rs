use chrono::serde::ts_nanoseconds;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::encoding;
use crate::erasure::ErasureCoder;
use crate::error::{Error, Result};

/// Current on-disk metadata version. Anything else is rejected before the
/// body is interpreted.
pub const METADATA_VERSION: u32 = 1;

/// The public-key table starts on the first page boundary after the metadata.
pub const METADATA_PAGE_SIZE: u64 = 4096;

/// Size of the opaque master and sharing key blobs.
pub const KEY_SIZE: usize = 32;

/// version (u32 LE) + body length (u32 LE)
pub const METADATA_PREFIX_LEN: usize = 8;

/// Erasure-coding parameters of a file. Only the piece counts are stored;
/// the coder itself is an external capability.
#[derive(Serialize, Deserialize, Clone, Copy, Debug, PartialEq, Eq)]
pub struct ErasureConfig {
    pub num_pieces: u32,
    pub min_pieces: u32,
}

impl ErasureConfig {
    /// An overflowing sum saturates and is then refused by [`Self::validate`].
    pub fn new(data_pieces: u32, parity_pieces: u32) -> Self {
        Self { num_pieces: data_pieces.saturating_add(parity_pieces), min_pieces: data_pieces }
    }

    pub fn validate(&self) -> Result<()> {
        // galois_8 Reed-Solomon caps the total shard count at 256
        if self.min_pieces == 0 || self.num_pieces < self.min_pieces || self.num_pieces > 256 {
            return Err(Error::Config(format!(
                "erasure code needs {} of {} pieces",
                self.min_pieces, self.num_pieces
            )));
        }
        Ok(())
    }
}

impl ErasureCoder for ErasureConfig {
    fn num_pieces(&self) -> usize {
        self.num_pieces as usize
    }

    fn min_pieces(&self) -> usize {
        self.min_pieces as usize
    }
}

/// Fixed header of a piece file. Every field is fixed width except the two
/// paths, so the encoded length only changes when a path does.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct Metadata {
    /// Written as the leading prefix, outside the bincode body.
    #[serde(skip)]
    pub version: u32,
    pub file_size: u64,
    pub piece_size: u64,
    pub local_path: String,
    pub remote_path: String,
    pub master_key: [u8; KEY_SIZE],
    pub sharing_key: [u8; KEY_SIZE],
    #[serde(with = "ts_nanoseconds")]
    pub mod_time: DateTime<Utc>,
    #[serde(with = "ts_nanoseconds")]
    pub change_time: DateTime<Utc>,
    #[serde(with = "ts_nanoseconds")]
    pub access_time: DateTime<Utc>,
    #[serde(with = "ts_nanoseconds")]
    pub create_time: DateTime<Utc>,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub chunk_metadata_size: u64,
    pub chunk_offset: u64,
    pub pub_key_table_offset: u64,
    pub erasure: ErasureConfig,
}

impl Metadata {
    /// Bytes of source data covered by one chunk. Saturates; files that
    /// passed [`Self::chunk_table_len`] never reach the cap.
    pub fn chunk_size(&self) -> u64 {
        self.piece_size.saturating_mul(u64::from(self.erasure.min_pieces))
    }

    /// Byte length of the chunk table this geometry implies. Fails with
    /// `Config` on a zero piece size or when chunk size or table length
    /// overflow.
    pub fn chunk_table_len(&self) -> Result<u64> {
        if self.piece_size == 0 {
            return Err(Error::Config("piece size must be positive".into()));
        }
        if self.piece_size.checked_mul(u64::from(self.erasure.min_pieces)).is_none() {
            return Err(Error::Config(format!(
                "chunk size overflows: {} pieces of {} bytes",
                self.erasure.min_pieces, self.piece_size
            )));
        }
        self.num_chunks()
            .checked_mul(self.chunk_metadata_size)
            .filter(|len| usize::try_from(*len).is_ok())
            .ok_or_else(|| {
                Error::Config(format!("{} chunks do not fit in a chunk table", self.num_chunks()))
            })
    }

    /// A file always has at least one chunk, even when empty.
    pub fn num_chunks(&self) -> u64 {
        let cs = self.chunk_size();
        if cs == 0 {
            return 1;
        }
        self.file_size.div_ceil(cs).max(1)
    }

    /// Compare every persisted field, naming the first one that differs.
    pub fn assert_equal(&self, other: &Metadata) -> Result<()> {
        macro_rules! check {
            ($($field:ident),+ $(,)?) => {
                $(
                    if self.$field != other.$field {
                        return Err(Error::FieldMismatch { field: stringify!($field) });
                    }
                )+
            };
        }
        check!(
            version,
            file_size,
            piece_size,
            local_path,
            remote_path,
            master_key,
            sharing_key,
            mod_time,
            change_time,
            access_time,
            create_time,
            mode,
            uid,
            gid,
            chunk_metadata_size,
            chunk_offset,
            pub_key_table_offset,
            erasure,
        );
        Ok(())
    }
}

/// Where the public-key table must start for metadata of `encoded_len` bytes.
pub fn pub_key_table_offset_for(encoded_len: u64) -> u64 {
    encoded_len.div_ceil(METADATA_PAGE_SIZE).max(1) * METADATA_PAGE_SIZE
}

pub fn marshal_metadata(md: &Metadata) -> Result<Vec<u8>> {
    let body = encoding::encode(md, "metadata")?;
    let body_len = u32::try_from(body.len()).map_err(|_| Error::Corrupt {
        what: "metadata",
        reason: format!("body of {} bytes", body.len()),
    })?;
    let mut buf = Vec::with_capacity(METADATA_PREFIX_LEN + body.len());
    buf.extend_from_slice(&md.version.to_le_bytes());
    buf.extend_from_slice(&body_len.to_le_bytes());
    buf.extend_from_slice(&body);
    Ok(buf)
}

/// Check the version prefix and return the full encoded length
/// (prefix + body). Needs at least `METADATA_PREFIX_LEN` bytes.
pub fn encoded_metadata_len(prefix: &[u8]) -> Result<usize> {
    if prefix.len() < 4 {
        return Err(Error::Truncated { what: "metadata version" });
    }
    let mut v4 = [0u8; 4];
    v4.copy_from_slice(&prefix[0..4]);
    let version = u32::from_le_bytes(v4);
    if version != METADATA_VERSION {
        return Err(Error::VersionMismatch { found: version, expected: METADATA_VERSION });
    }
    if prefix.len() < METADATA_PREFIX_LEN {
        return Err(Error::Truncated { what: "metadata length" });
    }
    let mut len4 = [0u8; 4];
    len4.copy_from_slice(&prefix[4..8]);
    Ok(METADATA_PREFIX_LEN + u32::from_le_bytes(len4) as usize)
}

pub fn unmarshal_metadata(data: &[u8]) -> Result<Metadata> {
    let total = encoded_metadata_len(data)?;
    let body = data.get(METADATA_PREFIX_LEN..total).ok_or(Error::Truncated { what: "metadata" })?;
    let mut md: Metadata = encoding::decode_exact(body, "metadata")?;
    md.version = METADATA_VERSION;
    Ok(md)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn sample() -> Metadata {
        let t = Utc.timestamp_opt(1_700_000_000, 123_456_789).unwrap();
        Metadata {
            version: METADATA_VERSION,
            file_size: 10_000,
            piece_size: 1024,
            local_path: "/data/movie.mkv".into(),
            remote_path: "videos/movie.mkv".into(),
            master_key: [7u8; KEY_SIZE],
            sharing_key: [9u8; KEY_SIZE],
            mod_time: t,
            change_time: t,
            access_time: t,
            create_time: t,
            mode: 0o644,
            uid: 1000,
            gid: 100,
            chunk_metadata_size: 4 + 41 * 3,
            chunk_offset: 4096 + 8,
            pub_key_table_offset: 4096,
            erasure: ErasureConfig::new(2, 1),
        }
    }

    #[test]
    fn oversized_geometry_is_a_config_error() {
        let wide = ErasureConfig::new(u32::MAX, 1);
        assert!(matches!(wide.validate(), Err(Error::Config(_))));

        let mut md = sample();
        md.piece_size = u64::MAX / 2;
        md.erasure = ErasureConfig::new(4, 1);
        assert_eq!(md.chunk_size(), u64::MAX);
        assert!(matches!(md.chunk_table_len(), Err(Error::Config(_))));

        md.piece_size = 0;
        assert_eq!(md.num_chunks(), 1);
        assert!(matches!(md.chunk_table_len(), Err(Error::Config(_))));

        let mut md = sample();
        md.piece_size = 1;
        md.file_size = u64::MAX;
        assert!(matches!(md.chunk_table_len(), Err(Error::Config(_))));

        assert_eq!(sample().chunk_table_len().unwrap(), 5 * (4 + 41 * 3));
    }

    #[test]
    fn version_checked_before_body() {
        let mut raw = marshal_metadata(&sample()).unwrap();
        raw[0] = 2;
        // Damage the body as well; the version error must win.
        raw.truncate(12);
        match unmarshal_metadata(&raw) {
            Err(Error::VersionMismatch { found: 2, expected: METADATA_VERSION }) => {}
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn short_body_is_truncated() {
        let raw = marshal_metadata(&sample()).unwrap();
        let err = unmarshal_metadata(&raw[..raw.len() - 1]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }), "{err:?}");
    }

    #[test]
    fn assert_equal_names_diverging_field() {
        let a = sample();
        let mut b = a.clone();
        assert!(a.assert_equal(&b).is_ok());
        b.gid = 5;
        assert!(matches!(a.assert_equal(&b), Err(Error::FieldMismatch { field: "gid" })));
        let mut c = a.clone();
        c.access_time = Utc.timestamp_opt(1, 0).unwrap();
        assert!(matches!(a.assert_equal(&c), Err(Error::FieldMismatch { field: "access_time" })));
    }

    #[test]
    fn chunk_math() {
        let md = sample();
        assert_eq!(md.chunk_size(), 2048);
        assert_eq!(md.num_chunks(), 5);
        let empty = Metadata { file_size: 0, ..md };
        assert_eq!(empty.num_chunks(), 1);
    }

    #[test]
    fn table_offset_is_page_aligned() {
        assert_eq!(pub_key_table_offset_for(0), 4096);
        assert_eq!(pub_key_table_offset_for(300), 4096);
        assert_eq!(pub_key_table_offset_for(4096), 4096);
        assert_eq!(pub_key_table_offset_for(4097), 8192);
    }
}
