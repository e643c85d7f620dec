use chrono::Utc;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::apply;
use crate::chunk::{chunk_metadata_size, marshal_chunk, unmarshal_chunk, Chunk, Hash, Piece};
use crate::deps::{DepFile, Dependencies};
use crate::error::{Error, Result};
use crate::metadata::{
    encoded_metadata_len, marshal_metadata, pub_key_table_offset_for, unmarshal_metadata,
    ErasureConfig, Metadata, KEY_SIZE, METADATA_PREFIX_LEN, METADATA_VERSION,
};
use crate::pubkey::{
    marshal_pub_key_table, unmarshal_pub_key_table_prefix, HostPublicKey, PublicKeyTable,
};
use crate::update;
use crate::wal::{Update, Wal};

/// Parameters for a new piece file.
#[derive(Clone, Debug)]
pub struct FileConfig {
    pub remote_path: String,
    pub local_path: String,
    pub erasure: ErasureConfig,
    pub piece_size: u64,
    pub file_size: u64,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub master_key: [u8; KEY_SIZE],
    pub sharing_key: [u8; KEY_SIZE],
}

impl FileConfig {
    pub fn new(
        remote_path: impl Into<String>,
        erasure: ErasureConfig,
        piece_size: u64,
        file_size: u64,
    ) -> Self {
        Self {
            remote_path: remote_path.into(),
            local_path: String::new(),
            erasure,
            piece_size,
            file_size,
            mode: 0o644,
            uid: 0,
            gid: 0,
            master_key: [0u8; KEY_SIZE],
            sharing_key: [0u8; KEY_SIZE],
        }
    }
}

/// Counters kept per open file.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileMetrics {
    pub transactions_applied: u64,
    pub updates_applied: u64,
    pub disk_faults: u64,
}

/// Owner of one piece file on disk together with its in-memory metadata,
/// public-key table and chunk table. All writes to the backing file go
/// through the write-ahead log and the apply engine.
#[derive(Debug)]
pub struct PieceFile {
    path: PathBuf,
    metadata: Metadata,
    pub_key_table: PublicKeyTable,
    chunks: Vec<Chunk>,
    wal: Arc<Wal>,
    deps: Arc<dyn Dependencies>,
    metrics: FileMetrics,
    needs_recovery: bool,
    deleted: bool,
}

fn read_region(
    f: &mut dyn DepFile,
    offset: u64,
    len: u64,
    size: u64,
    what: &'static str,
) -> Result<Vec<u8>> {
    if offset.checked_add(len).map_or(true, |end| end > size) {
        return Err(Error::Truncated { what });
    }
    let mut buf = vec![0u8; len as usize];
    f.read_at(offset, &mut buf)?;
    Ok(buf)
}

/// Update records name their target by path, so the path a file is opened
/// with must not depend on the working directory at replay time.
fn absolute(path: PathBuf) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path);
    }
    Ok(std::env::current_dir()?.join(path))
}

impl PieceFile {
    /// Create a new file at `path` and persist its initial layout. A relative
    /// `path` is resolved against the current directory.
    pub fn create(
        path: impl Into<PathBuf>,
        config: FileConfig,
        wal: Arc<Wal>,
        deps: Arc<dyn Dependencies>,
    ) -> Result<Self> {
        let path = absolute(path.into())?;
        config.erasure.validate()?;

        let now = Utc::now();
        let metadata = Metadata {
            version: METADATA_VERSION,
            file_size: config.file_size,
            piece_size: config.piece_size,
            local_path: config.local_path,
            remote_path: config.remote_path,
            master_key: config.master_key,
            sharing_key: config.sharing_key,
            mod_time: now,
            change_time: now,
            access_time: now,
            create_time: now,
            mode: config.mode,
            uid: config.uid,
            gid: config.gid,
            chunk_metadata_size: chunk_metadata_size(config.erasure.num_pieces),
            chunk_offset: 0,
            pub_key_table_offset: 0,
            erasure: config.erasure,
        };
        metadata.chunk_table_len()?;
        if let Some(parent) = path.parent() {
            deps.create_dir_all(parent)?;
        }
        let chunks = vec![Chunk::new(config.erasure.num_pieces); metadata.num_chunks() as usize];
        let mut file = PieceFile {
            path,
            metadata,
            pub_key_table: PublicKeyTable::new(),
            chunks,
            wal,
            deps,
            metrics: FileMetrics::default(),
            needs_recovery: false,
            deleted: false,
        };

        let mut md = file.metadata.clone();
        let updates = file.layout_updates(&mut md, &file.pub_key_table, &file.chunks)?;
        file.create_and_apply_transaction(updates)?;
        file.metadata = md;
        info!(
            path = %file.path.display(),
            chunks = file.chunks.len(),
            pieces = file.metadata.erasure.num_pieces,
            "created piece file"
        );
        Ok(file)
    }

    /// Read a file from disk. The write-ahead log must already be drained;
    /// use [`crate::recovery::Loader`] to do both.
    pub fn load(
        path: impl Into<PathBuf>,
        wal: Arc<Wal>,
        deps: Arc<dyn Dependencies>,
    ) -> Result<Self> {
        let path = absolute(path.into())?;
        let mut f = deps.open_read(&path)?;
        let size = f.size()?;

        let head = read_region(&mut *f, 0, size.min(METADATA_PREFIX_LEN as u64), size, "metadata")?;
        let md_len = encoded_metadata_len(&head)? as u64;
        let raw = read_region(&mut *f, 0, md_len, size, "metadata")?;
        let metadata = unmarshal_metadata(&raw)?;
        metadata
            .erasure
            .validate()
            .map_err(|e| Error::Corrupt { what: "metadata", reason: e.to_string() })?;

        let pkt_offset = pub_key_table_offset_for(md_len);
        if metadata.pub_key_table_offset != pkt_offset {
            return Err(Error::LayoutMismatch {
                field: "pub_key_table_offset",
                stored: metadata.pub_key_table_offset,
                computed: pkt_offset,
            });
        }
        if pkt_offset > size {
            return Err(Error::Truncated { what: "public key table" });
        }
        let rest = read_region(&mut *f, pkt_offset, size - pkt_offset, size, "public key table")?;
        let (pub_key_table, table_len) = unmarshal_pub_key_table_prefix(&rest)?;
        if metadata.chunk_offset != pkt_offset + table_len {
            return Err(Error::LayoutMismatch {
                field: "chunk_offset",
                stored: metadata.chunk_offset,
                computed: pkt_offset + table_len,
            });
        }

        let num_pieces = metadata.erasure.num_pieces;
        let slot = chunk_metadata_size(num_pieces);
        if metadata.chunk_metadata_size != slot {
            return Err(Error::LayoutMismatch {
                field: "chunk_metadata_size",
                stored: metadata.chunk_metadata_size,
                computed: slot,
            });
        }
        let table_bytes = metadata
            .chunk_table_len()
            .map_err(|e| Error::Corrupt { what: "metadata", reason: e.to_string() })?;
        let region = table_bytes
            .checked_add(table_len)
            .and_then(|end| usize::try_from(end).ok())
            .and_then(|end| rest.get(table_len as usize..end))
            .ok_or(Error::Truncated { what: "chunk table" })?;
        let chunks = region
            .chunks_exact(slot as usize)
            .map(|raw| unmarshal_chunk(raw, num_pieces, pub_key_table.len()))
            .collect::<Result<Vec<_>>>()?;

        debug!(
            path = %path.display(),
            chunks = chunks.len(),
            host_keys = pub_key_table.len(),
            "loaded piece file"
        );
        Ok(PieceFile {
            path,
            metadata,
            pub_key_table,
            chunks,
            wal,
            deps,
            metrics: FileMetrics::default(),
            needs_recovery: false,
            deleted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn host_public_keys(&self) -> &PublicKeyTable {
        &self.pub_key_table
    }

    pub fn erasure_code(&self) -> &ErasureConfig {
        &self.metadata.erasure
    }

    pub fn size(&self) -> u64 {
        self.metadata.file_size
    }

    pub fn piece_size(&self) -> u64 {
        self.metadata.piece_size
    }

    pub fn chunk_size(&self) -> u64 {
        self.metadata.chunk_size()
    }

    pub fn num_chunks(&self) -> u64 {
        self.chunks.len() as u64
    }

    pub fn chunk(&self, chunk_index: u64) -> Result<&Chunk> {
        Ok(&self.chunks[self.chunk_slot(chunk_index)?])
    }

    pub fn pieces(&self, chunk_index: u64) -> Result<&[Option<Piece>]> {
        Ok(self.chunk(chunk_index)?.pieces())
    }

    pub fn metrics(&self) -> FileMetrics {
        self.metrics
    }

    pub fn wal(&self) -> &Arc<Wal> {
        &self.wal
    }

    /// True after a logged transaction failed to apply.
    pub fn needs_recovery(&self) -> bool {
        self.needs_recovery
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted
    }

    /// Map a byte offset of the source file to (chunk index, offset in chunk).
    pub fn chunk_index_by_offset(&self, offset: u64) -> (u64, u64) {
        let cs = self.chunk_size();
        (offset / cs, offset % cs)
    }

    /// Lowest ratio of stored pieces to required pieces over all chunks.
    pub fn redundancy(&self) -> f64 {
        let min = f64::from(self.metadata.erasure.min_pieces.max(1));
        self.chunks.iter().map(|c| c.filled() as f64 / min).fold(f64::INFINITY, f64::min)
    }

    /// Every chunk has enough pieces to be recovered.
    pub fn available(&self) -> bool {
        self.redundancy() >= 1.0
    }

    /// Record that piece `piece_index` of chunk `chunk_index` is stored on
    /// the host owning `host_key`. An existing piece in that slot is replaced.
    pub fn add_piece(
        &mut self,
        host_key: HostPublicKey,
        chunk_index: u64,
        piece_index: u32,
        hash: Hash,
    ) -> Result<()> {
        self.check_writable()?;
        let ci = self.chunk_slot(chunk_index)?;
        let mut table = self.pub_key_table.clone();
        let (host_key_index, grew) = table.insert(host_key)?;
        let mut chunk = self.chunks[ci].clone();
        chunk.set(Piece { host_key_index, hash, piece_index }, table.len())?;

        let mut md = self.metadata.clone();
        let now = Utc::now();
        md.mod_time = now;
        md.change_time = now;

        if grew {
            // The chunk table moves behind the larger key table.
            let mut chunks = self.chunks.clone();
            chunks[ci] = chunk;
            let updates = self.layout_updates(&mut md, &table, &chunks)?;
            self.create_and_apply_transaction(updates)?;
            self.pub_key_table = table;
            self.chunks = chunks;
        } else {
            let mut updates = self.metadata_updates(&mut md)?;
            let offset = md.chunk_offset + ci as u64 * md.chunk_metadata_size;
            updates.push(self.create_update(offset, &marshal_chunk(&chunk))?);
            self.create_and_apply_transaction(updates)?;
            self.chunks[ci] = chunk;
        }
        self.metadata = md;
        Ok(())
    }

    pub fn set_remote_path(&mut self, remote_path: impl Into<String>) -> Result<()> {
        let remote_path = remote_path.into();
        self.update_metadata(|md| {
            md.remote_path = remote_path;
            md.change_time = Utc::now();
        })
    }

    pub fn set_local_path(&mut self, local_path: impl Into<String>) -> Result<()> {
        let local_path = local_path.into();
        self.update_metadata(|md| {
            md.local_path = local_path;
            md.change_time = Utc::now();
        })
    }

    pub fn set_mode(&mut self, mode: u32) -> Result<()> {
        self.update_metadata(|md| {
            md.mode = mode;
            md.change_time = Utc::now();
        })
    }

    pub fn touch_access_time(&mut self) -> Result<()> {
        self.update_metadata(|md| md.access_time = Utc::now())
    }

    /// Remove the backing file through the log. The instance is unusable
    /// afterwards.
    pub fn delete(&mut self) -> Result<()> {
        let updates = vec![update::create_delete_update(&self.path)?];
        self.create_and_apply_transaction(updates)?;
        self.deleted = true;
        info!(path = %self.path.display(), "deleted piece file");
        Ok(())
    }

    /// Insert record targeting this file.
    pub fn create_update(&self, offset: u64, data: &[u8]) -> Result<Update> {
        update::create_update(&self.path, offset, data)
    }

    /// Apply `updates` with this file's dependency. Logging is the caller's
    /// business.
    pub fn apply_updates(&mut self, updates: &[Update]) -> Result<()> {
        match apply::apply_updates(self.deps.as_ref(), updates) {
            Ok(()) => {
                self.metrics.updates_applied += updates.len() as u64;
                Ok(())
            }
            Err(err) => {
                if err.is_disk_fault() {
                    self.metrics.disk_faults += 1;
                }
                Err(err)
            }
        }
    }

    /// Log `updates` as a new transaction, apply them and mark the
    /// transaction complete.
    ///
    /// If applying fails the transaction stays in the log and the instance
    /// refuses further writes with [`Error::NeedsRecovery`]: a later
    /// transaction must not be logged ahead of the replay of this one.
    pub fn create_and_apply_transaction(&mut self, updates: Vec<Update>) -> Result<()> {
        self.check_writable()?;
        let txn = self.wal.new_transaction(updates)?;
        if let Err(err) = self.apply_updates(txn.updates()) {
            self.needs_recovery = true;
            warn!(txn = txn.id(), path = %self.path.display(), error = %err, "transaction left for recovery");
            return Err(err);
        }
        if let Err(err) = self.wal.signal_applied(&txn) {
            self.needs_recovery = true;
            return Err(err);
        }
        self.metrics.transactions_applied += 1;
        Ok(())
    }

    fn check_writable(&self) -> Result<()> {
        if self.deleted {
            return Err(Error::Deleted);
        }
        if self.needs_recovery {
            return Err(Error::NeedsRecovery);
        }
        Ok(())
    }

    fn chunk_slot(&self, chunk_index: u64) -> Result<usize> {
        if chunk_index < self.chunks.len() as u64 {
            Ok(chunk_index as usize)
        } else {
            Err(Error::OutOfBounds {
                what: "chunk",
                index: chunk_index,
                len: self.chunks.len() as u64,
            })
        }
    }

    fn update_metadata(&mut self, change: impl FnOnce(&mut Metadata)) -> Result<()> {
        self.check_writable()?;
        let mut md = self.metadata.clone();
        change(&mut md);
        let updates = self.metadata_updates(&mut md)?;
        self.create_and_apply_transaction(updates)?;
        self.metadata = md;
        Ok(())
    }

    /// Rewrite the metadata page, or the whole layout when the metadata no
    /// longer fits the pages in front of the key table.
    fn metadata_updates(&self, md: &mut Metadata) -> Result<Vec<Update>> {
        let mut raw = marshal_metadata(md)?;
        if pub_key_table_offset_for(raw.len() as u64) != md.pub_key_table_offset {
            return self.layout_updates(md, &self.pub_key_table, &self.chunks);
        }
        raw.resize(md.pub_key_table_offset as usize, 0);
        Ok(vec![self.create_update(0, &raw)?])
    }

    /// Records writing the complete file: metadata page(s), key table and
    /// chunk table. Sets both table offsets in `md`.
    fn layout_updates(
        &self,
        md: &mut Metadata,
        table: &PublicKeyTable,
        chunks: &[Chunk],
    ) -> Result<Vec<Update>> {
        let table_raw = marshal_pub_key_table(table)?;
        // Offsets are fixed width, so the encoded length does not depend on them.
        md.pub_key_table_offset = pub_key_table_offset_for(marshal_metadata(md)?.len() as u64);
        md.chunk_offset = md.pub_key_table_offset + table_raw.len() as u64;
        let mut md_raw = marshal_metadata(md)?;
        md_raw.resize(md.pub_key_table_offset as usize, 0);

        let mut chunk_raw = Vec::with_capacity(chunks.len() * md.chunk_metadata_size as usize);
        for c in chunks {
            chunk_raw.extend_from_slice(&marshal_chunk(c));
        }
        Ok(vec![
            self.create_update(0, &md_raw)?,
            self.create_update(md.pub_key_table_offset, &table_raw)?,
            self.create_update(md.chunk_offset, &chunk_raw)?,
        ])
    }
}
