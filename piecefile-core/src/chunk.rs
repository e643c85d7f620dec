use crate::error::{Error, Result};

pub const HASH_SIZE: usize = 32;

/// Content hash of a piece (merkle root). Opaque to this crate.
pub type Hash = [u8; HASH_SIZE];

/// Slot count (u32 LE) at the start of every chunk record.
pub const CHUNK_HEADER_SIZE: u64 = 4;

/// present flag (1) + host key index (4) + piece index (4) + hash (32)
pub const PIECE_SLOT_SIZE: u64 = 1 + 4 + 4 + HASH_SIZE as u64;

/// Encoded size of one chunk record for a coder with `num_pieces` pieces.
pub fn chunk_metadata_size(num_pieces: u32) -> u64 {
    CHUNK_HEADER_SIZE + u64::from(num_pieces) * PIECE_SLOT_SIZE
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Piece {
    /// Index into the file's public-key table.
    pub host_key_index: u32,
    pub hash: Hash,
    pub piece_index: u32,
}

/// One erasure-coded stripe. Slot `i` holds the piece with piece index `i`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pieces: Vec<Option<Piece>>,
}

impl Chunk {
    pub fn new(num_pieces: u32) -> Self {
        Self { pieces: vec![None; num_pieces as usize] }
    }

    pub fn pieces(&self) -> &[Option<Piece>] {
        &self.pieces
    }

    pub fn piece(&self, piece_index: u32) -> Option<&Piece> {
        self.pieces.get(piece_index as usize).and_then(Option::as_ref)
    }

    pub fn num_pieces(&self) -> u32 {
        self.pieces.len() as u32
    }

    pub fn filled(&self) -> usize {
        self.pieces.iter().filter(|p| p.is_some()).count()
    }

    /// Store `piece` in its slot, replacing any previous occupant. Both
    /// indices are bounds checked; `num_keys` is the current key table length.
    pub fn set(&mut self, piece: Piece, num_keys: usize) -> Result<()> {
        if piece.piece_index as usize >= self.pieces.len() {
            return Err(Error::OutOfBounds {
                what: "piece",
                index: u64::from(piece.piece_index),
                len: self.pieces.len() as u64,
            });
        }
        if piece.host_key_index as usize >= num_keys {
            return Err(Error::OutOfBounds {
                what: "host key",
                index: u64::from(piece.host_key_index),
                len: num_keys as u64,
            });
        }
        self.pieces[piece.piece_index as usize] = Some(piece);
        Ok(())
    }
}

pub fn marshal_chunk(chunk: &Chunk) -> Vec<u8> {
    let mut buf = Vec::with_capacity(chunk_metadata_size(chunk.num_pieces()) as usize);
    buf.extend_from_slice(&chunk.num_pieces().to_le_bytes());
    for slot in &chunk.pieces {
        match slot {
            Some(p) => {
                buf.push(1);
                buf.extend_from_slice(&p.host_key_index.to_le_bytes());
                buf.extend_from_slice(&p.piece_index.to_le_bytes());
                buf.extend_from_slice(&p.hash);
            }
            None => buf.extend_from_slice(&[0u8; PIECE_SLOT_SIZE as usize]),
        }
    }
    buf
}

/// Decode one chunk record. Every stored key index must be below `num_keys`.
pub fn unmarshal_chunk(data: &[u8], num_pieces: u32, num_keys: usize) -> Result<Chunk> {
    let expected = chunk_metadata_size(num_pieces) as usize;
    if data.len() < expected {
        return Err(Error::Truncated { what: "chunk" });
    }
    let mut n4 = [0u8; 4];
    n4.copy_from_slice(&data[0..4]);
    let slots = u32::from_le_bytes(n4);
    if slots != num_pieces {
        return Err(Error::Corrupt {
            what: "chunk",
            reason: format!("{slots} slots, erasure config has {num_pieces}"),
        });
    }
    let mut chunk = Chunk::new(num_pieces);
    for (i, slot) in data[CHUNK_HEADER_SIZE as usize..expected]
        .chunks_exact(PIECE_SLOT_SIZE as usize)
        .enumerate()
    {
        match slot[0] {
            0 => continue,
            1 => {}
            flag => {
                return Err(Error::Corrupt { what: "chunk", reason: format!("slot flag {flag}") })
            }
        }
        let mut k4 = [0u8; 4];
        k4.copy_from_slice(&slot[1..5]);
        let mut p4 = [0u8; 4];
        p4.copy_from_slice(&slot[5..9]);
        let mut hash = [0u8; HASH_SIZE];
        hash.copy_from_slice(&slot[9..9 + HASH_SIZE]);
        let piece = Piece {
            host_key_index: u32::from_le_bytes(k4),
            hash,
            piece_index: u32::from_le_bytes(p4),
        };
        if piece.piece_index as usize != i {
            return Err(Error::Corrupt {
                what: "chunk",
                reason: format!("piece index {} stored in slot {i}", piece.piece_index),
            });
        }
        chunk.set(piece, num_keys)?;
    }
    Ok(chunk)
}
