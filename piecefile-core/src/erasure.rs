use reed_solomon_erasure::galois_8::ReedSolomon;

use crate::error::{Error, Result};

/// The slice of an erasure coder this crate needs: how many pieces a chunk
/// is split into and how many are enough to recover it.
pub trait ErasureCoder {
    fn num_pieces(&self) -> usize;
    fn min_pieces(&self) -> usize;
}

/// Reed-Solomon coder over GF(2^8).
pub struct RsCodec {
    data: usize,
    parity: usize,
    inner: ReedSolomon,
}

impl RsCodec {
    pub fn new(data: usize, parity: usize) -> Result<Self> {
        let inner = ReedSolomon::new(data, parity).map_err(|e| Error::Erasure(e.to_string()))?;
        Ok(Self { data, parity, inner })
    }

    /// Split `chunk` into `min_pieces` data pieces of `piece_size` bytes
    /// (zero padded) and append the parity pieces.
    pub fn encode_chunk(&self, chunk: &[u8], piece_size: usize) -> Result<Vec<Vec<u8>>> {
        if chunk.len() > piece_size * self.data {
            return Err(Error::Erasure(format!(
                "chunk of {} bytes exceeds {} x {piece_size}",
                chunk.len(),
                self.data
            )));
        }
        let mut shards: Vec<Vec<u8>> = (0..self.data + self.parity)
            .map(|i| {
                let mut buf = vec![0u8; piece_size];
                let start = (i * piece_size).min(chunk.len());
                let end = ((i + 1) * piece_size).min(chunk.len());
                if i < self.data {
                    buf[..end - start].copy_from_slice(&chunk[start..end]);
                }
                buf
            })
            .collect();
        self.inner.encode(&mut shards).map_err(|e| Error::Erasure(e.to_string()))?;
        Ok(shards)
    }

    // Note: reconstruct expects Option<Vec<u8>> buffers
    pub fn reconstruct(&self, shards: &mut [Option<Vec<u8>>]) -> Result<()> {
        self.inner.reconstruct(shards).map_err(|e| Error::Erasure(e.to_string()))
    }
}

impl ErasureCoder for RsCodec {
    fn num_pieces(&self) -> usize {
        self.data + self.parity
    }

    fn min_pieces(&self) -> usize {
        self.data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counts() {
        let rs = RsCodec::new(10, 20).unwrap();
        assert_eq!(rs.num_pieces(), 30);
        assert_eq!(rs.min_pieces(), 10);
    }

    #[test]
    fn oversized_chunk_rejected() {
        let rs = RsCodec::new(2, 1).unwrap();
        assert!(rs.encode_chunk(&[0u8; 9], 4).is_err());
    }
}
