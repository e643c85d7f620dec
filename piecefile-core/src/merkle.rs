use crate::chunk::Hash;

/// Leaf size used when hashing a piece.
pub const SEGMENT_SIZE: usize = 64;

/// Compute a simple binary Merkle root over BLAKE3 leaf hashes.
/// Duplicates the last node when the layer is odd.
pub fn root(hashes: &[blake3::Hash]) -> blake3::Hash {
    if hashes.is_empty() {
        return blake3::hash(&[]);
    }
    let mut layer: Vec<[u8; 32]> = hashes.iter().map(|h| *h.as_bytes()).collect();
    while layer.len() > 1 {
        let mut next = Vec::with_capacity(layer.len().div_ceil(2));
        let mut i = 0;
        while i < layer.len() {
            let a = layer[i];
            let b = if i + 1 < layer.len() { layer[i + 1] } else { layer[i] };
            let mut cat = [0u8; 64];
            cat[..32].copy_from_slice(&a);
            cat[32..].copy_from_slice(&b);
            next.push(*blake3::hash(&cat).as_bytes());
            i += 2;
        }
        layer = next;
    }
    blake3::Hash::from(layer[0])
}

/// Content hash of a piece: the merkle root over its 64-byte segments.
pub fn piece_root(piece: &[u8]) -> Hash {
    let leaves: Vec<blake3::Hash> = piece.chunks(SEGMENT_SIZE).map(blake3::hash).collect();
    *root(&leaves).as_bytes()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_segment_root_is_leaf_hash() {
        let data = [3u8; 40];
        assert_eq!(piece_root(&data), *blake3::hash(&data).as_bytes());
    }

    #[test]
    fn root_changes_with_any_segment() {
        let mut data = vec![0u8; SEGMENT_SIZE * 5];
        let before = piece_root(&data);
        data[SEGMENT_SIZE * 4 + 1] = 1;
        assert_ne!(before, piece_root(&data));
    }
}
