use piecefile_core::erasure::{ErasureCoder, RsCodec};
use piecefile_core::merkle::{piece_root, root, SEGMENT_SIZE};
use piecefile_core::ErasureConfig;
use rand::{rngs::StdRng, Rng, SeedableRng};

// A piece rebuilt from any min_pieces survivors hashes to the recorded root.
#[test]
fn reconstructed_pieces_keep_their_hash() {
    let mut rng = StdRng::seed_from_u64(7);
    let piece_size = SEGMENT_SIZE * 9 + 5;
    let chunk: Vec<u8> = (0..piece_size * 3 - 100).map(|_| rng.gen()).collect();

    let codec = RsCodec::new(3, 2).unwrap();
    let pieces = codec.encode_chunk(&chunk, piece_size).unwrap();
    assert_eq!(pieces.len(), 5);
    let hashes: Vec<_> = pieces.iter().map(|p| piece_root(p)).collect();

    let mut shards: Vec<Option<Vec<u8>>> = pieces.iter().cloned().map(Some).collect();
    shards[0] = None;
    shards[3] = None;
    codec.reconstruct(&mut shards).unwrap();
    for (i, shard) in shards.iter().enumerate() {
        assert_eq!(piece_root(shard.as_ref().unwrap()), hashes[i], "piece {i}");
    }
}

#[test]
fn coder_and_config_agree() {
    let codec = RsCodec::new(4, 2).unwrap();
    let cfg = ErasureConfig::new(4, 2);
    assert_eq!(codec.num_pieces(), cfg.num_pieces());
    assert_eq!(codec.min_pieces(), cfg.min_pieces());
}

#[test]
fn odd_layer_duplicates_last_node() {
    let leaves: Vec<blake3::Hash> = (0..3u8).map(|i| blake3::hash(&[i])).collect();
    let mut padded = leaves.clone();
    padded.push(leaves[2]);
    assert_eq!(root(&leaves), root(&padded));
}
