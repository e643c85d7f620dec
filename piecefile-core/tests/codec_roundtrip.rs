use chrono::{TimeZone, Utc};
use piecefile_core::metadata::{
    marshal_metadata, unmarshal_metadata, ErasureConfig, Metadata, KEY_SIZE, METADATA_VERSION,
};
use piecefile_core::pubkey::{
    marshal_pub_key_table, unmarshal_pub_key_table, HostPublicKey, PublicKeyTable, Specifier,
};
use piecefile_core::update::{create_update, read_update};
use piecefile_core::Error;
use proptest::prelude::*;
use rand::{rngs::StdRng, Rng, SeedableRng};
use std::path::PathBuf;

fn arb_metadata() -> impl Strategy<Value = Metadata> {
    (
        (
            any::<u64>(),
            1u64..1 << 24,
            ".{0,40}",
            ".{0,40}",
            any::<[u8; KEY_SIZE]>(),
            any::<[u8; KEY_SIZE]>(),
        ),
        prop::array::uniform4(any::<i64>()),
        (any::<u32>(), any::<u32>(), any::<u32>()),
        (any::<u64>(), any::<u64>(), any::<u64>()),
        (1u32..=16, 0u32..=16),
    )
        .prop_map(
            |(
                (file_size, piece_size, local_path, remote_path, master_key, sharing_key),
                [m, c, a, cr],
                (mode, uid, gid),
                (chunk_metadata_size, chunk_offset, pub_key_table_offset),
                (data, parity),
            )| Metadata {
                version: METADATA_VERSION,
                file_size,
                piece_size,
                local_path,
                remote_path,
                master_key,
                sharing_key,
                mod_time: Utc.timestamp_nanos(m),
                change_time: Utc.timestamp_nanos(c),
                access_time: Utc.timestamp_nanos(a),
                create_time: Utc.timestamp_nanos(cr),
                mode,
                uid,
                gid,
                chunk_metadata_size,
                chunk_offset,
                pub_key_table_offset,
                erasure: ErasureConfig::new(data, parity),
            },
        )
}

fn arb_table() -> impl Strategy<Value = PublicKeyTable> {
    prop::collection::vec((any::<[u8; 16]>(), prop::collection::vec(any::<u8>(), 0..64)), 0..20)
        .prop_map(|entries| {
            entries.into_iter().map(|(tag, key)| HostPublicKey::new(Specifier(tag), key)).collect()
        })
}

proptest! {
    #[test]
    fn metadata_roundtrip(md in arb_metadata()) {
        let raw = marshal_metadata(&md).unwrap();
        let back = unmarshal_metadata(&raw).unwrap();
        prop_assert!(md.assert_equal(&back).is_ok(), "{:?}", md.assert_equal(&back));
        prop_assert_eq!(back, md);
    }

    #[test]
    fn pub_key_table_roundtrip(table in arb_table()) {
        let raw = marshal_pub_key_table(&table).unwrap();
        let back = unmarshal_pub_key_table(&raw).unwrap();
        prop_assert_eq!(back.len(), table.len());
        for (a, b) in table.iter().zip(back.iter()) {
            prop_assert_eq!(a.algorithm, b.algorithm);
            prop_assert_eq!(&a.key, &b.key);
        }
    }

    #[test]
    fn update_roundtrip(
        path in "/[a-z]{1,12}(/[a-z0-9._-]{1,8}){0,3}",
        offset in 0u64..i64::MAX as u64,
        payload in prop::collection::vec(any::<u8>(), 0..512),
    ) {
        let u = create_update(&PathBuf::from(&path), offset, &payload).unwrap();
        let (p, o, d) = read_update(&u).unwrap();
        prop_assert_eq!(p, PathBuf::from(path));
        prop_assert_eq!(o, offset);
        prop_assert_eq!(d, payload);
    }
}

#[test]
fn ten_random_host_keys() {
    let mut rng = StdRng::seed_from_u64(10);
    let table: PublicKeyTable = (0..10)
        .map(|_| {
            let mut tag = [0u8; 16];
            rng.fill(&mut tag[..]);
            let mut key = vec![0u8; 32];
            rng.fill(&mut key[..]);
            HostPublicKey::new(Specifier(tag), key)
        })
        .collect();
    let back = unmarshal_pub_key_table(&marshal_pub_key_table(&table).unwrap()).unwrap();
    assert_eq!(back.len(), 10);
    for i in 0..10u32 {
        assert_eq!(back.get(i), table.get(i));
    }
}

#[test]
fn short_table_is_truncated() {
    let table: PublicKeyTable =
        (0..3u8).map(|i| HostPublicKey::new(Specifier::ED25519, vec![i; 32])).collect();
    let raw = marshal_pub_key_table(&table).unwrap();
    for cut in [1, 8, raw.len() / 2, raw.len() - 1] {
        let err = unmarshal_pub_key_table(&raw[..cut]).unwrap_err();
        assert!(matches!(err, Error::Truncated { .. }), "cut {cut}: {err:?}");
    }
}

#[test]
fn newer_metadata_version_rejected() {
    let md = Metadata {
        version: METADATA_VERSION + 1,
        file_size: 1,
        piece_size: 1,
        local_path: String::new(),
        remote_path: "r".into(),
        master_key: [0; KEY_SIZE],
        sharing_key: [0; KEY_SIZE],
        mod_time: Utc.timestamp_nanos(0),
        change_time: Utc.timestamp_nanos(0),
        access_time: Utc.timestamp_nanos(0),
        create_time: Utc.timestamp_nanos(0),
        mode: 0,
        uid: 0,
        gid: 0,
        chunk_metadata_size: 0,
        chunk_offset: 0,
        pub_key_table_offset: 0,
        erasure: ErasureConfig::new(1, 0),
    };
    let raw = marshal_metadata(&md).unwrap();
    assert!(matches!(
        unmarshal_metadata(&raw),
        Err(Error::VersionMismatch { found, expected }) if found == METADATA_VERSION + 1 && expected == METADATA_VERSION
    ));
}
