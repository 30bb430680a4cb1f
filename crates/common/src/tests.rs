use super::*;
use std::io;

#[test]
fn config_defaults_are_sane() {
    let cfg = Config::default();
    assert_eq!(cfg.cache_pages, 256);
    assert_eq!(cfg.merge_epoch, 8);
    assert_eq!(cfg.data_dir, PathBuf::from("./lstore_data"));
}

#[test]
fn rid_round_trips_through_bytes() {
    let rid = Rid::new(7, 4088);
    assert_eq!(Rid::from_bytes(rid.to_bytes()), rid);

    let bytes = rid.to_bytes();
    assert_eq!(&bytes[..4], &7u32.to_le_bytes());
    assert_eq!(&bytes[4..], &4088u32.to_le_bytes());
}

#[test]
fn invalid_rid_is_all_ones() {
    assert_eq!(Rid::INVALID.to_bytes(), [0xFF; 8]);
    assert!(Rid::INVALID.is_invalid());
    assert!(!Rid::new(0, 0).is_invalid());
}

#[test]
fn rid_ordering_is_lexicographic() {
    assert!(Rid::new(0, 4088) < Rid::new(1, 8));
    assert!(Rid::new(2, 16) < Rid::new(2, 24));
    // A zero lineage compares below any real tail RID, and every real RID
    // compares below the invalid sentinel.
    assert!(Rid::new(0, 0) < Rid::new(0, 8));
    assert!(Rid::new(9999, 4088) < Rid::INVALID);
}

#[test]
fn range_kind_geometry() {
    assert_eq!(RangeKind::Base.tag(), 'b');
    assert_eq!(RangeKind::Tail.tag(), 't');
    assert_eq!(RangeKind::Base.initial_records(), 2);
    assert_eq!(RangeKind::Tail.initial_records(), 1);
    assert_eq!(RangeKind::Base.first_payload_word(), 2);
    assert_eq!(RangeKind::Tail.first_payload_word(), 1);
}

#[test]
fn db_error_formats_cleanly() {
    let err = DbError::DuplicateKey(42);
    assert!(format!("{err}").contains("42"));

    let err = DbError::SchemaMismatch {
        expected: 5,
        got: 3,
    };
    assert!(format!("{err}").contains("expected 5"));
}

#[test]
fn io_error_converts() {
    let e = io::Error::other("oops");
    let db_err: DbError = e.into();
    assert!(matches!(db_err, DbError::Io(_)));
}

#[test]
fn config_serde_round_trip() {
    let cfg = Config::builder().cache_pages(16).merge_epoch(2).build();
    let json = serde_json::to_string(&cfg).unwrap();
    let back: Config = serde_json::from_str(&json).unwrap();
    assert_eq!(back.cache_pages, 16);
    assert_eq!(back.merge_epoch, 2);
}
