use super::*;
use proptest::prelude::*;
use tempfile::tempdir;

#[test]
fn fresh_pages_initialize_their_counter() {
    let base = Page::new(RangeKind::Base);
    assert_eq!(base.num_records(), 2);
    assert_eq!(base.read_field(0).unwrap(), 2u64.to_le_bytes());

    let tail = Page::new(RangeKind::Tail);
    assert_eq!(tail.num_records(), 1);
    assert_eq!(tail.read_field(0).unwrap(), 1u64.to_le_bytes());
}

#[test]
fn from_bytes_reads_counter_back() {
    let mut page = Page::new(RangeKind::Base);
    page.bump_records();
    page.bump_records();

    let restored = Page::from_bytes(page.bytes()).unwrap();
    assert_eq!(restored.num_records(), 4);
}

#[test]
fn from_bytes_rejects_short_buffers() {
    let err = Page::from_bytes(&[0u8; 100]).unwrap_err();
    assert!(matches!(err, DbError::Corrupt(_)));
}

#[test]
fn write_field_rejects_bad_word_sizes() {
    let mut page = Page::new(RangeKind::Tail);
    let err = page.write_field(8, &[1, 2, 3]).unwrap_err();
    assert!(matches!(err, DbError::BadWordSize { got: 3, .. }));
}

#[test]
fn field_access_rejects_out_of_bounds_offsets() {
    let mut page = Page::new(RangeKind::Tail);
    assert!(matches!(
        page.read_field(PAGE_SIZE - 4),
        Err(DbError::OutOfBounds { .. })
    ));
    assert!(matches!(
        page.write_field(PAGE_SIZE, &42u64.to_le_bytes()),
        Err(DbError::OutOfBounds { .. })
    ));
}

#[test]
fn lineage_round_trips_at_word_one() {
    let mut page = Page::new(RangeKind::Base);
    assert_eq!(page.lineage(), Rid::new(0, 0));

    page.set_lineage(Rid::new(3, 1024));
    assert_eq!(page.lineage(), Rid::new(3, 1024));
    assert_eq!(page.read_field(LINEAGE_OFFSET).unwrap(), Rid::new(3, 1024).to_bytes());
}

#[test]
fn read_page_grows_file_with_initialized_pages() {
    let dir = tempdir().unwrap();
    let appendix = dir.path().join("t").to_string_lossy().into_owned();
    let mut disk = DiskManager::new(&appendix);

    // Faulting page 2 of an empty file materializes pages 0..=2.
    let page = disk.read_page(RangeKind::Base, 2, 0).unwrap();
    assert_eq!(page.num_records(), 2);

    let len = std::fs::metadata(format!("{appendix}_b_0")).unwrap().len();
    assert_eq!(len % PAGE_SIZE as u64, 0);
    assert!(len >= 3 * PAGE_SIZE as u64);

    // Every grown page carries a valid initial counter.
    for idx in 0..3 {
        let p = disk.read_page(RangeKind::Base, idx, 0).unwrap();
        assert_eq!(p.num_records(), 2);
    }
}

#[test]
fn write_page_persists_and_rejects_unallocated_pages() {
    let dir = tempdir().unwrap();
    let appendix = dir.path().join("t").to_string_lossy().into_owned();
    let mut disk = DiskManager::new(&appendix);

    let mut page = disk.read_page(RangeKind::Tail, 0, 3).unwrap();
    page.write_field(8, &99i64.to_le_bytes()).unwrap();
    disk.write_page(RangeKind::Tail, 0, 3, &page).unwrap();

    let back = disk.read_page(RangeKind::Tail, 0, 3).unwrap();
    assert_eq!(back.read_field(8).unwrap(), 99i64.to_le_bytes());

    let err = disk.write_page(RangeKind::Tail, 5, 3, &page).unwrap_err();
    assert!(matches!(err, DbError::OutOfBounds { .. }));
}

#[test]
fn last_rids_on_empty_files_point_at_the_header() {
    let dir = tempdir().unwrap();
    let appendix = dir.path().join("t").to_string_lossy().into_owned();
    let mut disk = DiskManager::new(&appendix);

    let (base, tail) = disk.last_rids().unwrap();
    assert_eq!(base, Rid::new(0, WORD_SIZE as u32));
    assert_eq!(tail, Rid::new(0, 0));
}

#[test]
fn last_rids_read_the_counter_of_the_last_page() {
    let dir = tempdir().unwrap();
    let appendix = dir.path().join("t").to_string_lossy().into_owned();
    let mut disk = DiskManager::new(&appendix);

    // Materialize two base pages and bump the counter on the last one.
    let mut page = disk.read_page(RangeKind::Base, 1, 0).unwrap();
    page.bump_records();
    page.bump_records();
    disk.write_page(RangeKind::Base, 1, 0, &page).unwrap();

    let (base, _) = disk.last_rids().unwrap();
    assert_eq!(base, Rid::new(1, 4 * WORD_SIZE as u32));
}

proptest! {
    // Writing a word and reading it back yields the same bytes, and no other
    // aligned slot is disturbed.
    #[test]
    fn word_round_trip_leaves_other_slots_unchanged(
        slot in 1usize..WORDS_PER_PAGE,
        value in any::<u64>(),
        probe in 1usize..WORDS_PER_PAGE,
    ) {
        let mut page = Page::new(RangeKind::Tail);
        let before = page.read_field(probe * WORD_SIZE).unwrap();

        page.write_field(slot * WORD_SIZE, &value.to_le_bytes()).unwrap();

        prop_assert_eq!(page.read_field(slot * WORD_SIZE).unwrap(), value.to_le_bytes());
        if probe != slot {
            prop_assert_eq!(page.read_field(probe * WORD_SIZE).unwrap(), before);
        }
    }
}
