use super::*;

fn layout() -> PageLayout {
    PageLayout {
        cell_size_bytes: 8,
        cells_per_page: 4,
        reserved_tid: u64::MAX,
        max_base_pages: 2,
    }
}

#[test]
fn page_write_appends_and_marks_dirty() {
    let mut page = Page::new(8, 4, u64::MAX);
    assert_eq!(page.read_tps().unwrap(), u64::MAX);
    let n1 = page.write(111).unwrap();
    let n2 = page.write(222).unwrap();
    assert_eq!((n1, n2), (1, 2));
    assert_eq!(page.read(0).unwrap(), 111);
    assert_eq!(page.read(1).unwrap(), 222);
    assert!(page.is_dirty());
}

#[test]
fn page_write_past_capacity_fails() {
    let mut page = Page::new(8, 2, u64::MAX);
    page.write(1).unwrap();
    page.write(2).unwrap();
    assert!(matches!(page.write(3), Err(common::DbError::Capacity)));
}

#[test]
fn page_read_out_of_bounds_fails() {
    let page = Page::new(8, 2, u64::MAX);
    assert!(matches!(page.read(5), Err(common::DbError::OutOfBounds(5))));
}

#[test]
fn write_to_cell_with_increment_bumps_num_records() {
    let mut page = Page::new(8, 4, u64::MAX);
    page.write_to_cell(42, 3, true).unwrap();
    assert_eq!(page.num_records(), 1);
    assert_eq!(page.read(3).unwrap(), 42);
}

#[test]
fn unload_then_load_round_trips_bytes() {
    let mut page = Page::new(8, 4, 7);
    page.write(99).unwrap();
    let bytes = page.raw_bytes().to_vec();
    let n = page.num_records();
    page.clear_dirty();
    page.unload();
    assert!(!page.is_loaded());

    page.load(bytes, n, false);
    assert!(page.is_loaded());
    assert_eq!(page.read(0).unwrap(), 99);
    assert_eq!(page.read_tps().unwrap(), 7);
}

#[test]
fn pid_round_trips_through_bytes() {
    let pid = Pid::new(123, 456, 789);
    let bytes = pid.encode();
    assert_eq!(Pid::decode(&bytes), pid);
}

#[test]
fn page_range_allocates_up_to_max_base_pages() {
    let mut range = PageRange::new(0, layout());
    let (idx0, _) = range.create_base_page().unwrap();
    let (idx1, _) = range.create_base_page().unwrap();
    assert_eq!((idx0, idx1), (0, 1));
    assert!(!range.has_open_base_pages());
    assert!(matches!(range.create_base_page(), Err(common::DbError::RangeFull)));
}

#[test]
fn page_range_tail_pages_roll_over_when_full() {
    let mut range = PageRange::new(0, layout());
    let (first_idx, first_page) = range.get_open_tail_page();
    for _ in 0..layout().cells_per_page {
        first_page.lock().write(1).unwrap();
    }
    let (second_idx, _) = range.get_open_tail_page();
    assert_ne!(first_idx, second_idx);
    assert_eq!(range.tail_page_count(), 2);
}

#[test]
fn page_key_stripe_matches_spec_hash() {
    let key = PageKey::new(2, 5);
    assert_eq!(key.stripe(500), (5 + 100 * 3) % 500);
}
