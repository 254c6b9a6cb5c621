use super::*;

#[test]
fn insert_and_search_single_key() {
    let mut tree = BPlusTree::new(4);
    tree.insert(10, 1);
    assert_eq!(tree.search(10), vec![1]);
    assert_eq!(tree.search(99), Vec::<Rid>::new());
}

#[test]
fn duplicate_keys_accumulate_into_one_bucket() {
    let mut tree = BPlusTree::new(4);
    tree.insert(10, 1);
    tree.insert(10, 2);
    tree.insert(10, 3);
    assert_eq!(tree.search(10), vec![1, 2, 3]);
}

#[test]
fn insert_beyond_max_node_size_splits_and_stays_searchable() {
    let mut tree = BPlusTree::new(4);
    for key in 0..50i64 {
        tree.insert(key, key as Rid);
    }
    for key in 0..50i64 {
        assert_eq!(tree.search(key), vec![key as Rid], "key {key} lost after splits");
    }
}

#[test]
fn range_returns_ascending_keys_within_bounds() {
    let mut tree = BPlusTree::new(4);
    for key in 0..30i64 {
        tree.insert(key, key as Rid);
    }
    let keys: Vec<i64> = tree.range(Some(10), Some(15)).into_iter().map(|(k, _)| k).collect();
    assert_eq!(keys, vec![10, 11, 12, 13, 14, 15]);
}

#[test]
fn bulk_search_flattens_buckets_in_range() {
    let mut tree = BPlusTree::new(4);
    tree.insert(1, 100);
    tree.insert(1, 101);
    tree.insert(2, 200);
    let mut rids = tree.bulk_search(Some(1), Some(2));
    rids.sort();
    assert_eq!(rids, vec![100, 101, 200]);
}

#[test]
fn sum_range_weights_each_key_by_bucket_size() {
    let mut tree = BPlusTree::new(4);
    tree.insert(5, 1);
    tree.insert(5, 2);
    tree.insert(10, 3);
    assert_eq!(tree.sum_range(0, 10), 5 * 2 + 10);
}

#[test]
fn find_by_rid_locates_the_owning_key() {
    let mut tree = BPlusTree::new(4);
    tree.insert(7, 42);
    assert_eq!(tree.find_by_rid(42), Some(7));
    assert_eq!(tree.find_by_rid(999), None);
}

#[test]
fn remove_drops_rid_and_eventually_the_key() {
    let mut tree = BPlusTree::new(4);
    tree.insert(1, 10);
    tree.insert(1, 11);
    assert!(tree.remove(1, 10));
    assert_eq!(tree.search(1), vec![11]);
    assert!(tree.remove(1, 11));
    assert_eq!(tree.search(1), Vec::<Rid>::new());
    assert!(!tree.remove(1, 11));
}

#[test]
fn remove_after_many_splits_keeps_remaining_keys_searchable() {
    let mut tree = BPlusTree::new(4);
    for key in 0..60i64 {
        tree.insert(key, key as Rid);
    }
    for key in (0..60i64).step_by(2) {
        assert!(tree.remove(key, key as Rid));
    }
    for key in 0..60i64 {
        if key % 2 == 0 {
            assert_eq!(tree.search(key), Vec::<Rid>::new());
        } else {
            assert_eq!(tree.search(key), vec![key as Rid]);
        }
    }
}

#[test]
fn root_collapses_after_deletes_shrink_the_tree() {
    let mut tree = BPlusTree::new(4);
    for key in 0..20i64 {
        tree.insert(key, key as Rid);
    }
    for key in 0..19i64 {
        tree.remove(key, key as Rid);
    }
    assert_eq!(tree.search(19), vec![19]);
}
