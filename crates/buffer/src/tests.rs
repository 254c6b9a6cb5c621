use super::*;
use common::DbError;
use std::collections::HashMap as StdHashMap;
use storage::{Page, PageLayout};

const LAYOUT: PageLayout = PageLayout {
    cell_size_bytes: 8,
    cells_per_page: 4,
    reserved_tid: u64::MAX,
    max_base_pages: 2,
};

/// A directory/store double: keeps every page in memory, never touches
/// an actual filesystem, and lets tests assert on write-back calls.
struct MockBacking {
    pages: Mutex<StdHashMap<PageKey, PageHandle>>,
    disk: Mutex<StdHashMap<PageKey, (Vec<u8>, usize)>>,
    writes: Mutex<Vec<PageKey>>,
    fail_load: Mutex<Option<PageKey>>,
}

impl MockBacking {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(StdHashMap::new()),
            disk: Mutex::new(StdHashMap::new()),
            writes: Mutex::new(Vec::new()),
            fail_load: Mutex::new(None),
        })
    }

    /// Makes the next `load_page` call for `key` return an error, so tests
    /// can exercise `BufferPool::get_page`'s failure path.
    fn fail_next_load(&self, key: PageKey) {
        *self.fail_load.lock() = Some(key);
    }

    fn install_unloaded(&self, key: PageKey, on_disk: Vec<u8>, num_records: usize) {
        self.pages.lock().insert(
            key,
            Arc::new(Mutex::new(Page::new_unloaded(
                LAYOUT.cell_size_bytes,
                LAYOUT.cells_per_page,
            ))),
        );
        self.disk.lock().insert(key, (on_disk, num_records));
    }

    fn install_loaded(&self, key: PageKey) -> PageHandle {
        let page = Arc::new(Mutex::new(Page::new(
            LAYOUT.cell_size_bytes,
            LAYOUT.cells_per_page,
            LAYOUT.reserved_tid,
        )));
        self.pages.lock().insert(key, page.clone());
        page
    }
}

impl PageDirectory for MockBacking {
    fn page_handle(&self, key: PageKey) -> DbResult<PageHandle> {
        self.pages
            .lock()
            .get(&key)
            .cloned()
            .ok_or(DbError::Corrupt("no such page in mock directory".into()))
    }
}

impl PageStore for MockBacking {
    fn load_page(&self, key: PageKey) -> DbResult<(Vec<u8>, usize)> {
        let mut fail_load = self.fail_load.lock();
        if *fail_load == Some(key) {
            *fail_load = None;
            return Err(DbError::Io(std::io::Error::other("simulated disk failure")));
        }
        Ok(self
            .disk
            .lock()
            .get(&key)
            .cloned()
            .unwrap_or_else(|| (vec![0u8; (LAYOUT.cells_per_page + 1) * LAYOUT.cell_size_bytes], 0)))
    }

    fn write_page(&self, key: PageKey, page: &Page) -> DbResult<()> {
        self.writes.lock().push(key);
        self.disk
            .lock()
            .insert(key, (page.raw_bytes().to_vec(), page.num_records()));
        Ok(())
    }
}

fn config(max_pool_pages: usize) -> EngineConfig {
    EngineConfig::builder()
        .max_pool_pages(max_pool_pages)
        .buffer_pool_stripes(4)
        .build()
}

#[test]
fn get_page_demand_loads_from_disk() {
    let backing = MockBacking::new();
    let key = PageKey::new(0, 0);
    let mut bytes = vec![0u8; (LAYOUT.cells_per_page + 1) * LAYOUT.cell_size_bytes];
    bytes[8..16].copy_from_slice(&77u64.to_le_bytes());
    backing.install_unloaded(key, bytes, 1);

    let pool = BufferPool::new(&config(10), backing.clone(), backing.clone());
    let page = pool.get_page(Pid::new(0, 0, 0), false).unwrap();
    assert!(page.lock().is_loaded());
    assert_eq!(page.lock().read(0).unwrap(), 77);
}

#[test]
fn pin_and_unpin_track_counts_independently_of_merge_pins() {
    let backing = MockBacking::new();
    let key = PageKey::new(0, 0);
    backing.install_loaded(key);

    let pool = BufferPool::new(&config(10), backing.clone(), backing.clone());
    pool.pin(key);
    pool.pin(key);
    pool.pin_merge(key);
    assert_eq!(*pool.inner.pins.lock().get(&key).unwrap(), 2);
    assert_eq!(*pool.inner.merge_pins.lock().get(&key).unwrap(), 1);

    pool.unpin(key);
    assert_eq!(*pool.inner.pins.lock().get(&key).unwrap(), 1);
    assert_eq!(*pool.inner.merge_pins.lock().get(&key).unwrap(), 1);

    pool.unpin_merge(key);
    assert_eq!(*pool.inner.merge_pins.lock().get(&key).unwrap(), 0);
}

#[test]
fn eviction_skips_pinned_pages_under_pressure() {
    let backing = MockBacking::new();
    let keys: Vec<PageKey> = (0..8).map(|i| PageKey::new(0, i)).collect();
    for &key in &keys {
        backing.install_loaded(key);
    }

    let pool = BufferPool::new(&config(4), backing.clone(), backing.clone());

    // Pin the first page so it can never be picked as an eviction victim.
    pool.pin(keys[0]);
    for &key in &keys {
        pool.get_page(Pid::new(0, key.inner_idx, key.range_idx), false)
            .unwrap();
    }

    // Give the admission worker a moment to process the queue and evict.
    std::thread::sleep(std::time::Duration::from_millis(50));

    let page0 = backing.page_handle(keys[0]).unwrap();
    assert!(page0.lock().is_loaded(), "pinned page must not be evicted");
}

#[test]
fn get_page_does_not_leak_a_pin_when_disk_load_fails() {
    let backing = MockBacking::new();
    let key = PageKey::new(0, 0);
    backing.install_unloaded(key, vec![0u8; (LAYOUT.cells_per_page + 1) * LAYOUT.cell_size_bytes], 0);
    backing.fail_next_load(key);

    let pool = BufferPool::new(&config(10), backing.clone(), backing.clone());
    let err = pool.get_page(Pid::new(0, 0, 0), true);
    assert!(err.is_err());
    assert_eq!(
        *pool.inner.pins.lock().get(&key).unwrap_or(&0),
        0,
        "a failed load must not leave a pin behind"
    );

    // The page is still unloaded, and a subsequent successful fetch pins
    // and loads it normally.
    let page = pool.get_page(Pid::new(0, 0, 0), true).unwrap();
    assert!(page.lock().is_loaded());
    assert_eq!(*pool.inner.pins.lock().get(&key).unwrap(), 1);
}

#[test]
fn flush_unpooled_writes_back_deferred_dirty_pages() {
    let backing = MockBacking::new();
    let key = PageKey::new(0, 0);
    let page = backing.install_loaded(key);
    page.lock().write(5).unwrap();

    let pool = BufferPool::new(&config(10), backing.clone(), backing.clone());
    pool.inner
        .state
        .lock()
        .loaded_off_pool
        .push((key, page.clone()));

    pool.flush_unpooled().unwrap();
    assert!(backing.writes.lock().contains(&key));
    assert!(!page.lock().is_loaded());
}

#[test]
fn flush_unpooled_skips_pages_that_are_still_pinned() {
    let backing = MockBacking::new();
    let key = PageKey::new(0, 0);
    let page = backing.install_loaded(key);

    let pool = BufferPool::new(&config(10), backing.clone(), backing.clone());
    pool.pin(key);
    pool.inner
        .state
        .lock()
        .loaded_off_pool
        .push((key, page.clone()));

    pool.flush_unpooled().unwrap();
    assert!(page.lock().is_loaded(), "pinned page must survive flush_unpooled");
}
