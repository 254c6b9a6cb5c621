//! Concurrent buffer pool: demand-loads fixed-size pages from disk, pins
//! them for query threads, and evicts under pressure while cooperating
//! with the background merge job.
//!
//! Unlike a textbook LRU cache, eviction here must never touch a pinned
//! page and must defer (rather than drop) a page the merge job is
//! currently rewriting — see [`BufferPool::get_page`] and the eviction
//! logic in the worker thread for the exact protocol.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread::JoinHandle;

use common::{DbResult, EngineConfig};
use crossbeam_channel::{Receiver, Sender};
use parking_lot::Mutex;
use storage::{PageDirectory, PageHandle, PageKey, PageStore, Pid};

struct PoolState {
    /// Admission order, oldest at the head; re-admission moves an entry to
    /// the tail. Doubles as the page count (`num_pool_pages == pages.len()`).
    pages: Vec<(PageKey, PageHandle)>,
    loaded_off_pool: Vec<(PageKey, PageHandle)>,
}

struct Inner {
    directory: Arc<dyn PageDirectory>,
    store: Arc<dyn PageStore>,
    max_pages: usize,
    pop_locks: Vec<Mutex<()>>,
    load_locks: Vec<Mutex<()>>,
    pins: Mutex<HashMap<PageKey, i64>>,
    merge_pins: Mutex<HashMap<PageKey, i64>>,
    state: Mutex<PoolState>,
    add_tx: Sender<(PageKey, PageHandle)>,
}

/// Pin counts, LRU-ish eviction, a background admission worker, and
/// merge-pin cooperation, all keyed uniformly by [`PageKey`].
pub struct BufferPool {
    inner: Arc<Inner>,
    worker: Option<JoinHandle<()>>,
    shutdown_tx: Option<Sender<(PageKey, PageHandle)>>,
}

impl BufferPool {
    pub fn new(
        cfg: &EngineConfig,
        directory: Arc<dyn PageDirectory>,
        store: Arc<dyn PageStore>,
    ) -> Self {
        let stripes = cfg.buffer_pool_stripes.max(1);
        let (add_tx, add_rx) = crossbeam_channel::unbounded();
        let inner = Arc::new(Inner {
            directory,
            store,
            max_pages: cfg.max_pool_pages,
            pop_locks: (0..stripes).map(|_| Mutex::new(())).collect(),
            load_locks: (0..stripes).map(|_| Mutex::new(())).collect(),
            pins: Mutex::new(HashMap::new()),
            merge_pins: Mutex::new(HashMap::new()),
            state: Mutex::new(PoolState {
                pages: Vec::new(),
                loaded_off_pool: Vec::new(),
            }),
            add_tx: add_tx.clone(),
        });

        let worker_inner = inner.clone();
        let worker = std::thread::spawn(move || admission_worker(worker_inner, add_rx));

        Self {
            inner,
            worker: Some(worker),
            shutdown_tx: Some(add_tx),
        }
    }

    /// Fetches the page for `pid`, demand-loading it from disk if it is not
    /// resident. When `pin` is set, the caller must later call `unpin` on
    /// the same `PageKey` exactly once.
    pub fn get_page(&self, pid: Pid, pin: bool) -> DbResult<PageHandle> {
        let key = pid.page_key();
        let page = self.inner.directory.page_handle(key)?;

        let stripe = key.stripe(self.inner.pop_locks.len());
        let _guard = self.inner.pop_locks[stripe].lock();

        let needs_load = !page.lock().is_loaded();
        if needs_load {
            log::debug!("buffer: loading {:?} from disk", key);
            self.load_from_disk(key, &page)?;
        }

        // Pinned only once the page is actually resident: a failed load
        // above must not leave a pin behind that nothing will ever release.
        if pin {
            self.pin(key);
        }

        self.enqueue(key, page.clone());
        Ok(page)
    }

    fn load_from_disk(&self, key: PageKey, page: &PageHandle) -> DbResult<()> {
        let stripe = key.stripe(self.inner.load_locks.len());
        let _guard = self.inner.load_locks[stripe].lock();
        let mut p = page.lock();
        if !p.is_loaded() {
            let (bytes, num_records) = self.inner.store.load_page(key)?;
            p.load(bytes, num_records, false);
        }
        Ok(())
    }

    fn enqueue(&self, key: PageKey, page: PageHandle) {
        let _ = self.inner.add_tx.send((key, page));
    }

    pub fn pin(&self, key: PageKey) {
        let mut pins = self.inner.pins.lock();
        let count = pins.entry(key).or_insert(0);
        *count += 1;
        log::trace!("buffer: pin {:?} -> {}", key, count);
    }

    pub fn unpin(&self, key: PageKey) {
        let mut pins = self.inner.pins.lock();
        let count = pins.entry(key).or_insert(0);
        if *count > 0 {
            *count -= 1;
        }
        log::trace!("buffer: unpin {:?} -> {}", key, count);
    }

    pub fn pin_merge(&self, key: PageKey) {
        let mut pins = self.inner.merge_pins.lock();
        *pins.entry(key).or_insert(0) += 1;
    }

    pub fn unpin_merge(&self, key: PageKey) {
        let mut pins = self.inner.merge_pins.lock();
        let count = pins.entry(key).or_insert(0);
        if *count > 0 {
            *count -= 1;
        }
    }

    /// Called by the merge job on completion: flushes any page eviction
    /// deferred because it was merge-pinned at the time.
    pub fn flush_unpooled(&self) -> DbResult<()> {
        log::debug!("buffer: flush_unpooled starting");
        let deferred = std::mem::take(&mut self.inner.state.lock().loaded_off_pool);
        for (key, page) in deferred {
            if *self.inner.pins.lock().get(&key).unwrap_or(&0) > 0 {
                log::debug!("buffer: flush_unpooled skipping pinned page {:?}", key);
                continue;
            }
            let mut p = page.lock();
            if p.is_dirty() {
                self.inner.store.write_page(key, &p)?;
                p.clear_dirty();
            }
            p.unload();
        }
        Ok(())
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        self.shutdown_tx.take();
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
    }
}

fn admission_worker(inner: Arc<Inner>, rx: Receiver<(PageKey, PageHandle)>) {
    while let Ok((key, page)) = rx.recv() {
        let len = {
            let mut state = inner.state.lock();
            if let Some(pos) = state.pages.iter().position(|(k, _)| *k == key) {
                state.pages.remove(pos);
            }
            state.pages.push((key, page));
            state.pages.len()
        };

        if len > inner.max_pages {
            evict(&inner);
        }
    }
}

/// Selects up to a quarter of resident pages as eviction candidates,
/// skipping pinned ones, then writes back/unloads each (or defers it if
/// the merge job holds a merge-pin on it).
fn evict(inner: &Inner) {
    let target = {
        let state = inner.state.lock();
        state.pages.len() / 4
    };

    let mut candidates = Vec::new();
    {
        let mut state = inner.state.lock();
        let mut i = 0;
        while i < state.pages.len() && candidates.len() < target {
            let (key, _) = state.pages[i];
            let pinned = *inner.pins.lock().get(&key).unwrap_or(&0) > 0;
            if pinned {
                i += 1;
            } else {
                candidates.push(state.pages.remove(i));
            }
        }
    }

    for (key, page) in candidates {
        let stripe = key.stripe(inner.pop_locks.len());
        let _guard = inner.pop_locks[stripe].lock();

        let pinned = *inner.pins.lock().get(&key).unwrap_or(&0);
        assert!(pinned <= 0, "evicting page {:?} that is pinned", key);

        let merge_pinned = *inner.merge_pins.lock().get(&key).unwrap_or(&0) > 0;
        if merge_pinned {
            log::debug!("buffer: deferring evict of merge-pinned page {:?}", key);
            inner.state.lock().loaded_off_pool.push((key, page));
            continue;
        }

        let mut p = page.lock();
        if p.is_dirty() {
            if let Err(e) = inner.store.write_page(key, &p) {
                log::error!("buffer: write-back of {:?} failed: {e}", key);
                continue;
            }
            p.clear_dirty();
        }
        log::debug!("buffer: unloading page {:?}", key);
        p.unload();
    }
}
