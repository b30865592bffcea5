//! Per-inode context: versioned metadata cache, the inode's lock, and the
//! stripe cache.
//!
//! One `InodeCtx` exists per live gfid, behind a `gfid -> entry` map. The
//! entry's mutex serialises every access to the context and to the lock
//! attached to it; the condvar wakes fops waiting for lock ownership or
//! for an in-flight metadata query.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex, RwLock};

use crate::lock::LockState;
use crate::ondisk::ConfigRecord;
use crate::types::{FileType, Gfid};

// ---------------------------------------------------------------------------
// Stripe cache
// ---------------------------------------------------------------------------

/// One cached whole stripe, keyed by the fragment offset of its first
/// byte on each brick.
#[derive(Debug, Clone)]
pub(crate) struct Stripe {
    pub frag_offset: u64,
    pub data: Vec<u8>,
}

/// Small LRU of recently written stripes, used to serve head/tail
/// reconstruction reads of unaligned writes without touching the bricks.
#[derive(Debug, Default)]
pub(crate) struct StripeCache {
    entries: VecDeque<Stripe>,
    max: usize,
    pub hits: u64,
    pub misses: u64,
    pub evicts: u64,
}

impl StripeCache {
    pub fn new(max: usize) -> Self {
        StripeCache {
            entries: VecDeque::new(),
            max,
            hits: 0,
            misses: 0,
            evicts: 0,
        }
    }

    pub fn lookup(&mut self, frag_offset: u64) -> Option<Vec<u8>> {
        if let Some(pos) = self.entries.iter().position(|s| s.frag_offset == frag_offset) {
            let stripe = self.entries.remove(pos).expect("position just found");
            let data = stripe.data.clone();
            self.entries.push_back(stripe);
            self.hits += 1;
            Some(data)
        } else {
            self.misses += 1;
            None
        }
    }

    pub fn insert(&mut self, frag_offset: u64, data: Vec<u8>) {
        if self.max == 0 {
            return;
        }
        if let Some(pos) = self.entries.iter().position(|s| s.frag_offset == frag_offset) {
            self.entries.remove(pos);
        } else if self.entries.len() >= self.max {
            self.entries.pop_front();
            self.evicts += 1;
        }
        self.entries.push_back(Stripe { frag_offset, data });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// Inode context
// ---------------------------------------------------------------------------

/// Cached versioned metadata plus the (single) lock of one inode.
#[derive(Debug)]
pub(crate) struct InodeCtx {
    pub gfid: Gfid,
    pub file_type: Option<FileType>,
    pub lock: Option<LockState>,

    pub have_info: bool,
    pub have_version: bool,
    pub have_size: bool,
    pub have_config: bool,

    pub pre_version: [u64; 2],
    pub post_version: [u64; 2],
    pub pre_size: u64,
    pub post_size: u64,
    pub dirty: [u64; 2],
    pub config: Option<ConfigRecord>,

    pub stripe_cache: StripeCache,
}

impl InodeCtx {
    fn new(gfid: Gfid, stripe_cache_max: usize) -> Self {
        InodeCtx {
            gfid,
            file_type: None,
            lock: None,
            have_info: false,
            have_version: false,
            have_size: false,
            have_config: false,
            pre_version: [0; 2],
            post_version: [0; 2],
            pre_size: 0,
            post_size: 0,
            dirty: [0; 2],
            config: None,
            stripe_cache: StripeCache::new(stripe_cache_max),
        }
    }

    /// Forget everything learned under the last lock cycle. Called when
    /// the lock is released; the next cycle re-reads from the bricks.
    pub fn clear_info(&mut self) {
        self.have_info = false;
        self.have_version = false;
        self.have_size = false;
        self.have_config = false;
        self.pre_version = [0; 2];
        self.post_version = [0; 2];
        self.pre_size = 0;
        self.post_size = 0;
        self.dirty = [0; 2];
        self.config = None;
    }

    /// Authoritative logical size, when known.
    pub fn cached_size(&self) -> Option<u64> {
        if self.have_size {
            Some(self.post_size)
        } else {
            None
        }
    }

    /// Install a size learned outside the normal query path (self-heal
    /// preparing an inode).
    pub fn set_size(&mut self, size: u64) {
        if !self.have_size {
            self.pre_size = size;
            self.have_size = true;
            self.have_info = true;
        }
        self.post_size = size;
    }
}

/// Map entry: context plus its wait/wake machinery.
#[derive(Debug)]
pub(crate) struct InodeEntry {
    pub ctx: Mutex<InodeCtx>,
    pub cond: Condvar,
}

/// The `gfid -> InodeCtx` table.
pub(crate) struct InodeTable {
    map: RwLock<HashMap<Gfid, Arc<InodeEntry>>>,
    stripe_cache_max: usize,
}

impl InodeTable {
    pub fn new(stripe_cache_max: usize) -> Self {
        InodeTable {
            map: RwLock::new(HashMap::new()),
            stripe_cache_max,
        }
    }

    pub fn entry(&self, gfid: Gfid) -> Arc<InodeEntry> {
        if let Some(entry) = self.map.read().get(&gfid) {
            return Arc::clone(entry);
        }
        let mut map = self.map.write();
        Arc::clone(map.entry(gfid).or_insert_with(|| {
            Arc::new(InodeEntry {
                ctx: Mutex::new(InodeCtx::new(gfid, self.stripe_cache_max)),
                cond: Condvar::new(),
            })
        }))
    }

    pub fn peek(&self, gfid: Gfid) -> Option<Arc<InodeEntry>> {
        self.map.read().get(&gfid).cloned()
    }

    /// Drop the context of an evicted inode. Contexts holding a live lock
    /// are kept; the unlock path will retire them.
    pub fn evict(&self, gfid: Gfid) {
        let mut map = self.map.write();
        if let Some(entry) = map.get(&gfid) {
            let ctx = entry.ctx.lock();
            if ctx.lock.is_some() {
                return;
            }
            drop(ctx);
            map.remove(&gfid);
        }
    }

    pub fn len(&self) -> usize {
        self.map.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stripe_cache_lru_evicts_oldest() {
        let mut cache = StripeCache::new(2);
        cache.insert(0, vec![1]);
        cache.insert(4096, vec![2]);
        cache.insert(8192, vec![3]);
        assert_eq!(cache.len(), 2);
        assert_eq!(cache.evicts, 1);
        assert!(cache.lookup(0).is_none());
        assert_eq!(cache.lookup(4096), Some(vec![2]));
        assert_eq!(cache.lookup(8192), Some(vec![3]));
    }

    #[test]
    fn stripe_cache_hit_refreshes_entry() {
        let mut cache = StripeCache::new(2);
        cache.insert(0, vec![1]);
        cache.insert(4096, vec![2]);
        // Touch the oldest, then insert: the untouched entry goes.
        assert!(cache.lookup(0).is_some());
        cache.insert(8192, vec![3]);
        assert!(cache.lookup(0).is_some());
        assert!(cache.lookup(4096).is_none());
    }

    #[test]
    fn stripe_cache_disabled_when_zero() {
        let mut cache = StripeCache::new(0);
        cache.insert(0, vec![1]);
        assert_eq!(cache.len(), 0);
        assert!(cache.lookup(0).is_none());
    }

    #[test]
    fn stripe_cache_reinsert_replaces() {
        let mut cache = StripeCache::new(2);
        cache.insert(0, vec![1]);
        cache.insert(0, vec![9]);
        assert_eq!(cache.len(), 1);
        assert_eq!(cache.lookup(0), Some(vec![9]));
    }

    #[test]
    fn table_creates_and_reuses_entries() {
        let table = InodeTable::new(4);
        let g = Gfid([3; 16]);
        let a = table.entry(g);
        let b = table.entry(g);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn evict_removes_lockless_entries() {
        let table = InodeTable::new(4);
        let g = Gfid([4; 16]);
        table.entry(g);
        table.evict(g);
        assert!(table.peek(g).is_none());
    }

    #[test]
    fn ctx_clear_info_resets_versions() {
        let table = InodeTable::new(4);
        let entry = table.entry(Gfid([5; 16]));
        let mut ctx = entry.ctx.lock();
        ctx.post_version = [3, 1];
        ctx.have_version = true;
        ctx.set_size(100);
        ctx.clear_info();
        assert!(!ctx.have_version && !ctx.have_size && !ctx.have_info);
        assert_eq!(ctx.post_version, [0, 0]);
        assert_eq!(ctx.cached_size(), None);
    }
}
