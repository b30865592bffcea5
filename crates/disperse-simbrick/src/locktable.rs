//! Advisory lock table: exclusive write locks keyed by (domain, inode)
//! or (domain, inode, basename), with blocking waits and per-domain
//! counts so the translator can observe contention.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use disperse_core::types::{Errno, Gfid};

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct LockKey {
    pub domain: String,
    pub gfid: Gfid,
    /// Set for entry locks.
    pub basename: Option<String>,
}

#[derive(Debug, Default)]
struct LockSlot {
    /// Owner token and re-entry depth.
    holder: Option<(u64, u32)>,
    waiters: u32,
}

#[derive(Default)]
struct TableState {
    slots: HashMap<LockKey, LockSlot>,
}

/// The brick's advisory lock table.
#[derive(Default)]
pub(crate) struct LockTable {
    state: Mutex<TableState>,
    cond: Condvar,
}

pub(crate) type SharedLockTable = Arc<LockTable>;

impl LockTable {
    pub fn new() -> SharedLockTable {
        Arc::new(LockTable::default())
    }

    /// Acquire the lock, blocking when `wait` is set. A non-blocking
    /// attempt on a held lock reports EAGAIN.
    pub fn lock(&self, key: LockKey, owner: u64, wait: bool) -> Result<(), Errno> {
        enum Attempt {
            Acquired,
            Busy,
            Queued,
        }

        let mut state = self.state.lock();
        loop {
            let attempt = {
                let slot = state.slots.entry(key.clone()).or_default();
                match &mut slot.holder {
                    None => {
                        slot.holder = Some((owner, 1));
                        Attempt::Acquired
                    }
                    Some((held_by, depth)) if *held_by == owner => {
                        *depth += 1;
                        Attempt::Acquired
                    }
                    Some(_) if !wait => Attempt::Busy,
                    Some(_) => {
                        slot.waiters += 1;
                        Attempt::Queued
                    }
                }
            };
            match attempt {
                Attempt::Acquired => return Ok(()),
                Attempt::Busy => return Err(libc::EAGAIN),
                Attempt::Queued => {
                    self.cond.wait(&mut state);
                    let slot = state.slots.entry(key.clone()).or_default();
                    slot.waiters = slot.waiters.saturating_sub(1);
                }
            }
        }
    }

    /// Release one level of the lock held by `owner`.
    pub fn unlock(&self, key: &LockKey, owner: u64) -> Result<(), Errno> {
        let mut state = self.state.lock();
        let Some(slot) = state.slots.get_mut(key) else {
            return Err(libc::EINVAL);
        };
        match &mut slot.holder {
            Some((held_by, depth)) if *held_by == owner => {
                *depth -= 1;
                if *depth == 0 {
                    slot.holder = None;
                    if slot.waiters == 0 {
                        state.slots.remove(key);
                    }
                }
            }
            _ => return Err(libc::EINVAL),
        }
        drop(state);
        self.cond.notify_all();
        Ok(())
    }

    /// Granted + queued locks for an inode within a domain. This is what
    /// contention detection reads.
    pub fn count(&self, domain: &str, gfid: Gfid) -> u32 {
        let state = self.state.lock();
        state
            .slots
            .iter()
            .filter(|(key, _)| key.domain == domain && key.gfid == gfid)
            .map(|(_, slot)| u32::from(slot.holder.is_some()) + slot.waiters)
            .sum()
    }

    /// Drop every lock (brick restart).
    pub fn clear(&self) {
        self.state.lock().slots.clear();
        self.cond.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn key(gfid: u8) -> LockKey {
        LockKey {
            domain: "vol".to_string(),
            gfid: Gfid([gfid; 16]),
            basename: None,
        }
    }

    #[test]
    fn exclusive_and_reentrant() {
        let table = LockTable::new();
        table.lock(key(1), 10, false).unwrap();
        table.lock(key(1), 10, false).unwrap();
        assert_eq!(table.lock(key(1), 11, false), Err(libc::EAGAIN));
        table.unlock(&key(1), 10).unwrap();
        assert_eq!(table.lock(key(1), 11, false), Err(libc::EAGAIN));
        table.unlock(&key(1), 10).unwrap();
        table.lock(key(1), 11, false).unwrap();
    }

    #[test]
    fn count_includes_waiters() {
        let table = LockTable::new();
        table.lock(key(2), 1, false).unwrap();
        assert_eq!(table.count("vol", Gfid([2; 16])), 1);

        let t2 = Arc::clone(&table);
        let waiter = std::thread::spawn(move || t2.lock(key(2), 2, true));
        // Give the waiter time to queue.
        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(table.count("vol", Gfid([2; 16])), 2);

        table.unlock(&key(2), 1).unwrap();
        waiter.join().unwrap().unwrap();
        assert_eq!(table.count("vol", Gfid([2; 16])), 1);
        table.unlock(&key(2), 2).unwrap();
        assert_eq!(table.count("vol", Gfid([2; 16])), 0);
    }

    #[test]
    fn domains_are_independent() {
        let table = LockTable::new();
        table.lock(key(3), 1, false).unwrap();
        let other = LockKey {
            domain: "vol:self-heal".to_string(),
            gfid: Gfid([3; 16]),
            basename: None,
        };
        table.lock(other, 2, false).unwrap();
        assert_eq!(table.count("vol", Gfid([3; 16])), 1);
        assert_eq!(table.count("vol:self-heal", Gfid([3; 16])), 1);
    }

    #[test]
    fn unlock_by_stranger_fails() {
        let table = LockTable::new();
        table.lock(key(4), 1, false).unwrap();
        assert_eq!(table.unlock(&key(4), 9), Err(libc::EINVAL));
    }
}
