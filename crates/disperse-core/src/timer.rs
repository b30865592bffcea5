//! Delayed-work scheduler.
//!
//! Delayed lock releases are messages to this scheduler rather than bare
//! timers calling back into lock code. Cancellation is a compare-and-swap
//! on the handle: whoever wins the CAS (canceller or the firing thread)
//! owns the outcome, so the classic cancel-vs-fire race has exactly two
//! clean resolutions.

use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering as AtomicOrdering};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

const STATE_PENDING: u8 = 0;
const STATE_CANCELLED: u8 = 1;
const STATE_FIRING: u8 = 2;

#[derive(Debug)]
struct TimerSlot {
    state: AtomicU8,
}

/// Cancellable handle to a scheduled task.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    slot: Arc<TimerSlot>,
}

impl TimerHandle {
    /// Try to cancel. True when the task will not run; false when the
    /// firing thread already claimed it.
    pub fn cancel(&self) -> bool {
        self.slot
            .state
            .compare_exchange(
                STATE_PENDING,
                STATE_CANCELLED,
                AtomicOrdering::AcqRel,
                AtomicOrdering::Acquire,
            )
            .is_ok()
    }

    /// Identity comparison, used to recognise a stale handle.
    pub fn same_as(&self, other: &TimerHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

struct Entry {
    at: Instant,
    seq: u64,
    slot: Arc<TimerSlot>,
    task: Box<dyn FnOnce() + Send>,
}

impl PartialEq for Entry {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}
impl Eq for Entry {}
impl PartialOrd for Entry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Entry {
    fn cmp(&self, other: &Self) -> Ordering {
        // BinaryHeap is a max-heap; reverse so the earliest deadline wins.
        other.at.cmp(&self.at).then(other.seq.cmp(&self.seq))
    }
}

struct SchedState {
    queue: BinaryHeap<Entry>,
    next_seq: u64,
    stopping: bool,
}

struct SchedInner {
    state: Mutex<SchedState>,
    cond: Condvar,
    started: AtomicBool,
}

/// One background thread draining a deadline queue.
pub struct Scheduler {
    inner: Arc<SchedInner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub fn new() -> Self {
        Scheduler {
            inner: Arc::new(SchedInner {
                state: Mutex::new(SchedState {
                    queue: BinaryHeap::new(),
                    next_seq: 0,
                    stopping: false,
                }),
                cond: Condvar::new(),
                started: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Run `task` after `delay` unless the handle is cancelled first.
    pub fn schedule(&self, delay: Duration, task: impl FnOnce() + Send + 'static) -> TimerHandle {
        self.ensure_thread();

        let slot = Arc::new(TimerSlot {
            state: AtomicU8::new(STATE_PENDING),
        });
        let handle = TimerHandle {
            slot: Arc::clone(&slot),
        };

        let mut state = self.inner.state.lock();
        let seq = state.next_seq;
        state.next_seq += 1;
        state.queue.push(Entry {
            at: Instant::now() + delay,
            seq,
            slot,
            task: Box::new(task),
        });
        drop(state);
        self.inner.cond.notify_one();

        handle
    }

    fn ensure_thread(&self) {
        if self.inner.started.load(AtomicOrdering::Acquire) {
            return;
        }
        let mut guard = self.thread.lock();
        if self.inner.started.load(AtomicOrdering::Acquire) {
            return;
        }
        let inner = Arc::clone(&self.inner);
        *guard = Some(
            std::thread::Builder::new()
                .name("disperse-timer".to_string())
                .spawn(move || run_loop(inner))
                .expect("spawning the timer thread"),
        );
        self.inner.started.store(true, AtomicOrdering::Release);
    }

    /// Stop the thread. Pending tasks are dropped without running.
    pub fn stop(&self) {
        {
            let mut state = self.inner.state.lock();
            state.stopping = true;
        }
        self.inner.cond.notify_all();
        if let Some(t) = self.thread.lock().take() {
            let _ = t.join();
        }
    }
}

impl Default for Scheduler {
    fn default() -> Self {
        Self::new()
    }
}

fn run_loop(inner: Arc<SchedInner>) {
    let mut state = inner.state.lock();
    loop {
        if state.stopping {
            return;
        }
        let now = Instant::now();
        match state.queue.peek() {
            None => {
                inner.cond.wait(&mut state);
            }
            Some(entry) if entry.at > now => {
                let at = entry.at;
                inner.cond.wait_until(&mut state, at);
            }
            Some(_) => {
                let entry = state.queue.pop().expect("peeked entry");
                drop(state);
                let claimed = entry
                    .slot
                    .state
                    .compare_exchange(
                        STATE_PENDING,
                        STATE_FIRING,
                        AtomicOrdering::AcqRel,
                        AtomicOrdering::Acquire,
                    )
                    .is_ok();
                if claimed {
                    (entry.task)();
                }
                state = inner.state.lock();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    #[test]
    fn scheduled_task_runs() {
        let sched = Scheduler::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        sched.schedule(Duration::from_millis(10), move || {
            h.fetch_add(1, AtomicOrdering::SeqCst);
        });
        std::thread::sleep(Duration::from_millis(100));
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 1);
        sched.stop();
    }

    #[test]
    fn cancelled_task_does_not_run() {
        let sched = Scheduler::new();
        let hits = Arc::new(AtomicU32::new(0));
        let h = Arc::clone(&hits);
        let handle = sched.schedule(Duration::from_millis(50), move || {
            h.fetch_add(1, AtomicOrdering::SeqCst);
        });
        assert!(handle.cancel());
        std::thread::sleep(Duration::from_millis(120));
        assert_eq!(hits.load(AtomicOrdering::SeqCst), 0);
        sched.stop();
    }

    #[test]
    fn cancel_after_fire_loses() {
        let sched = Scheduler::new();
        let handle = sched.schedule(Duration::from_millis(5), || {});
        std::thread::sleep(Duration::from_millis(80));
        assert!(!handle.cancel());
        sched.stop();
    }

    #[test]
    fn tasks_fire_in_deadline_order() {
        let sched = Scheduler::new();
        let order = Arc::new(Mutex::new(Vec::new()));
        for (delay, tag) in [(60u64, 3), (20, 1), (40, 2)] {
            let o = Arc::clone(&order);
            sched.schedule(Duration::from_millis(delay), move || {
                o.lock().push(tag);
            });
        }
        std::thread::sleep(Duration::from_millis(200));
        assert_eq!(*order.lock(), vec![1, 2, 3]);
        sched.stop();
    }

    #[test]
    fn handle_identity() {
        let sched = Scheduler::new();
        let a = sched.schedule(Duration::from_secs(10), || {});
        let b = sched.schedule(Duration::from_secs(10), || {});
        assert!(a.same_as(&a.clone()));
        assert!(!a.same_as(&b));
        a.cancel();
        b.cancel();
        sched.stop();
    }
}
