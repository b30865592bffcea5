//! The fop engine: shared volume state, child selection, the four
//! dispatch shapes, quorum evaluation and answer preparation.
//!
//! Sub-operations run synchronously through the brick trait on the
//! caller's thread; each reply is grouped immediately, so the quorum
//! decision falls out of the final group list exactly as it would from
//! asynchronous completion counting.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};

use parking_lot::{Condvar, Mutex};

use disperse_codec::FragmentCodec;

use crate::brick::Brick;
use crate::cbk::{Answers, Cbk, Group, Reply};
use crate::combine;
use crate::config::{EcGeometry, ReadPolicy, VolumeOptions};
use crate::errors::is_recoverable;
use crate::fop::{Fop, FopKind, Minimum, ParentScope};
use crate::heal::HealQueue;
use crate::inode::InodeTable;
use crate::mask::BrickMask;
use crate::timer::Scheduler;
use crate::types::{Errno, Gfid};
use crate::xdata::Xdata;

/// Shared state of one dispersed volume.
pub(crate) struct Core {
    pub name: String,
    pub opts: VolumeOptions,
    pub geom: EcGeometry,
    pub codec: Arc<dyn FragmentCodec>,
    pub bricks: Vec<Arc<dyn Brick>>,
    pub node_mask: BrickMask,
    up: AtomicU64,
    rr: AtomicUsize,
    pub inodes: InodeTable,
    pub scheduler: Scheduler,
    pub heal: HealQueue,
    pub shutdown: AtomicBool,
    next_fop_id: AtomicU64,
    pending: Mutex<u64>,
    pending_cond: Condvar,
}

impl Core {
    pub fn new(
        name: &str,
        opts: VolumeOptions,
        codec: Arc<dyn FragmentCodec>,
        bricks: Vec<Arc<dyn Brick>>,
    ) -> Arc<Self> {
        let nodes = bricks.len();
        debug_assert_eq!(nodes, usize::from(opts.nodes));
        let geom = EcGeometry::new(opts.nodes, opts.redundancy);
        let heal = HealQueue::new(opts.background_heals, opts.heal_wait_qlen);
        Arc::new(Core {
            name: name.to_string(),
            geom,
            codec,
            node_mask: BrickMask::all(nodes),
            up: AtomicU64::new(BrickMask::all(nodes).0),
            rr: AtomicUsize::new(0),
            inodes: InodeTable::new(opts.stripe_cache as usize),
            scheduler: Scheduler::new(),
            heal,
            shutdown: AtomicBool::new(false),
            next_fop_id: AtomicU64::new(1),
            pending: Mutex::new(0),
            pending_cond: Condvar::new(),
            opts,
            bricks,
        })
    }

    // -- brick availability ------------------------------------------------

    pub fn up_mask(&self) -> BrickMask {
        BrickMask(self.up.load(Ordering::Acquire))
    }

    pub fn set_brick_up(&self, idx: usize, up: bool) {
        let bit = 1u64 << idx;
        if up {
            self.up.fetch_or(bit, Ordering::AcqRel);
        } else {
            self.up.fetch_and(!bit, Ordering::AcqRel);
        }
    }

    // -- fop bookkeeping ---------------------------------------------------

    pub fn new_fop(
        &self,
        kind: FopKind,
        flags: u32,
        target: BrickMask,
        minimum: Minimum,
    ) -> Fop {
        let id = self.next_fop_id.fetch_add(1, Ordering::Relaxed);
        Fop::new(id, kind, flags, target, minimum)
    }

    /// A sub-operation of `parent`, running on the parent's brick scope
    /// unless it is internal cleanup traffic.
    pub fn child_fop(
        &self,
        parent: &Fop,
        kind: FopKind,
        target: BrickMask,
        minimum: Minimum,
        internal: bool,
    ) -> Fop {
        let mut fop = self.new_fop(kind, 0, target, minimum);
        fop.parent = Some(ParentScope {
            mask: parent.mask,
            healing: parent.healing,
            internal,
        });
        fop.internal = internal;
        fop.gfid = parent.gfid;
        fop
    }

    /// Track in-flight fops so shutdown can drain them.
    pub fn fop_begin(&self) {
        *self.pending.lock() += 1;
    }

    pub fn fop_end(&self) {
        let mut pending = self.pending.lock();
        *pending -= 1;
        if *pending == 0 {
            self.pending_cond.notify_all();
        }
    }

    /// Wait until every in-flight fop has finished, bounded by the
    /// shutdown timeout. Returns false on timeout.
    pub fn drain_pending(&self, timeout: std::time::Duration) -> bool {
        let deadline = std::time::Instant::now() + timeout;
        let mut pending = self.pending.lock();
        while *pending > 0 {
            if self
                .pending_cond
                .wait_until(&mut pending, deadline)
                .timed_out()
            {
                return *pending == 0;
            }
        }
        true
    }

    // -- child selection ---------------------------------------------------

    /// Volume-wide quorum gate: refuse early when fewer than K bricks are
    /// reachable, except for cleanup traffic that must always wind.
    pub fn check_global_quorum(&self, internal: bool) -> Result<(), Errno> {
        if internal {
            return Ok(());
        }
        if self.up_mask().count() < self.geom.fragments {
            return Err(libc::ENOTCONN);
        }
        Ok(())
    }

    fn select_first(&self, fop: &Fop) -> usize {
        match self.opts.read_policy {
            ReadPolicy::RoundRobin => self.rr.fetch_add(1, Ordering::Relaxed) % self.geom.nodes,
            ReadPolicy::GfidHash => fop.gfid.hash() as usize % self.geom.nodes,
        }
    }

    /// Pick the bricks a fop will run on and resolve its minimum.
    /// On refusal, the fop error is set and false returned.
    fn child_select(&self, fop: &mut Fop) -> bool {
        fop.mask &= self.node_mask;

        if let Some(parent) = fop.parent
            && !fop.internal
        {
            fop.mask &= parent.mask & !parent.healing;
        }

        let up = self.up_mask();
        if !(fop.mask & !up).is_empty() {
            log::warn!(
                "{}: executing {:?} with some bricks unavailable ({})",
                self.name,
                fop.kind,
                fop.mask & !up
            );
            fop.mask &= up;
        }

        fop.resolved_min = match fop.minimum {
            Minimum::All => {
                let num = fop.mask.count();
                if num >= self.geom.fragments {
                    num
                } else {
                    self.geom.fragments
                }
            }
            Minimum::Min => self.geom.fragments,
            Minimum::One => 1,
        };

        fop.first = self.select_first(fop);

        // Healing bricks always receive side-effect traffic.
        fop.mask |= fop.healing;
        fop.remaining = fop.mask;
        fop.received = BrickMask::EMPTY;
        fop.good = BrickMask::EMPTY;

        let num = fop.mask.count();
        if num < fop.resolved_min && num < self.geom.fragments && !fop.internal {
            log::error!(
                "{}: insufficient bricks for {:?} (have {}, need {})",
                self.name,
                fop.kind,
                num,
                fop.resolved_min
            );
            fop.set_error(libc::ENOTCONN);
            return false;
        }
        if num == 0 {
            fop.set_error(libc::ENOTCONN);
            return false;
        }
        true
    }

    // -- dispatch ----------------------------------------------------------

    fn wind_one<R: Reply>(
        &self,
        fop: &mut Fop,
        answers: &mut Answers<R>,
        idx: usize,
        merge: &impl Fn(&mut R, &R) -> bool,
        wind: &impl Fn(usize) -> Result<R, Errno>,
    ) {
        fop.remaining.clear(idx);
        fop.received.set(idx);
        let result = wind(idx);
        answers.insert(Cbk { idx, result }, combine::xdata_compatible, merge);
    }

    /// Run one dispatch pass over the selected bricks. The answer (if
    /// any) is the head group; `prepare_answer` extracts it.
    pub fn dispatch<R: Reply>(
        &self,
        fop: &mut Fop,
        shape: Shape,
        merge: impl Fn(&mut R, &R) -> bool,
        wind: impl Fn(usize) -> Result<R, Errno>,
    ) -> Answers<R> {
        let mut answers = Answers::new();
        if fop.failed() || !self.child_select(fop) {
            return answers;
        }

        match shape {
            Shape::All => {
                fop.expected = fop.remaining.count();
                let targets: Vec<usize> = fop.remaining.iter().collect();
                for idx in targets {
                    self.wind_one(fop, &mut answers, idx, &merge, &wind);
                }
            }
            Shape::Min => {
                let k = self.geom.fragments;
                fop.expected = k;
                let mut idx = fop.first;
                for _ in 0..k.min(fop.remaining.count()) {
                    let Some(next) = fop.remaining.next_wrapping(idx, self.geom.nodes) else {
                        break;
                    };
                    self.wind_one(fop, &mut answers, next, &merge, &wind);
                    idx = (next + 1) % self.geom.nodes;
                }
            }
            Shape::One => {
                fop.expected = 1;
                if let Some(idx) = fop.remaining.next_wrapping(fop.first, self.geom.nodes) {
                    self.wind_one(fop, &mut answers, idx, &merge, &wind);
                }
            }
            Shape::Inc => {
                fop.expected = fop.remaining.count();
                let mut idx = 0;
                while let Some(next) = fop.remaining.next_wrapping(idx, self.geom.nodes) {
                    self.wind_one(fop, &mut answers, next, &merge, &wind);
                    if answers
                        .pick(fop.healing, fop.resolved_min)
                        .is_some()
                    {
                        break;
                    }
                    idx = (next + 1) % self.geom.nodes;
                }
            }
        }

        if let Some(head) = answers.pick(fop.healing, fop.resolved_min) {
            fop.good = head.mask;
        }
        answers
    }

    /// Choose and extract the final answer. Returns None (with the fop
    /// error set) when no group reached quorum.
    pub fn prepare_answer<R: Reply>(
        &self,
        fop: &mut Fop,
        mut answers: Answers<R>,
    ) -> Option<FinalAnswer<R>> {
        if answers.pick(fop.healing, fop.resolved_min).is_none() {
            log::warn!(
                "{}: answers of {:?} diverged below quorum ({} groups, need {})",
                self.name,
                fop.kind,
                answers.groups.len(),
                fop.resolved_min
            );
            fop.set_error(libc::EIO);
            return None;
        }

        let group = answers.take_head().expect("picked head exists");
        if let Some(errno) = group.errno() {
            fop.set_error(errno);
        }
        Some(FinalAnswer::from_group(group, self.geom.fragments))
    }

    /// Like `prepare_answer`, additionally merging the xattr dictionaries
    /// of the whole group (pathinfo concatenation, lockinfo union, count
    /// maxima) into the representative reply.
    pub fn prepare_answer_xattrs(
        &self,
        fop: &mut Fop,
        mut answers: Answers<crate::brick::XattrReply>,
    ) -> Option<FinalAnswer<crate::brick::XattrReply>> {
        if answers.pick(fop.healing, fop.resolved_min).is_none() {
            fop.set_error(libc::EIO);
            return None;
        }
        let group = answers.take_head().expect("picked head exists");
        if let Some(errno) = group.errno() {
            fop.set_error(errno);
        }
        let merged = combine::combine_group_dicts(&group, self.geom.fragments, |r| &r.xattrs);
        let mut answer = FinalAnswer::from_group(group, self.geom.fragments);
        if let Ok(rep) = answer.result.as_mut() {
            rep.xattrs = merged;
        }
        Some(answer)
    }

    /// One-shot retry loop for single-brick read ops: a recoverable
    /// failure masks the brick off and asks the next one.
    pub fn dispatch_one_retry<R: Reply>(
        &self,
        fop: &mut Fop,
        merge: impl Fn(&mut R, &R) -> bool,
        wind: impl Fn(usize) -> Result<R, Errno>,
    ) -> Option<FinalAnswer<R>> {
        loop {
            let answers = self.dispatch(fop, Shape::One, &merge, &wind);
            let answer = self.prepare_answer(fop, answers)?;
            match &answer.result {
                Err(errno) if is_recoverable(*errno) => {
                    let failed = answer.mask;
                    let rest = fop.mask & !failed;
                    if rest.is_empty() {
                        return Some(answer);
                    }
                    log::debug!(
                        "{}: retrying {:?} away from bricks {} (errno {})",
                        self.name,
                        fop.kind,
                        failed,
                        errno
                    );
                    fop.mask = rest;
                    fop.error = None;
                }
                _ => return Some(answer),
            }
        }
    }

    /// Did some reachable brick answer outside the good set, and should
    /// the touched locations be healed in the background.
    pub fn fop_needs_heal(&self, fop: &Fop) -> bool {
        combine::needs_heal(self.up_mask(), fop.remaining, fop.good)
    }
}

impl Core {
    /// Identify the inode whose lock decides iatt trustworthiness.
    pub fn iatt_trusted(&self, fop: &Fop, gfid: Gfid) -> bool {
        if fop.kind == FopKind::Lookup {
            return true;
        }
        fop.locks.iter().any(|l| l.gfid == gfid)
    }
}

/// Dispatch shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Shape {
    /// Every brick in the selected mask.
    All,
    /// One more brick per round until the quorum group forms.
    Inc,
    /// Exactly K bricks starting at `first`.
    Min,
    /// Exactly one brick at `first`.
    One,
}

/// The extracted answer of a fop.
#[derive(Debug)]
pub(crate) struct FinalAnswer<R> {
    pub result: Result<R, Errno>,
    /// Dictionary merged across the whole answer group.
    pub xdata: Xdata,
    pub mask: BrickMask,
    pub count: usize,
    pub min_idx: usize,
    /// The representative's brick index.
    pub idx: usize,
    /// The rest of the answer group (readv needs every fragment).
    pub others: Vec<Cbk<R>>,
}

impl<R: Reply> FinalAnswer<R> {
    fn from_group(mut group: Group<R>, fragments: usize) -> Self {
        let xdata = combine::combine_group_xdata(&group, fragments);
        let mask = group.mask;
        let count = group.count;
        let min_idx = group.min_idx();
        let rep = group.cbks.remove(0);
        FinalAnswer {
            result: rep.result,
            xdata,
            mask,
            count,
            min_idx,
            idx: rep.idx,
            others: group.cbks,
        }
    }

    pub fn errno(&self) -> Option<Errno> {
        self.result.as_ref().err().copied()
    }

    pub fn is_success(&self) -> bool {
        self.result.is_ok()
    }
}
