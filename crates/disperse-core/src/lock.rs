//! The inode-scoped distributed lock manager.
//!
//! One lock exists per inode. Fops become owners of it, possibly several
//! at once when all are shared; an acquired lock is kept for a short
//! window after the last owner leaves (eager locking) so the next fop on
//! the same inode reuses it without brick traffic. Contention evidence in
//! any reply flips the lock to release-as-soon-as-possible, and fops
//! arriving while a release is in progress freeze until the next
//! acquire/release cycle.
//!
//! Waiting is a condvar wait on the inode entry; the delayed release is a
//! message to the scheduler, cancelled by CAS when a new fop takes over.

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::brick::XattropOp;
use crate::engine::{Core, Shape};
use crate::fop::{
    Fop, FopKind, LOCK_INODE_SIZE, LOCK_QUERY_INFO, LOCK_UPDATE_DATA, LOCK_UPDATE_META, LockLink,
    Minimum,
};
use crate::inode::InodeEntry;
use crate::mask::BrickMask;
use crate::ondisk::{
    self, TXN_DATA, TXN_METADATA, XATTR_CONFIG, XATTR_DIRTY, XATTR_SIZE, XATTR_VERSION,
};
use crate::timer::TimerHandle;
use crate::types::{Errno, FdHandle, FileType, Flock, FlockType, Gfid, Loc};
use crate::xdata::{Xdata, keys};

/// Brick-side lock owner tokens. Process-global so that several volume
/// instances over the same bricks can never collide on an owner.
static NEXT_LOCK_TOKEN: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_lock_token() -> u64 {
    NEXT_LOCK_TOKEN.fetch_add(1, Ordering::Relaxed)
}

/// State of the single lock attached to an inode context.
#[derive(Debug)]
pub(crate) struct LockState {
    /// Brick-side lock owner token.
    pub lock_id: u64,
    pub acquired: bool,
    pub release: bool,
    pub getting_xattr: bool,
    pub query: bool,
    pub exclusive: bool,
    pub refs_owners: u32,
    pub refs_pending: u32,
    /// (fop id, shared) of current owners.
    pub owners: Vec<(u64, bool)>,
    pub waiting: VecDeque<(u64, bool)>,
    pub frozen: VecDeque<(u64, bool)>,
    pub mask: BrickMask,
    pub good_mask: BrickMask,
    pub healing: BrickMask,
    pub timer: Option<TimerHandle>,
    pub timer_gen: u64,
    pub fd: Option<FdHandle>,
}

impl LockState {
    pub fn new(lock_id: u64) -> Self {
        LockState {
            lock_id,
            acquired: false,
            release: false,
            getting_xattr: false,
            query: false,
            exclusive: false,
            refs_owners: 0,
            refs_pending: 0,
            owners: Vec::new(),
            waiting: VecDeque::new(),
            frozen: VecDeque::new(),
            mask: BrickMask::EMPTY,
            good_mask: !BrickMask::EMPTY,
            healing: BrickMask::EMPTY,
            timer: None,
            timer_gen: 0,
            fd: None,
        }
    }

    fn is_owner(&self, fop_id: u64) -> bool {
        self.owners.iter().any(|(id, _)| *id == fop_id)
    }

    fn remove_owner(&mut self, fop_id: u64) {
        self.owners.retain(|(id, _)| *id != fop_id);
    }

    /// Promote waiters to owners: any run of shared fops, or a single
    /// fop when the lock is unacquired or the head is exclusive.
    fn wake_shared(&mut self) {
        loop {
            let Some(&(id, shared)) = self.waiting.front() else {
                break;
            };
            let mut single = !self.acquired;
            if !shared {
                single = true;
                self.exclusive = true;
            }
            if single && !self.owners.is_empty() {
                break;
            }
            self.waiting.pop_front();
            self.owners.push((id, shared));
            self.refs_owners += 1;
            if single {
                break;
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Lock preparation
// ---------------------------------------------------------------------------

fn prepare(
    core: &Core,
    fop: &mut Fop,
    gfid: Gfid,
    flags: u32,
    fd: Option<FdHandle>,
    base: Option<Loc>,
) {
    if fop.parent.is_some() || fop.failed() {
        return;
    }
    if gfid.is_null() {
        log::error!("{}: trying to lock an unresolved inode", core.name);
        fop.set_error(libc::EINVAL);
        return;
    }

    let entry = core.inodes.entry(gfid);
    let mut ctx = entry.ctx.lock();

    // A second preparation against the same inode merges into the first
    // link (renames within one directory).
    if let Some(link) = fop.locks.iter_mut().find(|l| l.gfid == gfid) {
        link.update[TXN_DATA] |= flags & LOCK_UPDATE_DATA != 0;
        link.update[TXN_METADATA] |= flags & LOCK_UPDATE_META != 0;
        if base.is_some() {
            link.base = base;
        }
        if let Some(lk) = ctx.lock.as_mut() {
            lk.query |= flags & LOCK_QUERY_INFO != 0;
        }
        return;
    }

    if ctx.lock.is_none() {
        ctx.lock = Some(LockState::new(next_lock_token()));
    }
    let lk = ctx.lock.as_mut().expect("lock just ensured");
    lk.query |= flags & LOCK_QUERY_INFO != 0;
    lk.refs_pending += 1;

    if fop.locks.is_empty() {
        // Ask the bricks for lock-domain counts on the main answers so
        // contention can be detected at reuse time.
        fop.want_lock_count = true;
    } else if fop.locks[0].gfid < gfid {
        fop.first_lock = fop.locks.len();
    }

    fop.locks.push(LockLink {
        gfid,
        update: [
            flags & LOCK_UPDATE_DATA != 0,
            flags & LOCK_UPDATE_META != 0,
        ],
        base,
        size: None,
        fd,
    });
}

pub(crate) fn lock_prepare_inode(core: &Core, fop: &mut Fop, loc: &Loc, flags: u32) {
    prepare(core, fop, loc.gfid, flags, None, None);
}

pub(crate) fn lock_prepare_parent_inode(
    core: &Core,
    fop: &mut Fop,
    loc: &Loc,
    base: Option<Loc>,
    mut flags: u32,
) {
    if fop.failed() {
        return;
    }
    let Some(parent) = loc.parent else {
        fop.set_error(libc::EINVAL);
        return;
    };
    let base = if flags & LOCK_INODE_SIZE != 0 {
        flags ^= LOCK_INODE_SIZE;
        base
    } else {
        None
    };
    prepare(core, fop, parent, flags, None, base);
}

pub(crate) fn lock_prepare_fd(core: &Core, fop: &mut Fop, fd: &FdHandle, flags: u32) {
    prepare(core, fop, fd.gfid, flags, Some(*fd), None);
}

// ---------------------------------------------------------------------------
// Ownership assignment
// ---------------------------------------------------------------------------

/// Block until this fop owns the lock of `link`. Handles frozen queueing,
/// delayed-release takeover and shared/exclusive batching.
fn assign_owner(fop: &Fop, link: &LockLink, entry: &Arc<InodeEntry>) {
    let mut ctx = entry.ctx.lock();
    ctx.lock.as_mut().expect("prepared lock").refs_pending -= 1;

    let mut queued = false;
    loop {
        let lk = ctx.lock.as_mut().expect("lock lives while fops reference it");

        if lk.is_owner(fop.id) {
            break;
        }
        if queued {
            entry.cond.wait(&mut ctx);
            continue;
        }
        if lk.release {
            // Everything arriving while a release is in flight waits for
            // the next acquire cycle.
            lk.frozen.push_back((fop.id, fop.shared()));
            queued = true;
            entry.cond.wait(&mut ctx);
            continue;
        }

        if let Some(timer) = lk.timer.take() {
            // Delayed-unlock pending: take it over. Winning the cancel
            // race inherits the timer's owner reference; losing it means
            // the callback is already waiting on this mutex and will see
            // the cleared slot.
            if timer.cancel() {
                lk.refs_owners -= 1;
            }
        }

        if !fop.shared() {
            lk.exclusive = true;
        }

        if !lk.owners.is_empty() && (!lk.acquired || lk.exclusive) {
            lk.waiting.push_back((fop.id, fop.shared()));
            queued = true;
            entry.cond.wait(&mut ctx);
            continue;
        }

        lk.owners.push((fop.id, fop.shared()));
        lk.refs_owners += 1;
        break;
    }

    if let Some(fd) = link.fd {
        let lk = ctx.lock.as_mut().expect("owner holds the lock");
        if lk.fd.is_none() {
            lk.fd = Some(fd);
        }
    }
}

/// Issue the brick-side lock if this owner is the first of a cycle.
fn acquire(core: &Arc<Core>, fop: &mut Fop, link: &LockLink, entry: &Arc<InodeEntry>) -> Result<(), Errno> {
    let (needs_acquire, lock_id) = {
        let ctx = entry.ctx.lock();
        let lk = ctx.lock.as_ref().expect("owner holds the lock");
        (!lk.acquired, lk.lock_id)
    };

    if needs_acquire {
        let loc = Loc::from_gfid(link.gfid);
        let flock = Flock::whole_file(FlockType::Write, lock_id);
        let mut child = core.child_fop(fop, FopKind::Inodelk, core.node_mask, Minimum::All, false);
        let answers = core.dispatch(&mut child, Shape::All, crate::ops::merge_empty, |idx| {
            core.bricks[idx].inodelk(
                &core.name,
                &loc,
                crate::brick::LockCmd::SetLkWait,
                &flock,
                &Xdata::new(),
            )
        });
        let answer = core.prepare_answer(&mut child, answers);
        match answer {
            Some(ans) if ans.is_success() => {
                let mut ctx = entry.ctx.lock();
                let lk = ctx.lock.as_mut().expect("owner holds the lock");
                lk.mask = ans.mask;
                lk.good_mask = ans.mask;
                lk.healing = BrickMask::EMPTY;
                lk.acquired = true;
                if fop.shared() {
                    lk.wake_shared();
                }
                entry.cond.notify_all();
            }
            other => {
                let errno = other
                    .and_then(|a| a.errno())
                    .or(child.error)
                    .unwrap_or(libc::EIO);
                log::warn!(
                    "{}: failed to acquire inode lock for {} (errno {})",
                    core.name,
                    link.gfid,
                    errno
                );
                fop.set_error(errno);
                return Err(errno);
            }
        }
    }
    Ok(())
}

/// Owner is in place and the lock is acquired: restrict the fop to the
/// good bricks and fetch size/version metadata if needed.
fn apply(core: &Arc<Core>, fop: &mut Fop, link_idx: usize, entry: &Arc<InodeEntry>) -> Result<(), Errno> {
    {
        let ctx = entry.ctx.lock();
        let lk = ctx.lock.as_ref().expect("owner holds the lock");
        fop.mask &= lk.good_mask;
    }
    get_size_version(core, fop, link_idx, entry)?;
    get_real_size(core, fop, link_idx);
    Ok(())
}

/// Acquire every lock the fop prepared, in gfid order.
///
/// Ownership is always taken on every prepared link, even after an
/// earlier link failed: the release path then unwinds all links the same
/// way regardless of where the fop stopped.
pub(crate) fn lock(core: &Arc<Core>, fop: &mut Fop) -> Result<(), Errno> {
    let order: Vec<usize> = fop.lock_order().collect();
    for link_idx in order {
        let link = fop.locks[link_idx].clone();
        let entry = core.inodes.entry(link.gfid);
        assign_owner(fop, &link, &entry);
        if fop.failed() {
            continue;
        }
        if acquire(core, fop, &link, &entry).is_err() {
            continue;
        }
        let _ = apply(core, fop, link_idx, &entry);
    }
    match fop.error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

// ---------------------------------------------------------------------------
// Size/version discovery
// ---------------------------------------------------------------------------

/// First owner of a lock cycle reads `VERSION`, `SIZE` and `CONFIG` and
/// marks `DIRTY`, all in one batched xattrop; later owners wait for it
/// and reuse the cached result.
fn get_size_version(
    core: &Arc<Core>,
    fop: &mut Fop,
    link_idx: usize,
    entry: &Arc<InodeEntry>,
) -> Result<(), Errno> {
    let link = fop.locks[link_idx].clone();

    let (need_query, set_dirty, dirty, file_type) = {
        let mut ctx = entry.ctx.lock();
        loop {
            let inner = &mut *ctx;
            let mut dirty = [0u64; 2];
            for t in [TXN_DATA, TXN_METADATA] {
                if link.update[t] && inner.dirty[t] == 0 {
                    dirty[t] = 1;
                }
            }
            let set_dirty = dirty != [0, 0];
            let have_info = inner.have_info;
            let file_type = inner.file_type;
            let lk = inner.lock.as_mut().expect("owner holds the lock");

            if have_info && !set_dirty {
                // Fast path: metadata already cached this cycle.
                if fop.kind.is_data_fop() {
                    fop.healing |= lk.healing;
                }
                fop.mask &= lk.good_mask;
                return Ok(());
            }
            if !set_dirty
                && !lk.query
                && matches!(file_type, Some(t) if !t.is_regular())
            {
                return Ok(());
            }
            if lk.getting_xattr {
                entry.cond.wait(&mut ctx);
                continue;
            }
            lk.getting_xattr = true;
            let need_query = lk.query && !have_info;
            break (need_query, set_dirty, dirty, file_type);
        }
    };

    let maybe_regular = !matches!(file_type, Some(t) if !t.is_regular());

    let mut deltas = Xdata::new();
    let mut req = Xdata::new();
    if need_query {
        deltas.set_bin(XATTR_VERSION, ondisk::encode_u64_pair([0, 0]).to_vec());
        if maybe_regular {
            deltas.set_bin(XATTR_SIZE, ondisk::encode_u64(0).to_vec());
            req.set_u32(XATTR_CONFIG, 0);
        }
    }
    if set_dirty {
        deltas.set_bin(XATTR_DIRTY, ondisk::encode_u64_pair(dirty).to_vec());
    }

    let result = xattrop_on_lock(core, fop, &link, fop.mask, fop.minimum, &deltas, &req);

    let mut ctx = entry.ctx.lock();
    let outcome = match &result {
        Ok(reply) => {
            let mut errno = 0;
            if need_query {
                errno = ingest_query_reply(core, &mut ctx, &reply.0, maybe_regular);
            }
            if errno == 0 {
                for t in [TXN_DATA, TXN_METADATA] {
                    if dirty[t] != 0 {
                        ctx.dirty[t] = 1;
                    }
                }
            }
            errno
        }
        Err(errno) => {
            log::warn!(
                "{}: failed to get size and version for {} (errno {})",
                core.name,
                link.gfid,
                errno
            );
            *errno
        }
    };

    let lk = ctx.lock.as_mut().expect("owner holds the lock");
    lk.getting_xattr = false;
    if outcome == 0 {
        // Only bricks that answered the xattrop stay eligible.
        let good = result.as_ref().map(|r| r.1).unwrap_or(BrickMask::EMPTY);
        lk.good_mask &= good;
        fop.mask &= good;
        if fop.kind.is_data_fop() {
            fop.healing |= lk.healing;
        }
    } else {
        fop.set_error(outcome);
    }
    entry.cond.notify_all();
    drop(ctx);

    if outcome == 0 { Ok(()) } else { Err(outcome) }
}

/// Parse the queried metadata into the inode context. Returns an errno on
/// corruption.
fn ingest_query_reply(
    core: &Core,
    ctx: &mut crate::inode::InodeCtx,
    reply: &crate::brick::XattrReply,
    maybe_regular: bool,
) -> Errno {
    let Some(version_raw) = reply.xattrs.get_bin(XATTR_VERSION) else {
        log::error!("{}: unable to get version xattr", core.name);
        return libc::EIO;
    };
    let Ok(version) = ondisk::decode_u64_pair(version_raw) else {
        return libc::EIO;
    };
    ctx.pre_version = version;
    ctx.post_version[0] += version[0];
    ctx.post_version[1] += version[1];
    ctx.have_version = true;

    if maybe_regular {
        match reply.xattrs.get_bin(XATTR_SIZE).map(ondisk::decode_u64) {
            Some(Ok(size)) => {
                ctx.pre_size = size;
                ctx.post_size = size;
                ctx.have_size = true;
            }
            Some(Err(_)) => return libc::EIO,
            None => {
                if matches!(ctx.file_type, Some(FileType::Regular)) {
                    log::error!("{}: unable to get size xattr", core.name);
                    return libc::EIO;
                }
            }
        }

        match reply.xdata.get_bin(XATTR_CONFIG).map(ondisk::ConfigRecord::decode) {
            Some(Ok(rec)) => {
                if !core.geom.config_matches(&rec) {
                    log::error!("{}: invalid config xattr", core.name);
                    return libc::EINVAL;
                }
                ctx.config = Some(rec);
                ctx.have_config = true;
            }
            Some(Err(_)) => return libc::EIO,
            None => {
                if matches!(ctx.file_type, Some(FileType::Regular)) {
                    log::error!("{}: unable to get config xattr", core.name);
                    return libc::EIO;
                }
            }
        }
    }
    ctx.have_info = true;
    0
}

/// Wind an xattrop (or fxattrop through the lock's fd) and return the
/// representative reply with the answering mask.
fn xattrop_on_lock(
    core: &Arc<Core>,
    fop: &Fop,
    link: &LockLink,
    mask: BrickMask,
    minimum: Minimum,
    deltas: &Xdata,
    req: &Xdata,
) -> Result<(crate::brick::XattrReply, BrickMask), Errno> {
    let loc = Loc::from_gfid(link.gfid);
    let mut child = core.child_fop(fop, FopKind::Xattrop, mask, minimum, true);
    let answers = core.dispatch(&mut child, Shape::All, crate::ops::merge_xattrs, |idx| {
        match link.fd {
            Some(fd) => core.bricks[idx].fxattrop(&fd, XattropOp::AddArray64, deltas, req),
            None => core.bricks[idx].xattrop(&loc, XattropOp::AddArray64, deltas, req),
        }
    });
    match core.prepare_answer(&mut child, answers) {
        Some(ans) => {
            let mask = ans.mask;
            match ans.result {
                Ok(reply) => Ok((reply, mask)),
                Err(e) => Err(e),
            }
        }
        None => Err(libc::EIO),
    }
}

/// Lock-free size discovery for entry fops (`link`, `rename`): a single
/// lookup answer carrying the size xattr fills the reply iatt.
fn get_real_size(core: &Arc<Core>, fop: &mut Fop, link_idx: usize) {
    let Some(base) = fop.locks[link_idx].base.clone() else {
        return;
    };
    if base.gfid.is_null() {
        return;
    }
    if let Some(entry) = core.inodes.peek(base.gfid) {
        let ctx = entry.ctx.lock();
        if let Some(size) = ctx.cached_size() {
            fop.locks[link_idx].size = Some(size);
            return;
        }
        if matches!(ctx.file_type, Some(t) if !t.is_regular()) {
            return;
        }
    }

    let mut req = Xdata::new();
    req.set_u64(XATTR_SIZE, 0);
    req.mark_internal();
    let mut child = core.child_fop(fop, FopKind::Lookup, fop.mask, Minimum::One, false);
    let answers = core.dispatch(&mut child, Shape::One, crate::ops::merge_lookup_weak, |idx| {
        core.bricks[idx].lookup(&base, &req)
    });
    if let Some(ans) = core.prepare_answer(&mut child, answers)
        && let Ok(reply) = ans.result
        && let Some(raw) = reply.xdata.get_bin(XATTR_SIZE)
        && let Ok(size) = ondisk::decode_u64(raw)
    {
        fop.locks[link_idx].size = Some(size);
    }
    // Any failure is ignored; the iatt simply keeps the brick view.
}

// ---------------------------------------------------------------------------
// Reuse, release
// ---------------------------------------------------------------------------

/// After REPORT: hand the lock to the next owner, detecting contention
/// from the answer's lock-domain count.
pub(crate) fn lock_reuse(core: &Arc<Core>, fop: &mut Fop, answer_xdata: Option<&Xdata>, success: bool) {
    let mut release = false;
    if core.opts.eager_lock && answer_xdata.is_some() {
        if let Some(count) = answer_xdata.and_then(|x| x.get_u32(keys::INODELK_COUNT))
            && count > 1
        {
            release = true;
            log::debug!("{}: lock contention detected on {}", core.name, fop.gfid);
        }
    } else {
        // Without eager locking (or without a quorum answer) the lock is
        // always released immediately.
        release = true;
    }

    for link_idx in 0..fop.locks.len() {
        next_owner(core, fop, link_idx, success, release);
    }
}

fn next_owner(core: &Arc<Core>, fop: &Fop, link_idx: usize, success: bool, release: bool) {
    let link = &fop.locks[link_idx];
    let entry = core.inodes.entry(link.gfid);
    let mut ctx = entry.ctx.lock();

    if success && !fop.failed() {
        for t in [TXN_DATA, TXN_METADATA] {
            if link.update[t] {
                ctx.post_version[t] += 1;
            }
        }
    }

    let expected = fop.expected;
    let good = fop.good | fop.remaining;
    let shared = fop.shared();
    let lk = ctx.lock.as_mut().expect("owner holds the lock");
    lk.remove_owner(fop.id);
    lk.release |= release;

    // Bricks that failed this fop stay bad until the lock is recycled.
    if expected != 1 {
        lk.good_mask &= good;
    }
    if !shared {
        lk.exclusive = false;
    }
    if lk.owners.is_empty() {
        lk.wake_shared();
    }
    entry.cond.notify_all();
}

/// Final fop departure from a lock: drop the ref, release now, or start
/// the delayed-release timer.
pub(crate) fn unlock(core: &Arc<Core>, fop: &mut Fop) {
    for link_idx in 0..fop.locks.len() {
        unlock_timer_add(core, fop, link_idx);
    }
}

fn unlock_timer_add(core: &Arc<Core>, fop: &Fop, link_idx: usize) {
    let link = &fop.locks[link_idx];
    let gfid = link.gfid;
    let entry = core.inodes.entry(gfid);
    let mut ctx = entry.ctx.lock();
    let shutting_down = core.shutdown.load(Ordering::Acquire);

    let needs_heal = core.fop_needs_heal(fop);
    let lk = ctx.lock.as_mut().expect("owner references the lock");
    lk.release |= needs_heal;

    if lk.refs_owners > 1 {
        // Other owners still running; just drop this reference.
        lk.refs_owners -= 1;
        return;
    }

    if lk.acquired {
        if !lk.release && !shutting_down {
            lk.timer_gen += 1;
            let r#gen = lk.timer_gen;
            let core2 = Arc::clone(core);
            let delay = Duration::from_millis(u64::from(core.opts.delayed_unlock_msec));
            let handle = core
                .scheduler
                .schedule(delay, move || unlock_timer_fired(&core2, gfid, r#gen));
            lk.timer = Some(handle);
            return;
        }
        lk.release = true;
        drop(ctx);
        unlock_now(core, &entry);
    } else {
        // Lock attempt failed earlier; nothing to release on the bricks.
        lk.release = true;
        drop(ctx);
        lock_unfreeze(&entry);
    }
}

fn unlock_timer_fired(core: &Arc<Core>, gfid: Gfid, r#gen: u64) {
    let Some(entry) = core.inodes.peek(gfid) else {
        return;
    };
    let mut ctx = entry.ctx.lock();
    let Some(lk) = ctx.lock.as_mut() else {
        return;
    };

    if lk.timer.is_some() && lk.timer_gen == r#gen {
        // Normal expiry: release the idle lock now.
        lk.timer = None;
        lk.release = true;
        drop(ctx);
        unlock_now(core, &entry);
        return;
    }

    // A fop cancelled the timer after it started firing and took over
    // ownership; this invocation only owns the stale reference.
    if lk.refs_owners > 1 {
        lk.refs_owners -= 1;
        return;
    }
    if lk.acquired {
        if !lk.release && !core.shutdown.load(Ordering::Acquire) {
            lk.timer_gen += 1;
            let r#gen = lk.timer_gen;
            let core2 = Arc::clone(core);
            let delay = Duration::from_millis(u64::from(core.opts.delayed_unlock_msec));
            let handle = core
                .scheduler
                .schedule(delay, move || unlock_timer_fired(&core2, gfid, r#gen));
            lk.timer = Some(handle);
            return;
        }
        lk.release = true;
        drop(ctx);
        unlock_now(core, &entry);
    } else {
        lk.release = true;
        drop(ctx);
        lock_unfreeze(&entry);
    }
}

/// Flush committed version/size deltas and release the brick locks.
fn unlock_now(core: &Arc<Core>, entry: &Arc<InodeEntry>) {
    update_info(core, entry, true);

    let (mask, acquired, lock_id, fd, gfid) = {
        let mut ctx = entry.ctx.lock();
        let gfid = ctx.gfid;
        ctx.clear_info();
        let lk = ctx.lock.as_ref().expect("release in progress");
        (lk.mask, lk.acquired, lk.lock_id, lk.fd, gfid)
    };

    if !mask.is_empty() && acquired {
        let loc = Loc::from_gfid(gfid);
        let flock = Flock::whole_file(FlockType::Unlock, lock_id);
        let mut fop = core.new_fop(FopKind::Inodelk, 0, mask, Minimum::One);
        fop.internal = true;
        fop.gfid = gfid;
        let answers = core.dispatch(&mut fop, Shape::All, crate::ops::merge_empty, |idx| {
            match fd {
                Some(fd) => core.bricks[idx].finodelk(
                    &core.name,
                    &fd,
                    crate::brick::LockCmd::SetLk,
                    &flock,
                    &Xdata::new(),
                ),
                None => core.bricks[idx].inodelk(
                    &core.name,
                    &loc,
                    crate::brick::LockCmd::SetLk,
                    &flock,
                    &Xdata::new(),
                ),
            }
        });
        if core.prepare_answer(&mut fop, answers).is_none_or(|a| !a.is_success()) {
            log::warn!("{}: inode unlocking failed on {}", core.name, gfid);
        }
    }

    lock_unfreeze(entry);
}

/// Push the accumulated version/size/dirty deltas to the bricks. With
/// `erase_dirty` (the release path) the dirty counters are subtracted
/// back to zero when every configured brick is good.
pub(crate) fn update_info(core: &Arc<Core>, entry: &Arc<InodeEntry>, erase_dirty: bool) -> bool {
    let (version, size_delta, dirty, mask, fd, gfid, have_version, want_config) = {
        let mut ctx = entry.ctx.lock();
        let inner = &mut *ctx;
        let gfid = inner.gfid;
        let version = [
            inner.post_version[0].wrapping_sub(inner.pre_version[0]),
            inner.post_version[1].wrapping_sub(inner.pre_version[1]),
        ];
        let size_delta = inner.post_size.wrapping_sub(inner.pre_size);
        let mut dirty = [0u64; 2];
        let lk = inner.lock.as_ref().expect("lock is live");
        let all_good = (core.node_mask & !lk.good_mask).is_empty();
        let mask = lk.good_mask;
        let fd = lk.fd;
        if erase_dirty {
            if all_good {
                for t in [TXN_DATA, TXN_METADATA] {
                    if inner.dirty[t] != 0 {
                        dirty[t] = inner.dirty[t].wrapping_neg();
                    }
                }
            }
            inner.dirty = [0, 0];
        }
        let want_config =
            matches!(inner.file_type, Some(FileType::Regular)) && !inner.have_config;
        (
            version,
            size_delta,
            dirty,
            mask,
            fd,
            gfid,
            inner.have_version,
            want_config,
        )
    };

    if version == [0, 0] && dirty == [0, 0] {
        return false;
    }

    let mut deltas = Xdata::new();
    if !have_version || version != [0, 0] {
        deltas.set_bin(XATTR_VERSION, ondisk::encode_u64_pair(version).to_vec());
    }
    if size_delta != 0 {
        deltas.set_bin(XATTR_SIZE, ondisk::encode_u64(size_delta).to_vec());
    }
    if dirty != [0, 0] {
        deltas.set_bin(XATTR_DIRTY, ondisk::encode_u64_pair(dirty).to_vec());
    }
    let mut req = Xdata::new();
    if want_config {
        req.set_u32(XATTR_CONFIG, 0);
    }

    let loc = Loc::from_gfid(gfid);
    let mut fop = core.new_fop(FopKind::Xattrop, 0, mask, Minimum::Min);
    fop.internal = true;
    fop.gfid = gfid;
    let answers = core.dispatch(&mut fop, Shape::All, crate::ops::merge_xattrs, |idx| match fd {
        Some(fd) => core.bricks[idx].fxattrop(&fd, XattropOp::AddArray64, &deltas, &req),
        None => core.bricks[idx].xattrop(&loc, XattropOp::AddArray64, &deltas, &req),
    });

    match core.prepare_answer(&mut fop, answers) {
        Some(ans) if ans.is_success() => {
            let good = ans.mask;
            let reply = ans.result.expect("checked success");
            let mut ctx = entry.ctx.lock();
            if let Some(raw) = reply.xattrs.get_bin(XATTR_VERSION)
                && let Ok(pair) = ondisk::decode_u64_pair(raw)
            {
                ctx.post_version = pair;
                ctx.pre_version = pair;
                ctx.have_version = true;
            }
            if let Some(raw) = reply.xattrs.get_bin(XATTR_SIZE)
                && let Ok(size) = ondisk::decode_u64(raw)
            {
                ctx.post_size = size;
                ctx.pre_size = size;
                ctx.have_size = true;
            }
            if let Some(raw) = reply.xdata.get_bin(XATTR_CONFIG)
                && let Ok(rec) = ondisk::ConfigRecord::decode(raw)
                && core.geom.config_matches(&rec)
            {
                ctx.config = Some(rec);
                ctx.have_config = true;
            }
            ctx.have_info = true;
            if let Some(lk) = ctx.lock.as_mut() {
                lk.good_mask &= good;
            }
        }
        _ => {
            log::warn!(
                "{}: failed to update version and size on {}",
                core.name,
                gfid
            );
        }
    }
    true
}

/// Mid-cycle flush used by flush/fsync before dispatching: pending
/// version deltas reach the bricks, dirty stays set.
pub(crate) fn flush_size_version(core: &Arc<Core>, fop: &Fop) {
    if let Some(link) = fop.locks.first() {
        let entry = core.inodes.entry(link.gfid);
        update_info(core, &entry, false);
    }
}

/// The release completed: recycle the lock for frozen fops or retire it.
fn lock_unfreeze(entry: &Arc<InodeEntry>) {
    let mut ctx = entry.ctx.lock();
    let lk = ctx.lock.as_mut().expect("release in progress");

    lk.release = false;
    lk.refs_owners = 0;
    lk.acquired = false;
    lk.exclusive = false;
    lk.mask = BrickMask::EMPTY;
    lk.good_mask = !BrickMask::EMPTY;
    lk.healing = BrickMask::EMPTY;

    let frozen = std::mem::take(&mut lk.frozen);
    lk.waiting.extend(frozen);

    if lk.waiting.is_empty() && lk.refs_pending == 0 {
        ctx.lock = None;
    } else {
        lk.wake_shared();
    }
    entry.cond.notify_all();
}

// ---------------------------------------------------------------------------
// Size helpers for handlers
// ---------------------------------------------------------------------------

/// Authoritative logical size under the current lock, if known.
pub(crate) fn get_inode_size(core: &Core, gfid: Gfid) -> Option<u64> {
    let entry = core.inodes.peek(gfid)?;
    let ctx = entry.ctx.lock();
    ctx.cached_size()
}

/// Grow the post-size after a successful extending update.
pub(crate) fn set_post_size(core: &Core, gfid: Gfid, size: u64) {
    let entry = core.inodes.entry(gfid);
    let mut ctx = entry.ctx.lock();
    if ctx.have_size {
        ctx.post_size = size;
    } else {
        ctx.set_size(size);
    }
}

/// Remember the file type observed for an inode.
pub(crate) fn note_file_type(core: &Core, gfid: Gfid, file_type: FileType) {
    let entry = core.inodes.entry(gfid);
    let mut ctx = entry.ctx.lock();
    ctx.file_type = Some(file_type);
}
