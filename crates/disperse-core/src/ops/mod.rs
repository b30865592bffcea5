//! Per-operation handlers.
//!
//! Every handler walks the same skeleton: begin (quorum gate), prepare
//! locks, lock, dispatch, prepare the answer, apply the fop-specific
//! fixup, then finish (report, lock reuse, unlock, heal scheduling).
//! Handlers differ only in the locks they take, their argument alignment,
//! their combine predicate and their post-combine fixup.

pub(crate) mod dir_read;
pub(crate) mod dir_write;
pub(crate) mod generic;
pub(crate) mod inode_read;
pub(crate) mod inode_write;
pub(crate) mod locks;

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::brick::{
    EmptyReply, EntryReply, LookupReply, ParentReply, PrePostReply, ReadReply, ReaddirReply,
    RenameReply, StatfsReply, WriteReply, XattrReply,
};
use crate::cbk::Reply;
use crate::combine;
use crate::engine::{Core, FinalAnswer};
use crate::errors::{EcError, EcResult};
use crate::fop::{Fop, FopKind, Minimum};
use crate::lock;
use crate::types::{Errno, Iatt};
use crate::xdata::{Xdata, keys};

// ---------------------------------------------------------------------------
// Skeleton
// ---------------------------------------------------------------------------

/// INIT: account the fop and gate on the volume-wide quorum.
pub(crate) fn begin(core: &Arc<Core>, kind: FopKind, flags: u32, minimum: Minimum) -> Fop {
    core.fop_begin();
    let mut fop = core.new_fop(kind, flags, core.node_mask, minimum);
    if core.shutdown.load(Ordering::Acquire) {
        fop.set_error(libc::ENOTCONN);
    } else if let Err(e) = core.check_global_quorum(fop.internal) {
        fop.set_error(e);
    }
    fop
}

/// INIT for cleanup traffic (unlocks, xattrop) that must reach whatever
/// bricks remain: no quorum gate, works through shutdown.
pub(crate) fn begin_must_wind(core: &Arc<Core>, kind: FopKind, minimum: Minimum) -> Fop {
    core.fop_begin();
    let mut fop = core.new_fop(kind, 0, core.node_mask, minimum);
    fop.internal = true;
    fop
}

/// An error hit while post-processing a committed answer: read-only fops
/// report it as-is, updates upgrade to EIO to signal the partial update.
pub(crate) fn fixup_failed(fop: &mut Fop, errno: Errno, ro: bool) {
    fop.set_error(if ro { errno } else { libc::EIO });
}

/// REPORT through END: settle the result, recycle or release the locks,
/// and schedule background healing when answers diverged.
pub(crate) fn finish<R: Reply>(
    core: &Arc<Core>,
    mut fop: Fop,
    answer: Option<FinalAnswer<R>>,
) -> EcResult<R> {
    let success = fop.error.is_none() && answer.as_ref().is_some_and(|a| a.is_success());
    unwind(core, &mut fop, answer.as_ref(), success);
    core.fop_end();

    let result: Result<R, Errno> = match (fop.error, answer) {
        (Some(e), _) => Err(e),
        (None, Some(a)) => a.result,
        (None, None) => Err(libc::EIO),
    };
    result.map_err(EcError::from_errno)
}

fn unwind<R: Reply>(
    core: &Arc<Core>,
    fop: &mut Fop,
    answer: Option<&FinalAnswer<R>>,
    success: bool,
) {
    if !fop.locks.is_empty() {
        lock::lock_reuse(core, fop, answer.map(|a| &a.xdata), success);
        lock::unlock(core, fop);
    }
    if answer.is_some()
        && fop.parent.is_none()
        && fop.expected != 1
        && core.fop_needs_heal(fop)
    {
        let partial = fop.heal_partial;
        for loc in fop.heal_locs.drain(..) {
            crate::heal::schedule_background(core, loc, partial);
        }
    }
}

/// Request dictionary for a main operation: carries the lock-count query
/// when the fop holds locks, so contention is visible in replies.
pub(crate) fn main_req(core: &Core, fop: &Fop) -> Xdata {
    let mut req = Xdata::new();
    if fop.want_lock_count {
        req.set_str(keys::INODELK_COUNT, &core.name);
    }
    req
}

// ---------------------------------------------------------------------------
// Combine predicates
// ---------------------------------------------------------------------------

pub(crate) fn merge_empty(_dst: &mut EmptyReply, _src: &EmptyReply) -> bool {
    true
}

/// xattrop and getxattr answers agree when their xattr dictionaries do.
pub(crate) fn merge_xattrs(dst: &mut XattrReply, src: &XattrReply) -> bool {
    combine::xdata_compatible(&dst.xattrs, &src.xattrs)
}

/// Lenient predicate for single-answer internal lookups.
pub(crate) fn merge_lookup_weak(_dst: &mut LookupReply, _src: &LookupReply) -> bool {
    true
}

pub(crate) fn merge_lookup(trusted: bool) -> impl Fn(&mut LookupReply, &LookupReply) -> bool {
    move |dst, src| {
        let mut ia = [dst.iatt];
        if !combine::iatt_combine(trusted, &mut ia, &[src.iatt]) {
            return false;
        }
        dst.iatt = ia[0];
        match (&mut dst.postparent, &src.postparent) {
            (Some(d), Some(s)) => {
                let mut pp = [*d];
                if !combine::iatt_combine(trusted, &mut pp, &[*s]) {
                    return false;
                }
                *d = pp[0];
                true
            }
            (None, None) => true,
            _ => false,
        }
    }
}

pub(crate) fn merge_prepost(trusted: bool) -> impl Fn(&mut PrePostReply, &PrePostReply) -> bool {
    move |dst, src| {
        let mut ia = [dst.pre, dst.post];
        if !combine::iatt_combine(trusted, &mut ia, &[src.pre, src.post]) {
            return false;
        }
        dst.pre = ia[0];
        dst.post = ia[1];
        true
    }
}

pub(crate) fn merge_entry(trusted: bool) -> impl Fn(&mut EntryReply, &EntryReply) -> bool {
    move |dst, src| {
        let mut ia = [dst.iatt, dst.preparent, dst.postparent];
        if !combine::iatt_combine(trusted, &mut ia, &[src.iatt, src.preparent, src.postparent]) {
            return false;
        }
        dst.iatt = ia[0];
        dst.preparent = ia[1];
        dst.postparent = ia[2];
        true
    }
}

pub(crate) fn merge_parent(trusted: bool) -> impl Fn(&mut ParentReply, &ParentReply) -> bool {
    move |dst, src| {
        let mut ia = [dst.preparent, dst.postparent];
        if !combine::iatt_combine(trusted, &mut ia, &[src.preparent, src.postparent]) {
            return false;
        }
        dst.preparent = ia[0];
        dst.postparent = ia[1];
        true
    }
}

pub(crate) fn merge_rename(trusted: bool) -> impl Fn(&mut RenameReply, &RenameReply) -> bool {
    move |dst, src| {
        let mut ia = [
            dst.iatt,
            dst.preoldparent,
            dst.postoldparent,
            dst.prenewparent,
            dst.postnewparent,
        ];
        let other = [
            src.iatt,
            src.preoldparent,
            src.postoldparent,
            src.prenewparent,
            src.postnewparent,
        ];
        if !combine::iatt_combine(trusted, &mut ia, &other) {
            return false;
        }
        dst.iatt = ia[0];
        dst.preoldparent = ia[1];
        dst.postoldparent = ia[2];
        dst.prenewparent = ia[3];
        dst.postnewparent = ia[4];
        true
    }
}

/// Write answers agree on byte count and attributes.
pub(crate) fn merge_write(trusted: bool) -> impl Fn(&mut WriteReply, &WriteReply) -> bool {
    move |dst, src| {
        if dst.written != src.written {
            return false;
        }
        let mut ia = [dst.pre, dst.post];
        if !combine::iatt_combine(trusted, &mut ia, &[src.pre, src.post]) {
            return false;
        }
        dst.pre = ia[0];
        dst.post = ia[1];
        true
    }
}

/// Read answers carry different fragments by design; they agree when the
/// byte counts and attributes agree.
pub(crate) fn merge_read(trusted: bool) -> impl Fn(&mut ReadReply, &ReadReply) -> bool {
    move |dst, src| {
        if dst.data.len() != src.data.len() {
            return false;
        }
        let mut ia = [dst.iatt];
        if !combine::iatt_combine(trusted, &mut ia, &[src.iatt]) {
            return false;
        }
        dst.iatt = ia[0];
        true
    }
}

pub(crate) fn merge_statfs(dst: &mut StatfsReply, src: &StatfsReply) -> bool {
    combine::statvfs_combine(&mut dst.stat, &src.stat);
    true
}

pub(crate) fn merge_readdir(_dst: &mut ReaddirReply, _src: &ReaddirReply) -> bool {
    // Single-brick dispatch; grouping never sees two success answers.
    true
}

// ---------------------------------------------------------------------------
// Shared fixups
// ---------------------------------------------------------------------------

/// Reverse the fragmentation in the answer's iatts and pin the regular
/// file size from the inode context.
pub(crate) fn rebuild_iatts(core: &Core, answers: usize, iatts: &mut [Iatt]) {
    combine::iatt_rebuild(iatts, core.geom.fragments, answers);
    for iatt in iatts {
        if iatt.file_type.is_regular()
            && let Some(size) = lock::get_inode_size(core, iatt.gfid)
        {
            iatt.size = size;
        }
    }
}
