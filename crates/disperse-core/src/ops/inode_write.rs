//! Inode write operations: writev with head/tail reconstruction, the
//! truncate family, range operations and metadata updates.

use std::sync::Arc;

use crate::brick::{EmptyReply, PrePostReply, WriteReply};
use crate::engine::{Core, FinalAnswer, Shape};
use crate::errors::EcResult;
use crate::fop::{
    Fop, FopKind, LOCK_QUERY_INFO, LOCK_UPDATE_DATA, LOCK_UPDATE_META, Minimum,
};
use crate::lock;
use crate::types::{Errno, FdHandle, Loc, SetAttr};
use crate::xdata::Xdata;

use super::{begin, finish, main_req, merge_empty, merge_prepost, merge_read, merge_write,
            rebuild_iatts};

// ---------------------------------------------------------------------------
// Shared write machinery
// ---------------------------------------------------------------------------

/// A write request aligned to stripe boundaries with head and tail
/// reconstructed.
struct WriteState {
    buffer: Vec<u8>,
    aligned_offset: u64,
    head: u64,
    user_size: u64,
}

/// Read one whole stripe back through K bricks and decode it. Used when
/// the stripe cache cannot serve a head or tail reconstruction.
fn internal_read_stripe(
    core: &Arc<Core>,
    fop: &Fop,
    fd: &FdHandle,
    logical_offset: u64,
) -> Result<Vec<u8>, Errno> {
    let k = core.geom.fragments as u64;
    let fragment = core.geom.fragment_size;

    let mut req = Xdata::new();
    req.mark_internal();

    let mut child = core.child_fop(fop, FopKind::Readv, core.node_mask, Minimum::Min, false);
    let answers = core.dispatch(&mut child, Shape::Min, merge_read(true), |idx| {
        match core.bricks[idx].readv(fd, fragment, logical_offset / k, 0, &req) {
            Ok(r) if r.data.len() as u64 % fragment != 0 => Err(libc::EIO),
            other => other,
        }
    });
    let ans = core.prepare_answer(&mut child, answers).ok_or(libc::EIO)?;
    let rep = match &ans.result {
        Ok(r) => r,
        Err(e) => return Err(*e),
    };
    if rep.data.is_empty() {
        return Ok(Vec::new());
    }

    let mut fragments: Vec<(usize, &[u8])> = vec![(ans.idx, rep.data.as_slice())];
    for cbk in &ans.others {
        if let Ok(r) = &cbk.result {
            fragments.push((cbk.idx, r.data.as_slice()));
        }
    }
    if fragments.len() < core.geom.fragments {
        return Err(libc::EIO);
    }
    fragments.truncate(core.geom.fragments);
    core.codec.decode(&fragments).map_err(|e| {
        log::error!("{}: stripe decode failed during write: {}", core.name, e);
        libc::EIO
    })
}

fn cache_lookup(core: &Core, gfid: crate::types::Gfid, frag_offset: u64) -> Option<Vec<u8>> {
    let entry = core.inodes.entry(gfid);
    let mut ctx = entry.ctx.lock();
    ctx.stripe_cache.lookup(frag_offset)
}

fn cache_insert(core: &Core, gfid: crate::types::Gfid, frag_offset: u64, data: Vec<u8>) {
    let entry = core.inodes.entry(gfid);
    let mut ctx = entry.ctx.lock();
    ctx.stripe_cache.insert(frag_offset, data);
}

/// Align the write and reconstruct the missing head/tail bytes, serving
/// them from the stripe cache when warm.
fn write_start(
    core: &Arc<Core>,
    fop: &Fop,
    fd: &FdHandle,
    data: &[u8],
    offset: u64,
) -> Result<WriteState, Errno> {
    let geom = &core.geom;
    let k = geom.fragments as u64;
    let stripe = geom.stripe_size;

    let current = lock::get_inode_size(core, fd.gfid).ok_or(libc::EIO)?;
    let user_size = data.len() as u64;
    let (aligned_offset, head) = geom.align_offset_down(offset);
    let size = geom.align_size_up(user_size + head);
    let write_end = offset + user_size;

    let mut buffer = vec![0u8; size as usize];
    buffer[head as usize..(head + user_size) as usize].copy_from_slice(data);

    if head > 0 {
        let frag_offset = aligned_offset / k;
        let stripe_data = match cache_lookup(core, fd.gfid, frag_offset) {
            Some(cached) => cached,
            None => internal_read_stripe(core, fop, fd, aligned_offset)?,
        };
        let n = (head as usize).min(stripe_data.len());
        buffer[..n].copy_from_slice(&stripe_data[..n]);

        // A single-stripe write fills its tail from the same stripe.
        let tail_start = (head + user_size) as usize;
        if size == stripe && stripe_data.len() > tail_start {
            let end = stripe_data.len().min(stripe as usize);
            buffer[tail_start..end].copy_from_slice(&stripe_data[tail_start..end]);
        }
    }

    let tail = size - user_size - head;
    if tail > 0 && (head == 0 || size > stripe) {
        if current > write_end {
            // Existing bytes beyond the write must survive.
            let last_offset = aligned_offset + size - stripe;
            let stripe_data = match cache_lookup(core, fd.gfid, last_offset / k) {
                Some(cached) => cached,
                None => internal_read_stripe(core, fop, fd, last_offset)?,
            };
            let start = (stripe - tail) as usize;
            if stripe_data.len() > start {
                let n = (stripe_data.len() - start).min(tail as usize);
                buffer[(size - tail) as usize..(size - tail) as usize + n]
                    .copy_from_slice(&stripe_data[start..start + n]);
            }
        }
        // Tail bytes past EOF stay zero.
    }

    if tail > 0 {
        let last_offset = aligned_offset + size - stripe;
        cache_insert(
            core,
            fd.gfid,
            last_offset / k,
            buffer[(size - stripe) as usize..].to_vec(),
        );
    }

    Ok(WriteState {
        buffer,
        aligned_offset,
        head,
        user_size,
    })
}

/// Encode the aligned buffer and write fragment i to brick i.
fn dispatch_write(
    core: &Arc<Core>,
    fop: &mut Fop,
    fd: &FdHandle,
    state: &WriteState,
    flags: u32,
    trusted: bool,
) -> Option<FinalAnswer<WriteReply>> {
    let fragments = match core.codec.encode(&state.buffer) {
        Ok(f) => f,
        Err(e) => {
            log::error!("{}: stripe encode failed: {}", core.name, e);
            fop.set_error(libc::EIO);
            return None;
        }
    };
    let k = core.geom.fragments as u64;
    let fragment_size = core.geom.fragment_size;
    let frag_offset = state.aligned_offset / k;
    let req = main_req(core, fop);

    let answers = core.dispatch(fop, Shape::All, merge_write(trusted), |idx| {
        match core.bricks[idx].writev(fd, &fragments[idx], frag_offset, flags, &req) {
            // Partial fragments would make the stripe undecodable.
            Ok(r) if r.written % fragment_size != 0 => Err(libc::EIO),
            other => other,
        }
    });
    core.prepare_answer(fop, answers)
}

/// Internal whole-range write of the caller's bytes, used by truncate and
/// the range operations to fix partial stripes.
fn write_child(
    core: &Arc<Core>,
    parent: &Fop,
    fd: &FdHandle,
    data: &[u8],
    offset: u64,
) -> Result<(), Errno> {
    if data.is_empty() {
        return Ok(());
    }
    let mut child = core.child_fop(parent, FopKind::Writev, core.node_mask, Minimum::Min, false);
    let state = write_start(core, &child, fd, data, offset)?;
    match dispatch_write(core, &mut child, fd, &state, 0, true) {
        Some(ans) if ans.is_success() => Ok(()),
        Some(ans) => Err(ans.errno().unwrap_or(libc::EIO)),
        None => Err(child.error.unwrap_or(libc::EIO)),
    }
}

// ---------------------------------------------------------------------------
// writev
// ---------------------------------------------------------------------------

pub(crate) fn writev(
    core: &Arc<Core>,
    fd: &FdHandle,
    data: &[u8],
    offset: u64,
    flags: u32,
) -> EcResult<WriteReply> {
    let mut fop = begin(core, FopKind::Writev, 0, Minimum::Min);
    fop.gfid = fd.gfid;
    fop.heal_locs.push(Loc::from_gfid(fd.gfid));

    lock::lock_prepare_fd(
        core,
        &mut fop,
        fd,
        LOCK_UPDATE_DATA | LOCK_UPDATE_META | LOCK_QUERY_INFO,
    );
    let _ = lock::lock(core, &mut fop);

    let mut user_offset = offset;
    let state = if !fop.failed() {
        // Appending writes rebase on the locked size.
        if fd.flags & (libc::O_APPEND as u32) != 0 {
            user_offset = lock::get_inode_size(core, fd.gfid).unwrap_or(0);
        }
        match write_start(core, &fop, fd, data, user_offset) {
            Ok(state) => Some(state),
            Err(e) => {
                fop.set_error(e);
                None
            }
        }
    } else {
        None
    };

    let trusted = core.iatt_trusted(&fop, fd.gfid);
    let mut answer = match &state {
        Some(state) if !fop.failed() => dispatch_write(core, &mut fop, fd, state, flags, trusted),
        _ => None,
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        let state = state.as_ref().expect("state exists when dispatched");
        writev_fixup(core, &fop, ans, state, user_offset);
    }

    finish(core, fop, answer)
}

fn writev_fixup(
    core: &Arc<Core>,
    fop: &Fop,
    ans: &mut FinalAnswer<WriteReply>,
    state: &WriteState,
    user_offset: u64,
) {
    let count = ans.count;
    let k = core.geom.fragments as u64;
    let reply = ans.result.as_mut().expect("caller checked success");

    let mut ias = [reply.pre, reply.post];
    rebuild_iatts(core, count, &mut ias);
    reply.pre = ias[0];
    reply.post = ias[1];

    let current = lock::get_inode_size(core, fop.gfid).unwrap_or(0);
    reply.pre.size = current;
    reply.post.size = current;
    let end = user_offset + state.user_size;
    if end > current {
        // Internal writes leave the logical size to their top-level fop.
        if fop.parent.is_none() {
            lock::set_post_size(core, fop.gfid, end);
        }
        reply.post.size = end;
    }

    // The caller sees logical bytes, not fragment bytes.
    let mut ret = reply.written * k;
    ret = ret.saturating_sub(state.head);
    reply.written = ret.min(state.user_size);
}

// ---------------------------------------------------------------------------
// truncate / ftruncate
// ---------------------------------------------------------------------------

enum TruncTarget<'a> {
    Loc(&'a Loc),
    Fd(&'a FdHandle),
}

fn truncate_common(
    core: &Arc<Core>,
    mut fop: Fop,
    target: TruncTarget<'_>,
    offset: u64,
) -> EcResult<PrePostReply> {
    let gfid = fop.gfid;
    let aligned = core.geom.align_size_up(offset);
    let k = core.geom.fragments as u64;
    let trusted = core.iatt_trusted(&fop, gfid);

    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_prepost(trusted), |idx| {
            match &target {
                TruncTarget::Loc(loc) => core.bricks[idx].truncate(loc, aligned / k, &req),
                TruncTarget::Fd(fd) => core.bricks[idx].ftruncate(fd, aligned / k, &req),
            }
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        let count = ans.count;
        let old_size = lock::get_inode_size(core, gfid).unwrap_or(0);
        {
            let reply = ans.result.as_mut().expect("checked success");
            let mut ias = [reply.pre, reply.post];
            rebuild_iatts(core, count, &mut ias);
            reply.pre = ias[0];
            reply.post = ias[1];
            reply.pre.size = old_size;
            reply.post.size = offset;
        }
        lock::set_post_size(core, gfid, offset);

        // A shrink that missed the stripe boundary leaves stale bytes in
        // the final stripe; zero them to keep it decodable.
        if offset < old_size && offset != aligned {
            let fd = FdHandle { gfid, flags: 0 };
            let zeros = vec![0u8; (aligned - offset) as usize];
            if let Err(e) = write_child(core, &fop, &fd, &zeros, offset) {
                super::fixup_failed(&mut fop, e, false);
            }
        }
    }

    finish(core, fop, answer)
}

pub(crate) fn truncate(core: &Arc<Core>, loc: &Loc, offset: u64) -> EcResult<PrePostReply> {
    let mut fop = begin(core, FopKind::Truncate, 0, Minimum::Min);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());
    lock::lock_prepare_inode(
        core,
        &mut fop,
        loc,
        LOCK_UPDATE_DATA | LOCK_UPDATE_META | LOCK_QUERY_INFO,
    );
    let _ = lock::lock(core, &mut fop);
    truncate_common(core, fop, TruncTarget::Loc(loc), offset)
}

pub(crate) fn ftruncate(core: &Arc<Core>, fd: &FdHandle, offset: u64) -> EcResult<PrePostReply> {
    let mut fop = begin(core, FopKind::Ftruncate, 0, Minimum::Min);
    fop.gfid = fd.gfid;
    fop.heal_locs.push(Loc::from_gfid(fd.gfid));
    lock::lock_prepare_fd(
        core,
        &mut fop,
        fd,
        LOCK_UPDATE_DATA | LOCK_UPDATE_META | LOCK_QUERY_INFO,
    );
    let _ = lock::lock(core, &mut fop);
    truncate_common(core, fop, TruncTarget::Fd(fd), offset)
}

// ---------------------------------------------------------------------------
// fallocate / discard / zerofill
// ---------------------------------------------------------------------------

pub(crate) fn fallocate(
    core: &Arc<Core>,
    fd: &FdHandle,
    mode: u32,
    offset: u64,
    len: u64,
) -> EcResult<PrePostReply> {
    let mut fop = begin(core, FopKind::Fallocate, 0, Minimum::Min);
    fop.gfid = fd.gfid;
    fop.heal_locs.push(Loc::from_gfid(fd.gfid));

    lock::lock_prepare_fd(
        core,
        &mut fop,
        fd,
        LOCK_UPDATE_DATA | LOCK_UPDATE_META | LOCK_QUERY_INFO,
    );
    let _ = lock::lock(core, &mut fop);

    let k = core.geom.fragments as u64;
    let (aligned_offset, head) = core.geom.align_offset_down(offset);
    let aligned_len = core.geom.align_size_up(len + head);
    let trusted = core.iatt_trusted(&fop, fd.gfid);

    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_prepost(trusted), |idx| {
            core.bricks[idx].fallocate(fd, mode, aligned_offset / k, aligned_len / k, &req)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        let count = ans.count;
        let current = lock::get_inode_size(core, fd.gfid).unwrap_or(0);
        let reply = ans.result.as_mut().expect("checked success");
        let mut ias = [reply.pre, reply.post];
        rebuild_iatts(core, count, &mut ias);
        reply.pre = ias[0];
        reply.post = ias[1];
        reply.pre.size = current;
        reply.post.size = current;
        let end = offset + len;
        if mode & (libc::FALLOC_FL_KEEP_SIZE as u32) == 0 && end > current {
            lock::set_post_size(core, fd.gfid, end);
            reply.post.size = end;
        }
    }

    finish(core, fop, answer)
}

/// Zero a byte range: whole stripes through the brick primitive, partial
/// edge stripes through read-modify-write.
fn zero_range(
    core: &Arc<Core>,
    fop: &mut Fop,
    fd: &FdHandle,
    offset: u64,
    len: u64,
    punch_hole: bool,
    trusted: bool,
) -> Option<FinalAnswer<PrePostReply>> {
    let k = core.geom.fragments as u64;
    let stripe = core.geom.stripe_size;
    let end = offset + len;

    let inner_start = core.geom.align_size_up(offset);
    let inner_end = end - (end % stripe);
    let (dispatch_offset, dispatch_len) = if inner_end > inner_start {
        (inner_start, inner_end - inner_start)
    } else {
        (inner_start, 0)
    };

    let req = main_req(core, fop);
    let answers = core.dispatch(fop, Shape::All, merge_prepost(trusted), |idx| {
        if punch_hole {
            core.bricks[idx].discard(fd, dispatch_offset / k, dispatch_len / k, &req)
        } else {
            core.bricks[idx].zerofill(fd, dispatch_offset / k, dispatch_len / k, &req)
        }
    });
    let answer = core.prepare_answer(fop, answers)?;
    if !answer.is_success() {
        return Some(answer);
    }

    // Edge stripes keep their surrounding bytes. A hole punch never
    // writes past EOF; a zerofill extends backing fragments.
    let current = lock::get_inode_size(core, fd.gfid).unwrap_or(0);
    let head_zero_end = inner_start.min(end);
    if head_zero_end > offset && (offset < current || !punch_hole) {
        let zeros = vec![0u8; (head_zero_end - offset) as usize];
        if let Err(e) = write_child(core, fop, fd, &zeros, offset) {
            super::fixup_failed(fop, e, false);
            return Some(answer);
        }
    }
    let tail_start = inner_end.max(head_zero_end).max(offset);
    if end > tail_start {
        let limit = if punch_hole { end.min(current) } else { end };
        if limit > tail_start {
            let zeros = vec![0u8; (limit - tail_start) as usize];
            if let Err(e) = write_child(core, fop, fd, &zeros, tail_start) {
                super::fixup_failed(fop, e, false);
            }
        }
    }

    Some(answer)
}

fn range_fixup(
    core: &Arc<Core>,
    fd: &FdHandle,
    ans: &mut FinalAnswer<PrePostReply>,
    grow_to: Option<u64>,
) {
    let count = ans.count;
    let current = lock::get_inode_size(core, fd.gfid).unwrap_or(0);
    let reply = ans.result.as_mut().expect("caller checked success");
    let mut ias = [reply.pre, reply.post];
    rebuild_iatts(core, count, &mut ias);
    reply.pre = ias[0];
    reply.post = ias[1];
    reply.pre.size = current;
    reply.post.size = current;
    if let Some(end) = grow_to
        && end > current
    {
        lock::set_post_size(core, fd.gfid, end);
        reply.post.size = end;
    }
}

pub(crate) fn discard(
    core: &Arc<Core>,
    fd: &FdHandle,
    offset: u64,
    len: u64,
) -> EcResult<PrePostReply> {
    let mut fop = begin(core, FopKind::Discard, 0, Minimum::Min);
    fop.gfid = fd.gfid;
    fop.heal_locs.push(Loc::from_gfid(fd.gfid));

    lock::lock_prepare_fd(
        core,
        &mut fop,
        fd,
        LOCK_UPDATE_DATA | LOCK_UPDATE_META | LOCK_QUERY_INFO,
    );
    let _ = lock::lock(core, &mut fop);

    let trusted = core.iatt_trusted(&fop, fd.gfid);
    let mut answer = if !fop.failed() {
        zero_range(core, &mut fop, fd, offset, len, true, trusted)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        range_fixup(core, fd, ans, None);
    }

    finish(core, fop, answer)
}

pub(crate) fn zerofill(
    core: &Arc<Core>,
    fd: &FdHandle,
    offset: u64,
    len: u64,
) -> EcResult<PrePostReply> {
    let mut fop = begin(core, FopKind::Zerofill, 0, Minimum::Min);
    fop.gfid = fd.gfid;
    fop.heal_locs.push(Loc::from_gfid(fd.gfid));

    lock::lock_prepare_fd(
        core,
        &mut fop,
        fd,
        LOCK_UPDATE_DATA | LOCK_UPDATE_META | LOCK_QUERY_INFO,
    );
    let _ = lock::lock(core, &mut fop);

    let trusted = core.iatt_trusted(&fop, fd.gfid);
    let mut answer = if !fop.failed() {
        zero_range(core, &mut fop, fd, offset, len, false, trusted)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        range_fixup(core, fd, ans, Some(offset + len));
    }

    finish(core, fop, answer)
}

// ---------------------------------------------------------------------------
// setattr / setxattr / removexattr
// ---------------------------------------------------------------------------

enum AttrTarget<'a> {
    Loc(&'a Loc),
    Fd(&'a FdHandle),
}

fn setattr_common(
    core: &Arc<Core>,
    mut fop: Fop,
    target: AttrTarget<'_>,
    attr: &SetAttr,
    valid: u32,
) -> EcResult<PrePostReply> {
    let gfid = fop.gfid;
    let trusted = core.iatt_trusted(&fop, gfid);

    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_prepost(trusted), |idx| {
            match &target {
                AttrTarget::Loc(loc) => core.bricks[idx].setattr(loc, attr, valid, &req),
                AttrTarget::Fd(fd) => core.bricks[idx].fsetattr(fd, attr, valid, &req),
            }
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        let count = ans.count;
        let reply = ans.result.as_mut().expect("checked success");
        let mut ias = [reply.pre, reply.post];
        rebuild_iatts(core, count, &mut ias);
        reply.pre = ias[0];
        reply.post = ias[1];
    }

    finish(core, fop, answer)
}

pub(crate) fn setattr(core: &Arc<Core>, loc: &Loc, attr: &SetAttr, valid: u32) -> EcResult<PrePostReply> {
    let mut fop = begin(core, FopKind::Setattr, 0, Minimum::Min);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());
    lock::lock_prepare_inode(core, &mut fop, loc, LOCK_UPDATE_META | LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);
    setattr_common(core, fop, AttrTarget::Loc(loc), attr, valid)
}

pub(crate) fn fsetattr(
    core: &Arc<Core>,
    fd: &FdHandle,
    attr: &SetAttr,
    valid: u32,
) -> EcResult<PrePostReply> {
    let mut fop = begin(core, FopKind::Fsetattr, 0, Minimum::Min);
    fop.gfid = fd.gfid;
    fop.heal_locs.push(Loc::from_gfid(fd.gfid));
    lock::lock_prepare_fd(core, &mut fop, fd, LOCK_UPDATE_META | LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);
    setattr_common(core, fop, AttrTarget::Fd(fd), attr, valid)
}

/// The translator's own namespace is not writable from above.
fn rejects_internal_keys(xattrs: &Xdata) -> bool {
    xattrs.keys().any(|k| k.starts_with("trusted.ec."))
}

pub(crate) fn setxattr(core: &Arc<Core>, loc: &Loc, xattrs: &Xdata, flags: u32) -> EcResult<EmptyReply> {
    let mut fop = begin(core, FopKind::Setxattr, 0, Minimum::Min);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());
    if rejects_internal_keys(xattrs) {
        fop.set_error(libc::EPERM);
    }
    lock::lock_prepare_inode(core, &mut fop, loc, LOCK_UPDATE_META | LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].setxattr(loc, xattrs, flags, &req)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

pub(crate) fn fsetxattr(
    core: &Arc<Core>,
    fd: &FdHandle,
    xattrs: &Xdata,
    flags: u32,
) -> EcResult<EmptyReply> {
    let mut fop = begin(core, FopKind::Fsetxattr, 0, Minimum::Min);
    fop.gfid = fd.gfid;
    if rejects_internal_keys(xattrs) {
        fop.set_error(libc::EPERM);
    }
    lock::lock_prepare_fd(core, &mut fop, fd, LOCK_UPDATE_META | LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].fsetxattr(fd, xattrs, flags, &req)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

pub(crate) fn removexattr(core: &Arc<Core>, loc: &Loc, name: &str) -> EcResult<EmptyReply> {
    let mut fop = begin(core, FopKind::Removexattr, 0, Minimum::Min);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());
    if name.starts_with("trusted.ec.") {
        fop.set_error(libc::EPERM);
    }
    lock::lock_prepare_inode(core, &mut fop, loc, LOCK_UPDATE_META | LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].removexattr(loc, name, &req)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

pub(crate) fn fremovexattr(core: &Arc<Core>, fd: &FdHandle, name: &str) -> EcResult<EmptyReply> {
    let mut fop = begin(core, FopKind::Fremovexattr, 0, Minimum::Min);
    fop.gfid = fd.gfid;
    if name.starts_with("trusted.ec.") {
        fop.set_error(libc::EPERM);
    }
    lock::lock_prepare_fd(core, &mut fop, fd, LOCK_UPDATE_META | LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].fremovexattr(fd, name, &req)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}
