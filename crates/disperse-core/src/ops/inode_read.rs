//! Inode read operations: access, stat, readlink, open, readv, seek and
//! getxattr.

use std::sync::Arc;

use crate::brick::{EmptyReply, IattReply, ReadReply, ReadlinkReply, SeekReply, XattrReply};
use crate::engine::{Core, FinalAnswer, Shape};
use crate::errors::EcResult;
use crate::fop::{FLAG_LOCK_SHARED, Fop, FopKind, LOCK_QUERY_INFO, Minimum};
use crate::lock;
use crate::types::{FdHandle, Loc, SeekWhat};
use crate::xdata::Xdata;

use super::{begin, finish, main_req, merge_empty, merge_read, merge_xattrs, rebuild_iatts};

// ---------------------------------------------------------------------------
// access / readlink / stat
// ---------------------------------------------------------------------------

pub(crate) fn access(core: &Arc<Core>, loc: &Loc, mask: u32) -> EcResult<EmptyReply> {
    let mut fop = begin(core, FopKind::Access, FLAG_LOCK_SHARED, Minimum::One);
    fop.gfid = loc.gfid;

    lock::lock_prepare_inode(core, &mut fop, loc, LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let answer = if !fop.failed() {
        let req = main_req(core, &fop);
        core.dispatch_one_retry(&mut fop, merge_empty, |idx| {
            core.bricks[idx].access(loc, mask, &req)
        })
    } else {
        None
    };

    finish(core, fop, answer)
}

pub(crate) fn readlink(core: &Arc<Core>, loc: &Loc) -> EcResult<ReadlinkReply> {
    let mut fop = begin(core, FopKind::Readlink, FLAG_LOCK_SHARED, Minimum::One);
    fop.gfid = loc.gfid;

    lock::lock_prepare_inode(core, &mut fop, loc, LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        core.dispatch_one_retry(
            &mut fop,
            |_dst: &mut ReadlinkReply, _src: &ReadlinkReply| true,
            |idx| core.bricks[idx].readlink(loc, &req),
        )
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
    {
        let count = ans.count;
        let reply = ans.result.as_mut().expect("checked success");
        let mut ias = [reply.iatt];
        rebuild_iatts(core, count, &mut ias);
        reply.iatt = ias[0];
    }

    finish(core, fop, answer)
}

fn stat_common(
    core: &Arc<Core>,
    mut fop: Fop,
    wind: impl Fn(usize, &Xdata) -> Result<IattReply, crate::types::Errno>,
) -> EcResult<IattReply> {
    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        core.dispatch_one_retry(
            &mut fop,
            |_dst: &mut IattReply, _src: &IattReply| true,
            |idx| wind(idx, &req),
        )
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        let count = ans.count;
        let reply = ans.result.as_mut().expect("checked success");
        lock::note_file_type(core, reply.iatt.gfid, reply.iatt.file_type);
        let mut ias = [reply.iatt];
        rebuild_iatts(core, count, &mut ias);
        reply.iatt = ias[0];
        fop.heal_partial = reply.iatt.file_type.is_dir();
    }

    finish(core, fop, answer)
}

pub(crate) fn stat(core: &Arc<Core>, loc: &Loc) -> EcResult<IattReply> {
    let mut fop = begin(core, FopKind::Stat, FLAG_LOCK_SHARED, Minimum::One);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());
    lock::lock_prepare_inode(core, &mut fop, loc, LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);
    stat_common(core, fop, |idx, req| core.bricks[idx].stat(loc, req))
}

pub(crate) fn fstat(core: &Arc<Core>, fd: &FdHandle) -> EcResult<IattReply> {
    let mut fop = begin(core, FopKind::Fstat, FLAG_LOCK_SHARED, Minimum::One);
    fop.gfid = fd.gfid;
    fop.heal_locs.push(Loc::from_gfid(fd.gfid));
    lock::lock_prepare_fd(core, &mut fop, fd, LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);
    stat_common(core, fop, |idx, req| core.bricks[idx].fstat(fd, req))
}

// ---------------------------------------------------------------------------
// open
// ---------------------------------------------------------------------------

/// Open on every good brick; the answering set becomes the fd's open
/// mask. Runs without a lock: truncating opens are handled by the
/// caller as open + ftruncate, which takes its own locks.
pub(crate) fn open(core: &Arc<Core>, loc: &Loc, flags: u32) -> EcResult<(EmptyReply, crate::mask::BrickMask)> {
    let mut fop = begin(core, FopKind::Open, FLAG_LOCK_SHARED, Minimum::Min);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());

    let answer = if !fop.failed() {
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].open(loc, flags, &Xdata::new())
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    let open_mask = answer.as_ref().map(|a| a.mask).unwrap_or_default();
    finish(core, fop, answer).map(|reply| (reply, open_mask))
}

// ---------------------------------------------------------------------------
// readv
// ---------------------------------------------------------------------------

pub(crate) fn readv(
    core: &Arc<Core>,
    fd: &FdHandle,
    size: u64,
    offset: u64,
    flags: u32,
) -> EcResult<ReadReply> {
    let mut fop = begin(core, FopKind::Readv, FLAG_LOCK_SHARED, Minimum::Min);
    fop.gfid = fd.gfid;
    fop.heal_locs.push(Loc::from_gfid(fd.gfid));

    // Stripe alignment: read whole stripes covering the requested range.
    let user_size = size;
    let (aligned_offset, head) = core.geom.align_offset_down(offset);
    let aligned_size = core.geom.align_size_up(user_size + head);

    lock::lock_prepare_fd(core, &mut fop, fd, LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let trusted = core.iatt_trusted(&fop, fd.gfid);
    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let frag_size = aligned_size / core.geom.fragments as u64;
        let frag_offset = aligned_offset / core.geom.fragments as u64;
        let fragment = core.geom.fragment_size;
        let answers = core.dispatch(&mut fop, Shape::Min, merge_read(trusted), |idx| {
            match core.bricks[idx].readv(fd, frag_size, frag_offset, flags, &req) {
                // A fragment that is not whole cannot be decoded.
                Ok(r) if r.data.len() as u64 % fragment != 0 => Err(libc::EIO),
                other => other,
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
        if let Err(e) = readv_rebuild(core, &mut fop, ans, offset, head, user_size) {
            super::fixup_failed(&mut fop, e, true);
        }
    }

    finish(core, fop, answer)
}

/// Decode the fragment answers back into the caller's byte range.
fn readv_rebuild(
    core: &Arc<Core>,
    fop: &mut Fop,
    ans: &mut FinalAnswer<ReadReply>,
    user_offset: u64,
    head: u64,
    user_size: u64,
) -> Result<(), crate::types::Errno> {
    let count = ans.count;
    let k = core.geom.fragments;

    let mut fragments: Vec<(usize, &[u8])> = Vec::with_capacity(k);
    {
        let rep = ans.result.as_ref().expect("caller checked success");
        fragments.push((ans.idx, rep.data.as_slice()));
    }
    for cbk in &ans.others {
        if let Ok(r) = &cbk.result {
            fragments.push((cbk.idx, r.data.as_slice()));
        }
    }
    if fragments.len() < k {
        return Err(libc::EIO);
    }
    fragments.truncate(k);

    let decoded = if fragments[0].1.is_empty() {
        Vec::new()
    } else {
        core.codec.decode(&fragments).map_err(|e| {
            log::error!("{}: fragment decode failed: {}", core.name, e);
            libc::EIO
        })?
    };

    // Clamp against the authoritative size, then trim head and tail.
    let file_size = lock::get_inode_size(core, fop.gfid).unwrap_or(decoded.len() as u64);
    let avail = file_size.saturating_sub(user_offset).min(user_size);
    let start = (head as usize).min(decoded.len());
    let end = (start + avail as usize).min(decoded.len());

    let reply = ans.result.as_mut().expect("caller checked success");
    reply.data = decoded[start..end].to_vec();

    let mut ias = [reply.iatt];
    rebuild_iatts(core, count, &mut ias);
    reply.iatt = ias[0];
    Ok(())
}

// ---------------------------------------------------------------------------
// seek
// ---------------------------------------------------------------------------

pub(crate) fn seek(
    core: &Arc<Core>,
    fd: &FdHandle,
    offset: u64,
    what: SeekWhat,
) -> EcResult<SeekReply> {
    let mut fop = begin(core, FopKind::Seek, FLAG_LOCK_SHARED, Minimum::One);
    fop.gfid = fd.gfid;

    lock::lock_prepare_fd(core, &mut fop, fd, LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let (aligned_offset, head) = core.geom.align_offset_down(offset);
    let frag_offset = aligned_offset / core.geom.fragments as u64;

    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        core.dispatch_one_retry(
            &mut fop,
            |dst: &mut SeekReply, src: &SeekReply| dst.offset == src.offset,
            |idx| core.bricks[idx].seek(fd, frag_offset, what, &req),
        )
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        let reply = ans.result.as_mut().expect("checked success");
        let logical = reply.offset * core.geom.fragments as u64 + head;
        let limit = lock::get_inode_size(core, fd.gfid).unwrap_or(logical);
        reply.offset = logical.min(limit);
    }

    finish(core, fop, answer)
}

// ---------------------------------------------------------------------------
// getxattr
// ---------------------------------------------------------------------------

fn strip_internal_xattrs(reply: &mut XattrReply) {
    let internal: Vec<String> = reply
        .xattrs
        .keys()
        .filter(|k| k.starts_with("trusted.ec."))
        .map(|k| k.to_string())
        .collect();
    for key in internal {
        reply.xattrs.remove(&key);
    }
}

pub(crate) fn getxattr(core: &Arc<Core>, loc: &Loc, name: Option<&str>) -> EcResult<XattrReply> {
    let mut fop = begin(core, FopKind::Getxattr, FLAG_LOCK_SHARED, Minimum::Min);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());

    lock::lock_prepare_inode(core, &mut fop, loc, LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_xattrs, |idx| {
            core.bricks[idx].getxattr(loc, name, &req)
        });
        core.prepare_answer_xattrs(&mut fop, answers)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
    {
        strip_internal_xattrs(ans.result.as_mut().expect("checked success"));
    }

    finish(core, fop, answer)
}

pub(crate) fn fgetxattr(core: &Arc<Core>, fd: &FdHandle, name: Option<&str>) -> EcResult<XattrReply> {
    let mut fop = begin(core, FopKind::Fgetxattr, FLAG_LOCK_SHARED, Minimum::Min);
    fop.gfid = fd.gfid;

    lock::lock_prepare_fd(core, &mut fop, fd, LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_xattrs, |idx| {
            core.bricks[idx].fgetxattr(fd, name, &req)
        });
        core.prepare_answer_xattrs(&mut fop, answers)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
    {
        strip_internal_xattrs(ans.result.as_mut().expect("checked success"));
    }

    finish(core, fop, answer)
}
