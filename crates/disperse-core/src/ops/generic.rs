//! lookup, flush, fsync, fsyncdir, statfs, xattrop and ipc.

use std::sync::Arc;

use crate::brick::{EmptyReply, LookupReply, PrePostReply, StatfsReply, XattrReply, XattropOp};
use crate::combine;
use crate::engine::{Core, FinalAnswer, Shape};
use crate::errors::EcResult;
use crate::fop::{FLAG_LOCK_SHARED, Fop, FopKind, LOCK_QUERY_INFO, LOCK_UPDATE_META, Minimum};
use crate::lock;
use crate::ondisk::{XATTR_CONFIG, XATTR_DIRTY, XATTR_SIZE, XATTR_VERSION};
use crate::types::{FdHandle, Loc};
use crate::xdata::Xdata;

use super::{begin, finish, main_req, merge_empty, merge_lookup, merge_prepost, merge_statfs,
            merge_xattrs, rebuild_iatts};

// ---------------------------------------------------------------------------
// lookup
// ---------------------------------------------------------------------------

pub(crate) fn lookup(core: &Arc<Core>, loc: &Loc, xdata: &Xdata) -> EcResult<LookupReply> {
    let mut fop = begin(core, FopKind::Lookup, FLAG_LOCK_SHARED, Minimum::Min);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());

    let mut req = xdata.clone();
    req.set_u64(XATTR_VERSION, 0);
    req.set_u64(XATTR_SIZE, 0);
    req.set_u32(XATTR_CONFIG, 0);

    let mut answer = if !fop.failed() {
        let answers = core.dispatch(&mut fop, Shape::All, merge_lookup(true), |idx| {
            core.bricks[idx].lookup(loc, &req)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        lookup_rebuild(core, &mut fop, ans);
    }

    finish(core, fop, answer)
}

/// Fold the versioned metadata carried in the lookup reply into the inode
/// context and correct the returned attributes.
fn lookup_rebuild(core: &Arc<Core>, fop: &mut Fop, ans: &mut FinalAnswer<LookupReply>) {
    let count = ans.count;
    let reply = ans.result.as_mut().expect("caller checked success");

    let version = reply
        .xdata
        .remove(XATTR_VERSION)
        .and_then(|v| match v {
            crate::xdata::XdataValue::Bin(raw) => crate::ondisk::decode_u64_pair(&raw).ok(),
            _ => None,
        });
    let size = reply.xdata.remove(XATTR_SIZE).and_then(|v| match v {
        crate::xdata::XdataValue::Bin(raw) => crate::ondisk::decode_u64(&raw).ok(),
        _ => None,
    });
    reply.xdata.remove(XATTR_CONFIG);
    reply.xdata.remove(XATTR_DIRTY);

    let gfid = reply.iatt.gfid;
    lock::note_file_type(core, gfid, reply.iatt.file_type);

    if reply.iatt.file_type.is_regular() {
        let entry = core.inodes.entry(gfid);
        let mut ctx = entry.ctx.lock();
        if let Some(v) = version
            && !ctx.have_version
        {
            ctx.pre_version = v;
            ctx.post_version = v;
            ctx.have_version = true;
        }
        if let Some(s) = size
            && !ctx.have_size
        {
            ctx.pre_size = s;
            ctx.post_size = s;
            ctx.have_size = true;
        }
        if ctx.have_size {
            reply.iatt.size = ctx.post_size;
        }
    }

    let mut ias = [reply.iatt];
    combine::iatt_rebuild(&mut ias, core.geom.fragments, count);
    reply.iatt = ias[0];
    if let Some(pp) = reply.postparent.as_mut() {
        let mut ias = [*pp];
        combine::iatt_rebuild(&mut ias, core.geom.fragments, count);
        *pp = ias[0];
    }

    fop.heal_partial = reply.iatt.file_type.is_dir();
}

// ---------------------------------------------------------------------------
// flush / fsync / fsyncdir
// ---------------------------------------------------------------------------

pub(crate) fn flush(core: &Arc<Core>, fd: &FdHandle) -> EcResult<EmptyReply> {
    let mut fop = begin(core, FopKind::Flush, 0, Minimum::Min);
    fop.gfid = fd.gfid;
    fop.heal_locs.push(Loc::from_gfid(fd.gfid));

    lock::lock_prepare_fd(core, &mut fop, fd, 0);
    let _ = lock::lock(core, &mut fop);

    let answer = if !fop.failed() {
        lock::flush_size_version(core, &fop);
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].flush(fd, &req)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

pub(crate) fn fsync(core: &Arc<Core>, fd: &FdHandle, datasync: bool) -> EcResult<PrePostReply> {
    let mut fop = begin(core, FopKind::Fsync, 0, Minimum::Min);
    fop.gfid = fd.gfid;
    fop.heal_locs.push(Loc::from_gfid(fd.gfid));

    lock::lock_prepare_fd(core, &mut fop, fd, LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let trusted = core.iatt_trusted(&fop, fd.gfid);
    let mut answer = if !fop.failed() {
        lock::flush_size_version(core, &fop);
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_prepost(trusted), |idx| {
            core.bricks[idx].fsync(fd, datasync, &req)
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

pub(crate) fn fsyncdir(core: &Arc<Core>, fd: &FdHandle, datasync: bool) -> EcResult<EmptyReply> {
    let mut fop = begin(core, FopKind::Fsyncdir, 0, Minimum::Min);
    fop.gfid = fd.gfid;

    let answer = if !fop.failed() {
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].fsyncdir(fd, datasync, &Xdata::new())
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

// ---------------------------------------------------------------------------
// statfs
// ---------------------------------------------------------------------------

pub(crate) fn statfs(core: &Arc<Core>, loc: &Loc) -> EcResult<StatfsReply> {
    let mut fop = begin(core, FopKind::Statfs, FLAG_LOCK_SHARED, Minimum::Min);
    fop.gfid = loc.gfid;

    let mut answer = if !fop.failed() {
        let answers = core.dispatch(&mut fop, Shape::All, merge_statfs, |idx| {
            core.bricks[idx].statfs(loc, &Xdata::new())
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && core.opts.quota_deem_statfs
    {
        let reply = ans.result.as_mut().expect("checked success");
        combine::statvfs_scale(&mut reply.stat, core.geom.fragments);
    }

    finish(core, fop, answer)
}

// ---------------------------------------------------------------------------
// xattrop
// ---------------------------------------------------------------------------

pub(crate) fn xattrop(
    core: &Arc<Core>,
    loc: &Loc,
    op: XattropOp,
    deltas: &Xdata,
    xdata: &Xdata,
) -> EcResult<XattrReply> {
    let mut fop = super::begin_must_wind(core, FopKind::Xattrop, Minimum::Min);
    fop.gfid = loc.gfid;

    lock::lock_prepare_inode(core, &mut fop, loc, LOCK_UPDATE_META | LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let answer = if !fop.failed() {
        let mut req = main_req(core, &fop);
        for (k, v) in xdata.iter() {
            req.set(k, v.clone());
        }
        let answers = core.dispatch(&mut fop, Shape::All, merge_xattrs, |idx| {
            core.bricks[idx].xattrop(loc, op, deltas, &req)
        });
        core.prepare_answer_xattrs(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

pub(crate) fn fxattrop(
    core: &Arc<Core>,
    fd: &FdHandle,
    op: XattropOp,
    deltas: &Xdata,
    xdata: &Xdata,
) -> EcResult<XattrReply> {
    let mut fop = super::begin_must_wind(core, FopKind::Fxattrop, Minimum::Min);
    fop.gfid = fd.gfid;

    lock::lock_prepare_fd(core, &mut fop, fd, LOCK_UPDATE_META | LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let answer = if !fop.failed() {
        let mut req = main_req(core, &fop);
        for (k, v) in xdata.iter() {
            req.set(k, v.clone());
        }
        let answers = core.dispatch(&mut fop, Shape::All, merge_xattrs, |idx| {
            core.bricks[idx].fxattrop(fd, op, deltas, &req)
        });
        core.prepare_answer_xattrs(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

// ---------------------------------------------------------------------------
// ipc
// ---------------------------------------------------------------------------

pub(crate) fn ipc(core: &Arc<Core>, op: i32, xdata: &Xdata) -> EcResult<EmptyReply> {
    let mut fop = begin(core, FopKind::Ipc, 0, Minimum::Min);

    let answer = if !fop.failed() {
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].ipc(op, xdata)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}
