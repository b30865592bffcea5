//! Directory entry operations: create, mknod, mkdir, symlink, link,
//! rename, unlink and rmdir. All run under the parent directory's inode
//! lock; rename locks both parents in gfid order.

use std::sync::Arc;

use crate::brick::{EntryReply, MkArgs, ParentReply, RenameReply};
use crate::engine::{Core, FinalAnswer, Shape};
use crate::errors::EcResult;
use crate::fop::{
    Fop, FopKind, LOCK_INODE_SIZE, LOCK_UPDATE_DATA, LOCK_UPDATE_META, Minimum,
};
use crate::lock;
use crate::mask::BrickMask;
use crate::ondisk::{self, XATTR_CONFIG, XATTR_DIRTY, XATTR_SIZE, XATTR_VERSION};
use crate::types::{FileType, Loc};
use crate::xdata::Xdata;

use super::{begin, finish, main_req, merge_entry, merge_parent, merge_rename, rebuild_iatts};

/// Creation xdata for a new regular file: config, versions, dirty and
/// size are seeded atomically with the inode so readers never see a file
/// without them.
pub(crate) fn creation_seed(core: &Core) -> Xdata {
    let mut seed = Xdata::new();
    seed.set_bin(XATTR_CONFIG, core.geom.config_record().encode().to_vec());
    seed.set_bin(XATTR_VERSION, ondisk::encode_u64_pair([0, 0]).to_vec());
    seed.set_bin(XATTR_DIRTY, ondisk::encode_u64_pair([0, 0]).to_vec());
    seed.set_bin(XATTR_SIZE, ondisk::encode_u64(0).to_vec());
    seed
}

fn entry_fixup(core: &Arc<Core>, fop: &mut Fop, ans: &mut FinalAnswer<EntryReply>) {
    let count = ans.count;
    let reply = ans.result.as_mut().expect("caller checked success");
    lock::note_file_type(core, reply.iatt.gfid, reply.iatt.file_type);
    let mut ias = [reply.iatt, reply.preparent, reply.postparent];
    rebuild_iatts(core, count, &mut ias);
    reply.iatt = ias[0];
    reply.preparent = ias[1];
    reply.postparent = ias[2];
    if let Some(size) = fop.locks.iter().find_map(|l| l.size) {
        reply.iatt.size = size;
    }
}

// ---------------------------------------------------------------------------
// create / mknod / mkdir / symlink
// ---------------------------------------------------------------------------

/// Create a regular file. The returned mask is the set of bricks that
/// opened the new file (the fd's open mask).
pub(crate) fn create(
    core: &Arc<Core>,
    loc: &Loc,
    flags: u32,
    args: &MkArgs,
) -> EcResult<(EntryReply, BrickMask)> {
    let mut fop = begin(core, FopKind::Create, 0, Minimum::Min);
    fop.gfid = args.gfid;
    fop.heal_locs.push(loc.clone());

    lock::lock_prepare_parent_inode(core, &mut fop, loc, None, LOCK_UPDATE_DATA | LOCK_UPDATE_META);
    let _ = lock::lock(core, &mut fop);

    let parent_gfid = loc.parent.unwrap_or(crate::types::Gfid::NULL);
    let trusted = core.iatt_trusted(&fop, parent_gfid);
    let mut answer = if !fop.failed() {
        let mut req = main_req(core, &fop);
        for (k, v) in creation_seed(core).iter() {
            req.set(k, v.clone());
        }
        let answers = core.dispatch(&mut fop, Shape::All, merge_entry(trusted), |idx| {
            core.bricks[idx].create(loc, flags, args, &req)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        entry_fixup(core, &mut fop, ans);
        // A brand-new file has a fully known size.
        let entry = core.inodes.entry(args.gfid);
        let mut ctx = entry.ctx.lock();
        ctx.set_size(0);
        ctx.have_version = true;
        ctx.pre_version = [0, 0];
        ctx.post_version = [0, 0];
    }

    let open_mask = answer.as_ref().map(|a| a.mask).unwrap_or_default();
    finish(core, fop, answer).map(|reply| (reply, open_mask))
}

fn mk_common(
    core: &Arc<Core>,
    mut fop: Fop,
    loc: &Loc,
    wind: impl Fn(usize, &Xdata) -> Result<EntryReply, crate::types::Errno>,
) -> EcResult<EntryReply> {
    let parent_gfid = loc.parent.unwrap_or(crate::types::Gfid::NULL);
    let trusted = core.iatt_trusted(&fop, parent_gfid);

    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_entry(trusted), |idx| {
            wind(idx, &req)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && !fop.failed()
    {
        entry_fixup(core, &mut fop, ans);
    }

    finish(core, fop, answer)
}

pub(crate) fn mknod(core: &Arc<Core>, loc: &Loc, args: &MkArgs) -> EcResult<EntryReply> {
    let mut fop = begin(core, FopKind::Mknod, 0, Minimum::Min);
    fop.gfid = args.gfid;
    fop.heal_locs.push(loc.clone());
    lock::lock_prepare_parent_inode(core, &mut fop, loc, None, LOCK_UPDATE_DATA | LOCK_UPDATE_META);
    let _ = lock::lock(core, &mut fop);

    let seed = if args.file_type == FileType::Regular {
        Some(creation_seed(core))
    } else {
        None
    };
    mk_common(core, fop, loc, |idx, req| {
        let mut req = req.clone();
        if let Some(seed) = &seed {
            for (k, v) in seed.iter() {
                req.set(k, v.clone());
            }
        }
        core.bricks[idx].mknod(loc, args, &req)
    })
}

pub(crate) fn mkdir(core: &Arc<Core>, loc: &Loc, args: &MkArgs) -> EcResult<EntryReply> {
    let mut fop = begin(core, FopKind::Mkdir, 0, Minimum::Min);
    fop.gfid = args.gfid;
    fop.heal_locs.push(loc.clone());
    lock::lock_prepare_parent_inode(core, &mut fop, loc, None, LOCK_UPDATE_DATA | LOCK_UPDATE_META);
    let _ = lock::lock(core, &mut fop);
    mk_common(core, fop, loc, |idx, req| core.bricks[idx].mkdir(loc, args, req))
}

pub(crate) fn symlink(
    core: &Arc<Core>,
    target: &str,
    loc: &Loc,
    args: &MkArgs,
) -> EcResult<EntryReply> {
    let mut fop = begin(core, FopKind::Symlink, 0, Minimum::Min);
    fop.gfid = args.gfid;
    fop.heal_locs.push(loc.clone());
    lock::lock_prepare_parent_inode(core, &mut fop, loc, None, LOCK_UPDATE_DATA | LOCK_UPDATE_META);
    let _ = lock::lock(core, &mut fop);
    mk_common(core, fop, loc, |idx, req| {
        core.bricks[idx].symlink(target, loc, args, req)
    })
}

// ---------------------------------------------------------------------------
// link / rename
// ---------------------------------------------------------------------------

pub(crate) fn link(core: &Arc<Core>, old: &Loc, new: &Loc) -> EcResult<EntryReply> {
    let mut fop = begin(core, FopKind::Link, 0, Minimum::Min);
    fop.gfid = old.gfid;
    fop.heal_locs.push(old.clone());
    fop.heal_locs.push(new.clone());

    lock::lock_prepare_parent_inode(
        core,
        &mut fop,
        new,
        Some(old.clone()),
        LOCK_UPDATE_DATA | LOCK_UPDATE_META | LOCK_INODE_SIZE,
    );
    let _ = lock::lock(core, &mut fop);

    mk_common(core, fop, new, |idx, req| core.bricks[idx].link(old, new, req))
}

pub(crate) fn rename(core: &Arc<Core>, old: &Loc, new: &Loc) -> EcResult<RenameReply> {
    let mut fop = begin(core, FopKind::Rename, 0, Minimum::Min);
    fop.gfid = old.gfid;
    fop.heal_locs.push(old.clone());
    fop.heal_locs.push(new.clone());

    lock::lock_prepare_parent_inode(
        core,
        &mut fop,
        old,
        Some(old.clone()),
        LOCK_UPDATE_DATA | LOCK_UPDATE_META | LOCK_INODE_SIZE,
    );
    lock::lock_prepare_parent_inode(core, &mut fop, new, None, LOCK_UPDATE_DATA | LOCK_UPDATE_META);
    let _ = lock::lock(core, &mut fop);

    let trusted = old
        .parent
        .map(|p| core.iatt_trusted(&fop, p))
        .unwrap_or(false);
    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_rename(trusted), |idx| {
            core.bricks[idx].rename(old, new, &req)
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
        let mut ias = [
            reply.iatt,
            reply.preoldparent,
            reply.postoldparent,
            reply.prenewparent,
            reply.postnewparent,
        ];
        rebuild_iatts(core, count, &mut ias);
        reply.iatt = ias[0];
        reply.preoldparent = ias[1];
        reply.postoldparent = ias[2];
        reply.prenewparent = ias[3];
        reply.postnewparent = ias[4];
        if let Some(size) = fop.locks.iter().find_map(|l| l.size) {
            reply.iatt.size = size;
        }
    }

    finish(core, fop, answer)
}

// ---------------------------------------------------------------------------
// unlink / rmdir
// ---------------------------------------------------------------------------

fn remove_common(
    core: &Arc<Core>,
    mut fop: Fop,
    loc: &Loc,
    rmdir_op: bool,
    flags: u32,
) -> EcResult<ParentReply> {
    let parent_gfid = loc.parent.unwrap_or(crate::types::Gfid::NULL);
    let trusted = core.iatt_trusted(&fop, parent_gfid);

    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_parent(trusted), |idx| {
            if rmdir_op {
                core.bricks[idx].rmdir(loc, flags, &req)
            } else {
                core.bricks[idx].unlink(loc, flags, &req)
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
        let mut ias = [reply.preparent, reply.postparent];
        rebuild_iatts(core, count, &mut ias);
        reply.preparent = ias[0];
        reply.postparent = ias[1];
        if !loc.gfid.is_null() {
            core.inodes.evict(loc.gfid);
        }
    }

    finish(core, fop, answer)
}

pub(crate) fn unlink(core: &Arc<Core>, loc: &Loc, flags: u32) -> EcResult<ParentReply> {
    let mut fop = begin(core, FopKind::Unlink, 0, Minimum::Min);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());
    lock::lock_prepare_parent_inode(core, &mut fop, loc, None, LOCK_UPDATE_DATA | LOCK_UPDATE_META);
    let _ = lock::lock(core, &mut fop);
    remove_common(core, fop, loc, false, flags)
}

pub(crate) fn rmdir(core: &Arc<Core>, loc: &Loc, flags: u32) -> EcResult<ParentReply> {
    let mut fop = begin(core, FopKind::Rmdir, 0, Minimum::Min);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());
    lock::lock_prepare_parent_inode(core, &mut fop, loc, None, LOCK_UPDATE_DATA | LOCK_UPDATE_META);
    let _ = lock::lock(core, &mut fop);
    remove_common(core, fop, loc, true, flags)
}
