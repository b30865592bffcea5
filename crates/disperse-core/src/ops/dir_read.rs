//! Directory read operations: opendir, readdir and readdirp.
//!
//! Listings come from a single brick. A continued listing (offset != 0)
//! must stay on the brick that produced the previous chunk, so the fd
//! remembers which brick is serving it.

use std::sync::Arc;

use crate::brick::{EmptyReply, ReaddirReply};
use crate::engine::{Core, Shape};
use crate::errors::EcResult;
use crate::fop::{FLAG_LOCK_SHARED, FopKind, LOCK_QUERY_INFO, Minimum};
use crate::lock;
use crate::mask::BrickMask;
use crate::types::{FdHandle, Loc};

use super::{begin, finish, main_req, merge_empty, merge_readdir, rebuild_iatts};

pub(crate) fn opendir(
    core: &Arc<Core>,
    loc: &Loc,
) -> EcResult<(EmptyReply, BrickMask)> {
    let mut fop = begin(core, FopKind::Opendir, FLAG_LOCK_SHARED, Minimum::Min);
    fop.gfid = loc.gfid;
    fop.heal_locs.push(loc.clone());
    fop.heal_partial = true;

    lock::lock_prepare_inode(core, &mut fop, loc, LOCK_QUERY_INFO);
    let _ = lock::lock(core, &mut fop);

    let answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].opendir(loc, &req)
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    let open_mask = answer.as_ref().map(|a| a.mask).unwrap_or_default();
    finish(core, fop, answer).map(|reply| (reply, open_mask))
}

/// One chunk of a directory listing. `brick_hint` pins a continued
/// listing to its brick; the brick that answered is returned so the
/// caller can pin the next chunk.
pub(crate) fn readdir(
    core: &Arc<Core>,
    fd: &FdHandle,
    size: u64,
    offset: u64,
    plus: bool,
    open_mask: BrickMask,
    brick_hint: Option<usize>,
) -> EcResult<(ReaddirReply, usize)> {
    let kind = if plus { FopKind::Readdirp } else { FopKind::Readdir };
    let mut fop = begin(core, kind, FLAG_LOCK_SHARED, Minimum::One);
    fop.gfid = fd.gfid;
    fop.mask &= open_mask;

    // The first chunk runs under the inode lock; continuations are
    // pinned to their brick and cannot take it again usefully.
    if offset == 0 && brick_hint.is_none() {
        lock::lock_prepare_fd(core, &mut fop, fd, LOCK_QUERY_INFO);
        let _ = lock::lock(core, &mut fop);
    }

    let mut answer = if !fop.failed() {
        let req = main_req(core, &fop);
        let wind = |idx: usize| {
            if plus {
                core.bricks[idx].readdirp(fd, size, offset, &req)
            } else {
                core.bricks[idx].readdir(fd, size, offset, &req)
            }
        };
        match brick_hint {
            Some(idx) => {
                // Continuations cannot hop bricks: offsets are opaque and
                // per-brick.
                fop.mask &= BrickMask::bit(idx);
                let answers = core.dispatch(&mut fop, Shape::One, merge_readdir, wind);
                core.prepare_answer(&mut fop, answers)
            }
            None => core.dispatch_one_retry(&mut fop, merge_readdir, wind),
        }
    } else {
        None
    };

    let served_by = answer
        .as_ref()
        .map(|a| a.min_idx)
        .or(brick_hint)
        .unwrap_or(0);

    if let Some(ans) = answer.as_mut()
        && ans.is_success()
        && plus
    {
        let reply = ans.result.as_mut().expect("checked success");
        for entry in reply.entries.iter_mut() {
            if let Some(iatt) = entry.iatt.as_mut() {
                let mut ias = [*iatt];
                rebuild_iatts(core, 1, &mut ias);
                *iatt = ias[0];
            }
        }
    }

    finish(core, fop, answer).map(|reply| (reply, served_by))
}
