//! Pass-through advisory lock operations. The engine adds no semantics
//! of its own here beyond fan-out and answer grouping; unlock flavours
//! must reach every brick that may hold the lock.

use std::sync::Arc;

use crate::brick::{EmptyReply, EntrylkCmd, EntrylkType, LkReply, LockCmd};
use crate::engine::{Core, Shape};
use crate::errors::EcResult;
use crate::fop::{FopKind, Minimum};
use crate::types::{FdHandle, Flock, FlockType, Loc};
use crate::xdata::Xdata;

use super::{begin, finish, merge_empty};

fn is_unlock(flock: &Flock) -> bool {
    flock.kind == FlockType::Unlock
}

/// Queries grow their brick set one answer at a time; everything else
/// fans out at once.
fn lock_shape(cmd: LockCmd) -> Shape {
    if cmd == LockCmd::GetLk { Shape::Inc } else { Shape::All }
}

pub(crate) fn inodelk(
    core: &Arc<Core>,
    domain: &str,
    loc: &Loc,
    cmd: LockCmd,
    flock: &Flock,
) -> EcResult<EmptyReply> {
    let mut fop = if is_unlock(flock) {
        super::begin_must_wind(core, FopKind::Inodelk, Minimum::All)
    } else {
        begin(core, FopKind::Inodelk, 0, Minimum::All)
    };
    fop.gfid = loc.gfid;

    let answer = if !fop.failed() {
        let answers = core.dispatch(&mut fop, lock_shape(cmd), merge_empty, |idx| {
            core.bricks[idx].inodelk(domain, loc, cmd, flock, &Xdata::new())
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

pub(crate) fn finodelk(
    core: &Arc<Core>,
    domain: &str,
    fd: &FdHandle,
    cmd: LockCmd,
    flock: &Flock,
) -> EcResult<EmptyReply> {
    let mut fop = if is_unlock(flock) {
        super::begin_must_wind(core, FopKind::Finodelk, Minimum::All)
    } else {
        begin(core, FopKind::Finodelk, 0, Minimum::All)
    };
    fop.gfid = fd.gfid;

    let answer = if !fop.failed() {
        let answers = core.dispatch(&mut fop, lock_shape(cmd), merge_empty, |idx| {
            core.bricks[idx].finodelk(domain, fd, cmd, flock, &Xdata::new())
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

pub(crate) fn entrylk(
    core: &Arc<Core>,
    domain: &str,
    loc: &Loc,
    basename: Option<&str>,
    cmd: EntrylkCmd,
    kind: EntrylkType,
) -> EcResult<EmptyReply> {
    let mut fop = if cmd == EntrylkCmd::Unlock {
        super::begin_must_wind(core, FopKind::Entrylk, Minimum::All)
    } else {
        begin(core, FopKind::Entrylk, 0, Minimum::All)
    };
    fop.gfid = loc.gfid;

    let answer = if !fop.failed() {
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].entrylk(domain, loc, basename, cmd, kind, &Xdata::new())
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

pub(crate) fn fentrylk(
    core: &Arc<Core>,
    domain: &str,
    fd: &FdHandle,
    basename: Option<&str>,
    cmd: EntrylkCmd,
    kind: EntrylkType,
) -> EcResult<EmptyReply> {
    let mut fop = if cmd == EntrylkCmd::Unlock {
        super::begin_must_wind(core, FopKind::Fentrylk, Minimum::All)
    } else {
        begin(core, FopKind::Fentrylk, 0, Minimum::All)
    };
    fop.gfid = fd.gfid;

    let answer = if !fop.failed() {
        let answers = core.dispatch(&mut fop, Shape::All, merge_empty, |idx| {
            core.bricks[idx].fentrylk(domain, fd, basename, cmd, kind, &Xdata::new())
        });
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}

pub(crate) fn lk(core: &Arc<Core>, fd: &FdHandle, cmd: LockCmd, flock: &Flock) -> EcResult<LkReply> {
    let mut fop = if is_unlock(flock) {
        super::begin_must_wind(core, FopKind::Lk, Minimum::All)
    } else {
        begin(core, FopKind::Lk, 0, Minimum::All)
    };
    fop.gfid = fd.gfid;

    let answer = if !fop.failed() {
        let answers = core.dispatch(
            &mut fop,
            lock_shape(cmd),
            |dst: &mut LkReply, src: &LkReply| dst.flock == src.flock,
            |idx| core.bricks[idx].lk(fd, cmd, flock, &Xdata::new()),
        );
        core.prepare_answer(&mut fop, answers)
    } else {
        None
    };

    finish(core, fop, answer)
}
