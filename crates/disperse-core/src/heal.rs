//! The self-heal engine.
//!
//! Healing diagnoses divergence from the versioned metadata, picks
//! sources and sinks, and rebuilds metadata, entry names and file
//! content under locks in a dedicated `<volume>:self-heal` domain.
//! Background requests go through a bounded queue: `background-heals`
//! active slots plus `heal-wait-qlen` waiting slots, everything beyond
//! that fails fast with EBUSY.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::brick::{LockCmd, MkArgs, XattropOp};
use crate::engine::Core;
use crate::errors::{EcError, EcResult};
use crate::mask::BrickMask;
use crate::ondisk::{
    self, SELFHEAL_BIT, TXN_DATA, TXN_METADATA, XATTR_DIRTY, XATTR_SIZE, XATTR_VERSION,
};
use crate::types::{
    Errno, FdHandle, FileType, Flock, FlockType, Gfid, Loc, OpResult, SetAttr, setattr_valid,
};
use crate::xdata::{Xdata, keys};

/// Xattrs never copied or erased by metadata heal.
const HEAL_IGNORE_XATTRS: [&str; 2] = ["security.selinux", keys::QUOTA_SIZE];

/// Result of one heal pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealOutcome {
    /// Bricks that participated.
    pub mask: BrickMask,
    /// Bricks holding authoritative state.
    pub good: BrickMask,
    /// Bricks that were rebuilt.
    pub bad: BrickMask,
    /// Nothing was wrong.
    pub healthy: bool,
}

// ---------------------------------------------------------------------------
// Background throttle
// ---------------------------------------------------------------------------

struct HealRequest {
    loc: Loc,
    partial: bool,
}

/// Bounded background heal queue: an active counter pair plus a waiting
/// list; admission is decided under the queue mutex.
pub(crate) struct HealQueue {
    active: AtomicU32,
    waiting: Mutex<VecDeque<HealRequest>>,
    background_heals: u32,
    heal_wait_qlen: u32,
}

impl HealQueue {
    pub fn new(background_heals: u32, heal_wait_qlen: u32) -> Self {
        HealQueue {
            active: AtomicU32::new(0),
            waiting: Mutex::new(VecDeque::new()),
            background_heals,
            heal_wait_qlen,
        }
    }

    pub fn active(&self) -> u32 {
        self.active.load(Ordering::Acquire)
    }

    pub fn waiting(&self) -> u32 {
        self.waiting.lock().len() as u32
    }
}

/// Queue a background heal of `loc`, dropping the request with a debug
/// log when the queue is saturated.
pub(crate) fn schedule_background(core: &Arc<Core>, loc: Loc, partial: bool) {
    if core.shutdown.load(Ordering::Acquire) || core.heal.background_heals == 0 {
        return;
    }
    if loc.gfid.is_null() {
        return;
    }
    {
        let queue = &core.heal;
        let mut waiting = queue.waiting.lock();
        let load = queue.active.load(Ordering::Acquire) + waiting.len() as u32;
        if load >= queue.background_heals + queue.heal_wait_qlen {
            log::debug!(
                "{}: max number of heals are pending, background self-heal rejected",
                core.name
            );
            return;
        }
        waiting.push_back(HealRequest { loc, partial });
    }
    launch_next(core);
}

fn launch_next(core: &Arc<Core>) {
    let request = {
        let queue = &core.heal;
        let mut waiting = queue.waiting.lock();
        if queue.active.load(Ordering::Acquire) >= queue.background_heals {
            return;
        }
        let Some(req) = waiting.pop_front() else {
            return;
        };
        queue.active.fetch_add(1, Ordering::AcqRel);
        req
    };

    let core2 = Arc::clone(core);
    let spawned = std::thread::Builder::new()
        .name("disperse-heal".to_string())
        .spawn(move || {
            let outcome = heal(&core2, &request.loc, request.partial);
            match outcome {
                Ok(o) if !o.healthy => {
                    log::debug!(
                        "{}: heal of {} finished (good {}, bad {})",
                        core2.name,
                        request.loc.gfid,
                        o.good,
                        o.bad
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    log::debug!("{}: heal of {} failed: {}", core2.name, request.loc.gfid, e);
                }
            }
            core2.heal.active.fetch_sub(1, Ordering::AcqRel);
            launch_next(&core2);
        });
    if spawned.is_err() {
        core.heal.active.fetch_sub(1, Ordering::AcqRel);
    }
}

// ---------------------------------------------------------------------------
// Cluster helpers (per-brick sync fan-out)
// ---------------------------------------------------------------------------

fn cluster<R>(
    core: &Core,
    on: BrickMask,
    f: impl Fn(usize) -> OpResult<R>,
) -> Vec<Option<Result<R, Errno>>> {
    (0..core.geom.nodes)
        .map(|idx| if on.contains(idx) { Some(f(idx)) } else { None })
        .collect()
}

fn ok_mask<R>(replies: &[Option<Result<R, Errno>>]) -> BrickMask {
    let mut mask = BrickMask::EMPTY;
    for (idx, reply) in replies.iter().enumerate() {
        if matches!(reply, Some(Ok(_))) {
            mask.set(idx);
        }
    }
    mask
}

/// Take the self-heal (or main) domain lock on every brick in `on` with
/// an owner token from [`crate::lock::next_lock_token`]. Returns the
/// mask of bricks where it was granted.
fn cluster_lock(
    core: &Core,
    domain: &str,
    gfid: Gfid,
    on: BrickMask,
    owner: u64,
    blocking: bool,
) -> BrickMask {
    let loc = Loc::from_gfid(gfid);
    let flock = Flock::whole_file(FlockType::Write, owner);
    let cmd = if blocking { LockCmd::SetLkWait } else { LockCmd::SetLk };
    let replies = cluster(core, on, |idx| {
        core.bricks[idx].inodelk(domain, &loc, cmd, &flock, &Xdata::new())
    });
    ok_mask(&replies)
}

fn cluster_unlock(core: &Core, domain: &str, gfid: Gfid, on: BrickMask, owner: u64) {
    let loc = Loc::from_gfid(gfid);
    let flock = Flock::whole_file(FlockType::Unlock, owner);
    let _ = cluster(core, on, |idx| {
        core.bricks[idx].inodelk(domain, &loc, LockCmd::SetLk, &flock, &Xdata::new())
    });
}

fn selfheal_domain(core: &Core) -> String {
    format!("{}:self-heal", core.name)
}

/// Versioned metadata of one brick as read during inspection.
#[derive(Debug, Clone, Copy, Default)]
struct BrickVersions {
    version: [u64; 2],
    dirty: [u64; 2],
    size: u64,
}

fn metadata_request() -> Xdata {
    let mut req = Xdata::new();
    req.set_u64(XATTR_VERSION, 0);
    req.set_u64(XATTR_DIRTY, 0);
    req.set_u64(XATTR_SIZE, 0);
    req
}

fn parse_versions(xdata: &Xdata) -> BrickVersions {
    let mut out = BrickVersions::default();
    if let Some(raw) = xdata.get_bin(XATTR_VERSION)
        && let Ok(pair) = ondisk::decode_u64_pair(raw)
    {
        out.version = pair;
    }
    if let Some(raw) = xdata.get_bin(XATTR_DIRTY)
        && let Ok(pair) = ondisk::decode_u64_pair(raw)
    {
        out.dirty = pair;
    }
    if let Some(raw) = xdata.get_bin(XATTR_SIZE)
        && let Ok(size) = ondisk::decode_u64(raw)
    {
        out.size = size;
    }
    out
}

/// Group bricks by `(data version, meta version, size)` and return the
/// best group with a representative source.
fn find_direction(
    versions: &[Option<BrickVersions>],
) -> Result<(BrickMask, BrickMask, usize), Errno> {
    let mut groups: HashMap<(u64, u64, u64), BrickMask> = HashMap::new();
    for (idx, v) in versions.iter().enumerate() {
        if let Some(v) = v {
            let key = (v.version[TXN_DATA], v.version[TXN_METADATA], v.size);
            groups.entry(key).or_insert(BrickMask::EMPTY).set(idx);
        }
    }

    let mut best: Option<(BrickMask, (u64, u64, u64))> = None;
    for (key, mask) in groups {
        let better = match &best {
            None => true,
            Some((bmask, bkey)) => {
                mask.count() > bmask.count() || (mask.count() == bmask.count() && key > *bkey)
            }
        };
        if better {
            best = Some((mask, key));
        }
    }

    let (sources, _) = best.ok_or(libc::EIO)?;
    let mut sinks = BrickMask::EMPTY;
    for (idx, v) in versions.iter().enumerate() {
        if v.is_some() && !sources.contains(idx) {
            sinks.set(idx);
        }
    }
    let source = sources.first().ok_or(libc::EIO)?;
    Ok((sources, sinks, source))
}

// ---------------------------------------------------------------------------
// Inspection
// ---------------------------------------------------------------------------

/// Cheap divergence check: one lookup on every live brick reading the
/// versioned metadata and the lock count.
pub(crate) fn inspect(core: &Arc<Core>, gfid: Gfid) -> Result<bool, Errno> {
    let up = core.up_mask();
    let loc = Loc::from_gfid(gfid);
    let mut req = metadata_request();
    req.set_str(keys::INODELK_COUNT, &core.name);

    let replies = cluster(core, up, |idx| core.bricks[idx].lookup(&loc, &req));
    let answered = ok_mask(&replies);
    if answered != core.node_mask {
        return Ok(true);
    }

    let mut lock_count = 0;
    let versions: Vec<Option<BrickVersions>> = replies
        .iter()
        .map(|r| match r {
            Some(Ok(reply)) => {
                if let Some(c) = reply.xdata.get_u32(keys::INODELK_COUNT) {
                    lock_count = lock_count.max(c);
                }
                Some(parse_versions(&reply.xdata))
            }
            _ => None,
        })
        .collect();

    let (sources, _, _) = find_direction(&versions)?;
    if sources.count() < core.geom.fragments {
        // Not enough agreeing bricks; unrecoverable but heal-worthy.
        return Ok(true);
    }

    // Healthy: every brick agrees and nobody holds more than the one
    // observed lock.
    let healthy = sources.count() == core.geom.nodes && lock_count <= 1;
    Ok(!healthy)
}

// ---------------------------------------------------------------------------
// Metadata heal
// ---------------------------------------------------------------------------

fn internal_or_ignored_xattr(key: &str) -> bool {
    key.starts_with("trusted.ec.") || HEAL_IGNORE_XATTRS.contains(&key)
}

fn filtered_xattrs(xattrs: &Xdata) -> Vec<(String, crate::xdata::XdataValue)> {
    xattrs
        .iter()
        .filter(|(k, _)| !internal_or_ignored_xattr(k))
        .map(|(k, v)| (k.to_string(), v.clone()))
        .collect()
}

/// Heal inode metadata: pick the largest group agreeing on ownership,
/// permissions and user xattrs, then overwrite the rest from it.
pub(crate) fn heal_metadata(core: &Arc<Core>, gfid: Gfid) -> Result<(BrickMask, BrickMask), Errno> {
    let up = core.up_mask();
    let owner = crate::lock::next_lock_token();
    let locked = cluster_lock(core, &core.name, gfid, up, owner, true);
    if locked.count() <= core.geom.fragments {
        cluster_unlock(core, &core.name, gfid, locked, owner);
        return Err(libc::ENOTCONN);
    }

    let result = heal_metadata_locked(core, gfid, locked);
    cluster_unlock(core, &core.name, gfid, locked, owner);
    result
}

fn heal_metadata_locked(
    core: &Arc<Core>,
    gfid: Gfid,
    locked: BrickMask,
) -> Result<(BrickMask, BrickMask), Errno> {
    let loc = Loc::from_gfid(gfid);
    let req = metadata_request();

    let lookups = cluster(core, locked, |idx| core.bricks[idx].lookup(&loc, &req));
    if ok_mask(&lookups).count() <= core.geom.fragments {
        return Err(libc::ENOTCONN);
    }
    let xattrs = cluster(core, ok_mask(&lookups), |idx| {
        core.bricks[idx].getxattr(&loc, None, &Xdata::new())
    });

    // Group by identity + permissions + filtered xattrs.
    let mut meta_versions = vec![0u64; core.geom.nodes];
    let mut dirties = vec![0u64; core.geom.nodes];
    let mut groups: Vec<(BrickMask, usize)> = Vec::new();
    for idx in ok_mask(&lookups).iter() {
        let Some(Ok(lookup)) = &lookups[idx] else { continue };
        let Some(Ok(xat)) = &xattrs[idx] else { continue };
        let v = parse_versions(&lookup.xdata);
        meta_versions[idx] = v.version[TXN_METADATA];
        dirties[idx] = v.dirty[TXN_METADATA];

        let mut placed = false;
        for (mask, rep) in groups.iter_mut() {
            let Some(Ok(rl)) = &lookups[*rep] else { continue };
            let Some(Ok(rx)) = &xattrs[*rep] else { continue };
            let same_iatt = rl.iatt.gfid == lookup.iatt.gfid
                && rl.iatt.file_type == lookup.iatt.file_type
                && rl.iatt.mode == lookup.iatt.mode
                && rl.iatt.uid == lookup.iatt.uid
                && rl.iatt.gid == lookup.iatt.gid;
            if same_iatt && filtered_xattrs(&rx.xattrs) == filtered_xattrs(&xat.xattrs) {
                mask.set(idx);
                placed = true;
                break;
            }
        }
        if !placed {
            groups.push((BrickMask::bit(idx), idx));
        }
    }

    let (mut sources, mut rep) = groups
        .iter()
        .max_by_key(|(mask, _)| mask.count())
        .copied()
        .ok_or(libc::EIO)?;
    if sources.count() < core.geom.fragments {
        return Err(libc::EIO);
    }
    // Prefer the highest metadata version inside the best group.
    for idx in sources.iter() {
        if meta_versions[idx] > meta_versions[rep] {
            rep = idx;
        }
    }

    let mut sinks = ok_mask(&lookups) & !sources;
    if sinks.is_empty() {
        adjust_versions(
            core,
            gfid,
            None,
            TXN_METADATA,
            rep,
            sources,
            sinks,
            &meta_versions,
            &dirties,
            None,
        );
        return Ok((sources, sinks));
    }

    let source_lookup = match &lookups[rep] {
        Some(Ok(l)) => l.clone(),
        _ => return Err(libc::EIO),
    };
    let source_xattrs = match &xattrs[rep] {
        Some(Ok(x)) => x.xattrs.clone(),
        _ => return Err(libc::EIO),
    };

    // Overwrite ownership and permissions.
    let attr = SetAttr {
        mode: source_lookup.iatt.mode,
        uid: source_lookup.iatt.uid,
        gid: source_lookup.iatt.gid,
        atime: source_lookup.iatt.atime,
        mtime: source_lookup.iatt.mtime,
    };
    let valid = setattr_valid::MODE | setattr_valid::UID | setattr_valid::GID;
    let setattrs = cluster(core, sinks, |idx| {
        core.bricks[idx].setattr(&loc, &attr, valid, &Xdata::new())
    });
    sinks &= ok_mask(&setattrs);

    // Remove xattrs the source does not have, then copy the source set.
    for idx in sinks.iter() {
        if let Some(Ok(sink_xattrs)) = &xattrs[idx] {
            for (key, _) in sink_xattrs.xattrs.iter() {
                if !internal_or_ignored_xattr(key) && !source_xattrs.contains(key) {
                    let _ = core.bricks[idx].removexattr(&loc, key, &Xdata::new());
                }
            }
        }
    }
    let mut copy = Xdata::new();
    for (key, value) in filtered_xattrs(&source_xattrs) {
        copy.set(&key, value);
    }
    if !copy.is_empty() {
        let setx = cluster(core, sinks, |idx| {
            core.bricks[idx].setxattr(&loc, &copy, 0, &Xdata::new())
        });
        sinks &= ok_mask(&setx);
    }
    if sinks.is_empty() {
        return Err(libc::ENOTCONN);
    }

    adjust_versions(
        core,
        gfid,
        None,
        TXN_METADATA,
        rep,
        sources,
        sinks,
        &meta_versions,
        &dirties,
        None,
    );
    Ok((sources, sinks))
}

/// Bring every participant's version (and size) in line with the source
/// through per-brick ADD_ARRAY64 deltas; erase dirty when all bricks
/// took part.
#[allow(clippy::too_many_arguments)]
fn adjust_versions(
    core: &Arc<Core>,
    gfid: Gfid,
    fd: Option<&FdHandle>,
    txn: usize,
    source: usize,
    sources: BrickMask,
    sinks: BrickMask,
    versions: &[u64],
    dirties: &[u64],
    sizes: Option<&[u64]>,
) {
    let loc = Loc::from_gfid(gfid);
    let erase_dirty = (sources | sinks) == core.node_mask;

    for idx in (sources | sinks).iter() {
        let mut deltas = Xdata::new();
        let vdelta = versions[source].wrapping_sub(versions[idx]);
        let mut pair = [0u64; 2];
        pair[txn] = vdelta;
        if pair != [0, 0] {
            deltas.set_bin(XATTR_VERSION, ondisk::encode_u64_pair(pair).to_vec());
        }
        if let Some(sizes) = sizes {
            let sdelta = sizes[source].wrapping_sub(sizes[idx]);
            if sdelta != 0 {
                deltas.set_bin(XATTR_SIZE, ondisk::encode_u64(sdelta).to_vec());
            }
        }
        if erase_dirty && dirties[idx] != 0 {
            let mut dirty = [0u64; 2];
            dirty[txn] = dirties[idx].wrapping_neg();
            deltas.set_bin(XATTR_DIRTY, ondisk::encode_u64_pair(dirty).to_vec());
        }
        if deltas.is_empty() {
            continue;
        }
        let result = match fd {
            Some(fd) => core.bricks[idx].fxattrop(fd, XattropOp::AddArray64, &deltas, &Xdata::new()),
            None => core.bricks[idx].xattrop(&loc, XattropOp::AddArray64, &deltas, &Xdata::new()),
        };
        if result.is_err() {
            log::debug!("{}: version adjust failed on brick {}", core.name, idx);
        }
    }
}

// ---------------------------------------------------------------------------
// Entry and name heal
// ---------------------------------------------------------------------------

/// Heal one directory entry name across the participants.
pub(crate) fn heal_name(
    core: &Arc<Core>,
    parent: Gfid,
    name: &str,
    participants: BrickMask,
) -> Result<BrickMask, Errno> {
    let entry_loc = Loc::entry(parent, name);
    let lookups = cluster(core, participants, |idx| {
        core.bricks[idx].lookup(&entry_loc, &Xdata::new())
    });

    // gfid -> bricks where the name resolves to it.
    let mut gfid_db: BTreeMap<Gfid, BrickMask> = BTreeMap::new();
    let mut enoent = BrickMask::EMPTY;
    let mut healthy_participants = participants;
    for idx in participants.iter() {
        match &lookups[idx] {
            Some(Ok(reply)) => {
                gfid_db.entry(reply.iatt.gfid).or_insert(BrickMask::EMPTY).set(idx);
            }
            Some(Err(e)) if *e == libc::ENOENT || *e == libc::ESTALE => {
                enoent.set(idx);
            }
            _ => {
                healthy_participants.clear(idx);
            }
        }
    }

    if gfid_db.len() > 1 {
        log::warn!(
            "{}: {}/{} resolves to multiple gfids, not healable",
            core.name,
            parent,
            name
        );
        return Ok(healthy_participants);
    }

    let Some((&gfid, &present_on)) = gfid_db.iter().next() else {
        // Name exists nowhere any more; nothing to do.
        return Ok(healthy_participants);
    };

    if present_on.count() < core.geom.fragments {
        // Check whether the file itself survives elsewhere before
        // declaring it unrecoverable.
        let gfid_loc = Loc::from_gfid(gfid);
        let by_gfid = cluster(core, core.up_mask(), |idx| {
            core.bricks[idx].lookup(&gfid_loc, &Xdata::new())
        });
        if ok_mask(&by_gfid).count() < core.geom.fragments {
            // Unrecoverable: delete the stale name.
            let is_dir = lookups.iter().flatten().find_map(|r| match r {
                Ok(reply) => Some(reply.iatt.file_type.is_dir()),
                Err(_) => None,
            });
            let removed = cluster(core, present_on, |idx| {
                if is_dir == Some(true) {
                    core.bricks[idx].rmdir(&entry_loc, 0, &Xdata::new()).map(|_| ())
                } else {
                    core.bricks[idx].unlink(&entry_loc, 0, &Xdata::new()).map(|_| ())
                }
            });
            let gone = ok_mask(&removed);
            log::debug!(
                "{}: deleted unrecoverable name {}/{} on {}",
                core.name,
                parent,
                name,
                gone
            );
            return Ok(healthy_participants);
        }
    }

    // Recreate the name on bricks missing it.
    let missing = enoent & healthy_participants & !present_on;
    if missing.is_empty() {
        return Ok(healthy_participants);
    }
    let source_idx = present_on.first().ok_or(libc::EIO)?;
    let source = match &lookups[source_idx] {
        Some(Ok(reply)) => reply.clone(),
        _ => return Err(libc::EIO),
    };

    let created = recreate_name(core, &entry_loc, gfid, &source.iatt, missing)?;
    let mut out = healthy_participants;
    for idx in missing.iter() {
        if !created.contains(idx) {
            out.clear(idx);
        }
    }
    Ok(out)
}

fn recreate_name(
    core: &Arc<Core>,
    entry_loc: &Loc,
    gfid: Gfid,
    iatt: &crate::types::Iatt,
    missing: BrickMask,
) -> Result<BrickMask, Errno> {
    let gfid_loc = Loc::from_gfid(gfid);
    let mut created = BrickMask::EMPTY;
    let mut fresh = BrickMask::EMPTY;

    for idx in missing.iter() {
        let brick = &core.bricks[idx];
        // A brick that already holds the inode only needs the link back.
        let has_inode = brick.lookup(&gfid_loc, &Xdata::new()).is_ok();
        let result: OpResult<()> = if has_inode && !iatt.file_type.is_dir() {
            brick.link(&gfid_loc, entry_loc, &Xdata::new()).map(|_| ())
        } else {
            let args = MkArgs {
                mode: iatt.mode,
                umask: 0,
                rdev: iatt.rdev,
                gfid,
                file_type: iatt.file_type,
            };
            match iatt.file_type {
                FileType::Directory => brick.mkdir(entry_loc, &args, &Xdata::new()).map(|_| ()),
                FileType::Symlink => {
                    let target = cluster(core, core.up_mask() & !missing, |i| {
                        core.bricks[i].readlink(&gfid_loc, &Xdata::new())
                    })
                    .into_iter()
                    .flatten()
                    .find_map(|r| r.ok().map(|r| r.target));
                    match target {
                        Some(target) => {
                            brick.symlink(&target, entry_loc, &args, &Xdata::new()).map(|_| ())
                        }
                        None => Err(libc::EIO),
                    }
                }
                FileType::Regular => {
                    let mut req = crate::ops::dir_write::creation_seed(core);
                    req.mark_internal();
                    brick.mknod(entry_loc, &args, &req).map(|_| ())
                }
                _ => brick.mknod(entry_loc, &args, &Xdata::new()).map(|_| ()),
            }
        };
        match result {
            Ok(()) => {
                created.set(idx);
                if !has_inode {
                    fresh.set(idx);
                }
            }
            Err(e) => {
                log::debug!(
                    "{}: name recreation of {:?} failed on brick {} (errno {})",
                    core.name,
                    entry_loc.name,
                    idx,
                    e
                );
            }
        }
    }

    // Freshly created inodes are marked dirty so a later data/metadata
    // heal fills them in.
    if !fresh.is_empty() && !iatt.file_type.is_dir() {
        let mut dirty = [0u64, 1u64];
        if iatt.file_type.is_regular() {
            dirty[TXN_DATA] = 1;
        }
        let mut deltas = Xdata::new();
        deltas.set_bin(XATTR_DIRTY, ondisk::encode_u64_pair(dirty).to_vec());
        let _ = cluster(core, fresh, |idx| {
            core.bricks[idx].xattrop(&gfid_loc, XattropOp::AddArray64, &deltas, &Xdata::new())
        });
    }

    Ok(created)
}

/// Heal the names of a directory: walk every source brick's listing and
/// name-heal each entry.
pub(crate) fn heal_entry(core: &Arc<Core>, gfid: Gfid) -> Result<(BrickMask, BrickMask), Errno> {
    let up = core.up_mask();
    let domain = selfheal_domain(core);

    // Someone else healing this directory should not block us forever.
    let owner = crate::lock::next_lock_token();
    let locked = cluster_lock(core, &domain, gfid, up, owner, false);
    if locked.count() <= core.geom.fragments {
        cluster_unlock(core, &domain, gfid, locked, owner);
        return Err(libc::ENOTCONN);
    }
    let result = heal_entry_locked(core, gfid, locked);
    cluster_unlock(core, &domain, gfid, locked, owner);
    result
}

fn heal_entry_locked(
    core: &Arc<Core>,
    gfid: Gfid,
    locked: BrickMask,
) -> Result<(BrickMask, BrickMask), Errno> {
    let loc = Loc::from_gfid(gfid);
    let req = metadata_request();

    let lookups = cluster(core, locked, |idx| core.bricks[idx].lookup(&loc, &req));
    let answered = ok_mask(&lookups);
    if answered.count() <= core.geom.fragments {
        return Err(libc::ENOTCONN);
    }

    let mut versions = vec![0u64; core.geom.nodes];
    let mut dirties = vec![0u64; core.geom.nodes];
    let parsed: Vec<Option<BrickVersions>> = lookups
        .iter()
        .map(|r| match r {
            Some(Ok(reply)) => Some(parse_versions(&reply.xdata)),
            _ => None,
        })
        .collect();
    for (idx, v) in parsed.iter().enumerate() {
        if let Some(v) = v {
            versions[idx] = v.version[TXN_DATA];
            dirties[idx] = v.dirty[TXN_DATA];
        }
    }

    // Sources share the highest data version.
    let max_version = versions.iter().max().copied().unwrap_or(0);
    let mut sources = BrickMask::EMPTY;
    let mut sinks = BrickMask::EMPTY;
    let mut source = None;
    for idx in answered.iter() {
        if versions[idx] == max_version {
            sources.set(idx);
            source.get_or_insert(idx);
        } else {
            sinks.set(idx);
        }
    }
    let source = source.ok_or(libc::EIO)?;

    // Walk the union of the directory listings, healing each name.
    let mut participants = answered;
    let fd = FdHandle { gfid, flags: 0 };
    for brick_idx in sources.iter() {
        let mut offset = 0u64;
        loop {
            let chunk = match core.bricks[brick_idx].readdir(&fd, 4096, offset, &Xdata::new()) {
                Ok(chunk) => chunk,
                Err(_) => break,
            };
            if chunk.entries.is_empty() {
                break;
            }
            for entry in &chunk.entries {
                offset = entry.offset;
                if entry.name == "." || entry.name == ".." {
                    continue;
                }
                match heal_name(core, gfid, &entry.name, participants) {
                    Ok(ok_on) => participants &= ok_on,
                    Err(e) => {
                        log::debug!(
                            "{}: name heal of {}/{} failed: errno {}",
                            core.name,
                            gfid,
                            entry.name,
                            e
                        );
                    }
                }
            }
            if participants.count() <= core.geom.fragments {
                return Err(libc::ENOTCONN);
            }
        }
    }

    sources &= participants;
    sinks &= participants;
    adjust_versions(
        core, gfid, None, TXN_DATA, source, sources, sinks, &versions, &dirties, None,
    );
    Ok((sources, sinks))
}

// ---------------------------------------------------------------------------
// Data heal
// ---------------------------------------------------------------------------

/// Rebuild the fragments of a regular file on its sinks from K sources.
pub(crate) fn heal_data(core: &Arc<Core>, gfid: Gfid) -> Result<(BrickMask, BrickMask), Errno> {
    let up = core.up_mask();
    let domain = selfheal_domain(core);

    let owner = crate::lock::next_lock_token();
    let locked = cluster_lock(core, &domain, gfid, up, owner, false);
    if locked.count() <= core.geom.fragments {
        cluster_unlock(core, &domain, gfid, locked, owner);
        return Err(libc::ENOTCONN);
    }
    let result = heal_data_locked(core, gfid, locked);
    cluster_unlock(core, &domain, gfid, locked, owner);
    result
}

fn heal_data_locked(
    core: &Arc<Core>,
    gfid: Gfid,
    locked: BrickMask,
) -> Result<(BrickMask, BrickMask), Errno> {
    let fd = FdHandle { gfid, flags: 0 };
    let k = core.geom.fragments as u64;

    // Read version/dirty/size per brick through a no-op xattrop.
    let mut zero = Xdata::new();
    zero.set_bin(XATTR_VERSION, ondisk::encode_u64_pair([0, 0]).to_vec());
    zero.set_bin(XATTR_DIRTY, ondisk::encode_u64_pair([0, 0]).to_vec());
    zero.set_bin(XATTR_SIZE, ondisk::encode_u64(0).to_vec());
    let xattrops = cluster(core, locked, |idx| {
        core.bricks[idx].fxattrop(&fd, XattropOp::AddArray64, &zero, &Xdata::new())
    });
    if ok_mask(&xattrops).count() <= core.geom.fragments {
        return Err(libc::ENOTCONN);
    }

    let parsed: Vec<Option<BrickVersions>> = xattrops
        .iter()
        .map(|r| match r {
            Some(Ok(reply)) => Some(parse_versions(&reply.xattrs)),
            _ => None,
        })
        .collect();
    let (mut sources, mut sinks, mut source) = find_direction(&parsed)?;
    if sources.count() < core.geom.fragments {
        return Err(libc::EIO);
    }

    let mut versions = vec![0u64; core.geom.nodes];
    let mut dirties = vec![0u64; core.geom.nodes];
    let mut sizes = vec![0u64; core.geom.nodes];
    for (idx, v) in parsed.iter().enumerate() {
        if let Some(v) = v {
            versions[idx] = v.version[TXN_DATA];
            dirties[idx] = v.dirty[TXN_DATA];
            sizes[idx] = v.size;
        }
    }

    // Disk contents can lag the metadata after a crash: demote sources
    // whose physical fragment size disagrees.
    let expected_frag = core.geom.align_size_up(sizes[source]) / k;
    let stats = cluster(core, sources | sinks, |idx| {
        core.bricks[idx].fstat(&fd, &Xdata::new())
    });
    let mut trim = BrickMask::EMPTY;
    let source_candidates: Vec<usize> = sources.iter().collect();
    for idx in source_candidates {
        match &stats[idx] {
            Some(Ok(reply)) if reply.iatt.size == expected_frag => {}
            _ => {
                sources.clear(idx);
                sinks.set(idx);
            }
        }
    }
    let sink_list: Vec<usize> = sinks.iter().collect();
    for idx in sink_list {
        if let Some(Ok(reply)) = &stats[idx]
            && reply.iatt.size != 0
        {
            trim.set(idx);
        }
    }
    if sources.count() < core.geom.fragments {
        return Err(libc::ENOTCONN);
    }
    if !sources.contains(source) {
        source = sources.first().expect("sources nonempty");
    }
    if sinks.is_empty() {
        adjust_versions(
            core, gfid, Some(&fd), TXN_DATA, source, sources, sinks, &versions, &dirties,
            Some(&sizes),
        );
        return Ok((sources, sinks));
    }

    // Mark sinks so readers avoid them while their content is rebuilt.
    let mut mark = Xdata::new();
    let mut pair = [0u64; 2];
    pair[TXN_DATA] = 1u64 << SELFHEAL_BIT;
    mark.set_bin(XATTR_VERSION, ondisk::encode_u64_pair(pair).to_vec());
    let sink_list: Vec<usize> = sinks.iter().collect();
    for idx in sink_list {
        if (versions[idx] >> SELFHEAL_BIT) & 1 == 1 {
            continue;
        }
        match core.bricks[idx].fxattrop(&fd, XattropOp::AddArray64, &mark, &Xdata::new()) {
            Ok(_) => versions[idx] |= 1 << SELFHEAL_BIT,
            Err(_) => {
                sinks.clear(idx);
                trim.clear(idx);
            }
        }
    }
    if sinks.is_empty() {
        return Err(libc::ENOTCONN);
    }

    // Expose the in-heal set to the lock manager so concurrent fops keep
    // winding to the sinks without trusting them.
    set_lock_healing(core, gfid, sinks, true);

    let result = rebuild_content(core, gfid, &fd, sources, &mut sinks, trim, sizes[source]);

    set_lock_healing(core, gfid, sinks, false);
    result?;

    // Restore times from the source and settle the versioned metadata.
    if let Some(Ok(stat)) = &stats[source] {
        let attr = SetAttr {
            mode: 0,
            uid: 0,
            gid: 0,
            atime: stat.iatt.atime,
            mtime: stat.iatt.mtime,
        };
        let _ = cluster(core, sources | sinks, |idx| {
            core.bricks[idx].fsetattr(
                &fd,
                &attr,
                setattr_valid::ATIME | setattr_valid::MTIME,
                &Xdata::new(),
            )
        });
    }
    adjust_versions(
        core, gfid, Some(&fd), TXN_DATA, source, sources, sinks, &versions, &dirties,
        Some(&sizes),
    );
    Ok((sources, sinks))
}

fn set_lock_healing(core: &Arc<Core>, gfid: Gfid, bricks: BrickMask, on: bool) {
    if let Some(entry) = core.inodes.peek(gfid) {
        let mut ctx = entry.ctx.lock();
        if let Some(lk) = ctx.lock.as_mut() {
            if on {
                lk.healing |= bricks;
            } else {
                lk.healing &= !bricks;
            }
        }
    }
}

/// Copy the file content from the sources to the sinks in stripe-aligned
/// windows, each under a whole-file lock in the main domain.
fn rebuild_content(
    core: &Arc<Core>,
    gfid: Gfid,
    fd: &FdHandle,
    sources: BrickMask,
    sinks: &mut BrickMask,
    trim: BrickMask,
    logical_size: u64,
) -> Result<(), Errno> {
    let stripe = core.geom.stripe_size;
    let window = stripe * u64::from(core.opts.self_heal_window_size.max(1));
    let total = core.geom.align_size_up(logical_size);

    // Stale sink fragments restart from nothing.
    let trimmed = cluster(core, trim, |idx| {
        core.bricks[idx].ftruncate(fd, 0, &Xdata::new())
    });
    let trimmed_ok = ok_mask(&trimmed);
    let trim_list: Vec<usize> = trim.iter().collect();
    for idx in trim_list {
        if !trimmed_ok.contains(idx) {
            sinks.clear(idx);
        }
    }
    if sinks.is_empty() {
        return Err(libc::ENOTCONN);
    }

    let mut offset = 0u64;
    while offset < total {
        let len = window.min(total - offset);

        // Block client writes for the window copy.
        let owner = crate::lock::next_lock_token();
        let locked = cluster_lock(core, &core.name, gfid, sources | *sinks, owner, true);
        let copy = copy_window(core, fd, offset, len, sources, *sinks);
        cluster_unlock(core, &core.name, gfid, locked, owner);
        copy?;

        offset += len;
    }
    Ok(())
}

fn copy_window(
    core: &Arc<Core>,
    fd: &FdHandle,
    offset: u64,
    len: u64,
    sources: BrickMask,
    sinks: BrickMask,
) -> Result<(), Errno> {
    let k = core.geom.fragments as u64;
    let frag_offset = offset / k;
    let frag_len = len / k;

    let reads = cluster(core, sources, |idx| {
        core.bricks[idx].readv(fd, frag_len, frag_offset, 0, &Xdata::new())
    });

    // Any K equally-sized fragments suffice to decode.
    let mut by_len: HashMap<usize, Vec<(usize, &[u8])>> = HashMap::new();
    for (idx, reply) in reads.iter().enumerate() {
        if let Some(Ok(r)) = reply {
            by_len.entry(r.data.len()).or_default().push((idx, &r.data));
        }
    }
    let fragments = by_len
        .into_values()
        .find(|group| group.len() >= core.geom.fragments)
        .ok_or(libc::EIO)?;

    if fragments[0].1.is_empty() {
        return Ok(());
    }
    let picked = &fragments[..core.geom.fragments];
    let data = core.codec.decode(picked).map_err(|e| {
        log::error!("{}: decode failed while healing {}: {}", core.name, fd.gfid, e);
        libc::EIO
    })?;

    let encoded = core.codec.encode(&data).map_err(|_| libc::EIO)?;
    for idx in sinks.iter() {
        if let Err(e) = core.bricks[idx].writev(fd, &encoded[idx], frag_offset, 0, &Xdata::new()) {
            log::warn!(
                "{}: heal write to brick {} failed (errno {})",
                core.name,
                idx,
                e
            );
            return Err(e);
        }
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Heal driver
// ---------------------------------------------------------------------------

/// Run a full heal of `loc`: inspect, then name, metadata and content
/// stages as the inode type requires. `partial` restricts directories to
/// name healing.
pub(crate) fn heal(core: &Arc<Core>, loc: &Loc, partial: bool) -> EcResult<HealOutcome> {
    let up = core.up_mask();
    let gfid = loc.gfid;
    if gfid.is_null() {
        return Err(EcError::from_errno(libc::EINVAL));
    }

    match inspect(core, gfid) {
        Ok(false) => {
            log::debug!("{}: heal is not required for {}", core.name, gfid);
            return Ok(HealOutcome {
                mask: up,
                good: up,
                bad: BrickMask::EMPTY,
                healthy: true,
            });
        }
        Ok(true) => {}
        Err(e) => return Err(EcError::from_errno(e)),
    }

    // Entry-name heal for the referencing name, when known.
    if let (Some(parent), Some(name)) = (loc.parent, loc.name.as_deref()) {
        match heal_name(core, parent, name, up) {
            Ok(on) => log::debug!("{}: name heal of {} successful on {}", core.name, name, on),
            Err(e) => log::debug!("{}: name heal of {} failed: errno {}", core.name, name, e),
        }
    }

    let (mgood, mbad) = heal_metadata(core, gfid).map_err(EcError::from_errno)?;

    let file_type = {
        let probe = cluster(core, up, |idx| {
            core.bricks[idx].lookup(&Loc::from_gfid(gfid), &Xdata::new())
        });
        probe
            .into_iter()
            .flatten()
            .find_map(|r| r.ok().map(|r| r.iatt.file_type))
            .unwrap_or(FileType::Invalid)
    };

    let (good, bad) = match file_type {
        FileType::Regular => heal_data(core, gfid).map_err(EcError::from_errno)?,
        FileType::Directory if !partial => heal_entry(core, gfid).map_err(EcError::from_errno)?,
        _ => (up, BrickMask::EMPTY),
    };

    Ok(HealOutcome {
        mask: up,
        good: mgood & good,
        bad: mbad | bad,
        healthy: false,
    })
}

/// The heal-info query: a lock-free inspect first, escalating to a
/// locked inspect only when the volume looks active.
pub(crate) fn get_heal_info(core: &Arc<Core>, loc: &Loc) -> EcResult<&'static str> {
    let gfid = loc.gfid;
    match inspect(core, gfid) {
        Ok(false) => return Ok("no-heal"),
        Ok(true) => {}
        Err(e) => return Err(EcError::from_errno(e)),
    }

    // Divergence may just be an in-flight update; re-inspect with every
    // brick locked to quiesce writers.
    let up = core.up_mask();
    let owner = crate::lock::next_lock_token();
    let locked = cluster_lock(core, &core.name, gfid, up, owner, true);
    let verdict = if locked != core.node_mask {
        Ok(true)
    } else {
        inspect(core, gfid)
    };
    cluster_unlock(core, &core.name, gfid, locked, owner);

    match verdict {
        Ok(true) => Ok("heal"),
        Ok(false) => Ok("no-heal"),
        Err(e) => Err(EcError::from_errno(e)),
    }
}
