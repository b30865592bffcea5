//! Public volume handle.
//!
//! A [`Disperse`] fans every file operation out across its bricks,
//! maintains the distributed locks and versioned metadata, and returns a
//! single coherent reply. Construction wires N brick clients and a
//! fragment codec to the engine; everything else is the fop surface.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use parking_lot::Mutex;

use disperse_codec::{FragmentCodec, RsCodec};

use crate::brick::{
    Brick, EmptyReply, EntryReply, EntrylkCmd, EntrylkType, IattReply, LkReply, LockCmd,
    LookupReply, MkArgs, ParentReply, PrePostReply, ReadReply, ReaddirReply, ReadlinkReply,
    RenameReply, SeekReply, StatfsReply, WriteReply, XattrReply, XattropOp,
};
use crate::config::VolumeOptions;
use crate::engine::Core;
use crate::errors::{EcError, EcResult};
use crate::heal::{self, HealOutcome};
use crate::mask::BrickMask;
use crate::ondisk::XATTR_HEAL;
use crate::ops;
use crate::types::{FdHandle, FileType, Flock, Gfid, Loc, SeekWhat, SetAttr};
use crate::xdata::Xdata;

/// An open file (or directory) on a dispersed volume.
#[derive(Clone)]
pub struct Fd {
    inner: Arc<FdInner>,
}

struct FdInner {
    handle: FdHandle,
    open_mask: AtomicU64,
    /// Brick pinned for continued directory listings.
    readdir_brick: Mutex<Option<usize>>,
}

impl Fd {
    fn new(handle: FdHandle, open_mask: BrickMask) -> Self {
        Fd {
            inner: Arc::new(FdInner {
                handle,
                open_mask: AtomicU64::new(open_mask.0),
                readdir_brick: Mutex::new(None),
            }),
        }
    }

    pub fn gfid(&self) -> Gfid {
        self.inner.handle.gfid
    }

    pub fn handle(&self) -> &FdHandle {
        &self.inner.handle
    }

    pub fn open_mask(&self) -> BrickMask {
        BrickMask(self.inner.open_mask.load(Ordering::Acquire))
    }
}

/// One dispersed (erasure-coded) volume.
pub struct Disperse {
    core: Arc<Core>,
    next_gfid: AtomicU64,
    gfid_nonce: u64,
}

impl Disperse {
    /// Assemble a volume over `bricks` with the default Reed-Solomon
    /// codec. The brick count must match `options.nodes`.
    pub fn new(name: &str, options: VolumeOptions, bricks: Vec<Arc<dyn Brick>>) -> EcResult<Self> {
        options
            .validate()
            .map_err(|_| EcError::from_errno(libc::EINVAL))?;
        if bricks.len() != usize::from(options.nodes) {
            return Err(EcError::from_errno(libc::EINVAL));
        }
        let geom = crate::config::EcGeometry::new(options.nodes, options.redundancy);
        let codec: Arc<dyn FragmentCodec> = Arc::new(RsCodec::new(
            geom.fragments,
            geom.redundancy,
            geom.fragment_size as usize,
        ));
        Self::with_codec(name, options, bricks, codec)
    }

    /// Assemble a volume with a caller-provided codec.
    pub fn with_codec(
        name: &str,
        options: VolumeOptions,
        bricks: Vec<Arc<dyn Brick>>,
        codec: Arc<dyn FragmentCodec>,
    ) -> EcResult<Self> {
        if bricks.len() != usize::from(options.nodes) {
            return Err(EcError::from_errno(libc::EINVAL));
        }
        let nonce = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(1);
        Ok(Disperse {
            core: Core::new(name, options, codec, bricks),
            next_gfid: AtomicU64::new(2),
            gfid_nonce: nonce,
        })
    }

    /// Fresh gfid for a new inode.
    pub fn generate_gfid(&self) -> Gfid {
        let seq = self.next_gfid.fetch_add(1, Ordering::Relaxed);
        let mut bytes = [0u8; 16];
        bytes[..8].copy_from_slice(&self.gfid_nonce.to_be_bytes());
        bytes[8..].copy_from_slice(&seq.to_be_bytes());
        Gfid(bytes)
    }

    // -- administrative ----------------------------------------------------

    pub fn options(&self) -> &VolumeOptions {
        &self.core.opts
    }

    pub fn stripe_size(&self) -> u64 {
        self.core.geom.stripe_size
    }

    pub fn fragment_size(&self) -> u64 {
        self.core.geom.fragment_size
    }

    /// Mark a brick reachable or unreachable.
    pub fn set_brick_up(&self, idx: usize, up: bool) {
        self.core.set_brick_up(idx, up);
    }

    pub fn up_mask(&self) -> BrickMask {
        self.core.up_mask()
    }

    /// Flip into shutdown: delayed unlocks become immediate, new fops and
    /// heals are refused, pending work is drained.
    pub fn shutdown(&self) {
        self.core.shutdown.store(true, Ordering::Release);
        let timeout = Duration::from_secs(u64::from(self.core.opts.shutdown_timeout_sec));
        if !self.core.drain_pending(timeout) {
            log::warn!("{}: shutdown timed out with fops pending", self.core.name);
        }
        self.core.scheduler.stop();
    }

    // -- reads -------------------------------------------------------------

    pub fn lookup(&self, loc: &Loc) -> EcResult<LookupReply> {
        ops::generic::lookup(&self.core, loc, &Xdata::new())
    }

    pub fn lookup_with(&self, loc: &Loc, xdata: &Xdata) -> EcResult<LookupReply> {
        ops::generic::lookup(&self.core, loc, xdata)
    }

    pub fn stat(&self, loc: &Loc) -> EcResult<IattReply> {
        ops::inode_read::stat(&self.core, loc)
    }

    pub fn fstat(&self, fd: &Fd) -> EcResult<IattReply> {
        ops::inode_read::fstat(&self.core, fd.handle())
    }

    pub fn access(&self, loc: &Loc, mask: u32) -> EcResult<EmptyReply> {
        ops::inode_read::access(&self.core, loc, mask)
    }

    pub fn readlink(&self, loc: &Loc) -> EcResult<ReadlinkReply> {
        ops::inode_read::readlink(&self.core, loc)
    }

    pub fn open(&self, loc: &Loc, flags: u32) -> EcResult<Fd> {
        let trunc = flags & (libc::O_TRUNC as u32) != 0;
        let open_flags = flags & !(libc::O_TRUNC as u32);
        let (_, open_mask) = ops::inode_read::open(&self.core, loc, open_flags)?;
        let fd = Fd::new(
            FdHandle {
                gfid: loc.gfid,
                flags: open_flags,
            },
            open_mask,
        );
        if trunc {
            self.ftruncate(&fd, 0)?;
        }
        Ok(fd)
    }

    pub fn readv(&self, fd: &Fd, size: u64, offset: u64) -> EcResult<ReadReply> {
        ops::inode_read::readv(&self.core, fd.handle(), size, offset, 0)
    }

    pub fn seek(&self, fd: &Fd, offset: u64, what: SeekWhat) -> EcResult<SeekReply> {
        ops::inode_read::seek(&self.core, fd.handle(), offset, what)
    }

    pub fn statfs(&self, loc: &Loc) -> EcResult<StatfsReply> {
        ops::generic::statfs(&self.core, loc)
    }

    /// getxattr; querying the heal xattr triggers a foreground heal and
    /// reports its verdict.
    pub fn getxattr(&self, loc: &Loc, name: Option<&str>) -> EcResult<XattrReply> {
        if name == Some(XATTR_HEAL) {
            let outcome = self.heal(loc, false)?;
            let mut xattrs = Xdata::new();
            xattrs.set_str(
                XATTR_HEAL,
                if outcome.healthy { "no-heal" } else { "heal" },
            );
            return Ok(XattrReply {
                xattrs,
                xdata: Xdata::new(),
            });
        }
        ops::inode_read::getxattr(&self.core, loc, name)
    }

    pub fn fgetxattr(&self, fd: &Fd, name: Option<&str>) -> EcResult<XattrReply> {
        ops::inode_read::fgetxattr(&self.core, fd.handle(), name)
    }

    // -- directory reads ---------------------------------------------------

    pub fn opendir(&self, loc: &Loc) -> EcResult<Fd> {
        let (_, open_mask) = ops::dir_read::opendir(&self.core, loc)?;
        Ok(Fd::new(
            FdHandle {
                gfid: loc.gfid,
                flags: 0,
            },
            open_mask,
        ))
    }

    pub fn readdir(&self, fd: &Fd, size: u64, offset: u64) -> EcResult<ReaddirReply> {
        self.readdir_common(fd, size, offset, false)
    }

    pub fn readdirp(&self, fd: &Fd, size: u64, offset: u64) -> EcResult<ReaddirReply> {
        self.readdir_common(fd, size, offset, true)
    }

    fn readdir_common(&self, fd: &Fd, size: u64, offset: u64, plus: bool) -> EcResult<ReaddirReply> {
        let hint = if offset == 0 {
            *fd.inner.readdir_brick.lock() = None;
            None
        } else {
            *fd.inner.readdir_brick.lock()
        };
        let (reply, served_by) = ops::dir_read::readdir(
            &self.core,
            fd.handle(),
            size,
            offset,
            plus,
            fd.open_mask(),
            hint,
        )?;
        *fd.inner.readdir_brick.lock() = Some(served_by);
        Ok(reply)
    }

    // -- writes ------------------------------------------------------------

    pub fn writev(&self, fd: &Fd, data: &[u8], offset: u64) -> EcResult<WriteReply> {
        ops::inode_write::writev(&self.core, fd.handle(), data, offset, 0)
    }

    pub fn truncate(&self, loc: &Loc, offset: u64) -> EcResult<PrePostReply> {
        ops::inode_write::truncate(&self.core, loc, offset)
    }

    pub fn ftruncate(&self, fd: &Fd, offset: u64) -> EcResult<PrePostReply> {
        ops::inode_write::ftruncate(&self.core, fd.handle(), offset)
    }

    pub fn fallocate(&self, fd: &Fd, mode: u32, offset: u64, len: u64) -> EcResult<PrePostReply> {
        ops::inode_write::fallocate(&self.core, fd.handle(), mode, offset, len)
    }

    pub fn discard(&self, fd: &Fd, offset: u64, len: u64) -> EcResult<PrePostReply> {
        ops::inode_write::discard(&self.core, fd.handle(), offset, len)
    }

    pub fn zerofill(&self, fd: &Fd, offset: u64, len: u64) -> EcResult<PrePostReply> {
        ops::inode_write::zerofill(&self.core, fd.handle(), offset, len)
    }

    pub fn setattr(&self, loc: &Loc, attr: &SetAttr, valid: u32) -> EcResult<PrePostReply> {
        ops::inode_write::setattr(&self.core, loc, attr, valid)
    }

    pub fn fsetattr(&self, fd: &Fd, attr: &SetAttr, valid: u32) -> EcResult<PrePostReply> {
        ops::inode_write::fsetattr(&self.core, fd.handle(), attr, valid)
    }

    pub fn setxattr(&self, loc: &Loc, xattrs: &Xdata, flags: u32) -> EcResult<EmptyReply> {
        ops::inode_write::setxattr(&self.core, loc, xattrs, flags)
    }

    pub fn fsetxattr(&self, fd: &Fd, xattrs: &Xdata, flags: u32) -> EcResult<EmptyReply> {
        ops::inode_write::fsetxattr(&self.core, fd.handle(), xattrs, flags)
    }

    pub fn removexattr(&self, loc: &Loc, name: &str) -> EcResult<EmptyReply> {
        ops::inode_write::removexattr(&self.core, loc, name)
    }

    pub fn fremovexattr(&self, fd: &Fd, name: &str) -> EcResult<EmptyReply> {
        ops::inode_write::fremovexattr(&self.core, fd.handle(), name)
    }

    pub fn flush(&self, fd: &Fd) -> EcResult<EmptyReply> {
        ops::generic::flush(&self.core, fd.handle())
    }

    pub fn fsync(&self, fd: &Fd, datasync: bool) -> EcResult<PrePostReply> {
        ops::generic::fsync(&self.core, fd.handle(), datasync)
    }

    pub fn fsyncdir(&self, fd: &Fd, datasync: bool) -> EcResult<EmptyReply> {
        ops::generic::fsyncdir(&self.core, fd.handle(), datasync)
    }

    // -- directory writes --------------------------------------------------

    /// Create a regular file under `parent` and open it.
    pub fn create(&self, parent: Gfid, name: &str, mode: u32, flags: u32) -> EcResult<(Fd, EntryReply)> {
        let gfid = self.generate_gfid();
        let loc = Loc::entry_with_gfid(parent, name, gfid);
        let args = MkArgs {
            mode,
            umask: 0,
            rdev: 0,
            gfid,
            file_type: FileType::Regular,
        };
        let (reply, open_mask) = ops::dir_write::create(&self.core, &loc, flags, &args)?;
        let fd = Fd::new(FdHandle { gfid, flags }, open_mask);
        Ok((fd, reply))
    }

    pub fn mknod(&self, parent: Gfid, name: &str, mode: u32, rdev: u64) -> EcResult<EntryReply> {
        let gfid = self.generate_gfid();
        let loc = Loc::entry_with_gfid(parent, name, gfid);
        let file_type = if rdev != 0 {
            FileType::BlockDev
        } else {
            FileType::Regular
        };
        let args = MkArgs {
            mode,
            umask: 0,
            rdev,
            gfid,
            file_type,
        };
        ops::dir_write::mknod(&self.core, &loc, &args)
    }

    pub fn mkdir(&self, parent: Gfid, name: &str, mode: u32) -> EcResult<EntryReply> {
        let gfid = self.generate_gfid();
        let loc = Loc::entry_with_gfid(parent, name, gfid);
        let args = MkArgs {
            mode,
            umask: 0,
            rdev: 0,
            gfid,
            file_type: FileType::Directory,
        };
        ops::dir_write::mkdir(&self.core, &loc, &args)
    }

    pub fn symlink(&self, target: &str, parent: Gfid, name: &str) -> EcResult<EntryReply> {
        let gfid = self.generate_gfid();
        let loc = Loc::entry_with_gfid(parent, name, gfid);
        let args = MkArgs {
            mode: 0o777,
            umask: 0,
            rdev: 0,
            gfid,
            file_type: FileType::Symlink,
        };
        ops::dir_write::symlink(&self.core, target, &loc, &args)
    }

    pub fn link(&self, old: &Loc, new: &Loc) -> EcResult<EntryReply> {
        ops::dir_write::link(&self.core, old, new)
    }

    pub fn rename(&self, old: &Loc, new: &Loc) -> EcResult<RenameReply> {
        ops::dir_write::rename(&self.core, old, new)
    }

    pub fn unlink(&self, loc: &Loc) -> EcResult<ParentReply> {
        ops::dir_write::unlink(&self.core, loc, 0)
    }

    pub fn rmdir(&self, loc: &Loc, flags: u32) -> EcResult<ParentReply> {
        ops::dir_write::rmdir(&self.core, loc, flags)
    }

    // -- metadata / lock primitives ---------------------------------------

    pub fn xattrop(&self, loc: &Loc, op: XattropOp, deltas: &Xdata) -> EcResult<XattrReply> {
        ops::generic::xattrop(&self.core, loc, op, deltas, &Xdata::new())
    }

    pub fn fxattrop(&self, fd: &Fd, op: XattropOp, deltas: &Xdata) -> EcResult<XattrReply> {
        ops::generic::fxattrop(&self.core, fd.handle(), op, deltas, &Xdata::new())
    }

    pub fn inodelk(&self, domain: &str, loc: &Loc, cmd: LockCmd, flock: &Flock) -> EcResult<EmptyReply> {
        ops::locks::inodelk(&self.core, domain, loc, cmd, flock)
    }

    pub fn finodelk(&self, domain: &str, fd: &Fd, cmd: LockCmd, flock: &Flock) -> EcResult<EmptyReply> {
        ops::locks::finodelk(&self.core, domain, fd.handle(), cmd, flock)
    }

    pub fn entrylk(
        &self,
        domain: &str,
        loc: &Loc,
        basename: Option<&str>,
        cmd: EntrylkCmd,
        kind: EntrylkType,
    ) -> EcResult<EmptyReply> {
        ops::locks::entrylk(&self.core, domain, loc, basename, cmd, kind)
    }

    pub fn fentrylk(
        &self,
        domain: &str,
        fd: &Fd,
        basename: Option<&str>,
        cmd: EntrylkCmd,
        kind: EntrylkType,
    ) -> EcResult<EmptyReply> {
        ops::locks::fentrylk(&self.core, domain, fd.handle(), basename, cmd, kind)
    }

    pub fn lk(&self, fd: &Fd, cmd: LockCmd, flock: &Flock) -> EcResult<LkReply> {
        ops::locks::lk(&self.core, fd.handle(), cmd, flock)
    }

    pub fn ipc(&self, op: i32, xdata: &Xdata) -> EcResult<EmptyReply> {
        ops::generic::ipc(&self.core, op, xdata)
    }

    // -- healing -----------------------------------------------------------

    /// Foreground heal of a location. `partial` limits directories to
    /// name healing.
    pub fn heal(&self, loc: &Loc, partial: bool) -> EcResult<HealOutcome> {
        if self.core.shutdown.load(Ordering::Acquire) {
            return Err(EcError::ShuttingDown);
        }
        heal::heal(&self.core, loc, partial)
    }

    /// Heal via an fd.
    pub fn fheal(&self, fd: &Fd, partial: bool) -> EcResult<HealOutcome> {
        self.heal(&Loc::from_gfid(fd.gfid()), partial)
    }

    pub fn get_heal_info(&self, loc: &Loc) -> EcResult<&'static str> {
        heal::get_heal_info(&self.core, loc)
    }

    /// (active, waiting) background heal counters.
    pub fn heal_load(&self) -> (u32, u32) {
        (self.core.heal.active(), self.core.heal.waiting())
    }
}

impl Drop for Disperse {
    fn drop(&mut self) {
        self.core.scheduler.stop();
    }
}
