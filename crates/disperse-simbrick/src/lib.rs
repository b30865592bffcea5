//! # disperse-simbrick
//!
//! An in-memory brick backend implementing the full brick-client trait:
//! fragment storage, directory entries, xattrs with `ADD_ARRAY64`,
//! advisory locks with observable per-domain counts, and brick up/down
//! fault injection. Integration tests and the harness build volumes out
//! of these.

mod locktable;
mod store;

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};

use parking_lot::Mutex;

use disperse_core::brick::{
    Brick, EmptyReply, EntryReply, EntrylkCmd, EntrylkType, IattReply, LkReply, LockCmd,
    LookupReply, MkArgs, ParentReply, PrePostReply, ReadReply, ReaddirReply, ReadlinkReply,
    RenameReply, SeekReply, StatfsReply, WriteReply, XattropOp, XattrReply,
};
use disperse_core::ondisk::{self, XATTR_CONFIG};
use disperse_core::types::{
    DirEntry, Errno, FdHandle, FileType, Flock, FlockType, Gfid, Iatt, Loc, OpResult, SeekWhat,
    SetAttr, Statvfs, Timespec, setattr_valid,
};
use disperse_core::xdata::{Xdata, XdataValue, keys};

use locktable::{LockKey, LockTable, SharedLockTable};
use store::Inode;

/// One simulated brick.
pub struct SimBrick {
    name: String,
    up: AtomicBool,
    clock: AtomicI64,
    inodes: Mutex<HashMap<Gfid, Inode>>,
    locks: SharedLockTable,
    reads: AtomicU64,
    internal_reads: AtomicU64,
    writes: AtomicU64,
    lock_grabs: AtomicU64,
    read_faults: AtomicU64,
}

impl SimBrick {
    pub fn new(name: &str) -> Arc<Self> {
        let mut inodes = HashMap::new();
        let mut root = Inode::new(Gfid::ROOT, FileType::Directory, 0o755, Timespec::default());
        root.nlink = 2;
        inodes.insert(Gfid::ROOT, root);
        Arc::new(SimBrick {
            name: name.to_string(),
            up: AtomicBool::new(true),
            clock: AtomicI64::new(1),
            inodes: Mutex::new(inodes),
            locks: LockTable::new(),
            reads: AtomicU64::new(0),
            internal_reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
            lock_grabs: AtomicU64::new(0),
            read_faults: AtomicU64::new(0),
        })
    }

    /// Build a whole volume worth of bricks.
    pub fn cluster(count: usize) -> Vec<Arc<SimBrick>> {
        (0..count)
            .map(|i| SimBrick::new(&format!("brick-{i}")))
            .collect()
    }

    /// Upcast for volume assembly.
    pub fn as_bricks(bricks: &[Arc<SimBrick>]) -> Vec<Arc<dyn Brick>> {
        bricks.iter().map(|b| Arc::clone(b) as Arc<dyn Brick>).collect()
    }

    // -- fault injection ---------------------------------------------------

    /// A brick going down loses its advisory locks, like a disconnected
    /// client would.
    pub fn set_up(&self, up: bool) {
        self.up.store(up, Ordering::Release);
        if !up {
            self.locks.clear();
        }
    }

    pub fn is_up(&self) -> bool {
        self.up.load(Ordering::Acquire)
    }

    // -- test visibility ---------------------------------------------------

    pub fn fragment_data(&self, gfid: Gfid) -> Option<Vec<u8>> {
        self.inodes.lock().get(&gfid).map(|i| i.data.clone())
    }

    pub fn xattr_bin(&self, gfid: Gfid, key: &str) -> Option<Vec<u8>> {
        match self.inodes.lock().get(&gfid)?.xattrs.get(key)? {
            XdataValue::Bin(raw) => Some(raw.clone()),
            _ => None,
        }
    }

    pub fn entry_gfid(&self, parent: Gfid, name: &str) -> Option<Gfid> {
        self.inodes.lock().get(&parent)?.entries.get(name).copied()
    }

    pub fn has_inode(&self, gfid: Gfid) -> bool {
        self.inodes.lock().contains_key(&gfid)
    }

    /// (external reads, internal reconstruction reads).
    pub fn read_counts(&self) -> (u64, u64) {
        (
            self.reads.load(Ordering::Relaxed),
            self.internal_reads.load(Ordering::Relaxed),
        )
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }

    pub fn lock_count(&self, domain: &str, gfid: Gfid) -> u32 {
        self.locks.count(domain, gfid)
    }

    /// How many inode locks were granted over this brick's lifetime.
    pub fn lock_grabs(&self) -> u64 {
        self.lock_grabs.load(Ordering::Relaxed)
    }

    /// Fail the next `count` read-class operations with EIO while the
    /// brick otherwise keeps working (a sick backend, not a dead one).
    pub fn inject_read_errors(&self, count: u64) {
        self.read_faults.store(count, Ordering::Release);
    }

    fn take_read_fault(&self) -> Result<(), Errno> {
        let mut current = self.read_faults.load(Ordering::Acquire);
        while current > 0 {
            match self.read_faults.compare_exchange(
                current,
                current - 1,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return Err(libc::EIO),
                Err(seen) => current = seen,
            }
        }
        Ok(())
    }

    // -- internals ---------------------------------------------------------

    fn ensure_up(&self) -> Result<(), Errno> {
        if self.is_up() {
            Ok(())
        } else {
            Err(libc::ENOTCONN)
        }
    }

    fn now(&self) -> Timespec {
        Timespec {
            sec: self.clock.fetch_add(1, Ordering::Relaxed),
            nsec: 0,
        }
    }

    fn resolve(&self, inodes: &HashMap<Gfid, Inode>, loc: &Loc) -> Result<Gfid, Errno> {
        if let (Some(parent), Some(name)) = (loc.parent, loc.name.as_deref()) {
            let dir = inodes.get(&parent).ok_or(libc::ENOENT)?;
            if !dir.file_type.is_dir() {
                return Err(libc::ENOTDIR);
            }
            return dir.entries.get(name).copied().ok_or(libc::ENOENT);
        }
        if !loc.gfid.is_null() {
            if inodes.contains_key(&loc.gfid) {
                return Ok(loc.gfid);
            }
            return Err(libc::ESTALE);
        }
        Err(libc::EINVAL)
    }

    /// Answer the reply-xdata conventions: requested `trusted.ec.*`
    /// values and the per-domain lock count.
    fn fill_reply_xdata(
        &self,
        inodes: &HashMap<Gfid, Inode>,
        gfid: Gfid,
        req: &Xdata,
        out: &mut Xdata,
    ) {
        if let Some(inode) = inodes.get(&gfid) {
            for key in req.keys() {
                if key.starts_with("trusted.ec.")
                    && let Some(XdataValue::Bin(raw)) = inode.xattrs.get(key)
                {
                    out.set_bin(key, raw.clone());
                }
            }
        }
        if let Some(XdataValue::Str(domain)) = req.get(keys::INODELK_COUNT) {
            out.set_u32(keys::INODELK_COUNT, self.locks.count(domain, gfid));
        }
    }

    fn with_inode<T>(
        &self,
        gfid: Gfid,
        f: impl FnOnce(&mut Inode, Timespec) -> Result<T, Errno>,
    ) -> Result<T, Errno> {
        let now = self.now();
        let mut inodes = self.inodes.lock();
        let inode = inodes.get_mut(&gfid).ok_or(libc::ESTALE)?;
        f(inode, now)
    }

    fn make_inode(
        &self,
        inodes: &mut HashMap<Gfid, Inode>,
        loc: &Loc,
        args: &MkArgs,
        seed: &Xdata,
        now: Timespec,
    ) -> Result<(Iatt, Iatt, Iatt), Errno> {
        let parent_gfid = loc.parent.ok_or(libc::EINVAL)?;
        let name = loc.name.as_deref().ok_or(libc::EINVAL)?.to_string();
        let parent = inodes.get_mut(&parent_gfid).ok_or(libc::ENOENT)?;
        if !parent.file_type.is_dir() {
            return Err(libc::ENOTDIR);
        }
        if parent.entries.contains_key(&name) {
            return Err(libc::EEXIST);
        }
        let preparent = parent.iatt();
        parent.entries.insert(name, args.gfid);
        parent.mtime = now;
        if args.file_type.is_dir() {
            parent.nlink += 1;
        }
        let postparent = parent.iatt();

        let mut inode = Inode::new(args.gfid, args.file_type, args.mode & !args.umask, now);
        inode.rdev = args.rdev;
        if args.file_type.is_dir() {
            inode.nlink = 2;
        }
        for (key, value) in seed.iter() {
            if key.starts_with("trusted.ec.") {
                inode.xattrs.insert(key.to_string(), value.clone());
            }
        }
        let iatt = inode.iatt();
        inodes.insert(args.gfid, inode);
        Ok((iatt, preparent, postparent))
    }

    fn unlink_common(&self, loc: &Loc, dir_only: bool) -> OpResult<ParentReply> {
        self.ensure_up()?;
        let now = self.now();
        let mut inodes = self.inodes.lock();
        let target = self.resolve(&inodes, loc)?;

        if dir_only {
            let dir = inodes.get(&target).ok_or(libc::ENOENT)?;
            if !dir.file_type.is_dir() {
                return Err(libc::ENOTDIR);
            }
            if !dir.entries.is_empty() {
                return Err(libc::ENOTEMPTY);
            }
        }

        let parent_gfid = loc.parent.ok_or(libc::EINVAL)?;
        let name = loc.name.as_deref().ok_or(libc::EINVAL)?;
        let parent = inodes.get_mut(&parent_gfid).ok_or(libc::ENOENT)?;
        let preparent = parent.iatt();
        parent.entries.remove(name).ok_or(libc::ENOENT)?;
        parent.mtime = now;
        if dir_only {
            parent.nlink = parent.nlink.saturating_sub(1);
        }
        let postparent = parent.iatt();

        if let Some(inode) = inodes.get_mut(&target) {
            inode.nlink = inode.nlink.saturating_sub(if dir_only { 2 } else { 1 });
            if inode.nlink == 0 || dir_only {
                inodes.remove(&target);
            }
        }

        Ok(ParentReply {
            preparent,
            postparent,
            xdata: Xdata::new(),
        })
    }

    fn apply_xattrop(
        &self,
        gfid: Gfid,
        op: XattropOp,
        deltas: &Xdata,
        req: &Xdata,
    ) -> OpResult<XattrReply> {
        let XattropOp::AddArray64 = op;
        self.with_inode(gfid, |inode, now| {
            let mut post = Xdata::new();
            for (key, value) in deltas.iter() {
                let XdataValue::Bin(delta) = value else {
                    return Err(libc::EINVAL);
                };
                let stored: &[u8] = match inode.xattrs.get(key) {
                    Some(XdataValue::Bin(raw)) => raw,
                    Some(_) => return Err(libc::EINVAL),
                    None => &[],
                };
                let new = ondisk::add_array64(stored, delta)?;
                inode.xattrs.insert(key.to_string(), XdataValue::Bin(new.clone()));
                post.set_bin(key, new);
            }
            inode.ctime = now;

            let mut xdata = Xdata::new();
            if req.contains(XATTR_CONFIG)
                && let Some(XdataValue::Bin(raw)) = inode.xattrs.get(XATTR_CONFIG)
            {
                xdata.set_bin(XATTR_CONFIG, raw.clone());
            }
            if let Some(XdataValue::Str(domain)) = req.get(keys::INODELK_COUNT) {
                xdata.set_u32(keys::INODELK_COUNT, self.locks.count(domain, gfid));
            }
            Ok(XattrReply { xattrs: post, xdata })
        })
    }

    fn inodelk_common(
        &self,
        domain: &str,
        gfid: Gfid,
        cmd: LockCmd,
        flock: &Flock,
    ) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        let key = LockKey {
            domain: domain.to_string(),
            gfid,
            basename: None,
        };
        match (cmd, flock.kind) {
            (_, FlockType::Unlock) => self.locks.unlock(&key, flock.owner)?,
            (LockCmd::SetLkWait, _) => {
                self.locks.lock(key, flock.owner, true)?;
                self.lock_grabs.fetch_add(1, Ordering::Relaxed);
            }
            (LockCmd::SetLk, _) => {
                self.locks.lock(key, flock.owner, false)?;
                self.lock_grabs.fetch_add(1, Ordering::Relaxed);
            }
            (LockCmd::GetLk, _) => {}
        }
        Ok(EmptyReply::default())
    }

    fn prepost<T>(
        &self,
        gfid: Gfid,
        f: impl FnOnce(&mut Inode, Timespec) -> Result<T, Errno>,
    ) -> OpResult<(T, Iatt, Iatt)> {
        self.with_inode(gfid, |inode, now| {
            let pre = inode.iatt();
            let value = f(inode, now)?;
            Ok((value, pre, inode.iatt()))
        })
    }
}

impl Brick for SimBrick {
    fn name(&self) -> &str {
        &self.name
    }

    // -- inode reads -------------------------------------------------------

    fn lookup(&self, loc: &Loc, xdata: &Xdata) -> OpResult<LookupReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        let gfid = self.resolve(&inodes, loc)?;
        let inode = inodes.get(&gfid).ok_or(libc::ENOENT)?;
        let mut out = Xdata::new();
        self.fill_reply_xdata(&inodes, gfid, xdata, &mut out);
        let postparent = loc
            .parent
            .and_then(|p| inodes.get(&p))
            .map(|parent| parent.iatt());
        Ok(LookupReply {
            iatt: inode.iatt(),
            postparent,
            xdata: out,
        })
    }

    fn stat(&self, loc: &Loc, xdata: &Xdata) -> OpResult<IattReply> {
        self.ensure_up()?;
        self.take_read_fault()?;
        let inodes = self.inodes.lock();
        let gfid = self.resolve(&inodes, loc)?;
        let inode = inodes.get(&gfid).ok_or(libc::ENOENT)?;
        let mut out = Xdata::new();
        self.fill_reply_xdata(&inodes, gfid, xdata, &mut out);
        Ok(IattReply {
            iatt: inode.iatt(),
            xdata: out,
        })
    }

    fn fstat(&self, fd: &FdHandle, xdata: &Xdata) -> OpResult<IattReply> {
        self.stat(&Loc::from_gfid(fd.gfid), xdata)
    }

    fn access(&self, loc: &Loc, _mask: u32, xdata: &Xdata) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        let gfid = self.resolve(&inodes, loc)?;
        let mut out = Xdata::new();
        self.fill_reply_xdata(&inodes, gfid, xdata, &mut out);
        Ok(EmptyReply { xdata: out })
    }

    fn readlink(&self, loc: &Loc, xdata: &Xdata) -> OpResult<ReadlinkReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        let gfid = self.resolve(&inodes, loc)?;
        let inode = inodes.get(&gfid).ok_or(libc::ENOENT)?;
        let target = inode.symlink.clone().ok_or(libc::EINVAL)?;
        let mut out = Xdata::new();
        self.fill_reply_xdata(&inodes, gfid, xdata, &mut out);
        Ok(ReadlinkReply {
            target,
            iatt: inode.iatt(),
            xdata: out,
        })
    }

    fn open(&self, loc: &Loc, _flags: u32, xdata: &Xdata) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        let gfid = self.resolve(&inodes, loc)?;
        let mut out = Xdata::new();
        self.fill_reply_xdata(&inodes, gfid, xdata, &mut out);
        Ok(EmptyReply { xdata: out })
    }

    fn readv(
        &self,
        fd: &FdHandle,
        size: u64,
        offset: u64,
        _flags: u32,
        xdata: &Xdata,
    ) -> OpResult<ReadReply> {
        self.ensure_up()?;
        if xdata.is_internal() {
            self.internal_reads.fetch_add(1, Ordering::Relaxed);
        } else {
            self.reads.fetch_add(1, Ordering::Relaxed);
        }
        let inodes = self.inodes.lock();
        let inode = inodes.get(&fd.gfid).ok_or(libc::ESTALE)?;
        if inode.file_type.is_dir() {
            return Err(libc::EISDIR);
        }
        let mut out = Xdata::new();
        self.fill_reply_xdata(&inodes, fd.gfid, xdata, &mut out);
        Ok(ReadReply {
            data: inode.read_at(offset, size),
            iatt: inode.iatt(),
            xdata: out,
        })
    }

    fn seek(&self, fd: &FdHandle, offset: u64, what: SeekWhat, _xdata: &Xdata) -> OpResult<SeekReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        let inode = inodes.get(&fd.gfid).ok_or(libc::ESTALE)?;
        let len = inode.data.len() as u64;
        let offset = match what {
            SeekWhat::Data if offset < len => offset,
            SeekWhat::Data => return Err(libc::ENXIO),
            SeekWhat::Hole => len.max(offset),
        };
        Ok(SeekReply {
            offset,
            xdata: Xdata::new(),
        })
    }

    fn getxattr(&self, loc: &Loc, name: Option<&str>, xdata: &Xdata) -> OpResult<XattrReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        let gfid = self.resolve(&inodes, loc)?;
        let inode = inodes.get(&gfid).ok_or(libc::ENOENT)?;
        let mut xattrs = Xdata::new();
        match name {
            Some(name) => {
                let value = inode.xattrs.get(name).ok_or(libc::ENODATA)?;
                xattrs.set(name, value.clone());
            }
            None => {
                for (key, value) in &inode.xattrs {
                    xattrs.set(key, value.clone());
                }
            }
        }
        let mut out = Xdata::new();
        self.fill_reply_xdata(&inodes, gfid, xdata, &mut out);
        Ok(XattrReply { xattrs, xdata: out })
    }

    fn fgetxattr(&self, fd: &FdHandle, name: Option<&str>, xdata: &Xdata) -> OpResult<XattrReply> {
        self.getxattr(&Loc::from_gfid(fd.gfid), name, xdata)
    }

    fn statfs(&self, loc: &Loc, _xdata: &Xdata) -> OpResult<StatfsReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        self.resolve(&inodes, loc)?;
        let used: u64 = inodes.values().map(|i| i.data.len() as u64).sum();
        let blocks = 1u64 << 20;
        let bfree = blocks - used.div_ceil(4096);
        Ok(StatfsReply {
            stat: Statvfs {
                bsize: 4096,
                frsize: 4096,
                blocks,
                bfree,
                bavail: bfree,
                files: 1 << 16,
                ffree: (1 << 16) - inodes.len() as u64,
                favail: (1 << 16) - inodes.len() as u64,
                namemax: 255,
                flags: 0,
            },
            xdata: Xdata::new(),
        })
    }

    // -- directory reads ---------------------------------------------------

    fn opendir(&self, loc: &Loc, xdata: &Xdata) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        let gfid = self.resolve(&inodes, loc)?;
        let inode = inodes.get(&gfid).ok_or(libc::ENOENT)?;
        if !inode.file_type.is_dir() {
            return Err(libc::ENOTDIR);
        }
        let mut out = Xdata::new();
        self.fill_reply_xdata(&inodes, gfid, xdata, &mut out);
        Ok(EmptyReply { xdata: out })
    }

    fn readdir(&self, fd: &FdHandle, size: u64, offset: u64, _xdata: &Xdata) -> OpResult<ReaddirReply> {
        self.ensure_up()?;
        self.take_read_fault()?;
        let inodes = self.inodes.lock();
        let dir = inodes.get(&fd.gfid).ok_or(libc::ESTALE)?;
        if !dir.file_type.is_dir() {
            return Err(libc::ENOTDIR);
        }
        let max = (size as usize / 64).max(1);
        let entries: Vec<DirEntry> = dir
            .entries
            .iter()
            .skip(offset as usize)
            .take(max)
            .enumerate()
            .map(|(i, (name, gfid))| DirEntry {
                name: name.clone(),
                gfid: *gfid,
                file_type: inodes
                    .get(gfid)
                    .map(|inode| inode.file_type)
                    .unwrap_or(FileType::Invalid),
                offset: offset + i as u64 + 1,
                iatt: None,
            })
            .collect();
        Ok(ReaddirReply {
            entries,
            xdata: Xdata::new(),
        })
    }

    fn readdirp(&self, fd: &FdHandle, size: u64, offset: u64, xdata: &Xdata) -> OpResult<ReaddirReply> {
        let mut reply = self.readdir(fd, size, offset, xdata)?;
        let inodes = self.inodes.lock();
        for entry in reply.entries.iter_mut() {
            entry.iatt = inodes.get(&entry.gfid).map(|inode| inode.iatt());
        }
        Ok(reply)
    }

    // -- inode writes ------------------------------------------------------

    fn writev(
        &self,
        fd: &FdHandle,
        data: &[u8],
        offset: u64,
        _flags: u32,
        xdata: &Xdata,
    ) -> OpResult<WriteReply> {
        self.ensure_up()?;
        self.writes.fetch_add(1, Ordering::Relaxed);
        let (written, pre, post) = self.prepost(fd.gfid, |inode, now| {
            if inode.file_type.is_dir() {
                return Err(libc::EISDIR);
            }
            inode.write_at(offset, data);
            inode.mtime = now;
            Ok(data.len() as u64)
        })?;
        let mut out = Xdata::new();
        {
            let inodes = self.inodes.lock();
            self.fill_reply_xdata(&inodes, fd.gfid, xdata, &mut out);
        }
        Ok(WriteReply {
            written,
            pre,
            post,
            xdata: out,
        })
    }

    fn truncate(&self, loc: &Loc, offset: u64, xdata: &Xdata) -> OpResult<PrePostReply> {
        self.ensure_up()?;
        let gfid = {
            let inodes = self.inodes.lock();
            self.resolve(&inodes, loc)?
        };
        self.ftruncate(&FdHandle { gfid, flags: 0 }, offset, xdata)
    }

    fn ftruncate(&self, fd: &FdHandle, offset: u64, xdata: &Xdata) -> OpResult<PrePostReply> {
        self.ensure_up()?;
        let ((), pre, post) = self.prepost(fd.gfid, |inode, now| {
            if inode.file_type.is_dir() {
                return Err(libc::EISDIR);
            }
            inode.data.resize(offset as usize, 0);
            inode.mtime = now;
            Ok(())
        })?;
        let mut out = Xdata::new();
        {
            let inodes = self.inodes.lock();
            self.fill_reply_xdata(&inodes, fd.gfid, xdata, &mut out);
        }
        Ok(PrePostReply {
            pre,
            post,
            xdata: out,
        })
    }

    fn fallocate(
        &self,
        fd: &FdHandle,
        mode: u32,
        offset: u64,
        len: u64,
        _xdata: &Xdata,
    ) -> OpResult<PrePostReply> {
        self.ensure_up()?;
        let ((), pre, post) = self.prepost(fd.gfid, |inode, now| {
            let end = (offset + len) as usize;
            if mode & (libc::FALLOC_FL_KEEP_SIZE as u32) == 0 && inode.data.len() < end {
                inode.data.resize(end, 0);
            }
            inode.ctime = now;
            Ok(())
        })?;
        Ok(PrePostReply {
            pre,
            post,
            xdata: Xdata::new(),
        })
    }

    fn discard(&self, fd: &FdHandle, offset: u64, len: u64, _xdata: &Xdata) -> OpResult<PrePostReply> {
        self.ensure_up()?;
        let ((), pre, post) = self.prepost(fd.gfid, |inode, now| {
            let start = (offset as usize).min(inode.data.len());
            let end = ((offset + len) as usize).min(inode.data.len());
            inode.data[start..end].fill(0);
            inode.mtime = now;
            Ok(())
        })?;
        Ok(PrePostReply {
            pre,
            post,
            xdata: Xdata::new(),
        })
    }

    fn zerofill(&self, fd: &FdHandle, offset: u64, len: u64, _xdata: &Xdata) -> OpResult<PrePostReply> {
        self.ensure_up()?;
        let ((), pre, post) = self.prepost(fd.gfid, |inode, now| {
            let end = (offset + len) as usize;
            if inode.data.len() < end {
                inode.data.resize(end, 0);
            }
            inode.data[offset as usize..end].fill(0);
            inode.mtime = now;
            Ok(())
        })?;
        Ok(PrePostReply {
            pre,
            post,
            xdata: Xdata::new(),
        })
    }

    fn setattr(&self, loc: &Loc, attr: &SetAttr, valid: u32, xdata: &Xdata) -> OpResult<PrePostReply> {
        self.ensure_up()?;
        let gfid = {
            let inodes = self.inodes.lock();
            self.resolve(&inodes, loc)?
        };
        self.fsetattr(&FdHandle { gfid, flags: 0 }, attr, valid, xdata)
    }

    fn fsetattr(
        &self,
        fd: &FdHandle,
        attr: &SetAttr,
        valid: u32,
        _xdata: &Xdata,
    ) -> OpResult<PrePostReply> {
        self.ensure_up()?;
        let ((), pre, post) = self.prepost(fd.gfid, |inode, now| {
            if valid & setattr_valid::MODE != 0 {
                inode.mode = attr.mode;
            }
            if valid & setattr_valid::UID != 0 {
                inode.uid = attr.uid;
            }
            if valid & setattr_valid::GID != 0 {
                inode.gid = attr.gid;
            }
            if valid & setattr_valid::ATIME != 0 {
                inode.atime = attr.atime;
            }
            if valid & setattr_valid::MTIME != 0 {
                inode.mtime = attr.mtime;
            }
            inode.ctime = now;
            Ok(())
        })?;
        Ok(PrePostReply {
            pre,
            post,
            xdata: Xdata::new(),
        })
    }

    fn setxattr(&self, loc: &Loc, xattrs: &Xdata, _flags: u32, xdata: &Xdata) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        let gfid = {
            let inodes = self.inodes.lock();
            self.resolve(&inodes, loc)?
        };
        self.fsetxattr(&FdHandle { gfid, flags: 0 }, xattrs, 0, xdata)
    }

    fn fsetxattr(&self, fd: &FdHandle, xattrs: &Xdata, _flags: u32, _xdata: &Xdata) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        self.with_inode(fd.gfid, |inode, now| {
            for (key, value) in xattrs.iter() {
                inode.xattrs.insert(key.to_string(), value.clone());
            }
            inode.ctime = now;
            Ok(())
        })?;
        Ok(EmptyReply::default())
    }

    fn removexattr(&self, loc: &Loc, name: &str, xdata: &Xdata) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        let gfid = {
            let inodes = self.inodes.lock();
            self.resolve(&inodes, loc)?
        };
        self.fremovexattr(&FdHandle { gfid, flags: 0 }, name, xdata)
    }

    fn fremovexattr(&self, fd: &FdHandle, name: &str, _xdata: &Xdata) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        self.with_inode(fd.gfid, |inode, now| {
            inode.xattrs.remove(name).ok_or(libc::ENODATA)?;
            inode.ctime = now;
            Ok(())
        })?;
        Ok(EmptyReply::default())
    }

    fn flush(&self, fd: &FdHandle, _xdata: &Xdata) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        inodes.get(&fd.gfid).ok_or(libc::ESTALE)?;
        Ok(EmptyReply::default())
    }

    fn fsync(&self, fd: &FdHandle, _datasync: bool, _xdata: &Xdata) -> OpResult<PrePostReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        let inode = inodes.get(&fd.gfid).ok_or(libc::ESTALE)?;
        Ok(PrePostReply {
            pre: inode.iatt(),
            post: inode.iatt(),
            xdata: Xdata::new(),
        })
    }

    fn fsyncdir(&self, fd: &FdHandle, _datasync: bool, _xdata: &Xdata) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        inodes.get(&fd.gfid).ok_or(libc::ESTALE)?;
        Ok(EmptyReply::default())
    }

    // -- directory writes --------------------------------------------------

    fn create(&self, loc: &Loc, _flags: u32, args: &MkArgs, xdata: &Xdata) -> OpResult<EntryReply> {
        self.mknod(loc, args, xdata)
    }

    fn mknod(&self, loc: &Loc, args: &MkArgs, xdata: &Xdata) -> OpResult<EntryReply> {
        self.ensure_up()?;
        let now = self.now();
        let mut inodes = self.inodes.lock();
        let (iatt, preparent, postparent) = self.make_inode(&mut inodes, loc, args, xdata, now)?;
        Ok(EntryReply {
            iatt,
            preparent,
            postparent,
            xdata: Xdata::new(),
        })
    }

    fn mkdir(&self, loc: &Loc, args: &MkArgs, xdata: &Xdata) -> OpResult<EntryReply> {
        self.mknod(loc, args, xdata)
    }

    fn symlink(&self, target: &str, loc: &Loc, args: &MkArgs, xdata: &Xdata) -> OpResult<EntryReply> {
        self.ensure_up()?;
        let now = self.now();
        let mut inodes = self.inodes.lock();
        let (iatt, preparent, postparent) = self.make_inode(&mut inodes, loc, args, xdata, now)?;
        if let Some(inode) = inodes.get_mut(&args.gfid) {
            inode.symlink = Some(target.to_string());
        }
        Ok(EntryReply {
            iatt,
            preparent,
            postparent,
            xdata: Xdata::new(),
        })
    }

    fn link(&self, old: &Loc, new: &Loc, _xdata: &Xdata) -> OpResult<EntryReply> {
        self.ensure_up()?;
        let now = self.now();
        let mut inodes = self.inodes.lock();
        let target = self.resolve(&inodes, old)?;

        let parent_gfid = new.parent.ok_or(libc::EINVAL)?;
        let name = new.name.as_deref().ok_or(libc::EINVAL)?.to_string();
        let parent = inodes.get_mut(&parent_gfid).ok_or(libc::ENOENT)?;
        if parent.entries.contains_key(&name) {
            return Err(libc::EEXIST);
        }
        let preparent = parent.iatt();
        parent.entries.insert(name, target);
        parent.mtime = now;
        let postparent = parent.iatt();

        let inode = inodes.get_mut(&target).ok_or(libc::ENOENT)?;
        inode.nlink += 1;
        inode.ctime = now;
        Ok(EntryReply {
            iatt: inode.iatt(),
            preparent,
            postparent,
            xdata: Xdata::new(),
        })
    }

    fn rename(&self, old: &Loc, new: &Loc, _xdata: &Xdata) -> OpResult<RenameReply> {
        self.ensure_up()?;
        let now = self.now();
        let mut inodes = self.inodes.lock();
        let moved = self.resolve(&inodes, old)?;

        let old_parent_gfid = old.parent.ok_or(libc::EINVAL)?;
        let new_parent_gfid = new.parent.ok_or(libc::EINVAL)?;
        let old_name = old.name.as_deref().ok_or(libc::EINVAL)?.to_string();
        let new_name = new.name.as_deref().ok_or(libc::EINVAL)?.to_string();

        let preoldparent;
        let postoldparent;
        {
            let old_parent = inodes.get_mut(&old_parent_gfid).ok_or(libc::ENOENT)?;
            preoldparent = old_parent.iatt();
            old_parent.entries.remove(&old_name).ok_or(libc::ENOENT)?;
            old_parent.mtime = now;
            postoldparent = old_parent.iatt();
        }

        let replaced;
        let prenewparent;
        let postnewparent;
        {
            let new_parent = inodes.get_mut(&new_parent_gfid).ok_or(libc::ENOENT)?;
            prenewparent = new_parent.iatt();
            replaced = new_parent.entries.insert(new_name, moved);
            new_parent.mtime = now;
            postnewparent = new_parent.iatt();
        }

        if let Some(old_target) = replaced
            && let Some(inode) = inodes.get_mut(&old_target)
        {
            inode.nlink = inode.nlink.saturating_sub(1);
            if inode.nlink == 0 {
                inodes.remove(&old_target);
            }
        }

        let inode = inodes.get_mut(&moved).ok_or(libc::ENOENT)?;
        inode.ctime = now;
        Ok(RenameReply {
            iatt: inode.iatt(),
            preoldparent,
            postoldparent,
            prenewparent,
            postnewparent,
            xdata: Xdata::new(),
        })
    }

    fn unlink(&self, loc: &Loc, _flags: u32, _xdata: &Xdata) -> OpResult<ParentReply> {
        self.unlink_common(loc, false)
    }

    fn rmdir(&self, loc: &Loc, _flags: u32, _xdata: &Xdata) -> OpResult<ParentReply> {
        self.unlink_common(loc, true)
    }

    // -- metadata / locking primitives ------------------------------------

    fn xattrop(&self, loc: &Loc, op: XattropOp, deltas: &Xdata, xdata: &Xdata) -> OpResult<XattrReply> {
        self.ensure_up()?;
        let gfid = {
            let inodes = self.inodes.lock();
            self.resolve(&inodes, loc)?
        };
        self.apply_xattrop(gfid, op, deltas, xdata)
    }

    fn fxattrop(&self, fd: &FdHandle, op: XattropOp, deltas: &Xdata, xdata: &Xdata) -> OpResult<XattrReply> {
        self.ensure_up()?;
        self.apply_xattrop(fd.gfid, op, deltas, xdata)
    }

    fn inodelk(
        &self,
        domain: &str,
        loc: &Loc,
        cmd: LockCmd,
        flock: &Flock,
        _xdata: &Xdata,
    ) -> OpResult<EmptyReply> {
        self.inodelk_common(domain, loc.gfid, cmd, flock)
    }

    fn finodelk(
        &self,
        domain: &str,
        fd: &FdHandle,
        cmd: LockCmd,
        flock: &Flock,
        _xdata: &Xdata,
    ) -> OpResult<EmptyReply> {
        self.inodelk_common(domain, fd.gfid, cmd, flock)
    }

    fn entrylk(
        &self,
        domain: &str,
        loc: &Loc,
        basename: Option<&str>,
        cmd: EntrylkCmd,
        _kind: EntrylkType,
        _xdata: &Xdata,
    ) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        let key = LockKey {
            domain: domain.to_string(),
            gfid: loc.gfid,
            basename: basename.map(|s| s.to_string()),
        };
        // Entry locks share the inode lock owner space.
        let owner = 1;
        match cmd {
            EntrylkCmd::Lock => self.locks.lock(key, owner, true)?,
            EntrylkCmd::LockNb => self.locks.lock(key, owner, false)?,
            EntrylkCmd::Unlock => self.locks.unlock(&key, owner)?,
        }
        Ok(EmptyReply::default())
    }

    fn fentrylk(
        &self,
        domain: &str,
        fd: &FdHandle,
        basename: Option<&str>,
        cmd: EntrylkCmd,
        kind: EntrylkType,
        xdata: &Xdata,
    ) -> OpResult<EmptyReply> {
        self.entrylk(domain, &Loc::from_gfid(fd.gfid), basename, cmd, kind, xdata)
    }

    fn lk(&self, fd: &FdHandle, _cmd: LockCmd, flock: &Flock, _xdata: &Xdata) -> OpResult<LkReply> {
        self.ensure_up()?;
        let inodes = self.inodes.lock();
        inodes.get(&fd.gfid).ok_or(libc::ESTALE)?;
        Ok(LkReply {
            flock: *flock,
            xdata: Xdata::new(),
        })
    }

    fn ipc(&self, _op: i32, _xdata: &Xdata) -> OpResult<EmptyReply> {
        self.ensure_up()?;
        Ok(EmptyReply::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(parent: Gfid, name: &str, gfid: u8) -> (Loc, MkArgs) {
        let gfid = Gfid([gfid; 16]);
        (
            Loc::entry_with_gfid(parent, name, gfid),
            MkArgs {
                mode: 0o644,
                umask: 0,
                rdev: 0,
                gfid,
                file_type: FileType::Regular,
            },
        )
    }

    #[test]
    fn create_lookup_roundtrip() {
        let brick = SimBrick::new("b0");
        let (loc, args) = entry(Gfid::ROOT, "file", 9);
        brick.mknod(&loc, &args, &Xdata::new()).unwrap();

        let reply = brick.lookup(&loc, &Xdata::new()).unwrap();
        assert_eq!(reply.iatt.gfid, Gfid([9; 16]));
        assert_eq!(reply.iatt.file_type, FileType::Regular);
        assert!(reply.postparent.is_some());
    }

    #[test]
    fn write_read_fragment() {
        let brick = SimBrick::new("b0");
        let (loc, args) = entry(Gfid::ROOT, "f", 3);
        brick.mknod(&loc, &args, &Xdata::new()).unwrap();
        let fd = FdHandle {
            gfid: Gfid([3; 16]),
            flags: 0,
        };
        brick.writev(&fd, &[1, 2, 3, 4], 8, 0, &Xdata::new()).unwrap();
        let reply = brick.readv(&fd, 100, 0, 0, &Xdata::new()).unwrap();
        assert_eq!(reply.data, vec![0, 0, 0, 0, 0, 0, 0, 0, 1, 2, 3, 4]);
    }

    #[test]
    fn xattrop_accumulates_and_returns_post() {
        let brick = SimBrick::new("b0");
        let (loc, args) = entry(Gfid::ROOT, "f", 4);
        brick.mknod(&loc, &args, &Xdata::new()).unwrap();

        let mut deltas = Xdata::new();
        deltas.set_bin(
            ondisk::XATTR_VERSION,
            ondisk::encode_u64_pair([1, 1]).to_vec(),
        );
        let loc = Loc::from_gfid(Gfid([4; 16]));
        brick
            .xattrop(&loc, XattropOp::AddArray64, &deltas, &Xdata::new())
            .unwrap();
        let reply = brick
            .xattrop(&loc, XattropOp::AddArray64, &deltas, &Xdata::new())
            .unwrap();
        let post = reply.xattrs.get_bin(ondisk::XATTR_VERSION).unwrap();
        assert_eq!(ondisk::decode_u64_pair(post).unwrap(), [2, 2]);
    }

    #[test]
    fn down_brick_refuses_everything() {
        let brick = SimBrick::new("b0");
        brick.set_up(false);
        let loc = Loc::from_gfid(Gfid::ROOT);
        assert_eq!(brick.lookup(&loc, &Xdata::new()).unwrap_err(), libc::ENOTCONN);
        assert!(!brick.is_up());
        brick.set_up(true);
        assert!(brick.lookup(&loc, &Xdata::new()).is_ok());
    }

    #[test]
    fn lock_counts_visible_in_lookup() {
        let brick = SimBrick::new("b0");
        let loc = Loc::from_gfid(Gfid::ROOT);
        let flock = Flock::whole_file(FlockType::Write, 42);
        brick
            .inodelk("vol", &loc, LockCmd::SetLk, &flock, &Xdata::new())
            .unwrap();

        let mut req = Xdata::new();
        req.set_str(keys::INODELK_COUNT, "vol");
        let reply = brick.lookup(&loc, &req).unwrap();
        assert_eq!(reply.xdata.get_u32(keys::INODELK_COUNT), Some(1));

        let unlock = Flock::whole_file(FlockType::Unlock, 42);
        brick
            .inodelk("vol", &loc, LockCmd::SetLk, &unlock, &Xdata::new())
            .unwrap();
        let reply = brick.lookup(&loc, &req).unwrap();
        assert_eq!(reply.xdata.get_u32(keys::INODELK_COUNT), Some(0));
    }

    #[test]
    fn requested_ec_xattrs_travel_in_lookup_xdata() {
        let brick = SimBrick::new("b0");
        let (loc, args) = entry(Gfid::ROOT, "f", 5);
        let mut seed = Xdata::new();
        seed.set_bin(ondisk::XATTR_SIZE, ondisk::encode_u64(12345).to_vec());
        brick.mknod(&loc, &args, &seed).unwrap();

        let mut req = Xdata::new();
        req.set_u64(ondisk::XATTR_SIZE, 0);
        let reply = brick.lookup(&loc, &req).unwrap();
        let raw = reply.xdata.get_bin(ondisk::XATTR_SIZE).unwrap();
        assert_eq!(ondisk::decode_u64(raw).unwrap(), 12345);
    }

    #[test]
    fn rmdir_requires_empty() {
        let brick = SimBrick::new("b0");
        let dir_gfid = Gfid([7; 16]);
        let dir_loc = Loc::entry_with_gfid(Gfid::ROOT, "dir", dir_gfid);
        let dir_args = MkArgs {
            mode: 0o755,
            umask: 0,
            rdev: 0,
            gfid: dir_gfid,
            file_type: FileType::Directory,
        };
        brick.mkdir(&dir_loc, &dir_args, &Xdata::new()).unwrap();

        let (file_loc, file_args) = entry(dir_gfid, "x", 8);
        brick.mknod(&file_loc, &file_args, &Xdata::new()).unwrap();

        assert_eq!(
            brick.rmdir(&dir_loc, 0, &Xdata::new()).unwrap_err(),
            libc::ENOTEMPTY
        );
        brick.unlink(&file_loc, 0, &Xdata::new()).unwrap();
        brick.rmdir(&dir_loc, 0, &Xdata::new()).unwrap();
        assert!(!brick.has_inode(dir_gfid));
    }
}
