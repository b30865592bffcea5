//! The per-brick client interface.
//!
//! One method per remote operation, mirroring the operation set the lower
//! translator exposes. Implementations are synchronous: a method returns
//! once the brick has answered, with `Err(errno)` standing in for the
//! `(op_ret = -1, op_errno)` wire convention. A brick that is down
//! reports `ENOTCONN`.
//!
//! Two primitives go beyond plain file ops: `xattrop` (atomic add of a
//! signed 64-bit array to a named xattr, returning the post value) and
//! `inodelk`/`entrylk` (advisory distributed locks keyed by inode or
//! directory entry plus a domain string).

use crate::types::{
    DirEntry, Errno, FdHandle, FileType, Flock, Gfid, Iatt, Loc, OpResult, SeekWhat, SetAttr,
    Statvfs,
};
use crate::xdata::Xdata;

// ---------------------------------------------------------------------------
// Reply payloads
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct EmptyReply {
    pub xdata: Xdata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupReply {
    pub iatt: Iatt,
    pub postparent: Option<Iatt>,
    pub xdata: Xdata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IattReply {
    pub iatt: Iatt,
    pub xdata: Xdata,
}

/// Pre/post attribute pair returned by updating inode ops.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrePostReply {
    pub pre: Iatt,
    pub post: Iatt,
    pub xdata: Xdata,
}

/// Entry creation reply: the new inode plus the parent before/after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryReply {
    pub iatt: Iatt,
    pub preparent: Iatt,
    pub postparent: Iatt,
    pub xdata: Xdata,
}

/// Entry removal reply: parent before/after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentReply {
    pub preparent: Iatt,
    pub postparent: Iatt,
    pub xdata: Xdata,
}

/// Rename reply: renamed inode, both parents before/after.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RenameReply {
    pub iatt: Iatt,
    pub preoldparent: Iatt,
    pub postoldparent: Iatt,
    pub prenewparent: Iatt,
    pub postnewparent: Iatt,
    pub xdata: Xdata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadReply {
    pub data: Vec<u8>,
    pub iatt: Iatt,
    pub xdata: Xdata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WriteReply {
    /// Bytes the brick accepted (fragment bytes, not logical bytes).
    pub written: u64,
    pub pre: Iatt,
    pub post: Iatt,
    pub xdata: Xdata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReaddirReply {
    pub entries: Vec<DirEntry>,
    pub xdata: Xdata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReadlinkReply {
    pub target: String,
    pub iatt: Iatt,
    pub xdata: Xdata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeekReply {
    pub offset: u64,
    pub xdata: Xdata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatfsReply {
    pub stat: Statvfs,
    pub xdata: Xdata,
}

/// Xattr dictionary reply (getxattr and xattrop post-values).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct XattrReply {
    pub xattrs: Xdata,
    pub xdata: Xdata,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LkReply {
    pub flock: Flock,
    pub xdata: Xdata,
}

macro_rules! impl_reply {
    ($($ty:ty),+ $(,)?) => {
        $(impl crate::cbk::Reply for $ty {
            fn xdata(&self) -> &Xdata {
                &self.xdata
            }
            fn xdata_mut(&mut self) -> &mut Xdata {
                &mut self.xdata
            }
        })+
    };
}

impl_reply!(
    EmptyReply,
    LookupReply,
    IattReply,
    PrePostReply,
    EntryReply,
    ParentReply,
    RenameReply,
    ReadReply,
    WriteReply,
    ReaddirReply,
    ReadlinkReply,
    SeekReply,
    StatfsReply,
    XattrReply,
    LkReply,
);

// ---------------------------------------------------------------------------
// Lock / xattrop argument types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockCmd {
    /// Non-blocking set.
    SetLk,
    /// Blocking set.
    SetLkWait,
    /// Query.
    GetLk,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrylkCmd {
    Lock,
    LockNb,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntrylkType {
    Read,
    Write,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XattropOp {
    /// Atomic `stored[k] += delta[k]` over big-endian i64 arrays.
    AddArray64,
}

/// Arguments for creating inodes (mknod family).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MkArgs {
    pub mode: u32,
    pub umask: u32,
    pub rdev: u64,
    /// Gfid the new inode must get, so all bricks agree.
    pub gfid: Gfid,
    pub file_type: FileType,
}

// ---------------------------------------------------------------------------
// The trait
// ---------------------------------------------------------------------------

pub trait Brick: Send + Sync {
    /// Stable identifier for logs.
    fn name(&self) -> &str;

    // -- inode reads -------------------------------------------------------

    fn lookup(&self, loc: &Loc, xdata: &Xdata) -> OpResult<LookupReply>;
    fn stat(&self, loc: &Loc, xdata: &Xdata) -> OpResult<IattReply>;
    fn fstat(&self, fd: &FdHandle, xdata: &Xdata) -> OpResult<IattReply>;
    fn access(&self, loc: &Loc, mask: u32, xdata: &Xdata) -> OpResult<EmptyReply>;
    fn readlink(&self, loc: &Loc, xdata: &Xdata) -> OpResult<ReadlinkReply>;
    fn open(&self, loc: &Loc, flags: u32, xdata: &Xdata) -> OpResult<EmptyReply>;
    fn readv(&self, fd: &FdHandle, size: u64, offset: u64, flags: u32, xdata: &Xdata)
    -> OpResult<ReadReply>;
    fn seek(&self, fd: &FdHandle, offset: u64, what: SeekWhat, xdata: &Xdata)
    -> OpResult<SeekReply>;
    fn getxattr(&self, loc: &Loc, name: Option<&str>, xdata: &Xdata) -> OpResult<XattrReply>;
    fn fgetxattr(&self, fd: &FdHandle, name: Option<&str>, xdata: &Xdata) -> OpResult<XattrReply>;
    fn statfs(&self, loc: &Loc, xdata: &Xdata) -> OpResult<StatfsReply>;

    // -- directory reads ---------------------------------------------------

    fn opendir(&self, loc: &Loc, xdata: &Xdata) -> OpResult<EmptyReply>;
    fn readdir(&self, fd: &FdHandle, size: u64, offset: u64, xdata: &Xdata)
    -> OpResult<ReaddirReply>;
    fn readdirp(&self, fd: &FdHandle, size: u64, offset: u64, xdata: &Xdata)
    -> OpResult<ReaddirReply>;

    // -- inode writes ------------------------------------------------------

    fn writev(&self, fd: &FdHandle, data: &[u8], offset: u64, flags: u32, xdata: &Xdata)
    -> OpResult<WriteReply>;
    fn truncate(&self, loc: &Loc, offset: u64, xdata: &Xdata) -> OpResult<PrePostReply>;
    fn ftruncate(&self, fd: &FdHandle, offset: u64, xdata: &Xdata) -> OpResult<PrePostReply>;
    fn fallocate(&self, fd: &FdHandle, mode: u32, offset: u64, len: u64, xdata: &Xdata)
    -> OpResult<PrePostReply>;
    fn discard(&self, fd: &FdHandle, offset: u64, len: u64, xdata: &Xdata)
    -> OpResult<PrePostReply>;
    fn zerofill(&self, fd: &FdHandle, offset: u64, len: u64, xdata: &Xdata)
    -> OpResult<PrePostReply>;
    fn setattr(&self, loc: &Loc, attr: &SetAttr, valid: u32, xdata: &Xdata)
    -> OpResult<PrePostReply>;
    fn fsetattr(&self, fd: &FdHandle, attr: &SetAttr, valid: u32, xdata: &Xdata)
    -> OpResult<PrePostReply>;
    fn setxattr(&self, loc: &Loc, xattrs: &Xdata, flags: u32, xdata: &Xdata)
    -> OpResult<EmptyReply>;
    fn fsetxattr(&self, fd: &FdHandle, xattrs: &Xdata, flags: u32, xdata: &Xdata)
    -> OpResult<EmptyReply>;
    fn removexattr(&self, loc: &Loc, name: &str, xdata: &Xdata) -> OpResult<EmptyReply>;
    fn fremovexattr(&self, fd: &FdHandle, name: &str, xdata: &Xdata) -> OpResult<EmptyReply>;
    fn flush(&self, fd: &FdHandle, xdata: &Xdata) -> OpResult<EmptyReply>;
    fn fsync(&self, fd: &FdHandle, datasync: bool, xdata: &Xdata) -> OpResult<PrePostReply>;
    fn fsyncdir(&self, fd: &FdHandle, datasync: bool, xdata: &Xdata) -> OpResult<EmptyReply>;

    // -- directory writes --------------------------------------------------

    fn create(&self, loc: &Loc, flags: u32, args: &MkArgs, xdata: &Xdata) -> OpResult<EntryReply>;
    fn mknod(&self, loc: &Loc, args: &MkArgs, xdata: &Xdata) -> OpResult<EntryReply>;
    fn mkdir(&self, loc: &Loc, args: &MkArgs, xdata: &Xdata) -> OpResult<EntryReply>;
    fn symlink(&self, target: &str, loc: &Loc, args: &MkArgs, xdata: &Xdata)
    -> OpResult<EntryReply>;
    fn link(&self, old: &Loc, new: &Loc, xdata: &Xdata) -> OpResult<EntryReply>;
    fn rename(&self, old: &Loc, new: &Loc, xdata: &Xdata) -> OpResult<RenameReply>;
    fn unlink(&self, loc: &Loc, flags: u32, xdata: &Xdata) -> OpResult<ParentReply>;
    fn rmdir(&self, loc: &Loc, flags: u32, xdata: &Xdata) -> OpResult<ParentReply>;

    // -- metadata / locking primitives ------------------------------------

    fn xattrop(&self, loc: &Loc, op: XattropOp, deltas: &Xdata, xdata: &Xdata)
    -> OpResult<XattrReply>;
    fn fxattrop(&self, fd: &FdHandle, op: XattropOp, deltas: &Xdata, xdata: &Xdata)
    -> OpResult<XattrReply>;
    fn inodelk(&self, domain: &str, loc: &Loc, cmd: LockCmd, flock: &Flock, xdata: &Xdata)
    -> OpResult<EmptyReply>;
    fn finodelk(&self, domain: &str, fd: &FdHandle, cmd: LockCmd, flock: &Flock, xdata: &Xdata)
    -> OpResult<EmptyReply>;
    fn entrylk(
        &self,
        domain: &str,
        loc: &Loc,
        basename: Option<&str>,
        cmd: EntrylkCmd,
        kind: EntrylkType,
        xdata: &Xdata,
    ) -> OpResult<EmptyReply>;
    fn fentrylk(
        &self,
        domain: &str,
        fd: &FdHandle,
        basename: Option<&str>,
        cmd: EntrylkCmd,
        kind: EntrylkType,
        xdata: &Xdata,
    ) -> OpResult<EmptyReply>;
    fn lk(&self, fd: &FdHandle, cmd: LockCmd, flock: &Flock, xdata: &Xdata) -> OpResult<LkReply>;
    fn ipc(&self, op: i32, xdata: &Xdata) -> OpResult<EmptyReply>;
}
