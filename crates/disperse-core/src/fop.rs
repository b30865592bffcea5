//! In-flight operation bookkeeping.
//!
//! A fop is a plain value: identity, dispatch masks and quorum bookkeeping,
//! plus up to two lock links. Sub-operations (reconstruction reads, lock
//! and metadata traffic) run as child fops that inherit the parent's
//! brick scope.

use crate::mask::BrickMask;
use crate::types::{Errno, FdHandle, Gfid, Loc};

/// Operation identifiers, used for dispatch policy decisions and logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FopKind {
    Lookup,
    Stat,
    Fstat,
    Access,
    Readlink,
    Open,
    Opendir,
    Readv,
    Readdir,
    Readdirp,
    Seek,
    Statfs,
    Flush,
    Fsync,
    Fsyncdir,
    Getxattr,
    Fgetxattr,
    Setxattr,
    Fsetxattr,
    Removexattr,
    Fremovexattr,
    Setattr,
    Fsetattr,
    Create,
    Link,
    Symlink,
    Mknod,
    Mkdir,
    Rename,
    Unlink,
    Rmdir,
    Truncate,
    Ftruncate,
    Writev,
    Fallocate,
    Discard,
    Zerofill,
    Xattrop,
    Fxattrop,
    Inodelk,
    Finodelk,
    Entrylk,
    Fentrylk,
    Lk,
    Ipc,
    Heal,
}

impl FopKind {
    /// Updates content, so healing bricks must be counted in its scope.
    pub fn is_data_fop(&self) -> bool {
        matches!(
            self,
            FopKind::Writev
                | FopKind::Truncate
                | FopKind::Ftruncate
                | FopKind::Fallocate
                | FopKind::Discard
                | FopKind::Zerofill
        )
    }

    /// xattrop traffic must reach every brick that may hold state.
    pub fn is_xattrop(&self) -> bool {
        matches!(self, FopKind::Xattrop | FopKind::Fxattrop)
    }
}

/// Fop flags.
pub const FLAG_LOCK_SHARED: u32 = 0x0001;

/// Lock-preparation flags.
pub const LOCK_UPDATE_DATA: u32 = 1;
pub const LOCK_UPDATE_META: u32 = 2;
pub const LOCK_QUERY_INFO: u32 = 4;
pub const LOCK_INODE_SIZE: u32 = 8;

/// How many answers a fop needs before it can succeed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Minimum {
    /// Everything reachable (degrades to K when fewer answer).
    All,
    /// Exactly K.
    Min,
    /// A single answer.
    One,
}

/// One lock a fop holds or is acquiring.
#[derive(Debug, Clone)]
pub struct LockLink {
    pub gfid: Gfid,
    /// Which transaction classes this fop will bump on success.
    pub update: [bool; 2],
    /// Entry location whose size should be discovered for the reply iatt.
    pub base: Option<Loc>,
    /// Size discovered for `base`.
    pub size: Option<u64>,
    pub fd: Option<FdHandle>,
}

/// Scope inherited by a child fop from its parent.
#[derive(Debug, Clone, Copy)]
pub struct ParentScope {
    pub mask: BrickMask,
    pub healing: BrickMask,
    /// Internal ops (unlocks, xattrop) ignore the parent restriction.
    pub internal: bool,
}

/// An in-flight operation.
#[derive(Debug)]
pub struct Fop {
    pub id: u64,
    pub kind: FopKind,
    pub flags: u32,
    pub gfid: Gfid,

    pub minimum: Minimum,
    pub resolved_min: usize,
    pub mask: BrickMask,
    pub remaining: BrickMask,
    pub received: BrickMask,
    pub good: BrickMask,
    pub healing: BrickMask,
    pub first: usize,
    pub expected: usize,

    pub error: Option<Errno>,
    pub parent: Option<ParentScope>,
    /// Cleanup traffic (unlocks, xattrop) that must reach every brick
    /// holding state: exempt from quorum refusal and parent-mask cuts.
    pub internal: bool,

    pub locks: Vec<LockLink>,
    pub first_lock: usize,
    /// Set once the first link has asked the bricks for lock-domain
    /// counts; main-op requests then carry the query key.
    pub want_lock_count: bool,

    /// Locations to heal when answers diverge.
    pub heal_locs: Vec<Loc>,
    /// Directory-flavoured answers only need a partial (name) heal.
    pub heal_partial: bool,
}

impl Fop {
    pub fn new(id: u64, kind: FopKind, flags: u32, target: BrickMask, minimum: Minimum) -> Self {
        Fop {
            id,
            kind,
            flags,
            gfid: Gfid::NULL,
            minimum,
            resolved_min: 0,
            mask: target,
            remaining: BrickMask::EMPTY,
            received: BrickMask::EMPTY,
            good: BrickMask::EMPTY,
            healing: BrickMask::EMPTY,
            first: 0,
            expected: 0,
            error: None,
            parent: None,
            internal: false,
            locks: Vec::new(),
            first_lock: 0,
            want_lock_count: false,
            heal_locs: Vec::new(),
            heal_partial: false,
        }
    }

    pub fn shared(&self) -> bool {
        self.flags & FLAG_LOCK_SHARED != 0
    }

    /// First non-zero error sticks.
    pub fn set_error(&mut self, errno: Errno) {
        if errno != 0 && self.error.is_none() {
            self.error = Some(errno);
        }
    }

    pub fn failed(&self) -> bool {
        self.error.is_some()
    }

    /// Lock link visit order: `first_lock` names the gfid-smaller link.
    pub fn lock_order(&self) -> impl Iterator<Item = usize> + '_ {
        let n = self.locks.len();
        (0..n).map(move |i| if n == 2 { i ^ self.first_lock } else { i })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn data_fop_classification() {
        assert!(FopKind::Writev.is_data_fop());
        assert!(FopKind::Ftruncate.is_data_fop());
        assert!(!FopKind::Lookup.is_data_fop());
        assert!(!FopKind::Setattr.is_data_fop());
    }

    #[test]
    fn first_error_sticks() {
        let mut fop = Fop::new(1, FopKind::Writev, 0, BrickMask::all(6), Minimum::All);
        fop.set_error(libc::EIO);
        fop.set_error(libc::ENOENT);
        assert_eq!(fop.error, Some(libc::EIO));
    }

    #[test]
    fn lock_order_respects_first_lock() {
        let mut fop = Fop::new(1, FopKind::Rename, 0, BrickMask::all(6), Minimum::All);
        fop.locks.push(LockLink {
            gfid: Gfid([9; 16]),
            update: [true, true],
            base: None,
            size: None,
            fd: None,
        });
        fop.locks.push(LockLink {
            gfid: Gfid([1; 16]),
            update: [true, true],
            base: None,
            size: None,
            fd: None,
        });
        fop.first_lock = 1;
        assert_eq!(fop.lock_order().collect::<Vec<_>>(), vec![1, 0]);
        fop.first_lock = 0;
        assert_eq!(fop.lock_order().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn shared_flag() {
        let fop = Fop::new(1, FopKind::Readv, FLAG_LOCK_SHARED, BrickMask::all(6), Minimum::Min);
        assert!(fop.shared());
    }
}
