//! Common value types shared by the engine, the brick API and the healers.

use std::fmt;

/// POSIX errno carried on the wire. 0 means success when used as a raw
/// return code; fallible operations use `Result<_, Errno>` instead.
pub type Errno = i32;

/// Result of a single brick operation.
pub type OpResult<T> = Result<T, Errno>;

// ---------------------------------------------------------------------------
// Gfid
// ---------------------------------------------------------------------------

/// 128-bit global file identifier.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Gfid(pub [u8; 16]);

impl Gfid {
    /// The well-known root directory gfid (…0001).
    pub const ROOT: Gfid = {
        let mut b = [0u8; 16];
        b[15] = 1;
        Gfid(b)
    };

    pub const NULL: Gfid = Gfid([0u8; 16]);

    pub fn is_null(&self) -> bool {
        *self == Self::NULL
    }

    /// Stable non-cryptographic hash, used by the gfid-hash read policy.
    pub fn hash(&self) -> u32 {
        // FNV-1a over the 16 bytes.
        let mut h: u32 = 0x811c_9dc5;
        for b in self.0 {
            h ^= u32::from(b);
            h = h.wrapping_mul(0x0100_0193);
        }
        h
    }

    /// 64-bit inode number derived from the gfid, as reported in iatts.
    pub fn to_ino(&self) -> u64 {
        u64::from_be_bytes(self.0[8..16].try_into().expect("gfid tail is 8 bytes"))
    }
}

impl fmt::Debug for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, b) in self.0.iter().enumerate() {
            if matches!(i, 4 | 6 | 8 | 10) {
                write!(f, "-")?;
            }
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Display for Gfid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

// ---------------------------------------------------------------------------
// Inode attributes
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum FileType {
    #[default]
    Invalid,
    Regular,
    Directory,
    Symlink,
    BlockDev,
    CharDev,
    Fifo,
    Socket,
}

impl FileType {
    pub fn is_regular(&self) -> bool {
        matches!(self, FileType::Regular)
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, FileType::Directory)
    }

    pub fn is_device(&self) -> bool {
        matches!(self, FileType::BlockDev | FileType::CharDev)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub fn max(self, other: Timespec) -> Timespec {
        if other > self { other } else { self }
    }
}

/// Inode attributes as returned by bricks and handed back to the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Iatt {
    pub gfid: Gfid,
    pub ino: u64,
    pub file_type: FileType,
    pub mode: u32,
    pub nlink: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub size: u64,
    pub blksize: u32,
    pub blocks: u64,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
}

/// Fields selected by a setattr call.
pub mod setattr_valid {
    pub const MODE: u32 = 1 << 0;
    pub const UID: u32 = 1 << 1;
    pub const GID: u32 = 1 << 2;
    pub const ATIME: u32 = 1 << 3;
    pub const MTIME: u32 = 1 << 4;
}

/// Attribute changes for setattr/fsetattr.
#[derive(Debug, Clone, Copy, Default)]
pub struct SetAttr {
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub atime: Timespec,
    pub mtime: Timespec,
}

// ---------------------------------------------------------------------------
// Locations, fds, directory entries
// ---------------------------------------------------------------------------

/// A resolved location: the inode's gfid plus, for entry operations, the
/// parent directory and basename.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Loc {
    pub gfid: Gfid,
    pub parent: Option<Gfid>,
    pub name: Option<String>,
}

impl Loc {
    pub fn from_gfid(gfid: Gfid) -> Self {
        Loc {
            gfid,
            parent: None,
            name: None,
        }
    }

    pub fn entry(parent: Gfid, name: &str) -> Self {
        Loc {
            gfid: Gfid::NULL,
            parent: Some(parent),
            name: Some(name.to_string()),
        }
    }

    pub fn entry_with_gfid(parent: Gfid, name: &str, gfid: Gfid) -> Self {
        Loc {
            gfid,
            parent: Some(parent),
            name: Some(name.to_string()),
        }
    }
}

/// What a brick needs to know about an open file descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FdHandle {
    pub gfid: Gfid,
    pub flags: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub gfid: Gfid,
    pub file_type: FileType,
    /// Opaque resume offset for the next readdir call.
    pub offset: u64,
    /// Present in readdirp replies only.
    pub iatt: Option<Iatt>,
}

// ---------------------------------------------------------------------------
// statfs / locks
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Statvfs {
    pub bsize: u64,
    pub frsize: u64,
    pub blocks: u64,
    pub bfree: u64,
    pub bavail: u64,
    pub files: u64,
    pub ffree: u64,
    pub favail: u64,
    pub namemax: u64,
    pub flags: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlockType {
    Read,
    Write,
    Unlock,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Flock {
    pub kind: FlockType,
    pub start: u64,
    pub len: u64,
    pub pid: u32,
    pub owner: u64,
}

impl Flock {
    pub fn whole_file(kind: FlockType, owner: u64) -> Self {
        Flock {
            kind,
            start: 0,
            len: 0,
            pid: 0,
            owner,
        }
    }
}

/// Whence for the seek fop (data/hole search).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeekWhat {
    Data,
    Hole,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn root_gfid_is_one() {
        assert_eq!(Gfid::ROOT.0[15], 1);
        assert!(!Gfid::ROOT.is_null());
        assert!(Gfid::NULL.is_null());
    }

    #[test]
    fn gfid_hash_is_stable() {
        let g = Gfid([7; 16]);
        assert_eq!(g.hash(), g.hash());
        assert_ne!(Gfid([1; 16]).hash(), Gfid([2; 16]).hash());
    }

    #[test]
    fn gfid_display_is_uuid_shaped() {
        let s = Gfid::ROOT.to_string();
        assert_eq!(s.len(), 36);
        assert_eq!(s.matches('-').count(), 4);
        assert!(s.ends_with("01"));
    }

    #[test]
    fn timespec_max_prefers_later() {
        let a = Timespec { sec: 5, nsec: 10 };
        let b = Timespec { sec: 5, nsec: 20 };
        assert_eq!(a.max(b), b);
        assert_eq!(b.max(a), b);
    }
}
