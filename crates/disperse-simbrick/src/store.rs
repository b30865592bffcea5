//! The in-memory inode store of one brick.

use std::collections::BTreeMap;

use disperse_core::types::{FileType, Gfid, Iatt, Timespec};
use disperse_core::xdata::XdataValue;

/// One inode as a brick sees it: attributes, xattrs and either fragment
/// bytes, directory entries or a symlink target.
#[derive(Debug, Clone)]
pub(crate) struct Inode {
    pub gfid: Gfid,
    pub file_type: FileType,
    pub mode: u32,
    pub uid: u32,
    pub gid: u32,
    pub rdev: u64,
    pub nlink: u32,
    pub atime: Timespec,
    pub mtime: Timespec,
    pub ctime: Timespec,
    pub xattrs: BTreeMap<String, XdataValue>,
    /// Fragment bytes for regular files.
    pub data: Vec<u8>,
    /// name -> gfid for directories.
    pub entries: BTreeMap<String, Gfid>,
    /// Target for symlinks.
    pub symlink: Option<String>,
}

impl Inode {
    pub fn new(gfid: Gfid, file_type: FileType, mode: u32, now: Timespec) -> Self {
        Inode {
            gfid,
            file_type,
            mode,
            uid: 0,
            gid: 0,
            rdev: 0,
            nlink: 1,
            atime: now,
            mtime: now,
            ctime: now,
            xattrs: BTreeMap::new(),
            data: Vec::new(),
            entries: BTreeMap::new(),
            symlink: None,
        }
    }

    pub fn iatt(&self) -> Iatt {
        Iatt {
            gfid: self.gfid,
            ino: self.gfid.to_ino(),
            file_type: self.file_type,
            mode: self.mode,
            nlink: self.nlink,
            uid: self.uid,
            gid: self.gid,
            rdev: self.rdev,
            size: if self.file_type.is_dir() {
                4096
            } else {
                self.data.len() as u64
            },
            blksize: 4096,
            blocks: (self.data.len() as u64).div_ceil(512),
            atime: self.atime,
            mtime: self.mtime,
            ctime: self.ctime,
        }
    }

    /// Write into the fragment, zero-extending as needed.
    pub fn write_at(&mut self, offset: u64, bytes: &[u8]) {
        let end = offset as usize + bytes.len();
        if self.data.len() < end {
            self.data.resize(end, 0);
        }
        self.data[offset as usize..end].copy_from_slice(bytes);
    }

    pub fn read_at(&self, offset: u64, len: u64) -> Vec<u8> {
        let start = (offset as usize).min(self.data.len());
        let end = (offset as usize + len as usize).min(self.data.len());
        self.data[start..end].to_vec()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_extends_and_reads_back() {
        let mut inode = Inode::new(Gfid([1; 16]), FileType::Regular, 0o644, Timespec::default());
        inode.write_at(4, &[1, 2, 3]);
        assert_eq!(inode.data.len(), 7);
        assert_eq!(inode.read_at(0, 7), vec![0, 0, 0, 0, 1, 2, 3]);
        assert_eq!(inode.read_at(5, 100), vec![2, 3]);
        assert_eq!(inode.read_at(100, 5), Vec::<u8>::new());
    }

    #[test]
    fn iatt_reflects_fragment_size() {
        let mut inode = Inode::new(Gfid([2; 16]), FileType::Regular, 0o644, Timespec::default());
        inode.write_at(0, &[0u8; 1024]);
        let iatt = inode.iatt();
        assert_eq!(iatt.size, 1024);
        assert_eq!(iatt.blocks, 2);
        assert_eq!(iatt.ino, Gfid([2; 16]).to_ino());
    }
}
