//! Answer reconciliation rules.
//!
//! Two replies belong in the same group only if they agree under these
//! rules: equal return codes, equal dictionaries under the compare
//! filter, and equal payloads under the fop-specific predicate. Once a
//! group is chosen as the answer, its dictionaries are merged key by key
//! with the special combination rules below.

use crate::cbk::Group;
use crate::cbk::Reply;
use crate::mask::BrickMask;
use crate::ondisk;
use crate::types::{FileType, Iatt, Statvfs};
use crate::xdata::{Xdata, XdataValue, keys};

// ---------------------------------------------------------------------------
// Key classification
// ---------------------------------------------------------------------------

/// Keys excluded from the equality comparison entirely: they vary
/// legitimately between bricks and are merged later instead.
pub fn key_skipped_in_compare(key: &str) -> bool {
    is_stime_key(key)
        || key == keys::LINK_COUNT
        || key == keys::INODELK_COUNT
        || key == keys::ENTRYLK_COUNT
        || key == keys::OPEN_FD_COUNT
}

/// Keys whose presence must match but whose value is opaque per brick.
pub fn value_ignored_in_compare(key: &str) -> bool {
    key == keys::PATHINFO
        || key == keys::USER_PATHINFO
        || key == keys::LOCKINFO
        || key == keys::NODE_UUID
        || key.starts_with(keys::CLRLK_CMD_PREFIX)
        || key.starts_with(keys::QUOTA_PREFIX)
        || is_xtime_key(key)
}

fn is_stime_key(key: &str) -> bool {
    key.starts_with("trusted.glusterfs.") && key.ends_with(keys::STIME_SUFFIX)
}

fn is_xtime_key(key: &str) -> bool {
    key.starts_with(keys::MARKER_PREFIX) && key.ends_with(keys::XTIME_SUFFIX)
}

/// Equality of two reply dictionaries under the compare filter.
pub fn xdata_compatible(a: &Xdata, b: &Xdata) -> bool {
    let keys_a: Vec<&str> = a.keys().filter(|k| !key_skipped_in_compare(k)).collect();
    let keys_b: Vec<&str> = b.keys().filter(|k| !key_skipped_in_compare(k)).collect();
    if keys_a != keys_b {
        return false;
    }
    for key in keys_a {
        if value_ignored_in_compare(key) {
            continue;
        }
        if a.get(key) != b.get(key) {
            return false;
        }
    }
    true
}

// ---------------------------------------------------------------------------
// Group dictionary combination
// ---------------------------------------------------------------------------

/// Merge the dictionaries of a chosen answer group into one reply
/// dictionary, applying the per-key combination rules. `fragments` scales
/// quota sizes back to logical bytes.
pub fn combine_group_xdata<R: Reply>(group: &Group<R>, fragments: usize) -> Xdata {
    combine_group_dicts(group, fragments, |r| r.xdata())
}

/// Same merge over an arbitrary dictionary of the replies (getxattr and
/// xattrop carry theirs outside the reply xdata).
pub fn combine_group_dicts<R>(
    group: &Group<R>,
    fragments: usize,
    dict_of: impl Fn(&R) -> &Xdata,
) -> Xdata {
    let dicts: Vec<(usize, &Xdata)> = group
        .cbks
        .iter()
        .filter_map(|c| c.result.as_ref().ok().map(|r| (c.idx, dict_of(r))))
        .collect();

    let Some(&(_, rep)) = dicts.first() else {
        return Xdata::new();
    };

    let mut out = Xdata::new();
    for (key, value) in rep.iter() {
        let combined = combine_one_key(key, value, &dicts, fragments);
        out.set(key, combined);
    }
    out
}

fn values_for<'a>(key: &str, dicts: &[(usize, &'a Xdata)]) -> Vec<(usize, &'a XdataValue)> {
    dicts
        .iter()
        .filter_map(|&(idx, d)| d.get(key).map(|v| (idx, v)))
        .collect()
}

fn combine_one_key(
    key: &str,
    rep_value: &XdataValue,
    dicts: &[(usize, &Xdata)],
    fragments: usize,
) -> XdataValue {
    let all = values_for(key, dicts);

    if key == keys::PATHINFO || key == keys::USER_PATHINFO {
        return concat_values(&all, "(<EC> ", " ", ")");
    }
    if key.starts_with(keys::CLRLK_CMD_PREFIX) {
        return concat_values(&all, "", "\n", "");
    }
    if key == keys::LOCKINFO {
        return merge_pairs(&all, rep_value);
    }
    if key == keys::LINK_COUNT
        || key == keys::OPEN_FD_COUNT
        || key == keys::INODELK_COUNT
        || key == keys::ENTRYLK_COUNT
    {
        let max = all.iter().filter_map(|(_, v)| as_u32(v)).max().unwrap_or(0);
        return XdataValue::U32(max);
    }
    if key == keys::QUOTA_SIZE {
        return combine_quota(&all, rep_value, fragments);
    }
    if key == keys::NODE_UUID {
        // The answer from the lowest brick index wins.
        return all
            .iter()
            .min_by_key(|(idx, _)| *idx)
            .map(|(_, v)| (*v).clone())
            .unwrap_or_else(|| rep_value.clone());
    }
    if is_stime_key(key) {
        return combine_stime(&all, rep_value);
    }
    if is_xtime_key(key) {
        let max = all.iter().filter_map(|(_, v)| as_u64(v)).max().unwrap_or(0);
        return XdataValue::U64(max);
    }

    rep_value.clone()
}

fn as_u32(v: &XdataValue) -> Option<u32> {
    match v {
        XdataValue::U32(n) => Some(*n),
        XdataValue::U64(n) => u32::try_from(*n).ok(),
        _ => None,
    }
}

fn as_u64(v: &XdataValue) -> Option<u64> {
    match v {
        XdataValue::U32(n) => Some(u64::from(*n)),
        XdataValue::U64(n) => Some(*n),
        XdataValue::Bin(b) => ondisk::decode_u64(b).ok(),
        _ => None,
    }
}

fn concat_values(all: &[(usize, &XdataValue)], pre: &str, sep: &str, post: &str) -> XdataValue {
    let mut s = String::from(pre);
    let mut first = true;
    for (_, v) in all {
        if let XdataValue::Str(part) = v {
            if !first {
                s.push_str(sep);
            }
            s.push_str(part);
            first = false;
        }
    }
    s.push_str(post);
    XdataValue::Str(s)
}

fn merge_pairs(all: &[(usize, &XdataValue)], rep: &XdataValue) -> XdataValue {
    let mut merged = std::collections::BTreeMap::new();
    for (_, v) in all {
        if let XdataValue::Pairs(pairs) = v {
            for (k, val) in pairs {
                merged.insert(k.clone(), val.clone());
            }
        }
    }
    if merged.is_empty() {
        rep.clone()
    } else {
        XdataValue::Pairs(merged)
    }
}

fn combine_quota(all: &[(usize, &XdataValue)], rep: &XdataValue, fragments: usize) -> XdataValue {
    let mut bytes = 0u64;
    let mut files = 0u64;
    let mut dirs = 0u64;
    let mut seen = false;
    for (_, v) in all {
        if let XdataValue::Quota {
            bytes: b,
            files: f,
            dirs: d,
        } = v
        {
            bytes = bytes.max(*b);
            files = files.max(*f);
            dirs = dirs.max(*d);
            seen = true;
        }
    }
    if !seen {
        return rep.clone();
    }
    // Quota accounts fragment bytes; scale back to logical bytes.
    XdataValue::Quota {
        bytes: bytes.saturating_mul(fragments as u64),
        files,
        dirs,
    }
}

fn combine_stime(all: &[(usize, &XdataValue)], rep: &XdataValue) -> XdataValue {
    // stime is a (sec, nsec) big-endian pair; the latest wins.
    let mut best: Option<[u64; 2]> = None;
    for (_, v) in all {
        if let XdataValue::Bin(raw) = v
            && let Ok(pair) = ondisk::decode_u64_pair(raw)
        {
            best = Some(match best {
                None => pair,
                Some(cur) if pair > cur => pair,
                Some(cur) => cur,
            });
        }
    }
    match best {
        Some(pair) => XdataValue::Bin(ondisk::encode_u64_pair(pair).to_vec()),
        None => rep.clone(),
    }
}

// ---------------------------------------------------------------------------
// Iatt combination
// ---------------------------------------------------------------------------

/// Merge `src` into `dst`, element-wise. Returns false when the answers
/// are genuinely divergent and must not share a group.
///
/// Identity fields (ino, gfid, rdev for devices) must always match; the
/// mutable fields (uid, gid, mode, regular-file size) only when `trusted`
/// is set, i.e. the top-level fop holds a lock on the inode or is a
/// lookup. Untrusted differences are ignored.
pub fn iatt_combine(trusted: bool, dst: &mut [Iatt], src: &[Iatt]) -> bool {
    debug_assert_eq!(dst.len(), src.len());

    for (d, s) in dst.iter().zip(src.iter()) {
        if d.ino != s.ino
            || d.gfid != s.gfid
            || (d.file_type.is_device() && d.rdev != s.rdev)
        {
            log::warn!(
                "failed to combine iatt (ino {}-{}, gfid {}-{})",
                d.ino,
                s.ino,
                d.gfid,
                s.gfid
            );
            return false;
        }
        let unstable_diff = d.uid != s.uid
            || d.gid != s.gid
            || d.mode != s.mode
            || d.file_type != s.file_type
            || (d.file_type.is_regular() && d.size != s.size);
        if unstable_diff {
            if trusted {
                log::warn!(
                    "failed to combine iatt (uid {}-{}, gid {}-{}, mode {:o}-{:o}, size {}-{})",
                    d.uid,
                    s.uid,
                    d.gid,
                    s.gid,
                    d.mode,
                    s.mode,
                    d.size,
                    s.size
                );
                return false;
            }
            log::debug!("ignoring iatt differences because inode is not locked");
        }
    }

    for (d, s) in dst.iter_mut().zip(src.iter()) {
        d.blocks += s.blocks;
        d.blksize = d.blksize.max(s.blksize);
        d.atime = d.atime.max(s.atime);
        d.mtime = d.mtime.max(s.mtime);
        d.ctime = d.ctime.max(s.ctime);
    }
    true
}

/// Undo the fragmentation in combined iatts: blocks were accumulated from
/// `answers` bricks each holding 1/K of the data.
pub fn iatt_rebuild(iatts: &mut [Iatt], fragments: usize, answers: usize) {
    if answers == 0 {
        return;
    }
    for iatt in iatts {
        iatt.blocks = (iatt.blocks * fragments as u64).div_ceil(answers as u64);
    }
}

// ---------------------------------------------------------------------------
// statvfs combination
// ---------------------------------------------------------------------------

/// Merge one brick's filesystem statistics into the accumulator: space is
/// constrained by the fullest brick, file counts by the largest
/// namespace.
pub fn statvfs_combine(dst: &mut Statvfs, src: &Statvfs) {
    if dst.bsize < src.bsize {
        dst.bsize = src.bsize;
    }
    if dst.frsize < src.frsize {
        let scale = |v: u64| v * dst.frsize / src.frsize;
        dst.blocks = scale(dst.blocks);
        dst.bfree = scale(dst.bfree);
        dst.bavail = scale(dst.bavail);
        dst.frsize = src.frsize;
        dst.blocks = dst.blocks.min(src.blocks);
        dst.bfree = dst.bfree.min(src.bfree);
        dst.bavail = dst.bavail.min(src.bavail);
    } else {
        let scale = |v: u64| {
            if dst.frsize == 0 {
                v
            } else {
                v * src.frsize / dst.frsize
            }
        };
        dst.blocks = dst.blocks.min(scale(src.blocks));
        dst.bfree = dst.bfree.min(scale(src.bfree));
        dst.bavail = dst.bavail.min(scale(src.bavail));
    }

    dst.files = dst.files.max(src.files);
    dst.ffree = dst.ffree.min(src.ffree);
    dst.favail = dst.favail.min(src.favail);
    if dst.namemax > src.namemax {
        dst.namemax = src.namemax;
    }
    if dst.flags != src.flags {
        log::debug!(
            "mismatching file system flags ({:x}, {:x})",
            dst.flags,
            src.flags
        );
    }
    dst.flags &= src.flags;
}

/// Scale the block counts of a statvfs by the data-fragment count, used
/// when quota accounting deems the statfs values fragment-sized.
pub fn statvfs_scale(stat: &mut Statvfs, fragments: usize) {
    let k = fragments as u64;
    stat.blocks = stat.blocks.saturating_mul(k);
    stat.bfree = stat.bfree.saturating_mul(k);
    stat.bavail = stat.bavail.saturating_mul(k);
}

/// Is a brick still interesting for healing, i.e. did some configured
/// brick answer outside the good set.
pub fn needs_heal(up: BrickMask, remaining: BrickMask, good: BrickMask) -> bool {
    !(up & !(remaining | good)).is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{Gfid, Timespec};

    fn iatt(gfid: u8, uid: u32, size: u64) -> Iatt {
        Iatt {
            gfid: Gfid([gfid; 16]),
            ino: u64::from(gfid),
            file_type: FileType::Regular,
            mode: 0o644,
            uid,
            gid: 0,
            size,
            blksize: 4096,
            blocks: 8,
            ..Default::default()
        }
    }

    #[test]
    fn compare_filter_skips_volatile_keys() {
        let mut a = Xdata::new();
        let mut b = Xdata::new();
        a.set_u32(keys::INODELK_COUNT, 1);
        b.set_u32(keys::INODELK_COUNT, 2);
        assert!(xdata_compatible(&a, &b));

        a.set_str("some.key", "x");
        assert!(!xdata_compatible(&a, &b));
        b.set_str("some.key", "y");
        assert!(!xdata_compatible(&a, &b));
        b.set_str("some.key", "x");
        assert!(xdata_compatible(&a, &b));
    }

    #[test]
    fn compare_ignores_opaque_values_but_not_presence() {
        let mut a = Xdata::new();
        let mut b = Xdata::new();
        a.set_str(keys::PATHINFO, "brick-a");
        b.set_str(keys::PATHINFO, "brick-b");
        assert!(xdata_compatible(&a, &b));

        let empty = Xdata::new();
        assert!(!xdata_compatible(&a, &empty));
    }

    #[test]
    fn iatt_combine_merges_blocks_and_times() {
        let mut dst = [iatt(1, 0, 100)];
        let mut src = [iatt(1, 0, 100)];
        src[0].blocks = 4;
        src[0].mtime = Timespec { sec: 10, nsec: 0 };
        assert!(iatt_combine(true, &mut dst, &src));
        assert_eq!(dst[0].blocks, 12);
        assert_eq!(dst[0].mtime, Timespec { sec: 10, nsec: 0 });
    }

    #[test]
    fn iatt_combine_rejects_identity_mismatch() {
        let mut dst = [iatt(1, 0, 100)];
        let src = [iatt(2, 0, 100)];
        assert!(!iatt_combine(false, &mut dst, &src));
    }

    #[test]
    fn iatt_combine_trust_gates_unstable_fields() {
        let mut dst = [iatt(1, 0, 100)];
        let src = [iatt(1, 42, 100)];
        assert!(!iatt_combine(true, &mut dst, &src.clone()));

        let mut dst = [iatt(1, 0, 100)];
        assert!(iatt_combine(false, &mut dst, &src));
    }

    #[test]
    fn iatt_rebuild_scales_blocks() {
        let mut ia = [iatt(1, 0, 100)];
        ia[0].blocks = 9;
        iatt_rebuild(&mut ia, 4, 4);
        assert_eq!(ia[0].blocks, 9);

        let mut ia = [iatt(1, 0, 100)];
        ia[0].blocks = 10; // 5 blocks from each of 2 answers
        iatt_rebuild(&mut ia, 4, 2);
        assert_eq!(ia[0].blocks, 20);
    }

    #[test]
    fn statvfs_takes_most_constrained_space() {
        let mut dst = Statvfs {
            bsize: 4096,
            frsize: 4096,
            blocks: 1000,
            bfree: 500,
            bavail: 400,
            files: 100,
            ffree: 50,
            favail: 40,
            namemax: 255,
            flags: 0b11,
        };
        let src = Statvfs {
            bsize: 4096,
            frsize: 4096,
            blocks: 900,
            bfree: 600,
            bavail: 500,
            files: 90,
            ffree: 40,
            favail: 30,
            namemax: 255,
            flags: 0b01,
        };
        statvfs_combine(&mut dst, &src);
        assert_eq!(dst.blocks, 900);
        assert_eq!(dst.bfree, 500);
        assert_eq!(dst.bavail, 400);
        assert_eq!(dst.files, 100);
        assert_eq!(dst.ffree, 40);
        assert_eq!(dst.flags, 0b01);
    }

    #[test]
    fn statvfs_scale_multiplies_space() {
        let mut s = Statvfs {
            blocks: 10,
            bfree: 5,
            bavail: 4,
            ..Default::default()
        };
        statvfs_scale(&mut s, 4);
        assert_eq!((s.blocks, s.bfree, s.bavail), (40, 20, 16));
    }

    #[test]
    fn needs_heal_detects_missing_answers() {
        let up = BrickMask::all(6);
        assert!(!needs_heal(up, BrickMask::EMPTY, BrickMask::all(6)));
        assert!(needs_heal(up, BrickMask::EMPTY, BrickMask(0b111101)));
        // A brick that never received the fop does not trigger healing.
        assert!(!needs_heal(up, BrickMask(0b000010), BrickMask(0b111101)));
    }
}
