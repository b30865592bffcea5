//! End-to-end volume behaviour over in-memory bricks: striped writes and
//! reads, degraded operation, partial updates, directory operations and
//! quorum refusal.

use std::sync::Arc;

use disperse_core::config::VolumeOptions;
use disperse_core::ondisk;
use disperse_core::types::{Gfid, Loc};
use disperse_simbrick::SimBrick;
use disperse_core::Disperse;

fn volume(nodes: u8, redundancy: u8, eager: bool) -> (Disperse, Vec<Arc<SimBrick>>) {
    let bricks = SimBrick::cluster(usize::from(nodes));
    let mut opts = VolumeOptions::new(nodes, redundancy);
    opts.eager_lock = eager;
    opts.delayed_unlock_msec = 100;
    let vol = Disperse::new("ec-test", opts, SimBrick::as_bricks(&bricks)).unwrap();
    (vol, bricks)
}

fn kill(vol: &Disperse, bricks: &[Arc<SimBrick>], idx: usize) {
    bricks[idx].set_up(false);
    vol.set_brick_up(idx, false);
}

fn revive(vol: &Disperse, bricks: &[Arc<SimBrick>], idx: usize) {
    bricks[idx].set_up(true);
    vol.set_brick_up(idx, true);
}

fn pattern(len: usize, mut seed: u64) -> Vec<u8> {
    let mut out = vec![0u8; len];
    for b in out.iter_mut() {
        seed ^= seed << 13;
        seed ^= seed >> 7;
        seed ^= seed << 17;
        *b = seed as u8;
    }
    out
}

fn data_version(brick: &SimBrick, gfid: Gfid) -> u64 {
    let raw = brick
        .xattr_bin(gfid, ondisk::XATTR_VERSION)
        .expect("version xattr present");
    ondisk::decode_u64_pair(&raw).unwrap()[0]
}

// S1: a full-stripe write lands one fragment per brick and survives the
// loss of any M bricks.
#[test]
fn full_stripe_write_and_degraded_read() {
    let (vol, bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "s1", 0o644, 0).unwrap();
    let gfid = fd.gfid();

    let data = pattern(16384, 1);
    let reply = vol.writev(&fd, &data, 0).unwrap();
    assert_eq!(reply.written, 16384);
    assert_eq!(reply.post.size, 16384);

    for brick in &bricks {
        let frag = brick.fragment_data(gfid).unwrap();
        assert_eq!(frag.len(), 4096, "each brick holds one 4 KiB fragment");
    }
    // The committed write bumped the data version once everywhere.
    for brick in &bricks {
        assert_eq!(data_version(brick, gfid), 1);
    }

    kill(&vol, &bricks, 1);
    kill(&vol, &bricks, 3);
    let read = vol.readv(&fd, 16384, 0).unwrap();
    assert_eq!(read.data, data);
    assert_eq!(read.iatt.size, 16384);
}

// S2: an unaligned write reconstructs its stripe, pads the tail with
// zeros and reports only the caller's bytes.
#[test]
fn partial_write_reconstructs_stripe() {
    let (vol, bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "s2", 0o644, 0).unwrap();
    let gfid = fd.gfid();

    let payload = pattern(100, 2);
    let reply = vol.writev(&fd, &payload, 50).unwrap();
    assert_eq!(reply.written, 100, "op_ret is the caller-visible byte count");
    assert_eq!(reply.post.size, 150);

    // Every brick stores a whole fragment of the single stripe.
    for brick in &bricks {
        assert_eq!(brick.fragment_data(gfid).unwrap().len(), 4096);
    }
    // The head reconstruction was served by internal reads only.
    let internal: u64 = bricks.iter().map(|b| b.read_counts().1).sum();
    let external: u64 = bricks.iter().map(|b| b.read_counts().0).sum();
    assert_eq!(internal, 4, "one internal fragment read per data brick");
    assert_eq!(external, 0);

    let read = vol.readv(&fd, 150, 0).unwrap();
    let mut expect = vec![0u8; 150];
    expect[50..].copy_from_slice(&payload);
    assert_eq!(read.data, expect);
}

#[test]
fn sequential_writes_count_versions_exactly() {
    let (vol, bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "counted", 0o644, 0).unwrap();
    let gfid = fd.gfid();

    let stripe = vol.stripe_size() as usize;
    for i in 0..5u64 {
        vol.writev(&fd, &pattern(stripe, i + 10), i * stripe as u64).unwrap();
    }
    for brick in &bricks {
        assert_eq!(data_version(brick, gfid), 5);
        let dirty = brick.xattr_bin(gfid, ondisk::XATTR_DIRTY).unwrap();
        assert_eq!(ondisk::decode_u64_pair(&dirty).unwrap(), [0, 0]);
    }
    let size = brick_size_xattr(&bricks[0], gfid);
    assert_eq!(size, 5 * stripe as u64);
}

fn brick_size_xattr(brick: &SimBrick, gfid: Gfid) -> u64 {
    let raw = brick.xattr_bin(gfid, ondisk::XATTR_SIZE).unwrap();
    ondisk::decode_u64(&raw).unwrap()
}

#[test]
fn cross_stripe_unaligned_overwrite() {
    let (vol, _bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "cross", 0o644, 0).unwrap();

    let stripe = vol.stripe_size() as usize;
    let base = pattern(3 * stripe, 3);
    vol.writev(&fd, &base, 0).unwrap();

    // Overwrite a range spanning two stripe boundaries, misaligned on
    // both ends.
    let overlay = pattern(stripe + 1000, 4);
    let offset = stripe as u64 / 2;
    vol.writev(&fd, &overlay, offset).unwrap();

    let mut expect = base.clone();
    expect[offset as usize..offset as usize + overlay.len()].copy_from_slice(&overlay);
    let read = vol.readv(&fd, 3 * stripe as u64, 0).unwrap();
    assert_eq!(read.data, expect);
}

#[test]
fn write_beyond_eof_pads_with_zeros() {
    let (vol, _bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "sparse", 0o644, 0).unwrap();

    let payload = pattern(64, 5);
    let offset = vol.stripe_size() * 2 + 100;
    vol.writev(&fd, &payload, offset).unwrap();

    let read = vol.readv(&fd, offset + 64, 0).unwrap();
    assert_eq!(read.data.len() as u64, offset + 64);
    assert!(read.data[..offset as usize].iter().all(|&b| b == 0));
    assert_eq!(&read.data[offset as usize..], payload.as_slice());
}

#[test]
fn truncate_shrink_zero_fills_stripe_tail() {
    let (vol, bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "trunc", 0o644, 0).unwrap();
    let gfid = fd.gfid();

    let stripe = vol.stripe_size() as usize;
    let data = pattern(2 * stripe, 6);
    vol.writev(&fd, &data, 0).unwrap();

    let cut = stripe as u64 + 100;
    let reply = vol.ftruncate(&fd, cut).unwrap();
    assert_eq!(reply.post.size, cut);

    // Bricks keep whole fragments of the stripe-aligned length.
    for brick in &bricks {
        assert_eq!(brick.fragment_data(gfid).unwrap().len(), 2 * 4096);
    }

    let read = vol.readv(&fd, 2 * stripe as u64, 0).unwrap();
    assert_eq!(read.data.len() as u64, cut);
    assert_eq!(&read.data[..], &data[..cut as usize]);

    // Reading the zero-filled region of the last stripe decodes zeros.
    let grown = vol.readv(&fd, 50, cut - 10);
    assert_eq!(grown.unwrap().data, data[cut as usize - 10..cut as usize].to_vec());
}

#[test]
fn lookup_reports_logical_size_and_strips_internal_xattrs() {
    let (vol, _bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "meta", 0o644, 0).unwrap();
    vol.writev(&fd, &pattern(100, 7), 0).unwrap();

    let loc = Loc::entry(Gfid::ROOT, "meta");
    let reply = vol.lookup(&loc).unwrap();
    assert_eq!(reply.iatt.size, 100, "size comes from the size xattr, not fragments");
    assert!(!reply.xdata.contains(ondisk::XATTR_VERSION));
    assert!(!reply.xdata.contains(ondisk::XATTR_SIZE));

    let stat = vol.stat(&loc_with_gfid(&vol, &loc)).unwrap();
    assert_eq!(stat.iatt.size, 100);
}

fn loc_with_gfid(vol: &Disperse, loc: &Loc) -> Loc {
    let gfid = vol.lookup(loc).unwrap().iatt.gfid;
    Loc::from_gfid(gfid)
}

#[test]
fn quorum_refusal_below_k() {
    let (vol, bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "quorum", 0o644, 0).unwrap();

    kill(&vol, &bricks, 0);
    kill(&vol, &bricks, 1);
    // Two down out of six is still fine.
    vol.writev(&fd, &pattern(100, 8), 0).unwrap();

    kill(&vol, &bricks, 2);
    let err = vol.writev(&fd, &pattern(100, 9), 0).unwrap_err();
    assert_eq!(err.errno(), libc::ENOTCONN);

    revive(&vol, &bricks, 2);
    vol.writev(&fd, &pattern(100, 10), 0).unwrap();
}

#[test]
fn directory_operations_roundtrip() {
    let (vol, bricks) = volume(6, 2, false);

    let dir = vol.mkdir(Gfid::ROOT, "sub", 0o755).unwrap();
    let dir_gfid = dir.iatt.gfid;

    let (fd, created) = vol.create(dir_gfid, "a", 0o644, 0).unwrap();
    vol.writev(&fd, &pattern(10, 11), 0).unwrap();
    assert_eq!(created.iatt.gfid, fd.gfid());

    vol.symlink("a", dir_gfid, "lnk").unwrap();
    let target = vol
        .readlink(&Loc::entry(dir_gfid, "lnk"))
        .unwrap();
    assert_eq!(target.target, "a");

    let hard = vol
        .link(
            &Loc::entry_with_gfid(dir_gfid, "a", fd.gfid()),
            &Loc::entry(dir_gfid, "b"),
        )
        .unwrap();
    assert_eq!(hard.iatt.gfid, fd.gfid());
    assert_eq!(hard.iatt.size, 10, "link reply carries the discovered size");

    let dfd = vol.opendir(&Loc::from_gfid(dir_gfid)).unwrap();
    let listing = vol.readdir(&dfd, 4096, 0).unwrap();
    let names: Vec<&str> = listing.entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "lnk"]);

    vol.rename(
        &Loc::entry_with_gfid(dir_gfid, "b", fd.gfid()),
        &Loc::entry(dir_gfid, "c"),
    )
    .unwrap();
    assert!(bricks[0].entry_gfid(dir_gfid, "c").is_some());
    assert!(bricks[0].entry_gfid(dir_gfid, "b").is_none());

    vol.unlink(&Loc::entry_with_gfid(dir_gfid, "c", fd.gfid())).unwrap();
    vol.unlink(&Loc::entry(dir_gfid, "lnk")).unwrap();
    vol.unlink(&Loc::entry_with_gfid(dir_gfid, "a", fd.gfid())).unwrap();
    vol.rmdir(&Loc::entry_with_gfid(Gfid::ROOT, "sub", dir_gfid), 0)
        .unwrap();
    assert!(!bricks[0].has_inode(dir_gfid));
}

#[test]
fn readdir_retries_away_from_sick_bricks() {
    let (vol, bricks) = volume(6, 2, false);
    for i in 0..4 {
        vol.create(Gfid::ROOT, &format!("f{i}"), 0o644, 0).unwrap();
    }
    let dfd = vol.opendir(&Loc::from_gfid(Gfid::ROOT)).unwrap();

    // Two bricks keep answering locks but fail reads with EIO,
    // exercising the single-brick recoverable-error retry.
    bricks[0].inject_read_errors(100);
    bricks[1].inject_read_errors(100);

    for _ in 0..12 {
        let listing = vol.readdir(&dfd, 65536, 0).unwrap();
        assert_eq!(listing.entries.len(), 4);
    }
}

#[test]
fn stat_retries_away_from_sick_bricks() {
    let (vol, bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "stubborn", 0o644, 0).unwrap();
    vol.writev(&fd, &pattern(10, 20), 0).unwrap();

    bricks[0].inject_read_errors(100);
    bricks[1].inject_read_errors(100);

    let loc = Loc::from_gfid(fd.gfid());
    for _ in 0..12 {
        let reply = vol.stat(&loc).unwrap();
        assert_eq!(reply.iatt.size, 10);
    }
}

#[test]
fn readdir_continuation_stays_on_one_brick() {
    let (vol, _bricks) = volume(6, 2, false);
    for i in 0..10 {
        vol.create(Gfid::ROOT, &format!("e{i:02}"), 0o644, 0).unwrap();
    }
    let dfd = vol.opendir(&Loc::from_gfid(Gfid::ROOT)).unwrap();

    let mut names = Vec::new();
    let mut offset = 0;
    loop {
        // Small size forces several chunks.
        let chunk = vol.readdir(&dfd, 256, offset).unwrap();
        if chunk.entries.is_empty() {
            break;
        }
        offset = chunk.entries.last().unwrap().offset;
        names.extend(chunk.entries.into_iter().map(|e| e.name));
    }
    assert_eq!(names.len(), 10);
    let mut sorted = names.clone();
    sorted.sort();
    assert_eq!(names, sorted, "chunks come from one brick in one order");
}

#[test]
fn statfs_combines_and_getxattr_filters() {
    let (vol, _bricks) = volume(6, 2, false);
    let reply = vol.statfs(&Loc::from_gfid(Gfid::ROOT)).unwrap();
    assert!(reply.stat.blocks > 0);
    assert!(reply.stat.bfree <= reply.stat.blocks);

    let (fd, _) = vol.create(Gfid::ROOT, "xa", 0o644, 0).unwrap();
    vol.writev(&fd, b"x", 0).unwrap();
    let loc = Loc::from_gfid(fd.gfid());

    let mut xattrs = disperse_core::xdata::Xdata::new();
    xattrs.set_str("user.note", "hello");
    vol.setxattr(&loc, &xattrs, 0).unwrap();

    let all = vol.getxattr(&loc, None).unwrap();
    assert_eq!(all.xattrs.get_str("user.note"), Some("hello"));
    assert!(
        all.xattrs.keys().all(|k| !k.starts_with("trusted.ec.")),
        "internal xattrs never escape upward"
    );

    // The internal namespace is not writable from above.
    let mut bad = disperse_core::xdata::Xdata::new();
    bad.set_u64(ondisk::XATTR_SIZE, 0);
    let err = vol.setxattr(&loc, &bad, 0).unwrap_err();
    assert_eq!(err.errno(), libc::EPERM);
}

#[test]
fn o_append_writes_land_at_eof() {
    let (vol, _bricks) = volume(6, 2, false);
    let (_, reply) = vol.create(Gfid::ROOT, "appendee", 0o644, 0).unwrap();
    let gfid = reply.iatt.gfid;

    let plain = vol.open(&Loc::from_gfid(gfid), 0).unwrap();
    vol.writev(&plain, &pattern(100, 12), 0).unwrap();

    let appender = vol
        .open(&Loc::from_gfid(gfid), libc::O_APPEND as u32)
        .unwrap();
    vol.writev(&appender, b"tail", 0).unwrap();

    let read = vol.readv(&plain, 104, 0).unwrap();
    assert_eq!(read.data.len(), 104);
    assert_eq!(&read.data[100..], b"tail");
}

#[test]
fn zerofill_and_discard_preserve_decodability() {
    let (vol, _bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "holes", 0o644, 0).unwrap();

    let stripe = vol.stripe_size() as usize;
    let data = pattern(3 * stripe, 13);
    vol.writev(&fd, &data, 0).unwrap();

    // Zero an unaligned range spanning a whole middle stripe.
    let zstart = 100u64;
    let zlen = stripe as u64 + 500;
    vol.zerofill(&fd, zstart, zlen).unwrap();

    let mut expect = data.clone();
    expect[zstart as usize..(zstart + zlen) as usize].fill(0);
    let read = vol.readv(&fd, 3 * stripe as u64, 0).unwrap();
    assert_eq!(read.data, expect);

    // Punching a hole reads back as zeros too.
    let dstart = 2 * stripe as u64 + 17;
    vol.discard(&fd, dstart, 1000).unwrap();
    expect[dstart as usize..dstart as usize + 1000].fill(0);
    let read = vol.readv(&fd, 3 * stripe as u64, 0).unwrap();
    assert_eq!(read.data, expect);
}

#[test]
fn shutdown_refuses_new_fops() {
    let (vol, _bricks) = volume(6, 2, false);
    let (fd, _) = vol.create(Gfid::ROOT, "bye", 0o644, 0).unwrap();
    vol.shutdown();
    let err = vol.writev(&fd, b"x", 0).unwrap_err();
    assert_eq!(err.errno(), libc::ENOTCONN);
}
