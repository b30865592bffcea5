//! Self-heal behaviour: divergence detection, content rebuild after a
//! brick outage, name healing, and the background queue bounds.

use std::sync::Arc;

use disperse_core::Disperse;
use disperse_core::brick::Brick;
use disperse_core::config::VolumeOptions;
use disperse_core::ondisk;
use disperse_core::types::{Gfid, Loc};
use disperse_simbrick::SimBrick;

fn volume(nodes: u8, redundancy: u8) -> (Disperse, Vec<Arc<SimBrick>>) {
    let bricks = SimBrick::cluster(usize::from(nodes));
    let mut opts = VolumeOptions::new(nodes, redundancy);
    opts.eager_lock = false;
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

// S5: writes with one brick down diverge it; healing rebuilds its
// fragments and settles versions so a degraded read through the healed
// brick returns correct content.
#[test]
fn data_heal_after_brick_outage() {
    let (vol, bricks) = volume(6, 2);
    let (fd, _) = vol.create(Gfid::ROOT, "victim", 0o644, 0).unwrap();
    let gfid = fd.gfid();
    let loc = Loc::from_gfid(gfid);
    let stripe = vol.stripe_size() as usize;

    let mut content = pattern(3 * stripe, 50);
    vol.writev(&fd, &content, 0).unwrap();

    kill(&vol, &bricks, 2);
    let change0 = pattern(stripe, 51);
    let change1 = pattern(stripe, 52);
    vol.writev(&fd, &change0, 0).unwrap();
    vol.writev(&fd, &change1, stripe as u64).unwrap();
    content[..stripe].copy_from_slice(&change0);
    content[stripe..2 * stripe].copy_from_slice(&change1);
    revive(&vol, &bricks, 2);

    assert_eq!(vol.get_heal_info(&loc).unwrap(), "heal");

    let outcome = vol.heal(&loc, false).unwrap();
    assert!(!outcome.healthy);
    assert!(outcome.bad.contains(2), "brick 2 was rebuilt: {:?}", outcome);
    assert!(outcome.good.count() >= 4);

    // Versions and dirty counters have converged.
    let reference = bricks[0].xattr_bin(gfid, ondisk::XATTR_VERSION).unwrap();
    for brick in &bricks {
        assert_eq!(
            brick.xattr_bin(gfid, ondisk::XATTR_VERSION).unwrap(),
            reference
        );
        let dirty = brick.xattr_bin(gfid, ondisk::XATTR_DIRTY).unwrap();
        assert_eq!(ondisk::decode_u64_pair(&dirty).unwrap(), [0, 0]);
    }

    assert_eq!(vol.get_heal_info(&loc).unwrap(), "no-heal");

    // Read through a brick set that includes the healed brick.
    kill(&vol, &bricks, 0);
    kill(&vol, &bricks, 1);
    let read = vol.readv(&fd, 3 * stripe as u64, 0).unwrap();
    assert_eq!(read.data, content);
}

// S6: a name present on only part of the bricks is recreated with its
// gfid on the rest; a second heal finds nothing to do.
#[test]
fn name_heal_recreates_missing_entries() {
    let (vol, bricks) = volume(6, 2);

    kill(&vol, &bricks, 4);
    kill(&vol, &bricks, 5);
    let (fd, _) = vol.create(Gfid::ROOT, "x", 0o644, 0).unwrap();
    let gfid = fd.gfid();
    revive(&vol, &bricks, 4);
    revive(&vol, &bricks, 5);

    assert!(bricks[4].entry_gfid(Gfid::ROOT, "x").is_none());

    let root = Loc::from_gfid(Gfid::ROOT);
    assert_eq!(vol.get_heal_info(&root).unwrap(), "heal");
    let outcome = vol.heal(&root, false).unwrap();
    assert!(!outcome.healthy);

    assert_eq!(bricks[4].entry_gfid(Gfid::ROOT, "x"), Some(gfid));
    assert_eq!(bricks[5].entry_gfid(Gfid::ROOT, "x"), Some(gfid));

    assert_eq!(vol.get_heal_info(&root).unwrap(), "no-heal");
}

#[test]
fn partial_heal_skips_entry_descent() {
    let (vol, bricks) = volume(6, 2);

    kill(&vol, &bricks, 5);
    vol.create(Gfid::ROOT, "only-names", 0o644, 0).unwrap();
    revive(&vol, &bricks, 5);

    // A partial heal fixes directory versions without walking entries,
    // so the missing name stays missing.
    let root = Loc::from_gfid(Gfid::ROOT);
    let outcome = vol.heal(&root, true).unwrap();
    assert!(!outcome.healthy);
    assert!(bricks[5].entry_gfid(Gfid::ROOT, "only-names").is_none());

    // A full heal completes the job.
    vol.heal(&root, false).unwrap();
    assert!(bricks[5].entry_gfid(Gfid::ROOT, "only-names").is_some());
}

#[test]
fn stale_name_with_lost_file_is_removed() {
    let (vol, bricks) = volume(6, 2);

    // The entry (and its inode) survives on too few bricks to recover.
    let (fd, _) = vol.create(Gfid::ROOT, "doomed", 0o644, 0).unwrap();
    let gfid = fd.gfid();
    let entry = Loc::entry_with_gfid(Gfid::ROOT, "doomed", gfid);
    for idx in 2..6 {
        // Wipe the file from four bricks behind the volume's back.
        bricks[idx]
            .unlink(&entry, 0, &disperse_core::xdata::Xdata::new())
            .unwrap();
    }

    // Healing the entry notices the unrecoverable file and deletes the
    // stale name; the follow-up stages have nothing left to work on.
    let _ = vol.heal(&entry, false);

    for brick in &bricks {
        assert!(
            brick.entry_gfid(Gfid::ROOT, "doomed").is_none(),
            "unrecoverable name removed everywhere"
        );
    }
}

#[test]
fn metadata_heal_copies_mode_and_xattrs() {
    let (vol, bricks) = volume(6, 2);
    let (fd, _) = vol.create(Gfid::ROOT, "attrs", 0o644, 0).unwrap();
    let gfid = fd.gfid();
    vol.writev(&fd, b"payload", 0).unwrap();

    let loc = Loc::from_gfid(gfid);
    let mut note = disperse_core::xdata::Xdata::new();
    note.set_str("user.tag", "healed");
    vol.setxattr(&loc, &note, 0).unwrap();

    // Corrupt one brick's metadata behind the volume's back, the way a
    // half-applied setattr would: attributes changed, version bumped.
    let fdh = disperse_core::types::FdHandle { gfid, flags: 0 };
    let attr = disperse_core::types::SetAttr {
        mode: 0o600,
        uid: 42,
        gid: 42,
        ..Default::default()
    };
    bricks[3]
        .fsetattr(
            &fdh,
            &attr,
            disperse_core::types::setattr_valid::MODE | disperse_core::types::setattr_valid::UID,
            &disperse_core::xdata::Xdata::new(),
        )
        .unwrap();
    let mut bump = disperse_core::xdata::Xdata::new();
    bump.set_bin(
        ondisk::XATTR_VERSION,
        ondisk::encode_u64_pair([0, 1]).to_vec(),
    );
    bricks[3]
        .fxattrop(
            &fdh,
            disperse_core::brick::XattropOp::AddArray64,
            &bump,
            &disperse_core::xdata::Xdata::new(),
        )
        .unwrap();

    vol.heal(&loc, false).unwrap();

    let healed = bricks[3]
        .lookup(&loc, &disperse_core::xdata::Xdata::new())
        .unwrap();
    assert_eq!(healed.iatt.mode, 0o644);
    assert_eq!(healed.iatt.uid, 0);
}

// Divergent answers schedule background heals through the bounded
// queue; the queue drains and the file ends up healed.
#[test]
fn divergence_triggers_background_heal() {
    let bricks = SimBrick::cluster(6);
    let mut opts = VolumeOptions::new(6, 2);
    opts.eager_lock = false;
    opts.background_heals = 2;
    opts.heal_wait_qlen = 4;
    let vol = Disperse::new("ec-test", opts, SimBrick::as_bricks(&bricks)).unwrap();

    let (fd, _) = vol.create(Gfid::ROOT, "busy", 0o644, 0).unwrap();
    let gfid = fd.gfid();
    let stripe = vol.stripe_size() as usize;
    vol.writev(&fd, &pattern(stripe, 60), 0).unwrap();

    bricks[2].set_up(false);
    vol.set_brick_up(2, false);
    vol.writev(&fd, &pattern(stripe, 61), 0).unwrap();
    bricks[2].set_up(true);
    vol.set_brick_up(2, true);

    // Each divergent lookup queues a background heal.
    let loc = Loc::from_gfid(gfid);
    for _ in 0..8 {
        let _ = vol.lookup(&loc);
    }

    // The queue drains and the divergence is gone.
    let mut settled = false;
    for _ in 0..50 {
        std::thread::sleep(std::time::Duration::from_millis(100));
        if vol.heal_load() == (0, 0) && vol.get_heal_info(&loc).unwrap() == "no-heal" {
            settled = true;
            break;
        }
    }
    assert!(settled, "background heals drained and healed the file");
}
