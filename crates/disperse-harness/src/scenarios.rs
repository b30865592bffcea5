//! End-to-end scenarios over a sim-brick volume: striping, partial
//! updates, degraded reads, eager locking and self-heal.

use std::sync::Arc;
use std::time::Duration;

use disperse_core::Disperse;
use disperse_core::config::VolumeOptions;
use disperse_core::types::{Gfid, Loc};
use disperse_simbrick::SimBrick;

use crate::report::{Emitter, Record, digest};

pub struct Setup {
    pub nodes: u8,
    pub redundancy: u8,
}

fn build(setup: &Setup, name: &str, eager: bool, delayed_msec: u32) -> (Disperse, Vec<Arc<SimBrick>>) {
    let bricks = SimBrick::cluster(usize::from(setup.nodes));
    let mut opts = VolumeOptions::new(setup.nodes, setup.redundancy);
    opts.eager_lock = eager;
    opts.delayed_unlock_msec = delayed_msec;
    let vol = Disperse::new(name, opts, SimBrick::as_bricks(&bricks))
        .expect("volume assembly");
    (vol, bricks)
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

fn check(emitter: &mut Emitter, scenario: &str, step: &str, ok: bool, detail: &str) -> bool {
    if ok {
        emitter.emit(&Record::pass(scenario, step));
    } else {
        emitter.emit(&Record::fail(scenario, step, detail));
    }
    ok
}

/// Full-stripe write, fragment placement, degraded read.
pub fn striping(setup: &Setup, emitter: &mut Emitter) {
    let s = "striping";
    let (vol, bricks) = build(setup, "harness-striping", false, 100);
    let stripe = vol.stripe_size() as usize;

    let Ok((fd, _)) = vol.create(Gfid::ROOT, "file", 0o644, 0) else {
        emitter.emit(&Record::fail(s, "create", "create failed"));
        return;
    };
    let data = pattern(stripe, 0xec);
    let write = vol.writev(&fd, &data, 0);
    check(
        emitter,
        s,
        "write",
        write.as_ref().map(|w| w.written).unwrap_or(0) as usize == stripe,
        "whole-stripe write",
    );

    let frag = vol.fragment_size();
    let placed = bricks
        .iter()
        .all(|b| b.fragment_data(fd.gfid()).map(|f| f.len() as u64) == Some(frag));
    check(emitter, s, "fragment-placement", placed, "one fragment per brick");

    // Take out M bricks and read back.
    for idx in 0..usize::from(setup.redundancy) {
        bricks[idx].set_up(false);
        vol.set_brick_up(idx, false);
    }
    match vol.readv(&fd, stripe as u64, 0) {
        Ok(read) if read.data == data => {
            emitter.emit(&Record::pass(s, "degraded-read").with_digest(&digest(&read.data)));
        }
        Ok(_) => {
            emitter.emit(&Record::fail(s, "degraded-read", "content mismatch"));
        }
        Err(e) => {
            emitter.emit(&Record::fail(s, "degraded-read", &format!("errno {}", e.errno())));
        }
    }
}

/// Unaligned write: head/tail reconstruction and op_ret clamping.
pub fn partial_update(setup: &Setup, emitter: &mut Emitter) {
    let s = "partial-update";
    let (vol, _bricks) = build(setup, "harness-partial", false, 100);

    let Ok((fd, _)) = vol.create(Gfid::ROOT, "file", 0o644, 0) else {
        emitter.emit(&Record::fail(s, "create", "create failed"));
        return;
    };
    let payload = pattern(100, 0x51);
    let write = vol.writev(&fd, &payload, 50);
    check(
        emitter,
        s,
        "op-ret",
        write.map(|w| w.written) == Ok(100),
        "caller sees 100 bytes",
    );

    let read = vol.readv(&fd, 150, 0);
    let ok = match &read {
        Ok(r) => r.data.len() == 150 && r.data[..50].iter().all(|&b| b == 0) && r.data[50..] == payload[..],
        Err(_) => false,
    };
    check(emitter, s, "readback", ok, "zero head, payload body");
}

/// Eager lock reuse across sequential writes and expiry afterwards.
pub fn eager_lock(setup: &Setup, emitter: &mut Emitter) {
    let s = "eager-lock";
    let (vol, bricks) = build(setup, "harness-eager", true, 200);

    let Ok((fd, _)) = vol.create(Gfid::ROOT, "file", 0o644, 0) else {
        emitter.emit(&Record::fail(s, "create", "create failed"));
        return;
    };
    let gfid = fd.gfid();

    vol.writev(&fd, &pattern(512, 1), 0).ok();
    let held = bricks[0].lock_count("harness-eager", gfid) == 1;
    check(emitter, s, "delayed-release", held, "lock held after fop");

    let grabs = bricks[0].lock_grabs();
    vol.writev(&fd, &pattern(512, 2), 512).ok();
    check(
        emitter,
        s,
        "reuse",
        bricks[0].lock_grabs() == grabs,
        "no second acquisition",
    );

    std::thread::sleep(Duration::from_millis(600));
    check(
        emitter,
        s,
        "expiry",
        bricks[0].lock_count("harness-eager", gfid) == 0,
        "lock released by the timer",
    );
}

/// Brick outage during writes, then self-heal and degraded verification.
pub fn heal(setup: &Setup, emitter: &mut Emitter) {
    let s = "heal";
    let (vol, bricks) = build(setup, "harness-heal", false, 100);
    let stripe = vol.stripe_size() as usize;

    let Ok((fd, _)) = vol.create(Gfid::ROOT, "victim", 0o644, 0) else {
        emitter.emit(&Record::fail(s, "create", "create failed"));
        return;
    };
    let gfid = fd.gfid();
    let loc = Loc::from_gfid(gfid);

    let mut content = pattern(3 * stripe, 0x05);
    vol.writev(&fd, &content, 0).ok();

    bricks[2].set_up(false);
    vol.set_brick_up(2, false);
    let change = pattern(stripe, 0x06);
    vol.writev(&fd, &change, 0).ok();
    content[..stripe].copy_from_slice(&change);
    bricks[2].set_up(true);
    vol.set_brick_up(2, true);

    check(
        emitter,
        s,
        "detect",
        vol.get_heal_info(&loc).as_deref() == Ok("heal"),
        "divergence detected",
    );

    let outcome = vol.heal(&loc, false);
    check(
        emitter,
        s,
        "rebuild",
        outcome.map(|o| o.bad.contains(2)) == Ok(true),
        "brick 2 rebuilt",
    );

    check(
        emitter,
        s,
        "settled",
        vol.get_heal_info(&loc).as_deref() == Ok("no-heal"),
        "second inspection clean",
    );

    bricks[0].set_up(false);
    vol.set_brick_up(0, false);
    bricks[1].set_up(false);
    vol.set_brick_up(1, false);
    match vol.readv(&fd, 3 * stripe as u64, 0) {
        Ok(read) if read.data == content => {
            emitter.emit(&Record::pass(s, "healed-read").with_digest(&digest(&read.data)));
        }
        _ => emitter.emit(&Record::fail(s, "healed-read", "content mismatch through healed brick")),
    }
}

/// Entry-name healing after a partial create.
pub fn name_heal(setup: &Setup, emitter: &mut Emitter) {
    let s = "name-heal";
    let (vol, bricks) = build(setup, "harness-names", false, 100);
    let last = bricks.len() - 1;

    bricks[last].set_up(false);
    vol.set_brick_up(last, false);
    let Ok((fd, _)) = vol.create(Gfid::ROOT, "x", 0o644, 0) else {
        emitter.emit(&Record::fail(s, "create", "create failed"));
        return;
    };
    bricks[last].set_up(true);
    vol.set_brick_up(last, true);

    let root = Loc::from_gfid(Gfid::ROOT);
    vol.heal(&root, false).ok();
    check(
        emitter,
        s,
        "recreated",
        bricks[last].entry_gfid(Gfid::ROOT, "x") == Some(fd.gfid()),
        "name linked to the original gfid",
    );
    check(
        emitter,
        s,
        "settled",
        vol.get_heal_info(&root).as_deref() == Ok("no-heal"),
        "directory clean after heal",
    );
}

/// Run every scenario.
pub fn run_all(setup: &Setup, emitter: &mut Emitter) {
    striping(setup, emitter);
    partial_update(setup, emitter);
    eager_lock(setup, emitter);
    heal(setup, emitter);
    name_heal(setup, emitter);
}
