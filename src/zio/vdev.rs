//! The device stages.
//!
//! Blocks with a single location go straight to the device. Blocks with several copies fan out
//! into one child per copy; writes succeed if any copy made it, reads take the first copy which
//! verifies, and repair the others from it.

use std::sync::Arc;

use parking_lot::Mutex;

use disk::{Completion, DeviceIo, Direction};
use fault::FaultKind;
use zio::arena::{Milestone, Node};
use zio::request::{Flags, Io, IoType, Ioctl, Target};
use zio::stage::{Flow, Stage, StageSet};
use zio::checksum;
use zio::transform::Unwind;
use zio::{wait_for_children, Create, Shared};
use {Error, Kind};

/// The outcome of the I/O on a single copy.
#[derive(Debug, Clone)]
struct CopyResult {
    error: Option<Error>,
    /// The data read.
    data: Option<Vec<u8>>,
    retries: u32,
}

/// The state of a mirrored request.
pub struct MirrorNode {
    /// The per-copy outcomes, by location.
    copies: Arc<Mutex<Vec<Option<CopyResult>>>>,
    /// Have the copies been evaluated?
    evaluated: bool,
}

/// Round `x` up to a multiple of `to`.
fn round_up(x: usize, to: usize) -> usize {
    (x + to - 1) / to * to
}

/// Issue the device operation.
pub fn io_start(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    if io.io_type == IoType::Ioctl {
        return ioctl_start(shared, node, io);
    }

    let target = match io.target {
        Some(target) => target,
        None => match io.bp.locations.len() {
            0 => {
                io.fail(err!(Implementation, "device I/O on a hole"));
                return Flow::Continue;
            },
            1 => {
                let target = Target::of(&io.bp.locations[0]);
                io.target = Some(target);
                target
            },
            _ => return mirror_start(shared, node, io),
        },
    };

    let device = match shared.device(target.vdev) {
        Some(device) => device,
        None => {
            io.fail(err!(Unavailable, "no device {}", target.vdev));
            return Flow::Continue;
        },
    };

    let direction = match io.io_type {
        IoType::Read => Direction::Read,
        _ => Direction::Write,
    };
    let sector = 1usize << device.ashift();
    let size = io.stack.size();
    let skip = (target.offset % sector as u64) as usize;

    if skip != 0 || size % sector != 0 {
        if direction == Direction::Write && skip != 0 {
            io.fail(err!(Implementation, "write to unaligned offset {:x} of device {}",
                         target.offset, target.vdev));
            return Flow::Continue;
        }

        // Widen to whole sectors; reads pick their part out afterwards.
        let len = round_up(skip + size, sector);
        if direction == Direction::Write && len as u64 > target.asize {
            io.fail(err!(Implementation, "padded write of {} bytes exceeds the {} bytes allocated \
                                          at {:x} of device {}", len, target.asize,
                         target.offset, target.vdev));
            return Flow::Continue;
        }
        let mut buf = vec![0; len];
        if direction == Direction::Write {
            buf[..size].copy_from_slice(io.stack.data());
        }
        io.stack.push(buf, len, Unwind::Subblock { skip: skip });
        io.padded = true;
    }

    let offset = target.offset - skip as u64;
    let buf = io.stack.lend();
    trace!(io.log, "issuing device operation"; "vdev" => target.vdev, "offset" => offset,
           "len" => buf.len(), "direction" => ?direction, "retry" => io.retries);

    device.submit(DeviceIo {
        direction: direction,
        offset: offset,
        buf: buf,
        priority: io.priority,
    }, Completion::new(node.handle, shared.urgent.clone()));

    Flow::Stop
}

/// Issue a device control operation.
fn ioctl_start(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    let (ioctl, vdev) = match io.ioctl {
        Some(ioctl) => ioctl,
        None => unreachable!(),
    };

    let vdev = match vdev {
        Some(vdev) => vdev,
        None => {
            // Every device.
            let devices = shared.config.read().devices.len() as u32;
            for vdev in 0..devices {
                let mut c = Create::new(IoType::Ioctl, io.bp.clone(), StageSet::IOCTL);
                c.ioctl = Some((ioctl, Some(vdev)));
                shared.spawn(node, c);
            }
            return Flow::Continue;
        },
    };

    let device = match shared.device(vdev) {
        Some(device) => device,
        None => {
            io.fail(err!(Unavailable, "no device {}", vdev));
            return Flow::Continue;
        },
    };
    io.target = Some(Target {
        vdev: vdev,
        offset: 0,
        asize: 0,
    });

    let direction = match ioctl {
        Ioctl::Flush => Direction::Flush,
    };
    trace!(io.log, "issuing device control"; "vdev" => vdev, "ioctl" => ?ioctl);
    device.submit(DeviceIo {
        direction: direction,
        offset: 0,
        buf: Vec::new(),
        priority: io.priority,
    }, Completion::new(node.handle, shared.urgent.clone()));

    Flow::Stop
}

/// Fan out over the copies of the block.
fn mirror_start(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    let locations = io.bp.locations.clone();
    let copies = Arc::new(Mutex::new(vec![None; locations.len()]));
    io.mirror = Some(MirrorNode {
        copies: copies.clone(),
        evaluated: false,
    });

    for (n, loc) in locations.iter().enumerate() {
        let data = match io.io_type {
            IoType::Read => vec![0; io.stack.size()],
            _ => io.stack.data().to_vec(),
        };
        let copies = copies.clone();

        let mut c = Create::new(io.io_type, io.bp.clone(), StageSet::VDEV_CHILD)
            .data(data)
            .txg(io.txg)
            .flags(Flags::PHYSICAL | Flags::DONT_PROPAGATE)
            .on_done(move |outcome| {
                copies.lock()[n] = Some(CopyResult {
                    error: outcome.error.clone(),
                    data: outcome.data.clone(),
                    retries: outcome.retries,
                });
            });
        c.target = Some(Target::of(loc));
        shared.spawn(node, c);
    }

    Flow::Continue
}

/// Collect the device operation.
pub fn io_done(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    if io.mirror.is_some() {
        return mirror_done(shared, node, io);
    }
    if io.io_type == IoType::Ioctl && io.target.is_none() {
        if wait_for_children(node, io, Milestone::Done) {
            return Flow::Stop;
        }
        return Flow::Continue;
    }

    // Nothing was issued if the request failed before reaching the device.
    let (buf, status) = match io.device_result.take() {
        Some(result) => result,
        None => return Flow::Continue,
    };

    if io.io_type != IoType::Ioctl {
        io.stack.restore(buf);
    }
    if let Err(err) = status {
        let target = io.target;
        debug!(io.log, "device operation failed"; "target" => ?target, "error" => %err);
        io.fail(err.into());
    }

    if io.padded {
        io.padded = false;
        if io.io_type == IoType::Read && io.error.is_none() {
            if let Err(err) = io.stack.pop_apply() {
                io.fail(err);
            }
        } else {
            io.stack.pop();
        }
    }

    Flow::Continue
}

/// Evaluate the copies of a mirrored request.
fn mirror_done(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    if wait_for_children(node, io, Milestone::Done) {
        return Flow::Stop;
    }

    let copies = match io.mirror {
        Some(ref mut mirror) if !mirror.evaluated => {
            mirror.evaluated = true;
            mirror.copies.lock().split_off(0)
        },
        _ => return Flow::Continue,
    };

    io.retries += copies.iter().filter_map(|copy| copy.as_ref()).map(|copy| copy.retries).sum::<u32>();

    if io.io_type != IoType::Read {
        // Writes succeed if any copy made it.
        let mut worst = None;
        for copy in &copies {
            match *copy {
                Some(CopyResult { error: None, .. }) => return Flow::Continue,
                Some(CopyResult { error: Some(ref err), .. }) => worst = fold(worst, err.clone()),
                None => worst = fold(worst, err!(Implementation, "copy completed without outcome")),
            }
        }
        if let Some(err) = worst {
            io.fail(err);
        }
        return Flow::Continue;
    }

    let mut good = None;
    let mut bad = Vec::new();
    let mut worst = None;
    for (n, copy) in copies.iter().enumerate() {
        let target = io.bp.locations.get(n).map(Target::of);
        match *copy {
            Some(CopyResult { error: None, data: Some(ref data), .. }) => {
                match checksum::check(io, data) {
                    Ok(()) => good = good.or(Some(n)),
                    Err(err) => {
                        debug!(io.log, "bad copy"; "copy" => n, "error" => %err);
                        shared.report(node.handle, io, FaultKind::Checksum, target, &err);
                        worst = fold(worst, err);
                        bad.push(n);
                    },
                }
            },
            Some(CopyResult { ref error, .. }) => {
                worst = fold(worst, error.clone().unwrap_or_else(|| {
                    err!(Implementation, "copy {} read without data", n)
                }));
                bad.push(n);
            },
            None => {
                worst = fold(worst, err!(Implementation, "copy {} completed without outcome", n));
                bad.push(n);
            },
        }
    }

    let good = match good {
        Some(good) => good,
        None => {
            io.fail(worst.unwrap_or_else(|| err!(Implementation, "mirror without copies")));
            return Flow::Continue;
        },
    };

    let data = match copies[good] {
        Some(CopyResult { data: Some(ref data), .. }) => data.clone(),
        _ => unreachable!(),
    };
    io.stack.data_mut().copy_from_slice(&data);
    io.flags |= Flags::VERIFIED;

    if !io.flags.contains(Flags::SPECULATIVE) {
        for n in bad {
            info!(io.log, "repairing copy"; "copy" => n, "from" => good);
            let mut c = Create::new(IoType::Write, io.bp.clone(), StageSet::VDEV_CHILD)
                .data(data.clone())
                .txg(io.txg)
                .flags(Flags::PHYSICAL | Flags::SELF_HEAL | Flags::CANFAIL | Flags::DONT_PROPAGATE);
            c.target = Some(Target::of(&io.bp.locations[n]));
            shared.spawn(node, c);
        }
    }

    Flow::Continue
}

/// Fold an error into the worst one seen so far.
fn fold(worst: Option<Error>, err: Error) -> Option<Error> {
    Some(match worst {
        Some(worst) => worst.worse(err),
        None => err,
    })
}

/// Decide upon retrying the device operation.
pub fn io_assess(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    let target = match io.target {
        Some(target) if io.mirror.is_none() => target,
        _ => return Flow::Continue,
    };
    let kind = match io.error {
        Some(ref err) => err.kind,
        None => return Flow::Continue,
    };

    if kind.is_retryable() && !io.flags.contains(Flags::DONT_RETRY)
        && io.retries < shared.options.retry_limit() {
        debug!(io.log, "retrying device operation"; "vdev" => target.vdev, "retry" => io.retries + 1);
        io.error = None;
        io.retries += 1;
        io.flags |= Flags::IO_RETRY;
        // Continue right before the device stage.
        io.stage = Stage::Ready;
        return Flow::Continue;
    }

    if kind == Kind::Io || kind == Kind::Unavailable {
        if let Some(ref err) = io.error {
            shared.report(node.handle, io, FaultKind::Io, Some(target), err);
        }
        if !io.flags.contains(Flags::SPECULATIVE) {
            shared.probe(target.vdev);
        }
    }

    Flow::Continue
}
