//! The space stages: allocation, free and claim.

use std::sync::Arc;

use blkptr::BlockPointer;
use zio::gang::{self, GangTree};
use zio::request::Io;
use zio::stage::{Flow, StageSet};
use zio::Shared;
use Kind;

/// Allocate the locations of a new block.
///
/// If no contiguous extent is left, the block is turned into a gang block instead.
pub fn allocate(shared: &Arc<Shared>, io: &mut Io) -> Flow {
    let psize = io.stack.size();
    let forced = shared.options.force_gang_threshold.map_or(false, |threshold| psize >= threshold);

    let res = if forced {
        Err(err!(OutOfSpace, "gang blocks forced for blocks of {} bytes", psize))
    } else {
        shared.allocator.allocate(psize, io.props.copies, io.txg)
    };

    match res {
        Ok(locations) => {
            trace!(io.log, "allocated"; "psize" => psize, "copies" => locations.len());
            io.bp.locations = locations;
            io.allocated = true;
        },
        Err(ref err) if err.kind == Kind::OutOfSpace && psize > shared.options.min_extent => {
            debug!(io.log, "splitting block into gang members"; "psize" => psize, "cause" => %err);
            io.pipeline = (io.pipeline & !StageSet::VDEV_IO) | StageSet::GANG_ISSUE
                | StageSet::GANG_HEADER;
        },
        Err(err) => io.fail(err),
    }

    Flow::Continue
}

/// Free the locations of the block (the header, for gang blocks).
pub fn free(shared: &Arc<Shared>, io: &mut Io) -> Flow {
    if let Err(err) = shared.allocator.free(&io.bp, io.txg) {
        io.fail(err);
    }
    if let Some(err) = gang::take_failed_members(io) {
        io.fail(err);
    }

    Flow::Continue
}

/// Claim the locations of the block (the header, for gang blocks).
pub fn claim(shared: &Arc<Shared>, io: &mut Io) -> Flow {
    if let Err(err) = shared.allocator.claim(&io.bp, io.txg) {
        io.fail(err);
    }

    Flow::Continue
}

/// Give back the space of a block and every gang member below it.
fn unallocate(shared: &Shared, io: &Io, bp: &BlockPointer, tree: Option<&GangTree>) {
    if let Some(tree) = tree {
        for &(ref member, ref subtree) in &tree.members {
            unallocate(shared, io, member, subtree.as_ref());
        }
    }

    if !bp.is_hole() {
        if let Err(err) = shared.allocator.free(bp, io.txg) {
            error!(io.log, "unable to release space of failed write"; "bp" => %bp, "error" => %err);
        }
    }
}

/// Give back everything a failed write allocated.
pub fn release_failed_write(shared: &Shared, io: &mut Io) {
    let members = io.gang.as_ref().map_or(Vec::new(), |gang| gang.members());
    if members.is_empty() && !io.allocated {
        return;
    }

    for member in &members {
        unallocate(shared, io, &member.bp, member.tree.as_ref());
    }
    if io.allocated {
        let bp = io.bp.clone();
        unallocate(shared, io, &bp, None);
        io.allocated = false;
    }

    debug!(io.log, "released space of failed write"; "bp" => %io.bp, "members" => members.len());
    io.bp.locations.clear();
}
