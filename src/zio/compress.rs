//! The block pointer setup stages.
//!
//! These decide, from the block pointer and the write properties, what the rest of the pipeline
//! looks like: holes skip all I/O, gang blocks go through the gang stages, compressed blocks get
//! a transform, and late commit passes converge onto the blocks of earlier passes.

use std::sync::Arc;

use blkptr::BlockPointer;
use codec::{Compressed, CompressionAlgorithm};
use zio::request::{Flags, Io};
use zio::stage::{Flow, StageSet};
use zio::transform::Unwind;
use zio::Shared;

/// Set up a read.
pub fn read_bp_init(io: &mut Io) -> Flow {
    if io.bp.is_hole() {
        // The caller's buffer is zeroed at creation.
        for byte in io.stack.data_mut() {
            *byte = 0;
        }
        io.pipeline = StageSet::INTERLOCK;
        return Flow::Continue;
    }

    if io.bp.compression != CompressionAlgorithm::Off && !io.flags.contains(Flags::PHYSICAL) {
        let psize = io.bp.psize as usize;
        io.stack.push(vec![0; psize], psize, Unwind::Decompress(io.bp.compression));
    }

    if io.bp.is_gang() {
        io.pipeline = (io.pipeline & !StageSet::VDEV_IO) | StageSet::GANG_ASSEMBLE
            | StageSet::GANG_ISSUE;
    }

    Flow::Continue
}

/// Set up a free.
pub fn free_bp_init(io: &mut Io) -> Flow {
    if io.bp.is_hole() {
        io.pipeline = StageSet::INTERLOCK;
    } else if io.bp.is_gang() {
        io.pipeline |= StageSet::GANG_ASSEMBLE | StageSet::GANG_ISSUE;
    }

    Flow::Continue
}

/// Compress the data and fill in the new block pointer.
pub fn write_bp_init(shared: &Arc<Shared>, io: &mut Io) -> Flow {
    let lsize = io.stack.size();
    let mut compression = io.props.compression;

    // Blocks which keep being rewritten within the same generation stop being compressed at some
    // point, so that the commit passes converge.
    let (pass, same_generation) = {
        let config = shared.config.read();
        (config.sync_pass, !io.bp.is_hole() && io.bp.birth == io.txg)
    };
    if same_generation && pass >= shared.options.sync_pass_dont_compress {
        compression = CompressionAlgorithm::Off;
    }

    let psize = match compression.compress(io.stack.data()) {
        Compressed::Empty => {
            trace!(io.log, "all-zero block written as hole"; "lsize" => lsize);
            io.bp = BlockPointer {
                lsize: lsize as u32,
                birth: io.txg,
                ..BlockPointer::hole()
            };
            io.pipeline = StageSet::INTERLOCK;
            return Flow::Continue;
        },
        Compressed::Smaller(buf) => {
            let psize = buf.len();
            trace!(io.log, "compressed block"; "lsize" => lsize, "psize" => psize);
            io.stack.push(buf, psize, Unwind::Keep);
            psize
        },
        Compressed::NoGain => {
            compression = CompressionAlgorithm::Off;
            lsize
        },
    };

    if same_generation && !io.bp.is_gang() && io.bp.psize as usize == psize
        && io.bp.copies() == io.props.copies && pass >= shared.options.sync_pass_rewrite {
        // Converge: overwrite the block of the previous pass in place.
        debug!(io.log, "rewriting block in place"; "bp" => %io.bp, "pass" => pass);
        io.pipeline = StageSet::REWRITE;
        io.flags |= Flags::IO_REWRITE;
    } else {
        io.bp.locations.clear();
        io.pipeline = StageSet::WRITE;
    }

    io.bp.lsize = lsize as u32;
    io.bp.psize = psize as u32;
    io.bp.compression = compression;
    io.bp.checksum_algorithm = io.props.checksum;
    io.bp.checksum = Default::default();
    io.bp.birth = io.txg;

    Flow::Continue
}
