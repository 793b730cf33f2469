//! The checksum stages.

use std::sync::Arc;

use codec::ChecksumAlgorithm;
use fault::FaultKind;
use zio::arena::Node;
use zio::request::{Flags, Io};
use zio::stage::Flow;
use zio::Shared;
use Error;

/// Checksum the physical data about to be written.
pub fn generate(io: &mut Io) -> Flow {
    if io.bp.checksum_algorithm != ChecksumAlgorithm::Off {
        io.bp.checksum = io.bp.checksum_algorithm.hash(io.stack.data());
    }

    Flow::Continue
}

/// Verify the physical data read against the block pointer.
pub fn verify(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    if io.flags.contains(Flags::VERIFIED) || io.bp.is_hole() {
        return Flow::Continue;
    }

    if let Err(err) = check(io, io.stack.data()) {
        shared.report(node.handle, io, FaultKind::Checksum, None, &err);
        io.fail(err);
    }

    Flow::Continue
}

/// Check `data`, as read for `io`.
///
/// Requests with a verifier of their own use it, the rest compare against the block pointer's
/// checksum.
pub fn check(io: &Io, data: &[u8]) -> Result<(), Error> {
    if let Some(verifier) = io.verifier {
        return verifier(data);
    }
    if io.bp.checksum_algorithm == ChecksumAlgorithm::Off {
        return Ok(());
    }

    let actual = io.bp.checksum_algorithm.hash(data);
    if actual == io.bp.checksum {
        Ok(())
    } else {
        Err(err!(Corruption, "checksum mismatch on {}: expected {}, found {}", io.bp,
                 io.bp.checksum, actual))
    }
}
