//! The interlock stages.
//!
//! `ready` runs once the block pointer of a request is final, `done` once the request and all of
//! its children have completed. Both wait for the children to get there first.

use std::sync::Arc;

use zio::arena::{Milestone, Node};
use zio::dva;
use zio::request::{Completed, Flags, Io, IoType, Outcome};
use zio::stage::Flow;
use zio::{notify_parent, wait_for_children, Shared};

/// The block pointer is stable.
pub fn ready(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    if wait_for_children(node, io, Milestone::Ready) {
        return Flow::Stop;
    }

    if let Some(on_ready) = io.on_ready.take() {
        on_ready(node.handle, &io.bp);
    }

    node.links.lock().reached_ready = true;
    notify_parent(shared, node, io, Milestone::Ready);

    Flow::Continue
}

/// Complete the request.
///
/// This releases the request, unless someone waits for its result.
pub fn done(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    if wait_for_children(node, io, Milestone::Done) {
        return Flow::Stop;
    }

    if io.error.is_some() && io.io_type == IoType::Write && !io.is_rewrite() {
        dva::release_failed_write(shared, io);
    }

    let apply = io.io_type == IoType::Read && io.error.is_none();
    if let Err(err) = io.stack.unwind(apply) {
        io.fail(err);
    }

    let fatal = match io.error {
        Some(ref err) if io.flags.contains(Flags::MUST_SUCCEED) => {
            crit!(io.log, "request which must succeed failed"; "error" => %err);
            Some(err.clone())
        },
        _ => None,
    };

    if let Some(ref err) = io.error {
        if io.flags.intersects(Flags::CANFAIL | Flags::SPECULATIVE) {
            debug!(io.log, "request failed"; "error" => %err, "retries" => io.retries);
        } else {
            warn!(io.log, "request failed"; "error" => %err, "retries" => io.retries);
        }
    } else {
        trace!(io.log, "request completed"; "bp" => %io.bp, "retries" => io.retries);
    }

    let tree = match io.gang {
        Some(ref gang) if io.error.is_none() && io.io_type == IoType::Write
            && !io.is_rewrite() => Some(gang.tree()),
        _ => None,
    };
    let outcome = Outcome {
        handle: node.handle,
        io_type: io.io_type,
        error: io.error.clone(),
        bp: io.bp.clone(),
        data: io.stack.clear(),
        retries: io.retries,
        tree: tree,
    };

    if let Some(on_done) = io.on_done.take() {
        on_done(&outcome);
    }

    let waiter = {
        let mut links = node.links.lock();
        links.reached_done = true;
        links.waiter
    };
    notify_parent(shared, node, io, Milestone::Done);
    // Only roots hold one.
    *node.token.lock() = None;

    let result = match outcome.error {
        Some(err) => Err(err),
        None => Ok(Completed {
            bp: outcome.bp,
            data: outcome.data,
            retries: outcome.retries,
        }),
    };

    if waiter {
        shared.finished();
        let mut links = node.links.lock();
        links.result = Some(result);
        node.done_cv.notify_all();
    } else {
        shared.arena.remove(node.handle);
        if let Some(promise) = io.promise.take() {
            // The receiver may be gone; nobody cares about the result then.
            let _ = promise.send(result);
        }
        shared.finished();
    }

    // Waiters have their result by now.
    if let Some(err) = fatal {
        panic!("request {} must succeed, but failed: {}", node.handle, err);
    }

    Flow::Stop
}
