//! The worker threads.
//!
//! Workers pull jobs off two queues. The urgent queue (device completions and synchronous
//! requests) is always drained before the normal one is looked at.

use std::cell::Cell;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam::channel::{Receiver, Select};

use disk;
use zio::{self, Handle, Shared};
use Error;

thread_local! {
    /// Is the current thread a worker?
    static IN_WORKER: Cell<bool> = Cell::new(false);
}

/// Is the current thread a worker?
pub fn on_worker_thread() -> bool {
    IN_WORKER.with(|w| w.get())
}

/// A unit of work.
pub enum Job {
    /// Drive a request.
    Execute(Handle),
    /// A device finished an operation of a request.
    Interrupt(Handle, Vec<u8>, Result<(), disk::Error>),
    /// Probe a device which kept failing.
    Reopen(u32),
    /// Terminate the worker.
    Shutdown,
}

/// Start `n` workers.
pub fn spawn(shared: &Arc<Shared>, n: usize, urgent: Receiver<Job>, normal: Receiver<Job>)
             -> Result<Vec<JoinHandle<()>>, Error> {
    (0..n).map(|id| {
        let shared = shared.clone();
        let urgent = urgent.clone();
        let normal = normal.clone();

        thread::Builder::new()
            .name(format!("zio-{}", id))
            .spawn(move || run(&shared, &urgent, &normal))
            .map_err(|err| err!(Implementation, "unable to start worker {}: {}", id, err))
    }).collect()
}

/// Take the next job, urgent ones first.
///
/// Returns `None` if the queues are closed.
fn next(urgent: &Receiver<Job>, normal: &Receiver<Job>) -> Option<Job> {
    if let Ok(job) = urgent.try_recv() {
        return Some(job);
    }

    let mut select = Select::new();
    let urgent_op = select.recv(urgent);
    select.recv(normal);

    let op = select.select();
    if op.index() == urgent_op {
        op.recv(urgent).ok()
    } else {
        op.recv(normal).ok()
    }
}

fn run(shared: &Arc<Shared>, urgent: &Receiver<Job>, normal: &Receiver<Job>) {
    IN_WORKER.with(|w| w.set(true));
    trace!(shared.log, "worker started");

    while let Some(job) = next(urgent, normal) {
        match job {
            Job::Execute(handle) => zio::execute(shared, handle),
            Job::Interrupt(handle, buf, status) => zio::interrupt(shared, handle, buf, status),
            Job::Reopen(vdev) => shared.reopen(vdev),
            Job::Shutdown => break,
        }
    }

    trace!(shared.log, "worker stopped");
}
