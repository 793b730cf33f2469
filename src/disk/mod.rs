//! Devices.
//!
//! The pipeline talks to storage through the `Device` trait: it submits an operation together
//! with a `Completion`, and the device hands the buffer back through the completion whenever the
//! operation finishes. Completion never runs pipeline stages in the device's context; it merely
//! queues the request for a worker.

mod memory;

pub use self::memory::MemoryDisk;

use std::fmt;

use crossbeam::channel::Sender;

use worker::Job;
use zio::{Handle, Priority};
use Error as PipelineError;

quick_error! {
    /// A device error.
    #[derive(Debug, Clone, PartialEq)]
    pub enum Error {
        /// The medium failed to transfer the data.
        ///
        /// This is considered transient, and may be retried.
        Media { offset: u64 } {
            display("Media error at offset {:x}.", offset)
        }
        /// The device is detached or otherwise not responding.
        Detached {
            display("Device detached.")
        }
        /// The transfer exceeded the end of the device.
        OutOfBounds { offset: u64, len: usize } {
            display("Transfer of {} bytes at {:x} past end of device.", len, offset)
        }
        /// The transfer is not aligned to the device's sector size.
        Misaligned { offset: u64, len: usize } {
            display("Transfer of {} bytes at {:x} is misaligned.", len, offset)
        }
    }
}

impl From<Error> for PipelineError {
    fn from(err: Error) -> PipelineError {
        match err {
            Error::Media { .. } => err!(Io, "{}", err),
            Error::Detached => err!(Unavailable, "{}", err),
            Error::OutOfBounds { .. } | Error::Misaligned { .. } => err!(Implementation, "{}", err),
        }
    }
}

/// The direction of a device operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Fill the buffer from the device.
    Read,
    /// Write the buffer to the device.
    Write,
    /// Flush the device's write cache.
    Flush,
}

/// A device operation.
pub struct DeviceIo {
    /// The direction of the operation.
    pub direction: Direction,
    /// The byte offset on the device.
    ///
    /// This is aligned to the device's sector size.
    pub offset: u64,
    /// The buffer to read into or write from.
    ///
    /// The length is a multiple of the sector size. Empty for flushes.
    pub buf: Vec<u8>,
    /// The priority of the request the operation belongs to.
    pub priority: Priority,
}

impl fmt::Debug for DeviceIo {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "DeviceIo({:?} {:x}+{:x} {:?})", self.direction, self.offset, self.buf.len(),
               self.priority)
    }
}

/// A storage device.
pub trait Device: Send + Sync {
    /// The base-2 logarithm of the sector size.
    fn ashift(&self) -> u32;
    /// The size of the device in bytes.
    fn capacity(&self) -> u64;
    /// Submit an operation.
    ///
    /// The device must eventually call `done.complete()` exactly once, handing back the buffer.
    /// It may do so before returning.
    fn submit(&self, io: DeviceIo, done: Completion);
    /// Try to reattach the device.
    ///
    /// This is called off the request path, after requests to the device kept failing.
    fn reopen(&self) -> Result<(), PipelineError>;
}

/// The completion token of a device operation.
pub struct Completion {
    /// The request the operation belongs to.
    handle: Handle,
    /// The queue to resume the request on.
    queue: Sender<Job>,
}

impl Completion {
    pub(crate) fn new(handle: Handle, queue: Sender<Job>) -> Completion {
        Completion {
            handle: handle,
            queue: queue,
        }
    }

    /// Finish the operation.
    ///
    /// This hands `buf` back to the request and schedules it on a worker.
    pub fn complete(self, buf: Vec<u8>, status: Result<(), Error>) {
        // The pipeline outlives every in-flight request, so the queue is never closed here.
        let _ = self.queue.send(Job::Interrupt(self.handle, buf, status));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use Kind;

    #[test]
    fn error_kinds() {
        assert_eq!(PipelineError::from(Error::Media { offset: 0 }).kind, Kind::Io);
        assert_eq!(PipelineError::from(Error::Detached).kind, Kind::Unavailable);
        assert_eq!(PipelineError::from(Error::OutOfBounds { offset: 0, len: 512 }).kind,
                   Kind::Implementation);
    }
}
