//! Requests.

use std::fmt;

use futures::channel::oneshot;
use slog::Logger;

use blkptr::{BlockPointer, Location, Txg};
use codec::{ChecksumAlgorithm, CompressionAlgorithm};
use disk;
use zio::arena::Handle;
use zio::gang::{GangState, GangTree};
use zio::stage::{Stage, StageSet};
use zio::transform::TransformStack;
use zio::vdev::MirrorNode;
use Error;

/// The type of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum IoType {
    /// A request without I/O of its own, gathering children.
    Null,
    /// Read a block.
    Read,
    /// Write a block (or rewrite it in place).
    Write,
    /// Free a block.
    Free,
    /// Claim the space of a block.
    Claim,
    /// Device control.
    Ioctl,
}

/// The scheduling class of a request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Priority {
    /// As soon as possible.
    Now,
    /// Synchronous read; someone is waiting.
    SyncRead,
    /// Synchronous write; someone is waiting.
    SyncWrite,
    /// Background read.
    AsyncRead,
    /// Background write.
    AsyncWrite,
}

impl Priority {
    /// Does this priority go to the urgent queue?
    pub fn is_urgent(self) -> bool {
        match self {
            Priority::Now | Priority::SyncRead | Priority::SyncWrite => true,
            Priority::AsyncRead | Priority::AsyncWrite => false,
        }
    }
}

bitflags! {
    /// Request flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct Flags: u32 {
        /// Failure is expected and not worth a warning.
        const CANFAIL = 1 << 0;
        /// Speculative I/O (e.g. prefetch). Failures are not reported as faults.
        const SPECULATIVE = 1 << 1;
        /// Never retry device errors.
        const DONT_RETRY = 1 << 2;
        /// Errors do not propagate to the parent.
        const DONT_PROPAGATE = 1 << 3;
        /// The request has no way of failing; a residual error aborts the process.
        const MUST_SUCCEED = 1 << 4;
        /// The block is metadata.
        const METADATA = 1 << 5;
        /// Physical I/O: no compression, no checksum handling.
        const PHYSICAL = 1 << 6;
        /// Issued on behalf of a user.
        const USER = 1 << 7;
        /// The data was already verified against its checksum.
        const VERIFIED = 1 << 8;
        /// Internal: the block is written in place.
        const IO_REWRITE = 1 << 16;
        /// Internal: the device operation is being retried.
        const IO_RETRY = 1 << 17;
        /// Internal: part of a gang block.
        const GANG_CHILD = 1 << 18;
        /// Internal: repair write of a bad copy.
        const SELF_HEAL = 1 << 19;
    }
}

impl Flags {
    /// The flags children inherit from their parent.
    pub const INHERIT: Flags = Flags::CANFAIL.union(Flags::SPECULATIVE).union(Flags::DONT_RETRY)
        .union(Flags::METADATA).union(Flags::USER);
}

/// Write properties.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WriteProps {
    /// The checksum algorithm.
    pub checksum: ChecksumAlgorithm,
    /// The compression algorithm.
    pub compression: CompressionAlgorithm,
    /// The number of copies.
    pub copies: usize,
}

impl Default for WriteProps {
    fn default() -> WriteProps {
        WriteProps {
            checksum: ChecksumAlgorithm::SeaHash,
            compression: CompressionAlgorithm::Lz4,
            copies: 1,
        }
    }
}

/// A device control operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ioctl {
    /// Flush the write cache.
    Flush,
}

/// The final state of a request, as seen by its completion callback.
#[derive(Debug)]
pub struct Outcome {
    /// The request.
    pub handle: Handle,
    /// The type of the request.
    pub io_type: IoType,
    /// The error, if the request failed.
    pub error: Option<Error>,
    /// The final block pointer.
    pub bp: BlockPointer,
    /// The data: read data for reads, the caller's buffer for writes.
    pub data: Option<Vec<u8>>,
    /// The number of device retries.
    pub retries: u32,
    /// The gang tree written by the request, if any.
    pub(crate) tree: Option<GangTree>,
}

/// The result of a successful request.
#[derive(Debug)]
pub struct Completed {
    /// The final block pointer.
    pub bp: BlockPointer,
    /// The data: read data for reads, the caller's buffer for writes.
    pub data: Option<Vec<u8>>,
    /// The number of device retries.
    pub retries: u32,
}

/// A completion callback.
pub type DoneCallback = Box<dyn FnOnce(&Outcome) + Send>;
/// A ready callback, called once the block pointer is stable.
pub type ReadyCallback = Box<dyn FnOnce(Handle, &BlockPointer) + Send>;

/// Request arguments common to every request type.
pub struct Args {
    pub(crate) flags: Flags,
    pub(crate) priority: Option<Priority>,
    pub(crate) on_ready: Option<ReadyCallback>,
    pub(crate) on_done: Option<DoneCallback>,
}

impl Args {
    pub fn new() -> Args {
        Args {
            flags: Flags::empty(),
            priority: None,
            on_ready: None,
            on_done: None,
        }
    }

    /// Set the flags.
    pub fn flags(mut self, flags: Flags) -> Args {
        self.flags = flags;
        self
    }

    /// Set the priority.
    ///
    /// Defaults to the parent's priority, or the asynchronous class of the request type.
    pub fn priority(mut self, priority: Priority) -> Args {
        self.priority = Some(priority);
        self
    }

    /// Call `f` when the request's block pointer is stable.
    pub fn on_ready<F: FnOnce(Handle, &BlockPointer) + Send + 'static>(mut self, f: F) -> Args {
        self.on_ready = Some(Box::new(f));
        self
    }

    /// Call `f` when the request completes.
    ///
    /// This is called exactly once, after every child has completed.
    pub fn on_done<F: FnOnce(&Outcome) + Send + 'static>(mut self, f: F) -> Args {
        self.on_done = Some(Box::new(f));
        self
    }
}

impl Default for Args {
    fn default() -> Args {
        Args::new()
    }
}

impl fmt::Debug for Args {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Args({:?}, {:?})", self.flags, self.priority)
    }
}

/// A check of the physical data read, in place of the block pointer's checksum.
pub type Verifier = fn(&[u8]) -> Result<(), Error>;

/// The device target of a per-location request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Target {
    /// The device.
    pub vdev: u32,
    /// The byte offset on the device.
    pub offset: u64,
    /// The space allocated at the offset. Device operations never extend past it.
    pub asize: u64,
}

impl Target {
    pub fn of(loc: &Location) -> Target {
        Target {
            vdev: loc.vdev,
            offset: loc.offset,
            asize: loc.asize as u64,
        }
    }
}

/// The mutable state of a request.
pub struct Io {
    pub io_type: IoType,
    pub priority: Priority,
    pub flags: Flags,
    /// The last stage run.
    pub stage: Stage,
    /// The enabled stages.
    pub pipeline: StageSet,
    /// The request's own block pointer.
    ///
    /// This is a snapshot; the caller's copy is never touched.
    pub bp: BlockPointer,
    /// The generation of the request.
    pub txg: Txg,
    pub props: WriteProps,
    /// The logical size.
    pub size: usize,
    pub stack: TransformStack,
    /// The error, once set, only ever gets worse (except for a device retry clearing it).
    pub error: Option<Error>,
    pub retries: u32,
    /// The device the request targets, for per-location requests.
    pub target: Option<Target>,
    /// The device control operation, for ioctls.
    pub ioctl: Option<(Ioctl, Option<u32>)>,
    /// The buffer and status handed back by the device.
    pub device_result: Option<(Vec<u8>, Result<(), disk::Error>)>,
    /// Did the device stage pad the buffer?
    pub padded: bool,
    /// The state of mirror fan-out.
    pub mirror: Option<MirrorNode>,
    /// The state of the gang stages.
    pub gang: Option<GangState>,
    /// Did this request allocate the locations of `bp`?
    pub allocated: bool,
    /// Verifies data read, for blocks whose integrity is not covered by their block pointer.
    pub verifier: Option<Verifier>,
    pub on_ready: Option<ReadyCallback>,
    pub on_done: Option<DoneCallback>,
    pub promise: Option<oneshot::Sender<Result<Completed, Error>>>,
    pub log: Logger,
}

impl Io {
    /// Fail the request.
    ///
    /// If an error is already set, the worse of the two is kept.
    pub fn fail(&mut self, err: Error) {
        self.error = Some(match self.error.take() {
            Some(old) => old.worse(err),
            None => err,
        });
    }

    /// Is the request a write in place?
    pub fn is_rewrite(&self) -> bool {
        self.flags.contains(Flags::IO_REWRITE)
    }
}
