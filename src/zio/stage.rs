//! The stage table.
//!
//! A request's pipeline is the set of stages it runs, always in the fixed order of `Stage`. The
//! driver walks the set, one enabled stage at a time.

use std::fmt;

/// A pipeline stage.
///
/// The discriminants define the execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Stage {
    /// The initial position. Never executed.
    Open = 0,
    /// Set up a read: holes, decompression buffers, gang detection.
    ReadBpInit = 1,
    /// Set up a free: holes, gang detection.
    FreeBpInit = 2,
    /// Compress and apply the write convergence policy.
    WriteBpInit = 3,
    /// Checksum the data about to be written.
    ChecksumGenerate = 4,
    /// Allocate space, or fall back to a gang block.
    DvaAllocate = 5,
    /// Fetch a gang header.
    GangAssemble = 6,
    /// Issue the gang members.
    GangIssue = 7,
    /// Write the gang header.
    GangHeader = 8,
    /// Free the space of the block.
    DvaFree = 9,
    /// Claim the space of the block.
    DvaClaim = 10,
    /// The block pointer is stable.
    Ready = 11,
    /// Issue the device operation.
    VdevIoStart = 12,
    /// Collect the device operation.
    VdevIoDone = 13,
    /// Decide upon retrying.
    VdevIoAssess = 14,
    /// Verify the checksum of the data read.
    ChecksumVerify = 15,
    /// Complete the request.
    Done = 16,
}

/// All stages, in order.
const STAGES: [Stage; 17] = [
    Stage::Open,
    Stage::ReadBpInit,
    Stage::FreeBpInit,
    Stage::WriteBpInit,
    Stage::ChecksumGenerate,
    Stage::DvaAllocate,
    Stage::GangAssemble,
    Stage::GangIssue,
    Stage::GangHeader,
    Stage::DvaFree,
    Stage::DvaClaim,
    Stage::Ready,
    Stage::VdevIoStart,
    Stage::VdevIoDone,
    Stage::VdevIoAssess,
    Stage::ChecksumVerify,
    Stage::Done,
];

impl Stage {
    /// The stage preceding this one in the table.
    ///
    /// # Panics
    ///
    /// `Open` has no predecessor.
    pub fn prev(self) -> Stage {
        match (self as usize).checked_sub(1) {
            Some(n) => STAGES[n],
            None => panic!("the open stage has no predecessor"),
        }
    }
}

bitflags! {
    /// A set of stages.
    #[derive(Clone, Copy, PartialEq, Eq, Hash)]
    pub struct StageSet: u32 {
        const OPEN = 1 << Stage::Open as u32;
        const READ_BP_INIT = 1 << Stage::ReadBpInit as u32;
        const FREE_BP_INIT = 1 << Stage::FreeBpInit as u32;
        const WRITE_BP_INIT = 1 << Stage::WriteBpInit as u32;
        const CHECKSUM_GENERATE = 1 << Stage::ChecksumGenerate as u32;
        const DVA_ALLOCATE = 1 << Stage::DvaAllocate as u32;
        const GANG_ASSEMBLE = 1 << Stage::GangAssemble as u32;
        const GANG_ISSUE = 1 << Stage::GangIssue as u32;
        const GANG_HEADER = 1 << Stage::GangHeader as u32;
        const DVA_FREE = 1 << Stage::DvaFree as u32;
        const DVA_CLAIM = 1 << Stage::DvaClaim as u32;
        const READY = 1 << Stage::Ready as u32;
        const VDEV_IO_START = 1 << Stage::VdevIoStart as u32;
        const VDEV_IO_DONE = 1 << Stage::VdevIoDone as u32;
        const VDEV_IO_ASSESS = 1 << Stage::VdevIoAssess as u32;
        const CHECKSUM_VERIFY = 1 << Stage::ChecksumVerify as u32;
        const DONE = 1 << Stage::Done as u32;

        /// Stages every pipeline runs.
        const INTERLOCK = Self::READY.bits() | Self::DONE.bits();
        /// The device stages.
        const VDEV_IO = Self::VDEV_IO_START.bits() | Self::VDEV_IO_DONE.bits()
            | Self::VDEV_IO_ASSESS.bits();
        /// The stages still run once a request has failed.
        const ERROR_MASK = Self::VDEV_IO_DONE.bits() | Self::VDEV_IO_ASSESS.bits()
            | Self::INTERLOCK.bits();
        /// Reads.
        const READ = Self::INTERLOCK.bits() | Self::VDEV_IO.bits() | Self::READ_BP_INIT.bits()
            | Self::CHECKSUM_VERIFY.bits();
        /// Writes of new blocks.
        const WRITE = Self::INTERLOCK.bits() | Self::VDEV_IO.bits() | Self::WRITE_BP_INIT.bits()
            | Self::CHECKSUM_GENERATE.bits() | Self::DVA_ALLOCATE.bits();
        /// Writes in place.
        const REWRITE = Self::INTERLOCK.bits() | Self::VDEV_IO.bits()
            | Self::CHECKSUM_GENERATE.bits();
        /// Frees.
        const FREE = Self::INTERLOCK.bits() | Self::FREE_BP_INIT.bits() | Self::DVA_FREE.bits();
        /// Claims.
        const CLAIM = Self::INTERLOCK.bits() | Self::DVA_CLAIM.bits();
        /// Device control.
        const IOCTL = Self::INTERLOCK.bits() | Self::VDEV_IO.bits();
        /// Per-location children of mirrored requests.
        const VDEV_CHILD = Self::INTERLOCK.bits() | Self::VDEV_IO.bits();
        /// The gang stages.
        const GANG = Self::GANG_ASSEMBLE.bits() | Self::GANG_ISSUE.bits()
            | Self::GANG_HEADER.bits();
    }
}

impl StageSet {
    /// The set of a single stage.
    pub fn of(stage: Stage) -> StageSet {
        StageSet::from_bits_retain(1 << stage as u32)
    }

    /// The first stage of the set strictly after `stage`.
    pub fn next_after(self, stage: Stage) -> Option<Stage> {
        STAGES[stage as usize + 1..].iter().cloned().find(|&s| self.contains(StageSet::of(s)))
    }
}

impl fmt::Debug for StageSet {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_set().entries(STAGES.iter().filter(|&&s| self.contains(StageSet::of(s)))).finish()
    }
}

/// What the driver does after a stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    /// Go on with the next stage.
    Continue,
    /// Leave the request alone. Something else (a child, a device, a worker) resumes it.
    Stop,
}
