//! Fault reporting.
//!
//! Checksum mismatches and device failures are reported to an external monitor, independently of
//! whether the request itself recovers (e.g. by reading another copy).

use slog::Logger;

use blkptr::Txg;
use zio::{Handle, IoType};
use Error;

/// The class of a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultKind {
    /// Data read back did not match its checksum.
    Checksum,
    /// A device operation failed after exhausting its retries.
    Io,
}

/// A fault report.
#[derive(Debug, Clone)]
pub struct Fault {
    /// The class of the fault.
    pub kind: FaultKind,
    /// The request that observed the fault.
    pub zio: Handle,
    /// The type of the request.
    pub io_type: IoType,
    /// The device involved, if known.
    pub vdev: Option<u32>,
    /// The byte offset on the device, if known.
    pub offset: Option<u64>,
    /// The size of the affected data.
    pub size: usize,
    /// The generation of the affected block.
    pub txg: Txg,
    /// The error the request observed.
    pub error: Error,
}

/// A consumer of fault reports.
///
/// Reporting is fire-and-forget. It is called from worker threads, and must not block for long.
pub trait FaultReporter: Send + Sync {
    /// Report a fault.
    fn report(&self, fault: &Fault);
}

/// A reporter writing faults to a log.
pub struct LogReporter {
    log: Logger,
}

impl LogReporter {
    /// Create a reporter logging to `log`.
    pub fn new(log: Logger) -> LogReporter {
        LogReporter {
            log: log,
        }
    }
}

impl FaultReporter for LogReporter {
    fn report(&self, fault: &Fault) {
        warn!(self.log, "fault"; "kind" => ?fault.kind, "zio" => %fault.zio, "type" => ?fault.io_type,
              "vdev" => ?fault.vdev, "offset" => ?fault.offset, "size" => fault.size,
              "txg" => fault.txg, "error" => %fault.error);
    }
}
