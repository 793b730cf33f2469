//! The TFS I/O pipeline.
//!
//! Every read, write, free, claim and device control operation on a block is represented as an
//! I/O request which flows through a fixed, ordered sequence of stages: block pointer setup,
//! compression, checksumming, allocation, gang block splitting, device I/O with retry, checksum
//! verification and completion. Requests form trees; a parent only completes after all of its
//! children have.
//!
//! The entry point is `Pipeline`. It is given the devices, an allocator and a fault reporter at
//! construction, and hands out requests through `Pipeline::create_read()`,
//! `Pipeline::create_write()` and friends.

#[macro_use]
extern crate slog;
#[macro_use]
extern crate quick_error;
#[macro_use]
extern crate bitflags;
extern crate byteorder;
extern crate crossbeam;
extern crate futures;
extern crate lz4_compress;
extern crate parking_lot;
extern crate seahash;

#[macro_use]
mod error;

pub mod alloc;
pub mod blkptr;
pub mod codec;
pub mod config;
pub mod disk;
pub mod fault;
pub mod gang;
mod pool;
mod worker;
mod zio;

pub use alloc::{Allocator, SpaceMap};
pub use blkptr::{BlockPointer, Location, Txg, MAX_COPIES};
pub use codec::{Checksum, ChecksumAlgorithm, CompressionAlgorithm};
pub use config::Options;
pub use disk::{Completion, Device, DeviceIo, Direction};
pub use error::{Error, Kind};
pub use fault::{Fault, FaultKind, FaultReporter, LogReporter};
pub use zio::{Args, Completed, Flags, Handle, IoType, Ioctl, Outcome, Pipeline, Priority, WriteProps};
