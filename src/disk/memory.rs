//! In-memory devices.

use std::sync::atomic::{self, AtomicBool, AtomicUsize};
use std::thread;

use crossbeam::channel::{self, Sender};
use parking_lot::Mutex;

use disk::{Completion, Device, DeviceIo, Direction, Error};
use Error as PipelineError;

/// Pending injected failures.
#[derive(Default)]
struct Faults {
    /// The number of reads to fail.
    reads: usize,
    /// The number of writes to fail.
    writes: usize,
}

/// A finished operation, waiting to be handed back.
struct Finished {
    done: Completion,
    buf: Vec<u8>,
    status: Result<(), Error>,
}

/// A device backed by a vector.
///
/// Operations are carried out when submitted, and handed back from a completion thread of the
/// disk's own. For testing, the disk can be told to fail operations, hold back their completions,
/// be detached, or have its contents corrupted behind the pipeline's back. It also counts the
/// operations it receives.
pub struct MemoryDisk {
    /// The contents.
    data: Mutex<Vec<u8>>,
    /// The base-2 logarithm of the sector size.
    ashift: u32,
    /// Injected failures.
    faults: Mutex<Faults>,
    /// Is the device detached?
    detached: AtomicBool,
    /// The number of reads submitted.
    reads: AtomicUsize,
    /// The number of writes submitted.
    writes: AtomicUsize,
    /// The number of flushes submitted.
    flushes: AtomicUsize,
    /// The number of reopen attempts.
    reopens: AtomicUsize,
    /// The completions held back, if holding.
    held: Mutex<Option<Vec<Finished>>>,
    /// The queue of the completion thread.
    completions: Sender<Finished>,
}

impl MemoryDisk {
    /// Create a zeroed disk of `size` bytes with sectors of `1 << ashift` bytes.
    pub fn new(size: usize, ashift: u32) -> MemoryDisk {
        let (completions, rx) = channel::unbounded::<Finished>();
        // The thread ends with the disk, when the queue closes.
        thread::spawn(move || {
            for finished in rx.iter() {
                finished.done.complete(finished.buf, finished.status);
            }
        });

        MemoryDisk {
            data: Mutex::new(vec![0; size]),
            ashift: ashift,
            faults: Mutex::new(Faults::default()),
            detached: AtomicBool::new(false),
            reads: AtomicUsize::new(0),
            writes: AtomicUsize::new(0),
            flushes: AtomicUsize::new(0),
            reopens: AtomicUsize::new(0),
            held: Mutex::new(None),
            completions: completions,
        }
    }

    /// Fail the next `n` operations of direction `direction` with a media error.
    pub fn fail_next(&self, direction: Direction, n: usize) {
        let mut faults = self.faults.lock();
        match direction {
            Direction::Read => faults.reads = n,
            Direction::Write => faults.writes = n,
            Direction::Flush => (),
        }
    }

    /// Hold back completions until `release()`.
    ///
    /// The operations themselves are still carried out.
    pub fn hold(&self) {
        let mut held = self.held.lock();
        if held.is_none() {
            *held = Some(Vec::new());
        }
    }

    /// Hand back every held completion, and stop holding.
    pub fn release(&self) {
        let held = self.held.lock().take();
        for finished in held.into_iter().flat_map(|held| held) {
            let _ = self.completions.send(finished);
        }
    }

    /// The number of completions held back.
    pub fn held(&self) -> usize {
        self.held.lock().as_ref().map_or(0, |held| held.len())
    }

    /// Detach the disk; every operation fails until it is reattached.
    pub fn detach(&self) {
        self.detached.store(true, atomic::Ordering::SeqCst);
    }

    /// Reattach the disk.
    pub fn reattach(&self) {
        self.detached.store(false, atomic::Ordering::SeqCst);
    }

    /// Flip every bit in a range of the disk.
    pub fn corrupt(&self, offset: u64, len: usize) {
        for byte in &mut self.data.lock()[offset as usize..][..len] {
            *byte = !*byte;
        }
    }

    /// Read a range of the disk directly, bypassing the pipeline.
    pub fn read_raw(&self, offset: u64, len: usize) -> Vec<u8> {
        self.data.lock()[offset as usize..][..len].to_vec()
    }

    /// The number of reads submitted so far.
    pub fn reads(&self) -> usize {
        self.reads.load(atomic::Ordering::SeqCst)
    }

    /// The number of writes submitted so far.
    pub fn writes(&self) -> usize {
        self.writes.load(atomic::Ordering::SeqCst)
    }

    /// The number of flushes submitted so far.
    pub fn flushes(&self) -> usize {
        self.flushes.load(atomic::Ordering::SeqCst)
    }

    /// The number of reopen attempts so far.
    pub fn reopens(&self) -> usize {
        self.reopens.load(atomic::Ordering::SeqCst)
    }

    /// Carry out an operation.
    fn transfer(&self, io: &mut DeviceIo) -> Result<(), Error> {
        if self.detached.load(atomic::Ordering::SeqCst) {
            return Err(Error::Detached);
        }

        // Consume an injected failure, if any.
        {
            let mut faults = self.faults.lock();
            let pending = match io.direction {
                Direction::Read => &mut faults.reads,
                Direction::Write => &mut faults.writes,
                Direction::Flush => return Ok(()),
            };
            if *pending > 0 {
                *pending -= 1;
                return Err(Error::Media { offset: io.offset });
            }
        }

        let sector = 1u64 << self.ashift;
        if io.offset % sector != 0 || io.buf.len() as u64 % sector != 0 {
            return Err(Error::Misaligned { offset: io.offset, len: io.buf.len() });
        }

        let mut data = self.data.lock();
        if io.offset + io.buf.len() as u64 > data.len() as u64 {
            return Err(Error::OutOfBounds { offset: io.offset, len: io.buf.len() });
        }

        let range = &mut data[io.offset as usize..][..io.buf.len()];
        match io.direction {
            Direction::Read => io.buf.copy_from_slice(range),
            Direction::Write => range.copy_from_slice(&io.buf),
            Direction::Flush => (),
        }

        Ok(())
    }
}

impl Device for MemoryDisk {
    fn ashift(&self) -> u32 {
        self.ashift
    }

    fn capacity(&self) -> u64 {
        self.data.lock().len() as u64
    }

    fn submit(&self, mut io: DeviceIo, done: Completion) {
        match io.direction {
            Direction::Read => self.reads.fetch_add(1, atomic::Ordering::SeqCst),
            Direction::Write => self.writes.fetch_add(1, atomic::Ordering::SeqCst),
            Direction::Flush => self.flushes.fetch_add(1, atomic::Ordering::SeqCst),
        };

        let finished = Finished {
            status: self.transfer(&mut io),
            buf: io.buf,
            done: done,
        };

        let mut held = self.held.lock();
        match *held {
            Some(ref mut held) => held.push(finished),
            // The completion thread lives as long as the disk.
            None => {
                let _ = self.completions.send(finished);
            },
        }
    }

    fn reopen(&self) -> Result<(), PipelineError> {
        self.reopens.fetch_add(1, atomic::Ordering::SeqCst);

        if self.detached.load(atomic::Ordering::SeqCst) {
            Err(err!(Unavailable, "memory disk is detached"))
        } else {
            Ok(())
        }
    }
}
