extern crate futures;
extern crate rand;
#[macro_use]
extern crate slog;
extern crate tfs_zio;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use rand::Rng;

use tfs_zio::disk::MemoryDisk;
use tfs_zio::gang::GangHeader;
use tfs_zio::{Args, BlockPointer, CompressionAlgorithm, Device, Direction, Fault, FaultKind,
              FaultReporter, Flags, Ioctl, Kind, Options, Pipeline, SpaceMap, WriteProps};

const DISK_SIZE: usize = 8 * 1024 * 1024;

/// A fault reporter remembering every fault.
#[derive(Default)]
struct Recorder {
    faults: Mutex<Vec<Fault>>,
}

impl Recorder {
    fn kinds(&self) -> Vec<FaultKind> {
        self.faults.lock().unwrap().iter().map(|fault| fault.kind).collect()
    }
}

impl FaultReporter for Recorder {
    fn report(&self, fault: &Fault) {
        self.faults.lock().unwrap().push(fault.clone());
    }
}

struct Pool {
    pipeline: Pipeline,
    disks: Vec<Arc<MemoryDisk>>,
    space: Arc<SpaceMap>,
    faults: Arc<Recorder>,
}

fn build(disks: Vec<Arc<MemoryDisk>>, space: SpaceMap, options: Options)
         -> Result<Pool, tfs_zio::Error> {
    let space = Arc::new(space);
    let faults = Arc::new(Recorder::default());

    let pipeline = Pipeline::new(
        slog::Logger::root(slog::Discard, o!()),
        options,
        disks.iter().map(|disk| disk.clone() as Arc<dyn Device>).collect(),
        space.clone(),
        faults.clone(),
    )?;

    Ok(Pool {
        pipeline: pipeline,
        disks: disks,
        space: space,
        faults: faults,
    })
}

fn pool_with(disks: usize, options: Options, max_extent: Option<u64>) -> Pool {
    let disks: Vec<Arc<MemoryDisk>> = (0..disks).map(|_| Arc::new(MemoryDisk::new(DISK_SIZE, 9)))
        .collect();
    let mut space = SpaceMap::new(&vec![DISK_SIZE as u64; disks.len()], 512);
    if let Some(max) = max_extent {
        space = space.max_extent(max);
    }

    build(disks, space, options).unwrap()
}

fn pool(disks: usize) -> Pool {
    pool_with(disks, Options {
        workers: 2,
        ..Options::default()
    }, None)
}

/// A pool whose allocator hands out no extent larger than 64 KiB.
fn gang_pool(disks: usize) -> Pool {
    pool_with(disks, Options {
        workers: 2,
        ..Options::default()
    }, Some(64 * 1024))
}

fn random(len: usize) -> Vec<u8> {
    let mut buf = vec![0; len];
    rand::thread_rng().fill(&mut buf[..]);
    buf
}

fn raw() -> WriteProps {
    WriteProps {
        compression: CompressionAlgorithm::Off,
        ..WriteProps::default()
    }
}

impl Pool {
    fn write(&self, data: Vec<u8>, props: WriteProps) -> BlockPointer {
        let zio = self.pipeline.create_write(None, &BlockPointer::hole(), data, 1, props, Args::new());
        self.pipeline.wait(zio).unwrap().bp
    }

    fn read(&self, bp: &BlockPointer) -> Result<Vec<u8>, tfs_zio::Error> {
        let zio = self.pipeline.create_read(None, bp, Args::new());
        self.pipeline.wait(zio).map(|done| done.data.unwrap())
    }

    fn free(&self, bp: &BlockPointer) -> Result<(), tfs_zio::Error> {
        let zio = self.pipeline.create_free(None, bp, 1, Args::new());
        self.pipeline.wait(zio).map(|_| ())
    }
}

#[test]
fn compressible_round_trip() {
    let pool = pool(1);
    let data: Vec<u8> = b"the quick brown fox jumps over the lazy dog. ".iter().cloned().cycle()
        .take(64 * 1024).collect();

    let bp = pool.write(data.clone(), WriteProps::default());
    assert_eq!(bp.compression, CompressionAlgorithm::Lz4);
    assert_eq!(bp.lsize as usize, data.len());
    assert!((bp.psize as usize) < data.len());
    assert_eq!(bp.copies(), 1);
    assert_eq!(bp.birth, 1);

    assert_eq!(pool.read(&bp).unwrap(), data);
    assert_eq!(pool.pipeline.live_requests(), 0);
}

#[test]
fn incompressible_stored_raw() {
    let pool = pool(1);
    let data = random(8192);

    let bp = pool.write(data.clone(), WriteProps::default());
    assert_eq!(bp.compression, CompressionAlgorithm::Off);
    assert_eq!(bp.psize, bp.lsize);
    assert_eq!(pool.disks[0].read_raw(bp.locations[0].offset, 8192), data);

    assert_eq!(pool.read(&bp).unwrap(), data);
}

#[test]
fn zeros_become_a_hole() {
    let pool = pool(1);

    let bp = pool.write(vec![0; 8192], WriteProps::default());
    assert!(bp.is_hole());
    assert_eq!(bp.lsize, 8192);
    assert_eq!(pool.disks[0].writes(), 0);

    assert_eq!(pool.read(&bp).unwrap(), vec![0; 8192]);
    assert_eq!(pool.disks[0].reads(), 0);
}

#[test]
fn gang_split_and_reassembly() {
    let pool = pool_with(1, Options {
        workers: 2,
        ..Options::default()
    }, Some(64 * 1024));
    let data = random(192 * 1024);

    let bp = pool.write(data.clone(), WriteProps::default());
    assert!(bp.is_gang());
    assert_eq!(bp.psize as usize, data.len());

    let loc = bp.locations[0];
    let header = GangHeader::decode(&pool.disks[0].read_raw(loc.offset, 512)).unwrap();
    assert_eq!(header.present().count(), 3);
    assert_eq!(header.payload_size(), data.len());

    assert_eq!(pool.read(&bp).unwrap(), data);

    // Freeing the gang block frees every member, recursively.
    pool.free(&bp).unwrap();
    assert_eq!(pool.space.allocated_bytes(), 0);
}

#[test]
fn compressed_gang_round_trip() {
    let pool = gang_pool(1);
    // Every random chunk repeats once, which compresses to a bit over half.
    let mut data = Vec::with_capacity(192 * 1024);
    while data.len() < 192 * 1024 {
        let chunk = random(16);
        data.extend_from_slice(&chunk);
        data.extend_from_slice(&chunk);
    }

    let bp = pool.write(data.clone(), WriteProps::default());
    assert_eq!(bp.compression, CompressionAlgorithm::Lz4);
    assert!((bp.psize as usize) < data.len());
    assert!(bp.psize > 64 * 1024);
    assert!(bp.is_gang());

    assert_eq!(pool.read(&bp).unwrap(), data);
    pool.free(&bp).unwrap();
    assert_eq!(pool.space.allocated_bytes(), 0);
}

#[test]
fn mirrored_gang_header_fails_over() {
    let pool = gang_pool(2);
    let data = random(192 * 1024);
    let bp = pool.write(data.clone(), WriteProps {
        copies: 2,
        ..raw()
    });
    assert!(bp.is_gang());
    assert_eq!(bp.copies(), 2);

    let loc = bp.locations[0];
    let disk = pool.disks[loc.vdev as usize].clone();
    disk.corrupt(loc.offset, 1);
    assert_eq!(GangHeader::decode(&disk.read_raw(loc.offset, 512)).unwrap_err().kind,
               Kind::Corruption);

    assert_eq!(pool.read(&bp).unwrap(), data);
    assert_eq!(pool.faults.kinds(), [FaultKind::Checksum]);
    // The bad copy was repaired from the good one.
    assert!(GangHeader::decode(&disk.read_raw(loc.offset, 512)).is_ok());
}

#[test]
fn corrupt_gang_header_is_reported() {
    let pool = gang_pool(1);
    let bp = pool.write(random(192 * 1024), raw());

    pool.disks[0].corrupt(bp.locations[0].offset + 200, 1);
    assert_eq!(pool.read(&bp).unwrap_err().kind, Kind::Corruption);
    assert_eq!(pool.faults.kinds(), [FaultKind::Checksum]);
}

#[test]
fn gang_free_releases_header_after_member_failure() {
    let pool = gang_pool(1);
    let bp = pool.write(random(192 * 1024), raw());

    let header = GangHeader::decode(&pool.disks[0].read_raw(bp.locations[0].offset, 512)).unwrap();
    let first = header.present().next().unwrap().1.clone();
    assert!(!first.is_gang());
    pool.free(&first).unwrap();

    // The member is freed twice, but the rest of the block goes regardless.
    assert_eq!(pool.free(&bp).unwrap_err().kind, Kind::Implementation);
    assert_eq!(pool.space.allocated_bytes(), 0);
}

#[test]
fn forced_gang_rewrite() {
    let pool = pool_with(1, Options {
        workers: 2,
        force_gang_threshold: Some(32 * 1024),
        ..Options::default()
    }, None);
    let data = random(48 * 1024);

    let bp = pool.write(data.clone(), raw());
    assert!(bp.is_gang());

    let new = random(48 * 1024);
    let zio = pool.pipeline.create_rewrite(None, &bp, new.clone(), 1, Args::new());
    let rewritten = pool.pipeline.wait(zio).unwrap().bp;
    assert_eq!(rewritten.locations, bp.locations);
    assert_ne!(rewritten.checksum, bp.checksum);

    assert_eq!(pool.read(&rewritten).unwrap(), new);
}

#[test]
fn transient_write_error_is_retried() {
    let pool = pool(1);
    pool.disks[0].fail_next(Direction::Write, 1);

    let data = random(4096);
    let zio = pool.pipeline.create_write(None, &BlockPointer::hole(), data.clone(), 1, raw(),
                                         Args::new());
    let done = pool.pipeline.wait(zio).unwrap();

    assert_eq!(done.retries, 1);
    assert_eq!(pool.disks[0].writes(), 2);
    assert!(pool.faults.kinds().is_empty());
    assert_eq!(pool.read(&done.bp).unwrap(), data);
}

#[test]
fn transient_read_error_is_retried() {
    let pool = pool(1);
    let data = random(4096);
    let bp = pool.write(data.clone(), raw());

    pool.disks[0].fail_next(Direction::Read, 1);
    let zio = pool.pipeline.create_read(None, &bp, Args::new());
    let done = pool.pipeline.wait(zio).unwrap();

    assert_eq!(done.retries, 1);
    assert_eq!(pool.disks[0].reads(), 2);
    assert_eq!(done.data.unwrap(), data);
}

#[test]
fn exhausted_retries_fail_and_report() {
    let pool = pool(1);
    let bp = pool.write(random(4096), raw());

    pool.disks[0].fail_next(Direction::Read, 10);
    let err = pool.read(&bp).unwrap_err();

    assert_eq!(err.kind, Kind::Io);
    // The first attempt and one retry.
    assert_eq!(pool.disks[0].reads(), 2);
    assert_eq!(pool.faults.kinds(), [FaultKind::Io]);
}

#[test]
fn speculative_failures_are_not_reported() {
    let pool = pool(1);
    let bp = pool.write(random(4096), raw());

    pool.disks[0].fail_next(Direction::Read, 10);
    let zio = pool.pipeline.create_read(None, &bp, Args::new().flags(Flags::SPECULATIVE));
    assert_eq!(pool.pipeline.wait(zio).unwrap_err().kind, Kind::Io);

    assert!(pool.faults.kinds().is_empty());
}

#[test]
fn dont_retry() {
    let pool = pool(1);
    let bp = pool.write(random(4096), raw());

    pool.disks[0].fail_next(Direction::Read, 1);
    let zio = pool.pipeline.create_read(None, &bp, Args::new().flags(Flags::DONT_RETRY));
    assert_eq!(pool.pipeline.wait(zio).unwrap_err().kind, Kind::Io);
    assert_eq!(pool.disks[0].reads(), 1);
}

#[test]
fn corruption_detected() {
    let pool = pool(1);
    let bp = pool.write(random(4096), raw());

    pool.disks[0].corrupt(bp.locations[0].offset + 100, 1);
    assert_eq!(pool.read(&bp).unwrap_err().kind, Kind::Corruption);
    assert_eq!(pool.faults.kinds(), [FaultKind::Checksum]);
}

#[test]
fn free_hole_does_no_io() {
    let pool = pool(1);

    pool.free(&BlockPointer::hole()).unwrap();
    assert_eq!(pool.disks[0].reads(), 0);
    assert_eq!(pool.disks[0].writes(), 0);
}

#[test]
fn double_free() {
    let pool = pool(1);
    let bp = pool.write(random(4096), raw());

    pool.free(&bp).unwrap();
    assert_eq!(pool.space.allocated_bytes(), 0);
    assert_eq!(pool.free(&bp).unwrap_err().kind, Kind::Implementation);
}

#[test]
fn claim_after_free() {
    let pool = pool(1);
    let bp = pool.write(random(4096), raw());
    pool.free(&bp).unwrap();
    assert!(!pool.space.is_allocated(&bp.locations[0]));

    let zio = pool.pipeline.create_claim(None, &bp, 2, Args::new());
    pool.pipeline.wait(zio).unwrap();
    assert!(pool.space.is_allocated(&bp.locations[0]));

    // Claiming allocated space is a protocol violation.
    let zio = pool.pipeline.create_claim(None, &bp, 2, Args::new());
    assert_eq!(pool.pipeline.wait(zio).unwrap_err().kind, Kind::Implementation);
}

#[test]
fn mirror_heals_bad_copy() {
    let pool = pool(2);
    let data = random(4096);
    let bp = pool.write(data.clone(), WriteProps {
        copies: 2,
        ..raw()
    });
    assert_eq!(bp.copies(), 2);

    let loc = match bp.locations.iter().find(|loc| loc.vdev == 0) {
        Some(loc) => *loc,
        None => panic!("no copy on the first disk"),
    };
    pool.disks[0].corrupt(loc.offset, 4096);

    assert_eq!(pool.read(&bp).unwrap(), data);
    assert_eq!(pool.faults.kinds(), [FaultKind::Checksum]);
    // The read waits for the repair.
    assert_eq!(pool.disks[0].read_raw(loc.offset, 4096), data);
}

#[test]
fn mirror_write_survives_detached_disk() {
    let pool = pool(2);
    pool.disks[1].detach();

    let data = random(4096);
    let bp = pool.write(data.clone(), WriteProps {
        copies: 2,
        ..raw()
    });
    assert_eq!(pool.faults.kinds(), [FaultKind::Io]);
    assert_eq!(pool.read(&bp).unwrap(), data);

    let disk = pool.disks[1].clone();
    drop(pool);
    // The failing disk got probed.
    assert!(disk.reopens() >= 1);
}

#[test]
fn parent_completes_after_children() {
    let pool = pool(1);
    let events = Arc::new(Mutex::new(Vec::new()));

    let log = events.clone();
    let parent = pool.pipeline.create_null(None, Args::new().on_done(move |outcome| {
        assert!(outcome.error.is_none());
        log.lock().unwrap().push("parent");
    }));

    let children: Vec<_> = (0..2).map(|_| {
        let log = events.clone();
        pool.pipeline.create_write(Some(parent), &BlockPointer::hole(), random(4096), 1, raw(),
                                   Args::new().on_done(move |_| log.lock().unwrap().push("child")))
    }).collect();
    for child in children {
        pool.pipeline.submit(child);
    }

    pool.pipeline.wait(parent).unwrap();
    assert_eq!(*events.lock().unwrap(), ["child", "child", "parent"]);
}

#[test]
fn child_errors_propagate() {
    let pool = pool(1);
    let bp = pool.write(random(4096), raw());
    pool.free(&bp).unwrap();

    let parent = pool.pipeline.create_null(None, Args::new());
    let child = pool.pipeline.create_free(Some(parent), &bp, 1, Args::new());
    pool.pipeline.submit(child);
    assert_eq!(pool.pipeline.wait(parent).unwrap_err().kind, Kind::Implementation);

    let parent = pool.pipeline.create_null(None, Args::new());
    let child = pool.pipeline.create_free(None, &bp, 1, Args::new()
        .flags(Flags::DONT_PROPAGATE));
    pool.pipeline.attach_child(parent, child);
    pool.pipeline.submit(child);
    pool.pipeline.wait(parent).unwrap();
}

#[test]
fn ready_before_done() {
    let pool = pool(1);
    let ready = Arc::new(Mutex::new(None));

    let seen = ready.clone();
    let zio = pool.pipeline.create_write(None, &BlockPointer::hole(), random(4096), 1, raw(),
                                         Args::new().on_ready(move |_, bp| {
        *seen.lock().unwrap() = Some(bp.clone());
    }));
    let bp = pool.pipeline.wait(zio).unwrap().bp;

    assert_eq!(ready.lock().unwrap().as_ref(), Some(&bp));
}

#[test]
fn convergence() {
    let pool = pool(1);
    let data: Vec<u8> = (0..32 * 1024).map(|n| (n / 64) as u8).collect();
    let txg = 5;

    pool.pipeline.begin_pass(txg, 1);
    let zio = pool.pipeline.create_write(None, &BlockPointer::hole(), data.clone(), txg,
                                         WriteProps::default(), Args::new());
    let first = pool.pipeline.wait(zio).unwrap().bp;
    assert_eq!(first.compression, CompressionAlgorithm::Lz4);

    // From the rewrite pass on, an unchanged size overwrites in place.
    pool.pipeline.begin_pass(txg, 2);
    let zio = pool.pipeline.create_write(None, &first, data.clone(), txg, WriteProps::default(),
                                         Args::new());
    let second = pool.pipeline.wait(zio).unwrap().bp;
    assert_eq!(second.locations, first.locations);

    // From the no-compression pass on, compression is off.
    pool.pipeline.begin_pass(txg, 5);
    let zio = pool.pipeline.create_write(None, &second, data.clone(), txg, WriteProps::default(),
                                         Args::new());
    let third = pool.pipeline.wait(zio).unwrap().bp;
    assert_eq!(third.compression, CompressionAlgorithm::Off);
    assert_eq!(third.psize as usize, data.len());
    assert_ne!(third.locations, second.locations);

    assert_eq!(pool.read(&third).unwrap(), data);
}

#[test]
fn config_changes_wait_for_attached_children() {
    let pool = pool(1);
    let disk = pool.disks[0].clone();
    disk.hold();

    // Only the child is submitted; its root has not run yet.
    let root = pool.pipeline.create_null(None, Args::new());
    let child = pool.pipeline.create_write(Some(root), &BlockPointer::hole(), random(4096), 1,
                                           raw(), Args::new());
    pool.pipeline.submit(child);
    while disk.held() == 0 {
        thread::sleep(Duration::from_millis(1));
    }

    let passed = AtomicBool::new(false);
    let early = thread::scope(|scope| {
        scope.spawn(|| {
            pool.pipeline.begin_pass(1, 9);
            passed.store(true, Ordering::SeqCst);
        });

        thread::sleep(Duration::from_millis(100));
        let early = passed.load(Ordering::SeqCst);

        disk.release();
        pool.pipeline.wait(root).unwrap();
        early
    });

    assert!(!early, "the commit pass began under an in-flight write");
    assert!(passed.load(Ordering::SeqCst));
}

#[test]
fn flush_every_device() {
    let pool = pool(2);

    let zio = pool.pipeline.create_ioctl(None, None, Ioctl::Flush, Args::new());
    pool.pipeline.wait(zio).unwrap();
    assert_eq!(pool.disks[0].flushes(), 1);
    assert_eq!(pool.disks[1].flushes(), 1);

    let zio = pool.pipeline.create_ioctl(None, Some(1), Ioctl::Flush, Args::new());
    pool.pipeline.wait(zio).unwrap();
    assert_eq!(pool.disks[1].flushes(), 2);

    let zio = pool.pipeline.create_ioctl(None, Some(7), Ioctl::Flush, Args::new());
    assert_eq!(pool.pipeline.wait(zio).unwrap_err().kind, Kind::Unavailable);
}

#[test]
fn submit_async() {
    let pool = pool(1);
    let data = random(4096);

    let zio = pool.pipeline.create_write(None, &BlockPointer::hole(), data.clone(), 1, raw(),
                                         Args::new());
    let bp = futures::executor::block_on(pool.pipeline.submit_async(zio)).unwrap().bp;

    let zio = pool.pipeline.create_read(None, &bp, Args::new());
    let done = futures::executor::block_on(pool.pipeline.submit_async(zio)).unwrap();
    assert_eq!(done.data.unwrap(), data);
}

#[test]
fn invalid_arguments() {
    let pool = pool(1);

    let zio = pool.pipeline.create_write(None, &BlockPointer::hole(), Vec::new(), 1, raw(),
                                         Args::new());
    assert_eq!(pool.pipeline.wait(zio).unwrap_err().kind, Kind::Implementation);

    let zio = pool.pipeline.create_write(None, &BlockPointer::hole(), random(512), 1, WriteProps {
        copies: 4,
        ..raw()
    }, Args::new());
    assert_eq!(pool.pipeline.wait(zio).unwrap_err().kind, Kind::Implementation);

    let zio = pool.pipeline.create_write(None, &BlockPointer::hole(),
                                         vec![0; Options::default().max_block_size + 1], 1, raw(),
                                         Args::new());
    assert_eq!(pool.pipeline.wait(zio).unwrap_err().kind, Kind::Implementation);

    let bp = pool.write(random(4096), raw());
    let zio = pool.pipeline.create_rewrite(None, &bp, random(512), 1, Args::new());
    assert_eq!(pool.pipeline.wait(zio).unwrap_err().kind, Kind::Implementation);
    let zio = pool.pipeline.create_rewrite(None, &BlockPointer::hole(), random(512), 1,
                                           Args::new());
    assert_eq!(pool.pipeline.wait(zio).unwrap_err().kind, Kind::Implementation);

    // Nothing was allocated by the failed requests.
    assert_eq!(pool.space.allocated_bytes(), 4096);
}

#[test]
fn large_sectors_need_a_matching_allocator() {
    let disks = vec![Arc::new(MemoryDisk::new(DISK_SIZE, 12))];
    let options = Options {
        workers: 2,
        ..Options::default()
    };

    let space = SpaceMap::new(&[DISK_SIZE as u64], 512);
    match build(disks.clone(), space, options.clone()) {
        Err(err) => assert_eq!(err.kind, Kind::Implementation),
        Ok(_) => panic!("sectors larger than the allocation unit were accepted"),
    }

    let pool = build(disks, SpaceMap::new(&[DISK_SIZE as u64], 4096), options).unwrap();
    let first = random(1000);
    let second = random(1000);
    let a = pool.write(first.clone(), raw());
    let b = pool.write(second.clone(), raw());

    assert_eq!(b.locations[0].offset, 4096);
    assert_eq!(pool.read(&a).unwrap(), first);
    assert_eq!(pool.read(&b).unwrap(), second);
}

#[test]
fn failed_must_succeed_releases_waiter() {
    let pool = pool(1);
    let bp = pool.write(random(4096), raw());

    // The read fails on a worker, which does not survive it; the waiter still gets the error.
    pool.disks[0].fail_next(Direction::Read, 1);
    let zio = pool.pipeline.create_read(None, &bp, Args::new()
        .flags(Flags::MUST_SUCCEED | Flags::DONT_RETRY));
    assert_eq!(pool.pipeline.wait(zio).unwrap_err().kind, Kind::Io);
}

#[test]
#[should_panic]
fn must_succeed() {
    let pool = pool(1);
    // Larger than any block can be.
    let bp = BlockPointer {
        lsize: 1 << 30,
        ..BlockPointer::hole()
    };

    let zio = pool.pipeline.create_read(None, &bp, Args::new().flags(Flags::MUST_SUCCEED));
    let _ = pool.pipeline.wait(zio);
}
