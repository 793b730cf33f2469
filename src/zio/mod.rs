//! The I/O pipeline.
//!
//! A request is created by one of the `create_*` methods, linked to an optional parent, and
//! started by `submit()` (or `wait()`/`submit_async()`). From then on it is driven through the
//! stages of its pipeline by whatever thread holds it: the submitting thread for cheap stages, a
//! worker for stages which may block, and a worker again whenever a device completes or the last
//! child the request was waiting on finishes.
//!
//! At most one thread drives a request at a time. Requests are only ever enqueued by the single
//! party which is allowed to resume them: the submitter, the device completion, or the child
//! whose completion ended a stall.

mod arena;
mod checksum;
mod compress;
mod done;
mod dva;
mod gang;
mod request;
mod stage;
mod transform;
mod vdev;

pub use self::arena::Handle;
pub use self::request::{Args, Completed, Flags, IoType, Ioctl, Outcome, Priority, WriteProps};

use std::collections::HashMap;
use std::sync::atomic::{self, AtomicBool};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Instant;

use crossbeam::channel::{self, Sender};
use futures::channel::oneshot;
use futures::{Future, FutureExt};
use parking_lot::{Condvar, Mutex};
use slog::Logger;

use alloc::Allocator;
use blkptr::{BlockPointer, Txg, MAX_COPIES};
use codec::CompressionAlgorithm;
use config::Options;
use disk::{self, Device};
use fault::{Fault, FaultKind, FaultReporter};
use pool::{ConfigLock, PoolConfig};
use worker::{self, Job};
use Error;

use self::arena::{Arena, Links, Milestone, Node};
use self::request::{DoneCallback, Io, ReadyCallback, Target, Verifier};
use self::stage::{Flow, Stage, StageSet};
use self::transform::TransformStack;

/// The parameters of a new request.
struct Create {
    io_type: IoType,
    bp: BlockPointer,
    /// The bottom buffer of the transform stack.
    data: Vec<u8>,
    size: usize,
    txg: Txg,
    props: WriteProps,
    flags: Flags,
    priority: Option<Priority>,
    pipeline: StageSet,
    target: Option<Target>,
    ioctl: Option<(Ioctl, Option<u32>)>,
    /// An error to start out with, for invalid arguments.
    error: Option<Error>,
    verifier: Option<Verifier>,
    on_ready: Option<ReadyCallback>,
    on_done: Option<DoneCallback>,
}

impl Create {
    fn new(io_type: IoType, bp: BlockPointer, pipeline: StageSet) -> Create {
        Create {
            io_type: io_type,
            bp: bp,
            data: Vec::new(),
            size: 0,
            txg: 0,
            props: WriteProps::default(),
            flags: Flags::empty(),
            priority: None,
            pipeline: pipeline,
            target: None,
            ioctl: None,
            error: None,
            verifier: None,
            on_ready: None,
            on_done: None,
        }
    }

    /// Set the payload.
    fn data(mut self, data: Vec<u8>) -> Create {
        self.size = data.len();
        self.data = data;
        self
    }

    fn txg(mut self, txg: Txg) -> Create {
        self.txg = txg;
        self
    }

    fn flags(mut self, flags: Flags) -> Create {
        self.flags |= flags;
        self
    }

    /// Check the data read with `verifier` rather than the block pointer's checksum.
    fn verify(mut self, verifier: Verifier) -> Create {
        self.verifier = Some(verifier);
        self
    }

    fn on_done<F: FnOnce(&Outcome) + Send + 'static>(mut self, f: F) -> Create {
        self.on_done = Some(Box::new(f));
        self
    }

    /// Take the flags, priority and callbacks of the caller's arguments.
    fn args(mut self, args: Args) -> Create {
        self.flags |= args.flags;
        self.priority = args.priority;
        self.on_ready = args.on_ready;
        self.on_done = args.on_done;
        self
    }

    /// Preset an error unless one is set already.
    fn invalid(mut self, err: Error) -> Create {
        if self.error.is_none() {
            self.error = Some(err);
        }
        self
    }
}

/// The pipeline for claims of `bp`.
fn claim_pipeline(bp: &BlockPointer) -> StageSet {
    if bp.is_hole() {
        StageSet::INTERLOCK
    } else if bp.is_gang() {
        StageSet::CLAIM | StageSet::GANG_ASSEMBLE | StageSet::GANG_ISSUE
    } else {
        StageSet::CLAIM
    }
}

/// The pipeline for in-place writes of `bp`.
fn rewrite_pipeline(bp: &BlockPointer) -> StageSet {
    if bp.is_gang() {
        (StageSet::REWRITE & !StageSet::VDEV_IO) | StageSet::GANG
    } else {
        StageSet::REWRITE
    }
}

/// Check that every device can be addressed at the allocator's granularity.
fn check_sectors(devices: &[Arc<dyn Device>], allocator: &dyn Allocator) -> Result<(), Error> {
    let granularity = allocator.granularity();
    for (vdev, device) in devices.iter().enumerate() {
        let sector = 1u64 << device.ashift();
        if sector > granularity {
            return Err(err!(Implementation, "device {} has sectors of {} bytes, but space is \
                                             allocated in units of {}", vdev, sector, granularity));
        }
    }

    Ok(())
}

/// State shared by the pipeline handle, the workers and the requests.
pub struct Shared {
    pub log: Logger,
    pub options: Options,
    arena: Arena<Node>,
    pub config: Arc<ConfigLock>,
    pub allocator: Arc<dyn Allocator>,
    pub reporter: Arc<dyn FaultReporter>,
    /// Device completions and synchronous requests.
    urgent: Sender<Job>,
    /// Everything else.
    normal: Sender<Job>,
    /// Is the pipeline shutting down?
    closing: AtomicBool,
    /// The number of submitted, uncompleted requests.
    inflight: Mutex<usize>,
    /// Signaled when `inflight` drops to zero.
    drained: Condvar,
    /// The last reopen probe of each device.
    probes: Mutex<HashMap<u32, Instant>>,
}

impl Shared {
    /// Create a request.
    fn create(&self, parent: Option<&Node>, mut c: Create) -> Arc<Node> {
        let mut priority = c.priority;
        if let Some(parent) = parent {
            c.flags |= parent.inherit;
            priority = priority.or(Some(parent.priority));
        }

        let priority = priority.unwrap_or(match c.io_type {
            IoType::Read => Priority::AsyncRead,
            IoType::Write | IoType::Free | IoType::Claim => Priority::AsyncWrite,
            IoType::Null | IoType::Ioctl => Priority::Now,
        });

        let node = self.arena.insert_with(|handle| {
            let log = self.log.new(o!("zio" => handle.to_string(),
                                      "type" => format!("{:?}", c.io_type)));

            Node {
                handle: handle,
                inherit: c.flags & Flags::INHERIT,
                priority: priority,
                io: Mutex::new(Io {
                    io_type: c.io_type,
                    priority: priority,
                    flags: c.flags,
                    stage: Stage::Open,
                    pipeline: c.pipeline,
                    bp: c.bp,
                    txg: c.txg,
                    props: c.props,
                    size: c.size,
                    stack: TransformStack::new(c.data, c.size),
                    error: c.error,
                    retries: 0,
                    target: c.target,
                    ioctl: c.ioctl,
                    device_result: None,
                    padded: false,
                    mirror: None,
                    gang: None,
                    allocated: false,
                    verifier: c.verifier,
                    on_ready: c.on_ready,
                    on_done: c.on_done,
                    promise: None,
                    log: log,
                }),
                links: Mutex::new(Links::default()),
                token: Mutex::new(None),
                done_cv: Condvar::new(),
            }
        });

        if let Some(parent) = parent {
            link(parent, &node);
        }

        node
    }

    /// Create a child of a running request and start it on a worker.
    fn spawn(&self, parent: &Node, c: Create) -> Handle {
        let child = self.create(Some(parent), c);
        debug!(self.log, "spawning child"; "parent" => %parent.handle, "child" => %child.handle);

        self.mark_submitted(&child);
        self.dispatch(child.handle, child.priority);

        child.handle
    }

    /// Queue a request for a worker.
    fn dispatch(&self, handle: Handle, priority: Priority) {
        let queue = if priority.is_urgent() {
            &self.urgent
        } else {
            &self.normal
        };

        // The workers outlive every request.
        let _ = queue.send(Job::Execute(handle));
    }

    /// Mark a request as submitted.
    ///
    /// # Panics
    ///
    /// A request can only be submitted once.
    fn mark_submitted(&self, node: &Node) {
        {
            let mut links = node.links.lock();
            assert!(!links.submitted, "request {} submitted twice", node.handle);
            links.submitted = true;
        }

        *self.inflight.lock() += 1;
    }

    /// Make sure the tree of `node` holds a configuration token.
    ///
    /// The token is kept by the root of the tree, from the first submission of any of its
    /// requests until the root completes.
    fn enter_tree(&self, node: &Arc<Node>) {
        let mut root = node.clone();
        loop {
            let parent = root.links.lock().parent;
            match parent {
                Some(parent) => root = self.node(parent),
                None => break,
            }
        }

        let mut token = root.token.lock();
        if token.is_none() {
            trace!(self.log, "taking configuration token"; "root" => %root.handle);
            *token = Some(ConfigLock::enter(&self.config));
        }
    }

    /// Account for a completed request.
    fn finished(&self) {
        let mut inflight = self.inflight.lock();
        *inflight = match inflight.checked_sub(1) {
            Some(n) => n,
            None => panic!("more requests completed than submitted"),
        };

        if *inflight == 0 {
            self.drained.notify_all();
        }
    }

    /// Wait until no request is in flight.
    fn wait_drained(&self) {
        let mut inflight = self.inflight.lock();
        while *inflight > 0 {
            self.drained.wait(&mut inflight);
        }
    }

    /// Look up a live request.
    ///
    /// # Panics
    ///
    /// The handle must refer to a request which has not been released.
    fn node(&self, handle: Handle) -> Arc<Node> {
        match self.arena.get(handle) {
            Some(node) => node,
            None => panic!("request {} does not exist (anymore)", handle),
        }
    }

    /// Look up a device.
    fn device(&self, vdev: u32) -> Option<Arc<dyn Device>> {
        self.config.read().device(vdev).cloned()
    }

    /// Report a fault, unless the request is speculative.
    fn report(&self, handle: Handle, io: &Io, kind: FaultKind, target: Option<Target>, err: &Error) {
        if io.flags.contains(Flags::SPECULATIVE) {
            return;
        }

        let target = target.or(io.target).or_else(|| io.bp.locations.first().map(Target::of));
        self.reporter.report(&Fault {
            kind: kind,
            zio: handle,
            io_type: io.io_type,
            vdev: target.map(|t| t.vdev),
            offset: target.map(|t| t.offset),
            size: io.size,
            txg: io.txg,
            error: err.clone(),
        });
    }

    /// Schedule a reopen probe of a device, unless one happened recently.
    fn probe(&self, vdev: u32) {
        let mut probes = self.probes.lock();
        let now = Instant::now();
        let due = match probes.get(&vdev) {
            Some(&last) => now.duration_since(last) >= self.options.probe_interval,
            None => true,
        };

        if due {
            debug!(self.log, "scheduling device probe"; "vdev" => vdev);
            probes.insert(vdev, now);
            let _ = self.normal.send(Job::Reopen(vdev));
        }
    }

    /// Try to reopen a device.
    pub fn reopen(&self, vdev: u32) {
        match self.device(vdev) {
            Some(device) => match device.reopen() {
                Ok(()) => info!(self.log, "device reopened"; "vdev" => vdev),
                Err(err) => info!(self.log, "device still unavailable"; "vdev" => vdev, "error" => %err),
            },
            None => warn!(self.log, "probing unknown device"; "vdev" => vdev),
        }
    }
}

/// Link `child` to `parent`.
///
/// # Panics
///
/// The child must be unsubmitted and without a parent, and the parent must not have completed.
fn link(parent: &Node, child: &Node) {
    assert!(parent.handle != child.handle, "request {} cannot be its own child", parent.handle);

    let mut parent_links = parent.links.lock();
    let mut child_links = child.links.lock();
    assert!(child_links.parent.is_none(), "request {} already has a parent", child.handle);
    assert!(!child_links.submitted, "request {} attached after being submitted", child.handle);

    let count_ready = !parent_links.reached_ready;
    parent_links.add_child(child.handle, count_ready);
    child_links.parent = Some(parent.handle);
    child_links.counted_ready = count_ready;
}

/// Notify the parent of `node` that it reached `milestone`.
///
/// If the parent was stalled on the milestone and this was the last child it waited for, the
/// parent is queued for a worker.
fn notify_parent(shared: &Shared, node: &Node, io: &Io, milestone: Milestone) {
    let (parent, counted_ready) = {
        let links = node.links.lock();
        (links.parent, links.counted_ready)
    };
    let parent = match parent {
        Some(parent) => shared.node(parent),
        None => return,
    };

    let error = match milestone {
        Milestone::Done if !io.flags.contains(Flags::DONT_PROPAGATE) => io.error.clone(),
        _ => None,
    };

    let resume = parent.links.lock().child_reached(node.handle, milestone, counted_ready, error);
    if resume {
        trace!(io.log, "resuming parent"; "parent" => %parent.handle, "milestone" => ?milestone);
        shared.dispatch(parent.handle, parent.priority);
    }
}

/// Stall the request until every child reached `milestone`.
///
/// Returns true if the request stalled, in which case the current stage is rewound so that it runs
/// again once the request is resumed. Otherwise, the children's errors are taken over.
fn wait_for_children(node: &Node, io: &mut Io, milestone: Milestone) -> bool {
    let mut links = node.links.lock();

    if links.stall_on(milestone) {
        trace!(io.log, "waiting for children"; "milestone" => ?milestone,
               "pending" => links.pending(milestone));
        io.stage = io.stage.prev();
        true
    } else {
        if let Some(err) = links.take_child_error() {
            io.fail(err);
        }
        false
    }
}

/// May this stage block?
///
/// Such stages only ever run on workers.
fn may_block(io: &Io, stage: Stage) -> bool {
    match stage {
        Stage::VdevIoStart => true,
        Stage::WriteBpInit => !io.flags.contains(Flags::METADATA)
            && io.props.compression != CompressionAlgorithm::Off,
        _ => false,
    }
}

/// Drive a request until it stalls, waits for a device, is handed to a worker or completes.
fn drive(shared: &Arc<Shared>, node: &Node, io: &mut Io) {
    loop {
        if let Some(err) = node.links.lock().take_child_error() {
            io.fail(err);
        }
        if io.error.is_none() && shared.closing.load(atomic::Ordering::SeqCst) {
            io.fail(err!(Cancelled, "the pipeline is shutting down"));
        }

        let enabled = if io.error.is_some() {
            io.pipeline & StageSet::ERROR_MASK
        } else {
            io.pipeline
        };
        let stage = match enabled.next_after(io.stage) {
            Some(stage) => stage,
            None => panic!("request {} has no stage after {:?} in {:?}", node.handle, io.stage,
                           enabled),
        };

        if may_block(io, stage) && !worker::on_worker_thread() {
            trace!(io.log, "handing off to worker"; "stage" => ?stage);
            shared.dispatch(node.handle, io.priority);
            return;
        }

        io.stage = stage;
        trace!(io.log, "entering stage"; "stage" => ?stage);

        let flow = match stage {
            Stage::Open => unreachable!(),
            Stage::ReadBpInit => compress::read_bp_init(io),
            Stage::FreeBpInit => compress::free_bp_init(io),
            Stage::WriteBpInit => compress::write_bp_init(shared, io),
            Stage::ChecksumGenerate => checksum::generate(io),
            Stage::DvaAllocate => dva::allocate(shared, io),
            Stage::GangAssemble => gang::assemble(shared, node, io),
            Stage::GangIssue => gang::issue(shared, node, io),
            Stage::GangHeader => gang::header(shared, node, io),
            Stage::DvaFree => dva::free(shared, io),
            Stage::DvaClaim => dva::claim(shared, io),
            Stage::Ready => done::ready(shared, node, io),
            Stage::VdevIoStart => vdev::io_start(shared, node, io),
            Stage::VdevIoDone => vdev::io_done(shared, node, io),
            Stage::VdevIoAssess => vdev::io_assess(shared, node, io),
            Stage::ChecksumVerify => checksum::verify(shared, node, io),
            Stage::Done => done::done(shared, node, io),
        };

        if flow == Flow::Stop {
            return;
        }
    }
}

/// Run a queued request.
pub fn execute(shared: &Arc<Shared>, handle: Handle) {
    let node = shared.node(handle);
    let mut io = node.io.lock();
    drive(shared, &node, &mut io);
}

/// Resume a request after its device operation completed.
pub fn interrupt(shared: &Arc<Shared>, handle: Handle, buf: Vec<u8>,
                 status: Result<(), disk::Error>) {
    let node = shared.node(handle);
    let mut io = node.io.lock();
    io.device_result = Some((buf, status));
    drive(shared, &node, &mut io);
}

/// The I/O pipeline.
pub struct Pipeline {
    shared: Arc<Shared>,
    workers: Vec<JoinHandle<()>>,
}

impl Pipeline {
    /// Start a pipeline.
    ///
    /// `devices` is the initial device table; the pool starts out syncing generation 1, pass 1.
    pub fn new(log: Logger, options: Options, devices: Vec<Arc<dyn Device>>,
               allocator: Arc<dyn Allocator>, reporter: Arc<dyn FaultReporter>)
               -> Result<Pipeline, Error> {
        options.validate()?;
        check_sectors(&devices, &*allocator)?;

        let (urgent, urgent_rx) = channel::unbounded();
        let (normal, normal_rx) = channel::unbounded();
        let workers = options.workers;
        let ndevices = devices.len();

        let shared = Arc::new(Shared {
            log: log,
            options: options,
            arena: Arena::new(),
            config: Arc::new(ConfigLock::new(PoolConfig {
                devices: devices,
                syncing_txg: 1,
                sync_pass: 1,
            })),
            allocator: allocator,
            reporter: reporter,
            urgent: urgent,
            normal: normal,
            closing: AtomicBool::new(false),
            inflight: Mutex::new(0),
            drained: Condvar::new(),
            probes: Mutex::new(HashMap::new()),
        });

        let workers = worker::spawn(&shared, workers, urgent_rx, normal_rx)?;
        info!(shared.log, "pipeline started"; "workers" => workers.len(), "devices" => ndevices);

        Ok(Pipeline {
            shared: shared,
            workers: workers,
        })
    }

    /// Create a request (with or without a parent) from the caller's side.
    fn request(&self, parent: Option<Handle>, mut c: Create) -> Handle {
        let parent = match parent {
            Some(handle) => match self.shared.arena.get(handle) {
                Some(node) => Some(node),
                None => {
                    c = c.invalid(err!(Implementation, "parent {} does not exist", handle));
                    None
                },
            },
            None => None,
        };

        self.shared.create(parent.as_ref().map(|node| &**node), c).handle
    }

    /// Check a block pointer handed in by the caller.
    fn check_bp(&self, bp: &BlockPointer) -> Result<(), Error> {
        if bp.locations.len() > MAX_COPIES {
            return Err(err!(Implementation, "block pointer with {} copies", bp.locations.len()));
        }
        if bp.lsize as usize > self.shared.options.max_block_size {
            return Err(err!(Implementation, "block of {} bytes exceeds the maximum", bp.lsize));
        }
        if !bp.is_hole() && (bp.psize == 0 || bp.psize > bp.lsize) {
            return Err(err!(Implementation, "block pointer with physical size {} and logical size {}",
                            bp.psize, bp.lsize));
        }
        if !bp.is_hole() && bp.compression == CompressionAlgorithm::Off && bp.psize != bp.lsize {
            return Err(err!(Implementation, "uncompressed block pointer with differing sizes"));
        }

        Ok(())
    }

    /// Create a request without I/O of its own.
    ///
    /// Its only purpose is to gather children: it completes when they have.
    pub fn create_null(&self, parent: Option<Handle>, args: Args) -> Handle {
        self.request(parent, Create::new(IoType::Null, BlockPointer::hole(), StageSet::INTERLOCK)
            .args(args))
    }

    /// Create a read of `bp`.
    ///
    /// The data is delivered in `Completed::data` (or `Outcome::data`).
    pub fn create_read(&self, parent: Option<Handle>, bp: &BlockPointer, args: Args) -> Handle {
        let mut c = Create::new(IoType::Read, bp.clone(), StageSet::READ)
            .txg(bp.birth)
            .args(args);

        match self.check_bp(bp) {
            Ok(()) => c = c.data(vec![0; bp.lsize as usize]),
            Err(err) => c = c.invalid(err),
        }

        self.request(parent, c)
    }

    /// Create a write of `data` in generation `txg`.
    ///
    /// `bp` is the block being overwritten (a hole for new blocks). It decides whether the write
    /// converges onto the old block during late commit passes.
    pub fn create_write(&self, parent: Option<Handle>, bp: &BlockPointer, data: Vec<u8>, txg: Txg,
                        props: WriteProps, args: Args) -> Handle {
        let mut c = Create::new(IoType::Write, bp.clone(), StageSet::WRITE)
            .data(data)
            .txg(txg)
            .args(args);
        c.props = props;

        if let Err(err) = self.check_bp(bp) {
            c = c.invalid(err);
        }
        let size = c.size;
        if size == 0 || size > self.shared.options.max_block_size {
            c = c.invalid(err!(Implementation, "cannot write a block of {} bytes", size));
        }
        if props.copies == 0 || props.copies > MAX_COPIES {
            c = c.invalid(err!(Implementation, "cannot write {} copies", props.copies));
        }

        self.request(parent, c)
    }

    /// Create a write of `data` in place of `bp`.
    ///
    /// `data` is the physical payload: it is neither compressed nor allocated, and must be exactly
    /// `bp.psize` bytes.
    pub fn create_rewrite(&self, parent: Option<Handle>, bp: &BlockPointer, data: Vec<u8>,
                          txg: Txg, args: Args) -> Handle {
        let mut c = Create::new(IoType::Write, bp.clone(), rewrite_pipeline(bp))
            .data(data)
            .txg(txg)
            .args(args)
            .flags(Flags::IO_REWRITE);
        c.props.copies = bp.copies();
        c.props.checksum = bp.checksum_algorithm;
        c.props.compression = bp.compression;

        if let Err(err) = self.check_bp(bp) {
            c = c.invalid(err);
        }
        if bp.is_hole() {
            c = c.invalid(err!(Implementation, "cannot rewrite a hole"));
        }
        let (size, psize) = (c.size, bp.psize);
        if size != psize as usize {
            c = c.invalid(err!(Implementation, "rewrite of {} bytes over a block of {}", size, psize));
        }

        self.request(parent, c)
    }

    /// Create a free of `bp`.
    pub fn create_free(&self, parent: Option<Handle>, bp: &BlockPointer, txg: Txg, args: Args)
                       -> Handle {
        let mut c = Create::new(IoType::Free, bp.clone(), StageSet::FREE)
            .txg(txg)
            .args(args);

        if let Err(err) = self.check_bp(bp) {
            c = c.invalid(err);
        }

        self.request(parent, c)
    }

    /// Create a claim of `bp`.
    pub fn create_claim(&self, parent: Option<Handle>, bp: &BlockPointer, txg: Txg, args: Args)
                        -> Handle {
        let mut c = Create::new(IoType::Claim, bp.clone(), claim_pipeline(bp))
            .txg(txg)
            .args(args);

        if let Err(err) = self.check_bp(bp) {
            c = c.invalid(err);
        }

        self.request(parent, c)
    }

    /// Create a device control request.
    ///
    /// Without a device, the operation goes to every device of the pool.
    pub fn create_ioctl(&self, parent: Option<Handle>, vdev: Option<u32>, ioctl: Ioctl, args: Args)
                        -> Handle {
        let mut c = Create::new(IoType::Ioctl, BlockPointer::hole(), StageSet::IOCTL).args(args);
        c.ioctl = Some((ioctl, vdev));

        self.request(parent, c)
    }

    /// Make `child` a child of `parent`.
    ///
    /// # Panics
    ///
    /// Both must exist, the child must be unsubmitted and without parent, and the parent must not
    /// have completed.
    pub fn attach_child(&self, parent: Handle, child: Handle) {
        let parent = self.shared.node(parent);
        let child = self.shared.node(child);

        link(&parent, &child);
    }

    /// Start a request.
    ///
    /// The cheap stages run on the calling thread, the rest on workers.
    pub fn submit(&self, handle: Handle) {
        let node = self.shared.node(handle);
        self.shared.mark_submitted(&node);
        self.shared.enter_tree(&node);

        if worker::on_worker_thread() {
            self.shared.dispatch(handle, node.priority);
        } else {
            let mut io = node.io.lock();
            drive(&self.shared, &node, &mut io);
        }
    }

    /// Start a request and block until it completes.
    ///
    /// # Panics
    ///
    /// This must not be called from a completion callback.
    pub fn wait(&self, handle: Handle) -> Result<Completed, Error> {
        assert!(!worker::on_worker_thread(), "waiting on request {} from a worker", handle);

        let node = self.shared.node(handle);
        node.links.lock().waiter = true;
        self.submit(handle);

        let result = {
            let mut links = node.links.lock();
            loop {
                if let Some(result) = links.result.take() {
                    break result;
                }
                node.done_cv.wait(&mut links);
            }
        };
        self.shared.arena.remove(handle);

        result
    }

    /// Start a request, returning a future resolving when it completes.
    pub fn submit_async(&self, handle: Handle) -> impl Future<Output = Result<Completed, Error>> {
        let (tx, rx) = oneshot::channel();
        self.shared.node(handle).io.lock().promise = Some(tx);
        self.submit(handle);

        rx.map(|res| match res {
            Ok(res) => res,
            Err(oneshot::Canceled) => Err(err!(Cancelled, "request dropped without completing")),
        })
    }

    /// Replace the device table.
    ///
    /// This waits for every request tree in flight to complete.
    pub fn reconfigure(&self, devices: Vec<Arc<dyn Device>>) -> Result<(), Error> {
        check_sectors(&devices, &*self.shared.allocator)?;

        info!(self.shared.log, "reconfiguring devices"; "devices" => devices.len());
        self.shared.config.write(|config| config.devices = devices);
        Ok(())
    }

    /// Enter commit pass `pass` of generation `txg`.
    ///
    /// This waits for every request tree in flight to complete.
    pub fn begin_pass(&self, txg: Txg, pass: u32) {
        debug!(self.shared.log, "beginning commit pass"; "txg" => txg, "pass" => pass);
        self.shared.config.write(|config| {
            config.syncing_txg = txg;
            config.sync_pass = pass;
        });
    }

    /// The number of live requests (created and not yet released).
    pub fn live_requests(&self) -> usize {
        self.shared.arena.len()
    }
}

impl Drop for Pipeline {
    fn drop(&mut self) {
        info!(self.shared.log, "stopping pipeline"; "live" => self.shared.arena.len());
        self.shared.closing.store(true, atomic::Ordering::SeqCst);

        // A panicking thread may have left requests behind which will never complete.
        if !thread::panicking() {
            self.shared.wait_drained();
        }

        for _ in 0..self.workers.len() {
            let _ = self.shared.normal.send(Job::Shutdown);
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}
