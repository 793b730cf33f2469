//! The gang stages.
//!
//! A block which cannot be allocated contiguously is split into up to `GANG_MEMBERS` smaller
//! members, each written as a block of its own, and described by a gang header which takes the
//! place of the block. Members may be gang blocks themselves.
//!
//! Reading, freeing, claiming and rewriting a gang block all start by fetching the header
//! (`assemble`), then fan out over the members (`issue`). Writes additionally write the header
//! once every member is written (`header`).

use std::sync::Arc;

use parking_lot::Mutex;

use blkptr::{BlockPointer, Location};
use codec::{ChecksumAlgorithm, CompressionAlgorithm};
use gang::{GangHeader, GANG_HEADER_SIZE, GANG_MEMBERS};
use zio::arena::{Milestone, Node};
use zio::request::{Flags, Io, IoType, Outcome, WriteProps};
use zio::stage::{Flow, StageSet};
use zio::{claim_pipeline, rewrite_pipeline, wait_for_children, Create, Shared};
use {Error, Kind};

/// The members written by a gang write, recursively.
///
/// This is what has to be given back if the write fails further up.
#[derive(Debug, Clone, PartialEq)]
pub struct GangTree {
    pub members: Vec<(BlockPointer, Option<GangTree>)>,
}

/// A member of the gang block being processed.
#[derive(Debug, Clone)]
pub struct Member {
    pub bp: BlockPointer,
    /// The gang tree of the member, if it is a gang block itself.
    pub tree: Option<GangTree>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    /// Nothing issued yet.
    Start,
    /// The header is being read.
    HeaderFetch,
    /// The header is decoded.
    Fetched,
    /// The members are issued.
    MembersIssued,
    /// The header write is issued.
    HeaderIssued,
}

/// The gang state of a request.
pub struct GangState {
    phase: Phase,
    /// The header, once fetched.
    header: Option<GangHeader>,
    /// The raw header, filled in by the header read.
    fetched: Arc<Mutex<Option<Vec<u8>>>>,
    /// The members, by slot.
    slots: Arc<Mutex<Vec<Option<Member>>>>,
    /// The data of the members, by slot, for reads.
    reads: Arc<Mutex<Vec<Option<Vec<u8>>>>>,
    /// The errors of member frees, held back until the header itself is freed.
    failed: Arc<Mutex<Option<Error>>>,
}

impl GangState {
    fn new() -> GangState {
        GangState {
            phase: Phase::Start,
            header: None,
            fetched: Arc::new(Mutex::new(None)),
            slots: Arc::new(Mutex::new(vec![None; GANG_MEMBERS])),
            reads: Arc::new(Mutex::new(vec![None; GANG_MEMBERS])),
            failed: Arc::new(Mutex::new(None)),
        }
    }

    /// The members recorded so far.
    pub fn members(&self) -> Vec<Member> {
        self.slots.lock().iter().filter_map(|slot| slot.clone()).collect()
    }

    /// The members recorded so far, with their slots.
    fn members_by_slot(&self) -> Vec<(usize, Member)> {
        self.slots.lock().iter().enumerate()
            .filter_map(|(slot, member)| member.clone().map(|member| (slot, member)))
            .collect()
    }

    /// The tree of the members written.
    pub fn tree(&self) -> GangTree {
        GangTree {
            members: self.members().into_iter().map(|m| (m.bp, m.tree)).collect(),
        }
    }
}

/// Round `x` up to a multiple of `to`.
fn round_up(x: usize, to: usize) -> usize {
    (x + to - 1) / to * to
}

/// The pointer through which a gang header is read and written.
fn header_bp(bp: &BlockPointer) -> BlockPointer {
    let locations = bp.locations.iter().map(|loc| Location {
        gang: false,
        ..*loc
    }).collect();

    BlockPointer::physical(locations, GANG_HEADER_SIZE as u32, bp.birth)
}

/// Check a gang header as read from one of its copies.
fn verify_header(raw: &[u8]) -> Result<(), Error> {
    GangHeader::decode(raw).map(|_| ())
}

/// Record the outcome of a member write into `slots`.
fn record(slots: &Arc<Mutex<Vec<Option<Member>>>>, slot: usize) -> impl FnOnce(&Outcome) + Send {
    let slots = slots.clone();
    move |outcome| {
        if outcome.error.is_none() {
            slots.lock()[slot] = Some(Member {
                bp: outcome.bp.clone(),
                tree: outcome.tree.clone(),
            });
        }
    }
}

/// Fetch and decode the gang header.
pub fn assemble(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    if io.gang.is_none() {
        io.gang = Some(GangState::new());
    }

    if phase(io) == Phase::Start {
        let fetched = match io.gang {
            Some(ref mut gang) => {
                gang.phase = Phase::HeaderFetch;
                gang.fetched.clone()
            },
            None => unreachable!(),
        };

        shared.spawn(node, Create::new(IoType::Read, header_bp(&io.bp), StageSet::READ)
            .data(vec![0; GANG_HEADER_SIZE])
            .txg(io.txg)
            .flags(Flags::PHYSICAL | Flags::GANG_CHILD)
            .verify(verify_header)
            .on_done(move |outcome| {
                if outcome.error.is_none() {
                    *fetched.lock() = outcome.data.clone();
                }
            }));
    }

    if wait_for_children(node, io, Milestone::Done) {
        return Flow::Stop;
    }
    if io.error.is_some() {
        return Flow::Continue;
    }

    let raw = gang(io).fetched.lock().take();
    let header = match raw {
        Some(raw) => GangHeader::decode(&raw),
        None => Err(err!(Implementation, "gang header read completed without data")),
    };
    let header = match header {
        Ok(header) => header,
        Err(err) => {
            io.fail(err);
            return Flow::Continue;
        },
    };

    if io.io_type == IoType::Read && header.payload_size() != io.stack.size() {
        io.fail(err!(Corruption, "gang header of {} covers {} bytes, expected {}", io.bp,
                     header.payload_size(), io.stack.size()));
        return Flow::Continue;
    }

    trace!(io.log, "gang header fetched"; "members" => header.present().count());
    let gang = gang_mut(io);
    gang.header = Some(header);
    gang.phase = Phase::Fetched;

    Flow::Continue
}

/// Issue the gang members.
pub fn issue(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    match io.io_type {
        IoType::Write if io.is_rewrite() => issue_rewrite(shared, node, io),
        IoType::Write => issue_write(shared, node, io),
        IoType::Read => issue_read(shared, node, io),
        IoType::Free | IoType::Claim => issue_free_claim(shared, node, io),
        IoType::Null | IoType::Ioctl => unreachable!(),
    }
}

/// Split a new block into members.
fn issue_write(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    let state = GangState::new();
    let slots = state.slots.clone();
    io.gang = Some(GangState {
        phase: Phase::MembersIssued,
        ..state
    });

    let data = io.stack.data().to_vec();
    let min = shared.options.min_extent;
    let props = WriteProps {
        checksum: io.bp.checksum_algorithm,
        compression: CompressionAlgorithm::Off,
        copies: io.props.copies,
    };

    let mut offset = 0;
    for slot in 0..GANG_MEMBERS {
        let remaining = data.len() - offset;
        if remaining == 0 {
            break;
        }

        if slot == GANG_MEMBERS - 1 {
            // The rest goes to a full write, which may gang again.
            let mut c = Create::new(IoType::Write, BlockPointer::hole(), StageSet::WRITE)
                .data(data[offset..].to_vec())
                .txg(io.txg)
                .flags(Flags::GANG_CHILD)
                .on_done(record(&slots, slot));
            c.props = props;
            shared.spawn(node, c);
            break;
        }

        let mut size = round_up(remaining / 2, min).max(min).min(remaining);
        let locations = loop {
            match shared.allocator.allocate(size, props.copies, io.txg) {
                Ok(locations) => break locations,
                Err(ref err) if err.kind == Kind::OutOfSpace && size > min => {
                    size = round_up(size / 2, min).max(min);
                },
                Err(err) => {
                    io.fail(err);
                    return Flow::Continue;
                },
            }
        };

        let bp = BlockPointer {
            lsize: size as u32,
            psize: size as u32,
            checksum_algorithm: props.checksum,
            checksum: Default::default(),
            compression: CompressionAlgorithm::Off,
            birth: io.txg,
            locations: locations,
        };
        trace!(io.log, "gang member allocated"; "slot" => slot, "bp" => %bp);

        // Recorded now, so that a failure gives the space back even if the member write fails.
        slots.lock()[slot] = Some(Member {
            bp: bp.clone(),
            tree: None,
        });

        let data = data[offset..offset + size].to_vec();
        shared.spawn(node, Create::new(IoType::Write, bp, StageSet::REWRITE)
            .data(data)
            .txg(io.txg)
            .flags(Flags::GANG_CHILD | Flags::IO_REWRITE)
            .on_done(record(&slots, slot)));

        offset += size;
    }

    Flow::Continue
}

/// Rewrite the members of a gang block in place.
fn issue_rewrite(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    let (header, slots) = {
        let gang = gang_mut(io);
        gang.phase = Phase::MembersIssued;
        (gang.header.clone(), gang.slots.clone())
    };
    let header = match header {
        Some(header) => header,
        None => unreachable!(),
    };

    if header.payload_size() != io.stack.size() {
        io.fail(err!(Implementation, "rewrite of {} bytes over a gang block of {}", io.stack.size(),
                     header.payload_size()));
        return Flow::Continue;
    }

    let data = io.stack.data().to_vec();
    let mut offset = 0;
    for (slot, member) in header.present() {
        let size = member.psize as usize;
        shared.spawn(node, Create::new(IoType::Write, member.clone(), rewrite_pipeline(member))
            .data(data[offset..offset + size].to_vec())
            .txg(io.txg)
            .flags(Flags::GANG_CHILD | Flags::IO_REWRITE)
            .on_done(record(&slots, slot)));
        offset += size;
    }

    Flow::Continue
}

/// Read the members and put them together.
fn issue_read(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    if phase(io) == Phase::Fetched {
        let (header, reads) = {
            let gang = gang_mut(io);
            gang.phase = Phase::MembersIssued;
            (gang.header.clone(), gang.reads.clone())
        };

        for (slot, member) in header.iter().flat_map(|header| header.present()) {
            let reads = reads.clone();
            shared.spawn(node, Create::new(IoType::Read, member.clone(), StageSet::READ)
                .data(vec![0; member.lsize as usize])
                .txg(io.txg)
                .flags(Flags::GANG_CHILD)
                .on_done(move |outcome| {
                    if outcome.error.is_none() {
                        reads.lock()[slot] = outcome.data.clone();
                    }
                }));
        }
    }

    if wait_for_children(node, io, Milestone::Done) {
        return Flow::Stop;
    }
    if io.error.is_some() {
        return Flow::Continue;
    }

    let reads = gang(io).reads.clone();
    let mut reads = reads.lock();
    let mut offset = 0;
    for member in reads.iter_mut().filter_map(|slot| slot.take()) {
        let end = offset + member.len();
        if end > io.stack.size() {
            break;
        }
        io.stack.data_mut()[offset..end].copy_from_slice(&member);
        offset = end;
    }

    if offset != io.stack.size() {
        io.fail(err!(Corruption, "gang members of {} do not add up to its size", io.bp));
    }

    Flow::Continue
}

/// Free or claim every member.
fn issue_free_claim(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    if phase(io) == Phase::Fetched {
        let (header, failed) = {
            let gang = gang_mut(io);
            gang.phase = Phase::MembersIssued;
            (gang.header.clone(), gang.failed.clone())
        };

        for (_, member) in header.iter().flat_map(|header| header.present()) {
            let c = match io.io_type {
                // A member which cannot be freed must not keep the header allocated, so its error
                // is only taken over once the header is freed.
                IoType::Free => {
                    let failed = failed.clone();
                    Create::new(IoType::Free, member.clone(), StageSet::FREE)
                        .flags(Flags::GANG_CHILD | Flags::DONT_PROPAGATE)
                        .on_done(move |outcome| {
                            if let Some(ref err) = outcome.error {
                                let mut failed = failed.lock();
                                *failed = Some(match failed.take() {
                                    Some(old) => old.worse(err.clone()),
                                    None => err.clone(),
                                });
                            }
                        })
                },
                _ => Create::new(IoType::Claim, member.clone(), claim_pipeline(member))
                    .flags(Flags::GANG_CHILD),
            };

            shared.spawn(node, c.txg(io.txg));
        }
    }

    // The header itself goes in the next stage, after every member.
    if wait_for_children(node, io, Milestone::Done) {
        return Flow::Stop;
    }

    Flow::Continue
}

/// Take the errors of the member frees of a gang free.
pub fn take_failed_members(io: &Io) -> Option<Error> {
    io.gang.as_ref().and_then(|gang| gang.failed.lock().take())
}

/// Write the gang header.
pub fn header(shared: &Arc<Shared>, node: &Node, io: &mut Io) -> Flow {
    if wait_for_children(node, io, Milestone::Done) {
        return Flow::Stop;
    }
    if io.error.is_some() {
        return Flow::Continue;
    }

    let mut header = gang(io).header.clone().unwrap_or_else(GangHeader::new);
    for (slot, member) in gang(io).members_by_slot() {
        if let Err(err) = header.set(slot, member.bp) {
            io.fail(err);
            return Flow::Continue;
        }
    }

    if !io.is_rewrite() {
        match shared.allocator.allocate(GANG_HEADER_SIZE, io.props.copies, io.txg) {
            Ok(locations) => {
                io.bp.locations = locations.into_iter().map(|loc| Location {
                    gang: true,
                    ..loc
                }).collect();
                io.allocated = true;
            },
            Err(err) => {
                io.fail(err);
                return Flow::Continue;
            },
        }
    }

    debug!(io.log, "writing gang header"; "bp" => %io.bp, "members" => header.present().count());
    let mut c = Create::new(IoType::Write, header_bp(&io.bp), StageSet::REWRITE)
        .data(header.encode())
        .txg(io.txg)
        .flags(Flags::PHYSICAL | Flags::GANG_CHILD | Flags::IO_REWRITE);
    c.props = WriteProps {
        checksum: ChecksumAlgorithm::Off,
        compression: CompressionAlgorithm::Off,
        copies: io.bp.copies(),
    };
    shared.spawn(node, c);
    gang_mut(io).phase = Phase::HeaderIssued;

    // The done stage waits for the header write.
    Flow::Continue
}

fn phase(io: &Io) -> Phase {
    io.gang.as_ref().map_or(Phase::Start, |gang| gang.phase)
}

fn gang(io: &Io) -> &GangState {
    match io.gang {
        Some(ref gang) => gang,
        None => panic!("gang stage without gang state"),
    }
}

fn gang_mut(io: &mut Io) -> &mut GangState {
    match io.gang {
        Some(ref mut gang) => gang,
        None => panic!("gang stage without gang state"),
    }
}
