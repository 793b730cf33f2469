//! Block pointers.
//!
//! A block pointer contains everything needed to find, read and validate a block: its logical and
//! physical sizes, how it is compressed, its checksum, the generation it was born in, and up to
//! `MAX_COPIES` physical locations (one per copy).
//!
//! Block pointers have a fixed 128 byte on-disk representation, which is what gang headers are
//! made of. All integers are little-endian:
//!
//! | Bytes    | Content                                                             |
//! |----------|---------------------------------------------------------------------|
//! | 0..48    | three locations: vdev (u32), asize (u32), offset (u64, bit 63: gang) |
//! | 48..56   | logical size (u32), physical size (u32)                            |
//! | 56..60   | checksum algorithm, compression algorithm, number of copies, zero    |
//! | 64..72   | birth generation                                                     |
//! | 96..128  | checksum                                                             |
//!
//! Everything else is reserved and zero.

use std::convert::TryFrom;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use codec::{Checksum, ChecksumAlgorithm, CompressionAlgorithm};
use Error;

/// A transaction id (also known as write generation).
pub type Txg = u64;

/// The maximal number of copies (physical locations) of a block.
pub const MAX_COPIES: usize = 3;
/// The size (in bytes) of a serialized block pointer.
pub const BP_SIZE: usize = 128;
/// The size (in bytes) of a serialized location.
const LOCATION_SIZE: usize = 16;
/// The gang bit of the serialized offset word.
const GANG_BIT: u64 = 1 << 63;

/// A physical location of a block.
///
/// The term is equivalent to a DVA in ZFS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location {
    /// The index of the device in the pool configuration.
    pub vdev: u32,
    /// The byte offset on the device.
    pub offset: u64,
    /// The allocated size (in bytes).
    ///
    /// This is the physical size rounded up to the allocation granularity.
    pub asize: u32,
    /// Does this location point to a gang header rather than the data itself?
    pub gang: bool,
}

impl Location {
    /// Encode the location into a 16 byte buffer.
    fn encode(&self, into: &mut [u8]) {
        debug_assert!(self.offset & GANG_BIT == 0, "location offset overlaps the gang bit");

        LittleEndian::write_u32(&mut into[0..], self.vdev);
        LittleEndian::write_u32(&mut into[4..], self.asize);
        LittleEndian::write_u64(&mut into[8..], self.offset | if self.gang { GANG_BIT } else { 0 });
    }

    /// Decode a location, returning `None` for an empty slot.
    fn decode(from: &[u8]) -> Option<Location> {
        let asize = LittleEndian::read_u32(&from[4..]);
        if asize == 0 {
            // Empty slot.
            return None;
        }

        let word = LittleEndian::read_u64(&from[8..]);
        Some(Location {
            vdev: LittleEndian::read_u32(from),
            offset: word & !GANG_BIT,
            asize: asize,
            gang: word & GANG_BIT != 0,
        })
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}:{:x}:{:x}{}", self.vdev, self.offset, self.asize, if self.gang { "G" } else { "" })
    }
}

/// A block pointer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BlockPointer {
    /// The logical (uncompressed) size of the block.
    pub lsize: u32,
    /// The physical (on-disk, possibly compressed) size of the block.
    ///
    /// This is only smaller than `lsize` when `compression` is not `Off`.
    pub psize: u32,
    /// The algorithm `checksum` was computed through.
    pub checksum_algorithm: ChecksumAlgorithm,
    /// The checksum of the physical data.
    pub checksum: Checksum,
    /// The compression algorithm the physical data is encoded with.
    pub compression: CompressionAlgorithm,
    /// The generation the block was (or will be) committed in.
    pub birth: Txg,
    /// The physical locations, one per copy.
    ///
    /// Empty for holes.
    pub locations: Vec<Location>,
}

impl BlockPointer {
    /// A hole: a logical placeholder without physical backing.
    pub fn hole() -> BlockPointer {
        BlockPointer {
            checksum_algorithm: ChecksumAlgorithm::Off,
            compression: CompressionAlgorithm::Off,
            ..BlockPointer::default()
        }
    }

    /// A pointer to raw physical data, without compression or checksum.
    ///
    /// This is used for I/O on gang headers, which carry their own embedded checksum.
    pub fn physical(locations: Vec<Location>, size: u32, birth: Txg) -> BlockPointer {
        BlockPointer {
            lsize: size,
            psize: size,
            birth: birth,
            locations: locations,
            ..BlockPointer::hole()
        }
    }

    /// Is this pointer a hole?
    pub fn is_hole(&self) -> bool {
        self.locations.is_empty()
    }

    /// Does this pointer point to a gang header?
    pub fn is_gang(&self) -> bool {
        self.locations.iter().any(|loc| loc.gang)
    }

    /// The number of copies.
    pub fn copies(&self) -> usize {
        self.locations.len()
    }

    /// Encode the block pointer into its 128 byte representation.
    ///
    /// # Panics
    ///
    /// This panics if `into` is shorter than `BP_SIZE` or the pointer has more than `MAX_COPIES`
    /// locations.
    pub fn encode(&self, into: &mut [u8]) {
        assert!(self.locations.len() <= MAX_COPIES, "too many copies in block pointer");

        // Zero the whole thing first; unused slots and reserved bytes must be zero.
        for i in &mut into[..BP_SIZE] {
            *i = 0;
        }

        for (n, loc) in self.locations.iter().enumerate() {
            loc.encode(&mut into[n * LOCATION_SIZE..]);
        }

        LittleEndian::write_u32(&mut into[48..], self.lsize);
        LittleEndian::write_u32(&mut into[52..], self.psize);
        into[56] = self.checksum_algorithm as u8;
        into[57] = self.compression as u8;
        into[58] = self.locations.len() as u8;
        LittleEndian::write_u64(&mut into[64..], self.birth);
        for (n, &word) in self.checksum.0.iter().enumerate() {
            LittleEndian::write_u64(&mut into[96 + n * 8..], word);
        }
    }

    /// Decode a block pointer from its 128 byte representation.
    pub fn decode(from: &[u8]) -> Result<BlockPointer, Error> {
        if from.len() < BP_SIZE {
            return Err(err!(Corruption, "block pointer truncated to {} bytes", from.len()));
        }

        let copies = from[58] as usize;
        if copies > MAX_COPIES {
            return Err(err!(Corruption, "block pointer claims {} copies", copies));
        }

        let mut locations = Vec::with_capacity(copies);
        for n in 0..copies {
            match Location::decode(&from[n * LOCATION_SIZE..]) {
                Some(loc) => locations.push(loc),
                None => return Err(err!(Corruption, "block pointer copy {} is empty", n)),
            }
        }

        let mut checksum = Checksum::default();
        for (n, word) in checksum.0.iter_mut().enumerate() {
            *word = LittleEndian::read_u64(&from[96 + n * 8..]);
        }

        Ok(BlockPointer {
            lsize: LittleEndian::read_u32(&from[48..]),
            psize: LittleEndian::read_u32(&from[52..]),
            checksum_algorithm: ChecksumAlgorithm::try_from(from[56])?,
            checksum: checksum,
            compression: CompressionAlgorithm::try_from(from[57])?,
            birth: LittleEndian::read_u64(&from[64..]),
            locations: locations,
        })
    }
}

impl fmt::Display for BlockPointer {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if self.is_hole() {
            return write!(f, "<hole L{:x}>", self.lsize);
        }

        for loc in &self.locations {
            write!(f, "[{}] ", loc)?;
        }
        write!(f, "L{:x}/P{:x} {:?}/{:?} birth={} cksum={}", self.lsize, self.psize,
               self.compression, self.checksum_algorithm, self.birth, self.checksum)
    }
}
