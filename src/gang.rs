//! The gang block header format.
//!
//! When a block cannot be stored as one contiguous extent, it is split into up to `GANG_MEMBERS`
//! members, each stored (and pointed to) independently. The gang header is the 512 byte block
//! tying them together:
//!
//! | Bytes    | Content                                   |
//! |----------|-------------------------------------------|
//! | 0..384   | member block pointers (128 bytes each)    |
//! | 384..472 | zero filler                               |
//! | 472..480 | magic number                              |
//! | 480..512 | checksum; word 0 is SeaHash of 0..480     |
//!
//! Unused member slots are holes, and all members after the first hole must be holes as well.

use byteorder::{ByteOrder, LittleEndian};
use seahash;

use blkptr::{BlockPointer, BP_SIZE};
use Error;

/// The size (in bytes) of a gang header.
pub const GANG_HEADER_SIZE: usize = 512;
/// The maximal number of members of a gang block.
pub const GANG_MEMBERS: usize = 3;
/// The magic number identifying a gang header.
pub const GANG_MAGIC: u64 = 0x210da7ab10c7a11;
/// The offset of the magic number (start of the tail).
const TAIL_OFFSET: usize = 472;
/// The offset of the embedded checksum.
const CHECKSUM_OFFSET: usize = 480;

/// A decoded gang header.
#[derive(Debug, Clone, PartialEq)]
pub struct GangHeader {
    members: Vec<BlockPointer>,
}

impl GangHeader {
    /// Create a header with no members (every slot a hole).
    pub fn new() -> GangHeader {
        GangHeader {
            members: vec![BlockPointer::hole(); GANG_MEMBERS],
        }
    }

    /// Set the member of slot `slot`.
    pub fn set(&mut self, slot: usize, bp: BlockPointer) -> Result<(), Error> {
        if slot >= GANG_MEMBERS {
            return Err(err!(Implementation, "gang member slot {} exceeds maximum of {}", slot,
                            GANG_MEMBERS));
        }

        self.members[slot] = bp;
        Ok(())
    }

    /// Get the members, holes included.
    pub fn members(&self) -> &[BlockPointer] {
        &self.members
    }

    /// Iterate over the non-hole members and their slots.
    pub fn present(&self) -> impl Iterator<Item = (usize, &BlockPointer)> {
        self.members.iter().enumerate().filter(|&(_, bp)| !bp.is_hole())
    }

    /// The total physical size of the members.
    pub fn payload_size(&self) -> usize {
        self.members.iter().map(|bp| bp.lsize as usize).sum()
    }

    /// Encode the header.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = vec![0; GANG_HEADER_SIZE];

        for (n, bp) in self.members.iter().enumerate() {
            bp.encode(&mut buf[n * BP_SIZE..]);
        }

        LittleEndian::write_u64(&mut buf[TAIL_OFFSET..], GANG_MAGIC);
        let cksum = seahash::hash(&buf[..CHECKSUM_OFFSET]);
        LittleEndian::write_u64(&mut buf[CHECKSUM_OFFSET..], cksum);

        buf
    }

    /// Decode and verify a header.
    pub fn decode(buf: &[u8]) -> Result<GangHeader, Error> {
        if buf.len() != GANG_HEADER_SIZE {
            return Err(err!(Corruption, "gang header of {} bytes", buf.len()));
        }

        let magic = LittleEndian::read_u64(&buf[TAIL_OFFSET..]);
        if magic != GANG_MAGIC {
            return Err(err!(Corruption, "bad gang header magic {:x}", magic));
        }

        let expected = seahash::hash(&buf[..CHECKSUM_OFFSET]);
        let found = LittleEndian::read_u64(&buf[CHECKSUM_OFFSET..]);
        if expected != found || buf[CHECKSUM_OFFSET + 8..].iter().any(|&x| x != 0) {
            return Err(err!(Corruption, "gang header checksum mismatch (expected {:x}, found {:x})",
                            expected, found));
        }

        let mut members = Vec::with_capacity(GANG_MEMBERS);
        let mut seen_hole = false;
        for n in 0..GANG_MEMBERS {
            let bp = BlockPointer::decode(&buf[n * BP_SIZE..])?;

            if bp.is_hole() {
                seen_hole = true;
            } else if seen_hole {
                return Err(err!(Corruption, "gang member {} follows a hole", n));
            }

            members.push(bp);
        }

        Ok(GangHeader {
            members: members,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use blkptr::Location;
    use codec::{ChecksumAlgorithm, CompressionAlgorithm};

    fn member(offset: u64, size: u32) -> BlockPointer {
        let mut bp = BlockPointer::physical(vec![Location {
            vdev: 0,
            offset: offset,
            asize: size,
            gang: false,
        }], size, 7);
        bp.checksum_algorithm = ChecksumAlgorithm::SeaHash;
        bp.checksum = ChecksumAlgorithm::SeaHash.hash(&[offset as u8]);
        bp.compression = CompressionAlgorithm::Off;
        bp
    }

    #[test]
    fn encode_decode() {
        let mut header = GangHeader::new();
        header.set(0, member(0x1000, 0x800)).unwrap();
        header.set(1, member(0x4000, 0x400)).unwrap();

        let buf = header.encode();
        assert_eq!(buf.len(), GANG_HEADER_SIZE);
        assert_eq!(LittleEndian::read_u64(&buf[472..]), GANG_MAGIC);

        let decoded = GangHeader::decode(&buf).unwrap();
        assert_eq!(decoded, header);
        assert_eq!(decoded.present().count(), 2);
        assert_eq!(decoded.payload_size(), 0xC00);
    }

    #[test]
    fn too_many_members() {
        let mut header = GangHeader::new();

        assert_eq!(header.set(GANG_MEMBERS, member(0, 512)).unwrap_err().kind,
                   ::Kind::Implementation);
    }

    #[test]
    fn detect_corruption() {
        let mut header = GangHeader::new();
        header.set(0, member(0x1000, 0x800)).unwrap();

        let mut buf = header.encode();
        buf[3] ^= 1;
        assert_eq!(GangHeader::decode(&buf).unwrap_err().kind, ::Kind::Corruption);

        let mut buf = header.encode();
        buf[472] ^= 1;
        assert_eq!(GangHeader::decode(&buf).unwrap_err().kind, ::Kind::Corruption);

        assert!(GangHeader::decode(&[0; GANG_HEADER_SIZE]).is_err());
    }

    #[test]
    fn member_after_hole() {
        let mut header = GangHeader::new();
        header.set(1, member(0x1000, 0x800)).unwrap();

        assert!(GangHeader::decode(&header.encode()).is_err());
    }
}
