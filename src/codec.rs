//! Checksum and compression algorithms.
//!
//! These are pure functions over byte buffers. The pipeline never inspects the encoded bytes
//! itself; it only stores which algorithm produced them in the block pointer.

use std::convert::TryFrom;
use std::fmt;

use {lz4_compress, seahash};
use Error;

/// A whole-block checksum.
///
/// Four words wide, so that wider algorithms fit without changing the block pointer layout.
/// Narrower algorithms leave the trailing words zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Checksum(pub [u64; 4]);

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:016x}:{:016x}:{:016x}:{:016x}", self.0[0], self.0[1], self.0[2], self.0[3])
    }
}

/// A checksum algorithm configuration option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ChecksumAlgorithm {
    /// No checksum.
    ///
    /// Used for physical I/O whose integrity is checked by other means (e.g. the gang header,
    /// which embeds its own checksum).
    Off = 0,
    /// SeaHash checksum.
    ///
    /// SeaHash was designed for TFS, and is described [in this
    /// post](http://ticki.github.io/blog/seahash-explained/).
    SeaHash = 1,
}

impl ChecksumAlgorithm {
    /// Produce the checksum of the buffer through the algorithm.
    pub fn hash(self, buf: &[u8]) -> Checksum {
        match self {
            ChecksumAlgorithm::Off => Checksum::default(),
            ChecksumAlgorithm::SeaHash => Checksum([seahash::hash(buf), 0, 0, 0]),
        }
    }
}

impl Default for ChecksumAlgorithm {
    fn default() -> ChecksumAlgorithm {
        ChecksumAlgorithm::SeaHash
    }
}

impl TryFrom<u8> for ChecksumAlgorithm {
    type Error = Error;

    fn try_from(from: u8) -> Result<ChecksumAlgorithm, Error> {
        match from {
            0 => Ok(ChecksumAlgorithm::Off),
            1 => Ok(ChecksumAlgorithm::SeaHash),
            _ => Err(err!(Corruption, "invalid checksum algorithm {:x}", from)),
        }
    }
}

/// The result of compressing a buffer.
#[derive(Debug, PartialEq)]
pub enum Compressed {
    /// The buffer consists solely of zeros; it needs no storage at all.
    Empty,
    /// The buffer compressed into fewer bytes.
    Smaller(Vec<u8>),
    /// Compression did not reduce the size, so it should be stored raw.
    NoGain,
}

/// A compression algorithm configuration option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompressionAlgorithm {
    /// Identity function/compression disabled.
    Off = 0,
    /// LZ4 compression.
    ///
    /// LZ4 is a very fast LZ77-family compression algorithm. Like other LZ77 compressors, it is
    /// based on streaming data reduplication. The details are described
    /// [here](http://ticki.github.io/blog/how-lz4-works/).
    Lz4 = 1,
}

impl CompressionAlgorithm {
    /// Compress some data based on the compression option.
    ///
    /// An all-zero buffer compresses to `Compressed::Empty` regardless of the algorithm, as long
    /// as compression is enabled.
    pub fn compress(self, input: &[u8]) -> Compressed {
        match self {
            CompressionAlgorithm::Off => Compressed::NoGain,
            CompressionAlgorithm::Lz4 => {
                if input.iter().all(|&x| x == 0) {
                    return Compressed::Empty;
                }

                let compressed = lz4_compress::compress(input);
                if compressed.len() < input.len() {
                    Compressed::Smaller(compressed)
                } else {
                    Compressed::NoGain
                }
            },
        }
    }

    /// Decompress some data based on the compression option.
    ///
    /// `lsize` is the expected size of the output; a mismatch means the stored data is corrupt.
    pub fn decompress(self, input: &[u8], lsize: usize) -> Result<Vec<u8>, Error> {
        let out = match self {
            CompressionAlgorithm::Off => input.to_vec(),
            CompressionAlgorithm::Lz4 => lz4_compress::decompress(input)
                .map_err(|e| err!(Corruption, "unable to decompress lz4 data: {:?}", e))?,
        };

        if out.len() != lsize {
            return Err(err!(Corruption, "decompressed to {} bytes, expected {}", out.len(), lsize));
        }

        Ok(out)
    }
}

impl Default for CompressionAlgorithm {
    fn default() -> CompressionAlgorithm {
        CompressionAlgorithm::Lz4
    }
}

impl TryFrom<u8> for CompressionAlgorithm {
    type Error = Error;

    fn try_from(from: u8) -> Result<CompressionAlgorithm, Error> {
        match from {
            0 => Ok(CompressionAlgorithm::Off),
            1 => Ok(CompressionAlgorithm::Lz4),
            _ => Err(err!(Corruption, "invalid compression algorithm option {:x}", from)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seahash_fills_first_word() {
        let cksum = ChecksumAlgorithm::SeaHash.hash(b"to live or not to live");

        assert_eq!(cksum.0[0], seahash::hash(b"to live or not to live"));
        assert_eq!(&cksum.0[1..], &[0, 0, 0]);
        assert_eq!(ChecksumAlgorithm::Off.hash(b"anything"), Checksum::default());
    }

    #[test]
    fn compress_repetitive() {
        let input = b"abcdefgh".repeat(512);

        match CompressionAlgorithm::Lz4.compress(&input) {
            Compressed::Smaller(buf) => {
                assert!(buf.len() < input.len());
                assert_eq!(CompressionAlgorithm::Lz4.decompress(&buf, input.len()).unwrap(), input);
            },
            x => panic!("expected compression gain, got {:?}", x),
        }
    }

    #[test]
    fn compress_zeros_is_empty() {
        assert_eq!(CompressionAlgorithm::Lz4.compress(&[0; 4096]), Compressed::Empty);
        // Disabled compression never detects zero blocks.
        assert_eq!(CompressionAlgorithm::Off.compress(&[0; 4096]), Compressed::NoGain);
    }

    #[test]
    fn compress_incompressible() {
        let input = b"as6yhol.;jrew5tyuikbfewedfyjltre22459ba";

        assert_eq!(CompressionAlgorithm::Lz4.compress(input), Compressed::NoGain);
    }

    #[test]
    fn decompress_size_mismatch() {
        let input = b"abcdefgh".repeat(64);
        let buf = match CompressionAlgorithm::Lz4.compress(&input) {
            Compressed::Smaller(buf) => buf,
            x => panic!("expected compression gain, got {:?}", x),
        };

        let err = CompressionAlgorithm::Lz4.decompress(&buf, input.len() + 1).unwrap_err();
        assert_eq!(err.kind, ::Kind::Corruption);
    }

    #[test]
    fn algorithm_ids() {
        assert_eq!(ChecksumAlgorithm::try_from(1).unwrap(), ChecksumAlgorithm::SeaHash);
        assert_eq!(CompressionAlgorithm::try_from(0).unwrap(), CompressionAlgorithm::Off);
        assert!(ChecksumAlgorithm::try_from(9).is_err());
        assert!(CompressionAlgorithm::try_from(0xFF).is_err());
    }
}
