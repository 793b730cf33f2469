//! The buffer transform stack.
//!
//! A request's payload passes through several representations (raw, compressed, padded to the
//! sector size). Each is an entry on the stack, the top being the active one. Popping an entry
//! optionally applies its inverse transform into the entry below, which is how read data finds
//! its way from the device buffer back to the caller's buffer.

use std::mem;

use codec::CompressionAlgorithm;
use Error;

/// How to get from an entry back to the one below it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Unwind {
    /// Nothing to do; the entry is an encoding of the lower entry, which is still intact.
    Keep,
    /// The lower entry's data is the sub-block of this one starting at `skip`.
    Subblock {
        /// The number of leading bytes of padding.
        skip: usize,
    },
    /// The lower entry's data is the decompression of this one.
    Decompress(CompressionAlgorithm),
}

/// An entry of the transform stack.
#[derive(Debug)]
pub struct Transform {
    /// The buffer. Its length is the capacity of the entry.
    buf: Vec<u8>,
    /// The length of the data in the buffer.
    size: usize,
    /// The inverse transform.
    unwind: Unwind,
}

impl Transform {
    /// The data of the entry.
    pub fn data(&self) -> &[u8] {
        &self.buf[..self.size]
    }

    /// Apply the inverse transform into the entry below.
    fn apply(&self, lower: &mut Transform) -> Result<(), Error> {
        match self.unwind {
            Unwind::Keep => Ok(()),
            Unwind::Subblock { skip } => {
                let size = lower.size;
                lower.buf[..size].copy_from_slice(&self.buf[skip..skip + size]);
                Ok(())
            },
            Unwind::Decompress(algorithm) => {
                let size = lower.size;
                let out = algorithm.decompress(self.data(), size)?;
                lower.buf[..size].copy_from_slice(&out);
                Ok(())
            },
        }
    }
}

/// A stack of buffer representations.
///
/// The stack is never empty while the request is alive; the bottom entry is the caller's buffer.
#[derive(Debug)]
pub struct TransformStack {
    entries: Vec<Transform>,
}

impl TransformStack {
    /// Create a stack with the caller's buffer at the bottom.
    pub fn new(buf: Vec<u8>, size: usize) -> TransformStack {
        assert!(size <= buf.len(), "transform larger than its buffer");

        TransformStack {
            entries: vec![Transform {
                buf: buf,
                size: size,
                unwind: Unwind::Keep,
            }],
        }
    }

    /// Make `buf` the active buffer.
    pub fn push(&mut self, buf: Vec<u8>, size: usize, unwind: Unwind) {
        assert!(size <= buf.len(), "transform larger than its buffer");

        self.entries.push(Transform {
            buf: buf,
            size: size,
            unwind: unwind,
        });
    }

    /// Remove the active entry, making the one below active.
    ///
    /// # Panics
    ///
    /// The bottom entry can only be removed through `clear()`.
    pub fn pop(&mut self) -> Transform {
        assert!(self.entries.len() > 1, "popping the bottom of the transform stack");
        match self.entries.pop() {
            Some(top) => top,
            None => unreachable!(),
        }
    }

    /// Remove the active entry, applying its inverse transform to the one below.
    pub fn pop_apply(&mut self) -> Result<(), Error> {
        let top = self.pop();
        let lower = self.top_mut();
        top.apply(lower)
    }

    /// Pop every entry but the bottom one.
    ///
    /// If `apply` is set, the inverse transforms are applied on the way. The first error is
    /// returned, but every entry is popped regardless.
    pub fn unwind(&mut self, apply: bool) -> Result<(), Error> {
        let mut res = Ok(());
        while self.entries.len() > 1 {
            if apply && res.is_ok() {
                res = self.pop_apply();
            } else {
                self.pop();
            }
        }

        res
    }

    /// Empty the stack, returning the bottom buffer.
    ///
    /// This is done when the request completes, so no buffer outlives it.
    pub fn clear(&mut self) -> Option<Vec<u8>> {
        let bottom = if self.entries.is_empty() {
            None
        } else {
            let mut bottom = self.entries.swap_remove(0);
            bottom.buf.truncate(bottom.size);
            Some(bottom.buf)
        };
        self.entries.clear();

        bottom
    }

    /// The active data.
    pub fn data(&self) -> &[u8] {
        self.top().data()
    }

    /// The active data, mutably.
    pub fn data_mut(&mut self) -> &mut [u8] {
        let top = self.top_mut();
        &mut top.buf[..top.size]
    }

    /// The length of the active data.
    pub fn size(&self) -> usize {
        self.top().size
    }

    /// The number of entries.
    #[cfg(test)]
    pub fn depth(&self) -> usize {
        self.entries.len()
    }

    /// Take the active buffer out, e.g. to hand it to a device.
    ///
    /// It must be given back through `restore()` before the stack is used otherwise.
    pub fn lend(&mut self) -> Vec<u8> {
        let top = self.top_mut();
        let mut buf = mem::replace(&mut top.buf, Vec::new());
        buf.truncate(top.size);
        buf
    }

    /// Give back a lent buffer.
    pub fn restore(&mut self, buf: Vec<u8>) {
        let top = self.top_mut();
        assert!(top.buf.is_empty(), "restoring a buffer which was never lent");
        assert_eq!(buf.len(), top.size, "lent buffer changed size");
        top.buf = buf;
    }

    fn top(&self) -> &Transform {
        match self.entries.last() {
            Some(top) => top,
            None => panic!("transform stack used after being cleared"),
        }
    }

    fn top_mut(&mut self) -> &mut Transform {
        match self.entries.last_mut() {
            Some(top) => top,
            None => panic!("transform stack used after being cleared"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use codec::Compressed;

    #[test]
    fn subblock() {
        let mut stack = TransformStack::new(vec![0; 4], 4);
        stack.push(vec![9, 9, 1, 2, 3, 4, 9, 9], 8, Unwind::Subblock { skip: 2 });
        assert_eq!(stack.depth(), 2);

        stack.pop_apply().unwrap();
        assert_eq!(stack.data(), [1, 2, 3, 4]);
    }

    #[test]
    fn decompress() {
        let raw = b"reading is fun, reading is fun, reading is fun".to_vec();
        let compressed = match CompressionAlgorithm::Lz4.compress(&raw) {
            Compressed::Smaller(buf) => buf,
            x => panic!("expected compression gain, got {:?}", x),
        };

        let mut stack = TransformStack::new(vec![0; raw.len()], raw.len());
        let size = compressed.len();
        stack.push(compressed, size, Unwind::Decompress(CompressionAlgorithm::Lz4));
        stack.unwind(true).unwrap();

        assert_eq!(stack.clear().unwrap(), raw);
    }

    #[test]
    fn unwind_without_apply() {
        let mut stack = TransformStack::new(vec![5; 4], 4);
        stack.push(vec![0xFF; 3], 3, Unwind::Decompress(CompressionAlgorithm::Lz4));
        stack.push(vec![0; 512], 512, Unwind::Subblock { skip: 0 });

        stack.unwind(false).unwrap();
        assert_eq!(stack.depth(), 1);
        assert_eq!(stack.data(), [5; 4]);
    }

    #[test]
    fn unwind_error_still_pops_everything() {
        let raw = vec![7; 128];
        let compressed = match CompressionAlgorithm::Lz4.compress(&raw) {
            Compressed::Smaller(buf) => buf,
            x => panic!("expected compression gain, got {:?}", x),
        };

        // The bottom buffer is too small for the decompressed data.
        let mut stack = TransformStack::new(vec![0; 64], 64);
        let size = compressed.len();
        stack.push(compressed, size, Unwind::Decompress(CompressionAlgorithm::Lz4));
        stack.push(vec![0; 512], 512, Unwind::Keep);

        assert!(stack.unwind(true).is_err());
        assert_eq!(stack.depth(), 1);
    }

    #[test]
    fn lend_restore() {
        let mut stack = TransformStack::new(vec![1, 2, 3], 3);

        let buf = stack.lend();
        assert_eq!(buf, [1, 2, 3]);
        stack.restore(buf);
        assert_eq!(stack.data(), [1, 2, 3]);
    }

    #[test]
    fn clear() {
        let mut stack = TransformStack::new(vec![1, 2, 3, 4], 2);
        stack.push(vec![0; 8], 8, Unwind::Keep);

        assert_eq!(stack.clear(), Some(vec![1, 2]));
        assert_eq!(stack.depth(), 0);
        assert_eq!(stack.clear(), None);
    }

    #[test]
    #[should_panic]
    fn pop_bottom() {
        TransformStack::new(vec![0; 4], 4).pop();
    }
}
