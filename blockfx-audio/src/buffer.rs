//! Pre-allocated buffers: the output double buffer and the echo ring
//!
//! Both are sized once at construction and never grow; everything after that is
//! index arithmetic over fixed slices.

use crate::error::{AudioError, Result};
use crate::format::SampleFormat;

/// Allocate a zeroed vector, reporting failure instead of aborting
pub(crate) fn alloc_zeroed<T: Copy + Default>(len: usize) -> Result<Vec<T>> {
    let mut buffer = Vec::new();
    buffer
        .try_reserve_exact(len)
        .map_err(|_| AudioError::Allocation(len * std::mem::size_of::<T>()))?;
    buffer.resize(len, T::default());
    Ok(buffer)
}

/// Two equally sized output slots, toggled every produced block
///
/// A consumer may still be reading the slot handed out last time while the other
/// one is filled. `last` is the single source of truth for which slot is exposed.
pub struct DoubleBuffer {
    slots: [Vec<u8>; 2],
    last: usize,
}

impl DoubleBuffer {
    pub fn new(len: usize) -> Result<Self> {
        Ok(Self {
            slots: [alloc_zeroed(len)?, alloc_zeroed(len)?],
            // First toggle fills slot 0
            last: 1,
        })
    }

    /// Bytes per slot
    pub fn len(&self) -> usize {
        self.slots[0].len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Switch to the other slot and hand it out for filling
    pub fn toggle(&mut self) -> &mut [u8] {
        self.last ^= 1;
        &mut self.slots[self.last]
    }

    /// The most recently produced slot
    pub fn last(&self) -> &[u8] {
        &self.slots[self.last]
    }

    /// Index of the most recently produced slot
    pub fn last_index(&self) -> usize {
        self.last
    }

    /// Put both slots back to silence
    pub fn fill_silence(&mut self, format: &SampleFormat) {
        for slot in &mut self.slots {
            format.fill_silence(slot);
        }
    }
}

/// Fixed-capacity ring of 16-bit samples with an adjustable active length
///
/// Positions passed to [`read_at`](EchoRing::read_at) and
/// [`write_at`](EchoRing::write_at) wrap modulo the active length.
pub struct EchoRing {
    samples: Vec<i16>,
    len: usize,
}

impl EchoRing {
    pub fn new(capacity: usize) -> Result<Self> {
        let capacity = capacity.max(1);
        Ok(Self {
            samples: alloc_zeroed(capacity)?,
            len: capacity,
        })
    }

    pub fn capacity(&self) -> usize {
        self.samples.len()
    }

    /// Active length
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Change the active length (clamped to `1..=capacity`) and silence the unused tail
    pub fn set_len(&mut self, len: usize) {
        self.len = len.clamp(1, self.samples.len());
        self.samples[self.len..].fill(0);
    }

    #[inline]
    pub fn read_at(&self, pos: usize) -> i16 {
        self.samples[pos % self.len]
    }

    #[inline]
    pub fn write_at(&mut self, pos: usize, value: i16) {
        let len = self.len;
        self.samples[pos % len] = value;
    }

    pub fn clear(&mut self) {
        self.samples.fill(0);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_toggle_alternates_and_never_aliases() {
        let mut buffers = DoubleBuffer::new(4).unwrap();
        buffers.toggle().fill(1);
        assert_eq!(buffers.last_index(), 0);
        buffers.toggle().fill(2);
        assert_eq!(buffers.last_index(), 1);
        assert_eq!(buffers.last(), &[2, 2, 2, 2]);
        // The previous slot is untouched by filling the current one
        buffers.toggle();
        assert_eq!(buffers.last(), &[1, 1, 1, 1]);
    }

    #[test]
    fn test_fill_silence_uses_format_bias() {
        let mut buffers = DoubleBuffer::new(2).unwrap();
        let format = SampleFormat::new(8, false, 1, 8000).unwrap();
        buffers.fill_silence(&format);
        assert_eq!(buffers.last(), &[0x80, 0x80]);
    }

    #[test]
    fn test_ring_wraps_at_active_length() {
        let mut ring = EchoRing::new(8).unwrap();
        ring.set_len(3);
        ring.write_at(4, 99);
        assert_eq!(ring.read_at(1), 99);
        assert_eq!(ring.read_at(7), 99);
    }

    #[test]
    fn test_shrinking_ring_silences_tail() {
        let mut ring = EchoRing::new(4).unwrap();
        for pos in 0..4 {
            ring.write_at(pos, 5);
        }
        ring.set_len(2);
        ring.set_len(4);
        assert_eq!(ring.read_at(1), 5);
        assert_eq!(ring.read_at(2), 0);
        assert_eq!(ring.read_at(3), 0);
    }

    #[test]
    fn test_ring_length_is_bounded_by_capacity() {
        let mut ring = EchoRing::new(4).unwrap();
        ring.set_len(100);
        assert_eq!(ring.len(), 4);
        ring.set_len(0);
        assert_eq!(ring.len(), 1);
    }
}
