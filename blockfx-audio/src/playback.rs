//! Attachment of an upstream source to a consumer (mixer voice or effect)
//!
//! Tracks the unconsumed part of the source's current block and handles
//! refills, loop wraparound, detaching on exhaustion, and sources that keep
//! handing out empty blocks.

use std::ops::Range;

use tracing::warn;

use crate::source::{BufferStatus, SampleSource};

/// Empty blocks tolerated in a row before the rest of an output block is padded
const MAX_EMPTY_FETCHES: usize = 4;

/// State of the attached source after a refill attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fill {
    /// Unconsumed data is available
    Ready,
    /// A source is attached but produced nothing; pad the rest of this block
    Starved,
    /// Nothing is attached
    Idle,
}

pub(crate) struct Playback {
    source: Option<Box<dyn SampleSource>>,
    looping: bool,
    /// Unconsumed byte range of `source.buffer()`
    remaining: Range<usize>,
    more_data: bool,
    /// Bytes per unit the consumer counts in (a sample, or a packed word)
    unit: usize,
}

impl Playback {
    pub(crate) fn new(unit: usize) -> Self {
        Self {
            source: None,
            looping: false,
            remaining: 0..0,
            more_data: false,
            unit: unit.max(1),
        }
    }

    /// Attach `source` from its first sample
    pub(crate) fn start(&mut self, mut source: Box<dyn SampleSource>, looping: bool) {
        source.reset_buffer(false, 0);
        self.source = Some(source);
        self.looping = looping;
        self.remaining = 0..0;
        self.more_data = true;
    }

    pub(crate) fn stop(&mut self) {
        self.source = None;
        self.remaining = 0..0;
        self.more_data = false;
    }

    pub(crate) fn is_playing(&self) -> bool {
        self.source.is_some()
    }

    pub(crate) fn looping(&self) -> bool {
        self.looping
    }

    pub(crate) fn set_looping(&mut self, looping: bool) {
        self.looping = looping;
    }

    /// Ensure unconsumed data is available, fetching, looping or detaching as needed
    pub(crate) fn refill(&mut self) -> Fill {
        for _ in 0..MAX_EMPTY_FETCHES {
            if !self.remaining.is_empty() {
                return Fill::Ready;
            }
            if !self.more_data {
                match self.source.as_mut() {
                    Some(source) if self.looping => source.reset_buffer(false, 0),
                    _ => self.source = None,
                }
            }
            let Some(source) = self.source.as_mut() else {
                return Fill::Idle;
            };

            let status = source.get_buffer(false, 0);
            if status == BufferStatus::Error {
                warn!("source reported an error; detaching it");
                self.stop();
                return Fill::Idle;
            }
            let len = source.buffer().len() / self.unit * self.unit;
            self.remaining = 0..len;
            self.more_data = status == BufferStatus::MoreData;
        }

        if self.remaining.is_empty() {
            Fill::Starved
        } else {
            Fill::Ready
        }
    }

    /// Unconsumed units of the current block
    #[inline]
    pub(crate) fn remaining_units(&self) -> usize {
        self.remaining.len() / self.unit
    }

    /// Unconsumed bytes of the current block
    #[inline]
    pub(crate) fn data(&self) -> &[u8] {
        match &self.source {
            Some(source) => &source.buffer()[self.remaining.clone()],
            None => &[],
        }
    }

    #[inline]
    pub(crate) fn consume(&mut self, units: usize) {
        let bytes = (units * self.unit).min(self.remaining.len());
        self.remaining.start += bytes;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::format::SampleFormat;
    use crate::source::RawSample;

    fn sample(values: &[i32], chunk: usize) -> Box<dyn SampleSource> {
        let format = SampleFormat::signed16(1, 8000).unwrap();
        Box::new(
            RawSample::from_samples(values, format)
                .unwrap()
                .with_chunk_len(chunk),
        )
    }

    /// Always answers with an empty, unfinished block
    struct Stalled(SampleFormat);

    impl SampleSource for Stalled {
        fn format(&self) -> SampleFormat {
            self.0
        }
        fn reset_buffer(&mut self, _: bool, _: u8) {}
        fn get_buffer(&mut self, _: bool, _: u8) -> BufferStatus {
            BufferStatus::MoreData
        }
        fn buffer(&self) -> &[u8] {
            &[]
        }
    }

    /// Fails on the first pull
    struct Broken(SampleFormat);

    impl SampleSource for Broken {
        fn format(&self) -> SampleFormat {
            self.0
        }
        fn reset_buffer(&mut self, _: bool, _: u8) {}
        fn get_buffer(&mut self, _: bool, _: u8) -> BufferStatus {
            BufferStatus::Error
        }
        fn buffer(&self) -> &[u8] {
            &[]
        }
    }

    #[test]
    fn test_detaches_when_finished_without_loop() {
        let mut playback = Playback::new(2);
        playback.start(sample(&[1, 2], 4), false);
        assert_eq!(playback.refill(), Fill::Ready);
        assert_eq!(playback.remaining_units(), 2);
        playback.consume(2);
        assert_eq!(playback.refill(), Fill::Idle);
        assert!(!playback.is_playing());
    }

    #[test]
    fn test_loops_back_to_first_sample() {
        let mut playback = Playback::new(2);
        playback.start(sample(&[1, 2, 3], 4), true);
        let mut seen = Vec::new();
        for _ in 0..6 {
            assert_eq!(playback.refill(), Fill::Ready);
            seen.push(i16::from_le_bytes([playback.data()[0], playback.data()[1]]));
            playback.consume(1);
        }
        assert_eq!(seen, [1, 2, 3, 1, 2, 3]);
    }

    #[test]
    fn test_stalled_source_starves_without_spinning() {
        let format = SampleFormat::signed16(1, 8000).unwrap();
        let mut playback = Playback::new(2);
        playback.start(Box::new(Stalled(format)), false);
        assert_eq!(playback.refill(), Fill::Starved);
        assert!(playback.is_playing());
    }

    #[test]
    fn test_error_detaches() {
        let format = SampleFormat::signed16(1, 8000).unwrap();
        let mut playback = Playback::new(2);
        playback.start(Box::new(Broken(format)), true);
        assert_eq!(playback.refill(), Fill::Idle);
        assert!(!playback.is_playing());
    }

    #[test]
    fn test_partial_units_are_dropped() {
        let mut playback = Playback::new(4);
        // Three 16-bit samples = 6 bytes = one whole 4-byte word
        playback.start(sample(&[1, 2, 3], 64), false);
        assert_eq!(playback.refill(), Fill::Ready);
        assert_eq!(playback.remaining_units(), 1);
        assert_eq!(playback.data().len(), 4);
    }
}
