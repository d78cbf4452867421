//! The pull contract every playable object implements, plus the in-memory raw sample

use std::ops::Range;

use crate::error::Result;
use crate::format::SampleFormat;

/// Outcome of asking a source for its next block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferStatus {
    /// Further calls will yield more samples
    MoreData,
    /// This is the final block
    Done,
    /// Playback of this source must be abandoned
    Error,
}

/// Anything that can be pulled for blocks of samples: raw samples and effects alike
///
/// A consumer calls [`get_buffer`](SampleSource::get_buffer) and then borrows the
/// produced bytes through [`buffer`](SampleSource::buffer). The bytes stay valid until
/// the next `get_buffer` or `reset_buffer` call on the same source.
pub trait SampleSource: Send {
    /// Format of the bytes this source produces
    fn format(&self) -> SampleFormat;

    /// Rewind to the start; used for restarts and loop wraparound
    fn reset_buffer(&mut self, single_channel_output: bool, channel: u8);

    /// Produce the next block
    fn get_buffer(&mut self, single_channel_output: bool, channel: u8) -> BufferStatus;

    /// Bytes produced by the last `get_buffer` call
    fn buffer(&self) -> &[u8];

    /// `get_buffer` followed by `buffer`
    fn pull(&mut self, single_channel_output: bool, channel: u8) -> (BufferStatus, &[u8]) {
        let status = self.get_buffer(single_channel_output, channel);
        (status, self.buffer())
    }
}

impl<S: SampleSource + ?Sized> SampleSource for Box<S> {
    fn format(&self) -> SampleFormat {
        (**self).format()
    }

    fn reset_buffer(&mut self, single_channel_output: bool, channel: u8) {
        (**self).reset_buffer(single_channel_output, channel)
    }

    fn get_buffer(&mut self, single_channel_output: bool, channel: u8) -> BufferStatus {
        (**self).get_buffer(single_channel_output, channel)
    }

    fn buffer(&self) -> &[u8] {
        (**self).buffer()
    }
}

/// In-memory sample data played from start to end
///
/// By default the whole sample is handed out as one block with [`BufferStatus::Done`].
/// With [`with_chunk_len`](RawSample::with_chunk_len) it is handed out in fixed-size
/// chunks, every chunk but the last reporting [`BufferStatus::MoreData`].
pub struct RawSample {
    data: Vec<u8>,
    format: SampleFormat,
    chunk_len: Option<usize>,
    cursor: usize,
    current: Range<usize>,
}

impl RawSample {
    /// Wrap already-encoded bytes
    pub fn new(data: Vec<u8>, format: SampleFormat) -> Result<Self> {
        format.validate()?;
        Ok(Self {
            data,
            format,
            chunk_len: None,
            cursor: 0,
            current: 0..0,
        })
    }

    /// Encode signed values (native range of `format`) into a new sample
    pub fn from_samples(samples: &[i32], format: SampleFormat) -> Result<Self> {
        format.validate()?;
        let mut data = vec![0u8; samples.len() * format.bytes_per_sample()];
        for (i, &value) in samples.iter().enumerate() {
            format.write(&mut data, i, value);
        }
        Self::new(data, format)
    }

    /// Hand the data out in blocks of at most `bytes` bytes
    pub fn with_chunk_len(mut self, bytes: usize) -> Self {
        self.chunk_len = Some(bytes.max(1));
        self
    }

    /// Total length in bytes
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl SampleSource for RawSample {
    fn format(&self) -> SampleFormat {
        self.format
    }

    fn reset_buffer(&mut self, _single_channel_output: bool, _channel: u8) {
        self.cursor = 0;
        self.current = 0..0;
    }

    fn get_buffer(&mut self, _single_channel_output: bool, _channel: u8) -> BufferStatus {
        let end = match self.chunk_len {
            Some(chunk) => (self.cursor + chunk).min(self.data.len()),
            None => self.data.len(),
        };
        self.current = self.cursor..end;
        self.cursor = end;

        if self.cursor >= self.data.len() {
            BufferStatus::Done
        } else {
            BufferStatus::MoreData
        }
    }

    fn buffer(&self) -> &[u8] {
        &self.data[self.current.clone()]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn mono16() -> SampleFormat {
        SampleFormat::signed16(1, 8000).unwrap()
    }

    #[test]
    fn test_whole_sample_is_one_done_block() {
        let mut sample = RawSample::from_samples(&[1, 2, 3], mono16()).unwrap();
        let (status, bytes) = sample.pull(false, 0);
        assert_eq!(status, BufferStatus::Done);
        assert_eq!(bytes.len(), 6);
    }

    #[test]
    fn test_chunked_sample_reports_more_data_until_last() {
        let mut sample = RawSample::from_samples(&[1, 2, 3, 4, 5], mono16())
            .unwrap()
            .with_chunk_len(4);

        assert_eq!(sample.pull(false, 0), (BufferStatus::MoreData, &[1, 0, 2, 0][..]));
        assert_eq!(sample.pull(false, 0), (BufferStatus::MoreData, &[3, 0, 4, 0][..]));
        assert_eq!(sample.pull(false, 0), (BufferStatus::Done, &[5, 0][..]));
        // Exhausted sources keep answering with empty final blocks
        assert_eq!(sample.pull(false, 0), (BufferStatus::Done, &[][..]));
    }

    #[test]
    fn test_reset_rewinds() {
        let mut sample = RawSample::from_samples(&[7, 8], mono16())
            .unwrap()
            .with_chunk_len(2);
        sample.get_buffer(false, 0);
        sample.get_buffer(false, 0);
        sample.reset_buffer(false, 0);
        assert!(sample.buffer().is_empty());
        assert_eq!(sample.pull(false, 0).1, &[7, 0][..]);
    }

    #[test]
    fn test_boxed_sources_forward() {
        let mut boxed: Box<dyn SampleSource> =
            Box::new(RawSample::from_samples(&[42], mono16()).unwrap());
        assert_eq!(boxed.format(), mono16());
        assert_eq!(boxed.pull(false, 0).1, &[42, 0][..]);
    }
}
