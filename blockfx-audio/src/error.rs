//! Error type shared by every blockfx object

use thiserror::Error;

/// Errors raised while constructing or reconfiguring audio objects
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("bits_per_sample must be 8 or 16, got {0}")]
    UnsupportedBitDepth(u8),
    #[error("channel_count must be 1 or 2, got {0}")]
    UnsupportedChannelCount(u8),
    #[error("sample_rate must be at least 1")]
    InvalidSampleRate,
    #[error("buffer_size {size} must be a non-zero multiple of {align} bytes")]
    InvalidBufferSize { size: usize, align: usize },
    #[error("voice_count must be between 1 and 255, got {0}")]
    InvalidVoiceCount(usize),
    #[error("voice {index} does not exist (mixer has {count} voices)")]
    VoiceOutOfRange { index: usize, count: usize },
    #[error("max_delay_ms must be positive, got {0}")]
    InvalidMaxDelay(f64),
    #[error("delay of {requested_ms} ms is outside the {min_ms}..={max_ms} ms the echo buffer can hold")]
    DelayOutOfRange {
        requested_ms: f64,
        min_ms: f64,
        max_ms: f64,
    },
    #[error(
        "window of {window_len} bytes with overlap of {overlap_len} bytes: both must be multiples of {align} bytes and the overlap shorter than the window"
    )]
    InvalidWindow {
        window_len: usize,
        overlap_len: usize,
        align: usize,
    },
    #[error("sample {field} {found} does not match effect {field} {expected}")]
    FormatMismatch {
        field: &'static str,
        expected: u32,
        found: u32,
    },
    #[error("failed to allocate {0} bytes")]
    Allocation(usize),
    #[error("object has been deinitialized")]
    Deinitialized,
}

/// Result alias for blockfx operations
pub type Result<T> = std::result::Result<T, AudioError>;
