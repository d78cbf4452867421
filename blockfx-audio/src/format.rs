//! Sample formats and byte-level sample conversion
//!
//! All buffers exchanged between sources and effects are raw little-endian bytes.
//! Unsigned formats carry a mid-point bias (0x80 for 8-bit, 0x8000 for 16-bit)
//! which is removed on read and re-applied on write, so DSP code only ever sees
//! signed values in the format's native range.

use crate::error::{AudioError, Result};

/// Mix-down starts compressing above this magnitude
const MIX_DOWN_KNEE: i32 = 28_000;
/// Largest magnitude the mix-down expects (two full-scale signals summed)
const MIX_DOWN_HEADROOM: i32 = 2 * 32_768 - 1;

/// Shape of the samples an object produces or consumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SampleFormat {
    /// 8 or 16
    pub bits_per_sample: u8,
    /// Signed samples (true) or mid-point biased unsigned samples (false)
    pub samples_signed: bool,
    /// 1 for mono, 2 for interleaved stereo
    pub channel_count: u8,
    /// Frames per second
    pub sample_rate: u32,
}

impl Default for SampleFormat {
    fn default() -> Self {
        Self {
            bits_per_sample: 16,
            samples_signed: true,
            channel_count: 1,
            sample_rate: 8000,
        }
    }
}

impl SampleFormat {
    /// Create a validated format
    pub fn new(
        bits_per_sample: u8,
        samples_signed: bool,
        channel_count: u8,
        sample_rate: u32,
    ) -> Result<Self> {
        let format = Self {
            bits_per_sample,
            samples_signed,
            channel_count,
            sample_rate,
        };
        format.validate()?;
        Ok(format)
    }

    /// Signed 16-bit, the format most chains run in
    pub fn signed16(channel_count: u8, sample_rate: u32) -> Result<Self> {
        Self::new(16, true, channel_count, sample_rate)
    }

    /// Check the invariants `new` enforces (for formats built as literals)
    pub fn validate(&self) -> Result<()> {
        if self.bits_per_sample != 8 && self.bits_per_sample != 16 {
            return Err(AudioError::UnsupportedBitDepth(self.bits_per_sample));
        }
        if self.channel_count != 1 && self.channel_count != 2 {
            return Err(AudioError::UnsupportedChannelCount(self.channel_count));
        }
        if self.sample_rate == 0 {
            return Err(AudioError::InvalidSampleRate);
        }
        Ok(())
    }

    #[inline]
    pub fn bytes_per_sample(&self) -> usize {
        self.bits_per_sample as usize / 8
    }

    #[inline]
    pub fn channels(&self) -> usize {
        self.channel_count as usize
    }

    /// Bytes in one frame (one sample per channel)
    #[inline]
    pub fn frame_bytes(&self) -> usize {
        self.bytes_per_sample() * self.channels()
    }

    /// Length of one sample period in milliseconds
    pub fn sample_ms(&self) -> f64 {
        1000.0 / self.sample_rate as f64
    }

    /// Largest positive sample value
    #[inline]
    pub fn max_amplitude(&self) -> i32 {
        if self.bits_per_sample == 16 {
            i16::MAX as i32
        } else {
            i8::MAX as i32
        }
    }

    /// Reject a buffer size that is zero or would split a frame
    pub fn validate_buffer_size(&self, size: usize) -> Result<()> {
        let align = self.frame_bytes();
        if size == 0 || size % align != 0 {
            return Err(AudioError::InvalidBufferSize { size, align });
        }
        Ok(())
    }

    /// Fail unless `other` could be fed to an object producing `self`
    pub fn ensure_matches(&self, other: &SampleFormat) -> Result<()> {
        let checks = [
            ("sample_rate", self.sample_rate, other.sample_rate),
            (
                "channel_count",
                self.channel_count as u32,
                other.channel_count as u32,
            ),
            (
                "bits_per_sample",
                self.bits_per_sample as u32,
                other.bits_per_sample as u32,
            ),
            (
                "samples_signed",
                self.samples_signed as u32,
                other.samples_signed as u32,
            ),
        ];
        for (field, expected, found) in checks {
            if expected != found {
                return Err(AudioError::FormatMismatch {
                    field,
                    expected,
                    found,
                });
            }
        }
        Ok(())
    }

    /// Read sample `index` as a signed value in the native range
    #[inline]
    pub fn read(&self, bytes: &[u8], index: usize) -> i32 {
        if self.bits_per_sample == 16 {
            let raw = u16::from_le_bytes([bytes[index * 2], bytes[index * 2 + 1]]);
            let raw = if self.samples_signed { raw } else { raw ^ 0x8000 };
            raw as i16 as i32
        } else {
            let raw = if self.samples_signed {
                bytes[index]
            } else {
                bytes[index] ^ 0x80
            };
            raw as i8 as i32
        }
    }

    /// Write `value` to sample `index`, saturating to the native range
    #[inline]
    pub fn write(&self, bytes: &mut [u8], index: usize, value: i32) {
        if self.bits_per_sample == 16 {
            let clamped = value.clamp(i16::MIN as i32, i16::MAX as i32) as i16 as u16;
            let raw = if self.samples_signed {
                clamped
            } else {
                clamped ^ 0x8000
            };
            bytes[index * 2..index * 2 + 2].copy_from_slice(&raw.to_le_bytes());
        } else {
            let clamped = value.clamp(i8::MIN as i32, i8::MAX as i32) as i8 as u8;
            bytes[index] = if self.samples_signed {
                clamped
            } else {
                clamped ^ 0x80
            };
        }
    }

    /// Fill `bytes` with the format's silence (zero, or the unsigned bias)
    pub fn fill_silence(&self, bytes: &mut [u8]) {
        match (self.samples_signed, self.bits_per_sample) {
            (true, _) => bytes.fill(0),
            (false, 8) => bytes.fill(0x80),
            (false, _) => {
                for pair in bytes.chunks_exact_mut(2) {
                    pair.copy_from_slice(&0x8000u16.to_le_bytes());
                }
            }
        }
    }

    /// Bring a summed value back into range: soft knee for 16-bit, hard clip for 8-bit
    #[inline]
    pub fn mix_down(&self, sample: i32) -> i32 {
        if self.bits_per_sample == 16 {
            mix_down_sample(sample)
        } else {
            sample.clamp(i8::MIN as i32, i8::MAX as i32)
        }
    }
}

/// Soft-knee limiter mapping roughly two full-scale 16-bit signals into one
///
/// Values inside the knee pass through untouched; the rest of the headroom is
/// squeezed linearly into the space between the knee and full scale.
#[inline]
pub fn mix_down_sample(sample: i32) -> i32 {
    const SPAN_IN: i64 = (MIX_DOWN_HEADROOM - MIX_DOWN_KNEE) as i64;
    const SPAN_OUT: i64 = (i16::MAX as i32 - MIX_DOWN_KNEE) as i64;
    const KNEE: i64 = MIX_DOWN_KNEE as i64;

    let x = sample as i64;
    let shaped = if x > KNEE {
        KNEE + (x - KNEE) * SPAN_OUT / SPAN_IN
    } else if x < -KNEE {
        -KNEE + (x + KNEE) * SPAN_OUT / SPAN_IN
    } else {
        x
    };
    shaped.clamp(i16::MIN as i64, i16::MAX as i64) as i32
}
