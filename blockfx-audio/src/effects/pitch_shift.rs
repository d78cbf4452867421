//! Pitch shift effect: a short window replayed at a pitch-dependent rate
//!
//! Input is written into a per-channel window ring one frame at a time while a read
//! cursor walks the same ring at `2^(semitones / 12)` frames per frame (24.8 fixed
//! point). With an overlap ring the input reaches the window `overlap` frames late,
//! and the read cursor crossfades into those newer samples as it closes in on the
//! write position, hiding the seam where it laps the writer.

use tracing::debug;

use super::{attach, validate_shape, Effect, MIX_BYPASS};
use crate::buffer::{alloc_zeroed, DoubleBuffer};
use crate::control::{tick_all, ControlInput};
use crate::error::{AudioError, Result};
use crate::format::SampleFormat;
use crate::playback::{Fill, Playback};
use crate::source::{BufferStatus, SampleSource};
use crate::MAX_CHUNK_FRAMES;

/// Fractional bits of the read cursor
const READ_SHIFT: u32 = 8;

/// Construction parameters for [`PitchShift`]
#[derive(Debug, Clone)]
pub struct PitchShiftConfig {
    pub format: SampleFormat,
    /// Bytes per output block
    pub buffer_size: usize,
    /// Shift in semitones (12 = one octave up)
    pub semitones: ControlInput,
    /// Wet/dry mix; 0.5 keeps both at full level, 1.0 is wet only
    pub mix: ControlInput,
    /// Window ring size in bytes of 16-bit samples, all channels
    pub window_len: usize,
    /// Overlap ring size in bytes of 16-bit samples, all channels; 0 disables crossfading
    pub overlap_len: usize,
}

impl Default for PitchShiftConfig {
    fn default() -> Self {
        Self {
            format: SampleFormat::default(),
            buffer_size: 512,
            semitones: ControlInput::Constant(0.0),
            mix: ControlInput::Constant(1.0),
            window_len: 1024,
            overlap_len: 128,
        }
    }
}

/// Window and overlap rings, stored per channel (channel `c` at `c * frames`)
struct ShiftWindow {
    window: Vec<i16>,
    window_frames: usize,
    overlap: Vec<i16>,
    overlap_frames: usize,
    write_pos: usize,
    overlap_pos: usize,
    /// Frame index << READ_SHIFT
    read_pos: usize,
    rate: usize,
    semitones: f64,
}

impl ShiftWindow {
    fn new(format: &SampleFormat, window_len: usize, overlap_len: usize) -> Result<Self> {
        let align = 2 * format.channels();
        if window_len == 0 || window_len % align != 0 || overlap_len % align != 0 || overlap_len >= window_len {
            return Err(AudioError::InvalidWindow {
                window_len,
                overlap_len,
                align,
            });
        }
        let window_frames = window_len / align;
        let overlap_frames = overlap_len / align;

        Ok(Self {
            window: alloc_zeroed(window_frames * format.channels())?,
            window_frames,
            overlap: alloc_zeroed(overlap_frames * format.channels())?,
            overlap_frames,
            write_pos: 0,
            overlap_pos: 0,
            read_pos: 0,
            rate: 1 << READ_SHIFT,
            semitones: 0.0,
        })
    }

    fn set_semitones(&mut self, semitones: f64) {
        let rate = 2f64.powf(semitones / 12.0) * (1 << READ_SHIFT) as f64;
        // NaN and negative overflow both land on a stalled cursor
        self.rate = rate as usize;
        self.semitones = semitones;
    }

    /// Store one input sample of `channel` and return its shifted counterpart
    #[inline]
    fn step(&mut self, channel: usize, sample: i32) -> i32 {
        let window_frames = self.window_frames;
        let overlap_frames = self.overlap_frames;
        let write_slot = self.write_pos + window_frames * channel;

        if overlap_frames > 0 {
            let overlap_slot = self.overlap_pos + overlap_frames * channel;
            self.window[write_slot] = self.overlap[overlap_slot];
            self.overlap[overlap_slot] = sample as i16;
        } else {
            self.window[write_slot] = sample as i16;
        }

        let read = self.read_pos >> READ_SHIFT;
        let distance = (read + window_frames - self.write_pos) % window_frames;
        let mut word = self.window[read + window_frames * channel] as i32;

        if overlap_frames > 0 && distance > 0 && distance <= overlap_frames {
            let newer_slot = (self.overlap_pos + distance) % overlap_frames + overlap_frames * channel;
            let newer = self.overlap[newer_slot] as i32;
            word = (word * distance as i32 + newer * (overlap_frames - distance) as i32)
                / overlap_frames as i32;
        }
        word
    }

    /// Move every cursor on by one frame
    #[inline]
    fn advance(&mut self) {
        self.write_pos = (self.write_pos + 1) % self.window_frames;
        if self.overlap_frames > 0 {
            self.overlap_pos = (self.overlap_pos + 1) % self.overlap_frames;
        }
        self.read_pos = (self.read_pos + self.rate) % (self.window_frames << READ_SHIFT);
    }

    fn clear(&mut self) {
        self.window.fill(0);
        self.overlap.fill(0);
        self.write_pos = 0;
        self.overlap_pos = 0;
        self.read_pos = 0;
    }
}

struct PitchShiftState {
    buffers: DoubleBuffer,
    window: ShiftWindow,
}

/// Pitch shift effect
pub struct PitchShift {
    format: SampleFormat,
    playback: Playback,
    semitones: ControlInput,
    mix: ControlInput,
    window_len: usize,
    overlap_len: usize,
    /// `None` once deinitialized
    state: Option<PitchShiftState>,
}

impl PitchShift {
    pub fn new(config: PitchShiftConfig) -> Result<Self> {
        let PitchShiftConfig {
            format,
            buffer_size,
            semitones,
            mix,
            window_len,
            overlap_len,
        } = config;

        validate_shape(&format, buffer_size)?;
        let mut buffers = DoubleBuffer::new(buffer_size)?;
        buffers.fill_silence(&format);
        let mut window = ShiftWindow::new(&format, window_len, overlap_len)?;
        window.set_semitones(semitones.get());

        debug!(?format, buffer_size, window_len, overlap_len, "pitch shift ready");

        Ok(Self {
            format,
            playback: Playback::new(format.bytes_per_sample()),
            semitones,
            mix,
            window_len,
            overlap_len,
            state: Some(PitchShiftState { buffers, window }),
        })
    }

    pub fn semitones(&self) -> &ControlInput {
        &self.semitones
    }

    /// Set the shift; a constant takes effect from the next sample
    pub fn set_semitones(&mut self, semitones: impl Into<ControlInput>) {
        self.semitones.assign(semitones);
        if let Some(state) = self.state.as_mut() {
            state.window.set_semitones(self.semitones.get());
        }
    }

    pub fn mix(&self) -> &ControlInput {
        &self.mix
    }

    pub fn set_mix(&mut self, mix: impl Into<ControlInput>) {
        self.mix.assign(mix);
    }

    pub fn window_len(&self) -> usize {
        self.window_len
    }

    pub fn overlap_len(&self) -> usize {
        self.overlap_len
    }
}

impl SampleSource for PitchShift {
    fn format(&self) -> SampleFormat {
        self.format
    }

    /// Silences both output buffers and both rings
    fn reset_buffer(&mut self, _single_channel_output: bool, _channel: u8) {
        if let Some(state) = self.state.as_mut() {
            state.buffers.fill_silence(&self.format);
            state.window.clear();
        }
    }

    fn get_buffer(&mut self, _single_channel_output: bool, _channel: u8) -> BufferStatus {
        let Self {
            format,
            playback,
            semitones,
            mix,
            state,
            ..
        } = self;
        let Some(PitchShiftState { buffers, window }) = state.as_mut() else {
            return BufferStatus::Error;
        };

        let out = buffers.toggle();
        let bytes_per_sample = format.bytes_per_sample();
        let channels = format.channels();
        let total = out.len() / bytes_per_sample;
        let mut pos = 0;

        while pos < total {
            if playback.refill() != Fill::Ready {
                tick_all([&*semitones, &*mix], format.sample_rate, (total - pos) / channels);
                format.fill_silence(&mut out[pos * bytes_per_sample..]);
                break;
            }

            let n = playback
                .remaining_units()
                .min(total - pos)
                .min(MAX_CHUNK_FRAMES * channels);
            tick_all([&*semitones, &*mix], format.sample_rate, n / channels);
            let shift = semitones.get();
            if shift.to_bits() != window.semitones.to_bits() {
                window.set_semitones(shift);
            }
            let mix_value = mix.get_limited(0.0, 1.0) * 2.0;
            let dry_gain = (2.0 - mix_value).min(1.0);
            let wet_gain = mix_value.min(1.0);
            let bypass = mix_value <= MIX_BYPASS * 2.0;

            let src = &playback.data()[..n * bytes_per_sample];
            let dst = &mut out[pos * bytes_per_sample..(pos + n) * bytes_per_sample];
            for i in 0..n {
                let channel = (pos + i) % channels;
                let dry = format.read(src, i);
                let wet = window.step(channel, dry);
                if channel == channels - 1 {
                    window.advance();
                }
                if !bypass {
                    let blended = dry as f64 * dry_gain + wet as f64 * wet_gain;
                    format.write(dst, i, format.mix_down(blended as i32));
                }
            }
            // The window keeps filling while bypassed so a later mix change has history
            if bypass {
                dst.copy_from_slice(src);
            }

            playback.consume(n);
            pos += n;
        }

        BufferStatus::MoreData
    }

    fn buffer(&self) -> &[u8] {
        match &self.state {
            Some(state) => state.buffers.last(),
            None => &[],
        }
    }
}

impl Effect for PitchShift {
    fn play(&mut self, source: Box<dyn SampleSource>, looping: bool) -> Result<()> {
        attach(
            self.name(),
            self.state.is_some(),
            &self.format,
            &mut self.playback,
            source,
            looping,
        )
    }

    fn stop(&mut self) {
        self.playback.stop();
    }

    fn playing(&self) -> bool {
        self.playback.is_playing()
    }

    fn deinit(&mut self) {
        if self.state.take().is_some() {
            self.playback.stop();
            debug!("pitch shift deinitialized");
        }
    }

    fn is_deinit(&self) -> bool {
        self.state.is_none()
    }

    fn name(&self) -> &'static str {
        "PitchShift"
    }
}
