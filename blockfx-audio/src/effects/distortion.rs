//! Distortion effect: pre-gain, waveshaping, post-gain and optional soft clip.
//!
//! Shaping always runs on 16-bit scale values; 8-bit streams are widened before and
//! narrowed after, so `drive` and the gains mean the same thing at both depths.

use tracing::debug;

use super::{attach, validate_shape, Effect, MIX_BYPASS};
use crate::buffer::DoubleBuffer;
use crate::control::{tick_all, ControlInput};
use crate::error::Result;
use crate::format::SampleFormat;
use crate::playback::{Fill, Playback};
use crate::source::{BufferStatus, SampleSource};
use crate::MAX_CHUNK_FRAMES;

/// Distortion algorithm
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DistortionMode {
    /// Power-law clipping; more drive flattens the curve toward a square
    #[default]
    Clip,
    /// Bit reduction; drive selects how many low bits are dropped (up to 14)
    LoFi,
    /// Asymmetric exponential saturation
    Overdrive,
    /// Rational waveshaper `(1 + k) x / (1 + k |x|)`
    WaveShape,
}

/// Construction parameters for [`Distortion`]
#[derive(Debug, Clone)]
pub struct DistortionConfig {
    pub format: SampleFormat,
    /// Bytes per output block
    pub buffer_size: usize,
    /// Amount of shaping (0.0 - 1.0)
    pub drive: ControlInput,
    /// Gain before shaping in dB (-60 - 60)
    pub pre_gain: ControlInput,
    /// Gain after shaping in dB (-80 - 24)
    pub post_gain: ControlInput,
    pub mode: DistortionMode,
    pub soft_clip: bool,
    /// Wet/dry mix (0.0 = dry, 1.0 = wet)
    pub mix: ControlInput,
}

impl Default for DistortionConfig {
    fn default() -> Self {
        Self {
            format: SampleFormat::default(),
            buffer_size: 512,
            drive: ControlInput::Constant(0.0),
            pre_gain: ControlInput::Constant(0.0),
            post_gain: ControlInput::Constant(0.0),
            mode: DistortionMode::Clip,
            soft_clip: false,
            mix: ControlInput::Constant(1.0),
        }
    }
}

/// Convert decibels to a linear factor
#[inline]
fn db_to_linear(db: f64) -> f64 {
    (db * std::f64::consts::LN_10 / 20.0).exp()
}

/// Per sub-chunk constants derived from the controls
#[derive(Debug, Clone, Copy)]
struct Shaper {
    mode: DistortionMode,
    soft_clip: bool,
    pre_gain: f64,
    post_gain: f64,
    /// Mode specific: clip exponent, waveshape slope
    drive: f64,
    /// LoFi mask of the bits kept
    mask: i32,
}

impl Shaper {
    fn new(mode: DistortionMode, soft_clip: bool, drive: f64, pre_db: f64, post_db: f64) -> Self {
        let (drive, mask) = match mode {
            DistortionMode::Clip => (1.0001 - drive, !0),
            DistortionMode::WaveShape => (2.0 * drive / (1.0001 - drive), !0),
            DistortionMode::LoFi => (drive, !((1i32 << (drive * 14.0).round() as u32) - 1)),
            DistortionMode::Overdrive => (drive, !0),
        };
        Self {
            mode,
            soft_clip,
            pre_gain: db_to_linear(pre_db),
            post_gain: db_to_linear(post_db),
            drive,
            mask,
        }
    }

    /// Shape one 16-bit scale sample
    #[inline]
    fn apply(&self, sample: i32) -> i32 {
        let mut word = (sample as f64 * self.pre_gain) as i32;

        if self.mode == DistortionMode::LoFi {
            word &= self.mask;
        }

        if self.mode != DistortionMode::LoFi || self.soft_clip {
            let mut x = word as f64 / 32_768.0;
            match self.mode {
                DistortionMode::Clip => {
                    x = x.abs().powf(self.drive).copysign(x);
                }
                DistortionMode::LoFi => {}
                DistortionMode::Overdrive => {
                    x *= 0.686306;
                    let z = 1.0 + (x.abs().sqrt() * -0.75).exp();
                    x = (x.exp() - (-x * z).exp()) / (x.exp() + (-x).exp());
                }
                DistortionMode::WaveShape => {
                    x = (1.0 + self.drive) * x / (1.0 + self.drive * x.abs());
                }
            }

            x *= self.post_gain;
            if self.soft_clip {
                x = if x > 0.0 { 1.0 - (-x).exp() } else { -1.0 + x.exp() };
            }
            word = (x * 32_767.0) as i32;
        } else {
            word = (word as f64 * self.post_gain) as i32;
        }

        word.clamp(i16::MIN as i32, i16::MAX as i32)
    }
}

struct DistortionState {
    buffers: DoubleBuffer,
}

/// Distortion effect
pub struct Distortion {
    format: SampleFormat,
    playback: Playback,
    drive: ControlInput,
    pre_gain: ControlInput,
    post_gain: ControlInput,
    mode: DistortionMode,
    soft_clip: bool,
    mix: ControlInput,
    /// `None` once deinitialized
    state: Option<DistortionState>,
}

impl Distortion {
    pub fn new(config: DistortionConfig) -> Result<Self> {
        let DistortionConfig {
            format,
            buffer_size,
            drive,
            pre_gain,
            post_gain,
            mode,
            soft_clip,
            mix,
        } = config;

        validate_shape(&format, buffer_size)?;
        let mut buffers = DoubleBuffer::new(buffer_size)?;
        buffers.fill_silence(&format);
        debug!(?format, buffer_size, ?mode, soft_clip, "distortion ready");

        Ok(Self {
            format,
            playback: Playback::new(format.bytes_per_sample()),
            drive,
            pre_gain,
            post_gain,
            mode,
            soft_clip,
            mix,
            state: Some(DistortionState { buffers }),
        })
    }

    pub fn drive(&self) -> &ControlInput {
        &self.drive
    }

    pub fn set_drive(&mut self, drive: impl Into<ControlInput>) {
        self.drive.assign(drive);
    }

    pub fn pre_gain(&self) -> &ControlInput {
        &self.pre_gain
    }

    pub fn set_pre_gain(&mut self, pre_gain: impl Into<ControlInput>) {
        self.pre_gain.assign(pre_gain);
    }

    pub fn post_gain(&self) -> &ControlInput {
        &self.post_gain
    }

    pub fn set_post_gain(&mut self, post_gain: impl Into<ControlInput>) {
        self.post_gain.assign(post_gain);
    }

    pub fn mode(&self) -> DistortionMode {
        self.mode
    }

    pub fn set_mode(&mut self, mode: DistortionMode) {
        self.mode = mode;
    }

    pub fn soft_clip(&self) -> bool {
        self.soft_clip
    }

    pub fn set_soft_clip(&mut self, soft_clip: bool) {
        self.soft_clip = soft_clip;
    }

    pub fn mix(&self) -> &ControlInput {
        &self.mix
    }

    pub fn set_mix(&mut self, mix: impl Into<ControlInput>) {
        self.mix.assign(mix);
    }
}

impl SampleSource for Distortion {
    fn format(&self) -> SampleFormat {
        self.format
    }

    fn reset_buffer(&mut self, _single_channel_output: bool, _channel: u8) {
        if let Some(state) = self.state.as_mut() {
            state.buffers.fill_silence(&self.format);
        }
    }

    fn get_buffer(&mut self, _single_channel_output: bool, _channel: u8) -> BufferStatus {
        let Some(state) = self.state.as_mut() else {
            return BufferStatus::Error;
        };

        let format = self.format;
        let controls = [&self.drive, &self.pre_gain, &self.post_gain, &self.mix];
        let out = state.buffers.toggle();
        let bytes_per_sample = format.bytes_per_sample();
        let channels = format.channels();
        let total = out.len() / bytes_per_sample;
        // 8-bit samples are shaped at 16-bit scale
        let widen = if format.bits_per_sample == 8 { 8 } else { 0 };
        let mut pos = 0;

        while pos < total {
            if self.playback.refill() != Fill::Ready {
                tick_all(controls, format.sample_rate, (total - pos) / channels);
                format.fill_silence(&mut out[pos * bytes_per_sample..]);
                break;
            }

            let n = self
                .playback
                .remaining_units()
                .min(total - pos)
                .min(MAX_CHUNK_FRAMES * channels);
            tick_all(controls, format.sample_rate, n / channels);
            let mix = self.mix.get_limited(0.0, 1.0);

            let src = &self.playback.data()[..n * bytes_per_sample];
            let dst = &mut out[pos * bytes_per_sample..(pos + n) * bytes_per_sample];
            if mix <= MIX_BYPASS {
                dst.copy_from_slice(src);
            } else {
                let shaper = Shaper::new(
                    self.mode,
                    self.soft_clip,
                    self.drive.get_limited(0.0, 1.0),
                    self.pre_gain.get_limited(-60.0, 60.0),
                    self.post_gain.get_limited(-80.0, 24.0),
                );
                for i in 0..n {
                    let dry = format.read(src, i);
                    let wet = shaper.apply(dry << widen) >> widen;
                    let blended = dry as f64 * (1.0 - mix) + wet as f64 * mix;
                    format.write(dst, i, blended as i32);
                }
            }

            self.playback.consume(n);
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

impl Effect for Distortion {
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
            debug!("distortion deinitialized");
        }
    }

    fn is_deinit(&self) -> bool {
        self.state.is_none()
    }

    fn name(&self) -> &'static str {
        "Distortion"
    }
}
