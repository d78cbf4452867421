//! Echo effect: delay line with decay and dry/wet mix.
//!
//! Two modes share one pre-allocated 16-bit ring:
//! - Fixed: the ring is shortened to the requested delay and read and written at the
//!   same cursor, giving an exact delay of `delay_ms`.
//! - Frequency shift: the ring stays at full length and each channel's cursor walks
//!   it at `max_delay_ms / delay_ms` frames per output frame (24.8 fixed point),
//!   pitching the repeats instead of moving them in time.

use tracing::{debug, trace};

use super::{attach, validate_shape, Effect, MIX_BYPASS};
use crate::buffer::{DoubleBuffer, EchoRing};
use crate::control::{tick_all, ControlInput};
use crate::error::{AudioError, Result};
use crate::format::SampleFormat;
use crate::playback::{Fill, Playback};
use crate::source::{BufferStatus, SampleSource};
use crate::MAX_CHUNK_FRAMES;

/// Fractional bits of the frequency-shift cursor
const SHIFT_BITS: u32 = 8;

/// Construction parameters for [`Echo`]
#[derive(Debug, Clone)]
pub struct EchoConfig {
    pub format: SampleFormat,
    /// Bytes per output block
    pub buffer_size: usize,
    /// Longest delay the ring is allocated for
    pub max_delay_ms: f64,
    pub delay_ms: ControlInput,
    /// Echo level retained per repeat (0.0 - 1.0)
    pub decay: ControlInput,
    /// Wet/dry mix (0.0 = dry, 1.0 = wet)
    pub mix: ControlInput,
    pub freq_shift: bool,
}

impl Default for EchoConfig {
    fn default() -> Self {
        Self {
            format: SampleFormat::default(),
            buffer_size: 512,
            max_delay_ms: 500.0,
            delay_ms: ControlInput::Constant(250.0),
            decay: ControlInput::Constant(0.7),
            mix: ControlInput::Constant(0.5),
            freq_shift: false,
        }
    }
}

/// Ring plus cursors; everything that depends on the realized delay
struct DelayLine {
    ring: EchoRing,
    /// Fixed mode read/write cursor (sample index)
    pos: usize,
    /// Frequency-shift cursors per channel (frame index, 24.8 fixed point)
    shift_pos: [usize; 2],
    /// Frequency-shift cursor increment per frame (24.8 fixed point)
    rate: usize,
    current_delay_ms: f64,

    sample_rate: u32,
    channels: usize,
    sample_ms: f64,
    max_delay_ms: f64,
    /// Shortest fixed-mode ring: one output block of samples
    min_len: usize,
}

impl DelayLine {
    fn new(format: &SampleFormat, max_delay_ms: f64, block_samples: usize) -> Result<Self> {
        let max_len = ring_len(format, max_delay_ms);
        if max_len == 0 {
            return Err(AudioError::InvalidMaxDelay(max_delay_ms));
        }
        Ok(Self {
            ring: EchoRing::new(max_len)?,
            pos: 0,
            shift_pos: [0; 2],
            rate: 1 << SHIFT_BITS,
            // The ring starts at full length
            current_delay_ms: max_delay_ms,
            sample_rate: format.sample_rate,
            channels: format.channels(),
            sample_ms: format.sample_ms(),
            max_delay_ms,
            min_len: block_samples,
        })
    }

    /// Realize a new delay, keeping the current one when the request does not fit
    fn recalculate(&mut self, requested_ms: f64, freq_shift: bool) -> Result<()> {
        // NaN falls through to one sample period as well
        let delay_ms = requested_ms.max(self.sample_ms);

        if freq_shift {
            let rate = self.max_delay_ms / delay_ms * (1 << SHIFT_BITS) as f64;
            self.rate = (rate as usize).max(1);
            self.ring.set_len(self.ring.capacity());
            let frames = self.ring.len() / self.channels;
            for pos in &mut self.shift_pos {
                *pos %= frames << SHIFT_BITS;
            }
        } else {
            let len = (self.sample_rate as f64 / 1000.0 * delay_ms) as usize * self.channels;
            if len > self.ring.capacity() || len < self.min_len {
                return Err(AudioError::DelayOutOfRange {
                    requested_ms,
                    min_ms: (self.min_len / self.channels) as f64 * self.sample_ms,
                    max_ms: self.max_delay_ms,
                });
            }
            self.ring.set_len(len);
            self.pos %= len;
        }

        self.current_delay_ms = delay_ms;
        Ok(())
    }

    /// Delay the ring length gives in fixed mode
    fn realized_delay_ms(&self) -> f64 {
        (self.ring.len() / self.channels) as f64 * self.sample_ms
    }

    /// Run `n` samples starting at block sample `first`
    ///
    /// `dry` is the source bytes, or `None` to keep only the echo tail ringing.
    #[allow(clippy::too_many_arguments)]
    fn process(
        &mut self,
        format: &SampleFormat,
        dry: Option<&[u8]>,
        out: &mut [u8],
        first: usize,
        n: usize,
        decay: f64,
        mix: f64,
        freq_shift: bool,
    ) {
        for i in 0..n {
            let sample = dry.map_or(0, |bytes| format.read(bytes, i));
            let decayed = if freq_shift {
                let channel = (first + i) % self.channels;
                self.shift_step(format, channel, sample, dry.is_some(), decay)
            } else {
                let echo = self.ring.read_at(self.pos);
                let decayed = (echo as f64 * decay) as i32;
                let stored = if dry.is_some() {
                    format.mix_down(sample + decayed)
                } else {
                    decayed
                };
                self.ring.write_at(self.pos, stored as i16);
                self.pos = (self.pos + 1) % self.ring.len();
                decayed
            };

            let value = if dry.is_some() {
                let wet = format.mix_down(sample + decayed);
                sample as f64 * (1.0 - mix) + wet as f64 * mix
            } else {
                decayed as f64 * mix
            };
            format.write(out, i, value as i32);
        }
    }

    /// Advance one channel's shift cursor by one frame, returning the decayed echo
    fn shift_step(
        &mut self,
        format: &SampleFormat,
        channel: usize,
        sample: i32,
        has_dry: bool,
        decay: f64,
    ) -> i32 {
        let channels = self.channels;
        let frames = self.ring.len() / channels;
        let index = |frame: usize| (frame % frames) * channels + channel;

        let pos = self.shift_pos[channel];
        let echo = self.ring.read_at(index(pos >> SHIFT_BITS));
        let next = pos + self.rate;

        // Every frame the cursor passes over is refreshed
        for frame in (pos >> SHIFT_BITS)..(next >> SHIFT_BITS) {
            let slot = index(frame);
            let decayed = (self.ring.read_at(slot) as f64 * decay) as i32;
            let stored = if has_dry {
                format.mix_down(decayed + sample)
            } else {
                decayed
            };
            self.ring.write_at(slot, stored as i16);
        }

        self.shift_pos[channel] = next % (frames << SHIFT_BITS);
        (echo as f64 * decay) as i32
    }

    fn clear(&mut self) {
        self.ring.clear();
        self.pos = 0;
        self.shift_pos = [0; 2];
    }
}

/// Ring length in samples for a delay
fn ring_len(format: &SampleFormat, delay_ms: f64) -> usize {
    (format.sample_rate as f64 / 1000.0 * delay_ms) as usize * format.channels()
}

struct EchoState {
    buffers: DoubleBuffer,
    line: DelayLine,
}

/// Echo effect
pub struct Echo {
    format: SampleFormat,
    playback: Playback,
    delay_ms: ControlInput,
    decay: ControlInput,
    mix: ControlInput,
    freq_shift: bool,
    /// `None` once deinitialized
    state: Option<EchoState>,
}

impl Echo {
    /// Create an echo with its ring sized for `max_delay_ms`
    pub fn new(config: EchoConfig) -> Result<Self> {
        let EchoConfig {
            format,
            buffer_size,
            max_delay_ms,
            delay_ms,
            decay,
            mix,
            freq_shift,
        } = config;

        validate_shape(&format, buffer_size)?;
        if !(max_delay_ms.is_finite() && max_delay_ms > 0.0) {
            return Err(AudioError::InvalidMaxDelay(max_delay_ms));
        }

        let mut buffers = DoubleBuffer::new(buffer_size)?;
        buffers.fill_silence(&format);
        let mut line = DelayLine::new(&format, max_delay_ms, buffer_size / format.bytes_per_sample())?;

        match line.recalculate(delay_ms.get(), freq_shift) {
            Ok(()) => {}
            Err(err) if !delay_ms.is_dynamic() => return Err(err),
            Err(err) => trace!(%err, "initial dynamic delay ignored"),
        }

        debug!(
            ?format,
            buffer_size,
            max_delay_ms,
            ring_len = line.ring.capacity(),
            "echo ready"
        );

        Ok(Self {
            format,
            playback: Playback::new(format.bytes_per_sample()),
            delay_ms,
            decay,
            mix,
            freq_shift,
            state: Some(EchoState { buffers, line }),
        })
    }

    pub fn delay_ms(&self) -> &ControlInput {
        &self.delay_ms
    }

    /// Set the delay time
    ///
    /// A constant that does not fit the ring is rejected and the previous delay kept.
    /// A dynamic source is accepted; values it produces out of range are skipped.
    pub fn set_delay_ms(&mut self, delay_ms: impl Into<ControlInput>) -> Result<()> {
        let delay_ms = delay_ms.into();
        let state = self.state.as_mut().ok_or(AudioError::Deinitialized)?;
        match state.line.recalculate(delay_ms.get(), self.freq_shift) {
            Ok(()) => {}
            Err(err) if !delay_ms.is_dynamic() => return Err(err),
            Err(err) => trace!(%err, "dynamic delay out of range"),
        }
        debug!(delay_ms = state.line.current_delay_ms, "echo delay set");
        self.delay_ms = delay_ms;
        Ok(())
    }

    /// Delay currently realized by the ring
    pub fn current_delay_ms(&self) -> Result<f64> {
        self.state
            .as_ref()
            .map(|state| state.line.current_delay_ms)
            .ok_or(AudioError::Deinitialized)
    }

    /// Longest delay the ring can hold
    pub fn max_delay_ms(&self) -> Result<f64> {
        self.state
            .as_ref()
            .map(|state| state.line.max_delay_ms)
            .ok_or(AudioError::Deinitialized)
    }

    pub fn decay(&self) -> &ControlInput {
        &self.decay
    }

    pub fn set_decay(&mut self, decay: impl Into<ControlInput>) {
        self.decay.assign(decay);
    }

    pub fn mix(&self) -> &ControlInput {
        &self.mix
    }

    pub fn set_mix(&mut self, mix: impl Into<ControlInput>) {
        self.mix.assign(mix);
    }

    pub fn freq_shift(&self) -> bool {
        self.freq_shift
    }

    /// Switch between fixed and frequency-shift modes
    ///
    /// The mode always switches. When the fixed line cannot hold the requested delay the
    /// error is returned and the line keeps its current length, which `current_delay_ms`
    /// then reports.
    pub fn set_freq_shift(&mut self, freq_shift: bool) -> Result<()> {
        let state = self.state.as_mut().ok_or(AudioError::Deinitialized)?;
        self.freq_shift = freq_shift;
        let result = state.line.recalculate(self.delay_ms.get(), freq_shift);
        if result.is_err() {
            state.line.current_delay_ms = state.line.realized_delay_ms();
        }
        debug!(freq_shift, delay_ms = state.line.current_delay_ms, "echo mode set");
        result
    }
}

impl SampleSource for Echo {
    fn format(&self) -> SampleFormat {
        self.format
    }

    /// Silences both output buffers and the ring
    fn reset_buffer(&mut self, _single_channel_output: bool, _channel: u8) {
        if let Some(state) = self.state.as_mut() {
            state.buffers.fill_silence(&self.format);
            state.line.clear();
        }
    }

    fn get_buffer(&mut self, _single_channel_output: bool, _channel: u8) -> BufferStatus {
        let Self {
            format,
            playback,
            delay_ms,
            decay,
            mix,
            freq_shift,
            state,
        } = self;
        let Some(EchoState { buffers, line }) = state.as_mut() else {
            return BufferStatus::Error;
        };

        let out = buffers.toggle();
        let bytes_per_sample = format.bytes_per_sample();
        let channels = format.channels();
        let total = out.len() / bytes_per_sample;
        let chunk = MAX_CHUNK_FRAMES * channels;
        let mut pos = 0;

        while pos < total {
            let fill = playback.refill();
            let mut n = (total - pos).min(chunk);
            if fill == Fill::Ready {
                n = n.min(playback.remaining_units());
            }

            tick_all([&*mix, &*decay, &*delay_ms], format.sample_rate, n / channels);
            let mix_value = mix.get_limited(0.0, 1.0);
            let decay_value = decay.get_limited(0.0, 1.0);
            let requested_ms = delay_ms.get();
            if (line.current_delay_ms - requested_ms).abs() >= line.sample_ms {
                if let Err(err) = line.recalculate(requested_ms, *freq_shift) {
                    trace!(%err, "dynamic delay out of range");
                }
            }

            let dst = &mut out[pos * bytes_per_sample..(pos + n) * bytes_per_sample];
            if fill == Fill::Ready {
                let src = &playback.data()[..n * bytes_per_sample];
                if mix_value <= MIX_BYPASS {
                    dst.copy_from_slice(src);
                } else {
                    line.process(
                        format,
                        Some(src),
                        dst,
                        pos,
                        n,
                        decay_value,
                        mix_value,
                        *freq_shift,
                    );
                }
                playback.consume(n);
            } else if mix_value <= MIX_BYPASS {
                format.fill_silence(dst);
            } else {
                line.process(format, None, dst, pos, n, decay_value, mix_value, *freq_shift);
            }

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

impl Effect for Echo {
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
        // The tail keeps ringing until the consumer stops pulling
        self.playback.stop();
    }

    fn playing(&self) -> bool {
        self.playback.is_playing()
    }

    fn deinit(&mut self) {
        if self.state.take().is_some() {
            self.playback.stop();
            debug!("echo deinitialized");
        }
    }

    fn is_deinit(&self) -> bool {
        self.state.is_none()
    }

    fn name(&self) -> &'static str {
        "Echo"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RawSample;

    fn mono16() -> SampleFormat {
        SampleFormat::signed16(1, 8000).unwrap()
    }

    fn config(delay_ms: f64, decay: f64, mix: f64) -> EchoConfig {
        EchoConfig {
            format: mono16(),
            delay_ms: delay_ms.into(),
            decay: decay.into(),
            mix: mix.into(),
            ..EchoConfig::default()
        }
    }

    /// Pull `blocks` blocks and decode them back to back
    fn render(echo: &mut Echo, blocks: usize) -> Vec<i32> {
        let format = echo.format();
        let mut out = Vec::new();
        for _ in 0..blocks {
            let (status, bytes) = echo.pull(false, 0);
            assert_eq!(status, BufferStatus::MoreData);
            out.extend((0..bytes.len() / 2).map(|i| format.read(bytes, i)));
        }
        out
    }

    fn impulse(value: i32) -> Box<dyn SampleSource> {
        Box::new(RawSample::from_samples(&[value], mono16()).unwrap())
    }

    #[test]
    fn test_impulse_repeats_at_delay_and_halves() {
        let mut echo = Echo::new(config(250.0, 0.5, 1.0)).unwrap();
        echo.play(impulse(1000), false).unwrap();

        // 250 ms at 8 kHz = 2000 samples; 256 samples per block
        let out = render(&mut echo, 32);
        assert_eq!(out[0], 1000);
        assert_eq!(out[2000], 500);
        assert_eq!(out[4000], 250);
        assert_eq!(out[6000], 125);
        assert!(out[1..2000].iter().all(|&s| s == 0));
        assert!(!echo.playing());
    }

    #[test]
    fn test_tail_decays_to_silence() {
        let mut echo = Echo::new(config(50.0, 0.6, 1.0)).unwrap();
        echo.play(impulse(30_000), false).unwrap();

        // 50 ms = 400 samples per repeat
        let out = render(&mut echo, 125);
        let peaks: Vec<i32> = out
            .chunks(400)
            .map(|period| period.iter().map(|s| s.abs()).max().unwrap_or(0))
            .collect();
        assert!(peaks.windows(2).all(|w| w[1] <= w[0]));
        assert_eq!(*peaks.last().unwrap(), 0);
    }

    #[test]
    fn test_out_of_range_delay_keeps_current() {
        let mut echo = Echo::new(config(250.0, 0.5, 0.5)).unwrap();
        assert_eq!(echo.current_delay_ms().unwrap(), 250.0);

        assert!(matches!(
            echo.set_delay_ms(600.0),
            Err(AudioError::DelayOutOfRange { max_ms, .. }) if max_ms == 500.0
        ));
        // Shorter than one 256-sample block
        assert!(echo.set_delay_ms(10.0).is_err());
        assert_eq!(echo.current_delay_ms().unwrap(), 250.0);
        assert_eq!(echo.delay_ms().get(), 250.0);

        echo.set_delay_ms(300.0).unwrap();
        assert_eq!(echo.current_delay_ms().unwrap(), 300.0);
    }

    #[test]
    fn test_construction_rejects_bad_parameters() {
        assert!(matches!(
            Echo::new(EchoConfig {
                max_delay_ms: 0.0,
                ..EchoConfig::default()
            }),
            Err(AudioError::InvalidMaxDelay(_))
        ));
        assert!(matches!(
            Echo::new(config(900.0, 0.5, 0.5)),
            Err(AudioError::DelayOutOfRange { .. })
        ));
        assert!(matches!(
            Echo::new(EchoConfig {
                buffer_size: 511,
                ..EchoConfig::default()
            }),
            Err(AudioError::InvalidBufferSize { .. })
        ));
    }

    #[test]
    fn test_freq_shift_compresses_repeat_time() {
        let mut echo = Echo::new(EchoConfig {
            max_delay_ms: 100.0,
            freq_shift: true,
            ..config(50.0, 0.5, 1.0)
        })
        .unwrap();
        echo.play(impulse(1000), false).unwrap();

        // Ring of 800 frames walked two frames per output frame
        let out = render(&mut echo, 4);
        assert_eq!(out[0], 1000);
        assert!(out[1..400].iter().all(|&s| s == 0));
        assert_eq!(out[400], 500);
    }

    #[test]
    fn test_leaving_freq_shift_with_short_delay_reports_realized_delay() {
        let mut echo = Echo::new(EchoConfig {
            freq_shift: true,
            ..config(10.0, 0.5, 1.0)
        })
        .unwrap();
        assert_eq!(echo.current_delay_ms().unwrap(), 10.0);

        // 10 ms is shorter than one block, so the fixed line stays at full length
        assert!(matches!(
            echo.set_freq_shift(false),
            Err(AudioError::DelayOutOfRange { .. })
        ));
        assert!(!echo.freq_shift());
        assert_eq!(echo.current_delay_ms().unwrap(), 500.0);

        echo.play(impulse(1000), false).unwrap();
        let out = render(&mut echo, 20);
        assert!(out[1..4000].iter().all(|&s| s == 0));
        assert_eq!(out[4000], 500);

        echo.set_delay_ms(250.0).unwrap();
        assert_eq!(echo.current_delay_ms().unwrap(), 250.0);
        assert!(echo.set_freq_shift(true).is_ok());
    }

    #[test]
    fn test_stereo_fixed_echo_stays_on_its_channel() {
        let format = SampleFormat::signed16(2, 8000).unwrap();
        let mut echo = Echo::new(EchoConfig {
            format,
            ..config(50.0, 0.5, 1.0)
        })
        .unwrap();
        echo.play(Box::new(RawSample::from_samples(&[1000, 0], format).unwrap()), false)
            .unwrap();

        // 400 frames of 2 interleaved samples
        let out = render(&mut echo, 16);
        assert_eq!(out[0], 1000);
        assert!(out[2..800].iter().all(|&s| s == 0));
        assert_eq!(out[800], 500);
        assert_eq!(out[1600], 250);
        assert!(out.iter().skip(1).step_by(2).all(|&s| s == 0));
    }

    #[test]
    fn test_stereo_freq_shift_cursors_are_independent() {
        let format = SampleFormat::signed16(2, 8000).unwrap();
        let mut echo = Echo::new(EchoConfig {
            format,
            max_delay_ms: 100.0,
            freq_shift: true,
            ..config(50.0, 0.5, 1.0)
        })
        .unwrap();
        echo.play(Box::new(RawSample::from_samples(&[1000, 0], format).unwrap()), false)
            .unwrap();

        // Each channel walks its own 800-frame ring two frames at a time
        let out = render(&mut echo, 16);
        assert_eq!(out[0], 1000);
        assert!(out[2..800].iter().all(|&s| s == 0));
        assert_eq!(out[800], 500);
        assert_eq!(out[1600], 250);
        assert!(out.iter().skip(1).step_by(2).all(|&s| s == 0));
    }

    #[test]
    fn test_freq_shift_tail_decays_without_source() {
        let mut echo = Echo::new(EchoConfig {
            max_delay_ms: 100.0,
            freq_shift: true,
            ..config(50.0, 0.5, 1.0)
        })
        .unwrap();
        echo.play(impulse(1000), false).unwrap();

        let out = render(&mut echo, 32);
        assert!(!echo.playing());
        assert_eq!(out[400], 500);
        assert_eq!(out[800], 250);
        assert_eq!(out[1200], 125);
        let peaks: Vec<i32> = out[400..]
            .chunks(400)
            .map(|period| period.iter().map(|s| s.abs()).max().unwrap_or(0))
            .collect();
        assert!(peaks.windows(2).all(|w| w[1] <= w[0]));
        assert!(out[6000..].iter().all(|&s| s == 0));
    }

    #[test]
    fn test_zero_mix_passes_dry_through() {
        let format = mono16();
        let values: Vec<i32> = (0..256).map(|i| i * 100 - 12_800).collect();
        let mut echo = Echo::new(config(250.0, 0.9, 0.0)).unwrap();
        echo.play(
            Box::new(RawSample::from_samples(&values, format).unwrap()),
            true,
        )
        .unwrap();
        assert_eq!(render(&mut echo, 1), values);
    }

    #[test]
    fn test_always_more_data_and_silent_when_idle() {
        let mut echo = Echo::new(EchoConfig {
            format: SampleFormat::new(8, false, 2, 8000).unwrap(),
            ..EchoConfig::default()
        })
        .unwrap();
        for _ in 0..3 {
            let (status, bytes) = echo.pull(false, 0);
            assert_eq!(status, BufferStatus::MoreData);
            assert!(bytes.iter().all(|&b| b == 0x80));
        }
    }

    #[test]
    fn test_play_rejects_mismatched_format() {
        let mut echo = Echo::new(EchoConfig::default()).unwrap();
        let stereo = SampleFormat::signed16(2, 8000).unwrap();
        let source = RawSample::from_samples(&[0, 0], stereo).unwrap();
        assert!(matches!(
            echo.play(Box::new(source), false),
            Err(AudioError::FormatMismatch {
                field: "channel_count",
                ..
            })
        ));
    }

    #[test]
    fn test_deinit_fails_fast() {
        let mut echo = Echo::new(EchoConfig::default()).unwrap();
        echo.deinit();
        echo.deinit();
        assert!(echo.is_deinit());
        assert_eq!(echo.get_buffer(false, 0), BufferStatus::Error);
        assert_eq!(echo.play(impulse(1), false), Err(AudioError::Deinitialized));
        assert_eq!(echo.set_delay_ms(100.0), Err(AudioError::Deinitialized));
        assert_eq!(echo.current_delay_ms(), Err(AudioError::Deinitialized));
    }
}
