//! Filter effect: a cascade of biquad stages cross-mixed with the dry signal

use std::iter;

use tracing::debug;

use super::biquad::{Biquad, BiquadState};
use super::{attach, validate_shape, Effect, MIX_BYPASS};
use crate::buffer::{alloc_zeroed, DoubleBuffer};
use crate::control::{tick_all, ControlInput};
use crate::error::{AudioError, Result};
use crate::format::SampleFormat;
use crate::playback::{Fill, Playback};
use crate::source::{BufferStatus, SampleSource};
use crate::MAX_CHUNK_FRAMES;

/// Construction parameters for [`Filter`]
#[derive(Debug, Clone)]
pub struct FilterConfig {
    pub format: SampleFormat,
    /// Bytes per output block
    pub buffer_size: usize,
    /// Stages, applied in order
    pub filters: Vec<Biquad>,
    /// Wet/dry mix (0.0 = dry, 1.0 = wet)
    pub mix: ControlInput,
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            format: SampleFormat::default(),
            buffer_size: 512,
            filters: Vec::new(),
            mix: ControlInput::Constant(1.0),
        }
    }
}

struct FilterState {
    buffers: DoubleBuffer,
    /// Working samples for one sub-chunk
    scratch: Vec<i32>,
    stages: Vec<BiquadState>,
}

/// Biquad filter chain effect
pub struct Filter {
    format: SampleFormat,
    playback: Playback,
    filters: Vec<Biquad>,
    mix: ControlInput,
    /// `None` once deinitialized
    state: Option<FilterState>,
}

impl Filter {
    /// Create a filter
    pub fn new(config: FilterConfig) -> Result<Self> {
        let FilterConfig {
            format,
            buffer_size,
            filters,
            mix,
        } = config;

        validate_shape(&format, buffer_size)?;
        let mut buffers = DoubleBuffer::new(buffer_size)?;
        buffers.fill_silence(&format);
        let scratch = alloc_zeroed(MAX_CHUNK_FRAMES * format.channels())?;
        let stages = design_stages(&filters, format.sample_rate);

        debug!(?format, buffer_size, stages = filters.len(), "filter ready");

        Ok(Self {
            format,
            playback: Playback::new(format.bytes_per_sample()),
            filters,
            mix,
            state: Some(FilterState {
                buffers,
                scratch,
                stages,
            }),
        })
    }

    pub fn filters(&self) -> &[Biquad] {
        &self.filters
    }

    /// Replace the whole chain; new stages start with empty history
    pub fn set_filters(&mut self, filters: Vec<Biquad>) -> Result<()> {
        let state = self.state.as_mut().ok_or(AudioError::Deinitialized)?;
        state.stages = design_stages(&filters, self.format.sample_rate);
        self.filters = filters;
        debug!(stages = self.filters.len(), "filter chain replaced");
        Ok(())
    }

    /// Mutable access to one stage's descriptor (mode or modulation slots)
    pub fn filter_mut(&mut self, index: usize) -> Option<&mut Biquad> {
        self.filters.get_mut(index)
    }

    pub fn mix(&self) -> &ControlInput {
        &self.mix
    }

    pub fn set_mix(&mut self, mix: impl Into<ControlInput>) {
        self.mix.assign(mix);
    }
}

fn design_stages(filters: &[Biquad], sample_rate: u32) -> Vec<BiquadState> {
    filters
        .iter()
        .map(|biquad| BiquadState::new(biquad, sample_rate))
        .collect()
}

impl SampleSource for Filter {
    fn format(&self) -> SampleFormat {
        self.format
    }

    /// Silences both output buffers and clears every stage's history
    fn reset_buffer(&mut self, _single_channel_output: bool, _channel: u8) {
        if let Some(state) = self.state.as_mut() {
            state.buffers.fill_silence(&self.format);
            state.scratch.fill(0);
            for stage in &mut state.stages {
                stage.reset();
            }
        }
    }

    fn get_buffer(&mut self, _single_channel_output: bool, _channel: u8) -> BufferStatus {
        let Self {
            format,
            playback,
            filters,
            mix,
            state,
        } = self;
        let Some(FilterState {
            buffers,
            scratch,
            stages,
        }) = state.as_mut()
        else {
            return BufferStatus::Error;
        };

        let out = buffers.toggle();
        let bytes_per_sample = format.bytes_per_sample();
        let channels = format.channels();
        let sample_rate = format.sample_rate;
        let total = out.len() / bytes_per_sample;
        let mut pos = 0;

        while pos < total {
            if playback.refill() != Fill::Ready {
                // Keep modulation moving while there is nothing to filter
                let frames = (total - pos) / channels;
                tick_all(
                    iter::once(&*mix).chain(filters.iter().flat_map(Biquad::inputs)),
                    sample_rate,
                    frames,
                );
                for (stage, biquad) in stages.iter_mut().zip(filters.iter()) {
                    stage.update(biquad, sample_rate);
                }
                format.fill_silence(&mut out[pos * bytes_per_sample..]);
                break;
            }

            let n = playback
                .remaining_units()
                .min(total - pos)
                .min(scratch.len());
            tick_all(
                iter::once(&*mix).chain(filters.iter().flat_map(Biquad::inputs)),
                sample_rate,
                n / channels,
            );
            let mix_value = mix.get_limited(0.0, 1.0);
            for (stage, biquad) in stages.iter_mut().zip(filters.iter()) {
                stage.update(biquad, sample_rate);
            }

            let src = &playback.data()[..n * bytes_per_sample];
            let dst = &mut out[pos * bytes_per_sample..(pos + n) * bytes_per_sample];
            if mix_value <= MIX_BYPASS || stages.is_empty() {
                dst.copy_from_slice(src);
            } else {
                let wet = &mut scratch[..n];
                for (i, sample) in wet.iter_mut().enumerate() {
                    *sample = format.read(src, i);
                }
                for stage in stages.iter_mut() {
                    stage.process(wet, channels, pos);
                }
                for (i, &filtered) in wet.iter().enumerate() {
                    let dry = format.read(src, i) as f64;
                    let blended = dry * (1.0 - mix_value) + filtered as f64 * mix_value;
                    format.write(dst, i, format.mix_down(blended as i32));
                }
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

impl Effect for Filter {
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
            debug!("filter deinitialized");
        }
    }

    fn is_deinit(&self) -> bool {
        self.state.is_none()
    }

    fn name(&self) -> &'static str {
        "Filter"
    }
}
