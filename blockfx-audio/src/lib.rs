//! Audio core for blockfx - pull-based block pipeline for small playback targets
//!
//! This module provides the processing graph:
//! - Source: the pull contract and in-memory raw samples
//! - Control: constant or block-ticked modulation inputs (LFO, knob)
//! - Mixer: saturating multi-voice summing with per-voice level
//! - Effects: echo, biquad filter chain, distortion, pitch shift
//! - Engine: drives the outermost source into device frames

mod buffer;
mod control;
mod effects;
mod engine;
mod error;
mod format;
mod mixer;
mod packed;
mod playback;
mod source;

/// Largest number of frames processed per inner step
pub const MAX_CHUNK_FRAMES: usize = 256;

pub use buffer::{DoubleBuffer, EchoRing};
pub use control::{tick_all, BlockSource, ControlInput, Knob, Lfo, SourceHandle};
pub use effects::{
    Biquad, BiquadMode, Distortion, DistortionConfig, DistortionMode, Echo, EchoConfig, Effect,
    Filter, FilterConfig, PitchShift, PitchShiftConfig,
};
pub use engine::{AudioCommand, AudioEngine, AudioEvent, EngineState};
pub use error::{AudioError, Result};
pub use format::{mix_down_sample, SampleFormat};
pub use mixer::{Mixer, MixerVoice};
pub use packed::{MixBackend, PackedLanes, Scalar, Swar, UNITY_LEVEL};
pub use source::{BufferStatus, RawSample, SampleSource};
