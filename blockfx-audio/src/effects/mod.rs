//! Audio effects for blockfx
//!
//! Every effect plays one upstream source and is itself a [`SampleSource`], so
//! effects chain by handing one to another's [`play`](Effect::play).

mod biquad;
mod distortion;
mod echo;
mod filter;
mod pitch_shift;

pub use biquad::{Biquad, BiquadMode};
pub use distortion::{Distortion, DistortionConfig, DistortionMode};
pub use echo::{Echo, EchoConfig};
pub use filter::{Filter, FilterConfig};
pub use pitch_shift::{PitchShift, PitchShiftConfig};

use tracing::debug;

use crate::error::{AudioError, Result};
use crate::format::SampleFormat;
use crate::playback::Playback;
use crate::source::SampleSource;

/// Mix at or below this is treated as fully dry
pub(crate) const MIX_BYPASS: f64 = 0.01;

/// Trait for audio effects
pub trait Effect: SampleSource {
    /// Start processing `source` from its first sample
    fn play(&mut self, source: Box<dyn SampleSource>, looping: bool) -> Result<()>;

    /// Detach the upstream source; the effect keeps producing blocks
    fn stop(&mut self);

    /// Whether an upstream source is attached
    fn playing(&self) -> bool;

    /// Release all buffers; further use fails with [`AudioError::Deinitialized`]
    fn deinit(&mut self);

    fn is_deinit(&self) -> bool;

    /// Get effect name
    fn name(&self) -> &'static str;
}

/// Shared `play` checks: alive, matching format
pub(crate) fn attach(
    name: &'static str,
    alive: bool,
    format: &SampleFormat,
    playback: &mut Playback,
    source: Box<dyn SampleSource>,
    looping: bool,
) -> Result<()> {
    if !alive {
        return Err(AudioError::Deinitialized);
    }
    format.ensure_matches(&source.format())?;
    playback.start(source, looping);
    debug!(effect = name, looping, "source attached");
    Ok(())
}

/// Shared construction checks: valid format and a whole number of frames per block
pub(crate) fn validate_shape(format: &SampleFormat, buffer_size: usize) -> Result<()> {
    format.validate()?;
    format.validate_buffer_size(buffer_size)
}
