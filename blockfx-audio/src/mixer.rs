//! Mixer implementation - N voices summed into one output stream
//!
//! Each voice plays one source at a modulatable level. Voices are mixed as packed
//! pairs of 16-bit lanes (8-bit formats are widened first), so every output sample
//! is the saturating sum of the level-scaled voice samples.

use tracing::debug;

use crate::buffer::DoubleBuffer;
use crate::control::{tick_all, ControlInput};
use crate::error::{AudioError, Result};
use crate::format::SampleFormat;
use crate::packed::{
    flip16, flip8, pack8, unpack8, MixBackend, PackedLanes, Scalar, Swar, UNITY_LEVEL,
};
use crate::playback::{Fill, Playback};
use crate::source::{BufferStatus, SampleSource};
use crate::MAX_CHUNK_FRAMES;

/// Bytes in one packed word
const WORD: usize = 4;

/// One mixer input
pub struct MixerVoice {
    playback: Playback,
    level: ControlInput,
}

impl MixerVoice {
    fn new() -> Self {
        Self {
            playback: Playback::new(WORD),
            level: ControlInput::Constant(1.0),
        }
    }

    /// Level slot (clamped to `[0, 1]` when read)
    pub fn level(&self) -> &ControlInput {
        &self.level
    }

    /// Set the level to a constant or a live source
    pub fn set_level(&mut self, level: impl Into<ControlInput>) {
        self.level.assign(level);
    }

    /// Whether this voice restarts its source when it finishes
    pub fn looping(&self) -> bool {
        self.playback.looping()
    }

    pub fn set_looping(&mut self, looping: bool) {
        self.playback.set_looping(looping);
    }

    /// Whether a source is attached
    pub fn playing(&self) -> bool {
        self.playback.is_playing()
    }

    /// Current level in Q15 after clamping
    fn q15_level(&self) -> u16 {
        (self.level.get_limited(0.0, 1.0) * UNITY_LEVEL as f64) as u16
    }
}

/// Sums several sources of identical format
pub struct Mixer {
    format: SampleFormat,
    voices: Vec<MixerVoice>,
    backend: MixBackend,
    /// Output slots; `None` once deinitialized
    buffers: Option<DoubleBuffer>,
    /// Blocks produced so far
    read_count: u32,
    /// Blocks handed to left-channel readers
    left_read_count: u32,
    /// Blocks handed to right-channel readers
    right_read_count: u32,
    /// Byte offset into the last block for the current reader
    exposed_offset: usize,
}

impl Mixer {
    /// Create a mixer with `voice_count` silent voices
    ///
    /// Each output block is half of `buffer_size`, rounded down to whole words.
    pub fn new(voice_count: usize, buffer_size: usize, format: SampleFormat) -> Result<Self> {
        format.validate()?;
        if voice_count == 0 || voice_count > u8::MAX as usize {
            return Err(AudioError::InvalidVoiceCount(voice_count));
        }
        let block_len = buffer_size / 2 / WORD * WORD;
        if block_len == 0 {
            return Err(AudioError::InvalidBufferSize {
                size: buffer_size,
                align: 2 * WORD,
            });
        }

        let mut buffers = DoubleBuffer::new(block_len)?;
        buffers.fill_silence(&format);
        debug!(voice_count, block_len, ?format, "mixer ready");

        Ok(Self {
            format,
            voices: (0..voice_count).map(|_| MixerVoice::new()).collect(),
            backend: MixBackend::default(),
            buffers: Some(buffers),
            read_count: 0,
            left_read_count: 0,
            right_read_count: 0,
            exposed_offset: 0,
        })
    }

    /// Select the lane arithmetic backend
    pub fn with_backend(mut self, backend: MixBackend) -> Self {
        self.backend = backend;
        self
    }

    pub fn backend(&self) -> MixBackend {
        self.backend
    }

    pub fn voice_count(&self) -> usize {
        self.voices.len()
    }

    /// Bytes per produced block
    pub fn block_len(&self) -> usize {
        self.buffers.as_ref().map_or(0, DoubleBuffer::len)
    }

    pub fn voice(&self, index: usize) -> Option<&MixerVoice> {
        self.voices.get(index)
    }

    pub fn voice_mut(&mut self, index: usize) -> Option<&mut MixerVoice> {
        self.voices.get_mut(index)
    }

    pub fn voices(&self) -> impl Iterator<Item = &MixerVoice> {
        self.voices.iter()
    }

    /// Whether any voice has a source attached
    pub fn playing(&self) -> bool {
        self.buffers.is_some() && self.voices.iter().any(MixerVoice::playing)
    }

    /// Start `source` on voice `index`, replacing whatever it was playing
    pub fn play(
        &mut self,
        index: usize,
        source: Box<dyn SampleSource>,
        looping: bool,
    ) -> Result<()> {
        self.check_alive()?;
        self.format.ensure_matches(&source.format())?;
        let count = self.voices.len();
        let voice = self
            .voices
            .get_mut(index)
            .ok_or(AudioError::VoiceOutOfRange { index, count })?;
        voice.playback.start(source, looping);
        debug!(voice = index, looping, "voice started");
        Ok(())
    }

    /// Detach the source of voice `index`
    pub fn stop_voice(&mut self, index: usize) -> Result<()> {
        self.check_alive()?;
        let count = self.voices.len();
        let voice = self
            .voices
            .get_mut(index)
            .ok_or(AudioError::VoiceOutOfRange { index, count })?;
        voice.playback.stop();
        Ok(())
    }

    /// Release the output buffers and every attached source
    ///
    /// Calling it again is a no-op.
    pub fn deinit(&mut self) {
        if self.buffers.take().is_some() {
            for voice in &mut self.voices {
                voice.playback.stop();
            }
            debug!("mixer deinitialized");
        }
    }

    pub fn is_deinit(&self) -> bool {
        self.buffers.is_none()
    }

    fn check_alive(&self) -> Result<()> {
        if self.buffers.is_none() {
            return Err(AudioError::Deinitialized);
        }
        Ok(())
    }
}

/// Produce one block from every playing voice
///
/// Levels advance once per block, so a source shared between voices moves at its own rate.
fn mix_block<L: PackedLanes>(format: &SampleFormat, voices: &mut [MixerVoice], out: &mut [u8]) {
    tick_all(
        voices.iter().map(|voice| &voice.level),
        format.sample_rate,
        out.len() / format.frame_bytes(),
    );

    let mut voices_active = false;
    for voice in voices.iter_mut() {
        if voice.playback.is_playing() {
            mix_voice::<L>(format, voice, voices_active, out);
            voices_active = true;
        }
    }
    if !voices_active {
        out.fill(0);
    }

    if !format.samples_signed {
        let flip = if format.bits_per_sample == 16 {
            flip16
        } else {
            flip8
        };
        for word in out.chunks_exact_mut(WORD) {
            let value = u32::from_le_bytes([word[0], word[1], word[2], word[3]]);
            word.copy_from_slice(&flip(value).to_le_bytes());
        }
    }
}

/// Mix one voice into `out`
///
/// The first active voice overwrites `out`; later ones add to it. A voice that runs
/// dry before the block is full leaves the rest untouched (or zeroed, when it is the
/// first one).
fn mix_voice<L: PackedLanes>(
    format: &SampleFormat,
    voice: &mut MixerVoice,
    voices_active: bool,
    out: &mut [u8],
) {
    let total = out.len() / WORD;
    let chunk_words = (MAX_CHUNK_FRAMES * format.frame_bytes() / WORD).max(1);
    let mut pos = 0;

    while pos < total {
        if voice.playback.refill() != Fill::Ready {
            break;
        }
        let n = voice
            .playback
            .remaining_units()
            .min(total - pos)
            .min(chunk_words);

        let level = voice.q15_level();

        let src = &voice.playback.data()[..n * WORD];
        let dst = &mut out[pos * WORD..(pos + n) * WORD];
        if format.bits_per_sample == 16 {
            mix_words16::<L>(src, dst, level, format.samples_signed, voices_active);
        } else {
            mix_words8::<L>(src, dst, level, format.samples_signed, voices_active);
        }

        voice.playback.consume(n);
        pos += n;
    }

    if pos < total && !voices_active {
        out[pos * WORD..].fill(0);
    }
}

#[inline]
fn mix_words16<L: PackedLanes>(src: &[u8], dst: &mut [u8], level: u16, signed: bool, add: bool) {
    for (s, d) in src.chunks_exact(WORD).zip(dst.chunks_exact_mut(WORD)) {
        let mut word = u32::from_le_bytes([s[0], s[1], s[2], s[3]]);
        if !signed {
            word = flip16(word);
        }
        let mut mixed = L::scale(word, level);
        if add {
            mixed = L::add_sat(mixed, u32::from_le_bytes([d[0], d[1], d[2], d[3]]));
        }
        d.copy_from_slice(&mixed.to_le_bytes());
    }
}

#[inline]
fn mix_words8<L: PackedLanes>(src: &[u8], dst: &mut [u8], level: u16, signed: bool, add: bool) {
    for (s, d) in src.chunks_exact(2).zip(dst.chunks_exact_mut(2)) {
        let mut word = unpack8(u16::from_le_bytes([s[0], s[1]]));
        if !signed {
            word = flip16(word);
        }
        let mut mixed = L::scale(word, level);
        if add {
            mixed = L::add_sat(mixed, unpack8(u16::from_le_bytes([d[0], d[1]])));
        }
        d.copy_from_slice(&pack8(mixed).to_le_bytes());
    }
}

impl SampleSource for Mixer {
    fn format(&self) -> SampleFormat {
        self.format
    }

    /// Stops every voice
    fn reset_buffer(&mut self, _single_channel_output: bool, _channel: u8) {
        for voice in &mut self.voices {
            voice.playback.stop();
        }
    }

    fn get_buffer(&mut self, single_channel_output: bool, channel: u8) -> BufferStatus {
        let Some(buffers) = self.buffers.as_mut() else {
            return BufferStatus::Error;
        };

        let right = single_channel_output && channel == 1;
        let channel_read_count = if right {
            self.right_read_count
        } else {
            self.left_read_count
        };

        // A new block is mixed only when this channel has caught up with the last one
        if self.read_count == channel_read_count {
            let out = buffers.toggle();
            match self.backend {
                MixBackend::Scalar => mix_block::<Scalar>(&self.format, &mut self.voices, out),
                MixBackend::Swar => mix_block::<Swar>(&self.format, &mut self.voices, out),
            }
            self.read_count = self.read_count.wrapping_add(1);
        }

        if right {
            self.right_read_count = self.right_read_count.wrapping_add(1);
        } else {
            self.left_read_count = self.left_read_count.wrapping_add(1);
        }
        self.exposed_offset = if right && self.format.channel_count == 2 {
            self.format.bytes_per_sample()
        } else {
            0
        };

        BufferStatus::MoreData
    }

    fn buffer(&self) -> &[u8] {
        match &self.buffers {
            Some(buffers) => &buffers.last()[self.exposed_offset..],
            None => &[],
        }
    }
}
