//! Audio engine - drives the outermost source into interleaved device frames

use std::fmt;

use crossbeam_channel::{bounded, Receiver, Sender, TryIter};
use tracing::{debug, warn};

use crate::format::SampleFormat;
use crate::source::{BufferStatus, SampleSource};

/// Commands sent to the audio engine
pub enum AudioCommand {
    /// Replace the current chain and start pulling it from the top
    Play(Box<dyn SampleSource>),
    Stop,
    Pause,
    Resume,
    /// Linear output gain
    SetGain(f32),
    /// Rewind the current chain
    Reset,
    Shutdown,
}

impl fmt::Debug for AudioCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AudioCommand::Play(source) => f.debug_tuple("Play").field(&source.format()).finish(),
            AudioCommand::Stop => f.write_str("Stop"),
            AudioCommand::Pause => f.write_str("Pause"),
            AudioCommand::Resume => f.write_str("Resume"),
            AudioCommand::SetGain(gain) => f.debug_tuple("SetGain").field(gain).finish(),
            AudioCommand::Reset => f.write_str("Reset"),
            AudioCommand::Shutdown => f.write_str("Shutdown"),
        }
    }
}

/// Events sent from the audio engine
#[derive(Debug, Clone, PartialEq)]
pub enum AudioEvent {
    /// Output level since the previous meter reading
    Meter {
        /// Peak absolute sample, 0.0..=1.0 before gain
        peak: f32,
        /// Device frames written since the engine was created
        frames: u64,
        playing: bool,
    },
    Error(String),
}

/// Commands or events queued before the far side stops accepting more
const QUEUE_LEN: usize = 1024;

/// Audio-thread side of the engine
pub struct EngineState {
    commands: Option<Receiver<AudioCommand>>,
    events: Option<Sender<AudioEvent>>,
    source: Option<Box<dyn SampleSource>>,
    format: SampleFormat,
    /// Next unread sample of the current block
    cursor: usize,
    /// Samples in the current block
    available: usize,
    /// The current block is the source's last
    last_block: bool,
    paused: bool,
    gain: f32,
    peak: f32,
    frames: u64,
    last_error: Option<String>,
    shutdown: bool,
}

impl EngineState {
    /// Engine that only changes through [`handle_command`](Self::handle_command)
    pub fn new() -> Self {
        Self {
            commands: None,
            events: None,
            source: None,
            format: SampleFormat::default(),
            cursor: 0,
            available: 0,
            last_block: false,
            paused: false,
            gain: 1.0,
            peak: 0.0,
            frames: 0,
            last_error: None,
            shutdown: false,
        }
    }

    pub fn handle_command(&mut self, cmd: AudioCommand) {
        match cmd {
            AudioCommand::Play(source) => {
                self.format = source.format();
                debug!(format = ?self.format, "engine source replaced");
                self.source = Some(source);
                self.rewind();
                self.paused = false;
            }
            AudioCommand::Stop => {
                self.source = None;
                self.rewind();
            }
            AudioCommand::Pause => self.paused = true,
            AudioCommand::Resume => self.paused = false,
            AudioCommand::SetGain(gain) => self.gain = gain.clamp(0.0, 4.0),
            AudioCommand::Reset => {
                if let Some(source) = self.source.as_mut() {
                    source.reset_buffer(false, 0);
                }
                self.rewind();
            }
            AudioCommand::Shutdown => {
                self.source = None;
                self.shutdown = true;
            }
        }
    }

    fn rewind(&mut self) {
        self.cursor = 0;
        self.available = 0;
        self.last_block = false;
    }

    pub fn is_playing(&self) -> bool {
        self.source.is_some() && !self.paused
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown
    }

    pub fn gain(&self) -> f32 {
        self.gain
    }

    /// Meter reading; resets the peak
    pub fn meter(&mut self) -> AudioEvent {
        let peak = std::mem::take(&mut self.peak);
        AudioEvent::Meter {
            peak,
            frames: self.frames,
            playing: self.is_playing(),
        }
    }

    /// The error that detached the last source, if not yet reported
    pub fn take_error(&mut self) -> Option<AudioEvent> {
        self.last_error.take().map(AudioEvent::Error)
    }

    /// Report the pending error and a meter reading to the connected [`AudioEngine`]
    ///
    /// Events that do not fit the queue are dropped. Without a connection the readings
    /// are discarded.
    pub fn publish(&mut self) {
        let error = self.take_error();
        let meter = self.meter();
        let Some(events) = self.events.as_ref() else {
            return;
        };
        if let Some(error) = error {
            let _ = events.try_send(error);
        }
        let _ = events.try_send(meter);
    }

    /// Fill interleaved device frames of `device_channels` channels
    pub fn process(&mut self, output: &mut [f32], device_channels: usize) {
        if let Some(commands) = self.commands.take() {
            while let Ok(cmd) = commands.try_recv() {
                self.handle_command(cmd);
            }
            self.commands = Some(commands);
        }

        let device_channels = device_channels.max(1);
        let total_frames = output.len() / device_channels;
        let mut frame = 0;

        while frame < total_frames {
            if !self.is_playing() || self.shutdown {
                break;
            }
            if self.cursor >= self.available && !self.next_block() {
                break;
            }
            let Some(source) = self.source.as_ref() else {
                break;
            };

            let format = self.format;
            let source_channels = format.channels();
            let scale = 1.0 / (format.max_amplitude() as f32 + 1.0);
            let block = source.buffer();
            let block_frames = (self.available - self.cursor) / source_channels;
            let n = block_frames.min(total_frames - frame);

            for i in 0..n {
                let base = self.cursor + i * source_channels;
                let left = format.read(block, base) as f32 * scale;
                let right = if source_channels > 1 {
                    format.read(block, base + 1) as f32 * scale
                } else {
                    left
                };
                self.peak = self.peak.max(left.abs()).max(right.abs());

                let out = &mut output[(frame + i) * device_channels..][..device_channels];
                match device_channels {
                    1 => out[0] = (left + right) * 0.5 * self.gain,
                    _ => {
                        for (c, sample) in out.iter_mut().enumerate() {
                            let value = if c % 2 == 0 { left } else { right };
                            *sample = value * self.gain;
                        }
                    }
                }
            }

            self.cursor += n * source_channels;
            frame += n;
        }

        output[frame * device_channels..].fill(0.0);
        self.frames += total_frames as u64;
    }

    /// Pull the next block; `false` when nothing could be read this callback
    fn next_block(&mut self) -> bool {
        if self.last_block {
            debug!("engine source finished");
            self.source = None;
            self.rewind();
            return false;
        }
        let Some(source) = self.source.as_mut() else {
            return false;
        };

        let status = source.get_buffer(false, 0);
        if status == BufferStatus::Error {
            warn!("engine source reported an error, detaching");
            self.last_error = Some("source reported an error".into());
            self.source = None;
            self.rewind();
            return false;
        }

        let samples = source.buffer().len() / self.format.bytes_per_sample();
        // Whole frames only
        self.available = samples - samples % self.format.channels();
        self.cursor = 0;
        self.last_block = status == BufferStatus::Done;
        self.available > 0 || (self.last_block && self.next_block())
    }
}

impl Default for EngineState {
    fn default() -> Self {
        Self::new()
    }
}

/// Control-thread handle to an [`EngineState`] running on the audio thread
pub struct AudioEngine {
    commands: Sender<AudioCommand>,
    events: Receiver<AudioEvent>,
}

impl AudioEngine {
    /// A handle and the engine state it drives, joined by bounded queues
    ///
    /// The state drains commands at the top of every [`EngineState::process`] call and
    /// reports back through [`EngineState::publish`].
    pub fn connect() -> (Self, EngineState) {
        let (command_tx, command_rx) = bounded(QUEUE_LEN);
        let (event_tx, event_rx) = bounded(QUEUE_LEN);
        let state = EngineState {
            commands: Some(command_rx),
            events: Some(event_tx),
            ..EngineState::new()
        };
        let engine = Self {
            commands: command_tx,
            events: event_rx,
        };
        (engine, state)
    }

    /// Queue a command; `false` when the queue is full or the engine is gone
    pub fn send(&self, cmd: AudioCommand) -> bool {
        self.commands.try_send(cmd).is_ok()
    }

    /// Replace the chain the engine plays
    pub fn play(&self, source: Box<dyn SampleSource>) -> bool {
        self.send(AudioCommand::Play(source))
    }

    pub fn set_gain(&self, gain: f32) -> bool {
        self.send(AudioCommand::SetGain(gain))
    }

    /// Events published since the last call
    pub fn events(&self) -> TryIter<'_, AudioEvent> {
        self.events.try_iter()
    }

    /// Highest meter peak among pending events, logging any errors on the way
    pub fn drain_peak(&self) -> f32 {
        self.events().fold(0.0, |peak, event| match event {
            AudioEvent::Meter { peak: p, .. } => peak.max(p),
            AudioEvent::Error(message) => {
                warn!(%message, "engine reported an error");
                peak
            }
        })
    }

    /// Detach the chain and stop the engine for good
    pub fn shutdown(&self) -> bool {
        self.send(AudioCommand::Shutdown)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::RawSample;

    fn raw(values: &[i32], channels: u8) -> Box<dyn SampleSource> {
        let format = SampleFormat::signed16(channels, 8000).unwrap();
        Box::new(RawSample::from_samples(values, format).unwrap())
    }

    #[test]
    fn test_idle_engine_outputs_silence() {
        let mut state = EngineState::new();
        let mut out = [1.0f32; 32];
        state.process(&mut out, 2);
        assert!(out.iter().all(|&s| s == 0.0));
        assert!(!state.is_playing());
    }

    #[test]
    fn test_partial_blocks_carry_across_callbacks() {
        let values: Vec<i32> = (0..100).map(|i| i * 100).collect();
        let mut state = EngineState::new();
        state.handle_command(AudioCommand::Play(raw(&values, 1)));

        let mut collected = Vec::new();
        let mut out = [0.0f32; 7];
        for _ in 0..15 {
            state.process(&mut out, 1);
            collected.extend_from_slice(&out);
        }
        let expected: Vec<f32> = values.iter().map(|&v| v as f32 / 32768.0).collect();
        assert_eq!(&collected[..100], &expected[..]);
        assert!(collected[100..].iter().all(|&s| s == 0.0));
        assert!(!state.is_playing());
    }

    #[test]
    fn test_mono_fans_out_to_every_channel() {
        let mut state = EngineState::new();
        state.handle_command(AudioCommand::Play(raw(&[16384; 16], 1)));
        let mut out = [0.0f32; 8];
        state.process(&mut out, 4);
        assert!(out.iter().all(|&s| s == 0.5));
    }

    #[test]
    fn test_stereo_source_to_mono_device_averages() {
        let mut state = EngineState::new();
        state.handle_command(AudioCommand::Play(raw(&[16384, 0, 16384, 0], 2)));
        let mut out = [0.0f32; 2];
        state.process(&mut out, 1);
        assert_eq!(out, [0.25, 0.25]);
    }

    #[test]
    fn test_commands_are_applied_before_the_block() {
        let (engine, mut state) = AudioEngine::connect();

        assert!(engine.play(raw(&[16384; 64], 1)));
        assert!(engine.set_gain(0.5));
        let mut out = [0.0f32; 4];
        state.process(&mut out, 1);
        assert!(out.iter().all(|&s| s == 0.25));

        engine.send(AudioCommand::Pause);
        state.process(&mut out, 1);
        assert!(out.iter().all(|&s| s == 0.0));

        engine.send(AudioCommand::Resume);
        state.process(&mut out, 1);
        assert!(out.iter().all(|&s| s == 0.25));

        assert!(engine.shutdown());
        state.process(&mut out, 1);
        assert!(state.is_shutdown());
        assert!(out.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_published_events_reach_the_handle() {
        let (engine, mut state) = AudioEngine::connect();
        engine.play(raw(&[-16384, 8192], 1));
        let mut out = [0.0f32; 4];
        state.process(&mut out, 1);
        state.publish();

        let events: Vec<AudioEvent> = engine.events().collect();
        assert_eq!(
            events,
            [AudioEvent::Meter {
                peak: 0.5,
                frames: 4,
                playing: false,
            }]
        );

        state.process(&mut out, 1);
        state.publish();
        state.publish();
        assert_eq!(engine.drain_peak(), 0.0);
        assert_eq!(engine.events().count(), 0);
    }

    #[test]
    fn test_full_queue_drops_commands() {
        let (engine, _state) = AudioEngine::connect();
        for _ in 0..QUEUE_LEN {
            assert!(engine.send(AudioCommand::Pause));
        }
        assert!(!engine.send(AudioCommand::Resume));
    }

    #[test]
    fn test_send_fails_once_the_state_is_gone() {
        let (engine, state) = AudioEngine::connect();
        drop(state);
        assert!(!engine.send(AudioCommand::Stop));
        assert_eq!(engine.events().count(), 0);
    }

    #[test]
    fn test_meter_tracks_and_resets_peak() {
        let mut state = EngineState::new();
        state.handle_command(AudioCommand::Play(raw(&[-16384, 8192, 0, 0], 1)));
        let mut out = [0.0f32; 4];
        state.process(&mut out, 1);
        match state.meter() {
            AudioEvent::Meter { peak, frames, .. } => {
                assert_eq!(peak, 0.5);
                assert_eq!(frames, 4);
            }
            other => panic!("unexpected event {other:?}"),
        }
        match state.meter() {
            AudioEvent::Meter { peak, .. } => assert_eq!(peak, 0.0),
            other => panic!("unexpected event {other:?}"),
        }
    }

    #[test]
    fn test_reset_rewinds_source() {
        let mut state = EngineState::new();
        state.handle_command(AudioCommand::Play(raw(&[1000, 2000, 3000, 4000], 1)));
        let mut out = [0.0f32; 2];
        state.process(&mut out, 1);
        state.handle_command(AudioCommand::Reset);
        state.process(&mut out, 1);
        assert_eq!(out[0], 1000.0 / 32768.0);
    }
}
