//! blockfx - renders a small effect chain
//!
//! Two looping tones go through a mixer, a swept low-pass, a distortion stage, a pitch
//! shifter and an echo. By default the chain is rendered offline and its level logged per
//! block; with the `playback` feature and `--play` it streams to the default output device.

mod config;

use std::f64::consts::TAU;
use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use blockfx_audio::{
    AudioCommand, AudioEvent, Biquad, ControlInput, Distortion, DistortionConfig, Echo,
    EchoConfig, Effect, EngineState, Filter, FilterConfig, Knob, Lfo, Mixer, PitchShift,
    PitchShiftConfig, RawSample, SampleFormat, SampleSource,
};

use crate::config::Config;

/// Device frames rendered per offline callback
const OFFLINE_FRAMES: usize = 256;

/// Command line options
#[derive(Debug, Parser)]
#[command(name = "blockfx", version, about = "Render or play a small block effect chain")]
struct Cli {
    /// Config file to read instead of the default location
    #[arg(long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Write the effective config back out
    #[arg(long)]
    save_config: bool,

    /// Stream to the default output device instead of rendering offline
    #[arg(long)]
    play: bool,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let path = cli.config.unwrap_or_else(Config::config_path);
    let config = Config::load(&path)
        .with_context(|| format!("failed to read config {}", path.display()))?;

    if cli.save_config {
        config
            .save_to(&path)
            .with_context(|| format!("failed to write config {}", path.display()))?;
        info!(path = %path.display(), "config saved");
    }

    let level = Knob::new(1.0);
    let chain = build_chain(&config, level.clone())?;

    if cli.play {
        return play(chain, &config, level);
    }
    render_offline(chain, &config, &level);
    Ok(())
}

/// One second of a sine, so any whole-Hz pitch loops without a seam
fn tone(format: SampleFormat, frequency: f64, amplitude: f64) -> anyhow::Result<RawSample> {
    let rate = format.sample_rate as usize;
    let channels = format.channels();
    let peak = format.max_amplitude() as f64 * amplitude;
    let samples: Vec<i32> = (0..rate * channels)
        .map(|i| {
            let t = (i / channels) as f64 / rate as f64;
            (peak * (TAU * frequency * t).sin()).round() as i32
        })
        .collect();
    Ok(RawSample::from_samples(&samples, format)?)
}

/// Mixer -> Filter -> Distortion -> PitchShift -> Echo
fn build_chain(config: &Config, level: Knob) -> anyhow::Result<Box<dyn SampleSource>> {
    let format = SampleFormat::new(
        config.bits_per_sample,
        config.samples_signed,
        config.channel_count,
        config.sample_rate,
    )
    .context("invalid stream format")?;
    let buffer_size = config.buffer_size;

    let mut mixer = Mixer::new(2, buffer_size, format).context("mixer")?;
    mixer.play(0, Box::new(tone(format, config.tone_hz.round(), 0.5)?), true)?;
    mixer.play(1, Box::new(tone(format, (config.tone_hz * 1.5).round(), 0.3)?), true)?;
    if let Some(voice) = mixer.voice_mut(0) {
        voice.set_level(level);
    }
    if let Some(voice) = mixer.voice_mut(1) {
        voice.set_level(Lfo::new(0.25, 0.5, 0.5));
    }

    let cutoff: ControlInput = if config.filter_lfo_hz > 0.0 {
        let depth = config.filter_cutoff_hz * 0.75;
        Lfo::new(config.filter_lfo_hz, depth, config.filter_cutoff_hz).into()
    } else {
        config.filter_cutoff_hz.into()
    };
    let mut filter = Filter::new(FilterConfig {
        format,
        buffer_size,
        filters: vec![Biquad::low_pass(cutoff, config.filter_q)],
        mix: config.filter_mix.into(),
    })
    .context("filter")?;
    filter.play(Box::new(mixer), false)?;

    let mut distortion = Distortion::new(DistortionConfig {
        format,
        buffer_size,
        drive: config.distortion_drive.into(),
        pre_gain: config.distortion_pre_gain.into(),
        post_gain: config.distortion_post_gain.into(),
        mode: config.distortion_mode,
        soft_clip: config.distortion_soft_clip,
        mix: config.distortion_mix.into(),
    })
    .context("distortion")?;
    distortion.play(Box::new(filter), false)?;

    let mut pitch = PitchShift::new(PitchShiftConfig {
        format,
        buffer_size,
        semitones: config.pitch_semitones.into(),
        mix: config.pitch_mix.into(),
        ..PitchShiftConfig::default()
    })
    .context("pitch shift")?;
    pitch.play(Box::new(distortion), false)?;

    let mut echo = Echo::new(EchoConfig {
        format,
        buffer_size,
        max_delay_ms: config.echo_max_delay_ms,
        delay_ms: config.echo_delay_ms.into(),
        decay: config.echo_decay.into(),
        mix: config.echo_mix.into(),
        freq_shift: config.echo_freq_shift,
    })
    .context("echo")?;
    echo.play(Box::new(pitch), false)?;

    info!(?format, buffer_size, "chain ready");
    Ok(Box::new(echo))
}

/// Render `duration_secs` through the engine, fading voice 0 out over the second half
fn render_offline(chain: Box<dyn SampleSource>, config: &Config, level: &Knob) {
    let mut engine = EngineState::new();
    engine.handle_command(AudioCommand::Play(chain));

    let channels = config.channel_count as usize;
    let total_frames = (config.duration_secs * config.sample_rate as f64) as usize;
    let mut output = vec![0.0f32; OFFLINE_FRAMES * channels];
    let mut rendered = 0;
    let mut block = 0;

    while rendered < total_frames {
        let progress = rendered as f64 / total_frames as f64;
        level.set(if progress < 0.5 { 1.0 } else { 2.0 * (1.0 - progress) });

        engine.process(&mut output, channels);
        if let AudioEvent::Meter { peak, .. } = engine.meter() {
            info!(block, peak = %format!("{peak:.3}"), "rendered");
        }
        if let Some(AudioEvent::Error(message)) = engine.take_error() {
            warn!(block, %message, "chain stopped");
            break;
        }
        rendered += OFFLINE_FRAMES;
        block += 1;
    }

    info!(frames = rendered, blocks = block, "offline render finished");
}

#[cfg(feature = "playback")]
fn play(chain: Box<dyn SampleSource>, config: &Config, level: Knob) -> anyhow::Result<()> {
    use std::thread;
    use std::time::Duration;

    use blockfx_audio::AudioEngine;
    use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};

    let host = cpal::default_host();
    let device = host
        .default_output_device()
        .context("no audio output device found")?;
    let supported = device
        .default_output_config()
        .context("failed to get audio config")?;
    let mut stream_config: cpal::StreamConfig = supported.into();
    stream_config.sample_rate = cpal::SampleRate(config.sample_rate);
    let device_channels = stream_config.channels as usize;

    let (engine, mut state) = AudioEngine::connect();

    let stream = device
        .build_output_stream(
            &stream_config,
            move |data: &mut [f32], _: &cpal::OutputCallbackInfo| {
                state.process(data, device_channels);
                state.publish();
            },
            |err| {
                warn!(%err, "audio stream error");
            },
            None,
        )
        .context("failed to create audio stream")?;
    stream.play().context("failed to start audio")?;

    if !engine.play(chain) {
        anyhow::bail!("audio engine is not accepting commands");
    }
    let steps = (config.duration_secs * 10.0).ceil() as usize;
    for step in 0..steps {
        let progress = step as f64 / steps as f64;
        level.set(if progress < 0.5 { 1.0 } else { 2.0 * (1.0 - progress) });
        thread::sleep(Duration::from_millis(100));

        let peak = engine.drain_peak();
        info!(step, peak = %format!("{peak:.3}"), "playing");
    }

    engine.shutdown();
    thread::sleep(Duration::from_millis(50));
    Ok(())
}

#[cfg(not(feature = "playback"))]
fn play(_chain: Box<dyn SampleSource>, _config: &Config, _level: Knob) -> anyhow::Result<()> {
    anyhow::bail!("built without the `playback` feature")
}
