//! Demo configuration: stream format and effect parameters as `key = value` lines

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use blockfx_audio::DistortionMode;
use tracing::{info, warn};

/// Application configuration
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub sample_rate: u32,
    pub channel_count: u8,
    pub bits_per_sample: u8,
    pub samples_signed: bool,
    /// Bytes per block
    pub buffer_size: usize,

    /// Seconds rendered in offline mode
    pub duration_secs: f64,
    /// Pitch of the first demo voice; the second plays a fifth above
    pub tone_hz: f64,

    pub filter_cutoff_hz: f64,
    pub filter_q: f64,
    /// Cutoff sweep rate; 0 keeps the cutoff fixed
    pub filter_lfo_hz: f64,
    pub filter_mix: f64,

    pub distortion_drive: f64,
    pub distortion_pre_gain: f64,
    pub distortion_post_gain: f64,
    pub distortion_mode: DistortionMode,
    pub distortion_soft_clip: bool,
    pub distortion_mix: f64,

    /// Shift of the pitch stage; a mix of 0 leaves it out of the sound
    pub pitch_semitones: f64,
    pub pitch_mix: f64,

    pub echo_max_delay_ms: f64,
    pub echo_delay_ms: f64,
    pub echo_decay: f64,
    pub echo_mix: f64,
    pub echo_freq_shift: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sample_rate: 8000,
            channel_count: 1,
            bits_per_sample: 16,
            samples_signed: true,
            buffer_size: 512,
            duration_secs: 2.0,
            tone_hz: 220.0,
            filter_cutoff_hz: 1200.0,
            filter_q: 0.707,
            filter_lfo_hz: 0.5,
            filter_mix: 1.0,
            distortion_drive: 0.0,
            distortion_pre_gain: 0.0,
            distortion_post_gain: 0.0,
            distortion_mode: DistortionMode::Clip,
            distortion_soft_clip: false,
            distortion_mix: 1.0,
            pitch_semitones: 12.0,
            pitch_mix: 0.25,
            echo_max_delay_ms: 500.0,
            echo_delay_ms: 250.0,
            echo_decay: 0.7,
            echo_mix: 0.5,
            echo_freq_shift: false,
        }
    }
}

impl Config {
    /// Default config file: `<config dir>/blockfx/config.txt`
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("blockfx")
            .join("config.txt")
    }

    /// Read `path`; a missing file gives the defaults
    pub fn load(path: &Path) -> io::Result<Self> {
        match fs::read_to_string(path) {
            Ok(content) => Ok(Self::parse(&content)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                info!(path = %path.display(), "config not found, using defaults");
                Ok(Self::default())
            }
            Err(err) => Err(err),
        }
    }

    /// Write to `path`, creating its directory
    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, self.serialize())
    }

    /// Parse `key = value` lines; `#` starts a comment line
    ///
    /// Unknown keys and unparsable values are logged and keep the defaults.
    fn parse(content: &str) -> Self {
        let mut config = Self::default();

        for (number, line) in content.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                warn!(line = number + 1, "config line without '=' skipped");
                continue;
            };
            let (key, value) = (key.trim(), value.trim());
            match config.apply(key, value) {
                Ok(()) => {}
                Err(Rejected::UnknownKey) => warn!(line = number + 1, key, "unknown config key"),
                Err(Rejected::BadValue) => {
                    warn!(line = number + 1, key, value, "bad config value, default kept")
                }
            }
        }

        config
    }

    fn apply(&mut self, key: &str, value: &str) -> Result<(), Rejected> {
        match key {
            "sample_rate" => set(&mut self.sample_rate, value),
            "channel_count" => set(&mut self.channel_count, value),
            "bits_per_sample" => set(&mut self.bits_per_sample, value),
            "samples_signed" => set(&mut self.samples_signed, value),
            "buffer_size" => set(&mut self.buffer_size, value),
            "duration_secs" => set(&mut self.duration_secs, value),
            "tone_hz" => set(&mut self.tone_hz, value),
            "filter_cutoff_hz" => set(&mut self.filter_cutoff_hz, value),
            "filter_q" => set(&mut self.filter_q, value),
            "filter_lfo_hz" => set(&mut self.filter_lfo_hz, value),
            "filter_mix" => set(&mut self.filter_mix, value),
            "distortion_drive" => set(&mut self.distortion_drive, value),
            "distortion_pre_gain" => set(&mut self.distortion_pre_gain, value),
            "distortion_post_gain" => set(&mut self.distortion_post_gain, value),
            "distortion_mode" => {
                self.distortion_mode = parse_mode(value).ok_or(Rejected::BadValue)?;
                Ok(())
            }
            "distortion_soft_clip" => set(&mut self.distortion_soft_clip, value),
            "distortion_mix" => set(&mut self.distortion_mix, value),
            "pitch_semitones" => set(&mut self.pitch_semitones, value),
            "pitch_mix" => set(&mut self.pitch_mix, value),
            "echo_max_delay_ms" => set(&mut self.echo_max_delay_ms, value),
            "echo_delay_ms" => set(&mut self.echo_delay_ms, value),
            "echo_decay" => set(&mut self.echo_decay, value),
            "echo_mix" => set(&mut self.echo_mix, value),
            "echo_freq_shift" => set(&mut self.echo_freq_shift, value),
            _ => Err(Rejected::UnknownKey),
        }
    }

    /// Serialize config to simple key=value format
    fn serialize(&self) -> String {
        let lines = [
            "# blockfx configuration".to_string(),
            format!("sample_rate={}", self.sample_rate),
            format!("channel_count={}", self.channel_count),
            format!("bits_per_sample={}", self.bits_per_sample),
            format!("samples_signed={}", self.samples_signed),
            format!("buffer_size={}", self.buffer_size),
            format!("duration_secs={}", self.duration_secs),
            format!("tone_hz={}", self.tone_hz),
            format!("filter_cutoff_hz={}", self.filter_cutoff_hz),
            format!("filter_q={}", self.filter_q),
            format!("filter_lfo_hz={}", self.filter_lfo_hz),
            format!("filter_mix={}", self.filter_mix),
            format!("distortion_drive={}", self.distortion_drive),
            format!("distortion_pre_gain={}", self.distortion_pre_gain),
            format!("distortion_post_gain={}", self.distortion_post_gain),
            format!("distortion_mode={}", mode_name(self.distortion_mode)),
            format!("distortion_soft_clip={}", self.distortion_soft_clip),
            format!("distortion_mix={}", self.distortion_mix),
            format!("pitch_semitones={}", self.pitch_semitones),
            format!("pitch_mix={}", self.pitch_mix),
            format!("echo_max_delay_ms={}", self.echo_max_delay_ms),
            format!("echo_delay_ms={}", self.echo_delay_ms),
            format!("echo_decay={}", self.echo_decay),
            format!("echo_mix={}", self.echo_mix),
            format!("echo_freq_shift={}", self.echo_freq_shift),
        ];

        lines.join("\n")
    }
}

/// Why a config line was not applied
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Rejected {
    UnknownKey,
    BadValue,
}

fn set<T: FromStr>(field: &mut T, value: &str) -> Result<(), Rejected> {
    *field = value.parse().map_err(|_| Rejected::BadValue)?;
    Ok(())
}

fn parse_mode(value: &str) -> Option<DistortionMode> {
    match value.to_ascii_lowercase().as_str() {
        "clip" => Some(DistortionMode::Clip),
        "lofi" => Some(DistortionMode::LoFi),
        "overdrive" => Some(DistortionMode::Overdrive),
        "waveshape" => Some(DistortionMode::WaveShape),
        _ => None,
    }
}

fn mode_name(mode: DistortionMode) -> &'static str {
    match mode {
        DistortionMode::Clip => "clip",
        DistortionMode::LoFi => "lofi",
        DistortionMode::Overdrive => "overdrive",
        DistortionMode::WaveShape => "waveshape",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_empty_gives_defaults() {
        let config = Config::parse("");
        assert_eq!(config, Config::default());
        assert_eq!(config.echo_delay_ms, 250.0);
        assert_eq!(config.echo_decay, 0.7);
        assert_eq!(config.echo_mix, 0.5);
        assert_eq!(config.echo_max_delay_ms, 500.0);
        assert_eq!(config.buffer_size, 512);
    }

    #[test]
    fn test_parse_with_comments_and_unknown_keys() {
        let content = "# Comment\necho_delay_ms = 120\nnot_a_key=3\n# Another comment\nchannel_count=2";
        let config = Config::parse(content);
        assert_eq!(config.echo_delay_ms, 120.0);
        assert_eq!(config.channel_count, 2);
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = Config::parse("sample_rate=fast\ndistortion_mode=fuzz\nsamples_signed=maybe");
        assert_eq!(config.sample_rate, 8000);
        assert_eq!(config.distortion_mode, DistortionMode::Clip);
        assert!(config.samples_signed);
    }

    #[test]
    fn test_parse_distortion_mode() {
        let config = Config::parse("distortion_mode=LoFi\ndistortion_soft_clip=true");
        assert_eq!(config.distortion_mode, DistortionMode::LoFi);
        assert!(config.distortion_soft_clip);
    }

    #[test]
    fn test_serialize_roundtrip() {
        let config = Config {
            bits_per_sample: 8,
            samples_signed: false,
            echo_freq_shift: true,
            distortion_mode: DistortionMode::WaveShape,
            filter_q: 2.5,
            ..Config::default()
        };

        let parsed = Config::parse(&config.serialize());
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_apply_reports_rejections() {
        let mut config = Config::default();
        assert_eq!(config.apply("pitch_mix", "0.75"), Ok(()));
        assert_eq!(config.pitch_mix, 0.75);
        assert_eq!(config.apply("pitch_mix", "lots"), Err(Rejected::BadValue));
        assert_eq!(config.apply("distortion_mode", "fuzz"), Err(Rejected::BadValue));
        assert_eq!(config.apply("reverb_mix", "1"), Err(Rejected::UnknownKey));
        assert_eq!(config.pitch_mix, 0.75);
    }

    #[test]
    fn test_line_without_separator_is_skipped() {
        let config = Config::parse("echo_mix 0.9\necho_decay=0.2");
        assert_eq!(config.echo_mix, 0.5);
        assert_eq!(config.echo_decay, 0.2);
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = std::env::temp_dir().join(format!("blockfx-config-{}", std::process::id()));
        let path = dir.join("nested").join("config.txt");
        let config = Config {
            echo_delay_ms: 80.0,
            pitch_semitones: -5.0,
            ..Config::default()
        };
        config.save_to(&path).unwrap();
        assert_eq!(Config::load(&path).unwrap(), config);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_missing_file_gives_defaults() {
        let path = std::env::temp_dir().join(format!("blockfx-missing-{}.txt", std::process::id()));
        assert_eq!(Config::load(&path).unwrap(), Config::default());
    }

    #[test]
    fn test_unreadable_path_is_an_error() {
        // A directory cannot be read as a file
        assert!(Config::load(&std::env::temp_dir()).is_err());
    }
}
