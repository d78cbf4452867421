//! Biquad stage descriptors and their fixed-point runtime state
//!
//! Coefficients come from the RBJ audio EQ cookbook, are evaluated in floating point
//! and then quantized to Q15 for the integer sample path.

use std::f64::consts::PI;

use crate::control::ControlInput;

/// Fractional bits of the quantized coefficients
const COEFF_BITS: u32 = 15;

/// Biquad response type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BiquadMode {
    #[default]
    LowPass,
    HighPass,
    BandPass,
    Notch,
    Peaking,
    LowShelf,
    HighShelf,
}

/// One stage of a filter chain
#[derive(Debug, Clone)]
pub struct Biquad {
    pub mode: BiquadMode,
    /// Corner or center frequency in Hz
    pub frequency: ControlInput,
    /// Resonance / bandwidth
    pub q: ControlInput,
    /// Boost or cut in dB (Peaking and shelf modes only)
    pub gain_db: ControlInput,
}

impl Biquad {
    pub fn new(
        mode: BiquadMode,
        frequency: impl Into<ControlInput>,
        q: impl Into<ControlInput>,
    ) -> Self {
        Self {
            mode,
            frequency: frequency.into(),
            q: q.into(),
            gain_db: ControlInput::Constant(0.0),
        }
    }

    pub fn low_pass(frequency: impl Into<ControlInput>, q: impl Into<ControlInput>) -> Self {
        Self::new(BiquadMode::LowPass, frequency, q)
    }

    pub fn high_pass(frequency: impl Into<ControlInput>, q: impl Into<ControlInput>) -> Self {
        Self::new(BiquadMode::HighPass, frequency, q)
    }

    pub fn band_pass(frequency: impl Into<ControlInput>, q: impl Into<ControlInput>) -> Self {
        Self::new(BiquadMode::BandPass, frequency, q)
    }

    /// Set the shelf/peak gain
    pub fn with_gain_db(mut self, gain_db: impl Into<ControlInput>) -> Self {
        self.gain_db = gain_db.into();
        self
    }

    /// The stage's modulation slots
    pub fn inputs(&self) -> [&ControlInput; 3] {
        [&self.frequency, &self.q, &self.gain_db]
    }

    /// Current parameters, clamped to what the cookbook formulas tolerate
    fn params(&self, sample_rate: u32) -> Params {
        let nyquist = sample_rate as f64 / 2.0;
        Params {
            frequency: self.frequency.get_limited(1.0, (nyquist * 0.98).max(1.0)),
            q: self.q.get_limited(0.025, 40.0),
            gain_db: self.gain_db.get_limited(-24.0, 24.0),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Params {
    frequency: f64,
    q: f64,
    gain_db: f64,
}

/// Normalized coefficients in Q15: `b0 b1 b2 a1 a2`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
struct Coefficients {
    b0: i32,
    b1: i32,
    b2: i32,
    a1: i32,
    a2: i32,
}

impl Coefficients {
    fn design(mode: BiquadMode, params: Params, sample_rate: u32) -> Self {
        let omega = 2.0 * PI * params.frequency / sample_rate as f64;
        let sin_omega = omega.sin();
        let cos_omega = omega.cos();
        let alpha = sin_omega / (2.0 * params.q);
        let a = 10f64.powf(params.gain_db / 40.0);
        let shelf = 2.0 * a.sqrt() * alpha;

        let (b0, b1, b2, a0, a1, a2) = match mode {
            BiquadMode::LowPass => (
                (1.0 - cos_omega) / 2.0,
                1.0 - cos_omega,
                (1.0 - cos_omega) / 2.0,
                1.0 + alpha,
                -2.0 * cos_omega,
                1.0 - alpha,
            ),
            BiquadMode::HighPass => (
                (1.0 + cos_omega) / 2.0,
                -(1.0 + cos_omega),
                (1.0 + cos_omega) / 2.0,
                1.0 + alpha,
                -2.0 * cos_omega,
                1.0 - alpha,
            ),
            BiquadMode::BandPass => (
                alpha,
                0.0,
                -alpha,
                1.0 + alpha,
                -2.0 * cos_omega,
                1.0 - alpha,
            ),
            BiquadMode::Notch => (
                1.0,
                -2.0 * cos_omega,
                1.0,
                1.0 + alpha,
                -2.0 * cos_omega,
                1.0 - alpha,
            ),
            BiquadMode::Peaking => (
                1.0 + alpha * a,
                -2.0 * cos_omega,
                1.0 - alpha * a,
                1.0 + alpha / a,
                -2.0 * cos_omega,
                1.0 - alpha / a,
            ),
            BiquadMode::LowShelf => (
                a * ((a + 1.0) - (a - 1.0) * cos_omega + shelf),
                2.0 * a * ((a - 1.0) - (a + 1.0) * cos_omega),
                a * ((a + 1.0) - (a - 1.0) * cos_omega - shelf),
                (a + 1.0) + (a - 1.0) * cos_omega + shelf,
                -2.0 * ((a - 1.0) + (a + 1.0) * cos_omega),
                (a + 1.0) + (a - 1.0) * cos_omega - shelf,
            ),
            BiquadMode::HighShelf => (
                a * ((a + 1.0) + (a - 1.0) * cos_omega + shelf),
                -2.0 * a * ((a - 1.0) + (a + 1.0) * cos_omega),
                a * ((a + 1.0) + (a - 1.0) * cos_omega - shelf),
                (a + 1.0) - (a - 1.0) * cos_omega + shelf,
                2.0 * ((a - 1.0) - (a + 1.0) * cos_omega),
                (a + 1.0) - (a - 1.0) * cos_omega - shelf,
            ),
        };

        let quantize = |x: f64| (x / a0 * (1 << COEFF_BITS) as f64).round() as i32;
        Self {
            b0: quantize(b0),
            b1: quantize(b1),
            b2: quantize(b2),
            a1: quantize(a1),
            a2: quantize(a2),
        }
    }
}

/// Direct form I history for one channel: `x1 x2 y1 y2`
#[derive(Debug, Clone, Copy, Default)]
struct History {
    x1: i32,
    x2: i32,
    y1: i32,
    y2: i32,
}

/// Runtime state of one [`Biquad`] stage
#[derive(Debug, Clone)]
pub(crate) struct BiquadState {
    coefficients: Coefficients,
    /// Mode and parameters the coefficients were designed for
    mode: BiquadMode,
    designed: Params,
    history: [History; 2],
}

impl BiquadState {
    pub(crate) fn new(biquad: &Biquad, sample_rate: u32) -> Self {
        let designed = biquad.params(sample_rate);
        Self {
            coefficients: Coefficients::design(biquad.mode, designed, sample_rate),
            mode: biquad.mode,
            designed,
            history: [History::default(); 2],
        }
    }

    /// Redesign the coefficients if the mode or the (already ticked) parameters moved
    pub(crate) fn update(&mut self, biquad: &Biquad, sample_rate: u32) {
        let params = biquad.params(sample_rate);
        if params != self.designed || biquad.mode != self.mode {
            self.coefficients = Coefficients::design(biquad.mode, params, sample_rate);
            self.mode = biquad.mode;
            self.designed = params;
        }
    }

    /// Filter interleaved samples in place; `first` is the block index of `samples[0]`
    pub(crate) fn process(&mut self, samples: &mut [i32], channels: usize, first: usize) {
        let Coefficients { b0, b1, b2, a1, a2 } = self.coefficients;
        let (b0, b1, b2, a1, a2) = (b0 as i64, b1 as i64, b2 as i64, a1 as i64, a2 as i64);
        const ROUND: i64 = 1 << (COEFF_BITS - 1);

        for (i, sample) in samples.iter_mut().enumerate() {
            let h = &mut self.history[(first + i) % channels];
            let x = *sample as i64;
            let acc = b0 * x + b1 * h.x1 as i64 + b2 * h.x2 as i64
                - a1 * h.y1 as i64
                - a2 * h.y2 as i64;
            let y = ((acc + ROUND) >> COEFF_BITS).clamp(i32::MIN as i64, i32::MAX as i64) as i32;

            h.x2 = h.x1;
            h.x1 = *sample;
            h.y2 = h.y1;
            h.y1 = y;
            *sample = y;
        }
    }

    pub(crate) fn reset(&mut self) {
        self.history = [History::default(); 2];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Steady-state peak of a stage fed a sine at `frequency`
    fn response(biquad: &Biquad, frequency: f64) -> f64 {
        let sample_rate = 8000;
        let mut state = BiquadState::new(biquad, sample_rate);
        let mut samples: Vec<i32> = (0..4000)
            .map(|i| {
                let t = i as f64 / sample_rate as f64;
                (10_000.0 * (2.0 * PI * frequency * t).sin()) as i32
            })
            .collect();
        state.process(&mut samples, 1, 0);
        samples[2000..].iter().map(|s| s.abs()).max().unwrap_or(0) as f64 / 10_000.0
    }

    #[test]
    fn test_low_pass_passes_lows_and_cuts_highs() {
        let lp = Biquad::low_pass(500.0, 0.707);
        assert!(response(&lp, 50.0) > 0.95);
        assert!(response(&lp, 3000.0) < 0.1);
    }

    #[test]
    fn test_high_pass_cuts_lows() {
        let hp = Biquad::high_pass(1000.0, 0.707);
        assert!(response(&hp, 50.0) < 0.05);
        assert!(response(&hp, 3500.0) > 0.9);
    }

    #[test]
    fn test_peaking_boosts_center() {
        let peak = Biquad::new(BiquadMode::Peaking, 1000.0, 1.0).with_gain_db(6.0);
        let gain = response(&peak, 1000.0);
        assert!((gain - 2.0).abs() < 0.1, "gain {gain}");
    }

    #[test]
    fn test_notch_removes_center() {
        let notch = Biquad::new(BiquadMode::Notch, 1000.0, 2.0);
        assert!(response(&notch, 1000.0) < 0.05);
    }

    #[test]
    fn test_update_redesigns_only_on_change() {
        let mut biquad = Biquad::low_pass(500.0, 0.707);
        let mut state = BiquadState::new(&biquad, 8000);
        let before = state.coefficients;
        state.update(&biquad, 8000);
        assert_eq!(state.coefficients, before);

        biquad.frequency.assign(2000.0);
        state.update(&biquad, 8000);
        assert_ne!(state.coefficients, before);
    }

    #[test]
    fn test_tiny_sample_rates_clamp_to_one_hz() {
        let lp = Biquad::low_pass(500.0, 0.707);
        for sample_rate in [1, 2, 3] {
            assert!(lp.params(sample_rate).frequency >= 1.0);
            let mut state = BiquadState::new(&lp, sample_rate);
            let mut samples = vec![10_000, -10_000, 5_000, 0];
            state.process(&mut samples, 1, 0);
        }
        assert_eq!(lp.params(2).frequency, 1.0);
        assert_eq!(lp.params(8000).frequency, 500.0);
    }

    #[test]
    fn test_channels_keep_separate_history() {
        let biquad = Biquad::low_pass(200.0, 0.707);
        let mut state = BiquadState::new(&biquad, 8000);
        // Left carries DC, right stays silent
        let mut samples: Vec<i32> = (0..512).map(|i| if i % 2 == 0 { 10_000 } else { 0 }).collect();
        state.process(&mut samples, 2, 0);
        assert!(samples.iter().skip(1).step_by(2).all(|&s| s == 0));
        assert!((samples[510] - 10_000).abs() < 200);
    }
}
