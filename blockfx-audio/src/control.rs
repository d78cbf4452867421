//! Control-rate modulation slots
//!
//! Every effect parameter that may be modulated (level, mix, decay, delay time,
//! filter frequency...) is held in a [`ControlInput`]: either a plain constant or a
//! handle to a live value source. Sources are ticked once per processed block and
//! read once per block, so values are constant within a block.
//!
//! Handles are shared with whatever thread wants to steer them. The audio path only
//! ever `try_lock`s a source and falls back to the last published value when the
//! lock is held elsewhere, so reading a control can never block.

use std::f64::consts::TAU;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

/// A value that evolves with sample time
pub trait BlockSource: Send {
    /// Advance by `frame_count` frames. Afterwards [`value`](BlockSource::value)
    /// is the value at the start of the span about to be produced.
    fn tick(&mut self, sample_rate: u32, frame_count: usize);

    /// Current value
    fn value(&self) -> f64;
}

struct Shared {
    source: Mutex<Box<dyn BlockSource>>,
    published: AtomicU64,
}

/// Shared handle to a dynamic value source
#[derive(Clone)]
pub struct SourceHandle(Arc<Shared>);

impl SourceHandle {
    pub fn new(source: impl BlockSource + 'static) -> Self {
        let published = AtomicU64::new(source.value().to_bits());
        Self(Arc::new(Shared {
            source: Mutex::new(Box::new(source)),
            published,
        }))
    }

    /// Advance the source unless another thread currently holds it
    pub fn tick(&self, sample_rate: u32, frame_count: usize) {
        if let Some(mut source) = self.0.source.try_lock() {
            source.tick(sample_rate, frame_count);
            self.0
                .published
                .store(source.value().to_bits(), Ordering::Release);
        }
    }

    /// Last value published by a tick
    pub fn value(&self) -> f64 {
        f64::from_bits(self.0.published.load(Ordering::Acquire))
    }

    /// Run `f` with exclusive access to the source (control thread only)
    pub fn with<R>(&self, f: impl FnOnce(&mut dyn BlockSource) -> R) -> R {
        let mut source = self.0.source.lock();
        let result = f(&mut **source);
        self.0
            .published
            .store(source.value().to_bits(), Ordering::Release);
        result
    }

    /// Whether both handles refer to the same source
    pub fn ptr_eq(&self, other: &SourceHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

impl fmt::Debug for SourceHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("SourceHandle").field(&self.value()).finish()
    }
}

/// A modulation slot: constant or live
#[derive(Debug, Clone)]
pub enum ControlInput {
    Constant(f64),
    Dynamic(SourceHandle),
}

impl Default for ControlInput {
    fn default() -> Self {
        ControlInput::Constant(0.0)
    }
}

impl ControlInput {
    /// Replace the held value
    pub fn assign(&mut self, value: impl Into<ControlInput>) {
        *self = value.into();
    }

    /// Advance a dynamic source; constants ignore ticks
    pub fn tick(&self, sample_rate: u32, frame_count: usize) {
        if let ControlInput::Dynamic(handle) = self {
            handle.tick(sample_rate, frame_count);
        }
    }

    /// Current value
    #[inline]
    pub fn get(&self) -> f64 {
        match self {
            ControlInput::Constant(value) => *value,
            ControlInput::Dynamic(handle) => handle.value(),
        }
    }

    /// Current value clamped to `[lower, upper]`; NaN reads as `lower`
    #[inline]
    pub fn get_limited(&self, lower: f64, upper: f64) -> f64 {
        let value = self.get();
        if value.is_nan() {
            lower
        } else {
            value.clamp(lower, upper)
        }
    }

    pub fn is_dynamic(&self) -> bool {
        matches!(self, ControlInput::Dynamic(_))
    }

    fn handle(&self) -> Option<&SourceHandle> {
        match self {
            ControlInput::Dynamic(handle) => Some(handle),
            ControlInput::Constant(_) => None,
        }
    }
}

/// Tick a set of slots, advancing a source shared by several slots only once
pub fn tick_all<'a, I>(inputs: I, sample_rate: u32, frame_count: usize)
where
    I: IntoIterator<Item = &'a ControlInput>,
    I::IntoIter: Clone,
{
    let inputs = inputs.into_iter();
    for (i, input) in inputs.clone().enumerate() {
        let Some(handle) = input.handle() else {
            continue;
        };
        let seen = inputs
            .clone()
            .take(i)
            .filter_map(ControlInput::handle)
            .any(|earlier| earlier.ptr_eq(handle));
        if !seen {
            handle.tick(sample_rate, frame_count);
        }
    }
}

impl From<f64> for ControlInput {
    fn from(value: f64) -> Self {
        ControlInput::Constant(value)
    }
}

impl From<f32> for ControlInput {
    fn from(value: f32) -> Self {
        ControlInput::Constant(value as f64)
    }
}

impl From<SourceHandle> for ControlInput {
    fn from(handle: SourceHandle) -> Self {
        ControlInput::Dynamic(handle)
    }
}

impl From<Lfo> for ControlInput {
    fn from(lfo: Lfo) -> Self {
        ControlInput::Dynamic(SourceHandle::new(lfo))
    }
}

impl From<Knob> for ControlInput {
    fn from(knob: Knob) -> Self {
        ControlInput::Dynamic(SourceHandle::new(knob))
    }
}

/// Sine low-frequency oscillator: `offset + scale * sin(phase)`
#[derive(Debug, Clone)]
pub struct Lfo {
    rate_hz: f64,
    scale: f64,
    offset: f64,
    phase_offset: f64,
    /// Position in the cycle (0.0 - 1.0)
    phase: f64,
    value: f64,
}

impl Lfo {
    pub fn new(rate_hz: f64, scale: f64, offset: f64) -> Self {
        let mut lfo = Self {
            rate_hz,
            scale,
            offset,
            phase_offset: 0.0,
            phase: 0.0,
            value: 0.0,
        };
        lfo.value = lfo.evaluate();
        lfo
    }

    /// Start the cycle at `phase_offset` (in cycles)
    pub fn with_phase_offset(mut self, phase_offset: f64) -> Self {
        self.phase_offset = phase_offset.rem_euclid(1.0);
        self.value = self.evaluate();
        self
    }

    fn evaluate(&self) -> f64 {
        self.offset + self.scale * (TAU * (self.phase + self.phase_offset)).sin()
    }
}

impl BlockSource for Lfo {
    fn tick(&mut self, sample_rate: u32, frame_count: usize) {
        self.value = self.evaluate();
        if sample_rate > 0 {
            self.phase += self.rate_hz * frame_count as f64 / sample_rate as f64;
            self.phase = self.phase.rem_euclid(1.0);
        }
    }

    fn value(&self) -> f64 {
        self.value
    }
}

/// A value set from outside the audio path (a UI control, a command handler)
#[derive(Debug, Clone)]
pub struct Knob(Arc<AtomicU64>);

impl Knob {
    pub fn new(value: f64) -> Self {
        Self(Arc::new(AtomicU64::new(value.to_bits())))
    }

    pub fn set(&self, value: f64) {
        self.0.store(value.to_bits(), Ordering::Release);
    }

    pub fn get(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Acquire))
    }
}

impl BlockSource for Knob {
    fn tick(&mut self, _sample_rate: u32, _frame_count: usize) {}

    fn value(&self) -> f64 {
        self.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Counts ticks so tests can see how often a source was advanced
    struct Counter(f64);

    impl BlockSource for Counter {
        fn tick(&mut self, _sample_rate: u32, _frame_count: usize) {
            self.0 += 1.0;
        }

        fn value(&self) -> f64 {
            self.0
        }
    }

    #[test]
    fn test_constant_ignores_ticks_and_clamps() {
        let input = ControlInput::from(1.7);
        input.tick(8000, 256);
        assert_eq!(input.get(), 1.7);
        assert_eq!(input.get_limited(0.0, 1.0), 1.0);
        assert_eq!(ControlInput::from(f64::NAN).get_limited(0.25, 1.0), 0.25);
    }

    #[test]
    fn test_assign_switches_variant() {
        let mut input = ControlInput::from(0.5);
        input.assign(SourceHandle::new(Counter(3.0)));
        assert!(input.is_dynamic());
        assert_eq!(input.get(), 3.0);
        input.assign(0.25);
        assert!(!input.is_dynamic());
    }

    #[test]
    fn test_shared_handle_ticks_once_per_block() {
        let handle = SourceHandle::new(Counter(0.0));
        let a = ControlInput::from(handle.clone());
        let b = ControlInput::from(handle);
        let c = ControlInput::from(0.3);

        tick_all([&a, &b, &c], 8000, 64);
        assert_eq!(a.get(), 1.0);
        assert_eq!(b.get(), 1.0);
    }

    #[test]
    fn test_tick_skips_locked_source() {
        let handle = SourceHandle::new(Counter(0.0));
        let input = ControlInput::from(handle.clone());
        handle.with(|_| input.tick(8000, 64));
        assert_eq!(input.get(), 0.0);
        input.tick(8000, 64);
        assert_eq!(input.get(), 1.0);
    }

    #[test]
    fn test_lfo_value_is_start_of_block() {
        // One full cycle per 4 blocks of 100 frames at 400 Hz sample rate
        let input = ControlInput::from(Lfo::new(1.0, 1.0, 0.0));
        let mut values = Vec::new();
        for _ in 0..5 {
            input.tick(400, 100);
            values.push(input.get());
        }
        assert!(values[0].abs() < 1e-9);
        assert!((values[1] - 1.0).abs() < 1e-9);
        assert!(values[2].abs() < 1e-9);
        assert!((values[3] + 1.0).abs() < 1e-9);
        assert!(values[4].abs() < 1e-9);
    }

    #[test]
    fn test_knob_is_visible_after_set() {
        let knob = Knob::new(0.2);
        let input = ControlInput::from(knob.clone());
        knob.set(0.9);
        // Knobs publish through their own atomic; a tick refreshes the handle copy
        input.tick(8000, 1);
        assert_eq!(input.get(), 0.9);
    }
}
