//! Sound-generating and processing nodes.
//!
//! Every synthesized voice is assembled from the small set of nodes in this
//! module: oscillators and noise sources produce signal, biquad filters
//! shape it, and gain nodes apply the amplitude envelope. Parameters that
//! change over time are driven by [`AudioParam`] automation timelines.
//!
//! Nodes are rendered sample-by-sample against an absolute clock in seconds,
//! so the same graph sounds identical whether it is pulled by the live mixer
//! or by the offline renderer.

use rand::Rng;
use std::f64::consts::{PI, TAU};
use thiserror::Error;

/// Smallest level exponential ramps decay toward.
///
/// Exponential ramps cannot reach zero, so envelopes end here instead.
pub const SILENCE_FLOOR: f32 = 0.001;

/// Errors raised when a node is stopped or disconnected twice.
///
/// Both are expected during a forced stop (a note may already have finished
/// on its own) and are swallowed by the caller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum NodeError {
    /// The source already stopped, either forcibly or by reaching its end.
    #[error("source has already stopped")]
    AlreadyStopped,
    /// The node was already disconnected from the graph.
    #[error("node is already disconnected")]
    AlreadyDisconnected,
}

/// A node that produces signal and can be halted.
pub trait Stoppable {
    /// Halts the source immediately.
    fn stop(&mut self) -> Result<(), NodeError>;

    /// Returns true once the source will never produce signal again.
    fn is_done(&self) -> bool;
}

/// A node that can be detached from its output.
pub trait Disconnectable {
    /// Detaches the node. A disconnected node outputs silence.
    fn disconnect(&mut self) -> Result<(), NodeError>;
}

/// How a parameter moves from the previous event to this one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Ramp {
    /// Jump to the value at the event time.
    Set,
    /// Straight line from the previous value.
    Linear,
    /// Constant-ratio curve from the previous value.
    Exponential,
}

#[derive(Debug, Clone, Copy)]
struct ParamEvent {
    time: f64,
    value: f32,
    ramp: Ramp,
}

/// A parameter with a timeline of scheduled value changes.
///
/// Events are kept sorted by time. A ramp event describes the curve that
/// ends at its own time, starting from the previous event's value.
#[derive(Debug, Clone)]
pub struct AudioParam {
    default: f32,
    events: Vec<ParamEvent>,
}

impl AudioParam {
    /// Creates a parameter that holds `default` until the first event.
    pub fn new(default: f32) -> Self {
        Self {
            default,
            events: Vec::new(),
        }
    }

    /// Jumps to `value` at `time`.
    pub fn set_value_at(&mut self, value: f32, time: f64) -> &mut Self {
        self.insert(ParamEvent {
            time,
            value,
            ramp: Ramp::Set,
        })
    }

    /// Ramps linearly to `value`, arriving at `time`.
    pub fn linear_ramp_to(&mut self, value: f32, time: f64) -> &mut Self {
        self.insert(ParamEvent {
            time,
            value,
            ramp: Ramp::Linear,
        })
    }

    /// Ramps exponentially to `value`, arriving at `time`.
    ///
    /// If either end of the ramp is zero or the signs differ, the previous
    /// value is held until `time` instead.
    pub fn exponential_ramp_to(&mut self, value: f32, time: f64) -> &mut Self {
        self.insert(ParamEvent {
            time,
            value,
            ramp: Ramp::Exponential,
        })
    }

    fn insert(&mut self, event: ParamEvent) -> &mut Self {
        // Equal times keep insertion order
        let pos = self
            .events
            .iter()
            .position(|e| e.time > event.time)
            .unwrap_or(self.events.len());
        self.events.insert(pos, event);
        self
    }

    /// Returns the parameter value at time `t` (seconds).
    pub fn value_at(&self, t: f64) -> f32 {
        let next_idx = self
            .events
            .iter()
            .position(|e| e.time > t)
            .unwrap_or(self.events.len());

        if next_idx == self.events.len() {
            return self.events.last().map_or(self.default, |e| e.value);
        }
        if next_idx == 0 {
            return self.default;
        }

        let prev = self.events[next_idx - 1];
        let next = self.events[next_idx];
        let span = next.time - prev.time;
        if span <= 0.0 {
            return next.value;
        }
        let progress = (t - prev.time) / span;

        match next.ramp {
            Ramp::Set => prev.value,
            Ramp::Linear => {
                let (v0, v1) = (prev.value as f64, next.value as f64);
                (v0 + (v1 - v0) * progress) as f32
            }
            Ramp::Exponential => {
                let (v0, v1) = (prev.value as f64, next.value as f64);
                if v0 == 0.0 || v1 == 0.0 || (v0 < 0.0) != (v1 < 0.0) {
                    prev.value
                } else {
                    (v0 * (v1 / v0).powf(progress)) as f32
                }
            }
        }
    }
}

/// Oscillator waveform.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Waveform {
    Sine,
    Sawtooth,
}

/// A periodic tone source with an automatable frequency.
#[derive(Debug, Clone)]
pub struct Oscillator {
    waveform: Waveform,
    /// Frequency in Hz.
    pub frequency: AudioParam,
    /// Phase in cycles, kept in [0, 1).
    phase: f64,
    start: f64,
    stop: Option<f64>,
    halted: bool,
    finished: bool,
    connected: bool,
}

impl Oscillator {
    /// Creates an oscillator that starts immediately and runs forever
    /// unless scheduled otherwise.
    pub fn new(waveform: Waveform, frequency: f32) -> Self {
        Self {
            waveform,
            frequency: AudioParam::new(frequency),
            phase: 0.0,
            start: 0.0,
            stop: None,
            halted: false,
            finished: false,
            connected: true,
        }
    }

    /// Schedules the oscillator to start at `time`.
    pub fn start_at(&mut self, time: f64) {
        self.start = time;
    }

    /// Schedules the oscillator to stop at `time`.
    pub fn stop_at(&mut self, time: f64) {
        self.stop = Some(time);
    }

    /// Scheduled start time in seconds.
    pub fn start_time(&self) -> f64 {
        self.start
    }

    /// Renders one sample at time `t`.
    pub fn process(&mut self, t: f64, sample_rate: f64) -> f32 {
        if self.stop.is_some_and(|stop| t >= stop) {
            self.finished = true;
        }
        if self.halted || self.finished || !self.connected || t < self.start {
            return 0.0;
        }

        let value = match self.waveform {
            Waveform::Sine => (TAU * self.phase).sin(),
            Waveform::Sawtooth => 2.0 * (self.phase - (self.phase + 0.5).floor()),
        };

        self.phase += self.frequency.value_at(t) as f64 / sample_rate;
        self.phase -= self.phase.floor();

        value as f32
    }
}

impl Stoppable for Oscillator {
    fn stop(&mut self) -> Result<(), NodeError> {
        if self.is_done() {
            return Err(NodeError::AlreadyStopped);
        }
        self.halted = true;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.halted || self.finished
    }
}

impl Disconnectable for Oscillator {
    fn disconnect(&mut self) -> Result<(), NodeError> {
        if !self.connected {
            return Err(NodeError::AlreadyDisconnected);
        }
        self.connected = false;
        Ok(())
    }
}

/// Fills a buffer of `len` samples with uniform white noise in [-1, 1).
pub fn white_noise<R: Rng + ?Sized>(rng: &mut R, len: usize) -> Vec<f32> {
    (0..len).map(|_| rng.gen::<f32>() * 2.0 - 1.0).collect()
}

/// One-shot playback of a pre-generated sample buffer.
///
/// The buffer is played at the destination's sample rate, one sample per
/// frame, and the source finishes when it runs out.
#[derive(Debug, Clone)]
pub struct NoiseSource {
    buffer: Vec<f32>,
    position: usize,
    start: f64,
    halted: bool,
    connected: bool,
}

impl NoiseSource {
    /// Creates a source over `buffer`, starting at time 0.
    pub fn new(buffer: Vec<f32>) -> Self {
        Self {
            buffer,
            position: 0,
            start: 0.0,
            halted: false,
            connected: true,
        }
    }

    /// Schedules playback to start at `time`.
    pub fn start_at(&mut self, time: f64) {
        self.start = time;
    }

    /// Scheduled start time in seconds.
    pub fn start_time(&self) -> f64 {
        self.start
    }

    /// Number of samples in the buffer.
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    /// Returns true if the buffer holds no samples.
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Renders one sample at time `t`.
    pub fn process(&mut self, t: f64) -> f32 {
        if self.halted || !self.connected || t < self.start {
            return 0.0;
        }
        match self.buffer.get(self.position) {
            Some(&sample) => {
                self.position += 1;
                sample
            }
            None => 0.0,
        }
    }
}

impl Stoppable for NoiseSource {
    fn stop(&mut self) -> Result<(), NodeError> {
        if self.is_done() {
            return Err(NodeError::AlreadyStopped);
        }
        self.halted = true;
        Ok(())
    }

    fn is_done(&self) -> bool {
        self.halted || self.position >= self.buffer.len()
    }
}

impl Disconnectable for NoiseSource {
    fn disconnect(&mut self) -> Result<(), NodeError> {
        if !self.connected {
            return Err(NodeError::AlreadyDisconnected);
        }
        self.connected = false;
        Ok(())
    }
}

/// Biquad filter response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Lowpass,
    Highpass,
}

/// Second-order IIR filter (RBJ cookbook coefficients, direct form I).
#[derive(Debug, Clone)]
pub struct BiquadFilter {
    cutoff: f64,
    b0: f64,
    b1: f64,
    b2: f64,
    a1: f64,
    a2: f64,
    x1: f64,
    x2: f64,
    y1: f64,
    y2: f64,
    connected: bool,
}

impl BiquadFilter {
    /// Creates a filter for the given sample rate.
    ///
    /// The cutoff is clamped just below Nyquist.
    pub fn new(kind: FilterKind, cutoff: f64, q: f64, sample_rate: f64) -> Self {
        let nyquist = sample_rate / 2.0;
        let f0 = cutoff.clamp(1.0, nyquist * 0.999);
        let q = q.max(1e-4);

        let w0 = 2.0 * PI * f0 / sample_rate;
        let (sin_w0, cos_w0) = w0.sin_cos();
        let alpha = sin_w0 / (2.0 * q);

        let (b0, b1, b2) = match kind {
            FilterKind::Lowpass => ((1.0 - cos_w0) / 2.0, 1.0 - cos_w0, (1.0 - cos_w0) / 2.0),
            FilterKind::Highpass => ((1.0 + cos_w0) / 2.0, -(1.0 + cos_w0), (1.0 + cos_w0) / 2.0),
        };
        let a0 = 1.0 + alpha;
        let a1 = -2.0 * cos_w0;
        let a2 = 1.0 - alpha;

        Self {
            cutoff: f0,
            b0: b0 / a0,
            b1: b1 / a0,
            b2: b2 / a0,
            a1: a1 / a0,
            a2: a2 / a0,
            x1: 0.0,
            x2: 0.0,
            y1: 0.0,
            y2: 0.0,
            connected: true,
        }
    }

    /// Lowpass filter shorthand.
    pub fn lowpass(cutoff: f64, q: f64, sample_rate: f64) -> Self {
        Self::new(FilterKind::Lowpass, cutoff, q, sample_rate)
    }

    /// Highpass filter shorthand.
    pub fn highpass(cutoff: f64, q: f64, sample_rate: f64) -> Self {
        Self::new(FilterKind::Highpass, cutoff, q, sample_rate)
    }

    /// Effective cutoff frequency in Hz.
    pub fn cutoff(&self) -> f64 {
        self.cutoff
    }

    /// Filters one sample.
    pub fn process(&mut self, input: f32) -> f32 {
        if !self.connected {
            return 0.0;
        }
        let x0 = input as f64;
        let y0 = self.b0 * x0 + self.b1 * self.x1 + self.b2 * self.x2
            - self.a1 * self.y1
            - self.a2 * self.y2;
        self.x2 = self.x1;
        self.x1 = x0;
        self.y2 = self.y1;
        self.y1 = y0;
        y0 as f32
    }
}

impl Disconnectable for BiquadFilter {
    fn disconnect(&mut self) -> Result<(), NodeError> {
        if !self.connected {
            return Err(NodeError::AlreadyDisconnected);
        }
        self.connected = false;
        Ok(())
    }
}

/// Multiplies its input by an automatable gain.
#[derive(Debug, Clone)]
pub struct GainNode {
    /// Linear gain.
    pub gain: AudioParam,
    connected: bool,
}

impl GainNode {
    pub fn new(gain: f32) -> Self {
        Self {
            gain: AudioParam::new(gain),
            connected: true,
        }
    }

    /// Applies the gain at time `t` to one sample.
    pub fn process(&mut self, input: f32, t: f64) -> f32 {
        if !self.connected {
            return 0.0;
        }
        input * self.gain.value_at(t)
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }
}

impl Disconnectable for GainNode {
    fn disconnect(&mut self) -> Result<(), NodeError> {
        if !self.connected {
            return Err(NodeError::AlreadyDisconnected);
        }
        self.connected = false;
        Ok(())
    }
}
