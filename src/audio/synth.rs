//! Instrument synthesis bank.
//!
//! Turns a note event into a [`SoundInstance`]: a small graph of
//! oscillator/noise, filter and envelope nodes whose timbre depends on the
//! track's instrument tag. The bank is written once against the
//! [`AudioDestination`] capability and used by both the live mixer and the
//! offline renderer.
//!
//! # Voices
//!
//! | Tag | Voice |
//! |-----|-------|
//! | `melody`, `lead`, anything unknown | Lead (filtered sawtooth) |
//! | `chords`, `harmony`, `pad` | Pad (two detuned sines) |
//! | `bass` | Bass (sine) |
//! | `drums` | Kick / Snare / HiHat, picked by pitch frequency |

use super::nodes::{
    BiquadFilter, Disconnectable, GainNode, NodeError, NoiseSource, Oscillator, Stoppable,
    Waveform, SILENCE_FLOOR,
};
use tracing::trace;

/// Drum notes below this frequency play the kick.
pub const KICK_MAX_FREQUENCY: f64 = 100.0;

/// Drum notes below this frequency (and at or above the kick limit) play the snare.
pub const SNARE_MAX_FREQUENCY: f64 = 200.0;

/// Fixed kick length in seconds.
const KICK_LENGTH: f64 = 0.5;
/// Snare noise burst length in seconds.
const SNARE_LENGTH: f64 = 0.2;
/// Hi-hat noise burst length in seconds.
const HIHAT_LENGTH: f64 = 0.05;

/// Instrument class resolved from a track's free-form tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instrument {
    Lead,
    Pad,
    Bass,
    Drums,
}

impl Instrument {
    /// Resolves an instrument tag, case-insensitively. Unknown tags play as lead.
    ///
    /// ```
    /// use rollsynth::audio::synth::Instrument;
    ///
    /// assert_eq!(Instrument::from_tag("Harmony"), Instrument::Pad);
    /// assert_eq!(Instrument::from_tag("kazoo"), Instrument::Lead);
    /// ```
    pub fn from_tag(tag: &str) -> Self {
        match tag.trim().to_lowercase().as_str() {
            "chords" | "harmony" | "pad" => Instrument::Pad,
            "bass" => Instrument::Bass,
            "drums" => Instrument::Drums,
            _ => Instrument::Lead,
        }
    }
}

/// A concrete synthesis algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Voice {
    Lead,
    Pad,
    Bass,
    Kick,
    Snare,
    HiHat,
}

impl Voice {
    /// Picks the voice for an instrument playing at `frequency`.
    pub fn resolve(instrument: Instrument, frequency: f64) -> Self {
        match instrument {
            Instrument::Lead => Voice::Lead,
            Instrument::Pad => Voice::Pad,
            Instrument::Bass => Voice::Bass,
            Instrument::Drums => Self::drum_for_frequency(frequency),
        }
    }

    /// Routes a drum note by its pitch frequency: below 100 Hz kick,
    /// below 200 Hz snare, everything else hi-hat.
    pub fn drum_for_frequency(frequency: f64) -> Self {
        if frequency < KICK_MAX_FREQUENCY {
            Voice::Kick
        } else if frequency < SNARE_MAX_FREQUENCY {
            Voice::Snare
        } else {
            Voice::HiHat
        }
    }
}

/// Per-destination differences in how voices are built.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Voicing {
    /// Route the bass oscillator through a 300 Hz resonant lowpass.
    pub bass_lowpass: bool,
}

impl Voicing {
    /// Voicing used for live playback.
    pub const REALTIME: Voicing = Voicing { bass_lowpass: true };
    /// Voicing used for offline export.
    pub const OFFLINE: Voicing = Voicing {
        bass_lowpass: false,
    };
}

/// Everything the bank needs to voice one note.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NoteEvent {
    /// Pitch frequency in Hz. For drums this only selects the drum voice.
    pub frequency: f64,
    /// Start time on the destination clock, in seconds.
    pub start: f64,
    /// End time on the destination clock, in seconds. Ignored by drums.
    pub end: f64,
    /// Linear peak volume.
    pub volume: f32,
}

/// Where synthesized voices are sent.
///
/// Implemented by the live mixer (realtime playback) and the offline
/// render context (export).
pub trait AudioDestination {
    /// Input a voice is connected to (e.g. a track bus).
    type Bus: Copy;
    /// What the destination hands back for a connected voice.
    type Handle;

    /// Sample rate of the destination clock.
    fn sample_rate(&self) -> u32;

    /// Voice construction differences for this destination.
    fn voicing(&self) -> Voicing;

    /// Returns `seconds` worth of white noise for a noise-based voice.
    fn noise_buffer(&mut self, bus: Self::Bus, seconds: f64) -> Vec<f32>;

    /// Takes ownership of a built voice and routes it into `bus`.
    fn connect(&mut self, bus: Self::Bus, instance: SoundInstance) -> Self::Handle;
}

/// The live nodes created for one note.
///
/// Each variant owns exactly the nodes its voice uses, so a forced stop can
/// walk them without knowing which instrument produced them.
#[derive(Debug, Clone)]
pub enum SoundInstance {
    Lead {
        osc: Oscillator,
        filter: BiquadFilter,
        gain: GainNode,
    },
    Pad {
        osc: Oscillator,
        detuned: Oscillator,
        filter: BiquadFilter,
        gain: GainNode,
    },
    Bass {
        osc: Oscillator,
        filter: Option<BiquadFilter>,
        gain: GainNode,
    },
    Kick {
        osc: Oscillator,
        gain: GainNode,
    },
    Snare {
        noise: NoiseSource,
        filter: BiquadFilter,
        gain: GainNode,
    },
    HiHat {
        noise: NoiseSource,
        filter: BiquadFilter,
        gain: GainNode,
    },
}

impl SoundInstance {
    /// Which voice built this instance.
    pub fn voice(&self) -> Voice {
        match self {
            Self::Lead { .. } => Voice::Lead,
            Self::Pad { .. } => Voice::Pad,
            Self::Bass { .. } => Voice::Bass,
            Self::Kick { .. } => Voice::Kick,
            Self::Snare { .. } => Voice::Snare,
            Self::HiHat { .. } => Voice::HiHat,
        }
    }

    /// Time the voice starts sounding, in seconds.
    pub fn start_time(&self) -> f64 {
        match self {
            Self::Lead { osc, .. }
            | Self::Pad { osc, .. }
            | Self::Bass { osc, .. }
            | Self::Kick { osc, .. } => osc.start_time(),
            Self::Snare { noise, .. } | Self::HiHat { noise, .. } => noise.start_time(),
        }
    }

    /// Renders one mono sample at time `t`.
    pub fn process(&mut self, t: f64, sample_rate: f64) -> f32 {
        match self {
            Self::Lead { osc, filter, gain } => {
                let s = filter.process(osc.process(t, sample_rate));
                gain.process(s, t)
            }
            Self::Pad {
                osc,
                detuned,
                filter,
                gain,
            } => {
                let s = osc.process(t, sample_rate) + detuned.process(t, sample_rate);
                gain.process(filter.process(s), t)
            }
            Self::Bass { osc, filter, gain } => {
                let mut s = osc.process(t, sample_rate);
                if let Some(filter) = filter {
                    s = filter.process(s);
                }
                gain.process(s, t)
            }
            Self::Kick { osc, gain } => gain.process(osc.process(t, sample_rate), t),
            Self::Snare {
                noise,
                filter,
                gain,
            }
            | Self::HiHat {
                noise,
                filter,
                gain,
            } => gain.process(filter.process(noise.process(t)), t),
        }
    }

    /// Returns true once nothing more will be heard from this instance.
    pub fn is_finished(&self) -> bool {
        let (sources_done, gain) = match self {
            Self::Lead { osc, gain, .. }
            | Self::Bass { osc, gain, .. }
            | Self::Kick { osc, gain } => (osc.is_done(), gain),
            Self::Pad {
                osc, detuned, gain, ..
            } => (osc.is_done() && detuned.is_done(), gain),
            Self::Snare { noise, gain, .. } | Self::HiHat { noise, gain, .. } => {
                (noise.is_done(), gain)
            }
        };
        sources_done || !gain.is_connected()
    }

    fn sources_mut(&mut self) -> Vec<&mut dyn Stoppable> {
        match self {
            Self::Lead { osc, .. } | Self::Bass { osc, .. } | Self::Kick { osc, .. } => {
                vec![osc as &mut dyn Stoppable]
            }
            Self::Pad { osc, detuned, .. } => {
                vec![osc as &mut dyn Stoppable, detuned as &mut dyn Stoppable]
            }
            Self::Snare { noise, .. } | Self::HiHat { noise, .. } => {
                vec![noise as &mut dyn Stoppable]
            }
        }
    }

    fn nodes_mut(&mut self) -> Vec<&mut dyn Disconnectable> {
        match self {
            Self::Lead { osc, filter, gain } => vec![
                osc as &mut dyn Disconnectable,
                filter as &mut dyn Disconnectable,
                gain as &mut dyn Disconnectable,
            ],
            Self::Pad {
                osc,
                detuned,
                filter,
                gain,
            } => vec![
                osc as &mut dyn Disconnectable,
                detuned as &mut dyn Disconnectable,
                filter as &mut dyn Disconnectable,
                gain as &mut dyn Disconnectable,
            ],
            Self::Bass { osc, filter, gain } => {
                let mut nodes = vec![osc as &mut dyn Disconnectable];
                if let Some(filter) = filter {
                    nodes.push(filter as &mut dyn Disconnectable);
                }
                nodes.push(gain as &mut dyn Disconnectable);
                nodes
            }
            Self::Kick { osc, gain } => vec![
                osc as &mut dyn Disconnectable,
                gain as &mut dyn Disconnectable,
            ],
            Self::Snare {
                noise,
                filter,
                gain,
            }
            | Self::HiHat {
                noise,
                filter,
                gain,
            } => vec![
                noise as &mut dyn Disconnectable,
                filter as &mut dyn Disconnectable,
                gain as &mut dyn Disconnectable,
            ],
        }
    }

    /// Stops every source and disconnects every node.
    ///
    /// Never fails. Nodes that already stopped or were already disconnected
    /// are skipped; the number of such skips is returned.
    pub fn force_stop(&mut self) -> usize {
        let mut skipped = 0;
        for source in self.sources_mut() {
            if let Err(e) = source.stop() {
                note_skip(e, &mut skipped);
            }
        }
        for node in self.nodes_mut() {
            if let Err(e) = node.disconnect() {
                note_skip(e, &mut skipped);
            }
        }
        skipped
    }
}

fn note_skip(error: NodeError, skipped: &mut usize) {
    trace!("Ignoring during stop: {}", error);
    *skipped += 1;
}

/// Builds the voice for `instrument` and connects it to `bus`.
///
/// This is the single entry point both playback paths use.
pub fn schedule_note<D: AudioDestination + ?Sized>(
    dest: &mut D,
    bus: D::Bus,
    instrument: Instrument,
    event: &NoteEvent,
) -> D::Handle {
    let voice = Voice::resolve(instrument, event.frequency);
    let instance = build_voice(dest, bus, voice, event);
    dest.connect(bus, instance)
}

/// Constructs the node graph for `voice` without connecting it.
pub fn build_voice<D: AudioDestination + ?Sized>(
    dest: &mut D,
    bus: D::Bus,
    voice: Voice,
    event: &NoteEvent,
) -> SoundInstance {
    let sample_rate = dest.sample_rate() as f64;
    match voice {
        Voice::Lead => lead(event, sample_rate),
        Voice::Pad => pad(event, sample_rate),
        Voice::Bass => bass(event, sample_rate, dest.voicing()),
        Voice::Kick => kick(event),
        Voice::Snare => {
            let noise = dest.noise_buffer(bus, SNARE_LENGTH);
            snare(event, noise, sample_rate)
        }
        Voice::HiHat => {
            let noise = dest.noise_buffer(bus, HIHAT_LENGTH);
            hihat(event, noise, sample_rate)
        }
    }
}

/// Oscillator running from `start` to `end` at a fixed frequency.
fn tone(waveform: Waveform, frequency: f64, start: f64, end: f64) -> Oscillator {
    let mut osc = Oscillator::new(waveform, frequency as f32);
    osc.frequency.set_value_at(frequency as f32, start);
    osc.start_at(start);
    osc.stop_at(end);
    osc
}

/// Attack, sustain-decay and release envelope shared by the pitched voices.
///
/// Rises linearly to `peak` over `attack`, decays exponentially to
/// `sustain` by `max(start + release, end - release)`, then fades to
/// the silence floor at `end`.
fn pitched_envelope(
    event: &NoteEvent,
    peak: f32,
    attack: f64,
    sustain: f32,
    release: f64,
) -> GainNode {
    let (start, end) = (event.start, event.end);
    let mut gain = GainNode::new(1.0);
    gain.gain
        .set_value_at(0.0, start)
        .linear_ramp_to(peak, start + attack)
        .exponential_ramp_to(sustain, (start + release).max(end - release))
        .exponential_ramp_to(SILENCE_FLOOR, end);
    gain
}

/// Percussive envelope: starts at `peak` and decays to silence over `length`.
fn percussive_envelope(start: f64, peak: f32, length: f64) -> GainNode {
    let mut gain = GainNode::new(1.0);
    gain.gain
        .set_value_at(peak, start)
        .exponential_ramp_to(SILENCE_FLOOR, start + length);
    gain
}

fn lead(event: &NoteEvent, sample_rate: f64) -> SoundInstance {
    let v = event.volume;
    SoundInstance::Lead {
        osc: tone(Waveform::Sawtooth, event.frequency, event.start, event.end),
        filter: BiquadFilter::lowpass(2000.0, 1.0, sample_rate),
        gain: pitched_envelope(event, v, 0.02, v * 0.7, 0.1),
    }
}

fn pad(event: &NoteEvent, sample_rate: f64) -> SoundInstance {
    let v = event.volume;
    SoundInstance::Pad {
        osc: tone(Waveform::Sine, event.frequency, event.start, event.end),
        // +1% detune for a slow chorus beat
        detuned: tone(
            Waveform::Sine,
            event.frequency * 1.01,
            event.start,
            event.end,
        ),
        filter: BiquadFilter::lowpass(1200.0, 1.0, sample_rate),
        gain: pitched_envelope(event, v * 0.6, 0.1, v * 0.5, 0.2),
    }
}

fn bass(event: &NoteEvent, sample_rate: f64, voicing: Voicing) -> SoundInstance {
    let v = event.volume;
    SoundInstance::Bass {
        osc: tone(Waveform::Sine, event.frequency, event.start, event.end),
        filter: voicing
            .bass_lowpass
            .then(|| BiquadFilter::lowpass(300.0, 5.0, sample_rate)),
        gain: pitched_envelope(event, v * 1.2, 0.01, v * 0.8, 0.05),
    }
}

fn kick(event: &NoteEvent) -> SoundInstance {
    let start = event.start;
    let mut osc = Oscillator::new(Waveform::Sine, 150.0);
    osc.frequency
        .set_value_at(150.0, start)
        .exponential_ramp_to(50.0, start + 0.1);
    osc.start_at(start);
    osc.stop_at(start + KICK_LENGTH);

    SoundInstance::Kick {
        osc,
        gain: percussive_envelope(start, event.volume * 2.0, KICK_LENGTH),
    }
}

fn snare(event: &NoteEvent, noise: Vec<f32>, sample_rate: f64) -> SoundInstance {
    let mut noise = NoiseSource::new(noise);
    noise.start_at(event.start);
    SoundInstance::Snare {
        noise,
        filter: BiquadFilter::highpass(1000.0, 1.0, sample_rate),
        gain: percussive_envelope(event.start, event.volume * 1.5, SNARE_LENGTH),
    }
}

fn hihat(event: &NoteEvent, noise: Vec<f32>, sample_rate: f64) -> SoundInstance {
    let mut noise = NoiseSource::new(noise);
    noise.start_at(event.start);
    SoundInstance::HiHat {
        noise,
        filter: BiquadFilter::highpass(7000.0, 1.0, sample_rate),
        gain: percussive_envelope(event.start, event.volume, HIHAT_LENGTH),
    }
}
