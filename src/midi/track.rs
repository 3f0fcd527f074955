//! Track representation.
//!
//! A track groups notes played by one instrument, together with the mixer
//! settings the audio core applies to them.

use super::note::Note;
use serde::{Deserialize, Serialize};

/// Track volume when none is given.
pub const DEFAULT_TRACK_VOLUME: f64 = 0.8;

fn default_volume() -> f64 {
    DEFAULT_TRACK_VOLUME
}

/// A single track of notes.
///
/// `instrument` is a free-form tag ("lead", "pad", "bass", "drums", ...)
/// resolved to a synthesis voice at playback time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Track {
    /// Human-readable name for the track. Also used to key exported stems.
    pub name: String,

    /// Instrument tag.
    #[serde(default)]
    pub instrument: String,

    /// Track volume (0.0-1.0).
    #[serde(default = "default_volume")]
    pub volume: f64,

    /// Pan position (-1.0 = left, 0.0 = center, 1.0 = right).
    #[serde(default)]
    pub pan: f64,

    /// Whether this track is muted (skipped by playback and export).
    #[serde(default)]
    pub muted: bool,

    /// Notes in insertion order.
    #[serde(default)]
    pub notes: Vec<Note>,
}

impl Track {
    /// Creates a new empty track with default mixer settings.
    ///
    /// # Arguments
    ///
    /// * `name` - Display name for the track
    /// * `instrument` - Instrument tag
    pub fn new(name: impl Into<String>, instrument: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            instrument: instrument.into(),
            volume: DEFAULT_TRACK_VOLUME,
            pan: 0.0,
            muted: false,
            notes: Vec::new(),
        }
    }

    /// Adds a note to the track.
    pub fn add_note(&mut self, note: Note) {
        self.notes.push(note);
    }

    /// Creates and adds a new note to the track.
    ///
    /// # Arguments
    ///
    /// * `pitch` - MIDI note number (0-127)
    /// * `time` - Start position in beats
    /// * `duration` - Length in beats
    /// * `velocity` - Note velocity (0-127)
    pub fn create_note(&mut self, pitch: u8, time: f64, duration: f64, velocity: u8) {
        self.add_note(Note::new(pitch, time, duration, velocity));
    }

    /// Builder-style mixer settings.
    pub fn with_mix(mut self, volume: f64, pan: f64) -> Self {
        self.volume = volume;
        self.pan = pan;
        self
    }

    /// Tag used to pick the synth voice. Tracks without an instrument tag
    /// fall back to their name, so a track called "Bass" plays as bass.
    pub fn instrument_tag(&self) -> &str {
        if self.instrument.trim().is_empty() {
            &self.name
        } else {
            &self.instrument
        }
    }

    /// Returns the end beat of the last sounding note.
    pub fn duration_beats(&self) -> f64 {
        self.notes.iter().map(Note::end).fold(0.0, f64::max)
    }

    /// Returns the number of notes in the track.
    pub fn note_count(&self) -> usize {
        self.notes.len()
    }
}
