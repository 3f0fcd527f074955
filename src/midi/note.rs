//! Note representation.
//!
//! A note is a single pitched (or percussive) event positioned in beats,
//! exactly as the editing layer produces it.

use serde::{Deserialize, Deserializer, Serialize};
use thiserror::Error;

/// Velocity applied when a note does not carry one.
pub const DEFAULT_VELOCITY: u8 = 100;

fn default_velocity() -> u8 {
    DEFAULT_VELOCITY
}

/// Pitch given to notes whose pitch is missing or not a MIDI note number.
/// It fails [`Note::validate`], so the note is skipped instead of rejecting
/// the whole project.
const INVALID_PITCH: u8 = u8::MAX;

fn invalid_pitch() -> u8 {
    INVALID_PITCH
}

fn missing_beats() -> f64 {
    f64::NAN
}

fn lenient_pitch<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
    let pitch = Option::<f64>::deserialize(deserializer)?;
    Ok(pitch
        .filter(|p| p.fract() == 0.0 && (0.0..=127.0).contains(p))
        .map_or(INVALID_PITCH, |p| p as u8))
}

fn lenient_beats<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
    Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
}

/// Reasons a note cannot be scheduled.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum NoteError {
    /// Pitch outside the MIDI range.
    #[error("pitch {0} is outside 0-127")]
    PitchOutOfRange(u8),
    /// Velocity outside the MIDI range.
    #[error("velocity {0} is outside 0-127")]
    VelocityOutOfRange(u8),
    /// Start position is negative or not a number.
    #[error("start beat {0} is not a non-negative number")]
    InvalidTime(f64),
    /// Duration is zero, negative or not a number.
    #[error("duration {0} is not a positive number of beats")]
    InvalidDuration(f64),
}

/// A single note with beat-based timing and dynamics.
///
/// Field names on the wire follow the editing layer (`note`, `time`,
/// `duration`, `velocity`). A missing or null pitch, time or duration still
/// loads, as a note that fails [`Note::validate`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Note {
    /// MIDI note number (0-127). 60 = Middle C (C4).
    #[serde(
        rename = "note",
        default = "invalid_pitch",
        deserialize_with = "lenient_pitch"
    )]
    pub pitch: u8,

    /// Start position in beats from the beginning of the project.
    #[serde(default = "missing_beats", deserialize_with = "lenient_beats")]
    pub time: f64,

    /// Length in beats.
    #[serde(default = "missing_beats", deserialize_with = "lenient_beats")]
    pub duration: f64,

    /// Note velocity (0-127).
    #[serde(default = "default_velocity")]
    pub velocity: u8,
}

impl Note {
    /// Creates a new note.
    ///
    /// # Examples
    ///
    /// ```
    /// use rollsynth::midi::Note;
    ///
    /// // Middle C, one beat long, on the downbeat
    /// let note = Note::new(60, 0.0, 1.0, 100);
    /// assert_eq!(note.end(), 1.0);
    /// ```
    pub fn new(pitch: u8, time: f64, duration: f64, velocity: u8) -> Self {
        Self {
            pitch,
            time,
            duration,
            velocity,
        }
    }

    /// Returns the end beat of this note (start + duration).
    pub fn end(&self) -> f64 {
        self.time + self.duration
    }

    /// Velocity normalized to 0.0-1.0.
    pub fn gain(&self) -> f64 {
        self.velocity as f64 / 127.0
    }

    /// Checks whether the note can be turned into sound.
    ///
    /// Notes may extend past the end of the project; that is not an error.
    pub fn validate(&self) -> Result<(), NoteError> {
        if self.pitch > 127 {
            return Err(NoteError::PitchOutOfRange(self.pitch));
        }
        if self.velocity > 127 {
            return Err(NoteError::VelocityOutOfRange(self.velocity));
        }
        if !self.time.is_finite() || self.time < 0.0 {
            return Err(NoteError::InvalidTime(self.time));
        }
        if !self.duration.is_finite() || self.duration <= 0.0 {
            return Err(NoteError::InvalidDuration(self.duration));
        }
        Ok(())
    }

    /// Checks whether the note starts inside a playback window.
    ///
    /// # Arguments
    ///
    /// * `start` - Window start beat (inclusive)
    /// * `end` - Window end beat (exclusive), or unbounded
    pub fn starts_within(&self, start: f64, end: Option<f64>) -> bool {
        self.time >= start && end.is_none_or(|end| self.time < end)
    }
}
