//! Symbolic music data and musical-time conversions.
//!
//! This module provides the project/track/note types handed to the audio
//! core by the editing layer, plus the helpers that map beats and MIDI
//! pitches onto seconds and hertz.

mod note;
mod project;
mod track;

pub use note::{Note, NoteError};
pub use project::{PlaybackOptions, Project, DEFAULT_TOTAL_BEATS};
pub use track::{Track, DEFAULT_TRACK_VOLUME};

/// Standard MIDI note names for display purposes.
/// Maps MIDI note number (0-127) to note name within an octave.
pub const NOTE_NAMES: [&str; 12] = [
    "C", "C#", "D", "D#", "E", "F", "F#", "G", "G#", "A", "A#", "B",
];

/// Default tempo in beats per minute.
pub const DEFAULT_TEMPO: f64 = 120.0;

/// Concert pitch of A4 (MIDI note 69) in Hz.
pub const A4_FREQUENCY: f64 = 440.0;

/// Converts a MIDI note number to a human-readable note name with octave.
///
/// # Arguments
///
/// * `note` - MIDI note number (0-127)
///
/// # Returns
///
/// String representation like "C4" or "F#5"
///
/// # Examples
///
/// ```
/// use rollsynth::midi::note_to_name;
///
/// let name = note_to_name(60); // Middle C
/// assert_eq!(name, "C4");
/// ```
pub fn note_to_name(note: u8) -> String {
    let octave = (note / 12) as i8 - 1; // MIDI octave convention
    let note_index = (note % 12) as usize;
    format!("{}{}", NOTE_NAMES[note_index], octave)
}

/// Returns the tempo to use for timing, substituting the default for
/// tempos that cannot drive a clock (zero, negative, NaN, infinite).
pub fn effective_tempo(tempo: f64) -> f64 {
    if tempo.is_finite() && tempo > 0.0 {
        tempo
    } else {
        tracing::debug!("Tempo {} is unusable, falling back to {}", tempo, DEFAULT_TEMPO);
        DEFAULT_TEMPO
    }
}

/// Length of one beat in seconds at the given tempo.
///
/// # Examples
///
/// ```
/// use rollsynth::midi::seconds_per_beat;
///
/// assert_eq!(seconds_per_beat(120.0), 0.5);
/// assert_eq!(seconds_per_beat(0.0), 0.5); // falls back to 120 BPM
/// ```
pub fn seconds_per_beat(tempo: f64) -> f64 {
    60.0 / effective_tempo(tempo)
}

/// Converts a beat position to seconds, measured from `origin_beat`.
///
/// Realtime playback passes the window start as origin so that
/// "play from beat 8" places beat 8 at t=0; offline rendering passes 0.
///
/// # Arguments
///
/// * `beat` - Beat position to convert
/// * `tempo` - Tempo in beats per minute
/// * `origin_beat` - Beat that maps to 0 seconds
pub fn beat_to_seconds(beat: f64, tempo: f64, origin_beat: f64) -> f64 {
    (beat - origin_beat) * seconds_per_beat(tempo)
}

/// Converts a MIDI pitch to its equal-tempered frequency in Hz.
///
/// ```
/// use rollsynth::midi::midi_to_frequency;
///
/// assert_eq!(midi_to_frequency(69), 440.0);
/// ```
pub fn midi_to_frequency(note: u8) -> f64 {
    A4_FREQUENCY * 2f64.powf((note as f64 - 69.0) / 12.0)
}
