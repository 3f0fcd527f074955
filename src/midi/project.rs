//! Project container.
//!
//! A project is the read-only snapshot the audio core receives on every
//! playback or render call: tempo, key, and an ordered list of tracks.

use super::track::Track;
use super::{seconds_per_beat, DEFAULT_TEMPO};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Project length in beats when none is given.
pub const DEFAULT_TOTAL_BEATS: f64 = 32.0;

fn default_tempo() -> f64 {
    DEFAULT_TEMPO
}

/// Represents a complete composition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Project name.
    #[serde(default)]
    pub name: String,

    /// Tempo in beats per minute.
    #[serde(default = "default_tempo")]
    pub tempo: f64,

    /// Musical key, informational only ("C major", "A minor", ...).
    #[serde(default)]
    pub key: String,

    /// Tracks in insertion order.
    #[serde(default)]
    pub tracks: Vec<Track>,

    /// Length of the arrangement in beats, if the editor set one.
    #[serde(
        rename = "totalBeats",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub total_beats: Option<f64>,
}

impl Project {
    /// Creates a new empty project at 120 BPM.
    ///
    /// # Arguments
    ///
    /// * `name` - Project name
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tempo: DEFAULT_TEMPO,
            key: String::new(),
            tracks: Vec::new(),
            total_beats: None,
        }
    }

    /// Builder-style tempo setter.
    pub fn with_tempo(mut self, tempo: f64) -> Self {
        self.tempo = tempo;
        self
    }

    /// Adds a track to the project and returns its index.
    pub fn add_track(&mut self, track: Track) -> usize {
        self.tracks.push(track);
        self.tracks.len() - 1
    }

    /// Returns all tracks in the project.
    pub fn tracks(&self) -> &[Track] {
        &self.tracks
    }

    /// Returns the number of tracks in the project.
    pub fn track_count(&self) -> usize {
        self.tracks.len()
    }

    /// Returns tracks that should be heard (everything not muted).
    pub fn playable_tracks(&self) -> impl Iterator<Item = &Track> {
        self.tracks.iter().filter(|t| !t.muted)
    }

    /// Length of the arrangement in beats, falling back to the default.
    pub fn total_beats(&self) -> f64 {
        match self.total_beats {
            Some(beats) if beats.is_finite() && beats > 0.0 => beats,
            _ => DEFAULT_TOTAL_BEATS,
        }
    }

    /// Length of one beat in seconds at the project tempo.
    pub fn seconds_per_beat(&self) -> f64 {
        seconds_per_beat(self.tempo)
    }

    /// Length of the arrangement in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.total_beats() * self.seconds_per_beat()
    }

    /// Creates a copy of this project that contains only `track`.
    ///
    /// Tempo, key and arrangement length are kept so the track renders
    /// exactly where it sits in the full mix.
    pub fn with_single_track(&self, track: &Track) -> Self {
        Self {
            name: self.name.clone(),
            tempo: self.tempo,
            key: self.key.clone(),
            tracks: vec![track.clone()],
            total_beats: self.total_beats,
        }
    }

    /// Serializes the project to JSON.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Loads a project from JSON.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Loads a project from a JSON file.
    ///
    /// # Errors
    ///
    /// Returns error if file reading or parsing fails
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<Self, std::io::Error> {
        let json = fs::read_to_string(path)?;
        serde_json::from_str(&json)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
    }
}

impl Default for Project {
    fn default() -> Self {
        Self::new("Untitled Project")
    }
}

/// Per-call playback window for the realtime engine.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct PlaybackOptions {
    /// First beat to play; notes starting earlier are skipped.
    pub start_time: f64,
    /// Beat at which scheduling stops (exclusive).
    pub end_time: Option<f64>,
    /// Keep playing until stopped instead of auto-stopping at the end.
    pub loop_playback: bool,
}

impl PlaybackOptions {
    /// Plays the beat range `[start, end)` once.
    pub fn window(start: f64, end: f64) -> Self {
        Self {
            start_time: start,
            end_time: Some(end),
            loop_playback: false,
        }
    }

    /// Marks the playback as looping (no auto-stop).
    pub fn looping(mut self) -> Self {
        self.loop_playback = true;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_project_creation() {
        let project = Project::new("Test");
        assert_eq!(project.name, "Test");
        assert_eq!(project.tempo, 120.0);
        assert_eq!(project.track_count(), 0);
        assert_eq!(project.total_beats(), DEFAULT_TOTAL_BEATS);
    }

    #[test]
    fn test_duration_seconds() {
        let mut project = Project::new("Test").with_tempo(60.0);
        project.total_beats = Some(16.0);
        assert_eq!(project.duration_seconds(), 16.0);

        project.total_beats = Some(0.0);
        assert_eq!(project.total_beats(), DEFAULT_TOTAL_BEATS);
    }

    #[test]
    fn test_playable_tracks() {
        let mut project = Project::new("Test");
        project.add_track(Track::new("Lead", "lead"));
        let mut muted = Track::new("Pad", "pad");
        muted.muted = true;
        project.add_track(muted);
        project.add_track(Track::new("Bass", "bass"));

        let names: Vec<_> = project.playable_tracks().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["Lead", "Bass"]);
    }

    #[test]
    fn test_with_single_track() {
        let mut project = Project::new("Song").with_tempo(90.0);
        project.key = "D minor".to_string();
        project.total_beats = Some(12.0);
        project.add_track(Track::new("Lead", "lead"));
        project.add_track(Track::new("Bass", "bass"));

        let stem = project.with_single_track(&project.tracks[1]);
        assert_eq!(stem.tempo, 90.0);
        assert_eq!(stem.key, "D minor");
        assert_eq!(stem.total_beats, Some(12.0));
        assert_eq!(stem.track_count(), 1);
        assert_eq!(stem.tracks[0].name, "Bass");
    }

    #[test]
    fn test_editor_json() {
        let json = r#"{
            "name": "Late Night",
            "tempo": 85,
            "key": "A minor",
            "totalBeats": 16,
            "tracks": [
                {"name": "Drums", "instrument": "drums", "volume": 0.9, "notes": [
                    {"note": 36, "time": 0, "duration": 0.5, "velocity": 110}
                ]}
            ]
        }"#;
        let project = Project::from_json(json).unwrap();
        assert_eq!(project.tempo, 85.0);
        assert_eq!(project.total_beats(), 16.0);
        assert_eq!(project.tracks[0].notes[0].pitch, 36);

        let reloaded = Project::from_json(&project.to_json().unwrap()).unwrap();
        assert_eq!(reloaded, project);
    }

    #[test]
    fn test_incomplete_note_does_not_reject_project() {
        let json = r#"{
            "tempo": 120,
            "tracks": [
                {"name": "Lead", "instrument": "lead", "notes": [
                    {"note": 60, "time": 0, "duration": 1},
                    {"note": 62, "time": 1},
                    {"time": 2, "duration": 1},
                    {"note": 64, "time": 3, "duration": 1}
                ]}
            ]
        }"#;
        let project = Project::from_json(json).unwrap();
        let notes = &project.tracks[0].notes;
        assert_eq!(notes.len(), 4);
        let valid: Vec<u8> = notes
            .iter()
            .filter(|n| n.validate().is_ok())
            .map(|n| n.pitch)
            .collect();
        assert_eq!(valid, vec![60, 64]);
        assert_eq!(project.tracks[0].duration_beats(), 4.0);
    }
}
