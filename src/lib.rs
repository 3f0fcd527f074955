//! rollsynth - playback and export for piano-roll projects.
//!
//! This library provides the audio core behind a piano-roll editor: live
//! playback of a [`Project`] and offline rendering to WAV.

pub mod audio;
pub mod midi;

// Re-export commonly used types
pub use audio::{export_stems, export_to_wav, AudioEngine, RenderOptions};
pub use midi::{Note, PlaybackOptions, Project, Track};
