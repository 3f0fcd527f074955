//! Audio rendering core.
//!
//! This module turns projects into sound. It provides:
//! - A synthesis bank voicing notes per instrument (`synth`, built on `nodes`)
//! - Realtime playback through rodio (`engine`)
//! - Deterministic offline rendering and stem export (`export`, `mixbus`)
//! - 16-bit PCM WAV encoding (`wav`)

pub mod buffer;
pub mod engine;
pub mod error;
pub mod export;
pub mod mixbus;
pub mod nodes;
pub mod synth;
pub mod wav;

pub use buffer::AudioBuffer;
pub use engine::{
    auto_stop_delay, AudioEngine, EngineConfig, NullOutput, OutputBackend, PlaybackState,
    RodioOutput,
};
pub use error::{AudioError, ExportError};
pub use export::{
    export_audio, export_stems, export_to_wav, render, stem_file_name, ExportFormat,
    ExportedAudio, RenderOptions,
};
pub use wav::encode_wav;
