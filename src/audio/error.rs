//! Error types for playback and export.

use thiserror::Error;

/// Errors from the live output device.
///
/// These never escape [`AudioEngine`](super::engine::AudioEngine) playback
/// calls; they are logged and playback degrades to silence.
#[derive(Debug, Error)]
pub enum AudioError {
    /// No output device could be opened.
    #[error("audio output unavailable: {0}")]
    OutputUnavailable(String),
    /// The device refused to leave its suspended state.
    #[error("failed to resume audio output: {0}")]
    ResumeFailed(String),
}

/// Errors from offline rendering and encoding.
#[derive(Debug, Error)]
pub enum ExportError {
    /// Sample rate outside the supported range.
    #[error("sample rate {0} Hz is outside 3000-768000 Hz")]
    InvalidSampleRate(u32),
    /// Render duration is negative or not a number.
    #[error("render duration {0} s is not a positive number")]
    InvalidDuration(f64),
    /// The render would produce no samples.
    #[error("nothing to render: duration rounds to zero samples")]
    EmptyRender,
    /// Buffer has no channels, or channels of different lengths.
    #[error("malformed sample buffer: {0}")]
    MalformedBuffer(String),
    /// Encoded data would overflow the 32-bit RIFF size fields.
    #[error("audio data of {0} bytes is too large for a WAV file")]
    TooLarge(u64),
    /// The WAV writer rejected the stream.
    #[error("failed to encode WAV data: {0}")]
    Encode(#[from] hound::Error),
}
