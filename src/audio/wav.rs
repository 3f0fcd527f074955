//! 16-bit PCM WAV encoding.
//!
//! Mono and stereo buffers get the classic 44-byte RIFF/WAVE header followed
//! by interleaved little-endian samples. Encoding happens entirely in memory,
//! so a failure never leaves a half-written file behind.

use super::buffer::AudioBuffer;
use super::error::ExportError;
use hound::{SampleFormat, WavSpec, WavWriter};
use std::io::Cursor;

/// Size of the canonical header in bytes.
pub const WAV_HEADER_LEN: usize = 44;

/// Bits per encoded sample.
pub const BITS_PER_SAMPLE: u16 = 16;

/// Converts a float sample to 16-bit PCM.
///
/// The sample is clamped to [-1.0, 1.0]; negative values scale by 32768 and
/// the rest by 32767 so both extremes land exactly on the i16 limits.
pub fn sample_to_i16(sample: f32) -> i16 {
    let clamped = if sample.is_nan() {
        0.0
    } else {
        sample.clamp(-1.0, 1.0)
    };
    if clamped < 0.0 {
        (clamped * 32768.0) as i16
    } else {
        (clamped * 32767.0) as i16
    }
}

/// Encodes a buffer as a 16-bit PCM WAV file.
///
/// # Errors
///
/// Returns error if the buffer has no channels, its channels differ in
/// length, or the data would not fit the 32-bit size fields.
///
/// # Examples
///
/// ```
/// use rollsynth::audio::{encode_wav, AudioBuffer};
///
/// let buffer = AudioBuffer::silent(44100, 2, 100);
/// let bytes = encode_wav(&buffer).unwrap();
/// assert_eq!(bytes.len(), 44 + 100 * 2 * 2);
/// assert_eq!(&bytes[0..4], b"RIFF");
/// ```
pub fn encode_wav(buffer: &AudioBuffer) -> Result<Vec<u8>, ExportError> {
    let channel_count = buffer.channel_count();
    if channel_count == 0 || channel_count > u16::MAX as usize {
        return Err(ExportError::MalformedBuffer(format!(
            "{} channels",
            channel_count
        )));
    }
    let frames = buffer.len();
    if buffer.channels().iter().any(|ch| ch.len() != frames) {
        return Err(ExportError::MalformedBuffer(
            "channels differ in length".to_string(),
        ));
    }

    let bytes_per_sample = (BITS_PER_SAMPLE / 8) as u64;
    let data_len = frames as u64 * channel_count as u64 * bytes_per_sample;
    // RIFF size = data + 36 must fit in u32
    if data_len + 36 > u32::MAX as u64 {
        return Err(ExportError::TooLarge(data_len));
    }

    let spec = WavSpec {
        channels: channel_count as u16,
        sample_rate: buffer.sample_rate(),
        bits_per_sample: BITS_PER_SAMPLE,
        sample_format: SampleFormat::Int,
    };
    let mut cursor = Cursor::new(Vec::with_capacity(WAV_HEADER_LEN + data_len as usize));
    let mut writer = WavWriter::new(&mut cursor, spec)?;
    for sample in buffer.interleaved() {
        writer.write_sample(sample_to_i16(sample))?;
    }
    writer.finalize()?;

    Ok(cursor.into_inner())
}
