//! Rendered multi-channel audio.

/// A block of rendered audio, stored one `Vec` per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioBuffer {
    sample_rate: u32,
    channels: Vec<Vec<f32>>,
}

impl AudioBuffer {
    /// Creates a silent buffer.
    ///
    /// # Arguments
    ///
    /// * `sample_rate` - Sample rate in Hz
    /// * `channels` - Number of channels
    /// * `frames` - Number of samples per channel
    pub fn silent(sample_rate: u32, channels: usize, frames: usize) -> Self {
        Self {
            sample_rate,
            channels: vec![vec![0.0; frames]; channels],
        }
    }

    /// Wraps existing planar channel data.
    pub fn from_channels(sample_rate: u32, channels: Vec<Vec<f32>>) -> Self {
        Self {
            sample_rate,
            channels,
        }
    }

    pub fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    /// Number of frames (samples per channel).
    pub fn len(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Length in seconds.
    pub fn duration_seconds(&self) -> f64 {
        self.len() as f64 / self.sample_rate as f64
    }

    /// Samples of one channel.
    ///
    /// # Panics
    ///
    /// Panics if `index` is out of range.
    pub fn channel(&self, index: usize) -> &[f32] {
        &self.channels[index]
    }

    pub fn channels(&self) -> &[Vec<f32>] {
        &self.channels
    }

    /// Iterates samples frame by frame: L, R, L, R, ...
    pub fn interleaved(&self) -> impl Iterator<Item = f32> + '_ {
        (0..self.len()).flat_map(move |frame| self.channels.iter().map(move |ch| ch[frame]))
    }

    /// Largest absolute sample value across all channels.
    pub fn peak(&self) -> f32 {
        self.channels
            .iter()
            .flat_map(|ch| ch.iter())
            .fold(0.0f32, |peak, s| peak.max(s.abs()))
    }

    /// Index one past the last frame holding a non-zero sample, or 0 if
    /// the buffer is silent.
    pub fn audible_end(&self) -> usize {
        (0..self.len())
            .rev()
            .find(|&frame| self.channels.iter().any(|ch| ch[frame] != 0.0))
            .map_or(0, |frame| frame + 1)
    }
}
