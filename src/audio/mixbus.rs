//! Mix-bus processing for offline export: stereo panning and the bus
//! compressor.

use std::f32::consts::FRAC_PI_2;

/// Equal-power gains `(left, right)` for a mono signal at `pan`.
///
/// `pan` runs from -1.0 (hard left) to 1.0 (hard right) and is clamped.
/// At center both sides get `cos(pi/4)`.
pub fn pan_gains(pan: f32) -> (f32, f32) {
    let pan = if pan.is_nan() { 0.0 } else { pan.clamp(-1.0, 1.0) };
    let x = (pan + 1.0) / 2.0;
    ((x * FRAC_PI_2).cos(), (x * FRAC_PI_2).sin())
}

/// Settings for the bus compressor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CompressorSettings {
    /// Level in dBFS above which gain reduction starts.
    pub threshold_db: f32,
    /// Width in dB of the soft knee centered on the threshold.
    pub knee_db: f32,
    /// Input/output ratio above the knee.
    pub ratio: f32,
    /// Attack time in seconds.
    pub attack: f32,
    /// Release time in seconds.
    pub release: f32,
}

impl Default for CompressorSettings {
    fn default() -> Self {
        Self {
            threshold_db: -24.0,
            knee_db: 30.0,
            ratio: 4.0,
            attack: 0.003,
            release: 0.25,
        }
    }
}

/// Stereo-linked feed-forward compressor with a soft knee.
///
/// Signals below `threshold - knee / 2` pass through with a gain of exactly
/// 1.0.
#[derive(Debug, Clone)]
pub struct Compressor {
    settings: CompressorSettings,
    attack_coeff: f32,
    release_coeff: f32,
    /// Smoothed gain reduction in dB (always <= 0).
    reduction_db: f32,
}

impl Compressor {
    pub fn new(settings: CompressorSettings, sample_rate: u32) -> Self {
        let sr = sample_rate as f32;
        Self {
            settings,
            attack_coeff: smoothing_coeff(settings.attack, sr),
            release_coeff: smoothing_coeff(settings.release, sr),
            reduction_db: 0.0,
        }
    }

    /// Static gain computer: output level in dB for an input level in dB.
    pub fn output_level_db(&self, input_db: f32) -> f32 {
        let CompressorSettings {
            threshold_db,
            knee_db,
            ratio,
            ..
        } = self.settings;
        let over = input_db - threshold_db;

        if 2.0 * over < -knee_db {
            input_db
        } else if knee_db > 0.0 && 2.0 * over.abs() <= knee_db {
            let x = over + knee_db / 2.0;
            input_db + (1.0 / ratio - 1.0) * x * x / (2.0 * knee_db)
        } else {
            threshold_db + over / ratio
        }
    }

    /// Current smoothed gain reduction in dB.
    pub fn reduction_db(&self) -> f32 {
        self.reduction_db
    }

    /// Compresses a stereo block in place.
    pub fn process_block(&mut self, left: &mut [f32], right: &mut [f32]) {
        for (l, r) in left.iter_mut().zip(right.iter_mut()) {
            let level = l.abs().max(r.abs());
            let target = if level > 0.0 {
                let input_db = 20.0 * level.log10();
                (self.output_level_db(input_db) - input_db).min(0.0)
            } else {
                0.0
            };

            let coeff = if target < self.reduction_db {
                self.attack_coeff
            } else {
                self.release_coeff
            };
            self.reduction_db = coeff * self.reduction_db + (1.0 - coeff) * target;

            if self.reduction_db < 0.0 {
                let gain = 10f32.powf(self.reduction_db / 20.0);
                *l *= gain;
                *r *= gain;
            }
        }
    }
}

fn smoothing_coeff(time: f32, sample_rate: f32) -> f32 {
    if time <= 0.0 {
        0.0
    } else {
        (-1.0 / (time * sample_rate)).exp()
    }
}
