//! Offline rendering and audio export.
//!
//! Renders a whole project from beat 0 into a stereo buffer through a fixed
//! mix topology, then encodes it as WAV:
//!
//! ```text
//! track voices -> track gain (volume * 0.3) -> panner ─┐
//! track voices -> track gain (volume * 0.3) -> panner ─┼-> compressor -> master (0.7) -> buffer
//! ...                                                  ┘
//! ```
//!
//! Rendering is deterministic except for the noise used by snare and hi-hat
//! voices; passing a seed in [`RenderOptions`] makes those repeatable too.

use super::buffer::AudioBuffer;
use super::error::ExportError;
use super::mixbus::{pan_gains, Compressor, CompressorSettings};
use super::nodes::white_noise;
use super::synth::{schedule_note, AudioDestination, Instrument, NoteEvent, SoundInstance, Voicing};
use super::wav::encode_wav;
use crate::midi::{beat_to_seconds, midi_to_frequency, Project, Track};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rayon::prelude::*;
use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::str::FromStr;
use tracing::{debug, info, warn};

/// Default export sample rate (44.1 kHz standard).
pub const DEFAULT_SAMPLE_RATE: u32 = 44100;

/// Lowest sample rate accepted for rendering.
pub const MIN_SAMPLE_RATE: u32 = 3000;

/// Highest sample rate accepted for rendering.
pub const MAX_SAMPLE_RATE: u32 = 768_000;

/// Track bus gain relative to the track volume. Leaves headroom for the mix.
pub const TRACK_HEADROOM: f64 = 0.3;

/// Per-note peak volume relative to velocity.
pub const NOTE_HEADROOM: f64 = 0.3;

/// Master gain after the bus compressor.
pub const MASTER_GAIN: f32 = 0.7;

/// Exported files are always stereo.
const OUTPUT_CHANNELS: usize = 2;

/// Options for an offline render.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOptions {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Length in seconds. Defaults to the project's total beats.
    pub duration: Option<f64>,
    /// Seed for noise-based drum voices. `None` draws fresh noise.
    pub seed: Option<u64>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            sample_rate: DEFAULT_SAMPLE_RATE,
            duration: None,
            seed: None,
        }
    }
}

impl RenderOptions {
    /// Builder-style seed setter.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    fn validate_sample_rate(&self) -> Result<(), ExportError> {
        if (MIN_SAMPLE_RATE..=MAX_SAMPLE_RATE).contains(&self.sample_rate) {
            Ok(())
        } else {
            Err(ExportError::InvalidSampleRate(self.sample_rate))
        }
    }
}

/// One track's input into the mix: its voices plus gain and pan.
struct TrackBus {
    gain: f32,
    pan: f32,
    rng: StdRng,
    voices: Vec<SoundInstance>,
}

impl TrackBus {
    /// Renders every voice on the bus and returns the panned stereo signal.
    fn render(self, frames: usize, sample_rate: u32) -> (Vec<f32>, Vec<f32>) {
        let sr = sample_rate as f64;
        let mut mono = vec![0.0f32; frames];

        for mut voice in self.voices {
            let first = (voice.start_time() * sr).ceil().max(0.0) as usize;
            for (i, out) in mono.iter_mut().enumerate().skip(first) {
                *out += voice.process(i as f64 / sr, sr);
                if voice.is_finished() {
                    break;
                }
            }
        }

        let (pan_l, pan_r) = pan_gains(self.pan);
        let left = mono.iter().map(|s| s * self.gain * pan_l).collect();
        let right = mono.iter().map(|s| s * self.gain * pan_r).collect();
        (left, right)
    }
}

/// Non-realtime render target.
///
/// Voices are connected to per-track buses and rendered in one pass by
/// [`OfflineContext::start_rendering`].
pub struct OfflineContext {
    sample_rate: u32,
    frames: usize,
    buses: Vec<TrackBus>,
    compressor: CompressorSettings,
    master_gain: f32,
}

impl OfflineContext {
    /// Creates a context that renders `frames` stereo frames.
    pub fn new(sample_rate: u32, frames: usize) -> Self {
        Self {
            sample_rate,
            frames,
            buses: Vec::new(),
            compressor: CompressorSettings::default(),
            master_gain: MASTER_GAIN,
        }
    }

    /// Adds a track bus and returns its index.
    ///
    /// # Arguments
    ///
    /// * `gain` - Linear bus gain
    /// * `pan` - Stereo position (-1.0 to 1.0)
    /// * `rng` - Noise source for drum voices on this bus
    pub fn create_bus(&mut self, gain: f32, pan: f32, rng: StdRng) -> usize {
        self.buses.push(TrackBus {
            gain,
            pan,
            rng,
            voices: Vec::new(),
        });
        self.buses.len() - 1
    }

    /// Number of voices connected across all buses.
    pub fn voice_count(&self) -> usize {
        self.buses.iter().map(|b| b.voices.len()).sum()
    }

    /// Renders all buses, sums them through the compressor and master gain.
    ///
    /// Buses are rendered in parallel; the sum is taken in bus order so the
    /// result does not depend on thread scheduling.
    pub fn start_rendering(self) -> AudioBuffer {
        let Self {
            sample_rate,
            frames,
            buses,
            compressor,
            master_gain,
        } = self;

        let rendered: Vec<(Vec<f32>, Vec<f32>)> = buses
            .into_par_iter()
            .map(|bus| bus.render(frames, sample_rate))
            .collect();

        let mut left = vec![0.0f32; frames];
        let mut right = vec![0.0f32; frames];
        for (bus_l, bus_r) in &rendered {
            for (out, s) in left.iter_mut().zip(bus_l) {
                *out += s;
            }
            for (out, s) in right.iter_mut().zip(bus_r) {
                *out += s;
            }
        }

        Compressor::new(compressor, sample_rate).process_block(&mut left, &mut right);
        for s in left.iter_mut().chain(right.iter_mut()) {
            *s *= master_gain;
        }

        let buffer = AudioBuffer::from_channels(sample_rate, vec![left, right]);
        debug_assert_eq!(buffer.channel_count(), OUTPUT_CHANNELS);
        buffer
    }
}

impl AudioDestination for OfflineContext {
    type Bus = usize;
    type Handle = ();

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn voicing(&self) -> Voicing {
        Voicing::OFFLINE
    }

    fn noise_buffer(&mut self, bus: usize, seconds: f64) -> Vec<f32> {
        let len = (seconds * self.sample_rate as f64) as usize;
        white_noise(&mut self.buses[bus].rng, len)
    }

    fn connect(&mut self, bus: usize, instance: SoundInstance) {
        self.buses[bus].voices.push(instance);
    }
}

/// Noise generator for one track.
///
/// With a seed, each track's noise is derived from the seed and the track
/// name, so a stem reproduces exactly the noise it had in the full mix.
fn track_rng(seed: Option<u64>, track: &Track) -> StdRng {
    match seed {
        Some(seed) => {
            let mut hasher = DefaultHasher::new();
            track.name.hash(&mut hasher);
            StdRng::seed_from_u64(seed ^ hasher.finish())
        }
        None => StdRng::from_entropy(),
    }
}

/// Renders a project into a stereo buffer.
///
/// Muted tracks are skipped. Malformed notes are skipped with a warning.
///
/// # Errors
///
/// Returns error if the sample rate is out of range or the duration is not
/// a positive number of seconds that yields at least one sample.
pub fn render(project: &Project, options: &RenderOptions) -> Result<AudioBuffer, ExportError> {
    options.validate_sample_rate()?;

    let duration = options
        .duration
        .unwrap_or_else(|| project.duration_seconds());
    if !duration.is_finite() || duration <= 0.0 {
        return Err(ExportError::InvalidDuration(duration));
    }
    let frames = (options.sample_rate as f64 * duration) as usize;
    if frames == 0 {
        return Err(ExportError::EmptyRender);
    }

    let tempo = project.tempo;
    let spb = project.seconds_per_beat();
    let mut context = OfflineContext::new(options.sample_rate, frames);

    for track in project.playable_tracks() {
        let bus = context.create_bus(
            (track.volume * TRACK_HEADROOM) as f32,
            track.pan as f32,
            track_rng(options.seed, track),
        );
        let instrument = Instrument::from_tag(track.instrument_tag());

        for note in &track.notes {
            if let Err(e) = note.validate() {
                warn!("Skipping note in track '{}': {}", track.name, e);
                continue;
            }
            let start = beat_to_seconds(note.time, tempo, 0.0);
            let event = NoteEvent {
                frequency: midi_to_frequency(note.pitch),
                start,
                end: start + note.duration * spb,
                volume: (note.gain() * NOTE_HEADROOM) as f32,
            };
            schedule_note(&mut context, bus, instrument, &event);
        }
    }

    debug!(
        "Rendering {} voices, {} frames at {} Hz",
        context.voice_count(),
        frames,
        options.sample_rate
    );
    Ok(context.start_rendering())
}

/// Renders a project and encodes it as a WAV file in memory.
///
/// # Examples
///
/// ```
/// use rollsynth::audio::{export_to_wav, RenderOptions};
/// use rollsynth::midi::{Project, Track};
///
/// let mut project = Project::new("Demo");
/// let mut lead = Track::new("Lead", "lead");
/// lead.create_note(60, 0.0, 1.0, 100);
/// project.add_track(lead);
///
/// let options = RenderOptions { duration: Some(1.0), ..RenderOptions::default() };
/// let wav = export_to_wav(&project, &options).unwrap();
/// assert_eq!(wav.len(), 44 + 44100 * 4);
/// ```
pub fn export_to_wav(project: &Project, options: &RenderOptions) -> Result<Vec<u8>, ExportError> {
    let buffer = render(project, options)?;
    info!(
        "Rendered '{}': {:.2}s, peak {:.3}",
        project.name,
        buffer.duration_seconds(),
        buffer.peak()
    );
    encode_wav(&buffer)
}

/// Renders one WAV file per non-muted track.
///
/// Each stem is rendered from a copy of the project holding only that
/// track, through the same track gain, panner, compressor and master chain
/// as the full mix. Stems are keyed by track name; if two tracks share a
/// name the later one wins.
pub fn export_stems(
    project: &Project,
    options: &RenderOptions,
) -> Result<BTreeMap<String, Vec<u8>>, ExportError> {
    let rendered: Vec<(String, Result<Vec<u8>, ExportError>)> = project
        .playable_tracks()
        .collect::<Vec<_>>()
        .into_par_iter()
        .map(|track| {
            let stem = project.with_single_track(track);
            (track.name.clone(), export_to_wav(&stem, options))
        })
        .collect();

    let mut stems = BTreeMap::new();
    for (name, wav) in rendered {
        if stems.insert(name.clone(), wav?).is_some() {
            debug!("Stem '{}' replaced by a later track of the same name", name);
        }
    }
    Ok(stems)
}

/// File name for a track's stem: `"{project}_{track}.wav"`.
pub fn stem_file_name(project_name: &str, track_name: &str) -> String {
    format!("{}_{}.wav", project_name, track_name)
}

/// Requested container for an export.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExportFormat {
    Wav,
    /// Accepted for compatibility; rendered as WAV.
    Mp3,
}

impl ExportFormat {
    /// File extension of the format actually produced.
    pub fn extension(self) -> &'static str {
        match self {
            ExportFormat::Wav | ExportFormat::Mp3 => "wav",
        }
    }
}

impl fmt::Display for ExportFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExportFormat::Wav => write!(f, "wav"),
            ExportFormat::Mp3 => write!(f, "mp3"),
        }
    }
}

impl FromStr for ExportFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "wav" | "wave" => Ok(ExportFormat::Wav),
            "mp3" => Ok(ExportFormat::Mp3),
            other => Err(format!("unsupported export format: {}", other)),
        }
    }
}

/// An encoded export and the format it was actually written in.
#[derive(Debug, Clone, PartialEq)]
pub struct ExportedAudio {
    pub format: ExportFormat,
    pub bytes: Vec<u8>,
}

/// Exports a project in the requested format.
///
/// MP3 encoding is not available; MP3 requests produce WAV and the returned
/// format says so.
pub fn export_audio(
    project: &Project,
    format: ExportFormat,
    options: &RenderOptions,
) -> Result<ExportedAudio, ExportError> {
    if format == ExportFormat::Mp3 {
        warn!("MP3 encoding is not available, exporting WAV instead");
    }
    Ok(ExportedAudio {
        format: ExportFormat::Wav,
        bytes: export_to_wav(project, options)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::{Note, Track};
    use std::io::Cursor;

    fn seeded() -> RenderOptions {
        RenderOptions::default().with_seed(42)
    }

    fn single_note_project(instrument: &str, note: Note) -> Project {
        let mut project = Project::new("Test");
        let mut track = Track::new("Only", instrument);
        track.add_note(note);
        project.add_track(track);
        project
    }

    fn quiet_band() -> Project {
        // Quiet enough that the compressor never engages
        let mut project = Project::new("Band").with_tempo(100.0);
        project.total_beats = Some(4.0);

        let mut pad = Track::new("Keys", "pad").with_mix(0.8, -0.5);
        pad.create_note(60, 0.0, 2.0, 4);
        pad.create_note(64, 2.0, 2.0, 4);

        let mut bass = Track::new("Bass", "bass").with_mix(0.7, 0.0);
        bass.create_note(36, 0.0, 1.0, 4);
        bass.create_note(43, 1.0, 1.0, 4);

        let mut drums = Track::new("Drums", "drums").with_mix(0.9, 0.3);
        drums.create_note(36, 0.0, 0.5, 3);
        drums.create_note(50, 1.0, 0.5, 3);
        drums.create_note(66, 1.5, 0.5, 3);

        let mut muted = Track::new("Scratch", "lead");
        muted.muted = true;
        muted.create_note(72, 0.0, 4.0, 127);

        project.add_track(pad);
        project.add_track(bass);
        project.add_track(drums);
        project.add_track(muted);
        project
    }

    #[test]
    fn test_default_duration_follows_total_beats() {
        let project = single_note_project("lead", Note::new(60, 0.0, 1.0, 100));
        let buffer = render(&project, &seeded()).unwrap();
        // 32 beats at 120 BPM
        assert_eq!(buffer.len(), 16 * 44100);
        assert_eq!(buffer.channel_count(), 2);
        assert_eq!(buffer.sample_rate(), 44100);
    }

    #[test]
    fn test_bass_note_ends_with_its_duration() {
        let project = single_note_project("bass", Note::new(60, 0.0, 1.0, 100));
        let options = RenderOptions {
            duration: Some(1.0),
            ..seeded()
        };
        let buffer = render(&project, &options).unwrap();

        // Sound starts right away
        assert!(buffer.channel(0)[..441].iter().any(|&s| s != 0.0));
        // One beat at 120 BPM is 0.5 s = 22050 samples
        assert!(buffer.audible_end() <= 22050);
        assert!(buffer.audible_end() > 20000);
    }

    #[test]
    fn test_render_is_deterministic_with_seed() {
        let project = quiet_band();
        let a = render(&project, &seeded()).unwrap();
        let b = render(&project, &seeded()).unwrap();
        assert_eq!(a, b);
        assert!(a.peak() > 0.0);
    }

    #[test]
    fn test_pitched_voices_are_deterministic_without_seed() {
        let mut project = single_note_project("lead", Note::new(67, 0.5, 1.0, 90));
        project.tracks[0].create_note(71, 1.0, 0.5, 90);
        let options = RenderOptions {
            duration: Some(2.0),
            ..RenderOptions::default()
        };
        assert_eq!(
            render(&project, &options).unwrap(),
            render(&project, &options).unwrap()
        );
    }

    #[test]
    fn test_pan_places_signal() {
        let mut project = single_note_project("lead", Note::new(60, 0.0, 1.0, 100));
        project.tracks[0].pan = -1.0;
        let options = RenderOptions {
            duration: Some(0.5),
            ..seeded()
        };
        let buffer = render(&project, &options).unwrap();
        assert!(buffer.channel(0).iter().any(|s| s.abs() > 0.001));
        assert!(buffer.channel(1).iter().all(|s| s.abs() < 1e-6));
    }

    #[test]
    fn test_muted_and_malformed_are_skipped() {
        let mut project = Project::new("Test");
        let mut muted = Track::new("Muted", "lead");
        muted.muted = true;
        muted.create_note(60, 0.0, 1.0, 100);
        project.add_track(muted);
        let mut broken = Track::new("Broken", "lead");
        broken.create_note(60, 0.0, -1.0, 100);
        broken.create_note(60, f64::NAN, 1.0, 100);
        project.add_track(broken);

        let buffer = render(&project, &seeded()).unwrap();
        assert_eq!(buffer.peak(), 0.0);
    }

    #[test]
    fn test_incomplete_json_note_is_dropped_from_render() {
        let options = RenderOptions {
            duration: Some(1.0),
            ..seeded()
        };
        let with_bad = Project::from_json(
            r#"{"name": "Test", "tracks": [{"name": "Only", "instrument": "lead", "notes": [
                {"note": 60, "time": 0, "duration": 1},
                {"note": 67, "time": 0.5}
            ]}]}"#,
        )
        .unwrap();
        let clean = single_note_project("lead", Note::new(60, 0.0, 1.0, 100));

        let rendered = render(&with_bad, &options).unwrap();
        assert!(rendered.peak() > 0.0);
        assert_eq!(rendered, render(&clean, &options).unwrap());
    }

    #[test]
    fn test_invalid_options() {
        let project = Project::new("Empty");
        let bad_rate = RenderOptions {
            sample_rate: 100,
            ..RenderOptions::default()
        };
        assert!(matches!(
            render(&project, &bad_rate),
            Err(ExportError::InvalidSampleRate(100))
        ));

        let zero = RenderOptions {
            duration: Some(0.0),
            ..RenderOptions::default()
        };
        assert!(matches!(
            render(&project, &zero),
            Err(ExportError::InvalidDuration(_))
        ));

        let tiny = RenderOptions {
            duration: Some(1e-9),
            ..RenderOptions::default()
        };
        assert!(matches!(render(&project, &tiny), Err(ExportError::EmptyRender)));
    }

    #[test]
    fn test_export_to_wav_is_readable() {
        let project = quiet_band();
        let wav = export_to_wav(&project, &seeded()).unwrap();
        let reader = hound::WavReader::new(Cursor::new(wav)).unwrap();
        assert_eq!(reader.spec().channels, 2);
        assert_eq!(reader.spec().sample_rate, 44100);
        // 4 beats at 100 BPM = 2.4 s
        assert_eq!(reader.duration(), 105_840);
    }

    #[test]
    fn test_stems_one_per_playable_track() {
        let project = quiet_band();
        let stems = export_stems(&project, &seeded()).unwrap();
        assert_eq!(stems.len(), 3);
        assert!(stems.contains_key("Keys"));
        assert!(stems.contains_key("Bass"));
        assert!(stems.contains_key("Drums"));
        assert!(!stems.contains_key("Scratch"));
    }

    #[test]
    fn test_stem_matches_track_in_mix() {
        let project = quiet_band();
        let options = seeded();

        for (index, track) in project.tracks().iter().enumerate().filter(|(_, t)| !t.muted) {
            // The full pipeline with every other track muted
            let mut solo = project.clone();
            for (other, t) in solo.tracks.iter_mut().enumerate() {
                t.muted = t.muted || other != index;
            }
            let in_mix = render(&solo, &options).unwrap();
            let stem = render(&project.with_single_track(track), &options).unwrap();
            assert_eq!(stem, in_mix, "stem {}", track.name);
        }
    }

    #[test]
    fn test_stems_sum_to_mix() {
        let project = quiet_band();
        let options = seeded();
        let mix = render(&project, &options).unwrap();
        let stems: Vec<AudioBuffer> = project
            .playable_tracks()
            .map(|t| render(&project.with_single_track(t), &options).unwrap())
            .collect();

        for ch in 0..2 {
            for frame in (0..mix.len()).step_by(97) {
                let sum: f32 = stems.iter().map(|s| s.channel(ch)[frame]).sum();
                assert!((sum - mix.channel(ch)[frame]).abs() < 1e-6);
            }
        }
    }

    #[test]
    fn test_duplicate_stem_names_last_wins() {
        let mut project = Project::new("Dupes");
        project.total_beats = Some(2.0);
        let mut first = Track::new("Same", "lead");
        first.create_note(60, 0.0, 1.0, 100);
        let second = Track::new("Same", "lead");
        project.add_track(first);
        project.add_track(second);

        let stems = export_stems(&project, &seeded()).unwrap();
        assert_eq!(stems.len(), 1);
        // The second (empty) track won, so the stem is silent
        assert!(stems["Same"][44..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_mp3_falls_back_to_wav() {
        let project = single_note_project("pad", Note::new(60, 0.0, 1.0, 100));
        let options = RenderOptions {
            duration: Some(0.25),
            ..seeded()
        };
        let exported = export_audio(&project, ExportFormat::Mp3, &options).unwrap();
        assert_eq!(exported.format, ExportFormat::Wav);
        assert_eq!(&exported.bytes[0..4], b"RIFF");
        assert_eq!("MP3".parse::<ExportFormat>(), Ok(ExportFormat::Mp3));
        assert!("flac".parse::<ExportFormat>().is_err());
        assert_eq!(ExportFormat::Mp3.extension(), "wav");
    }

    #[test]
    fn test_stem_file_name() {
        assert_eq!(stem_file_name("Song", "Bass"), "Song_Bass.wav");
    }
}
