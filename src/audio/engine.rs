//! Realtime scheduler for live playback.
//!
//! The engine voices a project's notes into a [`LiveMixer`] which the output
//! device pulls samples from. Every note becomes a [`SoundInstance`] shared
//! between the mixer (which renders it) and the engine's session registry
//! (which can force it silent on [`AudioEngine::stop`]).

use super::error::AudioError;
use super::nodes::white_noise;
use super::synth::{schedule_note, AudioDestination, Instrument, NoteEvent, SoundInstance, Voicing};
use crate::midi::{self, beat_to_seconds, PlaybackOptions, Project};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rodio::{OutputStream, OutputStreamHandle, Sink, Source};
use std::sync::mpsc::{self, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Sample rate for live output (44.1 kHz standard).
pub const SAMPLE_RATE: u32 = 44100;

/// Samples rendered per channel on each mixer pull.
/// Smaller = lower latency but higher CPU usage.
const BUFFER_SIZE: usize = 256;

/// Length of a preview note in seconds.
pub const PREVIEW_LENGTH: f64 = 0.3;

const PREVIEW_VELOCITY: u8 = 100;
const PREVIEW_TRACK_VOLUME: f64 = 0.8;

/// A voice shared between the mixer and the session registry.
pub type LiveVoice = Arc<Mutex<SoundInstance>>;

/// The mixer as shared with the output thread.
pub type SharedMixer = Arc<Mutex<LiveMixer>>;

/// Locks a mutex, recovering the data if a previous holder panicked.
fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Represents the current playback state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlaybackState {
    /// Output device not opened yet, or opening failed.
    Uninitialized,
    /// Device open, nothing scheduled.
    Ready,
    /// A `play` call is sounding.
    Playing,
}

/// Tunables for the realtime engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EngineConfig {
    /// Output sample rate in Hz.
    pub sample_rate: u32,
    /// Post-mix gain applied to everything the engine plays.
    pub master_volume: f64,
    /// Per-note gain multiplier on top of velocity and track volume.
    pub note_headroom: f64,
    /// Extra time after the last beat before playback stops itself.
    pub auto_stop_tail: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: SAMPLE_RATE,
            master_volume: 0.7,
            note_headroom: 0.5,
            auto_stop_tail: Duration::from_millis(500),
        }
    }
}

/// A voice together with the time it starts sounding.
struct MixerVoice {
    start: f64,
    voice: LiveVoice,
}

impl MixerVoice {
    /// Offset into a block beginning at `block_start` of the first frame
    /// this voice can be heard on.
    fn first_frame(&self, block_start: u64, sample_rate: f64) -> usize {
        let frame = (self.start * sample_rate).ceil();
        if frame <= block_start as f64 {
            0
        } else {
            (frame - block_start as f64) as usize
        }
    }
}

/// Sums live voices into a stereo stream.
///
/// The mixer's clock is the number of frames it has rendered, so voices are
/// scheduled against the time the device has actually played. Voices wait in
/// a pending list, latest start first, until the block they start in.
pub struct LiveMixer {
    sample_rate: u32,
    frames_rendered: u64,
    master_gain: f32,
    pending: Vec<MixerVoice>,
    active: Vec<MixerVoice>,
    rng: StdRng,
}

impl LiveMixer {
    pub fn new(sample_rate: u32, master_gain: f32) -> Self {
        Self {
            sample_rate,
            frames_rendered: 0,
            master_gain,
            pending: Vec::new(),
            active: Vec::new(),
            rng: StdRng::from_entropy(),
        }
    }

    /// Current position of the mixer clock in seconds.
    pub fn current_time(&self) -> f64 {
        self.frames_rendered as f64 / self.sample_rate as f64
    }

    pub fn master_gain(&self) -> f32 {
        self.master_gain
    }

    pub fn set_master_gain(&mut self, gain: f32) {
        self.master_gain = gain;
    }

    /// Number of voices still attached to the mixer, started or not.
    pub fn voice_count(&self) -> usize {
        self.pending.len() + self.active.len()
    }

    /// Drops voices that have finished, including stopped ones that never
    /// started.
    pub fn prune(&mut self) {
        self.pending.retain(|v| !lock(&v.voice).is_finished());
        self.active.retain(|v| !lock(&v.voice).is_finished());
    }

    /// Renders the next block into `left` and `right` and advances the clock.
    ///
    /// Voices are mono and sent equally to both channels. Only voices that
    /// start before the end of the block are processed, each from its first
    /// audible frame. Finished voices are dropped after the block.
    pub fn render(&mut self, left: &mut [f32], right: &mut [f32]) {
        let frames = left.len().min(right.len());
        left.fill(0.0);
        right.fill(0.0);

        let sr = self.sample_rate as f64;
        let start = self.frames_rendered;
        let block_end = (start + frames as u64) as f64 / sr;

        let due = self.pending.partition_point(|v| v.start >= block_end);
        self.active.extend(self.pending.drain(due..).rev());

        for mixer_voice in &self.active {
            let first = mixer_voice.first_frame(start, sr);
            let mut voice = lock(&mixer_voice.voice);
            let block = left[..frames].iter_mut().zip(right[..frames].iter_mut());
            for (i, (l, r)) in block.enumerate().skip(first) {
                let sample = voice.process((start + i as u64) as f64 / sr, sr);
                *l += sample;
                *r += sample;
            }
        }

        for s in left[..frames].iter_mut().chain(right[..frames].iter_mut()) {
            *s *= self.master_gain;
        }

        self.active.retain(|v| !lock(&v.voice).is_finished());
        self.frames_rendered += frames as u64;
    }
}

impl AudioDestination for LiveMixer {
    type Bus = ();
    type Handle = LiveVoice;

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn voicing(&self) -> Voicing {
        Voicing::REALTIME
    }

    fn noise_buffer(&mut self, _bus: (), seconds: f64) -> Vec<f32> {
        let len = (seconds * self.sample_rate as f64) as usize;
        white_noise(&mut self.rng, len)
    }

    fn connect(&mut self, _bus: (), instance: SoundInstance) -> LiveVoice {
        let start = instance.start_time();
        let voice = Arc::new(Mutex::new(instance));
        let at = self.pending.partition_point(|v| v.start > start);
        self.pending.insert(
            at,
            MixerVoice {
                start,
                voice: Arc::clone(&voice),
            },
        );
        voice
    }
}

/// Audio source that pulls samples from the mixer.
/// Implements rodio's Source trait for playback.
struct MixerSource {
    mixer: SharedMixer,
    sample_rate: u32,
    left_buf: Vec<f32>,
    right_buf: Vec<f32>,
    /// Current position in the buffer.
    buf_pos: usize,
    /// Current channel (0 = left, 1 = right).
    channel: usize,
}

impl MixerSource {
    fn new(mixer: SharedMixer, sample_rate: u32) -> Self {
        Self {
            mixer,
            sample_rate,
            left_buf: vec![0.0; BUFFER_SIZE],
            right_buf: vec![0.0; BUFFER_SIZE],
            buf_pos: BUFFER_SIZE, // Start at end to trigger first render
            channel: 0,
        }
    }
}

impl Iterator for MixerSource {
    type Item = f32;

    fn next(&mut self) -> Option<f32> {
        if self.buf_pos >= BUFFER_SIZE {
            if let Ok(mut mixer) = self.mixer.lock() {
                mixer.render(&mut self.left_buf, &mut self.right_buf);
            } else {
                self.left_buf.fill(0.0);
                self.right_buf.fill(0.0);
            }
            self.buf_pos = 0;
        }

        // Interleave stereo samples: L, R, L, R, ...
        let sample = if self.channel == 0 {
            self.left_buf[self.buf_pos]
        } else {
            self.right_buf[self.buf_pos]
        };

        self.channel = 1 - self.channel;
        if self.channel == 0 {
            self.buf_pos += 1;
        }

        Some(sample)
    }
}

impl Source for MixerSource {
    fn current_frame_len(&self) -> Option<usize> {
        None // Continuous stream
    }

    fn channels(&self) -> u16 {
        2 // Stereo
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    fn total_duration(&self) -> Option<Duration> {
        None // Infinite stream
    }
}

/// A device the mixer can be played through.
pub trait OutputBackend {
    /// Opens the device and starts pulling from `mixer`. Called at most once
    /// successfully per engine.
    fn open(&mut self, mixer: SharedMixer, sample_rate: u32) -> Result<(), AudioError>;

    /// Whether the device is open but not producing sound yet.
    fn is_suspended(&self) -> bool;

    /// Activates a suspended device.
    fn resume(&mut self) -> Result<(), AudioError>;
}

/// The system's default output device, via rodio.
///
/// The sink is created paused and only starts on [`OutputBackend::resume`],
/// so the mixer clock stays at zero until the engine is initialized.
#[derive(Default)]
pub struct RodioOutput {
    /// Audio output stream (must be kept alive).
    _stream: Option<(OutputStream, OutputStreamHandle)>,
    sink: Option<Sink>,
}

impl OutputBackend for RodioOutput {
    fn open(&mut self, mixer: SharedMixer, sample_rate: u32) -> Result<(), AudioError> {
        let (stream, handle) = OutputStream::try_default()
            .map_err(|e| AudioError::OutputUnavailable(e.to_string()))?;
        let sink =
            Sink::try_new(&handle).map_err(|e| AudioError::OutputUnavailable(e.to_string()))?;
        sink.pause();
        sink.append(MixerSource::new(mixer, sample_rate));

        self._stream = Some((stream, handle));
        self.sink = Some(sink);
        Ok(())
    }

    fn is_suspended(&self) -> bool {
        self.sink.as_ref().map_or(true, Sink::is_paused)
    }

    fn resume(&mut self) -> Result<(), AudioError> {
        match &self.sink {
            Some(sink) => {
                sink.play();
                Ok(())
            }
            None => Err(AudioError::ResumeFailed("output was never opened".to_string())),
        }
    }
}

/// Headless output: keeps the mixer but never pulls from it.
///
/// Useful for tests and machines without a sound device. Drive the mixer
/// by hand through [`AudioEngine::mixer`].
#[derive(Debug, Clone, Default)]
pub struct NullOutput {
    unavailable: bool,
    suspended: bool,
    resumes: usize,
}

impl NullOutput {
    /// An output that opens and runs immediately.
    pub fn new() -> Self {
        Self::default()
    }

    /// An output that opens suspended and needs a resume.
    pub fn suspended() -> Self {
        Self {
            suspended: true,
            ..Self::default()
        }
    }

    /// An output that always fails to open.
    pub fn unavailable() -> Self {
        Self {
            unavailable: true,
            ..Self::default()
        }
    }

    /// Number of times the output was resumed.
    #[cfg(test)]
    pub(crate) fn resume_count(&self) -> usize {
        self.resumes
    }
}

impl OutputBackend for NullOutput {
    fn open(&mut self, _mixer: SharedMixer, _sample_rate: u32) -> Result<(), AudioError> {
        if self.unavailable {
            Err(AudioError::OutputUnavailable("no device".to_string()))
        } else {
            Ok(())
        }
    }

    fn is_suspended(&self) -> bool {
        self.suspended
    }

    fn resume(&mut self) -> Result<(), AudioError> {
        self.suspended = false;
        self.resumes += 1;
        Ok(())
    }
}

/// Voices scheduled by the current `play` call.
#[derive(Default)]
struct Session {
    /// Bumped on every play and stop; timers compare against it.
    id: u64,
    instances: Vec<LiveVoice>,
    playing: bool,
}

impl Session {
    /// Silences and forgets every registered voice.
    fn halt(&mut self) -> usize {
        let skipped = self
            .instances
            .iter()
            .map(|voice| lock(voice).force_stop())
            .sum();
        self.instances.clear();
        self.playing = false;
        skipped
    }
}

/// Time from the start of a non-looping `play` until it stops itself.
///
/// The window ends at `options.end_time`, else at the project's
/// `totalBeats` (32 when unset), and `tail` is added after it. Returns
/// `None` when the window is too long to represent as a [`Duration`].
pub fn auto_stop_delay(
    project: &Project,
    options: &PlaybackOptions,
    tail: Duration,
) -> Option<Duration> {
    let end = options.end_time.unwrap_or_else(|| project.total_beats());
    let window = ((end - options.start_time) * project.seconds_per_beat()).max(0.0);
    Duration::try_from_secs_f64(window)
        .ok()
        .and_then(|window| window.checked_add(tail))
}

/// Deferred stop for a non-looping `play`.
///
/// Dropping it cancels the timer. A timer that fires after its session was
/// superseded leaves the newer session alone.
struct AutoStop {
    _cancel: Sender<()>,
}

impl AutoStop {
    fn spawn(session: Arc<Mutex<Session>>, id: u64, delay: Duration) -> Self {
        let (cancel, cancelled) = mpsc::channel::<()>();
        thread::spawn(move || match cancelled.recv_timeout(delay) {
            Err(RecvTimeoutError::Timeout) => {
                let mut session = lock(&session);
                if session.id == id {
                    session.halt();
                    debug!("Auto-stopped playback session {}", id);
                } else {
                    trace!("Ignoring auto-stop for stale session {}", id);
                }
            }
            _ => trace!("Auto-stop for session {} cancelled", id),
        });
        Self { _cancel: cancel }
    }
}

/// The realtime playback engine.
///
/// Owns one output device, one mixer and one playback session. Each engine
/// is independent; create one per editing session.
pub struct AudioEngine<B: OutputBackend = RodioOutput> {
    backend: B,
    config: EngineConfig,
    mixer: SharedMixer,
    session: Arc<Mutex<Session>>,
    auto_stop: Option<AutoStop>,
    initialized: bool,
}

impl AudioEngine<RodioOutput> {
    /// Creates an engine for the default output device. Nothing is opened
    /// until [`AudioEngine::init`] or the first `play`.
    pub fn new() -> Self {
        Self::with_config(EngineConfig::default())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        Self::with_backend(RodioOutput::default(), config)
    }
}

impl Default for AudioEngine<RodioOutput> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: OutputBackend> AudioEngine<B> {
    /// Creates an engine playing through `backend`.
    pub fn with_backend(backend: B, config: EngineConfig) -> Self {
        let mixer = LiveMixer::new(config.sample_rate, config.master_volume as f32);
        Self {
            backend,
            config,
            mixer: Arc::new(Mutex::new(mixer)),
            session: Arc::new(Mutex::new(Session::default())),
            auto_stop: None,
            initialized: false,
        }
    }

    /// Opens the output device and resumes it if suspended.
    ///
    /// Safe to call repeatedly. Returns `false` if the device could not be
    /// opened; the failure is logged and playback stays silent.
    pub fn init(&mut self) -> bool {
        if !self.initialized {
            if let Err(e) = self
                .backend
                .open(Arc::clone(&self.mixer), self.config.sample_rate)
            {
                error!("Audio init failed: {}", e);
                return false;
            }
            self.initialized = true;
            info!("Audio output opened at {} Hz", self.config.sample_rate);
        }

        if self.backend.is_suspended() {
            if let Err(e) = self.backend.resume() {
                warn!("{}", e);
            }
        }
        true
    }

    /// Plays a project and returns the number of notes scheduled.
    ///
    /// Any previous playback is stopped first. Notes are placed relative to
    /// `options.start_time`, so the window start sounds immediately. Without
    /// `loop_playback`, playback stops itself shortly after the window ends.
    pub fn play(&mut self, project: &Project, options: &PlaybackOptions) -> usize {
        self.stop();
        if !self.init() {
            return 0;
        }

        let tempo = project.tempo;
        let spb = project.seconds_per_beat();
        let mut instances = Vec::new();
        {
            let mut mixer = lock(&self.mixer);
            let now = mixer.current_time();

            for track in project.playable_tracks() {
                let instrument = Instrument::from_tag(track.instrument_tag());
                for note in &track.notes {
                    if let Err(e) = note.validate() {
                        warn!("Skipping note in track '{}': {}", track.name, e);
                        continue;
                    }
                    if !note.starts_within(options.start_time, options.end_time) {
                        continue;
                    }

                    let start = now + beat_to_seconds(note.time, tempo, options.start_time);
                    let event = NoteEvent {
                        frequency: midi::midi_to_frequency(note.pitch),
                        start,
                        end: start + note.duration * spb,
                        volume: (note.gain() * track.volume * self.config.note_headroom) as f32,
                    };
                    instances.push(schedule_note(&mut *mixer, (), instrument, &event));
                }
            }
        }

        let scheduled = instances.len();
        let id = {
            let mut session = lock(&self.session);
            session.id += 1;
            session.instances = instances;
            session.playing = true;
            session.id
        };

        if !options.loop_playback {
            match auto_stop_delay(project, options, self.config.auto_stop_tail) {
                Some(delay) => {
                    self.auto_stop = Some(AutoStop::spawn(Arc::clone(&self.session), id, delay));
                }
                None => warn!(
                    "Session {}: playback window is too long to time, not stopping automatically",
                    id
                ),
            }
        }

        debug!(
            "Session {}: scheduled {} notes from beat {}",
            id, scheduled, options.start_time
        );
        scheduled
    }

    /// Stops playback immediately.
    ///
    /// Every registered voice is stopped and disconnected. Safe to call at
    /// any time, including when nothing is playing.
    pub fn stop(&mut self) {
        self.auto_stop = None;

        {
            let mut session = lock(&self.session);
            session.id += 1;
            let count = session.instances.len();
            let skipped = session.halt();
            if count > 0 {
                debug!(
                    "Stopped {} voices ({} nodes had already finished)",
                    count, skipped
                );
            }
        }
        lock(&self.mixer).prune();
    }

    /// Sets the post-mix master gain. Takes effect on the next mixer block.
    pub fn set_master_volume(&self, volume: f64) {
        if !volume.is_finite() {
            warn!("Ignoring master volume {}", volume);
            return;
        }
        lock(&self.mixer).set_master_gain(volume.max(0.0) as f32);
    }

    pub fn master_volume(&self) -> f64 {
        lock(&self.mixer).master_gain() as f64
    }

    /// Equal-tempered frequency of a MIDI pitch.
    pub fn midi_to_frequency(note: u8) -> f64 {
        midi::midi_to_frequency(note)
    }

    /// Plays a short lead note right away, e.g. when a piano-roll key is
    /// clicked. Preview notes are not part of the playback session and are
    /// not cut by [`AudioEngine::stop`].
    pub fn preview_note(&mut self, pitch: u8) -> bool {
        if !self.init() {
            return false;
        }
        let mut mixer = lock(&self.mixer);
        let now = mixer.current_time();
        let event = NoteEvent {
            frequency: midi::midi_to_frequency(pitch),
            start: now,
            end: now + PREVIEW_LENGTH,
            volume: (PREVIEW_VELOCITY as f64 / 127.0
                * PREVIEW_TRACK_VOLUME
                * self.config.note_headroom) as f32,
        };
        schedule_note(&mut *mixer, (), Instrument::Lead, &event);
        trace!("Preview {}", midi::note_to_name(pitch));
        true
    }

    /// Returns the current playback state.
    pub fn playback_state(&self) -> PlaybackState {
        if !self.initialized {
            PlaybackState::Uninitialized
        } else if lock(&self.session).playing {
            PlaybackState::Playing
        } else {
            PlaybackState::Ready
        }
    }

    /// Number of voices registered by the current `play` call.
    pub fn active_instances(&self) -> usize {
        lock(&self.session).instances.len()
    }

    /// The mixer the output device pulls from.
    pub fn mixer(&self) -> &SharedMixer {
        &self.mixer
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }
}

impl<B: OutputBackend> Drop for AudioEngine<B> {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::midi::Track;

    fn engine() -> AudioEngine<NullOutput> {
        AudioEngine::with_backend(NullOutput::new(), EngineConfig::default())
    }

    fn project() -> Project {
        let mut project = Project::new("Live");
        let mut lead = Track::new("Lead", "lead");
        lead.create_note(60, 0.0, 1.0, 100);
        lead.create_note(64, 2.0, 1.0, 100);
        lead.create_note(67, 4.0, 1.0, 100);
        lead.create_note(72, 6.0, 1.0, 100);
        let mut drums = Track::new("Drums", "drums");
        drums.create_note(36, 0.0, 0.5, 100);
        drums.create_note(38, 1.0, 0.5, 100);
        drums.create_note(42, 1.5, 0.5, 100);
        project.add_track(lead);
        project.add_track(drums);
        project
    }

    fn render_block(engine: &AudioEngine<NullOutput>, frames: usize) -> (Vec<f32>, Vec<f32>) {
        let mut left = vec![0.0; frames];
        let mut right = vec![0.0; frames];
        lock(engine.mixer()).render(&mut left, &mut right);
        (left, right)
    }

    #[test]
    fn test_init_is_idempotent_and_resumes() {
        let mut engine =
            AudioEngine::with_backend(NullOutput::suspended(), EngineConfig::default());
        assert_eq!(engine.playback_state(), PlaybackState::Uninitialized);

        assert!(engine.init());
        assert_eq!(engine.playback_state(), PlaybackState::Ready);
        assert!(!engine.backend().is_suspended());
        assert_eq!(engine.backend().resume_count(), 1);

        assert!(engine.init());
        assert_eq!(engine.backend().resume_count(), 1);
        assert_eq!(engine.master_volume(), 0.7f32 as f64);
    }

    #[test]
    fn test_unavailable_output_is_silent_noop() {
        let mut engine =
            AudioEngine::with_backend(NullOutput::unavailable(), EngineConfig::default());
        assert!(!engine.init());
        assert_eq!(engine.play(&project(), &PlaybackOptions::default()), 0);
        assert!(!engine.preview_note(60));
        assert_eq!(engine.active_instances(), 0);
        assert_eq!(engine.playback_state(), PlaybackState::Uninitialized);
        engine.stop();
    }

    #[test]
    fn test_play_schedules_every_note() {
        let mut engine = engine();
        let scheduled = engine.play(&project(), &PlaybackOptions::default().looping());
        assert_eq!(scheduled, 7);
        assert_eq!(engine.active_instances(), 7);
        assert_eq!(lock(engine.mixer()).voice_count(), 7);
        assert_eq!(engine.playback_state(), PlaybackState::Playing);
    }

    #[test]
    fn test_all_muted_schedules_nothing() {
        let mut project = project();
        for track in &mut project.tracks {
            track.muted = true;
        }
        let mut engine = engine();
        assert_eq!(engine.play(&project, &PlaybackOptions::default()), 0);
        assert_eq!(engine.active_instances(), 0);
    }

    #[test]
    fn test_window_offsets_notes() {
        let mut project = Project::new("Window");
        let mut lead = Track::new("Lead", "lead");
        for beat in [0.0, 2.0, 4.0, 6.0] {
            lead.create_note(60, beat, 1.0, 100);
        }
        project.add_track(lead);

        let mut engine = engine();
        let scheduled = engine.play(&project, &PlaybackOptions::window(2.0, 6.0).looping());
        assert_eq!(scheduled, 2);

        let mixer = lock(engine.mixer());
        let starts: Vec<f64> = mixer.pending.iter().rev().map(|v| v.start).collect();
        // Beat 2 plays at once, beat 4 one second later at 120 BPM
        assert_eq!(starts, vec![0.0, 1.0]);
    }

    #[test]
    fn test_malformed_notes_are_skipped() {
        let mut project = Project::new("Broken");
        let mut lead = Track::new("Lead", "lead");
        lead.create_note(60, 0.0, 1.0, 100);
        lead.create_note(200, 0.0, 1.0, 100);
        lead.create_note(62, f64::NAN, 1.0, 100);
        lead.create_note(64, 1.0, 0.0, 100);
        lead.create_note(65, 2.0, 1.0, 100);
        project.add_track(lead);

        let mut engine = engine();
        assert_eq!(engine.play(&project, &PlaybackOptions::default()), 2);
    }

    #[test]
    fn test_incomplete_json_note_is_skipped() {
        let project = Project::from_json(
            r#"{"tracks": [{"name": "Lead", "instrument": "lead", "notes": [
                {"note": 60, "time": 0, "duration": 1},
                {"note": 62, "time": 1},
                {"note": 64, "time": 2, "duration": 1}
            ]}]}"#,
        )
        .unwrap();

        let mut engine = engine();
        assert_eq!(engine.play(&project, &PlaybackOptions::default().looping()), 2);
        assert_eq!(lock(engine.mixer()).voice_count(), 2);
    }

    #[test]
    fn test_stop_is_idempotent() {
        let mut engine = engine();
        engine.stop();
        engine.play(&project(), &PlaybackOptions::default());
        engine.stop();
        engine.stop();
        assert_eq!(engine.active_instances(), 0);
        assert_eq!(engine.playback_state(), PlaybackState::Ready);

        // Stopped voices leave the mixer even before they started
        assert_eq!(lock(engine.mixer()).voice_count(), 0);
        render_block(&engine, 64);
        assert_eq!(lock(engine.mixer()).voice_count(), 0);
    }

    #[test]
    fn test_stop_after_voices_finished_naturally() {
        let mut project = Project::new("Short");
        let mut drums = Track::new("Drums", "drums");
        drums.create_note(80, 0.0, 0.1, 100); // hi-hat, 50 ms
        project.add_track(drums);

        let mut engine = engine();
        engine.play(&project, &PlaybackOptions::default().looping());
        render_block(&engine, 4410);
        assert_eq!(lock(engine.mixer()).voice_count(), 0);
        engine.stop();
        assert_eq!(engine.active_instances(), 0);
    }

    #[test]
    fn test_new_play_supersedes_previous() {
        let mut engine = engine();
        engine.play(&project(), &PlaybackOptions::default().looping());

        let mut single = Project::new("Single");
        let mut lead = Track::new("Lead", "lead");
        lead.create_note(60, 0.0, 4.0, 100);
        single.add_track(lead);
        assert_eq!(engine.play(&single, &PlaybackOptions::default().looping()), 1);
        assert_eq!(engine.active_instances(), 1);

        render_block(&engine, 64);
        assert_eq!(lock(engine.mixer()).voice_count(), 1);
    }

    #[test]
    fn test_auto_stop_ends_session() {
        let config = EngineConfig {
            auto_stop_tail: Duration::ZERO,
            ..EngineConfig::default()
        };
        let mut engine = AudioEngine::with_backend(NullOutput::new(), config);
        // One beat at 600 BPM = 100 ms
        let project = project().with_tempo(600.0);
        engine.play(&project, &PlaybackOptions::window(0.0, 1.0));
        assert_eq!(engine.playback_state(), PlaybackState::Playing);

        thread::sleep(Duration::from_millis(500));
        assert_eq!(engine.playback_state(), PlaybackState::Ready);
        assert_eq!(engine.active_instances(), 0);
    }

    #[test]
    fn test_stale_auto_stop_leaves_new_session() {
        let config = EngineConfig {
            auto_stop_tail: Duration::ZERO,
            ..EngineConfig::default()
        };
        let mut engine = AudioEngine::with_backend(NullOutput::new(), config);
        let project = project().with_tempo(600.0);
        engine.play(&project, &PlaybackOptions::window(0.0, 1.0));
        let scheduled = engine.play(&project, &PlaybackOptions::default().looping());

        thread::sleep(Duration::from_millis(300));
        assert_eq!(engine.playback_state(), PlaybackState::Playing);
        assert_eq!(engine.active_instances(), scheduled);
    }

    #[test]
    fn test_mixer_renders_scheduled_notes() {
        let mut engine = engine();
        engine.play(&project(), &PlaybackOptions::default().looping());
        let (left, right) = render_block(&engine, 4410);
        assert!(left.iter().any(|s| s.abs() > 0.001));
        assert_eq!(left, right);
        assert!((lock(engine.mixer()).current_time() - 0.1).abs() < 1e-9);
    }

    #[test]
    fn test_auto_stop_delay_resolves_window_end() {
        let tail = Duration::from_millis(500);
        // 120 BPM, 0.5 s per beat
        let mut project = project();
        assert_eq!(project.total_beats, None);

        // Unset totalBeats falls back to 32 beats
        let options = PlaybackOptions::default();
        assert_eq!(
            auto_stop_delay(&project, &options, tail),
            Some(Duration::from_millis(16_500))
        );

        project.total_beats = Some(8.0);
        assert_eq!(
            auto_stop_delay(&project, &options, tail),
            Some(Duration::from_millis(4_500))
        );

        // The window start is subtracted from totalBeats
        let from_beat_2 = PlaybackOptions {
            start_time: 2.0,
            ..PlaybackOptions::default()
        };
        assert_eq!(
            auto_stop_delay(&project, &from_beat_2, tail),
            Some(Duration::from_millis(3_500))
        );

        // An explicit end wins over totalBeats
        assert_eq!(
            auto_stop_delay(&project, &PlaybackOptions::window(2.0, 6.0), tail),
            Some(Duration::from_millis(2_500))
        );

        // A window ending before it starts only waits for the tail
        assert_eq!(
            auto_stop_delay(&project, &PlaybackOptions::window(6.0, 2.0), tail),
            Some(tail)
        );
    }

    #[test]
    fn test_untimeable_window_skips_auto_stop() {
        let tail = Duration::from_millis(500);
        let project = project();
        let endless = PlaybackOptions {
            end_time: Some(f64::INFINITY),
            ..PlaybackOptions::default()
        };
        assert_eq!(auto_stop_delay(&project, &endless, tail), None);

        let mut engine = engine();
        assert_eq!(engine.play(&project, &endless), 7);
        assert!(engine.auto_stop.is_none());
        assert_eq!(engine.playback_state(), PlaybackState::Playing);

        let mut huge = project.clone();
        huge.total_beats = Some(1e30);
        assert_eq!(auto_stop_delay(&huge, &PlaybackOptions::default(), tail), None);
        assert_eq!(engine.play(&huge, &PlaybackOptions::default()), 7);
        assert!(engine.auto_stop.is_none());
        assert_eq!(engine.active_instances(), 7);
    }

    #[test]
    fn test_future_voices_wait_until_their_block() {
        let mut project = Project::new("Long");
        let mut lead = Track::new("Lead", "lead");
        for beat in 0..100 {
            lead.create_note(60, beat as f64, 0.5, 100);
        }
        project.add_track(lead);

        let mut engine = engine();
        assert_eq!(engine.play(&project, &PlaybackOptions::default().looping()), 100);

        render_block(&engine, 256);
        {
            let mixer = lock(engine.mixer());
            assert_eq!(mixer.active.len(), 1);
            assert_eq!(mixer.pending.len(), 99);
            assert_eq!(mixer.pending.last().map(|v| v.start), Some(0.5));
        }

        // Beat 1 starts at 0.5 s, frame 22050, inside this block
        render_block(&engine, 22050);
        assert_eq!(lock(engine.mixer()).pending.len(), 98);
    }

    #[test]
    fn test_voice_starts_on_its_first_frame() {
        let mut mixer = LiveMixer::new(1000, 1.0);
        let event = NoteEvent {
            frequency: 440.0,
            start: 0.0105,
            end: 0.5,
            volume: 0.5,
        };
        schedule_note(&mut mixer, (), Instrument::Lead, &event);

        let mut left = vec![0.0; 32];
        let mut right = vec![0.0; 32];
        mixer.render(&mut left, &mut right);
        // First audible frame is ceil(10.5) = 11
        assert!(left[..11].iter().all(|&s| s == 0.0));
        assert_eq!(mixer.active.len(), 1);
        assert_eq!(mixer.active[0].first_frame(0, 1000.0), 11);
        assert_eq!(mixer.active[0].first_frame(32, 1000.0), 0);
    }

    #[test]
    fn test_master_volume() {
        let mut engine = engine();
        engine.set_master_volume(0.25);
        assert_eq!(engine.master_volume(), 0.25);
        engine.set_master_volume(f64::NAN);
        assert_eq!(engine.master_volume(), 0.25);

        engine.set_master_volume(0.0);
        engine.play(&project(), &PlaybackOptions::default().looping());
        let (left, _) = render_block(&engine, 2048);
        assert!(left.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn test_preview_note_is_not_registered() {
        let mut engine = engine();
        assert!(engine.preview_note(69));
        assert_eq!(engine.active_instances(), 0);
        assert_eq!(lock(engine.mixer()).voice_count(), 1);

        // 0.3 s lead plus release, then gone
        render_block(&engine, 44100);
        assert_eq!(lock(engine.mixer()).voice_count(), 0);
    }

    #[test]
    fn test_midi_to_frequency() {
        assert_eq!(AudioEngine::<NullOutput>::midi_to_frequency(69), 440.0);
        assert!((AudioEngine::<NullOutput>::midi_to_frequency(81) - 880.0).abs() < 1e-6);
    }
}
