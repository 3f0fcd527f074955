//! rollsynth - render and play piano-roll projects from the command line.
//!
//! Reads a project JSON file and either renders it to WAV (the full mix or
//! one file per track) or plays it through the default audio device.
//!
//! # Usage
//!
//! ```bash
//! rollsynth song.json                      # Render song.json to "<name>.wav"
//! rollsynth song.json --out mix.wav --seed 7
//! rollsynth song.json --stems stems/       # One WAV per non-muted track
//! rollsynth song.json --play               # Play through the speakers
//! ```
//!
//! Set `RUST_LOG=debug` for scheduling and render details.

use anyhow::{bail, Context, Result};
use rollsynth::audio::{
    auto_stop_delay, export_audio, export_stems, stem_file_name, AudioEngine, ExportFormat,
    RenderOptions,
};
use rollsynth::midi::{PlaybackOptions, Project};
use std::fs;
use std::path::{Path, PathBuf};
use std::thread;

/// Command-line options for the application.
struct CliOptions {
    /// Project JSON file to load.
    project: PathBuf,
    /// Output path for the full mix.
    out: Option<PathBuf>,
    /// Directory to write per-track stems into.
    stems: Option<PathBuf>,
    format: ExportFormat,
    render: RenderOptions,
    /// Play through the default output device.
    play: bool,
}

impl CliOptions {
    /// Parses command-line arguments.
    ///
    /// Supports:
    /// - `<project.json>`: Project file (required)
    /// - `--out <path>` or `-o <path>`: Write the mix here
    /// - `--stems <dir>`: Write one WAV per non-muted track into `dir`
    /// - `--format <wav|mp3>`: Export format (MP3 falls back to WAV)
    /// - `--sample-rate <hz>`, `--duration <seconds>`, `--seed <n>`: Render options
    /// - `--play` or `-p`: Play the project instead of (or as well as) exporting
    /// - `--help` or `-h`: Print help and exit
    fn parse() -> Result<Self> {
        let args: Vec<String> = std::env::args().collect();
        let mut project: Option<PathBuf> = None;
        let mut out: Option<PathBuf> = None;
        let mut stems: Option<PathBuf> = None;
        let mut format = ExportFormat::Wav;
        let mut render = RenderOptions::default();
        let mut play = false;
        let mut i = 1;

        while i < args.len() {
            match args[i].as_str() {
                "--out" | "-o" => out = Some(PathBuf::from(value(&args, &mut i)?)),
                "--stems" => stems = Some(PathBuf::from(value(&args, &mut i)?)),
                "--format" | "-f" => {
                    format = value(&args, &mut i)?
                        .parse()
                        .map_err(anyhow::Error::msg)?;
                }
                "--sample-rate" => {
                    render.sample_rate = value(&args, &mut i)?
                        .parse()
                        .context("--sample-rate expects an integer")?;
                }
                "--duration" => {
                    render.duration = Some(
                        value(&args, &mut i)?
                            .parse()
                            .context("--duration expects a number of seconds")?,
                    );
                }
                "--seed" => {
                    render.seed = Some(
                        value(&args, &mut i)?
                            .parse()
                            .context("--seed expects an integer")?,
                    );
                }
                "--play" | "-p" => play = true,
                "--help" | "-h" => {
                    eprintln!("rollsynth - render and play piano-roll projects");
                    eprintln!();
                    eprintln!(
                        "Usage: {} <project.json> [OPTIONS]",
                        args.first().map_or("rollsynth", String::as_str)
                    );
                    eprintln!();
                    eprintln!("Options:");
                    eprintln!("  -o, --out PATH         Write the mix to PATH (default: <name>.wav)");
                    eprintln!("      --stems DIR        Write one WAV per non-muted track into DIR");
                    eprintln!("  -f, --format FORMAT    wav or mp3 (mp3 is written as wav)");
                    eprintln!("      --sample-rate HZ   Output sample rate (default: 44100)");
                    eprintln!("      --duration SECS    Render length (default: project length)");
                    eprintln!("      --seed N           Seed drum noise for repeatable output");
                    eprintln!("  -p, --play             Play through the default audio device");
                    eprintln!("  -h, --help             Print this help message");
                    std::process::exit(0);
                }
                other if other.starts_with('-') => {
                    eprintln!("Unknown option: {}", other);
                    eprintln!("Use --help for usage information");
                    std::process::exit(1);
                }
                other => {
                    if project.is_some() {
                        bail!("Only one project file can be given (got '{}')", other);
                    }
                    project = Some(PathBuf::from(other));
                }
            }
            i += 1;
        }

        let Some(project) = project else {
            bail!("No project file given. Use --help for usage information");
        };

        Ok(Self {
            project,
            out,
            stems,
            format,
            render,
            play,
        })
    }

    /// Whether anything should be written to disk.
    fn exports(&self) -> bool {
        self.out.is_some() || self.stems.is_some() || !self.play
    }
}

/// Returns the argument following the option at `i`, advancing `i`.
fn value<'a>(args: &'a [String], i: &mut usize) -> Result<&'a str> {
    let option = &args[*i];
    *i += 1;
    args.get(*i)
        .map(String::as_str)
        .with_context(|| format!("{} requires a value", option))
}

/// Writes the full mix and returns the path actually written.
fn write_mix(project: &Project, cli: &CliOptions) -> Result<PathBuf> {
    let exported = export_audio(project, cli.format, &cli.render)
        .with_context(|| format!("Failed to render '{}'", project.name))?;

    let mut path = cli
        .out
        .clone()
        .unwrap_or_else(|| PathBuf::from(&project.name));
    path.set_extension(exported.format.extension());
    fs::write(&path, &exported.bytes)
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(path)
}

fn write_stems(project: &Project, cli: &CliOptions, dir: &Path) -> Result<usize> {
    let stems = export_stems(project, &cli.render)
        .with_context(|| format!("Failed to render stems for '{}'", project.name))?;

    fs::create_dir_all(dir).with_context(|| format!("Failed to create {}", dir.display()))?;
    for (track, bytes) in &stems {
        let path = dir.join(stem_file_name(&project.name, track));
        fs::write(&path, bytes).with_context(|| format!("Failed to write {}", path.display()))?;
        tracing::info!("Wrote stem {}", path.display());
    }
    Ok(stems.len())
}

/// Plays the whole project and blocks until it has finished.
fn play(project: &Project) {
    let mut engine = AudioEngine::new();
    if !engine.init() {
        eprintln!("No audio output available; skipping playback");
        return;
    }

    let options = PlaybackOptions::default();
    let Some(length) = auto_stop_delay(project, &options, engine.config().auto_stop_tail) else {
        eprintln!("Project is too long to play");
        return;
    };

    let scheduled = engine.play(project, &options);
    eprintln!(
        "Playing '{}' ({} notes, {:.1}s)",
        project.name,
        scheduled,
        project.duration_seconds()
    );
    thread::sleep(length);
    engine.stop();
}

/// Main entry point.
fn main() -> Result<()> {
    let cli = CliOptions::parse()?;

    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let project = Project::load_from_file(&cli.project)
        .with_context(|| format!("Failed to load project: {}", cli.project.display()))?;
    tracing::debug!(
        "Loaded '{}': {} tracks at {} BPM",
        project.name,
        project.track_count(),
        project.tempo
    );

    if cli.exports() {
        if let Some(dir) = &cli.stems {
            let count = write_stems(&project, &cli, dir)?;
            eprintln!("Exported {} stems to {}", count, dir.display());
        }
        if cli.out.is_some() || cli.stems.is_none() {
            let path = write_mix(&project, &cli)?;
            eprintln!("Exported to {}", path.display());
        }
    }

    if cli.play {
        play(&project);
    }

    Ok(())
}
