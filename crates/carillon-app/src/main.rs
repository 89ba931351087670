//! # Carillon
//!
//! Command-line player for the Carillon audio engine. Plays one or more files
//! at once and exits when all of them have finished.

mod config;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use carillon_audio::{AudioSubsystem, Device};
use carillon_core::{Backend, DiskVfs, SoundId};
use clap::Parser;
use config::AppConfig;
use tracing::{info, warn};

/// How often playback state is polled.
const POLL_INTERVAL: Duration = Duration::from_millis(20);

#[derive(Parser, Debug)]
#[command(name = "carillon", version, about = "Play sound files through the Carillon engine")]
struct Args {
    /// Files to play, relative to --root.
    files: Vec<String>,

    /// Directory sound paths are resolved against.
    #[arg(long, default_value = ".")]
    root: PathBuf,

    /// Path to a JSON config file (defaults to carillon.json in the config dir).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Output sample rate: 22050, 44100 or 48000.
    #[arg(long)]
    rate: Option<u32>,

    /// Hardware buffer size in bytes.
    #[arg(long)]
    buffer: Option<usize>,

    /// Output backend: default, shared, exclusive, native or null.
    #[arg(long)]
    backend: Option<Backend>,

    /// Soundcard to open.
    #[arg(long)]
    soundcard: Option<String>,

    /// Volume, 0.0 to 1.0.
    #[arg(long)]
    volume: Option<f64>,

    /// Panning, -1.0 (left) to 1.0 (right).
    #[arg(long, allow_hyphen_values = true)]
    pan: Option<f64>,

    /// Loop every file until interrupted.
    #[arg(long = "loop")]
    looping: bool,

    /// List the soundcards of the selected backend and exit.
    #[arg(long)]
    list_soundcards: bool,
}

impl Args {
    /// Command-line values take precedence over the config file.
    fn apply(&self, config: &mut AppConfig) {
        if let Some(rate) = self.rate {
            config.device.sample_rate = rate;
        }
        if let Some(buffer) = self.buffer {
            config.device.buffer_bytes = buffer;
        }
        if let Some(backend) = self.backend {
            config.device.backend = backend;
        }
        if self.soundcard.is_some() {
            config.device.soundcard.clone_from(&self.soundcard);
        }
        if let Some(volume) = self.volume {
            config.volume = volume;
        }
        if let Some(pan) = self.pan {
            config.panning = pan;
        }
    }
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "carillon=info,carillon_audio=info".into()),
        )
        .init();

    let args = Args::parse();
    info!("Starting Carillon v{}", env!("CARGO_PKG_VERSION"));

    let mut config = AppConfig::load(args.config.as_deref())?;
    args.apply(&mut config);

    let mut audio = AudioSubsystem::new(Arc::new(DiskVfs::new(&args.root)));

    if args.list_soundcards {
        for (index, name) in audio
            .soundcard_names(config.device.backend)
            .iter()
            .enumerate()
        {
            println!("{index}: {name}");
        }
        return Ok(());
    }

    if args.files.is_empty() {
        bail!("no files to play");
    }

    let id = audio
        .open_device(&config.device)
        .context("failed to open audio device")?;
    let Some(device) = audio.device(id) else {
        bail!("device {id} vanished after opening");
    };

    let mut sounds = Vec::new();
    for file in &args.files {
        match device.play_sound_from_file(file, config.volume, config.panning, args.looping) {
            Ok(sound) => {
                info!("Playing {file}");
                sounds.push((file.as_str(), sound));
            }
            Err(e) => warn!("Cannot play {file}: {e}"),
        }
    }
    if sounds.is_empty() {
        bail!("none of the files could be played");
    }

    wait_for(device, &sounds);

    let failed: Vec<_> = sounds
        .iter()
        .filter(|(_, sound)| device.had_playback_error(*sound))
        .map(|(file, _)| *file)
        .collect();
    audio.destroy_device(id);

    if !failed.is_empty() {
        bail!("playback failed for: {}", failed.join(", "));
    }
    Ok(())
}

/// Block until every sound has stopped. Without hardware the mixer is pulled
/// here at the device's real-time rate.
fn wait_for(device: &Device, sounds: &[(&str, SoundId)]) {
    let pull_mixer = !device.config().backend.is_hardware();
    let block_time = Duration::from_secs_f64(
        device.config().buffer_frames() as f64 / f64::from(device.config().sample_rate),
    );
    let mut block = vec![0i16; device.mixer().block_samples()];
    let mut next_block = Instant::now();

    while sounds.iter().any(|(_, sound)| device.is_playing(*sound)) {
        if pull_mixer {
            while next_block <= Instant::now() {
                device.mixer().mix(&mut block);
                next_block += block_time;
            }
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}
