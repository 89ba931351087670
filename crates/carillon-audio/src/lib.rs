//! # carillon-audio
//!
//! Real-time mixing engine for game sound effects and music.
//!
//! Features:
//! - MP3, FLAC, Ogg Vorbis and WAV playback from any [`carillon_core::Vfs`]
//! - Lock-free playback rings between the decode thread and the mixer
//! - Per-sound volume and panning with hard clipping
//! - Low-latency cpal output, or a null output pulled by the host

pub mod buffer;
pub mod decode;
pub mod device;
pub mod mixer;
pub mod output;
pub mod resample;
pub mod sound;
pub mod subsystem;

#[cfg(test)]
mod testutil;

pub use device::{Device, MAX_PLAYING_SOUNDS};
pub use mixer::{Mixer, Voice, VoiceTable};
pub use output::{AudioOutput, FALLBACK_SOUNDCARD_NAME};
pub use subsystem::AudioSubsystem;
