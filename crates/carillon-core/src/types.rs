//! Identifiers, backend selection, and device configuration.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::fmt;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Number of interleaved output channels. Output is always stereo.
pub const CHANNELS: usize = 2;

/// Bytes per output sample (signed 16-bit).
pub const BYTES_PER_SAMPLE: usize = 2;

/// Bytes per interleaved output frame.
pub const FRAME_BYTES: usize = BYTES_PER_SAMPLE * CHANNELS;

/// Output sample rates a device can be opened with.
pub const SUPPORTED_SAMPLE_RATES: [u32; 3] = [22050, 44100, 48000];

/// Smallest hardware buffer accepted; smaller requests are raised to this.
pub const MIN_BUFFER_BYTES: usize = 512;

/// Identifier of an open audio device, unique for the subsystem's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct DeviceId(pub u32);

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifier of a sound, unique within its device. Never zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SoundId(NonZeroU64);

impl SoundId {
    /// Wrap a raw id, returning `None` for zero.
    pub const fn new(raw: u64) -> Option<Self> {
        match NonZeroU64::new(raw) {
            Some(id) => Some(Self(id)),
            None => None,
        }
    }

    /// The raw integer value.
    pub const fn get(self) -> u64 {
        self.0.get()
    }
}

impl fmt::Display for SoundId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Output backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// Platform default (resolves to [`Backend::Native`]).
    #[default]
    Default,
    /// Push everything through the OS mixer, letting it pick the buffer size.
    Shared,
    /// Request the configured buffer size exactly. Opening fails when the
    /// device reports a range that excludes it.
    #[serde(rename = "exclusive")]
    ExclusiveLowLatency,
    /// The platform's native host with the configured buffer size, clamped
    /// into the range the device reports.
    Native,
    /// No hardware. The host pulls mixed blocks itself.
    Null,
}

impl Backend {
    /// Resolve [`Backend::Default`] to the concrete backend it stands for.
    pub const fn resolve(self) -> Self {
        match self {
            Self::Default => Self::Native,
            other => other,
        }
    }

    /// Whether this backend drives real audio hardware.
    pub const fn is_hardware(self) -> bool {
        !matches!(self, Self::Null)
    }
}

impl std::str::FromStr for Backend {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "default" => Ok(Self::Default),
            "shared" => Ok(Self::Shared),
            "exclusive" | "exclusive-low-latency" => Ok(Self::ExclusiveLowLatency),
            "native" => Ok(Self::Native),
            "null" => Ok(Self::Null),
            other => Err(Error::UnavailableBackend(other.to_string())),
        }
    }
}

/// Configuration for opening an audio device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Output sample rate, one of [`SUPPORTED_SAMPLE_RATES`].
    pub sample_rate: u32,
    /// Hardware buffer size hint in bytes.
    pub buffer_bytes: usize,
    /// Output backend.
    pub backend: Backend,
    /// Soundcard to open; `None` opens the default one.
    pub soundcard: Option<String>,
    /// Spawn the background decode thread. When false the host calls
    /// `Device::pump` itself.
    pub decode_thread: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48000,
            buffer_bytes: 1024,
            backend: Backend::Default,
            soundcard: None,
            decode_thread: true,
        }
    }
}

impl DeviceConfig {
    /// Config for a hardware-less device that the caller pumps and mixes by hand.
    pub fn headless(sample_rate: u32, buffer_bytes: usize) -> Self {
        Self {
            sample_rate,
            buffer_bytes,
            backend: Backend::Null,
            soundcard: None,
            decode_thread: false,
        }
    }

    /// Validate the sample rate and round the buffer size down to whole frames.
    pub fn normalized(&self) -> Result<Self> {
        if !SUPPORTED_SAMPLE_RATES.contains(&self.sample_rate) {
            return Err(Error::UnsupportedSampleRate(self.sample_rate));
        }
        let buffer_bytes = self.buffer_bytes.max(MIN_BUFFER_BYTES) / FRAME_BYTES * FRAME_BYTES;
        Ok(Self {
            buffer_bytes,
            backend: self.backend.resolve(),
            ..self.clone()
        })
    }

    /// Frames per hardware buffer.
    pub const fn buffer_frames(&self) -> usize {
        self.buffer_bytes / FRAME_BYTES
    }

    /// Interleaved samples per hardware buffer.
    pub const fn buffer_samples(&self) -> usize {
        self.buffer_bytes / BYTES_PER_SAMPLE
    }
}
