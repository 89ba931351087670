//! Error types for Carillon.

use thiserror::Error;

/// Result type alias using Carillon's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for Carillon.
#[derive(Error, Debug)]
pub enum Error {
    // Device setup errors
    #[error("unsupported sample rate: {0}")]
    UnsupportedSampleRate(u32),

    #[error("unknown or unavailable backend: {0}")]
    UnavailableBackend(String),

    #[error("soundcard not found: {0}")]
    SoundcardNotFound(String),

    #[error("failed to open audio device: {0}")]
    AudioOutput(String),

    #[error("failed to spawn {name} thread: {reason}")]
    ThreadSpawn { name: &'static str, reason: String },

    #[error("audio device was closed")]
    DeviceClosed,

    // Sound control errors
    #[error("sound table is full ({0} sounds playing)")]
    SoundTableFull(usize),

    #[error("sound file not found: {0}")]
    FileNotFound(String),

    // Decode errors
    #[error("audio decode error: {0}")]
    AudioDecode(String),

    #[error("unsupported audio format: {0}")]
    UnsupportedFormat(String),

    #[error("resample error: {0}")]
    Resample(String),

    // IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Serialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    // Generic errors
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Returns true if this error happened while setting up a device.
    ///
    /// Setup errors are reported synchronously to the caller; decode errors
    /// only ever surface through a sound's playback error flag.
    pub const fn is_setup_error(&self) -> bool {
        matches!(
            self,
            Self::UnsupportedSampleRate(_)
                | Self::UnavailableBackend(_)
                | Self::SoundcardNotFound(_)
                | Self::AudioOutput(_)
                | Self::ThreadSpawn { .. }
        )
    }

    /// Returns true if this error came out of a codec or the resampler.
    pub const fn is_decode_error(&self) -> bool {
        matches!(
            self,
            Self::AudioDecode(_) | Self::UnsupportedFormat(_) | Self::Resample(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classification() {
        assert!(Error::UnsupportedSampleRate(12345).is_setup_error());
        assert!(Error::ThreadSpawn {
            name: "audio-decode",
            reason: "out of threads".into()
        }
        .is_setup_error());
        assert!(!Error::SoundTableFull(256).is_setup_error());
        assert!(Error::UnsupportedFormat("test".into()).is_decode_error());
        assert!(!Error::DeviceClosed.is_decode_error());
    }

    #[test]
    fn test_error_display() {
        let err = Error::UnsupportedSampleRate(12345);
        assert_eq!(err.to_string(), "unsupported sample rate: 12345");

        let err = Error::SoundTableFull(256);
        assert_eq!(err.to_string(), "sound table is full (256 sounds playing)");
    }

    #[test]
    fn test_io_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }
}
