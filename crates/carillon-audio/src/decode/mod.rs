//! Format probing and the per-sound codec.
//!
//! Codecs are tried in a fixed order (MP3, FLAC, Vorbis, then PCM WAV). Each
//! attempt starts from a rewound stream and is rejected unless it yields a
//! stereo stream at a sane sample rate, in which case the next codec is
//! tried. File names are never consulted.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

pub mod packet;
pub mod source;
pub mod vorbis;

use std::sync::Arc;

use carillon_core::{Error, Result, CHANNELS};
use tracing::debug;

pub use packet::{PacketDecoder, PacketFormat};
pub use source::{SharedStream, StreamSource};
pub use vorbis::VorbisStream;

/// Lowest source sample rate accepted from a codec.
pub const MIN_SOURCE_RATE: u32 = 10_000;

/// Highest source sample rate accepted from a codec.
pub const MAX_SOURCE_RATE: u32 = 100_000;

/// Reject streams the mixer cannot take: anything but stereo, or a rate
/// outside the sane range.
pub fn validate_stream(channels: usize, sample_rate: u32) -> Result<()> {
    if channels != CHANNELS {
        return Err(Error::UnsupportedFormat(format!(
            "{channels} channels, only stereo is supported"
        )));
    }
    if !(MIN_SOURCE_RATE..=MAX_SOURCE_RATE).contains(&sample_rate) {
        return Err(Error::UnsupportedFormat(format!(
            "sample rate {sample_rate} Hz out of range"
        )));
    }
    Ok(())
}

/// The one codec a sound is decoding with.
pub enum Codec {
    Mp3(PacketDecoder),
    Flac(PacketDecoder),
    Vorbis(Box<VorbisStream>),
    Wav(PacketDecoder),
}

impl Codec {
    /// Find the first codec that accepts `stream`.
    pub fn probe(stream: &SharedStream, len: Option<u64>) -> Result<Self> {
        for kind in [PacketFormat::Mp3, PacketFormat::Flac] {
            if let Some(codec) = Self::try_packet(kind, stream, len)? {
                return Ok(codec);
            }
        }

        rewind(stream)?;
        match VorbisStream::probe(Arc::clone(stream), len) {
            Ok(vorbis) => return Ok(Self::Vorbis(Box::new(vorbis))),
            Err(Error::Io(e)) => return Err(Error::Io(e)),
            Err(e) => debug!("vorbis probe rejected stream: {e}"),
        }

        if let Some(codec) = Self::try_packet(PacketFormat::Wav, stream, len)? {
            return Ok(codec);
        }

        Err(Error::UnsupportedFormat(
            "no decoder accepted the stream".to_string(),
        ))
    }

    fn try_packet(kind: PacketFormat, stream: &SharedStream, len: Option<u64>) -> Result<Option<Self>> {
        rewind(stream)?;
        match PacketDecoder::open(kind, StreamSource::new(Arc::clone(stream), len)) {
            Ok(decoder) => Ok(Some(match kind {
                PacketFormat::Mp3 => Self::Mp3(decoder),
                PacketFormat::Flac => Self::Flac(decoder),
                PacketFormat::Wav => Self::Wav(decoder),
            })),
            Err(e) => {
                debug!("{kind:?} probe rejected stream: {e}");
                Ok(None)
            }
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Mp3(_) => "mp3",
            Self::Flac(_) => "flac",
            Self::Vorbis(_) => "vorbis",
            Self::Wav(_) => "wav",
        }
    }

    /// Source sample rate.
    pub fn sample_rate(&self) -> u32 {
        match self {
            Self::Mp3(d) | Self::Flac(d) | Self::Wav(d) => d.sample_rate(),
            Self::Vorbis(v) => v.sample_rate(),
        }
    }

    /// Decode into `out` (interleaved stereo). Returns frames written; a short
    /// count means the end of the stream was reached.
    pub fn read_frames(&mut self, out: &mut [i16]) -> Result<usize> {
        match self {
            Self::Mp3(d) | Self::Flac(d) | Self::Wav(d) => d.read_frames(out),
            Self::Vorbis(v) => v.read_frames(out),
        }
    }
}

fn rewind(stream: &SharedStream) -> Result<()> {
    stream.lock().seek(0)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{flac_file, wav_file};
    use carillon_core::{MemoryVfs, Vfs};
    use parking_lot::Mutex;

    fn open(vfs: &MemoryVfs, path: &str) -> (SharedStream, Option<u64>) {
        let stream = Arc::new(Mutex::new(vfs.open(path).unwrap()));
        (stream, vfs.size(path).ok())
    }

    #[test]
    fn test_validate_stream() {
        assert!(validate_stream(2, 44100).is_ok());
        assert!(validate_stream(1, 44100).is_err());
        assert!(validate_stream(6, 48000).is_err());
        assert!(validate_stream(2, 9_999).is_err());
        assert!(validate_stream(2, 100_001).is_err());
    }

    #[test]
    fn test_probe_picks_flac() {
        let vfs = MemoryVfs::new();
        vfs.insert("tone.flac", flac_file(44100, 2, 4410, 1000));
        let (stream, len) = open(&vfs, "tone.flac");

        let mut codec = Codec::probe(&stream, len).unwrap();
        assert_eq!(codec.name(), "flac");
        assert_eq!(codec.sample_rate(), 44100);

        let mut out = vec![0i16; 8192];
        let mut total = 0;
        loop {
            let frames = codec.read_frames(&mut out).unwrap();
            assert!(out[..frames * 2].iter().all(|&s| s == 1000));
            total += frames;
            if frames * 2 < out.len() {
                break;
            }
        }
        assert_eq!(total, 4410);
    }

    #[test]
    fn test_flac_probe_never_seeks_forward() {
        let vfs = MemoryVfs::new();
        vfs.insert("tone.flac", flac_file(44100, 2, 44100, 1000));
        let (stream, len) = open(&vfs, "tone.flac");

        let mut codec = Codec::probe(&stream, len).unwrap();
        let mut out = vec![0i16; 4096];
        while codec.read_frames(&mut out).unwrap() * 2 == out.len() {}

        let seeks = vfs.seeks("tone.flac");
        assert!(!seeks.is_empty());
        assert!(seeks.iter().all(|&offset| offset == 0), "seeks: {seeks:?}");
    }

    #[test]
    fn test_probe_falls_back_to_wav() {
        let vfs = MemoryVfs::new();
        vfs.insert("tone.wav", wav_file(22050, 2, 2205, 700));
        let (stream, len) = open(&vfs, "tone.wav");

        let mut codec = Codec::probe(&stream, len).unwrap();
        assert_eq!(codec.name(), "wav");
        assert_eq!(codec.sample_rate(), 22050);

        let mut out = vec![0i16; 2205 * 2 + 10];
        assert_eq!(codec.read_frames(&mut out).unwrap(), 2205);
        assert!(out[..2205 * 2].iter().all(|&s| s == 700));
    }

    #[test]
    fn test_detects_vorbis() {
        let vfs = MemoryVfs::new();
        vfs.insert("stereo.ogg", include_bytes!("../../testdata/stereo.ogg").to_vec());
        let (stream, len) = open(&vfs, "stereo.ogg");

        let mut codec = Codec::probe(&stream, len).unwrap();
        assert_eq!(codec.name(), "vorbis");
        assert_eq!(codec.sample_rate(), 44100);

        let mut out = vec![0i16; 4096];
        assert_eq!(codec.read_frames(&mut out).unwrap(), 2048);
    }

    #[test]
    fn test_probe_rejects_mono() {
        let vfs = MemoryVfs::new();
        vfs.insert("mono.wav", wav_file(44100, 1, 4410, 500));
        vfs.insert("mono.flac", flac_file(44100, 1, 4410, 500));
        for path in ["mono.wav", "mono.flac"] {
            let (stream, len) = open(&vfs, path);
            assert!(matches!(
                Codec::probe(&stream, len),
                Err(Error::UnsupportedFormat(_))
            ));
        }
    }

    #[test]
    fn test_probe_rejects_garbage() {
        let vfs = MemoryVfs::new();
        vfs.insert("noise.bin", vec![0x11u8; 3000]);
        let (stream, len) = open(&vfs, "noise.bin");
        assert!(Codec::probe(&stream, len).is_err());
    }
}
