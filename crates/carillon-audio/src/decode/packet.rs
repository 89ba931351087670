//! Pull decoders driven by symphonia: MP3, FLAC and PCM WAV.

use carillon_core::{Error, Result, CHANNELS};
use symphonia::core::{
    audio::SampleBuffer,
    codecs::{Decoder, DecoderOptions, CODEC_TYPE_NULL},
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader},
    io::{MediaSourceStream, MediaSourceStreamOptions},
};
use symphonia::default::formats::{FlacReader, MpaReader, WavReader};
use tracing::{debug, warn};

use super::source::StreamSource;
use super::validate_stream;

/// Container formats handled by [`PacketDecoder`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketFormat {
    Mp3,
    Flac,
    Wav,
}

/// Demuxer plus codec for one stream, producing interleaved stereo `i16`.
pub struct PacketDecoder {
    kind: PacketFormat,
    reader: Box<dyn FormatReader>,
    decoder: Box<dyn Decoder>,
    track_id: u32,
    sample_rate: u32,
    sample_buf: Option<SampleBuffer<i16>>,
    sample_buf_frames: usize,
    /// Samples of the last packet not handed out yet.
    pending: Vec<i16>,
    pending_pos: usize,
    finished: bool,
}

impl PacketDecoder {
    /// Open `source` as `kind`. Fails if the stream is not of that format or
    /// is not a stereo stream at a usable rate.
    pub fn open(kind: PacketFormat, source: StreamSource) -> Result<Self> {
        let mss = MediaSourceStream::new(Box::new(source), MediaSourceStreamOptions::default());
        let options = FormatOptions::default();
        let reader: Box<dyn FormatReader> = match kind {
            PacketFormat::Mp3 => Box::new(MpaReader::try_new(mss, &options).map_err(reject(kind))?),
            PacketFormat::Flac => {
                Box::new(FlacReader::try_new(mss, &options).map_err(reject(kind))?)
            }
            PacketFormat::Wav => Box::new(WavReader::try_new(mss, &options).map_err(reject(kind))?),
        };

        let track = reader
            .tracks()
            .iter()
            .find(|t| t.codec_params.codec != CODEC_TYPE_NULL)
            .ok_or_else(|| Error::UnsupportedFormat(format!("{kind:?}: no audio track")))?;

        let params = track.codec_params.clone();
        let track_id = track.id;
        let channels = params.channels.map_or(0, |c| c.count());
        let sample_rate = params.sample_rate.unwrap_or(0);
        validate_stream(channels, sample_rate)?;

        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(reject(kind))?;

        debug!("{kind:?} stream accepted: {sample_rate} Hz, {channels} channels");

        Ok(Self {
            kind,
            reader,
            decoder,
            track_id,
            sample_rate,
            sample_buf: None,
            sample_buf_frames: 0,
            pending: Vec::new(),
            pending_pos: 0,
            finished: false,
        })
    }

    pub const fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    /// Fill `out` with interleaved stereo samples. Returns the number of
    /// frames written; fewer than requested only at end of stream.
    pub fn read_frames(&mut self, out: &mut [i16]) -> Result<usize> {
        let wanted = out.len() / CHANNELS * CHANNELS;
        let mut written = 0;

        while written < wanted {
            let available = self.pending.len() - self.pending_pos;
            if available > 0 {
                let n = available.min(wanted - written);
                out[written..written + n]
                    .copy_from_slice(&self.pending[self.pending_pos..self.pending_pos + n]);
                self.pending_pos += n;
                written += n;
                continue;
            }
            if self.finished {
                break;
            }
            self.decode_packet()?;
        }

        Ok(written / CHANNELS)
    }

    /// Decode the next packet into `pending`, or mark the stream finished.
    fn decode_packet(&mut self) -> Result<()> {
        loop {
            let packet = match self.reader.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e)) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                    self.finished = true;
                    return Ok(());
                }
                Err(e) => {
                    return Err(Error::AudioDecode(format!(
                        "{:?}: failed to read packet: {e}",
                        self.kind
                    )));
                }
            };

            if packet.track_id() != self.track_id {
                continue;
            }

            let decoded = match self.decoder.decode(&packet) {
                Ok(decoded) => decoded,
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("{:?}: skipping undecodable packet: {e}", self.kind);
                    continue;
                }
                Err(e) => {
                    return Err(Error::AudioDecode(format!("{:?}: {e}", self.kind)));
                }
            };

            let spec = *decoded.spec();
            let frames = decoded.frames();
            if frames == 0 {
                continue;
            }
            if spec.channels.count() != CHANNELS {
                return Err(Error::AudioDecode(format!(
                    "{:?}: channel count changed mid-stream",
                    self.kind
                )));
            }

            if self.sample_buf.is_none() || self.sample_buf_frames < frames {
                self.sample_buf = Some(SampleBuffer::new(frames as u64, spec));
                self.sample_buf_frames = frames;
            }
            if let Some(buf) = self.sample_buf.as_mut() {
                buf.copy_interleaved_ref(decoded);
                self.pending.clear();
                self.pending.extend_from_slice(buf.samples());
                self.pending_pos = 0;
            }
            return Ok(());
        }
    }
}

fn reject(kind: PacketFormat) -> impl Fn(SymphoniaError) -> Error {
    move |e| Error::UnsupportedFormat(format!("{kind:?}: {e}"))
}
