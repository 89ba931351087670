//! Decode-side state of one playing sound.
//!
//! A [`Sound`] owns the open stream, the codec chosen for it, one second of
//! decoded audio and, when the file rate differs from the device rate, a
//! resampler with its own output buffer. The decode thread asks it for one
//! hardware block at a time with [`Sound::obtain_block`].

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::Arc;

use carillon_core::{Error, Result, SoundId, Vfs, CHANNELS};
use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::buffer::StagingBuffer;
use crate::decode::{Codec, SharedStream};
use crate::resample::Resampler;

/// What [`Sound::obtain_block`] produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockOutcome {
    /// The block holds audio, zero-padded at the very end of the stream.
    Filled,
    /// Nothing left to play. The block is untouched.
    Exhausted,
    /// Decoding failed for good. The block is silence.
    Failed,
}

/// Decode state for one sound.
pub struct Sound {
    id: SoundId,
    path: String,
    looping: bool,
    output_rate: u32,
    vfs: Arc<dyn Vfs>,
    stream: Option<(SharedStream, Option<u64>)>,
    codec: Option<Codec>,
    /// Raw decoded audio at the source rate.
    decoded: StagingBuffer,
    resampler: Option<Resampler>,
    /// Audio converted to the device rate.
    resampled: StagingBuffer,
    /// Sticky: once set, the sound never decodes again.
    failed: bool,
    end_of_stream: bool,
    flushed: bool,
    exhausted: bool,
    /// Frames decoded since the codec was last (re)opened.
    frames_since_open: u64,
}

impl Sound {
    /// Create a sound. Nothing is read until the first block is requested.
    pub fn new(
        id: SoundId,
        path: impl Into<String>,
        looping: bool,
        vfs: Arc<dyn Vfs>,
        output_rate: u32,
    ) -> Self {
        Self {
            id,
            path: path.into(),
            looping,
            output_rate,
            vfs,
            stream: None,
            codec: None,
            decoded: StagingBuffer::default(),
            resampler: None,
            resampled: StagingBuffer::default(),
            failed: false,
            end_of_stream: false,
            flushed: false,
            exhausted: false,
            frames_since_open: 0,
        }
    }

    pub const fn id(&self) -> SoundId {
        self.id
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub const fn is_looping(&self) -> bool {
        self.looping
    }

    /// Whether decoding failed. Sticky.
    pub const fn has_failed(&self) -> bool {
        self.failed
    }

    /// Whether every decoded block has been handed out.
    pub const fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Name of the codec in use, once the file has been probed.
    pub fn codec_name(&self) -> Option<&'static str> {
        self.codec.as_ref().map(Codec::name)
    }

    /// Output frames per source frame, once known. Exactly 1.0 when no
    /// conversion is needed.
    pub fn resample_ratio(&self) -> Option<f64> {
        match (&self.resampler, &self.codec) {
            (Some(resampler), _) => Some(resampler.ratio()),
            (None, Some(_)) => Some(1.0),
            (None, None) => None,
        }
    }

    /// Produce exactly one block of interleaved output samples.
    pub fn obtain_block(&mut self, block: &mut [i16]) -> BlockOutcome {
        if self.exhausted {
            return BlockOutcome::Exhausted;
        }
        match self.fill_pipeline(block.len()) {
            Ok(()) => {}
            Err(e) => {
                warn!("sound {} ({}): playback failed: {e}", self.id, self.path);
                self.failed = true;
                block.fill(0);
                return BlockOutcome::Failed;
            }
        }

        let source = if self.resampler.is_some() {
            &mut self.resampled
        } else {
            &mut self.decoded
        };
        let count = source.len().min(block.len());
        block[..count].copy_from_slice(&source.filled()[..count]);
        block[count..].fill(0);
        source.consume(count);

        if count == 0 && self.end_of_stream {
            debug!("sound {} ({}): end of stream", self.id, self.path);
            self.exhausted = true;
            return BlockOutcome::Exhausted;
        }
        BlockOutcome::Filled
    }

    fn fill_pipeline(&mut self, block_samples: usize) -> Result<()> {
        self.decode_more()?;
        if self.resampler.is_some() {
            self.resample_more(block_samples)?;
        }
        Ok(())
    }

    /// Top the decode-ahead buffer up to one second of audio.
    pub fn decode_more(&mut self) -> Result<()> {
        if self.failed {
            return Err(Error::AudioDecode("sound already failed".to_string()));
        }
        let result = self.decode_more_inner();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn decode_more_inner(&mut self) -> Result<()> {
        if self.codec.is_none() && !self.end_of_stream {
            self.open_codec()?;
        }

        while self.decoded.free() >= CHANNELS && !self.end_of_stream {
            let Some(codec) = self.codec.as_mut() else {
                break;
            };
            let spare = self.decoded.spare_mut();
            let wanted = spare.len() / CHANNELS;
            let frames = codec.read_frames(spare)?;
            self.decoded.commit(frames * CHANNELS);
            self.frames_since_open += frames as u64;

            if frames < wanted {
                self.reached_end()?;
            }
        }
        Ok(())
    }

    fn reached_end(&mut self) -> Result<()> {
        if self.looping && self.frames_since_open > 0 {
            debug!("sound {} ({}): looping", self.id, self.path);
            self.codec = None;
            self.open_codec()
        } else {
            self.codec = None;
            self.stream = None;
            self.end_of_stream = true;
            Ok(())
        }
    }

    fn open_codec(&mut self) -> Result<()> {
        let (stream, len) = match &self.stream {
            Some((stream, len)) => (Arc::clone(stream), *len),
            None => {
                let stream: SharedStream = Arc::new(Mutex::new(self.vfs.open(&self.path)?));
                let len = self.vfs.size(&self.path).ok();
                self.stream = Some((Arc::clone(&stream), len));
                (stream, len)
            }
        };

        let codec = Codec::probe(&stream, len)?;
        let input_rate = codec.sample_rate();
        debug!(
            "sound {} ({}): {} stream at {input_rate} Hz",
            self.id,
            self.path,
            codec.name()
        );

        self.decoded.ensure_capacity(input_rate as usize * CHANNELS);
        let rate_changed = self
            .resampler
            .as_ref()
            .map_or(true, |r| r.input_rate() != input_rate);
        if rate_changed {
            self.resampler = Resampler::new(input_rate, self.output_rate)?;
            if let Some(resampler) = &self.resampler {
                let output_second = self.output_rate as usize * CHANNELS;
                self.resampled
                    .ensure_capacity(output_second.max(resampler.max_output_samples() * 4));
            }
        }

        self.codec = Some(codec);
        self.frames_since_open = 0;
        Ok(())
    }

    /// Convert decoded audio until at least one block is ready, flushing the
    /// resampler once the stream has ended.
    fn resample_more(&mut self, block_samples: usize) -> Result<()> {
        let Some(resampler) = self.resampler.as_mut() else {
            return Ok(());
        };
        self.resampled
            .ensure_capacity(block_samples * 4 + resampler.max_output_samples());

        while self.resampled.len() < block_samples {
            let consumed = resampler.process(self.decoded.filled(), &mut self.resampled)?;
            self.decoded.consume(consumed);
            if consumed > 0 {
                continue;
            }
            if self.end_of_stream && !self.flushed {
                resampler.flush(self.decoded.filled(), &mut self.resampled)?;
                self.decoded.clear();
                self.flushed = true;
            }
            break;
        }
        Ok(())
    }
}
