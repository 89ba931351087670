//! Sample-rate conversion using rubato.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use carillon_core::{Error, Result, CHANNELS};
use rubato::{FftFixedIn, Resampler as RubatoResampler};
use tracing::debug;

use crate::buffer::StagingBuffer;

/// Input frames per resampler chunk.
const CHUNK_FRAMES: usize = 1024;

/// Streaming stereo resampler from a sound's rate to the device rate.
///
/// Output is aligned with input: the filter's leading delay is dropped, and
/// [`flush`](Self::flush) runs silence through until the last real frame is
/// out.
pub struct Resampler {
    #[allow(clippy::struct_field_names)]
    resampler: FftFixedIn<f32>,
    input_rate: u32,
    ratio: f64,
    /// Leading output frames still to drop.
    delay_left: usize,
    /// Real input frames converted so far.
    frames_in: u64,
    /// Output frames handed out so far.
    frames_out: u64,
    /// Deinterleaved input chunk.
    input_buffer: Vec<Vec<f32>>,
    /// Deinterleaved output chunk.
    output_buffer: Vec<Vec<f32>>,
}

impl Resampler {
    /// Create a resampler. Returns `None` when the rates match.
    pub fn new(input_rate: u32, output_rate: u32) -> Result<Option<Self>> {
        if input_rate == output_rate {
            return Ok(None);
        }

        let resampler = FftFixedIn::new(
            input_rate as usize,
            output_rate as usize,
            CHUNK_FRAMES,
            2,
            CHANNELS,
        )
        .map_err(|e| Error::Resample(format!("failed to create resampler: {e}")))?;

        let delay = resampler.output_delay();
        debug!("Resampler created: {input_rate}Hz -> {output_rate}Hz, delay {delay} frames");

        let input_buffer = resampler.input_buffer_allocate(true);
        let output_buffer = resampler.output_buffer_allocate(true);
        Ok(Some(Self {
            resampler,
            input_rate,
            ratio: f64::from(output_rate) / f64::from(input_rate),
            delay_left: delay,
            frames_in: 0,
            frames_out: 0,
            input_buffer,
            output_buffer,
        }))
    }

    pub const fn input_rate(&self) -> u32 {
        self.input_rate
    }

    /// Output frames per input frame, computed once.
    pub const fn ratio(&self) -> f64 {
        self.ratio
    }

    /// Largest number of interleaved samples a single chunk can produce.
    pub fn max_output_samples(&self) -> usize {
        self.resampler.output_frames_max() * CHANNELS
    }

    /// Convert as many whole chunks of `input` as fit into `out`. Returns the
    /// number of input samples consumed.
    pub fn process(&mut self, input: &[i16], out: &mut StagingBuffer) -> Result<usize> {
        let mut consumed = 0;
        loop {
            let frames = self.resampler.input_frames_next();
            let samples = frames * CHANNELS;
            if input.len() - consumed < samples || out.free() < self.max_output_samples() {
                return Ok(consumed);
            }
            self.run_chunk(&input[consumed..consumed + samples], None, out)?;
            self.frames_in += frames as u64;
            consumed += samples;
        }
    }

    /// Convert the final partial chunk and drain the filter. Total output
    /// ends up at the rounded input length times the ratio.
    pub fn flush(&mut self, input: &[i16], out: &mut StagingBuffer) -> Result<()> {
        self.frames_in += (input.len() / CHANNELS) as u64;
        #[allow(
            clippy::cast_possible_truncation,
            clippy::cast_sign_loss,
            clippy::cast_precision_loss
        )]
        let target = (self.frames_in as f64 * self.ratio).round() as u64;

        let mut chunk = input;
        while self.frames_out < target {
            out.ensure_capacity(out.len() + self.max_output_samples());
            let before = self.frames_out;
            self.run_chunk(chunk, Some(target - self.frames_out), out)?;
            chunk = &[];
            if self.frames_out == before && self.delay_left == 0 {
                break;
            }
        }
        Ok(())
    }

    /// Resample one zero-padded chunk, dropping delay frames and emitting at
    /// most `limit` frames.
    fn run_chunk(&mut self, input: &[i16], limit: Option<u64>, out: &mut StagingBuffer) -> Result<()> {
        let frames = self.resampler.input_frames_next();
        for channel in &mut self.input_buffer {
            channel.clear();
            channel.resize(frames, 0.0);
        }
        for (frame, samples) in input.chunks_exact(CHANNELS).take(frames).enumerate() {
            for (channel, &sample) in self.input_buffer.iter_mut().zip(samples) {
                channel[frame] = f32::from(sample) / 32768.0;
            }
        }

        let (_, written) = self
            .resampler
            .process_into_buffer(&self.input_buffer, &mut self.output_buffer, None)
            .map_err(|e| Error::Resample(format!("resample failed: {e}")))?;

        let skip = self.delay_left.min(written);
        self.delay_left -= skip;
        let mut end = written;
        if let Some(limit) = limit {
            end = end.min(skip + usize::try_from(limit).unwrap_or(usize::MAX));
        }

        let spare = out.spare_mut();
        let mut produced = 0;
        for frame in skip..end {
            if produced + CHANNELS > spare.len() {
                break;
            }
            for channel in &self.output_buffer {
                spare[produced] = to_i16(channel[frame]);
                produced += 1;
            }
        }
        out.commit(produced);
        self.frames_out += (produced / CHANNELS) as u64;
        Ok(())
    }
}

#[allow(clippy::cast_possible_truncation)]
fn to_i16(sample: f32) -> i16 {
    (sample * 32768.0).round().clamp(-32768.0, 32767.0) as i16
}
