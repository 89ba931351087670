//! Audio output using cpal.
//!
//! The cpal stream is not `Send`, so it is built and kept alive on a
//! dedicated thread that reports back once the stream is running (or failed
//! to start) and then waits to be told to shut down.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::Arc;
use std::thread::JoinHandle;

use carillon_core::{Backend, DeviceConfig, Error, Result, CHANNELS};
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    BufferSize, Device, SampleFormat, Stream, StreamConfig, SupportedBufferSize,
};
use crossbeam_channel::{bounded, Sender};
use tracing::{debug, error, info};

use crate::mixer::Mixer;

/// Name reported when the host cannot enumerate any soundcard.
pub const FALLBACK_SOUNDCARD_NAME: &str = "default unknown device";

/// Name of the hardware-less output.
pub const NULL_OUTPUT_NAME: &str = "null";

/// Re-chunks whatever the hardware asks for into whole mixer blocks.
pub struct BlockAdapter {
    mixer: Arc<Mixer>,
    block: Vec<i16>,
    position: usize,
}

impl BlockAdapter {
    pub fn new(mixer: Arc<Mixer>) -> Self {
        let block = vec![0; mixer.block_samples()];
        let position = block.len();
        Self {
            mixer,
            block,
            position,
        }
    }

    /// Fill `data` from consecutive mixer blocks.
    pub fn fill<T: cpal::SizedSample + cpal::FromSample<i16>>(&mut self, data: &mut [T]) {
        for sample in data.iter_mut() {
            if self.position >= self.block.len() {
                self.mixer.mix(&mut self.block);
                self.position = 0;
                if self.block.is_empty() {
                    *sample = T::from_sample(0i16);
                    continue;
                }
            }
            *sample = T::from_sample(self.block[self.position]);
            self.position += 1;
        }
    }
}

struct OutputWorker {
    shutdown_tx: Sender<()>,
    handle: JoinHandle<()>,
}

/// A running output. Dropping it stops the stream.
pub struct AudioOutput {
    name: String,
    worker: Option<OutputWorker>,
}

impl AudioOutput {
    /// Open the output for an already normalized `config`, pulling audio from
    /// `mixer`.
    pub fn open(config: &DeviceConfig, mixer: Arc<Mixer>) -> Result<Self> {
        match config.backend.resolve() {
            Backend::Null => {
                debug!("Using null audio output");
                Ok(Self {
                    name: NULL_OUTPUT_NAME.to_string(),
                    worker: None,
                })
            }
            backend => Self::open_hardware(config.clone(), backend, mixer),
        }
    }

    fn open_hardware(config: DeviceConfig, backend: Backend, mixer: Arc<Mixer>) -> Result<Self> {
        let (ready_tx, ready_rx) = bounded::<Result<String>>(1);
        let (shutdown_tx, shutdown_rx) = bounded::<()>(1);

        let handle = std::thread::Builder::new()
            .name("audio-output".to_string())
            .spawn(move || match build_stream(&config, backend, mixer) {
                Ok((stream, name)) => {
                    let _ = ready_tx.send(Ok(name));
                    // Blocks until a shutdown message arrives or the sender is dropped.
                    let _ = shutdown_rx.recv();
                    drop(stream);
                    debug!("Audio output stream closed");
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            })
            .map_err(|e| Error::ThreadSpawn {
                name: "audio-output",
                reason: e.to_string(),
            })?;

        match ready_rx.recv() {
            Ok(Ok(name)) => {
                info!("Audio output started on {name} ({backend:?})");
                Ok(Self {
                    name,
                    worker: Some(OutputWorker {
                        shutdown_tx,
                        handle,
                    }),
                })
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                Err(e)
            }
            Err(_) => {
                let _ = handle.join();
                Err(Error::AudioOutput(
                    "output thread exited before the stream started".to_string(),
                ))
            }
        }
    }

    /// Name of the soundcard in use.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether this output drives real hardware.
    pub const fn is_hardware(&self) -> bool {
        self.worker.is_some()
    }
}

impl Drop for AudioOutput {
    fn drop(&mut self) {
        if let Some(worker) = self.worker.take() {
            let _ = worker.shutdown_tx.send(());
            if worker.handle.join().is_err() {
                error!("Audio output thread panicked");
            }
        }
    }
}

fn find_device(config: &DeviceConfig) -> Result<Device> {
    let host = cpal::default_host();
    match config.soundcard.as_ref().filter(|name| name.as_str() != FALLBACK_SOUNDCARD_NAME) {
        Some(wanted) => host
            .output_devices()
            .map_err(|e| Error::AudioOutput(format!("Failed to list devices: {e}")))?
            .find(|d| d.name().is_ok_and(|name| &name == wanted))
            .ok_or_else(|| Error::SoundcardNotFound(wanted.clone())),
        None => host
            .default_output_device()
            .ok_or_else(|| Error::AudioOutput("No output device found".to_string())),
    }
}

fn build_stream(
    config: &DeviceConfig,
    backend: Backend,
    mixer: Arc<Mixer>,
) -> Result<(Stream, String)> {
    let device = find_device(config)?;
    let name = device.name().unwrap_or_else(|_| "Unknown".to_string());

    let supported = device
        .default_output_config()
        .map_err(|e| Error::AudioOutput(format!("Failed to get output config: {e}")))?;
    let sample_format = supported.sample_format();

    #[allow(clippy::cast_possible_truncation)]
    let buffer_size = buffer_size(backend, config.buffer_frames() as u32, supported.buffer_size())?;
    #[allow(clippy::cast_possible_truncation)]
    let stream_config = StreamConfig {
        channels: CHANNELS as u16,
        sample_rate: cpal::SampleRate(config.sample_rate),
        buffer_size,
    };

    debug!(
        "Output config: {}Hz, {:?} buffer, {:?} samples",
        config.sample_rate, stream_config.buffer_size, sample_format
    );

    let stream = match sample_format {
        SampleFormat::F32 => build_typed::<f32>(&device, &stream_config, mixer)?,
        SampleFormat::I16 => build_typed::<i16>(&device, &stream_config, mixer)?,
        SampleFormat::U16 => build_typed::<u16>(&device, &stream_config, mixer)?,
        other => {
            return Err(Error::AudioOutput(format!(
                "Unsupported sample format: {other:?}"
            )));
        }
    };

    stream
        .play()
        .map_err(|e| Error::AudioOutput(format!("Failed to start stream: {e}")))?;

    Ok((stream, name))
}

/// Hardware buffer request for `backend`. Only the exclusive backend fails
/// when the device cannot run the configured size.
fn buffer_size(backend: Backend, frames: u32, supported: &SupportedBufferSize) -> Result<BufferSize> {
    match (backend, supported) {
        (Backend::Shared, _) => Ok(BufferSize::Default),
        (Backend::ExclusiveLowLatency, SupportedBufferSize::Range { min, max })
            if !(*min..=*max).contains(&frames) =>
        {
            Err(Error::UnavailableBackend(format!(
                "exclusive: device cannot run a {frames}-frame buffer ({min}..={max})"
            )))
        }
        (Backend::Native, SupportedBufferSize::Range { min, max }) => {
            Ok(BufferSize::Fixed(frames.clamp(*min, *max)))
        }
        _ => Ok(BufferSize::Fixed(frames)),
    }
}

fn build_typed<T: cpal::SizedSample + cpal::FromSample<i16>>(
    device: &Device,
    config: &StreamConfig,
    mixer: Arc<Mixer>,
) -> Result<Stream> {
    let mut adapter = BlockAdapter::new(mixer);
    let err_fn = |err| {
        error!("Audio stream error: {err}");
    };

    device
        .build_output_stream(
            config,
            move |data: &mut [T], _: &cpal::OutputCallbackInfo| adapter.fill(data),
            err_fn,
            None,
        )
        .map_err(|e| Error::AudioOutput(format!("Failed to build stream: {e}")))
}

/// Names of the soundcards reachable through `backend`.
///
/// Hardware backends always report at least one name; the null backend
/// reports none.
pub fn soundcard_names(backend: Backend) -> Vec<String> {
    if !backend.is_hardware() {
        return Vec::new();
    }

    let host = cpal::default_host();
    let mut names: Vec<String> = match host.output_devices() {
        Ok(devices) => devices.filter_map(|d| d.name().ok()).collect(),
        Err(e) => {
            debug!("Failed to list output devices: {e}");
            Vec::new()
        }
    };
    if names.is_empty() {
        names.push(FALLBACK_SOUNDCARD_NAME.to_string());
    }
    names
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mixer::VoiceTable;

    #[test]
    fn test_null_output_needs_no_hardware() {
        let config = DeviceConfig::headless(44100, 1024).normalized().unwrap();
        let mixer = Arc::new(Mixer::new(Arc::new(VoiceTable::new(4)), config.buffer_samples()));
        let output = AudioOutput::open(&config, mixer).unwrap();
        assert_eq!(output.name(), NULL_OUTPUT_NAME);
        assert!(!output.is_hardware());
    }

    #[test]
    fn test_backends_request_different_buffers() {
        let range = SupportedBufferSize::Range { min: 64, max: 512 };
        let unknown = SupportedBufferSize::Unknown;

        assert_eq!(buffer_size(Backend::Shared, 256, &range).unwrap(), BufferSize::Default);
        assert_eq!(buffer_size(Backend::Shared, 256, &unknown).unwrap(), BufferSize::Default);

        assert_eq!(buffer_size(Backend::Native, 256, &range).unwrap(), BufferSize::Fixed(256));
        assert_eq!(buffer_size(Backend::Native, 2048, &range).unwrap(), BufferSize::Fixed(512));
        assert_eq!(buffer_size(Backend::Native, 2048, &unknown).unwrap(), BufferSize::Fixed(2048));

        assert_eq!(
            buffer_size(Backend::ExclusiveLowLatency, 256, &range).unwrap(),
            BufferSize::Fixed(256)
        );
        assert!(matches!(
            buffer_size(Backend::ExclusiveLowLatency, 2048, &range),
            Err(Error::UnavailableBackend(_))
        ));
        assert_eq!(
            buffer_size(Backend::ExclusiveLowLatency, 2048, &unknown).unwrap(),
            BufferSize::Fixed(2048)
        );
    }

    #[test]
    fn test_null_backend_lists_no_soundcards() {
        assert!(soundcard_names(Backend::Null).is_empty());
    }

    #[test]
    fn test_list_devices() {
        // May see no devices on CI; must still report a name and not panic.
        assert!(!soundcard_names(Backend::Default).is_empty());
    }

    #[test]
    fn test_adapter_rechunks_callback_sizes() {
        use crate::mixer::Voice;
        use carillon_core::SoundId;

        let table = Arc::new(VoiceTable::new(1));
        let voice: &Voice = table.get(0).unwrap();
        voice.occupy(SoundId::new(1).unwrap(), 1.0, 0.0, 4);
        let ring = voice.ring().unwrap();
        for value in [10i16, 20] {
            let slot = ring.writable_slot().unwrap();
            ring.write_block(slot, &[value; 4]);
            ring.publish(slot);
        }
        table.set_active(1);

        let mut adapter = BlockAdapter::new(Arc::new(Mixer::new(table, 4)));
        let mut first = [0i16; 3];
        let mut second = [0i16; 6];
        adapter.fill(&mut first);
        adapter.fill(&mut second);
        assert_eq!(first, [10, 10, 10]);
        assert_eq!(second, [10, 20, 20, 20, 20, 0]);
    }
}
