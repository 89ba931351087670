//! An open audio device: sound table, decode thread and output.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use carillon_core::{normalize_path, DeviceConfig, DeviceId, Error, Result, SoundId, Vfs};
use parking_lot::Mutex;
use tracing::{debug, error, info, trace};

use crate::mixer::{Mixer, VoiceTable};
use crate::output::AudioOutput;
use crate::sound::{BlockOutcome, Sound};

/// Most sounds a device plays at once.
pub const MAX_PLAYING_SOUNDS: usize = 256;

/// Shortest idle sleep of the decode thread.
const MIN_IDLE_SLEEP: Duration = Duration::from_millis(5);

/// Sounds that failed to decode, remembered after their slot is recycled.
pub type FailedSounds = Arc<Mutex<HashSet<(DeviceId, SoundId)>>>;

/// Decode-side table. Entry `i` drives voice `i`.
struct SoundTable {
    sounds: Vec<Option<Sound>>,
    next_id: u64,
    /// One block of scratch space for the decode pass.
    scratch: Vec<i16>,
}

impl SoundTable {
    fn allocate_id(&mut self) -> SoundId {
        loop {
            self.next_id = self.next_id.wrapping_add(1);
            if let Some(id) = SoundId::new(self.next_id) {
                return id;
            }
        }
    }

    fn position(&self, id: SoundId) -> Option<usize> {
        self.sounds
            .iter()
            .position(|entry| entry.as_ref().is_some_and(|sound| sound.id() == id))
    }
}

/// State shared between the device handle and its decode thread.
struct DeviceShared {
    id: DeviceId,
    config: DeviceConfig,
    vfs: Arc<dyn Vfs>,
    voices: Arc<VoiceTable>,
    table: Mutex<SoundTable>,
    failed: FailedSounds,
    stop: AtomicBool,
}

impl DeviceShared {
    /// Give every sound with room in its ring one more block. Returns whether
    /// anything happened.
    fn decode_pass(&self) -> bool {
        let mut table = self.table.lock();
        let SoundTable {
            sounds, scratch, ..
        } = &mut *table;
        let mut progressed = false;

        for (index, entry) in sounds.iter_mut().enumerate() {
            let (Some(sound), Some(voice)) = (entry.as_mut(), self.voices.get(index)) else {
                continue;
            };
            if voice.is_completed() {
                continue;
            }
            let Some(ring) = voice.ring() else {
                continue;
            };

            if sound.is_exhausted() {
                if ring.is_drained() {
                    debug!("sound {} finished", sound.id());
                    voice.set_completed();
                    progressed = true;
                }
                continue;
            }

            let Some(slot) = ring.writable_slot() else {
                continue;
            };
            match sound.obtain_block(scratch) {
                BlockOutcome::Filled => {
                    ring.write_block(slot, scratch);
                    ring.publish(slot);
                    trace!("sound {}: block {slot} ready", sound.id());
                }
                BlockOutcome::Exhausted => {}
                BlockOutcome::Failed => {
                    ring.write_block(slot, &[]);
                    ring.publish(slot);
                    voice.set_completed();
                    self.failed.lock().insert((self.id, sound.id()));
                }
            }
            progressed = true;
        }
        progressed
    }

    fn idle_sleep(&self) -> Duration {
        let block = Duration::from_secs_f64(
            self.config.buffer_frames() as f64 / f64::from(self.config.sample_rate),
        );
        (block / 2).max(MIN_IDLE_SLEEP)
    }

    fn run_decode_thread(&self) {
        info!("Decode thread for device {} started", self.id);
        let idle = self.idle_sleep();
        while !self.stop.load(Ordering::Acquire) {
            if !self.decode_pass() {
                std::thread::sleep(idle);
            }
        }
        debug!("Decode thread for device {} stopped", self.id);
    }
}

/// An open audio device.
pub struct Device {
    shared: Arc<DeviceShared>,
    mixer: Arc<Mixer>,
    output: Option<AudioOutput>,
    decode_thread: Option<JoinHandle<()>>,
    destroyed: bool,
}

impl Device {
    /// Open a device. Validates the config, sets up the sound table, starts
    /// the output and finally the decode thread. Anything already started is
    /// torn down again if a later step fails.
    pub fn open(
        id: DeviceId,
        config: &DeviceConfig,
        vfs: Arc<dyn Vfs>,
        failed: FailedSounds,
    ) -> Result<Self> {
        let config = config.normalized()?;
        let block_samples = config.buffer_samples();

        let voices = Arc::new(VoiceTable::new(MAX_PLAYING_SOUNDS));
        let mixer = Arc::new(Mixer::new(Arc::clone(&voices), block_samples));
        let shared = Arc::new(DeviceShared {
            id,
            config: config.clone(),
            vfs,
            voices,
            table: Mutex::new(SoundTable {
                sounds: Vec::new(),
                next_id: 0,
                scratch: vec![0; block_samples],
            }),
            failed,
            stop: AtomicBool::new(false),
        });

        let output = AudioOutput::open(&config, Arc::clone(&mixer))?;

        let decode_thread = if config.decode_thread {
            let worker = Arc::clone(&shared);
            let handle = std::thread::Builder::new()
                .name(format!("audio-decode-{id}"))
                .spawn(move || worker.run_decode_thread())
                .map_err(|e| Error::ThreadSpawn {
                    name: "audio-decode",
                    reason: e.to_string(),
                })?;
            Some(handle)
        } else {
            None
        };

        info!(
            "Opened audio device {id}: {} Hz, {} byte buffer, output {}",
            config.sample_rate,
            config.buffer_bytes,
            output.name()
        );

        Ok(Self {
            shared,
            mixer,
            output: Some(output),
            decode_thread,
            destroyed: false,
        })
    }

    pub fn id(&self) -> DeviceId {
        self.shared.id
    }

    /// The normalized configuration the device runs with.
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    /// Name of the output in use.
    pub fn name(&self) -> &str {
        self.output.as_ref().map_or("", AudioOutput::name)
    }

    /// The mixer. Hosts of a null-backend device pull blocks from it.
    pub fn mixer(&self) -> &Arc<Mixer> {
        &self.mixer
    }

    /// Start playing a file. Volume is clamped to `0..=1` and panning to
    /// `-1..=1`; NaN for either is rejected.
    pub fn play_sound_from_file(
        &self,
        path: &str,
        volume: f64,
        panning: f64,
        looping: bool,
    ) -> Result<SoundId> {
        if self.destroyed {
            return Err(Error::DeviceClosed);
        }
        if volume.is_nan() || panning.is_nan() {
            return Err(Error::InvalidArgument(format!(
                "volume {volume} and panning {panning} must be numbers"
            )));
        }
        let path = normalize_path(path);
        if !self.shared.vfs.exists(&path) {
            return Err(Error::FileNotFound(path));
        }

        let mut table = self.shared.table.lock();
        let voices = &self.shared.voices;
        let reusable = table.sounds.iter().enumerate().position(|(index, entry)| {
            entry.is_none() || voices.get(index).is_some_and(|voice| voice.is_completed())
        });
        let index = match reusable {
            Some(index) => index,
            None if table.sounds.len() < voices.capacity() => {
                table.sounds.push(None);
                table.sounds.len() - 1
            }
            None => return Err(Error::SoundTableFull(voices.capacity())),
        };
        let Some(voice) = voices.get(index) else {
            return Err(Error::Internal(format!("no voice for slot {index}")));
        };

        let id = table.allocate_id();
        voice.release();
        table.sounds[index] = Some(Sound::new(
            id,
            path.clone(),
            looping,
            Arc::clone(&self.shared.vfs),
            self.shared.config.sample_rate,
        ));
        voice.occupy(id, volume, panning, self.shared.config.buffer_samples());
        voices.set_active(table.sounds.len());

        debug!(
            "Playing {path} as sound {id} in slot {index} (volume {volume}, panning {panning}, loop {looping})"
        );
        Ok(id)
    }

    /// Stop a sound. Unknown or finished sounds are ignored.
    pub fn stop_sound(&self, id: SoundId) {
        let table = self.shared.table.lock();
        if let Some(index) = table.position(id) {
            if let Some(voice) = self.shared.voices.get(index) {
                if !voice.is_completed() {
                    trace!("Stopping sound {id}");
                    voice.set_completed();
                }
            }
        }
    }

    /// Set volume and panning together.
    pub fn change_volume(&self, id: SoundId, volume: f64, panning: f64) {
        if let Some(voice) = self.shared.voices.find(id) {
            voice.set_volume(volume);
            voice.set_panning(panning);
        }
    }

    /// Set volume, keeping panning.
    pub fn set_volume(&self, id: SoundId, volume: f64) {
        if let Some(voice) = self.shared.voices.find(id) {
            voice.set_volume(volume);
        }
    }

    /// Set panning, keeping volume.
    pub fn set_panning(&self, id: SoundId, panning: f64) {
        if let Some(voice) = self.shared.voices.find(id) {
            voice.set_panning(panning);
        }
    }

    /// Current `(volume, panning)` of a sound still in the table.
    pub fn get_volume(&self, id: SoundId) -> Option<(f64, f64)> {
        self.shared
            .voices
            .find(id)
            .map(|voice| (voice.volume(), voice.panning()))
    }

    /// Whether a sound is still playing (or waiting for its first block).
    pub fn is_playing(&self, id: SoundId) -> bool {
        let table = self.shared.table.lock();
        table
            .position(id)
            .and_then(|index| self.shared.voices.get(index))
            .is_some_and(|voice| voice.sound_id() == Some(id) && !voice.is_completed())
    }

    /// Whether a sound stopped because it could not be decoded.
    pub fn had_playback_error(&self, id: SoundId) -> bool {
        if self.shared.failed.lock().contains(&(self.shared.id, id)) {
            return true;
        }
        let table = self.shared.table.lock();
        table
            .position(id)
            .and_then(|index| table.sounds[index].as_ref())
            .is_some_and(Sound::has_failed)
    }

    /// Output frames per source frame for a sound, once its file has been
    /// opened.
    pub fn resample_ratio(&self, id: SoundId) -> Option<f64> {
        let table = self.shared.table.lock();
        table
            .position(id)
            .and_then(|index| table.sounds[index].as_ref())
            .and_then(Sound::resample_ratio)
    }

    /// Sound table slots in use, including finished sounds not yet recycled.
    pub fn table_len(&self) -> usize {
        self.shared.table.lock().sounds.len()
    }

    /// Run one decode pass on the calling thread. For devices opened without
    /// a decode thread. Returns whether any sound made progress.
    pub fn pump(&self) -> bool {
        if self.destroyed {
            return false;
        }
        self.shared.decode_pass()
    }

    /// Stop the decode thread, then the output, then drop every sound.
    /// Calling it again does nothing.
    pub fn destroy(&mut self) {
        if self.destroyed {
            return;
        }
        self.destroyed = true;

        self.shared.stop.store(true, Ordering::Release);
        if let Some(handle) = self.decode_thread.take() {
            if handle.join().is_err() {
                error!("Decode thread of device {} panicked", self.shared.id);
            }
        }

        drop(self.output.take());

        let mut table = self.shared.table.lock();
        for (index, entry) in table.sounds.iter_mut().enumerate() {
            if entry.take().is_some() {
                if let Some(voice) = self.shared.voices.get(index) {
                    voice.release();
                }
            }
        }
        table.sounds.clear();
        self.shared.voices.set_active(0);
        self.shared
            .failed
            .lock()
            .retain(|&(device, _)| device != self.shared.id);

        info!("Closed audio device {}", self.shared.id);
    }

    pub const fn is_destroyed(&self) -> bool {
        self.destroyed
    }
}

impl Drop for Device {
    fn drop(&mut self) {
        self.destroy();
    }
}
