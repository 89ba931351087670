//! Real-time mixer.
//!
//! Runs on the hardware callback thread. It takes no locks, never allocates
//! and never touches a file: every voice it reads is a fixed slot of atomics
//! written by the control and decode threads.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use carillon_core::{SoundId, CHANNELS};
use tracing::error;

use crate::buffer::{PlaybackRing, ReadSlot};

/// Voices quieter than this are skipped.
pub const VOLUME_EPSILON: f64 = 0.0001;

/// Largest magnitude a mixed sample may reach.
pub const CLIP_LIMIT: f64 = 32767.0;

/// The part of a sound the mixer can see.
///
/// Play parameters are stored as `f64` bit patterns in atomics, so a control
/// thread writing a new volume never tears a value the mixer is reading.
pub struct Voice {
    id: AtomicU64,
    volume: AtomicU64,
    panning: AtomicU64,
    completed: AtomicBool,
    ring: OnceLock<PlaybackRing>,
}

impl Voice {
    fn new() -> Self {
        Self {
            id: AtomicU64::new(0),
            volume: AtomicU64::new(0f64.to_bits()),
            panning: AtomicU64::new(0f64.to_bits()),
            completed: AtomicBool::new(false),
            ring: OnceLock::new(),
        }
    }

    /// The sound currently in this slot.
    pub fn sound_id(&self) -> Option<SoundId> {
        SoundId::new(self.id.load(Ordering::Acquire))
    }

    pub fn volume(&self) -> f64 {
        f64::from_bits(self.volume.load(Ordering::Relaxed))
    }

    pub fn panning(&self) -> f64 {
        f64::from_bits(self.panning.load(Ordering::Relaxed))
    }

    /// Clamp and store. NaN keeps the current value.
    pub fn set_volume(&self, volume: f64) {
        if !volume.is_nan() {
            self.volume
                .store(volume.clamp(0.0, 1.0).to_bits(), Ordering::Relaxed);
        }
    }

    /// Clamp and store. NaN keeps the current value.
    pub fn set_panning(&self, panning: f64) {
        if !panning.is_nan() {
            self.panning
                .store(panning.clamp(-1.0, 1.0).to_bits(), Ordering::Relaxed);
        }
    }

    pub fn is_completed(&self) -> bool {
        self.completed.load(Ordering::Acquire)
    }

    pub fn set_completed(&self) {
        self.completed.store(true, Ordering::Release);
    }

    /// The playback ring, once the slot has been used.
    pub fn ring(&self) -> Option<&PlaybackRing> {
        self.ring.get()
    }

    /// Put a new sound in this slot. Caller holds the sound table lock.
    pub(crate) fn occupy(&self, id: SoundId, volume: f64, panning: f64, block_samples: usize) {
        self.id.store(0, Ordering::Release);
        self.ring
            .get_or_init(|| PlaybackRing::new(block_samples))
            .reset();
        self.set_volume(volume);
        self.set_panning(panning);
        self.completed.store(false, Ordering::Release);
        self.id.store(id.get(), Ordering::Release);
    }

    /// Empty this slot. Caller holds the sound table lock.
    pub(crate) fn release(&self) {
        self.id.store(0, Ordering::Release);
        self.completed.store(false, Ordering::Release);
    }
}

/// Per-channel gains for a voice.
///
/// Panning towards one side attenuates only the opposite channel; neither
/// gain ever exceeds `volume`.
pub fn pan_gains(volume: f64, panning: f64) -> (f64, f64) {
    let left = volume * (1.0 - (-panning).max(0.0));
    let right = volume * (1.0 - panning.max(0.0));
    (left, right)
}

/// Add `sample * gain` to `acc`, clamped to the 16-bit range.
#[allow(clippy::cast_possible_truncation)]
fn mix_sample(acc: i16, sample: i16, gain: f64) -> i16 {
    (f64::from(acc) + f64::from(sample) * gain).clamp(-CLIP_LIMIT, CLIP_LIMIT) as i16
}

/// Fixed set of voice slots shared by the control, decode and mixer sides.
pub struct VoiceTable {
    voices: Box<[Voice]>,
    /// Slots `0..active` may be occupied.
    active: AtomicUsize,
}

impl VoiceTable {
    pub fn new(capacity: usize) -> Self {
        Self {
            voices: (0..capacity).map(|_| Voice::new()).collect(),
            active: AtomicUsize::new(0),
        }
    }

    pub fn capacity(&self) -> usize {
        self.voices.len()
    }

    pub fn get(&self, index: usize) -> Option<&Voice> {
        self.voices.get(index)
    }

    /// Slots that may currently be occupied.
    pub fn active(&self) -> &[Voice] {
        let active = self.active.load(Ordering::Acquire).min(self.voices.len());
        &self.voices[..active]
    }

    pub(crate) fn set_active(&self, active: usize) {
        self.active
            .store(active.min(self.voices.len()), Ordering::Release);
    }

    /// Find the voice playing `id`.
    pub fn find(&self, id: SoundId) -> Option<&Voice> {
        self.active()
            .iter()
            .find(|voice| voice.sound_id() == Some(id))
    }
}

/// Mixes every ready voice into one output block.
pub struct Mixer {
    voices: Arc<VoiceTable>,
    block_samples: usize,
    mismatch_reported: AtomicBool,
}

impl Mixer {
    pub fn new(voices: Arc<VoiceTable>, block_samples: usize) -> Self {
        Self {
            voices,
            block_samples,
            mismatch_reported: AtomicBool::new(false),
        }
    }

    /// Interleaved samples per block.
    pub const fn block_samples(&self) -> usize {
        self.block_samples
    }

    /// Fill `out` with the next block. `out` must be exactly one block long;
    /// anything else is a configuration error and produces silence.
    pub fn mix(&self, out: &mut [i16]) {
        out.fill(0);
        if out.len() != self.block_samples {
            if !self.mismatch_reported.swap(true, Ordering::Relaxed) {
                error!(
                    "mixer asked for {} samples, configured block is {}; output silenced",
                    out.len(),
                    self.block_samples
                );
            }
            return;
        }

        for voice in self.voices.active() {
            if voice.sound_id().is_none() || voice.is_completed() {
                continue;
            }
            let volume = voice.volume();
            if volume <= VOLUME_EPSILON {
                continue;
            }
            let Some(ring) = voice.ring() else {
                continue;
            };
            if ring.is_empty() {
                continue;
            }
            let Some(read) = ring.readable_slot() else {
                continue;
            };
            mix_block(out, ring, read, pan_gains(volume, voice.panning()));
        }
    }
}

/// Take `read` from `ring` and add it to `out`. Returns `false` without
/// touching `out` when the slot was recycled after the lookup.
///
/// Once consumed, the producer cannot refill the block until the consumer
/// takes the next one, so summing after the consume is safe.
fn mix_block(out: &mut [i16], ring: &PlaybackRing, read: ReadSlot, gains: (f64, f64)) -> bool {
    if !ring.consume(read) {
        return false;
    }
    let (left, right) = gains;
    for (frame, source) in out
        .chunks_exact_mut(CHANNELS)
        .zip(ring.block(read.slot).chunks_exact(CHANNELS))
    {
        frame[0] = mix_sample(frame[0], source[0].load(Ordering::Relaxed), left);
        frame[1] = mix_sample(frame[1], source[1].load(Ordering::Relaxed), right);
    }
    true
}
