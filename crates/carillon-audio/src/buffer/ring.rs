//! Per-sound playback ring.
//!
//! A fixed number of equally sized blocks, filled one block at a time by the
//! decode thread and consumed one block at a time by the hardware callback.
//! The two cursors are single-writer: only the decode thread stores
//! `fill_index`, only the mixer advances `play_index`. That makes the hand-off a
//! single-producer, single-consumer queue with no lock on the real-time side.

#![allow(clippy::unwrap_used)] // Tests use unwrap for brevity

use std::sync::atomic::{AtomicI16, AtomicI32, AtomicU64, Ordering};

/// Number of blocks in every playback ring.
pub const RING_BLOCKS: usize = 10;

/// Cursor value meaning "nothing written / consumed yet".
pub const NOTHING_YET: i32 = -1;

/// A block handed to the consumer, remembered with the cursor it was found at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadSlot {
    pub slot: usize,
    seen: u64,
}

/// Circular array of pre-sized audio blocks.
///
/// `fill_index` is the last block the producer finished writing and
/// `play_index` the last block the consumer took. At most
/// `RING_BLOCKS - 1` blocks are ever ready, so a full ring is never mistaken
/// for an empty one.
pub struct PlaybackRing {
    /// Block storage, `RING_BLOCKS * block_samples` interleaved samples.
    samples: Box<[AtomicI16]>,
    /// Interleaved samples per block.
    block_samples: usize,
    /// Last block written by the producer.
    fill_index: AtomicI32,
    /// Last block consumed by the consumer in the low half, reset
    /// generation in the high half.
    play_cursor: AtomicU64,
}

#[allow(clippy::cast_sign_loss)]
const fn pack_cursor(generation: u32, index: i32) -> u64 {
    ((generation as u64) << 32) | (index as u32 as u64)
}

#[allow(clippy::cast_possible_truncation)]
const fn cursor_index(cursor: u64) -> i32 {
    cursor as u32 as i32
}

#[allow(clippy::cast_possible_truncation)]
const fn cursor_generation(cursor: u64) -> u32 {
    (cursor >> 32) as u32
}

impl PlaybackRing {
    /// Create a ring of [`RING_BLOCKS`] blocks of `block_samples` samples each.
    pub fn new(block_samples: usize) -> Self {
        let samples = (0..RING_BLOCKS * block_samples)
            .map(|_| AtomicI16::new(0))
            .collect();
        Self {
            samples,
            block_samples,
            fill_index: AtomicI32::new(NOTHING_YET),
            play_cursor: AtomicU64::new(pack_cursor(0, NOTHING_YET)),
        }
    }

    /// Interleaved samples per block.
    pub const fn block_samples(&self) -> usize {
        self.block_samples
    }

    /// Whether the ring has any storage at all.
    pub const fn is_empty(&self) -> bool {
        self.block_samples == 0
    }

    /// Last block written, or [`NOTHING_YET`].
    pub fn fill_index(&self) -> i32 {
        self.fill_index.load(Ordering::Acquire)
    }

    /// Last block consumed, or [`NOTHING_YET`].
    pub fn play_index(&self) -> i32 {
        cursor_index(self.play_cursor.load(Ordering::Acquire))
    }

    /// Map a cursor to a slot. The sentinel behaves like the slot just before 0.
    const fn slot_of(index: i32) -> usize {
        if index < 0 {
            RING_BLOCKS - 1
        } else {
            index as usize % RING_BLOCKS
        }
    }

    /// Number of blocks written but not yet consumed.
    pub fn ready_blocks(&self) -> usize {
        let fill = Self::slot_of(self.fill_index());
        let play = Self::slot_of(self.play_index());
        (fill + RING_BLOCKS - play) % RING_BLOCKS
    }

    /// Whether every written block has been consumed.
    pub fn is_drained(&self) -> bool {
        self.ready_blocks() == 0
    }

    /// Producer side: the slot the next block goes into, or `None` when the
    /// ring is full.
    pub fn writable_slot(&self) -> Option<usize> {
        if self.is_empty() {
            return None;
        }
        let fill = Self::slot_of(self.fill_index.load(Ordering::Relaxed));
        let play = Self::slot_of(self.play_index());
        let next = (fill + 1) % RING_BLOCKS;
        (next != play).then_some(next)
    }

    /// Producer side: copy `block` into `slot`. Short input is zero-padded.
    pub fn write_block(&self, slot: usize, block: &[i16]) {
        let start = slot * self.block_samples;
        let target = &self.samples[start..start + self.block_samples];
        for (i, cell) in target.iter().enumerate() {
            cell.store(block.get(i).copied().unwrap_or(0), Ordering::Relaxed);
        }
    }

    /// Producer side: make `slot` visible to the consumer.
    pub fn publish(&self, slot: usize) {
        self.fill_index.store(slot as i32, Ordering::Release);
    }

    /// Consumer side: the next ready block, or `None` if nothing new is ready.
    ///
    /// The play cursor is loaded before `fill_index`. A reset landing between
    /// the two loads then leaves `seen` on the old generation and the later
    /// [`consume`](Self::consume) fails instead of moving the new cursor past
    /// the new fill index.
    pub fn readable_slot(&self) -> Option<ReadSlot> {
        let seen = self.play_cursor.load(Ordering::Acquire);
        let fill = self.fill_index.load(Ordering::Acquire);
        self.slot_after(seen, fill)
    }

    /// The block following cursor `seen`, given fill index `fill`.
    fn slot_after(&self, seen: u64, fill: i32) -> Option<ReadSlot> {
        if fill == NOTHING_YET || self.is_empty() {
            return None;
        }
        let play = Self::slot_of(cursor_index(seen));
        if play == Self::slot_of(fill) {
            return None;
        }
        Some(ReadSlot {
            slot: (play + 1) % RING_BLOCKS,
            seen,
        })
    }

    /// Consumer side: the samples of `slot`.
    pub fn block(&self, slot: usize) -> &[AtomicI16] {
        let start = slot * self.block_samples;
        &self.samples[start..start + self.block_samples]
    }

    /// Consumer side: mark a block as consumed. Does nothing if the ring was
    /// reset since the block was looked up.
    pub fn consume(&self, read: ReadSlot) -> bool {
        let next = pack_cursor(cursor_generation(read.seen), read.slot as i32);
        self.play_cursor
            .compare_exchange(
                read.seen,
                next,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// Forget all cursors. Must not race with the producer; a consumer still
    /// holding a [`ReadSlot`] from before the reset can no longer move the
    /// play cursor.
    pub fn reset(&self) {
        self.fill_index.store(NOTHING_YET, Ordering::Release);
        let generation = cursor_generation(self.play_cursor.load(Ordering::Acquire));
        self.play_cursor.store(
            pack_cursor(generation.wrapping_add(1), NOTHING_YET),
            Ordering::Release,
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::sync::Arc;

    fn read_block(ring: &PlaybackRing) -> Option<Vec<i16>> {
        let read = ring.readable_slot()?;
        let block = ring
            .block(read.slot)
            .iter()
            .map(|s| s.load(Ordering::Relaxed))
            .collect();
        assert!(ring.consume(read));
        Some(block)
    }

    fn write_value(ring: &PlaybackRing, value: i16) -> bool {
        let Some(slot) = ring.writable_slot() else {
            return false;
        };
        ring.write_block(slot, &vec![value; ring.block_samples()]);
        ring.publish(slot);
        true
    }

    #[test]
    fn test_starts_empty() {
        let ring = PlaybackRing::new(8);
        assert_eq!(ring.fill_index(), NOTHING_YET);
        assert_eq!(ring.play_index(), NOTHING_YET);
        assert!(ring.is_drained());
        assert!(ring.readable_slot().is_none());
        assert_eq!(ring.writable_slot(), Some(0));
    }

    #[test]
    fn test_fills_up_to_one_less_than_capacity() {
        let ring = PlaybackRing::new(4);
        let mut written = 0;
        while write_value(&ring, 1) {
            written += 1;
        }
        assert_eq!(written, RING_BLOCKS - 1);
        assert_eq!(ring.ready_blocks(), RING_BLOCKS - 1);

        // Consuming one block frees exactly one slot.
        assert!(read_block(&ring).is_some());
        assert!(write_value(&ring, 2));
        assert!(!write_value(&ring, 3));
    }

    #[test]
    fn test_blocks_come_out_in_order() {
        let ring = PlaybackRing::new(2);
        for round in 0..3 {
            for v in 0..5i16 {
                assert!(write_value(&ring, round * 10 + v));
            }
            for v in 0..5i16 {
                assert_eq!(read_block(&ring).unwrap(), vec![round * 10 + v; 2]);
            }
            assert!(read_block(&ring).is_none());
        }
    }

    #[test]
    fn test_short_block_is_zero_padded() {
        let ring = PlaybackRing::new(4);
        let slot = ring.writable_slot().unwrap();
        ring.write_block(slot, &[7, 7]);
        ring.publish(slot);
        assert_eq!(read_block(&ring).unwrap(), vec![7, 7, 0, 0]);
    }

    #[test]
    fn test_reset_forgets_cursors() {
        let ring = PlaybackRing::new(2);
        write_value(&ring, 1);
        write_value(&ring, 2);
        read_block(&ring);
        ring.reset();
        assert!(ring.is_drained());
        assert!(ring.readable_slot().is_none());
        assert_eq!(ring.writable_slot(), Some(0));
    }

    #[test]
    fn test_stale_consume_after_reset_is_ignored() {
        let ring = PlaybackRing::new(2);
        write_value(&ring, 1);
        write_value(&ring, 2);
        let read = ring.readable_slot().unwrap();
        ring.reset();
        assert!(!ring.consume(read));
        assert_eq!(ring.play_index(), NOTHING_YET);

        write_value(&ring, 3);
        assert_eq!(read_block(&ring).unwrap(), vec![3, 3]);
    }

    #[test]
    fn test_reset_between_cursor_and_fill_loads_does_not_wedge() {
        let ring = PlaybackRing::new(2);
        for v in 1..=5 {
            write_value(&ring, v);
        }

        // Consumer loads the cursor, then the sound is recycled before it
        // loads the fill index.
        let seen = ring.play_cursor.load(Ordering::Acquire);
        ring.reset();
        let fill = ring.fill_index.load(Ordering::Acquire);
        assert!(ring.slot_after(seen, fill).is_none());

        // Reset lands after both loads: the slot is found but cannot be
        // consumed.
        write_value(&ring, 7);
        let seen = ring.play_cursor.load(Ordering::Acquire);
        let fill = ring.fill_index.load(Ordering::Acquire);
        ring.reset();
        let stale = ring.slot_after(seen, fill).unwrap();
        assert!(!ring.consume(stale));
        assert_eq!(ring.play_index(), NOTHING_YET);

        // The ring still cycles through every slot after the reset.
        for round in 0..3i16 {
            for v in 0..(RING_BLOCKS as i16 - 1) {
                assert!(write_value(&ring, round * 100 + v));
            }
            assert!(!write_value(&ring, -1));
            for v in 0..(RING_BLOCKS as i16 - 1) {
                assert_eq!(read_block(&ring).unwrap(), vec![round * 100 + v; 2]);
            }
            assert!(read_block(&ring).is_none());
        }
    }

    #[test]
    fn test_zero_sized_ring_never_yields_slots() {
        let ring = PlaybackRing::new(0);
        assert!(ring.is_empty());
        assert!(ring.writable_slot().is_none());
        assert!(ring.readable_slot().is_none());
    }

    #[test]
    fn test_concurrent_access() {
        use std::thread;

        let ring = Arc::new(PlaybackRing::new(64));
        let producer = Arc::clone(&ring);
        let consumer = ring;

        let writer = thread::spawn(move || {
            let mut next = 0i16;
            while next < 500 {
                if write_value(&producer, next) {
                    next += 1;
                } else {
                    thread::yield_now();
                }
            }
        });

        let reader = thread::spawn(move || {
            let mut expected = 0i16;
            while expected < 500 {
                match read_block(&consumer) {
                    Some(block) => {
                        assert!(block.iter().all(|&s| s == expected));
                        expected += 1;
                    }
                    None => thread::yield_now(),
                }
            }
            expected
        });

        writer.join().unwrap();
        assert_eq!(reader.join().unwrap(), 500);
    }

    proptest! {
        #[test]
        fn prop_fill_stays_within_reach_of_play(ops in proptest::collection::vec(any::<bool>(), 0..200)) {
            let ring = PlaybackRing::new(1);
            let mut written = 0i16;
            let mut read = 0i16;
            for produce in ops {
                if produce {
                    if write_value(&ring, written) {
                        written += 1;
                    }
                } else if let Some(block) = read_block(&ring) {
                    prop_assert_eq!(block[0], read);
                    read += 1;
                }
                prop_assert!(ring.ready_blocks() < RING_BLOCKS);
                prop_assert_eq!(ring.ready_blocks(), (written - read) as usize);
            }
        }
    }
}
