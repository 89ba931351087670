//! Buffers shared between the decode side and the mixer.

pub mod ring;
pub mod staging;

pub use ring::{PlaybackRing, ReadSlot, NOTHING_YET, RING_BLOCKS};
pub use staging::StagingBuffer;
