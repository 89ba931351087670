//! Linear decode-ahead buffer.
//!
//! Decoders append interleaved samples at the end, the block producer takes
//! them from the front. Consumed samples are shifted out so the filled part
//! always starts at index 0.

/// Fixed-capacity buffer of interleaved `i16` samples.
#[derive(Debug, Clone, Default)]
pub struct StagingBuffer {
    data: Vec<i16>,
    fill: usize,
}

impl StagingBuffer {
    /// Create an empty buffer holding up to `capacity` samples.
    pub fn new(capacity: usize) -> Self {
        Self {
            data: vec![0; capacity],
            fill: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Samples currently buffered.
    pub const fn len(&self) -> usize {
        self.fill
    }

    pub const fn is_empty(&self) -> bool {
        self.fill == 0
    }

    /// Room left, in samples.
    pub fn free(&self) -> usize {
        self.data.len() - self.fill
    }

    /// Grow the buffer to at least `capacity` samples. Never shrinks.
    pub fn ensure_capacity(&mut self, capacity: usize) {
        if self.data.len() < capacity {
            self.data.resize(capacity, 0);
        }
    }

    /// The buffered samples.
    pub fn filled(&self) -> &[i16] {
        &self.data[..self.fill]
    }

    /// Unused tail the caller may write into before calling [`Self::commit`].
    pub fn spare_mut(&mut self) -> &mut [i16] {
        &mut self.data[self.fill..]
    }

    /// Mark `count` samples of the spare tail as filled.
    pub fn commit(&mut self, count: usize) {
        self.fill = (self.fill + count).min(self.data.len());
    }

    /// Append as much of `samples` as fits. Returns how many were taken.
    pub fn push_slice(&mut self, samples: &[i16]) -> usize {
        let count = samples.len().min(self.free());
        self.data[self.fill..self.fill + count].copy_from_slice(&samples[..count]);
        self.fill += count;
        count
    }

    /// Drop `count` samples from the front.
    pub fn consume(&mut self, count: usize) {
        let count = count.min(self.fill);
        self.data.copy_within(count..self.fill, 0);
        self.fill -= count;
    }

    pub fn clear(&mut self) {
        self.fill = 0;
    }
}
