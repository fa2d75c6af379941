//! Core types shared across the engine.
//!
//! Index ranges, CPU/accelerator splits, timing feedback and the rank
//! topology.

use std::ops::Range;

use serde::Serialize;
use sgmv_compute::Communicator;

pub use sgmv_compute::patched_size;

/// A contiguous sub-range `[offset, offset + size)` of a vector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize)]
pub struct ChunkDescriptor {
    pub offset: usize,
    pub size: usize,
}

impl ChunkDescriptor {
    pub fn new(offset: usize, size: usize) -> Self {
        Self { offset, size }
    }

    /// One past the last index.
    pub fn end(&self) -> usize {
        self.offset + self.size
    }

    pub fn range(&self) -> Range<usize> {
        self.offset..self.end()
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }
}

/// Split of a problem between the CPU (partition 1) and the accelerator
/// (partition 2).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Partition {
    pub size_local: usize,
    pub size_accel: usize,
}

impl Partition {
    pub fn total(&self) -> usize {
        self.size_local + self.size_accel
    }
}

/// Wall-clock seconds spent on each partition.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct TimingSample {
    pub t_local: f64,
    pub t_accel: f64,
}

impl TimingSample {
    pub fn new(t_local: f64, t_accel: f64) -> Self {
        Self { t_local, t_accel }
    }

    pub fn accumulate(&mut self, other: TimingSample) {
        self.t_local += other.t_local;
        self.t_accel += other.t_accel;
    }

    /// Return the accumulated sample and reset it to zero.
    pub fn take(&mut self) -> TimingSample {
        std::mem::take(self)
    }
}

/// Position of this rank in the world.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Topology {
    pub rank: usize,
    pub size: usize,
}

impl Topology {
    pub fn of(comm: &dyn Communicator) -> Self {
        Self {
            rank: comm.rank(),
            size: comm.size(),
        }
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_ranges() {
        let c = ChunkDescriptor::new(8, 5);
        assert_eq!(c.end(), 13);
        assert_eq!(c.range(), 8..13);
        assert!(!c.is_empty());
        assert!(ChunkDescriptor::new(3, 0).is_empty());
    }

    #[test]
    fn timing_take_resets() {
        let mut acc = TimingSample::default();
        acc.accumulate(TimingSample::new(1.0, 2.0));
        acc.accumulate(TimingSample::new(0.5, 0.5));
        assert_eq!(acc.take(), TimingSample::new(1.5, 2.5));
        assert_eq!(acc, TimingSample::default());
    }
}
