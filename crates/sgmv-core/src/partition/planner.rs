//! Divisor-aligned chunking of index ranges.
//!
//! Whole blocks of `divisor` elements are dealt to the chunks as evenly as
//! possible; the first `blocks % chunks` chunks take one extra block and the
//! last chunk absorbs the `total % divisor` leftover elements. Every chunk
//! except the last therefore has a size divisible by the divisor and starts
//! on a divisor boundary.

use crate::types::ChunkDescriptor;

use super::PartitionError;

/// Cuts ranges into chunks whose sizes are multiples of a divisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkPlanner {
    divisor: usize,
}

impl ChunkPlanner {
    pub fn new(divisor: usize) -> Result<Self, PartitionError> {
        if divisor == 0 {
            return Err(PartitionError::ZeroDivisor);
        }
        Ok(Self { divisor })
    }

    pub fn divisor(&self) -> usize {
        self.divisor
    }

    /// Split `[0, total)` into `num_chunks` chunks.
    pub fn plan(&self, total: usize, num_chunks: usize) -> Result<Vec<ChunkDescriptor>, PartitionError> {
        self.plan_range(0, total, num_chunks)
    }

    /// Split `[start, end)` into `num_chunks` chunks.
    pub fn plan_range(
        &self,
        start: usize,
        end: usize,
        num_chunks: usize,
    ) -> Result<Vec<ChunkDescriptor>, PartitionError> {
        if num_chunks == 0 {
            return Err(PartitionError::ZeroChunks);
        }
        if start > end {
            return Err(PartitionError::InvalidRange { start, end });
        }
        Ok((0..num_chunks)
            .map(|i| self.chunk_at(start, end, num_chunks, i))
            .collect())
    }

    /// The `index`-th of `parts` chunks of `[start, end)`.
    pub fn segment(
        &self,
        start: usize,
        end: usize,
        parts: usize,
        index: usize,
    ) -> Result<ChunkDescriptor, PartitionError> {
        if parts == 0 {
            return Err(PartitionError::ZeroChunks);
        }
        if index >= parts {
            return Err(PartitionError::SegmentIndex { index, parts });
        }
        if start > end {
            return Err(PartitionError::InvalidRange { start, end });
        }
        Ok(self.chunk_at(start, end, parts, index))
    }

    /// Split across `ranks` first, then each rank's range into
    /// `chunks_per_rank` sub-chunks.
    pub fn plan_nested(
        &self,
        total: usize,
        ranks: usize,
        chunks_per_rank: usize,
    ) -> Result<NestedPlan, PartitionError> {
        let rank_ranges = self.plan(total, ranks)?;
        let mut chunks = Vec::with_capacity(ranks * chunks_per_rank);
        for r in &rank_ranges {
            chunks.extend(self.plan_range(r.offset, r.end(), chunks_per_rank)?);
        }
        Ok(NestedPlan {
            total,
            rank_ranges,
            chunks,
            chunks_per_rank,
        })
    }

    fn chunk_at(&self, start: usize, end: usize, parts: usize, index: usize) -> ChunkDescriptor {
        let d = self.divisor;
        let total = end - start;
        let blocks = total / d;
        let base = blocks / parts;
        let extra = blocks % parts;

        let offset_blocks = index * base + index.min(extra);
        let mut size = (base + usize::from(index < extra)) * d;
        if index == parts - 1 {
            size += total % d;
        }
        ChunkDescriptor::new(start + offset_blocks * d, size)
    }
}

/// Split `[0, total)` into `num_chunks` chunks aligned to `divisor`.
pub fn plan(total: usize, num_chunks: usize, divisor: usize) -> Result<Vec<ChunkDescriptor>, PartitionError> {
    ChunkPlanner::new(divisor)?.plan(total, num_chunks)
}

/// Two-level plan: one range per rank, each cut into the same number of
/// chunks. Chunk `c` belongs to rank `c / chunks_per_rank`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestedPlan {
    total: usize,
    rank_ranges: Vec<ChunkDescriptor>,
    chunks: Vec<ChunkDescriptor>,
    chunks_per_rank: usize,
}

impl NestedPlan {
    pub fn total(&self) -> usize {
        self.total
    }

    pub fn num_ranks(&self) -> usize {
        self.rank_ranges.len()
    }

    pub fn chunks_per_rank(&self) -> usize {
        self.chunks_per_rank
    }

    /// Contiguous range owned by `rank`.
    pub fn rank_range(&self, rank: usize) -> ChunkDescriptor {
        self.rank_ranges[rank]
    }

    /// Sub-chunks of `rank`'s range, in order.
    pub fn rank_chunks(&self, rank: usize) -> &[ChunkDescriptor] {
        let first = rank * self.chunks_per_rank;
        &self.chunks[first..first + self.chunks_per_rank]
    }

    /// Flat list of all chunks, rank by rank.
    pub fn chunks(&self) -> &[ChunkDescriptor] {
        &self.chunks
    }

    pub fn owner(&self, chunk: usize) -> usize {
        chunk / self.chunks_per_rank
    }

    /// Global indices and descriptors of the non-empty chunks `rank` owns.
    pub fn owned(&self, rank: usize) -> impl Iterator<Item = (usize, ChunkDescriptor)> + '_ {
        let first = rank * self.chunks_per_rank;
        self.rank_chunks(rank)
            .iter()
            .enumerate()
            .map(move |(k, c)| (first + k, *c))
            .filter(|(_, c)| !c.is_empty())
    }

    /// Global indices and descriptors of the non-empty chunks `rank` does
    /// not own.
    pub fn foreign(&self, rank: usize) -> impl Iterator<Item = (usize, ChunkDescriptor)> + '_ {
        self.chunks
            .iter()
            .enumerate()
            .filter(move |(idx, c)| self.owner(*idx) != rank && !c.is_empty())
            .map(|(idx, c)| (idx, *c))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sizes(chunks: &[ChunkDescriptor]) -> Vec<usize> {
        chunks.iter().map(|c| c.size).collect()
    }

    fn assert_exact_cover(chunks: &[ChunkDescriptor], start: usize, end: usize) {
        let mut cursor = start;
        for c in chunks {
            assert_eq!(c.offset, cursor, "gap or overlap at {cursor}");
            cursor = c.end();
        }
        assert_eq!(cursor, end);
    }

    #[test]
    fn last_chunk_absorbs_remainder() {
        let chunks = plan(37, 4, 8).unwrap();
        assert_eq!(sizes(&chunks), vec![8, 8, 8, 13]);
        assert_exact_cover(&chunks, 0, 37);
    }

    #[test]
    fn extra_blocks_go_to_leading_chunks() {
        // 10 blocks of 4 over 3 chunks → 4, 3, 3 blocks.
        let chunks = plan(42, 3, 4).unwrap();
        assert_eq!(sizes(&chunks), vec![16, 12, 14]);
        assert_exact_cover(&chunks, 0, 42);
    }

    #[test]
    fn more_chunks_than_blocks() {
        let chunks = plan(10, 4, 8).unwrap();
        assert_eq!(sizes(&chunks), vec![8, 0, 0, 2]);
        assert_exact_cover(&chunks, 0, 10);
    }

    #[test]
    fn covers_every_combination() {
        for total in 0..70 {
            for parts in 1..6 {
                for divisor in 1..9 {
                    let chunks = plan(total, parts, divisor).unwrap();
                    assert_eq!(chunks.len(), parts);
                    assert_exact_cover(&chunks, 0, total);
                    for c in &chunks[..parts - 1] {
                        assert_eq!(c.size % divisor, 0);
                        assert_eq!(c.offset % divisor, 0);
                    }
                }
            }
        }
    }

    #[test]
    fn zero_arguments_are_rejected() {
        assert_eq!(plan(10, 2, 0).unwrap_err(), PartitionError::ZeroDivisor);
        assert_eq!(plan(10, 0, 2).unwrap_err(), PartitionError::ZeroChunks);
        let p = ChunkPlanner::new(2).unwrap();
        assert!(matches!(
            p.segment(0, 10, 2, 2),
            Err(PartitionError::SegmentIndex { index: 2, parts: 2 })
        ));
    }

    #[test]
    fn segment_matches_plan_range() {
        let p = ChunkPlanner::new(4).unwrap();
        let chunks = p.plan_range(16, 59, 3).unwrap();
        for (i, c) in chunks.iter().enumerate() {
            assert_eq!(p.segment(16, 59, 3, i).unwrap(), *c);
        }
        assert_exact_cover(&chunks, 16, 59);
    }

    #[test]
    fn nested_plan_ownership() {
        let nested = ChunkPlanner::new(8).unwrap().plan_nested(100, 3, 2).unwrap();
        assert_eq!(nested.num_ranks(), 3);
        assert_eq!(nested.chunks().len(), 6);
        assert_exact_cover(nested.chunks(), 0, 100);

        for r in 0..3 {
            let range = nested.rank_range(r);
            assert_exact_cover(nested.rank_chunks(r), range.offset, range.end());
            for (idx, _) in nested.owned(r) {
                assert_eq!(nested.owner(idx), r);
            }
        }
        // 12 blocks → 4 per rank → 2 per chunk; the last chunk takes the 4 leftovers.
        assert_eq!(nested.rank_range(2), ChunkDescriptor::new(64, 36));
        assert_eq!(nested.rank_chunks(2)[1], ChunkDescriptor::new(80, 20));

        let foreign: Vec<usize> = nested.foreign(1).map(|(idx, _)| idx).collect();
        assert_eq!(foreign, vec![0, 1, 4, 5]);
    }
}
