use log::debug;

use super::{clip, round_robin_loops, BlockScheduler, IdentityScheduler};
use crate::common::{GemmCoord, ProblemShape};
use crate::select::Swizzle;
use crate::tiling::TileShape;
use crate::utils::{ceil_div, ceil_div_u64};

/// Consecutive K tiles of one stream-K block, computed by one core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamkPiece {
    pub core: u32,
    /// Index among the stream-K blocks, which follow the normal blocks in swizzled order.
    pub block: u32,
    /// The block's coordinate with `k` set to the piece's first K tile.
    pub coord: GemmCoord,
    pub k_tiles: u32,
    /// Workspace tile holding the partial sum: `2 * core` for the core's first piece and
    /// `2 * core + 1` for the piece it starts in the following block.
    pub slot: u32,
}

/// Runs the output blocks that fill whole waves of cores as usual and spreads the K tiles of
/// the `blocks % core_num` leftover blocks evenly over every core.
///
/// The leftover K tiles are laid end to end, block after block, and each core takes one
/// contiguous run of `ceil(tiles / core_num)`. A run is never longer than a block, so it
/// touches at most two blocks. A core's pieces come first in its local loop order, then its
/// round-robin share of the normal blocks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamkScheduler {
    inner: IdentityScheduler,
    problem: ProblemShape,
    core_num: u32,
    k_tiles: u32,
    normal_blocks: u32,
    streamk_blocks: u32,
    /// K tiles of stream-K work per core.
    per_core: u64,
    pieces: Vec<StreamkPiece>,
    /// `pieces[first_piece[c]..first_piece[c + 1]]` belong to core `c`.
    first_piece: Vec<usize>,
}

impl StreamkScheduler {
    pub fn new(problem: ProblemShape, tile: TileShape, swizzle: Swizzle, core_num: u32) -> Self {
        let core_num = core_num.max(1);
        let inner = IdentityScheduler::new(problem, tile, swizzle);
        let blocks = inner.core_loops();
        let k_tiles = ceil_div(problem.k(), tile.k);
        let streamk_blocks = blocks % core_num;
        let normal_blocks = blocks - streamk_blocks;
        let k_tiles_64 = u64::from(k_tiles);
        let total = u64::from(streamk_blocks) * k_tiles_64;
        let per_core = ceil_div_u64(total, core_num.into());

        let mut pieces = Vec::new();
        let mut first_piece = Vec::with_capacity(core_num as usize + 1);
        for core in 0..core_num {
            first_piece.push(pieces.len());
            let mut start = (u64::from(core) * per_core).min(total);
            let end = (start + per_core).min(total);
            let mut slot = 2 * core;
            while start < end {
                let block = (start / k_tiles_64) as u32;
                let k_start = (start % k_tiles_64) as u32;
                let len = (k_tiles_64 - u64::from(k_start)).min(end - start);
                let (m, n) = inner.mn_coord(normal_blocks + block);
                pieces.push(StreamkPiece {
                    core,
                    block,
                    coord: GemmCoord::new(m, n, k_start),
                    k_tiles: len as u32,
                    slot,
                });
                slot += 1;
                start += len;
            }
        }
        first_piece.push(pieces.len());
        debug!(
            "Stream-K: {normal_blocks} normal and {streamk_blocks} split blocks, {per_core} K tiles \
             per core, {} pieces",
            pieces.len()
        );
        StreamkScheduler {
            inner,
            problem,
            core_num,
            k_tiles,
            normal_blocks,
            streamk_blocks,
            per_core,
            pieces,
            first_piece,
        }
    }

    pub fn core_num(&self) -> u32 {
        self.core_num
    }

    pub fn k_tiles(&self) -> u32 {
        self.k_tiles
    }

    pub fn normal_blocks(&self) -> u32 {
        self.normal_blocks
    }

    pub fn streamk_blocks(&self) -> u32 {
        self.streamk_blocks
    }

    pub fn pieces(&self) -> &[StreamkPiece] {
        &self.pieces
    }

    pub fn core_pieces(&self, core: u32) -> &[StreamkPiece] {
        let c = core as usize;
        match (self.first_piece.get(c), self.first_piece.get(c + 1)) {
            (Some(&lo), Some(&hi)) => &self.pieces[lo..hi],
            _ => &[],
        }
    }

    /// The pieces of stream-K block `block`, in core order.
    pub fn contributors(&self, block: u32) -> impl Iterator<Item = &StreamkPiece> + '_ {
        self.pieces.iter().filter(move |p| p.block == block)
    }

    /// The core whose run holds the first K tile of stream-K block `block`.
    pub fn core_idx(&self, block: u32) -> u32 {
        if self.per_core == 0 {
            return 0;
        }
        (u64::from(block) * u64::from(self.k_tiles) / self.per_core) as u32
    }

    /// Whether stream-K block `block` starts partway through a core's run, so that core's
    /// share of it sits in its second workspace slot.
    pub fn is_cross(&self, block: u32) -> bool {
        self.per_core != 0 && u64::from(block) * u64::from(self.k_tiles) % self.per_core != 0
    }

    /// Coordinate and full shape of stream-K block `block`.
    pub fn streamk_block(&self, block: u32) -> (GemmCoord, GemmCoord) {
        let coord = self.inner.block_coord(self.normal_blocks + block);
        (coord, self.inner.actual_block_shape(coord))
    }

    /// K elements covered by `count` tiles starting at tile `k_start`.
    fn k_elems(&self, k_start: u32, count: u32) -> u32 {
        let tile_k = u64::from(self.inner.tile().k);
        let remaining = u64::from(self.problem.k()).saturating_sub(u64::from(k_start) * tile_k);
        // Bounded by K.
        (u64::from(count) * tile_k).min(remaining) as u32
    }
}

impl BlockScheduler for StreamkScheduler {
    fn core_loops(&self) -> u32 {
        self.normal_blocks + self.pieces.len() as u32
    }

    fn block_coord(&self, loop_idx: u32) -> GemmCoord {
        if loop_idx < self.normal_blocks {
            return self.inner.block_coord(loop_idx);
        }
        match self.pieces.get((loop_idx - self.normal_blocks) as usize) {
            Some(piece) => piece.coord,
            // Past the end: a coordinate whose clipped shape is empty.
            None => GemmCoord::new(self.inner.mn_loops().0, 0, 0),
        }
    }

    fn actual_block_shape(&self, coord: GemmCoord) -> GemmCoord {
        let tile = self.inner.tile();
        let k = match self.pieces.iter().find(|p| p.coord == coord) {
            Some(piece) => self.k_elems(piece.coord.k, piece.k_tiles),
            None => self.problem.k(),
        };
        GemmCoord::new(
            clip(self.problem.m(), tile.m, coord.m),
            clip(self.problem.n(), tile.n, coord.n),
            k,
        )
    }

    /// The core's pieces plus its share of normal blocks. Pieces are tied to the core count the
    /// scheduler was built for; other counts deal every loop round robin.
    fn single_core_loops(&self, core_idx: u32, core_num: u32) -> u32 {
        if core_num != self.core_num {
            return round_robin_loops(self.core_loops(), core_idx, core_num);
        }
        if core_idx >= core_num {
            return 0;
        }
        self.core_pieces(core_idx).len() as u32 + self.normal_blocks / core_num
    }

    fn core_block_coord(&self, core_idx: u32, core_num: u32, local: u32) -> GemmCoord {
        if core_num != self.core_num {
            return self.block_coord(core_idx + local * core_num);
        }
        let own = self.core_pieces(core_idx);
        match own.get(local as usize) {
            Some(piece) => piece.coord,
            None => self.block_coord(core_idx + (local - own.len() as u32) * core_num),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{assert_partitions, problem_and_tile, swizzle};
    use crate::select::SwizzleDirection;
    use nonzero::nonzero as nz;
    use proptest::prelude::*;
    use std::collections::HashSet;

    fn five_blocks_on_three_cores() -> StreamkScheduler {
        // 5 x 1 blocks of 16 x 16, 10 K tiles.
        let problem = ProblemShape::new(80, 16, 160).unwrap();
        StreamkScheduler::new(
            problem,
            TileShape::new(16, 16, 16),
            Swizzle::new(nz!(3u32), SwizzleDirection::Zn),
            3,
        )
    }

    #[test]
    fn test_leftover_blocks_split_along_k() {
        let s = five_blocks_on_three_cores();
        assert_eq!((s.normal_blocks(), s.streamk_blocks()), (3, 2));
        // 20 leftover K tiles over 3 cores: runs of 7, 7 and 6.
        let runs = s
            .pieces()
            .iter()
            .map(|p| (p.core, p.block, p.coord.k, p.k_tiles, p.slot))
            .collect::<Vec<_>>();
        assert_eq!(
            runs,
            vec![(0, 0, 0, 7, 0), (1, 0, 7, 3, 2), (1, 1, 0, 4, 3), (2, 1, 4, 6, 4)]
        );
        assert_eq!(s.core_loops(), 3 + 4);
        assert_eq!(s.single_core_loops(1, 3), 2 + 1);
    }

    #[test]
    fn test_cross_blocks_and_core_indices() {
        let s = five_blocks_on_three_cores();
        assert!(!s.is_cross(0));
        assert!(s.is_cross(1));
        assert_eq!((s.core_idx(0), s.core_idx(1), s.core_idx(2)), (0, 1, 2));
        let slots = s.contributors(1).map(|p| p.slot).collect::<Vec<_>>();
        assert_eq!(slots, vec![3, 4]);
    }

    #[test]
    fn test_whole_waves_have_no_pieces() {
        let problem = ProblemShape::new(64, 48, 300).unwrap();
        let s = StreamkScheduler::new(
            problem,
            TileShape::new(16, 16, 64),
            Swizzle::for_problem(&problem),
            6,
        );
        assert_eq!((s.normal_blocks(), s.streamk_blocks()), (12, 0));
        assert!(s.pieces().is_empty());
        assert_eq!(s.actual_block_shape(s.block_coord(0)).k, 300);
    }

    #[test]
    fn test_last_piece_clips_k() {
        // 1 x 3 blocks, K = 100 in tiles of 32: the fourth tile holds 4 elements.
        let problem = ProblemShape::new(16, 48, 100).unwrap();
        let s = StreamkScheduler::new(
            problem,
            TileShape::new(16, 16, 32),
            Swizzle::for_problem(&problem),
            2,
        );
        assert_eq!(s.streamk_blocks(), 1);
        let ks = s
            .pieces()
            .iter()
            .map(|p| s.actual_block_shape(p.coord).k)
            .collect::<Vec<_>>();
        assert_eq!(ks, vec![64, 36]);
    }

    proptest! {
        #[test]
        fn test_streamk_partitions_problem(
            (problem, tile) in problem_and_tile(),
            sw in swizzle(),
            core_num in 1u32..=10,
        ) {
            let s = StreamkScheduler::new(problem, tile, sw, core_num);
            assert_partitions(&s, &problem, &tile)?;
        }

        #[test]
        fn test_streamk_core_views_cover_all_loops(
            (problem, tile) in problem_and_tile(),
            sw in swizzle(),
            core_num in 1u32..=10,
            other in 1u32..=10,
        ) {
            let s = StreamkScheduler::new(problem, tile, sw, core_num);
            for view in [core_num, other] {
                let mut seen = HashSet::new();
                for core in 0..view {
                    for local in 0..s.single_core_loops(core, view) {
                        prop_assert!(seen.insert(s.core_block_coord(core, view, local)));
                    }
                }
                prop_assert_eq!(seen.len() as u32, s.core_loops());
            }
        }

        #[test]
        fn test_pieces_are_balanced_and_slotted(
            (problem, tile) in problem_and_tile(),
            sw in swizzle(),
            core_num in 1u32..=10,
        ) {
            let s = StreamkScheduler::new(problem, tile, sw, core_num);
            for core in 0..core_num {
                let own = s.core_pieces(core);
                prop_assert!(own.len() <= 2);
                let run: u64 = own.iter().map(|p| u64::from(p.k_tiles)).sum();
                prop_assert!(run <= s.per_core);
                for (i, p) in own.iter().enumerate() {
                    prop_assert_eq!(p.slot, 2 * core + i as u32);
                }
            }
            for block in 0..s.streamk_blocks() {
                let first = s.contributors(block).next();
                prop_assert!(first.is_some());
                if let Some(first) = first {
                    prop_assert_eq!(first.core, s.core_idx(block));
                    prop_assert_eq!(first.slot % 2 == 1, s.is_cross(block));
                }
            }
        }
    }
}
