use log::warn;

use super::{clip, BlockScheduler, IdentityScheduler};
use crate::common::{GemmCoord, ProblemShape};
use crate::select::Swizzle;
use crate::tiling::TileShape;
use crate::utils::ceil_div;

/// Splits K into `splitk` slices and schedules every (slice, output block) pair as its own loop.
///
/// Loop indices `s * mn_loops .. (s + 1) * mn_loops` cover slice `s` in swizzled block order.
/// The K tiles are dealt as evenly as possible, the first `k_tiles % splitk` slices taking one
/// extra tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitkScheduler {
    inner: IdentityScheduler,
    problem: ProblemShape,
    splitk: u32,
    k_tiles: u32,
}

impl SplitkScheduler {
    pub fn new(problem: ProblemShape, tile: TileShape, swizzle: Swizzle, splitk: u32) -> Self {
        let k_tiles = ceil_div(problem.k(), tile.k);
        let clamped = splitk.clamp(1, k_tiles);
        if clamped != splitk {
            warn!("Split-K factor {splitk} clamped to {clamped} for {k_tiles} K tiles");
        }
        SplitkScheduler {
            inner: IdentityScheduler::new(problem, tile, swizzle),
            problem,
            splitk: clamped,
            k_tiles,
        }
    }

    pub fn splitk(&self) -> u32 {
        self.splitk
    }

    pub fn mn_loops(&self) -> u32 {
        self.inner.core_loops()
    }

    /// The slice a loop index belongs to.
    pub fn slice_idx(&self, loop_idx: u32) -> u32 {
        loop_idx / self.mn_loops()
    }

    /// First K tile and tile count of a slice.
    pub fn slice_k_tiles(&self, slice: u32) -> (u32, u32) {
        let base = self.k_tiles / self.splitk;
        let rem = self.k_tiles % self.splitk;
        let start = slice * base + slice.min(rem);
        let count = base + u32::from(slice < rem);
        (start, count)
    }

    fn slice_of_k_start(&self, k_start: u32) -> u32 {
        let base = self.k_tiles / self.splitk;
        let rem = self.k_tiles % self.splitk;
        let long_span = rem * (base + 1);
        if k_start < long_span {
            k_start / (base + 1)
        } else {
            rem + (k_start - long_span) / base
        }
    }
}

impl BlockScheduler for SplitkScheduler {
    fn core_loops(&self) -> u32 {
        self.mn_loops() * self.splitk
    }

    fn block_coord(&self, loop_idx: u32) -> GemmCoord {
        let slice = self.slice_idx(loop_idx);
        let (m, n) = self.inner.mn_coord(loop_idx % self.mn_loops());
        let (k_start, _) = self.slice_k_tiles(slice);
        GemmCoord::new(m, n, k_start)
    }

    fn actual_block_shape(&self, coord: GemmCoord) -> GemmCoord {
        let tile = self.inner.tile();
        let (_, count) = self.slice_k_tiles(self.slice_of_k_start(coord.k));
        let k_elems = clip(self.problem.k(), tile.k, coord.k)
            + (1..count)
                .map(|i| clip(self.problem.k(), tile.k, coord.k + i))
                .sum::<u32>();
        GemmCoord::new(
            clip(self.problem.m(), tile.m, coord.m),
            clip(self.problem.n(), tile.n, coord.n),
            k_elems,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{assert_partitions, problem_and_tile, swizzle};
    use crate::select::SwizzleDirection;
    use nonzero::nonzero as nz;
    use proptest::prelude::*;

    #[test]
    fn test_remainder_tiles_go_to_first_slices() {
        // 10 K tiles over 4 slices: 3, 3, 2, 2.
        let problem = ProblemShape::new(32, 32, 160).unwrap();
        let s = SplitkScheduler::new(
            problem,
            TileShape::new(16, 16, 16),
            Swizzle::new(nz!(1u32), SwizzleDirection::Zn),
            4,
        );
        assert_eq!(s.core_loops(), 4 * 4);
        let slices = (0..4).map(|i| s.slice_k_tiles(i)).collect::<Vec<_>>();
        assert_eq!(slices, vec![(0, 3), (3, 3), (6, 2), (8, 2)]);
        let c = s.block_coord(3 * 4 + 1);
        assert_eq!(c.k, 8);
        assert_eq!(s.actual_block_shape(c).k, 32);
    }

    #[test]
    fn test_factor_clamped_to_k_tiles() {
        let problem = ProblemShape::new(16, 16, 40).unwrap();
        let s = SplitkScheduler::new(
            problem,
            TileShape::new(16, 16, 16),
            Swizzle::new(nz!(3u32), SwizzleDirection::Zn),
            8,
        );
        assert_eq!(s.splitk(), 3);
        // The last slice holds the ragged 8-element tile.
        assert_eq!(s.actual_block_shape(s.block_coord(2)), GemmCoord::new(16, 16, 8));
    }

    proptest! {
        #[test]
        fn test_splitk_partitions_problem(
            (problem, tile) in problem_and_tile(),
            sw in swizzle(),
            splitk in 1u32..=12,
        ) {
            let s = SplitkScheduler::new(problem, tile, sw, splitk);
            prop_assert_eq!(s.core_loops(), s.mn_loops() * s.splitk());
            assert_partitions(&s, &problem, &tile)?;
        }
    }
}
