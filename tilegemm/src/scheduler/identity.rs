use log::trace;

use super::{clip, loops_per_dim, BlockScheduler};
use crate::common::{GemmCoord, ProblemShape};
use crate::select::{Swizzle, SwizzleDirection};
use crate::tiling::TileShape;

/// Visits every output block once, in swizzled order, with the full K extent.
///
/// With [SwizzleDirection::Zn] the blocks are cut into bands of `offset` block-rows; each band is
/// walked column by column, top to bottom within a column, and odd bands are walked right to
/// left so consecutive blocks share B tiles across the band boundary. [SwizzleDirection::Nz] is
/// the transpose.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityScheduler {
    problem: ProblemShape,
    tile: TileShape,
    swizzle: Swizzle,
    loops: GemmCoord,
}

impl IdentityScheduler {
    pub fn new(problem: ProblemShape, tile: TileShape, swizzle: Swizzle) -> Self {
        IdentityScheduler {
            problem,
            tile,
            swizzle,
            loops: loops_per_dim(&problem, &tile),
        }
    }

    pub fn tile(&self) -> TileShape {
        self.tile
    }

    /// Blocks along M and N.
    pub fn mn_loops(&self) -> (u32, u32) {
        (self.loops.m, self.loops.n)
    }

    /// Swizzled (m, n) block index for a flat index in `0..m_loops * n_loops`.
    pub(crate) fn mn_coord(&self, idx: u32) -> (u32, u32) {
        let (m_loops, n_loops) = (u64::from(self.loops.m), u64::from(self.loops.n));
        let offset = u64::from(self.swizzle.offset());
        let idx = u64::from(idx);
        let (m_idx, n_idx) = match self.swizzle.direction {
            SwizzleDirection::Zn => {
                let band_size = offset * n_loops;
                let band = idx / band_size;
                let in_band = idx % band_size;
                let band_rows = offset.min(m_loops - band * offset);
                let m_idx = band * offset + in_band % band_rows;
                let mut n_idx = in_band / band_rows;
                if band % 2 == 1 {
                    n_idx = n_loops - n_idx - 1;
                }
                (m_idx, n_idx)
            }
            SwizzleDirection::Nz => {
                let band_size = offset * m_loops;
                let band = idx / band_size;
                let in_band = idx % band_size;
                let band_cols = offset.min(n_loops - band * offset);
                let mut m_idx = in_band / band_cols;
                let n_idx = band * offset + in_band % band_cols;
                if band % 2 == 1 {
                    m_idx = m_loops - m_idx - 1;
                }
                (m_idx, n_idx)
            }
        };
        trace!("block {idx} -> ({m_idx}, {n_idx})");
        // Both are below their loop counts, which are u32.
        (m_idx as u32, n_idx as u32)
    }
}

impl BlockScheduler for IdentityScheduler {
    fn core_loops(&self) -> u32 {
        self.loops.m * self.loops.n
    }

    fn block_coord(&self, loop_idx: u32) -> GemmCoord {
        let (m, n) = self.mn_coord(loop_idx);
        GemmCoord::new(m, n, 0)
    }

    fn actual_block_shape(&self, coord: GemmCoord) -> GemmCoord {
        GemmCoord::new(
            clip(self.problem.m(), self.tile.m, coord.m),
            clip(self.problem.n(), self.tile.n, coord.n),
            self.problem.k(),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::tests::{assert_partitions, problem_and_tile, swizzle};
    use itertools::Itertools;
    use nonzero::nonzero as nz;
    use proptest::prelude::*;
    use std::num::NonZeroU32;

    #[test]
    fn test_zn_walks_bands_in_serpentine_order() {
        // 4 x 3 blocks, bands of 2 block-rows.
        let problem = ProblemShape::new(64, 48, 16).unwrap();
        let s = IdentityScheduler::new(
            problem,
            TileShape::new(16, 16, 16),
            Swizzle::new(nz!(2u32), SwizzleDirection::Zn),
        );
        let order = (0..s.core_loops())
            .map(|i| {
                let c = s.block_coord(i);
                (c.m, c.n)
            })
            .collect_vec();
        assert_eq!(
            order,
            vec![
                (0, 0),
                (1, 0),
                (0, 1),
                (1, 1),
                (0, 2),
                (1, 2),
                (2, 2),
                (3, 2),
                (2, 1),
                (3, 1),
                (2, 0),
                (3, 0),
            ]
        );
    }

    #[test]
    fn test_nz_short_last_band() {
        // 2 x 5 blocks, bands of 3 block-columns; the second band is 2 wide.
        let problem = ProblemShape::new(32, 80, 16).unwrap();
        let s = IdentityScheduler::new(
            problem,
            TileShape::new(16, 16, 16),
            Swizzle::new(nz!(3u32), SwizzleDirection::Nz),
        );
        let order = (0..s.core_loops())
            .map(|i| {
                let c = s.block_coord(i);
                (c.m, c.n)
            })
            .collect_vec();
        assert_eq!(
            order,
            vec![
                (0, 0),
                (0, 1),
                (0, 2),
                (1, 0),
                (1, 1),
                (1, 2),
                (1, 3),
                (1, 4),
                (0, 3),
                (0, 4),
            ]
        );
    }

    #[test]
    fn test_last_block_shape_is_remainder() {
        let problem = ProblemShape::new(300, 200, 50).unwrap();
        let tile = TileShape::new(128, 64, 32);
        let s = IdentityScheduler::new(problem, tile, Swizzle::for_problem(&problem));
        let last = s.actual_block_shape(GemmCoord::new(2, 3, 0));
        assert_eq!(last, GemmCoord::new(300 - 2 * 128, 200 - 3 * 64, 50));
    }

    #[test]
    fn test_offset_wider_than_problem_is_one_band() {
        let problem = ProblemShape::new(64, 48, 16).unwrap();
        let tile = TileShape::new(16, 16, 16);
        for direction in [SwizzleDirection::Zn, SwizzleDirection::Nz] {
            let wide = IdentityScheduler::new(problem, tile, Swizzle::new(NonZeroU32::MAX, direction));
            let exact = IdentityScheduler::new(problem, tile, Swizzle::new(nz!(4u32), direction));
            for i in 0..wide.core_loops() {
                assert_eq!(wide.block_coord(i), exact.block_coord(i));
            }
        }
    }

    proptest! {
        #[test]
        fn test_identity_partitions_problem((problem, tile) in problem_and_tile(), sw in swizzle()) {
            let s = IdentityScheduler::new(problem, tile, sw);
            assert_partitions(&s, &problem, &tile)?;
        }
    }
}
