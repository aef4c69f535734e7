use super::{clip, BlockScheduler, IdentityScheduler};
use crate::common::{GemmCoord, ProblemShape};
use crate::select::Swizzle;
use crate::tiling::TileShape;
use crate::utils::ceil_div;

/// Schedules (output block, K tile) pairs, keeping every K tile of a block on the same core.
///
/// Output blocks are dealt to cores round robin. A core then walks its blocks in order and, for
/// each block, every K tile in turn, so consecutive loops on a core usually share the A or B tile.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SingleCoreSplitkScheduler {
    inner: IdentityScheduler,
    problem: ProblemShape,
    k_tiles: u32,
}

impl SingleCoreSplitkScheduler {
    pub fn new(problem: ProblemShape, tile: TileShape, swizzle: Swizzle) -> Self {
        SingleCoreSplitkScheduler {
            inner: IdentityScheduler::new(problem, tile, swizzle),
            problem,
            k_tiles: ceil_div(problem.k(), tile.k),
        }
    }

    pub fn k_tiles(&self) -> u32 {
        self.k_tiles
    }

    fn coord_of(&self, mn_idx: u32, k_idx: u32) -> GemmCoord {
        let (m, n) = self.inner.mn_coord(mn_idx);
        GemmCoord::new(m, n, k_idx)
    }
}

impl BlockScheduler for SingleCoreSplitkScheduler {
    fn core_loops(&self) -> u32 {
        self.inner.core_loops() * self.k_tiles
    }

    fn block_coord(&self, loop_idx: u32) -> GemmCoord {
        self.coord_of(loop_idx / self.k_tiles, loop_idx % self.k_tiles)
    }

    fn actual_block_shape(&self, coord: GemmCoord) -> GemmCoord {
        let tile = self.inner.tile();
        GemmCoord::new(
            clip(self.problem.m(), tile.m, coord.m),
            clip(self.problem.n(), tile.n, coord.n),
            clip(self.problem.k(), tile.k, coord.k),
        )
    }

    fn single_core_loops(&self, core_idx: u32, core_num: u32) -> u32 {
        let blocks = self.inner.core_loops();
        if core_idx >= blocks {
            0
        } else {
            ceil_div(blocks - core_idx, core_num) * self.k_tiles
        }
    }

    fn core_block_coord(&self, core_idx: u32, core_num: u32, local: u32) -> GemmCoord {
        let block = core_idx + (local / self.k_tiles) * core_num;
        self.coord_of(block, local % self.k_tiles)
    }
}

/// Whether the next loop must load a new A tile and a new B tile.
///
/// A changes when the block row or the K tile changes; B when the block column or the K tile
/// does. With no next loop, nothing is loaded.
pub fn need_load_next(current: GemmCoord, next: Option<GemmCoord>) -> (bool, bool) {
    match next {
        None => (false, false),
        Some(next) => {
            let k_changed = current.k != next.k;
            (k_changed || current.m != next.m, k_changed || current.n != next.n)
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

    #[test]
    fn test_need_load_next_flags() {
        let cur = GemmCoord::new(1, 2, 3);
        assert_eq!(need_load_next(cur, None), (false, false));
        assert_eq!(need_load_next(cur, Some(GemmCoord::new(1, 5, 3))), (false, true));
        assert_eq!(need_load_next(cur, Some(GemmCoord::new(0, 2, 3))), (true, false));
        assert_eq!(need_load_next(cur, Some(GemmCoord::new(1, 2, 4))), (true, true));
    }

    #[test]
    fn test_core_walks_k_tiles_of_its_block() {
        let problem = ProblemShape::new(64, 64, 64).unwrap();
        let s = SingleCoreSplitkScheduler::new(
            problem,
            TileShape::new(32, 32, 16),
            Swizzle::new(nz!(3u32), SwizzleDirection::Zn),
        );
        assert_eq!(s.k_tiles(), 4);
        // 4 blocks on 3 cores: core 0 owns blocks 0 and 3.
        assert_eq!(s.single_core_loops(0, 3), 8);
        assert_eq!(s.single_core_loops(2, 3), 4);
        let c = s.core_block_coord(0, 3, 5);
        assert_eq!(c.k, 1);
        assert_eq!((c.m, c.n), {
            let b = s.block_coord(3 * 4);
            (b.m, b.n)
        });
    }

    proptest! {
        #[test]
        fn test_single_core_partitions_problem((problem, tile) in problem_and_tile(), sw in swizzle()) {
            let s = SingleCoreSplitkScheduler::new(problem, tile, sw);
            assert_partitions(&s, &problem, &tile)?;
        }

        #[test]
        fn test_per_core_views_cover_all_loops(
            (problem, tile) in problem_and_tile(),
            sw in swizzle(),
            core_num in 1u32..=10,
        ) {
            let s = SingleCoreSplitkScheduler::new(problem, tile, sw);
            let mut seen = HashSet::new();
            for core in 0..core_num {
                for local in 0..s.single_core_loops(core, core_num) {
                    prop_assert!(seen.insert(s.core_block_coord(core, core_num, local)));
                }
            }
            prop_assert_eq!(seen.len() as u32, s.core_loops());
        }

        #[test]
        fn test_load_flags_along_each_core_walk(
            (problem, tile) in problem_and_tile(),
            sw in swizzle(),
            core_num in 1u32..=10,
        ) {
            let s = SingleCoreSplitkScheduler::new(problem, tile, sw);
            for core in 0..core_num {
                let loops = s.single_core_loops(core, core_num);
                for local in 0..loops {
                    let cur = s.core_block_coord(core, core_num, local);
                    let next = (local + 1 < loops).then(|| s.core_block_coord(core, core_num, local + 1));
                    let (load_a, load_b) = need_load_next(cur, next);
                    match next {
                        None => prop_assert_eq!((load_a, load_b), (false, false)),
                        Some(next) => {
                            prop_assert_eq!(load_a, (cur.m, cur.k) != (next.m, next.k));
                            prop_assert_eq!(load_b, (cur.n, cur.k) != (next.n, next.k));
                            prop_assert!(load_a || load_b, "core {} repeats {} at loop {}", core, cur, local);
                        }
                    }
                }
            }
        }
    }
}
