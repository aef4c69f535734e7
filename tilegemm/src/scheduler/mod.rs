//! Block schedulers map a core-local loop index to the coordinate of an output block (in units
//! of L1 tiles) and to the block's actual, clipped shape.
//!
//! Coordinates are tile indices: `coord.m * tile.m` is the first row of the block. `coord.k` is
//! the first K tile the block covers; kernels that do not split K always see `coord.k == 0`.

use enum_dispatch::enum_dispatch;

use crate::common::{GemmCoord, ProblemShape};
use crate::select::{KernelKind, TilingParams};
use crate::tiling::TileShape;
use crate::utils::ceil_div;

mod identity;
mod single_core;
mod splitk;
mod streamk;

pub use identity::IdentityScheduler;
pub use single_core::{need_load_next, SingleCoreSplitkScheduler};
pub use splitk::SplitkScheduler;
pub use streamk::{StreamkPiece, StreamkScheduler};

#[enum_dispatch]
pub trait BlockScheduler {
    /// Total loop iterations across all cores.
    fn core_loops(&self) -> u32;

    fn block_coord(&self, loop_idx: u32) -> GemmCoord;

    /// The block's extent, clipped at the problem boundary. The `k` extent is the number of
    /// K elements the block reduces over.
    fn actual_block_shape(&self, coord: GemmCoord) -> GemmCoord;

    /// Loop indices handled by `core_idx` when loops are dealt round robin.
    fn single_core_loops(&self, core_idx: u32, core_num: u32) -> u32 {
        round_robin_loops(self.core_loops(), core_idx, core_num)
    }

    /// The `local`-th block handled by `core_idx`.
    fn core_block_coord(&self, core_idx: u32, core_num: u32, local: u32) -> GemmCoord {
        self.block_coord(core_idx + local * core_num)
    }
}

#[enum_dispatch(BlockScheduler)]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Scheduler {
    Identity(IdentityScheduler),
    Splitk(SplitkScheduler),
    SingleCoreSplitk(SingleCoreSplitkScheduler),
    Streamk(StreamkScheduler),
}

impl Scheduler {
    /// The scheduler a kernel of the given kind iterates with.
    pub fn for_params(params: &TilingParams) -> Self {
        match params.kernel {
            KernelKind::MultiCoreSplitk => SplitkScheduler::new(
                params.problem,
                params.l1_tile,
                params.swizzle,
                params.splitk_factor,
            )
            .into(),
            KernelKind::Streamk => StreamkScheduler::new(
                params.problem,
                params.l1_tile,
                params.swizzle,
                params.block_dim,
            )
            .into(),
            KernelKind::SingleCoreSplitk => {
                SingleCoreSplitkScheduler::new(params.problem, params.l1_tile, params.swizzle)
                    .into()
            }
            KernelKind::Common
            | KernelKind::Small
            | KernelKind::PaddingCommon
            | KernelKind::WorkspaceEpilogue => {
                IdentityScheduler::new(params.problem, params.l1_tile, params.swizzle).into()
            }
        }
    }
}

/// Loops `core_idx, core_idx + core_num, ...` below `total`.
pub(crate) fn round_robin_loops(total: u32, core_idx: u32, core_num: u32) -> u32 {
    if core_idx >= total {
        0
    } else {
        ceil_div(total - core_idx, core_num)
    }
}

/// `min(tile, problem - coord * tile)` along one dimension, or zero past the end.
pub(crate) fn clip(problem_dim: u32, tile_dim: u32, idx: u32) -> u32 {
    problem_dim
        .saturating_sub(idx.saturating_mul(tile_dim))
        .min(tile_dim)
}

/// Block counts along M, N and K for a tile.
pub(crate) fn loops_per_dim(problem: &ProblemShape, tile: &TileShape) -> GemmCoord {
    GemmCoord::new(
        ceil_div(problem.m(), tile.m),
        ceil_div(problem.n(), tile.n),
        ceil_div(problem.k(), tile.k),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::select::{Swizzle, SwizzleDirection};
    use itertools::Itertools;
    use proptest::prelude::*;
    use std::collections::HashSet;
    use std::num::NonZeroU32;

    pub(super) fn problem_and_tile() -> impl Strategy<Value = (ProblemShape, TileShape)> {
        (1u32..=700, 1u32..=700, 1u32..=900, 1u32..=8, 1u32..=8, 1u32..=8).prop_map(
            |(m, n, k, tm, tn, tk)| {
                (
                    ProblemShape::new(m, n, k).unwrap(),
                    TileShape::new(tm * 16, tn * 16, tk * 16),
                )
            },
        )
    }

    pub(super) fn swizzle() -> impl Strategy<Value = Swizzle> {
        (1u32..=5, prop_oneof![Just(SwizzleDirection::Zn), Just(SwizzleDirection::Nz)])
            .prop_map(|(o, d)| Swizzle::new(NonZeroU32::new(o).unwrap(), d))
    }

    /// Asserts every (m, n, k) element of the problem is covered by exactly one block.
    pub(super) fn assert_partitions<S: BlockScheduler>(
        s: &S,
        problem: &ProblemShape,
        tile: &TileShape,
    ) -> Result<(), TestCaseError> {
        let mut seen = HashSet::new();
        let mut covered = 0u64;
        for idx in 0..s.core_loops() {
            let coord = s.block_coord(idx);
            prop_assert!(seen.insert(coord), "duplicate {} at loop {}", coord, idx);
            let shape = s.actual_block_shape(coord);
            prop_assert!(shape.m >= 1 && shape.m <= tile.m);
            prop_assert!(shape.n >= 1 && shape.n <= tile.n);
            prop_assert!(coord.m * tile.m + shape.m <= problem.m());
            prop_assert!(coord.n * tile.n + shape.n <= problem.n());
            prop_assert!(coord.k * tile.k + shape.k <= problem.k());
            covered += u64::from(shape.m) * u64::from(shape.n) * u64::from(shape.k);
        }
        let total = u64::from(problem.m()) * u64::from(problem.n()) * u64::from(problem.k());
        prop_assert_eq!(covered, total);
        Ok(())
    }

    #[test]
    fn test_round_robin_core_loops_sum_to_total() {
        let problem = ProblemShape::new(1000, 1000, 64).unwrap();
        let s: Scheduler = IdentityScheduler::new(
            problem,
            TileShape::new(128, 256, 64),
            Swizzle::for_problem(&problem),
        )
        .into();
        let total = s.core_loops();
        assert_eq!(total, 8 * 4);
        let per_core = (0..24).map(|c| s.single_core_loops(c, 24)).collect_vec();
        assert_eq!(per_core.iter().sum::<u32>(), total);
        assert_eq!(per_core[0], 2);
        assert_eq!(per_core[23], 1);
        assert_eq!(s.core_block_coord(3, 24, 1), s.block_coord(27));
    }

    #[test]
    fn test_clip_past_end_is_zero() {
        assert_eq!(clip(100, 48, 0), 48);
        assert_eq!(clip(100, 48, 2), 4);
        assert_eq!(clip(100, 48, 3), 0);
    }
}
