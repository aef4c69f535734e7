//! Heuristics choosing the L1 tile shape `(m1, n1, k1)` for a GEMM.
//!
//! The search is keyed on whether A and/or B are stored transposed (column-major). Each of the
//! four [TilingVariant]s starts from the tile which saturates DMA bandwidth for its contiguous
//! operand, trades tile size against the number of blocks handed to the cores, and finally picks
//! the deepest `k1` that still fits on-chip.

use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::common::{Dtype, GemmCoord, ProblemShape};
use crate::layout::LayoutTag;
use crate::memorylimits::{judge_space, CapacityError, MemoryFootprint, ACCUMULATOR_BYTES};
use crate::platform::{MemoryLevel, PlatformInfo};
use crate::utils::{ceil_div, round_down, round_up, round_up_u64};

/// Hardware alignment granularity, in elements, of every tile dimension.
pub const ALIGN: u32 = 16;

/// Dimensions at or beyond this size fall back to the bandwidth-optimal baseline tile.
const GUARD_DIM: u32 = 65536;

/// The K extent assumed while the M/N search runs. The final `k1` is chosen afterwards.
const SEARCH_K1: u32 = 128;

/// Candidate `k1` values, deepest first.
const K1_CANDIDATES: [u32; 4] = [1024, 512, 256, 128];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TileShape {
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

impl TileShape {
    pub const fn new(m: u32, n: u32, k: u32) -> Self {
        TileShape { m, n, k }
    }

    pub fn as_coord(&self) -> GemmCoord {
        GemmCoord::new(self.m, self.n, self.k)
    }

    /// Number of output blocks, `ceil(M / m) * ceil(N / n)`.
    pub fn blocks(&self, problem: &ProblemShape) -> u64 {
        block_count(problem.m(), problem.n(), self.m, self.n)
    }

    pub fn is_aligned(&self) -> bool {
        [self.m, self.n, self.k]
            .into_iter()
            .all(|d| d > 0 && d % ALIGN == 0)
    }

    /// The L1 and L0C bytes used by this tile with `l1_stages` buffers of each of A and B.
    pub fn l1_footprint(&self, dtype: Dtype, l1_stages: u32) -> MemoryFootprint {
        let size = u64::from(dtype.size());
        let (m, n, k) = (u64::from(self.m), u64::from(self.n), u64::from(self.k));
        let stages = u64::from(l1_stages);
        MemoryFootprint::single(MemoryLevel::L1, (m * k + k * n) * size * stages)
            + MemoryFootprint::single(MemoryLevel::L0C, m * n * ACCUMULATOR_BYTES)
    }

    /// Derive the L0 tile: the same M and N, with the deepest aligned `k0 <= k` such that
    /// `l0_stages` A and B sub-tiles fit L0A and L0B.
    pub fn derive_l0(
        &self,
        dtype: Dtype,
        platform: &PlatformInfo,
        l0_stages: u32,
    ) -> Result<TileShape, CapacityError> {
        let size = u64::from(dtype.size());
        let stages = u64::from(l0_stages);
        let l0a_bytes = |k0: u32| u64::from(self.m) * u64::from(k0) * size * stages;
        let l0b_bytes = |k0: u32| u64::from(k0) * u64::from(self.n) * size * stages;
        let mut k0 = round_down(self.k, ALIGN);
        while k0 >= ALIGN {
            if l0a_bytes(k0) <= platform.l0a_size.into() && l0b_bytes(k0) <= platform.l0b_size.into()
            {
                return Ok(TileShape::new(self.m, self.n, k0));
            }
            k0 -= ALIGN;
        }
        let (level, required, available) = if l0a_bytes(ALIGN) > platform.l0a_size.into() {
            (MemoryLevel::L0A, l0a_bytes(ALIGN), platform.l0a_size)
        } else {
            (MemoryLevel::L0B, l0b_bytes(ALIGN), platform.l0b_size)
        };
        Err(CapacityError {
            level,
            required,
            available: available.into(),
        })
    }

    /// Check this L1 tile against the platform, including double-buffered L1 stages.
    pub fn validate(&self, dtype: Dtype, platform: &PlatformInfo) -> Result<(), CapacityError> {
        self.l1_footprint(dtype, 2).check(platform)?;
        self.derive_l0(dtype, platform, 2)?;
        Ok(())
    }
}

impl Display for TileShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}x{}", self.m, self.n, self.k)
    }
}

/// One of four tile-shape policies, selected by whether A and B are transposed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumIter)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum TilingVariant {
    /// A row-major, B row-major.
    RowRow,
    /// A row-major, B column-major.
    RowCol,
    /// A column-major, B row-major.
    ColRow,
    /// A column-major, B column-major.
    ColCol,
}

impl TilingVariant {
    pub fn from_transpose(transpose_a: bool, transpose_b: bool) -> Self {
        match (transpose_a, transpose_b) {
            (false, false) => TilingVariant::RowRow,
            (false, true) => TilingVariant::RowCol,
            (true, false) => TilingVariant::ColRow,
            (true, true) => TilingVariant::ColCol,
        }
    }

    pub fn from_layouts(layout_a: LayoutTag, layout_b: LayoutTag) -> Self {
        Self::from_transpose(layout_a.is_transposed(), layout_b.is_transposed())
    }

    /// Choose the L1 tile for `problem`. Pure: identical inputs yield identical tiles.
    pub fn l1_tile(self, problem: &ProblemShape, dtype: Dtype, platform: &PlatformInfo) -> TileShape {
        let search = Search {
            m: problem.m(),
            n: problem.n(),
            k: problem.k(),
            dtype,
            platform,
        };
        let (m1, n1) = match self {
            TilingVariant::RowRow => search.row_row(),
            TilingVariant::RowCol => search.row_col(),
            TilingVariant::ColRow => search.col_row(),
            TilingVariant::ColCol => search.col_col(),
        };
        TileShape::new(m1, n1, max_k1(m1, n1, dtype, platform))
    }
}

impl Display for TilingVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (a, b) = match self {
            TilingVariant::RowRow => ("RowMajor", "RowMajor"),
            TilingVariant::RowCol => ("RowMajor", "ColumnMajor"),
            TilingVariant::ColRow => ("ColumnMajor", "RowMajor"),
            TilingVariant::ColCol => ("ColumnMajor", "ColumnMajor"),
        };
        write!(f, "{a} x {b}")
    }
}

/// Choose and validate the L1 tile for a problem with the given operand layouts.
pub fn choose_l1_tile(
    problem: &ProblemShape,
    layout_a: LayoutTag,
    layout_b: LayoutTag,
    dtype: Dtype,
    platform: &PlatformInfo,
) -> Result<TileShape, CapacityError> {
    let variant = TilingVariant::from_layouts(layout_a, layout_b);
    let tile = variant.l1_tile(problem, dtype, platform);
    debug!(
        "Tiling {} ({}, {}) on {} cores: L1 tile {}",
        problem, variant, dtype, platform.core_num, tile
    );
    tile.validate(dtype, platform)?;
    Ok(tile)
}

/// The deepest candidate `k1` for which an `m1 x n1` tile passes [judge_space].
pub fn max_k1(m1: u32, n1: u32, dtype: Dtype, platform: &PlatformInfo) -> u32 {
    K1_CANDIDATES
        .into_iter()
        .find(|&k1| judge_space(m1, n1, k1, dtype, platform))
        .unwrap_or_else(|| {
            let fallback = 512 / u32::from(dtype.size());
            warn!("No k1 candidate fits a {m1}x{n1} tile; falling back to {fallback}");
            fallback
        })
}

/// `ceil(m / m1) * ceil(n / n1)`, which may not fit in 32 bits.
pub fn block_count(m: u32, n: u32, m1: u32, n1: u32) -> u64 {
    u64::from(ceil_div(m, m1)) * u64::from(ceil_div(n, n1))
}

/// Shrink `m1` in steps of [ALIGN] for as long as the block count stays within the current count
/// rounded up to a whole wave of cores, then clip both tile dimensions to their (aligned)
/// problem dimensions.
///
/// Shrinking never goes below `threshold`. The roles of M and N are swapped by the callers to
/// balance along N instead.
pub fn balance_workload(m: u32, n: u32, m1: &mut u32, n1: &mut u32, threshold: u32, core_num: u32) {
    let max_blocks = round_up_u64(block_count(m, n, *m1, *n1), core_num.into());
    while *m1 > threshold && block_count(m, n, *m1 - ALIGN, *n1) <= max_blocks {
        *m1 -= ALIGN;
    }
    if m < *m1 {
        *m1 = round_up(m, ALIGN);
    }
    if n < *n1 {
        *n1 = round_up(n, ALIGN);
    }
}

struct Search<'a> {
    m: u32,
    n: u32,
    k: u32,
    dtype: Dtype,
    platform: &'a PlatformInfo,
}

impl Search<'_> {
    fn core_num(&self) -> u32 {
        self.platform.core_num
    }

    fn balance(&self, m: u32, n: u32, m1: &mut u32, n1: &mut u32, threshold: u32) {
        balance_workload(m, n, m1, n1, threshold, self.core_num());
    }

    /// Grow `tile` (which tiles `dim`) in steps of [ALIGN] for as long as the capacity
    /// predicate holds, accepting a size only if it removes at least one full wave of blocks
    /// relative to `max_blocks`.
    ///
    /// The candidate size is monotonically non-decreasing, and the loop ends at the first size
    /// the capacity predicate rejects. The accepted size is finally clipped to `dim` rounded up
    /// to [ALIGN], since larger tiles cover no more of the problem.
    fn grow(&self, dim: u32, tile: &mut u32, other_blocks: u32, other_tile: u32, max_blocks: u64) {
        let target = max_blocks.saturating_sub(self.core_num().into());
        let mut candidate = *tile;
        while judge_space(
            candidate + ALIGN,
            other_tile,
            SEARCH_K1,
            self.dtype,
            self.platform,
        ) {
            candidate += ALIGN;
            if u64::from(ceil_div(dim, candidate)) * u64::from(other_blocks) <= target {
                *tile = candidate;
            }
        }
        if dim < *tile {
            *tile = round_up(dim, ALIGN);
        }
    }

    fn max_blocks(&self, m1: u32, n1: u32) -> u64 {
        round_up_u64(block_count(self.m, self.n, m1, n1), self.core_num().into())
    }

    fn row_row(&self) -> (u32, u32) {
        let (m, n) = (self.m, self.n);
        let (mut m1, mut n1) = (128, 256);
        if n >= 256 {
            // n1 = 256 saturates bandwidth for a row-major B.
            self.balance(m, n, &mut m1, &mut n1, 32);
        } else {
            (m1, n1) = (256, 128);
            self.balance(m, n, &mut m1, &mut n1, 32);
            let max_blocks = self.max_blocks(m1, n1);
            self.grow(m, &mut m1, ceil_div(n, n1), n1, max_blocks);
        }
        if self.k >= GUARD_DIM || n > GUARD_DIM {
            (m1, n1) = (128, 256);
        }
        (m1, n1)
    }

    fn row_col(&self) -> (u32, u32) {
        // Both operands are contiguous along K, so bandwidth does not constrain M or N and the
        // most balanced split wins.
        let (m, n) = (self.m, self.n);
        let (mut m1, mut n1) = (128, 256);
        if m < n {
            self.balance(n, m, &mut n1, &mut m1, 64);
            self.balance(m, n, &mut m1, &mut n1, 64);
        } else {
            (m1, n1) = (256, 128);
            self.balance(m, n, &mut m1, &mut n1, 64);
            self.balance(n, m, &mut n1, &mut m1, 64);
        }
        let max_blocks = self.max_blocks(m1, n1);
        if m < n {
            self.grow(n, &mut n1, ceil_div(m, m1), m1, max_blocks);
        } else {
            self.grow(m, &mut m1, ceil_div(n, n1), n1, max_blocks);
        }
        if self.k >= GUARD_DIM {
            (m1, n1) = if m < n { (128, 256) } else { (256, 128) };
        }
        (m1, n1)
    }

    fn col_row(&self) -> (u32, u32) {
        let (m, n) = (self.m, self.n);
        let (mut m1, mut n1) = if m > n { (256, 128) } else { (128, 256) };
        if m < m1 {
            m1 = round_up(m, ALIGN);
        }
        if n < n1 {
            n1 = round_up(n, ALIGN);
        }

        // Both operands are strided along K here, so rather than growing tiles this variant
        // splits small problems further to occupy more cores.
        let halve = |t: u32| round_up(t / 2, ALIGN);
        let core_num = self.core_num();
        let blocks = block_count(m, n, m1, n1);
        if blocks <= u64::from(core_num / 4) {
            if n1 > ALIGN {
                n1 = halve(n1);
            }
            if m1 > ALIGN {
                m1 = halve(m1);
            }
        } else if blocks <= u64::from(core_num / 2) {
            if m1 > n1 {
                m1 = halve(m1);
            } else if n1 > ALIGN {
                n1 = halve(n1);
            }
        }
        if n >= GUARD_DIM || m > GUARD_DIM {
            (m1, n1) = if m < n { (128, 256) } else { (256, 128) };
        }
        (m1, n1)
    }

    fn col_col(&self) -> (u32, u32) {
        let (m, n) = (self.m, self.n);
        let (mut m1, mut n1) = (256, 128);
        if m >= 256 {
            // m1 = 256 saturates bandwidth for a column-major A.
            self.balance(n, m, &mut n1, &mut m1, 32);
        } else {
            (m1, n1) = (128, 256);
            self.balance(n, m, &mut n1, &mut m1, 32);
            let max_blocks = self.max_blocks(m1, n1);
            self.grow(n, &mut n1, ceil_div(m, m1), m1, max_blocks);
        }
        if self.k >= GUARD_DIM || m > GUARD_DIM {
            (m1, n1) = (256, 128);
        }
        (m1, n1)
    }
}
