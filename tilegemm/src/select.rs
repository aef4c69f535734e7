//! Kernel selection: given a problem and its chosen L1 tile, decide which kernel runs it, with
//! which split-K factor, traversal order, operand padding, and launch width.

use log::{debug, trace};
use nonzero::nonzero as nz;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::num::NonZeroU32;

use crate::common::{ConfigError, Dtype, ProblemShape};
use crate::layout::LayoutTag;
use crate::platform::PlatformInfo;
use crate::tiling::{choose_l1_tile, TileShape};
use crate::utils::{ceil_div, ceil_div_u64, round_up};

/// Default number of blocks along the swizzled dimension before the traversal turns around.
pub const DEFAULT_SWIZZLE_OFFSET: NonZeroU32 = nz!(3u32);

/// Matrices larger than this are assumed to miss in the L2 cache.
const L2_CACHE_BYTES: u64 = 192 * 1024 * 1024;

/// Per-core vector-unit bandwidth (GB/s) for padding, when the source hits and misses in L2.
const AIV_BANDWIDTH_L2_HIT: f64 = 30.0;
const AIV_BANDWIDTH_L2_MISS: f64 = 10.0;

/// UB bytes used per padding task.
const PADDING_TASK_BYTES: u32 = 48 * 1024;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumIter, strum::Display,
)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum KernelKind {
    /// Round-robin over output blocks, full K per block.
    Common,
    /// At most one output block per core and a single K tile.
    Small,
    /// K split across cores; vector cores reduce the partial sums.
    MultiCoreSplitk,
    /// Whole waves of blocks as in [KernelKind::Common]; the ragged last wave is split along K
    /// over every core and vector cores sum the pieces.
    Streamk,
    /// [KernelKind::Common] with operands padded into the hardware-native layout first.
    PaddingCommon,
    /// Each core walks (block, K tile) pairs and accumulates partial sums in global memory.
    SingleCoreSplitk,
    /// Cube cores stage output tiles in a workspace ring consumed by vector cores running an
    /// epilogue.
    WorkspaceEpilogue,
}

impl KernelKind {
    /// The serial number identifying the kernel in a [TilingKey].
    pub fn serial(&self) -> u8 {
        match self {
            KernelKind::Common => 0,
            KernelKind::Small => 1,
            KernelKind::PaddingCommon => 2,
            KernelKind::MultiCoreSplitk => 3,
            KernelKind::Streamk => 4,
            KernelKind::SingleCoreSplitk => 5,
            KernelKind::WorkspaceEpilogue => 6,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum SwizzleDirection {
    /// Sweep down `offset` rows of blocks, then across, reversing every other band.
    Zn = 0,
    /// Sweep across `offset` columns of blocks, then down, reversing every other band.
    Nz = 1,
}

impl SwizzleDirection {
    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(SwizzleDirection::Zn),
            1 => Some(SwizzleDirection::Nz),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Swizzle {
    offset: NonZeroU32,
    pub direction: SwizzleDirection,
}

impl Swizzle {
    pub fn new(offset: NonZeroU32, direction: SwizzleDirection) -> Self {
        Swizzle { offset, direction }
    }

    /// Blocks along the swizzled dimension before the traversal turns around.
    pub fn offset(&self) -> u32 {
        self.offset.get()
    }

    /// Sweep along the longer output dimension.
    pub fn for_problem(problem: &ProblemShape) -> Self {
        let direction = if problem.m() > problem.n() {
            SwizzleDirection::Zn
        } else {
            SwizzleDirection::Nz
        };
        Swizzle::new(DEFAULT_SWIZZLE_OFFSET, direction)
    }
}

impl Display for Swizzle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}/{}", self.direction, self.offset)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum PaddingTag {
    #[default]
    None,
    /// Re-stride into an aligned ND buffer.
    Nd,
    /// Rewrite into the hardware-native blocked layout.
    Nz,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PaddingTags {
    pub a: PaddingTag,
    pub b: PaddingTag,
    pub c: PaddingTag,
}

impl PaddingTags {
    pub fn any(&self) -> bool {
        *self != PaddingTags::default()
    }
}

/// Packs the kernel serial, operand layouts, padding and input dtype into one integer the host
/// uses to pick a compiled kernel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TilingKey(pub u64);

impl TilingKey {
    pub fn new(
        kernel: KernelKind,
        layout_a: LayoutTag,
        layout_b: LayoutTag,
        padding: PaddingTags,
        dtype: Dtype,
    ) -> Self {
        let fields = [
            u64::from(kernel.serial()),
            layout_a as u64,
            layout_b as u64,
            LayoutTag::RowMajor as u64,
            padding.a as u64,
            padding.b as u64,
            padding.c as u64,
            dtype as u64,
        ];
        TilingKey(fields.iter().fold(0, |acc, f| (acc << 4) | (f & 0xf)))
    }
}

impl Display for TilingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

/// Everything the host decides before launching a GEMM.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TilingParams {
    pub problem: ProblemShape,
    pub layout_a: LayoutTag,
    pub layout_b: LayoutTag,
    pub dtype: Dtype,
    pub l1_tile: TileShape,
    pub swizzle: Swizzle,
    pub splitk_factor: u32,
    pub padding: PaddingTags,
    pub block_dim: u32,
    pub kernel: KernelKind,
}

impl TilingParams {
    fn new(
        problem: ProblemShape,
        layout_a: LayoutTag,
        layout_b: LayoutTag,
        dtype: Dtype,
        l1_tile: TileShape,
    ) -> Self {
        TilingParams {
            problem,
            layout_a,
            layout_b,
            dtype,
            l1_tile,
            swizzle: Swizzle::for_problem(&problem),
            splitk_factor: 1,
            padding: PaddingTags::default(),
            block_dim: 1,
            kernel: KernelKind::Common,
        }
    }

    /// Output blocks of the L1 tile, not counting K splits.
    pub fn blocks(&self) -> u64 {
        self.l1_tile.blocks(&self.problem)
    }

    /// K tiles of the L1 tile.
    pub fn k_tiles(&self) -> u32 {
        ceil_div(self.problem.k(), self.l1_tile.k)
    }

    /// Loop iterations the kernel's scheduler hands out across all cores.
    pub fn scheduler_loops(&self) -> u64 {
        match self.kernel {
            KernelKind::MultiCoreSplitk => self.blocks().saturating_mul(self.splitk_factor.into()),
            KernelKind::SingleCoreSplitk | KernelKind::Streamk => {
                self.blocks().saturating_mul(self.k_tiles().into())
            }
            KernelKind::Common
            | KernelKind::Small
            | KernelKind::PaddingCommon
            | KernelKind::WorkspaceEpilogue => self.blocks(),
        }
    }

    pub fn tiling_key(&self) -> TilingKey {
        TilingKey::new(
            self.kernel,
            self.layout_a,
            self.layout_b,
            self.padding,
            self.dtype,
        )
    }
}

/// Choose the tile and kernel for a problem.
///
/// With `force` set, the named kernel is used instead of the selection chain; kernels that only
/// make sense for some shapes return [ConfigError::KernelNotApplicable] when forced on others.
pub fn select_kernel(
    problem: &ProblemShape,
    layout_a: LayoutTag,
    layout_b: LayoutTag,
    dtype: Dtype,
    platform: &PlatformInfo,
    force: Option<KernelKind>,
) -> Result<TilingParams, ConfigError> {
    platform.validate()?;
    for (name, tag) in [("A", layout_a), ("B", layout_b)] {
        if tag == LayoutTag::Nz {
            return Err(ConfigError::HostNzLayout(name));
        }
    }
    let l1_tile = choose_l1_tile(problem, layout_a, layout_b, dtype, platform)?;
    let mut params = TilingParams::new(*problem, layout_a, layout_b, dtype, l1_tile);

    // A single row or column reads identically in either major order, so select as if it were
    // stored in whichever order streams faster. The caller's layouts are kept in `params`.
    let mut effective = (layout_a, layout_b);
    if problem.m() == 1 && layout_a == LayoutTag::ColumnMajor {
        effective.0 = LayoutTag::RowMajor;
    }
    if problem.n() == 1 && layout_b == LayoutTag::RowMajor {
        effective.1 = LayoutTag::ColumnMajor;
    }

    match force {
        None => {
            let handler = Handler::CHAIN
                .into_iter()
                .find(|h| h.try_select(&mut params, effective, platform))
                .unwrap_or(Handler::Common);
            trace!("Selection chain settled on {handler:?}");
        }
        Some(kernel) => apply_forced(kernel, &mut params, effective, platform)?,
    }

    params.l1_tile.validate(dtype, platform)?;
    let loops = params.scheduler_loops();
    if loops > u64::from(u32::MAX) {
        return Err(ConfigError::TooManyBlocks { loops });
    }
    // Stream-K spreads single K tiles over cores.
    let tasks = match params.kernel {
        KernelKind::Streamk => params.blocks().saturating_mul(params.k_tiles().into()),
        _ => params.blocks().saturating_mul(params.splitk_factor.into()),
    };
    // Bounded by the core count, so the narrowing is lossless.
    params.block_dim = tasks.min(u64::from(platform.core_num)) as u32;
    debug!(
        "Selected {} for {}: tile {}, split-K {}, swizzle {}, padding {:?}, {} cores",
        params.kernel,
        problem,
        params.l1_tile,
        params.splitk_factor,
        params.swizzle,
        params.padding,
        params.block_dim
    );
    Ok(params)
}

fn apply_forced(
    kernel: KernelKind,
    params: &mut TilingParams,
    effective: (LayoutTag, LayoutTag),
    platform: &PlatformInfo,
) -> Result<(), ConfigError> {
    match kernel {
        KernelKind::Small => {
            let eligible = params.blocks() <= u64::from(platform.core_num)
                && params.problem.k() <= params.l1_tile.k;
            if !eligible {
                return Err(ConfigError::KernelNotApplicable {
                    kernel,
                    reason: format!(
                        "{} blocks with K={} exceed one wave of {} cores or one K tile of {}",
                        params.blocks(),
                        params.problem.k(),
                        platform.core_num,
                        params.l1_tile.k
                    ),
                });
            }
            params.kernel = kernel;
        }
        KernelKind::MultiCoreSplitk => {
            let (tile, factor) = splitk_candidate(params, effective, platform);
            params.l1_tile = tile;
            params.splitk_factor = factor.max(1);
            params.padding = PaddingTags {
                c: PaddingTag::None,
                ..padding_tags(params, effective, platform)
            };
            params.kernel = kernel;
        }
        KernelKind::Streamk => {
            params.l1_tile = bandwidth_tile(&params.problem, effective);
            params.padding = PaddingTags {
                c: PaddingTag::None,
                ..padding_tags(params, effective, platform)
            };
            params.kernel = kernel;
        }
        KernelKind::PaddingCommon => {
            params.padding = padding_tags(params, effective, platform);
            params.kernel = kernel;
        }
        KernelKind::Common | KernelKind::SingleCoreSplitk | KernelKind::WorkspaceEpilogue => {
            params.kernel = kernel;
        }
    }
    Ok(())
}

/// The automatic selection chain, tried in order until one handler accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Handler {
    Small,
    MultiCoreSplitk,
    Streamk,
    PaddingCommon,
    Common,
}

impl Handler {
    const CHAIN: [Handler; 5] = [
        Handler::Small,
        Handler::MultiCoreSplitk,
        Handler::Streamk,
        Handler::PaddingCommon,
        Handler::Common,
    ];

    fn try_select(
        self,
        params: &mut TilingParams,
        effective: (LayoutTag, LayoutTag),
        platform: &PlatformInfo,
    ) -> bool {
        match self {
            Handler::Small => {
                params.padding = padding_tags(params, effective, platform);
                if params.padding.any() {
                    return false;
                }
                if params.blocks() <= u64::from(platform.core_num)
                    && params.problem.k() <= params.l1_tile.k
                {
                    params.kernel = KernelKind::Small;
                    return true;
                }
                false
            }
            Handler::MultiCoreSplitk => {
                let problem = params.problem;
                if problem.k() <= 128 {
                    return false;
                }
                let original_blocks = params.blocks();
                let (tile, factor) = splitk_candidate(params, effective, platform);
                let blocks = tile.blocks(&problem);
                // Splitting must not leave fewer tasks than the unsplit tiling had.
                if blocks * u64::from(factor) < original_blocks {
                    return false;
                }
                let k = problem.k();
                let core_num = platform.core_num;
                if (blocks <= u64::from(core_num / 2) && k > 5120) || (blocks <= 2 && k > 1024) {
                    params.l1_tile = tile;
                    params.splitk_factor = factor;
                    params.padding = PaddingTags {
                        c: PaddingTag::None,
                        ..padding_tags(params, effective, platform)
                    };
                    params.kernel = KernelKind::MultiCoreSplitk;
                    return true;
                }
                false
            }
            Handler::Streamk => {
                let problem = params.problem;
                let tile = bandwidth_tile(&problem, effective);
                if !streamk_applies(&problem, &tile, platform.core_num) {
                    return false;
                }
                params.l1_tile = tile;
                params.padding = PaddingTags {
                    c: PaddingTag::None,
                    ..padding_tags(params, effective, platform)
                };
                params.kernel = KernelKind::Streamk;
                true
            }
            Handler::PaddingCommon => {
                if params.padding.any() {
                    params.kernel = KernelKind::PaddingCommon;
                    return true;
                }
                false
            }
            Handler::Common => {
                params.kernel = KernelKind::Common;
                true
            }
        }
    }
}

/// The tile with the best DMA bandwidth for the operand layouts, used by kernels that balance
/// work by splitting K rather than by shrinking tiles.
fn bandwidth_tile(problem: &ProblemShape, effective: (LayoutTag, LayoutTag)) -> TileShape {
    let (tag_a, tag_b) = effective;
    let col_col = tag_a == LayoutTag::ColumnMajor && tag_b == LayoutTag::ColumnMajor;
    let col_row_tall = tag_a == LayoutTag::ColumnMajor
        && tag_b == LayoutTag::RowMajor
        && problem.m() > problem.n();
    if col_col || col_row_tall {
        TileShape::new(256, 128, 128)
    } else {
        TileShape::new(128, 256, 128)
    }
}

/// Stream-K pays off when there are between one and eight waves of blocks, the last wave is
/// at most 80% full, and K is deep enough to split.
fn streamk_applies(problem: &ProblemShape, tile: &TileShape, core_num: u32) -> bool {
    let blocks = tile.blocks(problem);
    let cores = u64::from(core_num);
    let tail = blocks % cores;
    blocks > cores && blocks < 8 * cores && (tail as f64) < 0.8 * cores as f64 && problem.k() > 3072
}

/// The bandwidth-optimal tile for split-K and the split factor it would use.
fn splitk_candidate(
    params: &TilingParams,
    effective: (LayoutTag, LayoutTag),
    platform: &PlatformInfo,
) -> (TileShape, u32) {
    let problem = &params.problem;
    let tile = bandwidth_tile(problem, effective);
    let k = problem.k();
    let max_factor = if k >= 12288 {
        platform.core_num
    } else if k > 8192 {
        8
    } else if k > 1024 {
        4
    } else {
        2
    };
    let blocks = tile.blocks(problem);
    let factor = u32::try_from(u64::from(platform.core_num) / blocks)
        .unwrap_or(max_factor)
        .min(max_factor);
    // Every slice needs at least one K tile.
    (tile, factor.min(ceil_div(k, tile.k)))
}

/// Estimated DMA bandwidth (GB/s per cube core) for moving tiles with `n_value` rows of
/// `d_value` contiguous elements out of a source whose contiguous extent is `src_d_value`.
///
/// Fitted to measurements of 4-byte elements; applied unchanged to narrower types.
pub fn estimate_bandwidth(n_value: u32, d_value: u32, src_d_value: u64, max_bandwidth: f64) -> f64 {
    let d = f64::from(d_value);
    let n = f64::from(n_value);
    let mut band = [
        4.295633544322609,
        0.3035859339962211,
        -0.0015784588599109292,
        0.000006657887925107158,
        -0.00000001611519890867614,
        0.000000000019396510970002,
        -0.000000000000009004592101,
    ]
    .iter()
    .enumerate()
    .map(|(p, c)| c * d.powi(p as i32))
    .sum::<f64>();

    if u64::from(d_value) == src_d_value {
        if (16..=64).contains(&d_value) && d_value % 8 == 0 {
            band = 95.0;
        } else if d_value % 128 == 0 {
            band = 95.0;
        } else if d_value % 64 == 0 {
            band += 40.0;
        } else if d_value % 32 == 0 {
            band += 17.0;
        }
    }
    if src_d_value >= 65536 {
        band = 1.0;
    }
    band *= match src_d_value {
        s if s % 128 == 0 => 100.0 / 40.0,
        s if s % 64 == 0 => 80.0 / 40.0,
        s if s % 32 == 0 => 60.0 / 40.0,
        s if s % 16 == 0 => 50.0 / 40.0,
        _ => 1.0,
    };
    band = band.min(max_bandwidth);

    let scale = if d_value % 256 == 0 {
        (n_value < 16).then(|| -0.004727824537240172 * n * n + 0.13718894235979967 * n + 0.015569563581479779)
    } else if d_value % 32 == 0 {
        (n_value < 32).then(|| -0.0008410977863908918 * n * n + 0.055534598197727145 * n + 0.009854896921994448)
    } else {
        (n_value < 64).then(|| {
            0.0000011791112126816647 * n.powi(3) - 0.0004494844311314906 * n * n
                + 0.03868377611449111 * n
                + 0.014540735965952572
        })
    };
    // The fit goes negative far outside its sampled range; never report less than 1 GB/s.
    (band * scale.unwrap_or(1.0)).max(1.0)
}

/// Per-operand view used by the padding model.
struct OperandTraffic {
    outer: u64,
    inner: u64,
    n_value: u32,
    d_value: u32,
}

impl OperandTraffic {
    /// The largest per-core byte count the vector cores move when padding this operand.
    fn padding_bytes_per_core(&self, dtype_size: u32, core_num: u32) -> u64 {
        let mut task_rows = 16u64;
        let mut task_cols = u64::from(PADDING_TASK_BYTES / dtype_size) / task_rows;
        if self.inner < task_cols {
            task_cols = self.inner;
        }
        if self.outer < task_rows {
            task_rows = self.outer;
        }
        let task_cols = round_up(
            u32::try_from(self.inner / ceil_div_u64(self.inner, task_cols)).unwrap_or(u32::MAX),
            8,
        );
        let tasks = ceil_div_u64(self.outer, task_rows) * ceil_div_u64(self.inner, task_cols.into());
        let per_core = ceil_div_u64(tasks, u64::from(core_num) * 2);
        per_core.saturating_mul(u64::from(task_cols) * task_rows * u64::from(dtype_size))
    }
}

/// Decide which operands to pad before the main kernel, by comparing modelled transfer time
/// with and without a vector-core padding pass for A and for B.
pub fn padding_tags(
    params: &TilingParams,
    effective: (LayoutTag, LayoutTag),
    platform: &PlatformInfo,
) -> PaddingTags {
    let (m, n, k) = (params.problem.m(), params.problem.n(), params.problem.k());
    let TileShape {
        m: m1,
        n: n1,
        k: k1,
    } = params.l1_tile;
    let core_num = platform.core_num;
    let size = u32::from(params.dtype.size());
    let max_bw_aic = 1.6 * 1024.0 / f64::from(core_num);

    let a = if effective.0 == LayoutTag::ColumnMajor {
        OperandTraffic {
            outer: k.into(),
            inner: m.into(),
            n_value: k.min(k1),
            d_value: m.min(m1),
        }
    } else {
        OperandTraffic {
            outer: m.into(),
            inner: k.into(),
            n_value: m.min(m1),
            d_value: k.min(k1),
        }
    };
    let b = if effective.1 == LayoutTag::ColumnMajor {
        OperandTraffic {
            outer: n.into(),
            inner: k.into(),
            n_value: n.min(n1),
            d_value: k.min(k1),
        }
    } else {
        OperandTraffic {
            outer: k.into(),
            inner: n.into(),
            n_value: k.min(k1),
            d_value: n.min(n1),
        }
    };

    let aiv_bandwidth = |rows: u32, cols: u32| {
        if (u64::from(rows) * u64::from(cols)).saturating_mul(size.into()) > L2_CACHE_BYTES {
            AIV_BANDWIDTH_L2_MISS
        } else {
            AIV_BANDWIDTH_L2_HIT
        }
    };
    let a_bw_aiv = aiv_bandwidth(m, k);
    let b_bw_aiv = aiv_bandwidth(k, n);

    let tasks_aic = params.blocks();
    let block_dim_aic = tasks_aic.min(u64::from(core_num)) as u32;
    // Few blocks along a dimension means many cores fetch the same operand tile at once.
    let contended = |loops: u32, bw: f64| {
        if loops < block_dim_aic / 2 && k <= k1 && loops <= 2 {
            bw / f64::from(block_dim_aic / loops) * 1.5
        } else {
            bw
        }
    };
    let a_bw_before = contended(
        ceil_div(m, m1),
        estimate_bandwidth(a.n_value, a.d_value, a.inner, max_bw_aic),
    );
    let b_bw_before = contended(
        ceil_div(n, n1),
        estimate_bandwidth(b.n_value, b.d_value, b.inner, max_bw_aic),
    );
    let (a_bw_after, b_bw_after) = (max_bw_aic, max_bw_aic);

    let splitk = params.splitk_factor;
    let round_max = ceil_div_u64(tasks_aic.saturating_mul(splitk.into()), core_num.into()) as f64;
    let k_per_split = f64::from(ceil_div(k, splitk));
    let a_aic = round_max * f64::from(m.min(m1)) * k_per_split * f64::from(size);
    let b_aic = round_max * f64::from(n.min(n1)) * k_per_split * f64::from(size);
    let a_aiv = a.padding_bytes_per_core(size, core_num) as f64;
    let b_aiv = b.padding_bytes_per_core(size, core_num) as f64;

    let head_cost = 1.0 + 7.0 * f64::from(block_dim_aic) / f64::from(core_num);
    let candidates = [
        (
            a_aic / a_bw_before + b_aic / b_bw_before,
            PaddingTag::None,
            PaddingTag::None,
        ),
        (
            a_aic / a_bw_before + b_aic / b_bw_after + b_aiv / b_bw_aiv + head_cost * 1000.0,
            PaddingTag::None,
            PaddingTag::Nz,
        ),
        (
            a_aic / a_bw_after + b_aic / b_bw_before + a_aiv / a_bw_aiv + head_cost * 1000.0,
            PaddingTag::Nz,
            PaddingTag::None,
        ),
        (
            a_aic / a_bw_after
                + b_aic / b_bw_after
                + a_aiv / a_bw_aiv
                + b_aiv / b_bw_aiv
                + (head_cost + 2.0) * 1000.0,
            PaddingTag::Nz,
            PaddingTag::Nz,
        ),
    ];
    // Ties keep the earlier (cheaper to launch) option.
    let (_, mut pad_a, mut pad_b) = candidates
        .into_iter()
        .fold(None, |best: Option<(f64, PaddingTag, PaddingTag)>, c| match best {
            Some(b) if b.0 <= c.0 => Some(b),
            _ => Some(c),
        })
        .unwrap_or((0.0, PaddingTag::None, PaddingTag::None));

    // Very short unaligned rows are always worth packing when there are many of them.
    let tiny_inner = |t: &OperandTraffic| {
        (t.inner < 8 || (t.inner < 32 && t.inner % 16 != 0)) && t.outer > 512
    };
    if tiny_inner(&a) {
        pad_a = PaddingTag::Nz;
    }
    if tiny_inner(&b) {
        pad_b = PaddingTag::Nz;
    }

    let mut pad_c = PaddingTag::None;
    let (m64, n64, k64) = (u64::from(m), u64::from(n), u64::from(k));
    if m64 * n64 > 2048 * 2048 && n > 256 && n % 128 != 0 {
        let bytes = |a: u64, b: u64, reloads: u32| {
            a.saturating_mul(b)
                .saturating_mul(reloads.into())
                .saturating_mul(size.into())
        };
        let total = bytes(m64, k64, ceil_div(n, n1))
            .saturating_add(bytes(k64, n64, ceil_div(m, m1)))
            .saturating_add(bytes(m64, n64, 1));
        if total < L2_CACHE_BYTES {
            pad_c = PaddingTag::Nd;
        }
    }

    PaddingTags {
        a: pad_a,
        b: pad_b,
        c: pad_c,
    }
}
