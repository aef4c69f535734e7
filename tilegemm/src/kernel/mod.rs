//! Kernels: the per-core control loops that drive block engines over the blocks a scheduler
//! hands each core, and the launcher that validates and runs them.

use enum_dispatch::enum_dispatch;
use log::{info, warn};
use serde::{Deserialize, Serialize};
use std::thread::{self, Scope, ScopedJoinHandle};
use std::time::{Duration, Instant};

use crate::arch::{CoreRole, CounterSink, GlobalBuffer, SyncError, MAX_FLAG_COUNT};
use crate::block::{DispatchPolicy, Epilogue};
use crate::common::ConfigError;
use crate::memorylimits::CapacityError;
use crate::platform::PlatformInfo;
use crate::select::{KernelKind, TilingParams};
use crate::tile::GmTensor;

mod basic;
mod multi_core_splitk;
mod single_core_splitk;
mod state;
mod streamk;
mod workspace_epilogue;

pub use basic::BasicMatmul;
pub use multi_core_splitk::MultiCoreSplitkMatmul;
pub use single_core_splitk::SingleCoreSplitkMatmul;
pub use state::{CoreReport, CoreState, LaunchReport};
pub use streamk::StreamkMatmul;
pub use workspace_epilogue::WorkspaceEpilogueMatmul;

pub(crate) use state::CoreTracker;

/// Knobs of the simulation that the hardware fixes but a model can vary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct SimConfig {
    /// How long a flag or barrier wait may block before it is reported as a deadlock.
    pub flag_timeout: Duration,
    pub workspace_stages: u32,
    pub preload_stages: u32,
    pub l1_stages: u32,
    /// Vector cores paired with each cube core.
    pub sub_block_num: u32,
}

impl Default for SimConfig {
    fn default() -> Self {
        SimConfig {
            flag_timeout: Duration::from_secs(10),
            workspace_stages: 2,
            preload_stages: 2,
            l1_stages: 2,
            sub_block_num: 2,
        }
    }
}

impl SimConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let bad = |msg: String| Err(ConfigError::InvalidSimConfig(msg));
        if self.flag_timeout.is_zero() {
            return bad("flag timeout must be positive".to_string());
        }
        if self.workspace_stages == 0 || self.workspace_stages as usize > MAX_FLAG_COUNT {
            return bad(format!(
                "workspace stages must be within 1..={MAX_FLAG_COUNT}, got {}",
                self.workspace_stages
            ));
        }
        if self.l1_stages < 2 {
            return bad(format!("at least 2 L1 stages are needed, got {}", self.l1_stages));
        }
        if self.preload_stages == 0 || self.sub_block_num == 0 {
            return bad("preload stages and sub-blocks must be positive".to_string());
        }
        // Each vector core of a cube core holds one slot of the cube core's flag rings.
        if self.sub_block_num as usize > MAX_FLAG_COUNT {
            return bad(format!(
                "sub-blocks must be within 1..={MAX_FLAG_COUNT}, got {}",
                self.sub_block_num
            ));
        }
        Ok(())
    }

    pub(crate) fn pingpong(&self) -> DispatchPolicy {
        DispatchPolicy {
            l1_stages: self.l1_stages,
            ..DispatchPolicy::pingpong()
        }
    }

    pub(crate) fn preload_async(&self) -> DispatchPolicy {
        DispatchPolicy::preload_async(self.preload_stages, self.l1_stages)
    }
}

#[derive(thiserror::Error, Debug)]
pub enum LaunchError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error("{role}-{core}: {source}")]
    Sync {
        core: u32,
        role: CoreRole,
        #[source]
        source: SyncError,
    },
    #[error("could not start a core thread: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("{role}-{core} panicked")]
    Panicked { core: u32, role: CoreRole },
}

impl LaunchError {
    /// Lower ranks are closer to a root cause. A core that fails makes its peers time out or see
    /// their flags disconnect.
    fn rank(&self) -> u8 {
        match self {
            LaunchError::Sync {
                source: SyncError::Disconnected { .. },
                ..
            } => 2,
            LaunchError::Sync {
                source: SyncError::Deadlock { .. },
                ..
            } => 1,
            _ => 0,
        }
    }
}

/// Everything a kernel reads at launch. `c` is where the kernel writes its result, which may be
/// a staging buffer rather than the caller's C.
#[derive(Clone, Copy)]
pub struct KernelArgs<'a> {
    pub params: TilingParams,
    pub platform: PlatformInfo,
    pub sim: SimConfig,
    pub a: GmTensor<'a>,
    pub b: GmTensor<'a>,
    pub c: GmTensor<'a>,
    /// Kernel scratch: split-K partials, stream-K pieces or the epilogue ring.
    pub workspace: &'a GlobalBuffer,
    pub epilogue: Option<&'a Epilogue>,
}

#[enum_dispatch]
pub trait Kernel {
    /// f32 elements of scratch the kernel needs in [KernelArgs::workspace].
    fn workspace_len(&self, _params: &TilingParams, _sim: &SimConfig) -> u64 {
        0
    }

    /// Run every core to completion, recording each core's counters in `sink`.
    fn run(&self, args: &KernelArgs<'_>, sink: &CounterSink) -> Result<Vec<CoreReport>, LaunchError>;
}

#[enum_dispatch(Kernel)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatmulKernel {
    BasicMatmul,
    SingleCoreSplitkMatmul,
    MultiCoreSplitkMatmul,
    StreamkMatmul,
    WorkspaceEpilogueMatmul,
}

impl MatmulKernel {
    pub fn for_kind(kind: KernelKind) -> Self {
        match kind {
            KernelKind::Common | KernelKind::Small | KernelKind::PaddingCommon => {
                BasicMatmul.into()
            }
            KernelKind::SingleCoreSplitk => SingleCoreSplitkMatmul.into(),
            KernelKind::MultiCoreSplitk => MultiCoreSplitkMatmul.into(),
            KernelKind::Streamk => StreamkMatmul.into(),
            KernelKind::WorkspaceEpilogue => WorkspaceEpilogueMatmul.into(),
        }
    }
}

/// Validate `args` and run the kernel its parameters name.
pub fn launch(args: &KernelArgs<'_>) -> Result<LaunchReport, LaunchError> {
    let p = &args.params;
    args.sim.validate()?;
    args.platform.validate()?;
    if p.block_dim == 0 || p.block_dim > args.platform.core_num {
        return Err(ConfigError::TooManyCores {
            requested: p.block_dim,
            available: args.platform.core_num,
        }
        .into());
    }
    p.l1_tile
        .l1_footprint(p.dtype, args.sim.l1_stages)
        .check(&args.platform)?;
    p.l1_tile.derive_l0(p.dtype, &args.platform, 2)?;

    let (m, n, k) = (p.problem.m(), p.problem.n(), p.problem.k());
    check_operand("A", &args.a, m, k)?;
    check_operand("B", &args.b, k, n)?;
    check_operand("C", &args.c, m, n)?;
    let kernel = MatmulKernel::for_kind(p.kernel);
    let needed = kernel.workspace_len(p, &args.sim);
    if (args.workspace.len() as u64) < needed {
        return Err(ConfigError::BufferSize {
            operand: "workspace",
            expected: needed,
            actual: args.workspace.len() as u64,
        }
        .into());
    }

    info!(
        "Launching {} for {} on {} cores (tile {}, split-K {})",
        p.kernel, p.problem, p.block_dim, p.l1_tile, p.splitk_factor
    );
    let sink = CounterSink::default();
    let start = Instant::now();
    let cores = kernel.run(args, &sink)?;
    let report = LaunchReport {
        kernel: p.kernel,
        block_dim: p.block_dim,
        cores,
        counters: sink.total(),
        elapsed: start.elapsed(),
    };
    info!("{report}");
    Ok(report)
}

fn check_operand(name: &'static str, t: &GmTensor<'_>, rows: u32, cols: u32) -> Result<(), ConfigError> {
    if (t.layout.rows(), t.layout.cols()) != (rows, cols) {
        return Err(ConfigError::BufferSize {
            operand: name,
            expected: u64::from(rows) * u64::from(cols),
            actual: u64::from(t.layout.rows()) * u64::from(t.layout.cols()),
        });
    }
    if (t.buf.len() as u64) < t.layout.span() {
        return Err(ConfigError::BufferSize {
            operand: name,
            expected: t.layout.span(),
            actual: t.buf.len() as u64,
        });
    }
    Ok(())
}

/// Map a flag failure on `role`-`core` into a launch error.
pub(crate) fn on_core(core: u32, role: CoreRole) -> impl Fn(SyncError) -> LaunchError + Copy {
    move |source| LaunchError::Sync { core, role, source }
}

/// Every core's report, or the failure closest to a root cause.
pub(crate) fn collect_reports(
    results: impl IntoIterator<Item = Result<CoreReport, LaunchError>>,
) -> Result<Vec<CoreReport>, LaunchError> {
    let mut reports = Vec::new();
    let mut failure: Option<LaunchError> = None;
    for result in results {
        match result {
            Ok(report) => reports.push(report),
            Err(e) => {
                warn!("Core failed: {e}");
                if failure.as_ref().map_or(true, |f| e.rank() < f.rank()) {
                    failure = Some(e);
                }
            }
        }
    }
    match failure {
        Some(e) => Err(e),
        None => Ok(reports),
    }
}

pub(crate) type CoreHandle<'scope> = ScopedJoinHandle<'scope, Result<CoreReport, LaunchError>>;

/// Start a named thread for one core of a role-split kernel.
pub(crate) fn spawn_core<'scope, 'env, F>(
    scope: &'scope Scope<'scope, 'env>,
    role: CoreRole,
    core: u32,
    f: F,
) -> Result<(CoreRole, u32, CoreHandle<'scope>), LaunchError>
where
    F: FnOnce() -> Result<CoreReport, LaunchError> + Send + 'scope,
{
    let handle = thread::Builder::new()
        .name(format!("{role}-{core}"))
        .spawn_scoped(scope, f)?;
    Ok((role, core, handle))
}

pub(crate) fn join_cores(
    handles: Vec<(CoreRole, u32, CoreHandle<'_>)>,
) -> Result<Vec<CoreReport>, LaunchError> {
    collect_reports(handles.into_iter().map(|(role, core, h)| {
        h.join()
            .unwrap_or_else(|_| Err(LaunchError::Panicked { core, role }))
    }))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::arch::HwCounters;
    use crate::common::{Dtype, ProblemShape};
    use crate::layout::{Layout, LayoutTag};
    use crate::select::select_kernel;

    /// Small deterministic operands: values are small integers so f32 sums are exact.
    pub(crate) fn operands(m: u32, n: u32, k: u32) -> (Vec<f32>, Vec<f32>) {
        let a = (0..m * k).map(|x| ((x * 7) % 5) as f32 - 2.0).collect();
        let b = (0..k * n).map(|x| ((x * 3) % 7) as f32 - 3.0).collect();
        (a, b)
    }

    /// Row-major reference product.
    pub(crate) fn reference(a: &[f32], b: &[f32], m: u32, n: u32, k: u32) -> Vec<f32> {
        let (m, n, k) = (m as usize, n as usize, k as usize);
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = (0..k).map(|l| a[i * k + l] * b[l * n + j]).sum();
            }
        }
        c
    }

    pub(crate) fn params_for(m: u32, n: u32, k: u32, kernel: KernelKind, platform: &PlatformInfo) -> TilingParams {
        let problem = ProblemShape::new(m, n, k).unwrap();
        select_kernel(
            &problem,
            LayoutTag::RowMajor,
            LayoutTag::RowMajor,
            Dtype::Float32,
            platform,
            Some(kernel),
        )
        .unwrap()
    }

    /// Run `kernel` on row-major f32 operands and return C.
    pub(crate) fn run_kernel(
        m: u32,
        n: u32,
        k: u32,
        kernel: KernelKind,
        epilogue: Option<&Epilogue>,
    ) -> (Vec<f32>, Vec<f32>, LaunchReport) {
        let platform = PlatformInfo::atlas_a2().with_core_num(4);
        let params = params_for(m, n, k, kernel, &platform);
        let sim = SimConfig {
            flag_timeout: Duration::from_secs(5),
            ..SimConfig::default()
        };
        let (a, b) = operands(m, n, k);
        let (abuf, bbuf) = (GlobalBuffer::from_slice(&a), GlobalBuffer::from_slice(&b));
        let cbuf = GlobalBuffer::zeroed((m * n) as usize);
        let ws = GlobalBuffer::zeroed(MatmulKernel::for_kind(kernel).workspace_len(&params, &sim) as usize);
        let args = KernelArgs {
            params,
            platform,
            sim,
            a: GmTensor::new(&abuf, Layout::row_major(m, k), Dtype::Float32),
            b: GmTensor::new(&bbuf, Layout::row_major(k, n), Dtype::Float32),
            c: GmTensor::new(&cbuf, Layout::row_major(m, n), Dtype::Float32),
            workspace: &ws,
            epilogue,
        };
        let report = launch(&args).unwrap();
        (cbuf.to_vec(), reference(&a, &b, m, n, k), report)
    }

    #[test]
    fn test_sim_config_rejects_deep_rings() {
        let sim = SimConfig {
            workspace_stages: 16,
            ..SimConfig::default()
        };
        assert!(matches!(sim.validate(), Err(ConfigError::InvalidSimConfig(_))));
        let sim = SimConfig {
            sub_block_num: MAX_FLAG_COUNT as u32 + 1,
            ..SimConfig::default()
        };
        assert!(matches!(sim.validate(), Err(ConfigError::InvalidSimConfig(_))));
        let sim = SimConfig {
            sub_block_num: MAX_FLAG_COUNT as u32,
            ..SimConfig::default()
        };
        assert!(sim.validate().is_ok());
        assert!(SimConfig::default().validate().is_ok());
    }

    #[test]
    fn test_launch_rejects_too_many_sub_blocks_before_running() {
        let platform = PlatformInfo::atlas_a2().with_core_num(4);
        let params = params_for(64, 64, 64, KernelKind::WorkspaceEpilogue, &platform);
        let buf = GlobalBuffer::zeroed(64 * 64);
        let t = |b| GmTensor::new(b, Layout::row_major(64, 64), Dtype::Float32);
        let args = KernelArgs {
            params,
            platform,
            sim: SimConfig {
                sub_block_num: 16,
                ..SimConfig::default()
            },
            a: t(&buf),
            b: t(&buf),
            c: t(&buf),
            workspace: &buf,
            epilogue: None,
        };
        assert!(matches!(
            launch(&args),
            Err(LaunchError::Config(ConfigError::InvalidSimConfig(_)))
        ));
    }

    #[test]
    fn test_launch_rejects_short_operand() {
        let platform = PlatformInfo::atlas_a2().with_core_num(4);
        let params = params_for(32, 32, 32, KernelKind::Common, &platform);
        let buf = GlobalBuffer::zeroed(32 * 32);
        let short = GlobalBuffer::zeroed(10);
        let t = |b| GmTensor::new(b, Layout::row_major(32, 32), Dtype::Float32);
        let args = KernelArgs {
            params,
            platform,
            sim: SimConfig::default(),
            a: t(&buf),
            b: t(&short),
            c: t(&buf),
            workspace: &buf,
            epilogue: None,
        };
        assert!(matches!(
            launch(&args),
            Err(LaunchError::Config(ConfigError::BufferSize { operand: "B", .. }))
        ));
    }

    #[test]
    fn test_root_cause_preferred_over_peer_timeouts() {
        let peer = LaunchError::Sync {
            core: 0,
            role: CoreRole::Cube,
            source: SyncError::Deadlock {
                flag: "f".to_string(),
                timeout: Duration::from_millis(1),
            },
        };
        let cause = LaunchError::Panicked {
            core: 1,
            role: CoreRole::Vector,
        };
        let ok = CoreReport {
            core: 2,
            role: CoreRole::Cube,
            state: CoreState::Terminated,
            loops: 0,
            counters: HwCounters::default(),
        };
        let err = collect_reports([Ok(ok), Err(peer), Err(cause)]).unwrap_err();
        assert!(matches!(err, LaunchError::Panicked { core: 1, .. }));
    }
}
