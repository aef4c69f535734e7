#[cfg(not(target_env = "msvc"))]
use tikv_jemallocator::Jemalloc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;
use rand::{rngs::StdRng, Rng, SeedableRng};
use rayon::prelude::*;

use std::num::NonZeroU32;
use std::path;

use tilegemm::arch::GlobalBuffer;
use tilegemm::block::{Activation, Epilogue};
use tilegemm::common::{Dtype, ProblemShape};
use tilegemm::kernel::SimConfig;
use tilegemm::layout::LayoutTag;
use tilegemm::plan::{GemmDesc, GemmPlan, PlanOptions};
use tilegemm::platform::{PlatformId, PlatformInfo};
use tilegemm::pprint::{pprint_params, pprint_schedule, SchedulePrintStyle};
use tilegemm::select::{select_kernel, KernelKind};
use tilegemm::utils::HexBytes;

#[cfg(not(target_env = "msvc"))]
#[global_allocator]
static GLOBAL: Jemalloc = Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Target platform
    #[arg(long, value_enum, hide_default_value = true, default_value_t = PlatformId::default())]
    platform: PlatformId,

    /// Load the platform description from a file instead
    #[arg(long)]
    platform_file: Option<path::PathBuf>,

    /// Limit the number of AI cores
    #[arg(long)]
    cores: Option<NonZeroU32>,

    #[command(subcommand)]
    subcmd: Subcommand,
}

#[derive(Parser)]
enum Subcommand {
    /// Print the tiling decisions for a GEMM
    Tile(GemmArgs),

    /// Print which blocks each core computes
    Schedule {
        #[command(flatten)]
        gemm: GemmArgs,
        #[arg(long, value_enum, default_value_t = SchedulePrintStyle::Compact)]
        style: SchedulePrintStyle,
    },

    /// Run the GEMM on the simulator
    Run(RunCmd),

    /// Print the encoded tiling blob
    Blob(GemmArgs),

    /// Select kernels for a grid of problem shapes
    Sweep {
        /// Largest extent of each dimension; the grid holds powers of two up to it
        #[arg(long, default_value = "8192")]
        max_dim: u32,
        #[arg(long, value_enum, default_value_t = Dtype::Float16)]
        dtype: Dtype,
    },
}

#[derive(clap::Args)]
struct GemmArgs {
    m: u32,
    n: u32,
    k: u32,
    #[arg(long, value_enum, default_value_t = LayoutTag::RowMajor)]
    layout_a: LayoutTag,
    #[arg(long, value_enum, default_value_t = LayoutTag::RowMajor)]
    layout_b: LayoutTag,
    #[arg(long, value_enum, default_value_t = Dtype::Float16)]
    dtype: Dtype,
    /// Output element type; defaults to the input type
    #[arg(long, value_enum)]
    dtype_c: Option<Dtype>,
    /// Force a kernel instead of the automatic choice
    #[arg(long, value_enum)]
    kernel: Option<KernelKind>,
}

#[derive(Parser)]
struct RunCmd {
    #[command(flatten)]
    gemm: GemmArgs,

    /// Seed for the random operands
    #[arg(long, default_value_t = 0)]
    seed: u64,

    /// Scale applied by an epilogue
    #[arg(long)]
    alpha: Option<f32>,

    /// Activation applied by an epilogue
    #[arg(long, value_enum)]
    activation: Option<Activation>,

    /// Seconds a core may wait on a flag before the launch is declared deadlocked
    #[arg(long, default_value_t = 10)]
    flag_timeout: u64,

    /// Disable verification
    #[cfg(feature = "verification")]
    #[arg(long, default_value_t = false)]
    skip_check: bool,
}

impl GemmArgs {
    fn desc(&self) -> Result<GemmDesc> {
        let problem = ProblemShape::new(self.m, self.n, self.k)?;
        let mut desc = GemmDesc::new(problem, self.layout_a, self.layout_b, self.dtype);
        if let Some(dtype_c) = self.dtype_c {
            desc.dtype_c = dtype_c;
        }
        Ok(desc)
    }

    fn plan(&self, platform: &PlatformInfo, options: PlanOptions) -> Result<GemmPlan> {
        let options = PlanOptions {
            kernel: self.kernel,
            ..options
        };
        Ok(GemmPlan::new(self.desc()?, platform, options)?)
    }
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();
    let mut platform = match &args.platform_file {
        Some(p) => PlatformInfo::load(p)
            .with_context(|| format!("loading platform from {}", p.display()))?,
        None => PlatformInfo::for_id(args.platform),
    };
    if let Some(cores) = args.cores {
        platform = platform.with_core_num(cores.get());
    }
    platform.validate()?;

    match &args.subcmd {
        Subcommand::Tile(gemm) => {
            let plan = gemm.plan(&platform, PlanOptions::default())?;
            pprint_params(plan.params(), &platform);
            let [wa, wb, wc] = plan.workspace().region_bytes(gemm.dtype);
            println!("\nworkspace: {wa} + {wb} + {wc} bytes");
        }
        Subcommand::Schedule { gemm, style } => {
            let plan = gemm.plan(&platform, PlanOptions::default())?;
            pprint_schedule(plan.params(), *style);
        }
        Subcommand::Blob(gemm) => {
            let plan = gemm.plan(&platform, PlanOptions::default())?;
            println!("{}", HexBytes(plan.blob()));
        }
        Subcommand::Run(run) => main_run(run, &platform)?,
        Subcommand::Sweep { max_dim, dtype } => main_sweep(*max_dim, *dtype, &platform)?,
    }
    Ok(())
}

fn main_run(run: &RunCmd, platform: &PlatformInfo) -> Result<()> {
    let epilogue = (run.alpha.is_some() || run.activation.is_some()).then(|| Epilogue {
        alpha: run.alpha.unwrap_or(1.0),
        bias: None,
        activation: run.activation.unwrap_or_default(),
    });
    let options = PlanOptions {
        kernel: None,
        epilogue,
        sim: SimConfig {
            flag_timeout: std::time::Duration::from_secs(run.flag_timeout),
            ..SimConfig::default()
        },
    };
    let plan = run.gemm.plan(platform, options)?;
    info!("Running {} with tiling key {}", plan.params().kernel, plan.params().tiling_key());

    #[cfg(feature = "verification")]
    if !run.skip_check {
        let report = tilegemm::verification::verify_plan(&plan, run.seed)?;
        println!("{report}");
        println!("output matches the reference");
        return Ok(());
    }

    let mut rng = StdRng::seed_from_u64(run.seed);
    let [la, lb, lc] = *plan.layouts();
    let mut random = |len: u64| {
        (0..len)
            .map(|_| rng.gen_range(-1.0f32..1.0))
            .collect::<Vec<_>>()
    };
    let a = GlobalBuffer::from_slice(&random(la.span()));
    let b = GlobalBuffer::from_slice(&random(lb.span()));
    let c = GlobalBuffer::zeroed(lc.span() as usize);
    let report = plan.execute(&a, &b, &c)?;
    println!("{report}");
    Ok(())
}

fn main_sweep(max_dim: u32, dtype: Dtype, platform: &PlatformInfo) -> Result<()> {
    let dims = std::iter::successors(Some(16u32), |d| d.checked_mul(2))
        .take_while(|d| *d <= max_dim)
        .collect::<Vec<_>>();
    let mut problems = Vec::new();
    for &m in &dims {
        for &n in &dims {
            for &k in &dims {
                problems.push(ProblemShape::new(m, n, k)?);
            }
        }
    }
    let start_time = std::time::Instant::now();
    let rows = problems
        .par_iter()
        .map(|problem| {
            let params = select_kernel(
                problem,
                LayoutTag::RowMajor,
                LayoutTag::RowMajor,
                dtype,
                platform,
                None,
            )?;
            Ok(format!(
                "{problem}\t{}\t{}\t{}\t{}",
                params.kernel, params.l1_tile, params.block_dim, params.splitk_factor
            ))
        })
        .collect::<Result<Vec<_>>>()?;
    info!("Selected {} kernels in {:?}", rows.len(), start_time.elapsed());
    for row in rows {
        println!("{row}");
    }
    Ok(())
}
