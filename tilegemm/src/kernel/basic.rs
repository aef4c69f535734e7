use log::trace;
use rayon::prelude::*;

use super::{collect_reports, on_core, CoreReport, CoreState, CoreTracker, Kernel, KernelArgs, LaunchError};
use crate::arch::{CoreResource, CoreRole, CounterSink};
use crate::block::{BlockMmad, BlockTask};
use crate::scheduler::{BlockScheduler, Scheduler};
use crate::select::KernelKind;
use crate::tile::{CubeMmad, NzTileCopy, StoreMode};

/// Cube cores only. Each core computes its blocks straight into C; nothing crosses cores, so
/// cores run on the rayon pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BasicMatmul;

impl Kernel for BasicMatmul {
    fn run(&self, args: &KernelArgs<'_>, sink: &CounterSink) -> Result<Vec<CoreReport>, LaunchError> {
        let scheduler = Scheduler::for_params(&args.params);
        let core_num = args.params.block_dim;
        let results = (0..core_num)
            .into_par_iter()
            .map(|core| run_core(args, &scheduler, core, core_num, sink))
            .collect::<Vec<_>>();
        collect_reports(results)
    }
}

fn run_core(
    args: &KernelArgs<'_>,
    scheduler: &Scheduler,
    core: u32,
    core_num: u32,
    sink: &CounterSink,
) -> Result<CoreReport, LaunchError> {
    let mut tracker = CoreTracker::new(core, CoreRole::Cube);
    let fail = on_core(core, CoreRole::Cube);
    tracker.advance(CoreState::Prologue);
    // Small problems fit one wave of single-K-tile blocks; there is nothing to preload.
    let policy = match args.params.kernel {
        KernelKind::Small => args.sim.pingpong(),
        _ => args.sim.preload_async(),
    };
    let tile = args.params.l1_tile;
    let mut resource = CoreResource::new(&args.platform);
    let mut mmad = BlockMmad::new(&mut resource, tile, args.params.dtype, policy, NzTileCopy, CubeMmad)?;

    tracker.advance(CoreState::Loop);
    for local in 0..scheduler.single_core_loops(core, core_num) {
        let coord = scheduler.core_block_coord(core, core_num, local);
        let shape = scheduler.actual_block_shape(coord);
        trace!("aic-{core} loop {local}: block {coord} shape {shape}");
        let task = BlockTask::for_block(coord, &tile, shape, core + local * core_num);
        mmad.submit(args.a, args.b, args.c, task, StoreMode::Overwrite, None, None)
            .map_err(fail)?;
        tracker.tick();
    }

    tracker.advance(CoreState::Drain);
    mmad.synchronize_block().map_err(fail)?;
    let counters = mmad.counters();
    sink.record(counters);
    Ok(tracker.finish(counters))
}

#[cfg(test)]
mod tests {
    use super::super::tests::run_kernel;
    use crate::arch::CoreRole;
    use crate::select::KernelKind;

    #[test]
    fn test_common_matches_reference_on_ragged_problem() {
        let (c, expected, report) = run_kernel(300, 200, 520, KernelKind::Common, None);
        assert_eq!(c, expected);
        assert_eq!(report.cores.len(), report.block_dim as usize);
        assert!(report.counters.mmad > 0);
    }

    #[test]
    fn test_small_runs_one_loop_per_core() {
        let (c, expected, report) = run_kernel(64, 64, 64, KernelKind::Small, None);
        assert_eq!(c, expected);
        assert_eq!(report.loops(CoreRole::Cube), report.block_dim);
    }
}
