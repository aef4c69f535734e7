use rayon::prelude::*;

use super::{collect_reports, on_core, CoreReport, CoreState, CoreTracker, Kernel, KernelArgs, LaunchError};
use crate::arch::{CoreResource, CoreRole, CounterSink};
use crate::block::{BlockMmad, BlockTask};
use crate::common::Dtype;
use crate::scheduler::{need_load_next, BlockScheduler, SingleCoreSplitkScheduler};
use crate::tile::{CubeMmad, NzTileCopy};

/// Every K tile of a block runs as its own loop on the block's core and is atomically added
/// into C, which therefore must be a zeroed f32 buffer. Consecutive loops keep whichever
/// operand tile they share resident in L1.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SingleCoreSplitkMatmul;

impl Kernel for SingleCoreSplitkMatmul {
    fn run(&self, args: &KernelArgs<'_>, sink: &CounterSink) -> Result<Vec<CoreReport>, LaunchError> {
        debug_assert_eq!(args.c.dtype, Dtype::Float32);
        let p = &args.params;
        let scheduler = SingleCoreSplitkScheduler::new(p.problem, p.l1_tile, p.swizzle);
        let core_num = p.block_dim;
        let results = (0..core_num)
            .into_par_iter()
            .map(|core| run_core(args, &scheduler, core, core_num, sink))
            .collect::<Vec<_>>();
        collect_reports(results)
    }
}

fn run_core(
    args: &KernelArgs<'_>,
    scheduler: &SingleCoreSplitkScheduler,
    core: u32,
    core_num: u32,
    sink: &CounterSink,
) -> Result<CoreReport, LaunchError> {
    let mut tracker = CoreTracker::new(core, CoreRole::Cube);
    let fail = on_core(core, CoreRole::Cube);
    tracker.advance(CoreState::Prologue);
    let tile = args.params.l1_tile;
    let mut resource = CoreResource::new(&args.platform);
    let mut mmad = BlockMmad::new(
        &mut resource,
        tile,
        args.params.dtype,
        args.sim.pingpong(),
        NzTileCopy,
        CubeMmad,
    )?;

    tracker.advance(CoreState::Loop);
    let loops = scheduler.single_core_loops(core, core_num);
    let task_at = |local: u32| {
        let coord = scheduler.core_block_coord(core, core_num, local);
        let task = BlockTask::for_block(coord, &tile, scheduler.actual_block_shape(coord), local);
        (coord, task)
    };
    for local in 0..loops {
        let (coord, task) = task_at(local);
        let next = (local + 1 < loops).then(|| task_at(local + 1));
        let (need_a, need_b) = need_load_next(coord, next.map(|(c, _)| c));
        mmad.run_with_prefetch(
            &args.a,
            &args.b,
            &args.c,
            task,
            next.map(|(_, t)| t),
            need_a,
            need_b,
        )
        .map_err(fail)?;
        tracker.tick();
    }

    tracker.advance(CoreState::Drain);
    let counters = mmad.counters();
    sink.record(counters);
    Ok(tracker.finish(counters))
}
