use log::debug;
use std::thread;

use super::{
    join_cores, on_core, spawn_core, CoreReport, CoreState, CoreTracker, Kernel, KernelArgs,
    LaunchError, SimConfig,
};
use crate::arch::{cross_core_flag, CoreBarrier, CoreResource, CoreRole, CounterSink, FlagSetter, FlagWaiter};
use crate::block::{BlockMmad, BlockTask, VectorCore};
use crate::common::{Dtype, MatrixCoord};
use crate::layout::Layout;
use crate::scheduler::{BlockScheduler, SplitkScheduler};
use crate::select::TilingParams;
use crate::tile::{CubeMmad, GmTensor, NzTileCopy, StoreMode};

/// K is cut into slices computed by different cube cores. Each (block, slice) partial lands in
/// its own `m x n` plane of the workspace; once every cube core is done, the vector cores sum
/// the planes into C.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MultiCoreSplitkMatmul;

fn scheduler(params: &TilingParams) -> SplitkScheduler {
    SplitkScheduler::new(params.problem, params.l1_tile, params.swizzle, params.splitk_factor)
}

impl Kernel for MultiCoreSplitkMatmul {
    fn workspace_len(&self, params: &TilingParams, _sim: &SimConfig) -> u64 {
        u64::from(scheduler(params).splitk()) * u64::from(params.problem.m()) * u64::from(params.problem.n())
    }

    fn run(&self, args: &KernelArgs<'_>, sink: &CounterSink) -> Result<Vec<CoreReport>, LaunchError> {
        let p = &args.params;
        let scheduler = scheduler(p);
        let splitk = scheduler.splitk();
        let partials = GmTensor::new(
            args.workspace,
            Layout::row_major(splitk * p.problem.m(), p.problem.n()),
            Dtype::Float32,
        );
        let aic_num = p.block_dim;
        let sub_num = args.sim.sub_block_num;
        let timeout = args.sim.flag_timeout;
        let barrier = CoreBarrier::new("aic-finish", aic_num as usize, timeout);
        debug!("Split-K over {splitk} slices, {aic_num} cube and {} vector cores", aic_num * sub_num);

        thread::scope(|s| {
            let mut handles = Vec::new();
            for core in 0..aic_num {
                let (done, ready): (Vec<_>, Vec<_>) = (0..sub_num)
                    .map(|sub| cross_core_flag(format!("aic-finish.{core}.{sub}"), timeout))
                    .unzip();
                let (scheduler, barrier) = (&scheduler, &barrier);
                handles.push(spawn_core(s, CoreRole::Cube, core, move || {
                    aic(args, scheduler, core, barrier, done, &partials, sink)
                })?);
                for (sub, ready) in ready.into_iter().enumerate() {
                    let aiv = core * sub_num + sub as u32;
                    handles.push(spawn_core(s, CoreRole::Vector, aiv, move || {
                        aiv_reduce(args, aiv, ready, &partials, splitk, sink)
                    })?);
                }
            }
            join_cores(handles)
        })
    }
}

fn aic(
    args: &KernelArgs<'_>,
    scheduler: &SplitkScheduler,
    core: u32,
    barrier: &CoreBarrier,
    done: Vec<FlagSetter>,
    partials: &GmTensor<'_>,
    sink: &CounterSink,
) -> Result<CoreReport, LaunchError> {
    let mut tracker = CoreTracker::new(core, CoreRole::Cube);
    let fail = on_core(core, CoreRole::Cube);
    tracker.advance(CoreState::Prologue);
    let tile = args.params.l1_tile;
    let core_num = args.params.block_dim;
    let m = args.params.problem.m();
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
    for local in 0..scheduler.single_core_loops(core, core_num) {
        let idx = core + local * core_num;
        let coord = scheduler.block_coord(idx);
        let mut task = BlockTask::for_block(coord, &tile, scheduler.actual_block_shape(coord), idx);
        task.c_origin = task.c_origin + MatrixCoord::new(scheduler.slice_idx(idx) * m, 0);
        mmad.run(&args.a, &args.b, partials, task, StoreMode::Overwrite)
            .map_err(fail)?;
        tracker.tick();
    }

    tracker.advance(CoreState::Drain);
    barrier.wait().map_err(fail)?;
    done.iter().try_for_each(FlagSetter::set).map_err(fail)?;
    let counters = mmad.counters();
    sink.record(counters);
    Ok(tracker.finish(counters))
}

fn aiv_reduce(
    args: &KernelArgs<'_>,
    aiv: u32,
    ready: FlagWaiter,
    partials: &GmTensor<'_>,
    splitk: u32,
    sink: &CounterSink,
) -> Result<CoreReport, LaunchError> {
    let mut tracker = CoreTracker::new(aiv, CoreRole::Vector);
    tracker.advance(CoreState::Prologue);
    let mut resource = CoreResource::new(&args.platform);
    let mut vector = VectorCore::new(&mut resource)?;
    tracker.advance(CoreState::Loop);
    ready.wait().map_err(on_core(aiv, CoreRole::Vector))?;
    let aiv_num = args.params.block_dim * args.sim.sub_block_num;
    vector.reduce_add(partials, splitk, &args.c, aiv, aiv_num);
    tracker.tick();
    let counters = vector.counters();
    sink.record(counters);
    Ok(tracker.finish(counters))
}
