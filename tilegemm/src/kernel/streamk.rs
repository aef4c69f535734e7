use log::{debug, trace};
use std::thread;

use super::{
    join_cores, on_core, spawn_core, CoreReport, CoreState, CoreTracker, Kernel, KernelArgs,
    LaunchError, SimConfig,
};
use crate::arch::{cross_core_flag, CoreBarrier, CoreResource, CoreRole, CounterSink, FlagSetter, FlagWaiter};
use crate::block::{sub_block_rows, BlockMmad, BlockTask, VectorCore};
use crate::common::{Dtype, MatrixCoord};
use crate::layout::Layout;
use crate::scheduler::{BlockScheduler, StreamkScheduler};
use crate::select::TilingParams;
use crate::tile::{CubeMmad, GmTensor, NzTileCopy, StoreMode};

/// Normal blocks go straight to C. The leftover blocks are cut along K into pieces spread over
/// every cube core; each piece lands in one of its core's two workspace tiles, and the vector
/// cores of the contributing cube cores sum a block's pieces into C.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StreamkMatmul;

fn scheduler(params: &TilingParams) -> StreamkScheduler {
    StreamkScheduler::new(params.problem, params.l1_tile, params.swizzle, params.block_dim)
}

/// Two `m1 x n1` tiles per cube core, stacked by slot.
fn workspace_layout(params: &TilingParams) -> Layout {
    let tile = params.l1_tile;
    Layout::row_major(2 * params.block_dim * tile.m, tile.n)
}

impl Kernel for StreamkMatmul {
    fn workspace_len(&self, params: &TilingParams, _sim: &SimConfig) -> u64 {
        workspace_layout(params).span()
    }

    fn run(&self, args: &KernelArgs<'_>, sink: &CounterSink) -> Result<Vec<CoreReport>, LaunchError> {
        let p = &args.params;
        let scheduler = scheduler(p);
        let partials = GmTensor::new(args.workspace, workspace_layout(p), Dtype::Float32);
        let aic_num = p.block_dim;
        let sub_num = args.sim.sub_block_num;
        let timeout = args.sim.flag_timeout;
        let barrier = CoreBarrier::new("aiv-pieces", (aic_num * sub_num) as usize, timeout);
        debug!(
            "Stream-K over {} normal and {} split blocks on {aic_num} cube cores",
            scheduler.normal_blocks(),
            scheduler.streamk_blocks()
        );

        thread::scope(|s| {
            let mut handles = Vec::new();
            for core in 0..aic_num {
                let (stored, ready): (Vec<_>, Vec<_>) = (0..sub_num)
                    .map(|sub| cross_core_flag(format!("aic-pieces.{core}.{sub}"), timeout))
                    .unzip();
                let (scheduler, barrier) = (&scheduler, &barrier);
                handles.push(spawn_core(s, CoreRole::Cube, core, move || {
                    aic(args, scheduler, core, stored, &partials, sink)
                })?);
                for (sub, ready) in ready.into_iter().enumerate() {
                    let aiv = core * sub_num + sub as u32;
                    handles.push(spawn_core(s, CoreRole::Vector, aiv, move || {
                        aiv_reduce(args, scheduler, aiv, ready, barrier, &partials, sink)
                    })?);
                }
            }
            join_cores(handles)
        })
    }
}

fn aic(
    args: &KernelArgs<'_>,
    scheduler: &StreamkScheduler,
    core: u32,
    stored: Vec<FlagSetter>,
    partials: &GmTensor<'_>,
    sink: &CounterSink,
) -> Result<CoreReport, LaunchError> {
    let mut tracker = CoreTracker::new(core, CoreRole::Cube);
    let fail = on_core(core, CoreRole::Cube);
    tracker.advance(CoreState::Prologue);
    let tile = args.params.l1_tile;
    let core_num = args.params.block_dim;
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
    let pieces = scheduler.core_pieces(core);
    for (i, piece) in pieces.iter().enumerate() {
        let shape = scheduler.actual_block_shape(piece.coord);
        trace!("aic-{core} piece of block {}: {} shape {shape} -> slot {}", piece.block, piece.coord, piece.slot);
        let mut task = BlockTask::for_block(piece.coord, &tile, shape, scheduler.normal_blocks() + i as u32);
        task.c_origin = MatrixCoord::new(piece.slot * tile.m, 0);
        mmad.run(&args.a, &args.b, partials, task, StoreMode::Overwrite)
            .map_err(fail)?;
        tracker.tick();
    }
    // The vector cores may start reducing while this core works through its normal blocks.
    stored.iter().try_for_each(FlagSetter::set).map_err(fail)?;

    for local in pieces.len() as u32..scheduler.single_core_loops(core, core_num) {
        let coord = scheduler.core_block_coord(core, core_num, local);
        let shape = scheduler.actual_block_shape(coord);
        let idx = core + (local - pieces.len() as u32) * core_num;
        let task = BlockTask::for_block(coord, &tile, shape, idx);
        mmad.run(&args.a, &args.b, &args.c, task, StoreMode::Overwrite)
            .map_err(fail)?;
        tracker.tick();
    }

    tracker.advance(CoreState::Drain);
    let counters = mmad.counters();
    sink.record(counters);
    Ok(tracker.finish(counters))
}

/// Once every cube core has stored its pieces, sum each split block this vector core's cube
/// core contributed to. The rows of a block are divided among the vector cores of all its
/// contributing cube cores.
fn aiv_reduce(
    args: &KernelArgs<'_>,
    scheduler: &StreamkScheduler,
    aiv: u32,
    ready: FlagWaiter,
    barrier: &CoreBarrier,
    partials: &GmTensor<'_>,
    sink: &CounterSink,
) -> Result<CoreReport, LaunchError> {
    let mut tracker = CoreTracker::new(aiv, CoreRole::Vector);
    let fail = on_core(aiv, CoreRole::Vector);
    tracker.advance(CoreState::Prologue);
    let mut resource = CoreResource::new(&args.platform);
    let mut vector = VectorCore::new(&mut resource)?;
    let sub_num = args.sim.sub_block_num;
    let (core, sub) = (aiv / sub_num, aiv % sub_num);
    let tile = args.params.l1_tile;

    tracker.advance(CoreState::Loop);
    ready.wait().map_err(fail)?;
    barrier.wait().map_err(fail)?;
    for block in 0..scheduler.streamk_blocks() {
        let slots = scheduler.contributors(block).map(|p| (p.core, p.slot)).collect::<Vec<_>>();
        let Some(labor) = slots.iter().position(|&(c, _)| c == core) else {
            continue;
        };
        let (coord, shape) = scheduler.streamk_block(block);
        let labor_num = slots.len() as u32 * sub_num;
        let (row, rows) = sub_block_rows(shape.m, labor as u32 * sub_num + sub, labor_num);
        let origins = slots
            .iter()
            .map(|&(_, slot)| MatrixCoord::new(slot * tile.m + row, 0))
            .collect::<Vec<_>>();
        let dst = MatrixCoord::new(coord.m * tile.m + row, coord.n * tile.n);
        trace!("aiv-{aiv} sums rows {row}..{} of split block {block} from slots {slots:?}", row + rows);
        vector.sum_windows(partials, &origins, rows, shape.n, &args.c, dst);
        tracker.tick();
    }
    let counters = vector.counters();
    sink.record(counters);
    Ok(tracker.finish(counters))
}
