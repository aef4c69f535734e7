use log::debug;
use std::thread;

use super::{
    join_cores, on_core, spawn_core, CoreReport, CoreState, CoreTracker, Kernel, KernelArgs,
    LaunchError, SimConfig,
};
use crate::arch::{workspace_ring, ConsumerHandle, CoreResource, CoreRole, CounterSink, ProducerHandle};
use crate::block::{sub_block_rows, BlockMmad, BlockTask, Callback, Epilogue, VectorCore};
use crate::common::{ConfigError, Dtype, MatrixCoord};
use crate::layout::Layout;
use crate::scheduler::{BlockScheduler, IdentityScheduler};
use crate::select::TilingParams;
use crate::tile::{CubeMmad, GmTensor, NzTileCopy, StoreMode, Window};

/// Cube cores write each block's accumulator into a ring of workspace stages; their paired
/// vector cores apply the epilogue to their half of the rows and free the stage.
///
/// The workspace holds `stages` tiles of `m1 x n1` f32 per cube core.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WorkspaceEpilogueMatmul;

struct Ring<'a> {
    scheduler: IdentityScheduler,
    workspace: GmTensor<'a>,
    stages: u32,
}

impl Ring<'_> {
    /// First workspace row of `stage` for cube core `core`.
    fn slot_row(&self, core: u32, stage: usize) -> u32 {
        (core * self.stages + stage as u32) * self.scheduler.tile().m
    }
}

impl Kernel for WorkspaceEpilogueMatmul {
    fn workspace_len(&self, params: &TilingParams, sim: &SimConfig) -> u64 {
        let tile = params.l1_tile;
        u64::from(params.block_dim)
            * u64::from(sim.workspace_stages)
            * u64::from(tile.m)
            * u64::from(tile.n)
    }

    fn run(&self, args: &KernelArgs<'_>, sink: &CounterSink) -> Result<Vec<CoreReport>, LaunchError> {
        let p = &args.params;
        let epilogue = args.epilogue.ok_or(ConfigError::MissingEpilogue(p.kernel))?;
        epilogue.validate(p.problem.n())?;
        let stages = args.sim.workspace_stages;
        let ring = Ring {
            scheduler: IdentityScheduler::new(p.problem, p.l1_tile, p.swizzle),
            workspace: GmTensor::new(
                args.workspace,
                Layout::row_major(p.block_dim * stages * p.l1_tile.m, p.l1_tile.n),
                Dtype::Float32,
            ),
            stages,
        };
        let sub_num = args.sim.sub_block_num;
        debug!("Epilogue ring of {stages} stages per cube core, {sub_num} vector cores each");

        thread::scope(|s| {
            let mut handles = Vec::new();
            for core in 0..p.block_dim {
                let (producer, consumers) = workspace_ring(
                    &format!("ws{core}"),
                    stages as usize,
                    sub_num as usize,
                    args.sim.flag_timeout,
                );
                let ring = &ring;
                handles.push(spawn_core(s, CoreRole::Cube, core, move || {
                    aic(args, ring, core, producer, sink)
                })?);
                for consumer in consumers {
                    let aiv = core * sub_num + consumer.sub_block() as u32;
                    handles.push(spawn_core(s, CoreRole::Vector, aiv, move || {
                        aiv_epilogue(args, ring, core, aiv, consumer, epilogue, sink)
                    })?);
                }
            }
            join_cores(handles)
        })
    }
}

fn aic(
    args: &KernelArgs<'_>,
    ring: &Ring<'_>,
    core: u32,
    producer: ProducerHandle,
    sink: &CounterSink,
) -> Result<CoreReport, LaunchError> {
    let mut tracker = CoreTracker::new(core, CoreRole::Cube);
    let fail = on_core(core, CoreRole::Cube);
    tracker.advance(CoreState::Prologue);
    let ProducerHandle { flags, mut cursor } = producer;
    let flags = &flags;
    let tile = args.params.l1_tile;
    let core_num = args.params.block_dim;
    let mut resource = CoreResource::new(&args.platform);
    let mut mmad = BlockMmad::new(
        &mut resource,
        tile,
        args.params.dtype,
        args.sim.preload_async(),
        NzTileCopy,
        CubeMmad,
    )?;

    tracker.advance(CoreState::Loop);
    let scheduler = &ring.scheduler;
    for local in 0..scheduler.single_core_loops(core, core_num) {
        let idx = core + local * core_num;
        let coord = scheduler.block_coord(idx);
        let mut task = BlockTask::for_block(coord, &tile, scheduler.actual_block_shape(coord), idx);
        let ticket = cursor.reserve();
        let stage = ticket.stage;
        task.c_origin = MatrixCoord::new(ring.slot_row(core, stage), 0);
        // The stage may only be overwritten once its vector cores are done with it.
        let before = ticket
            .must_wait
            .then(|| Box::new(move || flags.wait_free(stage)) as Callback<'_>);
        let after: Callback<'_> = Box::new(move || flags.set_ready(stage));
        mmad.submit(
            args.a,
            args.b,
            ring.workspace,
            task,
            StoreMode::Overwrite,
            before,
            Some(after),
        )
        .map_err(fail)?;
        tracker.tick();
    }

    tracker.advance(CoreState::Drain);
    mmad.synchronize_block().map_err(fail)?;
    for stage in cursor.drain_order() {
        flags.wait_free(stage).map_err(fail)?;
    }
    let counters = mmad.counters();
    sink.record(counters);
    Ok(tracker.finish(counters))
}

fn aiv_epilogue(
    args: &KernelArgs<'_>,
    ring: &Ring<'_>,
    core: u32,
    aiv: u32,
    mut consumer: ConsumerHandle,
    epilogue: &Epilogue,
    sink: &CounterSink,
) -> Result<CoreReport, LaunchError> {
    let mut tracker = CoreTracker::new(aiv, CoreRole::Vector);
    let fail = on_core(aiv, CoreRole::Vector);
    tracker.advance(CoreState::Prologue);
    let mut resource = CoreResource::new(&args.platform);
    let mut vector = VectorCore::new(&mut resource)?;
    let tile = args.params.l1_tile;
    let core_num = args.params.block_dim;
    let sub = consumer.sub_block() as u32;

    tracker.advance(CoreState::Loop);
    let scheduler = &ring.scheduler;
    for local in 0..scheduler.single_core_loops(core, core_num) {
        let idx = core + local * core_num;
        let coord = scheduler.block_coord(idx);
        let shape = scheduler.actual_block_shape(coord);
        let c_origin = BlockTask::for_block(coord, &tile, shape, idx).c_origin;
        let stage = consumer.wait_ready().map_err(fail)?;
        let (row, rows) = sub_block_rows(shape.m, sub, args.sim.sub_block_num);
        vector.apply_epilogue(
            epilogue,
            &ring.workspace,
            Window::new(MatrixCoord::new(ring.slot_row(core, stage) + row, 0), rows, shape.n),
            &args.c,
            c_origin + MatrixCoord::new(row, 0),
        );
        consumer.release().map_err(fail)?;
        tracker.tick();
    }

    let counters = vector.counters();
    sink.record(counters);
    Ok(tracker.finish(counters))
}

#[cfg(test)]
mod tests {
    use super::super::tests::run_kernel;
    use crate::arch::CoreRole;
    use crate::block::{Activation, Epilogue};
    use crate::select::KernelKind;

    #[test]
    fn test_epilogue_applied_to_every_block() {
        let (m, n) = (200, 300);
        let ep = Epilogue {
            alpha: 0.5,
            bias: Some((0..n).map(|j| (j % 4) as f32).collect()),
            activation: Activation::Relu,
        };
        let (c, product, report) = run_kernel(m, n, 160, KernelKind::WorkspaceEpilogue, Some(&ep));
        let expected = product
            .iter()
            .enumerate()
            .map(|(i, v)| ep.apply(*v, (i % n as usize) as u32))
            .collect::<Vec<_>>();
        assert_eq!(c, expected);
        // Each vector core saw every block its cube core produced.
        assert_eq!(report.loops(CoreRole::Vector), 2 * report.loops(CoreRole::Cube));
    }

    #[test]
    #[should_panic(expected = "MissingEpilogue")]
    fn test_needs_an_epilogue() {
        let _ = run_kernel(32, 32, 32, KernelKind::WorkspaceEpilogue, None);
    }
}
