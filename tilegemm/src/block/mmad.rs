use log::trace;
use std::collections::VecDeque;

use crate::arch::{CoreResource, HwCounters, StageRing, SyncError};
use crate::common::{Dtype, GemmCoord, MatrixCoord};
use crate::layout::Layout;
use crate::memorylimits::{CapacityError, ACCUMULATOR_BYTES};
use crate::platform::MemoryLevel;
use crate::tile::{GmTensor, StoreMode, TileCopy, TileMmad, Window};
use crate::tiling::{TileShape, ALIGN};
use crate::utils::{ceil_div, round_up};

/// Buffering depths and pipeline switches for a [BlockMmad].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DispatchPolicy {
    pub l1_stages: u32,
    pub l0a_stages: u32,
    pub l0b_stages: u32,
    pub l0c_stages: u32,
    /// Tiles [BlockMmad::submit] may hold back before executing the oldest.
    pub preload_stages: u32,
    /// Skip reloading an L1 stage that already holds the requested tile.
    pub l1_resident: bool,
    /// Start each block's K loop at `block_idx % k_tiles` so concurrent blocks read different
    /// K tiles of a shared operand.
    pub shuffle_k: bool,
}

impl DispatchPolicy {
    pub const fn pingpong() -> Self {
        DispatchPolicy {
            l1_stages: 2,
            l0a_stages: 2,
            l0b_stages: 2,
            l0c_stages: 1,
            preload_stages: 1,
            l1_resident: false,
            shuffle_k: false,
        }
    }

    pub const fn preload_async(preload_stages: u32, l1_stages: u32) -> Self {
        DispatchPolicy {
            l1_stages,
            preload_stages,
            shuffle_k: true,
            ..Self::pingpong()
        }
    }
}

/// One block's worth of work: where its operands start and its actual extents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockTask {
    pub a_origin: MatrixCoord,
    pub b_origin: MatrixCoord,
    pub c_origin: MatrixCoord,
    pub shape: GemmCoord,
    pub block_idx: u32,
}

impl BlockTask {
    /// The task for block `coord` (in tile units) of an L1 tile, with the given actual shape.
    pub fn for_block(coord: GemmCoord, tile: &TileShape, shape: GemmCoord, block_idx: u32) -> Self {
        let (row, col, k) = (coord.m * tile.m, coord.n * tile.n, coord.k * tile.k);
        BlockTask {
            a_origin: MatrixCoord::new(row, k),
            b_origin: MatrixCoord::new(k, col),
            c_origin: MatrixCoord::new(row, col),
            shape,
            block_idx,
        }
    }
}

/// Work run around the fixpipe of a submitted task, typically waiting on or setting a
/// cross-core flag.
pub type Callback<'a> = Box<dyn FnOnce() -> Result<(), SyncError> + Send + 'a>;

struct Pending<'a> {
    a: GmTensor<'a>,
    b: GmTensor<'a>,
    c: GmTensor<'a>,
    task: BlockTask,
    mode: StoreMode,
    before: Option<Callback<'a>>,
    after: Option<Callback<'a>>,
}

/// Identifies what an L1 stage holds: the source buffer and the window copied from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct L1Tag {
    source: usize,
    window: Window,
}

impl L1Tag {
    fn new(src: &GmTensor<'_>, window: Window) -> Self {
        L1Tag {
            source: src.buf as *const _ as usize,
            window,
        }
    }
}

/// Computes one output block at a time on a single cube core, streaming K tiles through L1 and
/// L0 and accumulating in L0C.
pub struct BlockMmad<'a, C, M> {
    copy: C,
    mma: M,
    policy: DispatchPolicy,
    l1_tile: TileShape,
    k0: u32,
    l1a: StageRing<Vec<f32>, L1Tag>,
    l1b: StageRing<Vec<f32>, L1Tag>,
    l1a_layout: Layout,
    l1b_layout: Layout,
    l0a: StageRing<Vec<f32>>,
    l0b: StageRing<Vec<f32>>,
    l0a_layout: Layout,
    l0b_layout: Layout,
    l0c: Vec<f32>,
    l0c_layout: Layout,
    l1_list_id: usize,
    l0_list_id: usize,
    resident_a: Option<usize>,
    resident_b: Option<usize>,
    queue: VecDeque<Pending<'a>>,
    counters: HwCounters,
}

impl<'a, C: TileCopy, M: TileMmad> BlockMmad<'a, C, M> {
    /// Reserve every buffer the pipeline needs from `resource`.
    pub fn new(
        resource: &mut CoreResource,
        l1_tile: TileShape,
        dtype: Dtype,
        policy: DispatchPolicy,
        copy: C,
        mma: M,
    ) -> Result<Self, CapacityError> {
        let platform = *resource.platform();
        let l0_stages = policy.l0a_stages.max(policy.l0b_stages);
        let k0 = l1_tile.derive_l0(dtype, &platform, l0_stages)?.k;
        let size = u64::from(dtype.size());
        let TileShape { m: m1, n: n1, k: k1 } = l1_tile;

        let l1a_layout = Layout::nz(m1, k1, dtype);
        let l1b_layout = Layout::nz(k1, n1, dtype);
        let mut alloc_ring = |level, layout: &Layout, stages: u32, bytes| {
            (0..stages)
                .map(|_| resource.alloc(level, layout.span() as usize, bytes))
                .collect::<Result<Vec<_>, _>>()
        };
        let l1a = alloc_ring(MemoryLevel::L1, &l1a_layout, policy.l1_stages, size)?;
        let l1b = alloc_ring(MemoryLevel::L1, &l1b_layout, policy.l1_stages, size)?;
        let l0a_layout = Layout::row_major(m1, k0);
        let l0b_layout = Layout::row_major(k0, n1);
        let l0a = alloc_ring(MemoryLevel::L0A, &l0a_layout, policy.l0a_stages, size)?;
        let l0b = alloc_ring(MemoryLevel::L0B, &l0b_layout, policy.l0b_stages, size)?;
        let l0c_layout = Layout::row_major(m1, n1);
        let l0c = alloc_ring(
            MemoryLevel::L0C,
            &l0c_layout,
            policy.l0c_stages,
            ACCUMULATOR_BYTES,
        )?
        .into_iter()
        .next()
        .unwrap_or_default();

        trace!("BlockMmad {l1_tile} (k0 = {k0}) with {policy:?}");
        Ok(BlockMmad {
            copy,
            mma,
            policy,
            l1_tile,
            k0,
            l1a: StageRing::new("L1A", l1a),
            l1b: StageRing::new("L1B", l1b),
            l1a_layout,
            l1b_layout,
            l0a: StageRing::new("L0A", l0a),
            l0b: StageRing::new("L0B", l0b),
            l0a_layout,
            l0b_layout,
            l0c,
            l0c_layout,
            l1_list_id: 0,
            l0_list_id: 0,
            resident_a: None,
            resident_b: None,
            queue: VecDeque::new(),
            counters: HwCounters::default(),
        })
    }

    pub fn l1_tile(&self) -> TileShape {
        self.l1_tile
    }

    pub fn k0(&self) -> u32 {
        self.k0
    }

    pub fn counters(&self) -> HwCounters {
        self.counters
    }

    /// Compute `task` and write it to `c` with `mode`.
    pub fn run(
        &mut self,
        a: &GmTensor<'_>,
        b: &GmTensor<'_>,
        c: &GmTensor<'_>,
        task: BlockTask,
        mode: StoreMode,
    ) -> Result<(), SyncError> {
        if task.shape.is_empty() {
            return Ok(());
        }
        self.compute(a, b, &task)?;
        self.fixpipe(c, &task, mode);
        Ok(())
    }

    /// Queue `task`. Once more than `preload_stages` tasks are queued, the oldest is computed;
    /// `before` runs between its compute and its fixpipe and `after` runs once it is stored.
    pub fn submit(
        &mut self,
        a: GmTensor<'a>,
        b: GmTensor<'a>,
        c: GmTensor<'a>,
        task: BlockTask,
        mode: StoreMode,
        before: Option<Callback<'a>>,
        after: Option<Callback<'a>>,
    ) -> Result<(), SyncError> {
        self.queue.push_back(Pending {
            a,
            b,
            c,
            task,
            mode,
            before,
            after,
        });
        while self.queue.len() > self.policy.preload_stages as usize {
            self.execute_oldest()?;
        }
        Ok(())
    }

    /// Execute every queued task.
    pub fn synchronize_block(&mut self) -> Result<(), SyncError> {
        while !self.queue.is_empty() {
            self.execute_oldest()?;
        }
        Ok(())
    }

    fn execute_oldest(&mut self) -> Result<(), SyncError> {
        let Some(p) = self.queue.pop_front() else {
            return Ok(());
        };
        // An empty task still runs its callbacks so flag counts stay balanced.
        let empty = p.task.shape.is_empty();
        if !empty {
            self.compute(&p.a, &p.b, &p.task)?;
        }
        if let Some(before) = p.before {
            before()?;
        }
        if !empty {
            self.fixpipe(&p.c, &p.task, p.mode);
        }
        if let Some(after) = p.after {
            after()?;
        }
        Ok(())
    }

    /// Compute a single-K-tile task, prefetching the next task's operands into L1 while it runs.
    ///
    /// When the next task keeps an operand (`need_load_next_* == false`), that operand's L1
    /// stage is kept resident instead of released. The result is accumulated into `c`.
    #[allow(clippy::too_many_arguments)]
    pub fn run_with_prefetch(
        &mut self,
        a: &GmTensor<'_>,
        b: &GmTensor<'_>,
        c: &GmTensor<'_>,
        task: BlockTask,
        next: Option<BlockTask>,
        need_load_next_a: bool,
        need_load_next_b: bool,
    ) -> Result<(), SyncError> {
        debug_assert!(task.shape.k <= self.l1_tile.k);
        if task.shape.is_empty() {
            return Ok(());
        }
        let (win_a, win_b) = operand_windows(&task, 0, task.shape.k);
        let slot_a = match self.resident_a.take() {
            Some(slot) => slot,
            None => {
                let slot = free_slot(&self.l1a, self.l1_list_id);
                load_l1(&self.copy, &mut self.l1a, &self.l1a_layout, a, win_a, slot, false, &mut self.counters)?;
                slot
            }
        };
        let slot_b = match self.resident_b.take() {
            Some(slot) => slot,
            None => {
                let slot = free_slot(&self.l1b, self.l1_list_id);
                load_l1(&self.copy, &mut self.l1b, &self.l1b_layout, b, win_b, slot, false, &mut self.counters)?;
                slot
            }
        };
        self.l1_list_id = (slot_a.max(slot_b) + 1) % self.l1a.len();

        let mut next_a = None;
        let mut next_b = None;
        if let Some(next) = next.filter(|n| !n.shape.is_empty()) {
            let (nwin_a, nwin_b) = operand_windows(&next, 0, next.shape.k);
            if need_load_next_a {
                let slot = free_slot_except(&self.l1a, self.l1_list_id, slot_a);
                load_l1(&self.copy, &mut self.l1a, &self.l1a_layout, a, nwin_a, slot, false, &mut self.counters)?;
                next_a = Some(slot);
            }
            if need_load_next_b {
                let slot = free_slot_except(&self.l1b, self.l1_list_id, slot_b);
                load_l1(&self.copy, &mut self.l1b, &self.l1b_layout, b, nwin_b, slot, false, &mut self.counters)?;
                next_b = Some(slot);
            }
        }

        self.l0_loop(slot_a, slot_b, &task, true)?;

        let keep = next.is_some();
        if keep && !need_load_next_a {
            self.l1a.retain(slot_a)?;
            self.resident_a = Some(slot_a);
        } else {
            self.l1a.release(slot_a)?;
            self.resident_a = next_a;
        }
        if keep && !need_load_next_b {
            self.l1b.retain(slot_b)?;
            self.resident_b = Some(slot_b);
        } else {
            self.l1b.release(slot_b)?;
            self.resident_b = next_b;
        }

        self.fixpipe(c, &task, StoreMode::AtomicAdd);
        Ok(())
    }

    /// The K loop: tiles are issued up to `l1_stages` ahead of the one being consumed.
    fn compute(&mut self, a: &GmTensor<'_>, b: &GmTensor<'_>, task: &BlockTask) -> Result<(), SyncError> {
        let k1 = self.l1_tile.k;
        let k_tiles = ceil_div(task.shape.k, k1);
        let start = if self.policy.shuffle_k {
            task.block_idx % k_tiles
        } else {
            0
        };
        let order = (0..k_tiles).map(|i| (start + i) % k_tiles).collect::<Vec<_>>();
        let stages = self.l1a.len();
        let resident = self.policy.l1_resident;

        let mut in_flight: VecDeque<(usize, u32)> = VecDeque::with_capacity(stages);
        let mut issued = 0;
        let mut first = true;
        while issued < order.len() || !in_flight.is_empty() {
            while issued < order.len() && in_flight.len() < stages {
                let kt = order[issued];
                let k_len = (task.shape.k - kt * k1).min(k1);
                let (win_a, win_b) = operand_windows(task, kt * k1, k_len);
                let slot = self.l1_list_id;
                self.l1_list_id = (self.l1_list_id + 1) % stages;
                load_l1(&self.copy, &mut self.l1a, &self.l1a_layout, a, win_a, slot, resident, &mut self.counters)?;
                load_l1(&self.copy, &mut self.l1b, &self.l1b_layout, b, win_b, slot, resident, &mut self.counters)?;
                in_flight.push_back((slot, kt));
                issued += 1;
            }
            if let Some((slot, kt)) = in_flight.pop_front() {
                let k_len = (task.shape.k - kt * k1).min(k1);
                let sub = BlockTask {
                    shape: GemmCoord::new(task.shape.m, task.shape.n, k_len),
                    ..*task
                };
                self.l0_loop(slot, slot, &sub, first)?;
                self.l1a.release(slot)?;
                self.l1b.release(slot)?;
                first = false;
            }
        }
        Ok(())
    }

    /// Consume one L1 stage of A and of B through L0 in steps of `k0`, accumulating into L0C.
    fn l0_loop(&mut self, slot_a: usize, slot_b: usize, task: &BlockTask, init: bool) -> Result<(), SyncError> {
        let m_pad = round_up(task.shape.m, ALIGN);
        let n_pad = round_up(task.shape.n, ALIGN);
        let k_pad = round_up(task.shape.k, ALIGN);
        let l1a = self.l1a.begin_consume(slot_a)?;
        let l1b = self.l1b.begin_consume(slot_b)?;
        let l0_stages = self.l0a.len().min(self.l0b.len());
        let mut kk = 0;
        while kk < k_pad {
            let k_len = self.k0.min(k_pad - kk);
            let slot = self.l0_list_id;
            self.l0_list_id = (self.l0_list_id + 1) % l0_stages;

            let dst = self.l0a.begin_fill(slot)?;
            self.copy.l1_to_l0(
                dst,
                &self.l0a_layout,
                l1a,
                &self.l1a_layout,
                Window::new(MatrixCoord::new(0, kk), m_pad, k_len),
                &mut self.counters,
            );
            self.l0a.finish_fill(slot, None)?;
            let dst = self.l0b.begin_fill(slot)?;
            self.copy.l1_to_l0(
                dst,
                &self.l0b_layout,
                l1b,
                &self.l1b_layout,
                Window::new(MatrixCoord::new(kk, 0), k_len, n_pad),
                &mut self.counters,
            );
            self.l0b.finish_fill(slot, None)?;

            let l0a = self.l0a.begin_consume(slot)?;
            let l0b = self.l0b.begin_consume(slot)?;
            self.mma.mmad(
                &mut self.l0c,
                &self.l0c_layout,
                l0a,
                &self.l0a_layout,
                l0b,
                &self.l0b_layout,
                GemmCoord::new(m_pad, n_pad, k_len),
                init && kk == 0,
                &mut self.counters,
            );
            self.l0a.release(slot)?;
            self.l0b.release(slot)?;
            kk += k_len;
        }
        Ok(())
    }

    fn fixpipe(&mut self, c: &GmTensor<'_>, task: &BlockTask, mode: StoreMode) {
        self.copy.l0c_to_gm(
            c,
            &self.l0c,
            &self.l0c_layout,
            Window::new(task.c_origin, task.shape.m, task.shape.n),
            mode,
            &mut self.counters,
        );
    }
}

/// A's and B's windows for the K range `[k_off, k_off + k_len)` of a task.
fn operand_windows(task: &BlockTask, k_off: u32, k_len: u32) -> (Window, Window) {
    (
        Window::new(
            task.a_origin + MatrixCoord::new(0, k_off),
            task.shape.m,
            k_len,
        ),
        Window::new(
            task.b_origin + MatrixCoord::new(k_off, 0),
            k_len,
            task.shape.n,
        ),
    )
}

#[allow(clippy::too_many_arguments)]
fn load_l1<C: TileCopy>(
    copy: &C,
    ring: &mut StageRing<Vec<f32>, L1Tag>,
    layout: &Layout,
    src: &GmTensor<'_>,
    window: Window,
    slot: usize,
    allow_reuse: bool,
    counters: &mut HwCounters,
) -> Result<(), SyncError> {
    let tag = L1Tag::new(src, window);
    if allow_reuse && ring.reuse(slot, tag) {
        trace!("L1 slot {slot} still holds {window:?}");
        return Ok(());
    }
    let buf = ring.begin_fill(slot)?;
    copy.gm_to_l1(buf, layout, src, window, counters);
    ring.finish_fill(slot, Some(tag))
}

/// The first free slot at or after `start`, or `start` itself if none is free (the subsequent
/// fill then reports the conflict).
fn free_slot<K: PartialEq + Copy>(ring: &StageRing<Vec<f32>, K>, start: usize) -> usize {
    free_slot_except(ring, start, usize::MAX)
}

fn free_slot_except<K: PartialEq + Copy>(
    ring: &StageRing<Vec<f32>, K>,
    start: usize,
    except: usize,
) -> usize {
    (0..ring.len())
        .map(|i| (start + i) % ring.len())
        .find(|&s| s != except && ring.state(s) == crate::arch::SlotState::Free)
        .unwrap_or(start)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::GlobalBuffer;
    use crate::platform::PlatformInfo;
    use crate::tile::{CubeMmad, NzTileCopy};
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn naive(a: &[f32], b: &[f32], m: usize, n: usize, k: usize) -> Vec<f32> {
        let mut c = vec![0.0; m * n];
        for i in 0..m {
            for j in 0..n {
                c[i * n + j] = (0..k).map(|p| a[i * k + p] * b[p * n + j]).sum();
            }
        }
        c
    }

    fn operands(m: u32, n: u32, k: u32) -> (Vec<f32>, Vec<f32>) {
        let a = (0..m * k).map(|x| ((x % 7) as f32) - 3.0).collect();
        let b = (0..k * n).map(|x| ((x % 5) as f32) * 0.5).collect();
        (a, b)
    }

    fn engine<'a>(policy: DispatchPolicy, tile: TileShape) -> BlockMmad<'a, NzTileCopy, CubeMmad> {
        let mut res = CoreResource::new(&PlatformInfo::atlas_a2());
        BlockMmad::new(&mut res, tile, Dtype::Float32, policy, NzTileCopy, CubeMmad).unwrap()
    }

    #[test]
    fn test_ragged_block_matches_naive_product() {
        let (m, n, k) = (37u32, 21u32, 300u32);
        let (av, bv) = operands(m, n, k);
        let (abuf, bbuf, cbuf) = (
            GlobalBuffer::from_slice(&av),
            GlobalBuffer::from_slice(&bv),
            GlobalBuffer::zeroed((m * n) as usize),
        );
        let a = GmTensor::new(&abuf, Layout::row_major(m, k), Dtype::Float32);
        let b = GmTensor::new(&bbuf, Layout::row_major(k, n), Dtype::Float32);
        let c = GmTensor::new(&cbuf, Layout::row_major(m, n), Dtype::Float32);
        let tile = TileShape::new(48, 32, 128);
        let mut mmad = engine(DispatchPolicy::pingpong(), tile);
        let task = BlockTask::for_block(GemmCoord::new(0, 0, 0), &tile, GemmCoord::new(m, n, k), 0);
        mmad.run(&a, &b, &c, task, StoreMode::Overwrite).unwrap();
        assert_eq!(cbuf.to_vec(), naive(&av, &bv, m as usize, n as usize, k as usize));
        // Three K tiles: one GM->L1 copy per operand per tile.
        assert_eq!(mmad.counters().gm_to_l1, 6);
        assert_eq!(mmad.counters().fixpipe, 1);
    }

    #[test]
    fn test_shuffle_k_gives_same_result() {
        let (m, n, k) = (16u32, 16u32, 80u32);
        let (av, bv) = operands(m, n, k);
        let abuf = GlobalBuffer::from_slice(&av);
        let bbuf = GlobalBuffer::from_slice(&bv);
        let a = GmTensor::new(&abuf, Layout::row_major(m, k), Dtype::Float32);
        let b = GmTensor::new(&bbuf, Layout::column_major(k, n), Dtype::Float32);
        // B is read column-major here, so build the expected product from the transposed data.
        let b_rm = (0..k)
            .flat_map(|p| (0..n).map(move |j| (p, j)))
            .map(|(p, j)| bv[(j * k + p) as usize])
            .collect::<Vec<_>>();
        let expected = naive(&av, &b_rm, m as usize, n as usize, k as usize);
        let tile = TileShape::new(16, 16, 16);
        for shuffle_k in [false, true] {
            let cbuf = GlobalBuffer::zeroed((m * n) as usize);
            let c = GmTensor::new(&cbuf, Layout::row_major(m, n), Dtype::Float32);
            let policy = DispatchPolicy {
                shuffle_k,
                ..DispatchPolicy::pingpong()
            };
            let mut mmad = engine(policy, tile);
            let task = BlockTask::for_block(GemmCoord::new(0, 0, 0), &tile, GemmCoord::new(m, n, k), 3);
            mmad.run(&a, &b, &c, task, StoreMode::Overwrite).unwrap();
            assert_eq!(cbuf.to_vec(), expected);
        }
    }

    #[test]
    fn test_empty_task_issues_no_hardware_ops() {
        let buf = GlobalBuffer::zeroed(16);
        let t = GmTensor::new(&buf, Layout::row_major(4, 4), Dtype::Float32);
        let tile = TileShape::new(16, 16, 16);
        let mut mmad = engine(DispatchPolicy::pingpong(), tile);
        let task = BlockTask::for_block(GemmCoord::new(0, 0, 0), &tile, GemmCoord::new(0, 4, 4), 0);
        mmad.run(&t, &t, &t, task, StoreMode::Overwrite).unwrap();
        assert_eq!(mmad.counters(), HwCounters::default());
    }

    #[test]
    fn test_submit_defers_until_preload_depth_and_runs_callbacks_in_order() {
        let (m, n, k) = (32u32, 16u32, 16u32);
        let (av, bv) = operands(m, n, k);
        let abuf = GlobalBuffer::from_slice(&av);
        let bbuf = GlobalBuffer::from_slice(&bv);
        let cbuf = GlobalBuffer::zeroed((m * n) as usize);
        let a = GmTensor::new(&abuf, Layout::row_major(m, k), Dtype::Float32);
        let b = GmTensor::new(&bbuf, Layout::row_major(k, n), Dtype::Float32);
        let c = GmTensor::new(&cbuf, Layout::row_major(m, n), Dtype::Float32);
        let tile = TileShape::new(16, 16, 16);
        let stored = AtomicUsize::new(0);
        let mut mmad = engine(DispatchPolicy::preload_async(2, 2), tile);
        for row in 0..2 {
            let task = BlockTask::for_block(GemmCoord::new(row, 0, 0), &tile, GemmCoord::new(16, 16, 16), row);
            let stored = &stored;
            mmad.submit(
                a,
                b,
                c,
                task,
                StoreMode::Overwrite,
                None,
                Some(Box::new(move || {
                    stored.fetch_add(1, Ordering::SeqCst);
                    Ok(())
                })),
            )
            .unwrap();
        }
        assert_eq!(stored.load(Ordering::SeqCst), 0);
        mmad.synchronize_block().unwrap();
        assert_eq!(stored.load(Ordering::SeqCst), 2);
        assert_eq!(cbuf.to_vec(), naive(&av, &bv, m as usize, n as usize, k as usize));
    }

    #[test]
    fn test_prefetch_keeps_shared_operand_resident() {
        // Two output blocks of two K tiles each. The second and third tasks share A's K tile 1.
        let (m, n, k) = (16u32, 32u32, 32u32);
        let (av, bv) = operands(m, n, k);
        let abuf = GlobalBuffer::from_slice(&av);
        let bbuf = GlobalBuffer::from_slice(&bv);
        let cbuf = GlobalBuffer::zeroed((m * n) as usize);
        let a = GmTensor::new(&abuf, Layout::row_major(m, k), Dtype::Float32);
        let b = GmTensor::new(&bbuf, Layout::row_major(k, n), Dtype::Float32);
        let c = GmTensor::new(&cbuf, Layout::row_major(m, n), Dtype::Float32);
        let tile = TileShape::new(16, 16, 16);
        let mut mmad = engine(DispatchPolicy::pingpong(), tile);
        let coords = [
            GemmCoord::new(0, 0, 0),
            GemmCoord::new(0, 0, 1),
            GemmCoord::new(0, 1, 1),
            GemmCoord::new(0, 1, 0),
        ];
        let tasks = coords
            .iter()
            .enumerate()
            .map(|(i, &co)| BlockTask::for_block(co, &tile, GemmCoord::new(16, 16, 16), i as u32))
            .collect::<Vec<_>>();
        for (i, task) in tasks.iter().enumerate() {
            let next = tasks.get(i + 1).copied();
            let (na, nb) = crate::scheduler::need_load_next(coords[i], coords.get(i + 1).copied());
            mmad.run_with_prefetch(&a, &b, &c, *task, next, na, nb).unwrap();
        }
        assert_eq!(cbuf.to_vec(), naive(&av, &bv, m as usize, n as usize, k as usize));
        // A is loaded three times and B four times.
        assert_eq!(mmad.counters().gm_to_l1, 7);
        assert_eq!(mmad.counters().fixpipe, 4);
    }
}
