//! Tile-level data movement and compute. A block-level engine is generic over these, so a
//! different copy path (say, for a new source layout) slots in without touching the pipeline.

use crate::arch::{GlobalBuffer, HwCounters};
use crate::common::{Dtype, GemmCoord, MatrixCoord};
use crate::layout::Layout;

mod copy;
mod mmad;

pub use copy::NzTileCopy;
pub use mmad::CubeMmad;

/// A matrix in global memory.
#[derive(Clone, Copy)]
pub struct GmTensor<'a> {
    pub buf: &'a GlobalBuffer,
    pub layout: Layout,
    pub dtype: Dtype,
}

impl<'a> GmTensor<'a> {
    pub fn new(buf: &'a GlobalBuffer, layout: Layout, dtype: Dtype) -> Self {
        GmTensor { buf, layout, dtype }
    }

    pub fn load(&self, coord: MatrixCoord) -> f32 {
        self.buf.load(self.layout.offset(coord))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreMode {
    Overwrite,
    /// Accumulate into the destination. The destination must hold f32.
    AtomicAdd,
}

/// A window of `rows x cols` elements starting at `origin`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub origin: MatrixCoord,
    pub rows: u32,
    pub cols: u32,
}

impl Window {
    pub fn new(origin: MatrixCoord, rows: u32, cols: u32) -> Self {
        Window { origin, rows, cols }
    }

    pub fn is_empty(&self) -> bool {
        self.rows == 0 || self.cols == 0
    }
}

pub trait TileCopy: Sync {
    /// Copy a GM window into an L1 buffer laid out as `dst_layout`, starting at its origin.
    /// Every element of `dst_layout` outside the window becomes zero. Values are rounded to the
    /// source dtype.
    fn gm_to_l1(
        &self,
        dst: &mut [f32],
        dst_layout: &Layout,
        src: &GmTensor<'_>,
        window: Window,
        counters: &mut HwCounters,
    );

    /// Copy a window of an L1 buffer into an L0 buffer, starting at its origin.
    fn l1_to_l0(
        &self,
        dst: &mut [f32],
        dst_layout: &Layout,
        src: &[f32],
        src_layout: &Layout,
        window: Window,
        counters: &mut HwCounters,
    );

    /// Write the top-left `window.rows x window.cols` of an accumulator tile to GM at
    /// `window.origin`, rounding to the destination dtype.
    fn l0c_to_gm(
        &self,
        dst: &GmTensor<'_>,
        src: &[f32],
        src_layout: &Layout,
        window: Window,
        mode: StoreMode,
        counters: &mut HwCounters,
    );
}

pub trait TileMmad: Sync {
    /// `c[0..m, 0..n] (+)= a[0..m, 0..k] * b[0..k, 0..n]` in f32. With `init` the accumulator is
    /// overwritten instead of accumulated into.
    #[allow(clippy::too_many_arguments)]
    fn mmad(
        &self,
        c: &mut [f32],
        c_layout: &Layout,
        a: &[f32],
        a_layout: &Layout,
        b: &[f32],
        b_layout: &Layout,
        shape: GemmCoord,
        init: bool,
        counters: &mut HwCounters,
    );
}
