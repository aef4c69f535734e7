use super::{GmTensor, StoreMode, TileCopy, Window};
use crate::arch::HwCounters;
use crate::common::{Dtype, MatrixCoord};
use crate::layout::Layout;

/// Moves tiles through the hierarchy element by element, addressing every buffer through its
/// [Layout]. L1 buffers are normally Nz; L0 buffers are normally row-major.
#[derive(Debug, Clone, Copy, Default)]
pub struct NzTileCopy;

impl TileCopy for NzTileCopy {
    fn gm_to_l1(
        &self,
        dst: &mut [f32],
        dst_layout: &Layout,
        src: &GmTensor<'_>,
        window: Window,
        counters: &mut HwCounters,
    ) {
        dst.fill(0.0);
        if window.is_empty() {
            return;
        }
        debug_assert!(window.rows <= dst_layout.rows() && window.cols <= dst_layout.cols());
        for r in 0..window.rows {
            for c in 0..window.cols {
                let value = src.load(window.origin + MatrixCoord::new(r, c));
                dst[dst_layout.offset(MatrixCoord::new(r, c)) as usize] = src.dtype.round(value);
            }
        }
        counters.gm_to_l1 += 1;
        counters.gm_bursts += src.layout.bursts(window.origin, window.rows, window.cols);
    }

    fn l1_to_l0(
        &self,
        dst: &mut [f32],
        dst_layout: &Layout,
        src: &[f32],
        src_layout: &Layout,
        window: Window,
        counters: &mut HwCounters,
    ) {
        if window.is_empty() {
            return;
        }
        for r in 0..window.rows {
            for c in 0..window.cols {
                let from = src_layout.offset(window.origin + MatrixCoord::new(r, c));
                dst[dst_layout.offset(MatrixCoord::new(r, c)) as usize] = src[from as usize];
            }
        }
        counters.l1_to_l0 += 1;
    }

    fn l0c_to_gm(
        &self,
        dst: &GmTensor<'_>,
        src: &[f32],
        src_layout: &Layout,
        window: Window,
        mode: StoreMode,
        counters: &mut HwCounters,
    ) {
        if window.is_empty() {
            return;
        }
        debug_assert!(mode == StoreMode::Overwrite || dst.dtype == Dtype::Float32);
        for r in 0..window.rows {
            for c in 0..window.cols {
                let value = src[src_layout.offset(MatrixCoord::new(r, c)) as usize];
                let at = dst.layout.offset(window.origin + MatrixCoord::new(r, c));
                match mode {
                    StoreMode::Overwrite => dst.buf.store(at, dst.dtype.round(value)),
                    StoreMode::AtomicAdd => dst.buf.atomic_add(at, value),
                }
            }
        }
        counters.fixpipe += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::GlobalBuffer;

    #[test]
    fn test_gm_to_l1_zero_pads_and_counts_bursts() {
        // 4 x 6 row-major source; copy the 3 x 2 window at (1, 3) into a 16 x 16 Nz tile.
        let values = (0..24).map(|x| x as f32).collect::<Vec<_>>();
        let buf = GlobalBuffer::from_slice(&values);
        let src = GmTensor::new(&buf, Layout::row_major(4, 6), Dtype::Float32);
        let l1 = Layout::nz(16, 16, Dtype::Float32);
        let mut dst = vec![7.0; l1.span() as usize];
        let mut counters = HwCounters::default();
        NzTileCopy.gm_to_l1(
            &mut dst,
            &l1,
            &src,
            Window::new(MatrixCoord::new(1, 3), 3, 2),
            &mut counters,
        );
        assert_eq!(dst[l1.offset(MatrixCoord::new(0, 0)) as usize], 9.0);
        assert_eq!(dst[l1.offset(MatrixCoord::new(2, 1)) as usize], 22.0);
        assert_eq!(dst[l1.offset(MatrixCoord::new(3, 0)) as usize], 0.0);
        assert_eq!(dst.iter().filter(|&&v| v != 0.0).count(), 6);
        assert_eq!(counters.gm_to_l1, 1);
        assert_eq!(counters.gm_bursts, 3);
    }

    #[test]
    fn test_store_rounds_to_destination_dtype() {
        let buf = GlobalBuffer::zeroed(4);
        let dst = GmTensor::new(&buf, Layout::row_major(2, 2), Dtype::Bfloat16);
        let acc = Layout::row_major(16, 16);
        let mut src = vec![0.0; 256];
        src[0] = 1.0 + 1.0 / 512.0;
        src[17] = 3.0;
        let mut counters = HwCounters::default();
        NzTileCopy.l0c_to_gm(
            &dst,
            &src,
            &acc,
            Window::new(MatrixCoord::new(0, 0), 2, 2),
            StoreMode::Overwrite,
            &mut counters,
        );
        assert_eq!(buf.to_vec(), vec![1.0, 0.0, 0.0, 3.0]);
        assert_eq!(counters.fixpipe, 1);
    }
}
