use super::TileMmad;
use crate::arch::HwCounters;
use crate::common::GemmCoord;
use crate::layout::{Layout, LayoutTag};

/// The cube unit: multiplies row-major L0A and L0B tiles into a row-major f32 L0C tile.
#[derive(Debug, Clone, Copy, Default)]
pub struct CubeMmad;

impl TileMmad for CubeMmad {
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
    ) {
        debug_assert!([a_layout, b_layout, c_layout]
            .iter()
            .all(|l| l.tag() == LayoutTag::RowMajor));
        let (m, n, k) = (shape.m as usize, shape.n as usize, shape.k as usize);
        let (lda, ldb, ldc) = (
            a_layout.stride() as usize,
            b_layout.stride() as usize,
            c_layout.stride() as usize,
        );
        if init {
            for i in 0..m {
                c[i * ldc..i * ldc + n].fill(0.0);
            }
        }
        for i in 0..m {
            let c_row = &mut c[i * ldc..i * ldc + n];
            for p in 0..k {
                let a_ip = a[i * lda + p];
                if a_ip == 0.0 {
                    continue;
                }
                let b_row = &b[p * ldb..p * ldb + n];
                for (cv, bv) in c_row.iter_mut().zip(b_row) {
                    *cv += a_ip * bv;
                }
            }
        }
        counters.mmad += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_then_accumulate() {
        let a_layout = Layout::row_major(2, 3);
        let b_layout = Layout::row_major(3, 2);
        let c_layout = Layout::row_major(2, 2);
        let a = [1.0, 2.0, 3.0, 4.0, 5.0, 6.0];
        let b = [1.0, 0.0, 0.0, 1.0, 1.0, 1.0];
        let mut c = [99.0; 4];
        let mut counters = HwCounters::default();
        let shape = GemmCoord::new(2, 2, 3);
        CubeMmad.mmad(&mut c, &c_layout, &a, &a_layout, &b, &b_layout, shape, true, &mut counters);
        assert_eq!(c, [4.0, 5.0, 10.0, 11.0]);
        CubeMmad.mmad(&mut c, &c_layout, &a, &a_layout, &b, &b_layout, shape, false, &mut counters);
        assert_eq!(c, [8.0, 10.0, 20.0, 22.0]);
        assert_eq!(counters.mmad, 2);
    }
}
