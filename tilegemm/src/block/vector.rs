use crate::arch::{CoreResource, HwCounters};
use crate::common::MatrixCoord;
use crate::memorylimits::{CapacityError, ACCUMULATOR_BYTES};
use crate::platform::MemoryLevel;
use crate::tile::{GmTensor, Window};
use crate::utils::{ceil_div, ceil_div_u64};

/// A vector core's unified buffer. Every vector pass streams its data through UB in chunks no
/// larger than the buffer.
pub struct VectorCore {
    ub: Vec<f32>,
    counters: HwCounters,
}

impl VectorCore {
    /// Reserve the whole UB of `resource` as f32 elements.
    pub fn new(resource: &mut CoreResource) -> Result<Self, CapacityError> {
        let elements = resource.platform().ub_size as u64 / ACCUMULATOR_BYTES;
        let ub = resource.alloc(MemoryLevel::UB, elements as usize, ACCUMULATOR_BYTES)?;
        Ok(VectorCore {
            ub,
            counters: HwCounters::default(),
        })
    }

    #[cfg(test)]
    pub(crate) fn with_capacity(elements: usize) -> Self {
        VectorCore {
            ub: vec![0.0; elements],
            counters: HwCounters::default(),
        }
    }

    pub fn counters(&self) -> HwCounters {
        self.counters
    }

    pub fn ub_len(&self) -> usize {
        self.ub.len()
    }

    /// Stream `window` of `src` through UB, letting `f` transform each chunk, and store the
    /// result into `dst` at the same position relative to `dst_origin`.
    ///
    /// `f` receives the chunk (row-major, `cols` wide), the chunk's first row and column within
    /// the window, and its column count.
    pub(crate) fn stream(
        &mut self,
        src: &GmTensor<'_>,
        window: Window,
        dst: &GmTensor<'_>,
        dst_origin: MatrixCoord,
        mut f: impl FnMut(&mut [f32], MatrixCoord, u32),
    ) {
        if window.is_empty() {
            return;
        }
        let col_chunk = window.cols.min(self.ub.len() as u32).max(1);
        let row_chunk = (self.ub.len() as u32 / col_chunk).max(1);
        let mut r0 = 0;
        while r0 < window.rows {
            let rows = row_chunk.min(window.rows - r0);
            let mut c0 = 0;
            while c0 < window.cols {
                let cols = col_chunk.min(window.cols - c0);
                let chunk = &mut self.ub[..(rows * cols) as usize];
                for r in 0..rows {
                    for c in 0..cols {
                        let at = MatrixCoord::new(r0 + r, c0 + c);
                        chunk[(r * cols + c) as usize] = src.dtype.round(src.load(window.origin + at));
                    }
                }
                f(chunk, MatrixCoord::new(r0, c0), cols);
                for r in 0..rows {
                    for c in 0..cols {
                        let at = dst.layout.offset(dst_origin + MatrixCoord::new(r0 + r, c0 + c));
                        dst.buf.store(at, dst.dtype.round(chunk[(r * cols + c) as usize]));
                    }
                }
                self.counters.vector += 1;
                c0 += cols;
            }
            r0 += rows;
        }
    }

    /// Sum `slices` equally sized partial results stored back to back in `partials` and write
    /// the total to `dst`. Vector core `aiv_id` of `aiv_num` handles every `aiv_num`-th chunk.
    pub fn reduce_add(
        &mut self,
        partials: &GmTensor<'_>,
        slices: u32,
        dst: &GmTensor<'_>,
        aiv_id: u32,
        aiv_num: u32,
    ) {
        let (m, n) = (dst.layout.rows(), dst.layout.cols());
        let slice_len = u64::from(m) * u64::from(n);
        let chunk_len = self.ub.len() as u64;
        let chunks = ceil_div_u64(slice_len, chunk_len);
        let mut chunk_idx = u64::from(aiv_id);
        while chunk_idx < chunks {
            let start = chunk_idx * chunk_len;
            let len = chunk_len.min(slice_len - start);
            let acc = &mut self.ub[..len as usize];
            for (i, v) in acc.iter_mut().enumerate() {
                *v = partials.buf.load(start + i as u64);
            }
            for s in 1..u64::from(slices) {
                for (i, v) in acc.iter_mut().enumerate() {
                    *v += partials.buf.load(s * slice_len + start + i as u64);
                }
            }
            for (i, v) in acc.iter().enumerate() {
                let idx = start + i as u64;
                let coord = MatrixCoord::new((idx / u64::from(n)) as u32, (idx % u64::from(n)) as u32);
                dst.buf.store(dst.layout.offset(coord), dst.dtype.round(*v));
            }
            self.counters.vector += 1;
            chunk_idx += u64::from(aiv_num);
        }
    }

    /// Sum the `rows x cols` windows of `partials` starting at each of `origins` and store the
    /// total to `dst` at `dst_origin`.
    pub fn sum_windows(
        &mut self,
        partials: &GmTensor<'_>,
        origins: &[MatrixCoord],
        rows: u32,
        cols: u32,
        dst: &GmTensor<'_>,
        dst_origin: MatrixCoord,
    ) {
        let Some((first, rest)) = origins.split_first() else {
            return;
        };
        let window = Window::new(*first, rows, cols);
        self.stream(partials, window, dst, dst_origin, |chunk, at, width| {
            for (i, v) in chunk.iter_mut().enumerate() {
                let offset = at + MatrixCoord::new(i as u32 / width, i as u32 % width);
                *v += rest.iter().map(|o| partials.load(*o + offset)).sum::<f32>();
            }
        });
    }
}

/// The rows of a `rows`-row tile handled by sub-block `sub_idx` of `sub_num`: contiguous halves
/// (or thirds, ...) with the last one possibly short or empty.
pub fn sub_block_rows(rows: u32, sub_idx: u32, sub_num: u32) -> (u32, u32) {
    let per = ceil_div(rows, sub_num);
    let start = (sub_idx * per).min(rows);
    (start, per.min(rows - start))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::GlobalBuffer;
    use crate::common::Dtype;
    use crate::layout::Layout;

    #[test]
    fn test_reduce_add_sums_slices_across_vector_cores() {
        // Three 2 x 3 slices; C has a padded row stride.
        let partials = (0..18).map(|x| x as f32).collect::<Vec<_>>();
        let pbuf = GlobalBuffer::from_slice(&partials);
        let p = GmTensor::new(&pbuf, Layout::row_major(6, 3), Dtype::Float32);
        let cbuf = GlobalBuffer::zeroed(2 * 4);
        let c_layout = Layout::with_stride("C", crate::layout::LayoutTag::RowMajor, 2, 3, 4).unwrap();
        let c = GmTensor::new(&cbuf, c_layout, Dtype::Float32);
        for aiv in 0..2 {
            let mut v = VectorCore::with_capacity(4);
            v.reduce_add(&p, 3, &c, aiv, 2);
            assert_eq!(v.counters().vector, 1);
        }
        assert_eq!(
            cbuf.to_vec(),
            vec![18.0, 21.0, 24.0, 0.0, 27.0, 30.0, 33.0, 0.0]
        );
    }

    #[test]
    fn test_sum_windows_adds_tiles_into_offset_window() {
        // Three 2 x 2 tiles stacked in a 6 x 2 workspace.
        let ws = (0..12).map(|x| x as f32).collect::<Vec<_>>();
        let wbuf = GlobalBuffer::from_slice(&ws);
        let w = GmTensor::new(&wbuf, Layout::row_major(6, 2), Dtype::Float32);
        let cbuf = GlobalBuffer::zeroed(3 * 3);
        let c = GmTensor::new(&cbuf, Layout::row_major(3, 3), Dtype::Float32);
        let origins = [MatrixCoord::new(0, 0), MatrixCoord::new(4, 0)];
        let mut v = VectorCore::with_capacity(3);
        v.sum_windows(&w, &origins, 2, 2, &c, MatrixCoord::new(1, 1));
        assert_eq!(
            cbuf.to_vec(),
            vec![0.0, 0.0, 0.0, 0.0, 8.0, 10.0, 0.0, 12.0, 14.0]
        );
        v.sum_windows(&w, &[], 2, 2, &c, MatrixCoord::new(0, 0));
        assert_eq!(cbuf.to_vec()[0], 0.0);
    }

    #[test]
    fn test_stream_chunks_wide_windows() {
        let src_vals = (0..40).map(|x| x as f32).collect::<Vec<_>>();
        let sbuf = GlobalBuffer::from_slice(&src_vals);
        let src = GmTensor::new(&sbuf, Layout::row_major(4, 10), Dtype::Float32);
        let dbuf = GlobalBuffer::zeroed(40);
        let dst = GmTensor::new(&dbuf, Layout::row_major(4, 10), Dtype::Float32);
        let mut v = VectorCore::with_capacity(8);
        v.stream(
            &src,
            Window::new(MatrixCoord::new(0, 0), 4, 10),
            &dst,
            MatrixCoord::new(0, 0),
            |chunk, _, _| chunk.iter_mut().for_each(|x| *x *= 2.0),
        );
        assert_eq!(dbuf.to_vec(), src_vals.iter().map(|x| x * 2.0).collect::<Vec<_>>());
        // 8-wide then 2-wide column chunks, one row each.
        assert_eq!(v.counters().vector, 8);
    }

    #[test]
    fn test_sub_block_rows_split() {
        assert_eq!(sub_block_rows(33, 0, 2), (0, 17));
        assert_eq!(sub_block_rows(33, 1, 2), (17, 16));
        assert_eq!(sub_block_rows(1, 1, 2), (1, 0));
    }
}
