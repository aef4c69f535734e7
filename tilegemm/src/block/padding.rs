//! Vector-core passes that copy an operand into a better-aligned workspace copy before the cube
//! cores run, or copy a padded result back out afterwards.

use super::vector::VectorCore;
use crate::common::{Dtype, MatrixCoord};
use crate::layout::{Layout, LayoutTag};
use crate::tile::{GmTensor, Window};
use crate::utils::{ceil_div, round_up};

/// Rows per padding task.
const TASK_ROWS: u32 = 16;
/// Bytes of one padding task.
const TASK_BYTES: u32 = 48 * 1024;
/// Row strides of ND-padded buffers are multiples of this many bytes.
const ND_ALIGN_BYTES: u32 = 512;

/// An ND layout in `tag`'s major order whose stride is a whole number of 512-byte bursts.
/// [LayoutTag::Nz] is padded as row-major.
pub fn padded_nd_layout(tag: LayoutTag, rows: u32, cols: u32, dtype: Dtype) -> Layout {
    let align = ND_ALIGN_BYTES / u32::from(dtype.size());
    match tag {
        LayoutTag::ColumnMajor => Layout::with_stride("workspace", tag, rows, cols, round_up(rows, align).into())
            .unwrap_or_else(|_| Layout::column_major(rows, cols)),
        LayoutTag::RowMajor | LayoutTag::Nz => {
            Layout::with_stride("workspace", LayoutTag::RowMajor, rows, cols, round_up(cols, align).into())
                .unwrap_or_else(|_| Layout::row_major(rows, cols))
        }
    }
}

/// The windows of a `rows x cols` matrix handled by vector core `aiv_id` of `aiv_num`.
fn tasks(rows: u32, cols: u32, dtype: Dtype, aiv_id: u32, aiv_num: u32) -> impl Iterator<Item = Window> {
    let task_cols = (TASK_BYTES / u32::from(dtype.size()) / TASK_ROWS).min(cols);
    let col_tasks = ceil_div(cols, task_cols);
    let total = ceil_div(rows, TASK_ROWS) * col_tasks;
    (aiv_id..total).step_by(aiv_num as usize).map(move |t| {
        let (r, c) = ((t / col_tasks) * TASK_ROWS, (t % col_tasks) * task_cols);
        Window::new(
            MatrixCoord::new(r, c),
            TASK_ROWS.min(rows - r),
            task_cols.min(cols - c),
        )
    })
}

impl VectorCore {
    /// Copy all of `src` into `dst`, which has the same extents but a different layout (an Nz
    /// or stride-padded workspace). Padding positions of `dst` are left untouched.
    pub fn pad_operand(&mut self, src: &GmTensor<'_>, dst: &GmTensor<'_>, aiv_id: u32, aiv_num: u32) {
        debug_assert_eq!(
            (src.layout.rows(), src.layout.cols()),
            (dst.layout.rows(), dst.layout.cols())
        );
        for w in tasks(src.layout.rows(), src.layout.cols(), src.dtype, aiv_id, aiv_num) {
            self.stream(src, w, dst, w.origin, |_, _, _| {});
        }
    }

    /// Copy a padded staging buffer into the caller's output, casting to its dtype.
    pub fn remove_padding(&mut self, src: &GmTensor<'_>, dst: &GmTensor<'_>, aiv_id: u32, aiv_num: u32) {
        self.pad_operand(src, dst, aiv_id, aiv_num);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::arch::GlobalBuffer;
    use crate::layout::transcode;
    use std::collections::HashSet;

    #[test]
    fn test_tasks_cover_matrix_once() {
        let (rows, cols) = (70, 1000);
        let mut seen = HashSet::new();
        for aiv in 0..3 {
            for w in tasks(rows, cols, Dtype::Float32, aiv, 3) {
                for r in 0..w.rows {
                    for c in 0..w.cols {
                        assert!(seen.insert((w.origin.row + r, w.origin.column + c)));
                    }
                }
            }
        }
        assert_eq!(seen.len(), (rows * cols) as usize);
    }

    #[test]
    fn test_pad_to_nz_matches_transcode() {
        let (rows, cols) = (37, 45);
        let values = (0..rows * cols).map(|x| (x % 11) as f32).collect::<Vec<_>>();
        let src_layout = Layout::column_major(rows, cols);
        let sbuf = GlobalBuffer::from_slice(&values);
        let src = GmTensor::new(&sbuf, src_layout, Dtype::Float16);
        let nz = Layout::nz(rows, cols, Dtype::Float16);
        let dbuf = GlobalBuffer::zeroed(nz.span() as usize);
        let dst = GmTensor::new(&dbuf, nz, Dtype::Float16);
        for aiv in 0..2 {
            VectorCore::with_capacity(1024).pad_operand(&src, &dst, aiv, 2);
        }
        assert_eq!(dbuf.to_vec(), transcode(&values, &src_layout, &nz));
    }

    #[test]
    fn test_padded_nd_stride() {
        assert_eq!(padded_nd_layout(LayoutTag::RowMajor, 4, 100, Dtype::Float32).stride(), 128);
        assert_eq!(padded_nd_layout(LayoutTag::RowMajor, 4, 300, Dtype::Float16).stride(), 512);
        let col = padded_nd_layout(LayoutTag::ColumnMajor, 300, 4, Dtype::Float16);
        assert_eq!((col.tag(), col.stride()), (LayoutTag::ColumnMajor, 512));
    }
}
