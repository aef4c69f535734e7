use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};

use crate::common::{ConfigError, Dtype, MatrixCoord};
use crate::utils::{ceil_div, ceil_div_u64, round_up};

/// Rows in one fractal block of the hardware-native layout.
pub const FRACTAL_ROWS: u32 = 16;
/// Bytes in one fractal row. A fractal row holds `FRACTAL_BYTES / dtype.size()` elements.
pub const FRACTAL_BYTES: u32 = 32;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumIter, strum::Display,
)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum LayoutTag {
    RowMajor,
    ColumnMajor,
    /// The hardware-native blocked layout: 16-row fractals, columns of fractals stored one after
    /// another.
    Nz,
}

impl LayoutTag {
    /// Whether an operand stored with this tag must be read transposed relative to row-major.
    pub fn is_transposed(&self) -> bool {
        matches!(self, LayoutTag::ColumnMajor)
    }
}

/// Maps a matrix's logical (row, column) coordinates to element offsets in a buffer.
///
/// A [Layout] pairs a [LayoutTag] with the matrix extents and a stride. For the ND tags the
/// stride is the distance between consecutive rows (row-major) or columns (column-major) and may
/// exceed the contiguous extent. For [LayoutTag::Nz] the stride is the row count padded to a
/// whole number of fractals, so one column of fractals spans `stride * fractal_cols` elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct Layout {
    tag: LayoutTag,
    rows: u32,
    cols: u32,
    stride: u64,
    fractal_cols: u32,
}

impl Layout {
    pub fn row_major(rows: u32, cols: u32) -> Self {
        Layout {
            tag: LayoutTag::RowMajor,
            rows,
            cols,
            stride: cols.into(),
            fractal_cols: 0,
        }
    }

    pub fn column_major(rows: u32, cols: u32) -> Self {
        Layout {
            tag: LayoutTag::ColumnMajor,
            rows,
            cols,
            stride: rows.into(),
            fractal_cols: 0,
        }
    }

    /// A densely packed ND layout for the given tag.
    pub fn dense(tag: LayoutTag, rows: u32, cols: u32, dtype: Dtype) -> Self {
        match tag {
            LayoutTag::RowMajor => Self::row_major(rows, cols),
            LayoutTag::ColumnMajor => Self::column_major(rows, cols),
            LayoutTag::Nz => Self::nz(rows, cols, dtype),
        }
    }

    pub fn nz(rows: u32, cols: u32, dtype: Dtype) -> Self {
        Layout {
            tag: LayoutTag::Nz,
            rows,
            cols,
            stride: round_up(rows, FRACTAL_ROWS).into(),
            fractal_cols: FRACTAL_BYTES / u32::from(dtype.size()),
        }
    }

    /// An ND layout with an explicit stride, as supplied by a caller.
    ///
    /// The operand name is only used for error reporting.
    pub fn with_stride(
        operand: &'static str,
        tag: LayoutTag,
        rows: u32,
        cols: u32,
        stride: i64,
    ) -> Result<Self, ConfigError> {
        let mut layout = match tag {
            LayoutTag::RowMajor => Self::row_major(rows, cols),
            LayoutTag::ColumnMajor => Self::column_major(rows, cols),
            LayoutTag::Nz => return Err(ConfigError::HostNzLayout(operand)),
        };
        let extent = layout.contiguous_extent();
        match u64::try_from(stride) {
            Ok(s) if s >= u64::from(extent) => {
                layout.stride = s;
                Ok(layout)
            }
            _ => Err(ConfigError::BadStride {
                operand,
                stride,
                extent,
            }),
        }
    }

    pub fn tag(&self) -> LayoutTag {
        self.tag
    }

    pub fn rows(&self) -> u32 {
        self.rows
    }

    pub fn cols(&self) -> u32 {
        self.cols
    }

    pub fn stride(&self) -> u64 {
        self.stride
    }

    /// Elements per fractal row; zero for ND layouts.
    pub fn fractal_cols(&self) -> u32 {
        self.fractal_cols
    }

    /// The extent of the dimension that is contiguous in memory.
    pub fn contiguous_extent(&self) -> u32 {
        match self.tag {
            LayoutTag::RowMajor => self.cols,
            LayoutTag::ColumnMajor => self.rows,
            LayoutTag::Nz => self.fractal_cols,
        }
    }

    pub fn offset(&self, coord: MatrixCoord) -> u64 {
        debug_assert!(coord.row < self.rows && coord.column < self.cols);
        let row = u64::from(coord.row);
        let col = u64::from(coord.column);
        match self.tag {
            LayoutTag::RowMajor => row * self.stride + col,
            LayoutTag::ColumnMajor => col * self.stride + row,
            LayoutTag::Nz => {
                let c0 = u64::from(self.fractal_cols);
                (col / c0) * self.stride * c0 + row * c0 + col % c0
            }
        }
    }

    /// The number of elements a buffer must hold to back every coordinate of this layout.
    pub fn span(&self) -> u64 {
        if self.rows == 0 || self.cols == 0 {
            return 0;
        }
        match self.tag {
            LayoutTag::RowMajor => u64::from(self.rows - 1) * self.stride + u64::from(self.cols),
            LayoutTag::ColumnMajor => u64::from(self.cols - 1) * self.stride + u64::from(self.rows),
            LayoutTag::Nz => {
                let c0 = u64::from(self.fractal_cols);
                ceil_div_u64(self.cols.into(), c0) * self.stride * c0
            }
        }
    }

    /// The number of contiguous bursts needed to move a `rows x cols` window starting at
    /// `origin`.
    pub fn bursts(&self, origin: MatrixCoord, rows: u32, cols: u32) -> u64 {
        if rows == 0 || cols == 0 {
            return 0;
        }
        match self.tag {
            LayoutTag::RowMajor => {
                if origin.column == 0 && u64::from(cols) == self.stride {
                    1
                } else {
                    rows.into()
                }
            }
            LayoutTag::ColumnMajor => {
                if origin.row == 0 && u64::from(rows) == self.stride {
                    1
                } else {
                    cols.into()
                }
            }
            LayoutTag::Nz => {
                let c0 = self.fractal_cols;
                let first = origin.column / c0;
                let last = (origin.column + cols - 1) / c0;
                u64::from(last - first + 1)
            }
        }
    }

    /// The number of fractal columns covering this layout's columns. Zero for ND layouts.
    pub fn fractal_col_count(&self) -> u32 {
        if self.fractal_cols == 0 {
            0
        } else {
            ceil_div(self.cols, self.fractal_cols)
        }
    }
}

impl Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}[{}x{}, stride {}]",
            self.tag, self.rows, self.cols, self.stride
        )
    }
}

/// Rewrite a matrix stored in one layout into another layout with the same extents.
///
/// Positions of `to` not covered by a logical coordinate (fractal padding) are zero.
pub fn transcode(src: &[f32], from: &Layout, to: &Layout) -> Vec<f32> {
    assert_eq!((from.rows, from.cols), (to.rows, to.cols));
    let mut dst = vec![0.0; to.span() as usize];
    for row in 0..from.rows {
        for col in 0..from.cols {
            let c = MatrixCoord::new(row, col);
            dst[to.offset(c) as usize] = src[from.offset(c) as usize];
        }
    }
    dst
}

#[cfg(test)]
mod tests {
    use super::*;
    use itertools::Itertools;
    use proptest::prelude::*;

    #[test]
    fn test_nz_offsets_walk_fractal_columns() {
        // f32: 8 elements per fractal row, rows padded to 16.
        let l = Layout::nz(20, 10, Dtype::Float32);
        assert_eq!(l.stride(), 32);
        assert_eq!(l.fractal_cols(), 8);
        assert_eq!(l.offset(MatrixCoord::new(0, 0)), 0);
        assert_eq!(l.offset(MatrixCoord::new(0, 7)), 7);
        assert_eq!(l.offset(MatrixCoord::new(1, 0)), 8);
        assert_eq!(l.offset(MatrixCoord::new(0, 8)), 32 * 8);
        assert_eq!(l.span(), 2 * 32 * 8);
    }

    #[test]
    fn test_stride_smaller_than_extent_rejected() {
        assert!(matches!(
            Layout::with_stride("A", LayoutTag::RowMajor, 4, 8, 7),
            Err(ConfigError::BadStride { operand: "A", .. })
        ));
        assert!(matches!(
            Layout::with_stride("B", LayoutTag::Nz, 4, 8, 8),
            Err(ConfigError::HostNzLayout("B"))
        ));
        let l = Layout::with_stride("C", LayoutTag::ColumnMajor, 4, 8, 6).unwrap();
        assert_eq!(l.span(), 7 * 6 + 4);
    }

    #[test]
    fn test_row_major_full_width_window_is_one_burst() {
        let l = Layout::row_major(64, 32);
        assert_eq!(l.bursts(MatrixCoord::new(16, 0), 16, 32), 1);
        assert_eq!(l.bursts(MatrixCoord::new(16, 8), 16, 8), 16);
    }

    proptest! {
        #[test]
        fn test_offsets_are_injective_and_in_span(
            rows in 1u32..40, cols in 1u32..40, tag: LayoutTag, dtype: crate::common::Dtype
        ) {
            let l = Layout::dense(tag, rows, cols, dtype);
            let offsets = (0..rows)
                .cartesian_product(0..cols)
                .map(|(r, c)| l.offset(MatrixCoord::new(r, c)))
                .collect::<Vec<_>>();
            prop_assert!(offsets.iter().all(|&o| o < l.span()));
            prop_assert_eq!(offsets.iter().unique().count(), offsets.len());
        }

        #[test]
        fn test_transcode_preserves_logical_values(rows in 1u32..24, cols in 1u32..24) {
            let src_layout = Layout::row_major(rows, cols);
            let src = (0..rows * cols).map(|x| x as f32).collect::<Vec<_>>();
            let nz = Layout::nz(rows, cols, Dtype::Float16);
            let packed = transcode(&src, &src_layout, &nz);
            let back = transcode(&packed, &nz, &src_layout);
            prop_assert_eq!(back, src);
        }
    }
}
