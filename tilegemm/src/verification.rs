//! Checks simulated launches against a host reference product.

use half::{bf16, f16};
use ndarray::{linalg::general_mat_mul, prelude::*};
use num_traits::Float;
use rand::{rngs::StdRng, Rng, SeedableRng};

use crate::arch::GlobalBuffer;
use crate::block::Epilogue;
use crate::common::{Dtype, MatrixCoord};
use crate::kernel::{LaunchError, LaunchReport};
use crate::layout::Layout;
use crate::plan::GemmPlan;

#[derive(thiserror::Error, Debug)]
pub enum VerifyError {
    #[error(transparent)]
    Launch(#[from] LaunchError),
    #[error("C[{row}, {col}] is {actual}, expected {expected} (tolerance {tolerance})")]
    Mismatch {
        row: u32,
        col: u32,
        actual: f32,
        expected: f32,
        tolerance: f32,
    },
}

/// Gather the logical matrix stored in `buf` under `layout`.
pub fn to_array(buf: &[f32], layout: &Layout) -> Array2<f32> {
    Array2::from_shape_fn(
        (layout.rows() as usize, layout.cols() as usize),
        |(i, j)| buf[layout.offset(MatrixCoord::new(i as u32, j as u32)) as usize],
    )
}

/// `round(epilogue(A * B))`, accumulated in f32.
pub fn reference_gemm(
    a: &[f32],
    layout_a: &Layout,
    b: &[f32],
    layout_b: &Layout,
    epilogue: Option<&Epilogue>,
    dtype_c: Dtype,
) -> Array2<f32> {
    let a = to_array(a, layout_a);
    let b = to_array(b, layout_b);
    let mut c = Array2::<f32>::zeros((a.nrows(), b.ncols()));
    general_mat_mul(1.0, &a, &b, 0.0, &mut c);
    for ((_, j), v) in c.indexed_iter_mut() {
        if let Some(ep) = epilogue {
            *v = ep.apply(*v, j as u32);
        }
        *v = dtype_c.round(*v);
    }
    c
}

fn epsilon(dtype: Dtype) -> f32 {
    match dtype {
        Dtype::Float16 => <f16 as Float>::epsilon().to_f32(),
        Dtype::Bfloat16 => <bf16 as Float>::epsilon().to_f32(),
        Dtype::Float32 => <f32 as Float>::epsilon(),
    }
}

/// Allowed absolute error for an output element: two ulps of the output type plus f32
/// accumulation drift over `k` products of magnitude at most one.
pub fn tolerance(expected: f32, dtype_c: Dtype, k: u32) -> f32 {
    2.0 * epsilon(dtype_c) * expected.abs().max(1.0) + 4.0 * k as f32 * f32::EPSILON
}

/// Compare the logical contents of `actual` with `expected`, reporting the first element out of
/// tolerance.
pub fn compare(
    actual: &[f32],
    layout: &Layout,
    expected: &Array2<f32>,
    dtype_c: Dtype,
    k: u32,
) -> Result<(), VerifyError> {
    for ((i, j), &e) in expected.indexed_iter() {
        let (row, col) = (i as u32, j as u32);
        let got = actual[layout.offset(MatrixCoord::new(row, col)) as usize];
        let tol = tolerance(e, dtype_c, k);
        if !((got - e).abs() <= tol) {
            return Err(VerifyError::Mismatch {
                row,
                col,
                actual: got,
                expected: e,
                tolerance: tol,
            });
        }
    }
    Ok(())
}

/// A buffer backing `layout` with uniform values in `[-1, 1)` rounded to `dtype`. Positions no
/// coordinate maps to stay zero.
pub fn random_operand<R: Rng>(layout: &Layout, dtype: Dtype, rng: &mut R) -> Vec<f32> {
    let mut buf = vec![0.0; layout.span() as usize];
    for row in 0..layout.rows() {
        for col in 0..layout.cols() {
            let at = layout.offset(MatrixCoord::new(row, col)) as usize;
            buf[at] = dtype.round(rng.gen_range(-1.0..1.0));
        }
    }
    buf
}

/// Run `plan` on random operands drawn from `seed` and check C against the reference.
pub fn verify_plan(plan: &GemmPlan, seed: u64) -> Result<LaunchReport, VerifyError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let [la, lb, lc] = *plan.layouts();
    let desc = plan.desc();
    let a = random_operand(&la, desc.dtype, &mut rng);
    let b = random_operand(&lb, desc.dtype, &mut rng);
    let c = GlobalBuffer::zeroed(lc.span() as usize);
    let report = plan.execute(&GlobalBuffer::from_slice(&a), &GlobalBuffer::from_slice(&b), &c)?;
    let expected = reference_gemm(&a, &la, &b, &lb, plan.epilogue(), desc.dtype_c);
    compare(&c.to_vec(), &lc, &expected, desc.dtype_c, desc.problem.k())?;
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::common::ProblemShape;
    use crate::kernel::SimConfig;
    use crate::layout::LayoutTag;
    use crate::plan::{GemmDesc, PlanOptions};
    use crate::platform::PlatformInfo;
    use crate::select::KernelKind;
    use proptest::prelude::*;
    use std::time::Duration;
    use strum::IntoEnumIterator;

    #[test]
    fn test_reference_respects_layouts() {
        // A = [[1, 2], [3, 4]] stored column-major.
        let a = [1.0, 3.0, 2.0, 4.0];
        let b = [1.0, 0.0, 0.0, 1.0];
        let c = reference_gemm(
            &a,
            &Layout::column_major(2, 2),
            &b,
            &Layout::row_major(2, 2),
            None,
            Dtype::Float32,
        );
        assert_eq!(c, array![[1.0, 2.0], [3.0, 4.0]]);
    }

    #[test]
    fn test_compare_reports_first_mismatch() {
        let expected = array![[1.0f32, 2.0], [3.0, 4.0]];
        let actual = [1.0, 2.0, 3.5, 4.0];
        let err = compare(&actual, &Layout::row_major(2, 2), &expected, Dtype::Float32, 2).unwrap_err();
        assert!(matches!(err, VerifyError::Mismatch { row: 1, col: 0, .. }));
    }

    #[test]
    fn test_every_kernel_verifies() {
        let platform = PlatformInfo::atlas_a2().with_core_num(3);
        for kernel in KernelKind::iter() {
            let desc = GemmDesc::new(
                ProblemShape::new(70, 90, 300).unwrap(),
                LayoutTag::ColumnMajor,
                LayoutTag::RowMajor,
                Dtype::Float16,
            );
            let options = PlanOptions {
                kernel: Some(kernel),
                epilogue: (kernel == KernelKind::WorkspaceEpilogue).then(Epilogue::default),
                sim: SimConfig {
                    flag_timeout: Duration::from_secs(5),
                    ..SimConfig::default()
                },
            };
            let plan = match GemmPlan::new(desc, &platform, options) {
                Ok(plan) => plan,
                // Small refuses problems with more than one K tile.
                Err(_) if kernel == KernelKind::Small => continue,
                Err(e) => panic!("{kernel}: {e}"),
            };
            if let Err(e) = verify_plan(&plan, 7) {
                panic!("{kernel}: {e}");
            }
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(8))]

        #[test]
        fn test_auto_selection_verifies(
            m in 1u32..200,
            n in 1u32..200,
            k in 1u32..400,
            dtype in any::<Dtype>(),
            col_a in any::<bool>(),
            col_b in any::<bool>(),
        ) {
            let tag = |col| if col { LayoutTag::ColumnMajor } else { LayoutTag::RowMajor };
            let desc = GemmDesc::new(ProblemShape::new(m, n, k).unwrap(), tag(col_a), tag(col_b), dtype);
            let plan = GemmPlan::new(desc, &PlatformInfo::atlas_a2().with_core_num(4), PlanOptions::default()).unwrap();
            verify_plan(&plan, u64::from(m * n + k)).unwrap();
        }
    }
}
