use iai_callgrind::{library_benchmark, library_benchmark_group, main, LibraryBenchmarkConfig};
use std::hint::black_box;

use tilegemm::common::{Dtype, ProblemShape};
use tilegemm::layout::LayoutTag;
use tilegemm::platform::PlatformInfo;
use tilegemm::select::{select_kernel, TilingParams};

#[export_name = "tilegemm_bench_tiling::problem"]
fn problem(m: u32, n: u32, k: u32) -> ProblemShape {
    ProblemShape::new(m, n, k).unwrap()
}

fn select(problem: &ProblemShape, layout_a: LayoutTag) -> TilingParams {
    let platform = PlatformInfo::atlas_a2();
    select_kernel(
        black_box(problem),
        layout_a,
        LayoutTag::RowMajor,
        Dtype::Float16,
        &platform,
        None,
    )
    .unwrap()
}

#[library_benchmark]
#[benches::multiple((4096, 4096, 4096), (16, 7168, 2048), (1000, 1000, 65536), (100, 65536, 64))]
fn select_row_major(dims: (u32, u32, u32)) -> TilingParams {
    select(&problem(dims.0, dims.1, dims.2), LayoutTag::RowMajor)
}

#[library_benchmark]
#[benches::multiple((4096, 4096, 4096), (65536, 40, 1024))]
fn select_column_major_a(dims: (u32, u32, u32)) -> TilingParams {
    select(&problem(dims.0, dims.1, dims.2), LayoutTag::ColumnMajor)
}

library_benchmark_group!(
    name = tiling_group;
    benchmarks = select_row_major, select_column_major_a
);

main!(
    config = LibraryBenchmarkConfig::default()
                .raw_callgrind_args([
                    "toggle-collect=tilegemm_bench_tiling::problem",
                    "--simulate-wb=no", "--simulate-hwpref=yes",
                    "--I1=32768,8,64", "--D1=32768,8,64", "--LL=8388608,16,64",
                ]);
    library_benchmark_groups = tiling_group
);
