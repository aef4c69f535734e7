//! Host-side setup: everything that is validated and decided before a kernel is launched.

use log::{debug, info};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::arch::{CoreResource, CounterSink, GlobalBuffer};
use crate::blob::{BlobError, TilingBlob, TILING_BLOB_SIZE};
use crate::block::{padded_nd_layout, Epilogue, VectorCore};
use crate::common::{ConfigError, Dtype, ProblemShape};
use crate::kernel::{launch, Kernel, KernelArgs, LaunchError, LaunchReport, MatmulKernel, SimConfig};
use crate::layout::{Layout, LayoutTag};
use crate::platform::PlatformInfo;
use crate::select::{select_kernel, KernelKind, PaddingTag, TilingParams};
use crate::tile::GmTensor;

/// A GEMM as the caller describes it. C is always row-major.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub struct GemmDesc {
    pub problem: ProblemShape,
    pub layout_a: LayoutTag,
    pub layout_b: LayoutTag,
    /// Explicit leading strides; `None` means densely packed.
    pub stride_a: Option<i64>,
    pub stride_b: Option<i64>,
    pub stride_c: Option<i64>,
    /// Element type of A and B.
    pub dtype: Dtype,
    pub dtype_c: Dtype,
}

impl GemmDesc {
    /// Dense operands of one dtype.
    pub fn new(problem: ProblemShape, layout_a: LayoutTag, layout_b: LayoutTag, dtype: Dtype) -> Self {
        GemmDesc {
            problem,
            layout_a,
            layout_b,
            stride_a: None,
            stride_b: None,
            stride_c: None,
            dtype,
            dtype_c: dtype,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlanOptions {
    /// Use this kernel instead of the automatic choice.
    pub kernel: Option<KernelKind>,
    /// Applied to every output element. Only [KernelKind::WorkspaceEpilogue] runs epilogues, and
    /// it is chosen automatically when one is given.
    pub epilogue: Option<Epilogue>,
    pub sim: SimConfig,
}

/// Global-memory scratch a launch needs besides A, B and C, laid out as `[WA][WB][WC]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Workspace {
    /// A padded copy of A, when A is padded.
    pub a: Option<Layout>,
    pub b: Option<Layout>,
    /// A padded stand-in for C that is copied (and cast) into C after the kernel.
    pub c_staging: Option<(Layout, Dtype)>,
    /// f32 elements of kernel scratch.
    pub scratch: u64,
}

impl Workspace {
    /// Bytes of each of the three regions.
    pub fn region_bytes(&self, dtype: Dtype) -> [u64; 3] {
        let bytes = |l: &Layout, d: Dtype| l.span() * u64::from(d.size());
        let wc = match &self.c_staging {
            Some((l, d)) => bytes(l, *d),
            None => self.scratch * u64::from(Dtype::Float32.size()),
        };
        [
            self.a.as_ref().map_or(0, |l| bytes(l, dtype)),
            self.b.as_ref().map_or(0, |l| bytes(l, dtype)),
            wc,
        ]
    }

    pub fn total_bytes(&self, dtype: Dtype) -> u64 {
        self.region_bytes(dtype).iter().sum()
    }
}

/// A validated GEMM ready to run any number of times.
#[derive(Debug, Clone)]
pub struct GemmPlan {
    desc: GemmDesc,
    platform: PlatformInfo,
    options: PlanOptions,
    params: TilingParams,
    layouts: [Layout; 3],
    workspace: Workspace,
    blob: [u8; TILING_BLOB_SIZE],
}

impl GemmPlan {
    pub fn new(desc: GemmDesc, platform: &PlatformInfo, options: PlanOptions) -> Result<Self, ConfigError> {
        if desc.dtype_c != desc.dtype && desc.dtype_c != Dtype::Float32 {
            return Err(ConfigError::UnsupportedDtypes {
                a: desc.dtype,
                b: desc.dtype,
                c: desc.dtype_c,
            });
        }
        options.sim.validate()?;
        let (m, n, k) = (desc.problem.m(), desc.problem.n(), desc.problem.k());
        let layouts = [
            host_layout("A", desc.layout_a, m, k, desc.stride_a)?,
            host_layout("B", desc.layout_b, k, n, desc.stride_b)?,
            host_layout("C", LayoutTag::RowMajor, m, n, desc.stride_c)?,
        ];

        let force = match (options.kernel, &options.epilogue) {
            (None, Some(_)) => Some(KernelKind::WorkspaceEpilogue),
            (Some(KernelKind::WorkspaceEpilogue), None) => {
                return Err(ConfigError::MissingEpilogue(KernelKind::WorkspaceEpilogue))
            }
            (Some(kernel), Some(_)) if kernel != KernelKind::WorkspaceEpilogue => {
                return Err(ConfigError::KernelNotApplicable {
                    kernel,
                    reason: "only the workspace epilogue kernel applies an epilogue".to_string(),
                })
            }
            (force, _) => force,
        };
        if let Some(epilogue) = &options.epilogue {
            epilogue.validate(n)?;
        }
        let params = select_kernel(
            &desc.problem,
            desc.layout_a,
            desc.layout_b,
            desc.dtype,
            platform,
            force,
        )?;

        let padded = |tag: PaddingTag, layout: &Layout, rows, cols| match tag {
            PaddingTag::None => None,
            PaddingTag::Nd => Some(padded_nd_layout(layout.tag(), rows, cols, desc.dtype)),
            PaddingTag::Nz => Some(Layout::nz(rows, cols, desc.dtype)),
        };
        let c_staging = if params.kernel == KernelKind::SingleCoreSplitk {
            Some((padded_nd_layout(LayoutTag::RowMajor, m, n, Dtype::Float32), Dtype::Float32))
        } else if params.padding.c == PaddingTag::Nd {
            Some((padded_nd_layout(LayoutTag::RowMajor, m, n, desc.dtype_c), desc.dtype_c))
        } else {
            None
        };
        let workspace = Workspace {
            a: padded(params.padding.a, &layouts[0], m, k),
            b: padded(params.padding.b, &layouts[1], k, n),
            c_staging,
            scratch: MatmulKernel::for_kind(params.kernel).workspace_len(&params, &options.sim),
        };

        let stride = |field: &'static str, l: &Layout| {
            i64::try_from(l.stride()).map_err(|_| BlobError::FieldOverflow {
                field,
                value: l.stride(),
            })
        };
        let blob = TilingBlob::from_params(
            &params,
            stride("stride_a", &layouts[0])?,
            stride("stride_b", &layouts[1])?,
            stride("stride_c", &layouts[2])?,
        )?
        .encode()?;

        debug!(
            "Planned {} ({}): workspace {} bytes, key {}",
            desc.problem,
            params.kernel,
            workspace.total_bytes(desc.dtype),
            params.tiling_key()
        );
        Ok(GemmPlan {
            desc,
            platform: *platform,
            options,
            params,
            layouts,
            workspace,
            blob,
        })
    }

    pub fn desc(&self) -> &GemmDesc {
        &self.desc
    }

    pub fn params(&self) -> &TilingParams {
        &self.params
    }

    pub fn epilogue(&self) -> Option<&Epilogue> {
        self.options.epilogue.as_ref()
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn blob(&self) -> &[u8; TILING_BLOB_SIZE] {
        &self.blob
    }

    /// The host layouts of A, B and C.
    pub fn layouts(&self) -> &[Layout; 3] {
        &self.layouts
    }

    /// Compute `C = A * B` (through the epilogue, if any). Buffers hold elements at the
    /// positions the host layouts give them.
    pub fn execute(
        &self,
        a: &GlobalBuffer,
        b: &GlobalBuffer,
        c: &GlobalBuffer,
    ) -> Result<LaunchReport, LaunchError> {
        for ((name, buf), layout) in [("A", a), ("B", b), ("C", c)].into_iter().zip(&self.layouts) {
            if (buf.len() as u64) < layout.span() {
                return Err(ConfigError::BufferSize {
                    operand: name,
                    expected: layout.span(),
                    actual: buf.len() as u64,
                }
                .into());
            }
        }

        // The kernel sees the problem only through the blob.
        let blob = TilingBlob::decode(&self.blob).map_err(ConfigError::from)?;
        let params = TilingParams {
            problem: blob.problem()?,
            l1_tile: blob.l1_tile(),
            swizzle: blob.swizzle().map_err(ConfigError::from)?,
            ..self.params
        };

        let [la, lb, lc] = self.layouts;
        let dtype = self.desc.dtype;
        let host_a = GmTensor::new(a, la, dtype);
        let host_b = GmTensor::new(b, lb, dtype);
        let host_c = GmTensor::new(c, lc, self.desc.dtype_c);
        let zeroed = |l: Option<Layout>| l.map(|l| GlobalBuffer::zeroed(l.span() as usize));
        let wa = zeroed(self.workspace.a);
        let wb = zeroed(self.workspace.b);
        let wc = zeroed(self.workspace.c_staging.map(|(l, _)| l));
        let scratch = GlobalBuffer::zeroed(self.workspace.scratch as usize);

        let sink = CounterSink::default();
        let padded_a = wa.as_ref().zip(self.workspace.a).map(|(buf, l)| GmTensor::new(buf, l, dtype));
        let padded_b = wb.as_ref().zip(self.workspace.b).map(|(buf, l)| GmTensor::new(buf, l, dtype));
        for (src, dst) in [(&host_a, &padded_a), (&host_b, &padded_b)] {
            if let Some(dst) = dst {
                self.vector_pass(&sink, |v, aiv, aiv_num| v.pad_operand(src, dst, aiv, aiv_num))?;
            }
        }
        let staged_c = wc
            .as_ref()
            .zip(self.workspace.c_staging)
            .map(|(buf, (l, d))| GmTensor::new(buf, l, d));

        let args = KernelArgs {
            params,
            platform: self.platform,
            sim: self.options.sim,
            a: padded_a.unwrap_or(host_a),
            b: padded_b.unwrap_or(host_b),
            c: staged_c.unwrap_or(host_c),
            workspace: &scratch,
            epilogue: self.options.epilogue.as_ref(),
        };
        let mut report = launch(&args)?;

        if let Some(staged) = &staged_c {
            self.vector_pass(&sink, |v, aiv, aiv_num| {
                v.remove_padding(staged, &host_c, aiv, aiv_num)
            })?;
        }
        report.counters += sink.total();
        info!("{} done: {}", self.desc.problem, report.counters);
        Ok(report)
    }

    /// Run `f` on every vector core of the launch.
    fn vector_pass(
        &self,
        sink: &CounterSink,
        f: impl Fn(&mut VectorCore, u32, u32) + Sync,
    ) -> Result<(), LaunchError> {
        let aiv_num = self.params.block_dim * self.options.sim.sub_block_num;
        (0..aiv_num).into_par_iter().try_for_each(|aiv| {
            let mut resource = CoreResource::new(&self.platform);
            let mut vector = VectorCore::new(&mut resource)?;
            f(&mut vector, aiv, aiv_num);
            sink.record(vector.counters());
            Ok(())
        })
    }
}

fn host_layout(
    name: &'static str,
    tag: LayoutTag,
    rows: u32,
    cols: u32,
    stride: Option<i64>,
) -> Result<Layout, ConfigError> {
    let dense = match tag {
        LayoutTag::ColumnMajor => rows,
        _ => cols,
    };
    Layout::with_stride(name, tag, rows, cols, stride.unwrap_or(dense.into()))
}
