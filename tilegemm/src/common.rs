use half::{bf16, f16};
use serde::{Deserialize, Serialize};
use std::fmt::Display;
use std::num::NonZeroU32;

use crate::memorylimits::CapacityError;

pub type DimSize = NonZeroU32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumIter)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum Dtype {
    Float16,
    Bfloat16,
    Float32,
}

impl Dtype {
    /// The bytes required to represent a value of this Dtype.
    pub fn size(&self) -> u8 {
        match self {
            Dtype::Float16 | Dtype::Bfloat16 => 2,
            Dtype::Float32 => 4,
        }
    }

    /// Round an f32 to the nearest value representable in this Dtype.
    ///
    /// The simulator stores every element as an f32; narrowing happens whenever a value crosses
    /// into a buffer of this Dtype.
    pub fn round(&self, value: f32) -> f32 {
        match self {
            Dtype::Float16 => f16::from_f32(value).to_f32(),
            Dtype::Bfloat16 => bf16::from_f32(value).to_f32(),
            Dtype::Float32 => value,
        }
    }
}

impl Display for Dtype {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dtype::Float16 => write!(f, "f16"),
            Dtype::Bfloat16 => write!(f, "bf16"),
            Dtype::Float32 => write!(f, "f32"),
        }
    }
}

/// A position or extent in the (M, N, K) iteration space of a GEMM.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct GemmCoord {
    pub m: u32,
    pub n: u32,
    pub k: u32,
}

impl GemmCoord {
    pub const fn new(m: u32, n: u32, k: u32) -> Self {
        GemmCoord { m, n, k }
    }

    /// True if any extent is zero. Only meaningful when the coordinate is used as a shape.
    pub fn is_empty(&self) -> bool {
        self.m == 0 || self.n == 0 || self.k == 0
    }
}

impl Display for GemmCoord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}, {})", self.m, self.n, self.k)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct MatrixCoord {
    pub row: u32,
    pub column: u32,
}

impl MatrixCoord {
    pub const fn new(row: u32, column: u32) -> Self {
        MatrixCoord { row, column }
    }
}

impl std::ops::Add for MatrixCoord {
    type Output = MatrixCoord;

    fn add(self, rhs: Self) -> Self::Output {
        MatrixCoord::new(self.row + rhs.row, self.column + rhs.column)
    }
}

/// The extents of a logical GEMM `C[M, N] = A[M, K] * B[K, N]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ProblemShape {
    m: DimSize,
    n: DimSize,
    k: DimSize,
}

impl ProblemShape {
    pub fn new(m: u32, n: u32, k: u32) -> Result<Self, ConfigError> {
        Ok(ProblemShape {
            m: DimSize::new(m).ok_or(ConfigError::ZeroDimension('M'))?,
            n: DimSize::new(n).ok_or(ConfigError::ZeroDimension('N'))?,
            k: DimSize::new(k).ok_or(ConfigError::ZeroDimension('K'))?,
        })
    }

    pub fn from_dims(m: DimSize, n: DimSize, k: DimSize) -> Self {
        ProblemShape { m, n, k }
    }

    pub fn m(&self) -> u32 {
        self.m.get()
    }

    pub fn n(&self) -> u32 {
        self.n.get()
    }

    pub fn k(&self) -> u32 {
        self.k.get()
    }

    pub fn as_coord(&self) -> GemmCoord {
        GemmCoord::new(self.m(), self.n(), self.k())
    }
}

impl Display for ProblemShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.m, self.n, self.k)
    }
}

/// Host-side validation failures. A launch that produces one of these never starts.
#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("problem dimension {0} must be positive")]
    ZeroDimension(char),
    #[error("operand {operand} holds {actual} elements but its layout spans {expected}")]
    BufferSize {
        operand: &'static str,
        expected: u64,
        actual: u64,
    },
    #[error("operand {operand} has stride {stride}, smaller than its contiguous extent {extent}")]
    BadStride {
        operand: &'static str,
        stride: i64,
        extent: u32,
    },
    #[error("operand {0} must be row- or column-major on the host")]
    HostNzLayout(&'static str),
    #[error("unsupported dtype combination: A={a}, B={b}, C={c}")]
    UnsupportedDtypes { a: Dtype, b: Dtype, c: Dtype },
    #[error("{loops} scheduler loops exceed the 32-bit loop index")]
    TooManyBlocks { loops: u64 },
    #[error("launch uses {requested} cores but the platform has {available}")]
    TooManyCores { requested: u32, available: u32 },
    #[error("invalid platform description: {0}")]
    InvalidPlatform(String),
    #[error("invalid simulation settings: {0}")]
    InvalidSimConfig(String),
    #[error("epilogue bias has {actual} elements but N is {expected}")]
    BiasLength { expected: u32, actual: usize },
    #[error("kernel {0} needs an epilogue")]
    MissingEpilogue(crate::select::KernelKind),
    #[error("kernel {kernel} does not apply: {reason}")]
    KernelNotApplicable {
        kernel: crate::select::KernelKind,
        reason: String,
    },
    #[error(transparent)]
    Capacity(#[from] CapacityError),
    #[error(transparent)]
    Blob(#[from] crate::blob::BlobError),
}
