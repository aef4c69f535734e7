//! The packed launch-parameter record handed to the device kernel.

use bincode::Options;
use serde::{Deserialize, Serialize};
use std::num::NonZeroU32;

use crate::common::{ConfigError, ProblemShape};
use crate::select::{Swizzle, SwizzleDirection, TilingParams};
use crate::tiling::TileShape;

pub const TILING_BLOB_SIZE: usize = 48;

const CHUNK: usize = 8;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum BlobError {
    #[error("tiling blob is {0} bytes, expected {}", TILING_BLOB_SIZE)]
    WrongLength(usize),
    #[error("tiling blob field {0} is zero")]
    ZeroField(&'static str),
    #[error("tiling blob swizzle direction {0} is not 0 or 1")]
    BadSwizzleDirection(u8),
    #[error("tiling blob swizzle offset is zero")]
    ZeroSwizzleOffset,
    #[error("{field} = {value} does not fit its tiling blob field")]
    FieldOverflow { field: &'static str, value: u64 },
    #[error("tiling blob codec: {0}")]
    Codec(String),
}

/// Field order and widths match the device's view of the record byte for byte.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct TilingBlob {
    pub stride_a: i64,
    pub stride_b: i64,
    pub stride_c: i64,
    pub m: u32,
    pub n: u32,
    pub k: u32,
    pub m1: u16,
    pub n1: u16,
    pub k1: u16,
    pub swizzle_offset: u8,
    pub swizzle_direction: u8,
    pub reserved: [u8; 4],
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new()
        .with_fixint_encoding()
        .with_little_endian()
}

impl TilingBlob {
    pub fn from_params(
        params: &TilingParams,
        stride_a: i64,
        stride_b: i64,
        stride_c: i64,
    ) -> Result<Self, BlobError> {
        let narrow16 = |field: &'static str, value: u32| {
            u16::try_from(value).map_err(|_| BlobError::FieldOverflow {
                field,
                value: value.into(),
            })
        };
        let swizzle_offset =
            u8::try_from(params.swizzle.offset()).map_err(|_| BlobError::FieldOverflow {
                field: "swizzle_offset",
                value: params.swizzle.offset().into(),
            })?;
        let blob = TilingBlob {
            stride_a,
            stride_b,
            stride_c,
            m: params.problem.m(),
            n: params.problem.n(),
            k: params.problem.k(),
            m1: narrow16("m1", params.l1_tile.m)?,
            n1: narrow16("n1", params.l1_tile.n)?,
            k1: narrow16("k1", params.l1_tile.k)?,
            swizzle_offset,
            swizzle_direction: params.swizzle.direction as u8,
            reserved: [0; 4],
        };
        blob.validate()?;
        Ok(blob)
    }

    pub fn encode(&self) -> Result<[u8; TILING_BLOB_SIZE], BlobError> {
        let bytes = codec()
            .serialize(self)
            .map_err(|e| BlobError::Codec(e.to_string()))?;
        bytes
            .try_into()
            .map_err(|v: Vec<u8>| BlobError::WrongLength(v.len()))
    }

    /// Decode a blob as the device does: the launch-parameter region is copied into an aligned
    /// local array in 8-byte chunks before any field is read.
    pub fn decode(bytes: &[u8]) -> Result<Self, BlobError> {
        if bytes.len() != TILING_BLOB_SIZE {
            return Err(BlobError::WrongLength(bytes.len()));
        }
        let mut words = [0u64; TILING_BLOB_SIZE / CHUNK];
        for (word, chunk) in words.iter_mut().zip(bytes.chunks_exact(CHUNK)) {
            let mut raw = [0u8; CHUNK];
            raw.copy_from_slice(chunk);
            *word = u64::from_le_bytes(raw);
        }
        let local = words
            .iter()
            .flat_map(|w| w.to_le_bytes())
            .collect::<Vec<_>>();
        let blob: TilingBlob = codec()
            .deserialize(&local)
            .map_err(|e| BlobError::Codec(e.to_string()))?;
        blob.validate()?;
        Ok(blob)
    }

    pub fn validate(&self) -> Result<(), BlobError> {
        for (name, value) in [
            ("m", self.m),
            ("n", self.n),
            ("k", self.k),
            ("m1", self.m1.into()),
            ("n1", self.n1.into()),
            ("k1", self.k1.into()),
        ] {
            if value == 0 {
                return Err(BlobError::ZeroField(name));
            }
        }
        if self.swizzle_offset == 0 {
            return Err(BlobError::ZeroSwizzleOffset);
        }
        if SwizzleDirection::from_code(self.swizzle_direction).is_none() {
            return Err(BlobError::BadSwizzleDirection(self.swizzle_direction));
        }
        Ok(())
    }

    pub fn problem(&self) -> Result<ProblemShape, ConfigError> {
        ProblemShape::new(self.m, self.n, self.k)
    }

    pub fn swizzle(&self) -> Result<Swizzle, BlobError> {
        let offset = NonZeroU32::new(self.swizzle_offset.into()).ok_or(BlobError::ZeroSwizzleOffset)?;
        Ok(Swizzle::new(offset, self.direction()))
    }

    pub fn l1_tile(&self) -> TileShape {
        TileShape::new(self.m1.into(), self.n1.into(), self.k1.into())
    }

    pub fn direction(&self) -> SwizzleDirection {
        SwizzleDirection::from_code(self.swizzle_direction).unwrap_or(SwizzleDirection::Zn)
    }
}
