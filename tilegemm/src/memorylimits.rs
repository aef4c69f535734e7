use serde::{Deserialize, Serialize};
use std::fmt::{self, Display, Formatter};

use crate::common::Dtype;
use crate::platform::{MemoryLevel, PlatformInfo, LEVEL_COUNT};

/// Bytes of the L0C accumulator per output element; accumulation is always in f32.
pub const ACCUMULATOR_BYTES: u64 = 4;

/// A tile (or a stage ring of tiles) does not fit the memory level it was assigned to.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
#[error("{level} needs {required} bytes but only {available} are available")]
pub struct CapacityError {
    pub level: MemoryLevel,
    pub required: u64,
    pub available: u64,
}

/// Bytes of each on-chip memory level occupied by a configuration.
///
/// Footprints are additive: a core that holds several stage rings sums their footprints and
/// checks the total once.
#[derive(Clone, Copy, Default, PartialEq, Eq, Debug, Deserialize, Serialize)]
pub struct MemoryFootprint([u64; LEVEL_COUNT]);

impl MemoryFootprint {
    pub fn zero() -> Self {
        Self::default()
    }

    pub fn single(level: MemoryLevel, bytes: u64) -> Self {
        let mut f = Self::zero();
        f.0[level.index()] = bytes;
        f
    }

    pub fn get(&self, level: MemoryLevel) -> u64 {
        self.0[level.index()]
    }

    pub fn add(&mut self, level: MemoryLevel, bytes: u64) {
        self.0[level.index()] += bytes;
    }

    /// The first level whose usage exceeds the platform's capacity, if any.
    pub fn check(&self, platform: &PlatformInfo) -> Result<(), CapacityError> {
        for level in [
            MemoryLevel::L1,
            MemoryLevel::L0A,
            MemoryLevel::L0B,
            MemoryLevel::L0C,
            MemoryLevel::UB,
        ] {
            let required = self.get(level);
            if let Some(available) = platform.capacity(level) {
                if required > available {
                    return Err(CapacityError {
                        level,
                        required,
                        available,
                    });
                }
            }
        }
        Ok(())
    }
}

impl std::ops::Add for MemoryFootprint {
    type Output = MemoryFootprint;

    fn add(mut self, rhs: Self) -> Self::Output {
        for (a, b) in self.0.iter_mut().zip(rhs.0) {
            *a += b;
        }
        self
    }
}

impl Display for MemoryFootprint {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[L1 {}, L0A {}, L0B {}, L0C {}, UB {}]",
            self.get(MemoryLevel::L1),
            self.get(MemoryLevel::L0A),
            self.get(MemoryLevel::L0B),
            self.get(MemoryLevel::L0C),
            self.get(MemoryLevel::UB)
        )
    }
}

/// The capacity predicate used by the tiling search.
///
/// An `m1 x k1` A tile and a `k1 x n1` B tile, each double-buffered, must fit L1 and a single
/// `m1 x n1` accumulator tile must fit L0C.
pub fn judge_space(m1: u32, n1: u32, k1: u32, dtype: Dtype, platform: &PlatformInfo) -> bool {
    let size = u64::from(dtype.size());
    let (m1, n1, k1) = (u64::from(m1), u64::from(n1), u64::from(k1));
    let l1 = m1 * k1 * 2 * size + k1 * n1 * 2 * size;
    l1 <= u64::from(platform.l1_size) && m1 * n1 * ACCUMULATOR_BYTES <= u64::from(platform.l0c_size)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_judge_space_baseline_tiles_fit_atlas_a2() {
        let p = PlatformInfo::atlas_a2();
        assert!(judge_space(128, 256, 128, Dtype::Float32, &p));
        assert!(judge_space(256, 128, 128, Dtype::Float32, &p));
        assert!(!judge_space(128, 256, 256, Dtype::Float32, &p));
        assert!(judge_space(128, 256, 256, Dtype::Float16, &p));
        // L0C bound: 256 x 256 x 4 bytes is 256 KiB.
        assert!(!judge_space(256, 256, 16, Dtype::Float16, &p));
    }

    #[test]
    fn test_footprint_check_names_overflowing_level() {
        let p = PlatformInfo::atlas_a2();
        let f = MemoryFootprint::single(MemoryLevel::L1, 100)
            + MemoryFootprint::single(MemoryLevel::L0A, 64 * 1024 + 1);
        assert_eq!(
            f.check(&p),
            Err(CapacityError {
                level: MemoryLevel::L0A,
                required: 64 * 1024 + 1,
                available: 64 * 1024
            })
        );
        assert!(MemoryFootprint::single(MemoryLevel::UB, 192 * 1024)
            .check(&p)
            .is_ok());
    }
}
