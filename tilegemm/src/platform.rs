//! Static descriptions of the accelerator: core count and on-chip buffer capacities.

use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::path::Path;

use crate::common::ConfigError;

pub const LEVEL_COUNT: usize = 6;

/// A level of the memory hierarchy. Data flows GM -> L1 -> L0A/L0B -> L0C -> GM for the cube
/// units and GM -> UB -> GM for the vector units.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize, strum::EnumIter, strum::Display,
)]
#[cfg_attr(test, derive(proptest_derive::Arbitrary))]
pub enum MemoryLevel {
    GM,
    L1,
    L0A,
    L0B,
    L0C,
    UB,
}

impl MemoryLevel {
    pub fn index(&self) -> usize {
        match self {
            MemoryLevel::GM => 0,
            MemoryLevel::L1 => 1,
            MemoryLevel::L0A => 2,
            MemoryLevel::L0B => 3,
            MemoryLevel::L0C => 4,
            MemoryLevel::UB => 5,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct PlatformInfo {
    pub core_num: u32,
    pub l1_size: u32,
    pub l0a_size: u32,
    pub l0b_size: u32,
    pub l0c_size: u32,
    pub ub_size: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum PlatformId {
    #[default]
    AtlasA2,
    /// The Atlas A2 buffer sizes with only eight cores. Convenient for tests and small runs.
    Small,
}

impl PlatformInfo {
    pub const fn atlas_a2() -> Self {
        PlatformInfo {
            core_num: 24,
            l1_size: 512 * 1024,
            l0a_size: 64 * 1024,
            l0b_size: 64 * 1024,
            l0c_size: 128 * 1024,
            ub_size: 192 * 1024,
        }
    }

    pub const fn with_core_num(self, core_num: u32) -> Self {
        PlatformInfo { core_num, ..self }
    }

    pub fn for_id(id: PlatformId) -> Self {
        match id {
            PlatformId::AtlasA2 => Self::atlas_a2(),
            PlatformId::Small => Self::atlas_a2().with_core_num(8),
        }
    }

    /// Load a bincode-encoded [PlatformInfo] from disk.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let file = std::fs::File::open(path)
            .map_err(|e| ConfigError::InvalidPlatform(format!("{}: {e}", path.display())))?;
        let platform: PlatformInfo = bincode::deserialize_from(std::io::BufReader::new(file))
            .map_err(|e| ConfigError::InvalidPlatform(format!("{}: {e}", path.display())))?;
        platform.validate()?;
        Ok(platform)
    }

    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let file = std::fs::File::create(path)
            .map_err(|e| ConfigError::InvalidPlatform(format!("{}: {e}", path.display())))?;
        bincode::serialize_into(std::io::BufWriter::new(file), self)
            .map_err(|e| ConfigError::InvalidPlatform(format!("{}: {e}", path.display())))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.core_num == 0 {
            return Err(ConfigError::InvalidPlatform(
                "core count must be positive".to_string(),
            ));
        }
        for level in [
            MemoryLevel::L1,
            MemoryLevel::L0A,
            MemoryLevel::L0B,
            MemoryLevel::L0C,
            MemoryLevel::UB,
        ] {
            if self.capacity(level) == Some(0) {
                return Err(ConfigError::InvalidPlatform(format!(
                    "{level} capacity must be positive"
                )));
            }
        }
        Ok(())
    }

    /// Capacity of a memory level in bytes. Global memory is treated as unbounded.
    pub fn capacity(&self, level: MemoryLevel) -> Option<u64> {
        match level {
            MemoryLevel::GM => None,
            MemoryLevel::L1 => Some(self.l1_size.into()),
            MemoryLevel::L0A => Some(self.l0a_size.into()),
            MemoryLevel::L0B => Some(self.l0b_size.into()),
            MemoryLevel::L0C => Some(self.l0c_size.into()),
            MemoryLevel::UB => Some(self.ub_size.into()),
        }
    }
}

impl Default for PlatformInfo {
    fn default() -> Self {
        Self::atlas_a2()
    }
}

impl Display for PlatformInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} cores, L1 {}K, L0A {}K, L0B {}K, L0C {}K, UB {}K",
            self.core_num,
            self.l1_size / 1024,
            self.l0a_size / 1024,
            self.l0b_size / 1024,
            self.l0c_size / 1024,
            self.ub_size / 1024
        )
    }
}
