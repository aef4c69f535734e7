use parking_lot::Mutex;
use std::fmt::{self, Display};
use std::ops::AddAssign;

use crate::memorylimits::{CapacityError, MemoryFootprint};
use crate::platform::{MemoryLevel, PlatformInfo};

/// Counts of the hardware operations a core issued.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HwCounters {
    pub gm_to_l1: u64,
    /// Contiguous GM bursts across all GM -> L1 copies.
    pub gm_bursts: u64,
    pub l1_to_l0: u64,
    pub mmad: u64,
    pub fixpipe: u64,
    /// Vector-core passes over a UB chunk (epilogue, reduction, padding).
    pub vector: u64,
}

impl AddAssign for HwCounters {
    fn add_assign(&mut self, rhs: Self) {
        self.gm_to_l1 += rhs.gm_to_l1;
        self.gm_bursts += rhs.gm_bursts;
        self.l1_to_l0 += rhs.l1_to_l0;
        self.mmad += rhs.mmad;
        self.fixpipe += rhs.fixpipe;
        self.vector += rhs.vector;
    }
}

impl Display for HwCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "gm->l1 {} ({} bursts), l1->l0 {}, mmad {}, fixpipe {}, vector {}",
            self.gm_to_l1, self.gm_bursts, self.l1_to_l0, self.mmad, self.fixpipe, self.vector
        )
    }
}

/// Launch-wide totals, summed as cores finish.
#[derive(Debug, Default)]
pub struct CounterSink(Mutex<HwCounters>);

impl CounterSink {
    pub fn record(&self, counters: HwCounters) {
        *self.0.lock() += counters;
    }

    pub fn total(&self) -> HwCounters {
        *self.0.lock()
    }
}

/// One core's on-chip memory. Buffers are reserved up front, once per kernel, and reservations
/// beyond a level's capacity fail.
#[derive(Debug)]
pub struct CoreResource {
    platform: PlatformInfo,
    used: MemoryFootprint,
    pub counters: HwCounters,
}

impl CoreResource {
    pub fn new(platform: &PlatformInfo) -> Self {
        CoreResource {
            platform: *platform,
            used: MemoryFootprint::zero(),
            counters: HwCounters::default(),
        }
    }

    pub fn platform(&self) -> &PlatformInfo {
        &self.platform
    }

    /// Reserve `elements` elements of `bytes_per_element` each at `level`, returning a zeroed
    /// backing buffer.
    pub fn alloc(
        &mut self,
        level: MemoryLevel,
        elements: usize,
        bytes_per_element: u64,
    ) -> Result<Vec<f32>, CapacityError> {
        let mut next = self.used;
        next.add(level, elements as u64 * bytes_per_element);
        next.check(&self.platform)?;
        self.used = next;
        Ok(vec![0.0; elements])
    }

    pub fn used(&self, level: MemoryLevel) -> u64 {
        self.used.get(level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_beyond_capacity_fails_without_reserving() {
        let platform = PlatformInfo::atlas_a2();
        let mut res = CoreResource::new(&platform);
        let buf = res.alloc(MemoryLevel::L0A, 8 * 1024, 4).unwrap();
        assert_eq!(buf.len(), 8 * 1024);
        assert_eq!(res.used(MemoryLevel::L0A), 32 * 1024);
        let err = res.alloc(MemoryLevel::L0A, 8 * 1024 + 1, 4).unwrap_err();
        assert_eq!(err.level, MemoryLevel::L0A);
        assert_eq!(res.used(MemoryLevel::L0A), 32 * 1024);
        assert!(res.alloc(MemoryLevel::L0A, 8 * 1024, 4).is_ok());
    }

    #[test]
    fn test_counter_sink_sums() {
        let sink = CounterSink::default();
        let one = HwCounters {
            mmad: 2,
            fixpipe: 1,
            ..Default::default()
        };
        sink.record(one);
        sink.record(one);
        assert_eq!(sink.total().mmad, 4);
        assert_eq!(sink.total().fixpipe, 2);
    }
}
