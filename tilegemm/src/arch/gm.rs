use std::sync::atomic::{AtomicU32, Ordering};

/// Global memory: f32 elements visible to every core.
///
/// Each element is stored as its bit pattern in an [AtomicU32], so cores on different threads
/// may read, write and accumulate without locks. Accumulation is an atomic read-modify-write,
/// matching the hardware's atomic-add store mode.
pub struct GlobalBuffer {
    data: Box<[AtomicU32]>,
}

impl GlobalBuffer {
    pub fn zeroed(len: usize) -> Self {
        GlobalBuffer {
            data: (0..len).map(|_| AtomicU32::new(0)).collect(),
        }
    }

    pub fn from_slice(values: &[f32]) -> Self {
        GlobalBuffer {
            data: values
                .iter()
                .map(|v| AtomicU32::new(v.to_bits()))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn load(&self, idx: u64) -> f32 {
        f32::from_bits(self.data[idx as usize].load(Ordering::Acquire))
    }

    pub fn store(&self, idx: u64, value: f32) {
        self.data[idx as usize].store(value.to_bits(), Ordering::Release);
    }

    pub fn atomic_add(&self, idx: u64, value: f32) {
        let cell = &self.data[idx as usize];
        let mut current = cell.load(Ordering::Relaxed);
        loop {
            let next = (f32::from_bits(current) + value).to_bits();
            match cell.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Relaxed) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }

    pub fn fill(&self, value: f32) {
        for cell in self.data.iter() {
            cell.store(value.to_bits(), Ordering::Release);
        }
    }

    pub fn to_vec(&self) -> Vec<f32> {
        self.data
            .iter()
            .map(|c| f32::from_bits(c.load(Ordering::Acquire)))
            .collect()
    }
}

impl std::fmt::Debug for GlobalBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "GlobalBuffer({} elements)", self.data.len())
    }
}
