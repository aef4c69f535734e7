use super::flags::SyncError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum SlotState {
    Free,
    Filling,
    Ready,
    Consuming,
}

struct Slot<T, K> {
    state: SlotState,
    data: T,
    tag: Option<K>,
}

/// A ring of on-chip buffers passed between pipeline stages of one core.
///
/// Each slot cycles `Free -> Filling -> Ready -> Consuming -> Free`; a transition out of order is
/// reported rather than silently corrupting a buffer another stage still owns. A slot may carry a
/// tag `K` naming what it holds, so a consumer can keep a tile resident (`Consuming -> Ready`)
/// and a producer can find it again without reloading.
pub struct StageRing<T, K = ()> {
    name: &'static str,
    slots: Vec<Slot<T, K>>,
}

impl<T, K: PartialEq + Copy> StageRing<T, K> {
    pub fn new(name: &'static str, buffers: Vec<T>) -> Self {
        StageRing {
            name,
            slots: buffers
                .into_iter()
                .map(|data| Slot {
                    state: SlotState::Free,
                    data,
                    tag: None,
                })
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn state(&self, slot: usize) -> SlotState {
        self.slots[slot].state
    }

    fn transition(&mut self, slot: usize, from: SlotState, to: SlotState) -> Result<(), SyncError> {
        let s = &mut self.slots[slot];
        if s.state != from {
            return Err(SyncError::EventOrder {
                ring: self.name,
                slot,
                expected: from,
                found: s.state,
            });
        }
        s.state = to;
        Ok(())
    }

    pub fn begin_fill(&mut self, slot: usize) -> Result<&mut T, SyncError> {
        self.transition(slot, SlotState::Free, SlotState::Filling)?;
        self.slots[slot].tag = None;
        Ok(&mut self.slots[slot].data)
    }

    pub fn finish_fill(&mut self, slot: usize, tag: Option<K>) -> Result<(), SyncError> {
        self.transition(slot, SlotState::Filling, SlotState::Ready)?;
        self.slots[slot].tag = tag;
        Ok(())
    }

    pub fn begin_consume(&mut self, slot: usize) -> Result<&T, SyncError> {
        self.transition(slot, SlotState::Ready, SlotState::Consuming)?;
        Ok(&self.slots[slot].data)
    }

    /// Hand the slot back to the producer. Its tag survives until the next fill.
    pub fn release(&mut self, slot: usize) -> Result<(), SyncError> {
        self.transition(slot, SlotState::Consuming, SlotState::Free)
    }

    /// Keep the consumed contents for a later consumer.
    pub fn retain(&mut self, slot: usize) -> Result<(), SyncError> {
        self.transition(slot, SlotState::Consuming, SlotState::Ready)
    }

    /// If a free slot still holds `tag`, mark it ready again without a refill.
    pub fn reuse(&mut self, slot: usize, tag: K) -> bool {
        let s = &mut self.slots[slot];
        if s.state == SlotState::Free && s.tag == Some(tag) {
            s.state = SlotState::Ready;
            true
        } else {
            false
        }
    }

    pub fn data(&self, slot: usize) -> &T {
        &self.slots[slot].data
    }

    pub fn data_mut(&mut self, slot: usize) -> &mut T {
        &mut self.slots[slot].data
    }

    /// True once every slot is free again.
    pub fn is_idle(&self) -> bool {
        self.slots.iter().all(|s| s.state == SlotState::Free)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_cycle_and_out_of_order_rejection() {
        let mut ring: StageRing<Vec<f32>, u32> = StageRing::new("l1a", vec![vec![0.0; 4]; 2]);
        ring.begin_fill(0).unwrap()[0] = 1.0;
        assert!(matches!(
            ring.begin_consume(0),
            Err(SyncError::EventOrder {
                expected: SlotState::Ready,
                found: SlotState::Filling,
                ..
            })
        ));
        ring.finish_fill(0, Some(7)).unwrap();
        assert_eq!(ring.begin_consume(0).unwrap()[0], 1.0);
        ring.release(0).unwrap();
        assert!(ring.is_idle());
        assert!(ring.release(0).is_err());
    }

    #[test]
    fn test_reuse_only_matches_same_tag() {
        let mut ring: StageRing<u8, u32> = StageRing::new("l1b", vec![0; 2]);
        ring.begin_fill(1).unwrap();
        ring.finish_fill(1, Some(42)).unwrap();
        ring.begin_consume(1).unwrap();
        ring.release(1).unwrap();
        assert!(!ring.reuse(1, 41));
        assert!(ring.reuse(1, 42));
        assert_eq!(ring.state(1), SlotState::Ready);
        ring.begin_consume(1).unwrap();
        ring.retain(1).unwrap();
        assert_eq!(ring.state(1), SlotState::Ready);
    }
}
