//! Cross-core synchronization: counted flags one core sets and another waits on.

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TrySendError};
use log::trace;
use parking_lot::{Condvar, Mutex};
use std::time::{Duration, Instant};

use super::events::SlotState;

/// Outstanding signals a single flag can hold before a set overflows the hardware counter.
pub const MAX_FLAG_COUNT: usize = 15;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SyncError {
    #[error("no signal on flag {flag} within {timeout:?}; set and wait counts disagree")]
    Deadlock { flag: String, timeout: Duration },
    #[error("flag {flag} exceeded {} outstanding signals", MAX_FLAG_COUNT)]
    Overflow { flag: String },
    #[error("the peer of flag {flag} has exited")]
    Disconnected { flag: String },
    #[error("{ring} slot {slot} was {found}, expected {expected}")]
    EventOrder {
        ring: &'static str,
        slot: usize,
        expected: SlotState,
        found: SlotState,
    },
}

#[derive(Debug, Clone)]
pub struct FlagSetter {
    name: String,
    tx: Sender<()>,
}

#[derive(Debug)]
pub struct FlagWaiter {
    name: String,
    rx: Receiver<()>,
    timeout: Duration,
}

/// Create a counted flag. Clones of the setter all signal the same waiter.
pub fn cross_core_flag(name: impl Into<String>, timeout: Duration) -> (FlagSetter, FlagWaiter) {
    let name = name.into();
    let (tx, rx) = bounded(MAX_FLAG_COUNT);
    (
        FlagSetter {
            name: name.clone(),
            tx,
        },
        FlagWaiter { name, rx, timeout },
    )
}

impl FlagSetter {
    pub fn set(&self) -> Result<(), SyncError> {
        trace!("set {}", self.name);
        self.tx.try_send(()).map_err(|e| match e {
            TrySendError::Full(()) => SyncError::Overflow {
                flag: self.name.clone(),
            },
            TrySendError::Disconnected(()) => SyncError::Disconnected {
                flag: self.name.clone(),
            },
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl FlagWaiter {
    pub fn wait(&self) -> Result<(), SyncError> {
        trace!("wait {}", self.name);
        self.rx.recv_timeout(self.timeout).map_err(|e| match e {
            RecvTimeoutError::Timeout => SyncError::Deadlock {
                flag: self.name.clone(),
                timeout: self.timeout,
            },
            RecvTimeoutError::Disconnected => SyncError::Disconnected {
                flag: self.name.clone(),
            },
        })
    }

    /// Wait for `count` signals.
    pub fn wait_n(&self, count: usize) -> Result<(), SyncError> {
        (0..count).try_for_each(|_| self.wait())
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

/// A producer's reservation of one workspace stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotTicket {
    pub stage: usize,
    /// Every stage is in flight, so the consumer must free this one before it is overwritten.
    pub must_wait: bool,
}

/// The producer's bookkeeping for a ring of workspace stages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RingCursor {
    stages: usize,
    stage_id: usize,
    stage_used: usize,
}

impl RingCursor {
    pub fn new(stages: usize) -> Self {
        debug_assert!(stages > 0);
        RingCursor {
            stages,
            stage_id: 0,
            stage_used: 0,
        }
    }

    pub fn reserve(&mut self) -> SlotTicket {
        let stage = self.stage_id;
        let must_wait = self.stage_used == self.stages;
        if !must_wait {
            self.stage_used += 1;
        }
        self.stage_id = (self.stage_id + 1) % self.stages;
        SlotTicket { stage, must_wait }
    }

    pub fn in_flight(&self) -> usize {
        self.stage_used
    }

    /// The stages still held by the consumer, oldest first. Waiting on each in this order
    /// consumes every outstanding free signal.
    pub fn drain_order(&mut self) -> Vec<usize> {
        let mut order = Vec::with_capacity(self.stage_used);
        while self.stage_used > 0 {
            order.push((self.stage_id + self.stages - self.stage_used) % self.stages);
            self.stage_used -= 1;
        }
        order
    }
}

/// The flags a producer core uses: one "ready" flag per (stage, consumer sub-block) and one
/// "free" flag per stage that every sub-block signals.
#[derive(Debug)]
pub struct ProducerFlags {
    ready: Vec<Vec<FlagSetter>>,
    free: Vec<FlagWaiter>,
    sub_blocks: usize,
}

impl ProducerFlags {
    pub fn wait_free(&self, stage: usize) -> Result<(), SyncError> {
        self.free[stage].wait_n(self.sub_blocks)
    }

    pub fn set_ready(&self, stage: usize) -> Result<(), SyncError> {
        self.ready[stage].iter().try_for_each(FlagSetter::set)
    }
}

#[derive(Debug)]
pub struct ProducerHandle {
    pub flags: ProducerFlags,
    pub cursor: RingCursor,
}

impl ProducerHandle {
    /// Reserve the next stage, waiting for the consumer to free it if the ring is full.
    pub fn acquire(&mut self) -> Result<usize, SyncError> {
        let ticket = self.cursor.reserve();
        if ticket.must_wait {
            self.flags.wait_free(ticket.stage)?;
        }
        Ok(ticket.stage)
    }

    pub fn publish(&self, stage: usize) -> Result<(), SyncError> {
        self.flags.set_ready(stage)
    }

    /// Wait until the consumer has released every stage still in flight.
    pub fn drain(&mut self) -> Result<(), SyncError> {
        for stage in self.cursor.drain_order() {
            self.flags.wait_free(stage)?;
        }
        Ok(())
    }
}

/// One consumer sub-block's end of the ring. Stages are consumed in the order they were
/// published.
#[derive(Debug)]
pub struct ConsumerHandle {
    sub_block: usize,
    ready: Vec<FlagWaiter>,
    free: Vec<FlagSetter>,
    stage_id: usize,
}

impl ConsumerHandle {
    pub fn sub_block(&self) -> usize {
        self.sub_block
    }

    pub fn wait_ready(&self) -> Result<usize, SyncError> {
        self.ready[self.stage_id].wait()?;
        Ok(self.stage_id)
    }

    pub fn release(&mut self) -> Result<(), SyncError> {
        self.free[self.stage_id].set()?;
        self.stage_id = (self.stage_id + 1) % self.ready.len();
        Ok(())
    }
}

/// Build a workspace ring of `stages` slots between one producer and `sub_blocks` consumers.
pub fn workspace_ring(
    name: &str,
    stages: usize,
    sub_blocks: usize,
    timeout: Duration,
) -> (ProducerHandle, Vec<ConsumerHandle>) {
    let mut ready = vec![Vec::with_capacity(sub_blocks); stages];
    let mut ready_waiters = (0..sub_blocks)
        .map(|_| Vec::with_capacity(stages))
        .collect::<Vec<_>>();
    let mut free = Vec::with_capacity(stages);
    let mut free_setters = Vec::with_capacity(stages);
    for (stage, ready_setters) in ready.iter_mut().enumerate() {
        for (sub, waiters) in ready_waiters.iter_mut().enumerate() {
            let (s, w) = cross_core_flag(format!("{name}.store[{stage}].{sub}"), timeout);
            ready_setters.push(s);
            waiters.push(w);
        }
        let (s, w) = cross_core_flag(format!("{name}.compute[{stage}]"), timeout);
        free.push(w);
        free_setters.push(s);
    }
    let consumers = ready_waiters
        .into_iter()
        .enumerate()
        .map(|(sub_block, ready)| ConsumerHandle {
            sub_block,
            ready,
            free: free_setters.clone(),
            stage_id: 0,
        })
        .collect();
    (
        ProducerHandle {
            flags: ProducerFlags {
                ready,
                free,
                sub_blocks,
            },
            cursor: RingCursor::new(stages),
        },
        consumers,
    )
}

/// A barrier across one group of cores. Waits are bounded like flag waits.
#[derive(Debug)]
pub struct CoreBarrier {
    name: String,
    parties: usize,
    timeout: Duration,
    state: Mutex<BarrierState>,
    cv: Condvar,
}

#[derive(Debug, Default)]
struct BarrierState {
    arrived: usize,
    generation: u64,
}

impl CoreBarrier {
    pub fn new(name: impl Into<String>, parties: usize, timeout: Duration) -> Self {
        CoreBarrier {
            name: name.into(),
            parties,
            timeout,
            state: Mutex::new(BarrierState::default()),
            cv: Condvar::new(),
        }
    }

    pub fn wait(&self) -> Result<(), SyncError> {
        let mut state = self.state.lock();
        let generation = state.generation;
        state.arrived += 1;
        if state.arrived == self.parties {
            trace!("barrier {} released", self.name);
            state.arrived = 0;
            state.generation += 1;
            self.cv.notify_all();
            return Ok(());
        }
        let deadline = Instant::now() + self.timeout;
        while state.generation == generation {
            if self.cv.wait_until(&mut state, deadline).timed_out() && state.generation == generation {
                return Err(SyncError::Deadlock {
                    flag: self.name.clone(),
                    timeout: self.timeout,
                });
            }
        }
        Ok(())
    }
}
