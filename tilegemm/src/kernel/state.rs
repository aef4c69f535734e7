use log::trace;
use std::fmt::{self, Display};
use std::time::Duration;

use crate::arch::{CoreRole, HwCounters};
use crate::select::KernelKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum CoreState {
    Idle,
    /// Buffers reserved and flags created.
    Prologue,
    Loop,
    /// Waiting for outstanding cross-core flags.
    Drain,
    Terminated,
}

impl CoreState {
    fn successor(self) -> Option<CoreState> {
        match self {
            CoreState::Idle => Some(CoreState::Prologue),
            CoreState::Prologue => Some(CoreState::Loop),
            CoreState::Loop => Some(CoreState::Drain),
            CoreState::Drain => Some(CoreState::Terminated),
            CoreState::Terminated => None,
        }
    }
}

/// Follows one core through its states, counting the loops it runs.
#[derive(Debug)]
pub(crate) struct CoreTracker {
    core: u32,
    role: CoreRole,
    state: CoreState,
    loops: u32,
}

impl CoreTracker {
    pub(crate) fn new(core: u32, role: CoreRole) -> Self {
        CoreTracker {
            core,
            role,
            state: CoreState::Idle,
            loops: 0,
        }
    }

    pub(crate) fn advance(&mut self, to: CoreState) {
        debug_assert_eq!(self.state.successor(), Some(to), "{}-{}", self.role, self.core);
        trace!("{}-{}: {} -> {}", self.role, self.core, self.state, to);
        self.state = to;
    }

    pub(crate) fn tick(&mut self) {
        debug_assert_eq!(self.state, CoreState::Loop);
        self.loops += 1;
    }

    /// Walk the remaining states to [CoreState::Terminated] and report.
    pub(crate) fn finish(mut self, counters: HwCounters) -> CoreReport {
        while let Some(next) = self.state.successor() {
            self.advance(next);
        }
        CoreReport {
            core: self.core,
            role: self.role,
            state: self.state,
            loops: self.loops,
            counters,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CoreReport {
    pub core: u32,
    pub role: CoreRole,
    pub state: CoreState,
    pub loops: u32,
    pub counters: HwCounters,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchReport {
    pub kernel: KernelKind,
    pub block_dim: u32,
    pub cores: Vec<CoreReport>,
    pub counters: HwCounters,
    pub elapsed: Duration,
}

impl LaunchReport {
    /// Loops run by cores of `role`.
    pub fn loops(&self, role: CoreRole) -> u32 {
        self.cores
            .iter()
            .filter(|c| c.role == role)
            .map(|c| c.loops)
            .sum()
    }
}

impl Display for LaunchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} on {} cores in {:.2?}: {}",
            self.kernel, self.block_dim, self.elapsed, self.counters
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_finish_walks_to_terminated() {
        let mut t = CoreTracker::new(3, CoreRole::Cube);
        t.advance(CoreState::Prologue);
        t.advance(CoreState::Loop);
        t.tick();
        t.tick();
        let report = t.finish(HwCounters::default());
        assert_eq!(report.state, CoreState::Terminated);
        assert_eq!(report.loops, 2);
        assert_eq!(report.core, 3);
    }

    #[test]
    #[should_panic]
    #[cfg(debug_assertions)]
    fn test_skipping_a_state_is_caught() {
        let mut t = CoreTracker::new(0, CoreRole::Vector);
        t.advance(CoreState::Loop);
    }
}
