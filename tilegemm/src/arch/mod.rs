//! A software model of the accelerator: global memory shared by all cores, per-core on-chip
//! buffers with byte accounting, intra-core stage events and cross-core flags.

mod events;
mod flags;
mod gm;
mod resource;

pub use events::{SlotState, StageRing};
pub use flags::{
    cross_core_flag, workspace_ring, ConsumerHandle, CoreBarrier, FlagSetter, FlagWaiter, ProducerFlags,
    ProducerHandle, RingCursor, SlotTicket, SyncError, MAX_FLAG_COUNT,
};
pub use gm::GlobalBuffer;
pub use resource::{CoreResource, CounterSink, HwCounters};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, strum::Display)]
pub enum CoreRole {
    /// A cube core: matrix multiply units fed from L1/L0.
    #[strum(serialize = "aic")]
    Cube,
    /// A vector core: elementwise work in UB.
    #[strum(serialize = "aiv")]
    Vector,
}
