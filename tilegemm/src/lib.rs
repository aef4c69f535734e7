pub mod arch;
pub mod blob;
pub mod block;
pub mod common;
pub mod kernel;
pub mod layout;
pub mod memorylimits;
pub mod plan;
pub mod platform;
pub mod pprint;
pub mod scheduler;
pub mod select;
pub mod tile;
pub mod tiling;
pub mod utils;
#[cfg(feature = "verification")]
pub mod verification;
