//! Block-level engines: the cube pipeline computing one output block, and the vector-core
//! passes (epilogues, split-K reduction, padding) that surround it.

mod epilogue;
mod mmad;
mod padding;
mod vector;

pub use epilogue::{Activation, Epilogue};
pub use mmad::{BlockMmad, BlockTask, Callback, DispatchPolicy};
pub use padding::padded_nd_layout;
pub use vector::{sub_block_rows, VectorCore};
