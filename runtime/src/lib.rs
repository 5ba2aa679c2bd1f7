//! Grid-scheduled kernel execution for tessel.
//!
//! A [`KernelCall`] runs a [`KernelBody`] once per coordinate of a [`Grid`],
//! handing it windows of larger operands selected by each operand's
//! [`BlockSpec`]. The driver stages windows between HBM and on-chip memory
//! with the DMA engine of `tessel-device`, double-buffering them so the next
//! step's data moves while the current step computes.
//!
//! # Pieces
//!
//! - `grid`: static and dynamic iteration spaces, megacore splitting
//! - `block_spec`: block shapes and index maps (blocked and unblocked indexing)
//! - `grid_spec`: grid plus operand specs, scalar prefetch and scratch
//! - `scope`: scoped buffers and semaphores with guaranteed release
//! - `kernel`: the context a body runs in
//! - `call`: validation, lowering and dispatch on a device or a mesh
//!
//! Runtime checks do not abort the grid: failures come back in
//! [`CallOutput::failures`] next to the outputs.

pub mod block_spec;
pub mod call;
pub mod check;
pub mod config;
pub mod error;
pub mod grid;
pub mod grid_spec;
pub mod kernel;
pub mod scope;

mod driver;
mod pipeline;
mod prefetch;


pub use block_spec::{BlockDim, BlockSpec, IndexArgs, IndexMap, IndexingMode, ShapeDtype, Window};
pub use call::{CallOutput, KernelCall, Lowered, MIN_INTERNAL_SCRATCH_BYTES, MemoryAnalysis};
pub use check::{CheckFailure, CheckKind};
pub use config::{CheckHook, CompilerParams, CostEstimate, DimensionSemantics};
pub use error::*;
pub use grid::{BoundGrid, Coord, CoreRange, Extent, Grid, GridContext, GridDim, GridIter};
pub use grid_spec::GridSpec;
pub use kernel::{KernelBody, KernelContext, KernelRefs, kernel};
pub use scope::{Allocation, Effect, EffectSet, Handle, Handles};
