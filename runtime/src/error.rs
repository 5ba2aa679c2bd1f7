//! Error types for building and running kernel calls.

use snafu::Snafu;
use tessel_device::MemorySpace;

use crate::check::CheckFailure;

/// Result type for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors that can occur while building, lowering or running a kernel call.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Error raised by the memory model (copies, semaphores, allocation).
    #[snafu(context(false), display("{source}"))]
    Device { source: tessel_device::Error },

    #[snafu(display("{operand}: block rank {block_rank} does not match array rank {array_rank}"))]
    BlockRankMismatch { operand: String, block_rank: usize, array_rank: usize },

    #[snafu(display("{operand}: padding rank {padding_rank} does not match array rank {array_rank}"))]
    PaddingRankMismatch { operand: String, padding_rank: usize, array_rank: usize },

    #[snafu(display("{operand}: a block dimension of size 0 is not allowed"))]
    EmptyBlock { operand: String },

    /// Index map takes a different number of arguments than grid rank plus scalar prefetch.
    #[snafu(display("{operand}: index map takes {actual} arguments, expected {expected}"))]
    IndexMapArity { operand: String, expected: usize, actual: usize },

    #[snafu(display("{operand}: index map returned {actual} values for a block of rank {expected}"))]
    IndexMapResultArity { operand: String, expected: usize, actual: usize },

    #[snafu(display("grid axis {axis} is out of range for a grid of rank {rank}"))]
    InvalidGridAxis { axis: usize, rank: usize },

    #[snafu(display("scalar prefetch operand {operand} does not exist, the call has {count}"))]
    InvalidPrefetchOperand { operand: usize, count: usize },

    #[snafu(display("expected {expected} {kind}, got {actual}"))]
    OperandCount { kind: &'static str, expected: usize, actual: usize },

    #[snafu(display("input {input} cannot alias output {output}: {reason}"))]
    InvalidAlias { input: usize, output: usize, reason: &'static str },

    #[snafu(display("input {input} ({input_bytes} bytes) and output {output} ({output_bytes} bytes) are aliased but differ"))]
    AliasSizeMismatch { input: usize, output: usize, input_bytes: usize, output_bytes: usize },

    #[snafu(display("Requested internal scratch size {requested} needs to be at least {minimum}"))]
    InsufficientInternalScratch { requested: usize, minimum: usize },

    #[snafu(display("cannot split grid axis {axis:?} across cores: {reason}"))]
    InvalidMegacoreAxis { axis: Option<usize>, reason: &'static str },

    #[snafu(display("{actual} dimension semantics given for a grid of rank {expected}"))]
    DimensionSemanticsRank { expected: usize, actual: usize },

    #[snafu(display("{space} usage of {requested} bytes exceeds the limit of {limit} bytes"))]
    MemoryLimitExceeded { space: MemorySpace, requested: usize, limit: usize },

    #[snafu(display("grid of {steps} steps exceeds the signed 64-bit range"))]
    GridTooLarge { steps: u128 },

    #[snafu(display("expected {expected} dynamic grid extents, got {actual}"))]
    DynamicExtentCount { expected: usize, actual: usize },

    #[snafu(display("dynamic extent {extent} of axis {axis} exceeds its declared maximum {max}"))]
    DynamicExtentOutOfRange { axis: usize, extent: u64, max: u64 },

    #[snafu(display("semaphore {index} left scope with counter {value}, every signal needs a matching wait"))]
    SemaphoreLeak { index: usize, value: u64 },

    #[snafu(display("semaphore {index} left scope with {count} copies that were never waited"))]
    UnwaitedCopy { index: usize, count: u64 },

    #[snafu(display("handle {index} is not a {expected}"))]
    HandleKind { index: usize, expected: &'static str },

    /// Remote operations need an allocation every device owns a counterpart of.
    #[snafu(display("{what} has no symmetric counterpart on other devices"))]
    NotSymmetric { what: String },

    #[snafu(display("{failure}"))]
    CheckFailed { failure: CheckFailure },
}
