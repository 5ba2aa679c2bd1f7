use snafu::Snafu;
use tessel_dtype::{DType, ScalarDType};

use crate::memory_space::MemorySpace;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, Snafu)]
#[snafu(visibility(pub))]
pub enum Error {
    /// Host data does not match the size of the target buffer.
    #[snafu(display("size mismatch: expected {expected} bytes, got {actual}"))]
    SizeMismatch { expected: usize, actual: usize },

    #[snafu(display("element type mismatch: buffer holds {actual}, accessed as {expected}"))]
    ElementMismatch { expected: ScalarDType, actual: ScalarDType },

    #[snafu(display("{dtype} elements cannot be used as indices"))]
    NotAnIndex { dtype: ScalarDType },

    /// Index or slice out of range for a ref dimension.
    #[snafu(display("index {index} (len {len}) out of bounds for axis {axis} of size {dim}"))]
    IndexOutOfBounds { axis: usize, index: usize, len: usize, dim: usize },

    #[snafu(display("too many indices: {given} for a ref of rank {rank}"))]
    TooManyIndices { given: usize, rank: usize },

    /// Element access through a ref that the kernel body cannot touch directly.
    #[snafu(display("{space} refs cannot be accessed directly from a kernel body, copy them first"))]
    MemorySpaceViolation { space: MemorySpace },

    #[snafu(display("{space} allocation of {requested} bytes exceeds the limit of {limit} bytes"))]
    MemoryLimitExceeded { space: MemorySpace, requested: usize, limit: usize },

    /// Copies may not drop both tiled (innermost) axes of a ref.
    #[snafu(display("cannot squeeze both innermost axes of a {base_rank}-d ref (view shape {shape:?})"))]
    SqueezedTiledAxes { shape: Vec<usize>, base_rank: usize },

    #[snafu(display("copy shape mismatch: source {src:?} has a different element count than destination {dst:?}"))]
    CopyShapeMismatch { src: Vec<usize>, dst: Vec<usize> },

    #[snafu(display("copy dtype mismatch: {src} -> {dst}"))]
    DTypeMismatch { src: DType, dst: DType },

    #[snafu(display("cannot {op} on non-scalar semaphore of shape {shape:?}"))]
    NonScalarSemaphore { op: &'static str, shape: Vec<usize> },

    #[snafu(display("cannot {op} a copy that is {state}"))]
    InvalidCopyState { op: &'static str, state: &'static str },

    /// Only raised when the debug deadlock detector is enabled.
    #[snafu(display("semaphore wait timed out after {waited_ms}ms: wanted {amount}, counter at {value}"))]
    SemaphoreTimeout { waited_ms: u128, amount: u64, value: u64 },

    #[snafu(display("timed out after {waited_ms}ms waiting for device {device} to allocate {slot}"))]
    SlotTimeout { device: usize, slot: String, waited_ms: u128 },

    #[snafu(display("slot {slot} on device {device} holds a {found}, expected a {expected}"))]
    SlotKind { device: usize, slot: String, found: &'static str, expected: &'static str },

    /// Device id outside the mesh.
    #[snafu(display("invalid device: {device}"))]
    InvalidDevice { device: String },

    #[snafu(display("barrier semaphores require a collective id"))]
    MissingCollectiveId,
}
