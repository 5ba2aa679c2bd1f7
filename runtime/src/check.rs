//! Step-indexed failures reported alongside call outputs.

use std::fmt;

use crate::grid::GridContext;

#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum CheckKind {
    /// Raised by `KernelContext::check`.
    #[strum(to_string = "check")]
    User,
    /// An index map selected a window outside the (padded) array.
    #[strum(to_string = "out-of-bounds window")]
    OutOfBoundsWindow,
}

/// A failed runtime check. Steps after the failing one still run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckFailure {
    pub kind: CheckKind,
    /// Grid coordinate of the failing step.
    pub coordinate: Vec<u64>,
    /// Row-major position of the coordinate in the whole grid.
    pub step: u64,
    pub device: usize,
    pub core: usize,
    pub message: String,
}

impl fmt::Display for CheckFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} failed at step {} {:?} (device {}, core {}): {}",
            self.kind, self.step, self.coordinate, self.device, self.core, self.message
        )
    }
}

impl CheckFailure {
    pub(crate) fn at(kind: CheckKind, grid: &GridContext, device: usize, core: usize, message: String) -> Self {
        Self { kind, coordinate: grid.coord().to_vec(), step: grid.step(), device, core, message }
    }
}
