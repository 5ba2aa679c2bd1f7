//! Iteration spaces.
//!
//! A [`Grid`] declares per-axis extents, each static or supplied at call time.
//! Binding the dynamic extents yields a [`BoundGrid`], which enumerates
//! coordinates in row-major order, optionally restricted to one core's share
//! of a split axis.

use smallvec::SmallVec;
use snafu::{OptionExt, ensure};

use crate::error::*;

/// Grid coordinate.
pub type Coord = SmallVec<[u64; 4]>;

/// Extent of one grid axis as declared.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GridDim {
    Static(u64),
    /// Supplied at call time; `max` bounds it for padding and validation.
    Dynamic { max: u64 },
}

impl GridDim {
    pub const DEFAULT_DYNAMIC_MAX: u64 = i32::MAX as u64;

    pub const fn dynamic() -> Self {
        Self::Dynamic { max: Self::DEFAULT_DYNAMIC_MAX }
    }

    /// Upper bound of the axis extent.
    pub const fn bound(&self) -> u64 {
        match self {
            Self::Static(n) => *n,
            Self::Dynamic { max } => *max,
        }
    }

    pub const fn is_dynamic(&self) -> bool {
        matches!(self, Self::Dynamic { .. })
    }
}

impl From<u64> for GridDim {
    fn from(extent: u64) -> Self {
        Self::Static(extent)
    }
}

/// Trip count of an axis as seen by a kernel body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Extent {
    /// Known when the call was built.
    Static(u64),
    /// Only known at run time; do not assume it is constant across calls.
    Dynamic(u64),
}

impl Extent {
    pub const fn get(&self) -> u64 {
        match self {
            Self::Static(n) | Self::Dynamic(n) => *n,
        }
    }

    pub const fn as_static(&self) -> Option<u64> {
        match self {
            Self::Static(n) => Some(*n),
            Self::Dynamic(_) => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Grid {
    dims: SmallVec<[GridDim; 4]>,
}

impl Grid {
    pub fn new<D: Into<GridDim>>(dims: impl IntoIterator<Item = D>) -> Self {
        Self { dims: dims.into_iter().map(Into::into).collect() }
    }

    pub fn rank(&self) -> usize {
        self.dims.len()
    }

    pub fn dims(&self) -> &[GridDim] {
        &self.dims
    }

    pub fn num_dynamic(&self) -> usize {
        self.dims.iter().filter(|d| d.is_dynamic()).count()
    }

    /// Product of the per-axis upper bounds, `None` if it does not fit in 128 bits.
    pub fn padded_volume(&self) -> Option<u128> {
        self.dims.iter().try_fold(1u128, |acc, dim| acc.checked_mul(dim.bound() as u128))
    }

    /// Bind dynamic extents, in axis order.
    pub fn bind(&self, dynamic: &[u64]) -> Result<BoundGrid> {
        ensure!(
            dynamic.len() == self.num_dynamic(),
            DynamicExtentCountSnafu { expected: self.num_dynamic(), actual: dynamic.len() }
        );

        let mut values = dynamic.iter();
        let mut extents = SmallVec::<[Extent; 4]>::new();
        for (axis, dim) in self.dims.iter().enumerate() {
            match dim {
                GridDim::Static(n) => extents.push(Extent::Static(*n)),
                GridDim::Dynamic { max } => {
                    let extent = values.next().copied().unwrap_or_default();
                    ensure!(extent <= *max, DynamicExtentOutOfRangeSnafu { axis, extent, max: *max });
                    extents.push(Extent::Dynamic(extent));
                }
            }
        }

        let steps = extents
            .iter()
            .try_fold(1u128, |acc, extent| acc.checked_mul(extent.get() as u128))
            .unwrap_or(u128::MAX);
        ensure!(steps <= i64::MAX as u128, GridTooLargeSnafu { steps });
        tracing::debug!(rank = self.rank(), steps = steps as u64, "bound grid");
        Ok(BoundGrid { extents, steps: steps as u64 })
    }
}

/// Contiguous share of one axis assigned to a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreRange {
    pub axis: usize,
    pub start: u64,
    pub end: u64,
}

/// A grid with every extent known.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BoundGrid {
    extents: SmallVec<[Extent; 4]>,
    steps: u64,
}

impl BoundGrid {
    pub fn rank(&self) -> usize {
        self.extents.len()
    }

    pub fn extents(&self) -> &[Extent] {
        &self.extents
    }

    pub fn num_steps(&self) -> u64 {
        self.steps
    }

    /// Row-major position of `coord` in the whole grid.
    pub fn linear_index(&self, coord: &[u64]) -> u64 {
        coord.iter().zip(&self.extents).fold(0, |acc, (c, e)| acc * e.get() + c)
    }

    /// Split `axis` across `num_cores` cores; core `c` gets the `c`-th ceil-sized chunk.
    pub fn split(&self, axis: usize, num_cores: usize) -> Vec<CoreRange> {
        let extent = self.extents.get(axis).map_or(0, Extent::get);
        let chunk = extent.div_ceil(num_cores.max(1) as u64);
        (0..num_cores as u64)
            .map(|core| {
                let start = (core * chunk).min(extent);
                CoreRange { axis, start, end: (start + chunk).min(extent) }
            })
            .collect()
    }

    /// Row-major coordinates, restricted to `range` when given.
    pub fn iter(&self, range: Option<CoreRange>) -> GridIter {
        let mut lower: Coord = SmallVec::from_elem(0, self.rank());
        let mut upper: Coord = self.extents.iter().map(Extent::get).collect();
        if let Some(range) = range {
            lower[range.axis] = range.start;
            upper[range.axis] = range.end;
        }
        let empty = lower.iter().zip(&upper).any(|(lo, hi)| lo >= hi);
        GridIter { next: (!empty).then(|| lower.clone()), lower, upper }
    }
}

/// Row-major coordinate iterator over a box of the grid.
#[derive(Debug, Clone)]
pub struct GridIter {
    lower: Coord,
    upper: Coord,
    next: Option<Coord>,
}

impl Iterator for GridIter {
    type Item = Coord;

    fn next(&mut self) -> Option<Coord> {
        let current = self.next.take()?;
        let mut advanced = current.clone();
        for axis in (0..advanced.len()).rev() {
            advanced[axis] += 1;
            if advanced[axis] < self.upper[axis] {
                self.next = Some(advanced);
                return Some(current);
            }
            advanced[axis] = self.lower[axis];
        }
        Some(current)
    }
}

/// Position of the current step, passed explicitly to index maps and bodies.
#[derive(Debug, Clone)]
pub struct GridContext {
    pub(crate) coord: Coord,
    pub(crate) extents: SmallVec<[Extent; 4]>,
    /// Row-major position in the whole grid.
    pub(crate) step: u64,
}

impl GridContext {
    pub fn new(grid: &BoundGrid, coord: Coord) -> Self {
        let step = grid.linear_index(&coord);
        Self { coord, extents: grid.extents.clone(), step }
    }

    pub fn program_id(&self, axis: usize) -> Result<u64> {
        self.coord.get(axis).copied().context(InvalidGridAxisSnafu { axis, rank: self.coord.len() })
    }

    pub fn num_programs(&self, axis: usize) -> Result<Extent> {
        self.extents.get(axis).copied().context(InvalidGridAxisSnafu { axis, rank: self.extents.len() })
    }

    pub fn coord(&self) -> &[u64] {
        &self.coord
    }

    pub fn step(&self) -> u64 {
        self.step
    }
}
