//! Block specs and index maps.
//!
//! A [`BlockSpec`] describes which window of an operand the kernel body sees at
//! each grid step. Its [`IndexMap`] turns the grid coordinate (plus any
//! scalar-prefetch refs) into per-axis offsets, in blocks for blocked indexing
//! and in elements for unblocked indexing.

use std::fmt;
use std::sync::Arc;

use bon::bon;
use smallvec::{SmallVec, smallvec};
use snafu::{OptionExt, ensure};
use tessel_device::{Index, MemorySpace, Ref, Shape};
use tessel_dtype::ScalarDType;

use crate::error::*;

// ============================================================================
// INDEX MAPS
// ============================================================================

/// Arguments of an index map: the grid coordinate followed by the scalar-prefetch refs.
#[derive(Debug, Clone, Copy)]
pub struct IndexArgs<'a> {
    coord: &'a [u64],
    prefetch: &'a [Ref],
}

impl<'a> IndexArgs<'a> {
    pub fn new(coord: &'a [u64], prefetch: &'a [Ref]) -> Self {
        Self { coord, prefetch }
    }

    pub fn len(&self) -> usize {
        self.coord.len() + self.prefetch.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn program_id(&self, axis: usize) -> Result<i64> {
        let id = self.coord.get(axis).context(InvalidGridAxisSnafu { axis, rank: self.coord.len() })?;
        Ok(*id as i64)
    }

    pub fn coord(&self) -> &[u64] {
        self.coord
    }

    pub fn prefetch(&self, operand: usize) -> Result<&Ref> {
        self.prefetch.get(operand).context(InvalidPrefetchOperandSnafu { operand, count: self.prefetch.len() })
    }

    /// Integer element of prefetch operand `operand`.
    pub fn scalar(&self, operand: usize, index: &[usize]) -> Result<i64> {
        Ok(self.prefetch(operand)?.load_index(index)?)
    }
}

type IndexMapFn = dyn Fn(&IndexArgs<'_>) -> Result<Vec<i64>> + Send + Sync;

/// Pure function from grid coordinate and prefetched scalars to block offsets.
///
/// The arity is declared up front and must equal the grid rank plus the number
/// of scalar-prefetch operands.
#[derive(Clone)]
pub struct IndexMap {
    arity: usize,
    f: Arc<IndexMapFn>,
}

impl IndexMap {
    pub fn new(arity: usize, f: impl Fn(&IndexArgs<'_>) -> Result<Vec<i64>> + Send + Sync + 'static) -> Self {
        Self { arity, f: Arc::new(f) }
    }

    /// Index map that only looks at the grid coordinate.
    pub fn from_coords(arity: usize, f: impl Fn(&[i64]) -> Vec<i64> + Send + Sync + 'static) -> Self {
        Self::new(arity, move |args| {
            let coord: SmallVec<[i64; 4]> = args.coord().iter().map(|&c| c as i64).collect();
            Ok(f(&coord))
        })
    }

    pub fn arity(&self) -> usize {
        self.arity
    }

    pub fn eval(&self, args: &IndexArgs<'_>) -> Result<Vec<i64>> {
        (self.f)(args)
    }
}

impl fmt::Debug for IndexMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IndexMap").field("arity", &self.arity).finish_non_exhaustive()
    }
}

// ============================================================================
// BLOCK SPECS
// ============================================================================

/// Size of a block along one array axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockDim {
    /// The whole axis, every step. The index map output for the axis is ignored.
    Full,
    Blocked(usize),
    /// A single position chosen by the index map; the axis is dropped from the body's view.
    Squeezed,
}

impl From<usize> for BlockDim {
    fn from(size: usize) -> Self {
        Self::Blocked(size)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IndexingMode {
    /// Index map returns block indices.
    #[default]
    Blocked,
    /// Index map returns element offsets; windows may reach into `(low, high)` padding per axis.
    Unblocked { padding: Option<Vec<(usize, usize)>> },
}

#[derive(Debug, Clone)]
pub struct BlockSpec {
    /// `None` covers the whole array.
    pub block_shape: Option<Vec<BlockDim>>,
    /// `None` always selects the first block.
    pub index_map: Option<IndexMap>,
    pub memory_space: MemorySpace,
    pub indexing_mode: IndexingMode,
}

impl Default for BlockSpec {
    fn default() -> Self {
        Self::whole(MemorySpace::Vmem)
    }
}

#[bon]
impl BlockSpec {
    #[builder]
    pub fn new(
        block_shape: Option<Vec<BlockDim>>,
        index_map: Option<IndexMap>,
        #[builder(default = MemorySpace::Vmem)] memory_space: MemorySpace,
        #[builder(default)] indexing_mode: IndexingMode,
    ) -> Self {
        Self { block_shape, index_map, memory_space, indexing_mode }
    }

    /// Blocked VMEM window.
    pub fn blocked(block_shape: impl IntoIterator<Item = impl Into<BlockDim>>, index_map: IndexMap) -> Self {
        Self {
            block_shape: Some(block_shape.into_iter().map(Into::into).collect()),
            index_map: Some(index_map),
            memory_space: MemorySpace::Vmem,
            indexing_mode: IndexingMode::Blocked,
        }
    }

    /// The whole operand in `space`. `ANY`/`HBM` operands are handed to the body unstaged.
    pub fn whole(space: MemorySpace) -> Self {
        Self { block_shape: None, index_map: None, memory_space: space, indexing_mode: IndexingMode::Blocked }
    }

    pub fn any() -> Self {
        Self::whole(MemorySpace::Any)
    }

    pub fn smem() -> Self {
        Self::whole(MemorySpace::Smem)
    }
}

/// Shape and element type of an operand.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShapeDtype {
    pub shape: Vec<usize>,
    pub dtype: ScalarDType,
}

impl ShapeDtype {
    pub fn new(shape: &[usize], dtype: ScalarDType) -> Self {
        Self { shape: shape.to_vec(), dtype }
    }

    pub fn of(buffer: &tessel_device::Buffer) -> Self {
        Self::new(buffer.shape(), buffer.dtype())
    }

    pub fn bytes(&self) -> usize {
        self.shape.iter().product::<usize>() * self.dtype.bytes()
    }
}

// ============================================================================
// WINDOWS
// ============================================================================

/// Element region of an operand selected for one step.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Window {
    pub start: SmallVec<[i64; 4]>,
    pub shape: Shape,
    /// Whether the window lies inside the array (or its declared padding).
    pub in_bounds: bool,
}

impl Window {
    /// Slices of the array and of the window covering their intersection.
    pub fn clip(&self, array: &[usize]) -> Option<(Vec<Index>, Vec<Index>)> {
        let mut src = Vec::with_capacity(array.len());
        let mut dst = Vec::with_capacity(array.len());
        for ((&start, &size), &dim) in self.start.iter().zip(&self.shape).zip(array) {
            let lo = start.max(0);
            let hi = start.saturating_add(size as i64).min(dim as i64);
            if lo >= hi {
                return None;
            }
            let len = (hi - lo) as usize;
            src.push(Index::ds(lo as usize, len));
            dst.push(Index::ds((lo - start) as usize, len));
        }
        Some((src, dst))
    }

    /// Whether the window covers part of the array outside it, e.g. a partial last block.
    pub fn is_partial(&self, array: &[usize]) -> bool {
        self.start
            .iter()
            .zip(&self.shape)
            .zip(array)
            .any(|((&start, &size), &dim)| start < 0 || start.saturating_add(size as i64) > dim as i64)
    }
}

/// A block spec checked against its operand.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedBlock {
    pub operand: String,
    pub dims: SmallVec<[BlockDim; 4]>,
    pub index_map: Option<IndexMap>,
    pub space: MemorySpace,
    pub unblocked: bool,
    pub padding: SmallVec<[(usize, usize); 4]>,
    pub array: ShapeDtype,
}

impl ResolvedBlock {
    pub fn resolve(spec: &BlockSpec, operand: String, array: &ShapeDtype, arity: usize) -> Result<Self> {
        let rank = array.shape.len();
        let dims: SmallVec<[BlockDim; 4]> = match &spec.block_shape {
            Some(dims) => dims.iter().copied().collect(),
            None => smallvec![BlockDim::Full; rank],
        };
        ensure!(
            dims.len() == rank,
            BlockRankMismatchSnafu { operand: operand.clone(), block_rank: dims.len(), array_rank: rank }
        );
        ensure!(!dims.contains(&BlockDim::Blocked(0)), EmptyBlockSnafu { operand: operand.clone() });

        if let Some(map) = &spec.index_map {
            ensure!(
                map.arity() == arity,
                IndexMapAritySnafu { operand: operand.clone(), expected: arity, actual: map.arity() }
            );
        }

        let (unblocked, padding) = match &spec.indexing_mode {
            IndexingMode::Blocked => (false, smallvec![(0, 0); rank]),
            IndexingMode::Unblocked { padding: None } => (true, smallvec![(0, 0); rank]),
            IndexingMode::Unblocked { padding: Some(padding) } => {
                ensure!(
                    padding.len() == rank,
                    PaddingRankMismatchSnafu { operand: operand.clone(), padding_rank: padding.len(), array_rank: rank }
                );
                (true, padding.iter().copied().collect())
            }
        };

        Ok(Self { operand, dims, index_map: spec.index_map.clone(), space: spec.memory_space, unblocked, padding, array: array.clone() })
    }

    pub fn is_staged(&self) -> bool {
        self.space.requires_staging()
    }

    /// Shape of the staged window buffer; squeezed axes keep size 1.
    pub fn window_shape(&self) -> Shape {
        self.dims
            .iter()
            .zip(&self.array.shape)
            .map(|(dim, &size)| match dim {
                BlockDim::Full => size,
                BlockDim::Blocked(n) => *n,
                BlockDim::Squeezed => 1,
            })
            .collect()
    }

    pub fn window_bytes(&self) -> usize {
        self.window_shape().iter().product::<usize>() * self.array.dtype.bytes()
    }

    /// Indexer turning a window buffer into the ref the body sees.
    pub fn kernel_indices(&self) -> Vec<Index> {
        self.dims.iter().map(|dim| if *dim == BlockDim::Squeezed { Index::At(0) } else { Index::Full }).collect()
    }

    pub fn window(&self, args: &IndexArgs<'_>) -> Result<Window> {
        let rank = self.dims.len();
        let offsets = match &self.index_map {
            Some(map) => map.eval(args)?,
            None => vec![0; rank],
        };
        ensure!(
            offsets.len() == rank,
            IndexMapResultAritySnafu { operand: self.operand.clone(), expected: rank, actual: offsets.len() }
        );

        let shape = self.window_shape();
        let mut start = SmallVec::<[i64; 4]>::with_capacity(rank);
        let mut in_bounds = true;
        for axis in 0..rank {
            let dim = self.array.shape[axis] as i64;
            let size = shape[axis] as i64;
            // Offsets may come from prefetched data; saturated values always fall outside the array.
            let offset = match self.dims[axis] {
                BlockDim::Full => 0,
                BlockDim::Blocked(_) | BlockDim::Squeezed if self.unblocked => offsets[axis],
                BlockDim::Blocked(_) | BlockDim::Squeezed => offsets[axis].saturating_mul(size),
            };
            if self.dims[axis] != BlockDim::Full {
                let (low, high) = self.padding[axis];
                in_bounds &= if self.unblocked {
                    offset >= -(low as i64) && offset.saturating_add(size) <= dim + high as i64
                } else {
                    offset >= 0 && (offset < dim || dim == 0)
                };
            }
            start.push(offset);
        }
        Ok(Window { start, shape, in_bounds })
    }
}
