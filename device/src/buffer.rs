use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use smallvec::SmallVec;
use snafu::{OptionExt, ensure};
use tessel_dtype::{Element, ScalarDType};

use crate::allocator::Allocator;
use crate::error::*;
use crate::memory_space::MemorySpace;

/// Shapes, strides and coordinates (stack-allocated up to rank 4).
pub type Shape = SmallVec<[usize; 4]>;

static NEXT_BUFFER_ID: AtomicU64 = AtomicU64::new(0);

/// Shared storage referenced by every clone of a [`Buffer`] and every [`Ref`] into it.
#[derive(Debug)]
struct BufferData {
    storage: RwLock<Box<[u8]>>,
    allocator: Arc<dyn Allocator>,
    space: MemorySpace,
    dtype: ScalarDType,
    shape: Shape,
    id: u64,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl Drop for BufferData {
    fn drop(&mut self) {
        self.allocator.free(self.space, self.storage.get_mut().len());
    }
}

/// Read/write counters of a buffer, including DMA traffic.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AccessCounts {
    pub reads: u64,
    pub writes: u64,
}

impl AccessCounts {
    /// Accesses made after `earlier` was sampled.
    pub fn since(&self, earlier: &AccessCounts) -> AccessCounts {
        AccessCounts { reads: self.reads - earlier.reads, writes: self.writes - earlier.writes }
    }
}

/// A dense row-major array in one memory space.
///
/// Cloning is cheap and shares storage; storage is returned to the allocator
/// when the last clone (or ref) drops.
#[derive(Debug, Clone)]
pub struct Buffer {
    data: Arc<BufferData>,
}

impl Buffer {
    pub fn allocate(
        allocator: Arc<dyn Allocator>,
        space: MemorySpace,
        dtype: ScalarDType,
        shape: &[usize],
    ) -> Result<Self> {
        let size = dtype.bytes() * shape.iter().product::<usize>();
        let storage = allocator.alloc(space, size)?;
        Ok(Self {
            data: Arc::new(BufferData {
                storage: RwLock::new(storage),
                allocator,
                space,
                dtype,
                shape: Shape::from_slice(shape),
                id: NEXT_BUFFER_ID.fetch_add(1, Ordering::Relaxed),
                reads: AtomicU64::new(0),
                writes: AtomicU64::new(0),
            }),
        })
    }

    pub fn from_slice<T: Element>(
        allocator: Arc<dyn Allocator>,
        space: MemorySpace,
        shape: &[usize],
        values: &[T],
    ) -> Result<Self> {
        let buffer = Self::allocate(allocator, space, T::DTYPE, shape)?;
        buffer.copyin(bytemuck::cast_slice(values))?;
        Ok(buffer)
    }

    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn space(&self) -> MemorySpace {
        self.data.space
    }

    pub fn dtype(&self) -> ScalarDType {
        self.data.dtype
    }

    pub fn shape(&self) -> &[usize] {
        &self.data.shape
    }

    pub fn numel(&self) -> usize {
        self.data.shape.iter().product()
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.numel() * self.data.dtype.bytes()
    }

    pub fn allocator(&self) -> &dyn Allocator {
        &*self.data.allocator
    }

    /// Whether both handles share one allocation.
    pub fn is_same(&self, other: &Buffer) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    /// Copy host bytes into the whole buffer.
    pub fn copyin(&self, src: &[u8]) -> Result<()> {
        let mut storage = self.data.storage.write();
        ensure!(storage.len() == src.len(), SizeMismatchSnafu { expected: storage.len(), actual: src.len() });
        storage.copy_from_slice(src);
        Ok(())
    }

    /// Copy the whole buffer out to host bytes.
    pub fn copyout(&self, dst: &mut [u8]) -> Result<()> {
        let storage = self.data.storage.read();
        ensure!(storage.len() == dst.len(), SizeMismatchSnafu { expected: storage.len(), actual: dst.len() });
        dst.copy_from_slice(&storage);
        Ok(())
    }

    pub fn to_vec<T: Element>(&self) -> Result<Vec<T>> {
        ensure!(T::DTYPE == self.dtype(), ElementMismatchSnafu { expected: T::DTYPE, actual: self.dtype() });
        let mut out = vec![<T as bytemuck::Zeroable>::zeroed(); self.numel()];
        self.copyout(bytemuck::cast_slice_mut(&mut out))?;
        Ok(out)
    }

    pub fn access_counts(&self) -> AccessCounts {
        AccessCounts { reads: self.data.reads.load(Ordering::Acquire), writes: self.data.writes.load(Ordering::Acquire) }
    }

    /// A ref covering the whole buffer.
    pub fn view(&self) -> Ref {
        let rank = self.data.shape.len();
        let mut strides = Shape::from_elem(1, rank);
        for axis in (0..rank.saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.data.shape[axis + 1];
        }
        Ref { buffer: self.clone(), offset: 0, shape: self.data.shape.clone(), strides, axes: (0..rank).collect() }
    }
}

/// One entry of a [`Ref::at`] indexer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Index {
    /// Select one position and drop the axis.
    At(usize),
    /// Keep `len` positions starting at `start`.
    Slice { start: usize, len: usize },
    /// Keep the whole axis.
    Full,
}

impl Index {
    pub const fn ds(start: usize, len: usize) -> Self {
        Self::Slice { start, len }
    }
}

impl From<usize> for Index {
    fn from(index: usize) -> Self {
        Self::At(index)
    }
}

/// Strided view into a [`Buffer`].
#[derive(Debug, Clone)]
pub struct Ref {
    buffer: Buffer,
    /// Element offset of the first element.
    offset: usize,
    shape: Shape,
    strides: Shape,
    /// Axis of the underlying buffer each view dimension comes from.
    axes: Shape,
}

impl Ref {
    pub fn buffer(&self) -> &Buffer {
        &self.buffer
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn rank(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn dtype(&self) -> ScalarDType {
        self.buffer.dtype()
    }

    pub fn space(&self) -> MemorySpace {
        self.buffer.space()
    }

    /// The same window on another buffer of identical shape, e.g. a peer device's copy.
    pub fn on(&self, peer: &Buffer) -> Ref {
        Ref { buffer: peer.clone(), ..self.clone() }
    }

    /// Narrow the ref. Missing trailing indices keep their axes whole.
    pub fn at(&self, indices: &[Index]) -> Result<Ref> {
        ensure!(indices.len() <= self.rank(), TooManyIndicesSnafu { given: indices.len(), rank: self.rank() });

        let mut narrowed =
            Ref { buffer: self.buffer.clone(), offset: self.offset, shape: Shape::new(), strides: Shape::new(), axes: Shape::new() };
        for axis in 0..self.rank() {
            let dim = self.shape[axis];
            let (start, len, keep) = match indices.get(axis).copied().unwrap_or(Index::Full) {
                Index::At(index) => (index, 1, false),
                Index::Slice { start, len } => (start, len, true),
                Index::Full => (0, dim, true),
            };
            ensure!(start + len <= dim, IndexOutOfBoundsSnafu { axis, index: start, len, dim });

            narrowed.offset += start * self.strides[axis];
            if keep {
                narrowed.shape.push(len);
                narrowed.strides.push(self.strides[axis]);
                narrowed.axes.push(self.axes[axis]);
            }
        }
        Ok(narrowed)
    }

    /// Whether both innermost axes of the underlying buffer were indexed away.
    pub fn squeezes_tiled_axes(&self) -> bool {
        let base_rank = self.buffer.shape().len();
        base_rank >= 2 && !self.axes.iter().any(|&axis| axis + 2 >= base_rank)
    }

    pub fn load<T: Element>(&self, index: &[usize]) -> Result<T> {
        self.check_access::<T>()?;
        let offset = self.element_offset(index)?;
        let size = T::DTYPE.bytes();
        let value = {
            let storage = self.buffer.data.storage.read();
            bytemuck::pod_read_unaligned(&storage[offset * size..(offset + 1) * size])
        };
        self.buffer.data.reads.fetch_add(1, Ordering::AcqRel);
        Ok(value)
    }

    pub fn store<T: Element>(&self, index: &[usize], value: T) -> Result<()> {
        self.check_access::<T>()?;
        let offset = self.element_offset(index)?;
        let size = T::DTYPE.bytes();
        self.buffer.data.storage.write()[offset * size..(offset + 1) * size].copy_from_slice(bytemuck::bytes_of(&value));
        self.buffer.data.writes.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Load one integer element widened to `i64`, whatever its integer dtype.
    pub fn load_index(&self, index: &[usize]) -> Result<i64> {
        ensure!(self.space().body_accessible(), MemorySpaceViolationSnafu { space: self.space() });
        let offset = self.element_offset(index)?;
        let size = self.dtype().bytes();
        let value = {
            let storage = self.buffer.data.storage.read();
            self.dtype().decode_index(&storage[offset * size..(offset + 1) * size])
        };
        self.buffer.data.reads.fetch_add(1, Ordering::AcqRel);
        value.context(NotAnIndexSnafu { dtype: self.dtype() })
    }

    /// All elements in row-major order.
    pub fn read_all<T: Element>(&self) -> Result<Vec<T>> {
        self.check_access::<T>()?;
        Ok(bytemuck::pod_collect_to_vec::<u8, T>(&self.gather()))
    }

    pub fn write_all<T: Element>(&self, values: &[T]) -> Result<()> {
        self.check_access::<T>()?;
        ensure!(values.len() == self.numel(), SizeMismatchSnafu { expected: self.numel(), actual: values.len() });
        self.scatter(bytemuck::cast_slice(values));
        Ok(())
    }

    pub fn fill<T: Element>(&self, value: T) -> Result<()> {
        self.write_all(&vec![value; self.numel()])
    }

    /// Apply `f` to every element in place.
    pub fn update<T: Element>(&self, mut f: impl FnMut(T) -> T) -> Result<()> {
        let values = self.read_all::<T>()?;
        self.write_all(&values.into_iter().map(&mut f).collect::<Vec<_>>())
    }

    /// Zero every element regardless of dtype or memory space.
    pub fn zero(&self) {
        self.scatter(&vec![0u8; self.numel() * self.dtype().bytes()]);
    }

    fn check_access<T: Element>(&self) -> Result<()> {
        ensure!(self.space().body_accessible(), MemorySpaceViolationSnafu { space: self.space() });
        ensure!(T::DTYPE == self.dtype(), ElementMismatchSnafu { expected: T::DTYPE, actual: self.dtype() });
        Ok(())
    }

    fn element_offset(&self, index: &[usize]) -> Result<usize> {
        ensure!(index.len() == self.rank(), TooManyIndicesSnafu { given: index.len(), rank: self.rank() });
        let mut offset = self.offset;
        for (axis, (&i, &dim)) in index.iter().zip(&self.shape).enumerate() {
            ensure!(i < dim, IndexOutOfBoundsSnafu { axis, index: i, len: 1usize, dim });
            offset += i * self.strides[axis];
        }
        Ok(offset)
    }

    /// Element offsets of the view in row-major order.
    fn offsets(&self) -> Vec<usize> {
        let mut offsets = vec![self.offset];
        for (&dim, &stride) in self.shape.iter().zip(&self.strides) {
            offsets = offsets.iter().flat_map(|&base| (0..dim).map(move |i| base + i * stride)).collect();
        }
        offsets
    }

    /// Copy the viewed elements out into a packed byte vector.
    pub(crate) fn gather(&self) -> Vec<u8> {
        let size = self.dtype().bytes();
        let mut out = Vec::with_capacity(self.numel() * size);
        {
            let storage = self.buffer.data.storage.read();
            for offset in self.offsets() {
                out.extend_from_slice(&storage[offset * size..(offset + 1) * size]);
            }
        }
        self.buffer.data.reads.fetch_add(1, Ordering::AcqRel);
        out
    }

    /// Write packed bytes into the viewed elements.
    pub(crate) fn scatter(&self, bytes: &[u8]) {
        let size = self.dtype().bytes();
        {
            let mut storage = self.buffer.data.storage.write();
            for (chunk, offset) in bytes.chunks_exact(size).zip(self.offsets()) {
                storage[offset * size..(offset + 1) * size].copy_from_slice(chunk);
            }
        }
        self.buffer.data.writes.fetch_add(1, Ordering::AcqRel);
    }
}
