use parking_lot::Mutex;
use snafu::ensure;
use strum::EnumCount;

use crate::error::{MemoryLimitExceededSnafu, Result};
use crate::memory_space::MemorySpace;

pub trait Allocator: Send + Sync + std::fmt::Debug {
    /// Allocate `size` zeroed bytes in `space`.
    fn alloc(&self, space: MemorySpace, size: usize) -> Result<Box<[u8]>>;
    fn free(&self, _space: MemorySpace, _size: usize) {}
    fn name(&self) -> &str;
}

/// Host allocator backing every memory space with system memory.
#[derive(Debug, Clone)]
pub struct CpuAllocator;

impl Allocator for CpuAllocator {
    fn alloc(&self, _space: MemorySpace, size: usize) -> Result<Box<[u8]>> {
        Ok(vec![0u8; size].into_boxed_slice())
    }

    fn name(&self) -> &str {
        "CPU"
    }
}

/// Byte accounting for one memory space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryUsage {
    pub live: usize,
    pub peak: usize,
    /// Number of allocations ever made.
    pub allocations: usize,
}

/// Allocator that tracks live bytes per memory space and enforces per-space limits.
#[derive(Debug)]
pub struct BudgetAllocator {
    inner: Box<dyn Allocator>,
    limits: [Option<usize>; MemorySpace::COUNT],
    usage: Mutex<[MemoryUsage; MemorySpace::COUNT]>,
    name: String,
}

impl BudgetAllocator {
    pub fn new(inner: Box<dyn Allocator>) -> Self {
        let name = format!("{}(budget)", inner.name());
        Self { inner, limits: [None; MemorySpace::COUNT], usage: Mutex::new(Default::default()), name }
    }

    /// Host allocator with the default on-chip limits.
    pub fn cpu() -> Self {
        Self::new(Box::new(CpuAllocator))
            .with_limit(MemorySpace::Vmem, MemorySpace::Vmem.default_limit())
            .with_limit(MemorySpace::Smem, MemorySpace::Smem.default_limit())
    }

    pub fn with_limit(mut self, space: MemorySpace, limit: Option<usize>) -> Self {
        self.limits[space.index()] = limit;
        self
    }

    pub fn limit(&self, space: MemorySpace) -> Option<usize> {
        self.limits[space.index()]
    }

    pub fn usage(&self, space: MemorySpace) -> MemoryUsage {
        self.usage.lock()[space.index()]
    }

    /// Bytes still available in `space`, `None` when unlimited.
    pub fn available(&self, space: MemorySpace) -> Option<usize> {
        let live = self.usage(space).live;
        self.limit(space).map(|limit| limit.saturating_sub(live))
    }
}

impl Allocator for BudgetAllocator {
    fn alloc(&self, space: MemorySpace, size: usize) -> Result<Box<[u8]>> {
        let mut usage = self.usage.lock();
        let entry = &mut usage[space.index()];
        let requested = entry.live + size;
        if let Some(limit) = self.limits[space.index()] {
            ensure!(requested <= limit, MemoryLimitExceededSnafu { space, requested, limit });
        }

        let data = self.inner.alloc(space, size)?;
        entry.live = requested;
        entry.peak = entry.peak.max(requested);
        entry.allocations += 1;
        tracing::trace!(%space, size, live = entry.live, "allocated");
        Ok(data)
    }

    fn free(&self, space: MemorySpace, size: usize) {
        let mut usage = self.usage.lock();
        let entry = &mut usage[space.index()];
        entry.live = entry.live.saturating_sub(size);
        self.inner.free(space, size);
    }

    fn name(&self) -> &str {
        &self.name
    }
}
