use std::sync::Arc;

use once_cell::sync::Lazy;

use tessel_dtype::{Element, ScalarDType};

use crate::allocator::{BudgetAllocator, MemoryUsage};
use crate::buffer::Buffer;
use crate::error::Result;
use crate::memory_space::MemorySpace;

/// One accelerator, emulated on the host.
///
/// Owns the allocator that backs operand (HBM) buffers, so memory accounting of
/// a device is observable across calls.
#[derive(Debug, Clone)]
pub struct Device {
    index: usize,
    allocator: Arc<BudgetAllocator>,
}

impl Device {
    pub fn cpu() -> Self {
        Self::with_index(0)
    }

    pub fn with_index(index: usize) -> Self {
        Self { index, allocator: Arc::new(BudgetAllocator::cpu()) }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn allocator(&self) -> Arc<BudgetAllocator> {
        Arc::clone(&self.allocator)
    }

    pub fn usage(&self, space: MemorySpace) -> MemoryUsage {
        self.allocator.usage(space)
    }

    /// Zero-filled buffer.
    pub fn alloc(&self, space: MemorySpace, dtype: ScalarDType, shape: &[usize]) -> Result<Buffer> {
        Buffer::allocate(self.allocator(), space, dtype, shape)
    }

    pub fn buffer_from<T: Element>(&self, space: MemorySpace, shape: &[usize], values: &[T]) -> Result<Buffer> {
        Buffer::from_slice(self.allocator(), space, shape, values)
    }
}

/// Process-wide default device.
static HOST: Lazy<Device> = Lazy::new(Device::cpu);

/// The shared host device, for callers that do not manage devices themselves.
pub fn host() -> &'static Device {
    &HOST
}
