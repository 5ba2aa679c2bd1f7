//! Memory model of the tessel kernel engine.
//!
//! Buffers tagged with a [`MemorySpace`], strided [`Ref`]s into them,
//! counting [`Semaphore`]s, asynchronous copies and device meshes. Devices are
//! emulated on the host: every space is backed by system memory and copies run
//! on the rayon pool.

pub mod allocator;
pub mod buffer;
pub mod device;
pub mod dma;
pub mod error;
pub mod memory_space;
pub mod mesh;
pub mod semaphore;


pub use allocator::{Allocator, BudgetAllocator, CpuAllocator, MemoryUsage};
pub use buffer::{AccessCounts, Buffer, Index, Ref, Shape};
pub use device::{Device, host};
pub use dma::{AsyncCopy, CopyState, RemoteAsyncCopy, async_copy};
pub use error::{Error, Result};
pub use memory_space::MemorySpace;
pub use mesh::{DeviceId, Mesh, Resource, SlotId};
pub use semaphore::{Semaphore, SemaphoreBalance, SemaphoreRef};
