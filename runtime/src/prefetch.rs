//! Scalar prefetch: copy small integer operands into SMEM before the grid starts.

use std::sync::Arc;

use tessel_device::{Allocator, AsyncCopy, Buffer, MemorySpace, Ref, Resource, Semaphore, SlotId};
use tessel_dtype::SemaphoreKind;

use crate::error::*;
use crate::kernel::CoreEnv;

/// Stage every prefetch operand into SMEM and register it as input slot `k`.
///
/// The copies are waited before returning, so index maps of step 0 already see
/// the values.
pub(crate) fn stage(env: &CoreEnv<'_>, operands: &[Buffer]) -> Result<Vec<Ref>> {
    let sem = Semaphore::new(SemaphoreKind::Dma, &[], env.params.deadlock_timeout).view();
    let allocator: &Arc<dyn Allocator> = &env.allocator;

    let mut staged = Vec::with_capacity(operands.len());
    for (k, operand) in operands.iter().enumerate() {
        let smem = Buffer::allocate(Arc::clone(allocator), MemorySpace::Smem, operand.dtype(), operand.shape())?;
        let mut copy = AsyncCopy::new(&operand.view(), &smem.view(), &sem)?;
        copy.start()?;
        copy.wait()?;
        env.mesh.register(env.device, env.core, SlotId::Input(k), Resource::Buffer(smem.clone()))?;
        staged.push(smem.view());
    }
    tracing::debug!(device = env.device, core = env.core, operands = staged.len(), "scalar prefetch staged");
    Ok(staged)
}
