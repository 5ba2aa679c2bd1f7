//! Window pipelines: move operand windows between HBM and on-chip slots.
//!
//! Inputs use two slots when the grid has more than one step: while the body
//! reads one slot, the next step's window is loaded into the other. Outputs
//! also alternate slots so a finished window can be flushed asynchronously
//! while the next one is written. Operands in `ANY`/`HBM` have no slots; the
//! body receives the whole buffer.

use std::sync::Arc;
use std::time::Duration;

use tessel_device::{Allocator, AsyncCopy, Buffer, Index, Ref, Semaphore, SemaphoreRef};
use tessel_dtype::SemaphoreKind;

use crate::block_spec::{ResolvedBlock, Window};
use crate::error::*;

/// Slots per staged operand for a grid of `steps` (padded) steps.
pub(crate) fn window_slots(steps: Option<u128>) -> usize {
    match steps {
        Some(steps) if steps <= 1 => 1,
        _ => 2,
    }
}

#[derive(Debug)]
struct Slot {
    buffer: Buffer,
    sem: SemaphoreRef,
    window: Option<Window>,
    /// Local step the contents were loaded for.
    tag: u64,
    copy: Option<AsyncCopy>,
}

impl Slot {
    fn new(allocator: &Arc<dyn Allocator>, block: &ResolvedBlock, timeout: Option<Duration>) -> Result<Self> {
        let buffer = Buffer::allocate(Arc::clone(allocator), block.space, block.array.dtype, &block.window_shape())?;
        let sem = Semaphore::new(SemaphoreKind::Dma, &[], timeout).view();
        Ok(Self { buffer, sem, window: None, tag: 0, copy: None })
    }

    /// Wait for the copy in flight on this slot, if any.
    fn settle(&mut self) -> Result<()> {
        if let Some(mut copy) = self.copy.take() {
            copy.wait()?;
        }
        Ok(())
    }

    /// Start loading `window` of `array`. The part outside the array reads zero.
    fn load(&mut self, array: &Buffer, window: &Window, tag: u64) -> Result<()> {
        self.settle()?;
        if window.is_partial(array.shape()) {
            self.buffer.view().zero();
        }
        if let Some((src, dst)) = window.clip(array.shape()) {
            let copy = tessel_device::async_copy(&array.view().at(&src)?, &self.buffer.view().at(&dst)?, &self.sem)?;
            self.copy = Some(copy);
        }
        self.window = Some(window.clone());
        self.tag = tag;
        Ok(())
    }

    /// Start writing the in-array part of the held window back to `array`.
    fn flush(&mut self, array: &Buffer) -> Result<()> {
        self.settle()?;
        let Some(window) = self.window.take() else { return Ok(()) };
        if let Some((dst, src)) = window.clip(array.shape()) {
            let copy = tessel_device::async_copy(&self.buffer.view().at(&src)?, &array.view().at(&dst)?, &self.sem)?;
            self.copy = Some(copy);
        }
        Ok(())
    }

    fn view(&self, indices: &[Index]) -> Result<Ref> {
        Ok(self.buffer.view().at(indices)?)
    }
}

fn make_slots(
    block: &ResolvedBlock,
    count: usize,
    allocator: &Arc<dyn Allocator>,
    timeout: Option<Duration>,
) -> Result<Vec<Slot>> {
    if !block.is_staged() {
        return Ok(Vec::new());
    }
    (0..count).map(|_| Slot::new(allocator, block, timeout)).collect()
}

// ============================================================================
// INPUTS
// ============================================================================

#[derive(Debug)]
pub(crate) struct InputPipeline {
    operand: Buffer,
    slots: Vec<Slot>,
    current: usize,
    aliased: bool,
    elide: bool,
    indices: Vec<Index>,
}

impl InputPipeline {
    pub fn new(
        block: &ResolvedBlock,
        operand: Buffer,
        slots: usize,
        aliased: bool,
        elide: bool,
        allocator: &Arc<dyn Allocator>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        // Aliased inputs must observe every flush of their output, so they are never loaded ahead.
        let count = if aliased { 1 } else { slots };
        let slots = make_slots(block, count, allocator, timeout)?;
        Ok(Self { operand, slots, current: 0, aliased, elide: elide && !aliased, indices: block.kernel_indices() })
    }

    /// Buffer the body reads this step.
    pub fn current_buffer(&self) -> &Buffer {
        self.slots.get(self.current).map_or(&self.operand, |slot| &slot.buffer)
    }

    /// Make `window` resident for local step `local` and return the body's view of it.
    pub fn acquire(&mut self, window: &Window, local: u64) -> Result<Ref> {
        if self.slots.is_empty() {
            return Ok(self.operand.view());
        }

        let elide = self.elide;
        let found = self
            .slots
            .iter()
            .position(|slot| slot.window.as_ref() == Some(window) && (elide || slot.tag == local));
        let index = match found {
            Some(index) => {
                if self.slots[index].tag != local {
                    tracing::trace!(local, "input window unchanged, stage-in elided");
                }
                index
            }
            None => {
                let index = if self.slots.len() > 1 { 1 - self.current } else { 0 };
                self.slots[index].load(&self.operand, window, local)?;
                index
            }
        };
        self.slots[index].settle()?;
        self.current = index;
        self.slots[index].view(&self.indices)
    }

    /// Start loading the window of the next local step into the idle slot.
    pub fn prefetch(&mut self, next: &Window, local: u64) -> Result<()> {
        if self.slots.len() < 2 || self.aliased {
            return Ok(());
        }
        if self.elide && self.slots[self.current].window.as_ref() == Some(next) {
            return Ok(());
        }
        let idle = 1 - self.current;
        self.slots[idle].load(&self.operand, next, local)
    }

    pub fn finish(&mut self) -> Result<()> {
        self.slots.iter_mut().try_for_each(Slot::settle)
    }
}

// ============================================================================
// OUTPUTS
// ============================================================================

#[derive(Debug)]
pub(crate) struct OutputPipeline {
    operand: Buffer,
    slots: Vec<Slot>,
    current: usize,
    aliased: bool,
    indices: Vec<Index>,
}

impl OutputPipeline {
    pub fn new(
        block: &ResolvedBlock,
        operand: Buffer,
        slots: usize,
        aliased: bool,
        allocator: &Arc<dyn Allocator>,
        timeout: Option<Duration>,
    ) -> Result<Self> {
        let slots = make_slots(block, slots, allocator, timeout)?;
        Ok(Self { operand, slots, current: 0, aliased, indices: block.kernel_indices() })
    }

    pub fn current_buffer(&self) -> &Buffer {
        self.slots.get(self.current).map_or(&self.operand, |slot| &slot.buffer)
    }

    /// Slot for `window`. A window revisited on consecutive steps keeps its slot
    /// and contents; aliased outputs start from the operand's prior contents.
    pub fn acquire(&mut self, window: &Window, local: u64) -> Result<Ref> {
        if self.slots.is_empty() {
            return Ok(self.operand.view());
        }
        if self.slots[self.current].window.as_ref() == Some(window) {
            return self.slots[self.current].view(&self.indices);
        }

        let index = if self.slots.len() > 1 { 1 - self.current } else { 0 };
        let slot = &mut self.slots[index];
        slot.settle()?;
        if self.aliased {
            slot.load(&self.operand, window, local)?;
            slot.settle()?;
        } else {
            slot.window = Some(window.clone());
            slot.tag = local;
        }
        self.current = index;
        self.slots[index].view(&self.indices)
    }

    /// Flush the current window unless the next step writes the same one.
    pub fn finish_step(&mut self, next: Option<&Window>) -> Result<()> {
        let Some(slot) = self.slots.get_mut(self.current) else { return Ok(()) };
        if next.is_some() && slot.window.as_ref() == next {
            return Ok(());
        }
        slot.flush(&self.operand)?;
        if self.aliased {
            slot.settle()?;
        }
        Ok(())
    }

    pub fn finish(&mut self) -> Result<()> {
        self.slots.iter_mut().try_for_each(Slot::settle)
    }
}
