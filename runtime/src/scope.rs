//! Scoped allocation of scratch buffers and semaphores.
//!
//! Every `run_scoped` call pushes a [`ScopeFrame`] on the step's [`ScopeStack`].
//! Frames are popped in reverse order on every exit path: normal return, an
//! error propagated out of the scope body, or a panic unwinding through the
//! stack. Popping drains in-flight copies, unregisters the frame's symmetric
//! slots and releases the storage.

use std::sync::Arc;
use std::time::Duration;

use snafu::ensure;
use tessel_device::{AccessCounts, Allocator, Buffer, MemorySpace, Mesh, Ref, Resource, Semaphore, SemaphoreRef, SlotId};
use tessel_dtype::{DType, ScalarDType, SemaphoreKind};

use crate::error::*;

// ============================================================================
// ALLOCATION REQUESTS
// ============================================================================

/// One buffer or semaphore to allocate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Allocation {
    Buffer { space: MemorySpace, dtype: ScalarDType, shape: Vec<usize> },
    Semaphore { kind: SemaphoreKind, shape: Vec<usize> },
}

impl Allocation {
    pub fn buffer(space: MemorySpace, shape: &[usize], dtype: ScalarDType) -> Self {
        Self::Buffer { space, dtype, shape: shape.to_vec() }
    }

    pub fn vmem(shape: &[usize], dtype: ScalarDType) -> Self {
        Self::buffer(MemorySpace::Vmem, shape, dtype)
    }

    pub fn smem(shape: &[usize], dtype: ScalarDType) -> Self {
        Self::buffer(MemorySpace::Smem, shape, dtype)
    }

    pub fn semaphore(kind: SemaphoreKind) -> Self {
        Self::Semaphore { kind, shape: Vec::new() }
    }

    pub fn semaphore_array(kind: SemaphoreKind, shape: &[usize]) -> Self {
        Self::Semaphore { kind, shape: shape.to_vec() }
    }

    pub fn dma_semaphore() -> Self {
        Self::semaphore(SemaphoreKind::Dma)
    }

    pub fn regular_semaphore() -> Self {
        Self::semaphore(SemaphoreKind::Regular)
    }

    /// Space charged for the allocation. Semaphores live in dedicated memory.
    pub fn space(&self) -> Option<MemorySpace> {
        match self {
            Self::Buffer { space, .. } => Some(*space),
            Self::Semaphore { .. } => None,
        }
    }

    pub fn dtype(&self) -> DType {
        match self {
            Self::Buffer { dtype, .. } => DType::Scalar(*dtype),
            Self::Semaphore { kind, .. } => DType::Semaphore(*kind),
        }
    }

    pub fn shape(&self) -> &[usize] {
        match self {
            Self::Buffer { shape, .. } | Self::Semaphore { shape, .. } => shape,
        }
    }

    pub fn bytes(&self) -> usize {
        self.shape().iter().product::<usize>() * self.dtype().bytes()
    }
}

/// A live allocation as handed to a kernel body.
#[derive(Debug, Clone)]
pub enum Handle {
    Buffer(Ref),
    Semaphore(SemaphoreRef),
}

impl Handle {
    pub(crate) fn resource(&self) -> Resource {
        match self {
            Self::Buffer(r) => Resource::Buffer(r.buffer().clone()),
            Self::Semaphore(s) => Resource::Semaphore(s.semaphore().clone()),
        }
    }
}

/// Handles of a scope (or of grid-level scratch), in request order.
#[derive(Debug, Clone, Default)]
pub struct Handles {
    handles: Vec<Handle>,
}

impl Handles {
    pub(crate) fn new(handles: Vec<Handle>) -> Self {
        Self { handles }
    }

    pub fn len(&self) -> usize {
        self.handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handles.is_empty()
    }

    pub fn get(&self, index: usize) -> Option<&Handle> {
        self.handles.get(index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Handle> {
        self.handles.iter()
    }

    pub fn buffer(&self, index: usize) -> Result<&Ref> {
        match self.handles.get(index) {
            Some(Handle::Buffer(r)) => Ok(r),
            _ => HandleKindSnafu { index, expected: "buffer" }.fail(),
        }
    }

    pub fn semaphore(&self, index: usize) -> Result<&SemaphoreRef> {
        match self.handles.get(index) {
            Some(Handle::Semaphore(s)) => Ok(s),
            _ => HandleKindSnafu { index, expected: "semaphore" }.fail(),
        }
    }
}

/// Allocate every request or nothing.
///
/// Buffers come from `allocator` and start zeroed; semaphores start at 0.
pub(crate) fn allocate(
    allocator: &Arc<dyn Allocator>,
    allocations: &[Allocation],
    timeout: Option<Duration>,
) -> Result<Handles> {
    let mut handles = Vec::with_capacity(allocations.len());
    for allocation in allocations {
        // An error here drops the handles allocated so far, returning their storage.
        let handle = match allocation {
            Allocation::Buffer { space, dtype, shape } => {
                Handle::Buffer(Buffer::allocate(Arc::clone(allocator), *space, *dtype, shape)?.view())
            }
            Allocation::Semaphore { kind, shape } => Handle::Semaphore(Semaphore::new(*kind, shape, timeout).view()),
        };
        handles.push(handle);
    }
    Ok(Handles::new(handles))
}

/// Make sure no copy is still running against a handle's semaphores.
pub(crate) fn drain(handles: &Handles) {
    for handle in handles.iter() {
        if let Handle::Semaphore(sem) = handle {
            sem.semaphore().drain();
        }
    }
}

/// Every semaphore must be back at zero with all its copies waited.
pub(crate) fn check_balance(handles: &Handles) -> Result<()> {
    for (index, handle) in handles.iter().enumerate() {
        let Handle::Semaphore(sem) = handle else { continue };
        let balance = sem.semaphore().balance();
        if balance.unwaited > 0 {
            return UnwaitedCopySnafu { index, count: balance.unwaited }.fail();
        }
        ensure!(balance.is_settled(), SemaphoreLeakSnafu { index, value: balance.value });
    }
    Ok(())
}

// ============================================================================
// EFFECTS
// ============================================================================

/// How a buffer was accessed while a scope (or call) was open.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
pub enum Effect {
    Read,
    Write,
    ReadWrite,
}

impl Effect {
    pub fn from_counts(counts: AccessCounts) -> Option<Self> {
        match (counts.reads > 0, counts.writes > 0) {
            (false, false) => None,
            (true, false) => Some(Self::Read),
            (false, true) => Some(Self::Write),
            (true, true) => Some(Self::ReadWrite),
        }
    }

    pub fn merge(self, other: Effect) -> Effect {
        if self == other { self } else { Self::ReadWrite }
    }

    pub fn reads(&self) -> bool {
        matches!(self, Self::Read | Self::ReadWrite)
    }

    pub fn writes(&self) -> bool {
        matches!(self, Self::Write | Self::ReadWrite)
    }
}

/// Per-slot effects; `None` for untouched buffers and for semaphores.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EffectSet {
    effects: Vec<Option<Effect>>,
}

impl EffectSet {
    pub fn new(effects: Vec<Option<Effect>>) -> Self {
        Self { effects }
    }

    pub fn get(&self, index: usize) -> Option<Effect> {
        self.effects.get(index).copied().flatten()
    }

    pub fn len(&self) -> usize {
        self.effects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = Option<Effect>> + '_ {
        self.effects.iter().copied()
    }

    /// Combine per slot, e.g. the effects of several cores.
    pub fn merge(&mut self, other: &EffectSet) {
        if self.effects.len() < other.effects.len() {
            self.effects.resize(other.effects.len(), None);
        }
        for (mine, theirs) in self.effects.iter_mut().zip(&other.effects) {
            *mine = match (*mine, *theirs) {
                (Some(a), Some(b)) => Some(a.merge(b)),
                (a, b) => a.or(b),
            };
        }
    }
}

/// Access counters of the handles' buffers, in handle order.
fn snapshot(handles: &Handles) -> Vec<Option<AccessCounts>> {
    handles
        .iter()
        .map(|handle| match handle {
            Handle::Buffer(r) => Some(r.buffer().access_counts()),
            Handle::Semaphore(_) => None,
        })
        .collect()
}

fn effects_since(handles: &Handles, before: &[Option<AccessCounts>]) -> EffectSet {
    let effects = handles
        .iter()
        .zip(before)
        .map(|(handle, before)| match (handle, before) {
            (Handle::Buffer(r), Some(before)) => Effect::from_counts(r.buffer().access_counts().since(before)),
            _ => None,
        })
        .collect();
    EffectSet::new(effects)
}

// ============================================================================
// SCOPE STACK
// ============================================================================

#[derive(Debug)]
pub(crate) struct ScopeFrame {
    handles: Handles,
    slots: Vec<SlotId>,
    before: Vec<Option<AccessCounts>>,
}

/// Open scopes of one step on one core.
#[derive(Debug)]
pub(crate) struct ScopeStack<'a> {
    mesh: &'a Mesh,
    device: usize,
    core: usize,
    step: u64,
    timeout: Option<Duration>,
    frames: Vec<ScopeFrame>,
    /// Scoped allocations made so far in this step, naming their symmetric slots.
    next_ordinal: usize,
}

impl<'a> ScopeStack<'a> {
    pub fn new(mesh: &'a Mesh, device: usize, core: usize, step: u64, timeout: Option<Duration>) -> Self {
        Self { mesh, device, core, step, timeout, frames: Vec::new(), next_ordinal: 0 }
    }

    pub fn depth(&self) -> usize {
        self.frames.len()
    }

    /// Allocate a frame and register its allocations under scoped slots.
    pub fn push(&mut self, allocator: &Arc<dyn Allocator>, allocations: &[Allocation]) -> Result<Handles> {
        let handles = allocate(allocator, allocations, self.timeout)?;
        let mut slots = Vec::with_capacity(handles.len());
        for handle in handles.iter() {
            let slot = SlotId::Scoped { step: self.step, ordinal: self.next_ordinal };
            self.next_ordinal += 1;
            self.mesh.register(self.device, self.core, slot, handle.resource())?;
            slots.push(slot);
        }
        tracing::trace!(depth = self.frames.len() + 1, allocations = allocations.len(), "scope opened");
        let before = snapshot(&handles);
        self.frames.push(ScopeFrame { handles: handles.clone(), slots, before });
        Ok(handles)
    }

    /// Close the innermost frame, returning the effects of its buffers.
    pub fn pop(&mut self) -> Result<EffectSet> {
        let Some(frame) = self.frames.pop() else {
            return Ok(EffectSet::default());
        };
        self.release(&frame);
        let effects = effects_since(&frame.handles, &frame.before);
        check_balance(&frame.handles)?;
        tracing::trace!(depth = self.frames.len(), "scope closed");
        Ok(effects)
    }

    fn release(&self, frame: &ScopeFrame) {
        drain(&frame.handles);
        for slot in &frame.slots {
            self.mesh.unregister(self.device, self.core, *slot);
        }
    }
}

impl Drop for ScopeStack<'_> {
    fn drop(&mut self) {
        while let Some(frame) = self.frames.pop() {
            tracing::warn!(depth = self.frames.len(), "releasing scope on abnormal exit");
            self.release(&frame);
        }
    }
}
