//! Kernel bodies and the context they run in.
//!
//! A body is invoked once per grid step with a [`KernelContext`] (position in
//! the grid, checks, DMA, semaphores, scoped allocation) and the step's
//! [`KernelRefs`]. Everything a body may touch is passed in explicitly; there is
//! no ambient "current program" state, so cores and devices can run bodies
//! concurrently.

use std::fmt;
use std::sync::Arc;

use snafu::OptionExt;
use tessel_device::{Allocator, AsyncCopy, DeviceId, Mesh, Ref, RemoteAsyncCopy, SemaphoreRef, Shape};

use crate::check::{CheckFailure, CheckKind};
use crate::config::CompilerParams;
use crate::error::*;
use crate::grid::{Extent, GridContext};
use crate::scope::{Allocation, EffectSet, Handles, ScopeStack};

/// Code run at every grid step.
pub trait KernelBody: Send + Sync {
    fn run(&self, ctx: &mut KernelContext<'_>, refs: &KernelRefs) -> Result<()>;
}

impl<F> KernelBody for F
where
    F: Fn(&mut KernelContext<'_>, &KernelRefs) -> Result<()> + Send + Sync,
{
    fn run(&self, ctx: &mut KernelContext<'_>, refs: &KernelRefs) -> Result<()> {
        self(ctx, refs)
    }
}

/// Wrap a closure as a kernel body.
pub fn kernel<F>(body: F) -> Arc<dyn KernelBody>
where
    F: Fn(&mut KernelContext<'_>, &KernelRefs) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(body)
}

/// Refs handed to the body for one step.
///
/// Windowed operands in VMEM/SMEM are already staged; `ANY`/`HBM` operands are
/// the whole unstaged buffer and must be moved with DMA.
#[derive(Debug, Clone, Default)]
pub struct KernelRefs {
    /// Scalar-prefetch operands, resident in SMEM.
    pub prefetch: Vec<Ref>,
    pub inputs: Vec<Ref>,
    pub outputs: Vec<Ref>,
    /// Grid-level scratch, persistent across steps.
    pub scratch: Handles,
}

impl KernelRefs {
    pub fn prefetch(&self, index: usize) -> &Ref {
        &self.prefetch[index]
    }

    pub fn input(&self, index: usize) -> &Ref {
        &self.inputs[index]
    }

    pub fn output(&self, index: usize) -> &Ref {
        &self.outputs[index]
    }
}

/// Per-core state shared by every step of that core.
pub(crate) struct CoreEnv<'a> {
    pub mesh: &'a Mesh,
    pub device: usize,
    pub core: usize,
    pub num_cores: usize,
    pub params: &'a CompilerParams,
    pub allocator: Arc<dyn Allocator>,
}

impl CoreEnv<'_> {
    /// Log a failure, run the check hook and keep it for the caller.
    pub fn report(&self, failure: CheckFailure, sink: &mut Vec<CheckFailure>) {
        tracing::warn!(
            device = self.device,
            core = self.core,
            step = failure.step,
            kind = %failure.kind,
            message = %failure.message,
            "check failed"
        );
        if let Some(hook) = &self.params.check_hook {
            hook(&failure);
        }
        sink.push(failure);
    }
}

impl fmt::Debug for CoreEnv<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CoreEnv").field("device", &self.device).field("core", &self.core).finish_non_exhaustive()
    }
}

/// What a kernel body can do at one grid step.
pub struct KernelContext<'a> {
    env: &'a CoreEnv<'a>,
    grid: GridContext,
    scopes: ScopeStack<'a>,
    failures: Vec<CheckFailure>,
}

impl fmt::Debug for KernelContext<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KernelContext")
            .field("device", &self.env.device)
            .field("core", &self.env.core)
            .field("coord", &self.grid.coord())
            .field("scope_depth", &self.scopes.depth())
            .finish()
    }
}

impl<'a> KernelContext<'a> {
    pub(crate) fn new(env: &'a CoreEnv<'a>, grid: GridContext) -> Self {
        let scopes = ScopeStack::new(env.mesh, env.device, env.core, grid.step(), env.params.deadlock_timeout);
        Self { env, grid, scopes, failures: Vec::new() }
    }

    /// Check failures recorded during the step.
    pub(crate) fn into_failures(self) -> Vec<CheckFailure> {
        self.failures
    }

    // ------------------------------------------------------------------------
    // Grid position
    // ------------------------------------------------------------------------

    pub fn program_id(&self, axis: usize) -> Result<u64> {
        self.grid.program_id(axis)
    }

    pub fn num_programs(&self, axis: usize) -> Result<Extent> {
        self.grid.num_programs(axis)
    }

    pub fn grid(&self) -> &GridContext {
        &self.grid
    }

    /// Row-major position of this step in the whole grid.
    pub fn step(&self) -> u64 {
        self.grid.step()
    }

    pub fn device_id(&self) -> usize {
        self.env.device
    }

    pub fn device_coords(&self) -> Shape {
        self.env.mesh.coords(self.env.device)
    }

    pub fn num_devices(&self) -> usize {
        self.env.mesh.num_devices()
    }

    pub fn core_index(&self) -> usize {
        self.env.core
    }

    pub fn num_cores(&self) -> usize {
        self.env.num_cores
    }

    // ------------------------------------------------------------------------
    // Control flow and checks
    // ------------------------------------------------------------------------

    /// Run `f` only when `predicate` holds at this step.
    pub fn when(&mut self, predicate: bool, f: impl FnOnce(&mut Self) -> Result<()>) -> Result<()> {
        if predicate { f(self) } else { Ok(()) }
    }

    /// Record a failure for this step when `condition` is false. The grid keeps running.
    pub fn check(&mut self, condition: bool, message: impl fmt::Display) {
        if condition {
            return;
        }
        let failure = CheckFailure::at(CheckKind::User, &self.grid, self.env.device, self.env.core, message.to_string());
        self.env.report(failure, &mut self.failures);
    }

    pub fn debug_print(&self, message: impl fmt::Display) {
        tracing::info!(device = self.env.device, core = self.env.core, step = self.grid.step(), "{message}");
    }

    // ------------------------------------------------------------------------
    // Scoped allocation
    // ------------------------------------------------------------------------

    /// Allocate `allocations` for the duration of `f`.
    ///
    /// The allocations are released whether `f` returns, fails or panics. On
    /// exit every scope-owned semaphore must be back at zero with all its copies
    /// waited.
    pub fn run_scoped<R>(
        &mut self,
        allocations: &[Allocation],
        f: impl FnOnce(&mut KernelContext<'a>, &Handles) -> Result<R>,
    ) -> Result<R> {
        self.run_scoped_effects(allocations, f).map(|(value, _)| value)
    }

    /// [`run_scoped`](Self::run_scoped), also reporting how each scoped buffer was accessed.
    pub fn run_scoped_effects<R>(
        &mut self,
        allocations: &[Allocation],
        f: impl FnOnce(&mut KernelContext<'a>, &Handles) -> Result<R>,
    ) -> Result<(R, EffectSet)> {
        let handles = self.scopes.push(&self.env.allocator, allocations)?;
        let result = f(self, &handles);
        let closed = self.scopes.pop();
        let value = result?;
        Ok((value, closed?))
    }

    // ------------------------------------------------------------------------
    // DMA
    // ------------------------------------------------------------------------

    /// Build an unstarted local copy.
    pub fn make_async_copy(&self, src: &Ref, dst: &Ref, sem: &SemaphoreRef) -> Result<AsyncCopy> {
        Ok(AsyncCopy::new(src, dst, sem)?)
    }

    /// Build and start a local copy.
    pub fn async_copy(&self, src: &Ref, dst: &Ref, sem: &SemaphoreRef) -> Result<AsyncCopy> {
        Ok(tessel_device::async_copy(src, dst, sem)?)
    }

    /// Build an unstarted copy from a local ref into `dst` on `device`.
    ///
    /// `dst` and `recv_sem` name local allocations; the copy targets their
    /// symmetric counterparts on `device`.
    pub fn make_async_remote_copy(
        &self,
        src: &Ref,
        dst: &Ref,
        send_sem: &SemaphoreRef,
        recv_sem: &SemaphoreRef,
        device: impl Into<DeviceId>,
    ) -> Result<RemoteAsyncCopy> {
        let device = self.env.mesh.resolve(&device.into())?;
        let remote_dst = self.peer_ref(dst, device)?;
        let remote_recv = self.peer_semaphore(recv_sem, device)?;
        Ok(RemoteAsyncCopy::new(src, &remote_dst, send_sem, &remote_recv, recv_sem, device)?)
    }

    pub fn async_remote_copy(
        &self,
        src: &Ref,
        dst: &Ref,
        send_sem: &SemaphoreRef,
        recv_sem: &SemaphoreRef,
        device: impl Into<DeviceId>,
    ) -> Result<RemoteAsyncCopy> {
        let mut copy = self.make_async_remote_copy(src, dst, send_sem, recv_sem, device)?;
        copy.start()?;
        Ok(copy)
    }

    /// Signal the counterpart of `sem` on `device`.
    pub fn signal_remote(&self, sem: &SemaphoreRef, amount: u64, device: impl Into<DeviceId>) -> Result<()> {
        let device = self.env.mesh.resolve(&device.into())?;
        let remote = self.peer_semaphore(sem, device)?;
        tracing::trace!(from = self.env.device, to = device, amount, "remote signal");
        Ok(remote.signal(amount)?)
    }

    /// Barrier semaphore of this call's collective id.
    pub fn barrier_semaphore(&self) -> Result<SemaphoreRef> {
        let sem = self.env.mesh.barrier(
            self.env.device,
            self.env.core,
            self.env.params.collective_id,
            self.env.params.deadlock_timeout,
        )?;
        Ok(sem.view())
    }

    fn peer_ref(&self, local: &Ref, device: usize) -> Result<Ref> {
        let slot = self
            .env
            .mesh
            .slot_of_buffer(self.env.device, self.env.core, local.buffer())
            .context(NotSymmetricSnafu { what: format!("buffer {}", local.buffer().id()) })?;
        let peer = self.env.mesh.lookup_buffer(device, self.env.core, slot, self.env.params.deadlock_timeout)?;
        Ok(local.on(&peer))
    }

    fn peer_semaphore(&self, local: &SemaphoreRef, device: usize) -> Result<SemaphoreRef> {
        let slot = self
            .env
            .mesh
            .slot_of_semaphore(self.env.device, self.env.core, local.semaphore())
            .context(NotSymmetricSnafu { what: format!("semaphore {}", local.semaphore().id()) })?;
        let peer = self.env.mesh.lookup_semaphore(device, self.env.core, slot, self.env.params.deadlock_timeout)?;
        Ok(local.on(&peer))
    }
}
