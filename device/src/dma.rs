//! Asynchronous copies between refs.
//!
//! A copy is validated when built, runs on the DMA engine's own rayon pool
//! (never the caller's) once started, and signals its semaphore exactly once
//! when the data has landed. Several copies may share one semaphore; after N
//! starts and N waits all N have completed, but a single wait does not identify
//! which copy it observed.

use once_cell::sync::Lazy;
use snafu::ensure;
use tessel_dtype::DType;

use crate::buffer::Ref;
use crate::error::*;
use crate::semaphore::SemaphoreRef;

/// Lifecycle of one side of a copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum::Display)]
#[strum(serialize_all = "lowercase")]
pub enum CopyState {
    /// Built but not started.
    Pending,
    Issued,
    Waited,
}

/// Check that `src` can be copied into `dst`.
pub fn validate(src: &Ref, dst: &Ref) -> Result<()> {
    ensure!(
        src.dtype() == dst.dtype(),
        DTypeMismatchSnafu { src: DType::Scalar(src.dtype()), dst: DType::Scalar(dst.dtype()) }
    );
    for side in [src, dst] {
        ensure!(
            !side.squeezes_tiled_axes(),
            SqueezedTiledAxesSnafu { shape: side.shape().to_vec(), base_rank: side.buffer().shape().len() }
        );
    }
    ensure!(src.numel() == dst.numel(), CopyShapeMismatchSnafu { src: src.shape().to_vec(), dst: dst.shape().to_vec() });
    Ok(())
}

fn expect_state(state: CopyState, op: &'static str) -> Result<()> {
    let expected = if op == "start" { CopyState::Pending } else { CopyState::Issued };
    ensure!(state == expected, InvalidCopyStateSnafu { op, state: state_name(state) });
    Ok(())
}

const fn state_name(state: CopyState) -> &'static str {
    match state {
        CopyState::Pending => "pending",
        CopyState::Issued => "issued",
        CopyState::Waited => "already waited",
    }
}

/// Worker pool of the DMA engine. `None` if the pool could not be built.
static DMA_POOL: Lazy<Option<rayon::ThreadPool>> = Lazy::new(|| {
    rayon::ThreadPoolBuilder::new()
        .thread_name(|i| format!("tessel-dma-{i}"))
        .build()
        .inspect_err(|error| tracing::warn!(%error, "DMA pool unavailable, copies use dedicated threads"))
        .ok()
});

/// Run the transfer on the DMA pool and signal every semaphore in `done` once it landed.
fn spawn_transfer(src: Ref, dst: Ref, done: Vec<SemaphoreRef>) {
    let job = move || {
        // Gathering first stages the data, so overlapping self-copies are safe.
        let bytes = src.gather();
        dst.scatter(&bytes);
        tracing::trace!(
            src = src.buffer().id(),
            dst = dst.buffer().id(),
            bytes = bytes.len(),
            "copy landed"
        );
        for sem in done {
            sem.complete();
        }
    };
    match &*DMA_POOL {
        Some(pool) => pool.spawn(job),
        None => {
            std::thread::spawn(job);
        }
    }
}

/// Local asynchronous copy.
#[derive(Debug)]
pub struct AsyncCopy {
    src: Ref,
    dst: Ref,
    sem: SemaphoreRef,
    state: CopyState,
}

impl AsyncCopy {
    /// Build an unstarted copy descriptor.
    pub fn new(src: &Ref, dst: &Ref, sem: &SemaphoreRef) -> Result<Self> {
        validate(src, dst)?;
        ensure!(sem.is_scalar(), NonScalarSemaphoreSnafu { op: "signal", shape: sem.shape().to_vec() });
        Ok(Self { src: src.clone(), dst: dst.clone(), sem: sem.clone(), state: CopyState::Pending })
    }

    pub fn start(&mut self) -> Result<()> {
        expect_state(self.state, "start")?;
        self.sem.issue()?;
        tracing::trace!(
            src_space = %self.src.space(),
            dst_space = %self.dst.space(),
            elements = self.src.numel(),
            "copy issued"
        );
        spawn_transfer(self.src.clone(), self.dst.clone(), vec![self.sem.clone()]);
        self.state = CopyState::Issued;
        Ok(())
    }

    /// Block until one copy completed on this copy's semaphore.
    pub fn wait(&mut self) -> Result<()> {
        expect_state(self.state, "wait")?;
        self.sem.wait_copy()?;
        self.state = CopyState::Waited;
        Ok(())
    }

    pub fn state(&self) -> CopyState {
        self.state
    }
}

/// Build and start a local copy.
pub fn async_copy(src: &Ref, dst: &Ref, sem: &SemaphoreRef) -> Result<AsyncCopy> {
    let mut copy = AsyncCopy::new(src, dst, sem)?;
    copy.start()?;
    Ok(copy)
}

/// Copy to a peer device.
///
/// `send_sem` is local and signalled once the data left; `recv_sem` lives on the
/// peer and is signalled once the data landed there. `wait_recv` waits on the
/// local semaphore with the same slot as `recv_sem`, i.e. for the copy some
/// other device sent here.
#[derive(Debug)]
pub struct RemoteAsyncCopy {
    src: Ref,
    dst: Ref,
    send_sem: SemaphoreRef,
    recv_sem: SemaphoreRef,
    local_recv_sem: SemaphoreRef,
    device: usize,
    send: CopyState,
    recv: CopyState,
}

impl RemoteAsyncCopy {
    pub fn new(
        src: &Ref,
        dst: &Ref,
        send_sem: &SemaphoreRef,
        recv_sem: &SemaphoreRef,
        local_recv_sem: &SemaphoreRef,
        device: usize,
    ) -> Result<Self> {
        validate(src, dst)?;
        for sem in [send_sem, recv_sem] {
            ensure!(sem.is_scalar(), NonScalarSemaphoreSnafu { op: "signal", shape: sem.shape().to_vec() });
        }
        Ok(Self {
            src: src.clone(),
            dst: dst.clone(),
            send_sem: send_sem.clone(),
            recv_sem: recv_sem.clone(),
            local_recv_sem: local_recv_sem.clone(),
            device,
            send: CopyState::Pending,
            recv: CopyState::Pending,
        })
    }

    pub fn start(&mut self) -> Result<()> {
        expect_state(self.send, "start")?;
        self.send_sem.issue()?;
        self.recv_sem.issue()?;
        tracing::trace!(device = self.device, elements = self.src.numel(), "remote copy issued");
        spawn_transfer(self.src.clone(), self.dst.clone(), vec![self.send_sem.clone(), self.recv_sem.clone()]);
        self.send = CopyState::Issued;
        self.recv = CopyState::Issued;
        Ok(())
    }

    pub fn wait_send(&mut self) -> Result<()> {
        expect_state(self.send, "wait_send")?;
        self.send_sem.wait_copy()?;
        self.send = CopyState::Waited;
        Ok(())
    }

    pub fn wait_recv(&mut self) -> Result<()> {
        expect_state(self.recv, "wait_recv")?;
        self.local_recv_sem.wait_copy()?;
        self.recv = CopyState::Waited;
        Ok(())
    }

    pub fn wait(&mut self) -> Result<()> {
        self.wait_send()?;
        self.wait_recv()
    }

    pub fn send_state(&self) -> CopyState {
        self.send
    }

    pub fn recv_state(&self) -> CopyState {
        self.recv
    }
}
