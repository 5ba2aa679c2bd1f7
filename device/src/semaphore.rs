//! Counting semaphores.
//!
//! A semaphore is a scalar or N-d array of counters. `signal` adds to a counter,
//! `wait` blocks until the counter reaches the requested amount and then
//! subtracts it. Waiting for more than will ever be signalled blocks forever
//! unless a deadlock timeout was configured at allocation.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use snafu::ensure;
use tessel_dtype::SemaphoreKind;

use crate::buffer::Shape;
use crate::error::*;

static NEXT_SEMAPHORE_ID: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct CounterState {
    value: u64,
    /// Copies issued against this counter that have not landed yet.
    in_flight: u64,
    /// Copies issued against this counter whose handle was not waited yet.
    unwaited: u64,
}

#[derive(Debug, Default)]
struct Counter {
    state: Mutex<CounterState>,
    condvar: Condvar,
}

impl Counter {
    fn signal(&self, amount: u64) {
        self.state.lock().value += amount;
        self.condvar.notify_all();
    }

    fn wait(&self, amount: u64, timeout: Option<Duration>) -> Result<()> {
        let mut state = self.state.lock();
        match timeout {
            None => {
                while state.value < amount {
                    self.condvar.wait(&mut state);
                }
            }
            Some(timeout) => {
                let deadline = Instant::now() + timeout;
                while state.value < amount {
                    let result = self.condvar.wait_until(&mut state, deadline);
                    if result.timed_out() && state.value < amount {
                        tracing::warn!(amount, value = state.value, "semaphore wait exceeded deadlock timeout");
                        return SemaphoreTimeoutSnafu { waited_ms: timeout.as_millis(), amount, value: state.value }
                            .fail();
                    }
                }
            }
        }
        state.value -= amount;
        Ok(())
    }

    fn drain(&self) {
        let mut state = self.state.lock();
        while state.in_flight > 0 {
            self.condvar.wait(&mut state);
        }
    }
}

#[derive(Debug)]
struct SemaphoreData {
    kind: SemaphoreKind,
    shape: Shape,
    counters: Box<[Counter]>,
    timeout: Option<Duration>,
    id: u64,
}

/// Aggregate state of a semaphore's counters once in-flight copies landed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SemaphoreBalance {
    /// Sum of all counters.
    pub value: u64,
    /// Issued copies whose handle was never waited.
    pub unwaited: u64,
}

impl SemaphoreBalance {
    pub fn is_settled(&self) -> bool {
        self.value == 0
    }
}

/// An allocated semaphore (array). Clones share the counters.
#[derive(Debug, Clone)]
pub struct Semaphore {
    data: Arc<SemaphoreData>,
}

impl Semaphore {
    pub fn new(kind: SemaphoreKind, shape: &[usize], timeout: Option<Duration>) -> Self {
        let count = shape.iter().product();
        Self {
            data: Arc::new(SemaphoreData {
                kind,
                shape: Shape::from_slice(shape),
                counters: (0..count).map(|_| Counter::default()).collect(),
                timeout,
                id: NEXT_SEMAPHORE_ID.fetch_add(1, Ordering::Relaxed),
            }),
        }
    }

    pub fn scalar(kind: SemaphoreKind) -> Self {
        Self::new(kind, &[], None)
    }

    pub fn kind(&self) -> SemaphoreKind {
        self.data.kind
    }

    pub fn shape(&self) -> &[usize] {
        &self.data.shape
    }

    pub fn id(&self) -> u64 {
        self.data.id
    }

    pub fn is_same(&self, other: &Semaphore) -> bool {
        Arc::ptr_eq(&self.data, &other.data)
    }

    pub fn view(&self) -> SemaphoreRef {
        let rank = self.data.shape.len();
        let mut strides = Shape::from_elem(1, rank);
        for axis in (0..rank.saturating_sub(1)).rev() {
            strides[axis] = strides[axis + 1] * self.data.shape[axis + 1];
        }
        SemaphoreRef { sem: self.clone(), offset: 0, shape: self.data.shape.clone(), strides }
    }

    /// Block until no copy targeting this semaphore is in flight.
    pub fn drain(&self) {
        self.data.counters.iter().for_each(Counter::drain);
    }

    pub fn balance(&self) -> SemaphoreBalance {
        self.data.counters.iter().fold(SemaphoreBalance::default(), |acc, counter| {
            let state = *counter.state.lock();
            SemaphoreBalance { value: acc.value + state.value, unwaited: acc.unwaited + state.unwaited }
        })
    }
}

/// A (possibly narrowed) reference to a semaphore's counters.
#[derive(Debug, Clone)]
pub struct SemaphoreRef {
    sem: Semaphore,
    offset: usize,
    shape: Shape,
    strides: Shape,
}

impl SemaphoreRef {
    pub fn semaphore(&self) -> &Semaphore {
        &self.sem
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn kind(&self) -> SemaphoreKind {
        self.sem.kind()
    }

    pub fn is_scalar(&self) -> bool {
        self.shape.is_empty()
    }

    /// Index leading axes of an array semaphore.
    pub fn at(&self, indices: &[usize]) -> Result<SemaphoreRef> {
        ensure!(indices.len() <= self.shape.len(), TooManyIndicesSnafu { given: indices.len(), rank: self.shape.len() });
        let mut offset = self.offset;
        for (axis, (&index, &dim)) in indices.iter().zip(&self.shape).enumerate() {
            ensure!(index < dim, IndexOutOfBoundsSnafu { axis, index, len: 1usize, dim });
            offset += index * self.strides[axis];
        }
        let rest = indices.len();
        Ok(SemaphoreRef {
            sem: self.sem.clone(),
            offset,
            shape: Shape::from_slice(&self.shape[rest..]),
            strides: Shape::from_slice(&self.strides[rest..]),
        })
    }

    /// The same counter on another (symmetric) semaphore, e.g. a peer device's copy.
    pub fn on(&self, peer: &Semaphore) -> SemaphoreRef {
        SemaphoreRef { sem: peer.clone(), ..self.clone() }
    }

    pub fn signal(&self, amount: u64) -> Result<()> {
        self.counter("signal")?.signal(amount);
        Ok(())
    }

    pub fn wait(&self, amount: u64) -> Result<()> {
        self.counter("wait")?.wait(amount, self.sem.data.timeout)
    }

    /// Current counter value. Racy under concurrent signalers.
    pub fn read(&self) -> Result<u64> {
        Ok(self.counter("read")?.state.lock().value)
    }

    fn counter(&self, op: &'static str) -> Result<&Counter> {
        ensure!(self.is_scalar(), NonScalarSemaphoreSnafu { op, shape: self.shape.to_vec() });
        Ok(&self.sem.data.counters[self.offset])
    }

    /// Record a copy that will complete against this counter.
    pub(crate) fn issue(&self) -> Result<()> {
        let mut state = self.counter("signal")?.state.lock();
        state.in_flight += 1;
        state.unwaited += 1;
        Ok(())
    }

    /// Land a copy: the counter is signalled exactly once.
    pub(crate) fn complete(&self) {
        let counter = &self.sem.data.counters[self.offset];
        {
            let mut state = counter.state.lock();
            state.in_flight -= 1;
            state.value += 1;
        }
        counter.condvar.notify_all();
    }

    /// Wait for one landed copy and retire its handle.
    pub(crate) fn wait_copy(&self) -> Result<()> {
        self.wait(1)?;
        let mut state = self.sem.data.counters[self.offset].state.lock();
        state.unwaited = state.unwaited.saturating_sub(1);
        Ok(())
    }
}
