//! Device meshes and symmetric slot tables.
//!
//! Every device of a mesh runs the same kernel, so the operand, scratch and
//! scoped allocations of one device have a counterpart on every other device.
//! Those counterparts are addressed by [`SlotId`]: a device registers what it
//! allocated under a slot and a peer resolves the slot to reach it, blocking
//! until the owner has registered it.

use std::collections::HashMap;
use std::fmt;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use snafu::{OptionExt, ensure};
use tessel_dtype::SemaphoreKind;

use crate::buffer::{Buffer, Shape};
use crate::device::Device;
use crate::error::*;
use crate::semaphore::Semaphore;

/// Address of a participant in a remote operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeviceId {
    /// Flat index into the mesh.
    Logical(usize),
    /// Coordinates over the mesh shape, row-major.
    Mesh(Shape),
}

impl From<usize> for DeviceId {
    fn from(index: usize) -> Self {
        Self::Logical(index)
    }
}

/// Symmetric name of an allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotId {
    Input(usize),
    Output(usize),
    /// Grid-level scratch.
    Scratch(usize),
    /// The `ordinal`-th allocation made by `run_scoped` during local step `step`.
    Scoped { step: u64, ordinal: usize },
    Barrier(u32),
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Input(i) => write!(f, "input {i}"),
            Self::Output(i) => write!(f, "output {i}"),
            Self::Scratch(i) => write!(f, "scratch {i}"),
            Self::Scoped { step, ordinal } => write!(f, "scoped allocation {ordinal} of step {step}"),
            Self::Barrier(id) => write!(f, "barrier semaphore {id}"),
        }
    }
}

#[derive(Debug, Clone)]
pub enum Resource {
    Buffer(Buffer),
    Semaphore(Semaphore),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum ResourceKey {
    Buffer(u64),
    Semaphore(u64),
}

impl Resource {
    fn key(&self) -> ResourceKey {
        match self {
            Self::Buffer(buffer) => ResourceKey::Buffer(buffer.id()),
            Self::Semaphore(sem) => ResourceKey::Semaphore(sem.id()),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Self::Buffer(_) => "buffer",
            Self::Semaphore(_) => "semaphore",
        }
    }
}

#[derive(Debug, Default)]
struct Slots {
    by_slot: HashMap<(usize, SlotId), Resource>,
    by_resource: HashMap<(usize, ResourceKey), SlotId>,
}

#[derive(Debug, Default)]
struct SlotTable {
    slots: Mutex<Slots>,
    condvar: Condvar,
}

/// A set of devices that run one kernel in SPMD fashion.
#[derive(Debug)]
pub struct Mesh {
    shape: Shape,
    devices: Vec<Device>,
    tables: Vec<SlotTable>,
}

impl Mesh {
    /// Mesh of fresh host devices.
    pub fn new(shape: &[usize]) -> Self {
        let count = shape.iter().product();
        Self::from_devices(shape, (0..count).map(Device::with_index).collect())
    }

    pub fn from_devices(shape: &[usize], devices: Vec<Device>) -> Self {
        let tables = devices.iter().map(|_| SlotTable::default()).collect();
        Self { shape: Shape::from_slice(shape), devices, tables }
    }

    pub fn single(device: Device) -> Self {
        Self::from_devices(&[1], vec![device])
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn num_devices(&self) -> usize {
        self.devices.len()
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn device(&self, index: usize) -> Result<&Device> {
        self.devices.get(index).context(InvalidDeviceSnafu { device: index.to_string() })
    }

    /// Flat index of `id`.
    pub fn resolve(&self, id: &DeviceId) -> Result<usize> {
        match id {
            DeviceId::Logical(index) => {
                ensure!(*index < self.num_devices(), InvalidDeviceSnafu { device: index.to_string() });
                Ok(*index)
            }
            DeviceId::Mesh(coords) => {
                let valid = coords.len() == self.shape.len() && coords.iter().zip(&self.shape).all(|(c, d)| c < d);
                ensure!(valid, InvalidDeviceSnafu { device: format!("{coords:?} in mesh {:?}", self.shape) });
                Ok(coords.iter().zip(&self.shape).fold(0, |acc, (c, d)| acc * d + c))
            }
        }
    }

    /// Mesh coordinates of a flat device index.
    pub fn coords(&self, mut index: usize) -> Shape {
        let mut coords = Shape::from_elem(0, self.shape.len());
        for axis in (0..self.shape.len()).rev() {
            coords[axis] = index % self.shape[axis];
            index /= self.shape[axis];
        }
        coords
    }

    fn table(&self, device: usize) -> Result<&SlotTable> {
        self.tables.get(device).context(InvalidDeviceSnafu { device: device.to_string() })
    }

    pub fn register(&self, device: usize, core: usize, slot: SlotId, resource: Resource) -> Result<()> {
        let table = self.table(device)?;
        {
            let mut slots = table.slots.lock();
            slots.by_resource.insert((core, resource.key()), slot);
            if let Some(previous) = slots.by_slot.insert((core, slot), resource) {
                slots.by_resource.remove(&(core, previous.key()));
            }
        }
        table.condvar.notify_all();
        Ok(())
    }

    pub fn unregister(&self, device: usize, core: usize, slot: SlotId) {
        if let Ok(table) = self.table(device) {
            let mut slots = table.slots.lock();
            if let Some(resource) = slots.by_slot.remove(&(core, slot)) {
                slots.by_resource.remove(&(core, resource.key()));
            }
        }
    }

    /// Drop every registration, e.g. between calls.
    pub fn clear(&self) {
        for table in &self.tables {
            *table.slots.lock() = Slots::default();
        }
    }

    pub fn slot_of_buffer(&self, device: usize, core: usize, buffer: &Buffer) -> Option<SlotId> {
        self.slot_of(device, core, ResourceKey::Buffer(buffer.id()))
    }

    pub fn slot_of_semaphore(&self, device: usize, core: usize, sem: &Semaphore) -> Option<SlotId> {
        self.slot_of(device, core, ResourceKey::Semaphore(sem.id()))
    }

    fn slot_of(&self, device: usize, core: usize, key: ResourceKey) -> Option<SlotId> {
        self.tables.get(device)?.slots.lock().by_resource.get(&(core, key)).copied()
    }

    /// Resolve `slot` on `device`, blocking until it is registered.
    pub fn lookup(&self, device: usize, core: usize, slot: SlotId, timeout: Option<Duration>) -> Result<Resource> {
        let table = self.table(device)?;
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let mut slots = table.slots.lock();
        loop {
            if let Some(resource) = slots.by_slot.get(&(core, slot)) {
                return Ok(resource.clone());
            }
            match deadline {
                None => table.condvar.wait(&mut slots),
                Some(deadline) => {
                    if table.condvar.wait_until(&mut slots, deadline).timed_out()
                        && !slots.by_slot.contains_key(&(core, slot))
                    {
                        let waited_ms = timeout.map_or(0, |t| t.as_millis());
                        return SlotTimeoutSnafu { device, slot: slot.to_string(), waited_ms }.fail();
                    }
                }
            }
        }
    }

    pub fn lookup_buffer(&self, device: usize, core: usize, slot: SlotId, timeout: Option<Duration>) -> Result<Buffer> {
        match self.lookup(device, core, slot, timeout)? {
            Resource::Buffer(buffer) => Ok(buffer),
            other => SlotKindSnafu { device, slot: slot.to_string(), found: other.kind(), expected: "buffer" }.fail(),
        }
    }

    pub fn lookup_semaphore(
        &self,
        device: usize,
        core: usize,
        slot: SlotId,
        timeout: Option<Duration>,
    ) -> Result<Semaphore> {
        match self.lookup(device, core, slot, timeout)? {
            Resource::Semaphore(sem) => Ok(sem),
            other => SlotKindSnafu { device, slot: slot.to_string(), found: other.kind(), expected: "semaphore" }.fail(),
        }
    }

    /// Barrier semaphore of `collective_id` on `device`, created on first use.
    pub fn barrier(
        &self,
        device: usize,
        core: usize,
        collective_id: Option<u32>,
        timeout: Option<Duration>,
    ) -> Result<Semaphore> {
        let collective_id = collective_id.context(MissingCollectiveIdSnafu)?;
        let table = self.table(device)?;
        let slot = SlotId::Barrier(collective_id);
        let sem = {
            let mut slots = table.slots.lock();
            if let Some(Resource::Semaphore(sem)) = slots.by_slot.get(&(core, slot)) {
                return Ok(sem.clone());
            }
            let sem = Semaphore::new(SemaphoreKind::Barrier, &[], timeout);
            let resource = Resource::Semaphore(sem.clone());
            slots.by_resource.insert((core, resource.key()), slot);
            slots.by_slot.insert((core, slot), resource);
            sem
        };
        table.condvar.notify_all();
        Ok(sem)
    }
}
