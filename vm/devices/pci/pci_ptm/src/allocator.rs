// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-VM allocation of virtual secondary bus numbers.

use parking_lot::Mutex;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;
use vroot_port_protocol::EmulatedDeviceSink;

/// Every virtual bus number has been handed out.
#[derive(Debug, Error, PartialEq, Eq)]
#[error("virtual secondary bus numbers exhausted")]
pub struct BusExhausted;

/// Highest virtual secondary bus issued to a VM.
///
/// Bus numbers are issued in increasing order starting at 1 and are never
/// returned, even when the root port they were issued for is torn down.
#[derive(Debug, Default)]
pub struct VmBusAllocationState {
    highest_secondary_bus: u8,
}

impl VmBusAllocationState {
    /// Returns a state that has not issued any bus.
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues the next bus number. Fails without changing state once 255 has
    /// been issued.
    pub fn allocate_secondary_bus(&mut self) -> Result<u8, BusExhausted> {
        let bus = self
            .highest_secondary_bus
            .checked_add(1)
            .ok_or(BusExhausted)?;
        self.highest_secondary_bus = bus;
        Ok(bus)
    }

    /// The most recently issued bus, 0 if none.
    pub fn highest_secondary_bus(&self) -> u8 {
        self.highest_secondary_bus
    }
}

/// Identifies a VM to the device model.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct VmId(pub u16);

impl fmt::Display for VmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "vm{}", self.0)
    }
}

/// The device model's per-VM state for PTM discovery.
///
/// Dropping it discards the VM's bus allocation state.
pub struct PtmVm {
    id: VmId,
    bus_allocation: Mutex<VmBusAllocationState>,
    sink: Arc<dyn EmulatedDeviceSink>,
}

impl fmt::Debug for PtmVm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PtmVm")
            .field("id", &self.id)
            .field("bus_allocation", &*self.bus_allocation.lock())
            .finish_non_exhaustive()
    }
}

impl PtmVm {
    /// Creates the state for VM `id`, which submits device creation requests
    /// to `sink`.
    pub fn new(id: VmId, sink: Arc<dyn EmulatedDeviceSink>) -> Self {
        Self {
            id,
            bus_allocation: Mutex::new(VmBusAllocationState::new()),
            sink,
        }
    }

    /// The VM's ID.
    pub fn id(&self) -> VmId {
        self.id
    }

    /// Issues the next virtual secondary bus for this VM.
    pub fn allocate_secondary_bus(&self) -> Result<u8, BusExhausted> {
        self.bus_allocation.lock().allocate_secondary_bus()
    }

    /// The most recently issued bus, 0 if none.
    pub fn highest_secondary_bus(&self) -> u8 {
        self.bus_allocation.lock().highest_secondary_bus()
    }

    /// The channel to the hypervisor.
    pub fn sink(&self) -> &dyn EmulatedDeviceSink {
        self.sink.as_ref()
    }
}
