// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Per-VM virtual PCI state: the configured device slots, the virtual root
//! ports created in them, and guest configuration access dispatch.

use crate::vroot_port::InitError;
use crate::vroot_port::VirtualPciDevice;
use crate::vroot_port::VirtualRootPort;
use crate::vroot_port::ptm_source_offset;
use parking_lot::Mutex;
use pci_core::PciBdf;
use pci_core::access::PhysicalPciAccess;
use pci_core::access::PhysicalPciDevice;
use pci_core::capabilities::CapabilityWalkError;
use pci_core::capabilities::find_extended_capability;
use pci_core::cfg_space_emu::CfgAccessError;
use pci_core::spec::ext_caps::ExtendedCapabilityId;
use pci_core::spec::ext_caps::ptm::PtmCapabilities;
use pci_core::spec::ext_caps::ptm::PtmCapabilityHeader;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use vroot_port_protocol::ArgsDecodeError;
use vroot_port_protocol::EmulatedDeviceRequest;
use vroot_port_protocol::EmulatedDeviceSink;
use vroot_port_protocol::VirtualRootPortDescriptor;

/// How a VM is launched, which decides where a virtual root port's backing
/// comes from.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmKind {
    /// Launched by the hypervisor. Virtual root ports are fully described
    /// by static configuration.
    PreLaunched,
    /// Launched by a device model, which requests virtual root ports at
    /// runtime.
    PostLaunched,
}

/// The kind of device configured in a slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PciDevKind {
    /// A passed-through physical function.
    Passthrough,
    /// A virtual root port.
    VrootPort,
}

/// A configured PCI device slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PciDevConfig {
    /// What lives in the slot.
    pub kind: PciDevKind,
    /// Guest BDF. Filled in at runtime for post-launched virtual root ports.
    #[serde(default)]
    pub vbdf: Option<PciBdf>,
    /// Host BDF. Filled in at runtime for post-launched virtual root ports.
    #[serde(default)]
    pub pbdf: Option<PciBdf>,
    /// For virtual root ports, the virtual secondary bus the slot is
    /// reserved for.
    #[serde(default)]
    pub vroot_port_idx: u8,
}

/// A VM's PCI configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmPciConfig {
    /// How the VM is launched.
    pub kind: VmKind,
    /// The configured slots.
    #[serde(default)]
    pub devices: Vec<PciDevConfig>,
}

/// Errors creating a virtual root port.
#[derive(Debug, Error)]
pub enum CreateVrootPortError {
    /// No configured slot is reserved for the requested secondary bus.
    #[error("no virtual root port slot configured for secondary bus {secondary_bus}")]
    ConfigMismatch {
        /// The requested secondary bus.
        secondary_bus: u8,
    },
    /// The request could not be decoded.
    #[error("invalid virtual root port request")]
    InvalidArgs(#[from] ArgsDecodeError),
    /// A device already occupies the guest BDF or the slot.
    #[error("virtual slot {0} is already occupied")]
    SlotOccupied(PciBdf),
    /// The PTM capability offset cannot hold a PTM capability.
    #[error("invalid ptm capability offset {0:#x}")]
    InvalidPtmOffset(u32),
}

/// Errors dispatching a guest configuration access.
#[derive(Debug, Error)]
pub enum VpciError {
    /// Nothing lives at the guest BDF.
    #[error("no virtual device at {0}")]
    NoDevice(PciBdf),
    /// The device could not be initialized on first access.
    #[error("failed to initialize virtual device {vbdf}")]
    Init {
        /// The device's guest BDF.
        vbdf: PciBdf,
        /// The initialization failure.
        #[source]
        source: InitError,
    },
    /// The access itself was invalid.
    #[error("invalid config access")]
    Access(#[from] CfgAccessError),
}

/// The hypervisor's per-VM virtual PCI state.
pub struct HvVm {
    vm_id: u16,
    config: VmPciConfig,
    /// Live virtual root port records, keyed by `vroot_port_idx`.
    vroot_ports: BTreeMap<u8, VirtualRootPortDescriptor>,
    devices: BTreeMap<PciBdf, Box<dyn VirtualPciDevice>>,
    access: Arc<dyn PhysicalPciAccess>,
}

impl std::fmt::Debug for HvVm {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HvVm")
            .field("vm_id", &self.vm_id)
            .field("config", &self.config)
            .field("vroot_ports", &self.vroot_ports)
            .field("devices", &self.devices.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl HvVm {
    /// Creates the state for VM `vm_id`.
    ///
    /// For a pre-launched VM, every virtual root port slot with both a guest
    /// and a host BDF is registered immediately, with PTM support read from
    /// the host root port. Incomplete or conflicting slots are skipped.
    pub fn new(vm_id: u16, config: VmPciConfig, access: Arc<dyn PhysicalPciAccess>) -> Self {
        let mut vm = Self {
            vm_id,
            config,
            vroot_ports: BTreeMap::new(),
            devices: BTreeMap::new(),
            access,
        };
        if vm.config.kind == VmKind::PreLaunched {
            vm.register_static_vroot_ports();
        }
        vm
    }

    fn register_static_vroot_ports(&mut self) {
        let slots: Vec<_> = self
            .config
            .devices
            .iter()
            .filter(|slot| slot.kind == PciDevKind::VrootPort)
            .cloned()
            .collect();

        for slot in slots {
            let (Some(vbdf), Some(pbdf)) = (slot.vbdf, slot.pbdf) else {
                tracing::warn!(
                    vm_id = self.vm_id,
                    idx = slot.vroot_port_idx,
                    "virtual root port slot missing vbdf or pbdf"
                );
                continue;
            };
            let (ptm_capable, ptm_capability_offset) =
                match physical_ptm_root(self.access.as_ref(), pbdf) {
                    Ok(Some(offset)) => (true, offset.into()),
                    Ok(None) => (false, 0),
                    Err(err) => {
                        tracing::warn!(
                            vm_id = self.vm_id,
                            %pbdf,
                            error = &err as &dyn std::error::Error,
                            "failed to read ptm capability of root port"
                        );
                        (false, 0)
                    }
                };
            let descriptor = VirtualRootPortDescriptor {
                physical_bdf: pbdf,
                primary_bus: vbdf.bus(),
                secondary_bus: slot.vroot_port_idx,
                subordinate_bus: 0,
                ptm_capable,
                ptm_capability_offset,
            };
            if let Err(err) = self.register(slot.vroot_port_idx, vbdf, descriptor) {
                tracing::warn!(
                    vm_id = self.vm_id,
                    error = &err as &dyn std::error::Error,
                    "skipping virtual root port slot"
                );
            }
        }
    }

    fn register(
        &mut self,
        idx: u8,
        vbdf: PciBdf,
        descriptor: VirtualRootPortDescriptor,
    ) -> Result<(), CreateVrootPortError> {
        if self.devices.contains_key(&vbdf) {
            return Err(CreateVrootPortError::SlotOccupied(vbdf));
        }
        check_ptm_offset(&descriptor)?;
        self.vroot_ports.insert(idx, descriptor);
        self.devices
            .insert(vbdf, Box::new(VirtualRootPort::new(vbdf, descriptor)));
        Ok(())
    }

    /// The VM's ID.
    pub fn vm_id(&self) -> u16 {
        self.vm_id
    }

    /// The VM's configuration, including runtime-assigned BDFs.
    pub fn config(&self) -> &VmPciConfig {
        &self.config
    }

    /// The live record for the virtual root port in slot `idx`.
    pub fn vroot_port(&self, idx: u8) -> Option<&VirtualRootPortDescriptor> {
        self.vroot_ports.get(&idx)
    }

    /// Whether a virtual device lives at `vbdf`.
    pub fn has_device(&self, vbdf: PciBdf) -> bool {
        self.devices.contains_key(&vbdf)
    }

    /// Creates a virtual root port requested by the VM's device model.
    ///
    /// The port goes into the configured slot reserved for the requested
    /// secondary bus, at the guest BDF named by the request.
    pub fn create_vroot_port(
        &mut self,
        request: &EmulatedDeviceRequest,
    ) -> Result<(), CreateVrootPortError> {
        let descriptor = request.vroot_port_descriptor()?;
        let vbdf = request.slot()?;
        check_ptm_offset(&descriptor)?;
        tracing::info!(
            vm_id = self.vm_id,
            %vbdf,
            pbdf = %descriptor.physical_bdf,
            primary_bus = descriptor.primary_bus,
            secondary_bus = descriptor.secondary_bus,
            subordinate_bus = descriptor.subordinate_bus,
            "create virtual root port"
        );

        let idx = descriptor.secondary_bus;
        let Some(slot) = self
            .config
            .devices
            .iter_mut()
            .find(|slot| slot.kind == PciDevKind::VrootPort && slot.vroot_port_idx == idx)
        else {
            tracing::warn!(
                vm_id = self.vm_id,
                secondary_bus = idx,
                "no virtual root port slot configured"
            );
            return Err(CreateVrootPortError::ConfigMismatch { secondary_bus: idx });
        };
        if let Some(existing) = slot.vbdf.filter(|v| self.devices.contains_key(v)) {
            return Err(CreateVrootPortError::SlotOccupied(existing));
        }
        if self.devices.contains_key(&vbdf) {
            return Err(CreateVrootPortError::SlotOccupied(vbdf));
        }

        slot.vbdf = Some(vbdf);
        slot.pbdf = Some(descriptor.physical_bdf);
        self.register(idx, vbdf, descriptor)
    }

    /// Tears down the virtual root port at `vbdf`.
    pub fn destroy_vroot_port(&mut self, vbdf: PciBdf) -> Result<(), VpciError> {
        let mut device = self
            .devices
            .remove(&vbdf)
            .ok_or(VpciError::NoDevice(vbdf))?;
        device.deinit();

        let post_launched = self.config.kind == VmKind::PostLaunched;
        for slot in &mut self.config.devices {
            if slot.kind == PciDevKind::VrootPort && slot.vbdf == Some(vbdf) {
                self.vroot_ports.remove(&slot.vroot_port_idx);
                if post_launched {
                    slot.vbdf = None;
                    slot.pbdf = None;
                }
            }
        }
        tracing::info!(vm_id = self.vm_id, %vbdf, "destroyed virtual root port");
        Ok(())
    }

    fn device_for_access(
        &mut self,
        vbdf: PciBdf,
    ) -> Result<&mut Box<dyn VirtualPciDevice>, VpciError> {
        let device = self
            .devices
            .get_mut(&vbdf)
            .ok_or(VpciError::NoDevice(vbdf))?;
        if !device.is_initialized() {
            device
                .init(self.access.as_ref())
                .map_err(|source| VpciError::Init { vbdf, source })?;
        }
        Ok(device)
    }

    /// Handles a guest configuration read of `vbdf`. The device is
    /// initialized on its first access.
    pub fn cfg_read(&mut self, vbdf: PciBdf, offset: u16, width: u8) -> Result<u32, VpciError> {
        Ok(self.device_for_access(vbdf)?.read_cfg(offset, width)?)
    }

    /// Handles a guest configuration write to `vbdf`. The device is
    /// initialized on its first access.
    pub fn cfg_write(
        &mut self,
        vbdf: PciBdf,
        offset: u16,
        width: u8,
        value: u32,
    ) -> Result<(), VpciError> {
        Ok(self
            .device_for_access(vbdf)?
            .write_cfg(offset, width, value)?)
    }
}

fn check_ptm_offset(descriptor: &VirtualRootPortDescriptor) -> Result<(), CreateVrootPortError> {
    let offset = descriptor.ptm_capability_offset;
    if descriptor.ptm_capable && ptm_source_offset(offset).is_none() {
        return Err(CreateVrootPortError::InvalidPtmOffset(offset));
    }
    Ok(())
}

/// Returns the PTM capability offset of `pbdf` if it is a PTM root.
fn physical_ptm_root(
    access: &dyn PhysicalPciAccess,
    pbdf: PciBdf,
) -> Result<Option<u16>, CapabilityWalkError> {
    let device = PhysicalPciDevice::new(access, pbdf);
    let Some(offset) =
        find_extended_capability(device, ExtendedCapabilityId::PRECISION_TIME_MEASUREMENT)?
    else {
        return Ok(None);
    };
    let caps = PtmCapabilities::from_bits(
        device.read_u32(offset.get() + PtmCapabilityHeader::CAPABILITIES.0)?,
    );
    Ok(caps.root_capable().then_some(offset.get()))
}

/// The hypervisor end of a VM's device creation channel.
#[derive(Debug, Clone)]
pub struct HvVmSink(Arc<Mutex<HvVm>>);

impl HvVmSink {
    /// Wraps a shared VM.
    pub fn new(vm: Arc<Mutex<HvVm>>) -> Self {
        Self(vm)
    }
}

impl EmulatedDeviceSink for HvVmSink {
    fn add_emulated_device(&self, request: &EmulatedDeviceRequest) -> anyhow::Result<()> {
        if !request.is_vroot_port() {
            anyhow::bail!(
                "unsupported emulated device {:#06x}:{:#06x}",
                request.vendor_id,
                request.device_id
            );
        }
        self.0.lock().create_vroot_port(request)?;
        Ok(())
    }
}
