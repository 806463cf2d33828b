// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Virtual PCI Express root port emulation.
//!
//! The root port's conventional configuration space is a snapshot of the
//! physical root port above a passthrough endpoint, with its identity and
//! bus numbers replaced. When the physical port is a PTM root, its PTM
//! capability is mirrored at the start of extended configuration space so
//! the guest can find and enable it.

use pci_core::PciBdf;
use pci_core::access::ConfigAccessError;
use pci_core::access::PhysicalPciAccess;
use pci_core::access::PhysicalPciDevice;
use pci_core::cfg_space_emu::CfgAccessError;
use pci_core::cfg_space_emu::ConfigSpaceImage;
use pci_core::spec::cfg_space;
use pci_core::spec::cfg_space::BridgeRegister;
use pci_core::spec::cfg_space::CommonRegister;
use pci_core::spec::cfg_space::HeaderLayout;
use pci_core::spec::ext_caps::ExtendedCapabilityHeader;
use pci_core::spec::ext_caps::ptm::PTM_CAPABILITY_LEN;
use pci_core::spec::ext_caps::ptm::PtmCapabilityHeader;
use pci_core::spec::hwid::ClassCode;
use pci_core::spec::hwid::Subclass;
use thiserror::Error;
use vroot_port_protocol::VROOT_PORT_DEVICE_ID;
use vroot_port_protocol::VROOT_PORT_VENDOR_ID;
use vroot_port_protocol::VirtualRootPortDescriptor;

const VROOT_PORT_REVISION_ID: u8 = 0x02;

// The guest sees the root port on bus 0 with a single bus behind it.
const VROOT_PORT_PRIMARY_BUS: u8 = 0x00;
const VROOT_PORT_SECONDARY_BUS: u8 = 0x01;
const VROOT_PORT_SUBORDINATE_BUS: u8 = 0x01;

/// Where the mirrored PTM capability appears to the guest.
pub const VROOT_PORT_PTM_OFFSET: u16 = cfg_space::EXTENDED_CAPABILITIES_OFFSET;

/// Checks that a physical PTM capability at `offset` fits in extended
/// configuration space, returning the offset as a register address.
pub fn ptm_source_offset(offset: u32) -> Option<u16> {
    let valid = offset >= u32::from(cfg_space::EXTENDED_CAPABILITIES_OFFSET)
        && offset % 4 == 0
        && offset <= u32::from(cfg_space::EXTENDED_CONFIG_SPACE_SIZE - PTM_CAPABILITY_LEN);
    valid.then_some(offset as u16)
}

/// A synthesized PCI function living in a VM's virtual PCI hierarchy.
pub trait VirtualPciDevice: Send + Sync {
    /// Guest BDF of the function.
    fn vbdf(&self) -> PciBdf;

    /// Whether [`VirtualPciDevice::init`] has completed.
    fn is_initialized(&self) -> bool;

    /// Builds the function's configuration space from the host.
    fn init(&mut self, access: &dyn PhysicalPciAccess) -> Result<(), InitError>;

    /// Tears the function down. It cannot be initialized again.
    fn deinit(&mut self);

    /// Handles a guest configuration read.
    fn read_cfg(&self, offset: u16, width: u8) -> Result<u32, CfgAccessError>;

    /// Handles a guest configuration write.
    fn write_cfg(&mut self, offset: u16, width: u8, value: u32) -> Result<(), CfgAccessError>;
}

/// Errors initializing a virtual device.
#[derive(Debug, Error)]
pub enum InitError {
    /// Reading the backing physical function failed.
    #[error("failed to read physical function {bdf} at offset {offset:#x}")]
    PhysicalRead {
        /// The physical function.
        bdf: PciBdf,
        /// The register being read.
        offset: u16,
        /// The underlying failure.
        #[source]
        source: ConfigAccessError,
    },
    /// The PTM capability offset cannot hold a PTM capability.
    #[error("invalid ptm capability offset {0:#x}")]
    InvalidPtmOffset(u32),
    /// The device was already torn down.
    #[error("device has been deinitialized")]
    Deinitialized,
    /// Populating the emulated configuration space failed.
    #[error("failed to populate emulated config space")]
    Image(#[from] CfgAccessError),
}

/// Lifecycle of a [`VirtualRootPort`].
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VrootPortState {
    /// Registered, configuration space not built yet.
    Uninitialized,
    /// Serving guest accesses.
    Initialized,
    /// Torn down.
    Deinitialized,
}

/// Ownership linkage of a virtual function's configuration space.
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct Ownership {
    /// The virtual function this one is nested under, if any.
    pub parent: Option<PciBdf>,
    /// The virtual function that handles accesses to this one.
    pub user: Option<PciBdf>,
}

/// A virtual root port backed by a physical root port.
#[derive(Debug)]
pub struct VirtualRootPort {
    vbdf: PciBdf,
    descriptor: VirtualRootPortDescriptor,
    state: VrootPortState,
    image: Option<ConfigSpaceImage>,
    ownership: Ownership,
}

impl VirtualRootPort {
    /// Registers a root port at guest BDF `vbdf`. Its configuration space is
    /// built on [`VirtualPciDevice::init`].
    pub fn new(vbdf: PciBdf, descriptor: VirtualRootPortDescriptor) -> Self {
        Self {
            vbdf,
            descriptor,
            state: VrootPortState::Uninitialized,
            image: None,
            ownership: Ownership::default(),
        }
    }

    /// The current lifecycle state.
    pub fn state(&self) -> VrootPortState {
        self.state
    }

    /// The descriptor the port was created from.
    pub fn descriptor(&self) -> &VirtualRootPortDescriptor {
        &self.descriptor
    }

    /// The port's ownership linkage.
    pub fn ownership(&self) -> Ownership {
        self.ownership
    }

    fn build_image(&self, access: &dyn PhysicalPciAccess) -> Result<ConfigSpaceImage, InitError> {
        let bdf = self.descriptor.physical_bdf;
        let physical = PhysicalPciDevice::new(access, bdf);
        let read = |offset| {
            physical
                .read_u32(offset)
                .map_err(|source| InitError::PhysicalRead {
                    bdf,
                    offset,
                    source,
                })
        };

        let mut image = ConfigSpaceImage::new();
        for offset in (0..cfg_space::CONFIG_SPACE_SIZE).step_by(4) {
            image.write_u32(offset, read(offset)?)?;
        }

        if self.descriptor.ptm_capable {
            let offset = self.descriptor.ptm_capability_offset;
            let src = ptm_source_offset(offset).ok_or(InitError::InvalidPtmOffset(offset))?;
            // The physical next pointer refers to capabilities that are not
            // mirrored, so the guest's extended list ends at the PTM entry.
            let header = ExtendedCapabilityHeader::from_bits(read(src)?).with_next(0);
            image.write_u32(
                VROOT_PORT_PTM_OFFSET + PtmCapabilityHeader::HEADER.0,
                header.into_bits(),
            )?;
            for reg in [PtmCapabilityHeader::CAPABILITIES, PtmCapabilityHeader::CONTROL] {
                image.write_u32(VROOT_PORT_PTM_OFFSET + reg.0, read(src + reg.0)?)?;
            }
        }

        image.write_u16(CommonRegister::VENDOR_ID.0, VROOT_PORT_VENDOR_ID)?;
        image.write_u16(CommonRegister::DEVICE_ID.0, VROOT_PORT_DEVICE_ID)?;
        image.write_u8(CommonRegister::REVISION_ID.0, VROOT_PORT_REVISION_ID)?;
        image.write_u8(CommonRegister::HEADER_TYPE.0, HeaderLayout::BRIDGE.0)?;
        image.write_u8(CommonRegister::CLASS_CODE.0, ClassCode::BRIDGE.0)?;
        image.write_u8(CommonRegister::SUBCLASS.0, Subclass::BRIDGE_PCI_TO_PCI.0)?;
        image.write_u8(BridgeRegister::PRIMARY_BUS.0, VROOT_PORT_PRIMARY_BUS)?;
        image.write_u8(BridgeRegister::SECONDARY_BUS.0, VROOT_PORT_SECONDARY_BUS)?;
        image.write_u8(BridgeRegister::SUBORDINATE_BUS.0, VROOT_PORT_SUBORDINATE_BUS)?;

        Ok(image)
    }
}

impl VirtualPciDevice for VirtualRootPort {
    fn vbdf(&self) -> PciBdf {
        self.vbdf
    }

    fn is_initialized(&self) -> bool {
        self.state == VrootPortState::Initialized
    }

    fn init(&mut self, access: &dyn PhysicalPciAccess) -> Result<(), InitError> {
        match self.state {
            VrootPortState::Uninitialized => {}
            VrootPortState::Initialized => return Ok(()),
            VrootPortState::Deinitialized => return Err(InitError::Deinitialized),
        }

        let image = self.build_image(access)?;
        self.image = Some(image);
        self.ownership = Ownership {
            parent: None,
            user: Some(self.vbdf),
        };
        self.state = VrootPortState::Initialized;

        tracing::info!(
            vbdf = %self.vbdf,
            pbdf = %self.descriptor.physical_bdf,
            ptm_capable = self.descriptor.ptm_capable,
            ptm_offset = self.descriptor.ptm_capability_offset,
            "virtual root port initialized"
        );
        Ok(())
    }

    fn deinit(&mut self) {
        self.image = None;
        self.ownership = Ownership::default();
        self.state = VrootPortState::Deinitialized;
        tracing::debug!(vbdf = %self.vbdf, "virtual root port deinitialized");
    }

    fn read_cfg(&self, offset: u16, width: u8) -> Result<u32, CfgAccessError> {
        self.image
            .as_ref()
            .ok_or(CfgAccessError::NotInitialized)?
            .read(offset, width)
    }

    fn write_cfg(&mut self, offset: u16, width: u8, value: u32) -> Result<(), CfgAccessError> {
        // Validate the access, then drop it.
        self.read_cfg(offset, width)?;
        tracing::trace!(
            vbdf = %self.vbdf,
            offset,
            width,
            value,
            "ignoring virtual root port config write"
        );
        Ok(())
    }
}
