// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! An in-memory [`PhysicalPciAccess`] implementation for building physical
//! topologies in tests.

use crate::PciBdf;
use crate::access::ConfigAccessError;
use crate::access::PhysicalPciAccess;
use crate::cfg_space_emu::ConfigSpaceImage;
use crate::spec::caps::CapabilityId;
use crate::spec::caps::pci_express::DevicePortType;
use crate::spec::caps::pci_express::PciExpressCapabilities;
use crate::spec::caps::pci_express::PciExpressCapabilityHeader;
use crate::spec::cfg_space;
use crate::spec::cfg_space::BridgeRegister;
use crate::spec::cfg_space::CommonRegister;
use crate::spec::cfg_space::HeaderLayout;
use crate::spec::ext_caps::ExtendedCapabilityHeader;
use crate::spec::ext_caps::ExtendedCapabilityId;
use crate::spec::ext_caps::ptm::PtmCapabilities;
use crate::spec::ext_caps::ptm::PtmCapabilityHeader;
use crate::spec::ext_caps::ptm::PtmControl;
use parking_lot::Mutex;
use std::collections::BTreeMap;

const STANDARD_CAPABILITY_STRIDE: u8 = 0x10;

/// Builder for the configuration space of one test function.
///
/// Offsets passed to the raw setters must be in range; out-of-range offsets
/// panic.
#[derive(Debug)]
pub struct TestFunction {
    image: ConfigSpaceImage,
    next_capability: u8,
    last_capability: Option<u8>,
    last_extended_capability: Option<u16>,
}

impl TestFunction {
    fn new() -> Self {
        Self {
            image: ConfigSpaceImage::new(),
            next_capability: 0x40,
            last_capability: None,
            last_extended_capability: None,
        }
    }

    /// Sets a byte.
    pub fn with_u8(mut self, offset: u16, value: u8) -> Self {
        self.image.write_u8(offset, value).unwrap();
        self
    }

    /// Sets a word.
    pub fn with_u16(mut self, offset: u16, value: u16) -> Self {
        self.image.write_u16(offset, value).unwrap();
        self
    }

    /// Sets a dword.
    pub fn with_u32(mut self, offset: u16, value: u32) -> Self {
        self.image.write_u32(offset, value).unwrap();
        self
    }

    /// Sets the vendor and device IDs.
    pub fn with_ids(self, vendor_id: u16, device_id: u16) -> Self {
        self.with_u16(CommonRegister::VENDOR_ID.0, vendor_id)
            .with_u16(CommonRegister::DEVICE_ID.0, device_id)
    }

    /// Makes this a type 1 header with the given bus numbers.
    pub fn bridge(self, primary: u8, secondary: u8, subordinate: u8) -> Self {
        self.with_u8(CommonRegister::HEADER_TYPE.0, HeaderLayout::BRIDGE.0)
            .with_u8(BridgeRegister::PRIMARY_BUS.0, primary)
            .with_u8(BridgeRegister::SECONDARY_BUS.0, secondary)
            .with_u8(BridgeRegister::SUBORDINATE_BUS.0, subordinate)
    }

    /// Appends an empty standard capability to the capability list.
    pub fn with_capability(mut self, id: CapabilityId) -> Self {
        let offset = self.next_capability;
        self.next_capability += STANDARD_CAPABILITY_STRIDE;

        match self.last_capability {
            None => {
                let status = cfg_space::Status::from_bits(
                    self.image.read_u16(CommonRegister::STATUS.0),
                )
                .with_capabilities_list(true);
                self = self
                    .with_u16(CommonRegister::STATUS.0, status.into_bits())
                    .with_u8(CommonRegister::CAP_PTR.0, offset);
            }
            Some(last) => self = self.with_u8(u16::from(last) + 1, offset),
        }
        self.last_capability = Some(offset);
        self.with_u8(offset.into(), id.0).with_u8(u16::from(offset) + 1, 0)
    }

    /// Appends a PCI Express capability advertising `port_type`.
    pub fn pcie(self, port_type: DevicePortType) -> Self {
        let offset = self.next_capability;
        let caps = PciExpressCapabilities::new()
            .with_capability_version(2)
            .with_device_port_type(port_type);
        self.with_capability(CapabilityId::PCI_EXPRESS).with_u16(
            u16::from(offset) + PciExpressCapabilityHeader::PCIE_CAPS.0,
            caps.into_bits(),
        )
    }

    /// Appends an extended capability with the given ID at `offset`.
    ///
    /// If the extended list is still empty and `offset` is not the start of
    /// extended space, an AER header is placed at the start to link to it.
    pub fn with_extended_capability(mut self, offset: u16, id: ExtendedCapabilityId) -> Self {
        match self.last_extended_capability {
            None if offset != cfg_space::EXTENDED_CAPABILITIES_OFFSET => {
                self = self.with_extended_capability(
                    cfg_space::EXTENDED_CAPABILITIES_OFFSET,
                    ExtendedCapabilityId::ADVANCED_ERROR_REPORTING,
                );
                return self.with_extended_capability(offset, id);
            }
            None => {}
            Some(last) => {
                let header =
                    ExtendedCapabilityHeader::from_bits(self.image.read_u32(last)).with_next(offset);
                self = self.with_u32(last, header.into_bits());
            }
        }
        self.last_extended_capability = Some(offset);
        let header = ExtendedCapabilityHeader::new()
            .with_capability_id(id.0)
            .with_version(1);
        self.with_u32(offset, header.into_bits())
    }

    /// Appends a PTM extended capability at `offset`.
    pub fn ptm(self, offset: u16, capabilities: PtmCapabilities) -> Self {
        self.ptm_with_control(offset, capabilities, PtmControl::new())
    }

    /// Appends a PTM extended capability at `offset`, including its control
    /// register.
    pub fn ptm_with_control(
        self,
        offset: u16,
        capabilities: PtmCapabilities,
        control: PtmControl,
    ) -> Self {
        self.with_extended_capability(offset, ExtendedCapabilityId::PRECISION_TIME_MEASUREMENT)
            .with_u32(
                offset + PtmCapabilityHeader::CAPABILITIES.0,
                capabilities.into_bits(),
            )
            .with_u32(offset + PtmCapabilityHeader::CONTROL.0, control.into_bits())
    }
}

/// An in-memory host PCI hierarchy.
#[derive(Debug, Default)]
pub struct TestPciHost {
    functions: Mutex<BTreeMap<PciBdf, Option<ConfigSpaceImage>>>,
}

impl TestPciHost {
    /// Returns an empty host.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a function whose configuration space is built by `f`.
    pub fn with_function(self, bdf: PciBdf, f: impl FnOnce(TestFunction) -> TestFunction) -> Self {
        let function = f(TestFunction::new());
        self.functions.lock().insert(bdf, Some(function.image));
        self
    }

    /// Adds a function that is still enumerated but fails every read, as if
    /// it was hot-removed after enumeration.
    pub fn with_vanished_function(self, bdf: PciBdf) -> Self {
        self.functions.lock().insert(bdf, None);
        self
    }

    /// Removes a function entirely.
    pub fn remove(&self, bdf: PciBdf) {
        self.functions.lock().remove(&bdf);
    }
}

impl PhysicalPciAccess for TestPciHost {
    fn read_cfg_u32(&self, bdf: PciBdf, offset: u16) -> Result<u32, ConfigAccessError> {
        match self.functions.lock().get(&bdf) {
            Some(Some(image)) => Ok(image.read_u32(offset)),
            Some(None) | None => Err(ConfigAccessError::NotPresent(bdf)),
        }
    }

    fn enumerate(&self) -> Result<Vec<PciBdf>, ConfigAccessError> {
        Ok(self.functions.lock().keys().copied().collect())
    }
}
