// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Walking the standard and extended capability lists of a physical PCI
//! function.
//!
//! Both walks are lazy and bounded: a malformed or looping chain produces
//! [`CapabilityWalkError::ChainTooLong`] instead of spinning forever.

use crate::PciBdf;
use crate::access::ConfigAccessError;
use crate::access::PhysicalPciDevice;
use crate::spec::caps::CapabilityHeader;
use crate::spec::caps::CapabilityId;
use crate::spec::cfg_space;
use crate::spec::cfg_space::CommonRegister;
use crate::spec::ext_caps::ExtendedCapabilityHeader;
use crate::spec::ext_caps::ExtendedCapabilityId;
use thiserror::Error;

/// Upper bound on standard capability entries. The list lives in 192 bytes
/// of dword-aligned space.
pub const MAX_CAPABILITIES: usize = 48;

/// Upper bound on extended capability entries. The list lives in 3840 bytes
/// of dword-aligned space, and no entry is smaller than 8 bytes.
pub const MAX_EXTENDED_CAPABILITIES: usize = 480;

/// First offset past the type 0/1 header where a standard capability may
/// live.
const FIRST_CAPABILITY_OFFSET: u8 = 0x40;

/// Offset of a standard capability in configuration space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct CapabilityOffset(pub u8);

impl CapabilityOffset {
    /// The offset as a register address.
    pub fn get(self) -> u16 {
        self.0.into()
    }
}

/// Offset of an extended capability in configuration space.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExtendedCapabilityOffset(pub u16);

impl ExtendedCapabilityOffset {
    /// The offset as a register address.
    pub fn get(self) -> u16 {
        self.0
    }
}

/// Errors encountered while walking a capability list.
#[derive(Debug, Error)]
pub enum CapabilityWalkError {
    /// The chain did not terminate within the expected number of entries.
    #[error("capability chain of {bdf} exceeds {limit} entries")]
    ChainTooLong {
        /// The function being walked.
        bdf: PciBdf,
        /// The bound that was exceeded.
        limit: usize,
    },
    /// A configuration space read failed.
    #[error("config space read failed during capability walk")]
    ConfigAccess(#[from] ConfigAccessError),
}

/// Lazy iterator over the standard capability list.
pub struct CapabilityIter<'a> {
    device: PhysicalPciDevice<'a>,
    next: u8,
    count: usize,
    done: bool,
}

impl<'a> CapabilityIter<'a> {
    /// Starts a walk. A function whose status register does not advertise a
    /// capability list yields nothing.
    pub fn new(device: PhysicalPciDevice<'a>) -> Result<Self, ConfigAccessError> {
        let status = cfg_space::Status::from_bits(device.read_u16(CommonRegister::STATUS.0)?);
        let next = if status.capabilities_list() {
            device.read_u8(CommonRegister::CAP_PTR.0)?
        } else {
            0
        };
        Ok(Self {
            device,
            next,
            count: 0,
            done: false,
        })
    }
}

impl Iterator for CapabilityIter<'_> {
    type Item = Result<(CapabilityId, CapabilityOffset), CapabilityWalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done || self.next == 0 || self.next == 0xff {
            return None;
        }
        let offset = self.next & cfg_space::CAP_PTR_MASK;
        if offset < FIRST_CAPABILITY_OFFSET {
            tracing::debug!(
                bdf = %self.device.bdf(),
                offset,
                "capability pointer into the header, ending walk"
            );
            self.done = true;
            return None;
        }
        if self.count == MAX_CAPABILITIES {
            self.done = true;
            return Some(Err(CapabilityWalkError::ChainTooLong {
                bdf: self.device.bdf(),
                limit: MAX_CAPABILITIES,
            }));
        }
        self.count += 1;

        match self
            .device
            .read_u16(u16::from(offset) + CapabilityHeader::ID.0)
        {
            Ok(header) => {
                self.next = (header >> 8) as u8;
                Some(Ok((
                    CapabilityId(header as u8),
                    CapabilityOffset(offset),
                )))
            }
            Err(err) => {
                self.done = true;
                Some(Err(err.into()))
            }
        }
    }
}

/// Lazy iterator over the extended capability list.
pub struct ExtendedCapabilityIter<'a> {
    device: PhysicalPciDevice<'a>,
    next: u16,
    count: usize,
    done: bool,
}

impl<'a> ExtendedCapabilityIter<'a> {
    /// Starts a walk at the first extended capability header.
    pub fn new(device: PhysicalPciDevice<'a>) -> Self {
        Self {
            device,
            next: cfg_space::EXTENDED_CAPABILITIES_OFFSET,
            count: 0,
            done: false,
        }
    }
}

impl Iterator for ExtendedCapabilityIter<'_> {
    type Item = Result<(ExtendedCapabilityId, ExtendedCapabilityOffset), CapabilityWalkError>;

    fn next(&mut self) -> Option<Self::Item> {
        // Pointers back into conventional space are invalid and end the list,
        // which also covers the zero terminator.
        if self.done || self.next < cfg_space::EXTENDED_CAPABILITIES_OFFSET {
            return None;
        }
        if self.count == MAX_EXTENDED_CAPABILITIES {
            self.done = true;
            return Some(Err(CapabilityWalkError::ChainTooLong {
                bdf: self.device.bdf(),
                limit: MAX_EXTENDED_CAPABILITIES,
            }));
        }
        self.count += 1;

        let offset = self.next & !3;
        let raw = match self.device.read_u32(offset) {
            Ok(raw) => raw,
            Err(err) => {
                self.done = true;
                return Some(Err(err.into()));
            }
        };
        // No extended space, or nothing implemented in it.
        if raw == 0 || raw == !0 {
            self.done = true;
            return None;
        }

        let header = ExtendedCapabilityHeader::from_bits(raw);
        self.next = header.next();
        Some(Ok((
            ExtendedCapabilityId(header.capability_id()),
            ExtendedCapabilityOffset(offset),
        )))
    }
}

/// Returns the offset of the first standard capability with the given ID.
pub fn find_capability(
    device: PhysicalPciDevice<'_>,
    id: CapabilityId,
) -> Result<Option<CapabilityOffset>, CapabilityWalkError> {
    for cap in CapabilityIter::new(device)? {
        let (cap_id, offset) = cap?;
        if cap_id == id {
            return Ok(Some(offset));
        }
    }
    Ok(None)
}

/// Returns the offset of the first extended capability with the given ID.
pub fn find_extended_capability(
    device: PhysicalPciDevice<'_>,
    id: ExtendedCapabilityId,
) -> Result<Option<ExtendedCapabilityOffset>, CapabilityWalkError> {
    for cap in ExtendedCapabilityIter::new(device) {
        let (cap_id, offset) = cap?;
        if cap_id == id {
            return Ok(Some(offset));
        }
    }
    Ok(None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::caps::pci_express::DevicePortType;
    use crate::spec::ext_caps::ptm::PtmCapabilities;
    use crate::test_helpers::TestPciHost;

    const BDF: PciBdf = PciBdf::new(3, 0, 0);

    #[test]
    fn no_capability_list() {
        let host = TestPciHost::new().with_function(BDF, |f| f.with_u8(0x34, 0x40));
        let dev = PhysicalPciDevice::new(&host, BDF);
        assert_eq!(
            find_capability(dev, CapabilityId::PCI_EXPRESS).unwrap(),
            None
        );
    }

    #[test]
    fn finds_standard_capability() {
        let host = TestPciHost::new().with_function(BDF, |f| {
            f.with_capability(CapabilityId::POWER_MANAGEMENT)
                .with_capability(CapabilityId::MSI)
                .pcie(DevicePortType::Endpoint)
        });
        let dev = PhysicalPciDevice::new(&host, BDF);

        let ids: Vec<_> = CapabilityIter::new(dev)
            .unwrap()
            .map(|c| c.unwrap().0)
            .collect();
        assert_eq!(
            ids,
            [
                CapabilityId::POWER_MANAGEMENT,
                CapabilityId::MSI,
                CapabilityId::PCI_EXPRESS
            ]
        );
        assert_eq!(
            find_capability(dev, CapabilityId::PCI_EXPRESS).unwrap(),
            Some(CapabilityOffset(0x60))
        );
        assert_eq!(find_capability(dev, CapabilityId::MSIX).unwrap(), None);
    }

    #[test]
    fn sentinel_next_pointers() {
        // 0xff terminates like 0.
        let host = TestPciHost::new().with_function(BDF, |f| {
            f.with_capability(CapabilityId::MSI).with_u8(0x41, 0xff)
        });
        let dev = PhysicalPciDevice::new(&host, BDF);
        assert_eq!(CapabilityIter::new(dev).unwrap().count(), 1);
    }

    #[test]
    fn looping_standard_chain_is_bounded() {
        let host = TestPciHost::new().with_function(BDF, |f| {
            f.with_capability(CapabilityId::MSI).with_u8(0x41, 0x40)
        });
        let dev = PhysicalPciDevice::new(&host, BDF);
        assert!(matches!(
            find_capability(dev, CapabilityId::PCI_EXPRESS),
            Err(CapabilityWalkError::ChainTooLong { limit: 48, .. })
        ));
    }

    #[test]
    fn finds_extended_capability() {
        let host = TestPciHost::new().with_function(BDF, |f| {
            f.pcie(DevicePortType::Endpoint)
                .ptm(0x140, PtmCapabilities::new().with_requester_capable(true))
        });
        let dev = PhysicalPciDevice::new(&host, BDF);

        let caps: Vec<_> = ExtendedCapabilityIter::new(dev)
            .map(|c| c.unwrap())
            .collect();
        assert_eq!(caps.len(), 2);
        assert_eq!(caps[0].1, ExtendedCapabilityOffset(0x100));
        assert_eq!(
            find_extended_capability(dev, ExtendedCapabilityId::PRECISION_TIME_MEASUREMENT)
                .unwrap(),
            Some(ExtendedCapabilityOffset(0x140))
        );
        assert_eq!(
            find_extended_capability(dev, ExtendedCapabilityId::RESIZABLE_BAR).unwrap(),
            None
        );
    }

    #[test]
    fn empty_extended_space() {
        let host = TestPciHost::new()
            .with_function(BDF, |f| f.pcie(DevicePortType::Endpoint))
            .with_function(PciBdf::new(4, 0, 0), |f| f.with_u32(0x100, !0));

        for bdf in [BDF, PciBdf::new(4, 0, 0)] {
            let dev = PhysicalPciDevice::new(&host, bdf);
            assert_eq!(ExtendedCapabilityIter::new(dev).count(), 0);
        }
    }

    #[test]
    fn looping_extended_chain_is_bounded() {
        // A single header pointing back at itself.
        let host = TestPciHost::new().with_function(BDF, |f| {
            f.with_u32(
                0x100,
                ExtendedCapabilityHeader::new()
                    .with_capability_id(ExtendedCapabilityId::ADVANCED_ERROR_REPORTING.0)
                    .with_version(1)
                    .with_next(0x100)
                    .into_bits(),
            )
        });
        let dev = PhysicalPciDevice::new(&host, BDF);
        assert!(matches!(
            find_extended_capability(dev, ExtendedCapabilityId::PRECISION_TIME_MEASUREMENT),
            Err(CapabilityWalkError::ChainTooLong { limit: 480, .. })
        ));
    }

    #[test]
    fn vanished_function() {
        let host = TestPciHost::new().with_function(BDF, |f| f.pcie(DevicePortType::Endpoint));
        host.remove(BDF);
        let dev = PhysicalPciDevice::new(&host, BDF);
        assert!(matches!(
            find_capability(dev, CapabilityId::PCI_EXPRESS),
            Err(CapabilityWalkError::ConfigAccess(
                ConfigAccessError::NotPresent(_)
            ))
        ));
    }
}
