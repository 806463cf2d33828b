// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Reading the PTM extended capability of a physical function.

use pci_core::access::PhysicalPciDevice;
use pci_core::capabilities::CapabilityWalkError;
use pci_core::capabilities::ExtendedCapabilityOffset;
use pci_core::capabilities::find_extended_capability;
use pci_core::spec::ext_caps::ExtendedCapabilityId;
use pci_core::spec::ext_caps::ptm::PtmCapabilities;
use pci_core::spec::ext_caps::ptm::PtmCapabilityHeader;

/// Location and contents of a function's PTM capability.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct PtmCapabilityInfo {
    /// Offset of the capability, `None` if the function does not have one.
    pub offset: Option<ExtendedCapabilityOffset>,
    /// The PTM Capability register, zero if absent.
    pub capabilities: PtmCapabilities,
}

/// Locates the PTM capability of `device` and reads its capability register.
pub fn read_ptm_capability(
    device: PhysicalPciDevice<'_>,
) -> Result<PtmCapabilityInfo, CapabilityWalkError> {
    let Some(offset) =
        find_extended_capability(device, ExtendedCapabilityId::PRECISION_TIME_MEASUREMENT)?
    else {
        return Ok(PtmCapabilityInfo {
            offset: None,
            capabilities: PtmCapabilities::new(),
        });
    };

    let capabilities = PtmCapabilities::from_bits(
        device.read_u32(offset.get() + PtmCapabilityHeader::CAPABILITIES.0)?,
    );
    tracing::debug!(
        bdf = %device.bdf(),
        offset = offset.get(),
        capabilities = capabilities.into_bits(),
        "ptm capability"
    );
    Ok(PtmCapabilityInfo {
        offset: Some(offset),
        capabilities,
    })
}

/// Whether the function can issue PTM requests.
pub fn is_requestor_capable(capabilities: PtmCapabilities) -> bool {
    capabilities.requester_capable()
}

/// Whether the function can act as a PTM root.
pub fn is_root_capable(capabilities: PtmCapabilities) -> bool {
    capabilities.root_capable()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pci_core::PciBdf;
    use pci_core::spec::caps::pci_express::DevicePortType;
    use pci_core::test_helpers::TestPciHost;

    #[test]
    fn reads_ptm_capability() {
        let bdf = PciBdf::new(3, 0, 0);
        let caps = PtmCapabilities::new()
            .with_requester_capable(true)
            .with_local_clock_granularity(8);
        let host = TestPciHost::new().with_function(bdf, |f| {
            f.pcie(DevicePortType::Endpoint).ptm(0x150, caps)
        });

        let info = read_ptm_capability(PhysicalPciDevice::new(&host, bdf)).unwrap();
        assert_eq!(info.offset, Some(ExtendedCapabilityOffset(0x150)));
        assert_eq!(info.capabilities, caps);
        assert!(is_requestor_capable(info.capabilities));
        assert!(!is_root_capable(info.capabilities));
    }

    #[test]
    fn absent_ptm_capability() {
        let bdf = PciBdf::new(3, 0, 0);
        let host = TestPciHost::new().with_function(bdf, |f| f.pcie(DevicePortType::Endpoint));

        let info = read_ptm_capability(PhysicalPciDevice::new(&host, bdf)).unwrap();
        assert_eq!(info.offset, None);
        assert_eq!(info.capabilities.into_bits(), 0);
    }

    #[test]
    fn root_bit() {
        let root = PtmCapabilities::new()
            .with_responder_capable(true)
            .with_root_capable(true);
        assert!(is_root_capable(root));
        assert!(!is_requestor_capable(root));
    }
}
