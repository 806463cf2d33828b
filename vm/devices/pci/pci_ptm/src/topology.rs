// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Classifying PCIe functions and locating the root port above an endpoint.

use pci_core::PciBdf;
use pci_core::access::ConfigAccessError;
use pci_core::access::PhysicalPciAccess;
use pci_core::access::PhysicalPciDevice;
use pci_core::capabilities::CapabilityWalkError;
use pci_core::capabilities::find_capability;
use pci_core::spec::caps::CapabilityId;
use pci_core::spec::caps::pci_express::DevicePortType;
use pci_core::spec::caps::pci_express::PciExpressCapabilities;
use pci_core::spec::caps::pci_express::PciExpressCapabilityHeader;
use thiserror::Error;

/// Errors resolving the PCIe topology around a function.
#[derive(Debug, Error)]
pub enum TopologyError {
    /// The function has no PCI Express capability.
    #[error("{0} has no pci express capability")]
    NotPcie(PciBdf),
    /// No bridge has the function's bus as its secondary bus.
    #[error("no bridge found with secondary bus {bus:#04x} above {bdf}")]
    NotFound {
        /// The function whose parent was searched for.
        bdf: PciBdf,
        /// The function's bus.
        bus: u8,
    },
    /// Walking the capability list failed.
    #[error("capability walk failed")]
    CapabilityWalk(#[from] CapabilityWalkError),
    /// A configuration space read or the enumeration failed.
    #[error("config space access failed")]
    ConfigAccess(#[from] ConfigAccessError),
}

/// Returns the PCIe device/port type of `device`.
pub fn port_type(device: PhysicalPciDevice<'_>) -> Result<DevicePortType, TopologyError> {
    let offset = find_capability(device, CapabilityId::PCI_EXPRESS)?
        .ok_or(TopologyError::NotPcie(device.bdf()))?;
    let caps = PciExpressCapabilities::from_bits(
        device.read_u16(offset.get() + PciExpressCapabilityHeader::PCIE_CAPS.0)?,
    );
    Ok(caps.device_port_type())
}

/// Whether a function of this type may be a PTM requester that gets a
/// virtual root port (or, for integrated endpoints, needs none).
pub fn is_valid_requestor(port_type: DevicePortType) -> bool {
    matches!(
        port_type,
        DevicePortType::Endpoint | DevicePortType::RootComplexIntegratedEndpoint
    )
}

/// Whether a function of this type may serve as the PTM root above a
/// requester.
pub fn is_valid_upstream(port_type: DevicePortType) -> bool {
    port_type == DevicePortType::RootPort
}

/// Finds the bridge whose secondary bus is `device`'s bus.
///
/// Works from a snapshot of `access`'s functions. Functions that disappear
/// or fail to read while scanning are skipped.
pub fn find_upstream_root_port(
    access: &dyn PhysicalPciAccess,
    device: PhysicalPciDevice<'_>,
) -> Result<PciBdf, TopologyError> {
    let bus = device.bdf().bus();
    for bdf in access.enumerate()? {
        if bdf == device.bdf() {
            continue;
        }
        match PhysicalPciDevice::new(access, bdf).bridge_bus_range() {
            Ok(Some(range)) if range.secondary == bus => {
                tracing::debug!(
                    %bdf,
                    endpoint = %device.bdf(),
                    primary = range.primary,
                    subordinate = range.subordinate,
                    "found upstream bridge"
                );
                return Ok(bdf);
            }
            Ok(_) => {}
            Err(err) => {
                tracing::debug!(
                    %bdf,
                    error = &err as &dyn std::error::Error,
                    "skipping unreadable function"
                );
            }
        }
    }
    Err(TopologyError::NotFound {
        bdf: device.bdf(),
        bus,
    })
}
