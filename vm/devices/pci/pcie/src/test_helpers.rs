// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

use pci_core::PciBdf;
use pci_core::spec::caps::pci_express::DevicePortType;
use pci_core::spec::ext_caps::ptm::PtmCapabilities;
use pci_core::spec::ext_caps::ptm::PtmControl;
use pci_core::test_helpers::TestPciHost;

pub const PHYSICAL_ROOT_PORT: PciBdf = PciBdf::new(0, 0x1c, 0);
pub const PHYSICAL_ENDPOINT: PciBdf = PciBdf::new(3, 0, 0);

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::TRACE)
        .try_init();
}

/// A host with a PTM root port at 00:1c.0 (PTM at 0x140) above a PTM
/// requester endpoint at 03:00.0.
///
/// The root port's header is filled with a byte pattern so mirrored
/// registers can be told apart from overridden ones.
pub fn physical_host() -> TestPciHost {
    TestPciHost::new()
        .with_function(PHYSICAL_ROOT_PORT, |mut f| {
            for offset in (0..0x100u16).step_by(4) {
                let b = (offset as u8) ^ 0xa5;
                f = f.with_u32(
                    offset,
                    u32::from_le_bytes([b, b.wrapping_add(1), b.wrapping_add(2), b.wrapping_add(3)]),
                );
            }
            f.with_ids(0x8086, 0xa110)
                .bridge(0, 3, 3)
                .pcie(DevicePortType::RootPort)
                .ptm_with_control(
                    0x140,
                    PtmCapabilities::new()
                        .with_responder_capable(true)
                        .with_root_capable(true)
                        .with_local_clock_granularity(4),
                    PtmControl::new().with_effective_granularity(4),
                )
        })
        .with_function(PHYSICAL_ENDPOINT, |f| {
            f.pcie(DevicePortType::Endpoint)
                .ptm(0x100, PtmCapabilities::new().with_requester_capable(true))
        })
}
