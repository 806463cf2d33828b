// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Decides whether a passthrough device gets PTM, and requests the virtual
//! root port that exposes it to the guest.

use crate::allocator;
use crate::allocator::PtmVm;
use crate::ptm;
use crate::topology;
use crate::topology::TopologyError;
use pci_core::PciBdf;
use pci_core::access::PhysicalPciAccess;
use pci_core::access::PhysicalPciDevice;
use pci_core::spec::caps::pci_express::DevicePortType;
use pci_core::spec::ext_caps::ptm::PtmCapabilities;
use thiserror::Error;
use vroot_port_protocol::VirtualRootPortDescriptor;

/// Progress of a probe. Errors report the stage at which they were raised;
/// a probe that reaches the end returns its secondary bus instead.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ProbeStage {
    /// Looking for the PCI Express capability.
    CheckPcie,
    /// Looking for the PTM extended capability.
    CheckPtmPresent,
    /// Deciding how to handle the device/port type.
    ClassifyPortType,
    /// Checking an endpoint's requester capability.
    EndpointPath,
    /// Root-complex integrated endpoint; no virtual root port needed.
    IntegratedPath,
    /// Resolving the root port above an endpoint.
    FindRootPort,
    /// Checking that the root port is a PTM root.
    ValidateRootPortPtm,
    /// Issuing a bus number and requesting the virtual root port.
    AllocateVirtualRootPort,
}

/// Reasons a passthrough device does not get PTM.
///
/// Each carries the passthrough device's BDF.
#[derive(Debug, Error)]
pub enum ProbeError {
    /// The device has no PCI Express capability.
    #[error("{bdf} is not a pci express device")]
    NotPcie {
        /// The passthrough device.
        bdf: PciBdf,
    },
    /// The device has no PTM capability.
    #[error("{bdf} does not implement ptm")]
    PtmUnsupported {
        /// The passthrough device.
        bdf: PciBdf,
    },
    /// The device is an endpoint that cannot issue PTM requests.
    #[error("{bdf} is not a ptm requester")]
    NotRequestor {
        /// The passthrough device.
        bdf: PciBdf,
    },
    /// No root port sits directly above the device.
    #[error("no root port directly above {bdf}")]
    NoUpstreamRootPort {
        /// The passthrough device.
        bdf: PciBdf,
    },
    /// The root port above the device is not a PTM root.
    #[error("root port {root_port} above {bdf} is not a ptm root")]
    UpstreamNotPtmRoot {
        /// The passthrough device.
        bdf: PciBdf,
        /// The physical root port.
        root_port: PciBdf,
    },
    /// The device's port type cannot be a PTM requester.
    #[error("{bdf} has unsupported port type {port_type:?}")]
    UnsupportedTopology {
        /// The passthrough device.
        bdf: PciBdf,
        /// Its device/port type.
        port_type: DevicePortType,
    },
    /// The VM has no virtual bus numbers left.
    #[error("no virtual bus available for {bdf}")]
    BusExhausted {
        /// The passthrough device.
        bdf: PciBdf,
        /// The allocator error.
        #[source]
        source: allocator::BusExhausted,
    },
    /// The hypervisor rejected the virtual root port.
    #[error("failed to create virtual root port for {bdf}")]
    CreateVrootPort {
        /// The passthrough device.
        bdf: PciBdf,
        /// The error from the hypervisor channel.
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
    /// Configuration space could not be read.
    #[error("config space access failed for {bdf} at stage {stage:?}")]
    ConfigAccess {
        /// The passthrough device.
        bdf: PciBdf,
        /// The stage that failed.
        stage: ProbeStage,
        /// The underlying failure.
        #[source]
        source: TopologyError,
    },
}

impl ProbeError {
    /// The passthrough device the probe was for.
    pub fn bdf(&self) -> PciBdf {
        match *self {
            ProbeError::NotPcie { bdf }
            | ProbeError::PtmUnsupported { bdf }
            | ProbeError::NotRequestor { bdf }
            | ProbeError::NoUpstreamRootPort { bdf }
            | ProbeError::UpstreamNotPtmRoot { bdf, .. }
            | ProbeError::UnsupportedTopology { bdf, .. }
            | ProbeError::BusExhausted { bdf, .. }
            | ProbeError::CreateVrootPort { bdf, .. }
            | ProbeError::ConfigAccess { bdf, .. } => bdf,
        }
    }

    /// The stage at which the probe failed.
    pub fn stage(&self) -> ProbeStage {
        match *self {
            ProbeError::NotPcie { .. } => ProbeStage::CheckPcie,
            ProbeError::PtmUnsupported { .. } => ProbeStage::CheckPtmPresent,
            ProbeError::UnsupportedTopology { .. } => ProbeStage::ClassifyPortType,
            ProbeError::NotRequestor { .. } => ProbeStage::EndpointPath,
            ProbeError::NoUpstreamRootPort { .. } => ProbeStage::FindRootPort,
            ProbeError::UpstreamNotPtmRoot { .. } => ProbeStage::ValidateRootPortPtm,
            ProbeError::BusExhausted { .. } | ProbeError::CreateVrootPort { .. } => {
                ProbeStage::AllocateVirtualRootPort
            }
            ProbeError::ConfigAccess { stage, .. } => stage,
        }
    }
}

/// Probes passthrough devices for PTM support.
pub struct PtmProbe<'a> {
    access: &'a dyn PhysicalPciAccess,
}

impl<'a> PtmProbe<'a> {
    /// Creates a probe that reads the host hierarchy through `access`.
    pub fn new(access: &'a dyn PhysicalPciAccess) -> Self {
        Self { access }
    }

    /// Probes `passthrough` for VM `vm`.
    ///
    /// For an endpoint below a PTM root port, a virtual root port is
    /// requested from the hypervisor and the virtual secondary bus it was
    /// given is returned. For a root-complex integrated endpoint nothing is
    /// requested and 0 is returned.
    pub fn probe(&self, vm: &PtmVm, passthrough: PciBdf) -> Result<u8, ProbeError> {
        let bdf = passthrough;
        let device = PhysicalPciDevice::new(self.access, bdf);
        let access_failed = |stage| move |source| ProbeError::ConfigAccess { bdf, stage, source };

        let port_type = match topology::port_type(device) {
            Ok(port_type) => port_type,
            Err(TopologyError::NotPcie(_)) => return Err(ProbeError::NotPcie { bdf }),
            Err(err) => return Err(access_failed(ProbeStage::CheckPcie)(err)),
        };

        let ptm = ptm::read_ptm_capability(device)
            .map_err(|err| access_failed(ProbeStage::CheckPtmPresent)(err.into()))?;
        if ptm.offset.is_none() {
            return Err(ProbeError::PtmUnsupported { bdf });
        }

        if !topology::is_valid_requestor(port_type) {
            return Err(ProbeError::UnsupportedTopology { bdf, port_type });
        }
        if port_type == DevicePortType::RootComplexIntegratedEndpoint {
            tracing::info!(
                vm = %vm.id(),
                %bdf,
                "integrated endpoint, no virtual root port needed"
            );
            return Ok(0);
        }
        self.probe_endpoint(vm, device, ptm.capabilities)
    }

    fn probe_endpoint(
        &self,
        vm: &PtmVm,
        device: PhysicalPciDevice<'_>,
        capabilities: PtmCapabilities,
    ) -> Result<u8, ProbeError> {
        let bdf = device.bdf();
        let access_failed = |stage| move |source| ProbeError::ConfigAccess { bdf, stage, source };

        if !ptm::is_requestor_capable(capabilities) {
            return Err(ProbeError::NotRequestor { bdf });
        }

        let root_port = match topology::find_upstream_root_port(self.access, device) {
            Ok(root_port) => root_port,
            Err(TopologyError::NotFound { .. }) => {
                return Err(ProbeError::NoUpstreamRootPort { bdf });
            }
            Err(err) => return Err(access_failed(ProbeStage::FindRootPort)(err)),
        };
        let root_device = PhysicalPciDevice::new(self.access, root_port);
        match topology::port_type(root_device) {
            Ok(port_type) if topology::is_valid_upstream(port_type) => {}
            Ok(port_type) => {
                tracing::debug!(%bdf, %root_port, ?port_type, "upstream bridge is not a root port");
                return Err(ProbeError::NoUpstreamRootPort { bdf });
            }
            Err(TopologyError::NotPcie(_)) => {
                tracing::debug!(%bdf, %root_port, "upstream bridge is not pci express");
                return Err(ProbeError::NoUpstreamRootPort { bdf });
            }
            Err(err) => return Err(access_failed(ProbeStage::FindRootPort)(err)),
        }

        let root_ptm = ptm::read_ptm_capability(root_device)
            .map_err(|err| access_failed(ProbeStage::ValidateRootPortPtm)(err.into()))?;
        let Some(root_ptm_offset) = root_ptm
            .offset
            .filter(|_| ptm::is_root_capable(root_ptm.capabilities))
        else {
            return Err(ProbeError::UpstreamNotPtmRoot { bdf, root_port });
        };

        let secondary_bus = vm
            .allocate_secondary_bus()
            .map_err(|source| ProbeError::BusExhausted { bdf, source })?;
        let descriptor = VirtualRootPortDescriptor {
            physical_bdf: root_port,
            primary_bus: bdf.bus(),
            secondary_bus,
            subordinate_bus: 0,
            ptm_capable: true,
            ptm_capability_offset: root_ptm_offset.get().into(),
        };

        tracing::info!(
            vm = %vm.id(),
            %bdf,
            %root_port,
            secondary_bus,
            ptm_offset = root_ptm_offset.get(),
            "requesting virtual root port"
        );
        vm.sink()
            .add_emulated_device(&descriptor.to_request(bdf))
            .map_err(|source| ProbeError::CreateVrootPort {
                bdf,
                source: source.into(),
            })?;

        Ok(secondary_bus)
    }

    /// Probes `passthrough` on the device attach path.
    ///
    /// Failure is not fatal to the attach: it is logged and the device is
    /// assigned without PTM.
    pub fn probe_for_attach(&self, vm: &PtmVm, passthrough: PciBdf) -> Option<u8> {
        match self.probe(vm, passthrough) {
            Ok(bus) => Some(bus),
            Err(err) => {
                tracing::warn!(
                    vm = %vm.id(),
                    bdf = %err.bdf(),
                    stage = ?err.stage(),
                    error = &err as &dyn std::error::Error,
                    "ptm not available for passthrough device"
                );
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::allocator::VmId;
    use crate::test_util::init_tracing;
    use parking_lot::Mutex;
    use pci_core::spec::caps::pci_express::DevicePortType;
    use pci_core::test_helpers::TestPciHost;
    use std::sync::Arc;
    use vroot_port_protocol::EmulatedDeviceRequest;
    use vroot_port_protocol::EmulatedDeviceSink;

    #[derive(Default)]
    struct RecordingSink {
        requests: Mutex<Vec<EmulatedDeviceRequest>>,
        fail: bool,
    }

    impl EmulatedDeviceSink for RecordingSink {
        fn add_emulated_device(&self, request: &EmulatedDeviceRequest) -> anyhow::Result<()> {
            if self.fail {
                anyhow::bail!("hypervisor rejected request");
            }
            self.requests.lock().push(*request);
            Ok(())
        }
    }

    const ROOT_PORT: PciBdf = PciBdf::new(1, 0, 0);
    const ENDPOINT: PciBdf = PciBdf::new(3, 0, 0);

    fn requester() -> PtmCapabilities {
        PtmCapabilities::new().with_requester_capable(true)
    }

    fn root() -> PtmCapabilities {
        PtmCapabilities::new()
            .with_responder_capable(true)
            .with_root_capable(true)
    }

    fn host(root_port_type: DevicePortType, root_caps: PtmCapabilities) -> TestPciHost {
        TestPciHost::new()
            .with_function(ROOT_PORT, |f| {
                f.bridge(1, 3, 3)
                    .pcie(root_port_type)
                    .ptm(0x140, root_caps)
            })
            .with_function(ENDPOINT, |f| {
                f.pcie(DevicePortType::Endpoint).ptm(0x100, requester())
            })
    }

    fn vm() -> (Arc<RecordingSink>, PtmVm) {
        let sink = Arc::new(RecordingSink::default());
        let vm = PtmVm::new(VmId(1), sink.clone());
        (sink, vm)
    }

    #[test]
    fn endpoint_below_ptm_root_port() {
        init_tracing();
        let host = host(DevicePortType::RootPort, root());
        let (sink, vm) = vm();

        assert_eq!(PtmProbe::new(&host).probe(&vm, ENDPOINT).unwrap(), 1);

        let requests = sink.requests.lock();
        assert_eq!(requests.len(), 1);
        let request = &requests[0];
        assert!(request.is_vroot_port());
        assert_eq!(request.slot().unwrap(), ENDPOINT);
        assert_eq!(
            request.vroot_port_descriptor().unwrap(),
            VirtualRootPortDescriptor {
                physical_bdf: ROOT_PORT,
                primary_bus: 3,
                secondary_bus: 1,
                subordinate_bus: 0,
                ptm_capable: true,
                ptm_capability_offset: 0x140,
            }
        );
    }

    #[test]
    fn successive_probes_get_increasing_buses() {
        let host = host(DevicePortType::RootPort, root())
            .with_function(PciBdf::new(0, 0x1c, 0), |f| {
                f.bridge(0, 4, 4)
                    .pcie(DevicePortType::RootPort)
                    .ptm(0x100, root())
            })
            .with_function(PciBdf::new(4, 0, 0), |f| {
                f.pcie(DevicePortType::Endpoint).ptm(0x100, requester())
            });
        let (sink, vm) = vm();
        let probe = PtmProbe::new(&host);

        assert_eq!(probe.probe(&vm, ENDPOINT).unwrap(), 1);
        assert_eq!(probe.probe(&vm, PciBdf::new(4, 0, 0)).unwrap(), 2);
        assert_eq!(probe.probe(&vm, ENDPOINT).unwrap(), 3);
        assert_eq!(sink.requests.lock().len(), 3);
    }

    #[test]
    fn integrated_endpoint() {
        let bdf = PciBdf::new(0, 0x1f, 0);
        let host = TestPciHost::new().with_function(bdf, |f| {
            f.pcie(DevicePortType::RootComplexIntegratedEndpoint)
                .ptm(0x100, requester())
        });
        let (sink, vm) = vm();

        assert_eq!(PtmProbe::new(&host).probe(&vm, bdf).unwrap(), 0);
        assert!(sink.requests.lock().is_empty());
        assert_eq!(vm.highest_secondary_bus(), 0);
    }

    #[test]
    fn not_pcie_allocates_nothing() {
        let host = TestPciHost::new().with_function(ENDPOINT, |f| f.with_ids(0x1af4, 0x1000));
        let (sink, vm) = vm();

        let err = PtmProbe::new(&host).probe(&vm, ENDPOINT).unwrap_err();
        assert!(matches!(err, ProbeError::NotPcie { bdf } if bdf == ENDPOINT));
        assert_eq!(err.stage(), ProbeStage::CheckPcie);
        assert_eq!(vm.highest_secondary_bus(), 0);
        assert!(sink.requests.lock().is_empty());
    }

    #[test]
    fn ptm_unsupported() {
        let host =
            TestPciHost::new().with_function(ENDPOINT, |f| f.pcie(DevicePortType::Endpoint));
        let (_sink, vm) = vm();

        let err = PtmProbe::new(&host).probe(&vm, ENDPOINT).unwrap_err();
        assert!(matches!(err, ProbeError::PtmUnsupported { .. }));
    }

    #[test]
    fn not_requestor() {
        let host = TestPciHost::new()
            .with_function(ROOT_PORT, |f| {
                f.bridge(1, 3, 3)
                    .pcie(DevicePortType::RootPort)
                    .ptm(0x140, root())
            })
            .with_function(ENDPOINT, |f| {
                f.pcie(DevicePortType::Endpoint)
                    .ptm(0x100, PtmCapabilities::new().with_responder_capable(true))
            });
        let (_sink, vm) = vm();

        let err = PtmProbe::new(&host).probe(&vm, ENDPOINT).unwrap_err();
        assert!(matches!(err, ProbeError::NotRequestor { .. }));
        assert_eq!(vm.highest_secondary_bus(), 0);
    }

    #[test]
    fn downstream_switch_port_is_not_a_root_port() {
        let host = host(DevicePortType::DownstreamSwitchPort, root());
        let (sink, vm) = vm();

        let err = PtmProbe::new(&host).probe(&vm, ENDPOINT).unwrap_err();
        assert!(matches!(err, ProbeError::NoUpstreamRootPort { bdf } if bdf == ENDPOINT));
        assert_eq!(err.stage(), ProbeStage::FindRootPort);
        assert_eq!(vm.highest_secondary_bus(), 0);
        assert!(sink.requests.lock().is_empty());
    }

    #[test]
    fn upstream_bridge_of_other_type() {
        let host = host(DevicePortType::PciToPcieBridge, root());
        let (_sink, vm) = vm();

        let err = PtmProbe::new(&host).probe(&vm, ENDPOINT).unwrap_err();
        assert!(matches!(err, ProbeError::NoUpstreamRootPort { bdf } if bdf == ENDPOINT));
        assert_eq!(err.stage(), ProbeStage::FindRootPort);
    }

    #[test]
    fn missing_upstream_bridge() {
        let host = TestPciHost::new().with_function(ENDPOINT, |f| {
            f.pcie(DevicePortType::Endpoint).ptm(0x100, requester())
        });
        let (_sink, vm) = vm();

        assert!(matches!(
            PtmProbe::new(&host).probe(&vm, ENDPOINT),
            Err(ProbeError::NoUpstreamRootPort { .. })
        ));
    }

    #[test]
    fn root_port_not_ptm_root() {
        let host = host(DevicePortType::RootPort, PtmCapabilities::new().with_responder_capable(true));
        let (_sink, vm) = vm();

        let err = PtmProbe::new(&host).probe(&vm, ENDPOINT).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::UpstreamNotPtmRoot { root_port, .. } if root_port == ROOT_PORT
        ));
        assert_eq!(vm.highest_secondary_bus(), 0);
    }

    #[test]
    fn unsupported_port_type() {
        let bdf = PciBdf::new(2, 0, 0);
        let host = TestPciHost::new().with_function(bdf, |f| {
            f.bridge(2, 5, 5)
                .pcie(DevicePortType::UpstreamSwitchPort)
                .ptm(0x100, requester())
        });
        let (_sink, vm) = vm();

        let err = PtmProbe::new(&host).probe(&vm, bdf).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::UnsupportedTopology {
                port_type: DevicePortType::UpstreamSwitchPort,
                ..
            }
        ));
        assert_eq!(err.stage(), ProbeStage::ClassifyPortType);
    }

    #[test]
    fn legacy_endpoint_is_not_a_requestor_type() {
        let legacy = PciBdf::new(3, 1, 0);
        let host = host(DevicePortType::RootPort, root()).with_function(legacy, |f| {
            f.pcie(DevicePortType::LegacyEndpoint)
                .ptm(0x100, requester())
        });
        let (sink, vm) = vm();

        let err = PtmProbe::new(&host).probe(&vm, legacy).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::UnsupportedTopology {
                port_type: DevicePortType::LegacyEndpoint,
                ..
            }
        ));
        assert_eq!(err.stage(), ProbeStage::ClassifyPortType);
        assert_eq!(vm.highest_secondary_bus(), 0);
        assert!(sink.requests.lock().is_empty());

        // The endpoint next to it still probes.
        assert_eq!(PtmProbe::new(&host).probe(&vm, ENDPOINT).unwrap(), 1);
    }

    #[test]
    fn vanished_device() {
        let host = host(DevicePortType::RootPort, root());
        host.remove(ENDPOINT);
        let (_sink, vm) = vm();

        let err = PtmProbe::new(&host).probe(&vm, ENDPOINT).unwrap_err();
        assert!(matches!(
            err,
            ProbeError::ConfigAccess {
                stage: ProbeStage::CheckPcie,
                ..
            }
        ));
        assert_eq!(err.bdf(), ENDPOINT);
    }

    #[test]
    fn sink_failure() {
        init_tracing();
        let host = host(DevicePortType::RootPort, root());
        let vm = PtmVm::new(
            VmId(2),
            Arc::new(RecordingSink {
                fail: true,
                ..Default::default()
            }),
        );

        let probe = PtmProbe::new(&host);
        assert!(matches!(
            probe.probe(&vm, ENDPOINT),
            Err(ProbeError::CreateVrootPort { .. })
        ));
        // The bus stays consumed.
        assert_eq!(vm.highest_secondary_bus(), 1);
        assert_eq!(probe.probe_for_attach(&vm, ENDPOINT), None);
    }
}
