// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! PCIe Precision Time Measurement discovery for passthrough devices.
//!
//! When a PTM-capable endpoint is assigned to a VM, [`probe::PtmProbe`]
//! checks that the physical root port above it is a PTM root and, if so,
//! asks the hypervisor to synthesize a virtual root port in the guest's
//! hierarchy so the guest driver can enable PTM.

#![forbid(unsafe_code)]

pub mod allocator;
pub mod probe;
pub mod ptm;
pub mod topology;

#[cfg(test)]
mod test_util {
    /// Routes `tracing` output through the test harness.
    pub fn init_tracing() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::TRACE)
            .try_init();
    }
}
