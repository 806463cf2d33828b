// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Hypervisor-side emulation of virtual PCI Express root ports that expose
//! a physical root port's PTM capability to a guest.

#![forbid(unsafe_code)]

pub mod vm;
pub mod vroot_port;

#[cfg(test)]
mod test_helpers;
