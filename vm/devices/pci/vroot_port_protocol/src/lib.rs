// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The request the device model sends to the hypervisor to create an
//! emulated device, and the virtual root port arguments it carries.
//!
//! Both sides are built from this crate, so the layout is `repr(C)` in host
//! byte order.

#![forbid(unsafe_code)]

use pci_core::PciBdf;
use static_assertions::const_assert_eq;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::FromZeros;
use zerocopy::Immutable;
use zerocopy::IntoBytes;
use zerocopy::KnownLayout;

/// Vendor ID of the synthesized root port.
pub const VROOT_PORT_VENDOR_ID: u16 = 0x8086;
/// Device ID of the synthesized root port.
pub const VROOT_PORT_DEVICE_ID: u16 = 0x9D12;

/// Current version of [`VrootPortArgs`].
pub const VROOT_PORT_ARGS_VERSION: u32 = 1;

/// Size of the argument block in an [`EmulatedDeviceRequest`].
pub const EMULATED_DEVICE_ARGS_SIZE: usize = 64;

/// A request to create an emulated device in a VM.
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct EmulatedDeviceRequest {
    /// Vendor ID of the device to emulate.
    pub vendor_id: u16,
    /// Device ID of the device to emulate.
    pub device_id: u16,
    /// Guest BDF the device appears at.
    pub slot: u32,
    /// Version of the argument block layout.
    pub version: u32,
    /// Number of valid bytes in `args`.
    pub args_len: u32,
    /// Device-specific arguments.
    pub args: [u8; EMULATED_DEVICE_ARGS_SIZE],
}

const_assert_eq!(size_of::<EmulatedDeviceRequest>(), 80);

/// Arguments for a virtual root port, at the start of
/// [`EmulatedDeviceRequest::args`].
#[repr(C)]
#[derive(Copy, Clone, Debug, PartialEq, Eq, IntoBytes, Immutable, KnownLayout, FromBytes)]
pub struct VrootPortArgs {
    /// BDF of the physical root port above the passthrough device.
    pub phy_bdf: u32,
    /// Bus the virtual root port sits on.
    pub primary_bus: u8,
    /// Bus behind the virtual root port.
    pub secondary_bus: u8,
    /// Highest bus behind the virtual root port.
    pub subordinate_bus: u8,
    /// 1 if the physical root port is a PTM root, otherwise 0.
    pub ptm_capable: u8,
    /// Offset of the PTM capability on the physical root port.
    pub ptm_cap_offset: u32,
}

const_assert_eq!(size_of::<VrootPortArgs>(), 12);

/// Errors decoding a virtual root port request.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ArgsDecodeError {
    /// The request names a different device.
    #[error("request is for device {vendor_id:#06x}:{device_id:#06x}, not a virtual root port")]
    NotVrootPort {
        /// Requested vendor ID.
        vendor_id: u16,
        /// Requested device ID.
        device_id: u16,
    },
    /// The argument block version is not understood.
    #[error("unsupported argument version {0}")]
    UnsupportedVersion(u32),
    /// The argument block is shorter than [`VrootPortArgs`] or longer than
    /// the request can hold.
    #[error("invalid argument length {0}")]
    InvalidLength(u32),
    /// A BDF field does not fit in 16 bits.
    #[error("invalid bdf {0:#x}")]
    InvalidBdf(u32),
    /// The PTM flag is neither 0 nor 1.
    #[error("invalid ptm flag {0}")]
    InvalidPtmFlag(u8),
}

/// Describes the virtual root port to synthesize above a passthrough
/// endpoint.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct VirtualRootPortDescriptor {
    /// The physical root port.
    pub physical_bdf: PciBdf,
    /// Bus of the passthrough endpoint.
    pub primary_bus: u8,
    /// Virtual bus allocated for this root port.
    pub secondary_bus: u8,
    /// Always 0.
    pub subordinate_bus: u8,
    /// Whether the physical root port is a PTM root.
    pub ptm_capable: bool,
    /// Offset of the PTM capability on the physical root port.
    pub ptm_capability_offset: u32,
}

impl VirtualRootPortDescriptor {
    /// Encodes the descriptor as request arguments.
    pub fn to_args(&self) -> VrootPortArgs {
        VrootPortArgs {
            phy_bdf: self.physical_bdf.into_bits().into(),
            primary_bus: self.primary_bus,
            secondary_bus: self.secondary_bus,
            subordinate_bus: self.subordinate_bus,
            ptm_capable: self.ptm_capable.into(),
            ptm_cap_offset: self.ptm_capability_offset,
        }
    }

    /// Decodes request arguments.
    pub fn from_args(args: &VrootPortArgs) -> Result<Self, ArgsDecodeError> {
        let ptm_capable = match args.ptm_capable {
            0 => false,
            1 => true,
            n => return Err(ArgsDecodeError::InvalidPtmFlag(n)),
        };
        Ok(Self {
            physical_bdf: bdf_from_u32(args.phy_bdf)?,
            primary_bus: args.primary_bus,
            secondary_bus: args.secondary_bus,
            subordinate_bus: args.subordinate_bus,
            ptm_capable,
            ptm_capability_offset: args.ptm_cap_offset,
        })
    }

    /// Builds a request that creates this root port at guest BDF `slot`.
    pub fn to_request(&self, slot: PciBdf) -> EmulatedDeviceRequest {
        let args = self.to_args();
        let mut request = EmulatedDeviceRequest {
            vendor_id: VROOT_PORT_VENDOR_ID,
            device_id: VROOT_PORT_DEVICE_ID,
            slot: slot.into_bits().into(),
            version: VROOT_PORT_ARGS_VERSION,
            args_len: size_of::<VrootPortArgs>() as u32,
            args: [0; EMULATED_DEVICE_ARGS_SIZE],
        };
        request.args[..size_of::<VrootPortArgs>()].copy_from_slice(args.as_bytes());
        request
    }
}

fn bdf_from_u32(bdf: u32) -> Result<PciBdf, ArgsDecodeError> {
    u16::try_from(bdf)
        .map(PciBdf::from_bits)
        .map_err(|_| ArgsDecodeError::InvalidBdf(bdf))
}

impl EmulatedDeviceRequest {
    /// Returns an all-zero request.
    pub fn new() -> Self {
        Self::new_zeroed()
    }

    /// Whether this request is for a virtual root port.
    pub fn is_vroot_port(&self) -> bool {
        self.vendor_id == VROOT_PORT_VENDOR_ID && self.device_id == VROOT_PORT_DEVICE_ID
    }

    /// The guest BDF the device appears at.
    pub fn slot(&self) -> Result<PciBdf, ArgsDecodeError> {
        bdf_from_u32(self.slot)
    }

    /// Decodes the virtual root port arguments.
    pub fn vroot_port_descriptor(&self) -> Result<VirtualRootPortDescriptor, ArgsDecodeError> {
        if !self.is_vroot_port() {
            return Err(ArgsDecodeError::NotVrootPort {
                vendor_id: self.vendor_id,
                device_id: self.device_id,
            });
        }
        if self.version != VROOT_PORT_ARGS_VERSION {
            return Err(ArgsDecodeError::UnsupportedVersion(self.version));
        }
        let len = self.args_len as usize;
        if len < size_of::<VrootPortArgs>() || len > EMULATED_DEVICE_ARGS_SIZE {
            return Err(ArgsDecodeError::InvalidLength(self.args_len));
        }
        let (args, _) = VrootPortArgs::read_from_prefix(&self.args[..len])
            .map_err(|_| ArgsDecodeError::InvalidLength(self.args_len))?;
        VirtualRootPortDescriptor::from_args(&args)
    }
}

impl Default for EmulatedDeviceRequest {
    fn default() -> Self {
        Self::new()
    }
}

/// The hypervisor-facing channel used to create emulated devices.
pub trait EmulatedDeviceSink: Send + Sync {
    /// Submits a creation request for the VM this sink belongs to.
    fn add_emulated_device(&self, request: &EmulatedDeviceRequest) -> anyhow::Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    fn descriptor() -> VirtualRootPortDescriptor {
        VirtualRootPortDescriptor {
            physical_bdf: PciBdf::new(0, 0x1c, 0),
            primary_bus: 3,
            secondary_bus: 1,
            subordinate_bus: 0,
            ptm_capable: true,
            ptm_capability_offset: 0x140,
        }
    }

    #[test]
    fn wire_layout() {
        let request = descriptor().to_request(PciBdf::new(3, 0, 0));
        let bytes = request.as_bytes();
        assert_eq!(bytes.len(), 80);
        assert_eq!(&bytes[0..2], &0x8086u16.to_ne_bytes());
        assert_eq!(&bytes[2..4], &0x9d12u16.to_ne_bytes());
        assert_eq!(&bytes[4..8], &0x0300u32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &1u32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &12u32.to_ne_bytes());
        // Arguments: phy_bdf, then the four bytes, then the PTM offset.
        assert_eq!(&bytes[16..20], &0x00e0u32.to_ne_bytes());
        assert_eq!(&bytes[20..24], &[3, 1, 0, 1]);
        assert_eq!(&bytes[24..28], &0x140u32.to_ne_bytes());
        assert!(bytes[28..].iter().all(|&b| b == 0));
    }

    #[test]
    fn decode_from_bytes() {
        let sent = descriptor().to_request(PciBdf::new(3, 0, 0));
        let (received, _) = EmulatedDeviceRequest::read_from_prefix(sent.as_bytes()).unwrap();
        assert_eq!(received.slot().unwrap(), PciBdf::new(3, 0, 0));
        assert_eq!(received.vroot_port_descriptor().unwrap(), descriptor());
    }

    #[test]
    fn rejects_bad_requests() {
        let good = descriptor().to_request(PciBdf::new(3, 0, 0));

        let mut request = good;
        request.version = 2;
        assert_eq!(
            request.vroot_port_descriptor(),
            Err(ArgsDecodeError::UnsupportedVersion(2))
        );

        let mut request = good;
        request.args_len = 8;
        assert_eq!(
            request.vroot_port_descriptor(),
            Err(ArgsDecodeError::InvalidLength(8))
        );

        let mut request = good;
        request.args[7] = 2;
        assert_eq!(
            request.vroot_port_descriptor(),
            Err(ArgsDecodeError::InvalidPtmFlag(2))
        );

        let mut request = good;
        request.args[2] = 1;
        assert_eq!(
            request.vroot_port_descriptor(),
            Err(ArgsDecodeError::InvalidBdf(0x1_00e0))
        );

        let mut request = good;
        request.device_id = 0x1234;
        assert!(matches!(
            request.vroot_port_descriptor(),
            Err(ArgsDecodeError::NotVrootPort { .. })
        ));
    }
}
