// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Types and constants specified by the PCI and PCI Express specs.
//!
//! This module MUST NOT contain any vendor-specific constants!

/// Defines a transparent newtype with named associated constants.
///
/// Unlike a Rust `enum`, any bit pattern is a valid value, which is what
/// hardware-sourced register fields require.
macro_rules! open_enum {
    (
        $(#[$attr:meta])*
        $vis:vis enum $name:ident: $ty:ty {
            $($(#[$vattr:meta])* $variant:ident = $value:expr,)*
        }
    ) => {
        $(#[$attr])*
        #[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
        $vis struct $name(pub $ty);

        #[allow(missing_docs)]
        impl $name {
            $($(#[$vattr])* pub const $variant: $name = $name($value);)*
        }

        impl core::fmt::Debug for $name {
            #[allow(unreachable_patterns)]
            fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
                match *self {
                    $(Self::$variant => f.pad(stringify!($variant)),)*
                    _ => write!(f, "{}({:#x})", stringify!($name), self.0),
                }
            }
        }

        impl From<$ty> for $name {
            fn from(v: $ty) -> Self {
                Self(v)
            }
        }

        impl From<$name> for $ty {
            fn from(v: $name) -> Self {
                v.0
            }
        }
    };
}

pub mod hwid {
    //! Hardware ID types and constants

    open_enum! {
        /// ClassCode identifies the PCI device's type.
        ///
        /// Values pulled from <https://wiki.osdev.org/PCI#Class_Codes>.
        pub enum ClassCode: u8 {
            UNCLASSIFIED = 0x00,
            MASS_STORAGE_CONTROLLER = 0x01,
            NETWORK_CONTROLLER = 0x02,
            DISPLAY_CONTROLLER = 0x03,
            MULTIMEDIA_CONTROLLER = 0x04,
            MEMORY_CONTROLLER = 0x05,
            BRIDGE = 0x06,
            SIMPLE_COMMUNICATION_CONTROLLER = 0x07,
            BASE_SYSTEM_PERIPHERAL = 0x08,
            SERIAL_BUS_CONTROLLER = 0x0C,
            /// Vendor specific
            UNASSIGNED = 0xFF,
        }
    }

    // Most subclass values aren't used here. Only add values as needed.

    open_enum! {
        /// SubclassCode identifies the PCI device's function.
        pub enum Subclass: u8 {
            // Bridge (Class code: 0x06)
            BRIDGE_HOST = 0x00,
            BRIDGE_ISA = 0x01,
            BRIDGE_PCI_TO_PCI = 0x04,
            BRIDGE_OTHER = 0x80,
        }
    }
}

/// Configuration Space
///
/// Sources: PCI 2.3 Spec - Chapter 6, PCI Express Base Spec - Chapter 7
pub mod cfg_space {
    use bitfield_struct::bitfield;

    /// Size of the conventional configuration space.
    pub const CONFIG_SPACE_SIZE: u16 = 0x100;

    /// Size of the PCI Express extended configuration space.
    pub const EXTENDED_CONFIG_SPACE_SIZE: u16 = 0x1000;

    /// Offset of the first extended capability header.
    pub const EXTENDED_CAPABILITIES_OFFSET: u16 = 0x100;

    open_enum! {
        /// Byte offsets of individual registers shared between type 0 and
        /// type 1 headers.
        ///
        /// | Offset | Bits 31-24     | Bits 23-16  | Bits 15-8     | Bits 7-0             |
        /// |--------|----------------|-------------|---------------|----------------------|
        /// | 0x0    | Device ID      |             | Vendor ID     |                      |
        /// | 0x4    | Status         |             | Command       |                      |
        /// | 0x8    | Class code     | Subclass    | Prog IF       | Revision ID          |
        /// | 0xC    | BIST           | Header type | Latency Timer | Cache Line Size      |
        /// | 0x34   | Reserved       |             |               | Capabilities Pointer |
        pub enum CommonRegister: u16 {
            VENDOR_ID   = 0x00,
            DEVICE_ID   = 0x02,
            COMMAND     = 0x04,
            STATUS      = 0x06,
            REVISION_ID = 0x08,
            PROG_IF     = 0x09,
            SUBCLASS    = 0x0A,
            CLASS_CODE  = 0x0B,
            HEADER_TYPE = 0x0E,
            CAP_PTR     = 0x34,
        }
    }

    open_enum! {
        /// Byte offsets of the bus number registers in a type 01h header.
        ///
        /// | Offset | Bits 31-24              | Bits 23-16             | Bits 15-8            | Bits 7-0           |
        /// |--------|-------------------------|------------------------|----------------------|--------------------|
        /// | 0x18   | Secondary Latency Timer | Subordinate Bus Number | Secondary Bus Number | Primary Bus Number |
        pub enum BridgeRegister: u16 {
            PRIMARY_BUS     = 0x18,
            SECONDARY_BUS   = 0x19,
            SUBORDINATE_BUS = 0x1A,
        }
    }

    /// Header layout mask for the header type register. Bit 7 is the
    /// multi-function bit.
    pub const HEADER_TYPE_LAYOUT_MASK: u8 = 0x7f;

    open_enum! {
        /// Header layout, as encoded in the low bits of the header type
        /// register.
        pub enum HeaderLayout: u8 {
            NORMAL  = 0x00,
            BRIDGE  = 0x01,
            CARDBUS = 0x02,
        }
    }

    /// Mask applied to capability pointers; the bottom two bits are reserved.
    pub const CAP_PTR_MASK: u8 = 0xfc;

    /// Status Register
    #[bitfield(u16)]
    pub struct Status {
        #[bits(3)]
        _reserved: u16,
        pub interrupt_status: bool,
        pub capabilities_list: bool,
        pub capable_mhz_66: bool,
        _reserved2: bool,
        pub capable_fast_b2b: bool,
        pub err_master_parity: bool,
        #[bits(2)]
        pub devsel: u16,
        pub abort_target_signaled: bool,
        pub abort_target_received: bool,
        pub abort_master_received: bool,
        pub err_signaled: bool,
        pub err_detected_parity: bool,
    }
}

/// Capabilities
pub mod caps {
    open_enum! {
        /// Capability IDs
        ///
        /// Sources: PCI 2.3 Spec - Appendix H
        ///
        /// NOTE: this is a non-exhaustive list, so don't be afraid to add new
        /// variants on an as-needed basis!
        pub enum CapabilityId: u8 {
            POWER_MANAGEMENT = 0x01,
            MSI              = 0x05,
            VENDOR_SPECIFIC  = 0x09,
            PCI_EXPRESS      = 0x10,
            MSIX             = 0x11,
        }
    }

    open_enum! {
        /// Offsets into a standard capability header.
        pub enum CapabilityHeader: u16 {
            ID   = 0x00,
            NEXT = 0x01,
        }
    }

    /// PCI Express
    pub mod pci_express {
        use bitfield_struct::bitfield;

        open_enum! {
            /// Offsets into the PCI Express Capability structure.
            ///
            /// | Offset    | Bits 31-16                        | Bits 15-8    | Bits 7-0             |
            /// |-----------|-----------------------------------|--------------|----------------------|
            /// | Cap + 0x0 | PCI Express Capabilities Register | Next Pointer | Capability ID (0x10) |
            /// | Cap + 0x4 | Device Capabilities Register                                            |
            pub enum PciExpressCapabilityHeader: u16 {
                PCIE_CAPS   = 0x02,
                DEVICE_CAPS = 0x04,
            }
        }

        /// PCI Express Capabilities Register
        #[bitfield(u16)]
        pub struct PciExpressCapabilities {
            #[bits(4)]
            pub capability_version: u16,
            #[bits(4)]
            pub device_port_type: DevicePortType,
            pub slot_implemented: bool,
            #[bits(5)]
            pub interrupt_message_number: u16,
            pub _undefined: bool,
            pub flit_mode_supported: bool,
        }

        /// Device/Port Type field of the PCI Express Capabilities register.
        #[derive(Debug, Copy, Clone, PartialEq, Eq)]
        #[repr(u16)]
        pub enum DevicePortType {
            Endpoint = 0b0000,
            LegacyEndpoint = 0b0001,
            RootPort = 0b0100,
            UpstreamSwitchPort = 0b0101,
            DownstreamSwitchPort = 0b0110,
            PcieToPciBridge = 0b0111,
            PciToPcieBridge = 0b1000,
            RootComplexIntegratedEndpoint = 0b1001,
            RootComplexEventCollector = 0b1010,
            /// Any encoding PCI Express leaves reserved.
            Reserved = 0b1111,
        }

        impl DevicePortType {
            /// Decodes the 4-bit field. Reserved encodings collapse to
            /// [`DevicePortType::Reserved`].
            pub const fn from_bits(bits: u16) -> Self {
                match bits {
                    0b0000 => DevicePortType::Endpoint,
                    0b0001 => DevicePortType::LegacyEndpoint,
                    0b0100 => DevicePortType::RootPort,
                    0b0101 => DevicePortType::UpstreamSwitchPort,
                    0b0110 => DevicePortType::DownstreamSwitchPort,
                    0b0111 => DevicePortType::PcieToPciBridge,
                    0b1000 => DevicePortType::PciToPcieBridge,
                    0b1001 => DevicePortType::RootComplexIntegratedEndpoint,
                    0b1010 => DevicePortType::RootComplexEventCollector,
                    _ => DevicePortType::Reserved,
                }
            }

            /// Encodes the 4-bit field.
            pub const fn into_bits(self) -> u16 {
                self as u16
            }
        }
    }
}

/// PCI Express extended capabilities
pub mod ext_caps {
    use bitfield_struct::bitfield;

    open_enum! {
        /// Extended capability IDs
        ///
        /// NOTE: this is a non-exhaustive list.
        pub enum ExtendedCapabilityId: u16 {
            NULL                         = 0x0000,
            ADVANCED_ERROR_REPORTING     = 0x0001,
            ACCESS_CONTROL_SERVICES      = 0x000D,
            ALTERNATIVE_ROUTING_ID       = 0x000E,
            SINGLE_ROOT_IO_VIRTUALIZATION = 0x0010,
            RESIZABLE_BAR                = 0x0015,
            LATENCY_TOLERANCE_REPORTING  = 0x0018,
            PRECISION_TIME_MEASUREMENT   = 0x001F,
        }
    }

    /// PCI Express Extended Capability Header
    ///
    /// | Bits 31-20   | Bits 19-16 | Bits 15-0    |
    /// |--------------|------------|--------------|
    /// | Next Pointer | Version    | Capability ID|
    #[bitfield(u32)]
    #[derive(PartialEq, Eq)]
    pub struct ExtendedCapabilityHeader {
        pub capability_id: u16,
        #[bits(4)]
        pub version: u8,
        #[bits(12)]
        pub next: u16,
    }

    /// Precision Time Measurement
    pub mod ptm {
        use bitfield_struct::bitfield;

        open_enum! {
            /// Offsets into the PTM Extended Capability
            ///
            /// | Offset    | Bits 31-0                      |
            /// |-----------|--------------------------------|
            /// | Cap + 0x0 | Extended Capability Header     |
            /// | Cap + 0x4 | PTM Capability Register        |
            /// | Cap + 0x8 | PTM Control Register           |
            pub enum PtmCapabilityHeader: u16 {
                HEADER       = 0x00,
                CAPABILITIES = 0x04,
                CONTROL      = 0x08,
            }
        }

        /// Length of the PTM extended capability structure.
        pub const PTM_CAPABILITY_LEN: u16 = 0x0C;

        /// PTM Capability Register
        #[bitfield(u32)]
        #[derive(PartialEq, Eq)]
        pub struct PtmCapabilities {
            pub requester_capable: bool,
            pub responder_capable: bool,
            pub root_capable: bool,
            pub eptm_capable: bool,
            pub propagation_delay_adaptation_interpretation_b: bool,
            #[bits(3)]
            _reserved: u32,
            /// Local clock granularity, in nanoseconds. 0 means not
            /// implemented, 0xFF means greater than 254ns.
            #[bits(8)]
            pub local_clock_granularity: u8,
            #[bits(16)]
            _reserved2: u32,
        }

        /// PTM Control Register
        #[bitfield(u32)]
        #[derive(PartialEq, Eq)]
        pub struct PtmControl {
            pub enable: bool,
            pub root_select: bool,
            #[bits(6)]
            _reserved: u32,
            #[bits(8)]
            pub effective_granularity: u8,
            #[bits(16)]
            _reserved2: u32,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::caps::pci_express::DevicePortType;
    use super::caps::pci_express::PciExpressCapabilities;
    use super::ext_caps::ExtendedCapabilityHeader;
    use super::ext_caps::ExtendedCapabilityId;
    use super::ext_caps::ptm::PtmCapabilities;

    #[test]
    fn ext_header_layout() {
        let header = ExtendedCapabilityHeader::from_bits(0x1401_001f);
        assert_eq!(
            header.capability_id(),
            ExtendedCapabilityId::PRECISION_TIME_MEASUREMENT.0
        );
        assert_eq!(header.version(), 1);
        assert_eq!(header.next(), 0x140);
    }

    #[test]
    fn port_type_decoding() {
        let caps = PciExpressCapabilities::from_bits(0x0042);
        assert_eq!(caps.capability_version(), 2);
        assert_eq!(caps.device_port_type(), DevicePortType::RootPort);

        let caps = PciExpressCapabilities::from_bits(0x0092);
        assert_eq!(
            caps.device_port_type(),
            DevicePortType::RootComplexIntegratedEndpoint
        );

        assert_eq!(DevicePortType::from_bits(0b1100), DevicePortType::Reserved);
    }

    #[test]
    fn ptm_capability_bits() {
        let caps = PtmCapabilities::from_bits(0x0000_0a05);
        assert!(caps.requester_capable());
        assert!(!caps.responder_capable());
        assert!(caps.root_capable());
        assert_eq!(caps.local_clock_granularity(), 0x0a);
    }

    #[test]
    fn open_enum_debug() {
        assert_eq!(
            format!("{:?}", ExtendedCapabilityId::PRECISION_TIME_MEASUREMENT),
            "PRECISION_TIME_MEASUREMENT"
        );
        assert_eq!(
            format!("{:?}", ExtendedCapabilityId(0x42)),
            "ExtendedCapabilityId(0x42)"
        );
    }
}
