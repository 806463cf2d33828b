// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Core PCI definitions shared by the device model and the hypervisor:
//! register layouts, physical configuration space access, capability list
//! walking, and emulated configuration space images.

#![forbid(unsafe_code)]

pub mod access;
pub mod capabilities;
pub mod cfg_space_emu;
pub mod spec;
#[cfg(unix)]
pub mod sysfs;
#[cfg(any(test, feature = "test_helpers"))]
pub mod test_helpers;

use serde::Deserialize;
use serde::Serialize;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

const BDF_BUS_SHIFT: u16 = 8;
const BDF_DEVICE_SHIFT: u16 = 3;
const BDF_DEVICE_MASK: u16 = 0x1f;
const BDF_FUNCTION_MASK: u16 = 0x7;

/// A PCI bus/device/function address in segment 0, encoded the way requester
/// IDs are: `bus << 8 | device << 3 | function`.
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PciBdf(u16);

impl PciBdf {
    /// Builds a BDF from its parts. Out-of-range device and function numbers
    /// are truncated.
    pub const fn new(bus: u8, device: u8, function: u8) -> Self {
        Self(
            (bus as u16) << BDF_BUS_SHIFT
                | ((device as u16) & BDF_DEVICE_MASK) << BDF_DEVICE_SHIFT
                | (function as u16) & BDF_FUNCTION_MASK,
        )
    }

    /// Wraps a raw 16-bit BDF.
    pub const fn from_bits(bits: u16) -> Self {
        Self(bits)
    }

    /// Returns the raw 16-bit BDF.
    pub const fn into_bits(self) -> u16 {
        self.0
    }

    /// The bus number.
    pub const fn bus(self) -> u8 {
        (self.0 >> BDF_BUS_SHIFT) as u8
    }

    /// The device (slot) number.
    pub const fn device(self) -> u8 {
        ((self.0 >> BDF_DEVICE_SHIFT) & BDF_DEVICE_MASK) as u8
    }

    /// The function number.
    pub const fn function(self) -> u8 {
        (self.0 & BDF_FUNCTION_MASK) as u8
    }
}

impl fmt::Display for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}.{:x}",
            self.bus(),
            self.device(),
            self.function()
        )
    }
}

impl fmt::Debug for PciBdf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Error returned when parsing a [`PciBdf`] from a string.
#[derive(Debug, Error)]
#[error("invalid pci address {0:?}, expected [0000:]bb:dd.f")]
pub struct ParseBdfError(String);

impl FromStr for PciBdf {
    type Err = ParseBdfError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let err = || ParseBdfError(s.to_owned());
        let (rest, function) = s.rsplit_once('.').ok_or_else(err)?;
        let mut parts = rest.rsplit(':');
        let device = parts.next().ok_or_else(err)?;
        let bus = parts.next().ok_or_else(err)?;
        match parts.next() {
            None => {}
            Some(segment) if u16::from_str_radix(segment, 16).ok() == Some(0) => {}
            Some(_) => return Err(err()),
        }
        if parts.next().is_some() {
            return Err(err());
        }

        let bus = u8::from_str_radix(bus, 16).map_err(|_| err())?;
        let device = u8::from_str_radix(device, 16).map_err(|_| err())?;
        let function = u8::from_str_radix(function, 16).map_err(|_| err())?;
        if u16::from(device) > BDF_DEVICE_MASK || u16::from(function) > BDF_FUNCTION_MASK {
            return Err(err());
        }
        Ok(PciBdf::new(bus, device, function))
    }
}

#[cfg(test)]
mod tests {
    use super::PciBdf;

    #[test]
    fn bdf_encoding() {
        let bdf = PciBdf::new(0x3, 0x1c, 0x2);
        assert_eq!(bdf.into_bits(), 0x03e2);
        assert_eq!(bdf.bus(), 3);
        assert_eq!(bdf.device(), 0x1c);
        assert_eq!(bdf.function(), 2);
        assert_eq!(bdf.to_string(), "03:1c.2");
    }

    #[test]
    fn bdf_parse() {
        assert_eq!("00:1c.0".parse::<PciBdf>().unwrap(), PciBdf::new(0, 0x1c, 0));
        assert_eq!(
            "0000:03:00.1".parse::<PciBdf>().unwrap(),
            PciBdf::new(3, 0, 1)
        );
        assert!("0001:03:00.1".parse::<PciBdf>().is_err());
        assert!("03:20.0".parse::<PciBdf>().is_err());
        assert!("03:00.8".parse::<PciBdf>().is_err());
        assert!("0300.0".parse::<PciBdf>().is_err());
        assert!("garbage".parse::<PciBdf>().is_err());
    }
}
