// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Access to the configuration space of physical PCI functions.
//!
//! The host's PCI enumeration subsystem owns the physical functions; this
//! layer only borrows them for the duration of a read.

use crate::PciBdf;
use crate::spec::cfg_space;
use crate::spec::cfg_space::BridgeRegister;
use crate::spec::cfg_space::CommonRegister;
use crate::spec::cfg_space::HeaderLayout;
use std::fmt;
use std::io;
use thiserror::Error;

/// Errors from physical configuration space accesses.
#[derive(Debug, Error)]
pub enum ConfigAccessError {
    /// The function is not (or no longer) present.
    #[error("pci function {0} is not present")]
    NotPresent(PciBdf),
    /// The access falls outside the extended configuration space.
    #[error("config offset {offset:#x} with width {width} is out of range")]
    OutOfRange {
        /// Offset of the access.
        offset: u16,
        /// Width of the access in bytes.
        width: u8,
    },
    /// The access is not naturally aligned.
    #[error("config offset {offset:#x} is not aligned for a {width}-byte access")]
    Unaligned {
        /// Offset of the access.
        offset: u16,
        /// Width of the access in bytes.
        width: u8,
    },
    /// The backend failed to perform the access.
    #[error("config space i/o failed for {bdf}")]
    Io {
        /// The function being accessed.
        bdf: PciBdf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
}

/// The physical PCI access layer.
pub trait PhysicalPciAccess: Send + Sync {
    /// Reads the naturally aligned dword at `offset` in the configuration
    /// space of `bdf`.
    fn read_cfg_u32(&self, bdf: PciBdf, offset: u16) -> Result<u32, ConfigAccessError>;

    /// Returns a snapshot of every function currently present on the host.
    ///
    /// Functions may disappear after the snapshot is taken; subsequent reads
    /// then fail with [`ConfigAccessError::NotPresent`].
    fn enumerate(&self) -> Result<Vec<PciBdf>, ConfigAccessError>;
}

/// Bus number registers of a type 1 (bridge) header.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct BridgeBusRange {
    /// Bus the bridge itself sits on.
    pub primary: u8,
    /// Bus directly behind the bridge.
    pub secondary: u8,
    /// Highest bus number behind the bridge.
    pub subordinate: u8,
}

/// A physical PCI function, borrowed from the access layer.
#[derive(Copy, Clone)]
pub struct PhysicalPciDevice<'a> {
    access: &'a dyn PhysicalPciAccess,
    bdf: PciBdf,
}

impl fmt::Debug for PhysicalPciDevice<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PhysicalPciDevice")
            .field("bdf", &self.bdf)
            .finish()
    }
}

impl<'a> PhysicalPciDevice<'a> {
    /// Borrows the function at `bdf`. No access is performed.
    pub fn new(access: &'a dyn PhysicalPciAccess, bdf: PciBdf) -> Self {
        Self { access, bdf }
    }

    /// The function's address.
    pub fn bdf(&self) -> PciBdf {
        self.bdf
    }

    /// The access layer this function was borrowed from.
    pub fn access(&self) -> &'a dyn PhysicalPciAccess {
        self.access
    }

    fn check(offset: u16, width: u8) -> Result<(), ConfigAccessError> {
        if offset as u32 + width as u32 > cfg_space::EXTENDED_CONFIG_SPACE_SIZE as u32 {
            return Err(ConfigAccessError::OutOfRange { offset, width });
        }
        if offset % width as u16 != 0 {
            return Err(ConfigAccessError::Unaligned { offset, width });
        }
        Ok(())
    }

    /// Reads a dword. `offset` must be 4-byte aligned.
    pub fn read_u32(&self, offset: u16) -> Result<u32, ConfigAccessError> {
        Self::check(offset, 4)?;
        self.access.read_cfg_u32(self.bdf, offset)
    }

    /// Reads a word. `offset` must be 2-byte aligned.
    pub fn read_u16(&self, offset: u16) -> Result<u16, ConfigAccessError> {
        Self::check(offset, 2)?;
        let dword = self.access.read_cfg_u32(self.bdf, offset & !3)?;
        Ok((dword >> ((offset & 3) * 8)) as u16)
    }

    /// Reads a byte.
    pub fn read_u8(&self, offset: u16) -> Result<u8, ConfigAccessError> {
        Self::check(offset, 1)?;
        let dword = self.access.read_cfg_u32(self.bdf, offset & !3)?;
        Ok((dword >> ((offset & 3) * 8)) as u8)
    }

    /// Returns the header layout, with the multi-function bit masked off.
    pub fn header_layout(&self) -> Result<HeaderLayout, ConfigAccessError> {
        let header_type = self.read_u8(CommonRegister::HEADER_TYPE.0)?;
        Ok(HeaderLayout(header_type & cfg_space::HEADER_TYPE_LAYOUT_MASK))
    }

    /// Returns the bridge bus number registers, or `None` if this function
    /// does not have a type 1 header.
    pub fn bridge_bus_range(&self) -> Result<Option<BridgeBusRange>, ConfigAccessError> {
        if self.header_layout()? != HeaderLayout::BRIDGE {
            return Ok(None);
        }
        let val = self.read_u32(BridgeRegister::PRIMARY_BUS.0)?;
        Ok(Some(BridgeBusRange {
            primary: val as u8,
            secondary: (val >> 8) as u8,
            subordinate: (val >> 16) as u8,
        }))
    }
}
