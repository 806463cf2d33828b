// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Backing storage for an emulated PCI Express configuration space.
//!
//! The image is a plain 4096-byte buffer. Devices populate it once and then
//! serve guest accesses from it.

use crate::spec::cfg_space;
use thiserror::Error;

const IMAGE_SIZE: usize = cfg_space::EXTENDED_CONFIG_SPACE_SIZE as usize;

/// Errors from accesses to an emulated configuration space.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CfgAccessError {
    /// The access width is not 1, 2 or 4 bytes.
    #[error("invalid config access width {0}")]
    InvalidWidth(u8),
    /// The offset is not naturally aligned for the access width.
    #[error("config offset {offset:#x} is not aligned for a {width}-byte access")]
    Unaligned {
        /// Offset of the access.
        offset: u16,
        /// Width of the access in bytes.
        width: u8,
    },
    /// The access extends past the end of the configuration space.
    #[error("config offset {offset:#x} is out of range")]
    OutOfRange {
        /// Offset of the access.
        offset: u16,
    },
    /// The device has no configuration space to access.
    #[error("device is not initialized")]
    NotInitialized,
}

/// A 4096-byte configuration space image, stored in PCI (little-endian)
/// byte order.
#[derive(Clone, PartialEq, Eq)]
pub struct ConfigSpaceImage {
    bytes: Box<[u8; IMAGE_SIZE]>,
}

impl std::fmt::Debug for ConfigSpaceImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConfigSpaceImage")
            .field("vendor_id", &format_args!("{:#06x}", self.read_u16(0)))
            .field("device_id", &format_args!("{:#06x}", self.read_u16(2)))
            .finish_non_exhaustive()
    }
}

impl Default for ConfigSpaceImage {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigSpaceImage {
    /// Returns a zero-filled image.
    pub fn new() -> Self {
        Self {
            bytes: Box::new([0; IMAGE_SIZE]),
        }
    }

    fn check(offset: u16, width: u8) -> Result<usize, CfgAccessError> {
        if !matches!(width, 1 | 2 | 4) {
            return Err(CfgAccessError::InvalidWidth(width));
        }
        if offset % u16::from(width) != 0 {
            return Err(CfgAccessError::Unaligned { offset, width });
        }
        let offset = offset as usize;
        if offset + width as usize > IMAGE_SIZE {
            return Err(CfgAccessError::OutOfRange {
                offset: offset as u16,
            });
        }
        Ok(offset)
    }

    /// Reads `width` bytes at `offset`, zero-extended.
    pub fn read(&self, offset: u16, width: u8) -> Result<u32, CfgAccessError> {
        let offset = Self::check(offset, width)?;
        let mut buf = [0; 4];
        buf[..width as usize].copy_from_slice(&self.bytes[offset..offset + width as usize]);
        Ok(u32::from_le_bytes(buf))
    }

    /// Writes the low `width` bytes of `value` at `offset`.
    pub fn write(&mut self, offset: u16, width: u8, value: u32) -> Result<(), CfgAccessError> {
        let offset = Self::check(offset, width)?;
        self.bytes[offset..offset + width as usize]
            .copy_from_slice(&value.to_le_bytes()[..width as usize]);
        Ok(())
    }

    /// Reads an aligned dword. Out-of-range or unaligned offsets read as all
    /// ones, like an unimplemented register.
    pub fn read_u32(&self, offset: u16) -> u32 {
        self.read(offset, 4).unwrap_or(!0)
    }

    /// Reads an aligned word, all ones if invalid.
    pub fn read_u16(&self, offset: u16) -> u16 {
        self.read(offset, 2).map_or(!0, |v| v as u16)
    }

    /// Reads a byte, all ones if out of range.
    pub fn read_u8(&self, offset: u16) -> u8 {
        self.read(offset, 1).map_or(!0, |v| v as u8)
    }

    /// Writes an aligned dword.
    pub fn write_u32(&mut self, offset: u16, value: u32) -> Result<(), CfgAccessError> {
        self.write(offset, 4, value)
    }

    /// Writes an aligned word.
    pub fn write_u16(&mut self, offset: u16, value: u16) -> Result<(), CfgAccessError> {
        self.write(offset, 2, value.into())
    }

    /// Writes a byte.
    pub fn write_u8(&mut self, offset: u16, value: u8) -> Result<(), CfgAccessError> {
        self.write(offset, 1, value.into())
    }

    /// The raw image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..]
    }
}
