// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! [`PhysicalPciAccess`] backed by Linux sysfs
//! (`/sys/bus/pci/devices/<dddd:bb:dd.f>/config`).
//!
//! Only segment 0 is visible. Reads past the end of a config file (a
//! conventional device, or an unprivileged reader that only sees the first
//! 64 bytes) return all ones, as a master abort would.

use crate::PciBdf;
use crate::access::ConfigAccessError;
use crate::access::PhysicalPciAccess;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::PathBuf;

/// Default location of the PCI device directory.
pub const DEFAULT_SYSFS_PCI_DEVICES: &str = "/sys/bus/pci/devices";

/// Reads host PCI configuration space through sysfs.
#[derive(Debug, Clone)]
pub struct SysfsPciAccess {
    root: PathBuf,
}

impl Default for SysfsPciAccess {
    fn default() -> Self {
        Self::new(DEFAULT_SYSFS_PCI_DEVICES)
    }
}

impl SysfsPciAccess {
    /// Uses `root` as the PCI device directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn config_path(&self, bdf: PciBdf) -> PathBuf {
        self.root.join(format!("0000:{bdf}")).join("config")
    }
}

impl PhysicalPciAccess for SysfsPciAccess {
    fn read_cfg_u32(&self, bdf: PciBdf, offset: u16) -> Result<u32, ConfigAccessError> {
        let io_err = |source| ConfigAccessError::Io { bdf, source };

        let file = match fs_err::File::open(self.config_path(bdf)) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                return Err(ConfigAccessError::NotPresent(bdf));
            }
            Err(err) => return Err(io_err(err)),
        };

        let mut buf = [0; 4];
        let mut read = 0;
        while read < buf.len() {
            match file
                .file()
                .read_at(&mut buf[read..], u64::from(offset) + read as u64)
            {
                Ok(0) => return Ok(!0),
                Ok(n) => read += n,
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(io_err(err)),
            }
        }
        Ok(u32::from_le_bytes(buf))
    }

    fn enumerate(&self) -> Result<Vec<PciBdf>, ConfigAccessError> {
        let entries = fs_err::read_dir(&self.root).map_err(|source| ConfigAccessError::Io {
            bdf: PciBdf::from_bits(0),
            source,
        })?;

        let mut functions = Vec::new();
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(err) => {
                    tracing::debug!(error = &err as &dyn std::error::Error, "skipping sysfs entry");
                    continue;
                }
            };
            let name = entry.file_name();
            match name.to_str().map(str::parse::<PciBdf>) {
                Some(Ok(bdf)) => functions.push(bdf),
                _ => tracing::debug!(?name, "skipping non segment 0 pci device"),
            }
        }
        functions.sort();
        Ok(functions)
    }
}
