//! Machine configuration
//!
//! Immutable description of a machine: RAM size, boot image, flash drives
//! and HTIF enables. Construction consumes a config and either yields a
//! complete machine or fails without side effects.

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::devices::htif;
use crate::MachineError;

/// One file-backed flash drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Start of the range in the target address space; 4 KiB aligned.
    pub start: u64,
    /// Length of the range; must match the backing file size.
    pub length: u64,
    /// Backing file on the host.
    pub backing: PathBuf,
    /// Label exported to the guest through the device tree.
    pub label: String,
    /// Whether target writes persist to the backing file.
    pub shared: bool,
}

/// HTIF command enables.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HtifConfig {
    pub ihalt: u64,
    pub iconsole: u64,
    pub iyield: u64,
}

impl Default for HtifConfig {
    fn default() -> Self {
        HtifConfig {
            ihalt: htif::DEFAULT_IHALT,
            iconsole: htif::DEFAULT_ICONSOLE,
            iyield: htif::DEFAULT_IYIELD,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MachineConfig {
    /// RAM length in bytes; multiple of 4 KiB.
    pub ram_length: u64,
    /// Boot image copied to the start of RAM.
    pub boot_image: Vec<u8>,
    /// Kernel command line, exported through the device tree.
    pub cmdline: String,
    pub flash: Vec<FlashConfig>,
    pub htif: HtifConfig,
    /// Attach the host terminal to the HTIF console.
    pub interactive: bool,
}

impl MachineConfig {
    pub fn new(ram_length: u64) -> Self {
        MachineConfig {
            ram_length,
            boot_image: Vec::new(),
            cmdline: String::new(),
            flash: Vec::new(),
            htif: HtifConfig::default(),
            interactive: false,
        }
    }

    pub fn with_boot_image(mut self, image: Vec<u8>) -> Self {
        self.boot_image = image;
        self
    }

    pub fn load_boot_image(mut self, path: &Path) -> Result<Self, MachineError> {
        self.boot_image = fs::read(path)
            .map_err(|source| MachineError::Backing { path: path.to_path_buf(), source })?;
        Ok(self)
    }
}
