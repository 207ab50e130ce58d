//! Catalogue of supported u-blox short range modules.
//!
//! Firmware releases are laid out per module:
//!
//! ```text
//! <firmware root>/
//! └── NINA-W15X/
//!     └── NINA-W15X-3.1.0/
//!         ├── NINA-W15X-CF-1.0.json
//!         ├── NINA-W15X-SW-3.1.0-041.bin
//!         └── NINA-W15X-SW-3.1.0-041.sig.txt
//! ```

use crate::error::{Error, Result};
use crate::firmware::{DEFAULT_FLASHING_BAUD, DEFAULT_OPERATING_BAUD};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Module product family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModuleFamily {
    /// NINA series, updated over the AT UART with `AT+UFWUPD`.
    Nina,
    /// NORA series.
    Nora,
}

/// Supported module types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UbloxModule {
    /// NINA-B22X (Bluetooth LE).
    NinaB22x,
    /// NINA-W13X (Wi-Fi).
    NinaW13x,
    /// NINA-W15X (Wi-Fi + Bluetooth).
    NinaW15x,
    /// NORA-W36X (Wi-Fi + Bluetooth LE).
    NoraW36x,
}

impl UbloxModule {
    /// Every known module.
    pub const ALL: [Self; 4] = [Self::NinaB22x, Self::NinaW13x, Self::NinaW15x, Self::NoraW36x];

    /// Look up a module by name, ignoring case.
    pub fn from_name(name: &str) -> Option<Self> {
        match name
            .trim()
            .to_ascii_uppercase()
            .as_str()
        {
            "NINA-B22X" => Some(Self::NinaB22x),
            "NINA-W13X" => Some(Self::NinaW13x),
            "NINA-W15X" => Some(Self::NinaW15x),
            "NORA-W36X" => Some(Self::NoraW36x),
            _ => None,
        }
    }

    /// Product name as used in firmware release directories.
    pub const fn name(self) -> &'static str {
        match self {
            Self::NinaB22x => "NINA-B22X",
            Self::NinaW13x => "NINA-W13X",
            Self::NinaW15x => "NINA-W15X",
            Self::NoraW36x => "NORA-W36X",
        }
    }

    /// Product family.
    pub const fn family(self) -> ModuleFamily {
        match self {
            Self::NoraW36x => ModuleFamily::Nora,
            _ => ModuleFamily::Nina,
        }
    }

    /// Whether `AT+UFWUPD` over the AT UART is supported.
    pub const fn supports_serial_update(self) -> bool {
        matches!(self.family(), ModuleFamily::Nina)
    }

    /// Fail with [`Error::Unsupported`] unless this module can be updated.
    pub fn ensure_serial_update(self) -> Result<()> {
        if self.supports_serial_update() {
            Ok(())
        } else {
            Err(Error::Unsupported(format!(
                "{self} cannot be updated over the AT interface"
            )))
        }
    }

    /// Baud rate the module runs at out of the box.
    pub const fn default_operating_baud(self) -> u32 {
        DEFAULT_OPERATING_BAUD
    }

    /// Baud rate used for image transfers unless configured otherwise.
    pub const fn default_flashing_baud(self) -> u32 {
        DEFAULT_FLASHING_BAUD
    }

    /// Manifest of release `fw_version` below `firmware_root`.
    pub fn manifest_path(self, firmware_root: &Path, fw_version: &str) -> PathBuf {
        let name = self.name();
        firmware_root
            .join(name)
            .join(format!("{name}-{fw_version}"))
            .join(format!("{name}-CF-1.0.json"))
    }
}

impl fmt::Display for UbloxModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for UbloxModule {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_name(s).ok_or_else(|| {
            let known: Vec<_> = Self::ALL
                .iter()
                .map(|m| m.name())
                .collect();
            Error::Config(format!(
                "unsupported module {s:?}, expected one of {}",
                known.join(", ")
            ))
        })
    }
}
