//! u-blox firmware manifest (`<MODULE>-CF-1.0.json`).
//!
//! A firmware release ships as a directory holding the image, a signature
//! text file and a JSON manifest describing them:
//!
//! ```json
//! [
//!   {
//!     "Id": "0x00000001",
//!     "Size": "0x000C8000",
//!     "File": "NINA-W15X-SW-3.1.0-041.bin",
//!     "SignatureFile": "NINA-W15X-SW-3.1.0-041.sig.txt",
//!     "Version": "3.1.0-041",
//!     "Permissions": "0"
//!   }
//! ]
//! ```
//!
//! File names are relative to the manifest's directory.

use crate::error::{Error, Result};
use crate::firmware::FirmwareDescriptor;
use log::{debug, warn};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// One image record of a manifest.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct ManifestEntry {
    /// Image identifier, hexadecimal.
    pub id: String,
    /// Image size, hexadecimal.
    pub size: String,
    /// Image file name.
    pub file: String,
    /// Signature file name.
    pub signature_file: String,
    /// Firmware version name.
    pub version: String,
    /// Permission flags.
    pub permissions: String,
}

impl ManifestEntry {
    /// Parsed image identifier.
    pub fn id_value(&self) -> Result<u32> {
        let value = parse_hex(&self.id)?;
        u32::try_from(value)
            .map_err(|_| Error::Config(format!("image id {} does not fit 32 bits", self.id)))
    }

    /// Parsed image size.
    pub fn size_value(&self) -> Result<usize> {
        let value = parse_hex(&self.size)?;
        usize::try_from(value)
            .map_err(|_| Error::Config(format!("image size {} too large", self.size)))
    }
}

/// Parse a hexadecimal field with optional `0x` prefix.
pub fn parse_hex(text: &str) -> Result<u64> {
    let digits = text.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);
    u64::from_str_radix(digits, 16)
        .map_err(|e| Error::Config(format!("invalid hex value {text:?}: {e}")))
}

/// Parsed firmware manifest.
#[derive(Debug, Clone)]
pub struct Manifest {
    /// Image records.
    pub entries: Vec<ManifestEntry>,
    /// Directory the file names are relative to.
    base_dir: PathBuf,
}

impl Manifest {
    /// Load a manifest from a file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading manifest from: {}", path.display());

        let content = fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("cannot read manifest {}: {e}", path.display()))
        })?;
        let base_dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();

        Self::from_json(&content, base_dir)
    }

    /// Parse a manifest whose file names are relative to `base_dir`.
    pub fn from_json(json: &str, base_dir: impl Into<PathBuf>) -> Result<Self> {
        let entries: Vec<ManifestEntry> = serde_json::from_str(json)?;
        if entries.is_empty() {
            return Err(Error::Config("manifest lists no images".into()));
        }

        Ok(Self {
            entries,
            base_dir: base_dir.into(),
        })
    }

    /// Directory the file names are relative to.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Path of the image file of `entry`.
    pub fn image_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.base_dir
            .join(&entry.file)
    }

    /// Path of the signature file of `entry`.
    pub fn signature_path(&self, entry: &ManifestEntry) -> PathBuf {
        self.base_dir
            .join(&entry.signature_file)
    }

    /// Resolve entry `index` into a descriptor, reading image and signature.
    pub fn load_descriptor(&self, index: usize) -> Result<FirmwareDescriptor> {
        let entry = self
            .entries
            .get(index)
            .ok_or_else(|| {
                Error::Config(format!(
                    "manifest has {} images, no index {index}",
                    self.entries
                        .len()
                ))
            })?;

        let id = entry.id_value()?;
        let size = entry.size_value()?;

        let signature_path = self.signature_path(entry);
        let signature = fs::read_to_string(&signature_path)
            .map_err(|e| {
                Error::Config(format!(
                    "signature file {} not found: {e}",
                    signature_path.display()
                ))
            })?
            .trim()
            .to_string();

        let image_path = self.image_path(entry);
        let image = fs::read(&image_path).map_err(|e| {
            Error::Config(format!("image file {} not found: {e}", image_path.display()))
        })?;

        if image.len() != size {
            warn!(
                "Manifest declares {size} bytes but {} has {} bytes",
                image_path.display(),
                image.len()
            );
        }
        debug!(
            "Image {} v{}: id {id}, {size} bytes",
            entry.file, entry.version
        );

        Ok(
            FirmwareDescriptor::new(id, image, signature, &entry.permissions, &entry.version)
                .with_declared_size(size),
        )
    }
}
