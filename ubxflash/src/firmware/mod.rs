//! Firmware image metadata consumed by the updater.

pub mod manifest;

pub use manifest::{Manifest, ManifestEntry};

/// Default operating baud rate of u-blox short range modules.
pub const DEFAULT_OPERATING_BAUD: u32 = 115_200;

/// Default baud rate used while the image is transferred.
pub const DEFAULT_FLASHING_BAUD: u32 = 921_600;

/// Everything needed to request and perform one firmware update.
///
/// `size` is what the module is told to expect. It should equal
/// `image.len()`; a mismatch is only caught by the module during the transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FirmwareDescriptor {
    /// Numeric image identifier.
    pub id: u32,
    /// Declared image size in bytes.
    pub size: usize,
    /// Image bytes.
    pub image: Vec<u8>,
    /// Signature passed to `AT+UFWUPD`.
    pub signature: String,
    /// Permission flags passed to `AT+UFWUPD`.
    pub permissions: String,
    /// Human-readable version of the image.
    pub version: String,
    /// Rate the module runs at outside of updates.
    pub operating_baud: u32,
    /// Rate used while the image is transferred.
    pub flashing_baud: u32,
}

impl FirmwareDescriptor {
    /// Describe `image`; the declared size is the image length.
    pub fn new(
        id: u32,
        image: Vec<u8>,
        signature: impl Into<String>,
        permissions: impl Into<String>,
        version: impl Into<String>,
    ) -> Self {
        Self {
            id,
            size: image.len(),
            image,
            signature: signature.into(),
            permissions: permissions.into(),
            version: version.into(),
            operating_baud: DEFAULT_OPERATING_BAUD,
            flashing_baud: DEFAULT_FLASHING_BAUD,
        }
    }

    /// Override the declared size.
    #[must_use]
    pub fn with_declared_size(mut self, size: usize) -> Self {
        self.size = size;
        self
    }

    /// Set the operating and flashing baud rates.
    #[must_use]
    pub fn with_baud_rates(mut self, operating: u32, flashing: u32) -> Self {
        self.operating_baud = operating;
        self.flashing_baud = flashing;
        self
    }

    /// Whether the declared size matches the image length.
    pub fn size_matches(&self) -> bool {
        self.size
            == self
                .image
                .len()
    }

    /// Whether the update needs a baud rate switch.
    pub fn needs_renegotiation(&self) -> bool {
        self.operating_baud != self.flashing_baud
    }
}
