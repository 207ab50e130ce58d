//! # ubxflash
//!
//! A library for updating the firmware of u-blox short range radio modules
//! (NINA series) over their AT command UART.
//!
//! The crate provides:
//!
//! - An AT command channel with bounded request/response matching
//! - An XMODEM sender with per-block retransmission
//! - The update state machine (`AT+UFWUPD`, transfer, restart, verification)
//! - Baud rate renegotiation around the transfer
//! - Firmware manifest loading
//!
//! ## Features
//!
//! - `native` (default): serial ports via the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use ubxflash::{Manifest, NativePortOpener, UbloxModule, UpdateOptions, Updater};
//! use std::path::Path;
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let module = UbloxModule::NinaW15x;
//!     let manifest = Manifest::from_file(module.manifest_path(Path::new("Firmwares"), "3.1.0"))?;
//!     let firmware = manifest.load_descriptor(0)?;
//!
//!     let mut updater = Updater::new(NativePortOpener, UpdateOptions::new("/dev/ttyUSB0"));
//!     let report = updater.run(&firmware, |event| println!("{event:?}"))?;
//!     println!("{} -> {}", report.pre_version, report.post_version);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod at;
pub mod cancel;
pub mod error;
pub mod firmware;
pub mod module;
pub mod port;
pub mod protocol;
pub mod updater;

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator, NativePortOpener};
pub use {
    at::AtChannel,
    cancel::CancelToken,
    error::{Error, ErrorKind, Result},
    firmware::{FirmwareDescriptor, Manifest, ManifestEntry},
    module::{ModuleFamily, UbloxModule},
    port::{ByteChannel, Port, PortEnumerator, PortInfo, PortOpener, SerialConfig},
    protocol::{TransferProgress, TransferSummary, XmodemConfig},
    updater::{
        DeviceSession, UpdateEvent, UpdateOptions, UpdateReport, UpdateStage, UpdateTimeouts,
        Updater, query_firmware_version,
    },
};
