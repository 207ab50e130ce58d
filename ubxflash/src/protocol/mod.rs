//! Protocol implementations.

pub mod crc;
pub mod xmodem;

// Re-export common types
pub use xmodem::{
    BlockSize, Checksum, ReadinessDetector, TransferProgress, TransferSummary, XmodemConfig,
    XmodemTransfer, wait_for_ready,
};
