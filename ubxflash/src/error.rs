//! Error types for ubxflash.

use crate::updater::UpdateStage;
use std::io;
use thiserror::Error;

/// Result type for ubxflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for ubxflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed firmware manifest.
    #[error("Invalid manifest: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration error (missing port, manifest, signature file...).
    #[error("Configuration error: {0}")]
    Config(String),

    /// Unsupported module or operation.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// The module answered a command with `ERROR`.
    #[error("Module rejected `{command}`: {response}")]
    Device {
        /// Command that was rejected.
        command: String,
        /// Everything received up to and including the error marker.
        response: String,
    },

    /// Transfer protocol failure.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The module stayed silent for longer than allowed.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// The operation was cancelled by the caller.
    #[error("Operation cancelled")]
    Cancelled,

    /// A firmware update stage failed.
    #[error("{stage} failed: {source}")]
    Stage {
        /// Stage that was running when the failure happened.
        stage: UpdateStage,
        /// Underlying error.
        #[source]
        source: Box<Error>,
    },
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Invalid or missing configuration; no device I/O happened.
    Config,
    /// Port open/read/write failure.
    Transport,
    /// The module reported `ERROR`.
    Device,
    /// Transfer aborted or unexpected protocol byte.
    Protocol,
    /// The module did not answer in time.
    Timeout,
    /// Cancelled by the caller.
    Cancelled,
}

impl Error {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::Io(e) if e.kind() == io::ErrorKind::TimedOut => ErrorKind::Timeout,
            Self::Io(_) => ErrorKind::Transport,
            #[cfg(feature = "native")]
            Self::Serial(_) => ErrorKind::Transport,
            Self::Json(_) | Self::Config(_) | Self::Unsupported(_) => ErrorKind::Config,
            Self::Device { .. } => ErrorKind::Device,
            Self::Protocol(_) => ErrorKind::Protocol,
            Self::Timeout(_) => ErrorKind::Timeout,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Stage { source, .. } => source.kind(),
        }
    }

    /// Stage that failed, if this error came out of an update run.
    pub fn stage(&self) -> Option<UpdateStage> {
        match self {
            Self::Stage { stage, .. } => Some(*stage),
            _ => None,
        }
    }

    pub(crate) fn in_stage(self, stage: UpdateStage) -> Self {
        match self {
            Self::Stage { .. } => self,
            other => Self::Stage {
                stage,
                source: Box::new(other),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_unwraps_stage() {
        let err = Error::Timeout("no banner".into()).in_stage(UpdateStage::AwaitRestart);
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(err.stage(), Some(UpdateStage::AwaitRestart));
    }

    #[test]
    fn test_in_stage_keeps_innermost_stage() {
        let err = Error::Protocol("retries".into())
            .in_stage(UpdateStage::Transfer)
            .in_stage(UpdateStage::Done);
        assert_eq!(err.stage(), Some(UpdateStage::Transfer));
    }

    #[test]
    fn test_io_timeout_is_timeout_kind() {
        let err = Error::Io(io::Error::new(io::ErrorKind::TimedOut, "slow"));
        assert_eq!(err.kind(), ErrorKind::Timeout);
        let err = Error::Io(io::Error::new(io::ErrorKind::BrokenPipe, "gone"));
        assert_eq!(err.kind(), ErrorKind::Transport);
    }

    #[test]
    fn test_device_error_message_names_command() {
        let err = Error::Device {
            command: "AT+UMRS=921600,1,8,1,1,0".into(),
            response: "ERROR".into(),
        };
        assert!(err.to_string().contains("AT+UMRS"));
        assert_eq!(err.kind(), ErrorKind::Device);
    }
}
