//! Port abstraction for serial communication with the radio module.
//!
//! The protocol layers never touch `serialport` directly. They are written
//! against the [`Port`] trait (AT command channel) or the narrower
//! [`ByteChannel`] capability (packetized transfer), so they can be driven by
//! an in-memory device in tests.
//!
//! ```text
//! +------------------+     +------------------+
//! |  Command Channel |     | XMODEM transfer  |
//! +--------+---------+     +--------+---------+
//!          |                        |
//!          v                        v
//! +--------+---------+     +--------+---------+
//! |    Port trait    |---->|   ByteChannel    |
//! +--------+---------+     +------------------+
//!          |
//!          v
//! +--------+---------+
//! | Native SerialPort|
//! |   (serialport)   |
//! +------------------+
//! ```
//!
//! Changing the baud rate of a u-blox module requires a reboot, after which
//! the host side is closed and reopened at the new rate. [`PortOpener`] is the
//! factory the update orchestrator uses for that cycle.
//!
//! ## Example
//!
//! ```rust,no_run
//! use ubxflash::port::{Port, SerialConfig};
//!
//! fn example<P: Port>(port: &mut P) -> std::io::Result<()> {
//!     port.write_all(b"AT\r")?;
//!
//!     let mut buf = [0u8; 32];
//!     let n = port.read(&mut buf)?;
//!     println!("Received: {:?}", &buf[..n]);
//!
//!     Ok(())
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use crate::error::{Error, Result};

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Timeout of a single read or write call.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: 115200,
            timeout: Duration::from_millis(1000),
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and baud rate.
    pub fn new(port_name: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port_name: port_name.into(),
            baud_rate,
            ..Default::default()
        }
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Set the baud rate.
    #[must_use]
    pub fn with_baud_rate(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the flow control mode.
    #[must_use]
    pub fn with_flow_control(mut self, flow_control: FlowControl) -> Self {
        self.flow_control = flow_control;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
}

/// Serial port information.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct PortInfo {
    /// Port name/path.
    pub name: String,
    /// USB vendor ID (if available).
    pub vid: Option<u16>,
    /// USB product ID (if available).
    pub pid: Option<u16>,
    /// Manufacturer string (if available).
    pub manufacturer: Option<String>,
    /// Product string (if available).
    pub product: Option<String>,
    /// Serial number (if available).
    pub serial_number: Option<String>,
}

/// Unified port trait for serial communication.
pub trait Port: Read + Write + Send {
    /// Set the read/write timeout.
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;

    /// Get the current timeout.
    fn timeout(&self) -> Duration;

    /// Clear input/output buffers.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Factory for ports, used to reopen the link at a different baud rate.
pub trait PortOpener {
    /// Port type produced by this opener.
    type Port: Port;

    /// Open a port with the given configuration.
    fn open(&mut self, config: &SerialConfig) -> Result<Self::Port>;
}

/// Trait for listing available serial ports.
///
/// This is separated from `Port` because it's a static operation that
/// doesn't require an open port instance.
pub trait PortEnumerator {
    /// List all available serial ports.
    fn list_ports() -> Result<Vec<PortInfo>>;
}

/// Minimal byte-level capability needed by the packetized transfer.
pub trait ByteChannel {
    /// Read one byte, waiting at most `timeout`. `Ok(None)` means silence.
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>>;

    /// Write `buf` in full and flush, returning the number of bytes written.
    fn write_bytes(&mut self, buf: &[u8]) -> Result<usize>;

    /// Drop anything already received. Default: no-op.
    fn discard_input(&mut self) -> Result<()> {
        Ok(())
    }
}

impl<P: Port> ByteChannel for P {
    fn read_byte(&mut self, timeout: Duration) -> Result<Option<u8>> {
        if self.timeout() != timeout {
            self.set_timeout(timeout)?;
        }
        let mut buf = [0u8; 1];
        match self.read(&mut buf) {
            Ok(1) => Ok(Some(buf[0])),
            Ok(_) => Ok(None),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(None)
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    fn write_bytes(&mut self, buf: &[u8]) -> Result<usize> {
        self.write_all_bytes(buf)?;
        Ok(buf.len())
    }

    fn discard_input(&mut self) -> Result<()> {
        self.clear_buffers()
    }
}

// Re-export the native implementation
#[cfg(feature = "native")]
pub use native::{NativePort, NativePortEnumerator, NativePortOpener};

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::VecDeque;

    struct LoopPort {
        rx: VecDeque<u8>,
        tx: Vec<u8>,
        timeout: Duration,
        timeout_changes: usize,
    }

    impl Read for LoopPort {
        fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
            match self.rx.pop_front() {
                Some(b) => {
                    buf[0] = b;
                    Ok(1)
                },
                None => Err(std::io::Error::new(ErrorKind::TimedOut, "no data")),
            }
        }
    }

    impl Write for LoopPort {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.tx.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl Port for LoopPort {
        fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
            self.timeout = timeout;
            self.timeout_changes += 1;
            Ok(())
        }

        fn timeout(&self) -> Duration {
            self.timeout
        }

        fn clear_buffers(&mut self) -> Result<()> {
            self.rx.clear();
            Ok(())
        }

        fn name(&self) -> &str {
            "loop"
        }

        fn close(&mut self) -> Result<()> {
            Ok(())
        }
    }

    fn loop_port(rx: &[u8]) -> LoopPort {
        LoopPort {
            rx: rx.iter().copied().collect(),
            tx: Vec::new(),
            timeout: Duration::from_secs(1),
            timeout_changes: 0,
        }
    }

    #[test]
    fn test_serial_config_builder() {
        let config = SerialConfig::new("/dev/ttyUSB0", 115200)
            .with_timeout(Duration::from_secs(2))
            .with_baud_rate(921600)
            .with_flow_control(FlowControl::Hardware);

        assert_eq!(config.port_name, "/dev/ttyUSB0");
        assert_eq!(config.baud_rate, 921600);
        assert_eq!(config.timeout, Duration::from_secs(2));
        assert_eq!(config.flow_control, FlowControl::Hardware);
        assert_eq!(config.data_bits, DataBits::Eight);
    }

    #[test]
    fn test_byte_channel_reads_then_reports_silence() {
        let mut port = loop_port(&[0x06]);
        let timeout = Duration::from_secs(1);

        assert_eq!(port.read_byte(timeout).unwrap(), Some(0x06));
        assert_eq!(port.read_byte(timeout).unwrap(), None);
        assert_eq!(port.timeout_changes, 0);
    }

    #[test]
    fn test_byte_channel_applies_new_timeout_once() {
        let mut port = loop_port(&[1, 2]);
        let short = Duration::from_millis(100);

        port.read_byte(short).unwrap();
        port.read_byte(short).unwrap();
        assert_eq!(port.timeout_changes, 1);
        assert_eq!(port.timeout(), short);
    }

    #[test]
    fn test_byte_channel_write_and_discard() {
        let mut port = loop_port(b"CCC");
        assert_eq!(port.write_bytes(b"\x04").unwrap(), 1);
        assert_eq!(port.tx, vec![0x04]);

        port.discard_input().unwrap();
        assert_eq!(port.read_byte(Duration::from_secs(1)).unwrap(), None);
    }
}
