//! Live connection to one module during an update run.

use crate::at::AtChannel;
use crate::at::commands::{IDENTITY_QUERY, OK, extract_version};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::port::{Port, PortOpener, SerialConfig};
use log::{debug, info, warn};
use std::time::Duration;

/// Connection state owned by a single update run.
///
/// The port is closed when the session is dropped, whichever way the run
/// ends.
pub struct DeviceSession<P: Port> {
    channel: AtChannel<P>,
    baud_rate: u32,
    last_version: Option<String>,
    transfer_in_progress: bool,
    closed: bool,
}

impl<P: Port> DeviceSession<P> {
    /// Open `serial.port_name` at `baud_rate` and drop the connect lines.
    ///
    /// Fails with a timeout when the connect lines do not arrive within
    /// `settle_timeout`.
    pub fn open<O>(
        opener: &mut O,
        serial: &SerialConfig,
        baud_rate: u32,
        connect_lines: usize,
        settle_timeout: Duration,
        cancel: &CancelToken,
    ) -> Result<Self>
    where
        O: PortOpener<Port = P>,
    {
        let port = Self::open_port(opener, serial, baud_rate)?;
        let mut session = Self {
            channel: AtChannel::new(port).with_cancel(cancel.clone()),
            baud_rate,
            last_version: None,
            transfer_in_progress: false,
            closed: false,
        };
        session
            .channel
            .discard_lines(connect_lines, settle_timeout)?;
        Ok(session)
    }

    fn open_port<O>(opener: &mut O, serial: &SerialConfig, baud_rate: u32) -> Result<P>
    where
        O: PortOpener<Port = P>,
    {
        let config = serial
            .clone()
            .with_baud_rate(baud_rate);
        info!("Opening {} at {baud_rate} baud", config.port_name);
        let mut port = opener.open(&config)?;
        port.clear_buffers()?;
        Ok(port)
    }

    /// Close the port, then open it again at `baud_rate`.
    ///
    /// The old handle is released before the new one is requested.
    pub fn reopen<O>(
        &mut self,
        opener: &mut O,
        serial: &SerialConfig,
        baud_rate: u32,
        connect_lines: usize,
        settle_timeout: Duration,
    ) -> Result<()>
    where
        O: PortOpener<Port = P>,
    {
        self.channel
            .close()?;
        let port = Self::open_port(opener, serial, baud_rate)?;
        drop(
            self.channel
                .replace_port(port),
        );
        self.baud_rate = baud_rate;
        self.channel
            .discard_lines(connect_lines, settle_timeout)
    }

    /// Send `ATI9` and extract the quoted firmware version.
    pub fn query_version(&mut self, timeout: Duration) -> Result<String> {
        let reply = self
            .channel
            .command(IDENTITY_QUERY, OK, timeout)?;
        let version = extract_version(&reply)
            .ok_or_else(|| Error::Protocol(format!("no quoted version in reply {reply:?}")))?
            .to_string();
        debug!("Firmware version: {version}");
        self.last_version = Some(version.clone());
        Ok(version)
    }

    /// Command channel of this session.
    pub fn channel(&self) -> &AtChannel<P> {
        &self.channel
    }

    /// Mutable command channel of this session.
    pub fn channel_mut(&mut self) -> &mut AtChannel<P> {
        &mut self.channel
    }

    /// Baud rate the port is currently open at.
    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    /// Version seen by the last successful identity query.
    pub fn last_version(&self) -> Option<&str> {
        self.last_version
            .as_deref()
    }

    /// Whether an image transfer was started and has not finished.
    pub fn transfer_in_progress(&self) -> bool {
        self.transfer_in_progress
    }

    pub(crate) fn set_transfer_in_progress(&mut self, active: bool) {
        self.transfer_in_progress = active;
    }

    /// Close the port. Further calls do nothing.
    pub fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.channel
            .close()
    }
}

impl<P: Port> Drop for DeviceSession<P> {
    fn drop(&mut self) {
        if self.transfer_in_progress {
            warn!("Connection closed during an image transfer, power-cycle the module before retrying");
        }
        if let Err(e) = self.close() {
            warn!("Failed to close port: {e}");
        }
    }
}
