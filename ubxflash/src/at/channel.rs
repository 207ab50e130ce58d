//! Request/response matching over the module's AT UART.
//!
//! The module does not echo commands and may print unsolicited text (boot
//! banners, readiness markers) at any time, so replies are matched by
//! scanning everything received for the expected result code or `ERROR`.
//! Each scan is bounded by an explicit timeout and the channel's
//! [`CancelToken`]; a single read is bounded by the port timeout.

use crate::at::commands::{self, ERROR, STARTUP_MARKER};
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::port::Port;
use log::{debug, trace};
use std::io::ErrorKind;
use std::thread;
use std::time::{Duration, Instant};

/// Size of a single raw read.
const READ_CHUNK: usize = 64;

/// Longest run of bytes without a newline kept as one line.
pub const MAX_LINE: usize = 1024;

/// Command channel wrapping an open port.
pub struct AtChannel<P: Port> {
    port: P,
    cancel: CancelToken,
    pending: Vec<u8>,
    last_command: Option<String>,
}

impl<P: Port> AtChannel<P> {
    /// Wrap an open port.
    pub fn new(port: P) -> Self {
        Self {
            port,
            cancel: CancelToken::default(),
            pending: Vec::new(),
            last_command: None,
        }
    }

    /// Check `cancel` between reads of every wait.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Cancellation token observed by this channel.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Get a mutable reference to the underlying port.
    ///
    /// Bytes already buffered by [`read_line`](Self::read_line) are dropped.
    pub fn port_mut(&mut self) -> &mut P {
        self.pending
            .clear();
        &mut self.port
    }

    /// Consume the channel and return the underlying port.
    pub fn into_port(self) -> P {
        self.port
    }

    /// Swap in a freshly opened port, returning the old one.
    pub fn replace_port(&mut self, port: P) -> P {
        self.pending
            .clear();
        std::mem::replace(&mut self.port, port)
    }

    /// Close the underlying port.
    pub fn close(&mut self) -> Result<()> {
        self.pending
            .clear();
        self.port
            .close()
    }

    /// Write `command` terminated by a carriage return.
    pub fn send_command(&mut self, command: &str) -> Result<()> {
        debug!("-> {command}");
        let mut line = Vec::with_capacity(command.len() + 1);
        line.extend_from_slice(command.as_bytes());
        line.push(b'\r');
        self.port
            .write_all_bytes(&line)?;
        self.last_command = Some(command.to_string());
        Ok(())
    }

    /// One raw read. An empty result means the port timed out.
    fn read_chunk(&mut self) -> Result<Vec<u8>> {
        let mut buf = [0u8; READ_CHUNK];
        match self
            .port
            .read(&mut buf)
        {
            Ok(n) => Ok(buf[..n].to_vec()),
            Err(e) if e.kind() == ErrorKind::TimedOut || e.kind() == ErrorKind::WouldBlock => {
                Ok(Vec::new())
            },
            Err(e) => Err(Error::Io(e)),
        }
    }

    /// Read up to the next newline, until the port goes quiet, or until
    /// `timeout` has passed.
    ///
    /// Surrounding whitespace is stripped; an empty string means nothing
    /// arrived within one port timeout. A run of more than [`MAX_LINE`]
    /// bytes without a newline is returned as a line of its own.
    pub fn read_line(&mut self, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(pos) = self
                .pending
                .iter()
                .position(|&b| b == b'\n')
            {
                let line: Vec<u8> = self
                    .pending
                    .drain(..=pos)
                    .collect();
                return Ok(Self::decode_line(&line));
            }
            if self.pending.len() >= MAX_LINE || Instant::now() >= deadline {
                let line = std::mem::take(&mut self.pending);
                return Ok(Self::decode_line(&line));
            }

            let chunk = self.read_chunk()?;
            if chunk.is_empty() {
                let line = std::mem::take(&mut self.pending);
                return Ok(Self::decode_line(&line));
            }
            self.pending
                .extend_from_slice(&chunk);
        }
    }

    fn decode_line(raw: &[u8]) -> String {
        let line = String::from_utf8_lossy(raw)
            .trim()
            .to_string();
        if !line.is_empty() {
            debug!("<- {line}");
        }
        line
    }

    /// Read and drop `count` lines (e.g. the empty lines printed on connect).
    ///
    /// Fails with [`Error::Timeout`] when the lines keep coming for longer
    /// than `timeout`.
    pub fn discard_lines(&mut self, count: usize, timeout: Duration) -> Result<()> {
        let start = Instant::now();
        for _ in 0..count {
            self.cancel
                .check()?;
            let remaining = timeout.saturating_sub(start.elapsed());
            if remaining.is_zero() {
                return Err(Error::Timeout(format!(
                    "connect output did not settle within {timeout:?}"
                )));
            }
            let line = self.read_line(remaining)?;
            trace!("Discarded line: {line:?}");
        }
        Ok(())
    }

    /// Collect lines until `expected` or `ERROR` shows up.
    ///
    /// Lines are joined with `\n`. `ERROR` wins when both are present.
    pub fn wait_for_response(&mut self, expected: &str, timeout: Duration) -> Result<String> {
        let start = Instant::now();
        let mut response = String::new();

        loop {
            self.cancel
                .check()?;

            let line = self.read_line(timeout.saturating_sub(start.elapsed()))?;
            if !line.is_empty() {
                if !response.is_empty() {
                    response.push('\n');
                }
                response.push_str(&line);
                Self::keep_tail(&mut response);
            }

            if response.contains(ERROR) {
                return Err(Error::Device {
                    command: self
                        .last_command
                        .clone()
                        .unwrap_or_default(),
                    response,
                });
            }
            if response.contains(expected) {
                return Ok(response);
            }

            if start.elapsed() >= timeout {
                return Err(Error::Timeout(format!(
                    "no `{expected}` within {:?} after `{}`",
                    timeout,
                    self.last_command
                        .as_deref()
                        .unwrap_or_default()
                )));
            }
        }
    }

    /// Drop the front of an oversized response, keeping the last
    /// [`MAX_LINE`] bytes.
    fn keep_tail(response: &mut String) {
        if response.len() <= 4 * MAX_LINE {
            return;
        }
        let mut cut = response.len() - MAX_LINE;
        while !response.is_char_boundary(cut) {
            cut += 1;
        }
        response.drain(..cut);
    }

    /// Send `command` and wait for `expected` in the reply.
    pub fn command(&mut self, command: &str, expected: &str, timeout: Duration) -> Result<String> {
        self.send_command(command)?;
        self.wait_for_response(expected, timeout)
    }

    /// Wait for the startup banner and return it from the marker onwards.
    ///
    /// Raw reads are scanned instead of lines because the banner is not
    /// necessarily preceded by a line break.
    pub fn wait_for_startup(&mut self, timeout: Duration) -> Result<String> {
        debug!("Waiting for {STARTUP_MARKER}...");
        let start = Instant::now();
        let marker = STARTUP_MARKER.as_bytes();
        let mut seen = std::mem::take(&mut self.pending);

        loop {
            if let Some(pos) = seen
                .windows(marker.len())
                .position(|w| w == marker)
            {
                let banner = String::from_utf8_lossy(&seen[pos..])
                    .trim_end()
                    .to_string();
                debug!("<- {banner}");
                return Ok(banner);
            }

            self.cancel
                .check()?;
            if start.elapsed() >= timeout {
                return Err(Error::Timeout(format!(
                    "no {STARTUP_MARKER} within {timeout:?}"
                )));
            }

            let chunk = self.read_chunk()?;
            trace!("Startup scan: {} bytes", chunk.len());
            seen.extend_from_slice(&chunk);
            let excess = seen
                .len()
                .saturating_sub(MAX_LINE + marker.len());
            seen.drain(..excess);
        }
    }

    /// Leave data mode: guard time, `+++`, guard time.
    pub fn enter_command_mode(&mut self, guard_time: Duration) -> Result<()> {
        debug!("Entering command mode");
        thread::sleep(guard_time);
        self.port
            .write_all_bytes(commands::ESCAPE_SEQUENCE.as_bytes())?;
        thread::sleep(guard_time);
        Ok(())
    }

    /// Resume transparent data mode.
    pub fn enter_data_mode(&mut self, timeout: Duration) -> Result<String> {
        self.command(commands::DATA_MODE, commands::OK, timeout)
    }

    /// Restore factory settings and wait until the module rebooted.
    pub fn factory_reset(&mut self, timeout: Duration, startup_timeout: Duration) -> Result<String> {
        self.command(commands::FACTORY_RESET, commands::OK, timeout)?;
        self.command(commands::POWER_OFF, commands::OK, timeout)?;
        self.wait_for_startup(startup_timeout)
    }
}
