//! XMODEM sender used to stream firmware images to the module.
//!
//! The module answers `AT+UFWUPD` by repeatedly emitting `'C'`, the XMODEM
//! request for CRC mode. Once three consecutive `'C'` bytes were seen the
//! image is sent block by block:
//!
//! ```text
//! Block format:
//! +---------+-----+------+--------------------+-------------+
//! | SOH/STX | SEQ | ~SEQ |  DATA (128/1024)   | CRC16 / SUM |
//! +---------+-----+------+--------------------+-------------+
//! |    1    |  1  |  1   |      128/1024      |    2 / 1    |
//! +---------+-----+------+--------------------+-------------+
//! ```
//!
//! Every block must be acknowledged before the next one is sent. A NAK,
//! silence or garbage triggers a resend of the same block, up to
//! [`XmodemConfig::max_retries`] resends; one more failure aborts the whole
//! transfer. The transfer ends with `EOT`, which must be acknowledged too.

use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::port::ByteChannel;
use crate::protocol::crc::{checksum8, crc16_xmodem};
use log::{debug, trace, warn};
use std::time::{Duration, Instant};

/// XMODEM control characters.
pub mod control {
    /// Start of Header (128-byte block).
    pub const SOH: u8 = 0x01;
    /// Start of Text (1024-byte block).
    pub const STX: u8 = 0x02;
    /// End of Transmission.
    pub const EOT: u8 = 0x04;
    /// Acknowledge.
    pub const ACK: u8 = 0x06;
    /// Not Acknowledge.
    pub const NAK: u8 = 0x15;
    /// Cancel.
    pub const CAN: u8 = 0x18;
    /// CRC mode request character, also the module's readiness marker.
    pub const C: u8 = b'C';
}

/// Number of consecutive `'C'` bytes that signal readiness.
pub const READY_MARKER_COUNT: usize = 3;

/// Payload size of a block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlockSize {
    /// Classic 128-byte blocks (`SOH`).
    #[default]
    Standard,
    /// XMODEM-1K 1024-byte blocks (`STX`).
    OneK,
}

impl BlockSize {
    /// Payload length in bytes.
    pub const fn len(self) -> usize {
        match self {
            Self::Standard => 128,
            Self::OneK => 1024,
        }
    }

    /// Header byte announcing this block size.
    pub const fn header(self) -> u8 {
        match self {
            Self::Standard => control::SOH,
            Self::OneK => control::STX,
        }
    }
}

/// Block trailer kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Checksum {
    /// Two-byte CRC-16/XMODEM, big endian (requested with `'C'`).
    #[default]
    Crc16,
    /// One-byte additive checksum (requested with `NAK`).
    Additive,
}

impl Checksum {
    /// Trailer length in bytes.
    pub const fn len(self) -> usize {
        match self {
            Self::Crc16 => 2,
            Self::Additive => 1,
        }
    }
}

/// XMODEM configuration options.
#[derive(Debug, Clone)]
pub struct XmodemConfig {
    /// Payload size of each block.
    pub block_size: BlockSize,
    /// Trailer kind.
    pub checksum: Checksum,
    /// Time to wait for the reply to a block or `EOT`.
    pub ack_timeout: Duration,
    /// Resends allowed per block before the transfer is aborted.
    pub max_retries: u32,
    /// Filler for the last, short block.
    pub pad_byte: u8,
}

impl Default for XmodemConfig {
    fn default() -> Self {
        Self {
            block_size: BlockSize::Standard,
            checksum: Checksum::Crc16,
            ack_timeout: Duration::from_millis(1000),
            max_retries: 10,
            pad_byte: 0x00,
        }
    }
}

impl XmodemConfig {
    /// Number of blocks needed for `len` bytes.
    pub fn block_count(&self, len: usize) -> usize {
        len.div_ceil(
            self.block_size
                .len(),
        )
    }
}

/// State of a running transfer, reported after each acknowledged block.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TransferProgress {
    /// Image length.
    pub total_bytes: usize,
    /// Image bytes covered by acknowledged blocks (exact, not block multiples).
    pub bytes_acked: usize,
    /// Sequence number of the current block.
    pub sequence: u8,
    /// Failed attempts for the current block.
    pub retries: u32,
    /// Block transmissions, resends included.
    pub blocks_attempted: usize,
    /// Acknowledged blocks.
    pub blocks_acked: usize,
    /// Failed transmissions (NAK, silence or garbage).
    pub blocks_failed: usize,
}

/// Outcome of a completed transfer.
#[derive(Debug, Clone, PartialEq)]
pub struct TransferSummary {
    /// Data blocks sent.
    pub blocks: usize,
    /// Image bytes transferred.
    pub bytes: usize,
    /// Resends over the whole transfer.
    pub retransmissions: usize,
    /// Time from the first block to the acknowledged `EOT`.
    pub elapsed: Duration,
}

impl TransferSummary {
    /// Average throughput in bytes per second.
    #[allow(clippy::cast_precision_loss)]
    pub fn throughput(&self) -> f64 {
        let secs = self
            .elapsed
            .as_secs_f64();
        if secs > 0.0 {
            self.bytes as f64 / secs
        } else {
            0.0
        }
    }
}

/// Counts consecutive readiness markers in a byte stream.
#[derive(Debug, Clone)]
pub struct ReadinessDetector {
    required: usize,
    count: usize,
}

impl Default for ReadinessDetector {
    fn default() -> Self {
        Self::new(READY_MARKER_COUNT)
    }
}

impl ReadinessDetector {
    /// Detector that fires after `required` consecutive `'C'` bytes.
    pub fn new(required: usize) -> Self {
        Self {
            required: required.max(1),
            count: 0,
        }
    }

    /// Feed one byte; returns `true` when it completes the marker sequence.
    pub fn feed(&mut self, byte: u8) -> bool {
        if byte == control::C {
            self.count += 1;
            if self.count >= self.required {
                self.count = 0;
                return true;
            }
        } else {
            self.count = 0;
        }
        false
    }

    /// Markers seen so far in the current run.
    pub fn count(&self) -> usize {
        self.count
    }
}

/// Block until the receiver signals readiness with three consecutive `'C'`.
///
/// Anything received after the marker is discarded so that a late `'C'` is
/// not mistaken for the answer to the first block.
pub fn wait_for_ready<C: ByteChannel + ?Sized>(
    channel: &mut C,
    poll: Duration,
    timeout: Duration,
    cancel: &CancelToken,
) -> Result<()> {
    debug!("Waiting for receiver readiness...");
    let start = Instant::now();
    let mut detector = ReadinessDetector::default();

    while start.elapsed() < timeout {
        cancel.check()?;
        match channel.read_byte(poll)? {
            Some(byte) => {
                trace!("Readiness scan: 0x{byte:02X}");
                if detector.feed(byte) {
                    debug!("Receiver ready after {:?}", start.elapsed());
                    channel.discard_input()?;
                    return Ok(());
                }
            },
            None => {},
        }
    }

    Err(Error::Timeout(format!(
        "no readiness marker after {} s",
        timeout.as_secs_f32()
    )))
}

enum Reply {
    Ack,
    Nak,
    Cancel,
    Silence,
    Other(u8),
}

/// XMODEM transfer handler.
pub struct XmodemTransfer<'a, C: ByteChannel + ?Sized> {
    channel: &'a mut C,
    config: XmodemConfig,
    cancel: CancelToken,
}

impl<'a, C: ByteChannel + ?Sized> XmodemTransfer<'a, C> {
    /// Create a new XMODEM transfer handler.
    pub fn new(channel: &'a mut C) -> Self {
        Self::with_config(channel, XmodemConfig::default())
    }

    /// Create a new XMODEM transfer handler with custom configuration.
    pub fn with_config(channel: &'a mut C, config: XmodemConfig) -> Self {
        Self {
            channel,
            config,
            cancel: CancelToken::default(),
        }
    }

    /// Abort between blocks once `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Build one framed block. `data` longer than the block is truncated.
    pub fn build_block(seq: u8, data: &[u8], config: &XmodemConfig) -> Vec<u8> {
        let block_size = config
            .block_size
            .len();
        let mut block = Vec::with_capacity(
            3 + block_size
                + config
                    .checksum
                    .len(),
        );

        block.push(
            config
                .block_size
                .header(),
        );
        block.push(seq);
        block.push(!seq);

        let payload = &data[..data
            .len()
            .min(block_size)];
        block.extend_from_slice(payload);
        block.resize(3 + block_size, config.pad_byte);

        match config.checksum {
            Checksum::Crc16 => {
                let crc = crc16_xmodem(&block[3..]);
                block.extend_from_slice(&crc.to_be_bytes());
            },
            Checksum::Additive => {
                let sum = checksum8(&block[3..]);
                block.push(sum);
            },
        }

        block
    }

    /// Read the receiver's answer, skipping stray `'C'` bytes.
    fn read_reply(&mut self) -> Result<Reply> {
        let deadline = Instant::now() + self.config.ack_timeout;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(Reply::Silence);
            }

            match self
                .channel
                .read_byte(self.config.ack_timeout)?
            {
                None => return Ok(Reply::Silence),
                Some(control::ACK) => return Ok(Reply::Ack),
                Some(control::NAK) => return Ok(Reply::Nak),
                Some(control::C) => {
                    trace!("Ignoring stray 'C'");
                },
                Some(control::CAN) => {
                    // A single CAN may be line noise; two in a row is a cancel.
                    return match self
                        .channel
                        .read_byte(self.config.ack_timeout)?
                    {
                        Some(control::CAN) => Ok(Reply::Cancel),
                        Some(other) => Ok(Reply::Other(other)),
                        None => Ok(Reply::Other(control::CAN)),
                    };
                },
                Some(other) => return Ok(Reply::Other(other)),
            }
        }
    }

    /// Best-effort notification to the receiver that the transfer is over.
    fn abort(&mut self) {
        if let Err(e) = self
            .channel
            .write_bytes(&[control::CAN, control::CAN])
        {
            debug!("Failed to send CAN: {e}");
        }
    }

    /// Send a block and wait for ACK, resending on failure.
    fn send_block(&mut self, block: &[u8], progress: &mut TransferProgress) -> Result<()> {
        progress.retries = 0;

        loop {
            if let Err(e) = self
                .cancel
                .check()
            {
                self.abort();
                return Err(e);
            }

            trace!(
                "Sending block {} (attempt {})",
                progress.sequence,
                progress.retries + 1
            );
            self.channel
                .write_bytes(block)?;
            progress.blocks_attempted += 1;

            match self.read_reply()? {
                Reply::Ack => {
                    trace!("Block {} ACKed", progress.sequence);
                    return Ok(());
                },
                Reply::Nak => {
                    debug!("Block {} NAKed", progress.sequence);
                },
                Reply::Silence => {
                    debug!("Timeout waiting for ACK of block {}", progress.sequence);
                },
                Reply::Other(c) => {
                    debug!(
                        "Unexpected reply 0x{c:02X} to block {}",
                        progress.sequence
                    );
                },
                Reply::Cancel => {
                    return Err(Error::Protocol("transfer cancelled by receiver".into()));
                },
            }

            progress.blocks_failed += 1;
            progress.retries += 1;
            if progress.retries > self.config.max_retries {
                self.abort();
                return Err(Error::Protocol(format!(
                    "block {} rejected {} times",
                    progress.sequence, progress.retries
                )));
            }
        }
    }

    /// Send `EOT` until it is acknowledged.
    fn send_eot(&mut self) -> Result<()> {
        debug!("Sending EOT");

        for attempt in 0..=self.config.max_retries {
            self.channel
                .write_bytes(&[control::EOT])?;

            match self.read_reply()? {
                Reply::Ack => {
                    debug!("EOT ACKed");
                    return Ok(());
                },
                Reply::Cancel => {
                    return Err(Error::Protocol("receiver cancelled at EOT".into()));
                },
                // Receivers commonly NAK the first EOT to confirm it
                Reply::Nak | Reply::Silence | Reply::Other(_) => {
                    trace!("EOT not acknowledged (attempt {})", attempt + 1);
                },
            }
        }

        self.abort();
        Err(Error::Protocol(format!(
            "EOT not acknowledged after {} attempts",
            self.config.max_retries + 1
        )))
    }

    /// Transfer `data`, reporting progress after every acknowledged block.
    ///
    /// The receiver must already have signalled readiness, see
    /// [`wait_for_ready`].
    pub fn send<F>(&mut self, data: &[u8], mut progress: F) -> Result<TransferSummary>
    where
        F: FnMut(&TransferProgress),
    {
        let block_size = self
            .config
            .block_size
            .len();
        debug!(
            "Starting XMODEM transfer: {} bytes in {} blocks of {}",
            data.len(),
            self.config
                .block_count(data.len()),
            block_size
        );

        let mut state = TransferProgress {
            total_bytes: data.len(),
            sequence: 1,
            ..TransferProgress::default()
        };
        let start = Instant::now();

        for chunk in data.chunks(block_size) {
            let block = Self::build_block(state.sequence, chunk, &self.config);
            self.send_block(&block, &mut state)?;

            state.blocks_acked += 1;
            state.bytes_acked += chunk.len();
            progress(&state);

            state.sequence = state
                .sequence
                .wrapping_add(1);
        }

        self.send_eot()?;

        let summary = TransferSummary {
            blocks: state.blocks_acked,
            bytes: state.bytes_acked,
            retransmissions: state.blocks_failed,
            elapsed: start.elapsed(),
        };
        if summary.retransmissions > 0 {
            warn!(
                "Transfer needed {} retransmissions",
                summary.retransmissions
            );
        }
        debug!("XMODEM transfer complete in {:?}", summary.elapsed);
        Ok(summary)
    }
}
