//! Firmware update state machine.
//!
//! One [`Updater::run`] drives a module through the whole update:
//!
//! ```text
//! Connect ─► QueryPreVersion ─► [Renegotiate] ─► UpdateCommand ─► Transfer
//!                                                                    │
//! Done ◄─ [RestoreBaudRate] ◄─ QueryPostVersion ◄─ AwaitRestart ◄────┘
//! ```
//!
//! Bracketed stages only run when the operating and flashing baud rates
//! differ. Every failure ends the run; the error carries the stage it
//! happened in (see [`Error::stage`](crate::Error::stage)) and the port is
//! closed on the way out.

mod session;

pub use session::DeviceSession;

use crate::at::commands::{self, OK, POWER_OFF, PROBE, UPDATE_MODE_XMODEM, UpdateRequest};
use crate::at::version_prefix;
use crate::cancel::CancelToken;
use crate::error::Result;
use crate::firmware::FirmwareDescriptor;
use crate::port::{Port, PortOpener, SerialConfig};
use crate::protocol::xmodem::{
    TransferProgress, TransferSummary, XmodemConfig, XmodemTransfer, wait_for_ready,
};
use log::{debug, info, warn};
use std::fmt;
use std::thread;
use std::time::Duration;

/// Poll interval while scanning for the readiness marker.
const READY_POLL: Duration = Duration::from_millis(100);

/// Lines a module prints right after the port is opened.
pub const DEFAULT_CONNECT_LINES: usize = 2;

/// Per-read serial timeout used by update runs.
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(2);

/// Stages of an update run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UpdateStage {
    /// Open the port at the operating baud rate.
    Connect,
    /// Read the installed firmware version.
    QueryPreVersion,
    /// Move module and host to the flashing baud rate.
    Renegotiate,
    /// Send `AT+UFWUPD` and wait for the readiness marker.
    UpdateCommand,
    /// Stream the image with XMODEM.
    Transfer,
    /// Wait for the module to reboot into the new firmware.
    AwaitRestart,
    /// Read the firmware version after the update.
    QueryPostVersion,
    /// Move module and host back to the operating baud rate.
    RestoreBaudRate,
    /// Close the connection.
    Done,
}

impl fmt::Display for UpdateStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Connect => "connect",
            Self::QueryPreVersion => "version query",
            Self::Renegotiate => "baud rate switch",
            Self::UpdateCommand => "update request",
            Self::Transfer => "image transfer",
            Self::AwaitRestart => "restart",
            Self::QueryPostVersion => "post-update version query",
            Self::RestoreBaudRate => "baud rate restore",
            Self::Done => "disconnect",
        };
        f.write_str(name)
    }
}

/// Notification sent to the observer of an update run.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateEvent {
    /// A stage is starting.
    Stage(UpdateStage),
    /// A block was acknowledged.
    Transfer(TransferProgress),
    /// The image transfer completed.
    TransferComplete(TransferSummary),
}

/// Upper bounds for every composite wait of a run.
#[derive(Debug, Clone)]
pub struct UpdateTimeouts {
    /// Reply to an ordinary AT command.
    pub response: Duration,
    /// Readiness marker after `AT+UFWUPD`.
    pub readiness: Duration,
    /// Startup banner after the transfer.
    pub restart: Duration,
    /// Pause between `AT+CPWROFF` and reopening the port.
    pub reboot_delay: Duration,
}

impl Default for UpdateTimeouts {
    fn default() -> Self {
        Self {
            response: Duration::from_secs(10),
            readiness: Duration::from_secs(30),
            restart: Duration::from_secs(120),
            reboot_delay: Duration::from_secs(1),
        }
    }
}

/// Settings of an update run that do not come from the firmware.
#[derive(Debug, Clone)]
pub struct UpdateOptions {
    /// Port name, per-read timeout and framing. The baud rate is taken from
    /// the descriptor.
    pub serial: SerialConfig,
    /// Composite wait limits.
    pub timeouts: UpdateTimeouts,
    /// Transfer settings.
    pub xmodem: XmodemConfig,
    /// Switch back to the operating baud rate after an upgrade.
    pub restore_operating_baud: bool,
    /// Lines to drop after every (re)open.
    pub connect_lines: usize,
}

impl UpdateOptions {
    /// Defaults for the module on `port_name`.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            serial: SerialConfig::new(port_name, crate::firmware::DEFAULT_OPERATING_BAUD)
                .with_timeout(DEFAULT_READ_TIMEOUT),
            timeouts: UpdateTimeouts::default(),
            xmodem: XmodemConfig::default(),
            restore_operating_baud: true,
            connect_lines: DEFAULT_CONNECT_LINES,
        }
    }

    /// Set the wait limits.
    #[must_use]
    pub fn with_timeouts(mut self, timeouts: UpdateTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set the transfer settings.
    #[must_use]
    pub fn with_xmodem(mut self, xmodem: XmodemConfig) -> Self {
        self.xmodem = xmodem;
        self
    }

    /// Enable or disable the baud rate restore after an upgrade.
    #[must_use]
    pub fn with_restore_operating_baud(mut self, restore: bool) -> Self {
        self.restore_operating_baud = restore;
        self
    }
}

/// Outcome of a successful run.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateReport {
    /// Version reported before the update.
    pub pre_version: String,
    /// Version reported after the update.
    pub post_version: String,
    /// Transfer statistics.
    pub transfer: TransferSummary,
    /// The link was moved to the flashing baud rate.
    pub renegotiated: bool,
    /// The link was moved back to the operating baud rate.
    pub baud_restored: bool,
    /// Baud rate the module is left at.
    pub final_baud: u32,
}

impl UpdateReport {
    /// Whether the reported version changed.
    pub fn version_changed(&self) -> bool {
        self.pre_version != self.post_version
    }
}

/// Whether the installed version differs from the image's version.
///
/// Only the leading dotted numbers are compared, so `3.1.0-041` and `3.1.0`
/// are the same release.
pub fn is_upgrade(installed: &str, target: &str) -> bool {
    let installed = version_prefix(installed).unwrap_or(installed);
    let target = version_prefix(target).unwrap_or(target);
    installed != target
}

/// Read the firmware version of the module at `options.serial`.
pub fn query_firmware_version<O: PortOpener>(opener: O, options: UpdateOptions) -> Result<String> {
    Updater::new(opener, options).query_version()
}

/// Drives firmware updates of one module.
pub struct Updater<O: PortOpener> {
    opener: O,
    options: UpdateOptions,
    cancel: CancelToken,
}

impl<O: PortOpener> Updater<O> {
    /// Create an updater opening ports through `opener`.
    pub fn new(opener: O, options: UpdateOptions) -> Self {
        Self {
            opener,
            options,
            cancel: CancelToken::default(),
        }
    }

    /// Abort waits and transfers once `cancel` fires.
    #[must_use]
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Settings of this updater.
    pub fn options(&self) -> &UpdateOptions {
        &self.options
    }

    /// Get a reference to the port opener.
    pub fn opener(&self) -> &O {
        &self.opener
    }

    /// Consume the updater and return the port opener.
    pub fn into_opener(self) -> O {
        self.opener
    }

    /// Open a session at `baud_rate`.
    pub fn connect(&mut self, baud_rate: u32) -> Result<DeviceSession<O::Port>> {
        DeviceSession::open(
            &mut self.opener,
            &self.options.serial,
            baud_rate,
            self.options.connect_lines,
            self.options.timeouts.response,
            &self.cancel,
        )
    }

    /// Connect at the configured baud rate and read the firmware version.
    pub fn query_version(&mut self) -> Result<String> {
        let baud_rate = self
            .options
            .serial
            .baud_rate;
        let mut session = self.connect(baud_rate)?;
        let version = session.query_version(
            self.options
                .timeouts
                .response,
        )?;
        session.close()?;
        Ok(version)
    }

    /// Update the module with `firmware`.
    ///
    /// `observer` receives stage changes and transfer progress.
    pub fn run<F>(&mut self, firmware: &FirmwareDescriptor, mut observer: F) -> Result<UpdateReport>
    where
        F: FnMut(UpdateEvent),
    {
        if !firmware.size_matches() {
            warn!(
                "Declared size {} differs from image length {}",
                firmware.size,
                firmware
                    .image
                    .len()
            );
        }
        let response = self
            .options
            .timeouts
            .response;

        enter(&mut observer, UpdateStage::Connect);
        let mut session = self
            .connect(firmware.operating_baud)
            .map_err(|e| e.in_stage(UpdateStage::Connect))?;

        enter(&mut observer, UpdateStage::QueryPreVersion);
        let pre_version = session
            .query_version(response)
            .map_err(|e| e.in_stage(UpdateStage::QueryPreVersion))?;
        info!("Installed firmware: {pre_version}");

        let renegotiated = firmware.needs_renegotiation();
        if renegotiated {
            enter(&mut observer, UpdateStage::Renegotiate);
            self.switch_baud_rate(&mut session, firmware.flashing_baud)
                .map_err(|e| e.in_stage(UpdateStage::Renegotiate))?;
        }

        enter(&mut observer, UpdateStage::UpdateCommand);
        self.request_update(&mut session, firmware)
            .map_err(|e| e.in_stage(UpdateStage::UpdateCommand))?;

        enter(&mut observer, UpdateStage::Transfer);
        let transfer = self
            .transfer(&mut session, firmware, &mut observer)
            .map_err(|e| e.in_stage(UpdateStage::Transfer))?;
        info!(
            "Transferred {} bytes in {:.1} s ({:.0} B/s)",
            transfer.bytes,
            transfer
                .elapsed
                .as_secs_f64(),
            transfer.throughput()
        );
        observer(UpdateEvent::TransferComplete(transfer.clone()));

        enter(&mut observer, UpdateStage::AwaitRestart);
        session
            .channel_mut()
            .wait_for_startup(
                self.options
                    .timeouts
                    .restart,
            )
            .map_err(|e| e.in_stage(UpdateStage::AwaitRestart))?;

        enter(&mut observer, UpdateStage::QueryPostVersion);
        let post_version = session
            .query_version(response)
            .map_err(|e| e.in_stage(UpdateStage::QueryPostVersion))?;
        info!("Running firmware: {post_version}");

        let restore = self
            .options
            .restore_operating_baud
            && renegotiated
            && is_upgrade(&pre_version, &firmware.version);
        if restore {
            enter(&mut observer, UpdateStage::RestoreBaudRate);
            self.switch_baud_rate(&mut session, firmware.operating_baud)
                .map_err(|e| e.in_stage(UpdateStage::RestoreBaudRate))?;
        } else if renegotiated {
            info!(
                "Module stays at {} baud",
                session.baud_rate()
            );
        }

        enter(&mut observer, UpdateStage::Done);
        let final_baud = session.baud_rate();
        session
            .close()
            .map_err(|e| e.in_stage(UpdateStage::Done))?;

        Ok(UpdateReport {
            pre_version,
            post_version,
            transfer,
            renegotiated,
            baud_restored: restore,
            final_baud,
        })
    }

    /// Change the baud rate on both sides.
    ///
    /// The module stores the new rate and applies it after a reboot, so the
    /// host reopens the port at `target` and probes the link. There is no
    /// fallback to the previous rate.
    fn switch_baud_rate(&mut self, session: &mut DeviceSession<O::Port>, target: u32) -> Result<()> {
        let timeouts = &self
            .options
            .timeouts;
        info!("Changing baud rate {} -> {target}", session.baud_rate());

        let channel = session.channel_mut();
        channel.command(&commands::set_uart(target), OK, timeouts.response)?;
        channel.command(POWER_OFF, OK, timeouts.response)?;
        thread::sleep(timeouts.reboot_delay);
        self.cancel
            .check()?;

        session.reopen(
            &mut self.opener,
            &self.options.serial,
            target,
            self.options.connect_lines,
            timeouts.response,
        )?;
        session
            .channel_mut()
            .command(PROBE, OK, timeouts.response)?;
        debug!("Link alive at {target} baud");
        Ok(())
    }

    fn request_update(
        &self,
        session: &mut DeviceSession<O::Port>,
        firmware: &FirmwareDescriptor,
    ) -> Result<()> {
        let request = UpdateRequest {
            mode: UPDATE_MODE_XMODEM,
            baud_rate: session.baud_rate(),
            id: firmware.id,
            size: firmware.size,
            signature: &firmware.signature,
            version: &firmware.version,
            flags: &firmware.permissions,
        };
        let channel = session.channel_mut();
        channel.send_command(&commands::firmware_update(&request))?;
        wait_for_ready(
            channel.port_mut(),
            READY_POLL,
            self.options
                .timeouts
                .readiness,
            &self.cancel,
        )
    }

    fn transfer<F>(
        &self,
        session: &mut DeviceSession<O::Port>,
        firmware: &FirmwareDescriptor,
        observer: &mut F,
    ) -> Result<TransferSummary>
    where
        F: FnMut(UpdateEvent),
    {
        session.set_transfer_in_progress(true);
        let port = session
            .channel_mut()
            .port_mut();
        let summary = XmodemTransfer::with_config(
            &mut *port,
            self.options
                .xmodem
                .clone(),
        )
        .with_cancel(
            self.cancel
                .clone(),
        )
        .send(&firmware.image, |progress| {
            observer(UpdateEvent::Transfer(progress.clone()));
        })?;
        session.set_transfer_in_progress(false);

        // Byte reads change the port timeout; line reads expect the default.
        session
            .channel_mut()
            .port_mut()
            .set_timeout(
                self.options
                    .serial
                    .timeout,
            )?;
        Ok(summary)
    }
}

fn enter<F: FnMut(UpdateEvent)>(observer: &mut F, stage: UpdateStage) {
    debug!("Stage: {stage}");
    observer(UpdateEvent::Stage(stage));
}
