//! Firmware version query.

use anyhow::{Context, Result};
use ubxflash::{CancelToken, NativePortOpener, UpdateOptions, Updater};

use crate::config::Config;
use crate::{Cli, get_port, operating_baud};

/// Print the version reported by `ATI9` to stdout.
pub(crate) fn cmd_version(cli: &Cli, config: &mut Config, cancel: &CancelToken) -> Result<()> {
    let port = get_port(cli, config)?;
    let baud_rate = operating_baud(cli, config, ubxflash::firmware::DEFAULT_OPERATING_BAUD);

    let mut options = UpdateOptions::new(port);
    options.serial = options
        .serial
        .with_baud_rate(baud_rate);

    let version = Updater::new(NativePortOpener, options)
        .with_cancel(cancel.clone())
        .query_version()
        .context("Failed to read the firmware version")?;

    println!("{version}");
    Ok(())
}
