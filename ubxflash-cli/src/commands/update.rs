//! Firmware update command.

use anyhow::{Context, Result};
use clap::Args;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};
use log::info;
use std::path::{Path, PathBuf};
use ubxflash::{
    CancelToken, FirmwareDescriptor, Manifest, NativePortOpener, UbloxModule, UpdateEvent,
    UpdateOptions, UpdateReport, UpdateStage, Updater,
};

use crate::config::Config;
use crate::{Cli, CliError, get_port, operating_baud, use_fancy_output};

/// Default root of the firmware releases.
const DEFAULT_FIRMWARE_DIR: &str = "Firmwares";

/// Arguments of `ubxflash update`.
#[derive(Args, Debug)]
pub(crate) struct UpdateArgs {
    /// Module type (e.g., NINA-W15X).
    #[arg(short, long, env = "UBXFLASH_MODULE")]
    pub module: Option<String>,

    /// Firmware release to install (e.g., 3.1.0).
    #[arg(long, env = "UBXFLASH_FW_VERSION")]
    pub fw_version: Option<String>,

    /// Baud rate used for the image transfer.
    #[arg(long, env = "UBXFLASH_FLASH_BAUD")]
    pub flash_baud: Option<u32>,

    /// Root directory of the firmware releases.
    #[arg(long, value_name = "DIR")]
    pub firmware_dir: Option<PathBuf>,

    /// Use this manifest instead of the one derived from module and release.
    #[arg(long, value_name = "PATH")]
    pub manifest: Option<PathBuf>,

    /// Leave the module at the transfer baud rate after the update.
    #[arg(long)]
    pub no_restore_baud: bool,
}

/// Everything needed for a run, validated before the port is touched.
#[derive(Debug)]
struct UpdatePlan {
    module: UbloxModule,
    manifest_path: PathBuf,
    operating_baud: u32,
    flashing_baud: u32,
    restore_baud: bool,
}

impl UpdatePlan {
    fn resolve(cli: &Cli, args: &UpdateArgs, config: &Config) -> Result<Self> {
        let module_name = args
            .module
            .as_deref()
            .or(config
                .update
                .module
                .as_deref())
            .ok_or_else(|| CliError::Config("No module type given, pass --module".to_string()))?;
        let module: UbloxModule = module_name.parse()?;
        module.ensure_serial_update()?;

        let manifest_path = if let Some(path) = &args.manifest {
            path.clone()
        } else {
            let fw_version = args
                .fw_version
                .as_deref()
                .or(config
                    .update
                    .fw_version
                    .as_deref())
                .ok_or_else(|| {
                    CliError::Config("No firmware release given, pass --fw-version".to_string())
                })?;
            let root = args
                .firmware_dir
                .as_deref()
                .or(config
                    .update
                    .firmware_dir
                    .as_deref())
                .unwrap_or(Path::new(DEFAULT_FIRMWARE_DIR));
            module.manifest_path(root, fw_version)
        };

        Ok(Self {
            module,
            manifest_path,
            operating_baud: operating_baud(cli, config, module.default_operating_baud()),
            flashing_baud: args
                .flash_baud
                .or(config
                    .update
                    .flash_baud)
                .unwrap_or(module.default_flashing_baud()),
            restore_baud: !args.no_restore_baud
                && config
                    .update
                    .restore_baud
                    .unwrap_or(true),
        })
    }

    fn load_firmware(&self) -> Result<FirmwareDescriptor> {
        let manifest = Manifest::from_file(&self.manifest_path)?;
        let firmware = manifest
            .load_descriptor(0)?
            .with_baud_rates(self.operating_baud, self.flashing_baud);
        Ok(firmware)
    }
}

fn progress_bar(cli: &Cli, total: usize) -> ProgressBar {
    if cli.quiet || !use_fancy_output() {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(total as u64);
    let style = ProgressStyle::default_bar()
        .template(
            "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}) {msg}",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("#>-");
    pb.set_style(style);
    pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
    pb
}

/// Update command implementation.
pub(crate) fn cmd_update(
    cli: &Cli,
    args: &UpdateArgs,
    config: &mut Config,
    cancel: &CancelToken,
) -> Result<()> {
    let plan = UpdatePlan::resolve(cli, args, config)?;
    let firmware = plan
        .load_firmware()
        .with_context(|| format!("Failed to load {}", plan.manifest_path.display()))?;

    if !cli.quiet {
        eprintln!(
            "{} {} firmware {} ({} bytes)",
            style("📦").cyan(),
            plan.module,
            style(&firmware.version).bold(),
            firmware.size
        );
    }

    let port = get_port(cli, config)?;
    let options = UpdateOptions::new(port).with_restore_operating_baud(plan.restore_baud);
    let mut updater = Updater::new(NativePortOpener, options).with_cancel(cancel.clone());

    let pb = progress_bar(cli, firmware.image.len());
    let report = updater
        .run(&firmware, |event| match event {
            UpdateEvent::Stage(UpdateStage::Transfer) => pb.set_message("transferring"),
            UpdateEvent::Stage(stage) => {
                info!("Stage: {stage}");
            },
            UpdateEvent::Transfer(progress) => pb.set_position(progress.bytes_acked as u64),
            UpdateEvent::TransferComplete(_) => pb.finish_with_message("done"),
        })
        .context("Firmware update failed");
    if !pb.is_finished() {
        pb.abandon();
    }

    print_report(cli, &report?);
    Ok(())
}

fn print_report(cli: &Cli, report: &UpdateReport) {
    if cli.quiet {
        return;
    }
    eprintln!(
        "{} Updated {} -> {}",
        style("✓")
            .green()
            .bold(),
        report.pre_version,
        style(&report.post_version).bold()
    );
    eprintln!(
        "  {} blocks, {} retransmissions, {:.1} KiB/s",
        report
            .transfer
            .blocks,
        report
            .transfer
            .retransmissions,
        report
            .transfer
            .throughput()
            / 1024.0
    );
    if report.renegotiated && !report.baud_restored {
        eprintln!(
            "  {} module left at {} baud",
            style("note:").yellow(),
            report.final_baud
        );
    }
    if !report.version_changed() {
        eprintln!(
            "  {} version unchanged",
            style("note:").yellow()
        );
    }
}
