//! ubxflash CLI - Command-line tool for updating u-blox radio modules.
//!
//! ## Features
//!
//! - Firmware update over the AT command UART (`AT+UFWUPD` + XMODEM)
//! - Automatic baud rate switch around the image transfer
//! - Firmware version query
//! - Interactive serial port selection
//! - TOML and legacy `KEY=VALUE` configuration files
//! - Shell completion generation

use anyhow::Result;
use clap::{Parser, Subcommand};
use clap_complete::Shell;
use console::style;
use env_logger::Env;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};
use thiserror::Error;
use ubxflash::{CancelToken, ErrorKind};

mod commands;
mod config;
mod serial;

use config::{Config, LegacyConfig};
use serial::{SerialOptions, ask_remember_port, select_serial_port};

/// Name of the installed binary.
pub(crate) const BIN_NAME: &str = "ubxflash";

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl+C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if emoji/animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether Ctrl+C was pressed.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// Failures that originate in the CLI itself rather than in the library.
#[derive(Debug, Error)]
pub(crate) enum CliError {
    /// Bad invocation; maps to exit code 2.
    #[error("{0}")]
    Usage(String),
    /// Missing or invalid configuration; maps to exit code 3.
    #[error("{0}")]
    Config(String),
    /// Interrupted by the user; maps to exit code 130.
    #[error("{0}")]
    Cancelled(String),
}

/// ubxflash - Serial firmware updater for u-blox short range radio modules.
///
/// Environment variables:
///   UBXFLASH_PORT              - Serial port of the module
///   UBXFLASH_BAUD              - Operating baud rate (default: 115200)
///   UBXFLASH_FLASH_BAUD        - Transfer baud rate (default: 921600)
///   UBXFLASH_MODULE            - Module type (NINA-B22X, NINA-W13X, NINA-W15X)
///   UBXFLASH_FW_VERSION        - Firmware release to install
///   UBXFLASH_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "ubxflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    ubxflash --port /dev/ttyUSB0 update --module NINA-W15X --fw-version 3.1.0\n  \
    ubxflash --legacy-config config.txt update\n  \
    ubxflash --port COM3 version")]
pub(crate) struct Cli {
    /// Serial port of the module.
    #[arg(short, long, global = true, env = "UBXFLASH_PORT")]
    pub port: Option<String>,

    /// Baud rate the module operates at.
    #[arg(short, long, global = true, env = "UBXFLASH_BAUD")]
    pub baud: Option<u32>,

    /// Increase verbosity (-v debug, -vv trace).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Only print warnings and errors.
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Never prompt; fail when a choice is ambiguous.
    #[arg(long, global = true, env = "UBXFLASH_NON_INTERACTIVE")]
    pub non_interactive: bool,

    /// Use this TOML configuration file instead of the default locations.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    /// Read MODULE, FW_VERSION, COMPORT and BAUDRATE from a KEY=VALUE file.
    #[arg(long, global = true, value_name = "PATH")]
    pub legacy_config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Install a firmware release on the module.
    Update(commands::update::UpdateArgs),

    /// Print the firmware version reported by the module.
    Version,

    /// List available serial ports.
    ListPorts {
        /// Print the ports as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completions.
    Completions {
        /// Shell to generate completions for.
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install the completions for the detected (or given) shell.
        #[arg(long)]
        install: bool,
    },
}

fn main() -> ExitCode {
    match run() {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!(
                "{} {err:#}",
                style("Error:")
                    .red()
                    .bold()
            );
            ExitCode::from(exit_code(&err))
        },
    }
}

fn run() -> Result<()> {
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "ubxflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    let cancel = CancelToken::new();
    {
        let cancel = cancel.clone();
        if let Err(e) = ctrlc::set_handler(move || {
            INTERRUPTED.store(true, Ordering::Relaxed);
            cancel.cancel();
        }) {
            debug!("Could not install Ctrl+C handler: {e}");
        }
    }

    let mut config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };
    if let Some(ref path) = cli.legacy_config {
        let legacy =
            LegacyConfig::from_file(path).map_err(|e| CliError::Config(format!("{e:#}")))?;
        config.apply_legacy(legacy);
    }

    match &cli.command {
        Commands::Update(args) => {
            commands::update::cmd_update(&cli, args, &mut config, &cancel)?;
        },
        Commands::Version => {
            commands::version::cmd_version(&cli, &mut config, &cancel)?;
        },
        Commands::ListPorts { json } => {
            commands::ports::cmd_list_ports(*json)?;
        },
        Commands::Completions { shell, install } => {
            if *install {
                commands::completions::cmd_completions_install(*shell)?;
            } else {
                let shell = shell.ok_or_else(|| {
                    CliError::Usage(
                        "Specify a shell type, e.g.: ubxflash completions bash \
                         (or use --install to auto-install)"
                            .to_string(),
                    )
                })?;
                commands::completions::cmd_completions(shell);
            }
        },
    }

    Ok(())
}

/// Resolve the port from CLI, environment, configuration or detection.
pub(crate) fn get_port(cli: &Cli, config: &mut Config) -> Result<String> {
    let options = SerialOptions {
        port: cli
            .port
            .clone()
            .or_else(|| {
                config
                    .connection
                    .port
                    .clone()
            }),
        non_interactive: cli.non_interactive,
    };

    let selected = select_serial_port(&options)?;
    if selected.detected && !cli.non_interactive {
        ask_remember_port(&selected.port, config)?;
    }

    Ok(selected
        .port
        .name)
}

/// Operating baud rate from CLI, environment or configuration.
pub(crate) fn operating_baud(cli: &Cli, config: &Config, default: u32) -> u32 {
    cli.baud
        .or(config
            .connection
            .baud)
        .unwrap_or(default)
}

/// Map an error to the process exit code.
///
/// 2 usage, 3 configuration, 4 device or link, 130 cancelled, 1 anything else.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }
    if let Some(lib_err) = err.downcast_ref::<ubxflash::Error>() {
        return match lib_err.kind() {
            ErrorKind::Config => 3,
            ErrorKind::Cancelled => 130,
            ErrorKind::Transport | ErrorKind::Device | ErrorKind::Protocol | ErrorKind::Timeout => 4,
        };
    }
    if was_interrupted() {
        return 130;
    }
    1
}
