//! Interactive serial port selection.
//!
//! Supports:
//! - Auto-detection of u-blox evaluation kits by USB vendor ID
//! - Interactive selection via dialoguer
//! - Remembering selected ports in the local configuration
//! - Non-interactive mode for CI/CD

use {
    crate::{CliError, config::Config},
    anyhow::Result,
    console::style,
    dialoguer::{Confirm, Error as DialoguerError, Select, theme::ColorfulTheme},
    log::{debug, info},
    std::{cmp::Ordering, io::IsTerminal},
    ubxflash::{NativePortEnumerator, PortEnumerator, PortInfo},
};

/// USB vendors found on u-blox EVKs and adapter boards.
const KNOWN_VENDORS: &[(u16, &str)] = &[
    (0x1546, "u-blox"),
    (0x0403, "FTDI"),
    (0x10C4, "Silicon Labs CP210x"),
];

/// Options for serial port selection.
#[derive(Debug, Clone, Default)]
pub struct SerialOptions {
    /// Explicit port specified via CLI or configuration.
    pub port: Option<String>,
    /// Non-interactive mode (fail if the choice is ambiguous).
    pub non_interactive: bool,
}

/// Result of port selection.
pub struct SelectedPort {
    /// The selected port.
    pub port: PortInfo,
    /// Whether the port was chosen automatically or by the user from a list.
    pub detected: bool,
}

fn usage_err(message: &str) -> anyhow::Error {
    CliError::Usage(message.to_string()).into()
}

/// Name of the vendor of a known adapter.
fn known_vendor(port: &PortInfo) -> Option<&'static str> {
    let vid = port.vid?;
    KNOWN_VENDORS
        .iter()
        .find(|(known, _)| *known == vid)
        .map(|(_, name)| *name)
}

fn placeholder(name: &str) -> PortInfo {
    PortInfo {
        name: name.to_string(),
        vid: None,
        pid: None,
        manufacturer: None,
        product: None,
        serial_number: None,
    }
}

/// Select a serial port interactively or automatically.
pub fn select_serial_port(options: &SerialOptions) -> Result<SelectedPort> {
    if let Some(port_name) = &options.port {
        debug!("Using port {port_name}");
        return Ok(SelectedPort {
            port: placeholder(port_name),
            detected: false,
        });
    }

    let ports = NativePortEnumerator::list_ports()?;
    pick_port(ports, options.non_interactive)
}

fn pick_port(ports: Vec<PortInfo>, non_interactive: bool) -> Result<SelectedPort> {
    if ports.is_empty() {
        return Err(usage_err("No serial ports found, pass one with --port"));
    }

    let known: Vec<PortInfo> = ports
        .iter()
        .filter(|p| known_vendor(p).is_some())
        .cloned()
        .collect();
    let candidates = if known.is_empty() { ports } else { known };

    if non_interactive {
        return select_non_interactive_port(candidates);
    }

    match candidates
        .len()
        .cmp(&1)
    {
        Ordering::Greater => {
            ensure_interactive_terminal()?;
            select_port_interactive(candidates)
        },
        Ordering::Equal => {
            let Some(port) = candidates
                .into_iter()
                .next()
            else {
                return Err(usage_err("No serial ports available"));
            };
            if let Some(vendor) = known_vendor(&port) {
                info!("Auto-selected port: {} [{vendor}]", port.name);
                Ok(SelectedPort {
                    port,
                    detected: true,
                })
            } else {
                ensure_interactive_terminal()?;
                confirm_single_port(port)
            }
        },
        Ordering::Less => Err(usage_err("No serial ports available")),
    }
}

fn select_non_interactive_port(candidates: Vec<PortInfo>) -> Result<SelectedPort> {
    let count = candidates.len();
    let mut candidates = candidates.into_iter();
    match (candidates.next(), count) {
        (Some(port), 1) => Ok(SelectedPort {
            port,
            detected: true,
        }),
        (None, _) => Err(usage_err("No serial ports available")),
        _ => Err(usage_err(&format!(
            "{count} serial ports found, pass one with --port in non-interactive mode"
        ))),
    }
}

fn ensure_interactive_terminal() -> Result<()> {
    if std::io::stdin().is_terminal() && std::io::stderr().is_terminal() {
        Ok(())
    } else {
        Err(usage_err(
            "Port selection needs an interactive terminal, pass --port instead",
        ))
    }
}

fn map_prompt_error(err: DialoguerError) -> anyhow::Error {
    match err {
        DialoguerError::IO(io_err) => {
            if io_err.kind() == std::io::ErrorKind::Interrupted {
                CliError::Cancelled("Port selection cancelled".to_string()).into()
            } else {
                usage_err(&format!("Prompt failed: {io_err}"))
            }
        },
    }
}

fn describe(port: &PortInfo) -> String {
    let vendor = match (known_vendor(port), port.vid, port.pid) {
        (Some(vendor), _, _) => format!(" [{}]", style(vendor).yellow()),
        (None, Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
        _ => String::new(),
    };
    let product = port
        .product
        .as_ref()
        .map(|p| format!(" - {}", style(p).dim()))
        .unwrap_or_default();
    format!("{}{vendor}{product}", port.name)
}

/// Interactive port selection.
fn select_port_interactive(ports: Vec<PortInfo>) -> Result<SelectedPort> {
    eprintln!(
        "{} Detected {} serial ports",
        style("ℹ").blue(),
        ports.len()
    );

    let term_width = console::Term::stderr()
        .size()
        .1 as usize;
    let max_item_width = term_width.saturating_sub(4);
    let labels: Vec<String> = ports
        .iter()
        .map(|p| console::truncate_str(&describe(p), max_item_width, "\u{2026}").into_owned())
        .collect();

    let selection = Select::with_theme(&ColorfulTheme::default())
        .with_prompt("Select the port of the module")
        .items(&labels)
        .default(0)
        .interact_opt()
        .map_err(map_prompt_error)?;

    match selection {
        Some(index) => {
            let port = ports
                .into_iter()
                .nth(index)
                .ok_or_else(|| anyhow::anyhow!("Invalid port index: {index}"))?;
            Ok(SelectedPort {
                port,
                detected: true,
            })
        },
        None => Err(CliError::Cancelled("Port selection cancelled".to_string()).into()),
    }
}

/// Confirm use of a single unrecognized port.
fn confirm_single_port(port: PortInfo) -> Result<SelectedPort> {
    let confirmed = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Use {}?", describe(&port)))
        .default(true)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if confirmed {
        Ok(SelectedPort {
            port,
            detected: true,
        })
    } else {
        Err(CliError::Cancelled("Port selection cancelled".to_string()).into())
    }
}

/// Offer to store an auto-detected port in `./ubxflash.toml`.
pub fn ask_remember_port(port: &PortInfo, config: &mut Config) -> Result<()> {
    if !std::io::stdin().is_terminal() || !std::io::stderr().is_terminal() {
        return Ok(());
    }

    let remember = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(format!("Remember {} for this directory?", port.name))
        .default(false)
        .interact_opt()
        .map_err(map_prompt_error)?
        .unwrap_or(false);

    if remember {
        config.remember_port(&port.name)?;
    }
    Ok(())
}
