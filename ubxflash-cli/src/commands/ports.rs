//! Serial port listing.

use anyhow::Result;
use console::style;
use ubxflash::{NativePortEnumerator, PortEnumerator};

/// List serial ports, one per line, or as a JSON array.
pub(crate) fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    if ports.is_empty() {
        eprintln!("{} No serial ports found", style("⚠").yellow());
        return Ok(());
    }

    for port in &ports {
        let ids = match (port.vid, port.pid) {
            (Some(vid), Some(pid)) => format!(" ({vid:04X}:{pid:04X})"),
            _ => String::new(),
        };
        let product = port
            .product
            .as_ref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();
        println!("{}{ids}{product}", style(&port.name).bold());
    }

    Ok(())
}
