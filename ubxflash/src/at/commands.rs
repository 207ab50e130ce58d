//! AT command strings understood by u-blox short range modules.

/// Identity query; the reply carries the firmware version in quotes.
pub const IDENTITY_QUERY: &str = "ATI9";
/// No-op command used to check that the link is alive.
pub const PROBE: &str = "AT";
/// Reboot the module. Answered with `OK`, followed by a startup banner.
pub const POWER_OFF: &str = "AT+CPWROFF";
/// Leave command mode and resume transparent data forwarding.
pub const DATA_MODE: &str = "ATO1";
/// Restore factory settings (takes effect after a reboot).
pub const FACTORY_RESET: &str = "AT+UFACTORY";
/// Escape sequence that switches from data mode to command mode.
pub const ESCAPE_SEQUENCE: &str = "+++";
/// Marker contained in the banner printed after every boot.
pub const STARTUP_MARKER: &str = "+STARTUP";
/// Final result code of a successful command.
pub const OK: &str = "OK";
/// Final result code of a rejected command.
pub const ERROR: &str = "ERROR";

/// `AT+UFWUPD` mode selecting an XMODEM transfer over the AT UART.
pub const UPDATE_MODE_XMODEM: u8 = 0;

/// Arguments of the `AT+UFWUPD` firmware update command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UpdateRequest<'a> {
    /// Update mode, always [`UPDATE_MODE_XMODEM`] here.
    pub mode: u8,
    /// Baud rate used for the image transfer.
    pub baud_rate: u32,
    /// Numeric image identifier.
    pub id: u32,
    /// Image size in bytes.
    pub size: usize,
    /// Image signature.
    pub signature: &'a str,
    /// Firmware version name.
    pub version: &'a str,
    /// Permission flags.
    pub flags: &'a str,
}

/// `AT+UFWUPD=<mode>,<baud>,<id>,<size>,<signature>,<version>,<flags>`
pub fn firmware_update(request: &UpdateRequest<'_>) -> String {
    format!(
        "AT+UFWUPD={},{},{},{},{},{},{}",
        request.mode,
        request.baud_rate,
        request.id,
        request.size,
        request.signature,
        request.version,
        request.flags
    )
}

/// `AT+UMRS=<baud>,1,8,1,1,0`: new UART rate, applied at the next boot.
pub fn set_uart(baud_rate: u32) -> String {
    format!("AT+UMRS={baud_rate},1,8,1,1,0")
}

/// Text between the first and the last double quote of an `ATI9` reply.
pub fn extract_version(reply: &str) -> Option<&str> {
    let first = reply.find('"')?;
    let last = reply.rfind('"')?;
    (last > first).then(|| &reply[first + 1..last])
}

/// First dotted numeric version in `text`, ignoring any leading label.
///
/// `"3.1.0-041"` and `"NINA-W15X-3.1.0"` both give `"3.1.0"`. A bare number
/// is returned only when no dotted run exists.
pub fn version_prefix(text: &str) -> Option<&str> {
    let mut first = None;
    let runs = text
        .split(|c: char| !(c.is_ascii_digit() || c == '.'))
        .map(|run| run.trim_matches('.'))
        .filter(|run| !run.is_empty());
    for run in runs {
        if run.contains('.') {
            return Some(run);
        }
        first.get_or_insert(run);
    }
    first
}
