//! AT command layer: command strings, reply parsing and the command channel.

pub mod channel;
pub mod commands;

pub use channel::AtChannel;
pub use commands::{UpdateRequest, extract_version, version_prefix};
