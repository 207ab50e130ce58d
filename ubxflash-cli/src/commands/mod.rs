//! Command implementations.
//!
//! Each subcommand is implemented in its own module.

pub(crate) mod completions;
pub(crate) mod ports;
pub(crate) mod update;
pub(crate) mod version;
