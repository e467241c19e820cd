//! CLI subcommands.

pub mod resolve;
pub mod serve;
pub mod status;
