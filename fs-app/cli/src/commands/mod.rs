//! Subcommands of the `fshandle` tool

pub mod stress;
