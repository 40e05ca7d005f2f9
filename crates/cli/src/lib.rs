//! Command implementations behind the `tradegate` binary.

pub mod commands;
