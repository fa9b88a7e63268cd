//! The `mintforge` worker: configuration, command line, webhook surface and
//! the process runtime that wires the pipeline together.

pub mod cli;
pub mod config;
pub mod runtime;
pub mod webhook;
