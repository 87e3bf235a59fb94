//! Core types for the iotsuite malware analysis sandbox.
//!
//! This crate holds the pieces shared by the sandbox controller and its
//! surrounding tooling: the [`Arch`] enum with its emulator profiles,
//! the [`SandboxConfig`] value, the [`Error`] enum, and plain result
//! types. The controller itself lives in the `iotsuite` crate.

pub mod arch;
pub mod config;
pub mod error;
pub mod types;

pub use arch::Arch;
pub use config::{DEFAULT_MACADDR, DEFAULT_NIC_HELPER, SandboxConfig};
pub use error::{Error, Result};
pub use types::{CmdResult, StringOffset};
