//! Automated dynamic analysis of IoT malware in emulated hardware
//! sandboxes.
//!
//! The suite boots an architecture-specific qemu system emulator, drives
//! its serial console through an automated login and recovers the output
//! and exit status of commands executed on the guest. Around that core
//! sit a static analyzer (digests, architecture detection, printable
//! strings), a preflight check for the external tools, and a client for
//! the guest's file-transfer service.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use iotsuite::{Arch, Sandbox, SandboxConfig};
//!
//! # fn example() -> iotsuite::Result<()> {
//! let config = SandboxConfig::new(Arch::Arm, "root", "toor", "vms/arm")
//!     .forward_port(2222, 22);
//!
//! let mut sandbox = Sandbox::new(config);
//! sandbox.noninteractive()?;
//!
//! let result = sandbox.run_cmd("ls /tmp")?;
//! println!("{} (exit {})", result.output, result.exitcode);
//!
//! sandbox.stop()?;
//! # Ok(())
//! # }
//! ```
//!
//! Each [`Sandbox`] owns one emulator subprocess for its whole lifetime
//! and is driven strictly sequentially; run independent sandboxes for
//! concurrent analyses.

mod analysis;
mod command;
mod console;
mod preflight;
mod sandbox;
mod transfer;

pub use analysis::StaticAnalyzer;
pub use command::build_command;
pub use console::Console;
pub use preflight::{REQUIRED_EXECUTABLES, check_required_executables};
pub use sandbox::{
    LOGIN_PROMPT, PASSWORD_PROMPT, ROOT_PROMPT, Sandbox, SandboxState, USER_PROMPT,
};
pub use transfer::{FtClient, Welcome};

pub use iotsuite_core::{
    Arch, CmdResult, Error, Result, SandboxConfig, StringOffset,
};
