//! PATH checks for the external tools the suite shells out to.

use which::which;

use iotsuite_core::{Error, Result};

/// Executables an analysis run may invoke: one emulator per supported
/// architecture plus the string-extraction and fuzzy-hash tools.
pub const REQUIRED_EXECUTABLES: &[&str] = &[
    "qemu-system-arm",
    "qemu-system-mips",
    "qemu-system-mipsel",
    "qemu-system-m68k",
    "qemu-system-ppc",
    "qemu-system-i386",
    "qemu-system-x86_64",
    "strings",
    "ssdeep",
];

/// Verifies that every required executable is present on the search
/// path, failing with the first missing name.
pub fn check_required_executables() -> Result<()> {
    check_executables(REQUIRED_EXECUTABLES)
}

fn check_executables(names: &[&str]) -> Result<()> {
    for name in names {
        which(name).map_err(|_| Error::MissingExecutable((*name).to_string()))?;
    }
    Ok(())
}
