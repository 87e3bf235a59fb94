//! Sandbox configuration.

use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::arch::Arch;

/// Default guest MAC address, matching the address the stock sandbox
/// images expect on their tap interface.
pub const DEFAULT_MACADDR: &str = "52:54:01:12:34:56";

/// Default location of the qemu bridge helper on most distributions.
pub const DEFAULT_NIC_HELPER: &str = "/usr/lib/qemu/qemu-bridge-helper";

/// Configuration for one sandbox VM.
///
/// Built once by the caller and read-only to the controller afterwards.
///
/// # Example
///
/// ```rust
/// use iotsuite_core::{Arch, SandboxConfig};
///
/// let config = SandboxConfig::new(Arch::Arm, "root", "toor", "vms/arm")
///     .macaddr("52:54:01:aa:bb:cc")
///     .forward_port(2222, 22);
/// assert!(config.is_root());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxConfig {
    /// Guest CPU architecture.
    pub arch: Arch,
    /// User to log in as.
    pub user: String,
    /// Password for `user`.
    pub passwd: String,
    /// Directory holding the VM kernel and root filesystem images.
    pub vm_dir: PathBuf,
    /// MAC address assigned to the guest NIC.
    pub macaddr: String,
    /// Bridge helper executable used to attach the tap device.
    pub nic_helper: PathBuf,
    /// TCP port forwards, host port to guest port.
    pub port_fwds: BTreeMap<u16, u16>,
}

impl SandboxConfig {
    /// Creates a configuration with default network settings.
    pub fn new(
        arch: Arch,
        user: impl Into<String>,
        passwd: impl Into<String>,
        vm_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            arch,
            user: user.into(),
            passwd: passwd.into(),
            vm_dir: vm_dir.into(),
            macaddr: DEFAULT_MACADDR.to_string(),
            nic_helper: PathBuf::from(DEFAULT_NIC_HELPER),
            port_fwds: BTreeMap::new(),
        }
    }

    /// Sets the guest MAC address.
    pub fn macaddr(mut self, macaddr: impl Into<String>) -> Self {
        self.macaddr = macaddr.into();
        self
    }

    /// Sets the bridge helper executable.
    pub fn nic_helper(mut self, helper: impl Into<PathBuf>) -> Self {
        self.nic_helper = helper.into();
        self
    }

    /// Forwards a host TCP port to a guest port. Adding the same host
    /// port twice replaces the earlier mapping.
    pub fn forward_port(mut self, host: u16, guest: u16) -> Self {
        self.port_fwds.insert(host, guest);
        self
    }

    /// Whether the configured login user is root.
    pub fn is_root(&self) -> bool {
        self.user == "root"
    }
}
