//! Target CPU architectures and their emulator invocation profiles.
//!
//! Every mapping from an architecture to an emulator detail is an
//! exhaustive match returning a [`Result`], so an architecture without a
//! mapping is a reportable error rather than a silent default. Two
//! failure kinds are distinguished: [`Error::UnknownArch`] means no
//! emulator command exists at all, while [`Error::UnimplementedArch`]
//! means the command is known but the boot arguments have not been
//! written yet.

use std::fmt;
use std::path::Path;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// CPU architecture of a sandbox guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    Arm,
    Mips,
    /// MIPS, little-endian variant.
    Mipsel,
    M68k,
    Ppc,
    I386,
    Amd64,
    /// Architecture not (yet) known.
    Unknown,
}

impl Arch {
    /// Returns the `qemu-system-*` binary that emulates this architecture.
    pub fn emulator_command(self) -> Result<&'static str> {
        match self {
            Arch::Arm => Ok("qemu-system-arm"),
            Arch::Mips => Ok("qemu-system-mips"),
            Arch::Mipsel => Ok("qemu-system-mipsel"),
            Arch::M68k => Ok("qemu-system-m68k"),
            Arch::Ppc => Ok("qemu-system-ppc"),
            Arch::I386 => Ok("qemu-system-i386"),
            Arch::Amd64 => Ok("qemu-system-x86_64"),
            Arch::Unknown => Err(Error::UnknownArch(self)),
        }
    }

    /// Returns the emulated machine type passed via `-M`.
    pub fn machine(self) -> Result<&'static str> {
        match self {
            Arch::Arm => Ok("versatilepb"),
            Arch::Mips | Arch::Mipsel => Ok("malta"),
            Arch::M68k | Arch::Ppc | Arch::I386 | Arch::Amd64 => {
                Err(Error::UnimplementedArch(self))
            }
            Arch::Unknown => Err(Error::UnknownArch(self)),
        }
    }

    /// Returns the device-tree blob filename, for boards that need one.
    pub fn dtb(self) -> Option<&'static str> {
        match self {
            Arch::Arm => Some("versatile-pb.dtb"),
            _ => None,
        }
    }

    /// Builds the architecture-specific fragment of the emulator command
    /// line: machine type, kernel, device tree, root disk, boot arguments
    /// and NIC setup.
    ///
    /// `vm_dir` is the directory holding the kernel and root filesystem
    /// images; `nic_helper` and `macaddr` configure the tap network device.
    pub fn emulator_args(
        self,
        vm_dir: &Path,
        nic_helper: &Path,
        macaddr: &str,
    ) -> Result<Vec<String>> {
        let vm = vm_dir.display();
        let helper = nic_helper.display();

        match self {
            Arch::Arm => Ok(vec![
                "-M".to_string(),
                self.machine()?.to_string(),
                "-kernel".to_string(),
                format!("{vm}/zImage"),
                "-dtb".to_string(),
                format!("{vm}/versatile-pb.dtb"),
                "-drive".to_string(),
                format!("file={vm}/rootfs.ext2,if=scsi,format=raw"),
                "-append".to_string(),
                "rootwait quiet root=/dev/sda console=ttyAMA0,115200".to_string(),
                "-nic".to_string(),
                format!("tap,model=rtl8139,helper={helper},mac={macaddr}"),
            ]),
            // The malta board boots from IDE, so the drive carries no
            // interface override.
            Arch::Mips | Arch::Mipsel => Ok(vec![
                "-M".to_string(),
                self.machine()?.to_string(),
                "-cpu".to_string(),
                "mips32r6-generic".to_string(),
                "-kernel".to_string(),
                format!("{vm}/zImage"),
                "-drive".to_string(),
                format!("file={vm}/rootfs.ext2,format=raw"),
                "-append".to_string(),
                "rootwait quiet root=/dev/sda".to_string(),
                "-nic".to_string(),
                format!("tap,model=pcnet,helper={helper},mac={macaddr}"),
            ]),
            Arch::M68k | Arch::Ppc | Arch::I386 | Arch::Amd64 => {
                Err(Error::UnimplementedArch(self))
            }
            Arch::Unknown => Err(Error::UnknownArch(self)),
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arch::Arm => "arm",
            Arch::Mips => "mips",
            Arch::Mipsel => "mipsel",
            Arch::M68k => "m68k",
            Arch::Ppc => "ppc",
            Arch::I386 => "i386",
            Arch::Amd64 => "amd64",
            Arch::Unknown => "unknown",
        };
        write!(f, "{name}")
    }
}

impl FromStr for Arch {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "arm" => Ok(Arch::Arm),
            "mips" => Ok(Arch::Mips),
            "mipsel" => Ok(Arch::Mipsel),
            "m68k" => Ok(Arch::M68k),
            "ppc" => Ok(Arch::Ppc),
            "i386" => Ok(Arch::I386),
            "amd64" | "x86_64" => Ok(Arch::Amd64),
            other => Err(Error::InvalidConfig(format!(
                "unknown architecture '{other}'"
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const ALL_IMPLEMENTED: &[Arch] = &[
        Arch::Arm,
        Arch::Mips,
        Arch::Mipsel,
        Arch::M68k,
        Arch::Ppc,
        Arch::I386,
        Arch::Amd64,
    ];

    #[test]
    fn every_known_arch_has_an_emulator_command() {
        for arch in ALL_IMPLEMENTED {
            let cmd = arch.emulator_command().unwrap();
            assert!(cmd.starts_with("qemu-system-"), "{arch}: {cmd}");
        }
    }

    #[test]
    fn unknown_arch_has_no_emulator_command() {
        assert!(matches!(
            Arch::Unknown.emulator_command(),
            Err(Error::UnknownArch(Arch::Unknown))
        ));
    }

    #[test]
    fn machine_types() {
        assert_eq!(Arch::Arm.machine().unwrap(), "versatilepb");
        assert_eq!(Arch::Mips.machine().unwrap(), "malta");
        assert_eq!(Arch::Mipsel.machine().unwrap(), "malta");
        assert!(matches!(
            Arch::Ppc.machine(),
            Err(Error::UnimplementedArch(Arch::Ppc))
        ));
    }

    #[test]
    fn dtb_only_for_arm() {
        assert_eq!(Arch::Arm.dtb(), Some("versatile-pb.dtb"));
        assert_eq!(Arch::Mips.dtb(), None);
        assert_eq!(Arch::Amd64.dtb(), None);
    }

    #[test]
    fn arm_args_reference_vm_dir_and_nic() {
        let vm_dir = PathBuf::from("/vms/arm");
        let helper = PathBuf::from("/usr/lib/qemu/qemu-bridge-helper");
        let args = Arch::Arm
            .emulator_args(&vm_dir, &helper, "52:54:01:12:34:56")
            .unwrap();

        assert!(args.contains(&"/vms/arm/zImage".to_string()));
        assert!(args.contains(&"/vms/arm/versatile-pb.dtb".to_string()));
        assert!(args.contains(&"file=/vms/arm/rootfs.ext2,if=scsi,format=raw".to_string()));
        let nic = args.last().unwrap();
        assert!(nic.contains("helper=/usr/lib/qemu/qemu-bridge-helper"));
        assert!(nic.contains("mac=52:54:01:12:34:56"));
    }

    #[test]
    fn args_for_unimplemented_arch_fail() {
        let vm_dir = PathBuf::from("/vms/m68k");
        let helper = PathBuf::from("/helper");
        assert!(matches!(
            Arch::M68k.emulator_args(&vm_dir, &helper, "52:54:00:00:00:01"),
            Err(Error::UnimplementedArch(Arch::M68k))
        ));
    }

    #[test]
    fn args_for_unknown_arch_fail_with_command_error() {
        let vm_dir = PathBuf::from("/vms/unknown");
        let helper = PathBuf::from("/helper");
        assert!(matches!(
            Arch::Unknown.emulator_args(&vm_dir, &helper, "52:54:00:00:00:01"),
            Err(Error::UnknownArch(Arch::Unknown))
        ));
    }

    #[test]
    fn arch_parses_from_str() {
        assert_eq!("arm".parse::<Arch>().unwrap(), Arch::Arm);
        assert_eq!("x86_64".parse::<Arch>().unwrap(), Arch::Amd64);
        assert_eq!("MIPSEL".parse::<Arch>().unwrap(), Arch::Mipsel);
        assert!("riscv".parse::<Arch>().is_err());
    }
}
