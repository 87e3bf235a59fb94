//! Emulator command-line assembly.

use iotsuite_core::{Error, Result, SandboxConfig};

/// Fixed tail flags: no display, serial console and qemu monitor
/// multiplexed on the controlling terminal.
const TAIL_ARGS: &[&str] = &["-nographic", "-serial", "mon:stdio"];

/// Builds the full emulator argument vector for `config`. The first
/// element is the emulator binary name; the order of the remaining
/// elements is significant and must be passed through unchanged.
///
/// Fails if the architecture has no emulator command, its boot arguments
/// are not implemented, or the VM directory cannot be resolved to an
/// absolute path.
pub fn build_command(config: &SandboxConfig) -> Result<Vec<String>> {
    let binary = config.arch.emulator_command()?;

    let vm_dir = std::path::absolute(&config.vm_dir).map_err(|e| {
        Error::InvalidConfig(format!(
            "cannot resolve VM directory '{}': {e}",
            config.vm_dir.display()
        ))
    })?;

    let mut cmd = vec![binary.to_string()];
    cmd.extend(
        config
            .arch
            .emulator_args(&vm_dir, &config.nic_helper, &config.macaddr)?,
    );

    if !config.port_fwds.is_empty() {
        let clauses: Vec<String> = config
            .port_fwds
            .iter()
            .map(|(host, guest)| format!("hostfwd=tcp::{host}-:{guest}"))
            .collect();
        cmd.push("-netdev".to_string());
        cmd.push(format!("user,id=fwd0,{}", clauses.join(",")));
    }

    cmd.extend(TAIL_ARGS.iter().map(|s| s.to_string()));
    Ok(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use iotsuite_core::Arch;

    fn arm_config() -> SandboxConfig {
        SandboxConfig::new(Arch::Arm, "root", "toor", "/vms/arm")
    }

    #[test]
    fn first_element_is_the_emulator_binary() {
        let cmd = build_command(&arm_config()).unwrap();
        assert_eq!(cmd[0], "qemu-system-arm");
    }

    #[test]
    fn build_is_a_pure_function() {
        let config = arm_config().forward_port(8080, 80);
        assert_eq!(build_command(&config).unwrap(), build_command(&config).unwrap());
    }

    #[test]
    fn unknown_arch_yields_no_partial_vector() {
        let config = SandboxConfig::new(Arch::Unknown, "root", "toor", "/vms/unknown");
        assert!(matches!(
            build_command(&config),
            Err(Error::UnknownArch(Arch::Unknown))
        ));
    }

    #[test]
    fn unimplemented_arch_is_a_distinct_failure() {
        let config = SandboxConfig::new(Arch::Amd64, "root", "toor", "/vms/amd64");
        assert!(matches!(
            build_command(&config),
            Err(Error::UnimplementedArch(Arch::Amd64))
        ));
    }

    #[test]
    fn relative_vm_dir_is_resolved_to_absolute() {
        let config = SandboxConfig::new(Arch::Arm, "root", "toor", "vms/arm");
        let cmd = build_command(&config).unwrap();
        let kernel = cmd
            .iter()
            .find(|arg| arg.ends_with("/zImage"))
            .expect("kernel argument present");
        assert!(kernel.starts_with('/'), "{kernel}");
    }

    #[test]
    fn port_forwards_synthesize_one_netdev_argument() {
        let config = arm_config().forward_port(8080, 80).forward_port(2222, 22);
        let cmd = build_command(&config).unwrap();

        let netdev_flags = cmd.iter().filter(|a| *a == "-netdev").count();
        assert_eq!(netdev_flags, 1);

        let backend = &cmd[cmd.iter().position(|a| a == "-netdev").unwrap() + 1];
        assert_eq!(backend.matches("hostfwd=tcp::8080-:80").count(), 1);
        assert_eq!(backend.matches("hostfwd=tcp::2222-:22").count(), 1);
    }

    #[test]
    fn empty_forward_map_omits_the_netdev_argument() {
        let cmd = build_command(&arm_config()).unwrap();
        assert!(!cmd.iter().any(|a| a == "-netdev"));
        assert!(!cmd.iter().any(|a| a.contains("hostfwd")));
    }

    #[test]
    fn tail_flags_close_the_vector_in_order() {
        let cmd = build_command(&arm_config()).unwrap();
        assert_eq!(
            &cmd[cmd.len() - 3..],
            &["-nographic", "-serial", "mon:stdio"]
        );
    }
}
