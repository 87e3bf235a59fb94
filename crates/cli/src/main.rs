use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use serde::Deserialize;

use iotsuite::{Arch, Sandbox, SandboxConfig, StaticAnalyzer, check_required_executables};

#[derive(Parser)]
#[command(name = "iotsuite")]
#[command(about = "Automated analysis of IoT malware in emulated sandboxes")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Verify that all required external tools are installed
    Check,

    /// Static analysis: digests, architecture and printable strings
    Inspect {
        /// Sample to analyse
        file: PathBuf,

        /// Skip the strings listing
        #[arg(long)]
        no_strings: bool,
    },

    /// Boot a sandbox and hand its serial console to this terminal
    Console {
        /// Path to a TOML configuration file
        #[arg(long, short)]
        config: PathBuf,
    },

    /// Run commands inside an emulated sandbox
    Run {
        /// Path to a TOML configuration file
        #[arg(long, short)]
        config: PathBuf,

        /// Additional host:guest TCP port forwards
        #[arg(long, short, value_parser = parse_forward)]
        forward: Vec<(u16, u16)>,

        /// Commands to execute on the guest
        #[arg(required = true)]
        commands: Vec<String>,
    },
}

fn parse_forward(s: &str) -> Result<(u16, u16), String> {
    let Some((host, guest)) = s.split_once(':') else {
        return Err("forward format must be 'host:guest'".to_string());
    };
    let host = host
        .parse()
        .map_err(|_| format!("invalid host port '{host}'"))?;
    let guest = guest
        .parse()
        .map_err(|_| format!("invalid guest port '{guest}'"))?;
    Ok((host, guest))
}

#[derive(Debug, Deserialize)]
struct ConfigFile {
    sandbox: SandboxSection,
}

#[derive(Debug, Deserialize)]
struct SandboxSection {
    arch: Arch,
    user: String,
    password: String,
    vm_dir: PathBuf,
    macaddr: Option<String>,
    nic_helper: Option<PathBuf>,
    #[serde(default)]
    port_forwards: Vec<String>,
}

fn load_config(path: &Path, extra_forwards: &[(u16, u16)]) -> anyhow::Result<SandboxConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    let file: ConfigFile =
        toml::from_str(&raw).with_context(|| format!("parsing {}", path.display()))?;
    let section = file.sandbox;

    let mut config = SandboxConfig::new(section.arch, section.user, section.password, section.vm_dir);
    if let Some(macaddr) = section.macaddr {
        config = config.macaddr(macaddr);
    }
    if let Some(helper) = section.nic_helper {
        config = config.nic_helper(helper);
    }
    for spec in &section.port_forwards {
        let (host, guest) = parse_forward(spec)
            .map_err(|e| anyhow::anyhow!("port forward '{spec}': {e}"))?;
        config = config.forward_port(host, guest);
    }
    for &(host, guest) in extra_forwards {
        config = config.forward_port(host, guest);
    }
    Ok(config)
}

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    if let Err(e) = run() {
        eprintln!("Error: {e:?}");
        std::process::exit(1);
    }
}

fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Check => {
            check_required_executables()?;
            println!("all required executables found");
        }

        Commands::Inspect { file, no_strings } => {
            let analyzer = StaticAnalyzer::new(&file)?;
            println!("sample: {}", analyzer.path().display());
            println!("arch:   {}", analyzer.detect_arch()?);
            println!("sha256: {}", hex::encode(analyzer.sha256()));
            println!("md5:    {}", hex::encode(analyzer.md5()));
            if !no_strings {
                for s in analyzer.strings()? {
                    println!("{:#010x} {}", s.offset, s.string);
                }
            }
        }

        Commands::Console { config } => {
            let config = load_config(&config, &[])?;
            let status = Sandbox::new(config).interactive()?;
            if !status.success() {
                bail!("emulator exited with {status}");
            }
        }

        Commands::Run {
            config,
            forward,
            commands,
        } => {
            let config = load_config(&config, &forward)?;
            let mut sandbox = Sandbox::new(config);
            sandbox.noninteractive()?;

            let mut failed = false;
            for cmd in &commands {
                match sandbox.run_cmd(cmd) {
                    Ok(result) => {
                        if !result.output.is_empty() {
                            println!("{}", result.output);
                        }
                        if !result.success() {
                            eprintln!("'{cmd}' exited with code {}", result.exitcode);
                            failed = true;
                        }
                    }
                    Err(e) => {
                        // a protocol error leaves the session in an
                        // unknown state; tear the VM down and give up
                        let _ = sandbox.stop();
                        return Err(e.into());
                    }
                }
            }

            sandbox.stop()?;
            if failed {
                bail!("one or more commands failed");
            }
        }
    }

    Ok(())
}
