//! Static analysis of malware samples: digests, architecture detection
//! and printable-string extraction.

use std::path::{Path, PathBuf};
use std::process::Command;

use goblin::elf::Elf;
use goblin::elf::header::{EM_68K, EM_386, EM_ARM, EM_MIPS, EM_PPC, EM_X86_64};
use md5::Md5;
use sha2::{Digest, Sha256};
use tracing::debug;

use iotsuite_core::{Arch, Error, Result, StringOffset};

/// Static analyzer for one sample, loaded into memory on construction.
///
/// ```rust,no_run
/// use iotsuite::StaticAnalyzer;
///
/// # fn example() -> iotsuite::Result<()> {
/// let analyzer = StaticAnalyzer::new("samples/mirai.arm")?;
/// let digest = analyzer.sha256();
/// let strings = analyzer.strings()?;
/// # Ok(())
/// # }
/// ```
pub struct StaticAnalyzer {
    path: PathBuf,
    data: Vec<u8>,
}

impl StaticAnalyzer {
    /// Loads the sample at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let path = std::path::absolute(path.into())?;
        let data = std::fs::read(&path)?;
        Ok(Self { path, data })
    }

    /// Absolute path of the sample.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Raw sample bytes.
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// SHA-256 digest of the sample.
    pub fn sha256(&self) -> [u8; 32] {
        Sha256::digest(&self.data).into()
    }

    /// MD5 digest of the sample.
    pub fn md5(&self) -> [u8; 16] {
        Md5::digest(&self.data).into()
    }

    /// Reads the target architecture out of the sample's ELF header.
    /// Machine types the sandbox has no profile for come back as
    /// [`Arch::Unknown`] rather than an error.
    pub fn detect_arch(&self) -> Result<Arch> {
        let elf = Elf::parse(&self.data).map_err(|e| Error::Sample(e.to_string()))?;
        let arch = match elf.header.e_machine {
            EM_ARM => Arch::Arm,
            EM_MIPS => {
                if elf.little_endian {
                    Arch::Mipsel
                } else {
                    Arch::Mips
                }
            }
            EM_68K => Arch::M68k,
            EM_PPC => Arch::Ppc,
            EM_386 => Arch::I386,
            EM_X86_64 => Arch::Amd64,
            _ => Arch::Unknown,
        };
        debug!(%arch, "detected sample architecture");
        Ok(arch)
    }

    /// Extracts printable strings by shelling out to `strings -t x`,
    /// returning them in file order with their byte offsets.
    pub fn strings(&self) -> Result<Vec<StringOffset>> {
        let output = Command::new("strings")
            .args(["-t", "x"])
            .arg(&self.path)
            .output()?;
        if !output.status.success() {
            return Err(Error::Strings(format!(
                "strings exited with {}",
                output.status
            )));
        }
        Ok(parse_strings(&String::from_utf8_lossy(&output.stdout)))
    }
}

/// Parses `strings -t x` output, one `<hex-offset> <string>` pair per
/// line. A line that does not parse ends the listing; everything before
/// it is kept.
fn parse_strings(raw: &str) -> Vec<StringOffset> {
    let mut out = Vec::new();
    for line in raw.lines() {
        let line = line.trim_start();
        let Some((offset, string)) = line.split_once(' ') else {
            break;
        };
        let Ok(offset) = u64::from_str_radix(offset, 16) else {
            break;
        };
        out.push(StringOffset {
            offset,
            string: string.to_string(),
        });
    }
    out
}
