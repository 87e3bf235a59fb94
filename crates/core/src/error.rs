use crate::arch::Arch;

/// Errors that can occur when driving an iotsuite sandbox.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("no emulator command for architecture '{0}'")]
    UnknownArch(Arch),

    #[error("architecture '{0}' is not implemented")]
    UnimplementedArch(Arch),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sandbox is not started")]
    NotStarted,

    #[error("sandbox controller already started")]
    AlreadyStarted,

    #[error("unable to login: {0}")]
    LoginFailed(String),

    #[error("timed out waiting for pattern: {pattern}")]
    Timeout { pattern: String },

    #[error("console closed before pattern appeared: {pattern}")]
    ConsoleClosed { pattern: String },

    #[error("failed to spawn emulator: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("failed to signal emulator process: {0}")]
    Signal(#[source] nix::Error),

    #[error("failed to reap emulator process: {0}")]
    Wait(#[source] std::io::Error),

    #[error("could not parse exit status from '{got}'")]
    ExitStatus { got: String },

    #[error("snapshots are not supported for architecture '{0}'")]
    SnapshotUnsupported(Arch),

    #[error("not a valid ELF sample: {0}")]
    Sample(String),

    #[error("strings extraction failed: {0}")]
    Strings(String),

    #[error("'{0}' not in PATH")]
    MissingExecutable(String),

    #[error("file transfer error: {0}")]
    Transfer(String),

    #[error("transfer server error: [{code}] {message}")]
    TransferServer { code: u16, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
