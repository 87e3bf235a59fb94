//! Sandbox controller: owns one emulator subprocess and drives its
//! serial console through login, command execution and shutdown.
//!
//! A [`Sandbox`] runs one guest for its whole lifetime. Operations are
//! strictly sequential; each call blocks until it completes or times
//! out. There is no re-login and no restart after [`Sandbox::stop`] — a
//! fresh controller must be created per guest.

use std::process::{Child, Command, ExitStatus};
use std::time::Duration;

use nix::sys::signal::{Signal, kill};
use nix::unistd::Pid;
use tracing::{debug, warn};

use iotsuite_core::{Arch, CmdResult, Error, Result, SandboxConfig};

use crate::command::build_command;
use crate::console::Console;

/// Login banner printed by the sandbox images.
pub const LOGIN_PROMPT: &str = "iotsuite login: ";
/// Password prompt printed after the username is accepted.
pub const PASSWORD_PROMPT: &str = "Password: ";
/// Shell prompt when logged in as root.
pub const ROOT_PROMPT: &str = "# ";
/// Shell prompt for any other user.
pub const USER_PROMPT: &str = "$ ";

const LOGIN_INCORRECT: &str = "Login incorrect";
const MONITOR_PROMPT: &str = "(qemu)";
const EXITCODE_PROBE: &str = "echo $?";

const LOGIN_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_CMD_TIMEOUT: Duration = Duration::from_secs(60);

/// Lifecycle state of a [`Sandbox`].
///
/// Operations are only legal in the states that permit them: command
/// execution and monitor commands require `Ready`, startup requires
/// `NotStarted`, and `Failed` is terminal — the controller must be
/// discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SandboxState {
    NotStarted,
    LoggingIn,
    Ready,
    Stopped,
    Failed,
}

struct Session {
    console: Console,
    child: Child,
}

/// Controller for one emulated sandbox VM.
///
/// ```rust,no_run
/// use iotsuite::{Arch, Sandbox, SandboxConfig};
///
/// # fn example() -> iotsuite::Result<()> {
/// let config = SandboxConfig::new(Arch::Arm, "root", "toor", "vms/arm");
/// let mut sandbox = Sandbox::new(config);
/// sandbox.noninteractive()?;
/// let result = sandbox.run_cmd("uname -a")?;
/// println!("{} (exit {})", result.output, result.exitcode);
/// sandbox.stop()?;
/// # Ok(())
/// # }
/// ```
pub struct Sandbox {
    config: SandboxConfig,
    cmd: Vec<String>,
    prompt: String,
    state: SandboxState,
    session: Option<Session>,
}

impl Sandbox {
    /// Creates a controller for `config`. Nothing is spawned until one of
    /// the startup operations is called.
    pub fn new(config: SandboxConfig) -> Self {
        let prompt = if config.is_root() {
            ROOT_PROMPT
        } else {
            USER_PROMPT
        };
        Self {
            config,
            cmd: Vec::new(),
            prompt: prompt.to_string(),
            state: SandboxState::NotStarted,
            session: None,
        }
    }

    /// The configuration this controller was built with.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SandboxState {
        self.state
    }

    /// Whether the guest is logged in and ready for commands.
    pub fn started(&self) -> bool {
        self.state == SandboxState::Ready
    }

    /// The shell prompt currently used to detect command completion.
    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    /// The resolved emulator argument vector; empty before startup.
    pub fn command(&self) -> &[String] {
        &self.cmd
    }

    /// Starts an automated session: spawns the emulator on a fresh
    /// pseudo-terminal and performs the login handshake. On success the
    /// controller is `Ready`; on any failure it is `Failed` and must be
    /// discarded.
    pub fn noninteractive(&mut self) -> Result<()> {
        if self.state != SandboxState::NotStarted {
            return Err(Error::AlreadyStarted);
        }

        self.cmd = build_command(&self.config)?;
        debug!(command = ?self.cmd, "starting emulator");

        let mut command = Command::new(&self.cmd[0]);
        command.args(&self.cmd[1..]);
        let (console, child) = Console::spawn(command)?;
        self.session = Some(Session { console, child });
        self.state = SandboxState::LoggingIn;
        self.complete_login()
    }

    /// Starts an interactive session on the caller's terminal, consuming
    /// the controller. The operator drives the serial console directly;
    /// returns the emulator's exit status once it terminates.
    pub fn interactive(mut self) -> Result<ExitStatus> {
        if self.state != SandboxState::NotStarted {
            return Err(Error::AlreadyStarted);
        }

        self.cmd = build_command(&self.config)?;
        debug!(command = ?self.cmd, "starting interactive emulator");

        let status = Command::new(&self.cmd[0])
            .args(&self.cmd[1..])
            .status()
            .map_err(Error::Spawn)?;
        self.state = SandboxState::Stopped;
        Ok(status)
    }

    /// Runs `cmd` on the guest shell and recovers its output and exit
    /// code, with the default per-step timeout.
    pub fn run_cmd(&mut self, cmd: &str) -> Result<CmdResult> {
        self.run_cmd_timeout(cmd, DEFAULT_CMD_TIMEOUT)
    }

    /// Like [`Sandbox::run_cmd`] with a caller-supplied timeout bound for
    /// each of the two prompt waits.
    ///
    /// The captured output has the prompt and the echoed command stripped
    /// by substring removal; a command whose genuine output contains
    /// either string loses that text as well, since the serial stream
    /// carries no framing to tell echo from output.
    pub fn run_cmd_timeout(&mut self, cmd: &str, timeout: Duration) -> Result<CmdResult> {
        if self.state != SandboxState::Ready {
            return Err(Error::NotStarted);
        }
        let prompt = self.prompt.clone();
        let session = self.session.as_mut().ok_or(Error::NotStarted)?;

        debug!(cmd, "running guest command");
        session.console.send_line(cmd)?;
        let captured = session.console.expect(&prompt, timeout)?;
        let output = sanitize(&captured, &prompt, cmd);

        session.console.send_line(EXITCODE_PROBE)?;
        let captured = session.console.expect(&prompt, timeout)?;
        let code = sanitize(&captured, &prompt, EXITCODE_PROBE);
        let exitcode = code
            .parse::<i32>()
            .map_err(|_| Error::ExitStatus { got: code })?;

        debug!(exitcode, "guest command complete");
        Ok(CmdResult { output, exitcode })
    }

    /// Re-exports the guest shell prompt and uses `new_prompt` for all
    /// further completion detection. The new prompt should be a string
    /// the guest is not otherwise printing.
    pub fn change_prompt(&mut self, new_prompt: &str) -> Result<()> {
        if self.state != SandboxState::Ready {
            return Err(Error::NotStarted);
        }
        let session = self.session.as_mut().ok_or(Error::NotStarted)?;

        debug!(new_prompt, "re-exporting shell prompt");
        session
            .console
            .send_line(&format!("export PS1='{new_prompt}'"))?;
        session.console.expect(new_prompt, DEFAULT_CMD_TIMEOUT)?;
        self.prompt = new_prompt.to_string();
        Ok(())
    }

    /// Saves a named snapshot of the running VM via the qemu monitor.
    pub fn snapshot(&mut self, tag: &str) -> Result<()> {
        self.check_snapshot_arch()?;
        self.monitor_command(&format!("savevm {tag}"))
    }

    /// Resets the running VM to a previously saved snapshot.
    pub fn reset(&mut self, tag: &str) -> Result<()> {
        self.check_snapshot_arch()?;
        self.monitor_command(&format!("loadvm {tag}"))
    }

    // savevm segfaults qemu-system-mips{,el}; those images are reset
    // offline with qemu-img instead.
    fn check_snapshot_arch(&self) -> Result<()> {
        if matches!(self.config.arch, Arch::Mips | Arch::Mipsel) {
            return Err(Error::SnapshotUnsupported(self.config.arch));
        }
        Ok(())
    }

    /// Stops the VM: sends an interrupt to the emulator process and
    /// blocks until it has been reaped. On failure the controller stays
    /// `Ready` but must be treated as unusable.
    pub fn stop(&mut self) -> Result<ExitStatus> {
        if self.state != SandboxState::Ready {
            return Err(Error::NotStarted);
        }
        let mut session = self.session.take().ok_or(Error::NotStarted)?;

        debug!("stopping emulator");
        let pid = Pid::from_raw(session.child.id() as i32);
        if let Err(e) = kill(pid, Signal::SIGINT) {
            self.session = Some(session);
            return Err(Error::Signal(e));
        }

        match session.child.wait() {
            Ok(status) => {
                debug!(?status, "emulator stopped");
                self.state = SandboxState::Stopped;
                Ok(status)
            }
            Err(e) => {
                self.session = Some(session);
                Err(Error::Wait(e))
            }
        }
    }

    fn complete_login(&mut self) -> Result<()> {
        match self.login() {
            Ok(()) => {
                self.state = SandboxState::Ready;
                Ok(())
            }
            Err(e) => {
                self.state = SandboxState::Failed;
                self.discard_session();
                Err(e)
            }
        }
    }

    fn login(&mut self) -> Result<()> {
        let prompt = self.prompt.clone();
        let session = self.session.as_mut().ok_or(Error::NotStarted)?;

        debug!("waiting for login prompt");
        session.console.expect(LOGIN_PROMPT, LOGIN_TIMEOUT)?;

        debug!("sending username");
        session.console.send_line(&self.config.user)?;
        session
            .console
            .expect(PASSWORD_PROMPT, DEFAULT_CMD_TIMEOUT)?;

        debug!("sending password");
        session.console.send_line(&self.config.passwd)?;
        let (matched, captured) = session
            .console
            .expect_any(&[&prompt, LOGIN_INCORRECT], DEFAULT_CMD_TIMEOUT)?;
        if matched != 0 || captured.contains(LOGIN_INCORRECT) {
            return Err(Error::LoginFailed(format!("got '{}'", captured.trim())));
        }

        debug!("login complete");
        Ok(())
    }

    /// Runs one command in the qemu monitor: Ctrl-A c switches the
    /// multiplexed console over, the trailing `c` switches back, and the
    /// newline after it coaxes a fresh shell prompt out of the guest.
    fn monitor_command(&mut self, cmd: &str) -> Result<()> {
        if self.state != SandboxState::Ready {
            return Err(Error::NotStarted);
        }
        let prompt = self.prompt.clone();
        let session = self.session.as_mut().ok_or(Error::NotStarted)?;

        debug!(cmd, "sending monitor command");
        session.console.send_control('a')?;
        session.console.send(b"c")?;
        session.console.expect(MONITOR_PROMPT, DEFAULT_CMD_TIMEOUT)?;

        session.console.send_line(cmd)?;
        session.console.expect(MONITOR_PROMPT, DEFAULT_CMD_TIMEOUT)?;

        session.console.send_control('a')?;
        session.console.send_line("c")?;
        session.console.expect(&prompt, DEFAULT_CMD_TIMEOUT)?;
        Ok(())
    }

    fn discard_session(&mut self) {
        if let Some(mut session) = self.session.take() {
            let pid = Pid::from_raw(session.child.id() as i32);
            if let Err(e) = kill(pid, Signal::SIGKILL) {
                warn!("failed to kill emulator after login failure: {e}");
            }
            if let Err(e) = session.child.wait() {
                warn!("failed to reap emulator after login failure: {e}");
            }
        }
    }
}

/// Strips terminal echo artifacts from captured output: every occurrence
/// of the prompt and of the command line itself is removed, then the
/// result is trimmed. Output that genuinely contains either string is
/// stripped along with the echo; the serial protocol has no framing that
/// would tell them apart.
fn sanitize(captured: &str, prompt: &str, cmd: &str) -> String {
    let mut out = captured.to_string();
    if !cmd.is_empty() {
        out = out.replace(cmd, "");
    }
    if !prompt.is_empty() {
        out = out.replace(prompt, "");
    }
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    // Plays the guest side of the serial protocol: login handshake, echo
    // of each command line, canned replies and a prompt after each step.
    const FAKE_GUEST: &str = r#"
printf 'iotsuite login: '
read user
printf 'Password: '
read pass
if [ "$pass" != toor ]; then
    printf 'Login incorrect\n'
    printf 'iotsuite login: '
    exit 1
fi
printf '# '
status=0
while read cmd; do
    case "$cmd" in
        'echo $?') printf '%s\n%s\n' "$cmd" "$status"; status=0 ;;
        fail) printf '%s\n' "$cmd"; status=3 ;;
        hostname) printf '%s\niot-device\n' "$cmd" ;;
        *) printf '%s\n' "$cmd" ;;
    esac
    printf '# '
done
"#;

    // Guest whose exit-status probe answer is not a number.
    const DESYNCED_GUEST: &str = r#"
printf 'iotsuite login: '
read user
printf 'Password: '
read pass
printf '# '
read cmd
printf '%s\n' "$cmd"
printf '# '
read probe
printf '%s\ngarbage\n' "$probe"
printf '# '
"#;

    fn attach(script: &str, passwd: &str, arch: Arch) -> Sandbox {
        let config = SandboxConfig::new(arch, "root", passwd, "/vms/test");
        let mut sandbox = Sandbox::new(config);

        let mut command = Command::new("sh");
        command.args(["-c", script]);
        let (console, child) = Console::spawn(command).unwrap();
        sandbox.session = Some(Session { console, child });
        sandbox.state = SandboxState::LoggingIn;
        sandbox
    }

    #[test]
    fn login_reaches_ready() {
        let mut sandbox = attach(FAKE_GUEST, "toor", Arch::Arm);
        sandbox.complete_login().unwrap();
        assert_eq!(sandbox.state(), SandboxState::Ready);
        assert!(sandbox.started());
        sandbox.stop().unwrap();
    }

    #[test]
    fn wrong_password_fails_login() {
        let mut sandbox = attach(FAKE_GUEST, "wrong", Arch::Arm);
        let err = sandbox.complete_login().unwrap_err();
        assert!(matches!(err, Error::LoginFailed(_)));
        assert_eq!(sandbox.state(), SandboxState::Failed);
        assert!(!sandbox.started());
    }

    #[test]
    fn run_cmd_returns_empty_output_and_zero_exitcode() {
        let mut sandbox = attach(FAKE_GUEST, "toor", Arch::Arm);
        sandbox.complete_login().unwrap();

        let result = sandbox.run_cmd("true").unwrap();
        assert_eq!(result.output, "");
        assert_eq!(result.exitcode, 0);
        sandbox.stop().unwrap();
    }

    #[test]
    fn run_cmd_recovers_output_text() {
        let mut sandbox = attach(FAKE_GUEST, "toor", Arch::Arm);
        sandbox.complete_login().unwrap();

        let result = sandbox.run_cmd("hostname").unwrap();
        assert_eq!(result.output, "iot-device");
        assert!(result.success());
        sandbox.stop().unwrap();
    }

    #[test]
    fn run_cmd_recovers_nonzero_exitcode() {
        let mut sandbox = attach(FAKE_GUEST, "toor", Arch::Arm);
        sandbox.complete_login().unwrap();

        let result = sandbox.run_cmd("fail").unwrap();
        assert_eq!(result.exitcode, 3);
        assert!(!result.success());

        // the failure was consumed by the probe
        let result = sandbox.run_cmd("true").unwrap();
        assert_eq!(result.exitcode, 0);
        sandbox.stop().unwrap();
    }

    #[test]
    fn non_numeric_probe_reply_is_a_protocol_error() {
        let mut sandbox = attach(DESYNCED_GUEST, "toor", Arch::Arm);
        sandbox.complete_login().unwrap();

        let err = sandbox.run_cmd("true").unwrap_err();
        assert!(matches!(err, Error::ExitStatus { got } if got == "garbage"));
    }

    #[test]
    fn stop_transitions_started_to_false() {
        let mut sandbox = attach(FAKE_GUEST, "toor", Arch::Arm);
        sandbox.complete_login().unwrap();
        assert!(sandbox.started());

        sandbox.stop().unwrap();
        assert_eq!(sandbox.state(), SandboxState::Stopped);
        assert!(!sandbox.started());
    }

    #[test]
    fn run_cmd_requires_a_started_sandbox() {
        let config = SandboxConfig::new(Arch::Arm, "root", "toor", "/vms/arm");
        let mut sandbox = Sandbox::new(config);
        assert!(matches!(sandbox.run_cmd("ls"), Err(Error::NotStarted)));
    }

    #[test]
    fn stop_before_startup_is_a_checked_failure() {
        let config = SandboxConfig::new(Arch::Arm, "root", "toor", "/vms/arm");
        let mut sandbox = Sandbox::new(config);
        assert!(matches!(sandbox.stop(), Err(Error::NotStarted)));
        assert_eq!(sandbox.state(), SandboxState::NotStarted);
    }

    #[test]
    fn snapshot_is_rejected_for_mips_guests() {
        let mut sandbox = attach(FAKE_GUEST, "toor", Arch::Mips);
        sandbox.complete_login().unwrap();

        assert!(matches!(
            sandbox.snapshot("clean"),
            Err(Error::SnapshotUnsupported(Arch::Mips))
        ));
        assert!(matches!(
            sandbox.reset("clean"),
            Err(Error::SnapshotUnsupported(Arch::Mips))
        ));
        sandbox.stop().unwrap();
    }

    #[test]
    fn prompt_follows_login_user() {
        let root = Sandbox::new(SandboxConfig::new(Arch::Arm, "root", "x", "/vms"));
        assert_eq!(root.prompt(), ROOT_PROMPT);
        let user = Sandbox::new(SandboxConfig::new(Arch::Arm, "tester", "x", "/vms"));
        assert_eq!(user.prompt(), USER_PROMPT);
    }

    mod sanitize {
        use super::super::sanitize;

        #[test]
        fn strips_echo_and_prompts() {
            let captured = "ls /tmp\r\r\nsample.bin\r\nresults.txt\r\n# ";
            assert_eq!(
                sanitize(captured, "# ", "ls /tmp"),
                "sample.bin\r\nresults.txt"
            );
        }

        #[test]
        fn is_idempotent() {
            let captured = "uname\r\r\nLinux\r\n# ";
            let once = sanitize(captured, "# ", "uname");
            let twice = sanitize(&once, "# ", "uname");
            assert_eq!(once, twice);
        }

        #[test]
        fn prompt_text_inside_output_is_stripped_too() {
            // known limitation: genuine output that contains the prompt
            // is removed along with the echo
            assert_eq!(sanitize("a# b", "# ", "cmd"), "ab");
        }

        #[test]
        fn empty_command_leaves_input_intact() {
            assert_eq!(sanitize("payload", "# ", ""), "payload");
        }
    }
}
