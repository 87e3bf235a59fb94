//! Serial console session over a pseudo-terminal.
//!
//! [`Console`] owns the master side of a pty whose slave side carries the
//! standard streams of a spawned subprocess. It offers two primitives:
//! [`Console::send_line`] writes a line into the terminal, and
//! [`Console::expect`] blocks until a substring appears in the incoming
//! byte stream or a deadline passes. Everything above (login handshake,
//! command protocol) is built from these two calls.
//!
//! The wait is a plain read loop gated on `poll(2)` in short slices with
//! an explicit deadline; the only way to cancel it is for the timeout to
//! elapse or for the other end of the terminal to go away.

use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsFd, AsRawFd, OwnedFd};
use std::os::unix::process::CommandExt;
use std::process::{Child, Command};
use std::time::{Duration, Instant};

use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::pty::{OpenptyResult, openpty};
use nix::sys::termios::{self, ControlFlags, InputFlags, LocalFlags, OutputFlags, SetArg};
use tracing::trace;

use iotsuite_core::{Error, Result};

/// How long each poll slice waits before re-checking the deadline.
const POLL_SLICE_MS: u8 = 50;

/// A bidirectional console channel to a subprocess.
///
/// ```rust,no_run
/// use std::process::Command;
/// use std::time::Duration;
/// use iotsuite::Console;
///
/// # fn example() -> iotsuite::Result<()> {
/// let (mut console, _child) = Console::spawn(Command::new("qemu-system-arm"))?;
/// console.expect("login: ", Duration::from_secs(30))?;
/// console.send_line("root")?;
/// # Ok(())
/// # }
/// ```
pub struct Console {
    master: File,
    buffer: String,
}

impl Console {
    /// Spawns `command` with stdin, stdout and stderr attached to the
    /// slave side of a fresh pseudo-terminal, and returns the console
    /// wrapping the master side together with the child handle.
    ///
    /// The child is reparented into its own session so that signals sent
    /// to it do not reach the caller. Teardown of the child is the
    /// caller's responsibility.
    pub fn spawn(mut command: Command) -> Result<(Self, Child)> {
        let pty = Pty::new().map_err(Error::Spawn)?;
        let slave_fd = pty.slave.as_raw_fd();

        // SAFETY: pre_exec runs after fork() but before exec() in the
        // child. slave_fd stays valid because pty.slave is kept alive
        // until spawn() returns, and setsid/dup2/close are
        // async-signal-safe. The parent's copy of the slave is closed
        // right after the spawn so EOF on the master tracks child exit.
        unsafe {
            command.pre_exec(move || {
                nix::unistd::setsid().map_err(std::io::Error::other)?;
                nix::unistd::dup2(slave_fd, 0).map_err(std::io::Error::other)?;
                nix::unistd::dup2(slave_fd, 1).map_err(std::io::Error::other)?;
                nix::unistd::dup2(slave_fd, 2).map_err(std::io::Error::other)?;
                if slave_fd > 2 {
                    nix::unistd::close(slave_fd).map_err(std::io::Error::other)?;
                }
                Ok(())
            });
        }

        let child = command.spawn().map_err(Error::Spawn)?;
        drop(pty.slave);

        Ok((
            Self {
                master: File::from(pty.master),
                buffer: String::new(),
            },
            child,
        ))
    }

    /// Writes `line` followed by a newline to the terminal.
    pub fn send_line(&mut self, line: &str) -> Result<()> {
        trace!(line, "console send");
        self.master.write_all(line.as_bytes())?;
        self.master.write_all(b"\n")?;
        self.master.flush()?;
        Ok(())
    }

    /// Writes raw bytes to the terminal.
    pub fn send(&mut self, data: &[u8]) -> Result<()> {
        self.master.write_all(data)?;
        self.master.flush()?;
        Ok(())
    }

    /// Sends a control character, e.g. `send_control('a')` for Ctrl-A.
    pub fn send_control(&mut self, c: char) -> Result<()> {
        let byte = (c.to_ascii_uppercase() as u8) & 0x1f;
        self.send(&[byte])
    }

    /// Blocks until `pattern` appears in the incoming stream or `timeout`
    /// elapses. Returns everything consumed up to and including the
    /// match; bytes after the match stay buffered for the next call.
    pub fn expect(&mut self, pattern: &str, timeout: Duration) -> Result<String> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(end) = match_end(&self.buffer, pattern) {
                return Ok(self.consume(end));
            }
            self.fill(pattern, deadline)?;
        }
    }

    /// Like [`Console::expect`], for a set of candidate patterns. Returns
    /// the index of the first pattern found and the consumed text.
    pub fn expect_any(&mut self, patterns: &[&str], timeout: Duration) -> Result<(usize, String)> {
        let deadline = Instant::now() + timeout;
        let joined = patterns.join(", ");
        loop {
            for (i, pattern) in patterns.iter().enumerate() {
                if let Some(end) = match_end(&self.buffer, pattern) {
                    return Ok((i, self.consume(end)));
                }
            }
            self.fill(&joined, deadline)?;
        }
    }

    fn consume(&mut self, end: usize) -> String {
        let rest = self.buffer.split_off(end);
        std::mem::replace(&mut self.buffer, rest)
    }

    /// Reads at least one more chunk into the buffer, or fails once
    /// `deadline` passes. `pattern` is only used to label the error.
    fn fill(&mut self, pattern: &str, deadline: Instant) -> Result<()> {
        let mut buf = [0u8; 4096];
        loop {
            if Instant::now() >= deadline {
                return Err(Error::Timeout {
                    pattern: pattern.to_string(),
                });
            }

            let ready = {
                let mut fds = [PollFd::new(self.master.as_fd(), PollFlags::POLLIN)];
                match poll(&mut fds, PollTimeout::from(POLL_SLICE_MS)) {
                    Ok(n) => n,
                    Err(nix::errno::Errno::EINTR) => continue,
                    Err(e) => return Err(std::io::Error::other(e).into()),
                }
            };
            if ready == 0 {
                continue;
            }

            match self.master.read(&mut buf) {
                // A pty master reads 0 or EIO once the slave side is gone.
                Ok(0) => {
                    return Err(Error::ConsoleClosed {
                        pattern: pattern.to_string(),
                    });
                }
                Ok(n) => {
                    self.buffer.push_str(&String::from_utf8_lossy(&buf[..n]));
                    return Ok(());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) if e.raw_os_error() == Some(nix::errno::Errno::EIO as i32) => {
                    return Err(Error::ConsoleClosed {
                        pattern: pattern.to_string(),
                    });
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

fn match_end(buffer: &str, pattern: &str) -> Option<usize> {
    buffer.find(pattern).map(|pos| pos + pattern.len())
}

struct Pty {
    master: OwnedFd,
    slave: OwnedFd,
}

impl Pty {
    fn new() -> std::io::Result<Self> {
        let OpenptyResult { master, slave } = openpty(None, None).map_err(std::io::Error::other)?;

        use std::os::fd::BorrowedFd;
        // SAFETY: slave is a valid OwnedFd from openpty(), so its raw fd
        // is valid. The borrow is used only while slave remains alive.
        let slave_fd = unsafe { BorrowedFd::borrow_raw(slave.as_raw_fd()) };
        if let Ok(mut termios) = termios::tcgetattr(slave_fd) {
            termios.input_flags.remove(InputFlags::IGNBRK);
            termios.input_flags.remove(InputFlags::BRKINT);
            termios.input_flags.remove(InputFlags::PARMRK);
            termios.input_flags.remove(InputFlags::ISTRIP);
            termios.input_flags.remove(InputFlags::INLCR);
            termios.input_flags.remove(InputFlags::IGNCR);
            termios.input_flags.remove(InputFlags::ICRNL);
            termios.input_flags.remove(InputFlags::IXON);

            termios.output_flags.insert(OutputFlags::OPOST);
            termios.output_flags.insert(OutputFlags::ONLCR);

            termios.local_flags.remove(LocalFlags::ECHO);
            termios.local_flags.remove(LocalFlags::ECHONL);
            termios.local_flags.remove(LocalFlags::ICANON);
            termios.local_flags.remove(LocalFlags::ISIG);
            termios.local_flags.remove(LocalFlags::IEXTEN);

            termios.control_flags.remove(ControlFlags::CSIZE);
            termios.control_flags.remove(ControlFlags::PARENB);
            termios.control_flags.insert(ControlFlags::CS8);

            let _ = termios::tcsetattr(slave_fd, SetArg::TCSANOW, &termios);
        }

        Ok(Self { master, slave })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spawn_sh(script: &str) -> (Console, Child) {
        let mut command = Command::new("sh");
        command.args(["-c", script]);
        Console::spawn(command).unwrap()
    }

    #[test]
    fn expect_returns_all_consumed_text() {
        let (mut console, mut child) = spawn_sh("printf 'boot ok\\niotsuite login: '");
        let captured = console
            .expect("login: ", Duration::from_secs(5))
            .unwrap();
        assert!(captured.contains("boot ok"));
        assert!(captured.ends_with("login: "));
        child.wait().unwrap();
    }

    #[test]
    fn expect_leaves_trailing_bytes_buffered() {
        let (mut console, mut child) = spawn_sh("printf 'one two three'");
        let captured = console.expect("one ", Duration::from_secs(5)).unwrap();
        assert_eq!(captured, "one ");
        let rest = console.expect("three", Duration::from_secs(5)).unwrap();
        assert_eq!(rest, "two three");
        child.wait().unwrap();
    }

    #[test]
    fn expect_times_out_when_pattern_never_appears() {
        let (mut console, mut child) = spawn_sh("sleep 5");
        let started = Instant::now();
        let err = console
            .expect("never", Duration::from_millis(200))
            .unwrap_err();
        assert!(started.elapsed() >= Duration::from_millis(200));
        assert!(matches!(err, Error::Timeout { pattern } if pattern == "never"));
        child.kill().unwrap();
        child.wait().unwrap();
    }

    #[test]
    fn send_line_reaches_the_subprocess() {
        let (mut console, mut child) = spawn_sh("read line; printf 'got %s\\n' \"$line\"");
        console.send_line("ping").unwrap();
        let captured = console.expect("got ping", Duration::from_secs(5)).unwrap();
        assert!(captured.contains("got ping"));
        child.wait().unwrap();
    }

    #[test]
    fn expect_any_reports_which_pattern_matched() {
        let (mut console, mut child) = spawn_sh("printf 'Login incorrect\\n'");
        let (matched, captured) = console
            .expect_any(&["# ", "Login incorrect"], Duration::from_secs(5))
            .unwrap();
        assert_eq!(matched, 1);
        assert!(captured.contains("Login incorrect"));
        child.wait().unwrap();
    }

    #[test]
    fn closed_console_is_distinguished_from_timeout() {
        let (mut console, mut child) = spawn_sh("exit 0");
        let err = console.expect("never", Duration::from_secs(5)).unwrap_err();
        assert!(matches!(err, Error::ConsoleClosed { .. }));
        child.wait().unwrap();
    }
}
