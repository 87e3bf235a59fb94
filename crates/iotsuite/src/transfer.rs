//! Client for the file-transfer service running on the sandbox images.
//!
//! The guest runs a small TCP server speaking a newline-delimited text
//! protocol: the server greets with `HI\n<version>\n<cwd>\n<user>\n<euid>`,
//! the client sends a command (`GET`, `PUT`, `DEL`, `BYE`) with its
//! arguments joined by newlines, and file contents move over a separate
//! data connection whose port the server announces in its `200 AIGT`
//! reply. Errors come back as numbered `3xx` lines.

use std::fs::File;
use std::io::{Read, Write};
use std::net::TcpStream;
use std::path::Path;
use std::thread;
use std::time::Duration;

use tracing::debug;

use iotsuite_core::{Error, Result};

const ACK: &[u8] = b"100 ACK";
const OK_PREFIX: &str = "200";
const CONNECT_TRIES: u32 = 5;
const RETRY_WAIT: Duration = Duration::from_millis(500);
const IO_TIMEOUT: Duration = Duration::from_secs(120);

/// Greeting sent by the transfer server on every connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Welcome {
    pub version: String,
    pub cwd: String,
    pub user: String,
    pub euid: u32,
}

/// Client for the guest's file-transfer service.
pub struct FtClient {
    host: String,
    port: u16,
}

impl FtClient {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Downloads `filename` from the guest into `dest` on the host.
    /// Fails if `dest` already exists. Returns the number of bytes
    /// received.
    pub fn get(&self, filename: &str, dest: impl AsRef<Path>) -> Result<u64> {
        let dest = dest.as_ref();
        if dest.exists() {
            return Err(Error::Transfer(format!(
                "destination already exists: {}",
                dest.display()
            )));
        }

        let mut control = self.connect(self.port)?;
        let _ = read_welcome(&mut control)?;

        control.write_all(format!("GET\n{filename}").as_bytes())?;
        let params = self.read_params(&mut control)?;
        let fields: Vec<&str> = params.split('\n').collect();
        if fields.len() < 3 {
            return Err(Error::Transfer(format!("malformed GET reply: '{params}'")));
        }
        let port = parse_field(fields[1], "data port")?;
        let size: u64 = parse_field(fields[2], "file size")?;

        debug!(port, size, "receiving file");
        control.write_all(ACK)?;

        let mut data = self.connect(port)?;
        let mut file = File::create(dest)?;
        let mut buf = vec![0u8; blocksize(size)];
        let mut received = 0u64;
        while received < size {
            let n = data.read(&mut buf)?;
            if n == 0 {
                return Err(Error::Transfer(
                    "data connection closed before transfer completed".to_string(),
                ));
            }
            file.write_all(&buf[..n])?;
            received += n as u64;
        }
        drop(data);

        control.write_all(ACK)?;
        let done = read_chunk(&mut control, 8)?;
        eval_result(&done)?;

        debug!(received, "file transfer complete");
        Ok(received)
    }

    /// Uploads the file at `path` to the guest under its base name.
    /// Returns the number of bytes sent.
    pub fn put(&self, path: impl AsRef<Path>) -> Result<u64> {
        let path = path.as_ref();
        let name = path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Transfer(format!("unusable file name: {}", path.display())))?;
        let mut file = File::open(path)?;
        let size = file.metadata()?.len();

        let mut control = self.connect(self.port)?;
        let _ = read_welcome(&mut control)?;

        control.write_all(format!("PUT\n{name}\n{size}").as_bytes())?;
        let params = self.read_params(&mut control)?;
        let fields: Vec<&str> = params.split('\n').collect();
        if fields.len() < 2 {
            return Err(Error::Transfer(format!("malformed PUT reply: '{params}'")));
        }
        let port = parse_field(fields[1], "data port")?;

        debug!(port, size, "sending file");
        control.write_all(ACK)?;

        let mut data = self.connect(port)?;
        let mut buf = vec![0u8; blocksize(size)];
        let mut sent = 0u64;
        while sent < size {
            let n = file.read(&mut buf)?;
            if n == 0 {
                break;
            }
            data.write_all(&buf[..n])?;
            sent += n as u64;
        }
        drop(data);

        let done = read_chunk(&mut control, 8)?;
        eval_result(&done)?;

        debug!(sent, "file transfer complete");
        Ok(sent)
    }

    /// Deletes `filename` on the guest.
    pub fn delete(&self, filename: &str) -> Result<()> {
        let mut control = self.connect(self.port)?;
        let _ = read_welcome(&mut control)?;

        control.write_all(format!("DEL\n{filename}").as_bytes())?;
        let res = read_chunk(&mut control, 8)?;
        eval_result(&res)
    }

    /// Tells the server to shut down.
    pub fn bye(&self) -> Result<()> {
        let mut control = self.connect(self.port)?;
        let _ = read_welcome(&mut control)?;

        control.write_all(b"BYE")?;
        let res = read_chunk(&mut control, 8)?;
        eval_result(&res)
    }

    fn connect(&self, port: u16) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.host, port);
        let mut last_err = None;
        for attempt in 0..CONNECT_TRIES {
            match TcpStream::connect(&addr) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(IO_TIMEOUT))?;
                    stream.set_write_timeout(Some(IO_TIMEOUT))?;
                    return Ok(stream);
                }
                Err(e) => {
                    last_err = Some(e);
                    if attempt + 1 < CONNECT_TRIES {
                        thread::sleep(RETRY_WAIT);
                    }
                }
            }
        }
        Err(Error::Transfer(format!(
            "could not connect to {addr}: {}",
            last_err.map_or_else(|| "unknown error".to_string(), |e| e.to_string())
        )))
    }

    /// Reads a command reply; a `3xx` reply is acknowledged and turned
    /// into the matching server error.
    fn read_params(&self, control: &mut TcpStream) -> Result<String> {
        let params = read_chunk(control, 32)?;
        if !params.starts_with(OK_PREFIX) {
            control.write_all(ACK)?;
            return Err(server_error(&params));
        }
        Ok(params)
    }
}

fn read_welcome(control: &mut TcpStream) -> Result<Welcome> {
    let raw = read_chunk(control, 512)?;
    let fields: Vec<&str> = raw.split('\n').collect();
    if fields.first() != Some(&"HI") || fields.len() < 5 {
        return Err(Error::Transfer(format!("unexpected welcome: '{raw}'")));
    }
    Ok(Welcome {
        version: fields[1].to_string(),
        cwd: fields[2].to_string(),
        user: fields[3].to_string(),
        euid: parse_field(fields[4], "euid")?,
    })
}

fn read_chunk(stream: &mut TcpStream, max: usize) -> Result<String> {
    let mut buf = vec![0u8; max];
    let n = stream.read(&mut buf)?;
    if n == 0 {
        return Err(Error::Transfer("connection closed by server".to_string()));
    }
    Ok(String::from_utf8_lossy(&buf[..n]).into_owned())
}

fn parse_field<T: std::str::FromStr>(field: &str, what: &str) -> Result<T> {
    field
        .trim()
        .parse()
        .map_err(|_| Error::Transfer(format!("malformed {what}: '{field}'")))
}

fn eval_result(res: &str) -> Result<()> {
    if res.starts_with(OK_PREFIX) {
        Ok(())
    } else if res.starts_with('3') {
        Err(server_error(res))
    } else {
        Err(Error::Transfer(format!("unknown server response: '{res}'")))
    }
}

fn server_error(res: &str) -> Error {
    let code: u16 = res.get(..3).and_then(|c| c.parse().ok()).unwrap_or(308);
    let message = match code {
        301 => "permission denied",
        302 => "no such file or directory",
        303 => "not a directory",
        304 => "file is currently in use",
        305 => "unsupported command",
        306 => "invalid arguments specified",
        307 => "file already exists on server",
        309 => "is a directory",
        _ => "unknown error",
    };
    Error::TransferServer {
        code,
        message: message.to_string(),
    }
}

/// Block size scaled to the transfer size, mirroring the server side.
fn blocksize(size: u64) -> usize {
    if size < 4096 {
        1024
    } else if size < 8192 {
        2048
    } else if size < 16384 {
        4096
    } else {
        8192
    }
}
