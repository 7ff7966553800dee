//! Key-log pipes
//!
//! A traced process that can export its session secrets gets the write end
//! of an OS pipe plus an environment variable naming it
//! (`SSLKEYLOGFILE=/proc/self/fd/<n>`). A reader thread forwards every line
//! it writes into the trace as a decryption secrets block.

use nettrace_core::{Error, Result};
use nettrace_pcapng::SecretsKind;
use nix::fcntl::{fcntl, FcntlArg, FdFlag, OFlag};
use nix::unistd::pipe2;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd};
use std::thread;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::scheduler::Command;

/// Write end of a key-log pipe, to be inherited by a child process
#[derive(Debug)]
pub struct KeyLogPipe {
    kind: SecretsKind,
    write_end: OwnedFd,
}

impl KeyLogPipe {
    /// Create the pipe and start forwarding what arrives on it
    pub(crate) fn open(kind: SecretsKind, commands: UnboundedSender<Command>) -> Result<Self> {
        let (read_end, write_end) = pipe2(OFlag::O_CLOEXEC)
            .map_err(|e| Error::capture(format!("failed to create {} key-log pipe: {}", kind, e)))?;

        // Only the write end survives exec
        fcntl(write_end.as_raw_fd(), FcntlArg::F_SETFD(FdFlag::empty()))
            .map_err(|e| Error::capture(format!("failed to make key-log pipe inheritable: {}", e)))?;

        thread::Builder::new()
            .name(format!("keylog-{}", kind))
            .spawn(move || forward_lines(kind, File::from(read_end), commands))?;

        info!(kind = %kind, fd = write_end.as_raw_fd(), "Key-log pipe opened");
        Ok(Self { kind, write_end })
    }

    pub fn kind(&self) -> SecretsKind {
        self.kind
    }

    /// Descriptor number a child inherits
    pub fn fd(&self) -> i32 {
        self.write_end.as_raw_fd()
    }

    /// Environment entry telling a child where to write its keys
    pub fn env(&self) -> (&'static str, String) {
        (self.kind.env_var(), format!("/proc/self/fd/{}", self.fd()))
    }

    /// `NAME=/proc/self/fd/<n>`
    pub fn env_string(&self) -> String {
        let (name, value) = self.env();
        format!("{}={}", name, value)
    }

    /// Give up the write end, e.g. to hand it to a child explicitly
    pub fn into_write_end(self) -> OwnedFd {
        self.write_end
    }
}

impl AsFd for KeyLogPipe {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.write_end.as_fd()
    }
}

/// Forward each line until every write end is closed
fn forward_lines(kind: SecretsKind, pipe: File, commands: UnboundedSender<Command>) {
    let mut reader = BufReader::new(pipe);
    let mut line = Vec::new();
    let mut forwarded = 0u64;

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                if line.iter().all(u8::is_ascii_whitespace) {
                    continue;
                }
                if commands
                    .send(Command::Secrets(kind, line.clone()))
                    .is_err()
                {
                    debug!(kind = %kind, "Session closed, dropping key-log lines");
                    break;
                }
                forwarded += 1;
            }
            Err(e) => {
                warn!(kind = %kind, error = %e, "Failed to read key-log pipe");
                break;
            }
        }
    }

    debug!(kind = %kind, lines = forwarded, "Key-log pipe closed");
}
