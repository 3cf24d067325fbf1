//! Pseudo-terminal shells for the interactive gateway.

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use std::fs::File;
use std::os::fd::AsRawFd;
use std::os::unix::process::CommandExt;
use std::process::{Child, Command, Stdio};
use thiserror::Error;
use tracing::{debug, info, warn};

use super::runner::{CommandRunner, CommandSpec};

nix::ioctl_write_ptr_bad!(set_window_size, nix::libc::TIOCSWINSZ, Winsize);

/// Leading byte of an inbound frame carrying `<rows>,<cols>`.
pub const RESIZE_PREFIX: u8 = 0x01;

#[derive(Debug, Error)]
pub enum PtyError {
    #[error("Failed to open pseudo-terminal: {0}")]
    Open(nix::Error),
    #[error("Failed to spawn shell: {0}")]
    Spawn(std::io::Error),
    #[error("Failed to resize terminal: {0}")]
    Resize(nix::Error),
    #[error("Refusing to start a shell for {0}: simulate mode cannot drop privileges")]
    Refused(String),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Identity the shell process runs as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShellIdentity {
    /// Keep the daemon's own credentials (root in production).
    Root,
    /// Switch to this uid/gid before exec.
    User { uid: u32, gid: u32 },
}

#[derive(Debug, Clone)]
pub struct ShellLaunch {
    pub username: String,
    /// Home directory as it exists on this host.
    pub home: String,
    pub identity: ShellIdentity,
    pub rows: u16,
    pub cols: u16,
}

/// A running `bash -l` attached to the slave side of a pty.
pub struct PtySession {
    master: File,
    child: Child,
}

impl CommandRunner {
    /// Spawn a login shell inside a new pseudo-terminal.
    ///
    /// In simulate mode the shell keeps the daemon's identity, since the
    /// simulated uid/gid do not exist. A user shell is then only allowed
    /// when that identity is unprivileged.
    pub fn spawn_shell(&self, launch: &ShellLaunch) -> Result<PtySession, PtyError> {
        let identity = match launch.identity {
            ShellIdentity::User { .. } if self.is_simulated() => {
                if nix::unistd::Uid::effective().is_root() {
                    warn!(user = %launch.username, "Simulated user shell refused while running as root");
                    return Err(PtyError::Refused(launch.username.clone()));
                }
                ShellIdentity::Root
            }
            identity => identity,
        };

        let spec = CommandSpec::new("bash")
            .arg("-l")
            .for_user(&launch.username, &launch.home)
            .env("SHELL", "/bin/bash")
            .env("TERM", "xterm-256color")
            .env("LC_ALL", "C.UTF-8");

        let winsize = Winsize {
            ws_row: launch.rows,
            ws_col: launch.cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let pty = openpty(Some(&winsize), None).map_err(PtyError::Open)?;

        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .env_clear()
            .envs(spec.base_env())
            .current_dir(&launch.home)
            .stdin(Stdio::from(pty.slave.try_clone()?))
            .stdout(Stdio::from(pty.slave.try_clone()?))
            .stderr(Stdio::from(pty.slave));

        if self.is_simulated() {
            self.record(&spec);
        }

        if let ShellIdentity::User { uid, gid } = identity {
            // std applies setgroups([]), setgid and setuid together in the
            // child before exec; both ids are always set.
            cmd.uid(uid).gid(gid);
        }

        // SAFETY: only async-signal-safe calls (setsid, ioctl) run between
        // fork and exec.
        unsafe {
            cmd.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                if nix::libc::ioctl(0, nix::libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(PtyError::Spawn)?;
        info!(
            user = %launch.username,
            pid = child.id(),
            privileged = matches!(identity, ShellIdentity::Root) && nix::unistd::Uid::effective().is_root(),
            "Shell session started"
        );

        Ok(PtySession {
            master: File::from(pty.master),
            child,
        })
    }
}

impl PtySession {
    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Independent handle for reading terminal output.
    pub fn reader(&self) -> Result<File, PtyError> {
        Ok(self.master.try_clone()?)
    }

    /// Independent handle for writing terminal input.
    pub fn writer(&self) -> Result<File, PtyError> {
        Ok(self.master.try_clone()?)
    }

    pub fn resize(&self, rows: u16, cols: u16) -> Result<(), PtyError> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        // SAFETY: the fd is an open pty master and winsize outlives the call.
        unsafe { set_window_size(self.master.as_raw_fd(), &winsize) }
            .map_err(PtyError::Resize)?;
        debug!(rows, cols, "Terminal resized");
        Ok(())
    }

    /// Kill the shell's whole process group and reap it.
    pub fn kill(&mut self) {
        let pid = self.child.id() as i32;
        if let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
            debug!(pid, error = %e, "killpg failed, falling back to kill");
            let _ = self.child.kill();
        }
        if let Err(e) = self.child.wait() {
            warn!(pid, error = %e, "Failed to reap shell process");
        }
    }

    /// Non-blocking check whether the shell has exited.
    pub fn has_exited(&mut self) -> bool {
        matches!(self.child.try_wait(), Ok(Some(_)))
    }
}

/// Parse an inbound frame. Returns `Some((rows, cols))` for a resize frame.
pub fn parse_resize(frame: &[u8]) -> Option<(u16, u16)> {
    let body = frame.strip_prefix(&[RESIZE_PREFIX])?;
    let text = std::str::from_utf8(body).ok()?;
    let (rows, cols) = text.trim().split_once(',')?;
    let rows = rows.trim().parse::<u16>().ok()?;
    let cols = cols.trim().parse::<u16>().ok()?;
    if rows == 0 || cols == 0 {
        return None;
    }
    Some((rows, cols))
}

/// True when a frame is an out-of-band control message and must not be
/// forwarded to the terminal.
pub fn is_control_frame(frame: &[u8]) -> bool {
    frame.first() == Some(&RESIZE_PREFIX)
}
