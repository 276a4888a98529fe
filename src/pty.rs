//! PTY allocation, process spawn, and terminal resize.
//!
//! POSIX-only (Linux target). Allocation goes through `openpty(2)` via the
//! `nix` crate; the spawned child becomes its own session leader with the
//! PTY slave wired up as its controlling terminal so that signaling its
//! process group reaches the whole tree it may have forked.

use std::collections::HashMap;
use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

use crate::error::SessionError;

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

/// Allocate a PTY pair with the given terminal size.
pub fn allocate(cols: u16, rows: u16) -> Result<PtyPair, SessionError> {
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    let OpenptyResult { master, slave } =
        openpty(&winsize, None).map_err(|e| SessionError::SpawnFailed(e.to_string()))?;
    Ok(PtyPair { master, slave })
}

/// Spawn `argv[0]` with `argv[1..]` as arguments on the slave side of `pty`.
///
/// The child becomes a session leader with the PTY slave as its controlling
/// terminal; stdin/stdout/stderr are all connected to the slave fd via
/// `pre_exec`, not via tokio's own `Stdio` plumbing.
pub fn spawn(
    pty: &PtyPair,
    argv: &[String],
    cwd: &str,
    env: Option<&HashMap<String, String>>,
) -> Result<Child, SessionError> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| SessionError::SpawnFailed("empty command".into()))?;

    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(program);
    cmd.args(args).current_dir(cwd).kill_on_drop(true);

    // pre_exec handles real stdio redirection; tell tokio not to set up pipes.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut vars = env.cloned().unwrap_or_default();
    vars.entry("TERM".to_string())
        .or_insert_with(|| "xterm-256color".to_string());
    cmd.envs(&vars);

    // SAFETY: setsid/ioctl/dup2/close are async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(move || {
            if libc::setsid() == -1 {
                return Err(std::io::Error::last_os_error());
            }
            if libc::ioctl(slave_fd, libc::TIOCSCTTY, 0) == -1 {
                return Err(std::io::Error::last_os_error());
            }
            libc::dup2(slave_fd, 0);
            libc::dup2(slave_fd, 1);
            libc::dup2(slave_fd, 2);
            if slave_fd > 2 {
                libc::close(slave_fd);
            }
            Ok(())
        });
    }

    cmd.spawn()
        .map_err(|e| SessionError::SpawnFailed(e.to_string()))
}

/// Resize a PTY's terminal window. Safe to call concurrently with ongoing
/// reads/writes on the same master fd.
pub fn resize(master: &OwnedFd, cols: u16, rows: u16) -> Result<(), SessionError> {
    if cols == 0 || rows == 0 || cols > 4096 || rows > 4096 {
        return Err(SessionError::InvalidDimensions {
            cols: u32::from(cols),
            rows: u32::from(rows),
        });
    }
    let winsize = Winsize {
        ws_row: rows,
        ws_col: cols,
        ws_xpixel: 0,
        ws_ypixel: 0,
    };
    // SAFETY: TIOCSWINSZ is a well-defined ioctl that writes a Winsize struct.
    let ret = unsafe {
        libc::ioctl(
            master.as_raw_fd(),
            libc::TIOCSWINSZ,
            std::ptr::addr_of!(winsize),
        )
    };
    if ret == -1 {
        Err(SessionError::SpawnFailed(
            std::io::Error::last_os_error().to_string(),
        ))
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_succeeds_with_reasonable_size() {
        let pty = allocate(80, 24).expect("openpty should succeed");
        assert!(pty.master.as_raw_fd() >= 0);
        assert!(pty.slave.as_raw_fd() >= 0);
    }

    #[test]
    fn resize_rejects_zero_dimensions() {
        let pty = allocate(80, 24).unwrap();
        assert!(matches!(
            resize(&pty.master, 0, 24),
            Err(SessionError::InvalidDimensions { .. })
        ));
        assert!(matches!(
            resize(&pty.master, 80, 0),
            Err(SessionError::InvalidDimensions { .. })
        ));
    }

    #[test]
    fn resize_accepts_valid_dimensions() {
        let pty = allocate(80, 24).unwrap();
        resize(&pty.master, 120, 40).expect("resize should succeed");
    }
}
