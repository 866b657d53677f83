//! PTY allocation, spawning on the slave side, and terminal resize.
//!
//! Uses the `nix` crate for POSIX PTY APIs. The master fd stays open for the
//! whole exec so output can be read from it and resizes applied to it.

use std::os::fd::{AsRawFd, OwnedFd};
use std::process::Stdio;

use nix::pty::{openpty, OpenptyResult, Winsize};
use tokio::process::{Child, Command};

use crate::protocol::TerminalSize;

/// An allocated PTY pair (master + slave).
pub struct PtyPair {
    pub master: OwnedFd,
    pub slave: OwnedFd,
}

fn winsize(size: TerminalSize) -> Winsize {
    Winsize {
        ws_row: size.height,
        ws_col: size.width,
        ws_xpixel: 0,
        ws_ypixel: 0,
    }
}

pub fn open(size: TerminalSize) -> Result<PtyPair, nix::Error> {
    let OpenptyResult { master, slave } = openpty(&winsize(size), None)?;
    Ok(PtyPair { master, slave })
}

/// Spawn `program` with the PTY slave as its controlling terminal and stdio.
///
/// The child becomes a session leader, so its pid is also its process group.
pub fn spawn(
    pty: &PtyPair,
    program: &str,
    args: &[String],
    working_dir: &str,
) -> std::io::Result<Child> {
    let slave_fd = pty.slave.as_raw_fd();
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .env("TERM", "xterm-256color")
        .kill_on_drop(true);

    // stdio is wired by pre_exec below.
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    // SAFETY: All syscalls used here are async-signal-safe per POSIX.
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
}

/// Async handle over a duplicate of the master fd. Reads return terminal
/// output; writes become terminal input.
pub fn handle(master: &OwnedFd) -> std::io::Result<tokio::fs::File> {
    Ok(tokio::fs::File::from_std(std::fs::File::from(
        master.try_clone()?,
    )))
}

pub fn resize(master: &OwnedFd, size: TerminalSize) -> Result<(), nix::Error> {
    let ws = winsize(size);
    // SAFETY: TIOCSWINSZ reads a Winsize struct from the given pointer.
    let ret = unsafe { libc::ioctl(master.as_raw_fd(), libc::TIOCSWINSZ, std::ptr::addr_of!(ws)) };
    if ret == -1 {
        Err(nix::Error::last())
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn read_winsize(fd: &OwnedFd) -> Winsize {
        let mut ws = Winsize {
            ws_row: 0,
            ws_col: 0,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };
        let ret = unsafe { libc::ioctl(fd.as_raw_fd(), libc::TIOCGWINSZ, std::ptr::addr_of_mut!(ws)) };
        assert_eq!(ret, 0);
        ws
    }

    #[test]
    fn open_and_resize() {
        let pair = open(TerminalSize::new(80, 24)).unwrap();
        let ws = read_winsize(&pair.slave);
        assert_eq!((ws.ws_col, ws.ws_row), (80, 24));

        resize(&pair.master, TerminalSize::new(132, 50)).unwrap();
        let ws = read_winsize(&pair.slave);
        assert_eq!((ws.ws_col, ws.ws_row), (132, 50));
    }
}
