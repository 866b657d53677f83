//! Running a command on the local host with its stdio wired to an [`ExecIo`].
//!
//! Two spawn modes: plain pipes, or a PTY when the session asked for a
//! terminal (see [`super::pty`]). Either way the child leads its own process
//! group so cancellation can kill everything it started.

use std::os::fd::OwnedFd;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;

use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::pty;
use crate::cluster::{BoxReader, ClusterError, ExecIo, TerminalSizeQueue};
use crate::protocol::TerminalSize;

/// Size of a fresh PTY before the first resize arrives.
const DEFAULT_TERMINAL: TerminalSize = TerminalSize {
    width: 80,
    height: 24,
};

/// Run `argv` in `working_dir` until it exits or `cancel` fires.
///
/// Returns the exit code, `-1` when the process died from a signal
/// (including the kill issued on cancellation). All output has been written
/// to `io` by the time this returns.
pub async fn run(
    argv: Vec<String>,
    working_dir: &str,
    tty: bool,
    io: ExecIo,
    cancel: CancellationToken,
) -> Result<i32, ClusterError> {
    let Some((program, args)) = argv.split_first() else {
        return Err(ClusterError::Internal("empty command".to_string()));
    };
    if tty {
        run_tty(program, args, working_dir, io, cancel).await
    } else {
        run_piped(program, args, working_dir, io, cancel).await
    }
}

async fn run_piped(
    program: &str,
    args: &[String],
    working_dir: &str,
    io: ExecIo,
    cancel: CancellationToken,
) -> Result<i32, ClusterError> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .current_dir(working_dir)
        .stdin(if io.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // SAFETY: setpgid is async-signal-safe per POSIX.
    unsafe {
        cmd.pre_exec(|| {
            libc::setpgid(0, 0);
            Ok(())
        });
    }
    let mut child = cmd.spawn()?;

    let feeder = match (io.stdin, child.stdin.take()) {
        (Some(src), Some(dst)) => Some(spawn_feeder(src, dst)),
        _ => None,
    };
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| ClusterError::Internal("stdout pipe missing".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| ClusterError::Internal("stderr pipe missing".to_string()))?;
    let mut out_w = io.stdout;
    let mut err_w = io.stderr;
    let pump = tokio::spawn(async move {
        let _ = tokio::join!(pump(stdout, &mut out_w), pump(stderr, &mut err_w));
    });

    let status = wait_or_kill(&mut child, &cancel).await?;
    finish(pump, &cancel).await;
    if let Some(feeder) = feeder {
        feeder.abort();
    }
    Ok(exit_code(status))
}

async fn run_tty(
    program: &str,
    args: &[String],
    working_dir: &str,
    io: ExecIo,
    cancel: CancellationToken,
) -> Result<i32, ClusterError> {
    let pair = pty::open(DEFAULT_TERMINAL).map_err(|e| ClusterError::Internal(e.to_string()))?;
    let mut child = pty::spawn(&pair, program, args, working_dir)?;
    let master = Arc::new(pair.master);
    // Our copy of the slave must go, or reads on the master never see EOF.
    drop(pair.slave);

    let resizer = io.resize.map(|queue| spawn_resizer(queue, Arc::clone(&master)));
    let feeder = match io.stdin {
        Some(src) => Some(spawn_feeder(src, pty::handle(&master)?)),
        None => None,
    };
    let reader = pty::handle(&master)?;
    let mut out_w = io.stdout;
    // stderr shares the terminal with stdout.
    drop(io.stderr);
    let pump = tokio::spawn(async move {
        pump(reader, &mut out_w).await;
    });

    let status = wait_or_kill(&mut child, &cancel).await?;
    finish(pump, &cancel).await;
    for task in [feeder, resizer].into_iter().flatten() {
        task.abort();
    }
    Ok(exit_code(status))
}

async fn wait_or_kill(child: &mut Child, cancel: &CancellationToken) -> Result<ExitStatus, ClusterError> {
    let waited = tokio::select! {
        status = child.wait() => Some(status?),
        () = cancel.cancelled() => None,
    };
    if let Some(status) = waited {
        return Ok(status);
    }
    debug!(pid = child.id(), "session cancelled, killing process group");
    if let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) {
        let _ = killpg(Pid::from_raw(pid), Signal::SIGKILL);
    }
    child.kill().await.ok();
    Ok(child.wait().await?)
}

/// Let the output pump drain after a normal exit; drop it on cancellation.
async fn finish(pump: JoinHandle<()>, cancel: &CancellationToken) {
    if cancel.is_cancelled() {
        pump.abort();
        return;
    }
    tokio::select! {
        _ = pump => {}
        () = cancel.cancelled() => {}
    }
}

async fn pump<R>(mut src: R, dst: &mut (impl AsyncWrite + Unpin))
where
    R: AsyncRead + Unpin,
{
    match tokio::io::copy(&mut src, dst).await {
        Ok(_) => {}
        // A PTY master reports EIO once the last slave fd closes.
        Err(e) if e.raw_os_error() == Some(libc::EIO) => {}
        Err(e) => debug!(error = %e, "output copy stopped"),
    }
    let _ = dst.flush().await;
}

fn spawn_feeder<W>(mut src: BoxReader, mut dst: W) -> JoinHandle<()>
where
    W: AsyncWrite + Send + Unpin + 'static,
{
    tokio::spawn(async move {
        if let Err(e) = tokio::io::copy(&mut src, &mut dst).await {
            debug!(error = %e, "stdin copy stopped");
        }
        // EOF for the process.
        let _ = dst.shutdown().await;
    })
}

fn spawn_resizer(mut queue: TerminalSizeQueue, master: Arc<OwnedFd>) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(size) = queue.next().await {
            if let Err(e) = pty::resize(&master, size) {
                warn!(error = %e, "terminal resize failed");
            }
        }
    })
}

fn exit_code(status: ExitStatus) -> i32 {
    status.code().unwrap_or(-1)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncReadExt};

    fn argv(parts: &[&str]) -> Vec<String> {
        parts.iter().map(|s| (*s).to_string()).collect()
    }

    async fn collect(mut r: tokio::io::DuplexStream) -> String {
        let mut out = String::new();
        r.read_to_string(&mut out).await.unwrap();
        out
    }

    fn io_with(stdin: Option<BoxReader>) -> (ExecIo, tokio::io::DuplexStream, tokio::io::DuplexStream) {
        let (out_w, out_r) = duplex(64 * 1024);
        let (err_w, err_r) = duplex(64 * 1024);
        let io = ExecIo {
            stdin,
            stdout: Box::new(out_w),
            stderr: Box::new(err_w),
            resize: None,
        };
        (io, out_r, err_r)
    }

    #[tokio::test]
    async fn captures_output_and_exit_code() {
        let (io, out, err) = io_with(None);
        let code = run(
            argv(&["sh", "-c", "echo out; echo err >&2; exit 3"]),
            "/",
            false,
            io,
            CancellationToken::new(),
        )
        .await
        .unwrap();
        assert_eq!(code, 3);
        assert_eq!(collect(out).await, "out\n");
        assert_eq!(collect(err).await, "err\n");
    }

    #[tokio::test]
    async fn stdin_reaches_the_process() {
        let (mut stdin_w, stdin_r) = duplex(1024);
        let (io, out, _err) = io_with(Some(Box::new(stdin_r)));
        let task = tokio::spawn(run(argv(&["cat"]), "/", false, io, CancellationToken::new()));
        stdin_w.write_all(b"ping\n").await.unwrap();
        drop(stdin_w);
        assert_eq!(task.await.unwrap().unwrap(), 0);
        assert_eq!(collect(out).await, "ping\n");
    }

    #[tokio::test]
    async fn cancellation_kills_the_process() {
        let (io, _out, _err) = io_with(None);
        let cancel = CancellationToken::new();
        let task = tokio::spawn(run(argv(&["sleep", "30"]), "/", false, io, cancel.clone()));
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;
        cancel.cancel();
        let code = tokio::time::timeout(std::time::Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        assert_eq!(code, -1);
    }

    #[tokio::test]
    async fn missing_program_is_an_error() {
        let (io, _out, _err) = io_with(None);
        let result = run(
            argv(&["/nonexistent/leasegw-test-binary"]),
            "/",
            false,
            io,
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(ClusterError::Io(_))));
    }
}
