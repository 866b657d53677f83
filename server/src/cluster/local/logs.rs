//! Log sources backed by files on the local host.
//!
//! Each source is fed by a task that copies the file (or its last `tail`
//! lines) into an in-memory pipe and, when following, polls for appended
//! data. Dropping the [`LogSource`] closes the pipe and stops the task.

use std::io::SeekFrom;
use std::path::PathBuf;
use std::time::Duration;

use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, BufReader, DuplexStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cluster::LogSource;

const PIPE_CAPACITY: usize = 16 * 1024;
const POLL_INTERVAL: Duration = Duration::from_millis(250);

pub fn tail_file(
    name: String,
    path: PathBuf,
    tail: Option<u64>,
    follow: bool,
    cancel: CancellationToken,
) -> LogSource {
    let (writer, reader) = tokio::io::duplex(PIPE_CAPACITY);
    tokio::spawn(feed(path, tail, follow, writer, cancel));
    LogSource {
        name,
        reader: Box::new(BufReader::new(reader)),
    }
}

async fn feed(
    path: PathBuf,
    tail: Option<u64>,
    follow: bool,
    mut out: DuplexStream,
    cancel: CancellationToken,
) {
    let mut file = match File::open(&path).await {
        Ok(f) => f,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "cannot open log file");
            return;
        }
    };
    let mut history = Vec::new();
    if let Err(e) = file.read_to_end(&mut history).await {
        warn!(path = %path.display(), error = %e, "cannot read log file");
        return;
    }
    let start = tail_offset(&history, tail);
    if out.write_all(&history[start..]).await.is_err() {
        return;
    }
    if !follow {
        return;
    }

    let mut pos = history.len() as u64;
    let mut chunk = Vec::new();
    loop {
        tokio::select! {
            () = cancel.cancelled() => return,
            () = tokio::time::sleep(POLL_INTERVAL) => {}
        }
        let len = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta.len(),
            Err(e) => {
                debug!(path = %path.display(), error = %e, "log file gone");
                continue;
            }
        };
        if len < pos {
            // Truncated or replaced: start over from the top of the new file.
            match File::open(&path).await {
                Ok(f) => file = f,
                Err(_) => continue,
            }
            pos = 0;
        }
        if len == pos {
            continue;
        }
        chunk.clear();
        let read = async {
            file.seek(SeekFrom::Start(pos)).await?;
            file.read_to_end(&mut chunk).await
        };
        match read.await {
            Ok(n) => pos += n as u64,
            Err(e) => {
                warn!(path = %path.display(), error = %e, "log read failed");
                return;
            }
        }
        if out.write_all(&chunk).await.is_err() {
            return;
        }
    }
}

/// Byte offset where the last `lines` lines of `buf` begin. `None` keeps
/// everything.
fn tail_offset(buf: &[u8], lines: Option<u64>) -> usize {
    let Some(n) = lines else {
        return 0;
    };
    if n == 0 {
        return buf.len();
    }
    let body = buf.strip_suffix(b"\n").unwrap_or(buf);
    let mut seen = 0;
    for (i, b) in body.iter().enumerate().rev() {
        if *b == b'\n' {
            seen += 1;
            if seen == n {
                return i + 1;
            }
        }
    }
    0
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncBufReadExt;

    #[test]
    fn tail_offsets() {
        let buf = b"a\nb\nc\n";
        assert_eq!(&buf[tail_offset(buf, None)..], b"a\nb\nc\n");
        assert_eq!(&buf[tail_offset(buf, Some(2))..], b"b\nc\n");
        assert_eq!(&buf[tail_offset(buf, Some(10))..], b"a\nb\nc\n");
        assert_eq!(&buf[tail_offset(buf, Some(0))..], b"");
        assert_eq!(&b"x\ny"[tail_offset(b"x\ny", Some(1))..], b"y");
    }

    async fn read_lines(source: LogSource, max: usize) -> Vec<String> {
        let mut lines = source.reader.lines();
        let mut out = Vec::new();
        while out.len() < max {
            match lines.next_line().await.unwrap() {
                Some(l) => out.push(l),
                None => break,
            }
        }
        out
    }

    #[tokio::test]
    async fn tail_without_follow_ends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "one\ntwo\nthree\n").unwrap();
        let source = tail_file("web-0".to_string(), path, Some(2), false, CancellationToken::new());
        assert_eq!(source.name, "web-0");
        assert_eq!(read_lines(source, 10).await, vec!["two", "three"]);
    }

    #[tokio::test]
    async fn follow_picks_up_appended_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("app.log");
        std::fs::write(&path, "old\n").unwrap();
        let cancel = CancellationToken::new();
        let source = tail_file("web-0".to_string(), path.clone(), None, true, cancel.clone());
        let reader = tokio::spawn(read_lines(source, 2));

        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        std::io::Write::write_all(&mut f, b"new\n").unwrap();

        let lines = tokio::time::timeout(Duration::from_secs(5), reader)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lines, vec!["old", "new"]);
        cancel.cancel();
    }

    #[tokio::test]
    async fn missing_file_yields_empty_source() {
        let source = tail_file(
            "web-0".to_string(),
            PathBuf::from("/nonexistent/leasegw.log"),
            None,
            true,
            CancellationToken::new(),
        );
        assert!(read_lines(source, 1).await.is_empty());
    }
}
