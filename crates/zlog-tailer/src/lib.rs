//! Lazy, restartable tailing of a growing append-only log file.
//!
//! Never drops bytes and never advances past a partial final line: a read
//! that returns no data, or that ends mid-line, is retried after a 300 ms
//! growth poll with the partial bytes retained across calls. The sequence
//! of lines is conceptually infinite; the only supported "restart" is
//! reopening the file, which is why this type exposes no seek/rewind API.

use futures::Stream;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tracing::trace;

const GROWTH_POLL: Duration = Duration::from_millis(300);
const CHUNK_SIZE: usize = 8192;

pub struct LogTailer {
    path: PathBuf,
    file: File,
    partial: Vec<u8>,
}

impl LogTailer {
    pub async fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).await?;
        Ok(LogTailer {
            path,
            file,
            partial: Vec::new(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the next complete newline-terminated line, polling for file
    /// growth until one is available.
    pub async fn next_line(&mut self) -> io::Result<String> {
        let mut chunk = [0u8; CHUNK_SIZE];
        loop {
            if let Some(idx) = self.partial.iter().position(|&b| b == b'\n') {
                let line_bytes: Vec<u8> = self.partial.drain(..=idx).collect();
                let line = String::from_utf8_lossy(&line_bytes[..line_bytes.len() - 1]).into_owned();
                return Ok(line);
            }
            let n = self.file.read(&mut chunk).await?;
            if n == 0 {
                trace!(path = %self.path.display(), "no growth, polling");
                tokio::time::sleep(GROWTH_POLL).await;
                continue;
            }
            self.partial.extend_from_slice(&chunk[..n]);
        }
    }

    /// Adapts this tailer into an infinite stream of lines. The stream ends
    /// only on a genuine I/O error (not EOF, which is retried internally).
    pub fn into_stream(mut self) -> impl Stream<Item = io::Result<String>> {
        async_stream::stream! {
            loop {
                match self.next_line().await {
                    Ok(line) => yield Ok(line),
                    Err(e) => {
                        yield Err(e);
                        break;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::io::Write;
    use tokio::time::{timeout, Duration as TokioDuration};

    #[tokio::test]
    async fn reads_complete_lines_in_order() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "first").unwrap();
        writeln!(f, "second").unwrap();
        f.flush().unwrap();

        let mut tailer = LogTailer::open(f.path()).await.unwrap();
        assert_eq!(tailer.next_line().await.unwrap(), "first");
        assert_eq!(tailer.next_line().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn waits_on_partial_final_line_then_completes_it() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        write!(f, "incomple").unwrap();
        f.flush().unwrap();
        let path = f.path().to_path_buf();

        let mut tailer = LogTailer::open(&path).await.unwrap();

        // No newline yet -- must not resolve within one growth-poll interval.
        let pending = timeout(TokioDuration::from_millis(50), tailer.next_line()).await;
        assert!(pending.is_err(), "should still be waiting on the partial line");

        // Append the rest of the line plus terminator.
        let mut append = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(append, "te line").unwrap();

        let line = timeout(TokioDuration::from_millis(1000), tailer.next_line())
            .await
            .expect("should resolve once growth poll notices the append")
            .unwrap();
        assert_eq!(line, "incomplete line");
    }

    #[tokio::test]
    async fn stream_adapter_yields_lines_in_order() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "a").unwrap();
        writeln!(f, "b").unwrap();
        f.flush().unwrap();

        let tailer = LogTailer::open(f.path()).await.unwrap();
        let mut stream = Box::pin(tailer.into_stream());
        assert_eq!(stream.next().await.unwrap().unwrap(), "a");
        assert_eq!(stream.next().await.unwrap().unwrap(), "b");
    }
}
