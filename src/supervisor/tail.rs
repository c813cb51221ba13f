//! Live log capture for supervised processes
//!
//! One reader task per output stream feeds a single writer task through a
//! channel. The writer timestamps each line, appends it to the log sink and
//! re-emits it through tracing.

use chrono::Local;
use std::collections::VecDeque;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Timestamp prefix of every sink line
pub const LOG_TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Append-only, line-oriented log file
#[derive(Debug, Clone)]
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Appends one timestamped line
    pub fn append_line(&self, line: &str) -> io::Result<()> {
        self.ensure_parent()?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(stamp(line).as_bytes())
    }

    /// Returns the last `lines` lines, oldest first
    ///
    /// A missing log file yields no lines.
    pub fn tail(&self, lines: usize) -> io::Result<Vec<String>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        if lines == 0 {
            return Ok(Vec::new());
        }

        let mut window = VecDeque::with_capacity(lines.min(1024));
        for raw in BufReader::new(file).split(b'\n') {
            let raw = raw?;
            if window.len() == lines {
                window.pop_front();
            }
            window.push_back(decode_line(&raw));
        }

        Ok(window.into_iter().collect())
    }

    fn ensure_parent(&self) -> io::Result<()> {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => fs::create_dir_all(parent),
            _ => Ok(()),
        }
    }
}

/// Starts the reader and writer tasks for a child's output streams
///
/// The returned handle completes once every stream reached EOF and all
/// lines were written.
pub fn spawn_tailer<O, E>(sink: LogSink, stdout: Option<O>, stderr: Option<E>) -> JoinHandle<()>
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    if let Some(stdout) = stdout {
        spawn_reader(stdout, tx.clone());
    }
    if let Some(stderr) = stderr {
        spawn_reader(stderr, tx.clone());
    }
    drop(tx);

    tokio::spawn(async move {
        if let Err(e) = sink.ensure_parent() {
            tracing::warn!("Cannot create log directory for {}: {}", sink.path.display(), e);
        }

        let mut file = match tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&sink.path)
            .await
        {
            Ok(file) => Some(file),
            Err(e) => {
                tracing::warn!("Cannot open log sink {}: {}", sink.path.display(), e);
                None
            }
        };

        while let Some(line) = rx.recv().await {
            tracing::info!(target: "crawl", "{}", line);

            if let Some(out) = file.as_mut() {
                if let Err(e) = out.write_all(stamp(&line).as_bytes()).await {
                    tracing::warn!("Failed to append to log sink: {}", e);
                }
            }
        }

        if let Some(mut out) = file {
            if let Err(e) = out.flush().await {
                tracing::warn!("Failed to flush log sink: {}", e);
            }
        }
    })
}

fn spawn_reader<R>(reader: R, tx: mpsc::UnboundedSender<String>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = tokio::io::BufReader::new(reader);
        let mut buf = Vec::new();
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    if tx.send(decode_line(&buf)).is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::warn!("Stopped reading child output: {}", e);
                    break;
                }
            }
        }
    });
}

fn stamp(line: &str) -> String {
    format!("{} | {}\n", Local::now().format(LOG_TIMESTAMP_FORMAT), line)
}

fn decode_line(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw)
        .trim_end_matches(|c| c == '\r' || c == '\n')
        .to_string()
}
