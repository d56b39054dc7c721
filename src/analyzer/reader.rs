//! Directory-tailer record reader: watches an analyzer's work directory
//! and turns newly-appearing files into a single stream of records.

use std::collections::HashMap;
use std::io::Read as _;
use std::path::PathBuf;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::CoreError;
use crate::record::{self, Record, RecordFormat};
use crate::shaper::Shaper;
use crate::tail::dir::{FileOp, TailDir};
use crate::tail::file::TailFile;

/// One item delivered on a directory-tailer-reader's results channel.
#[derive(Debug)]
pub enum ReaderEvent {
    Record(Record),
    Warning(String),
}

const RESULTS_CAPACITY: usize = 5;

/// Peeks at most one byte ahead of a [`TailFile`] so the format-detecting
/// open can inspect the first byte without losing it.
struct Peekable {
    tail: TailFile,
    pending: Option<u8>,
}

impl Peekable {
    fn new(tail: TailFile) -> Self {
        Self { tail, pending: None }
    }

    fn peek_first_byte(&mut self) -> std::io::Result<Option<u8>> {
        let mut byte = [0u8; 1];
        let n = self.tail.read(&mut byte)?;
        if n == 0 {
            return Ok(None);
        }
        self.pending = Some(byte[0]);
        Ok(Some(byte[0]))
    }
}

impl std::io::Read for Peekable {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        if let Some(byte) = self.pending.take() {
            buf[0] = byte;
            return Ok(1);
        }
        self.tail.read(buf)
    }
}

/// Shared shutdown signals for every file worker (and the directory
/// watcher itself) under one directory reader: `drain` asks everything to
/// stop at the next natural EOF, `close` forces an immediate one.
#[derive(Debug, Clone)]
struct ShutdownFlags {
    drain: CancellationToken,
    close: CancellationToken,
}

impl Default for ShutdownFlags {
    fn default() -> Self {
        Self { drain: CancellationToken::new(), close: CancellationToken::new() }
    }
}

/// Runs on a blocking task: owns one tailed file end to end, decoding
/// records through its codec (and optional shaper) and forwarding them.
fn run_file_worker(
    path: PathBuf,
    format: RecordFormat,
    shaper: Option<Arc<dyn Shaper>>,
    tx: mpsc::Sender<ReaderEvent>,
    flags: ShutdownFlags,
) {
    let mut tail = match TailFile::open(&path) {
        Ok(t) => t,
        Err(e) => {
            let _ = tx.blocking_send(ReaderEvent::Warning(format!("{}: {e}", path.display())));
            return;
        }
    };
    tail.watch_stop_flag(flags.drain.clone());
    tail.watch_close_flag(flags.close.clone());
    let mut peekable = Peekable::new(tail);
    let resolved_format = match format {
        RecordFormat::Auto => match peekable.peek_first_byte() {
            Ok(Some(byte)) => record::detect_format(&[byte]).unwrap_or(RecordFormat::Json),
            Ok(None) => RecordFormat::Json,
            Err(_) => RecordFormat::Json,
        },
        other => other,
    };

    let mut reader = record::open_reader(resolved_format, peekable, path.clone());
    loop {
        match reader.read_record() {
            Ok(Some(record)) => {
                let record = match &shaper {
                    Some(s) => match s.shape(record) {
                        Ok(Some(r)) => r,
                        Ok(None) => continue,
                        Err(e) => {
                            let _ = tx.blocking_send(ReaderEvent::Warning(e.to_string()));
                            continue;
                        }
                    },
                    None => record,
                };
                if tx.blocking_send(ReaderEvent::Record(record)).is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(CoreError::InvalidRecord { path, reason }) => {
                let _ = tx.blocking_send(ReaderEvent::Warning(format!(
                    "{}: invalid record: {reason}",
                    path.display()
                )));
            }
            Err(e) => {
                let _ = tx.blocking_send(ReaderEvent::Warning(format!("{}: {e}", path.display())));
                break;
            }
        }
    }
}

/// A cloneable remote control for a [`DirectoryReader`]'s shutdown
/// signals, usable independently of (and after giving away ownership of)
/// the reader's results channel.
#[derive(Debug, Clone)]
pub struct StopHandle {
    flags: ShutdownFlags,
}

impl StopHandle {
    /// Stop adding new data; existing readers drain to EOF.
    pub fn stop(&self) {
        self.flags.drain.cancel();
    }

    /// Abandon remaining data immediately.
    pub fn close(&self) {
        self.flags.close.cancel();
    }
}

/// Owns a directory watcher and one tail-file reader per matched file,
/// fanning decoded records into a single bounded channel.
#[derive(Debug)]
pub struct DirectoryReader {
    results: mpsc::Receiver<ReaderEvent>,
    flags: ShutdownFlags,
}

impl DirectoryReader {
    pub fn spawn(
        work_dir: PathBuf,
        globs: Vec<String>,
        format: RecordFormat,
        shaper: Option<Arc<dyn Shaper>>,
    ) -> crate::error::Result<Self> {
        let mut tail_dir = TailDir::new(work_dir, globs)?;
        let (tx, results) = mpsc::channel(RESULTS_CAPACITY);
        let flags = ShutdownFlags::default();
        let task_flags = flags.clone();

        tokio::spawn(async move {
            let mut workers: HashMap<PathBuf, JoinHandle<()>> = HashMap::new();
            let mut watcher_stopped = false;
            loop {
                tokio::select! {
                    biased;
                    () = task_flags.close.cancelled(), if !watcher_stopped => {
                        tail_dir.stop();
                        watcher_stopped = true;
                    }
                    () = task_flags.drain.cancelled(), if !watcher_stopped => {
                        tail_dir.stop();
                        watcher_stopped = true;
                    }
                    event = tail_dir.next_event() => {
                        let Some(event) = event else { break };
                        if let Some(err) = event.error {
                            let _ = tx.send(ReaderEvent::Warning(err)).await;
                            continue;
                        }
                        match event.op {
                            FileOp::Created | FileOp::Existing => {
                                if workers.contains_key(&event.path) || task_flags.close.is_cancelled() {
                                    continue;
                                }
                                let tx = tx.clone();
                                let shaper = shaper.clone();
                                let path = event.path.clone();
                                let flags = task_flags.clone();
                                let handle = tokio::task::spawn_blocking(move || {
                                    run_file_worker(path, format, shaper, tx, flags);
                                });
                                workers.insert(event.path, handle);
                            }
                            FileOp::Removed => {}
                        }
                    }
                }
            }
            for (_, handle) in workers {
                let _ = handle.await;
            }
        });

        Ok(Self { results, flags })
    }

    pub async fn recv(&mut self) -> Option<ReaderEvent> {
        self.results.recv().await
    }

    /// A cloneable handle that can signal `stop`/`close` without needing
    /// continued ownership of the results channel.
    #[must_use]
    pub fn stop_handle(&self) -> StopHandle {
        StopHandle { flags: self.flags.clone() }
    }

    /// Stop adding new data; existing readers drain to EOF.
    pub fn stop(&self) {
        self.flags.drain.cancel();
    }

    /// Abandon remaining data immediately.
    pub fn close(&self) {
        self.flags.close.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write as _;

    #[tokio::test]
    async fn reads_records_from_existing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.jsonl");
        std::fs::File::create(&file_path)
            .unwrap()
            .write_all(b"{\"msg\":\"one\"}\n")
            .unwrap();

        let mut reader =
            DirectoryReader::spawn(dir.path().to_path_buf(), vec![], RecordFormat::Auto, None)
                .unwrap();
        let event = tokio::time::timeout(std::time::Duration::from_secs(5), reader.recv())
            .await
            .unwrap()
            .unwrap();
        match event {
            ReaderEvent::Record(record) => {
                assert_eq!(record.canonical_string(), r#"{"msg":"one"}"#);
            }
            ReaderEvent::Warning(w) => panic!("unexpected warning: {w}"),
        }
        reader.stop();
    }

    #[tokio::test]
    async fn stop_drains_then_closes_channel() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.jsonl");
        std::fs::File::create(&file_path)
            .unwrap()
            .write_all(b"{\"msg\":\"one\"}\n")
            .unwrap();

        let mut reader =
            DirectoryReader::spawn(dir.path().to_path_buf(), vec![], RecordFormat::Auto, None)
                .unwrap();
        reader.stop();
        let mut saw_record = false;
        while let Some(event) = tokio::time::timeout(std::time::Duration::from_secs(5), reader.recv())
            .await
            .unwrap()
        {
            if let ReaderEvent::Record(_) = event {
                saw_record = true;
            }
        }
        assert!(saw_record);
    }
}
