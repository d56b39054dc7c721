//! Tails a single regular file: reads it like an infinite stream, blocking
//! at end-of-file until a write notification arrives.
//!
//! Deliberately synchronous (`std::io::Read`), not `tokio::io::AsyncRead`:
//! callers drive it from a blocking task (`tokio::task::spawn_blocking`)
//! so the record codecs, which are themselves synchronous, can be reused
//! unmodified against a tailed file.

use std::path::Path;
use std::sync::mpsc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio_util::sync::CancellationToken;

use crate::error::{CoreError, Result};

/// A tailed file. `stop()` lets `read()` drain to a natural EOF; `close()`
/// forces an immediate EOF by dropping the file descriptor.
#[derive(Debug)]
pub struct TailFile {
    file: Option<std::fs::File>,
    watcher: Option<RecommendedWatcher>,
    notify_rx: mpsc::Receiver<notify::Result<Event>>,
    stop_token: Option<CancellationToken>,
    close_token: Option<CancellationToken>,
}

/// How often a blocked read re-checks the stop/close tokens. Notification
/// events still wake it immediately; this only bounds worst-case latency
/// for a token canceled while no write notification ever arrives.
const TOKEN_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_millis(200);

impl TailFile {
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let metadata = std::fs::metadata(path)?;
        if metadata.is_dir() {
            return Err(CoreError::IsDirectory(path.to_path_buf()));
        }
        let file = std::fs::File::open(path)?;
        let (tx, notify_rx) = mpsc::channel();
        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            let _ = tx.send(res);
        })
        .map_err(|e| std::io::Error::other(e.to_string()))?;
        watcher
            .watch(path, RecursiveMode::NonRecursive)
            .map_err(|e| std::io::Error::other(e.to_string()))?;
        Ok(Self {
            file: Some(file),
            watcher: Some(watcher),
            notify_rx,
            stop_token: None,
            close_token: None,
        })
    }

    /// Checked while blocked waiting for a write: when canceled, the file
    /// transitions to "drain remaining bytes then EOF" without needing a
    /// wakeup from the watcher thread.
    pub fn watch_stop_flag(&mut self, token: CancellationToken) {
        self.stop_token = Some(token);
    }

    /// Checked on every `read`: when canceled, `read` returns EOF
    /// immediately, as if the file descriptor had been closed.
    pub fn watch_close_flag(&mut self, token: CancellationToken) {
        self.close_token = Some(token);
    }

    /// Unsubscribe from write notifications; `read` drains the remaining
    /// bytes in the file then returns EOF.
    pub fn stop(&mut self) {
        self.watcher = None;
    }

    /// Force an immediate EOF by closing the underlying file descriptor.
    pub fn close(&mut self) {
        self.stop();
        self.file = None;
    }

    fn is_force_closed(&self) -> bool {
        self.close_token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn should_stop(&self) -> bool {
        self.stop_token.as_ref().is_some_and(CancellationToken::is_cancelled)
    }

    fn wait_for_write(&mut self) -> std::io::Result<bool> {
        loop {
            if self.is_force_closed() || self.should_stop() {
                return Ok(false);
            }
            match self.notify_rx.recv_timeout(TOKEN_POLL_INTERVAL) {
                Ok(Ok(event)) if matches!(event.kind, EventKind::Modify(_)) => return Ok(true),
                Ok(Ok(_)) => continue,
                Ok(Err(_)) => return Ok(false),
                Err(mpsc::RecvTimeoutError::Timeout) => continue,
                Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(false),
            }
        }
    }
}

impl std::io::Read for TailFile {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.is_force_closed() {
            self.close();
            return Ok(0);
        }
        if self.watcher.is_some() && self.should_stop() {
            self.stop();
        }
        loop {
            let Some(file) = self.file.as_mut() else {
                return Ok(0);
            };
            let n = file.read(buf)?;
            if n > 0 {
                return Ok(n);
            }
            if self.watcher.is_none() {
                return Ok(0);
            }
            if !self.wait_for_write()? {
                return Ok(0);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read as _;
    use std::io::Write as _;

    #[test]
    fn reads_existing_content_then_blocks() {
        let mut path = tempfile::NamedTempFile::new().unwrap();
        path.write_all(b"hello ").unwrap();
        path.flush().unwrap();
        let mut tail = TailFile::open(path.path()).unwrap();
        let mut buf = [0u8; 64];
        let n = tail.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"hello ");
    }

    #[test]
    fn stop_drains_then_eof() {
        let mut path = tempfile::NamedTempFile::new().unwrap();
        path.write_all(b"abc").unwrap();
        path.flush().unwrap();
        let mut tail = TailFile::open(path.path()).unwrap();
        tail.stop();
        let mut buf = [0u8; 64];
        let n = tail.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
        let n2 = tail.read(&mut buf).unwrap();
        assert_eq!(n2, 0);
    }

    #[test]
    fn close_forces_immediate_eof() {
        let mut path = tempfile::NamedTempFile::new().unwrap();
        path.write_all(b"abc").unwrap();
        path.flush().unwrap();
        let mut tail = TailFile::open(path.path()).unwrap();
        tail.close();
        let mut buf = [0u8; 64];
        let n = tail.read(&mut buf).unwrap();
        assert_eq!(n, 0);
    }

    #[test]
    fn close_token_forces_eof_on_next_read() {
        let mut path = tempfile::NamedTempFile::new().unwrap();
        path.write_all(b"abc").unwrap();
        path.flush().unwrap();
        let mut tail = TailFile::open(path.path()).unwrap();
        let token = CancellationToken::new();
        tail.watch_close_flag(token.clone());
        let mut buf = [0u8; 64];
        let n = tail.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"abc");
        token.cancel();
        let n2 = tail.read(&mut buf).unwrap();
        assert_eq!(n2, 0);
    }

    #[test]
    fn rejects_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = TailFile::open(dir.path());
        assert!(matches!(err, Err(CoreError::IsDirectory(_))));
    }
}
