//! Directory watcher: emits one event per matching file, both on startup
//! and as files are created or removed underneath the watched directory.

use std::collections::HashSet;
use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::{mpsc, oneshot};

use crate::error::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOp {
    Created,
    Existing,
    Removed,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub path: PathBuf,
    pub op: FileOp,
    pub error: Option<String>,
}

fn matches_glob(base: &str, globs: &[String]) -> bool {
    if globs.is_empty() {
        return true;
    }
    globs.iter().any(|g| {
        glob::Pattern::new(g)
            .map(|p| p.matches(base))
            .unwrap_or(false)
    })
}

fn poll_once(dir: &Path, globs: &[String], watched: &mut HashSet<PathBuf>, op: FileOp) -> Vec<FileEvent> {
    let mut events = Vec::new();
    let Ok(entries) = std::fs::read_dir(dir) else {
        return events;
    };
    for entry in entries.flatten() {
        let Ok(file_type) = entry.file_type() else {
            continue;
        };
        if !file_type.is_file() {
            continue;
        }
        let name = entry.file_name();
        let base = name.to_string_lossy();
        if !matches_glob(&base, globs) {
            continue;
        }
        let path = entry.path();
        if watched.insert(path.clone()) {
            events.push(FileEvent {
                path,
                op: op.clone(),
                error: None,
            });
        }
    }
    events
}

/// Watches `dir` for files matching `globs` (all regular files if empty),
/// yielding `created`/`existing`/`removed` events on an unbounded channel.
#[derive(Debug)]
pub struct TailDir {
    events: mpsc::UnboundedReceiver<FileEvent>,
    stop_tx: Option<oneshot::Sender<()>>,
}

impl TailDir {
    pub fn new(dir: impl Into<PathBuf>, globs: Vec<String>) -> Result<Self> {
        let dir = dir.into();
        let metadata = std::fs::metadata(&dir)?;
        if !metadata.is_dir() {
            return Err(crate::error::CoreError::IsDirectory(dir));
        }

        let (tx, events) = mpsc::unbounded_channel();
        let (stop_tx, stop_rx) = oneshot::channel();
        let (notify_tx, mut notify_rx) = mpsc::unbounded_channel::<notify::Result<Event>>();

        let mut watcher: RecommendedWatcher = notify::recommended_watcher(move |res| {
            let _ = notify_tx.send(res);
        })
        .map_err(|e| std::io::Error::other(e.to_string()))?;
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| std::io::Error::other(e.to_string()))?;

        let mut watched = HashSet::new();
        for event in poll_once(&dir, &globs, &mut watched, FileOp::Existing) {
            let _ = tx.send(event);
        }

        tokio::spawn(async move {
            let _watcher = watcher;
            let mut stop_rx = stop_rx;
            loop {
                tokio::select! {
                    biased;
                    _ = &mut stop_rx => break,
                    maybe = notify_rx.recv() => {
                        match maybe {
                            Some(Ok(event)) => {
                                for ev in translate(&event, &globs, &mut watched) {
                                    if tx.send(ev).is_err() {
                                        return;
                                    }
                                }
                            }
                            Some(Err(e)) => {
                                let _ = tx.send(FileEvent {
                                    path: PathBuf::new(),
                                    op: FileOp::Removed,
                                    error: Some(e.to_string()),
                                });
                            }
                            None => break,
                        }
                    }
                }
            }
            for event in poll_once(&dir, &globs, &mut watched, FileOp::Created) {
                if tx.send(event).is_err() {
                    return;
                }
            }
        });

        Ok(Self {
            events,
            stop_tx: Some(stop_tx),
        })
    }

    /// Receive the next event. Returns `None` once the watcher has shut
    /// down and its final poll has been delivered.
    pub async fn next_event(&mut self) -> Option<FileEvent> {
        self.events.recv().await
    }

    /// Unsubscribe from filesystem notifications. The background task
    /// performs one final poll before closing the event channel.
    pub fn stop(&mut self) {
        if let Some(tx) = self.stop_tx.take() {
            let _ = tx.send(());
        }
    }
}

fn translate(event: &Event, globs: &[String], watched: &mut HashSet<PathBuf>) -> Vec<FileEvent> {
    let mut events = Vec::new();
    match event.kind {
        EventKind::Create(_) => {
            for path in &event.paths {
                if !path.is_file() {
                    continue;
                }
                let base = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                if !matches_glob(&base, globs) {
                    continue;
                }
                if watched.insert(path.clone()) {
                    events.push(FileEvent {
                        path: path.clone(),
                        op: FileOp::Created,
                        error: None,
                    });
                }
            }
        }
        EventKind::Remove(_) | EventKind::Modify(notify::event::ModifyKind::Name(_)) => {
            for path in &event.paths {
                if watched.remove(path) {
                    events.push(FileEvent {
                        path: path.clone(),
                        op: FileOp::Removed,
                        error: None,
                    });
                }
            }
        }
        _ => {}
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn emits_existing_files_on_startup() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("a.log"), b"hi").unwrap();
        std::fs::write(dir.path().join("b.txt"), b"hi").unwrap();

        let mut tailer = TailDir::new(dir.path(), vec!["*.log".to_string()]).unwrap();
        let ev = tailer.next_event().await.unwrap();
        assert_eq!(ev.op, FileOp::Existing);
        assert!(ev.path.ends_with("a.log"));
    }

    #[tokio::test]
    async fn emits_created_for_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let mut tailer = TailDir::new(dir.path(), vec![]).unwrap();
        std::fs::write(dir.path().join("c.log"), b"hi").unwrap();
        let ev = tokio::time::timeout(Duration::from_secs(5), tailer.next_event())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(ev.op, FileOp::Created);
    }

    #[tokio::test]
    async fn rejects_non_directory_path() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let err = TailDir::new(file.path(), vec![]);
        assert!(err.is_err());
    }
}
