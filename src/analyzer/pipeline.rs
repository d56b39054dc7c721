//! The fan-out driver: tees one pcap byte stream to N analyzer processes,
//! combines their decoded record streams, and reports progress.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::analyzer::config::AnalyzerConfig;
use crate::analyzer::process::AnalyzerProcess;
use crate::analyzer::reader::{DirectoryReader, ReaderEvent};
use crate::display::{Display, Stats};
use crate::error::{CoreError, Result};
use crate::record::{Record, RecordFormat};
use crate::shaper::Shaper;

const WRITE_BUF_SIZE: usize = 64 * 1024;
const COMBINED_CHANNEL_SLACK: usize = 5;

/// An analyzer's work directory, either given by configuration or
/// created and owned by the pipeline for the lifetime of the run.
enum WorkDir {
    Given(std::path::PathBuf),
    Owned(tempfile::TempDir),
}

impl WorkDir {
    fn path(&self) -> &std::path::Path {
        match self {
            Self::Given(path) => path,
            Self::Owned(dir) => dir.path(),
        }
    }

    fn for_config(config: &AnalyzerConfig) -> Result<Self> {
        match &config.work_dir {
            Some(path) => Ok(Self::Given(path.clone())),
            None => Ok(Self::Owned(tempfile::tempdir()?)),
        }
    }
}

/// Runs the fan-out driver to completion: spawns every analyzer, tees
/// `input` to each, combines their record streams, and delivers records
/// to `sink` until every analyzer has exited and every reader has
/// drained. Returns the first error observed by any task, if any.
pub async fn run<R>(
    mut input: R,
    configs: Vec<AnalyzerConfig>,
    shapers: HashMap<String, Arc<dyn Shaper>>,
    sink: mpsc::Sender<Record>,
    display: Arc<dyn Display>,
    stats_interval: Option<Duration>,
) -> Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let cancel = CancellationToken::new();

    // Spawn every analyzer process up front, each in its own scratch dir.
    let mut processes = Vec::with_capacity(configs.len());
    let mut work_dirs = Vec::with_capacity(configs.len());
    let mut stdins = Vec::with_capacity(configs.len());
    for config in &configs {
        let work_dir = WorkDir::for_config(config)?;
        let mut process = AnalyzerProcess::spawn(config, work_dir.path())?;
        stdins.push(Some(process.take_stdin()));
        info!(analyzer = %config.name, work_dir = %work_dir.path().display(), "spawned analyzer");
        processes.push(process);
        work_dirs.push(work_dir);
    }

    // One directory-tailer-reader per analyzer, over its scratch dir.
    let mut stop_handles = Vec::with_capacity(configs.len());
    let (combined_tx, mut combined_rx) = mpsc::channel::<ReaderEvent>(
        configs.len().max(1) * COMBINED_CHANNEL_SLACK,
    );
    let mut combiner_tasks = JoinSet::new();
    for (config, work_dir) in configs.iter().zip(&work_dirs) {
        let shaper = config.shaper.as_ref().and_then(|name| shapers.get(name)).cloned();
        let mut reader = DirectoryReader::spawn(
            work_dir.path().to_path_buf(),
            config.globs.clone(),
            RecordFormat::Auto,
            shaper,
        )?;
        stop_handles.push(reader.stop_handle());
        let tx = combined_tx.clone();
        combiner_tasks.spawn(async move {
            while let Some(event) = reader.recv().await {
                if tx.send(event).await.is_err() {
                    break;
                }
            }
        });
    }
    drop(combined_tx);

    let bytes_read = Arc::new(AtomicU64::new(0));
    let records_written = Arc::new(AtomicU64::new(0));
    let mut tasks = JoinSet::new();

    // Writer task: tee the input stream to every analyzer's stdin.
    let writer_cancel = cancel.clone();
    let writer_bytes = Arc::clone(&bytes_read);
    tasks.spawn(async move {
        let result = tee_input(&mut input, &mut stdins, &writer_bytes, &writer_cancel).await;
        for stdin in stdins.iter_mut().flatten() {
            let _ = stdin.shutdown().await;
        }
        result
    });

    // Analyzer-wait task: wait for every process, then stop every reader
    // so it drains its last file and emits EOF.
    let wait_cancel = cancel.clone();
    let wait_stop_handles = stop_handles.clone();
    tasks.spawn(async move {
        let mut join_set = JoinSet::new();
        for (config, process) in configs.into_iter().zip(processes) {
            join_set.spawn(async move {
                let name = config.name.clone();
                (name, process.wait(&config).await)
            });
        }
        let mut first_err: Option<CoreError> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((name, Ok(()))) => debug!(analyzer = %name, "analyzer exited cleanly"),
                Ok((name, Err(e))) => {
                    warn!(analyzer = %name, error = %e, "analyzer exited with error");
                    if first_err.is_none() {
                        first_err = Some(e);
                    }
                }
                Err(join_err) => warn!(error = %join_err, "analyzer task panicked"),
            }
        }
        for handle in &wait_stop_handles {
            handle.stop();
        }
        if first_err.is_some() {
            wait_cancel.cancel();
        }
        match first_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    });

    // Reader task: drain the combiner into the caller's sink.
    let reader_records = Arc::clone(&records_written);
    let reader_display = Arc::clone(&display);
    tasks.spawn(async move {
        while let Some(event) = combined_rx.recv().await {
            match event {
                ReaderEvent::Record(record) => {
                    reader_records.fetch_add(1, Ordering::Relaxed);
                    if sink.send(record).await.is_err() {
                        return Err(CoreError::Canceled);
                    }
                }
                ReaderEvent::Warning(message) => {
                    let _ = reader_display.warn(&message);
                }
            }
        }
        Ok(())
    });

    // Stats task: periodically publish progress.
    if let Some(interval) = stats_interval {
        let stats_bytes = Arc::clone(&bytes_read);
        let stats_records = Arc::clone(&records_written);
        let stats_display = Arc::clone(&display);
        let stats_cancel = cancel.clone();
        tasks.spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        stats_display.stats(Stats {
                            bytes_read: stats_bytes.load(Ordering::Relaxed),
                            records_written: stats_records.load(Ordering::Relaxed),
                        });
                    }
                    () = stats_cancel.cancelled() => break,
                }
            }
            Ok(())
        });
    }

    let mut first_error = None;
    while let Some(joined) = tasks.join_next().await {
        match joined {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                if first_error.is_none() {
                    first_error = Some(e);
                }
                cancel.cancel();
            }
            Err(join_err) => {
                warn!(error = %join_err, "pipeline task panicked");
                cancel.cancel();
            }
        }
    }

    if cancel.is_cancelled() {
        for handle in &stop_handles {
            handle.close();
        }
    }
    combiner_tasks.shutdown().await;
    drop(work_dirs);

    display.stats(Stats {
        bytes_read: bytes_read.load(Ordering::Relaxed),
        records_written: records_written.load(Ordering::Relaxed),
    });

    match first_error {
        Some(e) => Err(e),
        None => Ok(()),
    }
}

/// Copies `input` into every live stdin in `stdins`, plus a byte counter.
/// A write error on one stdin (most commonly a broken pipe once that
/// analyzer has exited) drops that writer from the tee without aborting
/// writes to the others.
async fn tee_input<R>(
    input: &mut R,
    stdins: &mut [Option<tokio::process::ChildStdin>],
    bytes_read: &AtomicU64,
    cancel: &CancellationToken,
) -> Result<()>
where
    R: AsyncRead + Unpin,
{
    let mut buf = vec![0u8; WRITE_BUF_SIZE];
    loop {
        let n = tokio::select! {
            biased;
            () = cancel.cancelled() => return Err(CoreError::Canceled),
            result = input.read(&mut buf) => result?,
        };
        if n == 0 {
            return Ok(());
        }
        bytes_read.fetch_add(n as u64, Ordering::Relaxed);
        for slot in stdins.iter_mut() {
            let Some(stdin) = slot else { continue };
            if let Err(e) = stdin.write_all(&buf[..n]).await {
                if e.kind() == std::io::ErrorKind::BrokenPipe {
                    debug!("analyzer closed stdin early");
                } else {
                    warn!(error = %e, "error writing to analyzer stdin");
                }
                *slot = None;
            }
        }
    }
}
