//! Spawns and supervises one analyzer's child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::process::{Child, Command};

use crate::analyzer::config::AnalyzerConfig;
use crate::error::{CoreError, Result};

/// Keeps the first `capacity` bytes and the last `capacity` bytes written
/// to it, reporting how many bytes in between were dropped. Ported
/// byte-for-byte from the standard library's `exec.Cmd` prefix/suffix
/// saver via the Go implementation this crate's runner is modeled on.
#[derive(Debug)]
pub struct PrefixSuffixSaver {
    capacity: usize,
    prefix: Vec<u8>,
    suffix: Vec<u8>,
    suffix_off: usize,
    skipped: u64,
}

impl PrefixSuffixSaver {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            prefix: Vec::new(),
            suffix: Vec::new(),
            suffix_off: 0,
            skipped: 0,
        }
    }

    fn fill<'a>(dst: &mut Vec<u8>, capacity: usize, mut data: &'a [u8]) -> &'a [u8] {
        let remain = capacity.saturating_sub(dst.len());
        if remain > 0 {
            let add = remain.min(data.len());
            dst.extend_from_slice(&data[..add]);
            data = &data[add..];
        }
        data
    }

    pub fn write(&mut self, data: &[u8]) {
        let mut rest = Self::fill(&mut self.prefix, self.capacity, data).to_vec();
        if rest.len() > self.capacity {
            let overage = rest.len() - self.capacity;
            self.skipped += overage as u64;
            rest.drain(..overage);
        }
        if self.suffix.len() < self.capacity {
            let remain = self.capacity - self.suffix.len();
            let add = remain.min(rest.len());
            self.suffix.extend_from_slice(&rest[..add]);
            rest.drain(..add);
        }
        while !rest.is_empty() {
            let space = self.capacity - self.suffix_off;
            let n = space.min(rest.len());
            self.suffix[self.suffix_off..self.suffix_off + n].copy_from_slice(&rest[..n]);
            rest.drain(..n);
            self.skipped += n as u64;
            self.suffix_off += n;
            if self.suffix_off == self.capacity {
                self.suffix_off = 0;
            }
        }
    }

    #[must_use]
    pub fn finish(self) -> SavedOutput {
        SavedOutput {
            prefix: self.prefix,
            suffix: self.suffix,
            suffix_off: self.suffix_off,
            skipped: self.skipped,
        }
    }
}

/// The captured prefix/suffix of an output stream, ready for display.
#[derive(Debug, Clone, Default)]
pub struct SavedOutput {
    pub prefix: Vec<u8>,
    pub suffix: Vec<u8>,
    pub suffix_off: usize,
    pub skipped: u64,
}

impl std::fmt::Display for SavedOutput {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.prefix.is_empty() && self.suffix.is_empty() {
            return write!(f, "(no output)");
        }
        write!(f, "{}", String::from_utf8_lossy(&self.prefix))?;
        if self.skipped > 0 {
            write!(f, "\n... omitting {} bytes ...\n", self.skipped)?;
            write!(f, "{}", String::from_utf8_lossy(&self.suffix[self.suffix_off..]))?;
            write!(f, "{}", String::from_utf8_lossy(&self.suffix[..self.suffix_off]))?;
        } else {
            write!(f, "{}", String::from_utf8_lossy(&self.suffix))?;
        }
        Ok(())
    }
}

/// An analyzer process exited with a non-zero status.
#[derive(Debug)]
pub struct ProcessExitError {
    pub exit_code: Option<i32>,
    pub path: PathBuf,
    pub argv: Vec<String>,
    pub stdout: SavedOutput,
    pub stderr: SavedOutput,
}

impl std::fmt::Display for ProcessExitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.path.display().to_string());
        match self.exit_code {
            Some(code) => writeln!(f, "{name} exited with code {code}")?,
            None => writeln!(f, "{name} exited without a status code")?,
        }
        write!(f, "command: {}", self.path.display())?;
        for arg in &self.argv {
            write!(f, " {arg}")?;
        }
        writeln!(f)?;
        writeln!(f, "stdout:\n{}", self.stdout)?;
        write!(f, "stderr:\n{}", self.stderr)
    }
}

impl std::error::Error for ProcessExitError {}

const SAVER_CAPACITY: usize = 32 * 1024;

/// Streams a child's stdout or stderr into an optional capture file and
/// the bounded prefix/suffix saver concurrently.
async fn drain_stream<R: AsyncRead + Unpin>(
    mut stream: R,
    capture_path: Option<PathBuf>,
) -> std::io::Result<SavedOutput> {
    use tokio::io::AsyncReadExt;

    let mut capture_file = match capture_path {
        Some(path) => Some(tokio::fs::File::create(path).await?),
        None => None,
    };
    let mut saver = PrefixSuffixSaver::new(SAVER_CAPACITY);
    let mut buf = [0u8; 8192];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        saver.write(&buf[..n]);
        if let Some(file) = capture_file.as_mut() {
            file.write_all(&buf[..n]).await?;
        }
    }
    if let Some(file) = capture_file.as_mut() {
        file.flush().await?;
    }
    Ok(saver.finish())
}

/// Spawns and waits on one analyzer's child process, capturing its
/// stdout/stderr and returning a stdin pipe for the fan-out driver to
/// write the pcap bytes to.
#[derive(Debug)]
pub struct AnalyzerProcess {
    child: Child,
    path: PathBuf,
}

impl AnalyzerProcess {
    /// Spawns the command with `cwd = work_dir` and a piped stdin.
    /// Returns the process handle and a writer for its stdin.
    pub fn spawn(config: &AnalyzerConfig, work_dir: &Path) -> Result<Self> {
        let path = PathBuf::from(&config.cmd);
        let mut command = Command::new(&config.cmd);
        command
            .args(&config.args)
            .current_dir(work_dir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        let child = command.spawn().map_err(|source| CoreError::Spawn {
            path: path.clone(),
            source,
        })?;
        Ok(Self { child, path })
    }

    /// Takes ownership of the child's stdin pipe. Panics if called twice.
    pub fn take_stdin(&mut self) -> tokio::process::ChildStdin {
        self.child.stdin.take().expect("stdin already taken")
    }

    /// Drives stdout/stderr capture concurrently with waiting for exit,
    /// returning `Ok(())` on a zero exit code or a boxed
    /// [`ProcessExitError`] (via [`CoreError::ProcessExit`]) otherwise.
    pub async fn wait(
        mut self,
        config: &AnalyzerConfig,
    ) -> Result<()> {
        let stdout = self.child.stdout.take().expect("stdout piped");
        let stderr = self.child.stderr.take().expect("stderr piped");
        let stdout_path = config.stdout_path.clone();
        let stderr_path = config.stderr_path.clone();

        let (stdout_result, stderr_result, status) = tokio::try_join!(
            drain_stream(stdout, stdout_path),
            drain_stream(stderr, stderr_path),
            self.child.wait(),
        )?;

        if status.success() {
            return Ok(());
        }
        Err(CoreError::ProcessExit(Box::new(ProcessExitError {
            exit_code: status.code(),
            path: self.path,
            argv: config.args.clone(),
            stdout: stdout_result,
            stderr: stderr_result,
        })))
    }

    pub async fn kill(&mut self) {
        let _ = self.child.kill().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn saver_keeps_prefix_and_suffix_when_under_capacity() {
        let mut saver = PrefixSuffixSaver::new(32);
        saver.write(b"hello world");
        let out = saver.finish();
        assert_eq!(out.skipped, 0);
        assert_eq!(out.prefix, b"hello world");
    }

    #[test]
    fn saver_reports_omitted_bytes_once_over_capacity() {
        let mut saver = PrefixSuffixSaver::new(4);
        saver.write(b"abcdefghij"); // prefix "abcd", suffix "ghij", 2 skipped
        let out = saver.finish();
        assert_eq!(out.prefix, b"abcd");
        assert_eq!(out.skipped, 2);
        assert_eq!(&out.suffix[out.suffix_off..], b"ghij");
    }

    #[test]
    fn saver_wraps_ring_buffer_across_multiple_writes() {
        let mut saver = PrefixSuffixSaver::new(4);
        saver.write(b"abcd");
        saver.write(b"efgh");
        saver.write(b"ijkl");
        let out = saver.finish();
        assert_eq!(out.prefix, b"abcd");
        // Last 4 bytes written overall are "ijkl".
        let mut suffix = out.suffix[out.suffix_off..].to_vec();
        suffix.extend_from_slice(&out.suffix[..out.suffix_off]);
        assert_eq!(suffix, b"ijkl");
    }

    #[test]
    fn empty_saver_formats_as_no_output() {
        let saver = PrefixSuffixSaver::new(32);
        assert_eq!(saver.finish().to_string(), "(no output)");
    }
}
