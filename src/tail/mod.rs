//! Filesystem tailing: a single-file tailer and a directory watcher built
//! on top of it.

pub mod dir;
pub mod file;

pub use dir::{FileEvent, FileOp, TailDir};
pub use file::TailFile;
