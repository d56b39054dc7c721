//! The record model and the one concrete codec the crate ships.
//!
//! The pipeline treats analyzer output opaquely: it never inspects fields,
//! only counts records and forwards them. [`Record`] is therefore a thin
//! wrapper around a JSON value with a canonical string form, and
//! [`JsonLinesReader`] is the only codec implemented here. Consumers that
//! need a richer format zoo implement [`RecordReader`] themselves.

use std::io::{BufRead, BufReader, Read};

use serde_json::Value;

use crate::error::{CoreError, Result};

/// A self-describing, opaque value produced by an analyzer's log stream.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    value: Value,
}

impl Record {
    #[must_use]
    pub const fn new(value: Value) -> Self {
        Self { value }
    }

    #[must_use]
    pub const fn value(&self) -> &Value {
        &self.value
    }

    /// Canonical string rendering, used by tests and the default textual
    /// codec. For JSON-backed records this is compact JSON.
    #[must_use]
    pub fn canonical_string(&self) -> String {
        self.value.to_string()
    }
}

/// A lazy source of [`Record`]s. `Ok(None)` signals a clean end of stream;
/// an error is terminal for the file being read (the directory-tailer
/// reader downgrades it to a warning and stops reading that file).
pub trait RecordReader: Send {
    fn read_record(&mut self) -> Result<Option<Record>>;
}

/// Reads newline-delimited JSON. This is the crate's one shipped format:
/// used whenever an analyzer's configuration does not pin a format and the
/// first non-whitespace byte of the file is `{`.
#[derive(Debug)]
pub struct JsonLinesReader<R> {
    inner: BufReader<R>,
    path_for_errors: std::path::PathBuf,
}

impl<R: Read> JsonLinesReader<R> {
    pub fn new(inner: R, path_for_errors: impl Into<std::path::PathBuf>) -> Self {
        Self {
            inner: BufReader::new(inner),
            path_for_errors: path_for_errors.into(),
        }
    }
}

impl<R: Read + Send> RecordReader for JsonLinesReader<R> {
    fn read_record(&mut self) -> Result<Option<Record>> {
        loop {
            let mut line = String::new();
            let n = self.inner.read_line(&mut line)?;
            if n == 0 {
                return Ok(None);
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }
            let value: Value =
                serde_json::from_str(trimmed).map_err(|e| CoreError::InvalidRecord {
                    path: self.path_for_errors.clone(),
                    reason: e.to_string(),
                })?;
            return Ok(Some(Record::new(value)));
        }
    }
}

/// Format pinned by configuration, or left to be sniffed from the first
/// bytes of each file a tailer opens.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Deserialize, serde::Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordFormat {
    #[default]
    Auto,
    Json,
}

/// Sniff a format from the first non-whitespace byte available without
/// consuming it from the caller's reader. The only recognized leading byte
/// is `{`; anything else (including an empty prefix) is undetected.
#[must_use]
pub fn detect_format(prefix: &[u8]) -> Option<RecordFormat> {
    let first = prefix.iter().find(|b| !b.is_ascii_whitespace())?;
    (*first == b'{').then_some(RecordFormat::Json)
}

/// Build a [`RecordReader`] for a file, given a configured or detected
/// format. Only JSON is implemented; an explicit non-JSON format is an
/// invalid configuration rather than a runtime error, since it can never
/// succeed.
pub fn open_reader<R: Read + Send + 'static>(
    format: RecordFormat,
    inner: R,
    path: impl Into<std::path::PathBuf>,
) -> Box<dyn RecordReader> {
    match format {
        RecordFormat::Auto | RecordFormat::Json => Box::new(JsonLinesReader::new(inner, path)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_one_record_per_line() {
        let data = b"{\"msg\":\"record1\"}\n{\"msg\":\"record2\"}\n";
        let mut r = JsonLinesReader::new(&data[..], "test.log");
        let rec1 = r.read_record().unwrap().unwrap();
        assert_eq!(rec1.canonical_string(), r#"{"msg":"record1"}"#);
        let rec2 = r.read_record().unwrap().unwrap();
        assert_eq!(rec2.canonical_string(), r#"{"msg":"record2"}"#);
        assert!(r.read_record().unwrap().is_none());
    }

    #[test]
    fn skips_blank_lines() {
        let data = b"\n\n{\"msg\":\"record1\"}\n\n";
        let mut r = JsonLinesReader::new(&data[..], "test.log");
        let rec = r.read_record().unwrap().unwrap();
        assert_eq!(rec.canonical_string(), r#"{"msg":"record1"}"#);
        assert!(r.read_record().unwrap().is_none());
    }

    #[test]
    fn invalid_json_is_an_error() {
        let data = b"not json\n";
        let mut r = JsonLinesReader::new(&data[..], "test.log");
        assert!(r.read_record().is_err());
    }
}
