//! Shaper integration: an opaque record-transform hook.
//!
//! The core does not parse or execute shaper expressions itself; it only
//! defines the trait boundary an expression engine plugs into.

use crate::error::Result;
use crate::record::Record;

/// Transforms one record into zero or one records. `Ok(None)` drops the
/// record from the stream; `Err` is routed through the warner by the
/// caller, not treated as fatal to the rest of the stream.
pub trait Shaper: Send + Sync {
    fn shape(&self, record: Record) -> Result<Option<Record>>;
}

/// Passes every record through unchanged. Used for analyzers with no
/// configured shaper, and as the fallback when a shaper string is
/// present but no engine was injected.
#[derive(Debug)]
pub struct IdentityShaper;

impl Shaper for IdentityShaper {
    fn shape(&self, record: Record) -> Result<Option<Record>> {
        Ok(Some(record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn identity_shaper_passes_record_through() {
        let record = Record::new(json!({"a": 1}));
        let shaped = IdentityShaper.shape(record.clone()).unwrap();
        assert_eq!(shaped.unwrap().canonical_string(), record.canonical_string());
    }
}
