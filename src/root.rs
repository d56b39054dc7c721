//! Content-addressed root store: associates a pcap's SHA-256 digest with
//! its time index and original path, and answers flow-search requests by
//! slicing and re-searching every indexed pcap that could contain a match.

use std::io::Read;
use std::path::{Path, PathBuf};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use crate::error::{CoreError, Result};
use crate::pcap::index::{self, Index};
use crate::pcap::search::{self, SearchRequest};
use crate::pcap::slicer::{Slice, SlicedReader};

/// Pads the end of a caller's span to tolerate microsecond-truncated
/// downstream timestamps landing exactly on the boundary.
const SPAN_END_PADDING_NS: u64 = 2000;

/// One entry's on-disk shape: `idx-<base64url(sha256)>.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RootEntry {
    #[serde(rename = "pcap_path")]
    absolute_path: PathBuf,
    index: Index,
}

/// Reads through to an inner reader while feeding every byte into a
/// SHA-256 hasher, so indexing and hashing happen in one pass.
struct HashingReader<R> {
    inner: R,
    hasher: Sha256,
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

/// A directory of `idx-*.json` entries, each a time index over one
/// previously-added pcap file.
#[derive(Debug, Clone)]
pub struct Root {
    dir: PathBuf,
}

impl Root {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn entry_paths(&self) -> Result<Vec<PathBuf>> {
        let mut paths = Vec::new();
        for entry in std::fs::read_dir(&self.dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("idx-") && name.ends_with(".json") {
                paths.push(entry.path());
            }
        }
        Ok(paths)
    }

    /// Opens `path`, indexes it while hashing its bytes, and writes
    /// `idx-<base64url(sha256)>.json` into the root.
    pub fn add(&self, path: &Path, limit: usize) -> Result<PathBuf> {
        let absolute_path = std::fs::canonicalize(path)?;
        let file = std::fs::File::open(&absolute_path)?;
        let mut hashing = HashingReader { inner: file, hasher: Sha256::new() };
        let built_index = index::create_index(&mut hashing, limit)?;
        let digest = hashing.hasher.finalize();
        let hash = URL_SAFE_NO_PAD.encode(digest);

        let entry_path = self.dir.join(format!("idx-{hash}.json"));
        let entry = RootEntry { absolute_path, index: built_index };
        let json = serde_json::to_vec_pretty(&entry)?;
        std::fs::write(&entry_path, json)?;
        info!(path = %entry_path.display(), "added pcap to root");
        Ok(entry_path)
    }

    /// Removes every entry whose stored absolute path equals `path`'s
    /// canonical form. Returns the number of entries removed.
    pub fn delete(&self, path: &Path) -> Result<usize> {
        let absolute_path = std::fs::canonicalize(path)?;
        let mut removed = 0;
        for entry_path in self.entry_paths()? {
            let bytes = std::fs::read(&entry_path)?;
            let entry: RootEntry = serde_json::from_slice(&bytes)?;
            if entry.absolute_path == absolute_path {
                std::fs::remove_file(&entry_path)?;
                removed += 1;
            }
        }
        Ok(removed)
    }

    /// Searches every entry for packets matching `request`, streaming the
    /// sliced-and-filtered pcap bytes of each match to `sink` in
    /// completion order. Fails with [`CoreError::NoPcapsFound`] if nothing
    /// matched across the whole root.
    pub async fn search(&self, mut request: SearchRequest, sink: mpsc::Sender<Vec<u8>>) -> Result<()> {
        request.span_hi_ns = request.span_hi_ns.saturating_add(SPAN_END_PADDING_NS);

        let mut tasks = JoinSet::new();
        for entry_path in self.entry_paths()? {
            let request = request;
            tasks.spawn_blocking(move || search_one(&entry_path, &request));
        }

        let mut matched_any = false;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(Ok(Some(bytes))) => {
                    matched_any = true;
                    if sink.send(bytes).await.is_err() {
                        return Err(CoreError::Canceled);
                    }
                }
                Ok(Ok(None)) => { eprintln!("DEBUG: Ok(None)"); }
                Ok(Err(e)) => { eprintln!("DEBUG: Ok(Err({e:?}))"); warn!(error = %e, "root entry search failed"); }
                Err(join_err) => { eprintln!("DEBUG: join_err {join_err:?}"); warn!(error = %join_err, "root search task panicked"); }
            }
        }

        if !matched_any {
            return Err(CoreError::NoPcapsFound);
        }
        Ok(())
    }
}

/// Loads one entry, restricts the read to the byte ranges its envelope
/// says could contain the span, and runs the exact flow-search filter
/// over just those bytes. `Ok(None)` means this entry had no overlap or
/// no matching packet, distinct from a hard I/O/format error.
fn search_one(entry_path: &Path, request: &SearchRequest) -> Result<Option<Vec<u8>>> {
    let bytes = std::fs::read(entry_path)?;
    let entry: RootEntry = serde_json::from_slice(&bytes)?;

    let ranges = index::generate_slices(&entry.index, request.span_lo_ns, request.span_hi_ns);
    if ranges.is_empty() {
        return Ok(None);
    }
    let slices: Vec<Slice> = ranges.into_iter().map(|(offset, length)| Slice { offset, length }).collect();

    eprintln!("DEBUG: slices = {slices:?}");
    let file = std::fs::File::open(&entry.absolute_path)?;
    let sliced = SlicedReader::new(file, slices);
    match search::search(sliced, request) {
        Ok(pcap_bytes) => {
            debug!(path = %entry.absolute_path.display(), "root entry matched");
            Ok(Some(pcap_bytes))
        }
        Err(CoreError::NoPcapsFound) => { eprintln!("DEBUG: NoPcapsFound for entry"); Ok(None) },
        Err(e) => { eprintln!("DEBUG ERR: {e:?}"); Err(e) },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pcap::search::Protocol;
    use std::io::Write as _;
    use std::net::IpAddr;

    fn sample_pcap() -> Vec<u8> {
        // Classic pcap, one packet: an IPv4/TCP frame with a minimal
        // Ethernet header, timestamped at 1s.
        let mut eth = Vec::new();
        eth.extend_from_slice(&[0u8; 12]); // dst + src MAC
        eth.extend_from_slice(&0x0800u16.to_be_bytes()); // EtherType IPv4
        let mut ip = vec![0x45, 0, 0, 40, 0, 0, 0, 0, 64, 6, 0, 0];
        ip.extend_from_slice(&[10, 0, 0, 1]);
        ip.extend_from_slice(&[10, 0, 0, 2]);
        let mut tcp = vec![0x04, 0xd2]; // src port 1234
        tcp.extend_from_slice(&80u16.to_be_bytes()); // dst port 80
        tcp.extend_from_slice(&[0; 16]);
        let mut frame = eth;
        frame.extend_from_slice(&ip);
        frame.extend_from_slice(&tcp);

        let mut data = Vec::new();
        data.extend_from_slice(&[0xD4, 0xC3, 0xB2, 0xA1]);
        data.extend_from_slice(&[0; 20]);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        data.extend_from_slice(&(frame.len() as u32).to_le_bytes());
        data.extend_from_slice(&frame);
        data
    }

    #[test]
    fn add_writes_content_addressed_entry() {
        let root_dir = tempfile::tempdir().unwrap();
        let root = Root::open(root_dir.path()).unwrap();
        let mut pcap_file = tempfile::NamedTempFile::new().unwrap();
        pcap_file.write_all(&sample_pcap()).unwrap();
        pcap_file.flush().unwrap();

        let entry_path = root.add(pcap_file.path(), 100).unwrap();
        assert!(entry_path.exists());
        assert!(entry_path.file_name().unwrap().to_string_lossy().starts_with("idx-"));
    }

    #[test]
    fn delete_removes_matching_entries() {
        let root_dir = tempfile::tempdir().unwrap();
        let root = Root::open(root_dir.path()).unwrap();
        let mut pcap_file = tempfile::NamedTempFile::new().unwrap();
        pcap_file.write_all(&sample_pcap()).unwrap();
        pcap_file.flush().unwrap();

        root.add(pcap_file.path(), 100).unwrap();
        let removed = root.delete(pcap_file.path()).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(root.entry_paths().unwrap().len(), 0);
    }

    #[tokio::test]
    async fn search_finds_matching_flow() {
        let root_dir = tempfile::tempdir().unwrap();
        let root = Root::open(root_dir.path()).unwrap();
        let mut pcap_file = tempfile::NamedTempFile::new().unwrap();
        pcap_file.write_all(&sample_pcap()).unwrap();
        pcap_file.flush().unwrap();
        root.add(pcap_file.path(), 100).unwrap();

        let request = SearchRequest {
            span_lo_ns: 0,
            span_hi_ns: 2_000_000_000,
            protocol: Protocol::Tcp,
            src_ip: "10.0.0.1".parse::<IpAddr>().unwrap(),
            src_port: 1234,
            dst_ip: "10.0.0.2".parse::<IpAddr>().unwrap(),
            dst_port: 80,
        };
        let (tx, mut rx) = mpsc::channel(4);
        root.search(request, tx).await.unwrap();
        let result = rx.recv().await.unwrap();
        assert!(!result.is_empty());
    }

    #[tokio::test]
    async fn search_with_no_entries_is_no_pcaps_found() {
        let root_dir = tempfile::tempdir().unwrap();
        let root = Root::open(root_dir.path()).unwrap();
        let request = SearchRequest {
            span_lo_ns: 0,
            span_hi_ns: 1,
            protocol: Protocol::Tcp,
            src_ip: "10.0.0.1".parse::<IpAddr>().unwrap(),
            src_port: 1,
            dst_ip: "10.0.0.2".parse::<IpAddr>().unwrap(),
            dst_port: 2,
        };
        let (tx, _rx) = mpsc::channel(4);
        let err = root.search(request, tx).await.unwrap_err();
        assert!(matches!(err, CoreError::NoPcapsFound));
    }
}
