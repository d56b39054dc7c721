//! Bounded-size time index over a pcap file, and the query that turns a
//! time span into the minimal list of byte ranges worth re-reading.
//!
//! The index trades exactness for a fixed memory footprint: each section's
//! packet timeline is decimated down to at most `limit` (offset, timestamp)
//! slots forming a monotone step function (an "envelope"). A query against
//! the envelope always returns a domain at least as wide as the true
//! packet range, so a second pass of packet-level filtering is still
//! required for bit-exact extraction (see `pcap::search`).

use serde::{Deserialize, Serialize};

use crate::error::{CoreError, Result};
use crate::pcap::framing::{BlockKind, FramingReader};

/// One (offset, timestamp) step of an envelope: "a packet with timestamp
/// ≥ `timestamp_ns` starts at or after `offset`". Encoded on the wire as a
/// plain `[offset, timestamp_ns]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "(u64, u64)", from = "(u64, u64)")]
pub struct Slot {
    pub offset: u64,
    pub timestamp_ns: u64,
}

impl From<Slot> for (u64, u64) {
    fn from(slot: Slot) -> Self {
        (slot.offset, slot.timestamp_ns)
    }
}

impl From<(u64, u64)> for Slot {
    fn from((offset, timestamp_ns): (u64, u64)) -> Self {
        Self { offset, timestamp_ns }
    }
}

/// A monotone step-function approximation of a section's packet timeline,
/// capped at a caller-chosen number of slots.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope(pub Vec<Slot>);

impl Envelope {
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Find the smallest `[offset_a, offset_b)` domain whose y-range
    /// (timestamp range) covers `[lo, hi]`, extending outward to the
    /// nearest bracketing slots. Returns `None` if the envelope is empty
    /// or the resulting domain would be empty.
    #[must_use]
    pub fn find_smallest_domain(&self, lo: u64, hi: u64) -> Option<(u64, u64)> {
        if self.0.is_empty() {
            return None;
        }
        // Rightmost slot with timestamp <= lo, else the first slot.
        let left = self
            .0
            .iter()
            .rposition(|s| s.timestamp_ns <= lo)
            .unwrap_or(0);
        // Leftmost slot with timestamp >= hi, else the last slot.
        let right = self
            .0
            .iter()
            .position(|s| s.timestamp_ns >= hi)
            .unwrap_or(self.0.len() - 1);
        let offset_a = self.0[left].offset;
        let offset_b = self.0[right].offset;
        if offset_b <= offset_a {
            return None;
        }
        Some((offset_a, offset_b))
    }
}

/// A verbatim byte range that must be replayed for the index's output to
/// remain a structurally valid pcap (file headers, section headers,
/// interface descriptions). Encoded on the wire as a plain
/// `[offset, length]` pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "(u64, u64)", from = "(u64, u64)")]
pub struct BlockRange {
    pub offset: u64,
    pub length: u64,
}

impl From<BlockRange> for (u64, u64) {
    fn from(range: BlockRange) -> Self {
        (range.offset, range.length)
    }
}

impl From<(u64, u64)> for BlockRange {
    fn from((offset, length): (u64, u64)) -> Self {
        Self { offset, length }
    }
}

/// One pcap-ng section (or the whole file, for classic pcap, which has
/// exactly one section).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Section {
    pub blocks: Vec<BlockRange>,
    #[serde(rename = "index")]
    pub envelope: Envelope,
}

/// The full index of a pcap file: an ordered list of sections, each
/// wrapped under a `section` key on the wire (`[{"section": {...}}, ...]`).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(into = "Vec<SectionEntry>", from = "Vec<SectionEntry>")]
pub struct Index(pub Vec<Section>);

#[derive(Debug, Clone, Serialize, Deserialize)]
struct SectionEntry {
    section: Section,
}

impl From<Index> for Vec<SectionEntry> {
    fn from(index: Index) -> Self {
        index
            .0
            .into_iter()
            .map(|section| SectionEntry { section })
            .collect()
    }
}

impl From<Vec<SectionEntry>> for Index {
    fn from(entries: Vec<SectionEntry>) -> Self {
        Self(entries.into_iter().map(|entry| entry.section).collect())
    }
}

struct Builder {
    limit: usize,
    sections: Vec<Section>,
    current_blocks: Vec<BlockRange>,
    packets: Vec<Slot>,
    last_timestamp_ns: u64,
    last_packet_end: u64,
}

impl Builder {
    fn new(limit: usize) -> Self {
        Self {
            limit: limit.max(1),
            sections: Vec::new(),
            current_blocks: Vec::new(),
            packets: Vec::new(),
            last_timestamp_ns: 0,
            last_packet_end: 0,
        }
    }

    fn finish_section(&mut self) {
        let envelope = decimate(&self.packets, self.last_packet_end, self.limit);
        self.sections.push(Section {
            blocks: std::mem::take(&mut self.current_blocks),
            envelope,
        });
        self.packets.clear();
        self.last_timestamp_ns = 0;
        self.last_packet_end = 0;
    }

    fn build<R: std::io::Read>(mut self, reader: &mut FramingReader<R>) -> Result<Index> {
        let mut seen_any_block = false;
        while let Some(block) = reader.next_block()? {
            if block.kind == BlockKind::SectionHeader && seen_any_block {
                self.finish_section();
            }
            seen_any_block = true;
            match block.kind {
                BlockKind::Packet => {
                    let ts = block.timestamp_ns.unwrap_or(self.last_timestamp_ns);
                    self.last_timestamp_ns = ts.max(self.last_timestamp_ns);
                    self.last_packet_end = block.offset + block.len();
                    self.packets.push(Slot {
                        offset: block.offset,
                        timestamp_ns: ts,
                    });
                }
                _ => self.current_blocks.push(BlockRange {
                    offset: block.offset,
                    length: block.len(),
                }),
            }
        }
        if !seen_any_block {
            return Err(CoreError::InvalidPcap("empty pcap stream".to_string()));
        }
        self.finish_section();
        Ok(Index(self.sections))
    }
}

fn decimate(packets: &[Slot], section_end_offset: u64, limit: usize) -> Envelope {
    if packets.is_empty() {
        return Envelope::default();
    }
    // The sentinel counts against `limit` too, so decimate to `limit - 1`
    // before appending it.
    let budget = limit.saturating_sub(1).max(1);
    let mut k = 0u32;
    while packets.len().div_ceil(1usize << k) > budget {
        k += 1;
    }
    let step = 1usize << k;
    let mut slots: Vec<Slot> = packets.iter().step_by(step).copied().collect();
    let max_ts = packets.iter().map(|s| s.timestamp_ns).max().unwrap_or(0);
    slots.push(Slot {
        offset: section_end_offset,
        timestamp_ns: max_ts,
    });
    Envelope(slots)
}

/// Build an [`Index`] by scanning `reader` end to end. `limit` bounds the
/// number of envelope slots kept per section.
pub fn create_index<R: std::io::Read>(reader: R, limit: usize) -> Result<Index> {
    let mut framing = FramingReader::new(reader);
    Builder::new(limit).build(&mut framing)
}

/// Translate a time span `[lo, hi)` (nanoseconds) into the ordered list of
/// byte ranges that must be read to reconstruct a valid pcap covering it.
/// An empty result means no section's envelope intersects the span.
#[must_use]
pub fn generate_slices(index: &Index, lo: u64, hi: u64) -> Vec<(u64, u64)> {
    let mut slices = Vec::new();
    for section in &index.0 {
        let Some((offset_a, offset_b)) = section.envelope.find_smallest_domain(lo, hi) else {
            continue;
        };
        for block in &section.blocks {
            slices.push((block.offset, block.length));
        }
        slices.push((offset_a, offset_b - offset_a));
    }
    slices
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_pcap_with_packets(timestamps_sec: &[u32]) -> Vec<u8> {
        let mut data = Vec::new();
        data.extend_from_slice(&[0xD4, 0xC3, 0xB2, 0xA1]);
        data.extend_from_slice(&[0; 20]);
        for &sec in timestamps_sec {
            data.extend_from_slice(&sec.to_le_bytes());
            data.extend_from_slice(&0u32.to_le_bytes());
            data.extend_from_slice(&4u32.to_le_bytes());
            data.extend_from_slice(&4u32.to_le_bytes());
            data.extend_from_slice(b"data");
        }
        data
    }

    #[test]
    fn invalid_stream_is_an_error() {
        let err = create_index(&b"this is not a valid pcap."[..], 100);
        assert!(err.is_err());
    }

    #[test]
    fn empty_packet_array_yields_empty_envelope() {
        let data = legacy_pcap_with_packets(&[]);
        let index = create_index(&data[..], 100).unwrap();
        assert_eq!(index.0.len(), 1);
        assert!(index.0[0].envelope.is_empty());
    }

    #[test]
    fn decimates_to_requested_limit() {
        let timestamps: Vec<u32> = (0..100).collect();
        let data = legacy_pcap_with_packets(&timestamps);
        let index = create_index(&data[..], 8).unwrap();
        // The trailing sentinel slot counts against the limit too.
        assert!(index.0[0].envelope.0.len() <= 8);
    }

    #[test]
    fn query_returns_no_slices_outside_span() {
        let timestamps: Vec<u32> = (0..10).collect();
        let data = legacy_pcap_with_packets(&timestamps);
        let index = create_index(&data[..], 100).unwrap();
        let slices = generate_slices(&index, 1_000_000_000_000, 2_000_000_000_000);
        assert!(slices.is_empty());
    }

    #[test]
    fn query_brackets_outward_to_nearest_slots() {
        let timestamps: Vec<u32> = (0..10).collect();
        let data = legacy_pcap_with_packets(&timestamps);
        let index = create_index(&data[..], 100).unwrap();
        // A span wholly inside [2s, 3s) must still bracket outward to
        // slots at or before/after it.
        let slices = generate_slices(
            &index,
            2_500_000_000,
            2_600_000_000,
        );
        assert_eq!(slices.len(), 2); // file header block + one packet range
        let (header_offset, header_len) = slices[0];
        assert_eq!((header_offset, header_len), (0, 24));
    }
}
