//! Pcap / pcap-ng framing reader.
//!
//! Decodes the block structure of a pcap byte stream without interpreting
//! packet payloads. Every yielded [`Block`] carries its absolute offset and
//! total length so that the indexer (`pcap::index`) can record exactly
//! which byte ranges must be replayed to reconstruct a valid pcap from a
//! slice of the original file.
//!
//! See <https://www.ietf.org/archive/id/draft-tuexen-opsawg-pcapng-04.html>
//! for the pcap-ng block layout this module implements.

use std::io::Read;

use crate::error::{CoreError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Endianness {
    Big,
    Little,
}

impl Endianness {
    fn u16(self, b: [u8; 2]) -> u16 {
        match self {
            Self::Big => u16::from_be_bytes(b),
            Self::Little => u16::from_le_bytes(b),
        }
    }

    fn u32(self, b: [u8; 4]) -> u32 {
        match self {
            Self::Big => u32::from_be_bytes(b),
            Self::Little => u32::from_le_bytes(b),
        }
    }
}

/// What kind of block was just decoded. Packet blocks carry their decoded
/// timestamp (when the format provides one) and source interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockKind {
    FileHeader,
    SectionHeader,
    InterfaceDescription,
    Packet,
    Other,
}

/// One decoded block: its position in the stream, its kind, its verbatim
/// bytes (needed to replay structural blocks into a slice), and, for
/// packets, the nanosecond timestamp and originating interface.
#[derive(Debug, Clone)]
pub struct Block {
    pub offset: u64,
    pub bytes: Vec<u8>,
    pub kind: BlockKind,
    pub timestamp_ns: Option<u64>,
    pub interface_index: Option<u32>,
    /// For `Packet` blocks, the raw link-layer frame with every
    /// format-specific record/block header stripped off. `None` for
    /// non-packet blocks.
    pub frame: Option<Vec<u8>>,
}

impl Block {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    #[must_use]
    pub fn is_structural(&self) -> bool {
        !matches!(self.kind, BlockKind::Packet)
    }
}

const LEGACY_MAGIC_LE_MICRO: [u8; 4] = [0xD4, 0xC3, 0xB2, 0xA1];
const LEGACY_MAGIC_BE_MICRO: [u8; 4] = [0xA1, 0xB2, 0xC3, 0xD4];
const LEGACY_MAGIC_LE_NANO: [u8; 4] = [0x4D, 0x3C, 0xB2, 0xA1];
const LEGACY_MAGIC_BE_NANO: [u8; 4] = [0xA1, 0xB2, 0x3C, 0x4D];
const NG_MAGIC: [u8; 4] = [0x0A, 0x0D, 0x0D, 0x0A];
const NG_BYTE_ORDER_MAGIC_LE: [u8; 4] = [0x4D, 0x3C, 0x2B, 0x1A];
const NG_BYTE_ORDER_MAGIC_BE: [u8; 4] = [0x1A, 0x2B, 0x3C, 0x4D];

const NG_BLOCK_SECTION_HEADER: u32 = 0x0A0D_0D0A;
const NG_BLOCK_INTERFACE_DESCRIPTION: u32 = 1;
const NG_BLOCK_PACKET: u32 = 2;
const NG_BLOCK_SIMPLE_PACKET: u32 = 3;
const NG_BLOCK_ENHANCED_PACKET: u32 = 6;

const NG_OPT_END_OF_OPTIONS: u16 = 0;
const NG_OPT_IF_TSRESOL: u16 = 9;
const NG_OPT_IF_TSOFFSET: u16 = 14;

#[derive(Debug, Clone, Copy)]
struct Interface {
    /// Base-10 exponent (or base-2 if `binary` is set) of the timestamp
    /// resolution: resolution = base^exponent units per second.
    binary: bool,
    exponent: u8,
    offset_seconds: u64,
}

impl Default for Interface {
    fn default() -> Self {
        // Default per the pcap-ng spec: microsecond resolution (10^-6).
        Self {
            binary: false,
            exponent: 6,
            offset_seconds: 0,
        }
    }
}

impl Interface {
    fn scale_to_nanos(self, units: u64) -> u64 {
        let units_per_sec: u128 = if self.binary {
            1u128 << self.exponent
        } else {
            10u128.pow(u32::from(self.exponent))
        };
        let ns = (u128::from(units) * 1_000_000_000u128) / units_per_sec.max(1);
        ns as u64 + self.offset_seconds * 1_000_000_000
    }
}

#[derive(Debug)]
enum Format {
    Unknown,
    Legacy { endianness: Endianness, nano: bool },
    Ng,
}

/// Lazily decodes a pcap or pcap-ng byte stream into a sequence of
/// [`Block`]s. Not restartable: once a structural violation is hit the
/// reader is poisoned and every subsequent call returns the same error.
#[derive(Debug)]
pub struct FramingReader<R> {
    inner: R,
    offset: u64,
    format: Format,
    ng_endianness: Endianness,
    interfaces: Vec<Interface>,
    poisoned: bool,
}

impl<R: Read> FramingReader<R> {
    #[must_use]
    pub fn new(inner: R) -> Self {
        Self {
            inner,
            offset: 0,
            format: Format::Unknown,
            ng_endianness: Endianness::Little,
            interfaces: Vec::new(),
            poisoned: false,
        }
    }

    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset
    }

    fn read_exact_counted(&mut self, buf: &mut [u8]) -> Result<()> {
        self.inner.read_exact(buf)?;
        self.offset += buf.len() as u64;
        Ok(())
    }

    /// Reads `n` bytes, returning `Ok(None)` only if zero bytes were
    /// available (a clean EOF between blocks); any partial read is a
    /// truncation error.
    fn try_read_exact(&mut self, n: usize) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; n];
        let mut read = 0;
        while read < n {
            let got = self.inner.read(&mut buf[read..])?;
            if got == 0 {
                if read == 0 {
                    return Ok(None);
                }
                return Err(CoreError::InvalidPcap(format!(
                    "truncated block: expected {n} bytes, got {read}"
                )));
            }
            read += got;
        }
        self.offset += n as u64;
        Ok(Some(buf))
    }

    fn invalid(msg: impl Into<String>) -> CoreError {
        CoreError::InvalidPcap(msg.into())
    }

    /// Returns the next block, or `Ok(None)` at a clean end of stream.
    pub fn next_block(&mut self) -> Result<Option<Block>> {
        if self.poisoned {
            return Err(Self::invalid("reader already failed"));
        }
        let result = self.next_block_inner();
        if result.is_err() {
            self.poisoned = true;
        }
        result
    }

    fn next_block_inner(&mut self) -> Result<Option<Block>> {
        match self.format {
            Format::Unknown => self.detect_and_read_first_block(),
            Format::Legacy { endianness, nano } => self.read_legacy_packet(endianness, nano),
            Format::Ng => self.read_ng_block(),
        }
    }

    fn detect_and_read_first_block(&mut self) -> Result<Option<Block>> {
        let start = self.offset;
        let Some(magic) = self.try_read_exact(4)? else {
            return Ok(None);
        };
        let magic: [u8; 4] = magic.try_into().expect("read exactly 4 bytes");
        match magic {
            LEGACY_MAGIC_LE_MICRO => self.read_legacy_header(start, magic, Endianness::Little, false),
            LEGACY_MAGIC_BE_MICRO => self.read_legacy_header(start, magic, Endianness::Big, false),
            LEGACY_MAGIC_LE_NANO => self.read_legacy_header(start, magic, Endianness::Little, true),
            LEGACY_MAGIC_BE_NANO => self.read_legacy_header(start, magic, Endianness::Big, true),
            NG_MAGIC => {
                self.format = Format::Ng;
                self.read_ng_section_header(start, &magic)
            }
            _ => Err(Self::invalid(format!(
                "unrecognized magic bytes {magic:02x?}"
            ))),
        }
    }

    fn read_legacy_header(
        &mut self,
        start: u64,
        magic: [u8; 4],
        endianness: Endianness,
        nano: bool,
    ) -> Result<Option<Block>> {
        let Some(rest) = self.try_read_exact(20)? else {
            return Err(Self::invalid("truncated pcap global header"));
        };
        self.format = Format::Legacy { endianness, nano };
        let mut bytes = Vec::with_capacity(24);
        bytes.extend_from_slice(&magic);
        bytes.extend_from_slice(&rest);
        Ok(Some(Block {
            offset: start,
            bytes,
            kind: BlockKind::FileHeader,
            timestamp_ns: None,
            interface_index: None,
            frame: None,
        }))
    }

    fn read_legacy_packet(&mut self, endianness: Endianness, nano: bool) -> Result<Option<Block>> {
        let start = self.offset;
        let Some(header) = self.try_read_exact(16)? else {
            return Ok(None);
        };
        let ts_sec = endianness.u32(header[0..4].try_into().unwrap());
        let ts_frac = endianness.u32(header[4..8].try_into().unwrap());
        let incl_len = endianness.u32(header[8..12].try_into().unwrap());
        let Some(payload) = self.try_read_exact(incl_len as usize)? else {
            return Err(Self::invalid("truncated packet payload"));
        };
        let frac_ns = if nano { u64::from(ts_frac) } else { u64::from(ts_frac) * 1000 };
        let timestamp_ns = u64::from(ts_sec) * 1_000_000_000 + frac_ns;
        let mut bytes = Vec::with_capacity(16 + payload.len());
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(&payload);
        Ok(Some(Block {
            offset: start,
            bytes,
            kind: BlockKind::Packet,
            timestamp_ns: Some(timestamp_ns),
            interface_index: Some(0),
            frame: Some(payload),
        }))
    }

    fn read_ng_section_header(&mut self, start: u64, magic: &[u8; 4]) -> Result<Option<Block>> {
        let Some(len_raw) = self.try_read_exact(4)? else {
            return Err(Self::invalid("truncated section header block"));
        };
        let Some(bom_raw) = self.try_read_exact(4)? else {
            return Err(Self::invalid("truncated section header block"));
        };
        let bom: [u8; 4] = bom_raw.clone().try_into().unwrap();
        self.ng_endianness = match bom {
            NG_BYTE_ORDER_MAGIC_LE => Endianness::Little,
            NG_BYTE_ORDER_MAGIC_BE => Endianness::Big,
            _ => return Err(Self::invalid(format!("bad pcap-ng byte order magic {bom:02x?}"))),
        };
        let total_len = self
            .ng_endianness
            .u32(len_raw.clone().try_into().unwrap());
        if total_len < 16 {
            return Err(Self::invalid("section header block too short"));
        }
        let remaining = total_len as usize - 16;
        let Some(rest) = self.try_read_exact(remaining)? else {
            return Err(Self::invalid("truncated section header block"));
        };
        self.interfaces.clear();
        let mut bytes = Vec::with_capacity(total_len as usize);
        bytes.extend_from_slice(magic);
        bytes.extend_from_slice(&len_raw);
        bytes.extend_from_slice(&bom_raw);
        bytes.extend_from_slice(&rest);
        self.verify_trailer(total_len, &mut bytes)?;
        Ok(Some(Block {
            offset: start,
            bytes,
            kind: BlockKind::SectionHeader,
            timestamp_ns: None,
            interface_index: None,
            frame: None,
        }))
    }

    fn verify_trailer(&mut self, total_len: u32, bytes: &mut Vec<u8>) -> Result<()> {
        let Some(trailer) = self.try_read_exact(4)? else {
            return Err(Self::invalid("truncated block trailer"));
        };
        let trailer_len = self.ng_endianness.u32(trailer.clone().try_into().unwrap());
        if trailer_len != total_len {
            return Err(Self::invalid(format!(
                "block length mismatch: header said {total_len}, trailer said {trailer_len}"
            )));
        }
        bytes.extend_from_slice(&trailer);
        Ok(())
    }

    fn read_ng_block(&mut self) -> Result<Option<Block>> {
        let start = self.offset;
        let Some(type_raw) = self.try_read_exact(4)? else {
            return Ok(None);
        };
        let block_type = self.ng_endianness.u32(type_raw.clone().try_into().unwrap());
        if block_type == NG_BLOCK_SECTION_HEADER {
            let magic: [u8; 4] = type_raw.try_into().unwrap();
            return self.read_ng_section_header(start, &magic);
        }
        let Some(len_raw) = self.try_read_exact(4)? else {
            return Err(Self::invalid("truncated pcap-ng block header"));
        };
        let total_len = self.ng_endianness.u32(len_raw.clone().try_into().unwrap());
        if total_len < 12 {
            return Err(Self::invalid("pcap-ng block shorter than its own header"));
        }
        let body_len = total_len as usize - 12;
        let Some(body) = self.try_read_exact(body_len)? else {
            return Err(Self::invalid("truncated pcap-ng block body"));
        };
        let mut bytes = Vec::with_capacity(total_len as usize);
        bytes.extend_from_slice(&type_raw);
        bytes.extend_from_slice(&len_raw);
        bytes.extend_from_slice(&body);
        self.verify_trailer(total_len, &mut bytes)?;

        let (kind, timestamp_ns, interface_index, frame) = match block_type {
            NG_BLOCK_INTERFACE_DESCRIPTION => {
                self.register_interface(&body)?;
                (BlockKind::InterfaceDescription, None, None, None)
            }
            NG_BLOCK_ENHANCED_PACKET => {
                let (ts, iface, frame) = self.decode_enhanced_packet(&body)?;
                (BlockKind::Packet, Some(ts), Some(iface), Some(frame))
            }
            NG_BLOCK_PACKET => {
                let (ts, iface, frame) = self.decode_legacy_ng_packet(&body)?;
                (BlockKind::Packet, Some(ts), Some(iface), Some(frame))
            }
            NG_BLOCK_SIMPLE_PACKET => {
                let frame = body.get(4..).unwrap_or_default().to_vec();
                (BlockKind::Packet, None, Some(0), Some(frame))
            }
            _ => (BlockKind::Other, None, None, None),
        };
        Ok(Some(Block {
            offset: start,
            bytes,
            kind,
            timestamp_ns,
            interface_index,
            frame,
        }))
    }

    fn register_interface(&mut self, body: &[u8]) -> Result<()> {
        if body.len() < 8 {
            return Err(Self::invalid("truncated interface description block"));
        }
        let mut iface = Interface::default();
        let mut pos = 8; // linktype(2) + reserved(2) + snaplen(4)
        while pos + 4 <= body.len() {
            let code = self.ng_endianness.u16(body[pos..pos + 2].try_into().unwrap());
            let len = self.ng_endianness.u16(body[pos + 2..pos + 4].try_into().unwrap()) as usize;
            pos += 4;
            if code == NG_OPT_END_OF_OPTIONS {
                break;
            }
            if pos + len > body.len() {
                return Err(Self::invalid("truncated interface option"));
            }
            let value = &body[pos..pos + len];
            match code {
                NG_OPT_IF_TSRESOL if !value.is_empty() => {
                    let raw = value[0];
                    iface.binary = raw & 0x80 != 0;
                    iface.exponent = raw & 0x7F;
                }
                NG_OPT_IF_TSOFFSET if value.len() >= 8 => {
                    iface.offset_seconds = self.ng_endianness.u32(value[0..4].try_into().unwrap()) as u64
                        | (u64::from(self.ng_endianness.u32(value[4..8].try_into().unwrap())) << 32);
                }
                _ => {}
            }
            pos += len;
            pos = (pos + 3) & !3; // options are padded to a 4-byte boundary
        }
        self.interfaces.push(iface);
        Ok(())
    }

    fn interface(&self, index: u32) -> Interface {
        self.interfaces
            .get(index as usize)
            .copied()
            .unwrap_or_default()
    }

    fn decode_enhanced_packet(&mut self, body: &[u8]) -> Result<(u64, u32, Vec<u8>)> {
        if body.len() < 20 {
            return Err(Self::invalid("truncated enhanced packet block"));
        }
        let iface_id = self.ng_endianness.u32(body[0..4].try_into().unwrap());
        let ts_high = self.ng_endianness.u32(body[4..8].try_into().unwrap());
        let ts_low = self.ng_endianness.u32(body[8..12].try_into().unwrap());
        let cap_len = self.ng_endianness.u32(body[12..16].try_into().unwrap()) as usize;
        let units = (u64::from(ts_high) << 32) | u64::from(ts_low);
        let ts_ns = self.interface(iface_id).scale_to_nanos(units);
        let frame = body.get(20..20 + cap_len).unwrap_or_default().to_vec();
        Ok((ts_ns, iface_id, frame))
    }

    fn decode_legacy_ng_packet(&mut self, body: &[u8]) -> Result<(u64, u32, Vec<u8>)> {
        if body.len() < 20 {
            return Err(Self::invalid("truncated packet block"));
        }
        let iface_id = u32::from(self.ng_endianness.u16(body[0..2].try_into().unwrap()));
        let ts_high = self.ng_endianness.u32(body[4..8].try_into().unwrap());
        let ts_low = self.ng_endianness.u32(body[8..12].try_into().unwrap());
        let cap_len = self.ng_endianness.u32(body[12..16].try_into().unwrap()) as usize;
        let units = (u64::from(ts_high) << 32) | u64::from(ts_low);
        let ts_ns = self.interface(iface_id).scale_to_nanos(units);
        let frame = body.get(20..20 + cap_len).unwrap_or_default().to_vec();
        Ok((ts_ns, iface_id, frame))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn legacy_header(nano: bool) -> Vec<u8> {
        let magic = if nano { LEGACY_MAGIC_LE_NANO } else { LEGACY_MAGIC_LE_MICRO };
        let mut b = Vec::new();
        b.extend_from_slice(&magic);
        b.extend_from_slice(&2u16.to_le_bytes()); // version major
        b.extend_from_slice(&4u16.to_le_bytes()); // version minor
        b.extend_from_slice(&0i32.to_le_bytes()); // thiszone
        b.extend_from_slice(&0u32.to_le_bytes()); // sigfigs
        b.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
        b.extend_from_slice(&1u32.to_le_bytes()); // linktype ethernet
        b
    }

    fn legacy_packet(ts_sec: u32, ts_frac: u32, payload: &[u8]) -> Vec<u8> {
        let mut b = Vec::new();
        b.extend_from_slice(&ts_sec.to_le_bytes());
        b.extend_from_slice(&ts_frac.to_le_bytes());
        b.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        b.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        b.extend_from_slice(payload);
        b
    }

    #[test]
    fn reads_legacy_header_and_packets() {
        let mut data = legacy_header(false);
        data.extend(legacy_packet(1, 500_000, b"hello"));
        data.extend(legacy_packet(2, 0, b"world!"));
        let mut r = FramingReader::new(&data[..]);

        let header = r.next_block().unwrap().unwrap();
        assert_eq!(header.kind, BlockKind::FileHeader);
        assert_eq!(header.bytes.len(), 24);

        let p1 = r.next_block().unwrap().unwrap();
        assert_eq!(p1.kind, BlockKind::Packet);
        assert_eq!(p1.timestamp_ns, Some(1_500_000_000));

        let p2 = r.next_block().unwrap().unwrap();
        assert_eq!(p2.timestamp_ns, Some(2_000_000_000));

        assert!(r.next_block().unwrap().is_none());
    }

    #[test]
    fn rejects_bad_magic() {
        let mut r = FramingReader::new(&b"notapcap"[..]);
        assert!(r.next_block().is_err());
    }

    #[test]
    fn rejects_truncated_packet() {
        let mut data = legacy_header(false);
        data.extend_from_slice(&1u32.to_le_bytes());
        data.extend_from_slice(&0u32.to_le_bytes());
        data.extend_from_slice(&10u32.to_le_bytes());
        data.extend_from_slice(&10u32.to_le_bytes());
        data.extend_from_slice(b"short");
        let mut r = FramingReader::new(&data[..]);
        r.next_block().unwrap();
        assert!(r.next_block().is_err());
    }

    fn ng_block(block_type: u32, body: &[u8]) -> Vec<u8> {
        let total_len = (12 + body.len()) as u32;
        let mut b = Vec::new();
        b.extend_from_slice(&block_type.to_le_bytes());
        b.extend_from_slice(&total_len.to_le_bytes());
        b.extend_from_slice(body);
        b.extend_from_slice(&total_len.to_le_bytes());
        b
    }

    fn ng_section_header() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&NG_BYTE_ORDER_MAGIC_LE);
        body.extend_from_slice(&1u16.to_le_bytes());
        body.extend_from_slice(&0u16.to_le_bytes());
        body.extend_from_slice(&(-1i64).to_le_bytes());
        ng_block(NG_BLOCK_SECTION_HEADER, &body)
    }

    fn ng_interface_description() -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&1u16.to_le_bytes()); // linktype ethernet
        body.extend_from_slice(&0u16.to_le_bytes()); // reserved
        body.extend_from_slice(&65535u32.to_le_bytes()); // snaplen
        ng_block(NG_BLOCK_INTERFACE_DESCRIPTION, &body)
    }

    fn ng_enhanced_packet(iface: u32, units: u64, payload: &[u8]) -> Vec<u8> {
        let mut body = Vec::new();
        body.extend_from_slice(&iface.to_le_bytes());
        body.extend_from_slice(&((units >> 32) as u32).to_le_bytes());
        body.extend_from_slice(&(units as u32).to_le_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(&(payload.len() as u32).to_le_bytes());
        body.extend_from_slice(payload);
        while body.len() % 4 != 0 {
            body.push(0);
        }
        ng_block(NG_BLOCK_ENHANCED_PACKET, &body)
    }

    #[test]
    fn reads_ng_section_interface_and_packet() {
        let mut data = ng_section_header();
        data.extend(ng_interface_description());
        // microsecond resolution by default: 1_500_000 units == 1.5s
        data.extend(ng_enhanced_packet(0, 1_500_000, b"hello!"));
        let mut r = FramingReader::new(&data[..]);

        let shb = r.next_block().unwrap().unwrap();
        assert_eq!(shb.kind, BlockKind::SectionHeader);

        let idb = r.next_block().unwrap().unwrap();
        assert_eq!(idb.kind, BlockKind::InterfaceDescription);

        let pkt = r.next_block().unwrap().unwrap();
        assert_eq!(pkt.kind, BlockKind::Packet);
        assert_eq!(pkt.timestamp_ns, Some(1_500_000_000));

        assert!(r.next_block().unwrap().is_none());
    }

    #[test]
    fn rejects_trailer_mismatch() {
        let mut data = ng_section_header();
        let mut bad = ng_interface_description();
        let last = bad.len() - 1;
        bad[last] ^= 0xFF;
        data.extend(bad);
        let mut r = FramingReader::new(&data[..]);
        r.next_block().unwrap();
        assert!(r.next_block().is_err());
    }
}
