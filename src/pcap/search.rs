//! Flow search: filters a pcap byte stream down to the packets of one
//! connection, re-emitting the structural blocks needed to keep the
//! output a valid pcap.

use std::io::Read;
use std::net::IpAddr;

use etherparse::{InternetSlice, IpNumber, SlicedPacket};

use crate::error::{CoreError, Result};
use crate::pcap::framing::{BlockKind, FramingReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
}

/// A connection to search for: a time span plus a directional five-tuple.
/// Ports are ignored for ICMP.
#[derive(Debug, Clone, Copy)]
pub struct SearchRequest {
    pub span_lo_ns: u64,
    pub span_hi_ns: u64,
    pub protocol: Protocol,
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
}

impl SearchRequest {
    fn matches(&self, packet: &ParsedPacket) -> bool {
        if packet.protocol != self.protocol {
            return false;
        }
        if packet.src_ip != self.src_ip || packet.dst_ip != self.dst_ip {
            return false;
        }
        if self.protocol == Protocol::Icmp {
            return true;
        }
        packet.src_port == Some(self.src_port) && packet.dst_port == Some(self.dst_port)
    }
}

struct ParsedPacket {
    protocol: Protocol,
    src_ip: IpAddr,
    dst_ip: IpAddr,
    src_port: Option<u16>,
    dst_port: Option<u16>,
}

fn parse_ethernet_frame(data: &[u8]) -> Option<ParsedPacket> {
    let sliced = SlicedPacket::from_ethernet(data).ok()?;
    match sliced.net? {
        InternetSlice::Ipv4(ipv4) => {
            let header = ipv4.header();
            parse_transport(
                ipv4.payload_ip_number(),
                ipv4.payload().payload,
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
            )
        }
        InternetSlice::Ipv6(ipv6) => {
            let header = ipv6.header();
            let ip_number = ipv6.extensions().first_header()?;
            parse_transport(
                ip_number,
                ipv6.payload().payload,
                IpAddr::from(header.source_addr()),
                IpAddr::from(header.destination_addr()),
            )
        }
        InternetSlice::Arp(_) => None,
    }
}

fn parse_transport(
    ip_number: IpNumber,
    payload: &[u8],
    src_ip: IpAddr,
    dst_ip: IpAddr,
) -> Option<ParsedPacket> {
    match ip_number {
        IpNumber::TCP => {
            let tcp = etherparse::TcpSlice::from_slice(payload).ok()?;
            Some(ParsedPacket {
                protocol: Protocol::Tcp,
                src_ip,
                dst_ip,
                src_port: Some(tcp.source_port()),
                dst_port: Some(tcp.destination_port()),
            })
        }
        IpNumber::UDP => {
            let udp = etherparse::UdpSlice::from_slice(payload).ok()?;
            Some(ParsedPacket {
                protocol: Protocol::Udp,
                src_ip,
                dst_ip,
                src_port: Some(udp.source_port()),
                dst_port: Some(udp.destination_port()),
            })
        }
        IpNumber::ICMP | IpNumber::IPV6_ICMP => Some(ParsedPacket {
            protocol: Protocol::Icmp,
            src_ip,
            dst_ip,
            src_port: None,
            dst_port: None,
        }),
        _ => None,
    }
}

/// Reads every block of `reader`, keeping structural blocks verbatim and
/// packet blocks whose timestamp falls in the span and whose decoded
/// five-tuple matches `request`. Fails with [`CoreError::NoPcapsFound`] if
/// the stream is exhausted without a single matching packet.
pub fn search<R: Read>(reader: R, request: &SearchRequest) -> Result<Vec<u8>> {
    let mut framing = FramingReader::new(reader);
    let mut out = Vec::new();
    let mut matched_any = false;
    while let Some(block) = framing.next_block()? {
        match block.kind {
            BlockKind::Packet => {
                let in_span = match block.timestamp_ns {
                    Some(ts) => ts >= request.span_lo_ns && ts < request.span_hi_ns,
                    None => true,
                };
                if !in_span {
                    continue;
                }
                let Some(frame) = block.frame.as_deref() else {
                    continue;
                };
                let Some(parsed) = parse_ethernet_frame(frame) else {
                    continue;
                };
                if request.matches(&parsed) {
                    matched_any = true;
                    out.extend_from_slice(&block.bytes);
                }
            }
            _ => out.extend_from_slice(&block.bytes),
        }
    }
    if !matched_any {
        return Err(CoreError::NoPcapsFound);
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_stream_yields_no_pcaps_found() {
        let data = {
            let mut d = Vec::new();
            d.extend_from_slice(&[0xD4, 0xC3, 0xB2, 0xA1]);
            d.extend_from_slice(&[0; 20]);
            d
        };
        let request = SearchRequest {
            span_lo_ns: 0,
            span_hi_ns: u64::MAX,
            protocol: Protocol::Tcp,
            src_ip: "10.0.0.1".parse().unwrap(),
            src_port: 1234,
            dst_ip: "10.0.0.2".parse().unwrap(),
            dst_port: 80,
        };
        let err = search(&data[..], &request).unwrap_err();
        assert!(matches!(err, CoreError::NoPcapsFound));
    }
}
