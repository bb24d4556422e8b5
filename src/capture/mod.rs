// SPDX-License-Identifier: AGPL-3.0-only
// Reads pcap or pcapng streams (file or stdin) and feeds
// payload-bearing TCP segments on the monitored port into the caller.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result, anyhow};
use etherparse::{NetSlice, SlicedPacket, TransportSlice};
use pcap_parser::data::{ETHERTYPE_IPV4, ETHERTYPE_IPV6, PacketData, get_packetdata};
use pcap_parser::pcapng::Block;
use pcap_parser::traits::{PcapNGPacketBlock, PcapReaderIterator};
use pcap_parser::{Linktype, PcapBlockOwned, PcapError, create_reader};
use tracing::warn;

use crate::reassembly::{ConnectionId, Direction, Packet};

const READER_BUFFER: usize = 65536;

pub fn open_reader(path: &str) -> Result<Box<dyn PcapReaderIterator>> {
    if path == "-" {
        let stdin = io::stdin();
        create_reader(READER_BUFFER, stdin)
            .map_err(|e| anyhow!("failed to create pcap reader: {e}"))
    } else {
        let file = File::open(path).with_context(|| format!("open pcap {path}"))?;
        create_reader(READER_BUFFER, file)
            .map_err(|e| anyhow!("failed to create pcap reader: {e}"))
    }
}

/// Walk every packet block in the stream, handing each decoded
/// segment to `sink`. Returns once the stream is exhausted.
pub fn read_stream<F>(
    reader: &mut Box<dyn PcapReaderIterator>,
    service_port: u16,
    mut sink: F,
) -> Result<()>
where
    F: FnMut(Packet),
{
    let mut legacy_linktype = None;
    let mut idb_linktypes: HashMap<u32, Linktype> = HashMap::new();
    let mut next_if_id: u32 = 0;

    loop {
        match reader.next() {
            Ok((offset, block)) => {
                match block {
                    PcapBlockOwned::LegacyHeader(hdr) => {
                        legacy_linktype = Some(hdr.network);
                    }
                    PcapBlockOwned::Legacy(b) => {
                        let linktype = legacy_linktype.unwrap_or(Linktype::ETHERNET);
                        let ts = UNIX_EPOCH
                            + Duration::from_secs(u64::from(b.ts_sec))
                            + Duration::from_micros(u64::from(b.ts_usec));
                        if let Some(data) = get_packetdata(b.data, linktype, b.caplen as usize) {
                            decode_packet(data, service_port, ts, &mut sink);
                        }
                    }
                    PcapBlockOwned::NG(block) => match block {
                        Block::SectionHeader(_) => {
                            idb_linktypes.clear();
                            next_if_id = 0;
                        }
                        Block::InterfaceDescription(idb) => {
                            idb_linktypes.insert(next_if_id, idb.linktype);
                            next_if_id += 1;
                        }
                        Block::EnhancedPacket(epb) => {
                            if let Some(linktype) = idb_linktypes.get(&epb.if_id) {
                                let ts = ng_timestamp(epb.ts_high, epb.ts_low);
                                if let Some(data) =
                                    get_packetdata(epb.packet_data(), *linktype, epb.caplen as usize)
                                {
                                    decode_packet(data, service_port, ts, &mut sink);
                                }
                            }
                        }
                        Block::SimplePacket(spb) => {
                            if let Some(linktype) = idb_linktypes.get(&0) {
                                if let Some(data) = get_packetdata(
                                    spb.packet_data(),
                                    *linktype,
                                    spb.origlen as usize,
                                ) {
                                    decode_packet(data, service_port, SystemTime::now(), &mut sink);
                                }
                            }
                        }
                        _ => {}
                    },
                }
                reader.consume(offset);
            }
            Err(PcapError::Eof) => break,
            Err(PcapError::Incomplete) => {
                reader
                    .refill()
                    .map_err(|e| anyhow!("failed to refill pcap reader: {e}"))?;
            }
            Err(e) => return Err(anyhow!("pcap parse error: {e}")),
        }
    }
    Ok(())
}

fn decode_packet<F: FnMut(Packet)>(
    data: PacketData<'_>,
    service_port: u16,
    ts: SystemTime,
    sink: &mut F,
) {
    let sliced = match data {
        PacketData::L2(bytes) => SlicedPacket::from_ethernet(bytes),
        PacketData::L3(ethertype, bytes)
            if ethertype == ETHERTYPE_IPV4 || ethertype == ETHERTYPE_IPV6 =>
        {
            SlicedPacket::from_ip(bytes)
        }
        _ => return,
    };
    match sliced {
        Ok(sliced) => {
            if let Some(packet) = segment_from_sliced(sliced, service_port, ts) {
                sink(packet);
            }
        }
        Err(err) => warn!(%err, "skipping undecodable packet"),
    }
}

/// Turn a sliced frame into a segment value, or nothing when it is
/// not TCP, carries no payload, or touches neither side of the
/// monitored port.
fn segment_from_sliced(sliced: SlicedPacket<'_>, service_port: u16, ts: SystemTime) -> Option<Packet> {
    let tcp = match sliced.transport {
        Some(TransportSlice::Tcp(tcp)) => tcp,
        _ => return None,
    };
    let payload = tcp.payload();
    if payload.is_empty() {
        // Pure acknowledgments carry nothing to reassemble.
        return None;
    }
    let (src_ip, dst_ip) = match sliced.net {
        Some(NetSlice::Ipv4(ip)) => (
            pad_v4(ip.header().source()),
            pad_v4(ip.header().destination()),
        ),
        Some(NetSlice::Ipv6(ip)) => (ip.header().source(), ip.header().destination()),
        _ => return None,
    };

    let src_port = tcp.source_port();
    let dst_port = tcp.destination_port();
    let direction = if dst_port == service_port {
        Direction::Inbound
    } else if src_port == service_port {
        Direction::Outbound
    } else {
        return None;
    };
    // The connection identity hangs off the client endpoint so both
    // directions land on the same value.
    let (addr, client_port) = match direction {
        Direction::Inbound => (src_ip, src_port),
        Direction::Outbound => (dst_ip, dst_port),
    };

    let mut raw_ports = [0u8; 4];
    raw_ports[..2].copy_from_slice(&src_port.to_be_bytes());
    raw_ports[2..].copy_from_slice(&dst_port.to_be_bytes());

    Some(Packet {
        seq: tcp.sequence_number(),
        ack: tcp.acknowledgment_number(),
        orig_ack: 0,
        data: payload.to_vec(),
        addr,
        raw_ports,
        id: ConnectionId::new(addr, client_port, service_port),
        direction,
        ts,
    })
}

fn pad_v4(octets: [u8; 4]) -> [u8; 16] {
    let mut addr = [0u8; 16];
    addr[..4].copy_from_slice(&octets);
    addr
}

fn ng_timestamp(ts_high: u32, ts_low: u32) -> SystemTime {
    // Default pcapng resolution; per-interface overrides are rare in
    // the wild and not interpreted here.
    let micros = (u64::from(ts_high) << 32) | u64::from(ts_low);
    UNIX_EPOCH + Duration::from_micros(micros)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Hand-rolled Ethernet/IPv4/TCP frame, mirroring what a capture
    /// would deliver.
    fn build_frame(
        src_ip: [u8; 4],
        dst_ip: [u8; 4],
        src_port: u16,
        dst_port: u16,
        seq: u32,
        ack: u32,
        payload: &[u8],
    ) -> Vec<u8> {
        let mut pkt = Vec::new();
        // Ethernet
        pkt.extend_from_slice(&[0, 1, 2, 3, 4, 5]); // dst mac
        pkt.extend_from_slice(&[6, 7, 8, 9, 10, 11]); // src mac
        pkt.extend_from_slice(&[0x08, 0x00]); // ethertype IPv4
        // IPv4 header
        let total_len = 20 + 20 + payload.len() as u16;
        pkt.extend_from_slice(&[0x45, 0x00]);
        pkt.extend_from_slice(&total_len.to_be_bytes());
        pkt.extend_from_slice(&[0x00, 0x00]); // identification
        pkt.extend_from_slice(&[0x40, 0x00]); // flags/frag offset
        pkt.extend_from_slice(&[64]); // TTL
        pkt.extend_from_slice(&[6]); // protocol TCP
        pkt.extend_from_slice(&[0x00, 0x00]); // checksum (unchecked)
        pkt.extend_from_slice(&src_ip);
        pkt.extend_from_slice(&dst_ip);
        // TCP header
        pkt.extend_from_slice(&src_port.to_be_bytes());
        pkt.extend_from_slice(&dst_port.to_be_bytes());
        pkt.extend_from_slice(&seq.to_be_bytes());
        pkt.extend_from_slice(&ack.to_be_bytes());
        pkt.extend_from_slice(&[0x50, 0x18]); // data offset 5, PSH+ACK
        pkt.extend_from_slice(&0xffffu16.to_be_bytes()); // window
        pkt.extend_from_slice(&[0x00, 0x00]); // checksum (unchecked)
        pkt.extend_from_slice(&[0x00, 0x00]); // urgent pointer
        pkt.extend_from_slice(payload);
        pkt
    }

    fn decode(frame: &[u8], service_port: u16) -> Option<Packet> {
        let sliced = SlicedPacket::from_ethernet(frame).expect("parse frame");
        segment_from_sliced(sliced, service_port, SystemTime::now())
    }

    #[test]
    fn inbound_segment_keeps_the_client_identity() {
        let frame = build_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, 7, 1000, b"GET /");
        let packet = decode(&frame, 80).expect("segment");

        assert_eq!(packet.direction, Direction::Inbound);
        assert_eq!(packet.seq, 7);
        assert_eq!(packet.ack, 1000);
        assert_eq!(packet.data, b"GET /");
        assert_eq!(&packet.addr[..4], &[10, 0, 0, 1]);
        assert_eq!(packet.raw_ports, [0x9c, 0x40, 0x00, 0x50]);
    }

    #[test]
    fn both_directions_share_one_connection_id() {
        let inbound = build_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, 1, 900, b"req");
        let outbound = build_frame([10, 0, 0, 2], [10, 0, 0, 1], 80, 40000, 900, 4, b"resp");
        let inbound = decode(&inbound, 80).expect("inbound");
        let outbound = decode(&outbound, 80).expect("outbound");

        assert_eq!(inbound.direction, Direction::Inbound);
        assert_eq!(outbound.direction, Direction::Outbound);
        assert_eq!(inbound.id, outbound.id);
        assert_eq!(inbound.addr, outbound.addr, "both keep the client address");
    }

    #[test]
    fn unrelated_ports_and_bare_acks_are_filtered() {
        let other = build_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 8443, 1, 1, b"x");
        assert!(decode(&other, 80).is_none());

        let empty = build_frame([10, 0, 0, 1], [10, 0, 0, 2], 40000, 80, 1, 1, b"");
        assert!(decode(&empty, 80).is_none());
    }
}
