// SPDX-License-Identifier: AGPL-3.0-only

//! Captured TCP segment values and the identity keys derived from
//! them. A `Packet` owns its payload bytes so an in-flight message
//! can hold them for the whole assembly window.

use std::fmt;
use std::time::SystemTime;

/// Direction of a segment relative to the monitored service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    /// Client towards service: carries requests.
    Inbound,
    /// Service towards client: carries responses.
    Outbound,
}

impl Direction {
    pub fn is_inbound(self) -> bool {
        matches!(self, Direction::Inbound)
    }
}

/// Stable identity of one TCP connection, shared by both directions.
/// Opaque to the assembly core; the producer builds it from the
/// remote address and the (client, service) port pair so that request
/// and response traffic land on the same value.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId([u8; 20]);

impl ConnectionId {
    pub fn new(addr: [u8; 16], client_port: u16, service_port: u16) -> Self {
        let mut id = [0u8; 20];
        id[..16].copy_from_slice(&addr);
        id[16..18].copy_from_slice(&client_port.to_be_bytes());
        id[18..20].copy_from_slice(&service_port.to_be_bytes());
        ConnectionId(id)
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// 24-byte routing key a response shares with the request that
/// provoked it: remote address, the two ports, and the acknowledgment
/// number the response will carry.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct ResponseKey([u8; 24]);

impl ResponseKey {
    /// Key published by a request. The ports are swapped into the
    /// order the response's own segments will carry them; `ack` is
    /// the sequence number one past the request's last byte.
    pub fn for_request(addr: &[u8; 16], raw_ports: &[u8; 4], ack: u32) -> Self {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(addr);
        key[16..18].copy_from_slice(&raw_ports[2..4]);
        key[18..20].copy_from_slice(&raw_ports[0..2]);
        key[20..24].copy_from_slice(&ack.to_be_bytes());
        ResponseKey(key)
    }

    /// Key a response segment derives from its own fields verbatim;
    /// lines up with [`ResponseKey::for_request`] because that side
    /// already swapped the ports.
    pub fn for_response(packet: &Packet) -> Self {
        let mut key = [0u8; 24];
        key[..16].copy_from_slice(&packet.addr);
        key[16..20].copy_from_slice(&packet.raw_ports);
        key[20..24].copy_from_slice(&packet.ack.to_be_bytes());
        ResponseKey(key)
    }
}

impl fmt::Debug for ResponseKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// Routing key for open assemblers: one message per (connection,
/// acknowledgment number, direction).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowKey {
    pub conn: ConnectionId,
    pub ack: u32,
    pub direction: Direction,
}

/// One payload-bearing TCP segment as delivered by the producer.
/// Pure acknowledgments are filtered out before they get here.
#[derive(Debug, Clone)]
pub struct Packet {
    pub seq: u32,
    pub ack: u32,
    /// Original acknowledgment number when an upstream stage rewrote
    /// `ack` to keep a flow together; zero otherwise.
    pub orig_ack: u32,
    pub data: Vec<u8>,
    /// Remote endpoint address, zero-padded to 16 bytes for IPv4.
    pub addr: [u8; 16],
    /// Source and destination port exactly as they appear on the wire.
    pub raw_ports: [u8; 4],
    pub id: ConnectionId,
    pub direction: Direction,
    /// Capture timestamp from the packet stream.
    #[allow(dead_code)]
    pub ts: SystemTime,
}

impl Packet {
    pub fn flow_key(&self) -> FlowKey {
        FlowKey {
            conn: self.id,
            ack: self.ack,
            direction: self.direction,
        }
    }
}
