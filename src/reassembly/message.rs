// SPDX-License-Identifier: AGPL-3.0-only

//! Assembles one HTTP message from TCP segments that may arrive out
//! of order, duplicated, or fragmented anywhere — including in the
//! middle of the header block. The assembler keeps segments sorted by
//! sequence number and re-derives its view of the message (framing,
//! completeness) after every insert, so callers only ever observe a
//! consistent classification.

use std::fmt::Write as _;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use memchr::memmem;
use sha1::{Digest, Sha1};

use crate::proto;
use crate::reassembly::packet::{ConnectionId, Direction, Packet, ResponseKey};

const HEADER_END: &[u8] = b"\r\n\r\n";
const CHUNK_END: &[u8] = b"0\r\n\r\n";

/// Shortest parseable request line: `GET / HTTP/1.1\r\n`.
const MIN_REQUEST_LINE: usize = 16;

/// Bytes the interim `100 Continue` exchange occupies in the sequence
/// space of a request stream that elected it. The exchange itself is
/// never captured on this side, so the hole must not count as loss.
const CONTINUE_GAP: u32 = 22;

/// How a message frames its body, derived from the request line or
/// status line plus the header block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MethodKind {
    /// POST, PUT, PATCH, CONNECT — and every response.
    WithBody,
    /// GET, HEAD, OPTIONS and friends: the header block is the message.
    WithoutBody,
    /// The first segment does not look like HTTP at all.
    NotFound,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyFraming {
    Empty,
    ContentLength,
    Chunked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectKind {
    Empty,
    Continue,
}

/// Non-owning view of the request a response belongs to: exactly the
/// fields needed to reproduce the shared UUID and keep ordering
/// stable, nothing that would tie the two lifetimes together.
#[derive(Debug, Clone, Copy)]
pub struct RequestHandle {
    pub start: SystemTime,
    pub ack: u32,
}

/// A finished message as handed to the consumer.
#[derive(Debug, Clone)]
pub struct CapturedMessage {
    pub direction: Direction,
    pub uuid: String,
    pub conn: ConnectionId,
    pub data: Vec<u8>,
    pub start: SystemTime,
    pub end: SystemTime,
}

/// Per-message assembly state: the ordered segment list plus the
/// classifications cached from it.
pub struct Message {
    seq: u32,
    ack: u32,
    data_ack: u32,
    response_ack: u32,
    response_key: Option<ResponseKey>,
    assoc: Option<RequestHandle>,
    start: SystemTime,
    end: SystemTime,
    direction: Direction,
    packets: Vec<Packet>,
    method: Option<MethodKind>,
    framing: Option<BodyFraming>,
    expect: Option<ExpectKind>,
    header_packet: Option<usize>,
    content_length: usize,
    seq_gap: bool,
    complete: bool,
}

impl Message {
    pub fn new(seq: u32, ack: u32, direction: Direction) -> Self {
        let now = SystemTime::now();
        Message {
            seq,
            ack,
            data_ack: 0,
            response_ack: 0,
            response_key: None,
            assoc: None,
            start: now,
            end: now,
            direction,
            packets: Vec::new(),
            method: None,
            framing: None,
            expect: None,
            header_packet: None,
            content_length: 0,
            seq_gap: false,
            complete: false,
        }
    }

    /// Insert a segment at its sorted position. A segment whose
    /// sequence number is already present is a retransmission and is
    /// dropped; one below the current first segment becomes the new
    /// start of the message. Every accepted segment refreshes the
    /// cached classifications.
    pub fn add(&mut self, packet: Packet) {
        match self.packets.binary_search_by(|p| p.seq.cmp(&packet.seq)) {
            Ok(_) => {} // retransmission, keep the first copy
            Err(at) => {
                if at == 0 {
                    self.seq = packet.seq;
                }
                if packet.orig_ack != 0 {
                    self.data_ack = packet.orig_ack;
                }
                self.packets.insert(at, packet);
                self.end = match self.direction {
                    Direction::Inbound => SystemTime::now(),
                    // Nudge responses forward so a pair never ties on
                    // timestamps and sorts response-first downstream.
                    Direction::Outbound => SystemTime::now() + Duration::from_millis(1),
                };
            }
        }

        self.check_seq_integrity();
        self.update_header_packet();
        self.update_method();
        self.update_framing();
        self.check_complete();
        self.check_continue();
    }

    /// Payload concatenation in segment order.
    pub fn bytes(&self) -> Vec<u8> {
        let total: usize = self.packets.iter().map(|p| p.data.len()).sum();
        let mut out = Vec::with_capacity(total);
        for packet in &self.packets {
            out.extend_from_slice(&packet.data);
        }
        out
    }

    /// Bytes of body observed so far: the tail of the header segment
    /// plus every later segment. Zero until the header block has been
    /// located.
    pub fn body_size(&self) -> usize {
        let Some(header_packet) = self.header_packet else {
            return 0;
        };
        if self.packets.is_empty() {
            return 0;
        }
        proto::body(&self.packets[header_packet].data).len()
            + self.packets[header_packet + 1..]
                .iter()
                .map(|p| p.data.len())
                .sum::<usize>()
    }

    /// 40-hex-character identity shared by a request and its
    /// response: SHA-1 over the decimal start time and acknowledgment
    /// number of the request side.
    pub fn uuid(&self) -> String {
        let (start, ack) = if self.direction.is_inbound() {
            (self.start, self.ack)
        } else {
            match self.assoc {
                Some(request) => (request.start, request.ack),
                None => (self.start, self.ack),
            }
        };
        let nanos = start.duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
        let mut key = String::with_capacity(32);
        let _ = write!(key, "{nanos}{ack}");
        let digest = Sha1::digest(key.as_bytes());
        let mut uuid = String::with_capacity(40);
        for byte in digest {
            let _ = write!(uuid, "{byte:02x}");
        }
        uuid
    }

    /// Re-derive the key the eventual response will carry, from the
    /// last segment seen so far. Returns the current key.
    pub fn refresh_response_key(&mut self) -> Option<ResponseKey> {
        let last = self.packets.last()?;
        let response_ack = last.seq.wrapping_add(last.data.len() as u32);
        if self.response_ack != response_ack || self.response_key.is_none() {
            self.response_ack = response_ack;
            self.response_key = Some(ResponseKey::for_request(
                &last.addr,
                &last.raw_ports,
                response_ack,
            ));
        }
        self.response_key
    }

    /// Adopt the request this response answers and re-evaluate
    /// completeness, which may have been blocked on exactly this.
    pub fn set_assoc(&mut self, request: RequestHandle) {
        self.assoc = Some(request);
        self.check_complete();
    }

    pub fn assoc(&self) -> Option<RequestHandle> {
        self.assoc
    }

    pub fn response_key(&self) -> Option<ResponseKey> {
        self.response_key
    }

    pub fn complete(&self) -> bool {
        self.complete
    }

    pub fn start(&self) -> SystemTime {
        self.start
    }

    pub fn end(&self) -> SystemTime {
        self.end
    }

    pub fn ack(&self) -> u32 {
        self.ack
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Consume the assembler into the record handed to consumers.
    /// Yields nothing for a message that never saw a segment.
    pub fn into_captured(self) -> Option<CapturedMessage> {
        let conn = self.packets.first()?.id;
        Some(CapturedMessage {
            direction: self.direction,
            uuid: self.uuid(),
            conn,
            data: self.bytes(),
            start: self.start,
            end: self.end,
        })
    }

    /// A gap exists when adjacent segments are not contiguous in
    /// sequence space. A hole of exactly [`CONTINUE_GAP`] bytes is
    /// forgiven once the message is known to have elected
    /// `Expect: 100-continue`.
    fn check_seq_integrity(&mut self) {
        for pair in self.packets.windows(2) {
            let next_seq = pair[0].seq.wrapping_add(pair[0].data.len() as u32);
            if pair[1].seq != next_seq {
                if self.expect == Some(ExpectKind::Continue)
                    && pair[1].seq == next_seq.wrapping_add(CONTINUE_GAP)
                {
                    continue;
                }
                self.seq_gap = true;
                return;
            }
        }
        self.seq_gap = false;
    }

    /// Locate the segment carrying the blank line that ends the
    /// header block. The index is sticky once found; it is only
    /// searched for while the sequence space ahead of it is
    /// gap-free, so the blank line cannot be mistaken for one
    /// belonging to a later message.
    fn update_header_packet(&mut self) {
        if self.packets.len() == 1 {
            self.header_packet = None;
        }
        if self.header_packet.is_some() || self.seq_gap {
            return;
        }
        self.header_packet = self
            .packets
            .iter()
            .position(|p| memmem::find(&p.data, HEADER_END).is_some());
    }

    fn update_method(&mut self) {
        if !matches!(self.method, None | Some(MethodKind::NotFound)) {
            return;
        }
        let Some(first) = self.packets.first() else {
            return;
        };
        if first.data.len() < MIN_REQUEST_LINE {
            self.method = Some(MethodKind::NotFound);
            return;
        }
        self.method = Some(match self.direction {
            Direction::Inbound => classify_request_line(&first.data),
            Direction::Outbound => {
                if first.data.starts_with(b"HTTP/1") {
                    // Status lines carry no method; framing decides
                    // whether the body turns out empty.
                    MethodKind::WithBody
                } else {
                    MethodKind::NotFound
                }
            }
        });
    }

    fn update_framing(&mut self) {
        if self.framing.is_some() {
            return;
        }
        let Some(header_packet) = self.header_packet else {
            return;
        };
        match self.method {
            None | Some(MethodKind::NotFound) => {}
            Some(MethodKind::WithoutBody) => self.framing = Some(BodyFraming::Empty),
            Some(MethodKind::WithBody) => {
                let headers = &self.packets[..=header_packet];
                let length = headers
                    .iter()
                    .map(|p| proto::header(&p.data, b"Content-Length"))
                    .find(|v| !v.is_empty());
                if let Some(value) = length {
                    self.content_length = ascii_decimal(value);
                    self.framing = Some(BodyFraming::ContentLength);
                } else if headers
                    .iter()
                    .any(|p| !proto::header(&p.data, b"Transfer-Encoding").is_empty())
                {
                    self.framing = Some(BodyFraming::Chunked);
                } else {
                    self.framing = Some(BodyFraming::Empty);
                }
            }
        }
    }

    fn check_complete(&mut self) {
        if self.seq_gap || self.header_packet.is_none() {
            return;
        }
        match self.method {
            None | Some(MethodKind::NotFound) => return,
            Some(_) => {}
        }
        // A response is only emittable once its request is known.
        if self.direction == Direction::Outbound && self.assoc.is_none() {
            return;
        }

        if self.method == Some(MethodKind::WithoutBody) {
            self.complete = true;
            return;
        }
        match self.framing {
            Some(BodyFraming::Empty) => self.complete = true,
            Some(BodyFraming::ContentLength) => {
                if self.content_length == 0 || self.content_length == self.body_size() {
                    self.complete = true;
                }
            }
            Some(BodyFraming::Chunked) => {
                if self
                    .packets
                    .last()
                    .is_some_and(|p| memmem::find(&p.data, CHUNK_END).is_some())
                {
                    self.complete = true;
                }
            }
            None => {}
        }
    }

    /// Detect an `Expect: 100-continue` election. Only meaningful for
    /// a with-body message whose header block is fully present (the
    /// last segment ends on the blank line) and gap-free. Sticky once
    /// classified either way.
    fn check_continue(&mut self) {
        if self.expect.is_some() || self.method != Some(MethodKind::WithBody) || self.seq_gap {
            return;
        }
        let Some(header_packet) = self.header_packet else {
            return;
        };
        if self.packets.first().is_none_or(|p| p.data.len() < 25) {
            return;
        }
        if !self.packets.last().is_some_and(|p| p.data.ends_with(HEADER_END)) {
            return;
        }
        let value = self.packets[..=header_packet]
            .iter()
            .map(|p| proto::header(&p.data, b"Expect"))
            .find(|v| !v.is_empty());
        self.expect = Some(match value {
            Some(v) if v == b"100-continue" => ExpectKind::Continue,
            _ => ExpectKind::Empty,
        });
    }
}

fn classify_request_line(data: &[u8]) -> MethodKind {
    const WITH_BODY: [&[u8]; 4] = [b"POST", b"PUT", b"PATCH", b"CONNECT"];

    let Some(space) = data[..8].iter().position(|&b| b == b' ') else {
        return MethodKind::NotFound;
    };
    // The method must be followed by an absolute or relative request
    // target, or the OPTIONS `*` form.
    if !matches!(data[space + 1], b'/' | b'h' | b'*') {
        return MethodKind::NotFound;
    }
    if WITH_BODY.contains(&&data[..space]) {
        MethodKind::WithBody
    } else {
        MethodKind::WithoutBody
    }
}

fn ascii_decimal(value: &[u8]) -> usize {
    std::str::from_utf8(value)
        .ok()
        .and_then(|s| s.trim().parse().ok())
        .unwrap_or(0)
}
