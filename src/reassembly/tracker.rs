// SPDX-License-Identifier: AGPL-3.0-only

//! Routes captured segments to their message assemblers, pairs each
//! response with the request that caused it, and ages out flows that
//! went quiet without finishing. One tracker is fed by one producer;
//! finished messages leave through a channel.

use std::collections::HashMap;
use std::time::{Duration, SystemTime};

use crossbeam_channel::Sender;
use tracing::{debug, warn};

use crate::reassembly::message::{CapturedMessage, Message, RequestHandle};
use crate::reassembly::packet::{Direction, FlowKey, Packet, ResponseKey};

struct PendingRequest {
    handle: RequestHandle,
    updated: SystemTime,
}

pub struct FlowTracker {
    open: HashMap<FlowKey, Message>,
    pending: HashMap<ResponseKey, PendingRequest>,
    emit: Sender<CapturedMessage>,
    expiry: Duration,
}

impl FlowTracker {
    pub fn new(emit: Sender<CapturedMessage>, expiry: Duration) -> Self {
        FlowTracker {
            open: HashMap::new(),
            pending: HashMap::new(),
            emit,
            expiry,
        }
    }

    /// Feed one segment through the tracker. Opens an assembler for a
    /// previously unseen (connection, ack, direction), refreshes the
    /// response index on the request side, adopts the request on the
    /// response side, and emits the message the moment it completes.
    pub fn ingest(&mut self, packet: Packet) {
        let key = packet.flow_key();
        let direction = packet.direction;
        let lookup = match direction {
            Direction::Inbound => None,
            Direction::Outbound => Some(ResponseKey::for_response(&packet)),
        };

        let message = self
            .open
            .entry(key)
            .or_insert_with(|| Message::new(packet.seq, packet.ack, direction));
        let stale_key = message.response_key();
        message.add(packet);

        match direction {
            Direction::Inbound => {
                if let Some(response_key) = message.refresh_response_key() {
                    if let Some(old) = stale_key {
                        if old != response_key {
                            self.pending.remove(&old);
                        }
                    }
                    self.pending.insert(
                        response_key,
                        PendingRequest {
                            handle: RequestHandle {
                                start: message.start(),
                                ack: message.ack(),
                            },
                            updated: SystemTime::now(),
                        },
                    );
                }
            }
            Direction::Outbound => {
                if message.assoc().is_none() {
                    if let Some(request) =
                        lookup.and_then(|lookup| self.pending.remove(&lookup))
                    {
                        message.set_assoc(request.handle);
                    }
                }
            }
        }

        if message.complete() {
            if let Some(message) = self.open.remove(&key) {
                self.send(message);
            }
        }
    }

    /// Drop open assemblers that have gone quiet, and pending request
    /// entries whose response never showed up. Completed stragglers
    /// are emitted rather than lost.
    pub fn sweep(&mut self, now: SystemTime) {
        let expiry = self.expiry;
        let stale: Vec<FlowKey> = self
            .open
            .iter()
            .filter(|(_, m)| {
                now.duration_since(m.end())
                    .is_ok_and(|idle| idle > expiry)
            })
            .map(|(key, _)| *key)
            .collect();
        for key in stale {
            if let Some(message) = self.open.remove(&key) {
                if message.complete() {
                    self.send(message);
                } else {
                    debug!(
                        direction = ?message.direction(),
                        ack = message.ack(),
                        "discarding stale partial message"
                    );
                }
            }
        }
        self.pending.retain(|_, request| {
            now.duration_since(request.updated)
                .map_or(true, |idle| idle <= expiry)
        });
    }

    /// End-of-input flush: emit whatever finished, drop the rest.
    pub fn drain(&mut self) {
        let mut dropped = 0usize;
        for (_, message) in std::mem::take(&mut self.open) {
            if message.complete() {
                self.send(message);
            } else {
                dropped += 1;
            }
        }
        if dropped > 0 {
            debug!(dropped, "discarded partial messages at end of input");
        }
        self.pending.clear();
    }

    fn send(&self, message: Message) {
        if let Some(captured) = message.into_captured() {
            debug!(
                conn = ?captured.conn,
                uuid = %captured.uuid,
                bytes = captured.data.len(),
                "emitting message"
            );
            if self.emit.send(captured).is_err() {
                warn!("message consumer is gone, dropping output");
            }
        }
    }
}
