// SPDX-License-Identifier: AGPL-3.0-only

//! HTTP-over-TCP message reassembly: raw segments in, correlated
//! request/response records out.

mod message;
mod packet;
mod tracker;

pub use message::CapturedMessage;
pub use packet::{ConnectionId, Direction, Packet};
pub use tracker::FlowTracker;
