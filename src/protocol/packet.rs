//! Protocol packet types.
//!
//! Pure data contract between sender and receiver. Ids are assigned by walk
//! order and never carried in `Stat`: both sides count announcements with
//! their own monotonically increasing counter, so the transport must be
//! ordered and lossless. `Req` and `Data` carry the id explicitly because
//! content for different ids interleaves freely on the wire.

use crate::walk::Entry;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Packet {
    /// Announces one filesystem entry. `None` terminates the metadata stream.
    Stat(Option<Entry>),
    /// Requests content for a previously announced regular file.
    Req { id: u32 },
    /// One content chunk. An empty chunk marks end of content for this id.
    Data { id: u32, data: Vec<u8> },
    /// End-of-exchange signal, acknowledged by echoing it back.
    Fin,
}

/// Fixed per-packet overhead assumed by the size estimator.
const PACKET_OVERHEAD: u64 = 8;

impl Packet {
    /// Approximate encoded size. Used only for progress accounting, so it
    /// does not need to match any particular transport encoding exactly.
    pub fn wire_size(&self) -> u64 {
        match self {
            Packet::Stat(Some(entry)) => PACKET_OVERHEAD + entry.wire_size(),
            Packet::Stat(None) => PACKET_OVERHEAD,
            Packet::Req { .. } => PACKET_OVERHEAD + 4,
            Packet::Data { data, .. } => PACKET_OVERHEAD + 4 + data.len() as u64,
            Packet::Fin => PACKET_OVERHEAD,
        }
    }
}
