//! # Wire Item Model
//!
//! Messages crossing the bus are tagged-union item streams. This module
//! defines the item vocabulary, the send-side message description, and the
//! serialized record a receiver finds in its pool slice.
//!
//! ## Message Lifecycle
//!
//! 1. **Creation**: a sender fills a [`Message`] with destination, cookie
//!    and payload items
//! 2. **Routing**: the engine resolves the destination and stamps sequence
//!    and timestamp information
//! 3. **Serialization**: the per-receiver view becomes a [`DeliveredMessage`]
//!    encoded with bincode into a pool slice
//! 4. **Receive**: the receiver reads the slice at the returned offset and
//!    decodes it
//!
//! The byte layout is implementation-defined; the field set is the contract.

use serde::{Deserialize, Serialize};

use crate::bloom::BloomFilter;
use crate::error::{Error, Result};

/// Connection id reserved for engine-originated (kernel) messages.
pub const KERNEL_ID: u64 = 0;

/// Destination id addressing every eligible connection on the bus.
pub const BROADCAST_ID: u64 = u64::MAX;

/// Process credentials snapshotted into metadata and carried by
/// impersonated hellos.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Creds {
    pub uid: u32,
    pub gid: u32,
    pub pid: u32,
    pub tid: u32,
}

/// Capability sets of a principal, one bit per capability.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Caps {
    pub effective: u64,
    pub permitted: u64,
    pub inheritable: u64,
}

/// Audit identity of a principal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Audit {
    pub loginuid: u32,
    pub sessionid: u32,
}

/// Ownership transition payload of the name-change notification family.
///
/// An id of zero means "no owner on that side": `old_id == 0` is a name
/// birth, `new_id == 0` a name death, both non-zero a handover.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NameTransition {
    pub name: String,
    pub old_id: u64,
    pub new_id: u64,
}

/// Engine-originated notification kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NotifyKind {
    IdAdd,
    IdRemove,
    NameAdd,
    NameRemove,
    NameChange,
    ReplyTimeout,
    ReplyDead,
}

/// One tagged-union record in a message or metadata stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Item {
    /// A well-known name (sender identity in delivered messages).
    Name(String),
    /// Payload bytes copied into the receiver's pool.
    PayloadVec(Vec<u8>),
    /// A sealed-memory payload reference; the token is opaque to the core.
    PayloadMemfd { size: u64, token: u64 },
    /// Transferable handle tokens; opaque to the core.
    Fds(Vec<u64>),
    /// Bloom filter bits populated by the sender of a broadcast.
    BloomFilter(Vec<u8>),
    /// Send/receive timestamps, nanoseconds.
    Timestamp { monotonic_ns: u64, realtime_ns: u64 },

    // Credential family, produced by the metadata collector.
    Creds(Creds),
    PidComm(String),
    TidComm(String),
    Exe(String),
    Cmdline(Vec<String>),
    Cgroup(String),
    Caps(Caps),
    Seclabel(String),
    Audit(Audit),
    ConnDescription(String),
    /// Well-known names owned by the sender at collection time.
    OwnedNames(Vec<String>),

    // Notification payloads.
    IdAdd(u64),
    IdRemove(u64),
    NameAdd(NameTransition),
    NameRemove(NameTransition),
    NameChange(NameTransition),
    ReplyTimeout { cookie: u64 },
    ReplyDead { cookie: u64 },
}

impl Item {
    /// The notification kind this item announces, if any.
    pub fn notify_kind(&self) -> Option<NotifyKind> {
        match self {
            Item::IdAdd(_) => Some(NotifyKind::IdAdd),
            Item::IdRemove(_) => Some(NotifyKind::IdRemove),
            Item::NameAdd(_) => Some(NotifyKind::NameAdd),
            Item::NameRemove(_) => Some(NotifyKind::NameRemove),
            Item::NameChange(_) => Some(NotifyKind::NameChange),
            Item::ReplyTimeout { .. } => Some(NotifyKind::ReplyTimeout),
            Item::ReplyDead { .. } => Some(NotifyKind::ReplyDead),
            _ => None,
        }
    }
}

/// A message as described by a sender.
///
/// Destination addressing: `dst_name` takes precedence and is resolved
/// under the name registry lock; a `dst_id` given alongside it must match
/// the current owner. Without a name, `dst_id` addresses a connection
/// directly; [`BROADCAST_ID`] fans out to every eligible receiver.
#[derive(Debug, Clone, Default)]
pub struct Message {
    pub dst_id: Option<u64>,
    pub dst_name: Option<String>,
    /// Sender-chosen correlation value, echoed to receivers.
    pub cookie: u64,
    /// Larger values are delivered first; FIFO within equal priority.
    pub priority: i64,
    /// Request a reply; arms a reply tracker with `timeout_ns`.
    pub expect_reply: bool,
    /// Block the sender until the reply arrives (implies `expect_reply`).
    pub sync: bool,
    /// Refuse delivery to an activator placeholder.
    pub no_auto_start: bool,
    /// Absolute monotonic deadline for the expected reply.
    pub timeout_ns: u64,
    /// Non-zero marks this message as the reply to that cookie.
    pub cookie_reply: u64,
    /// Broadcast match bits; required for broadcasts.
    pub bloom: Option<BloomFilter>,
    /// Payload and auxiliary items.
    pub items: Vec<Item>,
}

impl Message {
    /// Validate the field combinations the engine refuses to route.
    pub fn validate(&self) -> Result<()> {
        let broadcast = self.dst_id == Some(BROADCAST_ID) && self.dst_name.is_none();
        if self.dst_id.is_none() && self.dst_name.is_none() {
            return Err(Error::InvalidMessage("no destination"));
        }
        if self.expect_reply && self.cookie_reply != 0 {
            return Err(Error::InvalidMessage("expect-reply on a reply"));
        }
        if self.expect_reply && broadcast {
            return Err(Error::InvalidMessage("broadcast cannot expect a reply"));
        }
        if self.expect_reply && self.timeout_ns == 0 {
            return Err(Error::InvalidMessage("expect-reply without deadline"));
        }
        if self.sync && !self.expect_reply {
            return Err(Error::InvalidMessage("sync send without expect-reply"));
        }
        if broadcast && self.bloom.is_none() {
            return Err(Error::InvalidMessage("broadcast without bloom filter"));
        }
        if broadcast && self.cookie_reply != 0 {
            return Err(Error::InvalidMessage("broadcast cannot be a reply"));
        }
        for item in &self.items {
            if item.notify_kind().is_some() {
                return Err(Error::InvalidMessage("notification item in user message"));
            }
        }
        Ok(())
    }

    /// Total payload bytes across all payload items.
    pub fn payload_len(&self) -> usize {
        self.items
            .iter()
            .map(|item| match item {
                Item::PayloadVec(bytes) => bytes.len(),
                Item::PayloadMemfd { size, .. } => *size as usize,
                _ => 0,
            })
            .sum()
    }

    /// Handle tokens carried by this message.
    pub fn fd_tokens(&self) -> Vec<u64> {
        self.items
            .iter()
            .flat_map(|item| match item {
                Item::Fds(tokens) => tokens.clone(),
                _ => Vec::new(),
            })
            .collect()
    }
}

/// The record a receiver decodes from its pool slice.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeliveredMessage {
    /// Domain-wide sequence number, monotonic across buses.
    pub seq: u64,
    /// Sender connection id; [`KERNEL_ID`] for engine notifications.
    pub src_id: u64,
    /// Receiver connection id.
    pub dst_id: u64,
    pub cookie: u64,
    pub cookie_reply: u64,
    pub priority: i64,
    /// Registry id of the destination name, zero when addressed by id.
    pub dst_name_id: u64,
    /// Payload and notification items.
    pub payload: Vec<Item>,
    /// Metadata items filtered to the receiver's attach flags.
    pub meta: Vec<Item>,
    /// Handle tokens delivered with the message.
    pub fds: Vec<u64>,
}

impl DeliveredMessage {
    /// Serialize for placement in a pool slice.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        bincode::serialize(self).map_err(|_| Error::InvalidMessage("serialization failed"))
    }

    /// Decode a record previously placed in a pool slice.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes).map_err(|_| Error::InvalidMessage("malformed slice contents"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unicast(dst: u64) -> Message {
        Message {
            dst_id: Some(dst),
            cookie: 7,
            items: vec![Item::PayloadVec(b"hi".to_vec())],
            ..Default::default()
        }
    }

    /// A plain unicast passes validation; contradictory flag combinations
    /// do not.
    #[test]
    fn message_validation() {
        assert!(unicast(2).validate().is_ok());

        let mut no_dst = unicast(2);
        no_dst.dst_id = None;
        assert!(matches!(
            no_dst.validate(),
            Err(Error::InvalidMessage("no destination"))
        ));

        let mut reply_and_request = unicast(2);
        reply_and_request.expect_reply = true;
        reply_and_request.timeout_ns = 1;
        reply_and_request.cookie_reply = 9;
        assert!(reply_and_request.validate().is_err());

        let mut sync_only = unicast(2);
        sync_only.sync = true;
        assert!(sync_only.validate().is_err());

        let mut bare_broadcast = unicast(BROADCAST_ID);
        bare_broadcast.dst_id = Some(BROADCAST_ID);
        assert!(matches!(
            bare_broadcast.validate(),
            Err(Error::InvalidMessage("broadcast without bloom filter"))
        ));
    }

    /// Delivered records survive the slice encode/decode boundary.
    #[test]
    fn delivered_message_round_trip() {
        let record = DeliveredMessage {
            seq: 3,
            src_id: 1,
            dst_id: 2,
            cookie: 7,
            cookie_reply: 0,
            priority: 0,
            dst_name_id: 0,
            payload: vec![Item::PayloadVec(b"hi".to_vec())],
            meta: vec![Item::PidComm("test".into())],
            fds: vec![],
        };
        let bytes = record.to_bytes().unwrap();
        let back = DeliveredMessage::from_bytes(&bytes).unwrap();
        assert_eq!(back.cookie, 7);
        assert_eq!(back.payload, record.payload);
    }

    /// Payload accounting spans vector and memfd items.
    #[test]
    fn payload_len_sums_items() {
        let mut msg = unicast(2);
        msg.items.push(Item::PayloadMemfd { size: 10, token: 4 });
        assert_eq!(msg.payload_len(), 12);
        assert!(msg.fd_tokens().is_empty());
    }
}
