use bytes::Bytes;
use bytestring::ByteString;
use serde::{Deserialize, Serialize};

/// Protocol magic exchanged by both peers before any frame.
pub const HMQ_MAGIC: &[u8; 8] = b"HMQP/2.1";

/// Fixed heartbeat frames.
pub const PING: [u8; 8] = [0x89, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];
pub const PONG: [u8; 8] = [0x8A, 0xFF, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00];

/// Target prefix addressing clients by name: `@name:X`.
pub const TARGET_NAME_PREFIX: &str = "@name:";
/// Target prefix addressing clients by type: `@type:T`.
pub const TARGET_TYPE_PREFIX: &str = "@type:";

/// Well-known header names.
pub mod headers {
    pub const NEGATIVE_ACK: &str = "Negative-Ack";
    pub const CLIENT_ID: &str = "Client-Id";
    pub const CLIENT_NAME: &str = "Client-Name";
    pub const CLIENT_TYPE: &str = "Client-Type";
    pub const QUEUE_NAME: &str = "Queue-Name";
    pub const QUEUE_STATUS: &str = "Queue-Status";
    pub const EVENT_NAME: &str = "Event-Name";
    pub const SUBSCRIBE: &str = "Subscribe";

    /// Default negative-ack reason when none is supplied.
    pub const REASON_NONE: &str = "none";
    pub const REASON_LIMIT: &str = "Limit";
    pub const REASON_EMPTY: &str = "Empty";
    pub const REASON_TIMEOUT: &str = "Timeout";
}

/// Known content-type codes carried in the 16-bit content-type field.
/// Queue messages use this field for an application-defined queue id.
pub mod content_types {
    pub const HELLO: u16 = 101;
    pub const ACCEPTED: u16 = 202;
    pub const BAD_REQUEST: u16 = 400;
    pub const UNAUTHORIZED: u16 = 401;
    pub const NOT_FOUND: u16 = 404;
    pub const BUSY: u16 = 486;
    /// Legacy channel creation, treated as CREATE_QUEUE.
    pub const CREATE_CHANNEL: u16 = 600;
    pub const CREATE_QUEUE: u16 = 610;
    pub const REMOVE_QUEUE: u16 = 611;
    pub const UPDATE_QUEUE: u16 = 612;
    pub const QUEUE_LIST: u16 = 614;
    pub const INSTANCE_LIST: u16 = 620;
    pub const CLIENT_LIST: u16 = 621;
    pub const JOIN: u16 = 630;
    pub const LEAVE: u16 = 631;
}

prim_enum! {
    /// Frame/message type.
    pub enum MessageType {
        Terminate = 0x08,
        Server = 0x10,
        DirectMessage = 0x80,
        Response = 0x81,
        QueueMessage = 0x82,
        QueuePullRequest = 0x83,
        Event = 0x84,
        Router = 0x85,
        Ping = 0x89,
        Pong = 0x8A,
        Acknowledge = 0x91
    }
}

bitflags::bitflags! {
    /// Per-frame delivery flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct FrameFlags: u8 {
        const FIRST_ACQUIRER = 0b0000_0001;
        const HIGH_PRIORITY = 0b0000_0010;
        const WAIT_RESPONSE = 0b0000_0100;
        const PENDING_ACKNOWLEDGE = 0b0000_1000;
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        FrameFlags::empty()
    }
}

impl Serialize for FrameFlags {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.bits())
    }
}

impl<'de> Deserialize<'de> for FrameFlags {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        Ok(FrameFlags::from_bits_truncate(u8::deserialize(deserializer)?))
    }
}

/// In-memory representation of an HMQ message.
///
/// Immutable after creation except for the routing-metadata fields, which
/// the broker rewrites while forwarding (`source`, `target`, `message_id`,
/// `ttl`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Frame {
    pub typ: MessageType,
    pub flags: FrameFlags,
    /// Remaining hop count; a frame is dropped when it goes below zero.
    pub ttl: i8,
    /// For queue messages this is the queue id; otherwise application-defined.
    pub content_type: u16,
    pub message_id: ByteString,
    pub source: ByteString,
    pub target: ByteString,
    /// Ordered name/value pairs.
    pub headers: Vec<(ByteString, ByteString)>,
    pub content: Bytes,
}

impl Frame {
    #[inline]
    pub fn new(typ: MessageType) -> Self {
        Self {
            typ,
            flags: FrameFlags::empty(),
            ttl: 8,
            content_type: 0,
            message_id: ByteString::default(),
            source: ByteString::default(),
            target: ByteString::default(),
            headers: Vec::new(),
            content: Bytes::new(),
        }
    }

    #[inline]
    pub fn ping() -> Self {
        Self::new(MessageType::Ping)
    }

    #[inline]
    pub fn pong() -> Self {
        Self::new(MessageType::Pong)
    }

    /// Copy of this frame, optionally with a new id and without the content.
    pub fn clone_with(&self, new_id: Option<&str>, copy_content: bool) -> Self {
        let mut f = self.clone();
        if let Some(id) = new_id {
            f.message_id = ByteString::from(id);
        }
        if !copy_content {
            f.content = Bytes::new();
        }
        f
    }

    #[inline]
    pub fn set_message_id<S: Into<ByteString>>(&mut self, id: S) -> &mut Self {
        self.message_id = id.into();
        self
    }

    #[inline]
    pub fn set_source<S: Into<ByteString>>(&mut self, source: S) -> &mut Self {
        self.source = source.into();
        self
    }

    #[inline]
    pub fn set_target<S: Into<ByteString>>(&mut self, target: S) -> &mut Self {
        self.target = target.into();
        self
    }

    /// Acknowledge for this frame: same message id, source and target
    /// swapped. A reason turns it into a negative ack.
    pub fn create_acknowledge(&self, reason: Option<&str>) -> Frame {
        let mut ack = Frame::new(MessageType::Acknowledge);
        ack.content_type = self.content_type;
        ack.message_id = self.message_id.clone();
        ack.source = self.target.clone();
        ack.target = self.source.clone();
        if let Some(reason) = reason {
            ack.headers.push((ByteString::from(headers::NEGATIVE_ACK), ByteString::from(reason)));
        }
        ack
    }

    /// A response frame answering this request: same message id, source and
    /// target swapped.
    pub fn create_response(&self) -> Frame {
        let mut resp = Frame::new(MessageType::Response);
        resp.content_type = self.content_type;
        resp.message_id = self.message_id.clone();
        resp.source = self.target.clone();
        resp.target = self.source.clone();
        resp
    }

    #[inline]
    pub fn header(&self, name: &str) -> Option<&ByteString> {
        self.headers.iter().find(|(n, _)| n.eq_ignore_ascii_case(name)).map(|(_, v)| v)
    }

    #[inline]
    pub fn push_header<N: Into<ByteString>, V: Into<ByteString>>(&mut self, name: N, value: V) {
        self.headers.push((name.into(), value.into()));
    }

    #[inline]
    pub fn is_negative_ack(&self) -> bool {
        self.typ == MessageType::Acknowledge && self.header(headers::NEGATIVE_ACK).is_some()
    }

    /// Reason of a negative ack, `None` for a positive one.
    #[inline]
    pub fn negative_ack_reason(&self) -> Option<ByteString> {
        self.header(headers::NEGATIVE_ACK).cloned()
    }

    #[inline]
    pub fn set_content_bytes<B: Into<Bytes>>(&mut self, content: B) {
        self.content = content.into();
    }

    #[inline]
    pub fn set_content_string(&mut self, content: &str) {
        self.content = Bytes::copy_from_slice(content.as_bytes());
    }

    #[inline]
    pub fn set_content_json<T: serde::Serialize>(&mut self, v: &T) -> Result<(), serde_json::Error> {
        self.content = Bytes::from(serde_json::to_vec(v)?);
        Ok(())
    }

    #[inline]
    pub fn content_as_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.content).ok()
    }

    #[inline]
    pub fn content_as_json<'a, T: serde::Deserialize<'a>>(&'a self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.content)
    }

    /// Decrements the hop count; false means the frame must be dropped.
    #[inline]
    pub fn hop(&mut self) -> bool {
        self.ttl = self.ttl.saturating_sub(1);
        self.ttl >= 0
    }

    #[inline]
    pub fn high_priority(&self) -> bool {
        self.flags.contains(FrameFlags::HIGH_PRIORITY)
    }

    #[inline]
    pub fn first_acquirer_only(&self) -> bool {
        self.flags.contains(FrameFlags::FIRST_ACQUIRER)
    }

    #[inline]
    pub fn wait_response(&self) -> bool {
        self.flags.contains(FrameFlags::WAIT_RESPONSE)
    }

    #[inline]
    pub fn pending_acknowledge(&self) -> bool {
        self.flags.contains(FrameFlags::PENDING_ACKNOWLEDGE)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledge_swaps_endpoints() {
        let mut f = Frame::new(MessageType::QueueMessage);
        f.set_message_id("m1").set_source("client-a").set_target("push-a");

        let ack = f.create_acknowledge(None);
        assert_eq!(ack.typ, MessageType::Acknowledge);
        assert_eq!(ack.message_id, "m1");
        assert_eq!(ack.source, "push-a");
        assert_eq!(ack.target, "client-a");
        assert!(!ack.is_negative_ack());

        let nack = f.create_acknowledge(Some("busy"));
        assert!(nack.is_negative_ack());
        assert_eq!(nack.negative_ack_reason().unwrap(), "busy");
    }

    #[test]
    fn clone_with_replaces_id_and_drops_content() {
        let mut f = Frame::new(MessageType::QueueMessage);
        f.set_message_id("m1");
        f.set_content_string("payload");

        let c = f.clone_with(Some("m2"), false);
        assert_eq!(c.message_id, "m2");
        assert!(c.content.is_empty());
        assert_eq!(f.content_as_str(), Some("payload"));
    }

    #[test]
    fn ttl_drops_below_zero() {
        let mut f = Frame::new(MessageType::Router);
        f.ttl = 1;
        assert!(f.hop());
        assert!(!f.hop());
    }
}
