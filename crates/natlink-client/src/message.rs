//! Message types exchanged with the application.

use crate::subscription::{Subscription, WeakSubscription};
use bytes::Bytes;

/// A message handed to the write path. The payload is copied on construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    subject: String,
    reply_to: Option<String>,
    payload: Bytes,
}

impl OutboundMessage {
    /// Message without a reply subject.
    pub fn new(subject: impl Into<String>, payload: &[u8]) -> Self {
        Self {
            subject: subject.into(),
            reply_to: None,
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Message carrying a reply subject.
    pub fn with_reply(
        subject: impl Into<String>,
        reply_to: impl Into<String>,
        payload: &[u8],
    ) -> Self {
        Self {
            subject: subject.into(),
            reply_to: Some(reply_to.into()),
            payload: Bytes::copy_from_slice(payload),
        }
    }

    /// Same subject and payload, different reply subject. The payload is shared, not copied.
    pub(crate) fn redirect_reply(&self, reply_to: String) -> Self {
        Self {
            subject: self.subject.clone(),
            reply_to: Some(reply_to),
            payload: self.payload.clone(),
        }
    }

    /// Destination subject.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Reply subject, if any.
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Payload bytes.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }
}

/// A message delivered by the server.
#[derive(Debug, Clone)]
pub struct InboundMessage {
    subject: String,
    reply_to: Option<String>,
    sid: u64,
    payload: Bytes,
    subscription: Option<WeakSubscription>,
}

impl InboundMessage {
    /// Builds a message as the parser would deliver it, detached from any subscription.
    pub fn new(subject: String, reply_to: Option<String>, sid: u64, payload: Bytes) -> Self {
        Self {
            subject,
            reply_to,
            sid,
            payload,
            subscription: None,
        }
    }

    pub(crate) fn attach(&mut self, subscription: WeakSubscription) {
        self.subscription = Some(subscription);
    }

    /// Subject the message was published to.
    pub fn subject(&self) -> &str {
        &self.subject
    }

    /// Reply subject, if the publisher set one.
    pub fn reply_to(&self) -> Option<&str> {
        self.reply_to.as_deref()
    }

    /// Subscription id the server routed the message to.
    pub fn sid(&self) -> u64 {
        self.sid
    }

    /// Payload length in bytes.
    pub fn payload_len(&self) -> usize {
        self.payload.len()
    }

    /// Payload bytes.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// The subscription that received the message, while it is still alive.
    pub fn subscription(&self) -> Option<Subscription> {
        self.subscription.as_ref().and_then(WeakSubscription::upgrade)
    }
}

impl PartialEq for InboundMessage {
    fn eq(&self, other: &Self) -> bool {
        self.subject == other.subject
            && self.reply_to == other.reply_to
            && self.sid == other.sid
            && self.payload == other.payload
    }
}

impl Eq for InboundMessage {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_copies_payload() {
        let mut buf = b"abc".to_vec();
        let msg = OutboundMessage::new("s", &buf);
        buf[0] = b'z';
        assert_eq!(msg.payload(), b"abc");
        assert_eq!(msg.reply_to(), None);
    }

    #[test]
    fn test_redirect_reply_keeps_payload() {
        let msg = OutboundMessage::with_reply("svc", "old", b"q");
        let moved = msg.redirect_reply("_INBOX.a.7".into());
        assert_eq!(moved.subject(), "svc");
        assert_eq!(moved.reply_to(), Some("_INBOX.a.7"));
        assert_eq!(moved.payload(), b"q");
    }

    #[test]
    fn test_inbound_accessors() {
        let msg = InboundMessage::new("a.b".into(), Some("r".into()), 9, Bytes::from_static(b"hi"));
        assert_eq!(msg.subject(), "a.b");
        assert_eq!(msg.reply_to(), Some("r"));
        assert_eq!(msg.sid(), 9);
        assert_eq!(msg.payload_len(), 2);
        assert!(msg.subscription().is_none());
    }
}
