//! Push-channel wire protocol
//!
//! This module defines the JSON frames exchanged over the push transport:
//! - Outbound frames (subscribe, send/edit/delete message, toggle reaction)
//! - Inbound frames (subscription ack, message lifecycle events)
//! - JSON encode/decode helpers
//!
//! Full comment entities are carried as opaque JSON values; the sync core
//! forwards them to subscribers without interpreting their shape.

use crate::store::ChannelId;
use crate::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Frames sent to the server over the push channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboundFrame {
    /// Replace the server-side subscription with this channel list
    Subscribe {
        /// Channels to receive events for
        chats: Vec<ChannelId>,
    },
    /// Send a new message
    SendMessage {
        /// Target channel
        chat_id: ChannelId,
        /// Message body
        text: String,
        /// Client-supplied correlation id for reconciling the optimistic
        /// local entry with the `message_sent` acknowledgement
        #[serde(skip_serializing_if = "Option::is_none")]
        temp_id: Option<String>,
    },
    /// Edit an existing message
    EditMessage {
        /// Target channel
        chat_id: ChannelId,
        /// Message being edited
        comment_id: String,
        /// Replacement body
        text: String,
    },
    /// Delete an existing message
    DeleteMessage {
        /// Target channel
        chat_id: ChannelId,
        /// Message being deleted
        comment_id: String,
    },
    /// Toggle a reaction on a message
    ToggleReaction {
        /// Target channel
        chat_id: ChannelId,
        /// Message being reacted to
        comment_id: String,
        /// Reaction key (emoji shortcode)
        reaction: String,
    },
}

impl OutboundFrame {
    /// Build a subscribe frame for the given channel list
    pub fn subscribe(chats: Vec<ChannelId>) -> Self {
        Self::Subscribe { chats }
    }

    /// Build a send-message frame with a fresh correlation id
    pub fn send_message(chat_id: ChannelId, text: String) -> Self {
        Self::SendMessage {
            chat_id,
            text,
            temp_id: Some(uuid::Uuid::new_v4().to_string()),
        }
    }

    /// Encode this frame as a JSON string
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(crate::Error::JsonSerialization)
    }
}

/// Frames received from the server over the push channel
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum InboundFrame {
    /// The server acknowledged the subscription
    Subscribed,
    /// A new message arrived on a channel
    NewMessage {
        /// Originating channel
        chat_id: ChannelId,
        /// Timestamp of the message (ISO 8601)
        latest: String,
        /// Preview text, if included
        #[serde(default)]
        text: Option<String>,
        /// Author name, if included
        #[serde(default)]
        author: Option<String>,
        /// Full comment entity; absent for lightweight notifications
        #[serde(default)]
        comment: Option<Value>,
    },
    /// An existing message was edited
    MessageUpdated {
        /// Originating channel
        chat_id: ChannelId,
        /// Updated full comment entity
        comment: Value,
    },
    /// A message was deleted
    MessageDeleted {
        /// Originating channel
        chat_id: ChannelId,
        /// Id of the deleted message
        comment_id: String,
    },
    /// A reaction on a message changed
    ReactionUpdated {
        /// Originating channel
        chat_id: ChannelId,
        /// Full comment entity with updated reactions
        comment: Value,
    },
    /// Acknowledgement of this client's own send
    MessageSent {
        /// Originating channel
        chat_id: ChannelId,
        /// Full comment entity as stored by the server
        comment: Value,
        /// Correlation id echoed from the send, if one was supplied
        #[serde(default)]
        temp_id: Option<String>,
    },
}

impl InboundFrame {
    /// Decode a frame from a JSON string
    pub fn from_json(data: &str) -> Result<Self> {
        serde_json::from_str(data).map_err(crate::Error::JsonSerialization)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_subscribe_frame_encoding() {
        let frame = OutboundFrame::subscribe(vec![
            "general:global".to_string(),
            "event:abc".to_string(),
        ]);
        let json = frame.to_json().expect("Failed to encode");

        let value: Value = serde_json::from_str(&json).expect("Valid JSON");
        assert_eq!(value["type"], "subscribe");
        assert_eq!(value["chats"][0], "general:global");
        assert_eq!(value["chats"][1], "event:abc");
    }

    #[test]
    fn test_send_message_carries_temp_id() {
        let frame = OutboundFrame::send_message("general:global".to_string(), "hi".to_string());
        let json = frame.to_json().expect("Failed to encode");
        let value: Value = serde_json::from_str(&json).expect("Valid JSON");

        assert_eq!(value["type"], "send_message");
        assert_eq!(value["text"], "hi");
        assert!(value["temp_id"].is_string());
    }

    #[test]
    fn test_parse_subscribed() {
        let frame = InboundFrame::from_json(r#"{"type":"subscribed"}"#).expect("Failed to parse");
        assert_eq!(frame, InboundFrame::Subscribed);
    }

    #[test]
    fn test_parse_new_message_full() {
        let raw = r#"{
            "type": "new_message",
            "chat_id": "general:global",
            "latest": "2024-01-01T10:00:00.000Z",
            "text": "hello",
            "author": "alice",
            "comment": {"id": "c1", "body": "hello"}
        }"#;
        let frame = InboundFrame::from_json(raw).expect("Failed to parse");
        match frame {
            InboundFrame::NewMessage {
                chat_id,
                latest,
                text,
                author,
                comment,
            } => {
                assert_eq!(chat_id, "general:global");
                assert_eq!(latest, "2024-01-01T10:00:00.000Z");
                assert_eq!(text.as_deref(), Some("hello"));
                assert_eq!(author.as_deref(), Some("alice"));
                assert_eq!(comment.expect("comment present")["id"], "c1");
            }
            other => panic!("Unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_new_message_lightweight() {
        // Notification without a full entity: optional fields default to None
        let raw = r#"{"type":"new_message","chat_id":"event:e1","latest":"2024-01-01T10:00:00.000Z"}"#;
        let frame = InboundFrame::from_json(raw).expect("Failed to parse");
        match frame {
            InboundFrame::NewMessage { text, author, comment, .. } => {
                assert!(text.is_none());
                assert!(author.is_none());
                assert!(comment.is_none());
            }
            other => panic!("Unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_parse_message_sent_with_temp_id() {
        let raw = r#"{"type":"message_sent","chat_id":"c","comment":{"id":"c9"},"temp_id":"t-123"}"#;
        let frame = InboundFrame::from_json(raw).expect("Failed to parse");
        match frame {
            InboundFrame::MessageSent { temp_id, .. } => {
                assert_eq!(temp_id.as_deref(), Some("t-123"));
            }
            other => panic!("Unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frame_is_an_error() {
        assert!(InboundFrame::from_json("not json at all").is_err());
        assert!(InboundFrame::from_json(r#"{"type":"unknown_event"}"#).is_err());
        assert!(InboundFrame::from_json(r#"{"type":"new_message"}"#).is_err());
    }
}
