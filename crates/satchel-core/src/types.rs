// SPDX-FileCopyrightText: 2026 Satchel Contributors
// SPDX-License-Identifier: MIT OR Apache-2.0

//! Message and update types shared across the workspace.
//!
//! A [`Message`] is owned by the update log and immutable once stored; the
//! [`Update`] is the thin read-model the bot-API surface hands to consumers.

use serde::{Deserialize, Serialize};

/// Whether a message arrived from the remote self-chat or was sent by us.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Inbound,
    Outbound,
}

impl std::fmt::Display for Direction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::Inbound => write!(f, "inbound"),
            Direction::Outbound => write!(f, "outbound"),
        }
    }
}

/// Kind of attachment carried by a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AttachmentKind {
    File,
    Image,
}

impl std::fmt::Display for AttachmentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AttachmentKind::File => write!(f, "file"),
            AttachmentKind::Image => write!(f, "image"),
        }
    }
}

/// File metadata attached to a message.
///
/// `stored_path` is set once the content has been downloaded (or for
/// outbound sends, points at the source file).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attachment {
    pub file_name: String,
    pub kind: AttachmentKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stored_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<u64>,
}

/// A message as stored in the update log. Immutable once stored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Process-local monotonically increasing id, gapless across appends.
    pub id: i64,
    /// The remote endpoint's message id, when one exists. Used for inbound
    /// dedup and media download addressing.
    pub remote_id: Option<String>,
    pub direction: Direction,
    pub text: String,
    pub attachment: Option<Attachment>,
    /// Must reference an existing `id` when present.
    pub reply_to_id: Option<i64>,
    /// Unix seconds at ingestion.
    pub created_at: i64,
}

impl Message {
    /// The bot-API "type" string for this message.
    pub fn kind_str(&self) -> &'static str {
        match self.attachment.as_ref().map(|a| a.kind) {
            Some(AttachmentKind::Image) => "image",
            Some(AttachmentKind::File) => "file",
            None => "text",
        }
    }
}

/// A message about to be appended; the log assigns `id` and `created_at`.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub remote_id: Option<String>,
    pub direction: Direction,
    pub text: String,
    pub attachment: Option<Attachment>,
    pub reply_to_id: Option<i64>,
}

impl NewMessage {
    /// Convenience constructor for a plain text message.
    pub fn text(direction: Direction, text: impl Into<String>) -> Self {
        Self {
            remote_id: None,
            direction,
            text: text.into(),
            attachment: None,
            reply_to_id: None,
        }
    }
}

/// Read-model over [`Message`] for offset-paginated retrieval.
///
/// `update_id` equals the message id; consuming an update advances the
/// client's remembered offset, nothing server-side is deleted.
#[derive(Debug, Clone, Serialize)]
pub struct Update {
    pub update_id: i64,
    pub message: Message,
}

impl From<Message> for Update {
    fn from(message: Message) -> Self {
        Update {
            update_id: message.id,
            message,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_id_mirrors_message_id() {
        let msg = Message {
            id: 42,
            remote_id: None,
            direction: Direction::Inbound,
            text: "hi".to_string(),
            attachment: None,
            reply_to_id: None,
            created_at: 0,
        };
        let update = Update::from(msg);
        assert_eq!(update.update_id, 42);
        assert_eq!(update.message.id, 42);
    }

    #[test]
    fn kind_str_follows_attachment() {
        let mut msg = Message {
            id: 1,
            remote_id: None,
            direction: Direction::Inbound,
            text: "[File: a.pdf]".to_string(),
            attachment: Some(Attachment {
                file_name: "a.pdf".to_string(),
                kind: AttachmentKind::File,
                stored_path: None,
                size: None,
            }),
            reply_to_id: None,
            created_at: 0,
        };
        assert_eq!(msg.kind_str(), "file");
        msg.attachment = None;
        assert_eq!(msg.kind_str(), "text");
    }

    #[test]
    fn direction_serializes_lowercase() {
        assert_eq!(
            serde_json::to_string(&Direction::Inbound).unwrap(),
            "\"inbound\""
        );
    }
}
