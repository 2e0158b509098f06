//! Session wire protocol: the line-delimited JSON events exchanged over a
//! live connection, plus the two in-text encodings the message stream
//! carries (attachment markers and group composition records).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};

use crate::domain::{ChatId, MessageId, PUBLIC_CHAT_ID};

/// Inbound client events. The `type` field selects the variant; a payload
/// with no `type` at all is a plain send (see [`parse_client_event`]).
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientEvent {
    LoadChat {
        #[serde(default = "default_chat_id")]
        chat_id: ChatId,
    },
    Typing {
        chat_id: ChatId,
        #[serde(default)]
        is_typing: bool,
    },
    Attachment {
        chat_id: ChatId,
        url: String,
        filename: String,
        #[serde(default)]
        is_image: bool,
    },
    EditMessage {
        #[serde(deserialize_with = "lenient_message_id")]
        message_id: MessageId,
        text: String,
    },
    DeleteMessage {
        #[serde(deserialize_with = "lenient_message_id")]
        message_id: MessageId,
    },
    Send {
        text: String,
        #[serde(default = "default_chat_id")]
        chat_id: ChatId,
    },
}

/// Decodes one frame of client input. Returns `None` for anything that is
/// not a well-formed event; the session handler ignores those silently.
pub fn parse_client_event(raw: &str) -> Option<ClientEvent> {
    let value: serde_json::Value = serde_json::from_str(raw).ok()?;
    if value.get("type").is_some() {
        return serde_json::from_value(value).ok();
    }
    let plain: PlainSend = serde_json::from_value(value).ok()?;
    Some(ClientEvent::Send {
        text: plain.text,
        chat_id: plain.chat_id,
    })
}

#[derive(Deserialize)]
struct PlainSend {
    text: String,
    #[serde(default = "default_chat_id")]
    chat_id: ChatId,
}

fn default_chat_id() -> ChatId {
    ChatId::new(PUBLIC_CHAT_ID)
}

// Browser clients echo message ids back as strings.
fn lenient_message_id<'de, D>(deserializer: D) -> Result<MessageId, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Raw {
        Num(i64),
        Text(String),
    }

    match Raw::deserialize(deserializer)? {
        Raw::Num(id) => Ok(MessageId(id)),
        Raw::Text(text) => text
            .trim()
            .parse::<i64>()
            .map(MessageId)
            .map_err(serde::de::Error::custom),
    }
}

/// Outbound server events.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerEvent {
    History {
        chat_id: ChatId,
        messages: Vec<WireMessage>,
    },
    Typing {
        chat_id: ChatId,
        users: Vec<String>,
    },
    Message {
        id: MessageId,
        username: String,
        text: String,
        timestamp: String,
        chat_id: ChatId,
        edited: bool,
    },
    Attachment {
        username: String,
        chat_id: ChatId,
        url: String,
        filename: String,
        is_image: bool,
        timestamp: String,
    },
    MessageEdited {
        message_id: MessageId,
        text: String,
        edited: bool,
    },
    MessageDeleted {
        message_id: MessageId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WireMessage {
    pub id: MessageId,
    pub username: String,
    pub text: String,
    pub timestamp: String,
    pub chat_id: ChatId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentMeta>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttachmentMeta {
    pub url: String,
    pub filename: String,
    pub is_image: bool,
}

/// ISO-8601 with a literal `Z` appended to an already-UTC instant. The
/// instant is formatted without a zone suffix, so the marker is never
/// stacked.
pub fn wire_timestamp(instant: DateTime<Utc>) -> String {
    format!("{}Z", instant.format("%Y-%m-%dT%H:%M:%S%.6f"))
}

// ---------------------------------------------------------------------------
// Attachment marker
// ---------------------------------------------------------------------------

const ATTACHMENT_PREFIX: &str = "[file] ";
const ATTACHMENT_SEPARATOR: &str = " -> ";

const IMAGE_EXTENSIONS: &[&str] = &["png", "jpg", "jpeg", "gif", "webp", "bmp", "svg"];

/// `"[file] {filename} -> {url}"` — the stored text of an attachment message.
pub fn encode_attachment_text(filename: &str, url: &str) -> String {
    format!("{ATTACHMENT_PREFIX}{filename}{ATTACHMENT_SEPARATOR}{url}")
}

/// Rehydrates structured attachment metadata out of a stored message text,
/// or `None` when the text is not an attachment marker.
pub fn parse_attachment_text(text: &str) -> Option<AttachmentMeta> {
    let rest = text.strip_prefix(ATTACHMENT_PREFIX)?;
    let (filename, url) = rest.split_once(ATTACHMENT_SEPARATOR)?;
    Some(AttachmentMeta {
        url: url.to_string(),
        filename: filename.to_string(),
        is_image: is_image_filename(filename),
    })
}

pub fn is_image_filename(filename: &str) -> bool {
    filename
        .rsplit_once('.')
        .map(|(_, ext)| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

// ---------------------------------------------------------------------------
// Group composition record
// ---------------------------------------------------------------------------

const COMPOSITION_PREFIX: &str = "Group '";
const CREATED_MARKER: &str = "' created! Members: ";
const UPDATED_MARKER: &str = "' updated! Members: ";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompositionAction {
    Created,
    Updated,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupComposition {
    pub name: String,
    pub participants: Vec<String>,
}

/// `"Group '{name}' {created|updated}! Members: {comma-separated users}"` —
/// the system-message text that carries group membership. Every writer and
/// reader must use this exact form.
pub fn encode_composition(
    name: &str,
    participants: &[String],
    action: CompositionAction,
) -> String {
    let marker = match action {
        CompositionAction::Created => CREATED_MARKER,
        CompositionAction::Updated => UPDATED_MARKER,
    };
    format!(
        "{COMPOSITION_PREFIX}{name}{marker}{}",
        participants.join(", ")
    )
}

/// Recognizes a composition record. `None` when the text is not one;
/// a matched-but-malformed record degrades to an untitled, empty
/// composition rather than failing.
pub fn parse_composition(text: &str) -> Option<GroupComposition> {
    let rest = text.strip_prefix(COMPOSITION_PREFIX)?;
    for marker in [CREATED_MARKER, UPDATED_MARKER] {
        if let Some((name, members)) = rest.split_once(marker) {
            let participants = members
                .split(',')
                .map(|member| member.trim().to_string())
                .filter(|member| !member.is_empty())
                .collect();
            return Some(GroupComposition {
                name: name.to_string(),
                participants,
            });
        }
    }
    Some(GroupComposition {
        name: "Untitled".to_string(),
        participants: Vec::new(),
    })
}
