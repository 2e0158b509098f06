use std::fmt;

use serde::{Deserialize, Serialize};

/// Pseudo-author of service-generated messages (welcome notices, group
/// composition records). Messages under this name are immutable to users.
pub const SYSTEM_AUTHOR: &str = "system";

/// Reserved identifier of the single public broadcast room.
pub const PUBLIC_CHAT_ID: &str = "global";

macro_rules! id_newtype {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        pub struct $name(pub i64);
    };
}

id_newtype!(MessageId);

/// Opaque key partitioning the message stream into conversations.
///
/// Derivation rules live in [`crate::chat_id`]; everything else treats the
/// value as an uninterpreted string.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChatId(pub String);

impl ChatId {
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> ChatKind {
        crate::chat_id::classify(&self.0)
    }
}

impl fmt::Display for ChatId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChatId {
    fn from(raw: &str) -> Self {
        Self(raw.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChatKind {
    Private,
    Group,
    Reserved,
}
