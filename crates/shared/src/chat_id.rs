//! Conversation identity derivation.
//!
//! A private chat id is reconstructible from either participant and is
//! identical regardless of argument order. A group chat id is a pure
//! function of the initial participant set; renaming or recomposing the
//! group never changes it.

use md5::{Digest, Md5};

use crate::domain::{ChatId, ChatKind, PUBLIC_CHAT_ID};
use crate::error::{ApiException, ErrorCode};

pub const GROUP_PREFIX: &str = "group:";

const GROUP_DIGEST_HEX_LEN: usize = 8;

pub fn private_chat_id(a: &str, b: &str) -> Result<ChatId, ApiException> {
    let a = a.trim();
    let b = b.trim();
    if a == b {
        return Err(ApiException::new(
            ErrorCode::InvalidArgument,
            "cannot open a private chat with yourself",
        ));
    }
    let mut pair = [a, b];
    pair.sort_unstable();
    Ok(ChatId::new(pair.join(":")))
}

pub fn group_chat_id<I, S>(participants: I) -> Result<ChatId, ApiException>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let names = normalize_participants(participants);
    if names.len() < 2 {
        return Err(ApiException::new(
            ErrorCode::InvalidArgument,
            "group needs at least 2 members",
        ));
    }
    let digest = Md5::digest(names.join(":").as_bytes());
    let hex = hex::encode(digest);
    Ok(ChatId::new(format!(
        "{GROUP_PREFIX}{}",
        &hex[..GROUP_DIGEST_HEX_LEN]
    )))
}

/// Trimmed, de-duplicated, sorted participant names.
pub fn normalize_participants<I, S>(participants: I) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut names: Vec<String> = participants
        .into_iter()
        .map(|name| name.as_ref().trim().to_string())
        .filter(|name| !name.is_empty())
        .collect();
    names.sort_unstable();
    names.dedup();
    names
}

pub fn classify(chat_id: &str) -> ChatKind {
    if chat_id.starts_with(GROUP_PREFIX) {
        ChatKind::Group
    } else if chat_id == PUBLIC_CHAT_ID {
        ChatKind::Reserved
    } else {
        ChatKind::Private
    }
}

/// The two participants of a private chat id, or `None` for any other shape.
pub fn private_participants(chat_id: &str) -> Option<(String, String)> {
    if classify(chat_id) != ChatKind::Private {
        return None;
    }
    let (a, b) = chat_id.split_once(':')?;
    if a.is_empty() || b.is_empty() || b.contains(':') {
        return None;
    }
    Some((a.to_string(), b.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn private_chat_id_is_commutative() {
        let ab = private_chat_id("alice", "bob").expect("chat id");
        let ba = private_chat_id("bob", "alice").expect("chat id");
        assert_eq!(ab, ba);
        assert_eq!(ab.as_str(), "alice:bob");
    }

    #[test]
    fn private_chat_with_self_is_rejected() {
        let err = private_chat_id("alice", "alice").expect_err("should fail");
        assert_eq!(err.code, ErrorCode::InvalidArgument);
    }

    #[test]
    fn group_chat_id_is_order_independent_and_stable() {
        let forward = group_chat_id(["a", "b", "c"]).expect("chat id");
        let shuffled = group_chat_id(["c", "a", "b"]).expect("chat id");
        let again = group_chat_id(["a", "b", "c"]).expect("chat id");
        assert_eq!(forward, shuffled);
        assert_eq!(forward, again);

        let suffix = forward.as_str().strip_prefix(GROUP_PREFIX).expect("prefix");
        assert_eq!(suffix.len(), 8);
        assert!(suffix.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn group_chat_id_deduplicates_before_validating() {
        let err = group_chat_id(["a", "a", " a "]).expect_err("should fail");
        assert_eq!(err.code, ErrorCode::InvalidArgument);

        let deduped = group_chat_id(["a", "a", "b"]).expect("chat id");
        let plain = group_chat_id(["a", "b"]).expect("chat id");
        assert_eq!(deduped, plain);
    }

    #[test]
    fn classify_recognizes_all_kinds() {
        assert_eq!(classify("group:0a1b2c3d"), ChatKind::Group);
        assert_eq!(classify(PUBLIC_CHAT_ID), ChatKind::Reserved);
        assert_eq!(classify("alice:bob"), ChatKind::Private);
    }

    #[test]
    fn private_participants_splits_well_formed_ids_only() {
        assert_eq!(
            private_participants("alice:bob"),
            Some(("alice".to_string(), "bob".to_string()))
        );
        assert_eq!(private_participants("global"), None);
        assert_eq!(private_participants("group:0a1b2c3d"), None);
        assert_eq!(private_participants("a:b:c"), None);
    }
}
