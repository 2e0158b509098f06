//! Operation layer between the protocol handlers and the store: friendship
//! (private chats), the group membership ledger, chat enumeration, and
//! message post/edit/delete with their broadcast payloads.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex as StdMutex};

use serde::Serialize;
use tokio::sync::Mutex;

use shared::chat_id::{self, GROUP_PREFIX};
use shared::domain::{ChatId, ChatKind, MessageId, SYSTEM_AUTHOR};
use shared::error::{ApiError, ErrorCode};
use shared::protocol::{
    encode_attachment_text, encode_composition, parse_attachment_text, parse_composition,
    wire_timestamp, CompositionAction, GroupComposition, ServerEvent, WireMessage,
};
use storage::{Storage, StoredMessage};

#[derive(Clone)]
pub struct ApiContext {
    pub storage: Storage,
    locks: ChatLocks,
    memberships: MembershipIndex,
}

impl ApiContext {
    pub fn new(storage: Storage) -> Self {
        Self {
            storage,
            locks: ChatLocks::default(),
            memberships: MembershipIndex::default(),
        }
    }
}

/// Per-chat serialization points. Composition changes on one chat must not
/// interleave; different chats proceed independently.
#[derive(Clone, Default)]
struct ChatLocks {
    inner: Arc<StdMutex<HashMap<String, Arc<Mutex<()>>>>>,
}

impl ChatLocks {
    fn for_chat(&self, chat_id: &str) -> Arc<Mutex<()>> {
        let mut table = self.inner.lock().expect("chat lock table poisoned");
        table.entry(chat_id.to_string()).or_default().clone()
    }
}

/// Internal membership authority: the latest composition per group, versioned
/// by the id of the system message that carries it. The textual record in
/// the stream stays the wire format and audit trail; this index just spares
/// re-parsing it on every read. Rebuilt lazily from the log after a restart.
#[derive(Clone, Default)]
struct MembershipIndex {
    inner: Arc<StdMutex<HashMap<String, VersionedComposition>>>,
}

#[derive(Clone)]
struct VersionedComposition {
    record_id: MessageId,
    composition: GroupComposition,
}

impl MembershipIndex {
    fn get(&self, chat_id: &str) -> Option<GroupComposition> {
        let table = self.inner.lock().expect("membership index poisoned");
        table.get(chat_id).map(|entry| entry.composition.clone())
    }

    /// Records a composition, keeping only the highest record id. Ordering
    /// is by store-assigned id, never by arrival.
    fn record(&self, chat_id: &str, record_id: MessageId, composition: GroupComposition) {
        let mut table = self.inner.lock().expect("membership index poisoned");
        let entry = table.entry(chat_id.to_string());
        match entry {
            std::collections::hash_map::Entry::Occupied(mut occupied) => {
                if occupied.get().record_id.0 < record_id.0 {
                    occupied.insert(VersionedComposition {
                        record_id,
                        composition,
                    });
                }
            }
            std::collections::hash_map::Entry::Vacant(vacant) => {
                vacant.insert(VersionedComposition {
                    record_id,
                    composition,
                });
            }
        }
    }

    fn forget(&self, chat_id: &str) {
        self.inner
            .lock()
            .expect("membership index poisoned")
            .remove(chat_id);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChatSummary {
    pub chat_id: ChatId,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct UserChats {
    pub private_chats: Vec<ChatSummary>,
    pub group_chats: Vec<ChatSummary>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FriendAdded {
    pub success: bool,
    pub chat_id: ChatId,
    pub friend: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupInfo {
    pub chat_id: ChatId,
    pub name: String,
    pub participants: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// Membership dropped below two; the chat's messages were purged.
    Deleted,
    Remaining(Vec<String>),
}

// ---------------------------------------------------------------------------
// Friendship (a friendship is nothing but an existing private chat)
// ---------------------------------------------------------------------------

pub async fn add_friend(
    ctx: &ApiContext,
    username: &str,
    friend: &str,
) -> Result<FriendAdded, ApiError> {
    let username = username.trim();
    let friend = friend.trim();
    ensure_known_user(ctx, username).await?;
    ensure_known_user(ctx, friend).await?;

    let chat_id = chat_id::private_chat_id(username, friend).map_err(ApiError::from)?;
    if !ctx.storage.chat_exists(&chat_id).await.map_err(internal)? {
        ctx.storage
            .append_message(
                &chat_id,
                SYSTEM_AUTHOR,
                &format!("You added {friend} as a friend!"),
            )
            .await
            .map_err(internal)?;
    }
    Ok(FriendAdded {
        success: true,
        chat_id,
        friend: friend.to_string(),
    })
}

/// Purges the private chat between the two users. Idempotent.
pub async fn remove_friend(ctx: &ApiContext, username: &str, friend: &str) -> Result<(), ApiError> {
    let chat_id = chat_id::private_chat_id(username.trim(), friend.trim()).map_err(ApiError::from)?;
    ctx.storage.delete_chat(&chat_id).await.map_err(internal)?;
    Ok(())
}

/// Everyone the user shares a private chat with, sorted.
pub async fn friends_of(ctx: &ApiContext, username: &str) -> Result<Vec<String>, ApiError> {
    let username = username.trim();
    let ids = ctx
        .storage
        .chat_ids_containing(username)
        .await
        .map_err(internal)?;

    let mut friends = BTreeSet::new();
    for id in &ids {
        if let Some(other) = private_chat_peer(id, username) {
            friends.insert(other);
        }
    }
    Ok(friends.into_iter().collect())
}

/// Both chat lists of a user: private chats named after the other
/// participant, groups named after their current composition.
pub async fn user_chats(ctx: &ApiContext, username: &str) -> Result<UserChats, ApiError> {
    let username = username.trim();

    let mut ids: BTreeSet<ChatId> = BTreeSet::new();
    for id in ctx
        .storage
        .chat_ids_for_author(username)
        .await
        .map_err(internal)?
    {
        ids.insert(id);
    }
    for id in ctx
        .storage
        .chat_ids_containing(username)
        .await
        .map_err(internal)?
    {
        ids.insert(id);
    }

    let mut private_chats = Vec::new();
    for id in &ids {
        if let Some(other) = private_chat_peer(id, username) {
            private_chats.push(ChatSummary {
                chat_id: id.clone(),
                name: other,
            });
        }
    }
    private_chats.sort_by(|a, b| a.name.cmp(&b.name));

    let mut group_chats = Vec::new();
    for id in ctx
        .storage
        .chat_ids_containing(GROUP_PREFIX)
        .await
        .map_err(internal)?
    {
        if id.kind() != ChatKind::Group {
            continue;
        }
        let Some(composition) = latest_composition(ctx, &id).await? else {
            continue;
        };
        if composition.participants.iter().any(|p| p == username) {
            group_chats.push(ChatSummary {
                chat_id: id,
                name: composition.name,
            });
        }
    }
    group_chats.sort_by(|a, b| a.name.cmp(&b.name));

    Ok(UserChats {
        private_chats,
        group_chats,
    })
}

fn private_chat_peer(chat_id: &ChatId, username: &str) -> Option<String> {
    let (a, b) = chat_id::private_participants(chat_id.as_str())?;
    if a == username {
        Some(b)
    } else if b == username {
        Some(a)
    } else {
        None
    }
}

// ---------------------------------------------------------------------------
// Membership ledger
// ---------------------------------------------------------------------------

pub async fn create_group(
    ctx: &ApiContext,
    actor: &str,
    name: &str,
    members: &[String],
) -> Result<GroupInfo, ApiError> {
    let actor = actor.trim();
    let mut participants: Vec<String> = members.to_vec();
    participants.push(actor.to_string());
    let participants = chat_id::normalize_participants(&participants);

    let chat_id = chat_id::group_chat_id(&participants).map_err(ApiError::from)?;
    let name = display_name(name);

    let guard = ctx.locks.for_chat(chat_id.as_str());
    let _held = guard.lock().await;
    append_composition_record(ctx, &chat_id, &name, &participants, CompositionAction::Created)
        .await?;

    Ok(GroupInfo {
        chat_id,
        name,
        participants,
    })
}

/// Appends a composition record for an existing group chat, linearized per
/// chat. `participants` must already be the full intended membership.
pub async fn append_composition(
    ctx: &ApiContext,
    chat_id: &ChatId,
    name: &str,
    participants: &[String],
    action: CompositionAction,
) -> Result<StoredMessage, ApiError> {
    ensure_group(chat_id)?;
    let participants = chat_id::normalize_participants(participants);
    if participants.len() < 2 {
        return Err(ApiError::new(
            ErrorCode::InvalidArgument,
            "group needs at least 2 members",
        ));
    }
    let guard = ctx.locks.for_chat(chat_id.as_str());
    let _held = guard.lock().await;
    append_composition_record(ctx, chat_id, &display_name(name), &participants, action).await
}

/// The authoritative membership of a group: the newest system message that
/// parses as a composition record.
pub async fn current_composition(ctx: &ApiContext, chat_id: &ChatId) -> Result<GroupInfo, ApiError> {
    ensure_group(chat_id)?;
    let composition = latest_composition(ctx, chat_id).await?.ok_or_else(|| {
        ApiError::new(ErrorCode::NotFound, "group has no composition record")
    })?;
    Ok(GroupInfo {
        chat_id: chat_id.clone(),
        name: composition.name,
        participants: composition.participants,
    })
}

pub async fn update_members(
    ctx: &ApiContext,
    chat_id: &ChatId,
    new_members: &[String],
) -> Result<Vec<String>, ApiError> {
    ensure_group(chat_id)?;
    let members = chat_id::normalize_participants(new_members);
    if members.len() < 2 {
        return Err(ApiError::new(
            ErrorCode::InvalidArgument,
            "group needs at least 2 members",
        ));
    }

    let guard = ctx.locks.for_chat(chat_id.as_str());
    let _held = guard.lock().await;
    let name = latest_composition(ctx, chat_id)
        .await?
        .map(|composition| composition.name)
        .unwrap_or_else(|| "Untitled".to_string());
    append_composition_record(ctx, chat_id, &name, &members, CompositionAction::Updated).await?;
    Ok(members)
}

/// Removes a user from a group. Leaving a group the user is not part of is
/// a no-op success; membership shrinking below two purges the chat.
pub async fn leave_group(
    ctx: &ApiContext,
    chat_id: &ChatId,
    username: &str,
) -> Result<LeaveOutcome, ApiError> {
    ensure_group(chat_id)?;
    let username = username.trim();

    let guard = ctx.locks.for_chat(chat_id.as_str());
    let _held = guard.lock().await;

    let Some(GroupComposition { name, participants }) =
        latest_composition(ctx, chat_id).await?
    else {
        return Ok(LeaveOutcome::Remaining(Vec::new()));
    };
    if !participants.iter().any(|p| p == username) {
        return Ok(LeaveOutcome::Remaining(participants));
    }

    let remaining: Vec<String> = participants
        .into_iter()
        .filter(|p| p != username)
        .collect();
    if remaining.len() < 2 {
        ctx.storage.delete_chat(chat_id).await.map_err(internal)?;
        ctx.memberships.forget(chat_id.as_str());
        return Ok(LeaveOutcome::Deleted);
    }

    append_composition_record(ctx, chat_id, &name, &remaining, CompositionAction::Updated).await?;
    Ok(LeaveOutcome::Remaining(remaining))
}

pub async fn delete_chat(ctx: &ApiContext, chat_id: &ChatId) -> Result<u64, ApiError> {
    let purged = ctx.storage.delete_chat(chat_id).await.map_err(internal)?;
    ctx.memberships.forget(chat_id.as_str());
    Ok(purged)
}

async fn append_composition_record(
    ctx: &ApiContext,
    chat_id: &ChatId,
    name: &str,
    participants: &[String],
    action: CompositionAction,
) -> Result<StoredMessage, ApiError> {
    let text = encode_composition(name, participants, action);
    let stored = ctx
        .storage
        .append_message(chat_id, SYSTEM_AUTHOR, &text)
        .await
        .map_err(internal)?;
    ctx.memberships.record(
        chat_id.as_str(),
        stored.id,
        GroupComposition {
            name: name.to_string(),
            participants: participants.to_vec(),
        },
    );
    Ok(stored)
}

async fn latest_composition(
    ctx: &ApiContext,
    chat_id: &ChatId,
) -> Result<Option<GroupComposition>, ApiError> {
    if let Some(cached) = ctx.memberships.get(chat_id.as_str()) {
        return Ok(Some(cached));
    }
    let records = ctx
        .storage
        .system_messages_desc(chat_id)
        .await
        .map_err(internal)?;
    let found = records
        .iter()
        .find_map(|record| parse_composition(&record.text).map(|c| (record.id, c)));
    Ok(found.map(|(record_id, composition)| {
        ctx.memberships
            .record(chat_id.as_str(), record_id, composition.clone());
        composition
    }))
}

fn ensure_group(chat_id: &ChatId) -> Result<(), ApiError> {
    if chat_id.kind() != ChatKind::Group {
        return Err(ApiError::new(
            ErrorCode::InvalidArgument,
            "not a group chat",
        ));
    }
    Ok(())
}

fn display_name(name: &str) -> String {
    let name = name.trim();
    if name.is_empty() {
        "Untitled".to_string()
    } else {
        name.to_string()
    }
}

// ---------------------------------------------------------------------------
// Messages
// ---------------------------------------------------------------------------

pub async fn post_message(
    ctx: &ApiContext,
    chat_id: &ChatId,
    author: &str,
    text: &str,
) -> Result<ServerEvent, ApiError> {
    if text.is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidArgument, "empty message"));
    }
    let stored = ctx
        .storage
        .append_message(chat_id, author, text)
        .await
        .map_err(internal)?;
    Ok(ServerEvent::Message {
        id: stored.id,
        username: stored.author,
        text: stored.text,
        timestamp: wire_timestamp(stored.timestamp),
        chat_id: stored.chat_id,
        edited: false,
    })
}

pub async fn post_attachment(
    ctx: &ApiContext,
    chat_id: &ChatId,
    author: &str,
    url: &str,
    filename: &str,
    is_image: bool,
) -> Result<ServerEvent, ApiError> {
    if url.is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidArgument, "empty url"));
    }
    let stored = ctx
        .storage
        .append_message(chat_id, author, &encode_attachment_text(filename, url))
        .await
        .map_err(internal)?;
    Ok(ServerEvent::Attachment {
        username: stored.author,
        chat_id: stored.chat_id,
        url: url.to_string(),
        filename: filename.to_string(),
        is_image,
        timestamp: wire_timestamp(stored.timestamp),
    })
}

/// Edits a message in place. Only the original author may edit; system
/// messages have no user author and are therefore immutable here.
pub async fn edit_message(
    ctx: &ApiContext,
    actor: &str,
    message_id: MessageId,
    text: &str,
) -> Result<(ServerEvent, ChatId), ApiError> {
    if text.is_empty() {
        return Err(ApiError::new(ErrorCode::InvalidArgument, "empty message"));
    }
    let message = require_authored(ctx, actor, message_id).await?;
    ctx.storage
        .update_message_text(message_id, text)
        .await
        .map_err(internal)?;
    Ok((
        ServerEvent::MessageEdited {
            message_id,
            text: text.to_string(),
            edited: true,
        },
        message.chat_id,
    ))
}

pub async fn delete_message(
    ctx: &ApiContext,
    actor: &str,
    message_id: MessageId,
) -> Result<(ServerEvent, ChatId), ApiError> {
    let message = require_authored(ctx, actor, message_id).await?;
    ctx.storage
        .delete_message(message_id)
        .await
        .map_err(internal)?;
    Ok((ServerEvent::MessageDeleted { message_id }, message.chat_id))
}

async fn require_authored(
    ctx: &ApiContext,
    actor: &str,
    message_id: MessageId,
) -> Result<StoredMessage, ApiError> {
    let message = ctx
        .storage
        .message_by_id(message_id)
        .await
        .map_err(internal)?
        .ok_or_else(|| ApiError::new(ErrorCode::NotFound, "unknown message"))?;
    if message.author != actor {
        return Err(ApiError::new(ErrorCode::Unauthorized, "not the author"));
    }
    Ok(message)
}

/// Full ordered history with attachment markers rehydrated into structured
/// metadata.
pub async fn load_history(ctx: &ApiContext, chat_id: &ChatId) -> Result<Vec<WireMessage>, ApiError> {
    let messages = ctx
        .storage
        .messages_for_chat(chat_id)
        .await
        .map_err(internal)?;
    Ok(messages
        .into_iter()
        .map(|message| WireMessage {
            id: message.id,
            username: message.author,
            attachment: parse_attachment_text(&message.text),
            text: message.text,
            timestamp: wire_timestamp(message.timestamp),
            chat_id: message.chat_id,
        })
        .collect())
}

/// Who should receive events for a chat. `None` means membership cannot be
/// narrowed (the reserved room, or a group without a composition record)
/// and delivery falls back to every live connection.
pub async fn recipients_for_chat(
    ctx: &ApiContext,
    chat_id: &ChatId,
) -> Result<Option<Vec<String>>, ApiError> {
    match chat_id.kind() {
        ChatKind::Reserved => Ok(None),
        ChatKind::Private => Ok(chat_id::private_participants(chat_id.as_str())
            .map(|(a, b)| vec![a, b])),
        ChatKind::Group => Ok(latest_composition(ctx, chat_id)
            .await?
            .map(|composition| composition.participants)),
    }
}

async fn ensure_known_user(ctx: &ApiContext, username: &str) -> Result<(), ApiError> {
    let known = ctx
        .storage
        .user_exists(username)
        .await
        .map_err(internal)?;
    if !known {
        return Err(ApiError::new(
            ErrorCode::NotFound,
            format!("no user named {username}"),
        ));
    }
    Ok(())
}

fn internal(err: anyhow::Error) -> ApiError {
    tracing::error!(error = %err, "storage operation failed");
    ApiError::new(ErrorCode::Internal, err.to_string())
}

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
