//! Ephemeral per-process presence: who is online, who is typing where.
//! Nothing here survives a restart, and nothing needs to.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

#[derive(Clone, Default)]
pub(crate) struct PresenceTracker {
    online: Arc<RwLock<HashSet<String>>>,
    typing: Arc<RwLock<HashMap<String, HashSet<String>>>>,
}

impl PresenceTracker {
    pub(crate) fn mark_online(&self, username: &str) {
        self.online
            .write()
            .expect("online set poisoned")
            .insert(username.to_string());
    }

    pub(crate) fn mark_offline(&self, username: &str) {
        self.online
            .write()
            .expect("online set poisoned")
            .remove(username);
    }

    pub(crate) fn is_online(&self, username: &str) -> bool {
        self.online
            .read()
            .expect("online set poisoned")
            .contains(username)
    }

    /// Sets or clears one user's typing flag for a chat and returns the full
    /// current typing set for that chat, sorted. Consumers replace their
    /// view wholesale rather than applying deltas.
    pub(crate) fn set_typing(&self, chat_id: &str, username: &str, is_typing: bool) -> Vec<String> {
        let mut chats = self.typing.write().expect("typing map poisoned");
        let users = {
            let set = chats.entry(chat_id.to_string()).or_default();
            if is_typing {
                set.insert(username.to_string());
            } else {
                set.remove(username);
            }
            let mut users: Vec<String> = set.iter().cloned().collect();
            users.sort_unstable();
            users
        };
        if users.is_empty() {
            chats.remove(chat_id);
        }
        users
    }

    /// Drops a user from every typing set, returning each affected chat with
    /// its refreshed set. Used at session teardown.
    pub(crate) fn clear_user(&self, username: &str) -> Vec<(String, Vec<String>)> {
        let mut affected = Vec::new();
        let mut chats = self.typing.write().expect("typing map poisoned");
        chats.retain(|chat_id, set| {
            if set.remove(username) {
                let mut users: Vec<String> = set.iter().cloned().collect();
                users.sort_unstable();
                affected.push((chat_id.clone(), users));
            }
            !set.is_empty()
        });
        affected
    }
}
