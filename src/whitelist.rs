//! Admin-based authorization with a per-plugin memo.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use tracing::warn;

/// Source of chat administrator lists.
#[async_trait]
pub trait AdminLookup: Send + Sync {
    async fn admin_ids(&self, chat_id: i64) -> Result<Vec<u64>, String>;
}

/// Remembers whether a user administers any of the whitelist chats.
///
/// Entries are never evicted; a negative answer sticks until restart.
pub struct WhitelistCache {
    chat_ids: Vec<i64>,
    cache: Mutex<HashMap<u64, bool>>,
}

impl WhitelistCache {
    pub fn new(chat_ids: Vec<i64>) -> Self {
        Self {
            chat_ids,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn chat_ids(&self) -> &[i64] {
        &self.chat_ids
    }

    fn cached(&self, user_id: u64) -> Option<bool> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(&user_id).copied()
    }

    /// Whether `user_id` may use the plugin. Lookup failures count as "not an
    /// admin of that chat" and are logged.
    pub async fn is_allowed<L: AdminLookup + ?Sized>(&self, user_id: u64, lookup: &L) -> bool {
        if let Some(allowed) = self.cached(user_id) {
            return allowed;
        }

        let mut allowed = false;
        for &chat_id in &self.chat_ids {
            match lookup.admin_ids(chat_id).await {
                Ok(ids) if ids.contains(&user_id) => {
                    allowed = true;
                    break;
                }
                Ok(_) => {}
                Err(e) => warn!("failed to get admin list for {chat_id}: {e}"),
            }
        }

        self.cache
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(user_id, allowed);
        allowed
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Fixed admin lists; chats missing from the map fail.
    pub(crate) struct FakeAdmins {
        pub admins: HashMap<i64, Vec<u64>>,
        pub calls: AtomicUsize,
    }

    impl FakeAdmins {
        pub(crate) fn new(admins: &[(i64, &[u64])]) -> Self {
            Self {
                admins: admins.iter().map(|(c, ids)| (*c, ids.to_vec())).collect(),
                calls: AtomicUsize::new(0),
            }
        }
    }

    #[async_trait]
    impl AdminLookup for FakeAdmins {
        async fn admin_ids(&self, chat_id: i64) -> Result<Vec<u64>, String> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.admins
                .get(&chat_id)
                .cloned()
                .ok_or_else(|| "Bad Request: chat not found".to_string())
        }
    }

    #[tokio::test]
    async fn test_admin_is_allowed() {
        let lookup = FakeAdmins::new(&[(-1, &[10, 11])]);
        let whitelist = WhitelistCache::new(vec![-1]);
        assert!(whitelist.is_allowed(11, &lookup).await);
    }

    #[tokio::test]
    async fn test_negative_answer_is_cached() {
        let lookup = FakeAdmins::new(&[(-1, &[10])]);
        let whitelist = WhitelistCache::new(vec![-1]);

        assert!(!whitelist.is_allowed(99, &lookup).await);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);

        assert!(!whitelist.is_allowed(99, &lookup).await);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_stops_at_first_matching_chat() {
        let lookup = FakeAdmins::new(&[(-1, &[10]), (-2, &[20])]);
        let whitelist = WhitelistCache::new(vec![-1, -2]);
        assert!(whitelist.is_allowed(10, &lookup).await);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_lookup_skips_to_next_chat() {
        let lookup = FakeAdmins::new(&[(-2, &[20])]);
        let whitelist = WhitelistCache::new(vec![-1, -2]);
        assert!(whitelist.is_allowed(20, &lookup).await);
        assert_eq!(lookup.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_empty_whitelist_denies() {
        let lookup = FakeAdmins::new(&[]);
        let whitelist = WhitelistCache::new(vec![]);
        assert!(!whitelist.is_allowed(1, &lookup).await);
    }
}
