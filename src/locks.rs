//! One async mutex per chat, held around answer generation.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Default)]
pub struct ChatLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ChatLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Waits for the chat's lock. The guard releases it on drop.
    pub async fn acquire(&self, chat_id: &str) -> OwnedMutexGuard<()> {
        let lock = self.locks.entry(chat_id.to_string()).or_default().clone();
        lock.lock_owned().await
    }

    pub fn is_locked(&self, chat_id: &str) -> bool {
        self.locks
            .get(chat_id)
            .map(|lock| lock.try_lock().is_err())
            .unwrap_or(false)
    }

    /// Drops locks nobody holds or waits for. Holders and waiters keep an `Arc` clone.
    pub fn prune(&self) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, lock| Arc::strong_count(lock) > 1);
        before - self.locks.len()
    }

    pub fn len(&self) -> usize {
        self.locks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    #[tokio::test]
    async fn holders_of_one_chat_never_overlap() {
        let locks = Arc::new(ChatLocks::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let (locks, active, max_seen) = (locks.clone(), active.clone(), max_seen.clone());
            handles.push(tokio::spawn(async move {
                let _guard = locks.acquire("chat-1").await;
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                max_seen.fetch_max(now, Ordering::SeqCst);
                tokio::time::sleep(Duration::from_millis(5)).await;
                active.fetch_sub(1, Ordering::SeqCst);
            }));
        }
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(max_seen.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn different_chats_do_not_block_each_other() {
        let locks = ChatLocks::new();
        let _a = locks.acquire("a").await;
        let b = tokio::time::timeout(Duration::from_millis(100), locks.acquire("b")).await;
        assert!(b.is_ok());
    }

    #[tokio::test]
    async fn prune_keeps_held_locks() {
        let locks = ChatLocks::new();
        let guard = locks.acquire("held").await;
        drop(locks.acquire("idle").await);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_locked("held"));
        drop(guard);
        assert_eq!(locks.prune(), 1);
        assert!(locks.is_empty());
    }
}
