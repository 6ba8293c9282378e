use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tokio::time::Instant;

/// The store of nonces the server has issued and not yet expired.
///
/// Membership plus a fresh expiry instant is what makes a digest
/// response acceptable; a swept or never-issued nonce fails as stale.
pub struct NonceStore {
    nonces: RwLock<HashMap<String, Instant>>,
    ttl: Duration,
}

impl NonceStore {
    pub fn new(ttl: Duration) -> Self {
        Self {
            nonces: RwLock::new(HashMap::new()),
            ttl,
        }
    }

    /// Records a freshly issued nonce with absolute expiry `now + ttl`.
    pub fn store(&self, nonce: &str) {
        let expiry = Instant::now() + self.ttl;
        let mut nonces = self.nonces.write().expect("Lock failed");
        nonces.insert(nonce.to_string(), expiry);
    }

    /// Returns `true` iff the nonce is present and not expired.
    pub fn valid(&self, nonce: &str) -> bool {
        let nonces = self.nonces.read().expect("Lock failed");
        match nonces.get(nonce) {
            Some(expiry) => Instant::now() < *expiry,
            None => false,
        }
    }

    /// Removes every expired entry.
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut nonces = self.nonces.write().expect("Lock failed");
        nonces.retain(|_, expiry| now < *expiry);
    }

    /// Number of live entries, expired included until the next sweep.
    pub fn len(&self) -> usize {
        self.nonces.read().expect("Lock failed").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Spawns the background cleaner running on a fixed cadence.
    pub fn start_sweeper(self: &Arc<Self>, interval: Duration) {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                store.sweep();
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    const TTL: Duration = Duration::from_secs(300);

    #[tokio::test(start_paused = true)]
    async fn test_valid_until_expiry() {
        let store = NonceStore::new(TTL);
        store.store("abc");

        assert!(store.valid("abc"));

        time::sleep(TTL - Duration::from_secs(1)).await;
        assert!(store.valid("abc"));

        time::sleep(Duration::from_secs(2)).await;
        assert!(!store.valid("abc"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_never_becomes_valid_again() {
        let store = NonceStore::new(TTL);
        store.store("abc");

        time::sleep(TTL + Duration::from_secs(1)).await;
        assert!(!store.valid("abc"));

        time::sleep(Duration::from_secs(600)).await;
        assert!(!store.valid("abc"));
    }

    #[tokio::test]
    async fn test_unknown_nonce_is_invalid() {
        let store = NonceStore::new(TTL);
        assert!(!store.valid("never-issued"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_only_expired() {
        let store = NonceStore::new(TTL);
        store.store("old");

        time::sleep(TTL / 2).await;
        store.store("young");

        time::sleep(TTL / 2 + Duration::from_secs(1)).await;
        store.sweep();

        assert_eq!(store.len(), 1);
        assert!(store.valid("young"));
        assert!(!store.valid("old"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_sweeper() {
        let store = Arc::new(NonceStore::new(Duration::from_secs(10)));
        store.start_sweeper(Duration::from_secs(60));

        store.store("abc");
        assert_eq!(store.len(), 1);

        time::sleep(Duration::from_secs(61)).await;
        assert_eq!(store.len(), 0);
    }
}
