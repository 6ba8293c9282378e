//! User records and the store the authenticator reads them from.

use std::collections::HashMap;
use std::sync::RwLock;

/// A provisioned user.
///
/// The HA1 hash is computed once at provisioning; plaintext passwords are
/// never stored or recomputed at verification time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserRecord {
    pub username: String,
    pub realm: String,
    /// MD5(username:realm:password), lowercase hex.
    pub ha1: String,
    pub enabled: bool,
}

/// Read access to provisioned users.
pub trait UserStore: Send + Sync + 'static {
    /// Looks up a user by name within a realm.
    fn lookup(&self, username: &str, realm: &str) -> Option<UserRecord>;
}

/// An in-memory [`UserStore`].
#[derive(Default)]
pub struct MemoryUserStore {
    users: RwLock<HashMap<(String, String), UserRecord>>,
}

impl MemoryUserStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Provisions a user, computing and storing its HA1.
    pub fn add_user(&self, username: &str, realm: &str, password: &str) {
        let ha1 = format!("{:x}", md5::compute(format!("{username}:{realm}:{password}")));
        let record = UserRecord {
            username: username.to_string(),
            realm: realm.to_string(),
            ha1,
            enabled: true,
        };

        let mut users = self.users.write().expect("Lock failed");
        users.insert((username.to_string(), realm.to_string()), record);
    }

    /// Enables or disables an existing user.
    pub fn set_enabled(&self, username: &str, realm: &str, enabled: bool) {
        let mut users = self.users.write().expect("Lock failed");
        if let Some(record) = users.get_mut(&(username.to_string(), realm.to_string())) {
            record.enabled = enabled;
        }
    }
}

impl UserStore for MemoryUserStore {
    fn lookup(&self, username: &str, realm: &str) -> Option<UserRecord> {
        let users = self.users.read().expect("Lock failed");
        users.get(&(username.to_string(), realm.to_string())).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ha1_is_computed_at_provisioning() {
        let store = MemoryUserStore::new();
        store.add_user("alice", "example.com", "secret123");

        let record = store.lookup("alice", "example.com").unwrap();
        let expected = format!("{:x}", md5::compute("alice:example.com:secret123"));

        assert_eq!(record.ha1, expected);
        assert!(record.enabled);
    }

    #[test]
    fn test_lookup_is_scoped_by_realm() {
        let store = MemoryUserStore::new();
        store.add_user("alice", "example.com", "secret123");

        assert!(store.lookup("alice", "other.org").is_none());
    }

    #[test]
    fn test_disable_user() {
        let store = MemoryUserStore::new();
        store.add_user("alice", "example.com", "secret123");
        store.set_enabled("alice", "example.com", false);

        assert!(!store.lookup("alice", "example.com").unwrap().enabled);
    }
}
