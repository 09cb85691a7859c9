use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::time::Instant;

/// A stored value: string, field/value hash, or member set.
#[derive(Debug, Clone)]
enum Value {
    Str(String),
    Hash(HashMap<String, String>),
    Set(HashSet<String>),
}

#[derive(Debug, Clone)]
struct Entry {
    value: Value,
    /// `None` means the key never expires.
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        matches!(self.expires_at, Some(at) if at <= now)
    }
}

/// In-process TTL key-value store backing the tunnel registry.
///
/// Supports concurrent readers from any number of tasks; expiry is lazy,
/// applied when a key is read or refreshed. Cloning is cheap (shared state).
///
/// Multi-key writes issued through the registry are sequential, not
/// transactional: a caller dying mid-sequence leaves a partial write behind.
/// Expiry is the fallback that eventually clears such remnants.
#[derive(Debug, Clone, Default)]
pub struct TtlStore {
    entries: Arc<DashMap<String, Entry>>,
}

impl TtlStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn insert(&self, key: &str, value: Value, ttl: Option<Duration>) {
        let entry = Entry {
            value,
            expires_at: ttl.map(|t| Instant::now() + t),
        };
        self.entries.insert(key.to_string(), entry);
    }

    /// Read a live entry's value, dropping it if the TTL has lapsed.
    fn live_value(&self, key: &str) -> Option<Value> {
        let now = Instant::now();
        {
            let entry = self.entries.get(key)?;
            if !entry.is_expired(now) {
                return Some(entry.value.clone());
            }
        }
        self.entries.remove(key);
        None
    }

    pub fn put_string(&self, key: &str, value: &str, ttl: Option<Duration>) {
        self.insert(key, Value::Str(value.to_string()), ttl);
    }

    pub fn get_string(&self, key: &str) -> Option<String> {
        match self.live_value(key)? {
            Value::Str(s) => Some(s),
            _ => None,
        }
    }

    pub fn put_hash(&self, key: &str, fields: HashMap<String, String>, ttl: Option<Duration>) {
        self.insert(key, Value::Hash(fields), ttl);
    }

    pub fn get_hash(&self, key: &str) -> Option<HashMap<String, String>> {
        match self.live_value(key)? {
            Value::Hash(h) => Some(h),
            _ => None,
        }
    }

    pub fn set_add(&self, key: &str, member: &str) {
        let mut entry = self.entries.entry(key.to_string()).or_insert_with(|| Entry {
            value: Value::Set(HashSet::new()),
            expires_at: None,
        });
        if let Value::Set(ref mut members) = entry.value {
            members.insert(member.to_string());
        }
    }

    pub fn set_remove(&self, key: &str, member: &str) {
        if let Some(mut entry) = self.entries.get_mut(key) {
            if let Value::Set(ref mut members) = entry.value {
                members.remove(member);
            }
        }
    }

    pub fn set_len(&self, key: &str) -> usize {
        match self.live_value(key) {
            Some(Value::Set(members)) => members.len(),
            _ => 0,
        }
    }

    /// Push a key's expiry `ttl` into the future without touching its value.
    /// Returns `false` if the key is missing or already expired.
    pub fn expire(&self, key: &str, ttl: Duration) -> bool {
        let now = Instant::now();
        match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired(now) => {
                entry.expires_at = Some(now + ttl);
                true
            }
            _ => false,
        }
    }

    pub fn delete(&self, key: &str) {
        self.entries.remove(key);
    }
}
