//! Positive lookup cache used by the dialer and the DoH client.

use std::collections::HashMap;
use std::net::IpAddr;
use std::time::{Duration, Instant};

use parking_lot::RwLock;

pub const DEFAULT_LOOKUP_TTL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
struct CacheEntry {
    addrs: Vec<IpAddr>,
    cached_at: Instant,
}

/// `host -> [ip]` cache with one TTL for every entry.
///
/// Only successful lookups are stored; there is no negative caching and
/// no revalidation, entries simply age out. Concurrent `get`/`set` are
/// safe; a `get` racing a `set` may observe either value.
pub struct LookupCache {
    ttl: Duration,
    entries: RwLock<HashMap<String, CacheEntry>>,
}

impl LookupCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, host: &str) -> Option<Vec<IpAddr>> {
        let entries = self.entries.read();
        let entry = entries.get(host)?;
        if entry.cached_at.elapsed() < self.ttl {
            Some(entry.addrs.clone())
        } else {
            None
        }
    }

    pub fn set(&self, host: &str, addrs: Vec<IpAddr>) {
        if addrs.is_empty() {
            return;
        }
        self.entries.write().insert(
            host.to_string(),
            CacheEntry {
                addrs,
                cached_at: Instant::now(),
            },
        );
    }

    /// Drop entries past their TTL.
    pub fn purge_expired(&self) {
        let ttl = self.ttl;
        self.entries
            .write()
            .retain(|_, entry| entry.cached_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl Default for LookupCache {
    fn default() -> Self {
        Self::new(DEFAULT_LOOKUP_TTL)
    }
}
