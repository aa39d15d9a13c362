//! Channel cache.
//!
//! Channels are read-mostly: cached for a short TTL, with deleted or
//! unknown channels cached as tombstones for the same TTL so a storm of
//! webhooks for a removed channel does not hammer the backend.

use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use uuid::Uuid;

use courier_backend::{Backend, Result};
use courier_common::Channel;

struct CacheEntry {
    /// `None` is a tombstone for a deleted or unknown channel.
    channel: Option<Arc<Channel>>,
    fetched_at: Instant,
}

pub struct ChannelCache {
    entries: DashMap<Uuid, CacheEntry>,
    ttl: Duration,
}

impl ChannelCache {
    pub fn new(ttl: Duration) -> Self {
        ChannelCache {
            entries: DashMap::new(),
            ttl,
        }
    }

    /// Looks up a channel, consulting the backend on miss or expiry.
    pub async fn get(&self, backend: &dyn Backend, uuid: Uuid) -> Result<Option<Arc<Channel>>> {
        if let Some(entry) = self.entries.get(&uuid) {
            if entry.fetched_at.elapsed() < self.ttl {
                return Ok(entry.channel.clone());
            }
        }

        let channel = backend.channel(uuid).await?.map(Arc::new);
        self.entries.insert(
            uuid,
            CacheEntry {
                channel: channel.clone(),
                fetched_at: Instant::now(),
            },
        );
        Ok(channel)
    }

    /// Drops a cached entry, forcing the next lookup through the backend.
    pub fn invalidate(&self, uuid: Uuid) {
        self.entries.remove(&uuid);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
