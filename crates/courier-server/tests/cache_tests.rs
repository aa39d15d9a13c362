//! Channel Cache Tests
//!
//! Tests for:
//! - TTL-bounded caching of live channels
//! - Tombstones for deleted channels
//! - Invalidation forcing a backend round trip

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use uuid::Uuid;

use courier_backend::{Backend, Result as BackendResult};
use courier_common::{
    Channel, ChannelEvent, ChannelLog, ChannelType, MsgId, MsgIn, StatusUpdate,
};
use courier_server::ChannelCache;

struct CountingBackend {
    channel: Mutex<Option<Channel>>,
    lookups: AtomicU32,
}

impl CountingBackend {
    fn new(channel: Option<Channel>) -> Arc<Self> {
        Arc::new(CountingBackend {
            channel: Mutex::new(channel),
            lookups: AtomicU32::new(0),
        })
    }

    fn lookups(&self) -> u32 {
        self.lookups.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Backend for CountingBackend {
    async fn channel(&self, _uuid: Uuid) -> BackendResult<Option<Channel>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.channel.lock().clone())
    }

    async fn write_msg(&self, _msg: &mut MsgIn) -> BackendResult<()> {
        Ok(())
    }

    async fn write_status(&self, _update: StatusUpdate) -> BackendResult<()> {
        Ok(())
    }

    async fn write_event(&self, _event: &mut ChannelEvent) -> BackendResult<()> {
        Ok(())
    }

    async fn write_channel_log(&self, _clog: ChannelLog) -> BackendResult<()> {
        Ok(())
    }

    async fn msg_was_sent(&self, _id: MsgId) -> BackendResult<bool> {
        Ok(false)
    }

    async fn mark_msg_sent(&self, _id: MsgId, _external_id: Option<&str>) -> BackendResult<()> {
        Ok(())
    }

    async fn health(&self) -> BackendResult<()> {
        Ok(())
    }
}

fn test_channel(uuid: Uuid) -> Channel {
    Channel {
        uuid,
        channel_type: ChannelType::new("MK"),
        address: "2020".to_string(),
        country: None,
        schemes: vec!["tel".to_string()],
        config: serde_json::Map::new(),
        org_id: 1,
        callback_domain: None,
    }
}

#[tokio::test]
async fn test_fresh_entries_skip_backend() {
    let uuid = Uuid::new_v4();
    let backend = CountingBackend::new(Some(test_channel(uuid)));
    let cache = ChannelCache::new(Duration::from_secs(60));

    for _ in 0..5 {
        let channel = cache.get(backend.as_ref(), uuid).await.unwrap();
        assert!(channel.is_some());
    }
    assert_eq!(backend.lookups(), 1);
}

#[tokio::test]
async fn test_expired_entries_refetch() {
    let uuid = Uuid::new_v4();
    let backend = CountingBackend::new(Some(test_channel(uuid)));
    let cache = ChannelCache::new(Duration::from_millis(50));

    cache.get(backend.as_ref(), uuid).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    cache.get(backend.as_ref(), uuid).await.unwrap();

    assert_eq!(backend.lookups(), 2);
}

#[tokio::test]
async fn test_deleted_channels_are_tombstoned() {
    let uuid = Uuid::new_v4();
    let backend = CountingBackend::new(None);
    let cache = ChannelCache::new(Duration::from_secs(60));

    // repeated lookups for a deleted channel hit the backend once
    for _ in 0..5 {
        let channel = cache.get(backend.as_ref(), uuid).await.unwrap();
        assert!(channel.is_none());
    }
    assert_eq!(backend.lookups(), 1);
}

#[tokio::test]
async fn test_invalidate_forces_lookup() {
    let uuid = Uuid::new_v4();
    let backend = CountingBackend::new(Some(test_channel(uuid)));
    let cache = ChannelCache::new(Duration::from_secs(60));

    cache.get(backend.as_ref(), uuid).await.unwrap();
    cache.invalidate(uuid);
    cache.get(backend.as_ref(), uuid).await.unwrap();

    assert_eq!(backend.lookups(), 2);
}
