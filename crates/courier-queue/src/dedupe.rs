//! Bounded-interval deduplication.
//!
//! Fingerprints live in one of two Redis hashes keyed by the start of their
//! time window; looking up checks the current window and the previous one,
//! so entries age out on their own as the windows rotate. Used with a short
//! window for inbound receive dedup and a 24 hour window for the
//! `sent:{msg_id}` markers that prevent double-sends after a requeue.

use std::time::Duration;

use chrono::Utc;
use redis::aio::ConnectionManager;

use crate::Result;

/// Check-and-set in one round trip: returns the prior value when any writer
/// got there first, records ours otherwise. Both buckets are consulted
/// before the write so rotation cannot admit a duplicate.
const RECORD_IF_ABSENT_SCRIPT: &str = r#"
local prior = redis.call("HGET", KEYS[1], ARGV[1])
if prior then
  return prior
end
prior = redis.call("HGET", KEYS[2], ARGV[1])
if prior then
  return prior
end
redis.call("HSET", KEYS[1], ARGV[1], ARGV[2])
redis.call("EXPIRE", KEYS[1], ARGV[3])
return false
"#;

pub struct Deduper {
    conn: ConnectionManager,
    prefix: String,
    window_secs: i64,
}

impl Deduper {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, window: Duration) -> Self {
        Deduper {
            conn,
            prefix: prefix.into(),
            window_secs: window.as_secs().max(1) as i64,
        }
    }

    /// Returns the previously recorded value for this key, if any writer got
    /// there first within the dedupe window.
    pub async fn seen(&self, key: &str) -> Result<Option<String>> {
        let (current, previous) = self.bucket_keys(Utc::now().timestamp());
        let mut conn = self.conn.clone();

        let found: Option<String> = redis::cmd("HGET")
            .arg(&current)
            .arg(key)
            .query_async(&mut conn)
            .await?;
        if found.is_some() {
            return Ok(found);
        }

        let found: Option<String> = redis::cmd("HGET")
            .arg(&previous)
            .arg(key)
            .query_async(&mut conn)
            .await?;
        Ok(found)
    }

    /// Atomically records `key` → `value` unless some writer got there
    /// first within the window, in which case the prior value is returned
    /// and nothing is written. Two concurrent callers with the same key are
    /// serialized by the script: exactly one sees `None`.
    pub async fn record_if_absent(&self, key: &str, value: &str) -> Result<Option<String>> {
        let (current, previous) = self.bucket_keys(Utc::now().timestamp());
        let mut conn = self.conn.clone();

        let prior: Option<String> = redis::Script::new(RECORD_IF_ABSENT_SCRIPT)
            .key(&current)
            .key(&previous)
            .arg(key)
            .arg(value)
            .arg(self.window_secs * 2)
            .invoke_async(&mut conn)
            .await?;
        Ok(prior)
    }

    /// Records a key → value mapping in the current window.
    pub async fn record(&self, key: &str, value: &str) -> Result<()> {
        let (current, _) = self.bucket_keys(Utc::now().timestamp());
        let mut conn = self.conn.clone();

        redis::pipe()
            .hset(&current, key, value)
            .ignore()
            .expire(&current, self.window_secs * 2)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    fn bucket_keys(&self, now: i64) -> (String, String) {
        let current_start = now - now.rem_euclid(self.window_secs);
        let previous_start = current_start - self.window_secs;
        (
            format!("{}:{}", self.prefix, current_start),
            format!("{}:{}", self.prefix, previous_start),
        )
    }
}
