//! The prioritized channel queue.
//!
//! Layout per queue type `q`:
//! - `q:active`    sorted set of channel tokens scored by in-flight count
//! - `q:throttled` sorted set of tokens that hit their rate this second
//! - `q:future`    sorted set of tokens scored by the epoch second at which
//!   they become eligible again
//! - `{token}:1` / `{token}:0` the per-channel high and bulk priority lists;
//!   each entry is a JSON array of outbound messages for a single contact
//! - `rate_limit:{uuid}` / `rate_limit_bulk:{uuid}` short-TTL keys set by
//!   the backend to assert an external rate limit on a channel
//!
//! Every operation runs as one atomic Lua script. Within a channel, order is
//! strictly FIFO per priority; across channels the active set orders by
//! ascending in-flight count so under-utilized channels pass busier ones.

use std::fmt;

use chrono::Utc;
use redis::aio::ConnectionManager;
use uuid::Uuid;

use courier_common::MsgOut;

use crate::error::QueueError;
use crate::Result;

/// Queue priority: high always wins within a channel unless bulk is
/// explicitly paused, in which case high still flows.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueuePriority {
    Bulk = 0,
    High = 1,
}

impl QueuePriority {
    fn suffix(&self) -> &'static str {
        match self {
            QueuePriority::Bulk => "0",
            QueuePriority::High => "1",
        }
    }
}

/// The `{queue_type}:{channel_uuid}|{rate}` string used as the member inside
/// the queue sorted sets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelToken {
    pub queue_type: String,
    pub channel_uuid: Uuid,
    pub rate: u32,
}

impl ChannelToken {
    pub fn new(queue_type: impl Into<String>, channel_uuid: Uuid, rate: u32) -> Self {
        ChannelToken {
            queue_type: queue_type.into(),
            channel_uuid,
            rate,
        }
    }

    pub fn parse(s: &str) -> Result<Self> {
        let malformed = || QueueError::MalformedToken(s.to_string());

        let (queue_type, rest) = s.split_once(':').ok_or_else(malformed)?;
        let (uuid, rate) = rest.rsplit_once('|').ok_or_else(malformed)?;
        let channel_uuid = Uuid::parse_str(uuid).map_err(|_| malformed())?;
        let rate: u32 = rate.parse().map_err(|_| malformed())?;

        Ok(ChannelToken {
            queue_type: queue_type.to_string(),
            channel_uuid,
            rate,
        })
    }
}

impl fmt::Display for ChannelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}|{}", self.queue_type, self.channel_uuid, self.rate)
    }
}

/// Result of one pop attempt.
#[derive(Debug)]
pub enum PopResult {
    /// A payload for the channel identified by the token. The caller must
    /// call [`PriorityQueue::complete`] for the token when done, success or
    /// not, or the channel's in-flight count never drains.
    Payload { token: ChannelToken, payload: String },
    /// Work exists but nothing is eligible right now; try again immediately.
    Retry,
    /// Nothing queued anywhere.
    Empty,
}

const EMPTY_MARKER: &str = "empty";
const RETRY_MARKER: &str = "retry";

/// Push: LPUSH the payload onto the priority list and make sure the token is
/// tracked in active or future so the foreman will consider it.
const PUSH_SCRIPT: &str = r#"
local active, future = KEYS[1], KEYS[2]
local token, list, payload, defer = ARGV[1], ARGV[2], ARGV[3], ARGV[4]

redis.call("LPUSH", list, payload)

if not redis.call("ZSCORE", active, token) and not redis.call("ZSCORE", future, token) then
  if defer ~= "" then
    redis.call("ZADD", future, defer, token)
  else
    redis.call("ZADD", active, 0, token)
  end
end
return 1
"#;

/// Pop: promote due future tokens, select the least-loaded active channel,
/// honor external rate-limit keys, prefer high over bulk, and throttle the
/// channel for the rest of the second once it reaches its rate.
const POP_SCRIPT: &str = r#"
local active, future, throttled = KEYS[1], KEYS[2], KEYS[3]
local now = tonumber(ARGV[1])

-- promote tokens whose eligibility time has arrived
local due = redis.call("ZRANGEBYSCORE", future, 0, now)
for i = 1, #due do
  redis.call("ZREM", future, due[i])
  redis.call("ZADD", active, "NX", 0, due[i])
end

local result = redis.call("ZRANGE", active, 0, 0)
if #result == 0 then
  if redis.call("ZCARD", future) > 0 then
    return {"retry", ""}
  end
  return {"empty", ""}
end

local token = result[1]
local uuid, rate = string.match(token, "^[^:]+:(.+)|(%d+)$")
rate = tonumber(rate)

-- externally asserted channel-wide rate limit
local limit_ttl = redis.call("TTL", "rate_limit:" .. uuid)
if limit_ttl > 0 then
  redis.call("ZREM", active, token)
  redis.call("ZADD", future, now + limit_ttl, token)
  return {"retry", ""}
end

local payload = redis.call("RPOP", token .. ":1")
if not payload then
  if redis.call("EXISTS", "rate_limit_bulk:" .. uuid) == 0 then
    payload = redis.call("RPOP", token .. ":0")
  end
end

if not payload then
  redis.call("ZREM", active, token)
  return {"empty", ""}
end

local inflight = tonumber(redis.call("ZINCRBY", active, 1, token))
if rate > 0 and inflight >= rate then
  redis.call("ZADD", throttled, rate, token)
  redis.call("ZREM", active, token)
  redis.call("ZADD", future, now + 1, token)
end

return {token, payload}
"#;

/// Complete: give back one in-flight slot, draining the throttled count
/// first and clamping at zero.
const COMPLETE_SCRIPT: &str = r#"
local active, throttled = KEYS[1], KEYS[2]
local token = ARGV[1]

local t = redis.call("ZSCORE", throttled, token)
if t and tonumber(t) > 0 then
  redis.call("ZINCRBY", throttled, -1, token)
  return 1
end

local a = redis.call("ZSCORE", active, token)
if a and tonumber(a) > 0 then
  redis.call("ZINCRBY", active, -1, token)
end
return 0
"#;

/// Size: total queued payloads across all tracked channels, for /status.
const SIZE_SCRIPT: &str = r#"
local size = 0
for k = 1, 2 do
  local tokens = redis.call("ZRANGE", KEYS[k], 0, -1)
  for i = 1, #tokens do
    size = size + redis.call("LLEN", tokens[i] .. ":0")
    size = size + redis.call("LLEN", tokens[i] .. ":1")
  end
end
return size
"#;

pub struct PriorityQueue {
    conn: ConnectionManager,
    queue_type: String,
}

impl PriorityQueue {
    pub fn new(conn: ConnectionManager, queue_type: impl Into<String>) -> Self {
        PriorityQueue {
            conn,
            queue_type: queue_type.into(),
        }
    }

    pub fn queue_type(&self) -> &str {
        &self.queue_type
    }

    fn active_key(&self) -> String {
        format!("{}:active", self.queue_type)
    }

    fn future_key(&self) -> String {
        format!("{}:future", self.queue_type)
    }

    fn throttled_key(&self) -> String {
        format!("{}:throttled", self.queue_type)
    }

    /// Pushes a raw payload (a JSON array of outbound messages for one
    /// contact) onto a channel's priority list. `defer_until` schedules the
    /// channel's next eligibility for per-contact pacing.
    pub async fn push(
        &self,
        channel_uuid: Uuid,
        rate: u32,
        priority: QueuePriority,
        payload: &str,
        defer_until: Option<i64>,
    ) -> Result<()> {
        let token = ChannelToken::new(&self.queue_type, channel_uuid, rate);
        let list = format!("{}:{}", token, priority.suffix());
        let defer = defer_until.map(|t| t.to_string()).unwrap_or_default();

        let mut conn = self.conn.clone();
        redis::Script::new(PUSH_SCRIPT)
            .key(self.active_key())
            .key(self.future_key())
            .arg(token.to_string())
            .arg(list)
            .arg(payload)
            .arg(defer)
            .invoke_async::<i32>(&mut conn)
            .await?;
        Ok(())
    }

    /// Serializes and pushes a batch of messages for a single contact.
    pub async fn push_msgs(
        &self,
        channel_uuid: Uuid,
        rate: u32,
        priority: QueuePriority,
        msgs: &[MsgOut],
    ) -> Result<()> {
        let payload = serde_json::to_string(msgs)?;
        self.push(channel_uuid, rate, priority, &payload, None).await
    }

    /// Pops the next eligible payload, if any.
    pub async fn pop(&self) -> Result<PopResult> {
        let mut conn = self.conn.clone();
        let result: Vec<String> = redis::Script::new(POP_SCRIPT)
            .key(self.active_key())
            .key(self.future_key())
            .key(self.throttled_key())
            .arg(Utc::now().timestamp())
            .invoke_async(&mut conn)
            .await?;

        match result.first().map(String::as_str) {
            Some(EMPTY_MARKER) => Ok(PopResult::Empty),
            Some(RETRY_MARKER) => Ok(PopResult::Retry),
            Some(token) => Ok(PopResult::Payload {
                token: ChannelToken::parse(token)?,
                payload: result.get(1).cloned().unwrap_or_default(),
            }),
            None => Ok(PopResult::Empty),
        }
    }

    /// Marks one popped payload as done, releasing its in-flight slot.
    pub async fn complete(&self, token: &ChannelToken) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::Script::new(COMPLETE_SCRIPT)
            .key(self.active_key())
            .key(self.throttled_key())
            .arg(token.to_string())
            .invoke_async::<i32>(&mut conn)
            .await?;
        Ok(())
    }

    /// Total queued payload count across all channels of this queue type.
    pub async fn size(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let size: i64 = redis::Script::new(SIZE_SCRIPT)
            .key(self.active_key())
            .key(self.future_key())
            .invoke_async(&mut conn)
            .await?;
        Ok(size)
    }

    /// Asserts an external rate limit on a channel: pops for it return
    /// `Retry` until the TTL lapses.
    pub async fn rate_limit_channel(&self, channel_uuid: Uuid, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(format!("rate_limit:{channel_uuid}"))
            .arg("engaged")
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// Pauses bulk sends for a channel while high priority still flows.
    pub async fn rate_limit_bulk(&self, channel_uuid: Uuid, ttl_secs: u64) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::cmd("SET")
            .arg(format!("rate_limit_bulk:{channel_uuid}"))
            .arg("engaged")
            .arg("EX")
            .arg(ttl_secs)
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    /// One dethrottle pass: restore every throttled token to eligibility.
    /// Normally invoked only by the [`crate::Dethrottler`] singleton.
    pub async fn dethrottle(&self) -> Result<i64> {
        let mut conn = self.conn.clone();
        let restored: i64 = redis::Script::new(crate::dethrottler::DETHROTTLE_SCRIPT)
            .key(self.throttled_key())
            .key(self.active_key())
            .key(self.future_key())
            .invoke_async(&mut conn)
            .await?;
        Ok(restored)
    }
}
