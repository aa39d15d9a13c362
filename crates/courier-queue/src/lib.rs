//! Redis-resident queueing for Courier.
//!
//! Holds the prioritized per-channel outbound queue (all mutations are
//! server-side Lua scripts, so there is no multi-writer race), the
//! dethrottler loop that turns the hard second-boundary rate into smooth
//! throughput, and the bounded-interval deduper used to suppress duplicate
//! inbound messages and double-sends.

mod dedupe;
mod dethrottler;
mod error;
mod queue;

pub use dedupe::Deduper;
pub use dethrottler::Dethrottler;
pub use error::QueueError;
pub use queue::{ChannelToken, PopResult, PriorityQueue, QueuePriority};

pub type Result<T> = std::result::Result<T, QueueError>;
