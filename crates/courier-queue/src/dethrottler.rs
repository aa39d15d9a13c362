//! The dethrottler.
//!
//! A singleton loop per process. Each second it restores every token that
//! was throttled in the previous second back into the active set with an
//! in-flight score of zero, which is what turns the hard second-boundary
//! rate limit into smooth throughput without busy-looping in pop.

use std::time::Duration;

use parking_lot::Mutex;
use redis::aio::ConnectionManager;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info};

use crate::queue::PriorityQueue;

/// Moves all throttled tokens back to active (score 0) and clears their
/// wake-up entries.
pub(crate) const DETHROTTLE_SCRIPT: &str = r#"
local throttled, active, future = KEYS[1], KEYS[2], KEYS[3]
local tokens = redis.call("ZRANGE", throttled, 0, -1)
for i = 1, #tokens do
  redis.call("ZREM", throttled, tokens[i])
  redis.call("ZADD", active, 0, tokens[i])
  redis.call("ZREM", future, tokens[i])
end
return #tokens
"#;

pub struct Dethrottler {
    quit_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Dethrottler {
    /// Starts the dethrottle loop for one queue type.
    pub fn start(conn: ConnectionManager, queue_type: impl Into<String>) -> Self {
        let queue_type = queue_type.into();
        let (quit_tx, mut quit_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            info!(queue_type = %queue_type, "dethrottler started");
            let queue = PriorityQueue::new(conn, queue_type.clone());
            let mut tick = tokio::time::interval(Duration::from_secs(1));
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match queue.dethrottle().await {
                            Ok(restored) if restored > 0 => {
                                debug!(queue_type = %queue_type, restored = restored, "restored throttled channels");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(queue_type = %queue_type, error = %e, "dethrottle pass failed");
                            }
                        }
                    }
                    _ = &mut quit_rx => {
                        info!(queue_type = %queue_type, "dethrottler stopped");
                        break;
                    }
                }
            }
        });

        Dethrottler {
            quit_tx: Mutex::new(Some(quit_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Stops the loop and waits for it to exit.
    pub async fn stop(&self) {
        let quit_tx = self.quit_tx.lock().take();
        if let Some(quit_tx) = quit_tx {
            let _ = quit_tx.send(());
        }
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
