//! On-disk durable write-behind.
//!
//! When a backend write has exhausted its retries the item is parked here as
//! one JSON file per item, published with a tmp-write-then-rename so readers
//! never see a partial file. A background walker replays everything on
//! startup and on a timer, unlinking each file once the backend accepts it.
//! The steady-state expectation is that the spool directory is empty.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Error, Debug)]
pub enum SpoolError {
    #[error("spool io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("replay rejected: {0}")]
    Replay(String),
}

pub type Result<T> = std::result::Result<T, SpoolError>;

/// What kind of record a spool file holds, encoded in the file name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpoolKind {
    Msg,
    Status,
    Event,
    Log,
}

impl SpoolKind {
    fn prefix(&self) -> &'static str {
        match self {
            SpoolKind::Msg => "msg",
            SpoolKind::Status => "status",
            SpoolKind::Event => "event",
            SpoolKind::Log => "log",
        }
    }

    fn from_prefix(prefix: &str) -> Option<Self> {
        match prefix {
            "msg" => Some(SpoolKind::Msg),
            "status" => Some(SpoolKind::Status),
            "event" => Some(SpoolKind::Event),
            "log" => Some(SpoolKind::Log),
            _ => None,
        }
    }
}

/// Replays one spooled item into the backend. Returning an error keeps the
/// file for the next pass.
#[async_trait]
pub trait SpoolReplayer: Send + Sync {
    async fn replay(&self, kind: SpoolKind, contents: &str) -> Result<()>;
}

#[derive(Clone)]
pub struct Spool {
    dir: PathBuf,
}

impl Spool {
    /// Opens (creating if needed) the spool directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Spool { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Writes one item durably. The tmp-then-rename publish means a crash
    /// mid-write leaves only a tmp file, which the walker ignores.
    pub async fn write<T: Serialize>(&self, kind: SpoolKind, uuid: Uuid, item: &T) -> Result<()> {
        let contents = serde_json::to_vec(item)?;
        let final_path = self.dir.join(format!("{}_{}.json", kind.prefix(), uuid));
        let tmp_path = self.dir.join(format!("{}_{}.json.tmp", kind.prefix(), uuid));

        tokio::fs::write(&tmp_path, &contents).await?;
        tokio::fs::rename(&tmp_path, &final_path).await?;

        warn!(kind = kind.prefix(), %uuid, "item spooled to disk");
        Ok(())
    }

    /// Number of items currently spooled.
    pub async fn len(&self) -> Result<usize> {
        Ok(self.entries().await?.len())
    }

    pub async fn is_empty(&self) -> Result<bool> {
        Ok(self.entries().await?.is_empty())
    }

    async fn entries(&self) -> Result<Vec<(SpoolKind, PathBuf)>> {
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = dir.next_entry().await? {
            let path = entry.path();
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            if !name.ends_with(".json") {
                continue;
            }
            let Some((prefix, _)) = name.split_once('_') else {
                continue;
            };
            if let Some(kind) = SpoolKind::from_prefix(prefix) {
                entries.push((kind, path));
            }
        }
        // replay in a stable order
        entries.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(entries)
    }

    /// One replay pass over every spooled file.
    pub async fn flush(&self, replayer: &dyn SpoolReplayer) -> Result<usize> {
        let mut replayed = 0;
        for (kind, path) in self.entries().await? {
            let contents = match tokio::fs::read_to_string(&path).await {
                Ok(contents) => contents,
                Err(e) => {
                    error!(?path, error = %e, "failed reading spool file");
                    continue;
                }
            };

            match replayer.replay(kind, &contents).await {
                Ok(()) => {
                    if let Err(e) = tokio::fs::remove_file(&path).await {
                        error!(?path, error = %e, "failed unlinking replayed spool file");
                    } else {
                        replayed += 1;
                        debug!(?path, "spooled item replayed");
                    }
                }
                Err(e) => {
                    debug!(?path, error = %e, "spool replay failed, keeping file");
                }
            }
        }
        Ok(replayed)
    }
}

/// The background walker that retries the spool on startup and on a timer.
pub struct SpoolWalker {
    quit_tx: Mutex<Option<oneshot::Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl SpoolWalker {
    pub fn start(
        spool: Spool,
        replayer: std::sync::Arc<dyn SpoolReplayer>,
        interval: Duration,
    ) -> Self {
        let (quit_tx, mut quit_rx) = oneshot::channel();

        let handle = tokio::spawn(async move {
            info!(dir = ?spool.dir(), "spool walker started");
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = tick.tick() => {
                        match spool.flush(replayer.as_ref()).await {
                            Ok(replayed) if replayed > 0 => {
                                info!(replayed = replayed, "replayed spooled items");
                            }
                            Ok(_) => {}
                            Err(e) => {
                                error!(error = %e, "spool walk failed");
                            }
                        }
                    }
                    _ = &mut quit_rx => {
                        info!("spool walker stopped");
                        break;
                    }
                }
            }
        });

        SpoolWalker {
            quit_tx: Mutex::new(Some(quit_tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

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
