//! Crash-safe snapshot files, one per model.
//!
//! A snapshot is written to a temp file in the same directory, synced, and
//! renamed over `<name>.json`, so a reader sees either the old file or the new
//! one, never a torn write.  Every file carries a schema tag and version;
//! unknown versions are refused rather than migrated by guesswork.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{debug, info, warn};

use crate::error::{EngineError, Result};

pub const SNAPSHOT_SCHEMA: &str = "matchcast.snapshot";
pub const SNAPSHOT_VERSION: u32 = 1;

static TEMP_COUNTER: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Serialize, Deserialize)]
struct Envelope<T> {
    schema: String,
    version: u32,
    name: String,
    saved_at: DateTime<Utc>,
    state: T,
}

/// Why a load produced no usable state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FreshReason {
    Missing,
    Corrupt(String),
    UnsupportedVersion(u32),
    WrongName(String),
}

#[derive(Debug)]
pub enum LoadOutcome<T> {
    Restored { state: T, saved_at: DateTime<Utc> },
    Fresh(FreshReason),
}

#[derive(Debug, Clone)]
pub struct SnapshotStore {
    dir: PathBuf,
}

impl SnapshotStore {
    /// Open (or create) the snapshot directory.
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(SnapshotStore { dir })
    }

    pub fn path_for(&self, name: &str) -> PathBuf {
        self.dir.join(format!("{}.json", name))
    }

    /// Atomically replace the snapshot for `name`.
    pub fn save<T: Serialize>(&self, name: &str, state: &T) -> Result<DateTime<Utc>> {
        let saved_at = Utc::now();
        let envelope = Envelope {
            schema: SNAPSHOT_SCHEMA.to_string(),
            version: SNAPSHOT_VERSION,
            name: name.to_string(),
            saved_at,
            state,
        };
        let bytes = serde_json::to_vec_pretty(&envelope)?;

        let target = self.path_for(name);
        let temp = self.dir.join(format!(
            ".{}.{}.{}.tmp",
            name,
            std::process::id(),
            TEMP_COUNTER.fetch_add(1, Ordering::Relaxed)
        ));

        let written = (|| -> Result<()> {
            let mut file = fs::File::create(&temp)?;
            file.write_all(&bytes)?;
            file.flush()?;
            file.sync_all()?;
            fs::rename(&temp, &target)?;
            Ok(())
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        sync_dir(&self.dir);
        debug!("Saved snapshot '{}' ({} bytes)", name, bytes.len());
        Ok(saved_at)
    }

    /// Load the snapshot for `name`.  Anything unusable yields `Fresh` and a
    /// warning; the caller starts from initial state.
    pub fn load<T: DeserializeOwned>(&self, name: &str) -> LoadOutcome<T> {
        let path = self.path_for(name);
        let outcome = self.read(name, &path);
        match &outcome {
            LoadOutcome::Restored { saved_at, .. } => {
                info!("Restored '{}' from {} (saved {})", name, path.display(), saved_at)
            }
            LoadOutcome::Fresh(FreshReason::Missing) => {
                info!("No snapshot for '{}', starting fresh", name)
            }
            LoadOutcome::Fresh(reason) => {
                let err = EngineError::corrupt(name, format!("{:?}", reason));
                warn!("{}, starting fresh", err)
            }
        }
        outcome
    }

    fn read<T: DeserializeOwned>(&self, name: &str, path: &Path) -> LoadOutcome<T> {
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return LoadOutcome::Fresh(FreshReason::Missing)
            }
            Err(e) => return LoadOutcome::Fresh(FreshReason::Corrupt(e.to_string())),
        };

        // Inspect the header before committing to a state layout.
        let raw: serde_json::Value = match serde_json::from_slice(&bytes) {
            Ok(v) => v,
            Err(e) => return LoadOutcome::Fresh(FreshReason::Corrupt(e.to_string())),
        };
        if raw["schema"].as_str() != Some(SNAPSHOT_SCHEMA) {
            return LoadOutcome::Fresh(FreshReason::Corrupt("missing schema tag".into()));
        }
        let version = match raw["version"].as_u64().map(u32::try_from) {
            Some(Ok(v)) => v,
            _ => {
                return LoadOutcome::Fresh(FreshReason::Corrupt(format!(
                    "unreadable snapshot version {}",
                    raw["version"]
                )))
            }
        };

        match version {
            SNAPSHOT_VERSION => match serde_json::from_value::<Envelope<T>>(raw) {
                Ok(env) if env.name == name => LoadOutcome::Restored {
                    state: env.state,
                    saved_at: env.saved_at,
                },
                Ok(env) => LoadOutcome::Fresh(FreshReason::WrongName(env.name)),
                Err(e) => LoadOutcome::Fresh(FreshReason::Corrupt(e.to_string())),
            },
            other => LoadOutcome::Fresh(FreshReason::UnsupportedVersion(other)),
        }
    }
}

/// Persist the rename itself.  Not every platform allows syncing a
/// directory handle, so failures are only logged.
fn sync_dir(dir: &Path) {
    #[cfg(unix)]
    {
        if let Err(e) = fs::File::open(dir).and_then(|d| d.sync_all()) {
            debug!("Directory sync for {} failed: {}", dir.display(), e);
        }
    }
    #[cfg(not(unix))]
    let _ = dir;
}
