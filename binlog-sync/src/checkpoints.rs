//! A module representing the logic behind saving progress.
use std::fmt;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::cdc_types::Row;
use crate::error::{SyncError, SyncResult};
use crate::upstream::BinlogSource;

/// Default debounce window of [`PositionStore::save`].
pub const DEFAULT_SAVE_INTERVAL: Duration = Duration::from_secs(1);

/// Cursor into the upstream log.
#[non_exhaustive]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Position {
    pub name: String,
    pub offset: u32,
    /// When the position was last written to durable storage.
    pub last_persisted_at: Option<DateTime<Utc>>,
}

impl Position {
    pub fn new(name: impl Into<String>, offset: u32) -> Position {
        Position {
            name: name.into(),
            offset,
            last_persisted_at: None,
        }
    }
}

impl fmt::Display for Position {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.offset)
    }
}

/// The record written by a [`PositionSaver`].
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PersistedPosition {
    pub name: String,
    pub position: u32,
}

impl From<&Position> for PersistedPosition {
    fn from(position: &Position) -> Self {
        PersistedPosition {
            name: position.name.clone(),
            position: position.offset,
        }
    }
}

impl From<PersistedPosition> for Position {
    fn from(record: PersistedPosition) -> Self {
        Position::new(record.name, record.position)
    }
}

/// Customizable trait responsible for persisting the log position.
/// A save must replace the previous record atomically.
#[async_trait]
pub trait PositionSaver: Send + Sync {
    /// Saves given position, replacing the previous one.
    async fn save_position(&self, position: &PersistedPosition) -> anyhow::Result<()>;
    /// Loads the last saved position or `None`.
    async fn load_position(&self) -> anyhow::Result<Option<PersistedPosition>>;
    /// Where the records end up, if that is a file.
    fn location(&self) -> Option<&Path> {
        None
    }
}

/// Default implementation for [`PositionSaver`] trait.
/// Keeps the position as a small JSON document.
/// A save writes `<path>.tmp`, syncs it and renames it over `<path>`,
/// so a crash never leaves a partial record behind.
pub struct FilePositionSaver {
    path: PathBuf,
}

impl FilePositionSaver {
    pub fn new(path: impl Into<PathBuf>) -> FilePositionSaver {
        FilePositionSaver { path: path.into() }
    }

    fn tmp_path(&self) -> PathBuf {
        let mut tmp = self.path.clone().into_os_string();
        tmp.push(".tmp");
        PathBuf::from(tmp)
    }
}

#[async_trait]
impl PositionSaver for FilePositionSaver {
    async fn save_position(&self, position: &PersistedPosition) -> anyhow::Result<()> {
        let data = serde_json::to_vec_pretty(position)?;

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }

        let tmp_path = self.tmp_path();
        {
            let mut file = tokio::fs::File::create(&tmp_path)
                .await
                .with_context(|| format!("creating {}", tmp_path.display()))?;
            file.write_all(&data).await?;
            file.sync_all().await?;
        }
        tokio::fs::rename(&tmp_path, &self.path)
            .await
            .with_context(|| {
                format!("renaming {} to {}", tmp_path.display(), self.path.display())
            })?;

        Ok(())
    }

    async fn load_position(&self) -> anyhow::Result<Option<PersistedPosition>> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(err).with_context(|| format!("reading {}", self.path.display()))
            }
        };

        let position = serde_json::from_slice(&data)
            .with_context(|| format!("parsing {}", self.path.display()))?;
        Ok(Some(position))
    }

    fn location(&self) -> Option<&Path> {
        Some(&self.path)
    }
}

/// Holds the current log cursor and persists it through a [`PositionSaver`]
/// without turning every event into a write.
pub struct PositionStore {
    position: RwLock<Position>,
    // Also serializes concurrent saves.
    last_save: Mutex<Option<Instant>>,
    save_interval: Duration,
    saver: Arc<dyn PositionSaver>,
}

impl PositionStore {
    pub fn new(
        position: Position,
        saver: Arc<dyn PositionSaver>,
        save_interval: Duration,
    ) -> PositionStore {
        PositionStore {
            position: RwLock::new(position),
            last_save: Mutex::new(None),
            save_interval,
            saver,
        }
    }

    /// Creates a store positioned where the upstream currently is.
    pub async fn load(
        source: &dyn BinlogSource,
        saver: Arc<dyn PositionSaver>,
        save_interval: Duration,
    ) -> SyncResult<PositionStore> {
        let rows = source.master_status().await.map_err(|err| {
            SyncError::DataUnavailable(format!("failed to query master status: {err:#}"))
        })?;
        let position = position_from_status(&rows)?;

        Ok(PositionStore::new(position, saver, save_interval))
    }

    /// Creates a store from the last persisted record, if there is one.
    pub async fn resume(
        saver: Arc<dyn PositionSaver>,
        save_interval: Duration,
    ) -> SyncResult<Option<PositionStore>> {
        let record = saver.load_position().await.map_err(|err| {
            SyncError::DataUnavailable(format!("failed to load saved position: {err:#}"))
        })?;

        Ok(record.map(|record| PositionStore::new(record.into(), saver, save_interval)))
    }

    /// Moves the cursor. Does not persist anything.
    /// Within one log file the offset never goes back; a smaller offset
    /// for the current file is ignored.
    pub async fn update(&self, name: &str, offset: u32) {
        let mut position = self.position.write().await;
        if position.name == name && offset < position.offset {
            warn!(
                name,
                current = position.offset,
                offset,
                "Ignoring log position that goes backwards"
            );
            return;
        }
        if position.name != name {
            position.name = name.to_string();
        }
        position.offset = offset;
    }

    /// Moves the offset within the current log file.
    pub async fn advance(&self, offset: u32) {
        let mut position = self.position.write().await;
        if offset < position.offset {
            warn!(
                name = %position.name,
                current = position.offset,
                offset,
                "Ignoring log position that goes backwards"
            );
            return;
        }
        position.offset = offset;
    }

    /// Returns a consistent copy of the current position.
    pub async fn snapshot(&self) -> Position {
        self.position.read().await.clone()
    }

    /// Persists the current position.
    /// Unless `force` is set, this is a no-op when the previous successful
    /// save happened less than the save interval ago.
    /// A failed save leaves the in-memory position untouched, the next
    /// eligible call writes the latest one.
    pub async fn save(&self, force: bool) -> SyncResult<()> {
        let mut last_save = self.last_save.lock().await;
        let now = Instant::now();

        if !force {
            if let Some(last) = *last_save {
                if now.duration_since(last) < self.save_interval {
                    return Ok(());
                }
            }
        }

        let record = PersistedPosition::from(&self.snapshot().await);
        self.saver
            .save_position(&record)
            .await
            .map_err(|source| SyncError::PersistFailure {
                name: record.name.clone(),
                position: record.position,
                path: self.saver.location().map(Path::to_path_buf),
                source,
            })?;

        *last_save = Some(now);
        self.position.write().await.last_persisted_at = Some(Utc::now());
        debug!(name = %record.name, position = record.position, force, "Saved log position");

        Ok(())
    }

    /// Forces a final save.
    pub async fn close(&self) -> SyncResult<()> {
        self.save(true).await
    }
}

/// Reads the log file name and offset from the first row of a status result.
pub fn position_from_status(rows: &[Row]) -> SyncResult<Position> {
    let row = rows.first().ok_or_else(|| {
        SyncError::DataUnavailable("master status returned no rows".to_string())
    })?;

    let name = row
        .first()
        .and_then(|value| value.as_text())
        .filter(|name| !name.is_empty())
        .ok_or_else(|| {
            SyncError::DataUnavailable(
                "failed to fetch first row with 1st column (log file name)".to_string(),
            )
        })?;

    let offset = row.get(1).and_then(|value| value.as_u32()).ok_or_else(|| {
        SyncError::DataUnavailable(
            "failed to fetch first row with 2nd column (log offset)".to_string(),
        )
    })?;

    Ok(Position::new(name, offset))
}
