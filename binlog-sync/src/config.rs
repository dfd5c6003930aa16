//! Settings of a [`Canal`](crate::canal::Canal).
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Deserializer};

use crate::cdc_types::TableSchema;
use crate::checkpoints::DEFAULT_SAVE_INTERVAL;
use crate::error::{SyncError, SyncResult};

/// Where the canal starts reading when it is started for the first time.
#[derive(Clone, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(tag = "from", rename_all = "snake_case")]
pub enum StartPosition {
    /// Ask the upstream where it currently is.
    #[default]
    Current,
    /// Resume from the last saved position, or behave like `Current`
    /// if nothing was saved yet.
    Saved,
    /// Start at an explicit position.
    At { name: String, offset: u32 },
}

#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct CanalConfig {
    /// Database name reported alongside handler failures.
    pub database: Option<String>,
    /// Minimal time between two non-forced position saves.
    #[serde(rename = "save_interval_ms", deserialize_with = "duration_from_millis")]
    pub save_interval: Duration,
    pub start_position: StartPosition,
    /// Regular expressions matched against `schema.table`.
    pub include_tables: Vec<String>,
    pub exclude_tables: Vec<String>,
}

impl Default for CanalConfig {
    fn default() -> Self {
        CanalConfig {
            database: None,
            save_interval: DEFAULT_SAVE_INTERVAL,
            start_position: StartPosition::default(),
            include_tables: vec![],
            exclude_tables: vec![],
        }
    }
}

impl CanalConfig {
    pub fn table_filter(&self) -> SyncResult<TableFilter> {
        TableFilter::new(&self.include_tables, &self.exclude_tables)
    }
}

fn duration_from_millis<'de, D>(deserializer: D) -> Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    u64::deserialize(deserializer).map(Duration::from_millis)
}

/// Decides which tables are dispatched at all.
///
/// A table matching an include pattern is always accepted. Otherwise a
/// table matching an exclude pattern is rejected, and the rest is accepted
/// only when there are no include patterns.
#[derive(Clone, Debug, Default)]
pub struct TableFilter {
    include: Vec<Regex>,
    exclude: Vec<Regex>,
}

impl TableFilter {
    pub fn new(include: &[String], exclude: &[String]) -> SyncResult<TableFilter> {
        Ok(TableFilter {
            include: compile(include)?,
            exclude: compile(exclude)?,
        })
    }

    pub fn accepts(&self, table: &TableSchema) -> bool {
        let key = table.qualified_name();

        if self.include.iter().any(|re| re.is_match(&key)) {
            return true;
        }
        if self.exclude.iter().any(|re| re.is_match(&key)) {
            return false;
        }
        self.include.is_empty()
    }
}

fn compile(patterns: &[String]) -> SyncResult<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            Regex::new(pattern).map_err(|err| {
                SyncError::InvalidConfig(format!("bad table pattern `{pattern}`: {err}"))
            })
        })
        .collect()
}
