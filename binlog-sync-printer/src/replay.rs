//! A binlog source replaying decoded events from a JSON lines dump.
//!
//! Every line is one event:
//!
//! ```text
//! {"type": "rows", "log_pos": 4900, "action": "insert", "schema": "shop",
//!  "table": "orders", "columns": ["id", "status"], "rows": [[1, "pending"]]}
//! {"type": "rotate", "next_name": "mysql-bin.000006", "offset": 4}
//! ```
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use binlog_sync::cdc_types::{Action, BinlogEvent, Row, RowsEvent, TableSchema, Value};
use binlog_sync::checkpoints::Position;
use binlog_sync::upstream::{BinlogSource, BinlogSubscription};
use serde::Deserialize;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader, Lines};
use tracing::debug;

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ReplayRecord {
    Rows {
        log_pos: u32,
        action: Action,
        #[serde(default)]
        schema: String,
        table: String,
        #[serde(default)]
        columns: Vec<String>,
        rows: Vec<Row>,
    },
    Rotate {
        next_name: String,
        offset: u32,
    },
}

pub struct ReplaySource {
    path: PathBuf,
    // What the dump starts with; reported as the current upstream status.
    start_name: String,
    start_offset: u32,
}

impl ReplaySource {
    pub fn new(path: impl Into<PathBuf>, start_name: String, start_offset: u32) -> ReplaySource {
        ReplaySource {
            path: path.into(),
            start_name,
            start_offset,
        }
    }
}

#[async_trait]
impl BinlogSource for ReplaySource {
    async fn master_status(&self) -> anyhow::Result<Vec<Row>> {
        Ok(vec![vec![
            Value::Text(self.start_name.clone()),
            Value::UInt(self.start_offset as u64),
        ]])
    }

    async fn subscribe(&self, from: &Position) -> anyhow::Result<Box<dyn BinlogSubscription>> {
        let file = File::open(&self.path)
            .await
            .with_context(|| format!("opening {}", self.path.display()))?;

        Ok(Box::new(ReplaySubscription {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            current_name: self.start_name.clone(),
            from: from.clone(),
            tables: HashMap::new(),
        }))
    }
}

struct ReplaySubscription {
    lines: Lines<BufReader<File>>,
    line_no: usize,
    current_name: String,
    from: Position,
    // Events of the same table share one schema.
    tables: HashMap<(String, String), Arc<TableSchema>>,
}

impl ReplaySubscription {
    // Binlog file names sort in the order they were written.
    fn already_consumed(&self, log_pos: u32) -> bool {
        match self.current_name.cmp(&self.from.name) {
            std::cmp::Ordering::Less => true,
            std::cmp::Ordering::Equal => log_pos <= self.from.offset,
            std::cmp::Ordering::Greater => false,
        }
    }

    fn table(&mut self, schema: String, name: String, columns: Vec<String>) -> Arc<TableSchema> {
        self.tables
            .entry((schema.clone(), name.clone()))
            .or_insert_with(|| Arc::new(TableSchema::new(schema, name).with_columns(columns)))
            .clone()
    }
}

#[async_trait]
impl BinlogSubscription for ReplaySubscription {
    async fn next_event(&mut self) -> anyhow::Result<Option<BinlogEvent>> {
        while let Some(line) = self.lines.next_line().await? {
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }

            let record: ReplayRecord = serde_json::from_str(&line)
                .with_context(|| format!("line {}: invalid replay record", self.line_no))?;

            match record {
                ReplayRecord::Rotate { next_name, offset } => {
                    self.current_name = next_name.clone();
                    if self.current_name < self.from.name {
                        continue;
                    }
                    return Ok(Some(BinlogEvent::Rotate { next_name, offset }));
                }
                ReplayRecord::Rows {
                    log_pos,
                    action,
                    schema,
                    table,
                    columns,
                    rows,
                } => {
                    if self.already_consumed(log_pos) {
                        debug!(
                            name = %self.current_name,
                            log_pos,
                            "Skipping already consumed event"
                        );
                        continue;
                    }
                    let table = self.table(schema, table, columns);
                    let event = RowsEvent::new(action, table, rows)
                        .with_context(|| format!("line {}", self.line_no))?;
                    return Ok(Some(BinlogEvent::Rows { event, log_pos }));
                }
            }
        }

        Ok(None)
    }
}
