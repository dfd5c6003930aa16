use std::fmt;

use async_trait::async_trait;
use binlog_sync::cdc_types::{Action, Row, TableSchema, Value};
use binlog_sync::consumer::{DispatchContext, HandlerError, RowsEventHandler};

/// Prints every change it receives to stdout.
pub struct PrinterHandler;

impl fmt::Display for PrinterHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("printer")
    }
}

#[async_trait]
impl RowsEventHandler for PrinterHandler {
    async fn handle(
        &self,
        _ctx: &DispatchContext,
        action: Action,
        table: &TableSchema,
        rows: &[Row],
    ) -> Result<(), HandlerError> {
        for line in format_change(action, table, rows) {
            println!("{line}");
        }
        Ok(())
    }

    async fn complete(&self, _ctx: &DispatchContext) -> Result<(), HandlerError> {
        println!("-- end of log file --");
        Ok(())
    }
}

/// One line per changed row; updates print the before and after images together.
pub fn format_change(action: Action, table: &TableSchema, rows: &[Row]) -> Vec<String> {
    let table_name = table.qualified_name();
    match action {
        Action::Update => rows
            .chunks(2)
            .map(|pair| match pair {
                [before, after] => format!(
                    "update {table_name}: {} -> {}",
                    format_row(table, before),
                    format_row(table, after)
                ),
                // Events with an odd row count never reach handlers.
                _ => format!("update {table_name}: {}", format_row(table, &pair[0])),
            })
            .collect(),
        _ => rows
            .iter()
            .map(|row| format!("{action} {table_name}: {}", format_row(table, row)))
            .collect(),
    }
}

fn format_row(table: &TableSchema, row: &[Value]) -> String {
    let fields: Vec<String> = row
        .iter()
        .enumerate()
        .map(|(i, value)| match table.columns.get(i) {
            Some(column) => format!("{column}={value}"),
            None => format!("#{i}={value}"),
        })
        .collect();
    format!("{{{}}}", fields.join(", "))
}
