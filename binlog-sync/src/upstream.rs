//! Interfaces of the log-reading collaborator.
//!
//! The canal does not read or parse the replicated log itself. It asks a
//! [`BinlogSource`] for the current status and for a subscription, then pulls
//! already decoded [`BinlogEvent`]s one at a time.
use async_trait::async_trait;

use crate::cdc_types::{BinlogEvent, Row};
use crate::checkpoints::Position;

#[async_trait]
pub trait BinlogSource: Send + Sync {
    /// Returns the rows of the upstream status query
    /// (the equivalent of `SHOW MASTER STATUS`).
    /// The first column of the first row must hold the log file name,
    /// the second one the offset.
    async fn master_status(&self) -> anyhow::Result<Vec<Row>>;

    /// Opens a stream of decoded events starting at `from`.
    async fn subscribe(&self, from: &Position) -> anyhow::Result<Box<dyn BinlogSubscription>>;
}

/// An ordered stream of decoded events.
///
/// There is no acknowledgement: the canal applies backpressure by not asking
/// for the next event until the current one is fully dispatched.
#[async_trait]
pub trait BinlogSubscription: Send {
    /// Returns the next event, or `None` once the stream has ended.
    async fn next_event(&mut self) -> anyhow::Result<Option<BinlogEvent>>;

    /// Releases the upstream connection.
    async fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}
