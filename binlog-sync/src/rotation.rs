//! Flushing handlers before the log cursor moves to a new file or the canal
//! shuts down.
use std::sync::Arc;

use tokio::time::Instant;
use tracing::{debug, info};

use crate::checkpoints::PositionStore;
use crate::consumer::DispatchContext;
use crate::dispatcher::{
    aggregate, collect_outcomes, spawn_handler, CycleScope, DispatchReport, HandlerTask,
};
use crate::error::SyncResult;
use crate::registry::HandlerRegistry;

pub struct RotationCoordinator {
    registry: Arc<HandlerRegistry>,
    positions: Arc<PositionStore>,
    schema: Option<String>,
}

impl RotationCoordinator {
    pub fn new(
        registry: Arc<HandlerRegistry>,
        positions: Arc<PositionStore>,
        schema: Option<String>,
    ) -> RotationCoordinator {
        RotationCoordinator {
            registry,
            positions,
            schema,
        }
    }

    /// Calls `complete` on every registration concurrently, one task per
    /// `(table filter, handler)` pair, and waits for all of them.
    /// Interrupts fail the flush, other errors are logged.
    pub async fn flush(&self) -> SyncResult<DispatchReport> {
        let started = Instant::now();
        let ctx = DispatchContext::new();

        let tasks = self.spawn_completions(&ctx).await;
        let outcomes = collect_outcomes(tasks).await;
        let res = aggregate(outcomes, &CycleScope::Flush, self.schema.as_deref());

        info!(
            elapsed_ms = started.elapsed().as_millis() as u64,
            ok = res.is_ok(),
            "Flushed rows event handlers"
        );
        res
    }

    async fn spawn_completions(&self, ctx: &DispatchContext) -> Vec<HandlerTask> {
        self.registry
            .registrations()
            .await
            .into_iter()
            .map(|(table_filter, handler)| {
                let task_ctx = ctx.clone();
                let name = handler.to_string();
                debug!(handler = %name, table_filter, "Completing handler");
                spawn_handler(ctx, name, Some(table_filter), async move {
                    handler.complete(&task_ctx).await
                })
            })
            .collect()
    }

    /// Flushes the handlers, then moves the cursor to the new log file and
    /// saves it. An interrupted flush leaves the cursor where it was.
    pub async fn rotate(&self, next_name: &str, offset: u32) -> SyncResult<()> {
        self.flush().await?;
        self.positions.update(next_name, offset).await;
        self.positions.save(true).await
    }

    /// Flushes the handlers and forces a final save, even when the flush
    /// failed. The flush error takes precedence.
    pub async fn shutdown(&self) -> SyncResult<()> {
        let flushed = self.flush().await;
        let saved = self.positions.close().await;
        flushed?;
        saved
    }
}
