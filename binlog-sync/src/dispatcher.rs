//! Fan-out of a single rows event to every matching handler.
//!
//! Each matching handler runs in its own task. The dispatcher waits for all
//! of them, whatever they return, and only then produces a verdict: the event
//! fails if and only if a handler returned [`HandlerError::Interrupted`].
//! Other handler errors are logged and swallowed, so one broken consumer does
//! not hold back the healthy ones.
use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use futures::future::join_all;
use tokio::task::{JoinError, JoinHandle};
use tracing::{info, warn};

use crate::cdc_types::{Action, RowsEvent};
use crate::consumer::{DispatchContext, HandlerError};
use crate::error::{SyncError, SyncResult};
use crate::registry::HandlerRegistry;

/// How a single handler invocation ended.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum OutcomeKind {
    None,
    Interrupted,
    Other,
}

/// Result of one handler invocation, consumed right away by the aggregation.
#[derive(Debug)]
pub struct HandlerOutcome {
    pub handler_name: String,
    /// The registration the handler was completed for, set for flushes only.
    pub table_filter: Option<String>,
    pub kind: OutcomeKind,
    pub cause: Option<anyhow::Error>,
}

impl HandlerOutcome {
    fn from_task(
        handler_name: String,
        table_filter: Option<String>,
        res: Result<Result<(), HandlerError>, JoinError>,
    ) -> Self {
        let (kind, cause) = match res {
            Ok(Ok(())) => (OutcomeKind::None, None),
            Ok(Err(HandlerError::Interrupted(err))) => (OutcomeKind::Interrupted, Some(err)),
            Ok(Err(HandlerError::Other(err))) => (OutcomeKind::Other, Some(err)),
            Err(err) => (
                OutcomeKind::Other,
                Some(anyhow!("handler task did not finish: {err}")),
            ),
        };

        HandlerOutcome {
            handler_name,
            table_filter,
            kind,
            cause,
        }
    }
}

/// Summary of a successful dispatch or flush cycle.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Number of handler invocations.
    pub invoked: usize,
    /// Handlers that failed without interrupting, in completion order.
    pub failed: Vec<String>,
}

/// What a cycle was about, for logging.
pub(crate) enum CycleScope<'a> {
    Rows { action: Action, table: &'a str },
    Flush,
}

impl fmt::Display for CycleScope<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CycleScope::Rows { action, table } => write!(f, "{action} on {table}"),
            CycleScope::Flush => write!(f, "flush"),
        }
    }
}

pub(crate) struct HandlerTask {
    handler_name: String,
    table_filter: Option<String>,
    handle: JoinHandle<Result<(), HandlerError>>,
}

/// Spawns one task per handler invocation.
/// A handler returning [`HandlerError::Interrupted`] marks `ctx` as interrupted.
pub(crate) fn spawn_handler<F>(
    ctx: &DispatchContext,
    handler_name: String,
    table_filter: Option<String>,
    fut: F,
) -> HandlerTask
where
    F: std::future::Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    let ctx = ctx.clone();
    let handle = tokio::spawn(async move {
        let res = fut.await;
        if matches!(res, Err(HandlerError::Interrupted(_))) {
            ctx.interrupt();
        }
        res
    });

    HandlerTask {
        handler_name,
        table_filter,
        handle,
    }
}

/// Waits for every task, no early return on the first failure.
pub(crate) async fn collect_outcomes(tasks: Vec<HandlerTask>) -> Vec<HandlerOutcome> {
    join_all(tasks.into_iter().map(|task| async move {
        let res = task.handle.await;
        HandlerOutcome::from_task(task.handler_name, task.table_filter, res)
    }))
    .await
}

/// Folds the outcomes of a cycle into a single verdict.
/// Every failure is logged; the first interrupt becomes the error.
pub(crate) fn aggregate(
    outcomes: Vec<HandlerOutcome>,
    scope: &CycleScope<'_>,
    schema: Option<&str>,
) -> SyncResult<DispatchReport> {
    let mut report = DispatchReport {
        invoked: outcomes.len(),
        failed: vec![],
    };
    let mut interrupted: Option<SyncError> = None;

    for outcome in outcomes {
        let Some(cause) = outcome.cause else {
            continue;
        };
        let is_interrupted = outcome.kind == OutcomeKind::Interrupted;

        match scope {
            CycleScope::Rows { action, table } => warn!(
                handler = %outcome.handler_name,
                is_interrupted,
                %action,
                schema = schema.unwrap_or_default(),
                has_schema = schema.is_some(),
                table,
                error = ?cause,
                "Rows event handler failed"
            ),
            CycleScope::Flush => warn!(
                handler = %outcome.handler_name,
                table_filter = outcome.table_filter.as_deref().unwrap_or_default(),
                is_interrupted,
                error = ?cause,
                "Rows event handler failed to complete"
            ),
        }

        if is_interrupted {
            if interrupted.is_none() {
                interrupted = Some(SyncError::Interrupted {
                    handler: outcome.handler_name,
                    source: cause,
                });
            }
        } else {
            report.failed.push(outcome.handler_name);
        }
    }

    match interrupted {
        Some(err) => {
            info!(%scope, "Handler requested the binlog stream to stop");
            Err(err)
        }
        None => Ok(report),
    }
}

/// Delivers rows events to the handlers of a [`HandlerRegistry`].
pub struct Dispatcher {
    registry: Arc<HandlerRegistry>,
    schema: Option<String>,
}

impl Dispatcher {
    /// `schema` is the database name reported alongside handler failures.
    pub fn new(registry: Arc<HandlerRegistry>, schema: Option<String>) -> Dispatcher {
        Dispatcher { registry, schema }
    }

    /// Runs every handler matching the event's table concurrently and waits
    /// for all of them. An event without matching handlers is a success.
    pub async fn dispatch(&self, event: RowsEvent) -> SyncResult<DispatchReport> {
        let handlers = self.registry.handlers_for(&event.table().name).await;
        if handlers.is_empty() {
            return Ok(DispatchReport::default());
        }

        let ctx = DispatchContext::new();
        let event = Arc::new(event);

        let tasks = handlers
            .into_iter()
            .map(|handler| {
                let event = Arc::clone(&event);
                let task_ctx = ctx.clone();
                spawn_handler(&ctx, handler.to_string(), None, async move {
                    handler
                        .handle(&task_ctx, event.action(), event.table(), event.rows())
                        .await
                })
            })
            .collect();

        let outcomes = collect_outcomes(tasks).await;
        let scope = CycleScope::Rows {
            action: event.action(),
            table: &event.table().name,
        };

        aggregate(outcomes, &scope, self.schema.as_deref())
    }
}
