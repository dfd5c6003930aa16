//! A module representing the logic behind consuming row events.
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::watch;

use crate::cdc_types::{Action, Row, TableSchema};

/// Trait used to represent a user-defined callback
/// used for processing decoded rows events.
///
/// A handler is registered on a [`Canal`](crate::canal::Canal) either for one
/// table or for all tables. For every rows event, each matching handler runs in
/// its own task, concurrently with the other matching handlers, and the next
/// event is not delivered until all of them have returned.
///
/// Returning [`HandlerError::Interrupted`] stops the whole stream.
/// Any other error is logged and ignored.
///
/// The [`fmt::Display`] implementation names the handler in logs.
#[async_trait]
pub trait RowsEventHandler: Send + Sync + fmt::Display {
    /// Handles the rows of a single event.
    /// For [`Action::Update`] rows come in `[before, after]` pairs.
    /// `table` is shared with the other handlers of the same event.
    async fn handle(
        &self,
        ctx: &DispatchContext,
        action: Action,
        table: &TableSchema,
        rows: &[Row],
    ) -> Result<(), HandlerError>;

    /// Runs before the upstream log rotates and once more on shutdown,
    /// so that buffered state can be flushed.
    async fn complete(&self, ctx: &DispatchContext) -> Result<(), HandlerError>;
}

/// Tagged result of a handler invocation.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Stop the binlog stream.
    #[error("interrupted: {0:#}")]
    Interrupted(#[source] anyhow::Error),

    /// Log and carry on.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl HandlerError {
    pub fn interrupted(err: impl Into<anyhow::Error>) -> HandlerError {
        HandlerError::Interrupted(err.into())
    }

    pub fn other(err: impl Into<anyhow::Error>) -> HandlerError {
        HandlerError::Other(err.into())
    }

    pub fn is_interrupted(&self) -> bool {
        matches!(self, HandlerError::Interrupted(_))
    }

    pub fn into_inner(self) -> anyhow::Error {
        match self {
            HandlerError::Interrupted(err) | HandlerError::Other(err) => err,
        }
    }
}

/// Context shared by every handler task of one dispatch or flush cycle.
///
/// Once any handler of the cycle returns [`HandlerError::Interrupted`], the
/// context is marked as interrupted. Sibling handlers keep running; long
/// running ones may poll [`DispatchContext::is_interrupted`] or await
/// [`DispatchContext::interrupted`] to bail out early.
#[derive(Clone, Debug)]
pub struct DispatchContext {
    // We are using a watch channel, because we only need the latest value.
    interrupted: Arc<watch::Sender<bool>>,
}

impl DispatchContext {
    pub fn new() -> DispatchContext {
        let (sender, _) = watch::channel(false);
        DispatchContext {
            interrupted: Arc::new(sender),
        }
    }

    pub fn is_interrupted(&self) -> bool {
        *self.interrupted.borrow()
    }

    /// Resolves once a handler of this cycle has interrupted the stream.
    pub async fn interrupted(&self) {
        let mut receiver = self.interrupted.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = receiver.wait_for(|interrupted| *interrupted).await;
    }

    pub(crate) fn interrupt(&self) {
        self.interrupted.send_replace(true);
    }
}

impl Default for DispatchContext {
    fn default() -> Self {
        DispatchContext::new()
    }
}
