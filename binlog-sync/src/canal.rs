//! The canal reads the decoded binlog stream in order and feeds it to the
//! registered handlers.
//!
//! ```text
//! Stopped -> Initializing -> Running -> Stopping -> Stopped
//! ```
//!
//! While `Initializing` the canal loads its starting position and subscribes
//! to the upstream. While `Running` it takes one event at a time: a rows event
//! is dispatched to every matching handler and the cursor only moves once all
//! of them are done, a rotation flushes every handler and force-saves the
//! cursor of the new log file. The canal goes to `Stopping` when the stream
//! ends, when [`Canal::stop`] is called, on an upstream error or when a handler
//! interrupts the stream. Stopping flushes the handlers once more, force-saves
//! the cursor and closes the subscription.
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::RemoteHandle;
use futures::FutureExt;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, trace, warn};

use crate::cdc_types::BinlogEvent;
use crate::checkpoints::{FilePositionSaver, Position, PositionSaver, PositionStore};
use crate::config::{CanalConfig, StartPosition, TableFilter};
use crate::consumer::RowsEventHandler;
use crate::dispatcher::Dispatcher;
use crate::error::{SyncError, SyncResult};
use crate::registry::HandlerRegistry;
use crate::rotation::RotationCoordinator;
use crate::upstream::{BinlogSource, BinlogSubscription};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CanalState {
    Stopped,
    Initializing,
    Running,
    Stopping,
}

/// Handle to a canal. Cloning it is cheap, every clone controls the same canal.
#[derive(Clone)]
pub struct Canal {
    source: Arc<dyn BinlogSource>,
    saver: Arc<dyn PositionSaver>,
    config: Arc<CanalConfig>,
    table_filter: Arc<TableFilter>,
    registry: Arc<HandlerRegistry>,
    // Created on the first start, reused when the canal is started again.
    positions: Arc<Mutex<Option<Arc<PositionStore>>>>,
    state: Arc<watch::Sender<CanalState>>,
    // Tells the worker to stop.
    stop: Arc<watch::Sender<bool>>,
}

impl Canal {
    pub fn new(
        source: Arc<dyn BinlogSource>,
        saver: Arc<dyn PositionSaver>,
        config: CanalConfig,
    ) -> SyncResult<Canal> {
        let table_filter = config.table_filter()?;
        let (state, _) = watch::channel(CanalState::Stopped);
        let (stop, _) = watch::channel(false);

        Ok(Canal {
            source,
            saver,
            config: Arc::new(config),
            table_filter: Arc::new(table_filter),
            registry: Arc::new(HandlerRegistry::new()),
            positions: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
            stop: Arc::new(stop),
        })
    }

    /// Binds handlers to `table_name`, or to every table when it is empty.
    /// May be called while the canal is running; the handlers see the
    /// events dispatched after the call returns.
    pub async fn register_rows_event_handler<I>(&self, table_name: &str, handlers: I)
    where
        I: IntoIterator<Item = Arc<dyn RowsEventHandler>>,
    {
        self.registry.register(table_name, handlers).await;
    }

    pub fn registry(&self) -> &Arc<HandlerRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &CanalConfig {
        &self.config
    }

    pub fn state(&self) -> CanalState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<CanalState> {
        self.state.subscribe()
    }

    /// Returns a copy of the current position,
    /// or `None` if the canal has never been initialized.
    pub async fn position(&self) -> Option<Position> {
        let store = self.positions.lock().await.clone()?;
        Some(store.snapshot().await)
    }

    /// Spawns the read loop and returns a handle to its result.
    ///
    /// Dropping the handle cancels the read loop like dropping the future
    /// of [`Canal::run`] does.
    pub fn start(&self) -> RemoteHandle<SyncResult<()>> {
        // Leave `Stopped` right away, so that a `stop` issued after `start`
        // returns is never lost.
        let begun = self.begin();
        let canal = self.clone();
        let (fut, handle) = async move { canal.run_begun(begun?).await }.remote_handle();
        tokio::task::spawn(fut);
        handle
    }

    /// Asks the read loop to stop after the event it is working on.
    pub fn stop(&self) {
        self.stop.send_replace(true);
    }

    /// Runs the read loop in the current task until the stream ends, a stop
    /// is requested or a handler interrupts the stream.
    ///
    /// Cancelling the returned future skips the final flush and the forced
    /// save. The canal goes back to `Stopped` and keeps the in-memory
    /// position, so the next run continues after the last handled event.
    pub async fn run(&self) -> SyncResult<()> {
        let running = self.begin()?;
        self.run_begun(running).await
    }

    fn begin(&self) -> SyncResult<RunningGuard> {
        let mut begun = false;
        self.state.send_if_modified(|state| {
            if *state == CanalState::Stopped {
                *state = CanalState::Initializing;
                begun = true;
            }
            begun
        });
        if !begun {
            return Err(SyncError::AlreadyRunning);
        }
        self.stop.send_replace(false);
        Ok(RunningGuard {
            state: Arc::clone(&self.state),
            finished: false,
        })
    }

    async fn run_begun(&self, running: RunningGuard) -> SyncResult<()> {
        let res = self.run_initialized().await;
        running.finish();
        info!("Canal stopped");
        res
    }

    async fn run_initialized(&self) -> SyncResult<()> {
        let positions = self.initialize().await?;
        let from = positions.snapshot().await;
        let mut subscription = self
            .source
            .subscribe(&from)
            .await
            .map_err(SyncError::Upstream)?;

        let schema = self.config.database.clone();
        let dispatcher = Dispatcher::new(Arc::clone(&self.registry), schema.clone());
        let coordinator =
            RotationCoordinator::new(Arc::clone(&self.registry), Arc::clone(&positions), schema);

        self.set_state(CanalState::Running);
        info!(position = %from, "Canal running");

        let res = self
            .consume(subscription.as_mut(), &dispatcher, &coordinator, &positions)
            .await;

        self.set_state(CanalState::Stopping);
        if let Err(err) = &res {
            info!(error = %err, "Canal stopping");
        }

        let flushed = coordinator.shutdown().await;
        if let Err(err) = subscription.close().await {
            warn!(error = ?err, "Failed to close binlog subscription");
        }

        match (res, flushed) {
            (Err(err), Err(shutdown_err)) => {
                warn!(error = %shutdown_err, "Shutdown after failure did not complete cleanly");
                Err(err)
            }
            (Err(err), Ok(())) => Err(err),
            (Ok(()), flushed) => flushed,
        }
    }

    async fn initialize(&self) -> SyncResult<Arc<PositionStore>> {
        let mut guard = self.positions.lock().await;
        if let Some(store) = guard.as_ref() {
            return Ok(Arc::clone(store));
        }

        let saver = Arc::clone(&self.saver);
        let interval = self.config.save_interval;
        let store = match &self.config.start_position {
            StartPosition::Current => {
                PositionStore::load(self.source.as_ref(), saver, interval).await?
            }
            StartPosition::Saved => {
                match PositionStore::resume(Arc::clone(&saver), interval).await? {
                    Some(store) => store,
                    None => {
                        info!("No saved position, starting from the current upstream position");
                        PositionStore::load(self.source.as_ref(), saver, interval).await?
                    }
                }
            }
            StartPosition::At { name, offset } => {
                PositionStore::new(Position::new(name.as_str(), *offset), saver, interval)
            }
        };

        let store = Arc::new(store);
        *guard = Some(Arc::clone(&store));
        Ok(store)
    }

    async fn consume(
        &self,
        subscription: &mut dyn BinlogSubscription,
        dispatcher: &Dispatcher,
        coordinator: &RotationCoordinator,
        positions: &PositionStore,
    ) -> SyncResult<()> {
        let mut stop = self.stop.subscribe();

        loop {
            let next = tokio::select! {
                biased;
                _ = stop_requested(&mut stop) => {
                    info!("Stop requested");
                    return Ok(());
                }
                next = subscription.next_event() => next.map_err(SyncError::Upstream)?,
            };

            let Some(event) = next else {
                info!("Binlog stream ended");
                return Ok(());
            };

            match event {
                BinlogEvent::Rows { event, log_pos } => {
                    if self.table_filter.accepts(event.table()) {
                        let report = dispatcher.dispatch(event).await?;
                        trace!(
                            invoked = report.invoked,
                            failed = report.failed.len(),
                            log_pos,
                            "Dispatched rows event"
                        );
                    } else {
                        trace!(table = %event.table().qualified_name(), "Skipping filtered table");
                    }

                    positions.advance(log_pos).await;
                    if let Err(err) = positions.save(false).await {
                        warn!(error = %err, "Saving log position failed, will retry");
                    }
                }
                BinlogEvent::Rotate { next_name, offset } => {
                    debug!(next_name = %next_name, offset, "Binlog rotation");
                    match coordinator.rotate(&next_name, offset).await {
                        Ok(()) => {
                            info!(next_name = %next_name, offset, "Rotated to new binlog file")
                        }
                        Err(err @ SyncError::PersistFailure { .. }) => {
                            warn!(
                                error = %err,
                                "Saving log position after rotation failed, will retry"
                            );
                        }
                        Err(err) => return Err(err),
                    }
                }
            }
        }
    }

    fn set_state(&self, state: CanalState) {
        debug!(?state, "Canal state change");
        self.state.send_replace(state);
    }
}

/// Puts the canal back to `Stopped` when the run ends, including when the
/// run future is dropped half way.
struct RunningGuard {
    state: Arc<watch::Sender<CanalState>>,
    finished: bool,
}

impl RunningGuard {
    fn finish(mut self) {
        self.finished = true;
    }
}

impl Drop for RunningGuard {
    fn drop(&mut self) {
        let previous = self.state.send_replace(CanalState::Stopped);
        if !self.finished {
            warn!(state = ?previous, "Canal run cancelled, skipping final flush and save");
        }
        debug!(state = ?CanalState::Stopped, "Canal state change");
    }
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    // The sender is owned by the canal, so an error cannot happen while the
    // worker is running.
    let _ = stop.wait_for(|stop| *stop).await;
}

/// Builder of [`Canal`], mirroring [`CanalConfig`] field by field.
#[derive(Default)]
pub struct CanalBuilder {
    source: Option<Arc<dyn BinlogSource>>,
    saver: Option<Arc<dyn PositionSaver>>,
    config: CanalConfig,
    handlers: Vec<(String, Arc<dyn RowsEventHandler>)>,
}

impl CanalBuilder {
    pub fn new() -> CanalBuilder {
        CanalBuilder::default()
    }

    pub fn source(mut self, source: Arc<dyn BinlogSource>) -> Self {
        self.source = Some(source);
        self
    }

    pub fn position_saver(mut self, saver: Arc<dyn PositionSaver>) -> Self {
        self.saver = Some(saver);
        self
    }

    /// Persists the position as JSON at `path`.
    pub fn position_file(self, path: impl Into<PathBuf>) -> Self {
        self.position_saver(Arc::new(FilePositionSaver::new(path)))
    }

    pub fn config(mut self, config: CanalConfig) -> Self {
        self.config = config;
        self
    }

    pub fn database(mut self, database: impl Into<String>) -> Self {
        self.config.database = Some(database.into());
        self
    }

    pub fn save_interval(mut self, save_interval: Duration) -> Self {
        self.config.save_interval = save_interval;
        self
    }

    pub fn start_position(mut self, start_position: StartPosition) -> Self {
        self.config.start_position = start_position;
        self
    }

    pub fn include_table(mut self, pattern: impl Into<String>) -> Self {
        self.config.include_tables.push(pattern.into());
        self
    }

    pub fn exclude_table(mut self, pattern: impl Into<String>) -> Self {
        self.config.exclude_tables.push(pattern.into());
        self
    }

    pub fn handler(mut self, table_name: &str, handler: Arc<dyn RowsEventHandler>) -> Self {
        self.handlers.push((table_name.to_string(), handler));
        self
    }

    pub async fn build(self) -> SyncResult<Canal> {
        let source = self.source.ok_or(SyncError::MissingField("source"))?;
        let saver = self.saver.ok_or(SyncError::MissingField("position_saver"))?;
        let canal = Canal::new(source, saver, self.config)?;

        for (table_name, handler) in self.handlers {
            canal.register_rows_event_handler(&table_name, [handler]).await;
        }

        Ok(canal)
    }
}
