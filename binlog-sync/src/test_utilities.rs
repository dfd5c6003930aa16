//! In-memory collaborators for exercising a canal without a database.
use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::anyhow;
use async_trait::async_trait;
use binlog_sync_test_utils::Journal;
use tokio::sync::watch;

use crate::canal::CanalState;
use crate::cdc_types::{Action, BinlogEvent, Row, TableSchema, Value};
use crate::checkpoints::{PersistedPosition, Position, PositionSaver};
use crate::consumer::{DispatchContext, HandlerError, RowsEventHandler};
use crate::upstream::{BinlogSource, BinlogSubscription};

/// One step of a scripted binlog stream.
#[derive(Clone, Debug)]
pub enum ScriptStep {
    Event(BinlogEvent),
    Error(String),
    /// Never yields, like an idle upstream.
    Hang,
}

/// A [`BinlogSource`] replaying a fixed list of steps.
/// The stream ends after the last step.
pub struct ScriptedSource {
    status: Result<Vec<Row>, String>,
    steps: Arc<Mutex<VecDeque<ScriptStep>>>,
    subscribed_from: Arc<Mutex<Vec<Position>>>,
    closed: Arc<AtomicBool>,
}

impl ScriptedSource {
    pub fn new(name: &str, offset: u32, events: Vec<BinlogEvent>) -> ScriptedSource {
        let steps = events.into_iter().map(ScriptStep::Event).collect();
        ScriptedSource::with_steps(name, offset, steps)
    }

    pub fn with_steps(name: &str, offset: u32, steps: Vec<ScriptStep>) -> ScriptedSource {
        ScriptedSource {
            status: Ok(vec![vec![
                Value::Text(name.to_string()),
                Value::UInt(offset as u64),
            ]]),
            steps: Arc::new(Mutex::new(steps.into())),
            subscribed_from: Arc::new(Mutex::new(vec![])),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn failing_status(msg: &str) -> ScriptedSource {
        ScriptedSource {
            status: Err(msg.to_string()),
            ..ScriptedSource::new("", 0, vec![])
        }
    }

    /// Positions passed to `subscribe`, in call order.
    pub fn subscribed_from(&self) -> Vec<Position> {
        self.subscribed_from.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Steps not consumed yet.
    pub fn remaining(&self) -> usize {
        self.steps.lock().unwrap().len()
    }
}

#[async_trait]
impl BinlogSource for ScriptedSource {
    async fn master_status(&self) -> anyhow::Result<Vec<Row>> {
        self.status.clone().map_err(|msg| anyhow!(msg))
    }

    async fn subscribe(&self, from: &Position) -> anyhow::Result<Box<dyn BinlogSubscription>> {
        self.subscribed_from.lock().unwrap().push(from.clone());
        self.closed.store(false, Ordering::SeqCst);
        Ok(Box::new(ScriptedSubscription {
            steps: Arc::clone(&self.steps),
            closed: Arc::clone(&self.closed),
        }))
    }
}

struct ScriptedSubscription {
    steps: Arc<Mutex<VecDeque<ScriptStep>>>,
    closed: Arc<AtomicBool>,
}

#[async_trait]
impl BinlogSubscription for ScriptedSubscription {
    async fn next_event(&mut self) -> anyhow::Result<Option<BinlogEvent>> {
        let step = self.steps.lock().unwrap().pop_front();
        match step {
            Some(ScriptStep::Event(event)) => Ok(Some(event)),
            Some(ScriptStep::Error(msg)) => Err(anyhow!(msg)),
            Some(ScriptStep::Hang) => std::future::pending().await,
            None => Ok(None),
        }
    }

    async fn close(&mut self) -> anyhow::Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

/// A [`PositionSaver`] keeping every saved record in memory.
#[derive(Default)]
pub struct MemoryPositionSaver {
    saved: Mutex<Vec<PersistedPosition>>,
    fail: AtomicBool,
    journal: Option<Journal>,
}

impl MemoryPositionSaver {
    pub fn new() -> MemoryPositionSaver {
        MemoryPositionSaver::default()
    }

    /// Records `save:<name>:<position>` for every successful save.
    pub fn with_journal(mut self, journal: Journal) -> MemoryPositionSaver {
        self.journal = Some(journal);
        self
    }

    pub fn fail_saves(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn saved(&self) -> Vec<PersistedPosition> {
        self.saved.lock().unwrap().clone()
    }
}

#[async_trait]
impl PositionSaver for MemoryPositionSaver {
    async fn save_position(&self, position: &PersistedPosition) -> anyhow::Result<()> {
        if self.fail.load(Ordering::SeqCst) {
            return Err(anyhow!("storage is read-only"));
        }
        if let Some(journal) = &self.journal {
            journal.push(format!("save:{}:{}", position.name, position.position));
        }
        self.saved.lock().unwrap().push(position.clone());
        Ok(())
    }

    async fn load_position(&self) -> anyhow::Result<Option<PersistedPosition>> {
        Ok(self.saved.lock().unwrap().last().cloned())
    }
}

/// What a [`RecordingHandler`] should do instead of succeeding.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Failure {
    Other,
    Interrupted,
    Panic,
}

impl Failure {
    fn raise(self, name: &str) -> Result<(), HandlerError> {
        match self {
            Failure::Other => Err(HandlerError::other(anyhow!("{name} failed"))),
            Failure::Interrupted => Err(HandlerError::interrupted(anyhow!("{name} gave up"))),
            Failure::Panic => panic!("{name} panicked"),
        }
    }
}

#[derive(Default)]
struct Recording {
    journal: Option<Journal>,
    // Fails from the given call on (1-based).
    handle_failure: Option<(usize, Failure)>,
    complete_failure: Option<Failure>,
    delay: Option<Duration>,
    events: Vec<(Action, String, usize)>,
    canal_state: Option<watch::Receiver<CanalState>>,
    states_at_complete: Vec<CanalState>,
}

/// A [`RowsEventHandler`] remembering what it was called with.
/// Clones share their recordings.
///
/// With a journal attached it records `begin:<name>:<action>:<table>` and
/// `end:<name>:<action>:<table>` around every event and `complete:<name>`.
#[derive(Clone)]
pub struct RecordingHandler {
    name: Arc<str>,
    recording: Arc<Mutex<Recording>>,
    handled: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    saw_interrupt: Arc<AtomicBool>,
}

impl RecordingHandler {
    pub fn new(name: &str) -> RecordingHandler {
        RecordingHandler {
            name: Arc::from(name),
            recording: Default::default(),
            handled: Default::default(),
            completed: Default::default(),
            saw_interrupt: Default::default(),
        }
    }

    pub fn with_journal(self, journal: Journal) -> RecordingHandler {
        self.recording.lock().unwrap().journal = Some(journal);
        self
    }

    pub fn fail_handle(self, failure: Failure) -> RecordingHandler {
        self.fail_handle_from(1, failure)
    }

    /// Succeeds for the first `call - 1` events, fails from then on.
    pub fn fail_handle_from(self, call: usize, failure: Failure) -> RecordingHandler {
        self.recording.lock().unwrap().handle_failure = Some((call, failure));
        self
    }

    pub fn fail_complete(self, failure: Failure) -> RecordingHandler {
        self.recording.lock().unwrap().complete_failure = Some(failure);
        self
    }

    /// Sleeps that long inside every `handle` call.
    pub fn with_delay(self, delay: Duration) -> RecordingHandler {
        self.recording.lock().unwrap().delay = Some(delay);
        self
    }

    /// Makes every `complete` call note the canal state it was called in.
    pub fn watch_canal(&self, states: watch::Receiver<CanalState>) {
        self.recording.lock().unwrap().canal_state = Some(states);
    }

    pub fn states_at_complete(&self) -> Vec<CanalState> {
        self.recording.lock().unwrap().states_at_complete.clone()
    }

    pub fn into_dyn(self) -> Arc<dyn RowsEventHandler> {
        Arc::new(self)
    }

    pub fn handled(&self) -> usize {
        self.handled.load(Ordering::SeqCst)
    }

    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    /// Whether a sibling had interrupted the cycle by the time a `handle`
    /// call finished.
    pub fn saw_interrupt(&self) -> bool {
        self.saw_interrupt.load(Ordering::SeqCst)
    }

    /// `(action, table, row count)` of every handled event.
    pub fn events(&self) -> Vec<(Action, String, usize)> {
        self.recording.lock().unwrap().events.clone()
    }

    fn journal(&self, entry: impl FnOnce() -> String) {
        if let Some(journal) = &self.recording.lock().unwrap().journal {
            journal.push(entry());
        }
    }
}

impl fmt::Display for RecordingHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

#[async_trait]
impl RowsEventHandler for RecordingHandler {
    async fn handle(
        &self,
        ctx: &DispatchContext,
        action: Action,
        table: &TableSchema,
        rows: &[Row],
    ) -> Result<(), HandlerError> {
        let call = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
        self.journal(|| format!("begin:{}:{}:{}", self.name, action, table.name));

        let (delay, failure) = {
            let recording = self.recording.lock().unwrap();
            let failure = recording
                .handle_failure
                .filter(|(from, _)| call >= *from)
                .map(|(_, failure)| failure);
            (recording.delay, failure)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if ctx.is_interrupted() {
            self.saw_interrupt.store(true, Ordering::SeqCst);
        }

        self.recording
            .lock()
            .unwrap()
            .events
            .push((action, table.name.clone(), rows.len()));
        self.journal(|| format!("end:{}:{}:{}", self.name, action, table.name));

        match failure {
            Some(failure) => failure.raise(&self.name),
            None => Ok(()),
        }
    }

    async fn complete(&self, _ctx: &DispatchContext) -> Result<(), HandlerError> {
        self.completed.fetch_add(1, Ordering::SeqCst);
        self.journal(|| format!("complete:{}", self.name));

        let failure = {
            let mut recording = self.recording.lock().unwrap();
            if let Some(state) = recording.canal_state.as_ref().map(|rx| *rx.borrow()) {
                recording.states_at_complete.push(state);
            }
            recording.complete_failure
        };
        match failure {
            Some(failure) => failure.raise(&self.name),
            None => Ok(()),
        }
    }
}
