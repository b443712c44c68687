//! Run registry — per-run append-only event logs plus run metadata.
//!
//! One registry is created at service start and shared via `Arc`. Each run
//! lives in its own slot guarded by a short-lived `std::sync::Mutex`, so an
//! append and a concurrent `read_since` never observe a half-written event
//! or an index gap, and pollers never wait behind a running step.
//!
//! Writers go through a [`RunHandle`], which is handed to exactly one
//! orchestrator. Readers use [`RunRegistry::read_since`] with a cursor, or
//! [`RunRegistry::subscribe`] to be woken on every append.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::event::{EventKind, RunEvent};
use crate::model::GenerationConfig;
use crate::run::{Phase, RunRecord, RunStatus, RunSummary, new_run_id};

/// Parameters for a new run.
#[derive(Debug, Clone)]
pub struct NewRun {
    pub task: String,
    pub workspace: PathBuf,
    pub image_path: Option<PathBuf>,
    pub config: GenerationConfig,
}

/// A read of one run from a cursor position.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSnapshot {
    pub id: String,
    pub status: RunStatus,
    pub task: String,
    pub workspace: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub final_answer: Option<String>,
    pub error: Option<String>,
    pub progress_pct: u8,
    pub phase: Phase,
    /// Events with `index >= cursor`
    pub events: Vec<RunEvent>,
    /// Total events so far; pass back as the next cursor
    pub next_index: usize,
}

/// Result of a cancellation request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelOutcome {
    Cancelled,
    AlreadyFinished,
    NotFound,
}

struct RunState {
    record: RunRecord,
    events: Vec<RunEvent>,
}

struct RunSlot {
    seq: u64,
    state: Mutex<RunState>,
    /// Current event count; ticks on every append and on terminal transitions
    notify: watch::Sender<usize>,
    cancel: CancellationToken,
}

impl RunSlot {
    fn lock(&self) -> std::sync::MutexGuard<'_, RunState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Everything a run publishes when it finishes.
#[derive(Debug, Clone)]
pub struct Closing {
    status: RunStatus,
    final_answer: Option<String>,
    error: Option<String>,
    progress: Option<(u8, Phase)>,
    events: Vec<EventKind>,
}

impl Closing {
    pub fn new(status: RunStatus) -> Self {
        Self {
            status,
            final_answer: None,
            error: None,
            progress: None,
            events: Vec::new(),
        }
    }

    pub fn with_answer(mut self, final_answer: Option<String>) -> Self {
        self.final_answer = final_answer;
        self
    }

    pub fn with_error(mut self, message: impl Into<String>) -> Self {
        self.error = Some(message.into());
        self
    }

    pub fn with_progress(mut self, progress_pct: u8, phase: Phase) -> Self {
        self.progress = Some((progress_pct, phase));
        self
    }

    /// Queue an event; events are appended in the order given.
    pub fn with_event(mut self, kind: EventKind) -> Self {
        self.events.push(kind);
        self
    }
}

/// Registry of all runs known to this process.
#[derive(Default)]
pub struct RunRegistry {
    runs: RwLock<HashMap<String, Arc<RunSlot>>>,
    next_seq: AtomicU64,
}

impl RunRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new run in status `running` and return its writer handle.
    pub fn create_run(&self, new_run: NewRun) -> RunHandle {
        let id = new_run_id();
        let record = RunRecord {
            id: id.clone(),
            task: new_run.task,
            workspace: new_run.workspace,
            image_path: new_run.image_path,
            config: new_run.config,
            status: RunStatus::Running,
            created_at: Utc::now(),
            started_at: None,
            finished_at: None,
            final_answer: None,
            error: None,
            progress_pct: 0,
            phase: Phase::Planning,
        };
        let (notify, _) = watch::channel(0);
        let slot = Arc::new(RunSlot {
            seq: self.next_seq.fetch_add(1, Ordering::Relaxed),
            state: Mutex::new(RunState {
                record,
                events: Vec::new(),
            }),
            notify,
            cancel: CancellationToken::new(),
        });

        self.runs
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id.clone(), slot.clone());
        debug!(run_id = %id, "Run registered");

        RunHandle { id, slot }
    }

    fn slot(&self, id: &str) -> Option<Arc<RunSlot>> {
        self.runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
    }

    /// Read a run from `cursor` onwards. Returns `None` for an unknown id.
    ///
    /// Idempotent: re-reading with the same cursor returns the same events
    /// (plus any appended since). A cursor past the end yields no events.
    pub fn read_since(&self, id: &str, cursor: usize) -> Option<RunSnapshot> {
        let slot = self.slot(id)?;
        let state = slot.lock();
        let record = &state.record;
        let start = cursor.min(state.events.len());

        Some(RunSnapshot {
            id: record.id.clone(),
            status: record.status,
            task: record.task.clone(),
            workspace: record.workspace.display().to_string(),
            created_at: record.created_at,
            started_at: record.started_at,
            finished_at: record.finished_at,
            final_answer: record.final_answer.clone(),
            error: record.error.clone(),
            progress_pct: record.progress_pct,
            phase: record.phase,
            events: state.events[start..].to_vec(),
            next_index: state.events.len(),
        })
    }

    /// Full record of one run.
    pub fn get(&self, id: &str) -> Option<RunRecord> {
        self.slot(id).map(|slot| slot.lock().record.clone())
    }

    /// All runs, newest first.
    pub fn list_runs(&self) -> Vec<RunSummary> {
        let slots: Vec<Arc<RunSlot>> = self
            .runs
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .cloned()
            .collect();

        let mut rows: Vec<(u64, RunSummary)> = slots
            .iter()
            .map(|slot| (slot.seq, RunSummary::from(&slot.lock().record)))
            .collect();
        rows.sort_by(|a, b| {
            b.1.created_at
                .cmp(&a.1.created_at)
                .then_with(|| b.0.cmp(&a.0))
        });
        rows.into_iter().map(|(_, summary)| summary).collect()
    }

    /// A receiver that changes whenever the run appends an event or finishes.
    pub fn subscribe(&self, id: &str) -> Option<watch::Receiver<usize>> {
        self.slot(id).map(|slot| slot.notify.subscribe())
    }

    /// Request cancellation of a running run.
    pub fn cancel(&self, id: &str) -> CancelOutcome {
        let Some(slot) = self.slot(id) else {
            return CancelOutcome::NotFound;
        };
        if slot.lock().record.status.is_terminal() {
            return CancelOutcome::AlreadyFinished;
        }
        slot.cancel.cancel();
        debug!(run_id = %id, "Run cancellation requested");
        CancelOutcome::Cancelled
    }

    pub fn len(&self) -> usize {
        self.runs.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Writer side of one run. Owned by the run's orchestrator.
#[derive(Clone)]
pub struct RunHandle {
    id: String,
    slot: Arc<RunSlot>,
}

impl RunHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Append an event and return its index.
    pub fn emit(&self, kind: EventKind) -> usize {
        let len = {
            let mut state = self.slot.lock();
            let index = state.events.len();
            state.events.push(RunEvent {
                index,
                timestamp: Utc::now(),
                kind,
            });
            index + 1
        };
        self.slot.notify.send_replace(len);
        len - 1
    }

    /// Snapshot of the run's record.
    pub fn record(&self) -> RunRecord {
        self.slot.lock().record.clone()
    }

    pub fn status(&self) -> RunStatus {
        self.slot.lock().record.status
    }

    pub fn mark_started(&self) {
        let mut state = self.slot.lock();
        if state.record.started_at.is_none() {
            state.record.started_at = Some(Utc::now());
        }
    }

    /// Update the progress shown to pollers. Percentage never decreases.
    pub fn set_progress(&self, progress_pct: u8, phase: Phase) {
        let mut state = self.slot.lock();
        state.record.progress_pct = state.record.progress_pct.max(progress_pct.min(100));
        state.record.phase = phase;
    }

    /// Move to `completed`. Returns `false` if the run had already finished.
    pub fn complete(&self, final_answer: Option<String>) -> bool {
        self.close(Closing::new(RunStatus::Completed).with_answer(final_answer))
    }

    /// Move to `error`. Returns `false` if the run had already finished.
    pub fn fail(&self, message: impl Into<String>) -> bool {
        self.close(Closing::new(RunStatus::Error).with_error(message))
    }

    /// Append the closing events, final progress and terminal status under
    /// one lock, so readers see all of them or none.
    ///
    /// Returns `false` (appending nothing) if the run had already finished.
    pub fn close(&self, closing: Closing) -> bool {
        let len = {
            let mut state = self.slot.lock();
            if state.record.status.is_terminal() {
                warn!(
                    run_id = %self.id,
                    current = %state.record.status,
                    requested = %closing.status,
                    "Ignoring second terminal transition"
                );
                return false;
            }
            let now = Utc::now();
            for kind in closing.events {
                let index = state.events.len();
                state.events.push(RunEvent {
                    index,
                    timestamp: now,
                    kind,
                });
            }
            let record = &mut state.record;
            if let Some((progress_pct, phase)) = closing.progress {
                record.progress_pct = record.progress_pct.max(progress_pct.min(100));
                record.phase = phase;
            }
            record.status = closing.status;
            record.final_answer = closing.final_answer;
            record.error = closing.error;
            record.finished_at = Some(now);
            state.events.len()
        };
        self.slot.notify.send_replace(len);
        true
    }

    /// Token cancelled by [`RunRegistry::cancel`].
    pub fn cancellation_token(&self) -> CancellationToken {
        self.slot.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.slot.cancel.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_run(task: &str) -> NewRun {
        NewRun {
            task: task.into(),
            workspace: PathBuf::from("/tmp/ws"),
            image_path: None,
            config: GenerationConfig::default(),
        }
    }

    fn note(n: usize) -> EventKind {
        EventKind::MemoryContextUsed { memory_entries: n }
    }

    #[test]
    fn indices_are_gapless_from_zero() {
        let registry = RunRegistry::new();
        let handle = registry.create_run(new_run("t"));
        assert_eq!(handle.emit(note(0)), 0);
        assert_eq!(handle.emit(note(1)), 1);
        assert_eq!(handle.emit(note(2)), 2);

        let snap = registry.read_since(handle.id(), 0).unwrap();
        let indices: Vec<usize> = snap.events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(snap.next_index, 3);
        assert_eq!(snap.status, RunStatus::Running);
    }

    #[test]
    fn cursor_reads_concatenate_without_gaps_or_duplicates() {
        let registry = RunRegistry::new();
        let handle = registry.create_run(new_run("t"));
        let mut seen = Vec::new();
        let mut cursor = 0;

        for batch in 0..4 {
            for i in 0..batch {
                handle.emit(note(i));
            }
            let snap = registry.read_since(handle.id(), cursor).unwrap();
            seen.extend(snap.events.iter().map(|e| e.index));
            cursor = snap.next_index;
        }

        assert_eq!(seen, (0..6).collect::<Vec<_>>());
    }

    #[test]
    fn stale_cursor_is_idempotent_and_future_cursor_is_empty() {
        let registry = RunRegistry::new();
        let handle = registry.create_run(new_run("t"));
        handle.emit(note(0));
        handle.emit(note(1));

        let a = registry.read_since(handle.id(), 1).unwrap();
        let b = registry.read_since(handle.id(), 1).unwrap();
        assert_eq!(a.events, b.events);

        let future = registry.read_since(handle.id(), 99).unwrap();
        assert!(future.events.is_empty());
        assert_eq!(future.next_index, 2);
    }

    #[test]
    fn unknown_run_is_none() {
        let registry = RunRegistry::new();
        assert!(registry.read_since("nope", 0).is_none());
        assert_eq!(registry.cancel("nope"), CancelOutcome::NotFound);
    }

    #[test]
    fn terminal_transition_happens_once() {
        let registry = RunRegistry::new();
        let handle = registry.create_run(new_run("t"));
        assert!(handle.complete(Some("done".into())));
        assert!(!handle.fail("late failure"));

        let record = registry.get(handle.id()).unwrap();
        assert_eq!(record.status, RunStatus::Completed);
        assert_eq!(record.final_answer.as_deref(), Some("done"));
        assert!(record.error.is_none());
        assert!(record.finished_at.is_some());
        assert_eq!(registry.cancel(handle.id()), CancelOutcome::AlreadyFinished);
    }

    #[test]
    fn closing_publishes_events_progress_and_status_together() {
        let registry = RunRegistry::new();
        let handle = registry.create_run(new_run("t"));
        handle.emit(note(0));
        let mut rx = registry.subscribe(handle.id()).unwrap();

        let closed = handle.close(
            Closing::new(RunStatus::Completed)
                .with_answer(Some("42".into()))
                .with_progress(100, Phase::Completed)
                .with_event(note(1))
                .with_event(EventKind::RunCompleted {
                    final_answer: "42".into(),
                    step: 1,
                }),
        );
        assert!(closed);
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), 3);

        let snap = registry.read_since(handle.id(), 1).unwrap();
        assert_eq!(snap.status, RunStatus::Completed);
        assert_eq!(snap.progress_pct, 100);
        assert_eq!(snap.phase, Phase::Completed);
        assert_eq!(snap.final_answer.as_deref(), Some("42"));
        let indices: Vec<usize> = snap.events.iter().map(|e| e.index).collect();
        assert_eq!(indices, vec![1, 2]);
        assert!(snap.events[1].kind.is_terminal());

        let again = handle.close(
            Closing::new(RunStatus::Error)
                .with_error("late")
                .with_event(EventKind::RunError {
                    message: "late".into(),
                }),
        );
        assert!(!again);
        let snap = registry.read_since(handle.id(), 0).unwrap();
        assert_eq!(snap.next_index, 3);
        assert_eq!(snap.status, RunStatus::Completed);
        assert!(snap.error.is_none());
    }

    #[test]
    fn progress_never_decreases() {
        let registry = RunRegistry::new();
        let handle = registry.create_run(new_run("t"));
        handle.set_progress(40, Phase::Discovery);
        handle.set_progress(20, Phase::Error);
        let record = handle.record();
        assert_eq!(record.progress_pct, 40);
        assert_eq!(record.phase, Phase::Error);
    }

    #[test]
    fn list_runs_newest_first() {
        let registry = RunRegistry::new();
        let first = registry.create_run(new_run("first"));
        let second = registry.create_run(new_run("second"));
        let ids: Vec<String> = registry.list_runs().into_iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id().to_string(), first.id().to_string()]);
    }

    #[test]
    fn cancel_trips_token() {
        let registry = RunRegistry::new();
        let handle = registry.create_run(new_run("t"));
        assert!(!handle.is_cancelled());
        assert_eq!(registry.cancel(handle.id()), CancelOutcome::Cancelled);
        assert!(handle.is_cancelled());
    }

    #[tokio::test]
    async fn subscribers_wake_on_append() {
        let registry = RunRegistry::new();
        let handle = registry.create_run(new_run("t"));
        let mut rx = registry.subscribe(handle.id()).unwrap();

        let writer = handle.clone();
        tokio::spawn(async move {
            writer.emit(note(0));
        });

        rx.changed().await.unwrap();
        assert_eq!(*rx.borrow(), 1);
    }

    #[test]
    fn concurrent_appends_stay_gapless() {
        let registry = Arc::new(RunRegistry::new());
        let handle = registry.create_run(new_run("t"));

        let threads: Vec<_> = (0..4)
            .map(|_| {
                let h = handle.clone();
                std::thread::spawn(move || {
                    for i in 0..50 {
                        h.emit(note(i));
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        let snap = registry.read_since(handle.id(), 0).unwrap();
        assert_eq!(snap.next_index, 200);
        assert!(snap.events.iter().enumerate().all(|(i, e)| e.index == i));
    }
}
