//! Background indexing coordinator.
//!
//! One [`IndexingCoordinator`] per process owns at most one active run. It is
//! constructed explicitly at startup and shared by `Arc`; there is no global
//! instance.
//!
//! The running flag lives in the coordinator's own state and is written under
//! its mutex before the session task is spawned, so `get_status()` reports a
//! run the instant `start()` returns. Session events are drained by a single
//! pump task per run and applied to the status display in emission order.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

use crate::chunker::ProjectRef;
use crate::error::{IndexError, Result};
use crate::pipeline::PipelineOptions;
use crate::session::{IndexStats, Session, SessionEvent, SessionFactory};
use crate::status::{NoopDisplay, StatusDisplay};

/// What to index and how.
#[derive(Debug, Clone)]
pub struct StartOptions {
    pub project: ProjectRef,
    pub pipeline: PipelineOptions,
    /// Drop everything indexed so far before running.
    pub rebuild: bool,
}

impl StartOptions {
    pub fn new(project: ProjectRef) -> Self {
        Self {
            project,
            pipeline: PipelineOptions::default(),
            rebuild: false,
        }
    }

    pub fn with_pipeline(mut self, pipeline: PipelineOptions) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn with_rebuild(mut self, rebuild: bool) -> Self {
        self.rebuild = rebuild;
        self
    }
}

/// Snapshot returned by [`IndexingCoordinator::get_status`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexingRunStatus {
    pub running: bool,
    pub project_name: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    /// A cancel was requested and the session has not confirmed it yet.
    pub cancelling: bool,
}

/// How the most recent run ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed(IndexStats),
    Cancelled { embedded: usize },
    Failed(String),
}

struct ActiveRun {
    id: u64,
    project_name: String,
    started_at: DateTime<Utc>,
    session: Arc<dyn Session>,
    cancelling: bool,
}

#[derive(Default)]
struct State {
    active: Option<ActiveRun>,
    next_id: u64,
    last_outcome: Option<RunOutcome>,
}

struct Shared {
    state: Mutex<State>,
    running: watch::Sender<bool>,
    display: Arc<dyn StatusDisplay>,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_current(&self, id: u64) -> bool {
        self.lock().active.as_ref().map(|run| run.id) == Some(id)
    }

    /// Retire run `id` if it is still the active one.
    fn retire(&self, id: u64, outcome: RunOutcome) {
        let mut state = self.lock();
        if state.active.as_ref().map(|run| run.id) != Some(id) {
            debug!(run = id, "Ignoring outcome of a discarded run");
            return;
        }
        state.active = None;
        state.last_outcome = Some(outcome);
        self.running.send_replace(false);
    }

    /// Apply one session event. Returns true once the run is retired.
    fn apply(&self, id: u64, event: SessionEvent) -> bool {
        if !self.is_current(id) {
            return false;
        }

        let outcome = match event {
            SessionEvent::Stage(stage) => {
                self.display.set_stage(&stage);
                return false;
            }
            SessionEvent::Progress(progress) => {
                self.display.update(&progress);
                return false;
            }
            SessionEvent::Completed(stats) => {
                self.display.show_success(&stats);
                RunOutcome::Completed(stats)
            }
            SessionEvent::Cancelled { embedded } => {
                self.display.show_cancelled();
                RunOutcome::Cancelled { embedded }
            }
            SessionEvent::Error(message) => {
                self.display.show_error(&message);
                RunOutcome::Failed(message)
            }
        };
        self.retire(id, outcome);
        true
    }
}

/// Owns and tracks the single background indexing run.
pub struct IndexingCoordinator {
    factory: Arc<dyn SessionFactory>,
    shared: Arc<Shared>,
}

impl IndexingCoordinator {
    pub fn new(factory: Arc<dyn SessionFactory>) -> Self {
        Self::with_display(factory, Arc::new(NoopDisplay))
    }

    pub fn with_display(factory: Arc<dyn SessionFactory>, display: Arc<dyn StatusDisplay>) -> Self {
        let (running, _) = watch::channel(false);
        Self {
            factory,
            shared: Arc::new(Shared {
                state: Mutex::new(State::default()),
                running,
                display,
            }),
        }
    }

    /// Start indexing in the background.
    ///
    /// Fails with [`IndexError::AlreadyRunning`] and changes nothing if a run
    /// is active. Must be called from within a tokio runtime.
    pub fn start(&self, options: StartOptions) -> Result<IndexingRunStatus> {
        let handle = tokio::runtime::Handle::try_current().map_err(|_| {
            IndexError::Validation("indexing must be started inside a tokio runtime".to_string())
        })?;

        let project_name = options.project.name.clone();
        let (tx, rx) = mpsc::unbounded_channel();

        let (id, session, status) = {
            let mut state = self.shared.lock();
            if let Some(active) = &state.active {
                return Err(IndexError::AlreadyRunning {
                    project_name: active.project_name.clone(),
                });
            }

            let session = self.factory.create(&options, tx)?;
            let id = state.next_id;
            state.next_id += 1;
            let started_at = Utc::now();
            state.active = Some(ActiveRun {
                id,
                project_name: project_name.clone(),
                started_at,
                session: session.clone(),
                cancelling: false,
            });
            self.shared.running.send_replace(true);

            let status = IndexingRunStatus {
                running: true,
                project_name: Some(project_name.clone()),
                started_at: Some(started_at),
                cancelling: false,
            };
            (id, session, status)
        };

        info!(project = %project_name, run = id, "Background indexing started");
        self.shared.display.show(&project_name);
        handle.spawn(drive(self.shared.clone(), id, session, rx));
        Ok(status)
    }

    /// Current run state. Never blocks on the session.
    pub fn get_status(&self) -> IndexingRunStatus {
        let state = self.shared.lock();
        match &state.active {
            Some(run) => IndexingRunStatus {
                running: true,
                project_name: Some(run.project_name.clone()),
                started_at: Some(run.started_at),
                cancelling: run.cancelling,
            },
            None => IndexingRunStatus::default(),
        }
    }

    pub fn is_running(&self) -> bool {
        self.shared.lock().active.is_some()
    }

    /// Request cancellation of the active run.
    ///
    /// Returns false when idle. Otherwise signals the session and returns
    /// true right away; the run stays visible (with `cancelling` set) until
    /// the session reports its terminal event.
    pub fn cancel(&self) -> bool {
        let session = {
            let mut state = self.shared.lock();
            let Some(run) = state.active.as_mut() else {
                return false;
            };
            if !run.cancelling {
                info!(project = %run.project_name, run = run.id, "Cancelling indexing");
            }
            run.cancelling = true;
            run.session.clone()
        };
        session.cancel();
        true
    }

    /// Forget the active run without stopping it. Its later events are
    /// ignored. Returns whether a run was discarded.
    pub fn reset(&self) -> bool {
        let discarded = {
            let mut state = self.shared.lock();
            let discarded = state.active.take();
            self.shared.running.send_replace(false);
            discarded
        };
        match discarded {
            Some(run) => {
                warn!(project = %run.project_name, run = run.id, "Discarded active indexing run");
                if self.shared.display.is_active() {
                    self.shared.display.hide();
                }
                true
            }
            None => false,
        }
    }

    /// Resolve once no run is active.
    pub async fn wait_idle(&self) {
        let mut rx = self.shared.running.subscribe();
        // The sender lives as long as `self`, so this cannot fail.
        let _ = rx.wait_for(|running| !*running).await;
    }

    pub fn last_outcome(&self) -> Option<RunOutcome> {
        self.shared.lock().last_outcome.clone()
    }
}

/// Runs the session while pumping its events to the display.
async fn drive(
    shared: Arc<Shared>,
    id: u64,
    session: Arc<dyn Session>,
    mut events: mpsc::UnboundedReceiver<SessionEvent>,
) {
    let mut retired = false;
    {
        let run = session.run();
        tokio::pin!(run);
        loop {
            tokio::select! {
                biased;
                Some(event) = events.recv() => {
                    retired |= shared.apply(id, event);
                }
                _ = &mut run => break,
            }
        }
    }

    while let Ok(event) = events.try_recv() {
        retired |= shared.apply(id, event);
    }

    if !retired {
        warn!(run = id, "Indexing session ended without reporting an outcome");
        if shared.is_current(id) {
            shared
                .display
                .show_error("session finished without reporting an outcome");
        }
        shared.retire(
            id,
            RunOutcome::Failed("session finished without reporting an outcome".to_string()),
        );
    }
}
