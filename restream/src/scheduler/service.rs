//! Scheduler service implementation.

use std::sync::{Arc, Weak};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, Notify, broadcast, mpsc};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::queue::AdmissionQueue;
use super::reconciler::StatusReconciler;
use super::registry::{Session, SessionRegistry};
use crate::database::repositories::StreamRepository;
use crate::domain::{StreamDefinition, StreamUpdate};
use crate::launcher::{ExitOutcome, LaunchError, SessionLauncher};

/// Event channel capacity.
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Configuration for the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum sessions running at once. Fixed for the scheduler's lifetime.
    pub max_concurrent: usize,
    /// How long `shutdown` waits for terminated sessions to report their exit.
    pub shutdown_timeout: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 2,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

/// Result of a successful start request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    /// A process was spawned.
    Started,
    /// The host is at capacity; the stream waits at `position` (1-based).
    Queued { position: usize },
}

/// Result of a successful stop request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StopOutcome {
    /// Termination was requested; the exit is confirmed asynchronously.
    Stopped,
    /// The stream was waiting in the queue and has been removed.
    Cancelled,
}

/// Scheduler error taxonomy.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("Stream not found: {0}")]
    NotFound(String),

    #[error("Stream {0} belongs to another user")]
    Forbidden(String),

    #[error("Stream is already running: {0}")]
    AlreadyRunning(String),

    #[error("Stream is already pending in the queue: {0}")]
    AlreadyQueued(String),

    #[error("Stream is not running: {0}")]
    NotRunning(String),

    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("Scheduler is shutting down")]
    ShuttingDown,

    #[error("Scheduler invariant violated: {0}")]
    InvariantViolation(String),

    #[error("Record store error: {0}")]
    Store(#[source] crate::Error),
}

/// Occupancy report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueStatus {
    pub active_count: usize,
    pub queue_count: usize,
    pub max_concurrent: usize,
    /// Queued stream ids in promotion order.
    pub queued_ids: Vec<String>,
}

/// Events emitted by the scheduler.
#[derive(Debug, Clone)]
pub enum SchedulerEvent {
    /// A process was spawned and registered.
    SessionStarted {
        stream_id: String,
        session_id: String,
        pid: Option<u32>,
    },
    /// A start request was deferred.
    StreamQueued { stream_id: String, position: usize },
    /// A queued stream was removed before it ran.
    QueueCancelled { stream_id: String },
    /// Termination was requested for a running session.
    StopRequested {
        stream_id: String,
        session_id: String,
    },
    /// A session's process ended and the session was torn down.
    SessionExited {
        stream_id: String,
        session_id: String,
        outcome: ExitOutcome,
    },
    /// A queued stream could not be promoted and was dropped from the queue.
    PromotionSkipped { stream_id: String, reason: String },
}

/// Summary returned by [`Scheduler::shutdown`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ShutdownReport {
    /// Sessions that were asked to terminate.
    pub terminated: usize,
    /// Queued streams that were dropped.
    pub dropped_queued: usize,
    /// Sessions that had not reported their exit when the timeout elapsed.
    pub remaining: usize,
}

/// Exit notice sent from a process watcher to the scheduler.
#[derive(Debug)]
struct ExitNotice {
    stream_id: String,
    session_id: String,
    outcome: ExitOutcome,
}

/// Registry and queue, always mutated together under one lock.
struct SchedulerState {
    registry: SessionRegistry,
    queue: AdmissionQueue,
    /// Cleared once shutdown begins.
    accepting: bool,
}

/// Stream-session scheduler and process supervisor.
///
/// Admits start requests up to `max_concurrent` running sessions and queues
/// the rest in FIFO order. Every mutation of the registry/queue pair
/// (start, stop, exit handling, promotion, shutdown) happens under a single
/// async mutex, so both structures are always observed consistently.
///
/// Process exits arrive on watcher tasks and are forwarded as messages to a
/// dedicated exit loop, which re-acquires the lock before tearing the session
/// down and promoting queued work.
pub struct Scheduler {
    config: SchedulerConfig,
    repo: Arc<dyn StreamRepository>,
    launcher: Arc<dyn SessionLauncher>,
    reconciler: StatusReconciler,
    state: Mutex<SchedulerState>,
    exit_tx: mpsc::UnboundedSender<ExitNotice>,
    event_tx: broadcast::Sender<SchedulerEvent>,
    /// Signalled whenever the registry becomes empty.
    drained: Notify,
}

impl Scheduler {
    /// Create the scheduler and start its exit loop.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: SchedulerConfig,
        repo: Arc<dyn StreamRepository>,
        launcher: Arc<dyn SessionLauncher>,
    ) -> Arc<Self> {
        let (exit_tx, exit_rx) = mpsc::unbounded_channel();
        let (event_tx, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        info!(
            max_concurrent = config.max_concurrent,
            launcher = launcher.name(),
            "Scheduler initialized"
        );

        Arc::new_cyclic(|weak| {
            Self::spawn_exit_loop(weak.clone(), exit_rx);

            Self {
                reconciler: StatusReconciler::new(repo.clone()),
                config,
                repo,
                launcher,
                state: Mutex::new(SchedulerState {
                    registry: SessionRegistry::new(),
                    queue: AdmissionQueue::new(),
                    accepting: true,
                }),
                exit_tx,
                event_tx,
                drained: Notify::new(),
            }
        })
    }

    fn spawn_exit_loop(scheduler: Weak<Self>, mut exit_rx: mpsc::UnboundedReceiver<ExitNotice>) {
        tokio::spawn(async move {
            while let Some(notice) = exit_rx.recv().await {
                let Some(scheduler) = scheduler.upgrade() else {
                    break;
                };
                scheduler.handle_exit(notice).await;
            }
            debug!("Scheduler exit loop finished");
        });
    }

    /// Subscribe to scheduler events.
    pub fn subscribe(&self) -> broadcast::Receiver<SchedulerEvent> {
        self.event_tx.subscribe()
    }

    pub fn max_concurrent(&self) -> usize {
        self.config.max_concurrent
    }

    /// Reset statuses left `active` by a previous run.
    pub async fn reconcile_persisted_status(&self) -> crate::Result<u64> {
        self.reconciler.reset_stale().await
    }

    // ========== Boundary operations ==========

    /// Request a stream to start on behalf of `caller_id`.
    ///
    /// Returns once the process is spawned or the request is queued, never
    /// waiting for streaming to finish.
    pub async fn start(
        &self,
        stream_id: &str,
        caller_id: &str,
    ) -> Result<StartOutcome, SchedulerError> {
        let mut state = self.state.lock().await;
        if !state.accepting {
            return Err(SchedulerError::ShuttingDown);
        }

        // Loaded under the lock so a concurrent delete cannot slip between
        // the lookup and the launch.
        let definition = self.load_owned(stream_id, caller_id).await?;
        self.admit(&mut state, &definition).await
    }

    /// Request a stream to stop on behalf of `caller_id`.
    ///
    /// Returns once termination is requested. The persisted status flips to
    /// `inactive` only when the process exit is observed.
    pub async fn stop(&self, stream_id: &str, caller_id: &str) -> Result<StopOutcome, SchedulerError> {
        let mut state = self.state.lock().await;
        self.load_owned(stream_id, caller_id).await?;
        self.stop_locked(&mut state, stream_id)
    }

    /// Stop or cancel the stream if needed, then delete its definition.
    pub async fn delete(&self, stream_id: &str, caller_id: &str) -> Result<(), SchedulerError> {
        let mut state = self.state.lock().await;
        self.load_owned(stream_id, caller_id).await?;

        match self.stop_locked(&mut state, stream_id) {
            Ok(_) | Err(SchedulerError::NotRunning(_)) => {}
            Err(e) => return Err(e),
        }

        self.repo
            .delete_stream(stream_id)
            .await
            .map_err(|e| Self::store_error(stream_id, e))?;
        info!(stream_id = %stream_id, "Stream deleted");
        Ok(())
    }

    /// Apply a partial change to an idle stream.
    ///
    /// Streams that are running (including ones still stopping) or queued
    /// are refused, since their process or pending launch already captured
    /// the current settings.
    pub async fn update(
        &self,
        stream_id: &str,
        caller_id: &str,
        update: StreamUpdate,
    ) -> Result<StreamDefinition, SchedulerError> {
        let state = self.state.lock().await;
        let mut definition = self.load_owned(stream_id, caller_id).await?;

        if state.registry.contains(stream_id) {
            return Err(SchedulerError::AlreadyRunning(stream_id.to_string()));
        }
        if state.queue.contains(stream_id) {
            return Err(SchedulerError::AlreadyQueued(stream_id.to_string()));
        }

        update.apply_to(&mut definition);
        self.repo
            .update_stream(&definition)
            .await
            .map_err(|e| Self::store_error(stream_id, e))?;

        info!(
            stream_id = %stream_id,
            destination = %definition.destination,
            "Stream updated"
        );
        Ok(definition)
    }

    /// Current occupancy.
    pub async fn queue_status(&self) -> QueueStatus {
        let state = self.state.lock().await;
        QueueStatus {
            active_count: state.registry.size(),
            queue_count: state.queue.len(),
            max_concurrent: self.config.max_concurrent,
            queued_ids: state.queue.ids(),
        }
    }

    /// Ids of streams with a registered session.
    pub async fn running_ids(&self) -> Vec<String> {
        self.state.lock().await.registry.ids()
    }

    pub async fn is_running(&self, stream_id: &str) -> bool {
        self.state.lock().await.registry.contains(stream_id)
    }

    /// Teardown hook: stop accepting work, drop the queue, terminate every
    /// running session and wait (bounded) for their exits to be processed.
    pub async fn shutdown(&self) -> ShutdownReport {
        let (terminated, dropped_queued) = {
            let mut state = self.state.lock().await;
            state.accepting = false;
            let dropped = state.queue.clear();
            for session in state.registry.sessions() {
                session.terminate();
            }
            (state.registry.size(), dropped.len())
        };

        info!(
            terminated,
            dropped_queued, "Scheduler shutting down, waiting for sessions to exit"
        );

        let deadline = Instant::now() + self.config.shutdown_timeout;
        let remaining = loop {
            let drained = self.drained.notified();
            let remaining = self.state.lock().await.registry.size();
            if remaining == 0 {
                break 0;
            }
            if tokio::time::timeout_at(deadline, drained).await.is_err() {
                warn!(remaining, "Timed out waiting for sessions to exit");
                break remaining;
            }
        };

        ShutdownReport {
            terminated,
            dropped_queued,
            remaining,
        }
    }

    // ========== Admission ==========

    async fn load_owned(
        &self,
        stream_id: &str,
        caller_id: &str,
    ) -> Result<StreamDefinition, SchedulerError> {
        let definition = self
            .repo
            .get_stream(stream_id)
            .await
            .map_err(|e| Self::store_error(stream_id, e))?;

        if !definition.is_owned_by(caller_id) {
            return Err(SchedulerError::Forbidden(stream_id.to_string()));
        }
        Ok(definition)
    }

    fn store_error(stream_id: &str, err: crate::Error) -> SchedulerError {
        if err.is_not_found() {
            SchedulerError::NotFound(stream_id.to_string())
        } else {
            SchedulerError::Store(err)
        }
    }

    /// Admit now or enqueue. Caller holds the state lock.
    async fn admit(
        &self,
        state: &mut SchedulerState,
        definition: &StreamDefinition,
    ) -> Result<StartOutcome, SchedulerError> {
        let stream_id = definition.id.as_str();
        let running = state.registry.contains(stream_id);
        let queued = state.queue.contains(stream_id);

        if running && queued {
            return Err(Self::invariant_violation(stream_id));
        }
        if running {
            return Err(SchedulerError::AlreadyRunning(stream_id.to_string()));
        }
        if queued {
            return Err(SchedulerError::AlreadyQueued(stream_id.to_string()));
        }

        if state.registry.size() >= self.config.max_concurrent {
            let position = state
                .queue
                .enqueue(stream_id)
                .map_err(|_| SchedulerError::AlreadyQueued(stream_id.to_string()))?;

            info!(
                stream_id = %stream_id,
                position,
                "Host at capacity, stream queued"
            );
            let _ = self.event_tx.send(SchedulerEvent::StreamQueued {
                stream_id: stream_id.to_string(),
                position,
            });
            return Ok(StartOutcome::Queued { position });
        }

        self.launch_session(state, definition).await?;
        Ok(StartOutcome::Started)
    }

    /// Spawn, register, persist `active` and wire the exit notice.
    async fn launch_session(
        &self,
        state: &mut SchedulerState,
        definition: &StreamDefinition,
    ) -> Result<(), SchedulerError> {
        let stream_id = definition.id.clone();
        let mut handle = self.launcher.launch(definition).await?;

        let session_id = uuid::Uuid::new_v4().to_string();
        let exit_tx = self.exit_tx.clone();
        let notice_stream_id = stream_id.clone();
        let notice_session_id = session_id.clone();
        handle.on_exit(move |outcome| async move {
            let _ = exit_tx.send(ExitNotice {
                stream_id: notice_stream_id,
                session_id: notice_session_id,
                outcome,
            });
        });

        let session = Session::new(stream_id.clone(), session_id.clone(), handle);
        let pid = session.pid();
        if let Err(e) = state.registry.put(stream_id.clone(), session) {
            error!(stream_id = %stream_id, "Registry rejected a new session: {}", e);
            return Err(SchedulerError::InvariantViolation(e.to_string()));
        }

        info!(
            stream_id = %stream_id,
            session_id = %session_id,
            pid = ?pid,
            destination = %definition.destination,
            "Session started"
        );

        if let Err(e) = self.reconciler.mark_active(&stream_id).await {
            warn!(stream_id = %stream_id, "Failed to persist active status: {}", e);
        }

        let _ = self.event_tx.send(SchedulerEvent::SessionStarted {
            stream_id,
            session_id,
            pid,
        });
        Ok(())
    }

    // ========== Stop ==========

    fn stop_locked(
        &self,
        state: &mut SchedulerState,
        stream_id: &str,
    ) -> Result<StopOutcome, SchedulerError> {
        let queued = state.queue.contains(stream_id);

        if queued && state.registry.contains(stream_id) {
            return Err(Self::invariant_violation(stream_id));
        }

        if queued {
            state.queue.remove(stream_id);
            info!(stream_id = %stream_id, "Queued stream cancelled");
            let _ = self.event_tx.send(SchedulerEvent::QueueCancelled {
                stream_id: stream_id.to_string(),
            });
            return Ok(StopOutcome::Cancelled);
        }

        match state.registry.get(stream_id) {
            Some(session) if !session.is_terminating() => {
                session.terminate();
                info!(
                    stream_id = %stream_id,
                    session_id = %session.session_id,
                    "Stop requested"
                );
                let _ = self.event_tx.send(SchedulerEvent::StopRequested {
                    stream_id: stream_id.to_string(),
                    session_id: session.session_id.clone(),
                });
                Ok(StopOutcome::Stopped)
            }
            // Absent, or already stopping and waiting for its exit.
            _ => Err(SchedulerError::NotRunning(stream_id.to_string())),
        }
    }

    // ========== Exit handling and promotion ==========

    async fn handle_exit(&self, notice: ExitNotice) {
        let mut state = self.state.lock().await;

        let current = state
            .registry
            .get(&notice.stream_id)
            .is_some_and(|s| s.session_id == notice.session_id);
        if !current {
            debug!(
                stream_id = %notice.stream_id,
                session_id = %notice.session_id,
                "Ignoring exit notice for a session that is no longer registered"
            );
            return;
        }

        state.registry.remove(&notice.stream_id);

        match &notice.outcome {
            ExitOutcome::Terminated => {
                info!(stream_id = %notice.stream_id, "Session stopped")
            }
            outcome if outcome.is_success() => {
                info!(stream_id = %notice.stream_id, "Session completed")
            }
            outcome => warn!(
                stream_id = %notice.stream_id,
                exit_code = ?outcome.code(),
                "Session ended abnormally: {}",
                outcome
            ),
        }

        match self.reconciler.mark_inactive(&notice.stream_id).await {
            Ok(()) => {}
            Err(e) if e.is_not_found() => {
                debug!(stream_id = %notice.stream_id, "Stream was deleted while running")
            }
            Err(e) => warn!(
                stream_id = %notice.stream_id,
                "Failed to persist inactive status: {}",
                e
            ),
        }

        let _ = self.event_tx.send(SchedulerEvent::SessionExited {
            stream_id: notice.stream_id,
            session_id: notice.session_id,
            outcome: notice.outcome,
        });

        if state.registry.is_empty() {
            self.drained.notify_waiters();
        }

        if state.accepting {
            self.promote(&mut state).await;
        }
    }

    /// Fill free slots from the queue, oldest first. Streams that were
    /// deleted meanwhile, or that fail to launch, are skipped.
    async fn promote(&self, state: &mut SchedulerState) {
        while state.registry.size() < self.config.max_concurrent {
            let Some(stream_id) = state.queue.dequeue() else {
                break;
            };

            if state.registry.contains(&stream_id) {
                let err = Self::invariant_violation(&stream_id);
                self.skip_promotion(stream_id, err.to_string());
                continue;
            }

            let definition = match self.repo.get_stream(&stream_id).await {
                Ok(definition) => definition,
                Err(e) if e.is_not_found() => {
                    debug!(stream_id = %stream_id, "Queued stream was deleted, skipping");
                    self.skip_promotion(stream_id, "stream deleted".to_string());
                    continue;
                }
                Err(e) => {
                    warn!(stream_id = %stream_id, "Failed to load queued stream: {}", e);
                    self.skip_promotion(stream_id, e.to_string());
                    continue;
                }
            };

            info!(stream_id = %stream_id, "Promoting queued stream");
            if let Err(e) = self.launch_session(state, &definition).await {
                warn!(stream_id = %stream_id, "Failed to start queued stream: {}", e);
                self.skip_promotion(stream_id, e.to_string());
            }
        }
    }

    fn skip_promotion(&self, stream_id: String, reason: String) {
        let _ = self
            .event_tx
            .send(SchedulerEvent::PromotionSkipped { stream_id, reason });
    }

    fn invariant_violation(stream_id: &str) -> SchedulerError {
        error!(
            stream_id = %stream_id,
            "Stream is both registered and queued"
        );
        SchedulerError::InvariantViolation(format!(
            "stream {} is both running and queued",
            stream_id
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{Destination, Platform, StreamSource, StreamStatus};
    use crate::launcher::ProcessHandle;
    use async_trait::async_trait;
    use parking_lot::Mutex as SyncMutex;
    use rstest::rstest;
    use std::collections::{HashMap, HashSet};
    use std::path::PathBuf;
    use tokio::sync::oneshot;
    use tokio_util::sync::CancellationToken;

    const OWNER: &str = "owner-1";

    /// Mock stream repository recording every status write.
    #[derive(Default)]
    struct MockStreamRepository {
        streams: SyncMutex<HashMap<String, StreamDefinition>>,
        status_writes: SyncMutex<Vec<(String, StreamStatus)>>,
        fail_updates: SyncMutex<bool>,
        /// Artificial latency for `delete_stream`.
        delete_delay: SyncMutex<Option<Duration>>,
    }

    impl MockStreamRepository {
        fn insert(&self, definition: StreamDefinition) {
            self.streams
                .lock()
                .insert(definition.id.clone(), definition);
        }

        fn writes_for(&self, id: &str, status: StreamStatus) -> usize {
            self.status_writes
                .lock()
                .iter()
                .filter(|(i, s)| i == id && *s == status)
                .count()
        }

        fn status_of(&self, id: &str) -> Option<StreamStatus> {
            self.streams.lock().get(id).map(|d| d.status)
        }
    }

    #[async_trait]
    impl StreamRepository for MockStreamRepository {
        async fn get_stream(&self, id: &str) -> crate::Result<StreamDefinition> {
            self.streams
                .lock()
                .get(id)
                .cloned()
                .ok_or_else(|| crate::Error::not_found("Stream", id))
        }

        async fn list_streams_by_owner(&self, user_id: &str) -> crate::Result<Vec<StreamDefinition>> {
            Ok(self
                .streams
                .lock()
                .values()
                .filter(|d| d.owner_id == user_id)
                .cloned()
                .collect())
        }

        async fn create_stream(&self, stream: &StreamDefinition) -> crate::Result<()> {
            self.insert(stream.clone());
            Ok(())
        }

        async fn update_stream(&self, stream: &StreamDefinition) -> crate::Result<()> {
            match self.streams.lock().get_mut(&stream.id) {
                Some(d) => {
                    let status = d.status;
                    *d = stream.clone();
                    d.status = status;
                    Ok(())
                }
                None => Err(crate::Error::not_found("Stream", &stream.id)),
            }
        }

        async fn update_status(&self, id: &str, status: StreamStatus) -> crate::Result<()> {
            self.status_writes.lock().push((id.to_string(), status));
            if *self.fail_updates.lock() {
                return Err(crate::Error::Database("store unreachable".to_string()));
            }
            match self.streams.lock().get_mut(id) {
                Some(d) => {
                    d.status = status;
                    Ok(())
                }
                None => Err(crate::Error::not_found("Stream", id)),
            }
        }

        async fn delete_stream(&self, id: &str) -> crate::Result<()> {
            let delay = *self.delete_delay.lock();
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            self.streams
                .lock()
                .remove(id)
                .map(|_| ())
                .ok_or_else(|| crate::Error::not_found("Stream", id))
        }

        async fn reset_all_status(&self) -> crate::Result<u64> {
            let mut count = 0;
            for d in self.streams.lock().values_mut() {
                if d.status == StreamStatus::Active {
                    d.status = StreamStatus::Inactive;
                    count += 1;
                }
            }
            Ok(count)
        }
    }

    /// Launcher whose processes run until the test finishes them or they are
    /// terminated.
    #[derive(Default)]
    struct ScriptedLauncher {
        running: SyncMutex<HashMap<String, oneshot::Sender<ExitOutcome>>>,
        launches: SyncMutex<Vec<String>>,
        fail_spawn: SyncMutex<HashSet<String>>,
    }

    impl ScriptedLauncher {
        /// Make the process for `id` exit with `outcome`.
        fn finish(&self, id: &str, outcome: ExitOutcome) {
            let tx = self.running.lock().remove(id).expect("process not running");
            let _ = tx.send(outcome);
        }

        fn launch_count(&self) -> usize {
            self.launches.lock().len()
        }
    }

    #[async_trait]
    impl SessionLauncher for ScriptedLauncher {
        fn name(&self) -> &'static str {
            "scripted"
        }

        async fn launch(&self, definition: &StreamDefinition) -> Result<ProcessHandle, LaunchError> {
            if let StreamSource::UploadedFile { path } = &definition.source {
                if !path.exists() {
                    return Err(LaunchError::SourceUnavailable { path: path.clone() });
                }
            }
            if self.fail_spawn.lock().contains(&definition.id) {
                return Err(LaunchError::LaunchFailed("spawn refused".to_string()));
            }

            let (script_tx, script_rx) = oneshot::channel();
            let (exit_tx, exit_rx) = oneshot::channel();
            let token = CancellationToken::new();

            let cancelled = token.clone();
            tokio::spawn(async move {
                let outcome = tokio::select! {
                    _ = cancelled.cancelled() => ExitOutcome::Terminated,
                    outcome = script_rx => outcome.unwrap_or(ExitOutcome::Terminated),
                };
                let _ = exit_tx.send(outcome);
            });

            self.running.lock().insert(definition.id.clone(), script_tx);
            self.launches.lock().push(definition.id.clone());
            Ok(ProcessHandle::new(Some(1000), token, exit_rx))
        }
    }

    struct Harness {
        scheduler: Arc<Scheduler>,
        repo: Arc<MockStreamRepository>,
        launcher: Arc<ScriptedLauncher>,
        events: broadcast::Receiver<SchedulerEvent>,
    }

    impl Harness {
        fn new(max_concurrent: usize) -> Self {
            let repo = Arc::new(MockStreamRepository::default());
            let launcher = Arc::new(ScriptedLauncher::default());
            let scheduler = Scheduler::new(
                SchedulerConfig {
                    max_concurrent,
                    shutdown_timeout: Duration::from_secs(2),
                },
                repo.clone(),
                launcher.clone(),
            );
            let events = scheduler.subscribe();
            Self {
                scheduler,
                repo,
                launcher,
                events,
            }
        }

        /// Insert a capture-sourced stream owned by `OWNER`.
        fn add_stream(&self, id: &str) {
            let mut def = StreamDefinition::new(
                OWNER,
                Platform::Other,
                StreamSource::LiveCapture {
                    url: format!("rtmp://origin/live/{}", id),
                },
                Destination::new("rtmp://ingest.example.com/live", "key"),
                false,
            );
            def.id = id.to_string();
            self.repo.insert(def);
        }

        async fn wait_for_exit(&mut self, id: &str) -> ExitOutcome {
            loop {
                let event = tokio::time::timeout(Duration::from_secs(5), self.events.recv())
                    .await
                    .expect("timed out waiting for exit")
                    .expect("event channel closed");
                if let SchedulerEvent::SessionExited {
                    stream_id, outcome, ..
                } = event
                {
                    if stream_id == id {
                        return outcome;
                    }
                }
            }
        }

        /// Capacity and exclusivity must hold at every observation point.
        async fn assert_invariants(&self) {
            let status = self.scheduler.queue_status().await;
            let running = self.scheduler.running_ids().await;
            assert!(status.active_count <= status.max_concurrent);
            assert_eq!(status.active_count, running.len());
            for id in &status.queued_ids {
                assert!(!running.contains(id), "{} is both running and queued", id);
            }
        }
    }

    #[tokio::test]
    async fn test_start_under_capacity_runs_immediately() {
        let h = Harness::new(2);
        h.add_stream("a");

        let outcome = h.scheduler.start("a", OWNER).await.unwrap();
        assert_eq!(outcome, StartOutcome::Started);
        assert!(h.scheduler.is_running("a").await);
        assert_eq!(h.repo.status_of("a"), Some(StreamStatus::Active));
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_start_at_capacity_queues_with_position() {
        let h = Harness::new(1);
        for id in ["a", "b", "c"] {
            h.add_stream(id);
        }

        assert_eq!(h.scheduler.start("a", OWNER).await.unwrap(), StartOutcome::Started);
        assert_eq!(
            h.scheduler.start("b", OWNER).await.unwrap(),
            StartOutcome::Queued { position: 1 }
        );
        assert_eq!(
            h.scheduler.start("c", OWNER).await.unwrap(),
            StartOutcome::Queued { position: 2 }
        );

        let status = h.scheduler.queue_status().await;
        assert_eq!(status.active_count, 1);
        assert_eq!(status.queue_count, 2);
        assert_eq!(status.queued_ids, vec!["b", "c"]);
        // Queued streams are never marked active.
        assert_eq!(h.repo.writes_for("b", StreamStatus::Active), 0);
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_fifo_promotion() {
        let mut h = Harness::new(1);
        for id in ["a", "b", "c"] {
            h.add_stream(id);
            h.scheduler.start(id, OWNER).await.unwrap();
        }

        assert_eq!(h.scheduler.stop("a", OWNER).await.unwrap(), StopOutcome::Stopped);
        h.wait_for_exit("a").await;

        let status = h.scheduler.queue_status().await;
        assert_eq!(h.scheduler.running_ids().await, vec!["b"]);
        assert_eq!(status.queued_ids, vec!["c"]);
        h.assert_invariants().await;

        h.scheduler.stop("b", OWNER).await.unwrap();
        h.wait_for_exit("b").await;

        let status = h.scheduler.queue_status().await;
        assert_eq!(h.scheduler.running_ids().await, vec!["c"]);
        assert_eq!(status.queue_count, 0);
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_stop_twice_reports_not_running() {
        let mut h = Harness::new(2);
        h.add_stream("a");
        h.scheduler.start("a", OWNER).await.unwrap();

        assert_eq!(h.scheduler.stop("a", OWNER).await.unwrap(), StopOutcome::Stopped);
        assert!(matches!(
            h.scheduler.stop("a", OWNER).await,
            Err(SchedulerError::NotRunning(_))
        ));

        assert_eq!(h.wait_for_exit("a").await, ExitOutcome::Terminated);
        assert!(matches!(
            h.scheduler.stop("a", OWNER).await,
            Err(SchedulerError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_does_not_persist_inactive_itself() {
        let mut h = Harness::new(1);
        h.add_stream("a");
        h.scheduler.start("a", OWNER).await.unwrap();

        h.scheduler.stop("a", OWNER).await.unwrap();
        h.wait_for_exit("a").await;

        assert_eq!(h.repo.writes_for("a", StreamStatus::Inactive), 1);
        assert_eq!(h.repo.status_of("a"), Some(StreamStatus::Inactive));
    }

    #[tokio::test]
    async fn test_double_start_is_rejected() {
        let h = Harness::new(1);
        h.add_stream("a");
        h.add_stream("b");

        h.scheduler.start("a", OWNER).await.unwrap();
        assert!(matches!(
            h.scheduler.start("a", OWNER).await,
            Err(SchedulerError::AlreadyRunning(_))
        ));

        h.scheduler.start("b", OWNER).await.unwrap();
        assert!(matches!(
            h.scheduler.start("b", OWNER).await,
            Err(SchedulerError::AlreadyQueued(_))
        ));

        assert_eq!(h.launcher.launch_count(), 1);
        h.assert_invariants().await;
    }

    #[tokio::test]
    async fn test_concurrent_starts_spawn_one_session() {
        let h = Harness::new(4);
        h.add_stream("a");

        let (first, second) = tokio::join!(
            h.scheduler.start("a", OWNER),
            h.scheduler.start("a", OWNER)
        );

        let results = [first, second];
        assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
        assert!(
            results
                .iter()
                .any(|r| matches!(r, Err(SchedulerError::AlreadyRunning(_))))
        );
        assert_eq!(h.launcher.launch_count(), 1);
    }

    #[rstest]
    #[case::completed(ExitOutcome::Exited { success: true, code: Some(0) })]
    #[case::crashed(ExitOutcome::Exited { success: false, code: Some(1) })]
    #[case::signalled(ExitOutcome::Exited { success: false, code: None })]
    #[tokio::test]
    async fn test_exit_persists_inactive_once(#[case] outcome: ExitOutcome) {
        let mut h = Harness::new(2);
        h.add_stream("a");
        h.scheduler.start("a", OWNER).await.unwrap();

        h.launcher.finish("a", outcome.clone());
        assert_eq!(h.wait_for_exit("a").await, outcome);

        assert!(!h.scheduler.is_running("a").await);
        assert_eq!(h.repo.writes_for("a", StreamStatus::Active), 1);
        assert_eq!(h.repo.writes_for("a", StreamStatus::Inactive), 1);

        // The stream can run again after exiting.
        assert_eq!(h.scheduler.start("a", OWNER).await.unwrap(), StartOutcome::Started);
    }

    #[tokio::test]
    async fn test_crash_promotes_queued_stream() {
        let mut h = Harness::new(1);
        h.add_stream("a");
        h.add_stream("b");
        h.scheduler.start("a", OWNER).await.unwrap();
        h.scheduler.start("b", OWNER).await.unwrap();

        h.launcher.finish(
            "a",
            ExitOutcome::Exited {
                success: false,
                code: Some(255),
            },
        );
        h.wait_for_exit("a").await;

        assert_eq!(h.scheduler.running_ids().await, vec!["b"]);
        assert_eq!(h.repo.status_of("b"), Some(StreamStatus::Active));
    }

    #[tokio::test]
    async fn test_missing_source_leaves_status_untouched() {
        let h = Harness::new(2);
        let mut def = StreamDefinition::new(
            OWNER,
            Platform::Youtube,
            StreamSource::UploadedFile {
                path: PathBuf::from("/no/such/video.mp4"),
            },
            Destination::new("rtmp://a.rtmp.youtube.com/live2", "key"),
            true,
        );
        def.id = "upload".to_string();
        h.repo.insert(def);

        let err = h.scheduler.start("upload", OWNER).await.unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Launch(LaunchError::SourceUnavailable { .. })
        ));
        assert_eq!(h.repo.writes_for("upload", StreamStatus::Active), 0);
        assert_eq!(h.repo.status_of("upload"), Some(StreamStatus::Inactive));
        assert!(!h.scheduler.is_running("upload").await);
    }

    #[tokio::test]
    async fn test_unknown_and_foreign_streams() {
        let h = Harness::new(1);
        h.add_stream("a");

        assert!(matches!(
            h.scheduler.start("missing", OWNER).await,
            Err(SchedulerError::NotFound(_))
        ));
        assert!(matches!(
            h.scheduler.start("a", "someone-else").await,
            Err(SchedulerError::Forbidden(_))
        ));
        assert!(matches!(
            h.scheduler.stop("a", "someone-else").await,
            Err(SchedulerError::Forbidden(_))
        ));
        assert!(matches!(
            h.scheduler.stop("a", OWNER).await,
            Err(SchedulerError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_stop_cancels_queued_stream() {
        let h = Harness::new(1);
        h.add_stream("a");
        h.add_stream("b");
        h.scheduler.start("a", OWNER).await.unwrap();
        h.scheduler.start("b", OWNER).await.unwrap();

        assert_eq!(h.scheduler.stop("b", OWNER).await.unwrap(), StopOutcome::Cancelled);

        let status = h.scheduler.queue_status().await;
        assert_eq!(status.queue_count, 0);
        assert_eq!(h.repo.writes_for("b", StreamStatus::Inactive), 0);
        assert!(matches!(
            h.scheduler.stop("b", OWNER).await,
            Err(SchedulerError::NotRunning(_))
        ));
    }

    #[tokio::test]
    async fn test_deleted_queued_stream_is_skipped() {
        let mut h = Harness::new(1);
        for id in ["a", "b", "c"] {
            h.add_stream(id);
            h.scheduler.start(id, OWNER).await.unwrap();
        }

        // Simulate deletion behind the scheduler's back.
        h.repo.streams.lock().remove("b");

        h.launcher.finish(
            "a",
            ExitOutcome::Exited {
                success: true,
                code: Some(0),
            },
        );
        h.wait_for_exit("a").await;

        assert_eq!(h.scheduler.running_ids().await, vec!["c"]);
        assert_eq!(h.scheduler.queue_status().await.queue_count, 0);
    }

    #[tokio::test]
    async fn test_failed_promotion_continues_with_next() {
        let mut h = Harness::new(1);
        for id in ["a", "b", "c"] {
            h.add_stream(id);
            h.scheduler.start(id, OWNER).await.unwrap();
        }
        h.launcher.fail_spawn.lock().insert("b".to_string());

        h.scheduler.stop("a", OWNER).await.unwrap();
        h.wait_for_exit("a").await;

        assert_eq!(h.scheduler.running_ids().await, vec!["c"]);
        assert_eq!(h.repo.status_of("b"), Some(StreamStatus::Inactive));
    }

    #[tokio::test]
    async fn test_persistence_failure_does_not_block_scheduling() {
        let mut h = Harness::new(1);
        h.add_stream("a");
        h.add_stream("b");
        *h.repo.fail_updates.lock() = true;

        assert_eq!(h.scheduler.start("a", OWNER).await.unwrap(), StartOutcome::Started);
        h.scheduler.start("b", OWNER).await.unwrap();

        h.scheduler.stop("a", OWNER).await.unwrap();
        h.wait_for_exit("a").await;

        assert_eq!(h.scheduler.running_ids().await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_delete_running_stream_stops_it_first() {
        let mut h = Harness::new(1);
        h.add_stream("a");
        h.scheduler.start("a", OWNER).await.unwrap();

        h.scheduler.delete("a", OWNER).await.unwrap();
        assert_eq!(h.wait_for_exit("a").await, ExitOutcome::Terminated);

        assert!(!h.scheduler.is_running("a").await);
        assert!(matches!(
            h.scheduler.start("a", OWNER).await,
            Err(SchedulerError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_start_racing_delete_never_orphans_a_session() {
        let h = Harness::new(2);
        h.add_stream("a");
        *h.repo.delete_delay.lock() = Some(Duration::from_millis(100));

        let scheduler = h.scheduler.clone();
        let delete = tokio::spawn(async move { scheduler.delete("a", OWNER).await });

        // Let the delete get past its stop step and into the slow row removal.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let started = h.scheduler.start("a", OWNER).await;

        delete.await.unwrap().unwrap();
        assert!(matches!(started, Err(SchedulerError::NotFound(_))));
        assert!(!h.scheduler.is_running("a").await);
        assert_eq!(h.launcher.launch_count(), 0);
    }

    #[tokio::test]
    async fn test_update_refused_while_running_or_queued() {
        let h = Harness::new(1);
        h.add_stream("a");
        h.add_stream("b");
        h.scheduler.start("a", OWNER).await.unwrap();
        h.scheduler.start("b", OWNER).await.unwrap();

        let update = StreamUpdate {
            stream_key: Some("new-key".to_string()),
            ..StreamUpdate::default()
        };
        assert!(matches!(
            h.scheduler.update("a", OWNER, update.clone()).await,
            Err(SchedulerError::AlreadyRunning(_))
        ));
        assert!(matches!(
            h.scheduler.update("b", OWNER, update.clone()).await,
            Err(SchedulerError::AlreadyQueued(_))
        ));
        assert!(matches!(
            h.scheduler.update("b", "someone-else", update).await,
            Err(SchedulerError::Forbidden(_))
        ));
    }

    #[tokio::test]
    async fn test_update_idle_stream() {
        let h = Harness::new(1);
        h.add_stream("a");

        let updated = h
            .scheduler
            .update(
                "a",
                OWNER,
                StreamUpdate {
                    platform: Some(Platform::Tiktok),
                    loop_enabled: Some(true),
                    ..StreamUpdate::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.platform, Platform::Tiktok);
        let stored = h.repo.streams.lock().get("a").cloned().unwrap();
        assert_eq!(stored.platform, Platform::Tiktok);
        assert!(stored.loop_enabled);
        assert_eq!(stored.status, StreamStatus::Inactive);
    }

    #[tokio::test]
    async fn test_random_sequences_keep_invariants() {
        let h = Harness::new(2);
        let ids = ["a", "b", "c", "d", "e"];
        for id in ids {
            h.add_stream(id);
        }

        // Deterministic pseudo-random walk over start/stop requests.
        let mut seed: u64 = 0x9e37_79b9_7f4a_7c15;
        for _ in 0..200 {
            seed ^= seed << 13;
            seed ^= seed >> 7;
            seed ^= seed << 17;
            let id = ids[(seed % ids.len() as u64) as usize];
            if seed & 0x100 == 0 {
                let _ = h.scheduler.start(id, OWNER).await;
            } else {
                let _ = h.scheduler.stop(id, OWNER).await;
            }
            tokio::task::yield_now().await;
            h.assert_invariants().await;
        }
    }

    #[tokio::test]
    async fn test_shutdown_terminates_everything() {
        let h = Harness::new(2);
        for id in ["a", "b", "c"] {
            h.add_stream(id);
            h.scheduler.start(id, OWNER).await.unwrap();
        }

        let report = h.scheduler.shutdown().await;
        assert_eq!(
            report,
            ShutdownReport {
                terminated: 2,
                dropped_queued: 1,
                remaining: 0,
            }
        );

        assert!(h.scheduler.running_ids().await.is_empty());
        assert_eq!(h.repo.status_of("a"), Some(StreamStatus::Inactive));
        assert_eq!(h.repo.status_of("c"), Some(StreamStatus::Inactive));
        // Nothing was promoted while shutting down.
        assert_eq!(h.launcher.launch_count(), 2);
        assert!(matches!(
            h.scheduler.start("c", OWNER).await,
            Err(SchedulerError::ShuttingDown)
        ));
    }

    #[tokio::test]
    async fn test_reconcile_resets_stale_active() {
        let h = Harness::new(1);
        h.add_stream("a");
        h.repo.streams.lock().get_mut("a").unwrap().status = StreamStatus::Active;

        assert_eq!(h.scheduler.reconcile_persisted_status().await.unwrap(), 1);
        assert_eq!(h.repo.status_of("a"), Some(StreamStatus::Inactive));
    }
}
