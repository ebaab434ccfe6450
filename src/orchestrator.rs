//! # Upload & Analysis Orchestrator
//!
//! Runs one end-to-end analysis cycle: generate a session id, open the
//! progress channel, submit the file, and reconcile the two asynchronous
//! outcomes — the stream of progress events and the terminal HTTP response —
//! into exactly one success or one fatal error.
//!
//! ## The two paths:
//! The terminal request and the progress channel are a fan-in, not a
//! pipeline. The orchestrator never blocks on progress events: a pump task
//! folds whatever arrives into the latest-state slot, while `run_analysis`
//! itself awaits only the terminal request. The cycle is correct whether
//! events arrive before, during, or after the terminal response — including
//! the degenerate case of no events at all.
//!
//! ## Who wins on disagreement:
//! The terminal request is authoritative. A channel-side `error` stage is
//! advisory display data; the cycle still waits for the terminal outcome.
//!
//! ## Supersession:
//! At most one cycle is active per orchestrator. Starting a new cycle bumps a
//! generation counter, closes the previous cycle's channel, and turns the
//! previous cycle's late publications into no-ops; its terminal result, if it
//! ever arrives, resolves to `AnalysisError::Superseded` instead of leaking
//! stale data.

use crate::backend::{AnalysisBackend, AnalysisResult, HttpAnalysisBackend};
use crate::channel::{self, ChannelHandle};
use crate::config::AppConfig;
use crate::error::AnalysisError;
use crate::progress::{ProgressEvent, ProgressState};
use crate::session::SessionId;

use async_trait::async_trait;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Seam for opening the progress channel, so orchestrator behavior is
/// testable without a WebSocket server.
#[async_trait]
pub trait ProgressConnector: Send + Sync {
    async fn connect(
        &self,
        session_id: &SessionId,
    ) -> Result<(ChannelHandle, mpsc::Receiver<ProgressEvent>), AnalysisError>;
}

/// Real connector dialing `{ws_base_url}/ws/{session_id}`.
pub struct WsProgressConnector {
    ws_base_url: String,
    connect_timeout: Duration,
    settle_delay: Duration,
}

impl WsProgressConnector {
    pub fn new(ws_base_url: String, connect_timeout: Duration, settle_delay: Duration) -> Self {
        Self {
            ws_base_url,
            connect_timeout,
            settle_delay,
        }
    }
}

#[async_trait]
impl ProgressConnector for WsProgressConnector {
    async fn connect(
        &self,
        session_id: &SessionId,
    ) -> Result<(ChannelHandle, mpsc::Receiver<ProgressEvent>), AnalysisError> {
        channel::connect(
            &self.ws_base_url,
            session_id,
            self.connect_timeout,
            self.settle_delay,
        )
        .await
    }
}

/// The in-flight record for one cycle: which generation it belongs to and
/// the channel it owns. Held so a newer cycle can tear the old one down.
struct UploadTask {
    generation: u64,
    channel: Option<Arc<ChannelHandle>>,
}

/// One-cycle-at-a-time analysis driver.
pub struct Orchestrator {
    backend: Arc<dyn AnalysisBackend>,
    connector: Arc<dyn ProgressConnector>,
    settle_delay: Duration,
    /// Cycle counter; the generation stamp that makes late callbacks no-ops.
    generation: Arc<AtomicU64>,
    /// The active UploadTask, if any. Single owner of the open channel.
    active: Mutex<Option<UploadTask>>,
    /// Latest-event slot, owned here, read-only for presentation.
    progress_tx: Arc<watch::Sender<ProgressState>>,
}

impl Orchestrator {
    pub fn new(
        backend: Arc<dyn AnalysisBackend>,
        connector: Arc<dyn ProgressConnector>,
        settle_delay: Duration,
    ) -> Self {
        let (progress_tx, _) = watch::channel(ProgressState::default());
        Self {
            backend,
            connector,
            settle_delay,
            generation: Arc::new(AtomicU64::new(0)),
            active: Mutex::new(None),
            progress_tx: Arc::new(progress_tx),
        }
    }

    /// Build the production orchestrator from configuration.
    pub fn from_config(config: &AppConfig) -> Self {
        let settle_delay = Duration::from_millis(config.channel.settle_delay_ms);
        let backend = Arc::new(HttpAnalysisBackend::new(
            config.backend.base_url.clone(),
            config.upload_limit_bytes(),
        ));
        let connector = Arc::new(WsProgressConnector::new(
            config.backend.effective_ws_base_url(),
            Duration::from_secs(config.backend.connect_timeout_secs),
            settle_delay,
        ));
        Self::new(backend, connector, settle_delay)
    }

    /// Watch the latest progress state for rendering.
    pub fn subscribe(&self) -> watch::Receiver<ProgressState> {
        self.progress_tx.subscribe()
    }

    /// Run one upload/analysis cycle and resolve to exactly one result or
    /// one fatal error.
    pub async fn run_analysis(&self, file_path: &Path) -> Result<AnalysisResult, AnalysisError> {
        // Step 1: no file, no network.
        if file_path.as_os_str().is_empty()
            || !tokio::fs::try_exists(file_path).await.unwrap_or(false)
        {
            return Err(AnalysisError::NoFileSelected);
        }

        // Step 2: stamp this cycle. Any cycle started later owns the slot.
        let generation = self.generation.fetch_add(1, Ordering::SeqCst) + 1;
        self.progress_tx.send_replace(ProgressState::default());

        let session_id = SessionId::generate();
        info!("Starting analysis cycle {} ({})", generation, session_id);

        // Step 3: open the progress channel. Failure degrades, never aborts.
        let handle = match self.connector.connect(&session_id).await {
            Ok((handle, events)) => {
                let handle = Arc::new(handle);
                self.spawn_pump(events, generation);
                Some(handle)
            }
            Err(err) => {
                warn!("Proceeding without live progress: {}", err);
                None
            }
        };

        // Supersede whatever cycle was active before this one. Connecting
        // takes time, so by the time a cycle gets here a newer one may
        // already own the slot; a stale cycle must tear down only itself,
        // never its successor's channel.
        {
            let mut active = self.active.lock().unwrap();
            let superseded = self.generation.load(Ordering::SeqCst) != generation
                || matches!(&*active, Some(task) if task.generation > generation);
            if superseded {
                drop(active);
                if let Some(handle) = &handle {
                    handle.close();
                }
                debug!("Cycle {} superseded before submission", generation);
                return Err(AnalysisError::Superseded);
            }
            if let Some(previous) = active.take() {
                debug!("Superseding analysis cycle {}", previous.generation);
                if let Some(channel) = previous.channel {
                    channel.close();
                }
            }
            *active = Some(UploadTask {
                generation,
                channel: handle.clone(),
            });
        }

        // Steps 4-5: the terminal request. Progress events race with it and
        // are folded into the watch slot by the pump; nothing blocks on them.
        let outcome = self.backend.submit(file_path, &session_id).await;

        // A cycle that lost the generation race discards its result: the
        // newer cycle owns the UI, and mixing payloads from two session ids
        // is exactly the bug the stamp exists to prevent.
        if self.generation.load(Ordering::SeqCst) != generation {
            if let Some(handle) = &handle {
                handle.close();
            }
            self.clear_active(generation);
            debug!("Cycle {} superseded, discarding terminal result", generation);
            return Err(AnalysisError::Superseded);
        }

        // Steps 6-8: settle the cycle in bounded time.
        let outcome = match outcome {
            Ok(result) => {
                if let Some(handle) = &handle {
                    if self.progress_tx.borrow().is_complete() {
                        // The final frame was seen; give it the settling
                        // delay to render, then tear down.
                        tokio::time::sleep(self.settle_delay).await;
                    }
                    handle.close();
                }
                info!("Analysis cycle {} completed", generation);
                Ok(result)
            }
            Err(err) => {
                if let Some(handle) = &handle {
                    handle.close();
                }
                warn!("Analysis cycle {} failed: {}", generation, err);
                Err(err)
            }
        };

        self.clear_active(generation);
        outcome
    }

    /// Pump task: fold channel events into the watch slot while this cycle
    /// still owns it. A superseded cycle's events produce no observable
    /// effect.
    fn spawn_pump(&self, mut events: mpsc::Receiver<ProgressEvent>, generation: u64) {
        let progress_tx = Arc::clone(&self.progress_tx);
        let counter = Arc::clone(&self.generation);

        tokio::spawn(async move {
            let mut state = ProgressState::default();
            while let Some(event) = events.recv().await {
                state.apply(event);
                // The generation check happens under the slot's own lock, so
                // a stale pump can never publish over a newer cycle's reset.
                progress_tx.send_if_modified(|slot| {
                    if counter.load(Ordering::SeqCst) == generation {
                        *slot = state.clone();
                        true
                    } else {
                        false
                    }
                });
            }
            debug!("Progress pump for cycle {} finished", generation);
        });
    }

    /// Drop the UploadTask record once its cycle has fully resolved, unless
    /// a newer cycle already replaced it.
    fn clear_active(&self, generation: u64) {
        let mut active = self.active.lock().unwrap();
        if matches!(&*active, Some(task) if task.generation == generation) {
            *active = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ChannelState;
    use crate::progress::StageTag;
    use std::io::Write;
    use std::sync::atomic::AtomicUsize;

    /// What the mock backend should answer with.
    enum Script {
        Succeed { analysis: String, transcription: String },
        FailStatus { status: u16, message: String },
        Transport(String),
    }

    struct MockBackend {
        script: Script,
        delay: Duration,
        calls: AtomicUsize,
    }

    impl MockBackend {
        fn new(script: Script, delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                script,
                delay,
                calls: AtomicUsize::new(0),
            })
        }

        fn call_count(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl AnalysisBackend for MockBackend {
        async fn submit(
            &self,
            _file_path: &Path,
            _session_id: &SessionId,
        ) -> Result<AnalysisResult, AnalysisError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            match &self.script {
                Script::Succeed { analysis, transcription } => Ok(AnalysisResult {
                    analysis: analysis.clone(),
                    full_transcription: transcription.clone(),
                }),
                Script::FailStatus { status, message } => Err(AnalysisError::AnalysisFailed {
                    status: *status,
                    message: message.clone(),
                }),
                Script::Transport(reason) => Err(AnalysisError::Transport(reason.clone())),
            }
        }
    }

    /// Connector that replays a scripted event sequence and records every
    /// channel's state cell so tests can check it ended up Closed.
    struct ScriptedConnector {
        events: Vec<(StageTag, i64)>,
        event_spacing: Duration,
        refuse: bool,
        /// Per-call connect delays, consumed front to back; an exhausted
        /// list means connects resolve immediately.
        connect_delays: Mutex<Vec<Duration>>,
        opened: Mutex<Vec<Arc<Mutex<ChannelState>>>>,
        connects: AtomicUsize,
    }

    impl ScriptedConnector {
        fn new(events: Vec<(StageTag, i64)>, event_spacing: Duration) -> Arc<Self> {
            Arc::new(Self {
                events,
                event_spacing,
                refuse: false,
                connect_delays: Mutex::new(Vec::new()),
                opened: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
            })
        }

        fn with_connect_delays(delays: Vec<Duration>) -> Arc<Self> {
            Arc::new(Self {
                events: Vec::new(),
                event_spacing: Duration::ZERO,
                refuse: false,
                connect_delays: Mutex::new(delays),
                opened: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
            })
        }

        fn refusing() -> Arc<Self> {
            Arc::new(Self {
                events: Vec::new(),
                event_spacing: Duration::ZERO,
                refuse: true,
                connect_delays: Mutex::new(Vec::new()),
                opened: Mutex::new(Vec::new()),
                connects: AtomicUsize::new(0),
            })
        }

        fn channel_state(&self, index: usize) -> ChannelState {
            *self.opened.lock().unwrap()[index].lock().unwrap()
        }

        fn all_closed(&self) -> bool {
            self.opened
                .lock()
                .unwrap()
                .iter()
                .all(|state| *state.lock().unwrap() == ChannelState::Closed)
        }

        fn opened_count(&self) -> usize {
            self.opened.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl ProgressConnector for ScriptedConnector {
        async fn connect(
            &self,
            _session_id: &SessionId,
        ) -> Result<(ChannelHandle, mpsc::Receiver<ProgressEvent>), AnalysisError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if self.refuse {
                return Err(AnalysisError::ChannelUnavailable("connection refused".into()));
            }

            let delay = {
                let mut delays = self.connect_delays.lock().unwrap();
                if delays.is_empty() {
                    Duration::ZERO
                } else {
                    delays.remove(0)
                }
            };
            if !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }

            let (close_tx, mut close_rx) = watch::channel(false);
            let state = Arc::new(Mutex::new(ChannelState::Open));
            let handle = ChannelHandle::new(close_tx, Arc::clone(&state));
            self.opened.lock().unwrap().push(handle.state_ref());

            let (event_tx, event_rx) = mpsc::channel(32);
            let events = self.events.clone();
            let spacing = self.event_spacing;
            tokio::spawn(async move {
                for (stage, progress) in events {
                    tokio::select! {
                        _ = tokio::time::sleep(spacing) => {}
                        _ = close_rx.changed() => return,
                    }
                    let event = ProgressEvent {
                        stage,
                        progress,
                        message: String::new(),
                    };
                    if event_tx.send(event).await.is_err() {
                        return;
                    }
                }
                // Hold the channel open until the owner closes it.
                let _ = close_rx.changed().await;
            });

            Ok((handle, event_rx))
        }
    }

    fn audio_fixture() -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new()
            .prefix("interview")
            .suffix(".mp3")
            .tempfile()
            .unwrap();
        file.write_all(b"fake mp3 bytes").unwrap();
        file
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_scenario_with_progress_events() {
        let file = audio_fixture();
        let backend = MockBackend::new(
            Script::Succeed {
                analysis: "insights".into(),
                transcription: "hello".into(),
            },
            Duration::from_millis(50),
        );
        let connector = ScriptedConnector::new(
            vec![
                (StageTag::Upload, 5),
                (StageTag::Transcribing, 40),
                (StageTag::Completed, 100),
            ],
            Duration::from_millis(5),
        );

        let orchestrator = Orchestrator::new(
            backend.clone(),
            connector.clone(),
            Duration::from_millis(1000),
        );
        let progress = orchestrator.subscribe();

        let result = orchestrator.run_analysis(file.path()).await.unwrap();

        assert_eq!(result.analysis, "insights");
        assert_eq!(result.full_transcription, "hello");
        assert!(progress.borrow().is_complete());
        assert_eq!(progress.borrow().view().percent, 100);
        assert!(connector.all_closed(), "channel must be closed by cycle end");
    }

    #[tokio::test(start_paused = true)]
    async fn test_completed_event_triggers_settle_delay_before_teardown() {
        let file = audio_fixture();
        let backend = MockBackend::new(
            Script::Succeed {
                analysis: "a".into(),
                transcription: "t".into(),
            },
            Duration::from_millis(100),
        );
        // Completed arrives well before the terminal response.
        let connector = ScriptedConnector::new(
            vec![(StageTag::Completed, 100)],
            Duration::from_millis(1),
        );
        let settle = Duration::from_millis(1000);
        let orchestrator = Orchestrator::new(backend, connector.clone(), settle);

        let started = tokio::time::Instant::now();
        let result = orchestrator.run_analysis(file.path()).await.unwrap();

        // The payload comes from the terminal request, never the channel.
        assert_eq!(result.analysis, "a");
        // Teardown waited out the settling delay after the terminal response.
        assert!(started.elapsed() >= settle);
        assert!(connector.all_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_with_zero_progress_events() {
        let file = audio_fixture();
        let backend = MockBackend::new(
            Script::Succeed {
                analysis: "a".into(),
                transcription: "t".into(),
            },
            Duration::from_millis(10),
        );
        let connector = ScriptedConnector::new(Vec::new(), Duration::ZERO);
        let orchestrator = Orchestrator::new(
            backend,
            connector.clone(),
            Duration::from_millis(1000),
        );

        let started = tokio::time::Instant::now();
        let result = orchestrator.run_analysis(file.path()).await;

        assert!(result.is_ok());
        // No completed event was seen, so there is no settling delay.
        assert!(started.elapsed() < Duration::from_millis(1000));
        assert!(connector.all_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_unavailable_degrades_but_cycle_succeeds() {
        let file = audio_fixture();
        let backend = MockBackend::new(
            Script::Succeed {
                analysis: "a".into(),
                transcription: "t".into(),
            },
            Duration::from_millis(10),
        );
        let connector = ScriptedConnector::refusing();
        let orchestrator =
            Orchestrator::new(backend, connector.clone(), Duration::from_millis(1000));

        let result = orchestrator.run_analysis(file.path()).await;

        assert!(result.is_ok());
        assert_eq!(connector.connects.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_backend_failure_surfaces_status_and_body() {
        let file = audio_fixture();
        let backend = MockBackend::new(
            Script::FailStatus {
                status: 500,
                message: "model unavailable".into(),
            },
            Duration::from_millis(10),
        );
        let connector =
            ScriptedConnector::new(vec![(StageTag::Upload, 5)], Duration::from_millis(1));
        let orchestrator =
            Orchestrator::new(backend, connector.clone(), Duration::from_millis(1000));

        let err = orchestrator.run_analysis(file.path()).await.unwrap_err();

        match err {
            AnalysisError::AnalysisFailed { status, message } => {
                assert_eq!(status, 500);
                assert_eq!(message, "model unavailable");
            }
            other => panic!("Expected AnalysisFailed, got {:?}", other),
        }
        assert!(connector.all_closed(), "channel must be closed on failure too");
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_stage_is_advisory_only() {
        let file = audio_fixture();
        // Channel says error, terminal request says success: terminal wins.
        let backend = MockBackend::new(
            Script::Succeed {
                analysis: "a".into(),
                transcription: "t".into(),
            },
            Duration::from_millis(50),
        );
        let connector =
            ScriptedConnector::new(vec![(StageTag::Error, 0)], Duration::from_millis(1));
        let orchestrator =
            Orchestrator::new(backend, connector.clone(), Duration::from_millis(1000));

        let result = orchestrator.run_analysis(file.path()).await;
        assert!(result.is_ok());
    }

    #[tokio::test(start_paused = true)]
    async fn test_transport_error_is_fatal() {
        let file = audio_fixture();
        let backend = MockBackend::new(
            Script::Transport("connection reset".into()),
            Duration::from_millis(10),
        );
        let connector = ScriptedConnector::new(Vec::new(), Duration::ZERO);
        let orchestrator =
            Orchestrator::new(backend, connector.clone(), Duration::from_millis(1000));

        let err = orchestrator.run_analysis(file.path()).await.unwrap_err();
        assert!(matches!(err, AnalysisError::Transport(_)));
        assert!(connector.all_closed());
    }

    #[tokio::test]
    async fn test_missing_file_makes_no_network_calls() {
        let backend = MockBackend::new(
            Script::Succeed {
                analysis: "a".into(),
                transcription: "t".into(),
            },
            Duration::ZERO,
        );
        let connector = ScriptedConnector::new(Vec::new(), Duration::ZERO);
        let orchestrator = Orchestrator::new(
            backend.clone(),
            connector.clone(),
            Duration::from_millis(1000),
        );

        let err = orchestrator
            .run_analysis(Path::new("/nonexistent/interview.mp3"))
            .await
            .unwrap_err();

        assert!(matches!(err, AnalysisError::NoFileSelected));
        assert_eq!(backend.call_count(), 0);
        assert_eq!(connector.connects.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_second_cycle_supersedes_first() {
        let file = audio_fixture();
        // Slow first backend so the second cycle finishes underneath it.
        let backend = MockBackend::new(
            Script::Succeed {
                analysis: "payload".into(),
                transcription: "text".into(),
            },
            Duration::from_millis(200),
        );
        let connector = ScriptedConnector::new(Vec::new(), Duration::ZERO);
        let orchestrator = Arc::new(Orchestrator::new(
            backend,
            connector.clone(),
            Duration::from_millis(10),
        ));

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            let path = file.path().to_path_buf();
            tokio::spawn(async move { orchestrator.run_analysis(&path).await })
        };

        // Let the first cycle get in flight before starting the second.
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(orchestrator.generation.load(Ordering::SeqCst), 1);

        let second = orchestrator.run_analysis(file.path()).await;
        assert!(second.is_ok(), "the newer cycle must win");

        let first = first.await.unwrap();
        assert!(
            matches!(first, Err(AnalysisError::Superseded)),
            "the stale cycle's late result must be discarded"
        );
        assert_eq!(connector.opened_count(), 2);
        assert!(connector.all_closed(), "both channels must end up closed");
        assert!(orchestrator.active.lock().unwrap().is_none());
    }

    #[tokio::test]
    async fn test_stale_cycle_with_slow_connect_cannot_close_newer_channel() {
        let file = audio_fixture();
        let backend = MockBackend::new(
            Script::Succeed {
                analysis: "a".into(),
                transcription: "t".into(),
            },
            Duration::from_millis(800),
        );
        // First connect resolves only after the second cycle is in flight.
        let connector = ScriptedConnector::with_connect_delays(vec![
            Duration::from_millis(300),
            Duration::ZERO,
        ]);
        let orchestrator = Arc::new(Orchestrator::new(
            backend.clone(),
            connector.clone(),
            Duration::from_millis(10),
        ));
        let progress = orchestrator.subscribe();

        let first = {
            let orchestrator = Arc::clone(&orchestrator);
            let path = file.path().to_path_buf();
            tokio::spawn(async move { orchestrator.run_analysis(&path).await })
        };

        tokio::time::sleep(Duration::from_millis(100)).await;
        let second = {
            let orchestrator = Arc::clone(&orchestrator);
            let path = file.path().to_path_buf();
            tokio::spawn(async move { orchestrator.run_analysis(&path).await })
        };

        // Let the stale connect resolve while the newer cycle's terminal
        // request is still in flight, then look at both channels. The second
        // cycle connected first (index 0); the stale first cycle's channel
        // arrived late (index 1) and must be the only one torn down.
        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(connector.opened_count(), 2);
        assert_eq!(
            connector.channel_state(0),
            ChannelState::Open,
            "the winning cycle must keep its live progress channel"
        );
        assert_eq!(
            connector.channel_state(1),
            ChannelState::Closed,
            "the stale cycle must tear down only its own channel"
        );

        let first = first.await.unwrap();
        assert!(matches!(first, Err(AnalysisError::Superseded)));
        // The stale cycle bailed before submitting; only the winner uploaded.
        assert_eq!(backend.call_count(), 1);

        let second = second.await.unwrap();
        assert!(second.is_ok());
        assert!(connector.all_closed());
        // Nothing from the stale cycle leaked into the display slot.
        assert!(progress.borrow().latest().is_none());
        assert!(orchestrator.active.lock().unwrap().is_none());
    }
}
