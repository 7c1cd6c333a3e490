//! Server loop and lifecycle.
//!
//! ```text
//!              start()                 stop() / relay loss
//!   Idle ───────────────► Running ─────────────────────────► Stopping ──► Idle
//!                           │  ▲                                 │
//!                  inbound  │  │ outcomes (FIFO)                 └─ drain with timeout
//!                           ▼  │
//!            RunTracker ──► InFlightQueue ──► Publisher ──► sink
//!                  │              ▲
//!                  └─► executor ──┘  (rayon pool)
//! ```
//!
//! A single dispatch task owns the tracker, the in-flight queue and the
//! publisher. Handles talk to it over a query channel.

use super::executor::TransformExecutor;
use super::publisher::Publisher;
use super::scheduler::{InFlightQueue, Outcome};
use super::stats::{ServerStats, StatsSnapshot};
use crate::config::{Config, RelayConfig, ServerConfig};
use crate::data::{Document, DocumentKind};
use crate::error::{RelayError, RunError, ServerError, ServerResult};
use crate::relay::{DocumentSink, DocumentSource, RelayConsumer, RelayProducer};
use crate::run::{EventRoute, RunConfigView, RunDefaults, RunSummary, RunTracker};
use crate::stage::Pipeline;
use bytes::Bytes;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot, watch, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerState {
    Idle,
    Running,
    Stopping,
}

enum Query {
    ActiveRuns(oneshot::Sender<Vec<RunSummary>>),
    RunConfig(Uuid, oneshot::Sender<Option<RunConfigView>>),
    Abort(Uuid, oneshot::Sender<Option<RunSummary>>),
}

/// The streaming document server.
pub struct Server {
    settings: ServerConfig,
    relay: RelayConfig,
    defaults: RunDefaults,
    executor: TransformExecutor,
    stats: Arc<ServerStats>,
    state: watch::Sender<ServerState>,
    stop: Arc<watch::Sender<bool>>,
    query_tx: mpsc::Sender<Query>,
    query_rx: Mutex<mpsc::Receiver<Query>>,
}

impl Server {
    pub fn new(
        settings: ServerConfig,
        relay: RelayConfig,
        defaults: RunDefaults,
        pipeline: Pipeline,
    ) -> ServerResult<Self> {
        let executor = TransformExecutor::new(settings.workers(), Arc::new(pipeline))?;
        let (state, _) = watch::channel(ServerState::Idle);
        let (stop, _) = watch::channel(false);
        let (query_tx, query_rx) = mpsc::channel(32);
        Ok(Self {
            settings,
            relay,
            defaults,
            executor,
            stats: Arc::new(ServerStats::default()),
            state,
            stop: Arc::new(stop),
            query_tx,
            query_rx: Mutex::new(query_rx),
        })
    }

    /// Build from a loaded configuration, reading calibration and mask files.
    pub fn from_config(config: &Config) -> ServerResult<Self> {
        let pipeline = Pipeline::with_defaults(&config.pipeline.settings());
        let defaults = config.pipeline.run_defaults()?;
        Self::new(
            config.server.clone(),
            config.relay.clone(),
            defaults,
            pipeline,
        )
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            state: self.state.subscribe(),
            stop: Arc::clone(&self.stop),
            queries: self.query_tx.clone(),
            stats: Arc::clone(&self.stats),
        }
    }

    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Connect to the relay configured for this server and run until stopped.
    ///
    /// Inbound documents are read from the relay frontend and results are
    /// published to its backend.
    pub async fn start(&self) -> ServerResult<()> {
        let max = self.relay.max_frame_length;
        let source = RelayConsumer::connect(self.relay.frontend, max).await?;
        let sink = RelayProducer::connect(self.relay.backend, max).await?;
        self.run(source, sink).await
    }

    /// Run the dispatch loop over an arbitrary source and sink.
    ///
    /// Returns `Ok` after a requested stop and `Err(ServerError::Relay)` when
    /// the inbound or outbound side is lost. Either way the server ends `Idle`.
    pub async fn run<Src, Snk>(&self, mut source: Src, sink: Snk) -> ServerResult<()>
    where
        Src: DocumentSource,
        Snk: DocumentSink,
    {
        let mut queries = self
            .query_rx
            .try_lock()
            .map_err(|_| ServerError::AlreadyRunning)?;

        self.stop.send_replace(false);
        let mut stop = self.stop.subscribe();
        let mut tracker = RunTracker::new(self.defaults.clone(), self.settings.closed_run_memory);
        let mut in_flight = InFlightQueue::new();
        let mut publisher = Publisher::new(sink, self.settings.closed_run_memory, Arc::clone(&self.stats));
        self.state.send_replace(ServerState::Running);
        info!(
            workers = self.executor.worker_count(),
            max_in_flight = self.settings.max_in_flight,
            "server running"
        );

        let outcome: Result<(), RelayError> = loop {
            tokio::select! {
                _ = stop_requested(&mut stop) => break Ok(()),
                Some(query) = queries.recv() => {
                    answer(query, &mut tracker, &mut in_flight);
                }
                Some(outcome) = in_flight.next(), if !in_flight.is_empty() => {
                    if let Err(err) = publisher.publish(outcome).await {
                        break Err(err);
                    }
                }
                frame = source.recv(), if in_flight.len() < self.settings.max_in_flight => {
                    match frame {
                        Ok(Some(frame)) => self.dispatch(frame, &mut tracker, &mut in_flight),
                        Ok(None) => break Err(RelayError::Closed("inbound stream".to_string())),
                        Err(err) => break Err(err),
                    }
                }
            }
        };

        self.state.send_replace(ServerState::Stopping);
        let result = match outcome {
            Ok(()) => {
                info!(pending = in_flight.len(), "stopping, draining in-flight work");
                self.drain(&mut in_flight, &mut publisher).await.map_err(ServerError::from)
            }
            Err(err) => {
                warn!(error = %err, "relay connection lost");
                let lost = self.abandon(&mut in_flight).len();
                if lost > 0 {
                    warn!(lost, "outcomes not published");
                }
                Err(ServerError::Relay(err))
            }
        };

        let live = tracker.len();
        if live > 0 {
            info!(live, "discarding live runs");
        }
        self.state.send_replace(ServerState::Idle);
        info!(stats = ?self.stats.snapshot(), "server idle");
        result
    }

    async fn drain<S: DocumentSink>(
        &self,
        in_flight: &mut InFlightQueue,
        publisher: &mut Publisher<S>,
    ) -> Result<(), RelayError> {
        let drained = tokio::time::timeout(self.settings.drain_timeout, async {
            while let Some(outcome) = in_flight.next().await {
                publisher.publish(outcome).await?;
            }
            Ok::<(), RelayError>(())
        })
        .await;
        match drained {
            Ok(result) => result,
            Err(_) => {
                // Publish what is ready; unfinished events become Error documents.
                for outcome in self.abandon(in_flight) {
                    publisher.publish(outcome).await?;
                }
                Ok(())
            }
        }
    }

    fn abandon(&self, in_flight: &mut InFlightQueue) -> Vec<Outcome> {
        let (outcomes, abandoned) = in_flight.abandon();
        if abandoned > 0 {
            self.stats
                .abandoned_transforms
                .fetch_add(abandoned as u64, std::sync::atomic::Ordering::Relaxed);
            warn!(abandoned, pending = outcomes.len(), "abandoning in-flight transforms");
        }
        outcomes
    }

    fn dispatch(&self, frame: Bytes, tracker: &mut RunTracker, in_flight: &mut InFlightQueue) {
        ServerStats::bump(&self.stats.frames_received);
        let doc = match Document::from_bytes(&frame) {
            Ok(doc) => doc,
            Err(err) => {
                ServerStats::bump(&self.stats.malformed_frames);
                match readable_envelope(&frame) {
                    Some((run_id, sequence_number)) => {
                        let error = RunError::MalformedEnvelope {
                            run_id,
                            reason: err.to_string(),
                        };
                        self.reject(run_id, sequence_number, error, tracker, in_flight);
                    }
                    None => warn!(error = %err, bytes = frame.len(), "dropping malformed frame"),
                }
                return;
            }
        };
        let (run_id, sequence_number, kind) = (doc.run_id, doc.sequence_number, doc.kind);
        debug!(%run_id, sequence_number, %kind, "received");

        let rejected = match kind {
            DocumentKind::RunStart => match tracker.on_run_start(doc) {
                Ok(()) => {
                    ServerStats::bump(&self.stats.runs_started);
                    info!(%run_id, "run started");
                    in_flight.push_ready(Outcome::Opened(run_id));
                    None
                }
                Err(err) => Some(err),
            },
            DocumentKind::Descriptor => tracker.on_descriptor(doc).err(),
            DocumentKind::DataEvent => match tracker.on_data_event(&doc) {
                Ok(EventRoute::Transform(ctx)) => {
                    ServerStats::bump(&self.stats.events_submitted);
                    in_flight.push_transform(run_id, sequence_number, self.executor.submit(doc, ctx));
                    None
                }
                Ok(EventRoute::Calibration) => {
                    ServerStats::bump(&self.stats.calibration_updates);
                    debug!(%run_id, sequence_number, "calibration updated");
                    None
                }
                Err(err) => Some(err),
            },
            DocumentKind::RunStop => match tracker.on_run_stop(doc) {
                Ok((summary, stop)) => {
                    ServerStats::bump(&self.stats.runs_stopped);
                    info!(
                        %run_id,
                        exit_status = ?stop.exit_status,
                        events = summary.events_accepted,
                        "run stopped"
                    );
                    in_flight.push_ready(Outcome::Closed(run_id));
                    None
                }
                Err(err) => Some(err),
            },
            DocumentKind::Analysis | DocumentKind::Error => {
                ServerStats::bump(&self.stats.ignored_documents);
                None
            }
        };

        if let Some(error) = rejected {
            self.reject(run_id, sequence_number, error, tracker, in_flight);
        }
    }

    fn reject(
        &self,
        run_id: Uuid,
        sequence_number: u64,
        error: RunError,
        tracker: &RunTracker,
        in_flight: &mut InFlightQueue,
    ) {
        ServerStats::bump(&self.stats.rejected_documents);
        warn!(%run_id, sequence_number, cause = error.cause(), error = %error, "document rejected");
        in_flight.push_ready(Outcome::Rejected {
            run_id,
            sequence_number,
            error,
            retire: !tracker.is_live(run_id),
        });
    }
}

/// Run id and sequence number of a frame that is JSON but not a valid document.
///
/// Frames claiming a derived kind are never answered.
fn readable_envelope(frame: &[u8]) -> Option<(Uuid, u64)> {
    let value: Value = serde_json::from_slice(frame).ok()?;
    let derived = value
        .get("kind")
        .and_then(|kind| serde_json::from_value::<DocumentKind>(kind.clone()).ok())
        .is_some_and(|kind| kind.is_derived());
    if derived {
        return None;
    }
    let run_id = value.get("run_id")?.as_str()?.parse().ok()?;
    let sequence_number = value.get("sequence_number")?.as_u64()?;
    Some((run_id, sequence_number))
}

async fn stop_requested(stop: &mut watch::Receiver<bool>) {
    let _ = stop.wait_for(|stop| *stop).await;
}

fn answer(query: Query, tracker: &mut RunTracker, in_flight: &mut InFlightQueue) {
    match query {
        Query::ActiveRuns(reply) => {
            let _ = reply.send(tracker.active_runs());
        }
        Query::RunConfig(run_id, reply) => {
            let _ = reply.send(tracker.run_config(run_id));
        }
        Query::Abort(run_id, reply) => {
            let aborted = tracker.abort(run_id);
            if aborted.is_some() {
                info!(%run_id, "run aborted");
                in_flight.push_ready(Outcome::Closed(run_id));
            }
            let _ = reply.send(aborted);
        }
    }
}

/// Cloneable control surface for a [`Server`].
#[derive(Clone)]
pub struct ServerHandle {
    state: watch::Receiver<ServerState>,
    stop: Arc<watch::Sender<bool>>,
    queries: mpsc::Sender<Query>,
    stats: Arc<ServerStats>,
}

impl ServerHandle {
    pub fn state(&self) -> ServerState {
        *self.state.borrow()
    }

    /// Wait until the server reaches `state`.
    pub async fn wait_for_state(&self, state: ServerState) {
        let mut rx = self.state.clone();
        let _ = rx.wait_for(|s| *s == state).await;
    }

    /// Request a stop and wait for the server to become idle. Calling it again,
    /// or on an idle server, returns immediately.
    pub async fn stop(&self) {
        if self.state() == ServerState::Idle {
            return;
        }
        self.stop.send_replace(true);
        self.wait_for_state(ServerState::Idle).await;
    }

    pub async fn active_runs(&self) -> ServerResult<Vec<RunSummary>> {
        self.ask(Query::ActiveRuns).await
    }

    pub async fn run_config(&self, run_id: Uuid) -> ServerResult<Option<RunConfigView>> {
        self.ask(|reply| Query::RunConfig(run_id, reply)).await
    }

    /// Drop a live run without waiting for its stop document.
    pub async fn abort_run(&self, run_id: Uuid) -> ServerResult<Option<RunSummary>> {
        self.ask(|reply| Query::Abort(run_id, reply)).await
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    async fn ask<T>(&self, query: impl FnOnce(oneshot::Sender<T>) -> Query) -> ServerResult<T> {
        if self.state() != ServerState::Running {
            return Err(ServerError::NotRunning);
        }
        let (tx, rx) = oneshot::channel();
        self.queries
            .send(query(tx))
            .await
            .map_err(|_| ServerError::NotRunning)?;
        rx.await.map_err(|_| ServerError::NotRunning)
    }
}
