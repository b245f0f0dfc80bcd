//! Endpoint lifecycle: handshake, read loop, drain and close
//!
//! The read loop only decodes and hands messages off. Handlers run either on a
//! single FIFO worker (serial mode) or on one task per message (concurrent
//! mode); in both cases the loop keeps watching the input and the shutdown
//! signal while handlers execute, so a drain can start mid-request.

use std::{
    collections::HashSet,
    io,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use serde::Serialize;
use serde_json::{json, Map, Value};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::{mpsc, watch},
    task::JoinSet,
    time::{self, Instant},
};
use tracing::{debug, info, warn};

use crate::errors::EndpointError;
use crate::logging::EventLog;
use crate::mcp::dispatcher::Dispatcher;
use crate::mcp::framer::{FrameReader, FrameWriter, DEFAULT_MAX_FRAME_BYTES};
use crate::mcp::message::{Message, Notification, RequestId, Response};

pub const DEFAULT_PROTOCOL_VERSION: &str = "2024-11-05";
pub const DEFAULT_SHUTDOWN_METHOD: &str = "shutdown";

/// Time the writer always gets to flush queued frames, even when the drain
/// used up the whole deadline.
const FLUSH_GRACE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointState {
    Created,
    Running,
    Draining,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InvocationMode {
    #[default]
    Serial,
    Concurrent,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServerInfo {
    pub name: String,
    pub version: String,
}

/// How the handshake is framed on the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeFrame {
    /// An unsolicited response carrying this id.
    Response(RequestId),
    /// A notification with this method name.
    Notification(String),
}

#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub protocol_version: String,
    pub capabilities: Map<String, Value>,
    pub server_info: ServerInfo,
    pub handshake: HandshakeFrame,
    pub drain_timeout: Option<Duration>,
    pub mode: InvocationMode,
    pub shutdown_method: Option<String>,
    pub max_frame_bytes: usize,
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self {
            protocol_version: DEFAULT_PROTOCOL_VERSION.to_string(),
            capabilities: Map::new(),
            server_info: ServerInfo {
                name: env!("CARGO_PKG_NAME").to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            handshake: HandshakeFrame::Response(RequestId::Integer(1)),
            drain_timeout: None,
            mode: InvocationMode::Serial,
            shutdown_method: Some(DEFAULT_SHUTDOWN_METHOD.to_string()),
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
        }
    }
}

impl EndpointConfig {
    pub fn handshake_payload(&self) -> Value {
        json!({
            "protocolVersion": self.protocol_version,
            "capabilities": Value::Object(self.capabilities.clone()),
            "serverInfo": {
                "name": self.server_info.name,
                "version": self.server_info.version,
            },
        })
    }

    pub fn handshake_message(&self) -> Message {
        let payload = self.handshake_payload();
        match &self.handshake {
            HandshakeFrame::Response(id) => Message::Response(Response::success(id.clone(), payload)),
            HandshakeFrame::Notification(method) => {
                Message::Notification(Notification::new(method.clone(), Some(payload)))
            }
        }
    }
}

/// Requests a drain from outside the task running the endpoint.
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    state: Arc<watch::Sender<EndpointState>>,
}

impl ShutdownHandle {
    /// Moves `Created` or `Running` to `Draining`; later calls are no-ops.
    /// Returns whether this call changed the state.
    pub fn shutdown(&self) -> bool {
        self.state.send_if_modified(|state| match state {
            EndpointState::Created | EndpointState::Running => {
                *state = EndpointState::Draining;
                true
            }
            EndpointState::Draining | EndpointState::Closed => false,
        })
    }

    pub fn state(&self) -> EndpointState {
        *self.state.borrow()
    }
}

#[derive(Debug, Clone, Default)]
struct InFlight(Arc<Mutex<HashSet<RequestId>>>);

impl InFlight {
    fn insert(&self, id: RequestId) -> bool {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(id)
    }

    fn remove(&self, id: &RequestId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(id);
    }

    fn take_pending(&self) -> Vec<RequestId> {
        let mut pending: Vec<RequestId> = self
            .0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain()
            .collect();
        pending.sort();
        pending
    }
}

struct Pipeline {
    dispatcher: Arc<Dispatcher>,
    writer: FrameWriter,
    in_flight: InFlight,
    event_log: Arc<dyn EventLog>,
    shutdown_method: Option<String>,
}

impl Pipeline {
    fn is_shutdown(&self, message: &Message) -> bool {
        matches!(
            (self.shutdown_method.as_deref(), message.method()),
            (Some(shutdown), Some(method)) if shutdown == method
        )
    }

    async fn process(&self, message: Message) {
        let id = match &message {
            Message::Request(request) => Some(request.id.clone()),
            Message::Response(_) | Message::Notification(_) => None,
        };

        let response = if self.is_shutdown(&message) {
            match message {
                Message::Request(request) => Some(Response::success(request.id, json!({}))),
                Message::Response(_) | Message::Notification(_) => None,
            }
        } else {
            self.dispatcher.dispatch(message).await
        };

        if let Some(response) = response {
            if let Err(err) = self.writer.write(&Message::Response(response)) {
                warn!(error = %err, "failed to queue response frame");
                self.event_log.log(&format!("write failed: {err}"));
            }
        }
        // No await between the write above and this removal, so an aborted task
        // never leaves an answered id looking abandoned.
        if let Some(id) = id {
            self.in_flight.remove(&id);
        }
    }
}

async fn serial_worker(pipeline: Arc<Pipeline>, mut jobs: mpsc::UnboundedReceiver<Message>) {
    while let Some(message) = jobs.recv().await {
        pipeline.process(message).await;
    }
}

async fn draining(state: &mut watch::Receiver<EndpointState>) {
    let _ = state
        .wait_for(|state| *state != EndpointState::Running)
        .await;
}

async fn join_all(tasks: &mut JoinSet<()>) {
    while let Some(joined) = tasks.join_next().await {
        if let Err(err) = joined {
            if err.is_panic() {
                warn!(error = %err, "endpoint task panicked");
            }
        }
    }
}

pub struct Endpoint {
    config: EndpointConfig,
    dispatcher: Arc<Dispatcher>,
    event_log: Arc<dyn EventLog>,
    shutdown: ShutdownHandle,
    started: AtomicBool,
}

impl Endpoint {
    pub fn new(config: EndpointConfig, dispatcher: Dispatcher, event_log: Arc<dyn EventLog>) -> Self {
        let (state, _) = watch::channel(EndpointState::Created);
        Self {
            config,
            dispatcher: Arc::new(dispatcher),
            event_log,
            shutdown: ShutdownHandle {
                state: Arc::new(state),
            },
            started: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.config
    }

    pub fn state(&self) -> EndpointState {
        self.shutdown.state()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        self.shutdown.clone()
    }

    /// Starts draining. Idempotent.
    pub fn shutdown(&self) {
        if self.shutdown.shutdown() {
            debug!("shutdown requested");
        }
    }

    /// Runs the endpoint until the input ends or a shutdown is requested, then
    /// drains in-flight requests and closes.
    ///
    /// # Errors
    ///
    /// `AlreadyStarted` when called more than once, and `Io` when the output
    /// stream failed at any point or could not be flushed before the drain
    /// timeout. Nothing that happens while handling a message ends the loop
    /// early, and the endpoint is `Closed` whenever this returns.
    pub async fn run<R, W>(&self, reader: R, writer: W) -> Result<(), EndpointError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EndpointError::AlreadyStarted);
        }
        let running = self.shutdown.state.send_if_modified(|state| {
            if *state == EndpointState::Created {
                *state = EndpointState::Running;
                true
            } else {
                false
            }
        });
        if !running {
            self.close();
            return Ok(());
        }

        let (writer, mut writer_task) = FrameWriter::spawn(writer);
        self.event_log.log("started");
        info!(
            protocol_version = %self.config.protocol_version,
            mode = ?self.config.mode,
            "endpoint started"
        );
        if let Err(err) = writer.write(&self.config.handshake_message()) {
            warn!(error = %err, "failed to queue handshake");
            self.event_log.log(&format!("write failed: {err}"));
        }

        let pipeline = Arc::new(Pipeline {
            dispatcher: Arc::clone(&self.dispatcher),
            writer,
            in_flight: InFlight::default(),
            event_log: Arc::clone(&self.event_log),
            shutdown_method: self.config.shutdown_method.clone(),
        });
        let mut tasks = JoinSet::new();
        let queue = match self.config.mode {
            InvocationMode::Serial => {
                let (queue, jobs) = mpsc::unbounded_channel();
                tasks.spawn(serial_worker(Arc::clone(&pipeline), jobs));
                Some(queue)
            }
            InvocationMode::Concurrent => None,
        };

        let mut frames = FrameReader::with_max_frame_bytes(reader, self.config.max_frame_bytes);
        let mut state = self.shutdown.state.subscribe();
        loop {
            let next = tokio::select! {
                biased;
                _ = draining(&mut state) => break,
                next = frames.next_frame() => next,
            };

            let message = match next {
                Ok(Some(Ok(message))) => message,
                Ok(Some(Err(malformed))) => {
                    warn!(line = malformed.line, reason = %malformed.reason, "malformed frame skipped");
                    self.event_log.log(&format!("malformed frame: {malformed}"));
                    continue;
                }
                Ok(None) => {
                    debug!("input stream closed");
                    break;
                }
                Err(err) => {
                    warn!(error = %err, "input stream failed");
                    self.event_log.log(&format!("input failed: {err}"));
                    break;
                }
            };

            if !self.accept(&message, &pipeline.in_flight) {
                continue;
            }
            let stop = pipeline.is_shutdown(&message);
            match &queue {
                Some(queue) => {
                    if queue.send(message).is_err() {
                        warn!("serial worker stopped before input ended");
                    }
                }
                None => {
                    let pipeline = Arc::clone(&pipeline);
                    tasks.spawn(async move { pipeline.process(message).await });
                }
            }
            if stop {
                break;
            }
        }

        self.shutdown.shutdown();
        self.event_log.log("draining");
        info!("endpoint draining");
        let deadline = self.config.drain_timeout.map(|limit| Instant::now() + limit);
        drop(queue);
        self.drain(&mut tasks, &pipeline.in_flight, deadline).await;

        // Every task has been joined, so this releases the last writer handle.
        drop(pipeline);
        let written = match deadline {
            None => Some((&mut writer_task).await),
            Some(deadline) => {
                let flush_by = deadline.max(Instant::now() + FLUSH_GRACE);
                time::timeout_at(flush_by, &mut writer_task).await.ok()
            }
        };
        let written = match written {
            Some(Ok(result)) => result,
            Some(Err(err)) => Err(io::Error::other(err)),
            None => {
                writer_task.abort();
                warn!("output not flushed before drain timeout");
                self.event_log.log("output abandoned at drain timeout");
                Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "output not flushed before drain timeout",
                ))
            }
        };
        self.close();

        written.map_err(EndpointError::from)
    }

    fn accept(&self, message: &Message, in_flight: &InFlight) -> bool {
        match message {
            Message::Request(request) => {
                debug!(method = %request.method, id = %request.id, "request received");
                self.event_log.log(&format!(
                    "request received: {} (id {})",
                    request.method, request.id
                ));
                if !in_flight.insert(request.id.clone()) {
                    warn!(id = %request.id, "duplicate in-flight request id dropped");
                    self.event_log
                        .log(&format!("duplicate request id: {}", request.id));
                    return false;
                }
                true
            }
            Message::Notification(notification) => {
                debug!(method = %notification.method, "notification received");
                self.event_log
                    .log(&format!("notification received: {}", notification.method));
                true
            }
            Message::Response(_) => true,
        }
    }

    async fn drain(&self, tasks: &mut JoinSet<()>, in_flight: &InFlight, deadline: Option<Instant>) {
        let finished = match deadline {
            None => {
                join_all(tasks).await;
                true
            }
            Some(deadline) => time::timeout_at(deadline, join_all(tasks)).await.is_ok(),
        };
        if finished {
            return;
        }

        tasks.abort_all();
        join_all(tasks).await;
        for id in in_flight.take_pending() {
            warn!(id = %id, "request abandoned at drain timeout");
            self.event_log.log(&format!("abandoned request: {id}"));
        }
    }

    fn close(&self) {
        self.shutdown.state.send_replace(EndpointState::Closed);
        self.event_log.log("closed");
        info!("endpoint closed");
    }
}
