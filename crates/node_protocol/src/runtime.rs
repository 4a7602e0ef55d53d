//! Node-side runtime that wires framed socket traffic to a user supplied
//! `NodeHandler`.
//!
//! Handles:
//!   * requests → method dispatch → result or error envelope
//!   * undecodable frames → parse error
//!   * unknown methods and bad params → the matching protocol error
//!   * `node.shutdown` → answer first, then stop accepting connections
//!
//! Usage:
//! ```ignore
//! let handle = NodeServer::new(MyNode::default()).spawn("/tmp/nodeflow-node-my.sock").await?;
//! handle.wait().await?;
//! ```
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, YamlCodec};
use crate::envelope::{
    ErrorCode, ExecuteParams, ExecutionMetadata, HealthResult, InfoResult, Message, Method,
    Request, ShutdownParams, ShutdownResult, ValidateParams, ValidateResult,
};
use crate::frame::{FrameError, read_frame, write_frame};

/// Error a handler reports back to the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct HandlerError {
    pub code: ErrorCode,
    pub message: String,
    pub data: Option<Value>,
}

impl HandlerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self { code, message: message.into(), data: None }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl std::fmt::Display for HandlerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.code.code())
    }
}

impl std::error::Error for HandlerError {}

/// What `execute` hands back: the output and how the run went.
#[derive(Debug, Clone, Default)]
pub struct ExecuteOutcome {
    pub output: Value,
    pub memory_used_mb: f64,
}

impl ExecuteOutcome {
    pub fn new(output: Value) -> Self {
        Self { output, memory_used_mb: 0.0 }
    }
}

#[async_trait]
pub trait NodeHandler: Send + Sync + 'static {
    /// Static metadata; must answer even while an execute is running.
    fn info(&self) -> InfoResult;

    async fn validate(&self, _input: &Value) -> ValidateResult {
        ValidateResult::ok()
    }

    async fn execute(&self, input: Value, context: Value) -> Result<ExecuteOutcome, HandlerError>;

    async fn health(&self) -> HealthResult {
        HealthResult::healthy()
    }

    /// Called before the server stops accepting connections.
    async fn shutdown(&self, _timeout_seconds: u64) {}
}

pub struct NodeServer<H: NodeHandler> {
    handler: Arc<H>,
    codec: Arc<dyn Codec>,
    started: Instant,
}

/// Handle to a spawned server.
pub struct ServerHandle {
    path: PathBuf,
    stop_tx: Arc<watch::Sender<bool>>,
    join: JoinHandle<std::io::Result<()>>,
}

impl ServerHandle {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Ask the accept loop to stop, as `node.shutdown` does.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    pub async fn wait(self) -> std::io::Result<()> {
        match self.join.await {
            Ok(res) => res,
            Err(e) => Err(std::io::Error::other(e)),
        }
    }

    pub fn is_finished(&self) -> bool {
        self.join.is_finished()
    }
}

impl<H: NodeHandler> NodeServer<H> {
    pub fn new(handler: H) -> Self {
        Self::with_codec(handler, Arc::new(YamlCodec))
    }

    pub fn with_codec(handler: H, codec: Arc<dyn Codec>) -> Self {
        Self { handler: Arc::new(handler), codec, started: Instant::now() }
    }

    /// Bind `path` (replacing a stale socket file) and serve in the background.
    pub async fn spawn(self, path: impl AsRef<Path>) -> std::io::Result<ServerHandle> {
        let path = path.as_ref().to_path_buf();
        if path.exists() {
            std::fs::remove_file(&path)?;
        }
        let listener = UnixListener::bind(&path)?;
        let (stop_tx, stop_rx) = watch::channel(false);
        let stop_tx = Arc::new(stop_tx);
        let server = Arc::new(self);
        let cleanup = path.clone();
        let stop = Arc::clone(&stop_tx);
        let join = tokio::spawn(async move {
            let res = server.serve(listener, stop, stop_rx).await;
            let _ = std::fs::remove_file(&cleanup);
            res
        });
        info!(path = %path.display(), "node server listening");
        Ok(ServerHandle { path, stop_tx, join })
    }

    async fn serve(
        self: Arc<Self>,
        listener: UnixListener,
        stop_tx: Arc<watch::Sender<bool>>,
        mut stop_rx: watch::Receiver<bool>,
    ) -> std::io::Result<()> {
        loop {
            tokio::select! {
                _ = stop_rx.changed() => {
                    debug!("node server stopping");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    let (stream, _) = accepted?;
                    let me = Arc::clone(&self);
                    let stop = Arc::clone(&stop_tx);
                    tokio::spawn(async move { me.connection(stream, stop).await });
                }
            }
        }
    }

    async fn connection(self: Arc<Self>, stream: UnixStream, stop: Arc<watch::Sender<bool>>) {
        let (mut rd, mut wr) = stream.into_split();
        let (tx, mut rx) = mpsc::channel::<Message>(32);

        let codec = Arc::clone(&self.codec);
        let writer = tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let bytes = match codec.encode(&msg) {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        error!(error = %e, "could not encode response");
                        continue;
                    }
                };
                if write_frame(&mut wr, &bytes).await.is_err() {
                    break;
                }
            }
        });

        loop {
            let frame = match read_frame(&mut rd).await {
                Ok(frame) => frame,
                Err(FrameError::Closed) => break,
                Err(e) => {
                    warn!(error = %e, "dropping connection");
                    break;
                }
            };
            let req = match self.codec.decode(&frame) {
                Ok(Message::Request(req)) => req,
                Ok(other) => {
                    let reply = Message::error(
                        other.id().map(str::to_owned),
                        ErrorCode::InvalidRequest,
                        "expected a request",
                        None,
                    );
                    let _ = tx.send(reply).await;
                    continue;
                }
                Err(e) => {
                    let reply = Message::error(None, ErrorCode::ParseError, e.to_string(), None);
                    let _ = tx.send(reply).await;
                    continue;
                }
            };
            // each request runs on its own task so info/health answer while busy
            let me = Arc::clone(&self);
            let tx = tx.clone();
            let stop = Arc::clone(&stop);
            tokio::spawn(async move {
                let is_shutdown = req.method == Method::Shutdown.as_ref();
                let reply = me.dispatch(req).await;
                let _ = tx.send(reply).await;
                if is_shutdown {
                    let _ = stop.send(true);
                }
            });
        }
        drop(tx);
        let _ = writer.await;
    }

    /// Dispatch one request and build the matching envelope.
    async fn dispatch(&self, req: Request) -> Message {
        let id = req.id.clone();
        let method = match req.method.parse::<Method>() {
            Ok(m) => m,
            Err(_) => {
                warn!(method = %req.method, "unknown method");
                return Message::error(
                    id,
                    ErrorCode::MethodNotFound,
                    format!("Method not found: {}", req.method),
                    None,
                );
            }
        };

        match method {
            Method::Info => reply(id, &self.handler.info()),
            Method::Health => {
                let mut health = self.handler.health().await;
                if health.uptime_seconds == 0 {
                    health.uptime_seconds = self.started.elapsed().as_secs();
                }
                reply(id, &health)
            }
            Method::Validate => match params::<ValidateParams>(req.params) {
                Ok(p) => reply(id, &self.handler.validate(&p.input).await),
                Err(msg) => Message::error(id, ErrorCode::InvalidParams, msg, None),
            },
            Method::Execute => match params::<ExecuteParams>(req.params) {
                Ok(p) => {
                    let started = Instant::now();
                    match self.handler.execute(p.input, p.context).await {
                        Ok(outcome) => {
                            let metadata = ExecutionMetadata {
                                execution_time_ms: started.elapsed().as_millis() as u64,
                                memory_used_mb: outcome.memory_used_mb,
                                status: "success".to_string(),
                            };
                            Message::result(id, outcome.output, serde_json::to_value(metadata).unwrap_or_default())
                        }
                        Err(e) => Message::error(id, e.code, e.message, e.data),
                    }
                }
                Err(msg) => Message::error(id, ErrorCode::InvalidParams, msg, None),
            },
            Method::Shutdown => match params::<ShutdownParams>(req.params) {
                Ok(p) => {
                    self.handler.shutdown(p.timeout_seconds).await;
                    let output = serde_json::to_value(ShutdownResult { accepted: true }).unwrap_or_default();
                    Message::result(id, output, Value::Null)
                }
                Err(msg) => Message::error(id, ErrorCode::InvalidParams, msg, None),
            },
        }
    }
}

fn reply<T: Serialize>(id: Option<String>, value: &T) -> Message {
    match serde_json::to_value(value) {
        Ok(output) => Message::result(id, output, Value::Null),
        Err(e) => Message::error(id, ErrorCode::InternalError, e.to_string(), None),
    }
}

fn params<T: DeserializeOwned + Default>(raw: Option<Value>) -> Result<T, String> {
    match raw {
        None | Some(Value::Null) => Ok(T::default()),
        Some(v) => serde_json::from_value(v).map_err(|e| format!("Invalid params: {e}")),
    }
}
