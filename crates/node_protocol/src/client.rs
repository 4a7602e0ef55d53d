use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

use crate::codec::{Codec, CodecError};
use crate::envelope::{
    ErrorCode, ExecuteParams, ExecuteResult, ExecutionMetadata, HealthResult, InfoResult, Message,
    Method, RequestIdGenerator, ResultBody, ShutdownParams, ShutdownResult, ValidateParams,
    ValidateResult,
};
use crate::frame::{FrameError, read_frame, write_frame};

#[derive(Debug, Error)]
pub enum CallError {
    #[error("failed to connect to {path}: {source}")]
    Connect {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("not connected")]
    NotConnected,
    #[error("connection closed")]
    ConnectionClosed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error(transparent)]
    Codec(#[from] CodecError),
    #[error("received a response without correlation id")]
    Uncorrelated,
    #[error("unexpected response: {0}")]
    InvalidResponse(String),
    #[error("call to {method} timed out after {after:?}")]
    Timeout { method: String, after: Duration },
    #[error("node error {code}: {message}")]
    Application {
        code: i64,
        message: String,
        data: Option<Value>,
    },
}

impl CallError {
    /// Transport failures are retried or reconnected by the connection
    /// layer; timeouts and application errors surface to the caller.
    pub fn is_transport(&self) -> bool {
        !matches!(self, CallError::Timeout { .. } | CallError::Application { .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, CallError::Timeout { .. })
    }

    /// Protocol error code describing this failure.
    pub fn code(&self) -> i64 {
        match self {
            CallError::Application { code, .. } => *code,
            CallError::Timeout { .. } => ErrorCode::NodeExecutionTimeout.code(),
            CallError::Codec(_) | CallError::Uncorrelated | CallError::InvalidResponse(_) => {
                ErrorCode::ParseError.code()
            }
            _ => ErrorCode::InternalError.code(),
        }
    }
}

type Pending = Arc<DashMap<String, oneshot::Sender<Result<Message, CallError>>>>;

/// One persistent connection to a node's socket.
///
/// Requests are written by a dedicated writer task; a reader task routes
/// every response to the waiting caller by its correlation id.
pub struct NodeClient {
    node_id: String,
    socket_path: PathBuf,
    codec: Arc<dyn Codec>,
    outbound: mpsc::Sender<Vec<u8>>,
    pending: Pending,
    ids: RequestIdGenerator,
    connected: Arc<AtomicBool>,
    tasks: Vec<JoinHandle<()>>,
}

impl std::fmt::Debug for NodeClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeClient")
            .field("node_id", &self.node_id)
            .field("socket_path", &self.socket_path)
            .field("codec", &self.codec.name())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl NodeClient {
    pub async fn connect(
        node_id: impl Into<String>,
        socket_path: impl AsRef<Path>,
        codec: Arc<dyn Codec>,
    ) -> Result<Self, CallError> {
        let node_id = node_id.into();
        let socket_path = socket_path.as_ref().to_path_buf();
        let stream = UnixStream::connect(&socket_path)
            .await
            .map_err(|source| CallError::Connect { path: socket_path.clone(), source })?;
        let (mut rd, mut wr) = stream.into_split();

        let pending: Pending = Arc::new(DashMap::new());
        let connected = Arc::new(AtomicBool::new(true));
        let (outbound, mut rx) = mpsc::channel::<Vec<u8>>(32);

        // ── writer: outbound queue → socket ─────────────────────────────
        let writer = {
            let connected = Arc::clone(&connected);
            let node_id = node_id.clone();
            tokio::spawn(async move {
                while let Some(bytes) = rx.recv().await {
                    if let Err(e) = write_frame(&mut wr, &bytes).await {
                        warn!(node_id = %node_id, error = %e, "write to node failed");
                        break;
                    }
                }
                connected.store(false, Ordering::SeqCst);
            })
        };

        // ── reader: socket → pending callers ────────────────────────────
        let reader = {
            let connected = Arc::clone(&connected);
            let pending = Arc::clone(&pending);
            let codec = Arc::clone(&codec);
            let node_id = node_id.clone();
            tokio::spawn(async move {
                loop {
                    let frame = match read_frame(&mut rd).await {
                        Ok(frame) => frame,
                        Err(FrameError::Closed) => {
                            debug!(node_id = %node_id, "node closed the connection");
                            break;
                        }
                        Err(e) => {
                            warn!(node_id = %node_id, error = %e, "read from node failed");
                            break;
                        }
                    };
                    let msg = match codec.decode(&frame) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!(node_id = %node_id, error = %e, "dropping malformed envelope");
                            fail_sole(&pending, CallError::InvalidResponse(e.to_string()));
                            continue;
                        }
                    };
                    if !msg.is_response() {
                        debug!(node_id = %node_id, "ignoring request sent by node");
                        continue;
                    }
                    match msg.id().map(str::to_owned) {
                        Some(id) => match pending.remove(&id) {
                            Some((_, tx)) => {
                                let _ = tx.send(Ok(msg));
                            }
                            None => trace!(node_id = %node_id, %id, "response for unknown or expired call"),
                        },
                        None => {
                            warn!(node_id = %node_id, "dropping response without correlation id");
                            fail_sole(&pending, CallError::Uncorrelated);
                        }
                    }
                }
                connected.store(false, Ordering::SeqCst);
                // dropping the senders wakes every waiter with ConnectionClosed
                pending.clear();
            })
        };

        debug!(node_id = %node_id, path = %socket_path.display(), codec = codec.name(), "connected to node");
        Ok(Self {
            node_id,
            socket_path,
            codec,
            outbound,
            pending,
            ids: RequestIdGenerator::new(),
            connected,
            tasks: vec![writer, reader],
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    /// Number of calls still waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Send a request and wait for its correlated response.
    pub async fn call(
        &self,
        method: Method,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<ResultBody, CallError> {
        if !self.is_connected() {
            return Err(CallError::NotConnected);
        }
        let id = self.ids.next_id();
        let bytes = self.codec.encode(&Message::request(id.clone(), method, params))?;

        let (tx, rx) = oneshot::channel();
        self.pending.insert(id.clone(), tx);
        if self.outbound.send(bytes).await.is_err() {
            self.pending.remove(&id);
            return Err(CallError::ConnectionClosed);
        }

        let reply = match tokio::time::timeout(timeout, rx).await {
            Err(_) => {
                self.pending.remove(&id);
                return Err(CallError::Timeout { method: method.to_string(), after: timeout });
            }
            Ok(Err(_)) => return Err(CallError::ConnectionClosed),
            Ok(Ok(reply)) => reply?,
        };

        match reply {
            Message::Result(r) => Ok(r.result),
            Message::Error(e) => Err(CallError::Application {
                code: e.error.code,
                message: e.error.message,
                data: e.error.data,
            }),
            Message::Request(_) => Err(CallError::InvalidResponse("request in place of response".into())),
        }
    }

    /// Call `method` and deserialize the result's `output` into `T`.
    async fn rpc_call<T: DeserializeOwned>(
        &self,
        method: Method,
        params: Option<Value>,
        timeout: Duration,
    ) -> Result<T, CallError> {
        let body = self.call(method, params, timeout).await?;
        serde_json::from_value(body.output).map_err(|e| CallError::InvalidResponse(e.to_string()))
    }

    pub async fn info(&self, timeout: Duration) -> Result<InfoResult, CallError> {
        self.rpc_call(Method::Info, None, timeout).await
    }

    pub async fn validate(&self, input: Value, timeout: Duration) -> Result<ValidateResult, CallError> {
        let params = to_params(ValidateParams { input })?;
        self.rpc_call(Method::Validate, Some(params), timeout).await
    }

    pub async fn execute(
        &self,
        input: Value,
        context: Value,
        timeout: Duration,
    ) -> Result<ExecuteResult, CallError> {
        let params = to_params(ExecuteParams { input, context })?;
        let body = self.call(Method::Execute, Some(params), timeout).await?;
        let metadata = if body.metadata.is_null() {
            ExecutionMetadata::default()
        } else {
            serde_json::from_value(body.metadata).map_err(|e| CallError::InvalidResponse(e.to_string()))?
        };
        Ok(ExecuteResult { output: body.output, metadata })
    }

    pub async fn health(&self, timeout: Duration) -> Result<HealthResult, CallError> {
        self.rpc_call(Method::Health, None, timeout).await
    }

    pub async fn shutdown(&self, timeout_seconds: u64, timeout: Duration) -> Result<ShutdownResult, CallError> {
        let params = to_params(ShutdownParams { timeout_seconds })?;
        self.rpc_call(Method::Shutdown, Some(params), timeout).await
    }

    /// Stop the background tasks; waiting callers observe `ConnectionClosed`.
    pub fn close(&self) {
        for task in &self.tasks {
            task.abort();
        }
        self.connected.store(false, Ordering::SeqCst);
        self.pending.clear();
    }
}

impl Drop for NodeClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn to_params<T: Serialize>(params: T) -> Result<Value, CallError> {
    serde_json::to_value(params).map_err(|e| CodecError::Encode(e.to_string()).into())
}

/// An uncorrelated reply is never matched to a call. It can only be blamed
/// on one when exactly one call is in flight; otherwise the other callers
/// keep waiting for their own replies.
fn fail_sole(pending: &Pending, err: CallError) {
    if pending.len() != 1 {
        return;
    }
    let Some(id) = pending.iter().next().map(|e| e.key().clone()) else {
        return;
    };
    if let Some((_, tx)) = pending.remove(&id) {
        let _ = tx.send(Err(err));
    }
}
