//! Control channel between the supervisor and an execution context.
//!
//! Both directions are unbounded tokio channels. The context announces
//! itself with [`ContextMessage::Ready`]; after that every supervisor request
//! carries an id and is answered by exactly one response with the same id.
//! A background pump routes responses to their waiters, so one outstanding
//! request never holds up another.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use url::Url;

use crate::bridge::SyncPort;
use crate::engine::GuestProfile;
use crate::error::{LaunchError, Result};
use crate::namespace::MountTable;
use crate::resolver::{RuntimeImage, RuntimeLocation};

/// Requests from the supervisor.
#[derive(Debug)]
pub enum ControlRequest {
    Initialize {
        image: RuntimeImage,
        location: RuntimeLocation,
        profile: GuestProfile,
    },
    ExecuteFile {
        file: Url,
        guest_path: String,
        mounts: MountTable,
        port: SyncPort,
    },
    RunRepl {
        mounts: MountTable,
        port: SyncPort,
    },
}

impl ControlRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            ControlRequest::Initialize { .. } => "initialize",
            ControlRequest::ExecuteFile { .. } => "executeFile",
            ControlRequest::RunRepl { .. } => "runRepl",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlResponse {
    Initialized,
    Exited(i32),
    Failed(String),
}

/// A request tagged with its correlation id.
#[derive(Debug)]
pub struct Envelope {
    pub id: u64,
    pub request: ControlRequest,
}

/// Messages from the context.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ContextMessage {
    Ready,
    Response { id: u64, response: ControlResponse },
}

/// Supervisor half of a fresh channel, before the handshake.
pub struct SupervisorLink {
    requests: mpsc::UnboundedSender<Envelope>,
    messages: mpsc::UnboundedReceiver<ContextMessage>,
}

/// Context half of a channel.
pub struct ContextEndpoint {
    requests: mpsc::UnboundedReceiver<Envelope>,
    messages: mpsc::UnboundedSender<ContextMessage>,
}

/// Create a connected pair.
pub fn pair() -> (SupervisorLink, ContextEndpoint) {
    let (requests_tx, requests_rx) = mpsc::unbounded_channel();
    let (messages_tx, messages_rx) = mpsc::unbounded_channel();
    (
        SupervisorLink {
            requests: requests_tx,
            messages: messages_rx,
        },
        ContextEndpoint {
            requests: requests_rx,
            messages: messages_tx,
        },
    )
}

impl ContextEndpoint {
    /// Send the readiness signal. Returns `false` if the supervisor is gone.
    pub fn ready(&self) -> bool {
        self.send_message(ContextMessage::Ready)
    }

    pub fn send_message(&self, message: ContextMessage) -> bool {
        self.messages.send(message).is_ok()
    }

    /// Block until the next request arrives, or `None` once the supervisor
    /// has dropped its side.
    pub fn next_request(&mut self) -> Option<Envelope> {
        self.requests.blocking_recv()
    }

    pub fn respond(&self, id: u64, response: ControlResponse) -> bool {
        self.send_message(ContextMessage::Response { id, response })
    }
}

#[derive(Default)]
struct Pending {
    closed: bool,
    waiters: HashMap<u64, oneshot::Sender<ControlResponse>>,
}

/// Supervisor side of an established channel.
pub struct ControlChannel {
    requests: mpsc::UnboundedSender<Envelope>,
    pending: Arc<Mutex<Pending>>,
    next_id: AtomicU64,
    pump: JoinHandle<()>,
}

impl ControlChannel {
    /// Wait for the context's readiness signal, then start routing responses.
    pub async fn connect(link: SupervisorLink, handshake_timeout: Duration) -> Result<Self> {
        let SupervisorLink {
            requests,
            mut messages,
        } = link;

        match tokio::time::timeout(handshake_timeout, messages.recv()).await {
            Ok(Some(ContextMessage::Ready)) => {}
            Ok(Some(other)) => {
                return Err(LaunchError::HandshakeFailed(format!(
                    "expected readiness signal, got {:?}",
                    other
                )))
            }
            Ok(None) => {
                return Err(LaunchError::HandshakeFailed(
                    "context closed before signalling readiness".to_string(),
                ))
            }
            Err(_) => {
                return Err(LaunchError::HandshakeFailed(format!(
                    "no readiness signal within {:?}",
                    handshake_timeout
                )))
            }
        }
        debug!("execution context is ready");

        let pending = Arc::new(Mutex::new(Pending::default()));
        let pump = tokio::spawn(pump(messages, pending.clone()));
        Ok(Self {
            requests,
            pending,
            next_id: AtomicU64::new(1),
            pump,
        })
    }

    pub async fn initialize(
        &self,
        image: RuntimeImage,
        location: RuntimeLocation,
        profile: GuestProfile,
    ) -> Result<()> {
        let request = ControlRequest::Initialize {
            image,
            location,
            profile,
        };
        match self.request(request).await? {
            ControlResponse::Initialized => Ok(()),
            ControlResponse::Failed(message) => Err(LaunchError::ExecutionFailed(message)),
            other => Err(unexpected("initialize", &other)),
        }
    }

    /// Run a file; resolves with the guest's exit code.
    pub async fn execute_file(
        &self,
        file: Url,
        guest_path: String,
        mounts: MountTable,
        port: SyncPort,
    ) -> Result<i32> {
        let request = ControlRequest::ExecuteFile {
            file,
            guest_path,
            mounts,
            port,
        };
        exit_code("executeFile", self.request(request).await?)
    }

    /// Start the interactive interpreter; resolves with its exit code.
    pub async fn run_repl(&self, mounts: MountTable, port: SyncPort) -> Result<i32> {
        let request = ControlRequest::RunRepl { mounts, port };
        exit_code("runRepl", self.request(request).await?)
    }

    async fn request(&self, request: ControlRequest) -> Result<ControlResponse> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let kind = request.kind();
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.pending.lock().await;
            if pending.closed {
                return Err(LaunchError::ChannelClosed);
            }
            pending.waiters.insert(id, tx);
        }

        if self.requests.send(Envelope { id, request }).is_err() {
            self.pending.lock().await.waiters.remove(&id);
            return Err(LaunchError::ChannelClosed);
        }
        debug!(id, kind, "sent control request");

        rx.await.map_err(|_| LaunchError::ChannelClosed)
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.pump.abort();
    }
}

async fn pump(mut messages: mpsc::UnboundedReceiver<ContextMessage>, pending: Arc<Mutex<Pending>>) {
    while let Some(message) = messages.recv().await {
        match message {
            ContextMessage::Response { id, response } => {
                match pending.lock().await.waiters.remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(response);
                    }
                    None => warn!(id, "response for unknown control request"),
                }
            }
            ContextMessage::Ready => warn!("duplicate readiness signal"),
        }
    }

    // Dropping the senders fails every outstanding request.
    let mut pending = pending.lock().await;
    pending.closed = true;
    pending.waiters.clear();
    debug!("control channel closed");
}

fn exit_code(kind: &str, response: ControlResponse) -> Result<i32> {
    match response {
        ControlResponse::Exited(code) => Ok(code),
        ControlResponse::Failed(message) => Err(LaunchError::ExecutionFailed(message)),
        other => Err(unexpected(kind, &other)),
    }
}

fn unexpected(kind: &str, response: &ControlResponse) -> LaunchError {
    LaunchError::ExecutionFailed(format!("unexpected response to {}: {:?}", kind, response))
}
