//! Execution launcher.
//!
//! A [`Launcher`] runs one request from start to finish:
//!
//! ```text
//! Created -> AwaitingImage -> ContextStarting -> Handshaking
//!         -> Initializing -> Running -> Completed
//! ```
//!
//! Any non-terminal state can move to `Failed`. Once a context has been
//! created it is terminated exactly once, whatever the outcome.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::bridge::HostServices;
use crate::channel::{ControlChannel, SupervisorLink};
use crate::engine::GuestProfile;
use crate::error::{FailureKind, Result};
use crate::namespace::MountTable;
use crate::platform::Platform;
use crate::resolver::{RuntimeImage, RuntimeLocation, RuntimeResolver};

/// Unique identifier for a launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LaunchId(Uuid);

impl LaunchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for LaunchId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for LaunchId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where a launch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LaunchState {
    Created,
    AwaitingImage,
    ContextStarting,
    Handshaking,
    Initializing,
    Running,
    Completed,
    Failed(FailureKind),
}

impl LaunchState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, LaunchState::Completed | LaunchState::Failed(_))
    }
}

/// Observes a launch from outside.
#[derive(Debug, Clone)]
pub struct LaunchHandle {
    pub id: LaunchId,
    state: Arc<watch::Sender<LaunchState>>,
}

impl LaunchHandle {
    fn new(id: LaunchId) -> Self {
        let (state, _) = watch::channel(LaunchState::Created);
        Self {
            id,
            state: Arc::new(state),
        }
    }

    pub fn state(&self) -> LaunchState {
        *self.state.borrow()
    }

    /// A receiver that sees every later state change.
    pub fn subscribe(&self) -> watch::Receiver<LaunchState> {
        self.state.subscribe()
    }

    fn set_state(&self, state: LaunchState) {
        let previous = self.state.send_replace(state);
        debug!(launch = %self.id, from = ?previous, to = ?state, "launch state");
    }
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionRequest {
    /// Run a host file. Files outside every workspace folder fall back to
    /// the interactive interpreter.
    RunFile(Url),
    RunRepl,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
}

/// Tunables for a launch.
#[derive(Debug, Clone)]
pub struct LauncherOptions {
    /// How long to wait for the context's readiness signal.
    pub handshake_timeout: Duration,

    /// How long to wait for in-flight bridge calls after the guest exits.
    pub drain_timeout: Duration,

    pub profile: GuestProfile,
}

impl Default for LauncherOptions {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(10),
            drain_timeout: Duration::from_secs(5),
            profile: GuestProfile::default(),
        }
    }
}

/// Runs one execution request in a fresh isolated context.
pub struct Launcher<P> {
    handle: LaunchHandle,
    resolver: Arc<RuntimeResolver>,
    host: Arc<dyn HostServices>,
    platform: P,
    options: LauncherOptions,
}

impl<P: Platform> Launcher<P> {
    pub fn new(resolver: Arc<RuntimeResolver>, host: Arc<dyn HostServices>, platform: P) -> Self {
        Self {
            handle: LaunchHandle::new(LaunchId::new()),
            resolver,
            host,
            platform,
            options: LauncherOptions::default(),
        }
    }

    pub fn with_options(mut self, options: LauncherOptions) -> Self {
        self.options = options;
        self
    }

    pub fn id(&self) -> LaunchId {
        self.handle.id
    }

    /// A handle for watching this launch's state.
    pub fn handle(&self) -> LaunchHandle {
        self.handle.clone()
    }

    /// Run the host's active document, or the interpreter when none is open.
    pub async fn run_active_document(self) -> Result<ExecutionResult> {
        let request = match self.host.active_document().await {
            Some(uri) => ExecutionRequest::RunFile(uri),
            None => ExecutionRequest::RunRepl,
        };
        self.run(request).await
    }

    pub async fn run(mut self, request: ExecutionRequest) -> Result<ExecutionResult> {
        let id = self.handle.id;
        info!(launch = %id, ?request, "starting launch");

        let outcome = self.drive(request).await;
        match &outcome {
            Ok(result) => {
                self.handle.set_state(LaunchState::Completed);
                info!(launch = %id, exit_code = result.exit_code, "launch completed");
            }
            Err(error) => {
                self.handle
                    .set_state(LaunchState::Failed(error.kind()));
                warn!(launch = %id, %error, "launch failed");
            }
        }
        outcome
    }

    async fn drive(&mut self, request: ExecutionRequest) -> Result<ExecutionResult> {
        self.handle.set_state(LaunchState::AwaitingImage);
        let image = self.resolver.image().await?;
        let location = self.resolver.resolve_location();

        self.handle.set_state(LaunchState::ContextStarting);
        let link = self.platform.create_context(self.handle.id)?;

        let outcome = self.drive_context(link, image, location, request).await;
        self.platform.terminate_context();
        outcome
    }

    async fn drive_context(
        &self,
        link: SupervisorLink,
        image: RuntimeImage,
        location: RuntimeLocation,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult> {
        self.handle.set_state(LaunchState::Handshaking);
        let channel = ControlChannel::connect(link, self.options.handshake_timeout).await?;

        self.handle.set_state(LaunchState::Initializing);
        channel
            .initialize(image, location.clone(), self.options.profile.clone())
            .await?;

        self.handle.set_state(LaunchState::Running);
        let folders = self.host.workspace_folders().await;
        let mounts = MountTable::compute(&folders, &location);
        let (connection, port) = self.platform.create_sync_endpoint();
        let mut serve = tokio::spawn(connection.serve(self.host.clone()));

        let outcome = match request {
            ExecutionRequest::RunFile(file) => match mounts.translate(&file) {
                Some(guest_path) => {
                    debug!(%file, %guest_path, "running file");
                    channel.execute_file(file, guest_path, mounts, port).await
                }
                None => {
                    debug!(%file, "file is outside the workspace, starting the interpreter");
                    channel.run_repl(mounts, port).await
                }
            },
            ExecutionRequest::RunRepl => channel.run_repl(mounts, port).await,
        };

        let exit_code = match outcome {
            Ok(code) => code,
            Err(error) => {
                serve.abort();
                return Err(error);
            }
        };

        match tokio::time::timeout(self.options.drain_timeout, &mut serve).await {
            Ok(Ok(handled)) => debug!(handled, "bridge closed"),
            Ok(Err(error)) => warn!(%error, "bridge task failed"),
            Err(_) => {
                warn!("bridge did not drain in time, abandoning in-flight calls");
                serve.abort();
            }
        }
        Ok(ExecutionResult { exit_code })
    }
}
