//! The execution-context side of the control channel.

use std::sync::{Arc, OnceLock};

use tracing::{debug, warn};

use crate::bridge::SyncPort;
use crate::channel::{ContextEndpoint, ControlRequest, ControlResponse, Envelope};
use crate::engine::{ExitHandler, GuestEngine, GuestProfile, Interrupt};
use crate::namespace::MountTable;
use crate::resolver::RuntimeImage;

/// Serves control requests inside an isolated context.
pub struct Worker {
    engine: Arc<dyn GuestEngine>,
    interrupt: Interrupt,
    image: Option<RuntimeImage>,
    profile: GuestProfile,
}

impl Worker {
    pub fn new(engine: Arc<dyn GuestEngine>, interrupt: Interrupt) -> Self {
        Self {
            engine,
            interrupt,
            image: None,
            profile: GuestProfile::default(),
        }
    }

    /// Signal readiness, then answer requests until the supervisor hangs up.
    ///
    /// Blocks the calling thread.
    pub fn listen(mut self, mut endpoint: ContextEndpoint) {
        if !endpoint.ready() {
            debug!("supervisor gone before the worker was ready");
            return;
        }
        while let Some(Envelope { id, request }) = endpoint.next_request() {
            let response = self.handle(request);
            if !endpoint.respond(id, response) {
                break;
            }
        }
        debug!("worker stopped");
    }

    fn handle(&mut self, request: ControlRequest) -> ControlResponse {
        match request {
            ControlRequest::Initialize {
                image,
                location,
                profile,
            } => {
                debug!(root = %location.root(), image_len = image.len(), "worker initialized");
                self.image = Some(image);
                self.profile = profile;
                ControlResponse::Initialized
            }
            ControlRequest::ExecuteFile {
                guest_path,
                mounts,
                port,
                ..
            } => self.run(Some(&guest_path), mounts, port),
            ControlRequest::RunRepl { mounts, port } => self.run(None, mounts, port),
        }
    }

    fn run(&self, target: Option<&str>, mounts: MountTable, port: SyncPort) -> ControlResponse {
        let Some(image) = &self.image else {
            return ControlResponse::Failed("execution context is not initialized".to_string());
        };
        let client = match port.connect() {
            Ok(client) => client,
            Err(error) => return ControlResponse::Failed(error.to_string()),
        };
        let config = self.profile.config(mounts, target);

        let recorded = Arc::new(OnceLock::new());
        let on_exit: ExitHandler = {
            let recorded = recorded.clone();
            Box::new(move |code| {
                let _ = recorded.set(code);
            })
        };

        let outcome = self
            .engine
            .run(image, client, config, &self.interrupt, on_exit);
        match (recorded.get().copied(), outcome) {
            (Some(code), _) => ControlResponse::Exited(code),
            (None, Ok(())) => ControlResponse::Exited(0),
            (None, Err(error)) => {
                warn!(%error, "guest engine failed");
                ControlResponse::Failed(error.to_string())
            }
        }
    }
}
