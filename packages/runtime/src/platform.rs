//! Ways to host an isolated execution context.
//!
//! A [`Platform`] owns at most one context at a time. The launcher creates it,
//! talks to it only through the returned [`SupervisorLink`], and terminates it
//! exactly once.

use std::sync::Arc;

use tracing::debug;

use crate::bridge::{self, ServiceConnection, SyncPort};
use crate::channel::{self, SupervisorLink};
use crate::engine::{GuestEngine, Interrupt};
use crate::error::{LaunchError, Result};
use crate::launcher::LaunchId;
use crate::worker::Worker;

/// Capabilities the launcher needs from its host environment.
pub trait Platform: Send {
    /// Start an isolated context running a [`Worker`].
    fn create_context(&mut self, id: LaunchId) -> Result<SupervisorLink>;

    /// A fresh bridge for one run request.
    fn create_sync_endpoint(&self) -> (ServiceConnection, SyncPort) {
        bridge::channel()
    }

    /// Forcefully stop the current context, if any.
    fn terminate_context(&mut self);
}

/// Runs each context on a dedicated OS thread.
pub struct ThreadPlatform {
    engine: Arc<dyn GuestEngine>,
    current: Option<Context<std::thread::JoinHandle<()>>>,
}

struct Context<H> {
    id: LaunchId,
    interrupt: Interrupt,
    _handle: H,
}

impl ThreadPlatform {
    pub fn new(engine: Arc<dyn GuestEngine>) -> Self {
        Self {
            engine,
            current: None,
        }
    }
}

impl Platform for ThreadPlatform {
    fn create_context(&mut self, id: LaunchId) -> Result<SupervisorLink> {
        let (link, endpoint) = channel::pair();
        let interrupt = Interrupt::new();
        let worker = Worker::new(self.engine.clone(), interrupt.clone());
        let handle = std::thread::Builder::new()
            .name(format!("guestbox-{}", id))
            .spawn(move || worker.listen(endpoint))
            .map_err(|e| LaunchError::ContextStartFailed(e.to_string()))?;
        debug!(launch = %id, "started context thread");

        self.current = Some(Context {
            id,
            interrupt,
            _handle: handle,
        });
        Ok(link)
    }

    fn terminate_context(&mut self) {
        if let Some(context) = self.current.take() {
            debug!(launch = %context.id, "terminating context thread");
            context.interrupt.trigger();
        }
    }
}

/// Runs each context on the tokio blocking pool.
///
/// Requires a running tokio runtime.
pub struct TaskPlatform {
    engine: Arc<dyn GuestEngine>,
    current: Option<Context<tokio::task::JoinHandle<()>>>,
}

impl TaskPlatform {
    pub fn new(engine: Arc<dyn GuestEngine>) -> Self {
        Self {
            engine,
            current: None,
        }
    }
}

impl Platform for TaskPlatform {
    fn create_context(&mut self, id: LaunchId) -> Result<SupervisorLink> {
        let runtime = tokio::runtime::Handle::try_current()
            .map_err(|e| LaunchError::ContextStartFailed(e.to_string()))?;
        let (link, endpoint) = channel::pair();
        let interrupt = Interrupt::new();
        let worker = Worker::new(self.engine.clone(), interrupt.clone());
        let handle = runtime.spawn_blocking(move || worker.listen(endpoint));
        debug!(launch = %id, "started context task");

        self.current = Some(Context {
            id,
            interrupt,
            _handle: handle,
        });
        Ok(link)
    }

    fn terminate_context(&mut self) {
        if let Some(context) = self.current.take() {
            debug!(launch = %context.id, "terminating context task");
            context.interrupt.trigger();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::SyncClient;
    use crate::engine::{ExitHandler, GuestConfig};
    use crate::error::EngineError;
    use crate::resolver::RuntimeImage;

    /// Spins until interrupted.
    struct SpinEngine;

    impl GuestEngine for SpinEngine {
        fn run(
            &self,
            _image: &RuntimeImage,
            _client: SyncClient,
            _config: GuestConfig,
            interrupt: &Interrupt,
            _on_exit: ExitHandler,
        ) -> std::result::Result<(), EngineError> {
            while !interrupt.is_triggered() {
                std::thread::yield_now();
            }
            Err(EngineError::Interrupted)
        }
    }

    #[test]
    fn task_platform_needs_a_runtime() {
        let mut platform = TaskPlatform::new(Arc::new(SpinEngine));
        let result = platform.create_context(LaunchId::new());
        assert!(matches!(result, Err(LaunchError::ContextStartFailed(_))));
    }

    #[test]
    fn terminate_without_context_is_a_no_op() {
        let mut platform = ThreadPlatform::new(Arc::new(SpinEngine));
        platform.terminate_context();
        platform.terminate_context();
    }

    #[tokio::test]
    async fn thread_platform_signals_readiness() {
        let mut platform = ThreadPlatform::new(Arc::new(SpinEngine));
        let link = platform.create_context(LaunchId::new()).unwrap();
        let channel = crate::channel::ControlChannel::connect(link, std::time::Duration::from_secs(5))
            .await;
        assert!(channel.is_ok());
        platform.terminate_context();
    }
}
