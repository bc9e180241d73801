//! The boundary between the worker and whatever actually runs the guest.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use serde::Deserialize;

use crate::bridge::SyncClient;
use crate::error::EngineError;
use crate::namespace::MountTable;
use crate::resolver::RuntimeImage;

/// Called by the engine with the guest's exit code.
pub type ExitHandler = Box<dyn FnMut(i32) + Send>;

/// How to start the guest interpreter.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GuestProfile {
    /// `argv[0]` of the guest.
    pub interpreter: String,

    /// Flags placed between the interpreter and the target file.
    pub flags: Vec<String>,

    /// Environment variable that receives the mount search path.
    pub search_path_var: String,

    /// Name used for the guest's terminal.
    pub display_name: String,
}

impl Default for GuestProfile {
    fn default() -> Self {
        Self {
            interpreter: "python".to_string(),
            flags: vec!["-B".to_string(), "-X".to_string(), "utf8".to_string()],
            search_path_var: "PYTHONPATH".to_string(),
            display_name: "Python WASM".to_string(),
        }
    }
}

impl GuestProfile {
    pub fn argv(&self, target: Option<&str>) -> Vec<String> {
        std::iter::once(self.interpreter.clone())
            .chain(self.flags.iter().cloned())
            .chain(target.map(str::to_string))
            .collect()
    }

    /// The full configuration for one guest run.
    pub fn config(&self, mounts: MountTable, target: Option<&str>) -> GuestConfig {
        let mut env = BTreeMap::new();
        env.insert(self.search_path_var.clone(), mounts.search_path());
        GuestConfig {
            name: self.display_name.clone(),
            argv: self.argv(target),
            env,
            mounts,
        }
    }
}

/// Everything an engine needs besides the image and the bridge.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestConfig {
    pub name: String,
    pub mounts: MountTable,
    pub argv: Vec<String>,
    pub env: BTreeMap<String, String>,
}

/// Forceful termination signal shared between a platform and its engine.
///
/// Hooks registered with [`Interrupt::on_trigger`] run once, on the thread
/// that calls [`Interrupt::trigger`]. A hook registered after the trigger
/// runs immediately.
#[derive(Clone, Default)]
pub struct Interrupt {
    inner: Arc<InterruptInner>,
}

#[derive(Default)]
struct InterruptInner {
    triggered: AtomicBool,
    hooks: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

impl Interrupt {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger(&self) {
        if self.inner.triggered.swap(true, Ordering::SeqCst) {
            return;
        }
        let hooks = std::mem::take(
            &mut *self
                .inner
                .hooks
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        for hook in hooks {
            hook();
        }
    }

    pub fn is_triggered(&self) -> bool {
        self.inner.triggered.load(Ordering::SeqCst)
    }

    pub fn on_trigger(&self, hook: impl FnOnce() + Send + 'static) {
        let mut hooks = self
            .inner
            .hooks
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if self.is_triggered() {
            drop(hooks);
            hook();
        } else {
            hooks.push(Box::new(hook));
        }
    }
}

impl std::fmt::Debug for Interrupt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Interrupt")
            .field("triggered", &self.is_triggered())
            .finish()
    }
}

/// Runs a guest image to completion on the calling thread.
///
/// The calling thread may block. An engine reports an explicit exit through
/// `on_exit`; returning `Ok` without calling it means exit code `0`.
pub trait GuestEngine: Send + Sync + 'static {
    fn run(
        &self,
        image: &RuntimeImage,
        client: SyncClient,
        config: GuestConfig,
        interrupt: &Interrupt,
        on_exit: ExitHandler,
    ) -> Result<(), EngineError>;
}
