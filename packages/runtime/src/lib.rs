//! guestbox runtime: run a WebAssembly guest interpreter against host files.
//!
//! The guest runs in an isolated execution context (a thread or a blocking
//! task) and performs what look like ordinary blocking syscalls. Each of them
//! crosses a synchronous bridge back to the supervisor, which answers using
//! the host's own capabilities.
//!
//! # Architecture
//!
//! - **[`resolver`]**: finds and fetches the guest runtime image, once
//! - **[`channel`]**: control channel to an execution context, with handshake
//! - **[`bridge`]**: blocking guest I/O serviced by async host tasks
//! - **[`namespace`]**: maps workspace folders into the guest filesystem
//! - **[`launcher`]**: drives one execution request through its lifecycle
//! - **[`platform`]**: hosts execution contexts on threads or the tokio pool
//! - **[`worker`]**: the context side of the control channel
//! - **[`engine`]** and **[`wasi`]**: the guest engine boundary and a
//!   wasmtime implementation
//!
//! # Example
//!
//! ```ignore
//! let resolver = Arc::new(RuntimeResolver::new(settings, remote, files));
//! let platform = ThreadPlatform::new(Arc::new(WasiEngine::new()));
//! let launcher = Launcher::new(resolver, host, platform);
//! let result = launcher.run(ExecutionRequest::RunRepl).await?;
//! std::process::exit(result.exit_code);
//! ```

pub mod bridge;
pub mod channel;
pub mod engine;
pub mod error;
pub mod launcher;
pub mod namespace;
pub mod platform;
pub mod resolver;
pub mod wasi;
pub mod worker;

pub use bridge::{DirEntry, FileKind, FileStat, HostServices, OutputStream, ServiceResult};
pub use engine::{GuestConfig, GuestEngine, GuestProfile, Interrupt};
pub use error::{EngineError, FailureKind, LaunchError, Result, ServiceError};
pub use launcher::{
    ExecutionRequest, ExecutionResult, LaunchHandle, LaunchId, LaunchState, Launcher,
    LauncherOptions,
};
pub use namespace::{MountTable, NamespaceMount, WorkspaceFolder};
pub use platform::{Platform, TaskPlatform, ThreadPlatform};
pub use resolver::{
    Configuration, FileSystem, RemoteRepositories, ResolverConfig, RuntimeImage, RuntimeLocation,
    RuntimeResolver,
};
pub use wasi::WasiEngine;
