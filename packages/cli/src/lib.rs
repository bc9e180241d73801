//! # guestbox-cli
//!
//! Runs a WebAssembly guest interpreter against local workspace folders.
//!
//! ```bash
//! # Run a script; its directory's workspace is the current directory
//! guestbox run hello.py
//!
//! # Interactive interpreter with two workspace folders
//! guestbox repl -w ./app -w ./lib
//!
//! # Use a different runtime repository
//! GUESTBOX_RUNTIME=https://github.com/me/my-python guestbox repl
//! ```

pub mod host;
pub mod settings;

use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use guestbox_runtime::{
    GuestEngine, LaunchError, Launcher, RuntimeResolver, TaskPlatform, ThreadPlatform, WasiEngine,
};

use host::{GithubRemote, LocalHost, StdioTerminal};
pub use settings::Settings;

#[derive(Debug, Error)]
pub enum CliError {
    #[error(transparent)]
    Launch(#[from] LaunchError),

    #[error("invalid settings file {}: {message}", path.display())]
    Settings { path: PathBuf, message: String },

    #[error("not a usable path: {}", .0.display())]
    InvalidPath(PathBuf),

    #[error("invalid URL {0}")]
    InvalidUrl(String),

    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// What the CLI was asked to do.
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// File to run; `None` starts the interactive interpreter.
    pub target: Option<PathBuf>,

    /// Workspace folders. Empty means the current directory.
    pub workspaces: Vec<PathBuf>,

    pub settings: Settings,

    /// Run the guest on the tokio blocking pool instead of its own thread.
    pub pooled: bool,
}

/// Run one guest and return its exit code.
pub async fn run(options: RunOptions) -> Result<i32, CliError> {
    let RunOptions {
        target,
        workspaces,
        settings,
        pooled,
    } = options;

    let workspaces = if workspaces.is_empty() {
        vec![std::env::current_dir()?]
    } else {
        workspaces
    };
    let folders = workspaces
        .iter()
        .map(|path| host::workspace_folder(path))
        .collect::<Result<Vec<_>, _>>()?;
    let active = target.as_deref().map(host::file_uri).transpose()?;

    let remote = Arc::new(GithubRemote::from_settings(&settings)?);
    let local = Arc::new(
        LocalHost::new(folders, remote.clone(), Arc::new(StdioTerminal::new()))
            .with_active_document(active),
    );
    let launcher_options = settings.launcher_options();
    let resolver = Arc::new(RuntimeResolver::new(
        Arc::new(settings),
        remote,
        local.clone(),
    ));
    let engine: Arc<dyn GuestEngine> = Arc::new(WasiEngine::new());

    let result = if pooled {
        Launcher::new(resolver, local, TaskPlatform::new(engine))
            .with_options(launcher_options)
            .run_active_document()
            .await?
    } else {
        Launcher::new(resolver, local, ThreadPlatform::new(engine))
            .with_options(launcher_options)
            .run_active_document()
            .await?
    };
    info!(exit_code = result.exit_code, "guest finished");
    Ok(result.exit_code)
}
