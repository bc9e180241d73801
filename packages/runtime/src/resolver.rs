//! Runtime image resolution.
//!
//! The resolver turns the user's runtime setting into a [`RuntimeLocation`]
//! and fetches the guest image from it. Both are computed at most once per
//! resolver; hosts keep a single resolver for the whole process so that every
//! launch shares the same image buffer.

use std::sync::{Arc, OnceLock};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::OnceCell;
use tracing::{debug, warn};
use url::Url;

use crate::error::{LaunchError, Result, ServiceError};
use crate::namespace::join_uri;

/// Setting that names the repository holding the guest runtime.
pub const RUNTIME_SETTING: &str = "python.wasm.runtime";

const DEFAULT_REPOSITORY: &str = "https://github.com/microsoft/vscode-python-web-wasm";
const DEFAULT_SUBPATH: &str = "python";
const TRUSTED_AUTHORITY: &str = "github.com";
const VIRTUAL_AUTHORITY: &str = "github";
const IMAGE_NAME: &str = "python.wasm";

/// Read access to the host's configuration store.
pub trait Configuration: Send + Sync {
    /// Look up a string setting by its dotted key.
    fn get(&self, key: &str) -> Option<String>;
}

/// The remote-repository provider that exposes a repository as a virtual
/// filesystem.
#[async_trait]
pub trait RemoteRepositories: Send + Sync {
    /// Map a repository URL to the URI of its virtual filesystem.
    fn virtual_uri(&self, repository: &Url) -> Url;

    /// Make sure the repository contents are available for reading.
    async fn load_workspace_contents(&self, repository: &Url)
        -> std::result::Result<(), ServiceError>;
}

/// The host filesystem used to read the runtime image.
#[async_trait]
pub trait FileSystem: Send + Sync {
    async fn read_file(&self, uri: &Url) -> std::result::Result<Bytes, ServiceError>;
}

/// Where the guest runtime image and its bundled library live.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeLocation {
    /// Virtual filesystem URI of the repository.
    pub repository: Url,

    /// Directory inside the repository that holds the runtime, if any.
    pub subpath: Option<String>,
}

impl RuntimeLocation {
    /// The directory mounted at the guest's `/`.
    pub fn root(&self) -> Url {
        match &self.subpath {
            Some(subpath) => join_uri(&self.repository, subpath),
            None => self.repository.clone(),
        }
    }

    /// URI of the image file below [`RuntimeLocation::root`].
    pub fn image_uri(&self, image_name: &str) -> Url {
        join_uri(&self.root(), image_name)
    }
}

/// The guest runtime image.
///
/// Cloning shares the underlying buffer; the bytes are never copied or
/// mutated after the fetch.
#[derive(Clone)]
pub struct RuntimeImage {
    bytes: Bytes,
}

impl RuntimeImage {
    pub fn new(bytes: impl Into<Bytes>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether both images share the same buffer.
    pub fn ptr_eq(&self, other: &RuntimeImage) -> bool {
        self.bytes.as_ptr() == other.bytes.as_ptr() && self.bytes.len() == other.bytes.len()
    }
}

impl std::fmt::Debug for RuntimeImage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RuntimeImage")
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Constants that drive location resolution.
#[derive(Debug, Clone)]
pub struct ResolverConfig {
    /// Configuration key holding the repository reference.
    pub setting_key: String,

    /// The only authority accepted for a configured repository.
    pub trusted_authority: String,

    /// Authority written into the resolved virtual URI.
    pub virtual_authority: String,

    /// Repository used when the setting is missing or rejected.
    pub default_repository: String,

    /// Subpath paired with the default repository.
    pub default_subpath: String,

    /// File name of the image below the runtime root.
    pub image_name: String,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            setting_key: RUNTIME_SETTING.to_string(),
            trusted_authority: TRUSTED_AUTHORITY.to_string(),
            virtual_authority: VIRTUAL_AUTHORITY.to_string(),
            default_repository: DEFAULT_REPOSITORY.to_string(),
            default_subpath: DEFAULT_SUBPATH.to_string(),
            image_name: IMAGE_NAME.to_string(),
        }
    }
}

/// Resolves and caches the runtime location and image.
pub struct RuntimeResolver {
    config: ResolverConfig,
    settings: Arc<dyn Configuration>,
    remote: Arc<dyn RemoteRepositories>,
    fs: Arc<dyn FileSystem>,
    location: OnceLock<RuntimeLocation>,
    // `None` records a failed fetch; it is never retried.
    image: OnceCell<Option<RuntimeImage>>,
}

impl RuntimeResolver {
    pub fn new(
        settings: Arc<dyn Configuration>,
        remote: Arc<dyn RemoteRepositories>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self::with_config(ResolverConfig::default(), settings, remote, fs)
    }

    pub fn with_config(
        config: ResolverConfig,
        settings: Arc<dyn Configuration>,
        remote: Arc<dyn RemoteRepositories>,
        fs: Arc<dyn FileSystem>,
    ) -> Self {
        Self {
            config,
            settings,
            remote,
            fs,
            location: OnceLock::new(),
            image: OnceCell::new(),
        }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Resolve the runtime location.
    ///
    /// Never fails: a missing, empty or untrusted setting falls back to the
    /// default repository.
    pub fn resolve_location(&self) -> RuntimeLocation {
        self.location
            .get_or_init(|| self.compute_location())
            .clone()
    }

    /// Start fetching the image without waiting for a caller that needs it.
    pub async fn preload(&self) {
        self.image.get_or_init(|| self.fetch_image()).await;
    }

    /// The runtime image, fetched on first use.
    ///
    /// Concurrent callers share one in-flight fetch. Once a fetch has failed
    /// every caller gets [`LaunchError::RuntimeUnavailable`].
    pub async fn image(&self) -> Result<RuntimeImage> {
        self.image
            .get_or_init(|| self.fetch_image())
            .await
            .clone()
            .ok_or(LaunchError::RuntimeUnavailable)
    }

    fn compute_location(&self) -> RuntimeLocation {
        let configured = self.settings.get(&self.config.setting_key);
        let (mut repository, subpath) = match self.trusted_repository(configured.as_deref()) {
            Some(url) => (url, None),
            None => {
                debug!(
                    configured = ?configured,
                    "runtime setting missing or untrusted, using default repository"
                );
                (self.default_repository(), Some(self.config.default_subpath.clone()))
            }
        };
        strip_extension(&mut repository);

        let mut repository = self.remote.virtual_uri(&repository);
        if repository
            .set_host(Some(&self.config.virtual_authority))
            .is_err()
        {
            warn!(%repository, "could not rewrite runtime repository authority");
        }
        debug!(%repository, ?subpath, "resolved runtime location");
        RuntimeLocation {
            repository,
            subpath,
        }
    }

    fn trusted_repository(&self, reference: Option<&str>) -> Option<Url> {
        let reference = reference.map(str::trim).filter(|r| !r.is_empty())?;
        let url = Url::parse(reference).ok()?;
        (url.authority() == self.config.trusted_authority).then_some(url)
    }

    fn default_repository(&self) -> Url {
        Url::parse(&self.config.default_repository)
            .or_else(|_| Url::parse(DEFAULT_REPOSITORY))
            .expect("built-in default repository is a valid URL")
    }

    async fn fetch_image(&self) -> Option<RuntimeImage> {
        let location = self.resolve_location();
        if let Err(error) = self
            .remote
            .load_workspace_contents(&location.repository)
            .await
        {
            warn!(repository = %location.repository, %error, "failed to load runtime repository");
            return None;
        }

        let uri = location.image_uri(&self.config.image_name);
        match self.fs.read_file(&uri).await {
            Ok(bytes) => {
                debug!(%uri, len = bytes.len(), "loaded runtime image");
                Some(RuntimeImage::new(bytes))
            }
            Err(error) => {
                warn!(%uri, %error, "failed to read runtime image");
                None
            }
        }
    }
}

/// Drop an extension-like suffix from the last path segment, e.g. `.git`.
fn strip_extension(url: &mut Url) {
    let path = url.path().to_string();
    let (dir, base) = path.rsplit_once('/').unwrap_or(("", path.as_str()));
    if let Some(idx) = base.rfind('.') {
        if idx > 0 {
            url.set_path(&format!("{}/{}", dir, &base[..idx]));
        }
    }
}
