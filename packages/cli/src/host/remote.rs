//! GitHub repositories as a read-only virtual filesystem.
//!
//! A repository `https://github.com/<owner>/<repo>` is addressed as
//! `vscode-vfs://github/<owner>/<repo>/<path>`. Loading a repository fetches
//! its recursive tree index once; file contents are downloaded on first read
//! and kept in the cache directory.

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, USER_AGENT};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, warn};
use url::Url;

use guestbox_runtime::{
    DirEntry, FileKind, FileStat, RemoteRepositories, ServiceError, ServiceResult,
};

use crate::settings::Settings;
use crate::CliError;

/// Scheme of virtual repository URIs.
pub const VIRTUAL_SCHEME: &str = "vscode-vfs";

const VIRTUAL_AUTHORITY: &str = "github";

#[derive(Debug, Deserialize)]
struct TreeResponse {
    tree: Vec<TreeItem>,
    #[serde(default)]
    truncated: bool,
}

#[derive(Debug, Deserialize)]
struct TreeItem {
    path: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    size: Option<u64>,
}

/// The file index of one repository.
#[derive(Debug, Default)]
struct RepoTree {
    entries: BTreeMap<String, FileStat>,
}

impl RepoTree {
    fn from_response(response: TreeResponse) -> Self {
        let entries = response
            .tree
            .into_iter()
            .filter_map(|item| {
                let stat = match item.kind.as_str() {
                    "blob" => FileStat::file(item.size.unwrap_or(0)),
                    "tree" => FileStat::directory(),
                    _ => return None,
                };
                Some((item.path, stat))
            })
            .collect();
        Self { entries }
    }

    fn stat(&self, path: &str) -> Option<FileStat> {
        if path.is_empty() {
            return Some(FileStat::directory());
        }
        self.entries.get(path).copied()
    }

    fn list(&self, dir: &str) -> Vec<DirEntry> {
        self.entries
            .iter()
            .filter_map(|(path, stat)| {
                let name = if dir.is_empty() {
                    path.as_str()
                } else {
                    path.strip_prefix(dir)?.strip_prefix('/')?
                };
                (!name.is_empty() && !name.contains('/')).then(|| DirEntry {
                    name: name.to_string(),
                    kind: stat.kind,
                })
            })
            .collect()
    }
}

/// A location inside a virtual repository URI.
#[derive(Debug, Clone, PartialEq, Eq)]
struct RepoPath {
    owner: String,
    repo: String,
    path: String,
}

impl RepoPath {
    fn parse(uri: &Url) -> ServiceResult<Self> {
        if uri.scheme() != VIRTUAL_SCHEME {
            return Err(ServiceError::Unsupported(uri.to_string()));
        }
        let mut segments = uri
            .path()
            .split('/')
            .filter(|segment| !segment.is_empty());
        let (Some(owner), Some(repo)) = (segments.next(), segments.next()) else {
            return Err(ServiceError::NotFound(uri.to_string()));
        };
        Ok(Self {
            owner: owner.to_string(),
            repo: repo.to_string(),
            path: segments.collect::<Vec<_>>().join("/"),
        })
    }

    fn key(&self) -> String {
        format!("{}/{}", self.owner, self.repo)
    }
}

pub struct GithubRemote {
    client: Client,
    api_base: Url,
    raw_base: Url,
    cache_dir: Option<PathBuf>,
    trees: Mutex<HashMap<String, Arc<RepoTree>>>,
}

impl GithubRemote {
    pub fn new(api_base: Url, raw_base: Url, cache_dir: Option<PathBuf>) -> Result<Self, CliError> {
        let mut headers = HeaderMap::new();
        headers.insert(
            USER_AGENT,
            HeaderValue::from_static(concat!("guestbox/", env!("CARGO_PKG_VERSION"))),
        );
        headers.insert(ACCEPT, HeaderValue::from_static("application/vnd.github+json"));
        let client = Client::builder().default_headers(headers).build()?;

        Ok(Self {
            client,
            api_base,
            raw_base,
            cache_dir,
            trees: Mutex::new(HashMap::new()),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, CliError> {
        Self::new(
            parse_base(settings.github_api_url())?,
            parse_base(settings.github_raw_url())?,
            settings.cache_dir(),
        )
    }

    /// Whether `uri` addresses this remote.
    pub fn handles(&self, uri: &Url) -> bool {
        uri.scheme() == VIRTUAL_SCHEME
    }

    pub async fn read(&self, uri: &Url) -> ServiceResult<Bytes> {
        let location = RepoPath::parse(uri)?;
        if let Some(path) = self.cache_path(&location) {
            if let Ok(bytes) = tokio::fs::read(&path).await {
                debug!(%uri, "read from cache");
                return Ok(Bytes::from(bytes));
            }
        }

        let url = join(
            &self.raw_base,
            &format!("{}/{}/HEAD/{}", location.owner, location.repo, location.path),
        )?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ServiceError::Io(format!("HTTP request failed: {}", e)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ServiceError::NotFound(uri.to_string()));
        }
        if !response.status().is_success() {
            return Err(ServiceError::Io(format!("HTTP error: {}", response.status())));
        }
        let bytes = response
            .bytes()
            .await
            .map_err(|e| ServiceError::Io(e.to_string()))?;

        if let Some(path) = self.cache_path(&location) {
            if let Err(error) = write_cache(&path, &bytes).await {
                warn!(path = %path.display(), %error, "failed to cache remote file");
            }
        }
        Ok(bytes)
    }

    pub async fn stat(&self, uri: &Url) -> ServiceResult<FileStat> {
        let location = RepoPath::parse(uri)?;
        let tree = self.tree(&location).await?;
        tree.stat(&location.path)
            .ok_or_else(|| ServiceError::NotFound(uri.to_string()))
    }

    pub async fn list(&self, uri: &Url) -> ServiceResult<Vec<DirEntry>> {
        let location = RepoPath::parse(uri)?;
        let tree = self.tree(&location).await?;
        match tree.stat(&location.path) {
            Some(stat) if stat.kind == FileKind::Directory => Ok(tree.list(&location.path)),
            Some(_) => Err(ServiceError::Unsupported(format!("not a directory: {}", uri))),
            None => Err(ServiceError::NotFound(uri.to_string())),
        }
    }

    async fn tree(&self, location: &RepoPath) -> ServiceResult<Arc<RepoTree>> {
        let key = location.key();
        let mut trees = self.trees.lock().await;
        if let Some(tree) = trees.get(&key) {
            return Ok(tree.clone());
        }

        let url = join(
            &self.api_base,
            &format!("repos/{}/git/trees/HEAD?recursive=1", key),
        )?;
        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| ServiceError::Io(format!("HTTP request failed: {}", e)))?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(ServiceError::NotFound(key));
        }
        if !response.status().is_success() {
            return Err(ServiceError::Io(format!("HTTP error: {}", response.status())));
        }
        let body = response
            .bytes()
            .await
            .map_err(|e| ServiceError::Io(e.to_string()))?;
        let parsed: TreeResponse = serde_json::from_slice(&body)
            .map_err(|e| ServiceError::Io(format!("invalid tree index: {}", e)))?;
        if parsed.truncated {
            warn!(repository = %key, "tree index is truncated");
        }

        let tree = Arc::new(RepoTree::from_response(parsed));
        debug!(repository = %key, entries = tree.entries.len(), "loaded repository index");
        trees.insert(key, tree.clone());
        Ok(tree)
    }

    fn cache_path(&self, location: &RepoPath) -> Option<PathBuf> {
        let dir = self.cache_dir.as_ref()?;
        let mut path = dir.join(&location.owner).join(&location.repo);
        for segment in location.path.split('/') {
            if segment.is_empty() || segment == "." || segment == ".." {
                return None;
            }
            path.push(segment);
        }
        Some(path)
    }
}

#[async_trait]
impl RemoteRepositories for GithubRemote {
    fn virtual_uri(&self, repository: &Url) -> Url {
        let uri = format!(
            "{}://{}{}",
            VIRTUAL_SCHEME,
            VIRTUAL_AUTHORITY,
            repository.path().trim_end_matches('/')
        );
        Url::parse(&uri).unwrap_or_else(|_| repository.clone())
    }

    async fn load_workspace_contents(&self, repository: &Url) -> ServiceResult<()> {
        let location = RepoPath::parse(repository)?;
        self.tree(&location).await.map(|_| ())
    }
}

fn parse_base(base: &str) -> Result<Url, CliError> {
    let with_slash = if base.ends_with('/') {
        base.to_string()
    } else {
        format!("{}/", base)
    };
    Url::parse(&with_slash).map_err(|e| CliError::InvalidUrl(format!("{}: {}", base, e)))
}

fn join(base: &Url, relative: &str) -> ServiceResult<Url> {
    base.join(relative)
        .map_err(|e| ServiceError::Io(format!("invalid URL {}: {}", relative, e)))
}

async fn write_cache(path: &std::path::Path, bytes: &[u8]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, bytes).await
}
