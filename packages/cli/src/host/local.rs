//! Host services for a workspace on the local disk.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;
use url::Url;

use guestbox_runtime::{
    DirEntry, FileKind, FileStat, FileSystem, HostServices, OutputStream, ServiceError,
    ServiceResult, WorkspaceFolder,
};

use super::remote::GithubRemote;
use super::terminal::Terminal;
use crate::CliError;

/// `file:` URI of an existing local path.
pub fn file_uri(path: &Path) -> Result<Url, CliError> {
    let canonical = std::fs::canonicalize(path)?;
    Url::from_file_path(&canonical).map_err(|_| CliError::InvalidPath(path.to_path_buf()))
}

/// A workspace folder named after the directory.
pub fn workspace_folder(path: &Path) -> Result<WorkspaceFolder, CliError> {
    let canonical = std::fs::canonicalize(path)?;
    if !canonical.is_dir() {
        return Err(CliError::InvalidPath(path.to_path_buf()));
    }
    let name = canonical
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "root".to_string());
    let uri = Url::from_file_path(&canonical).map_err(|_| CliError::InvalidPath(path.to_path_buf()))?;
    Ok(WorkspaceFolder::new(name, uri))
}

/// Local files, remote runtime files and a terminal.
pub struct LocalHost {
    folders: Vec<WorkspaceFolder>,
    active: Option<Url>,
    remote: Arc<GithubRemote>,
    terminal: Arc<dyn Terminal>,
}

impl LocalHost {
    pub fn new(
        folders: Vec<WorkspaceFolder>,
        remote: Arc<GithubRemote>,
        terminal: Arc<dyn Terminal>,
    ) -> Self {
        Self {
            folders,
            active: None,
            remote,
            terminal,
        }
    }

    pub fn with_active_document(mut self, active: Option<Url>) -> Self {
        self.active = active;
        self
    }

    async fn read(&self, uri: &Url) -> ServiceResult<Bytes> {
        if self.remote.handles(uri) {
            return self.remote.read(uri).await;
        }
        let path = local_path(uri)?;
        if tokio::fs::metadata(&path).await?.is_dir() {
            return Err(ServiceError::IsADirectory(uri.to_string()));
        }
        Ok(Bytes::from(tokio::fs::read(&path).await?))
    }
}

fn local_path(uri: &Url) -> ServiceResult<std::path::PathBuf> {
    if uri.scheme() != "file" {
        return Err(ServiceError::Unsupported(uri.to_string()));
    }
    uri.to_file_path()
        .map_err(|_| ServiceError::Unsupported(uri.to_string()))
}

#[async_trait]
impl HostServices for LocalHost {
    async fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
        self.folders.clone()
    }

    async fn active_document(&self) -> Option<Url> {
        self.active.clone()
    }

    async fn read_file(&self, uri: &Url) -> ServiceResult<Bytes> {
        self.read(uri).await
    }

    async fn write_file(&self, uri: &Url, contents: Bytes) -> ServiceResult<()> {
        if self.remote.handles(uri) {
            return Err(ServiceError::PermissionDenied(format!(
                "read-only location: {}",
                uri
            )));
        }
        let path = local_path(uri)?;
        tokio::fs::write(&path, &contents).await?;
        Ok(())
    }

    async fn stat(&self, uri: &Url) -> ServiceResult<FileStat> {
        if self.remote.handles(uri) {
            return self.remote.stat(uri).await;
        }
        let metadata = tokio::fs::metadata(local_path(uri)?).await?;
        Ok(if metadata.is_dir() {
            FileStat::directory()
        } else {
            FileStat::file(metadata.len())
        })
    }

    async fn read_directory(&self, uri: &Url) -> ServiceResult<Vec<DirEntry>> {
        if self.remote.handles(uri) {
            return self.remote.list(uri).await;
        }
        let mut entries = Vec::new();
        let mut dir = tokio::fs::read_dir(local_path(uri)?).await?;
        while let Some(entry) = dir.next_entry().await? {
            let kind = if entry.file_type().await?.is_dir() {
                FileKind::Directory
            } else {
                FileKind::File
            };
            entries.push(DirEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                kind,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn terminal_write(&self, stream: OutputStream, bytes: Bytes) -> ServiceResult<()> {
        self.terminal.write(stream, bytes).await
    }

    async fn terminal_read(&self, max: usize) -> ServiceResult<Bytes> {
        self.terminal.read(max).await
    }

    fn exit(&self, code: i32) {
        debug!(code, "guest exited");
    }
}

#[async_trait]
impl FileSystem for LocalHost {
    async fn read_file(&self, uri: &Url) -> ServiceResult<Bytes> {
        self.read(uri).await
    }
}
