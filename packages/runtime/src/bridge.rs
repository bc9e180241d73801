//! Sync I/O bridge between a guest and the supervisor.
//!
//! The guest runs on a thread that is allowed to block. Each of its I/O calls
//! becomes a [`ServiceRequest`] sent to the supervisor, and the guest thread
//! parks until a supervisor task answers. One bridge is created per launch:
//!
//! ```text
//! guest thread                          supervisor (tokio)
//! SyncPort::connect() ── waits ──────── ServiceConnection::serve(host)
//! SyncClient::call(req) ── mpsc ──────► task: host.read_file(..)
//!        parked on oneshot ◄─────────── reply
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tracing::{debug, warn};
use url::Url;

use crate::error::ServiceError;
use crate::namespace::WorkspaceFolder;

/// Result of a single bridge call.
pub type ServiceResult<T> = std::result::Result<T, ServiceError>;

/// Which terminal stream a guest write goes to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
}

/// Metadata of a host file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileStat {
    pub kind: FileKind,
    pub size: u64,
}

impl FileStat {
    pub fn file(size: u64) -> Self {
        Self {
            kind: FileKind::File,
            size,
        }
    }

    pub fn directory() -> Self {
        Self {
            kind: FileKind::Directory,
            size: 0,
        }
    }
}

/// One entry of a directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    pub name: String,
    pub kind: FileKind,
}

/// Requests a guest can issue across the bridge.
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceRequest {
    WorkspaceFolders,
    ActiveDocument,
    ReadFile { uri: Url },
    WriteFile { uri: Url, contents: Bytes },
    Stat { uri: Url },
    ReadDirectory { uri: Url },
    TerminalWrite { stream: OutputStream, bytes: Bytes },
    TerminalRead { max: usize },
    /// One-way notification; never answered.
    Exit { code: i32 },
}

impl ServiceRequest {
    fn kind(&self) -> &'static str {
        match self {
            ServiceRequest::WorkspaceFolders => "workspace_folders",
            ServiceRequest::ActiveDocument => "active_document",
            ServiceRequest::ReadFile { .. } => "read_file",
            ServiceRequest::WriteFile { .. } => "write_file",
            ServiceRequest::Stat { .. } => "stat",
            ServiceRequest::ReadDirectory { .. } => "read_directory",
            ServiceRequest::TerminalWrite { .. } => "terminal_write",
            ServiceRequest::TerminalRead { .. } => "terminal_read",
            ServiceRequest::Exit { .. } => "exit",
        }
    }
}

/// Successful answers to a [`ServiceRequest`].
#[derive(Debug, Clone, PartialEq)]
pub enum ServiceResponse {
    WorkspaceFolders(Vec<WorkspaceFolder>),
    ActiveDocument(Option<Url>),
    Contents(Bytes),
    Stat(FileStat),
    Entries(Vec<DirEntry>),
    Done,
}

/// Host capabilities available to the guest.
///
/// Implementations are called from supervisor tasks, possibly concurrently.
#[async_trait]
pub trait HostServices: Send + Sync {
    async fn workspace_folders(&self) -> Vec<WorkspaceFolder>;

    /// The document currently focused in the host, if any.
    async fn active_document(&self) -> Option<Url>;

    async fn read_file(&self, uri: &Url) -> ServiceResult<Bytes>;

    async fn write_file(&self, uri: &Url, contents: Bytes) -> ServiceResult<()>;

    async fn stat(&self, uri: &Url) -> ServiceResult<FileStat>;

    async fn read_directory(&self, uri: &Url) -> ServiceResult<Vec<DirEntry>> {
        Err(ServiceError::Unsupported(format!("list {}", uri)))
    }

    async fn terminal_write(&self, stream: OutputStream, bytes: Bytes) -> ServiceResult<()>;

    /// Read at most `max` bytes of terminal input. An empty result is end of input.
    async fn terminal_read(&self, max: usize) -> ServiceResult<Bytes>;

    /// The guest announced its exit code.
    fn exit(&self, _code: i32) {}
}

struct ServiceCall {
    request: ServiceRequest,
    reply: Option<oneshot::Sender<ServiceResult<ServiceResponse>>>,
}

/// Create the two ends of a fresh bridge.
pub fn channel() -> (ServiceConnection, SyncPort) {
    let (calls_tx, calls_rx) = mpsc::unbounded_channel();
    let (ready_tx, ready_rx) = oneshot::channel();
    (
        ServiceConnection {
            calls: calls_rx,
            ready: ready_tx,
        },
        SyncPort {
            calls: calls_tx,
            ready: ready_rx,
        },
    )
}

/// Guest end of a bridge before the supervisor starts serving it.
///
/// Not `Clone`: a port is moved into exactly one run request.
pub struct SyncPort {
    calls: mpsc::UnboundedSender<ServiceCall>,
    ready: oneshot::Receiver<()>,
}

impl SyncPort {
    /// Block until the supervisor is serving the bridge.
    ///
    /// Must be called from a thread that may block, never from async code.
    pub fn connect(self) -> ServiceResult<SyncClient> {
        self.ready
            .blocking_recv()
            .map_err(|_| ServiceError::Closed)?;
        Ok(SyncClient { calls: self.calls })
    }
}

impl std::fmt::Debug for SyncPort {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncPort")
            .field("closed", &self.calls.is_closed())
            .finish()
    }
}

/// Blocking client used by the guest engine.
#[derive(Clone)]
pub struct SyncClient {
    calls: mpsc::UnboundedSender<ServiceCall>,
}

impl SyncClient {
    /// Send a request and park the current thread until it is answered.
    pub fn call(&self, request: ServiceRequest) -> ServiceResult<ServiceResponse> {
        let (reply, response) = oneshot::channel();
        self.calls
            .send(ServiceCall {
                request,
                reply: Some(reply),
            })
            .map_err(|_| ServiceError::Closed)?;
        response.blocking_recv().map_err(|_| ServiceError::Closed)?
    }

    /// Send a request without waiting for an answer.
    pub fn notify(&self, request: ServiceRequest) {
        if self
            .calls
            .send(ServiceCall {
                request,
                reply: None,
            })
            .is_err()
        {
            debug!("bridge closed, dropping notification");
        }
    }

    pub fn workspace_folders(&self) -> ServiceResult<Vec<WorkspaceFolder>> {
        match self.call(ServiceRequest::WorkspaceFolders)? {
            ServiceResponse::WorkspaceFolders(folders) => Ok(folders),
            other => Err(unexpected(other)),
        }
    }

    pub fn active_document(&self) -> ServiceResult<Option<Url>> {
        match self.call(ServiceRequest::ActiveDocument)? {
            ServiceResponse::ActiveDocument(uri) => Ok(uri),
            other => Err(unexpected(other)),
        }
    }

    pub fn read_file(&self, uri: &Url) -> ServiceResult<Bytes> {
        match self.call(ServiceRequest::ReadFile { uri: uri.clone() })? {
            ServiceResponse::Contents(bytes) => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    pub fn write_file(&self, uri: &Url, contents: Bytes) -> ServiceResult<()> {
        self.call(ServiceRequest::WriteFile {
            uri: uri.clone(),
            contents,
        })
        .and_then(expect_done)
    }

    pub fn stat(&self, uri: &Url) -> ServiceResult<FileStat> {
        match self.call(ServiceRequest::Stat { uri: uri.clone() })? {
            ServiceResponse::Stat(stat) => Ok(stat),
            other => Err(unexpected(other)),
        }
    }

    pub fn read_directory(&self, uri: &Url) -> ServiceResult<Vec<DirEntry>> {
        match self.call(ServiceRequest::ReadDirectory { uri: uri.clone() })? {
            ServiceResponse::Entries(entries) => Ok(entries),
            other => Err(unexpected(other)),
        }
    }

    pub fn terminal_write(&self, stream: OutputStream, bytes: Bytes) -> ServiceResult<()> {
        self.call(ServiceRequest::TerminalWrite { stream, bytes })
            .and_then(expect_done)
    }

    pub fn terminal_read(&self, max: usize) -> ServiceResult<Bytes> {
        match self.call(ServiceRequest::TerminalRead { max })? {
            ServiceResponse::Contents(bytes) => Ok(bytes),
            other => Err(unexpected(other)),
        }
    }

    /// Tell the host the guest is exiting. Does not wait.
    pub fn exit(&self, code: i32) {
        self.notify(ServiceRequest::Exit { code });
    }
}

fn expect_done(response: ServiceResponse) -> ServiceResult<()> {
    match response {
        ServiceResponse::Done => Ok(()),
        other => Err(unexpected(other)),
    }
}

fn unexpected(response: ServiceResponse) -> ServiceError {
    ServiceError::Io(format!("unexpected bridge response: {:?}", response))
}

/// Supervisor end of a bridge.
pub struct ServiceConnection {
    calls: mpsc::UnboundedReceiver<ServiceCall>,
    ready: oneshot::Sender<()>,
}

impl ServiceConnection {
    /// Signal readiness and answer calls until every client is gone.
    ///
    /// Each call runs on its own task. Returns the number of calls handled,
    /// after all of them have finished.
    pub async fn serve(self, host: Arc<dyn HostServices>) -> usize {
        let ServiceConnection { mut calls, ready } = self;
        if ready.send(()).is_err() {
            debug!("bridge port dropped before serving started");
        }

        let mut tasks = JoinSet::new();
        let mut handled = 0;
        loop {
            tokio::select! {
                call = calls.recv() => match call {
                    Some(call) => {
                        handled += 1;
                        let host = host.clone();
                        tasks.spawn(async move { answer(host.as_ref(), call).await });
                    }
                    None => break,
                },
                Some(joined) = tasks.join_next(), if !tasks.is_empty() => {
                    if let Err(error) = joined {
                        warn!(%error, "bridge call task failed");
                    }
                }
            }
        }

        while let Some(joined) = tasks.join_next().await {
            if let Err(error) = joined {
                warn!(%error, "bridge call task failed");
            }
        }
        debug!(handled, "bridge drained");
        handled
    }
}

async fn answer(host: &dyn HostServices, call: ServiceCall) {
    let kind = call.request.kind();
    let result = dispatch(host, call.request).await;
    if let Err(error) = &result {
        debug!(kind, %error, "bridge call failed");
    }
    if let Some(reply) = call.reply {
        // The guest may have been terminated while we worked.
        let _ = reply.send(result);
    }
}

async fn dispatch(host: &dyn HostServices, request: ServiceRequest) -> ServiceResult<ServiceResponse> {
    Ok(match request {
        ServiceRequest::WorkspaceFolders => {
            ServiceResponse::WorkspaceFolders(host.workspace_folders().await)
        }
        ServiceRequest::ActiveDocument => ServiceResponse::ActiveDocument(host.active_document().await),
        ServiceRequest::ReadFile { uri } => ServiceResponse::Contents(host.read_file(&uri).await?),
        ServiceRequest::WriteFile { uri, contents } => {
            host.write_file(&uri, contents).await?;
            ServiceResponse::Done
        }
        ServiceRequest::Stat { uri } => ServiceResponse::Stat(host.stat(&uri).await?),
        ServiceRequest::ReadDirectory { uri } => {
            ServiceResponse::Entries(host.read_directory(&uri).await?)
        }
        ServiceRequest::TerminalWrite { stream, bytes } => {
            host.terminal_write(stream, bytes).await?;
            ServiceResponse::Done
        }
        ServiceRequest::TerminalRead { max } => {
            ServiceResponse::Contents(host.terminal_read(max).await?)
        }
        ServiceRequest::Exit { code } => {
            host.exit(code);
            ServiceResponse::Done
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::sync::Mutex;

    #[derive(Default)]
    struct MemoryHost {
        files: Mutex<HashMap<String, Bytes>>,
        output: Mutex<Vec<(OutputStream, Bytes)>>,
        exits: Mutex<Vec<i32>>,
    }

    #[async_trait]
    impl HostServices for MemoryHost {
        async fn workspace_folders(&self) -> Vec<WorkspaceFolder> {
            vec![WorkspaceFolder::new(
                "proj",
                Url::parse("file:///proj").unwrap(),
            )]
        }

        async fn active_document(&self) -> Option<Url> {
            None
        }

        async fn read_file(&self, uri: &Url) -> ServiceResult<Bytes> {
            self.files
                .lock()
                .unwrap()
                .get(uri.as_str())
                .cloned()
                .ok_or_else(|| ServiceError::NotFound(uri.to_string()))
        }

        async fn write_file(&self, uri: &Url, contents: Bytes) -> ServiceResult<()> {
            self.files
                .lock()
                .unwrap()
                .insert(uri.to_string(), contents);
            Ok(())
        }

        async fn stat(&self, uri: &Url) -> ServiceResult<FileStat> {
            let bytes = self.read_file(uri).await?;
            Ok(FileStat::file(bytes.len() as u64))
        }

        async fn terminal_write(&self, stream: OutputStream, bytes: Bytes) -> ServiceResult<()> {
            self.output.lock().unwrap().push((stream, bytes));
            Ok(())
        }

        async fn terminal_read(&self, _max: usize) -> ServiceResult<Bytes> {
            Ok(Bytes::new())
        }

        fn exit(&self, code: i32) {
            self.exits.lock().unwrap().push(code);
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn guest_calls_are_answered() {
        let host = Arc::new(MemoryHost::default());
        let (connection, port) = channel();
        let server = tokio::spawn(connection.serve(host.clone()));

        let guest = tokio::task::spawn_blocking(move || {
            let client = port.connect().unwrap();
            let uri = Url::parse("file:///proj/out.txt").unwrap();
            client
                .write_file(&uri, Bytes::from_static(b"hello"))
                .unwrap();
            let read = client.read_file(&uri).unwrap();
            let stat = client.stat(&uri).unwrap();
            let missing = client.read_file(&Url::parse("file:///proj/nope").unwrap());
            client
                .terminal_write(OutputStream::Stdout, Bytes::from_static(b"hi\n"))
                .unwrap();
            let folders = client.workspace_folders().unwrap();
            let listing = client.read_directory(&Url::parse("file:///proj").unwrap());
            client.exit(3);
            (read, stat, missing, folders, listing)
        });

        let (read, stat, missing, folders, listing) = guest.await.unwrap();
        assert_eq!(read, Bytes::from_static(b"hello"));
        assert_eq!(stat, FileStat::file(5));
        assert!(matches!(missing, Err(ServiceError::NotFound(_))));
        assert_eq!(folders.len(), 1);
        assert!(matches!(listing, Err(ServiceError::Unsupported(_))));

        let handled = server.await.unwrap();
        assert_eq!(handled, 8);
        assert_eq!(host.exits.lock().unwrap().as_slice(), &[3]);
        assert_eq!(
            host.output.lock().unwrap().as_slice(),
            &[(OutputStream::Stdout, Bytes::from_static(b"hi\n"))]
        );
    }

    #[tokio::test]
    async fn serve_returns_when_port_is_dropped() {
        let (connection, port) = channel();
        drop(port);
        let handled = connection.serve(Arc::new(MemoryHost::default())).await;
        assert_eq!(handled, 0);
    }

    #[test]
    fn connect_fails_when_connection_is_dropped() {
        let (connection, port) = channel();
        drop(connection);
        assert_eq!(port.connect().err(), Some(ServiceError::Closed));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn calls_after_serve_ends_report_closed() {
        let (connection, port) = channel();
        let server = tokio::spawn(connection.serve(Arc::new(MemoryHost::default())));
        let client = tokio::task::spawn_blocking(move || port.connect().unwrap())
            .await
            .unwrap();
        server.abort();
        let _ = server.await;

        let result = tokio::task::spawn_blocking(move || client.active_document())
            .await
            .unwrap();
        assert_eq!(result, Err(ServiceError::Closed));
    }
}
