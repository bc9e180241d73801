//! GitHub remote against a mock server.

use guestbox_cli::host::GithubRemote;
use guestbox_runtime::{FileKind, FileStat, RemoteRepositories, ServiceError};
use url::Url;
use wiremock::matchers::{method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn url(s: &str) -> Url {
    Url::parse(s).unwrap()
}

fn base(server: &MockServer, prefix: &str) -> Url {
    url(&format!("{}/{}/", server.uri(), prefix))
}

async fn mount_tree(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api/repos/o/r/git/trees/HEAD"))
        .and(query_param("recursive", "1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "sha": "abc",
            "truncated": false,
            "tree": [
                { "path": "python", "type": "tree" },
                { "path": "python/python.wasm", "type": "blob", "size": 4 },
                { "path": "python/lib", "type": "tree" },
                { "path": "python/lib/os.py", "type": "blob", "size": 9 }
            ]
        })))
        .expect(1)
        .mount(server)
        .await;
}

#[tokio::test]
async fn test_loads_tree_once_and_answers_stat_and_list() {
    let server = MockServer::start().await;
    mount_tree(&server).await;

    let remote = GithubRemote::new(base(&server, "api"), base(&server, "raw"), None).unwrap();
    let repository = url("vscode-vfs://github/o/r");
    remote.load_workspace_contents(&repository).await.unwrap();

    assert_eq!(
        remote
            .stat(&url("vscode-vfs://github/o/r/python/python.wasm"))
            .await
            .unwrap(),
        FileStat::file(4)
    );
    assert_eq!(
        remote.stat(&url("vscode-vfs://github/o/r/python")).await.unwrap(),
        FileStat::directory()
    );
    assert!(matches!(
        remote.stat(&url("vscode-vfs://github/o/r/missing")).await,
        Err(ServiceError::NotFound(_))
    ));

    let entries = remote
        .list(&url("vscode-vfs://github/o/r/python"))
        .await
        .unwrap();
    let listed: Vec<_> = entries.iter().map(|e| (e.name.as_str(), e.kind)).collect();
    assert_eq!(
        listed,
        [("lib", FileKind::Directory), ("python.wasm", FileKind::File)]
    );
}

#[tokio::test]
async fn test_read_downloads_then_uses_cache() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/raw/o/r/HEAD/python/python.wasm"))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(b"\0asm".to_vec()))
        .expect(1)
        .mount(&server)
        .await;

    let cache = tempfile::tempdir().unwrap();
    let remote = GithubRemote::new(
        base(&server, "api"),
        base(&server, "raw"),
        Some(cache.path().to_path_buf()),
    )
    .unwrap();
    let uri = url("vscode-vfs://github/o/r/python/python.wasm");

    let first = remote.read(&uri).await.unwrap();
    let second = remote.read(&uri).await.unwrap();
    assert_eq!(&first[..], b"\0asm");
    assert_eq!(first, second);
    assert!(cache.path().join("o/r/python/python.wasm").is_file());
}

#[tokio::test]
async fn test_missing_remote_file_is_not_found() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/raw/o/r/HEAD/nope.py"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let remote = GithubRemote::new(base(&server, "api"), base(&server, "raw"), None).unwrap();
    let result = remote.read(&url("vscode-vfs://github/o/r/nope.py")).await;
    assert!(matches!(result, Err(ServiceError::NotFound(_))));
}

#[tokio::test]
async fn test_server_error_is_io() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/repos/o/r/git/trees/HEAD"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let remote = GithubRemote::new(base(&server, "api"), base(&server, "raw"), None).unwrap();
    let result = remote
        .load_workspace_contents(&url("vscode-vfs://github/o/r"))
        .await;
    assert!(matches!(result, Err(ServiceError::Io(_))));
}
