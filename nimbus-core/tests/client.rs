use nimbus_core::{RemoteClient, RemoteError, RemoteFile};
use serde_json::json;
use url::Url;
use wiremock::matchers::{header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn base(server: &MockServer) -> Url {
    Url::parse(&server.uri()).unwrap()
}

#[tokio::test]
async fn list_folder_returns_self_then_children() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .and(query_param("path", "/Docs/"))
        .and(query_param("depth", "1"))
        .and(header("authorization", "Bearer test-token"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "file_id": "id-docs",
            "path": "/Docs/",
            "name": "Docs",
            "mime_type": "DIR",
            "etag": "folder-etag",
            "_embedded": {
                "items": [
                    {
                        "file_id": "id-a",
                        "path": "/Docs/A.txt",
                        "name": "A.txt",
                        "mime_type": "text/plain",
                        "size": 5,
                        "modified": "2024-01-01T00:00:00Z",
                        "etag": "etag-a"
                    }
                ]
            }
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    let items = client.list_folder(&base(&server), "/Docs/").await.unwrap();

    assert_eq!(items.len(), 2);
    assert!(items[0].is_folder());
    assert_eq!(items[0].path, "/Docs/");
    assert_eq!(items[1].name, "A.txt");
    assert_eq!(items[1].etag.as_deref(), Some("etag-a"));
}

#[tokio::test]
async fn read_file_encodes_path() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .and(query_param("path", "/Docs/Hello World.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "/Docs/Hello World.txt",
            "name": "Hello World.txt",
            "mime_type": "text/plain",
            "size": 12
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    let file = client
        .read_file(&base(&server), "/Docs/Hello World.txt")
        .await
        .unwrap();

    assert_eq!(file.name, "Hello World.txt");
    assert!(!file.is_folder());
    assert!(file.file_id.is_none());
}

#[tokio::test]
async fn missing_file_maps_to_not_found() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    let err = client
        .read_file(&base(&server), "/gone.txt")
        .await
        .expect_err("expected not found");

    assert!(matches!(err, RemoteError::NotFound { path } if path == "/gone.txt"));
}

#[tokio::test]
async fn copy_maps_409_to_conflict() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/files/copy"))
        .and(query_param("from", "/Docs/A.txt"))
        .and(query_param("path", "/Gone/A.txt"))
        .respond_with(ResponseTemplate::new(409))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    let err = client
        .copy_file(&base(&server), "/Docs/A.txt", "/Gone/A.txt")
        .await
        .expect_err("expected conflict");

    assert!(matches!(err, RemoteError::Conflict { .. }));
}

#[tokio::test]
async fn move_returns_assigned_file_id() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/files/move"))
        .and(query_param("from", "/Docs/A.txt"))
        .and(query_param("path", "/Docs/B.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "file_id": "id-b" })))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    let id = client
        .move_file(&base(&server), "/Docs/A.txt", "/Docs/B.txt")
        .await
        .unwrap();

    assert_eq!(id.as_deref(), Some("id-b"));
}

#[tokio::test]
async fn delete_accepts_no_content() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/files"))
        .and(query_param("path", "/Docs/A.txt"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    client
        .delete_file(&base(&server), "/Docs/A.txt")
        .await
        .unwrap();
}

#[tokio::test]
async fn unexpected_status_surfaces_body() {
    let server = MockServer::start().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/files"))
        .respond_with(ResponseTemplate::new(507).set_body_string("quota exceeded"))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    let err = client
        .delete_file(&base(&server), "/Docs/A.txt")
        .await
        .expect_err("expected api error");

    match err {
        RemoteError::Api { status, body } => {
            assert_eq!(status.as_u16(), 507);
            assert_eq!(body, "quota exceeded");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test]
async fn resolve_available_path_returns_free_candidate() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .and(query_param("path", "/Docs/A.txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    let resolved = client
        .resolve_available_path(&base(&server), "/Docs/A.txt", false)
        .await
        .unwrap();

    assert_eq!(resolved, "/Docs/A.txt");
}

#[tokio::test]
async fn resolve_available_path_suffixes_before_extension() {
    let server = MockServer::start().await;

    let taken = json!({
        "path": "/Docs/A.txt",
        "name": "A.txt",
        "mime_type": "text/plain"
    });
    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .and(query_param("path", "/Docs/A.txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(taken.clone()))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .and(query_param("path", "/Docs/A (2).txt"))
        .respond_with(ResponseTemplate::new(200).set_body_json(taken))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .and(query_param("path", "/Docs/A (3).txt"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    let resolved = client
        .resolve_available_path(&base(&server), "/Docs/A.txt", false)
        .await
        .unwrap();

    assert_eq!(resolved, "/Docs/A (3).txt");
}

#[tokio::test]
async fn resolve_available_path_keeps_folder_slash() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .and(query_param("path", "/Backup/Docs/"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "path": "/Backup/Docs/",
            "name": "Docs",
            "mime_type": "DIR"
        })))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/v1/files"))
        .and(query_param("path", "/Backup/Docs (2)/"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    let resolved = client
        .resolve_available_path(&base(&server), "/Backup/Docs/", true)
        .await
        .unwrap();

    assert_eq!(resolved, "/Backup/Docs (2)/");
}

#[tokio::test]
async fn create_folder_parses_resource() {
    let server = MockServer::start().await;

    Mock::given(method("PUT"))
        .and(path("/v1/files/folder"))
        .and(query_param("path", "/Docs/New/"))
        .respond_with(ResponseTemplate::new(201).set_body_json(json!({
            "file_id": "id-new",
            "path": "/Docs/New/",
            "name": "New",
            "mime_type": "DIR",
            "etag": "e-new"
        })))
        .mount(&server)
        .await;

    let client = RemoteClient::new("test-token");
    let folder: RemoteFile = client
        .create_folder(&base(&server), "/Docs/New/")
        .await
        .unwrap();

    assert!(folder.is_folder());
    assert_eq!(folder.file_id.as_deref(), Some("id-new"));
}
