#![allow(clippy::unwrap_used, clippy::expect_used, missing_docs)]

mod common;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::Bytes;
use dicom_fuse::access::{AccessChecker, AccessError};
use dicom_fuse::cache::{ContentCache, ContentCacheConfig, EntryState};
use dicom_fuse::path::VirtualPath;
use dicom_fuse::remote::{DicomWebStore, RemoteError, RemoteStore};
use dicomweb::{
    ClientConfig, DicomWebClient, HttpClient, HttpClientError, HttpRequest, HttpResponse,
    StaticTokenProvider,
};
use http::{HeaderMap, StatusCode};
use secrecy::SecretString;

use common::{instance_id, path};

type Script = Result<(u16, &'static str), HttpClientError>;

/// Answers requests from a fixed script and remembers what it was asked.
#[derive(Clone, Default)]
struct ScriptedHttp {
    responses: Arc<Mutex<VecDeque<Script>>>,
    seen: Arc<Mutex<Vec<HttpRequest>>>,
}

impl ScriptedHttp {
    fn with(responses: Vec<Script>) -> Self {
        Self {
            responses: Arc::new(Mutex::new(responses.into())),
            seen: Arc::default(),
        }
    }

    fn requests(&self) -> usize {
        self.seen.lock().unwrap().len()
    }
}

impl HttpClient for ScriptedHttp {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, HttpClientError> {
        self.seen.lock().unwrap().push(request);
        let (status, body) = self
            .responses
            .lock()
            .unwrap()
            .pop_front()
            .expect("unexpected request")?;
        Ok(HttpResponse {
            status: StatusCode::from_u16(status).unwrap(),
            headers: HeaderMap::new(),
            body: Bytes::from_static(body.as_bytes()),
        })
    }
}

fn store(http: &ScriptedHttp) -> DicomWebStore<ScriptedHttp, StaticTokenProvider> {
    let mut config = ClientConfig::new("https://store.example/v1/dicomStores/s/");
    config.retry.initial_backoff = Duration::from_millis(1);
    DicomWebStore::new(DicomWebClient::new(
        http.clone(),
        StaticTokenProvider::new(SecretString::from("tok".to_owned())),
        config,
    ))
}

#[tokio::test]
async fn fetch_survives_two_server_errors() {
    let http = ScriptedHttp::with(vec![Ok((503, "busy")), Ok((503, "busy")), Ok((200, "DICM"))]);
    let remote = store(&http);

    let bytes = remote.fetch_instance(&instance_id("1", "2", "3")).await.unwrap();
    assert_eq!(&bytes[..], b"DICM");
    assert_eq!(http.requests(), 3);
}

#[tokio::test]
async fn retried_download_lands_in_the_cache_once() {
    let http = ScriptedHttp::with(vec![
        Err(HttpClientError::Connection("reset".to_owned())),
        Ok((503, "busy")),
        Ok((200, "DICM")),
    ]);
    let remote = Arc::new(store(&http));
    let dir = tempfile::tempdir().unwrap();
    let cache = ContentCache::new(
        remote,
        &ContentCacheConfig {
            root: dir.path().to_path_buf(),
            capacity: 4,
            max_transfers: 2,
        },
    )
    .await
    .unwrap();
    let id = instance_id("1", "2", "3");

    let obj = cache.read(&id).await.unwrap();
    assert_eq!(obj.size(), 4);
    assert_eq!(cache.state(&id), Some(EntryState::Ready));
    assert_eq!(cache.ready_count(), 1);

    cache.read(&id).await.unwrap();
    assert_eq!(http.requests(), 3);
}

#[tokio::test]
async fn retries_give_up_after_the_attempt_limit() {
    let http = ScriptedHttp::with(vec![Ok((503, "a")), Ok((502, "b")), Ok((500, "c"))]);
    let remote = store(&http);

    let err = remote.fetch_instance(&instance_id("1", "2", "3")).await.unwrap_err();
    assert!(matches!(err, RemoteError::Transient(_)));
    assert_eq!(http.requests(), 3);
}

#[tokio::test]
async fn client_errors_are_not_retried() {
    let http = ScriptedHttp::with(vec![Ok((404, "no such instance"))]);
    let remote = store(&http);

    let err = remote.fetch_instance(&instance_id("1", "2", "3")).await.unwrap_err();
    assert!(matches!(err, RemoteError::NotFound(_)));
    assert_eq!(http.requests(), 1);
}

#[tokio::test]
async fn series_listing_names_instances_with_the_suffix() {
    let http = ScriptedHttp::with(vec![Ok((
        200,
        r#"[{"00080018": {"vr": "UI", "Value": ["1.2.3"]}},
            {"00080018": {"vr": "UI", "Value": ["1.2.4"]}}]"#,
    ))]);
    let remote = store(&http);

    let names = remote.list_children(&path("/9/8")).await.unwrap();
    assert_eq!(names, ["1.2.3.dcm", "1.2.4.dcm"]);
}

#[tokio::test]
async fn deleting_the_root_is_refused_locally() {
    let http = ScriptedHttp::default();
    let remote = store(&http);

    let err = remote.delete_resource(&VirtualPath::Root).await.unwrap_err();
    assert!(matches!(err, RemoteError::Forbidden(_)));
    assert_eq!(http.requests(), 0);
}

#[tokio::test]
async fn rejected_credentials_fail_the_access_check() {
    let http = ScriptedHttp::with(vec![Ok((401, "bad token"))]);
    let remote = store(&http);

    let err = AccessChecker::new("projects/p/datasets/d", Duration::from_secs(5))
        .check(&remote)
        .await
        .unwrap_err();
    assert!(matches!(err, AccessError::PermissionDenied { .. }));
    assert_eq!(http.requests(), 1);
}

#[tokio::test]
async fn a_study_with_a_different_uid_is_not_found() {
    let http = ScriptedHttp::with(vec![Ok((
        200,
        r#"[{"0020000D": {"vr": "UI", "Value": ["1.2.840.10"]}}]"#,
    ))]);
    let remote = store(&http);

    let err = remote.get_attributes(&path("/1.2.840.1")).await.unwrap_err();
    assert!(matches!(err, RemoteError::NotFound(_)));
    assert_eq!(http.requests(), 1);
}
