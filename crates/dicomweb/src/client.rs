//! The DICOMweb client.

use std::sync::Arc;

use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE};
use http::{HeaderMap, HeaderValue, Method, StatusCode};
use secrecy::ExposeSecret as _;
use tracing::{debug, instrument};

use crate::auth::TokenProvider;
use crate::error::DicomWebError;
use crate::http_client::{HttpClient, HttpRequest, HttpResponse};
use crate::models::{self, DicomObject, InstanceUid, tags};
use crate::pagination::QidoPager;
use crate::retry::RetrySettings;
use Segment::{Literal, Uid};

const DICOM_JSON: &str = "application/dicom+json";
const DICOM_PART10: &str = "application/dicom";
const DICOM_ANY_SYNTAX: &str = "application/dicom; transfer-syntax=*";

/// Client settings.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Base URL of the DICOM store. Requests go to `{store_url}/dicomWeb/...`.
    pub store_url: String,
    /// Retry policy for transient failures.
    pub retry: RetrySettings,
    /// QIDO page size.
    pub page_size: usize,
}

impl ClientConfig {
    /// Settings for the given store with the default retry policy and page size.
    #[must_use]
    pub fn new(store_url: impl Into<String>) -> Self {
        Self {
            store_url: store_url.into(),
            retry: RetrySettings::default(),
            page_size: 1000,
        }
    }
}

pub(crate) struct ClientInner<C, T> {
    http: C,
    tokens: T,
    base_url: String,
    retry: RetrySettings,
    pub(crate) page_size: usize,
}

impl<C: HttpClient, T: TokenProvider> ClientInner<C, T> {
    fn url(&self, path: &str, query: &[(&str, &str)]) -> String {
        let mut url = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        for (i, (k, v)) in query.iter().enumerate() {
            url.push(if i == 0 { '?' } else { '&' });
            url.push_str(&urlencoding::encode(k));
            url.push('=');
            url.push_str(&urlencoding::encode(v));
        }
        url
    }

    /// Send one logical request, retrying transient failures. A fresh token is fetched for
    /// every attempt.
    pub(crate) async fn send(
        &self,
        method: Method,
        path: &str,
        query: &[(&str, &str)],
        accept: &'static str,
        body: Option<(&'static str, Bytes)>,
    ) -> Result<HttpResponse, DicomWebError> {
        let url = self.url(path, query);
        let url = url.as_str();
        let method = &method;
        let body = body.as_ref();
        self.retry
            .run(url, || async move {
                let token = self.tokens.token().await?;
                let bearer = HeaderValue::from_str(&format!("Bearer {}", token.expose_secret()))
                    .map_err(|_| {
                        DicomWebError::Unauthorized(
                            "token contains characters not allowed in a header".to_owned(),
                        )
                    })?;
                let mut headers = HeaderMap::new();
                headers.insert(AUTHORIZATION, bearer);
                headers.insert(ACCEPT, HeaderValue::from_static(accept));
                if let Some((content_type, _)) = body {
                    headers.insert(CONTENT_TYPE, HeaderValue::from_static(*content_type));
                }

                let request = HttpRequest {
                    method: method.clone(),
                    url: url.to_owned(),
                    headers,
                    body: body.map(|(_, b)| b.clone()),
                };
                let response = self.http.send(request).await?;
                if response.status.is_success() {
                    Ok(response)
                } else {
                    Err(DicomWebError::from_status(response.status, &response.body))
                }
            })
            .await
    }

    /// Run one QIDO-RS search request. `204 No Content` is an empty result.
    pub(crate) async fn search(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Vec<DicomObject>, DicomWebError> {
        let response = self.send(Method::GET, path, query, DICOM_JSON, None).await?;
        if response.status == StatusCode::NO_CONTENT || response.body.is_empty() {
            return Ok(Vec::new());
        }
        Ok(serde_json::from_slice(&response.body)?)
    }
}

/// A resource path from literal segments and UIDs. UIDs are percent-encoded so that a stray
/// `/` or `?` cannot change which resource is addressed.
fn resource_path(segments: &[Segment<'_>]) -> String {
    segments
        .iter()
        .map(|segment| match segment {
            Segment::Literal(s) => std::borrow::Cow::Borrowed(*s),
            Segment::Uid(uid) => urlencoding::encode(uid),
        })
        .collect::<Vec<_>>()
        .join("/")
}

enum Segment<'a> {
    Literal(&'static str),
    Uid(&'a str),
}

fn instance_path(uid: &InstanceUid) -> String {
    resource_path(&[
        Literal("studies"),
        Uid(&uid.study),
        Literal("series"),
        Uid(&uid.series),
        Literal("instances"),
        Uid(&uid.instance),
    ])
}

/// Async client for one DICOM store.
///
/// Cheap to clone; clones share the transport and token provider.
pub struct DicomWebClient<C, T> {
    inner: Arc<ClientInner<C, T>>,
}

impl<C, T> Clone for DicomWebClient<C, T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<C: HttpClient, T: TokenProvider> DicomWebClient<C, T> {
    /// Create a client for the store described by `config`.
    #[must_use]
    pub fn new(http: C, tokens: T, config: ClientConfig) -> Self {
        let base_url = format!("{}/dicomWeb", config.store_url.trim_end_matches('/'));
        Self {
            inner: Arc::new(ClientInner {
                http,
                tokens,
                base_url,
                retry: config.retry,
                page_size: config.page_size.max(1),
            }),
        }
    }

    /// Search all studies in the store.
    #[must_use]
    pub fn search_studies(&self) -> QidoPager<C, T> {
        QidoPager::new(
            Arc::clone(&self.inner),
            "studies".to_owned(),
            tags::STUDY_INSTANCE_UID,
        )
    }

    /// Search the series of one study.
    #[must_use]
    pub fn search_series(&self, study: &str) -> QidoPager<C, T> {
        QidoPager::new(
            Arc::clone(&self.inner),
            resource_path(&[Literal("studies"), Uid(study), Literal("series")]),
            tags::SERIES_INSTANCE_UID,
        )
    }

    /// Search the instances of one series.
    #[must_use]
    pub fn search_instances(&self, study: &str, series: &str) -> QidoPager<C, T> {
        QidoPager::new(
            Arc::clone(&self.inner),
            resource_path(&[
                Literal("studies"),
                Uid(study),
                Literal("series"),
                Uid(series),
                Literal("instances"),
            ]),
            tags::SOP_INSTANCE_UID,
        )
    }

    /// Look up a single study by UID.
    ///
    /// # Errors
    ///
    /// Propagates transport, authorization and decoding failures.
    pub async fn find_study(&self, study: &str) -> Result<Option<DicomObject>, DicomWebError> {
        self.find_one("studies", "StudyInstanceUID", tags::STUDY_INSTANCE_UID, study)
            .await
    }

    /// Look up a single series by UID.
    ///
    /// # Errors
    ///
    /// Propagates transport, authorization and decoding failures.
    pub async fn find_series(
        &self,
        study: &str,
        series: &str,
    ) -> Result<Option<DicomObject>, DicomWebError> {
        self.find_one(
            &resource_path(&[Literal("studies"), Uid(study), Literal("series")]),
            "SeriesInstanceUID",
            tags::SERIES_INSTANCE_UID,
            series,
        )
        .await
    }

    /// Look up a single instance by UID.
    ///
    /// # Errors
    ///
    /// Propagates transport, authorization and decoding failures.
    pub async fn find_instance(
        &self,
        study: &str,
        series: &str,
        instance: &str,
    ) -> Result<Option<DicomObject>, DicomWebError> {
        self.find_one(
            &resource_path(&[
                Literal("studies"),
                Uid(study),
                Literal("series"),
                Uid(series),
                Literal("instances"),
            ]),
            "SOPInstanceUID",
            tags::SOP_INSTANCE_UID,
            instance,
        )
        .await
    }

    /// Search `path` for the object whose `tag` is exactly `uid`. A result carrying any other
    /// UID does not count, whatever the server's matching rules are.
    async fn find_one(
        &self,
        path: &str,
        key: &str,
        tag: &str,
        uid: &str,
    ) -> Result<Option<DicomObject>, DicomWebError> {
        let found = self
            .inner
            .search(path, &[(key, uid), ("limit", "1")])
            .await?;
        let exact = found.into_iter().find(|obj| obj.string(tag) == Some(uid));
        if exact.is_none() {
            debug!(key, uid, "no exact match");
        }
        Ok(exact)
    }

    /// Retrieve a whole instance as a Part 10 file in its stored transfer syntax.
    ///
    /// # Errors
    ///
    /// Propagates transport and authorization failures. A missing instance is
    /// [`DicomWebError::NotFound`].
    #[instrument(name = "DicomWebClient::retrieve_instance", skip(self), fields(instance = %uid.instance))]
    pub async fn retrieve_instance(&self, uid: &InstanceUid) -> Result<Bytes, DicomWebError> {
        let path = instance_path(uid);
        let response = self
            .inner
            .send(Method::GET, &path, &[], DICOM_ANY_SYNTAX, None)
            .await?;
        debug!(bytes = response.body.len(), "retrieved instance");
        Ok(response.body)
    }

    /// Store one Part 10 file and return where the store put it.
    ///
    /// # Errors
    ///
    /// Propagates transport and authorization failures, and reports instances the store refused.
    #[instrument(name = "DicomWebClient::store_instance", skip(self, part10), fields(bytes = part10.len()))]
    pub async fn store_instance(&self, part10: Bytes) -> Result<InstanceUid, DicomWebError> {
        let response = self
            .inner
            .send(
                Method::POST,
                "studies",
                &[],
                DICOM_JSON,
                Some((DICOM_PART10, part10)),
            )
            .await?;
        let body: DicomObject = serde_json::from_slice(&response.body)?;
        models::parse_store_response(&body)
    }

    /// Delete a whole study.
    ///
    /// # Errors
    ///
    /// Propagates transport and authorization failures.
    pub async fn delete_study(&self, study: &str) -> Result<(), DicomWebError> {
        self.delete(&resource_path(&[Literal("studies"), Uid(study)]))
            .await
    }

    /// Delete a whole series.
    ///
    /// # Errors
    ///
    /// Propagates transport and authorization failures.
    pub async fn delete_series(&self, study: &str, series: &str) -> Result<(), DicomWebError> {
        self.delete(&resource_path(&[
            Literal("studies"),
            Uid(study),
            Literal("series"),
            Uid(series),
        ]))
        .await
    }

    /// Delete one instance.
    ///
    /// # Errors
    ///
    /// Propagates transport and authorization failures.
    pub async fn delete_instance(&self, uid: &InstanceUid) -> Result<(), DicomWebError> {
        self.delete(&instance_path(uid)).await
    }

    async fn delete(&self, path: &str) -> Result<(), DicomWebError> {
        self.inner
            .send(Method::DELETE, path, &[], DICOM_JSON, None)
            .await
            .map(drop)
    }
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used, clippy::expect_used)]

    use std::collections::VecDeque;
    use std::sync::Mutex;
    use std::time::Duration;

    use secrecy::SecretString;

    use super::*;
    use crate::auth::StaticTokenProvider;
    use crate::error::HttpClientError;

    /// Replays scripted responses and records every request it saw.
    #[derive(Default)]
    struct ScriptedHttp {
        responses: Mutex<VecDeque<Result<(u16, &'static str), HttpClientError>>>,
        seen: Mutex<Vec<HttpRequest>>,
    }

    impl ScriptedHttp {
        fn with(responses: Vec<Result<(u16, &'static str), HttpClientError>>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                seen: Mutex::default(),
            }
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

    fn client(http: ScriptedHttp) -> DicomWebClient<ScriptedHttp, StaticTokenProvider> {
        let mut config = ClientConfig::new("https://store.example/v1/dicomStores/s/");
        config.retry.initial_backoff = Duration::from_millis(1);
        DicomWebClient::new(
            http,
            StaticTokenProvider::new(SecretString::from("tok".to_owned())),
            config,
        )
    }

    #[tokio::test]
    async fn requests_carry_token_and_encoded_query() {
        let client = client(ScriptedHttp::with(vec![Ok((204, ""))]));
        let found = client.find_series("1.2", "3 4").await.unwrap();
        assert!(found.is_none());

        let seen = client.inner.http.seen.lock().unwrap();
        assert_eq!(
            seen[0].url,
            "https://store.example/v1/dicomStores/s/dicomWeb/studies/1.2/series?SeriesInstanceUID=3%204&limit=1"
        );
        assert_eq!(seen[0].headers[AUTHORIZATION], "Bearer tok");
        assert_eq!(seen[0].headers[ACCEPT], DICOM_JSON);
    }

    #[tokio::test]
    async fn lookup_ignores_results_for_another_uid() {
        let client = client(ScriptedHttp::with(vec![
            Ok((
                200,
                r#"[{"0020000E": {"vr": "UI", "Value": ["1.2.30"]}}]"#,
            )),
            Ok((
                200,
                r#"[{"0020000E": {"vr": "UI", "Value": ["1.2.3"]}}]"#,
            )),
        ]));

        let prefix_match = client.find_series("1", "1.2.3").await.unwrap();
        assert!(prefix_match.is_none());
        let exact = client.find_series("1", "1.2.3").await.unwrap().unwrap();
        assert_eq!(exact.string(tags::SERIES_INSTANCE_UID), Some("1.2.3"));
    }

    #[tokio::test]
    async fn uids_in_the_path_are_encoded() {
        let client = client(ScriptedHttp::with(vec![Ok((200, "")), Ok((200, "DICM"))]));
        client.delete_series("1/..", "2?x=1").await.unwrap();
        let uid = InstanceUid {
            study: "1".to_owned(),
            series: "2".to_owned(),
            instance: "3 4".to_owned(),
        };
        client.retrieve_instance(&uid).await.unwrap();

        let seen = client.inner.http.seen.lock().unwrap();
        assert_eq!(
            seen[0].url,
            "https://store.example/v1/dicomStores/s/dicomWeb/studies/1%2F../series/2%3Fx%3D1"
        );
        assert_eq!(
            seen[1].url,
            "https://store.example/v1/dicomStores/s/dicomWeb/studies/1/series/2/instances/3%204"
        );
    }

    #[tokio::test]
    async fn retrieve_retries_transient_failures() {
        let client = client(ScriptedHttp::with(vec![
            Err(HttpClientError::Connection("reset".to_owned())),
            Ok((503, "busy")),
            Ok((200, "DICM")),
        ]));
        let uid = InstanceUid {
            study: "1".to_owned(),
            series: "2".to_owned(),
            instance: "3".to_owned(),
        };
        let bytes = client.retrieve_instance(&uid).await.unwrap();
        assert_eq!(&bytes[..], b"DICM");
        assert_eq!(client.inner.http.seen.lock().unwrap().len(), 3);
    }

    #[tokio::test]
    async fn forbidden_is_surfaced_without_retry() {
        let client = client(ScriptedHttp::with(vec![Ok((403, "denied"))]));
        let err = client.delete_study("1").await.unwrap_err();
        assert!(matches!(err, DicomWebError::Forbidden(_)));
        assert_eq!(client.inner.http.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn store_posts_part10_and_parses_location() {
        let client = client(ScriptedHttp::with(vec![Ok((
            200,
            r#"{"00081199": {"vr": "SQ", "Value": [{
                "00081190": {"vr": "UR", "Value": ["https://s/dicomWeb/studies/1/series/2/instances/3"]}
            }]}}"#,
        ))]));
        let uid = client
            .store_instance(Bytes::from_static(b"DICM"))
            .await
            .unwrap();
        assert_eq!(uid.instance, "3");

        let seen = client.inner.http.seen.lock().unwrap();
        assert_eq!(seen[0].method, Method::POST);
        assert_eq!(seen[0].headers[CONTENT_TYPE], DICOM_PART10);
        assert_eq!(seen[0].body.as_deref(), Some(&b"DICM"[..]));
    }
}
