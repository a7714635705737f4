//! Sync coordinator
//!
//! Ties the credential broker, record cache and injected fetch function
//! together: fetch a record collection with a bearer token, merge it into
//! the cached collection for that category, persist, return. Concurrency
//! is caller-driven; callers that need serialized writes to one category
//! serialize at the call site.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::Value;
use tracing::{debug, info};

use crate::attachments::{
    decode_body_data, extract_descriptors, fetch_payloads, AttachmentDescriptor, MessagePart,
};
use crate::auth::CredentialBroker;
use crate::cache::{merge, Record, RecordStore};
use crate::error::{Error, Result};
use crate::http::{FetchRequest, HttpFetch};

/// Gmail API base for attachment payloads
const GMAIL_USERS_ENDPOINT: &str = "https://gmail.googleapis.com/gmail/v1/users";

/// Attachment payload as returned by the remote endpoint
#[derive(Debug, Deserialize)]
struct AttachmentBody {
    #[allow(dead_code)]
    #[serde(default)]
    size: u64,
    data: String,
}

/// Coordinates token acquisition, fetching and cache merging
pub struct SyncEngine {
    broker: Arc<CredentialBroker>,
    store: Arc<RecordStore>,
    fetch: Arc<dyn HttpFetch>,
    api_base: String,
}

impl SyncEngine {
    pub fn new(
        broker: Arc<CredentialBroker>,
        store: Arc<RecordStore>,
        fetch: Arc<dyn HttpFetch>,
    ) -> Self {
        Self {
            broker,
            store,
            fetch,
            api_base: GMAIL_USERS_ENDPOINT.to_string(),
        }
    }

    /// Override the attachment API base (tests, self-hosted gateways)
    pub fn with_api_base(mut self, api_base: impl Into<String>) -> Self {
        self.api_base = api_base.into();
        self
    }

    /// GET with a bearer token; a single 401 triggers one token refresh and
    /// one retry, a second 401 means the session is truly gone.
    async fn authorized_get(&self, url: &str) -> Result<crate::http::FetchResponse> {
        let token = self.broker.get_access_token().await?;
        let response = self
            .fetch
            .fetch(FetchRequest::get(url).bearer(&token))
            .await?;
        if response.status != 401 {
            return Ok(response);
        }

        debug!("Got 401 from {}, refreshing token and retrying once", url);
        self.broker.invalidate();
        let token = self.broker.get_access_token().await?;
        let retry = self
            .fetch
            .fetch(FetchRequest::get(url).bearer(&token))
            .await?;
        if retry.status == 401 {
            return Err(Error::SignInRequired);
        }
        Ok(retry)
    }

    /// Fetch a record collection, merge it with the cached collection for
    /// `category`, persist the result and return it (newest first).
    pub async fn sync_category(&self, category: &str, url: &str) -> Result<Vec<Record>> {
        let response = self.authorized_get(url).await?;
        if !response.is_success() {
            return Err(Error::HttpStatus {
                status: response.status,
                body: response.body_text(),
            });
        }

        let incoming = parse_records(&response.body)?;
        let existing = self.store.get(category).await.unwrap_or_default();
        let merged = merge(&existing, &incoming);
        self.store.put(category, &merged).await?;

        info!(
            "Synced {}: {} fetched, {} after merge",
            category,
            incoming.len(),
            merged.len()
        );
        Ok(merged)
    }

    /// Serve a TTL-valid cached collection, falling back to the network
    pub async fn cached_or_fetch(&self, category: &str, url: &str) -> Result<Vec<Record>> {
        if let Some(records) = self.store.get(category).await {
            debug!("Serving {} from cache ({} records)", category, records.len());
            return Ok(records);
        }
        self.sync_category(category, url).await
    }

    /// Raw last-write time for a category, for "last updated" display
    pub async fn last_synced(&self, category: &str) -> Option<DateTime<Utc>> {
        self.store.last_write_time(category).await
    }

    /// Extract descriptors from a message structure and hydrate their
    /// payloads through the broker + fetch seam, in parallel.
    pub async fn fetch_attachments(
        &self,
        message_id: &str,
        structure: &MessagePart,
    ) -> (Vec<AttachmentDescriptor>, bool) {
        let descriptors = extract_descriptors(structure);
        fetch_payloads(message_id, descriptors, |message_id, attachment_ref, filename, _| {
            let api_base = self.api_base.clone();
            async move {
                let url = format!(
                    "{}/me/messages/{}/attachments/{}",
                    api_base, message_id, attachment_ref
                );
                let response = self.authorized_get(&url).await?;
                if !response.is_success() {
                    return Err(Error::HttpStatus {
                        status: response.status,
                        body: response.body_text(),
                    });
                }
                let body: AttachmentBody = serde_json::from_slice(&response.body)
                    .map_err(|e| Error::MalformedBody(e.to_string()))?;
                debug!("Fetched payload for {} ({} bytes)", filename, body.data.len());
                decode_body_data(&body.data)
            }
        })
        .await
    }
}

/// Parse a record collection body: either a bare JSON array or an object
/// wrapping one under `records`/`messages`.
fn parse_records(body: &[u8]) -> Result<Vec<Record>> {
    let value: Value =
        serde_json::from_slice(body).map_err(|e| Error::MalformedBody(e.to_string()))?;
    let items = match value {
        Value::Array(items) => items,
        Value::Object(mut map) => match map.remove("records").or_else(|| map.remove("messages")) {
            Some(Value::Array(items)) => items,
            _ => {
                return Err(Error::MalformedBody(
                    "expected a record array or a records/messages field".to_string(),
                ))
            }
        },
        _ => {
            return Err(Error::MalformedBody(
                "expected a JSON array or object".to_string(),
            ))
        }
    };
    serde_json::from_value(Value::Array(items)).map_err(|e| Error::MalformedBody(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use parking_lot::Mutex;

    use crate::auth::IdentityProvider;
    use crate::cache::{BinaryBackend, RecordDate};
    use crate::config::CacheConfig;
    use crate::http::FetchResponse;

    struct MockIdentity {
        fetches: AtomicUsize,
    }

    #[async_trait]
    impl IdentityProvider for MockIdentity {
        async fn get_tokens_silently(&self) -> Result<String> {
            let n = self.fetches.fetch_add(1, Ordering::SeqCst);
            Ok(format!("token-{}", n))
        }

        async fn sign_in_silently(&self) -> Result<()> {
            Ok(())
        }
    }

    struct MockFetch {
        responses: Mutex<VecDeque<FetchResponse>>,
        requests: Mutex<Vec<FetchRequest>>,
    }

    impl MockFetch {
        fn new(responses: Vec<FetchResponse>) -> Self {
            Self {
                responses: Mutex::new(responses.into()),
                requests: Mutex::new(Vec::new()),
            }
        }

        fn ok(body: &str) -> FetchResponse {
            FetchResponse {
                status: 200,
                body: body.as_bytes().to_vec(),
            }
        }

        fn unauthorized() -> FetchResponse {
            FetchResponse {
                status: 401,
                body: b"{}".to_vec(),
            }
        }

        fn request_count(&self) -> usize {
            self.requests.lock().len()
        }
    }

    #[async_trait]
    impl HttpFetch for MockFetch {
        async fn fetch(&self, request: FetchRequest) -> Result<FetchResponse> {
            self.requests.lock().push(request);
            self.responses
                .lock()
                .pop_front()
                .ok_or_else(|| Error::Other("no canned response left".to_string()))
        }
    }

    fn engine(fetch: Arc<MockFetch>) -> (SyncEngine, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let backend = BinaryBackend::open(dir.path().join("records.bin")).unwrap();
        let store = Arc::new(RecordStore::new(Arc::new(backend), &CacheConfig::default()));
        let broker = Arc::new(CredentialBroker::new(Arc::new(MockIdentity {
            fetches: AtomicUsize::new(0),
        })));
        let engine = SyncEngine::new(broker, store, fetch).with_api_base("http://api.test");
        (engine, dir)
    }

    #[tokio::test]
    async fn sync_merges_and_caches() {
        let fetch = Arc::new(MockFetch::new(vec![
            MockFetch::ok(r#"[{"id":"1","date":"2024-01-01"},{"id":"2","date":"2024-02-01"}]"#),
            MockFetch::ok(r#"[{"id":"2","date":"2024-02-01"},{"id":"3","date":"2024-03-01"}]"#),
        ]));
        let (engine, _dir) = engine(fetch.clone());

        let first = engine.sync_category("Work", "http://api.test/work").await.unwrap();
        assert_eq!(first.len(), 2);

        let second = engine.sync_category("Work", "http://api.test/work").await.unwrap();
        let ids: Vec<&str> = second.iter().map(|r| r.id.as_str()).collect();
        // Union of both fetches, newest first, no duplicates
        assert_eq!(ids, vec!["3", "2", "1"]);
    }

    #[tokio::test]
    async fn cached_or_fetch_skips_the_network() {
        let fetch = Arc::new(MockFetch::new(vec![MockFetch::ok(
            r#"[{"id":"1","date":"2024-01-01"}]"#,
        )]));
        let (engine, _dir) = engine(fetch.clone());

        engine.sync_category("Work", "http://api.test/work").await.unwrap();
        let requests_after_sync = fetch.request_count();

        let cached = engine
            .cached_or_fetch("Work", "http://api.test/work")
            .await
            .unwrap();
        assert_eq!(cached.len(), 1);
        assert_eq!(fetch.request_count(), requests_after_sync);
        assert!(engine.last_synced("Work").await.is_some());
    }

    #[tokio::test]
    async fn single_401_refreshes_and_retries_once() {
        let fetch = Arc::new(MockFetch::new(vec![
            MockFetch::unauthorized(),
            MockFetch::ok(r#"[{"id":"1","date":"2024-01-01"}]"#),
        ]));
        let (engine, _dir) = engine(fetch.clone());

        let records = engine.sync_category("Work", "http://api.test/work").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(fetch.request_count(), 2);

        // The retry carried a fresh bearer token
        let requests = fetch.requests.lock();
        assert_ne!(requests[0].headers, requests[1].headers);
    }

    #[tokio::test]
    async fn second_401_surfaces_sign_in_required() {
        let fetch = Arc::new(MockFetch::new(vec![
            MockFetch::unauthorized(),
            MockFetch::unauthorized(),
        ]));
        let (engine, _dir) = engine(fetch.clone());

        let err = engine
            .sync_category("Work", "http://api.test/work")
            .await
            .unwrap_err();
        assert!(err.requires_sign_in());
        assert_eq!(fetch.request_count(), 2);
    }

    #[tokio::test]
    async fn wrapped_record_arrays_are_accepted() {
        let fetch = Arc::new(MockFetch::new(vec![MockFetch::ok(
            r#"{"messages":[{"id":"1","date":1704067200000}]}"#,
        )]));
        let (engine, _dir) = engine(fetch);

        let records = engine.sync_category("Inbox", "http://api.test/inbox").await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].date, RecordDate::Millis(1_704_067_200_000));
    }

    #[tokio::test]
    async fn malformed_body_is_a_typed_error() {
        let fetch = Arc::new(MockFetch::new(vec![MockFetch::ok("\"just a string\"")]));
        let (engine, _dir) = engine(fetch);

        let err = engine
            .sync_category("Work", "http://api.test/work")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MalformedBody(_)));
    }

    #[tokio::test]
    async fn attachment_payloads_hydrate_through_the_fetch_seam() {
        // base64url of [1, 2, 3]
        let fetch = Arc::new(MockFetch::new(vec![MockFetch::ok(
            r#"{"size":3,"data":"AQID"}"#,
        )]));
        let (engine, _dir) = engine(fetch.clone());

        let structure = MessagePart {
            part_id: "1".to_string(),
            mime_type: "application/pdf".to_string(),
            filename: "doc.pdf".to_string(),
            body: Some(crate::attachments::PartBody {
                attachment_id: Some("ref-1".to_string()),
                size: 3,
                data: None,
            }),
            parts: vec![],
        };

        let (descriptors, ok) = engine.fetch_attachments("msg-1", &structure).await;
        assert!(ok);
        assert_eq!(descriptors[0].data.as_deref(), Some([1u8, 2, 3].as_ref()));

        let requests = fetch.requests.lock();
        assert!(requests[0].url.contains("/me/messages/msg-1/attachments/ref-1"));
    }
}
