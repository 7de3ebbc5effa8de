// Keyfed — Partner Fetcher
//
// Pulls a partner's index and batch files. The transport sits behind the
// `BatchSource` trait; `Fetcher` turns an index into a lazy, ordered
// stream of the batches past a cursor. Nothing here writes state, so a
// fetch can always be repeated from the same cursor.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, BoxStream, StreamExt};
use reqwest::{StatusCode, Url};

use crate::store::Partner;

use super::error::FetchError;
use super::retry::{RetryError, RetryPolicy};

/// One line of a partner's index file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexEntry {
    pub position: u64,
    /// Relative to the partner's export root.
    pub path: String,
}

/// A downloaded, not yet validated batch file.
#[derive(Debug, Clone)]
pub struct RawBatch {
    pub position: u64,
    pub path: String,
    pub bytes: Bytes,
}

/// Parse `<position> <path>` lines, ignoring blanks and `#` comments.
/// Entries come back sorted by position.
pub fn parse_index(text: &str) -> Result<Vec<IndexEntry>, FetchError> {
    let mut entries = Vec::new();

    for (lineno, line) in text.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }

        let mut parts = line.split_whitespace();
        let (Some(position), Some(path), None) = (parts.next(), parts.next(), parts.next()) else {
            return Err(FetchError::InvalidIndex(format!(
                "line {}: expected '<position> <path>'",
                lineno + 1
            )));
        };
        let position: u64 = position.parse().map_err(|_| {
            FetchError::InvalidIndex(format!("line {}: bad position '{}'", lineno + 1, position))
        })?;

        entries.push(IndexEntry {
            position,
            path: path.to_string(),
        });
    }

    entries.sort_by_key(|e| e.position);
    if let Some(pair) = entries.windows(2).find(|w| w[0].position == w[1].position) {
        return Err(FetchError::InvalidIndex(format!(
            "position {} listed more than once",
            pair[0].position
        )));
    }
    Ok(entries)
}

// ─── Trait ───────────────────────────────────────────────────────────────────

/// Transport for a partner's export files.
#[async_trait]
pub trait BatchSource: Send + Sync {
    async fn fetch_index(&self, partner: &Partner) -> Result<Vec<IndexEntry>, FetchError>;

    async fn fetch_batch(&self, partner: &Partner, entry: &IndexEntry)
        -> Result<RawBatch, FetchError>;
}

/// Produces the batches a partner has published after a cursor.
#[derive(Clone)]
pub struct Fetcher {
    source: Arc<dyn BatchSource>,
}

impl Fetcher {
    pub fn new(source: Arc<dyn BatchSource>) -> Self {
        Self { source }
    }

    /// Read the index, then lazily download every batch with a position
    /// above `since`, in ascending order. A batch is only requested when
    /// the stream is polled for it.
    pub async fn fetch(
        &self,
        partner: &Partner,
        since: u64,
    ) -> Result<BoxStream<'static, Result<RawBatch, FetchError>>, FetchError> {
        let pending: Vec<IndexEntry> = self
            .source
            .fetch_index(partner)
            .await?
            .into_iter()
            .filter(|e| e.position > since)
            .collect();

        tracing::debug!(
            partner = %partner.name,
            since,
            pending = pending.len(),
            "Partner index read"
        );

        let source = self.source.clone();
        let partner = Arc::new(partner.clone());
        Ok(stream::iter(pending)
            .then(move |entry| {
                let source = source.clone();
                let partner = partner.clone();
                async move { source.fetch_batch(&partner, &entry).await }
            })
            .boxed())
    }
}

// ─── HTTP Implementation ─────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct FetchConfig {
    pub retry: RetryPolicy,
    pub index_timeout: Duration,
    pub batch_timeout: Duration,
    /// Largest response body accepted, in bytes.
    pub max_bytes: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            retry: RetryPolicy::default(),
            index_timeout: Duration::from_secs(30),
            batch_timeout: Duration::from_secs(120),
            max_bytes: 32 * 1024 * 1024,
        }
    }
}

/// Fetches over HTTP(S) with bearer auth, per-request timeouts and retry.
pub struct HttpBatchSource {
    client: reqwest::Client,
    config: FetchConfig,
}

impl HttpBatchSource {
    pub fn new(config: FetchConfig) -> Result<Self, FetchError> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("keyfed/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::Client(e.to_string()))?;
        Ok(Self { client, config })
    }

    /// Resolve `path` under the partner's export root. Paths that would
    /// escape the root (absolute URLs, `..`) are refused.
    fn resolve(partner: &Partner, path: &str) -> Result<Url, FetchError> {
        let mut root = partner.export_root.clone();
        if !root.ends_with('/') {
            root.push('/');
        }
        let base = Url::parse(&root).map_err(|e| FetchError::InvalidUrl(format!("{}: {}", root, e)))?;
        let url = base
            .join(path)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", path, e)))?;

        if !url.as_str().starts_with(base.as_str()) {
            return Err(FetchError::InvalidIndex(format!(
                "path {} escapes export root {}",
                path, base
            )));
        }
        Ok(url)
    }

    /// The bearer token named by the partner's credential reference.
    fn bearer(partner: &Partner) -> Result<Option<String>, FetchError> {
        match &partner.credential_ref {
            None => Ok(None),
            Some(var) => std::env::var(var)
                .map(Some)
                .map_err(|_| FetchError::MissingCredential(var.clone())),
        }
    }

    async fn get(&self, url: &Url, token: Option<&str>, timeout: Duration) -> Result<Bytes, FetchError> {
        self.config
            .retry
            .run(url.as_str(), || self.get_once(url, token, timeout))
            .await
            .map_err(|e| match e {
                RetryError::Terminal(e) => e,
                RetryError::Exhausted { attempts, last } => FetchError::Exhausted {
                    url: url.to_string(),
                    attempts,
                    last: last.to_string(),
                },
            })
    }

    async fn get_once(&self, url: &Url, token: Option<&str>, timeout: Duration) -> Result<Bytes, FetchError> {
        let transient = |e: reqwest::Error| FetchError::Transient {
            url: url.to_string(),
            reason: e.to_string(),
        };

        let mut request = self.client.get(url.clone()).timeout(timeout);
        if let Some(token) = token {
            request = request.bearer_auth(token);
        }

        let mut response = request.send().await.map_err(|e| {
            if e.is_builder() {
                FetchError::Client(e.to_string())
            } else {
                transient(e)
            }
        })?;

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS || status.is_server_error() {
            return Err(FetchError::Transient {
                url: url.to_string(),
                reason: format!("HTTP {}", status.as_u16()),
            });
        }
        if !status.is_success() {
            return Err(FetchError::Rejected {
                url: url.to_string(),
                status: status.as_u16(),
            });
        }

        let limit = self.config.max_bytes;
        let too_large = || FetchError::TooLarge {
            url: url.to_string(),
            limit,
        };
        if response.content_length().is_some_and(|len| len > limit as u64) {
            return Err(too_large());
        }

        let mut body = BytesMut::new();
        while let Some(chunk) = response.chunk().await.map_err(transient)? {
            if body.len() + chunk.len() > limit {
                return Err(too_large());
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body.freeze())
    }
}

#[async_trait]
impl BatchSource for HttpBatchSource {
    async fn fetch_index(&self, partner: &Partner) -> Result<Vec<IndexEntry>, FetchError> {
        let url = Self::resolve(partner, &partner.index_file)?;
        let token = Self::bearer(partner)?;
        let body = self.get(&url, token.as_deref(), self.config.index_timeout).await?;
        let text = std::str::from_utf8(&body)
            .map_err(|_| FetchError::InvalidIndex("index is not UTF-8".into()))?;
        parse_index(text)
    }

    async fn fetch_batch(
        &self,
        partner: &Partner,
        entry: &IndexEntry,
    ) -> Result<RawBatch, FetchError> {
        let url = Self::resolve(partner, &entry.path)?;
        let token = Self::bearer(partner)?;
        let bytes = self.get(&url, token.as_deref(), self.config.batch_timeout).await?;

        tracing::debug!(
            partner = %partner.name,
            position = entry.position,
            bytes = bytes.len(),
            "Batch downloaded"
        );
        Ok(RawBatch {
            position: entry.position,
            path: entry.path.clone(),
            bytes,
        })
    }
}

// ─── Test fixtures ───────────────────────────────────────────────────────────


// ─── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    use super::*;

    fn partner(root: &str) -> Partner {
        Partner {
            name: "de".to_string(),
            export_root: root.to_string(),
            index_file: "index.txt".to_string(),
            credential_ref: None,
            region: "DE".to_string(),
            cadence: chrono::Duration::hours(1),
            cursor: 0,
            last_success_at: None,
            failure_count: 0,
            enabled: true,
            keys: vec![],
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    fn source(max_attempts: u32) -> HttpBatchSource {
        HttpBatchSource::new(FetchConfig {
            retry: RetryPolicy {
                max_attempts,
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(5),
                multiplier: 2.0,
                jitter: false,
            },
            index_timeout: Duration::from_secs(5),
            batch_timeout: Duration::from_secs(5),
            max_bytes: 1024,
        })
        .unwrap()
    }

    #[test]
    fn test_parse_index_sorts_and_skips_comments() {
        let text = "# exports\n\n3 batch-3.bin\n1 batch-1.bin\n  2   batch-2.bin  \n";
        let entries = parse_index(text).unwrap();
        let positions: Vec<_> = entries.iter().map(|e| e.position).collect();
        assert_eq!(positions, vec![1, 2, 3]);
        assert_eq!(entries[1].path, "batch-2.bin");
    }

    #[test]
    fn test_parse_index_rejects_bad_lines() {
        assert!(parse_index("x batch.bin").is_err(), "non-numeric position");
        assert!(parse_index("1").is_err(), "missing path");
        assert!(parse_index("1 a.bin extra").is_err(), "trailing field");
        assert!(parse_index("1 a.bin\n1 b.bin").is_err(), "duplicate position");
    }

    #[test]
    fn test_resolve_stays_under_export_root() {
        let p = partner("https://de.example.org/exports");
        let url = HttpBatchSource::resolve(&p, "batch-1.bin").unwrap();
        assert_eq!(url.as_str(), "https://de.example.org/exports/batch-1.bin");

        assert!(HttpBatchSource::resolve(&p, "../secrets").is_err());
        assert!(HttpBatchSource::resolve(&p, "https://evil.example.com/x").is_err());
    }

    #[tokio::test]
    async fn test_fetch_streams_batches_after_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/exports/index.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("1 b1.bin\n2 b2.bin\n3 b3.bin\n"))
            .mount(&server)
            .await;
        for n in 2..=3 {
            Mock::given(method("GET"))
                .and(path(format!("/exports/b{}.bin", n)))
                .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![n as u8; 4]))
                .expect(1)
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/exports/b1.bin"))
            .respond_with(ResponseTemplate::new(200))
            .expect(0)
            .mount(&server)
            .await;

        let fetcher = Fetcher::new(Arc::new(source(1)));
        let p = partner(&format!("{}/exports/", server.uri()));
        let batches: Vec<_> = fetcher.fetch(&p, 1).await.unwrap().collect().await;

        let batches: Vec<RawBatch> = batches.into_iter().map(Result::unwrap).collect();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0].position, 2);
        assert_eq!(&batches[1].bytes[..], &[3u8; 4]);
    }

    #[tokio::test]
    async fn test_transient_errors_are_retried() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.txt"))
            .respond_with(ResponseTemplate::new(503))
            .up_to_n_times(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/index.txt"))
            .respond_with(ResponseTemplate::new(200).set_body_string("7 b7.bin"))
            .mount(&server)
            .await;

        let entries = source(3).fetch_index(&partner(&server.uri())).await.unwrap();
        assert_eq!(entries, vec![IndexEntry { position: 7, path: "b7.bin".into() }]);
    }

    #[tokio::test]
    async fn test_retry_ceiling_surfaces_exhausted() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(429))
            .expect(3)
            .mount(&server)
            .await;

        let err = source(3).fetch_index(&partner(&server.uri())).await.unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }), "got {:?}", err);
    }

    #[tokio::test]
    async fn test_client_errors_fail_without_retry() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(403))
            .expect(1)
            .mount(&server)
            .await;

        let err = source(5).fetch_index(&partner(&server.uri())).await.unwrap_err();
        assert!(matches!(err, FetchError::Rejected { status: 403, .. }));
    }

    #[tokio::test]
    async fn test_bearer_token_from_credential_ref() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/index.txt"))
            .and(header("authorization", "Bearer s3cret"))
            .respond_with(ResponseTemplate::new(200).set_body_string(""))
            .expect(1)
            .mount(&server)
            .await;

        std::env::set_var("KEYFED_TEST_TOKEN_DE", "s3cret");
        let mut p = partner(&server.uri());
        p.credential_ref = Some("KEYFED_TEST_TOKEN_DE".to_string());
        assert!(source(1).fetch_index(&p).await.unwrap().is_empty());

        p.credential_ref = Some("KEYFED_TEST_TOKEN_UNSET".to_string());
        assert!(matches!(
            source(1).fetch_index(&p).await,
            Err(FetchError::MissingCredential(_))
        ));
    }

    #[tokio::test]
    async fn test_oversized_body_rejected() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(vec![0u8; 4096]))
            .mount(&server)
            .await;

        let entry = IndexEntry {
            position: 1,
            path: "big.bin".into(),
        };
        let err = source(1)
            .fetch_batch(&partner(&server.uri()), &entry)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::TooLarge { limit: 1024, .. }));
    }
}
