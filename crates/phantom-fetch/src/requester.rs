//! The object requester: GET single objects, POST batched pack
//! requests, GET the service config document.
//!
//! Every operation runs the same attempt loop: authenticated request,
//! per-attempt timeout, retry with capped exponential backoff and
//! jitter on network errors and 5xx, one credential refresh on 401. A
//! second 401 after the refresh is a hard auth failure.

use std::time::{Duration, Instant};

use rand::Rng;
use reqwest::header::AUTHORIZATION;
use reqwest::{Method, StatusCode, Url};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config_doc::ServerGvfsConfig;
use crate::creds::CredentialStore;
use crate::{FetchError, Result};

/// Retry tunables; see the core config for the mount's values.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub per_attempt_timeout: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(8),
            per_attempt_timeout: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, timeout_seconds: u64) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            per_attempt_timeout: Duration::from_secs(timeout_seconds.max(1)),
            ..Self::default()
        }
    }
}

/// Backoff before retrying `attempt` (1-based). Exponential, capped,
/// with jitter in the upper half of the window so synchronized clients
/// spread out.
fn backoff_delay(policy: &RetryPolicy, attempt: u32) -> Duration {
    let factor = 2u32.saturating_pow(attempt.saturating_sub(1).min(16));
    let base = policy
        .initial_backoff
        .saturating_mul(factor)
        .min(policy.max_backoff);
    let base_ms = base.as_millis() as u64;
    let jittered = rand::thread_rng().gen_range(base_ms / 2..=base_ms.max(1));
    Duration::from_millis(jittered)
}

/// Resolved service endpoints.
#[derive(Debug, Clone)]
pub struct Endpoints {
    objects_url: Url,
    config_url: Url,
    /// Key the credential store caches under (the repo URL).
    credential_url: String,
}

impl Endpoints {
    /// Derives endpoints from the repo origin URL, with an optional
    /// cache server overriding the objects endpoint. TLS is required
    /// unless `allow_http` is set (tests and loopback development).
    pub fn from_repo_url(
        repo_url: &str,
        cache_server: Option<&str>,
        allow_http: bool,
    ) -> Result<Self> {
        let base = repo_url.trim_end_matches('/');
        let parse = |raw: &str| -> Result<Url> {
            let url =
                Url::parse(raw).map_err(|e| FetchError::InvalidUrl(format!("{raw}: {e}")))?;
            if url.scheme() != "https" && !allow_http {
                return Err(FetchError::InvalidUrl(format!(
                    "{raw}: TLS is required for the object service"
                )));
            }
            Ok(url)
        };

        let origin = parse(base)?;
        let objects_base = match cache_server {
            Some(cache) => parse(cache.trim_end_matches('/'))?,
            None => origin.clone(),
        };

        let join = |url: &Url, suffix: &str| -> Result<Url> {
            Url::parse(&format!("{}{suffix}", url.as_str().trim_end_matches('/')))
                .map_err(|e| FetchError::InvalidUrl(e.to_string()))
        };
        Ok(Self {
            objects_url: join(&objects_base, "/gvfs/objects")?,
            config_url: join(&origin, "/gvfs/config")?,
            credential_url: base.to_string(),
        })
    }

    pub fn objects_url(&self) -> &Url {
        &self.objects_url
    }
}

/// HTTP client for the object service.
pub struct ObjectRequester {
    http: reqwest::Client,
    endpoints: Endpoints,
    creds: CredentialStore,
    policy: RetryPolicy,
}

impl ObjectRequester {
    pub fn new(endpoints: Endpoints, creds: CredentialStore, policy: RetryPolicy) -> Result<Self> {
        let http = reqwest::Client::builder()
            .redirect(reqwest::redirect::Policy::limited(5))
            .user_agent(concat!("GVFS/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        Ok(Self {
            http,
            endpoints,
            creds,
            policy,
        })
    }

    /// `GET /gvfs/objects/{oid}`: one loose object, zlib-deflated.
    pub async fn download_loose(
        &self,
        oid_hex: &str,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let url = Url::parse(&format!("{}/{oid_hex}", self.endpoints.objects_url))
            .map_err(|e| FetchError::InvalidUrl(e.to_string()))?;
        self.execute(Method::GET, url, None, cancel).await
    }

    /// `POST /gvfs/objects`: a packfile covering `commits` and the trees
    /// and blobs they reference.
    pub async fn download_pack(
        &self,
        commits: &[String],
        allow_pack_files: bool,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let body = serde_json::json!({
            "commits": commits,
            "allowPackFiles": allow_pack_files,
        });
        self.execute(
            Method::POST,
            self.endpoints.objects_url.clone(),
            Some(body),
            cancel,
        )
        .await
    }

    /// `GET /gvfs/config`.
    pub async fn get_server_config(
        &self,
        cancel: &CancellationToken,
    ) -> Result<ServerGvfsConfig> {
        let bytes = self
            .execute(
                Method::GET,
                self.endpoints.config_url.clone(),
                None,
                cancel,
            )
            .await?;
        serde_json::from_slice(&bytes).map_err(|e| FetchError::Malformed {
            detail: format!("config document: {e}"),
        })
    }

    async fn execute(
        &self,
        method: Method,
        url: Url,
        body: Option<serde_json::Value>,
        cancel: &CancellationToken,
    ) -> Result<Vec<u8>> {
        let mut refreshed_credential = false;
        let mut last_detail = String::new();

        for attempt in 1..=self.policy.max_attempts {
            if cancel.is_cancelled() {
                return Err(FetchError::Cancelled);
            }
            let credential = self.creds.get(&self.endpoints.credential_url)?;

            let mut request = self
                .http
                .request(method.clone(), url.clone())
                .timeout(self.policy.per_attempt_timeout)
                .header(AUTHORIZATION, credential.authorization_value());
            if let Some(body) = &body {
                request = request.json(body);
            }

            let started = Instant::now();
            let outcome = tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                result = async {
                    let response = request.send().await?;
                    let status = response.status();
                    let bytes = response.bytes().await?;
                    Ok::<_, reqwest::Error>((status, bytes))
                } => result,
            };
            let elapsed_ms = started.elapsed().as_millis() as u64;

            match outcome {
                Ok((status, bytes)) => {
                    debug!(
                        url = %url,
                        attempt,
                        status = status.as_u16(),
                        bytes = bytes.len(),
                        elapsed_ms,
                        "object service attempt"
                    );
                    if status.is_success() {
                        return Ok(bytes.to_vec());
                    }
                    if status == StatusCode::UNAUTHORIZED {
                        if refreshed_credential {
                            return Err(FetchError::Auth {
                                detail: "service rejected refreshed credential".to_string(),
                            });
                        }
                        refreshed_credential = true;
                        warn!(url = %url, "401 from object service, refreshing credential");
                        self.creds.revoke(&self.endpoints.credential_url);
                        continue;
                    }
                    if !status.is_server_error() {
                        return Err(FetchError::Status {
                            status: status.as_u16(),
                            detail: String::from_utf8_lossy(&bytes).into_owned(),
                        });
                    }
                    last_detail = format!("HTTP {}", status.as_u16());
                }
                Err(e) => {
                    debug!(url = %url, attempt, elapsed_ms, error = %e, "object service attempt failed");
                    last_detail = e.to_string();
                }
            }

            if attempt == self.policy.max_attempts {
                break;
            }
            let delay = backoff_delay(&self.policy, attempt);
            tokio::select! {
                _ = cancel.cancelled() => return Err(FetchError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }

        Err(FetchError::Exhausted {
            attempts: self.policy.max_attempts,
            detail: last_detail,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::creds::{Credential, CredentialSource};
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct CountingSource {
        fills: AtomicU32,
        rejects: AtomicU32,
    }

    impl CountingSource {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                fills: AtomicU32::new(0),
                rejects: AtomicU32::new(0),
            })
        }
    }

    impl CredentialSource for CountingSource {
        fn fill(&self, _url: &str) -> Result<Credential> {
            self.fills.fetch_add(1, Ordering::SeqCst);
            Ok(Credential::Basic {
                username: "u".to_string(),
                password: "p".to_string(),
            })
        }

        fn reject(&self, _url: &str) -> Result<()> {
            self.rejects.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    /// Minimal HTTP fixture: serves the queued responses in order,
    /// counting requests, handling keep-alive connections.
    async fn spawn_fixture(responses: Vec<(u16, Vec<u8>)>) -> (String, Arc<AtomicU32>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let requests = Arc::new(AtomicU32::new(0));
        let queue = Arc::new(parking_lot::Mutex::new(VecDeque::from(responses)));

        let counter = requests.clone();
        tokio::spawn(async move {
            loop {
                let Ok((mut stream, _)) = listener.accept().await else {
                    return;
                };
                let counter = counter.clone();
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut buf = Vec::new();
                    loop {
                        // Read one request head (tests send no bodies).
                        let mut chunk = [0u8; 4096];
                        let head_end = loop {
                            if let Some(i) = find_head_end(&buf) {
                                break i;
                            }
                            match stream.read(&mut chunk).await {
                                Ok(0) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                                Err(_) => return,
                            }
                        };
                        let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
                        let content_length = head
                            .lines()
                            .find_map(|l| l.to_ascii_lowercase().strip_prefix("content-length:")
                                .and_then(|v| v.trim().parse::<usize>().ok()))
                            .unwrap_or(0);
                        let total = head_end + 4 + content_length;
                        while buf.len() < total {
                            match stream.read(&mut chunk).await {
                                Ok(0) => return,
                                Ok(n) => buf.extend_from_slice(&chunk[..n]),
                                Err(_) => return,
                            }
                        }
                        buf.drain(..total);

                        counter.fetch_add(1, Ordering::SeqCst);
                        let (status, body) = queue
                            .lock()
                            .pop_front()
                            .unwrap_or((500, b"exhausted".to_vec()));
                        let reason = if status == 200 { "OK" } else { "ERR" };
                        let response = format!(
                            "HTTP/1.1 {status} {reason}\r\ncontent-length: {}\r\nconnection: keep-alive\r\n\r\n",
                            body.len()
                        );
                        if stream.write_all(response.as_bytes()).await.is_err() {
                            return;
                        }
                        if stream.write_all(&body).await.is_err() {
                            return;
                        }
                    }
                });
            }
        });

        (format!("http://{addr}"), requests)
    }

    fn find_head_end(buf: &[u8]) -> Option<usize> {
        buf.windows(4).position(|w| w == b"\r\n\r\n")
    }

    fn requester(base: &str, source: Arc<CountingSource>, max_attempts: u32) -> ObjectRequester {
        let endpoints = Endpoints::from_repo_url(base, None, true).unwrap();
        let policy = RetryPolicy {
            max_attempts,
            initial_backoff: Duration::from_millis(5),
            max_backoff: Duration::from_millis(20),
            per_attempt_timeout: Duration::from_secs(5),
        };
        ObjectRequester::new(endpoints, CredentialStore::new(source), policy).unwrap()
    }

    #[test]
    fn https_required_by_default() {
        let err = Endpoints::from_repo_url("http://example.com/repo", None, false).unwrap_err();
        assert!(matches!(err, FetchError::InvalidUrl(_)));
        assert!(Endpoints::from_repo_url("https://example.com/repo", None, false).is_ok());
    }

    #[test]
    fn cache_server_overrides_objects_endpoint() {
        let endpoints = Endpoints::from_repo_url(
            "https://origin.example.com/repo",
            Some("https://cache.example.com/repo"),
            false,
        )
        .unwrap();
        assert!(endpoints
            .objects_url()
            .as_str()
            .starts_with("https://cache.example.com/"));
    }

    #[test]
    fn backoff_is_capped_and_jittered() {
        let policy = RetryPolicy {
            max_attempts: 5,
            initial_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_millis(400),
            per_attempt_timeout: Duration::from_secs(1),
        };
        for attempt in 1..=8 {
            let delay = backoff_delay(&policy, attempt);
            assert!(delay <= Duration::from_millis(400), "attempt {attempt}");
            assert!(delay >= Duration::from_millis(50), "attempt {attempt}");
        }
    }

    #[tokio::test]
    async fn auth_refresh_on_401_retries_once() {
        let (base, requests) =
            spawn_fixture(vec![(401, b"no".to_vec()), (200, b"object-bytes".to_vec())]).await;
        let source = CountingSource::new();
        let requester = requester(&base, source.clone(), 5);

        let cancel = CancellationToken::new();
        let bytes = requester
            .download_loose(&"ab".repeat(20), &cancel)
            .await
            .unwrap();

        assert_eq!(bytes, b"object-bytes");
        assert_eq!(requests.load(Ordering::SeqCst), 2);
        assert_eq!(source.rejects.load(Ordering::SeqCst), 1);
        assert_eq!(source.fills.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn second_401_is_hard_auth_failure() {
        let (base, requests) =
            spawn_fixture(vec![(401, b"no".to_vec()), (401, b"still no".to_vec())]).await;
        let source = CountingSource::new();
        let requester = requester(&base, source, 5);

        let cancel = CancellationToken::new();
        let err = requester
            .download_loose(&"ab".repeat(20), &cancel)
            .await
            .unwrap_err();

        assert!(matches!(err, FetchError::Auth { .. }));
        assert_eq!(requests.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn server_errors_retry_until_success() {
        let (base, requests) = spawn_fixture(vec![
            (500, b"boom".to_vec()),
            (503, b"busy".to_vec()),
            (200, b"fine".to_vec()),
        ])
        .await;
        let requester = requester(&base, CountingSource::new(), 5);

        let cancel = CancellationToken::new();
        let bytes = requester
            .download_loose(&"cd".repeat(20), &cancel)
            .await
            .unwrap();
        assert_eq!(bytes, b"fine");
        assert_eq!(requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn client_errors_do_not_retry() {
        let (base, requests) = spawn_fixture(vec![(404, b"missing".to_vec())]).await;
        let requester = requester(&base, CountingSource::new(), 5);

        let cancel = CancellationToken::new();
        let err = requester
            .download_loose(&"ef".repeat(20), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Status { status: 404, .. }));
        assert_eq!(requests.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn exhaustion_reports_attempt_count() {
        let (base, requests) = spawn_fixture(vec![
            (500, vec![]),
            (500, vec![]),
            (500, vec![]),
        ])
        .await;
        let requester = requester(&base, CountingSource::new(), 3);

        let cancel = CancellationToken::new();
        let err = requester
            .download_loose(&"aa".repeat(20), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Exhausted { attempts: 3, .. }));
        assert_eq!(requests.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn cancellation_wins_immediately() {
        let (base, _requests) = spawn_fixture(vec![(200, b"never".to_vec())]).await;
        let requester = requester(&base, CountingSource::new(), 5);

        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = requester
            .download_loose(&"bb".repeat(20), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::Cancelled));
    }
}
