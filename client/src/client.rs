use crate::{events::Stream, Error, Result};
use chest_stats_types::{
    api::{
        AnnounceChestsRequest, AnnounceChestsResponse, ErrorResponse, IncrementRequest,
        RecentChests, ReportDropsRequest, ReportDropsResponse, Update,
    },
    ChestId, CountersSnapshot, DropRecord, RewardItem,
};
use reqwest::Client as HttpClient;
use serde::{de::DeserializeOwned, Serialize};
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tokio_tungstenite::connect_async;
use tracing::{debug, info};
use url::Url;

/// Timeout for connections and requests
const TIMEOUT: Duration = Duration::from_secs(30);

/// Retry policy for transient HTTP failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts per request (including the first attempt).
    pub max_attempts: usize,
    /// Initial backoff delay after the first retryable failure.
    pub initial_backoff: Duration,
    /// Maximum backoff delay between attempts.
    pub max_backoff: Duration,
    /// Whether non-idempotent requests (e.g., POST) may be retried.
    pub retry_non_idempotent: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 1,
            initial_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(2),
            retry_non_idempotent: false,
        }
    }
}

/// Chest stats API client
#[derive(Clone)]
pub struct Client {
    pub base_url: Url,
    pub ws_url: Url,
    pub http_client: HttpClient,

    retry_policy: RetryPolicy,
}

impl Client {
    /// Create a new client
    pub fn new(base_url: &str) -> Result<Self> {
        let base_url = Url::parse(base_url)?;

        // Convert http(s) to ws(s) for WebSocket URL
        let ws_scheme = match base_url.scheme() {
            "http" => "ws",
            "https" => "wss",
            scheme => {
                return Err(Error::InvalidScheme(scheme.to_string()));
            }
        };

        let mut ws_url = base_url.clone();
        ws_url
            .set_scheme(ws_scheme)
            .map_err(|_| Error::InvalidScheme(ws_scheme.to_string()))?;

        let http_client = HttpClient::builder()
            .timeout(TIMEOUT)
            .pool_idle_timeout(Duration::from_secs(60))
            .tcp_keepalive(Duration::from_secs(30))
            .build()?;

        Ok(Self {
            base_url,
            ws_url,
            http_client,
            retry_policy: RetryPolicy::default(),
        })
    }

    /// Returns a copy of the current retry policy.
    pub fn retry_policy(&self) -> RetryPolicy {
        self.retry_policy
    }

    /// Sets the retry policy for subsequent HTTP requests.
    pub fn set_retry_policy(&mut self, retry_policy: RetryPolicy) {
        self.retry_policy = retry_policy;
    }

    /// Returns a new client with the provided retry policy.
    pub fn with_retry_policy(mut self, retry_policy: RetryPolicy) -> Self {
        self.retry_policy = retry_policy;
        self
    }

    async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let url = self.base_url.join(path)?;
        let response = self
            .send_with_retry(reqwest::Method::GET, || self.http_client.get(url.clone()))
            .await?;
        decode(response).await
    }

    async fn post<B: Serialize, T: DeserializeOwned>(&self, path: &str, body: &B) -> Result<T> {
        let url = self.base_url.join(path)?;
        debug!("Posting to {}", url);
        let response = self
            .send_with_retry(reqwest::Method::POST, || {
                self.http_client.post(url.clone()).json(body)
            })
            .await?;
        decode(response).await
    }

    async fn send_with_retry(
        &self,
        method: reqwest::Method,
        make_request: impl Fn() -> reqwest::RequestBuilder,
    ) -> Result<reqwest::Response> {
        let max_attempts =
            if method == reqwest::Method::GET || self.retry_policy.retry_non_idempotent {
                self.retry_policy.max_attempts.max(1)
            } else {
                1
            };

        let mut attempt = 0usize;
        let mut backoff = self.retry_policy.initial_backoff;
        loop {
            attempt += 1;
            let result = make_request().send().await;
            match result {
                Ok(response) => {
                    let status = response.status();
                    if !is_retryable_status(status) || attempt >= max_attempts {
                        return Ok(response);
                    }
                }
                Err(err) => {
                    if attempt >= max_attempts || !is_retryable_error(&err) {
                        return Err(Error::Reqwest(err));
                    }
                }
            }

            if backoff > Duration::ZERO {
                sleep(backoff).await;
                backoff = std::cmp::min(backoff.saturating_mul(2), self.retry_policy.max_backoff);
            }
        }
    }

    /// Current global counters.
    pub async fn stats(&self) -> Result<CountersSnapshot> {
        self.get("api/stats").await
    }

    /// Report `count` chest openings. Returns the counters after the report.
    pub async fn report_open(
        &self,
        count: u64,
        chest_id: Option<ChestId>,
    ) -> Result<CountersSnapshot> {
        self.post("api/stats/increment", &IncrementRequest { count, chest_id })
            .await
    }

    /// The recent drops feed, newest first.
    pub async fn recent_drops(&self) -> Result<Vec<DropRecord>> {
        self.get("api/drops").await
    }

    /// Publish notable drops. Returns the length of the feed afterwards.
    pub async fn report_drops(&self, items: Vec<RewardItem>) -> Result<usize> {
        let response: ReportDropsResponse =
            self.post("api/drops", &ReportDropsRequest { items }).await?;
        Ok(response.count)
    }

    /// Announce chests to every connected viewer. Returns all announced chests.
    pub async fn announce_chests(&self, ids: Vec<ChestId>) -> Result<Vec<ChestId>> {
        let request = AnnounceChestsRequest {
            id: None,
            ids: Some(ids),
        };
        let response: AnnounceChestsResponse = self.post("api/admin/chests", &request).await?;
        Ok(response.ids)
    }

    /// Every chest announced so far.
    pub async fn recent_chests(&self) -> Result<Vec<ChestId>> {
        let response: RecentChests = self.get("api/admin/recent").await?;
        Ok(response.ids)
    }

    /// Connect to the live updates stream.
    pub async fn connect_updates(&self) -> Result<Stream<Update>> {
        self.connect_updates_with_capacity(0).await
    }

    /// Connect to the live updates stream with a configurable channel capacity.
    ///
    /// A `channel_capacity` of `0` uses the default capacity.
    pub async fn connect_updates_with_capacity(
        &self,
        channel_capacity: usize,
    ) -> Result<Stream<Update>> {
        let ws_url = self.ws_url.join("api/ws")?;
        info!(ws_url = %ws_url, "Connecting to updates WebSocket");

        let (ws_stream, _) = timeout(TIMEOUT, connect_async(ws_url.as_str()))
            .await
            .map_err(|_| Error::DialTimeout)??;
        info!("WebSocket connected");

        Ok(Stream::new_with_capacity(ws_stream, channel_capacity))
    }
}

async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if status == reqwest::StatusCode::BAD_REQUEST {
        let body = response.bytes().await?;
        return match serde_json::from_slice::<ErrorResponse>(&body) {
            Ok(rejected) => Err(Error::Rejected(rejected.error)),
            Err(_) => Err(Error::Failed(status)),
        };
    }
    if !status.is_success() {
        return Err(Error::Failed(status));
    }
    let body = response.bytes().await?;
    Ok(serde_json::from_slice(&body)?)
}

fn is_retryable_status(status: reqwest::StatusCode) -> bool {
    use reqwest::StatusCode;
    matches!(
        status,
        StatusCode::REQUEST_TIMEOUT
            | StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_connect() || err.is_timeout()
}
