use crate::stats::Stats;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State as AxumState,
    },
    http::{header, Method, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{get, post},
    Json, Router,
};
use chest_stats_types::{
    api::{
        AnnounceChestsRequest, AnnounceChestsResponse, ErrorResponse, IncrementRequest,
        RecentChests, ReportDropsRequest, ReportDropsResponse,
    },
    CountersSnapshot, DropRecord, ValidationError,
};
use futures::{SinkExt, Stream, StreamExt};
use std::{convert::Infallible, sync::Arc, time::Duration};
use tower_governor::{
    governor::GovernorConfigBuilder, key_extractor::SmartIpKeyExtractor, GovernorLayer,
};
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

/// Interval between SSE keep-alive comments.
const SSE_KEEP_ALIVE: Duration = Duration::from_secs(15);

/// Per-client-IP request quota.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RateLimit {
    pub per_second: u64,
    pub burst: u32,
}

pub struct Api {
    stats: Stats,
    rate_limit: Option<RateLimit>,
}

impl Api {
    pub fn new(stats: Stats) -> Self {
        Self {
            stats,
            rate_limit: None,
        }
    }

    pub fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub fn router(&self) -> Router {
        // Configure CORS
        let cors = CorsLayer::new()
            .allow_origin(Any)
            .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
            .allow_headers([header::CONTENT_TYPE]);

        let router = Router::new()
            .route("/health", get(health))
            .route("/api/stats", get(get_stats))
            .route("/api/stats/increment", post(increment))
            .route("/api/drops", get(get_drops).post(report_drops))
            .route("/api/admin/recent", get(recent_chests))
            .route("/api/admin/chests", post(announce_chests))
            .route("/api/ws", get(updates_ws))
            .route("/api/events", get(updates_sse))
            .layer(cors)
            .with_state(self.stats.clone());

        let Some(rate_limit) = self.rate_limit else {
            return router;
        };

        // Configure Rate Limiting
        let period = 1_000_000_000 / rate_limit.per_second.max(1);
        let governor_conf = GovernorConfigBuilder::default()
            .per_nanosecond(period)
            .burst_size(rate_limit.burst)
            .key_extractor(SmartIpKeyExtractor)
            .finish();
        match governor_conf {
            Some(config) => router.layer(GovernorLayer {
                config: Arc::new(config),
            }),
            None => {
                warn!(?rate_limit, "invalid rate limit, serving without one");
                router
            }
        }
    }
}

/// A request rejected before touching any state.
struct Rejected(ValidationError);

impl From<ValidationError> for Rejected {
    fn from(err: ValidationError) -> Self {
        Self(err)
    }
}

impl IntoResponse for Rejected {
    fn into_response(self) -> Response {
        debug!(error = %self.0, "rejected request");
        (
            StatusCode::BAD_REQUEST,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

async fn health() -> &'static str {
    "ok"
}

async fn get_stats(AxumState(stats): AxumState<Stats>) -> Json<CountersSnapshot> {
    Json(stats.snapshot())
}

async fn increment(
    AxumState(stats): AxumState<Stats>,
    Json(request): Json<IncrementRequest>,
) -> Result<Json<CountersSnapshot>, Rejected> {
    Ok(Json(stats.report_open(request.count, request.chest_id)?))
}

async fn get_drops(AxumState(stats): AxumState<Stats>) -> Json<Vec<DropRecord>> {
    Json(stats.recent_drops())
}

async fn report_drops(
    AxumState(stats): AxumState<Stats>,
    Json(request): Json<ReportDropsRequest>,
) -> Result<Json<ReportDropsResponse>, Rejected> {
    let count = stats.report_drops(request.items)?;
    Ok(Json(ReportDropsResponse {
        success: true,
        count,
    }))
}

async fn recent_chests(AxumState(stats): AxumState<Stats>) -> Json<RecentChests> {
    Json(RecentChests {
        ids: stats.chests(),
    })
}

async fn announce_chests(
    AxumState(stats): AxumState<Stats>,
    Json(request): Json<AnnounceChestsRequest>,
) -> Result<Json<AnnounceChestsResponse>, Rejected> {
    let ids = stats.announce_chests(request.into_ids()?)?;
    Ok(Json(AnnounceChestsResponse { success: true, ids }))
}

async fn updates_ws(AxumState(stats): AxumState<Stats>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_updates_ws(socket, stats))
}

async fn handle_updates_ws(socket: WebSocket, stats: Stats) {
    let (mut sender, mut receiver) = socket.split();
    let mut updates = stats.subscribe();
    let subscriber = updates.id();
    info!(subscriber, "updates websocket connected");

    loop {
        tokio::select! {
            // Handle incoming WebSocket messages (ping/pong/close)
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) => {
                        info!(subscriber, "client closed websocket connection");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            warn!(subscriber, "failed to send pong, client disconnected");
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        warn!(subscriber, ?e, "websocket error");
                        break;
                    }
                    None => {
                        info!(subscriber, "websocket stream ended");
                        break;
                    }
                    _ => {} // Ignore other message types
                }
            }
            // Forward queued updates
            payload = updates.next() => {
                let Some(payload) = payload else {
                    info!(subscriber, "subscription closed");
                    break;
                };
                if sender.send(Message::Text(payload.to_string())).await.is_err() {
                    warn!(subscriber, "failed to send update, client disconnected");
                    break;
                }
            }
        }
    }

    // Deregister before the (possibly slow) close handshake
    drop(updates);
    info!(subscriber, "updates websocket handler exiting");
    let _ = sender.close().await;
}

async fn updates_sse(
    AxumState(stats): AxumState<Stats>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let updates = stats.subscribe();
    info!(subscriber = updates.id(), "updates event stream connected");
    let events = updates.map(|payload| Ok(Event::default().data(payload.as_ref())));
    Sse::new(events).keep_alive(KeepAlive::new().interval(SSE_KEEP_ALIVE))
}
