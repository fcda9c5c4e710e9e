use crate::metrics::Metrics;
use crate::reporter::{ErrorReporter, ReportedError};
use crate::state::{
    AddressBalance, DaemonInfo, NetworkAndBlockchainInfo, StatusBoard, Transaction, WalletBalance,
};
use axum::body::Body;
use axum::extract::State;
use axum::http::{header::CONTENT_TYPE, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};
use tracing::info;

#[derive(Clone)]
pub struct HttpAppState {
    pub metrics: Arc<Metrics>,
    pub board: Arc<StatusBoard>,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiNetwork {
    pub connection_count: u32,
    pub last_block_unix: i64,
    pub last_block_time: String,
}

impl From<NetworkAndBlockchainInfo> for ApiNetwork {
    fn from(value: NetworkAndBlockchainInfo) -> Self {
        let secs = u64::try_from(value.last_block_unix).unwrap_or(0);
        Self {
            connection_count: value.connection_count,
            last_block_unix: value.last_block_unix,
            last_block_time: humantime::format_rfc3339_seconds(UNIX_EPOCH + Duration::from_secs(secs))
                .to_string(),
        }
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct ApiState {
    pub started_at_unix: i64,
    pub startup_text: String,
    pub wallet_ready: bool,
    pub daemon: Option<DaemonInfo>,
    pub balance: Option<WalletBalance>,
    pub network: Option<ApiNetwork>,
    pub transactions: Vec<Transaction>,
    pub addresses: Vec<AddressBalance>,
    pub gatherer_errors: BTreeMap<String, u64>,
    pub last_error: Option<ReportedError>,
}

impl From<&StatusBoard> for ApiState {
    fn from(value: &StatusBoard) -> Self {
        let mut api = Self {
            started_at_unix: value.started_at_unix,
            startup_text: value.startup_text(),
            wallet_ready: false,
            daemon: None,
            balance: None,
            network: None,
            transactions: Vec::new(),
            addresses: Vec::new(),
            gatherer_errors: BTreeMap::new(),
            last_error: value.reporter.last_error(),
        };
        if let Some(wallet) = value.wallet() {
            api.wallet_ready = true;
            api.daemon = wallet.daemon.latest();
            api.balance = wallet.balance.latest();
            api.network = wallet.network.latest().map(ApiNetwork::from);
            api.transactions = wallet.transaction_table.rows().unwrap_or_default();
            api.addresses = wallet.address_table.rows().unwrap_or_default();
            api.gatherer_errors = wallet.gatherer_errors().into_iter().collect();
        }
        api
    }
}

#[derive(Debug, Clone, serde::Serialize)]
struct RefreshReply {
    addresses: usize,
}

pub fn build_router(metrics: Arc<Metrics>, board: Arc<StatusBoard>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .route("/api/state", get(state_handler))
        .route("/api/addresses/refresh", post(refresh_addresses_handler))
        .with_state(HttpAppState { metrics, board })
}

async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

async fn metrics_handler(State(state): State<HttpAppState>) -> Response {
    state.metrics.inc_scrape_count();
    state.metrics.update_from_state(&state.board);
    match state.metrics.encode_metrics() {
        Ok(encoded) => {
            let mut response = Response::new(Body::from(encoded));
            response.headers_mut().insert(
                CONTENT_TYPE,
                HeaderValue::from_static("text/plain; version=0.0.4"),
            );
            response
        }
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("ошибка кодирования метрик: {err}"),
        )
            .into_response(),
    }
}

async fn state_handler(State(state): State<HttpAppState>) -> impl IntoResponse {
    Json(ApiState::from(&*state.board))
}

async fn refresh_addresses_handler(State(state): State<HttpAppState>) -> Response {
    let Some(wallet) = state.board.wallet().cloned() else {
        return (StatusCode::SERVICE_UNAVAILABLE, "кошелёк ещё не готов").into_response();
    };
    let board = state.board.clone();

    let joined = tokio::task::spawn_blocking(move || {
        wallet.refresh_addresses_interactive().map_err(|err| {
            board.reporter.report(&err, false);
            err.to_string()
        })
    })
    .await;

    match joined {
        Ok(Ok(count)) => {
            info!(addresses = count, "таблица адресов обновлена по HTTP-запросу");
            Json(RefreshReply { addresses: count }).into_response()
        }
        Ok(Err(message)) => (StatusCode::BAD_GATEWAY, message).into_response(),
        Err(err) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("задача обновления адресов завершилась аварийно: {err}"),
        )
            .into_response(),
    }
}
