//! Web server entrypoints live here.

use std::{
    collections::HashSet,
    future::Future,
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};

use axum::{
    Extension, Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, FromRequest, MatchedPath, Multipart, connect_info::ConnectInfo},
    http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode},
    response::IntoResponse,
    routing::{get, post},
};
use serde::Serialize;
use thiserror::Error;
use tokio::{net::TcpListener, sync::watch};
use tower_http::{
    add_extension::AddExtensionLayer,
    classify::ServerErrorsFailureClass,
    cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};

use crate::admin;
use crate::config::{CorsConfig, ProxyMode, RateLimitConfig, ServerConfig, parse_header, parse_method};
use crate::search::{
    AnalyticsReader, BackendFailure, CropBox, FilterSpec, SearchError, SearchErrorKind,
    SearchRequest, SearchResponse, VisualSearch,
};

pub(crate) const HEALTHZ_PATH: &str = "/v1/healthz";
pub(crate) const SEARCH_PATH: &str = "/v1/search";
pub(crate) const ADMIN_ANALYTICS_PATH: &str = "/v1/admin/analytics";
pub(crate) const ADMIN_STATS_PATH: &str = "/v1/admin/analytics/stats";
pub(crate) const ADMIN_METRICS_PATH: &str = "/v1/admin/metrics";
const HEALTHZ_STATUS: &str = "ok";
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);
const MAX_UPLOAD_BYTES: usize = 20 * 1024 * 1024;
const MAX_FILTER_VALUES: usize = 64;
const MAX_FIELD_LEN: usize = 128;
const ERROR_INVALID_PARAMETER: &str = "invalid_parameter";
const ERROR_UNAUTHORIZED: &str = "unauthorized";
const ERROR_NOT_FOUND: &str = "not_found";
const ERROR_METHOD_NOT_ALLOWED: &str = "method_not_allowed";
const ERROR_RATE_LIMITED: &str = "rate_limited";
const ERROR_UPSTREAM_PROVIDER: &str = "upstream_provider";
const ERROR_UPSTREAM_STORAGE: &str = "upstream_storage";
const ERROR_UPSTREAM_FETCH: &str = "upstream_fetch";
const ERROR_DATA_INTEGRITY: &str = "data_integrity";
const ERROR_SEARCH_BACKEND: &str = "search_backend";
const ERROR_FUNCTION_OVERLOAD: &str = "function_overload";
const ERROR_STATEMENT_TIMEOUT: &str = "statement_timeout";
const REQUEST_ID_HEADER: &str = "x-request-id";

#[derive(Debug, Serialize, Copy, Clone, PartialEq, Eq)]
struct HealthzResponse {
    status: &'static str,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
enum ShutdownEvent {
    Pending,
    CtrlC,
    SigTerm,
    ListenerFailed,
}

pub type DynVisualSearch = Arc<dyn VisualSearch>;
pub type DynAnalyticsReader = Arc<dyn AnalyticsReader>;
pub type ApiStateHandle = Arc<ApiState>;

/// Collaborators shared by every handler.
#[derive(Clone)]
pub struct ApiState {
    pub(crate) search: DynVisualSearch,
    pub(crate) analytics: DynAnalyticsReader,
    pub(crate) admin_key: Option<String>,
    proxy_mode: ProxyMode,
    trusted: Arc<HashSet<IpAddr>>,
}

impl ApiState {
    pub fn new(search: DynVisualSearch, analytics: DynAnalyticsReader) -> Self {
        Self {
            search,
            analytics,
            admin_key: None,
            proxy_mode: ProxyMode::Off,
            trusted: Arc::new(HashSet::new()),
        }
    }

    pub fn with_admin_key(mut self, key: Option<String>) -> Self {
        self.admin_key = key.filter(|value| !value.trim().is_empty());
        self
    }

    /// Take client identity from forwarding headers when the peer is trusted.
    pub fn with_client_identity(mut self, cfg: &RateLimitConfig) -> Self {
        self.proxy_mode = cfg.proxy_mode;
        self.trusted = Arc::new(cfg.trusted_proxies.iter().copied().collect());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub(crate) struct ApiErrorBody {
    error: &'static str,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    field: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    request_id: Option<String>,
}

#[derive(Debug, Clone)]
pub(crate) struct ApiError {
    pub(crate) status: StatusCode,
    body: ApiErrorBody,
}

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("listen address may not be empty")]
    EmptyListenAddr,
    #[error("invalid listen address `{address}`: {source}")]
    InvalidListenAddr {
        address: String,
        #[source]
        source: std::net::AddrParseError,
    },
    #[error("failed to bind to {address}: {source}")]
    Bind {
        address: String,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to determine local address: {source}")]
    LocalAddr {
        #[source]
        source: std::io::Error,
    },
    #[error("axum server error: {source}")]
    Serve {
        #[source]
        source: std::io::Error,
    },
    #[error("invalid CORS configuration: {reason}")]
    CorsConfig { reason: String },
}

fn extract_client_ip(
    req: &Request<Body>,
    mode: ProxyMode,
    trusted: &HashSet<IpAddr>,
) -> Option<IpAddr> {
    let peer = req
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ci| ci.0.ip());

    let Some(peer_ip) = peer else {
        return None;
    };

    match mode {
        ProxyMode::Off => Some(peer_ip),
        ProxyMode::XForwardedFor => {
            // Only trust headers from known proxy addresses.
            if trusted.contains(&peer_ip) {
                parse_xff(req.headers()).or(Some(peer_ip))
            } else {
                Some(peer_ip)
            }
        }
        ProxyMode::Forwarded => {
            if trusted.contains(&peer_ip) {
                parse_forwarded(req.headers()).or(Some(peer_ip))
            } else {
                Some(peer_ip)
            }
        }
    }
}

fn parse_xff(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .and_then(|ip| ip.parse::<IpAddr>().ok())
}

fn parse_forwarded(headers: &HeaderMap) -> Option<IpAddr> {
    headers
        .get("forwarded")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| {
            // very simple parser: look for "for=VALUE"; VALUE may be quoted
            s.split(';')
                .flat_map(|part| part.split(','))
                .find_map(|kv| {
                    let kv = kv.trim();
                    if let Some(rest) = kv.strip_prefix("for=") {
                        let val = rest.trim_matches('"');
                        return val.parse::<IpAddr>().ok();
                    }
                    None
                })
        })
}

impl ApiError {
    fn new(status: StatusCode, error: &'static str, message: impl Into<String>) -> Self {
        ApiError {
            status,
            body: ApiErrorBody {
                error,
                message: message.into(),
                field: None,
                request_id: None,
            },
        }
    }

    fn with_field(mut self, field: &str) -> Self {
        debug_assert!(!field.is_empty());
        self.body.field = Some(field.to_string());
        self
    }

    pub(crate) fn with_request_id(mut self, request_id: Option<&str>) -> Self {
        if let Some(id) = request_id {
            debug_assert!(!id.is_empty());
            self.body.request_id = Some(id.to_string());
        }
        self
    }

    pub(crate) fn invalid_param(field: &str, message: impl Into<String>) -> Self {
        debug_assert!(!field.is_empty());
        ApiError::new(StatusCode::BAD_REQUEST, ERROR_INVALID_PARAMETER, message).with_field(field)
    }

    pub(crate) fn unauthorized() -> Self {
        ApiError::new(StatusCode::UNAUTHORIZED, ERROR_UNAUTHORIZED, "unauthorized")
    }

    fn resource_not_found(path: &str) -> Self {
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::NOT_FOUND,
            ERROR_NOT_FOUND,
            format!("resource `{path}` not found"),
        )
    }

    fn method_not_allowed(method: &str, path: &str) -> Self {
        debug_assert!(!method.is_empty());
        debug_assert!(path.starts_with('/'));
        ApiError::new(
            StatusCode::METHOD_NOT_ALLOWED,
            ERROR_METHOD_NOT_ALLOWED,
            format!("method `{method}` not allowed for `{path}`"),
        )
    }
}

impl From<SearchError> for ApiError {
    fn from(error: SearchError) -> Self {
        match error.kind {
            SearchErrorKind::InvalidParameter => {
                let field = error.field.unwrap_or_else(|| "parameter".to_string());
                ApiError::invalid_param(&field, error.message)
            }
            SearchErrorKind::RateLimited => ApiError::new(
                StatusCode::TOO_MANY_REQUESTS,
                ERROR_RATE_LIMITED,
                error.message,
            ),
            SearchErrorKind::UpstreamProvider => {
                tracing::warn!(message = %error.message, "embedding provider failed");
                ApiError::new(StatusCode::BAD_GATEWAY, ERROR_UPSTREAM_PROVIDER, error.message)
            }
            SearchErrorKind::UpstreamStorage => {
                tracing::warn!(message = %error.message, "image storage failed");
                ApiError::new(StatusCode::BAD_GATEWAY, ERROR_UPSTREAM_STORAGE, error.message)
            }
            SearchErrorKind::UpstreamFetch => {
                tracing::warn!(message = %error.message, "remote image fetch failed");
                ApiError::new(StatusCode::BAD_GATEWAY, ERROR_UPSTREAM_FETCH, error.message)
            }
            SearchErrorKind::DataIntegrity => {
                tracing::error!(message = %error.message, "embedding rejected");
                ApiError::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ERROR_DATA_INTEGRITY,
                    error.message,
                )
            }
            SearchErrorKind::SearchBackend(failure) => {
                tracing::error!(?failure, message = %error.message, "vector search failed");
                let code = match failure {
                    BackendFailure::FunctionOverload => ERROR_FUNCTION_OVERLOAD,
                    BackendFailure::StatementTimeout => ERROR_STATEMENT_TIMEOUT,
                    BackendFailure::Other => ERROR_SEARCH_BACKEND,
                };
                ApiError::new(StatusCode::INTERNAL_SERVER_ERROR, code, error.message)
            }
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        (self.status, Json(self.body)).into_response()
    }
}

fn sanitize_optional(value: Option<String>) -> Option<String> {
    value.and_then(|raw| {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn validate_list(field: &str, values: &[String], max_len: usize) -> Result<(), ApiError> {
    debug_assert!(!field.is_empty());
    debug_assert!(max_len > 0);
    if values.len() > max_len {
        return Err(ApiError::invalid_param(
            field,
            format!("must include at most {max_len} entries"),
        ));
    }
    for value in values {
        if value.len() > MAX_FIELD_LEN {
            return Err(ApiError::invalid_param(
                field,
                format!("entries must be at most {MAX_FIELD_LEN} characters"),
            ));
        }
    }
    Ok(())
}

pub(crate) fn ensure_range(
    field: &str,
    value: usize,
    min: usize,
    max: usize,
) -> Result<(), ApiError> {
    debug_assert!(!field.is_empty());
    debug_assert!(min > 0);
    debug_assert!(max >= min);
    if value < min || value > max {
        return Err(ApiError::invalid_param(
            field,
            format!("must be between {min} and {max}"),
        ));
    }
    Ok(())
}

/// A malformed crop box degrades to "no crop".
fn parse_crop(raw: Option<String>) -> Option<CropBox> {
    let raw = sanitize_optional(raw)?;
    match serde_json::from_str::<CropBox>(&raw) {
        Ok(crop) if [crop.x, crop.y, crop.w, crop.h].iter().all(|v| v.is_finite()) => Some(crop),
        Ok(_) => {
            tracing::debug!(bbox = %raw, "ignoring non-finite crop box");
            None
        }
        Err(error) => {
            tracing::debug!(bbox = %raw, %error, "ignoring malformed crop box");
            None
        }
    }
}

fn parse_filters(raw: Option<String>) -> Result<FilterSpec, ApiError> {
    let Some(raw) = sanitize_optional(raw) else {
        return Ok(FilterSpec::default());
    };
    let filters: FilterSpec = serde_json::from_str(&raw)
        .map_err(|err| ApiError::invalid_param("filters", format!("malformed filters: {err}")))?;
    validate_list("filters.brand", &filters.brands, MAX_FILTER_VALUES)?;
    validate_list("filters.color", &filters.colors, MAX_FILTER_VALUES)?;
    validate_list("filters.category", &filters.categories, MAX_FILTER_VALUES)?;
    Ok(filters)
}

fn multipart_error(err: impl std::fmt::Display) -> ApiError {
    ApiError::invalid_param("body", format!("malformed multipart body: {err}"))
}

async fn read_search_form(mut multipart: Multipart) -> Result<SearchRequest, ApiError> {
    let mut request = SearchRequest::default();
    let mut bbox = None;
    let mut filters = None;

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "file" => request.file = Some(field.bytes().await.map_err(multipart_error)?),
            "url" => request.url = Some(field.text().await.map_err(multipart_error)?),
            "bbox" => bbox = Some(field.text().await.map_err(multipart_error)?),
            "filters" | "filters_json" => {
                filters = Some(field.text().await.map_err(multipart_error)?)
            }
            other => tracing::debug!(field = %other, "ignoring unknown form field"),
        }
    }

    request.crop_requested = bbox.as_deref().is_some_and(|raw| !raw.trim().is_empty());
    request.crop = parse_crop(bbox);
    request.filters = parse_filters(filters)?;
    Ok(request)
}

pub fn build_api_router(state: ApiStateHandle) -> Router {
    debug_assert!(HEALTHZ_PATH.starts_with("/v1/"));
    debug_assert!(SEARCH_PATH.starts_with("/v1/"));

    Router::new()
        .route(
            HEALTHZ_PATH,
            get(healthz).fallback(method_not_allowed_handler),
        )
        .route(
            SEARCH_PATH,
            post(image_search)
                .fallback(method_not_allowed_handler)
                .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES)),
        )
        .route(
            ADMIN_ANALYTICS_PATH,
            get(admin::analytics_events).fallback(method_not_allowed_handler),
        )
        .route(
            ADMIN_STATS_PATH,
            get(admin::analytics_stats).fallback(method_not_allowed_handler),
        )
        .route(
            ADMIN_METRICS_PATH,
            get(admin::search_metrics).fallback(method_not_allowed_handler),
        )
        .layer(AddExtensionLayer::new(state))
}

pub async fn serve(config: ServerConfig, state: ApiStateHandle) -> Result<(), ServerError> {
    debug_assert!(config.listen_addr.len() <= 128);
    debug_assert!(!config.listen_addr.contains('\n'));

    let listen_addr = parse_listen_addr(&config.listen_addr)?;

    let listener = bind_listener(listen_addr).await?;

    let local_addr = listener
        .local_addr()
        .map_err(|source| ServerError::LocalAddr { source })?;
    tracing::info!(%local_addr, "glimpse server listening");

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownEvent::Pending);

    let shutdown_future = broadcast_shutdown(shutdown_tx);

    let app = build_app_router(&config, state)?;
    let make_service = app.into_make_service_with_connect_info::<SocketAddr>();

    let mut server_future = Box::pin(async move {
        axum::serve(listener, make_service)
            .with_graceful_shutdown(shutdown_future)
            .await
    });
    debug_assert!(DRAIN_TIMEOUT.as_secs() == 10);

    let drain_rx = shutdown_rx.clone();
    let mut drain_timeout = Box::pin(drain_timeout_future(drain_rx));

    tokio::select! {
        result = server_future.as_mut() => {
            if let Err(source) = result {
                return Err(ServerError::Serve { source });
            }
        }
        _ = drain_timeout.as_mut() => {
            // Timeout elapsed; dropping the server future forces termination.
        }
    }

    let final_event = *shutdown_rx.borrow();
    if final_event == ShutdownEvent::Pending {
        tracing::info!("server stopped without external shutdown signal");
    } else {
        tracing::info!(?final_event, "server shutdown complete");
    }

    Ok(())
}

pub fn build_app_router(config: &ServerConfig, state: ApiStateHandle) -> Result<Router, ServerError> {
    debug_assert!(HEALTHZ_PATH.starts_with('/'));
    debug_assert_eq!(HEALTHZ_STATUS, "ok");

    let mut router = Router::new()
        .merge(build_api_router(state))
        .fallback(not_found_handler);

    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            let path = matched_path_or_uri(request);
            let request_id =
                header_request_id(request.headers()).unwrap_or_else(|| "-".to_string());
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                path = %path,
                request_id = %request_id
            )
        })
        .on_response(
            |response: &axum::response::Response, latency: Duration, span: &tracing::Span| {
                let status = response.status().as_u16();
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::info!(parent: span, status, latency_ms, "request completed");
            },
        )
        .on_failure(
            |error: ServerErrorsFailureClass, latency: Duration, span: &tracing::Span| {
                let latency_ms = latency.as_millis().min(u128::from(u64::MAX)) as u64;
                tracing::error!(parent: span, latency_ms, error = %error, "request failed");
            },
        );

    if config.cors.enabled {
        let cors_layer = build_cors_layer(&config.cors)?;
        router = router.layer(cors_layer);
    }

    router = router.layer(trace_layer);

    let request_id_header = HeaderName::from_static(REQUEST_ID_HEADER);
    let make_request_id = MakeRequestUuid;
    router = router
        .layer(PropagateRequestIdLayer::new(request_id_header.clone()))
        .layer(SetRequestIdLayer::new(request_id_header, make_request_id));

    Ok(router)
}

fn build_cors_layer(config: &CorsConfig) -> Result<CorsLayer, ServerError> {
    if config.allow_origins.is_empty() {
        return Err(ServerError::CorsConfig {
            reason: "allow_origins must not be empty when CORS is enabled".to_string(),
        });
    }
    let origins: Vec<HeaderValue> = config
        .allow_origins
        .iter()
        .map(|origin| {
            HeaderValue::from_str(origin).map_err(|err| ServerError::CorsConfig {
                reason: format!("origin `{origin}` is not a valid header value: {err}"),
            })
        })
        .collect::<Result<_, _>>()?;

    let methods = config
        .allow_methods
        .iter()
        .map(|method| parse_method(method))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|reason| ServerError::CorsConfig { reason })?;

    let allow_headers = config
        .allow_headers
        .iter()
        .map(|name| parse_header(name))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|reason| ServerError::CorsConfig { reason })?;

    let expose_headers = config
        .expose_headers
        .iter()
        .map(|name| parse_header(name))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|reason| ServerError::CorsConfig { reason })?;

    let mut cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(origins))
        .allow_methods(AllowMethods::list(methods))
        .allow_credentials(config.allow_credentials)
        .max_age(Duration::from_secs(config.max_age_secs));

    if !allow_headers.is_empty() {
        cors = cors.allow_headers(AllowHeaders::list(allow_headers));
    }

    if !expose_headers.is_empty() {
        cors = cors.expose_headers(ExposeHeaders::list(expose_headers));
    }

    Ok(cors)
}

async fn image_search(
    Extension(state): Extension<ApiStateHandle>,
    request: Request<Body>,
) -> Result<Json<SearchResponse>, ApiError> {
    debug_assert!(!SEARCH_PATH.is_empty());
    let request_id = header_request_id(request.headers());
    let client = extract_client_ip(&request, state.proxy_mode, state.trusted.as_ref())
        .unwrap_or_else(|| IpAddr::from([0, 0, 0, 0]))
        .to_string();

    let multipart = Multipart::from_request(request, &())
        .await
        .map_err(|rejection| {
            ApiError::invalid_param("body", rejection.body_text())
                .with_request_id(request_id.as_deref())
        })?;
    let form = read_search_form(multipart)
        .await
        .map_err(|err| err.with_request_id(request_id.as_deref()))?;

    let response = state
        .search
        .search(&client, form)
        .await
        .map_err(|err| ApiError::from(err).with_request_id(request_id.as_deref()))?;
    Ok(Json(response))
}

async fn healthz() -> impl IntoResponse {
    debug_assert_eq!(HEALTHZ_STATUS, "ok");
    debug_assert!(HEALTHZ_STATUS.chars().all(|c| c.is_ascii_lowercase()));

    Json(HealthzResponse {
        status: HEALTHZ_STATUS,
    })
}

async fn method_not_allowed_handler(request: Request<Body>) -> axum::response::Response {
    debug_assert!(request.uri().path().starts_with('/'));
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::method_not_allowed(&method, &path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

async fn not_found_handler(request: Request<Body>) -> axum::response::Response {
    debug_assert!(request.uri().path().starts_with('/'));
    let path = request.uri().path().to_string();
    let request_id = header_request_id(request.headers());
    ApiError::resource_not_found(&path)
        .with_request_id(request_id.as_deref())
        .into_response()
}

fn matched_path_or_uri<B>(request: &Request<B>) -> String {
    if let Some(path) = request.extensions().get::<MatchedPath>() {
        let resolved = path.as_str();
        debug_assert!(resolved.starts_with('/'));
        return resolved.to_string();
    }
    let fallback = request.uri().path().to_string();
    debug_assert!(fallback.starts_with('/'));
    fallback
}

pub(crate) fn header_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(REQUEST_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

async fn wait_for_shutdown() -> ShutdownEvent {
    debug_assert!(DRAIN_TIMEOUT >= Duration::from_secs(1));

    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => ShutdownEvent::CtrlC,
            Err(error) => {
                tracing::warn!(%error, "failed to capture Ctrl+C signal");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        use tokio::signal::unix::{SignalKind, signal};

        match signal(SignalKind::terminate()) {
            Ok(mut term) => match term.recv().await {
                Some(_) => ShutdownEvent::SigTerm,
                None => ShutdownEvent::ListenerFailed,
            },
            Err(error) => {
                tracing::warn!(%error, "failed to capture SIGTERM");
                ShutdownEvent::ListenerFailed
            }
        }
    };

    #[cfg(not(unix))]
    let sigterm = std::future::pending();

    tokio::select! {
        event = ctrl_c => event,
        event = sigterm => event,
    }
}

fn parse_listen_addr(addr: &str) -> Result<SocketAddr, ServerError> {
    debug_assert!(addr.len() <= 128);
    debug_assert!(!addr.contains('\n'));

    let trimmed = addr.trim();
    if trimmed.is_empty() {
        return Err(ServerError::EmptyListenAddr);
    }

    trimmed
        .parse()
        .map_err(|source| ServerError::InvalidListenAddr {
            address: trimmed.to_string(),
            source,
        })
}

async fn bind_listener(addr: SocketAddr) -> Result<TcpListener, ServerError> {
    debug_assert!(addr.ip().is_ipv4() || addr.ip().is_ipv6());

    TcpListener::bind(addr)
        .await
        .map_err(|source| ServerError::Bind {
            address: addr.to_string(),
            source,
        })
}

fn broadcast_shutdown(
    sender: watch::Sender<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    debug_assert!(!sender.is_closed());
    debug_assert!(DRAIN_TIMEOUT.as_secs() <= 10);
    async move {
        let event = wait_for_shutdown().await;
        debug_assert!(event != ShutdownEvent::Pending);
        if let Err(error) = sender.send(event) {
            tracing::warn!(?event, %error, "failed to broadcast shutdown event");
        }
    }
}

fn drain_timeout_future(
    mut receiver: watch::Receiver<ShutdownEvent>,
) -> impl Future<Output = ()> + Send + 'static {
    debug_assert!(DRAIN_TIMEOUT.as_secs() >= 1);
    debug_assert!(DRAIN_TIMEOUT.as_secs() <= 60);
    async move {
        if receiver.changed().await.is_ok() {
            let event = *receiver.borrow_and_update();
            debug_assert!(event != ShutdownEvent::Pending);
            tracing::info!(?event, "shutdown signal received; draining connections");
            tokio::time::sleep(DRAIN_TIMEOUT).await;
            tracing::warn!(
                ?event,
                seconds = DRAIN_TIMEOUT.as_secs(),
                "graceful shutdown timed out; continuing shutdown"
            );
        }
    }
}
