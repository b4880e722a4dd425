//! Core proxy server and request pipeline

use std::io::Read;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::Router;
use eyre::Result;
use serde_json::Value;
use tokio::net::TcpListener;
use tokio::sync::broadcast;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::cache::TieredCache;
use crate::config::Config;
use crate::item::{CachedHttpResponse, CachedItem};
use crate::jsonrpc::{self, status_code_of, RpcError, RpcRequest, RpcResponse, MIN_REQUEST_LEN};
use crate::metrics::MetricsCollector;
use crate::upstream::{UpstreamPool, UpstreamResponse, DEFAULT_MAX_ATTEMPTS};

const INDEX_MESSAGE: &str = "JSON-RPC Proxy, please request with POST Method";
const CONTENT_TYPE_JSON: &str = "application/json; charset=utf-8";

/// Builder for [`ProxyServer`] with sensible defaults.
pub struct ProxyServerBuilder {
    config: Config,
    max_attempts: usize,
}

impl ProxyServerBuilder {
    /// Starts a builder from a validated-or-not configuration; `build`
    /// normalizes and validates it.
    pub fn new(config: Config) -> Self {
        Self { config, max_attempts: DEFAULT_MAX_ATTEMPTS }
    }

    /// Overrides the pool retry budget (still capped at the upstream count).
    pub fn max_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Builds the server and spawns its background sweepers.
    pub async fn build(self) -> Result<ProxyServer> {
        ProxyServer::new(self.config, self.max_attempts).await
    }
}

/// The proxy server: HTTP ingress plus the request pipeline behind it.
#[derive(Clone)]
pub struct ProxyServer {
    handler: Arc<RpcHandler>,
    shutdown_tx: broadcast::Sender<()>,
}

#[derive(Clone)]
struct AppState {
    handler: Arc<RpcHandler>,
}

impl ProxyServer {
    async fn new(mut config: Config, max_attempts: usize) -> Result<Self> {
        config.normalize();
        config.validate()?;

        let metrics = Arc::new(MetricsCollector::new());
        let cache = Arc::new(TieredCache::new());
        let pool = UpstreamPool::new(&config.upstreams, max_attempts, Arc::clone(&metrics))?;
        info!(upstreams = config.upstreams.len(), "starting JSON-RPC proxy");
        for url in &config.upstreams {
            info!("  - {url}");
        }

        let (shutdown_tx, _) = broadcast::channel(1);
        cache.spawn_sweepers(&shutdown_tx);

        let handler = Arc::new(RpcHandler { config, cache, pool, metrics });
        Ok(Self { handler, shutdown_tx })
    }

    /// The tiered cache behind the pipeline.
    pub fn cache(&self) -> &Arc<TieredCache> {
        &self.handler.cache
    }

    /// The metrics collector observed by the pipeline and the pool.
    pub fn metrics(&self) -> &Arc<MetricsCollector> {
        &self.handler.metrics
    }

    /// The active configuration.
    pub fn config(&self) -> &Config {
        &self.handler.config
    }

    /// Signals the server and its background tasks to stop.
    pub fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
    }

    /// Builds the router: the index page on `GET /`, the JSON-RPC endpoint
    /// on `POST <config.path>`, the access-log layer and the panic net.
    pub fn router(&self) -> Router {
        let path = self.handler.config.path.clone();
        let router = if path == "/" {
            Router::new().route("/", get(index).post(handle_rpc))
        } else {
            Router::new().route("/", get(index)).route(&path, post(handle_rpc))
        };
        let router = if self.handler.config.access_log {
            router.layer(TraceLayer::new_for_http())
        } else {
            router
        };
        router
            .layer(CatchPanicLayer::new())
            .with_state(AppState { handler: Arc::clone(&self.handler) })
    }

    /// Binds `config.listen` and serves until shutdown.
    pub async fn serve(self) -> Result<()> {
        let listener = TcpListener::bind(&self.handler.config.listen).await?;
        self.serve_on(listener).await
    }

    /// Serves on an already-bound listener until shutdown.
    pub async fn serve_on(self, listener: TcpListener) -> Result<()> {
        info!("JSON-RPC proxy listening on {}", listener.local_addr()?);
        let mut shutdown_rx = self.shutdown_tx.subscribe();
        let app = self.router();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.recv().await;
                info!("shutdown signal received, stopping server gracefully");
            })
            .await?;
        Ok(())
    }
}

async fn index() -> &'static str {
    INDEX_MESSAGE
}

async fn handle_rpc(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let content_type = headers
        .get(header::CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let handler = Arc::clone(&state.handler);
    // Detached so a client disconnect cannot cancel an in-flight upstream
    // call; the outcome is still cached, only the reply is discarded.
    let pipeline =
        tokio::spawn(async move { handler.handle(content_type.as_deref(), &body).await });
    match pipeline.await {
        Ok(response) => response,
        Err(e) => {
            warn!(error = %e, "request pipeline task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// The request pipeline: parse, probe the cache per batch item, forward the
/// remainder, cache the outcome, reply.
pub struct RpcHandler {
    config: Config,
    cache: Arc<TieredCache>,
    pool: UpstreamPool,
    metrics: Arc<MetricsCollector>,
}

impl RpcHandler {
    /// Runs one HTTP request body through the pipeline to a terminal
    /// response.
    pub async fn handle(&self, content_type: Option<&str>, body: &[u8]) -> Response {
        self.metrics.record_request();
        let body = body.trim_ascii();
        if body.len() < MIN_REQUEST_LEN {
            self.metrics.record_protocol_error();
            return rpc_error_response(&RpcError::parse_error(), None);
        }
        let (reqs, singleton) = match jsonrpc::parse_requests(body) {
            Ok(parsed) => parsed,
            Err(e) => {
                self.metrics.record_protocol_error();
                return rpc_error_response(&e, None);
            }
        };
        if reqs.is_empty() {
            self.metrics.record_protocol_error();
            return rpc_error_response(&RpcError::invalid_request(), None);
        }
        let methods: Vec<&str> = reqs.iter().map(|r| r.method.as_str()).collect();
        debug!(?methods, singleton, "handling rpc request");

        let mut cache_for = Duration::ZERO;
        let mut err_for = self.config.err_for;
        let mut all_cached = true;
        let mut slots: Vec<Option<RpcResponse>> = vec![None; reqs.len()];

        for (idx, req) in reqs.iter().enumerate() {
            if !req.validate() {
                self.metrics.record_protocol_error();
                if singleton {
                    return rpc_error_response(&RpcError::invalid_request(), req.id.clone());
                }
                slots[idx] =
                    Some(RpcResponse::from_error(RpcError::invalid_request(), req.id.clone()));
                continue;
            }
            // a valid request without a cache policy cannot be served from
            // cache at all
            let Some(cc) = self.config.search(&req.method) else {
                self.metrics.record_cache_miss(&req.method);
                all_cached = false;
                break;
            };
            // fold in the minimum non-zero cache durations
            if cache_for.is_zero() || cc.ttl < cache_for {
                cache_for = cc.ttl;
            }
            if err_for.is_zero() || cc.ttl < err_for {
                err_for = cc.ttl;
            }
            let Some(item) = self.cache.get_item(&req.cache_key(), cc.ttl) else {
                self.metrics.record_cache_miss(&req.method);
                all_cached = false;
                break;
            };
            self.metrics.record_cache_hit(&req.method);
            match item {
                CachedItem::Http(cached) => {
                    if singleton {
                        return http_response(
                            cached.code,
                            cached.content_type.as_deref(),
                            cached.content_encoding.as_deref(),
                            cached.body,
                        );
                    }
                    // a batch slot cannot replay a raw HTTP reply
                    all_cached = false;
                    break;
                }
                item => {
                    if matches!(item, CachedItem::Error(_)) {
                        self.metrics.record_rpc_error(&req.method);
                    }
                    if req.is_notification() {
                        continue;
                    }
                    if singleton {
                        return single_response(item.to_rpc_response(req.id.clone()));
                    }
                    slots[idx] = Some(item.to_rpc_response(req.id.clone()));
                }
            }
        }

        if all_cached {
            return slots_response(slots, singleton);
        }

        self.forward(content_type, body, &reqs, slots, singleton, cache_for, err_for).await
    }

    /// Forwards the original body to an upstream and folds the reply back
    /// into the cache and the client response.
    #[allow(clippy::too_many_arguments)]
    async fn forward(
        &self,
        content_type: Option<&str>,
        body: &[u8],
        reqs: &[RpcRequest],
        mut slots: Vec<Option<RpcResponse>>,
        singleton: bool,
        cache_for: Duration,
        err_for: Duration,
    ) -> Response {
        let deadline = tokio::time::Instant::now() + self.config.upstream_request_timeout;
        let up = match self.pool.forward(content_type, body.to_vec(), deadline).await {
            Ok(up) => up,
            Err(err) => {
                warn!(error = %err, "error while requesting from upstream");
                let e = RpcError::internal_error().with_data(&err.to_string());
                for (idx, req) in reqs.iter().enumerate() {
                    self.cache_item(req, &CachedItem::Error(e.clone()), err_for);
                    self.metrics.record_rpc_error(&req.method);
                    if singleton {
                        return rpc_error_response(&e, req.id.clone());
                    }
                    if !req.is_notification() {
                        slots[idx] = Some(RpcResponse::from_error(e.clone(), req.id.clone()));
                    }
                }
                return slots_response(slots, singleton);
            }
        };

        let decoded = match decode_body(&up) {
            Ok(decoded) if (200..400).contains(&up.status) => decoded,
            other => {
                if let Err(e) = other {
                    debug!(error = %e, "decode error");
                }
                warn!(status = up.status, "fail to decode upstream response, forwarding verbatim");
                if singleton {
                    self.cache_http(&reqs[0], &up, err_for);
                }
                return forward_raw(&up);
            }
        };

        if singleton {
            let resp: RpcResponse = match serde_json::from_slice(&decoded) {
                Ok(resp) => resp,
                Err(e) => {
                    warn!(error = %e, "upstream reply is not JSON-RPC, forwarding verbatim");
                    self.cache_http(&reqs[0], &up, err_for);
                    return forward_raw(&up);
                }
            };
            self.record_outcome(&reqs[0], &resp, cache_for, err_for);
            single_response(resp)
        } else {
            let resps: Vec<RpcResponse> = match serde_json::from_slice(&decoded) {
                Ok(resps) => resps,
                Err(e) => {
                    // a batch decode failure cannot be attributed to a
                    // single request, so nothing is cached
                    warn!(error = %e, "upstream batch reply is not JSON-RPC, forwarding verbatim");
                    return forward_raw(&up);
                }
            };
            for (idx, resp) in resps.iter().enumerate() {
                if let Some(req) = reqs.get(idx) {
                    self.record_outcome(req, resp, cache_for, err_for);
                }
            }
            batch_response(resps)
        }
    }

    /// Caches one upstream outcome under the key of its original request.
    fn record_outcome(
        &self,
        req: &RpcRequest,
        resp: &RpcResponse,
        cache_for: Duration,
        err_for: Duration,
    ) {
        if let Some(error) = &resp.error {
            self.metrics.record_rpc_error(&req.method);
            // the client bug is not worth caching
            if !error.is_invalid_request() {
                self.cache_item(req, &CachedItem::Error(error.clone()), err_for);
            }
        } else if let Some(result) = &resp.result {
            self.cache_item(req, &CachedItem::Result(result.clone()), cache_for);
        }
    }

    fn cache_item(&self, req: &RpcRequest, item: &CachedItem, ttl: Duration) {
        let key = req.cache_key();
        if let Err(e) = self.cache.set(&key, &item.to_bytes(), ttl) {
            warn!(key, error = %e, "error while writing cache entry");
        }
    }

    fn cache_http(&self, req: &RpcRequest, up: &UpstreamResponse, err_for: Duration) {
        let item = CachedItem::Http(CachedHttpResponse {
            code: up.status,
            content_type: up.content_type.clone(),
            content_encoding: up.content_encoding.clone(),
            body: up.body.clone(),
        });
        self.cache_item(req, &item, err_for);
    }
}

/// Decodes an upstream body per its `Content-Encoding`.
///
/// Unknown encodings pass the body through untouched; gzip, deflate and br
/// are decoded and their failures surface as errors.
fn decode_body(up: &UpstreamResponse) -> std::io::Result<Vec<u8>> {
    let encoding = up.content_encoding.as_deref().unwrap_or("").trim();
    let mut out = Vec::new();
    match encoding {
        "gzip" => {
            flate2::read::GzDecoder::new(up.body.as_slice()).read_to_end(&mut out)?;
        }
        "deflate" => {
            flate2::read::ZlibDecoder::new(up.body.as_slice()).read_to_end(&mut out)?;
        }
        "br" => {
            brotli::Decompressor::new(up.body.as_slice(), 4096).read_to_end(&mut out)?;
        }
        _ => out.extend_from_slice(&up.body),
    }
    Ok(out)
}

fn json_response(status: u16, body: Vec<u8>) -> Response {
    Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR))
        .header(header::CONTENT_TYPE, CONTENT_TYPE_JSON)
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

/// An error reply for one id, with the spec's HTTP status mapping.
fn rpc_error_response(error: &RpcError, id: Option<Value>) -> Response {
    let status = status_code_of(Some(error));
    let resp = RpcResponse::from_error(error.clone(), id);
    json_response(status, serde_json::to_vec(&resp).unwrap_or_default())
}

/// A full singleton reply; the status follows its error, if any.
fn single_response(resp: RpcResponse) -> Response {
    let status = status_code_of(resp.error.as_ref());
    json_response(status, serde_json::to_vec(&resp).unwrap_or_default())
}

/// A batch reply; the status is the lowest mapped status among the items.
fn batch_response(resps: Vec<RpcResponse>) -> Response {
    if resps.is_empty() {
        return json_response(200, Vec::new());
    }
    let status = resps.iter().map(|r| status_code_of(r.error.as_ref())).min().unwrap_or(200);
    json_response(status, serde_json::to_vec(&resps).unwrap_or_default())
}

/// Emits the assembled slots; notifications never produce a slot, so a
/// fully-cached singleton notification yields an empty 200.
fn slots_response(slots: Vec<Option<RpcResponse>>, singleton: bool) -> Response {
    let resps: Vec<RpcResponse> = slots.into_iter().flatten().collect();
    if singleton {
        return json_response(200, Vec::new());
    }
    batch_response(resps)
}

/// Replays an upstream reply to the client verbatim.
fn forward_raw(up: &UpstreamResponse) -> Response {
    http_response(up.status, up.content_type.as_deref(), up.content_encoding.as_deref(), up.body.clone())
}

fn http_response(
    status: u16,
    content_type: Option<&str>,
    content_encoding: Option<&str>,
    body: Vec<u8>,
) -> Response {
    let mut builder = Response::builder()
        .status(StatusCode::from_u16(status).unwrap_or(StatusCode::BAD_GATEWAY));
    if let Some(ct) = content_type {
        builder = builder.header(header::CONTENT_TYPE, ct);
    }
    if let Some(ce) = content_encoding {
        builder = builder.header(header::CONTENT_ENCODING, ce);
    }
    builder
        .body(Body::from(body))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn upstream_response(encoding: Option<&str>, body: Vec<u8>) -> UpstreamResponse {
        UpstreamResponse {
            status: 200,
            content_type: Some("application/json".into()),
            content_encoding: encoding.map(str::to_string),
            body,
        }
    }

    #[test]
    fn test_decode_identity_and_unknown_encoding() {
        let up = upstream_response(None, b"plain".to_vec());
        assert_eq!(decode_body(&up).unwrap(), b"plain");

        let up = upstream_response(Some("zstd"), b"mystery".to_vec());
        assert_eq!(decode_body(&up).unwrap(), b"mystery");
    }

    #[test]
    fn test_decode_gzip() {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"{\"ok\":true}").unwrap();
        let compressed = encoder.finish().unwrap();

        let up = upstream_response(Some("gzip"), compressed);
        assert_eq!(decode_body(&up).unwrap(), b"{\"ok\":true}");

        let up = upstream_response(Some("gzip"), b"not gzip at all".to_vec());
        assert!(decode_body(&up).is_err());
    }

    #[test]
    fn test_decode_deflate() {
        let mut encoder =
            flate2::write::ZlibEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"[1,2,3]").unwrap();
        let compressed = encoder.finish().unwrap();

        let up = upstream_response(Some("deflate"), compressed);
        assert_eq!(decode_body(&up).unwrap(), b"[1,2,3]");
    }

    #[test]
    fn test_batch_status_is_lowest_mapped() {
        let ok = RpcResponse::from_result(serde_json::value::to_raw_value(&1).unwrap(), None);
        let not_found = RpcResponse::from_error(RpcError::method_not_found(), None);
        let invalid = RpcResponse::from_error(RpcError::invalid_request(), None);

        let resp = batch_response(vec![not_found.clone(), invalid]);
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = batch_response(vec![not_found.clone(), ok]);
        assert_eq!(resp.status(), StatusCode::OK);

        let resp = batch_response(vec![not_found]);
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_error_response_shape() {
        let resp = rpc_error_response(&RpcError::parse_error(), None);
        assert_eq!(resp.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            resp.headers().get(header::CONTENT_TYPE).unwrap(),
            CONTENT_TYPE_JSON
        );
    }
}
