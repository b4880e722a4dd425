// jrpc-proxy - a caching reverse proxy for JSON-RPC 2.0
// Copyright (C) 2025 jrpc-proxy contributors
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU Affero General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU Affero General Public License for more details.
//
// You should have received a copy of the GNU Affero General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.

//! Load-balanced upstream pool
//!
//! Balances requests over the configured upstreams with a least-loaded plus
//! least-total hybrid. Unhealthy upstreams accumulate a bounded penalty that
//! decays asynchronously, steering traffic away without ever removing them
//! from the pool.

use std::sync::atomic::{AtomicI32, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::header::{HeaderValue, CONTENT_ENCODING, CONTENT_TYPE, LOCATION};
use reqwest::redirect;
use tokio::time::timeout_at;
use tracing::{debug, warn};

use crate::metrics::MetricsCollector;

/// Default pool-level retry budget; effective attempts never exceed the
/// number of upstreams.
pub const DEFAULT_MAX_ATTEMPTS: usize = 3;

const MAX_PENALTY: u32 = 300;
const PENALTY_DECAY: Duration = Duration::from_secs(3);
const MAX_REDIRECTS: usize = 8;

/// Failures surfaced by the pool, distinguishable by the pipeline.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// The absolute deadline expired before the call completed.
    #[error("upstream request timed out")]
    Timeout,
    /// More than the allowed number of redirect hops.
    #[error("too many redirects")]
    TooManyRedirects,
    /// A redirect response without a `Location` header.
    #[error("redirect response missing Location header")]
    MissingLocation,
    /// A `Location` header that does not resolve to a usable URL.
    #[error("invalid redirect location: {0}")]
    InvalidLocation(String),
    /// Transport-layer failure from the HTTP client.
    #[error(transparent)]
    Transport(#[from] reqwest::Error),
}

/// An upstream reply collected within the deadline.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    /// HTTP status code.
    pub status: u16,
    /// `Content-Type` header, if any.
    pub content_type: Option<String>,
    /// `Content-Encoding` header, if any.
    pub content_encoding: Option<String>,
    /// Raw (still encoded) response body.
    pub body: Vec<u8>,
}

/// One configured upstream: immutable endpoint identity plus mutable load
/// counters touched only through atomics.
pub struct Upstream {
    scheme: String,
    host: String,
    request_uri: String,
    pending_requests: AtomicI32,
    total_requests: AtomicU64,
    penalty: AtomicU32,
}

impl Upstream {
    fn from_url(raw: &str) -> eyre::Result<Self> {
        let url: reqwest::Url =
            raw.parse().map_err(|e| eyre::eyre!("unable to parse upstream {raw}: {e}"))?;
        let host = url
            .host_str()
            .ok_or_else(|| eyre::eyre!("upstream {raw} has no host"))?
            .to_string();
        // Url::port() already omits the scheme's default port
        let host = match url.port() {
            Some(port) => format!("{host}:{port}"),
            None => host,
        };
        let request_uri = match url.query() {
            Some(q) => format!("{}?{q}", url.path()),
            None => url.path().to_string(),
        };
        Ok(Self {
            scheme: url.scheme().to_string(),
            host,
            request_uri,
            pending_requests: AtomicI32::new(0),
            total_requests: AtomicU64::new(0),
            penalty: AtomicU32::new(0),
        })
    }

    /// The rewritten request target for this upstream.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme, self.host, self.request_uri)
    }

    fn load(&self) -> i64 {
        i64::from(self.pending_requests.load(Ordering::Relaxed))
            + i64::from(self.penalty.load(Ordering::Relaxed))
    }

    fn total(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Bumps the penalty (capped) and schedules its decay.
    fn penalize(self: &Arc<Self>) {
        if self.penalty.fetch_add(1, Ordering::Relaxed) >= MAX_PENALTY {
            self.penalty.fetch_sub(1, Ordering::Relaxed);
            return;
        }
        let upstream = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(PENALTY_DECAY).await;
            upstream.penalty.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Current penalty value, exposed for tests and introspection.
    pub fn current_penalty(&self) -> u32 {
        self.penalty.load(Ordering::Relaxed)
    }
}

/// The pool: an immutable set of upstreams plus a shared keep-alive client.
pub struct UpstreamPool {
    upstreams: Vec<Arc<Upstream>>,
    client: reqwest::Client,
    max_attempts: usize,
    metrics: Arc<MetricsCollector>,
}

impl UpstreamPool {
    /// Builds the pool from upstream URLs.
    ///
    /// Redirects are followed manually so the hop budget stays under the
    /// pool's control; the effective retry budget is
    /// `min(max_attempts, upstream count)`, floored at one attempt.
    pub fn new(
        urls: &[String],
        max_attempts: usize,
        metrics: Arc<MetricsCollector>,
    ) -> eyre::Result<Self> {
        eyre::ensure!(!urls.is_empty(), "upstream pool cannot be empty");
        let upstreams = urls
            .iter()
            .map(|u| Upstream::from_url(u).map(Arc::new))
            .collect::<eyre::Result<Vec<_>>>()?;
        let client = reqwest::Client::builder().redirect(redirect::Policy::none()).build()?;
        let max_attempts = max_attempts.min(upstreams.len()).max(1);
        Ok(Self { upstreams, client, max_attempts, metrics })
    }

    /// Number of configured upstreams.
    pub fn len(&self) -> usize {
        self.upstreams.len()
    }

    /// Always false: construction rejects an empty pool.
    pub fn is_empty(&self) -> bool {
        self.upstreams.is_empty()
    }

    /// Picks the upstream with the smallest `(pending + penalty, total)`
    /// tuple; ties keep the first occurrence.
    fn select(&self) -> &Arc<Upstream> {
        let mut best = &self.upstreams[0];
        let mut best_load = best.load();
        let mut best_total = best.total();
        for upstream in &self.upstreams[1..] {
            let load = upstream.load();
            let total = upstream.total();
            if load < best_load || (load == best_load && total < best_total) {
                best = upstream;
                best_load = load;
                best_total = total;
            }
        }
        best
    }

    /// Forwards `body` to an upstream, retrying across the pool.
    ///
    /// Retries on transport errors and on HTTP 200 with a zero-length body
    /// (an upstream glitch); each retry re-runs selection, which naturally
    /// rotates to a less penalized upstream. The deadline is absolute and
    /// spans all attempts.
    pub async fn forward(
        &self,
        content_type: Option<&str>,
        body: Vec<u8>,
        deadline: tokio::time::Instant,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut last: Option<Result<UpstreamResponse, UpstreamError>> = None;
        for attempt in 0..self.max_attempts {
            let upstream = self.select();
            debug!(
                url = %upstream.url(),
                attempt = attempt + 1,
                max_attempts = self.max_attempts,
                "dispatching to upstream"
            );
            let result = self.dispatch(upstream, content_type, body.clone(), deadline).await;
            match &result {
                Ok(resp) if resp.status == 200 && resp.body.is_empty() => {
                    warn!(url = %upstream.url(), "empty 200 body from upstream, retrying");
                    last = Some(result);
                }
                Ok(_) => return result,
                Err(e) => {
                    warn!(url = %upstream.url(), error = %e, "upstream dispatch failed");
                    last = Some(result);
                }
            }
        }
        // max_attempts >= 1, so at least one attempt ran
        last.unwrap_or(Err(UpstreamError::Timeout))
    }

    /// One dispatch against one upstream, bookkeeping included.
    async fn dispatch(
        &self,
        upstream: &Arc<Upstream>,
        content_type: Option<&str>,
        body: Vec<u8>,
        deadline: tokio::time::Instant,
    ) -> Result<UpstreamResponse, UpstreamError> {
        upstream.pending_requests.fetch_add(1, Ordering::Relaxed);
        let started = Instant::now();
        let result = self.dispatch_inner(upstream, content_type, body, deadline).await;
        upstream.pending_requests.fetch_sub(1, Ordering::Relaxed);

        let elapsed_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(_) => {
                upstream.total_requests.fetch_add(1, Ordering::Relaxed);
                self.metrics.record_upstream_request(&upstream.url(), elapsed_ms, true);
            }
            Err(_) => {
                upstream.penalize();
                self.metrics.record_upstream_request(&upstream.url(), elapsed_ms, false);
            }
        }
        result
    }

    async fn dispatch_inner(
        &self,
        upstream: &Arc<Upstream>,
        content_type: Option<&str>,
        body: Vec<u8>,
        deadline: tokio::time::Instant,
    ) -> Result<UpstreamResponse, UpstreamError> {
        let mut url: reqwest::Url = upstream
            .url()
            .parse()
            .map_err(|_| UpstreamError::InvalidLocation(upstream.url()))?;
        let mut hops = 0usize;
        loop {
            let mut request = self.client.post(url.clone()).body(body.clone());
            if let Some(ct) = content_type {
                if let Ok(value) = HeaderValue::from_str(ct) {
                    request = request.header(CONTENT_TYPE, value);
                }
            }
            let response = timeout_at(deadline, request.send())
                .await
                .map_err(|_| UpstreamError::Timeout)??;

            let status = response.status();
            if !status.is_redirection() {
                let header = |name| {
                    response
                        .headers()
                        .get(name)
                        .and_then(|v: &HeaderValue| v.to_str().ok())
                        .map(str::to_string)
                };
                let content_type = header(CONTENT_TYPE);
                let content_encoding = header(CONTENT_ENCODING);
                let bytes = timeout_at(deadline, response.bytes())
                    .await
                    .map_err(|_| UpstreamError::Timeout)??;
                return Ok(UpstreamResponse {
                    status: status.as_u16(),
                    content_type,
                    content_encoding,
                    body: bytes.to_vec(),
                });
            }

            hops += 1;
            if hops > MAX_REDIRECTS {
                return Err(UpstreamError::TooManyRedirects);
            }
            let location = response
                .headers()
                .get(LOCATION)
                .ok_or(UpstreamError::MissingLocation)?
                .to_str()
                .map_err(|_| UpstreamError::MissingLocation)?
                .to_string();
            url = url
                .join(&location)
                .map_err(|_| UpstreamError::InvalidLocation(location))?;
            debug!(url = %url, hops, "following upstream redirect");
        }
    }
}
