mod store;

pub use store::{ProxyRedirect, RedirectStore};

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{header, HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Router;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::Result;

/// How long in-flight requests get to drain on stop.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

/// Connection-level headers that must not be forwarded.
const HOP_BY_HOP: [HeaderName; 7] = [
    header::CONNECTION,
    header::PROXY_AUTHENTICATE,
    header::PROXY_AUTHORIZATION,
    header::TE,
    header::TRAILER,
    header::TRANSFER_ENCODING,
    header::UPGRADE,
];

struct ProxyState {
    store: Arc<RedirectStore>,
    client: reqwest::Client,
}

/// HTTP listener mapping `Host` headers to redirect targets and
/// reverse-proxying everything else about the request unchanged.
pub struct ProxyRouter {
    store: Arc<RedirectStore>,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl ProxyRouter {
    pub fn new(store: Arc<RedirectStore>) -> Self {
        Self {
            store,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
        }
    }

    pub fn store(&self) -> &Arc<RedirectStore> {
        &self.store
    }

    /// Binds the listener and serves in the background. Returns the bound
    /// address, so callers may pass port 0.
    pub async fn start(&self, addr: SocketAddr) -> Result<SocketAddr> {
        let state = Arc::new(ProxyState {
            store: self.store.clone(),
            client: reqwest::Client::new(),
        });
        let router = Router::new().fallback(forward).with_state(state);

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let local_addr = listener.local_addr()?;
        info!(%local_addr, "reverse proxy listening");

        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move {
            let serve = axum::serve(listener, router)
                .with_graceful_shutdown(async move { shutdown.cancelled().await });
            if let Err(err) = serve.await {
                error!("reverse proxy exited: {err}");
            }
        });
        *self.task.lock().await = Some(task);

        Ok(local_addr)
    }

    /// Drains in-flight requests, up to a bounded grace window.
    pub async fn stop(&self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.lock().await.take() {
            if timeout(SHUTDOWN_GRACE, task).await.is_err() {
                warn!("reverse proxy did not drain in time");
            }
        }
        info!("reverse proxy stopped");
    }
}

async fn forward(State(state): State<Arc<ProxyState>>, request: Request) -> Response {
    // Clients send the authority including its port; redirect sources are
    // bare hostnames, so the port is dropped before lookup.
    let Some(host) = request
        .headers()
        .get(header::HOST)
        .and_then(|h| h.to_str().ok())
        .map(|h| h.split(':').next().unwrap_or(h).to_string())
    else {
        return StatusCode::NOT_FOUND.into_response();
    };

    let Some(redirect) = state.store.get_redirect_by_host(&host) else {
        debug!(host, "no redirect for host");
        return StatusCode::NOT_FOUND.into_response();
    };

    let (parts, body) = request.into_parts();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let url = format!("{}{}", redirect.target.trim_end_matches('/'), path_and_query);

    let upstream = state
        .client
        .request(parts.method.clone(), &url)
        .headers(forwardable_headers(&parts.headers))
        .body(reqwest::Body::wrap_stream(body.into_data_stream()));

    match upstream.send().await {
        Ok(response) => {
            let status = response.status();
            let headers = forwardable_headers(response.headers());

            let mut builder = Response::builder().status(status);
            if let Some(target) = builder.headers_mut() {
                *target = headers;
            }
            builder
                .body(Body::from_stream(response.bytes_stream()))
                .unwrap_or_else(|err| {
                    error!(host, "failed to assemble upstream response: {err}");
                    StatusCode::BAD_GATEWAY.into_response()
                })
        }
        Err(err) => {
            error!(host, url, "upstream request failed: {err}");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

fn forwardable_headers(headers: &HeaderMap) -> HeaderMap {
    let mut forwarded = HeaderMap::new();
    for (name, value) in headers {
        if HOP_BY_HOP.contains(name) || *name == header::HOST {
            continue;
        }
        forwarded.append(name, value.clone());
    }
    forwarded
}
