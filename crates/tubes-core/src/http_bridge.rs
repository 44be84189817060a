//! HTTP forward proxy whose upstream connections go through a SOCKS5 server
//!
//! `CONNECT` requests become raw tunnels; every other method is forwarded
//! over a pooled HTTP/1.1 connection opened through the SOCKS5 server.
//! The server speaks HTTP/1.1 only.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use futures_util::future::{BoxFuture, FutureExt};
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::HeaderMap;
use hyper::rt::{Read, ReadBufCursor, Write};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode, Uri};
use hyper_util::client::legacy::connect::{Connected, Connection};
use hyper_util::client::legacy::Client;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tokio_socks::tcp::Socks5Stream;
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TubesError};
use crate::relay::relay;

/// Upper bound on idle upstream connections kept per `host:port`
pub const MAX_IDLE_PER_HOST: usize = 100;

/// Idle upstream connections older than this are discarded
pub const IDLE_TIMEOUT: Duration = Duration::from_secs(90);

type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Headers that describe a single hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "proxy-connection",
    "te",
    "trailers",
    "transfer-encoding",
    "upgrade",
];

/// Opens upstream connections for the pooled client through the SOCKS5 server
#[derive(Clone)]
struct SocksConnector {
    socks_addr: SocketAddr,
}

impl tower_service::Service<Uri> for SocksConnector {
    type Response = SocksConnection;
    type Error = std::io::Error;
    type Future = BoxFuture<'static, std::io::Result<SocksConnection>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let socks_addr = self.socks_addr;
        async move {
            let authority = upstream_authority(&uri).ok_or_else(|| {
                std::io::Error::new(
                    std::io::ErrorKind::InvalidInput,
                    format!("cannot proxy {}", uri),
                )
            })?;
            tracing::debug!(remote = %authority, "Opening upstream connection");
            let stream = Socks5Stream::connect(socks_addr, authority.as_str())
                .await
                .map_err(std::io::Error::other)?;
            Ok(SocksConnection(TokioIo::new(stream)))
        }
        .boxed()
    }
}

/// An upstream HTTP/1.1 connection carried by the SOCKS5 server
struct SocksConnection(TokioIo<Socks5Stream<TcpStream>>);

impl Connection for SocksConnection {
    fn connected(&self) -> Connected {
        Connected::new()
    }
}

impl Read for SocksConnection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: ReadBufCursor<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_read(cx, buf)
    }
}

impl Write for SocksConnection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.0).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_flush(cx)
    }

    fn poll_shutdown(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.0).poll_shutdown(cx)
    }
}

struct ProxyState {
    socks_addr: SocketAddr,
    client: Client<SocksConnector, Incoming>,
}

/// A running HTTP-over-SOCKS5 bridge
pub struct HttpOverSocksBridge {
    local: SocketAddr,
    socks_addr: SocketAddr,
    cancel: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl HttpOverSocksBridge {
    /// Bind `bind` and start serving; upstream dials go through `socks_addr`
    pub async fn start(bind: &str, socks_addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(bind)
            .await
            .map_err(|e| TubesError::listener(bind, e))?;
        let local = listener
            .local_addr()
            .map_err(|e| TubesError::listener(bind, e))?;

        let client = Client::builder(TokioExecutor::new())
            .pool_timer(TokioTimer::new())
            .pool_max_idle_per_host(MAX_IDLE_PER_HOST)
            .pool_idle_timeout(IDLE_TIMEOUT)
            .build(SocksConnector { socks_addr });
        let state = Arc::new(ProxyState { socks_addr, client });
        let cancel = CancellationToken::new();
        let task = tokio::spawn(serve(listener, state, cancel.clone()));

        tracing::info!(local = %local, socks = %socks_addr, "HTTP bridge listening");
        Ok(Self {
            local,
            socks_addr,
            cancel,
            task: Mutex::new(Some(task)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn socks_addr(&self) -> SocketAddr {
        self.socks_addr
    }

    /// Stop accepting. Tunnels and requests in flight run to completion.
    pub async fn close(&self) {
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
            tracing::info!(local = %self.local, "HTTP bridge closed");
        }
    }
}

async fn serve(listener: TcpListener, state: Arc<ProxyState>, cancel: CancellationToken) {
    loop {
        let (stream, peer) = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    tracing::error!(error = %e, "HTTP bridge accept failed");
                    break;
                }
            },
        };

        let state = Arc::clone(&state);
        tokio::spawn(async move {
            let _ = stream.set_nodelay(true);
            let service = service_fn(move |req| proxy(Arc::clone(&state), req));
            if let Err(e) = http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .with_upgrades()
                .await
            {
                tracing::debug!(peer = %peer, error = %e, "HTTP bridge connection ended");
            }
        });
    }
}

async fn proxy(
    state: Arc<ProxyState>,
    req: Request<Incoming>,
) -> std::result::Result<Response<ProxyBody>, Infallible> {
    tracing::debug!(method = %req.method(), uri = %req.uri(), "Proxying request");
    if req.method() == Method::CONNECT {
        Ok(tunnel(state, req).await)
    } else {
        Ok(forward(state, req).await)
    }
}

async fn tunnel(state: Arc<ProxyState>, req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(target) = req.uri().authority().map(|a| a.to_string()) else {
        return text_response(StatusCode::BAD_REQUEST, "CONNECT target must be host:port");
    };

    let upstream = match Socks5Stream::connect(state.socks_addr, target.as_str()).await {
        Ok(stream) => stream,
        Err(e) => {
            tracing::warn!(remote = %target, error = %e, "CONNECT dial failed");
            return text_response(StatusCode::SERVICE_UNAVAILABLE, e.to_string());
        }
    };

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                relay(TokioIo::new(upgraded), upstream, format!("CONNECT {}", target));
            }
            Err(e) => tracing::warn!(remote = %target, error = %e, "CONNECT upgrade failed"),
        }
    });

    let mut response = Response::new(empty());
    response
        .extensions_mut()
        .insert(hyper::ext::ReasonPhrase::from_static(b"Connection Established"));
    response
}

async fn forward(state: Arc<ProxyState>, mut req: Request<Incoming>) -> Response<ProxyBody> {
    let Some(authority) = upstream_authority(req.uri()) else {
        return text_response(
            StatusCode::BAD_REQUEST,
            "Proxy requests need an absolute http:// URI",
        );
    };
    // The client rewrites the target to origin-form and fills in Host.
    strip_hop_by_hop(req.headers_mut());

    let response = match state.client.request(req).await {
        Ok(response) => response,
        Err(e) => {
            let reason = match std::error::Error::source(&e) {
                Some(source) => format!("{}: {}", e, source),
                None => e.to_string(),
            };
            tracing::warn!(remote = %authority, error = %reason, "Upstream request failed");
            return text_response(StatusCode::SERVICE_UNAVAILABLE, reason);
        }
    };

    let (mut parts, body) = response.into_parts();
    strip_hop_by_hop(&mut parts.headers);
    Response::from_parts(parts, body.boxed())
}

/// `host:port` of an absolute `http://` request URI
fn upstream_authority(uri: &Uri) -> Option<String> {
    if uri.scheme_str() != Some("http") {
        return None;
    }
    let host = uri.host()?;
    let port = uri.port_u16().unwrap_or(80);
    if host.contains(':') && !host.starts_with('[') {
        Some(format!("[{}]:{}", host, port))
    } else {
        Some(format!("{}:{}", host, port))
    }
}

fn strip_hop_by_hop(headers: &mut HeaderMap) {
    let listed: Vec<String> = headers
        .get_all(hyper::header::CONNECTION)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(|name| name.trim().to_ascii_lowercase())
        .filter(|name| !name.is_empty())
        .collect();

    for name in HOP_BY_HOP {
        headers.remove(*name);
    }
    for name in listed {
        headers.remove(name.as_str());
    }
}

fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

fn text_response(status: StatusCode, message: impl Into<String>) -> Response<ProxyBody> {
    let body = Full::new(Bytes::from(message.into()))
        .map_err(|never| match never {})
        .boxed();
    let mut response = Response::new(body);
    *response.status_mut() = status;
    response
}
