//! Local SOCKS5 server whose outbound connections are dialed by an endpoint

pub mod protocol;

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::Socks5Spec;
use crate::error::{Result, TubesError};
use crate::http_bridge::HttpOverSocksBridge;
use crate::relay::relay;
use crate::service::{ConnectionHandler, ListenerControl, ToggleableService};
use crate::stream::Dialer;

use self::protocol::{Reply, Socks5Error, TargetAddr};

/// A SOCKS5 server on a local port, optionally fronted by an HTTP bridge
pub struct Socks5Bridge {
    spec: Socks5Spec,
    control: ListenerControl,
    http_bridge: tokio::sync::Mutex<Option<HttpOverSocksBridge>>,
}

struct Socks5Handler {
    name: String,
    dialer: Arc<dyn Dialer>,
    resolve_locally: bool,
}

impl Socks5Handler {
    async fn serve(&self, mut stream: TcpStream, peer: SocketAddr) -> Result<(), Socks5Error> {
        protocol::negotiate(&mut stream).await?;
        let target = protocol::read_request(&mut stream).await?;
        let host = self.destination_host(&target).await;

        match self.dialer.dial(&host, target.port()).await {
            Ok(remote) => {
                protocol::send_reply(&mut stream, Reply::Succeeded).await?;
                relay(stream, remote, format!("{} {} -> {}", self.name, peer, target));
                Ok(())
            }
            Err(e) => {
                tracing::warn!(service = %self.name, peer = %peer, remote = %target, error = %e, "Dial failed");
                let reply = match e {
                    TubesError::Dial { .. } => Reply::ConnectionRefused,
                    TubesError::Connection(_) => Reply::HostUnreachable,
                    _ => Reply::GeneralFailure,
                };
                protocol::send_reply(&mut stream, reply).await?;
                Ok(())
            }
        }
    }

    /// Hostnames are passed through untouched unless local resolution is on
    async fn destination_host(&self, target: &TargetAddr) -> String {
        match target {
            TargetAddr::Domain(host, port) if self.resolve_locally => {
                match tokio::net::lookup_host((host.as_str(), *port)).await {
                    Ok(mut addrs) => match addrs.next() {
                        Some(addr) => addr.ip().to_string(),
                        None => host.clone(),
                    },
                    Err(e) => {
                        tracing::debug!(service = %self.name, host = %host, error = %e, "Local resolution failed");
                        host.clone()
                    }
                }
            }
            _ => target.host(),
        }
    }
}

#[async_trait]
impl ConnectionHandler for Socks5Handler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        if let Err(e) = self.serve(stream, peer).await {
            tracing::error!(service = %self.name, peer = %peer, error = %e, "SOCKS5 serve failed");
        }
    }
}

impl Socks5Bridge {
    pub fn new(spec: Socks5Spec, dialer: Arc<dyn Dialer>) -> Self {
        let handler = Socks5Handler {
            name: spec.name.clone(),
            dialer,
            resolve_locally: spec.resolve_locally,
        };
        let control = ListenerControl::new(
            spec.name.clone(),
            spec.local_bind.clone(),
            spec.local_port,
            !spec.disabled,
            Arc::new(handler),
        );
        Self {
            spec,
            control,
            http_bridge: tokio::sync::Mutex::new(None),
        }
    }

    pub fn spec(&self) -> &Socks5Spec {
        &self.spec
    }

    /// Address of the chained HTTP bridge, once started
    pub async fn http_bridge_addr(&self) -> Option<SocketAddr> {
        self.http_bridge
            .lock()
            .await
            .as_ref()
            .map(HttpOverSocksBridge::local_addr)
    }

    /// Bind and start accepting without waiting for the listener to stop
    pub async fn start(&self) -> Result<SocketAddr> {
        let addr = self.control.start().await?;
        self.start_http_bridge(addr).await?;
        Ok(addr)
    }

    /// Start the configured HTTP bridge the first time the SOCKS5 listener
    /// comes up; later restarts keep the running one
    async fn start_http_bridge(&self, socks_addr: SocketAddr) -> Result<()> {
        let Some(bind) = &self.spec.http_bridge else {
            return Ok(());
        };
        let mut slot = self.http_bridge.lock().await;
        if slot.is_none() {
            *slot = Some(HttpOverSocksBridge::start(bind, socks_addr).await?);
        }
        Ok(())
    }
}

#[async_trait]
impl ToggleableService for Socks5Bridge {
    fn name(&self) -> &str {
        self.control.name()
    }

    fn is_enabled(&self) -> bool {
        self.control.is_enabled()
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        self.control.local_addr()
    }

    async fn enable(&self) -> Result<()> {
        self.control.enable().await?;
        if let Some(addr) = self.control.local_addr() {
            self.start_http_bridge(addr).await?;
        }
        Ok(())
    }

    async fn disable(&self) {
        self.control.disable().await
    }

    async fn listen(&self) -> Result<()> {
        self.start().await?;
        self.control.listen().await
    }

    async fn close(&self) {
        self.control.close().await;
        if let Some(bridge) = self.http_bridge.lock().await.take() {
            bridge.close().await;
        }
    }
}
