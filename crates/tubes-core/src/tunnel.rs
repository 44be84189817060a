use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;

use crate::config::TunnelSpec;
use crate::error::Result;
use crate::relay::relay;
use crate::service::{ConnectionHandler, ListenerControl, ToggleableService};
use crate::stream::{Dialer, HostPort};

/// Relays every local connection to one fixed remote address
pub struct PortForwardTunnel {
    spec: TunnelSpec,
    control: ListenerControl,
}

struct ForwardHandler {
    name: String,
    remote: HostPort,
    dialer: Arc<dyn Dialer>,
}

#[async_trait]
impl ConnectionHandler for ForwardHandler {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) {
        let _ = stream.set_nodelay(true);
        match self.dialer.dial(&self.remote.host, self.remote.port).await {
            Ok(remote) => {
                let label = format!("{} {} -> {}", self.name, peer, self.remote);
                relay(stream, remote, label);
            }
            Err(e) => {
                tracing::error!(
                    service = %self.name,
                    peer = %peer,
                    remote = %self.remote,
                    error = %e,
                    "Failed to dial remote"
                );
            }
        }
    }
}

impl PortForwardTunnel {
    pub fn new(spec: TunnelSpec, dialer: Arc<dyn Dialer>) -> Self {
        let handler = ForwardHandler {
            name: spec.name.clone(),
            remote: spec.remote(),
            dialer,
        };
        let control = ListenerControl::new(
            spec.name.clone(),
            spec.local_bind.clone(),
            spec.local_port,
            !spec.disabled,
            Arc::new(handler),
        );
        Self { spec, control }
    }

    pub fn spec(&self) -> &TunnelSpec {
        &self.spec
    }

    /// Bind and start accepting without waiting for the listener to stop
    pub async fn start(&self) -> Result<SocketAddr> {
        self.control.start().await
    }
}

#[async_trait]
impl ToggleableService for PortForwardTunnel {
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
        self.control.enable().await
    }

    async fn disable(&self) {
        self.control.disable().await
    }

    async fn listen(&self) -> Result<()> {
        self.control.listen().await
    }

    async fn close(&self) {
        self.control.close().await
    }
}
