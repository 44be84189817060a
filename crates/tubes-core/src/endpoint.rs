use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::watch;

use crate::config::EndpointSpec;
use crate::error::{Result, TubesError};
use crate::service::ToggleableService;
use crate::socks5::Socks5Bridge;
use crate::stream::{BoxedStream, Dialer, HostPort};
use crate::transport::{ConnectionStatus, SessionChannel, SshTransport};
use crate::tunnel::PortForwardTunnel;

/// One outbound secure-shell connection and the local services it carries
pub struct SecureShellEndpoint {
    transport: SshTransport,
    tunnels: Vec<Arc<PortForwardTunnel>>,
    socks5: Vec<Arc<Socks5Bridge>>,
    closing: AtomicBool,
}

impl SecureShellEndpoint {
    pub fn new(spec: EndpointSpec) -> Self {
        let tunnels = spec.tunnels.clone();
        let socks5 = spec.socks5.clone();
        let transport = SshTransport::new(spec);
        let dialer: Arc<dyn Dialer> = Arc::new(transport.clone());

        Self {
            tunnels: tunnels
                .into_iter()
                .map(|t| Arc::new(PortForwardTunnel::new(t, Arc::clone(&dialer))))
                .collect(),
            socks5: socks5
                .into_iter()
                .map(|s| Arc::new(Socks5Bridge::new(s, Arc::clone(&dialer))))
                .collect(),
            transport,
            closing: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        self.transport.name()
    }

    pub fn spec(&self) -> &EndpointSpec {
        self.transport.spec()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.transport.status()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.transport.subscribe()
    }

    pub fn tunnels(&self) -> &[Arc<PortForwardTunnel>] {
        &self.tunnels
    }

    pub fn socks5(&self) -> &[Arc<Socks5Bridge>] {
        &self.socks5
    }

    /// Every toggleable service, tunnels first
    pub fn services(&self) -> Vec<Arc<dyn ToggleableService>> {
        let tunnels = self
            .tunnels
            .iter()
            .map(|t| Arc::clone(t) as Arc<dyn ToggleableService>);
        let socks5 = self
            .socks5
            .iter()
            .map(|s| Arc::clone(s) as Arc<dyn ToggleableService>);
        tunnels.chain(socks5).collect()
    }

    pub fn service(&self, name: &str) -> Option<Arc<dyn ToggleableService>> {
        self.services().into_iter().find(|s| s.name() == name)
    }

    /// Establish the connection now rather than on first use
    pub async fn connect(&self) -> Result<()> {
        self.transport.connect().await?;
        Ok(())
    }

    pub async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        self.transport.dial(host, port).await
    }

    /// Dial a `host:port` string
    pub async fn dial_address(&self, address: &str) -> Result<BoxedStream> {
        let target = HostPort::parse(address)
            .ok_or_else(|| TubesError::dial(address, "expected host:port"))?;
        self.transport.dial(&target.host, target.port).await
    }

    pub async fn new_session(&self) -> Result<SessionChannel> {
        self.transport.new_session().await
    }

    /// Start every enabled service, and connect eagerly when configured to.
    ///
    /// A service that fails to start does not prevent the others; the first
    /// failure is returned once all have been tried.
    pub async fn activate(&self) -> Result<()> {
        self.closing.store(false, Ordering::SeqCst);
        let mut first_failure = None;

        for tunnel in self.tunnels.iter().filter(|t| t.is_enabled()) {
            if let Err(e) = tunnel.start().await {
                tracing::error!(endpoint = %self.name(), service = %tunnel.name(), error = %e, "Failed to start service");
                first_failure.get_or_insert(e);
            }
        }
        for bridge in self.socks5.iter().filter(|s| s.is_enabled()) {
            if let Err(e) = bridge.start().await {
                tracing::error!(endpoint = %self.name(), service = %bridge.name(), error = %e, "Failed to start service");
                first_failure.get_or_insert(e);
            }
        }

        if self.spec().connect_on_start {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.connect().await {
                    tracing::error!(endpoint = %transport.name(), error = %e, "Eager connect failed");
                }
            });
        }

        match first_failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Drop the connection but keep services listening; the next dial
    /// reconnects
    pub async fn disconnect(&self) {
        self.transport.disconnect().await;
    }

    /// Close every owned service, then the connection. Safe to repeat.
    pub async fn close(&self) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::warn!(endpoint = %self.name(), "Closing");
        for service in self.services() {
            service.close().await;
        }
        self.transport.disconnect().await;
        tracing::info!(endpoint = %self.name(), "Closed");
    }
}
