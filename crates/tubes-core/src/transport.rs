//! Lazily established, shared secure-shell transport
//!
//! The transport is `Disconnected`, `Connecting` or `Connected`. Every
//! caller that finds it `Connecting` awaits the same in-flight connect and
//! receives its result, so concurrent first dials open one session.

use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use parking_lot::Mutex;
use russh::client;
use russh::keys::key::PrivateKeyWithHashAlg;
use russh::keys::ssh_key::PublicKey;
use tokio::sync::watch;

use crate::config::{AuthMethod, EndpointSpec};
use crate::error::{ConnectionError, Result, TubesError};
use crate::hostkey::{HostKeyPolicy, HostKeyVerdict};
use crate::stream::{BoxedStream, Dialer, HostPort};

pub type SshHandle = client::Handle<ClientHandler>;

/// A remote command/session channel
pub type SessionChannel = russh::Channel<client::Msg>;

type ConnectFuture = Shared<BoxFuture<'static, Result<Arc<SshHandle>, ConnectionError>>>;

/// Connection state published to observers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Disconnected => write!(f, "disconnected"),
            Self::Connecting => write!(f, "connecting"),
            Self::Connected => write!(f, "connected"),
        }
    }
}

enum TransportState {
    Disconnected,
    /// `generation` identifies the attempt, so a superseded connect never
    /// overwrites the state of a newer one
    Connecting {
        generation: u64,
        pending: ConnectFuture,
    },
    Connected(Arc<SshHandle>),
}

/// russh client callbacks; applies the endpoint's host-key policy
pub struct ClientHandler {
    host: String,
    port: u16,
    policy: HostKeyPolicy,
    rejection: Arc<Mutex<Option<String>>>,
}

impl client::Handler for ClientHandler {
    type Error = russh::Error;

    async fn check_server_key(
        &mut self,
        server_public_key: &PublicKey,
    ) -> std::result::Result<bool, Self::Error> {
        match self.policy.verify(&self.host, self.port, server_public_key) {
            HostKeyVerdict::Rejected(reason) => {
                tracing::error!(host = %self.host, port = self.port, error = %reason, "Host key rejected");
                *self.rejection.lock() = Some(reason);
                Ok(false)
            }
            _ => Ok(true),
        }
    }
}

struct TransportInner {
    spec: EndpointSpec,
    config: Arc<client::Config>,
    state: Mutex<TransportState>,
    generations: AtomicU64,
    status: watch::Sender<ConnectionStatus>,
}

/// The outbound secure-shell connection of one endpoint
#[derive(Clone)]
pub struct SshTransport {
    inner: Arc<TransportInner>,
}

impl SshTransport {
    pub fn new(spec: EndpointSpec) -> Self {
        let config = client::Config {
            inactivity_timeout: None,
            keepalive_interval: Some(std::time::Duration::from_secs(30)),
            keepalive_max: 3,
            nodelay: true,
            ..Default::default()
        };
        let (status, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            inner: Arc::new(TransportInner {
                spec,
                config: Arc::new(config),
                state: Mutex::new(TransportState::Disconnected),
                generations: AtomicU64::new(0),
                status,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.spec.name
    }

    pub fn spec(&self) -> &EndpointSpec {
        &self.inner.spec
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.inner.status.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<ConnectionStatus> {
        self.inner.status.subscribe()
    }

    /// Return the live connection, establishing it first if needed.
    ///
    /// Concurrent callers share one in-flight attempt and its outcome.
    pub async fn connect(&self) -> Result<Arc<SshHandle>, ConnectionError> {
        let pending = {
            let mut state = self.inner.state.lock();
            if let TransportState::Connected(handle) = &*state {
                if !handle.is_closed() {
                    return Ok(Arc::clone(handle));
                }
                tracing::warn!(endpoint = %self.name(), "Connection lost, reconnecting");
            }
            if let TransportState::Connecting { pending, .. } = &*state {
                pending.clone()
            } else {
                let generation = self.inner.generations.fetch_add(1, Ordering::Relaxed);
                let this = self.clone();
                let pending = async move { this.establish(generation).await }
                    .boxed()
                    .shared();
                *state = TransportState::Connecting {
                    generation,
                    pending: pending.clone(),
                };
                self.inner.status.send_replace(ConnectionStatus::Connecting);
                pending
            }
        };
        pending.await
    }

    /// Open a stream to `host:port` from the remote side of the connection
    pub async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        let handle = self.connect().await?;
        let target = HostPort::new(host, port);
        tracing::debug!(endpoint = %self.name(), remote = %target, "Dialing");
        let channel = handle
            .channel_open_direct_tcpip(host, u32::from(port), "127.0.0.1", 0)
            .await
            .map_err(|e| TubesError::dial(target.to_string(), e))?;
        Ok(Box::new(channel.into_stream()))
    }

    /// Open a session channel for running remote commands
    pub async fn new_session(&self) -> Result<SessionChannel> {
        let handle = self.connect().await?;
        handle
            .channel_open_session()
            .await
            .map_err(|e| TubesError::Session(e.to_string()))
    }

    /// Close the connection if there is one. Safe to call repeatedly.
    pub async fn disconnect(&self) {
        let previous = std::mem::replace(&mut *self.inner.state.lock(), TransportState::Disconnected);
        if let TransportState::Connected(handle) = previous {
            tracing::info!(endpoint = %self.name(), "Disconnecting");
            if let Err(e) = handle
                .disconnect(russh::Disconnect::ByApplication, "", "en")
                .await
            {
                tracing::debug!(endpoint = %self.name(), error = %e, "Disconnect failed");
            }
        }
        self.inner.status.send_replace(ConnectionStatus::Disconnected);
    }

    async fn establish(&self, generation: u64) -> Result<Arc<SshHandle>, ConnectionError> {
        let policy = self.inner.spec.reconnect;
        let mut failed = 0;
        let result = loop {
            match self.attempt().await {
                Ok(handle) => break Ok(Arc::new(handle)),
                Err(e) => {
                    failed += 1;
                    if !e.retryable || failed >= policy.attempts() {
                        break Err(e);
                    }
                    let delay = policy.backoff(failed);
                    tracing::warn!(
                        endpoint = %self.name(),
                        attempt = failed,
                        error = %e.reason,
                        "Connect failed, retrying in {:?}",
                        delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        };

        let mut state = self.inner.state.lock();
        let still_wanted = matches!(
            *state,
            TransportState::Connecting { generation: current, .. } if current == generation
        );
        match result {
            Ok(handle) if still_wanted => {
                tracing::info!(endpoint = %self.name(), "Connected");
                *state = TransportState::Connected(Arc::clone(&handle));
                self.inner.status.send_replace(ConnectionStatus::Connected);
                Ok(handle)
            }
            Ok(handle) => {
                drop(state);
                tokio::spawn(async move {
                    let _ = handle
                        .disconnect(russh::Disconnect::ByApplication, "", "en")
                        .await;
                });
                Err(ConnectionError::fatal(
                    self.name(),
                    "disconnected while connecting",
                ))
            }
            Err(e) => {
                tracing::error!(endpoint = %self.name(), error = %e.reason, "Connect failed");
                if still_wanted {
                    *state = TransportState::Disconnected;
                    self.inner.status.send_replace(ConnectionStatus::Disconnected);
                }
                Err(e)
            }
        }
    }

    async fn attempt(&self) -> Result<SshHandle, ConnectionError> {
        let spec = &self.inner.spec;
        let rejection = Arc::new(Mutex::new(None));
        let handler = ClientHandler {
            host: spec.hostname.clone(),
            port: spec.port,
            policy: spec.host_key.clone(),
            rejection: Arc::clone(&rejection),
        };

        tracing::debug!(endpoint = %spec.name, host = %spec.hostname, port = spec.port, "Connecting");
        let connecting = client::connect(
            Arc::clone(&self.inner.config),
            (spec.hostname.as_str(), spec.port),
            handler,
        );
        let mut handle = match tokio::time::timeout(spec.connect_timeout, connecting).await {
            Ok(Ok(handle)) => handle,
            Ok(Err(e)) => {
                if let Some(reason) = rejection.lock().take() {
                    return Err(ConnectionError::fatal(
                        &spec.name,
                        format!("host key rejected: {}", reason),
                    ));
                }
                return Err(ConnectionError::new(&spec.name, e.to_string()));
            }
            Err(_) => {
                return Err(ConnectionError::new(
                    &spec.name,
                    format!("timed out after {:?}", spec.connect_timeout),
                ));
            }
        };

        self.authenticate(&mut handle).await?;
        Ok(handle)
    }

    /// Try each configured method in order; the first success wins
    async fn authenticate(&self, handle: &mut SshHandle) -> Result<(), ConnectionError> {
        let spec = &self.inner.spec;
        let mut last_error = String::from("no authentication methods configured");

        for method in &spec.auth {
            let outcome = match method {
                AuthMethod::Password(password) => handle
                    .authenticate_password(spec.user.as_str(), password.as_str())
                    .await
                    .map(|r| r.success())
                    .map_err(|e| e.to_string()),
                AuthMethod::Key { path, passphrase } => {
                    auth_with_key(handle, &spec.user, path, passphrase.as_deref()).await
                }
                AuthMethod::Agent => auth_with_agent(handle, &spec.user).await,
            };
            match outcome {
                Ok(true) => {
                    tracing::debug!(endpoint = %spec.name, method = ?method, "Authenticated");
                    return Ok(());
                }
                Ok(false) => last_error = format!("{:?} rejected by server", method),
                Err(e) => last_error = e,
            }
            tracing::debug!(endpoint = %spec.name, method = ?method, error = %last_error, "Authentication method failed");
        }

        Err(ConnectionError::fatal(
            &spec.name,
            format!("authentication failed for {}: {}", spec.user, last_error),
        ))
    }
}

async fn auth_with_key(
    handle: &mut SshHandle,
    user: &str,
    path: &Path,
    passphrase: Option<&str>,
) -> std::result::Result<bool, String> {
    let key = russh::keys::load_secret_key(path, passphrase)
        .map_err(|e| format!("cannot load key {}: {}", path.display(), e))?;
    let hash_alg = handle
        .best_supported_rsa_hash()
        .await
        .ok()
        .flatten()
        .flatten();
    handle
        .authenticate_publickey(user, PrivateKeyWithHashAlg::new(Arc::new(key), hash_alg))
        .await
        .map(|r| r.success())
        .map_err(|e| e.to_string())
}

#[cfg(unix)]
async fn auth_with_agent(handle: &mut SshHandle, user: &str) -> std::result::Result<bool, String> {
    use russh::keys::agent::client::AgentClient;

    let mut agent = AgentClient::connect_env()
        .await
        .map_err(|e| format!("SSH agent unavailable: {}", e))?;
    let identities = agent
        .request_identities()
        .await
        .map_err(|e| format!("cannot list agent identities: {}", e))?;
    if identities.is_empty() {
        return Err("SSH agent has no identities".to_string());
    }

    for public_key in identities {
        let hash_alg = handle
            .best_supported_rsa_hash()
            .await
            .ok()
            .flatten()
            .flatten();
        match handle
            .authenticate_publickey_with(user, public_key, hash_alg, &mut agent)
            .await
        {
            Ok(result) if result.success() => return Ok(true),
            Ok(_) => {}
            Err(e) => tracing::debug!(error = %e, "Agent identity failed"),
        }
    }
    Ok(false)
}

#[cfg(not(unix))]
async fn auth_with_agent(_handle: &mut SshHandle, _user: &str) -> std::result::Result<bool, String> {
    Err("SSH agent authentication is only supported on unix".to_string())
}

#[async_trait]
impl Dialer for SshTransport {
    async fn dial(&self, host: &str, port: u16) -> Result<BoxedStream> {
        SshTransport::dial(self, host, port).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconnect::ReconnectPolicy;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn spec_for(port: u16) -> EndpointSpec {
        let mut spec = EndpointSpec::new("tester", "127.0.0.1", port);
        spec.auth = vec![AuthMethod::Password("secret".into())];
        spec.host_key = HostKeyPolicy::Insecure;
        spec.connect_timeout = Duration::from_millis(500);
        spec.reconnect = ReconnectPolicy {
            max_attempts: 2,
            initial_backoff_ms: 10,
            max_backoff_ms: 10,
        };
        spec
    }

    /// A port with nothing listening on it
    async fn closed_port() -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap().port()
    }

    #[tokio::test]
    async fn test_connect_failure_reports_connection_error() {
        let transport = SshTransport::new(spec_for(closed_port().await));
        let mut status = transport.subscribe();

        let err = transport.connect().await.map(|_| ()).unwrap_err();
        assert!(err.retryable);
        assert_eq!(err.endpoint, format!("tester@127.0.0.1:{}", transport.spec().port));
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
        assert!(status.has_changed().unwrap());
        assert_eq!(*status.borrow_and_update(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_dial_surfaces_connection_error() {
        let transport = SshTransport::new(spec_for(closed_port().await));
        let err = match transport.dial("example.com", 80).await {
            Ok(_) => panic!("dial should fail without a server"),
            Err(e) => e,
        };
        assert!(matches!(err, TubesError::Connection(_)));
    }

    #[tokio::test]
    async fn test_concurrent_failures_share_one_attempt() {
        // A listener that accepts and never speaks: each attempt times out,
        // so concurrent callers would multiply accepted sockets if they
        // did not share the in-flight connect.
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                held.push(stream);
            }
        });

        let mut spec = spec_for(port);
        spec.connect_timeout = Duration::from_millis(200);
        spec.reconnect = ReconnectPolicy::once();
        let transport = SshTransport::new(spec);

        let attempts: Vec<_> = (0..8)
            .map(|_| {
                let transport = transport.clone();
                tokio::spawn(async move { transport.connect().await })
            })
            .collect();
        for attempt in attempts {
            assert!(attempt.await.unwrap().is_err());
        }
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    /// Count accepted sockets; `hold` keeps them open without speaking,
    /// otherwise each is dropped as soon as it is accepted
    async fn counting_listener(hold: bool) -> (u16, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let accepted = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&accepted);
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                counter.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
                if hold {
                    held.push(stream);
                }
            }
        });
        (port, accepted)
    }

    #[tokio::test]
    async fn test_retryable_failures_are_retried_with_backoff() {
        let (port, accepted) = counting_listener(false).await;
        let mut spec = spec_for(port);
        spec.reconnect = ReconnectPolicy {
            max_attempts: 3,
            initial_backoff_ms: 10,
            max_backoff_ms: 1_000,
        };
        let transport = SshTransport::new(spec);

        let started = std::time::Instant::now();
        let err = transport.connect().await.map(|_| ()).unwrap_err();
        assert!(err.retryable, "got {}", err);
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 3);
        // 10 ms after the first failure, 20 ms after the second
        assert!(started.elapsed() >= Duration::from_millis(30));
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_superseded_connect_leaves_newer_attempt_alone() {
        let (port, accepted) = counting_listener(true).await;
        let mut spec = spec_for(port);
        spec.connect_timeout = Duration::from_millis(400);
        spec.reconnect = ReconnectPolicy::once();
        let transport = SshTransport::new(spec);

        let first = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect().await.map(|_| ()) })
        };
        while accepted.load(std::sync::atomic::Ordering::SeqCst) < 1 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        transport.disconnect().await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let second = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect().await.map(|_| ()) })
        };
        assert!(first.await.unwrap().is_err());
        assert_eq!(transport.status(), ConnectionStatus::Connecting);

        // Still in flight, so this joins the second attempt.
        let third = {
            let transport = transport.clone();
            tokio::spawn(async move { transport.connect().await.map(|_| ()) })
        };
        assert!(second.await.unwrap().is_err());
        assert!(third.await.unwrap().is_err());
        assert_eq!(accepted.load(std::sync::atomic::Ordering::SeqCst), 2);
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_disconnect_is_idempotent() {
        let transport = SshTransport::new(spec_for(closed_port().await));
        transport.disconnect().await;
        transport.disconnect().await;
        assert_eq!(transport.status(), ConnectionStatus::Disconnected);
    }
}
