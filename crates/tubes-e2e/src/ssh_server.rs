//! In-process SSH server that accepts `direct-tcpip` channels

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use parking_lot::Mutex;
use russh::keys::PublicKey;
use russh::server::{self, Auth, Msg, Session};
use russh::{Channel, MethodKind, MethodSet};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use tubes_core::{AuthMethod, EndpointSpec, HostKeyPolicy, HostPort, ReconnectPolicy};

pub const TEST_USER: &str = "tester";
pub const TEST_PASSWORD: &str = "secret";

/// Fingerprint of `fixtures/host_ed25519`
pub const HOST_FINGERPRINT: &str = "SHA256:NZIo6yJJMhpTk179LeQrC/CyyUHQV2vIMxd0eN6MiWM";

/// Path of a file under this crate's `fixtures/` directory
pub fn fixture(name: &str) -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("fixtures")
        .join(name)
}

struct ServerState {
    authorized_key: PublicKey,
    connections: AtomicUsize,
    destinations: Mutex<Vec<HostPort>>,
    /// Cancelled by `kick`; each session watches the token current at accept
    generation: Mutex<CancellationToken>,
}

/// SSH server on an ephemeral loopback port.
///
/// Accepts `tester` with password `secret` or the `client_ed25519` fixture
/// key, and opens `direct-tcpip` channels as plain TCP connections.
pub struct TestSshServer {
    addr: SocketAddr,
    state: Arc<ServerState>,
    shutdown: CancellationToken,
}

impl TestSshServer {
    pub async fn start() -> Result<Self> {
        let host_key = russh::keys::load_secret_key(fixture("host_ed25519"), None)?;
        let authorized_key = russh::keys::load_public_key(fixture("client_ed25519.pub"))?;

        let mut config = server::Config {
            auth_rejection_time: Duration::from_millis(50),
            auth_rejection_time_initial: Some(Duration::from_millis(0)),
            nodelay: true,
            ..Default::default()
        };
        config.methods = MethodSet::empty();
        config.methods.push(MethodKind::Password);
        config.methods.push(MethodKind::PublicKey);
        config.keys.push(host_key);
        let config = Arc::new(config);

        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let shutdown = CancellationToken::new();
        let state = Arc::new(ServerState {
            authorized_key,
            connections: AtomicUsize::new(0),
            destinations: Mutex::new(Vec::new()),
            generation: Mutex::new(shutdown.child_token()),
        });

        let accept_state = Arc::clone(&state);
        let stop = shutdown.clone();
        tokio::spawn(async move {
            loop {
                let (stream, peer) = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("SSH accept error: {}", e);
                            break;
                        }
                    },
                };
                accept_state.connections.fetch_add(1, Ordering::SeqCst);
                let handler = SessionHandler {
                    state: Arc::clone(&accept_state),
                };
                let session_stop = accept_state.generation.lock().clone();
                tokio::spawn(run_session(Arc::clone(&config), stream, peer, handler, session_stop));
            }
        });

        tracing::debug!(addr = %addr, "Test SSH server listening");
        Ok(Self {
            addr,
            state,
            shutdown,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// TCP connections accepted so far, authenticated or not
    pub fn connection_count(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Destinations requested through `direct-tcpip`, as sent by the client
    pub fn destinations(&self) -> Vec<HostPort> {
        self.state.destinations.lock().clone()
    }

    /// Drop every live session while continuing to accept new ones
    pub fn kick(&self) {
        let next = self.shutdown.child_token();
        let previous = std::mem::replace(&mut *self.state.generation.lock(), next);
        previous.cancel();
    }

    /// An endpoint pointed at this server, using password auth and a pinned
    /// host-key fingerprint
    pub fn endpoint_spec(&self) -> EndpointSpec {
        let mut spec = EndpointSpec::new(TEST_USER, "127.0.0.1", self.port());
        spec.auth = vec![AuthMethod::Password(TEST_PASSWORD.to_string())];
        spec.host_key = HostKeyPolicy::Fingerprint(HOST_FINGERPRINT.to_string());
        spec.connect_timeout = Duration::from_secs(5);
        spec.reconnect = ReconnectPolicy::once();
        spec
    }
}

impl Drop for TestSshServer {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

async fn run_session(
    config: Arc<server::Config>,
    stream: TcpStream,
    peer: SocketAddr,
    handler: SessionHandler,
    stop: CancellationToken,
) {
    let session = match server::run_stream(config, stream, handler).await {
        Ok(session) => session,
        Err(e) => {
            tracing::debug!(peer = %peer, error = %e, "SSH handshake failed");
            return;
        }
    };
    tokio::select! {
        _ = stop.cancelled() => tracing::debug!(peer = %peer, "SSH session dropped by server"),
        result = session => {
            if let Err(e) = result {
                tracing::debug!(peer = %peer, error = %e, "SSH session ended with error");
            }
        }
    }
}

struct SessionHandler {
    state: Arc<ServerState>,
}

impl server::Handler for SessionHandler {
    type Error = russh::Error;

    async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
        if user == TEST_USER && password == TEST_PASSWORD {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn auth_publickey(
        &mut self,
        user: &str,
        public_key: &PublicKey,
    ) -> Result<Auth, Self::Error> {
        if user == TEST_USER && public_key.key_data() == self.state.authorized_key.key_data() {
            Ok(Auth::Accept)
        } else {
            Ok(Auth::reject())
        }
    }

    async fn channel_open_session(
        &mut self,
        _channel: Channel<Msg>,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        Ok(true)
    }

    async fn channel_open_direct_tcpip(
        &mut self,
        channel: Channel<Msg>,
        host_to_connect: &str,
        port_to_connect: u32,
        _originator_address: &str,
        _originator_port: u32,
        _session: &mut Session,
    ) -> Result<bool, Self::Error> {
        let Ok(port) = u16::try_from(port_to_connect) else {
            return Ok(false);
        };
        self.state
            .destinations
            .lock()
            .push(HostPort::new(host_to_connect, port));

        let mut target = match TcpStream::connect((host_to_connect, port)).await {
            Ok(target) => target,
            Err(e) => {
                tracing::debug!(host = %host_to_connect, port, error = %e, "direct-tcpip connect failed");
                return Ok(false);
            }
        };
        tokio::spawn(async move {
            let mut stream = channel.into_stream();
            let _ = tokio::io::copy_bidirectional(&mut stream, &mut target).await;
        });
        Ok(true)
    }
}
