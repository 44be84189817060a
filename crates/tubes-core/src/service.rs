//! Enable/disable contract shared by every listener-backed service, and the
//! listener state machine that implements it.
//!
//! A service is `Disabled` or `Enabled`; while enabled it owns at most one
//! bound listener and one accept-loop task. Transitions are serialised by an
//! async mutex, so `disable` returns only after the listener is closed and a
//! concurrent `enable` cannot leave a second listener behind.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, TubesError};
use crate::stream::HostPort;

/// A local service that can be switched on and off at runtime
#[async_trait]
pub trait ToggleableService: Send + Sync {
    fn name(&self) -> &str;

    fn is_enabled(&self) -> bool;

    /// Address the listener is bound to while listening
    fn local_addr(&self) -> Option<SocketAddr>;

    /// Clear the disabled flag and start listening in the background
    async fn enable(&self) -> Result<()>;

    /// Set the disabled flag and stop the listener. Connections already
    /// relaying are left alone.
    async fn disable(&self);

    /// Listen (binding first if needed) until the listener is closed.
    ///
    /// Fails with `ServiceDisabled` when the service is switched off, and
    /// with `Listener` on a bind or accept error.
    async fn listen(&self) -> Result<()>;

    /// Stop listening regardless of the flag
    async fn close(&self);
}

/// Per-connection behaviour plugged into a [`ListenerControl`]
#[async_trait]
pub(crate) trait ConnectionHandler: Send + Sync + 'static {
    async fn handle(&self, stream: TcpStream, peer: SocketAddr);
}

struct Running {
    addr: SocketAddr,
    cancel: CancellationToken,
    stopped: CancellationToken,
    failure: Arc<Mutex<Option<TubesError>>>,
}

#[derive(Default)]
struct Slot {
    running: Option<Running>,
    /// Port picked by the OS on the first bind when the configured port is 0
    remembered_port: Option<u16>,
}

pub(crate) struct ListenerControl {
    name: String,
    bind: String,
    port: u16,
    handler: Arc<dyn ConnectionHandler>,
    enabled: AtomicBool,
    slot: tokio::sync::Mutex<Slot>,
    /// Bound address and the accept loop's `stopped` token, readable
    /// without the async slot lock
    local: Mutex<Option<(SocketAddr, CancellationToken)>>,
}

impl ListenerControl {
    pub fn new(
        name: impl Into<String>,
        bind: impl Into<String>,
        port: u16,
        enabled: bool,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        Self {
            name: name.into(),
            bind: bind.into(),
            port,
            handler,
            enabled: AtomicBool::new(enabled),
            slot: tokio::sync::Mutex::new(Slot::default()),
            local: Mutex::new(None),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst)
    }

    /// `None` once the accept loop has ended, even if it ended on its own
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local
            .lock()
            .as_ref()
            .filter(|(_, stopped)| !stopped.is_cancelled())
            .map(|(addr, _)| *addr)
    }

    /// Bind and spawn the accept loop unless one is already running
    pub async fn start(&self) -> Result<SocketAddr> {
        let mut slot = self.slot.lock().await;
        if !self.is_enabled() {
            return Err(TubesError::disabled(&self.name));
        }
        if let Some(running) = &slot.running {
            if !running.stopped.is_cancelled() {
                return Ok(running.addr);
            }
        }

        let port = match (self.port, slot.remembered_port) {
            (0, Some(remembered)) => remembered,
            (port, _) => port,
        };
        let requested = HostPort::new(&self.bind, port).to_string();
        let listener = TcpListener::bind(requested.as_str())
            .await
            .map_err(|e| TubesError::listener(&requested, e))?;
        let addr = listener
            .local_addr()
            .map_err(|e| TubesError::listener(&requested, e))?;
        if self.port == 0 {
            slot.remembered_port = Some(addr.port());
        }

        let running = Running {
            addr,
            cancel: CancellationToken::new(),
            stopped: CancellationToken::new(),
            failure: Arc::new(Mutex::new(None)),
        };
        tokio::spawn(accept_loop(
            listener,
            self.name.clone(),
            Arc::clone(&self.handler),
            running.cancel.clone(),
            running.stopped.clone(),
            Arc::clone(&running.failure),
        ));
        tracing::info!(service = %self.name, local = %addr, "Listening");

        *self.local.lock() = Some((addr, running.stopped.clone()));
        slot.running = Some(running);
        Ok(addr)
    }

    pub async fn listen(&self) -> Result<()> {
        self.start().await?;
        let (stopped, failure) = {
            let slot = self.slot.lock().await;
            match &slot.running {
                Some(running) => (running.stopped.clone(), Arc::clone(&running.failure)),
                None => return Ok(()),
            }
        };
        stopped.cancelled().await;
        let failure = failure.lock().take();
        match failure {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    pub async fn enable(&self) -> Result<()> {
        self.enabled.store(true, Ordering::SeqCst);
        tracing::debug!(service = %self.name, "Enabled");
        self.start().await.map(|_| ())
    }

    pub async fn disable(&self) {
        self.enabled.store(false, Ordering::SeqCst);
        tracing::debug!(service = %self.name, "Disabled");
        self.stop().await;
    }

    pub async fn close(&self) {
        tracing::warn!(service = %self.name, "Closing");
        self.stop().await;
        tracing::info!(service = %self.name, "Closed");
    }

    async fn stop(&self) {
        let mut slot = self.slot.lock().await;
        if let Some(running) = slot.running.take() {
            running.cancel.cancel();
            running.stopped.cancelled().await;
        }
        *self.local.lock() = None;
    }
}

async fn accept_loop(
    listener: TcpListener,
    name: String,
    handler: Arc<dyn ConnectionHandler>,
    cancel: CancellationToken,
    stopped: CancellationToken,
    failure: Arc<Mutex<Option<TubesError>>>,
) {
    let addr = listener
        .local_addr()
        .map(|a| a.to_string())
        .unwrap_or_default();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::debug!(service = %name, peer = %peer, "Accepted connection");
                    let handler = Arc::clone(&handler);
                    tokio::spawn(async move {
                        handler.handle(stream, peer).await;
                    });
                }
                Err(e) => {
                    tracing::error!(service = %name, local = %addr, error = %e, "Accept failed, listener stopped");
                    *failure.lock() = Some(TubesError::listener(&addr, e));
                    break;
                }
            }
        }
    }

    drop(listener);
    stopped.cancel();
}
