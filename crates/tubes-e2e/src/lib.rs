//! End-to-end test utilities for tubes
//!
//! Runs a real SSH server in-process so endpoints, tunnels and proxies can
//! be exercised without any external host.

pub mod origin;
pub mod ssh_server;

pub use origin::{MockOrigin, OriginMode};
pub use ssh_server::{fixture, TestSshServer, HOST_FINGERPRINT, TEST_PASSWORD, TEST_USER};

/// Route test logs through the test writer; safe to call from every test
pub fn init_test() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tubes_core=debug,tubes_e2e=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

/// Read until the peer closes or `timeout` passes, returning what arrived
pub async fn read_to_end_with_timeout<R>(stream: &mut R, timeout: std::time::Duration) -> Vec<u8>
where
    R: tokio::io::AsyncRead + Unpin,
{
    use tokio::io::AsyncReadExt;

    let mut data = Vec::new();
    let _ = tokio::time::timeout(timeout, stream.read_to_end(&mut data)).await;
    data
}
