//! Plain TCP origin server standing behind the SSH host

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

/// What the origin does with each connection
#[derive(Clone, Debug)]
pub enum OriginMode {
    /// Write every byte straight back
    Echo,
    /// Read one chunk, answer with these bytes, close
    Reply(Vec<u8>),
}

impl OriginMode {
    /// A minimal `200 OK` HTTP/1.1 response carrying `body`
    pub fn http_ok(body: &str) -> Self {
        Self::Reply(
            format!(
                "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
                body.len(),
                body
            )
            .into_bytes(),
        )
    }
}

/// Listens on an ephemeral loopback port and records what it was sent
pub struct MockOrigin {
    addr: SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
    cancel: CancellationToken,
}

impl MockOrigin {
    pub async fn echo() -> Result<Self> {
        Self::start(OriginMode::Echo).await
    }

    pub async fn start(mode: OriginMode) -> Result<Self> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let received = Arc::new(Mutex::new(Vec::new()));
        let cancel = CancellationToken::new();

        let log = Arc::clone(&received);
        let stop = cancel.clone();
        tokio::spawn(async move {
            loop {
                let (stream, _) = tokio::select! {
                    _ = stop.cancelled() => break,
                    accepted = listener.accept() => match accepted {
                        Ok(accepted) => accepted,
                        Err(e) => {
                            tracing::error!("Origin accept error: {}", e);
                            break;
                        }
                    },
                };
                let log = Arc::clone(&log);
                let mode = mode.clone();
                tokio::spawn(async move {
                    let data = serve(stream, mode).await;
                    log.lock().push(data);
                });
            }
        });

        Ok(Self {
            addr,
            received,
            cancel,
        })
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    /// Number of connections that have finished
    pub fn connection_count(&self) -> usize {
        self.received.lock().len()
    }

    /// Bytes received per finished connection, in completion order
    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }
}

impl Drop for MockOrigin {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

async fn serve(mut stream: TcpStream, mode: OriginMode) -> Vec<u8> {
    let mut data = Vec::new();
    let mut buf = [0u8; 4096];

    match mode {
        OriginMode::Echo => loop {
            match stream.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => {
                    data.extend_from_slice(&buf[..n]);
                    if stream.write_all(&buf[..n]).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    tracing::debug!("Origin read error: {}", e);
                    break;
                }
            }
        },
        OriginMode::Reply(response) => {
            if let Ok(n) = stream.read(&mut buf).await {
                data.extend_from_slice(&buf[..n]);
            }
            if let Err(e) = stream.write_all(&response).await {
                tracing::debug!("Origin write error: {}", e);
            }
            let _ = stream.shutdown().await;
        }
    }
    data
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_echo_records_bytes() {
        let origin = MockOrigin::echo().await.unwrap();

        let mut stream = TcpStream::connect(origin.addr()).await.unwrap();
        stream.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        drop(stream);
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        assert_eq!(origin.received(), vec![b"hello".to_vec()]);
    }

    #[tokio::test]
    async fn test_http_reply() {
        let origin = MockOrigin::start(OriginMode::http_ok("hi")).await.unwrap();

        let mut stream = TcpStream::connect(origin.addr()).await.unwrap();
        stream.write_all(b"GET / HTTP/1.1\r\n\r\n").await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200 OK"));
        assert!(response.ends_with("\r\n\r\nhi"));
    }
}
