//! Async stream I/O over plain TCP or TLS, driven by tokio.
//!
//! Mirrors the blocking `Transport` contract: whole-buffer transfers with a
//! per-operation timeout. Each operation races the I/O future against a
//! steady timer via `tokio::time::timeout`; whichever completes first wins
//! and the loser is cancelled, so a completion is never lost.

use crate::config::ConnectionConfig;
use crate::errors::BoltError;
use socket2::SockRef;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_rustls::client::TlsStream;
use tracing::{debug, trace, warn};

/// An established async transport.
pub enum AsyncTransport {
    Plain(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

impl AsyncTransport {
    /// Resolves the target and opens a TCP stream within the connect
    /// timeout.
    pub async fn connect_tcp(config: &ConnectionConfig) -> Result<TcpStream, BoltError> {
        let target = (config.host.clone(), config.port);
        let connect = TcpStream::connect(target);
        let stream = match tokio::time::timeout(config.tcp_connect_timeout, connect).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => {
                return Err(BoltError::NetworkError(format!(
                    "TCP connect to {}:{} failed: {e}",
                    config.host, config.port
                )));
            }
            Err(_elapsed) => {
                return Err(BoltError::NetworkError(format!(
                    "TCP connect to {}:{} timed out after {:?}",
                    config.host, config.port, config.tcp_connect_timeout
                )));
            }
        };
        apply_socket_options(&stream, config);
        Ok(stream)
    }

    /// Runs the TLS handshake over an already-connected socket and wraps it.
    pub async fn tls_handshake(
        tcp: TcpStream,
        tls_config: Arc<rustls::ClientConfig>,
        config: &ConnectionConfig,
    ) -> Result<AsyncTransport, BoltError> {
        let name = crate::tls::server_name(&config.host)?;
        let connector = TlsConnector::from(tls_config);
        match tokio::time::timeout(config.tls_handshake_timeout, connector.connect(name, tcp)).await
        {
            Ok(Ok(stream)) => Ok(AsyncTransport::Tls(Box::new(stream))),
            Ok(Err(e)) => Err(BoltError::HandshakeFailed(format!(
                "TLS handshake with {} failed: {e}",
                config.host
            ))),
            Err(_elapsed) => {
                debug!(
                    "TLS handshake with {} timed out after {:?}",
                    config.host, config.tls_handshake_timeout
                );
                Err(BoltError::HandshakeFailed(format!(
                    "TLS handshake with {} timed out",
                    config.host
                )))
            }
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, AsyncTransport::Tls(_))
    }

    /// Writes the whole buffer or fails; the operation is abandoned if the
    /// timer fires first.
    pub async fn write_all(&mut self, data: &[u8], timeout: Duration) -> Result<(), BoltError> {
        trace!("writing {} bytes", data.len());
        let io = async {
            match self {
                AsyncTransport::Plain(stream) => {
                    stream.write_all(data).await?;
                    stream.flush().await
                }
                AsyncTransport::Tls(stream) => {
                    stream.write_all(data).await?;
                    stream.flush().await
                }
            }
        };
        match tokio::time::timeout(timeout, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(BoltError::from_io("write", &e)),
            Err(_elapsed) => {
                debug!("write of {} bytes timed out after {timeout:?}", data.len());
                Err(BoltError::NetworkError(format!(
                    "write timed out after {timeout:?}"
                )))
            }
        }
    }

    /// Fills the whole buffer or fails; a short read (peer closed early)
    /// is an error.
    pub async fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), BoltError> {
        trace!("reading {} bytes", buf.len());
        let io = async {
            match self {
                AsyncTransport::Plain(stream) => stream.read_exact(buf).await,
                AsyncTransport::Tls(stream) => stream.read_exact(buf).await,
            }
        };
        match tokio::time::timeout(timeout, io).await {
            Ok(Ok(_read)) => Ok(()),
            Ok(Err(e)) => Err(BoltError::from_io("read", &e)),
            Err(_elapsed) => {
                debug!("read of {} bytes timed out after {timeout:?}", buf.len());
                Err(BoltError::NetworkError(format!(
                    "read timed out after {timeout:?}"
                )))
            }
        }
    }

    /// Best-effort close of the underlying socket.
    pub async fn shutdown(&mut self) {
        let _ = match self {
            AsyncTransport::Plain(stream) => stream.shutdown().await,
            AsyncTransport::Tls(stream) => stream.shutdown().await,
        };
    }
}

fn apply_socket_options(stream: &TcpStream, config: &ConnectionConfig) {
    if config.no_delay {
        if let Err(e) = stream.set_nodelay(true) {
            warn!("failed to set TCP_NODELAY: {e}");
        }
    }
    if config.keep_alive {
        if let Err(e) = SockRef::from(stream).set_keepalive(true) {
            warn!("failed to set SO_KEEPALIVE: {e}");
        }
    }
}
