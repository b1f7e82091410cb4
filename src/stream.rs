//! Blocking stream I/O over plain TCP or TLS.
//!
//! One closed variant per transport kind; every operation takes an explicit
//! timeout and either transfers the full requested count or fails. Timeouts
//! are enforced through the socket's read/write timeouts and surface as
//! `NetworkError` like any other I/O fault.

use crate::config::ConnectionConfig;
use crate::errors::BoltError;
use rustls::{ClientConnection, StreamOwned};
use socket2::SockRef;
use std::io::{Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, trace, warn};

/// An established blocking transport.
pub enum Transport {
    Plain(TcpStream),
    Tls(Box<StreamOwned<ClientConnection, TcpStream>>),
}

impl Transport {
    /// Resolves the target and opens a TCP stream within the connect
    /// timeout, trying each resolved address in order.
    pub fn connect_tcp(config: &ConnectionConfig) -> Result<TcpStream, BoltError> {
        let addrs = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| {
                BoltError::NetworkError(format!("DNS resolution failed for {}: {e}", config.host))
            })?;

        let mut last_err = None;
        for addr in addrs {
            trace!("attempting TCP connect to {addr}");
            match TcpStream::connect_timeout(&addr, config.tcp_connect_timeout) {
                Ok(stream) => {
                    apply_socket_options(&stream, config);
                    return Ok(stream);
                }
                Err(e) => last_err = Some(e),
            }
        }
        Err(match last_err {
            Some(e) if BoltError::io_is_timeout(&e) => BoltError::NetworkError(format!(
                "TCP connect to {}:{} timed out after {:?}",
                config.host, config.port, config.tcp_connect_timeout
            )),
            Some(e) => BoltError::NetworkError(format!(
                "TCP connect to {}:{} failed: {e}",
                config.host, config.port
            )),
            None => BoltError::NetworkError(format!(
                "DNS resolution for {} returned no addresses",
                config.host
            )),
        })
    }

    /// Runs the TLS handshake over an already-connected socket and wraps it.
    pub fn tls_handshake(
        tcp: TcpStream,
        tls_config: Arc<rustls::ClientConfig>,
        config: &ConnectionConfig,
    ) -> Result<Transport, BoltError> {
        let name = crate::tls::server_name(&config.host)?;
        let mut conn = ClientConnection::new(tls_config, name)
            .map_err(|e| BoltError::HandshakeFailed(format!("TLS setup failed: {e}")))?;

        set_timeouts(&tcp, config.tls_handshake_timeout)?;
        let mut tcp = tcp;
        while conn.is_handshaking() {
            conn.complete_io(&mut tcp).map_err(|e| {
                if BoltError::io_is_timeout(&e) {
                    debug!(
                        "TLS handshake with {} timed out after {:?}",
                        config.host, config.tls_handshake_timeout
                    );
                    BoltError::HandshakeFailed(format!(
                        "TLS handshake with {} timed out",
                        config.host
                    ))
                } else {
                    BoltError::HandshakeFailed(format!("TLS handshake with {} failed: {e}", config.host))
                }
            })?;
        }
        Ok(Transport::Tls(Box::new(StreamOwned::new(conn, tcp))))
    }

    fn tcp(&self) -> &TcpStream {
        match self {
            Transport::Plain(stream) => stream,
            Transport::Tls(stream) => &stream.sock,
        }
    }

    pub fn is_encrypted(&self) -> bool {
        matches!(self, Transport::Tls(_))
    }

    /// Writes the whole buffer or fails; a partial transfer is an error.
    pub fn write_all(&mut self, data: &[u8], timeout: Duration) -> Result<(), BoltError> {
        set_write_timeout(self.tcp(), timeout)?;
        trace!("writing {} bytes", data.len());
        let result = match self {
            Transport::Plain(stream) => stream.write_all(data).and_then(|_| stream.flush()),
            Transport::Tls(stream) => stream.write_all(data).and_then(|_| stream.flush()),
        };
        result.map_err(|e| {
            if BoltError::io_is_timeout(&e) {
                debug!("write of {} bytes timed out after {timeout:?}", data.len());
                BoltError::NetworkError(format!("write timed out after {timeout:?}"))
            } else {
                BoltError::from_io("write", &e)
            }
        })
    }

    /// Fills the whole buffer or fails; a short read is an error.
    pub fn read_exact(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(), BoltError> {
        set_read_timeout(self.tcp(), timeout)?;
        trace!("reading {} bytes", buf.len());
        let result = match self {
            Transport::Plain(stream) => stream.read_exact(buf),
            Transport::Tls(stream) => stream.read_exact(buf),
        };
        result.map_err(|e| {
            if BoltError::io_is_timeout(&e) {
                debug!("read of {} bytes timed out after {timeout:?}", buf.len());
                BoltError::NetworkError(format!("read timed out after {timeout:?}"))
            } else {
                BoltError::from_io("read", &e)
            }
        })
    }

    /// Best-effort close of the underlying socket.
    pub fn shutdown(&mut self) {
        if let Transport::Tls(stream) = self {
            stream.conn.send_close_notify();
            let _ = stream.flush();
        }
        let _ = self.tcp().shutdown(Shutdown::Both);
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

fn set_timeouts(stream: &TcpStream, timeout: Duration) -> Result<(), BoltError> {
    set_read_timeout(stream, timeout)?;
    set_write_timeout(stream, timeout)
}

fn set_read_timeout(stream: &TcpStream, timeout: Duration) -> Result<(), BoltError> {
    stream
        .set_read_timeout(non_zero(timeout))
        .map_err(|e| BoltError::from_io("set read timeout", &e))
}

fn set_write_timeout(stream: &TcpStream, timeout: Duration) -> Result<(), BoltError> {
    stream
        .set_write_timeout(non_zero(timeout))
        .map_err(|e| BoltError::from_io("set write timeout", &e))
}

/// A zero `Duration` would disable the socket timeout entirely, which is
/// also what `None` means; normalize to avoid the `set_*_timeout` error.
fn non_zero(timeout: Duration) -> Option<Duration> {
    (!timeout.is_zero()).then_some(timeout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn read_exact_times_out_against_a_silent_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            // Accept and hold the socket open without writing anything.
            let (stream, _) = listener.accept().unwrap();
            std::thread::sleep(Duration::from_millis(300));
            drop(stream);
        });

        let mut transport = Transport::Plain(TcpStream::connect(addr).unwrap());
        let mut buf = [0u8; 10];
        let start = Instant::now();
        let err = transport
            .read_exact(&mut buf, Duration::from_millis(50))
            .unwrap_err();
        let elapsed = start.elapsed();
        assert!(matches!(err, BoltError::NetworkError(_)), "{err:?}");
        assert!(
            elapsed >= Duration::from_millis(45) && elapsed < Duration::from_millis(200),
            "timeout fired after {elapsed:?}"
        );
        handle.join().unwrap();
    }

    #[test]
    fn short_read_is_a_network_error() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            stream.write_all(&[0x01, 0x02]).unwrap();
            // Close with the reader still expecting more.
        });

        let mut transport = Transport::Plain(TcpStream::connect(addr).unwrap());
        let mut buf = [0u8; 8];
        let err = transport
            .read_exact(&mut buf, Duration::from_millis(500))
            .unwrap_err();
        assert!(matches!(err, BoltError::NetworkError(_)));
        handle.join().unwrap();
    }

    #[test]
    fn write_then_read_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = std::thread::spawn(move || {
            let (mut stream, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).unwrap();
            stream.write_all(&buf).unwrap();
        });

        let mut transport = Transport::Plain(TcpStream::connect(addr).unwrap());
        transport
            .write_all(&[0xDE, 0xAD, 0xBE, 0xEF], Duration::from_millis(500))
            .unwrap();
        let mut buf = [0u8; 4];
        transport
            .read_exact(&mut buf, Duration::from_millis(500))
            .unwrap();
        assert_eq!(buf, [0xDE, 0xAD, 0xBE, 0xEF]);
        handle.join().unwrap();
    }
}
