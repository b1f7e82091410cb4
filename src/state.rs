//! Connection lifecycle states and the atomic cell holding them.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};

/// Lifecycle stage of a physical connection.
///
/// Discriminants follow the establish sequence so that ordered comparisons
/// ("at least BOLT_HANDSHAKEN") are meaningful. The `Async*` states mirror
/// their synchronous counterparts purely so a log line or debugger shows
/// which surface drove the connection there; both surfaces obey the same
/// transition graph. `Defunct` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Fresh = 0,
    TcpConnecting,
    AsyncTcpConnecting,
    TcpConnected,
    SslContextSetup,
    SslHandshaking,
    AsyncSslHandshaking,
    SslHandshaken,
    BoltHandshaking,
    AsyncBoltHandshaking,
    BoltHandshaken,
    AsyncBoltHandshaken,
    HelloAuthSent,
    AsyncHelloAuthSent,
    Ready,
    AsyncReady,
    Streaming,
    AsyncStreaming,
    AwaitingSummary,
    AsyncAwaitingSummary,
    FailedServerReported,
    Defunct,
}

impl ConnectionState {
    pub fn is_ready(self) -> bool {
        matches!(self, ConnectionState::Ready | ConnectionState::AsyncReady)
    }

    /// States in which the Bolt protocol layer has been negotiated, which
    /// is the precondition for a best-effort GOODBYE during terminate.
    pub fn bolt_negotiated(self) -> bool {
        self >= ConnectionState::BoltHandshaken && self != ConnectionState::Defunct
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Fresh,
            1 => ConnectionState::TcpConnecting,
            2 => ConnectionState::AsyncTcpConnecting,
            3 => ConnectionState::TcpConnected,
            4 => ConnectionState::SslContextSetup,
            5 => ConnectionState::SslHandshaking,
            6 => ConnectionState::AsyncSslHandshaking,
            7 => ConnectionState::SslHandshaken,
            8 => ConnectionState::BoltHandshaking,
            9 => ConnectionState::AsyncBoltHandshaking,
            10 => ConnectionState::BoltHandshaken,
            11 => ConnectionState::AsyncBoltHandshaken,
            12 => ConnectionState::HelloAuthSent,
            13 => ConnectionState::AsyncHelloAuthSent,
            14 => ConnectionState::Ready,
            15 => ConnectionState::AsyncReady,
            16 => ConnectionState::Streaming,
            17 => ConnectionState::AsyncStreaming,
            18 => ConnectionState::AwaitingSummary,
            19 => ConnectionState::AsyncAwaitingSummary,
            20 => ConnectionState::FailedServerReported,
            // Only values written by this module exist in the cell; treat
            // anything else as the terminal state.
            _ => ConnectionState::Defunct,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Fresh => "FRESH",
            ConnectionState::TcpConnecting => "TCP_CONNECTING",
            ConnectionState::AsyncTcpConnecting => "ASYNC_TCP_CONNECTING",
            ConnectionState::TcpConnected => "TCP_CONNECTED",
            ConnectionState::SslContextSetup => "SSL_CONTEXT_SETUP",
            ConnectionState::SslHandshaking => "SSL_HANDSHAKING",
            ConnectionState::AsyncSslHandshaking => "ASYNC_SSL_HANDSHAKING",
            ConnectionState::SslHandshaken => "SSL_HANDSHAKEN",
            ConnectionState::BoltHandshaking => "BOLT_HANDSHAKING",
            ConnectionState::AsyncBoltHandshaking => "ASYNC_BOLT_HANDSHAKING",
            ConnectionState::BoltHandshaken => "BOLT_HANDSHAKEN",
            ConnectionState::AsyncBoltHandshaken => "ASYNC_BOLT_HANDSHAKEN",
            ConnectionState::HelloAuthSent => "HELLO_AUTH_SENT",
            ConnectionState::AsyncHelloAuthSent => "ASYNC_HELLO_AUTH_SENT",
            ConnectionState::Ready => "READY",
            ConnectionState::AsyncReady => "ASYNC_READY",
            ConnectionState::Streaming => "STREAMING",
            ConnectionState::AsyncStreaming => "ASYNC_STREAMING",
            ConnectionState::AwaitingSummary => "AWAITING_SUMMARY",
            ConnectionState::AsyncAwaitingSummary => "ASYNC_AWAITING_SUMMARY",
            ConnectionState::FailedServerReported => "FAILED_SERVER_REPORTED",
            ConnectionState::Defunct => "DEFUNCT",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Atomic holder for the state machine word.
///
/// Compare-exchange is used for the transitions that must be observed
/// atomically (FRESH to a connecting state, anything to DEFUNCT); all other
/// transitions happen while the owner holds `&mut` on the connection and
/// are plain stores.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(state: ConnectionState) -> Self {
        StateCell(AtomicU8::new(state as u8))
    }

    pub fn load(&self) -> ConnectionState {
        ConnectionState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub fn store(&self, state: ConnectionState) {
        self.0.store(state as u8, Ordering::Release);
    }

    pub fn compare_exchange(
        &self,
        current: ConnectionState,
        new: ConnectionState,
    ) -> Result<ConnectionState, ConnectionState> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(ConnectionState::from_u8)
            .map_err(ConnectionState::from_u8)
    }

    pub fn swap(&self, state: ConnectionState) -> ConnectionState {
        ConnectionState::from_u8(self.0.swap(state as u8, Ordering::AcqRel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_follows_the_lifecycle() {
        assert!(ConnectionState::Fresh < ConnectionState::TcpConnected);
        assert!(ConnectionState::BoltHandshaken < ConnectionState::Ready);
        assert!(ConnectionState::Ready < ConnectionState::Defunct);
        assert!(ConnectionState::Ready.bolt_negotiated());
        assert!(ConnectionState::FailedServerReported.bolt_negotiated());
        assert!(!ConnectionState::TcpConnected.bolt_negotiated());
        assert!(!ConnectionState::Defunct.bolt_negotiated());
    }

    #[test]
    fn cell_cas_and_swap() {
        let cell = StateCell::new(ConnectionState::Fresh);
        assert!(
            cell.compare_exchange(ConnectionState::Fresh, ConnectionState::TcpConnecting)
                .is_ok()
        );
        assert_eq!(
            cell.compare_exchange(ConnectionState::Fresh, ConnectionState::TcpConnecting),
            Err(ConnectionState::TcpConnecting)
        );
        assert_eq!(
            cell.swap(ConnectionState::Defunct),
            ConnectionState::TcpConnecting
        );
        assert_eq!(cell.load(), ConnectionState::Defunct);
    }

    #[test]
    fn every_discriminant_round_trips() {
        for value in 0..=21u8 {
            let state = ConnectionState::from_u8(value);
            assert_eq!(state as u8, value);
            assert!(!state.as_str().is_empty());
        }
    }
}
