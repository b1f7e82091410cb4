//! Client-side transport for the Bolt graph-database wire protocol.
//!
//! Two execution surfaces share one protocol core: [`Connection`] blocks on
//! std networking, [`AsyncConnection`] runs on tokio. Both drive a socket
//! from FRESH through TCP connect, optional TLS, version negotiation and
//! authentication into the READY request/response loop, over plaintext TCP
//! or rustls-backed TLS.
//!
//! Pooling, routing, sessions and result streaming ergonomics are the
//! business of higher layers; they consume this crate through
//! [`ConnectionConfig`] and the connection types.

pub mod async_connection;
pub mod async_stream;
pub mod chunking;
pub mod config;
pub mod connection;
pub mod errors;
pub mod handshake;
pub mod lifecycle;
pub mod messages;
pub mod packstream;
pub mod state;
pub mod stream;
pub mod tls;
pub mod version;
pub mod wire;

// Re-exports
pub use async_connection::AsyncConnection;
pub use async_stream::AsyncTransport;
pub use chunking::{
    CHUNK_HEADER_SIZE, MAX_CHUNK_PAYLOAD, MAX_MESSAGE_SIZE, decode_chunks, encode_chunks,
};
pub use config::{AuthToken, ConnectionConfig, DEFAULT_USER_AGENT, EncryptionStrategy};
pub use connection::Connection;
pub use errors::BoltError;
pub use handshake::{
    BOLT_MAGIC, HANDSHAKE_REQUEST_LEN, HANDSHAKE_RESPONSE_LEN, build_handshake_request,
    parse_handshake_response,
};
pub use messages::{
    BoltAgent, MessageTag, Metadata, deserialize_failure, deserialize_success, peek_tag,
    serialize_goodbye, serialize_hello, serialize_logoff, serialize_logon, serialize_reset,
};
pub use packstream::Value;
pub use state::ConnectionState;
pub use stream::Transport;
pub use version::{DEFAULT_PROPOSED_VERSIONS, Version};
