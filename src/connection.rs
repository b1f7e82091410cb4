//! Blocking physical connection.
//!
//! Owns the socket (or TLS stream), drives the lifecycle state machine from
//! FRESH through establish to READY, and exchanges chunked messages in
//! strict request/response order. One caller owns a connection at a time;
//! the only cross-thread-visible field is the atomic state word.

use crate::chunking;
use crate::config::{AuthToken, ConnectionConfig};
use crate::errors::BoltError;
use crate::handshake;
use crate::lifecycle::{self, ServerResponse};
use crate::messages::{self, MessageTag, Metadata};
use crate::state::{ConnectionState, StateCell};
use crate::stream::Transport;
use crate::tls;
use crate::version::{V3_0, Version};
use crate::wire;
use std::time::Instant;
use tracing::{debug, error, info, trace, warn};

/// A synchronous Bolt connection.
pub struct Connection {
    id: u64,
    config: ConnectionConfig,
    state: StateCell,
    transport: Option<Transport>,
    negotiated_version: Version,
    server_agent: String,
    server_connection_id: String,
    utc_patch_active: bool,
    last_error: Option<BoltError>,
    created_at: Instant,
    last_used_at: Instant,
}

impl Connection {
    pub fn new(config: ConnectionConfig) -> Self {
        let id = lifecycle::next_connection_id();
        let now = Instant::now();
        debug!(
            "[conn {id}] created for {}:{} (encryption: {:?})",
            config.host, config.port, config.encryption
        );
        Connection {
            id,
            config,
            state: StateCell::new(ConnectionState::Fresh),
            transport: None,
            negotiated_version: Version::ZERO,
            server_agent: String::new(),
            server_connection_id: String::new(),
            utc_patch_active: false,
            last_error: None,
            created_at: now,
            last_used_at: now,
        }
    }

    // -- Introspection -----------------------------------------------------

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn state(&self) -> ConnectionState {
        self.state.load()
    }

    pub fn config(&self) -> &ConnectionConfig {
        &self.config
    }

    pub fn is_ready(&self) -> bool {
        self.state.load().is_ready() && self.transport.is_some()
    }

    pub fn is_defunct(&self) -> bool {
        let state = self.state.load();
        state == ConnectionState::Defunct
            || (state > ConnectionState::Fresh && self.transport.is_none())
    }

    pub fn is_encrypted(&self) -> bool {
        self.transport.as_ref().is_some_and(Transport::is_encrypted)
    }

    pub fn last_error(&self) -> Option<&BoltError> {
        self.last_error.as_ref()
    }

    pub fn negotiated_version(&self) -> Version {
        self.negotiated_version
    }

    pub fn server_agent(&self) -> &str {
        &self.server_agent
    }

    pub fn server_connection_id(&self) -> &str {
        &self.server_connection_id
    }

    pub fn utc_patch_active(&self) -> bool {
        self.utc_patch_active
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    pub fn last_used_at(&self) -> Instant {
        self.last_used_at
    }

    fn mark_used(&mut self) {
        self.last_used_at = Instant::now();
    }

    // -- Lifecycle ---------------------------------------------------------

    /// Drives the connection from FRESH to READY: TCP connect, optional TLS,
    /// version negotiation, HELLO and (Bolt >= 5.1) LOGON. Any failure
    /// leaves the connection DEFUNCT with the error stored.
    pub fn establish(&mut self) -> Result<(), BoltError> {
        if let Err(actual) = self
            .state
            .compare_exchange(ConnectionState::Fresh, ConnectionState::TcpConnecting)
        {
            if actual.is_ready() {
                debug!("[conn {}] establish called but connection is already READY", self.id);
                return Ok(());
            }
            if actual == ConnectionState::Defunct {
                return Err(self.stored_error());
            }
            return Err(BoltError::UnknownError(format!(
                "establish called in invalid state {actual}; expected FRESH"
            )));
        }

        info!(
            "[conn {}] establishing connection to {}:{}",
            self.id, self.config.host, self.config.port
        );

        if let Err(e) = self.stage_connect_transport() {
            return Err(self.fail(e));
        }
        if let Err(e) = self.stage_bolt_handshake() {
            return Err(self.fail(e));
        }
        if let Err(e) = self.stage_hello_and_auth() {
            return Err(self.fail(e));
        }

        if !self.state.load().is_ready() {
            let error = self.last_error.clone().unwrap_or_else(|| {
                BoltError::UnknownError(
                    "connection did not reach READY after the establish sequence".into(),
                )
            });
            return Err(self.fail(error));
        }

        self.mark_used();
        self.last_error = None;
        info!(
            "[conn {}] ready; Bolt {} server {:?}",
            self.id, self.negotiated_version, self.server_agent
        );
        Ok(())
    }

    /// Tears the connection down. With `send_goodbye`, a best-effort
    /// GOODBYE is written first when the protocol layer ever came up; no
    /// response is expected. Always ends DEFUNCT with resources released.
    pub fn terminate(&mut self, send_goodbye: bool) {
        let previous = self.state.swap(ConnectionState::Defunct);
        debug!(
            "[conn {}] terminating (previous state {previous}, goodbye: {send_goodbye})",
            self.id
        );
        if previous != ConnectionState::Defunct
            && send_goodbye
            && previous.bolt_negotiated()
            && self.negotiated_version >= V3_0
            && self.transport.is_some()
        {
            match messages::serialize_goodbye() {
                Ok(payload) => {
                    let encoded = chunking::encode_chunks(&payload);
                    let timeout = self.config.write_timeout;
                    if let Some(transport) = self.transport.as_mut() {
                        match transport.write_all(&encoded, timeout) {
                            Ok(()) => trace!("[conn {}] GOODBYE sent", self.id),
                            Err(e) => warn!("[conn {}] sending GOODBYE failed: {e}", self.id),
                        }
                    }
                }
                Err(e) => warn!("[conn {}] GOODBYE serialization failed: {e}", self.id),
            }
        }
        self.release_transport();
        self.negotiated_version = Version::ZERO;
        self.server_agent.clear();
        self.server_connection_id.clear();
        self.utc_patch_active = false;
    }

    /// RESET as a liveness probe: SUCCESS restores READY (also from
    /// FAILED_SERVER_REPORTED); anything else is fatal.
    pub fn reset(&mut self) -> Result<(), BoltError> {
        let state = self.state.load();
        if !state.is_ready() && state != ConnectionState::FailedServerReported {
            if state == ConnectionState::Defunct {
                return Err(self.stored_error());
            }
            return Err(BoltError::UnknownError(format!(
                "reset called in invalid state {state}"
            )));
        }
        self.mark_used();

        let payload = match messages::serialize_reset() {
            Ok(payload) => payload,
            Err(e) => return Err(self.fail(e)),
        };
        self.send_chunked(&payload)?;
        self.state.store(ConnectionState::AwaitingSummary);
        let response = self.receive_message()?;
        match lifecycle::interpret_summary(&response) {
            ServerResponse::Success(_) => {
                self.state.store(ConnectionState::Ready);
                self.last_error = None;
                debug!("[conn {}] RESET successful, connection READY", self.id);
                Ok(())
            }
            ServerResponse::Failure { error, .. } => Err(self.fail(error)),
            ServerResponse::Malformed(error) => Err(self.fail(error)),
        }
    }

    /// Liveness check; a RESET round-trip under the hood.
    pub fn ping(&mut self) -> Result<(), BoltError> {
        debug!("[conn {}] pinging (via RESET)", self.id);
        self.reset()
    }

    // -- Messaging ---------------------------------------------------------

    /// Sends one request and reads exactly one summary, skipping NOOPs.
    /// SUCCESS returns its metadata and leaves the connection READY;
    /// FAILURE/IGNORED are classified; any other tag is fatal.
    pub fn send_request_receive_summary(
        &mut self,
        request: &[u8],
    ) -> Result<Metadata, BoltError> {
        self.check_request_state()?;
        self.exchange_summary(request)
    }

    /// Sends one request and reads messages until the summary, handing each
    /// RECORD payload to `record_handler` in server order, at most once.
    /// A handler error propagates immediately.
    pub fn send_request_receive_stream<F>(
        &mut self,
        request: &[u8],
        mut record_handler: F,
    ) -> Result<Metadata, BoltError>
    where
        F: FnMut(&[u8]) -> Result<(), BoltError>,
    {
        self.check_request_state()?;
        self.mark_used();
        self.send_chunked(request)?;
        self.state.store(ConnectionState::Streaming);
        loop {
            let response = self.receive_message()?;
            let tag = match messages::peek_tag(&response) {
                Ok(tag) => tag,
                Err(e) => return Err(self.fail(e)),
            };
            if MessageTag::from_u8(tag) == Some(MessageTag::Record) {
                record_handler(&response)?;
                continue;
            }
            return self.finish_summary(response);
        }
    }

    /// Re-authenticates with LOGON (Bolt >= 5.1 only).
    pub fn perform_logon(&mut self, auth: &AuthToken) -> Result<(), BoltError> {
        if !self.negotiated_version.supports_logon() {
            return Err(BoltError::UnsupportedProtocolVersion(format!(
                "LOGON requires Bolt >= 5.1, negotiated {}",
                self.negotiated_version
            )));
        }
        let payload = messages::serialize_logon(&auth.token_map())?;
        let meta = self.send_request_receive_summary(&payload)?;
        if let Some(id) = lifecycle::logon_connection_id(&meta) {
            if id != self.server_connection_id {
                debug!(
                    "[conn {}] connection id changed by LOGON: {:?} -> {id:?}",
                    self.id, self.server_connection_id
                );
            }
            self.server_connection_id = id;
        }
        Ok(())
    }

    /// Drops the session's authentication (Bolt >= 5.1 only). The server
    /// expects a new LOGON before further work.
    pub fn perform_logoff(&mut self) -> Result<(), BoltError> {
        if !self.negotiated_version.supports_logon() {
            return Err(BoltError::UnsupportedProtocolVersion(format!(
                "LOGOFF requires Bolt >= 5.1, negotiated {}",
                self.negotiated_version
            )));
        }
        if !self.is_ready() {
            return Err(self.stored_error());
        }
        let payload = messages::serialize_logoff()?;
        self.send_request_receive_summary(&payload)?;
        Ok(())
    }

    // -- Establish stages --------------------------------------------------

    fn stage_connect_transport(&mut self) -> Result<(), BoltError> {
        debug!(
            "[conn {}] TCP connecting to {}:{} (timeout {:?})",
            self.id, self.config.host, self.config.port, self.config.tcp_connect_timeout
        );
        let tcp = Transport::connect_tcp(&self.config)?;
        self.state.store(ConnectionState::TcpConnected);
        debug!("[conn {}] TCP connected", self.id);

        let transport = if self.config.encryption_enabled() {
            self.state.store(ConnectionState::SslContextSetup);
            let tls_config = tls::build_client_config(&self.config)?;
            self.state.store(ConnectionState::SslHandshaking);
            debug!("[conn {}] performing TLS handshake with {}", self.id, self.config.host);
            let transport = Transport::tls_handshake(tcp, tls_config, &self.config)?;
            self.state.store(ConnectionState::SslHandshaken);
            debug!("[conn {}] TLS handshake complete", self.id);
            transport
        } else {
            Transport::Plain(tcp)
        };
        self.transport = Some(transport);
        Ok(())
    }

    fn stage_bolt_handshake(&mut self) -> Result<(), BoltError> {
        self.state.store(ConnectionState::BoltHandshaking);
        let request = handshake::build_handshake_request(&self.config.proposed_versions)?;
        trace!("[conn {}] handshake request: {}", self.id, hex::encode(request));

        let timeout = self.config.bolt_handshake_timeout;
        self.send_bytes(&request, timeout)?;
        let mut reply = [0u8; handshake::HANDSHAKE_RESPONSE_LEN];
        self.recv_bytes(&mut reply, timeout)?;
        trace!("[conn {}] handshake reply: {}", self.id, hex::encode(reply));

        let version =
            handshake::negotiated_version_from_response(reply, &self.config.proposed_versions)?;
        self.negotiated_version = version;
        self.state.store(ConnectionState::BoltHandshaken);
        debug!("[conn {}] negotiated Bolt {version}", self.id);
        Ok(())
    }

    fn stage_hello_and_auth(&mut self) -> Result<(), BoltError> {
        let params = lifecycle::build_hello_params(&self.config, self.negotiated_version);
        let payload = messages::serialize_hello(&params, self.negotiated_version)?;
        self.state.store(ConnectionState::HelloAuthSent);
        debug!("[conn {}] sending HELLO", self.id);
        let meta = self.exchange_summary(&payload)?;

        let extracted = lifecycle::hello_metadata(&meta, self.negotiated_version);
        self.server_agent = extracted.server_agent;
        self.server_connection_id = extracted.connection_id;
        self.utc_patch_active = extracted.utc_patch_active;
        debug!(
            "[conn {}] HELLO successful; server {:?}, connection id {:?}, utc patch {}",
            self.id, self.server_agent, self.server_connection_id, self.utc_patch_active
        );

        if lifecycle::needs_logon(&self.config, self.negotiated_version) {
            debug!("[conn {}] Bolt >= 5.1, performing separate LOGON", self.id);
            let auth = self.config.auth.clone();
            self.perform_logon(&auth)?;
        }
        Ok(())
    }

    // -- Chunked I/O -------------------------------------------------------

    fn send_chunked(&mut self, payload: &[u8]) -> Result<(), BoltError> {
        let encoded = chunking::encode_chunks(payload);
        let timeout = self.config.write_timeout;
        self.send_bytes(&encoded, timeout)
    }

    /// Reads one chunked message; an empty result is a NOOP.
    fn receive_chunked(&mut self) -> Result<Vec<u8>, BoltError> {
        let timeout = self.config.read_timeout;
        let mut payload = Vec::new();
        loop {
            let mut header = [0u8; chunking::CHUNK_HEADER_SIZE];
            self.recv_bytes(&mut header, timeout)?;
            let header = wire::decode_u16(header);
            match chunking::accept_chunk_header(header, payload.len()) {
                Ok(None) => return Ok(payload),
                Ok(Some(body_len)) => {
                    let start = payload.len();
                    if payload.try_reserve(body_len).is_err() {
                        return Err(self.fail(BoltError::OutOfMemory(format!(
                            "allocating {body_len} bytes for chunk body"
                        ))));
                    }
                    payload.resize(start + body_len, 0);
                    self.recv_bytes(&mut payload[start..], timeout)?;
                }
                Err(e) => return Err(self.fail(e)),
            }
        }
    }

    /// Reads the next real message, looping past NOOP keep-alives.
    fn receive_message(&mut self) -> Result<Vec<u8>, BoltError> {
        loop {
            let payload = self.receive_chunked()?;
            if !payload.is_empty() {
                return Ok(payload);
            }
            trace!("[conn {}] NOOP received while awaiting a message", self.id);
        }
    }

    fn send_bytes(&mut self, data: &[u8], timeout: std::time::Duration) -> Result<(), BoltError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(self.fail(BoltError::NetworkError("no live transport".into())));
        };
        match transport.write_all(data, timeout) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    fn recv_bytes(&mut self, buf: &mut [u8], timeout: std::time::Duration) -> Result<(), BoltError> {
        let Some(transport) = self.transport.as_mut() else {
            return Err(self.fail(BoltError::NetworkError("no live transport".into())));
        };
        match transport.read_exact(buf, timeout) {
            Ok(()) => Ok(()),
            Err(e) => Err(self.fail(e)),
        }
    }

    // -- Response handling -------------------------------------------------

    fn check_request_state(&mut self) -> Result<(), BoltError> {
        let state = self.state.load();
        if state.is_ready() && self.transport.is_some() {
            return Ok(());
        }
        if state == ConnectionState::Fresh {
            return Err(BoltError::UnknownError(
                "request issued before the connection was established".into(),
            ));
        }
        if state == ConnectionState::Defunct || self.transport.is_none() {
            return Err(self.stored_error());
        }
        if state == ConnectionState::FailedServerReported {
            // Recoverable, but only through RESET.
            return Err(self
                .last_error
                .clone()
                .unwrap_or_else(|| {
                    BoltError::UnknownError(
                        "connection has a pending server failure; RESET it first".into(),
                    )
                }));
        }
        // Any other live state means an operation was abandoned midway
        // (or the caller is racing the lifecycle); the wire cannot be
        // resynchronized.
        warn!(
            "[conn {}] request issued in unusable state {state}",
            self.id
        );
        Err(self.fail(BoltError::UnknownError(format!(
            "request issued in unusable state {state}"
        ))))
    }

    /// Sends a request and reads one summary without the READY-state gate;
    /// the establish sequence issues HELLO through this path.
    fn exchange_summary(&mut self, request: &[u8]) -> Result<Metadata, BoltError> {
        self.mark_used();
        self.send_chunked(request)?;
        self.state.store(ConnectionState::AwaitingSummary);
        let response = self.receive_message()?;
        self.finish_summary(response)
    }

    fn finish_summary(&mut self, response: Vec<u8>) -> Result<Metadata, BoltError> {
        match lifecycle::interpret_summary(&response) {
            ServerResponse::Success(meta) => {
                self.state.store(ConnectionState::Ready);
                self.last_error = None;
                Ok(meta)
            }
            ServerResponse::Failure { error, state } => {
                if state == ConnectionState::Defunct {
                    return Err(self.fail(error));
                }
                warn!("[conn {}] server reported failure: {error}", self.id);
                self.state.store(state);
                self.last_error = Some(error.clone());
                Err(error)
            }
            ServerResponse::Malformed(error) => Err(self.fail(error)),
        }
    }

    // -- Failure handling --------------------------------------------------

    /// Marks the connection DEFUNCT, releases the transport and stores the
    /// error. The first error wins when already defunct.
    fn fail(&mut self, error: BoltError) -> BoltError {
        let previous = self.state.swap(ConnectionState::Defunct);
        if previous != ConnectionState::Defunct {
            error!(
                "[conn {}] marked DEFUNCT (was {previous}): {error}",
                self.id
            );
            self.release_transport();
            self.last_error = Some(error.clone());
        } else if self.last_error.is_none() {
            self.last_error = Some(error.clone());
        }
        error
    }

    fn stored_error(&self) -> BoltError {
        self.last_error
            .clone()
            .unwrap_or_else(|| BoltError::NetworkError("connection is defunct".into()))
    }

    fn release_transport(&mut self) {
        if let Some(mut transport) = self.transport.take() {
            transport.shutdown();
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if self.state.load() != ConnectionState::Defunct {
            self.terminate(false);
        }
    }
}
