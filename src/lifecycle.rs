//! Protocol logic shared by the blocking and async connection surfaces:
//! HELLO assembly, metadata capture, server-failure classification and the
//! summary-response dispatch. Everything here is pure so both surfaces stay
//! byte-for-byte identical in behavior.

use crate::config::ConnectionConfig;
use crate::errors::BoltError;
use crate::messages::{self, HelloParams, MessageTag, Metadata};
use crate::packstream::Value;
use crate::state::ConnectionState;
use crate::version::{V4_3, V4_4, V5_0, Version};
use std::sync::atomic::{AtomicU64, Ordering};

/// Process-wide connection id source; uniqueness for logging is its only
/// contract.
static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_connection_id() -> u64 {
    NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed)
}

/// Assembles the HELLO for the negotiated version: embedded auth below 5.1,
/// the utc patch offer on 4.3/4.4, routing context and agent strings from
/// the config.
pub(crate) fn build_hello_params(config: &ConnectionConfig, version: Version) -> HelloParams {
    HelloParams {
        user_agent: config.user_agent.clone(),
        bolt_agent: config.bolt_agent.clone(),
        routing_context: config.routing_context.clone(),
        patch_bolt: if version.wants_utc_patch_offer() {
            vec!["utc".into()]
        } else {
            Vec::new()
        },
        auth_tokens: if version.supports_logon() {
            Metadata::new()
        } else {
            config.auth.token_map()
        },
    }
}

/// A separate LOGON is sent when the protocol decouples auth from HELLO
/// and there are credentials to present.
pub(crate) fn needs_logon(config: &ConnectionConfig, version: Version) -> bool {
    version.supports_logon() && !config.auth.is_none()
}

/// Connection metadata extracted from a HELLO SUCCESS.
#[derive(Debug, Default, PartialEq)]
pub(crate) struct HelloMetadata {
    pub server_agent: String,
    pub connection_id: String,
    pub utc_patch_active: bool,
}

pub(crate) fn hello_metadata(meta: &Metadata, version: Version) -> HelloMetadata {
    let server_agent = meta
        .get("server")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();
    let connection_id = meta
        .get("connection_id")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_owned();

    // 4.3/4.4: active only when the server echoes the offer back.
    // 5.0 and later: unconditionally on.
    let mut utc_patch_active = false;
    if version == V4_3 || version == V4_4 {
        if let Some(patches) = meta.get("patch_bolt").and_then(Value::as_list) {
            utc_patch_active = patches.iter().any(|p| p.as_str() == Some("utc"));
        }
    }
    if version >= V5_0 {
        utc_patch_active = true;
    }

    HelloMetadata {
        server_agent,
        connection_id,
        utc_patch_active,
    }
}

/// LOGON may re-issue the server-side connection id.
pub(crate) fn logon_connection_id(meta: &Metadata) -> Option<String> {
    meta.get("connection_id")
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Classifies a server FAILURE into the error surfaced to the caller and
/// the state the connection falls to. Security failures kill the
/// connection; everything else stays recoverable via RESET.
pub(crate) fn classify_failure(meta: &Metadata) -> (BoltError, ConnectionState) {
    let code = meta
        .get("neo4j_code")
        .and_then(Value::as_str)
        .or_else(|| meta.get("code").and_then(Value::as_str))
        .unwrap_or("Unknown.Error");
    let message = meta
        .get("message")
        .and_then(Value::as_str)
        .unwrap_or("an unspecified error occurred on the server");
    let detail = format!("server error [{code}]: {message}");

    const RETRYABLE: [&str; 4] = [
        "TransientError",
        "DatabaseUnavailable",
        "NotALeader",
        "ForbiddenOnReadOnlyDatabase",
    ];
    if RETRYABLE.iter().any(|marker| code.contains(marker)) {
        return (
            BoltError::NetworkError(detail),
            ConnectionState::FailedServerReported,
        );
    }
    if code.contains("ClientError.Security") {
        return (BoltError::HandshakeFailed(detail), ConnectionState::Defunct);
    }
    if code.contains("ClientError.Statement") {
        return (
            BoltError::InvalidArgument(detail),
            ConnectionState::FailedServerReported,
        );
    }
    // ClientError.Transaction and anything unrecognized.
    (
        BoltError::UnknownError(detail),
        ConnectionState::FailedServerReported,
    )
}

/// Interpretation of one non-record response payload.
#[derive(Debug)]
pub(crate) enum ServerResponse {
    Success(Metadata),
    /// FAILURE or IGNORED: error to surface plus the state to fall to.
    Failure {
        error: BoltError,
        state: ConnectionState,
    },
    /// Unparseable or out-of-contract message; connection must go defunct.
    Malformed(BoltError),
}

/// Dispatches a received summary payload. Record payloads never reach this
/// function; the streaming loop filters them out first.
pub(crate) fn interpret_summary(payload: &[u8]) -> ServerResponse {
    let tag = match messages::peek_tag(payload) {
        Ok(tag) => tag,
        Err(e) => return ServerResponse::Malformed(e),
    };
    match MessageTag::from_u8(tag) {
        Some(MessageTag::Success) => match messages::deserialize_success(payload) {
            Ok(meta) => ServerResponse::Success(meta),
            Err(e) => ServerResponse::Malformed(e),
        },
        Some(MessageTag::Failure) => match messages::deserialize_failure(payload) {
            Ok(meta) => {
                let (error, state) = classify_failure(&meta);
                ServerResponse::Failure { error, state }
            }
            Err(e) => ServerResponse::Malformed(e),
        },
        Some(MessageTag::Ignored) => match messages::deserialize_ignored(payload) {
            Ok(()) => ServerResponse::Failure {
                error: BoltError::UnknownError(
                    "server error [Neo.ClientError.Request.Ignored]: request was ignored by the \
                     server"
                        .into(),
                ),
                state: ConnectionState::FailedServerReported,
            },
            Err(e) => ServerResponse::Malformed(e),
        },
        _ => ServerResponse::Malformed(BoltError::InvalidMessageFormat(format!(
            "unexpected message tag 0x{tag:02X} while awaiting a summary"
        ))),
    }
}
