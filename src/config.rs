//! Connection configuration.
//!
//! Immutable once a connection is created; environment knobs never reach
//! this crate directly, everything flows through `ConnectionConfig`.

use crate::messages::{BoltAgent, Metadata};
use crate::packstream::Value;
use crate::version::{DEFAULT_PROPOSED_VERSIONS, Version};
use std::path::PathBuf;
use std::time::Duration;

pub const DEFAULT_USER_AGENT: &str = concat!("bolt-transport/", env!("CARGO_PKG_VERSION"));

pub const DEFAULT_TCP_CONNECT_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_TLS_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(10_000);
pub const DEFAULT_BOLT_HANDSHAKE_TIMEOUT: Duration = Duration::from_millis(5_000);
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_millis(30_000);
pub const DEFAULT_WRITE_TIMEOUT: Duration = Duration::from_millis(30_000);

/// How the transport to the server is protected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EncryptionStrategy {
    /// Plain TCP, no TLS layer at all.
    #[default]
    Plaintext,
    /// TLS with certificate verification disabled. Never use outside test
    /// environments; establishing logs a loud warning.
    TrustAllCertificates,
    /// TLS verified against the platform trust store.
    SystemCertificates,
    /// TLS verified against the PEM files in `trusted_certificate_files`.
    CustomCertificates,
}

/// Credentials presented during HELLO (< 5.1) or LOGON (>= 5.1).
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum AuthToken {
    /// No authentication; LOGON is never sent.
    #[default]
    None,
    Basic {
        username: String,
        password: String,
        realm: Option<String>,
    },
    Bearer {
        token: String,
    },
    Kerberos {
        base64_ticket: String,
    },
    Custom {
        scheme: String,
        principal: String,
        credentials: String,
        realm: Option<String>,
        parameters: Vec<(String, String)>,
    },
}

impl AuthToken {
    pub fn is_none(&self) -> bool {
        matches!(self, AuthToken::None)
    }

    /// Translates the token into the map the server expects, identical for
    /// embedded HELLO auth and LOGON. Custom parameters may not overwrite
    /// the standard keys.
    pub fn token_map(&self) -> Metadata {
        let mut tokens = Metadata::new();
        match self {
            AuthToken::None => {
                tokens.insert("scheme".into(), Value::from("none"));
            }
            AuthToken::Basic {
                username,
                password,
                realm,
            } => {
                tokens.insert("scheme".into(), Value::from("basic"));
                tokens.insert("principal".into(), Value::from(username.as_str()));
                tokens.insert("credentials".into(), Value::from(password.as_str()));
                if let Some(realm) = realm {
                    tokens.insert("realm".into(), Value::from(realm.as_str()));
                }
            }
            AuthToken::Bearer { token } => {
                tokens.insert("scheme".into(), Value::from("bearer"));
                tokens.insert("credentials".into(), Value::from(token.as_str()));
            }
            AuthToken::Kerberos { base64_ticket } => {
                tokens.insert("scheme".into(), Value::from("kerberos"));
                tokens.insert("credentials".into(), Value::from(base64_ticket.as_str()));
            }
            AuthToken::Custom {
                scheme,
                principal,
                credentials,
                realm,
                parameters,
            } => {
                tokens.insert("scheme".into(), Value::from(scheme.as_str()));
                tokens.insert("principal".into(), Value::from(principal.as_str()));
                tokens.insert("credentials".into(), Value::from(credentials.as_str()));
                if let Some(realm) = realm {
                    tokens.insert("realm".into(), Value::from(realm.as_str()));
                }
                for (key, value) in parameters {
                    if matches!(key.as_str(), "scheme" | "principal" | "credentials" | "realm") {
                        continue;
                    }
                    tokens.insert(key.clone(), Value::from(value.as_str()));
                }
            }
        }
        tokens
    }
}

/// Everything a physical connection needs to establish itself.
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub host: String,
    pub port: u16,

    pub encryption: EncryptionStrategy,
    /// PEM chain presented to servers requiring mutual TLS.
    pub client_certificate_file: Option<PathBuf>,
    pub client_key_file: Option<PathBuf>,
    /// Passphrase for an encrypted client key. Encrypted PEM is not
    /// supported by the rustls loader; a populated value is rejected at
    /// context-setup time instead of being silently ignored.
    pub client_key_password: Option<String>,
    /// CA material for `CustomCertificates`.
    pub trusted_certificate_files: Vec<PathBuf>,
    pub hostname_verification: bool,

    pub auth: AuthToken,

    pub user_agent: String,
    pub bolt_agent: Option<BoltAgent>,
    pub routing_context: Option<Metadata>,
    /// Handshake proposals, most preferred first. Only the first four fit
    /// on the wire.
    pub proposed_versions: Vec<Version>,

    pub tcp_connect_timeout: Duration,
    pub tls_handshake_timeout: Duration,
    pub bolt_handshake_timeout: Duration,
    pub read_timeout: Duration,
    pub write_timeout: Duration,

    pub keep_alive: bool,
    pub no_delay: bool,
}

impl ConnectionConfig {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        ConnectionConfig {
            host: host.into(),
            port,
            encryption: EncryptionStrategy::Plaintext,
            client_certificate_file: None,
            client_key_file: None,
            client_key_password: None,
            trusted_certificate_files: Vec::new(),
            hostname_verification: true,
            auth: AuthToken::None,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            bolt_agent: None,
            routing_context: None,
            proposed_versions: DEFAULT_PROPOSED_VERSIONS.to_vec(),
            tcp_connect_timeout: DEFAULT_TCP_CONNECT_TIMEOUT,
            tls_handshake_timeout: DEFAULT_TLS_HANDSHAKE_TIMEOUT,
            bolt_handshake_timeout: DEFAULT_BOLT_HANDSHAKE_TIMEOUT,
            read_timeout: DEFAULT_READ_TIMEOUT,
            write_timeout: DEFAULT_WRITE_TIMEOUT,
            keep_alive: true,
            no_delay: true,
        }
    }

    pub fn encryption_enabled(&self) -> bool {
        self.encryption != EncryptionStrategy::Plaintext
    }
}
