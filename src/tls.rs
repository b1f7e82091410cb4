//! TLS context construction shared by the blocking and async surfaces.
//!
//! Strategy mapping:
//! - `TrustAllCertificates`: certificate and hostname checks disabled via a
//!   verifier that accepts everything; establishing logs a loud warning.
//! - `SystemCertificates`: platform trust store via `rustls-native-certs`.
//! - `CustomCertificates`: PEM roots from `trusted_certificate_files`.
//!
//! With `hostname_verification` off (and a real trust root), chain
//! validation stays intact and only the name check is waived.

use crate::config::{ConnectionConfig, EncryptionStrategy};
use crate::errors::BoltError;
use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use rustls_pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

/// Builds the rustls client configuration for an encrypted connection.
pub(crate) fn build_client_config(config: &ConnectionConfig) -> Result<Arc<ClientConfig>, BoltError> {
    let builder = ClientConfig::builder();

    let wants_client_cert = match config.encryption {
        EncryptionStrategy::Plaintext => {
            return Err(BoltError::InvalidArgument(
                "TLS context requested for a plaintext connection".into(),
            ));
        }
        EncryptionStrategy::TrustAllCertificates => {
            warn!(
                "TLS for {}:{} configured to trust ALL certificates; connection is not \
                 protected against man-in-the-middle attacks",
                config.host, config.port
            );
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(AcceptAllVerifier::new()))
        }
        EncryptionStrategy::SystemCertificates => {
            let roots = system_roots()?;
            build_with_roots(builder, roots, config)?
        }
        EncryptionStrategy::CustomCertificates => {
            if config.trusted_certificate_files.is_empty() {
                warn!(
                    "custom CA strategy selected for {}:{} but no CA files configured; \
                     verification will fail",
                    config.host, config.port
                );
            }
            let mut roots = RootCertStore::empty();
            for path in &config.trusted_certificate_files {
                let certs = load_pem_certs(path)?;
                for cert in certs {
                    roots.add(cert).map_err(|e| {
                        BoltError::NetworkError(format!(
                            "rejected CA certificate from {}: {e}",
                            path.display()
                        ))
                    })?;
                }
                debug!("loaded trusted CA file {}", path.display());
            }
            build_with_roots(builder, roots, config)?
        }
    };

    let client_config = match &config.client_certificate_file {
        Some(cert_path) => {
            let key_path = config.client_key_file.as_ref().ok_or_else(|| {
                BoltError::InvalidArgument(
                    "client certificate configured without a private key file".into(),
                )
            })?;
            if config
                .client_key_password
                .as_ref()
                .is_some_and(|p| !p.is_empty())
            {
                return Err(BoltError::InvalidArgument(
                    "encrypted client private keys are not supported; provide an unencrypted PEM"
                        .into(),
                ));
            }
            let chain = load_pem_certs(cert_path)?;
            let key = load_pem_key(key_path)?;
            debug!("using client certificate {}", cert_path.display());
            wants_client_cert
                .with_client_auth_cert(chain, key)
                .map_err(|e| {
                    BoltError::NetworkError(format!("client certificate setup failed: {e}"))
                })?
        }
        None => wants_client_cert.with_no_client_auth(),
    };

    Ok(Arc::new(client_config))
}

/// The SNI / verification name for the configured host.
pub(crate) fn server_name(host: &str) -> Result<ServerName<'static>, BoltError> {
    ServerName::try_from(host.to_owned())
        .map_err(|e| BoltError::InvalidArgument(format!("invalid TLS server name {host:?}: {e}")))
}

type WantsClientCert = rustls::ConfigBuilder<ClientConfig, rustls::client::WantsClientCert>;

fn build_with_roots(
    builder: rustls::ConfigBuilder<ClientConfig, rustls::WantsVerifier>,
    roots: RootCertStore,
    config: &ConnectionConfig,
) -> Result<WantsClientCert, BoltError> {
    if config.hostname_verification {
        Ok(builder.with_root_certificates(roots))
    } else {
        // Keep chain validation, waive only the name check.
        let inner = WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| BoltError::NetworkError(format!("verifier setup failed: {e}")))?;
        warn!(
            "hostname verification disabled for {}:{}",
            config.host, config.port
        );
        Ok(builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(RelaxedHostnameVerifier { inner })))
    }
}

fn system_roots() -> Result<RootCertStore, BoltError> {
    let loaded = rustls_native_certs::load_native_certs();
    for error in &loaded.errors {
        warn!("skipping unreadable system trust anchor: {error}");
    }
    if loaded.certs.is_empty() {
        return Err(BoltError::NetworkError(
            "no usable certificates in the system trust store".into(),
        ));
    }
    let mut roots = RootCertStore::empty();
    let (added, ignored) = roots.add_parsable_certificates(loaded.certs);
    debug!("loaded {added} system trust anchors ({ignored} ignored)");
    Ok(roots)
}

fn load_pem_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, BoltError> {
    let file = File::open(path).map_err(|e| {
        BoltError::NetworkError(format!("cannot open certificate file {}: {e}", path.display()))
    })?;
    let certs: Result<Vec<_>, _> = rustls_pemfile::certs(&mut BufReader::new(file)).collect();
    let certs = certs.map_err(|e| {
        BoltError::NetworkError(format!("malformed PEM in {}: {e}", path.display()))
    })?;
    if certs.is_empty() {
        return Err(BoltError::NetworkError(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_pem_key(path: &Path) -> Result<PrivateKeyDer<'static>, BoltError> {
    let file = File::open(path).map_err(|e| {
        BoltError::NetworkError(format!("cannot open key file {}: {e}", path.display()))
    })?;
    rustls_pemfile::private_key(&mut BufReader::new(file))
        .map_err(|e| BoltError::NetworkError(format!("malformed key in {}: {e}", path.display())))?
        .ok_or_else(|| {
            BoltError::NetworkError(format!("no private key found in {}", path.display()))
        })
}

/// Verifier for `TrustAllCertificates`: accepts any chain and any name.
#[derive(Debug)]
struct AcceptAllVerifier {
    schemes: Vec<SignatureScheme>,
}

impl AcceptAllVerifier {
    fn new() -> Self {
        AcceptAllVerifier {
            schemes: rustls::crypto::ring::default_provider()
                .signature_verification_algorithms
                .supported_schemes(),
        }
    }
}

impl ServerCertVerifier for AcceptAllVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.schemes.clone()
    }
}

/// Full webpki verification except that a certificate not matching the
/// hostname is tolerated.
#[derive(Debug)]
struct RelaxedHostnameVerifier {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for RelaxedHostnameVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        match self.inner.verify_server_cert(
            end_entity,
            intermediates,
            server_name,
            ocsp_response,
            now,
        ) {
            Err(rustls::Error::InvalidCertificate(CertificateError::NotValidForName)) => {
                Ok(ServerCertVerified::assertion())
            }
            Err(rustls::Error::InvalidCertificate(
                CertificateError::NotValidForNameContext { .. },
            )) => Ok(ServerCertVerified::assertion()),
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}
