//! TLS upgrade for `tls://` endpoints.
//!
//! The connection starts as plain TCP and is upgraded after INFO when the endpoint asks for TLS.
//! Server certificates are verified against the configured CA bundle. A [`CertValidator`] may be
//! installed to inspect every certificate and override the verdict, e.g. to pin a fingerprint.

use crate::config::TlsOptions;
use crate::error::{NatsError, Result};
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};
use std::fmt;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};

type ValidatorFn = dyn Fn(&CertificateDer<'_>, Option<&rustls::Error>) -> bool + Send + Sync;

/// User callback deciding whether a server certificate is acceptable.
///
/// It receives the end-entity certificate and the CA verification failure, if any. Returning
/// true accepts the certificate.
#[derive(Clone)]
pub struct CertValidator(Arc<ValidatorFn>);

impl CertValidator {
    /// Wraps a validation callback.
    pub fn new(
        f: impl Fn(&CertificateDer<'_>, Option<&rustls::Error>) -> bool + Send + Sync + 'static,
    ) -> Self {
        Self(Arc::new(f))
    }

    fn accepts(&self, cert: &CertificateDer<'_>, failure: Option<&rustls::Error>) -> bool {
        (self.0)(cert, failure)
    }
}

impl fmt::Debug for CertValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("CertValidator")
    }
}

/// Verifier running the CA check first and letting the validator have the last word.
struct CallbackVerifier {
    webpki: Option<Arc<WebPkiServerVerifier>>,
    validator: CertValidator,
    algorithms: WebPkiSupportedAlgorithms,
}

impl fmt::Debug for CallbackVerifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallbackVerifier")
            .field("has_roots", &self.webpki.is_some())
            .finish()
    }
}

impl ServerCertVerifier for CallbackVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        let verdict = match &self.webpki {
            Some(webpki) => webpki
                .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
                .map(|_| ()),
            None => Err(rustls::Error::General("no trusted CA configured".into())),
        };
        let failure = verdict.as_ref().err();
        if self.validator.accepts(end_entity, failure) {
            Ok(ServerCertVerified::assertion())
        } else {
            Err(verdict
                .err()
                .unwrap_or_else(|| rustls::Error::General("rejected by validator".into())))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Client-side TLS connector built from [`TlsOptions`].
#[derive(Clone)]
pub struct TlsConnector {
    inner: tokio_rustls::TlsConnector,
}

impl fmt::Debug for TlsConnector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsConnector").finish()
    }
}

fn tls_err(what: &str, e: impl fmt::Display) -> NatsError {
    NatsError::Tls {
        reason: format!("{}: {}", what, e),
    }
}

impl TlsConnector {
    /// Builds a connector. Needs a CA bundle, a validator, or both.
    pub fn new(options: &TlsOptions) -> Result<Self> {
        let provider: Arc<CryptoProvider> = Arc::new(rustls::crypto::ring::default_provider());

        let roots = match options.ca_pem()? {
            Some(pem) => {
                let mut store = rustls::RootCertStore::empty();
                for cert in load_certs_from_pem(&pem)? {
                    store
                        .add(cert)
                        .map_err(|e| tls_err("failed to add CA cert", e))?;
                }
                Some(Arc::new(store))
            }
            None => None,
        };

        let builder = rustls::ClientConfig::builder_with_provider(provider.clone())
            .with_safe_default_protocol_versions()
            .map_err(|e| tls_err("unsupported protocol versions", e))?;

        let builder = match (&options.validator, roots) {
            (Some(validator), roots) => {
                let webpki = match roots {
                    Some(roots) => Some(
                        WebPkiServerVerifier::builder_with_provider(roots, provider.clone())
                            .build()
                            .map_err(|e| tls_err("failed to build verifier", e))?,
                    ),
                    None => None,
                };
                let verifier = CallbackVerifier {
                    webpki,
                    validator: validator.clone(),
                    algorithms: provider.signature_verification_algorithms,
                };
                builder
                    .dangerous()
                    .with_custom_certificate_verifier(Arc::new(verifier))
            }
            (None, Some(roots)) => builder.with_root_certificates(roots),
            (None, None) => {
                return Err(NatsError::Tls {
                    reason: "no CA bundle or certificate validator configured".into(),
                })
            }
        };

        let config = match (&options.client_cert_pem, &options.client_key_pem) {
            (Some(cert_pem), Some(key_pem)) => {
                let certs = load_certs_from_pem(cert_pem.as_bytes())?;
                let key = load_private_key_from_pem(key_pem.as_bytes())?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| tls_err("failed to set client certificate", e))?
            }
            (None, None) => builder.with_no_client_auth(),
            _ => {
                return Err(NatsError::Tls {
                    reason: "client certificate and key must be configured together".into(),
                })
            }
        };

        Ok(Self {
            inner: tokio_rustls::TlsConnector::from(Arc::new(config)),
        })
    }

    /// Runs the client handshake over `stream`.
    pub async fn connect<IO>(
        &self,
        domain: &str,
        stream: IO,
    ) -> Result<tokio_rustls::client::TlsStream<IO>>
    where
        IO: AsyncRead + AsyncWrite + Unpin,
    {
        let name = if let Ok(ip) = domain.parse::<std::net::IpAddr>() {
            ServerName::IpAddress(ip.into())
        } else {
            ServerName::try_from(domain.to_string()).map_err(|e| tls_err("invalid domain", e))?
        };
        self.inner
            .connect(name, stream)
            .await
            .map_err(|e| tls_err("TLS handshake failed", e))
    }
}

/// Loads certificates from PEM-encoded data.
pub fn load_certs_from_pem(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>> {
    let mut cursor = std::io::Cursor::new(pem);
    let certs = rustls_pemfile::certs(&mut cursor)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| tls_err("invalid certificate PEM", e))?;
    if certs.is_empty() {
        return Err(NatsError::Tls {
            reason: "no certificates found in PEM".to_string(),
        });
    }
    Ok(certs)
}

/// Loads the first private key (PKCS#8, PKCS#1 or SEC1) from PEM-encoded data.
pub fn load_private_key_from_pem(pem: &[u8]) -> Result<PrivateKeyDer<'static>> {
    let mut cursor = std::io::Cursor::new(pem);
    rustls_pemfile::private_key(&mut cursor)
        .map_err(|e| tls_err("invalid key PEM", e))?
        .ok_or_else(|| NatsError::Tls {
            reason: "no private key found in PEM".to_string(),
        })
}
