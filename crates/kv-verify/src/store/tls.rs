//! TLS for PostgreSQL store connections.
//!
//! Modes follow libpq's `sslmode`:
//!
//! | mode          | encrypted | chain checked | hostname checked |
//! |---------------|-----------|---------------|------------------|
//! | `disable`     | no        | no            | no               |
//! | `require`     | yes       | no            | no               |
//! | `verify-ca`   | yes       | yes           | no               |
//! | `verify-full` | yes       | yes           | yes              |
//!
//! Trust roots are the bundled webpki roots, or the PEM bundle named by
//! `ssl_root_cert` when set.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::client::WebPkiServerVerifier;
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use rustls::{CertificateError, ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_postgres_rustls::MakeRustlsConnect;
use tracing::{debug, warn};

use crate::config::StoreConfig;
use crate::error::{Result, VerifyError};

/// libpq-style ssl modes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SslMode {
    #[default]
    Disable,
    Require,
    VerifyCa,
    VerifyFull,
}

impl SslMode {
    pub fn parse(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "disable" | "" => Ok(SslMode::Disable),
            "require" => Ok(SslMode::Require),
            "verify-ca" => Ok(SslMode::VerifyCa),
            "verify-full" => Ok(SslMode::VerifyFull),
            other => Err(VerifyError::Config(format!(
                "Invalid ssl_mode '{}'. Valid values: disable, require, verify-ca, verify-full",
                other
            ))),
        }
    }

    pub fn requires_tls(&self) -> bool {
        !matches!(self, SslMode::Disable)
    }

    /// Whether the server certificate chain is checked against trust roots.
    pub fn verifies_chain(&self) -> bool {
        matches!(self, SslMode::VerifyCa | SslMode::VerifyFull)
    }
}

/// Builds the rustls connector for one store's pool.
#[derive(Debug, Clone)]
pub struct TlsBuilder {
    ssl_mode: SslMode,
    root_cert: Option<PathBuf>,
}

impl TlsBuilder {
    pub fn new(ssl_mode: SslMode) -> Self {
        Self {
            ssl_mode,
            root_cert: None,
        }
    }

    /// Trust only the certificates in this PEM bundle.
    pub fn with_root_cert(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_cert = Some(path.into());
        self
    }

    pub fn from_config(config: &StoreConfig) -> Result<Self> {
        let builder = Self::new(SslMode::parse(&config.ssl_mode)?);
        Ok(match &config.ssl_root_cert {
            Some(path) => builder.with_root_cert(path),
            None => builder,
        })
    }

    /// Connector for deadpool-postgres, `None` when TLS is off.
    pub fn build(&self) -> Result<Option<MakeRustlsConnect>> {
        if !self.ssl_mode.requires_tls() {
            return Ok(None);
        }
        Ok(Some(MakeRustlsConnect::new(self.build_client_config()?)))
    }

    pub fn build_client_config(&self) -> Result<ClientConfig> {
        let provider = crypto_provider();

        let verifier: Arc<dyn ServerCertVerifier> = match self.ssl_mode {
            SslMode::Disable => {
                return Err(VerifyError::Config(
                    "Cannot build TLS config for ssl_mode=disable".into(),
                ))
            }
            SslMode::Require => {
                warn!(
                    "ssl_mode=require encrypts but does not verify the server certificate; \
                     use verify-full outside of trusted networks"
                );
                Arc::new(AcceptAnyCert { provider })
            }
            SslMode::VerifyCa => Arc::new(ChainOnly {
                inner: self.webpki_verifier()?,
            }),
            SslMode::VerifyFull => self.webpki_verifier()?,
        };
        debug!("TLS enabled with ssl_mode={:?}", self.ssl_mode);

        Ok(ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(verifier)
            .with_no_client_auth())
    }

    fn webpki_verifier(&self) -> Result<Arc<WebPkiServerVerifier>> {
        let roots = match &self.root_cert {
            Some(path) => load_roots(path)?,
            None => {
                let mut roots = RootCertStore::empty();
                roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());
                roots
            }
        };
        WebPkiServerVerifier::builder(Arc::new(roots))
            .build()
            .map_err(|e| VerifyError::Config(format!("TLS verifier: {}", e)))
    }
}

fn crypto_provider() -> Arc<CryptoProvider> {
    CryptoProvider::get_default()
        .cloned()
        .unwrap_or_else(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()))
}

fn load_roots(path: &Path) -> Result<RootCertStore> {
    let certs = CertificateDer::pem_file_iter(path)
        .map_err(|e| VerifyError::Config(format!("ssl_root_cert {:?}: {}", path, e)))?;

    let mut roots = RootCertStore::empty();
    for cert in certs {
        let cert =
            cert.map_err(|e| VerifyError::Config(format!("ssl_root_cert {:?}: {}", path, e)))?;
        roots
            .add(cert)
            .map_err(|e| VerifyError::Config(format!("ssl_root_cert {:?}: {}", path, e)))?;
    }
    if roots.is_empty() {
        return Err(VerifyError::Config(format!(
            "ssl_root_cert {:?} holds no certificates",
            path
        )));
    }
    Ok(roots)
}

/// `require`: encrypt, trust anything. Handshake signatures are still
/// checked so the session key belongs to the presented certificate.
#[derive(Debug)]
struct AcceptAnyCert {
    provider: Arc<CryptoProvider>,
}

impl ServerCertVerifier for AcceptAnyCert {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.provider.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

/// `verify-ca`: full chain validation, hostname mismatch tolerated.
#[derive(Debug)]
struct ChainOnly {
    inner: Arc<WebPkiServerVerifier>,
}

impl ServerCertVerifier for ChainOnly {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        match self
            .inner
            .verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)
        {
            Err(rustls::Error::InvalidCertificate(ref e)) if is_name_mismatch(e) => {
                Ok(ServerCertVerified::assertion())
            }
            other => other,
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls12_signature(message, cert, dss)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        self.inner.verify_tls13_signature(message, cert, dss)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.inner.supported_verify_schemes()
    }
}

// Later rustls releases report the mismatch as `NotValidForNameContext`.
fn is_name_mismatch(e: &CertificateError) -> bool {
    format!("{:?}", e).starts_with("NotValidForName")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ssl_mode_parsing() {
        assert_eq!(SslMode::parse("disable").unwrap(), SslMode::Disable);
        assert_eq!(SslMode::parse("REQUIRE").unwrap(), SslMode::Require);
        assert_eq!(SslMode::parse("verify-ca").unwrap(), SslMode::VerifyCa);
        assert_eq!(SslMode::parse("verify-full").unwrap(), SslMode::VerifyFull);
        assert_eq!(SslMode::parse("").unwrap(), SslMode::Disable);
        assert!(SslMode::parse("prefer").is_err());
    }

    #[test]
    fn test_mode_properties() {
        assert!(!SslMode::Disable.requires_tls());
        assert!(SslMode::Require.requires_tls());
        assert!(!SslMode::Require.verifies_chain());
        assert!(SslMode::VerifyCa.verifies_chain());
    }

    #[test]
    fn test_disable_builds_no_connector() {
        assert!(TlsBuilder::new(SslMode::Disable).build().unwrap().is_none());
    }

    #[test]
    fn test_name_mismatch_detection() {
        assert!(is_name_mismatch(&CertificateError::NotValidForName));
        assert!(!is_name_mismatch(&CertificateError::Expired));
    }

    #[test]
    fn test_missing_root_cert_is_config_error() {
        let builder = TlsBuilder::new(SslMode::VerifyFull).with_root_cert("/nonexistent/ca.pem");
        let err = builder.build_client_config().unwrap_err();
        assert!(matches!(err, VerifyError::Config(_)));
    }

    #[test]
    fn test_empty_root_bundle_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        std::fs::write(&path, "").unwrap();

        let err = TlsBuilder::new(SslMode::VerifyCa)
            .with_root_cert(&path)
            .build_client_config()
            .unwrap_err();
        assert!(err.to_string().contains("no certificates"));
    }
}
