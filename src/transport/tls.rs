//! TLS trust anchors for the transport upgrade.
//!
//! Three authenticators: the system root store, a caller-supplied CA
//! bundle, and a pinned certificate identified by the SHA-256 of its DER
//! encoding. The pinned verifier still runs the provider's signature
//! checks; only the chain-building step is replaced by the digest
//! comparison.

use crate::config::TrustAnchor;
use crate::error::Error;
use sha2::{Digest, Sha256};
use std::io::BufReader;
use std::sync::Arc;
use tokio_rustls::rustls::pki_types::ServerName;
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore};
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Install the ring crypto provider once, before any TLS configuration is
/// built.
pub fn init_crypto_provider() {
    use std::sync::Once;
    static INIT: Once = Once::new();

    INIT.call_once(|| {
        let _ = rustls::crypto::ring::default_provider().install_default();
    });
}

/// TLS verifier that accepts exactly one certificate: the one whose DER
/// SHA-256 equals the configured pin.
#[derive(Debug)]
struct PinnedCertVerifier {
    pin: [u8; 32],
    provider: Arc<rustls::crypto::CryptoProvider>,
}

impl rustls::client::danger::ServerCertVerifier for PinnedCertVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        let digest: [u8; 32] = Sha256::digest(end_entity.as_ref()).into();
        if digest == self.pin {
            debug!(?server_name, "pinned certificate matched");
            Ok(rustls::client::danger::ServerCertVerified::assertion())
        } else {
            warn!(
                ?server_name,
                presented = %hex::encode(digest),
                "certificate does not match the configured pin"
            );
            Err(rustls::Error::General(format!(
                "certificate fingerprint {} does not match pin",
                hex::encode(digest)
            )))
        }
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &rustls::pki_types::CertificateDer<'_>,
        dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.provider.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

fn system_roots() -> Result<RootCertStore, Error> {
    let mut root_store = RootCertStore::empty();
    let native_certs = rustls_native_certs::load_native_certs();
    if native_certs.certs.is_empty() {
        return Err(Error::TrustAnchor {
            anchor: "system".to_string(),
            reason: "no system root certificates found".to_string(),
        });
    }
    for cert in native_certs.certs {
        root_store.add(cert).map_err(|e| Error::TrustAnchor {
            anchor: "system".to_string(),
            reason: format!("failed to add certificate: {}", e),
        })?;
    }
    Ok(root_store)
}

fn ca_file_roots(path: &std::path::Path) -> Result<RootCertStore, Error> {
    let file = std::fs::File::open(path).map_err(|e| Error::CaFile {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut reader = BufReader::new(file);
    let mut root_store = RootCertStore::empty();
    let mut loaded = 0usize;
    for cert in rustls_pemfile::certs(&mut reader) {
        let cert = cert.map_err(|e| Error::TrustAnchor {
            anchor: format!("ca-file {}", path.display()),
            reason: format!("malformed certificate: {}", e),
        })?;
        root_store.add(cert).map_err(|e| Error::TrustAnchor {
            anchor: format!("ca-file {}", path.display()),
            reason: format!("failed to add certificate: {}", e),
        })?;
        loaded += 1;
    }
    if loaded == 0 {
        return Err(Error::TrustAnchor {
            anchor: format!("ca-file {}", path.display()),
            reason: "file contains no certificates".to_string(),
        });
    }
    Ok(root_store)
}

fn decode_pin(hex_pin: &str) -> Result<[u8; 32], Error> {
    let bytes = hex::decode(hex_pin.trim().replace(':', "")).map_err(|e| Error::TrustAnchor {
        anchor: "pinned".to_string(),
        reason: format!("pin is not valid hex: {}", e),
    })?;
    bytes.try_into().map_err(|_| Error::TrustAnchor {
        anchor: "pinned".to_string(),
        reason: "pin must be a 32-byte SHA-256 digest".to_string(),
    })
}

/// Build a TLS connector for the configured trust anchor.
pub fn connector(anchor: &TrustAnchor) -> Result<TlsConnector, Error> {
    init_crypto_provider();
    let config = match anchor {
        TrustAnchor::System => ClientConfig::builder()
            .with_root_certificates(system_roots()?)
            .with_no_client_auth(),
        TrustAnchor::CaFile(path) => ClientConfig::builder()
            .with_root_certificates(ca_file_roots(path)?)
            .with_no_client_auth(),
        TrustAnchor::Pinned { sha256 } => {
            let pin = decode_pin(sha256)?;
            let provider = Arc::new(rustls::crypto::ring::default_provider());
            ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(PinnedCertVerifier {
                    pin,
                    provider,
                }))
                .with_no_client_auth()
        }
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_pin_plain_hex() {
        let pin = decode_pin(&"ab".repeat(32)).unwrap();
        assert_eq!(pin, [0xab; 32]);
    }

    #[test]
    fn test_decode_pin_colon_separated() {
        let colons = (0..32).map(|_| "cd").collect::<Vec<_>>().join(":");
        let pin = decode_pin(&colons).unwrap();
        assert_eq!(pin, [0xcd; 32]);
    }

    #[test]
    fn test_decode_pin_rejects_wrong_length() {
        assert!(decode_pin("abcd").is_err());
        assert!(decode_pin(&"ab".repeat(20)).is_err());
    }

    #[test]
    fn test_decode_pin_rejects_non_hex() {
        assert!(decode_pin(&"zz".repeat(32)).is_err());
    }

    #[test]
    fn test_pinned_connector_builds() {
        let anchor = TrustAnchor::Pinned {
            sha256: "00".repeat(32),
        };
        assert!(connector(&anchor).is_ok());
    }

    #[test]
    fn test_ca_file_connector_missing_file() {
        let anchor = TrustAnchor::CaFile("/nonexistent/wisp-test-ca.pem".into());
        assert!(matches!(connector(&anchor), Err(Error::CaFile { .. })));
    }
}
