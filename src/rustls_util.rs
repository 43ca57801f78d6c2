//! TLS 1.3 configs for QUIC endpoints, always on the aws-lc-rs provider.

use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};

use rustls::client::WebPkiServerVerifier;
use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, SignatureScheme};

pub type Fingerprint = [u8; 32];

static PROVIDER: LazyLock<Arc<CryptoProvider>> =
    LazyLock::new(|| Arc::new(rustls::crypto::aws_lc_rs::default_provider()));

fn tls_error(context: &str, e: rustls::Error) -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::InvalidInput, format!("{context}: {e}"))
}

fn alpn_bytes(alpn_protocols: &[String]) -> Vec<Vec<u8>> {
    alpn_protocols.iter().map(|s| s.as_bytes().to_vec()).collect()
}

/// A client config that checks the server against the webpki roots when
/// `verify` is set, and against `server_fingerprints` when any are given.
/// With neither, any certificate is accepted.
pub fn create_client_config(
    verify: bool,
    server_fingerprints: &[String],
    alpn_protocols: &[String],
    enable_early_data: bool,
) -> std::io::Result<rustls::ClientConfig> {
    let webpki = if verify {
        let roots = rustls::RootCertStore {
            roots: webpki_roots::TLS_SERVER_ROOTS.to_vec(),
        };
        let verifier = WebPkiServerVerifier::builder_with_provider(Arc::new(roots), PROVIDER.clone())
            .build()
            .map_err(|e| std::io::Error::other(format!("failed to build verifier: {e}")))?;
        Some(verifier)
    } else {
        None
    };

    let builder = rustls::ClientConfig::builder_with_provider(PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("unsupported tls version", e))?;
    let builder = match webpki {
        Some(webpki) if server_fingerprints.is_empty() => builder.with_webpki_verifier(webpki),
        webpki => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(PinnedVerifier {
                webpki,
                fingerprints: parse_fingerprints(server_fingerprints)?,
            })),
    };

    let mut config = builder.with_no_client_auth();
    config.alpn_protocols = alpn_bytes(alpn_protocols);
    config.enable_early_data = enable_early_data;
    Ok(config)
}

/// Runs the optional webpki check, then requires the end entity to match a
/// pinned fingerprint when the set is non-empty.
#[derive(Debug)]
struct PinnedVerifier {
    webpki: Option<Arc<WebPkiServerVerifier>>,
    fingerprints: BTreeSet<Fingerprint>,
}

impl ServerCertVerifier for PinnedVerifier {
    fn verify_server_cert(
        &self,
        end_entity: &CertificateDer<'_>,
        intermediates: &[CertificateDer<'_>],
        server_name: &ServerName<'_>,
        ocsp_response: &[u8],
        now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        if let Some(webpki) = self.webpki.as_ref() {
            webpki.verify_server_cert(end_entity, intermediates, server_name, ocsp_response, now)?;
        }
        if self.fingerprints.is_empty() {
            return Ok(ServerCertVerified::assertion());
        }
        let fingerprint = certificate_fingerprint(end_entity);
        if !self.fingerprints.contains(&fingerprint) {
            return Err(rustls::Error::General(format!(
                "server fingerprint {} is not pinned",
                hex_fingerprint(&fingerprint)
            )));
        }
        Ok(ServerCertVerified::assertion())
    }

    // Handshake signatures are still checked so the session stays bound to
    // the presented key.
    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &PROVIDER.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &PROVIDER.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        PROVIDER.signature_verification_algorithms.supported_schemes()
    }
}

/// Loads a PEM chain and key. `enable_early_data` accepts 0-RTT from
/// resuming clients.
pub fn create_server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    alpn_protocols: &[String],
    enable_early_data: bool,
) -> std::io::Result<rustls::ServerConfig> {
    let invalid = |what: &str, e: rustls::pki_types::pem::Error| {
        std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!("invalid {what}: {e}"),
        )
    };
    let chain = CertificateDer::pem_slice_iter(cert_pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| invalid("certificate", e))?;
    if chain.is_empty() {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "certificate file holds no certificates",
        ));
    }
    let key = PrivateKeyDer::from_pem_slice(key_pem).map_err(|e| invalid("private key", e))?;

    let mut config = rustls::ServerConfig::builder_with_provider(PROVIDER.clone())
        .with_protocol_versions(&[&rustls::version::TLS13])
        .map_err(|e| tls_error("unsupported tls version", e))?
        .with_no_client_auth()
        .with_single_cert(chain, key)
        .map_err(|e| tls_error("certificate does not match key", e))?;
    config.alpn_protocols = alpn_bytes(alpn_protocols);
    // quinn only accepts 0 or u32::MAX.
    config.max_early_data_size = if enable_early_data { u32::MAX } else { 0 };
    Ok(config)
}

/// SHA-256 of a DER certificate.
pub fn certificate_fingerprint(der: &[u8]) -> Fingerprint {
    let digest = aws_lc_rs::digest::digest(&aws_lc_rs::digest::SHA256, der);
    let mut fingerprint = [0u8; 32];
    fingerprint.copy_from_slice(digest.as_ref());
    fingerprint
}

fn hex_fingerprint(fingerprint: &Fingerprint) -> String {
    fingerprint
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Parses hex fingerprints, with or without `:` or space separators.
pub fn parse_fingerprints(fingerprints: &[String]) -> std::io::Result<BTreeSet<Fingerprint>> {
    fingerprints
        .iter()
        .map(|text| {
            let digits: Vec<u8> = text
                .bytes()
                .filter(|b| *b != b':' && *b != b' ')
                .collect();
            let mut fingerprint = [0u8; 32];
            if digits.len() != fingerprint.len() * 2 {
                return Err(bad_fingerprint(text));
            }
            for (byte, pair) in fingerprint.iter_mut().zip(digits.chunks(2)) {
                let pair = std::str::from_utf8(pair).map_err(|_| bad_fingerprint(text))?;
                *byte = u8::from_str_radix(pair, 16).map_err(|_| bad_fingerprint(text))?;
            }
            Ok(fingerprint)
        })
        .collect()
}

fn bad_fingerprint(text: &str) -> std::io::Error {
    std::io::Error::new(
        std::io::ErrorKind::InvalidInput,
        format!("fingerprint must be 32 hex bytes: {text}"),
    )
}
