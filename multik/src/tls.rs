//! rustls client configuration from a [`Connection`]'s trust and identity
//! material.
use std::sync::Arc;

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate, ClientConfig, PrivateKey, RootCertStore,
};

use crate::{config::Connection, error::AuthError};

/// Build the TLS client configuration for connections to this cluster.
pub(crate) fn client_config(conn: &Connection) -> Result<ClientConfig, AuthError> {
    let builder = ClientConfig::builder().with_safe_defaults();

    let mut config = if conn.accept_invalid_certs {
        let builder =
            builder.with_custom_certificate_verifier(Arc::new(NoCertificateVerification));
        match conn.current_identity_pem() {
            Some(pem) => {
                let (certs, key) = split_identity(&pem)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| AuthError::Tls(format!("invalid client identity: {e}")))?
            }
            None => builder.with_no_client_auth(),
        }
    } else {
        let mut roots = RootCertStore::empty();
        for der in conn.root_cert.iter().flatten() {
            roots
                .add(&Certificate(der.clone()))
                .map_err(|e| AuthError::Tls(format!("invalid root certificate: {e}")))?;
        }
        let builder = builder.with_root_certificates(roots);
        match conn.current_identity_pem() {
            Some(pem) => {
                let (certs, key) = split_identity(&pem)?;
                builder
                    .with_client_auth_cert(certs, key)
                    .map_err(|e| AuthError::Tls(format!("invalid client identity: {e}")))?
            }
            None => builder.with_no_client_auth(),
        }
    };

    config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
    Ok(config)
}

/// Split a PEM blob into the certificate chain and the private key.
fn split_identity(pem: &[u8]) -> Result<(Vec<Certificate>, PrivateKey), AuthError> {
    let mut reader = std::io::Cursor::new(pem);
    let mut certs = Vec::new();
    let mut key = None;
    for item in rustls_pemfile::read_all(&mut reader)
        .map_err(|e| AuthError::Tls(format!("invalid identity PEM: {e}")))?
    {
        match item {
            rustls_pemfile::Item::X509Certificate(der) => certs.push(Certificate(der)),
            rustls_pemfile::Item::PKCS8Key(der)
            | rustls_pemfile::Item::RSAKey(der)
            | rustls_pemfile::Item::ECKey(der) => key = Some(PrivateKey(der)),
            _ => {}
        }
    }
    match (certs.is_empty(), key) {
        (false, Some(key)) => Ok((certs, key)),
        (true, _) => Err(AuthError::Tls("identity PEM contains no certificate".into())),
        (_, None) => Err(AuthError::Tls("identity PEM contains no private key".into())),
    }
}

/// Verifier used with `insecure-skip-tls-verify`.
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &rustls::ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}
