//! TLS material: throwaway self-signed identities for listeners, a
//! deliberately permissive client configuration, and an offline CA
//! chain generator for operators who want stable certificates.

use std::fs;
use std::io;
use std::path::Path;
use std::sync::Arc;

use log::info;
use once_cell::sync::Lazy;
use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, KeyPair,
    KeyUsagePurpose,
};
use thiserror::Error;
use tokio_rustls::rustls;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, ServerConfig, SignatureScheme};
use tokio_rustls::TlsAcceptor;

#[derive(Error, Debug)]
pub enum EncryptionError {
    #[error("certificate generation failed: {0}")]
    Generation(#[from] rcgen::Error),
    #[error("TLS configuration rejected: {0}")]
    Config(#[from] rustls::Error),
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// A freshly generated certificate and private key, kept in both PEM
/// and DER so it can be written to disk or fed straight into rustls.
pub struct TlsIdentity {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: CertificateDer<'static>,
    pub key_der: PrivateKeyDer<'static>,
}

fn identity_params(
    common_name: &str,
    eku: ExtendedKeyUsagePurpose,
) -> Result<CertificateParams, EncryptionError> {
    let mut params =
        CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])?;
    params.distinguished_name.push(DnType::CommonName, common_name);
    params
        .distinguished_name
        .push(DnType::OrganizationName, "Burrow Operations");
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![eku];
    Ok(params)
}

/// Generates a self-signed server identity valid for localhost and
/// 127.0.0.1. Each call produces a new key pair; listeners that come
/// and go get fresh material instead of a key file on disk.
pub fn generate_server_identity() -> Result<TlsIdentity, EncryptionError> {
    let key_pair = KeyPair::generate()?;
    let params = identity_params("burrow-server", ExtendedKeyUsagePurpose::ServerAuth)?;
    let cert = params.self_signed(&key_pair)?;
    Ok(TlsIdentity {
        cert_pem: cert.pem(),
        key_pem: key_pair.serialize_pem(),
        cert_der: cert.der().clone(),
        key_der: PrivateKeyDer::Pkcs8(key_pair.serialize_der().into()),
    })
}

/// Builds a TLS acceptor serving the given identity, no client auth.
pub fn tls_acceptor(identity: &TlsIdentity) -> Result<TlsAcceptor, EncryptionError> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(vec![identity.cert_der.clone()], identity.key_der.clone_key())?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Writes a CA plus a server and a client certificate signed by it
/// under `out_dir`: ca.crt, ca.key, server.crt, server.key, client.crt,
/// client.key. Existing files are overwritten.
pub fn generate_ca_chain(out_dir: &Path) -> Result<(), EncryptionError> {
    fs::create_dir_all(out_dir)?;

    let ca_key = KeyPair::generate()?;
    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name.push(DnType::CommonName, "burrow-ca");
    ca_params
        .distinguished_name
        .push(DnType::OrganizationName, "Burrow Operations");
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign, KeyUsagePurpose::CrlSign];
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let server_key = KeyPair::generate()?;
    let server_params = identity_params("burrow-server", ExtendedKeyUsagePurpose::ServerAuth)?;
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

    let client_key = KeyPair::generate()?;
    let client_params = identity_params("burrow-client", ExtendedKeyUsagePurpose::ClientAuth)?;
    let client_cert = client_params.signed_by(&client_key, &ca_cert, &ca_key)?;

    fs::write(out_dir.join("ca.crt"), ca_cert.pem())?;
    fs::write(out_dir.join("ca.key"), ca_key.serialize_pem())?;
    fs::write(out_dir.join("server.crt"), server_cert.pem())?;
    fs::write(out_dir.join("server.key"), server_key.serialize_pem())?;
    fs::write(out_dir.join("client.crt"), client_cert.pem())?;
    fs::write(out_dir.join("client.key"), client_key.serialize_pem())?;

    info!("[CERTS] CA chain written to {}", out_dir.display());
    Ok(())
}

/// Certificate verifier that accepts anything. Peers here present
/// throwaway self-signed certificates, so there is nothing to chain to.
#[derive(Debug)]
struct NoVerify;

impl ServerCertVerifier for NoVerify {
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
        vec![
            SignatureScheme::RSA_PKCS1_SHA1,
            SignatureScheme::ECDSA_SHA1_Legacy,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}

static INSECURE_CLIENT_CONFIG: Lazy<Arc<ClientConfig>> = Lazy::new(|| {
    let config = ClientConfig::builder()
        .dangerous()
        .with_custom_certificate_verifier(Arc::new(NoVerify))
        .with_no_client_auth();
    Arc::new(config)
});

/// Shared client configuration that skips certificate verification.
pub fn insecure_client_config() -> Arc<ClientConfig> {
    INSECURE_CLIENT_CONFIG.clone()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_identity_builds_acceptor() {
        let identity = generate_server_identity().unwrap();
        assert!(identity.cert_pem.starts_with("-----BEGIN CERTIFICATE-----"));
        assert!(identity.key_pem.contains("PRIVATE KEY"));
        tls_acceptor(&identity).unwrap();
    }

    #[test]
    fn test_ca_chain_writes_expected_files() {
        let dir = tempfile::tempdir().unwrap();
        generate_ca_chain(dir.path()).unwrap();
        for name in [
            "ca.crt",
            "ca.key",
            "server.crt",
            "server.key",
            "client.crt",
            "client.key",
        ] {
            assert!(dir.path().join(name).is_file(), "missing {}", name);
        }
        let ca = fs::read_to_string(dir.path().join("ca.crt")).unwrap();
        assert!(ca.starts_with("-----BEGIN CERTIFICATE-----"));
    }
}
