// A node is known to its peers by the BLAKE3 digest of its certificate. There
// is no certificate authority: links are authenticated by TLS against whatever
// certificate the peer presents, and that certificate's digest becomes the
// peer's key. Anything stronger than pinning keys out of band is left to the
// layers above the relay.

use std::{
    fs,
    io::{BufReader, Cursor},
    path::Path,
    sync::Arc,
    time::SystemTime,
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    server::{ClientCertVerified, ClientCertVerifier},
    Certificate, DistinguishedName, PrivateKey, ServerName,
};

use super::{error::TransportError, PeerKey, ALPN, SERVER_NAME};

/// This node's certificate and private key.
#[derive(Clone)]
pub struct NodeIdentity {
    cert: Certificate,
    key: PrivateKey,
    peer_key: PeerKey,
}

impl NodeIdentity {
    pub fn new(cert: Certificate, key: PrivateKey) -> Self {
        let peer_key = key_of(&cert);
        Self {
            cert,
            key,
            peer_key,
        }
    }

    /// Generates a fresh self-signed identity.
    pub fn generate() -> Result<Self, TransportError> {
        let cert = rcgen::generate_simple_self_signed(vec![SERVER_NAME.to_string()])?;
        let der = cert.serialize_der()?;
        Ok(Self::new(
            Certificate(der),
            PrivateKey(cert.serialize_private_key_der()),
        ))
    }

    /// Reads a PEM certificate and a PEM PKCS#8 private key.
    pub fn from_pem(cert: &[u8], key: &[u8]) -> Result<Self, TransportError> {
        let mut certs = rustls_pemfile::certs(&mut BufReader::new(Cursor::new(cert)))?;
        let mut keys =
            rustls_pemfile::pkcs8_private_keys(&mut BufReader::new(Cursor::new(key)))?;
        if certs.len() != 1 {
            return Err(TransportError::BadPem("certificate"));
        }
        if keys.len() != 1 {
            return Err(TransportError::BadPem("private key"));
        }
        Ok(Self::new(
            Certificate(certs.remove(0)),
            PrivateKey(keys.remove(0)),
        ))
    }

    pub fn from_pem_files(
        cert: impl AsRef<Path>,
        key: impl AsRef<Path>,
    ) -> Result<Self, TransportError> {
        Self::from_pem(&fs::read(cert)?, &fs::read(key)?)
    }

    /// The key peers know this node by.
    pub fn peer_key(&self) -> PeerKey {
        self.peer_key
    }

    /// Client and server TLS configurations. Both sides present this node's
    /// certificate and accept any certificate from the other side.
    pub fn tls_config(
        &self,
    ) -> Result<(rustls::ClientConfig, rustls::ServerConfig), rustls::Error> {
        let verifier = Arc::new(AnyPeerCertificate);

        let mut client_config = rustls::ClientConfig::builder()
            .with_safe_defaults()
            .with_custom_certificate_verifier(verifier.clone())
            .with_client_auth_cert(vec![self.cert.clone()], self.key.clone())?;
        client_config.alpn_protocols = vec![ALPN.to_vec()];

        let mut server_config = rustls::ServerConfig::builder()
            .with_safe_defaults()
            .with_client_cert_verifier(verifier)
            .with_single_cert(vec![self.cert.clone()], self.key.clone())?;
        server_config.alpn_protocols = vec![ALPN.to_vec()];

        Ok((client_config, server_config))
    }
}

/// Derives a peer's key from the certificate it presented.
pub fn key_of(cert: &Certificate) -> PeerKey {
    *blake3::hash(&cert.0).as_bytes()
}

/// Requires a certificate from both ends but trusts any of them. The peer's
/// key is taken from the certificate after the handshake.
struct AnyPeerCertificate;

impl ServerCertVerifier for AnyPeerCertificate {
    fn verify_server_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: SystemTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

impl ClientCertVerifier for AnyPeerCertificate {
    fn offer_client_auth(&self) -> bool {
        true
    }

    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn client_auth_root_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &Certificate,
        _intermediates: &[Certificate],
        _now: SystemTime,
    ) -> Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }
}
