//! TLS transport used to reach a real server.
//!
//! The protocol core only needs an `AsyncRead + AsyncWrite` stream; this
//! module produces one from a [`ConnectionConfig`].

use std::fs::File;
use std::io::{self, BufReader};
use std::path::Path;
use std::sync::Arc;

use tokio::net::TcpStream;
use tokio::time::timeout;
use tokio_rustls::rustls::{
    self,
    client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier},
    pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime},
    DigitallySignedStruct, SignatureScheme,
};
use tokio_rustls::{client::TlsStream, TlsConnector};

use crate::config::ConnectionConfig;
use crate::error::MumbleError;

/// ALPN protocol id announced by Mumble clients.
pub const ALPN_MUMBLE: &[u8] = b"mumble";

/// Connect over TCP and complete the TLS handshake.
pub async fn connect_tls(config: &ConnectionConfig) -> Result<TlsStream<TcpStream>, MumbleError> {
    let addr = format!("{}:{}", config.host, config.port);
    let tcp_stream = match timeout(config.connect_timeout, TcpStream::connect(&addr)).await {
        Ok(Ok(stream)) => stream,
        Ok(Err(err)) => return Err(MumbleError::Network(err)),
        Err(_) => {
            return Err(MumbleError::Network(io::Error::new(
                io::ErrorKind::TimedOut,
                "TCP connect timeout",
            )));
        }
    };
    tcp_stream.set_nodelay(true)?;

    let server_name_str = config.tls_server_name.as_deref().unwrap_or(&config.host);
    let server_name = ServerName::try_from(server_name_str.to_string())
        .map_err(|_| MumbleError::InvalidConfig("invalid TLS server name".into()))?;

    let connector = tls_connector(config)?;
    let handshake = connector.connect(server_name, tcp_stream);
    let tls_stream = match timeout(config.connect_timeout, handshake).await {
        Ok(result) => result?,
        Err(_) => return Err(MumbleError::Timeout("TLS handshake".into())),
    };
    tracing::debug!(%addr, "tls established");
    Ok(tls_stream)
}

/// Build the TLS client configuration described by `config`.
pub fn tls_connector(config: &ConnectionConfig) -> Result<TlsConnector, MumbleError> {
    let builder = rustls::ClientConfig::builder();

    let builder = if config.accept_invalid_certs {
        builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::default()))
    } else {
        let mut root_store = rustls::RootCertStore::empty();
        if let Some(path) = &config.ca_certificate {
            for cert in load_certs(path)? {
                root_store.add(cert)?;
            }
        }
        builder.with_root_certificates(root_store)
    };

    let mut tls = match (&config.client_certificate, &config.client_private_key) {
        (Some(cert), Some(key)) => {
            builder.with_client_auth_cert(load_certs(cert)?, load_private_key(key)?)?
        }
        _ => builder.with_no_client_auth(),
    };
    tls.alpn_protocols.push(ALPN_MUMBLE.to_vec());

    Ok(TlsConnector::from(Arc::new(tls)))
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, MumbleError> {
    let mut reader = BufReader::new(File::open(path)?);
    let certs = rustls_pemfile::certs(&mut reader).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(MumbleError::InvalidConfig(format!(
            "no certificates in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>, MumbleError> {
    let mut reader = BufReader::new(File::open(path)?);
    rustls_pemfile::private_key(&mut reader)?.ok_or_else(|| {
        MumbleError::InvalidConfig(format!("no private key in {}", path.display()))
    })
}

/// Accepts any server certificate. Mumble servers are commonly self-signed.
#[derive(Debug, Default)]
struct NoCertificateVerification;

impl ServerCertVerifier for NoCertificateVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp: &[u8],
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
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
