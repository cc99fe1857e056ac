use std::io;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::network::listener::{dial, Listener};
use crate::network::session::DialFn;
use crate::network::BoxedStream;
use crate::{AppError, AppResult};

/// File-based TLS material.
///
/// The server side needs `cert_file` + `key_file`; a `ca_file` there
/// additionally requires client certificates. The client side needs
/// `ca_file` to verify the server; `cert_file` + `key_file` there enable
/// client authentication.
#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub cert_file: Option<PathBuf>,
    pub key_file: Option<PathBuf>,
    pub ca_file: Option<PathBuf>,
}

/// Builds a server-side TLS config from PEM files.
pub fn server_config(options: &TlsOptions) -> AppResult<ServerConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let (cert_file, key_file) = match (&options.cert_file, &options.key_file) {
        (Some(cert), Some(key)) => (cert, key),
        _ => {
            return Err(AppError::Tls(
                "server tls requires a certificate and a private key".to_string(),
            ))
        }
    };
    let certs = load_certs(cert_file)?;
    let key = load_private_key(key_file)?;

    let builder = ServerConfig::builder();
    let config = match &options.ca_file {
        Some(ca_file) => {
            let verifier = WebPkiClientVerifier::builder(Arc::new(root_store(ca_file)?))
                .build()
                .map_err(|e| AppError::Tls(format!("client verifier: {e}")))?;
            builder
                .with_client_cert_verifier(verifier)
                .with_single_cert(certs, key)
        }
        None => builder.with_no_client_auth().with_single_cert(certs, key),
    }
    .map_err(|e| AppError::Tls(format!("server config: {e}")))?;
    Ok(config)
}

/// Builds a client-side TLS config from PEM files.
pub fn client_config(options: &TlsOptions) -> AppResult<ClientConfig> {
    let _ = rustls::crypto::ring::default_provider().install_default();

    let ca_file = options
        .ca_file
        .as_ref()
        .ok_or_else(|| AppError::Tls("client tls requires a ca bundle".to_string()))?;
    let builder = ClientConfig::builder().with_root_certificates(root_store(ca_file)?);

    let config = match (&options.cert_file, &options.key_file) {
        (Some(cert_file), Some(key_file)) => builder
            .with_client_auth_cert(load_certs(cert_file)?, load_private_key(key_file)?)
            .map_err(|e| AppError::Tls(format!("client config: {e}")))?,
        _ => builder.with_no_client_auth(),
    };
    Ok(config)
}

/// Wraps an accept source so every accepted stream is TLS from the first
/// byte.
pub struct TlsListener {
    inner: Box<dyn Listener>,
    acceptor: TlsAcceptor,
}

impl TlsListener {
    pub fn new(inner: Box<dyn Listener>, config: ServerConfig) -> Self {
        TlsListener {
            inner,
            acceptor: TlsAcceptor::from(Arc::new(config)),
        }
    }
}

#[async_trait]
impl Listener for TlsListener {
    async fn accept(&self) -> io::Result<(BoxedStream, String)> {
        let (stream, peer) = self.inner.accept().await?;
        let stream = self.acceptor.accept(stream).await?;
        Ok((Box::new(stream), peer))
    }

    fn local_addr(&self) -> String {
        self.inner.local_addr()
    }
}

/// Builds a session dial override that runs the TLS handshake on top of
/// the plain connection.
pub fn tls_dialer(config: ClientConfig, domain: &str) -> AppResult<DialFn> {
    let connector = TlsConnector::from(Arc::new(config));
    let server_name = if let Ok(ip) = domain.parse::<IpAddr>() {
        ServerName::IpAddress(ip.into())
    } else {
        ServerName::try_from(domain.to_string())
            .map_err(|e| AppError::Tls(format!("invalid domain {domain}: {e}")))?
    };

    Ok(Arc::new(move |address: String| {
        let connector = connector.clone();
        let server_name = server_name.clone();
        Box::pin(async move {
            let stream = dial(&address).await?;
            let stream = connector.connect(server_name, stream).await?;
            Ok(Box::new(stream) as BoxedStream)
        })
    }))
}

fn root_store(ca_file: &Path) -> AppResult<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(ca_file)? {
        roots
            .add(cert)
            .map_err(|e| AppError::Tls(format!("bad ca certificate: {e}")))?;
    }
    Ok(roots)
}

fn load_certs(path: &Path) -> AppResult<Vec<CertificateDer<'static>>> {
    let pem = std::fs::read(path)?;
    let certs = rustls_pemfile::certs(&mut io::Cursor::new(pem)).collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(AppError::Tls(format!(
            "no certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> AppResult<PrivateKeyDer<'static>> {
    let pem = std::fs::read(path)?;
    rustls_pemfile::private_key(&mut io::Cursor::new(pem))?
        .ok_or_else(|| AppError::Tls(format!("no private key found in {}", path.display())))
}
