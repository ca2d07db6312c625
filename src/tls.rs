use anyhow::{anyhow, bail, Context, Result};
use std::fs;
use std::io::BufReader;
use std::net::IpAddr;
use std::path::Path;
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use rustls::server::WebPkiClientVerifier;
use rustls::RootCertStore;
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsSettings;

/// Both halves of a mutual-TLS identity. Every Kraken process can be TLS server
/// (coordinator control listener, worker data-plane listener) and TLS client.
pub struct TlsContext {
    pub acceptor: TlsAcceptor,
    pub connector: TlsConnector,
    /// Identity expected from the peer we dial; `None` means the dialed host
    pub server_name: Option<String>,
}

impl TlsContext {
    pub fn from_settings(settings: &TlsSettings) -> Result<Self> {
        let roots = load_roots(&settings.ca)?;
        let certs = load_certs(&settings.cert)?;
        let key = load_private_key(&settings.key)?;

        let server = build_server_config(roots.clone(), certs.clone(), key.clone_key())?;
        let client = build_client_config(roots, certs, key)?;
        Ok(TlsContext {
            acceptor: TlsAcceptor::from(Arc::new(server)),
            connector: TlsConnector::from(Arc::new(client)),
            server_name: settings.server_name.clone(),
        })
    }

    pub fn server_name_for(&self, dialed_host: &str) -> Result<ServerName<'static>> {
        server_name_for(self.server_name.as_deref().unwrap_or(dialed_host))
    }
}

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open cert {}", path.display()))?,
    );
    let mut out = Vec::new();
    for c in rustls_pemfile::certs(&mut rd) {
        out.push(c.with_context(|| format!("read cert {}", path.display()))?);
    }
    if out.is_empty() {
        bail!("no certificates found in {}", path.display());
    }
    Ok(out)
}

pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut rd = BufReader::new(
        fs::File::open(path).with_context(|| format!("open key {}", path.display()))?,
    );
    // PKCS#8, PKCS#1 and SEC1 keys are all accepted
    rustls_pemfile::private_key(&mut rd)
        .with_context(|| format!("read key {}", path.display()))?
        .ok_or_else(|| anyhow!("no private key found in {}", path.display()))
}

pub fn load_roots(path: &Path) -> Result<RootCertStore> {
    let mut roots = RootCertStore::empty();
    for cert in load_certs(path)? {
        roots
            .add(cert)
            .with_context(|| format!("add CA certificate from {}", path.display()))?;
    }
    Ok(roots)
}

/// Server side of mutual TLS: client certificates are mandatory and must chain to `roots`
pub fn build_server_config(
    roots: RootCertStore,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ServerConfig> {
    let verifier = WebPkiClientVerifier::builder(Arc::new(roots))
        .build()
        .context("build client certificate verifier")?;
    rustls::ServerConfig::builder()
        .with_client_cert_verifier(verifier)
        .with_single_cert(certs, key)
        .context("build server tls config")
}

pub fn build_client_config(
    roots: RootCertStore,
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<rustls::ClientConfig> {
    rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_client_auth_cert(certs, key)
        .context("build client tls config")
}

pub fn server_name_for(host: &str) -> Result<ServerName<'static>> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(ServerName::IpAddress(ip.into()));
    }
    ServerName::try_from(host.to_string()).map_err(|_| anyhow!("invalid TLS server name {:?}", host))
}
