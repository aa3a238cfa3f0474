use anyhow::{Context, Result, anyhow};
use rustls::crypto::CryptoProvider;
use rustls::crypto::aws_lc_rs::{cipher_suite, default_provider, kx_group};
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use rustls_pemfile::certs;
use std::{fs::File, io::BufReader, path::Path, sync::Arc};
use tokio_rustls::TlsConnector;

use crate::config::TlsSettings;

/// Fixed filename of the CA bundle inside the configured certs directory.
pub const CA_BUNDLE_FILE: &str = "cacert.pem";

/// Everything a session needs to wrap its upstream connection in TLS.
/// Built once at startup and shared read-only between sessions.
pub struct TlsContext {
    pub connector: TlsConnector,
    pub server_name: ServerName<'static>,
}

impl std::fmt::Debug for TlsContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsContext")
            .field("server_name", &self.server_name)
            .finish_non_exhaustive()
    }
}

/// Loads the CA bundle from `certs_dir` and builds the hardened client
/// config: TLS 1.2 minimum, ECDHE AES-256-GCM suites only, P-384 before
/// P-256. These choices are fixed at build time, not runtime-negotiable.
pub fn build_tls_context(settings: &TlsSettings, target_host: &str) -> Result<TlsContext> {
    let ca_path = Path::new(&settings.certs_dir).join(CA_BUNDLE_FILE);
    let ca_file = File::open(&ca_path)
        .with_context(|| format!("Failed to open CA bundle: {}", ca_path.display()))?;

    let ca_certs = certs(&mut BufReader::new(ca_file))
        .collect::<Result<Vec<_>, _>>()
        .with_context(|| format!("Failed to parse CA bundle: {}", ca_path.display()))?;

    if ca_certs.is_empty() {
        return Err(anyhow!(
            "No certificates found in CA bundle: {}",
            ca_path.display()
        ));
    }

    let mut roots = RootCertStore::empty();
    for cert in ca_certs {
        roots
            .add(cert)
            .context("Failed to add CA certificate to root store")?;
    }

    let provider = CryptoProvider {
        cipher_suites: vec![
            cipher_suite::TLS_ECDHE_RSA_WITH_AES_256_GCM_SHA384,
            cipher_suite::TLS_ECDHE_ECDSA_WITH_AES_256_GCM_SHA384,
        ],
        kx_groups: vec![kx_group::SECP384R1, kx_group::SECP256R1],
        ..default_provider()
    };

    let config = ClientConfig::builder_with_provider(Arc::new(provider))
        .with_protocol_versions(&[&rustls::version::TLS12])
        .context("Failed to create TLS client config")?
        .with_root_certificates(roots)
        .with_no_client_auth();

    let name = verification_server_name(settings, target_host);
    let server_name = ServerName::try_from(name.clone())
        .map_err(|_| anyhow!("Invalid TLS server name: {name}"))?;

    Ok(TlsContext {
        connector: TlsConnector::from(Arc::new(config)),
        server_name,
    })
}

/// The override wins when non-empty, else the target host is verified.
fn verification_server_name(settings: &TlsSettings, target_host: &str) -> String {
    match settings.server_name.as_deref() {
        Some(name) if !name.is_empty() => name.to_string(),
        _ => target_host.to_string(),
    }
}
