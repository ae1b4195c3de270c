//! TLS server configuration from PEM files.
//!
//! The leaf certificate file may already contain intermediates; any
//! `certificateChainPaths` entries are appended after it in order. Private keys
//! may be PKCS#1, SEC1 or PKCS#8, or passphrase-protected PKCS#8
//! (`ENCRYPTED PRIVATE KEY`).

use std::sync::Arc;

use anyhow::{anyhow, Context, Result};
use pkcs8::EncryptedPrivateKeyInfo;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use rustls::ServerConfig;

use crate::config::TlsListenerConfig;

const ENCRYPTED_KEY_LABEL: &str = "ENCRYPTED PRIVATE KEY";

/// Read the configured certificate, key and chain files and build the
/// server configuration.
///
/// # Errors
///
/// Returns an error naming the file that could not be read, or any error from
/// [`build_server_config`].
pub fn load_tls_config(cfg: &TlsListenerConfig) -> Result<Arc<ServerConfig>> {
    let cert_pem = read(&cfg.certificate_path)?;
    let key_pem = read(&cfg.private_key_path)?;
    let chain = cfg
        .certificate_chain_paths
        .iter()
        .map(|path| read(path))
        .collect::<Result<Vec<_>>>()?;

    let passphrase = Some(cfg.private_key_passphrase.as_str()).filter(|p| !p.is_empty());
    build_server_config(&cert_pem, &key_pem, passphrase, &chain)
}

fn read(path: &str) -> Result<Vec<u8>> {
    std::fs::read(path).with_context(|| format!("failed to read TLS file {path}"))
}

/// Build a [`rustls::ServerConfig`] from PEM-encoded material.
///
/// # Errors
///
/// Returns an error if a certificate or the key cannot be parsed, the key is
/// encrypted and no passphrase (or the wrong one) was given, or rustls rejects
/// the pair.
pub fn build_server_config(
    cert_pem: &[u8],
    key_pem: &[u8],
    passphrase: Option<&str>,
    chain_pems: &[Vec<u8>],
) -> Result<Arc<ServerConfig>> {
    let certs = load_cert_chain(cert_pem, chain_pems)?;
    let key = parse_private_key(key_pem, passphrase)?;

    let provider = Arc::new(rustls::crypto::ring::default_provider());
    let mut config = ServerConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .context("failed to select TLS protocol versions")?
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .context("failed to build rustls ServerConfig")?;
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(Arc::new(config))
}

/// Leaf file certificates first, then each chain entry in order.
fn load_cert_chain(cert_pem: &[u8], chain_pems: &[Vec<u8>]) -> Result<Vec<CertificateDer<'static>>> {
    let mut certs = parse_certs(cert_pem).context("failed to parse TLS certificate")?;
    if certs.is_empty() {
        anyhow::bail!("no certificate found in PEM data");
    }
    for (i, pem) in chain_pems.iter().enumerate() {
        let chain = parse_certs(pem).with_context(|| format!("failed to parse chain certificate #{i}"))?;
        if chain.is_empty() {
            anyhow::bail!("no certificate found in chain entry #{i}");
        }
        certs.extend(chain);
    }
    Ok(certs)
}

fn parse_certs(pem: &[u8]) -> std::io::Result<Vec<CertificateDer<'static>>> {
    rustls_pemfile::certs(&mut std::io::BufReader::new(pem)).collect()
}

fn parse_private_key(pem: &[u8], passphrase: Option<&str>) -> Result<PrivateKeyDer<'static>> {
    // rustls-pemfile skips labels it does not know, encrypted keys included.
    if let Ok(text) = std::str::from_utf8(pem) {
        for section in pem_sections(text) {
            if pkcs8::der::pem::decode_label(section.as_bytes()).ok() != Some(ENCRYPTED_KEY_LABEL) {
                continue;
            }
            let passphrase =
                passphrase.context("TLS private key is encrypted but no passphrase is configured")?;
            return decrypt_pkcs8(section.as_bytes(), passphrase);
        }
    }

    rustls_pemfile::private_key(&mut std::io::BufReader::new(pem))
        .context("failed to read TLS private key")?
        .context("no private key found in PEM data")
}

fn decrypt_pkcs8(section: &[u8], passphrase: &str) -> Result<PrivateKeyDer<'static>> {
    let (_, der) = pkcs8::der::pem::decode_vec(section)
        .map_err(|e| anyhow!("failed to decode encrypted private key PEM: {e}"))?;
    let info = EncryptedPrivateKeyInfo::try_from(der.as_slice())
        .map_err(|e| anyhow!("malformed encrypted private key: {e}"))?;
    let secret = info
        .decrypt(passphrase.as_bytes())
        .map_err(|e| anyhow!("failed to decrypt TLS private key: {e}"))?;
    Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(
        secret.as_bytes().to_vec(),
    )))
}

/// Split concatenated PEM text after each post-encapsulation boundary, so
/// every chunk holds at most one document plus any preamble before it.
fn pem_sections(text: &str) -> impl Iterator<Item = String> + '_ {
    let mut lines = text.lines();
    std::iter::from_fn(move || {
        let mut section = String::new();
        for line in lines.by_ref() {
            section.push_str(line);
            section.push('\n');
            if line.starts_with("-----END ") {
                return Some(section);
            }
        }
        None
    })
}
