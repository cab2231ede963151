use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

/// Certificate and key for serving HTTPS. Browsers only allow camera capture
/// on a secure origin, so phones on the LAN need this.
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
}

impl TlsConfig {
    /// Explicit paths win; otherwise the pair lives in the data directory.
    pub fn resolve(
        data_dir: &Path,
        cert_path: Option<PathBuf>,
        key_path: Option<PathBuf>,
    ) -> Result<Self> {
        let dir = data_dir.join("tls");
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create TLS directory: {}", dir.display()))?;
        Ok(Self {
            cert_path: cert_path.unwrap_or_else(|| dir.join("cert.pem")),
            key_path: key_path.unwrap_or_else(|| dir.join("key.pem")),
        })
    }

    /// Reuse the existing pair or generate one covering `hosts`.
    /// Returns the SHA-256 fingerprint.
    pub fn ensure(&self, hosts: &[String]) -> Result<String> {
        if self.cert_path.exists() && self.key_path.exists() {
            fingerprint_from_pem_file(&self.cert_path)
        } else {
            tracing::info!(path = %self.cert_path.display(), "generating self-signed TLS certificate");
            generate_self_signed_cert(&self.cert_path, &self.key_path, hosts)
        }
    }
}

/// Subject names for a local certificate: loopback plus any extra host
/// (typically the LAN address phones connect to), without duplicates.
fn subject_names(hosts: &[String]) -> Vec<String> {
    let mut names = vec!["localhost".to_string(), "127.0.0.1".to_string()];
    for host in hosts {
        let host = host.trim();
        if !host.is_empty() && host != "0.0.0.0" && !names.iter().any(|n| n == host) {
            names.push(host.to_string());
        }
    }
    names
}

/// IP literals among the names become IP SANs, the rest DNS names.
pub fn generate_self_signed_cert(
    cert_path: &Path,
    key_path: &Path,
    hosts: &[String],
) -> Result<String> {
    let mut params = rcgen::CertificateParams::new(subject_names(hosts))
        .context("failed to create certificate params")?;

    params
        .distinguished_name
        .push(rcgen::DnType::CommonName, "fieldsync self-signed");
    params
        .distinguished_name
        .push(rcgen::DnType::OrganizationName, "fieldsync");

    let key_pair = rcgen::KeyPair::generate().context("failed to generate key pair")?;
    let cert = params
        .self_signed(&key_pair)
        .context("failed to generate self-signed certificate")?;

    let fingerprint = sha256_fingerprint(cert.der());

    std::fs::write(cert_path, cert.pem())
        .with_context(|| format!("Failed to write certificate to {}", cert_path.display()))?;
    std::fs::write(key_path, key_pair.serialize_pem())
        .with_context(|| format!("Failed to write private key to {}", key_path.display()))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(key_path, std::fs::Permissions::from_mode(0o600))
            .context("Failed to set private key permissions")?;
    }

    Ok(fingerprint)
}

fn sha256_fingerprint(der: &[u8]) -> String {
    let hash = Sha256::digest(der);
    hash.iter()
        .map(|b| format!("{b:02X}"))
        .collect::<Vec<_>>()
        .join(":")
}

pub fn fingerprint_from_pem_file(cert_path: &Path) -> Result<String> {
    let pem_data = std::fs::read(cert_path)
        .with_context(|| format!("Failed to read certificate from {}", cert_path.display()))?;

    let mut reader = std::io::BufReader::new(pem_data.as_slice());
    let certs: Vec<_> =
        rustls_pemfile::certs(&mut reader).collect::<std::result::Result<_, _>>()?;

    let cert = certs.first().context("No certificate found in PEM file")?;

    Ok(sha256_fingerprint(cert.as_ref()))
}
