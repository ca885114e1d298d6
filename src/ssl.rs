//! Local certificate authority and per-domain certificates

use crate::error::{Component, DevhostError, Result};
use crate::paths::Paths;
use crate::runner::{run_checked, CommandRunner, CommandSpec};
use chrono::{Datelike, Duration, NaiveDate, Utc};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Leaf lifetime; clients reject locally issued server certs above 825 days
const LEAF_VALIDITY_DAYS: i64 = 800;

/// Certificate and key locations for one domain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertPaths {
    pub cert: PathBuf,
    pub key: PathBuf,
    pub created: bool,
}

fn ssl_err(e: impl std::fmt::Display) -> DevhostError {
    DevhostError::tool(Component::Ssl, e.to_string())
}

fn ymd(date: NaiveDate) -> Result<(i32, u8, u8)> {
    let month = u8::try_from(date.month()).map_err(ssl_err)?;
    let day = u8::try_from(date.day()).map_err(ssl_err)?;
    Ok((date.year(), month, day))
}

fn ca_params() -> CertificateParams {
    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, "devhost Development CA");
    dn.push(DnType::OrganizationName, "devhost");
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
    params.key_usages = vec![
        KeyUsagePurpose::KeyCertSign,
        KeyUsagePurpose::CrlSign,
        KeyUsagePurpose::DigitalSignature,
    ];
    params
}

/// Rebuild the CA certificate object from its key for signing
fn load_issuer(key_pem: &str) -> Result<(Certificate, KeyPair)> {
    let key = KeyPair::from_pem(key_pem).map_err(ssl_err)?;
    let cert = ca_params().self_signed(&key).map_err(ssl_err)?;
    Ok((cert, key))
}

fn issue_leaf(domain: &str, ca_key_pem: &str) -> Result<(String, String)> {
    let (ca_cert, ca_key) = load_issuer(ca_key_pem)?;

    let mut params = CertificateParams::new(vec![domain.to_string()]).map_err(ssl_err)?;
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain);
    dn.push(DnType::OrganizationName, "devhost");
    params.distinguished_name = dn;
    params.key_usages = vec![
        KeyUsagePurpose::DigitalSignature,
        KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];

    let today = Utc::now().date_naive();
    let (y, m, d) = ymd(today - Duration::days(1))?;
    params.not_before = rcgen::date_time_ymd(y, m, d);
    let (y, m, d) = ymd(today + Duration::days(LEAF_VALIDITY_DAYS))?;
    params.not_after = rcgen::date_time_ymd(y, m, d);

    let key = KeyPair::generate().map_err(ssl_err)?;
    let cert = params.signed_by(&key, &ca_cert, &ca_key).map_err(ssl_err)?;
    Ok((cert.pem(), key.serialize_pem()))
}

async fn write_private(path: &Path, content: String) -> Result<()> {
    tokio::fs::write(path, content)
        .await
        .map_err(|e| DevhostError::io(path, e))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
            .await
            .map_err(|e| DevhostError::io(path, e))?;
    }

    Ok(())
}

pub struct SslManager {
    paths: Paths,
    trust_command: String,
    runner: Arc<dyn CommandRunner>,
}

impl SslManager {
    pub fn new(paths: Paths, trust_command: &str, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            paths,
            trust_command: trust_command.to_string(),
            runner,
        }
    }

    /// Create the local CA unless it exists. Returns whether it was created.
    pub async fn ensure_ca(&self) -> Result<bool> {
        let cert_path = self.paths.ca_cert();
        let key_path = self.paths.ca_key();

        match (cert_path.exists(), key_path.exists()) {
            (true, true) => return Ok(false),
            (false, false) => {}
            _ => {
                return Err(DevhostError::tool(
                    Component::Ssl,
                    format!(
                        "local CA in {} is incomplete; remove it to regenerate",
                        self.paths.ca_dir().display()
                    ),
                ))
            }
        }

        let ca_dir = self.paths.ca_dir();
        tokio::fs::create_dir_all(&ca_dir)
            .await
            .map_err(|e| DevhostError::io(&ca_dir, e))?;

        let (cert_pem, key_pem) = tokio::task::spawn_blocking(|| -> Result<(String, String)> {
            let key = KeyPair::generate().map_err(ssl_err)?;
            let cert = ca_params().self_signed(&key).map_err(ssl_err)?;
            Ok((cert.pem(), key.serialize_pem()))
        })
        .await
        .map_err(ssl_err)??;

        write_private(&key_path, key_pem).await?;
        tokio::fs::write(&cert_path, cert_pem)
            .await
            .map_err(|e| DevhostError::io(&cert_path, e))?;

        info!(path = %cert_path.display(), "Generated local certificate authority");
        Ok(true)
    }

    pub fn is_trusted(&self) -> bool {
        self.paths.ca_trusted_marker().exists()
    }

    pub fn trust_spec(&self) -> Result<CommandSpec> {
        let ca = self.paths.ca_cert().display().to_string();
        Ok(CommandSpec::from_template(&self.trust_command, &[("ca_cert", ca.as_str())])?.privileged())
    }

    /// Install the CA into the OS trust store once per host
    ///
    /// Returns whether the trust command ran. The marker is only written
    /// after it succeeds, so a failed attempt is retried next time.
    pub async fn ensure_trusted(&self) -> Result<bool> {
        if self.is_trusted() {
            return Ok(false);
        }
        run_checked(self.runner.as_ref(), &self.trust_spec()?, Component::Ssl).await?;

        let marker = self.paths.ca_trusted_marker();
        tokio::fs::write(&marker, Utc::now().to_rfc3339())
            .await
            .map_err(|e| DevhostError::io(&marker, e))?;
        info!("Local certificate authority trusted by the system");
        Ok(true)
    }

    /// Issue a certificate for `domain` unless one is already on disk
    pub async fn ensure_certificate(&self, domain: &str) -> Result<CertPaths> {
        let cert = self.paths.cert_file(domain);
        let key = self.paths.key_file(domain);

        if cert.exists() && key.exists() {
            debug!(domain, "Certificate exists");
            return Ok(CertPaths {
                cert,
                key,
                created: false,
            });
        }

        let ca_key_path = self.paths.ca_key();
        let ca_key_pem = tokio::fs::read_to_string(&ca_key_path)
            .await
            .map_err(|e| DevhostError::io(&ca_key_path, e))?;

        let owned_domain = domain.to_string();
        let (cert_pem, key_pem) =
            tokio::task::spawn_blocking(move || issue_leaf(&owned_domain, &ca_key_pem))
                .await
                .map_err(ssl_err)??;

        let dir = self.paths.cert_dir(domain);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| DevhostError::io(&dir, e))?;
        write_private(&key, key_pem).await?;
        tokio::fs::write(&cert, cert_pem)
            .await
            .map_err(|e| DevhostError::io(&cert, e))?;

        info!(domain, path = %cert.display(), "Issued certificate");
        Ok(CertPaths {
            cert,
            key,
            created: true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[derive(Default)]
    struct TrustStub {
        calls: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl CommandRunner for TrustStub {
        async fn run(&self, _spec: &CommandSpec) -> Result<CommandOutput> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                Ok(CommandOutput::failed(1, "keychain locked"))
            } else {
                Ok(CommandOutput::ok())
            }
        }
    }

    fn manager(dir: &TempDir, runner: Arc<TrustStub>) -> SslManager {
        SslManager::new(Paths::new(dir.path()), "trust {ca_cert}", runner)
    }

    #[tokio::test]
    async fn test_ca_created_once() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Arc::new(TrustStub::default()));
        assert!(manager.ensure_ca().await.unwrap());
        let first = std::fs::read(manager.paths.ca_cert()).unwrap();
        assert!(!manager.ensure_ca().await.unwrap());
        assert_eq!(std::fs::read(manager.paths.ca_cert()).unwrap(), first);
    }

    #[tokio::test]
    async fn test_partial_ca_is_error() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Arc::new(TrustStub::default()));
        std::fs::create_dir_all(manager.paths.ca_dir()).unwrap();
        std::fs::write(manager.paths.ca_cert(), "x").unwrap();
        assert!(manager.ensure_ca().await.is_err());
    }

    #[tokio::test]
    async fn test_certificate_issued_only_when_absent() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Arc::new(TrustStub::default()));
        manager.ensure_ca().await.unwrap();

        let issued = manager.ensure_certificate("shop.test").await.unwrap();
        assert!(issued.created);
        let pem = std::fs::read_to_string(&issued.cert).unwrap();
        assert!(pem.starts_with("-----BEGIN CERTIFICATE-----"));

        let again = manager.ensure_certificate("shop.test").await.unwrap();
        assert!(!again.created);
        assert_eq!(std::fs::read_to_string(&again.cert).unwrap(), pem);

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&issued.key).unwrap().permissions().mode();
            assert_eq!(mode & 0o777, 0o600);
        }
    }

    #[tokio::test]
    async fn test_trust_runs_once() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(TrustStub::default());
        let manager = manager(&dir, runner.clone());
        manager.ensure_ca().await.unwrap();

        assert!(manager.ensure_trusted().await.unwrap());
        assert!(!manager.ensure_trusted().await.unwrap());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_failed_trust_is_retried() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(TrustStub {
            fail: true,
            ..Default::default()
        });
        let manager = manager(&dir, runner.clone());
        manager.ensure_ca().await.unwrap();

        let err = manager.ensure_trusted().await.unwrap_err();
        assert!(err.to_string().contains("keychain locked"));
        assert!(!manager.is_trusted());
        assert!(manager.ensure_trusted().await.is_err());
        assert_eq!(runner.calls.load(Ordering::SeqCst), 2);
    }
}
