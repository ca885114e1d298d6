//! On-disk layout of generated host state
//!
//! Everything devhost generates lives under one root (`~/.devhost` unless
//! `DEVHOST_HOME` is set). All of it is derived state: it can be deleted and
//! rebuilt by reconciling again, except the system-ini ownership records.

use crate::error::{DevhostError, Result};
use std::path::{Path, PathBuf};

/// Environment variable overriding the state root
pub const HOME_ENV: &str = "DEVHOST_HOME";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Paths {
    root: PathBuf,
}

impl Paths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve the state root from `DEVHOST_HOME` or the user's home directory
    pub fn discover() -> Result<Self> {
        if let Ok(home) = std::env::var(HOME_ENV) {
            if !home.is_empty() {
                return Ok(Self::new(home));
            }
        }
        let home = dirs_next::home_dir()
            .ok_or_else(|| DevhostError::config("cannot determine the home directory"))?;
        Ok(Self::new(home.join(".devhost")))
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    pub fn docker_dir(&self) -> PathBuf {
        self.root.join("docker")
    }

    pub fn compose_file(&self) -> PathBuf {
        self.docker_dir().join("docker-compose.yml")
    }

    pub fn varnish_vcl(&self, version: &str) -> PathBuf {
        self.docker_dir().join(format!("varnish-{}.vcl", version))
    }

    pub fn php_dir(&self, version: &str) -> PathBuf {
        self.root.join("php").join(version)
    }

    pub fn pool_dir(&self, version: &str) -> PathBuf {
        self.php_dir(version).join("pools")
    }

    pub fn pool_file(&self, version: &str, project: &str) -> PathBuf {
        self.pool_dir(version).join(format!("{}.conf", project))
    }

    pub fn run_dir(&self) -> PathBuf {
        self.root.join("run")
    }

    pub fn pool_socket(&self, version: &str, project: &str) -> PathBuf {
        self.run_dir().join(format!("php{}-{}.sock", version, project))
    }

    pub fn system_ini_dir(&self, version: &str) -> PathBuf {
        self.php_dir(version).join("system")
    }

    /// Staged host-global settings, rewritten by every claim
    pub fn system_ini_staged(&self, version: &str) -> PathBuf {
        self.system_ini_dir(version).join("devhost-system.ini")
    }

    /// Snapshot that the scan-directory symlink points at
    pub fn system_ini_active(&self, version: &str) -> PathBuf {
        self.system_ini_dir(version).join("devhost-system.active.ini")
    }

    pub fn system_ini_owner(&self, version: &str) -> PathBuf {
        self.system_ini_dir(version).join("owner.json")
    }

    pub fn vhost_dir(&self) -> PathBuf {
        self.root.join("nginx").join("vhosts")
    }

    pub fn vhost_file(&self, project: &str) -> PathBuf {
        self.vhost_dir().join(format!("{}.conf", project))
    }

    pub fn marker_file(&self, project: &str) -> PathBuf {
        self.vhost_dir().join(format!("{}.project.json", project))
    }

    pub fn certs_dir(&self) -> PathBuf {
        self.root.join("certs")
    }

    pub fn ca_dir(&self) -> PathBuf {
        self.certs_dir().join("ca")
    }

    pub fn ca_cert(&self) -> PathBuf {
        self.ca_dir().join("rootCA.pem")
    }

    pub fn ca_key(&self) -> PathBuf {
        self.ca_dir().join("rootCA-key.pem")
    }

    pub fn ca_trusted_marker(&self) -> PathBuf {
        self.ca_dir().join(".trusted")
    }

    pub fn cert_dir(&self, domain: &str) -> PathBuf {
        self.certs_dir().join(domain)
    }

    pub fn cert_file(&self, domain: &str) -> PathBuf {
        self.cert_dir(domain).join("cert.pem")
    }

    pub fn key_file(&self, domain: &str) -> PathBuf {
        self.cert_dir(domain).join("key.pem")
    }

    pub fn project_dir(&self, project: &str) -> PathBuf {
        self.root.join("projects").join(project)
    }

    pub fn logs_dir(&self, project: &str) -> PathBuf {
        self.project_dir(project).join("logs")
    }

    pub fn dns_dir(&self) -> PathBuf {
        self.root.join("dns")
    }

    pub fn dns_state(&self) -> PathBuf {
        self.dns_dir().join("state.json")
    }

    pub fn library_dir(&self) -> PathBuf {
        self.root.join("library")
    }

    /// Flag file for a reload target whose config changed on disk
    pub fn pending_reload(&self, target: &str) -> PathBuf {
        self.root.join("pending").join(target)
    }
}

/// Persistent "written but not yet reloaded" flag for one reload target
///
/// Set when a generated file changes, cleared only after the reload that
/// loads it succeeds. A run that wrote the file but failed to reload
/// leaves the flag behind, so the next run reloads even though the file
/// is already up to date.
#[derive(Debug, Clone)]
pub struct ReloadFlag {
    path: PathBuf,
}

impl ReloadFlag {
    pub fn new(paths: &Paths, target: &str) -> Self {
        Self {
            path: paths.pending_reload(target),
        }
    }

    pub fn is_set(&self) -> bool {
        self.path.exists()
    }

    pub fn set(&self) -> Result<()> {
        write_if_changed(&self.path, "").map(|_| ())
    }

    pub fn clear(&self) -> Result<()> {
        remove_if_exists(&self.path).map(|_| ())
    }
}

/// Write `content` unless the file already holds exactly that
///
/// Returns whether the file changed. Parent directories are created.
pub fn write_if_changed(path: &Path, content: &str) -> Result<bool> {
    if let Ok(existing) = std::fs::read_to_string(path) {
        if existing == content {
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).map_err(|e| DevhostError::io(parent, e))?;
    }
    std::fs::write(path, content).map_err(|e| DevhostError::io(path, e))?;
    Ok(true)
}

/// Remove a file, treating "not found" as success. Returns whether it existed.
pub fn remove_if_exists(path: &Path) -> Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(DevhostError::io(path, e)),
    }
}
