//! Ownership of the host-global PHP settings file
//!
//! There is one global settings file per PHP version. Projects claim it
//! by declaring host-global directives; the last claimant wins and the
//! previous owner is reported. Claiming only stages content. Putting it
//! into effect is a separate, privileged `enable` step that snapshots the
//! staged file and links the snapshot into the runtime's scan directory,
//! so a later claim never silently changes what the runtime loads.

use crate::error::{Component, DevhostError, Result};
use crate::paths::{self, Paths};
use crate::php::settings::render_system_ini;
use crate::runner::{run_checked, CommandRunner, CommandSpec};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Name of the link placed in the runtime's scan directory
pub const LINK_NAME: &str = "99-devhost-system.ini";

/// Record of which project owns a version's host-global settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SystemIniOwner {
    pub project_name: String,
    pub project_path: PathBuf,
    pub settings: BTreeMap<String, String>,
    pub updated_at: DateTime<Utc>,
}

impl SystemIniOwner {
    fn same_project(&self, name: &str, path: &Path) -> bool {
        self.project_name == name && self.project_path == path
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// Same owner, same settings; nothing was written
    Unchanged,
    /// No previous owner
    Created,
    /// Same owner, new settings
    Updated,
    /// Another project owned the file and was displaced
    Replaced { previous: SystemIniOwner },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase", tag = "state")]
pub enum ActivationState {
    /// No link in the scan directory
    Inactive,
    /// Linked to our snapshot; `stale` when staged content has moved on
    Active { stale: bool },
    /// Something else occupies the link path
    Foreign { target: Option<PathBuf> },
}

pub struct SystemIniArbiter {
    paths: Paths,
    scan_dir: String,
    privilege: Option<String>,
    runner: Arc<dyn CommandRunner>,
}

impl SystemIniArbiter {
    /// `scan_dir` may contain `{version}`
    pub fn new(
        paths: Paths,
        scan_dir: &str,
        privilege: Option<&str>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            paths,
            scan_dir: scan_dir.to_string(),
            privilege: privilege.map(str::to_string),
            runner,
        }
    }

    pub fn link_path(&self, version: &str) -> PathBuf {
        PathBuf::from(self.scan_dir.replace("{version}", version)).join(LINK_NAME)
    }

    pub fn staged_path(&self, version: &str) -> PathBuf {
        self.paths.system_ini_staged(version)
    }

    pub fn current_owner(&self, version: &str) -> Result<Option<SystemIniOwner>> {
        let path = self.paths.system_ini_owner(version);
        let content = match std::fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(DevhostError::io(&path, e)),
        };
        serde_json::from_str(&content)
            .map(Some)
            .map_err(|e| DevhostError::parse(&path, e))
    }

    /// Record `project` as owner of `version`'s host-global settings
    pub fn claim(
        &self,
        version: &str,
        project: &str,
        project_path: &Path,
        settings: &BTreeMap<String, String>,
    ) -> Result<ClaimOutcome> {
        let previous = self.current_owner(version)?;
        let staged = render_system_ini(project, settings);

        if let Some(owner) = &previous {
            if owner.same_project(project, project_path) && owner.settings == *settings {
                paths::write_if_changed(&self.staged_path(version), &staged)?;
                return Ok(ClaimOutcome::Unchanged);
            }
        }

        paths::write_if_changed(&self.staged_path(version), &staged)?;

        let record = SystemIniOwner {
            project_name: project.to_string(),
            project_path: project_path.to_path_buf(),
            settings: settings.clone(),
            updated_at: Utc::now(),
        };
        let json = serde_json::to_string_pretty(&record)
            .map_err(|e| DevhostError::parse(self.paths.system_ini_owner(version), e))?;
        paths::write_if_changed(&self.paths.system_ini_owner(version), &format!("{}\n", json))?;

        let outcome = match previous {
            None => ClaimOutcome::Created,
            Some(owner) if owner.same_project(project, project_path) => ClaimOutcome::Updated,
            Some(owner) => {
                warn!(
                    php = version,
                    project,
                    previous = %owner.project_name,
                    "Host-global PHP settings changed owner"
                );
                ClaimOutcome::Replaced { previous: owner }
            }
        };
        info!(php = version, project, settings = settings.len(), "Staged host-global PHP settings");
        Ok(outcome)
    }

    pub fn activation_state(&self, version: &str) -> ActivationState {
        let link = self.link_path(version);
        let active = self.paths.system_ini_active(version);

        match std::fs::read_link(&link) {
            Ok(target) if target == active => {
                let staged = std::fs::read(self.staged_path(version)).ok();
                let snapshot = std::fs::read(&active).ok();
                ActivationState::Active {
                    stale: staged.is_none() || staged != snapshot,
                }
            }
            Ok(target) => ActivationState::Foreign {
                target: Some(target),
            },
            Err(_) if link.symlink_metadata().is_ok() => ActivationState::Foreign { target: None },
            Err(_) => ActivationState::Inactive,
        }
    }

    fn link_spec(&self, version: &str) -> CommandSpec {
        CommandSpec::new("ln")
            .arg("-sfn")
            .arg(self.paths.system_ini_active(version).display().to_string())
            .arg(self.link_path(version).display().to_string())
            .privileged()
    }

    fn unlink_spec(&self, version: &str) -> CommandSpec {
        CommandSpec::new("rm")
            .arg("-f")
            .arg(self.link_path(version).display().to_string())
            .privileged()
    }

    /// Exact command line that activates the staged settings by hand
    pub fn enable_command(&self, version: &str) -> String {
        let copy = CommandSpec::new("cp")
            .arg(self.staged_path(version).display().to_string())
            .arg(self.paths.system_ini_active(version).display().to_string());
        format!(
            "{} && {}",
            copy.display(),
            self.link_spec(version).manual(self.privilege.as_deref())
        )
    }

    /// Exact command line that deactivates the settings by hand
    pub fn disable_command(&self, version: &str) -> String {
        self.unlink_spec(version).manual(self.privilege.as_deref())
    }

    /// Snapshot the staged file and link it into the scan directory
    pub async fn enable(&self, version: &str) -> Result<()> {
        let staged = self.staged_path(version);
        if !staged.is_file() {
            return Err(DevhostError::tool(
                Component::SystemIni,
                format!("no project has claimed host-global settings for PHP {}", version),
            ));
        }
        if let ActivationState::Foreign { target } = self.activation_state(version) {
            return Err(DevhostError::tool(
                Component::SystemIni,
                format!(
                    "{} is managed by something else ({}); remove it first",
                    self.link_path(version).display(),
                    target.map_or_else(|| "regular file".to_string(), |t| t.display().to_string())
                ),
            ));
        }

        let active = self.paths.system_ini_active(version);
        tokio::fs::copy(&staged, &active)
            .await
            .map_err(|e| DevhostError::io(&active, e))?;
        run_checked(self.runner.as_ref(), &self.link_spec(version), Component::SystemIni).await?;

        info!(php = version, link = %self.link_path(version).display(), "Activated host-global PHP settings");
        Ok(())
    }

    /// Remove our link from the scan directory. Returns whether one was removed.
    pub async fn disable(&self, version: &str) -> Result<bool> {
        match self.activation_state(version) {
            ActivationState::Inactive => Ok(false),
            ActivationState::Foreign { .. } => Err(DevhostError::tool(
                Component::SystemIni,
                format!(
                    "{} is not managed by devhost; leaving it in place",
                    self.link_path(version).display()
                ),
            )),
            ActivationState::Active { .. } => {
                run_checked(self.runner.as_ref(), &self.unlink_spec(version), Component::SystemIni)
                    .await?;
                info!(php = version, "Deactivated host-global PHP settings");
                Ok(true)
            }
        }
    }

    /// Forget the owner and staged settings
    ///
    /// An active link is left alone; `disable` removes it.
    pub fn clear(&self, version: &str) -> Result<bool> {
        let owner = paths::remove_if_exists(&self.paths.system_ini_owner(version))?;
        let staged = paths::remove_if_exists(&self.staged_path(version))?;
        if owner || staged {
            info!(php = version, "Cleared host-global PHP settings ownership");
        }
        Ok(owner || staged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::SystemRunner;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        arbiter: SystemIniArbiter,
        paths: Paths,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path().join("state"));
        let scan = dir.path().join("php/{version}/conf.d");
        std::fs::create_dir_all(dir.path().join("php/8.3/conf.d")).unwrap();
        let arbiter = SystemIniArbiter::new(
            paths.clone(),
            &scan.display().to_string(),
            None,
            Arc::new(SystemRunner::new(None)),
        );
        Fixture {
            _dir: dir,
            arbiter,
            paths,
        }
    }

    fn settings(pairs: &[(&str, &str)]) -> BTreeMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_claim_lifecycle() {
        let f = fixture();
        let a = settings(&[("opcache.preload", "/a/preload.php")]);

        assert_eq!(
            f.arbiter.claim("8.3", "a", Path::new("/a"), &a).unwrap(),
            ClaimOutcome::Created
        );
        assert_eq!(
            f.arbiter.claim("8.3", "a", Path::new("/a"), &a).unwrap(),
            ClaimOutcome::Unchanged
        );

        let a2 = settings(&[("opcache.preload", "/a/other.php")]);
        assert_eq!(
            f.arbiter.claim("8.3", "a", Path::new("/a"), &a2).unwrap(),
            ClaimOutcome::Updated
        );

        let b = settings(&[("opcache.memory_consumption", "512")]);
        match f.arbiter.claim("8.3", "b", Path::new("/b"), &b).unwrap() {
            ClaimOutcome::Replaced { previous } => assert_eq!(previous.project_name, "a"),
            other => panic!("expected replacement, got {:?}", other),
        }

        let owner = f.arbiter.current_owner("8.3").unwrap().unwrap();
        assert_eq!(owner.project_name, "b");
        assert_eq!(owner.settings, b);

        let staged = std::fs::read_to_string(f.arbiter.staged_path("8.3")).unwrap();
        assert!(staged.contains("opcache.memory_consumption = 512"));
        assert!(!staged.contains("opcache.preload"));
    }

    #[test]
    fn test_unchanged_claim_keeps_record_bytes() {
        let f = fixture();
        let a = settings(&[("opcache.preload", "/a/preload.php")]);
        f.arbiter.claim("8.3", "a", Path::new("/a"), &a).unwrap();
        let before = std::fs::read(f.paths.system_ini_owner("8.3")).unwrap();
        f.arbiter.claim("8.3", "a", Path::new("/a"), &a).unwrap();
        let after = std::fs::read(f.paths.system_ini_owner("8.3")).unwrap();
        assert_eq!(before, after);
    }

    #[test]
    fn test_versions_are_independent() {
        let f = fixture();
        let a = settings(&[("opcache.preload", "/a/preload.php")]);
        f.arbiter.claim("8.3", "a", Path::new("/a"), &a).unwrap();
        assert!(f.arbiter.current_owner("8.2").unwrap().is_none());
    }

    #[tokio::test]
    async fn test_enable_then_reclaim_leaves_activation_stale() {
        let f = fixture();
        assert_eq!(f.arbiter.activation_state("8.3"), ActivationState::Inactive);

        let a = settings(&[("opcache.preload", "/a/preload.php")]);
        f.arbiter.claim("8.3", "a", Path::new("/a"), &a).unwrap();
        f.arbiter.enable("8.3").await.unwrap();
        assert_eq!(
            f.arbiter.activation_state("8.3"),
            ActivationState::Active { stale: false }
        );

        let b = settings(&[("opcache.preload", "/b/preload.php")]);
        f.arbiter.claim("8.3", "b", Path::new("/b"), &b).unwrap();
        assert_eq!(
            f.arbiter.activation_state("8.3"),
            ActivationState::Active { stale: true }
        );
        let live = std::fs::read_to_string(f.arbiter.link_path("8.3")).unwrap();
        assert!(live.contains("/a/preload.php"));

        assert!(f.arbiter.disable("8.3").await.unwrap());
        assert_eq!(f.arbiter.activation_state("8.3"), ActivationState::Inactive);
    }

    #[tokio::test]
    async fn test_enable_without_claim_fails() {
        let f = fixture();
        assert!(f.arbiter.enable("8.3").await.is_err());
    }

    #[tokio::test]
    async fn test_foreign_link_is_left_alone() {
        let f = fixture();
        std::fs::write(f.arbiter.link_path("8.3"), "; hand written\n").unwrap();
        assert_eq!(
            f.arbiter.activation_state("8.3"),
            ActivationState::Foreign { target: None }
        );
        assert!(f.arbiter.disable("8.3").await.is_err());
        assert!(f.arbiter.link_path("8.3").exists());
    }

    #[test]
    fn test_manual_commands() {
        let dir = TempDir::new().unwrap();
        let arbiter = SystemIniArbiter::new(
            Paths::new(dir.path()),
            "/etc/php/{version}/fpm/conf.d",
            Some("sudo"),
            Arc::new(SystemRunner::new(None)),
        );
        let enable = arbiter.enable_command("8.3");
        assert!(enable.contains("&& sudo ln -sfn"));
        assert!(enable.ends_with("/etc/php/8.3/fpm/conf.d/99-devhost-system.ini"));
        assert_eq!(
            arbiter.disable_command("8.3"),
            "sudo rm -f /etc/php/8.3/fpm/conf.d/99-devhost-system.ini"
        );
    }

    #[test]
    fn test_clear() {
        let f = fixture();
        let a = settings(&[("opcache.preload", "/a/preload.php")]);
        f.arbiter.claim("8.3", "a", Path::new("/a"), &a).unwrap();
        assert!(f.arbiter.clear("8.3").unwrap());
        assert!(f.arbiter.current_owner("8.3").unwrap().is_none());
        assert!(!f.arbiter.clear("8.3").unwrap());
    }
}
