//! Loopback name resolution for project domains
//!
//! Two strategies are supported. `hosts` keeps a marked section of the
//! hosts file listing every known domain. `dnsmasq` answers the whole
//! TLD with a wildcard and registers a resolver for it with the OS;
//! domains outside the TLD still go to the hosts section.

use crate::config::{DnsMode, GlobalConfig};
use crate::error::{Component, DevhostError, Issue, Result};
use crate::library::TemplateLibrary;
use crate::paths::{Paths, ReloadFlag};
use crate::runner::{run_checked, CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt::Write as _;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

const BEGIN_MARKER: &str = "# BEGIN devhost";
const END_MARKER: &str = "# END devhost";

/// Replace (or append, or drop) the devhost section of a hosts file
pub fn update_hosts_section(current: &str, domains: &[String]) -> String {
    let mut section = String::new();
    if !domains.is_empty() {
        section.push_str(BEGIN_MARKER);
        section.push('\n');
        for domain in domains {
            let _ = writeln!(section, "127.0.0.1 {}", domain);
            let _ = writeln!(section, "::1 {}", domain);
        }
        section.push_str(END_MARKER);
        section.push('\n');
    }

    if let Some(start) = current.find(BEGIN_MARKER) {
        if let Some(end_idx) = current[start..].find(END_MARKER) {
            let mut end = start + end_idx + END_MARKER.len();
            if current[end..].starts_with('\n') {
                end += 1;
            }
            let mut output = String::from(&current[..start]);
            output.push_str(&section);
            output.push_str(&current[end..]);
            return output;
        }
    }

    if section.is_empty() {
        return current.to_string();
    }
    let mut output = String::from(current);
    if !output.is_empty() && !output.ends_with('\n') {
        output.push('\n');
    }
    output.push_str(&section);
    output
}

/// Persisted record of what was registered with the OS resolver
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsState {
    pub registered_tld: Option<String>,
}

/// Outcome of a DNS refresh
#[derive(Debug, Clone, Default)]
pub struct DnsReport {
    pub changed: bool,
    pub warnings: Vec<Issue>,
}

pub struct DnsManager {
    paths: Paths,
    config: GlobalConfig,
    library: TemplateLibrary,
    runner: Arc<dyn CommandRunner>,
}

impl DnsManager {
    pub fn new(paths: Paths, config: GlobalConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            library: TemplateLibrary::new(&paths),
            paths,
            config,
            runner,
        }
    }

    fn hosts_file(&self) -> PathBuf {
        PathBuf::from(&self.config.dns.hosts_file)
    }

    fn resolver_file(&self, tld: &str) -> Option<PathBuf> {
        let dir = self.config.dns.resolver_dir.trim();
        if dir.is_empty() {
            None
        } else {
            Some(Path::new(dir).join(tld))
        }
    }

    pub fn load_state(&self) -> Result<DnsState> {
        let path = self.paths.dns_state();
        match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).map_err(|e| DevhostError::parse(&path, e)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(DnsState::default()),
            Err(e) => Err(DevhostError::io(&path, e)),
        }
    }

    fn save_state(&self, state: &DnsState) -> Result<()> {
        let path = self.paths.dns_state();
        let json = serde_json::to_string_pretty(state).map_err(|e| DevhostError::parse(&path, e))?;
        crate::paths::write_if_changed(&path, &format!("{}\n", json)).map(|_| ())
    }

    /// Make every domain in `domains` resolve to loopback
    pub async fn apply(&self, domains: &BTreeSet<String>) -> Result<DnsReport> {
        let mut report = DnsReport::default();
        let mut state = self.load_state()?;
        let tld = self.config.tld.to_lowercase();

        let hosts_domains: Vec<String> = match self.config.dns.mode {
            DnsMode::Hosts => {
                if let Some(old) = state.registered_tld.take() {
                    report.changed |= self.unregister(&old).await?;
                }
                domains.iter().cloned().collect()
            }
            DnsMode::Dnsmasq => {
                if let Some(old) = state.registered_tld.clone().filter(|old| *old != tld) {
                    if let Some(path) = self.resolver_file(&old) {
                        report.changed |= self.remove_system_file(&path).await?;
                        info!(tld = %old, "Removed resolver registration for previous TLD");
                    }
                }

                report.changed |= self.register(&tld).await?;
                state.registered_tld = Some(tld.clone());

                let suffix = format!(".{}", tld);
                let outside: Vec<String> = domains
                    .iter()
                    .filter(|d| !d.ends_with(&suffix))
                    .cloned()
                    .collect();
                for domain in &outside {
                    report.warnings.push(Issue::new(
                        Component::Dns,
                        format!(
                            "{} is outside .{} and will be resolved through {}",
                            domain, tld, self.config.dns.hosts_file
                        ),
                    ));
                }
                outside
            }
        };

        let hosts = self.hosts_file();
        let current = match tokio::fs::read_to_string(&hosts).await {
            Ok(content) => content,
            Err(e) if e.kind() == ErrorKind::NotFound => String::new(),
            Err(e) => return Err(DevhostError::io(&hosts, e)),
        };
        let updated = update_hosts_section(&current, &hosts_domains);
        if updated != current {
            self.write_system_file(&hosts, &updated).await?;
            info!(path = %hosts.display(), domains = hosts_domains.len(), "Updated hosts file");
            report.changed = true;
        }

        self.save_state(&state)?;
        Ok(report)
    }

    /// Write the wildcard resolver config and OS registration for `tld`
    async fn register(&self, tld: &str) -> Result<bool> {
        let mut changed = false;

        let dnsmasq = PathBuf::from(&self.config.dns.dnsmasq_config);
        let content = self.library.render("dns/dnsmasq", &[("tld", tld)])?;
        if self.write_system_file(&dnsmasq, &content).await? {
            self.restart_flag().set()?;
            info!(tld, path = %dnsmasq.display(), "Configured wildcard resolver");
            changed = true;
        }
        self.restart_if_pending().await?;

        if let Some(path) = self.resolver_file(tld) {
            let content = self.library.render("dns/resolver", &[("tld", tld)])?;
            changed |= self.write_system_file(&path, &content).await?;
        }

        Ok(changed)
    }

    async fn unregister(&self, tld: &str) -> Result<bool> {
        let mut changed = false;
        if let Some(path) = self.resolver_file(tld) {
            changed |= self.remove_system_file(&path).await?;
        }
        let dnsmasq = PathBuf::from(&self.config.dns.dnsmasq_config);
        if self.remove_system_file(&dnsmasq).await? {
            self.restart_flag().set()?;
            changed = true;
        }
        self.restart_if_pending().await?;
        if changed {
            info!(tld, "Removed wildcard resolver");
        }
        Ok(changed)
    }

    fn restart_flag(&self) -> ReloadFlag {
        ReloadFlag::new(&self.paths, "dnsmasq")
    }

    /// Restart the resolver if its config changed since the last restart
    async fn restart_if_pending(&self) -> Result<()> {
        let flag = self.restart_flag();
        if !flag.is_set() {
            return Ok(());
        }
        let restart = CommandSpec::parse(&self.config.dns.restart_command)?.privileged();
        run_checked(self.runner.as_ref(), &restart, Component::Dns).await?;
        flag.clear()?;
        info!("Restarted wildcard resolver");
        Ok(())
    }

    /// Write a file that may need elevated privileges
    ///
    /// Tries a plain write first. On permission failure the content is
    /// staged under the state root and copied into place with elevation.
    async fn write_system_file(&self, path: &Path, content: &str) -> Result<bool> {
        if let Ok(existing) = tokio::fs::read_to_string(path).await {
            if existing == content {
                return Ok(false);
            }
        }

        let direct = async {
            if let Some(parent) = path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::write(path, content).await
        };
        match direct.await {
            Ok(()) => return Ok(true),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                debug!(path = %path.display(), "Write needs elevation");
            }
            Err(e) => return Err(DevhostError::io(path, e)),
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "staged".to_string());
        let staged = self.paths.dns_dir().join("staging").join(name);
        crate::paths::write_if_changed(&staged, content)?;

        if let Some(parent) = path.parent() {
            let mkdir = CommandSpec::new("mkdir")
                .arg("-p")
                .arg(parent.display().to_string())
                .privileged();
            run_checked(self.runner.as_ref(), &mkdir, Component::Dns).await?;
        }
        let copy = CommandSpec::new("cp")
            .arg(staged.display().to_string())
            .arg(path.display().to_string())
            .privileged();
        run_checked(self.runner.as_ref(), &copy, Component::Dns).await?;
        Ok(true)
    }

    async fn remove_system_file(&self, path: &Path) -> Result<bool> {
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) if e.kind() == ErrorKind::PermissionDenied => {
                let rm = CommandSpec::new("rm")
                    .arg("-f")
                    .arg(path.display().to_string())
                    .privileged();
                run_checked(self.runner.as_ref(), &rm, Component::Dns).await?;
                Ok(true)
            }
            Err(e) => Err(DevhostError::io(path, e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::CommandOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct Recorder {
        commands: Mutex<Vec<String>>,
        restart_fails: AtomicBool,
    }

    #[async_trait]
    impl CommandRunner for Recorder {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            let line = spec.display();
            self.commands.lock().unwrap().push(line.clone());
            if line == "restart-dnsmasq" && self.restart_fails.load(Ordering::SeqCst) {
                return Ok(CommandOutput::failed(1, "dnsmasq: failed to bind"));
            }
            Ok(CommandOutput::ok())
        }
    }

    fn config(dir: &TempDir, mode: DnsMode) -> GlobalConfig {
        let mut config = GlobalConfig::default();
        config.dns.mode = mode;
        config.dns.hosts_file = dir.path().join("hosts").display().to_string();
        config.dns.dnsmasq_config = dir.path().join("dnsmasq.d/devhost.conf").display().to_string();
        config.dns.resolver_dir = dir.path().join("resolver").display().to_string();
        config.dns.restart_command = "restart-dnsmasq".to_string();
        config
    }

    fn domains(list: &[&str]) -> BTreeSet<String> {
        list.iter().map(|d| d.to_string()).collect()
    }

    #[test]
    fn test_append_new_section() {
        let content = "127.0.0.1 localhost\n";
        let updated = update_hosts_section(content, &["app.test".to_string()]);
        assert_eq!(
            updated,
            "127.0.0.1 localhost\n# BEGIN devhost\n127.0.0.1 app.test\n::1 app.test\n# END devhost\n"
        );
    }

    #[test]
    fn test_replace_existing_section() {
        let content = "127.0.0.1 localhost\n# BEGIN devhost\n127.0.0.1 old.test\n# END devhost\n10.0.0.1 nas\n";
        let updated = update_hosts_section(content, &["new.test".to_string()]);
        assert!(updated.contains("127.0.0.1 new.test"));
        assert!(!updated.contains("old.test"));
        assert!(updated.ends_with("# END devhost\n10.0.0.1 nas\n"));
        assert_eq!(updated.matches(BEGIN_MARKER).count(), 1);
    }

    #[test]
    fn test_empty_domains_drop_section() {
        let content = "127.0.0.1 localhost\n# BEGIN devhost\n127.0.0.1 old.test\n# END devhost\n";
        assert_eq!(update_hosts_section(content, &[]), "127.0.0.1 localhost\n");
        assert_eq!(update_hosts_section("127.0.0.1 localhost\n", &[]), "127.0.0.1 localhost\n");
    }

    #[tokio::test]
    async fn test_hosts_mode_is_idempotent() {
        let dir = TempDir::new().unwrap();
        std::fs::write(dir.path().join("hosts"), "127.0.0.1 localhost\n").unwrap();
        let manager = DnsManager::new(
            Paths::new(dir.path().join("state")),
            config(&dir, DnsMode::Hosts),
            Arc::new(Recorder::default()),
        );

        let report = manager.apply(&domains(&["shop.test", "blog.test"])).await.unwrap();
        assert!(report.changed);
        let hosts = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert!(hosts.contains("127.0.0.1 blog.test\n::1 blog.test\n127.0.0.1 shop.test"));

        let report = manager.apply(&domains(&["shop.test", "blog.test"])).await.unwrap();
        assert!(!report.changed);
    }

    #[tokio::test]
    async fn test_dnsmasq_mode_registers_tld() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(Recorder::default());
        let manager = DnsManager::new(
            Paths::new(dir.path().join("state")),
            config(&dir, DnsMode::Dnsmasq),
            runner.clone(),
        );

        let report = manager
            .apply(&domains(&["shop.test", "shop.example.com"]))
            .await
            .unwrap();

        let dnsmasq = std::fs::read_to_string(dir.path().join("dnsmasq.d/devhost.conf")).unwrap();
        assert!(dnsmasq.contains("address=/.test/127.0.0.1"));
        assert!(dir.path().join("resolver/test").exists());
        assert_eq!(*runner.commands.lock().unwrap(), vec!["restart-dnsmasq".to_string()]);

        assert_eq!(report.warnings.len(), 1);
        assert!(report.warnings[0].message.contains("shop.example.com"));
        let hosts = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert!(hosts.contains("127.0.0.1 shop.example.com"));
        assert!(!hosts.contains("shop.test"));

        assert_eq!(
            manager.load_state().unwrap().registered_tld.as_deref(),
            Some("test")
        );
    }

    #[tokio::test]
    async fn test_tld_change_removes_old_resolver() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(Recorder::default());
        let state = Paths::new(dir.path().join("state"));

        let first = DnsManager::new(state.clone(), config(&dir, DnsMode::Dnsmasq), runner.clone());
        first.apply(&domains(&["shop.test"])).await.unwrap();
        assert!(dir.path().join("resolver/test").exists());

        let mut changed = config(&dir, DnsMode::Dnsmasq);
        changed.tld = "local".to_string();
        let second = DnsManager::new(state, changed, runner);
        second.apply(&domains(&["shop.local"])).await.unwrap();

        assert!(!dir.path().join("resolver/test").exists());
        assert!(dir.path().join("resolver/local").exists());
        assert_eq!(
            second.load_state().unwrap().registered_tld.as_deref(),
            Some("local")
        );
    }

    #[tokio::test]
    async fn test_switching_to_hosts_unregisters() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(Recorder::default());
        let state = Paths::new(dir.path().join("state"));

        DnsManager::new(state.clone(), config(&dir, DnsMode::Dnsmasq), runner.clone())
            .apply(&domains(&["shop.test"]))
            .await
            .unwrap();
        DnsManager::new(state.clone(), config(&dir, DnsMode::Hosts), runner)
            .apply(&domains(&["shop.test"]))
            .await
            .unwrap();

        assert!(!dir.path().join("resolver/test").exists());
        assert!(!dir.path().join("dnsmasq.d/devhost.conf").exists());
        let hosts = std::fs::read_to_string(dir.path().join("hosts")).unwrap();
        assert!(hosts.contains("127.0.0.1 shop.test"));
    }

    #[tokio::test]
    async fn test_failed_restart_is_retried() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(Recorder::default());
        runner.restart_fails.store(true, Ordering::SeqCst);
        let manager = DnsManager::new(
            Paths::new(dir.path().join("state")),
            config(&dir, DnsMode::Dnsmasq),
            runner.clone(),
        );

        assert!(manager.apply(&domains(&["shop.test"])).await.is_err());
        assert!(dir.path().join("dnsmasq.d/devhost.conf").exists());

        runner.restart_fails.store(false, Ordering::SeqCst);
        runner.commands.lock().unwrap().clear();
        manager.apply(&domains(&["shop.test"])).await.unwrap();
        assert_eq!(*runner.commands.lock().unwrap(), vec!["restart-dnsmasq".to_string()]);

        runner.commands.lock().unwrap().clear();
        manager.apply(&domains(&["shop.test"])).await.unwrap();
        assert!(runner.commands.lock().unwrap().is_empty());
    }
}
