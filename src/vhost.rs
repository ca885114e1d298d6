//! Reverse-proxy virtual hosts
//!
//! Each project gets one proxy configuration file holding an upstream for
//! its worker pool and a server block per domain, plus a JSON marker next
//! to it. The marker is what discovery reads to learn which projects are
//! materialized on this host.

use crate::config::{ProjectConfig, ServiceSet};
use crate::error::{Component, DevhostError, Result};
use crate::library::TemplateLibrary;
use crate::paths::{self, Paths, ReloadFlag};
use crate::runner::{run_checked, CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Materialization record for a project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectMarker {
    pub name: String,
    pub path: PathBuf,
    pub php: String,
    pub domains: Vec<String>,
    #[serde(default)]
    pub services: ServiceSet,
}

impl ProjectMarker {
    pub fn from_config(config: &ProjectConfig) -> Self {
        Self {
            name: config.name.clone(),
            path: config.path.clone(),
            php: config.php.clone(),
            domains: config.hosts(),
            services: config.services.resolved(),
        }
    }

    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| DevhostError::io(path, e))?;
        serde_json::from_str(&content).map_err(|e| DevhostError::parse(path, e))
    }

    fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map(|json| format!("{}\n", json))
            .map_err(|e| DevhostError::parse(&self.path, e))
    }
}

/// A file as it was before a write, for rollback
#[derive(Debug, Clone)]
struct Snapshot {
    path: PathBuf,
    previous: Option<String>,
}

impl Snapshot {
    fn take(path: PathBuf) -> Self {
        let previous = std::fs::read_to_string(&path).ok();
        Self { path, previous }
    }

    fn restore(&self) -> Result<()> {
        match &self.previous {
            Some(content) => paths::write_if_changed(&self.path, content).map(|_| ()),
            None => paths::remove_if_exists(&self.path).map(|_| ()),
        }
    }
}

/// Proxy configuration written but not yet verified and reloaded
#[derive(Debug, Clone)]
pub struct PendingVhost {
    pub project: String,
    pub changed: bool,
    /// An earlier run changed the configuration but never reloaded it
    pub reload_owed: bool,
    snapshots: Vec<Snapshot>,
}

impl PendingVhost {
    pub fn needs_reload(&self) -> bool {
        self.changed || self.reload_owed
    }

    /// Put every touched file back as it was
    pub fn restore(&self) -> Result<()> {
        for snapshot in &self.snapshots {
            snapshot.restore()?;
        }
        Ok(())
    }
}

pub struct VhostManager {
    paths: Paths,
    library: TemplateLibrary,
    test_command: String,
    reload_command: String,
    backend_port: u16,
    runner: Arc<dyn CommandRunner>,
}

impl VhostManager {
    pub fn new(
        paths: Paths,
        test_command: &str,
        reload_command: &str,
        backend_port: u16,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        Self {
            library: TemplateLibrary::new(&paths),
            paths,
            test_command: test_command.to_string(),
            reload_command: reload_command.to_string(),
            backend_port,
            runner,
        }
    }

    fn reload_flag(&self) -> ReloadFlag {
        ReloadFlag::new(&self.paths, "proxy")
    }

    pub fn upstream_name(project: &str) -> String {
        format!("devhost_{}", project.replace('-', "_"))
    }

    /// Render the project's proxy configuration
    ///
    /// With `cache_port` set, public servers proxy through the HTTP cache
    /// and a backend server on the backend port talks to the pool.
    pub fn render(&self, config: &ProjectConfig, cache_port: Option<u16>) -> Result<String> {
        let upstream = Self::upstream_name(&config.name);
        let socket = self
            .paths
            .pool_socket(&config.php, &config.name)
            .display()
            .to_string();
        let logs = self.paths.logs_dir(&config.name).display().to_string();
        let backend_port = self.backend_port.to_string();
        let cache_port = cache_port.map(|p| p.to_string());

        let mut out = format!("# devhost project {} ({})\n\n", config.name, config.path.display());
        out.push_str(&self.library.render(
            "nginx/upstream",
            &[("upstream", upstream.as_str()), ("socket", socket.as_str())],
        )?);

        for domain in &config.domains {
            let host = domain.host_name();
            let root = config.document_root(domain).display().to_string();
            let php_locations = self.library.render(
                "nginx/php-locations",
                &[("root", root.as_str()), ("upstream", upstream.as_str())],
            )?;

            let public_locations = match &cache_port {
                Some(port) => {
                    self.library
                        .render("nginx/proxy-locations", &[("cache_port", port.as_str())])?
                }
                None => php_locations.clone(),
            };

            out.push('\n');
            if domain.ssl {
                let cert = self.paths.cert_file(&host).display().to_string();
                let key = self.paths.key_file(&host).display().to_string();
                out.push_str(
                    &self
                        .library
                        .render("nginx/server-redirect", &[("host", host.as_str())])?,
                );
                out.push('\n');
                out.push_str(&self.library.render(
                    "nginx/server-https",
                    &[
                        ("host", host.as_str()),
                        ("cert", cert.as_str()),
                        ("key", key.as_str()),
                        ("logs", logs.as_str()),
                        ("locations", public_locations.as_str()),
                    ],
                )?);
            } else {
                out.push_str(&self.library.render(
                    "nginx/server-http",
                    &[
                        ("host", host.as_str()),
                        ("logs", logs.as_str()),
                        ("locations", public_locations.as_str()),
                    ],
                )?);
            }

            if cache_port.is_some() {
                out.push('\n');
                out.push_str(&self.library.render(
                    "nginx/server-backend",
                    &[
                        ("host", host.as_str()),
                        ("backend_port", backend_port.as_str()),
                        ("logs", logs.as_str()),
                        ("locations", php_locations.as_str()),
                    ],
                )?);
            }
        }

        Ok(out)
    }

    /// Write configuration and marker, remembering what they replaced
    pub fn write(&self, config: &ProjectConfig, cache_port: Option<u16>) -> Result<PendingVhost> {
        let content = self.render(config, cache_port)?;
        let marker = ProjectMarker::from_config(config).to_json()?;

        let conf_path = self.paths.vhost_file(&config.name);
        let marker_path = self.paths.marker_file(&config.name);
        let snapshots = vec![
            Snapshot::take(conf_path.clone()),
            Snapshot::take(marker_path.clone()),
        ];
        let flag = self.reload_flag();
        let reload_owed = flag.is_set();

        let mut changed = paths::write_if_changed(&conf_path, &content)?;
        changed |= paths::write_if_changed(&marker_path, &marker)?;

        if changed {
            flag.set()?;
            info!(project = %config.name, path = %conf_path.display(), "Wrote vhost");
        } else {
            debug!(project = %config.name, reload_owed, "Vhost unchanged");
        }

        Ok(PendingVhost {
            project: config.name.clone(),
            changed,
            reload_owed,
            snapshots,
        })
    }

    /// Remove a project's configuration and marker
    pub fn remove(&self, project: &str) -> Result<PendingVhost> {
        let conf_path = self.paths.vhost_file(project);
        let marker_path = self.paths.marker_file(project);
        let snapshots = vec![
            Snapshot::take(conf_path.clone()),
            Snapshot::take(marker_path.clone()),
        ];
        let flag = self.reload_flag();
        let reload_owed = flag.is_set();

        let mut changed = paths::remove_if_exists(&conf_path)?;
        changed |= paths::remove_if_exists(&marker_path)?;
        if changed {
            flag.set()?;
            info!(project, "Removed vhost");
        }

        Ok(PendingVhost {
            project: project.to_string(),
            changed,
            reload_owed,
            snapshots,
        })
    }

    pub fn test_spec(&self) -> Result<CommandSpec> {
        Ok(CommandSpec::parse(&self.test_command)?.privileged())
    }

    pub fn reload_spec(&self) -> Result<CommandSpec> {
        Ok(CommandSpec::parse(&self.reload_command)?.privileged())
    }

    /// Dry-run the proxy configuration, then reload
    ///
    /// When the dry-run fails the pending change is rolled back, the
    /// reload is skipped and the failure is returned, so the running
    /// proxy keeps serving the last good configuration. The reload flag
    /// is cleared only once a reload succeeds.
    pub async fn activate(&self, pending: &PendingVhost) -> Result<()> {
        let flag = self.reload_flag();
        let test = self.test_spec()?;
        if let Err(e) = run_checked(self.runner.as_ref(), &test, Component::Vhost).await {
            warn!(project = %pending.project, error = %e, "Proxy configuration test failed, restoring previous vhost");
            pending.restore()?;
            if !pending.reload_owed {
                flag.clear()?;
            }
            return Err(DevhostError::tool(
                Component::Vhost,
                format!(
                    "proxy configuration test failed, previous configuration restored and reload skipped: {}",
                    strip_component(&e)
                ),
            ));
        }

        run_checked(self.runner.as_ref(), &self.reload_spec()?, Component::Vhost).await?;
        flag.clear()?;
        info!(project = %pending.project, "Reloaded reverse proxy");
        Ok(())
    }
}

fn strip_component(error: &DevhostError) -> String {
    match error {
        DevhostError::ExternalTool { message, .. } => message.clone(),
        other => other.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DomainConfig, ProjectConfigBuilder, ServiceKind};
    use crate::runner::CommandOutput;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Default)]
    struct ProxyStub {
        broken: AtomicBool,
        reload_broken: AtomicBool,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl CommandRunner for ProxyStub {
        async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
            let line = spec.display();
            self.commands.lock().unwrap().push(line.clone());
            if line == "nginx -t" && self.broken.load(Ordering::SeqCst) {
                return Ok(CommandOutput::failed(1, "unexpected \"}\" in shop.conf:12"));
            }
            if line == "nginx -s reload" && self.reload_broken.load(Ordering::SeqCst) {
                return Ok(CommandOutput::failed(1, "nginx is not running"));
            }
            Ok(CommandOutput::ok())
        }
    }

    fn manager(dir: &TempDir, runner: Arc<ProxyStub>) -> VhostManager {
        VhostManager::new(
            Paths::new(dir.path()),
            "nginx -t",
            "nginx -s reload",
            8080,
            runner,
        )
    }

    fn shop() -> ProjectConfig {
        ProjectConfigBuilder::new("shop", "/srv/shop")
            .domain_config(DomainConfig::new("shop.test").with_root("pub"))
            .domain_config(DomainConfig::new("api.shop.test").with_ssl(false))
            .service(ServiceKind::Mysql, "8.0")
            .build()
    }

    #[test]
    fn test_render_ssl_and_plain_domains() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Arc::new(ProxyStub::default()));
        let conf = manager.render(&shop(), None).unwrap();

        assert!(conf.contains("upstream devhost_shop {"));
        assert!(conf.contains("return 301 https://$host$request_uri;"));
        assert!(conf.contains("listen 443 ssl;"));
        assert!(conf.contains(&format!(
            "ssl_certificate {};",
            dir.path().join("certs/shop.test/cert.pem").display()
        )));
        assert!(conf.contains("root /srv/shop/pub;"));
        assert!(conf.contains("root /srv/shop;"));
        assert!(!conf.contains("certs/api.shop.test"));
        assert!(!conf.contains("proxy_pass"));
    }

    #[test]
    fn test_render_through_cache() {
        let dir = TempDir::new().unwrap();
        let manager = manager(&dir, Arc::new(ProxyStub::default()));
        let conf = manager.render(&shop(), Some(6081)).unwrap();
        assert!(conf.contains("proxy_pass http://127.0.0.1:6081;"));
        assert!(conf.contains("listen 8080;"));
        assert!(conf.contains("fastcgi_pass devhost_shop;"));
    }

    #[test]
    fn test_marker_written_with_vhost() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());
        let manager = manager(&dir, Arc::new(ProxyStub::default()));
        let pending = manager.write(&shop(), None).unwrap();
        assert!(pending.changed);

        let marker = ProjectMarker::load(&paths.marker_file("shop")).unwrap();
        assert_eq!(marker.name, "shop");
        assert_eq!(marker.domains, vec!["shop.test", "api.shop.test"]);
        assert_eq!(marker.services.get(&ServiceKind::Mysql).unwrap(), "8.0");

        assert!(!manager.write(&shop(), None).unwrap().changed);
    }

    #[tokio::test]
    async fn test_activate_tests_then_reloads() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ProxyStub::default());
        let manager = manager(&dir, runner.clone());
        let pending = manager.write(&shop(), None).unwrap();
        manager.activate(&pending).await.unwrap();
        assert_eq!(
            *runner.commands.lock().unwrap(),
            vec!["nginx -t".to_string(), "nginx -s reload".to_string()]
        );
    }

    #[tokio::test]
    async fn test_failed_dry_run_restores_previous() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());
        let runner = Arc::new(ProxyStub::default());
        let manager = manager(&dir, runner.clone());

        let pending = manager.write(&shop(), None).unwrap();
        manager.activate(&pending).await.unwrap();
        let good = std::fs::read_to_string(paths.vhost_file("shop")).unwrap();

        runner.broken.store(true, Ordering::SeqCst);
        runner.commands.lock().unwrap().clear();
        let changed = ProjectConfigBuilder::new("shop", "/srv/shop")
            .domain("shop.test")
            .build();
        let pending = manager.write(&changed, None).unwrap();
        let err = manager.activate(&pending).await.unwrap_err();

        assert!(matches!(err, DevhostError::ExternalTool { component: Component::Vhost, .. }));
        assert!(err.to_string().contains("unexpected"));
        assert_eq!(std::fs::read_to_string(paths.vhost_file("shop")).unwrap(), good);
        assert_eq!(*runner.commands.lock().unwrap(), vec!["nginx -t".to_string()]);
    }

    #[tokio::test]
    async fn test_failed_dry_run_removes_new_vhost() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());
        let runner = Arc::new(ProxyStub::default());
        runner.broken.store(true, Ordering::SeqCst);
        let manager = manager(&dir, runner);

        let pending = manager.write(&shop(), None).unwrap();
        assert!(manager.activate(&pending).await.is_err());
        assert!(!paths.vhost_file("shop").exists());
        assert!(!paths.marker_file("shop").exists());
    }

    #[tokio::test]
    async fn test_failed_reload_is_owed_to_next_write() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ProxyStub::default());
        runner.reload_broken.store(true, Ordering::SeqCst);
        let manager = manager(&dir, runner.clone());

        let pending = manager.write(&shop(), None).unwrap();
        assert!(manager.activate(&pending).await.is_err());

        runner.reload_broken.store(false, Ordering::SeqCst);
        let pending = manager.write(&shop(), None).unwrap();
        assert!(!pending.changed);
        assert!(pending.needs_reload());
        manager.activate(&pending).await.unwrap();

        let pending = manager.write(&shop(), None).unwrap();
        assert!(!pending.needs_reload());
    }

    #[tokio::test]
    async fn test_rejected_change_owes_no_reload() {
        let dir = TempDir::new().unwrap();
        let runner = Arc::new(ProxyStub::default());
        let manager = manager(&dir, runner.clone());
        let pending = manager.write(&shop(), None).unwrap();
        manager.activate(&pending).await.unwrap();

        runner.broken.store(true, Ordering::SeqCst);
        let changed = ProjectConfigBuilder::new("shop", "/srv/shop")
            .domain("shop.test")
            .build();
        let pending = manager.write(&changed, None).unwrap();
        assert!(manager.activate(&pending).await.is_err());

        runner.broken.store(false, Ordering::SeqCst);
        assert!(!manager.write(&shop(), None).unwrap().needs_reload());
    }

    #[test]
    fn test_remove_and_restore() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());
        let manager = manager(&dir, Arc::new(ProxyStub::default()));
        manager.write(&shop(), None).unwrap();

        let pending = manager.remove("shop").unwrap();
        assert!(pending.changed);
        assert!(!paths.vhost_file("shop").exists());

        pending.restore().unwrap();
        assert!(paths.vhost_file("shop").exists());
        assert!(paths.marker_file("shop").exists());
    }
}
