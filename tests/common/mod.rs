//! In-process stand-ins for the host daemons used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use devhost::config::{DnsMode, GlobalConfig, ProjectConfigBuilder};
use devhost::docker::{ContainerRuntime, ExecOutput};
use devhost::paths::Paths;
use devhost::reconciler::Reconciler;
use devhost::runner::{CommandOutput, CommandRunner, CommandSpec, SystemRunner};
use devhost::{Component, DevhostError, Result};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

/// Fake host: records commands, tracks containers and databases
#[derive(Default)]
pub struct FakeHost {
    commands: Mutex<Vec<String>>,
    running: Mutex<BTreeSet<String>>,
    databases: Mutex<BTreeMap<String, BTreeSet<String>>>,
    failing: Mutex<Vec<String>>,
    daemon_down: AtomicBool,
    files: SystemRunner,
}

impl FakeHost {
    pub fn commands(&self) -> Vec<String> {
        self.commands.lock().unwrap().clone()
    }

    pub fn clear_commands(&self) {
        self.commands.lock().unwrap().clear();
    }

    /// Make every command whose display contains `pattern` fail
    pub fn fail(&self, pattern: &str) {
        self.failing.lock().unwrap().push(pattern.to_string());
    }

    pub fn heal(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn set_daemon_down(&self, down: bool) {
        self.daemon_down.store(down, Ordering::SeqCst);
    }

    pub fn is_running(&self, container: &str) -> bool {
        self.running.lock().unwrap().contains(container)
    }

    pub fn has_database(&self, container: &str, database: &str) -> bool {
        self.databases
            .lock()
            .unwrap()
            .get(container)
            .is_some_and(|dbs| dbs.contains(database))
    }

    fn compose(&self, spec: &CommandSpec) {
        let Some(service) = spec.args.last() else {
            return;
        };
        let container = format!("devhost-{}", service);
        if spec.args.iter().any(|a| a == "up") {
            self.running.lock().unwrap().insert(container);
        } else if spec.args.iter().any(|a| a == "stop") {
            self.running.lock().unwrap().remove(&container);
        }
    }
}

#[async_trait]
impl CommandRunner for FakeHost {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let line = spec.display();
        self.commands.lock().unwrap().push(line.clone());

        if self.failing.lock().unwrap().iter().any(|p| line.contains(p.as_str())) {
            return Ok(CommandOutput::failed(1, "injected failure"));
        }

        match spec.program.as_str() {
            "ln" | "rm" | "cp" | "mkdir" => {
                let mut plain = spec.clone();
                plain.privileged = false;
                self.files.run(&plain).await
            }
            "docker" => {
                self.compose(spec);
                Ok(CommandOutput::ok())
            }
            _ => Ok(CommandOutput::ok()),
        }
    }
}

#[async_trait]
impl ContainerRuntime for FakeHost {
    async fn ping(&self) -> Result<()> {
        if self.daemon_down.load(Ordering::SeqCst) {
            return Err(DevhostError::tool(
                Component::Containers,
                "Docker daemon is not responding",
            ));
        }
        Ok(())
    }

    async fn is_running(&self, container: &str) -> Result<bool> {
        self.ping().await?;
        Ok(FakeHost::is_running(self, container))
    }

    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<ExecOutput> {
        self.ping().await?;
        if !FakeHost::is_running(self, container) {
            return Ok(ExecOutput {
                exit_code: 1,
                output: format!("container {} is not running", container),
            });
        }

        let statement = cmd.last().copied().unwrap_or_default();
        let mut databases = self.databases.lock().unwrap();
        let dbs = databases.entry(container.to_string()).or_default();
        let output = if let Some(rest) = statement.strip_prefix("SHOW DATABASES LIKE '") {
            let name = rest.trim_end_matches('\'');
            if dbs.contains(name) {
                format!("{}\n", name)
            } else {
                String::new()
            }
        } else if let Some(rest) = statement.strip_prefix("CREATE DATABASE IF NOT EXISTS `") {
            if let Some((name, _)) = rest.split_once('`') {
                dbs.insert(name.to_string());
            }
            String::new()
        } else {
            String::new()
        };

        Ok(ExecOutput {
            exit_code: 0,
            output,
        })
    }
}

/// A temporary host with its own state root, project tree and system dirs
pub struct Harness {
    pub dir: TempDir,
    pub paths: Paths,
    pub global: GlobalConfig,
    pub host: Arc<FakeHost>,
    pub reconciler: Reconciler,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_mode(DnsMode::Hosts)
    }

    pub fn with_mode(mode: DnsMode) -> Self {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        std::fs::write(root.join("hosts"), "127.0.0.1 localhost\n").unwrap();
        for version in ["8.2", "8.3"] {
            std::fs::create_dir_all(root.join("scan").join(version)).unwrap();
        }

        let mut global = GlobalConfig::default();
        global.privilege_command = String::new();
        global.service_ready_timeout_secs = 1;
        global.php.scan_dir = root.join("scan/{version}").display().to_string();
        global.php.reload_command = "php-reload {version}".to_string();
        global.php.pool_user = Some("dev".to_string());
        global.ssl.trust_command = "trust-ca {ca_cert}".to_string();
        global.dns.mode = mode;
        global.dns.hosts_file = root.join("hosts").display().to_string();
        global.dns.dnsmasq_config = root.join("dnsmasq/devhost.conf").display().to_string();
        global.dns.resolver_dir = root.join("resolver").display().to_string();
        global.dns.restart_command = "dnsmasq-restart".to_string();

        let paths = Paths::new(root.join("state"));
        let host = Arc::new(FakeHost::default());
        let reconciler =
            Reconciler::new(paths.clone(), global.clone(), host.clone(), host.clone()).unwrap();

        Self {
            dir,
            paths,
            global,
            host,
            reconciler,
        }
    }

    /// Builder for a project whose directory exists under the temp root
    pub fn project(&self, name: &str) -> ProjectConfigBuilder {
        let path = self.project_path(name);
        std::fs::create_dir_all(&path).unwrap();
        ProjectConfigBuilder::new(name, path)
    }

    pub fn project_path(&self, name: &str) -> PathBuf {
        self.dir.path().join("projects").join(name)
    }

    pub fn read(&self, path: impl AsRef<std::path::Path>) -> String {
        std::fs::read_to_string(path.as_ref())
            .unwrap_or_else(|e| panic!("{}: {}", path.as_ref().display(), e))
    }

    pub fn hosts(&self) -> String {
        self.read(self.dir.path().join("hosts"))
    }
}
