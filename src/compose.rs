//! Shared container services
//!
//! One compose definition describes every service any known project needs,
//! deduplicated by (kind, version). It is regenerated wholesale from the
//! union of projects on every start and stop, so it never drifts from what
//! projects declare.

use crate::config::{ServiceKind, ServiceSet};
use crate::docker::ContainerRuntime;
use crate::error::{Component, DevhostError, Result};
use crate::library::TemplateLibrary;
use crate::paths::{self, Paths};
use crate::ports::{Allocation, PortAllocator};
use crate::runner::{run_checked, CommandRunner, CommandSpec};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Compose project name; also the prefix of every container name
pub const COMPOSE_PROJECT: &str = "devhost";

/// Root password of the shared relational engines
pub const ROOT_PASSWORD: &str = "devhost";

/// Hostname containers use to reach the host reverse proxy
const HOST_GATEWAY: &str = "host.docker.internal";

/// A running service derived from descriptors and the port table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceInstance {
    pub kind: ServiceKind,
    pub version: String,
    pub container_name: String,
    pub port: u16,
}

impl ServiceInstance {
    pub fn new(kind: ServiceKind, version: &str, port: u16) -> Self {
        Self {
            kind,
            version: version.to_string(),
            container_name: format!("{}-{}-{}", COMPOSE_PROJECT, kind, version),
            port,
        }
    }

    /// Service key inside the compose definition
    pub fn service_name(&self) -> String {
        format!("{}-{}", self.kind, self.version)
    }
}

/// A service in the desired state with the projects that need it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredService {
    pub instance: ServiceInstance,
    pub secondary_port: Option<u16>,
    pub fallback: bool,
    pub users: BTreeSet<String>,
}

/// Union of every known project's services
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DesiredState {
    services: BTreeMap<(ServiceKind, String), DesiredService>,
}

impl DesiredState {
    pub fn get(&self, kind: ServiceKind, version: &str) -> Option<&DesiredService> {
        self.services.get(&(kind, version.to_string()))
    }

    pub fn usage_count(&self, kind: ServiceKind, version: &str) -> usize {
        self.get(kind, version).map_or(0, |s| s.users.len())
    }

    pub fn services(&self) -> impl Iterator<Item = &DesiredService> {
        self.services.values()
    }

    pub fn service_names(&self) -> BTreeSet<String> {
        self.services().map(|s| s.instance.service_name()).collect()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ComposeFile {
    #[serde(default)]
    services: BTreeMap<String, ComposeService>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    volumes: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Serialize, Deserialize)]
struct ComposeService {
    image: String,
    container_name: String,
    restart: String,
    #[serde(default)]
    ports: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    volumes: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    extra_hosts: Vec<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    labels: BTreeMap<String, String>,
}

/// Image reference for a service version
fn image(kind: ServiceKind, version: &str) -> String {
    match kind {
        ServiceKind::Mysql => format!("mysql:{}", version),
        ServiceKind::Mariadb => format!("mariadb:{}", version),
        ServiceKind::Redis => format!("redis:{}-alpine", version),
        ServiceKind::Opensearch => format!("opensearchproject/opensearch:{}", version),
        ServiceKind::Elasticsearch => {
            // elastic publishes full patch tags only
            if version.matches('.').count() == 1 {
                format!("elasticsearch:{}.0", version)
            } else {
                format!("elasticsearch:{}", version)
            }
        }
        ServiceKind::Rabbitmq => format!("rabbitmq:{}-management-alpine", version),
        ServiceKind::Mailpit => format!("axllent/mailpit:v{}", version),
        ServiceKind::Varnish => format!("varnish:{}", version),
    }
}

/// (container port, secondary container port)
fn container_ports(kind: ServiceKind) -> (u16, Option<u16>) {
    match kind {
        ServiceKind::Mysql | ServiceKind::Mariadb => (3306, None),
        ServiceKind::Redis => (6379, None),
        ServiceKind::Opensearch | ServiceKind::Elasticsearch => (9200, None),
        ServiceKind::Rabbitmq => (5672, Some(15672)),
        ServiceKind::Mailpit => (1025, Some(8025)),
        ServiceKind::Varnish => (80, None),
    }
}

/// Named volume holding persistent data, if the kind keeps any
fn data_mount(kind: ServiceKind) -> Option<&'static str> {
    match kind {
        ServiceKind::Mysql | ServiceKind::Mariadb => Some("/var/lib/mysql"),
        ServiceKind::Redis => Some("/data"),
        ServiceKind::Opensearch => Some("/usr/share/opensearch/data"),
        ServiceKind::Elasticsearch => Some("/usr/share/elasticsearch/data"),
        ServiceKind::Rabbitmq => Some("/var/lib/rabbitmq"),
        ServiceKind::Mailpit | ServiceKind::Varnish => None,
    }
}

fn environment(kind: ServiceKind) -> BTreeMap<String, String> {
    let pairs: &[(&str, &str)] = match kind {
        ServiceKind::Mysql => &[("MYSQL_ROOT_PASSWORD", ROOT_PASSWORD)],
        ServiceKind::Mariadb => &[("MARIADB_ROOT_PASSWORD", ROOT_PASSWORD)],
        ServiceKind::Opensearch => &[
            ("discovery.type", "single-node"),
            ("DISABLE_SECURITY_PLUGIN", "true"),
            ("OPENSEARCH_JAVA_OPTS", "-Xms512m -Xmx512m"),
        ],
        ServiceKind::Elasticsearch => &[
            ("discovery.type", "single-node"),
            ("xpack.security.enabled", "false"),
            ("ES_JAVA_OPTS", "-Xms512m -Xmx512m"),
        ],
        ServiceKind::Rabbitmq => &[
            ("RABBITMQ_DEFAULT_USER", "guest"),
            ("RABBITMQ_DEFAULT_PASS", "guest"),
        ],
        ServiceKind::Mailpit => &[("MP_SMTP_AUTH_ACCEPT_ANY", "1")],
        ServiceKind::Redis | ServiceKind::Varnish => &[],
    };
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// Client binary and admin binary of a relational engine
fn sql_clients(kind: ServiceKind) -> (&'static str, &'static str) {
    match kind {
        ServiceKind::Mariadb => ("mariadb", "mariadb-admin"),
        _ => ("mysql", "mysqladmin"),
    }
}

/// Service names declared in an existing compose definition
pub fn parse_services(path: &std::path::Path) -> Result<BTreeSet<String>> {
    let content = match std::fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(BTreeSet::new()),
        Err(e) => return Err(DevhostError::io(path, e)),
    };
    let file: ComposeFile =
        serde_yaml::from_str(&content).map_err(|e| DevhostError::parse(path, e))?;
    Ok(file.services.into_keys().collect())
}

/// Generates the compose definition and drives the container services
pub struct ComposeManager {
    paths: Paths,
    allocator: PortAllocator,
    library: TemplateLibrary,
    backend_port: u16,
    ready_timeout: Duration,
    runner: Arc<dyn CommandRunner>,
    runtime: Arc<dyn ContainerRuntime>,
}

impl ComposeManager {
    pub fn new(
        paths: Paths,
        allocator: PortAllocator,
        runner: Arc<dyn CommandRunner>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Self {
        let library = TemplateLibrary::new(&paths);
        Self {
            paths,
            allocator,
            library,
            backend_port: 8080,
            ready_timeout: Duration::from_secs(60),
            runner,
            runtime,
        }
    }

    /// Port the reverse proxy serves cache-backed projects on
    pub fn with_backend_port(mut self, port: u16) -> Self {
        self.backend_port = port;
        self
    }

    pub fn with_ready_timeout(mut self, timeout: Duration) -> Self {
        self.ready_timeout = timeout;
        self
    }

    pub fn definition_path(&self) -> PathBuf {
        self.paths.compose_file()
    }

    pub fn allocate(&self, kind: ServiceKind, version: &str) -> (ServiceInstance, Allocation) {
        let allocation = self.allocator.port(kind, version);
        (
            ServiceInstance::new(kind, version, allocation.port),
            allocation,
        )
    }

    /// Union of services over `projects`, deduplicated by (kind, version)
    ///
    /// Fails with `ResourceConflict` when two distinct services of the
    /// union resolve to the same host port.
    pub fn desired<'a, I>(&self, projects: I) -> Result<DesiredState>
    where
        I: IntoIterator<Item = (&'a str, &'a ServiceSet)>,
    {
        let mut state = DesiredState::default();

        for (project, services) in projects {
            for (kind, version) in services {
                let entry = state
                    .services
                    .entry((*kind, version.clone()))
                    .or_insert_with(|| {
                        let (instance, allocation) = self.allocate(*kind, version);
                        DesiredService {
                            instance,
                            secondary_port: allocation.secondary,
                            fallback: allocation.fallback,
                            users: BTreeSet::new(),
                        }
                    });
                entry.users.insert(project.to_string());
            }
        }

        self.allocator
            .check_injective(state.services.keys().map(|(k, v)| (*k, v.as_str())))?;

        Ok(state)
    }

    /// Render the compose definition; identical input gives identical bytes
    pub fn render(&self, state: &DesiredState) -> Result<String> {
        let mut file = ComposeFile {
            services: BTreeMap::new(),
            volumes: BTreeMap::new(),
        };

        for desired in state.services() {
            let instance = &desired.instance;
            let (inner, inner_secondary) = container_ports(instance.kind);

            let mut ports = vec![format!("127.0.0.1:{}:{}", instance.port, inner)];
            if let (Some(host), Some(inner)) = (desired.secondary_port, inner_secondary) {
                ports.push(format!("127.0.0.1:{}:{}", host, inner));
            }

            let mut volumes = Vec::new();
            if let Some(mount) = data_mount(instance.kind) {
                let volume = format!("{}-data", instance.container_name);
                volumes.push(format!("{}:{}", volume, mount));
                file.volumes.insert(volume, BTreeMap::new());
            }

            let mut extra_hosts = Vec::new();
            if instance.kind == ServiceKind::Varnish {
                let vcl = self.paths.varnish_vcl(&instance.version);
                volumes.push(format!("{}:/etc/varnish/default.vcl:ro", vcl.display()));
                extra_hosts.push(format!("{}:host-gateway", HOST_GATEWAY));
            }

            let labels = BTreeMap::from([
                ("dev.devhost.kind".to_string(), instance.kind.to_string()),
                ("dev.devhost.version".to_string(), instance.version.clone()),
            ]);

            file.services.insert(
                instance.service_name(),
                ComposeService {
                    image: image(instance.kind, &instance.version),
                    container_name: instance.container_name.clone(),
                    restart: "unless-stopped".to_string(),
                    ports,
                    environment: environment(instance.kind),
                    volumes,
                    extra_hosts,
                    labels,
                },
            );
        }

        let body = serde_yaml::to_string(&file)
            .map_err(|e| DevhostError::parse(self.definition_path(), e))?;
        Ok(format!(
            "# Generated by devhost from every known project. Edits are overwritten.\n{}",
            body
        ))
    }

    /// Regenerate the definition (and Varnish VCL files). Returns whether
    /// the definition changed.
    pub fn write(&self, state: &DesiredState) -> Result<bool> {
        for desired in state.services() {
            if desired.instance.kind == ServiceKind::Varnish {
                let backend_port = self.backend_port.to_string();
                let vcl = self.library.render(
                    "varnish/default.vcl",
                    &[
                        ("backend_host", HOST_GATEWAY),
                        ("backend_port", backend_port.as_str()),
                    ],
                )?;
                paths::write_if_changed(&self.paths.varnish_vcl(&desired.instance.version), &vcl)?;
            }
        }

        let content = self.render(state)?;
        let path = self.definition_path();
        let changed = paths::write_if_changed(&path, &content)?;
        if changed {
            info!(path = %path.display(), services = state.len(), "Wrote compose definition");
        } else {
            debug!(path = %path.display(), "Compose definition unchanged");
        }
        Ok(changed)
    }

    /// Fail when the container daemon is unreachable
    pub async fn ensure_daemon(&self) -> Result<()> {
        self.runtime.ping().await
    }

    fn compose_command(&self) -> CommandSpec {
        CommandSpec::new("docker").args([
            "compose".to_string(),
            "-f".to_string(),
            self.definition_path().display().to_string(),
            "-p".to_string(),
            COMPOSE_PROJECT.to_string(),
        ])
    }

    pub async fn up(&self, instance: &ServiceInstance) -> Result<()> {
        let spec = self
            .compose_command()
            .args(["up", "-d"])
            .arg(instance.service_name());
        run_checked(self.runner.as_ref(), &spec, Component::Containers).await?;
        info!(service = %instance.service_name(), port = instance.port, "Service up");
        Ok(())
    }

    pub async fn stop(&self, instance: &ServiceInstance) -> Result<()> {
        let spec = self
            .compose_command()
            .arg("stop")
            .arg(instance.service_name());
        run_checked(self.runner.as_ref(), &spec, Component::Containers).await?;
        info!(service = %instance.service_name(), "Service stopped");
        Ok(())
    }

    pub async fn is_service_running(&self, instance: &ServiceInstance) -> Result<bool> {
        self.runtime.is_running(&instance.container_name).await
    }

    /// Wait until a relational engine accepts connections
    ///
    /// Other kinds are considered ready once their container runs.
    pub async fn wait_ready(&self, instance: &ServiceInstance) -> Result<()> {
        if !instance.kind.is_relational() {
            return Ok(());
        }

        let (_, admin) = sql_clients(instance.kind);
        let password = format!("-p{}", ROOT_PASSWORD);
        let cmd = [admin, "ping", "-h127.0.0.1", "-uroot", password.as_str(), "--silent"];
        let deadline = Instant::now() + self.ready_timeout;

        loop {
            match self.runtime.exec(&instance.container_name, &cmd).await {
                Ok(out) if out.success() => {
                    debug!(container = %instance.container_name, "Database is accepting connections");
                    return Ok(());
                }
                Ok(_) | Err(_) if Instant::now() < deadline => {
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
                Ok(out) => {
                    return Err(DevhostError::tool(
                        Component::Containers,
                        format!(
                            "{} did not become ready within {}s: {}",
                            instance.container_name,
                            self.ready_timeout.as_secs(),
                            out.output.trim()
                        ),
                    ));
                }
                Err(e) => return Err(e),
            }
        }
    }

    async fn sql(&self, instance: &ServiceInstance, statement: &str) -> Result<String> {
        let (client, _) = sql_clients(instance.kind);
        let password = format!("-p{}", ROOT_PASSWORD);
        let cmd = [client, "-uroot", password.as_str(), "-N", "-B", "-e", statement];
        let out = self.runtime.exec(&instance.container_name, &cmd).await?;
        if !out.success() {
            return Err(DevhostError::tool(
                Component::Containers,
                format!(
                    "`{}` in {} failed (exit {}): {}",
                    statement,
                    instance.container_name,
                    out.exit_code,
                    out.output.trim()
                ),
            ));
        }
        Ok(out.output)
    }

    pub async fn database_exists(&self, instance: &ServiceInstance, database: &str) -> Result<bool> {
        let output = self
            .sql(instance, &format!("SHOW DATABASES LIKE '{}'", database))
            .await?;
        Ok(output.lines().any(|line| line.trim() == database))
    }

    /// Create the project's database if missing. Returns whether it was created.
    pub async fn ensure_database(&self, instance: &ServiceInstance, database: &str) -> Result<bool> {
        if self.database_exists(instance, database).await? {
            debug!(database, container = %instance.container_name, "Database exists");
            return Ok(false);
        }
        self.sql(
            instance,
            &format!(
                "CREATE DATABASE IF NOT EXISTS `{}` CHARACTER SET utf8mb4 COLLATE utf8mb4_unicode_ci",
                database
            ),
        )
        .await?;
        info!(database, container = %instance.container_name, "Created database");
        Ok(true)
    }
}
