//! Project reconciliation
//!
//! Sequences every component for one project. Each run recomputes the
//! complete desired state from the descriptor and the discovered projects
//! and overwrites generated artifacts, so a failed run is always safe to
//! repeat. Validation failures halt before anything is touched; failures
//! during execution are accumulated into the result so one broken
//! component never blocks the independent ones.

use crate::compose::{ComposeManager, DesiredState, ServiceInstance};
use crate::config::{DomainConfig, GlobalConfig, ProjectConfig, ServiceKind};
use crate::discovery::{self, DiscoveryReport};
use crate::dns::DnsManager;
use crate::docker::ContainerRuntime;
use crate::error::{Component, DevhostError, Issue, Result};
use crate::paths::Paths;
use crate::php::{self, ActivationState, ClaimOutcome, PoolManager, SystemIniArbiter, SystemIniOwner};
use crate::ports::PortAllocator;
use crate::runner::CommandRunner;
use crate::ssl::SslManager;
use crate::vhost::{ProjectMarker, VhostManager};
use serde::Serialize;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Lifecycle of one project within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProjectState {
    NotValidated,
    Validated,
    Starting,
    Started,
    Stopping,
    Stopped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StartResult {
    pub project: String,
    pub state: ProjectState,
    pub php_version: String,
    pub domains: Vec<String>,
    pub services: Vec<ServiceInstance>,
    pub warnings: Vec<Issue>,
    pub errors: Vec<Issue>,
}

impl StartResult {
    fn new(project: &str, php_version: &str) -> Self {
        Self {
            project: project.to_string(),
            state: ProjectState::NotValidated,
            php_version: php_version.to_string(),
            domains: Vec::new(),
            services: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    /// A result for a project that could not be started at all
    pub fn failed(project: &str, error: &DevhostError) -> Self {
        let mut result = Self::new(project, "");
        result.errors.push(Issue::from_error(Component::Project, error));
        result
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    /// Whether the project never got past validation
    pub fn aborted(&self) -> bool {
        self.state == ProjectState::NotValidated
    }

    fn warn(&mut self, component: Component, message: impl Into<String>) {
        let issue = Issue::new(component, message);
        warn!(project = %self.project, "{}", issue);
        self.warnings.push(issue);
    }

    fn fail(&mut self, component: Component, err: &DevhostError) {
        let issue = Issue::from_error(component, err);
        error!(project = %self.project, "{}", issue);
        self.errors.push(issue);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StopResult {
    pub project: String,
    pub state: ProjectState,
    pub dry_run: bool,
    /// Generated files removed (or that would be)
    pub removed: Vec<PathBuf>,
    /// Shared services no other project uses
    pub stopped_services: Vec<String>,
    /// Shared services other projects still declare
    pub kept_services: Vec<String>,
    pub warnings: Vec<Issue>,
    pub errors: Vec<Issue>,
}

impl StopResult {
    fn new(project: &str, dry_run: bool) -> Self {
        Self {
            project: project.to_string(),
            state: ProjectState::Started,
            dry_run,
            removed: Vec::new(),
            stopped_services: Vec::new(),
            kept_services: Vec::new(),
            warnings: Vec::new(),
            errors: Vec::new(),
        }
    }

    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }

    fn warn(&mut self, component: Component, message: impl Into<String>) {
        let issue = Issue::new(component, message);
        warn!(project = %self.project, "{}", issue);
        self.warnings.push(issue);
    }

    fn fail(&mut self, component: Component, err: &DevhostError) {
        let issue = Issue::from_error(component, err);
        error!(project = %self.project, "{}", issue);
        self.errors.push(issue);
    }
}

/// State of a shared service as seen by `check`
#[derive(Debug, Clone, Serialize)]
pub struct ServiceCheck {
    pub service: String,
    pub container: String,
    pub port: u16,
    pub users: Vec<String>,
    /// `None` when the container daemon could not be asked
    pub running: Option<bool>,
}

/// Host-global PHP settings for one version as seen by `check`
#[derive(Debug, Clone, Serialize)]
pub struct SystemIniCheck {
    pub php_version: String,
    pub owner: Option<SystemIniOwner>,
    pub activation: ActivationState,
    pub enable_command: String,
    pub disable_command: String,
}

/// State of the current project as seen by `check`
#[derive(Debug, Clone, Serialize)]
pub struct ProjectCheck {
    pub name: String,
    pub materialized: bool,
    /// The descriptor differs from what was last started
    pub drifted: bool,
    pub pool_file: Option<PathBuf>,
    pub vhost_file: Option<PathBuf>,
    pub missing_certificates: Vec<String>,
}

/// Read-only report of the reconciled state
#[derive(Debug, Clone, Serialize)]
pub struct CheckReport {
    pub project: Option<ProjectCheck>,
    pub projects: Vec<String>,
    pub incomplete: Vec<String>,
    pub services: Vec<ServiceCheck>,
    /// Compose services no discovered project declares
    pub orphans: Vec<String>,
    pub system_ini: Vec<SystemIniCheck>,
    pub warnings: Vec<Issue>,
    pub errors: Vec<Issue>,
}

impl CheckReport {
    pub fn has_errors(&self) -> bool {
        !self.errors.is_empty()
    }
}

pub struct Reconciler {
    paths: Paths,
    global: GlobalConfig,
    allocator: PortAllocator,
    compose: ComposeManager,
    pools: PoolManager,
    system_ini: SystemIniArbiter,
    vhosts: VhostManager,
    ssl: SslManager,
    dns: DnsManager,
}

impl Reconciler {
    pub fn new(
        paths: Paths,
        global: GlobalConfig,
        runner: Arc<dyn CommandRunner>,
        runtime: Arc<dyn ContainerRuntime>,
    ) -> Result<Self> {
        let allocator = PortAllocator::with_overrides(&global.ports)?;
        allocator.validate()?;

        let compose = ComposeManager::new(paths.clone(), allocator.clone(), runner.clone(), runtime)
            .with_backend_port(global.nginx.backend_port)
            .with_ready_timeout(Duration::from_secs(global.service_ready_timeout_secs));
        let pools = PoolManager::new(
            paths.clone(),
            &global.php.reload_command,
            global.php.pool_user.as_deref(),
            runner.clone(),
        );
        let system_ini = SystemIniArbiter::new(
            paths.clone(),
            &global.php.scan_dir,
            global.privilege(),
            runner.clone(),
        );
        let vhosts = VhostManager::new(
            paths.clone(),
            &global.nginx.test_command,
            &global.nginx.reload_command,
            global.nginx.backend_port,
            runner.clone(),
        );
        let ssl = SslManager::new(paths.clone(), &global.ssl.trust_command, runner.clone());
        let dns = DnsManager::new(paths.clone(), global.clone(), runner);

        Ok(Self {
            paths,
            global,
            allocator,
            compose,
            pools,
            system_ini,
            vhosts,
            ssl,
            dns,
        })
    }

    pub fn paths(&self) -> &Paths {
        &self.paths
    }

    pub fn global(&self) -> &GlobalConfig {
        &self.global
    }

    pub fn system_ini(&self) -> &SystemIniArbiter {
        &self.system_ini
    }

    pub async fn discover(&self) -> Result<DiscoveryReport> {
        discovery::scan(&self.paths).await
    }

    fn transition(project: &str, state: ProjectState) {
        debug!(project, state = ?state, "Project state");
    }

    /// Desired container state with `config` replacing its own marker
    fn desired_with(&self, known: &DiscoveryReport, config: &ProjectConfig) -> Result<DesiredState> {
        let own = config.services.resolved();
        let projects = known
            .others(&config.name)
            .map(|p| (p.name.as_str(), &p.services))
            .chain(std::iter::once((config.name.as_str(), &own)));
        self.compose.desired(projects)
    }

    fn desired_without(&self, known: &DiscoveryReport, project: &str) -> Result<DesiredState> {
        self.compose
            .desired(known.others(project).map(|p| (p.name.as_str(), &p.services)))
    }

    /// Validate `config` against itself and every other known project
    ///
    /// Returns warnings for discouraged combinations. Structural problems
    /// and cross-project domain clashes are a `Config` error; services
    /// resolving to one port are a `ResourceConflict`.
    pub async fn validate(&self, config: &ProjectConfig) -> Result<Vec<Issue>> {
        let mut warnings = config.validate()?;
        php::split(&config.php_ini)?;

        for (kind, version) in config.services.resolved() {
            if self.allocator.port(kind, &version).fallback {
                warnings.push(Issue::new(
                    Component::Ports,
                    format!(
                        "{} {} is not a known version; using the port of {} {}",
                        kind,
                        version,
                        kind,
                        kind.default_version()
                    ),
                ));
            }
        }

        let known = self.discover().await?;
        let hosts: BTreeSet<String> = config.hosts().into_iter().collect();
        let mut problems = Vec::new();
        for other in known.others(&config.name) {
            for domain in &other.domains {
                if hosts.contains(domain) {
                    problems.push(format!(
                        "domain '{}' is already served by project '{}'",
                        domain, other.name
                    ));
                }
            }
        }
        if !problems.is_empty() {
            return Err(DevhostError::Config { problems });
        }

        self.desired_with(&known, config)?;
        Self::transition(&config.name, ProjectState::Validated);
        Ok(warnings)
    }

    /// Bring a project up
    ///
    /// Runs containers, PHP pool, vhost write, certificates, proxy
    /// reload and DNS in that order. Returns `Err` only when validation
    /// fails or the project directory cannot be created.
    pub async fn start(&self, config: &ProjectConfig) -> Result<StartResult> {
        let mut result = StartResult::new(&config.name, &config.php);
        result.warnings = self.validate(config).await?;
        result.state = ProjectState::Validated;
        result.domains = config.hosts();

        Self::transition(&config.name, ProjectState::Starting);
        result.state = ProjectState::Starting;
        info!(project = %config.name, php = %config.php, "Starting project");

        let logs = self.paths.logs_dir(&config.name);
        tokio::fs::create_dir_all(&logs)
            .await
            .map_err(|e| DevhostError::io(&logs, e))?;

        let known = self.discover().await?;
        let desired = self.desired_with(&known, config)?;

        self.start_containers(config, &desired, &mut result).await;
        self.start_php(config, known.get(&config.name), &mut result).await;

        let cache_port = config
            .services
            .resolved()
            .get(&ServiceKind::Varnish)
            .and_then(|version| desired.get(ServiceKind::Varnish, version))
            .map(|s| s.instance.port);
        let pending = match self.vhosts.write(config, cache_port) {
            Ok(pending) => Some(pending),
            Err(e) => {
                result.fail(Component::Vhost, &e);
                None
            }
        };

        self.start_ssl(config, &mut result).await;

        if let Some(pending) = pending.filter(|p| p.needs_reload()) {
            if let Err(e) = self.vhosts.activate(&pending).await {
                result.fail(Component::Vhost, &e);
            }
        }

        let mut domains: BTreeSet<String> = known
            .others(&config.name)
            .flat_map(|p| p.domains.iter().cloned())
            .collect();
        domains.extend(config.hosts());
        self.refresh_dns(&domains, &mut result.warnings, &mut result.errors)
            .await;

        Self::transition(&config.name, ProjectState::Started);
        result.state = ProjectState::Started;
        info!(
            project = %config.name,
            warnings = result.warnings.len(),
            errors = result.errors.len(),
            "Project started"
        );
        Ok(result)
    }

    async fn start_containers(
        &self,
        config: &ProjectConfig,
        desired: &DesiredState,
        result: &mut StartResult,
    ) {
        if let Err(e) = self.compose.write(desired) {
            result.fail(Component::Containers, &e);
            return;
        }

        let services = config.services.resolved();
        if services.is_empty() {
            return;
        }

        if let Err(e) = self.compose.ensure_daemon().await {
            result.fail(Component::Containers, &e);
            return;
        }

        for (kind, version) in &services {
            let Some(service) = desired.get(*kind, version) else {
                continue;
            };
            let instance = &service.instance;
            match self.compose.is_service_running(instance).await {
                Ok(true) => debug!(service = %instance.service_name(), "Service already running"),
                Ok(false) | Err(_) => {
                    if let Err(e) = self.compose.up(instance).await {
                        result.warn(
                            Component::Containers,
                            format!("{} did not start: {}", instance.service_name(), message_of(&e)),
                        );
                        continue;
                    }
                }
            }
            result.services.push(instance.clone());
        }

        let Some((kind, version)) = config.relational_engine() else {
            return;
        };
        let Some(instance) = result
            .services
            .iter()
            .find(|s| s.kind == kind && s.version == version)
            .cloned()
        else {
            return;
        };
        let database = config.database_name();
        let outcome = match self.compose.wait_ready(&instance).await {
            Ok(()) => self.compose.ensure_database(&instance, &database).await,
            Err(e) => Err(e),
        };
        if let Err(e) = outcome {
            result.warn(
                Component::Containers,
                format!("database '{}' not ensured: {}", database, message_of(&e)),
            );
        }
    }

    async fn start_php(
        &self,
        config: &ProjectConfig,
        previous: Option<&ProjectMarker>,
        result: &mut StartResult,
    ) {
        if let Some(previous) = previous.filter(|p| p.php != config.php) {
            let moved = match self.pools.remove(&previous.php, &config.name) {
                Ok(_) if self.pools.reload_pending(&previous.php) => {
                    self.pools.reload(&previous.php).await
                }
                Ok(_) => Ok(()),
                Err(e) => Err(e),
            };
            if let Err(e) = moved {
                result.warn(
                    Component::PhpPool,
                    format!("old PHP {} pool not retired: {}", previous.php, message_of(&e)),
                );
            }
        }

        let split = match php::split(&config.php_ini) {
            Ok(split) => split,
            Err(e) => {
                result.fail(Component::PhpPool, &e);
                return;
            }
        };

        match self.pools.write(config, &split.pool) {
            Ok(_) if self.pools.reload_pending(&config.php) => {
                if let Err(e) = self.pools.reload(&config.php).await {
                    result.fail(Component::PhpPool, &e);
                }
            }
            Ok(_) => {}
            Err(e) => result.fail(Component::PhpPool, &e),
        }

        if split.system.is_empty() {
            return;
        }

        match self
            .system_ini
            .claim(&config.php, &config.name, &config.path, &split.system)
        {
            Ok(ClaimOutcome::Replaced { previous }) => result.warn(
                Component::SystemIni,
                format!(
                    "host-global PHP {} settings now owned by '{}', replacing '{}' ({})",
                    config.php,
                    config.name,
                    previous.project_name,
                    previous.project_path.display()
                ),
            ),
            Ok(_) => {}
            Err(e) => {
                result.fail(Component::SystemIni, &e);
                return;
            }
        }

        match self.system_ini.activation_state(&config.php) {
            ActivationState::Active { stale: false } => {}
            ActivationState::Active { stale: true } => result.warn(
                Component::SystemIni,
                format!(
                    "active host-global PHP {} settings are out of date; apply with: devhost php system-ini enable {}",
                    config.php, config.php
                ),
            ),
            ActivationState::Inactive => result.warn(
                Component::SystemIni,
                format!(
                    "host-global PHP {} settings are staged but not active; apply with: {}",
                    config.php,
                    self.system_ini.enable_command(&config.php)
                ),
            ),
            ActivationState::Foreign { .. } => result.warn(
                Component::SystemIni,
                format!(
                    "{} is not managed by devhost; host-global settings stay staged",
                    self.system_ini.link_path(&config.php).display()
                ),
            ),
        }
    }

    async fn start_ssl(&self, config: &ProjectConfig, result: &mut StartResult) {
        let ssl_domains: Vec<String> = config
            .domains
            .iter()
            .filter(|d| d.ssl)
            .map(DomainConfig::host_name)
            .collect();
        if ssl_domains.is_empty() {
            return;
        }

        if let Err(e) = self.ssl.ensure_ca().await {
            result.fail(Component::Ssl, &e);
            return;
        }
        if let Err(e) = self.ssl.ensure_trusted().await {
            result.warn(
                Component::Ssl,
                format!("local CA is not trusted by the system: {}", message_of(&e)),
            );
        }
        for domain in &ssl_domains {
            if let Err(e) = self.ssl.ensure_certificate(domain).await {
                result.fail(Component::Ssl, &e);
            }
        }
    }

    async fn refresh_dns(
        &self,
        domains: &BTreeSet<String>,
        warnings: &mut Vec<Issue>,
        errors: &mut Vec<Issue>,
    ) {
        match self.dns.apply(domains).await {
            Ok(report) => warnings.extend(report.warnings),
            Err(e) => {
                let issue = Issue::from_error(Component::Dns, &e);
                error!("{}", issue);
                errors.push(issue);
            }
        }
    }

    /// Stop a project using what was materialized for it, if anything
    pub async fn stop(&self, config: &ProjectConfig, dry_run: bool) -> Result<StopResult> {
        let marker_path = self.paths.marker_file(&config.name);
        let marker = if marker_path.exists() {
            ProjectMarker::load(&marker_path)?
        } else {
            ProjectMarker::from_config(config)
        };
        self.stop_project(&marker, dry_run).await
    }

    /// Remove the project's vhost and pool, stop services nobody else uses
    pub async fn stop_project(&self, marker: &ProjectMarker, dry_run: bool) -> Result<StopResult> {
        let mut result = StopResult::new(&marker.name, dry_run);
        let known = self.discover().await?;

        for path in [
            self.paths.vhost_file(&marker.name),
            self.paths.marker_file(&marker.name),
            self.paths.pool_file(&marker.php, &marker.name),
        ] {
            if path.exists() {
                result.removed.push(path);
            }
        }

        let desired = match self.desired_without(&known, &marker.name) {
            Ok(desired) => Some(desired),
            Err(e) => {
                result.fail(Component::Containers, &e);
                None
            }
        };
        let mut to_stop = Vec::new();
        for (kind, version) in &marker.services {
            let (instance, _) = self.compose.allocate(*kind, version);
            let users = desired
                .as_ref()
                .map_or(1, |d| d.usage_count(*kind, version));
            if users == 0 {
                result.stopped_services.push(instance.service_name());
                to_stop.push(instance);
            } else {
                result.kept_services.push(instance.service_name());
            }
        }

        if dry_run {
            info!(project = %marker.name, "Dry run, nothing changed");
            return Ok(result);
        }

        Self::transition(&marker.name, ProjectState::Stopping);
        result.state = ProjectState::Stopping;
        info!(project = %marker.name, "Stopping project");

        match self.vhosts.remove(&marker.name) {
            Ok(pending) if pending.needs_reload() => {
                if let Err(e) = self.vhosts.activate(&pending).await {
                    result.fail(Component::Vhost, &e);
                }
            }
            Ok(_) => {}
            Err(e) => result.fail(Component::Vhost, &e),
        }

        match self.pools.remove(&marker.php, &marker.name) {
            Ok(_) if self.pools.reload_pending(&marker.php) => {
                if let Err(e) = self.pools.reload(&marker.php).await {
                    result.fail(Component::PhpPool, &e);
                }
            }
            Ok(_) => {}
            Err(e) => result.fail(Component::PhpPool, &e),
        }

        // Stop before rewriting the definition; compose only stops
        // services it still finds in the file.
        if !to_stop.is_empty() {
            match self.compose.ensure_daemon().await {
                Ok(()) => {
                    for instance in &to_stop {
                        let running = self.compose.is_service_running(instance).await;
                        if matches!(running, Ok(false)) {
                            continue;
                        }
                        if let Err(e) = self.compose.stop(instance).await {
                            result.warn(
                                Component::Containers,
                                format!(
                                    "{} did not stop: {}",
                                    instance.service_name(),
                                    message_of(&e)
                                ),
                            );
                        }
                    }
                }
                Err(e) => result.fail(Component::Containers, &e),
            }
        }

        if let Some(desired) = &desired {
            if let Err(e) = self.compose.write(desired) {
                result.fail(Component::Containers, &e);
            }
        }

        let domains: BTreeSet<String> = known
            .others(&marker.name)
            .flat_map(|p| p.domains.iter().cloned())
            .collect();
        self.refresh_dns(&domains, &mut result.warnings, &mut result.errors)
            .await;

        Self::transition(&marker.name, ProjectState::Stopped);
        result.state = ProjectState::Stopped;
        info!(project = %marker.name, stopped = to_stop.len(), "Project stopped");
        Ok(result)
    }

    /// Stop then start; stop failures become warnings
    ///
    /// The new descriptor is validated first, so an invalid one leaves
    /// the running project untouched.
    pub async fn restart(&self, config: &ProjectConfig) -> Result<StartResult> {
        self.validate(config).await?;
        let stop_warnings = match self.stop(config, false).await {
            Ok(stopped) => stopped
                .warnings
                .into_iter()
                .chain(stopped.errors)
                .collect(),
            Err(e) => vec![Issue::from_error(Component::Project, &e)],
        };

        let mut result = self.start(config).await?;
        let mut warnings = stop_warnings;
        warnings.append(&mut result.warnings);
        result.warnings = warnings;
        Ok(result)
    }

    async fn load_discovered(&self) -> Result<Vec<(ProjectMarker, Result<ProjectConfig>)>> {
        let known = self.discover().await?;
        Ok(known
            .projects
            .into_iter()
            .map(|marker| {
                let config = ProjectConfig::load(&marker.path);
                (marker, config)
            })
            .collect())
    }

    pub async fn start_all(&self) -> Result<Vec<StartResult>> {
        let mut results = Vec::new();
        for (marker, config) in self.load_discovered().await? {
            let outcome = match config {
                Ok(config) => self.start(&config).await,
                Err(e) => Err(e),
            };
            results.push(outcome.unwrap_or_else(|e| StartResult::failed(&marker.name, &e)));
        }
        Ok(results)
    }

    pub async fn restart_all(&self) -> Result<Vec<StartResult>> {
        let mut results = Vec::new();
        for (marker, config) in self.load_discovered().await? {
            let outcome = match config {
                Ok(config) => self.restart(&config).await,
                Err(e) => Err(e),
            };
            results.push(outcome.unwrap_or_else(|e| StartResult::failed(&marker.name, &e)));
        }
        Ok(results)
    }

    pub async fn stop_all(&self, dry_run: bool) -> Result<Vec<StopResult>> {
        let known = self.discover().await?;
        let mut results = Vec::new();
        for marker in &known.projects {
            results.push(self.stop_project(marker, dry_run).await?);
        }
        Ok(results)
    }

    /// Read-only view of the reconciled state
    pub async fn check(&self, config: Option<&ProjectConfig>) -> Result<CheckReport> {
        let known = self.discover().await?;
        let mut report = CheckReport {
            project: None,
            projects: known.projects.iter().map(|p| p.name.clone()).collect(),
            incomplete: known.incomplete.clone(),
            services: Vec::new(),
            orphans: Vec::new(),
            system_ini: Vec::new(),
            warnings: known.issues.clone(),
            errors: Vec::new(),
        };

        for name in &known.incomplete {
            report.warnings.push(Issue::new(
                Component::Discovery,
                format!("vhost for '{}' has no project marker; run start in that project again", name),
            ));
        }

        if let Some(config) = config {
            match self.validate(config).await {
                Ok(warnings) => report.warnings.extend(warnings),
                Err(e) => report.errors.push(Issue::from_error(Component::Config, &e)),
            }
            report.project = Some(self.check_project(config, &known));
        }

        match discovery::orphans(&self.compose.definition_path(), &known.projects) {
            Ok(orphans) => {
                for orphan in &orphans {
                    report.warnings.push(Issue::new(
                        Component::Discovery,
                        format!(
                            "compose service '{}' is not declared by any project; it is dropped on the next start or stop",
                            orphan
                        ),
                    ));
                }
                report.orphans = orphans.into_iter().collect();
            }
            Err(e) => report.warnings.push(Issue::from_error(Component::Containers, &e)),
        }

        match self
            .compose
            .desired(known.projects.iter().map(|p| (p.name.as_str(), &p.services)))
        {
            Ok(desired) => {
                let daemon = self.compose.ensure_daemon().await;
                if let Err(e) = &daemon {
                    report.warnings.push(Issue::from_error(Component::Containers, e));
                }
                for service in desired.services() {
                    let running = if daemon.is_ok() {
                        self.compose.is_service_running(&service.instance).await.ok()
                    } else {
                        None
                    };
                    report.services.push(ServiceCheck {
                        service: service.instance.service_name(),
                        container: service.instance.container_name.clone(),
                        port: service.instance.port,
                        users: service.users.iter().cloned().collect(),
                        running,
                    });
                }
            }
            Err(e) => report.errors.push(Issue::from_error(Component::Ports, &e)),
        }

        let mut versions: BTreeSet<String> = known.projects.iter().map(|p| p.php.clone()).collect();
        if let Some(config) = config {
            versions.insert(config.php.clone());
        }
        for version in versions {
            let owner = match self.system_ini.current_owner(&version) {
                Ok(owner) => owner,
                Err(e) => {
                    report.warnings.push(Issue::from_error(Component::SystemIni, &e));
                    None
                }
            };
            let activation = self.system_ini.activation_state(&version);
            if owner.is_none() && activation == ActivationState::Inactive {
                continue;
            }
            report.system_ini.push(SystemIniCheck {
                enable_command: self.system_ini.enable_command(&version),
                disable_command: self.system_ini.disable_command(&version),
                php_version: version,
                owner,
                activation,
            });
        }

        Ok(report)
    }

    fn check_project(&self, config: &ProjectConfig, known: &DiscoveryReport) -> ProjectCheck {
        let marker = known.get(&config.name);
        let existing = |path: PathBuf| path.exists().then_some(path);
        ProjectCheck {
            name: config.name.clone(),
            materialized: marker.is_some(),
            drifted: marker.is_some_and(|m| *m != ProjectMarker::from_config(config)),
            pool_file: existing(self.paths.pool_file(&config.php, &config.name)),
            vhost_file: existing(self.paths.vhost_file(&config.name)),
            missing_certificates: config
                .domains
                .iter()
                .filter(|d| d.ssl)
                .map(DomainConfig::host_name)
                .filter(|host| !self.paths.cert_file(host).exists())
                .collect(),
        }
    }

    /// Activate the staged host-global settings and reload the runtime
    pub async fn enable_system_ini(&self, version: &str) -> Result<()> {
        self.system_ini.enable(version).await?;
        self.pools.reload(version).await
    }

    /// Deactivate the host-global settings. Returns whether a link was removed.
    pub async fn disable_system_ini(&self, version: &str) -> Result<bool> {
        let removed = self.system_ini.disable(version).await?;
        if removed {
            self.pools.reload(version).await?;
        }
        Ok(removed)
    }
}

fn message_of(error: &DevhostError) -> String {
    match error {
        DevhostError::ExternalTool { message, .. } => message.clone(),
        other => other.to_string(),
    }
}
