//! Project descriptors and host-level configuration
//!
//! A project is described by a `.devhost.toml` at its root:
//!
//! ```toml
//! name = "shop"
//! php = "8.3"
//!
//! [[domains]]
//! host = "shop.test"
//! root = "pub"
//!
//! [services]
//! mysql = "8.0"
//! redis = true
//!
//! [php_ini]
//! memory_limit = "2G"
//! "opcache.preload" = "/app/preload.php"
//! ```
//!
//! Host-level settings (TLD, DNS strategy, reload commands) live in
//! `config.toml` under the state root.

use crate::error::{Component, DevhostError, Issue, Result};
use crate::paths::Paths;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::path::{Component as PathComponent, Path, PathBuf};
use std::str::FromStr;
use std::sync::OnceLock;

/// File name of the per-project descriptor
pub const DESCRIPTOR_FILE: &str = ".devhost.toml";

/// PHP version used when the descriptor does not name one
pub const DEFAULT_PHP: &str = "8.3";

/// PHP versions with packaged FastCGI runtimes
pub const SUPPORTED_PHP: &[&str] = &["7.4", "8.1", "8.2", "8.3", "8.4"];

/// Resolved service versions keyed by kind
pub type ServiceSet = BTreeMap<ServiceKind, String>;

/// Kind of shared container service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceKind {
    Mysql,
    Mariadb,
    Redis,
    Opensearch,
    Elasticsearch,
    Rabbitmq,
    Mailpit,
    Varnish,
}

impl ServiceKind {
    pub const ALL: [ServiceKind; 8] = [
        ServiceKind::Mysql,
        ServiceKind::Mariadb,
        ServiceKind::Redis,
        ServiceKind::Opensearch,
        ServiceKind::Elasticsearch,
        ServiceKind::Rabbitmq,
        ServiceKind::Mailpit,
        ServiceKind::Varnish,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ServiceKind::Mysql => "mysql",
            ServiceKind::Mariadb => "mariadb",
            ServiceKind::Redis => "redis",
            ServiceKind::Opensearch => "opensearch",
            ServiceKind::Elasticsearch => "elasticsearch",
            ServiceKind::Rabbitmq => "rabbitmq",
            ServiceKind::Mailpit => "mailpit",
            ServiceKind::Varnish => "varnish",
        }
    }

    /// MySQL and MariaDB fill the same role and share a port namespace
    pub fn is_relational(&self) -> bool {
        matches!(self, ServiceKind::Mysql | ServiceKind::Mariadb)
    }

    /// Latest stable version, used for `kind = true` and unknown versions
    pub fn default_version(&self) -> &'static str {
        match self {
            ServiceKind::Mysql => "8.4",
            ServiceKind::Mariadb => "11.4",
            ServiceKind::Redis => "7.4",
            ServiceKind::Opensearch => "2.19",
            ServiceKind::Elasticsearch => "8.17",
            ServiceKind::Rabbitmq => "4.0",
            ServiceKind::Mailpit => "1.24",
            ServiceKind::Varnish => "7.6",
        }
    }
}

impl fmt::Display for ServiceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ServiceKind {
    type Err = DevhostError;

    fn from_str(s: &str) -> Result<Self> {
        ServiceKind::ALL
            .into_iter()
            .find(|kind| kind.as_str() == s.trim().to_lowercase())
            .ok_or_else(|| DevhostError::config(format!("unknown service kind '{}'", s)))
    }
}

/// A service entry: a version string, or a boolean toggle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ServiceSetting {
    Enabled(bool),
    Version(String),
}

impl ServiceSetting {
    /// Resolved version, or `None` when the service is disabled
    pub fn version(&self, kind: ServiceKind) -> Option<String> {
        match self {
            ServiceSetting::Enabled(true) => Some(kind.default_version().to_string()),
            ServiceSetting::Enabled(false) => None,
            ServiceSetting::Version(v) => Some(v.trim().to_string()),
        }
    }
}

/// Services a project declares
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Services {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mysql: Option<ServiceSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mariadb: Option<ServiceSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub redis: Option<ServiceSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub opensearch: Option<ServiceSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub elasticsearch: Option<ServiceSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rabbitmq: Option<ServiceSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mailpit: Option<ServiceSetting>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub varnish: Option<ServiceSetting>,
}

impl Services {
    pub fn get(&self, kind: ServiceKind) -> Option<&ServiceSetting> {
        match kind {
            ServiceKind::Mysql => self.mysql.as_ref(),
            ServiceKind::Mariadb => self.mariadb.as_ref(),
            ServiceKind::Redis => self.redis.as_ref(),
            ServiceKind::Opensearch => self.opensearch.as_ref(),
            ServiceKind::Elasticsearch => self.elasticsearch.as_ref(),
            ServiceKind::Rabbitmq => self.rabbitmq.as_ref(),
            ServiceKind::Mailpit => self.mailpit.as_ref(),
            ServiceKind::Varnish => self.varnish.as_ref(),
        }
    }

    pub fn set(&mut self, kind: ServiceKind, setting: ServiceSetting) {
        let slot = match kind {
            ServiceKind::Mysql => &mut self.mysql,
            ServiceKind::Mariadb => &mut self.mariadb,
            ServiceKind::Redis => &mut self.redis,
            ServiceKind::Opensearch => &mut self.opensearch,
            ServiceKind::Elasticsearch => &mut self.elasticsearch,
            ServiceKind::Rabbitmq => &mut self.rabbitmq,
            ServiceKind::Mailpit => &mut self.mailpit,
            ServiceKind::Varnish => &mut self.varnish,
        };
        *slot = Some(setting);
    }

    /// Enabled services with their resolved versions, in kind order
    pub fn declared(&self) -> Vec<(ServiceKind, String)> {
        ServiceKind::ALL
            .into_iter()
            .filter_map(|kind| {
                self.get(kind)
                    .and_then(|s| s.version(kind))
                    .map(|version| (kind, version))
            })
            .collect()
    }

    pub fn resolved(&self) -> ServiceSet {
        self.declared().into_iter().collect()
    }

    pub fn is_enabled(&self, kind: ServiceKind) -> bool {
        self.get(kind).and_then(|s| s.version(kind)).is_some()
    }
}

/// One host served by the project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainConfig {
    pub host: String,

    /// Document root relative to the project directory
    #[serde(default = "default_root")]
    pub root: String,

    /// Terminate TLS for this host (default: true)
    #[serde(default = "default_true")]
    pub ssl: bool,
}

impl DomainConfig {
    pub fn new(host: &str) -> Self {
        Self {
            host: host.to_string(),
            root: default_root(),
            ssl: true,
        }
    }

    pub fn with_root(mut self, root: &str) -> Self {
        self.root = root.to_string();
        self
    }

    pub fn with_ssl(mut self, ssl: bool) -> Self {
        self.ssl = ssl;
        self
    }

    /// The host in the form every generated file and comparison uses
    pub fn host_name(&self) -> String {
        canonical_host(&self.host)
    }
}

/// A custom command definition
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CommandDef {
    Simple(String),
    Detailed {
        run: String,
        #[serde(default)]
        description: Option<String>,
    },
}

impl CommandDef {
    pub fn run(&self) -> &str {
        match self {
            CommandDef::Simple(run) => run,
            CommandDef::Detailed { run, .. } => run,
        }
    }

    pub fn description(&self) -> Option<&str> {
        match self {
            CommandDef::Simple(_) => None,
            CommandDef::Detailed { description, .. } => description.as_deref(),
        }
    }
}

/// Per-project descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectConfig {
    pub name: String,

    /// PHP runtime version (default: 8.3)
    #[serde(default = "default_php")]
    pub php: String,

    /// Logical database name inside the shared relational engine
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub database: Option<String>,

    #[serde(default)]
    pub domains: Vec<DomainConfig>,

    #[serde(default)]
    pub services: Services,

    /// php.ini overrides; pool-scope or host-global depending on the directive
    #[serde(default)]
    pub php_ini: BTreeMap<String, toml::Value>,

    #[serde(default)]
    pub commands: BTreeMap<String, CommandDef>,

    /// Project root directory (set on load, not part of the descriptor)
    #[serde(skip)]
    pub path: PathBuf,
}

fn default_root() -> String {
    ".".to_string()
}

fn default_true() -> bool {
    true
}

fn default_php() -> String {
    DEFAULT_PHP.to_string()
}

fn regex(cell: &'static OnceLock<Regex>, pattern: &str) -> &'static Regex {
    cell.get_or_init(|| Regex::new(pattern).expect("static pattern compiles"))
}

fn project_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^[a-z0-9][a-z0-9_-]{0,62}$")
}

fn php_version_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^\d+\.\d+$")
}

fn database_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^[A-Za-z0-9_]{1,64}$")
}

pub(crate) fn ini_name_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    regex(&RE, r"^[A-Za-z_][A-Za-z0-9_.]*$")
}

impl ProjectConfig {
    /// Load a descriptor from a project directory or a descriptor path
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = if path.is_dir() {
            path.join(DESCRIPTOR_FILE)
        } else {
            path.to_path_buf()
        };
        let content = std::fs::read_to_string(&file).map_err(|e| DevhostError::io(&file, e))?;
        let mut config = Self::from_toml(&content).map_err(|e| match e {
            DevhostError::Config { problems } => DevhostError::Config {
                problems: problems
                    .into_iter()
                    .map(|p| format!("{}: {}", file.display(), p))
                    .collect(),
            },
            other => other,
        })?;
        let dir = file.parent().unwrap_or_else(|| Path::new("."));
        config.path = std::fs::canonicalize(dir).map_err(|e| DevhostError::io(dir, e))?;
        Ok(config)
    }

    /// Walk up from `start` looking for a descriptor
    pub fn find(start: &Path) -> Option<PathBuf> {
        start
            .ancestors()
            .map(|dir| dir.join(DESCRIPTOR_FILE))
            .find(|candidate| candidate.is_file())
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| DevhostError::config(e.to_string()))
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).map_err(|e| DevhostError::config(e.to_string()))
    }

    /// Database name, defaulting to the project name with `-`/`.` mapped to `_`
    pub fn database_name(&self) -> String {
        self.database
            .clone()
            .unwrap_or_else(|| self.name.replace(['-', '.'], "_"))
    }

    pub fn hosts(&self) -> Vec<String> {
        self.domains.iter().map(DomainConfig::host_name).collect()
    }

    pub fn relational_engine(&self) -> Option<(ServiceKind, String)> {
        self.services
            .declared()
            .into_iter()
            .find(|(kind, _)| kind.is_relational())
    }

    pub fn document_root(&self, domain: &DomainConfig) -> PathBuf {
        if domain.root == "." {
            self.path.clone()
        } else {
            self.path.join(&domain.root)
        }
    }

    /// Structural and semantic checks
    ///
    /// Returns warnings for discouraged-but-allowed combinations, or a
    /// `Config` error listing every structural problem found.
    pub fn validate(&self) -> Result<Vec<Issue>> {
        let mut problems = Vec::new();
        let mut warnings = Vec::new();

        if !project_name_re().is_match(&self.name) {
            problems.push(format!(
                "project name '{}' must be lowercase letters, digits, '-' or '_'",
                self.name
            ));
        }

        if self.domains.is_empty() {
            problems.push("at least one domain is required".to_string());
        }

        let mut seen = BTreeSet::new();
        for domain in &self.domains {
            match normalize_host(&domain.host) {
                Ok(host) => {
                    if !seen.insert(host.clone()) {
                        problems.push(format!("domain '{}' is declared more than once", host));
                    }
                }
                Err(e) => problems.push(e),
            }
            if let Err(e) = check_relative_root(&domain.root) {
                problems.push(format!("domain '{}': {}", domain.host, e));
            } else if !self.path.as_os_str().is_empty() && !self.document_root(domain).is_dir() {
                warnings.push(Issue::new(
                    Component::Config,
                    format!(
                        "document root {} for '{}' does not exist yet",
                        self.document_root(domain).display(),
                        domain.host
                    ),
                ));
            }
        }

        if !php_version_re().is_match(&self.php) {
            problems.push(format!("php version '{}' must look like '8.3'", self.php));
        } else if !SUPPORTED_PHP.contains(&self.php.as_str()) {
            warnings.push(Issue::new(
                Component::Config,
                format!(
                    "php {} is not a supported version ({})",
                    self.php,
                    SUPPORTED_PHP.join(", ")
                ),
            ));
        }

        if self.services.is_enabled(ServiceKind::Mysql)
            && self.services.is_enabled(ServiceKind::Mariadb)
        {
            problems.push("mysql and mariadb cannot both be enabled".to_string());
        }

        for (kind, version) in self.services.declared() {
            if version.is_empty() {
                problems.push(format!("service '{}' has an empty version", kind));
            }
        }

        if self.services.is_enabled(ServiceKind::Opensearch)
            && self.services.is_enabled(ServiceKind::Elasticsearch)
        {
            warnings.push(Issue::new(
                Component::Config,
                "both opensearch and elasticsearch are enabled; one search engine is usually enough",
            ));
        }

        if self.relational_engine().is_some() && !database_re().is_match(&self.database_name()) {
            problems.push(format!(
                "database name '{}' must be letters, digits or '_'",
                self.database_name()
            ));
        }

        for key in self.php_ini.keys() {
            if !ini_name_re().is_match(key) {
                problems.push(format!("'{}' is not a valid php.ini directive name", key));
            }
        }

        for (name, command) in &self.commands {
            if command.run().trim().is_empty() {
                problems.push(format!("command '{}' has nothing to run", name));
            }
        }

        if !problems.is_empty() {
            return Err(DevhostError::Config { problems });
        }
        Ok(warnings)
    }
}

fn canonical_host(host: &str) -> String {
    host.trim().to_lowercase()
}

/// Normalize a host name (lowercase, trimmed) and check its syntax
pub fn normalize_host(host: &str) -> std::result::Result<String, String> {
    let host = canonical_host(host);

    if host.is_empty() {
        return Err("domain host cannot be empty".to_string());
    }
    if host.len() > 253 {
        return Err(format!("domain '{}' is too long", host));
    }
    if host.contains('*') {
        return Err(format!("domain '{}': wildcard hosts are not supported", host));
    }

    for label in host.split('.') {
        let valid = !label.is_empty()
            && label.len() <= 63
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label.chars().all(|c| c.is_ascii_alphanumeric() || c == '-');
        if !valid {
            return Err(format!("domain '{}' is not a valid host name", host));
        }
    }

    Ok(host)
}

fn check_relative_root(root: &str) -> std::result::Result<(), String> {
    let path = Path::new(root);
    if path.is_absolute() {
        return Err(format!("root '{}' must be relative to the project", root));
    }
    if path.components().any(|c| matches!(c, PathComponent::ParentDir)) {
        return Err(format!("root '{}' must stay inside the project", root));
    }
    Ok(())
}

/// Builds a descriptor without prompting
///
/// `devhost init` and tests construct projects through this instead of
/// reading answers from a terminal.
#[derive(Debug, Clone)]
pub struct ProjectConfigBuilder {
    config: ProjectConfig,
}

impl ProjectConfigBuilder {
    pub fn new(name: &str, path: impl Into<PathBuf>) -> Self {
        Self {
            config: ProjectConfig {
                name: name.to_string(),
                php: default_php(),
                database: None,
                domains: Vec::new(),
                services: Services::default(),
                php_ini: BTreeMap::new(),
                commands: BTreeMap::new(),
                path: path.into(),
            },
        }
    }

    pub fn domain(mut self, host: &str) -> Self {
        self.config.domains.push(DomainConfig::new(host));
        self
    }

    pub fn domain_config(mut self, domain: DomainConfig) -> Self {
        self.config.domains.push(domain);
        self
    }

    pub fn php(mut self, version: &str) -> Self {
        self.config.php = version.to_string();
        self
    }

    pub fn service(mut self, kind: ServiceKind, version: &str) -> Self {
        self.config
            .services
            .set(kind, ServiceSetting::Version(version.to_string()));
        self
    }

    pub fn enable(mut self, kind: ServiceKind) -> Self {
        self.config.services.set(kind, ServiceSetting::Enabled(true));
        self
    }

    pub fn php_ini(mut self, name: &str, value: impl Into<toml::Value>) -> Self {
        self.config.php_ini.insert(name.to_string(), value.into());
        self
    }

    pub fn database(mut self, name: &str) -> Self {
        self.config.database = Some(name.to_string());
        self
    }

    pub fn command(mut self, name: &str, run: &str) -> Self {
        self.config
            .commands
            .insert(name.to_string(), CommandDef::Simple(run.to_string()));
        self
    }

    pub fn build(self) -> ProjectConfig {
        self.config
    }
}

/// How configured domains are made to resolve to loopback
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DnsMode {
    /// One static hosts-file entry per domain (default)
    #[default]
    Hosts,
    /// Wildcard resolver for the configured TLD
    Dnsmasq,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DnsSettings {
    #[serde(default)]
    pub mode: DnsMode,

    #[serde(default = "default_hosts_file")]
    pub hosts_file: String,

    #[serde(default = "default_dnsmasq_config")]
    pub dnsmasq_config: String,

    #[serde(default = "default_dnsmasq_restart")]
    pub restart_command: String,

    /// OS resolver registration directory (empty disables registration)
    #[serde(default = "default_resolver_dir")]
    pub resolver_dir: String,
}

impl Default for DnsSettings {
    fn default() -> Self {
        Self {
            mode: DnsMode::default(),
            hosts_file: default_hosts_file(),
            dnsmasq_config: default_dnsmasq_config(),
            restart_command: default_dnsmasq_restart(),
            resolver_dir: default_resolver_dir(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PhpSettings {
    /// Global ini scan directory; `{version}` is expanded
    #[serde(default = "default_php_scan_dir")]
    pub scan_dir: String,

    #[serde(default = "default_php_reload")]
    pub reload_command: String,

    /// User the worker pools run as (default: $USER)
    pub pool_user: Option<String>,
}

impl Default for PhpSettings {
    fn default() -> Self {
        Self {
            scan_dir: default_php_scan_dir(),
            reload_command: default_php_reload(),
            pool_user: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NginxSettings {
    #[serde(default = "default_nginx_test")]
    pub test_command: String,

    #[serde(default = "default_nginx_reload")]
    pub reload_command: String,

    /// Port the proxy listens on behind Varnish
    #[serde(default = "default_backend_port")]
    pub backend_port: u16,
}

impl Default for NginxSettings {
    fn default() -> Self {
        Self {
            test_command: default_nginx_test(),
            reload_command: default_nginx_reload(),
            backend_port: default_backend_port(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SslSettings {
    /// Command that installs the local CA into the OS trust store
    #[serde(default = "default_trust_command")]
    pub trust_command: String,
}

impl Default for SslSettings {
    fn default() -> Self {
        Self {
            trust_command: default_trust_command(),
        }
    }
}

/// Host-level configuration shared by every project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    /// Top-level domain served by the wildcard resolver
    #[serde(default = "default_tld")]
    pub tld: String,

    #[serde(default)]
    pub dns: DnsSettings,

    #[serde(default)]
    pub php: PhpSettings,

    #[serde(default)]
    pub nginx: NginxSettings,

    #[serde(default)]
    pub ssl: SslSettings,

    /// Prefix for commands needing elevated privilege (empty disables)
    #[serde(default = "default_privilege_command")]
    pub privilege_command: String,

    /// Docker endpoint (default: DOCKER_HOST or the platform socket)
    pub docker_host: Option<String>,

    /// Seconds to wait for a started service to accept commands
    #[serde(default = "default_ready_timeout")]
    pub service_ready_timeout_secs: u64,

    /// Port overrides keyed by "kind:version"
    #[serde(default)]
    pub ports: BTreeMap<String, u16>,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            tld: default_tld(),
            dns: DnsSettings::default(),
            php: PhpSettings::default(),
            nginx: NginxSettings::default(),
            ssl: SslSettings::default(),
            privilege_command: default_privilege_command(),
            docker_host: None,
            service_ready_timeout_secs: default_ready_timeout(),
            ports: BTreeMap::new(),
        }
    }
}

// Default value functions
fn default_tld() -> String {
    "test".to_string()
}

fn default_hosts_file() -> String {
    "/etc/hosts".to_string()
}

fn default_dnsmasq_config() -> String {
    if cfg!(target_os = "macos") {
        "/opt/homebrew/etc/dnsmasq.d/devhost.conf".to_string()
    } else {
        "/etc/dnsmasq.d/devhost.conf".to_string()
    }
}

fn default_dnsmasq_restart() -> String {
    if cfg!(target_os = "macos") {
        "brew services restart dnsmasq".to_string()
    } else {
        "systemctl restart dnsmasq".to_string()
    }
}

fn default_resolver_dir() -> String {
    if cfg!(target_os = "macos") {
        "/etc/resolver".to_string()
    } else {
        String::new()
    }
}

fn default_php_scan_dir() -> String {
    if cfg!(target_os = "macos") {
        "/opt/homebrew/etc/php/{version}/conf.d".to_string()
    } else {
        "/etc/php/{version}/fpm/conf.d".to_string()
    }
}

fn default_php_reload() -> String {
    if cfg!(target_os = "macos") {
        "brew services restart php@{version}".to_string()
    } else {
        "systemctl reload php{version}-fpm".to_string()
    }
}

fn default_nginx_test() -> String {
    "nginx -t".to_string()
}

fn default_nginx_reload() -> String {
    "nginx -s reload".to_string()
}

fn default_backend_port() -> u16 {
    8080
}

fn default_trust_command() -> String {
    if cfg!(target_os = "macos") {
        "security add-trusted-cert -d -r trustRoot -k /Library/Keychains/System.keychain {ca_cert}"
            .to_string()
    } else {
        "sh -c 'cp {ca_cert} /usr/local/share/ca-certificates/devhost-ca.crt && update-ca-certificates'"
            .to_string()
    }
}

fn default_privilege_command() -> String {
    "sudo".to_string()
}

fn default_ready_timeout() -> u64 {
    60
}

impl GlobalConfig {
    /// Load `config.toml` from the state root, or defaults when absent
    pub fn load(paths: &Paths) -> Result<Self> {
        let file = paths.config_file();
        if !file.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(&file).map_err(|e| DevhostError::io(&file, e))?;
        let config: GlobalConfig = toml::from_str(&content)
            .map_err(|e| DevhostError::config(format!("{}: {}", file.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();

        if normalize_host(&self.tld).is_err() || self.tld.contains('.') {
            problems.push(format!("tld '{}' must be a single DNS label", self.tld));
        }
        for (label, template) in [
            ("php.reload_command", &self.php.reload_command),
            ("nginx.test_command", &self.nginx.test_command),
            ("nginx.reload_command", &self.nginx.reload_command),
            ("ssl.trust_command", &self.ssl.trust_command),
        ] {
            if template.trim().is_empty() {
                problems.push(format!("{} cannot be empty", label));
            }
        }
        if self.dns.mode == DnsMode::Dnsmasq && self.dns.restart_command.trim().is_empty() {
            problems.push("dns.restart_command cannot be empty in dnsmasq mode".to_string());
        }

        if !problems.is_empty() {
            return Err(DevhostError::Config { problems });
        }
        Ok(())
    }

    pub fn privilege(&self) -> Option<&str> {
        let prefix = self.privilege_command.trim();
        if prefix.is_empty() {
            None
        } else {
            Some(prefix)
        }
    }

    pub fn php_scan_dir(&self, version: &str) -> PathBuf {
        PathBuf::from(self.php.scan_dir.replace("{version}", version))
    }
}
