//! Error taxonomy and accumulated issues for reconciliation runs

use serde::Serialize;
use std::fmt;
use std::path::{Path, PathBuf};

/// Component that raised an issue or error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum Component {
    /// Project descriptor parsing and validation
    Config,
    /// Port allocation table
    Ports,
    /// Shared container services
    Containers,
    /// Per-project FastCGI worker pool
    PhpPool,
    /// Host-global PHP settings file
    SystemIni,
    /// Reverse-proxy virtual hosts
    Vhost,
    /// Local certificate authority and leaf certificates
    Ssl,
    /// Loopback name resolution
    Dns,
    /// Project discovery from generated artifacts
    Discovery,
    /// Per-project state directory
    Project,
    /// Template library
    Library,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::Config => "config",
            Component::Ports => "ports",
            Component::Containers => "containers",
            Component::PhpPool => "php-pool",
            Component::SystemIni => "system-ini",
            Component::Vhost => "vhost",
            Component::Ssl => "ssl",
            Component::Dns => "dns",
            Component::Discovery => "discovery",
            Component::Project => "project",
            Component::Library => "library",
        }
    }
}

impl fmt::Display for Component {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors raised by devhost operations
#[derive(Debug, thiserror::Error)]
pub enum DevhostError {
    /// Structurally invalid descriptor or host configuration
    #[error("invalid configuration: {}", .problems.join("; "))]
    Config { problems: Vec<String> },

    /// Two distinct services resolved to the same host port
    #[error("port {port} is claimed by both {first} and {second}")]
    ResourceConflict {
        port: u16,
        first: String,
        second: String,
    },

    /// An external daemon or command was unavailable or failed
    #[error("{component}: {message}")]
    ExternalTool {
        component: Component,
        message: String,
    },

    /// Filesystem failure on a specific path
    #[error("{}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// A persisted artifact could not be decoded
    #[error("failed to parse {}: {message}", .path.display())]
    Parse { path: PathBuf, message: String },
}

impl DevhostError {
    pub fn config(problem: impl Into<String>) -> Self {
        DevhostError::Config {
            problems: vec![problem.into()],
        }
    }

    pub fn tool(component: Component, message: impl Into<String>) -> Self {
        DevhostError::ExternalTool {
            component,
            message: message.into(),
        }
    }

    pub fn io(path: impl AsRef<Path>, source: std::io::Error) -> Self {
        DevhostError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn parse(path: impl AsRef<Path>, message: impl fmt::Display) -> Self {
        DevhostError::Parse {
            path: path.as_ref().to_path_buf(),
            message: message.to_string(),
        }
    }

    /// Whether this error must halt before any external effect
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DevhostError::Config { .. } | DevhostError::ResourceConflict { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, DevhostError>;

/// A non-fatal condition accumulated during a run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Issue {
    pub component: Component,
    pub message: String,
}

impl Issue {
    pub fn new(component: Component, message: impl Into<String>) -> Self {
        Self {
            component,
            message: message.into(),
        }
    }

    /// Attribute an error to a component. External tool errors keep their own.
    pub fn from_error(component: Component, error: &DevhostError) -> Self {
        match error {
            DevhostError::ExternalTool { component, message } => Self::new(*component, message),
            other => Self::new(component, other.to_string()),
        }
    }
}

impl fmt::Display for Issue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.component, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_error_lists_every_problem() {
        let err = DevhostError::Config {
            problems: vec!["name is empty".into(), "no domains".into()],
        };
        assert_eq!(
            err.to_string(),
            "invalid configuration: name is empty; no domains"
        );
        assert!(err.is_fatal());
    }

    #[test]
    fn test_tool_error_is_not_fatal() {
        let err = DevhostError::tool(Component::Vhost, "nginx -t failed");
        assert!(!err.is_fatal());
        assert_eq!(err.to_string(), "vhost: nginx -t failed");
    }

    #[test]
    fn test_issue_keeps_tool_component() {
        let err = DevhostError::tool(Component::Dns, "dnsmasq restart failed");
        let issue = Issue::from_error(Component::Project, &err);
        assert_eq!(issue.component, Component::Dns);
        assert_eq!(issue.to_string(), "[dns] dnsmasq restart failed");
    }

    #[test]
    fn test_issue_wraps_other_errors() {
        let err = DevhostError::io(
            "/tmp/x",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        let issue = Issue::from_error(Component::PhpPool, &err);
        assert_eq!(issue.component, Component::PhpPool);
        assert!(issue.message.contains("/tmp/x"));
    }
}
