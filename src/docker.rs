//! Container runtime access for shared services

use crate::error::{Component, DevhostError, Result};
use async_trait::async_trait;
use bollard::container::InspectContainerOptions;
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::Docker;
use futures::StreamExt;
use tracing::debug;

/// Output of a command executed inside a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i64,
    pub output: String,
}

impl ExecOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Operations the reconciler needs from the container daemon
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// Check the daemon answers
    async fn ping(&self) -> Result<()>;

    /// Whether the named container exists and is running
    async fn is_running(&self, container: &str) -> Result<bool>;

    /// Run a command inside a running container, capturing combined output
    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<ExecOutput>;
}

/// Docker daemon client
pub struct DockerManager {
    client: Docker,
}

impl DockerManager {
    /// Connect to the Docker daemon
    ///
    /// Connection priority:
    /// 1. Explicit docker_host parameter
    /// 2. DOCKER_HOST environment variable
    /// 3. Common socket paths (platform-specific)
    ///
    /// Connecting does not contact the daemon; use `ping` for that.
    pub fn connect(docker_host: Option<&str>) -> Result<Self> {
        let client = if let Some(host) = docker_host {
            Self::connect_to_host(host)?
        } else if let Ok(host) = std::env::var("DOCKER_HOST") {
            Self::connect_to_host(&host)?
        } else {
            Self::connect_with_defaults()?
        };
        Ok(Self { client })
    }

    fn connect_to_host(host: &str) -> Result<Docker> {
        if let Some(socket_path) = host.strip_prefix("unix://") {
            Docker::connect_with_socket(socket_path, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                DevhostError::tool(
                    Component::Containers,
                    format!("cannot connect to Unix socket '{}': {}", socket_path, e),
                )
            })
        } else if host.starts_with("tcp://") || host.starts_with("http://") {
            Docker::connect_with_http(host, 120, bollard::API_DEFAULT_VERSION).map_err(|e| {
                DevhostError::tool(
                    Component::Containers,
                    format!("cannot connect to TCP endpoint '{}': {}", host, e),
                )
            })
        } else {
            Err(DevhostError::config(format!(
                "invalid docker_host '{}': expected 'unix:///path/to/socket' or 'tcp://host:port'",
                host
            )))
        }
    }

    fn connect_with_defaults() -> Result<Docker> {
        let home = std::env::var("HOME").unwrap_or_default();
        let xdg_runtime = std::env::var("XDG_RUNTIME_DIR").unwrap_or_default();

        let socket_paths: Vec<(&str, String)> = vec![
            ("Linux default", "/var/run/docker.sock".to_string()),
            ("Docker Desktop (macOS)", format!("{}/.docker/run/docker.sock", home)),
            ("Colima (macOS)", format!("{}/.colima/default/docker.sock", home)),
            ("OrbStack", format!("{}/.orbstack/run/docker.sock", home)),
            ("Podman (Linux)", format!("{}/podman/podman.sock", xdg_runtime)),
        ];

        for (name, path) in &socket_paths {
            if path.starts_with('/') && !path.starts_with("//") && std::path::Path::new(path).exists() {
                debug!(path, name, "Found Docker socket");
                if let Ok(client) =
                    Docker::connect_with_socket(path, 120, bollard::API_DEFAULT_VERSION)
                {
                    return Ok(client);
                }
            }
        }

        Docker::connect_with_socket_defaults().map_err(|e| {
            DevhostError::tool(
                Component::Containers,
                format!(
                    "cannot connect to Docker daemon: {}. Start Docker Desktop, Colima or dockerd, \
                     or set docker_host in config.toml",
                    e
                ),
            )
        })
    }
}

#[async_trait]
impl ContainerRuntime for DockerManager {
    async fn ping(&self) -> Result<()> {
        self.client.ping().await.map_err(|e| {
            DevhostError::tool(
                Component::Containers,
                format!(
                    "Docker daemon is not responding: {}. Ensure Docker Desktop, Colima, or dockerd is running",
                    e
                ),
            )
        })?;
        debug!("Connected to Docker daemon");
        Ok(())
    }

    async fn is_running(&self, container: &str) -> Result<bool> {
        match self
            .client
            .inspect_container(container, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => Ok(info.state.and_then(|s| s.running).unwrap_or(false)),
            Err(bollard::errors::Error::DockerResponseServerError {
                status_code: 404, ..
            }) => Ok(false),
            Err(e) => Err(DevhostError::tool(
                Component::Containers,
                format!("cannot inspect container '{}': {}", container, e),
            )),
        }
    }

    async fn exec(&self, container: &str, cmd: &[&str]) -> Result<ExecOutput> {
        let tool_err = |e: bollard::errors::Error| {
            DevhostError::tool(
                Component::Containers,
                format!("exec `{}` in '{}' failed: {}", cmd.join(" "), container, e),
            )
        };

        let exec = self
            .client
            .create_exec(
                container,
                CreateExecOptions::<String> {
                    cmd: Some(cmd.iter().map(|s| s.to_string()).collect()),
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    ..Default::default()
                },
            )
            .await
            .map_err(tool_err)?;

        let mut output = String::new();
        if let StartExecResults::Attached { output: mut stream, .. } =
            self.client.start_exec(&exec.id, None).await.map_err(tool_err)?
        {
            while let Some(chunk) = stream.next().await {
                output.push_str(&chunk.map_err(tool_err)?.to_string());
            }
        }

        let inspect = self.client.inspect_exec(&exec.id).await.map_err(tool_err)?;
        let exit_code = inspect.exit_code.unwrap_or(-1);
        debug!(container, command = %cmd.join(" "), exit_code, "Exec finished");

        Ok(ExecOutput { exit_code, output })
    }
}

/// Stand-in used when no daemon endpoint could be set up
///
/// Every call fails with the original connection error, so only the
/// container phase of a run is affected.
pub struct UnavailableRuntime {
    message: String,
}

impl UnavailableRuntime {
    pub fn new(error: &DevhostError) -> Self {
        Self {
            message: match error {
                DevhostError::ExternalTool { message, .. } => message.clone(),
                other => other.to_string(),
            },
        }
    }

    fn error(&self) -> DevhostError {
        DevhostError::tool(Component::Containers, self.message.clone())
    }
}

#[async_trait]
impl ContainerRuntime for UnavailableRuntime {
    async fn ping(&self) -> Result<()> {
        Err(self.error())
    }

    async fn is_running(&self, _container: &str) -> Result<bool> {
        Err(self.error())
    }

    async fn exec(&self, _container: &str, _cmd: &[&str]) -> Result<ExecOutput> {
        Err(self.error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_docker_host() {
        let err = DockerManager::connect(Some("ftp://nowhere")).err().unwrap();
        assert!(matches!(err, DevhostError::Config { .. }));
    }

    #[tokio::test]
    async fn test_unavailable_runtime_reports_cause() {
        let runtime = UnavailableRuntime::new(&DevhostError::tool(
            Component::Containers,
            "no socket",
        ));
        let err = runtime.ping().await.unwrap_err();
        assert_eq!(err.to_string(), "containers: no socket");
        assert!(runtime.is_running("devhost-redis-7.4").await.is_err());
    }

    #[test]
    fn test_explicit_socket_does_not_contact_daemon() {
        assert!(DockerManager::connect(Some("unix:///tmp/devhost-missing.sock")).is_ok());
    }
}
