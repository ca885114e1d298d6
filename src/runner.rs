//! External command execution
//!
//! Reload, dry-run, trust and resolver commands are configured as strings
//! with `{placeholder}` variables. They are split with shell quoting rules
//! and run without a shell. Anything that touches system paths is marked
//! privileged and gets the configured elevation prefix.

use crate::error::{Component, DevhostError, Result};
use async_trait::async_trait;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// A command to execute, already split into program and arguments
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub privileged: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            privileged: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }

    /// Split a command line using shell quoting rules
    pub fn parse(line: &str) -> Result<Self> {
        Self::from_template(line, &[])
    }

    /// Split a configured template, then expand `{name}` in each word
    ///
    /// Expansion happens after splitting so a substituted path containing
    /// spaces stays one argument.
    pub fn from_template(template: &str, vars: &[(&str, &str)]) -> Result<Self> {
        let words = shell_words::split(template)
            .map_err(|e| DevhostError::config(format!("cannot parse command '{}': {}", template, e)))?;

        let mut words = words.into_iter().map(|word| {
            vars.iter().fold(word, |acc, (name, value)| {
                acc.replace(&format!("{{{}}}", name), value)
            })
        });

        let program = words
            .next()
            .ok_or_else(|| DevhostError::config(format!("command '{}' is empty", template)))?;

        Ok(Self::new(program).args(words))
    }

    /// Command line as it would be typed, without elevation
    pub fn display(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(self.args.iter()))
    }

    /// Command line a user can paste to perform this step by hand
    pub fn manual(&self, privilege: Option<&str>) -> String {
        match privilege {
            Some(prefix) if self.privileged => format!("{} {}", prefix, self.display()),
            _ => self.display(),
        }
    }
}

/// Captured result of a finished command
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.status == 0
    }

    pub fn ok() -> Self {
        Self::default()
    }

    pub fn failed(status: i32, stderr: impl Into<String>) -> Self {
        Self {
            status,
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }
}

/// Runs external commands
///
/// Abstracted so reconciliation can be exercised without touching the host.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Run to completion. `Err` only when the program could not be started.
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput>;
}

/// Run a command and turn a non-zero exit into an `ExternalTool` error
pub async fn run_checked(
    runner: &dyn CommandRunner,
    spec: &CommandSpec,
    component: Component,
) -> Result<CommandOutput> {
    let output = runner.run(spec).await.map_err(|e| {
        DevhostError::tool(component, format!("cannot run `{}`: {}", spec.display(), e))
    })?;

    if !output.success() {
        let detail = output.stderr.trim();
        let detail = if detail.is_empty() {
            output.stdout.trim()
        } else {
            detail
        };
        return Err(DevhostError::tool(
            component,
            format!(
                "`{}` exited with status {}: {}",
                spec.display(),
                output.status,
                detail
            ),
        ));
    }

    Ok(output)
}

/// Runs commands on the local host with tokio
#[derive(Debug, Clone, Default)]
pub struct SystemRunner {
    privilege: Option<String>,
}

impl SystemRunner {
    pub fn new(privilege: Option<&str>) -> Self {
        Self {
            privilege: privilege.map(str::to_string),
        }
    }

    fn build(&self, spec: &CommandSpec) -> Result<Command> {
        let mut cmd = match self.privilege.as_deref() {
            Some(prefix) if spec.privileged && !is_root() => {
                let mut words = shell_words::split(prefix).map_err(|e| {
                    DevhostError::config(format!("cannot parse privilege command '{}': {}", prefix, e))
                })?;
                if words.is_empty() {
                    Command::new(&spec.program)
                } else {
                    let program = words.remove(0);
                    let mut cmd = Command::new(program);
                    cmd.args(words).arg(&spec.program);
                    cmd
                }
            }
            _ => Command::new(&spec.program),
        };
        cmd.args(&spec.args);
        if let Some(dir) = &spec.cwd {
            cmd.current_dir(dir);
        }
        Ok(cmd)
    }

    /// Run with inherited stdio, returning the exit status
    pub async fn run_interactive(&self, spec: &CommandSpec) -> Result<i32> {
        let mut cmd = self.build(spec)?;
        debug!(command = %spec.display(), "Running interactive command");
        let status = cmd
            .status()
            .await
            .map_err(|e| DevhostError::io(&spec.program, e))?;
        Ok(status.code().unwrap_or(1))
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, spec: &CommandSpec) -> Result<CommandOutput> {
        let mut cmd = self.build(spec)?;
        cmd.stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());

        debug!(command = %spec.display(), privileged = spec.privileged, "Running command");

        let output = cmd
            .output()
            .await
            .map_err(|e| DevhostError::io(&spec.program, e))?;

        Ok(CommandOutput {
            status: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_quoted() {
        let spec = CommandSpec::parse("sh -c 'nginx -t && echo ok'").unwrap();
        assert_eq!(spec.program, "sh");
        assert_eq!(spec.args, vec!["-c", "nginx -t && echo ok"]);
    }

    #[test]
    fn test_template_expansion_keeps_words() {
        let spec = CommandSpec::from_template(
            "cp {src} /etc/resolver/{tld}",
            &[("src", "/home/my user/file"), ("tld", "test")],
        )
        .unwrap();
        assert_eq!(spec.program, "cp");
        assert_eq!(spec.args, vec!["/home/my user/file", "/etc/resolver/test"]);
    }

    #[test]
    fn test_empty_template_is_config_error() {
        assert!(matches!(
            CommandSpec::parse("   "),
            Err(DevhostError::Config { .. })
        ));
        assert!(CommandSpec::parse("echo 'unterminated").is_err());
    }

    #[test]
    fn test_manual_adds_privilege_only_when_needed() {
        let spec = CommandSpec::new("ln").args(["-sfn", "/a b", "/c"]);
        assert_eq!(spec.manual(Some("sudo")), "ln -sfn '/a b' /c");
        assert_eq!(
            spec.clone().privileged().manual(Some("sudo")),
            "sudo ln -sfn '/a b' /c"
        );
        assert_eq!(spec.privileged().manual(None), "ln -sfn '/a b' /c");
    }

    #[tokio::test]
    async fn test_system_runner_captures_output() {
        let runner = SystemRunner::new(None);
        let output = runner
            .run(&CommandSpec::new("sh").args(["-c", "echo out; echo err >&2; exit 3"]))
            .await
            .unwrap();
        assert_eq!(output.status, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn test_run_checked_reports_component_and_command() {
        let runner = SystemRunner::new(None);
        let err = run_checked(
            &runner,
            &CommandSpec::new("sh").args(["-c", "echo broken >&2; exit 1"]),
            Component::Vhost,
        )
        .await
        .unwrap_err();
        match err {
            DevhostError::ExternalTool { component, message } => {
                assert_eq!(component, Component::Vhost);
                assert!(message.contains("exited with status 1"));
                assert!(message.contains("broken"));
            }
            other => panic!("unexpected error {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_missing_program_is_tool_error() {
        let runner = SystemRunner::new(None);
        let err = run_checked(
            &runner,
            &CommandSpec::new("devhost-no-such-program"),
            Component::Dns,
        )
        .await
        .unwrap_err();
        assert!(matches!(
            err,
            DevhostError::ExternalTool {
                component: Component::Dns,
                ..
            }
        ));
    }
}
