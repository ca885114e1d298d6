//! Per-project FastCGI worker pools

use crate::config::ProjectConfig;
use crate::error::{Component, DevhostError, Result};
use crate::library::TemplateLibrary;
use crate::paths::{self, Paths, ReloadFlag};
use crate::php::settings::ini_literal;
use crate::runner::{run_checked, CommandRunner, CommandSpec};
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info};

/// Writes pool definitions and reloads the PHP runtime
pub struct PoolManager {
    paths: Paths,
    library: TemplateLibrary,
    reload_command: String,
    user: String,
    runner: Arc<dyn CommandRunner>,
}

impl PoolManager {
    pub fn new(
        paths: Paths,
        reload_command: &str,
        user: Option<&str>,
        runner: Arc<dyn CommandRunner>,
    ) -> Self {
        let user = user
            .map(str::to_string)
            .or_else(|| std::env::var("USER").ok())
            .unwrap_or_else(|| "www-data".to_string());
        Self {
            library: TemplateLibrary::new(&paths),
            paths,
            reload_command: reload_command.to_string(),
            user,
            runner,
        }
    }

    fn reload_flag(&self, version: &str) -> ReloadFlag {
        ReloadFlag::new(&self.paths, &format!("php-{}", version))
    }

    /// Whether pools for `version` changed since the last successful reload
    pub fn reload_pending(&self, version: &str) -> bool {
        self.reload_flag(version).is_set()
    }

    pub fn pool_name(project: &str) -> String {
        format!("devhost-{}", project)
    }

    pub fn socket(&self, config: &ProjectConfig) -> PathBuf {
        self.paths.pool_socket(&config.php, &config.name)
    }

    pub fn pool_file(&self, config: &ProjectConfig) -> PathBuf {
        self.paths.pool_file(&config.php, &config.name)
    }

    /// Render the pool file; `settings` may override the default error log
    pub fn render(&self, config: &ProjectConfig, settings: &BTreeMap<String, String>) -> Result<String> {
        let logs = self.paths.logs_dir(&config.name).display().to_string();
        let mut settings = settings.clone();
        settings
            .entry("error_log".to_string())
            .or_insert_with(|| format!("{}/php-error.log", logs));
        let settings: String = settings
            .iter()
            .map(|(name, value)| format!("php_admin_value[{}] = {}\n", name, ini_literal(value)))
            .collect();
        let socket = self.socket(config).display().to_string();
        let project_path = config.path.display().to_string();
        let pool = Self::pool_name(&config.name);

        self.library.render(
            "php/pool",
            &[
                ("project", config.name.as_str()),
                ("project_path", project_path.as_str()),
                ("pool", pool.as_str()),
                ("user", self.user.as_str()),
                ("socket", socket.as_str()),
                ("logs", logs.as_str()),
                ("settings", settings.as_str()),
            ],
        )
    }

    /// Write the project's pool file. Returns whether it changed.
    pub fn write(&self, config: &ProjectConfig, settings: &BTreeMap<String, String>) -> Result<bool> {
        let content = self.render(config, settings)?;
        let run_dir = self.paths.run_dir();
        std::fs::create_dir_all(&run_dir).map_err(|e| DevhostError::io(&run_dir, e))?;

        let path = self.pool_file(config);
        let changed = paths::write_if_changed(&path, &content)?;
        if changed {
            self.reload_flag(&config.php).set()?;
            info!(project = %config.name, php = %config.php, path = %path.display(), "Wrote PHP pool");
        } else {
            debug!(project = %config.name, "PHP pool unchanged");
        }
        Ok(changed)
    }

    /// Remove a project's pool file. Returns whether one existed.
    pub fn remove(&self, version: &str, project: &str) -> Result<bool> {
        let removed = paths::remove_if_exists(&self.paths.pool_file(version, project))?;
        if removed {
            self.reload_flag(version).set()?;
            info!(project, php = version, "Removed PHP pool");
        }
        Ok(removed)
    }

    pub fn reload_spec(&self, version: &str) -> Result<CommandSpec> {
        Ok(CommandSpec::from_template(&self.reload_command, &[("version", version)])?.privileged())
    }

    /// Reload the PHP runtime for `version` so pool changes take effect
    pub async fn reload(&self, version: &str) -> Result<()> {
        let spec = self.reload_spec(version)?;
        run_checked(self.runner.as_ref(), &spec, Component::PhpPool).await?;
        self.reload_flag(version).clear()?;
        info!(php = version, "Reloaded PHP runtime");
        Ok(())
    }
}
