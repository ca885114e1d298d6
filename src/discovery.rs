//! Project discovery from generated proxy artifacts
//!
//! The vhost directory is a derived cache of which projects are
//! materialized on this host. Every `<project>.project.json` marker is a
//! project; a `<project>.conf` without a marker is a leftover from an
//! interrupted run and is reported as incomplete.

use crate::compose;
use crate::error::{Component, DevhostError, Issue, Result};
use crate::paths::Paths;
use crate::vhost::ProjectMarker;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use tracing::{debug, warn};

const MARKER_SUFFIX: &str = ".project.json";
const VHOST_SUFFIX: &str = ".conf";

#[derive(Debug, Clone, Default, Serialize)]
pub struct DiscoveryReport {
    /// Materialized projects, ordered by name
    pub projects: Vec<ProjectMarker>,
    /// Projects with a vhost file but no marker
    pub incomplete: Vec<String>,
    /// Markers that could not be read
    pub issues: Vec<Issue>,
}

impl DiscoveryReport {
    pub fn get(&self, name: &str) -> Option<&ProjectMarker> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Every project except `name`
    pub fn others<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a ProjectMarker> {
        self.projects.iter().filter(move |p| p.name != name)
    }
}

/// Scan the vhost directory for materialized projects
pub async fn scan(paths: &Paths) -> Result<DiscoveryReport> {
    let dir = paths.vhost_dir();
    let mut report = DiscoveryReport::default();

    let mut entries = match tokio::fs::read_dir(&dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(report),
        Err(e) => return Err(DevhostError::io(&dir, e)),
    };

    let mut markers = BTreeMap::new();
    let mut vhosts = BTreeSet::new();

    while let Some(entry) = entries
        .next_entry()
        .await
        .map_err(|e| DevhostError::io(&dir, e))?
    {
        let path = entry.path();
        let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        if let Some(name) = file_name.strip_suffix(MARKER_SUFFIX) {
            match ProjectMarker::load(&path) {
                Ok(marker) if marker.name == name => {
                    debug!(project = name, "Discovered project");
                    markers.insert(name.to_string(), marker);
                }
                Ok(marker) => {
                    report.issues.push(Issue::new(
                        Component::Discovery,
                        format!(
                            "{} names project '{}'; ignoring it",
                            path.display(),
                            marker.name
                        ),
                    ));
                }
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "Unreadable project marker");
                    report.issues.push(Issue::from_error(Component::Discovery, &e));
                }
            }
        } else if let Some(name) = file_name.strip_suffix(VHOST_SUFFIX) {
            vhosts.insert(name.to_string());
        }
    }

    report.incomplete = vhosts
        .into_iter()
        .filter(|name| !markers.contains_key(name))
        .collect();
    report.projects = markers.into_values().collect();
    Ok(report)
}

/// Compose services that no discovered project declares
///
/// These are left behind when markers are deleted out of band. They are
/// dropped the next time the definition is regenerated.
pub fn orphans(compose_file: &Path, projects: &[ProjectMarker]) -> Result<BTreeSet<String>> {
    let declared: BTreeSet<String> = projects
        .iter()
        .flat_map(|p| p.services.iter())
        .map(|(kind, version)| format!("{}-{}", kind, version))
        .collect();

    Ok(compose::parse_services(compose_file)?
        .into_iter()
        .filter(|service| !declared.contains(service))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ServiceKind, ServiceSet};
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn marker(name: &str, services: &[(ServiceKind, &str)]) -> ProjectMarker {
        ProjectMarker {
            name: name.to_string(),
            path: PathBuf::from(format!("/srv/{}", name)),
            php: "8.3".to_string(),
            domains: vec![format!("{}.test", name)],
            services: services
                .iter()
                .map(|(k, v)| (*k, v.to_string()))
                .collect::<ServiceSet>(),
        }
    }

    fn write_marker(paths: &Paths, marker: &ProjectMarker) {
        let json = serde_json::to_string_pretty(marker).unwrap();
        std::fs::create_dir_all(paths.vhost_dir()).unwrap();
        std::fs::write(paths.marker_file(&marker.name), json).unwrap();
        std::fs::write(paths.vhost_file(&marker.name), "server {}\n").unwrap();
    }

    #[tokio::test]
    async fn test_missing_directory_is_empty() {
        let dir = TempDir::new().unwrap();
        let report = scan(&Paths::new(dir.path())).await.unwrap();
        assert!(report.projects.is_empty());
        assert!(report.incomplete.is_empty());
    }

    #[tokio::test]
    async fn test_scan_reports_projects_and_incomplete() {
        let dir = TempDir::new().unwrap();
        let paths = Paths::new(dir.path());
        write_marker(&paths, &marker("shop", &[(ServiceKind::Mysql, "8.0")]));
        write_marker(&paths, &marker("blog", &[]));
        std::fs::write(paths.vhost_file("legacy"), "server {}\n").unwrap();
        std::fs::write(paths.marker_file("broken"), "{not json").unwrap();

        let report = scan(&paths).await.unwrap();
        let names: Vec<_> = report.projects.iter().map(|p| p.name.as_str()).collect();
        assert_eq!(names, vec!["blog", "shop"]);
        assert_eq!(report.incomplete, vec!["legacy".to_string()]);
        assert_eq!(report.issues.len(), 1);
        assert_eq!(report.issues[0].component, Component::Discovery);
        assert_eq!(report.others("shop").count(), 1);
    }

    #[test]
    fn test_orphans() {
        let dir = TempDir::new().unwrap();
        let compose_file = dir.path().join("docker-compose.yml");
        std::fs::write(
            &compose_file,
            "services:\n  mysql-8.0:\n    image: mysql:8.0\n    container_name: devhost-mysql-8.0\n    restart: unless-stopped\n  redis-7.2:\n    image: redis:7.2-alpine\n    container_name: devhost-redis-7.2\n    restart: unless-stopped\n",
        )
        .unwrap();

        let projects = vec![marker("shop", &[(ServiceKind::Mysql, "8.0")])];
        let found = orphans(&compose_file, &projects).unwrap();
        assert_eq!(found, BTreeSet::from(["redis-7.2".to_string()]));

        assert!(orphans(&dir.path().join("absent.yml"), &[]).unwrap().is_empty());
    }
}
