//! Fixed host port table for shared services
//!
//! Every (kind, version) pair maps to one well-known host port so projects
//! that declare the same service share one container, and projects on
//! different versions never collide. Relational engines share a namespace:
//! MySQL lives at 330xx and MariaDB at 331xx.

use crate::config::ServiceKind;
use crate::error::{DevhostError, Result};
use std::collections::BTreeMap;
use tracing::debug;

/// (kind, version, port); the last row of each kind is its latest stable
const PORT_TABLE: &[(ServiceKind, &str, u16)] = &[
    (ServiceKind::Mysql, "5.7", 33057),
    (ServiceKind::Mysql, "8.0", 33080),
    (ServiceKind::Mysql, "8.4", 33084),
    (ServiceKind::Mariadb, "10.4", 33104),
    (ServiceKind::Mariadb, "10.6", 33106),
    (ServiceKind::Mariadb, "10.11", 33111),
    (ServiceKind::Mariadb, "11.4", 33114),
    (ServiceKind::Redis, "6.2", 6362),
    (ServiceKind::Redis, "7.2", 6379),
    (ServiceKind::Redis, "7.4", 6374),
    (ServiceKind::Opensearch, "1.3", 9130),
    (ServiceKind::Opensearch, "2.12", 9212),
    (ServiceKind::Opensearch, "2.19", 9219),
    (ServiceKind::Elasticsearch, "7.17", 9717),
    (ServiceKind::Elasticsearch, "8.11", 9811),
    (ServiceKind::Elasticsearch, "8.17", 9817),
    (ServiceKind::Rabbitmq, "3.13", 5672),
    (ServiceKind::Rabbitmq, "4.0", 5673),
    (ServiceKind::Mailpit, "1.21", 1025),
    (ServiceKind::Mailpit, "1.24", 1026),
    (ServiceKind::Varnish, "6.0", 6080),
    (ServiceKind::Varnish, "7.6", 6081),
];

/// Offset of the RabbitMQ management UI from its AMQP port
const RABBITMQ_MANAGEMENT_OFFSET: u16 = 10000;

/// Offset of the Mailpit web UI from its SMTP port
const MAILPIT_UI_OFFSET: u16 = 7000;

/// Result of resolving a (kind, version) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Allocation {
    pub port: u16,
    /// Management or UI port, for kinds that expose one
    pub secondary: Option<u16>,
    /// The version was not in the table; the latest stable port was used
    pub fallback: bool,
}

/// Versions the table knows for `kind`, oldest first
pub fn known_versions(kind: ServiceKind) -> Vec<&'static str> {
    PORT_TABLE
        .iter()
        .filter(|(k, _, _)| *k == kind)
        .map(|(_, v, _)| *v)
        .collect()
}

pub fn secondary_port(kind: ServiceKind, port: u16) -> Option<u16> {
    match kind {
        ServiceKind::Rabbitmq => port.checked_add(RABBITMQ_MANAGEMENT_OFFSET),
        ServiceKind::Mailpit => port.checked_add(MAILPIT_UI_OFFSET),
        _ => None,
    }
}

fn table_port(kind: ServiceKind, version: &str) -> Option<u16> {
    PORT_TABLE
        .iter()
        .find(|(k, v, _)| *k == kind && *v == version)
        .map(|(_, _, port)| *port)
}

#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    overrides: BTreeMap<(ServiceKind, String), u16>,
}

impl PortAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply host-level overrides keyed as `"kind:version"`
    pub fn with_overrides(overrides: &BTreeMap<String, u16>) -> Result<Self> {
        let mut allocator = Self::new();
        let mut problems = Vec::new();

        for (key, port) in overrides {
            let Some((kind, version)) = key.split_once(':') else {
                problems.push(format!("port override '{}' must be 'kind:version'", key));
                continue;
            };
            match kind.parse::<ServiceKind>() {
                Ok(kind) => {
                    allocator
                        .overrides
                        .insert((kind, version.trim().to_string()), *port);
                }
                Err(_) => problems.push(format!("port override '{}' names an unknown service", key)),
            }
        }

        if !problems.is_empty() {
            return Err(DevhostError::Config { problems });
        }
        Ok(allocator)
    }

    /// Resolve the host port for a service version
    pub fn port(&self, kind: ServiceKind, version: &str) -> Allocation {
        let (port, fallback) = match self.lookup(kind, version) {
            Some(port) => (port, false),
            None => {
                let latest = kind.default_version();
                let port = self
                    .lookup(kind, latest)
                    .unwrap_or_else(|| table_port(kind, latest).unwrap_or_default());
                debug!(service = %kind, version, port, "Unknown version, using latest stable port");
                (port, true)
            }
        };

        Allocation {
            port,
            secondary: secondary_port(kind, port),
            fallback,
        }
    }

    fn lookup(&self, kind: ServiceKind, version: &str) -> Option<u16> {
        self.overrides
            .get(&(kind, version.to_string()))
            .copied()
            .or_else(|| table_port(kind, version))
    }

    /// Check that the whole table, with overrides, is injective
    pub fn validate(&self) -> Result<()> {
        let mut pairs: Vec<(ServiceKind, String)> = PORT_TABLE
            .iter()
            .map(|(k, v, _)| (*k, v.to_string()))
            .collect();
        for key in self.overrides.keys() {
            if !pairs.contains(key) {
                pairs.push(key.clone());
            }
        }
        self.check_injective(pairs.iter().map(|(k, v)| (*k, v.as_str())))
    }

    /// Fail when two distinct (kind, version) pairs resolve to one port
    ///
    /// Fallback allocations of the same kind share the latest stable port
    /// with that version; they are one container per version, so those
    /// collide too and are reported.
    pub fn check_injective<'a, I>(&self, services: I) -> Result<()>
    where
        I: IntoIterator<Item = (ServiceKind, &'a str)>,
    {
        let mut claimed: BTreeMap<u16, String> = BTreeMap::new();

        for (kind, version) in services {
            let label = format!("{}:{}", kind, version);
            let allocation = self.port(kind, version);
            let ports = std::iter::once(allocation.port).chain(allocation.secondary);

            for port in ports {
                match claimed.get(&port) {
                    Some(existing) if *existing != label => {
                        return Err(DevhostError::ResourceConflict {
                            port,
                            first: existing.clone(),
                            second: label,
                        });
                    }
                    Some(_) => {}
                    None => {
                        claimed.insert(port, label.clone());
                    }
                }
            }
        }

        Ok(())
    }
}
