//! devhost - local development environments for PHP projects
//!
//! This library turns a per-project `.devhost.toml` descriptor into:
//! - Shared database, cache, search, broker, mail and HTTP-cache containers,
//!   one per (kind, version) across every project on the host
//! - A FastCGI worker pool per project, with host-global PHP directives
//!   arbitrated through a single-owner settings file per PHP version
//! - Reverse-proxy virtual hosts, locally trusted certificates and
//!   loopback name resolution for every project domain
//!
//! Every run recomputes the complete desired state and overwrites the
//! generated artifacts, so a failed run can always be repeated.

pub mod compose;
pub mod config;
pub mod discovery;
pub mod dns;
pub mod docker;
pub mod error;
pub mod library;
pub mod paths;
pub mod php;
pub mod ports;
pub mod reconciler;
pub mod runner;
pub mod ssl;
pub mod vhost;

pub use error::{Component, DevhostError, Issue, Result};

/// Package name from Cargo.toml
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
