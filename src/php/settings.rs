//! Classification and validation of php.ini overrides

use crate::error::{DevhostError, Result};
use regex::Regex;
use std::collections::BTreeMap;
use std::sync::OnceLock;

/// Pool-scope values every project starts from
pub const DEFAULTS: &[(&str, &str)] = &[
    ("date.timezone", "UTC"),
    ("display_errors", "On"),
    ("error_reporting", "E_ALL"),
    ("max_execution_time", "18000"),
    ("max_input_vars", "10000"),
    ("memory_limit", "756M"),
    ("post_max_size", "64M"),
    ("realpath_cache_size", "10M"),
    ("realpath_cache_ttl", "7200"),
    ("upload_max_filesize", "64M"),
    ("zlib.output_compression", "On"),
];

/// Directives only honoured in the runtime's global configuration
pub const HOST_GLOBAL: &[&str] = &[
    "disable_classes",
    "disable_functions",
    "opcache.file_cache",
    "opcache.file_cache_only",
    "opcache.huge_code_pages",
    "opcache.interned_strings_buffer",
    "opcache.jit_buffer_size",
    "opcache.lockfile_path",
    "opcache.max_accelerated_files",
    "opcache.memory_consumption",
    "opcache.preload",
    "opcache.preload_user",
    "opcache.validate_permission",
    "opcache.validate_root",
];

/// Directive prefixes that are host-global regardless of suffix
const HOST_GLOBAL_PREFIXES: &[&str] = &["extension", "zend_extension"];

/// Directives taking a byte size (`128M`, `-1`, ...)
const SIZE_DIRECTIVES: &[&str] = &[
    "memory_limit",
    "opcache.jit_buffer_size",
    "post_max_size",
    "realpath_cache_size",
    "upload_max_filesize",
];

fn size_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^(-1|\d+[KkMmGg]?)$").expect("static pattern compiles"))
}

fn bare_value_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^[A-Za-z0-9_./:,~@+-]*$").expect("static pattern compiles"))
}

pub fn is_host_global(name: &str) -> bool {
    HOST_GLOBAL.contains(&name)
        || HOST_GLOBAL_PREFIXES
            .iter()
            .any(|prefix| name == *prefix || name.starts_with(&format!("{}.", prefix)))
}

/// Overrides split by scope, with values rendered as ini strings
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IniSplit {
    /// Defaults merged with pool-scope overrides
    pub pool: BTreeMap<String, String>,
    /// Host-global overrides only
    pub system: BTreeMap<String, String>,
}

/// Classify and render overrides; malformed values are a `Config` error
pub fn split(overrides: &BTreeMap<String, toml::Value>) -> Result<IniSplit> {
    let mut out = IniSplit {
        pool: DEFAULTS
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        system: BTreeMap::new(),
    };
    let mut problems = Vec::new();

    for (name, value) in overrides {
        let rendered = match render_value(name, value) {
            Ok(rendered) => rendered,
            Err(problem) => {
                problems.push(problem);
                continue;
            }
        };
        if is_host_global(name) {
            out.system.insert(name.clone(), rendered);
        } else {
            out.pool.insert(name.clone(), rendered);
        }
    }

    if !problems.is_empty() {
        return Err(DevhostError::Config { problems });
    }
    Ok(out)
}

/// Render one override value as it should appear in an ini file
pub fn render_value(name: &str, value: &toml::Value) -> std::result::Result<String, String> {
    let rendered = match value {
        toml::Value::Boolean(true) => "On".to_string(),
        toml::Value::Boolean(false) => "Off".to_string(),
        toml::Value::Integer(i) => i.to_string(),
        toml::Value::Float(f) => f.to_string(),
        toml::Value::String(s) => {
            if s.chars().any(|c| c.is_control() || c == '"') {
                return Err(format!(
                    "php_ini '{}' contains a quote or control character",
                    name
                ));
            }
            s.trim().to_string()
        }
        toml::Value::Array(_) | toml::Value::Table(_) | toml::Value::Datetime(_) => {
            return Err(format!(
                "php_ini '{}' must be a string, number or boolean",
                name
            ));
        }
    };

    if SIZE_DIRECTIVES.contains(&name) && !size_re().is_match(&rendered) {
        return Err(format!(
            "php_ini '{}' = '{}' is not a size like 512M or -1",
            name, rendered
        ));
    }

    Ok(rendered)
}

/// Quote a rendered value when the ini parser would otherwise misread it
pub fn ini_literal(value: &str) -> String {
    if bare_value_re().is_match(value) && !value.is_empty() {
        value.to_string()
    } else {
        format!("\"{}\"", value)
    }
}

/// Global ini file content for host-global settings
pub fn render_system_ini(project: &str, settings: &BTreeMap<String, String>) -> String {
    let mut out = format!(
        "; devhost host-global settings, owned by project {}\n",
        project
    );
    for (name, value) in settings {
        out.push_str(&format!("{} = {}\n", name, ini_literal(value)));
    }
    out
}
