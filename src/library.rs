//! Template library consumed by the generators
//!
//! Built-in templates ship with the binary. A file at
//! `<state root>/library/<name>` overrides the built-in of the same name,
//! so a user can tweak e.g. `nginx/server-https` without rebuilding.
//! Templates use `{{name}}` placeholders; every placeholder must be bound
//! at render time.

use crate::error::{DevhostError, Result};
use crate::paths::Paths;
use regex::{Captures, Regex};
use serde::Serialize;
use std::path::{Component as PathComponent, Path, PathBuf};
use std::sync::OnceLock;
use tracing::debug;

const BUILTIN: &[(&str, &str)] = &[
    ("nginx/upstream", NGINX_UPSTREAM),
    ("nginx/php-locations", NGINX_PHP_LOCATIONS),
    ("nginx/proxy-locations", NGINX_PROXY_LOCATIONS),
    ("nginx/server-http", NGINX_SERVER_HTTP),
    ("nginx/server-https", NGINX_SERVER_HTTPS),
    ("nginx/server-redirect", NGINX_SERVER_REDIRECT),
    ("nginx/server-backend", NGINX_SERVER_BACKEND),
    ("php/pool", PHP_POOL),
    ("varnish/default.vcl", VARNISH_VCL),
    ("dns/dnsmasq", DNSMASQ),
    ("dns/resolver", RESOLVER),
];

const NGINX_UPSTREAM: &str = "\
upstream {{upstream}} {
    server unix:{{socket}};
}
";

const NGINX_PHP_LOCATIONS: &str = r#"    root {{root}};
    index index.php index.html;
    client_max_body_size 64m;

    location / {
        try_files $uri $uri/ /index.php$is_args$args;
    }

    location ~ \.php$ {
        try_files $uri =404;
        include fastcgi_params;
        fastcgi_pass {{upstream}};
        fastcgi_param SCRIPT_FILENAME $document_root$fastcgi_script_name;
        fastcgi_buffers 16 16k;
        fastcgi_buffer_size 32k;
        fastcgi_read_timeout 18000;
    }

    location ~ /\.(?!well-known) {
        deny all;
    }
"#;

const NGINX_PROXY_LOCATIONS: &str = r#"    client_max_body_size 64m;

    location / {
        proxy_pass http://127.0.0.1:{{cache_port}};
        proxy_set_header Host $host;
        proxy_set_header X-Real-IP $remote_addr;
        proxy_set_header X-Forwarded-For $proxy_add_x_forwarded_for;
        proxy_set_header X-Forwarded-Proto $scheme;
        proxy_read_timeout 18000;
    }
"#;

const NGINX_SERVER_HTTP: &str = "\
server {
    listen 80;
    listen [::]:80;
    server_name {{host}};
    access_log {{logs}}/{{host}}.access.log;
    error_log {{logs}}/{{host}}.error.log;

{{locations}}}
";

const NGINX_SERVER_REDIRECT: &str = "\
server {
    listen 80;
    listen [::]:80;
    server_name {{host}};
    return 301 https://$host$request_uri;
}
";

const NGINX_SERVER_HTTPS: &str = "\
server {
    listen 443 ssl;
    listen [::]:443 ssl;
    http2 on;
    server_name {{host}};
    ssl_certificate {{cert}};
    ssl_certificate_key {{key}};
    access_log {{logs}}/{{host}}.access.log;
    error_log {{logs}}/{{host}}.error.log;

{{locations}}}
";

const NGINX_SERVER_BACKEND: &str = "\
server {
    listen {{backend_port}};
    server_name {{host}};
    access_log {{logs}}/{{host}}.backend.log;

{{locations}}}
";

const PHP_POOL: &str = "\
; project {{project}} ({{project_path}})
[{{pool}}]
user = {{user}}
listen = {{socket}}
listen.owner = {{user}}
listen.mode = 0660
pm = ondemand
pm.max_children = 10
pm.process_idle_timeout = 10s
pm.max_requests = 500
chdir = {{project_path}}
catch_workers_output = yes
php_admin_flag[log_errors] = on
{{settings}}";

const VARNISH_VCL: &str = r#"vcl 4.1;

backend default {
    .host = "{{backend_host}}";
    .port = "{{backend_port}}";
    .first_byte_timeout = 600s;
}

acl purge {
    "localhost";
    "127.0.0.1";
    "{{backend_host}}";
}

sub vcl_recv {
    if (req.method == "PURGE") {
        if (!client.ip ~ purge) {
            return (synth(405, "Not allowed"));
        }
        return (purge);
    }
    if (req.method != "GET" && req.method != "HEAD") {
        return (pass);
    }
}
"#;

const DNSMASQ: &str = "\
address=/.{{tld}}/127.0.0.1
address=/.{{tld}}/::1
";

const RESOLVER: &str = "\
nameserver 127.0.0.1
";

/// Where a template's content comes from
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TemplateSource {
    Builtin,
    Override(PathBuf),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TemplateEntry {
    pub name: String,
    pub source: TemplateSource,
}

#[derive(Debug, Clone)]
pub struct TemplateLibrary {
    override_dir: Option<PathBuf>,
}

fn placeholder_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\{\{\s*([A-Za-z0-9_]+)\s*\}\}").expect("static pattern compiles")
    })
}

impl TemplateLibrary {
    pub fn new(paths: &Paths) -> Self {
        Self {
            override_dir: Some(paths.library_dir()),
        }
    }

    /// Library with no override directory
    pub fn builtin() -> Self {
        Self { override_dir: None }
    }

    fn override_path(&self, name: &str) -> Option<PathBuf> {
        let safe = Path::new(name)
            .components()
            .all(|c| matches!(c, PathComponent::Normal(_)));
        if !safe {
            return None;
        }
        self.override_dir
            .as_ref()
            .map(|dir| dir.join(name))
            .filter(|path| path.is_file())
    }

    /// All built-in template names with their effective source
    pub fn list(&self) -> Vec<TemplateEntry> {
        BUILTIN
            .iter()
            .map(|(name, _)| TemplateEntry {
                name: name.to_string(),
                source: match self.override_path(name) {
                    Some(path) => TemplateSource::Override(path),
                    None => TemplateSource::Builtin,
                },
            })
            .collect()
    }

    /// Raw template content, preferring an override file
    pub fn get(&self, name: &str) -> Result<String> {
        if let Some(path) = self.override_path(name) {
            debug!(template = name, path = %path.display(), "Using template override");
            return std::fs::read_to_string(&path).map_err(|e| DevhostError::io(&path, e));
        }
        BUILTIN
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, content)| content.to_string())
            .ok_or_else(|| DevhostError::config(format!("unknown template '{}'", name)))
    }

    /// Render a template, binding every `{{name}}` from `vars`
    pub fn render(&self, name: &str, vars: &[(&str, &str)]) -> Result<String> {
        let template = self.get(name)?;
        render_str(name, &template, vars)
    }
}

/// Substitute placeholders in one pass; substituted values are not rescanned
pub fn render_str(name: &str, template: &str, vars: &[(&str, &str)]) -> Result<String> {
    let mut unbound: Vec<String> = Vec::new();

    let rendered = placeholder_re().replace_all(template, |caps: &Captures| {
        let key = &caps[1];
        match vars.iter().find(|(k, _)| *k == key) {
            Some((_, value)) => value.to_string(),
            None => {
                if !unbound.iter().any(|u| u == key) {
                    unbound.push(key.to_string());
                }
                caps[0].to_string()
            }
        }
    });

    if !unbound.is_empty() {
        return Err(DevhostError::config(format!(
            "template '{}' has unbound placeholders: {}",
            name,
            unbound.join(", ")
        )));
    }
    Ok(rendered.into_owned())
}
