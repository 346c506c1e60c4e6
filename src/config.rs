//! Environment-backed configuration.
//!
//! Every field is settable by flag or environment variable (`clap`'s `env`
//! feature); nothing reads `std::env` directly outside this module.

use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Clone, Debug)]
#[command(name = "portalcrane", version, about = "Container registry appliance")]
pub struct Config {
    /// Upstream registry base URL, e.g. http://127.0.0.1:5000
    #[arg(long, env = "REGISTRY_URL")]
    pub registry_url: String,

    /// Hostname skopeo should target when pushing, if different from
    /// `registry_url` (e.g. registry_url names a Docker-internal host the
    /// subprocess can't resolve).
    #[arg(long, env = "REGISTRY_PUSH_HOST")]
    pub registry_push_host: Option<String>,

    /// Enforce proxy authorization. When false, every request is forwarded.
    #[arg(long, env = "REGISTRY_PROXY_AUTH_ENABLED", default_value_t = true)]
    pub registry_proxy_auth_enabled: bool,

    /// HS256 signing key for bearer tokens.
    #[arg(long, env = "SECRET_KEY")]
    pub secret_key: String,

    #[arg(long, env = "JWT_ALGORITHM", default_value = "HS256")]
    pub jwt_algorithm: String,

    #[arg(long, env = "JWT_EXPIRE_MINUTES", default_value_t = 60 * 24)]
    pub jwt_expire_minutes: i64,

    /// Fallback local admin account, always available in addition to the
    /// user store.
    #[arg(long, env = "ADMIN_USERNAME", default_value = "admin")]
    pub admin_username: String,

    #[arg(long, env = "ADMIN_PASSWORD")]
    pub admin_password: String,

    #[arg(long, env = "HTTP_PROXY")]
    pub http_proxy: Option<String>,

    #[arg(long, env = "HTTPS_PROXY")]
    pub https_proxy: Option<String>,

    #[arg(long, env = "NO_PROXY")]
    pub no_proxy: Option<String>,

    #[arg(long, env = "DOCKERHUB_USERNAME")]
    pub dockerhub_username: Option<String>,

    #[arg(long, env = "DOCKERHUB_PASSWORD")]
    pub dockerhub_password: Option<String>,

    #[arg(long, env = "DOCKERHUB_API_BASE", default_value = "https://hub.docker.com")]
    pub dockerhub_api_base: String,

    #[arg(long, env = "VULN_SCAN_ENABLED", default_value_t = true)]
    pub vuln_scan_enabled: bool,

    /// Comma-separated severities that block a push (Trivy's vocabulary).
    #[arg(
        long,
        env = "VULN_SCAN_SEVERITIES",
        default_value = "CRITICAL,HIGH",
        value_delimiter = ','
    )]
    pub vuln_scan_severities: Vec<String>,

    #[arg(long, env = "VULN_IGNORE_UNFIXED", default_value_t = true)]
    pub vuln_ignore_unfixed: bool,

    #[arg(long, env = "VULN_SCAN_TIMEOUT_SECS", default_value_t = 300)]
    pub vuln_scan_timeout_secs: u64,

    #[arg(long, env = "TRIVY_SERVER_URL")]
    pub trivy_server_url: String,

    #[arg(long, env = "STAGING_ROOT")]
    pub staging_root: PathBuf,

    #[arg(long, env = "REGISTRY_DATA_ROOT")]
    pub registry_data_root: PathBuf,

    #[arg(long, env = "DATA_DIR")]
    pub data_dir: PathBuf,

    #[arg(long, env = "AUDIT_MAX_EVENTS", default_value_t = 500)]
    pub audit_max_events: usize,

    #[arg(long, env = "PROXY_TIMEOUT_SECS", default_value_t = 300)]
    pub proxy_timeout_secs: u64,

    /// Public base URL clients use to reach this proxy; substituted into
    /// rewritten `Location` headers.
    #[arg(long, env = "PUBLIC_BASE_URL")]
    pub public_base_url: String,

    /// XML-RPC endpoint of the process supervisor (e.g. supervisord).
    #[arg(long, env = "SUPERVISOR_RPC_URL")]
    pub supervisor_rpc_url: String,

    /// Process names the supervisor knows the registry and trivy-db updater by.
    #[arg(long, env = "REGISTRY_PROCESS_NAME", default_value = "registry")]
    pub registry_process_name: String,

    /// Path to the registry binary used for `garbage-collect`.
    #[arg(long, env = "REGISTRY_BINARY", default_value = "registry")]
    pub registry_binary: String,

    /// Path to the registry's own config file, passed to `garbage-collect`.
    #[arg(long, env = "REGISTRY_CONFIG_PATH")]
    pub registry_config_path: PathBuf,

    /// Bound on concurrent tag-list fan-out during ghost detection and
    /// catalog-wide replication enumeration.
    #[arg(long, env = "CATALOG_FANOUT", default_value_t = 16)]
    pub catalog_fanout: usize,

    #[arg(long, env = "HTTP_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub http_listen_addr: String,
}

impl Config {
    /// Environment variables to inject into subprocesses that need to reach
    /// the public internet through the same proxy portalcrane itself uses.
    pub fn proxy_env(&self) -> Vec<(String, String)> {
        let mut env = Vec::new();
        if let Some(v) = &self.http_proxy {
            env.push(("http_proxy".to_string(), v.clone()));
            env.push(("HTTP_PROXY".to_string(), v.clone()));
        }
        if let Some(v) = &self.https_proxy {
            env.push(("https_proxy".to_string(), v.clone()));
            env.push(("HTTPS_PROXY".to_string(), v.clone()));
        }
        if let Some(v) = &self.no_proxy {
            env.push(("no_proxy".to_string(), v.clone()));
            env.push(("NO_PROXY".to_string(), v.clone()));
        }
        env
    }

    /// Host[:port] skopeo should target when pushing. Prefers the explicit
    /// override; otherwise strips the scheme from `registry_url` the way the
    /// original's `urlparse(REGISTRY_URL).netloc` does, since a `docker://`
    /// reference takes a bare host, not a URL.
    pub fn push_host(&self) -> &str {
        match &self.registry_push_host {
            Some(host) => host.trim_end_matches('/'),
            None => self
                .registry_url
                .trim_end_matches('/')
                .split("://")
                .last()
                .unwrap_or(&self.registry_url),
        }
    }

    /// True when the registry being pushed to is reachable over plain HTTP,
    /// matching the original's `REGISTRY_URL.startswith("http://")` check for
    /// whether `--dest-tls-verify=false` is required.
    pub fn push_is_plain_http(&self) -> bool {
        self.registry_url.starts_with("http://")
    }

    pub fn dockerhub_creds(&self) -> Option<(String, String)> {
        match (&self.dockerhub_username, &self.dockerhub_password) {
            (Some(u), Some(p)) => Some((u.clone(), p.clone())),
            _ => None,
        }
    }
}
