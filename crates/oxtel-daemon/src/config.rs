//! Daemon configuration: a TOML file with serde defaults, overridable
//! through `OXTEL_*` environment variables.

use serde::Deserialize;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub daemon: DaemonSection,
    #[serde(default)]
    pub rest: RestSection,
    #[serde(default)]
    pub control: ControlSection,
    #[serde(default)]
    pub scheduler: SchedulerSection,
    #[serde(default)]
    pub tribe: TribeSection,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DaemonSection {
    /// Worker threads for the runtime. Values <= 0 coerce to 1, values
    /// above the host CPU count clamp to it.
    #[serde(default = "default_max_cores")]
    pub max_cores: i64,
    /// 1-5 (debug, info, warning, error, fatal).
    #[serde(default = "default_log_level")]
    pub log_level: i64,
    /// Directory for the log file; unset logs to stdout.
    #[serde(default)]
    pub log_path: Option<String>,
}

impl Default for DaemonSection {
    fn default() -> Self {
        Self {
            max_cores: default_max_cores(),
            log_level: default_log_level(),
            log_path: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RestSection {
    #[serde(default = "default_rest_enabled")]
    pub enabled: bool,
    #[serde(default = "default_api_port")]
    pub port: u16,
    #[serde(default)]
    pub https: bool,
    #[serde(default)]
    pub cert_path: Option<String>,
    #[serde(default)]
    pub key_path: Option<String>,
    #[serde(default)]
    pub auth_enabled: bool,
    #[serde(default = "default_username")]
    pub username: String,
    /// Inline password; prefer `password_file` or `OXTEL_PASSWORD`.
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub password_file: Option<String>,
}

impl Default for RestSection {
    fn default() -> Self {
        Self {
            enabled: default_rest_enabled(),
            port: default_api_port(),
            https: false,
            cert_path: None,
            key_path: None,
            auth_enabled: false,
            username: default_username(),
            password: None,
            password_file: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ControlSection {
    #[serde(default = "default_max_running_plugins")]
    pub max_running_plugins: usize,
    /// 0-2 (disabled, enabled, warning).
    #[serde(default = "default_trust_level")]
    pub plugin_trust_level: i64,
    #[serde(default)]
    pub keyring_paths: Vec<String>,
    /// Metric cache TTL, e.g. "500ms", "2s". "0" disables the cache.
    #[serde(default = "default_cache_expiration")]
    pub cache_expiration: String,
    #[serde(default)]
    pub autoload_paths: Vec<String>,
}

impl Default for ControlSection {
    fn default() -> Self {
        Self {
            max_running_plugins: default_max_running_plugins(),
            plugin_trust_level: default_trust_level(),
            keyring_paths: Vec::new(),
            cache_expiration: default_cache_expiration(),
            autoload_paths: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SchedulerSection {
    #[serde(default = "default_queue_size")]
    pub queue_size: usize,
    #[serde(default = "default_worker_pool_size")]
    pub worker_pool_size: usize,
}

impl Default for SchedulerSection {
    fn default() -> Self {
        Self {
            queue_size: default_queue_size(),
            worker_pool_size: default_worker_pool_size(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct TribeSection {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub node_name: Option<String>,
    #[serde(default = "default_tribe_bind")]
    pub bind_addr: String,
    #[serde(default)]
    pub seed: Option<String>,
}

impl Default for TribeSection {
    fn default() -> Self {
        Self {
            enabled: false,
            node_name: None,
            bind_addr: default_tribe_bind(),
            seed: None,
        }
    }
}

fn default_max_cores() -> i64 {
    1
}
fn default_log_level() -> i64 {
    3
}
fn default_rest_enabled() -> bool {
    true
}
fn default_api_port() -> u16 {
    8181
}
fn default_username() -> String {
    "oxtel".to_string()
}
fn default_max_running_plugins() -> usize {
    3
}
fn default_trust_level() -> i64 {
    1
}
fn default_cache_expiration() -> String {
    "500ms".to_string()
}
fn default_queue_size() -> usize {
    25
}
fn default_worker_pool_size() -> usize {
    4
}
fn default_tribe_bind() -> String {
    "127.0.0.1:6000".to_string()
}

impl DaemonConfig {
    pub fn load(path: Option<&str>) -> anyhow::Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .map_err(|e| anyhow::anyhow!("unable to read config {path}: {e}"))?;
                toml::from_str(&content)
                    .map_err(|e| anyhow::anyhow!("invalid config {path}: {e}"))?
            }
            None => Self::default(),
        };
        config.apply_env();
        Ok(config)
    }

    /// Environment variables win over the file.
    fn apply_env(&mut self) {
        if let Some(v) = env_i64("OXTEL_LOG_LEVEL") {
            self.daemon.log_level = v;
        }
        if let Ok(v) = std::env::var("OXTEL_LOG_PATH") {
            self.daemon.log_path = if v.is_empty() { None } else { Some(v) };
        }
        if let Some(v) = env_i64("OXTEL_MAX_CORES") {
            self.daemon.max_cores = v;
        }
        if let Some(v) = env_i64("OXTEL_MAX_PLUGINS") {
            self.control.max_running_plugins = v.max(1) as usize;
        }
        if let Some(v) = env_i64("OXTEL_TRUST_LEVEL") {
            self.control.plugin_trust_level = v;
        }
        if let Ok(v) = std::env::var("OXTEL_KEYRING_FILES") {
            self.control.keyring_paths = split_paths(&v);
        }
        if let Ok(v) = std::env::var("OXTEL_CACHE_EXPIRATION") {
            self.control.cache_expiration = v;
        }
        if let Ok(v) = std::env::var("OXTEL_AUTOLOAD_PATH") {
            self.control.autoload_paths = split_paths(&v);
        }
    }

    /// Validations the daemon refuses to start without.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(1..=5).contains(&self.daemon.log_level) {
            anyhow::bail!("log level was invalid (needs: 1-5)");
        }
        if !(0..=2).contains(&self.control.plugin_trust_level) {
            anyhow::bail!("plugin trust was invalid (needs: 0-2)");
        }
        if self.control.plugin_trust_level > 0 && self.control.keyring_paths.is_empty() {
            anyhow::bail!("need keyring file when trust is on (keyring_paths or OXTEL_KEYRING_FILES)");
        }
        if self.rest.https && (self.rest.cert_path.is_none() || self.rest.key_path.is_none()) {
            anyhow::bail!("https requires both cert_path and key_path");
        }
        parse_duration(&self.control.cache_expiration).map_err(|e| {
            anyhow::anyhow!(
                "invalid cache-expiration format: {} ({e})",
                self.control.cache_expiration
            )
        })?;
        Ok(())
    }

    pub fn cache_ttl(&self) -> Duration {
        parse_duration(&self.control.cache_expiration).unwrap_or(Duration::from_millis(500))
    }

    /// Resolve the control-plane password: inline config, password file,
    /// or `OXTEL_PASSWORD`.
    pub fn resolve_password(&self) -> anyhow::Result<Option<String>> {
        if let Some(password) = &self.rest.password {
            return Ok(Some(password.clone()));
        }
        if let Some(path) = &self.rest.password_file {
            let content = std::fs::read_to_string(path)
                .map_err(|e| anyhow::anyhow!("unable to read password file {path}: {e}"))?;
            return Ok(Some(content.trim().to_string()));
        }
        if let Ok(password) = std::env::var("OXTEL_PASSWORD") {
            return Ok(Some(password));
        }
        Ok(None)
    }

    pub fn effective_cores(&self) -> usize {
        let host = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        if self.daemon.max_cores <= 0 {
            1
        } else {
            (self.daemon.max_cores as usize).min(host)
        }
    }
}

fn env_i64(key: &str) -> Option<i64> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

fn split_paths(raw: &str) -> Vec<String> {
    raw.split(':')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Parse durations like "500ms", "2s", "1m". A bare number is
/// milliseconds; "0" disables.
pub fn parse_duration(raw: &str) -> Result<Duration, String> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Err("empty duration".to_string());
    }
    let (digits, unit) = match raw.find(|c: char| !c.is_ascii_digit()) {
        Some(idx) => raw.split_at(idx),
        None => (raw, "ms"),
    };
    let value: u64 = digits
        .parse()
        .map_err(|_| format!("bad duration number: {raw}"))?;
    match unit.trim() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => Ok(Duration::from_secs(value * 60)),
        "h" => Ok(Duration::from_secs(value * 3600)),
        other => Err(format!("unknown duration unit: {other}")),
    }
}
