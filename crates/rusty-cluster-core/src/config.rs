//! Configuration loading and validation.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::launch::LaunchOptions;

/// Top-level Rusty Cluster configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cluster: Option<ClusterOptions>,

    /// Default launch options for every browser the cluster starts.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub browser: Option<LaunchOptions>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

/// How work is isolated across the pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcurrencyModel {
    /// One shared browser, one long-lived page per worker. Shares cookies.
    Page,
    /// One shared browser, a fresh incognito context per job.
    #[default]
    Context,
    /// One browser process per worker, a fresh context per job.
    Browser,
}

/// Scheduler options.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterOptions {
    #[serde(default)]
    pub concurrency: ConcurrencyModel,

    /// Maximum number of workers (0 = unlimited, default: 1).
    #[serde(default = "default_max_concurrency")]
    pub max_concurrency: usize,

    /// Minimum time between two worker launches in ms (0 = unthrottled).
    #[serde(default)]
    pub worker_creation_delay_ms: u64,

    /// Launch options handed out one per worker, in launch order.
    /// Only used in `browser` mode and only when the list length equals
    /// `max_concurrency`.
    #[serde(default)]
    pub per_worker_options: Vec<LaunchOptions>,

    /// Periodically log a progress report.
    #[serde(default)]
    pub monitor: bool,

    /// Per-job timeout in ms (default: 30000, 0 = no timeout).
    #[serde(default = "default_timeout")]
    pub timeout_ms: u64,

    /// How often a failed queued job is retried (default: 0).
    #[serde(default)]
    pub retry_limit: u32,

    /// Delay before a failed job becomes eligible again, in ms.
    #[serde(default)]
    pub retry_delay_ms: u64,

    /// Drop jobs whose URL was already dispatched.
    #[serde(default)]
    pub skip_duplicate_urls: bool,

    /// Minimum time between two jobs on the same domain, in ms (0 = off).
    #[serde(default)]
    pub same_domain_delay_ms: u64,
}

fn default_max_concurrency() -> usize {
    1
}

fn default_timeout() -> u64 {
    30_000
}

impl Default for ClusterOptions {
    fn default() -> Self {
        Self {
            concurrency: ConcurrencyModel::default(),
            max_concurrency: default_max_concurrency(),
            worker_creation_delay_ms: 0,
            per_worker_options: Vec::new(),
            monitor: false,
            timeout_ms: default_timeout(),
            retry_limit: 0,
            retry_delay_ms: 0,
            skip_duplicate_urls: false,
            same_domain_delay_ms: 0,
        }
    }
}

impl ClusterOptions {
    pub fn new(concurrency: ConcurrencyModel) -> Self {
        Self {
            concurrency,
            ..Default::default()
        }
    }

    pub fn with_max_concurrency(mut self, max: usize) -> Self {
        self.max_concurrency = max;
        self
    }

    pub fn with_worker_creation_delay(mut self, delay: Duration) -> Self {
        self.worker_creation_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_per_worker_options(mut self, options: Vec<LaunchOptions>) -> Self {
        self.per_worker_options = options;
        self
    }

    pub fn with_monitor(mut self, enabled: bool) -> Self {
        self.monitor = enabled;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_retry_limit(mut self, limit: u32) -> Self {
        self.retry_limit = limit;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn with_skip_duplicate_urls(mut self, skip: bool) -> Self {
        self.skip_duplicate_urls = skip;
        self
    }

    pub fn with_same_domain_delay(mut self, delay: Duration) -> Self {
        self.same_domain_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Per-job timeout, `None` when disabled.
    pub fn timeout(&self) -> Option<Duration> {
        (self.timeout_ms > 0).then(|| Duration::from_millis(self.timeout_ms))
    }

    pub fn worker_creation_delay(&self) -> Duration {
        Duration::from_millis(self.worker_creation_delay_ms)
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn same_domain_delay(&self) -> Duration {
        Duration::from_millis(self.same_domain_delay_ms)
    }

    /// Whether per-worker launch options are actually used.
    ///
    /// They only apply in browser mode and only when there is exactly one
    /// entry per worker; otherwise every worker gets the default options.
    pub fn uses_per_worker_options(&self) -> bool {
        self.concurrency == ConcurrencyModel::Browser
            && !self.per_worker_options.is_empty()
            && self.per_worker_options.len() == self.max_concurrency
    }

    /// Why `per_worker_options` is not used, when it is set but ignored.
    pub fn per_worker_options_warning(&self) -> Option<String> {
        if self.per_worker_options.is_empty() {
            None
        } else if self.concurrency != ConcurrencyModel::Browser {
            Some(format!(
                "per_worker_options is ignored in {:?} concurrency mode",
                self.concurrency
            ))
        } else if self.per_worker_options.len() != self.max_concurrency {
            Some(format!(
                "per_worker_options has {} entries but max_concurrency is {}; \
                 using the default browser options for all workers",
                self.per_worker_options.len(),
                self.max_concurrency
            ))
        } else {
            None
        }
    }

    /// Validate options, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let errors = Vec::new();

        warnings.extend(self.per_worker_options_warning());

        if self.max_concurrency == 0 && self.concurrency == ConcurrencyModel::Browser {
            warnings.push(
                "max_concurrency is 0 (unlimited) in browser mode; \
                 every worker launches its own browser process"
                    .to_string(),
            );
        }

        if self.timeout_ms == 0 {
            warnings.push("timeout_ms is 0; jobs are never timed out".to_string());
        }

        (warnings, errors)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "rusty_cluster=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex is valid");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            debug!(path = %path.display(), "No config file, using defaults");
            return Ok(Self::default());
        }
        debug!(path = %path.display(), "Loading config");

        let raw = std::fs::read_to_string(path).map_err(crate::error::ClusterError::Io)?;

        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::ClusterError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Default config file location.
    pub fn config_path() -> PathBuf {
        data_dir().join("config.json")
    }

    /// Cluster options, falling back to defaults.
    pub fn cluster_options(&self) -> ClusterOptions {
        self.cluster.clone().unwrap_or_default()
    }

    /// Default browser launch options.
    pub fn launch_options(&self) -> LaunchOptions {
        self.browser.clone().unwrap_or_default()
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let (mut warnings, mut errors) = self.cluster_options().validate();

        if let Some(logging) = &self.logging {
            if !matches!(logging.format.as_str(), "plain" | "json") {
                errors.push(format!("Unknown log format: {}", logging.format));
            }
            if !matches!(logging.output.as_str(), "stderr" | "stdout") {
                errors.push(format!("Unknown log output: {}", logging.output));
            }
        }

        if let Some(path) = self.browser.as_ref().and_then(|b| b.chrome_path.as_ref()) {
            if !Path::new(path).exists() {
                warnings.push(format!("Chrome binary not found: {path}"));
            }
        }

        (warnings, errors)
    }

    /// Save config to a file.
    pub fn save(&self, path: &Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }
}

/// Base directory for Rusty Cluster data: `~/.rusty_cluster/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".rusty_cluster")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_env_var_substitution() {
        // SAFETY: test-only, the variable name is unique to this test
        unsafe { std::env::set_var("TEST_RCL_CHROME", "/opt/chrome") };
        let input = r#"{"browser": {"chrome_path": "${TEST_RCL_CHROME}"}}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains("/opt/chrome"));
        unsafe { std::env::remove_var("TEST_RCL_CHROME") };
    }

    #[test]
    fn test_env_var_missing() {
        let input = r#"{"key": "${NONEXISTENT_VAR_RCL_TEST}"}"#;
        let result = substitute_env_vars(input);
        assert!(result.contains(r#""""#));
    }

    #[test]
    fn test_default_options() {
        let opts = Config::default().cluster_options();
        assert_eq!(opts.concurrency, ConcurrencyModel::Context);
        assert_eq!(opts.max_concurrency, 1);
        assert_eq!(opts.timeout(), Some(Duration::from_secs(30)));
        assert_eq!(opts.retry_limit, 0);
        assert!(!opts.skip_duplicate_urls);
        assert_eq!(opts.same_domain_delay(), Duration::ZERO);
    }

    #[test]
    fn test_load_json5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(
            &path,
            r#"{
                // comments are allowed
                cluster: {
                    concurrency: "browser",
                    max_concurrency: 4,
                    retry_limit: 2,
                    same_domain_delay_ms: 250,
                },
                browser: { headless: false },
            }"#,
        )
        .unwrap();

        let config = Config::load(&path).unwrap();
        let opts = config.cluster_options();
        assert_eq!(opts.concurrency, ConcurrencyModel::Browser);
        assert_eq!(opts.max_concurrency, 4);
        assert_eq!(opts.retry_limit, 2);
        assert_eq!(opts.same_domain_delay(), Duration::from_millis(250));
        assert_eq!(opts.timeout_ms, 30_000);
        assert!(!config.launch_options().headless);
    }

    #[test]
    fn test_load_missing_file_is_default() {
        let config = Config::load(Path::new("/nonexistent/rusty-cluster.json")).unwrap();
        assert!(config.cluster.is_none());
    }

    #[test]
    fn test_load_invalid_file_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{ cluster: ").unwrap();
        let err = Config::load(&path).unwrap_err();
        assert!(matches!(err, crate::error::ClusterError::Config(_)));
    }

    #[test]
    fn test_timeout_zero_disables() {
        let opts = ClusterOptions::default().with_timeout(Duration::ZERO);
        assert_eq!(opts.timeout(), None);
    }

    #[test]
    fn test_per_worker_options_require_matching_length() {
        let per_worker = vec![LaunchOptions::default(), LaunchOptions::default()];
        let matching = ClusterOptions::new(ConcurrencyModel::Browser)
            .with_max_concurrency(2)
            .with_per_worker_options(per_worker.clone());
        assert!(matching.uses_per_worker_options());
        assert!(matching.validate().0.is_empty());

        let mismatched = ClusterOptions::new(ConcurrencyModel::Browser)
            .with_max_concurrency(3)
            .with_per_worker_options(per_worker.clone());
        assert!(!mismatched.uses_per_worker_options());
        let (warnings, errors) = mismatched.validate();
        assert!(errors.is_empty());
        assert!(warnings.iter().any(|w| w.contains("per_worker_options")));

        let wrong_mode = ClusterOptions::new(ConcurrencyModel::Page)
            .with_max_concurrency(2)
            .with_per_worker_options(per_worker);
        assert!(!wrong_mode.uses_per_worker_options());
        assert!(wrong_mode.validate().0.iter().any(|w| w.contains("ignored")));
    }

    #[test]
    fn test_per_worker_options_warning_names_the_reason() {
        let per_worker = vec![LaunchOptions::default(), LaunchOptions::default()];

        let context = ClusterOptions::new(ConcurrencyModel::Context)
            .with_max_concurrency(2)
            .with_per_worker_options(per_worker.clone());
        assert_eq!(
            context.per_worker_options_warning().as_deref(),
            Some("per_worker_options is ignored in Context concurrency mode")
        );

        let short = ClusterOptions::new(ConcurrencyModel::Browser)
            .with_max_concurrency(4)
            .with_per_worker_options(per_worker.clone());
        let warning = short.per_worker_options_warning().unwrap();
        assert!(warning.starts_with("per_worker_options has 2 entries but max_concurrency is 4"));

        let matching = ClusterOptions::new(ConcurrencyModel::Browser)
            .with_max_concurrency(2)
            .with_per_worker_options(per_worker);
        assert_eq!(matching.per_worker_options_warning(), None);
        assert_eq!(ClusterOptions::default().per_worker_options_warning(), None);
    }

    #[test]
    fn test_logging_config_defaults() {
        let config: Config = json5::from_str(r#"{ "logging": {} }"#).unwrap();
        let logging = config.logging.expect("logging should be present");
        assert_eq!(logging.format, "plain");
        assert!(logging.level.is_none());
        assert_eq!(logging.output, "stderr");
        assert!(logging.filters.is_empty());
    }

    #[test]
    fn test_validate_bad_logging_errors() {
        let config: Config = json5::from_str(r#"{ logging: { format: "xml" } }"#).unwrap();
        let (_warnings, errors) = config.validate();
        assert!(errors.iter().any(|e| e.contains("xml")));
    }
}
