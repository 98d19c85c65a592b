//! Configuration loading and validation for certpilot.
//!
//! The configuration is a single TOML file describing the domain sets to
//! manage, the ACME account, the DNS provider used for DNS-01 validation,
//! the certificate store, and the consumer service that picks up renewed
//! certificate material.
//!
//! # Example
//!
//! ```toml
//! [[domain-set]]
//! domains = ["irc.example.org", "*.irc.example.org"]
//!
//! [acme]
//! contact = "admin@example.org"
//! renew-before-days = 30
//!
//! [dns]
//! credentials-file = "/etc/certpilot/dns-token"
//! api-url = "https://dns.example-provider.com/api/v1"
//!
//! [store]
//! cert-dir = "/var/lib/certpilot/store"
//! state-dir = "/var/lib/certpilot/state"
//!
//! [consumer]
//! target-dir = "/home/ircd/tls"
//! host = "127.0.0.1"
//! port = 6697
//!
//! [consumer.reload]
//! mode = "hot-reload"
//! command = ["unrealircd", "rehash", "-tls"]
//! ```

use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating configuration.
///
/// All variants are fatal: configuration problems are never retried.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Configuration file could not be read
    #[error("Failed to read configuration file '{path}': {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Configuration file is not valid TOML
    #[error("Failed to parse configuration file '{path}': {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    /// Configuration is syntactically valid but semantically broken
    #[error("Invalid configuration:\n{}", .0.join("\n"))]
    Validation(Vec<String>),
}

/// Top-level certpilot configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct Config {
    /// Domain sets to manage, one pipeline per set
    #[serde(rename = "domain-set")]
    pub domain_sets: Vec<DomainSet>,

    /// ACME account and renewal policy
    pub acme: AcmeConfig,

    /// DNS provider used for DNS-01 validation
    pub dns: DnsConfig,

    /// Certificate store and state directory locations
    pub store: StoreConfig,

    /// Consumer service that serves the certificates
    pub consumer: ConsumerConfig,

    /// Renewal scheduler behavior
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

/// A set of domains covered by a single certificate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DomainSet {
    /// Domains on the certificate; the first entry is the primary domain
    /// and keys the store directory
    pub domains: Vec<String>,

    /// Override of the consumer target directory for this set
    #[serde(default)]
    pub target_dir: Option<PathBuf>,
}

impl DomainSet {
    /// The primary domain of the set (first entry).
    pub fn primary(&self) -> &str {
        self.domains.first().map(String::as_str).unwrap_or("")
    }
}

/// ACME account and renewal policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct AcmeConfig {
    /// Contact email registered with the certificate authority
    pub contact: String,

    /// Use the staging directory (untrusted certificates, generous rate limits)
    #[serde(default)]
    pub staging: bool,

    /// Renew when fewer than this many days remain until expiry
    #[serde(default = "default_renew_before_days")]
    pub renew_before_days: u32,

    /// Retry budget for transient issuance failures
    #[serde(default)]
    pub backoff: BackoffConfig,
}

fn default_renew_before_days() -> u32 {
    30
}

/// DNS provider settings for DNS-01 validation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct DnsConfig {
    /// File holding the provider API credential (0600, JSON or plain token)
    pub credentials_file: PathBuf,

    /// Base URL of the provider's zone/record API
    pub api_url: String,

    /// Request timeout against the provider API
    #[serde(default = "default_api_timeout_secs")]
    pub api_timeout_secs: u64,

    /// Propagation wait before asking the CA to validate
    #[serde(default)]
    pub propagation: PropagationConfig,
}

fn default_api_timeout_secs() -> u64 {
    30
}

impl DnsConfig {
    /// Provider API request timeout.
    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout_secs)
    }
}

/// Propagation wait settings for DNS-01 challenge records.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct PropagationConfig {
    /// Fixed delay after record creation before validation is requested
    #[serde(default = "default_propagation_delay_secs")]
    pub delay_secs: u64,

    /// Verify the record is visible on public resolvers before validating
    #[serde(default)]
    pub verify: bool,

    /// Maximum time to wait for propagation when verifying
    #[serde(default = "default_propagation_timeout_secs")]
    pub timeout_secs: u64,

    /// Interval between resolver checks when verifying
    #[serde(default = "default_propagation_check_interval_secs")]
    pub check_interval_secs: u64,

    /// Nameservers to query when verifying (empty = system defaults)
    #[serde(default)]
    pub nameservers: Vec<IpAddr>,
}

fn default_propagation_delay_secs() -> u64 {
    60
}

fn default_propagation_timeout_secs() -> u64 {
    120
}

fn default_propagation_check_interval_secs() -> u64 {
    5
}

impl Default for PropagationConfig {
    fn default() -> Self {
        Self {
            delay_secs: default_propagation_delay_secs(),
            verify: false,
            timeout_secs: default_propagation_timeout_secs(),
            check_interval_secs: default_propagation_check_interval_secs(),
            nameservers: Vec::new(),
        }
    }
}

impl PropagationConfig {
    pub fn delay(&self) -> Duration {
        Duration::from_secs(self.delay_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// Certificate store and state directory locations.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct StoreConfig {
    /// Directory holding issued certificate material, one subdirectory per
    /// domain set
    pub cert_dir: PathBuf,

    /// Directory holding one-time completion markers
    pub state_dir: PathBuf,
}

/// The consumer service that serves TLS with the managed certificates.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ConsumerConfig {
    /// Directory the consumer reads certificate files from
    pub target_dir: PathBuf,

    /// Host of the consumer's TLS listener, used by the liveness probe
    #[serde(default = "default_consumer_host")]
    pub host: String,

    /// Port of the consumer's TLS listener
    pub port: u16,

    /// How the consumer is told to pick up new certificate material
    pub reload: ReloadConfig,

    /// Post-reload health confirmation
    #[serde(default)]
    pub health: HealthConfig,

    /// Retry budget for waiting on the target directory
    #[serde(default = "default_propagation_backoff")]
    pub propagation_backoff: BackoffConfig,
}

fn default_consumer_host() -> String {
    "127.0.0.1".to_string()
}

fn default_propagation_backoff() -> BackoffConfig {
    BackoffConfig {
        max_attempts: 5,
        base_delay_ms: 1_000,
        max_delay_ms: 10_000,
        jitter: false,
    }
}

/// Reload mechanism selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReloadMode {
    /// In-process TLS context reload, no availability gap (preferred)
    HotReload,
    /// Full process restart
    Restart,
}

/// How the consumer is told to pick up new certificate material.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct ReloadConfig {
    /// Hot reload where the consumer supports it, restart otherwise
    pub mode: ReloadMode,

    /// Command executed to trigger the reload/restart
    pub command: Vec<String>,
}

/// Health probe flavor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum ProbeKind {
    /// TCP connection attempt against host:port
    #[default]
    Tcp,
    /// External status command, exit code 0 means healthy
    Command,
}

/// Post-reload health confirmation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct HealthConfig {
    /// Probe flavor
    #[serde(default)]
    pub probe: ProbeKind,

    /// Status command when `probe = "command"`
    #[serde(default)]
    pub command: Option<Vec<String>>,

    /// Number of probe attempts before the cycle is marked degraded
    #[serde(default = "default_health_retries")]
    pub retries: u32,

    /// Interval between probe attempts
    #[serde(default = "default_health_interval_secs")]
    pub interval_secs: u64,

    /// Per-attempt probe timeout
    #[serde(default = "default_health_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_health_retries() -> u32 {
    10
}

fn default_health_interval_secs() -> u64 {
    3
}

fn default_health_timeout_secs() -> u64 {
    5
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            probe: ProbeKind::Tcp,
            command: None,
            retries: default_health_retries(),
            interval_secs: default_health_interval_secs(),
            timeout_secs: default_health_timeout_secs(),
        }
    }
}

impl HealthConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Renewal scheduler behavior.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct SchedulerConfig {
    /// Interval between renewal checks
    #[serde(default = "default_check_interval_hours")]
    pub check_interval_hours: u64,

    /// Run domain-set pipelines concurrently instead of strictly sequentially
    #[serde(default)]
    pub concurrent: bool,
}

fn default_check_interval_hours() -> u64 {
    24
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            check_interval_hours: default_check_interval_hours(),
            concurrent: false,
        }
    }
}

impl SchedulerConfig {
    pub fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_hours * 3600)
    }
}

/// A bounded retry budget: max attempts with exponential backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", deny_unknown_fields)]
pub struct BackoffConfig {
    /// Maximum number of attempts (including the first)
    #[serde(default = "default_backoff_max_attempts")]
    pub max_attempts: u32,

    /// Delay after the first failed attempt
    #[serde(default = "default_backoff_base_delay_ms")]
    pub base_delay_ms: u64,

    /// Cap applied to the exponential delay
    #[serde(default = "default_backoff_max_delay_ms")]
    pub max_delay_ms: u64,

    /// Randomize delays to avoid thundering herds
    #[serde(default)]
    pub jitter: bool,
}

fn default_backoff_max_attempts() -> u32 {
    3
}

fn default_backoff_base_delay_ms() -> u64 {
    2_000
}

fn default_backoff_max_delay_ms() -> u64 {
    60_000
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_backoff_max_attempts(),
            base_delay_ms: default_backoff_base_delay_ms(),
            max_delay_ms: default_backoff_max_delay_ms(),
            jitter: false,
        }
    }
}

impl Config {
    /// Load configuration from a TOML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Config = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        tracing::debug!(
            path = %path.display(),
            domain_sets = config.domain_sets.len(),
            "Loaded configuration"
        );
        Ok(config)
    }

    /// Validate the configuration, collecting every problem found.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let mut errors = Vec::new();

        if self.domain_sets.is_empty() {
            errors.push("at least one [[domain-set]] is required".to_string());
        }

        let mut primaries = Vec::new();
        for (i, set) in self.domain_sets.iter().enumerate() {
            if set.domains.is_empty() {
                errors.push(format!("domain-set #{}: domains list is empty", i + 1));
                continue;
            }
            for domain in &set.domains {
                if let Err(msg) = check_domain(domain) {
                    errors.push(format!("domain-set #{}: {}", i + 1, msg));
                }
            }
            let primary = set.primary().to_string();
            if primaries.contains(&primary) {
                errors.push(format!(
                    "domain-set #{}: duplicate primary domain '{}'",
                    i + 1,
                    primary
                ));
            }
            primaries.push(primary);
        }

        if !self.acme.contact.contains('@') || self.acme.contact.contains(char::is_whitespace) {
            errors.push(format!(
                "acme.contact '{}' is not a valid email address",
                self.acme.contact
            ));
        }
        if self.acme.renew_before_days == 0 {
            errors.push("acme.renew-before-days must be at least 1".to_string());
        }
        if self.acme.backoff.max_attempts == 0 {
            errors.push("acme.backoff.max-attempts must be at least 1".to_string());
        }

        if !self.dns.api_url.starts_with("http://") && !self.dns.api_url.starts_with("https://") {
            errors.push(format!(
                "dns.api-url '{}' must be an http(s) URL",
                self.dns.api_url
            ));
        }
        if self.dns.propagation.verify
            && self.dns.propagation.delay_secs > self.dns.propagation.timeout_secs
        {
            errors.push(
                "dns.propagation.delay-secs exceeds dns.propagation.timeout-secs".to_string(),
            );
        }

        if self.consumer.reload.command.is_empty() {
            errors.push("consumer.reload.command must not be empty".to_string());
        }
        if self.consumer.health.probe == ProbeKind::Command
            && self
                .consumer
                .health
                .command
                .as_ref()
                .map(|c| c.is_empty())
                .unwrap_or(true)
        {
            errors.push(
                "consumer.health.command is required when consumer.health.probe = \"command\""
                    .to_string(),
            );
        }
        if self.consumer.health.retries == 0 {
            errors.push("consumer.health.retries must be at least 1".to_string());
        }
        if self.consumer.propagation_backoff.max_attempts == 0 {
            errors.push("consumer.propagation-backoff.max-attempts must be at least 1".to_string());
        }

        if self.scheduler.check_interval_hours == 0 {
            errors.push("scheduler.check-interval-hours must be at least 1".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(ConfigError::Validation(errors))
        }
    }

    /// Target directory for a given domain set, honoring per-set overrides.
    pub fn target_dir_for(&self, set: &DomainSet) -> PathBuf {
        set.target_dir
            .clone()
            .unwrap_or_else(|| self.consumer.target_dir.clone())
    }
}

/// Check a single domain name, accepting a leading wildcard label.
fn check_domain(domain: &str) -> Result<(), String> {
    let bare = domain.strip_prefix("*.").unwrap_or(domain);
    if bare.is_empty() || !bare.contains('.') {
        return Err(format!("'{}' is not a valid domain name", domain));
    }
    let valid = bare.split('.').all(|label| {
        !label.is_empty()
            && !label.starts_with('-')
            && !label.ends_with('-')
            && label
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-')
    });
    if !valid {
        return Err(format!("'{}' is not a valid domain name", domain));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn minimal_toml() -> &'static str {
        r#"
            [[domain-set]]
            domains = ["irc.example.org", "*.irc.example.org"]

            [acme]
            contact = "admin@example.org"

            [dns]
            credentials-file = "/etc/certpilot/dns-token"
            api-url = "https://dns.example.com/api/v1"

            [store]
            cert-dir = "/var/lib/certpilot/store"
            state-dir = "/var/lib/certpilot/state"

            [consumer]
            target-dir = "/home/ircd/tls"
            port = 6697

            [consumer.reload]
            mode = "hot-reload"
            command = ["unrealircd", "rehash", "-tls"]
        "#
    }

    #[test]
    fn test_minimal_config_parses_with_defaults() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        config.validate().unwrap();

        assert_eq!(config.domain_sets.len(), 1);
        assert_eq!(config.domain_sets[0].primary(), "irc.example.org");
        assert_eq!(config.acme.renew_before_days, 30);
        assert!(!config.acme.staging);
        assert_eq!(config.dns.propagation.delay_secs, 60);
        assert!(!config.dns.propagation.verify);
        assert_eq!(config.consumer.host, "127.0.0.1");
        assert_eq!(config.consumer.health.retries, 10);
        assert_eq!(config.consumer.propagation_backoff.max_attempts, 5);
        assert_eq!(config.scheduler.check_interval_hours, 24);
        assert!(!config.scheduler.concurrent);
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(minimal_toml().as_bytes()).unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.acme.contact, "admin@example.org");
    }

    #[test]
    fn test_from_file_missing() {
        let err = Config::from_file("/nonexistent/certpilot.toml").unwrap_err();
        assert!(matches!(err, ConfigError::Io { .. }));
    }

    #[test]
    fn test_invalid_contact_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.acme.contact = "not-an-email".to_string();

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("acme.contact"));
    }

    #[test]
    fn test_empty_domain_set_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.domain_sets[0].domains.clear();

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_domain_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.domain_sets[0].domains = vec!["not a domain".to_string()];

        assert!(config.validate().is_err());
    }

    #[test]
    fn test_wildcard_domain_accepted() {
        assert!(check_domain("*.example.org").is_ok());
        assert!(check_domain("irc.example.org").is_ok());
        assert!(check_domain("example").is_err());
        assert!(check_domain("-bad.example.org").is_err());
    }

    #[test]
    fn test_duplicate_primary_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.domain_sets.push(config.domain_sets[0].clone());

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate primary"));
    }

    #[test]
    fn test_command_probe_requires_command() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.consumer.health.probe = ProbeKind::Command;

        assert!(config.validate().is_err());

        config.consumer.health.command = Some(vec!["ircd-status".to_string()]);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_target_dir_override() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(
            config.target_dir_for(&config.domain_sets[0]),
            PathBuf::from("/home/ircd/tls")
        );

        config.domain_sets[0].target_dir = Some(PathBuf::from("/srv/other/tls"));
        assert_eq!(
            config.target_dir_for(&config.domain_sets[0]),
            PathBuf::from("/srv/other/tls")
        );
    }

    #[test]
    fn test_zero_retry_budget_rejected() {
        let mut config: Config = toml::from_str(minimal_toml()).unwrap();
        config.consumer.propagation_backoff.max_attempts = 0;

        assert!(config.validate().is_err());
    }
}
