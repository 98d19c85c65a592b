//! DNS provider abstraction for ACME DNS-01 challenges.
//!
//! A provider only needs two verbs: create a TXT record and delete it
//! again. Everything else (zone discovery, auth, rate limits) is the
//! provider's own business and surfaces through [`DnsProviderError`].

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

use crate::errors::{Classify, ErrorClass};

/// Record name prefix for ACME DNS-01 challenges (RFC 8555 §8.4).
pub const ACME_CHALLENGE_RECORD: &str = "_acme-challenge";

/// Short TTL so stale challenge values fall out of caches quickly.
pub const CHALLENGE_TTL: u32 = 60;

pub type DnsResult<T> = Result<T, DnsProviderError>;

#[derive(Debug, Error)]
pub enum DnsProviderError {
    #[error("DNS API authentication failed: {0}")]
    Authentication(String),

    #[error("No DNS zone found for domain '{0}'")]
    ZoneNotFound(String),

    #[error("Failed to create TXT record for '{domain}': {message}")]
    RecordCreation { domain: String, message: String },

    #[error("Failed to delete TXT record '{record_id}': {message}")]
    RecordDeletion { record_id: String, message: String },

    #[error("DNS API request failed: {0}")]
    ApiRequest(String),

    #[error("DNS API rate limited, retry after {retry_after_secs}s")]
    RateLimited { retry_after_secs: u64 },

    #[error("DNS operation timed out after {elapsed_secs}s")]
    Timeout { elapsed_secs: u64 },

    #[error("DNS provider configuration error: {0}")]
    Configuration(String),

    #[error("DNS credential error: {0}")]
    Credentials(String),

    #[error("Domain '{0}' is not served by this provider")]
    UnsupportedDomain(String),
}

impl Classify for DnsProviderError {
    fn class(&self) -> ErrorClass {
        match self {
            DnsProviderError::RecordCreation { .. }
            | DnsProviderError::RecordDeletion { .. }
            | DnsProviderError::ApiRequest(_)
            | DnsProviderError::Timeout { .. } => ErrorClass::Transient,
            DnsProviderError::RateLimited { retry_after_secs } => {
                ErrorClass::RateLimited(Duration::from_secs(*retry_after_secs))
            }
            DnsProviderError::Authentication(_)
            | DnsProviderError::ZoneNotFound(_)
            | DnsProviderError::Configuration(_)
            | DnsProviderError::Credentials(_)
            | DnsProviderError::UnsupportedDomain(_) => ErrorClass::Permanent,
        }
    }
}

/// DNS record management, as much of it as DNS-01 needs.
#[async_trait]
pub trait DnsProvider: Send + Sync {
    /// Create a TXT record under `domain` and return a provider-scoped
    /// record id usable for later deletion.
    async fn create_txt_record(
        &self,
        domain: &str,
        record_name: &str,
        value: &str,
    ) -> DnsResult<String>;

    /// Delete a record previously created by this provider.
    async fn delete_txt_record(&self, domain: &str, record_id: &str) -> DnsResult<()>;

    /// Whether this provider can answer for the given domain at all.
    /// Used to fail fast before an order is even opened.
    async fn supports_domain(&self, domain: &str) -> bool;
}

/// Strip a leading wildcard label. The challenge record for
/// `*.example.com` lives at `_acme-challenge.example.com`.
pub fn normalize_domain(domain: &str) -> &str {
    domain.strip_prefix("*.").unwrap_or(domain)
}

/// Fully qualified name of the challenge record for a domain.
pub fn challenge_record_fqdn(domain: &str) -> String {
    format!("{}.{}", ACME_CHALLENGE_RECORD, normalize_domain(domain))
}
