//! Waiting for challenge records to become visible.
//!
//! Two modes. The default is a fixed delay: providers commit records
//! to their authoritative servers well within a minute, and the ACME
//! server queries those directly. Optional verification polls real
//! resolvers for the expected TXT values before proceeding, bounded by
//! its own timeout.

use std::net::{IpAddr, SocketAddr};
use std::time::Duration;

use hickory_resolver::config::{NameServerConfig, Protocol, ResolverConfig, ResolverOpts};
use hickory_resolver::error::ResolveErrorKind;
use hickory_resolver::TokioAsyncResolver;
use tracing::{debug, info, warn};

use certpilot_config::PropagationConfig;

use super::provider::{DnsProviderError, DnsResult};

/// A record we expect to observe: fully qualified name and TXT value.
#[derive(Debug, Clone)]
pub struct ExpectedRecord {
    pub fqdn: String,
    pub value: String,
}

pub struct PropagationWait {
    delay: Duration,
    checker: Option<ResolverCheck>,
}

struct ResolverCheck {
    resolver: TokioAsyncResolver,
    timeout: Duration,
    check_interval: Duration,
}

impl PropagationWait {
    /// Fixed-delay wait without resolver verification.
    pub fn fixed(delay: Duration) -> Self {
        Self {
            delay,
            checker: None,
        }
    }

    pub fn from_config(config: &PropagationConfig) -> Self {
        let checker = config.verify.then(|| ResolverCheck {
            resolver: build_resolver(&config.nameservers),
            timeout: config.timeout(),
            check_interval: config.check_interval(),
        });
        Self {
            delay: config.delay(),
            checker,
        }
    }

    /// Wait for the given records to propagate. Always sleeps the base
    /// delay; then, if verification is enabled, polls until every record
    /// is visible or the verification budget runs out.
    pub async fn wait(&self, records: &[ExpectedRecord]) -> DnsResult<()> {
        if !self.delay.is_zero() {
            info!(
                delay_secs = self.delay.as_secs(),
                records = records.len(),
                "waiting for DNS propagation"
            );
            tokio::time::sleep(self.delay).await;
        }

        let Some(checker) = &self.checker else {
            return Ok(());
        };

        let deadline = tokio::time::Instant::now() + checker.timeout;
        loop {
            let mut pending = Vec::new();
            for record in records {
                if !checker.is_visible(record).await {
                    pending.push(record.fqdn.as_str());
                }
            }
            if pending.is_empty() {
                info!(records = records.len(), "all challenge records visible");
                return Ok(());
            }
            if tokio::time::Instant::now() + checker.check_interval > deadline {
                warn!(pending = ?pending, "challenge records still not visible");
                return Err(DnsProviderError::Timeout {
                    elapsed_secs: checker.timeout.as_secs(),
                });
            }
            debug!(pending = ?pending, "records not yet visible, polling again");
            tokio::time::sleep(checker.check_interval).await;
        }
    }
}

impl ResolverCheck {
    async fn is_visible(&self, record: &ExpectedRecord) -> bool {
        match self.resolver.txt_lookup(record.fqdn.clone()).await {
            Ok(lookup) => lookup.iter().any(|txt| {
                let joined: Vec<u8> = txt.txt_data().iter().flat_map(|d| d.iter().copied()).collect();
                joined == record.value.as_bytes()
            }),
            // Not an error: the record simply has not propagated yet.
            Err(e) if matches!(e.kind(), ResolveErrorKind::NoRecordsFound { .. }) => false,
            Err(e) => {
                debug!(fqdn = %record.fqdn, error = %e, "TXT lookup failed");
                false
            }
        }
    }
}

fn build_resolver(nameservers: &[IpAddr]) -> TokioAsyncResolver {
    let config = if nameservers.is_empty() {
        ResolverConfig::cloudflare()
    } else {
        let mut config = ResolverConfig::new();
        for ip in nameservers {
            config.add_name_server(NameServerConfig::new(
                SocketAddr::new(*ip, 53),
                Protocol::Udp,
            ));
        }
        config
    };

    let mut opts = ResolverOpts::default();
    // Cached answers would defeat the point of polling.
    opts.cache_size = 0;
    opts.timeout = Duration::from_secs(5);
    TokioAsyncResolver::tokio(config, opts)
}
