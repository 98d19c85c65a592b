//! Certificate issuance via ACME DNS-01.
//!
//! The issuer owns the full order lifecycle: skip-if-fresh check,
//! challenge record provisioning, propagation wait, CA validation,
//! finalization, cleanup, and persisting the result. Failed orders are
//! retried under the configured backoff budget; challenge records are
//! removed on every path, success or failure.

mod authority;

pub use authority::{
    parse_certificate_expiry, AcmeAuthority, AcmeOrder, CertificateAuthority, DnsChallenge,
    IssuedCertificate,
};

use std::sync::Arc;

use chrono::Utc;
use thiserror::Error;
use tracing::{info, warn};

use crate::backoff::BackoffPolicy;
use crate::dns::{DnsProvider, DnsProviderError, ExpectedRecord, PropagationWait, ACME_CHALLENGE_RECORD};
use crate::errors::{Classify, ErrorClass};
use crate::store::{CertificateBundle, CertificateStore, StoreError};

#[derive(Debug, Error)]
pub enum IssueError {
    #[error("Certificate request is invalid: {0}")]
    InvalidRequest(String),

    #[error("ACME account error: {0}")]
    Account(String),

    #[error("ACME order error: {0}")]
    Order(String),

    #[error("No DNS-01 challenge offered for domain '{0}'")]
    NoDnsChallenge(String),

    #[error("Challenge validation failed for '{domain}': {message}")]
    Validation { domain: String, message: String },

    #[error("Order finalization failed: {0}")]
    Finalization(String),

    #[error("ACME operation timed out: {0}")]
    Timeout(String),

    #[error(transparent)]
    Dns(#[from] DnsProviderError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to parse issued certificate: {0}")]
    CertificateParse(String),
}

impl Classify for IssueError {
    fn class(&self) -> ErrorClass {
        match self {
            IssueError::InvalidRequest(_)
            | IssueError::Account(_)
            | IssueError::NoDnsChallenge(_)
            | IssueError::CertificateParse(_) => ErrorClass::Permanent,
            // Validation failures are usually stale or slow DNS; a fresh
            // order with new records often succeeds.
            IssueError::Order(_)
            | IssueError::Validation { .. }
            | IssueError::Finalization(_)
            | IssueError::Timeout(_) => ErrorClass::Transient,
            IssueError::Dns(e) => e.class(),
            IssueError::Store(e) => e.class(),
        }
    }
}

/// Outcome of an issuance request.
#[derive(Debug)]
pub struct Issuance {
    pub bundle: CertificateBundle,
    /// False when the stored bundle was still fresh and nothing was ordered.
    pub renewed: bool,
}

/// Order-insensitive comparison of two domain lists.
fn same_domain_set(a: &[String], b: &[String]) -> bool {
    let mut a: Vec<&str> = a.iter().map(String::as_str).collect();
    let mut b: Vec<&str> = b.iter().map(String::as_str).collect();
    a.sort_unstable();
    a.dedup();
    b.sort_unstable();
    b.dedup();
    a == b
}

pub struct Issuer {
    authority: Arc<dyn CertificateAuthority>,
    dns: Arc<dyn DnsProvider>,
    propagation: PropagationWait,
    store: Arc<CertificateStore>,
    renew_before_days: u32,
    backoff: BackoffPolicy,
}

impl Issuer {
    pub fn new(
        authority: Arc<dyn CertificateAuthority>,
        dns: Arc<dyn DnsProvider>,
        propagation: PropagationWait,
        store: Arc<CertificateStore>,
        renew_before_days: u32,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            authority,
            dns,
            propagation,
            store,
            renew_before_days,
            backoff,
        }
    }

    /// Issue or renew the certificate covering `domains`.
    ///
    /// Idempotent: when the stored bundle covers the same domains, is
    /// valid beyond the renewal threshold, and `force` is false, it is
    /// returned without any external calls.
    pub async fn issue(&self, domains: &[String], force: bool) -> Result<Issuance, IssueError> {
        let primary = domains
            .first()
            .ok_or_else(|| IssueError::InvalidRequest("empty domain list".into()))?;

        if !force {
            if let Some(bundle) = self.store.load(primary)? {
                // A stored bundle only counts if it covers exactly the
                // requested domains; otherwise it is treated as missing.
                if same_domain_set(&bundle.domains, domains)
                    && !bundle.expires_within_days(self.renew_before_days, Utc::now())
                {
                    info!(
                        primary = bundle.primary(),
                        expires_at = %bundle.expires_at,
                        "certificate still fresh, skipping issuance"
                    );
                    return Ok(Issuance {
                        bundle,
                        renewed: false,
                    });
                }
            }
        }

        let issued = self
            .backoff
            .retry("certificate issuance", || self.attempt_order(domains))
            .await?;

        let bundle = CertificateBundle {
            domains: domains.to_vec(),
            chain_pem: issued.chain_pem,
            key_pem: issued.key_pem,
            issued_at: Utc::now(),
            expires_at: issued.expires_at,
        };
        self.store.save(&bundle)?;

        Ok(Issuance {
            bundle,
            renewed: true,
        })
    }

    /// One complete order attempt: provision records, wait, validate,
    /// finalize. Challenge records created here are deleted before this
    /// returns, whatever happens.
    async fn attempt_order(&self, domains: &[String]) -> Result<IssuedCertificate, IssueError> {
        let mut order = self.authority.new_order(domains).await?;
        let challenges = order.challenges().to_vec();

        let mut created: Vec<(String, String)> = Vec::new();
        let validated = self
            .provision_and_validate(order.as_mut(), &challenges, &mut created)
            .await;

        for (domain, record_id) in &created {
            if let Err(e) = self.dns.delete_txt_record(domain, record_id).await {
                warn!(
                    domain = %domain,
                    record_id = %record_id,
                    error = %e,
                    "failed to clean up challenge record"
                );
            }
        }

        validated?;
        order.finalize(domains).await
    }

    async fn provision_and_validate(
        &self,
        order: &mut dyn AcmeOrder,
        challenges: &[DnsChallenge],
        created: &mut Vec<(String, String)>,
    ) -> Result<(), IssueError> {
        for challenge in challenges {
            let record_id = self
                .dns
                .create_txt_record(
                    &challenge.domain,
                    ACME_CHALLENGE_RECORD,
                    &challenge.record_value,
                )
                .await?;
            created.push((challenge.domain.clone(), record_id));
        }

        let expected: Vec<ExpectedRecord> = challenges
            .iter()
            .map(|c| ExpectedRecord {
                fqdn: c.record_fqdn.clone(),
                value: c.record_value.clone(),
            })
            .collect();
        self.propagation.wait(&expected).await?;

        order.notify_ready().await?;
        order.wait_validated().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockAuthority, MockDnsProvider};
    use std::time::Duration;
    use tempfile::TempDir;

    fn issuer(
        authority: Arc<MockAuthority>,
        dns: Arc<MockDnsProvider>,
        store: Arc<CertificateStore>,
    ) -> Issuer {
        Issuer::new(
            authority,
            dns,
            PropagationWait::fixed(Duration::ZERO),
            store,
            30,
            BackoffPolicy::new(3, Duration::from_millis(10), Duration::from_secs(1)),
        )
    }

    fn store() -> (TempDir, Arc<CertificateStore>) {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(CertificateStore::new(dir.path()).unwrap());
        (dir, store)
    }

    #[tokio::test]
    async fn test_fresh_certificate_skips_external_calls() {
        let (_dir, store) = store();
        let authority = Arc::new(MockAuthority::new(90));
        let dns = Arc::new(MockDnsProvider::new());

        // Seed a bundle that is nowhere near the renewal threshold of 30.
        store
            .save(&CertificateBundle {
                domains: vec!["irc.example.com".into()],
                chain_pem: "chain".into(),
                key_pem: "key".into(),
                issued_at: Utc::now(),
                expires_at: Utc::now() + chrono::Duration::days(45),
            })
            .unwrap();

        let issuer = issuer(authority.clone(), dns.clone(), store);
        let outcome = issuer
            .issue(&["irc.example.com".into()], false)
            .await
            .unwrap();

        assert!(!outcome.renewed);
        assert_eq!(outcome.bundle.chain_pem, "chain");
        assert_eq!(authority.orders_created(), 0);
        assert_eq!(dns.create_calls(), 0);
    }

    #[tokio::test]
    async fn test_force_reissues_fresh_certificate() {
        let (_dir, store) = store();
        let authority = Arc::new(MockAuthority::new(90));
        let dns = Arc::new(MockDnsProvider::new());

        store
            .save(&CertificateBundle {
                domains: vec!["irc.example.com".into()],
                chain_pem: "chain".into(),
                key_pem: "key".into(),
                issued_at: Utc::now(),
                expires_at: Utc::now() + chrono::Duration::days(60),
            })
            .unwrap();

        let issuer = issuer(authority.clone(), dns.clone(), store);
        let outcome = issuer
            .issue(&["irc.example.com".into()], true)
            .await
            .unwrap();

        assert!(outcome.renewed);
        assert_eq!(authority.orders_created(), 1);
    }

    #[tokio::test]
    async fn test_changed_domain_set_triggers_reissue() {
        let (_dir, store) = store();
        let authority = Arc::new(MockAuthority::new(90));
        let dns = Arc::new(MockDnsProvider::new());

        // Fresh bundle, but it covers only the bare domain.
        store
            .save(&CertificateBundle {
                domains: vec!["irc.example.com".into()],
                chain_pem: "chain".into(),
                key_pem: "key".into(),
                issued_at: Utc::now(),
                expires_at: Utc::now() + chrono::Duration::days(45),
            })
            .unwrap();

        let domains = vec![
            "irc.example.com".to_string(),
            "*.irc.example.com".to_string(),
        ];
        let issuer = issuer(authority.clone(), dns.clone(), store);
        let outcome = issuer.issue(&domains, false).await.unwrap();

        assert!(outcome.renewed);
        assert_eq!(authority.orders_created(), 1);
        assert_eq!(outcome.bundle.domains, domains);
    }

    #[tokio::test]
    async fn test_renewal_runs_full_flow_and_cleans_up() {
        let (_dir, store) = store();
        let authority = Arc::new(MockAuthority::new(90));
        let dns = Arc::new(MockDnsProvider::new());

        store
            .save(&CertificateBundle {
                domains: vec!["irc.example.com".into(), "*.irc.example.com".into()],
                chain_pem: "chain".into(),
                key_pem: "key".into(),
                issued_at: Utc::now() - chrono::Duration::days(70),
                expires_at: Utc::now() + chrono::Duration::days(20),
            })
            .unwrap();

        let domains = vec!["irc.example.com".to_string(), "*.irc.example.com".to_string()];
        let issuer = issuer(authority.clone(), dns.clone(), store.clone());
        let outcome = issuer.issue(&domains, false).await.unwrap();

        assert!(outcome.renewed);
        assert!(outcome.bundle.expires_at > Utc::now() + chrono::Duration::days(60));
        assert_eq!(dns.create_calls(), 2);
        assert_eq!(dns.delete_calls(), 2);
        // The new bundle replaced the stored one.
        let stored = store.load("irc.example.com").unwrap().unwrap();
        assert_eq!(stored.expires_at, outcome.bundle.expires_at);
    }

    #[tokio::test]
    async fn test_cleanup_runs_when_validation_fails() {
        let (_dir, store) = store();
        let authority = Arc::new(MockAuthority::new(90));
        authority.fail_validation_permanently();
        let dns = Arc::new(MockDnsProvider::new());

        let issuer = issuer(authority.clone(), dns.clone(), store);
        let result = issuer.issue(&["irc.example.com".into()], false).await;

        assert!(result.is_err());
        assert_eq!(dns.create_calls(), dns.delete_calls());
        assert!(dns.delete_calls() > 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rate_limited_order_retries_after_requested_delay() {
        let (_dir, store) = store();
        let authority = Arc::new(MockAuthority::new(90));
        let dns = Arc::new(MockDnsProvider::new());
        dns.fail_next_create(DnsProviderError::RateLimited {
            retry_after_secs: 17,
        });

        let issuer = issuer(authority.clone(), dns.clone(), store);
        let start = tokio::time::Instant::now();
        let outcome = issuer
            .issue(&["irc.example.com".into()], false)
            .await
            .unwrap();

        assert!(outcome.renewed);
        // One rate-limited create plus the successful retry.
        assert_eq!(dns.create_calls(), 2);
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_secs(17));
        assert!(elapsed < Duration::from_secs(18));
    }

    #[tokio::test]
    async fn test_permanent_dns_error_is_not_retried() {
        let (_dir, store) = store();
        let authority = Arc::new(MockAuthority::new(90));
        let dns = Arc::new(MockDnsProvider::new());
        dns.fail_next_create(DnsProviderError::Authentication("bad token".into()));

        let issuer = issuer(authority.clone(), dns.clone(), store);
        let err = issuer
            .issue(&["irc.example.com".into()], false)
            .await
            .unwrap_err();

        assert_eq!(err.class(), ErrorClass::Permanent);
        assert_eq!(dns.create_calls(), 1);
        assert_eq!(authority.orders_created(), 1);
    }

    #[test]
    fn test_same_domain_set_ignores_order() {
        let stored = vec!["irc.example.com".to_string(), "*.irc.example.com".to_string()];
        let requested = vec!["*.irc.example.com".to_string(), "irc.example.com".to_string()];
        assert!(same_domain_set(&stored, &requested));
        assert!(!same_domain_set(&stored, &requested[..1].to_vec()));
    }

    #[tokio::test]
    async fn test_empty_domain_list_rejected() {
        let (_dir, store) = store();
        let issuer = issuer(
            Arc::new(MockAuthority::new(90)),
            Arc::new(MockDnsProvider::new()),
            store,
        );
        let err = issuer.issue(&[], false).await.unwrap_err();
        assert!(matches!(err, IssueError::InvalidRequest(_)));
    }
}
