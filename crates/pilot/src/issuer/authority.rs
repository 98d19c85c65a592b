//! ACME certificate authority client.
//!
//! [`CertificateAuthority`] and [`AcmeOrder`] are the seam between the
//! issuance pipeline and the ACME protocol; [`AcmeAuthority`] is the
//! real implementation on top of Let's Encrypt (or any RFC 8555
//! directory). Tests swap in a mock authority so no network is touched.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, Utc};
use instant_acme::{
    Account, AuthorizationStatus, ChallengeType, Identifier, KeyAuthorization, NewAccount,
    NewOrder, Order, OrderStatus,
};
use sha2::{Digest, Sha256};
use tokio::sync::RwLock;
use tracing::{debug, info, trace};

use crate::dns::challenge_record_fqdn;
use crate::store::CertificateStore;

use super::IssueError;

const LETSENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
const LETSENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

/// How long to wait for the CA to validate challenges.
const VALIDATION_TIMEOUT: Duration = Duration::from_secs(300);
/// How long to wait for the certificate after CSR submission.
const FINALIZE_TIMEOUT: Duration = Duration::from_secs(120);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// One DNS-01 challenge the caller must satisfy before validation.
#[derive(Debug, Clone, PartialEq)]
pub struct DnsChallenge {
    /// Domain the challenge authorizes (wildcard prefix intact)
    pub domain: String,
    /// Fully qualified TXT record name
    pub record_fqdn: String,
    /// TXT record value the CA expects to find
    pub record_value: String,
}

/// A certificate as handed back by the CA.
#[derive(Debug, Clone)]
pub struct IssuedCertificate {
    pub chain_pem: String,
    pub key_pem: String,
    pub expires_at: DateTime<Utc>,
}

/// An in-flight certificate order.
#[async_trait]
pub trait AcmeOrder: Send {
    /// Challenges that must be provisioned in DNS.
    fn challenges(&self) -> &[DnsChallenge];

    /// Tell the CA the challenge records are in place.
    async fn notify_ready(&mut self) -> Result<(), IssueError>;

    /// Poll until the CA has validated all challenges.
    async fn wait_validated(&mut self) -> Result<(), IssueError>;

    /// Submit a CSR and retrieve the issued certificate.
    async fn finalize(self: Box<Self>, domains: &[String]) -> Result<IssuedCertificate, IssueError>;
}

/// Entry point for creating orders against a CA.
#[async_trait]
pub trait CertificateAuthority: Send + Sync {
    async fn new_order(&self, domains: &[String]) -> Result<Box<dyn AcmeOrder>, IssueError>;
}

/// DNS-01 record value: base64url(SHA-256(key authorization)), RFC 8555 §8.4.
fn dns01_record_value(key_authorization: &KeyAuthorization) -> String {
    let digest = Sha256::digest(key_authorization.as_str().as_bytes());
    URL_SAFE_NO_PAD.encode(digest)
}

/// Live ACME authority. Registers an account on first use and persists
/// its credentials in the store so later runs reuse it.
pub struct AcmeAuthority {
    account: RwLock<Option<Account>>,
    store: Arc<CertificateStore>,
    contact: String,
    staging: bool,
}

impl AcmeAuthority {
    pub fn new(store: Arc<CertificateStore>, contact: impl Into<String>, staging: bool) -> Self {
        Self {
            account: RwLock::new(None),
            store,
            contact: contact.into(),
            staging,
        }
    }

    fn directory_url(&self) -> &'static str {
        if self.staging {
            LETSENCRYPT_STAGING
        } else {
            LETSENCRYPT_PRODUCTION
        }
    }

    /// Load the stored account or register a new one.
    async fn ensure_account(&self) -> Result<(), IssueError> {
        if self.account.read().await.is_some() {
            return Ok(());
        }

        let mut guard = self.account.write().await;
        if guard.is_some() {
            return Ok(());
        }

        let account = if let Some(creds_json) = self.store.load_account_credentials()? {
            info!("loading stored ACME account");
            let credentials: instant_acme::AccountCredentials = serde_json::from_str(&creds_json)
                .map_err(|e| IssueError::Account(format!("stored credentials invalid: {e}")))?;
            Account::builder()
                .map_err(|e| IssueError::Account(e.to_string()))?
                .from_credentials(credentials)
                .await
                .map_err(|e| IssueError::Account(e.to_string()))?
        } else {
            info!(
                contact = %self.contact,
                staging = self.staging,
                "registering new ACME account"
            );
            let (account, credentials) = Account::builder()
                .map_err(|e| IssueError::Account(e.to_string()))?
                .create(
                    &NewAccount {
                        contact: &[&format!("mailto:{}", self.contact)],
                        terms_of_service_agreed: true,
                        only_return_existing: false,
                    },
                    self.directory_url().to_owned(),
                    None,
                )
                .await
                .map_err(|e| IssueError::Account(e.to_string()))?;

            let creds_json = serde_json::to_string_pretty(&credentials)
                .map_err(|e| IssueError::Account(format!("serializing credentials: {e}")))?;
            self.store.save_account_credentials(&creds_json)?;
            account
        };

        *guard = Some(account);
        Ok(())
    }
}

#[async_trait]
impl CertificateAuthority for AcmeAuthority {
    async fn new_order(&self, domains: &[String]) -> Result<Box<dyn AcmeOrder>, IssueError> {
        self.ensure_account().await?;
        let guard = self.account.read().await;
        let account = guard
            .as_ref()
            .ok_or_else(|| IssueError::Account("account not initialized".into()))?;

        let identifiers: Vec<Identifier> = domains
            .iter()
            .map(|d| Identifier::Dns(d.clone()))
            .collect();

        info!(?domains, "creating certificate order");
        let mut order = account
            .new_order(&NewOrder::new(&identifiers))
            .await
            .map_err(|e| IssueError::Order(format!("creating order: {e}")))?;

        let challenges = collect_dns_challenges(&mut order).await?;
        Ok(Box::new(LiveOrder { order, challenges }))
    }
}

/// Walk the order's authorizations and extract one DNS-01 challenge per
/// pending domain.
async fn collect_dns_challenges(order: &mut Order) -> Result<Vec<DnsChallenge>, IssueError> {
    let mut challenges = Vec::new();
    let mut authorizations = order.authorizations();

    while let Some(result) = authorizations.next().await {
        let mut authz = result
            .map_err(|e| IssueError::Order(format!("fetching authorization: {e}")))?;

        let domain = match &authz.identifier().identifier {
            Identifier::Dns(domain) => domain.clone(),
            _ => continue,
        };

        debug!(domain = %domain, status = ?authz.status, "processing authorization");
        if authz.status == AuthorizationStatus::Valid {
            continue;
        }

        let challenge = authz
            .challenge(ChallengeType::Dns01)
            .ok_or_else(|| IssueError::NoDnsChallenge(domain.clone()))?;

        let record_value = dns01_record_value(&challenge.key_authorization());
        challenges.push(DnsChallenge {
            record_fqdn: challenge_record_fqdn(&domain),
            record_value,
            domain,
        });
    }

    Ok(challenges)
}

struct LiveOrder {
    order: Order,
    challenges: Vec<DnsChallenge>,
}

#[async_trait]
impl AcmeOrder for LiveOrder {
    fn challenges(&self) -> &[DnsChallenge] {
        &self.challenges
    }

    async fn notify_ready(&mut self) -> Result<(), IssueError> {
        let mut authorizations = self.order.authorizations();
        while let Some(result) = authorizations.next().await {
            let mut authz = result
                .map_err(|e| IssueError::Order(format!("fetching authorization: {e}")))?;
            if authz.status != AuthorizationStatus::Pending {
                continue;
            }
            let domain = match &authz.identifier().identifier {
                Identifier::Dns(domain) => domain.clone(),
                _ => continue,
            };
            let mut challenge = authz
                .challenge(ChallengeType::Dns01)
                .ok_or_else(|| IssueError::NoDnsChallenge(domain.clone()))?;
            debug!(domain = %domain, "marking challenge ready");
            challenge
                .set_ready()
                .await
                .map_err(|e| IssueError::Validation {
                    domain,
                    message: e.to_string(),
                })?;
        }
        Ok(())
    }

    async fn wait_validated(&mut self) -> Result<(), IssueError> {
        let deadline = tokio::time::Instant::now() + VALIDATION_TIMEOUT;
        loop {
            let state = self
                .order
                .refresh()
                .await
                .map_err(|e| IssueError::Order(format!("refreshing order: {e}")))?;

            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => {
                    info!("order validated");
                    return Ok(());
                }
                OrderStatus::Invalid => {
                    return Err(IssueError::Validation {
                        domain: String::new(),
                        message: "order became invalid".into(),
                    });
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(IssueError::Timeout(
                            "waiting for challenge validation".into(),
                        ));
                    }
                    trace!(status = ?state.status, "order not validated yet");
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        }
    }

    async fn finalize(
        mut self: Box<Self>,
        domains: &[String],
    ) -> Result<IssuedCertificate, IssueError> {
        info!("finalizing certificate order");

        let cert_key = rcgen::KeyPair::generate()
            .map_err(|e| IssueError::Finalization(format!("generating key: {e}")))?;
        let params = rcgen::CertificateParams::new(domains.to_vec())
            .map_err(|e| IssueError::Finalization(format!("building CSR params: {e}")))?;
        let csr = params
            .serialize_request(&cert_key)
            .map_err(|e| IssueError::Finalization(format!("serializing CSR: {e}")))?;
        let csr_der = csr.der().to_vec();

        self.order
            .finalize_csr(&csr_der)
            .await
            .map_err(|e| IssueError::Finalization(format!("submitting CSR: {e}")))?;

        let deadline = tokio::time::Instant::now() + FINALIZE_TIMEOUT;
        let chain_pem = loop {
            let state = self
                .order
                .refresh()
                .await
                .map_err(|e| IssueError::Finalization(format!("refreshing order: {e}")))?;

            match state.status {
                OrderStatus::Valid => {
                    let cert = self.order.certificate().await.map_err(|e| {
                        IssueError::Finalization(format!("fetching certificate: {e}"))
                    })?;
                    break cert.ok_or_else(|| {
                        IssueError::Finalization("no certificate in response".into())
                    })?;
                }
                OrderStatus::Invalid => {
                    return Err(IssueError::Finalization("order became invalid".into()));
                }
                _ => {
                    if tokio::time::Instant::now() > deadline {
                        return Err(IssueError::Timeout("waiting for certificate".into()));
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                }
            }
        };

        let expires_at = parse_certificate_expiry(&chain_pem)?;
        Ok(IssuedCertificate {
            chain_pem,
            key_pem: cert_key.serialize_pem(),
            expires_at,
        })
    }
}

/// Expiry of the leaf certificate in a PEM chain.
pub fn parse_certificate_expiry(chain_pem: &str) -> Result<DateTime<Utc>, IssueError> {
    use x509_parser::prelude::*;

    let (_, pem) = pem::parse_x509_pem(chain_pem.as_bytes())
        .map_err(|e| IssueError::CertificateParse(format!("parsing PEM: {e}")))?;
    let (_, cert) = X509Certificate::from_der(&pem.contents)
        .map_err(|e| IssueError::CertificateParse(format!("parsing certificate: {e}")))?;

    let timestamp = cert.validity().not_after.timestamp();
    DateTime::from_timestamp(timestamp, 0)
        .ok_or_else(|| IssueError::CertificateParse("invalid expiry timestamp".into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_dns01_record_value_shape() {
        // The value is base64url without padding, so 43 chars for SHA-256.
        let ka = "token.thumbprint";
        let digest = Sha256::digest(ka.as_bytes());
        let value = URL_SAFE_NO_PAD.encode(digest);
        assert_eq!(value.len(), 43);
        assert!(!value.contains('='));
        assert!(!value.contains('+'));
        assert!(!value.contains('/'));
    }

    #[test]
    fn test_directory_url_selection() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = Arc::new(CertificateStore::new(dir.path()).unwrap());
        let staging = AcmeAuthority::new(store.clone(), "ops@example.com", true);
        assert!(staging.directory_url().contains("staging"));
        let production = AcmeAuthority::new(store, "ops@example.com", false);
        assert!(!production.directory_url().contains("staging"));
    }
}
