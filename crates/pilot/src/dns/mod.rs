//! DNS provider integration for ACME DNS-01 challenges.

mod api;
mod credentials;
mod propagation;
mod provider;

pub use api::ZoneApiProvider;
pub use credentials::{load_credentials, CredentialRecord, Credentials};
pub use propagation::{ExpectedRecord, PropagationWait};
pub use provider::{
    challenge_record_fqdn, normalize_domain, DnsProvider, DnsProviderError, DnsResult,
    ACME_CHALLENGE_RECORD, CHALLENGE_TTL,
};
