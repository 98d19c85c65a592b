//! Zone-style REST DNS provider.
//!
//! Speaks the common zone/record HTTP API shape: `GET /zones` to find
//! the zone serving a domain, `POST /records` to create a TXT record,
//! `DELETE /records/{id}` to remove it. Auth is a bearer token. Zone
//! lookups are cached for the life of the process since zones change
//! rarely and every challenge would otherwise re-list them.

use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use super::credentials::CredentialRecord;
use super::provider::{normalize_domain, DnsProvider, DnsProviderError, DnsResult, CHALLENGE_TTL};

#[derive(Debug, Deserialize)]
struct ZonesResponse {
    zones: Vec<Zone>,
}

#[derive(Debug, Clone, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Serialize)]
struct CreateRecordRequest<'a> {
    zone_id: &'a str,
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    value: &'a str,
    ttl: u32,
}

#[derive(Debug, Deserialize)]
struct CreateRecordResponse {
    record: RecordRef,
}

#[derive(Debug, Deserialize)]
struct RecordRef {
    id: String,
}

pub struct ZoneApiProvider {
    client: reqwest::Client,
    base_url: String,
    token: String,
    scope: Option<String>,
    zone_cache: RwLock<HashMap<String, Zone>>,
}

impl ZoneApiProvider {
    pub fn new(api_url: &str, record: &CredentialRecord, timeout: Duration) -> DnsResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DnsProviderError::Configuration(format!("HTTP client: {e}")))?;

        Ok(Self {
            client,
            base_url: api_url.trim_end_matches('/').to_string(),
            token: record.credentials.bearer_token(),
            scope: record.scope.clone(),
            zone_cache: RwLock::new(HashMap::new()),
        })
    }

    /// Find the zone whose name is the longest suffix of `domain`.
    async fn find_zone(&self, domain: &str) -> DnsResult<Zone> {
        let domain = normalize_domain(domain);

        if let Some(zone) = self.zone_cache.read().get(domain) {
            return Ok(zone.clone());
        }

        let response = self
            .client
            .get(format!("{}/zones", self.base_url))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_request_error)?;
        let response = check_status(response).await?;

        let zones: ZonesResponse = response
            .json()
            .await
            .map_err(|e| DnsProviderError::ApiRequest(format!("invalid zones response: {e}")))?;

        let zone = zones
            .zones
            .into_iter()
            .filter(|z| domain == z.name || domain.ends_with(&format!(".{}", z.name)))
            .max_by_key(|z| z.name.len())
            .ok_or_else(|| DnsProviderError::ZoneNotFound(domain.to_string()))?;

        debug!(domain, zone = %zone.name, zone_id = %zone.id, "resolved DNS zone");
        self.zone_cache
            .write()
            .insert(domain.to_string(), zone.clone());
        Ok(zone)
    }

    fn check_scope(&self, domain: &str) -> DnsResult<()> {
        let domain = normalize_domain(domain);
        if let Some(scope) = &self.scope {
            if domain != scope && !domain.ends_with(&format!(".{scope}")) {
                return Err(DnsProviderError::UnsupportedDomain(domain.to_string()));
            }
        }
        Ok(())
    }
}

#[async_trait]
impl DnsProvider for ZoneApiProvider {
    async fn create_txt_record(
        &self,
        domain: &str,
        record_name: &str,
        value: &str,
    ) -> DnsResult<String> {
        self.check_scope(domain)?;
        let zone = self.find_zone(domain).await?;

        // Record names are zone-relative in this API shape: the record for
        // `_acme-challenge.irc.example.com` in zone `example.com` is
        // `_acme-challenge.irc`.
        let fqdn = format!("{}.{}", record_name, normalize_domain(domain));
        let relative = fqdn
            .strip_suffix(&format!(".{}", zone.name))
            .unwrap_or(&fqdn);

        let body = CreateRecordRequest {
            zone_id: &zone.id,
            record_type: "TXT",
            name: relative,
            value,
            ttl: CHALLENGE_TTL,
        };

        let response = self
            .client
            .post(format!("{}/records", self.base_url))
            .bearer_auth(&self.token)
            .json(&body)
            .send()
            .await
            .map_err(map_request_error)?;

        if !response.status().is_success() {
            let err = status_error(response).await;
            return Err(match err {
                DnsProviderError::ApiRequest(message) => DnsProviderError::RecordCreation {
                    domain: domain.to_string(),
                    message,
                },
                other => other,
            });
        }

        let created: CreateRecordResponse = response.json().await.map_err(|e| {
            DnsProviderError::RecordCreation {
                domain: domain.to_string(),
                message: format!("invalid create response: {e}"),
            }
        })?;

        info!(domain, record = %fqdn, record_id = %created.record.id, "created TXT record");
        Ok(created.record.id)
    }

    async fn delete_txt_record(&self, domain: &str, record_id: &str) -> DnsResult<()> {
        let response = self
            .client
            .delete(format!("{}/records/{}", self.base_url, record_id))
            .bearer_auth(&self.token)
            .send()
            .await
            .map_err(map_request_error)?;

        // 404 means the record is already gone, which is what we wanted.
        if response.status() == StatusCode::NOT_FOUND {
            warn!(domain, record_id, "TXT record already deleted");
            return Ok(());
        }
        if !response.status().is_success() {
            let err = status_error(response).await;
            return Err(match err {
                DnsProviderError::ApiRequest(message) => DnsProviderError::RecordDeletion {
                    record_id: record_id.to_string(),
                    message,
                },
                other => other,
            });
        }

        info!(domain, record_id, "deleted TXT record");
        Ok(())
    }

    async fn supports_domain(&self, domain: &str) -> bool {
        if self.check_scope(domain).is_err() {
            return false;
        }
        self.find_zone(domain).await.is_ok()
    }
}

fn map_request_error(err: reqwest::Error) -> DnsProviderError {
    if err.is_timeout() {
        DnsProviderError::Timeout { elapsed_secs: 0 }
    } else {
        DnsProviderError::ApiRequest(err.to_string())
    }
}

/// Map auth and rate-limit statuses to their dedicated variants; pass
/// everything else through as an API error with the response body.
async fn check_status(response: reqwest::Response) -> DnsResult<reqwest::Response> {
    if response.status().is_success() {
        return Ok(response);
    }
    Err(status_error(response).await)
}

async fn status_error(response: reqwest::Response) -> DnsProviderError {
    let status = response.status();
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => {
            DnsProviderError::Authentication(format!("API returned {status}"))
        }
        StatusCode::TOO_MANY_REQUESTS => {
            let retry_after_secs = response
                .headers()
                .get(reqwest::header::RETRY_AFTER)
                .and_then(|v| v.to_str().ok())
                .and_then(|v| v.parse().ok())
                .unwrap_or(60);
            DnsProviderError::RateLimited { retry_after_secs }
        }
        _ => {
            let body = response.text().await.unwrap_or_default();
            DnsProviderError::ApiRequest(format!("{status}: {body}"))
        }
    }
}
