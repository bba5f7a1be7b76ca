//! C5: thin typed wrapper over the Cloudflare DNS HTTP API.

use crate::classifier::{self, ClassifyContext};
use crate::error::{ClassifiedError, CoreError, ErrorKind, Phase};
use crate::types::{DnsRecord, DnsRecordType};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_BASE: &str = "https://api.cloudflare.com/client/v4";
const TIMEOUT: Duration = Duration::from_secs(15);

pub struct DnsClient {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

#[derive(Debug, Deserialize)]
struct ApiEnvelope<T> {
    success: bool,
    result: Option<T>,
    #[serde(default)]
    errors: Vec<ApiError>,
}

#[derive(Debug, Deserialize)]
struct ApiError {
    #[serde(default)]
    code: i64,
    message: String,
}

#[derive(Debug, Deserialize)]
struct Zone {
    id: String,
    name: String,
}

#[derive(Debug, Deserialize)]
struct WireRecord {
    id: String,
    #[serde(rename = "type")]
    record_type: String,
    name: String,
    content: String,
    #[serde(default = "default_ttl")]
    ttl: u32,
    #[serde(default)]
    proxied: bool,
}

fn default_ttl() -> u32 {
    1
}

#[derive(Debug, Serialize)]
struct CreateRecordBody<'a> {
    #[serde(rename = "type")]
    record_type: &'a str,
    name: &'a str,
    content: &'a str,
    ttl: u32,
    proxied: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    comment: Option<&'a str>,
}

#[derive(Debug, Serialize, Default)]
struct UpdateRecordBody<'a> {
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    record_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    content: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ttl: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    proxied: Option<bool>,
}

impl DnsClient {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: DEFAULT_BASE.to_string(),
            token: token.into(),
        }
    }

    #[cfg(test)]
    pub fn with_base_url(token: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base_url: base_url.into(),
            token: token.into(),
        }
    }

    /// Strips subdomain labels right-to-left until a registered zone matches.
    pub async fn zone_id(&self, fqdn: &str) -> Result<String, CoreError> {
        let labels: Vec<&str> = fqdn.trim_end_matches('.').split('.').collect();
        for start in 0..labels.len().saturating_sub(1) {
            let candidate = labels[start..].join(".");
            let url = format!(
                "{}/zones?name={}&status=active",
                self.base_url,
                urlencoding::encode(&candidate)
            );
            let envelope: ApiEnvelope<Vec<Zone>> = self.get(&url).await?;
            if let Some(zones) = envelope.result {
                if let Some(zone) = zones.into_iter().find(|z| z.name == candidate) {
                    debug!(fqdn, zone = %zone.name, "resolved zone");
                    return Ok(zone.id);
                }
            }
        }
        Err(not_found(Phase::Dns, ErrorKind::DnsZoneNotFound, fqdn))
    }

    pub async fn list_records(&self, zone_id: &str, name: Option<&str>) -> Result<Vec<DnsRecord>, CoreError> {
        let mut url = format!("{}/zones/{zone_id}/dns_records", self.base_url);
        if let Some(name) = name {
            url.push_str(&format!("?name={}", urlencoding::encode(name)));
        }
        let envelope: ApiEnvelope<Vec<WireRecord>> = self.get(&url).await?;
        self.check_envelope(&envelope, Phase::Dns)?;
        Ok(envelope
            .result
            .unwrap_or_default()
            .into_iter()
            .map(|r| to_domain(r, zone_id))
            .collect())
    }

    pub async fn create_record(&self, zone_id: &str, record: NewRecord<'_>) -> Result<DnsRecord, CoreError> {
        let url = format!("{}/zones/{zone_id}/dns_records", self.base_url);
        let body = CreateRecordBody {
            record_type: "CNAME",
            name: record.name,
            content: record.content,
            ttl: record.ttl,
            proxied: record.proxied,
            comment: record.comment,
        };
        let envelope: ApiEnvelope<WireRecord> = self.post(&url, &body).await?;
        self.check_envelope(&envelope, Phase::Dns)?;
        envelope
            .result
            .map(|r| to_domain(r, zone_id))
            .ok_or_else(|| not_found(Phase::Dns, ErrorKind::Unknown, "no result in create response"))
    }

    pub async fn update_record(
        &self,
        zone_id: &str,
        record_id: &str,
        content: &str,
        ttl: Option<u32>,
        proxied: bool,
    ) -> Result<DnsRecord, CoreError> {
        let url = format!("{}/zones/{zone_id}/dns_records/{record_id}", self.base_url);
        let body = UpdateRecordBody {
            record_type: Some("CNAME"),
            name: None,
            content: Some(content),
            ttl: Some(ttl.unwrap_or(300)),
            proxied: Some(proxied),
        };
        let envelope: ApiEnvelope<WireRecord> = self.put(&url, &body).await?;
        self.check_envelope(&envelope, Phase::Dns)?;
        envelope
            .result
            .map(|r| to_domain(r, zone_id))
            .ok_or_else(|| not_found(Phase::Dns, ErrorKind::Unknown, "no result in update response"))
    }

    /// L4: a 404 on delete is swallowed — idempotent cleanup.
    pub async fn delete_record(&self, zone_id: &str, record_id: &str) -> Result<(), CoreError> {
        let url = format!("{}/zones/{zone_id}/dns_records/{record_id}", self.base_url);
        let resp = self
            .http
            .delete(&url)
            .bearer_auth(&self.token)
            .timeout(TIMEOUT)
            .send()
            .await
            .map_err(|e| network_error(Phase::Dns, &e))?;

        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            debug!(record_id, "delete target already gone, treating as success");
            return Ok(());
        }
        let envelope: ApiEnvelope<serde_json::Value> = resp
            .json()
            .await
            .map_err(|e| network_error(Phase::Dns, &e))?;
        self.check_envelope(&envelope, Phase::Dns)?;
        Ok(())
    }

    async fn get<T: for<'de> Deserialize<'de>>(&self, url: &str) -> Result<T, CoreError> {
        let resp = self
            .http
            .get(url)
            .bearer_auth(&self.token)
            .timeout(TIMEOUT)
            .send()
            .await
            .map_err(|e| network_error(Phase::Dns, &e))?;
        self.respect_rate_limit(&resp);
        resp.json().await.map_err(|e| network_error(Phase::Dns, &e))
    }

    async fn post<B: Serialize, T: for<'de> Deserialize<'de>>(&self, url: &str, body: &B) -> Result<T, CoreError> {
        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.token)
            .timeout(TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| network_error(Phase::Dns, &e))?;
        self.respect_rate_limit(&resp);
        resp.json().await.map_err(|e| network_error(Phase::Dns, &e))
    }

    async fn put<B: Serialize, T: for<'de> Deserialize<'de>>(&self, url: &str, body: &B) -> Result<T, CoreError> {
        let resp = self
            .http
            .put(url)
            .bearer_auth(&self.token)
            .timeout(TIMEOUT)
            .json(body)
            .send()
            .await
            .map_err(|e| network_error(Phase::Dns, &e))?;
        self.respect_rate_limit(&resp);
        resp.json().await.map_err(|e| network_error(Phase::Dns, &e))
    }

    fn respect_rate_limit(&self, resp: &reqwest::Response) {
        if let Some(retry_after) = resp.headers().get("retry-after") {
            if let Ok(s) = retry_after.to_str() {
                warn!(retry_after = s, "provider requested a rate-limit backoff");
            }
        }
    }

    fn check_envelope<T>(&self, envelope: &ApiEnvelope<T>, phase: Phase) -> Result<(), CoreError> {
        if envelope.success {
            return Ok(());
        }
        let message = envelope
            .errors
            .iter()
            .map(|e| e.message.as_str())
            .collect::<Vec<_>>()
            .join("; ");
        let classified = classifier::classify(&message, &ClassifyContext::default());
        Err(CoreError::from_classified(phase, classified))
    }
}

pub struct NewRecord<'a> {
    pub name: &'a str,
    pub content: &'a str,
    pub ttl: u32,
    pub proxied: bool,
    pub comment: Option<&'a str>,
}

fn to_domain(wire: WireRecord, zone_id: &str) -> DnsRecord {
    let record_type = match wire.record_type.as_str() {
        "A" => DnsRecordType::A,
        "AAAA" => DnsRecordType::AAAA,
        _ => DnsRecordType::CNAME,
    };
    DnsRecord {
        id: wire.id,
        zone_id: zone_id.to_string(),
        record_type,
        name: wire.name,
        content: wire.content,
        ttl: wire.ttl,
        proxied: wire.proxied,
    }
}

fn not_found(phase: Phase, kind: ErrorKind, detail: &str) -> CoreError {
    CoreError::from_classified(
        phase,
        ClassifiedError {
            kind,
            severity: crate::error::Severity::Error,
            recommended_action: crate::error::RecommendedAction::Manual,
            raw: detail.to_string(),
        },
    )
}

fn network_error(phase: Phase, e: &reqwest::Error) -> CoreError {
    let kind = if e.is_timeout() {
        ErrorKind::NetworkTimeout
    } else {
        ErrorKind::NetworkConnectionFailed
    };
    CoreError::from_classified(
        phase,
        ClassifiedError {
            kind,
            severity: crate::error::Severity::Warning,
            recommended_action: crate::error::RecommendedAction::Retry,
            raw: e.to_string(),
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> DnsClient {
        DnsClient::with_base_url("tok", server.uri())
    }

    #[tokio::test]
    async fn zone_id_strips_labels_right_to_left() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/zones"))
            .and(query_param("name", "example.com"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "errors": [],
                "result": [{"id": "zone1", "name": "example.com"}],
            })))
            .mount(&server)
            .await;

        let zid = client(&server).zone_id("app.example.com").await.unwrap();
        assert_eq!(zid, "zone1");
    }

    #[tokio::test]
    async fn zone_id_not_found_yields_dns_zone_not_found() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "errors": [],
                "result": [],
            })))
            .mount(&server)
            .await;

        let err = client(&server).zone_id("app.example.com").await.unwrap_err();
        assert_eq!(err.kind, ErrorKind::DnsZoneNotFound);
    }

    #[tokio::test]
    async fn delete_swallows_404() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        client(&server).delete_record("zone1", "rec1").await.unwrap();
    }

    #[tokio::test]
    async fn create_record_parses_result() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": true,
                "errors": [],
                "result": {
                    "id": "rec1",
                    "type": "CNAME",
                    "name": "app.example.com",
                    "content": "abc.cfargotunnel.com",
                    "ttl": 300,
                    "proxied": false,
                },
            })))
            .mount(&server)
            .await;

        let rec = client(&server)
            .create_record(
                "zone1",
                NewRecord {
                    name: "app.example.com",
                    content: "abc.cfargotunnel.com",
                    ttl: 300,
                    proxied: false,
                    comment: Some("created by tunnelctl"),
                },
            )
            .await
            .unwrap();
        assert!(rec.routes_tunnel("abc"));
    }

    #[tokio::test]
    async fn failed_envelope_is_classified() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "success": false,
                "errors": [{"code": 81053, "message": "An A, AAAA, or CNAME record with that host already exists."}],
                "result": null,
            })))
            .mount(&server)
            .await;

        let err = client(&server)
            .create_record(
                "zone1",
                NewRecord {
                    name: "app.example.com",
                    content: "abc.cfargotunnel.com",
                    ttl: 300,
                    proxied: false,
                    comment: None,
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::DnsRecordExists);
    }
}
