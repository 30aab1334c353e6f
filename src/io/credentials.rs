//! Temporary S3 credentials for direct granule access

use crate::types::{DispError, DispResult};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// Region the OPERA archive bucket lives in
pub const ARCHIVE_REGION: &str = "us-west-2";

/// Environment variable holding an optional Earthdata Login bearer token
pub const EDL_TOKEN_ENV: &str = "EARTHDATA_TOKEN";

/// Temporary AWS credentials as returned by the archive's credential endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TemporaryCredentials {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub session_token: String,
    #[serde(default)]
    pub expiration: Option<String>,
}

impl TemporaryCredentials {
    /// Shell lines exporting these credentials
    pub fn export_lines(&self) -> Vec<String> {
        vec![
            format!("export AWS_ACCESS_KEY_ID={}", self.access_key_id),
            format!("export AWS_SECRET_ACCESS_KEY={}", self.secret_access_key),
            format!("export AWS_SESSION_TOKEN={}", self.session_token),
        ]
    }

    /// Make the credentials visible to GDAL's /vsis3/ handler
    pub fn apply_to_gdal(&self) -> DispResult<()> {
        gdal::config::set_config_option("AWS_ACCESS_KEY_ID", &self.access_key_id)?;
        gdal::config::set_config_option("AWS_SECRET_ACCESS_KEY", &self.secret_access_key)?;
        gdal::config::set_config_option("AWS_SESSION_TOKEN", &self.session_token)?;
        gdal::config::set_config_option("AWS_REGION", ARCHIVE_REGION)?;
        Ok(())
    }
}

/// Source of S3 credentials, swappable in tests
pub trait CredentialProvider: Send + Sync {
    fn credentials(&self) -> DispResult<TemporaryCredentials>;
}

/// Whether credentials fetched at `fetched_at` may still be used at `now`
pub fn is_fresh(fetched_at: DateTime<Utc>, now: DateTime<Utc>, ttl: Duration) -> bool {
    now >= fetched_at && now - fetched_at < ttl
}

/// Fetches credentials over HTTP and caches them for a fixed TTL
///
/// The TTL is shorter than the credentials' real lifetime so a long tile build
/// never hands GDAL keys that are about to expire.
pub struct TemporaryCredentialProvider {
    client: reqwest::blocking::Client,
    endpoint: String,
    ttl: Duration,
    bearer_token: Option<String>,
    cache: Mutex<Option<(DateTime<Utc>, TemporaryCredentials)>>,
}

impl TemporaryCredentialProvider {
    pub fn new(endpoint: impl Into<String>, ttl_secs: i64) -> DispResult<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .user_agent(concat!("opera_disp_tms/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            ttl: Duration::seconds(ttl_secs),
            bearer_token: std::env::var(EDL_TOKEN_ENV).ok().filter(|t| !t.is_empty()),
            cache: Mutex::new(None),
        })
    }

    fn fetch(&self) -> DispResult<TemporaryCredentials> {
        log::info!("Requesting temporary S3 credentials from {}", self.endpoint);
        let mut request = self.client.get(&self.endpoint);
        if let Some(token) = &self.bearer_token {
            request = request.bearer_auth(token);
        }
        let response = request.send()?;
        if !response.status().is_success() {
            return Err(DispError::Credentials(format!(
                "HTTP {} from {}",
                response.status().as_u16(),
                self.endpoint
            )));
        }
        Ok(response.json()?)
    }
}

impl CredentialProvider for TemporaryCredentialProvider {
    fn credentials(&self) -> DispResult<TemporaryCredentials> {
        let mut cache = self
            .cache
            .lock()
            .map_err(|_| DispError::Credentials("Credential cache lock poisoned".to_string()))?;

        let now = Utc::now();
        if let Some((fetched_at, credentials)) = cache.as_ref() {
            if is_fresh(*fetched_at, now, self.ttl) {
                return Ok(credentials.clone());
            }
            log::debug!("Cached credentials from {} expired", fetched_at);
        }

        let credentials = self.fetch()?;
        *cache = Some((now, credentials.clone()));
        Ok(credentials)
    }
}

/// Fixed credentials, e.g. from the environment
#[derive(Debug, Clone)]
pub struct StaticCredentialProvider(pub TemporaryCredentials);

impl StaticCredentialProvider {
    /// Read `AWS_ACCESS_KEY_ID`, `AWS_SECRET_ACCESS_KEY` and `AWS_SESSION_TOKEN`
    pub fn from_env() -> Option<Self> {
        let access_key_id = std::env::var("AWS_ACCESS_KEY_ID").ok()?;
        let secret_access_key = std::env::var("AWS_SECRET_ACCESS_KEY").ok()?;
        let session_token = std::env::var("AWS_SESSION_TOKEN").unwrap_or_default();
        Some(Self(TemporaryCredentials { access_key_id, secret_access_key, session_token, expiration: None }))
    }
}

impl CredentialProvider for StaticCredentialProvider {
    fn credentials(&self) -> DispResult<TemporaryCredentials> {
        Ok(self.0.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_is_fresh() {
        let fetched = Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap();
        let ttl = Duration::minutes(50);
        assert!(is_fresh(fetched, fetched + Duration::minutes(49), ttl));
        assert!(!is_fresh(fetched, fetched + Duration::minutes(50), ttl));
        assert!(!is_fresh(fetched, fetched - Duration::minutes(1), ttl));
    }

    #[test]
    fn test_parse_and_export() {
        let body = r#"{"accessKeyId": "AKID", "secretAccessKey": "SECRET",
                       "sessionToken": "TOKEN", "expiration": "2024-11-20 18:51:52+00:00"}"#;
        let credentials: TemporaryCredentials = serde_json::from_str(body).unwrap();
        assert_eq!(
            credentials.export_lines(),
            vec![
                "export AWS_ACCESS_KEY_ID=AKID".to_string(),
                "export AWS_SECRET_ACCESS_KEY=SECRET".to_string(),
                "export AWS_SESSION_TOKEN=TOKEN".to_string(),
            ]
        );

        let provider = StaticCredentialProvider(credentials.clone());
        assert_eq!(provider.credentials().unwrap(), credentials);
    }
}
