//! HTTP client for the remote authority.

use std::time::Duration;

use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use super::remote::{AlertPage, PushOutcome, PushRequest, RemoteAuthority, Versioned};
use crate::error::{Error, Result};
use crate::models::{AlertRecord, QueuedMessage};
use crate::util::{compact_text, is_http_url, normalize_text_option};

/// `RemoteAuthority` over JSON/HTTP
#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    client: reqwest::Client,
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, request_timeout: Duration) -> Result<Self> {
        let base_url = normalize_endpoint(base_url.into())?;
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|error| Error::Config(format!("failed to build HTTP client: {error}")))?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Cheap reachability probe
    pub async fn health(&self) -> Result<()> {
        let response = self
            .client
            .get(format!("{}/healthz", self.base_url))
            .send()
            .await
            .map_err(transport_error)?;
        let status = response.status();
        if status.is_success() {
            Ok(())
        } else {
            let body = response.text().await.unwrap_or_default();
            Err(classify_failure(status, &body))
        }
    }

    async fn put<T>(&self, url: String, request: &PushRequest<T>) -> Result<PushOutcome<T>>
    where
        T: Serialize + DeserializeOwned + Sync,
    {
        let response = self
            .client
            .put(url)
            .header("Accept", "application/json")
            .json(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            let stored = response
                .json::<Versioned<T>>()
                .await
                .map_err(transport_error)?;
            return Ok(PushOutcome::Accepted(stored));
        }
        if status == StatusCode::CONFLICT {
            let current = response
                .json::<Versioned<T>>()
                .await
                .map_err(transport_error)?;
            return Ok(PushOutcome::Conflict(current));
        }

        let body = response.text().await.unwrap_or_default();
        Err(classify_failure(status, &body))
    }
}

impl RemoteAuthority for HttpRemote {
    async fn put_alert(
        &self,
        request: PushRequest<AlertRecord>,
    ) -> Result<PushOutcome<AlertRecord>> {
        let url = format!("{}/v1/alerts/{}", self.base_url, request.record.id);
        self.put(url, &request).await
    }

    async fn put_message(
        &self,
        request: PushRequest<QueuedMessage>,
    ) -> Result<PushOutcome<QueuedMessage>> {
        let url = format!("{}/v1/messages/{}", self.base_url, request.record.id);
        self.put(url, &request).await
    }

    async fn alerts_since(&self, cursor: Option<String>, limit: usize) -> Result<AlertPage> {
        let mut query = vec![("limit", limit.to_string())];
        if let Some(cursor) = cursor {
            query.push(("cursor", cursor));
        }

        let response = self
            .client
            .get(format!("{}/v1/alerts/since", self.base_url))
            .header("Accept", "application/json")
            .query(&query)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(classify_failure(status, &body));
        }
        response.json::<AlertPage>().await.map_err(transport_error)
    }
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

/// Map a non-success, non-conflict status onto the engine's error taxonomy
fn classify_failure(status: StatusCode, body: &str) -> Error {
    let message = parse_api_error(status, body);
    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        Error::NetworkUnavailable(message)
    } else {
        Error::RemoteRejected(message)
    }
}

fn transport_error(error: reqwest::Error) -> Error {
    Error::NetworkUnavailable(error.to_string())
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

pub(crate) fn normalize_endpoint(raw: String) -> Result<String> {
    let endpoint = normalize_text_option(Some(raw))
        .ok_or_else(|| Error::Config("remote URL must not be empty".to_string()))?;
    if is_http_url(&endpoint) {
        Ok(endpoint.trim_end_matches('/').to_string())
    } else {
        Err(Error::Config(
            "remote URL must include http:// or https://".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_endpoint_rejects_invalid_values() {
        assert!(normalize_endpoint(String::new()).is_err());
        assert!(normalize_endpoint("api.example.com".to_string()).is_err());
        assert_eq!(
            normalize_endpoint(" https://relay.example.org/ ".to_string()).unwrap(),
            "https://relay.example.org"
        );
    }

    #[test]
    fn parse_api_error_prefers_message_field() {
        let body = r#"{"message":"alert message cannot be empty","error":"bad_request"}"#;
        assert_eq!(
            parse_api_error(StatusCode::BAD_REQUEST, body),
            "alert message cannot be empty (400)"
        );
        assert_eq!(parse_api_error(StatusCode::BAD_GATEWAY, ""), "HTTP 502");
        assert_eq!(
            parse_api_error(StatusCode::FORBIDDEN, "nope"),
            "nope (403)"
        );
    }

    #[test]
    fn server_errors_are_retried_and_client_errors_are_not() {
        assert!(classify_failure(StatusCode::SERVICE_UNAVAILABLE, "").is_transient());
        assert!(classify_failure(StatusCode::TOO_MANY_REQUESTS, "").is_transient());
        assert!(classify_failure(StatusCode::REQUEST_TIMEOUT, "").is_transient());
        assert!(matches!(
            classify_failure(StatusCode::UNPROCESSABLE_ENTITY, "{\"error\":\"bad\"}"),
            Error::RemoteRejected(message) if message == "bad (422)"
        ));
    }

    #[test]
    fn new_rejects_missing_scheme() {
        assert!(matches!(
            HttpRemote::new("relay.local", Duration::from_secs(10)),
            Err(Error::Config(_))
        ));
        let remote = HttpRemote::new("http://127.0.0.1:8080/", Duration::from_secs(10)).unwrap();
        assert_eq!(remote.base_url(), "http://127.0.0.1:8080");
    }
}
