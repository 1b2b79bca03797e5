//! JSON-over-HTTP remote authority client.

use async_trait::async_trait;
use fieldsync_core::models::{EntitySnapshot, EntityType, QueuedOperation};
use fieldsync_core::util::{compact_text, is_http_url, normalize_text_option};
use fieldsync_core::{ApplyResponse, ApplyStatus, ChangeBatch, RemoteApply};
use reqwest::StatusCode;
use serde::Deserialize;

use crate::error::CliError;

const IDEMPOTENCY_HEADER: &str = "Idempotency-Key";

#[derive(Clone)]
pub struct HttpRemote {
    base_url: String,
    auth_token: Option<String>,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpRemote {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpRemote")
            .field("base_url", &self.base_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "[REDACTED]"))
            .finish_non_exhaustive()
    }
}

impl HttpRemote {
    pub fn new(base_url: impl Into<String>, auth_token: Option<String>) -> Result<Self, CliError> {
        Ok(Self {
            base_url: normalize_base_url(base_url.into())?,
            auth_token: normalize_text_option(auth_token),
            client: reqwest::Client::builder().build()?,
        })
    }

    fn operations_url(&self) -> String {
        format!("{}/v1/operations", self.base_url)
    }

    fn changes_url(&self) -> String {
        format!("{}/v1/changes", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }
}

#[derive(Debug, Deserialize)]
struct SnapshotBody {
    #[serde(alias = "snapshot")]
    server_snapshot: Option<EntitySnapshot>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

#[async_trait]
impl RemoteApply for HttpRemote {
    async fn apply_operation(
        &self,
        operation: &QueuedOperation,
    ) -> fieldsync_core::Result<ApplyResponse> {
        let response = self
            .authorize(self.client.post(self.operations_url()))
            .header(IDEMPOTENCY_HEADER, operation.request_key())
            .header("Accept", "application/json")
            .json(operation)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        let body = response.text().await.map_err(network_error)?;
        Ok(interpret_apply_response(status, &body))
    }

    async fn fetch_changes_since(
        &self,
        since: Option<i64>,
        entity_types: &[EntityType],
    ) -> fieldsync_core::Result<ChangeBatch> {
        let types = entity_types
            .iter()
            .map(|entity_type| entity_type.as_str())
            .collect::<Vec<_>>()
            .join(",");
        let mut query = vec![("types", types)];
        if let Some(since) = since {
            query.push(("since", since.to_string()));
        }

        let response = self
            .authorize(self.client.get(self.changes_url()))
            .header("Accept", "application/json")
            .query(&query)
            .send()
            .await
            .map_err(network_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(fieldsync_core::Error::Network(parse_api_error(status, &body)));
        }
        response
            .json::<ChangeBatch>()
            .await
            .map_err(network_error)
    }
}

fn network_error(error: reqwest::Error) -> fieldsync_core::Error {
    fieldsync_core::Error::Network(error.to_string())
}

/// Map an HTTP answer onto the apply contract.
fn interpret_apply_response(status: StatusCode, body: &str) -> ApplyResponse {
    let snapshot = || {
        serde_json::from_str::<SnapshotBody>(body)
            .ok()
            .and_then(|body| body.server_snapshot)
    };

    match status.as_u16() {
        200..=299 => ApplyResponse::success(snapshot()),
        409 => snapshot().map_or_else(
            || ApplyResponse {
                status: ApplyStatus::Conflict,
                server_snapshot: None,
                error: Some(parse_api_error(status, body)),
            },
            ApplyResponse::conflict,
        ),
        408 | 429 | 500..=599 => ApplyResponse::retryable(parse_api_error(status, body)),
        _ => ApplyResponse::fatal(parse_api_error(status, body)),
    }
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn normalize_base_url(raw: String) -> Result<String, CliError> {
    let url = normalize_text_option(Some(raw))
        .ok_or_else(|| CliError::Config("remote_url must not be empty".to_string()))?;
    if is_http_url(&url) {
        Ok(url.trim_end_matches('/').to_string())
    } else {
        Err(CliError::Config(
            "remote_url must include http:// or https://".to_string(),
        ))
    }
}
