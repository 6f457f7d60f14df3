//! reqwest implementation of [`RoundApi`].

use async_trait::async_trait;
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use patrol_types::{RoundId, Timestamp, TokenProvider};

use crate::api::{CheckpointSubmission, Envelope, RoundApi, RoundDetail};
use crate::ApiError;

/// Default timeout for round API requests.
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(30);

/// Default connection timeout.
const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Client for the round endpoints of the patrol backend.
pub struct HttpRoundApi {
    base_url: String,
    token: TokenProvider,
    http_client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct EndRequest<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    notes: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    message: Option<String>,
}

impl HttpRoundApi {
    pub fn new(base_url: impl Into<String>, token: TokenProvider) -> Self {
        Self::with_timeout(base_url, token, DEFAULT_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        token: TokenProvider,
        timeout: Duration,
    ) -> Self {
        let http_client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            http_client,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match (self.token)() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn send<T: DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<Envelope<T>, ApiError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(map_transport_error)?;
        let response = check_status(response).await?;
        response
            .json::<Envelope<T>>()
            .await
            .map_err(|e| ApiError::InvalidResponse(format!("failed to parse envelope: {e}")))
    }
}

fn map_transport_error(e: reqwest::Error) -> ApiError {
    if e.is_timeout() {
        ApiError::Timeout
    } else if e.is_connect() {
        ApiError::NetworkUnavailable(format!("connection failed: {e}"))
    } else {
        ApiError::NetworkUnavailable(e.to_string())
    }
}

async fn check_status(response: Response) -> Result<Response, ApiError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    if status == StatusCode::UNAUTHORIZED {
        return Err(ApiError::Unauthorized);
    }
    if status.is_client_error() {
        let body = response.text().await.unwrap_or_default();
        return Err(ApiError::Rejected {
            status: status.as_u16(),
            message: rejection_message(status, &body),
        });
    }
    Err(ApiError::Http {
        status: status.as_u16(),
    })
}

/// The server's `{message}` if present, otherwise the status reason.
fn rejection_message(status: StatusCode, body: &str) -> String {
    serde_json::from_str::<ErrorBody>(body)
        .ok()
        .and_then(|b| b.message)
        .unwrap_or_else(|| {
            status
                .canonical_reason()
                .unwrap_or("rejected")
                .to_string()
        })
}

#[async_trait]
impl RoundApi for HttpRoundApi {
    async fn start_round(&self, round: RoundId) -> Result<Envelope<RoundDetail>, ApiError> {
        debug!(round = %round, "POST start");
        let url = self.url(&format!("/rounds/{round}/start"));
        self.send(self.http_client.post(url)).await
    }

    async fn end_round(
        &self,
        round: RoundId,
        notes: Option<&str>,
    ) -> Result<Envelope<RoundDetail>, ApiError> {
        debug!(round = %round, "POST end");
        let url = self.url(&format!("/rounds/{round}/end"));
        self.send(self.http_client.post(url).json(&EndRequest { notes }))
            .await
    }

    async fn submit_checkpoint(
        &self,
        round: RoundId,
        submission: &CheckpointSubmission,
    ) -> Result<Timestamp, ApiError> {
        debug!(
            round = %round,
            checkpoint = %submission.checkpoint,
            method = %submission.method,
            "POST checkpoint"
        );
        let url = self.url(&format!(
            "/rounds/{round}/checkpoints/{}",
            submission.checkpoint
        ));
        let envelope: Envelope<serde_json::Value> =
            self.send(self.http_client.post(url).json(submission)).await?;
        Ok(envelope.timestamp)
    }

    async fn fetch_round(&self, round: RoundId) -> Result<Envelope<RoundDetail>, ApiError> {
        let url = self.url(&format!("/rounds/{round}"));
        self.send(self.http_client.get(url)).await
    }
}
