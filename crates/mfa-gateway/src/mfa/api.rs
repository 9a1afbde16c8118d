//! MFA API client
//!
//! Two endpoints are used, both `POST` with HTTP Basic authentication using
//! the client's API key and secret:
//!
//! - `{api_url}/access/requests/ra` starts a second-factor request
//! - `{api_url}/access/requests/ra/challenge` submits the user's answer

use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum MfaApiError {
    /// Connection failure or timeout
    #[error("MFA API unreachable: {0}")]
    Unreachable(String),
    #[error("MFA API returned HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Invalid MFA API response: {0}")]
    InvalidResponse(String),
    #[error("MFA API client error: {0}")]
    Client(String),
}

impl MfaApiError {
    pub fn is_unreachable(&self) -> bool {
        matches!(self, MfaApiError::Unreachable(_))
    }
}

/// Basic-auth credentials of one NAS client
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub key: String,
    pub secret: String,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct Capabilities {
    pub inline_enroll: bool,
}

#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct GroupPolicyPreset {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sign_up_groups: Option<String>,
}

/// Body of a new second-factor request
#[derive(Debug, Clone, Default, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AccessRequest {
    pub identity: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub calling_station_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub called_station_id: Option<String>,
    pub capabilities: Capabilities,
    pub group_policy_preset: GroupPolicyPreset,
}

/// Body of a challenge answer
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct ChallengeRequest {
    pub identity: String,
    pub challenge: String,
    pub request_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub enum RequestStatus {
    Granted,
    Denied,
    AwaitingAuthentication,
}

/// Response to either request
#[derive(Debug, Clone, Deserialize, PartialEq)]
#[serde(rename_all = "PascalCase")]
pub struct AccessRequestResponse {
    pub status: RequestStatus,
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub reply_message: Option<String>,
    #[serde(default)]
    pub bypassed: bool,
    #[serde(default)]
    pub authenticator: Option<String>,
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub country_code: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub city: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub authenticator_id: Option<String>,
}

impl AccessRequestResponse {
    pub fn with_status(status: RequestStatus) -> Self {
        AccessRequestResponse {
            status,
            id: None,
            reply_message: None,
            bypassed: false,
            authenticator: None,
            account: None,
            country_code: None,
            region: None,
            city: None,
            phone: None,
            authenticator_id: None,
        }
    }
}

/// MFA API collaborator
#[async_trait]
pub trait MultifactorApi: Send + Sync {
    async fn create_access_request(
        &self,
        credentials: &ApiCredentials,
        request: &AccessRequest,
    ) -> Result<AccessRequestResponse, MfaApiError>;

    async fn challenge(
        &self,
        credentials: &ApiCredentials,
        request: &ChallengeRequest,
    ) -> Result<AccessRequestResponse, MfaApiError>;
}

/// `reqwest`-backed API client
#[derive(Debug, Clone)]
pub struct HttpMultifactorApi {
    client: Client,
    base_url: String,
}

impl HttpMultifactorApi {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, MfaApiError> {
        let client = Client::builder()
            .timeout(timeout)
            .user_agent(concat!("mfa-radius-gateway/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| MfaApiError::Client(e.to_string()))?;

        Ok(HttpMultifactorApi {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn post<B: Serialize + Sync>(
        &self,
        path: &str,
        credentials: &ApiCredentials,
        body: &B,
    ) -> Result<AccessRequestResponse, MfaApiError> {
        let url = format!("{}{}", self.base_url, path);
        debug!(url = %url, "Calling MFA API");

        let response = self
            .client
            .post(&url)
            .basic_auth(&credentials.key, Some(&credentials.secret))
            .json(body)
            .send()
            .await
            .map_err(classify_transport_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(url = %url, status = status.as_u16(), "MFA API request failed");
            return Err(classify_status(status, body));
        }

        response
            .json::<AccessRequestResponse>()
            .await
            .map_err(|e| MfaApiError::InvalidResponse(e.to_string()))
    }
}

fn classify_transport_error(error: reqwest::Error) -> MfaApiError {
    if error.is_timeout() || error.is_connect() {
        MfaApiError::Unreachable(error.to_string())
    } else {
        MfaApiError::Client(error.to_string())
    }
}

/// Gateway errors in front of the API count as unreachable
fn classify_status(status: StatusCode, body: String) -> MfaApiError {
    match status {
        StatusCode::BAD_GATEWAY | StatusCode::SERVICE_UNAVAILABLE | StatusCode::GATEWAY_TIMEOUT => {
            MfaApiError::Unreachable(format!("HTTP {}", status.as_u16()))
        }
        _ => MfaApiError::Http {
            status: status.as_u16(),
            body,
        },
    }
}

#[async_trait]
impl MultifactorApi for HttpMultifactorApi {
    async fn create_access_request(
        &self,
        credentials: &ApiCredentials,
        request: &AccessRequest,
    ) -> Result<AccessRequestResponse, MfaApiError> {
        self.post("/access/requests/ra", credentials, request).await
    }

    async fn challenge(
        &self,
        credentials: &ApiCredentials,
        request: &ChallengeRequest,
    ) -> Result<AccessRequestResponse, MfaApiError> {
        self.post("/access/requests/ra/challenge", credentials, request).await
    }
}
