//! Second-factor orchestration on top of the MFA API

use super::api::{
    AccessRequest, AccessRequestResponse, ApiCredentials, Capabilities, ChallengeRequest, GroupPolicyPreset,
    MfaApiError, MultifactorApi, RequestStatus,
};
use super::cache::AuthenticatedClientCache;
use super::privacy::PrivacyField;
use crate::config::{FirstFactorSource, PreAuthenticationMethod};
use crate::context::{AuthenticationStatus, ExecutionContext};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Issues and continues second-factor requests
pub struct SecondFactorGateway {
    api: Arc<dyn MultifactorApi>,
    cache: Arc<AuthenticatedClientCache>,
    api_timeout: Duration,
}

impl SecondFactorGateway {
    pub fn new(api: Arc<dyn MultifactorApi>, cache: Arc<AuthenticatedClientCache>, api_timeout: Duration) -> Self {
        SecondFactorGateway {
            api,
            cache,
            api_timeout,
        }
    }

    pub fn cache(&self) -> &AuthenticatedClientCache {
        &self.cache
    }

    /// Start a second-factor request for the context's user
    ///
    /// `Awaiting` leaves the MFA request id in `response_information.state`.
    pub async fn create_second_factor_request(&self, ctx: &mut ExecutionContext) -> AuthenticationStatus {
        let Some(identity) = ctx.second_factor_identity() else {
            warn!(client = %ctx.client_name(), "Empty second-factor identity, rejecting");
            ctx.response_information.reply_message = Some("Unable to determine user identity".to_string());
            return AuthenticationStatus::Reject;
        };

        let calling_station_id = ctx.calling_station_id();
        if self.cache.try_hit(calling_station_id.as_deref(), &identity, &ctx.client) {
            info!(client = %ctx.client_name(), identity = %identity, "Second factor bypassed by authentication cache");
            return AuthenticationStatus::Bypass;
        }

        let request = self.build_access_request(ctx, identity.clone(), calling_station_id.clone());
        let credentials = credentials(ctx);

        debug!(client = %ctx.client_name(), identity = %identity, "Creating second-factor request");
        let result = self
            .call(self.api.create_access_request(&credentials, &request))
            .await;

        self.handle_result(ctx, &identity, calling_station_id.as_deref(), result)
    }

    /// Submit the user's answer to a pending request
    pub async fn send_challenge(
        &self,
        ctx: &mut ExecutionContext,
        answer: &str,
        request_id: &str,
    ) -> AuthenticationStatus {
        let Some(identity) = ctx.second_factor_identity() else {
            warn!(client = %ctx.client_name(), "Empty second-factor identity, rejecting");
            return AuthenticationStatus::Reject;
        };

        let request = ChallengeRequest {
            identity: identity.clone(),
            challenge: answer.to_string(),
            request_id: request_id.to_string(),
        };
        let credentials = credentials(ctx);

        debug!(client = %ctx.client_name(), identity = %identity, request_id, "Sending challenge answer");
        let result = self.call(self.api.challenge(&credentials, &request)).await;

        ctx.response_information.state = Some(request_id.to_string());
        let calling_station_id = ctx.calling_station_id();
        self.handle_result(ctx, &identity, calling_station_id.as_deref(), result)
    }

    async fn call<F>(&self, future: F) -> Result<AccessRequestResponse, MfaApiError>
    where
        F: std::future::Future<Output = Result<AccessRequestResponse, MfaApiError>>,
    {
        match tokio::time::timeout(self.api_timeout, future).await {
            Ok(result) => result,
            Err(_) => Err(MfaApiError::Unreachable(format!(
                "no response within {}s",
                self.api_timeout.as_secs()
            ))),
        }
    }

    fn build_access_request(
        &self,
        ctx: &ExecutionContext,
        identity: String,
        calling_station_id: Option<String>,
    ) -> AccessRequest {
        let privacy = &ctx.client.privacy_mode;
        let profile = ctx.profile.as_ref();

        AccessRequest {
            identity,
            name: privacy.filter(PrivacyField::Name, profile.and_then(|p| p.display_name.clone())),
            email: privacy.filter(PrivacyField::Email, profile.and_then(|p| p.email.clone())),
            phone: privacy.filter(PrivacyField::Phone, profile.and_then(|p| p.phone.clone())),
            pass_code: pass_code(ctx),
            calling_station_id: privacy.filter(PrivacyField::CallingStationId, calling_station_id),
            called_station_id: ctx.called_station_id(),
            capabilities: Capabilities { inline_enroll: true },
            group_policy_preset: GroupPolicyPreset {
                sign_up_groups: ctx.client.sign_up_groups.clone(),
            },
        }
    }

    fn handle_result(
        &self,
        ctx: &mut ExecutionContext,
        identity: &str,
        calling_station_id: Option<&str>,
        result: Result<AccessRequestResponse, MfaApiError>,
    ) -> AuthenticationStatus {
        let response = match result {
            Ok(response) => response,
            Err(e) if e.is_unreachable() => {
                if ctx.client.bypass_second_factor_when_api_unreachable {
                    warn!(client = %ctx.client_name(), identity, error = %e, "MFA API unreachable, bypassing second factor");
                    return AuthenticationStatus::Bypass;
                }
                warn!(client = %ctx.client_name(), identity, error = %e, "MFA API unreachable, rejecting");
                return AuthenticationStatus::Reject;
            }
            Err(e) => {
                warn!(client = %ctx.client_name(), identity, error = %e, "MFA API request failed, rejecting");
                return AuthenticationStatus::Reject;
            }
        };

        if let Some(message) = &response.reply_message {
            ctx.response_information.reply_message = Some(message.clone());
        }

        match response.status {
            RequestStatus::Granted if response.bypassed => {
                info!(client = %ctx.client_name(), identity, "Second factor bypassed by MFA API");
                AuthenticationStatus::Bypass
            }
            RequestStatus::Granted => {
                info!(
                    client = %ctx.client_name(),
                    identity,
                    authenticator = response.authenticator.as_deref().unwrap_or("-"),
                    "Second factor granted"
                );
                self.cache.set_cache(calling_station_id, identity, &ctx.client);
                AuthenticationStatus::Accept
            }
            RequestStatus::Denied => {
                info!(client = %ctx.client_name(), identity, "Second factor denied");
                AuthenticationStatus::Reject
            }
            RequestStatus::AwaitingAuthentication => {
                if let Some(id) = response.id.filter(|id| !id.is_empty()) {
                    ctx.response_information.state = Some(id);
                }
                match &ctx.response_information.state {
                    Some(id) => {
                        debug!(client = %ctx.client_name(), identity, request_id = %id, "Awaiting second factor");
                        AuthenticationStatus::Awaiting
                    }
                    None => {
                        warn!(client = %ctx.client_name(), identity, "MFA API awaits authentication without a request id");
                        AuthenticationStatus::Reject
                    }
                }
            }
        }
    }
}

fn credentials(ctx: &ExecutionContext) -> ApiCredentials {
    ApiCredentials {
        key: ctx.client.api_key.clone(),
        secret: ctx.client.api_secret.clone(),
    }
}

/// Code the user already supplied, in order of precedence
fn pass_code(ctx: &ExecutionContext) -> Option<String> {
    let passphrase = &ctx.passphrase;
    if let Some(response) = &passphrase.static_response {
        return Some(response.clone());
    }
    if ctx.client.pre_authentication_method == PreAuthenticationMethod::Otp {
        if let Some(otp) = &passphrase.otp {
            return Some(otp.clone());
        }
    }
    if ctx.client.first_factor_source == FirstFactorSource::None {
        if let Some(otp) = &passphrase.otp {
            return Some(otp.clone());
        }
        return passphrase.provider_code.map(|code| code.as_str().to_string());
    }
    None
}
