use super::PipelineStep;
use crate::config::PreAuthenticationMethod;
use crate::context::{AuthenticationStatus, AuthenticationType, ExecutionContext};
use crate::error::GatewayError;
use crate::mfa::SecondFactorGateway;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Checks an OTP appended to the password before the first factor
///
/// Only for clients configured with `pre_authentication_method: Otp`. The
/// code must be verified on the first request, so an exchange that asks for
/// more input is treated as a failure.
pub struct PreAuthenticationStep {
    second_factor: Arc<SecondFactorGateway>,
}

impl PreAuthenticationStep {
    pub fn new(second_factor: Arc<SecondFactorGateway>) -> Self {
        PreAuthenticationStep { second_factor }
    }
}

#[async_trait]
impl PipelineStep for PreAuthenticationStep {
    fn name(&self) -> &'static str {
        "pre-authentication"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        if ctx.client.pre_authentication_method != PreAuthenticationMethod::Otp
            || ctx.authentication_state.second_factor().is_resolved()
        {
            return Ok(());
        }

        if ctx.authentication_type() != AuthenticationType::Pap || ctx.passphrase.otp.is_none() {
            warn!(client = %ctx.client_name(), user = ctx.user_name().unwrap_or("-"), "Pre-authentication OTP missing");
            ctx.reject(None);
            return Ok(());
        }

        let status = self.second_factor.create_second_factor_request(ctx).await;
        match status {
            AuthenticationStatus::Accept | AuthenticationStatus::Bypass => {
                info!(client = %ctx.client_name(), user = ctx.user_name().unwrap_or("-"), %status, "Pre-authentication passed");
                ctx.authentication_state.set_second_factor(status);
            }
            AuthenticationStatus::Awaiting | AuthenticationStatus::Reject => {
                info!(client = %ctx.client_name(), user = ctx.user_name().unwrap_or("-"), %status, "Pre-authentication failed");
                ctx.response_information.state = None;
                ctx.reject(None);
            }
        }
        Ok(())
    }
}
