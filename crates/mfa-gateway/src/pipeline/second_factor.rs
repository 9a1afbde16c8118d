use super::PipelineStep;
use crate::challenge::{ChallengeRegistry, ChallengeType};
use crate::config::FirstFactorSource;
use crate::context::{AuthenticationStatus, ExecutionContext};
use crate::error::GatewayError;
use crate::mfa::SecondFactorGateway;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{info, warn};

/// Requests the second factor and parks the context while the user answers
pub struct SecondFactorStep {
    gateway: Arc<SecondFactorGateway>,
    registry: Arc<ChallengeRegistry>,
}

impl SecondFactorStep {
    pub fn new(gateway: Arc<SecondFactorGateway>, registry: Arc<ChallengeRegistry>) -> Self {
        SecondFactorStep { gateway, registry }
    }

    fn park(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        let processor = self
            .registry
            .processor_of(ChallengeType::SecondFactor)
            .ok_or_else(|| GatewayError::Challenge("no second-factor challenge processor".to_string()))?;

        let id = processor.add_challenge_context(ctx);
        if id.is_empty() {
            // Retransmission of a request whose exchange is already registered
            warn!(client = %ctx.client_name(), "Second-factor challenge not registered");
        }
        ctx.terminate();
        Ok(())
    }
}

#[async_trait]
impl PipelineStep for SecondFactorStep {
    fn name(&self) -> &'static str {
        "second-factor"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        if ctx.authentication_state.second_factor().is_resolved() {
            return Ok(());
        }

        if ctx.is_acl_request() && ctx.client.first_factor_source == FirstFactorSource::Radius {
            info!(client = %ctx.client_name(), user = ctx.user_name().unwrap_or("-"), "ACL download, second factor bypassed");
            ctx.authentication_state
                .set_second_factor(AuthenticationStatus::Bypass);
            return Ok(());
        }

        let status = self.gateway.create_second_factor_request(ctx).await;
        match status {
            AuthenticationStatus::Accept | AuthenticationStatus::Bypass => {
                ctx.authentication_state.set_second_factor(status);
                Ok(())
            }
            AuthenticationStatus::Awaiting => self.park(ctx),
            AuthenticationStatus::Reject => {
                ctx.reject(None);
                Ok(())
            }
        }
    }
}
