use super::PipelineStep;
use crate::context::ExecutionContext;
use crate::error::GatewayError;
use async_trait::async_trait;
use tracing::warn;

/// Rejects whatever reached the end of the pipeline without a decision
pub struct PostCheckStep;

#[async_trait]
impl PipelineStep for PostCheckStep {
    fn name(&self) -> &'static str {
        "post-check"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        let state = &ctx.authentication_state;
        if state.is_accepted() || state.is_rejected() || ctx.response_information.state.is_some() {
            return Ok(());
        }

        warn!(
            client = %ctx.client_name(),
            user = ctx.user_name().unwrap_or("-"),
            first_factor = %state.first_factor(),
            second_factor = %state.second_factor(),
            "Authentication unresolved, rejecting"
        );
        ctx.reject(None);
        Ok(())
    }
}
