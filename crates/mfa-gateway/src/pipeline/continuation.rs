use super::PipelineStep;
use crate::challenge::{ChallengeIdentifier, ChallengeRegistry, ChallengeStatus, ChallengeType};
use crate::context::ExecutionContext;
use crate::error::GatewayError;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Routes a request carrying State back to the processor owning the exchange
///
/// State unknown to every processor is left alone; it may belong to an
/// upstream RADIUS server and is forwarded with the request.
pub struct ChallengeContinuationStep {
    registry: Arc<ChallengeRegistry>,
}

impl ChallengeContinuationStep {
    pub fn new(registry: Arc<ChallengeRegistry>) -> Self {
        ChallengeContinuationStep { registry }
    }
}

#[async_trait]
impl PipelineStep for ChallengeContinuationStep {
    fn name(&self) -> &'static str {
        "challenge-continuation"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        let Some(state) = ctx.request_state() else {
            return Ok(());
        };

        let id = ChallengeIdentifier::new(ctx.client_name(), state);
        let Some(processor) = self.registry.processor_for(&id) else {
            debug!(client = %ctx.client_name(), "State not owned by any challenge processor");
            return Ok(());
        };

        let status = processor.process_challenge(&id, ctx).await?;
        debug!(client = %ctx.client_name(), request_id = %id.request_id(), ?status, "Challenge processed");

        match (status, processor.challenge_type()) {
            // The first factor is settled, the rest of the pipeline still runs
            (ChallengeStatus::Accept, ChallengeType::PasswordChange) => {}
            _ => ctx.terminate(),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::ChallengeProcessor;
    use crate::context::tests::test_context;
    use crate::context::AuthenticationStatus;

    struct Fixed {
        challenge_type: ChallengeType,
        status: ChallengeStatus,
    }

    #[async_trait]
    impl ChallengeProcessor for Fixed {
        fn challenge_type(&self) -> ChallengeType {
            self.challenge_type
        }

        fn has_challenge_context(&self, id: &ChallengeIdentifier) -> bool {
            id.request_id() == "known"
        }

        fn add_challenge_context(&self, _ctx: &mut ExecutionContext) -> ChallengeIdentifier {
            ChallengeIdentifier::empty()
        }

        async fn process_challenge(
            &self,
            _id: &ChallengeIdentifier,
            ctx: &mut ExecutionContext,
        ) -> Result<ChallengeStatus, GatewayError> {
            if self.status == ChallengeStatus::Accept {
                ctx.authentication_state
                    .set_first_factor(AuthenticationStatus::Accept);
            }
            Ok(self.status)
        }
    }

    fn step(challenge_type: ChallengeType, status: ChallengeStatus) -> ChallengeContinuationStep {
        let processor: Arc<dyn ChallengeProcessor> = Arc::new(Fixed { challenge_type, status });
        ChallengeContinuationStep::new(Arc::new(ChallengeRegistry::new(vec![processor])))
    }

    fn with_state(state: &str) -> ExecutionContext {
        let mut ctx = test_context("alice", "123456");
        ctx.request.add_attribute("State", state.as_bytes().to_vec());
        ctx
    }

    #[tokio::test]
    async fn test_no_state_is_a_no_op() {
        let step = step(ChallengeType::SecondFactor, ChallengeStatus::Accept);
        let mut ctx = test_context("alice", "pw");
        step.execute(&mut ctx).await.unwrap();
        assert!(!ctx.execution_state.is_terminated());
        assert!(!ctx.authentication_state.first_factor().is_resolved());
    }

    #[tokio::test]
    async fn test_foreign_state_continues() {
        let step = step(ChallengeType::SecondFactor, ChallengeStatus::Accept);
        let mut ctx = with_state("upstream-state");
        step.execute(&mut ctx).await.unwrap();
        assert!(!ctx.execution_state.is_terminated());
    }

    #[tokio::test]
    async fn test_second_factor_outcome_terminates() {
        for status in [ChallengeStatus::Accept, ChallengeStatus::Reject, ChallengeStatus::InProcess] {
            let step = step(ChallengeType::SecondFactor, status);
            let mut ctx = with_state("known");
            step.execute(&mut ctx).await.unwrap();
            assert!(ctx.execution_state.is_terminated(), "{:?}", status);
        }
    }

    #[tokio::test]
    async fn test_password_change_accept_resumes_pipeline() {
        let step = step(ChallengeType::PasswordChange, ChallengeStatus::Accept);
        let mut ctx = with_state("known");
        step.execute(&mut ctx).await.unwrap();
        assert!(!ctx.execution_state.is_terminated());
        assert_eq!(ctx.authentication_state.first_factor(), AuthenticationStatus::Accept);
    }
}
