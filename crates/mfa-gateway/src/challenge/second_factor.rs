//! OTP / push answer for a pending second-factor request
//!
//! The State token is the MFA request id, so the NAS echoes back exactly
//! the id the API needs to continue the request.

use super::{challenge_answer, ChallengeIdentifier, ChallengeProcessor, ChallengeStatus, ChallengeStore, ChallengeType};
use crate::context::{AuthenticationStatus, ExecutionContext};
use crate::error::GatewayError;
use crate::mfa::SecondFactorGateway;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub struct SecondFactorChallengeProcessor {
    store: ChallengeStore<ExecutionContext>,
    gateway: Arc<SecondFactorGateway>,
}

impl SecondFactorChallengeProcessor {
    pub fn new(gateway: Arc<SecondFactorGateway>, ttl: Duration) -> Self {
        SecondFactorChallengeProcessor {
            store: ChallengeStore::new(ttl),
            gateway,
        }
    }

    #[cfg(test)]
    pub(crate) fn with_store(gateway: Arc<SecondFactorGateway>, store: ChallengeStore<ExecutionContext>) -> Self {
        SecondFactorChallengeProcessor { store, gateway }
    }

    pub fn pending(&self) -> usize {
        self.store.len()
    }
}

#[async_trait]
impl ChallengeProcessor for SecondFactorChallengeProcessor {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::SecondFactor
    }

    fn has_challenge_context(&self, id: &ChallengeIdentifier) -> bool {
        self.store.contains(id)
    }

    fn add_challenge_context(&self, ctx: &mut ExecutionContext) -> ChallengeIdentifier {
        let Some(request_id) = ctx.response_information.state.clone().filter(|id| !id.is_empty()) else {
            warn!(client = %ctx.client_name(), "Second-factor challenge without request id");
            return ChallengeIdentifier::empty();
        };

        let id = ChallengeIdentifier::new(ctx.client_name(), request_id);
        if !self.store.try_add(id.clone(), ctx.clone()) {
            warn!(client = %ctx.client_name(), request_id = %id.request_id(), "Challenge already registered");
            return ChallengeIdentifier::empty();
        }

        debug!(client = %ctx.client_name(), request_id = %id.request_id(), "Second-factor challenge registered");
        id
    }

    async fn process_challenge(
        &self,
        id: &ChallengeIdentifier,
        ctx: &mut ExecutionContext,
    ) -> Result<ChallengeStatus, GatewayError> {
        let Some(stored) = self.store.get(id) else {
            warn!(client = %ctx.client_name(), request_id = %id.request_id(), "Challenge expired");
            ctx.reject(None);
            return Ok(ChallengeStatus::Reject);
        };

        let Some(answer) = challenge_answer(ctx) else {
            warn!(
                client = %ctx.client_name(),
                request_id = %id.request_id(),
                authentication_type = ?ctx.authentication_type(),
                "Unsupported authentication type for challenge answer"
            );
            self.store.remove(id);
            ctx.reject(None);
            return Ok(ChallengeStatus::Reject);
        };

        // Identity and directory data come from the request that started the exchange
        ctx.user_name = stored.user_name.clone();
        ctx.profile = stored.profile.clone();

        let status = self.gateway.send_challenge(ctx, &answer, id.request_id()).await;
        match status {
            AuthenticationStatus::Accept | AuthenticationStatus::Bypass => {
                self.store.remove(id);
                ctx.authentication_state
                    .set_first_factor(stored.authentication_state.first_factor());
                ctx.authentication_state.set_second_factor(status);
                ctx.response_information.upstream_reply = stored.response_information.upstream_reply;
                info!(client = %ctx.client_name(), request_id = %id.request_id(), "Challenge accepted");
                Ok(ChallengeStatus::Accept)
            }
            AuthenticationStatus::Reject => {
                self.store.remove(id);
                ctx.reject(None);
                info!(client = %ctx.client_name(), request_id = %id.request_id(), "Challenge rejected");
                Ok(ChallengeStatus::Reject)
            }
            AuthenticationStatus::Awaiting => {
                ctx.response_information.state = Some(id.request_id().to_string());
                debug!(client = %ctx.client_name(), request_id = %id.request_id(), "Challenge still in process");
                Ok(ChallengeStatus::InProcess)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::tests::test_context;
    use crate::mfa::gateway::tests::{awaiting, ScriptedApi};
    use crate::mfa::{AccessRequestResponse, AuthenticatedClientCache, RequestStatus};

    fn processor(api: Arc<ScriptedApi>) -> SecondFactorChallengeProcessor {
        let gateway = SecondFactorGateway::new(
            api,
            Arc::new(AuthenticatedClientCache::new_no_background()),
            Duration::from_secs(5),
        );
        SecondFactorChallengeProcessor::with_store(
            Arc::new(gateway),
            ChallengeStore::new_no_background(Duration::from_secs(60)),
        )
    }

    fn parked_context(request_id: &str) -> ExecutionContext {
        let mut ctx = test_context("alice", "password");
        ctx.authentication_state.set_first_factor(AuthenticationStatus::Accept);
        ctx.response_information.state = Some(request_id.to_string());
        ctx
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_registration_of_same_request() {
        let processor = Arc::new(processor(Arc::new(ScriptedApi::default())));
        let barrier = Arc::new(tokio::sync::Barrier::new(2));

        let handles: Vec<_> = (0..2)
            .map(|_| {
                let processor = Arc::clone(&processor);
                let barrier = Arc::clone(&barrier);
                tokio::spawn(async move {
                    let mut ctx = parked_context("req-7");
                    barrier.wait().await;
                    processor.add_challenge_context(&mut ctx)
                })
            })
            .collect();

        let mut registered = Vec::new();
        for handle in handles {
            registered.push(handle.await.unwrap());
        }
        assert_eq!(registered.iter().filter(|id| !id.is_empty()).count(), 1);
        assert!(registered.contains(&ChallengeIdentifier::new("nas", "req-7")));
        assert_eq!(processor.pending(), 1);
    }

    #[test]
    fn test_add_uses_request_id_and_rejects_duplicates() {
        let processor = processor(Arc::new(ScriptedApi::default()));
        let mut ctx = parked_context("req-1");

        let id = processor.add_challenge_context(&mut ctx);
        assert_eq!(id, ChallengeIdentifier::new("nas", "req-1"));
        assert!(processor.has_challenge_context(&id));

        let duplicate = processor.add_challenge_context(&mut ctx);
        assert!(duplicate.is_empty());
        assert_eq!(processor.pending(), 1);
    }

    #[test]
    fn test_add_without_request_id_is_empty() {
        let processor = processor(Arc::new(ScriptedApi::default()));
        let mut ctx = test_context("alice", "password");
        assert!(processor.add_challenge_context(&mut ctx).is_empty());
    }

    #[tokio::test]
    async fn test_granted_answer_accepts_and_removes_entry() {
        let api = Arc::new(ScriptedApi::respond(vec![Ok(AccessRequestResponse::with_status(
            RequestStatus::Granted,
        ))]));
        let processor = processor(api.clone());
        let id = processor.add_challenge_context(&mut parked_context("req-1"));

        let mut ctx = test_context("alice", "123456");
        let status = processor.process_challenge(&id, &mut ctx).await.unwrap();

        assert_eq!(status, ChallengeStatus::Accept);
        assert!(ctx.authentication_state.is_accepted());
        assert!(!processor.has_challenge_context(&id));
        assert_eq!(api.challenges.lock().unwrap()[0].challenge, "123456");
    }

    #[tokio::test]
    async fn test_awaiting_keeps_entry() {
        let api = Arc::new(ScriptedApi::respond(vec![Ok(awaiting("req-1"))]));
        let processor = processor(api);
        let id = processor.add_challenge_context(&mut parked_context("req-1"));

        let mut ctx = test_context("alice", "123456");
        let status = processor.process_challenge(&id, &mut ctx).await.unwrap();

        assert_eq!(status, ChallengeStatus::InProcess);
        assert!(processor.has_challenge_context(&id));
        assert_eq!(ctx.response_information.state.as_deref(), Some("req-1"));
    }

    #[tokio::test]
    async fn test_denied_answer_rejects_and_removes_entry() {
        let api = Arc::new(ScriptedApi::respond(vec![Ok(AccessRequestResponse::with_status(
            RequestStatus::Denied,
        ))]));
        let processor = processor(api);
        let id = processor.add_challenge_context(&mut parked_context("req-1"));

        let mut ctx = test_context("alice", "000000");
        let status = processor.process_challenge(&id, &mut ctx).await.unwrap();

        assert_eq!(status, ChallengeStatus::Reject);
        assert!(ctx.authentication_state.is_rejected());
        assert!(!processor.has_challenge_context(&id));
    }

    #[tokio::test]
    async fn test_unsupported_answer_type_rejects_without_api_call() {
        let api = Arc::new(ScriptedApi::default());
        let processor = processor(api.clone());
        let id = processor.add_challenge_context(&mut parked_context("req-1"));

        let mut ctx = test_context("alice", "");
        ctx.request.remove_attribute("User-Password");
        ctx.request.add_attribute("CHAP-Password", vec![0u8; 17]);

        let status = processor.process_challenge(&id, &mut ctx).await.unwrap();
        assert_eq!(status, ChallengeStatus::Reject);
        assert!(api.challenges.lock().unwrap().is_empty());
    }
}
