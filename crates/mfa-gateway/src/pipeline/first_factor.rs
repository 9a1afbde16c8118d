use super::PipelineStep;
use crate::challenge::{ChallengeRegistry, ChallengeType};
use crate::config::FirstFactorSource;
use crate::context::{AuthenticationStatus, AuthenticationType, ExecutionContext};
use crate::error::GatewayError;
use crate::ldap::{BindOutcome, LdapDirectory};
use crate::upstream::RadiusUpstream;
use async_trait::async_trait;
use radius_codec::{AttributeType, Code};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Checks the directory password or forwards the request to the upstream server
pub struct FirstFactorStep {
    directory: Arc<dyn LdapDirectory>,
    upstream: Arc<dyn RadiusUpstream>,
    registry: Arc<ChallengeRegistry>,
}

impl FirstFactorStep {
    pub fn new(
        directory: Arc<dyn LdapDirectory>,
        upstream: Arc<dyn RadiusUpstream>,
        registry: Arc<ChallengeRegistry>,
    ) -> Self {
        FirstFactorStep {
            directory,
            upstream,
            registry,
        }
    }

    async fn directory_bind(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        let (Some(user_name), Some(password)) = (ctx.user_name.clone(), ctx.passphrase.password().map(str::to_string))
        else {
            warn!(client = %ctx.client_name(), "User name or password missing for directory bind");
            ctx.reject(None);
            return Ok(());
        };

        match self.directory.authenticate(&ctx.client, &user_name, &password).await? {
            BindOutcome::Success => {
                info!(client = %ctx.client_name(), user = %user_name, "First factor accepted by directory");
                ctx.authentication_state
                    .set_first_factor(AuthenticationStatus::Accept);
            }
            BindOutcome::InvalidCredentials => {
                info!(client = %ctx.client_name(), user = %user_name, "Invalid directory credentials");
                ctx.reject(None);
            }
            BindOutcome::MustChangePassword => self.start_password_change(ctx, &user_name),
        }
        Ok(())
    }

    fn start_password_change(&self, ctx: &mut ExecutionContext, user_name: &str) {
        let processor = self.registry.processor_of(ChallengeType::PasswordChange);
        let processor = match processor {
            Some(processor)
                if ctx.client.password_change_enabled && ctx.authentication_type() == AuthenticationType::Pap =>
            {
                processor
            }
            _ => {
                info!(client = %ctx.client_name(), user = %user_name, "Password expired, rejecting");
                ctx.reject(None);
                return;
            }
        };

        ctx.must_change_password = true;
        let id = processor.add_challenge_context(ctx);
        if id.is_empty() {
            ctx.reject(None);
            return;
        }
        info!(client = %ctx.client_name(), user = %user_name, "Password expired, starting password change");
        ctx.terminate();
    }

    async fn upstream_forward(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        let Some(settings) = ctx.client.upstream.clone() else {
            warn!(client = %ctx.client_name(), "No upstream RADIUS server configured");
            ctx.reject(None);
            return Ok(());
        };

        // The upstream server only sees the password part of the passphrase
        let mut request = ctx.request.clone();
        if let Some(password) = ctx.passphrase.password() {
            request.set_attribute(AttributeType::UserPassword.name(), password);
        }

        let reply = self.upstream.forward(&settings, &request).await?;
        debug!(client = %ctx.client_name(), code = ?reply.code, "Upstream reply");

        match reply.code {
            Code::AccessAccept => {
                info!(client = %ctx.client_name(), user = ctx.user_name().unwrap_or("-"), "First factor accepted by upstream");
                ctx.response_information.upstream_reply = Some(reply);
                ctx.authentication_state
                    .set_first_factor(AuthenticationStatus::Accept);
            }
            Code::AccessChallenge => {
                info!(client = %ctx.client_name(), user = ctx.user_name().unwrap_or("-"), "Upstream challenge relayed");
                ctx.response_information.upstream_reply = Some(reply);
                ctx.terminate();
            }
            _ => {
                info!(client = %ctx.client_name(), user = ctx.user_name().unwrap_or("-"), "First factor rejected by upstream");
                ctx.response_information.upstream_reply = Some(reply);
                ctx.reject(None);
            }
        }
        Ok(())
    }
}

#[async_trait]
impl PipelineStep for FirstFactorStep {
    fn name(&self) -> &'static str {
        "first-factor"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        if ctx.authentication_state.first_factor().is_resolved() {
            return Ok(());
        }

        match ctx.client.first_factor_source {
            FirstFactorSource::None => {
                ctx.authentication_state
                    .set_first_factor(AuthenticationStatus::Accept);
                Ok(())
            }
            FirstFactorSource::ActiveDirectory | FirstFactorSource::Ldap => self.directory_bind(ctx).await,
            FirstFactorSource::Radius => self.upstream_forward(ctx).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::challenge::{ChallengeProcessor, PasswordChangeProcessor};
    use crate::config::UpstreamSettings;
    use crate::context::tests::test_context;
    use crate::pipeline::testing::{StubDirectory, StubUpstream};
    use radius_codec::RadiusPacket;
    use std::time::Duration;

    fn first_factor(directory: Arc<StubDirectory>, upstream: Arc<StubUpstream>) -> FirstFactorStep {
        let processor: Arc<dyn ChallengeProcessor> =
            Arc::new(PasswordChangeProcessor::new(directory.clone(), Duration::from_secs(60)));
        FirstFactorStep::new(directory, upstream, Arc::new(ChallengeRegistry::new(vec![processor])))
    }

    fn context_with_source(source: FirstFactorSource, password: &str) -> ExecutionContext {
        let mut ctx = test_context("alice", password);
        let mut client = (*ctx.client).clone();
        client.first_factor_source = source;
        client.upstream = Some(UpstreamSettings {
            address: "127.0.0.1:11812".to_string(),
            secret: "upstream".to_string(),
            timeout: 1,
        });
        ctx.client = Arc::new(client);
        ctx
    }

    #[tokio::test]
    async fn test_none_source_accepts() {
        let step = first_factor(Arc::new(StubDirectory::default()), Arc::new(StubUpstream::default()));
        let mut ctx = test_context("alice", "123456");
        step.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.authentication_state.first_factor(), AuthenticationStatus::Accept);
    }

    #[tokio::test]
    async fn test_directory_bind() {
        let directory = Arc::new(StubDirectory::with_password("alice", "Passw0rd"));
        let step = first_factor(directory.clone(), Arc::new(StubUpstream::default()));

        let mut ctx = context_with_source(FirstFactorSource::Ldap, "Passw0rd");
        step.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.authentication_state.first_factor(), AuthenticationStatus::Accept);

        let mut ctx = context_with_source(FirstFactorSource::ActiveDirectory, "wrong");
        step.execute(&mut ctx).await.unwrap();
        assert!(ctx.authentication_state.is_rejected());
        assert!(ctx.execution_state.is_terminated());
    }

    #[tokio::test]
    async fn test_missing_password_rejects_without_bind() {
        let directory = Arc::new(StubDirectory::with_password("alice", "Passw0rd"));
        let step = first_factor(directory.clone(), Arc::new(StubUpstream::default()));

        let mut ctx = context_with_source(FirstFactorSource::Ldap, "");
        step.execute(&mut ctx).await.unwrap();
        assert!(ctx.authentication_state.is_rejected());
        assert_eq!(directory.binds(), 0);
    }

    #[tokio::test]
    async fn test_expired_password_starts_change_when_enabled() {
        let directory = Arc::new(StubDirectory {
            must_change_password: true,
            ..StubDirectory::with_password("alice", "Expired1")
        });
        let step = first_factor(directory, Arc::new(StubUpstream::default()));

        let mut ctx = context_with_source(FirstFactorSource::ActiveDirectory, "Expired1");
        step.execute(&mut ctx).await.unwrap();
        assert!(ctx.authentication_state.is_rejected());

        let mut ctx = context_with_source(FirstFactorSource::ActiveDirectory, "Expired1");
        let mut client = (*ctx.client).clone();
        client.password_change_enabled = true;
        ctx.client = Arc::new(client);
        step.execute(&mut ctx).await.unwrap();

        assert!(ctx.must_change_password);
        assert!(ctx.execution_state.is_terminated());
        assert!(!ctx.authentication_state.first_factor().is_resolved());
        assert!(ctx.response_information.state.is_some());
        assert_eq!(
            ctx.response_information.reply_message.as_deref(),
            Some("Please enter new password")
        );
    }

    #[tokio::test]
    async fn test_upstream_forwards_password_without_otp() {
        let mut reply = RadiusPacket::new(Code::AccessAccept, 9, [0u8; 16]);
        reply.add_attribute("Class", b"upstream-class".to_vec());
        let upstream = Arc::new(StubUpstream::replying(reply));
        let step = first_factor(Arc::new(StubDirectory::default()), upstream.clone());

        let mut ctx = context_with_source(FirstFactorSource::Radius, "Passw0rd123456");
        ctx.passphrase.password = Some("Passw0rd".to_string());
        step.execute(&mut ctx).await.unwrap();

        assert_eq!(ctx.authentication_state.first_factor(), AuthenticationStatus::Accept);
        assert!(ctx.response_information.upstream_reply.is_some());
        let forwarded = upstream.forwarded();
        assert_eq!(forwarded[0].user_password(), Some("Passw0rd"));
    }

    #[tokio::test]
    async fn test_upstream_challenge_and_reject() {
        let upstream = Arc::new(StubUpstream::replying(RadiusPacket::new(Code::AccessChallenge, 1, [0u8; 16])));
        let step = first_factor(Arc::new(StubDirectory::default()), upstream);
        let mut ctx = context_with_source(FirstFactorSource::Radius, "Passw0rd");
        step.execute(&mut ctx).await.unwrap();
        assert!(ctx.execution_state.is_terminated());
        assert!(!ctx.authentication_state.is_rejected());

        let upstream = Arc::new(StubUpstream::replying(RadiusPacket::new(Code::AccessReject, 1, [0u8; 16])));
        let step = first_factor(Arc::new(StubDirectory::default()), upstream);
        let mut ctx = context_with_source(FirstFactorSource::Radius, "Passw0rd");
        step.execute(&mut ctx).await.unwrap();
        assert!(ctx.authentication_state.is_rejected());
    }

    #[tokio::test]
    async fn test_upstream_failure_is_an_error() {
        let step = first_factor(Arc::new(StubDirectory::default()), Arc::new(StubUpstream::default()));
        let mut ctx = context_with_source(FirstFactorSource::Radius, "Passw0rd");
        assert!(step.execute(&mut ctx).await.is_err());
    }
}
