//! Authentication pipeline
//!
//! An ordered list of stateless steps run over one [`ExecutionContext`].
//! A step ends the run by terminating the context; the composer then turns
//! the final state into the reply unless the step asked for no reply at all.
//! A failing step rejects the request.

mod continuation;
mod filter;
mod first_factor;
mod post_check;
mod pre_auth;
mod profile;
mod second_factor;
mod transform;

pub use continuation::ChallengeContinuationStep;
pub use filter::PacketTypeFilterStep;
pub use first_factor::FirstFactorStep;
pub use post_check::PostCheckStep;
pub use pre_auth::PreAuthenticationStep;
pub use profile::ProfileStep;
pub use second_factor::SecondFactorStep;
pub use transform::UserNameTransformStep;

use crate::challenge::{
    ChallengeProcessor, ChallengeRegistry, PasswordChangeProcessor, SecondFactorChallengeProcessor,
};
use crate::config::Config;
use crate::context::ExecutionContext;
use crate::error::GatewayError;
use crate::ldap::{Ldap3Directory, LdapDirectory};
use crate::mfa::{AuthenticatedClientCache, HttpMultifactorApi, MultifactorApi, SecondFactorGateway};
use crate::response::ResponseComposer;
use crate::upstream::{RadiusUpstream, UdpRadiusUpstream};
use async_trait::async_trait;
use radius_codec::{RadiusCodec, RadiusPacket};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// How often expired authenticated-client cache entries are purged
const CACHE_PURGE_INTERVAL: Duration = Duration::from_secs(60);

#[async_trait]
pub trait PipelineStep: Send + Sync {
    fn name(&self) -> &'static str;

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError>;
}

/// External systems the pipeline talks to
#[derive(Clone)]
pub struct Collaborators {
    pub directory: Arc<dyn LdapDirectory>,
    pub upstream: Arc<dyn RadiusUpstream>,
    pub mfa_api: Arc<dyn MultifactorApi>,
}

impl Collaborators {
    /// Directory over `ldap3`, UDP upstream client and the HTTP MFA API
    pub fn production(config: &Config, codec: RadiusCodec) -> Result<Self, GatewayError> {
        Ok(Collaborators {
            directory: Arc::new(Ldap3Directory::new()),
            upstream: Arc::new(UdpRadiusUpstream::new(codec)),
            mfa_api: Arc::new(HttpMultifactorApi::new(&config.api_url, config.api_timeout())?),
        })
    }
}

pub struct Pipeline {
    steps: Vec<Box<dyn PipelineStep>>,
    composer: ResponseComposer,
}

impl Pipeline {
    pub fn new(steps: Vec<Box<dyn PipelineStep>>, composer: ResponseComposer) -> Self {
        Pipeline { steps, composer }
    }

    /// The gateway's step order
    pub fn build(config: &Config, collaborators: Collaborators, started: Instant) -> Result<Self, GatewayError> {
        let cache = Arc::new(AuthenticatedClientCache::new(CACHE_PURGE_INTERVAL));
        let second_factor = Arc::new(SecondFactorGateway::new(
            collaborators.mfa_api,
            cache,
            config.api_timeout(),
        ));
        let processors: Vec<Arc<dyn ChallengeProcessor>> = vec![
            Arc::new(SecondFactorChallengeProcessor::new(
                Arc::clone(&second_factor),
                config.challenge_ttl(),
            )),
            Arc::new(PasswordChangeProcessor::new(
                Arc::clone(&collaborators.directory),
                config.challenge_ttl(),
            )),
        ];
        let registry = Arc::new(ChallengeRegistry::new(processors));

        let steps: Vec<Box<dyn PipelineStep>> = vec![
            Box::new(PacketTypeFilterStep::new(started)),
            Box::new(UserNameTransformStep::new(&config.clients)?),
            Box::new(ChallengeContinuationStep::new(Arc::clone(&registry))),
            Box::new(PreAuthenticationStep::new(Arc::clone(&second_factor))),
            Box::new(FirstFactorStep::new(
                Arc::clone(&collaborators.directory),
                collaborators.upstream,
                Arc::clone(&registry),
            )),
            Box::new(ProfileStep::new(collaborators.directory)),
            Box::new(SecondFactorStep::new(second_factor, registry)),
            Box::new(PostCheckStep),
        ];

        Ok(Pipeline::new(steps, ResponseComposer::new()))
    }

    /// Run the steps, then compose the reply
    ///
    /// `None` means the request gets no answer.
    pub async fn process(&self, ctx: &mut ExecutionContext) -> Option<RadiusPacket> {
        self.run(ctx).await;

        if ctx.execution_state.should_skip_response() {
            debug!(client = %ctx.client_name(), "No response for request");
            return None;
        }
        Some(self.composer.compose(ctx).await)
    }

    async fn run(&self, ctx: &mut ExecutionContext) {
        for step in &self.steps {
            if ctx.execution_state.is_terminated() {
                break;
            }
            if let Err(e) = step.execute(ctx).await {
                warn!(
                    client = %ctx.client_name(),
                    user = ctx.user_name().unwrap_or("-"),
                    step = step.name(),
                    error = %e,
                    "Pipeline step failed, rejecting"
                );
                ctx.reject(None);
                break;
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    //! In-memory collaborators for step tests

    use crate::config::{ClientConfig, UpstreamSettings};
    use crate::ldap::{BindOutcome, LdapDirectory, LdapError, LdapProfile};
    use crate::upstream::{RadiusUpstream, UpstreamError};
    use async_trait::async_trait;
    use radius_codec::RadiusPacket;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    #[derive(Debug, Clone, Default)]
    pub(crate) struct StubDirectory {
        pub credentials: Option<(String, String)>,
        pub must_change_password: bool,
        pub profile: Option<LdapProfile>,
        pub nested_groups: Vec<String>,
        pub bind_count: Arc<AtomicUsize>,
    }

    impl StubDirectory {
        pub(crate) fn with_password(user_name: &str, password: &str) -> Self {
            StubDirectory {
                credentials: Some((user_name.to_string(), password.to_string())),
                ..Default::default()
            }
        }

        pub(crate) fn binds(&self) -> usize {
            self.bind_count.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl LdapDirectory for StubDirectory {
        async fn authenticate(&self, _: &ClientConfig, user_name: &str, password: &str) -> Result<BindOutcome, LdapError> {
            self.bind_count.fetch_add(1, Ordering::SeqCst);
            let matches = self
                .credentials
                .as_ref()
                .is_some_and(|(user, pass)| user == user_name && pass == password);
            Ok(match (matches, self.must_change_password) {
                (false, _) => BindOutcome::InvalidCredentials,
                (true, true) => BindOutcome::MustChangePassword,
                (true, false) => BindOutcome::Success,
            })
        }

        async fn load_profile(
            &self,
            _: &ClientConfig,
            _: &str,
            _: Option<&str>,
        ) -> Result<Option<LdapProfile>, LdapError> {
            Ok(self.profile.clone())
        }

        async fn load_nested_groups(
            &self,
            _: &ClientConfig,
            _: &str,
            _: Option<&str>,
            _: &str,
        ) -> Result<Vec<String>, LdapError> {
            Ok(self.nested_groups.clone())
        }

        async fn change_password(&self, _: &ClientConfig, _: &str, _: &str, _: &str) -> Result<(), LdapError> {
            Ok(())
        }
    }

    /// Upstream answering every request with one packet; times out without one
    #[derive(Default)]
    pub(crate) struct StubUpstream {
        reply: Option<RadiusPacket>,
        forwarded: Mutex<Vec<RadiusPacket>>,
    }

    impl StubUpstream {
        pub(crate) fn replying(reply: RadiusPacket) -> Self {
            StubUpstream {
                reply: Some(reply),
                ..Default::default()
            }
        }

        pub(crate) fn forwarded(&self) -> Vec<RadiusPacket> {
            self.forwarded.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl RadiusUpstream for StubUpstream {
        async fn forward(&self, settings: &UpstreamSettings, request: &RadiusPacket) -> Result<RadiusPacket, UpstreamError> {
            self.forwarded.lock().unwrap().push(request.clone());
            match &self.reply {
                Some(reply) => Ok(reply.clone()),
                None => Err(UpstreamError::Timeout(
                    settings
                        .socket_addr()
                        .map_err(|e| UpstreamError::Address(e.to_string()))?,
                    Duration::from_secs(settings.timeout),
                )),
            }
        }
    }
}
