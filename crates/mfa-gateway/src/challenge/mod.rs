//! Multi-round Access-Challenge exchanges
//!
//! An exchange starts when a step parks its [`ExecutionContext`] with a
//! processor and the NAS receives an Access-Challenge carrying the returned
//! token as State. The next Access-Request with that State is routed back to
//! the processor that owns the token:
//!
//! ```text
//! None --add_challenge_context--> InProcess --process_challenge--> Accept | Reject
//!                                     ^                  |
//!                                     +--- InProcess ----+
//! ```

pub mod password_change;
pub mod second_factor;
pub mod store;

pub use password_change::PasswordChangeProcessor;
pub use second_factor::SecondFactorChallengeProcessor;
pub use store::ChallengeStore;

use crate::context::{AuthenticationType, ExecutionContext};
use crate::error::GatewayError;
use async_trait::async_trait;
use radius_codec::microsoft;
use std::fmt;
use std::sync::Arc;

/// Offset and length of the answer inside MS-CHAP2-Response
///
/// The NAS sends the user's code where the peer challenge normally goes:
/// ident (1), flags (1), then the code.
const MSCHAP2_ANSWER_OFFSET: usize = 2;
const MSCHAP2_ANSWER_LENGTH: usize = 6;

/// Key of one pending exchange
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChallengeIdentifier {
    client_name: String,
    request_id: String,
}

impl ChallengeIdentifier {
    pub fn new(client_name: impl Into<String>, request_id: impl Into<String>) -> Self {
        ChallengeIdentifier {
            client_name: client_name.into(),
            request_id: request_id.into(),
        }
    }

    /// Identifier returned when nothing was registered
    pub fn empty() -> Self {
        ChallengeIdentifier::new("", "")
    }

    pub fn is_empty(&self) -> bool {
        self.request_id.is_empty()
    }

    pub fn client_name(&self) -> &str {
        &self.client_name
    }

    /// State token sent to the NAS
    pub fn request_id(&self) -> &str {
        &self.request_id
    }
}

impl fmt::Display for ChallengeIdentifier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.client_name, self.request_id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeType {
    SecondFactor,
    PasswordChange,
}

/// Result of processing one answer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeStatus {
    Accept,
    Reject,
    /// Another round is needed; State and Reply-Message are set
    InProcess,
}

/// Owner of one kind of exchange
#[async_trait]
pub trait ChallengeProcessor: Send + Sync {
    fn challenge_type(&self) -> ChallengeType;

    fn has_challenge_context(&self, id: &ChallengeIdentifier) -> bool;

    /// Park the context and return its key
    ///
    /// An empty identifier means a live exchange already exists for the key.
    fn add_challenge_context(&self, ctx: &mut ExecutionContext) -> ChallengeIdentifier;

    async fn process_challenge(
        &self,
        id: &ChallengeIdentifier,
        ctx: &mut ExecutionContext,
    ) -> Result<ChallengeStatus, GatewayError>;
}

/// Processors in lookup order
pub struct ChallengeRegistry {
    processors: Vec<Arc<dyn ChallengeProcessor>>,
}

impl ChallengeRegistry {
    pub fn new(processors: Vec<Arc<dyn ChallengeProcessor>>) -> Self {
        ChallengeRegistry { processors }
    }

    /// Processor holding a live exchange for `id`
    pub fn processor_for(&self, id: &ChallengeIdentifier) -> Option<Arc<dyn ChallengeProcessor>> {
        if id.is_empty() {
            return None;
        }
        self.processors
            .iter()
            .find(|processor| processor.has_challenge_context(id))
            .cloned()
    }

    pub fn processor_of(&self, challenge_type: ChallengeType) -> Option<Arc<dyn ChallengeProcessor>> {
        self.processors
            .iter()
            .find(|processor| processor.challenge_type() == challenge_type)
            .cloned()
    }
}

/// The user's answer carried by a continuation request
///
/// PAP carries it as the password and MS-CHAPv2 inside MS-CHAP2-Response;
/// other authentication types cannot answer a challenge.
pub fn challenge_answer(ctx: &ExecutionContext) -> Option<String> {
    match ctx.authentication_type() {
        AuthenticationType::Pap => ctx.request.user_password().map(str::to_string),
        AuthenticationType::MsChap2 => {
            let response = ctx.request.attribute(microsoft::MS_CHAP2_RESPONSE)?.to_bytes();
            let answer = response.get(MSCHAP2_ANSWER_OFFSET..MSCHAP2_ANSWER_OFFSET + MSCHAP2_ANSWER_LENGTH)?;
            Some(String::from_utf8_lossy(answer).into_owned())
        }
        _ => None,
    }
}
