//! Expired-password change over Access-Challenge
//!
//! Two rounds: the user types the new password, then repeats it. Between
//! rounds the new password is held encrypted under a key generated at
//! startup. A successful change resumes the pipeline with the first factor
//! accepted.

use super::{challenge_answer, ChallengeIdentifier, ChallengeProcessor, ChallengeStatus, ChallengeStore, ChallengeType};
use crate::context::{AuthenticationStatus, AuthenticationType, ExecutionContext};
use crate::error::GatewayError;
use crate::ldap::LdapDirectory;
use async_trait::async_trait;
use radius_codec::{decrypt_user_password, encrypt_user_password, generate_request_authenticator};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

const ENTER_NEW_PASSWORD: &str = "Please enter new password";
const CONFIRM_NEW_PASSWORD: &str = "Please confirm new password";
const PASSWORDS_DO_NOT_MATCH: &str = "Passwords do not match. Please enter new password";
const PASSWORD_CHANGE_FAILED: &str = "Password change failed";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stage {
    EnterNewPassword,
    /// New password encrypted under the processor key with this nonce
    ConfirmNewPassword { ciphertext: Vec<u8>, nonce: [u8; 16] },
}

#[derive(Debug, Clone)]
struct PasswordChangeRequest {
    context: ExecutionContext,
    stage: Stage,
}

pub struct PasswordChangeProcessor {
    store: ChallengeStore<PasswordChangeRequest>,
    directory: Arc<dyn LdapDirectory>,
    key: [u8; 16],
}

impl PasswordChangeProcessor {
    pub fn new(directory: Arc<dyn LdapDirectory>, ttl: Duration) -> Self {
        Self::with_store(directory, ChallengeStore::new(ttl))
    }

    fn with_store(directory: Arc<dyn LdapDirectory>, store: ChallengeStore<PasswordChangeRequest>) -> Self {
        PasswordChangeProcessor {
            store,
            directory,
            key: generate_request_authenticator(),
        }
    }

    fn token() -> String {
        generate_request_authenticator()
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect()
    }

    fn seal(&self, password: &str) -> Option<Stage> {
        let nonce = generate_request_authenticator();
        let ciphertext = encrypt_user_password(password.as_bytes(), &self.key, &nonce).ok()?;
        Some(Stage::ConfirmNewPassword { ciphertext, nonce })
    }

    fn open(&self, ciphertext: &[u8], nonce: &[u8; 16]) -> Option<String> {
        decrypt_user_password(ciphertext, &self.key, nonce).ok()
    }

    fn prompt(ctx: &mut ExecutionContext, id: &ChallengeIdentifier, message: &str) -> ChallengeStatus {
        ctx.response_information.state = Some(id.request_id().to_string());
        ctx.response_information.reply_message = Some(message.to_string());
        ChallengeStatus::InProcess
    }

    fn fail(&self, id: &ChallengeIdentifier, ctx: &mut ExecutionContext, message: &str) -> ChallengeStatus {
        self.store.remove(id);
        ctx.reject(Some(message));
        ChallengeStatus::Reject
    }
}

#[async_trait]
impl ChallengeProcessor for PasswordChangeProcessor {
    fn challenge_type(&self) -> ChallengeType {
        ChallengeType::PasswordChange
    }

    fn has_challenge_context(&self, id: &ChallengeIdentifier) -> bool {
        self.store.contains(id)
    }

    fn add_challenge_context(&self, ctx: &mut ExecutionContext) -> ChallengeIdentifier {
        let id = ChallengeIdentifier::new(ctx.client_name(), Self::token());
        let request = PasswordChangeRequest {
            context: ctx.clone(),
            stage: Stage::EnterNewPassword,
        };
        if !self.store.try_add(id.clone(), request) {
            return ChallengeIdentifier::empty();
        }

        info!(client = %ctx.client_name(), user = ctx.user_name().unwrap_or("-"), "Password change started");
        Self::prompt(ctx, &id, ENTER_NEW_PASSWORD);
        id
    }

    async fn process_challenge(
        &self,
        id: &ChallengeIdentifier,
        ctx: &mut ExecutionContext,
    ) -> Result<ChallengeStatus, GatewayError> {
        let Some(mut request) = self.store.get(id) else {
            ctx.reject(None);
            return Ok(ChallengeStatus::Reject);
        };

        let answer = match (ctx.authentication_type(), challenge_answer(ctx)) {
            (AuthenticationType::Pap, Some(answer)) if !answer.is_empty() => answer,
            (authentication_type, _) => {
                warn!(client = %ctx.client_name(), ?authentication_type, "Password change needs a PAP answer");
                return Ok(self.fail(id, ctx, PASSWORD_CHANGE_FAILED));
            }
        };

        match request.stage.clone() {
            Stage::EnterNewPassword => {
                let Some(stage) = self.seal(&answer) else {
                    warn!(client = %ctx.client_name(), "New password too long");
                    return Ok(self.fail(id, ctx, PASSWORD_CHANGE_FAILED));
                };
                request.stage = stage;
                self.store.update(id, request);
                Ok(Self::prompt(ctx, id, CONFIRM_NEW_PASSWORD))
            }
            Stage::ConfirmNewPassword { ciphertext, nonce } => {
                let new_password = self.open(&ciphertext, &nonce);
                if new_password.as_deref() != Some(answer.as_str()) {
                    request.stage = Stage::EnterNewPassword;
                    self.store.update(id, request);
                    return Ok(Self::prompt(ctx, id, PASSWORDS_DO_NOT_MATCH));
                }

                let original = request.context;
                let user_name = original.user_name.clone().unwrap_or_default();
                let current_password = original.passphrase.password().unwrap_or_default().to_string();

                if let Err(e) = self
                    .directory
                    .change_password(&original.client, &user_name, &current_password, &answer)
                    .await
                {
                    warn!(client = %ctx.client_name(), user = %user_name, error = %e, "Password change failed");
                    return Ok(self.fail(id, ctx, PASSWORD_CHANGE_FAILED));
                }

                self.store.remove(id);
                info!(client = %ctx.client_name(), user = %user_name, "Password changed");

                // Continue as the original request, now holding the new password
                let mut passphrase = original.passphrase.clone();
                passphrase.password = Some(answer);
                ctx.user_name = original.user_name;
                ctx.profile = original.profile;
                ctx.passphrase = passphrase;
                ctx.must_change_password = false;
                ctx.response_information.state = None;
                ctx.response_information.reply_message = None;
                ctx.authentication_state
                    .set_first_factor(AuthenticationStatus::Accept);
                // A pre-authentication OTP checked on the first request still counts
                ctx.authentication_state
                    .set_second_factor(original.authentication_state.second_factor());
                Ok(ChallengeStatus::Accept)
            }
        }
    }
}
