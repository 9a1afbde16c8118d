use super::PipelineStep;
use crate::context::{AuthenticationStatus, ExecutionContext};
use crate::error::GatewayError;
use crate::ldap::LdapDirectory;
use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Loads the directory profile and applies the group policies
///
/// Access groups gate the request; bypass groups and the absence of
/// second-factor group membership let the user skip the second factor.
pub struct ProfileStep {
    directory: Arc<dyn LdapDirectory>,
}

impl ProfileStep {
    pub fn new(directory: Arc<dyn LdapDirectory>) -> Self {
        ProfileStep { directory }
    }
}

#[async_trait]
impl PipelineStep for ProfileStep {
    fn name(&self) -> &'static str {
        "profile"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        if !ctx.client.needs_profile() || ctx.profile.is_some() {
            return Ok(());
        }
        let Some(user_name) = ctx.user_name.clone() else {
            warn!(client = %ctx.client_name(), "No user name to load a profile for");
            ctx.reject(None);
            return Ok(());
        };

        // Directory clients without a service account search as the user
        let password = if ctx.client.uses_directory() {
            ctx.passphrase.password().map(str::to_string)
        } else {
            None
        };

        let Some(mut profile) = self
            .directory
            .load_profile(&ctx.client, &user_name, password.as_deref())
            .await?
        else {
            warn!(client = %ctx.client_name(), user = %user_name, "User not found in directory");
            if ctx.client.checks_groups() || ctx.client.identity_attribute.is_some() {
                ctx.reject(None);
            }
            return Ok(());
        };

        if ctx.client.load_nested_groups {
            let nested = self
                .directory
                .load_nested_groups(&ctx.client, &user_name, password.as_deref(), &profile.dn)
                .await?;
            profile.add_groups(nested);
        }
        debug!(client = %ctx.client_name(), user = %user_name, groups = ?profile.groups, "Profile loaded");

        let client = Arc::clone(&ctx.client);
        if !client.access_groups.is_empty() && !profile.is_member_of_any(&client.access_groups) {
            info!(client = %ctx.client_name(), user = %user_name, "User is not a member of any access group");
            ctx.profile = Some(profile);
            ctx.reject(None);
            return Ok(());
        }

        if profile.is_member_of_any(&client.bypass_second_factor_groups) {
            info!(client = %ctx.client_name(), user = %user_name, "Member of a second-factor bypass group");
            ctx.authentication_state
                .set_second_factor(AuthenticationStatus::Bypass);
        } else if !client.second_factor_groups.is_empty() && !profile.is_member_of_any(&client.second_factor_groups) {
            info!(client = %ctx.client_name(), user = %user_name, "Not a member of any second-factor group");
            ctx.authentication_state
                .set_second_factor(AuthenticationStatus::Bypass);
        }

        ctx.profile = Some(profile);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FirstFactorSource, LdapSettings};
    use crate::config::tests::test_client;
    use crate::context::tests::test_context;
    use crate::ldap::LdapProfile;
    use crate::pipeline::testing::StubDirectory;

    fn ldap_settings() -> LdapSettings {
        LdapSettings {
            url: "ldap://127.0.0.1:389".to_string(),
            base_dn: "DC=example,DC=com".to_string(),
            bind_dn: None,
            bind_password: None,
            search_filter: None,
            timeout: 5,
        }
    }

    fn context(configure: impl FnOnce(&mut crate::config::ClientConfig)) -> ExecutionContext {
        let mut client = test_client("nas");
        client.first_factor_source = FirstFactorSource::Ldap;
        client.ldap = Some(ldap_settings());
        configure(&mut client);

        let mut ctx = test_context("alice", "Passw0rd");
        ctx.client = Arc::new(client);
        ctx
    }

    fn directory(groups: &[&str]) -> Arc<StubDirectory> {
        let mut profile = LdapProfile::new("CN=Alice,OU=Users,DC=example,DC=com");
        profile.groups = groups.iter().map(|g| g.to_string()).collect();
        Arc::new(StubDirectory {
            profile: Some(profile),
            ..StubDirectory::with_password("alice", "Passw0rd")
        })
    }

    #[tokio::test]
    async fn test_profile_loaded() {
        let step = ProfileStep::new(directory(&["VPN Users"]));
        let mut ctx = context(|_| {});
        step.execute(&mut ctx).await.unwrap();

        assert!(ctx.profile.as_ref().is_some_and(|p| p.is_member_of("vpn users")));
        assert!(!ctx.authentication_state.second_factor().is_resolved());
    }

    #[tokio::test]
    async fn test_access_group_required() {
        let step = ProfileStep::new(directory(&["Staff"]));
        let mut ctx = context(|client| client.access_groups = vec!["VPN Users".to_string()]);
        step.execute(&mut ctx).await.unwrap();
        assert!(ctx.authentication_state.is_rejected());
    }

    #[tokio::test]
    async fn test_bypass_group() {
        let step = ProfileStep::new(directory(&["Service Accounts"]));
        let mut ctx = context(|client| client.bypass_second_factor_groups = vec!["Service Accounts".to_string()]);
        step.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.authentication_state.second_factor(), AuthenticationStatus::Bypass);
    }

    #[tokio::test]
    async fn test_second_factor_groups() {
        let step = ProfileStep::new(directory(&["Staff"]));
        let mut ctx = context(|client| client.second_factor_groups = vec!["MFA Users".to_string()]);
        step.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.authentication_state.second_factor(), AuthenticationStatus::Bypass);

        let step = ProfileStep::new(directory(&["MFA Users"]));
        let mut ctx = context(|client| client.second_factor_groups = vec!["MFA Users".to_string()]);
        step.execute(&mut ctx).await.unwrap();
        assert!(!ctx.authentication_state.second_factor().is_resolved());
    }

    #[tokio::test]
    async fn test_nested_groups_count_for_policies() {
        let directory = Arc::new(StubDirectory {
            nested_groups: vec!["VPN Users".to_string()],
            ..(*directory(&["Engineering"])).clone()
        });
        let step = ProfileStep::new(directory);
        let mut ctx = context(|client| {
            client.access_groups = vec!["VPN Users".to_string()];
            client.load_nested_groups = true;
        });
        step.execute(&mut ctx).await.unwrap();

        assert!(!ctx.authentication_state.is_rejected());
        assert!(ctx.profile.as_ref().is_some_and(|p| p.is_member_of("Engineering")));
    }

    #[tokio::test]
    async fn test_missing_user_rejects_only_with_group_policies() {
        let missing = Arc::new(StubDirectory::default());

        let mut ctx = context(|_| {});
        ProfileStep::new(missing.clone()).execute(&mut ctx).await.unwrap();
        assert!(!ctx.authentication_state.is_rejected());

        let mut ctx = context(|client| client.access_groups = vec!["VPN Users".to_string()]);
        ProfileStep::new(missing).execute(&mut ctx).await.unwrap();
        assert!(ctx.authentication_state.is_rejected());
    }

    #[tokio::test]
    async fn test_skipped_without_ldap_settings() {
        let directory = directory(&[]);
        let mut ctx = test_context("alice", "pw");
        ProfileStep::new(directory.clone()).execute(&mut ctx).await.unwrap();
        assert!(ctx.profile.is_none());
    }
}
