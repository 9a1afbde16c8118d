//! Final reply construction
//!
//! Turns the authentication state of a finished pipeline run into an
//! Access-Accept, Access-Challenge or Access-Reject addressed to the NAS.

use crate::config::{ReplyAttributeRule, ReplyCondition};
use crate::context::ExecutionContext;
use radius_codec::{AttributeType, Code, RadiusPacket};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Default)]
pub struct ResponseComposer;

impl ResponseComposer {
    pub fn new() -> Self {
        ResponseComposer
    }

    /// Build the reply; a reject waits out the client's credential delay first
    pub async fn compose(&self, ctx: &ExecutionContext) -> RadiusPacket {
        let code = Self::response_code(ctx);
        let mut response = RadiusPacket::create_response(&ctx.request, code);

        match code {
            Code::AccessAccept => {
                Self::copy_upstream_reply(ctx, &mut response);
                Self::add_reply_attributes(ctx, &mut response);
                Self::add_reply_message(ctx, &mut response);
            }
            Code::AccessChallenge => {
                Self::copy_upstream_reply(ctx, &mut response);
                Self::add_reply_message(ctx, &mut response);
                if let Some(state) = &ctx.response_information.state {
                    response.set_attribute(AttributeType::State.name(), state.as_bytes().to_vec());
                }
            }
            _ => {
                Self::copy_upstream_reply(ctx, &mut response);
                Self::add_reply_message(ctx, &mut response);
            }
        }

        Self::echo_proxy_state(ctx, &mut response);
        if ctx.request.has_attribute(AttributeType::MessageAuthenticator.name()) {
            response.set_attribute(AttributeType::MessageAuthenticator.name(), vec![0u8; 16]);
        }

        info!(
            client = %ctx.client_name(),
            user = ctx.user_name().unwrap_or("-"),
            code = ?response.code,
            first_factor = %ctx.authentication_state.first_factor(),
            second_factor = %ctx.authentication_state.second_factor(),
            "Authentication finished"
        );

        if response.code == Code::AccessReject {
            let delay = ctx.client.invalid_credential_delay.sample();
            if !delay.is_zero() {
                debug!(client = %ctx.client_name(), ?delay, "Delaying reject");
                tokio::time::sleep(delay).await;
            }
        }
        response
    }

    fn response_code(ctx: &ExecutionContext) -> Code {
        let state = &ctx.authentication_state;
        if state.is_rejected() {
            return Code::AccessReject;
        }
        if state.is_accepted() {
            return Code::AccessAccept;
        }

        let upstream_challenge = ctx
            .response_information
            .upstream_reply
            .as_ref()
            .is_some_and(|reply| reply.code == Code::AccessChallenge);
        if upstream_challenge || ctx.response_information.state.is_some() {
            Code::AccessChallenge
        } else {
            Code::AccessReject
        }
    }

    /// Attributes of the upstream server's reply, minus the hop-by-hop ones
    fn copy_upstream_reply(ctx: &ExecutionContext, response: &mut RadiusPacket) {
        let Some(reply) = &ctx.response_information.upstream_reply else {
            return;
        };
        let skipped = [AttributeType::ProxyState.name(), AttributeType::MessageAuthenticator.name()];
        for (name, values) in reply.attributes() {
            if skipped.contains(&name) {
                continue;
            }
            for value in values {
                response.add_attribute(name, value.clone());
            }
        }
    }

    fn add_reply_message(ctx: &ExecutionContext, response: &mut RadiusPacket) {
        if let Some(message) = &ctx.response_information.reply_message {
            response.set_attribute(AttributeType::ReplyMessage.name(), message.as_str());
        }
    }

    fn add_reply_attributes(ctx: &ExecutionContext, response: &mut RadiusPacket) {
        for (name, rules) in &ctx.client.reply_attributes {
            for rule in rules {
                if !Self::rule_matches(ctx, name, rule) {
                    continue;
                }
                for value in Self::rule_values(ctx, rule) {
                    debug!(client = %ctx.client_name(), attribute = %name, value = %value, "Adding reply attribute");
                    response.add_attribute(name.as_str(), value);
                }
                if rule.sufficient {
                    break;
                }
            }
        }
    }

    fn rule_matches(ctx: &ExecutionContext, name: &str, rule: &ReplyAttributeRule) -> bool {
        match rule.condition() {
            Ok(ReplyCondition::Always) => true,
            Ok(ReplyCondition::UserGroup(groups)) => ctx
                .profile
                .as_ref()
                .is_some_and(|profile| profile.is_member_of_any(&groups)),
            Ok(ReplyCondition::UserName(names)) => ctx
                .user_name()
                .is_some_and(|user| names.iter().any(|candidate| candidate.eq_ignore_ascii_case(user))),
            Err(e) => {
                warn!(client = %ctx.client_name(), attribute = %name, error = %e, "Skipping reply attribute rule");
                false
            }
        }
    }

    fn rule_values(ctx: &ExecutionContext, rule: &ReplyAttributeRule) -> Vec<String> {
        match (&rule.from, &rule.value) {
            (Some(from), _) => ctx
                .profile
                .as_ref()
                .map(|profile| profile.attribute_values(from).to_vec())
                .unwrap_or_default(),
            (None, Some(value)) => vec![value.clone()],
            (None, None) => Vec::new(),
        }
    }

    fn echo_proxy_state(ctx: &ExecutionContext, response: &mut RadiusPacket) {
        let name = AttributeType::ProxyState.name();
        if response.has_attribute(name) {
            return;
        }
        for value in ctx.request.attribute_values(name) {
            response.add_attribute(name, value.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DelayRange;
    use crate::context::tests::test_context;
    use crate::context::AuthenticationStatus;
    use crate::ldap::LdapProfile;
    use radius_codec::AttributeValue;
    use std::collections::BTreeMap;
    use std::sync::Arc;
    use std::time::Duration;

    fn accepted(ctx: &mut ExecutionContext) {
        ctx.authentication_state
            .set_first_factor(AuthenticationStatus::Accept);
        ctx.authentication_state
            .set_second_factor(AuthenticationStatus::Accept);
    }

    fn with_reply_attributes(ctx: &mut ExecutionContext, attributes: BTreeMap<String, Vec<ReplyAttributeRule>>) {
        let mut client = (*ctx.client).clone();
        client.reply_attributes = attributes;
        ctx.client = Arc::new(client);
    }

    fn rule(value: &str, when: Option<&str>, sufficient: bool) -> ReplyAttributeRule {
        ReplyAttributeRule {
            value: Some(value.to_string()),
            when: when.map(str::to_string),
            sufficient,
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_accept_with_group_attribute() {
        let mut ctx = test_context("alice", "pw");
        accepted(&mut ctx);
        let mut profile = LdapProfile::new("CN=Alice");
        profile.groups = vec!["VPN Users".to_string()];
        ctx.profile = Some(profile);

        let mut attributes = BTreeMap::new();
        attributes.insert(
            "Fortinet-Group-Name".to_string(),
            vec![rule("Users", Some("UserGroup=VPN Users"), false), rule("Admins", Some("UserGroup=Admins"), false)],
        );
        with_reply_attributes(&mut ctx, attributes);

        let response = ResponseComposer::new().compose(&ctx).await;
        assert_eq!(response.code, Code::AccessAccept);
        assert_eq!(response.identifier, ctx.request.identifier);
        assert_eq!(
            response.attribute_values("Fortinet-Group-Name"),
            &[AttributeValue::Text("Users".to_string())]
        );
    }

    #[tokio::test]
    async fn test_sufficient_rule_stops_evaluation() {
        let mut ctx = test_context("alice", "pw");
        accepted(&mut ctx);

        let mut attributes = BTreeMap::new();
        attributes.insert(
            "Class".to_string(),
            vec![
                rule("first", Some("UserName=ALICE"), true),
                rule("second", None, false),
            ],
        );
        with_reply_attributes(&mut ctx, attributes);

        let response = ResponseComposer::new().compose(&ctx).await;
        assert_eq!(response.attribute_values("Class").len(), 1);
        assert_eq!(response.attribute_text("Class").as_deref(), Some("first"));
    }

    #[tokio::test]
    async fn test_value_from_profile_attribute() {
        let mut ctx = test_context("alice", "pw");
        accepted(&mut ctx);
        ctx.profile = Some(LdapProfile::new("CN=Alice").with_attribute("department", vec!["Sales".to_string()]));

        let mut attributes = BTreeMap::new();
        attributes.insert(
            "Filter-Id".to_string(),
            vec![ReplyAttributeRule {
                from: Some("department".to_string()),
                ..Default::default()
            }],
        );
        with_reply_attributes(&mut ctx, attributes);

        let response = ResponseComposer::new().compose(&ctx).await;
        assert_eq!(response.attribute_text("Filter-Id").as_deref(), Some("Sales"));
    }

    #[tokio::test]
    async fn test_challenge_carries_state_and_message() {
        let mut ctx = test_context("alice", "pw");
        ctx.authentication_state
            .set_first_factor(AuthenticationStatus::Accept);
        ctx.response_information.state = Some("req-1".to_string());
        ctx.response_information.reply_message = Some("Enter OTP code".to_string());

        let response = ResponseComposer::new().compose(&ctx).await;
        assert_eq!(response.code, Code::AccessChallenge);
        assert_eq!(response.state().as_deref(), Some(&b"req-1"[..]));
        assert_eq!(response.attribute_text("Reply-Message").as_deref(), Some("Enter OTP code"));
    }

    #[tokio::test]
    async fn test_upstream_reply_copied_into_accept() {
        let mut ctx = test_context("alice", "pw");
        accepted(&mut ctx);
        let mut reply = RadiusPacket::new(Code::AccessAccept, 3, [0u8; 16]);
        reply.add_attribute("Class", b"session-42".to_vec());
        reply.add_attribute("Proxy-State", b"upstream-hop".to_vec());
        ctx.response_information.upstream_reply = Some(reply);

        let response = ResponseComposer::new().compose(&ctx).await;
        assert_eq!(response.attribute_text("Class").as_deref(), Some("session-42"));
        assert!(!response.has_attribute("Proxy-State"));
    }

    #[tokio::test]
    async fn test_proxy_state_and_message_authenticator_echoed() {
        let mut ctx = test_context("alice", "pw");
        ctx.request.add_attribute("Proxy-State", b"nas-hop".to_vec());
        ctx.request.add_attribute("Message-Authenticator", vec![0u8; 16]);
        ctx.reject(Some("Access denied"));

        let response = ResponseComposer::new().compose(&ctx).await;
        assert_eq!(response.code, Code::AccessReject);
        assert_eq!(response.attribute("Proxy-State").map(AttributeValue::to_bytes), Some(b"nas-hop".to_vec()));
        assert!(response.has_attribute("Message-Authenticator"));
        assert_eq!(response.attribute_text("Reply-Message").as_deref(), Some("Access denied"));
    }

    #[tokio::test]
    async fn test_unresolved_without_state_is_reject() {
        let ctx = test_context("alice", "pw");
        let response = ResponseComposer::new().compose(&ctx).await;
        assert_eq!(response.code, Code::AccessReject);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reject_is_delayed() {
        let mut ctx = test_context("alice", "pw");
        let mut client = (*ctx.client).clone();
        client.invalid_credential_delay = DelayRange { min: 2, max: 2 };
        ctx.client = Arc::new(client);
        ctx.reject(None);

        let started = tokio::time::Instant::now();
        ResponseComposer::new().compose(&ctx).await;
        assert!(started.elapsed() >= Duration::from_secs(2));
    }
}
