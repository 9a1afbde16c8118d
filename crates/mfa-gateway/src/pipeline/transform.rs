use super::PipelineStep;
use crate::config::{ClientConfig, ConfigError};
use crate::context::ExecutionContext;
use crate::error::GatewayError;
use async_trait::async_trait;
use regex::Regex;
use std::collections::HashMap;
use tracing::debug;

/// Applies each client's User-Name rewrite rules, in configured order
pub struct UserNameTransformStep {
    rules: HashMap<String, Vec<(Regex, String)>>,
}

impl UserNameTransformStep {
    pub fn new(clients: &[ClientConfig]) -> Result<Self, ConfigError> {
        let mut rules = HashMap::new();
        for client in clients.iter().filter(|client| !client.user_name_transform.is_empty()) {
            let compiled = client
                .user_name_transform
                .iter()
                .map(|rule| Ok((rule.compile()?, rule.replacement.clone())))
                .collect::<Result<Vec<_>, ConfigError>>()?;
            rules.insert(client.name.clone(), compiled);
        }
        Ok(UserNameTransformStep { rules })
    }

    fn transform(rules: &[(Regex, String)], user_name: &str) -> String {
        rules
            .iter()
            .fold(user_name.to_string(), |name, (pattern, replacement)| {
                pattern.replace_all(&name, replacement.as_str()).into_owned()
            })
    }
}

#[async_trait]
impl PipelineStep for UserNameTransformStep {
    fn name(&self) -> &'static str {
        "user-name-transform"
    }

    async fn execute(&self, ctx: &mut ExecutionContext) -> Result<(), GatewayError> {
        let Some(rules) = self.rules.get(ctx.client_name()) else {
            return Ok(());
        };
        let Some(original) = ctx.user_name.as_deref() else {
            return Ok(());
        };

        let transformed = Self::transform(rules, original);
        if transformed != original {
            debug!(client = %ctx.client_name(), original, transformed = %transformed, "User name transformed");
            ctx.user_name = Some(transformed).filter(|name| !name.is_empty());
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_client;
    use crate::config::UserNameTransformRule;
    use crate::context::tests::test_context;

    fn rule(pattern: &str, replacement: &str) -> UserNameTransformRule {
        UserNameTransformRule {
            pattern: pattern.to_string(),
            replacement: replacement.to_string(),
        }
    }

    #[tokio::test]
    async fn test_rules_apply_in_order() {
        let mut client = test_client("nas");
        client.user_name_transform = vec![rule(r"^CORP\\(.+)$", "$1"), rule(r"@corp\.local$", "@example.com")];
        let step = UserNameTransformStep::new(&[client]).unwrap();

        let mut ctx = test_context(r"CORP\alice@corp.local", "pw");
        step.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.user_name(), Some("alice@example.com"));
    }

    #[tokio::test]
    async fn test_other_clients_untouched() {
        let mut client = test_client("other");
        client.user_name_transform = vec![rule("alice", "bob")];
        let step = UserNameTransformStep::new(&[client]).unwrap();

        let mut ctx = test_context("alice", "pw");
        step.execute(&mut ctx).await.unwrap();
        assert_eq!(ctx.user_name(), Some("alice"));
    }

    #[test]
    fn test_invalid_pattern_fails_construction() {
        let mut client = test_client("nas");
        client.user_name_transform = vec![rule("(", "")];
        assert!(UserNameTransformStep::new(&[client]).is_err());
    }
}
