//! LDAP/Active Directory first factor and user profiles
//!
//! [`LdapDirectory`] is what the pipeline talks to; [`Ldap3Directory`] is the
//! implementation over `ldap3`. A new connection is opened per operation and
//! bound either with the configured service account or, when none is set,
//! with the user's own credentials (Active Directory) or anonymously.

use crate::config::{ClientConfig, FirstFactorSource, LdapSettings};
use async_trait::async_trait;
use ldap3::exop::PasswordModify;
use ldap3::{ldap_escape, Ldap, LdapConnAsync, LdapConnSettings, Mod, Scope, SearchEntry};
use std::collections::{HashMap, HashSet, VecDeque};
use thiserror::Error;
use tracing::{debug, error, info, warn};

/// LDAP result code for invalidCredentials
const RC_INVALID_CREDENTIALS: u32 = 49;
/// Active Directory matching rule that walks nested group membership
const LDAP_MATCHING_RULE_IN_CHAIN: &str = "1.2.840.113556.1.4.1941";
/// Upper bound on group levels followed for directories without the matching rule
const MAX_NESTING_DEPTH: usize = 10;

#[derive(Error, Debug)]
pub enum LdapError {
    #[error("LDAP connection error: {0}")]
    Connection(String),
    #[error("LDAP bind error: {0}")]
    Bind(String),
    #[error("LDAP search error: {0}")]
    Search(String),
    #[error("User not found: {0}")]
    UserNotFound(String),
    #[error("Password change failed: {0}")]
    PasswordChange(String),
    #[error("Client {0} has no ldap settings")]
    NotConfigured(String),
}

/// Result of a user bind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindOutcome {
    Success,
    InvalidCredentials,
    /// Password is expired or must be reset at next logon
    MustChangePassword,
}

/// Directory entry of an authenticated user
#[derive(Debug, Clone, Default, PartialEq)]
pub struct LdapProfile {
    pub dn: String,
    pub display_name: Option<String>,
    pub email: Option<String>,
    pub phone: Option<String>,
    /// Group names (CN of each group DN)
    pub groups: Vec<String>,
    /// All loaded attributes, keyed by lower-cased name
    attributes: HashMap<String, Vec<String>>,
}

impl LdapProfile {
    pub fn new(dn: impl Into<String>) -> Self {
        LdapProfile {
            dn: dn.into(),
            ..Default::default()
        }
    }

    pub fn with_attribute(mut self, name: &str, values: Vec<String>) -> Self {
        self.attributes.insert(name.to_ascii_lowercase(), values);
        self
    }

    /// First value of an attribute (case-insensitive name)
    pub fn attribute(&self, name: &str) -> Option<&str> {
        self.attribute_values(name).first().map(String::as_str)
    }

    pub fn attribute_values(&self, name: &str) -> &[String] {
        self.attributes
            .get(&name.to_ascii_lowercase())
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Case-insensitive group membership
    pub fn is_member_of(&self, group: &str) -> bool {
        self.groups.iter().any(|g| g.eq_ignore_ascii_case(group))
    }

    pub fn is_member_of_any(&self, groups: &[String]) -> bool {
        groups.iter().any(|group| self.is_member_of(group))
    }

    /// Add group names not yet present
    pub fn add_groups<I: IntoIterator<Item = String>>(&mut self, groups: I) {
        for group in groups {
            if !self.is_member_of(&group) {
                self.groups.push(group);
            }
        }
    }

    fn from_entry(entry: SearchEntry, client: &ClientConfig) -> Self {
        let attributes: HashMap<String, Vec<String>> = entry
            .attrs
            .into_iter()
            .map(|(name, values)| (name.to_ascii_lowercase(), values))
            .collect();

        let first = |name: &str| {
            attributes
                .get(&name.to_ascii_lowercase())
                .and_then(|values| values.first())
                .cloned()
        };

        let groups = attributes
            .get("memberof")
            .map(|dns| dns.iter().map(|dn| group_name(dn)).collect())
            .unwrap_or_default();

        LdapProfile {
            dn: entry.dn,
            display_name: first("displayName").or_else(|| first("cn")),
            email: first("mail"),
            phone: client.phone_attributes.iter().find_map(|name| first(name)),
            groups,
            attributes,
        }
    }
}

/// Directory collaborator used by the first-factor, profile and
/// password-change steps
#[async_trait]
pub trait LdapDirectory: Send + Sync {
    /// Bind as the user
    async fn authenticate(
        &self,
        client: &ClientConfig,
        user_name: &str,
        password: &str,
    ) -> Result<BindOutcome, LdapError>;

    /// Load the user's entry; `Ok(None)` when the user does not exist
    async fn load_profile(
        &self,
        client: &ClientConfig,
        user_name: &str,
        password: Option<&str>,
    ) -> Result<Option<LdapProfile>, LdapError>;

    /// Names of every group the entry at `user_dn` belongs to, directly or
    /// through other groups
    async fn load_nested_groups(
        &self,
        client: &ClientConfig,
        user_name: &str,
        password: Option<&str>,
        user_dn: &str,
    ) -> Result<Vec<String>, LdapError>;

    async fn change_password(
        &self,
        client: &ClientConfig,
        user_name: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), LdapError>;
}

/// CN of a group DN, or the DN itself when it does not start with CN=
pub fn group_name(dn: &str) -> String {
    let first_rdn = dn.split(',').next().unwrap_or(dn).trim();
    match first_rdn.split_once('=') {
        Some((attribute, value)) if attribute.trim().eq_ignore_ascii_case("cn") => {
            value.trim().to_string()
        }
        _ => dn.to_string(),
    }
}

/// "dc=example,dc=com" -> "example.com"
fn domain_from_base_dn(base_dn: &str) -> Option<String> {
    let labels: Vec<&str> = base_dn
        .split(',')
        .filter_map(|rdn| rdn.split_once('='))
        .filter(|(attribute, _)| attribute.trim().eq_ignore_ascii_case("dc"))
        .map(|(_, value)| value.trim())
        .collect();
    if labels.is_empty() {
        None
    } else {
        Some(labels.join("."))
    }
}

/// Strip a NetBIOS "DOMAIN\" prefix
fn account_name(user_name: &str) -> &str {
    user_name.rsplit('\\').next().unwrap_or(user_name)
}

/// Map a bind result code and diagnostic message to an outcome
///
/// Active Directory reports "data 532" for an expired password and
/// "data 773" when the user must reset it.
pub fn classify_bind(rc: u32, text: &str) -> Option<BindOutcome> {
    match rc {
        0 => Some(BindOutcome::Success),
        RC_INVALID_CREDENTIALS if text.contains("data 532") || text.contains("data 773") => {
            Some(BindOutcome::MustChangePassword)
        }
        RC_INVALID_CREDENTIALS => Some(BindOutcome::InvalidCredentials),
        _ => None,
    }
}

fn is_active_directory(client: &ClientConfig) -> bool {
    client.first_factor_source == FirstFactorSource::ActiveDirectory
}

fn search_filter(client: &ClientConfig, settings: &LdapSettings, user_name: &str) -> String {
    if let Some(filter) = &settings.search_filter {
        return filter.replace("{username}", &ldap_escape(user_name));
    }
    if is_active_directory(client) {
        format!(
            "(&(objectClass=user)(|(sAMAccountName={})(userPrincipalName={})))",
            ldap_escape(account_name(user_name)),
            ldap_escape(user_name)
        )
    } else {
        format!("(uid={})", ldap_escape(user_name))
    }
}

/// Bind name for Active Directory without a service account
fn ad_bind_name(settings: &LdapSettings, user_name: &str) -> String {
    if user_name.contains('@') || user_name.contains('\\') {
        return user_name.to_string();
    }
    match domain_from_base_dn(&settings.base_dn) {
        Some(domain) => format!("{}@{}", user_name, domain),
        None => user_name.to_string(),
    }
}

/// Active Directory expects unicodePwd as the quoted password in UTF-16LE
fn unicode_pwd(password: &str) -> Vec<u8> {
    format!("\"{}\"", password)
        .encode_utf16()
        .flat_map(|unit| unit.to_le_bytes())
        .collect()
}

fn profile_attributes(client: &ClientConfig) -> Vec<String> {
    let mut attributes: Vec<String> = ["displayName", "cn", "mail", "memberOf", "userPrincipalName", "sAMAccountName", "uid"]
        .iter()
        .map(|s| s.to_string())
        .collect();
    attributes.extend(client.phone_attributes.iter().cloned());
    attributes.extend(client.identity_attribute.iter().cloned());
    attributes.extend(
        client
            .reply_attributes
            .values()
            .flatten()
            .filter_map(|rule| rule.from.clone()),
    );
    attributes.sort_unstable_by_key(|a| a.to_ascii_lowercase());
    attributes.dedup_by(|a, b| a.eq_ignore_ascii_case(b));
    attributes
}

/// `ldap3`-backed directory
#[derive(Debug, Clone, Default)]
pub struct Ldap3Directory;

impl Ldap3Directory {
    pub fn new() -> Self {
        Ldap3Directory
    }

    fn settings(client: &ClientConfig) -> Result<&LdapSettings, LdapError> {
        client
            .ldap
            .as_ref()
            .ok_or_else(|| LdapError::NotConfigured(client.name.clone()))
    }

    async fn connect(settings: &LdapSettings) -> Result<Ldap, LdapError> {
        debug!(url = %settings.url, "Creating new LDAP connection");
        let conn_settings = LdapConnSettings::new().set_conn_timeout(settings.timeout());

        let (conn, ldap) = LdapConnAsync::with_settings(conn_settings, &settings.url)
            .await
            .map_err(|e| LdapError::Connection(e.to_string()))?;

        // Start connection driver
        tokio::spawn(async move {
            if let Err(e) = conn.drive().await {
                error!("LDAP connection driver error: {}", e);
            }
        });

        Ok(ldap)
    }

    async fn bind(ldap: &mut Ldap, settings: &LdapSettings, dn: &str, password: &str) -> Result<(), LdapError> {
        ldap.with_timeout(settings.timeout())
            .simple_bind(dn, password)
            .await
            .map_err(|e| LdapError::Bind(e.to_string()))?
            .success()
            .map_err(|e| LdapError::Bind(e.to_string()))?;
        Ok(())
    }

    /// Bind for searches: service account, else the user (Active Directory), else anonymous
    async fn bind_for_search(
        ldap: &mut Ldap,
        client: &ClientConfig,
        settings: &LdapSettings,
        user_name: &str,
        password: Option<&str>,
    ) -> Result<(), LdapError> {
        if let (Some(bind_dn), Some(bind_password)) = (&settings.bind_dn, &settings.bind_password) {
            Self::bind(ldap, settings, bind_dn, bind_password).await?;
            debug!(bind_dn = %bind_dn, "Bound to LDAP with service account");
            return Ok(());
        }

        match password {
            Some(password) if is_active_directory(client) && !password.is_empty() => {
                Self::bind(ldap, settings, &ad_bind_name(settings, user_name), password).await
            }
            _ => Self::bind(ldap, settings, "", "").await,
        }
    }

    async fn search(
        ldap: &mut Ldap,
        settings: &LdapSettings,
        base: &str,
        filter: &str,
        attributes: &[String],
    ) -> Result<Vec<SearchEntry>, LdapError> {
        let (entries, _result) = ldap
            .with_timeout(settings.timeout())
            .search(base, Scope::Subtree, filter, attributes)
            .await
            .map_err(|e| LdapError::Search(e.to_string()))?
            .success()
            .map_err(|e| LdapError::Search(e.to_string()))?;

        Ok(entries.into_iter().map(SearchEntry::construct).collect())
    }

    async fn find_user(
        ldap: &mut Ldap,
        client: &ClientConfig,
        settings: &LdapSettings,
        user_name: &str,
        attributes: &[String],
    ) -> Result<Option<SearchEntry>, LdapError> {
        let filter = search_filter(client, settings, user_name);
        debug!(
            username = %user_name,
            base_dn = %settings.base_dn,
            filter = %filter,
            "Searching for user in LDAP"
        );

        let mut entries = Self::search(ldap, settings, &settings.base_dn, &filter, attributes).await?;
        if entries.len() > 1 {
            warn!(
                username = %user_name,
                count = entries.len(),
                "Multiple users found in LDAP, using first result"
            );
        }
        Ok(if entries.is_empty() { None } else { Some(entries.swap_remove(0)) })
    }

    async fn nested_groups_in_chain(
        ldap: &mut Ldap,
        settings: &LdapSettings,
        user_dn: &str,
    ) -> Result<Vec<String>, LdapError> {
        let filter = format!(
            "(&(objectClass=group)(member:{}:={}))",
            LDAP_MATCHING_RULE_IN_CHAIN,
            ldap_escape(user_dn)
        );
        let entries = Self::search(ldap, settings, &settings.base_dn, &filter, &["cn".to_string()]).await?;
        Ok(entries.iter().map(|entry| group_name(&entry.dn)).collect())
    }

    /// Breadth-first walk over `member` for directories without the
    /// in-chain matching rule
    async fn nested_groups_by_walk(
        ldap: &mut Ldap,
        settings: &LdapSettings,
        user_dn: &str,
    ) -> Result<Vec<String>, LdapError> {
        let mut seen: HashSet<String> = HashSet::new();
        let mut queue: VecDeque<(String, usize)> = VecDeque::from([(user_dn.to_string(), 0)]);
        let mut groups = Vec::new();

        while let Some((dn, depth)) = queue.pop_front() {
            if depth >= MAX_NESTING_DEPTH {
                continue;
            }
            let filter = format!(
                "(&(|(objectClass=groupOfNames)(objectClass=group))(member={}))",
                ldap_escape(&dn)
            );
            for entry in Self::search(ldap, settings, &settings.base_dn, &filter, &["cn".to_string()]).await? {
                if seen.insert(entry.dn.to_ascii_lowercase()) {
                    groups.push(group_name(&entry.dn));
                    queue.push_back((entry.dn, depth + 1));
                }
            }
        }

        Ok(groups)
    }
}

#[async_trait]
impl LdapDirectory for Ldap3Directory {
    async fn authenticate(
        &self,
        client: &ClientConfig,
        user_name: &str,
        password: &str,
    ) -> Result<BindOutcome, LdapError> {
        let settings = Self::settings(client)?;

        // An empty password would be an unauthenticated bind that succeeds
        if password.is_empty() {
            return Ok(BindOutcome::InvalidCredentials);
        }

        let mut ldap = Self::connect(settings).await?;

        let bind_name = if settings.bind_dn.is_none() && is_active_directory(client) {
            ad_bind_name(settings, user_name)
        } else {
            Self::bind_for_search(&mut ldap, client, settings, user_name, None).await?;
            match Self::find_user(&mut ldap, client, settings, user_name, &["dn".to_string()]).await? {
                Some(entry) => entry.dn,
                None => {
                    warn!(username = %user_name, "User not found in LDAP");
                    let _ = ldap.unbind().await;
                    return Ok(BindOutcome::InvalidCredentials);
                }
            }
        };

        debug!(dn = %bind_name, "Attempting LDAP bind for user");
        let result = ldap
            .with_timeout(settings.timeout())
            .simple_bind(&bind_name, password)
            .await
            .map_err(|e| LdapError::Bind(e.to_string()))?;
        let _ = ldap.unbind().await;

        match classify_bind(result.rc, &result.text) {
            Some(BindOutcome::Success) => {
                info!(dn = %bind_name, "LDAP authentication successful");
                Ok(BindOutcome::Success)
            }
            Some(outcome) => {
                warn!(dn = %bind_name, rc = result.rc, text = %result.text, "LDAP bind failed");
                Ok(outcome)
            }
            None => Err(LdapError::Bind(format!("rc={} {}", result.rc, result.text))),
        }
    }

    async fn load_profile(
        &self,
        client: &ClientConfig,
        user_name: &str,
        password: Option<&str>,
    ) -> Result<Option<LdapProfile>, LdapError> {
        let settings = Self::settings(client)?;
        let mut ldap = Self::connect(settings).await?;
        Self::bind_for_search(&mut ldap, client, settings, user_name, password).await?;

        let entry = Self::find_user(&mut ldap, client, settings, user_name, &profile_attributes(client)).await?;
        let _ = ldap.unbind().await;

        let profile = entry.map(|entry| LdapProfile::from_entry(entry, client));
        if let Some(profile) = &profile {
            debug!(
                username = %user_name,
                dn = %profile.dn,
                groups = profile.groups.len(),
                "Loaded LDAP profile"
            );
        }
        Ok(profile)
    }

    async fn load_nested_groups(
        &self,
        client: &ClientConfig,
        user_name: &str,
        password: Option<&str>,
        user_dn: &str,
    ) -> Result<Vec<String>, LdapError> {
        let settings = Self::settings(client)?;
        let mut ldap = Self::connect(settings).await?;
        Self::bind_for_search(&mut ldap, client, settings, user_name, password).await?;

        let groups = if is_active_directory(client) {
            Self::nested_groups_in_chain(&mut ldap, settings, user_dn).await
        } else {
            Self::nested_groups_by_walk(&mut ldap, settings, user_dn).await
        };
        let _ = ldap.unbind().await;
        groups
    }

    async fn change_password(
        &self,
        client: &ClientConfig,
        user_name: &str,
        current_password: &str,
        new_password: &str,
    ) -> Result<(), LdapError> {
        let settings = Self::settings(client)?;
        let mut ldap = Self::connect(settings).await?;
        // The user's own bind is refused while the password is expired
        Self::bind_for_search(&mut ldap, client, settings, user_name, None).await?;

        let dn = Self::find_user(&mut ldap, client, settings, user_name, &["dn".to_string()])
            .await?
            .map(|entry| entry.dn)
            .ok_or_else(|| LdapError::UserNotFound(user_name.to_string()))?;

        let result = if is_active_directory(client) {
            if settings.url.starts_with("ldap://") {
                warn!(url = %settings.url, "Active Directory refuses password changes without TLS");
            }
            let attribute = b"unicodePwd".to_vec();
            let changes = vec![
                Mod::Delete(attribute.clone(), HashSet::from([unicode_pwd(current_password)])),
                Mod::Add(attribute, HashSet::from([unicode_pwd(new_password)])),
            ];
            ldap.with_timeout(settings.timeout())
                .modify(&dn, changes)
                .await
                .map_err(|e| LdapError::PasswordChange(e.to_string()))?
        } else {
            let exop = PasswordModify {
                user_id: Some(&dn),
                old_pass: Some(current_password),
                new_pass: Some(new_password),
            };
            ldap.with_timeout(settings.timeout())
                .extended(exop)
                .await
                .map_err(|e| LdapError::PasswordChange(e.to_string()))?
                .1
        };
        let _ = ldap.unbind().await;

        result
            .success()
            .map_err(|e| LdapError::PasswordChange(e.to_string()))?;
        info!(dn = %dn, "Password changed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::tests::test_client;

    fn ldap_settings() -> LdapSettings {
        LdapSettings {
            url: "ldap://localhost:389".to_string(),
            base_dn: "dc=example,dc=com".to_string(),
            bind_dn: None,
            bind_password: None,
            search_filter: None,
            timeout: 10,
        }
    }

    #[test]
    fn test_classify_bind() {
        assert_eq!(classify_bind(0, ""), Some(BindOutcome::Success));
        assert_eq!(
            classify_bind(49, "80090308: LdapErr: DSID-0C09044E, comment: AcceptSecurityContext error, data 52e, v4563"),
            Some(BindOutcome::InvalidCredentials)
        );
        assert_eq!(
            classify_bind(49, "80090308: LdapErr: DSID-0C09044E, comment: AcceptSecurityContext error, data 773, v4563"),
            Some(BindOutcome::MustChangePassword)
        );
        assert_eq!(classify_bind(49, "... data 532, v4563"), Some(BindOutcome::MustChangePassword));
        assert_eq!(classify_bind(52, "unavailable"), None);
    }

    #[test]
    fn test_group_name() {
        assert_eq!(group_name("CN=VPN Users,OU=Groups,DC=example,DC=com"), "VPN Users");
        assert_eq!(group_name("cn=admins,ou=groups,dc=example,dc=com"), "admins");
        assert_eq!(group_name("ou=people"), "ou=people");
    }

    #[test]
    fn test_domain_from_base_dn() {
        assert_eq!(domain_from_base_dn("DC=corp,DC=example,DC=com").as_deref(), Some("corp.example.com"));
        assert_eq!(domain_from_base_dn("o=example"), None);
    }

    #[test]
    fn test_ad_bind_name() {
        let settings = ldap_settings();
        assert_eq!(ad_bind_name(&settings, "alice"), "alice@example.com");
        assert_eq!(ad_bind_name(&settings, "alice@corp.local"), "alice@corp.local");
        assert_eq!(ad_bind_name(&settings, "CORP\\alice"), "CORP\\alice");
    }

    #[test]
    fn test_search_filter() {
        let settings = ldap_settings();

        let mut client = test_client("nas");
        client.first_factor_source = FirstFactorSource::ActiveDirectory;
        assert_eq!(
            search_filter(&client, &settings, "CORP\\alice"),
            "(&(objectClass=user)(|(sAMAccountName=alice)(userPrincipalName=CORP\\5calice)))"
        );

        client.first_factor_source = FirstFactorSource::Ldap;
        assert_eq!(search_filter(&client, &settings, "bob*"), "(uid=bob\\2a)");

        let mut custom = ldap_settings();
        custom.search_filter = Some("(mail={username})".to_string());
        assert_eq!(search_filter(&client, &custom, "bob@example.com"), "(mail=bob@example.com)");
    }

    #[test]
    fn test_unicode_pwd() {
        assert_eq!(unicode_pwd("ab"), vec![b'"', 0, b'a', 0, b'b', 0, b'"', 0]);
    }

    #[test]
    fn test_profile_groups_and_attributes() {
        let mut profile = LdapProfile::new("CN=Alice,DC=example,DC=com")
            .with_attribute("employeeID", vec!["E-100".to_string()]);
        profile.add_groups(vec!["VPN Users".to_string(), "vpn users".to_string(), "Admins".to_string()]);

        assert_eq!(profile.groups.len(), 2);
        assert!(profile.is_member_of("vpn USERS"));
        assert!(profile.is_member_of_any(&["Nobody".to_string(), "admins".to_string()]));
        assert_eq!(profile.attribute("EMPLOYEEID"), Some("E-100"));
        assert!(profile.attribute("missing").is_none());
    }

    #[test]
    fn test_profile_attributes_include_configured_sources() {
        let mut client = test_client("nas");
        client.identity_attribute = Some("userPrincipalName".to_string());
        client.reply_attributes.insert(
            "Class".to_string(),
            vec![crate::config::ReplyAttributeRule {
                from: Some("department".to_string()),
                ..Default::default()
            }],
        );

        let attributes = profile_attributes(&client);
        assert!(attributes.iter().any(|a| a == "department"));
        assert!(attributes.iter().any(|a| a == "mobile"));
        assert_eq!(
            attributes.iter().filter(|a| a.eq_ignore_ascii_case("userPrincipalName")).count(),
            1
        );
    }
}
