use crate::mfa::PrivacyMode;
use ipnetwork::IpNetwork;
use rand::Rng;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Parse error: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Where the first factor is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FirstFactorSource {
    ActiveDirectory,
    Ldap,
    /// Forwarded to an upstream RADIUS server
    Radius,
    /// Second factor only
    None,
}

/// How the second factor may be supplied in the first request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PreAuthenticationMethod {
    #[default]
    None,
    /// Six-digit OTP appended to the password
    Otp,
}

/// Directory connection settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LdapSettings {
    /// LDAP server URL (e.g., "ldap://dc1.example.com:389" or "ldaps://dc1.example.com:636")
    pub url: String,

    /// Base DN for user and group searches (e.g., "dc=example,dc=com")
    pub base_dn: String,

    /// Service account used for searches and profile loading
    #[serde(default)]
    pub bind_dn: Option<String>,

    #[serde(default)]
    pub bind_password: Option<String>,

    /// User search filter; `{username}` is replaced with the escaped user name
    #[serde(default)]
    pub search_filter: Option<String>,

    /// Connection timeout in seconds
    #[serde(default = "default_ldap_timeout")]
    pub timeout: u64,
}

fn default_ldap_timeout() -> u64 {
    10
}

impl LdapSettings {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Upstream RADIUS server for the `Radius` first-factor source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamSettings {
    /// host:port of the upstream server
    pub address: String,
    pub secret: String,
    /// Response timeout in seconds
    #[serde(default = "default_upstream_timeout")]
    pub timeout: u64,
}

fn default_upstream_timeout() -> u64 {
    5
}

impl UpstreamSettings {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        self.address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("Invalid upstream address: {}", self.address)))
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }
}

/// Regex rewrite applied to User-Name before any factor is checked
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserNameTransformRule {
    pub pattern: String,
    pub replacement: String,
}

impl UserNameTransformRule {
    pub fn compile(&self) -> Result<Regex, ConfigError> {
        Regex::new(&self.pattern).map_err(|e| {
            ConfigError::Invalid(format!("Invalid user name pattern '{}': {}", self.pattern, e))
        })
    }
}

/// One candidate value of a custom Access-Accept attribute
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplyAttributeRule {
    /// Literal value
    #[serde(default)]
    pub value: Option<String>,
    /// Directory attribute the value is read from
    #[serde(default)]
    pub from: Option<String>,
    /// "UserGroup=a;b" or "UserName=alice;bob"; absent means always
    #[serde(default)]
    pub when: Option<String>,
    /// Stop at this rule when it matches
    #[serde(default)]
    pub sufficient: bool,
}

/// Condition of a [`ReplyAttributeRule`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplyCondition {
    Always,
    UserGroup(Vec<String>),
    UserName(Vec<String>),
}

impl ReplyAttributeRule {
    pub fn condition(&self) -> Result<ReplyCondition, ConfigError> {
        let when = match self.when.as_deref().map(str::trim) {
            None | Some("") => return Ok(ReplyCondition::Always),
            Some(when) => when,
        };

        let (kind, list) = when
            .split_once('=')
            .ok_or_else(|| ConfigError::Invalid(format!("Invalid reply attribute condition: {}", when)))?;
        let values: Vec<String> = list
            .split(';')
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(str::to_string)
            .collect();

        match kind.trim().to_ascii_lowercase().as_str() {
            "usergroup" => Ok(ReplyCondition::UserGroup(values)),
            "username" => Ok(ReplyCondition::UserName(values)),
            other => Err(ConfigError::Invalid(format!(
                "Unknown reply attribute condition '{}'",
                other
            ))),
        }
    }
}

/// Randomized delay before an Access-Reject, in seconds
///
/// Written as "3" or "2-5" in configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DelayRange {
    pub min: u64,
    pub max: u64,
}

impl DelayRange {
    pub fn is_zero(&self) -> bool {
        self.max == 0
    }

    /// A random duration within the range, millisecond resolution
    pub fn sample(&self) -> Duration {
        if self.is_zero() {
            return Duration::ZERO;
        }
        let millis = rand::rng().random_range(self.min * 1000..=self.max * 1000);
        Duration::from_millis(millis)
    }
}

impl TryFrom<String> for DelayRange {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        if value.is_empty() {
            return Ok(DelayRange::default());
        }
        let parse = |s: &str| {
            s.trim()
                .parse::<u64>()
                .map_err(|_| format!("invalid delay '{}'", value))
        };
        let (min, max) = match value.split_once('-') {
            Some((min, max)) => (parse(min)?, parse(max)?),
            None => {
                let exact = parse(value)?;
                (exact, exact)
            }
        };
        if min > max {
            return Err(format!("invalid delay range '{}'", value));
        }
        Ok(DelayRange { min, max })
    }
}

impl From<DelayRange> for String {
    fn from(value: DelayRange) -> Self {
        value.to_string()
    }
}

impl fmt::Display for DelayRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.min == self.max {
            write!(f, "{}", self.min)
        } else {
            write!(f, "{}-{}", self.min, self.max)
        }
    }
}

/// Per-NAS client configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Name used in logs, cache keys and challenge identifiers
    pub name: String,

    /// Client IP address or network (supports CIDR notation)
    #[serde(default)]
    pub address: Option<String>,

    /// Matched against the NAS-Identifier attribute
    #[serde(default)]
    pub nas_identifier: Option<String>,

    /// Shared secret for this client
    pub secret: String,

    pub first_factor_source: FirstFactorSource,

    #[serde(default)]
    pub ldap: Option<LdapSettings>,

    #[serde(default)]
    pub upstream: Option<UpstreamSettings>,

    /// MFA API credentials
    pub api_key: String,
    pub api_secret: String,

    #[serde(default)]
    pub bypass_second_factor_when_api_unreachable: bool,

    /// "None", "Full" or "Partial:Name,Email,Phone,CallingStationId"
    #[serde(default)]
    pub privacy_mode: PrivacyMode,

    /// Seconds a granted second factor is remembered; 0 disables
    #[serde(default)]
    pub authentication_cache_lifetime: u64,

    /// Cache by identity only, ignoring Calling-Station-Id
    #[serde(default)]
    pub authentication_cache_minimal_matching: bool,

    #[serde(default)]
    pub invalid_credential_delay: DelayRange,

    #[serde(default)]
    pub pre_authentication_method: PreAuthenticationMethod,

    /// Passed to the MFA API for inline enrollment
    #[serde(default)]
    pub sign_up_groups: Option<String>,

    /// Directory attribute used as the second-factor identity instead of User-Name
    #[serde(default)]
    pub identity_attribute: Option<String>,

    /// Directory attributes holding the phone number, first match wins
    #[serde(default = "default_phone_attributes")]
    pub phone_attributes: Vec<String>,

    /// Members of at least one of these groups may log in
    #[serde(default)]
    pub access_groups: Vec<String>,

    /// Only members of these groups get a second factor
    #[serde(default)]
    pub second_factor_groups: Vec<String>,

    /// Members of these groups skip the second factor
    #[serde(default)]
    pub bypass_second_factor_groups: Vec<String>,

    #[serde(default)]
    pub load_nested_groups: bool,

    /// Request attribute used as Calling-Station-Id instead of the standard one
    #[serde(default)]
    pub calling_station_id_attribute: Option<String>,

    #[serde(default)]
    pub user_name_transform: Vec<UserNameTransformRule>,

    /// Offer a password change challenge when the directory requires one
    #[serde(default)]
    pub password_change_enabled: bool,

    /// Attribute name -> candidate values added to Access-Accept
    #[serde(default)]
    pub reply_attributes: BTreeMap<String, Vec<ReplyAttributeRule>>,
}

fn default_phone_attributes() -> Vec<String> {
    vec!["mobile".to_string(), "telephoneNumber".to_string()]
}

impl ClientConfig {
    /// Parse the client address as an IP network
    pub fn parse_network(&self) -> Result<Option<IpNetwork>, ConfigError> {
        let address = match self.address.as_deref() {
            Some(address) => address,
            None => return Ok(None),
        };

        // Try to parse as CIDR notation first
        if let Ok(network) = address.parse::<IpNetwork>() {
            return Ok(Some(network));
        }

        // Try to parse as a single IP address
        if let Ok(ip) = address.parse::<IpAddr>() {
            return Ok(Some(IpNetwork::from(ip)));
        }

        Err(ConfigError::Invalid(format!(
            "Invalid client address: {}",
            address
        )))
    }

    /// Check if a source IP address matches this client
    pub fn matches_address(&self, source_ip: IpAddr) -> bool {
        matches!(self.parse_network(), Ok(Some(network)) if network.contains(source_ip))
    }

    pub fn matches_nas_identifier(&self, nas_identifier: &str) -> bool {
        self.nas_identifier
            .as_deref()
            .is_some_and(|id| id.eq_ignore_ascii_case(nas_identifier))
    }

    /// Get the shared secret for this client
    pub fn get_secret(&self) -> &[u8] {
        self.secret.as_bytes()
    }

    pub fn authentication_cache_lifetime(&self) -> Duration {
        Duration::from_secs(self.authentication_cache_lifetime)
    }

    pub fn uses_directory(&self) -> bool {
        matches!(
            self.first_factor_source,
            FirstFactorSource::ActiveDirectory | FirstFactorSource::Ldap
        )
    }

    /// Profile attributes must be loaded from the directory
    pub fn needs_profile(&self) -> bool {
        self.ldap.is_some()
            && (self.uses_directory()
                || self.identity_attribute.is_some()
                || !self.access_groups.is_empty()
                || !self.second_factor_groups.is_empty()
                || !self.bypass_second_factor_groups.is_empty())
    }

    /// Group policies are configured
    pub fn checks_groups(&self) -> bool {
        !self.access_groups.is_empty()
            || !self.second_factor_groups.is_empty()
            || !self.bypass_second_factor_groups.is_empty()
            || self
                .reply_attributes
                .values()
                .flatten()
                .any(|rule| matches!(rule.condition(), Ok(ReplyCondition::UserGroup(_))))
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.name.is_empty() {
            return Err(ConfigError::Invalid("Client has empty name".to_string()));
        }
        if self.secret.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "Client {} has empty secret",
                self.name
            )));
        }
        if self.address.is_none() && self.nas_identifier.is_none() {
            return Err(ConfigError::Invalid(format!(
                "Client {} needs an address or a nas_identifier",
                self.name
            )));
        }
        self.parse_network()?;

        if self.api_key.is_empty() || self.api_secret.is_empty() {
            return Err(ConfigError::Invalid(format!(
                "Client {} has empty API credentials",
                self.name
            )));
        }

        match self.first_factor_source {
            FirstFactorSource::ActiveDirectory | FirstFactorSource::Ldap if self.ldap.is_none() => {
                return Err(ConfigError::Invalid(format!(
                    "Client {} uses a directory first factor without ldap settings",
                    self.name
                )));
            }
            FirstFactorSource::Radius => {
                let upstream = self.upstream.as_ref().ok_or_else(|| {
                    ConfigError::Invalid(format!(
                        "Client {} uses a RADIUS first factor without upstream settings",
                        self.name
                    ))
                })?;
                upstream.socket_addr()?;
                if upstream.secret.is_empty() {
                    return Err(ConfigError::Invalid(format!(
                        "Client {} has empty upstream secret",
                        self.name
                    )));
                }
            }
            _ => {}
        }

        if self.checks_groups() && self.ldap.is_none() {
            return Err(ConfigError::Invalid(format!(
                "Client {} has group policies without ldap settings",
                self.name
            )));
        }

        for rule in &self.user_name_transform {
            rule.compile()?;
        }

        for (name, rules) in &self.reply_attributes {
            for rule in rules {
                if rule.value.is_none() && rule.from.is_none() {
                    return Err(ConfigError::Invalid(format!(
                        "Reply attribute {} of client {} needs a value or a source attribute",
                        name, self.name
                    )));
                }
                rule.condition()?;
            }
        }

        Ok(())
    }
}

/// Gateway configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Server listen address
    #[serde(default = "default_listen_address")]
    pub listen_address: String,

    /// Server listen port
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,

    /// Log level: "trace", "debug", "info", "warn", "error" (default: "info")
    #[serde(default)]
    pub log_level: Option<String>,

    /// Base URL of the MFA API
    pub api_url: String,

    /// MFA API timeout in seconds
    #[serde(default = "default_api_timeout")]
    pub api_timeout: u64,

    /// FreeRADIUS-format dictionary merged over the built-in one
    #[serde(default)]
    pub dictionary_path: Option<String>,

    /// Seconds an unanswered Access-Challenge is kept
    #[serde(default = "default_challenge_ttl")]
    pub challenge_ttl: u64,

    /// List of NAS clients
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

fn default_listen_address() -> String {
    "0.0.0.0".to_string()
}

fn default_listen_port() -> u16 {
    1812 // Standard RADIUS authentication port
}

fn default_api_timeout() -> u64 {
    15
}

fn default_challenge_ttl() -> u64 {
    300
}

impl Config {
    /// Load configuration from a JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = fs::read_to_string(path)?;
        let config: Config = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Save configuration to a JSON file
    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<(), ConfigError> {
        let contents = serde_json::to_string_pretty(self)?;
        fs::write(path, contents)?;
        Ok(())
    }

    /// Get socket address for binding
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr: IpAddr = self
            .listen_address
            .parse()
            .map_err(|_| ConfigError::Invalid(format!("Invalid IP address: {}", self.listen_address)))?;
        Ok(SocketAddr::new(addr, self.listen_port))
    }

    pub fn api_timeout(&self) -> Duration {
        Duration::from_secs(self.api_timeout)
    }

    pub fn challenge_ttl(&self) -> Duration {
        Duration::from_secs(self.challenge_ttl)
    }

    /// Find the client for a request
    ///
    /// A NAS-Identifier match wins over an address match, so several NAS
    /// behind one address can carry different settings.
    pub fn find_client(&self, source_ip: IpAddr, nas_identifier: Option<&str>) -> Option<&ClientConfig> {
        if let Some(nas_identifier) = nas_identifier {
            if let Some(client) = self
                .clients
                .iter()
                .find(|client| client.matches_nas_identifier(nas_identifier))
            {
                return Some(client);
            }
        }

        self.clients
            .iter()
            .filter(|client| client.nas_identifier.is_none())
            .find(|client| client.matches_address(source_ip))
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.socket_addr()?;

        if self.listen_port == 0 {
            return Err(ConfigError::Invalid("Port cannot be 0".to_string()));
        }
        if !self.api_url.starts_with("http://") && !self.api_url.starts_with("https://") {
            return Err(ConfigError::Invalid(format!("Invalid api_url: {}", self.api_url)));
        }
        if self.api_timeout == 0 {
            return Err(ConfigError::Invalid("api_timeout cannot be 0".to_string()));
        }
        if self.challenge_ttl == 0 {
            return Err(ConfigError::Invalid("challenge_ttl cannot be 0".to_string()));
        }

        for client in &self.clients {
            client.validate()?;
        }

        let mut names: Vec<&str> = self.clients.iter().map(|c| c.name.as_str()).collect();
        names.sort_unstable();
        if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
            return Err(ConfigError::Invalid(format!(
                "Duplicate client name: {}",
                pair[0]
            )));
        }

        Ok(())
    }

    /// Create an example configuration file
    pub fn example() -> Self {
        let mut reply_attributes = BTreeMap::new();
        reply_attributes.insert(
            "Fortinet-Group-Name".to_string(),
            vec![ReplyAttributeRule {
                value: Some("Users".to_string()),
                when: Some("UserGroup=VPN Users".to_string()),
                ..Default::default()
            }],
        );

        Config {
            listen_address: default_listen_address(),
            listen_port: default_listen_port(),
            log_level: Some("info".to_string()),
            api_url: "https://api.mfa.example.com".to_string(),
            api_timeout: default_api_timeout(),
            dictionary_path: None,
            challenge_ttl: default_challenge_ttl(),
            clients: vec![
                ClientConfig {
                    name: "VPN Gateway".to_string(),
                    address: Some("10.0.0.1".to_string()),
                    nas_identifier: None,
                    secret: "client_secret_1".to_string(),
                    first_factor_source: FirstFactorSource::ActiveDirectory,
                    ldap: Some(LdapSettings {
                        url: "ldap://dc1.example.com:389".to_string(),
                        base_dn: "dc=example,dc=com".to_string(),
                        bind_dn: Some("cn=radius,ou=Service,dc=example,dc=com".to_string()),
                        bind_password: Some("service_password".to_string()),
                        search_filter: None,
                        timeout: default_ldap_timeout(),
                    }),
                    upstream: None,
                    api_key: "api_key".to_string(),
                    api_secret: "api_secret".to_string(),
                    bypass_second_factor_when_api_unreachable: true,
                    privacy_mode: PrivacyMode::None,
                    authentication_cache_lifetime: 0,
                    authentication_cache_minimal_matching: false,
                    invalid_credential_delay: DelayRange { min: 2, max: 5 },
                    pre_authentication_method: PreAuthenticationMethod::None,
                    sign_up_groups: None,
                    identity_attribute: None,
                    phone_attributes: default_phone_attributes(),
                    access_groups: vec!["VPN Users".to_string()],
                    second_factor_groups: vec![],
                    bypass_second_factor_groups: vec![],
                    load_nested_groups: true,
                    calling_station_id_attribute: None,
                    user_name_transform: vec![UserNameTransformRule {
                        pattern: r"^EXAMPLE\\(.+)$".to_string(),
                        replacement: "$1".to_string(),
                    }],
                    password_change_enabled: true,
                    reply_attributes,
                },
                ClientConfig {
                    name: "Wi-Fi Controller".to_string(),
                    address: Some("192.168.1.0/24".to_string()),
                    nas_identifier: None,
                    secret: "client_secret_2".to_string(),
                    first_factor_source: FirstFactorSource::Radius,
                    ldap: None,
                    upstream: Some(UpstreamSettings {
                        address: "192.168.1.5:1812".to_string(),
                        secret: "upstream_secret".to_string(),
                        timeout: default_upstream_timeout(),
                    }),
                    api_key: "api_key".to_string(),
                    api_secret: "api_secret".to_string(),
                    bypass_second_factor_when_api_unreachable: false,
                    privacy_mode: PrivacyMode::Full,
                    authentication_cache_lifetime: 3600,
                    authentication_cache_minimal_matching: false,
                    invalid_credential_delay: DelayRange { min: 3, max: 3 },
                    pre_authentication_method: PreAuthenticationMethod::None,
                    sign_up_groups: None,
                    identity_attribute: None,
                    phone_attributes: default_phone_attributes(),
                    access_groups: vec![],
                    second_factor_groups: vec![],
                    bypass_second_factor_groups: vec![],
                    load_nested_groups: false,
                    calling_station_id_attribute: None,
                    user_name_transform: vec![],
                    password_change_enabled: false,
                    reply_attributes: BTreeMap::new(),
                },
            ],
        }
    }
}
