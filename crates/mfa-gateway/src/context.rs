//! Per-request state threaded through the pipeline

use crate::config::ClientConfig;
use crate::ldap::LdapProfile;
use crate::passphrase::Passphrase;
use radius_codec::{microsoft, AttributeType, AttributeValue, RadiusPacket};
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tracing::debug;

/// Marker Cisco ACS puts in User-Name when downloading an ACL
const ACL_REQUEST_MARKER: &str = "#ACSACL#";

/// Outcome of one authentication factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthenticationStatus {
    #[default]
    Awaiting,
    Accept,
    Reject,
    Bypass,
}

impl AuthenticationStatus {
    pub fn is_resolved(self) -> bool {
        self != AuthenticationStatus::Awaiting
    }

    /// Accept or Bypass
    pub fn is_passed(self) -> bool {
        matches!(self, AuthenticationStatus::Accept | AuthenticationStatus::Bypass)
    }
}

impl fmt::Display for AuthenticationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AuthenticationStatus::Awaiting => "Awaiting",
            AuthenticationStatus::Accept => "Accept",
            AuthenticationStatus::Reject => "Reject",
            AuthenticationStatus::Bypass => "Bypass",
        };
        f.write_str(name)
    }
}

/// First and second factor outcome
///
/// A factor starts out `Awaiting` and, once resolved, keeps its value.
/// A denial overrides both factors whatever they hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AuthenticationState {
    first_factor: AuthenticationStatus,
    second_factor: AuthenticationStatus,
    denied: bool,
}

impl AuthenticationState {
    pub fn first_factor(&self) -> AuthenticationStatus {
        self.first_factor
    }

    pub fn second_factor(&self) -> AuthenticationStatus {
        self.second_factor
    }

    /// Returns false when the factor was already resolved
    pub fn set_first_factor(&mut self, status: AuthenticationStatus) -> bool {
        Self::resolve(&mut self.first_factor, status, "first")
    }

    /// Returns false when the factor was already resolved
    pub fn set_second_factor(&mut self, status: AuthenticationStatus) -> bool {
        Self::resolve(&mut self.second_factor, status, "second")
    }

    fn resolve(slot: &mut AuthenticationStatus, status: AuthenticationStatus, factor: &str) -> bool {
        if slot.is_resolved() {
            if *slot != status {
                debug!(factor, current = %slot, requested = %status, "Ignoring change of a resolved factor");
            }
            return false;
        }
        *slot = status;
        true
    }

    /// Reject the request regardless of factors already resolved
    pub fn deny(&mut self) {
        self.set_first_factor(AuthenticationStatus::Reject);
        self.set_second_factor(AuthenticationStatus::Reject);
        self.denied = true;
    }

    /// Both factors passed and nothing denied the request
    pub fn is_accepted(&self) -> bool {
        !self.is_rejected() && self.first_factor.is_passed() && self.second_factor.is_passed()
    }

    pub fn is_rejected(&self) -> bool {
        self.denied
            || self.first_factor == AuthenticationStatus::Reject
            || self.second_factor == AuthenticationStatus::Reject
    }
}

/// How the NAS transported the user's credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthenticationType {
    Pap,
    Chap,
    MsChap,
    MsChap2,
    Eap,
    Unknown,
}

impl AuthenticationType {
    pub fn detect(request: &RadiusPacket) -> Self {
        if request.has_attribute(AttributeType::UserPassword.name()) {
            AuthenticationType::Pap
        } else if request.has_attribute(microsoft::MS_CHAP2_RESPONSE) {
            AuthenticationType::MsChap2
        } else if request.has_attribute(microsoft::MS_CHAP_RESPONSE) {
            AuthenticationType::MsChap
        } else if request.has_attribute(AttributeType::ChapPassword.name()) {
            AuthenticationType::Chap
        } else if request.has_attribute(AttributeType::EapMessage.name()) {
            AuthenticationType::Eap
        } else {
            AuthenticationType::Unknown
        }
    }
}

/// What goes into the response besides the code
#[derive(Debug, Clone, Default)]
pub struct ResponseInformation {
    pub reply_message: Option<String>,
    /// State for an Access-Challenge
    pub state: Option<String>,
    /// Reply of the upstream RADIUS first factor
    pub upstream_reply: Option<RadiusPacket>,
}

/// Pipeline control flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExecutionState {
    is_terminated: bool,
    should_skip_response: bool,
}

impl ExecutionState {
    pub fn terminate(&mut self) {
        self.is_terminated = true;
    }

    /// Terminate without answering the NAS
    pub fn skip_response(&mut self) {
        self.is_terminated = true;
        self.should_skip_response = true;
    }

    pub fn is_terminated(&self) -> bool {
        self.is_terminated
    }

    pub fn should_skip_response(&self) -> bool {
        self.should_skip_response
    }
}

/// Working state of one request
///
/// Created per datagram and owned by the pipeline run; a clone is parked in
/// the challenge registry while an Access-Challenge is outstanding.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub request: RadiusPacket,
    /// NAS address (NAS-IP-Address when the request came through a proxy)
    pub remote_endpoint: SocketAddr,
    /// Sender, when it is a RADIUS proxy rather than the NAS itself
    pub proxy_endpoint: Option<SocketAddr>,
    pub client: Arc<ClientConfig>,
    pub profile: Option<LdapProfile>,
    pub passphrase: Passphrase,
    /// User-Name after transformation rules
    pub user_name: Option<String>,
    /// The directory refused the password until it is changed
    pub must_change_password: bool,
    pub authentication_state: AuthenticationState,
    pub response_information: ResponseInformation,
    pub execution_state: ExecutionState,
}

impl ExecutionContext {
    pub fn new(request: RadiusPacket, source: SocketAddr, client: Arc<ClientConfig>) -> Self {
        let passphrase = Passphrase::parse(request.user_password(), client.pre_authentication_method);
        let user_name = request.user_name().filter(|name| !name.is_empty());

        let (remote_endpoint, proxy_endpoint) = if request.has_attribute(AttributeType::ProxyState.name()) {
            let nas_ip = request
                .attribute(AttributeType::NasIpAddress.name())
                .and_then(AttributeValue::as_ipv4)
                .map(IpAddr::V4);
            match nas_ip {
                Some(ip) => (SocketAddr::new(ip, 0), Some(source)),
                None => (source, Some(source)),
            }
        } else {
            (source, None)
        };

        ExecutionContext {
            request,
            remote_endpoint,
            proxy_endpoint,
            client,
            profile: None,
            passphrase,
            user_name,
            must_change_password: false,
            authentication_state: AuthenticationState::default(),
            response_information: ResponseInformation::default(),
            execution_state: ExecutionState::default(),
        }
    }

    pub fn client_name(&self) -> &str {
        &self.client.name
    }

    pub fn user_name(&self) -> Option<&str> {
        self.user_name.as_deref()
    }

    pub fn authentication_type(&self) -> AuthenticationType {
        AuthenticationType::detect(&self.request)
    }

    /// Calling-Station-Id, or the attribute configured in its place
    pub fn calling_station_id(&self) -> Option<String> {
        let name = self
            .client
            .calling_station_id_attribute
            .as_deref()
            .unwrap_or(AttributeType::CallingStationId.name());
        self.request
            .attribute_text(name)
            .filter(|value| !value.is_empty())
    }

    pub fn called_station_id(&self) -> Option<String> {
        self.request
            .attribute_text(AttributeType::CalledStationId.name())
            .filter(|value| !value.is_empty())
    }

    /// State attribute of the request as text
    pub fn request_state(&self) -> Option<String> {
        self.request
            .state()
            .map(|state| String::from_utf8_lossy(&state).into_owned())
            .filter(|state| !state.is_empty())
    }

    /// Identity presented to the MFA API
    pub fn second_factor_identity(&self) -> Option<String> {
        let identity = match &self.client.identity_attribute {
            Some(attribute) => self
                .profile
                .as_ref()
                .and_then(|profile| profile.attribute(attribute))
                .map(str::to_string),
            None => self.user_name.clone(),
        };
        identity.filter(|identity| !identity.trim().is_empty())
    }

    /// Cisco ACS downloadable ACL request
    pub fn is_acl_request(&self) -> bool {
        self.user_name
            .as_deref()
            .is_some_and(|name| name.contains(ACL_REQUEST_MARKER))
    }

    pub fn terminate(&mut self) {
        self.execution_state.terminate();
    }

    pub fn skip_response(&mut self) {
        self.execution_state.skip_response();
    }

    /// Reject and stop the pipeline
    pub fn reject(&mut self, reply_message: Option<&str>) {
        self.authentication_state.deny();
        if let Some(message) = reply_message {
            self.response_information.reply_message = Some(message.to_string());
        }
        self.terminate();
    }
}
