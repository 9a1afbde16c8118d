//! Gateway error types

use crate::config::ConfigError;
use crate::ldap::LdapError;
use crate::mfa::MfaApiError;
use crate::upstream::UpstreamError;
use radius_codec::{DictionaryError, PacketError};
use thiserror::Error;

/// Errors surfacing from the pipeline and the server loop
#[derive(Error, Debug)]
pub enum GatewayError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// RADIUS packet encoding/decoding error
    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Dictionary error: {0}")]
    Dictionary(#[from] DictionaryError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Directory error: {0}")]
    Ldap(#[from] LdapError),

    #[error("Upstream RADIUS error: {0}")]
    Upstream(#[from] UpstreamError),

    #[error("MFA API error: {0}")]
    MfaApi(#[from] MfaApiError),

    /// Challenge bookkeeping failed (e.g. no processor for a stored exchange)
    #[error("Challenge error: {0}")]
    Challenge(String),
}
