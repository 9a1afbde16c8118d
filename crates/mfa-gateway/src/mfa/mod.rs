//! Second factor: MFA API client, authenticated-client cache and privacy
//! redaction

pub mod api;
pub mod cache;
pub mod gateway;
pub mod privacy;

pub use api::{
    AccessRequest, AccessRequestResponse, ApiCredentials, ChallengeRequest, HttpMultifactorApi, MfaApiError,
    MultifactorApi, RequestStatus,
};
pub use cache::AuthenticatedClientCache;
pub use gateway::SecondFactorGateway;
pub use privacy::{PrivacyField, PrivacyMode};
