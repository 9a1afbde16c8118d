//! RADIUS Second-Factor Gateway
//!
//! A RADIUS server that sits between network access servers and the
//! systems that check credentials. The first factor is checked against
//! Active Directory / LDAP or forwarded to another RADIUS server; the second
//! factor is requested from a cloud MFA API and, when the user has to answer,
//! carried over Access-Challenge rounds.
//!
//! # Example
//!
//! ```rust,no_run
//! use mfa_gateway::{load_codec, Collaborators, Config, RadiusGateway};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = Config::from_file("config.json")?;
//!     let codec = load_codec(&config)?;
//!     let collaborators = Collaborators::production(&config, codec.clone())?;
//!
//!     let gateway = RadiusGateway::new(config, codec, collaborators).await?;
//!     gateway.run().await?;
//!     Ok(())
//! }
//! ```

pub mod challenge;
pub mod config;
pub mod context;
pub mod error;
pub mod ldap;
pub mod mfa;
pub mod passphrase;
pub mod pipeline;
pub mod response;
pub mod server;
pub mod upstream;

pub use challenge::{ChallengeIdentifier, ChallengeProcessor, ChallengeRegistry, ChallengeStatus, ChallengeType};
pub use config::{ClientConfig, Config, ConfigError, FirstFactorSource};
pub use context::{AuthenticationStatus, ExecutionContext};
pub use error::GatewayError;
pub use ldap::{BindOutcome, Ldap3Directory, LdapDirectory, LdapError, LdapProfile};
pub use mfa::{HttpMultifactorApi, MfaApiError, MultifactorApi};
pub use pipeline::{Collaborators, Pipeline, PipelineStep};
pub use response::ResponseComposer;
pub use server::{load_codec, RadiusGateway};
pub use upstream::{RadiusUpstream, UdpRadiusUpstream, UpstreamError};
