//! RADIUS Protocol Codec
//!
//! Dictionary-driven encoding and decoding of RADIUS packets as defined in
//! RFC 2865, 2866, 2869, 3579 and 5176.
//!
//! # Features
//!
//! - FreeRADIUS-format attribute dictionaries with vendor-specific entries
//! - Packet parsing with length, authenticator and Message-Authenticator checks
//! - Two-pass packet encoding (build, then patch length and authenticators)
//! - MD5-chained User-Password cipher
//!
//! # Example
//!
//! ```rust
//! use radius_codec::{AttributeDictionary, Code, RadiusCodec, RadiusPacket};
//! use radius_codec::auth::generate_request_authenticator;
//! use std::sync::Arc;
//!
//! let dictionary = Arc::new(AttributeDictionary::builtin().unwrap());
//! let codec = RadiusCodec::new(dictionary);
//!
//! let mut request = RadiusPacket::new(Code::AccessRequest, 1, generate_request_authenticator());
//! request.add_attribute("User-Name", "alice");
//! request.add_attribute("User-Password", "password");
//!
//! let bytes = codec.encode(&request, b"secret").unwrap();
//! let parsed = codec.parse(&bytes, b"secret", None).unwrap();
//! assert_eq!(parsed.user_password(), Some("password"));
//! ```

pub mod attributes;
pub mod auth;
pub mod codec;
pub mod dictionary;
pub mod message_auth;
pub mod packet;

pub use attributes::{microsoft, AttributeType, AttributeValue};
pub use auth::{
    calculate_request_authenticator, calculate_response_authenticator, decrypt_user_password,
    encrypt_user_password, generate_request_authenticator, verify_response_authenticator,
};
pub use codec::RadiusCodec;
pub use dictionary::{AttributeDictionary, DataType, DictionaryAttribute, DictionaryError};
pub use message_auth::{
    calculate_message_authenticator, compute_message_authenticator, verify_message_authenticator,
};
pub use packet::{Code, PacketError, RadiusPacket};
