//! Message-Authenticator Support (RFC 2869 Section 5.14, RFC 3579 Section 3.2)
//!
//! Message-Authenticator is HMAC-MD5 keyed with the shared secret over the
//! whole packet, computed with:
//! - the 16-byte Message-Authenticator value set to zeros
//! - the Request Authenticator in the header for Access-Request and for
//!   every response (responses are computed before the Response
//!   Authenticator is filled in)

use hmac::{Hmac, Mac};
use md5_digest::Md5;

type HmacMd5 = Hmac<Md5>;

/// Length of the Message-Authenticator value
pub const MESSAGE_AUTHENTICATOR_LENGTH: usize = 16;

fn mac_over(packet_bytes: &[u8], secret: &[u8]) -> HmacMd5 {
    let mut mac = <HmacMd5 as Mac>::new_from_slice(secret).expect("HMAC can take key of any size");
    mac.update(packet_bytes);
    mac
}

fn prepare(
    packet_bytes: &[u8],
    message_auth_offset: usize,
    request_authenticator: Option<&[u8; 16]>,
) -> Vec<u8> {
    let mut packet_copy = packet_bytes.to_vec();
    packet_copy[message_auth_offset..message_auth_offset + MESSAGE_AUTHENTICATOR_LENGTH].fill(0);
    if let Some(authenticator) = request_authenticator {
        packet_copy[4..20].copy_from_slice(authenticator);
    }
    packet_copy
}

/// HMAC-MD5 over packet bytes that already hold zeros in the
/// Message-Authenticator slot
pub fn calculate_message_authenticator(packet_bytes: &[u8], secret: &[u8]) -> [u8; 16] {
    let bytes = mac_over(packet_bytes, secret).finalize().into_bytes();

    let mut output = [0u8; 16];
    output.copy_from_slice(&bytes);
    output
}

/// Message-Authenticator of `packet_bytes`
///
/// The value at `message_auth_offset` (start of the 16-byte value, after the
/// type and length octets) is treated as zeros and the header authenticator is
/// replaced by `request_authenticator` when given.
pub fn compute_message_authenticator(
    packet_bytes: &[u8],
    secret: &[u8],
    message_auth_offset: usize,
    request_authenticator: Option<&[u8; 16]>,
) -> Option<[u8; 16]> {
    if packet_bytes.len() < 20 || message_auth_offset + MESSAGE_AUTHENTICATOR_LENGTH > packet_bytes.len() {
        return None;
    }
    let packet_copy = prepare(packet_bytes, message_auth_offset, request_authenticator);
    Some(calculate_message_authenticator(&packet_copy, secret))
}

/// Verify the Message-Authenticator in a received packet
///
/// Comparison is constant-time.
pub fn verify_message_authenticator(
    packet_bytes: &[u8],
    secret: &[u8],
    message_auth_offset: usize,
    request_authenticator: Option<&[u8; 16]>,
) -> bool {
    if packet_bytes.len() < 20 || message_auth_offset + MESSAGE_AUTHENTICATOR_LENGTH > packet_bytes.len() {
        return false;
    }

    let received = &packet_bytes[message_auth_offset..message_auth_offset + MESSAGE_AUTHENTICATOR_LENGTH];
    let packet_copy = prepare(packet_bytes, message_auth_offset, request_authenticator);

    mac_over(&packet_copy, secret).verify_slice(received).is_ok()
}
