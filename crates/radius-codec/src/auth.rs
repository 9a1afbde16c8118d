//! Shared-secret cryptography (RFC 2865 Section 3 and 5.2)

use crate::packet::PacketError;
use rand::Rng;

/// Maximum User-Password length after padding (RFC 2865 Section 5.2)
pub const MAX_PASSWORD_LENGTH: usize = 128;

const AUTHENTICATOR_RANGE: std::ops::Range<usize> = 4..20;

/// Generate a random Request Authenticator (16 bytes) per RFC 2865 Section 3
pub fn generate_request_authenticator() -> [u8; 16] {
    let mut rng = rand::rng();
    let mut authenticator = [0u8; 16];
    rng.fill(&mut authenticator);
    authenticator
}

/// MD5 over the packet bytes with `authenticator` in the header, followed by the secret
///
/// With the request authenticator in place this is the Response Authenticator
/// of Access-Accept/Reject/Challenge; with sixteen zero bytes it is the
/// Request Authenticator of Accounting-Request, Disconnect-Request and
/// CoA-Request.
pub fn calculate_authenticator(packet_bytes: &[u8], authenticator: &[u8; 16], secret: &[u8]) -> [u8; 16] {
    let mut context = md5::Context::new();
    context.consume(&packet_bytes[..AUTHENTICATOR_RANGE.start]);
    context.consume(authenticator);
    context.consume(&packet_bytes[AUTHENTICATOR_RANGE.end..]);
    context.consume(secret);
    context.compute().0
}

/// Request Authenticator of an Accounting/Disconnect/CoA request (RFC 2866 Section 3)
pub fn calculate_request_authenticator(packet_bytes: &[u8], secret: &[u8]) -> [u8; 16] {
    calculate_authenticator(packet_bytes, &[0u8; 16], secret)
}

/// Response Authenticator for a reply to a request carrying `request_authenticator`
pub fn calculate_response_authenticator(
    packet_bytes: &[u8],
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> [u8; 16] {
    calculate_authenticator(packet_bytes, request_authenticator, secret)
}

/// Check the Response Authenticator of an encoded reply
pub fn verify_response_authenticator(
    packet_bytes: &[u8],
    request_authenticator: &[u8; 16],
    secret: &[u8],
) -> bool {
    if packet_bytes.len() < AUTHENTICATOR_RANGE.end {
        return false;
    }
    let calculated = calculate_response_authenticator(packet_bytes, request_authenticator, secret);
    packet_bytes[AUTHENTICATOR_RANGE] == calculated
}

fn block_key(secret: &[u8], seed: &[u8]) -> [u8; 16] {
    let mut context = md5::Context::new();
    context.consume(secret);
    context.consume(seed);
    context.compute().0
}

/// Encrypt User-Password attribute per RFC 2865 Section 5.2
///
/// The password is zero-padded to a multiple of 16 bytes, then each block is
/// XORed with `MD5(secret + seed)` where the first seed is the authenticator
/// and every following seed is the previous ciphertext block.
pub fn encrypt_user_password(
    password: &[u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<Vec<u8>, PacketError> {
    if password.len() > MAX_PASSWORD_LENGTH {
        return Err(PacketError::Password(format!(
            "password too long: {} bytes (max {})",
            password.len(),
            MAX_PASSWORD_LENGTH
        )));
    }

    let mut padded = password.to_vec();
    let blocks = password.len().div_ceil(16).max(1);
    padded.resize(blocks * 16, 0);

    let mut result = Vec::with_capacity(padded.len());
    let mut seed = *authenticator;

    for chunk in padded.chunks(16) {
        let key = block_key(secret, &seed);
        for (i, byte) in chunk.iter().enumerate() {
            seed[i] = byte ^ key[i];
        }
        result.extend_from_slice(&seed);
    }

    Ok(result)
}

/// Decrypt User-Password attribute per RFC 2865 Section 5.2
pub fn decrypt_user_password(
    encrypted: &[u8],
    secret: &[u8],
    authenticator: &[u8; 16],
) -> Result<String, PacketError> {
    if encrypted.is_empty() || encrypted.len() % 16 != 0 {
        return Err(PacketError::Password(format!(
            "invalid encrypted password length: {}",
            encrypted.len()
        )));
    }

    let mut result = Vec::with_capacity(encrypted.len());
    let mut seed: &[u8] = authenticator;

    for chunk in encrypted.chunks(16) {
        let key = block_key(secret, seed);
        result.extend(chunk.iter().zip(key.iter()).map(|(c, k)| c ^ k));
        seed = chunk;
    }

    // Remove padding
    while result.last() == Some(&0) {
        result.pop();
    }

    String::from_utf8(result)
        .map_err(|e| PacketError::Password(format!("invalid UTF-8 in password: {}", e)))
}
