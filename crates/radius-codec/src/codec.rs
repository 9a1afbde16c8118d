//! Packet parsing and serialization
//!
//! [`RadiusCodec`] turns datagram bytes into a [`RadiusPacket`] and back,
//! resolving attributes through the [`AttributeDictionary`] and applying the
//! authenticator, User-Password and Message-Authenticator rules of
//! RFC 2865, RFC 2866, RFC 3579 and RFC 5176.

use crate::attributes::{AttributeType, AttributeValue};
use crate::auth::{
    calculate_request_authenticator, calculate_response_authenticator, decrypt_user_password,
    encrypt_user_password,
};
use crate::dictionary::{AttributeDictionary, DataType, DictionaryAttribute};
use crate::message_auth::{compute_message_authenticator, verify_message_authenticator};
use crate::packet::{Code, PacketError, RadiusPacket};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::debug;

const HEADER_LENGTH: usize = 20;
const MAX_ATTRIBUTE_VALUE: usize = 253;
/// Vendor-Specific payload overhead: vendor-id(4) + vendor-type(1) + vendor-length(1)
const VSA_OVERHEAD: usize = 6;
const ZERO_AUTHENTICATOR: [u8; 16] = [0u8; 16];

/// Dictionary-driven RADIUS codec
///
/// Cheap to clone; the dictionary is shared.
#[derive(Debug, Clone)]
pub struct RadiusCodec {
    dictionary: Arc<AttributeDictionary>,
}

impl RadiusCodec {
    pub fn new(dictionary: Arc<AttributeDictionary>) -> Self {
        RadiusCodec { dictionary }
    }

    pub fn dictionary(&self) -> &AttributeDictionary {
        &self.dictionary
    }

    /// Parse a datagram
    ///
    /// `request_authenticator` is the authenticator of the request this packet
    /// answers; it is only needed to verify the Message-Authenticator of
    /// responses.
    pub fn parse(
        &self,
        data: &[u8],
        secret: &[u8],
        request_authenticator: Option<&[u8; 16]>,
    ) -> Result<RadiusPacket, PacketError> {
        if data.len() < RadiusPacket::MIN_PACKET_SIZE {
            return Err(PacketError::Malformed(format!(
                "packet too short: {} bytes",
                data.len()
            )));
        }

        let declared = u16::from_be_bytes([data[2], data[3]]) as usize;
        if declared != data.len() {
            return Err(PacketError::Malformed(format!(
                "length field says {} bytes, datagram has {}",
                declared,
                data.len()
            )));
        }
        if declared > RadiusPacket::MAX_PACKET_SIZE {
            return Err(PacketError::Malformed(format!(
                "packet exceeds {} bytes: {}",
                RadiusPacket::MAX_PACKET_SIZE,
                declared
            )));
        }

        let code = Code::from_u8(data[0]).ok_or(PacketError::InvalidCode(data[0]))?;
        let identifier = data[1];
        let mut authenticator = [0u8; 16];
        authenticator.copy_from_slice(&data[4..HEADER_LENGTH]);

        if code.has_computed_request_authenticator()
            && calculate_request_authenticator(data, secret) != authenticator
        {
            return Err(PacketError::AuthenticatorMismatch);
        }

        let mut packet = RadiusPacket::new(code, identifier, authenticator);
        packet.request_authenticator = request_authenticator.copied();

        let mut message_auth_offset = None;
        let mut offset = HEADER_LENGTH;

        while offset < data.len() {
            if offset + 2 > data.len() {
                return Err(PacketError::Malformed(format!(
                    "truncated attribute header at offset {}",
                    offset
                )));
            }
            let attr_type = data[offset];
            let attr_length = data[offset + 1] as usize;
            if attr_length < 2 || offset + attr_length > data.len() {
                return Err(PacketError::Malformed(format!(
                    "attribute {} at offset {} has invalid length {}",
                    attr_type, offset, attr_length
                )));
            }
            let value = &data[offset + 2..offset + attr_length];

            if attr_type == AttributeType::VendorSpecific.as_u8() {
                self.parse_vendor_specific(value, &mut packet)?;
            } else if attr_type == AttributeType::MessageAuthenticator.as_u8() {
                if value.len() != 16 {
                    return Err(PacketError::Malformed(format!(
                        "Message-Authenticator must be 16 bytes, got {}",
                        value.len()
                    )));
                }
                message_auth_offset = Some(offset + 2);
                packet.add_attribute(AttributeType::MessageAuthenticator.name(), value);
            } else if let Some(definition) = self.dictionary.find_by_code(attr_type) {
                let decoded = if attr_type == AttributeType::UserPassword.as_u8() {
                    AttributeValue::Text(decrypt_user_password(value, secret, &authenticator)?)
                } else {
                    decode_value(definition.data_type, value)
                };
                packet.add_attribute(definition.name.clone(), decoded);
            } else {
                debug!(attribute_type = attr_type, length = attr_length, "Skipping unknown attribute");
            }

            offset += attr_length;
        }

        if let Some(ma_offset) = message_auth_offset {
            let substitute = if code.has_computed_request_authenticator() {
                Some(&ZERO_AUTHENTICATOR)
            } else {
                request_authenticator
            };
            if !verify_message_authenticator(data, secret, ma_offset, substitute) {
                return Err(PacketError::InvalidMessageAuthenticator);
            }
        }

        Ok(packet)
    }

    fn parse_vendor_specific(&self, value: &[u8], packet: &mut RadiusPacket) -> Result<(), PacketError> {
        if value.len() < VSA_OVERHEAD {
            return Err(PacketError::Malformed(format!(
                "Vendor-Specific attribute too short: {} bytes",
                value.len()
            )));
        }

        let vendor_id = u32::from_be_bytes([value[0], value[1], value[2], value[3]]);
        let mut offset = 4;

        while offset < value.len() {
            if offset + 2 > value.len() {
                return Err(PacketError::Malformed(format!(
                    "truncated vendor attribute for vendor {}",
                    vendor_id
                )));
            }
            let vendor_code = value[offset];
            let vendor_length = value[offset + 1] as usize;
            if vendor_length < 2 || offset + vendor_length > value.len() {
                return Err(PacketError::Malformed(format!(
                    "vendor {} attribute {} has invalid length {}",
                    vendor_id, vendor_code, vendor_length
                )));
            }
            let content = &value[offset + 2..offset + vendor_length];

            match self.dictionary.find_vendor_attribute(vendor_id, vendor_code) {
                Some(definition) => {
                    packet.add_attribute(definition.name.clone(), decode_value(definition.data_type, content));
                }
                None => {
                    debug!(vendor_id, vendor_code, "Skipping unknown vendor attribute");
                }
            }

            offset += vendor_length;
        }

        Ok(())
    }

    /// Serialize a packet
    ///
    /// The buffer is assembled with zeroed placeholders for the length and the
    /// Message-Authenticator, then patched once its final content is known.
    pub fn encode(&self, packet: &RadiusPacket, secret: &[u8]) -> Result<Vec<u8>, PacketError> {
        let computed_request = packet.code.has_computed_request_authenticator();
        let header_authenticator = if computed_request {
            ZERO_AUTHENTICATOR
        } else {
            packet.request_authenticator.unwrap_or(packet.authenticator)
        };

        let mut buffer = Vec::with_capacity(256);
        buffer.push(packet.code.as_u8());
        buffer.push(packet.identifier);
        buffer.extend_from_slice(&[0, 0]);
        buffer.extend_from_slice(&header_authenticator);

        let mut message_auth_offset = None;

        for (name, values) in packet.attributes() {
            let definition = self
                .dictionary
                .find_by_name(name)
                .ok_or_else(|| PacketError::UnknownAttribute(name.to_string()))?;

            for value in values {
                if definition.vendor_id.is_none()
                    && definition.code == AttributeType::MessageAuthenticator.as_u8()
                {
                    buffer.push(definition.code);
                    buffer.push(18);
                    message_auth_offset = Some(buffer.len());
                    buffer.extend_from_slice(&ZERO_AUTHENTICATOR);
                    continue;
                }

                let content = if definition.vendor_id.is_none()
                    && definition.code == AttributeType::UserPassword.as_u8()
                {
                    encrypt_user_password(&value.to_bytes(), secret, &packet.authenticator)?
                } else {
                    encode_value(definition, value)?
                };

                write_attribute(&mut buffer, definition, &content)?;
            }
        }

        if buffer.len() > RadiusPacket::MAX_PACKET_SIZE {
            return Err(PacketError::PacketTooLarge(buffer.len()));
        }
        let length = buffer.len() as u16;
        buffer[2..4].copy_from_slice(&length.to_be_bytes());

        if let Some(offset) = message_auth_offset {
            let value = compute_message_authenticator(&buffer, secret, offset, None).ok_or_else(|| {
                PacketError::Malformed("Message-Authenticator slot out of bounds".to_string())
            })?;
            buffer[offset..offset + 16].copy_from_slice(&value);
        }

        if computed_request {
            let authenticator = calculate_request_authenticator(&buffer, secret);
            buffer[4..HEADER_LENGTH].copy_from_slice(&authenticator);
        } else if let Some(request_authenticator) = packet.request_authenticator {
            let authenticator = calculate_response_authenticator(&buffer, &request_authenticator, secret);
            buffer[4..HEADER_LENGTH].copy_from_slice(&authenticator);
        }

        debug!(
            code = ?packet.code,
            identifier = packet.identifier,
            length = buffer.len(),
            "Encoded packet"
        );

        Ok(buffer)
    }

    /// Find the raw value of the first standard attribute of `attribute_type`
    /// without decoding or verifying the packet
    pub fn peek_attribute(data: &[u8], attribute_type: u8) -> Option<&[u8]> {
        let mut offset = HEADER_LENGTH;
        while offset + 2 <= data.len() {
            let attr_length = data[offset + 1] as usize;
            if attr_length < 2 || offset + attr_length > data.len() {
                return None;
            }
            if data[offset] == attribute_type {
                return Some(&data[offset + 2..offset + attr_length]);
            }
            offset += attr_length;
        }
        None
    }
}

fn decode_value(data_type: DataType, raw: &[u8]) -> AttributeValue {
    match data_type {
        DataType::String | DataType::TaggedString => AttributeValue::from_string_bytes(raw),
        DataType::Integer | DataType::TaggedInteger => match <[u8; 4]>::try_from(raw) {
            Ok(bytes) => AttributeValue::Integer(u32::from_be_bytes(bytes)),
            Err(_) => AttributeValue::Bytes(raw.to_vec()),
        },
        DataType::IpAddr => match <[u8; 4]>::try_from(raw) {
            Ok(octets) => AttributeValue::Ipv4(Ipv4Addr::from(octets)),
            Err(_) => AttributeValue::Bytes(raw.to_vec()),
        },
        DataType::Octets => AttributeValue::Bytes(raw.to_vec()),
    }
}

/// Bytes for `value` as the dictionary type of `definition`
///
/// Text is accepted for every type so reply attributes from configuration
/// can be written as strings.
fn encode_value(definition: &DictionaryAttribute, value: &AttributeValue) -> Result<Vec<u8>, PacketError> {
    let invalid = |expected: &str| {
        PacketError::AttributeError(format!(
            "{}: cannot encode '{}' as {}",
            definition.name, value, expected
        ))
    };

    match (definition.data_type, value) {
        (DataType::Integer | DataType::TaggedInteger, AttributeValue::Text(text)) => text
            .trim()
            .parse::<u32>()
            .map(|v| v.to_be_bytes().to_vec())
            .map_err(|_| invalid("integer")),
        (DataType::IpAddr, AttributeValue::Text(text)) => text
            .trim()
            .parse::<Ipv4Addr>()
            .map(|addr| addr.octets().to_vec())
            .map_err(|_| invalid("ipaddr")),
        (DataType::IpAddr, AttributeValue::Integer(_)) => Err(invalid("ipaddr")),
        (_, value) => Ok(value.to_bytes()),
    }
}

fn write_attribute(
    buffer: &mut Vec<u8>,
    definition: &DictionaryAttribute,
    content: &[u8],
) -> Result<(), PacketError> {
    match definition.vendor_id {
        Some(vendor_id) => {
            if content.len() > MAX_ATTRIBUTE_VALUE - VSA_OVERHEAD {
                return Err(PacketError::AttributeError(format!(
                    "{} value too long: {} bytes",
                    definition.name,
                    content.len()
                )));
            }
            buffer.push(AttributeType::VendorSpecific.as_u8());
            buffer.push((2 + VSA_OVERHEAD + content.len()) as u8);
            buffer.extend_from_slice(&vendor_id.to_be_bytes());
            buffer.push(definition.code);
            buffer.push((2 + content.len()) as u8);
            buffer.extend_from_slice(content);
        }
        None => {
            if content.len() > MAX_ATTRIBUTE_VALUE {
                return Err(PacketError::AttributeError(format!(
                    "{} value too long: {} bytes",
                    definition.name,
                    content.len()
                )));
            }
            buffer.push(definition.code);
            buffer.push((2 + content.len()) as u8);
            buffer.extend_from_slice(content);
        }
    }
    Ok(())
}
