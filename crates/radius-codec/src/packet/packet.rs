use super::Code;
use crate::attributes::{AttributeType, AttributeValue};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PacketError {
    #[error("Malformed packet: {0}")]
    Malformed(String),
    #[error("Invalid packet code: {0}")]
    InvalidCode(u8),
    #[error("Request authenticator mismatch")]
    AuthenticatorMismatch,
    #[error("Invalid Message-Authenticator")]
    InvalidMessageAuthenticator,
    #[error("Unknown attribute: {0}")]
    UnknownAttribute(String),
    #[error("Attribute error: {0}")]
    AttributeError(String),
    #[error("Packet too large: {0} bytes")]
    PacketTooLarge(usize),
    #[error("User-Password error: {0}")]
    Password(String),
}

/// RADIUS Packet structure as defined in RFC 2865 Section 3
///
/// ```text
///  0                   1                   2                   3
///  0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1 2 3 4 5 6 7 8 9 0 1
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |     Code      |  Identifier   |            Length             |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |                                                               |
/// |                         Authenticator                         |
/// |                                                               |
/// |                                                               |
/// +-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+-+
/// |  Attributes ...
/// +-+-+-+-+-+-+-+-+-+-+-+-+-
/// ```
///
/// Attributes are kept as an ordered multi-map: names appear in the order
/// they were first added and each name holds its values in arrival order.
#[derive(Debug, Clone, PartialEq)]
pub struct RadiusPacket {
    /// Packet type (1 byte)
    pub code: Code,
    /// Packet identifier for matching requests/responses (1 byte)
    pub identifier: u8,
    /// Authenticator (16 bytes); the seed for User-Password encryption
    pub authenticator: [u8; 16],
    /// Authenticator of the request this packet answers, when known
    pub request_authenticator: Option<[u8; 16]>,
    attributes: Vec<(String, Vec<AttributeValue>)>,
}

impl RadiusPacket {
    /// Minimum RADIUS packet size (20 bytes: 1 code + 1 id + 2 length + 16 authenticator)
    pub const MIN_PACKET_SIZE: usize = 20;
    /// Maximum RADIUS packet size (4096 bytes as per RFC 2865)
    pub const MAX_PACKET_SIZE: usize = 4096;

    pub fn new(code: Code, identifier: u8, authenticator: [u8; 16]) -> Self {
        RadiusPacket {
            code,
            identifier,
            authenticator,
            request_authenticator: None,
            attributes: Vec::new(),
        }
    }

    /// Create an empty response to `request`
    ///
    /// The response shares the request identifier and carries the request
    /// authenticator both as its seed and as the reference used to compute
    /// the response authenticator on encode.
    pub fn create_response(request: &RadiusPacket, code: Code) -> Self {
        RadiusPacket {
            code,
            identifier: request.identifier,
            authenticator: request.authenticator,
            request_authenticator: Some(request.authenticator),
            attributes: Vec::new(),
        }
    }

    /// Append a value under `name`
    pub fn add_attribute(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        let name = name.into();
        let value = value.into();
        match self.attributes.iter_mut().find(|(n, _)| *n == name) {
            Some((_, values)) => values.push(value),
            None => self.attributes.push((name, vec![value])),
        }
    }

    /// Replace every value under `name` with a single one
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<AttributeValue>) {
        let name = name.into();
        self.remove_attribute(&name);
        self.attributes.push((name, vec![value.into()]));
    }

    pub fn remove_attribute(&mut self, name: &str) -> Option<Vec<AttributeValue>> {
        let index = self.attributes.iter().position(|(n, _)| n == name)?;
        Some(self.attributes.remove(index).1)
    }

    /// First value of an attribute
    pub fn attribute(&self, name: &str) -> Option<&AttributeValue> {
        self.attribute_values(name).first()
    }

    /// All values of an attribute
    pub fn attribute_values(&self, name: &str) -> &[AttributeValue] {
        self.attributes
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, values)| values.as_slice())
            .unwrap_or(&[])
    }

    pub fn has_attribute(&self, name: &str) -> bool {
        !self.attribute_values(name).is_empty()
    }

    /// First value of an attribute as text
    pub fn attribute_text(&self, name: &str) -> Option<String> {
        self.attribute(name).map(AttributeValue::to_text_lossy)
    }

    /// Attributes in stored order
    pub fn attributes(&self) -> impl Iterator<Item = (&str, &[AttributeValue])> {
        self.attributes
            .iter()
            .map(|(name, values)| (name.as_str(), values.as_slice()))
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.iter().map(|(_, values)| values.len()).sum()
    }

    pub fn user_name(&self) -> Option<String> {
        self.attribute_text(AttributeType::UserName.name())
    }

    /// Decrypted User-Password
    pub fn user_password(&self) -> Option<&str> {
        self.attribute(AttributeType::UserPassword.name())
            .and_then(AttributeValue::as_str)
    }

    /// Raw State attribute
    pub fn state(&self) -> Option<Vec<u8>> {
        self.attribute(AttributeType::State.name())
            .map(AttributeValue::to_bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_multi_map_keeps_insertion_order() {
        let mut packet = RadiusPacket::new(Code::AccessAccept, 1, [0u8; 16]);
        packet.add_attribute("Reply-Message", "first");
        packet.add_attribute("Class", vec![1u8, 2, 3]);
        packet.add_attribute("Reply-Message", "second");

        let names: Vec<&str> = packet.attributes().map(|(name, _)| name).collect();
        assert_eq!(names, vec!["Reply-Message", "Class"]);
        assert_eq!(packet.attribute_values("Reply-Message").len(), 2);
        assert_eq!(packet.attribute_count(), 3);
    }

    #[test]
    fn test_set_attribute_replaces_values() {
        let mut packet = RadiusPacket::new(Code::AccessAccept, 1, [0u8; 16]);
        packet.add_attribute("Reply-Message", "a");
        packet.add_attribute("Reply-Message", "b");
        packet.set_attribute("Reply-Message", "c");

        assert_eq!(packet.attribute_values("Reply-Message"), &[AttributeValue::from("c")]);
    }

    #[test]
    fn test_create_response_references_request() {
        let request = RadiusPacket::new(Code::AccessRequest, 42, [7u8; 16]);
        let response = RadiusPacket::create_response(&request, Code::AccessReject);

        assert_eq!(response.identifier, 42);
        assert_eq!(response.authenticator, [7u8; 16]);
        assert_eq!(response.request_authenticator, Some([7u8; 16]));
        assert_eq!(response.attribute_count(), 0);
    }
}
