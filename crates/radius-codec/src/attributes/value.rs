use std::fmt;
use std::net::Ipv4Addr;

/// A decoded attribute value
///
/// String-typed attributes decode to `Text` only when every byte is printable
/// ASCII; NAS devices occasionally put binary data in string attributes and
/// those values are kept as `Bytes`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttributeValue {
    Text(String),
    Bytes(Vec<u8>),
    Integer(u32),
    Ipv4(Ipv4Addr),
}

impl AttributeValue {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            AttributeValue::Text(text) => Some(text),
            _ => None,
        }
    }

    pub fn as_integer(&self) -> Option<u32> {
        match self {
            AttributeValue::Integer(value) => Some(*value),
            _ => None,
        }
    }

    pub fn as_ipv4(&self) -> Option<Ipv4Addr> {
        match self {
            AttributeValue::Ipv4(addr) => Some(*addr),
            _ => None,
        }
    }

    /// Raw bytes of the value (integers big-endian)
    pub fn to_bytes(&self) -> Vec<u8> {
        match self {
            AttributeValue::Text(text) => text.as_bytes().to_vec(),
            AttributeValue::Bytes(bytes) => bytes.clone(),
            AttributeValue::Integer(value) => value.to_be_bytes().to_vec(),
            AttributeValue::Ipv4(addr) => addr.octets().to_vec(),
        }
    }

    /// Textual form, with invalid UTF-8 replaced
    pub fn to_text_lossy(&self) -> String {
        match self {
            AttributeValue::Bytes(bytes) => String::from_utf8_lossy(bytes).into_owned(),
            other => other.to_string(),
        }
    }

    /// Decode a string-typed value
    pub(crate) fn from_string_bytes(raw: &[u8]) -> Self {
        if raw.iter().all(|b| (0x20..=0x7e).contains(b)) {
            // All printable ASCII is valid UTF-8
            AttributeValue::Text(String::from_utf8_lossy(raw).into_owned())
        } else {
            AttributeValue::Bytes(raw.to_vec())
        }
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AttributeValue::Text(text) => write!(f, "{}", text),
            AttributeValue::Bytes(bytes) => {
                write!(f, "0x")?;
                for b in bytes {
                    write!(f, "{:02x}", b)?;
                }
                Ok(())
            }
            AttributeValue::Integer(value) => write!(f, "{}", value),
            AttributeValue::Ipv4(addr) => write!(f, "{}", addr),
        }
    }
}

impl From<&str> for AttributeValue {
    fn from(value: &str) -> Self {
        AttributeValue::Text(value.to_string())
    }
}

impl From<String> for AttributeValue {
    fn from(value: String) -> Self {
        AttributeValue::Text(value)
    }
}

impl From<Vec<u8>> for AttributeValue {
    fn from(value: Vec<u8>) -> Self {
        AttributeValue::Bytes(value)
    }
}

impl From<&[u8]> for AttributeValue {
    fn from(value: &[u8]) -> Self {
        AttributeValue::Bytes(value.to_vec())
    }
}

impl From<u32> for AttributeValue {
    fn from(value: u32) -> Self {
        AttributeValue::Integer(value)
    }
}

impl From<Ipv4Addr> for AttributeValue {
    fn from(value: Ipv4Addr) -> Self {
        AttributeValue::Ipv4(value)
    }
}
