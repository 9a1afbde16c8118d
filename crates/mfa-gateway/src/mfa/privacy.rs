use serde::{Deserialize, Serialize};
use std::fmt;

/// Personal data that can be withheld from the MFA API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PrivacyField {
    Name,
    Email,
    Phone,
    CallingStationId,
}

impl PrivacyField {
    const ALL: [PrivacyField; 4] = [
        PrivacyField::Name,
        PrivacyField::Email,
        PrivacyField::Phone,
        PrivacyField::CallingStationId,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            PrivacyField::Name => "Name",
            PrivacyField::Email => "Email",
            PrivacyField::Phone => "Phone",
            PrivacyField::CallingStationId => "CallingStationId",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|field| field.as_str().eq_ignore_ascii_case(value.trim()))
    }
}

/// Redaction policy for access requests
///
/// Configured as "None", "Full" or "Partial:Name,Phone" where the listed
/// fields are the ones still sent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum PrivacyMode {
    #[default]
    None,
    Full,
    Partial(Vec<String>),
}

impl PrivacyMode {
    /// Whether `field` may be sent
    pub fn allows(&self, field: PrivacyField) -> bool {
        match self {
            PrivacyMode::None => true,
            PrivacyMode::Full => false,
            PrivacyMode::Partial(allowed) => allowed
                .iter()
                .any(|name| name.eq_ignore_ascii_case(field.as_str())),
        }
    }

    /// `value` when the field may be sent
    pub fn filter(&self, field: PrivacyField, value: Option<String>) -> Option<String> {
        value.filter(|_| self.allows(field))
    }
}

impl TryFrom<String> for PrivacyMode {
    type Error = String;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        let value = value.trim();
        let (mode, fields) = match value.split_once(':') {
            Some((mode, fields)) => (mode.trim(), Some(fields)),
            None => (value, None),
        };

        match (mode.to_ascii_lowercase().as_str(), fields) {
            ("" | "none", None) => Ok(PrivacyMode::None),
            ("full", None) => Ok(PrivacyMode::Full),
            ("partial", fields) => {
                let mut allowed = Vec::new();
                for name in fields.unwrap_or("").split(',').filter(|n| !n.trim().is_empty()) {
                    let field = PrivacyField::parse(name)
                        .ok_or_else(|| format!("unknown privacy field '{}'", name.trim()))?;
                    allowed.push(field.as_str().to_string());
                }
                Ok(PrivacyMode::Partial(allowed))
            }
            _ => Err(format!("invalid privacy mode '{}'", value)),
        }
    }
}

impl From<PrivacyMode> for String {
    fn from(value: PrivacyMode) -> Self {
        value.to_string()
    }
}

impl fmt::Display for PrivacyMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PrivacyMode::None => f.write_str("None"),
            PrivacyMode::Full => f.write_str("Full"),
            PrivacyMode::Partial(fields) => write!(f, "Partial:{}", fields.join(",")),
        }
    }
}
