//! User-Password interpretation
//!
//! Depending on client settings the password field can carry the directory
//! password, a one-time code appended to it, a bare one-time code, a
//! provider code selecting how the second factor is delivered, or an OpenVPN
//! static-challenge envelope (`SCRV1:<base64 password>:<base64 response>`).

use crate::config::PreAuthenticationMethod;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use tracing::debug;

const OTP_LENGTH: usize = 6;
const STATIC_CHALLENGE_PREFIX: &str = "SCRV1:";

/// Second-factor delivery channel typed in place of a password
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderCode {
    Telegram,
    MobileApp,
    Sms,
    Call,
}

impl ProviderCode {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "t" => Some(ProviderCode::Telegram),
            "m" => Some(ProviderCode::MobileApp),
            "s" => Some(ProviderCode::Sms),
            "c" => Some(ProviderCode::Call),
            _ => None,
        }
    }

    /// Value sent as PassCode
    pub fn as_str(self) -> &'static str {
        match self {
            ProviderCode::Telegram => "t",
            ProviderCode::MobileApp => "m",
            ProviderCode::Sms => "s",
            ProviderCode::Call => "c",
        }
    }
}

/// Parsed User-Password
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Passphrase {
    /// Value as received
    pub raw: Option<String>,
    /// Directory password
    pub password: Option<String>,
    /// Six-digit code, either appended (pre-auth) or the whole value
    pub otp: Option<String>,
    pub provider_code: Option<ProviderCode>,
    /// Response half of an OpenVPN static challenge
    pub static_response: Option<String>,
}

fn is_otp(value: &str) -> bool {
    value.len() == OTP_LENGTH && value.bytes().all(|b| b.is_ascii_digit())
}

impl Passphrase {
    pub fn parse(raw: Option<&str>, method: PreAuthenticationMethod) -> Self {
        let raw = match raw {
            Some(raw) if !raw.is_empty() => raw,
            _ => return Passphrase::default(),
        };

        if let Some(parsed) = Self::parse_static_challenge(raw) {
            return parsed;
        }

        let mut passphrase = Passphrase {
            raw: Some(raw.to_string()),
            ..Default::default()
        };

        if method == PreAuthenticationMethod::Otp {
            let split = raw.len().saturating_sub(OTP_LENGTH);
            if raw.is_char_boundary(split) && is_otp(&raw[split..]) {
                passphrase.otp = Some(raw[split..].to_string());
                passphrase.password = Some(raw[..split].to_string()).filter(|p| !p.is_empty());
                return passphrase;
            }
        }

        if is_otp(raw) {
            passphrase.otp = Some(raw.to_string());
        }
        passphrase.provider_code = ProviderCode::parse(raw);
        passphrase.password = Some(raw.to_string());
        passphrase
    }

    fn parse_static_challenge(raw: &str) -> Option<Self> {
        let body = raw.strip_prefix(STATIC_CHALLENGE_PREFIX)?;
        let (password, response) = body.split_once(':')?;
        let decode = |part: &str| {
            STANDARD
                .decode(part)
                .ok()
                .and_then(|bytes| String::from_utf8(bytes).ok())
        };

        match (decode(password), decode(response)) {
            (Some(password), Some(response)) => Some(Passphrase {
                raw: Some(raw.to_string()),
                password: Some(password).filter(|p| !p.is_empty()),
                otp: None,
                provider_code: None,
                static_response: Some(response).filter(|r| !r.is_empty()),
            }),
            _ => {
                debug!("Password has a static challenge prefix but is not valid base64");
                None
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.raw.is_none()
    }

    /// Password with any appended OTP removed
    pub fn password(&self) -> Option<&str> {
        self.password.as_deref()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_plain_password() {
        let passphrase = Passphrase::parse(Some("Secr3t!"), PreAuthenticationMethod::None);
        assert_eq!(passphrase.password(), Some("Secr3t!"));
        assert!(passphrase.otp.is_none());
        assert!(passphrase.provider_code.is_none());
    }

    #[test]
    fn test_pre_auth_otp_suffix() {
        let passphrase = Passphrase::parse(Some("Secr3t!123456"), PreAuthenticationMethod::Otp);
        assert_eq!(passphrase.password(), Some("Secr3t!"));
        assert_eq!(passphrase.otp.as_deref(), Some("123456"));
    }

    #[test]
    fn test_pre_auth_without_suffix_keeps_password() {
        let passphrase = Passphrase::parse(Some("Secr3t!"), PreAuthenticationMethod::Otp);
        assert_eq!(passphrase.password(), Some("Secr3t!"));
        assert!(passphrase.otp.is_none());
    }

    #[test]
    fn test_otp_shaped_password() {
        let passphrase = Passphrase::parse(Some("654321"), PreAuthenticationMethod::None);
        assert_eq!(passphrase.otp.as_deref(), Some("654321"));
        assert_eq!(passphrase.password(), Some("654321"));
    }

    #[test]
    fn test_provider_code() {
        let passphrase = Passphrase::parse(Some("M"), PreAuthenticationMethod::None);
        assert_eq!(passphrase.provider_code, Some(ProviderCode::MobileApp));
        assert_eq!(passphrase.provider_code.map(ProviderCode::as_str), Some("m"));
    }

    #[test]
    fn test_static_challenge() {
        let raw = format!("SCRV1:{}:{}", STANDARD.encode("Secr3t!"), STANDARD.encode("112233"));
        let passphrase = Passphrase::parse(Some(&raw), PreAuthenticationMethod::None);
        assert_eq!(passphrase.password(), Some("Secr3t!"));
        assert_eq!(passphrase.static_response.as_deref(), Some("112233"));
    }

    #[test]
    fn test_invalid_static_challenge_is_a_password() {
        let passphrase = Passphrase::parse(Some("SCRV1:***:***"), PreAuthenticationMethod::None);
        assert_eq!(passphrase.password(), Some("SCRV1:***:***"));
        assert!(passphrase.static_response.is_none());
    }

    #[test]
    fn test_empty() {
        assert!(Passphrase::parse(None, PreAuthenticationMethod::Otp).is_empty());
        assert!(Passphrase::parse(Some(""), PreAuthenticationMethod::None).is_empty());
    }
}
