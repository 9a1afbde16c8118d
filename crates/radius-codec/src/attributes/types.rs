/// Standard attributes the codec and the gateway refer to directly
///
/// Everything else is resolved through the [`AttributeDictionary`](crate::AttributeDictionary).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AttributeType {
    /// User-Name (1) - RFC 2865
    UserName = 1,
    /// User-Password (2) - RFC 2865
    UserPassword = 2,
    /// CHAP-Password (3) - RFC 2865
    ChapPassword = 3,
    /// NAS-IP-Address (4) - RFC 2865
    NasIpAddress = 4,
    /// Reply-Message (18) - RFC 2865
    ReplyMessage = 18,
    /// State (24) - RFC 2865
    State = 24,
    /// Class (25) - RFC 2865
    Class = 25,
    /// Vendor-Specific (26) - RFC 2865
    VendorSpecific = 26,
    /// Called-Station-Id (30) - RFC 2865
    CalledStationId = 30,
    /// Calling-Station-Id (31) - RFC 2865
    CallingStationId = 31,
    /// NAS-Identifier (32) - RFC 2865
    NasIdentifier = 32,
    /// Proxy-State (33) - RFC 2865
    ProxyState = 33,
    /// CHAP-Challenge (60) - RFC 2865
    ChapChallenge = 60,
    /// EAP-Message (79) - RFC 3579
    EapMessage = 79,
    /// Message-Authenticator (80) - RFC 2869
    MessageAuthenticator = 80,
}

impl AttributeType {
    pub fn as_u8(self) -> u8 {
        self as u8
    }

    /// Canonical dictionary name
    pub fn name(self) -> &'static str {
        match self {
            AttributeType::UserName => "User-Name",
            AttributeType::UserPassword => "User-Password",
            AttributeType::ChapPassword => "CHAP-Password",
            AttributeType::NasIpAddress => "NAS-IP-Address",
            AttributeType::ReplyMessage => "Reply-Message",
            AttributeType::State => "State",
            AttributeType::Class => "Class",
            AttributeType::VendorSpecific => "Vendor-Specific",
            AttributeType::CalledStationId => "Called-Station-Id",
            AttributeType::CallingStationId => "Calling-Station-Id",
            AttributeType::NasIdentifier => "NAS-Identifier",
            AttributeType::ProxyState => "Proxy-State",
            AttributeType::ChapChallenge => "CHAP-Challenge",
            AttributeType::EapMessage => "EAP-Message",
            AttributeType::MessageAuthenticator => "Message-Authenticator",
        }
    }
}

/// Microsoft vendor attributes (RFC 2548)
pub mod microsoft {
    pub const VENDOR_ID: u32 = 311;
    pub const MS_CHAP_RESPONSE: &str = "MS-CHAP-Response";
    pub const MS_CHAP_CHALLENGE: &str = "MS-CHAP-Challenge";
    pub const MS_CHAP2_RESPONSE: &str = "MS-CHAP2-Response";
    pub const MS_CHAP2_SUCCESS: &str = "MS-CHAP2-Success";
    pub const MS_CHAP_ERROR: &str = "MS-CHAP-Error";
}
