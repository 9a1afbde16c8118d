//! Integration tests for the RADIUS codec
//!
//! These tests drive the public API end to end:
//! - Dictionary extension with a site-specific vendor
//! - Request/response exchanges with Message-Authenticator
//! - Disconnect-Request authenticator handling

use radius_codec::auth::{generate_request_authenticator, verify_response_authenticator};
use radius_codec::{AttributeDictionary, AttributeValue, Code, PacketError, RadiusCodec, RadiusPacket};
use std::sync::Arc;

const SECRET: &[u8] = b"sharedsecret";

fn codec_with_vendor() -> RadiusCodec {
    let mut dictionary = AttributeDictionary::builtin().expect("Failed to load dictionary");
    dictionary
        .merge_str(
            "VENDOR Acme 55555\n\
             BEGIN-VENDOR Acme\n\
             ATTRIBUTE Acme-Role 1 string\n\
             ATTRIBUTE Acme-Level 2 integer\n\
             END-VENDOR Acme\n",
        )
        .expect("Failed to merge dictionary");
    RadiusCodec::new(Arc::new(dictionary))
}

#[test]
fn test_request_and_accept_exchange() {
    let codec = codec_with_vendor();

    let mut request = RadiusPacket::new(Code::AccessRequest, 200, generate_request_authenticator());
    request.add_attribute("User-Name", "carol");
    request.add_attribute("User-Password", "correct horse battery staple");
    request.add_attribute("Proxy-State", vec![0x01u8, 0x02]);
    request.add_attribute("Message-Authenticator", vec![0u8; 16]);

    let request_bytes = codec.encode(&request, SECRET).expect("Failed to encode request");
    let received = codec
        .parse(&request_bytes, SECRET, None)
        .expect("Failed to parse request");
    assert_eq!(received.user_password(), Some("correct horse battery staple"));

    let mut accept = RadiusPacket::create_response(&received, Code::AccessAccept);
    accept.add_attribute("Acme-Role", "admin");
    accept.add_attribute("Acme-Level", "7");
    accept.add_attribute("Acme-Role", "auditor");
    for value in received.attribute_values("Proxy-State") {
        accept.add_attribute("Proxy-State", value.clone());
    }
    accept.add_attribute("Message-Authenticator", vec![0u8; 16]);

    let accept_bytes = codec.encode(&accept, SECRET).expect("Failed to encode accept");
    assert_eq!(accept_bytes[1], 200);
    assert!(verify_response_authenticator(
        &accept_bytes,
        &request.authenticator,
        SECRET
    ));

    let reply = codec
        .parse(&accept_bytes, SECRET, Some(&request.authenticator))
        .expect("Failed to parse accept");
    assert_eq!(
        reply.attribute_values("Acme-Role"),
        &[AttributeValue::from("admin"), AttributeValue::from("auditor")]
    );
    assert_eq!(reply.attribute("Acme-Level"), Some(&AttributeValue::Integer(7)));
    assert_eq!(
        reply.attribute("Proxy-State"),
        Some(&AttributeValue::Bytes(vec![0x01, 0x02]))
    );
}

#[test]
fn test_tampered_request_is_rejected() {
    let codec = codec_with_vendor();

    let mut request = RadiusPacket::new(Code::AccessRequest, 1, generate_request_authenticator());
    request.add_attribute("User-Name", "carol");
    request.add_attribute("Message-Authenticator", vec![0u8; 16]);

    let mut bytes = codec.encode(&request, SECRET).expect("Failed to encode request");
    // Flip a byte of the User-Name value
    bytes[22] ^= 0x20;

    assert!(matches!(
        codec.parse(&bytes, SECRET, None),
        Err(PacketError::InvalidMessageAuthenticator)
    ));
}

#[test]
fn test_disconnect_request_is_parsed_for_classification() {
    let codec = codec_with_vendor();

    let mut request = RadiusPacket::new(Code::DisconnectRequest, 9, [0u8; 16]);
    request.add_attribute("User-Name", "carol");
    request.add_attribute("Message-Authenticator", vec![0u8; 16]);

    let bytes = codec.encode(&request, SECRET).expect("Failed to encode request");
    let parsed = codec.parse(&bytes, SECRET, None).expect("Failed to parse request");
    assert_eq!(parsed.code, Code::DisconnectRequest);
    assert!(!parsed.code.is_response());

    let mut forged = bytes.clone();
    forged[4] ^= 0xff;
    assert!(matches!(
        codec.parse(&forged, SECRET, None),
        Err(PacketError::AuthenticatorMismatch)
    ));
}

#[test]
fn test_status_server_reply_uses_response_authenticator() {
    let codec = codec_with_vendor();

    let mut status = RadiusPacket::new(Code::StatusServer, 77, generate_request_authenticator());
    status.add_attribute("Message-Authenticator", vec![0u8; 16]);
    let received = codec
        .parse(&codec.encode(&status, SECRET).expect("Failed to encode"), SECRET, None)
        .expect("Failed to parse status");

    let mut accept = RadiusPacket::create_response(&received, Code::AccessAccept);
    accept.add_attribute("Reply-Message", "Server up 0 days 00:00:01");

    let bytes = codec.encode(&accept, SECRET).expect("Failed to encode accept");
    assert!(verify_response_authenticator(&bytes, &status.authenticator, SECRET));
}
