//! RADIUS upstream first factor
//!
//! Access-Requests are re-issued to the configured RADIUS server with a fresh
//! identifier and authenticator; User-Password is re-encrypted with the
//! upstream secret on encode. The reply is matched by identifier and its
//! Response Authenticator checked before it is handed back.

use crate::config::UpstreamSettings;
use async_trait::async_trait;
use radius_codec::{
    generate_request_authenticator, verify_response_authenticator, AttributeType, Code, PacketError, RadiusCodec,
    RadiusPacket,
};
use std::net::SocketAddr;
use std::time::Duration;
use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, warn};

#[derive(Error, Debug)]
pub enum UpstreamError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Packet error: {0}")]
    Packet(#[from] PacketError),

    #[error("Invalid upstream address: {0}")]
    Address(String),

    #[error("No response from {0} within {1:?}")]
    Timeout(SocketAddr, Duration),

    #[error("Unexpected upstream reply code {0:?}")]
    UnexpectedCode(Code),
}

/// First-factor RADIUS server
#[async_trait]
pub trait RadiusUpstream: Send + Sync {
    /// Forward an Access-Request and return the decoded reply
    async fn forward(&self, settings: &UpstreamSettings, request: &RadiusPacket) -> Result<RadiusPacket, UpstreamError>;
}

/// Build the request sent upstream from the one received from the NAS
///
/// Proxy-State belongs to the hop between NAS and gateway and is not
/// forwarded. A Message-Authenticator is always included.
pub fn upstream_request(request: &RadiusPacket, identifier: u8, authenticator: [u8; 16]) -> RadiusPacket {
    let mut forwarded = RadiusPacket::new(Code::AccessRequest, identifier, authenticator);
    let skipped = [AttributeType::ProxyState.name(), AttributeType::MessageAuthenticator.name()];

    for (name, values) in request.attributes() {
        if skipped.contains(&name) {
            continue;
        }
        for value in values {
            forwarded.add_attribute(name, value.clone());
        }
    }

    // CHAP without CHAP-Challenge uses the request authenticator as challenge
    if request.has_attribute(AttributeType::ChapPassword.name())
        && !request.has_attribute(AttributeType::ChapChallenge.name())
    {
        forwarded.add_attribute(AttributeType::ChapChallenge.name(), request.authenticator.to_vec());
    }

    forwarded.add_attribute(AttributeType::MessageAuthenticator.name(), vec![0u8; 16]);
    forwarded
}

/// UDP client for the upstream server
pub struct UdpRadiusUpstream {
    codec: RadiusCodec,
}

impl UdpRadiusUpstream {
    pub fn new(codec: RadiusCodec) -> Self {
        UdpRadiusUpstream { codec }
    }
}

#[async_trait]
impl RadiusUpstream for UdpRadiusUpstream {
    async fn forward(&self, settings: &UpstreamSettings, request: &RadiusPacket) -> Result<RadiusPacket, UpstreamError> {
        let address = settings
            .socket_addr()
            .map_err(|e| UpstreamError::Address(e.to_string()))?;
        let secret = settings.secret.as_bytes();

        let identifier = rand::random::<u8>();
        let authenticator = generate_request_authenticator();
        let forwarded = upstream_request(request, identifier, authenticator);
        let data = self.codec.encode(&forwarded, secret)?;

        let bind_addr: SocketAddr = if address.is_ipv4() {
            "0.0.0.0:0".parse().map_err(|_| UpstreamError::Address(address.to_string()))?
        } else {
            "[::]:0".parse().map_err(|_| UpstreamError::Address(address.to_string()))?
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.connect(address).await?;
        socket.send(&data).await?;

        debug!(upstream = %address, identifier, length = data.len(), "Access-Request forwarded upstream");

        let deadline = Instant::now() + settings.timeout();
        let mut buffer = vec![0u8; RadiusPacket::MAX_PACKET_SIZE];

        loop {
            let received = match timeout_at(deadline, socket.recv(&mut buffer)).await {
                Ok(result) => result?,
                Err(_) => return Err(UpstreamError::Timeout(address, settings.timeout())),
            };
            let reply = &buffer[..received];

            if reply.len() < RadiusPacket::MIN_PACKET_SIZE || reply[1] != identifier {
                debug!(upstream = %address, "Ignoring upstream datagram with foreign identifier");
                continue;
            }
            if !verify_response_authenticator(reply, &authenticator, secret) {
                warn!(upstream = %address, identifier, "Upstream reply has invalid Response Authenticator, ignoring");
                continue;
            }

            let packet = self.codec.parse(reply, secret, Some(&authenticator))?;
            return match packet.code {
                Code::AccessAccept | Code::AccessReject | Code::AccessChallenge => {
                    debug!(upstream = %address, code = ?packet.code, "Upstream reply received");
                    Ok(packet)
                }
                other => Err(UpstreamError::UnexpectedCode(other)),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use radius_codec::AttributeDictionary;
    use std::sync::Arc;

    fn codec() -> RadiusCodec {
        RadiusCodec::new(Arc::new(AttributeDictionary::builtin().unwrap()))
    }

    fn nas_request() -> RadiusPacket {
        let mut request = RadiusPacket::new(Code::AccessRequest, 9, [3u8; 16]);
        request.add_attribute("User-Name", "alice");
        request.add_attribute("User-Password", "secret");
        request.add_attribute("Proxy-State", vec![1u8, 2, 3]);
        request.add_attribute("Message-Authenticator", vec![0u8; 16]);
        request
    }

    #[test]
    fn test_upstream_request_drops_hop_attributes() {
        let forwarded = upstream_request(&nas_request(), 42, [5u8; 16]);

        assert_eq!(forwarded.identifier, 42);
        assert_eq!(forwarded.authenticator, [5u8; 16]);
        assert_eq!(forwarded.user_name().as_deref(), Some("alice"));
        assert_eq!(forwarded.user_password(), Some("secret"));
        assert!(!forwarded.has_attribute("Proxy-State"));
        assert_eq!(forwarded.attribute_values("Message-Authenticator").len(), 1);
    }

    #[test]
    fn test_chap_challenge_preserved() {
        let mut request = RadiusPacket::new(Code::AccessRequest, 1, [8u8; 16]);
        request.add_attribute("User-Name", "alice");
        request.add_attribute("CHAP-Password", vec![1u8; 17]);

        let forwarded = upstream_request(&request, 2, [0u8; 16]);
        assert_eq!(
            forwarded.attribute("CHAP-Challenge").map(|v| v.to_bytes()),
            Some(vec![8u8; 16])
        );
    }

    /// Answers one request, signing the reply with `reply_secret`
    async fn fake_server(reply_secret: &'static [u8], code: Code) -> SocketAddr {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let codec = codec();
            let mut buffer = vec![0u8; 4096];
            let (len, peer) = socket.recv_from(&mut buffer).await.unwrap();
            let request = codec.parse(&buffer[..len], b"upstream", None).unwrap();
            assert_eq!(request.user_password(), Some("secret"));

            let mut reply = RadiusPacket::create_response(&request, code);
            reply.add_attribute("Reply-Message", "from upstream");
            let data = codec.encode(&reply, reply_secret).unwrap();
            socket.send_to(&data, peer).await.unwrap();
        });
        address
    }

    fn settings(address: SocketAddr, secret: &str, timeout: u64) -> UpstreamSettings {
        UpstreamSettings {
            address: address.to_string(),
            secret: secret.to_string(),
            timeout,
        }
    }

    #[tokio::test]
    async fn test_forward_and_receive_accept() {
        let address = fake_server(b"upstream", Code::AccessAccept).await;
        let upstream = UdpRadiusUpstream::new(codec());

        let reply = upstream
            .forward(&settings(address, "upstream", 2), &nas_request())
            .await
            .unwrap();
        assert_eq!(reply.code, Code::AccessAccept);
        assert_eq!(reply.attribute_text("Reply-Message").as_deref(), Some("from upstream"));
    }

    #[tokio::test]
    async fn test_forged_reply_is_ignored_until_timeout() {
        let address = fake_server(b"other-secret", Code::AccessAccept).await;
        let upstream = UdpRadiusUpstream::new(codec());

        let result = upstream
            .forward(&settings(address, "upstream", 1), &nas_request())
            .await;
        assert!(matches!(result, Err(UpstreamError::Timeout(..))), "{:?}", result);
    }

    #[tokio::test]
    async fn test_timeout_without_server() {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let address = socket.local_addr().unwrap();
        let upstream = UdpRadiusUpstream::new(codec());

        let result = upstream
            .forward(&settings(address, "upstream", 1), &nas_request())
            .await;
        assert!(matches!(result, Err(UpstreamError::Timeout(..))));
        drop(socket);
    }
}
