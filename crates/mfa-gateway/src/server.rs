//! UDP server loop
//!
//! One task per datagram: resolve the client, parse with its secret, run the
//! pipeline and send the composed reply. Packets that fail any check are
//! dropped without an answer.

use crate::config::{ClientConfig, Config};
use crate::context::ExecutionContext;
use crate::error::GatewayError;
use crate::pipeline::{Collaborators, Pipeline};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use radius_codec::{AttributeDictionary, AttributeType, RadiusCodec, RadiusPacket};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Instant;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Build the codec from the built-in dictionary and the optional dictionary file
pub fn load_codec(config: &Config) -> Result<RadiusCodec, GatewayError> {
    let dictionary = match &config.dictionary_path {
        Some(path) => {
            info!(path = %path, "Loading attribute dictionary");
            AttributeDictionary::from_file(path)?
        }
        None => AttributeDictionary::builtin()?,
    };
    debug!(attributes = dictionary.len(), "Attribute dictionary loaded");
    Ok(RadiusCodec::new(Arc::new(dictionary)))
}

/// A request being processed
///
/// A NAS retransmits with the same identifier and authenticator while it
/// waits for an answer; those copies must not start a second MFA request.
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
struct RequestFingerprint {
    source: SocketAddr,
    identifier: u8,
    authenticator: [u8; 16],
}

#[derive(Default)]
struct InFlightRequests {
    requests: Arc<DashMap<RequestFingerprint, Instant>>,
}

impl InFlightRequests {
    /// None when the same request is already being processed
    fn begin(&self, fingerprint: RequestFingerprint) -> Option<InFlightGuard> {
        match self.requests.entry(fingerprint.clone()) {
            Entry::Occupied(_) => None,
            Entry::Vacant(vacant) => {
                vacant.insert(Instant::now());
                Some(InFlightGuard {
                    requests: Arc::clone(&self.requests),
                    fingerprint,
                })
            }
        }
    }

    fn len(&self) -> usize {
        self.requests.len()
    }
}

struct InFlightGuard {
    requests: Arc<DashMap<RequestFingerprint, Instant>>,
    fingerprint: RequestFingerprint,
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.requests.remove(&self.fingerprint);
    }
}

struct Shared {
    config: Config,
    clients: HashMap<String, Arc<ClientConfig>>,
    codec: RadiusCodec,
    pipeline: Pipeline,
    in_flight: InFlightRequests,
    socket: UdpSocket,
}

impl Shared {
    fn find_client(&self, source_ip: IpAddr, nas_identifier: Option<&str>) -> Option<Arc<ClientConfig>> {
        let client = self.config.find_client(source_ip, nas_identifier)?;
        self.clients.get(&client.name).cloned()
    }
}

/// The RADIUS second-factor gateway
pub struct RadiusGateway {
    shared: Arc<Shared>,
}

impl RadiusGateway {
    /// Bind the listening socket and assemble the pipeline
    pub async fn new(config: Config, codec: RadiusCodec, collaborators: Collaborators) -> Result<Self, GatewayError> {
        let pipeline = Pipeline::build(&config, collaborators, Instant::now())?;
        let bind_addr = config.socket_addr()?;
        let socket = UdpSocket::bind(bind_addr).await?;
        info!(address = %socket.local_addr()?, clients = config.clients.len(), "RADIUS gateway listening");

        let clients = config
            .clients
            .iter()
            .map(|client| (client.name.clone(), Arc::new(client.clone())))
            .collect();

        Ok(RadiusGateway {
            shared: Arc::new(Shared {
                config,
                clients,
                codec,
                pipeline,
                in_flight: InFlightRequests::default(),
                socket,
            }),
        })
    }

    /// Address the socket is bound to; useful when binding to port 0
    pub fn local_addr(&self) -> Result<SocketAddr, GatewayError> {
        Ok(self.shared.socket.local_addr()?)
    }

    /// Receive datagrams until the socket fails
    pub async fn run(&self) -> Result<(), GatewayError> {
        let mut buffer = vec![0u8; RadiusPacket::MAX_PACKET_SIZE];

        loop {
            let (length, source) = self.shared.socket.recv_from(&mut buffer).await?;
            let data = buffer[..length].to_vec();
            let shared = Arc::clone(&self.shared);

            tokio::spawn(async move {
                if let Err(e) = Self::handle_datagram(&shared, &data, source).await {
                    warn!(source = %source, error = %e, "Failed to handle request");
                }
            });
        }
    }

    async fn handle_datagram(shared: &Shared, data: &[u8], source: SocketAddr) -> Result<(), GatewayError> {
        let nas_identifier = RadiusCodec::peek_attribute(data, AttributeType::NasIdentifier as u8)
            .map(|raw| String::from_utf8_lossy(raw).into_owned());

        let Some(client) = shared.find_client(source.ip(), nas_identifier.as_deref()) else {
            warn!(
                source = %source,
                nas_identifier = nas_identifier.as_deref().unwrap_or("-"),
                "Request from unknown client, dropping"
            );
            return Ok(());
        };

        let request = match shared.codec.parse(data, client.get_secret(), None) {
            Ok(request) => request,
            Err(e) => {
                warn!(client = %client.name, source = %source, error = %e, "Invalid packet, dropping");
                return Ok(());
            }
        };

        let fingerprint = RequestFingerprint {
            source,
            identifier: request.identifier,
            authenticator: request.authenticator,
        };
        let Some(_guard) = shared.in_flight.begin(fingerprint) else {
            debug!(
                client = %client.name,
                identifier = request.identifier,
                in_flight = shared.in_flight.len(),
                "Retransmission of a request in progress, ignoring"
            );
            return Ok(());
        };

        debug!(
            client = %client.name,
            source = %source,
            code = ?request.code,
            identifier = request.identifier,
            "Received RADIUS packet"
        );

        let mut ctx = ExecutionContext::new(request, source, Arc::clone(&client));
        let Some(response) = shared.pipeline.process(&mut ctx).await else {
            return Ok(());
        };

        let bytes = shared.codec.encode(&response, client.get_secret())?;
        shared.socket.send_to(&bytes, source).await?;

        debug!(
            client = %client.name,
            code = ?response.code,
            identifier = response.identifier,
            length = bytes.len(),
            "Sent RADIUS response"
        );
        Ok(())
    }
}
