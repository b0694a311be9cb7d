//! # Partner Transport
//!
//! The partner is reached through an external message-passing system. The
//! relay only needs two things from it:
//!
//! - **Outbound**: [`PartnerTransport::send`] delivers one frame to a partner
//! - **Inbound**: partner messages are pushed into a [`PartnerInbox`], which
//!   a single relay task drains in order
//!
//! Two transports are provided. [`HttpPartnerTransport`] talks to another
//! forwarder's control API; [`ChannelTransport`] keeps everything in-process.

use std::collections::HashMap;

use async_trait::async_trait;
use fwd_protocol::Request;
use reqwest::StatusCode;
use tokio::sync::mpsc;
use tracing::debug;
use url::Url;

use crate::config::PartnerConfig;
use crate::registry::{ConnectionId, Frame};

/// Header carrying the sender's node identity on a forwarded frame.
pub const NODE_HEADER: &str = "x-fwd-node";

/// Header carrying the id of the WebSocket connection a frame came from.
pub const ORIGIN_HEADER: &str = "x-fwd-connection";

/// A frame on its way to the partner, tagged with the connection it arrived
/// on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub origin: ConnectionId,
    pub payload: Frame,
}

/// A frame received from some node, not yet checked against the partner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartnerMessage {
    pub source: String,
    pub payload: Frame,
}

/// Where transports hand over frames received from partners.
pub type PartnerInbox = mpsc::Sender<PartnerMessage>;

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("no route to partner '{0}'")]
    UnknownPartner(String),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("partner rejected frame with status {0}")]
    Rejected(StatusCode),

    #[error("transport closed")]
    Closed,
}

/// Delivers frames to a partner.
#[async_trait]
pub trait PartnerTransport: Send + Sync {
    async fn send(&self, partner: &str, envelope: Envelope) -> Result<(), TransportError>;
}

// ─── HTTP Transport ─────────────────────────────────────────────

/// Forwards frames to the partner's forwarder as `PUT /api {"Forward": ..}`.
///
/// Partner identities are resolved through the configured peer table; an
/// identity that is itself an `http(s)://` URL is used as the base URL.
pub struct HttpPartnerTransport {
    client: reqwest::Client,
    node: String,
    peers: HashMap<String, String>,
}

impl HttpPartnerTransport {
    pub fn new(config: &PartnerConfig) -> Result<Self, TransportError> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .build()?;
        Ok(Self {
            client,
            node: config.node.clone(),
            peers: config.peers.clone(),
        })
    }

    fn resolve(&self, partner: &str) -> Result<Url, TransportError> {
        let base = match self.peers.get(partner) {
            Some(base) => base.as_str(),
            None if partner.starts_with("http://") || partner.starts_with("https://") => partner,
            None => return Err(TransportError::UnknownPartner(partner.to_string())),
        };
        let mut url =
            Url::parse(base).map_err(|_| TransportError::UnknownPartner(partner.to_string()))?;
        let path = format!("{}/api", url.path().trim_end_matches('/'));
        url.set_path(&path);
        Ok(url)
    }
}

#[async_trait]
impl PartnerTransport for HttpPartnerTransport {
    async fn send(&self, partner: &str, envelope: Envelope) -> Result<(), TransportError> {
        let url = self.resolve(partner)?;
        debug!("Forwarding frame from {} to {}", envelope.origin, url);
        let response = self
            .client
            .put(url)
            .header(NODE_HEADER, &self.node)
            .header(ORIGIN_HEADER, envelope.origin.to_string())
            .json(&Request::Forward(envelope.payload))
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(TransportError::Rejected(response.status()))
        }
    }
}

// ─── In-process Transport ───────────────────────────────────────

/// A frame handed to a [`ChannelTransport`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub partner: String,
    pub envelope: Envelope,
}

/// Hands every frame to an in-process receiver.
pub struct ChannelTransport {
    tx: mpsc::UnboundedSender<Delivery>,
}

impl ChannelTransport {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Delivery>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

#[async_trait]
impl PartnerTransport for ChannelTransport {
    async fn send(&self, partner: &str, envelope: Envelope) -> Result<(), TransportError> {
        self.tx
            .send(Delivery {
                partner: partner.to_string(),
                envelope,
            })
            .map_err(|_| TransportError::Closed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{extract::State, http::HeaderMap, routing::put, Json, Router};
    use uuid::Uuid;

    fn http_transport(peers: &[(&str, &str)]) -> HttpPartnerTransport {
        let config = PartnerConfig {
            node: "carol.os".into(),
            peers: peers
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
            ..PartnerConfig::default()
        };
        HttpPartnerTransport::new(&config).unwrap()
    }

    #[test]
    fn resolves_peers_and_literal_urls() {
        let transport = http_transport(&[("bob.os", "http://10.0.0.7:8090")]);
        assert_eq!(
            transport.resolve("bob.os").unwrap().as_str(),
            "http://10.0.0.7:8090/api"
        );
        assert_eq!(
            transport.resolve("https://relay.example/fwd/").unwrap().as_str(),
            "https://relay.example/fwd/api"
        );
        assert!(matches!(
            transport.resolve("dave.os"),
            Err(TransportError::UnknownPartner(_))
        ));
    }

    #[tokio::test]
    async fn channel_transport_hands_over_deliveries() {
        let (transport, mut rx) = ChannelTransport::new();
        let origin = Uuid::new_v4();
        transport
            .send(
                "alice.os",
                Envelope {
                    origin,
                    payload: "pong".into(),
                },
            )
            .await
            .unwrap();

        let delivery = rx.recv().await.unwrap();
        assert_eq!(delivery.partner, "alice.os");
        assert_eq!(delivery.envelope.origin, origin);
        assert_eq!(delivery.envelope.payload, "pong");

        drop(rx);
        let err = transport
            .send(
                "alice.os",
                Envelope {
                    origin,
                    payload: "lost".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, TransportError::Closed));
    }

    #[tokio::test]
    async fn http_transport_puts_forward_requests() {
        let (seen_tx, mut seen_rx) = mpsc::unbounded_channel::<(HeaderMap, Request)>();
        let app = Router::new()
            .route(
                "/api",
                put(
                    |State(tx): State<mpsc::UnboundedSender<(HeaderMap, Request)>>,
                     headers: HeaderMap,
                     Json(request): Json<Request>| async move {
                        let _ = tx.send((headers, request));
                        axum::http::StatusCode::ACCEPTED
                    },
                ),
            )
            .with_state(seen_tx);
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move { axum::serve(listener, app).await });

        let base = format!("http://{addr}");
        let transport = http_transport(&[("bob.os", base.as_str())]);
        let origin = Uuid::new_v4();
        transport
            .send(
                "bob.os",
                Envelope {
                    origin,
                    payload: "hello".into(),
                },
            )
            .await
            .unwrap();

        let (headers, request) = seen_rx.recv().await.unwrap();
        assert_eq!(request, Request::Forward("hello".into()));
        assert_eq!(headers[NODE_HEADER], "carol.os");
        assert_eq!(headers[ORIGIN_HEADER], origin.to_string().as_str());
    }
}
