use {
    crate::{
        envelope::{Envelope, Payload, PeerId, Target},
        error::{
            MissingFieldSnafu, MissingPeerIdSnafu, Result, SenderIsSelfSnafu, ServerClosedSnafu,
            TargetMismatchSnafu, UnknownPeerSnafu, WebSocketSnafu, WireSnafu,
        },
    },
    async_trait::async_trait,
    futures::{
        stream::{SplitSink, SplitStream},
        SinkExt, StreamExt,
    },
    serde::Deserialize,
    snafu::{ensure, OptionExt, ResultExt},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
    },
    tokio::net::TcpStream,
    tokio_tungstenite::{
        connect_async,
        tungstenite::{client::IntoClientRequest, http::HeaderValue, Message},
        MaybeTlsStream, WebSocketStream,
    },
    tracing::{debug, info, warn},
};

/// What the connection layer needs from its signalling edge: relay an
/// envelope out, surface validated envelopes in. Implemented by the
/// websocket client and by the in-process hub below.
#[async_trait]
pub trait SignalingChannel: Send + Sync + 'static {
    async fn relay(&self, envelope: &Envelope) -> Result<()>;
    fn incoming(&self) -> flume::Receiver<Envelope>;
}

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;
type WsSource = SplitStream<WebSocketStream<MaybeTlsStream<TcpStream>>>;

/// The rendezvous server relays envelopes wrapped in a `data` field.
#[derive(Deserialize)]
struct ServerFrame {
    data: String,
}

/// Validated traffic from the signalling edge. `ASSIGN_PEER_ID` is absorbed
/// here: the assigned ID is cached and republished inward as a
/// `LOCAL_PEER_ID` envelope.
pub struct Inbox {
    envelopes: flume::Sender<Envelope>,
    local_peer: tokio::sync::watch::Sender<Option<PeerId>>,
}

impl Inbox {
    fn new(
        envelopes: flume::Sender<Envelope>,
        local_peer: tokio::sync::watch::Sender<Option<PeerId>>,
    ) -> Self {
        Self {
            envelopes,
            local_peer,
        }
    }

    /// Checks one raw websocket frame and forwards it inward. Every failure
    /// leaves all state untouched; the caller logs and drops the frame.
    pub fn accept(&self, text: &str) -> Result<()> {
        let frame: ServerFrame = serde_json::from_str(text).context(WireSnafu)?;
        let envelope = Envelope::from_wire(&frame.data)?;
        let local = self.local_peer.borrow().clone();
        validate_inbound(&envelope, local.as_deref())?;

        let forwarded = match &envelope.payload {
            Payload::AssignPeerId { assigned_peer_id } => {
                info!(peer_id = %assigned_peer_id, "server assigned our peer id");
                self.local_peer.send_replace(Some(assigned_peer_id.clone()));
                // Republished inward off the signalling edge, so it passes
                // the host filter's untargeted-server clause.
                Envelope::to_server(
                    None,
                    Payload::LocalPeerId {
                        local_peer_id: assigned_peer_id.clone(),
                    },
                )
            }
            _ => envelope,
        };
        let _ = self.envelopes.send(forwarded);
        Ok(())
    }
}

/// The §4.8 validation rules: offers and answers must come from somebody
/// else, be addressed to us, and carry a description; candidates must carry
/// a payload; an assigned peer ID must be non-empty.
pub fn validate_inbound(envelope: &Envelope, local: Option<&str>) -> Result<()> {
    match &envelope.payload {
        Payload::AssignPeerId { assigned_peer_id } => {
            ensure!(!assigned_peer_id.is_empty(), MissingPeerIdSnafu);
        }
        Payload::SessionOffer {
            session_description,
        }
        | Payload::SessionAnswer {
            session_description,
        } => {
            let sender = envelope
                .header
                .sender
                .as_deref()
                .context(MissingPeerIdSnafu)?;
            if let Some(local) = local {
                ensure!(sender != local, SenderIsSelfSnafu { peer: sender });
                ensure!(
                    envelope.header.targets(local),
                    TargetMismatchSnafu {
                        target: format!("{:?}", envelope.header.target),
                        local,
                    }
                );
            }
            ensure!(
                !session_description.is_empty(),
                MissingFieldSnafu {
                    kind: envelope.kind().as_str(),
                    field: "session_description",
                }
            );
        }
        Payload::NewIceCandidate { ice_candidate } => {
            ensure!(
                !ice_candidate.is_empty(),
                MissingFieldSnafu {
                    kind: envelope.kind().as_str(),
                    field: "ice_candidate",
                }
            );
        }
        _ => {}
    }
    Ok(())
}

/// The signalling client: one websocket to the rendezvous server, a reader
/// task feeding validated envelopes inward, and a serialised send path.
pub struct SignalingClient {
    sink: tokio::sync::Mutex<WsSink>,
    envelopes: flume::Receiver<Envelope>,
    local_peer: tokio::sync::watch::Receiver<Option<PeerId>>,
    reader: tokio::task::JoinHandle<()>,
}

impl SignalingClient {
    /// Connects to `ws://host:port` with the `json` sub-protocol.
    pub async fn connect(host: &str, port: u16) -> Result<Self> {
        let url = format!("ws://{host}:{port}");
        let mut request = url.as_str().into_client_request().context(WebSocketSnafu)?;
        request.headers_mut().insert(
            "Sec-WebSocket-Protocol",
            HeaderValue::from_static("json"),
        );

        let (stream, _) = connect_async(request).await.context(WebSocketSnafu)?;
        info!(%url, "connected to signalling server");
        let (sink, source) = stream.split();

        let (envelope_tx, envelope_rx) = flume::unbounded();
        let (local_tx, local_rx) = tokio::sync::watch::channel(None);
        let inbox = Inbox::new(envelope_tx, local_tx);
        let reader = tokio::spawn(read_loop(source, inbox));

        Ok(Self {
            sink: tokio::sync::Mutex::new(sink),
            envelopes: envelope_rx,
            local_peer: local_rx,
            reader,
        })
    }

    /// Validated inbound envelopes, `ASSIGN_PEER_ID` already rewritten to
    /// `LOCAL_PEER_ID`.
    pub fn incoming(&self) -> flume::Receiver<Envelope> {
        self.envelopes.clone()
    }

    /// The peer ID the server assigned, once it has.
    pub fn local_peer_id(&self) -> tokio::sync::watch::Receiver<Option<PeerId>> {
        self.local_peer.clone()
    }

    /// Waits until the server has assigned this client its peer ID.
    pub async fn wait_for_peer_id(&self) -> Result<PeerId> {
        let mut watch = self.local_peer.clone();
        loop {
            if let Some(id) = watch.borrow().clone() {
                return Ok(id);
            }
            if watch.changed().await.is_err() {
                return ServerClosedSnafu.fail();
            }
        }
    }

    /// Relays an envelope through the server.
    pub async fn send(&self, envelope: &Envelope) -> Result<()> {
        let wire = envelope.to_wire()?;
        let mut sink = self.sink.lock().await;
        sink.send(Message::Text(wire)).await.context(WebSocketSnafu)
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

#[async_trait]
impl SignalingChannel for SignalingClient {
    async fn relay(&self, envelope: &Envelope) -> Result<()> {
        self.send(envelope).await
    }

    fn incoming(&self) -> flume::Receiver<Envelope> {
        self.incoming()
    }
}

/// An in-process rendezvous: assigns peer IDs and relays envelopes between
/// endpoints on the same hub. Stands in for the signalling server in tests
/// and single-process embeddings.
pub struct LocalSignalingHub {
    inboxes: Mutex<HashMap<PeerId, flume::Sender<Envelope>>>,
}

impl LocalSignalingHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inboxes: Mutex::new(HashMap::new()),
        })
    }

    /// Registers an endpoint under a fresh UUID peer ID. The assignment is
    /// announced inward as a `LOCAL_PEER_ID` envelope, the way the real
    /// client republishes `ASSIGN_PEER_ID`.
    pub fn endpoint(self: &Arc<Self>) -> (Arc<LocalSignaling>, PeerId) {
        let peer_id = uuid::Uuid::new_v4().to_string();
        let endpoint = self.endpoint_with_id(peer_id.clone());
        (endpoint, peer_id)
    }

    pub fn endpoint_with_id(self: &Arc<Self>, peer_id: PeerId) -> Arc<LocalSignaling> {
        let (tx, rx) = flume::unbounded();
        let _ = tx.send(Envelope::to_server(
            None,
            Payload::LocalPeerId {
                local_peer_id: peer_id.clone(),
            },
        ));
        self.inboxes
            .lock()
            .expect("hub lock")
            .insert(peer_id.clone(), tx);
        Arc::new(LocalSignaling {
            hub: self.clone(),
            peer_id,
            incoming: rx,
        })
    }

    fn deliver(&self, envelope: &Envelope) -> Result<()> {
        let Some(Target::One(target)) = &envelope.header.target else {
            debug!(kind = %envelope.kind(), "hub absorbing untargeted server message");
            return Ok(());
        };
        let inboxes = self.inboxes.lock().expect("hub lock");
        let inbox = inboxes.get(target).context(UnknownPeerSnafu {
            peer: target.clone(),
        })?;
        let _ = inbox.send(envelope.clone());
        Ok(())
    }
}

pub struct LocalSignaling {
    hub: Arc<LocalSignalingHub>,
    peer_id: PeerId,
    incoming: flume::Receiver<Envelope>,
}

impl LocalSignaling {
    pub fn peer_id(&self) -> &str {
        &self.peer_id
    }
}

#[async_trait]
impl SignalingChannel for LocalSignaling {
    async fn relay(&self, envelope: &Envelope) -> Result<()> {
        self.hub.deliver(envelope)
    }

    fn incoming(&self) -> flume::Receiver<Envelope> {
        self.incoming.clone()
    }
}

#[tracing::instrument(name = "signaling_reader", skip_all)]
async fn read_loop(mut source: WsSource, inbox: Inbox) {
    while let Some(frame) = source.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                if let Err(err) = inbox.accept(&text) {
                    warn!(%err, "dropping invalid server message");
                }
            }
            Ok(Message::Close(_)) => {
                info!("signalling server closed the connection");
                break;
            }
            Ok(other) => debug!(?other, "ignoring non-text websocket frame"),
            Err(err) => {
                warn!(%err, "signalling socket failed");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::envelope::{encode_body_component, Flag};
    use crate::error::Error;

    fn inbox() -> (
        Inbox,
        flume::Receiver<Envelope>,
        tokio::sync::watch::Receiver<Option<PeerId>>,
    ) {
        let (tx, rx) = flume::unbounded();
        let (local_tx, local_rx) = tokio::sync::watch::channel(None);
        (Inbox::new(tx, local_tx), rx, local_rx)
    }

    fn frame(envelope: &Envelope) -> String {
        serde_json::json!({ "data": envelope.to_wire().unwrap() }).to_string()
    }

    #[test]
    fn test_assign_peer_id_is_cached_and_republished() {
        let (inbox, rx, local) = inbox();
        let envelope = Envelope::to_server(
            None,
            Payload::AssignPeerId {
                assigned_peer_id: "abc".into(),
            },
        );

        inbox.accept(&frame(&envelope)).unwrap();

        assert_eq!(local.borrow().as_deref(), Some("abc"));
        let forwarded = rx.try_recv().unwrap();
        assert_eq!(
            forwarded.payload,
            Payload::LocalPeerId {
                local_peer_id: "abc".into()
            }
        );
    }

    #[test]
    fn test_frame_without_data_field_is_rejected() {
        let (inbox, rx, _) = inbox();
        assert!(inbox.accept(r#"{"noise": true}"#).is_err());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_unknown_type_inside_data_is_rejected() {
        let (inbox, rx, _) = inbox();
        let text = serde_json::json!({
            "data": r#"{"header":{"type":"GOSSIP"},"body":{}}"#
        })
        .to_string();
        let err = inbox.accept(&text).unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType { .. }));
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_offer_from_self_is_rejected() {
        let (inbox, rx, _) = inbox();
        inbox
            .accept(&frame(&Envelope::to_server(
                None,
                Payload::AssignPeerId {
                    assigned_peer_id: "me".into(),
                },
            )))
            .unwrap();
        rx.try_recv().unwrap();

        let offer = Envelope::to_peer(
            "me".into(),
            "me".into(),
            None,
            Payload::SessionOffer {
                session_description: encode_body_component("{}"),
            },
        );
        let err = inbox.accept(&frame(&offer)).unwrap_err();
        assert!(matches!(err, Error::SenderIsSelf { .. }));
    }

    #[test]
    fn test_offer_for_someone_else_is_rejected() {
        let (inbox, rx, _) = inbox();
        inbox
            .accept(&frame(&Envelope::to_server(
                None,
                Payload::AssignPeerId {
                    assigned_peer_id: "me".into(),
                },
            )))
            .unwrap();
        rx.try_recv().unwrap();

        let offer = Envelope::to_peer(
            "them".into(),
            "somebody-else".into(),
            None,
            Payload::SessionOffer {
                session_description: encode_body_component("{}"),
            },
        );
        let err = inbox.accept(&frame(&offer)).unwrap_err();
        assert!(matches!(err, Error::TargetMismatch { .. }));
    }

    #[test]
    fn test_empty_candidate_is_rejected() {
        let candidate = Envelope::to_peer(
            "them".into(),
            "me".into(),
            None,
            Payload::NewIceCandidate {
                ice_candidate: String::new(),
            },
        );
        let err = validate_inbound(&candidate, Some("me")).unwrap_err();
        assert!(matches!(err, Error::MissingField { .. }));
    }

    #[test]
    fn test_valid_offer_is_forwarded() {
        let (inbox, rx, _) = inbox();
        inbox
            .accept(&frame(&Envelope::to_server(
                None,
                Payload::AssignPeerId {
                    assigned_peer_id: "me".into(),
                },
            )))
            .unwrap();
        rx.try_recv().unwrap();

        let offer = Envelope::to_peer(
            "them".into(),
            "me".into(),
            None,
            Payload::SessionOffer {
                session_description: encode_body_component(r#"{"type":"offer"}"#),
            },
        );
        inbox.accept(&frame(&offer)).unwrap();

        let forwarded = rx.try_recv().unwrap();
        assert_eq!(forwarded.header.flag, Some(Flag::Peer));
        assert_eq!(forwarded.header.sender.as_deref(), Some("them"));
    }
}
