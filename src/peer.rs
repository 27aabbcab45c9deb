use {
    crate::{
        envelope::{decode_body_component, encode_body_component, Envelope, Payload, PeerId},
        error::{
            ChannelNotOpenSnafu, OfferCollisionSnafu, Result, RetriesExhaustedSnafu,
            UnknownPeerSnafu,
        },
    },
    async_trait::async_trait,
    snafu::{ensure, OptionExt},
    std::{
        collections::{HashMap, VecDeque},
        fmt,
        sync::{Arc, Mutex, Weak},
        time::Duration,
    },
    tokio::sync::watch,
    tracing::{debug, info},
};

/// How long to wait between looks at a channel that is still connecting,
/// and how many looks a send gets before it is abandoned.
pub const SEND_RETRY_INTERVAL: Duration = Duration::from_secs(3);
pub const MAX_SEND_RETRIES: u32 = 10;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ChannelState::Connecting => "connecting",
            ChannelState::Open => "open",
            ChannelState::Closing => "closing",
            ChannelState::Closed => "closed",
        };
        f.write_str(name)
    }
}

/// A per-peer data channel as provided by the transport. The watch handle
/// is the initialisation signal: armed at creation, it fires when the
/// channel transitions to open.
pub trait DataChannel: Send + Sync {
    fn state(&self) -> ChannelState;
    fn watch(&self) -> watch::Receiver<ChannelState>;
    fn transmit(&self, payload: &str) -> Result<()>;
    fn close(&self);
}

/// Connection-establishment events surfaced by the transport.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    LocalCandidate { peer: PeerId, candidate: String },
    ChannelOpen { peer: PeerId },
    ChannelClosed { peer: PeerId },
    Inbound { peer: PeerId, payload: String },
}

/// The interface the core requires from the peer-to-peer transport. A
/// WebRTC stack satisfies it; so does the in-process loopback below.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// The channel toward `peer`, created in `connecting` state on first use.
    fn channel(&self, peer: &str) -> Arc<dyn DataChannel>;

    /// Produces the local session description for an outgoing connection.
    /// A transport whose remote cannot trickle returns only once ICE
    /// gathering is complete, so the description is self-contained.
    async fn create_offer(&self, peer: &str) -> Result<String>;

    /// Consumes a remote offer and produces the local answer.
    async fn accept_offer(&self, peer: &str, offer: &str) -> Result<String>;

    /// Consumes the remote answer to an offer this side created.
    async fn accept_answer(&self, peer: &str, answer: &str) -> Result<()>;

    async fn add_remote_candidate(&self, peer: &str, candidate: &str) -> Result<()>;

    fn events(&self) -> flume::Receiver<TransportEvent>;
}

/// Offer/answer progress toward one remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Idle,
    HaveLocalOffer,
    HaveRemoteOffer,
    Stable,
    Closed,
}

impl fmt::Display for SignalingState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SignalingState::Idle => "IDLE",
            SignalingState::HaveLocalOffer => "HAVE_LOCAL_OFFER",
            SignalingState::HaveRemoteOffer => "HAVE_REMOTE_OFFER",
            SignalingState::Stable => "STABLE",
            SignalingState::Closed => "CLOSED",
        };
        f.write_str(name)
    }
}

/// One remote peer: its signalling progress, its data channel, and the
/// FIFO of payloads waiting for that channel to open.
pub struct PeerConnection {
    peer: PeerId,
    signaling: Mutex<SignalingState>,
    channel: Arc<dyn DataChannel>,
    outbox: Mutex<VecDeque<String>>,
    retry_interval: Duration,
}

impl PeerConnection {
    pub fn new(peer: PeerId, channel: Arc<dyn DataChannel>) -> Self {
        Self::with_retry_interval(peer, channel, SEND_RETRY_INTERVAL)
    }

    pub fn with_retry_interval(
        peer: PeerId,
        channel: Arc<dyn DataChannel>,
        retry_interval: Duration,
    ) -> Self {
        Self {
            peer,
            signaling: Mutex::new(SignalingState::Idle),
            channel,
            outbox: Mutex::new(VecDeque::new()),
            retry_interval,
        }
    }

    pub fn peer(&self) -> &str {
        &self.peer
    }

    pub fn signaling_state(&self) -> SignalingState {
        *self.signaling.lock().expect("signaling lock")
    }

    /// Starts an outgoing connection: IDLE -> HAVE_LOCAL_OFFER. Returns the
    /// `SESSION_OFFER` envelope to relay through the signalling server.
    pub async fn initiate(
        &self,
        transport: &dyn Transport,
        local: &str,
        host: Option<PeerId>,
    ) -> Result<Envelope> {
        {
            let state = self.signaling.lock().expect("signaling lock");
            ensure!(
                *state == SignalingState::Idle,
                OfferCollisionSnafu {
                    peer: self.peer.clone(),
                    state: state.to_string(),
                }
            );
        }

        let description = transport.create_offer(&self.peer).await?;
        *self.signaling.lock().expect("signaling lock") = SignalingState::HaveLocalOffer;
        debug!(peer = %self.peer, "sent session offer");

        Ok(Envelope::to_peer(
            local.to_string(),
            self.peer.clone(),
            host,
            Payload::SessionOffer {
                session_description: encode_body_component(&description),
            },
        ))
    }

    /// Consumes a remote offer: IDLE -> HAVE_REMOTE_OFFER -> STABLE once the
    /// answer is produced. Returns the `SESSION_ANSWER` envelope.
    pub async fn handle_offer(
        &self,
        transport: &dyn Transport,
        local: &str,
        encoded_description: &str,
    ) -> Result<Envelope> {
        {
            let mut state = self.signaling.lock().expect("signaling lock");
            ensure!(
                *state == SignalingState::Idle,
                OfferCollisionSnafu {
                    peer: self.peer.clone(),
                    state: state.to_string(),
                }
            );
            *state = SignalingState::HaveRemoteOffer;
        }

        let offer = decode_body_component(encoded_description)?;
        let answer = transport.accept_offer(&self.peer, &offer).await?;
        *self.signaling.lock().expect("signaling lock") = SignalingState::Stable;
        info!(peer = %self.peer, "answered session offer");

        Ok(Envelope::to_peer(
            local.to_string(),
            self.peer.clone(),
            None,
            Payload::SessionAnswer {
                session_description: encode_body_component(&answer),
            },
        ))
    }

    /// Consumes the remote answer: HAVE_LOCAL_OFFER -> STABLE.
    pub async fn handle_answer(
        &self,
        transport: &dyn Transport,
        encoded_description: &str,
    ) -> Result<()> {
        {
            let state = self.signaling.lock().expect("signaling lock");
            ensure!(
                *state == SignalingState::HaveLocalOffer,
                OfferCollisionSnafu {
                    peer: self.peer.clone(),
                    state: state.to_string(),
                }
            );
        }

        let answer = decode_body_component(encoded_description)?;
        transport.accept_answer(&self.peer, &answer).await?;
        *self.signaling.lock().expect("signaling lock") = SignalingState::Stable;
        info!(peer = %self.peer, "session established");
        Ok(())
    }

    /// Feeds a remote ICE candidate to the transport; legal in any state
    /// short of CLOSED and leaves the state untouched.
    pub async fn handle_candidate(
        &self,
        transport: &dyn Transport,
        encoded_candidate: &str,
    ) -> Result<()> {
        {
            let state = self.signaling.lock().expect("signaling lock");
            ensure!(
                *state != SignalingState::Closed,
                OfferCollisionSnafu {
                    peer: self.peer.clone(),
                    state: state.to_string(),
                }
            );
        }

        let candidate = decode_body_component(encoded_candidate)?;
        transport.add_remote_candidate(&self.peer, &candidate).await
    }

    /// Queues a payload and waits for the channel's initialisation signal,
    /// retrying a bounded number of times while it is still connecting.
    pub async fn send(&self, payload: String) -> Result<()> {
        self.outbox.lock().expect("outbox lock").push_back(payload);

        let mut signal = self.channel.watch();
        let mut retries = 0;
        loop {
            match self.channel.state() {
                ChannelState::Open => return self.flush(),
                ChannelState::Connecting => {
                    if retries >= MAX_SEND_RETRIES {
                        self.outbox.lock().expect("outbox lock").pop_back();
                        return RetriesExhaustedSnafu {
                            peer: self.peer.clone(),
                            retries,
                        }
                        .fail();
                    }
                    retries += 1;
                    tokio::select! {
                        changed = signal.changed() => {
                            if changed.is_err() {
                                // Transport dropped the channel handle.
                                self.close();
                            }
                        }
                        _ = tokio::time::sleep(self.retry_interval) => {}
                    }
                }
                state @ (ChannelState::Closing | ChannelState::Closed) => {
                    self.outbox.lock().expect("outbox lock").clear();
                    return ChannelNotOpenSnafu {
                        peer: self.peer.clone(),
                        state: state.to_string(),
                    }
                    .fail();
                }
            }
        }
    }

    /// Drains the outbox FIFO onto the open channel. Queued messages leave
    /// before anything newer, so nothing is reordered or duplicated.
    pub fn flush(&self) -> Result<()> {
        loop {
            let next = self.outbox.lock().expect("outbox lock").pop_front();
            let Some(payload) = next else {
                return Ok(());
            };
            if let Err(err) = self.channel.transmit(&payload) {
                self.outbox
                    .lock()
                    .expect("outbox lock")
                    .push_front(payload);
                return Err(err);
            }
        }
    }

    /// Tears the connection down; queued sends are discarded.
    pub fn close(&self) {
        *self.signaling.lock().expect("signaling lock") = SignalingState::Closed;
        self.outbox.lock().expect("outbox lock").clear();
        self.channel.close();
    }
}

/// An in-process transport: peers registered on the same hub exchange
/// payloads over paired channels. Used by the integration tests and by
/// embedders that already carry their own network.
pub struct LoopbackHub {
    endpoints: Mutex<HashMap<PeerId, Weak<LoopbackTransport>>>,
}

impl LoopbackHub {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            endpoints: Mutex::new(HashMap::new()),
        })
    }

    pub fn transport(self: &Arc<Self>, local: impl Into<PeerId>) -> Arc<LoopbackTransport> {
        let local = local.into();
        let (events_tx, events_rx) = flume::unbounded();
        let transport = Arc::new(LoopbackTransport {
            local: local.clone(),
            hub: Arc::downgrade(self),
            channels: Mutex::new(HashMap::new()),
            events_tx,
            events_rx,
        });
        self.endpoints
            .lock()
            .expect("hub lock")
            .insert(local, Arc::downgrade(&transport));
        transport
    }

    fn endpoint(&self, peer: &str) -> Option<Arc<LoopbackTransport>> {
        self.endpoints
            .lock()
            .expect("hub lock")
            .get(peer)
            .and_then(Weak::upgrade)
    }
}

pub struct LoopbackTransport {
    local: PeerId,
    hub: Weak<LoopbackHub>,
    channels: Mutex<HashMap<PeerId, Arc<LoopbackChannel>>>,
    events_tx: flume::Sender<TransportEvent>,
    events_rx: flume::Receiver<TransportEvent>,
}

impl LoopbackTransport {
    pub fn local(&self) -> &str {
        &self.local
    }

    fn loopback_channel(&self, peer: &str) -> Arc<LoopbackChannel> {
        let mut channels = self.channels.lock().expect("channel lock");
        channels
            .entry(peer.to_string())
            .or_insert_with(|| {
                Arc::new(LoopbackChannel::new(
                    self.local.clone(),
                    peer.to_string(),
                    self.hub.clone(),
                ))
            })
            .clone()
    }

    /// Marks the channel toward `peer` open and reports it, as a transport
    /// would once the underlying session comes up.
    fn open_channel(&self, peer: &str) {
        self.loopback_channel(peer).set_state(ChannelState::Open);
        let _ = self.events_tx.send(TransportEvent::ChannelOpen {
            peer: peer.to_string(),
        });
    }

    fn deliver(&self, from: &str, payload: String) {
        let _ = self.events_tx.send(TransportEvent::Inbound {
            peer: from.to_string(),
            payload,
        });
    }
}

#[async_trait]
impl Transport for LoopbackTransport {
    fn channel(&self, peer: &str) -> Arc<dyn DataChannel> {
        self.loopback_channel(peer)
    }

    async fn create_offer(&self, peer: &str) -> Result<String> {
        self.loopback_channel(peer);
        let _ = self.events_tx.send(TransportEvent::LocalCandidate {
            peer: peer.to_string(),
            candidate: format!(r#"{{"candidate":"loopback {}"}}"#, self.local),
        });
        Ok(format!(r#"{{"type":"offer","sdp":"loopback {}"}}"#, self.local))
    }

    async fn accept_offer(&self, peer: &str, _offer: &str) -> Result<String> {
        // The answering side is ready as soon as it has seen the offer.
        self.open_channel(peer);
        Ok(format!(r#"{{"type":"answer","sdp":"loopback {}"}}"#, self.local))
    }

    async fn accept_answer(&self, peer: &str, _answer: &str) -> Result<()> {
        self.open_channel(peer);
        Ok(())
    }

    async fn add_remote_candidate(&self, _peer: &str, _candidate: &str) -> Result<()> {
        Ok(())
    }

    fn events(&self) -> flume::Receiver<TransportEvent> {
        self.events_rx.clone()
    }
}

struct LoopbackChannel {
    local: PeerId,
    remote: PeerId,
    hub: Weak<LoopbackHub>,
    state_tx: watch::Sender<ChannelState>,
    state_rx: watch::Receiver<ChannelState>,
}

impl LoopbackChannel {
    fn new(local: PeerId, remote: PeerId, hub: Weak<LoopbackHub>) -> Self {
        let (state_tx, state_rx) = watch::channel(ChannelState::Connecting);
        Self {
            local,
            remote,
            hub,
            state_tx,
            state_rx,
        }
    }

    fn set_state(&self, state: ChannelState) {
        let _ = self.state_tx.send(state);
    }
}

impl DataChannel for LoopbackChannel {
    fn state(&self) -> ChannelState {
        *self.state_rx.borrow()
    }

    fn watch(&self) -> watch::Receiver<ChannelState> {
        self.state_rx.clone()
    }

    fn transmit(&self, payload: &str) -> Result<()> {
        let state = self.state();
        ensure!(
            state == ChannelState::Open,
            ChannelNotOpenSnafu {
                peer: self.remote.clone(),
                state: state.to_string(),
            }
        );
        let hub = self.hub.upgrade().context(UnknownPeerSnafu {
            peer: self.remote.clone(),
        })?;
        let endpoint = hub.endpoint(&self.remote).context(UnknownPeerSnafu {
            peer: self.remote.clone(),
        })?;
        endpoint.deliver(&self.local, payload.to_string());
        Ok(())
    }

    fn close(&self) {
        self.set_state(ChannelState::Closed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;

    struct StubChannel {
        state_tx: watch::Sender<ChannelState>,
        state_rx: watch::Receiver<ChannelState>,
        sent: Mutex<Vec<String>>,
    }

    impl StubChannel {
        fn new(state: ChannelState) -> Arc<Self> {
            let (state_tx, state_rx) = watch::channel(state);
            Arc::new(Self {
                state_tx,
                state_rx,
                sent: Mutex::new(Vec::new()),
            })
        }

        fn open(&self) {
            let _ = self.state_tx.send(ChannelState::Open);
        }
    }

    impl DataChannel for StubChannel {
        fn state(&self) -> ChannelState {
            *self.state_rx.borrow()
        }

        fn watch(&self) -> watch::Receiver<ChannelState> {
            self.state_rx.clone()
        }

        fn transmit(&self, payload: &str) -> Result<()> {
            self.sent.lock().unwrap().push(payload.to_string());
            Ok(())
        }

        fn close(&self) {
            let _ = self.state_tx.send(ChannelState::Closed);
        }
    }

    fn quick_conn(channel: Arc<StubChannel>) -> PeerConnection {
        PeerConnection::with_retry_interval(
            "remote".to_string(),
            channel,
            Duration::from_millis(1),
        )
    }

    #[tokio::test]
    async fn test_send_on_open_channel() {
        let channel = StubChannel::new(ChannelState::Open);
        let conn = quick_conn(channel.clone());

        conn.send("one".into()).await.unwrap();
        conn.send("two".into()).await.unwrap();

        assert_eq!(*channel.sent.lock().unwrap(), vec!["one", "two"]);
    }

    #[tokio::test]
    async fn test_send_retries_are_bounded() {
        let channel = StubChannel::new(ChannelState::Connecting);
        let conn = quick_conn(channel.clone());

        let err = conn.send("lost".into()).await.unwrap_err();
        assert!(matches!(
            err,
            Error::RetriesExhausted { retries, .. } if retries == MAX_SEND_RETRIES
        ));
        assert!(channel.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queued_messages_drain_on_open_in_order() {
        let channel = StubChannel::new(ChannelState::Connecting);
        let conn = Arc::new(quick_conn(channel.clone()));

        let sender = {
            let conn = conn.clone();
            tokio::spawn(async move { conn.send("queued".into()).await })
        };
        tokio::time::sleep(Duration::from_millis(2)).await;
        channel.open();
        sender.await.unwrap().unwrap();
        conn.send("after".into()).await.unwrap();

        assert_eq!(*channel.sent.lock().unwrap(), vec!["queued", "after"]);
    }

    #[tokio::test]
    async fn test_send_to_closed_channel_is_an_error() {
        let channel = StubChannel::new(ChannelState::Closed);
        let conn = quick_conn(channel);

        let err = conn.send("nope".into()).await.unwrap_err();
        assert!(matches!(err, Error::ChannelNotOpen { .. }));
    }

    #[tokio::test]
    async fn test_offer_answer_reaches_stable() {
        let hub = LoopbackHub::new();
        let a = hub.transport("peer-a");
        let b = hub.transport("peer-b");

        let conn_a = PeerConnection::new("peer-b".into(), a.channel("peer-b"));
        let conn_b = PeerConnection::new("peer-a".into(), b.channel("peer-a"));

        let offer = conn_a.initiate(a.as_ref(), "peer-a", None).await.unwrap();
        assert_eq!(conn_a.signaling_state(), SignalingState::HaveLocalOffer);

        let Payload::SessionOffer {
            session_description,
        } = offer.payload
        else {
            panic!("expected an offer");
        };
        let answer = conn_b
            .handle_offer(b.as_ref(), "peer-b", &session_description)
            .await
            .unwrap();
        assert_eq!(conn_b.signaling_state(), SignalingState::Stable);

        let Payload::SessionAnswer {
            session_description,
        } = answer.payload
        else {
            panic!("expected an answer");
        };
        conn_a
            .handle_answer(a.as_ref(), &session_description)
            .await
            .unwrap();
        assert_eq!(conn_a.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn test_second_offer_collides() {
        let hub = LoopbackHub::new();
        let a = hub.transport("peer-a");
        let conn = PeerConnection::new("peer-b".into(), a.channel("peer-b"));

        conn.initiate(a.as_ref(), "peer-a", None).await.unwrap();
        let err = conn.initiate(a.as_ref(), "peer-a", None).await.unwrap_err();
        assert!(matches!(err, Error::OfferCollision { .. }));
    }

    #[tokio::test]
    async fn test_loopback_round_trip() {
        let hub = LoopbackHub::new();
        let a = hub.transport("peer-a");
        let b = hub.transport("peer-b");

        let conn_a = PeerConnection::new("peer-b".into(), a.channel("peer-b"));
        let conn_b = PeerConnection::new("peer-a".into(), b.channel("peer-a"));

        let offer = conn_a.initiate(a.as_ref(), "peer-a", None).await.unwrap();
        let Payload::SessionOffer {
            session_description,
        } = offer.payload
        else {
            unreachable!()
        };
        let answer = conn_b
            .handle_offer(b.as_ref(), "peer-b", &session_description)
            .await
            .unwrap();
        let Payload::SessionAnswer {
            session_description,
        } = answer.payload
        else {
            unreachable!()
        };
        conn_a
            .handle_answer(a.as_ref(), &session_description)
            .await
            .unwrap();

        conn_a.send("hello".into()).await.unwrap();
        let event = b.events().recv_async().await.unwrap();
        let TransportEvent::ChannelOpen { .. } = event else {
            panic!("expected channel open first, got {event:?}");
        };
        let event = b.events().recv_async().await.unwrap();
        let TransportEvent::Inbound { peer, payload } = event else {
            panic!("expected inbound payload, got {event:?}");
        };
        assert_eq!(peer, "peer-a");
        assert_eq!(payload, "hello");
    }
}
