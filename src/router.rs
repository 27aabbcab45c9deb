use {
    crate::{
        envelope::{Envelope, Flag, Payload, PeerId, Target},
        error::{Result, SelfTargetSnafu},
        peer::{PeerConnection, Transport, TransportEvent, SEND_RETRY_INTERVAL},
        queue::{queue_pair, QueuePublisher, QueueSubscriber},
        signaling::SignalingChannel,
    },
    snafu::ensure,
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    },
    tracing::{debug, error, warn},
};

/// The connection layer: owns the signalling edge, the per-peer
/// connections, and the queue handles it lends to portal bindings.
/// Outbound envelopes are routed by flag and target; inbound traffic fans
/// out to every binding's incoming queue, where the binding filters decide.
pub struct ConnectionLayer {
    local_peer_id: PeerId,
    transport: Arc<dyn Transport>,
    signaling: Arc<dyn SignalingChannel>,
    peers: Mutex<HashMap<PeerId, Arc<PeerConnection>>>,
    binding_inboxes: Mutex<Vec<QueuePublisher>>,
    retry_interval: Duration,
    pumps: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl ConnectionLayer {
    pub fn new(
        local_peer_id: PeerId,
        transport: Arc<dyn Transport>,
        signaling: Arc<dyn SignalingChannel>,
    ) -> Arc<Self> {
        Self::with_retry_interval(local_peer_id, transport, signaling, SEND_RETRY_INTERVAL)
    }

    pub fn with_retry_interval(
        local_peer_id: PeerId,
        transport: Arc<dyn Transport>,
        signaling: Arc<dyn SignalingChannel>,
        retry_interval: Duration,
    ) -> Arc<Self> {
        let layer = Arc::new(Self {
            local_peer_id,
            transport,
            signaling,
            peers: Mutex::new(HashMap::new()),
            binding_inboxes: Mutex::new(Vec::new()),
            retry_interval,
            pumps: Mutex::new(Vec::new()),
        });
        layer.spawn_pumps();
        layer
    }

    pub fn local_peer_id(&self) -> &str {
        &self.local_peer_id
    }

    /// Hands a binding its queue pair: a subscriber fed with inbound
    /// traffic, and a publisher whose messages are routed outward.
    pub fn register_binding(self: &Arc<Self>) -> (QueueSubscriber, QueuePublisher) {
        let (inbound_pub, inbound_sub) = queue_pair();
        let (outbound_pub, outbound_sub) = queue_pair();

        self.binding_inboxes
            .lock()
            .expect("inbox lock")
            .push(inbound_pub);

        let layer = self.clone();
        let drain = tokio::spawn(async move {
            while let Some(envelope) = outbound_sub.next().await {
                if let Err(err) = layer.route(envelope).await {
                    warn!(%err, "failed to route outbound message");
                }
            }
        });
        self.pumps.lock().expect("pump lock").push(drain);

        (inbound_sub, outbound_pub)
    }

    /// Sends one envelope where its header says: the signalling server for
    /// SERVER-flagged traffic, otherwise the targeted peer or peers.
    pub async fn route(&self, envelope: Envelope) -> Result<()> {
        if envelope.header.flag == Some(Flag::Server) {
            return self.signaling.relay(&envelope).await;
        }

        match envelope.header.target.clone() {
            Some(Target::One(peer)) => self.send_to_peer(&peer, &envelope).await,
            Some(Target::Many(peers)) => {
                // Per-peer failures are logged, not propagated, so one dead
                // guest cannot stall the rest of the fan-out.
                for peer in peers {
                    if let Err(err) = self.send_to_peer(&peer, &envelope).await {
                        error!(%peer, %err, "failed to send to peer");
                    }
                }
                Ok(())
            }
            None => {
                warn!(kind = %envelope.kind(), "dropping untargeted non-server message");
                Ok(())
            }
        }
    }

    async fn send_to_peer(&self, peer: &str, envelope: &Envelope) -> Result<()> {
        ensure!(peer != self.local_peer_id, SelfTargetSnafu { peer });
        let (connection, fresh) = self.connection_to(peer);
        if fresh {
            // Auto-connect: shepherd an offer through the signalling server.
            let offer = connection
                .initiate(self.transport.as_ref(), &self.local_peer_id, None)
                .await?;
            self.signaling.relay(&offer).await?;
        }
        connection.send(envelope.to_wire()?).await
    }

    /// Fetches or creates the connection record for `peer`; the flag says
    /// whether it was just created.
    fn connection_to(&self, peer: &str) -> (Arc<PeerConnection>, bool) {
        let mut peers = self.peers.lock().expect("peer lock");
        if let Some(existing) = peers.get(peer) {
            return (existing.clone(), false);
        }
        let connection = Arc::new(PeerConnection::with_retry_interval(
            peer.to_string(),
            self.transport.channel(peer),
            self.retry_interval,
        ));
        peers.insert(peer.to_string(), connection.clone());
        (connection, true)
    }

    /// Copies an inbound envelope into every binding's incoming queue.
    fn fan_in(&self, envelope: Envelope) {
        let inboxes = self.binding_inboxes.lock().expect("inbox lock");
        for inbox in inboxes.iter() {
            inbox.publish(envelope.clone());
        }
    }

    fn spawn_pumps(self: &Arc<Self>) {
        let mut pumps = self.pumps.lock().expect("pump lock");

        let layer = self.clone();
        let transport_events = self.transport.events();
        pumps.push(tokio::spawn(async move {
            while let Ok(event) = transport_events.recv_async().await {
                layer.handle_transport_event(event).await;
            }
        }));

        let layer = self.clone();
        let server_messages = self.signaling.incoming();
        pumps.push(tokio::spawn(async move {
            while let Ok(envelope) = server_messages.recv_async().await {
                layer.handle_server_message(envelope).await;
            }
        }));
    }

    async fn handle_transport_event(&self, event: TransportEvent) {
        match event {
            TransportEvent::Inbound { peer, payload } => match Envelope::from_wire(&payload) {
                Ok(envelope) => self.fan_in(envelope),
                Err(err) => warn!(%peer, %err, "dropping unparseable data channel payload"),
            },
            TransportEvent::ChannelOpen { peer } => {
                debug!(%peer, "data channel open, draining queued sends");
                let connection = self.peers.lock().expect("peer lock").get(&peer).cloned();
                if let Some(connection) = connection {
                    if let Err(err) = connection.flush() {
                        warn!(%peer, %err, "could not drain send queue");
                    }
                }
            }
            TransportEvent::ChannelClosed { peer } => {
                if let Some(connection) = self.peers.lock().expect("peer lock").remove(&peer) {
                    connection.close();
                }
            }
            TransportEvent::LocalCandidate { peer, candidate } => {
                let envelope = Envelope::to_peer(
                    self.local_peer_id.clone(),
                    peer.clone(),
                    None,
                    Payload::NewIceCandidate {
                        ice_candidate: crate::envelope::encode_body_component(&candidate),
                    },
                );
                if let Err(err) = self.signaling.relay(&envelope).await {
                    warn!(%peer, %err, "could not trickle local candidate");
                }
            }
        }
    }

    async fn handle_server_message(&self, envelope: Envelope) {
        let sender = envelope.header.sender.clone();
        match &envelope.payload {
            Payload::SessionOffer {
                session_description,
            } => {
                let Some(peer) = sender else {
                    warn!("offer without a sender");
                    return;
                };
                let (connection, _) = self.connection_to(&peer);
                match connection
                    .handle_offer(
                        self.transport.as_ref(),
                        &self.local_peer_id,
                        session_description,
                    )
                    .await
                {
                    Ok(answer) => {
                        if let Err(err) = self.signaling.relay(&answer).await {
                            warn!(%peer, %err, "could not relay session answer");
                        }
                    }
                    Err(err) => warn!(%peer, %err, "rejected session offer"),
                }
            }
            Payload::SessionAnswer {
                session_description,
            } => {
                let Some(peer) = sender else {
                    warn!("answer without a sender");
                    return;
                };
                let (connection, _) = self.connection_to(&peer);
                if let Err(err) = connection
                    .handle_answer(self.transport.as_ref(), session_description)
                    .await
                {
                    warn!(%peer, %err, "rejected session answer");
                }
            }
            Payload::NewIceCandidate { ice_candidate } => {
                let Some(peer) = sender else {
                    warn!("candidate without a sender");
                    return;
                };
                let (connection, _) = self.connection_to(&peer);
                if let Err(err) = connection
                    .handle_candidate(self.transport.as_ref(), ice_candidate)
                    .await
                {
                    warn!(%peer, %err, "rejected ice candidate");
                }
            }
            _ => self.fan_in(envelope),
        }
    }
}

impl Drop for ConnectionLayer {
    fn drop(&mut self) {
        for pump in self.pumps.lock().expect("pump lock").drain(..) {
            pump.abort();
        }
    }
}
