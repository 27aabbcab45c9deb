use {
    crate::{
        atom::Atom,
        buffer::{BufferChange, BufferProxy},
        document::Document,
        envelope::{BatchEntry, Envelope, Payload, PeerId},
        error::{Error, Result, UnknownBufferProxySnafu, UnknownDocumentSnafu},
        handler::{host_accepts, PortalBinding},
        queue::QueuePublisher,
        range::Range,
    },
    snafu::OptionExt,
    std::collections::HashMap,
    std::sync::Arc,
    tracing::{debug, info, warn},
};

pub const HOST_SITE_ID: u32 = 1;
pub const FIRST_GUEST_SITE_ID: u32 = 2;

/// The most sub-messages a single `INSERT_BATCH`/`DELETE_BATCH` may carry.
pub const BATCH_LIMIT: usize = 32;

/// What the host remembers about a joined guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestInfo {
    pub site_id: u32,
    pub username: String,
}

/// The document owner's side of a portal: assigns site IDs, snapshots
/// buffers to joining guests, applies everyone's edits, and relays each
/// guest's operations to all the others.
pub struct HostPortal {
    username: String,
    local_peer_id: Option<PeerId>,
    next_site_id: u32,
    guests: Vec<PeerId>,
    guest_metadata: HashMap<PeerId, GuestInfo>,
    username_by_site: HashMap<u32, String>,
    proxies: HashMap<String, Arc<BufferProxy>>,
    documents: HashMap<String, Document>,
    outgoing: QueuePublisher,
}

impl HostPortal {
    pub fn new(username: impl Into<String>, outgoing: QueuePublisher) -> Self {
        let username = username.into();
        let mut username_by_site = HashMap::new();
        username_by_site.insert(HOST_SITE_ID, username.clone());
        Self {
            username,
            local_peer_id: None,
            next_site_id: FIRST_GUEST_SITE_ID,
            guests: Vec::new(),
            guest_metadata: HashMap::new(),
            username_by_site,
            proxies: HashMap::new(),
            documents: HashMap::new(),
            outgoing,
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn local_peer_id(&self) -> Option<&str> {
        self.local_peer_id.as_deref()
    }

    pub fn set_local_peer_id(&mut self, peer_id: PeerId) {
        self.local_peer_id = Some(peer_id);
    }

    pub fn guests(&self) -> &[PeerId] {
        &self.guests
    }

    pub fn guest_info(&self, peer: &str) -> Option<&GuestInfo> {
        self.guest_metadata.get(peer)
    }

    pub fn username_for_site(&self, site: u32) -> Option<&str> {
        self.username_by_site.get(&site).map(String::as_str)
    }

    pub fn document(&self, proxy_id: &str) -> Option<&Document> {
        self.documents.get(proxy_id)
    }

    /// Starts sharing a buffer: builds a CRDT from its current contents and
    /// keeps the proxy for applying remote edits back.
    pub fn track_buffer(&mut self, proxy: Arc<BufferProxy>) {
        let id = proxy.id().to_string();
        if self.proxies.contains_key(&id) {
            return;
        }
        let document = Document::from_text(HOST_SITE_ID, &proxy.snapshot());
        info!(proxy_id = %id, lines = document.line_count(), "host is sharing a buffer");
        self.documents.insert(id.clone(), document);
        self.proxies.insert(id, proxy);
    }

    /// Feeds one editor change event through the proxy's echo filter and
    /// applies whatever survives as local operations.
    pub fn handle_buffer_change(&mut self, proxy_id: &str, change: &BufferChange) -> Result<()> {
        let proxy = self
            .proxies
            .get(proxy_id)
            .context(UnknownBufferProxySnafu { id: proxy_id })?
            .clone();
        for payload in proxy.handle_change(change) {
            self.handle_local_edit(payload)?;
        }
        Ok(())
    }

    /// Applies a `TEXT_BUFFER_PROXY_*` message to the CRDT and broadcasts
    /// the resulting atoms to every current guest, fragmented into batches.
    pub fn handle_local_edit(&mut self, payload: Payload) -> Result<()> {
        match payload {
            Payload::TextBufferProxyInsert {
                text_buffer_proxy_id,
                new_text,
                start_pos,
            } => {
                let document = self
                    .documents
                    .get_mut(&text_buffer_proxy_id)
                    .context(UnknownDocumentSnafu {
                        id: text_buffer_proxy_id.clone(),
                    })?;
                let atoms = document.local_insert_text(&new_text, start_pos)?;
                self.broadcast_batches(&text_buffer_proxy_id, atoms, true);
            }
            Payload::TextBufferProxyDelete {
                text_buffer_proxy_id,
                start_pos,
                end_pos,
            } => {
                let document = self
                    .documents
                    .get_mut(&text_buffer_proxy_id)
                    .context(UnknownDocumentSnafu {
                        id: text_buffer_proxy_id.clone(),
                    })?;
                let atoms = document.local_delete(start_pos, end_pos)?;
                self.broadcast_batches(&text_buffer_proxy_id, atoms, false);
            }
            other => warn!(kind = %other.kind(), "unexpected local edit payload"),
        }
        Ok(())
    }

    /// The proxy ID as guests see it: prefixed with the host's username.
    fn advertised_id(&self, local_id: &str) -> String {
        format!("{}/{}", self.username, local_id)
    }

    /// The inverse of [`Self::advertised_id`], tolerating unprefixed IDs.
    fn resolve_id<'a>(&self, wire_id: &'a str) -> &'a str {
        let prefix = format!("{}/", self.username);
        wire_id.strip_prefix(prefix.as_str()).unwrap_or(wire_id)
    }

    fn broadcast_batches(&self, local_id: &str, atoms: Vec<Atom>, insert: bool) {
        if self.guests.is_empty() || atoms.is_empty() {
            return;
        }
        let Some(sender) = self.local_peer_id.clone() else {
            warn!("cannot broadcast before the server assigned a peer id");
            return;
        };
        for envelope in
            batch_envelopes(&sender, &self.guests, &self.advertised_id(local_id), atoms, insert)
        {
            self.outgoing.publish(envelope);
        }
    }

    /// Streams the full state of every shared buffer to one freshly joined
    /// guest, 32 characters per envelope.
    fn send_snapshot(&self, guest: &str) {
        let Some(sender) = self.local_peer_id.clone() else {
            return;
        };
        let targets = [guest.to_string()];
        for (local_id, document) in &self.documents {
            let atoms: Vec<_> = document.atoms().cloned().collect();
            if atoms.is_empty() {
                continue;
            }
            debug!(proxy_id = %local_id, count = atoms.len(), %guest, "snapshotting buffer to guest");
            for envelope in batch_envelopes(
                &sender,
                &targets,
                &self.advertised_id(local_id),
                atoms,
                true,
            ) {
                self.outgoing.publish(envelope);
            }
        }
    }

    fn reply(&self, guest: &str, payload: Payload) {
        let Some(sender) = self.local_peer_id.clone() else {
            warn!("cannot reply before the server assigned a peer id");
            return;
        };
        self.outgoing.publish(Envelope::to_peer(
            sender.clone(),
            guest.to_string(),
            Some(sender),
            payload,
        ));
    }

    fn handle_join_request(&mut self, guest: &str) {
        let site_id = self.next_site_id;
        self.next_site_id += 1;
        info!(%guest, site_id, "assigning site id to joining guest");
        self.reply(guest, Payload::SiteIdAssignment { site_id });
    }

    fn handle_site_acknowledgement(
        &mut self,
        guest: &str,
        site_id: u32,
        username: String,
    ) -> Result<()> {
        if self.username_by_site.contains_key(&site_id) {
            return Err(Error::DuplicateSiteId { site: site_id });
        }
        self.guests.push(guest.to_string());
        self.guest_metadata.insert(
            guest.to_string(),
            GuestInfo {
                site_id,
                username: username.clone(),
            },
        );
        self.username_by_site.insert(site_id, username);
        info!(%guest, site_id, "guest joined the portal");

        self.reply(
            guest,
            Payload::JoinRequestAccepted {
                username: self.username.clone(),
            },
        );
        self.send_snapshot(guest);
        Ok(())
    }

    fn handle_leave(&mut self, guest: &str) {
        self.guests.retain(|peer| peer != guest);
        if let Some(info) = self.guest_metadata.remove(guest) {
            self.username_by_site.remove(&info.site_id);
            info!(%guest, site_id = info.site_id, "guest left the portal");
        }
        self.reply(
            guest,
            Payload::JoinRequestAccepted {
                username: self.username.clone(),
            },
        );
    }

    /// Applies a guest's operation and relays the envelope to every other
    /// guest, with the originator removed from the target set.
    fn apply_and_forward(&mut self, envelope: Envelope) -> Result<()> {
        let sender = envelope.header.sender.clone().unwrap_or_default();
        let applied = match &envelope.payload {
            Payload::Insert {
                text_buffer_proxy_id,
                char_object,
            } => self.apply_remote_insert(&text_buffer_proxy_id.clone(), char_object.clone())?,
            Payload::Delete {
                text_buffer_proxy_id,
                char_object,
            } => self.apply_remote_delete(&text_buffer_proxy_id.clone(), char_object)?,
            _ => false,
        };
        if !applied {
            return Ok(());
        }

        let others: Vec<PeerId> = self
            .guests
            .iter()
            .filter(|peer| *peer != &sender)
            .cloned()
            .collect();
        if others.is_empty() {
            return Ok(());
        }
        // Relayed on the host's own authority: the guest filter only admits
        // traffic sent by the portal host.
        let mut forwarded = envelope;
        forwarded.header.sender = self.local_peer_id.clone();
        forwarded.header.target = Some(crate::envelope::Target::Many(others));
        self.outgoing.publish(forwarded);
        Ok(())
    }

    fn apply_remote_insert(&mut self, wire_id: &str, atom: Atom) -> Result<bool> {
        let local_id = self.resolve_id(wire_id).to_string();
        let document = self
            .documents
            .get_mut(&local_id)
            .context(UnknownDocumentSnafu { id: &local_id })?;
        let value = atom.value;
        let Some(point) = document.remote_insert(atom)? else {
            return Ok(false);
        };
        let proxy = self
            .proxies
            .get(&local_id)
            .context(UnknownBufferProxySnafu { id: &local_id })?;
        proxy.insert_at(point, &value.to_string());
        Ok(true)
    }

    fn apply_remote_delete(&mut self, wire_id: &str, atom: &Atom) -> Result<bool> {
        let local_id = self.resolve_id(wire_id).to_string();
        let document = self
            .documents
            .get_mut(&local_id)
            .context(UnknownDocumentSnafu { id: &local_id })?;
        let value = atom.value;
        let Some(point) = document.remote_delete(atom)? else {
            return Ok(false);
        };
        let proxy = self
            .proxies
            .get(&local_id)
            .context(UnknownBufferProxySnafu { id: &local_id })?;
        proxy.delete_range(Range::of_insertion(point, &value.to_string()));
        Ok(true)
    }
}

/// Fragments a run of atoms into batch envelopes of at most
/// [`BATCH_LIMIT`] sub-messages each.
fn batch_envelopes(
    sender: &str,
    targets: &[PeerId],
    wire_id: &str,
    atoms: Vec<Atom>,
    insert: bool,
) -> Vec<Envelope> {
    atoms
        .chunks(BATCH_LIMIT)
        .map(|chunk| {
            let message_batch: Vec<BatchEntry> = chunk
                .iter()
                .map(|atom| BatchEntry {
                    text_buffer_proxy_id: wire_id.to_string(),
                    char_object: atom.clone(),
                })
                .collect();
            let payload = if insert {
                Payload::InsertBatch { message_batch }
            } else {
                Payload::DeleteBatch { message_batch }
            };
            Envelope::to_peers(
                sender.to_string(),
                targets.to_vec(),
                Some(sender.to_string()),
                payload,
            )
        })
        .collect()
}

impl PortalBinding for HostPortal {
    fn accepts(&self, envelope: &Envelope) -> bool {
        host_accepts(&envelope.header)
    }

    fn handle_remote(&mut self, envelope: Envelope) -> Result<()> {
        let sender = envelope.header.sender.clone();
        match envelope.payload {
            Payload::LocalPeerId { local_peer_id } => {
                self.local_peer_id = Some(local_peer_id.clone());
                self.outgoing.publish(Envelope::to_server(
                    Some(local_peer_id.clone()),
                    Payload::AcceptedPeerId { local_peer_id },
                ));
            }
            Payload::JoinPortalRequest => {
                let Some(sender) = sender else {
                    return Err(Error::MissingPeerId);
                };
                self.handle_join_request(&sender);
            }
            Payload::SiteIdAcknowledgement { site_id, username } => {
                let Some(sender) = sender else {
                    return Err(Error::MissingPeerId);
                };
                self.handle_site_acknowledgement(&sender, site_id, username)?;
            }
            Payload::LeavePortalRequest => {
                let Some(sender) = sender else {
                    return Err(Error::MissingPeerId);
                };
                self.handle_leave(&sender);
            }
            Payload::Insert { .. } | Payload::Delete { .. } => {
                self.apply_and_forward(envelope)?;
            }
            other => {
                debug!(kind = %other.kind(), "host ignoring message");
            }
        }
        Ok(())
    }
}
