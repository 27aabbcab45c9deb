use {
    crate::{
        atom::Atom,
        buffer::{BufferChange, BufferProxy, TextBuffer},
        document::Document,
        envelope::{Envelope, Payload, PeerId},
        error::{BindingClosedSnafu, Result, UnknownBufferProxySnafu, UnknownDocumentSnafu},
        handler::{guest_accepts, PortalBinding},
        queue::QueuePublisher,
        range::Range,
    },
    snafu::OptionExt,
    std::collections::HashMap,
    std::sync::{Arc, Mutex},
    std::time::Duration,
    tracing::{debug, info, warn},
};

/// How long a leaving guest waits for the host's confirmation before it
/// closes on its own.
pub const LEAVE_TIMEOUT: Duration = Duration::from_secs(5);

/// Join protocol progress. INIT is where a binding starts; CLOSED is
/// terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JoinState {
    Init,
    WaitingSiteId,
    AckSiteId,
    Active,
    Leaving,
    Closed,
}

/// Builds a local buffer for a proxy ID the host referenced for the first
/// time.
pub type BufferFactory = Box<dyn FnMut(&str) -> Arc<Mutex<dyn TextBuffer>> + Send>;

/// The follower's side of a portal: requests to join, accepts its site ID,
/// mirrors the host's operations locally, and sends its own edits toward
/// the host one character at a time.
pub struct GuestPortal {
    portal_host: PeerId,
    local_peer_id: PeerId,
    username: String,
    host_username: Option<String>,
    site_id: Option<u32>,
    state: JoinState,
    proxies: HashMap<String, Arc<BufferProxy>>,
    documents: HashMap<String, Document>,
    outgoing: QueuePublisher,
    buffers: BufferFactory,
}

impl GuestPortal {
    pub fn new(
        portal_host: PeerId,
        local_peer_id: PeerId,
        username: impl Into<String>,
        outgoing: QueuePublisher,
        buffers: BufferFactory,
    ) -> Self {
        Self {
            portal_host,
            local_peer_id,
            username: username.into(),
            host_username: None,
            site_id: None,
            state: JoinState::Init,
            proxies: HashMap::new(),
            documents: HashMap::new(),
            outgoing,
            buffers,
        }
    }

    pub fn portal_host(&self) -> &str {
        &self.portal_host
    }

    pub fn state(&self) -> JoinState {
        self.state
    }

    pub fn site_id(&self) -> Option<u32> {
        self.site_id
    }

    pub fn host_username(&self) -> Option<&str> {
        self.host_username.as_deref()
    }

    pub fn document(&self, local_id: &str) -> Option<&Document> {
        self.documents.get(local_id)
    }

    pub fn proxy(&self, local_id: &str) -> Option<&Arc<BufferProxy>> {
        self.proxies.get(local_id)
    }

    /// INIT -> WAITING_SITE_ID: asks the host for a seat in the portal.
    pub fn send_join(&mut self) {
        if self.state != JoinState::Init {
            warn!(state = ?self.state, "ignoring join request outside INIT");
            return;
        }
        self.state = JoinState::WaitingSiteId;
        self.send_to_host(Payload::JoinPortalRequest);
    }

    /// ACTIVE -> LEAVING: announces departure; the host's confirmation (or
    /// the owner's timeout) completes the transition to CLOSED.
    pub fn send_leave(&mut self) {
        if self.state != JoinState::Active {
            warn!(state = ?self.state, "ignoring leave request outside ACTIVE");
            return;
        }
        self.state = JoinState::Leaving;
        self.send_to_host(Payload::LeavePortalRequest);
    }

    /// Forces the terminal state; used on leave timeout and on teardown.
    pub fn close(&mut self) {
        self.state = JoinState::Closed;
    }

    /// Feeds one editor change event through the proxy's echo filter and
    /// emits whatever survives toward the host.
    pub fn handle_buffer_change(&mut self, local_id: &str, change: &BufferChange) -> Result<()> {
        let proxy = self
            .proxies
            .get(local_id)
            .context(UnknownBufferProxySnafu { id: local_id })?
            .clone();
        for payload in proxy.handle_change(change) {
            self.handle_local_edit(payload)?;
        }
        Ok(())
    }

    /// Applies a `TEXT_BUFFER_PROXY_*` message to the local CRDT and sends
    /// one `INSERT`/`DELETE` per character toward the host.
    pub fn handle_local_edit(&mut self, payload: Payload) -> Result<()> {
        if self.state != JoinState::Active {
            warn!(state = ?self.state, "dropping local edit outside ACTIVE");
            return Ok(());
        }
        match payload {
            Payload::TextBufferProxyInsert {
                text_buffer_proxy_id,
                new_text,
                start_pos,
            } => {
                let wire_id = self.wire_id(&text_buffer_proxy_id);
                let document = self
                    .documents
                    .get_mut(&text_buffer_proxy_id)
                    .context(UnknownDocumentSnafu {
                        id: text_buffer_proxy_id.clone(),
                    })?;
                let atoms = document.local_insert_text(&new_text, start_pos)?;
                for atom in atoms {
                    self.send_to_host(Payload::Insert {
                        text_buffer_proxy_id: wire_id.clone(),
                        char_object: atom,
                    });
                }
            }
            Payload::TextBufferProxyDelete {
                text_buffer_proxy_id,
                start_pos,
                end_pos,
            } => {
                let wire_id = self.wire_id(&text_buffer_proxy_id);
                let document = self
                    .documents
                    .get_mut(&text_buffer_proxy_id)
                    .context(UnknownDocumentSnafu {
                        id: text_buffer_proxy_id.clone(),
                    })?;
                let atoms = document.local_delete(start_pos, end_pos)?;
                for atom in atoms {
                    self.send_to_host(Payload::Delete {
                        text_buffer_proxy_id: wire_id.clone(),
                        char_object: atom,
                    });
                }
            }
            other => warn!(kind = %other.kind(), "unexpected local edit payload"),
        }
        Ok(())
    }

    fn send_to_host(&self, payload: Payload) {
        self.outgoing.publish(Envelope::to_peer(
            self.local_peer_id.clone(),
            self.portal_host.clone(),
            Some(self.portal_host.clone()),
            payload,
        ));
    }

    /// Strips the host's username prefix off a wire proxy ID.
    fn local_id<'a>(&self, wire_id: &'a str) -> &'a str {
        match &self.host_username {
            Some(host) => {
                let prefix = format!("{host}/");
                wire_id.strip_prefix(prefix.as_str()).unwrap_or(wire_id)
            }
            None => wire_id,
        }
    }

    /// Re-applies the host's username prefix for outgoing operations.
    fn wire_id(&self, local_id: &str) -> String {
        match &self.host_username {
            Some(host) => format!("{host}/{local_id}"),
            None => local_id.to_string(),
        }
    }

    /// Resolves a wire proxy ID to its local document and proxy, creating
    /// both on first reference. Returns the local ID.
    pub fn open_buffer(&mut self, wire_id: &str) -> String {
        let local_id = self.local_id(wire_id).to_string();
        if !self.documents.contains_key(&local_id) {
            let site = self.site_id.unwrap_or_default();
            info!(proxy_id = %local_id, site, "creating buffer for new proxy id");
            let buffer = (self.buffers)(&local_id);
            self.proxies.insert(
                local_id.clone(),
                Arc::new(BufferProxy::new(local_id.clone(), buffer)),
            );
            self.documents.insert(local_id.clone(), Document::new(site));
        }
        local_id
    }

    fn apply_remote_insert(&mut self, wire_id: &str, atom: Atom) -> Result<()> {
        let local_id = self.open_buffer(wire_id);
        let value = atom.value;
        let document = self
            .documents
            .get_mut(&local_id)
            .context(UnknownDocumentSnafu { id: &local_id })?;
        if let Some(point) = document.remote_insert(atom)? {
            if let Some(proxy) = self.proxies.get(&local_id) {
                proxy.insert_at(point, &value.to_string());
            }
        }
        Ok(())
    }

    fn apply_remote_delete(&mut self, wire_id: &str, atom: &Atom) -> Result<()> {
        let local_id = self.open_buffer(wire_id);
        let value = atom.value;
        let document = self
            .documents
            .get_mut(&local_id)
            .context(UnknownDocumentSnafu { id: &local_id })?;
        if let Some(point) = document.remote_delete(atom)? {
            if let Some(proxy) = self.proxies.get(&local_id) {
                proxy.delete_range(Range::of_insertion(point, &value.to_string()));
            }
        }
        Ok(())
    }
}

impl PortalBinding for GuestPortal {
    fn accepts(&self, envelope: &Envelope) -> bool {
        guest_accepts(&envelope.header, &self.portal_host, &self.local_peer_id)
    }

    fn handle_remote(&mut self, envelope: Envelope) -> Result<()> {
        // CLOSED is terminal; a delivery that still reaches this binding is
        // fatal to its handler.
        if self.state == JoinState::Closed {
            return BindingClosedSnafu {
                portal: self.portal_host.clone(),
            }
            .fail();
        }
        match envelope.payload {
            Payload::SiteIdAssignment { site_id } => {
                if self.state != JoinState::WaitingSiteId {
                    warn!(state = ?self.state, "unexpected site id assignment");
                    return Ok(());
                }
                self.site_id = Some(site_id);
                for document in self.documents.values_mut() {
                    document.set_site(site_id);
                }
                self.state = JoinState::AckSiteId;
                info!(site_id, "accepted site id, acknowledging");
                self.send_to_host(Payload::SiteIdAcknowledgement {
                    site_id,
                    username: self.username.clone(),
                });
            }
            Payload::JoinRequestAccepted { username } => match self.state {
                JoinState::AckSiteId => {
                    info!(host = %username, "joined the portal");
                    self.host_username = Some(username);
                    self.state = JoinState::Active;
                }
                JoinState::Leaving => {
                    info!("host confirmed our departure");
                    self.state = JoinState::Closed;
                }
                _ => warn!(state = ?self.state, "unexpected join confirmation"),
            },
            Payload::Insert {
                text_buffer_proxy_id,
                char_object,
            } => self.apply_remote_insert(&text_buffer_proxy_id, char_object)?,
            Payload::Delete {
                text_buffer_proxy_id,
                char_object,
            } => self.apply_remote_delete(&text_buffer_proxy_id, &char_object)?,
            Payload::InsertBatch { message_batch } => {
                for entry in message_batch {
                    self.apply_remote_insert(&entry.text_buffer_proxy_id, entry.char_object)?;
                }
            }
            Payload::DeleteBatch { message_batch } => {
                for entry in message_batch {
                    self.apply_remote_delete(&entry.text_buffer_proxy_id, &entry.char_object)?;
                }
            }
            other => debug!(kind = %other.kind(), "guest ignoring message"),
        }
        Ok(())
    }
}
