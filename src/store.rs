use {
    crate::{
        envelope::PeerId,
        guest::{BufferFactory, GuestPortal, JoinState, LEAVE_TIMEOUT},
        handler::PortalBindingHandler,
        host::HostPortal,
        router::ConnectionLayer,
    },
    rand::{seq::SliceRandom, thread_rng},
    std::{
        collections::HashMap,
        sync::{Arc, Mutex},
        time::Duration,
    },
    tracing::{info, warn},
};

const ADJECTIVES: &[&str] = &[
    "amber", "brisk", "calm", "daring", "eager", "fuzzy", "gentle", "hasty", "ivory", "jolly",
    "keen", "lively", "mellow", "nimble", "plucky", "quiet", "rusty", "sly", "tidy", "vivid",
];

const ANIMALS: &[&str] = &[
    "badger", "crane", "dingo", "ferret", "gecko", "heron", "ibex", "jackal", "kiwi", "lemur",
    "marmot", "newt", "otter", "puffin", "quokka", "raven", "stoat", "tapir", "vole", "wombat",
];

/// Picks a session username from the wordlist, `amber-badger` style.
pub fn generate_username() -> String {
    let mut rng = thread_rng();
    let adjective = ADJECTIVES.choose(&mut rng).expect("non-empty wordlist");
    let animal = ANIMALS.choose(&mut rng).expect("non-empty wordlist");
    format!("{adjective}-{animal}")
}

struct HostHandle {
    binding: Arc<Mutex<HostPortal>>,
    handler: PortalBindingHandler,
}

struct GuestHandle {
    binding: Arc<Mutex<GuestPortal>>,
    handler: PortalBindingHandler,
}

/// Owns the lifecycle of portal bindings: at most one host binding, plus
/// one guest binding per portal host this peer has joined. Construction
/// wires a binding to fresh queue handles from the connection layer and
/// activates its handler; closing deactivates and forgets it.
pub struct PortalStore {
    connection: Arc<ConnectionLayer>,
    username: String,
    host: Option<HostHandle>,
    guests: HashMap<PeerId, GuestHandle>,
}

impl PortalStore {
    pub fn new(connection: Arc<ConnectionLayer>, username: Option<String>) -> Self {
        let username = username.unwrap_or_else(generate_username);
        info!(%username, "portal store ready");
        Self {
            connection,
            username,
            host: None,
            guests: HashMap::new(),
        }
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    /// The host binding, created and activated on first use. A binding
    /// whose handler pump stopped on a broken invariant counts as gone and
    /// is replaced here.
    pub fn host_portal(&mut self) -> Arc<Mutex<HostPortal>> {
        if let Some(handle) = self.host.take() {
            if handle.handler.is_active() {
                let binding = handle.binding.clone();
                self.host = Some(handle);
                return binding;
            }
            warn!("host binding's handler died, replacing the binding");
            handle.handler.deactivate();
        }

        let (incoming, outgoing) = self.connection.register_binding();
        let mut portal = HostPortal::new(self.username.clone(), outgoing);
        portal.set_local_peer_id(self.connection.local_peer_id().to_string());
        let binding = Arc::new(Mutex::new(portal));
        let handler = PortalBindingHandler::activate(binding.clone(), incoming);
        self.host = Some(HostHandle {
            binding: binding.clone(),
            handler,
        });
        binding
    }

    pub fn has_host(&self) -> bool {
        self.host
            .as_ref()
            .is_some_and(|handle| handle.handler.is_active())
    }

    /// Creates a guest binding toward `portal_host`, activates it, and
    /// starts the join handshake. Joining the same portal twice hands back
    /// the existing binding, unless its handler has since died, in which
    /// case a fresh one is wired up.
    pub fn join_portal(
        &mut self,
        portal_host: PeerId,
        buffers: BufferFactory,
    ) -> Arc<Mutex<GuestPortal>> {
        if let Some(handle) = self.guests.remove(&portal_host) {
            if handle.handler.is_active() {
                let binding = handle.binding.clone();
                self.guests.insert(portal_host, handle);
                return binding;
            }
            warn!(%portal_host, "guest binding's handler died, replacing the binding");
            handle.handler.deactivate();
        }

        let (incoming, outgoing) = self.connection.register_binding();
        let portal = GuestPortal::new(
            portal_host.clone(),
            self.connection.local_peer_id().to_string(),
            self.username.clone(),
            outgoing,
            buffers,
        );
        let binding = Arc::new(Mutex::new(portal));
        let handler = PortalBindingHandler::activate(binding.clone(), incoming);
        binding.lock().expect("binding lock").send_join();
        self.guests.insert(
            portal_host,
            GuestHandle {
                binding: binding.clone(),
                handler,
            },
        );
        binding
    }

    pub fn guest_portal(&self, portal_host: &str) -> Option<Arc<Mutex<GuestPortal>>> {
        self.guests
            .get(portal_host)
            .filter(|handle| handle.handler.is_active())
            .map(|handle| handle.binding.clone())
    }

    /// Announces departure, waits (bounded) for the host's confirmation,
    /// then deactivates the binding.
    pub async fn leave_portal(&mut self, portal_host: &str) {
        let Some(handle) = self.guests.remove(portal_host) else {
            return;
        };
        handle.binding.lock().expect("binding lock").send_leave();

        let binding = handle.binding.clone();
        let confirmed = tokio::time::timeout(LEAVE_TIMEOUT, async move {
            loop {
                if binding.lock().expect("binding lock").state() == JoinState::Closed {
                    return;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await;

        if confirmed.is_err() {
            info!(%portal_host, "leave timed out, closing locally");
            handle.binding.lock().expect("binding lock").close();
        }
        handle.handler.deactivate();
    }

    /// Tears down the host binding; guests of this portal are on their own.
    pub fn close_host_portal(&mut self) {
        if let Some(handle) = self.host.take() {
            handle.handler.deactivate();
        }
    }

    /// Deactivates everything this store owns.
    pub fn close_all(&mut self) {
        self.close_host_portal();
        for (_, handle) in self.guests.drain() {
            handle.binding.lock().expect("binding lock").close();
            handle.handler.deactivate();
        }
    }
}
