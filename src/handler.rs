use {
    crate::{
        envelope::{Envelope, Flag, Header, Target},
        error::Error,
        queue::QueueSubscriber,
    },
    std::sync::{Arc, Mutex},
    tracing::{debug, error, warn},
};

/// A portal binding as the message fabric sees it: a validity filter plus a
/// remote-message sink. Emissions travel the other way, straight into the
/// outgoing queue the binding was constructed with.
pub trait PortalBinding: Send + 'static {
    fn accepts(&self, envelope: &Envelope) -> bool;

    /// Applies an accepted remote message. A fatal error means a broken
    /// binding invariant; the handler stops pumping and the store tears the
    /// binding down.
    fn handle_remote(&mut self, envelope: Envelope) -> Result<(), Error>;
}

/// Host-side validity: the message must be addressed to the portal host
/// itself, or be untargeted traffic from the signalling edge.
pub fn host_accepts(header: &Header) -> bool {
    match (&header.target, &header.portal_host) {
        (Some(Target::One(target)), Some(host)) => target == host,
        (None, _) => header.flag == Some(Flag::Server),
        _ => false,
    }
}

/// Guest-side validity: the message must come from the portal host and name
/// the local peer among its targets.
pub fn guest_accepts(header: &Header, portal_host: &str, local: &str) -> bool {
    header.sender.as_deref() == Some(portal_host) && header.targets(local)
}

/// Only invariant breaches take a binding down; everything else is logged
/// and survived.
fn is_fatal(error: &Error) -> bool {
    matches!(
        error,
        Error::UnknownBufferProxy { .. }
            | Error::UnknownDocument { .. }
            | Error::DuplicateSiteId { .. }
            | Error::BindingClosed { .. }
    )
}

/// Couples a binding to its incoming queue: a pump task that filters each
/// message and delivers the survivors. Deactivation aborts the pump;
/// replacement deactivates and spins up a fresh one atomically from the
/// caller's point of view. A pump that stops on a fatal binding error
/// reports it through [`Self::is_active`], which the portal store consults
/// before handing the binding out again.
pub struct PortalBindingHandler {
    pump: tokio::task::JoinHandle<()>,
}

impl PortalBindingHandler {
    pub fn activate<B: PortalBinding>(
        binding: Arc<Mutex<B>>,
        incoming: QueueSubscriber,
    ) -> Self {
        let pump = tokio::spawn(async move {
            while let Some(envelope) = incoming.next().await {
                let mut binding = binding.lock().expect("binding lock");
                if !binding.accepts(&envelope) {
                    debug!(kind = %envelope.kind(), "dropping message that fails the binding filter");
                    continue;
                }
                if let Err(err) = binding.handle_remote(envelope) {
                    if is_fatal(&err) {
                        error!(%err, "binding invariant broken, stopping its handler");
                        break;
                    }
                    warn!(%err, "binding could not apply a remote message");
                }
            }
        });
        Self { pump }
    }

    /// Swap in a different binding or queue without a window where both
    /// pumps run.
    pub fn replace<B: PortalBinding>(
        self,
        binding: Arc<Mutex<B>>,
        incoming: QueueSubscriber,
    ) -> Self {
        self.deactivate();
        Self::activate(binding, incoming)
    }

    pub fn deactivate(self) {
        self.pump.abort();
    }

    pub fn is_active(&self) -> bool {
        !self.pump.is_finished()
    }
}
