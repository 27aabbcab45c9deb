//! Peer-to-peer collaborative text editing core, based on
//! `https://hal.inria.fr/inria-00336191v3/document`.
//!
//! One peer hosts a portal and owns the shared buffers; any number of
//! guests join through a signalling rendezvous, receive a site ID and a
//! snapshot, and from then on exchange character operations that carry
//! dense position identifiers, so every replica converges on the same
//! text no matter how deliveries interleave.

pub mod atom;
pub mod buffer;
pub mod config;
pub mod document;
pub mod envelope;
pub mod error;
pub mod guest;
pub mod handler;
pub mod host;
pub mod id;
pub mod peer;
pub mod queue;
pub mod range;
pub mod router;
pub mod sequence;
pub mod signaling;
pub mod store;

pub use atom::Atom;
pub use buffer::{BufferChange, BufferProxy, InMemoryBuffer, TextBuffer};
pub use config::Config;
pub use document::Document;
pub use envelope::{Envelope, Payload, PeerId};
pub use error::{Error, Result};
pub use guest::{GuestPortal, JoinState};
pub use host::HostPortal;
pub use range::{Point, Range};
pub use router::ConnectionLayer;
pub use store::PortalStore;
