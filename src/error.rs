use crate::range::Point;
use snafu::Snafu;

/// Everything that can go wrong in the portal core. Protocol and identity
/// failures are raised at validation time and dropped by the caller; model
/// failures indicate a broken binding invariant and tear the binding down;
/// connection failures accompany dropped sends.
#[derive(Debug, Snafu)]
#[snafu(visibility(pub(crate)))]
pub enum Error {
    #[snafu(display("unknown message type `{value}`"))]
    UnknownMessageType { value: String },

    #[snafu(display("{kind} message is missing required body field `{field}`"))]
    MissingField { kind: String, field: &'static str },

    #[snafu(display("message for {target} was delivered to {local}"))]
    TargetMismatch { target: String, local: String },

    #[snafu(display("session offer from {peer} collides with signaling state {state}"))]
    OfferCollision { peer: String, state: String },

    #[snafu(display("connection to the signaling server is closed"))]
    ServerClosed,

    #[snafu(display("data channel to {peer} is {state}"))]
    ChannelNotOpen { peer: String, state: String },

    #[snafu(display("gave up sending to {peer} after {retries} retries"))]
    RetriesExhausted { peer: String, retries: u32 },

    #[snafu(display("no connection to peer {peer}"))]
    UnknownPeer { peer: String },

    #[snafu(display("unknown buffer proxy `{id}`"))]
    UnknownBufferProxy { id: String },

    #[snafu(display("no document for buffer proxy `{id}`"))]
    UnknownDocument { id: String },

    #[snafu(display("site id {site} is already assigned"))]
    DuplicateSiteId { site: u32 },

    #[snafu(display("position {point} is outside the document"))]
    InvalidPosition { point: Point },

    #[snafu(display("character carries an empty identifier sequence"))]
    EmptySequence,

    #[snafu(display("peer id is missing"))]
    MissingPeerId,

    #[snafu(display("message addressed to its own sender {peer}"))]
    SelfTarget { peer: String },

    #[snafu(display("sender {peer} is this node"))]
    SenderIsSelf { peer: String },

    #[snafu(display("malformed wire payload: {source}"))]
    Wire { source: serde_json::Error },

    #[snafu(display("percent-encoded body component is not valid UTF-8"))]
    MalformedComponent,

    #[snafu(display("websocket failure: {source}"))]
    WebSocket {
        source: tokio_tungstenite::tungstenite::Error,
    },

    #[snafu(display("could not read config file {path}: {source}"))]
    ConfigRead {
        path: String,
        source: std::io::Error,
    },

    #[snafu(display("could not parse config file {path}: {source}"))]
    ConfigParse {
        path: String,
        source: toml::de::Error,
    },

    #[snafu(display("binding for portal {portal} was deactivated"))]
    BindingClosed { portal: String },
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
