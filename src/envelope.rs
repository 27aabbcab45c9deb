use crate::{
    atom::Atom,
    error::{Error, MissingFieldSnafu, Result, WireSnafu},
    range::Point,
};
use percent_encoding::{percent_decode_str, utf8_percent_encode, NON_ALPHANUMERIC};
use serde::{Deserialize, Serialize};
use snafu::{OptionExt, ResultExt};

/// Peers are identified by the UUID string the signalling server assigned.
pub type PeerId = String;

/// The recognised envelope types. The wire name is the SCREAMING_SNAKE
/// rendering carried in `header.type`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    AssignPeerId,
    AcceptedPeerId,
    LocalPeerId,
    SessionOffer,
    SessionAnswer,
    NewIceCandidate,
    JoinPortalRequest,
    LeavePortalRequest,
    JoinRequestAccepted,
    SiteIdAssignment,
    SiteIdAcknowledgement,
    Insert,
    Delete,
    InsertBatch,
    DeleteBatch,
    TextBufferProxyInsert,
    TextBufferProxyDelete,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AssignPeerId => "ASSIGN_PEER_ID",
            Self::AcceptedPeerId => "ACCEPTED_PEER_ID",
            Self::LocalPeerId => "LOCAL_PEER_ID",
            Self::SessionOffer => "SESSION_OFFER",
            Self::SessionAnswer => "SESSION_ANSWER",
            Self::NewIceCandidate => "NEW_ICE_CANDIDATE",
            Self::JoinPortalRequest => "JOIN_PORTAL_REQUEST",
            Self::LeavePortalRequest => "LEAVE_PORTAL_REQUEST",
            Self::JoinRequestAccepted => "JOIN_REQUEST_ACCEPTED",
            Self::SiteIdAssignment => "SITE_ID_ASSIGNMENT",
            Self::SiteIdAcknowledgement => "SITE_ID_ACKNOWLEDGEMENT",
            Self::Insert => "INSERT",
            Self::Delete => "DELETE",
            Self::InsertBatch => "INSERT_BATCH",
            Self::DeleteBatch => "DELETE_BATCH",
            Self::TextBufferProxyInsert => "TEXT_BUFFER_PROXY_INSERT",
            Self::TextBufferProxyDelete => "TEXT_BUFFER_PROXY_DELETE",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "ASSIGN_PEER_ID" => Self::AssignPeerId,
            "ACCEPTED_PEER_ID" => Self::AcceptedPeerId,
            "LOCAL_PEER_ID" => Self::LocalPeerId,
            "SESSION_OFFER" => Self::SessionOffer,
            "SESSION_ANSWER" => Self::SessionAnswer,
            "NEW_ICE_CANDIDATE" => Self::NewIceCandidate,
            "JOIN_PORTAL_REQUEST" => Self::JoinPortalRequest,
            "LEAVE_PORTAL_REQUEST" => Self::LeavePortalRequest,
            "JOIN_REQUEST_ACCEPTED" => Self::JoinRequestAccepted,
            "SITE_ID_ASSIGNMENT" => Self::SiteIdAssignment,
            "SITE_ID_ACKNOWLEDGEMENT" => Self::SiteIdAcknowledgement,
            "INSERT" => Self::Insert,
            "DELETE" => Self::Delete,
            "INSERT_BATCH" => Self::InsertBatch,
            "DELETE_BATCH" => Self::DeleteBatch,
            "TEXT_BUFFER_PROXY_INSERT" => Self::TextBufferProxyInsert,
            "TEXT_BUFFER_PROXY_DELETE" => Self::TextBufferProxyDelete,
            other => {
                return Err(Error::UnknownMessageType {
                    value: other.to_string(),
                })
            }
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Where an envelope entered the fabric from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Flag {
    Server,
    Peer,
}

/// One peer or a fan-out set; maps to `targetPeerId` / `targetPeerIds`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    One(PeerId),
    Many(Vec<PeerId>),
}

impl Target {
    pub fn contains(&self, peer: &str) -> bool {
        match self {
            Target::One(id) => id == peer,
            Target::Many(ids) => ids.iter().any(|id| id == peer),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Header {
    pub sender: Option<PeerId>,
    pub target: Option<Target>,
    pub portal_host: Option<PeerId>,
    pub flag: Option<Flag>,
}

impl Header {
    /// Whether `peer` is named by the targeting fields.
    pub fn targets(&self, peer: &str) -> bool {
        self.target.as_ref().is_some_and(|t| t.contains(peer))
    }
}

/// One insert or delete inside a batch envelope. The operation kind lives on
/// the envelope header, not here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchEntry {
    pub text_buffer_proxy_id: String,
    pub char_object: Atom,
}

/// The typed message body. Each variant owns exactly the fields its wire
/// type recognises.
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    AssignPeerId {
        assigned_peer_id: PeerId,
    },
    AcceptedPeerId {
        local_peer_id: PeerId,
    },
    LocalPeerId {
        local_peer_id: PeerId,
    },
    SessionOffer {
        session_description: String,
    },
    SessionAnswer {
        session_description: String,
    },
    NewIceCandidate {
        ice_candidate: String,
    },
    JoinPortalRequest,
    LeavePortalRequest,
    JoinRequestAccepted {
        username: String,
    },
    SiteIdAssignment {
        site_id: u32,
    },
    SiteIdAcknowledgement {
        site_id: u32,
        username: String,
    },
    Insert {
        text_buffer_proxy_id: String,
        char_object: Atom,
    },
    Delete {
        text_buffer_proxy_id: String,
        char_object: Atom,
    },
    InsertBatch {
        message_batch: Vec<BatchEntry>,
    },
    DeleteBatch {
        message_batch: Vec<BatchEntry>,
    },
    TextBufferProxyInsert {
        text_buffer_proxy_id: String,
        new_text: String,
        start_pos: Point,
    },
    TextBufferProxyDelete {
        text_buffer_proxy_id: String,
        start_pos: Point,
        end_pos: Point,
    },
}

impl Payload {
    pub fn kind(&self) -> MessageType {
        match self {
            Payload::AssignPeerId { .. } => MessageType::AssignPeerId,
            Payload::AcceptedPeerId { .. } => MessageType::AcceptedPeerId,
            Payload::LocalPeerId { .. } => MessageType::LocalPeerId,
            Payload::SessionOffer { .. } => MessageType::SessionOffer,
            Payload::SessionAnswer { .. } => MessageType::SessionAnswer,
            Payload::NewIceCandidate { .. } => MessageType::NewIceCandidate,
            Payload::JoinPortalRequest => MessageType::JoinPortalRequest,
            Payload::LeavePortalRequest => MessageType::LeavePortalRequest,
            Payload::JoinRequestAccepted { .. } => MessageType::JoinRequestAccepted,
            Payload::SiteIdAssignment { .. } => MessageType::SiteIdAssignment,
            Payload::SiteIdAcknowledgement { .. } => MessageType::SiteIdAcknowledgement,
            Payload::Insert { .. } => MessageType::Insert,
            Payload::Delete { .. } => MessageType::Delete,
            Payload::InsertBatch { .. } => MessageType::InsertBatch,
            Payload::DeleteBatch { .. } => MessageType::DeleteBatch,
            Payload::TextBufferProxyInsert { .. } => MessageType::TextBufferProxyInsert,
            Payload::TextBufferProxyDelete { .. } => MessageType::TextBufferProxyDelete,
        }
    }
}

/// A `{header, body}` message as carried over signalling and data channels.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub header: Header,
    pub payload: Payload,
}

impl Envelope {
    pub fn new(header: Header, payload: Payload) -> Self {
        Self { header, payload }
    }

    /// An envelope bound for the signalling server.
    pub fn to_server(sender: Option<PeerId>, payload: Payload) -> Self {
        Self {
            header: Header {
                sender,
                target: None,
                portal_host: None,
                flag: Some(Flag::Server),
            },
            payload,
        }
    }

    /// An envelope addressed to a single peer.
    pub fn to_peer(
        sender: PeerId,
        target: PeerId,
        portal_host: Option<PeerId>,
        payload: Payload,
    ) -> Self {
        Self {
            header: Header {
                sender: Some(sender),
                target: Some(Target::One(target)),
                portal_host,
                flag: Some(Flag::Peer),
            },
            payload,
        }
    }

    /// An envelope fanned out to a set of peers.
    pub fn to_peers(
        sender: PeerId,
        targets: Vec<PeerId>,
        portal_host: Option<PeerId>,
        payload: Payload,
    ) -> Self {
        Self {
            header: Header {
                sender: Some(sender),
                target: Some(Target::Many(targets)),
                portal_host,
                flag: Some(Flag::Peer),
            },
            payload,
        }
    }

    /// An untargeted envelope for intra-process delivery.
    pub fn local(payload: Payload) -> Self {
        Self {
            header: Header::default(),
            payload,
        }
    }

    pub fn kind(&self) -> MessageType {
        self.payload.kind()
    }

    pub fn to_wire(&self) -> Result<String> {
        serde_json::to_string(&RawEnvelope::from(self)).context(WireSnafu)
    }

    pub fn from_wire(text: &str) -> Result<Self> {
        let raw: RawEnvelope = serde_json::from_str(text).context(WireSnafu)?;
        raw.try_into()
    }
}

/// Percent-encodes a session description or ICE candidate for the body.
pub fn encode_body_component(value: &str) -> String {
    utf8_percent_encode(value, NON_ALPHANUMERIC).to_string()
}

/// Inverse of [`encode_body_component`].
pub fn decode_body_component(value: &str) -> Result<String> {
    percent_decode_str(value)
        .decode_utf8()
        .map(|s| s.into_owned())
        .map_err(|_| Error::MalformedComponent)
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawHeader {
    #[serde(rename = "type")]
    kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    sender_peer_id: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_peer_id: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    target_peer_ids: Option<Vec<PeerId>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    portal_host_peer_id: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    flag: Option<Flag>,
}

/// The union of every recognised body field; which ones are required is
/// decided by the header type.
#[derive(Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase", default)]
struct RawBody {
    #[serde(skip_serializing_if = "Option::is_none")]
    text_buffer_proxy_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    char_object: Option<Atom>,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_pos: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    end_pos: Option<Point>,
    #[serde(skip_serializing_if = "Option::is_none")]
    new_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    site_id: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message_batch: Option<Vec<BatchEntry>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_peer_id: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    assigned_peer_id: Option<PeerId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    session_description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    ice_candidate: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct RawEnvelope {
    header: RawHeader,
    body: RawBody,
}

impl From<&Envelope> for RawEnvelope {
    fn from(envelope: &Envelope) -> Self {
        let header = &envelope.header;
        let (target_peer_id, target_peer_ids) = match &header.target {
            Some(Target::One(id)) => (Some(id.clone()), None),
            Some(Target::Many(ids)) => (None, Some(ids.clone())),
            None => (None, None),
        };

        let mut body = RawBody::default();
        match envelope.payload.clone() {
            Payload::AssignPeerId { assigned_peer_id } => {
                body.assigned_peer_id = Some(assigned_peer_id);
            }
            Payload::AcceptedPeerId { local_peer_id } | Payload::LocalPeerId { local_peer_id } => {
                body.local_peer_id = Some(local_peer_id);
            }
            Payload::SessionOffer {
                session_description,
            }
            | Payload::SessionAnswer {
                session_description,
            } => {
                body.session_description = Some(session_description);
            }
            Payload::NewIceCandidate { ice_candidate } => {
                body.ice_candidate = Some(ice_candidate);
            }
            Payload::JoinPortalRequest | Payload::LeavePortalRequest => {}
            Payload::JoinRequestAccepted { username } => {
                body.username = Some(username);
            }
            Payload::SiteIdAssignment { site_id } => {
                body.site_id = Some(site_id);
            }
            Payload::SiteIdAcknowledgement { site_id, username } => {
                body.site_id = Some(site_id);
                body.username = Some(username);
            }
            Payload::Insert {
                text_buffer_proxy_id,
                char_object,
            }
            | Payload::Delete {
                text_buffer_proxy_id,
                char_object,
            } => {
                body.text_buffer_proxy_id = Some(text_buffer_proxy_id);
                body.char_object = Some(char_object);
            }
            Payload::InsertBatch { message_batch } | Payload::DeleteBatch { message_batch } => {
                body.message_batch = Some(message_batch);
            }
            Payload::TextBufferProxyInsert {
                text_buffer_proxy_id,
                new_text,
                start_pos,
            } => {
                body.text_buffer_proxy_id = Some(text_buffer_proxy_id);
                body.new_text = Some(new_text);
                body.start_pos = Some(start_pos);
            }
            Payload::TextBufferProxyDelete {
                text_buffer_proxy_id,
                start_pos,
                end_pos,
            } => {
                body.text_buffer_proxy_id = Some(text_buffer_proxy_id);
                body.start_pos = Some(start_pos);
                body.end_pos = Some(end_pos);
            }
        }

        RawEnvelope {
            header: RawHeader {
                kind: envelope.kind().as_str().to_string(),
                sender_peer_id: header.sender.clone(),
                target_peer_id,
                target_peer_ids,
                portal_host_peer_id: header.portal_host.clone(),
                flag: header.flag,
            },
            body,
        }
    }
}

impl TryFrom<RawEnvelope> for Envelope {
    type Error = Error;

    fn try_from(raw: RawEnvelope) -> Result<Self> {
        let kind = MessageType::parse(&raw.header.kind)?;
        let body = raw.body;

        macro_rules! require {
            ($field:ident) => {
                body.$field.context(MissingFieldSnafu {
                    kind: kind.as_str(),
                    field: stringify!($field),
                })?
            };
        }

        let payload = match kind {
            MessageType::AssignPeerId => Payload::AssignPeerId {
                assigned_peer_id: require!(assigned_peer_id),
            },
            MessageType::AcceptedPeerId => Payload::AcceptedPeerId {
                local_peer_id: require!(local_peer_id),
            },
            MessageType::LocalPeerId => Payload::LocalPeerId {
                local_peer_id: require!(local_peer_id),
            },
            MessageType::SessionOffer => Payload::SessionOffer {
                session_description: require!(session_description),
            },
            MessageType::SessionAnswer => Payload::SessionAnswer {
                session_description: require!(session_description),
            },
            MessageType::NewIceCandidate => Payload::NewIceCandidate {
                ice_candidate: require!(ice_candidate),
            },
            MessageType::JoinPortalRequest => Payload::JoinPortalRequest,
            MessageType::LeavePortalRequest => Payload::LeavePortalRequest,
            MessageType::JoinRequestAccepted => Payload::JoinRequestAccepted {
                username: require!(username),
            },
            MessageType::SiteIdAssignment => Payload::SiteIdAssignment {
                site_id: require!(site_id),
            },
            MessageType::SiteIdAcknowledgement => Payload::SiteIdAcknowledgement {
                site_id: require!(site_id),
                username: require!(username),
            },
            MessageType::Insert => Payload::Insert {
                text_buffer_proxy_id: require!(text_buffer_proxy_id),
                char_object: require!(char_object),
            },
            MessageType::Delete => Payload::Delete {
                text_buffer_proxy_id: require!(text_buffer_proxy_id),
                char_object: require!(char_object),
            },
            MessageType::InsertBatch => Payload::InsertBatch {
                message_batch: require!(message_batch),
            },
            MessageType::DeleteBatch => Payload::DeleteBatch {
                message_batch: require!(message_batch),
            },
            MessageType::TextBufferProxyInsert => Payload::TextBufferProxyInsert {
                text_buffer_proxy_id: require!(text_buffer_proxy_id),
                new_text: require!(new_text),
                start_pos: require!(start_pos),
            },
            MessageType::TextBufferProxyDelete => Payload::TextBufferProxyDelete {
                text_buffer_proxy_id: require!(text_buffer_proxy_id),
                start_pos: require!(start_pos),
                end_pos: require!(end_pos),
            },
        };

        let target = match (raw.header.target_peer_id, raw.header.target_peer_ids) {
            (Some(one), _) => Some(Target::One(one)),
            (None, Some(many)) => Some(Target::Many(many)),
            (None, None) => None,
        };

        Ok(Envelope {
            header: Header {
                sender: raw.header.sender_peer_id,
                target,
                portal_host: raw.header.portal_host_peer_id,
                flag: raw.header.flag,
            },
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{id::Id, sequence::Sequence};

    fn atom() -> Atom {
        Atom::new('x', Sequence::new(&[Id::new(4, 2)]))
    }

    #[test]
    fn test_insert_round_trip() {
        let envelope = Envelope::to_peer(
            "guest-1".into(),
            "host-1".into(),
            Some("host-1".into()),
            Payload::Insert {
                text_buffer_proxy_id: "u1/foo.txt".into(),
                char_object: atom(),
            },
        );

        let wire = envelope.to_wire().unwrap();
        assert!(wire.contains(r#""type":"INSERT""#));
        assert!(wire.contains(r#""portalHostPeerId":"host-1""#));
        assert_eq!(Envelope::from_wire(&wire).unwrap(), envelope);
    }

    #[test]
    fn test_batch_keeps_type_on_header_only() {
        let envelope = Envelope::to_peers(
            "host-1".into(),
            vec!["guest-1".into(), "guest-2".into()],
            Some("host-1".into()),
            Payload::InsertBatch {
                message_batch: vec![BatchEntry {
                    text_buffer_proxy_id: "u1/foo.txt".into(),
                    char_object: atom(),
                }],
            },
        );

        let wire = envelope.to_wire().unwrap();
        assert_eq!(wire.matches("INSERT_BATCH").count(), 1);
        assert!(wire.contains(r#""targetPeerIds":["guest-1","guest-2"]"#));
        assert_eq!(Envelope::from_wire(&wire).unwrap(), envelope);
    }

    #[test]
    fn test_server_flag_round_trip() {
        let envelope = Envelope::to_server(
            Some("host-1".into()),
            Payload::AcceptedPeerId {
                local_peer_id: "host-1".into(),
            },
        );

        let wire = envelope.to_wire().unwrap();
        assert!(wire.contains(r#""flag":"SERVER""#));
        let back = Envelope::from_wire(&wire).unwrap();
        assert_eq!(back.header.flag, Some(Flag::Server));
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        let wire = r#"{"header":{"type":"WHOAMI"},"body":{}}"#;
        let err = Envelope::from_wire(wire).unwrap_err();
        assert!(matches!(err, Error::UnknownMessageType { value } if value == "WHOAMI"));
    }

    #[test]
    fn test_missing_body_field_is_rejected() {
        let wire = r#"{"header":{"type":"SITE_ID_ASSIGNMENT"},"body":{}}"#;
        let err = Envelope::from_wire(wire).unwrap_err();
        assert!(matches!(err, Error::MissingField { field, .. } if field == "site_id"));
    }

    #[test]
    fn test_join_state_messages_round_trip() {
        for payload in [
            Payload::JoinPortalRequest,
            Payload::SiteIdAssignment { site_id: 2 },
            Payload::SiteIdAcknowledgement {
                site_id: 2,
                username: "G".into(),
            },
            Payload::JoinRequestAccepted {
                username: "H".into(),
            },
            Payload::LeavePortalRequest,
        ] {
            let envelope = Envelope::to_peer("a".into(), "b".into(), Some("b".into()), payload);
            let back = Envelope::from_wire(&envelope.to_wire().unwrap()).unwrap();
            assert_eq!(back, envelope);
        }
    }

    #[test]
    fn test_body_component_encoding() {
        let sdp = r#"{"type":"offer","sdp":"v=0\r\n"}"#;
        let encoded = encode_body_component(sdp);
        assert!(!encoded.contains('{'));
        assert_eq!(decode_body_component(&encoded).unwrap(), sdp);
    }
}
