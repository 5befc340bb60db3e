use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;

/// Known signalling action kinds and their wire names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SignalAction {
    Offer,
    Answer,
    IceCandidate,
    EndSession,
    Heartbeat,
    Warning,
    StreamInput,
    StreamInterrupted,
    SessionReady,
}

impl SignalAction {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Offer => "offer",
            Self::Answer => "answer",
            Self::IceCandidate => "icecandidate",
            Self::EndSession => "endsession",
            Self::Heartbeat => "heartbeat",
            Self::Warning => "warning",
            Self::StreamInput => "talkstream",
            Self::StreamInterrupted => "talkinputstreaminterrupted",
            Self::SessionReady => "sessionready",
        }
    }

    #[must_use]
    pub fn from_wire(kind: &str) -> Option<Self> {
        let action = match kind {
            "offer" => Self::Offer,
            "answer" => Self::Answer,
            "icecandidate" => Self::IceCandidate,
            "endsession" => Self::EndSession,
            "heartbeat" => Self::Heartbeat,
            "warning" => Self::Warning,
            "talkstream" => Self::StreamInput,
            // Chat input streams are interrupted with their own tag.
            "talkinputstreaminterrupted" | "chatinputstreaminterrupted" => Self::StreamInterrupted,
            "sessionready" => Self::SessionReady,
            _ => return None,
        };
        Some(action)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
    Pranswer,
    Rollback,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    #[must_use]
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Offer, sdp: sdp.into() }
    }

    #[must_use]
    pub fn answer(sdp: impl Into<String>) -> Self {
        Self { kind: SdpType::Answer, sdp: sdp.into() }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", default, skip_serializing_if = "Option::is_none")]
    pub sdp_m_line_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl IceCandidate {
    #[must_use]
    pub fn new(candidate: impl Into<String>) -> Self {
        Self {
            candidate: candidate.into(),
            sdp_mid: None,
            sdp_m_line_index: None,
            username_fragment: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct OfferPayload {
    pub connection_description: SessionDescription,
    pub user_uid: String,
}

/// One chunk of a correlated input stream (speech or chat).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamInputPayload {
    pub content: String,
    pub start_of_speech: bool,
    pub end_of_speech: bool,
    pub correlation_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StreamInterruptedPayload {
    pub correlation_id: String,
}

/// Typed payload of a signalling message, tagged by action kind.
#[derive(Debug, Clone, PartialEq)]
pub enum SignalBody {
    Offer(OfferPayload),
    Answer(SessionDescription),
    IceCandidate(IceCandidate),
    EndSession(String),
    Heartbeat,
    Warning(String),
    StreamInput(StreamInputPayload),
    StreamInterrupted(StreamInterruptedPayload),
    SessionReady(Value),
    /// An action kind this client does not know; kept so consumers can log it.
    Unknown { action_kind: String, payload: Value },
}

impl SignalBody {
    #[must_use]
    pub const fn action(&self) -> Option<SignalAction> {
        match self {
            Self::Offer(_) => Some(SignalAction::Offer),
            Self::Answer(_) => Some(SignalAction::Answer),
            Self::IceCandidate(_) => Some(SignalAction::IceCandidate),
            Self::EndSession(_) => Some(SignalAction::EndSession),
            Self::Heartbeat => Some(SignalAction::Heartbeat),
            Self::Warning(_) => Some(SignalAction::Warning),
            Self::StreamInput(_) => Some(SignalAction::StreamInput),
            Self::StreamInterrupted(_) => Some(SignalAction::StreamInterrupted),
            Self::SessionReady(_) => Some(SignalAction::SessionReady),
            Self::Unknown { .. } => None,
        }
    }

    #[must_use]
    pub fn action_kind(&self) -> &str {
        match self {
            Self::Unknown { action_kind, .. } => action_kind,
            known => known.action().map_or("", SignalAction::as_str),
        }
    }
}

/// A message on the signalling bus, scoped to one session.
#[derive(Debug, Clone, PartialEq)]
pub struct SignalMessage {
    pub session_id: String,
    pub body: SignalBody,
}

impl SignalMessage {
    #[must_use]
    pub fn new(session_id: impl Into<String>, body: SignalBody) -> Self {
        Self { session_id: session_id.into(), body }
    }

    #[must_use]
    pub fn action_kind(&self) -> &str {
        self.body.action_kind()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct SignalEnvelope {
    #[serde(alias = "actionType")]
    action_kind: String,
    session_id: String,
    #[serde(default)]
    payload: Value,
}

fn text_payload(payload: Value) -> String {
    match payload {
        Value::String(text) => text,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

impl TryFrom<SignalEnvelope> for SignalMessage {
    type Error = serde_json::Error;

    fn try_from(envelope: SignalEnvelope) -> Result<Self, Self::Error> {
        let SignalEnvelope { action_kind, session_id, payload } = envelope;
        let body = match SignalAction::from_wire(&action_kind) {
            Some(SignalAction::Offer) => SignalBody::Offer(serde_json::from_value(payload)?),
            Some(SignalAction::Answer) => SignalBody::Answer(serde_json::from_value(payload)?),
            Some(SignalAction::IceCandidate) => SignalBody::IceCandidate(serde_json::from_value(payload)?),
            Some(SignalAction::EndSession) => SignalBody::EndSession(text_payload(payload)),
            Some(SignalAction::Heartbeat) => SignalBody::Heartbeat,
            Some(SignalAction::Warning) => SignalBody::Warning(text_payload(payload)),
            Some(SignalAction::StreamInput) => SignalBody::StreamInput(serde_json::from_value(payload)?),
            Some(SignalAction::StreamInterrupted) => {
                SignalBody::StreamInterrupted(serde_json::from_value(payload)?)
            }
            Some(SignalAction::SessionReady) => SignalBody::SessionReady(payload),
            None => SignalBody::Unknown { action_kind, payload },
        };
        Ok(Self { session_id, body })
    }
}

impl Serialize for SignalMessage {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        let payload = match &self.body {
            SignalBody::Offer(offer) => serde_json::to_value(offer),
            SignalBody::Answer(answer) => serde_json::to_value(answer),
            SignalBody::IceCandidate(candidate) => serde_json::to_value(candidate),
            SignalBody::EndSession(text) | SignalBody::Warning(text) => Ok(Value::String(text.clone())),
            SignalBody::Heartbeat => Ok(Value::String(String::new())),
            SignalBody::StreamInput(input) => serde_json::to_value(input),
            SignalBody::StreamInterrupted(interrupted) => serde_json::to_value(interrupted),
            SignalBody::SessionReady(value) | SignalBody::Unknown { payload: value, .. } => Ok(value.clone()),
        }
        .map_err(<S::Error as serde::ser::Error>::custom)?;

        SignalEnvelope {
            action_kind: self.action_kind().to_string(),
            session_id: self.session_id.clone(),
            payload,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SignalMessage {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let envelope = SignalEnvelope::deserialize(deserializer)?;
        let kind = envelope.action_kind.clone();
        Self::try_from(envelope)
            .map_err(|err| <D::Error as serde::de::Error>::custom(format!("malformed '{kind}' payload: {err}")))
    }
}
