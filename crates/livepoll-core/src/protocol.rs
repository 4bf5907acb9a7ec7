// Wire protocol between browser participants and the poll server.
//
// Every frame is a JSON object `{"event": <name>, "payload": {...}}` with
// camelCase event names and field names.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifies one live transport connection. Allocated by the transport,
/// never reused within a process lifetime.
pub type ConnectionId = u64;

/// Participant name → chosen option. Ordered so every subscriber sees the
/// same serialization.
pub type Answers = BTreeMap<String, String>;

// ---------------------------------------------------------------------------
// Roles
// ---------------------------------------------------------------------------

/// Self-declared role of a participant. Trusted as sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Teacher,
    Student,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Teacher => f.write_str("teacher"),
            Role::Student => f.write_str("student"),
        }
    }
}

// ---------------------------------------------------------------------------
// Inbound (participant -> server)
// ---------------------------------------------------------------------------

/// Messages a participant sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum ClientMessage {
    Announce(AnnouncePayload),
    CreatePoll(CreatePollPayload),
    SubmitAnswer(SubmitAnswerPayload),
}

impl ClientMessage {
    /// The event name as it appears on the wire.
    pub fn kind(&self) -> RequestKind {
        match self {
            ClientMessage::Announce(_) => RequestKind::Announce,
            ClientMessage::CreatePoll(_) => RequestKind::CreatePoll,
            ClientMessage::SubmitAnswer(_) => RequestKind::SubmitAnswer,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnnouncePayload {
    pub display_name: String,
    pub role: Role,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatePollPayload {
    pub question: String,
    pub options: Vec<String>,
    /// Absent or non-positive means "use the configured default".
    #[serde(default)]
    pub duration_ms: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubmitAnswerPayload {
    pub display_name: String,
    pub chosen_option: String,
    /// The poll the answer was given for, as announced in `pollStarted`.
    /// Answers for any other poll are refused.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sequence_number: Option<u64>,
}

/// Which inbound request a rejection refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RequestKind {
    Announce,
    CreatePoll,
    SubmitAnswer,
    /// The frame could not be parsed into any known request.
    Unknown,
}

// ---------------------------------------------------------------------------
// Outbound (server -> participants)
// ---------------------------------------------------------------------------

/// Messages the server pushes to participants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "payload", rename_all = "camelCase")]
pub enum ServerMessage {
    PollStarted(PollStartedPayload),
    TallyUpdated(TallyPayload),
    PollEnded(PollEndedPayload),
    Rejected(RejectedPayload),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollStartedPayload {
    pub sequence_number: u64,
    pub question: String,
    pub options: Vec<String>,
    pub duration_ms: u64,
    /// Display-only countdown value, rounded up to whole seconds.
    pub remaining_secs: u64,
    pub started_at: DateTime<Utc>,
}

/// Per-option vote count, in the poll's option order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OptionCount {
    pub option: String,
    pub votes: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TallyPayload {
    pub sequence_number: u64,
    pub answers: Answers,
    pub counts: Vec<OptionCount>,
}

/// Why a poll left the Active state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    AllAnswered,
    TimedOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PollEndedPayload {
    pub sequence_number: u64,
    pub final_answers: Answers,
    pub counts: Vec<OptionCount>,
    pub reason: EndReason,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RejectedPayload {
    pub request: RequestKind,
    pub reason: String,
}
