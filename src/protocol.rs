//! WebSocket message protocol.
//!
//! Every text frame carries one JSON object `{"event": "<name>", "data": ...}`
//! in both directions. Client payload fields are camelCase; session records
//! keep their snake_case column names.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::classifier::InteractionState;
use crate::store::SessionRecord;

// ── Client → server ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientMessage {
    #[serde(rename = "session:create")]
    CreateSession(CreateSessionParams),
    #[serde(rename = "session:kill")]
    KillSession(SessionRef),
    #[serde(rename = "session:list")]
    ListSessions,
    #[serde(rename = "session:resume")]
    ResumeSession(SessionRef),
    #[serde(rename = "cc:input")]
    Input(InputParams),
    #[serde(rename = "cc:approve")]
    Approve(SessionRef),
    #[serde(rename = "cc:reject")]
    Reject(SessionRef),
    #[serde(rename = "cc:interrupt")]
    Interrupt(SessionRef),
    #[serde(rename = "cc:resize")]
    Resize(ResizeParams),
    #[serde(rename = "cc:photo")]
    Photo(PhotoParams),
}

impl ClientMessage {
    /// Wire name of the event, for logging.
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::CreateSession(_) => "session:create",
            Self::KillSession(_) => "session:kill",
            Self::ListSessions => "session:list",
            Self::ResumeSession(_) => "session:resume",
            Self::Input(_) => "cc:input",
            Self::Approve(_) => "cc:approve",
            Self::Reject(_) => "cc:reject",
            Self::Interrupt(_) => "cc:interrupt",
            Self::Resize(_) => "cc:resize",
            Self::Photo(_) => "cc:photo",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct CreateSessionParams {
    pub name: String,
    pub cwd: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRef {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InputParams {
    pub session_id: String,
    pub text: String,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResizeParams {
    pub session_id: String,
    pub cols: u16,
    pub rows: u16,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhotoParams {
    pub session_id: String,
    pub filename: String,
    pub base64: String,
}

// ── Server → client ────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "cc:output")]
    Output(OutputPayload),
    #[serde(rename = "cc:status")]
    Status(StatusPayload),
    #[serde(rename = "cc:cost")]
    Cost(CostPayload),
    #[serde(rename = "cc:error")]
    Error(ErrorPayload),
    #[serde(rename = "session:list")]
    SessionList(Vec<SessionRecord>),
    #[serde(rename = "session:created")]
    SessionCreated(SessionRecord),
    #[serde(rename = "session:updated")]
    SessionUpdated(SessionRecord),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutputPayload {
    pub session_id: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusPayload {
    pub session_id: String,
    pub status: InteractionState,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CostPayload {
    pub session_id: String,
    pub cost: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorPayload {
    pub message: String,
}

impl ServerEvent {
    pub fn output(session_id: &str, content: impl Into<String>) -> Self {
        Self::Output(OutputPayload {
            session_id: session_id.to_string(),
            content: content.into(),
            timestamp: Utc::now(),
        })
    }

    pub fn status(session_id: &str, status: InteractionState) -> Self {
        Self::Status(StatusPayload {
            session_id: session_id.to_string(),
            status,
        })
    }

    pub fn cost(session_id: &str, cost: f64) -> Self {
        Self::Cost(CostPayload {
            session_id: session_id.to_string(),
            cost,
        })
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::Error(ErrorPayload {
            message: message.into(),
        })
    }

    pub fn event_name(&self) -> &'static str {
        match self {
            Self::Output(_) => "cc:output",
            Self::Status(_) => "cc:status",
            Self::Cost(_) => "cc:cost",
            Self::Error(_) => "cc:error",
            Self::SessionList(_) => "session:list",
            Self::SessionCreated(_) => "session:created",
            Self::SessionUpdated(_) => "session:updated",
        }
    }

    /// Serialize to the JSON text carried by one WebSocket frame.
    pub fn to_json(&self) -> String {
        // Every payload is plain data with string keys.
        serde_json::to_string(self).unwrap_or_else(|e| {
            tracing::error!(?e, event = self.event_name(), "failed to serialize event");
            r#"{"event":"cc:error","data":{"message":"internal serialization error"}}"#.to_string()
        })
    }
}
