//! JSON frames exchanged between agents and the hub, one object per
//! websocket text frame with a `type` discriminator.

use crate::locks::{AccessReport, LockDenial, LockRecord, LockType};
use crate::orchestrator::WorkflowSummary;
use crate::regions::CodeRegion;
use crate::Role;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use thiserror::Error;

pub const MAX_FRAME_BYTES: usize = 256 * 1024;
pub const DEFAULT_SUBSCRIPTION: &str = "**/*";
/// Changes included in a context snapshot.
pub const CONTEXT_RECENT_CHANGES: usize = 20;

pub mod error_codes {
    pub const INVALID_MESSAGE: &str = "invalid_message";
    pub const NOT_REGISTERED: &str = "not_registered";
    pub const REGION_NOT_FOUND: &str = "region_not_found";
    pub const LOCK_NOT_HELD: &str = "lock_not_held";
    pub const HELD_BY_OTHER: &str = "held_by_other";
    pub const INVALID_PATTERN: &str = "invalid_pattern";
    pub const FILE_UNREADABLE: &str = "file_unreadable";
    pub const WORKFLOW: &str = "workflow_rejected";
}

#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame has no string `type` field")]
    MissingType,
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Created,
    Modified,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileChangeEvent {
    pub file_path: String,
    pub change_type: ChangeType,
    /// Lock holder the change is attributed to; `None` for out-of-band writes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent_id: Option<String>,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct AgentSummary {
    pub agent_id: String,
    pub agent_type: String,
    pub instance_id: String,
    pub role: Role,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub partition: Option<String>,
    #[serde(default)]
    pub subscriptions: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub last_heartbeat: DateTime<Utc>,
}

/// Read-only snapshot of hub state handed to agents.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SharedContext {
    pub workspace: String,
    pub agents: Vec<AgentSummary>,
    pub locks: Vec<LockRecord>,
    pub recent_changes: Vec<FileChangeEvent>,
    pub partitions: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow: Option<WorkflowSummary>,
    pub generated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RegionStatus {
    #[serde(flatten)]
    pub region: CodeRegion,
    pub available: bool,
}

fn default_subscription() -> String {
    DEFAULT_SUBSCRIPTION.to_string()
}

/// Agent to hub.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ClientMsg {
    #[serde(rename = "agent:register")]
    Register {
        agent_type: String,
        instance_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partition: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        role: Option<Role>,
    },
    #[serde(rename = "agent:heartbeat")]
    Heartbeat,
    #[serde(rename = "file:subscribe")]
    Subscribe {
        #[serde(default = "default_subscription")]
        pattern: String,
    },
    #[serde(rename = "file:unsubscribe")]
    Unsubscribe {
        #[serde(default = "default_subscription")]
        pattern: String,
    },
    #[serde(rename = "lock:acquire")]
    AcquireLock {
        file_path: String,
        #[serde(default)]
        lock_type: LockType,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        ttl_secs: Option<u64>,
        /// Structural region name or a `lines:A-B` literal.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
    #[serde(rename = "lock:release")]
    ReleaseLock {
        file_path: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        region: Option<String>,
    },
    #[serde(rename = "lock:check")]
    CheckLock { file_path: String, line: u32 },
    #[serde(rename = "regions:get")]
    GetRegions { file_path: String },
    #[serde(rename = "context:get")]
    GetContext,
    #[serde(rename = "context:update")]
    UpdateContext {
        #[serde(default)]
        partition: Option<String>,
    },
    #[serde(rename = "broadcast")]
    Broadcast {
        event: String,
        #[serde(default)]
        data: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        target: Option<String>,
    },
    #[serde(rename = "ping")]
    Ping,
    /// Any other `type`; relayed to peers as an event of that name.
    #[serde(skip)]
    Forward {
        event: String,
        fields: Map<String, Value>,
    },
}

const CLIENT_TYPES: &[&str] = &[
    "agent:register",
    "agent:heartbeat",
    "file:subscribe",
    "file:unsubscribe",
    "lock:acquire",
    "lock:release",
    "lock:check",
    "regions:get",
    "context:get",
    "context:update",
    "broadcast",
    "ping",
];

impl ClientMsg {
    pub fn kind(&self) -> &str {
        match self {
            ClientMsg::Register { .. } => "agent:register",
            ClientMsg::Heartbeat => "agent:heartbeat",
            ClientMsg::Subscribe { .. } => "file:subscribe",
            ClientMsg::Unsubscribe { .. } => "file:unsubscribe",
            ClientMsg::AcquireLock { .. } => "lock:acquire",
            ClientMsg::ReleaseLock { .. } => "lock:release",
            ClientMsg::CheckLock { .. } => "lock:check",
            ClientMsg::GetRegions { .. } => "regions:get",
            ClientMsg::GetContext => "context:get",
            ClientMsg::UpdateContext { .. } => "context:update",
            ClientMsg::Broadcast { .. } => "broadcast",
            ClientMsg::Ping => "ping",
            ClientMsg::Forward { event, .. } => event,
        }
    }
}

/// Event relayed between agents; serialized with the event name as `type`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventFrame {
    #[serde(rename = "type")]
    pub event: String,
    pub from: String,
    pub timestamp: DateTime<Utc>,
    #[serde(default)]
    pub data: Value,
}

/// Hub to agent.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type")]
pub enum ServerMsg {
    #[serde(rename = "agent:registered")]
    Registered {
        agent_id: String,
        workspace: String,
        context: SharedContext,
    },
    #[serde(rename = "agent:joined")]
    AgentJoined {
        agent_id: String,
        agent_type: String,
        role: Role,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partition: Option<String>,
    },
    #[serde(rename = "agent:left")]
    AgentLeft { agent_id: String, reason: String },
    #[serde(rename = "file:changed")]
    FileChanged(FileChangeEvent),
    #[serde(rename = "file:created")]
    FileCreated(FileChangeEvent),
    #[serde(rename = "file:deleted")]
    FileDeleted(FileChangeEvent),
    #[serde(rename = "lock:acquired")]
    LockAcquired {
        lock: LockRecord,
        #[serde(default)]
        renewed: bool,
    },
    #[serde(rename = "lock:failed")]
    LockFailed(LockDenial),
    #[serde(rename = "lock:released")]
    LockReleased {
        resource_id: String,
        file_path: String,
        agent_id: String,
    },
    #[serde(rename = "lock:expired")]
    LockExpired { lock: LockRecord },
    #[serde(rename = "lock:access")]
    LockAccess {
        file_path: String,
        line: u32,
        #[serde(flatten)]
        report: AccessReport,
    },
    #[serde(rename = "regions:list")]
    RegionsList {
        file_path: String,
        regions: Vec<RegionStatus>,
    },
    #[serde(rename = "context:sync")]
    ContextSync(SharedContext),
    #[serde(rename = "workflow:notify")]
    WorkflowNotify {
        role: Role,
        event: String,
        message: String,
        #[serde(default)]
        data: Value,
    },
    #[serde(rename = "workflow:state")]
    WorkflowStatus(WorkflowSummary),
    #[serde(rename = "merge:applied")]
    MergeApplied {
        file_path: String,
        written: bool,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        checksum: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        conflict_id: Option<String>,
    },
    #[serde(rename = "pong")]
    Pong { timestamp: DateTime<Utc> },
    #[serde(rename = "error")]
    Error { code: String, message: String },
    #[serde(untagged)]
    Event(EventFrame),
}

impl ServerMsg {
    pub fn file_event(change: FileChangeEvent) -> Self {
        match change.change_type {
            ChangeType::Created => ServerMsg::FileCreated(change),
            ChangeType::Modified => ServerMsg::FileChanged(change),
            ChangeType::Deleted => ServerMsg::FileDeleted(change),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMsg::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(text: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    if text.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: text.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(text).map_err(|err| FrameError::Decode(err.to_string()))
}

/// Decodes an inbound frame; unrecognized types become [`ClientMsg::Forward`].
pub fn decode_client_msg(text: &str, max_frame_bytes: usize) -> Result<ClientMsg, FrameError> {
    let value: Value = decode_frame(text, max_frame_bytes)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .ok_or(FrameError::MissingType)?
        .to_string();
    if CLIENT_TYPES.contains(&kind.as_str()) {
        return serde_json::from_value(value).map_err(|err| FrameError::Decode(err.to_string()));
    }
    let mut fields = match value {
        Value::Object(map) => map,
        _ => return Err(FrameError::MissingType),
    };
    fields.remove("type");
    Ok(ClientMsg::Forward {
        event: kind,
        fields,
    })
}
