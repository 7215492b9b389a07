//! Notification channel wire protocol.
//!
//! Inbound frames are `{ "type": ..., "payload": ... }`, outbound frames are
//! `{ "action": ..., "payload": ... }`. The subscriber registry on the client
//! is keyed by the raw `type` string; the payload structs below give the four
//! known events a typed shape.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::PresenceStatus;

/// Close code meaning "intentional closure, do not reconnect".
pub const NORMAL_CLOSURE: u16 = 1000;

/// Close code used when the stream ended without a close frame.
pub const ABNORMAL_CLOSURE: u16 = 1006;

/// Close reason sent with [`NORMAL_CLOSURE`] on deliberate teardown.
pub const NORMAL_CLOSURE_REASON: &str = "Normal closure";

/// A raw inbound frame, before the payload is interpreted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InboundFrame {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default)]
    pub payload: Value,
}

impl InboundFrame {
    pub fn new(event_type: impl Into<String>, payload: Value) -> Self {
        Self {
            event_type: event_type.into(),
            payload,
        }
    }
}

/// Typed payload of a known inbound event.
pub trait EventPayload: DeserializeOwned + Send + 'static {
    /// Value of the frame's `type` field.
    const EVENT_TYPE: &'static str;

    /// Decode a frame payload. A missing payload decodes as `{}`.
    fn from_payload(payload: &Value) -> Result<Self, serde_json::Error> {
        if payload.is_null() {
            Self::deserialize(&Value::Object(Default::default()))
        } else {
            Self::deserialize(payload)
        }
    }
}

/// The account was locked by an administrator.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct AccountLocked {}

impl EventPayload for AccountLocked {
    const EVENT_TYPE: &'static str = "account_locked";
}

/// The user's roles changed server-side; the identity must be re-fetched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct RoleUpdated {}

impl EventPayload for RoleUpdated {
    const EVENT_TYPE: &'static str = "role_updated";
}

/// Full list of online users.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct OnlineList {
    #[serde(default)]
    pub user_ids: Vec<String>,
}

impl EventPayload for OnlineList {
    const EVENT_TYPE: &'static str = "online_list";
}

/// One user went online or offline.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct UserStatus {
    pub user_id: String,
    pub status: PresenceStatus,
}

impl EventPayload for UserStatus {
    const EVENT_TYPE: &'static str = "user_status";
}

/// Tagged union over the known inbound events.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    AccountLocked(AccountLocked),
    RoleUpdated(RoleUpdated),
    OnlineList(OnlineList),
    UserStatus(UserStatus),
}

impl ServerEvent {
    /// Every event type the client understands.
    pub const TYPES: [&'static str; 4] = [
        AccountLocked::EVENT_TYPE,
        RoleUpdated::EVENT_TYPE,
        OnlineList::EVENT_TYPE,
        UserStatus::EVENT_TYPE,
    ];

    /// Decode a raw frame. Unknown event types yield `Ok(None)`.
    pub fn decode(frame: &InboundFrame) -> Result<Option<Self>, serde_json::Error> {
        let payload = &frame.payload;
        let event = match frame.event_type.as_str() {
            t if t == AccountLocked::EVENT_TYPE => {
                Self::AccountLocked(AccountLocked::from_payload(payload)?)
            }
            t if t == RoleUpdated::EVENT_TYPE => Self::RoleUpdated(RoleUpdated::from_payload(payload)?),
            t if t == OnlineList::EVENT_TYPE => Self::OnlineList(OnlineList::from_payload(payload)?),
            t if t == UserStatus::EVENT_TYPE => Self::UserStatus(UserStatus::from_payload(payload)?),
            _ => return Ok(None),
        };
        Ok(Some(event))
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::AccountLocked(_) => AccountLocked::EVENT_TYPE,
            Self::RoleUpdated(_) => RoleUpdated::EVENT_TYPE,
            Self::OnlineList(_) => OnlineList::EVENT_TYPE,
            Self::UserStatus(_) => UserStatus::EVENT_TYPE,
        }
    }
}

/// Outbound client actions.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "action", content = "payload", rename_all = "snake_case")]
pub enum ClientAction {
    JoinRoom(String),
    LeaveRoom(String),
}

impl ClientAction {
    pub fn name(&self) -> &'static str {
        match self {
            ClientAction::JoinRoom(_) => "join_room",
            ClientAction::LeaveRoom(_) => "leave_room",
        }
    }
}
