//! crates/study_sync_core/src/events.rs
//!
//! The broadcast protocol spoken on a group's relay channel. Every topic has an explicit
//! payload type; frames that don't parse are rejected at the boundary instead of being
//! trusted downstream.

use crate::domain::{ChatMessage, MemberStatus, TimerSettings, TimerState};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

pub const TOPIC_NEW_MESSAGE: &str = "new-message";
pub const TOPIC_TIMER_SYNC: &str = "timer-sync";
pub const TOPIC_TIMER_TICK: &str = "timer-tick";
pub const TOPIC_REQUEST_TIMER_SYNC: &str = "request-timer-sync";
pub const TOPIC_SETTINGS_CHANGE: &str = "settings-change";
pub const TOPIC_EXAM_UPDATE: &str = "exam-update";
pub const TOPIC_GROUP_DELETED: &str = "group-deleted";
pub const TOPIC_LEADERBOARD_UPDATE: &str = "leaderboard-update";

/// Relay channel name for a group.
pub fn group_channel(group_id: Uuid) -> String {
    format!("group-{}", group_id)
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum EventError {
    #[error("unknown broadcast topic '{0}'")]
    UnknownTopic(String),
    #[error("malformed '{topic}' payload: {reason}")]
    Malformed { topic: String, reason: String },
}

//=========================================================================================
// Payloads
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewMessagePayload {
    pub id: Uuid,
    /// Author display name.
    pub user: String,
    pub text: String,
    pub is_system: bool,
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

impl NewMessagePayload {
    pub fn from_message(message: &ChatMessage) -> Self {
        Self {
            id: message.id,
            user: message.author_name.clone(),
            text: message.text.clone(),
            is_system: message.is_system,
            timestamp: message.created_at,
            user_id: Some(message.author_id),
        }
    }

    pub fn into_message(self, group_id: Uuid) -> ChatMessage {
        ChatMessage {
            id: self.id,
            author_id: self.user_id.unwrap_or_else(Uuid::nil),
            author_name: self.user,
            group_id,
            text: self.text,
            is_system: self.is_system,
            created_at: self.timestamp,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerSyncPayload {
    pub timer_state: TimerState,
    pub seconds: u32,
    #[serde(default)]
    pub cycle_count: u32,
    #[serde(default)]
    pub changed_by_id: Option<Uuid>,
    #[serde(default)]
    pub changed_by_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TimerTickPayload {
    pub seconds: u32,
    pub timer_state: TimerState,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestTimerSyncPayload {
    pub requester_id: Uuid,
    pub requester_name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettingsChangePayload {
    pub settings: TimerSettings,
    #[serde(default)]
    pub changed_by_id: Option<Uuid>,
    #[serde(default)]
    pub changed_by_name: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExamAction {
    Add,
    Update,
    Delete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExamRef {
    pub id: Uuid,
    pub name: String,
    /// Free-form date as sent by the author; receivers re-fetch rather than parse it.
    pub date: String,
}

/// Either `{}` or `{action, exam, userId}`; receivers re-fetch in both cases.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExamUpdatePayload {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub action: Option<ExamAction>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exam: Option<ExamRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<Uuid>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GroupDeletedPayload {
    pub group_name: String,
    pub deleted_by: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaderboardUpdatePayload {
    pub user_id: Uuid,
    pub user_name: String,
    pub new_streak: u32,
    pub status: MemberStatus,
}

//=========================================================================================
// Tagged Event
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BroadcastEvent {
    NewMessage(NewMessagePayload),
    TimerSync(TimerSyncPayload),
    TimerTick(TimerTickPayload),
    RequestTimerSync(RequestTimerSyncPayload),
    SettingsChange(SettingsChangePayload),
    ExamUpdate(ExamUpdatePayload),
    GroupDeleted(GroupDeletedPayload),
    LeaderboardUpdate(LeaderboardUpdatePayload),
}

impl BroadcastEvent {
    pub fn topic(&self) -> &'static str {
        match self {
            BroadcastEvent::NewMessage(_) => TOPIC_NEW_MESSAGE,
            BroadcastEvent::TimerSync(_) => TOPIC_TIMER_SYNC,
            BroadcastEvent::TimerTick(_) => TOPIC_TIMER_TICK,
            BroadcastEvent::RequestTimerSync(_) => TOPIC_REQUEST_TIMER_SYNC,
            BroadcastEvent::SettingsChange(_) => TOPIC_SETTINGS_CHANGE,
            BroadcastEvent::ExamUpdate(_) => TOPIC_EXAM_UPDATE,
            BroadcastEvent::GroupDeleted(_) => TOPIC_GROUP_DELETED,
            BroadcastEvent::LeaderboardUpdate(_) => TOPIC_LEADERBOARD_UPDATE,
        }
    }

    pub fn payload(&self) -> Value {
        let encoded = match self {
            BroadcastEvent::NewMessage(p) => serde_json::to_value(p),
            BroadcastEvent::TimerSync(p) => serde_json::to_value(p),
            BroadcastEvent::TimerTick(p) => serde_json::to_value(p),
            BroadcastEvent::RequestTimerSync(p) => serde_json::to_value(p),
            BroadcastEvent::SettingsChange(p) => serde_json::to_value(p),
            BroadcastEvent::ExamUpdate(p) => serde_json::to_value(p),
            BroadcastEvent::GroupDeleted(p) => serde_json::to_value(p),
            BroadcastEvent::LeaderboardUpdate(p) => serde_json::to_value(p),
        };
        // Every payload is a plain struct of strings, numbers and ids.
        encoded.unwrap_or(Value::Null)
    }

    /// Validates a raw relay frame into a typed event.
    pub fn from_frame(topic: &str, payload: Value) -> Result<Self, EventError> {
        fn parse<T: serde::de::DeserializeOwned>(topic: &str, payload: Value) -> Result<T, EventError> {
            serde_json::from_value(payload).map_err(|e| EventError::Malformed {
                topic: topic.to_string(),
                reason: e.to_string(),
            })
        }

        let event = match topic {
            TOPIC_NEW_MESSAGE => BroadcastEvent::NewMessage(parse(topic, payload)?),
            TOPIC_TIMER_SYNC => BroadcastEvent::TimerSync(parse(topic, payload)?),
            TOPIC_TIMER_TICK => BroadcastEvent::TimerTick(parse(topic, payload)?),
            TOPIC_REQUEST_TIMER_SYNC => BroadcastEvent::RequestTimerSync(parse(topic, payload)?),
            TOPIC_SETTINGS_CHANGE => BroadcastEvent::SettingsChange(parse(topic, payload)?),
            TOPIC_EXAM_UPDATE => {
                // Some senders publish `null` or an empty body for a bare "refresh" signal.
                let payload = if payload.is_null() { Value::Object(Default::default()) } else { payload };
                BroadcastEvent::ExamUpdate(parse(topic, payload)?)
            }
            TOPIC_GROUP_DELETED => BroadcastEvent::GroupDeleted(parse(topic, payload)?),
            TOPIC_LEADERBOARD_UPDATE => BroadcastEvent::LeaderboardUpdate(parse(topic, payload)?),
            other => return Err(EventError::UnknownTopic(other.to_string())),
        };
        Ok(event)
    }
}
