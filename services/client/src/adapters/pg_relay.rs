//! services/client/src/adapters/pg_relay.rs
//!
//! A `BroadcastRelay` over PostgreSQL `NOTIFY`. Every relay channel shares the
//! `study_relay` notification channel; envelopes carry the relay channel name and are
//! filtered per subscription. Presence lives in the `presence` table.

use crate::adapters::db::port_error;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::{stream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgListener;
use sqlx::{FromRow, PgPool};
use study_sync_core::domain::{MemberStatus, Presence};
use study_sync_core::ports::{
    BroadcastRelay, ChannelStatus, PortError, PortResult, RelayFrame, RelayStream,
};
use tracing::{debug, warn};
use uuid::Uuid;

pub const RELAY_CHANNEL: &str = "study_relay";

/// `NOTIFY` payloads are capped by the server at just under 8000 bytes.
const MAX_NOTIFY_BYTES: usize = 7900;

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    channel: String,
    topic: String,
    payload: serde_json::Value,
}

#[derive(FromRow)]
struct PresenceRecord {
    member_id: Uuid,
    name: String,
    status: String,
    streak: i32,
    last_seen: DateTime<Utc>,
}
impl PresenceRecord {
    fn to_domain(self) -> Presence {
        Presence {
            member_id: self.member_id,
            name: self.name,
            status: self.status.parse().unwrap_or(MemberStatus::Offline),
            streak: self.streak.max(0) as u32,
            last_seen: self.last_seen,
        }
    }
}

#[derive(Clone)]
pub struct PgRelay {
    pool: PgPool,
}

impl PgRelay {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn frame_for(channel: &str, raw: &str) -> Option<RelayFrame> {
    match serde_json::from_str::<Envelope>(raw) {
        Ok(envelope) if envelope.channel == channel => Some(RelayFrame::Event {
            topic: envelope.topic,
            payload: envelope.payload,
        }),
        Ok(_) => None,
        Err(e) => {
            warn!("Ignoring malformed relay envelope: {}", e);
            None
        }
    }
}

#[async_trait]
impl BroadcastRelay for PgRelay {
    async fn subscribe(&self, channel: &str) -> PortResult<RelayStream> {
        let mut listener = PgListener::connect_with(&self.pool)
            .await
            .map_err(|e| PortError::ChannelClosed(e.to_string()))?;
        listener
            .listen(RELAY_CHANNEL)
            .await
            .map_err(|e| PortError::ChannelClosed(e.to_string()))?;
        debug!(channel, "Relay subscription open.");

        let channel = channel.to_string();
        let events = stream::unfold(Some(listener), move |listener| {
            let channel = channel.clone();
            async move {
                let mut listener = listener?;
                loop {
                    match listener.try_recv().await {
                        Ok(Some(notification)) => {
                            if let Some(frame) = frame_for(&channel, notification.payload()) {
                                return Some((frame, Some(listener)));
                            }
                        }
                        // The connection dropped; report it and end the stream.
                        Ok(None) => return Some((RelayFrame::Status(ChannelStatus::Closed), None)),
                        Err(e) => {
                            warn!("Relay listener failed: {}", e);
                            return Some((RelayFrame::Status(ChannelStatus::ChannelError), None));
                        }
                    }
                }
            }
        });

        let frames = stream::once(async { RelayFrame::Status(ChannelStatus::Subscribed) }).chain(events);
        Ok(Box::pin(frames))
    }

    async fn publish(&self, channel: &str, topic: &str, payload: serde_json::Value) -> PortResult<()> {
        let envelope = serde_json::to_string(&Envelope {
            channel: channel.to_string(),
            topic: topic.to_string(),
            payload,
        })
        .map_err(|e| PortError::Unexpected(e.to_string()))?;
        if envelope.len() > MAX_NOTIFY_BYTES {
            return Err(PortError::Unexpected(format!(
                "{} event is too large to relay ({} bytes)",
                topic,
                envelope.len()
            )));
        }

        sqlx::query("SELECT pg_notify($1, $2)")
            .bind(RELAY_CHANNEL)
            .bind(envelope)
            .execute(&self.pool)
            .await
            .map_err(|e| PortError::ChannelClosed(e.to_string()))?;
        Ok(())
    }

    async fn track_presence(&self, channel: &str, presence: &Presence) -> PortResult<()> {
        sqlx::query(
            "INSERT INTO presence (channel, member_id, name, status, streak, last_seen)
             VALUES ($1, $2, $3, $4, $5, $6)
             ON CONFLICT (channel, member_id) DO UPDATE SET
                name = EXCLUDED.name,
                status = EXCLUDED.status,
                streak = EXCLUDED.streak,
                last_seen = EXCLUDED.last_seen",
        )
        .bind(channel)
        .bind(presence.member_id)
        .bind(&presence.name)
        .bind(presence.status.as_str())
        .bind(presence.streak as i32)
        .bind(presence.last_seen)
        .execute(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(())
    }

    async fn untrack_presence(&self, channel: &str, member_id: Uuid) -> PortResult<()> {
        sqlx::query("DELETE FROM presence WHERE channel = $1 AND member_id = $2")
            .bind(channel)
            .bind(member_id)
            .execute(&self.pool)
            .await
            .map_err(port_error)?;
        Ok(())
    }

    async fn presence(&self, channel: &str) -> PortResult<Vec<Presence>> {
        let records = sqlx::query_as::<_, PresenceRecord>(
            "SELECT member_id, name, status, streak, last_seen
             FROM presence WHERE channel = $1 ORDER BY name",
        )
        .bind(channel)
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(records.into_iter().map(PresenceRecord::to_domain).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn envelopes_are_filtered_by_channel() {
        let raw = json!({
            "channel": "group-a",
            "topic": "timer-tick",
            "payload": {"seconds": 10, "timerState": "focus"}
        })
        .to_string();

        assert!(frame_for("group-b", &raw).is_none());
        match frame_for("group-a", &raw) {
            Some(RelayFrame::Event { topic, payload }) => {
                assert_eq!(topic, "timer-tick");
                assert_eq!(payload["seconds"], 10);
            }
            other => panic!("unexpected frame: {:?}", other),
        }
    }

    #[test]
    fn garbage_envelopes_are_dropped() {
        assert!(frame_for("group-a", "not json").is_none());
    }
}
