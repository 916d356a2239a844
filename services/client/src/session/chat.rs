//! services/client/src/session/chat.rs
//!
//! Outbound chat. A message is shown locally first, broadcast, then persisted under the
//! id it was created with, so every delivery path converges on one dedup key.

use crate::error::{SessionError, SessionResult};
use crate::session::client::{not_in_group, StudyClient};
use chrono::Utc;
use study_sync_core::domain::{ChatMessage, Group, Member, NewMessage, SYSTEM_AUTHOR_NAME};
use study_sync_core::events::{group_channel, BroadcastEvent, NewMessagePayload};
use study_sync_core::ports::{PortError, PortResult};
use study_sync_core::reconciler::Source;
use tracing::{debug, warn};
use uuid::Uuid;

impl StudyClient {
    /// Sends a chat message. A failed write is reported, but the local copy stays
    /// visible until the session is reloaded.
    pub async fn send_message(&self, text: &str) -> SessionResult<()> {
        let text = text.trim();
        if text.is_empty() {
            return Err(SessionError::Validation("Message is empty".to_string()));
        }

        let (message, channel) = {
            let mut state = self.state.lock().await;
            let active = state.active.as_mut().ok_or_else(not_in_group)?;
            let message = ChatMessage {
                id: Uuid::new_v4(),
                author_id: active.me.id,
                author_name: active.me.display_name.clone(),
                group_id: active.group.id,
                text: text.to_string(),
                is_system: false,
                created_at: Utc::now(),
            };
            active.messages.ingest(message.clone(), Source::Local);
            let channel = group_channel(active.group.id);
            self.publish(&state);
            (message, channel)
        };

        self.deliver(&channel, &message).await?;
        if let Err(e) = self.store.touch_group(message.group_id, message.created_at).await {
            warn!("Could not record activity on group {}: {}", message.group_id, e);
        }
        Ok(())
    }

    /// Posts a system message into the active session. Failures are logged only.
    pub(crate) async fn post_system_message(&self, session_id: Uuid, id: Uuid, text: String) {
        let (message, channel) = {
            let mut state = self.state.lock().await;
            let Some(active) = state.session_mut(session_id) else {
                return;
            };
            let message = self.system_message_for(&active.group, &active.me, id, text);
            active.messages.ingest(message.clone(), Source::Local);
            let channel = group_channel(active.group.id);
            self.publish(&state);
            (message, channel)
        };
        if let Err(e) = self.deliver(&channel, &message).await {
            warn!("Could not store system message {}: {}", message.id, e);
        }
    }

    pub(crate) fn system_message_for(
        &self,
        group: &Group,
        author: &Member,
        id: Uuid,
        text: String,
    ) -> ChatMessage {
        ChatMessage {
            id,
            author_id: author.id,
            author_name: SYSTEM_AUTHOR_NAME.to_string(),
            group_id: group.id,
            text,
            is_system: true,
            created_at: Utc::now(),
        }
    }

    /// Broadcasts then persists. An id that is already stored counts as delivered,
    /// which is how concurrently announced notices collapse.
    pub(crate) async fn deliver(&self, channel: &str, message: &ChatMessage) -> PortResult<()> {
        let event = BroadcastEvent::NewMessage(NewMessagePayload::from_message(message));
        if let Err(e) = self.relay.publish(channel, event.topic(), event.payload()).await {
            debug!("Broadcast of message {} skipped: {}", message.id, e);
        }

        let row = NewMessage {
            id: message.id,
            author_id: message.author_id,
            author_name: message.author_name.clone(),
            group_id: message.group_id,
            text: message.text.clone(),
            is_system: message.is_system,
            created_at: message.created_at,
        };
        match self.store.insert_message(row).await {
            Ok(_) => Ok(()),
            Err(PortError::Conflict(_)) => {
                debug!("Message {} was already stored.", message.id);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }
}
