//! crates/study_sync_core/src/reconciler.rs
//!
//! Merges chat messages arriving from the broadcast relay, the store's change feed,
//! fallback polling and local optimistic sends into one deduplicated list ordered by
//! `created_at`. The message id is the only ordering anchor shared by the channels.

use crate::domain::ChatMessage;
use chrono::Duration;
use serde::Serialize;
use std::collections::HashSet;
use uuid::Uuid;

/// How far apart a placeholder and its stored copy may be stamped and still be merged.
pub fn placeholder_window() -> Duration {
    Duration::seconds(10)
}

/// Where a message was observed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    /// Optimistic copy of something this client just sent.
    Local,
    Broadcast,
    StoreChange,
    Poll,
}

impl Source {
    fn confirms(&self) -> bool {
        matches!(self, Source::StoreChange | Source::Poll)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatEntry {
    #[serde(flatten)]
    pub message: ChatMessage,
    /// A local send that the store has not echoed back yet.
    pub pending: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ingest {
    /// A new entry; `notify` is set at most once per message id.
    Inserted { notify: bool },
    /// A pending placeholder was replaced in place.
    Resolved,
    Duplicate,
}

#[derive(Debug)]
pub struct MessageLog {
    entries: Vec<ChatEntry>,
    seen: HashSet<Uuid>,
    notified: HashSet<Uuid>,
    local_author: Option<(Uuid, String)>,
    limit: usize,
}

impl MessageLog {
    pub fn new(limit: usize) -> Self {
        Self {
            entries: Vec::new(),
            seen: HashSet::new(),
            notified: HashSet::new(),
            local_author: None,
            limit,
        }
    }

    /// The member whose own messages never trigger a notification.
    pub fn set_local_author(&mut self, member_id: Uuid, display_name: &str) {
        self.local_author = Some((member_id, display_name.to_string()));
    }

    pub fn entries(&self) -> &[ChatEntry] {
        &self.entries
    }

    pub fn contains(&self, id: Uuid) -> bool {
        self.seen.contains(&id)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.seen.clear();
        self.notified.clear();
        self.local_author = None;
    }

    pub fn ingest(&mut self, message: ChatMessage, source: Source) -> Ingest {
        if self.seen.contains(&message.id) {
            if source.confirms() {
                if let Some(entry) = self.entries.iter_mut().find(|e| e.message.id == message.id) {
                    entry.pending = false;
                }
            }
            return Ingest::Duplicate;
        }

        if source != Source::Local {
            if let Some(index) = self.find_placeholder(&message) {
                self.seen.insert(message.id);
                // The placeholder may already have been notified under its own id.
                let placeholder_id = self.entries[index].message.id;
                if self.notified.contains(&placeholder_id) {
                    self.notified.insert(message.id);
                }
                let entry = &mut self.entries[index];
                entry.message = message;
                entry.pending = !source.confirms();
                return Ingest::Resolved;
            }
        }

        let notify = source != Source::Local
            && !message.is_system
            && !self.is_local_author(&message)
            && self.notified.insert(message.id);
        self.seen.insert(message.id);
        let position = self
            .entries
            .partition_point(|e| e.message.created_at <= message.created_at);
        self.entries.insert(
            position,
            ChatEntry {
                message,
                pending: source == Source::Local,
            },
        );
        self.enforce_limit();
        Ingest::Inserted { notify }
    }

    /// Re-applies a full fetch of the group's history through the same dedup rules.
    /// Returns how many entries should raise a notification.
    pub fn resync<I>(&mut self, messages: I, source: Source) -> usize
    where
        I: IntoIterator<Item = ChatMessage>,
    {
        messages
            .into_iter()
            .filter(|m| matches!(self.ingest(m.clone(), source), Ingest::Inserted { notify: true }))
            .count()
    }

    fn is_local_author(&self, message: &ChatMessage) -> bool {
        match &self.local_author {
            Some((id, name)) => message.author_id == *id || message.author_name == *name,
            None => false,
        }
    }

    fn find_placeholder(&self, message: &ChatMessage) -> Option<usize> {
        let window = placeholder_window();
        self.entries.iter().position(|e| {
            e.pending
                && e.message.author_name == message.author_name
                && e.message.text == message.text
                && e.message.is_system == message.is_system
                && (e.message.created_at - message.created_at).abs() <= window
        })
    }

    fn enforce_limit(&mut self) {
        if self.entries.len() > self.limit {
            let excess = self.entries.len() - self.limit;
            self.entries.drain(..excess);
        }
    }
}
