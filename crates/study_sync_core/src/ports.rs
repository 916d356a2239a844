//! crates/study_sync_core/src/ports.rs
//!
//! Defines the service contracts (traits) for the collaborators the session core talks to.
//! These traits form the boundary of the hexagonal architecture: the shared record store,
//! the broadcast relay, the auth provider and the side-effect sink are all injected, so the
//! synchronization logic never depends on a concrete backend.

use crate::domain::{
    ChatMessage, Exam, Group, Identity, Member, MemberPatch, NewExam, NewGroup, NewMember,
    NewMessage, Presence,
};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::Stream;
use std::pin::Pin;
use uuid::Uuid;

//=========================================================================================
// Generic Port Error and Result Types
//=========================================================================================

/// A generic error type for all port operations.
/// This abstracts away the specific errors from external services (e.g., database, network).
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PortError {
    #[error("Item not found: {0}")]
    NotFound(String),
    #[error("Conflicting record: {0}")]
    Conflict(String),
    #[error("Unauthorized")]
    Unauthorized,
    #[error("Channel closed: {0}")]
    ChannelClosed(String),
    #[error("An unexpected error occurred: {0}")]
    Unexpected(String),
}

/// A convenience type alias for `Result<T, PortError>`.
pub type PortResult<T> = Result<T, PortError>;

//=========================================================================================
// Record Store
//=========================================================================================

/// A row-level change observed on the store's notification feed for one group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChangeEvent {
    MessageInserted(ChatMessage),
    MemberInserted(Member),
    MemberUpdated(Member),
    MemberDeleted {
        id: Uuid,
        group_id: Uuid,
        display_name: String,
    },
    GroupDeleted {
        id: Uuid,
    },
}

pub type ChangeStream = Pin<Box<dyn Stream<Item = ChangeEvent> + Send>>;

/// The shared durable store. Every write is a single-row (or single-filter) operation;
/// nothing here is transactional across calls.
#[async_trait]
pub trait RecordStore: Send + Sync {
    // --- Groups ---
    async fn create_group(&self, group: NewGroup) -> PortResult<Group>;

    async fn get_group(&self, group_id: Uuid) -> PortResult<Option<Group>>;

    /// Exact match on an already upper-cased code.
    async fn find_group_by_code(&self, code: &str) -> PortResult<Option<Group>>;

    /// Public groups, newest first.
    async fn list_public_groups(&self) -> PortResult<Vec<Group>>;

    async fn list_groups_inactive_since(&self, cutoff: DateTime<Utc>) -> PortResult<Vec<Group>>;

    async fn touch_group(&self, group_id: Uuid, at: DateTime<Utc>) -> PortResult<()>;

    /// Returns `false` when the row was already gone.
    async fn delete_group(&self, group_id: Uuid) -> PortResult<bool>;

    // --- Members ---
    async fn create_member(&self, member: NewMember) -> PortResult<Member>;

    async fn get_member(&self, member_id: Uuid) -> PortResult<Option<Member>>;

    /// All members of a group, oldest first.
    async fn list_members(&self, group_id: Uuid) -> PortResult<Vec<Member>>;

    async fn list_members_inactive_since(
        &self,
        group_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> PortResult<Vec<Member>>;

    /// Any display name registered for each of the given auth identities.
    async fn display_names_for(&self, identities: &[Uuid]) -> PortResult<Vec<(Uuid, String)>>;

    async fn update_member(&self, member_id: Uuid, patch: MemberPatch) -> PortResult<()>;

    /// Returns `false` when the row was already gone.
    async fn delete_member(&self, member_id: Uuid) -> PortResult<bool>;

    async fn delete_members_in_group(&self, group_id: Uuid) -> PortResult<u64>;

    // --- Messages ---
    /// Fails with `PortError::Conflict` when a message with the same id already exists.
    async fn insert_message(&self, message: NewMessage) -> PortResult<ChatMessage>;

    /// The most recent `limit` messages of a group, in ascending `created_at` order.
    async fn list_messages(&self, group_id: Uuid, limit: usize) -> PortResult<Vec<ChatMessage>>;

    async fn delete_messages_in_group(&self, group_id: Uuid) -> PortResult<u64>;

    // --- Exams ---
    async fn insert_exam(&self, exam: NewExam) -> PortResult<Exam>;

    async fn update_exam(&self, exam_id: Uuid, name: &str, date: NaiveDate) -> PortResult<()>;

    async fn delete_exam(&self, exam_id: Uuid) -> PortResult<bool>;

    /// Exams of a group ordered by date.
    async fn list_exams(&self, group_id: Uuid) -> PortResult<Vec<Exam>>;

    async fn delete_exams_in_group(&self, group_id: Uuid) -> PortResult<u64>;

    // --- Change Feed ---
    /// Row changes for one group's messages and members, plus deletion of the group itself.
    async fn subscribe_changes(&self, group_id: Uuid) -> PortResult<ChangeStream>;
}

//=========================================================================================
// Broadcast Relay
//=========================================================================================

/// Subscription lifecycle as reported by the relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

/// One item of a relay subscription: either a lifecycle change or a raw event.
/// Payloads stay untyped here and are validated by `events::BroadcastEvent::from_frame`.
#[derive(Debug, Clone, PartialEq)]
pub enum RelayFrame {
    Status(ChannelStatus),
    Event {
        topic: String,
        payload: serde_json::Value,
    },
}

pub type RelayStream = Pin<Box<dyn Stream<Item = RelayFrame> + Send>>;

/// A named-channel publish/subscribe bus with presence. Delivery is at-least-once and
/// unordered; the publisher may or may not receive its own events. Dropping the stream
/// returned by `subscribe` tears the subscription down.
#[async_trait]
pub trait BroadcastRelay: Send + Sync {
    async fn subscribe(&self, channel: &str) -> PortResult<RelayStream>;

    async fn publish(
        &self,
        channel: &str,
        topic: &str,
        payload: serde_json::Value,
    ) -> PortResult<()>;

    async fn track_presence(&self, channel: &str, presence: &Presence) -> PortResult<()>;

    async fn untrack_presence(&self, channel: &str, member_id: Uuid) -> PortResult<()>;

    async fn presence(&self, channel: &str) -> PortResult<Vec<Presence>>;
}

//=========================================================================================
// Auth
//=========================================================================================

pub type AuthStateStream = Pin<Box<dyn Stream<Item = Option<Identity>> + Send>>;

/// Opaque credential operations. The core only ever looks at the returned identity.
#[async_trait]
pub trait AuthService: Send + Sync {
    async fn sign_up(&self, email: &str, password: &str) -> PortResult<Identity>;

    async fn sign_in(&self, email: &str, password: &str) -> PortResult<Identity>;

    async fn sign_out(&self) -> PortResult<()>;

    async fn reset_password(&self, email: &str) -> PortResult<()>;

    async fn current_user(&self) -> PortResult<Option<Identity>>;

    fn on_auth_state_change(&self) -> AuthStateStream;
}

//=========================================================================================
// Side Effects
//=========================================================================================

/// Audio/notification sink owned by a session. Calls must not block.
pub trait SessionCues: Send + Sync {
    fn play_start(&self);
    fn play_tick(&self);
    fn play_notification(&self);
    fn play_complete(&self);
    fn play_break(&self, long: bool);
    fn stop(&self);
}
