//! services/client/src/adapters/memory.rs
//!
//! In-process implementations of the store, relay and auth ports. Several clients
//! can share one `InMemoryStore` and one `RelayHub` to simulate a group without a
//! database; each client gets its own relay handle so connectivity can be cut per
//! participant.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use study_sync_core::domain::{
    ChatMessage, Exam, Group, Identity, Member, MemberPatch, MemberStatus, NewExam, NewGroup,
    NewMember, NewMessage, Presence,
};
use study_sync_core::ports::{
    AuthService, AuthStateStream, BroadcastRelay, ChangeEvent, ChangeStream, ChannelStatus,
    PortError, PortResult, RecordStore, RelayFrame, RelayStream,
};
use tokio::sync::{broadcast, mpsc, watch, Mutex};
use tracing::{debug, info};
use uuid::Uuid;

const CHANGE_FEED_CAPACITY: usize = 256;

//=========================================================================================
// Record Store
//=========================================================================================

#[derive(Default)]
struct Tables {
    groups: HashMap<Uuid, Group>,
    members: HashMap<Uuid, Member>,
    messages: HashMap<Uuid, ChatMessage>,
    exams: HashMap<Uuid, Exam>,
}

/// A `RecordStore` backed by hash maps, with a change feed shaped like the database's.
pub struct InMemoryStore {
    tables: Mutex<Tables>,
    changes: broadcast::Sender<ChangeEvent>,
    fail_writes: AtomicBool,
    fail_member_inserts: AtomicBool,
    changes_muted: AtomicBool,
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_FEED_CAPACITY);
        Self {
            tables: Mutex::new(Tables::default()),
            changes,
            fail_writes: AtomicBool::new(false),
            fail_member_inserts: AtomicBool::new(false),
            changes_muted: AtomicBool::new(false),
        }
    }

    /// Makes every write fail with `PortError::Unexpected` until switched back.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Makes only `create_member` fail, leaving every other write working.
    pub fn set_fail_member_inserts(&self, fail: bool) {
        self.fail_member_inserts.store(fail, Ordering::SeqCst);
    }

    /// Drops change notifications while set, like a notification feed that went quiet.
    pub fn set_changes_muted(&self, muted: bool) {
        self.changes_muted.store(muted, Ordering::SeqCst);
    }

    /// Moves a member's heartbeat into the past.
    pub async fn backdate_member(&self, member_id: Uuid, at: DateTime<Utc>) {
        if let Some(member) = self.tables.lock().await.members.get_mut(&member_id) {
            member.updated_at = at;
        }
    }

    /// Moves a group's heartbeat into the past.
    pub async fn backdate_group(&self, group_id: Uuid, at: DateTime<Utc>) {
        if let Some(group) = self.tables.lock().await.groups.get_mut(&group_id) {
            group.updated_at = at;
        }
    }

    /// Row counts as `(groups, members, messages, exams)`.
    pub async fn counts(&self) -> (usize, usize, usize, usize) {
        let tables = self.tables.lock().await;
        (
            tables.groups.len(),
            tables.members.len(),
            tables.messages.len(),
            tables.exams.len(),
        )
    }

    fn writable(&self) -> PortResult<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("store is rejecting writes".to_string()));
        }
        Ok(())
    }

    fn emit(&self, change: ChangeEvent) {
        if self.changes_muted.load(Ordering::SeqCst) {
            return;
        }
        // Nobody listening is fine.
        let _ = self.changes.send(change);
    }
}

fn change_group(change: &ChangeEvent) -> Uuid {
    match change {
        ChangeEvent::MessageInserted(message) => message.group_id,
        ChangeEvent::MemberInserted(member) | ChangeEvent::MemberUpdated(member) => member.group_id,
        ChangeEvent::MemberDeleted { group_id, .. } => *group_id,
        ChangeEvent::GroupDeleted { id } => *id,
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn create_group(&self, group: NewGroup) -> PortResult<Group> {
        self.writable()?;
        let mut tables = self.tables.lock().await;
        if tables.groups.values().any(|g| g.code == group.code) {
            return Err(PortError::Conflict(format!("group code {}", group.code)));
        }
        let now = Utc::now();
        let group = Group {
            id: Uuid::new_v4(),
            code: group.code,
            name: group.name,
            topic: group.topic,
            creator_id: group.creator_id,
            is_public: group.is_public,
            created_at: now,
            updated_at: now,
        };
        tables.groups.insert(group.id, group.clone());
        Ok(group)
    }

    async fn get_group(&self, group_id: Uuid) -> PortResult<Option<Group>> {
        Ok(self.tables.lock().await.groups.get(&group_id).cloned())
    }

    async fn find_group_by_code(&self, code: &str) -> PortResult<Option<Group>> {
        let tables = self.tables.lock().await;
        Ok(tables.groups.values().find(|g| g.code == code).cloned())
    }

    async fn list_public_groups(&self) -> PortResult<Vec<Group>> {
        let tables = self.tables.lock().await;
        let mut groups: Vec<Group> = tables.groups.values().filter(|g| g.is_public).cloned().collect();
        groups.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(groups)
    }

    async fn list_groups_inactive_since(&self, cutoff: DateTime<Utc>) -> PortResult<Vec<Group>> {
        let tables = self.tables.lock().await;
        Ok(tables.groups.values().filter(|g| g.updated_at < cutoff).cloned().collect())
    }

    async fn touch_group(&self, group_id: Uuid, at: DateTime<Utc>) -> PortResult<()> {
        self.writable()?;
        match self.tables.lock().await.groups.get_mut(&group_id) {
            Some(group) => {
                group.updated_at = at;
                Ok(())
            }
            None => Err(PortError::NotFound(format!("group {}", group_id))),
        }
    }

    async fn delete_group(&self, group_id: Uuid) -> PortResult<bool> {
        self.writable()?;
        let removed = self.tables.lock().await.groups.remove(&group_id).is_some();
        if removed {
            self.emit(ChangeEvent::GroupDeleted { id: group_id });
        }
        Ok(removed)
    }

    async fn create_member(&self, member: NewMember) -> PortResult<Member> {
        self.writable()?;
        if self.fail_member_inserts.load(Ordering::SeqCst) {
            return Err(PortError::Unexpected("member insert rejected".to_string()));
        }
        let now = Utc::now();
        let member = Member {
            id: Uuid::new_v4(),
            auth_identity: member.auth_identity,
            display_name: member.display_name,
            group_id: member.group_id,
            status: MemberStatus::Online,
            streak: 0,
            sessions_today: 0,
            created_at: now,
            updated_at: now,
        };
        self.tables.lock().await.members.insert(member.id, member.clone());
        self.emit(ChangeEvent::MemberInserted(member.clone()));
        Ok(member)
    }

    async fn get_member(&self, member_id: Uuid) -> PortResult<Option<Member>> {
        Ok(self.tables.lock().await.members.get(&member_id).cloned())
    }

    async fn list_members(&self, group_id: Uuid) -> PortResult<Vec<Member>> {
        let tables = self.tables.lock().await;
        let mut members: Vec<Member> = tables
            .members
            .values()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect();
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        Ok(members)
    }

    async fn list_members_inactive_since(
        &self,
        group_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> PortResult<Vec<Member>> {
        let tables = self.tables.lock().await;
        Ok(tables
            .members
            .values()
            .filter(|m| m.group_id == group_id && m.updated_at < cutoff)
            .cloned()
            .collect())
    }

    async fn display_names_for(&self, identities: &[Uuid]) -> PortResult<Vec<(Uuid, String)>> {
        let tables = self.tables.lock().await;
        let mut members: Vec<&Member> = tables.members.values().collect();
        members.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let mut seen = HashSet::new();
        Ok(members
            .into_iter()
            .filter(|m| identities.contains(&m.auth_identity) && seen.insert(m.auth_identity))
            .map(|m| (m.auth_identity, m.display_name.clone()))
            .collect())
    }

    async fn update_member(&self, member_id: Uuid, patch: MemberPatch) -> PortResult<()> {
        self.writable()?;
        let updated = {
            let mut tables = self.tables.lock().await;
            let member = tables
                .members
                .get_mut(&member_id)
                .ok_or_else(|| PortError::NotFound(format!("member {}", member_id)))?;
            if let Some(status) = patch.status {
                member.status = status;
            }
            if let Some(streak) = patch.streak {
                member.streak = streak;
            }
            if let Some(sessions) = patch.sessions_today {
                member.sessions_today = sessions;
            }
            member.updated_at = patch.updated_at.unwrap_or_else(Utc::now);
            member.clone()
        };
        self.emit(ChangeEvent::MemberUpdated(updated));
        Ok(())
    }

    async fn delete_member(&self, member_id: Uuid) -> PortResult<bool> {
        self.writable()?;
        let removed = self.tables.lock().await.members.remove(&member_id);
        match removed {
            Some(member) => {
                self.emit(ChangeEvent::MemberDeleted {
                    id: member.id,
                    group_id: member.group_id,
                    display_name: member.display_name,
                });
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_members_in_group(&self, group_id: Uuid) -> PortResult<u64> {
        self.writable()?;
        let removed: Vec<Member> = {
            let mut tables = self.tables.lock().await;
            let ids: Vec<Uuid> = tables
                .members
                .values()
                .filter(|m| m.group_id == group_id)
                .map(|m| m.id)
                .collect();
            ids.iter().filter_map(|id| tables.members.remove(id)).collect()
        };
        for member in &removed {
            self.emit(ChangeEvent::MemberDeleted {
                id: member.id,
                group_id,
                display_name: member.display_name.clone(),
            });
        }
        Ok(removed.len() as u64)
    }

    async fn insert_message(&self, message: NewMessage) -> PortResult<ChatMessage> {
        self.writable()?;
        let stored = {
            let mut tables = self.tables.lock().await;
            if tables.messages.contains_key(&message.id) {
                return Err(PortError::Conflict(format!("message {}", message.id)));
            }
            let stored = ChatMessage {
                id: message.id,
                author_id: message.author_id,
                author_name: message.author_name,
                group_id: message.group_id,
                text: message.text,
                is_system: message.is_system,
                created_at: message.created_at,
            };
            tables.messages.insert(stored.id, stored.clone());
            stored
        };
        self.emit(ChangeEvent::MessageInserted(stored.clone()));
        Ok(stored)
    }

    async fn list_messages(&self, group_id: Uuid, limit: usize) -> PortResult<Vec<ChatMessage>> {
        let tables = self.tables.lock().await;
        let mut messages: Vec<ChatMessage> = tables
            .messages
            .values()
            .filter(|m| m.group_id == group_id)
            .cloned()
            .collect();
        messages.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let skip = messages.len().saturating_sub(limit);
        Ok(messages.into_iter().skip(skip).collect())
    }

    async fn delete_messages_in_group(&self, group_id: Uuid) -> PortResult<u64> {
        self.writable()?;
        let mut tables = self.tables.lock().await;
        let before = tables.messages.len();
        tables.messages.retain(|_, m| m.group_id != group_id);
        Ok((before - tables.messages.len()) as u64)
    }

    async fn insert_exam(&self, exam: NewExam) -> PortResult<Exam> {
        self.writable()?;
        let exam = Exam {
            id: Uuid::new_v4(),
            owner_id: exam.owner_id,
            group_id: exam.group_id,
            name: exam.name,
            date: exam.date,
            created_at: Utc::now(),
        };
        self.tables.lock().await.exams.insert(exam.id, exam.clone());
        Ok(exam)
    }

    async fn update_exam(&self, exam_id: Uuid, name: &str, date: NaiveDate) -> PortResult<()> {
        self.writable()?;
        let mut tables = self.tables.lock().await;
        let exam = tables
            .exams
            .get_mut(&exam_id)
            .ok_or_else(|| PortError::NotFound(format!("exam {}", exam_id)))?;
        exam.name = name.to_string();
        exam.date = date;
        Ok(())
    }

    async fn delete_exam(&self, exam_id: Uuid) -> PortResult<bool> {
        self.writable()?;
        Ok(self.tables.lock().await.exams.remove(&exam_id).is_some())
    }

    async fn list_exams(&self, group_id: Uuid) -> PortResult<Vec<Exam>> {
        let tables = self.tables.lock().await;
        let mut exams: Vec<Exam> = tables
            .exams
            .values()
            .filter(|e| e.group_id == group_id)
            .cloned()
            .collect();
        exams.sort_by(|a, b| a.date.cmp(&b.date).then(a.created_at.cmp(&b.created_at)));
        Ok(exams)
    }

    async fn delete_exams_in_group(&self, group_id: Uuid) -> PortResult<u64> {
        self.writable()?;
        let mut tables = self.tables.lock().await;
        let before = tables.exams.len();
        tables.exams.retain(|_, e| e.group_id != group_id);
        Ok((before - tables.exams.len()) as u64)
    }

    async fn subscribe_changes(&self, group_id: Uuid) -> PortResult<ChangeStream> {
        let rx = self.changes.subscribe();
        let feed = stream::unfold(rx, move |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(change) if change_group(&change) == group_id => return Some((change, rx)),
                    Ok(_) => continue,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Change feed lagged.");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(Box::pin(feed))
    }
}

//=========================================================================================
// Broadcast Relay
//=========================================================================================

struct Subscriber {
    client: u64,
    tx: mpsc::UnboundedSender<RelayFrame>,
}

#[derive(Default)]
struct HubState {
    channels: HashMap<String, Vec<Subscriber>>,
    presence: HashMap<String, HashMap<Uuid, Presence>>,
    offline: HashSet<u64>,
}

/// The shared bus. Hand each participant its own handle with `client()`.
#[derive(Clone, Default)]
pub struct RelayHub {
    state: Arc<Mutex<HubState>>,
    next_client: Arc<AtomicU64>,
}

impl RelayHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn client(&self) -> InMemoryRelay {
        InMemoryRelay {
            hub: self.clone(),
            client: self.next_client.fetch_add(1, Ordering::SeqCst),
        }
    }

    /// Number of live subscriptions on a channel.
    pub async fn subscriber_count(&self, channel: &str) -> usize {
        let state = self.state.lock().await;
        state
            .channels
            .get(channel)
            .map(|subs| subs.iter().filter(|s| !s.tx.is_closed()).count())
            .unwrap_or(0)
    }
}

/// One participant's connection to a `RelayHub`. Every subscriber receives every
/// publish on its channel, the publisher included.
#[derive(Clone)]
pub struct InMemoryRelay {
    hub: RelayHub,
    client: u64,
}

impl InMemoryRelay {
    /// Simulates losing or regaining the network. Going offline closes this handle's
    /// subscriptions and rejects its calls until it comes back.
    pub async fn set_online(&self, online: bool) {
        let mut state = self.hub.state.lock().await;
        if online {
            state.offline.remove(&self.client);
            info!(client = self.client, "Relay handle back online.");
            return;
        }
        state.offline.insert(self.client);
        for subscribers in state.channels.values_mut() {
            subscribers.retain(|s| {
                if s.client != self.client {
                    return true;
                }
                let _ = s.tx.send(RelayFrame::Status(ChannelStatus::Closed));
                false
            });
        }
        info!(client = self.client, "Relay handle offline.");
    }

    fn online(&self, state: &HubState) -> PortResult<()> {
        if state.offline.contains(&self.client) {
            return Err(PortError::ChannelClosed("relay unreachable".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl BroadcastRelay for InMemoryRelay {
    async fn subscribe(&self, channel: &str) -> PortResult<RelayStream> {
        let mut state = self.hub.state.lock().await;
        self.online(&state)?;
        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(RelayFrame::Status(ChannelStatus::Subscribed));
        state
            .channels
            .entry(channel.to_string())
            .or_default()
            .push(Subscriber { client: self.client, tx });

        let frames = stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|frame| (frame, rx)) });
        Ok(Box::pin(frames))
    }

    async fn publish(&self, channel: &str, topic: &str, payload: serde_json::Value) -> PortResult<()> {
        let mut state = self.hub.state.lock().await;
        self.online(&state)?;
        if let Some(subscribers) = state.channels.get_mut(channel) {
            subscribers.retain(|s| {
                s.tx.send(RelayFrame::Event {
                    topic: topic.to_string(),
                    payload: payload.clone(),
                })
                .is_ok()
            });
        }
        Ok(())
    }

    async fn track_presence(&self, channel: &str, presence: &Presence) -> PortResult<()> {
        let mut state = self.hub.state.lock().await;
        self.online(&state)?;
        state
            .presence
            .entry(channel.to_string())
            .or_default()
            .insert(presence.member_id, presence.clone());
        Ok(())
    }

    async fn untrack_presence(&self, channel: &str, member_id: Uuid) -> PortResult<()> {
        let mut state = self.hub.state.lock().await;
        if let Some(entries) = state.presence.get_mut(channel) {
            entries.remove(&member_id);
        }
        Ok(())
    }

    async fn presence(&self, channel: &str) -> PortResult<Vec<Presence>> {
        let state = self.hub.state.lock().await;
        self.online(&state)?;
        let mut entries: Vec<Presence> = state
            .presence
            .get(channel)
            .map(|entries| entries.values().cloned().collect())
            .unwrap_or_default();
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }
}

//=========================================================================================
// Auth
//=========================================================================================

struct Account {
    identity: Identity,
    password: String,
}

/// Accounts kept in memory. Passwords are compared as given.
pub struct MemoryAuth {
    accounts: Mutex<HashMap<String, Account>>,
    current: watch::Sender<Option<Identity>>,
}

impl Default for MemoryAuth {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryAuth {
    pub fn new() -> Self {
        let (current, _) = watch::channel(None);
        Self {
            accounts: Mutex::new(HashMap::new()),
            current,
        }
    }

    /// Starts already signed in as a fresh identity.
    pub fn signed_in() -> Self {
        let auth = Self::new();
        auth.current.send_replace(Some(Identity {
            id: Uuid::new_v4(),
            email: None,
        }));
        auth
    }

    /// Starts signed in as the given identity.
    pub fn signed_in_as(identity: Identity) -> Self {
        let auth = Self::new();
        auth.current.send_replace(Some(identity));
        auth
    }
}

#[async_trait]
impl AuthService for MemoryAuth {
    async fn sign_up(&self, email: &str, password: &str) -> PortResult<Identity> {
        let mut accounts = self.accounts.lock().await;
        if accounts.contains_key(email) {
            return Err(PortError::Conflict(format!("account {}", email)));
        }
        let identity = Identity {
            id: Uuid::new_v4(),
            email: Some(email.to_string()),
        };
        accounts.insert(
            email.to_string(),
            Account {
                identity: identity.clone(),
                password: password.to_string(),
            },
        );
        self.current.send_replace(Some(identity.clone()));
        Ok(identity)
    }

    async fn sign_in(&self, email: &str, password: &str) -> PortResult<Identity> {
        let accounts = self.accounts.lock().await;
        match accounts.get(email) {
            Some(account) if account.password == password => {
                self.current.send_replace(Some(account.identity.clone()));
                Ok(account.identity.clone())
            }
            _ => Err(PortError::Unauthorized),
        }
    }

    async fn sign_out(&self) -> PortResult<()> {
        self.current.send_replace(None);
        Ok(())
    }

    async fn reset_password(&self, email: &str) -> PortResult<()> {
        if !self.accounts.lock().await.contains_key(email) {
            return Err(PortError::NotFound(format!("account {}", email)));
        }
        info!(email, "Password reset requested.");
        Ok(())
    }

    async fn current_user(&self) -> PortResult<Option<Identity>> {
        Ok(self.current.borrow().clone())
    }

    fn on_auth_state_change(&self) -> AuthStateStream {
        let rx = self.current.subscribe();
        Box::pin(stream::unfold(rx, |mut rx| async move {
            rx.changed().await.ok()?;
            let identity = rx.borrow_and_update().clone();
            Some((identity, rx))
        }))
    }
}
