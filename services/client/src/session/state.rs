//! services/client/src/session/state.rs
//!
//! The mutable state owned by one `StudyClient` and the read-only views derived from it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Instant;
use study_sync_core::connectivity::{ConnectionState, ConnectivityController};
use study_sync_core::domain::{Exam, Group, Identity, Member, TimerSettings, TimerState};
use study_sync_core::membership::{leaderboard, visible_roster, LeaderboardEntry};
use study_sync_core::reconciler::{ChatEntry, MessageLog};
use study_sync_core::timer::{TimerMachine, TimerRole};
use uuid::Uuid;

//=========================================================================================
// SessionState
//=========================================================================================

/// Everything tied to membership of one group. Dropped as a whole on leave, removal,
/// group deletion or switching groups.
pub struct ActiveSession {
    /// Fresh per entry so late results from a previous session can be recognised.
    pub session_id: Uuid,
    pub group: Group,
    pub me: Member,
    /// Every member row of the group as last seen, including our own.
    pub members: Vec<Member>,
    pub exams: Vec<Exam>,
    pub messages: MessageLog,
    pub timer: TimerMachine,
    pub connectivity: ConnectivityController,
}

impl ActiveSession {
    pub fn is_creator(&self) -> bool {
        self.group.creator_id == self.me.auth_identity
    }

    pub fn upsert_member(&mut self, member: Member) {
        match self.members.iter_mut().find(|m| m.id == member.id) {
            Some(existing) => *existing = member,
            None => self.members.push(member),
        }
    }

    pub fn remove_member(&mut self, member_id: Uuid) -> Option<Member> {
        let index = self.members.iter().position(|m| m.id == member_id)?;
        Some(self.members.remove(index))
    }

    pub fn sort_exams(&mut self) {
        self.exams.sort_by(|a, b| a.date.cmp(&b.date).then(a.created_at.cmp(&b.created_at)));
    }
}

/// A join in progress: the code resolved to a group but no member row is attached yet.
#[derive(Debug, Clone)]
pub struct PendingJoin {
    pub group: Group,
    pub suggested_name: Option<String>,
    /// Set when the chosen name matches a row this identity already owns.
    pub awaiting_confirmation: Option<Member>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublicGroup {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub topic: String,
    pub creator_name: String,
    pub created_at: DateTime<Utc>,
}

pub struct SessionState {
    pub identity: Option<Identity>,
    pub sync_enabled: bool,
    pub active: Option<ActiveSession>,
    pub pending_join: Option<PendingJoin>,
    pub public_groups: Vec<PublicGroup>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            identity: None,
            sync_enabled: true,
            active: None,
            pending_join: None,
            public_groups: Vec::new(),
        }
    }
}

impl SessionState {
    /// The active session, but only if it is still the one identified by `session_id`.
    pub fn session_mut(&mut self, session_id: Uuid) -> Option<&mut ActiveSession> {
        self.active.as_mut().filter(|a| a.session_id == session_id)
    }

    pub fn snapshot(&self, now: Instant, wall_clock: DateTime<Utc>) -> SessionSnapshot {
        let group = self.active.as_ref().map(|active| {
            let roster = visible_roster(&active.members, &active.me, wall_clock);
            GroupView {
                id: active.group.id,
                code: active.group.code.clone(),
                name: active.group.name.clone(),
                topic: active.group.topic.clone(),
                is_public: active.group.is_public,
                is_creator: active.is_creator(),
                me: active.me.clone(),
                leaderboard: leaderboard(&active.me, &roster),
                roster,
                messages: active.messages.entries().to_vec(),
                exams: active.exams.clone(),
                timer: TimerView {
                    state: active.timer.state(),
                    seconds_remaining: active.timer.snapshot().seconds_remaining,
                    cycle_count: active.timer.snapshot().cycle_count,
                    role: active.timer.role(),
                    settings: active.timer.settings(),
                    progress: active.timer.smoothed_progress(now),
                },
                connection: active.connectivity.state(),
            }
        });

        SessionSnapshot {
            signed_in: self.identity.is_some(),
            sync_enabled: self.sync_enabled,
            group,
            pending_join: self.pending_join.as_ref().map(|p| PendingJoinView {
                group_name: p.group.name.clone(),
                code: p.group.code.clone(),
                suggested_name: p.suggested_name.clone(),
                awaiting_confirmation: p.awaiting_confirmation.is_some(),
            }),
            public_groups: self.public_groups.clone(),
        }
    }
}

//=========================================================================================
// Views
//=========================================================================================

/// What the presentation layer renders. Rebuilt and pushed after every change.
#[derive(Debug, Clone, Default, Serialize)]
pub struct SessionSnapshot {
    pub signed_in: bool,
    pub sync_enabled: bool,
    pub group: Option<GroupView>,
    pub pending_join: Option<PendingJoinView>,
    pub public_groups: Vec<PublicGroup>,
}

#[derive(Debug, Clone, Serialize)]
pub struct GroupView {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub topic: String,
    pub is_public: bool,
    pub is_creator: bool,
    pub me: Member,
    pub roster: Vec<Member>,
    pub leaderboard: Vec<LeaderboardEntry>,
    pub messages: Vec<ChatEntry>,
    pub exams: Vec<Exam>,
    pub timer: TimerView,
    pub connection: ConnectionState,
}

#[derive(Debug, Clone, Serialize)]
pub struct TimerView {
    pub state: TimerState,
    pub seconds_remaining: u32,
    pub cycle_count: u32,
    pub role: TimerRole,
    pub settings: TimerSettings,
    /// Fraction of the phase remaining, for drawing only.
    pub progress: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PendingJoinView {
    pub group_name: String,
    pub code: String,
    pub suggested_name: Option<String>,
    pub awaiting_confirmation: bool,
}

/// Transient, presentation-facing events that are not part of the steady-state view.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Notice {
    /// A chat message from someone else arrived for the first time.
    Message { from: String, text: String },
    GroupDeleted {
        group_name: String,
        deleted_by: Option<String>,
    },
    RemovedFromGroup { group_name: String },
    TimerChanged { by: String, state: TimerState },
    SettingsChanged { by: String, settings: TimerSettings },
    ExamsChanged,
}
