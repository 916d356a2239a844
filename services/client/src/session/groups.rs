//! services/client/src/session/groups.rs
//!
//! Explicit membership actions: creating, joining, leaving and deleting groups,
//! creator-initiated removal, the timer sync toggle and the public group browser.

use crate::error::{SessionError, SessionResult};
use crate::session::client::{not_in_group, StudyClient};
use crate::session::state::{PendingJoin, PublicGroup};
use chrono::Utc;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use study_sync_core::code::{generate_group_code, normalize_join_code};
use study_sync_core::domain::{Group, Member, MemberPatch, MemberStatus, NewGroup, NewMember};
use study_sync_core::events::{group_channel, BroadcastEvent, GroupDeletedPayload};
use study_sync_core::membership::{
    existing_membership, notice_id, resolve_display_name, NameResolution, NoticeKey,
};
use study_sync_core::ports::PortError;
use study_sync_core::timer::TimerRole;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Code generation retries before giving up on finding an unused code.
const MAX_CODE_ATTEMPTS: usize = 5;

#[derive(Debug, Clone)]
pub struct CreateGroup {
    pub name: String,
    pub topic: String,
    pub is_public: bool,
    pub display_name: String,
}

/// The group a join code resolved to, with the name this identity used there before.
#[derive(Debug, Clone, Serialize)]
pub struct JoinPrompt {
    pub group_name: String,
    pub topic: String,
    pub suggested_name: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum JoinOutcome {
    Joined { group: Group },
    /// The name belongs to a row this identity already owns: ask "is this you?".
    NeedsConfirmation { member: Member },
}

pub(crate) fn joined_text(name: &str) -> String {
    format!("👋 {} joined the group", name)
}

pub(crate) fn departed_text(name: &str) -> String {
    format!("👋 {} left the group", name)
}

impl StudyClient {
    //=====================================================================================
    // Create / Join
    //=====================================================================================

    pub async fn create_group(&self, request: CreateGroup) -> SessionResult<Group> {
        let identity = self.require_identity().await?;
        let name = required(&request.name, "Group name")?;
        let display_name = required(&request.display_name, "Your name")?;

        let code = self.unused_group_code().await?;
        let group = self
            .store
            .create_group(NewGroup {
                code,
                name: name.to_string(),
                topic: request.topic.trim().to_string(),
                creator_id: identity.id,
                is_public: request.is_public,
            })
            .await?;
        let me = match self
            .store
            .create_member(NewMember {
                auth_identity: identity.id,
                display_name: display_name.to_string(),
                group_id: group.id,
            })
            .await
        {
            Ok(me) => me,
            Err(e) => {
                warn!(group = %group.id, "Creator row failed; discarding the new group: {}", e);
                if let Err(cleanup) = self.cascade_delete_group(group.id).await {
                    warn!(group = %group.id, "Could not discard the new group: {}", cleanup);
                }
                return Err(e.into());
            }
        };
        info!(group = %group.id, code = %group.code, "Group created.");

        let session_id = self.enter_session(group.clone(), me.clone()).await?;
        self.post_system_message(
            session_id,
            notice_id(group.id, NoticeKey::Joined { member_id: me.id }),
            joined_text(&me.display_name),
        )
        .await;
        Ok(group)
    }

    /// Draws codes until one is not held by a live group.
    async fn unused_group_code(&self) -> SessionResult<String> {
        for _ in 0..MAX_CODE_ATTEMPTS {
            let code = generate_group_code();
            match self.store.find_group_by_code(&code).await? {
                None => return Ok(code),
                Some(_) => warn!("Generated group code {} is already in use; retrying.", code),
            }
        }
        Err(SessionError::TransientIo(
            "Could not allocate a unique group code".to_string(),
        ))
    }

    /// Resolves a join code. The member row is only attached once a name is chosen.
    pub async fn join_group(&self, code: &str) -> SessionResult<JoinPrompt> {
        let identity = self.require_identity().await?;
        let code = normalize_join_code(code)?;
        let group = self
            .store
            .find_group_by_code(&code)
            .await?
            .ok_or_else(|| SessionError::Conflict("No group found with that code".to_string()))?;
        let members = self.store.list_members(group.id).await?;
        let suggested_name = existing_membership(&members, identity.id).map(|m| m.display_name.clone());

        let prompt = JoinPrompt {
            group_name: group.name.clone(),
            topic: group.topic.clone(),
            suggested_name: suggested_name.clone(),
        };
        let mut state = self.state.lock().await;
        state.pending_join = Some(PendingJoin {
            group,
            suggested_name,
            awaiting_confirmation: None,
        });
        self.publish(&state);
        Ok(prompt)
    }

    pub async fn choose_name(&self, name: &str) -> SessionResult<JoinOutcome> {
        let identity = self.require_identity().await?;
        let name = required(name, "Your name")?;
        let group = self.pending_group().await?;

        let members = self.store.list_members(group.id).await?;
        match resolve_display_name(&members, identity.id, name) {
            NameResolution::CreateNew => {
                let me = self
                    .store
                    .create_member(NewMember {
                        auth_identity: identity.id,
                        display_name: name.to_string(),
                        group_id: group.id,
                    })
                    .await?;
                let session_id = self.enter_session(group.clone(), me.clone()).await?;
                self.post_system_message(
                    session_id,
                    notice_id(group.id, NoticeKey::Joined { member_id: me.id }),
                    joined_text(&me.display_name),
                )
                .await;
                Ok(JoinOutcome::Joined { group })
            }
            NameResolution::ConfirmExisting(member) => {
                let mut state = self.state.lock().await;
                if let Some(pending) = state.pending_join.as_mut() {
                    pending.awaiting_confirmation = Some(member.clone());
                }
                self.publish(&state);
                Ok(JoinOutcome::NeedsConfirmation { member })
            }
            NameResolution::NameTaken => Err(SessionError::Conflict(format!(
                "The name '{}' is already taken in this group",
                name
            ))),
        }
    }

    /// "Yes, that's me": reuse the existing member row.
    pub async fn confirm_existing(&self) -> SessionResult<Group> {
        let (group, member) = {
            let state = self.state.lock().await;
            let pending = state
                .pending_join
                .as_ref()
                .ok_or_else(|| SessionError::InvalidState("No join in progress".to_string()))?;
            let member = pending.awaiting_confirmation.clone().ok_or_else(|| {
                SessionError::InvalidState("Nothing is waiting for confirmation".to_string())
            })?;
            (pending.group.clone(), member)
        };

        let now = Utc::now();
        let patch = MemberPatch {
            status: Some(MemberStatus::Online),
            updated_at: Some(now),
            ..MemberPatch::default()
        };
        match self.store.update_member(member.id, patch).await {
            Ok(()) => {}
            Err(PortError::NotFound(_)) => {
                self.reject_existing().await;
                return Err(SessionError::Conflict(
                    "That membership no longer exists; please choose your name again".to_string(),
                ));
            }
            Err(e) => return Err(e.into()),
        }

        let me = Member {
            status: MemberStatus::Online,
            updated_at: now,
            ..member
        };
        let session_id = self.enter_session(group.clone(), me.clone()).await?;
        self.post_system_message(
            session_id,
            Uuid::new_v4(),
            format!("👋 Welcome back, {}!", me.display_name),
        )
        .await;
        Ok(group)
    }

    /// "No, that's not me": the user has to pick another name.
    pub async fn reject_existing(&self) {
        let mut state = self.state.lock().await;
        if let Some(pending) = state.pending_join.as_mut() {
            pending.awaiting_confirmation = None;
        }
        self.publish(&state);
    }

    pub async fn cancel_join(&self) {
        let mut state = self.state.lock().await;
        state.pending_join = None;
        self.publish(&state);
    }

    async fn pending_group(&self) -> SessionResult<Group> {
        self.state
            .lock()
            .await
            .pending_join
            .as_ref()
            .map(|p| p.group.clone())
            .ok_or_else(|| SessionError::InvalidState("Enter a group code first".to_string()))
    }

    //=====================================================================================
    // Leave / Delete / Remove
    //=====================================================================================

    /// Deletes our own member row and resets all local session state.
    pub async fn leave_group(&self) -> SessionResult<()> {
        let Some(ended) = self.end_session().await else {
            return Ok(());
        };
        let (group, me) = (ended.group, ended.me);

        let departure = self.system_message_for(
            &group,
            &me,
            notice_id(group.id, NoticeKey::Departed { member_id: me.id }),
            departed_text(&me.display_name),
        );
        if let Err(e) = self.deliver(&group_channel(group.id), &departure).await {
            warn!("Could not record departure from {}: {}", group.id, e);
        }

        match self.store.delete_member(me.id).await {
            Ok(true) => info!(group = %group.id, member = %me.id, "Left group."),
            Ok(false) => debug!(member = %me.id, "Member row was already gone when leaving."),
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Creator only. Tells everyone to reset, then cascades the deletion.
    pub async fn delete_group(&self) -> SessionResult<()> {
        let (group, me) = {
            let state = self.state.lock().await;
            let active = state.active.as_ref().ok_or_else(not_in_group)?;
            if !active.is_creator() {
                return Err(SessionError::InvalidState(
                    "Only the group creator can delete the group".to_string(),
                ));
            }
            (active.group.clone(), active.me.clone())
        };

        let event = BroadcastEvent::GroupDeleted(GroupDeletedPayload {
            group_name: group.name.clone(),
            deleted_by: me.display_name.clone(),
        });
        if let Err(e) = self
            .relay
            .publish(&group_channel(group.id), event.topic(), event.payload())
            .await
        {
            warn!("Could not broadcast deletion of group {}: {}", group.id, e);
        }

        self.end_session().await;
        self.cascade_delete_group(group.id).await?;
        info!(group = %group.id, "Group deleted by its creator.");
        Ok(())
    }

    /// Creator only. The member table change reaches other clients through the store.
    pub async fn remove_member(&self, member_id: Uuid) -> SessionResult<()> {
        let (session_id, group, target, me) = {
            let state = self.state.lock().await;
            let active = state.active.as_ref().ok_or_else(not_in_group)?;
            if !active.is_creator() {
                return Err(SessionError::InvalidState(
                    "Only the group creator can remove members".to_string(),
                ));
            }
            if member_id == active.me.id {
                return Err(SessionError::InvalidState(
                    "Use leave to remove yourself".to_string(),
                ));
            }
            let target = active
                .members
                .iter()
                .find(|m| m.id == member_id)
                .cloned()
                .ok_or_else(|| SessionError::DeletionRace(format!("member {}", member_id)))?;
            (active.session_id, active.group.clone(), target, active.me.clone())
        };

        self.post_system_message(
            session_id,
            notice_id(group.id, NoticeKey::Departed { member_id: target.id }),
            format!("🚫 {} was removed by {}", target.display_name, me.display_name),
        )
        .await;

        if !self.store.delete_member(target.id).await? {
            debug!(member = %target.id, "Member was already gone when removed.");
        }

        let mut state = self.state.lock().await;
        if let Some(active) = state.session_mut(session_id) {
            active.remove_member(target.id);
        }
        self.publish(&state);
        Ok(())
    }

    //=====================================================================================
    // Timer Sync Toggle
    //=====================================================================================

    /// Opts a non-creator in or out of mirroring the creator's timer.
    pub async fn set_sync(&self, enabled: bool) -> SessionResult<()> {
        let change = {
            let mut state = self.state.lock().await;
            state.sync_enabled = enabled;
            let change = state.active.as_mut().and_then(|active| {
                let role = TimerRole::resolve(active.is_creator(), enabled);
                if role == active.timer.role() {
                    return None;
                }
                active.timer.set_role(role);
                Some((active.session_id, role, active.connectivity.is_connected()))
            });
            self.publish(&state);
            change
        };

        if let Some((session_id, role, connected)) = change {
            info!(role = ?role, "Timer role changed.");
            self.sync_timer_tasks(session_id, role).await;
            if role == TimerRole::Replica && connected {
                self.request_timer_sync(session_id).await;
            }
        }
        Ok(())
    }

    //=====================================================================================
    // Public Groups
    //=====================================================================================

    /// Public groups, newest first, labelled with their creator's display name.
    pub async fn list_public_groups(&self) -> SessionResult<Vec<PublicGroup>> {
        let groups = self.store.list_public_groups().await?;
        let creators: Vec<Uuid> = groups
            .iter()
            .map(|g| g.creator_id)
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        let names: HashMap<Uuid, String> = self
            .store
            .display_names_for(&creators)
            .await
            .unwrap_or_else(|e| {
                warn!("Could not resolve creator names: {}", e);
                Vec::new()
            })
            .into_iter()
            .collect();

        let listing: Vec<PublicGroup> = groups
            .into_iter()
            .map(|g| PublicGroup {
                creator_name: names
                    .get(&g.creator_id)
                    .cloned()
                    .unwrap_or_else(|| g.creator_id.to_string()),
                id: g.id,
                code: g.code,
                name: g.name,
                topic: g.topic,
                created_at: g.created_at,
            })
            .collect();

        let mut state = self.state.lock().await;
        state.public_groups = listing.clone();
        self.publish(&state);
        Ok(listing)
    }
}

fn required<'a>(value: &'a str, what: &str) -> SessionResult<&'a str> {
    let value = value.trim();
    if value.is_empty() {
        return Err(SessionError::Validation(format!("{} is required", what)));
    }
    Ok(value)
}
