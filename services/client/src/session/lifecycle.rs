//! services/client/src/session/lifecycle.rs
//!
//! Liveness and expiry. Every connected client heartbeats its own row and runs both
//! inactivity sweeps; sweeps from several clients may overlap, so each step treats a
//! missing row as already done.

use crate::error::SessionResult;
use crate::session::client::StudyClient;
use chrono::Utc;
use study_sync_core::domain::MemberPatch;
use study_sync_core::membership::{inactivity_cutoff, notice_id, NoticeKey};
use study_sync_core::ports::{PortError, PortResult};
use tracing::{debug, info, warn};
use uuid::Uuid;

impl StudyClient {
    /// Refreshes our member row and the group's activity timestamp.
    pub(crate) async fn heartbeat(&self, session_id: Uuid) {
        let (group_id, member_id, status) = {
            let mut state = self.state.lock().await;
            let Some(active) = state.session_mut(session_id) else {
                return;
            };
            (active.group.id, active.me.id, active.me.status)
        };

        let now = Utc::now();
        let patch = MemberPatch {
            status: Some(status),
            updated_at: Some(now),
            ..MemberPatch::default()
        };
        if let Err(e) = self.store.update_member(member_id, patch).await {
            warn!("Heartbeat for member {} failed: {}", member_id, e);
        }
        if let Err(e) = self.store.touch_group(group_id, now).await {
            warn!("Heartbeat for group {} failed: {}", group_id, e);
        }
    }

    /// Removes members of the current group that stopped heartbeating, announcing each
    /// removal. Returns how many rows this call actually deleted.
    pub async fn sweep_inactive_members(&self) -> SessionResult<usize> {
        let (session_id, group_id, me_id) = {
            let state = self.state.lock().await;
            match state.active.as_ref() {
                Some(active) => (active.session_id, active.group.id, active.me.id),
                None => return Ok(0),
            }
        };

        let stale = self
            .store
            .list_members_inactive_since(group_id, inactivity_cutoff(Utc::now()))
            .await?;

        let mut removed = 0;
        for member in stale.into_iter().filter(|m| m.id != me_id) {
            match self.store.delete_member(member.id).await {
                Ok(true) => {
                    removed += 1;
                    info!(group = %group_id, member = %member.id, "Removed inactive member.");
                    self.post_system_message(
                        session_id,
                        notice_id(group_id, NoticeKey::Departed { member_id: member.id }),
                        format!("🚪 {} was removed for inactivity", member.display_name),
                    )
                    .await;
                }
                Ok(false) => debug!(member = %member.id, "Inactive member already removed."),
                Err(e) => {
                    // The row is still there; keep showing it until a later sweep succeeds.
                    warn!("Could not remove inactive member {}: {}", member.id, e);
                    continue;
                }
            }

            let mut state = self.state.lock().await;
            if let Some(active) = state.session_mut(session_id) {
                active.remove_member(member.id);
                self.publish(&state);
            }
        }
        Ok(removed)
    }

    /// Cascade-deletes every group that stopped heartbeating, other than our own.
    pub async fn sweep_inactive_groups(&self) -> SessionResult<usize> {
        let current = self.state.lock().await.active.as_ref().map(|a| a.group.id);

        let stale = self
            .store
            .list_groups_inactive_since(inactivity_cutoff(Utc::now()))
            .await?;

        let mut deleted = 0;
        for group in stale.into_iter().filter(|g| Some(g.id) != current) {
            match self.cascade_delete_group(group.id).await {
                Ok(()) => {
                    deleted += 1;
                    info!(group = %group.id, name = %group.name, "Deleted inactive group.");
                }
                Err(e) => warn!("Could not delete inactive group {}: {}", group.id, e),
            }
        }
        Ok(deleted)
    }

    /// Deletes a group's exams, messages and members, then the group row. Each step is
    /// safe to repeat, so a cascade interrupted here or run by two clients converges.
    pub(crate) async fn cascade_delete_group(&self, group_id: Uuid) -> PortResult<()> {
        let exams = swallow_missing(self.store.delete_exams_in_group(group_id).await)?;
        let messages = swallow_missing(self.store.delete_messages_in_group(group_id).await)?;
        let members = swallow_missing(self.store.delete_members_in_group(group_id).await)?;
        let group_removed = match self.store.delete_group(group_id).await {
            Ok(removed) => removed,
            Err(PortError::NotFound(_)) => false,
            Err(e) => return Err(e),
        };
        debug!(
            group = %group_id,
            exams,
            messages,
            members,
            group_removed,
            "Cascade delete finished."
        );
        Ok(())
    }
}

fn swallow_missing(result: PortResult<u64>) -> PortResult<u64> {
    match result {
        Err(PortError::NotFound(_)) => Ok(0),
        other => other,
    }
}
