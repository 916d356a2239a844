//! services/client/src/session/client.rs
//!
//! `StudyClient` is the Group Session Client: one instance per participant. It owns the
//! shared `SessionState`, the named background tasks and the outbound snapshot/notice
//! channels. Operations are grouped by concern in the sibling modules; this file holds
//! construction, auth, and entering/leaving a group session.

use crate::config::SessionConfig;
use crate::error::{SessionError, SessionResult};
use crate::session::state::{ActiveSession, Notice, SessionSnapshot, SessionState};
use crate::session::tasks::{self, every, TaskSet};
use chrono::Utc;
use futures::StreamExt;
use std::sync::Arc;
use std::time::Instant;
use study_sync_core::connectivity::ConnectivityController;
use study_sync_core::domain::{Group, Identity, Member};
use study_sync_core::events::group_channel;
use study_sync_core::ports::{AuthService, BroadcastRelay, RecordStore, SessionCues};
use study_sync_core::reconciler::{MessageLog, Source};
use study_sync_core::timer::{TimerMachine, TimerRole};
use tokio::sync::{broadcast, watch, Mutex};
use tracing::{info, warn};
use uuid::Uuid;

const NOTICE_CAPACITY: usize = 64;

/// The collaborators a client is wired to.
#[derive(Clone)]
pub struct Ports {
    pub store: Arc<dyn RecordStore>,
    pub relay: Arc<dyn BroadcastRelay>,
    pub auth: Arc<dyn AuthService>,
    pub cues: Arc<dyn SessionCues>,
}

#[derive(Clone)]
pub struct StudyClient {
    pub(crate) store: Arc<dyn RecordStore>,
    pub(crate) relay: Arc<dyn BroadcastRelay>,
    pub(crate) auth: Arc<dyn AuthService>,
    pub(crate) cues: Arc<dyn SessionCues>,
    pub(crate) config: Arc<SessionConfig>,
    pub(crate) state: Arc<Mutex<SessionState>>,
    /// Tasks bound to the current group; all cancelled when the session ends.
    pub(crate) session_tasks: Arc<TaskSet>,
    /// Tasks that live as long as the client.
    pub(crate) client_tasks: Arc<TaskSet>,
    snapshots: Arc<watch::Sender<SessionSnapshot>>,
    notices: broadcast::Sender<Notice>,
}

impl StudyClient {
    pub fn new(ports: Ports, config: SessionConfig) -> Self {
        let (snapshots, _) = watch::channel(SessionSnapshot::default());
        let (notices, _) = broadcast::channel(NOTICE_CAPACITY);
        Self {
            store: ports.store,
            relay: ports.relay,
            auth: ports.auth,
            cues: ports.cues,
            config: Arc::new(config),
            state: Arc::new(Mutex::new(SessionState::default())),
            session_tasks: Arc::new(TaskSet::new()),
            client_tasks: Arc::new(TaskSet::new()),
            snapshots: Arc::new(snapshots),
            notices,
        }
    }

    /// Picks up the current auth identity and starts the client-wide tasks.
    pub async fn start(&self) -> SessionResult<()> {
        let identity = self.auth.current_user().await?;
        {
            let mut state = self.state.lock().await;
            state.identity = identity;
            self.publish(&state);
        }

        let client = self.clone();
        self.client_tasks
            .spawn(tasks::AUTH_WATCH, move |token| async move {
                let mut changes = client.auth.on_auth_state_change();
                loop {
                    tokio::select! {
                        _ = token.cancelled() => break,
                        change = changes.next() => match change {
                            Some(identity) => client.on_auth_change(identity).await,
                            None => break,
                        },
                    }
                }
            })
            .await;

        let client = self.clone();
        let period = self.config.public_refresh_interval;
        self.client_tasks
            .spawn(tasks::PUBLIC_REFRESH, move |token| async move {
                every(token, period, || async {
                    if let Err(e) = client.list_public_groups().await {
                        warn!("Public group refresh failed: {}", e);
                    }
                })
                .await
            })
            .await;

        if let Err(e) = self.list_public_groups().await {
            warn!("Initial public group fetch failed: {}", e);
        }
        info!("Study client started.");
        Ok(())
    }

    /// Leaves any group and stops every background task.
    pub async fn shutdown(&self) {
        if let Err(e) = self.leave_group().await {
            warn!("Leaving the group during shutdown failed: {}", e);
        }
        self.session_tasks.cancel_all().await;
        self.client_tasks.cancel_all().await;
        info!("Study client stopped.");
    }

    //=====================================================================================
    // Outbound Channels
    //=====================================================================================

    pub fn subscribe(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshots.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<Notice> {
        self.notices.subscribe()
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshots.borrow().clone()
    }

    pub(crate) fn publish(&self, state: &SessionState) {
        self.snapshots.send_replace(state.snapshot(clock(), Utc::now()));
    }

    pub(crate) fn notify(&self, notice: Notice) {
        // No receivers just means no presentation layer is attached.
        let _ = self.notices.send(notice);
    }

    //=====================================================================================
    // Auth
    //=====================================================================================

    pub async fn sign_up(&self, email: &str, password: &str) -> SessionResult<Identity> {
        let identity = self.auth.sign_up(email.trim(), password).await?;
        self.set_identity(Some(identity.clone())).await;
        Ok(identity)
    }

    pub async fn sign_in(&self, email: &str, password: &str) -> SessionResult<Identity> {
        let identity = self.auth.sign_in(email.trim(), password).await?;
        self.set_identity(Some(identity.clone())).await;
        Ok(identity)
    }

    pub async fn sign_out(&self) -> SessionResult<()> {
        self.leave_group().await?;
        self.auth.sign_out().await?;
        self.set_identity(None).await;
        Ok(())
    }

    pub async fn reset_password(&self, email: &str) -> SessionResult<()> {
        Ok(self.auth.reset_password(email.trim()).await?)
    }

    async fn set_identity(&self, identity: Option<Identity>) {
        let mut state = self.state.lock().await;
        state.identity = identity;
        self.publish(&state);
    }

    async fn on_auth_change(&self, identity: Option<Identity>) {
        let signed_out_mid_session = {
            let mut state = self.state.lock().await;
            state.identity = identity.clone();
            self.publish(&state);
            identity.is_none() && state.active.is_some()
        };
        if signed_out_mid_session {
            if let Err(e) = self.leave_group().await {
                warn!("Leaving the group after sign-out failed: {}", e);
            }
        }
    }

    pub(crate) async fn require_identity(&self) -> SessionResult<Identity> {
        let cached = self.state.lock().await.identity.clone();
        if let Some(identity) = cached {
            return Ok(identity);
        }
        let identity = self.auth.current_user().await?.ok_or(SessionError::Unauthorized)?;
        self.set_identity(Some(identity.clone())).await;
        Ok(identity)
    }

    //=====================================================================================
    // Session Lifecycle
    //=====================================================================================

    /// Loads the group's state, swaps it in as the active session and starts its tasks.
    pub(crate) async fn enter_session(&self, group: Group, me: Member) -> SessionResult<Uuid> {
        self.end_session().await;

        let members = self.store.list_members(group.id).await?;
        let history = self.store.list_messages(group.id, self.config.history_limit).await?;
        let exams = self.store.list_exams(group.id).await.unwrap_or_else(|e| {
            warn!("Could not load exams for group {}: {}", group.id, e);
            Vec::new()
        });

        let session_id = Uuid::new_v4();
        let role = {
            let mut state = self.state.lock().await;
            let is_creator = group.creator_id == me.auth_identity;
            let role = TimerRole::resolve(is_creator, state.sync_enabled);

            let mut messages = MessageLog::new(self.config.history_limit);
            messages.set_local_author(me.id, &me.display_name);
            // History is not news: fill the log without raising notifications.
            messages.resync(history, Source::Poll);

            let mut active = ActiveSession {
                session_id,
                timer: TimerMachine::new(role, Default::default(), me.display_name.clone()),
                connectivity: ConnectivityController::new(self.config.confirm_delay, self.config.retry),
                group,
                me,
                members,
                exams,
                messages,
            };
            active.upsert_member(active.me.clone());
            active.sort_exams();
            info!(
                group = %active.group.id,
                member = %active.me.id,
                role = ?role,
                "Entered group session."
            );

            state.active = Some(active);
            state.pending_join = None;
            self.publish(&state);
            role
        };

        self.start_session_tasks(session_id, role).await;
        self.heartbeat(session_id).await;
        Ok(session_id)
    }

    /// Tears down the active session locally: cancels its tasks, silences cues and
    /// withdraws presence. Returns the session that was active, if any.
    pub(crate) async fn end_session(&self) -> Option<ActiveSession> {
        let ended = {
            let mut state = self.state.lock().await;
            let ended = state.active.take();
            self.publish(&state);
            ended
        };
        self.session_tasks.cancel_all().await;

        if let Some(active) = &ended {
            self.cues.stop();
            let channel = group_channel(active.group.id);
            if let Err(e) = self.relay.untrack_presence(&channel, active.me.id).await {
                warn!("Could not withdraw presence from {}: {}", channel, e);
            }
            info!(group = %active.group.id, "Group session ended.");
        }
        ended
    }

    async fn start_session_tasks(&self, session_id: Uuid, role: TimerRole) {
        let group_id = match self.state.lock().await.session_mut(session_id) {
            Some(active) => active.group.id,
            None => return,
        };

        let client = self.clone();
        let channel = group_channel(group_id);
        self.session_tasks
            .spawn(tasks::CHANNEL, move |token| client.run_channel(session_id, channel, token))
            .await;

        let client = self.clone();
        self.session_tasks
            .spawn(tasks::STORE_CHANGES, move |token| {
                client.run_store_changes(session_id, group_id, token)
            })
            .await;

        let client = self.clone();
        let period = self.config.poll_interval;
        self.session_tasks
            .spawn(tasks::POLL, move |token| async move {
                every(token, period, || client.poll_once(session_id)).await
            })
            .await;

        let client = self.clone();
        let period = self.config.heartbeat_interval;
        self.session_tasks
            .spawn(tasks::HEARTBEAT, move |token| async move {
                every(token, period, || client.heartbeat(session_id)).await
            })
            .await;

        let client = self.clone();
        let period = self.config.presence_interval;
        self.session_tasks
            .spawn(tasks::PRESENCE, move |token| async move {
                every(token, period, || client.announce_presence(session_id)).await
            })
            .await;

        let client = self.clone();
        let period = self.config.user_sweep_interval;
        self.session_tasks
            .spawn(tasks::USER_SWEEP, move |token| async move {
                every(token, period, || async {
                    if let Err(e) = client.sweep_inactive_members().await {
                        warn!("Member sweep failed: {}", e);
                    }
                })
                .await
            })
            .await;

        let client = self.clone();
        let period = self.config.group_sweep_interval;
        self.session_tasks
            .spawn(tasks::GROUP_SWEEP, move |token| async move {
                every(token, period, || async {
                    if let Err(e) = client.sweep_inactive_groups().await {
                        warn!("Group sweep failed: {}", e);
                    }
                })
                .await
            })
            .await;

        self.sync_timer_tasks(session_id, role).await;
    }

    /// Starts or stops the countdown and authority-broadcast tasks to match `role`.
    pub(crate) async fn sync_timer_tasks(&self, session_id: Uuid, role: TimerRole) {
        if role.runs_countdown() {
            let client = self.clone();
            let period = self.config.tick_interval;
            self.session_tasks
                .spawn(tasks::TICK, move |token| async move {
                    every(token, period, || client.tick_once(session_id)).await
                })
                .await;
        } else {
            self.session_tasks.cancel(tasks::TICK).await;
        }

        if role == TimerRole::Authority {
            let client = self.clone();
            let period = self.config.authority_broadcast_interval;
            self.session_tasks
                .spawn(tasks::AUTHORITY_BROADCAST, move |token| async move {
                    every(token, period, || client.broadcast_tick(session_id)).await
                })
                .await;
        } else {
            self.session_tasks.cancel(tasks::AUTHORITY_BROADCAST).await;
        }
    }

    /// Names of the session tasks currently scheduled.
    pub async fn running_tasks(&self) -> Vec<&'static str> {
        self.session_tasks.names().await
    }
}

/// The monotonic clock used for connectivity and progress; follows tokio's clock so
/// paused-time tests stay consistent.
pub(crate) fn clock() -> Instant {
    tokio::time::Instant::now().into_std()
}

pub(crate) fn not_in_group() -> SessionError {
    SessionError::InvalidState("You are not in a group".to_string())
}
