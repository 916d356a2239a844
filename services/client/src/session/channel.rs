//! services/client/src/session/channel.rs
//!
//! Inbound synchronization for the active group. Three paths feed the same state:
//! the relay channel (broadcast events plus its subscription lifecycle), the store's
//! change feed, and a polling resync that only runs while the channel is not trusted.

use crate::session::client::{clock, StudyClient};
use crate::session::groups::{departed_text, joined_text};
use crate::session::state::{ActiveSession, Notice};
use crate::session::tasks::sleep_or_cancel;
use crate::session::timer::{settings_event, streak_text, sync_event, Job, Outbox};
use chrono::Utc;
use futures::StreamExt;
use study_sync_core::connectivity::{Recovery, Transition};
use study_sync_core::domain::{ChatMessage, MemberPatch, Presence, TimerSnapshot, SYSTEM_AUTHOR_NAME};
use study_sync_core::events::{group_channel, BroadcastEvent};
use study_sync_core::membership::{is_streak_milestone, notice_id, NoticeKey};
use study_sync_core::ports::{ChangeEvent, ChannelStatus, RelayFrame, RelayStream};
use study_sync_core::reconciler::{Ingest, Source};
use study_sync_core::timer::{Cue, TimerRole};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

enum Flow {
    Continue,
    Recover(Recovery),
    Stop,
}

/// A notice synthesised locally for a membership event observed on the store.
fn membership_notice(group_id: Uuid, member_id: Uuid, key: NoticeKey, text: String) -> ChatMessage {
    ChatMessage {
        id: notice_id(group_id, key),
        author_id: member_id,
        author_name: SYSTEM_AUTHOR_NAME.to_string(),
        group_id,
        text,
        is_system: true,
        created_at: Utc::now(),
    }
}

impl StudyClient {
    //=====================================================================================
    // Relay Channel
    //=====================================================================================

    /// Keeps the group's relay subscription alive, re-subscribing with backoff until
    /// the retry budget is spent. Polling covers any gap.
    pub(crate) async fn run_channel(self, session_id: Uuid, channel: String, token: CancellationToken) {
        loop {
            {
                let mut state = self.state.lock().await;
                let Some(active) = state.session_mut(session_id) else {
                    return;
                };
                active.connectivity.begin_connecting();
                self.publish(&state);
            }

            let flow = match self.relay.subscribe(&channel).await {
                Ok(stream) => self.drain_subscription(session_id, stream, &token).await,
                Err(e) => {
                    warn!("Could not subscribe to {}: {}", channel, e);
                    self.on_channel_status(session_id, ChannelStatus::ChannelError).await
                }
            };

            match flow {
                Flow::Stop | Flow::Continue => return,
                Flow::Recover(Recovery::RetryAfter(delay)) => {
                    info!("Re-subscribing to {} in {:?}.", channel, delay);
                    if !sleep_or_cancel(&token, delay).await {
                        return;
                    }
                }
                Flow::Recover(Recovery::GiveUp) => {
                    warn!("Giving up on {}; staying on polling.", channel);
                    token.cancelled().await;
                    return;
                }
            }
        }
    }

    async fn drain_subscription(
        &self,
        session_id: Uuid,
        mut stream: RelayStream,
        token: &CancellationToken,
    ) -> Flow {
        loop {
            let deadline = match self.state.lock().await.session_mut(session_id) {
                Some(active) => active.connectivity.confirm_deadline(),
                None => return Flow::Stop,
            };
            let confirm = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(tokio::time::Instant::from_std(at)).await,
                    None => std::future::pending::<()>().await,
                }
            };

            tokio::select! {
                _ = token.cancelled() => return Flow::Stop,
                _ = confirm => self.confirm_channel(session_id).await,
                frame = stream.next() => match frame {
                    Some(RelayFrame::Status(status)) => {
                        match self.on_channel_status(session_id, status).await {
                            Flow::Continue => {}
                            other => return other,
                        }
                    }
                    Some(RelayFrame::Event { topic, payload }) => {
                        match BroadcastEvent::from_frame(&topic, payload) {
                            Ok(event) => self.handle_event(session_id, event).await,
                            Err(e) => warn!("Ignoring broadcast: {}", e),
                        }
                    }
                    None => return self.on_channel_status(session_id, ChannelStatus::Closed).await,
                },
            }
        }
    }

    async fn on_channel_status(&self, session_id: Uuid, status: ChannelStatus) -> Flow {
        let mut state = self.state.lock().await;
        let Some(active) = state.session_mut(session_id) else {
            return Flow::Stop;
        };
        let (transition, recovery) = active.connectivity.on_status(status, clock());
        debug!(status = ?status, state = ?active.connectivity.state(), "Channel status.");
        if transition == Transition::BecameDisconnected {
            info!(group = %active.group.id, "Realtime channel lost; polling for updates.");
            if active.timer.invalidate_replica() {
                self.cues.stop();
            }
        }
        self.publish(&state);
        match recovery {
            Some(recovery) => Flow::Recover(recovery),
            None => Flow::Continue,
        }
    }

    async fn confirm_channel(&self, session_id: Uuid) {
        let (group_id, role) = {
            let mut state = self.state.lock().await;
            let Some(active) = state.session_mut(session_id) else {
                return;
            };
            if active.connectivity.poll_confirm(clock()) != Transition::BecameConnected {
                return;
            }
            info!(group = %active.group.id, "Realtime channel connected.");
            let ids = (active.group.id, active.timer.role());
            self.publish(&state);
            ids
        };

        if role == TimerRole::Replica {
            self.request_timer_sync(session_id).await;
        }
        self.announce_presence(session_id).await;
        // Catch up on anything broadcast while the channel was down.
        self.resync(session_id, group_id).await;
    }

    //=====================================================================================
    // Broadcast Events
    //=====================================================================================

    pub(crate) async fn handle_event(&self, session_id: Uuid, event: BroadcastEvent) {
        let mut notices = Vec::new();
        let mut outbox = None;
        let mut refresh_exams = false;
        let mut group_deleted = None;

        {
            let mut state = self.state.lock().await;
            let Some(active) = state.session_mut(session_id) else {
                return;
            };
            let me_id = active.me.id;

            match event {
                BroadcastEvent::NewMessage(payload) => {
                    let message = payload.into_message(active.group.id);
                    self.ingest_remote(active, message, Source::Broadcast, &mut notices);
                }
                BroadcastEvent::TimerSync(payload) => {
                    if active.timer.role() == TimerRole::Replica && payload.changed_by_id != Some(me_id) {
                        let snapshot = TimerSnapshot {
                            state: payload.timer_state,
                            seconds_remaining: payload.seconds,
                            cycle_count: payload.cycle_count,
                        };
                        let cues = active.timer.apply_sync(snapshot, clock());
                        if !cues.is_empty() {
                            outbox = Some(self.follow_replicated_state(active, &cues));
                            notices.push(Notice::TimerChanged {
                                by: payload
                                    .changed_by_name
                                    .unwrap_or_else(|| "the group creator".to_string()),
                                state: payload.timer_state,
                            });
                        }
                    }
                }
                BroadcastEvent::TimerTick(payload) => {
                    if active.timer.role() == TimerRole::Replica {
                        let cues = active.timer.apply_tick(payload.timer_state, payload.seconds, clock());
                        if !cues.is_empty() {
                            outbox = Some(self.follow_replicated_state(active, &cues));
                        }
                    }
                }
                BroadcastEvent::RequestTimerSync(payload) => {
                    if active.timer.role() == TimerRole::Authority && payload.requester_id != me_id {
                        debug!(requester = %payload.requester_name, "Answering timer sync request.");
                        let mut reply = Outbox::new(active.group.id);
                        reply.push(Job::Broadcast(settings_event(active, active.timer.settings())));
                        reply.push(Job::Broadcast(sync_event(active)));
                        outbox = Some(reply);
                    }
                }
                BroadcastEvent::SettingsChange(payload) => {
                    if payload.changed_by_id != Some(me_id) && active.timer.apply_remote_settings(payload.settings) {
                        notices.push(Notice::SettingsChanged {
                            by: payload
                                .changed_by_name
                                .unwrap_or_else(|| "the group creator".to_string()),
                            settings: payload.settings,
                        });
                    }
                }
                BroadcastEvent::ExamUpdate(payload) => {
                    refresh_exams = true;
                    if payload.user_id != Some(me_id) {
                        notices.push(Notice::ExamsChanged);
                    }
                }
                BroadcastEvent::GroupDeleted(payload) => {
                    // The creator already tore its own session down.
                    if !active.is_creator() {
                        group_deleted = Some(Notice::GroupDeleted {
                            group_name: payload.group_name,
                            deleted_by: Some(payload.deleted_by),
                        });
                    }
                }
                BroadcastEvent::LeaderboardUpdate(payload) => {
                    if payload.user_id != me_id {
                        if let Some(member) = active.members.iter_mut().find(|m| m.id == payload.user_id) {
                            member.streak = payload.new_streak;
                            member.status = payload.status;
                            member.updated_at = Utc::now();
                        }
                        if is_streak_milestone(payload.new_streak) {
                            let key = NoticeKey::StreakMilestone {
                                member_id: payload.user_id,
                                streak: payload.new_streak,
                                day: Utc::now().date_naive(),
                            };
                            let notice = membership_notice(
                                active.group.id,
                                payload.user_id,
                                key,
                                streak_text(&payload.user_name, payload.new_streak),
                            );
                            self.ingest_remote(active, notice, Source::Broadcast, &mut notices);
                        }
                    }
                }
            }
            self.publish(&state);
        }

        for notice in notices {
            self.notify(notice);
        }
        if let Some(outbox) = outbox {
            self.run_jobs(outbox).await;
        }
        if refresh_exams {
            self.refresh_exams(session_id).await;
        }
        // The relay and the change feed can both report the end; the first one wins.
        if let Some(notice) = group_deleted {
            if self.end_session().await.is_some() {
                info!("Group was deleted by its creator; resetting session.");
                self.notify(notice);
            }
        }
    }

    /// Replica side effects of an authority transition: the cues, and our own status
    /// following the replicated state.
    fn follow_replicated_state(&self, active: &mut ActiveSession, cues: &[Cue]) -> Outbox {
        for cue in cues {
            cue.play(self.cues.as_ref());
        }
        let now = Utc::now();
        let status = active.timer.state().member_status();
        active.me.status = status;
        active.me.updated_at = now;
        active.upsert_member(active.me.clone());

        let mut outbox = Outbox::new(active.group.id);
        outbox.push(Job::PersistMember {
            member_id: active.me.id,
            patch: MemberPatch {
                status: Some(status),
                updated_at: Some(now),
                ..MemberPatch::default()
            },
        });
        outbox
    }

    fn ingest_remote(
        &self,
        active: &mut ActiveSession,
        message: ChatMessage,
        source: Source,
        notices: &mut Vec<Notice>,
    ) {
        let (from, text) = (message.author_name.clone(), message.text.clone());
        if let Ingest::Inserted { notify: true } = active.messages.ingest(message, source) {
            self.cues.play_notification();
            notices.push(Notice::Message { from, text });
        }
    }

    //=====================================================================================
    // Store Change Feed
    //=====================================================================================

    pub(crate) async fn run_store_changes(self, session_id: Uuid, group_id: Uuid, token: CancellationToken) {
        loop {
            match self.store.subscribe_changes(group_id).await {
                Ok(mut changes) => loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        change = changes.next() => match change {
                            Some(change) => self.handle_change(session_id, change).await,
                            None => {
                                warn!("Change feed for group {} ended.", group_id);
                                break;
                            }
                        },
                    }
                },
                Err(e) => warn!("Could not open change feed for group {}: {}", group_id, e),
            }
            if !sleep_or_cancel(&token, self.config.change_feed_retry).await {
                return;
            }
        }
    }

    pub(crate) async fn handle_change(&self, session_id: Uuid, change: ChangeEvent) {
        let mut notices = Vec::new();
        let mut ended = None;

        {
            let mut state = self.state.lock().await;
            let Some(active) = state.session_mut(session_id) else {
                return;
            };
            let group_id = active.group.id;

            match change {
                ChangeEvent::MessageInserted(message) => {
                    self.ingest_remote(active, message, Source::StoreChange, &mut notices);
                }
                ChangeEvent::MemberInserted(member) => {
                    if member.id != active.me.id {
                        let notice = membership_notice(
                            group_id,
                            member.id,
                            NoticeKey::Joined { member_id: member.id },
                            joined_text(&member.display_name),
                        );
                        active.upsert_member(member);
                        self.ingest_remote(active, notice, Source::StoreChange, &mut notices);
                    }
                }
                ChangeEvent::MemberUpdated(member) => {
                    // Our own row is written by us; the local copy is never older.
                    if member.id != active.me.id {
                        active.upsert_member(member);
                    }
                }
                ChangeEvent::MemberDeleted { id, display_name, .. } => {
                    if id == active.me.id {
                        ended = Some(Notice::RemovedFromGroup {
                            group_name: active.group.name.clone(),
                        });
                    } else {
                        active.remove_member(id);
                        let notice = membership_notice(
                            group_id,
                            id,
                            NoticeKey::Departed { member_id: id },
                            departed_text(&display_name),
                        );
                        self.ingest_remote(active, notice, Source::StoreChange, &mut notices);
                    }
                }
                ChangeEvent::GroupDeleted { .. } => {
                    if !active.is_creator() {
                        ended = Some(Notice::GroupDeleted {
                            group_name: active.group.name.clone(),
                            deleted_by: None,
                        });
                    }
                }
            }
            self.publish(&state);
        }

        for notice in notices {
            self.notify(notice);
        }
        if let Some(notice) = ended {
            if self.end_session().await.is_some() {
                info!("Our membership ended remotely; resetting session.");
                self.notify(notice);
            }
        }
    }

    //=====================================================================================
    // Polling Fallback
    //=====================================================================================

    pub(crate) async fn poll_once(&self, session_id: Uuid) {
        let group_id = {
            let mut state = self.state.lock().await;
            match state.session_mut(session_id) {
                Some(active) if active.connectivity.should_poll() => active.group.id,
                _ => return,
            }
        };
        self.resync(session_id, group_id).await;
    }

    /// Re-fetches messages and members and merges them through the normal dedup rules.
    pub(crate) async fn resync(&self, session_id: Uuid, group_id: Uuid) {
        let messages = match self.store.list_messages(group_id, self.config.history_limit).await {
            Ok(messages) => messages,
            Err(e) => {
                warn!("Polling messages for group {} failed: {}", group_id, e);
                return;
            }
        };
        let members = match self.store.list_members(group_id).await {
            Ok(members) => Some(members),
            Err(e) => {
                warn!("Polling members for group {} failed: {}", group_id, e);
                None
            }
        };

        let mut notices = Vec::new();
        let removed = {
            let mut state = self.state.lock().await;
            let Some(active) = state.session_mut(session_id) else {
                return;
            };
            for message in messages {
                self.ingest_remote(active, message, Source::Poll, &mut notices);
            }
            let removed = match members {
                Some(members) if !members.iter().any(|m| m.id == active.me.id) => true,
                Some(members) => {
                    let me = active.me.clone();
                    active.members = members
                        .into_iter()
                        .map(|m| if m.id == me.id { me.clone() } else { m })
                        .collect();
                    false
                }
                None => false,
            };
            self.publish(&state);
            removed
        };

        for notice in notices {
            self.notify(notice);
        }
        if removed {
            self.on_missing_membership(group_id).await;
        }
    }

    /// Our row vanished while we were not listening: either the group is gone or we
    /// were removed.
    async fn on_missing_membership(&self, group_id: Uuid) {
        let group_gone = matches!(self.store.get_group(group_id).await, Ok(None));
        let Some(ended) = self.end_session().await else {
            return;
        };
        let notice = if group_gone {
            Notice::GroupDeleted {
                group_name: ended.group.name,
                deleted_by: None,
            }
        } else {
            Notice::RemovedFromGroup {
                group_name: ended.group.name,
            }
        };
        info!("Membership of group {} no longer exists.", group_id);
        self.notify(notice);
    }

    //=====================================================================================
    // Presence
    //=====================================================================================

    pub(crate) async fn announce_presence(&self, session_id: Uuid) {
        let (channel, presence) = {
            let mut state = self.state.lock().await;
            let Some(active) = state.session_mut(session_id) else {
                return;
            };
            (
                group_channel(active.group.id),
                Presence {
                    member_id: active.me.id,
                    name: active.me.display_name.clone(),
                    status: active.me.status,
                    streak: active.me.streak,
                    last_seen: Utc::now(),
                },
            )
        };
        if let Err(e) = self.relay.track_presence(&channel, &presence).await {
            debug!("Presence update skipped: {}", e);
        }
    }

    /// Liveness as seen by the relay's presence registry. Informational only.
    pub async fn presence(&self) -> Vec<Presence> {
        let channel = match self.state.lock().await.active.as_ref() {
            Some(active) => group_channel(active.group.id),
            None => return Vec::new(),
        };
        self.relay.presence(&channel).await.unwrap_or_else(|e| {
            debug!("Presence lookup failed: {}", e);
            Vec::new()
        })
    }
}
