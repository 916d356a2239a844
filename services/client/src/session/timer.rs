//! services/client/src/session/timer.rs
//!
//! Drives the session's `TimerMachine`: user intents, the 1-second countdown, the
//! authority's tick broadcast and replication requests. Effects returned by the machine
//! are applied to local state under the lock and turned into an outbox of I/O jobs
//! that run after the lock is released.

use crate::error::SessionResult;
use crate::session::client::{clock, not_in_group, StudyClient};
use crate::session::state::ActiveSession;
use chrono::Utc;
use study_sync_core::domain::{ChatMessage, MemberPatch, TimerSettings, TimerState};
use study_sync_core::events::{
    group_channel, BroadcastEvent, LeaderboardUpdatePayload, RequestTimerSyncPayload,
    SettingsChangePayload, TimerSyncPayload, TimerTickPayload,
};
use study_sync_core::membership::{is_streak_milestone, notice_id, NoticeKey};
use study_sync_core::reconciler::Source;
use study_sync_core::timer::{TimerEffect, TimerError, TimerMachine, TimerRole};
use tracing::{debug, warn};
use uuid::Uuid;

/// One piece of deferred I/O produced by a timer transition.
#[derive(Debug)]
pub(crate) enum Job {
    PersistMember { member_id: Uuid, patch: MemberPatch },
    Post(ChatMessage),
    Broadcast(BroadcastEvent),
}

#[derive(Debug)]
pub(crate) struct Outbox {
    channel: String,
    jobs: Vec<Job>,
}

impl Outbox {
    pub(crate) fn new(group_id: Uuid) -> Self {
        Self {
            channel: group_channel(group_id),
            jobs: Vec::new(),
        }
    }

    pub(crate) fn push(&mut self, job: Job) {
        self.jobs.push(job);
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }
}

pub(crate) fn sync_event(active: &ActiveSession) -> BroadcastEvent {
    let snapshot = active.timer.snapshot();
    BroadcastEvent::TimerSync(TimerSyncPayload {
        timer_state: snapshot.state,
        seconds: snapshot.seconds_remaining,
        cycle_count: snapshot.cycle_count,
        changed_by_id: Some(active.me.id),
        changed_by_name: Some(active.me.display_name.clone()),
    })
}

pub(crate) fn settings_event(active: &ActiveSession, settings: TimerSettings) -> BroadcastEvent {
    BroadcastEvent::SettingsChange(SettingsChangePayload {
        settings,
        changed_by_id: Some(active.me.id),
        changed_by_name: Some(active.me.display_name.clone()),
    })
}

fn leaderboard_event(active: &ActiveSession) -> BroadcastEvent {
    BroadcastEvent::LeaderboardUpdate(LeaderboardUpdatePayload {
        user_id: active.me.id,
        user_name: active.me.display_name.clone(),
        new_streak: active.me.streak,
        status: active.me.status,
    })
}

pub(crate) fn streak_text(name: &str, streak: u32) -> String {
    format!("🔥 {} hit a {}-session streak!", name, streak)
}

impl StudyClient {
    //=====================================================================================
    // Intents
    //=====================================================================================

    pub async fn start_focus(&self) -> SessionResult<()> {
        self.run_intent(TimerMachine::start_focus).await
    }

    pub async fn back_from_break(&self) -> SessionResult<()> {
        self.run_intent(TimerMachine::back_from_break).await
    }

    /// Ends the session early. Quitting during focus costs the streak.
    pub async fn quit_session(&self) -> SessionResult<()> {
        self.run_intent(TimerMachine::quit).await
    }

    pub async fn reset_timer(&self) -> SessionResult<()> {
        self.run_intent(TimerMachine::reset).await
    }

    pub async fn save_settings(&self, settings: TimerSettings) -> SessionResult<()> {
        self.run_intent(move |timer| timer.save_settings(settings)).await
    }

    /// What the local member is studying; mentioned in focus announcements.
    pub async fn set_study_target(&self, target: Option<String>) -> SessionResult<()> {
        let mut state = self.state.lock().await;
        let active = state.active.as_mut().ok_or_else(not_in_group)?;
        active.timer.set_study_target(target);
        Ok(())
    }

    async fn run_intent<F>(&self, intent: F) -> SessionResult<()>
    where
        F: FnOnce(&mut TimerMachine) -> Result<Vec<TimerEffect>, TimerError>,
    {
        let outbox = {
            let mut state = self.state.lock().await;
            let active = state.active.as_mut().ok_or_else(not_in_group)?;
            let effects = intent(&mut active.timer)?;
            let outbox = self.apply_effects(active, effects);
            self.publish(&state);
            outbox
        };
        self.run_jobs(outbox).await;
        Ok(())
    }

    //=====================================================================================
    // Effects
    //=====================================================================================

    /// Applies the local half of each effect and queues the rest.
    pub(crate) fn apply_effects(&self, active: &mut ActiveSession, effects: Vec<TimerEffect>) -> Outbox {
        let mut outbox = Outbox::new(active.group.id);
        let now = Utc::now();

        for effect in effects {
            match effect {
                TimerEffect::Status(status) => {
                    active.me.status = status;
                    active.me.updated_at = now;
                    outbox.push(Job::PersistMember {
                        member_id: active.me.id,
                        patch: MemberPatch {
                            status: Some(status),
                            updated_at: Some(now),
                            ..MemberPatch::default()
                        },
                    });
                }
                TimerEffect::FocusCompleted { cycle } => {
                    active.me.streak += 1;
                    active.me.sessions_today += 1;
                    debug!(cycle, streak = active.me.streak, "Focus session completed.");
                    outbox.push(Job::PersistMember {
                        member_id: active.me.id,
                        patch: MemberPatch {
                            streak: Some(active.me.streak),
                            sessions_today: Some(active.me.sessions_today),
                            updated_at: Some(now),
                            ..MemberPatch::default()
                        },
                    });
                    outbox.push(Job::Broadcast(leaderboard_event(active)));
                    if is_streak_milestone(active.me.streak) {
                        let key = NoticeKey::StreakMilestone {
                            member_id: active.me.id,
                            streak: active.me.streak,
                            day: now.date_naive(),
                        };
                        let id = notice_id(active.group.id, key);
                        let text = streak_text(&active.me.display_name, active.me.streak);
                        self.queue_system_message(active, &mut outbox, id, text);
                    }
                }
                TimerEffect::StreakReset => {
                    active.me.streak = 0;
                    outbox.push(Job::PersistMember {
                        member_id: active.me.id,
                        patch: MemberPatch {
                            streak: Some(0),
                            updated_at: Some(now),
                            ..MemberPatch::default()
                        },
                    });
                    outbox.push(Job::Broadcast(leaderboard_event(active)));
                }
                TimerEffect::SystemMessage(text) => {
                    self.queue_system_message(active, &mut outbox, Uuid::new_v4(), text);
                }
                TimerEffect::BroadcastSync => outbox.push(Job::Broadcast(sync_event(active))),
                TimerEffect::BroadcastSettings(settings) => {
                    outbox.push(Job::Broadcast(settings_event(active, settings)))
                }
                TimerEffect::Cue(cue) => cue.play(self.cues.as_ref()),
            }
        }
        active.upsert_member(active.me.clone());
        outbox
    }

    fn queue_system_message(&self, active: &mut ActiveSession, outbox: &mut Outbox, id: Uuid, text: String) {
        let message = self.system_message_for(&active.group, &active.me, id, text);
        active.messages.ingest(message.clone(), Source::Local);
        outbox.push(Job::Post(message));
    }

    pub(crate) async fn run_jobs(&self, outbox: Outbox) {
        for job in outbox.jobs {
            match job {
                Job::PersistMember { member_id, patch } => {
                    if let Err(e) = self.store.update_member(member_id, patch).await {
                        warn!("Could not persist member {}: {}", member_id, e);
                    }
                }
                Job::Post(message) => {
                    if let Err(e) = self.deliver(&outbox.channel, &message).await {
                        warn!("Could not store system message {}: {}", message.id, e);
                    }
                }
                Job::Broadcast(event) => {
                    if let Err(e) = self
                        .relay
                        .publish(&outbox.channel, event.topic(), event.payload())
                        .await
                    {
                        debug!("Broadcast of {} skipped: {}", event.topic(), e);
                    }
                }
            }
        }
    }

    //=====================================================================================
    // Scheduled Work
    //=====================================================================================

    /// One countdown step. I/O is spawned so a slow store never delays the next tick.
    pub(crate) async fn tick_once(&self, session_id: Uuid) {
        let outbox = {
            let mut state = self.state.lock().await;
            let Some(active) = state.session_mut(session_id) else {
                return;
            };
            let effects = active.timer.tick(clock());
            let outbox = self.apply_effects(active, effects);
            self.publish(&state);
            outbox
        };
        if !outbox.is_empty() {
            let client = self.clone();
            tokio::spawn(async move { client.run_jobs(outbox).await });
        }
    }

    /// Authority only: tells replicas where the countdown is while it runs.
    pub(crate) async fn broadcast_tick(&self, session_id: Uuid) {
        let (channel, event) = {
            let mut state = self.state.lock().await;
            let Some(active) = state.session_mut(session_id) else {
                return;
            };
            let snapshot = active.timer.snapshot();
            if active.timer.role() != TimerRole::Authority || snapshot.state == TimerState::Idle {
                return;
            }
            (
                group_channel(active.group.id),
                BroadcastEvent::TimerTick(TimerTickPayload {
                    seconds: snapshot.seconds_remaining,
                    timer_state: snapshot.state,
                }),
            )
        };
        if let Err(e) = self.relay.publish(&channel, event.topic(), event.payload()).await {
            debug!("Timer tick broadcast skipped: {}", e);
        }
    }

    /// Replica only: asks the authority for a fresh `timer-sync`.
    pub(crate) async fn request_timer_sync(&self, session_id: Uuid) {
        let (channel, event) = {
            let mut state = self.state.lock().await;
            let Some(active) = state.session_mut(session_id) else {
                return;
            };
            if active.timer.role() != TimerRole::Replica {
                return;
            }
            (
                group_channel(active.group.id),
                BroadcastEvent::RequestTimerSync(RequestTimerSyncPayload {
                    requester_id: active.me.id,
                    requester_name: active.me.display_name.clone(),
                }),
            )
        };
        if let Err(e) = self.relay.publish(&channel, event.topic(), event.payload()).await {
            debug!("Timer sync request skipped: {}", e);
        }
    }
}
