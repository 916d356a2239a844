//! services/client/tests/group_sync.rs
//!
//! Several `StudyClient`s sharing one in-memory store and relay hub, driven under
//! paused time.

use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use std::sync::Arc;
use std::time::Duration;
use study_client_lib::adapters::{InMemoryRelay, InMemoryStore, MemoryAuth, RecordingCues, RelayHub};
use study_client_lib::config::SessionConfig;
use study_client_lib::error::SessionError;
use study_client_lib::session::{
    CreateGroup, GroupView, JoinOutcome, Notice, Ports, SessionSnapshot, StudyClient,
};
use study_sync_core::connectivity::ConnectionState;
use study_sync_core::domain::{Group, Identity, MemberStatus, TimerSettings, TimerState};
use study_sync_core::events::group_channel;
use study_sync_core::membership::{notice_id, NoticeKey};
use study_sync_core::ports::RecordStore;
use study_sync_core::timer::TimerRole;
use tokio::sync::broadcast::{self, error::TryRecvError};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(120);

//=========================================================================================
// Fixture
//=========================================================================================

/// Only the intervals a test drives explicitly stay short.
fn quiet_config() -> SessionConfig {
    SessionConfig {
        heartbeat_interval: Duration::from_secs(3600),
        presence_interval: Duration::from_secs(3600),
        user_sweep_interval: Duration::from_secs(3600),
        group_sweep_interval: Duration::from_secs(3600),
        public_refresh_interval: Duration::from_secs(3600),
        ..SessionConfig::default()
    }
}

struct World {
    store: Arc<InMemoryStore>,
    hub: RelayHub,
}

impl World {
    fn new() -> Self {
        Self {
            store: Arc::new(InMemoryStore::new()),
            hub: RelayHub::new(),
        }
    }

    async fn participant(&self) -> Participant {
        self.participant_as(Identity {
            id: Uuid::new_v4(),
            email: None,
        })
        .await
    }

    async fn participant_as(&self, identity: Identity) -> Participant {
        let relay = self.hub.client();
        let cues = Arc::new(RecordingCues::new());
        let client = StudyClient::new(
            Ports {
                store: self.store.clone(),
                relay: Arc::new(relay.clone()),
                auth: Arc::new(MemoryAuth::signed_in_as(identity)),
                cues: cues.clone(),
            },
            quiet_config(),
        );
        let notices = client.notices();
        client.start().await.unwrap();
        Participant {
            client,
            relay,
            cues,
            notices,
        }
    }
}

struct Participant {
    client: StudyClient,
    relay: InMemoryRelay,
    cues: Arc<RecordingCues>,
    notices: broadcast::Receiver<Notice>,
}

impl Participant {
    async fn create(&self, name: &str, display_name: &str) -> Group {
        self.client
            .create_group(CreateGroup {
                name: name.to_string(),
                topic: String::new(),
                is_public: false,
                display_name: display_name.to_string(),
            })
            .await
            .unwrap()
    }

    async fn join(&self, code: &str, name: &str) {
        self.client.join_group(code).await.unwrap();
        match self.client.choose_name(name).await.unwrap() {
            JoinOutcome::Joined { .. } => {}
            other => panic!("expected to join directly, got {:?}", other),
        }
    }

    async fn wait_until<F>(&self, what: &str, mut check: F) -> SessionSnapshot
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut snapshots = self.client.subscribe();
        let snapshot = match tokio::time::timeout(WAIT, snapshots.wait_for(|s| check(s))).await {
            Ok(Ok(snapshot)) => snapshot.clone(),
            _ => panic!("timed out waiting for {}: {:#?}", what, self.client.snapshot()),
        };
        snapshot
    }

    async fn wait_connected(&self) {
        self.wait_until("the channel to connect", |s| {
            connection(s) == Some(ConnectionState::Connected)
        })
        .await;
    }

    fn group(&self) -> GroupView {
        self.client.snapshot().group.expect("participant is in a group")
    }

    fn take_notices(&mut self) -> Vec<Notice> {
        let mut notices = Vec::new();
        loop {
            match self.notices.try_recv() {
                Ok(notice) => notices.push(notice),
                Err(TryRecvError::Lagged(_)) => continue,
                Err(_) => return notices,
            }
        }
    }
}

/// Lets every task that is already runnable finish its work.
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

fn connection(s: &SessionSnapshot) -> Option<ConnectionState> {
    s.group.as_ref().map(|g| g.connection)
}

fn timer_state(s: &SessionSnapshot) -> Option<TimerState> {
    s.group.as_ref().map(|g| g.timer.state)
}

fn has_text(s: &SessionSnapshot, text: &str) -> bool {
    s.group
        .as_ref()
        .is_some_and(|g| g.messages.iter().any(|e| e.message.text == text))
}

fn count_text(view: &GroupView, text: &str) -> usize {
    view.messages.iter().filter(|e| e.message.text == text).count()
}

fn roster_has(s: &SessionSnapshot, name: &str) -> bool {
    s.group
        .as_ref()
        .is_some_and(|g| g.roster.iter().any(|m| m.display_name == name))
}

fn member_status(s: &SessionSnapshot, name: &str) -> Option<MemberStatus> {
    s.group
        .as_ref()?
        .roster
        .iter()
        .find(|m| m.display_name == name)
        .map(|m| m.status)
}

fn leaderboard_streak(s: &SessionSnapshot, name: &str) -> Option<u32> {
    s.group
        .as_ref()?
        .leaderboard
        .iter()
        .find(|e| e.name == name)
        .map(|e| e.streak)
}

/// The ticking loop follows the start sound.
fn starts_ticking(played: &[&str]) -> bool {
    played.windows(2).any(|pair| pair == ["start", "tick"])
}

fn short_settings() -> TimerSettings {
    TimerSettings {
        focus_minutes: 1,
        short_break_minutes: 2,
        long_break_minutes: 5,
        cycles_before_long_break: 3,
    }
}

fn day(y: i32, m: u32, d: u32) -> NaiveDate {
    NaiveDate::from_ymd_opt(y, m, d).unwrap()
}

//=========================================================================================
// Chat
//=========================================================================================

#[tokio::test(start_paused = true)]
async fn chat_reaches_every_member_once() {
    let world = World::new();
    let mut ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    ada.wait_connected().await;
    bob.wait_connected().await;
    ada.wait_until("Bob on the roster", |s| roster_has(s, "Bob")).await;

    bob.client.send_message("  hello  ").await.unwrap();
    ada.wait_until("Bob's message", |s| has_text(s, "hello")).await;
    bob.wait_until("Bob's copy to be stored", |s| {
        s.group.as_ref().is_some_and(|g| {
            g.messages
                .iter()
                .any(|e| e.message.text == "hello" && !e.pending)
        })
    })
    .await;
    settle().await;

    let view = ada.group();
    assert_eq!(count_text(&view, "hello"), 1);
    assert_eq!(count_text(&view, "👋 Bob joined the group"), 1);
    assert_eq!(count_text(&bob.group(), "hello"), 1);

    let chat: Vec<Notice> = ada
        .take_notices()
        .into_iter()
        .filter(|n| matches!(n, Notice::Message { .. }))
        .collect();
    assert_eq!(
        chat,
        vec![Notice::Message {
            from: "Bob".to_string(),
            text: "hello".to_string(),
        }]
    );
    assert_eq!(ada.cues.count("notification"), 1);
    assert_eq!(bob.cues.count("notification"), 0);
}

#[tokio::test(start_paused = true)]
async fn empty_messages_and_messages_outside_a_group_are_rejected() {
    let world = World::new();
    let ada = world.participant().await;
    assert!(matches!(
        ada.client.send_message("hi").await,
        Err(SessionError::InvalidState(_))
    ));

    ada.create("Algebra", "Ada").await;
    assert!(matches!(
        ada.client.send_message("   ").await,
        Err(SessionError::Validation(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn polling_delivers_when_realtime_paths_are_down() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let mut bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    ada.wait_connected().await;
    bob.wait_connected().await;

    world.store.set_changes_muted(true);
    bob.relay.set_online(false).await;
    bob.wait_until("the channel to drop", |s| {
        connection(s) == Some(ConnectionState::Disconnected)
    })
    .await;

    ada.client.send_message("anyone there?").await.unwrap();
    bob.wait_until("the polled message", |s| has_text(s, "anyone there?"))
        .await;
    settle().await;

    assert_eq!(count_text(&bob.group(), "anyone there?"), 1);
    let chat = bob
        .take_notices()
        .into_iter()
        .filter(|n| matches!(n, Notice::Message { .. }))
        .count();
    assert_eq!(chat, 1);
    assert_eq!(world.hub.subscriber_count(&group_channel(group.id)).await, 1);
}

//=========================================================================================
// Timer
//=========================================================================================

#[tokio::test(start_paused = true)]
async fn replica_mirrors_the_creators_timer() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let mut bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    bob.wait_connected().await;

    assert!(matches!(
        bob.client.start_focus().await,
        Err(SessionError::InvalidState(_))
    ));

    ada.client.start_focus().await.unwrap();
    let snapshot = bob
        .wait_until("the replica to focus", |s| {
            timer_state(s) == Some(TimerState::Focus)
        })
        .await;
    assert_eq!(snapshot.group.unwrap().timer.role, TimerRole::Replica);
    settle().await;

    assert!(bob.take_notices().contains(&Notice::TimerChanged {
        by: "Ada".to_string(),
        state: TimerState::Focus,
    }));
    assert_eq!(bob.cues.count("start"), 1);
    assert!(starts_ticking(&bob.cues.played()));
    assert!(starts_ticking(&ada.cues.played()));
    assert_eq!(bob.group().me.status, MemberStatus::Focus);

    ada.wait_until("Bob focusing on the roster", |s| {
        member_status(s, "Bob") == Some(MemberStatus::Focus)
    })
    .await;
    assert!(has_text(&ada.client.snapshot(), "🎯 Ada started focusing!"));
}

#[tokio::test(start_paused = true)]
async fn late_joiner_asks_for_the_current_timer() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let settings = TimerSettings {
        focus_minutes: 50,
        short_break_minutes: 10,
        long_break_minutes: 20,
        cycles_before_long_break: 4,
    };
    ada.client.save_settings(settings).await.unwrap();
    ada.client.start_focus().await.unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let mut bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    let snapshot = bob
        .wait_until("the creator's settings and state", |s| {
            s.group.as_ref().is_some_and(|g| {
                g.timer.settings == settings && g.timer.state == TimerState::Focus
            })
        })
        .await;
    assert!(snapshot.group.unwrap().timer.seconds_remaining < 50 * 60);
    settle().await;

    assert!(bob.take_notices().contains(&Notice::SettingsChanged {
        by: "Ada".to_string(),
        settings,
    }));
}

#[tokio::test(start_paused = true)]
async fn completing_focus_builds_a_streak_that_quitting_resets() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    ada.client.save_settings(short_settings()).await.unwrap();
    let bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    bob.wait_connected().await;

    ada.client.start_focus().await.unwrap();
    let snapshot = ada
        .wait_until("the break after focus", |s| {
            timer_state(s) == Some(TimerState::Break)
        })
        .await;
    let view = snapshot.group.unwrap();
    assert_eq!(view.me.streak, 1);
    assert_eq!(view.me.sessions_today, 1);
    assert_eq!(view.timer.cycle_count, 1);
    assert!(view.timer.seconds_remaining <= 120);
    assert!(has_text(&ada.client.snapshot(), "🎉 Ada completed focus session #1!"));
    let played = ada.cues.played();
    assert!(played.contains(&"complete"));
    assert!(played.contains(&"break"));

    bob.wait_until("Ada's streak on the leaderboard", |s| {
        leaderboard_streak(s, "Ada") == Some(1) && timer_state(s) == Some(TimerState::Break)
    })
    .await;

    ada.client.back_from_break().await.unwrap();
    ada.client.quit_session().await.unwrap();
    let view = ada.group();
    assert_eq!(view.me.streak, 0);
    assert_eq!(view.timer.state, TimerState::Idle);
    assert!(matches!(
        ada.client.quit_session().await,
        Err(SessionError::InvalidState(_))
    ));

    bob.wait_until("the reset streak", |s| leaderboard_streak(s, "Ada") == Some(0))
        .await;
}

#[tokio::test(start_paused = true)]
async fn replica_recovers_the_timer_after_reconnecting() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    ada.client.start_focus().await.unwrap();
    let bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    bob.wait_until("the replica to focus", |s| {
        timer_state(s) == Some(TimerState::Focus)
    })
    .await;

    bob.relay.set_online(false).await;
    bob.wait_until("the replica to reset", |s| {
        connection(s) == Some(ConnectionState::Disconnected)
            && timer_state(s) == Some(TimerState::Idle)
    })
    .await;
    assert!(bob.cues.played().contains(&"stop"));

    bob.relay.set_online(true).await;
    bob.wait_until("the timer to come back", |s| {
        connection(s) == Some(ConnectionState::Connected)
            && timer_state(s) == Some(TimerState::Focus)
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn opting_out_of_sync_runs_a_private_timer() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    bob.wait_connected().await;
    assert!(!bob.client.running_tasks().await.contains(&"tick"));

    bob.client.set_sync(false).await.unwrap();
    assert_eq!(bob.group().timer.role, TimerRole::Independent);
    assert!(bob.client.running_tasks().await.contains(&"tick"));
    bob.client.start_focus().await.unwrap();
    assert_eq!(bob.group().timer.state, TimerState::Focus);

    ada.client.save_settings(short_settings()).await.unwrap();
    settle().await;
    assert_eq!(bob.group().timer.settings, TimerSettings::default());

    ada.client.start_focus().await.unwrap();
    bob.client.set_sync(true).await.unwrap();
    let snapshot = bob
        .wait_until("the creator's timer", |s| {
            s.group.as_ref().is_some_and(|g| {
                g.timer.role == TimerRole::Replica
                    && g.timer.settings == short_settings()
                    && g.timer.state == TimerState::Focus
            })
        })
        .await;
    assert!(snapshot.group.is_some());
    assert!(!bob.client.running_tasks().await.contains(&"tick"));
}

//=========================================================================================
// Membership
//=========================================================================================

#[tokio::test(start_paused = true)]
async fn deleting_a_group_resets_every_member() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let mut bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    bob.wait_connected().await;
    bob.client.send_message("see you").await.unwrap();
    ada.client.add_exam("Finals", day(2025, 6, 1)).await.unwrap();
    ada.wait_until("Bob's message", |s| has_text(s, "see you")).await;

    assert!(matches!(
        bob.client.delete_group().await,
        Err(SessionError::InvalidState(_))
    ));
    ada.client.delete_group().await.unwrap();
    assert!(ada.client.snapshot().group.is_none());

    bob.wait_until("the session to end", |s| s.group.is_none()).await;
    settle().await;

    let endings = bob
        .take_notices()
        .into_iter()
        .filter(|n| matches!(n, Notice::GroupDeleted { .. } | Notice::RemovedFromGroup { .. }))
        .count();
    assert_eq!(endings, 1);
    assert!(bob.client.running_tasks().await.is_empty());
    assert_eq!(world.store.counts().await, (0, 0, 0, 0));
}

#[tokio::test(start_paused = true)]
async fn names_are_unique_per_group_but_reclaimable_by_their_owner() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let bob_identity = Identity {
        id: Uuid::new_v4(),
        email: Some("bob@example.com".to_string()),
    };
    let bob = world.participant_as(bob_identity.clone()).await;
    bob.join(&group.code, "Bob").await;
    let bob_member = bob.group().me;

    let carol = world.participant().await;
    carol.client.join_group(&group.code.to_lowercase()).await.unwrap();
    assert!(matches!(
        carol.client.choose_name("Bob").await,
        Err(SessionError::Conflict(_))
    ));
    let snapshot = carol.client.snapshot();
    assert!(snapshot.group.is_none());
    assert!(snapshot.pending_join.is_some());
    carol.client.cancel_join().await;
    assert!(carol.client.snapshot().pending_join.is_none());

    let second = world.participant_as(bob_identity).await;
    let prompt = second.client.join_group(&group.code).await.unwrap();
    assert_eq!(prompt.group_name, "Algebra");
    assert_eq!(prompt.suggested_name.as_deref(), Some("Bob"));

    match second.client.choose_name("Bob").await.unwrap() {
        JoinOutcome::NeedsConfirmation { member } => assert_eq!(member.id, bob_member.id),
        other => panic!("expected a confirmation prompt, got {:?}", other),
    }
    assert!(second.client.snapshot().pending_join.unwrap().awaiting_confirmation);

    second.client.reject_existing().await;
    assert!(!second.client.snapshot().pending_join.unwrap().awaiting_confirmation);
    assert!(matches!(
        second.client.confirm_existing().await,
        Err(SessionError::InvalidState(_))
    ));

    second.client.choose_name("Bob").await.unwrap();
    let joined = second.client.confirm_existing().await.unwrap();
    assert_eq!(joined.id, group.id);
    let view = second.group();
    assert_eq!(view.me.id, bob_member.id);
    assert_eq!(count_text(&view, "👋 Welcome back, Bob!"), 1);

    ada.wait_until("the welcome back notice", |s| {
        has_text(s, "👋 Welcome back, Bob!")
    })
    .await;
}

#[tokio::test(start_paused = true)]
async fn unknown_codes_are_rejected() {
    let world = World::new();
    let ada = world.participant().await;
    assert!(matches!(
        ada.client.join_group("ZZZZZZ").await,
        Err(SessionError::Conflict(_))
    ));
    assert!(matches!(
        ada.client.join_group("abc").await,
        Err(SessionError::Validation(_))
    ));
    assert!(matches!(
        ada.client.choose_name("Ada").await,
        Err(SessionError::InvalidState(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn leaving_removes_the_member_everywhere() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    ada.wait_until("Bob on the roster", |s| roster_has(s, "Bob")).await;
    assert!(bob.client.running_tasks().await.contains(&"channel"));

    bob.client.leave_group().await.unwrap();
    assert!(bob.client.snapshot().group.is_none());
    assert!(bob.client.running_tasks().await.is_empty());

    ada.wait_until("Bob to be gone", |s| {
        !roster_has(s, "Bob") && has_text(s, "👋 Bob left the group")
    })
    .await;
    settle().await;
    assert_eq!(count_text(&ada.group(), "👋 Bob left the group"), 1);
    assert_eq!(world.store.counts().await.1, 1);

    bob.client.leave_group().await.unwrap();
}

#[tokio::test(start_paused = true)]
async fn only_the_creator_removes_members() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let mut bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    let carol = world.participant().await;
    carol.join(&group.code, "Carol").await;
    ada.wait_until("everyone on the roster", |s| {
        roster_has(s, "Bob") && roster_has(s, "Carol")
    })
    .await;
    let (bob_id, carol_id) = (bob.group().me.id, carol.group().me.id);

    assert!(matches!(
        bob.client.remove_member(carol_id).await,
        Err(SessionError::InvalidState(_))
    ));
    ada.client.remove_member(bob_id).await.unwrap();

    bob.wait_until("Bob's session to end", |s| s.group.is_none()).await;
    settle().await;
    assert!(bob.take_notices().contains(&Notice::RemovedFromGroup {
        group_name: "Algebra".to_string(),
    }));

    let view = ada.group();
    assert!(!view.roster.iter().any(|m| m.id == bob_id));
    assert_eq!(count_text(&view, "🚫 Bob was removed by Ada"), 1);
    carol.wait_until("Bob to leave Carol's roster", |s| !roster_has(s, "Bob"))
        .await;
}

#[tokio::test(start_paused = true)]
async fn signing_out_leaves_the_group() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    ada.wait_until("Bob on the roster", |s| roster_has(s, "Bob")).await;

    bob.client.sign_out().await.unwrap();
    let snapshot = bob.client.snapshot();
    assert!(!snapshot.signed_in);
    assert!(snapshot.group.is_none());

    ada.wait_until("Bob to be gone", |s| !roster_has(s, "Bob")).await;
    let attempt = bob
        .client
        .create_group(CreateGroup {
            name: "Physics".to_string(),
            topic: String::new(),
            is_public: false,
            display_name: "Bob".to_string(),
        })
        .await;
    assert_eq!(attempt.unwrap_err(), SessionError::Unauthorized);
}

#[tokio::test(start_paused = true)]
async fn public_groups_are_listed_with_their_creator() {
    let world = World::new();
    let ada = world.participant().await;
    let public = ada
        .client
        .create_group(CreateGroup {
            name: "Algebra".to_string(),
            topic: "Linear maps".to_string(),
            is_public: true,
            display_name: "Ada".to_string(),
        })
        .await
        .unwrap();
    let bob = world.participant().await;
    bob.create("Secret club", "Bob").await;

    let browser = world.participant().await;
    let listing = browser.client.list_public_groups().await.unwrap();
    assert_eq!(listing.len(), 1);
    assert_eq!(listing[0].id, public.id);
    assert_eq!(listing[0].code, public.code);
    assert_eq!(listing[0].topic, "Linear maps");
    assert_eq!(listing[0].creator_name, "Ada");
    assert_eq!(browser.client.snapshot().public_groups, listing);
}

//=========================================================================================
// Expiry
//=========================================================================================

#[tokio::test(start_paused = true)]
async fn concurrent_sweeps_remove_an_idle_member_once() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    let zed = world.participant().await;
    zed.join(&group.code, "Zed").await;
    for member in [&ada, &bob] {
        member
            .wait_until("Zed on the roster", |s| roster_has(s, "Zed"))
            .await;
    }

    let zed_id = zed.group().me.id;
    let stale = Utc::now() - ChronoDuration::minutes(31);
    world.store.backdate_member(zed_id, stale).await;
    let (a, b) = tokio::join!(
        ada.client.sweep_inactive_members(),
        bob.client.sweep_inactive_members()
    );
    assert_eq!(a.unwrap() + b.unwrap(), 1);

    zed.wait_until("Zed's session to end", |s| s.group.is_none()).await;
    for member in [&ada, &bob] {
        member
            .wait_until("Zed to be gone", |s| !roster_has(s, "Zed"))
            .await;
    }
    settle().await;

    let departed = notice_id(group.id, NoticeKey::Departed { member_id: zed_id });
    for member in [&ada, &bob] {
        let copies = member
            .group()
            .messages
            .iter()
            .filter(|e| e.message.id == departed)
            .count();
        assert_eq!(copies, 1);
    }
    let stored = world.store.list_messages(group.id, 100).await.unwrap();
    assert_eq!(stored.iter().filter(|m| m.id == departed).count(), 1);

    // A client never sweeps itself.
    world.store.backdate_member(ada.group().me.id, stale).await;
    assert_eq!(ada.client.sweep_inactive_members().await.unwrap(), 0);
    assert!(ada.client.snapshot().group.is_some());
}

#[tokio::test(start_paused = true)]
async fn failed_sweep_keeps_the_member_on_the_roster() {
    let world = World::new();
    let ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    ada.wait_until("Bob on the roster", |s| roster_has(s, "Bob")).await;

    let stale = Utc::now() - ChronoDuration::minutes(31);
    world.store.backdate_member(bob.group().me.id, stale).await;
    world.store.set_fail_writes(true);
    assert_eq!(ada.client.sweep_inactive_members().await.unwrap(), 0);
    assert!(roster_has(&ada.client.snapshot(), "Bob"));

    world.store.set_fail_writes(false);
    assert_eq!(ada.client.sweep_inactive_members().await.unwrap(), 1);
    assert!(!roster_has(&ada.client.snapshot(), "Bob"));
}

#[tokio::test(start_paused = true)]
async fn group_without_its_creator_row_is_discarded() {
    let world = World::new();
    let ada = world.participant().await;

    world.store.set_fail_member_inserts(true);
    let attempt = ada
        .client
        .create_group(CreateGroup {
            name: "Algebra".to_string(),
            topic: String::new(),
            is_public: true,
            display_name: "Ada".to_string(),
        })
        .await;
    assert!(matches!(attempt, Err(SessionError::TransientIo(_))));
    assert_eq!(world.store.counts().await, (0, 0, 0, 0));
    assert!(ada.client.snapshot().group.is_none());

    world.store.set_fail_member_inserts(false);
    ada.create("Algebra", "Ada").await;
    assert_eq!(world.store.counts().await.0, 1);
}

#[tokio::test(start_paused = true)]
async fn group_sweep_spares_the_current_group() {
    let world = World::new();
    let ada = world.participant().await;
    let ours = ada.create("Algebra", "Ada").await;
    let olga = world.participant().await;
    let theirs = olga.create("Physics", "Olga").await;

    let stale = Utc::now() - ChronoDuration::minutes(31);
    world.store.backdate_group(ours.id, stale).await;
    world.store.backdate_group(theirs.id, stale).await;

    assert_eq!(ada.client.sweep_inactive_groups().await.unwrap(), 1);
    assert!(world.store.get_group(ours.id).await.unwrap().is_some());
    assert!(world.store.get_group(theirs.id).await.unwrap().is_none());
    olga.wait_until("Olga's session to end", |s| s.group.is_none())
        .await;
}

//=========================================================================================
// Exams
//=========================================================================================

#[tokio::test(start_paused = true)]
async fn exam_edits_reach_the_group_and_roll_back_on_failure() {
    let world = World::new();
    let mut ada = world.participant().await;
    let group = ada.create("Algebra", "Ada").await;
    let mut bob = world.participant().await;
    bob.join(&group.code, "Bob").await;
    bob.wait_connected().await;

    let finals = ada.client.add_exam("Finals", day(2025, 6, 1)).await.unwrap();
    bob.wait_until("the new exam", |s| {
        s.group
            .as_ref()
            .is_some_and(|g| g.exams.iter().any(|e| e.name == "Finals"))
    })
    .await;

    ada.client
        .update_exam(finals.id, "Finals (room 4)", day(2025, 6, 2))
        .await
        .unwrap();
    bob.wait_until("the renamed exam", |s| {
        s.group
            .as_ref()
            .is_some_and(|g| g.exams.iter().any(|e| e.name == "Finals (room 4)"))
    })
    .await;

    ada.client.delete_exam(finals.id).await.unwrap();
    bob.wait_until("the exam to go", |s| {
        s.group.as_ref().is_some_and(|g| g.exams.is_empty())
    })
    .await;
    settle().await;

    let changed = |notices: Vec<Notice>| notices.into_iter().filter(|n| *n == Notice::ExamsChanged).count();
    assert_eq!(changed(bob.take_notices()), 3);
    assert_eq!(changed(ada.take_notices()), 0);

    assert!(matches!(
        ada.client.add_exam("  ", day(2025, 7, 1)).await,
        Err(SessionError::Validation(_))
    ));

    world.store.set_fail_writes(true);
    assert!(matches!(
        ada.client.add_exam("Midterm", day(2025, 5, 1)).await,
        Err(SessionError::TransientIo(_))
    ));
    world.store.set_fail_writes(false);
    assert!(ada.group().exams.is_empty());
}
