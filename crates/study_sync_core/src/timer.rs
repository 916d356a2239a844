//! crates/study_sync_core/src/timer.rs
//!
//! The Pomodoro state machine and its role-based replication rules.
//!
//! A `TimerMachine` in the `Authority` or `Independent` role runs its own countdown and
//! decides phase transitions; a `Replica` never counts down and only applies what the
//! group's authority broadcasts. Transitions return `TimerEffect`s instead of performing
//! I/O so the caller can persist, broadcast and play cues without blocking the tick.

use crate::domain::{MemberStatus, TimerSettings, TimerSnapshot, TimerState};
use crate::ports::SessionCues;
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerRole {
    /// The group creator: source of truth for the group's timer.
    Authority,
    /// A non-creator mirroring the authority.
    Replica,
    /// A non-creator running a private timer.
    Independent,
}

impl TimerRole {
    pub fn resolve(is_creator: bool, sync_enabled: bool) -> Self {
        match (is_creator, sync_enabled) {
            (true, _) => TimerRole::Authority,
            (false, true) => TimerRole::Replica,
            (false, false) => TimerRole::Independent,
        }
    }

    pub fn runs_countdown(&self) -> bool {
        !matches!(self, TimerRole::Replica)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cue {
    Start,
    Tick,
    Notification,
    Complete,
    Break { long: bool },
    Stop,
}

impl Cue {
    pub fn play(self, cues: &dyn SessionCues) {
        match self {
            Cue::Start => cues.play_start(),
            Cue::Tick => cues.play_tick(),
            Cue::Notification => cues.play_notification(),
            Cue::Complete => cues.play_complete(),
            Cue::Break { long } => cues.play_break(long),
            Cue::Stop => cues.stop(),
        }
    }
}

/// Something the session must do as a consequence of a transition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TimerEffect {
    /// Persist the local member's status.
    Status(MemberStatus),
    /// A focus phase ran to zero: bump streak and sessions today.
    FocusCompleted { cycle: u32 },
    /// Quit during focus: streak goes back to zero.
    StreakReset,
    SystemMessage(String),
    /// Broadcast a `timer-sync` with the current snapshot. Authority only.
    BroadcastSync,
    /// Broadcast a `settings-change`. Authority only.
    BroadcastSettings(TimerSettings),
    Cue(Cue),
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TimerError {
    #[error("cannot {action} while the timer is {from:?}")]
    InvalidTransition { from: TimerState, action: &'static str },
    #[error("the group timer is controlled by the group creator")]
    ReplicaReadOnly,
    #[error("invalid timer settings: {0}")]
    InvalidSettings(String),
}

#[derive(Debug, Clone)]
pub struct TimerMachine {
    role: TimerRole,
    settings: TimerSettings,
    snapshot: TimerSnapshot,
    last_tick_at: Instant,
    actor_name: String,
    study_target: Option<String>,
}

impl TimerMachine {
    pub fn new(role: TimerRole, settings: TimerSettings, actor_name: impl Into<String>) -> Self {
        Self {
            role,
            settings,
            snapshot: TimerSnapshot::idle(&settings),
            last_tick_at: Instant::now(),
            actor_name: actor_name.into(),
            study_target: None,
        }
    }

    pub fn role(&self) -> TimerRole {
        self.role
    }

    pub fn settings(&self) -> TimerSettings {
        self.settings
    }

    pub fn snapshot(&self) -> TimerSnapshot {
        self.snapshot
    }

    pub fn state(&self) -> TimerState {
        self.snapshot.state
    }

    pub fn last_tick_at(&self) -> Instant {
        self.last_tick_at
    }

    pub fn set_study_target(&mut self, target: Option<String>) {
        self.study_target = target.filter(|t| !t.trim().is_empty());
    }

    /// Changes role. Entering `Replica` drops whatever the local countdown held until the
    /// authority's next sync arrives.
    pub fn set_role(&mut self, role: TimerRole) {
        if role == TimerRole::Replica && self.role != TimerRole::Replica {
            self.snapshot = TimerSnapshot::idle(&self.settings);
            self.last_tick_at = Instant::now();
        }
        self.role = role;
    }

    /// Resets a replica whose sync was lost. Other roles keep running.
    pub fn invalidate_replica(&mut self) -> bool {
        if self.role != TimerRole::Replica {
            return false;
        }
        self.snapshot = TimerSnapshot::idle(&self.settings);
        self.last_tick_at = Instant::now();
        true
    }

    //=====================================================================================
    // Local Intents
    //=====================================================================================

    pub fn start_focus(&mut self) -> Result<Vec<TimerEffect>, TimerError> {
        self.ensure_writable()?;
        self.ensure_state(TimerState::Idle, "start a focus session")?;
        self.enter(TimerState::Focus, self.settings.focus_seconds());
        Ok(self.finish(vec![
            TimerEffect::Cue(Cue::Start),
            TimerEffect::Cue(Cue::Tick),
            TimerEffect::Status(MemberStatus::Focus),
            TimerEffect::SystemMessage(format!(
                "🎯 {} started focusing{}!",
                self.actor_name,
                self.target_suffix()
            )),
        ]))
    }

    pub fn back_from_break(&mut self) -> Result<Vec<TimerEffect>, TimerError> {
        self.ensure_writable()?;
        self.ensure_state(TimerState::Break, "return from break")?;
        self.enter(TimerState::Focus, self.settings.focus_seconds());
        Ok(self.finish(vec![
            TimerEffect::Cue(Cue::Start),
            TimerEffect::Cue(Cue::Tick),
            TimerEffect::Status(MemberStatus::Focus),
            TimerEffect::SystemMessage(format!(
                "✅ {} is back from break! Starting cycle #{}{}",
                self.actor_name,
                self.snapshot.cycle_count + 1,
                self.target_suffix()
            )),
        ]))
    }

    /// Ends the session early. Only a quit during focus costs the streak.
    pub fn quit(&mut self) -> Result<Vec<TimerEffect>, TimerError> {
        self.ensure_writable()?;
        let mut effects = vec![TimerEffect::Cue(Cue::Stop)];
        match self.snapshot.state {
            TimerState::Focus => {
                effects.push(TimerEffect::SystemMessage(format!("❌ {} is out.", self.actor_name)));
                effects.push(TimerEffect::StreakReset);
            }
            TimerState::Break => {}
            from => return Err(TimerError::InvalidTransition { from, action: "quit" }),
        }
        effects.push(TimerEffect::Status(MemberStatus::Online));
        self.go_idle();
        Ok(self.finish(effects))
    }

    pub fn reset(&mut self) -> Result<Vec<TimerEffect>, TimerError> {
        self.ensure_writable()?;
        self.ensure_state(TimerState::LostInBreak, "reset the timer")?;
        self.go_idle();
        Ok(self.finish(vec![
            TimerEffect::Cue(Cue::Stop),
            TimerEffect::Status(MemberStatus::Online),
        ]))
    }

    pub fn save_settings(&mut self, settings: TimerSettings) -> Result<Vec<TimerEffect>, TimerError> {
        self.ensure_writable()?;
        settings.validate().map_err(TimerError::InvalidSettings)?;
        self.adopt_settings(settings);

        let mut effects = Vec::new();
        if self.role == TimerRole::Authority {
            effects.push(TimerEffect::BroadcastSettings(settings));
        }
        effects.push(TimerEffect::SystemMessage(format!(
            "⚙️ Timer Changed by {}: {}min focus, {}min short break, {}min long break after {} cycles",
            self.actor_name,
            settings.focus_minutes,
            settings.short_break_minutes,
            settings.long_break_minutes,
            settings.cycles_before_long_break
        )));
        Ok(effects)
    }

    //=====================================================================================
    // Countdown
    //=====================================================================================

    /// Advances the countdown by one second. Replicas and idle timers do nothing.
    pub fn tick(&mut self, now: Instant) -> Vec<TimerEffect> {
        if !self.role.runs_countdown() {
            return Vec::new();
        }
        match self.snapshot.state {
            TimerState::Focus | TimerState::Break => {}
            TimerState::Idle | TimerState::LostInBreak => return Vec::new(),
        }

        self.snapshot.seconds_remaining = self.snapshot.seconds_remaining.saturating_sub(1);
        self.last_tick_at = now;
        if self.snapshot.seconds_remaining > 0 {
            return Vec::new();
        }

        match self.snapshot.state {
            TimerState::Focus => self.complete_focus(),
            TimerState::Break => self.lose_in_break(),
            _ => Vec::new(),
        }
    }

    fn complete_focus(&mut self) -> Vec<TimerEffect> {
        let cycle = self.snapshot.cycle_count + 1;
        self.snapshot.cycle_count = cycle;
        let long = self.settings.is_long_break(cycle);
        let minutes = self.settings.break_minutes(cycle);
        self.enter(TimerState::Break, self.settings.break_seconds(cycle));

        self.finish(vec![
            TimerEffect::Cue(Cue::Complete),
            TimerEffect::FocusCompleted { cycle },
            TimerEffect::SystemMessage(format!(
                "🎉 {} completed focus session #{}!",
                self.actor_name, cycle
            )),
            TimerEffect::Status(MemberStatus::Break),
            TimerEffect::Cue(Cue::Break { long }),
            TimerEffect::SystemMessage(format!(
                "☕ {} on a {} ({} min)",
                self.actor_name,
                if long { "long break" } else { "short break" },
                minutes
            )),
        ])
    }

    fn lose_in_break(&mut self) -> Vec<TimerEffect> {
        self.enter(TimerState::LostInBreak, 0);
        self.finish(vec![
            TimerEffect::Cue(Cue::Stop),
            TimerEffect::SystemMessage(format!("⚠️ {} lost in break", self.actor_name)),
            TimerEffect::Status(MemberStatus::Offline),
        ])
    }

    //=====================================================================================
    // Replication
    //=====================================================================================

    /// Applies an authority `timer-sync`. Returns the cues to play, empty unless the
    /// state changed.
    pub fn apply_sync(&mut self, snapshot: TimerSnapshot, now: Instant) -> Vec<Cue> {
        if self.role != TimerRole::Replica {
            return Vec::new();
        }
        let previous = self.snapshot.state;
        self.snapshot = snapshot;
        self.last_tick_at = now;
        self.transition_cues(previous)
    }

    /// Applies an authority `timer-tick`, keeping the replicated cycle count.
    pub fn apply_tick(&mut self, state: TimerState, seconds: u32, now: Instant) -> Vec<Cue> {
        if self.role != TimerRole::Replica {
            return Vec::new();
        }
        let previous = self.snapshot.state;
        self.snapshot.state = state;
        self.snapshot.seconds_remaining = seconds;
        self.last_tick_at = now;
        self.transition_cues(previous)
    }

    /// Adopts settings broadcast by the authority. Running countdowns keep their length.
    pub fn apply_remote_settings(&mut self, settings: TimerSettings) -> bool {
        if self.role != TimerRole::Replica || settings.validate().is_err() {
            return false;
        }
        self.adopt_settings(settings);
        true
    }

    fn transition_cues(&self, previous: TimerState) -> Vec<Cue> {
        if previous == self.snapshot.state {
            return Vec::new();
        }
        match self.snapshot.state {
            TimerState::Focus => vec![Cue::Start, Cue::Tick],
            TimerState::Break => vec![Cue::Break {
                long: self.settings.is_long_break(self.snapshot.cycle_count),
            }],
            TimerState::Idle | TimerState::LostInBreak => vec![Cue::Stop],
        }
    }

    //=====================================================================================
    // Display
    //=====================================================================================

    /// Seconds in the current phase when it started.
    pub fn phase_total_seconds(&self) -> u32 {
        match self.snapshot.state {
            TimerState::Idle | TimerState::Focus => self.settings.focus_seconds(),
            TimerState::Break => self.settings.break_seconds(self.snapshot.cycle_count),
            TimerState::LostInBreak => 0,
        }
    }

    /// Fraction of the phase still remaining, interpolated between whole-second ticks.
    /// Purely cosmetic: it never feeds back into `seconds_remaining`.
    pub fn smoothed_progress(&self, now: Instant) -> f64 {
        if self.snapshot.state == TimerState::Idle {
            return 1.0;
        }
        let total = self.phase_total_seconds();
        if total == 0 {
            return 0.0;
        }
        let elapsed = now
            .saturating_duration_since(self.last_tick_at)
            .as_secs_f64()
            .min(1.0);
        let remaining = self.snapshot.seconds_remaining as f64 - elapsed;
        (remaining / total as f64).clamp(0.0, 1.0)
    }

    //=====================================================================================
    // Helpers
    //=====================================================================================

    fn ensure_writable(&self) -> Result<(), TimerError> {
        if self.role == TimerRole::Replica {
            return Err(TimerError::ReplicaReadOnly);
        }
        Ok(())
    }

    fn ensure_state(&self, expected: TimerState, action: &'static str) -> Result<(), TimerError> {
        if self.snapshot.state != expected {
            return Err(TimerError::InvalidTransition {
                from: self.snapshot.state,
                action,
            });
        }
        Ok(())
    }

    fn enter(&mut self, state: TimerState, seconds: u32) {
        self.snapshot.state = state;
        self.snapshot.seconds_remaining = seconds;
        self.last_tick_at = Instant::now();
    }

    fn go_idle(&mut self) {
        self.snapshot = TimerSnapshot::idle(&self.settings);
        self.last_tick_at = Instant::now();
    }

    fn adopt_settings(&mut self, settings: TimerSettings) {
        self.settings = settings;
        if self.snapshot.state == TimerState::Idle {
            self.snapshot.seconds_remaining = settings.focus_seconds();
        }
    }

    fn finish(&self, mut effects: Vec<TimerEffect>) -> Vec<TimerEffect> {
        if self.role == TimerRole::Authority {
            effects.push(TimerEffect::BroadcastSync);
        }
        effects
    }

    fn target_suffix(&self) -> String {
        match &self.study_target {
            Some(target) => format!(" on {}", target),
            None => String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn one_minute() -> TimerSettings {
        TimerSettings {
            focus_minutes: 1,
            short_break_minutes: 2,
            long_break_minutes: 5,
            cycles_before_long_break: 2,
        }
    }

    fn run_seconds(machine: &mut TimerMachine, seconds: u32) -> Vec<TimerEffect> {
        let mut effects = Vec::new();
        for _ in 0..seconds {
            effects.extend(machine.tick(Instant::now()));
        }
        effects
    }

    #[test]
    fn roles_resolve_from_creator_and_sync_flag() {
        assert_eq!(TimerRole::resolve(true, false), TimerRole::Authority);
        assert_eq!(TimerRole::resolve(false, true), TimerRole::Replica);
        assert_eq!(TimerRole::resolve(false, false), TimerRole::Independent);
    }

    #[test]
    fn completed_focus_bumps_cycle_and_starts_short_break() {
        let mut m = TimerMachine::new(TimerRole::Authority, one_minute(), "ada");
        let start = m.start_focus().unwrap();
        assert!(start.contains(&TimerEffect::Status(MemberStatus::Focus)));
        assert!(start.contains(&TimerEffect::BroadcastSync));
        assert_eq!(m.snapshot().seconds_remaining, 60);

        assert!(run_seconds(&mut m, 59).is_empty());
        let effects = run_seconds(&mut m, 1);

        let completions = effects
            .iter()
            .filter(|e| matches!(e, TimerEffect::FocusCompleted { .. }))
            .count();
        assert_eq!(completions, 1);
        assert!(effects.contains(&TimerEffect::FocusCompleted { cycle: 1 }));
        assert!(effects.contains(&TimerEffect::Status(MemberStatus::Break)));
        assert!(effects.contains(&TimerEffect::Cue(Cue::Break { long: false })));
        assert_eq!(
            m.snapshot(),
            TimerSnapshot { state: TimerState::Break, seconds_remaining: 120, cycle_count: 1 }
        );
    }

    #[test]
    fn every_nth_cycle_gets_the_long_break() {
        let mut m = TimerMachine::new(TimerRole::Independent, one_minute(), "ada");
        m.start_focus().unwrap();
        run_seconds(&mut m, 60);
        m.back_from_break().unwrap();
        assert_eq!(m.snapshot().cycle_count, 1);

        let effects = run_seconds(&mut m, 60);
        assert!(effects.contains(&TimerEffect::Cue(Cue::Break { long: true })));
        assert_eq!(m.snapshot().seconds_remaining, 300);
        assert_eq!(m.snapshot().cycle_count, 2);
        // Independent timers never broadcast.
        assert!(!effects.contains(&TimerEffect::BroadcastSync));
    }

    #[test]
    fn unattended_break_ends_lost_without_touching_streak() {
        let mut m = TimerMachine::new(TimerRole::Authority, one_minute(), "ada");
        m.start_focus().unwrap();
        run_seconds(&mut m, 60);
        let effects = run_seconds(&mut m, 120);

        assert_eq!(m.state(), TimerState::LostInBreak);
        assert!(effects.contains(&TimerEffect::Status(MemberStatus::Offline)));
        assert!(!effects.contains(&TimerEffect::StreakReset));

        // Lost timers stay put until reset.
        assert!(run_seconds(&mut m, 10).is_empty());
        let reset = m.reset().unwrap();
        assert!(reset.contains(&TimerEffect::Status(MemberStatus::Online)));
        assert_eq!(m.snapshot(), TimerSnapshot::idle(&one_minute()));
    }

    #[test]
    fn quitting_focus_resets_streak_cycle_and_countdown() {
        let mut m = TimerMachine::new(TimerRole::Authority, one_minute(), "ada");
        m.start_focus().unwrap();
        run_seconds(&mut m, 60);
        m.back_from_break().unwrap();
        run_seconds(&mut m, 5);

        let effects = m.quit().unwrap();
        assert!(effects.contains(&TimerEffect::StreakReset));
        assert!(effects.contains(&TimerEffect::Status(MemberStatus::Online)));
        assert_eq!(
            m.snapshot(),
            TimerSnapshot { state: TimerState::Idle, seconds_remaining: 60, cycle_count: 0 }
        );
    }

    #[test]
    fn quitting_a_break_keeps_streak() {
        let mut m = TimerMachine::new(TimerRole::Independent, one_minute(), "ada");
        m.start_focus().unwrap();
        run_seconds(&mut m, 60);
        let effects = m.quit().unwrap();
        assert!(!effects.contains(&TimerEffect::StreakReset));
        assert_eq!(m.state(), TimerState::Idle);
    }

    #[test]
    fn invalid_intents_are_rejected() {
        let mut m = TimerMachine::new(TimerRole::Authority, one_minute(), "ada");
        assert!(matches!(m.quit(), Err(TimerError::InvalidTransition { .. })));
        assert!(matches!(m.back_from_break(), Err(TimerError::InvalidTransition { .. })));
        m.start_focus().unwrap();
        assert!(matches!(m.start_focus(), Err(TimerError::InvalidTransition { .. })));
    }

    #[test]
    fn replica_never_counts_down_or_accepts_intents() {
        let mut m = TimerMachine::new(TimerRole::Replica, one_minute(), "bob");
        assert_eq!(m.start_focus(), Err(TimerError::ReplicaReadOnly));

        let cue = m.apply_sync(
            TimerSnapshot { state: TimerState::Focus, seconds_remaining: 42, cycle_count: 0 },
            Instant::now(),
        );
        assert_eq!(cue, vec![Cue::Start, Cue::Tick]);
        assert!(run_seconds(&mut m, 5).is_empty());
        assert_eq!(m.snapshot().seconds_remaining, 42);

        // Repeated ticks in the same state do not replay the cue.
        assert!(m.apply_tick(TimerState::Focus, 41, Instant::now()).is_empty());
        assert_eq!(m.snapshot().seconds_remaining, 41);
        assert_eq!(
            m.apply_tick(TimerState::Break, 120, Instant::now()),
            vec![Cue::Break { long: false }]
        );
    }

    #[test]
    fn remote_settings_resize_only_idle_countdown() {
        let mut m = TimerMachine::new(TimerRole::Replica, TimerSettings::default(), "bob");
        let quick = one_minute();
        assert!(m.apply_remote_settings(quick));
        assert_eq!(m.snapshot().seconds_remaining, 60);

        m.apply_sync(
            TimerSnapshot { state: TimerState::Focus, seconds_remaining: 900, cycle_count: 0 },
            Instant::now(),
        );
        m.apply_remote_settings(TimerSettings::default());
        assert_eq!(m.snapshot().seconds_remaining, 900);

        let mut authority = TimerMachine::new(TimerRole::Authority, quick, "ada");
        assert!(!authority.apply_remote_settings(TimerSettings::default()));
    }

    #[test]
    fn authority_settings_are_broadcast() {
        let mut m = TimerMachine::new(TimerRole::Authority, TimerSettings::default(), "ada");
        let effects = m.save_settings(one_minute()).unwrap();
        assert_eq!(effects[0], TimerEffect::BroadcastSettings(one_minute()));
        assert_eq!(m.snapshot().seconds_remaining, 60);

        let bad = TimerSettings { focus_minutes: 0, ..one_minute() };
        assert!(matches!(m.save_settings(bad), Err(TimerError::InvalidSettings(_))));
    }

    #[test]
    fn oversized_settings_are_refused_locally_and_from_peers() {
        let huge = TimerSettings { focus_minutes: 80_000_000, ..TimerSettings::default() };

        let mut replica = TimerMachine::new(TimerRole::Replica, TimerSettings::default(), "bob");
        assert!(!replica.apply_remote_settings(huge));
        assert_eq!(replica.settings(), TimerSettings::default());
        assert_eq!(replica.snapshot().seconds_remaining, 25 * 60);

        let mut authority = TimerMachine::new(TimerRole::Authority, TimerSettings::default(), "ada");
        assert!(matches!(authority.save_settings(huge), Err(TimerError::InvalidSettings(_))));
        assert_eq!(authority.phase_total_seconds(), 25 * 60);
    }

    #[test]
    fn entering_focus_starts_the_ticking_loop_after_the_start_cue() {
        let cues = |effects: &[TimerEffect]| -> Vec<Cue> {
            effects
                .iter()
                .filter_map(|e| match e {
                    TimerEffect::Cue(cue) => Some(*cue),
                    _ => None,
                })
                .collect()
        };

        let mut m = TimerMachine::new(TimerRole::Independent, one_minute(), "cy");
        assert_eq!(cues(&m.start_focus().unwrap()), vec![Cue::Start, Cue::Tick]);
        run_seconds(&mut m, 60);
        assert_eq!(cues(&m.back_from_break().unwrap()), vec![Cue::Start, Cue::Tick]);
    }

    #[test]
    fn switching_into_replica_discards_local_countdown() {
        let mut m = TimerMachine::new(TimerRole::Independent, one_minute(), "bob");
        m.start_focus().unwrap();
        m.set_role(TimerRole::Replica);
        assert_eq!(m.state(), TimerState::Idle);
        assert!(m.tick(Instant::now()).is_empty());
    }

    #[test]
    fn smoothed_progress_interpolates_between_ticks() {
        let mut m = TimerMachine::new(TimerRole::Authority, one_minute(), "ada");
        assert_eq!(m.smoothed_progress(Instant::now()), 1.0);

        m.start_focus().unwrap();
        let base = m.last_tick_at();
        let halfway = m.smoothed_progress(base + Duration::from_millis(500));
        assert!((halfway - 59.5 / 60.0).abs() < 1e-9);
        // Stalled ticks never interpolate past one second.
        let stalled = m.smoothed_progress(base + Duration::from_secs(30));
        assert!((stalled - 59.0 / 60.0).abs() < 1e-9);
        assert_eq!(m.snapshot().seconds_remaining, 60);
    }
}
