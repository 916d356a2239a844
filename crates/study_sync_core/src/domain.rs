//! crates/study_sync_core/src/domain.rs
//!
//! Defines the core data structures shared by every participant of a study group.
//! Records mirror the shared store's tables; the timer types are session-local and
//! only ever travel over the broadcast relay.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Display name used as the author of system-generated chat messages.
pub const SYSTEM_AUTHOR_NAME: &str = "System";

//=========================================================================================
// Stored Records
//=========================================================================================

/// A study group. `code` is the human-shareable join key, `updated_at` is the
/// liveness heartbeat used by the inactivity sweep.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub topic: String,
    pub creator_id: Uuid,
    pub is_public: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemberStatus {
    Online,
    Focus,
    Break,
    Offline,
}

impl MemberStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            MemberStatus::Online => "online",
            MemberStatus::Focus => "focus",
            MemberStatus::Break => "break",
            MemberStatus::Offline => "offline",
        }
    }
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MemberStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "online" => Ok(MemberStatus::Online),
            "focus" => Ok(MemberStatus::Focus),
            "break" => Ok(MemberStatus::Break),
            "offline" => Ok(MemberStatus::Offline),
            other => Err(format!("unknown member status '{}'", other)),
        }
    }
}

/// A participant's membership row within one group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    pub id: Uuid,
    pub auth_identity: Uuid,
    pub display_name: String,
    pub group_id: Uuid,
    pub status: MemberStatus,
    pub streak: u32,
    pub sessions_today: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A chat message. Immutable once stored; `id` is the dedup key across channels.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub id: Uuid,
    pub author_id: Uuid,
    pub author_name: String,
    pub group_id: Uuid,
    pub text: String,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Exam {
    pub id: Uuid,
    pub owner_id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub date: NaiveDate,
    pub created_at: DateTime<Utc>,
}

//=========================================================================================
// Insert / Update Inputs
//=========================================================================================

#[derive(Debug, Clone)]
pub struct NewGroup {
    pub code: String,
    pub name: String,
    pub topic: String,
    pub creator_id: Uuid,
    pub is_public: bool,
}

#[derive(Debug, Clone)]
pub struct NewMember {
    pub auth_identity: Uuid,
    pub display_name: String,
    pub group_id: Uuid,
}

/// A message to persist. The id is chosen by the sender so that the broadcast copy
/// and the stored row share a dedup key.
#[derive(Debug, Clone)]
pub struct NewMessage {
    pub id: Uuid,
    pub author_id: Uuid,
    pub author_name: String,
    pub group_id: Uuid,
    pub text: String,
    pub is_system: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewExam {
    pub owner_id: Uuid,
    pub group_id: Uuid,
    pub name: String,
    pub date: NaiveDate,
}

/// A partial member update. `None` fields are left untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MemberPatch {
    pub status: Option<MemberStatus>,
    pub streak: Option<u32>,
    pub sessions_today: Option<u32>,
    pub updated_at: Option<DateTime<Utc>>,
}

//=========================================================================================
// Session-local Timer Types
//=========================================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TimerState {
    Idle,
    Focus,
    Break,
    LostInBreak,
}

impl TimerState {
    /// The member status a participant in this timer state reports.
    pub fn member_status(&self) -> MemberStatus {
        match self {
            TimerState::Idle => MemberStatus::Online,
            TimerState::Focus => MemberStatus::Focus,
            TimerState::Break => MemberStatus::Break,
            TimerState::LostInBreak => MemberStatus::Offline,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub state: TimerState,
    pub seconds_remaining: u32,
    pub cycle_count: u32,
}

impl TimerSnapshot {
    pub fn idle(settings: &TimerSettings) -> Self {
        Self {
            state: TimerState::Idle,
            seconds_remaining: settings.focus_seconds(),
            cycle_count: 0,
        }
    }
}

/// Pomodoro durations. The wire names match what existing clients send.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimerSettings {
    #[serde(rename = "focusTime")]
    pub focus_minutes: u32,
    #[serde(rename = "shortBreakTime")]
    pub short_break_minutes: u32,
    #[serde(rename = "longBreakTime")]
    pub long_break_minutes: u32,
    #[serde(rename = "cyclesBeforeLongBreak")]
    pub cycles_before_long_break: u32,
}

impl Default for TimerSettings {
    fn default() -> Self {
        Self {
            focus_minutes: 25,
            short_break_minutes: 3,
            long_break_minutes: 10,
            cycles_before_long_break: 3,
        }
    }
}

/// Longest phase a timer accepts, in minutes.
pub const MAX_PHASE_MINUTES: u32 = 24 * 60;

/// Longest run of cycles before a long break.
pub const MAX_CYCLES_BEFORE_LONG_BREAK: u32 = 100;

impl TimerSettings {
    /// Rejects zero fields and anything above the caps.
    pub fn validate(&self) -> Result<(), String> {
        let fields = [
            ("focusTime", self.focus_minutes, MAX_PHASE_MINUTES),
            ("shortBreakTime", self.short_break_minutes, MAX_PHASE_MINUTES),
            ("longBreakTime", self.long_break_minutes, MAX_PHASE_MINUTES),
            ("cyclesBeforeLongBreak", self.cycles_before_long_break, MAX_CYCLES_BEFORE_LONG_BREAK),
        ];
        for (name, value, max) in fields {
            if value == 0 {
                return Err(format!("{} must be a positive integer", name));
            }
            if value > max {
                return Err(format!("{} must be at most {}", name, max));
            }
        }
        Ok(())
    }

    pub fn focus_seconds(&self) -> u32 {
        minutes_to_seconds(self.focus_minutes)
    }

    /// Length of the break following completed cycle number `cycle`.
    pub fn break_seconds(&self, cycle: u32) -> u32 {
        minutes_to_seconds(self.break_minutes(cycle))
    }

    /// Whether the break following completed cycle number `cycle` is a long one.
    pub fn is_long_break(&self, cycle: u32) -> bool {
        cycle > 0 && cycle % self.cycles_before_long_break == 0
    }

    pub fn break_minutes(&self, cycle: u32) -> u32 {
        if self.is_long_break(cycle) {
            self.long_break_minutes
        } else {
            self.short_break_minutes
        }
    }
}

fn minutes_to_seconds(minutes: u32) -> u32 {
    minutes.saturating_mul(60)
}

//=========================================================================================
// Identity and Presence
//=========================================================================================

/// The signed-in identity as reported by the auth collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: Uuid,
    pub email: Option<String>,
}

/// Liveness information announced into the relay's presence registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Presence {
    pub member_id: Uuid,
    pub name: String,
    pub status: MemberStatus,
    pub streak: u32,
    pub last_seen: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_settings_match_classic_cycle() {
        let s = TimerSettings::default();
        assert_eq!(s.focus_seconds(), 25 * 60);
        assert_eq!(s.break_minutes(1), 3);
        assert_eq!(s.break_minutes(3), 10);
        assert_eq!(s.break_minutes(6), 10);
    }

    #[test]
    fn zero_settings_are_rejected() {
        let s = TimerSettings {
            short_break_minutes: 0,
            ..TimerSettings::default()
        };
        assert!(s.validate().unwrap_err().contains("shortBreakTime"));
        assert!(TimerSettings::default().validate().is_ok());
    }

    #[test]
    fn oversized_settings_are_rejected() {
        let huge = TimerSettings {
            long_break_minutes: 80_000_000,
            ..TimerSettings::default()
        };
        assert!(huge.validate().unwrap_err().contains("longBreakTime"));

        let day = TimerSettings {
            focus_minutes: MAX_PHASE_MINUTES,
            ..TimerSettings::default()
        };
        assert!(day.validate().is_ok());
        assert_eq!(day.focus_seconds(), 86_400);

        let cycles = TimerSettings {
            cycles_before_long_break: MAX_CYCLES_BEFORE_LONG_BREAK + 1,
            ..TimerSettings::default()
        };
        assert!(cycles.validate().is_err());
    }

    #[test]
    fn phase_seconds_saturate_instead_of_wrapping() {
        let s = TimerSettings {
            focus_minutes: u32::MAX,
            ..TimerSettings::default()
        };
        assert_eq!(s.focus_seconds(), u32::MAX);
    }

    #[test]
    fn settings_use_legacy_wire_names() {
        let json = serde_json::to_value(TimerSettings::default()).unwrap();
        assert_eq!(json["focusTime"], 25);
        assert_eq!(json["cyclesBeforeLongBreak"], 3);
    }

    #[test]
    fn timer_state_maps_to_member_status() {
        assert_eq!(TimerState::Idle.member_status(), MemberStatus::Online);
        assert_eq!(TimerState::LostInBreak.member_status(), MemberStatus::Offline);
        assert_eq!(
            serde_json::to_string(&TimerState::LostInBreak).unwrap(),
            "\"lostInBreak\""
        );
    }
}
