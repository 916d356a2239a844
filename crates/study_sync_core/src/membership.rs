//! crates/study_sync_core/src/membership.rs
//!
//! Pure membership rules: display-name collisions on join, the roster and leaderboard
//! views, inactivity cut-offs, and the stable ids used for membership notices.

use crate::domain::{Member, MemberStatus};
use chrono::{DateTime, Duration, NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

/// Groups and members idle longer than this are swept.
pub const INACTIVITY_MINUTES: i64 = 30;
/// Offline members idle longer than this are hidden from the roster.
pub const ROSTER_OFFLINE_MINUTES: i64 = 10;
pub const STREAK_MILESTONE: u32 = 5;

pub fn inactivity_cutoff(now: DateTime<Utc>) -> DateTime<Utc> {
    now - Duration::minutes(INACTIVITY_MINUTES)
}

//=========================================================================================
// Joining
//=========================================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NameResolution {
    /// Nobody in the group uses the name.
    CreateNew,
    /// This identity already has a row under that name; ask "is this you?" before reusing it.
    ConfirmExisting(Member),
    /// Another identity holds the name.
    NameTaken,
}

pub fn resolve_display_name(members: &[Member], identity: Uuid, name: &str) -> NameResolution {
    let name = name.trim();
    // Prefer the caller's own row if several share the name.
    let mut holders = members.iter().filter(|m| m.display_name == name);
    match holders.clone().find(|m| m.auth_identity == identity) {
        Some(own) => NameResolution::ConfirmExisting(own.clone()),
        None if holders.next().is_some() => NameResolution::NameTaken,
        None => NameResolution::CreateNew,
    }
}

/// A row this identity already owns in the group, used to pre-fill the name prompt.
pub fn existing_membership(members: &[Member], identity: Uuid) -> Option<&Member> {
    members
        .iter()
        .filter(|m| m.auth_identity == identity)
        .max_by_key(|m| m.updated_at)
}

//=========================================================================================
// Roster and Leaderboard
//=========================================================================================

/// Everyone else in the group as the local member should see them.
pub fn visible_roster(members: &[Member], me: &Member, now: DateTime<Utc>) -> Vec<Member> {
    let offline_cutoff = now - Duration::minutes(ROSTER_OFFLINE_MINUTES);
    let mut roster: Vec<Member> = Vec::new();
    let mut by_name: HashMap<String, usize> = HashMap::new();

    for member in members {
        if member.id == me.id || member.display_name == me.display_name {
            continue;
        }
        if member.status == MemberStatus::Offline && member.updated_at < offline_cutoff {
            continue;
        }
        match by_name.get(&member.display_name) {
            Some(&index) => {
                if member.updated_at > roster[index].updated_at {
                    roster[index] = member.clone();
                }
            }
            None => {
                by_name.insert(member.display_name.clone(), roster.len());
                roster.push(member.clone());
            }
        }
    }
    roster
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LeaderboardEntry {
    pub name: String,
    pub streak: u32,
    pub is_self: bool,
}

pub fn leaderboard(me: &Member, roster: &[Member]) -> Vec<LeaderboardEntry> {
    let mut entries: Vec<LeaderboardEntry> = std::iter::once(LeaderboardEntry {
        name: me.display_name.clone(),
        streak: me.streak,
        is_self: true,
    })
    .chain(roster.iter().map(|m| LeaderboardEntry {
        name: m.display_name.clone(),
        streak: m.streak,
        is_self: false,
    }))
    .collect();
    entries.sort_by(|a, b| b.streak.cmp(&a.streak));
    entries
}

pub fn is_streak_milestone(streak: u32) -> bool {
    streak > 0 && streak % STREAK_MILESTONE == 0
}

//=========================================================================================
// Stable Notice Ids
//=========================================================================================

/// Logical membership events that several clients may announce independently.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeKey {
    Joined { member_id: Uuid },
    /// Leave, creator removal and inactivity removal all share one key per member row.
    Departed { member_id: Uuid },
    StreakMilestone { member_id: Uuid, streak: u32, day: NaiveDate },
}

impl NoticeKey {
    fn as_key(&self) -> String {
        match self {
            NoticeKey::Joined { member_id } => format!("joined:{}", member_id),
            NoticeKey::Departed { member_id } => format!("departed:{}", member_id),
            NoticeKey::StreakMilestone { member_id, streak, day } => {
                format!("streak:{}:{}:{}", member_id, streak, day)
            }
        }
    }
}

/// Deterministic message id for a notice, identical on every client.
pub fn notice_id(group_id: Uuid, key: NoticeKey) -> Uuid {
    Uuid::new_v5(&group_id, key.as_key().as_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn member(id: u128, identity: u128, name: &str, minutes_ago: i64, status: MemberStatus) -> Member {
        let now = Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap();
        Member {
            id: Uuid::from_u128(id),
            auth_identity: Uuid::from_u128(identity),
            display_name: name.to_string(),
            group_id: Uuid::from_u128(99),
            status,
            streak: id as u32,
            sessions_today: 0,
            created_at: now - Duration::minutes(60),
            updated_at: now - Duration::minutes(minutes_ago),
        }
    }

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 15, 12, 0, 0).unwrap()
    }

    #[test]
    fn name_resolution_is_confirmation_first() {
        let members = vec![
            member(1, 100, "ada", 0, MemberStatus::Online),
            member(2, 200, "bob", 0, MemberStatus::Online),
        ];
        let me = Uuid::from_u128(100);

        assert_eq!(resolve_display_name(&members, me, "cy"), NameResolution::CreateNew);
        assert_eq!(resolve_display_name(&members, me, "bob"), NameResolution::NameTaken);
        assert_eq!(
            resolve_display_name(&members, me, " ada "),
            NameResolution::ConfirmExisting(members[0].clone())
        );
        assert_eq!(existing_membership(&members, me), Some(&members[0]));
    }

    #[test]
    fn roster_hides_self_stale_offline_and_duplicate_names() {
        let me = member(1, 100, "ada", 0, MemberStatus::Online);
        let members = vec![
            me.clone(),
            member(2, 100, "ada", 0, MemberStatus::Online),
            member(3, 200, "bob", 20, MemberStatus::Offline),
            member(4, 300, "cy", 5, MemberStatus::Offline),
            member(5, 400, "dee", 9, MemberStatus::Focus),
            member(6, 500, "dee", 1, MemberStatus::Break),
        ];

        let roster = visible_roster(&members, &me, noon());
        let ids: Vec<u128> = roster.iter().map(|m| m.id.as_u128()).collect();
        assert_eq!(ids, vec![4, 6]);
    }

    #[test]
    fn leaderboard_sorts_by_streak() {
        let me = member(3, 100, "ada", 0, MemberStatus::Online);
        let roster = vec![
            member(1, 200, "bob", 0, MemberStatus::Online),
            member(7, 300, "cy", 0, MemberStatus::Online),
        ];
        let names: Vec<String> = leaderboard(&me, &roster).into_iter().map(|e| e.name).collect();
        assert_eq!(names, vec!["cy", "ada", "bob"]);
    }

    #[test]
    fn notice_ids_are_stable_and_distinct() {
        let group = Uuid::from_u128(1);
        let member_id = Uuid::from_u128(2);
        let joined = notice_id(group, NoticeKey::Joined { member_id });
        assert_eq!(joined, notice_id(group, NoticeKey::Joined { member_id }));
        assert_ne!(joined, notice_id(group, NoticeKey::Departed { member_id }));
        assert_ne!(joined, notice_id(Uuid::from_u128(3), NoticeKey::Joined { member_id }));
    }

    #[test]
    fn milestones_every_five() {
        assert!(!is_streak_milestone(0));
        assert!(!is_streak_milestone(4));
        assert!(is_streak_milestone(5));
        assert!(is_streak_milestone(10));
    }
}
