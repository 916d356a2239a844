//! services/client/src/adapters/db.rs
//!
//! The PostgreSQL implementation of the `RecordStore` port. Queries are checked at
//! runtime; row changes arrive through the `study_changes` notification channel that
//! the migrations' triggers publish to.

use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream;
use serde::Deserialize;
use sqlx::postgres::PgListener;
use sqlx::{FromRow, PgPool};
use study_sync_core::domain::{
    ChatMessage, Exam, Group, Member, MemberPatch, MemberStatus, NewExam, NewGroup, NewMember,
    NewMessage,
};
use study_sync_core::ports::{ChangeEvent, ChangeStream, PortError, PortResult, RecordStore};
use tracing::{debug, warn};
use uuid::Uuid;

pub const CHANGE_CHANNEL: &str = "study_changes";

const UNIQUE_VIOLATION: &str = "23505";

//=========================================================================================
// The Main Adapter Struct
//=========================================================================================

#[derive(Clone)]
pub struct PgRecordStore {
    pool: PgPool,
}

impl PgRecordStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Applies the embedded migrations.
    pub async fn run_migrations(&self) -> Result<(), sqlx::migrate::MigrateError> {
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

pub(crate) fn port_error(e: sqlx::Error) -> PortError {
    match &e {
        sqlx::Error::RowNotFound => PortError::NotFound(e.to_string()),
        sqlx::Error::Database(db) if db.code().as_deref() == Some(UNIQUE_VIOLATION) => {
            PortError::Conflict(db.message().to_string())
        }
        _ => PortError::Unexpected(e.to_string()),
    }
}

//=========================================================================================
// Database Record Structs
//=========================================================================================

#[derive(FromRow, Deserialize)]
struct GroupRecord {
    id: Uuid,
    code: String,
    name: String,
    topic: String,
    creator_id: Uuid,
    is_public: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl GroupRecord {
    fn to_domain(self) -> Group {
        Group {
            id: self.id,
            code: self.code,
            name: self.name,
            topic: self.topic,
            creator_id: self.creator_id,
            is_public: self.is_public,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow, Deserialize)]
struct MemberRecord {
    id: Uuid,
    auth_identity: Uuid,
    display_name: String,
    group_id: Uuid,
    status: String,
    streak: i32,
    sessions_today: i32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}
impl MemberRecord {
    fn to_domain(self) -> Member {
        let status = self.status.parse().unwrap_or_else(|e| {
            warn!("Member {} has {}; treating as offline.", self.id, e);
            MemberStatus::Offline
        });
        Member {
            id: self.id,
            auth_identity: self.auth_identity,
            display_name: self.display_name,
            group_id: self.group_id,
            status,
            streak: self.streak.max(0) as u32,
            sessions_today: self.sessions_today.max(0) as u32,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

#[derive(FromRow, Deserialize)]
struct MessageRecord {
    id: Uuid,
    author_id: Uuid,
    author_name: String,
    group_id: Uuid,
    text: String,
    is_system: bool,
    created_at: DateTime<Utc>,
}
impl MessageRecord {
    fn to_domain(self) -> ChatMessage {
        ChatMessage {
            id: self.id,
            author_id: self.author_id,
            author_name: self.author_name,
            group_id: self.group_id,
            text: self.text,
            is_system: self.is_system,
            created_at: self.created_at,
        }
    }
}

#[derive(FromRow)]
struct ExamRecord {
    id: Uuid,
    owner_id: Uuid,
    group_id: Uuid,
    name: String,
    date: NaiveDate,
    created_at: DateTime<Utc>,
}
impl ExamRecord {
    fn to_domain(self) -> Exam {
        Exam {
            id: self.id,
            owner_id: self.owner_id,
            group_id: self.group_id,
            name: self.name,
            date: self.date,
            created_at: self.created_at,
        }
    }
}

const GROUP_COLUMNS: &str = "id, code, name, topic, creator_id, is_public, created_at, updated_at";
const MEMBER_COLUMNS: &str =
    "id, auth_identity, display_name, group_id, status, streak, sessions_today, created_at, updated_at";
const MESSAGE_COLUMNS: &str = "id, author_id, author_name, group_id, text, is_system, created_at";
const EXAM_COLUMNS: &str = "id, owner_id, group_id, name, date, created_at";

//=========================================================================================
// Change Notifications
//=========================================================================================

/// The trigger payload: `{"table", "op", "row"}`.
#[derive(Deserialize)]
struct ChangeNotification {
    table: String,
    op: String,
    row: serde_json::Value,
}

fn decode_change(payload: &str) -> Result<Option<ChangeEvent>, serde_json::Error> {
    let note: ChangeNotification = serde_json::from_str(payload)?;
    let change = match (note.table.as_str(), note.op.as_str()) {
        ("messages", "INSERT") => {
            let row: MessageRecord = serde_json::from_value(note.row)?;
            ChangeEvent::MessageInserted(row.to_domain())
        }
        ("members", "INSERT") => {
            let row: MemberRecord = serde_json::from_value(note.row)?;
            ChangeEvent::MemberInserted(row.to_domain())
        }
        ("members", "UPDATE") => {
            let row: MemberRecord = serde_json::from_value(note.row)?;
            ChangeEvent::MemberUpdated(row.to_domain())
        }
        ("members", "DELETE") => {
            let row: MemberRecord = serde_json::from_value(note.row)?;
            ChangeEvent::MemberDeleted {
                id: row.id,
                group_id: row.group_id,
                display_name: row.display_name,
            }
        }
        ("groups", "DELETE") => {
            let row: GroupRecord = serde_json::from_value(note.row)?;
            ChangeEvent::GroupDeleted { id: row.id }
        }
        _ => return Ok(None),
    };
    Ok(Some(change))
}

fn belongs_to(change: &ChangeEvent, group_id: Uuid) -> bool {
    match change {
        ChangeEvent::MessageInserted(message) => message.group_id == group_id,
        ChangeEvent::MemberInserted(member) | ChangeEvent::MemberUpdated(member) => {
            member.group_id == group_id
        }
        ChangeEvent::MemberDeleted { group_id: g, .. } => *g == group_id,
        ChangeEvent::GroupDeleted { id } => *id == group_id,
    }
}

//=========================================================================================
// `RecordStore` Trait Implementation
//=========================================================================================

#[async_trait]
impl RecordStore for PgRecordStore {
    async fn create_group(&self, group: NewGroup) -> PortResult<Group> {
        let record = sqlx::query_as::<_, GroupRecord>(&format!(
            "INSERT INTO groups (id, code, name, topic, creator_id, is_public)
             VALUES ($1, $2, $3, $4, $5, $6)
             RETURNING {}",
            GROUP_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(&group.code)
        .bind(&group.name)
        .bind(&group.topic)
        .bind(group.creator_id)
        .bind(group.is_public)
        .fetch_one(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(record.to_domain())
    }

    async fn get_group(&self, group_id: Uuid) -> PortResult<Option<Group>> {
        let record = sqlx::query_as::<_, GroupRecord>(&format!(
            "SELECT {} FROM groups WHERE id = $1",
            GROUP_COLUMNS
        ))
        .bind(group_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(record.map(GroupRecord::to_domain))
    }

    async fn find_group_by_code(&self, code: &str) -> PortResult<Option<Group>> {
        let record = sqlx::query_as::<_, GroupRecord>(&format!(
            "SELECT {} FROM groups WHERE code = $1",
            GROUP_COLUMNS
        ))
        .bind(code)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(record.map(GroupRecord::to_domain))
    }

    async fn list_public_groups(&self) -> PortResult<Vec<Group>> {
        let records = sqlx::query_as::<_, GroupRecord>(&format!(
            "SELECT {} FROM groups WHERE is_public ORDER BY created_at DESC",
            GROUP_COLUMNS
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(records.into_iter().map(GroupRecord::to_domain).collect())
    }

    async fn list_groups_inactive_since(&self, cutoff: DateTime<Utc>) -> PortResult<Vec<Group>> {
        let records = sqlx::query_as::<_, GroupRecord>(&format!(
            "SELECT {} FROM groups WHERE updated_at < $1",
            GROUP_COLUMNS
        ))
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(records.into_iter().map(GroupRecord::to_domain).collect())
    }

    async fn touch_group(&self, group_id: Uuid, at: DateTime<Utc>) -> PortResult<()> {
        let result = sqlx::query("UPDATE groups SET updated_at = $1 WHERE id = $2")
            .bind(at)
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(port_error)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("group {}", group_id)));
        }
        Ok(())
    }

    async fn delete_group(&self, group_id: Uuid) -> PortResult<bool> {
        let result = sqlx::query("DELETE FROM groups WHERE id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(port_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn create_member(&self, member: NewMember) -> PortResult<Member> {
        let record = sqlx::query_as::<_, MemberRecord>(&format!(
            "INSERT INTO members (id, auth_identity, display_name, group_id)
             VALUES ($1, $2, $3, $4)
             RETURNING {}",
            MEMBER_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(member.auth_identity)
        .bind(&member.display_name)
        .bind(member.group_id)
        .fetch_one(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(record.to_domain())
    }

    async fn get_member(&self, member_id: Uuid) -> PortResult<Option<Member>> {
        let record = sqlx::query_as::<_, MemberRecord>(&format!(
            "SELECT {} FROM members WHERE id = $1",
            MEMBER_COLUMNS
        ))
        .bind(member_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(record.map(MemberRecord::to_domain))
    }

    async fn list_members(&self, group_id: Uuid) -> PortResult<Vec<Member>> {
        let records = sqlx::query_as::<_, MemberRecord>(&format!(
            "SELECT {} FROM members WHERE group_id = $1 ORDER BY created_at, id",
            MEMBER_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(records.into_iter().map(MemberRecord::to_domain).collect())
    }

    async fn list_members_inactive_since(
        &self,
        group_id: Uuid,
        cutoff: DateTime<Utc>,
    ) -> PortResult<Vec<Member>> {
        let records = sqlx::query_as::<_, MemberRecord>(&format!(
            "SELECT {} FROM members WHERE group_id = $1 AND updated_at < $2",
            MEMBER_COLUMNS
        ))
        .bind(group_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(records.into_iter().map(MemberRecord::to_domain).collect())
    }

    async fn display_names_for(&self, identities: &[Uuid]) -> PortResult<Vec<(Uuid, String)>> {
        if identities.is_empty() {
            return Ok(Vec::new());
        }
        sqlx::query_as::<_, (Uuid, String)>(
            "SELECT DISTINCT ON (auth_identity) auth_identity, display_name
             FROM members WHERE auth_identity = ANY($1)
             ORDER BY auth_identity, created_at",
        )
        .bind(identities.to_vec())
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)
    }

    async fn update_member(&self, member_id: Uuid, patch: MemberPatch) -> PortResult<()> {
        let result = sqlx::query(
            "UPDATE members SET
                status = COALESCE($1, status),
                streak = COALESCE($2, streak),
                sessions_today = COALESCE($3, sessions_today),
                updated_at = COALESCE($4, NOW())
             WHERE id = $5",
        )
        .bind(patch.status.map(|s| s.as_str()))
        .bind(patch.streak.map(|s| s as i32))
        .bind(patch.sessions_today.map(|s| s as i32))
        .bind(patch.updated_at)
        .bind(member_id)
        .execute(&self.pool)
        .await
        .map_err(port_error)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("member {}", member_id)));
        }
        Ok(())
    }

    async fn delete_member(&self, member_id: Uuid) -> PortResult<bool> {
        let result = sqlx::query("DELETE FROM members WHERE id = $1")
            .bind(member_id)
            .execute(&self.pool)
            .await
            .map_err(port_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete_members_in_group(&self, group_id: Uuid) -> PortResult<u64> {
        let result = sqlx::query("DELETE FROM members WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(port_error)?;
        Ok(result.rows_affected())
    }

    async fn insert_message(&self, message: NewMessage) -> PortResult<ChatMessage> {
        let record = sqlx::query_as::<_, MessageRecord>(&format!(
            "INSERT INTO messages (id, author_id, author_name, group_id, text, is_system, created_at)
             VALUES ($1, $2, $3, $4, $5, $6, $7)
             RETURNING {}",
            MESSAGE_COLUMNS
        ))
        .bind(message.id)
        .bind(message.author_id)
        .bind(&message.author_name)
        .bind(message.group_id)
        .bind(&message.text)
        .bind(message.is_system)
        .bind(message.created_at)
        .fetch_one(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(record.to_domain())
    }

    async fn list_messages(&self, group_id: Uuid, limit: usize) -> PortResult<Vec<ChatMessage>> {
        let records = sqlx::query_as::<_, MessageRecord>(&format!(
            "SELECT {cols} FROM (
                SELECT {cols} FROM messages WHERE group_id = $1
                ORDER BY created_at DESC LIMIT $2
             ) recent ORDER BY created_at ASC",
            cols = MESSAGE_COLUMNS
        ))
        .bind(group_id)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(records.into_iter().map(MessageRecord::to_domain).collect())
    }

    async fn delete_messages_in_group(&self, group_id: Uuid) -> PortResult<u64> {
        let result = sqlx::query("DELETE FROM messages WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(port_error)?;
        Ok(result.rows_affected())
    }

    async fn insert_exam(&self, exam: NewExam) -> PortResult<Exam> {
        let record = sqlx::query_as::<_, ExamRecord>(&format!(
            "INSERT INTO exams (id, owner_id, group_id, name, date)
             VALUES ($1, $2, $3, $4, $5)
             RETURNING {}",
            EXAM_COLUMNS
        ))
        .bind(Uuid::new_v4())
        .bind(exam.owner_id)
        .bind(exam.group_id)
        .bind(&exam.name)
        .bind(exam.date)
        .fetch_one(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(record.to_domain())
    }

    async fn update_exam(&self, exam_id: Uuid, name: &str, date: NaiveDate) -> PortResult<()> {
        let result = sqlx::query("UPDATE exams SET name = $1, date = $2 WHERE id = $3")
            .bind(name)
            .bind(date)
            .bind(exam_id)
            .execute(&self.pool)
            .await
            .map_err(port_error)?;
        if result.rows_affected() == 0 {
            return Err(PortError::NotFound(format!("exam {}", exam_id)));
        }
        Ok(())
    }

    async fn delete_exam(&self, exam_id: Uuid) -> PortResult<bool> {
        let result = sqlx::query("DELETE FROM exams WHERE id = $1")
            .bind(exam_id)
            .execute(&self.pool)
            .await
            .map_err(port_error)?;
        Ok(result.rows_affected() > 0)
    }

    async fn list_exams(&self, group_id: Uuid) -> PortResult<Vec<Exam>> {
        let records = sqlx::query_as::<_, ExamRecord>(&format!(
            "SELECT {} FROM exams WHERE group_id = $1 ORDER BY date, created_at",
            EXAM_COLUMNS
        ))
        .bind(group_id)
        .fetch_all(&self.pool)
        .await
        .map_err(port_error)?;
        Ok(records.into_iter().map(ExamRecord::to_domain).collect())
    }

    async fn delete_exams_in_group(&self, group_id: Uuid) -> PortResult<u64> {
        let result = sqlx::query("DELETE FROM exams WHERE group_id = $1")
            .bind(group_id)
            .execute(&self.pool)
            .await
            .map_err(port_error)?;
        Ok(result.rows_affected())
    }

    async fn subscribe_changes(&self, group_id: Uuid) -> PortResult<ChangeStream> {
        let mut listener = PgListener::connect_with(&self.pool).await.map_err(port_error)?;
        listener.listen(CHANGE_CHANNEL).await.map_err(port_error)?;
        debug!(group = %group_id, "Listening for store changes.");

        // Ends when the listener's connection drops; the caller re-subscribes.
        let feed = stream::unfold(listener, move |mut listener| async move {
            loop {
                let notification = match listener.try_recv().await {
                    Ok(Some(notification)) => notification,
                    Ok(None) => {
                        warn!("Store change listener lost its connection.");
                        return None;
                    }
                    Err(e) => {
                        warn!("Store change listener failed: {}", e);
                        return None;
                    }
                };
                match decode_change(notification.payload()) {
                    Ok(Some(change)) if belongs_to(&change, group_id) => return Some((change, listener)),
                    Ok(_) => continue,
                    Err(e) => warn!("Ignoring malformed change notification: {}", e),
                }
            }
        });
        Ok(Box::pin(feed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn member_row(group_id: Uuid) -> serde_json::Value {
        json!({
            "id": Uuid::new_v4(),
            "auth_identity": Uuid::new_v4(),
            "display_name": "Ada",
            "group_id": group_id,
            "status": "focus",
            "streak": 4,
            "sessions_today": 2,
            "created_at": "2025-03-01T10:00:00.123456+00:00",
            "updated_at": "2025-03-01T10:05:00+00:00"
        })
    }

    #[test]
    fn decodes_member_updates_from_trigger_payload() {
        let group_id = Uuid::new_v4();
        let payload = json!({"table": "members", "op": "UPDATE", "row": member_row(group_id)});
        match decode_change(&payload.to_string()).unwrap() {
            Some(ChangeEvent::MemberUpdated(member)) => {
                assert_eq!(member.status, MemberStatus::Focus);
                assert_eq!(member.streak, 4);
                assert_eq!(member.group_id, group_id);
            }
            other => panic!("unexpected change: {:?}", other),
        }
    }

    #[test]
    fn member_deletes_keep_the_display_name() {
        let group_id = Uuid::new_v4();
        let payload = json!({"table": "members", "op": "DELETE", "row": member_row(group_id)});
        let change = decode_change(&payload.to_string()).unwrap().unwrap();
        assert!(belongs_to(&change, group_id));
        assert!(matches!(
            change,
            ChangeEvent::MemberDeleted { display_name, .. } if display_name == "Ada"
        ));
    }

    #[test]
    fn unrelated_tables_are_skipped() {
        let payload = json!({"table": "exams", "op": "INSERT", "row": {}});
        assert!(decode_change(&payload.to_string()).unwrap().is_none());
    }

    #[test]
    fn changes_from_other_groups_are_filtered() {
        let payload = json!({"table": "members", "op": "INSERT", "row": member_row(Uuid::new_v4())});
        let change = decode_change(&payload.to_string()).unwrap().unwrap();
        assert!(!belongs_to(&change, Uuid::new_v4()));
    }
}
