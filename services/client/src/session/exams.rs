//! services/client/src/session/exams.rs
//!
//! The group's exam countdown list. Edits are applied locally first, then written;
//! a failed write rolls the local list back. Other clients re-fetch on `exam-update`.

use crate::error::{SessionError, SessionResult};
use crate::session::client::{not_in_group, StudyClient};
use chrono::{NaiveDate, Utc};
use study_sync_core::domain::{Exam, NewExam};
use study_sync_core::events::{group_channel, BroadcastEvent, ExamAction, ExamRef, ExamUpdatePayload};
use tracing::{debug, warn};
use uuid::Uuid;

fn exam_name(name: &str) -> SessionResult<String> {
    let name = name.trim();
    if name.is_empty() {
        return Err(SessionError::Validation("Exam name is empty".to_string()));
    }
    Ok(name.to_string())
}

impl StudyClient {
    pub async fn add_exam(&self, name: &str, date: NaiveDate) -> SessionResult<Exam> {
        let name = exam_name(name)?;
        let (session_id, new_exam, temp_id) = {
            let mut state = self.state.lock().await;
            let active = state.active.as_mut().ok_or_else(not_in_group)?;
            let temp_id = Uuid::new_v4();
            active.exams.push(Exam {
                id: temp_id,
                owner_id: active.me.auth_identity,
                group_id: active.group.id,
                name: name.clone(),
                date,
                created_at: Utc::now(),
            });
            active.sort_exams();
            let new_exam = NewExam {
                owner_id: active.me.auth_identity,
                group_id: active.group.id,
                name,
                date,
            };
            let ids = (active.session_id, new_exam, temp_id);
            self.publish(&state);
            ids
        };

        let stored = self.store.insert_exam(new_exam).await;

        {
            let mut state = self.state.lock().await;
            if let Some(active) = state.session_mut(session_id) {
                active.exams.retain(|e| e.id != temp_id);
                if let Ok(exam) = &stored {
                    active.exams.push(exam.clone());
                    active.sort_exams();
                }
                self.publish(&state);
            }
        }

        let exam = stored?;
        self.announce_exam_change(session_id, ExamAction::Add, &exam).await;
        Ok(exam)
    }

    pub async fn update_exam(&self, exam_id: Uuid, name: &str, date: NaiveDate) -> SessionResult<()> {
        let name = exam_name(name)?;
        let (session_id, updated) = {
            let mut state = self.state.lock().await;
            let active = state.active.as_mut().ok_or_else(not_in_group)?;
            let exam = active
                .exams
                .iter_mut()
                .find(|e| e.id == exam_id)
                .ok_or_else(|| SessionError::DeletionRace(format!("exam {}", exam_id)))?;
            exam.name = name.clone();
            exam.date = date;
            let updated = exam.clone();
            active.sort_exams();
            let session_id = active.session_id;
            self.publish(&state);
            (session_id, updated)
        };

        if let Err(e) = self.store.update_exam(exam_id, &name, date).await {
            self.refresh_exams(session_id).await;
            return Err(e.into());
        }
        self.announce_exam_change(session_id, ExamAction::Update, &updated).await;
        Ok(())
    }

    pub async fn delete_exam(&self, exam_id: Uuid) -> SessionResult<()> {
        let (session_id, removed) = {
            let mut state = self.state.lock().await;
            let active = state.active.as_mut().ok_or_else(not_in_group)?;
            let index = active
                .exams
                .iter()
                .position(|e| e.id == exam_id)
                .ok_or_else(|| SessionError::DeletionRace(format!("exam {}", exam_id)))?;
            let removed = active.exams.remove(index);
            let session_id = active.session_id;
            self.publish(&state);
            (session_id, removed)
        };

        match self.store.delete_exam(exam_id).await {
            Ok(true) => {}
            Ok(false) => debug!(exam = %exam_id, "Exam was already deleted."),
            Err(e) => {
                self.refresh_exams(session_id).await;
                return Err(e.into());
            }
        }
        self.announce_exam_change(session_id, ExamAction::Delete, &removed).await;
        Ok(())
    }

    /// Replaces the local exam list with the store's, ordered by date.
    pub(crate) async fn refresh_exams(&self, session_id: Uuid) {
        let group_id = match self.state.lock().await.session_mut(session_id) {
            Some(active) => active.group.id,
            None => return,
        };
        let exams = match self.store.list_exams(group_id).await {
            Ok(exams) => exams,
            Err(e) => {
                warn!("Could not refresh exams for group {}: {}", group_id, e);
                return;
            }
        };
        let mut state = self.state.lock().await;
        if let Some(active) = state.session_mut(session_id) {
            active.exams = exams;
            active.sort_exams();
            self.publish(&state);
        }
    }

    async fn announce_exam_change(&self, session_id: Uuid, action: ExamAction, exam: &Exam) {
        let (channel, user_id) = match self.state.lock().await.session_mut(session_id) {
            Some(active) => (group_channel(active.group.id), active.me.id),
            None => return,
        };
        let event = BroadcastEvent::ExamUpdate(ExamUpdatePayload {
            action: Some(action),
            exam: Some(ExamRef {
                id: exam.id,
                name: exam.name.clone(),
                date: exam.date.to_string(),
            }),
            user_id: Some(user_id),
        });
        if let Err(e) = self.relay.publish(&channel, event.topic(), event.payload()).await {
            debug!("Exam update broadcast skipped: {}", e);
        }
    }
}
