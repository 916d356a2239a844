//! services/client/src/bridge/protocol.rs
//!
//! Defines the WebSocket message protocol between the presentation layer and the
//! session client. Every frame is a JSON text message tagged by `type`.

use crate::session::{JoinOutcome, JoinPrompt, Notice, PublicGroup, SessionSnapshot};
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use study_sync_core::domain::{Exam, Group, TimerSettings};
use uuid::Uuid;

//=========================================================================================
// Messages Sent FROM the Presentation Layer TO the Client
//=========================================================================================

/// User intents, one per session operation.
#[derive(Deserialize, Debug)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiCommand {
    SignUp { email: String, password: String },
    SignIn { email: String, password: String },
    SignOut,
    ResetPassword { email: String },

    CreateGroup {
        name: String,
        #[serde(default)]
        topic: String,
        #[serde(default)]
        is_public: bool,
        display_name: String,
    },
    /// Resolves a code; the reply is a `join_prompt` asking for a display name.
    JoinGroup { code: String },
    ChooseName { name: String },
    /// "Yes, that's me" for a name this identity already uses in the group.
    ConfirmExisting,
    RejectExisting,
    CancelJoin,
    LeaveGroup,
    DeleteGroup,
    RemoveMember { member_id: Uuid },
    SetSync { enabled: bool },
    ListPublicGroups,

    SendMessage { text: String },

    StartFocus,
    BackFromBreak,
    QuitSession,
    ResetTimer,
    SaveSettings { settings: TimerSettings },
    SetStudyTarget { target: Option<String> },

    AddExam { name: String, date: NaiveDate },
    UpdateExam { exam_id: Uuid, name: String, date: NaiveDate },
    DeleteExam { exam_id: Uuid },
}

//=========================================================================================
// Messages Sent FROM the Client TO the Presentation Layer
//=========================================================================================

#[derive(Serialize, Debug, Clone)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum UiEvent {
    /// The full view; sent on connect and after every change.
    Snapshot { snapshot: SessionSnapshot },

    /// A transient event to toast or announce.
    Notice { notice: Notice },

    SignedIn { user_id: Uuid, email: Option<String> },
    SignedOut,
    JoinPrompt { prompt: JoinPrompt },
    JoinOutcome { outcome: JoinOutcome },
    GroupCreated { group: Group },
    GroupJoined { group: Group },
    PublicGroups { groups: Vec<PublicGroup> },
    ExamAdded { exam: Exam },

    /// A user-facing failure of the last command.
    Error { message: String },
}
