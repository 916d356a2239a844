//! services/client/src/session/mod.rs
//!
//! The Group Session Client. `StudyClient` owns one participant's view of a group and
//! keeps it converged with everyone else's over the store and the relay.

mod channel;
mod chat;
pub mod client;
mod exams;
pub mod groups;
mod lifecycle;
pub mod state;
pub mod tasks;
mod timer;

pub use client::{Ports, StudyClient};
pub use groups::{CreateGroup, JoinOutcome, JoinPrompt};
pub use state::{GroupView, Notice, PendingJoinView, PublicGroup, SessionSnapshot, TimerView};
