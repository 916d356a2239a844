pub mod auth;
pub mod cues;
pub mod db;
pub mod memory;
pub mod pg_relay;

pub use auth::PgAuth;
pub use cues::{RecordingCues, TracingCues};
pub use db::PgRecordStore;
pub use memory::{InMemoryRelay, InMemoryStore, MemoryAuth, RelayHub};
pub use pg_relay::PgRelay;
