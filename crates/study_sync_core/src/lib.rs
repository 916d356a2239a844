pub mod code;
pub mod connectivity;
pub mod domain;
pub mod events;
pub mod membership;
pub mod ports;
pub mod reconciler;
pub mod timer;

pub use domain::{
    ChatMessage, Exam, Group, Identity, Member, MemberPatch, MemberStatus, NewExam, NewGroup,
    NewMember, NewMessage, Presence, TimerSettings, TimerSnapshot, TimerState,
};
pub use ports::{
    AuthService, BroadcastRelay, ChangeEvent, ChannelStatus, PortError, PortResult, RecordStore,
    RelayFrame, SessionCues,
};
