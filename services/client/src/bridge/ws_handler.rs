//! services/client/src/bridge/ws_handler.rs
//!
//! The WebSocket endpoint the presentation layer connects to. Commands are dispatched
//! to the shared `StudyClient`; snapshots and notices are forwarded back by a
//! dedicated task for as long as the socket is open.

use crate::bridge::protocol::{UiCommand, UiEvent};
use crate::error::SessionResult;
use crate::session::{CreateGroup, StudyClient};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        State, WebSocketUpgrade,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use std::sync::Arc;
use tokio::sync::{broadcast::error::RecvError, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

type WsSender = Arc<Mutex<SplitSink<WebSocket, Message>>>;

/// The handler for upgrading HTTP requests to WebSocket connections.
pub async fn ws_handler(ws: WebSocketUpgrade, State(client): State<StudyClient>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, client))
}

async fn handle_socket(socket: WebSocket, client: StudyClient) {
    info!("Presentation layer connected.");
    let (sender, mut receiver) = socket.split();
    let ws_sender: WsSender = Arc::new(Mutex::new(sender));

    let token = CancellationToken::new();
    let forwarder = tokio::spawn(forward_updates(client.clone(), ws_sender.clone(), token.clone()));

    loop {
        match receiver.next().await {
            Some(Ok(Message::Text(text))) => {
                handle_text_message(text.as_str(), &client, &ws_sender).await;
            }
            Some(Ok(Message::Close(_))) => {
                info!("Presentation layer sent close message.");
                break;
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => {
                warn!("WebSocket receive failed: {}", e);
                break;
            }
            None => {
                info!("Presentation layer disconnected.");
                break;
            }
        }
    }

    token.cancel();
    if let Err(e) = forwarder.await {
        error!("Update forwarder panicked: {:?}", e);
    }
    info!("WebSocket connection closed.");
}

async fn send_event(ws_sender: &WsSender, event: &UiEvent) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).map_err(axum::Error::new)?;
    ws_sender.lock().await.send(Message::Text(json.into())).await
}

/// Pushes the current snapshot, then every later snapshot and notice.
async fn forward_updates(client: StudyClient, ws_sender: WsSender, token: CancellationToken) {
    let mut snapshots = client.subscribe();
    let mut notices = client.notices();

    let initial = UiEvent::Snapshot {
        snapshot: snapshots.borrow_and_update().clone(),
    };
    if send_event(&ws_sender, &initial).await.is_err() {
        return;
    }

    loop {
        let event = tokio::select! {
            _ = token.cancelled() => break,
            changed = snapshots.changed() => match changed {
                Ok(()) => UiEvent::Snapshot {
                    snapshot: snapshots.borrow_and_update().clone(),
                },
                Err(_) => break,
            },
            notice = notices.recv() => match notice {
                Ok(notice) => UiEvent::Notice { notice },
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Presentation layer fell behind on notices.");
                    continue;
                }
                Err(RecvError::Closed) => break,
            },
        };
        if let Err(e) = send_event(&ws_sender, &event).await {
            debug!("Stopped forwarding updates: {}", e);
            break;
        }
    }
}

/// Helper function to dispatch one `UiCommand` and report its outcome.
async fn handle_text_message(text: &str, client: &StudyClient, ws_sender: &WsSender) {
    let command = match serde_json::from_str::<UiCommand>(text) {
        Ok(command) => command,
        Err(e) => {
            warn!("Failed to parse command: {}", e);
            let reply = UiEvent::Error {
                message: "Unrecognised command".to_string(),
            };
            let _ = send_event(ws_sender, &reply).await;
            return;
        }
    };

    let reply = match dispatch(command, client).await {
        Ok(reply) => reply,
        Err(e) if e.is_user_facing() => Some(UiEvent::Error {
            message: e.to_string(),
        }),
        Err(e) => {
            warn!("Command failed quietly: {}", e);
            None
        }
    };
    if let Some(reply) = reply {
        if let Err(e) = send_event(ws_sender, &reply).await {
            debug!("Could not deliver reply: {}", e);
        }
    }
}

async fn dispatch(command: UiCommand, client: &StudyClient) -> SessionResult<Option<UiEvent>> {
    let reply = match command {
        UiCommand::SignUp { email, password } => {
            let identity = client.sign_up(&email, &password).await?;
            Some(UiEvent::SignedIn {
                user_id: identity.id,
                email: identity.email,
            })
        }
        UiCommand::SignIn { email, password } => {
            let identity = client.sign_in(&email, &password).await?;
            Some(UiEvent::SignedIn {
                user_id: identity.id,
                email: identity.email,
            })
        }
        UiCommand::SignOut => {
            client.sign_out().await?;
            Some(UiEvent::SignedOut)
        }
        UiCommand::ResetPassword { email } => {
            client.reset_password(&email).await?;
            None
        }
        UiCommand::CreateGroup {
            name,
            topic,
            is_public,
            display_name,
        } => {
            let group = client
                .create_group(CreateGroup {
                    name,
                    topic,
                    is_public,
                    display_name,
                })
                .await?;
            Some(UiEvent::GroupCreated { group })
        }
        UiCommand::JoinGroup { code } => Some(UiEvent::JoinPrompt {
            prompt: client.join_group(&code).await?,
        }),
        UiCommand::ChooseName { name } => Some(UiEvent::JoinOutcome {
            outcome: client.choose_name(&name).await?,
        }),
        UiCommand::ConfirmExisting => Some(UiEvent::GroupJoined {
            group: client.confirm_existing().await?,
        }),
        UiCommand::RejectExisting => {
            client.reject_existing().await;
            None
        }
        UiCommand::CancelJoin => {
            client.cancel_join().await;
            None
        }
        UiCommand::LeaveGroup => {
            client.leave_group().await?;
            None
        }
        UiCommand::DeleteGroup => {
            client.delete_group().await?;
            None
        }
        UiCommand::RemoveMember { member_id } => {
            client.remove_member(member_id).await?;
            None
        }
        UiCommand::SetSync { enabled } => {
            client.set_sync(enabled).await?;
            None
        }
        UiCommand::ListPublicGroups => Some(UiEvent::PublicGroups {
            groups: client.list_public_groups().await?,
        }),
        UiCommand::SendMessage { text } => {
            client.send_message(&text).await?;
            None
        }
        UiCommand::StartFocus => {
            client.start_focus().await?;
            None
        }
        UiCommand::BackFromBreak => {
            client.back_from_break().await?;
            None
        }
        UiCommand::QuitSession => {
            client.quit_session().await?;
            None
        }
        UiCommand::ResetTimer => {
            client.reset_timer().await?;
            None
        }
        UiCommand::SaveSettings { settings } => {
            client.save_settings(settings).await?;
            None
        }
        UiCommand::SetStudyTarget { target } => {
            client.set_study_target(target).await?;
            None
        }
        UiCommand::AddExam { name, date } => Some(UiEvent::ExamAdded {
            exam: client.add_exam(&name, date).await?,
        }),
        UiCommand::UpdateExam { exam_id, name, date } => {
            client.update_exam(exam_id, &name, date).await?;
            None
        }
        UiCommand::DeleteExam { exam_id } => {
            client.delete_exam(exam_id).await?;
            None
        }
    };
    Ok(reply)
}
