use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::models::{CallId, FriendRequest, FriendRequestView, Message, UserId};

/// Frames a client may send, as `{"event": "...", "data": ...}`.
#[derive(Serialize, Deserialize, Clone, Debug)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ClientEvent {
    UserOnline(UserId),
    SendMessage {
        from: Option<UserId>,
        to: UserId,
        text: String,
    },
    Typing {
        to: UserId,
    },
    StopTyping {
        to: UserId,
    },
    CallUser {
        to: UserId,
        from: Option<UserId>,
        offer: Value,
    },
    AcceptCall {
        to: UserId,
        from: Option<UserId>,
        answer: Value,
        call_id: Option<CallId>,
    },
    IceCandidate {
        to: UserId,
        from: Option<UserId>,
        candidate: Value,
        call_id: Option<CallId>,
    },
    EndCall {
        to: UserId,
        from: Option<UserId>,
        call_id: Option<CallId>,
    },
}

impl ClientEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ClientEvent::UserOnline(_) => "user-online",
            ClientEvent::SendMessage { .. } => "send-message",
            ClientEvent::Typing { .. } => "typing",
            ClientEvent::StopTyping { .. } => "stop-typing",
            ClientEvent::CallUser { .. } => "call-user",
            ClientEvent::AcceptCall { .. } => "accept-call",
            ClientEvent::IceCandidate { .. } => "ice-candidate",
            ClientEvent::EndCall { .. } => "end-call",
        }
    }
}

/// Frames the server pushes to a connection.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum ServerEvent {
    UserStatusChange {
        user_id: UserId,
        online: bool,
    },
    ReceiveMessage(Message),
    MessageSent(Message),
    UserTyping(UserId),
    UserStopTyping(UserId),
    IncomingCall {
        from: UserId,
        offer: Value,
        call_id: CallId,
    },
    CallAccepted {
        from: UserId,
        answer: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    IceCandidate {
        from: UserId,
        candidate: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    CallEnded {
        from: UserId,
        #[serde(skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    CallBusy {
        to: UserId,
    },
    FriendRequestReceived(FriendRequestView),
    FriendRequestAccepted(FriendRequest),
    Error {
        message: String,
    },
}
