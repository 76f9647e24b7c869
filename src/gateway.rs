use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, warn};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use warp::ws::{Message as WsMessage, WebSocket};

use crate::messages::{ClientEvent, ServerEvent};
use crate::models::{CallId, ConnectionId, Message, UserId};
use crate::presence::PresenceRegistry;
use crate::signaling::{self, CallRegistry, OfferOutcome};
use crate::store::MessageStore;

#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Malformed event: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("{0} requires user-online first")]
    NotIdentified(&'static str),
    #[error("User id must not be empty")]
    BlankUserId,
    #[error("Message text must not be empty")]
    EmptyMessage,
}

struct Connection {
    outbound: mpsc::UnboundedSender<ServerEvent>,
    identity: Option<UserId>,
}

type Connections = Arc<RwLock<HashMap<ConnectionId, Connection>>>;

/// Binds realtime connections to users and routes their events.
///
/// Cloning is cheap; every clone shares the same presence, connections, call
/// sessions and message store.
#[derive(Clone)]
pub struct Gateway {
    presence: Arc<RwLock<PresenceRegistry>>,
    connections: Connections,
    calls: Arc<Mutex<CallRegistry>>,
    store: Arc<dyn MessageStore>,
}

impl Gateway {
    pub fn new(store: Arc<dyn MessageStore>, call_ring_timeout: Duration) -> Self {
        Gateway {
            presence: Arc::new(RwLock::new(PresenceRegistry::new())),
            connections: Arc::new(RwLock::new(HashMap::new())),
            calls: Arc::new(Mutex::new(CallRegistry::new(call_ring_timeout))),
            store,
        }
    }

    /// Drives one WebSocket until it closes or fails, then cleans up.
    pub async fn handle_connection(&self, ws: WebSocket) {
        let (conn, mut rx) = self.connect().await;
        let (mut ws_tx, mut ws_rx) = ws.split();

        let writer = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let text = match serde_json::to_string(&event) {
                    Ok(text) => text,
                    Err(e) => {
                        error!("Failed to encode event for {}: {}", conn, e);
                        continue;
                    }
                };
                if let Err(e) = ws_tx.send(WsMessage::text(text)).await {
                    error!("Failed to send WebSocket message to {}: {}", conn, e);
                    break;
                }
            }
            let _ = ws_tx.close().await;
        });

        while let Some(result) = ws_rx.next().await {
            match result {
                Ok(msg) if msg.is_close() => {
                    info!("Received close from {}", conn);
                    break;
                }
                Ok(msg) => {
                    if let Ok(text) = msg.to_str() {
                        self.handle_frame(conn, text).await;
                    }
                }
                Err(e) => {
                    error!("WebSocket error on {}: {}", conn, e);
                    break;
                }
            }
        }

        self.disconnect(conn).await;
        // the outbound sender went away with the connection entry
        if let Err(e) = writer.await {
            error!("Writer task for {} failed: {}", conn, e);
        }
    }

    /// Registers a new, not yet identified connection.
    pub async fn connect(&self) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let conn = ConnectionId::new();
        let (tx, rx) = mpsc::unbounded_channel();
        self.connections.write().await.insert(
            conn,
            Connection {
                outbound: tx,
                identity: None,
            },
        );
        info!("New connection {}", conn);
        (conn, rx)
    }

    /// Decodes and dispatches one text frame. Rejections are reported to the
    /// sending connection only.
    pub async fn handle_frame(&self, conn: ConnectionId, text: &str) {
        let result = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => {
                debug!("{} -> {}", conn, event.name());
                self.dispatch(conn, event).await
            }
            Err(e) => Err(e.into()),
        };

        if let Err(e) = result {
            warn!("Rejected frame from {}: {}", conn, e);
            self.send_to_connection(
                conn,
                ServerEvent::Error {
                    message: e.to_string(),
                },
            )
            .await;
        }
    }

    pub async fn dispatch(&self, conn: ConnectionId, event: ClientEvent) -> Result<(), ProtocolError> {
        if let ClientEvent::UserOnline(user) = event {
            return self.identify(conn, user).await;
        }
        let me = self
            .identity(conn)
            .await
            .ok_or(ProtocolError::NotIdentified(event.name()))?;

        match event {
            ClientEvent::UserOnline(_) => {}
            ClientEvent::SendMessage { from, to, text } => {
                self.send_message(conn, from.unwrap_or(me), to, text).await?;
            }
            ClientEvent::Typing { to } => {
                self.relay(&to, ServerEvent::UserTyping(me)).await;
            }
            ClientEvent::StopTyping { to } => {
                self.relay(&to, ServerEvent::UserStopTyping(me)).await;
            }
            ClientEvent::CallUser { to, from, offer } => {
                self.call_user(conn, from.unwrap_or(me), to, offer).await;
            }
            ClientEvent::AcceptCall {
                to,
                from,
                answer,
                call_id,
            } => {
                let callee = from.unwrap_or(me);
                let call_id = self.calls.lock().await.accept(&callee, &to, call_id);
                self.relay(&to, signaling::call_accepted(callee, answer, call_id))
                    .await;
            }
            ClientEvent::IceCandidate {
                to,
                from,
                candidate,
                call_id,
            } => {
                let sender = from.unwrap_or(me);
                let call_id = self.calls.lock().await.resolve(&sender, &to, call_id);
                self.relay(&to, signaling::ice_candidate(sender, candidate, call_id))
                    .await;
            }
            ClientEvent::EndCall { to, from, call_id } => {
                let sender = from.unwrap_or(me);
                let ended = self.calls.lock().await.end(&sender, &to, call_id);
                let call_id = ended.map(|session| session.id).or(call_id);
                self.relay(&to, ServerEvent::CallEnded { from: sender, call_id })
                    .await;
            }
        }

        Ok(())
    }

    /// Ends a connection. Safe to call more than once.
    pub async fn disconnect(&self, conn: ConnectionId) {
        if self.connections.write().await.remove(&conn).is_none() {
            return;
        }
        info!("Connection {} closed", conn);
        self.release(conn).await;
    }

    pub async fn history(&self, a: &UserId, b: &UserId) -> Vec<Message> {
        self.store.history(a, b).await
    }

    pub async fn is_online(&self, user: &UserId) -> bool {
        self.presence.read().await.is_online(user)
    }

    pub async fn online_count(&self) -> usize {
        self.presence.read().await.online_users().count()
    }

    /// Snapshot of everyone currently online.
    pub async fn online_users(&self) -> HashSet<UserId> {
        self.presence.read().await.online_users().cloned().collect()
    }

    pub async fn connection_count(&self) -> usize {
        self.connections.read().await.len()
    }

    /// Pushes an event to the live connection of `user`. Returns whether the
    /// user was reachable; an offline user is not an error.
    pub async fn relay(&self, to: &UserId, event: ServerEvent) -> bool {
        let Some(conn) = self.presence.read().await.lookup(to) else {
            debug!("Dropped event for offline user {}", to);
            return false;
        };
        self.send_to_connection(conn, event).await
    }

    async fn identity(&self, conn: ConnectionId) -> Option<UserId> {
        self.connections
            .read()
            .await
            .get(&conn)
            .and_then(|connection| connection.identity.clone())
    }

    async fn identify(&self, conn: ConnectionId, user: UserId) -> Result<(), ProtocolError> {
        if user.is_blank() {
            return Err(ProtocolError::BlankUserId);
        }

        let previous = {
            let mut connections = self.connections.write().await;
            let Some(connection) = connections.get_mut(&conn) else {
                return Ok(());
            };
            connection.identity.replace(user.clone())
        };
        if previous.as_ref().is_some_and(|previous| *previous != user) {
            self.release(conn).await;
        }

        let came_online = self.presence.write().await.set_online(user.clone(), conn);
        info!("{} is online on {}", user, conn);
        if came_online {
            self.broadcast(
                Some(conn),
                ServerEvent::UserStatusChange {
                    user_id: user,
                    online: true,
                },
            )
            .await;
        }
        Ok(())
    }

    /// Drops the presence held by `conn`, ends its call and tells everyone.
    async fn release(&self, conn: ConnectionId) {
        let Some(user) = self.presence.write().await.remove(conn) else {
            return;
        };
        info!("{} went offline", user);

        let ended = self.calls.lock().await.leave(&user);
        if let Some(session) = ended {
            if let Some(peer) = session.peer_of(&user) {
                self.relay(
                    peer,
                    ServerEvent::CallEnded {
                        from: user.clone(),
                        call_id: Some(session.id),
                    },
                )
                .await;
            }
        }

        self.broadcast(
            None,
            ServerEvent::UserStatusChange {
                user_id: user,
                online: false,
            },
        )
        .await;
    }

    async fn send_message(
        &self,
        conn: ConnectionId,
        from: UserId,
        to: UserId,
        text: String,
    ) -> Result<(), ProtocolError> {
        if text.trim().is_empty() {
            return Err(ProtocolError::EmptyMessage);
        }
        if to.is_blank() {
            return Err(ProtocolError::BlankUserId);
        }

        let message = self.store.append(from, to, text).await;
        debug!("Stored message {} from {} to {}", message.id, message.from, message.to);
        self.relay(&message.to, ServerEvent::ReceiveMessage(message.clone()))
            .await;
        self.send_to_connection(conn, ServerEvent::MessageSent(message))
            .await;
        Ok(())
    }

    async fn call_user(&self, conn: ConnectionId, caller: UserId, callee: UserId, offer: Value) {
        if !self.is_online(&callee).await {
            debug!("Dropped call from {} to offline user {}", caller, callee);
            return;
        }

        let outcome = self.calls.lock().await.offer(&caller, &callee);
        match outcome {
            OfferOutcome::Busy => {
                info!("{} is busy, rejecting call from {}", callee, caller);
                self.send_to_connection(conn, ServerEvent::CallBusy { to: callee })
                    .await;
            }
            OfferOutcome::Started(call_id) => {
                info!("Call {} started: {} -> {}", call_id, caller, callee);
                let event = signaling::incoming_call(caller.clone(), offer, call_id);
                if !self.relay(&callee, event).await {
                    self.end_unreachable(&caller, &callee, call_id).await;
                }
            }
        }
    }

    async fn end_unreachable(&self, caller: &UserId, callee: &UserId, call_id: CallId) {
        self.calls.lock().await.end(caller, callee, Some(call_id));
    }

    async fn send_to_connection(&self, conn: ConnectionId, event: ServerEvent) -> bool {
        let connections = self.connections.read().await;
        connections
            .get(&conn)
            .is_some_and(|connection| connection.outbound.send(event).is_ok())
    }

    async fn broadcast(&self, except: Option<ConnectionId>, event: ServerEvent) {
        let connections = self.connections.read().await;
        for (id, connection) in connections.iter() {
            if Some(*id) != except {
                let _ = connection.outbound.send(event.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryMessageStore;
    use serde_json::json;

    fn gateway() -> Gateway {
        Gateway::new(
            Arc::new(InMemoryMessageStore::default()),
            Duration::from_secs(60),
        )
    }

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<ServerEvent>) -> Vec<ServerEvent> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn online(
        gateway: &Gateway,
        id: &str,
    ) -> (ConnectionId, mpsc::UnboundedReceiver<ServerEvent>) {
        let (conn, rx) = gateway.connect().await;
        gateway
            .dispatch(conn, ClientEvent::UserOnline(user(id)))
            .await
            .unwrap();
        (conn, rx)
    }

    #[tokio::test]
    async fn message_then_disconnect_then_call_to_offline_peer() {
        let gateway = gateway();
        let (a, mut a_rx) = online(&gateway, "A").await;
        let (b, mut b_rx) = online(&gateway, "B").await;
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerEvent::UserStatusChange {
                user_id: user("B"),
                online: true
            }]
        );
        drain(&mut b_rx);

        gateway
            .dispatch(
                a,
                ClientEvent::SendMessage {
                    from: Some(user("A")),
                    to: user("B"),
                    text: "hi".into(),
                },
            )
            .await
            .unwrap();

        let b_events = drain(&mut b_rx);
        let a_events = drain(&mut a_rx);
        let [ServerEvent::ReceiveMessage(received)] = b_events.as_slice() else {
            panic!("B should receive exactly one message");
        };
        let [ServerEvent::MessageSent(sent)] = a_events.as_slice() else {
            panic!("A should get exactly one acknowledgment");
        };
        assert_eq!(received.text, "hi");
        assert_eq!(received.id, sent.id);
        assert_eq!(gateway.history(&user("A"), &user("B")).await.len(), 1);

        gateway.disconnect(b).await;
        assert_eq!(
            drain(&mut a_rx),
            vec![ServerEvent::UserStatusChange {
                user_id: user("B"),
                online: false
            }]
        );

        gateway
            .dispatch(
                a,
                ClientEvent::CallUser {
                    to: user("B"),
                    from: Some(user("A")),
                    offer: json!({"type": "offer", "sdp": "v=0"}),
                },
            )
            .await
            .unwrap();
        assert!(drain(&mut a_rx).is_empty());
        assert!(!drain(&mut b_rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::IncomingCall { .. })));
    }

    #[tokio::test]
    async fn message_to_offline_user_is_persisted_and_acknowledged() {
        let gateway = gateway();
        let (a, mut a_rx) = online(&gateway, "A").await;
        let (_observer, mut observer_rx) = online(&gateway, "C").await;
        drain(&mut a_rx);

        gateway
            .dispatch(
                a,
                ClientEvent::SendMessage {
                    from: None,
                    to: user("B"),
                    text: "later".into(),
                },
            )
            .await
            .unwrap();

        let events = drain(&mut a_rx);
        assert!(matches!(events.as_slice(), [ServerEvent::MessageSent(m)] if m.from == user("A")));
        assert!(drain(&mut observer_rx).is_empty());
        assert_eq!(gateway.history(&user("B"), &user("A")).await[0].text, "later");
    }

    #[tokio::test]
    async fn double_disconnect_broadcasts_once() {
        let gateway = gateway();
        let (_a, mut a_rx) = online(&gateway, "A").await;
        let (b, _b_rx) = online(&gateway, "B").await;
        drain(&mut a_rx);

        gateway.disconnect(b).await;
        gateway.disconnect(b).await;

        assert_eq!(drain(&mut a_rx).len(), 1);
        assert_eq!(gateway.online_count().await, 1);
        assert_eq!(gateway.connection_count().await, 1);
    }

    #[tokio::test]
    async fn events_before_identification_are_rejected() {
        let gateway = gateway();
        let (conn, mut rx) = gateway.connect().await;

        let err = gateway
            .dispatch(conn, ClientEvent::Typing { to: user("B") })
            .await
            .unwrap_err();
        assert!(matches!(err, ProtocolError::NotIdentified("typing")));

        gateway
            .handle_frame(conn, r#"{"event":"typing","data":{"to":"B"}}"#)
            .await;
        assert!(matches!(drain(&mut rx).as_slice(), [ServerEvent::Error { .. }]));
    }

    #[tokio::test]
    async fn malformed_frames_only_reach_the_sender() {
        let gateway = gateway();
        let (a, mut a_rx) = online(&gateway, "A").await;
        let (_b, mut b_rx) = online(&gateway, "B").await;
        drain(&mut a_rx);
        drain(&mut b_rx);

        gateway.handle_frame(a, "not json").await;
        gateway
            .handle_frame(a, r#"{"event":"send-message","data":{"to":"B"}}"#)
            .await;
        gateway
            .handle_frame(a, r#"{"event":"send-message","data":{"to":"B","text":"   "}}"#)
            .await;

        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 3);
        assert!(events
            .iter()
            .all(|event| matches!(event, ServerEvent::Error { .. })));
        assert!(drain(&mut b_rx).is_empty());
        assert!(gateway.history(&user("A"), &user("B")).await.is_empty());
    }

    #[tokio::test]
    async fn typing_is_relayed_with_sender_id() {
        let gateway = gateway();
        let (a, _a_rx) = online(&gateway, "A").await;
        let (_b, mut b_rx) = online(&gateway, "B").await;

        gateway
            .dispatch(a, ClientEvent::Typing { to: user("B") })
            .await
            .unwrap();
        gateway
            .dispatch(a, ClientEvent::StopTyping { to: user("B") })
            .await
            .unwrap();

        assert_eq!(
            drain(&mut b_rx),
            vec![
                ServerEvent::UserTyping(user("A")),
                ServerEvent::UserStopTyping(user("A"))
            ]
        );
    }

    #[tokio::test]
    async fn reconnect_takes_over_without_status_flapping() {
        let gateway = gateway();
        let (_observer, mut observer_rx) = online(&gateway, "O").await;
        let (old, mut old_rx) = online(&gateway, "A").await;
        let (new, mut new_rx) = online(&gateway, "A").await;

        assert_eq!(drain(&mut observer_rx).len(), 1);

        gateway
            .dispatch(
                new,
                ClientEvent::SendMessage {
                    from: None,
                    to: user("A"),
                    text: "note to self".into(),
                },
            )
            .await
            .unwrap();
        assert!(drain(&mut old_rx)
            .iter()
            .all(|event| !matches!(event, ServerEvent::ReceiveMessage(_))));
        assert_eq!(drain(&mut new_rx).len(), 2);

        gateway.disconnect(old).await;
        assert!(drain(&mut observer_rx).is_empty());
        assert!(gateway.is_online(&user("A")).await);
    }

    #[tokio::test]
    async fn full_call_negotiation_carries_call_id() {
        let gateway = gateway();
        let (a, mut a_rx) = online(&gateway, "A").await;
        let (b, mut b_rx) = online(&gateway, "B").await;
        drain(&mut a_rx);

        gateway
            .dispatch(
                a,
                ClientEvent::CallUser {
                    to: user("B"),
                    from: Some(user("A")),
                    offer: json!({"sdp": "offer"}),
                },
            )
            .await
            .unwrap();
        let b_events = drain(&mut b_rx);
        let [ServerEvent::IncomingCall { from, call_id, .. }] = b_events.as_slice() else {
            panic!("B should be rung once");
        };
        assert_eq!(*from, user("A"));
        let call_id = *call_id;

        gateway
            .dispatch(
                b,
                ClientEvent::AcceptCall {
                    to: user("A"),
                    from: Some(user("B")),
                    answer: json!({"sdp": "answer"}),
                    call_id: None,
                },
            )
            .await
            .unwrap();
        for n in 0..3 {
            gateway
                .dispatch(
                    b,
                    ClientEvent::IceCandidate {
                        to: user("A"),
                        from: None,
                        candidate: json!({ "candidate": n }),
                        call_id: None,
                    },
                )
                .await
                .unwrap();
        }

        let events = drain(&mut a_rx);
        assert_eq!(events.len(), 4);
        assert_eq!(
            events[0],
            ServerEvent::CallAccepted {
                from: user("B"),
                answer: json!({"sdp": "answer"}),
                call_id: Some(call_id)
            }
        );
        assert!(events[1..].iter().all(|event| matches!(
            event,
            ServerEvent::IceCandidate { from, call_id: Some(id), .. } if *from == user("B") && *id == call_id
        )));
    }

    #[tokio::test]
    async fn busy_callee_rejects_second_caller() {
        let gateway = gateway();
        let (a, _a_rx) = online(&gateway, "A").await;
        let (_b, mut b_rx) = online(&gateway, "B").await;
        let (c, mut c_rx) = online(&gateway, "C").await;
        drain(&mut c_rx);

        for caller in [(a, "A"), (c, "C")] {
            gateway
                .dispatch(
                    caller.0,
                    ClientEvent::CallUser {
                        to: user("B"),
                        from: Some(user(caller.1)),
                        offer: json!({}),
                    },
                )
                .await
                .unwrap();
        }

        let incoming: Vec<_> = drain(&mut b_rx)
            .into_iter()
            .filter(|event| matches!(event, ServerEvent::IncomingCall { .. }))
            .collect();
        assert_eq!(incoming.len(), 1);
        assert_eq!(drain(&mut c_rx), vec![ServerEvent::CallBusy { to: user("B") }]);
    }

    #[tokio::test]
    async fn answered_call_without_hang_up_does_not_leave_users_busy() {
        for second_caller in ["B", "C"] {
            let gateway = gateway();
            let (a, mut a_rx) = online(&gateway, "A").await;
            let (b, mut b_rx) = online(&gateway, "B").await;
            let (c, mut c_rx) = online(&gateway, "C").await;

            gateway
                .dispatch(
                    a,
                    ClientEvent::CallUser {
                        to: user("B"),
                        from: None,
                        offer: json!({}),
                    },
                )
                .await
                .unwrap();
            gateway
                .dispatch(
                    b,
                    ClientEvent::AcceptCall {
                        to: user("A"),
                        from: None,
                        answer: json!({}),
                        call_id: None,
                    },
                )
                .await
                .unwrap();
            drain(&mut a_rx);
            drain(&mut b_rx);
            drain(&mut c_rx);

            let (conn, rx) = if second_caller == "B" {
                (b, &mut b_rx)
            } else {
                (c, &mut c_rx)
            };
            gateway
                .dispatch(
                    conn,
                    ClientEvent::CallUser {
                        to: user("A"),
                        from: None,
                        offer: json!({"sdp": second_caller}),
                    },
                )
                .await
                .unwrap();

            assert!(drain(rx).is_empty(), "{second_caller} should not get call-busy");
            assert!(matches!(
                drain(&mut a_rx).as_slice(),
                [ServerEvent::IncomingCall { from, .. }] if *from == user(second_caller)
            ));
        }
    }

    #[tokio::test]
    async fn hanging_up_or_leaving_ends_the_call_for_the_peer() {
        let gateway = gateway();
        let (a, mut a_rx) = online(&gateway, "A").await;
        let (b, mut b_rx) = online(&gateway, "B").await;

        let call = ClientEvent::CallUser {
            to: user("B"),
            from: None,
            offer: json!({}),
        };
        gateway.dispatch(a, call.clone()).await.unwrap();
        gateway
            .dispatch(
                b,
                ClientEvent::EndCall {
                    to: user("A"),
                    from: None,
                    call_id: None,
                },
            )
            .await
            .unwrap();
        assert!(drain(&mut a_rx)
            .iter()
            .any(|event| matches!(event, ServerEvent::CallEnded { from, call_id: Some(_) } if *from == user("B"))));

        gateway.dispatch(a, call).await.unwrap();
        drain(&mut a_rx);
        gateway.disconnect(b).await;
        let events = drain(&mut a_rx);
        assert!(matches!(events[0], ServerEvent::CallEnded { ref from, .. } if *from == user("B")));
        assert!(matches!(events[1], ServerEvent::UserStatusChange { online: false, .. }));
        drain(&mut b_rx);
    }
}
