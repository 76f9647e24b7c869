use std::collections::HashMap;
use std::time::{Duration, Instant};

use log::debug;
use serde_json::Value;

use crate::messages::ServerEvent;
use crate::models::{CallId, UserId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallState {
    Ringing,
    Active,
}

#[derive(Debug, Clone)]
pub struct CallSession {
    pub id: CallId,
    pub caller: UserId,
    pub callee: UserId,
    pub state: CallState,
    started_at: Instant,
}

impl CallSession {
    /// The other party of the call, if `user` is part of it.
    pub fn peer_of(&self, user: &UserId) -> Option<&UserId> {
        if *user == self.caller {
            Some(&self.callee)
        } else if *user == self.callee {
            Some(&self.caller)
        } else {
            None
        }
    }

    fn involves_pair(&self, a: &UserId, b: &UserId) -> bool {
        self.peer_of(a) == Some(b)
    }
}

#[derive(Debug, PartialEq, Eq)]
pub enum OfferOutcome {
    Started(CallId),
    Busy,
}

/// Live call negotiations, at most one per user.
#[derive(Debug)]
pub struct CallRegistry {
    sessions: HashMap<CallId, CallSession>,
    by_user: HashMap<UserId, CallId>,
    ring_timeout: Duration,
}

impl CallRegistry {
    pub fn new(ring_timeout: Duration) -> Self {
        CallRegistry {
            sessions: HashMap::new(),
            by_user: HashMap::new(),
            ring_timeout,
        }
    }

    /// Opens a session for `caller -> callee` unless either side is still
    /// ringing with someone else. A repeated offer between the same pair, in
    /// either direction, replaces the old session. An accepted session never
    /// blocks; hang-ups may not reach the server, so a new offer supersedes it.
    pub fn offer(&mut self, caller: &UserId, callee: &UserId) -> OfferOutcome {
        self.expire_ringing(caller);
        self.expire_ringing(callee);

        let busy = [caller, callee]
            .into_iter()
            .filter_map(|user| self.session_of(user))
            .any(|session| session.state == CallState::Ringing && !session.involves_pair(caller, callee));
        if busy {
            return OfferOutcome::Busy;
        }

        for user in [caller, callee] {
            if let Some(id) = self.by_user.get(user).copied() {
                debug!("Call {} superseded by a new offer from {}", id, caller);
                self.remove(id);
            }
        }

        let id = CallId::new();
        self.sessions.insert(
            id,
            CallSession {
                id,
                caller: caller.clone(),
                callee: callee.clone(),
                state: CallState::Ringing,
                started_at: Instant::now(),
            },
        );
        self.by_user.insert(caller.clone(), id);
        self.by_user.insert(callee.clone(), id);
        OfferOutcome::Started(id)
    }

    /// Finds the session `from` and `to` share, by id when the client supplied
    /// one, else by the pair.
    pub fn resolve(&self, from: &UserId, to: &UserId, call_id: Option<CallId>) -> Option<CallId> {
        let session = match call_id {
            Some(id) => self.sessions.get(&id),
            None => self.session_of(from),
        }?;
        session.involves_pair(from, to).then_some(session.id)
    }

    pub fn accept(&mut self, callee: &UserId, caller: &UserId, call_id: Option<CallId>) -> Option<CallId> {
        let id = self.resolve(callee, caller, call_id)?;
        let session = self.sessions.get_mut(&id)?;
        if session.callee == *callee {
            session.state = CallState::Active;
        }
        Some(id)
    }

    pub fn end(&mut self, from: &UserId, to: &UserId, call_id: Option<CallId>) -> Option<CallSession> {
        let id = self.resolve(from, to, call_id)?;
        self.remove(id)
    }

    /// Drops the session of a user who went away, returning it so the peer can
    /// be told.
    pub fn leave(&mut self, user: &UserId) -> Option<CallSession> {
        let id = *self.by_user.get(user)?;
        self.remove(id)
    }

    pub fn session_of(&self, user: &UserId) -> Option<&CallSession> {
        self.by_user.get(user).and_then(|id| self.sessions.get(id))
    }

    fn remove(&mut self, id: CallId) -> Option<CallSession> {
        let session = self.sessions.remove(&id)?;
        self.by_user.remove(&session.caller);
        self.by_user.remove(&session.callee);
        Some(session)
    }

    fn expire_ringing(&mut self, user: &UserId) {
        let expired = self.session_of(user).and_then(|session| {
            (session.state == CallState::Ringing && session.started_at.elapsed() >= self.ring_timeout)
                .then_some(session.id)
        });
        if let Some(id) = expired {
            debug!("Call {} expired while ringing", id);
            self.remove(id);
        }
    }
}

/// Outbound payloads of the relay. Each is addressed to exactly one user.
pub fn incoming_call(from: UserId, offer: Value, call_id: CallId) -> ServerEvent {
    ServerEvent::IncomingCall {
        from,
        offer,
        call_id,
    }
}

pub fn call_accepted(from: UserId, answer: Value, call_id: Option<CallId>) -> ServerEvent {
    ServerEvent::CallAccepted {
        from,
        answer,
        call_id,
    }
}

pub fn ice_candidate(from: UserId, candidate: Value, call_id: Option<CallId>) -> ServerEvent {
    ServerEvent::IceCandidate {
        from,
        candidate,
        call_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user(id: &str) -> UserId {
        UserId::new(id)
    }

    fn registry() -> CallRegistry {
        CallRegistry::new(Duration::from_secs(60))
    }

    #[test]
    fn second_caller_gets_busy() {
        let mut calls = registry();
        assert!(matches!(calls.offer(&user("a"), &user("b")), OfferOutcome::Started(_)));
        assert_eq!(calls.offer(&user("c"), &user("b")), OfferOutcome::Busy);
        // the callee cannot place a parallel call either
        assert_eq!(calls.offer(&user("b"), &user("c")), OfferOutcome::Busy);
    }

    #[test]
    fn repeated_offer_replaces_session() {
        let mut calls = registry();
        let OfferOutcome::Started(first) = calls.offer(&user("a"), &user("b")) else {
            panic!("first offer should start a call");
        };
        let OfferOutcome::Started(second) = calls.offer(&user("a"), &user("b")) else {
            panic!("repeat offer should start a call");
        };
        assert_ne!(first, second);
        assert_eq!(calls.resolve(&user("b"), &user("a"), None), Some(second));
        assert_eq!(calls.resolve(&user("b"), &user("a"), Some(first)), None);

        // the callee offering back replaces the ringing call too
        let OfferOutcome::Started(third) = calls.offer(&user("b"), &user("a")) else {
            panic!("reverse offer should start a call");
        };
        assert_eq!(calls.session_of(&user("a")).map(|s| s.id), Some(third));
        assert_eq!(calls.session_of(&user("a")).map(|s| s.caller.clone()), Some(user("b")));
    }

    #[test]
    fn accept_activates_and_resolves_by_pair() {
        let mut calls = registry();
        let OfferOutcome::Started(id) = calls.offer(&user("a"), &user("b")) else {
            panic!("offer should start a call");
        };
        assert_eq!(calls.accept(&user("b"), &user("a"), None), Some(id));
        assert_eq!(calls.session_of(&user("a")).map(|s| s.state), Some(CallState::Active));

        // wrong pair never resolves
        assert_eq!(calls.accept(&user("c"), &user("a"), Some(id)), None);
    }

    #[test]
    fn leave_returns_session_for_peer_notification() {
        let mut calls = registry();
        calls.offer(&user("a"), &user("b"));
        let session = calls.leave(&user("b")).expect("b was in a call");
        assert_eq!(session.peer_of(&user("b")), Some(&user("a")));
        assert!(calls.session_of(&user("a")).is_none());
        assert!(calls.leave(&user("b")).is_none());
    }

    #[test]
    fn stale_ringing_session_does_not_block_new_calls() {
        let mut calls = CallRegistry::new(Duration::ZERO);
        calls.offer(&user("a"), &user("b"));
        assert!(matches!(calls.offer(&user("c"), &user("b")), OfferOutcome::Started(_)));
        assert!(calls.session_of(&user("a")).is_none());
    }

    #[test]
    fn accepted_call_does_not_block_later_offers() {
        let mut calls = registry();
        let OfferOutcome::Started(first) = calls.offer(&user("a"), &user("b")) else {
            panic!("offer should start a call");
        };
        calls.accept(&user("b"), &user("a"), None);

        // no hang-up reaches the server; the callee calls back
        let OfferOutcome::Started(back) = calls.offer(&user("b"), &user("a")) else {
            panic!("call back should start a call");
        };
        assert_ne!(first, back);
        calls.accept(&user("a"), &user("b"), None);

        assert!(matches!(calls.offer(&user("c"), &user("a")), OfferOutcome::Started(_)));
        assert!(calls.session_of(&user("b")).is_none());
    }

    #[test]
    fn accepted_call_is_still_reported_on_leave() {
        let mut calls = CallRegistry::new(Duration::ZERO);
        let OfferOutcome::Started(id) = calls.offer(&user("a"), &user("b")) else {
            panic!("offer should start a call");
        };
        calls.accept(&user("b"), &user("a"), None);
        let session = calls.leave(&user("a")).expect("accepted call is kept until superseded");
        assert_eq!(session.id, id);
    }

    #[test]
    fn end_by_either_party() {
        let mut calls = registry();
        calls.offer(&user("a"), &user("b"));
        assert!(calls.end(&user("b"), &user("a"), None).is_some());
        assert!(calls.end(&user("a"), &user("b"), None).is_none());
    }
}
