use std::collections::HashMap;

use crate::models::{ConnectionId, UserId};

/// Which users currently hold a live connection, and on which one.
///
/// Both directions are indexed and kept consistent on every change, so a
/// disconnect resolves its user without scanning. A user has at most one
/// connection; a later `set_online` for the same user wins.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    by_user: HashMap<UserId, ConnectionId>,
    by_connection: HashMap<ConnectionId, UserId>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds `user` to `conn`. Returns `true` when the user was offline before,
    /// i.e. when the change is visible to other users.
    pub fn set_online(&mut self, user: UserId, conn: ConnectionId) -> bool {
        if let Some(previous_user) = self.by_connection.remove(&conn) {
            if previous_user != user {
                self.by_user.remove(&previous_user);
            }
        }

        let was_online = match self.by_user.insert(user.clone(), conn) {
            Some(previous_conn) if previous_conn != conn => {
                self.by_connection.remove(&previous_conn);
                true
            }
            Some(_) => true,
            None => false,
        };
        self.by_connection.insert(conn, user);

        !was_online
    }

    /// Releases whatever user is bound to `conn`. A handle that is unknown or
    /// has been superseded by a newer connection is a no-op.
    pub fn remove(&mut self, conn: ConnectionId) -> Option<UserId> {
        let user = self.by_connection.remove(&conn)?;
        self.by_user.remove(&user);
        Some(user)
    }

    pub fn lookup(&self, user: &UserId) -> Option<ConnectionId> {
        self.by_user.get(user).copied()
    }

    pub fn is_online(&self, user: &UserId) -> bool {
        self.by_user.contains_key(user)
    }

    pub fn online_users(&self) -> impl Iterator<Item = &UserId> {
        self.by_user.keys()
    }
}
