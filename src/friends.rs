use std::collections::{HashMap, HashSet};

use chrono::Utc;

use crate::models::{FriendRequest, RequestId, RequestStatus, UserId};
use crate::users::DirectoryError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Response {
    Accept,
    Reject,
}

impl std::str::FromStr for Response {
    type Err = DirectoryError;

    fn from_str(action: &str) -> Result<Self, Self::Err> {
        match action {
            "accept" => Ok(Response::Accept),
            "reject" => Ok(Response::Reject),
            other => Err(DirectoryError::InvalidAction(other.to_string())),
        }
    }
}

/// Relationship between two users from the point of view of `me`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Relation {
    pub is_friend: bool,
    pub has_pending_request: bool,
    pub request_sent_by_me: bool,
}

fn pair(a: &UserId, b: &UserId) -> (UserId, UserId) {
    if a <= b {
        (a.clone(), b.clone())
    } else {
        (b.clone(), a.clone())
    }
}

/// Friend requests and the symmetric friendship relation they produce.
#[derive(Default)]
pub struct FriendGraph {
    friendships: HashSet<(UserId, UserId)>,
    requests: HashMap<RequestId, FriendRequest>,
}

impl FriendGraph {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn are_friends(&self, a: &UserId, b: &UserId) -> bool {
        self.friendships.contains(&pair(a, b))
    }

    pub fn friends_of(&self, user: &UserId) -> Vec<UserId> {
        let mut friends: Vec<UserId> = self
            .friendships
            .iter()
            .filter_map(|(a, b)| {
                if a == user {
                    Some(b.clone())
                } else if b == user {
                    Some(a.clone())
                } else {
                    None
                }
            })
            .collect();
        friends.sort();
        friends
    }

    fn pending_between(&self, a: &UserId, b: &UserId) -> Option<&FriendRequest> {
        self.requests.values().find(|request| {
            request.status == RequestStatus::Pending
                && ((request.from == *a && request.to == *b) || (request.from == *b && request.to == *a))
        })
    }

    pub fn send(&mut self, from: &UserId, to: &UserId) -> Result<FriendRequest, DirectoryError> {
        if from == to {
            return Err(DirectoryError::SelfRequest);
        }
        if self.are_friends(from, to) {
            return Err(DirectoryError::AlreadyFriends);
        }
        if self.pending_between(from, to).is_some() {
            return Err(DirectoryError::RequestPending);
        }

        let request = FriendRequest {
            id: RequestId::new(),
            from: from.clone(),
            to: to.clone(),
            status: RequestStatus::Pending,
            created_at: Utc::now(),
        };
        self.requests.insert(request.id, request.clone());
        Ok(request)
    }

    pub fn respond(&mut self, id: RequestId, response: Response) -> Result<FriendRequest, DirectoryError> {
        let request = self.requests.get_mut(&id).ok_or(DirectoryError::RequestNotFound)?;
        if request.status != RequestStatus::Pending {
            return Err(DirectoryError::RequestAnswered);
        }

        request.status = match response {
            Response::Accept => RequestStatus::Accepted,
            Response::Reject => RequestStatus::Rejected,
        };
        let request = request.clone();
        if response == Response::Accept {
            self.friendships.insert(pair(&request.from, &request.to));
        }
        Ok(request)
    }

    /// Pending requests addressed to `user`, oldest first.
    pub fn incoming(&self, user: &UserId) -> Vec<FriendRequest> {
        let mut pending: Vec<FriendRequest> = self
            .requests
            .values()
            .filter(|request| request.to == *user && request.status == RequestStatus::Pending)
            .cloned()
            .collect();
        pending.sort_by_key(|request| request.created_at);
        pending
    }

    pub fn relation(&self, me: &UserId, other: &UserId) -> Relation {
        let pending = self.pending_between(me, other);
        Relation {
            is_friend: self.are_friends(me, other),
            has_pending_request: pending.is_some(),
            request_sent_by_me: pending.is_some_and(|request| request.from == *me),
        }
    }
}
