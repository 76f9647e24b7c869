use std::collections::HashMap;

use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

use crate::crypto::{generate_token, PasswordHash};
use crate::models::{User, UserId};

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DirectoryError {
    #[error("{0} is required")]
    MissingField(&'static str),
    #[error("Email is already registered")]
    EmailTaken,
    #[error("Invalid email or password")]
    InvalidCredentials,
    #[error("Invalid or expired token")]
    InvalidToken,
    #[error("User not found")]
    UnknownUser,
    #[error("Cannot send a friend request to yourself")]
    SelfRequest,
    #[error("Already friends")]
    AlreadyFriends,
    #[error("A friend request is already pending")]
    RequestPending,
    #[error("Friend request not found")]
    RequestNotFound,
    #[error("Friend request was already answered")]
    RequestAnswered,
    #[error("Unknown action {0:?}, expected accept or reject")]
    InvalidAction(String),
}

struct Account {
    user: User,
    password: PasswordHash,
}

/// Registered accounts and the session tokens issued to them.
#[derive(Default)]
pub struct UserDirectory {
    accounts: HashMap<UserId, Account>,
    by_email: HashMap<String, UserId>,
    tokens: HashMap<String, UserId>,
}

fn required<'a>(value: &'a str, field: &'static str) -> Result<&'a str, DirectoryError> {
    let value = value.trim();
    if value.is_empty() {
        Err(DirectoryError::MissingField(field))
    } else {
        Ok(value)
    }
}

fn default_avatar(username: &str) -> String {
    let name: String = username
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '+' })
        .collect();
    format!("https://ui-avatars.com/api/?name={name}&background=random")
}

impl UserDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an account and logs it in.
    pub fn register(
        &mut self,
        username: &str,
        email: &str,
        password: &str,
    ) -> Result<(String, User), DirectoryError> {
        let username = required(username, "username")?;
        let email = required(email, "email")?.to_lowercase();
        if password.is_empty() {
            return Err(DirectoryError::MissingField("password"));
        }
        if self.by_email.contains_key(&email) {
            return Err(DirectoryError::EmailTaken);
        }

        let user = User {
            id: UserId::new(Uuid::new_v4().to_string()),
            username: username.to_string(),
            email: email.clone(),
            avatar: default_avatar(username),
            created_at: Utc::now(),
        };
        self.by_email.insert(email, user.id.clone());
        self.accounts.insert(
            user.id.clone(),
            Account {
                user: user.clone(),
                password: PasswordHash::new(password),
            },
        );

        let token = self.issue_token(&user.id);
        Ok((token, user))
    }

    pub fn login(&mut self, email: &str, password: &str) -> Result<(String, User), DirectoryError> {
        let email = email.trim().to_lowercase();
        let account = self
            .by_email
            .get(&email)
            .and_then(|id| self.accounts.get(id))
            .filter(|account| account.password.verify(password))
            .ok_or(DirectoryError::InvalidCredentials)?;

        let user = account.user.clone();
        let token = self.issue_token(&user.id);
        Ok((token, user))
    }

    pub fn authenticate(&self, token: &str) -> Result<&User, DirectoryError> {
        self.tokens
            .get(token)
            .and_then(|id| self.get(id))
            .ok_or(DirectoryError::InvalidToken)
    }

    pub fn get(&self, id: &UserId) -> Option<&User> {
        self.accounts.get(id).map(|account| &account.user)
    }

    pub fn contains(&self, id: &UserId) -> bool {
        self.accounts.contains_key(id)
    }

    pub fn set_avatar(&mut self, id: &UserId, avatar: &str) -> Result<User, DirectoryError> {
        let avatar = required(avatar, "avatar")?;
        let account = self.accounts.get_mut(id).ok_or(DirectoryError::UnknownUser)?;
        account.user.avatar = avatar.to_string();
        Ok(account.user.clone())
    }

    /// All users, oldest registration first.
    pub fn all(&self) -> Vec<&User> {
        let mut users: Vec<&User> = self.accounts.values().map(|account| &account.user).collect();
        users.sort_by(|a, b| a.created_at.cmp(&b.created_at).then_with(|| a.id.cmp(&b.id)));
        users
    }

    /// Case-insensitive substring match on username or email.
    pub fn search(&self, query: &str) -> Vec<&User> {
        let query = query.trim().to_lowercase();
        self.all()
            .into_iter()
            .filter(|user| {
                user.username.to_lowercase().contains(&query) || user.email.contains(&query)
            })
            .collect()
    }

    fn issue_token(&mut self, id: &UserId) -> String {
        let token = generate_token();
        self.tokens.insert(token.clone(), id.clone());
        token
    }
}
