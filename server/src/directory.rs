//! External collaborators the hub reads from but never writes to: the
//! user/auth store and the character-data store.

use shared::{CharacterSnapshot, Credentials, SyncError, UserId};
use std::collections::HashMap;

/// Resolved identity of an authenticated user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserIdentity {
    pub user_id: UserId,
    pub display_name: String,
}

pub trait UserDirectory: Send + Sync {
    fn authenticate(&self, credentials: &Credentials) -> Result<UserIdentity, SyncError>;
}

pub trait CharacterStore: Send + Sync {
    fn load(&self, character_id: &str) -> Option<CharacterSnapshot>;
}

/// Trusts the presented user id. For local tables and tests.
#[derive(Debug, Default)]
pub struct OpenDirectory;

impl UserDirectory for OpenDirectory {
    fn authenticate(&self, credentials: &Credentials) -> Result<UserIdentity, SyncError> {
        if credentials.user_id.trim().is_empty() {
            return Err(SyncError::unauthorized("empty user id"));
        }
        let display_name = if credentials.display_name.trim().is_empty() {
            credentials.user_id.clone()
        } else {
            credentials.display_name.clone()
        };
        Ok(UserIdentity {
            user_id: credentials.user_id.clone(),
            display_name,
        })
    }
}

/// Checks a shared token per user.
#[derive(Debug, Default)]
pub struct TokenDirectory {
    tokens: HashMap<UserId, String>,
}

impl TokenDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: impl Into<UserId>, token: impl Into<String>) -> Self {
        self.tokens.insert(user_id.into(), token.into());
        self
    }
}

impl UserDirectory for TokenDirectory {
    fn authenticate(&self, credentials: &Credentials) -> Result<UserIdentity, SyncError> {
        match self.tokens.get(&credentials.user_id) {
            Some(token) if *token == credentials.token => OpenDirectory.authenticate(credentials),
            Some(_) => Err(SyncError::unauthorized("bad credentials")),
            None => Err(SyncError::not_found(format!(
                "user {}",
                credentials.user_id
            ))),
        }
    }
}

#[derive(Debug, Default)]
pub struct InMemoryCharacterStore {
    characters: HashMap<String, CharacterSnapshot>,
}

impl InMemoryCharacterStore {
    pub fn new(characters: impl IntoIterator<Item = CharacterSnapshot>) -> Self {
        Self {
            characters: characters
                .into_iter()
                .map(|c| (c.character_id.clone(), c))
                .collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.characters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.characters.is_empty()
    }
}

impl CharacterStore for InMemoryCharacterStore {
    fn load(&self, character_id: &str) -> Option<CharacterSnapshot> {
        self.characters.get(character_id).cloned()
    }
}
