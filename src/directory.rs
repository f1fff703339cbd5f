//! Authorization collaborator.
//!
//! Users and approval groups are owned by the authorization subsystem; the
//! engine references groups by id and tests membership when a task is
//! actioned.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::WorkflowError;

/// A user known to the authorization subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct User {
    pub user_id: i32,
    pub name: String,
}

/// An approval authorization unit: a named set of users. Membership gates
/// who may action a task bound to this group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserGroup {
    pub group_id: i32,
    pub name: String,
    pub members: Vec<i32>,
}

impl UserGroup {
    pub fn new(group_id: i32, name: impl Into<String>, members: Vec<i32>) -> Self {
        Self {
            group_id,
            name: name.into(),
            members,
        }
    }

    pub fn is_member(&self, user_id: i32) -> bool {
        self.members.contains(&user_id)
    }
}

/// Lookup surface of the authorization subsystem.
#[async_trait]
pub trait UserDirectory: Send + Sync {
    /// Look up a user by id. `None` when unknown.
    async fn user(&self, user_id: i32) -> Result<Option<User>, WorkflowError>;

    /// Look up an approval group by id. `None` when unknown.
    async fn group(&self, group_id: i32) -> Result<Option<UserGroup>, WorkflowError>;
}

/// In-memory directory, used in tests and as a standalone default.
#[derive(Default)]
pub struct InMemoryDirectory {
    users: HashMap<i32, User>,
    groups: HashMap<i32, UserGroup>,
}

impl InMemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_user(mut self, user_id: i32, name: impl Into<String>) -> Self {
        self.users.insert(
            user_id,
            User {
                user_id,
                name: name.into(),
            },
        );
        self
    }

    pub fn with_group(mut self, group: UserGroup) -> Self {
        self.groups.insert(group.group_id, group);
        self
    }
}

#[async_trait]
impl UserDirectory for InMemoryDirectory {
    async fn user(&self, user_id: i32) -> Result<Option<User>, WorkflowError> {
        Ok(self.users.get(&user_id).cloned())
    }

    async fn group(&self, group_id: i32) -> Result<Option<UserGroup>, WorkflowError> {
        Ok(self.groups.get(&group_id).cloned())
    }
}
