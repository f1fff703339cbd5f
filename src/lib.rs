//! Content approval workflow engine.
//!
//! Routes content changes (publish or unpublish) through one or more
//! sequential approval steps, each gated by membership in an authorization
//! group, before the change takes effect. The engine owns the instance/task
//! state machine, permission resolution against the content tree, and the
//! read-side aggregation used by approval dashboards.
//!
//! The content platform itself (node lookup, the publish/unpublish actions)
//! and the authorization subsystem (users, groups) are consumed through the
//! narrow traits in [`content`] and [`directory`]. Persistence goes through
//! the [`store::WorkflowStore`] contract; an in-memory store is built in and
//! a Postgres store is available behind the `database` feature.

pub mod config;
pub mod content;
pub mod directory;
pub mod engine;
pub mod query;
#[cfg(feature = "database")]
pub mod repository;
pub mod resolver;
pub mod service;
pub mod state;
pub mod store;

pub use config::{PermissionConfig, PermissionTable};
pub use content::{ContentService, ContentType, Node};
pub use directory::{User, UserDirectory, UserGroup};
pub use engine::ApprovalEngine;
pub use query::{FlowFilter, WorkflowInstanceView, WorkflowQueryService, WorkflowTask};
pub use resolver::PermissionResolver;
pub use service::{WorkflowResponse, WorkflowService};
pub use state::{
    TaskInstance, TaskStatus, WorkflowAction, WorkflowInstance, WorkflowStatus, WorkflowType,
};
pub use store::{MemoryWorkflowStore, TaskRecord, TransitionOutcome, WorkflowStore};

/// Errors returned by workflow operations.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The target node could not be found in the content tree.
    #[error("Node {node_id} could not be found")]
    InvalidNode { node_id: i32 },

    /// An active workflow instance already exists for the node.
    #[error("An active workflow already exists for node {node_id}")]
    ConcurrentWorkflow { node_id: i32 },

    /// The instance or task is not in a state that permits the action.
    /// Covers double-action and stale-read races: a transition whose
    /// precondition no longer holds fails here.
    #[error("Invalid workflow state: {reason}")]
    InvalidState { reason: String },

    /// The acting user is not a member of the required approval group.
    #[error("User {user_id} is not a member of approval group '{group}'")]
    Unauthorized { user_id: i32, group: String },

    /// A collaborator (content action, directory, store backend) failed.
    #[error("Collaborator failure during {context}: {reason}")]
    Collaborator { context: String, reason: String },

    /// Permission configuration could not be loaded or is inconsistent.
    #[error("Configuration error: {reason}")]
    Config { reason: String },

    #[cfg(feature = "database")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

impl WorkflowError {
    pub(crate) fn invalid_state(reason: impl Into<String>) -> Self {
        Self::InvalidState {
            reason: reason.into(),
        }
    }

    pub(crate) fn collaborator(context: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Collaborator {
            context: context.into(),
            reason: reason.into(),
        }
    }
}
