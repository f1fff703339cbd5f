//! Caller-facing workflow service.
//!
//! The capability surface an adapter (HTTP, RPC) maps 1:1 onto its
//! transport. Composes the engine and the query service; caller messages
//! are derived here from the returned instance status, never inside the
//! state machine.

use std::sync::Arc;

use serde::Serialize;

use crate::config::PermissionTable;
use crate::content::ContentService;
use crate::directory::UserDirectory;
use crate::engine::ApprovalEngine;
use crate::query::{FlowFilter, WorkflowInstanceView, WorkflowQueryService, WorkflowTask};
use crate::resolver::PermissionResolver;
use crate::state::{WorkflowAction, WorkflowInstance, WorkflowStatus, WorkflowType};
use crate::store::WorkflowStore;
use crate::WorkflowError;

/// Outcome of a workflow operation, ready for serialization by an adapter.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowResponse {
    pub message: String,
    pub workflow_type: WorkflowType,
}

/// Facade over engine, query service and store.
pub struct WorkflowService {
    engine: ApprovalEngine,
    query: WorkflowQueryService,
    store: Arc<dyn WorkflowStore>,
}

impl WorkflowService {
    /// Wire up a service from its collaborators and permission
    /// configuration.
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        content: Arc<dyn ContentService>,
        directory: Arc<dyn UserDirectory>,
        table: Arc<PermissionTable>,
    ) -> Self {
        let resolver = PermissionResolver::new(table, content.clone(), directory.clone());
        let engine = ApprovalEngine::new(
            store.clone(),
            content.clone(),
            directory.clone(),
            resolver.clone(),
        );
        let query = WorkflowQueryService::new(store.clone(), content, directory, resolver);
        Self {
            engine,
            query,
            store,
        }
    }

    /// Start a publish or unpublish workflow for a node.
    pub async fn initiate_workflow(
        &self,
        node_id: i32,
        author_user_id: i32,
        comment: Option<String>,
        publish: bool,
    ) -> Result<WorkflowResponse, WorkflowError> {
        let workflow_type = if publish {
            WorkflowType::Publish
        } else {
            WorkflowType::Unpublish
        };
        let instance = self
            .engine
            .initiate(node_id, workflow_type, author_user_id, comment)
            .await?;

        let message = match instance.status {
            WorkflowStatus::PendingApproval => "Page submitted for approval".to_string(),
            _ => "Workflow complete".to_string(),
        };
        Ok(WorkflowResponse {
            message,
            workflow_type: instance.workflow_type,
        })
    }

    /// Approve the active task of the workflow owning `task_id`.
    pub async fn approve_task(
        &self,
        task_id: i64,
        acting_user_id: i32,
        comment: Option<String>,
    ) -> Result<WorkflowResponse, WorkflowError> {
        let instance = self.instance_for_task(task_id).await?;
        let updated = self
            .engine
            .action(&instance, WorkflowAction::Approve, acting_user_id, comment)
            .await?;

        let message = match updated.status {
            WorkflowStatus::PendingApproval => format!(
                "Approval completed successfully. Page will be {} on workflow completion.",
                updated.workflow_type.past_tense()
            ),
            _ => format!(
                "Workflow approved successfully, page has been {}.",
                updated.workflow_type.past_tense()
            ),
        };
        Ok(WorkflowResponse {
            message,
            workflow_type: updated.workflow_type,
        })
    }

    /// Reject the active task, terminating the workflow.
    pub async fn reject_task(
        &self,
        task_id: i64,
        acting_user_id: i32,
        comment: Option<String>,
    ) -> Result<WorkflowResponse, WorkflowError> {
        let instance = self.instance_for_task(task_id).await?;
        let updated = self
            .engine
            .action(&instance, WorkflowAction::Reject, acting_user_id, comment)
            .await?;

        Ok(WorkflowResponse {
            message: format!(
                "{} request has been rejected.",
                updated.workflow_type.description()
            ),
            workflow_type: updated.workflow_type,
        })
    }

    /// Cancel the workflow owning `task_id`. Authorization of the canceller
    /// is the caller's responsibility.
    pub async fn cancel_task(
        &self,
        task_id: i64,
        acting_user_id: i32,
        comment: Option<String>,
    ) -> Result<WorkflowResponse, WorkflowError> {
        let instance = self.instance_for_task(task_id).await?;
        let updated = self.engine.cancel(&instance, acting_user_id, comment).await?;

        Ok(WorkflowResponse {
            message: format!(
                "{} workflow cancelled.",
                updated.workflow_type.description()
            ),
            workflow_type: updated.workflow_type,
        })
    }

    /// All tasks currently awaiting approval.
    pub async fn pending_tasks(&self) -> Result<Vec<WorkflowTask>, WorkflowError> {
        self.query.pending_tasks().await
    }

    /// Every task, pending and resolved.
    pub async fn all_tasks(&self) -> Result<Vec<WorkflowTask>, WorkflowError> {
        self.query.all_tasks().await
    }

    /// Tasks for the given node.
    pub async fn tasks_by_node(&self, node_id: i32) -> Result<Vec<WorkflowTask>, WorkflowError> {
        self.query.tasks_by_node(node_id).await
    }

    /// Pending flows for a user, as approver or as submitter.
    pub async fn flows_for_user(
        &self,
        user_id: i32,
        filter: FlowFilter,
    ) -> Result<Vec<WorkflowTask>, WorkflowError> {
        self.query.flows_for_user(user_id, filter).await
    }

    /// Every instance with nested task history.
    pub async fn all_instances(&self) -> Result<Vec<WorkflowInstanceView>, WorkflowError> {
        self.query.all_instances().await
    }

    /// Whether an active workflow exists for the node.
    pub async fn status_for_node(&self, node_id: i32) -> Result<bool, WorkflowError> {
        self.query.node_status(node_id).await
    }

    async fn instance_for_task(&self, task_id: i64) -> Result<WorkflowInstance, WorkflowError> {
        self.store
            .instance_by_task(task_id)
            .await?
            .ok_or_else(|| {
                WorkflowError::invalid_state(format!("no workflow task with id {task_id}"))
            })
    }
}
