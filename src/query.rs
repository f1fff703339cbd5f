//! Read-side aggregation for approval dashboards.
//!
//! Pure projections over the store, enriched with node names, requester
//! names and the resolved permission chain. Nothing here mutates state.

use std::sync::Arc;

use serde::Serialize;
use uuid::Uuid;

use crate::content::ContentService;
use crate::directory::{UserDirectory, UserGroup};
use crate::resolver::PermissionResolver;
use crate::state::{TaskStatus, WorkflowInstance};
use crate::store::{TaskRecord, WorkflowStore};
use crate::WorkflowError;

/// Date format used on dashboards, e.g. "3 Aug 2026".
const DISPLAY_DATE: &str = "%-d %b %Y";

/// Which flows a user listing returns: tasks the user can action, or
/// workflows the user submitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlowFilter {
    Tasks,
    Submissions,
}

/// One task row on a dashboard, enriched with its instance's descriptive
/// fields.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowTask {
    pub task_id: i64,
    pub instance_guid: Uuid,
    pub node_id: i32,
    pub node_name: String,
    /// Workflow type label, e.g. "Publish".
    pub workflow_type: String,
    pub status: String,
    /// First word of the status, lowercased, for styling hooks.
    pub css_status: String,
    /// Status of the owning instance.
    pub active_task: String,
    pub approval_group_id: Option<i32>,
    pub approval_group: String,
    pub requested_by: String,
    pub requested_on: String,
    pub comments: String,
    pub current_step: u32,
    /// Resolved approval chain for the node, for display and authorization.
    pub permissions: Vec<UserGroup>,
    /// Whether the viewing user may action this task.
    pub show_action_link: bool,
}

/// One instance row with its nested task history, most recent step first.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowInstanceView {
    pub guid: Uuid,
    pub node_id: i32,
    pub node_name: String,
    pub workflow_type: String,
    pub status: String,
    pub css_status: String,
    pub requested_by: String,
    pub requested_on: String,
    pub tasks: Vec<WorkflowTask>,
}

/// Read-only aggregation over store, resolver and collaborators.
pub struct WorkflowQueryService {
    store: Arc<dyn WorkflowStore>,
    content: Arc<dyn ContentService>,
    directory: Arc<dyn UserDirectory>,
    resolver: PermissionResolver,
}

impl WorkflowQueryService {
    pub fn new(
        store: Arc<dyn WorkflowStore>,
        content: Arc<dyn ContentService>,
        directory: Arc<dyn UserDirectory>,
        resolver: PermissionResolver,
    ) -> Self {
        Self {
            store,
            content,
            directory,
            resolver,
        }
    }

    /// All tasks currently awaiting approval.
    pub async fn pending_tasks(&self) -> Result<Vec<WorkflowTask>, WorkflowError> {
        let records = self.store.pending_tasks().await?;
        self.build_task_views(records, None, None).await
    }

    /// Every task, pending and resolved.
    pub async fn all_tasks(&self) -> Result<Vec<WorkflowTask>, WorkflowError> {
        let records = self.store.all_tasks().await?;
        self.build_task_views(records, None, None).await
    }

    /// Tasks for the given node, across all of its instances.
    pub async fn tasks_by_node(&self, node_id: i32) -> Result<Vec<WorkflowTask>, WorkflowError> {
        let records = self.store.tasks_by_node(node_id).await?;
        self.build_task_views(records, None, None).await
    }

    /// Pending flows for a user: tasks the user's groups can action, or
    /// workflows the user submitted.
    pub async fn flows_for_user(
        &self,
        user_id: i32,
        filter: FlowFilter,
    ) -> Result<Vec<WorkflowTask>, WorkflowError> {
        let records = self.store.pending_tasks().await?;
        let mut selected = Vec::new();

        for record in records {
            match filter {
                FlowFilter::Tasks => {
                    let Some(group_id) = record.task.group_id else {
                        continue;
                    };
                    let Some(group) = self.directory.group(group_id).await? else {
                        continue;
                    };
                    if group.is_member(user_id) {
                        selected.push(record);
                    }
                }
                FlowFilter::Submissions => {
                    let authored = record
                        .instance
                        .as_ref()
                        .is_some_and(|i| i.author_user_id == user_id);
                    if authored {
                        selected.push(record);
                    }
                }
            }
        }

        self.build_task_views(selected, Some(user_id), None).await
    }

    /// Every instance with its nested task history, tasks ordered by step
    /// descending (most recent first).
    pub async fn all_instances(&self) -> Result<Vec<WorkflowInstanceView>, WorkflowError> {
        let instances = self.store.all_instances().await?;
        let mut views = Vec::with_capacity(instances.len());

        for instance in instances {
            let node_name = self.node_name(instance.node_id).await?;
            let requested_by = self.user_name(instance.author_user_id).await?;

            let records: Vec<TaskRecord> = instance
                .tasks
                .iter()
                .map(|t| TaskRecord {
                    task: t.clone(),
                    // Tasks listed from a known instance carry no
                    // back-reference; the instance context below fills in.
                    instance: None,
                })
                .collect();
            let mut tasks = self
                .build_task_views(records, None, Some(&instance))
                .await?;
            tasks.sort_by(|a, b| b.current_step.cmp(&a.current_step));

            views.push(WorkflowInstanceView {
                guid: instance.guid,
                node_id: instance.node_id,
                node_name,
                workflow_type: instance.workflow_type.description().to_string(),
                status: instance.status.name().to_string(),
                css_status: css_status(instance.status.name()),
                requested_by,
                requested_on: instance.created_at.format(DISPLAY_DATE).to_string(),
                tasks,
            });
        }

        Ok(views)
    }

    /// Whether an active workflow exists for the node.
    pub async fn node_status(&self, node_id: i32) -> Result<bool, WorkflowError> {
        Ok(self.store.find_active_for_node(node_id).await?.is_some())
    }

    /// Project task records into dashboard rows.
    ///
    /// `viewer` enables the action link for tasks whose group contains the
    /// user. `context` supplies the owning instance for records that carry
    /// no back-reference.
    async fn build_task_views(
        &self,
        records: Vec<TaskRecord>,
        viewer: Option<i32>,
        context: Option<&WorkflowInstance>,
    ) -> Result<Vec<WorkflowTask>, WorkflowError> {
        let mut views = Vec::with_capacity(records.len());

        for record in records {
            let instance = match (&record.instance, context) {
                (Some(instance), _) => instance.clone(),
                (None, Some(context)) => context.clone(),
                (None, None) => {
                    return Err(WorkflowError::invalid_state(format!(
                        "task {} has no owning instance and no instance context was supplied",
                        record.task.id
                    )))
                }
            };

            let node = self
                .content
                .node_by_id(instance.node_id)
                .await?
                .ok_or(WorkflowError::InvalidNode {
                    node_id: instance.node_id,
                })?;
            let permissions = self.resolver.resolve(&node).await?;
            let requested_by = self.user_name(instance.author_user_id).await?;

            let approval_group = match record.task.group_id {
                Some(group_id) => self
                    .directory
                    .group(group_id)
                    .await?
                    .map(|g| g.name)
                    .unwrap_or_default(),
                None => String::new(),
            };

            let show_action_link = match viewer {
                Some(user_id) if record.task.status == TaskStatus::PendingApproval => {
                    match record.task.group_id {
                        Some(group_id) => self
                            .directory
                            .group(group_id)
                            .await?
                            .is_some_and(|g| g.is_member(user_id)),
                        None => false,
                    }
                }
                _ => false,
            };

            let comments = record
                .task
                .comment
                .clone()
                .or_else(|| instance.author_comment.clone())
                .unwrap_or_default();

            views.push(WorkflowTask {
                task_id: record.task.id,
                instance_guid: instance.guid,
                node_id: instance.node_id,
                node_name: node.name,
                workflow_type: instance.workflow_type.description().to_string(),
                status: record.task.status.name().to_string(),
                css_status: css_status(record.task.status.name()),
                active_task: instance.status.name().to_string(),
                approval_group_id: record.task.group_id,
                approval_group,
                requested_by,
                requested_on: record.task.created_at.format(DISPLAY_DATE).to_string(),
                comments,
                current_step: record.task.approval_step,
                permissions,
                show_action_link,
            });
        }

        Ok(views)
    }

    async fn node_name(&self, node_id: i32) -> Result<String, WorkflowError> {
        self.content
            .node_by_id(node_id)
            .await?
            .map(|n| n.name)
            .ok_or(WorkflowError::InvalidNode { node_id })
    }

    async fn user_name(&self, user_id: i32) -> Result<String, WorkflowError> {
        Ok(self
            .directory
            .user(user_id)
            .await?
            .map(|u| u.name)
            .unwrap_or_else(|| format!("user {user_id}")))
    }
}

/// First word of a status name, lowercased ("Pending Approval" -> "pending").
fn css_status(status_name: &str) -> String {
    status_name
        .split_whitespace()
        .next()
        .unwrap_or_default()
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_css_status() {
        assert_eq!(css_status("Pending Approval"), "pending");
        assert_eq!(css_status("Approved"), "approved");
        assert_eq!(css_status(""), "");
    }
}
