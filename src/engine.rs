//! Approval workflow state machine.
//!
//! One engine drives both process variants; the variant (publish vs
//! unpublish) is selected once at initiation, persisted on the instance, and
//! decides which content action fires on full approval. Instances move
//! `PendingApproval -> {Approved, Rejected, Cancelled}`; step advancement is
//! a sub-transition within `PendingApproval`.

use std::sync::Arc;

use tracing::{error, info, warn};

use crate::content::ContentService;
use crate::directory::{UserDirectory, UserGroup};
use crate::resolver::PermissionResolver;
use crate::state::{
    TaskInstance, WorkflowAction, WorkflowInstance, WorkflowStatus, WorkflowType,
};
use crate::store::{TransitionOutcome, WorkflowStore};
use crate::WorkflowError;

/// Drives the approval lifecycle of workflow instances.
pub struct ApprovalEngine {
    store: Arc<dyn WorkflowStore>,
    content: Arc<dyn ContentService>,
    directory: Arc<dyn UserDirectory>,
    resolver: PermissionResolver,
}

impl ApprovalEngine {
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

    /// Start a workflow for a node.
    ///
    /// With a configured approval chain the instance is created pending at
    /// step 1 with its first task. With no chain anywhere up the tree the
    /// content action runs immediately and the instance is recorded already
    /// approved, with one synthetic approved task and no pending work.
    pub async fn initiate(
        &self,
        node_id: i32,
        workflow_type: WorkflowType,
        author_user_id: i32,
        comment: Option<String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let node = self
            .content
            .node_by_id(node_id)
            .await?
            .ok_or(WorkflowError::InvalidNode { node_id })?;

        // At most one active workflow per node. The store re-checks inside
        // its insert, which settles two initiations racing on the same node.
        if self.store.find_active_for_node(node_id).await?.is_some() {
            return Err(WorkflowError::ConcurrentWorkflow { node_id });
        }

        let chain = self.resolver.resolve(&node).await?;
        let mut instance =
            WorkflowInstance::new(node_id, workflow_type, author_user_id, comment);

        if chain.is_empty() {
            self.perform_content_action(&instance).await?;
            instance.record_auto_approval();
            let stored = self.store.insert_instance(instance).await?;
            info!(
                node_id,
                instance = %stored.guid,
                workflow_type = workflow_type.as_str(),
                "workflow auto-approved: no approval chain configured"
            );
            return Ok(stored);
        }

        instance.open_first_step(chain[0].group_id);
        let stored = self.store.insert_instance(instance).await?;
        info!(
            node_id,
            instance = %stored.guid,
            workflow_type = workflow_type.as_str(),
            steps = chain.len(),
            "workflow initiated"
        );
        Ok(stored)
    }

    /// Approve or reject the instance's active task.
    ///
    /// The acting user must be a member of the active task's group. Approval
    /// of the final step performs the content action and finalizes the
    /// instance; approval of an earlier step opens the next one. Rejection
    /// terminates the whole instance with no content action.
    pub async fn action(
        &self,
        instance: &WorkflowInstance,
        action: WorkflowAction,
        acting_user_id: i32,
        comment: Option<String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        if instance.status != WorkflowStatus::PendingApproval {
            return Err(WorkflowError::invalid_state(format!(
                "workflow instance {} is already {}",
                instance.guid, instance.status
            )));
        }
        let task = instance.active_task().ok_or_else(|| {
            WorkflowError::invalid_state(format!(
                "workflow instance {} has no active task",
                instance.guid
            ))
        })?;

        let group = self.group_for_task(task).await?;
        if !group.is_member(acting_user_id) {
            warn!(
                instance = %instance.guid,
                user_id = acting_user_id,
                group = %group.name,
                "action refused: user is not a group member"
            );
            return Err(WorkflowError::Unauthorized {
                user_id: acting_user_id,
                group: group.name,
            });
        }

        match action {
            WorkflowAction::Reject => {
                let updated = self
                    .store
                    .apply_transition(
                        instance.guid,
                        instance.current_step,
                        TransitionOutcome::Reject,
                        acting_user_id,
                        comment,
                    )
                    .await?;
                warn!(
                    instance = %updated.guid,
                    step = instance.current_step,
                    user_id = acting_user_id,
                    "workflow rejected"
                );
                Ok(updated)
            }
            WorkflowAction::Approve => {
                self.approve(instance, acting_user_id, comment).await
            }
        }
    }

    /// Cancel a pending instance at any step. The active task is marked
    /// rejected for record keeping with the cancellation comment; no content
    /// action is taken. Who may cancel is the caller's decision.
    pub async fn cancel(
        &self,
        instance: &WorkflowInstance,
        acting_user_id: i32,
        comment: Option<String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        if instance.status != WorkflowStatus::PendingApproval {
            return Err(WorkflowError::invalid_state(format!(
                "workflow instance {} is already {}",
                instance.guid, instance.status
            )));
        }

        let updated = self
            .store
            .apply_transition(
                instance.guid,
                instance.current_step,
                TransitionOutcome::Cancel,
                acting_user_id,
                comment,
            )
            .await?;
        info!(
            instance = %updated.guid,
            step = instance.current_step,
            user_id = acting_user_id,
            "workflow cancelled"
        );
        Ok(updated)
    }

    async fn approve(
        &self,
        instance: &WorkflowInstance,
        acting_user_id: i32,
        comment: Option<String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        // Re-derive the chain: the hierarchy or configuration may have
        // changed since initiation, and the next group comes from the
        // current snapshot.
        let node = self
            .content
            .node_by_id(instance.node_id)
            .await?
            .ok_or(WorkflowError::InvalidNode {
                node_id: instance.node_id,
            })?;
        let chain = self.resolver.resolve(&node).await?;

        let is_final_step = instance.current_step as usize >= chain.len();
        if !is_final_step {
            let next_group = &chain[instance.current_step as usize];
            let updated = self
                .store
                .apply_transition(
                    instance.guid,
                    instance.current_step,
                    TransitionOutcome::AdvanceStep {
                        next_group_id: next_group.group_id,
                    },
                    acting_user_id,
                    comment,
                )
                .await?;
            info!(
                instance = %updated.guid,
                step = updated.current_step,
                group = %next_group.name,
                "approval step completed, next step opened"
            );
            return Ok(updated);
        }

        // Final step. Approving the task first settles any race between two
        // approvers; the content action and the instance-status update then
        // form the rest of the logical step. If the content action fails the
        // instance stays pending with the task approved, for manual
        // follow-up, rather than reporting a change that never happened.
        let updated = self
            .store
            .apply_transition(
                instance.guid,
                instance.current_step,
                TransitionOutcome::ApproveFinalTask,
                acting_user_id,
                comment,
            )
            .await?;

        if let Err(e) = self.perform_content_action(&updated).await {
            error!(
                instance = %updated.guid,
                node_id = updated.node_id,
                error = %e,
                "content action failed after final approval; instance left pending"
            );
            return Err(e);
        }

        let finalized = self
            .store
            .apply_transition(
                instance.guid,
                instance.current_step,
                TransitionOutcome::Finalize,
                acting_user_id,
                None,
            )
            .await?;
        info!(
            instance = %finalized.guid,
            node_id = finalized.node_id,
            workflow_type = finalized.workflow_type.as_str(),
            "workflow approved, content action performed"
        );
        Ok(finalized)
    }

    async fn perform_content_action(
        &self,
        instance: &WorkflowInstance,
    ) -> Result<(), WorkflowError> {
        match instance.workflow_type {
            WorkflowType::Publish => self.content.publish(instance.node_id).await,
            WorkflowType::Unpublish => self.content.unpublish(instance.node_id).await,
        }
    }

    async fn group_for_task(&self, task: &TaskInstance) -> Result<UserGroup, WorkflowError> {
        let group_id = task.group_id.ok_or_else(|| {
            WorkflowError::invalid_state(format!("task {} has no approval group", task.id))
        })?;
        self.directory.group(group_id).await?.ok_or_else(|| {
            WorkflowError::collaborator(
                "group lookup",
                format!("approval group {group_id} is not known to the directory"),
            )
        })
    }
}
