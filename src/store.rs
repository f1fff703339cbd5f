//! Workflow instance store.
//!
//! Data-access contract for instances and their tasks. The store owns no
//! business logic; the engine decides the outcome of a transition and the
//! store applies it as a single atomic unit, guarded by a compare-and-set on
//! the instance's status and step. Two callers racing on the same instance
//! see exactly one success; the loser observes `InvalidState`.

use async_trait::async_trait;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::state::{TaskInstance, TaskStatus, WorkflowInstance, WorkflowStatus};
use crate::WorkflowError;

/// A task paired with its owning instance, as returned by task listings.
///
/// The instance reference may be absent (a backend may list tasks without
/// joining instances); readers fall back to an explicitly supplied instance
/// context in that case.
#[derive(Debug, Clone)]
pub struct TaskRecord {
    pub task: TaskInstance,
    pub instance: Option<WorkflowInstance>,
}

/// The state change the engine asks the store to apply atomically.
///
/// Every variant is guarded by the same compare-and-set: the instance must
/// still be `PendingApproval` at the step the caller observed.
#[derive(Debug, Clone)]
pub enum TransitionOutcome {
    /// Reject the active task and terminate the instance as Rejected.
    Reject,
    /// Reject the active task (record keeping) and terminate as Cancelled.
    Cancel,
    /// Approve the active task and open the next step on `next_group_id`.
    AdvanceStep { next_group_id: i32 },
    /// Approve the final active task. The instance stays pending until the
    /// content action succeeds and `Finalize` lands.
    ApproveFinalTask,
    /// Mark the instance Approved; valid only once the final task has been
    /// approved.
    Finalize,
}

/// Persistence contract for workflow instances and tasks.
#[async_trait]
pub trait WorkflowStore: Send + Sync {
    /// Atomically create an instance together with its initial task(s),
    /// assigning numeric ids. Fails with `ConcurrentWorkflow` when the node
    /// already has an active instance.
    async fn insert_instance(
        &self,
        instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, WorkflowError>;

    async fn instance(&self, guid: Uuid) -> Result<Option<WorkflowInstance>, WorkflowError>;

    /// The instance owning the given task, with its full task history.
    async fn instance_by_task(
        &self,
        task_id: i64,
    ) -> Result<Option<WorkflowInstance>, WorkflowError>;

    /// The active (PendingApproval) instance for a node, if any.
    async fn find_active_for_node(
        &self,
        node_id: i32,
    ) -> Result<Option<WorkflowInstance>, WorkflowError>;

    /// The unique pending task of an instance, or `None` once terminal.
    async fn active_task(&self, guid: Uuid) -> Result<Option<TaskInstance>, WorkflowError> {
        Ok(self
            .instance(guid)
            .await?
            .and_then(|i| i.active_task().cloned()))
    }

    /// Apply a transition as one atomic unit. The compare-and-set requires
    /// the instance to be `PendingApproval` at `expected_step`; a caller
    /// holding a stale snapshot fails with `InvalidState`.
    async fn apply_transition(
        &self,
        guid: Uuid,
        expected_step: u32,
        outcome: TransitionOutcome,
        actioned_by: i32,
        comment: Option<String>,
    ) -> Result<WorkflowInstance, WorkflowError>;

    /// All pending tasks across all instances.
    async fn pending_tasks(&self) -> Result<Vec<TaskRecord>, WorkflowError>;

    /// All tasks, pending and resolved.
    async fn all_tasks(&self) -> Result<Vec<TaskRecord>, WorkflowError>;

    /// All tasks belonging to instances targeting the node.
    async fn tasks_by_node(&self, node_id: i32) -> Result<Vec<TaskRecord>, WorkflowError>;

    /// Every instance, in creation order, with full task history.
    async fn all_instances(&self) -> Result<Vec<WorkflowInstance>, WorkflowError>;
}

/// In-memory store. The default backend and the test vehicle; every
/// operation runs under one lock, which serialises the create/transition
/// sequences the invariants require.
#[derive(Default)]
pub struct MemoryWorkflowStore {
    inner: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    instances: Vec<WorkflowInstance>,
    next_instance_id: i64,
    next_task_id: i64,
}

impl MemoryWorkflowStore {
    pub fn new() -> Self {
        Self::default()
    }
}

impl MemoryState {
    fn assign_task_ids(&mut self, instance: &mut WorkflowInstance) {
        for task in &mut instance.tasks {
            if task.id == 0 {
                self.next_task_id += 1;
                task.id = self.next_task_id;
            }
        }
    }
}

#[async_trait]
impl WorkflowStore for MemoryWorkflowStore {
    async fn insert_instance(
        &self,
        mut instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let mut state = self.inner.lock().await;

        let node_id = instance.node_id;
        let active_exists = state
            .instances
            .iter()
            .any(|i| i.node_id == node_id && i.status == WorkflowStatus::PendingApproval);
        if active_exists {
            return Err(WorkflowError::ConcurrentWorkflow { node_id });
        }

        state.next_instance_id += 1;
        instance.id = state.next_instance_id;
        state.assign_task_ids(&mut instance);

        state.instances.push(instance.clone());
        Ok(instance)
    }

    async fn instance(&self, guid: Uuid) -> Result<Option<WorkflowInstance>, WorkflowError> {
        let state = self.inner.lock().await;
        Ok(state.instances.iter().find(|i| i.guid == guid).cloned())
    }

    async fn instance_by_task(
        &self,
        task_id: i64,
    ) -> Result<Option<WorkflowInstance>, WorkflowError> {
        let state = self.inner.lock().await;
        Ok(state
            .instances
            .iter()
            .find(|i| i.tasks.iter().any(|t| t.id == task_id))
            .cloned())
    }

    async fn find_active_for_node(
        &self,
        node_id: i32,
    ) -> Result<Option<WorkflowInstance>, WorkflowError> {
        let state = self.inner.lock().await;
        Ok(state
            .instances
            .iter()
            .find(|i| i.node_id == node_id && i.status == WorkflowStatus::PendingApproval)
            .cloned())
    }

    async fn apply_transition(
        &self,
        guid: Uuid,
        expected_step: u32,
        outcome: TransitionOutcome,
        actioned_by: i32,
        comment: Option<String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let mut state = self.inner.lock().await;
        let next_task_id = state.next_task_id + 1;

        let instance = state
            .instances
            .iter_mut()
            .find(|i| i.guid == guid)
            .ok_or_else(|| {
                WorkflowError::invalid_state(format!("workflow instance {guid} not found"))
            })?;

        // Compare-and-set guard: the caller's snapshot must still hold.
        if instance.status != WorkflowStatus::PendingApproval {
            return Err(WorkflowError::invalid_state(format!(
                "workflow instance {guid} is already {}",
                instance.status
            )));
        }
        if instance.current_step != expected_step {
            return Err(WorkflowError::invalid_state(format!(
                "workflow instance {guid} moved from step {expected_step} to step {}",
                instance.current_step
            )));
        }

        let active_idx = instance
            .tasks
            .iter()
            .position(|t| t.status == TaskStatus::PendingApproval);

        match outcome {
            TransitionOutcome::Reject | TransitionOutcome::Cancel => {
                let idx = active_idx.ok_or_else(|| {
                    WorkflowError::invalid_state(format!(
                        "workflow instance {guid} has no active task"
                    ))
                })?;
                instance.tasks[idx].complete(TaskStatus::Rejected, actioned_by, comment);
                instance.status = if matches!(outcome, TransitionOutcome::Reject) {
                    WorkflowStatus::Rejected
                } else {
                    WorkflowStatus::Cancelled
                };
                instance.completed_at = Some(chrono::Utc::now());
            }
            TransitionOutcome::AdvanceStep { next_group_id } => {
                let idx = active_idx.ok_or_else(|| {
                    WorkflowError::invalid_state(format!(
                        "workflow instance {guid} has no active task"
                    ))
                })?;
                instance.tasks[idx].complete(TaskStatus::Approved, actioned_by, comment);
                instance.current_step += 1;
                let mut next =
                    TaskInstance::new(guid, instance.current_step, Some(next_group_id));
                next.id = next_task_id;
                instance.tasks.push(next);
            }
            TransitionOutcome::ApproveFinalTask => {
                let idx = active_idx.ok_or_else(|| {
                    WorkflowError::invalid_state(format!(
                        "workflow instance {guid} has no active task"
                    ))
                })?;
                instance.tasks[idx].complete(TaskStatus::Approved, actioned_by, comment);
            }
            TransitionOutcome::Finalize => {
                if active_idx.is_some() {
                    return Err(WorkflowError::invalid_state(format!(
                        "workflow instance {guid} still has an active task"
                    )));
                }
                let final_approved = instance
                    .tasks
                    .last()
                    .is_some_and(|t| t.status == TaskStatus::Approved);
                if !final_approved {
                    return Err(WorkflowError::invalid_state(format!(
                        "workflow instance {guid} final task is not approved"
                    )));
                }
                instance.status = WorkflowStatus::Approved;
                instance.completed_at = Some(chrono::Utc::now());
            }
        }

        let updated = instance.clone();
        if matches!(outcome, TransitionOutcome::AdvanceStep { .. }) {
            state.next_task_id = next_task_id;
        }
        Ok(updated)
    }

    async fn pending_tasks(&self) -> Result<Vec<TaskRecord>, WorkflowError> {
        let state = self.inner.lock().await;
        Ok(collect_tasks(&state.instances, |t| {
            t.status == TaskStatus::PendingApproval
        }))
    }

    async fn all_tasks(&self) -> Result<Vec<TaskRecord>, WorkflowError> {
        let state = self.inner.lock().await;
        Ok(collect_tasks(&state.instances, |_| true))
    }

    async fn tasks_by_node(&self, node_id: i32) -> Result<Vec<TaskRecord>, WorkflowError> {
        let state = self.inner.lock().await;
        let of_node: Vec<WorkflowInstance> = state
            .instances
            .iter()
            .filter(|i| i.node_id == node_id)
            .cloned()
            .collect();
        Ok(collect_tasks(&of_node, |_| true))
    }

    async fn all_instances(&self) -> Result<Vec<WorkflowInstance>, WorkflowError> {
        let state = self.inner.lock().await;
        Ok(state.instances.clone())
    }
}

fn collect_tasks(
    instances: &[WorkflowInstance],
    filter: impl Fn(&TaskInstance) -> bool,
) -> Vec<TaskRecord> {
    instances
        .iter()
        .flat_map(|instance| {
            instance.tasks.iter().filter(|t| filter(t)).map(|t| TaskRecord {
                task: t.clone(),
                instance: Some(instance.clone()),
            })
        })
        .collect()
}
