//! Workflow state types.
//!
//! A [`WorkflowInstance`] is one approval request for one node; it owns an
//! ordered collection of [`TaskInstance`]s, one per approval step. While the
//! instance is pending exactly one task is pending; terminal instances have
//! none and are kept as permanent historical records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which content action the workflow performs on full approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowType {
    Publish,
    Unpublish,
}

impl WorkflowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Unpublish => "unpublish",
        }
    }

    /// Label used in caller-facing messages ("Publish request ...").
    pub fn description(&self) -> &'static str {
        match self {
            Self::Publish => "Publish",
            Self::Unpublish => "Unpublish",
        }
    }

    /// Past-tense label used in caller-facing messages ("page has been
    /// published").
    pub fn past_tense(&self) -> &'static str {
        match self {
            Self::Publish => "published",
            Self::Unpublish => "unpublished",
        }
    }
}

impl std::fmt::Display for WorkflowType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl std::str::FromStr for WorkflowType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "publish" => Ok(Self::Publish),
            "unpublish" => Ok(Self::Unpublish),
            _ => Err(format!("Unknown workflow type: {s}")),
        }
    }
}

/// Lifecycle status of a workflow instance.
///
/// `PendingApproval` spans every internal step; step advancement is a
/// sub-transition, not a separate status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    PendingApproval,
    Approved,
    Rejected,
    Cancelled,
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::Cancelled => "cancelled",
        }
    }

    /// Display name for dashboards.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PendingApproval => "Pending Approval",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
            Self::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        !matches!(self, Self::PendingApproval)
    }
}

impl std::fmt::Display for WorkflowStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for WorkflowStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            "cancelled" => Ok(Self::Cancelled),
            _ => Err(format!("Unknown workflow status: {s}")),
        }
    }
}

/// Status of one approval step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    PendingApproval,
    Approved,
    Rejected,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PendingApproval => "pending_approval",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
        }
    }

    /// Display name for dashboards.
    pub fn name(&self) -> &'static str {
        match self {
            Self::PendingApproval => "Pending Approval",
            Self::Approved => "Approved",
            Self::Rejected => "Rejected",
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for TaskStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending_approval" => Ok(Self::PendingApproval),
            "approved" => Ok(Self::Approved),
            "rejected" => Ok(Self::Rejected),
            _ => Err(format!("Unknown task status: {s}")),
        }
    }
}

/// How a caller actions the active task of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowAction {
    Approve,
    Reject,
}

/// One approval request lifecycle for a single node and workflow type.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowInstance {
    /// Globally unique instance identifier.
    pub guid: Uuid,
    /// Numeric id for joins; assigned by the store on insert.
    pub id: i64,
    /// Target content node.
    pub node_id: i32,
    pub workflow_type: WorkflowType,
    pub status: WorkflowStatus,
    /// User who requested the change.
    pub author_user_id: i32,
    pub author_comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// 1-based position in the approval chain; never decremented or reused.
    pub current_step: u32,
    /// Ordered task history, insertion order = step order.
    pub tasks: Vec<TaskInstance>,
}

impl WorkflowInstance {
    /// Create a new pending instance with no tasks yet.
    pub fn new(
        node_id: i32,
        workflow_type: WorkflowType,
        author_user_id: i32,
        author_comment: Option<String>,
    ) -> Self {
        Self {
            guid: Uuid::new_v4(),
            id: 0,
            node_id,
            workflow_type,
            status: WorkflowStatus::PendingApproval,
            author_user_id,
            author_comment,
            created_at: Utc::now(),
            completed_at: None,
            current_step: 1,
            tasks: Vec::new(),
        }
    }

    /// The unique pending task, or `None` once the instance is terminal.
    pub fn active_task(&self) -> Option<&TaskInstance> {
        self.tasks
            .iter()
            .find(|t| t.status == TaskStatus::PendingApproval)
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Open the first approval step against `group_id`.
    pub fn open_first_step(&mut self, group_id: i32) {
        self.current_step = 1;
        self.tasks
            .push(TaskInstance::new(self.guid, 1, Some(group_id)));
    }

    /// Record an auto-approval: no approval chain is configured anywhere up
    /// the tree, the content action has already been performed, and the
    /// instance becomes a completed historical record with one synthetic
    /// approved task.
    pub fn record_auto_approval(&mut self) {
        let now = Utc::now();
        let mut task = TaskInstance::new(self.guid, 1, None);
        task.complete(TaskStatus::Approved, self.author_user_id, None);
        self.tasks.push(task);
        self.status = WorkflowStatus::Approved;
        self.completed_at = Some(now);
    }
}

/// One pending-or-resolved approval step within an instance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskInstance {
    /// Numeric id; assigned by the store.
    pub id: i64,
    /// Back-reference to the owning instance.
    pub instance_guid: Uuid,
    /// 1-based step number, strictly increasing within an instance.
    pub approval_step: u32,
    /// Required approval group. `None` only on the synthetic record created
    /// by an auto-approval.
    pub group_id: Option<i32>,
    pub status: TaskStatus,
    /// User who actioned the task; set exactly once, on completion.
    pub actioned_by: Option<i32>,
    pub comment: Option<String>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl TaskInstance {
    pub fn new(instance_guid: Uuid, approval_step: u32, group_id: Option<i32>) -> Self {
        Self {
            id: 0,
            instance_guid,
            approval_step,
            group_id,
            status: TaskStatus::PendingApproval,
            actioned_by: None,
            comment: None,
            created_at: Utc::now(),
            completed_at: None,
        }
    }

    /// Resolve the task. Tasks are mutated exactly once; completing a task
    /// that has already left `PendingApproval` is a logic error upstream.
    pub fn complete(&mut self, status: TaskStatus, actioned_by: i32, comment: Option<String>) {
        self.status = status;
        self.actioned_by = Some(actioned_by);
        self.comment = comment;
        self.completed_at = Some(Utc::now());
    }
}
