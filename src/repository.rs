//! Postgres-backed workflow store.
//!
//! Available behind the `database` feature. All queries are runtime-checked
//! `sqlx::query()` rather than compile-time macros, because the tables are
//! created by [`PgWorkflowStore::ensure_schema`] and may not exist at compile
//! time. The atomic units required by the store contract map to one
//! transaction each: row locks serialize transitions per instance, and a
//! partial unique index enforces at most one active instance per node.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::state::{TaskInstance, TaskStatus, WorkflowInstance, WorkflowStatus, WorkflowType};
use crate::store::{TaskRecord, TransitionOutcome, WorkflowStore};
use crate::WorkflowError;

/// Constraint backing the at-most-one-active-instance-per-node invariant.
const ACTIVE_NODE_CONSTRAINT: &str = "uq_workflow_instances_active_node";

const MIGRATIONS: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS workflow_instances (
        guid UUID PRIMARY KEY,
        id BIGINT GENERATED ALWAYS AS IDENTITY UNIQUE,
        node_id INT NOT NULL,
        workflow_type TEXT NOT NULL,
        status TEXT NOT NULL,
        author_user_id INT NOT NULL,
        author_comment TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        current_step INT NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS workflow_tasks (
        id BIGINT GENERATED ALWAYS AS IDENTITY PRIMARY KEY,
        instance_guid UUID NOT NULL REFERENCES workflow_instances (guid),
        approval_step INT NOT NULL,
        group_id INT,
        status TEXT NOT NULL,
        actioned_by INT,
        comment TEXT,
        created_at TIMESTAMPTZ NOT NULL,
        completed_at TIMESTAMPTZ,
        UNIQUE (instance_guid, approval_step)
    )
    "#,
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS uq_workflow_instances_active_node
    ON workflow_instances (node_id)
    WHERE status = 'pending_approval'
    "#,
];

/// Workflow store on Postgres.
pub struct PgWorkflowStore {
    pool: PgPool,
}

impl PgWorkflowStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Create tables and indexes if they do not exist.
    pub async fn ensure_schema(&self) -> Result<(), WorkflowError> {
        for statement in MIGRATIONS {
            sqlx::query(statement).execute(&self.pool).await?;
        }
        Ok(())
    }

    async fn load_tasks(&self, guid: Uuid) -> Result<Vec<TaskInstance>, WorkflowError> {
        let rows = sqlx::query_as::<_, TaskRow>(
            r#"
            SELECT id, instance_guid, approval_step, group_id, status,
                   actioned_by, comment, created_at, completed_at
            FROM workflow_tasks
            WHERE instance_guid = $1
            ORDER BY approval_step ASC
            "#,
        )
        .bind(guid)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(TaskRow::into_task).collect()
    }

    async fn load_instance(
        &self,
        guid: Uuid,
    ) -> Result<Option<WorkflowInstance>, WorkflowError> {
        let row = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT guid, id, node_id, workflow_type, status, author_user_id,
                   author_comment, created_at, completed_at, current_step
            FROM workflow_instances
            WHERE guid = $1
            "#,
        )
        .bind(guid)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => {
                let tasks = self.load_tasks(guid).await?;
                Ok(Some(row.into_instance(tasks)?))
            }
            None => Ok(None),
        }
    }

    /// Load full instances for a set of guids, preserving the given order.
    async fn load_instances(
        &self,
        guids: &[Uuid],
    ) -> Result<Vec<WorkflowInstance>, WorkflowError> {
        let mut instances = Vec::with_capacity(guids.len());
        for guid in guids {
            if let Some(instance) = self.load_instance(*guid).await? {
                instances.push(instance);
            }
        }
        Ok(instances)
    }

    async fn tasks_where(
        &self,
        filter: &str,
        bind_node: Option<i32>,
    ) -> Result<Vec<TaskRecord>, WorkflowError> {
        let sql = format!(
            r#"
            SELECT i.guid
            FROM workflow_instances i
            WHERE {filter}
            ORDER BY i.id ASC
            "#
        );
        let mut query = sqlx::query_scalar::<_, Uuid>(&sql);
        if let Some(node_id) = bind_node {
            query = query.bind(node_id);
        }
        let guids = query.fetch_all(&self.pool).await?;

        let mut records = Vec::new();
        for instance in self.load_instances(&guids).await? {
            for task in &instance.tasks {
                records.push(TaskRecord {
                    task: task.clone(),
                    instance: Some(instance.clone()),
                });
            }
        }
        Ok(records)
    }
}

#[async_trait]
impl WorkflowStore for PgWorkflowStore {
    async fn insert_instance(
        &self,
        mut instance: WorkflowInstance,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let mut tx = self.pool.begin().await?;

        let insert = sqlx::query_scalar::<_, i64>(
            r#"
            INSERT INTO workflow_instances
                (guid, node_id, workflow_type, status, author_user_id,
                 author_comment, created_at, completed_at, current_step)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING id
            "#,
        )
        .bind(instance.guid)
        .bind(instance.node_id)
        .bind(instance.workflow_type.as_str())
        .bind(instance.status.as_str())
        .bind(instance.author_user_id)
        .bind(&instance.author_comment)
        .bind(instance.created_at)
        .bind(instance.completed_at)
        .bind(instance.current_step as i32)
        .fetch_one(&mut *tx)
        .await;

        instance.id = match insert {
            Ok(id) => id,
            Err(sqlx::Error::Database(db))
                if db.constraint() == Some(ACTIVE_NODE_CONSTRAINT) =>
            {
                return Err(WorkflowError::ConcurrentWorkflow {
                    node_id: instance.node_id,
                });
            }
            Err(e) => return Err(e.into()),
        };

        for task in &mut instance.tasks {
            let id = sqlx::query_scalar::<_, i64>(
                r#"
                INSERT INTO workflow_tasks
                    (instance_guid, approval_step, group_id, status,
                     actioned_by, comment, created_at, completed_at)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
                RETURNING id
                "#,
            )
            .bind(task.instance_guid)
            .bind(task.approval_step as i32)
            .bind(task.group_id)
            .bind(task.status.as_str())
            .bind(task.actioned_by)
            .bind(&task.comment)
            .bind(task.created_at)
            .bind(task.completed_at)
            .fetch_one(&mut *tx)
            .await?;
            task.id = id;
        }

        tx.commit().await?;
        Ok(instance)
    }

    async fn instance(&self, guid: Uuid) -> Result<Option<WorkflowInstance>, WorkflowError> {
        self.load_instance(guid).await
    }

    async fn instance_by_task(
        &self,
        task_id: i64,
    ) -> Result<Option<WorkflowInstance>, WorkflowError> {
        let guid = sqlx::query_scalar::<_, Uuid>(
            "SELECT instance_guid FROM workflow_tasks WHERE id = $1",
        )
        .bind(task_id)
        .fetch_optional(&self.pool)
        .await?;

        match guid {
            Some(guid) => self.load_instance(guid).await,
            None => Ok(None),
        }
    }

    async fn find_active_for_node(
        &self,
        node_id: i32,
    ) -> Result<Option<WorkflowInstance>, WorkflowError> {
        let guid = sqlx::query_scalar::<_, Uuid>(
            r#"
            SELECT guid FROM workflow_instances
            WHERE node_id = $1 AND status = 'pending_approval'
            "#,
        )
        .bind(node_id)
        .fetch_optional(&self.pool)
        .await?;

        match guid {
            Some(guid) => self.load_instance(guid).await,
            None => Ok(None),
        }
    }

    async fn apply_transition(
        &self,
        guid: Uuid,
        expected_step: u32,
        outcome: TransitionOutcome,
        actioned_by: i32,
        comment: Option<String>,
    ) -> Result<WorkflowInstance, WorkflowError> {
        let mut tx = self.pool.begin().await?;
        let now = Utc::now();

        // Compare-and-set under a row lock: the caller's snapshot must still
        // hold, otherwise a concurrent transition won the race.
        let locked = sqlx::query_as::<_, InstanceRow>(
            r#"
            SELECT guid, id, node_id, workflow_type, status, author_user_id,
                   author_comment, created_at, completed_at, current_step
            FROM workflow_instances
            WHERE guid = $1
            FOR UPDATE
            "#,
        )
        .bind(guid)
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| {
            WorkflowError::invalid_state(format!("workflow instance {guid} not found"))
        })?;

        if locked.status != WorkflowStatus::PendingApproval.as_str() {
            return Err(WorkflowError::invalid_state(format!(
                "workflow instance {guid} is already {}",
                locked.status
            )));
        }
        if locked.current_step != expected_step as i32 {
            return Err(WorkflowError::invalid_state(format!(
                "workflow instance {guid} moved from step {expected_step} to step {}",
                locked.current_step
            )));
        }

        let active_task_id = sqlx::query_scalar::<_, i64>(
            r#"
            SELECT id FROM workflow_tasks
            WHERE instance_guid = $1 AND status = 'pending_approval'
            FOR UPDATE
            "#,
        )
        .bind(guid)
        .fetch_optional(&mut *tx)
        .await?;

        let complete_task = |status: TaskStatus, task_id: i64| {
            sqlx::query(
                r#"
                UPDATE workflow_tasks
                SET status = $1, actioned_by = $2, comment = $3, completed_at = $4
                WHERE id = $5
                "#,
            )
            .bind(status.as_str())
            .bind(actioned_by)
            .bind(comment.clone())
            .bind(now)
            .bind(task_id)
        };

        match outcome {
            TransitionOutcome::Reject | TransitionOutcome::Cancel => {
                let task_id = active_task_id.ok_or_else(|| {
                    WorkflowError::invalid_state(format!(
                        "workflow instance {guid} has no active task"
                    ))
                })?;
                complete_task(TaskStatus::Rejected, task_id)
                    .execute(&mut *tx)
                    .await?;

                let status = if matches!(outcome, TransitionOutcome::Reject) {
                    WorkflowStatus::Rejected
                } else {
                    WorkflowStatus::Cancelled
                };
                sqlx::query(
                    r#"
                    UPDATE workflow_instances
                    SET status = $1, completed_at = $2
                    WHERE guid = $3
                    "#,
                )
                .bind(status.as_str())
                .bind(now)
                .bind(guid)
                .execute(&mut *tx)
                .await?;
            }
            TransitionOutcome::AdvanceStep { next_group_id } => {
                let task_id = active_task_id.ok_or_else(|| {
                    WorkflowError::invalid_state(format!(
                        "workflow instance {guid} has no active task"
                    ))
                })?;
                complete_task(TaskStatus::Approved, task_id)
                    .execute(&mut *tx)
                    .await?;

                let next_step = expected_step as i32 + 1;
                sqlx::query(
                    "UPDATE workflow_instances SET current_step = $1 WHERE guid = $2",
                )
                .bind(next_step)
                .bind(guid)
                .execute(&mut *tx)
                .await?;
                sqlx::query(
                    r#"
                    INSERT INTO workflow_tasks
                        (instance_guid, approval_step, group_id, status, created_at)
                    VALUES ($1, $2, $3, 'pending_approval', $4)
                    "#,
                )
                .bind(guid)
                .bind(next_step)
                .bind(next_group_id)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
            TransitionOutcome::ApproveFinalTask => {
                let task_id = active_task_id.ok_or_else(|| {
                    WorkflowError::invalid_state(format!(
                        "workflow instance {guid} has no active task"
                    ))
                })?;
                complete_task(TaskStatus::Approved, task_id)
                    .execute(&mut *tx)
                    .await?;
            }
            TransitionOutcome::Finalize => {
                if active_task_id.is_some() {
                    return Err(WorkflowError::invalid_state(format!(
                        "workflow instance {guid} still has an active task"
                    )));
                }
                let final_approved = sqlx::query_scalar::<_, i64>(
                    r#"
                    SELECT id FROM workflow_tasks
                    WHERE instance_guid = $1 AND status = 'approved'
                      AND approval_step = $2
                    "#,
                )
                .bind(guid)
                .bind(expected_step as i32)
                .fetch_optional(&mut *tx)
                .await?;
                if final_approved.is_none() {
                    return Err(WorkflowError::invalid_state(format!(
                        "workflow instance {guid} final task is not approved"
                    )));
                }
                sqlx::query(
                    r#"
                    UPDATE workflow_instances
                    SET status = 'approved', completed_at = $1
                    WHERE guid = $2
                    "#,
                )
                .bind(now)
                .bind(guid)
                .execute(&mut *tx)
                .await?;
            }
        }

        tx.commit().await?;

        self.load_instance(guid).await?.ok_or_else(|| {
            WorkflowError::invalid_state(format!("workflow instance {guid} not found"))
        })
    }

    async fn pending_tasks(&self) -> Result<Vec<TaskRecord>, WorkflowError> {
        let records = self
            .tasks_where("i.status = 'pending_approval'", None)
            .await?;
        Ok(records
            .into_iter()
            .filter(|r| r.task.status == TaskStatus::PendingApproval)
            .collect())
    }

    async fn all_tasks(&self) -> Result<Vec<TaskRecord>, WorkflowError> {
        self.tasks_where("TRUE", None).await
    }

    async fn tasks_by_node(&self, node_id: i32) -> Result<Vec<TaskRecord>, WorkflowError> {
        self.tasks_where("i.node_id = $1", Some(node_id)).await
    }

    async fn all_instances(&self) -> Result<Vec<WorkflowInstance>, WorkflowError> {
        let guids = sqlx::query_scalar::<_, Uuid>(
            "SELECT guid FROM workflow_instances ORDER BY id ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        self.load_instances(&guids).await
    }
}

#[derive(Debug, FromRow)]
struct InstanceRow {
    guid: Uuid,
    id: i64,
    node_id: i32,
    workflow_type: String,
    status: String,
    author_user_id: i32,
    author_comment: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
    current_step: i32,
}

impl InstanceRow {
    fn into_instance(self, tasks: Vec<TaskInstance>) -> Result<WorkflowInstance, WorkflowError> {
        Ok(WorkflowInstance {
            guid: self.guid,
            id: self.id,
            node_id: self.node_id,
            workflow_type: parse_column::<WorkflowType>(&self.workflow_type)?,
            status: parse_column::<WorkflowStatus>(&self.status)?,
            author_user_id: self.author_user_id,
            author_comment: self.author_comment,
            created_at: self.created_at,
            completed_at: self.completed_at,
            current_step: self.current_step as u32,
            tasks,
        })
    }
}

#[derive(Debug, FromRow)]
struct TaskRow {
    id: i64,
    instance_guid: Uuid,
    approval_step: i32,
    group_id: Option<i32>,
    status: String,
    actioned_by: Option<i32>,
    comment: Option<String>,
    created_at: DateTime<Utc>,
    completed_at: Option<DateTime<Utc>>,
}

impl TaskRow {
    fn into_task(self) -> Result<TaskInstance, WorkflowError> {
        Ok(TaskInstance {
            id: self.id,
            instance_guid: self.instance_guid,
            approval_step: self.approval_step as u32,
            group_id: self.group_id,
            status: parse_column::<TaskStatus>(&self.status)?,
            actioned_by: self.actioned_by,
            comment: self.comment,
            created_at: self.created_at,
            completed_at: self.completed_at,
        })
    }
}

fn parse_column<T: std::str::FromStr<Err = String>>(raw: &str) -> Result<T, WorkflowError> {
    raw.parse()
        .map_err(|e: String| WorkflowError::collaborator("store decode", e))
}
