//! End-to-end approval workflow tests.
//!
//! These tests verify that:
//! 1. Nodes without a configured chain auto-approve and fire the content
//!    action exactly once
//! 2. A chain of N groups requires exactly N sequential approvals
//! 3. Rejection or cancellation at any step terminates the instance with no
//!    content action
//! 4. The at-most-one-active-workflow and stale-snapshot race invariants hold
//! 5. Permission chains are inherited from the nearest configured ancestor

use std::sync::Arc;

use content_workflow::content::{ContentType, InMemoryContentService, Node};
use content_workflow::directory::{InMemoryDirectory, UserGroup};
use content_workflow::{
    ApprovalEngine, FlowFilter, MemoryWorkflowStore, PermissionResolver, PermissionTable,
    TaskStatus, WorkflowAction, WorkflowError, WorkflowService, WorkflowStatus, WorkflowStore,
    WorkflowType,
};

const EDITORS: i32 = 10;
const LEGAL: i32 = 20;

const ALICE: i32 = 100; // Editors
const BOB: i32 = 101; // Editors
const CAROL: i32 = 200; // Legal
const MALLORY: i32 = 300; // no group
const DANA: i32 = 400; // author, no group

struct Harness {
    service: WorkflowService,
    engine: ApprovalEngine,
    store: Arc<MemoryWorkflowStore>,
    content: Arc<InMemoryContentService>,
}

fn node(id: i32, name: &str, level: u32, parent_id: Option<i32>, content_type_id: i32) -> Node {
    Node {
        id,
        name: name.to_string(),
        level,
        parent_id,
        content_type: ContentType {
            id: content_type_id,
            alias: if content_type_id == 1 { "site" } else { "page" }.to_string(),
        },
    }
}

/// Content tree: Home (root) -> Products -> Widgets, Home -> About.
/// Default configuration: Products requires Editors then Legal; About and
/// the root have no rules.
fn harness() -> Harness {
    harness_with(&[(1050, 2, &[EDITORS, LEGAL])])
}

fn harness_with(rules: &[(i32, i32, &[i32])]) -> Harness {
    let content = Arc::new(
        InMemoryContentService::new()
            .with_node(node(1000, "Home", 1, None, 1))
            .with_node(node(1050, "Products", 2, Some(1000), 2))
            .with_node(node(1051, "Widgets", 3, Some(1050), 2))
            .with_node(node(1060, "About", 2, Some(1000), 2)),
    );
    let directory = Arc::new(
        InMemoryDirectory::new()
            .with_user(ALICE, "Alice")
            .with_user(BOB, "Bob")
            .with_user(CAROL, "Carol")
            .with_user(MALLORY, "Mallory")
            .with_user(DANA, "Dana")
            .with_group(UserGroup::new(EDITORS, "Editors", vec![ALICE, BOB]))
            .with_group(UserGroup::new(LEGAL, "Legal", vec![CAROL])),
    );

    let mut table = PermissionTable::new();
    for (node_id, content_type_id, groups) in rules {
        table
            .insert(*node_id, *content_type_id, groups.to_vec())
            .unwrap();
    }
    let table = Arc::new(table);
    let store = Arc::new(MemoryWorkflowStore::new());

    let resolver = PermissionResolver::new(table.clone(), content.clone(), directory.clone());
    let engine = ApprovalEngine::new(
        store.clone(),
        content.clone(),
        directory.clone(),
        resolver,
    );
    let service = WorkflowService::new(store.clone(), content.clone(), directory.clone(), table);

    Harness {
        service,
        engine,
        store,
        content,
    }
}

impl Harness {
    async fn active_task_id(&self) -> i64 {
        let pending = self.service.pending_tasks().await.unwrap();
        assert_eq!(pending.len(), 1, "expected exactly one pending task");
        pending[0].task_id
    }
}

#[tokio::test]
async fn test_empty_chain_auto_approves() {
    let h = harness();

    // About has no rule, and neither does the root: no approval required.
    let response = h
        .service
        .initiate_workflow(1060, DANA, Some("typo fix".to_string()), true)
        .await
        .unwrap();

    assert_eq!(response.message, "Workflow complete");
    assert_eq!(h.content.publish_count(1060), 1);
    assert!(!h.service.status_for_node(1060).await.unwrap());

    let instances = h.service.all_instances().await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, "Approved");
    assert_eq!(instances[0].tasks.len(), 1);
    assert_eq!(instances[0].tasks[0].status, "Approved");
    assert_eq!(instances[0].tasks[0].approval_group_id, None);
}

#[tokio::test]
async fn test_scenario_a_initiate_and_unauthorized_approval() {
    let h = harness();

    let response = h
        .service
        .initiate_workflow(1050, DANA, Some("please review".to_string()), true)
        .await
        .unwrap();
    assert_eq!(response.message, "Page submitted for approval");
    assert_eq!(h.content.publish_count(1050), 0);

    let pending = h.service.pending_tasks().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].current_step, 1);
    assert_eq!(pending[0].approval_group, "Editors");
    assert_eq!(pending[0].node_name, "Products");
    assert_eq!(pending[0].requested_by, "Dana");
    assert_eq!(pending[0].comments, "please review");

    // Mallory is in no group: actioning must be refused.
    let err = h
        .service
        .approve_task(pending[0].task_id, MALLORY, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::Unauthorized { .. }));
    assert_eq!(h.content.publish_count(1050), 0);
}

#[tokio::test]
async fn test_scenario_b_two_step_approval_publishes() {
    let h = harness();
    h.service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();

    // Step 1: an Editors member approves; the workflow stays pending and
    // step 2 opens against Legal.
    let first_task = h.active_task_id().await;
    let response = h
        .service
        .approve_task(first_task, ALICE, Some("looks good".to_string()))
        .await
        .unwrap();
    assert_eq!(
        response.message,
        "Approval completed successfully. Page will be published on workflow completion."
    );
    assert_eq!(h.content.publish_count(1050), 0);

    let pending = h.service.pending_tasks().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].current_step, 2);
    assert_eq!(pending[0].approval_group, "Legal");
    assert_ne!(pending[0].task_id, first_task);

    // Step 2: a Legal member approves; the content action fires.
    let response = h
        .service
        .approve_task(pending[0].task_id, CAROL, None)
        .await
        .unwrap();
    assert_eq!(
        response.message,
        "Workflow approved successfully, page has been published."
    );
    assert_eq!(h.content.publish_count(1050), 1);
    assert!(!h.service.status_for_node(1050).await.unwrap());

    // Full history, most recent step first.
    let instances = h.service.all_instances().await.unwrap();
    assert_eq!(instances.len(), 1);
    assert_eq!(instances[0].status, "Approved");
    let steps: Vec<u32> = instances[0].tasks.iter().map(|t| t.current_step).collect();
    assert_eq!(steps, vec![2, 1]);
    assert!(instances[0].tasks.iter().all(|t| t.status == "Approved"));
}

#[tokio::test]
async fn test_rejection_terminates_without_content_action() {
    let h = harness();
    h.service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();

    let first_task = h.active_task_id().await;
    h.service.approve_task(first_task, ALICE, None).await.unwrap();

    // Rejection at step 2 terminates the whole instance; the step 1
    // approval is not rolled back, but nothing is published.
    let second_task = h.active_task_id().await;
    let response = h
        .service
        .reject_task(second_task, CAROL, Some("legal issues".to_string()))
        .await
        .unwrap();
    assert_eq!(response.message, "Publish request has been rejected.");
    assert_eq!(h.content.publish_count(1050), 0);

    let instance = h.store.all_instances().await.unwrap().pop().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Rejected);
    assert_eq!(instance.tasks[0].status, TaskStatus::Approved);
    assert_eq!(instance.tasks[1].status, TaskStatus::Rejected);

    // The terminal outcome frees the node for a fresh workflow.
    let response = h
        .service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();
    assert_eq!(response.message, "Page submitted for approval");
}

#[tokio::test]
async fn test_rejection_at_first_step() {
    let h = harness();
    h.service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();

    let task = h.active_task_id().await;
    h.service
        .reject_task(task, BOB, Some("not ready".to_string()))
        .await
        .unwrap();

    let instance = h.store.all_instances().await.unwrap().pop().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Rejected);
    assert_eq!(instance.tasks.len(), 1);
    assert_eq!(h.content.publish_count(1050), 0);
}

#[tokio::test]
async fn test_concurrent_workflow_refused_while_active() {
    let h = harness();
    h.service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();
    assert!(h.service.status_for_node(1050).await.unwrap());

    let err = h
        .service
        .initiate_workflow(1050, ALICE, None, true)
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        WorkflowError::ConcurrentWorkflow { node_id: 1050 }
    ));

    // A different node is unaffected.
    h.service
        .initiate_workflow(1060, DANA, None, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_initiate_race_creates_one_instance() {
    let h = harness();

    let (a, b) = tokio::join!(
        h.service.initiate_workflow(1050, DANA, None, true),
        h.service.initiate_workflow(1050, ALICE, None, true),
    );

    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one initiation must win");

    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(
        loser.unwrap_err(),
        WorkflowError::ConcurrentWorkflow { node_id: 1050 }
    ));
    assert_eq!(h.store.all_instances().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_stale_approval_fails_with_invalid_state() {
    let h = harness();
    h.engine
        .initiate(
            1050,
            WorkflowType::Publish,
            DANA,
            None,
        )
        .await
        .unwrap();

    // Two approvers read the same step 1 snapshot; the second action runs
    // against a workflow that has already moved on.
    let snapshot = h
        .store
        .find_active_for_node(1050)
        .await
        .unwrap()
        .unwrap();

    h.engine
        .action(&snapshot, WorkflowAction::Approve, ALICE, None)
        .await
        .unwrap();
    let err = h
        .engine
        .action(&snapshot, WorkflowAction::Approve, BOB, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));

    // Only one approval landed: the workflow sits at step 2.
    let current = h
        .store
        .find_active_for_node(1050)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(current.current_step, 2);
}

#[tokio::test]
async fn test_final_approve_race_publishes_once() {
    let h = harness_with(&[(1050, 2, &[EDITORS])]);
    h.engine
        .initiate(
            1050,
            WorkflowType::Publish,
            DANA,
            None,
        )
        .await
        .unwrap();
    let snapshot = h
        .store
        .find_active_for_node(1050)
        .await
        .unwrap()
        .unwrap();

    let (a, b) = tokio::join!(
        h.engine.action(&snapshot, WorkflowAction::Approve, ALICE, None),
        h.engine.action(&snapshot, WorkflowAction::Approve, BOB, None),
    );

    let successes = [&a, &b].iter().filter(|r| r.is_ok()).count();
    assert_eq!(successes, 1, "exactly one approval must win");
    let loser = if a.is_ok() { b } else { a };
    assert!(matches!(
        loser.unwrap_err(),
        WorkflowError::InvalidState { .. }
    ));

    assert_eq!(h.content.publish_count(1050), 1);
    let instance = h.store.all_instances().await.unwrap().pop().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Approved);
}

#[tokio::test]
async fn test_cancellation_at_mid_step() {
    let h = harness();
    h.service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();
    let first_task = h.active_task_id().await;
    h.service.approve_task(first_task, ALICE, None).await.unwrap();

    let second_task = h.active_task_id().await;
    let response = h
        .service
        .cancel_task(second_task, DANA, Some("superseded by rewrite".to_string()))
        .await
        .unwrap();
    assert_eq!(response.message, "Publish workflow cancelled.");
    assert_eq!(h.content.publish_count(1050), 0);

    let instance = h.store.all_instances().await.unwrap().pop().unwrap();
    assert_eq!(instance.status, WorkflowStatus::Cancelled);
    // The active task is closed as rejected for record keeping.
    assert_eq!(instance.tasks[1].status, TaskStatus::Rejected);
    assert_eq!(
        instance.tasks[1].comment.as_deref(),
        Some("superseded by rewrite")
    );

    // Cancelling a terminal workflow is refused.
    let err = h
        .service
        .cancel_task(second_task, DANA, None)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));

    // The node is free again.
    h.service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();
}

#[tokio::test]
async fn test_content_action_failure_leaves_instance_pending() {
    let h = harness_with(&[(1050, 2, &[EDITORS])]);
    h.service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();
    let task = h.active_task_id().await;

    h.content.set_fail_actions(true);
    let err = h.service.approve_task(task, ALICE, None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::Collaborator { .. }));

    // The final task is approved but the instance never reports success:
    // it stays pending for manual follow-up.
    let instance = h.store.all_instances().await.unwrap().pop().unwrap();
    assert_eq!(instance.status, WorkflowStatus::PendingApproval);
    assert_eq!(instance.tasks[0].status, TaskStatus::Approved);
    assert!(instance.active_task().is_none());
    assert_eq!(h.content.publish_count(1050), 0);
}

#[tokio::test]
async fn test_permission_chain_inherited_from_ancestor() {
    let h = harness();

    // Widgets has no rule of its own; it inherits Products' chain.
    h.service
        .initiate_workflow(1051, DANA, None, true)
        .await
        .unwrap();

    let pending = h.service.pending_tasks().await.unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].node_name, "Widgets");
    assert_eq!(pending[0].approval_group, "Editors");
    let chain: Vec<i32> = pending[0]
        .permissions
        .iter()
        .map(|g| g.group_id)
        .collect();
    assert_eq!(chain, vec![EDITORS, LEGAL]);
}

#[tokio::test]
async fn test_unpublish_workflow_uses_unpublish_action() {
    let h = harness_with(&[(1050, 2, &[EDITORS])]);

    let response = h
        .service
        .initiate_workflow(1050, DANA, None, false)
        .await
        .unwrap();
    assert_eq!(response.message, "Page submitted for approval");

    let task = h.active_task_id().await;
    let response = h.service.approve_task(task, ALICE, None).await.unwrap();
    assert_eq!(
        response.message,
        "Workflow approved successfully, page has been unpublished."
    );
    assert_eq!(h.content.publish_count(1050), 0);
    assert_eq!(h.content.unpublish_count(1050), 1);
}

#[tokio::test]
async fn test_unpublish_rejection_message() {
    let h = harness_with(&[(1050, 2, &[EDITORS])]);
    h.service
        .initiate_workflow(1050, DANA, None, false)
        .await
        .unwrap();

    let task = h.active_task_id().await;
    let response = h.service.reject_task(task, ALICE, None).await.unwrap();
    assert_eq!(response.message, "Unpublish request has been rejected.");
}

#[tokio::test]
async fn test_flows_for_user() {
    let h = harness();
    h.service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();

    // Alice sits in Editors, the step 1 group: one actionable task.
    let tasks = h
        .service
        .flows_for_user(ALICE, FlowFilter::Tasks)
        .await
        .unwrap();
    assert_eq!(tasks.len(), 1);
    assert!(tasks[0].show_action_link);

    // Carol's group is step 2, which is not open yet.
    let tasks = h
        .service
        .flows_for_user(CAROL, FlowFilter::Tasks)
        .await
        .unwrap();
    assert!(tasks.is_empty());

    // Dana authored the workflow but cannot action it.
    let submissions = h
        .service
        .flows_for_user(DANA, FlowFilter::Submissions)
        .await
        .unwrap();
    assert_eq!(submissions.len(), 1);
    assert!(!submissions[0].show_action_link);
    assert!(h
        .service
        .flows_for_user(ALICE, FlowFilter::Submissions)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_unknown_node_is_invalid() {
    let h = harness();
    let err = h
        .service
        .initiate_workflow(9999, DANA, None, true)
        .await
        .unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidNode { node_id: 9999 }));
}

#[tokio::test]
async fn test_unknown_task_is_invalid_state() {
    let h = harness();
    let err = h.service.approve_task(9999, ALICE, None).await.unwrap_err();
    assert!(matches!(err, WorkflowError::InvalidState { .. }));
}

#[tokio::test]
async fn test_tasks_by_node_spans_instances() {
    let h = harness();

    // First workflow runs to rejection, the second is freshly pending.
    h.service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();
    let task = h.active_task_id().await;
    h.service.reject_task(task, ALICE, None).await.unwrap();
    h.service
        .initiate_workflow(1050, DANA, None, true)
        .await
        .unwrap();

    let tasks = h.service.tasks_by_node(1050).await.unwrap();
    assert_eq!(tasks.len(), 2);
    assert_eq!(h.service.all_tasks().await.unwrap().len(), 2);
    assert_eq!(h.service.pending_tasks().await.unwrap().len(), 1);
}
