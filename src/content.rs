//! Content-system collaborator.
//!
//! The engine consumes the content platform through this narrow surface:
//! node lookup for permission resolution, and the publish/unpublish content
//! actions performed once a workflow is fully approved.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::WorkflowError;

/// Content type of a node. Permission configuration is keyed by
/// `(node, content type)`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentType {
    pub id: i32,
    pub alias: String,
}

/// A node in the content tree. The root sits at level 1.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Node {
    pub id: i32,
    pub name: String,
    pub level: u32,
    pub parent_id: Option<i32>,
    pub content_type: ContentType,
}

impl Node {
    /// Whether this node is the content root (nothing above it to inherit
    /// permissions from).
    pub fn is_root(&self) -> bool {
        self.level <= 1
    }
}

/// Capability surface of the content platform.
#[async_trait]
pub trait ContentService: Send + Sync {
    /// Look up a node by id. `None` when the node does not exist.
    async fn node_by_id(&self, node_id: i32) -> Result<Option<Node>, WorkflowError>;

    /// Publish the node. Invoked exactly once, on full approval of a
    /// publish workflow.
    async fn publish(&self, node_id: i32) -> Result<(), WorkflowError>;

    /// Unpublish the node. Invoked exactly once, on full approval of an
    /// unpublish workflow.
    async fn unpublish(&self, node_id: i32) -> Result<(), WorkflowError>;
}

/// In-memory content tree, used in tests and as a standalone default.
///
/// Records every publish/unpublish call so callers can assert the content
/// action fired exactly once.
#[derive(Default)]
pub struct InMemoryContentService {
    nodes: HashMap<i32, Node>,
    published: Mutex<Vec<i32>>,
    unpublished: Mutex<Vec<i32>>,
    fail_actions: AtomicBool,
}

impl InMemoryContentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a node to the tree, returning `self` for chained setup.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.insert(node.id, node);
        self
    }

    pub fn insert_node(&mut self, node: Node) {
        self.nodes.insert(node.id, node);
    }

    /// Make subsequent publish/unpublish calls fail, simulating a content
    /// platform outage.
    pub fn set_fail_actions(&self, fail: bool) {
        self.fail_actions.store(fail, Ordering::SeqCst);
    }

    /// How many times `publish` has been called for the node.
    pub fn publish_count(&self, node_id: i32) -> usize {
        self.published
            .lock()
            .unwrap()
            .iter()
            .filter(|id| **id == node_id)
            .count()
    }

    /// How many times `unpublish` has been called for the node.
    pub fn unpublish_count(&self, node_id: i32) -> usize {
        self.unpublished
            .lock()
            .unwrap()
            .iter()
            .filter(|id| **id == node_id)
            .count()
    }

    fn check_available(&self, action: &str, node_id: i32) -> Result<(), WorkflowError> {
        if self.fail_actions.load(Ordering::SeqCst) {
            return Err(WorkflowError::collaborator(
                format!("{action} of node {node_id}"),
                "content platform unavailable",
            ));
        }
        Ok(())
    }
}

#[async_trait]
impl ContentService for InMemoryContentService {
    async fn node_by_id(&self, node_id: i32) -> Result<Option<Node>, WorkflowError> {
        Ok(self.nodes.get(&node_id).cloned())
    }

    async fn publish(&self, node_id: i32) -> Result<(), WorkflowError> {
        self.check_available("publish", node_id)?;
        self.published.lock().unwrap().push(node_id);
        Ok(())
    }

    async fn unpublish(&self, node_id: i32) -> Result<(), WorkflowError> {
        self.check_available("unpublish", node_id)?;
        self.unpublished.lock().unwrap().push(node_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn node(id: i32, level: u32, parent_id: Option<i32>) -> Node {
        Node {
            id,
            name: format!("node-{id}"),
            level,
            parent_id,
            content_type: ContentType {
                id: 1,
                alias: "page".to_string(),
            },
        }
    }

    #[tokio::test]
    async fn test_node_lookup() {
        let content = InMemoryContentService::new().with_node(node(1000, 1, None));

        assert!(content.node_by_id(1000).await.unwrap().is_some());
        assert!(content.node_by_id(9999).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_publish_is_recorded() {
        let content = InMemoryContentService::new().with_node(node(1000, 1, None));

        content.publish(1000).await.unwrap();
        assert_eq!(content.publish_count(1000), 1);
        assert_eq!(content.unpublish_count(1000), 0);
    }

    #[tokio::test]
    async fn test_failing_actions() {
        let content = InMemoryContentService::new().with_node(node(1000, 1, None));
        content.set_fail_actions(true);

        let err = content.publish(1000).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Collaborator { .. }));
        assert_eq!(content.publish_count(1000), 0);
    }
}
