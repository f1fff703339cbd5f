//! Permission resolution.
//!
//! Determines the ordered approval chain for a node. Explicit configuration
//! at the node wins; otherwise the walk continues up the ancestor path until
//! a configured ancestor is found or the content root is reached, at which
//! point the chain is empty and no approval is required.

use std::sync::Arc;

use tracing::debug;

use crate::config::PermissionTable;
use crate::content::{ContentService, Node};
use crate::directory::{UserDirectory, UserGroup};
use crate::WorkflowError;

/// Resolves the approval chain for content nodes.
///
/// Side-effect-free: every call re-derives from the current content tree and
/// configuration snapshot, since the hierarchy can change between calls.
#[derive(Clone)]
pub struct PermissionResolver {
    table: Arc<PermissionTable>,
    content: Arc<dyn ContentService>,
    directory: Arc<dyn UserDirectory>,
}

impl PermissionResolver {
    pub fn new(
        table: Arc<PermissionTable>,
        content: Arc<dyn ContentService>,
        directory: Arc<dyn UserDirectory>,
    ) -> Self {
        Self {
            table,
            content,
            directory,
        }
    }

    /// Resolve the ordered approval chain for `node`.
    ///
    /// The walk is an explicit loop over the ancestor path; termination is
    /// the content root (level 1). An empty result means the node requires
    /// no approval and content actions proceed immediately.
    pub async fn resolve(&self, node: &Node) -> Result<Vec<UserGroup>, WorkflowError> {
        let mut current = node.clone();

        loop {
            let group_ids = self.table.lookup(current.id, current.content_type.id);
            if !group_ids.is_empty() {
                debug!(
                    node_id = node.id,
                    rule_node_id = current.id,
                    steps = group_ids.len(),
                    "resolved permission chain"
                );
                return self.materialize(group_ids).await;
            }

            if current.is_root() {
                debug!(node_id = node.id, "no permission chain up to root");
                return Ok(Vec::new());
            }

            let parent_id = current.parent_id.ok_or(WorkflowError::InvalidNode {
                node_id: current.id,
            })?;
            current = self
                .content
                .node_by_id(parent_id)
                .await?
                .ok_or(WorkflowError::InvalidNode { node_id: parent_id })?;
        }
    }

    /// Map configured group ids to directory groups, preserving order.
    async fn materialize(&self, group_ids: &[i32]) -> Result<Vec<UserGroup>, WorkflowError> {
        let mut groups = Vec::with_capacity(group_ids.len());
        for group_id in group_ids {
            let group = self.directory.group(*group_id).await?.ok_or_else(|| {
                WorkflowError::collaborator(
                    "permission resolution",
                    format!("approval group {group_id} is not known to the directory"),
                )
            })?;
            groups.push(group);
        }
        Ok(groups)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::content::{ContentType, InMemoryContentService};
    use crate::directory::InMemoryDirectory;

    fn node(id: i32, level: u32, parent_id: Option<i32>, content_type_id: i32) -> Node {
        Node {
            id,
            name: format!("node-{id}"),
            level,
            parent_id,
            content_type: ContentType {
                id: content_type_id,
                alias: "page".to_string(),
            },
        }
    }

    fn resolver(table: PermissionTable, content: InMemoryContentService) -> PermissionResolver {
        let directory = InMemoryDirectory::new()
            .with_group(UserGroup::new(10, "Editors", vec![100]))
            .with_group(UserGroup::new(20, "Legal", vec![200]));
        PermissionResolver::new(Arc::new(table), Arc::new(content), Arc::new(directory))
    }

    #[tokio::test]
    async fn test_explicit_configuration_at_node() {
        let mut table = PermissionTable::new();
        table.insert(1050, 1, vec![10, 20]).unwrap();

        let content = InMemoryContentService::new().with_node(node(1050, 2, Some(1000), 1));
        let target = node(1050, 2, Some(1000), 1);

        let chain = resolver(table, content).resolve(&target).await.unwrap();
        let ids: Vec<i32> = chain.iter().map(|g| g.group_id).collect();
        assert_eq!(ids, vec![10, 20]);
    }

    #[tokio::test]
    async fn test_inherits_from_nearest_ancestor() {
        let mut table = PermissionTable::new();
        table.insert(1000, 1, vec![10]).unwrap();

        let content = InMemoryContentService::new()
            .with_node(node(1000, 1, None, 1))
            .with_node(node(1050, 2, Some(1000), 1))
            .with_node(node(1051, 3, Some(1050), 1));
        let target = node(1051, 3, Some(1050), 1);

        let chain = resolver(table, content).resolve(&target).await.unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].group_id, 10);
    }

    #[tokio::test]
    async fn test_root_without_configuration_is_empty() {
        let content = InMemoryContentService::new().with_node(node(1000, 1, None, 1));
        let target = node(1000, 1, None, 1);

        let chain = resolver(PermissionTable::new(), content)
            .resolve(&target)
            .await
            .unwrap();
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_rule_for_other_content_type_is_ignored() {
        let mut table = PermissionTable::new();
        table.insert(1050, 7, vec![10]).unwrap();

        let content = InMemoryContentService::new().with_node(node(1000, 1, None, 1));
        // Same node id, content type 1: the rule keyed on type 7 must not apply.
        let target = node(1050, 2, Some(1000), 1);

        let chain = resolver(table, content).resolve(&target).await.unwrap();
        assert!(chain.is_empty());
    }

    #[tokio::test]
    async fn test_missing_parent_is_invalid_node() {
        let content = InMemoryContentService::new();
        let target = node(1050, 2, Some(999), 1);

        let err = resolver(PermissionTable::new(), content)
            .resolve(&target)
            .await
            .unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidNode { node_id: 999 }));
    }

    #[tokio::test]
    async fn test_unknown_group_in_configuration() {
        let mut table = PermissionTable::new();
        table.insert(1050, 1, vec![99]).unwrap();

        let content = InMemoryContentService::new();
        let target = node(1050, 2, Some(1000), 1);

        let err = resolver(table, content).resolve(&target).await.unwrap_err();
        assert!(matches!(err, WorkflowError::Collaborator { .. }));
    }
}
