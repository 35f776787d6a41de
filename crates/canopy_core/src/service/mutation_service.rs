//! Destructive forest operations: move, duplicate, paste, trash, recover,
//! remove, import and undo replay.
//!
//! # Responsibility
//! - Compose the repositories, entity cascades and hooks into atomic
//!   multi-node mutations.
//! - Enforce cycle prevention and operation caps above the storage layer.
//!
//! # Invariants
//! - Every operation runs inside one transaction spanning both schemas;
//!   partial failure leaves no trace.
//! - Cloned and imported nodes always start at `version = 1` with trash
//!   fields stripped.
//! - Hard delete proceeds children-first (DFS post-order).

use crate::config::CoreConfig;
use crate::model::command::{ErrorCode, NameConflictMode, ReplayOp};
use crate::model::event::ChangeRecord;
use crate::model::ids::NodeId;
use crate::model::node::TreeNode;
use crate::naming::create_new_name;
use crate::plugin::hooks::{HookContext, HookError, HookFailureLog, HookStage};
use crate::plugin::lifecycle;
use crate::plugin::registry::PluginRegistry;
use crate::repo::entity_repo::EntityRepoError;
use crate::repo::node_repo::{self, NodeRepoError};
use log::info;
use rusqlite::{Connection, Transaction, TransactionBehavior};
use std::collections::{HashMap, HashSet, VecDeque};
use std::error::Error;
use std::fmt::{Display, Formatter};

/// Result type for mutation service operations.
pub type MutationServiceResult<T> = Result<T, MutationServiceError>;

/// Errors from mutation service operations.
#[derive(Debug)]
pub enum MutationServiceError {
    /// Referenced node or target parent does not exist.
    NodeNotFound(NodeId),
    /// The move/paste target sits inside the moved subtree.
    IllegalRelation { node_id: NodeId, to_parent: NodeId },
    /// Sibling name collision under error conflict mode.
    NameNotUnique { parent: NodeId, name: String },
    /// Operation exceeds a configured cap.
    LimitExceeded {
        what: &'static str,
        actual: usize,
        max: usize,
    },
    /// No input ids were provided.
    EmptyInput,
    /// Paste/import payload is malformed.
    InvalidPayload(String),
    /// A `stop_on_error` hook aborted the mutation.
    HookAborted(HookError),
    /// Forest persistence failure.
    Repo(NodeRepoError),
    /// Entity persistence failure.
    Entity(EntityRepoError),
}

impl Display for MutationServiceError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NodeNotFound(id) => write!(f, "node not found: {id}"),
            Self::IllegalRelation { node_id, to_parent } => write!(
                f,
                "cannot attach {node_id} under its own descendant {to_parent}"
            ),
            Self::NameNotUnique { parent, name } => {
                write!(f, "name `{name}` already taken under {parent}")
            }
            Self::LimitExceeded { what, actual, max } => {
                write!(f, "{what} count {actual} exceeds limit {max}")
            }
            Self::EmptyInput => write!(f, "at least one node id is required"),
            Self::InvalidPayload(message) => write!(f, "invalid payload: {message}"),
            Self::HookAborted(err) => write!(f, "hook aborted mutation: {err}"),
            Self::Repo(err) => write!(f, "{err}"),
            Self::Entity(err) => write!(f, "{err}"),
        }
    }
}

impl Error for MutationServiceError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::Repo(err) => Some(err),
            Self::Entity(err) => Some(err),
            Self::HookAborted(err) => Some(err),
            _ => None,
        }
    }
}

impl From<NodeRepoError> for MutationServiceError {
    fn from(value: NodeRepoError) -> Self {
        match value {
            NodeRepoError::NodeNotFound(id) => Self::NodeNotFound(id),
            other => Self::Repo(other),
        }
    }
}

impl From<EntityRepoError> for MutationServiceError {
    fn from(value: EntityRepoError) -> Self {
        Self::Entity(value)
    }
}

impl From<rusqlite::Error> for MutationServiceError {
    fn from(value: rusqlite::Error) -> Self {
        Self::Repo(NodeRepoError::from(value))
    }
}

impl MutationServiceError {
    /// Stable error code for this failure.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NodeNotFound(_) => ErrorCode::NodeNotFound,
            Self::IllegalRelation { .. } => ErrorCode::IllegalRelation,
            Self::NameNotUnique { .. } => ErrorCode::NameNotUnique,
            Self::LimitExceeded { .. } | Self::EmptyInput | Self::InvalidPayload(_) => {
                ErrorCode::InvalidOperation
            }
            Self::HookAborted(_) => ErrorCode::ValidationError,
            Self::Repo(_) | Self::Entity(_) => ErrorCode::DatabaseError,
        }
    }
}

/// Result of one committed mutation.
#[derive(Debug, Default)]
pub struct MutationOutcome {
    /// Change records in commit order, ready for publication.
    pub changes: Vec<ChangeRecord>,
    /// Ids of nodes minted by the operation (duplicate/paste/import).
    pub new_node_ids: Vec<NodeId>,
}

/// Mutation service over the attached two-schema store.
pub struct MutationService<'a> {
    conn: &'a Connection,
    registry: &'a PluginRegistry,
    hook_log: &'a HookFailureLog,
    config: &'a CoreConfig,
}

impl<'a> MutationService<'a> {
    pub fn new(
        conn: &'a Connection,
        registry: &'a PluginRegistry,
        hook_log: &'a HookFailureLog,
        config: &'a CoreConfig,
    ) -> Self {
        Self {
            conn,
            registry,
            hook_log,
            config,
        }
    }

    /// Reparents nodes under `to_parent`, rejecting moves into the moved
    /// subtree.
    pub fn move_nodes(
        &self,
        node_ids: &[NodeId],
        to_parent: &NodeId,
        on_name_conflict: NameConflictMode,
        now: i64,
    ) -> MutationServiceResult<MutationOutcome> {
        require_input(node_ids)?;
        let tx = self.begin()?;
        node_repo::get_node_required(&tx, to_parent)?;

        let mut siblings = node_repo::sibling_names(&tx, to_parent, None)?;
        let mut outcome = MutationOutcome::default();

        for node_id in node_ids {
            let node = node_repo::get_node_required(&tx, node_id)?;
            self.ensure_no_cycle(&tx, node_id, to_parent)?;
            self.run_hooks(HookStage::BeforeMove, &node)?;

            // Moving within the same parent keeps the name reserved.
            if node.parent_node_id == *to_parent {
                siblings.remove(&node.name);
            }
            let name = resolve_name(&mut siblings, &node.name, on_name_conflict, to_parent)?;

            let mut moved = node.clone();
            moved.parent_node_id = to_parent.clone();
            moved.name = name;
            moved.updated_at = now;
            moved.version += 1;

            outcome.changes.push(node_repo::update_node(&tx, &moved)?);
            self.run_hooks(HookStage::AfterMove, &moved)?;
        }

        tx.commit()?;
        info!(
            "event=move_nodes module=service status=ok count={} to_parent={}",
            node_ids.len(),
            to_parent
        );
        Ok(outcome)
    }

    /// Clones whole subtrees under `to_parent`. The root clone gets a
    /// `" (Copy)"` suffix; interior clones keep their names; every clone
    /// starts at version 1.
    pub fn duplicate_nodes(
        &self,
        node_ids: &[NodeId],
        to_parent: &NodeId,
        on_name_conflict: NameConflictMode,
        now: i64,
    ) -> MutationServiceResult<MutationOutcome> {
        require_input(node_ids)?;
        let tx = self.begin()?;
        node_repo::get_node_required(&tx, to_parent)?;

        let mut siblings = node_repo::sibling_names(&tx, to_parent, None)?;
        let mut outcome = MutationOutcome::default();

        for source_id in node_ids {
            let subtree = collect_subtree(&tx, source_id, false)?;
            self.check_subtree_cap(subtree.len())?;

            let mut id_map: HashMap<NodeId, NodeId> = HashMap::new();
            for node in &subtree {
                id_map.insert(node.id.clone(), NodeId::generate());
            }

            for (index, source) in subtree.iter().enumerate() {
                let clone_id = id_map[&source.id].clone();
                let (parent, name) = if index == 0 {
                    let base = format!("{} (Copy)", source.name);
                    let name =
                        resolve_name(&mut siblings, &base, on_name_conflict, to_parent)?;
                    (to_parent.clone(), name)
                } else {
                    let parent = id_map
                        .get(&source.parent_node_id)
                        .cloned()
                        .unwrap_or_else(|| to_parent.clone());
                    (parent, source.name.clone())
                };

                let mut clone = TreeNode::new(clone_id.clone(), parent, source.node_type.clone(), name, now);
                clone.description = source.description.clone();

                self.run_hooks(HookStage::BeforeCreate, &clone)?;
                outcome.changes.push(node_repo::insert_node(&tx, &clone)?);
                lifecycle::on_node_duplicate(
                    &tx,
                    self.registry,
                    &source.id,
                    &clone.id,
                    &clone.node_type,
                    now,
                )?;
                self.run_hooks(HookStage::AfterCreate, &clone)?;

                if index == 0 {
                    outcome.new_node_ids.push(clone_id);
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Writes a copied payload back into the forest under `to_parent`.
    ///
    /// All pasted nodes get fresh ids; root names are resolved against a
    /// preloaded sibling set; under error conflict mode the first
    /// collision aborts the whole paste.
    pub fn paste_nodes(
        &self,
        nodes: &[TreeNode],
        node_ids: &[NodeId],
        to_parent: &NodeId,
        on_name_conflict: NameConflictMode,
        now: i64,
    ) -> MutationServiceResult<MutationOutcome> {
        require_input(node_ids)?;
        if nodes.len() > self.config.max_paste_nodes {
            return Err(MutationServiceError::LimitExceeded {
                what: "pasted node",
                actual: nodes.len(),
                max: self.config.max_paste_nodes,
            });
        }

        let tx = self.begin()?;
        node_repo::get_node_required(&tx, to_parent)?;
        let outcome = self.insert_foreign_subtrees(&tx, nodes, node_ids, to_parent, on_name_conflict, now)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Soft-deletes live nodes into their tree's trash root, recording the
    /// fields needed for restoration.
    pub fn move_to_trash(
        &self,
        node_ids: &[NodeId],
        now: i64,
    ) -> MutationServiceResult<MutationOutcome> {
        require_input(node_ids)?;
        let tx = self.begin()?;
        let mut outcome = MutationOutcome::default();

        for node_id in node_ids {
            let node = node_repo::get_node_required(&tx, node_id)?;
            if node.is_trashed() {
                continue;
            }
            let tree = node_repo::containing_tree(&tx, node_id)?
                .ok_or_else(|| MutationServiceError::NodeNotFound(node_id.clone()))?;

            self.run_hooks(HookStage::BeforeDelete, &node)?;
            let mut trashed = node;
            trashed.mark_trashed(tree.trash_root_node_id.clone(), now);
            outcome.changes.push(node_repo::update_node(&tx, &trashed)?);
            self.run_hooks(HookStage::AfterDelete, &trashed)?;
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Restores trashed nodes to `to_parent` or their original parent.
    ///
    /// Nodes that are not trashed are skipped. A missing target parent
    /// fails with `NodeNotFound` and rolls the batch back.
    pub fn recover_from_trash(
        &self,
        node_ids: &[NodeId],
        to_parent: Option<&NodeId>,
        on_name_conflict: NameConflictMode,
        now: i64,
    ) -> MutationServiceResult<MutationOutcome> {
        require_input(node_ids)?;
        let tx = self.begin()?;
        let mut outcome = MutationOutcome::default();

        for node_id in node_ids {
            let node = node_repo::get_node_required(&tx, node_id)?;
            if !node.is_trashed() {
                continue;
            }

            let target = match to_parent {
                Some(parent) => parent.clone(),
                None => node
                    .original_parent_node_id
                    .clone()
                    .unwrap_or_else(|| node.parent_node_id.clone()),
            };
            node_repo::get_node_required(&tx, &target)?;

            let desired = node.original_name.clone().unwrap_or_else(|| node.name.clone());
            let mut siblings = node_repo::sibling_names(&tx, &target, None)?;
            let name = resolve_name(&mut siblings, &desired, on_name_conflict, &target)?;

            let mut recovered = node;
            recovered.mark_recovered(target, name, now);
            outcome
                .changes
                .push(node_repo::update_node(&tx, &recovered)?);
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Hard-deletes subtrees, children first, cascading entity cleanup per
    /// node.
    pub fn remove(&self, node_ids: &[NodeId], now: i64) -> MutationServiceResult<MutationOutcome> {
        require_input(node_ids)?;
        let tx = self.begin()?;
        let mut outcome = MutationOutcome::default();

        for node_id in node_ids {
            let subtree = collect_subtree(&tx, node_id, true)?;
            // DFS post-order: delete leaves before their parents.
            for node in subtree.iter().rev() {
                self.run_hooks(HookStage::BeforeDelete, node)?;
                outcome.changes.push(node_repo::delete_node(&tx, &node.id)?);
                lifecycle::on_node_delete(&tx, self.registry, &node.id, &node.node_type, now)?;
                self.run_hooks(HookStage::AfterDelete, node)?;
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    /// Imports foreign rows under `to_parent`, minting fresh ids in a
    /// first pass and rewriting parent links through the id map in the
    /// second.
    pub fn import_nodes(
        &self,
        nodes: &[TreeNode],
        node_ids: &[NodeId],
        to_parent: &NodeId,
        on_name_conflict: NameConflictMode,
        now: i64,
    ) -> MutationServiceResult<MutationOutcome> {
        require_input(node_ids)?;
        if nodes.len() > self.config.max_paste_nodes {
            return Err(MutationServiceError::LimitExceeded {
                what: "imported node",
                actual: nodes.len(),
                max: self.config.max_paste_nodes,
            });
        }

        let tx = self.begin()?;
        node_repo::get_node_required(&tx, to_parent)?;
        let outcome = self.insert_foreign_subtrees(&tx, nodes, node_ids, to_parent, on_name_conflict, now)?;
        tx.commit()?;
        Ok(outcome)
    }

    /// Executes one recorded replay payload (undo/redo). Rows are written
    /// exactly as recorded; entity cascades keep entity state consistent
    /// with the replayed node rows.
    pub fn replay(&self, op: &ReplayOp, now: i64) -> MutationServiceResult<MutationOutcome> {
        let tx = self.begin()?;
        let mut outcome = MutationOutcome::default();

        match op {
            ReplayOp::CreateNodes { nodes } => {
                for node in nodes {
                    outcome.changes.push(node_repo::insert_node(&tx, node)?);
                    lifecycle::on_node_create(&tx, self.registry, &node.id, &node.node_type, now)?;
                    outcome.new_node_ids.push(node.id.clone());
                }
            }
            ReplayOp::DeleteNodes { node_ids } => {
                // Recorded parents-first; delete children-first.
                for node_id in node_ids.iter().rev() {
                    let node = node_repo::get_node_required(&tx, node_id)?;
                    outcome.changes.push(node_repo::delete_node(&tx, node_id)?);
                    lifecycle::on_node_delete(&tx, self.registry, node_id, &node.node_type, now)?;
                }
            }
            ReplayOp::WriteNodes { nodes } => {
                for node in nodes {
                    outcome.changes.push(node_repo::update_node(&tx, node)?);
                }
            }
        }

        tx.commit()?;
        Ok(outcome)
    }

    fn begin(&self) -> MutationServiceResult<Transaction<'a>> {
        Ok(Transaction::new_unchecked(
            self.conn,
            TransactionBehavior::Immediate,
        )?)
    }

    /// Rejects attaching `node_id` under itself or one of its
    /// descendants, by walking ancestors of the target parent.
    fn ensure_no_cycle(
        &self,
        tx: &Transaction<'_>,
        node_id: &NodeId,
        to_parent: &NodeId,
    ) -> MutationServiceResult<()> {
        if node_id == to_parent {
            return Err(MutationServiceError::IllegalRelation {
                node_id: node_id.clone(),
                to_parent: to_parent.clone(),
            });
        }

        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut cursor = node_repo::get_node(tx, to_parent)?;
        while let Some(current) = cursor {
            if current.id == *node_id {
                return Err(MutationServiceError::IllegalRelation {
                    node_id: node_id.clone(),
                    to_parent: to_parent.clone(),
                });
            }
            if current.is_super_root()
                || !visited.insert(current.id.clone())
                || visited.len() > self.config.max_tree_depth
            {
                break;
            }
            cursor = node_repo::get_node(tx, &current.parent_node_id)?;
        }
        Ok(())
    }

    fn insert_foreign_subtrees(
        &self,
        tx: &Transaction<'_>,
        nodes: &[TreeNode],
        root_ids: &[NodeId],
        to_parent: &NodeId,
        on_name_conflict: NameConflictMode,
        now: i64,
    ) -> MutationServiceResult<MutationOutcome> {
        let by_id: HashMap<&NodeId, &TreeNode> =
            nodes.iter().map(|node| (&node.id, node)).collect();
        for root_id in root_ids {
            if !by_id.contains_key(root_id) {
                return Err(MutationServiceError::InvalidPayload(format!(
                    "root id {root_id} missing from payload"
                )));
            }
        }

        // First pass: mint fresh ids for every payload row.
        let mut id_map: HashMap<NodeId, NodeId> = HashMap::new();
        for node in nodes {
            if node.id.as_str().is_empty() || node.name.is_empty() {
                return Err(MutationServiceError::InvalidPayload(
                    "payload rows require id and name".to_string(),
                ));
            }
            id_map.insert(node.id.clone(), NodeId::generate());
        }

        let root_set: HashSet<&NodeId> = root_ids.iter().collect();
        let mut root_siblings = node_repo::sibling_names(tx, to_parent, None)?;
        let mut outcome = MutationOutcome::default();

        // Second pass: insert parents before children so the forest
        // invariant holds at every step.
        let ordered = order_parents_first(nodes, &root_set);
        let mut sibling_sets: HashMap<NodeId, HashSet<String>> = HashMap::new();

        for source in ordered {
            let fresh_id = id_map[&source.id].clone();
            let is_root = root_set.contains(&source.id);

            let (parent, name) = if is_root {
                let name =
                    resolve_name(&mut root_siblings, &source.name, on_name_conflict, to_parent)?;
                (to_parent.clone(), name)
            } else {
                let parent = id_map
                    .get(&source.parent_node_id)
                    .cloned()
                    .unwrap_or_else(|| to_parent.clone());
                let siblings = sibling_sets.entry(parent.clone()).or_default();
                let name = resolve_name(siblings, &source.name, on_name_conflict, &parent)?;
                (parent, name)
            };

            let mut imported = TreeNode::new(
                fresh_id.clone(),
                parent,
                source.node_type.clone(),
                name,
                now,
            );
            imported.description = source.description.clone();

            self.run_hooks(HookStage::BeforeCreate, &imported)?;
            outcome.changes.push(node_repo::insert_node(tx, &imported)?);
            lifecycle::on_node_create(tx, self.registry, &imported.id, &imported.node_type, now)?;
            self.run_hooks(HookStage::AfterCreate, &imported)?;

            if is_root {
                outcome.new_node_ids.push(fresh_id);
            }
        }

        Ok(outcome)
    }

    fn check_subtree_cap(&self, size: usize) -> MutationServiceResult<()> {
        if size > self.config.max_copy_nodes {
            return Err(MutationServiceError::LimitExceeded {
                what: "subtree node",
                actual: size,
                max: self.config.max_copy_nodes,
            });
        }
        Ok(())
    }

    fn run_hooks(&self, stage: HookStage, node: &TreeNode) -> MutationServiceResult<()> {
        let ctx = HookContext {
            node_id: &node.id,
            node_type: &node.node_type,
            name: Some(&node.name),
            parent_node_id: Some(&node.parent_node_id),
            payload: None,
        };
        self.registry
            .run_hooks(self.hook_log, stage, &ctx)
            .map_err(MutationServiceError::HookAborted)
    }
}

/// Collects one subtree in breadth-first, parents-first order, the root
/// itself included.
fn collect_subtree(
    tx: &Transaction<'_>,
    root_id: &NodeId,
    include_trashed: bool,
) -> MutationServiceResult<Vec<TreeNode>> {
    let root = node_repo::get_node_required(tx, root_id)?;
    let mut collected = vec![root];
    let mut visited: HashSet<NodeId> = HashSet::new();
    visited.insert(root_id.clone());
    let mut frontier: VecDeque<NodeId> = VecDeque::new();
    frontier.push_back(root_id.clone());

    while let Some(current) = frontier.pop_front() {
        for child in node_repo::list_children(tx, &current, include_trashed)? {
            if !visited.insert(child.id.clone()) {
                continue;
            }
            frontier.push_back(child.id.clone());
            collected.push(child);
        }
    }
    Ok(collected)
}

/// Orders payload rows so parents precede children; roots come first in
/// input order, orphaned rows last.
fn order_parents_first<'n>(
    nodes: &'n [TreeNode],
    root_set: &HashSet<&NodeId>,
) -> Vec<&'n TreeNode> {
    let by_parent: HashMap<&NodeId, Vec<&TreeNode>> =
        nodes.iter().fold(HashMap::new(), |mut map, node| {
            map.entry(&node.parent_node_id).or_default().push(node);
            map
        });

    let mut ordered = Vec::with_capacity(nodes.len());
    let mut seen: HashSet<&NodeId> = HashSet::new();
    let mut frontier: VecDeque<&TreeNode> = nodes
        .iter()
        .filter(|node| root_set.contains(&node.id))
        .collect();

    while let Some(node) = frontier.pop_front() {
        if !seen.insert(&node.id) {
            continue;
        }
        ordered.push(node);
        if let Some(children) = by_parent.get(&node.id) {
            for child in children {
                frontier.push_back(child);
            }
        }
    }

    // Rows unreachable from any declared root still get imported,
    // attached to the target parent.
    for node in nodes {
        if seen.insert(&node.id) {
            ordered.push(node);
        }
    }
    ordered
}

fn resolve_name(
    siblings: &mut HashSet<String>,
    desired: &str,
    mode: NameConflictMode,
    parent: &NodeId,
) -> MutationServiceResult<String> {
    if !siblings.contains(desired) {
        siblings.insert(desired.to_string());
        return Ok(desired.to_string());
    }
    match mode {
        NameConflictMode::Error => Err(MutationServiceError::NameNotUnique {
            parent: parent.clone(),
            name: desired.to_string(),
        }),
        NameConflictMode::AutoRename => {
            let name = create_new_name(siblings, desired);
            siblings.insert(name.clone());
            Ok(name)
        }
    }
}

fn require_input(node_ids: &[NodeId]) -> MutationServiceResult<()> {
    if node_ids.is_empty() {
        return Err(MutationServiceError::EmptyInput);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::{MutationService, MutationServiceError};
    use crate::config::CoreConfig;
    use crate::db::open_store_in_memory;
    use crate::model::command::NameConflictMode;
    use crate::model::ids::{NodeId, TreeId};
    use crate::model::node::{TreeNode, NODE_TYPE_FOLDER};
    use crate::plugin::hooks::HookFailureLog;
    use crate::plugin::registry::PluginRegistry;
    use crate::repo::node_repo;

    struct Fixture {
        conn: rusqlite::Connection,
        registry: PluginRegistry,
        hook_log: HookFailureLog,
        config: CoreConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let conn = open_store_in_memory().unwrap();
            node_repo::seed_forest(&conn, 1_000).unwrap();
            Self {
                conn,
                registry: PluginRegistry::new(),
                hook_log: HookFailureLog::new(100),
                config: CoreConfig::default(),
            }
        }

        fn service(&self) -> MutationService<'_> {
            MutationService::new(&self.conn, &self.registry, &self.hook_log, &self.config)
        }

        fn insert(&self, parent: &NodeId, name: &str) -> TreeNode {
            let node = TreeNode::new(
                NodeId::generate(),
                parent.clone(),
                NODE_TYPE_FOLDER,
                name,
                1_500,
            );
            node_repo::insert_node(&self.conn, &node).unwrap();
            node
        }
    }

    #[test]
    fn move_into_own_descendant_is_rejected_without_state_change() {
        let fixture = Fixture::new();
        let root = TreeId::Resources.root_node_id();
        let a = fixture.insert(&root, "A");
        let b = fixture.insert(&a.id, "B");

        let err = fixture
            .service()
            .move_nodes(&[a.id.clone()], &b.id, NameConflictMode::Error, 2_000)
            .unwrap_err();
        assert!(matches!(err, MutationServiceError::IllegalRelation { .. }));

        let unchanged = node_repo::get_node_required(&fixture.conn, &a.id).unwrap();
        assert_eq!(unchanged.parent_node_id, root);
        assert_eq!(unchanged.version, 1);
    }

    #[test]
    fn move_bumps_version_and_resolves_names() {
        let fixture = Fixture::new();
        let root = TreeId::Resources.root_node_id();
        let source = fixture.insert(&root, "Docs");
        let target = fixture.insert(&root, "Target");
        fixture.insert(&target.id, "Docs");

        let err = fixture
            .service()
            .move_nodes(&[source.id.clone()], &target.id, NameConflictMode::Error, 2_000)
            .unwrap_err();
        assert!(matches!(err, MutationServiceError::NameNotUnique { .. }));

        let outcome = fixture
            .service()
            .move_nodes(
                &[source.id.clone()],
                &target.id,
                NameConflictMode::AutoRename,
                2_000,
            )
            .unwrap();
        assert_eq!(outcome.changes.len(), 1);

        let moved = node_repo::get_node_required(&fixture.conn, &source.id).unwrap();
        assert_eq!(moved.parent_node_id, target.id);
        assert_eq!(moved.name, "Docs (2)");
        assert_eq!(moved.version, 2);
    }

    #[test]
    fn duplicate_clones_subtree_with_copy_suffix() {
        let fixture = Fixture::new();
        let root = TreeId::Resources.root_node_id();
        let folder = fixture.insert(&root, "Pack");
        fixture.insert(&folder.id, "one");
        fixture.insert(&folder.id, "two");

        let outcome = fixture
            .service()
            .duplicate_nodes(&[folder.id.clone()], &root, NameConflictMode::Error, 2_000)
            .unwrap();
        assert_eq!(outcome.new_node_ids.len(), 1);
        assert_eq!(outcome.changes.len(), 3);

        let clone_root = node_repo::get_node_required(&fixture.conn, &outcome.new_node_ids[0])
            .unwrap();
        assert_eq!(clone_root.name, "Pack (Copy)");
        assert_eq!(clone_root.version, 1);

        let clone_children =
            node_repo::list_children(&fixture.conn, &clone_root.id, false).unwrap();
        let names: Vec<_> = clone_children.iter().map(|node| node.name.as_str()).collect();
        assert_eq!(names, vec!["one", "two"]);
        assert!(clone_children.iter().all(|node| node.version == 1));

        // Source is untouched.
        let source = node_repo::get_node_required(&fixture.conn, &folder.id).unwrap();
        assert_eq!(source.version, 1);
        assert_eq!(source.name, "Pack");
    }

    #[test]
    fn trash_recover_round_trip_restores_origin() {
        let fixture = Fixture::new();
        let root = TreeId::Resources.root_node_id();
        let folder = fixture.insert(&root, "Keep");

        fixture
            .service()
            .move_to_trash(&[folder.id.clone()], 2_000)
            .unwrap();
        let trashed = node_repo::get_node_required(&fixture.conn, &folder.id).unwrap();
        assert!(trashed.is_trashed());
        assert_eq!(trashed.parent_node_id, TreeId::Resources.trash_root_node_id());
        assert_eq!(trashed.original_name.as_deref(), Some("Keep"));
        assert_eq!(trashed.removed_at, Some(2_000));

        fixture
            .service()
            .recover_from_trash(&[folder.id.clone()], None, NameConflictMode::Error, 3_000)
            .unwrap();
        let recovered = node_repo::get_node_required(&fixture.conn, &folder.id).unwrap();
        assert!(!recovered.is_trashed());
        assert_eq!(recovered.parent_node_id, root);
        assert_eq!(recovered.name, "Keep");
        assert!(recovered.removed_at.is_none());
        assert!(recovered.original_parent_node_id.is_none());
    }

    #[test]
    fn recover_to_missing_parent_fails_with_node_not_found() {
        let fixture = Fixture::new();
        let root = TreeId::Resources.root_node_id();
        let parent = fixture.insert(&root, "Parent");
        let child = fixture.insert(&parent.id, "Child");

        fixture
            .service()
            .move_to_trash(&[child.id.clone()], 2_000)
            .unwrap();
        fixture.service().remove(&[parent.id.clone()], 2_100).unwrap();

        let err = fixture
            .service()
            .recover_from_trash(&[child.id.clone()], None, NameConflictMode::Error, 3_000)
            .unwrap_err();
        assert!(matches!(err, MutationServiceError::NodeNotFound(_)));

        // Batch rolled back: the node stays trashed.
        let still_trashed = node_repo::get_node_required(&fixture.conn, &child.id).unwrap();
        assert!(still_trashed.is_trashed());
    }

    #[test]
    fn remove_deletes_children_first() {
        let fixture = Fixture::new();
        let root = TreeId::Resources.root_node_id();
        let folder = fixture.insert(&root, "Doomed");
        let inner = fixture.insert(&folder.id, "inner");
        let leaf = fixture.insert(&inner.id, "leaf");

        let outcome = fixture.service().remove(&[folder.id.clone()], 2_000).unwrap();
        let deleted_order: Vec<_> = outcome
            .changes
            .iter()
            .map(|change| change.node_id.clone())
            .collect();
        assert_eq!(deleted_order, vec![leaf.id.clone(), inner.id.clone(), folder.id.clone()]);

        assert!(node_repo::get_node(&fixture.conn, &folder.id).unwrap().is_none());
        assert!(node_repo::get_node(&fixture.conn, &leaf.id).unwrap().is_none());
    }

    #[test]
    fn import_rewrites_ids_and_parent_links() {
        let fixture = Fixture::new();
        let root = TreeId::Resources.root_node_id();

        let foreign_root = TreeNode::new(
            NodeId::new("ext-1"),
            NodeId::new("ext-0"),
            NODE_TYPE_FOLDER,
            "Imported",
            10,
        );
        let foreign_child = TreeNode::new(
            NodeId::new("ext-2"),
            NodeId::new("ext-1"),
            NODE_TYPE_FOLDER,
            "Inner",
            11,
        );

        let outcome = fixture
            .service()
            .import_nodes(
                &[foreign_root.clone(), foreign_child.clone()],
                &[foreign_root.id.clone()],
                &root,
                NameConflictMode::AutoRename,
                2_000,
            )
            .unwrap();
        assert_eq!(outcome.new_node_ids.len(), 1);
        assert_eq!(outcome.changes.len(), 2);

        let new_root_id = &outcome.new_node_ids[0];
        assert_ne!(new_root_id.as_str(), "ext-1");
        let imported_root = node_repo::get_node_required(&fixture.conn, new_root_id).unwrap();
        assert_eq!(imported_root.parent_node_id, root);
        assert_eq!(imported_root.version, 1);

        let children = node_repo::list_children(&fixture.conn, new_root_id, false).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].name, "Inner");
    }
}
