//! Reactive subscription layer over the durable change stream.
//!
//! # Responsibility
//! - Fan committed change records out to per-node, per-children and
//!   per-subtree subscribers, plus the opt-in working-copy stream.
//! - Track per-subscription activity and sweep idle subscriptions
//!   periodically.
//!
//! # Invariants
//! - Events are delivered in publication (commit) order.
//! - Subtree membership is decided by the ancestor walk, bounded by the
//!   configured tree depth; the subscribed root itself counts as depth 0.
//! - After a stream is disposed its subscription receives nothing further.

use crate::model::event::{ChangeEvent, ChangeRecord, WorkingCopyEvent};
use crate::model::ids::NodeId;
use crate::model::node::NodeType;
use crate::model::now_ms;
use crate::repo::node_repo::{self, NodeRepoResult};
use log::{debug, info};
use rusqlite::Connection;
use std::collections::{HashSet, VecDeque};
use std::sync::mpsc::{channel, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

/// Scope of one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionScope {
    /// Events for exactly one node.
    Node { node_id: NodeId },
    /// Events whose current or previous parent matches.
    Children { parent_node_id: NodeId },
    /// Events for any descendant within `max_depth` of the root.
    Subtree {
        root_node_id: NodeId,
        max_depth: Option<usize>,
    },
    /// Working-copy lifecycle events, optionally filtered by source node.
    WorkingCopies { node_id: Option<NodeId> },
}

impl SubscriptionScope {
    fn kind(&self) -> &'static str {
        match self {
            Self::Node { .. } => "node",
            Self::Children { .. } => "children",
            Self::Subtree { .. } => "subtree",
            Self::WorkingCopies { .. } => "working-copies",
        }
    }
}

/// Activity snapshot of one live subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionRecord {
    pub id: u64,
    pub kind: &'static str,
    pub is_active: bool,
    pub last_activity: i64,
}

enum Feed {
    Change(Sender<ChangeEvent>),
    WorkingCopy(Sender<WorkingCopyEvent>),
}

struct SubEntry {
    id: u64,
    scope: SubscriptionScope,
    node_types: Option<Vec<NodeType>>,
    feed: Feed,
    is_active: bool,
    last_activity: i64,
}

#[derive(Default)]
struct HubInner {
    entries: Vec<SubEntry>,
    next_id: u64,
}

struct Sweeper {
    shutdown: Sender<()>,
    handle: JoinHandle<()>,
}

/// In-process publisher receiving every durable-store change record.
///
/// Subscriptions are `(scope, filter, sender)` entries notified in order;
/// consumers hold the receiving half wrapped in a stream with an explicit
/// dispose.
pub struct SubscriptionHub {
    inner: Mutex<HubInner>,
    sweeper: Mutex<Option<Sweeper>>,
    idle_limit_ms: u64,
    max_tree_depth: usize,
}

impl SubscriptionHub {
    pub fn new(idle_limit_ms: u64, max_tree_depth: usize) -> Self {
        Self {
            inner: Mutex::new(HubInner::default()),
            sweeper: Mutex::new(None),
            idle_limit_ms,
            max_tree_depth,
        }
    }

    /// Subscribes to one node's events.
    pub fn subscribe_node(
        hub: &Arc<SubscriptionHub>,
        conn: &Connection,
        node_id: &NodeId,
        node_types: Option<Vec<NodeType>>,
        include_initial_value: bool,
    ) -> NodeRepoResult<ChangeEventStream> {
        let (sender, receiver) = channel();

        if include_initial_value {
            if let Some(node) = node_repo::get_node(conn, node_id)? {
                let record = ChangeRecord::updated(node.clone(), node, now_ms());
                let _ = sender.send(ChangeEvent::from_record(&record));
            }
        }

        let id = hub.register(
            SubscriptionScope::Node {
                node_id: node_id.clone(),
            },
            node_types,
            Feed::Change(sender),
        );
        Ok(ChangeEventStream {
            id,
            receiver,
            hub: Arc::clone(hub),
        })
    }

    /// Subscribes to membership changes under one parent.
    pub fn subscribe_children(
        hub: &Arc<SubscriptionHub>,
        conn: &Connection,
        parent_node_id: &NodeId,
        node_types: Option<Vec<NodeType>>,
        include_initial_snapshot: bool,
    ) -> NodeRepoResult<ChangeEventStream> {
        let (sender, receiver) = channel();

        if include_initial_snapshot {
            let children = node_repo::list_children(conn, parent_node_id, false)?;
            let child_ids = children.into_iter().map(|child| child.id).collect();
            let _ = sender.send(ChangeEvent::children_snapshot(
                parent_node_id.clone(),
                child_ids,
                now_ms(),
            ));
        }

        let id = hub.register(
            SubscriptionScope::Children {
                parent_node_id: parent_node_id.clone(),
            },
            node_types,
            Feed::Change(sender),
        );
        Ok(ChangeEventStream {
            id,
            receiver,
            hub: Arc::clone(hub),
        })
    }

    /// Subscribes to events within one subtree, depth-bounded.
    pub fn subscribe_subtree(
        hub: &Arc<SubscriptionHub>,
        conn: &Connection,
        root_node_id: &NodeId,
        max_depth: Option<usize>,
        node_types: Option<Vec<NodeType>>,
        include_initial_snapshot: bool,
    ) -> NodeRepoResult<ChangeEventStream> {
        let (sender, receiver) = channel();

        if include_initial_snapshot {
            let descendants =
                collect_descendant_ids(conn, root_node_id, max_depth.unwrap_or(hub.max_tree_depth))?;
            let _ = sender.send(ChangeEvent::children_snapshot(
                root_node_id.clone(),
                descendants,
                now_ms(),
            ));
        }

        let id = hub.register(
            SubscriptionScope::Subtree {
                root_node_id: root_node_id.clone(),
                max_depth,
            },
            node_types,
            Feed::Change(sender),
        );
        Ok(ChangeEventStream {
            id,
            receiver,
            hub: Arc::clone(hub),
        })
    }

    /// Subscribes to the working-copy lifecycle stream.
    pub fn subscribe_working_copies(
        hub: &Arc<SubscriptionHub>,
        node_id: Option<NodeId>,
    ) -> WorkingCopyEventStream {
        let (sender, receiver) = channel();
        let id = hub.register(
            SubscriptionScope::WorkingCopies { node_id },
            None,
            Feed::WorkingCopy(sender),
        );
        WorkingCopyEventStream {
            id,
            receiver,
            hub: Arc::clone(hub),
        }
    }

    /// Publishes committed change records to every matching subscription,
    /// in order.
    pub fn publish(&self, conn: &Connection, records: &[ChangeRecord]) {
        if records.is_empty() {
            return;
        }
        let now = now_ms();
        let mut inner = lock(&self.inner);

        for record in records {
            let event = ChangeEvent::from_record(record);
            for entry in inner.entries.iter_mut() {
                if !entry.is_active {
                    continue;
                }
                let Feed::Change(sender) = &entry.feed else {
                    continue;
                };
                if !self.matches(conn, entry, record) {
                    continue;
                }
                if sender.send(event.clone()).is_ok() {
                    entry.last_activity = now;
                } else {
                    entry.is_active = false;
                }
            }
        }
    }

    /// Publishes working-copy lifecycle events to the opt-in stream.
    pub fn publish_working_copies(&self, events: &[WorkingCopyEvent]) {
        if events.is_empty() {
            return;
        }
        let now = now_ms();
        let mut inner = lock(&self.inner);

        for event in events {
            for entry in inner.entries.iter_mut() {
                if !entry.is_active {
                    continue;
                }
                let Feed::WorkingCopy(sender) = &entry.feed else {
                    continue;
                };
                let SubscriptionScope::WorkingCopies { node_id } = &entry.scope else {
                    continue;
                };
                if let Some(filter) = node_id {
                    if event.node_id.as_ref() != Some(filter) {
                        continue;
                    }
                }
                if sender.send(event.clone()).is_ok() {
                    entry.last_activity = now;
                } else {
                    entry.is_active = false;
                }
            }
        }
    }

    /// Removes subscriptions that are inactive or idle past the limit.
    /// Dropping the sender completes the consumer stream.
    pub fn sweep(&self, now: i64) -> usize {
        let mut inner = lock(&self.inner);
        let before = inner.entries.len();
        let idle_limit = self.idle_limit_ms as i64;
        inner
            .entries
            .retain(|entry| entry.is_active && now - entry.last_activity <= idle_limit);
        let removed = before - inner.entries.len();
        if removed > 0 {
            debug!(
                "event=subscription_gc module=observe status=ok removed={} remaining={}",
                removed,
                inner.entries.len()
            );
        }
        removed
    }

    /// Starts the periodic sweeper thread. Idempotent.
    pub fn start_sweeper(hub: &Arc<SubscriptionHub>, interval_ms: u64) {
        let mut sweeper = lock(&hub.sweeper);
        if sweeper.is_some() {
            return;
        }

        let (shutdown, shutdown_rx) = channel();
        let sweeping = Arc::clone(hub);
        let handle = std::thread::spawn(move || loop {
            match shutdown_rx.recv_timeout(Duration::from_millis(interval_ms)) {
                Err(RecvTimeoutError::Timeout) => {
                    sweeping.sweep(now_ms());
                }
                Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
            }
        });
        *sweeper = Some(Sweeper { shutdown, handle });
        info!(
            "event=subscription_gc_start module=observe status=ok interval_ms={}",
            interval_ms
        );
    }

    /// Stops the sweeper thread and completes every subscription.
    pub fn shutdown(&self) {
        if let Some(sweeper) = lock(&self.sweeper).take() {
            let _ = sweeper.shutdown.send(());
            let _ = sweeper.handle.join();
        }
        lock(&self.inner).entries.clear();
    }

    /// Snapshot of live subscriptions.
    pub fn active_subscriptions(&self) -> Vec<SubscriptionRecord> {
        lock(&self.inner)
            .entries
            .iter()
            .map(|entry| SubscriptionRecord {
                id: entry.id,
                kind: entry.scope.kind(),
                is_active: entry.is_active,
                last_activity: entry.last_activity,
            })
            .collect()
    }

    fn register(&self, scope: SubscriptionScope, node_types: Option<Vec<NodeType>>, feed: Feed) -> u64 {
        let mut inner = lock(&self.inner);
        inner.next_id += 1;
        let id = inner.next_id;
        inner.entries.push(SubEntry {
            id,
            scope,
            node_types,
            feed,
            is_active: true,
            last_activity: now_ms(),
        });
        id
    }

    fn remove(&self, id: u64) {
        let mut inner = lock(&self.inner);
        inner.entries.retain(|entry| entry.id != id);
    }

    fn matches(&self, conn: &Connection, entry: &SubEntry, record: &ChangeRecord) -> bool {
        if !self.passes_type_filter(entry, record) {
            return false;
        }

        match &entry.scope {
            SubscriptionScope::Node { node_id } => record.node_id == *node_id,
            SubscriptionScope::Children { parent_node_id } => {
                record.parent_id() == Some(parent_node_id)
                    || record.previous_parent_id() == Some(parent_node_id)
            }
            SubscriptionScope::Subtree {
                root_node_id,
                max_depth,
            } => {
                let bound = max_depth.unwrap_or(self.max_tree_depth);
                self.depth_from_root(conn, root_node_id, record)
                    .is_some_and(|depth| depth <= bound)
            }
            SubscriptionScope::WorkingCopies { .. } => false,
        }
    }

    fn passes_type_filter(&self, entry: &SubEntry, record: &ChangeRecord) -> bool {
        let Some(node_types) = &entry.node_types else {
            return true;
        };
        let node_type = record
            .node
            .as_ref()
            .or(record.previous_node.as_ref())
            .map(|node| &node.node_type);
        node_type.is_some_and(|node_type| node_types.contains(node_type))
    }

    /// Depth of the event's node below the subscribed root; the root
    /// itself is depth 0. Deletes walk from the recorded previous parent,
    /// so transient inconsistency during a delete resolves to the
    /// pre-delete position.
    fn depth_from_root(
        &self,
        conn: &Connection,
        root: &NodeId,
        record: &ChangeRecord,
    ) -> Option<usize> {
        if record.node_id == *root {
            return Some(0);
        }

        let start_parent = record
            .parent_id()
            .or_else(|| record.previous_parent_id())?
            .clone();

        let mut depth = 1usize;
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut cursor = start_parent;
        loop {
            if cursor == *root {
                return Some(depth);
            }
            if depth >= self.max_tree_depth || !visited.insert(cursor.clone()) {
                return None;
            }
            let node = node_repo::get_node(conn, &cursor).ok().flatten()?;
            if node.is_super_root() {
                return None;
            }
            cursor = node.parent_node_id;
            depth += 1;
        }
    }
}

fn collect_descendant_ids(
    conn: &Connection,
    root: &NodeId,
    max_depth: usize,
) -> NodeRepoResult<Vec<NodeId>> {
    let mut collected = Vec::new();
    let mut visited: HashSet<NodeId> = HashSet::new();
    visited.insert(root.clone());
    let mut frontier: VecDeque<(NodeId, usize)> = VecDeque::new();
    frontier.push_back((root.clone(), 0));

    while let Some((current, depth)) = frontier.pop_front() {
        if depth >= max_depth {
            continue;
        }
        for child in node_repo::list_children(conn, &current, false)? {
            if !visited.insert(child.id.clone()) {
                continue;
            }
            frontier.push_back((child.id.clone(), depth + 1));
            collected.push(child.id);
        }
    }
    Ok(collected)
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Consumer handle for a change-event subscription.
///
/// Dropping the stream (or calling [`ChangeEventStream::dispose`]) removes
/// the subscription; nothing is observable from it afterwards.
pub struct ChangeEventStream {
    id: u64,
    receiver: Receiver<ChangeEvent>,
    hub: Arc<SubscriptionHub>,
}

impl ChangeEventStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Drains every event delivered so far.
    pub fn drain(&self) -> Vec<ChangeEvent> {
        self.receiver.try_iter().collect()
    }

    /// Waits up to `timeout` for the next event.
    pub fn next_timeout(&self, timeout: Duration) -> Option<ChangeEvent> {
        self.receiver.recv_timeout(timeout).ok()
    }

    /// Unsubscribes and consumes the handle.
    pub fn dispose(self) {}
}

impl Drop for ChangeEventStream {
    fn drop(&mut self) {
        self.hub.remove(self.id);
    }
}

/// Consumer handle for the working-copy lifecycle stream.
pub struct WorkingCopyEventStream {
    id: u64,
    receiver: Receiver<WorkingCopyEvent>,
    hub: Arc<SubscriptionHub>,
}

impl WorkingCopyEventStream {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn drain(&self) -> Vec<WorkingCopyEvent> {
        self.receiver.try_iter().collect()
    }

    pub fn dispose(self) {}
}

impl Drop for WorkingCopyEventStream {
    fn drop(&mut self) {
        self.hub.remove(self.id);
    }
}
