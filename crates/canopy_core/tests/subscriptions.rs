use canopy_core::{
    ChangeEventKind, CoreConfig, CreateRequest, ForestService, NameConflictMode, NodeId, TreeId,
    NODE_TYPE_FOLDER,
};

fn service() -> ForestService {
    ForestService::initialize_in_memory(CoreConfig::default()).unwrap()
}

fn create_folder(service: &mut ForestService, parent: &NodeId, name: &str) -> NodeId {
    let outcome = service.create(CreateRequest {
        tree_node_type: NODE_TYPE_FOLDER.to_string(),
        parent_node_id: parent.clone(),
        name: name.to_string(),
        description: None,
        on_name_conflict: NameConflictMode::Error,
    });
    assert!(outcome.success, "create failed: {:?}", outcome);
    outcome.node_id.unwrap()
}

#[test]
fn node_subscription_delivers_updates_for_that_node_only() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let watched = create_folder(&mut service, &root, "watched");
    let other = create_folder(&mut service, &root, "other");

    let stream = service.subscribe_node(&watched, None, false).unwrap();

    service.update_node_name(&watched, "watched-2", NameConflictMode::Error);
    service.update_node_name(&other, "other-2", NameConflictMode::Error);

    let events = stream.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].node_id, watched);
    assert_eq!(events[0].kind, ChangeEventKind::NodeUpdated);
    assert_eq!(events[0].node.as_ref().unwrap().name, "watched-2");
}

#[test]
fn node_subscription_initial_value_is_synthesized() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let node = create_folder(&mut service, &root, "existing");

    let stream = service.subscribe_node(&node, None, true).unwrap();
    let events = stream.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeEventKind::NodeUpdated);
    assert_eq!(events[0].node.as_ref().unwrap().name, "existing");
}

#[test]
fn children_subscription_sees_arrivals_and_departures() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let folder = create_folder(&mut service, &root, "folder");
    let outside = create_folder(&mut service, &root, "outside");

    let stream = service.subscribe_children(&folder, None, false).unwrap();

    // Arrival.
    let inside = create_folder(&mut service, &folder, "inside");
    // Departure to another parent.
    service.move_nodes(&[inside.clone()], &root, NameConflictMode::AutoRename);
    // Unrelated churn.
    service.update_node_name(&outside, "renamed", NameConflictMode::Error);

    let events = stream.drain();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, ChangeEventKind::NodeCreated);
    assert_eq!(events[0].node_id, inside);
    assert_eq!(events[1].previous_parent_id.as_ref(), Some(&folder));
}

#[test]
fn subtree_subscription_honors_depth_limit() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let folder1 = create_folder(&mut service, &root, "folder1");
    let file2 = create_folder(&mut service, &folder1, "file2");
    let folder2 = create_folder(&mut service, &folder1, "folder2");
    let file1 = create_folder(&mut service, &folder2, "file1");

    let stream = service
        .subscribe_subtree(&folder1, Some(1), None, false)
        .unwrap();

    // Direct child (depth 1): delivered.
    service.update_node_name(&file2, "file2-renamed", NameConflictMode::Error);
    let events = stream.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].node_id, file2);

    // Grandchild (depth 2): filtered out.
    service.update_node_name(&file1, "file1-renamed", NameConflictMode::Error);
    assert!(stream.drain().is_empty());
}

#[test]
fn subtree_subscription_without_limit_sees_deep_changes() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let top = create_folder(&mut service, &root, "top");
    let mid = create_folder(&mut service, &top, "mid");
    let deep = create_folder(&mut service, &mid, "deep");

    let stream = service.subscribe_subtree(&top, None, None, false).unwrap();
    service.update_node_name(&deep, "deep-renamed", NameConflictMode::Error);

    let events = stream.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].node_id, deep);
}

#[test]
fn type_filter_drops_other_node_types() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let folder = create_folder(&mut service, &root, "typed");

    let stream = service
        .subscribe_node(&folder, Some(vec!["spreadsheet".to_string()]), false)
        .unwrap();
    service.update_node_name(&folder, "typed-2", NameConflictMode::Error);
    assert!(stream.drain().is_empty());
}

#[test]
fn disposed_subscription_observes_nothing_afterwards() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let node = create_folder(&mut service, &root, "target");

    let stream = service.subscribe_node(&node, None, false).unwrap();
    assert_eq!(service.active_subscriptions().len(), 1);

    stream.dispose();
    assert!(service.active_subscriptions().is_empty());

    // Mutations after dispose must not panic or leak deliveries.
    service.update_node_name(&node, "target-2", NameConflictMode::Error);
}

#[test]
fn working_copy_stream_reports_create_lifecycle() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();

    let stream = service.subscribe_working_copies(None);
    let node = create_folder(&mut service, &root, "tracked");

    let events = stream.drain();
    assert_eq!(events.len(), 2);
    assert_eq!(events[0].kind, canopy_core::WorkingCopyEventKind::Created);
    assert_eq!(events[1].kind, canopy_core::WorkingCopyEventKind::Committed);
    assert_eq!(events[1].node_id.as_ref(), Some(&node));
}

#[test]
fn children_snapshot_carries_current_child_ids() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let a = create_folder(&mut service, &root, "a");
    let b = create_folder(&mut service, &root, "b");

    let stream = service.subscribe_children(&root, None, true).unwrap();
    let events = stream.drain();
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].kind, ChangeEventKind::ChildrenChanged);
    assert!(events[0].affected_children.contains(&a));
    assert!(events[0].affected_children.contains(&b));
}
