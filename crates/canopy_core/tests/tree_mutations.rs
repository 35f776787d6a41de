use canopy_core::{
    ChildListOptions, CoreConfig, CreateRequest, ErrorCode, ForestService, NameConflictMode,
    NodeId, TreeId, NODE_TYPE_FOLDER,
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
fn move_into_descendant_is_rejected_with_no_state_change() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let a = create_folder(&mut service, &root, "A");
    let b = create_folder(&mut service, &a, "B");

    let outcome = service.move_nodes(&[a.clone()], &b, NameConflictMode::Error);
    assert!(!outcome.success);
    assert_eq!(outcome.code.unwrap(), ErrorCode::IllegalRelation);

    let unchanged = service.get_node(&a).unwrap().unwrap();
    assert_eq!(unchanged.parent_node_id, root);
    assert_eq!(unchanged.version, 1);
}

#[test]
fn move_between_parents_updates_ancestry() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let source = create_folder(&mut service, &root, "Source");
    let target = create_folder(&mut service, &root, "Target");
    let child = create_folder(&mut service, &source, "Child");

    let outcome = service.move_nodes(&[child.clone()], &target, NameConflictMode::Error);
    assert!(outcome.success);

    let ancestors = service.list_ancestors(&child).unwrap();
    let ancestor_ids: Vec<_> = ancestors.iter().map(|node| node.id.clone()).collect();
    assert!(ancestor_ids.contains(&target));
    assert!(!ancestor_ids.contains(&source));
}

#[test]
fn duplicate_subtree_suffixes_root_and_keeps_child_names() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let folder = create_folder(&mut service, &root, "Bundle");
    create_folder(&mut service, &folder, "left");
    create_folder(&mut service, &folder, "right");

    let outcome = service.duplicate_nodes(&[folder.clone()], &root, NameConflictMode::Error);
    assert!(outcome.success);
    assert_eq!(outcome.new_node_ids.len(), 1);

    let clone_root = service
        .get_node(&outcome.new_node_ids[0])
        .unwrap()
        .unwrap();
    assert_eq!(clone_root.name, "Bundle (Copy)");
    assert_eq!(clone_root.version, 1);
    assert_ne!(clone_root.id, folder);

    let clone_children = service
        .get_children(&clone_root.id, &ChildListOptions::default())
        .unwrap();
    let names: Vec<_> = clone_children.iter().map(|node| node.name.as_str()).collect();
    assert_eq!(names, vec!["left", "right"]);
    assert!(clone_children.iter().all(|node| node.version == 1));

    let source = service.get_node(&folder).unwrap().unwrap();
    assert_eq!(source.name, "Bundle");
    assert_eq!(source.version, 1);
}

#[test]
fn trash_then_recover_restores_parent_and_name() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let folder = create_folder(&mut service, &root, "Precious");

    let trashed_outcome = service.move_to_trash(&[folder.clone()]);
    assert!(trashed_outcome.success);

    let trashed = service.get_node(&folder).unwrap().unwrap();
    assert!(trashed.is_removed);
    assert_eq!(trashed.parent_node_id, TreeId::Resources.trash_root_node_id());
    assert_eq!(trashed.original_name.as_deref(), Some("Precious"));
    assert!(trashed.removed_at.is_some());

    // Trashed rows disappear from live child listings.
    let live = service
        .get_children(&root, &ChildListOptions::default())
        .unwrap();
    assert!(live.iter().all(|node| node.id != folder));

    let recovered_outcome =
        service.recover_from_trash(&[folder.clone()], None, NameConflictMode::Error);
    assert!(recovered_outcome.success);

    let recovered = service.get_node(&folder).unwrap().unwrap();
    assert!(!recovered.is_removed);
    assert_eq!(recovered.parent_node_id, root);
    assert_eq!(recovered.name, "Precious");
    assert!(recovered.removed_at.is_none());
    assert!(recovered.original_parent_node_id.is_none());
}

#[test]
fn recover_auto_renames_when_origin_name_was_retaken() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let folder = create_folder(&mut service, &root, "Report");

    service.move_to_trash(&[folder.clone()]);
    create_folder(&mut service, &root, "Report");

    let error_mode = service.recover_from_trash(&[folder.clone()], None, NameConflictMode::Error);
    assert!(!error_mode.success);
    assert_eq!(error_mode.code.unwrap(), ErrorCode::NameNotUnique);

    let renamed = service.recover_from_trash(&[folder.clone()], None, NameConflictMode::AutoRename);
    assert!(renamed.success);
    let recovered = service.get_node(&folder).unwrap().unwrap();
    assert_eq!(recovered.name, "Report (2)");
}

#[test]
fn remove_hard_deletes_whole_subtree() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let folder = create_folder(&mut service, &root, "Doomed");
    let inner = create_folder(&mut service, &folder, "inner");
    let leaf = create_folder(&mut service, &inner, "leaf");

    let outcome = service.remove_nodes(&[folder.clone()]);
    assert!(outcome.success);

    for id in [&folder, &inner, &leaf] {
        assert!(service.get_node(id).unwrap().is_none());
    }
}

#[test]
fn remove_undo_restores_subtree_with_original_ids() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let folder = create_folder(&mut service, &root, "Restorable");
    let child = create_folder(&mut service, &folder, "child");

    assert!(service.remove_nodes(&[folder.clone()]).success);
    assert!(service.get_node(&folder).unwrap().is_none());

    assert!(service.undo().success);
    let restored = service.get_node(&folder).unwrap().unwrap();
    assert_eq!(restored.name, "Restorable");
    let restored_child = service.get_node(&child).unwrap().unwrap();
    assert_eq!(restored_child.parent_node_id, folder);
}

#[test]
fn descendants_and_ancestors_agree() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();
    let top = create_folder(&mut service, &root, "top");
    let mid = create_folder(&mut service, &top, "mid");
    create_folder(&mut service, &mid, "deep");

    let descendants = service
        .list_descendants(&top, &Default::default())
        .unwrap();
    assert_eq!(descendants.len(), 2);

    for descendant in descendants {
        let ancestors = service.list_ancestors(&descendant.id).unwrap();
        assert!(ancestors.iter().any(|node| node.id == top));
    }
}
