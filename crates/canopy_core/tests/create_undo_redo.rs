use canopy_core::{
    CoreConfig, CreateRequest, ErrorCode, ForestService, NameConflictMode, NodeId, TreeId,
    NODE_TYPE_FOLDER,
};

fn service() -> ForestService {
    ForestService::initialize_in_memory(CoreConfig::default()).unwrap()
}

fn create_named(
    service: &mut ForestService,
    parent: &NodeId,
    name: &str,
    mode: NameConflictMode,
) -> canopy_core::CommandOutcome {
    service.create(CreateRequest {
        tree_node_type: NODE_TYPE_FOLDER.to_string(),
        parent_node_id: parent.clone(),
        name: name.to_string(),
        description: None,
        on_name_conflict: mode,
    })
}

#[test]
fn draft_create_commits_and_leaves_no_working_copy() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();

    create_named(&mut service, &root, "Documents", NameConflictMode::Error);
    create_named(&mut service, &root, "Documents (2)", NameConflictMode::Error);

    let outcome = create_named(&mut service, &root, "NewFolder", NameConflictMode::Error);
    assert!(outcome.success);
    let node = service.get_node(outcome.node_id.as_ref().unwrap()).unwrap().unwrap();
    assert_eq!(node.name, "NewFolder");
    assert_eq!(node.version, 1);
    assert_eq!(node.parent_node_id, root);
}

#[test]
fn auto_rename_resolves_create_collision() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();

    create_named(&mut service, &root, "Documents", NameConflictMode::Error);
    create_named(&mut service, &root, "Documents", NameConflictMode::AutoRename);
    let third = create_named(&mut service, &root, "Documents", NameConflictMode::AutoRename);
    assert!(third.success);

    let node = service.get_node(third.node_id.as_ref().unwrap()).unwrap().unwrap();
    assert_eq!(node.name, "Documents (3)");
}

#[test]
fn undo_removes_created_node_and_redo_restores_same_id() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();

    let outcome = create_named(&mut service, &root, "Ephemeral", NameConflictMode::Error);
    let node_id = outcome.node_id.unwrap();
    assert!(service.get_node(&node_id).unwrap().is_some());

    let undone = service.undo();
    assert!(undone.success, "undo failed: {:?}", undone);
    assert!(service.get_node(&node_id).unwrap().is_none());

    // Redo replays the recorded forward payload, which carries the id.
    let redone = service.redo();
    assert!(redone.success, "redo failed: {:?}", redone);
    let restored = service.get_node(&node_id).unwrap().unwrap();
    assert_eq!(restored.name, "Ephemeral");
    assert_eq!(restored.version, 1);
}

#[test]
fn undo_then_redo_round_trips_rename_state() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();

    let created = create_named(&mut service, &root, "Before", NameConflictMode::Error);
    let node_id = created.node_id.unwrap();

    let renamed = service.update_node_name(&node_id, "After", NameConflictMode::Error);
    assert!(renamed.success);
    let after = service.get_node(&node_id).unwrap().unwrap();
    assert_eq!(after.version, 2);

    assert!(service.undo().success);
    let reverted = service.get_node(&node_id).unwrap().unwrap();
    assert_eq!(reverted.name, "Before");
    assert_eq!(reverted.version, 1);

    assert!(service.redo().success);
    let replayed = service.get_node(&node_id).unwrap().unwrap();
    assert_eq!(replayed.name, after.name);
    assert_eq!(replayed.version, after.version);
    assert_eq!(replayed.updated_at, after.updated_at);
}

#[test]
fn undo_on_empty_stack_is_an_invalid_operation() {
    let mut service = service();

    let outcome = service.undo();
    assert!(!outcome.success);
    assert_eq!(outcome.code.unwrap(), ErrorCode::InvalidOperation);

    let outcome = service.redo();
    assert!(!outcome.success);
    assert_eq!(outcome.code.unwrap(), ErrorCode::InvalidOperation);
}

#[test]
fn new_command_clears_the_redo_stack() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();

    let first = create_named(&mut service, &root, "One", NameConflictMode::Error);
    assert!(service.undo().success);

    // A fresh undoable command invalidates the redo branch.
    create_named(&mut service, &root, "Two", NameConflictMode::Error);
    let redo = service.redo();
    assert!(!redo.success);
    assert!(service.get_node(first.node_id.as_ref().unwrap()).unwrap().is_none());
}

#[test]
fn command_history_records_successes_and_sanitized_failures() {
    let mut service = service();
    let root = TreeId::Resources.root_node_id();

    create_named(&mut service, &root, "Logged", NameConflictMode::Error);
    let other = create_named(&mut service, &root, "Other", NameConflictMode::Error);
    let conflict = service.update_node_name(
        other.node_id.as_ref().unwrap(),
        "Logged",
        NameConflictMode::Error,
    );
    assert!(!conflict.success);
    assert_eq!(conflict.code.unwrap(), ErrorCode::NameNotUnique);

    let history = service.command_history();
    assert!(history.len() >= 3);

    let seqs: Vec<_> = history.iter().map(|record| record.seq).collect();
    let mut sorted = seqs.clone();
    sorted.sort_unstable();
    assert_eq!(seqs, sorted);

    let failure = history
        .iter()
        .rev()
        .find(|record| record.code.is_some())
        .unwrap();
    assert_eq!(failure.code.unwrap(), ErrorCode::NameNotUnique);
    let message = failure.message.as_deref().unwrap();
    assert!(!message.contains('\n'));
    assert!(message.len() <= 203);
}
