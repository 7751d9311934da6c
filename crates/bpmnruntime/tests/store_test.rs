// crates/bpmnruntime/tests/store_test.rs

use bpmncore::{
    DataContainer, DataInstance, DataType, EventTarget, FlowNodeInstance, FlowNodeKind,
    FlowNodeState, HumanTask, MessageInstance, TaskPriority, Value, WaitingEvent,
    WaitingEventType,
};
use bpmnruntime::{DataUpdate, ExecutionClaim, MemoryStore, MutationBatch, ProcessStore};
use std::collections::HashSet;
use std::sync::Arc;
use uuid::Uuid;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn task(name: &str, state: FlowNodeState) -> FlowNodeInstance {
    let mut node =
        FlowNodeInstance::new(Uuid::new_v4(), name, FlowNodeKind::AutomaticTask, 1, 1, Uuid::nil());
    node.set_state(state);
    node
}

fn user_task(name: &str) -> FlowNodeInstance {
    let mut node = FlowNodeInstance::new(
        Uuid::new_v4(),
        name,
        FlowNodeKind::UserTask(HumanTask {
            actor: "clerk".to_string(),
            assignee_id: None,
            claimed_date: None,
            priority: TaskPriority::Normal,
            expected_end_date: None,
        }),
        1,
        1,
        Uuid::nil(),
    );
    node.set_state(FlowNodeState::Ready);
    node
}

fn items_update(values: &[&str]) -> MutationBatch {
    MutationBatch {
        data: vec![DataUpdate {
            container: DataContainer::Process(1),
            name: "items".to_string(),
            value: Value::List(values.iter().map(|v| Value::from(*v)).collect()),
        }],
        ..Default::default()
    }
}

fn timer(name: &str) -> WaitingEvent {
    WaitingEvent::new(
        WaitingEventType::Timer,
        name,
        "process",
        name,
        EventTarget::FlowNode { flow_node_id: 1 },
    )
}

#[tokio::test]
async fn test_restart_scan_returns_only_inconsistent_nodes() {
    init_tracing();
    let store = MemoryStore::new();

    let mut deleted = task("deleted", FlowNodeState::Completed);
    deleted.deleted = true;
    let mut executing = task("executing", FlowNodeState::Ready);
    executing.state_executing = true;

    let ids = store
        .create_flow_nodes(vec![
            task("normal1", FlowNodeState::Ready),
            task("normal2", FlowNodeState::Waiting),
            deleted,
            executing,
            task("unstable", FlowNodeState::Executing),
            task("terminal", FlowNodeState::Completed),
        ])
        .await
        .unwrap();
    assert_eq!(ids.len(), 6);

    let names: HashSet<String> = store
        .list_flow_nodes_to_restart()
        .await
        .unwrap()
        .into_iter()
        .map(|n| n.name)
        .collect();
    let expected: HashSet<String> = ["executing", "unstable", "terminal"]
        .into_iter()
        .map(String::from)
        .collect();
    assert_eq!(names, expected);
}

#[tokio::test]
async fn test_reset_executing_flag_takes_node_out_of_scan() {
    init_tracing();
    let store = MemoryStore::new();

    let mut executing = task("executing", FlowNodeState::Waiting);
    executing.state_executing = true;
    let ids = store.create_flow_nodes(vec![executing]).await.unwrap();

    assert_eq!(store.list_flow_nodes_to_restart().await.unwrap().len(), 1);
    store.reset_executing_flag(ids[0]).await.unwrap();
    assert!(store.list_flow_nodes_to_restart().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_reset_waiting_events_is_idempotent() {
    init_tracing();
    let store = MemoryStore::new();

    for i in 0..44 {
        let id = store.add_waiting_event(timer(&format!("timer{}", i))).await.unwrap();
        if i < 42 {
            assert!(store.claim_waiting_event(id).await.unwrap());
        }
    }
    assert_eq!(store.list_in_progress_waiting_events().await.unwrap().len(), 42);

    assert_eq!(store.reset_in_progress_waiting_events().await.unwrap(), 42);
    assert!(store.list_in_progress_waiting_events().await.unwrap().is_empty());
    assert_eq!(store.reset_in_progress_waiting_events().await.unwrap(), 0);
}

#[tokio::test]
async fn test_reset_handled_messages_is_idempotent() {
    init_tracing();
    let store = MemoryStore::new();

    for i in 0..44 {
        let message = MessageInstance::new(format!("m{}", i), "process", "catch");
        let id = store.add_message(message).await.unwrap();
        if i < 42 {
            assert!(store.claim_message(id).await.unwrap());
        }
    }
    assert_eq!(store.list_handled_messages().await.unwrap().len(), 42);

    assert_eq!(store.reset_handled_messages().await.unwrap(), 42);
    assert!(store.list_handled_messages().await.unwrap().is_empty());
    assert_eq!(store.reset_handled_messages().await.unwrap(), 0);
    assert_eq!(store.list_unhandled_messages().await.unwrap().len(), 44);
}

#[tokio::test]
async fn test_claim_is_exclusive() {
    init_tracing();
    let store = MemoryStore::new();

    let event = store.add_waiting_event(timer("t")).await.unwrap();
    assert!(store.claim_waiting_event(event).await.unwrap());
    assert!(!store.claim_waiting_event(event).await.unwrap());
    store.release_waiting_event(event).await.unwrap();
    assert!(store.claim_waiting_event(event).await.unwrap());

    let message = store
        .add_message(MessageInstance::new("m", "process", "catch"))
        .await
        .unwrap();
    assert!(store.claim_message(message).await.unwrap());
    assert!(!store.claim_message(message).await.unwrap());
}

#[tokio::test]
async fn test_stale_save_keeps_executing_claim() {
    init_tracing();
    let store = MemoryStore::new();
    let ids = store.create_flow_nodes(vec![user_task("review")]).await.unwrap();
    let snapshot = store.get_flow_node(ids[0]).await.unwrap().unwrap();

    assert!(matches!(
        store.begin_execution(ids[0]).await.unwrap(),
        ExecutionClaim::Claimed(_)
    ));
    let saved = store.save_flow_node(&snapshot).await.unwrap();
    assert!(saved.state_executing);
    assert!(matches!(
        store.begin_execution(ids[0]).await.unwrap(),
        ExecutionClaim::Busy
    ));
}

#[tokio::test]
async fn test_assignment_refused_while_task_is_held() {
    init_tracing();
    let store = MemoryStore::new();
    let ids = store.create_flow_nodes(vec![user_task("review")]).await.unwrap();

    store.begin_execution(ids[0]).await.unwrap();
    assert!(store.assign_user_task(ids[0], Some(7)).await.unwrap().is_none());

    store.reset_executing_flag(ids[0]).await.unwrap();
    let assigned = store.assign_user_task(ids[0], Some(7)).await.unwrap().unwrap();
    assert_eq!(assigned.as_assignable().and_then(|t| t.assignee_id()), Some(7));
    assert!(!assigned.state_executing);

    let automatic = store
        .create_flow_nodes(vec![task("auto", FlowNodeState::Ready)])
        .await
        .unwrap();
    assert!(store.assign_user_task(automatic[0], Some(7)).await.unwrap().is_none());
}

#[tokio::test]
async fn test_commit_execution_writes_data_and_state_together() {
    init_tracing();
    let store = MemoryStore::new();
    store
        .create_data(vec![DataInstance::new(
            "items",
            DataContainer::Process(1),
            DataType::List,
            Value::List(vec![Value::from("a")]),
        )])
        .await
        .unwrap();
    let ids = store
        .create_flow_nodes(vec![task("collect", FlowNodeState::Executing)])
        .await
        .unwrap();
    let mut node = store.get_flow_node(ids[0]).await.unwrap().unwrap();
    node.set_state(FlowNodeState::Completing);

    // an unknown target rejects the whole commit
    let mut broken = items_update(&["a", "c"]);
    broken.data.push(DataUpdate {
        container: DataContainer::Process(1),
        name: "missing".to_string(),
        value: Value::Null,
    });
    assert!(store.commit_execution(&node, broken).await.is_err());
    let stored = store.get_flow_node(ids[0]).await.unwrap().unwrap();
    assert_eq!(stored.state, FlowNodeState::Executing);
    let items = store.get_data(DataContainer::Process(1), "items").await.unwrap().unwrap();
    assert_eq!(items.value, Value::List(vec![Value::from("a")]));

    let (stored, _) = store
        .commit_execution(&node, items_update(&["a", "c"]))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.state, FlowNodeState::Completing);

    // a second commit finds the node no longer executing and writes nothing
    assert!(store
        .commit_execution(&node, items_update(&["a", "c", "c"]))
        .await
        .unwrap()
        .is_none());
    let items = store.get_data(DataContainer::Process(1), "items").await.unwrap().unwrap();
    assert_eq!(items.value, Value::List(vec![Value::from("a"), Value::from("c")]));
}

#[tokio::test]
async fn test_finished_nodes_leave_live_tables() {
    init_tracing();
    let store = MemoryStore::new();
    let ids = store
        .create_flow_nodes(vec![task("done", FlowNodeState::Completed)])
        .await
        .unwrap();
    assert_eq!(store.list_flow_nodes_to_restart().await.unwrap().len(), 1);

    assert!(store.finish_flow_node(ids[0], Vec::new()).await.unwrap().is_empty());
    assert!(store.get_flow_node(ids[0]).await.unwrap().is_none());
    assert!(store.list_flow_nodes_to_restart().await.unwrap().is_empty());
    assert_eq!(store.get_archived_flow_nodes(1).await.unwrap().len(), 1);

    // finishing again is a no-op, an unknown id is not found
    assert!(store.finish_flow_node(ids[0], Vec::new()).await.unwrap().is_empty());
    assert!(store
        .finish_flow_node(ids[0] + 1000, Vec::new())
        .await
        .unwrap_err()
        .is_not_found());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_claims_have_one_winner() {
    init_tracing();
    let store = Arc::new(MemoryStore::new());
    let event = store.add_waiting_event(timer("race")).await.unwrap();
    let ids = store.create_flow_nodes(vec![user_task("race")]).await.unwrap();
    let node = ids[0];

    let mut handles = Vec::new();
    for _ in 0..16 {
        let store = store.clone();
        handles.push(tokio::spawn(async move {
            let (event_claim, execution) = tokio::join!(
                store.claim_waiting_event(event),
                store.begin_execution(node)
            );
            (
                event_claim.unwrap(),
                matches!(execution.unwrap(), ExecutionClaim::Claimed(_)),
            )
        }));
    }

    let mut event_winners = 0;
    let mut execution_winners = 0;
    for handle in handles {
        let (event_claim, execution) = handle.await.unwrap();
        event_winners += usize::from(event_claim);
        execution_winners += usize::from(execution);
    }
    assert_eq!(event_winners, 1);
    assert_eq!(execution_winners, 1);
}
