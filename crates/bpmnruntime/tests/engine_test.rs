// crates/bpmnruntime/tests/engine_test.rs

use bpmncore::{
    ContractDefinition, DataDefinition, DataType, DefinitionId, DocumentDefinition, DocumentValue,
    EngineError, Expression, FlowNodeDefinition, FlowNodeState, InputDefinition, InputType,
    LeftOperand, NotFound, Operation, ProcessDefinition, ProcessInstanceState, Value,
};
use bpmnruntime::{EngineConfig, ProcessEngine};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug")),
        )
        .with_test_writer()
        .try_init();
}

fn new_engine() -> ProcessEngine {
    ProcessEngine::in_memory(
        EngineConfig::default(),
        Arc::new(bpmnexpr::standard_registry()),
    )
}

async fn started_engine() -> ProcessEngine {
    let engine = new_engine();
    engine.after_services_start().await.unwrap();
    engine
}

async fn deploy_enabled(engine: &ProcessEngine, definition: ProcessDefinition) -> DefinitionId {
    let id = engine.deploy(definition).await.unwrap();
    engine.enable_process(id).await.unwrap();
    id
}

/// start -> `task` -> user task "wait" -> end; the user task keeps the instance open
fn held_after(name: &str, task: FlowNodeDefinition) -> ProcessDefinition {
    let mut definition = ProcessDefinition::new(name, "1.0");
    let start = definition.add_node(FlowNodeDefinition::start_event("start"));
    let task = definition.add_node(task);
    let wait = definition.add_node(FlowNodeDefinition::user_task("wait", "employee"));
    let end = definition.add_node(FlowNodeDefinition::end_event("end"));
    definition.connect(start, task);
    definition.connect(task, wait);
    definition.connect(wait, end);
    definition
}

fn file(name: &str, content: &[u8]) -> Value {
    Value::Document(DocumentValue::with_content(
        name,
        "application/pdf",
        content.to_vec(),
    ))
}

#[tokio::test]
async fn test_requests_rejected_before_services_start() {
    init_tracing();
    let engine = new_engine();

    let definition = held_after("Early", FlowNodeDefinition::automatic_task("task"));
    let err = engine.deploy(definition).await.unwrap_err();
    assert!(matches!(err, EngineError::NotReady));

    engine.after_services_start().await.unwrap();
    assert!(engine.after_services_start().await.is_err());
}

#[tokio::test]
async fn test_automatic_process_completes_and_archives() {
    init_tracing();
    let engine = started_engine().await;

    let mut definition = ProcessDefinition::new("Simple", "1.0")
        .with_data(DataDefinition::new("greeting", DataType::Text).with_default(Expression::text("hi")));
    let start = definition.add_node(FlowNodeDefinition::start_event("start"));
    let task = definition.add_node(
        FlowNodeDefinition::automatic_task("greet").with_operation(Operation::assign_data(
            "greeting",
            Expression::script(
                "concat",
                vec![
                    Expression::variable("greeting", DataType::Text),
                    Expression::text(" there"),
                ],
                DataType::Text,
            ),
        )),
    );
    let end = definition.add_node(FlowNodeDefinition::end_event("end"));
    definition.connect(start, task);
    definition.connect(task, end);
    let id = deploy_enabled(&engine, definition).await;

    let pi = engine.start(id).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let err = engine.get_process_instance(pi).await.unwrap_err();
    assert!(matches!(
        err,
        EngineError::NotFound(NotFound::ProcessInstance(_))
    ));
    let archived = engine.get_archived_process_instance(pi).await.unwrap();
    assert_eq!(archived.state, ProcessInstanceState::Completed);

    let greeting = engine
        .get_archived_process_data_instance("greeting", pi)
        .await
        .unwrap();
    assert_eq!(greeting.value, Value::from("hi there"));

    let names: Vec<String> = engine
        .get_archived_flow_node_instances(pi)
        .await
        .unwrap()
        .into_iter()
        .map(|a| a.node.name)
        .collect();
    assert!(names.contains(&"greet".to_string()));
    assert!(names.contains(&"end".to_string()));
}

#[tokio::test]
async fn test_operations_apply_in_order_last_write_wins() {
    init_tracing();
    let engine = started_engine().await;

    let task = FlowNodeDefinition::automatic_task("step1")
        .with_operation(Operation::assign_data("myData1", Expression::text("test1")))
        .with_operation(Operation::assign_data("myData2", Expression::boolean(false)))
        .with_operation(Operation::assign_data("myData3", Expression::long(123)))
        .with_operation(Operation::assign_data("myData1", Expression::text("test1b")));
    let definition = held_after("Ordered", task)
        .with_data(DataDefinition::new("myData1", DataType::Text))
        .with_data(DataDefinition::new("myData2", DataType::Boolean))
        .with_data(DataDefinition::new("myData3", DataType::Long));
    let id = deploy_enabled(&engine, definition).await;

    let pi = engine.start(id).await.unwrap();
    engine.wait_for_user_task(pi, "wait").await.unwrap();

    let data = |name: &'static str| engine.get_process_data_instance(name, pi);
    assert_eq!(data("myData1").await.unwrap().value, Value::from("test1b"));
    assert_eq!(data("myData2").await.unwrap().value, Value::Bool(false));
    assert_eq!(data("myData3").await.unwrap().value, Value::Long(123));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(16))]

    #[test]
    fn test_last_assignment_wins_for_any_sequence(values in prop::collection::vec("[a-z]{1,8}", 1..6)) {
        let runtime = tokio::runtime::Runtime::new().unwrap();
        let stored = runtime.block_on(async {
            let engine = started_engine().await;
            let mut task = FlowNodeDefinition::automatic_task("writes");
            for value in &values {
                task = task.with_operation(Operation::assign_data("myData1", Expression::text(value.as_str())));
            }
            let definition = held_after("Sequence", task)
                .with_data(DataDefinition::new("myData1", DataType::Text));
            let id = deploy_enabled(&engine, definition).await;
            let pi = engine.start(id).await.unwrap();
            engine.wait_for_user_task(pi, "wait").await.unwrap();
            engine.get_process_data_instance("myData1", pi).await.unwrap().value
        });
        prop_assert_eq!(stored, Value::from(values[values.len() - 1].as_str()));
    }
}

#[tokio::test]
async fn test_method_call_appends_to_list() {
    init_tracing();
    let engine = started_engine().await;

    let task = FlowNodeDefinition::automatic_task("collect").with_operation(Operation::method_call(
        "items",
        "add",
        Some("any"),
        Expression::text("c"),
    ));
    let definition = held_after("Collect", task).with_data(
        DataDefinition::new("items", DataType::List).with_default(Expression::list(
            "items",
            vec![Expression::text("a"), Expression::text("b")],
            DataType::List,
        )),
    );
    let id = deploy_enabled(&engine, definition).await;

    let pi = engine.start(id).await.unwrap();
    engine.wait_for_user_task(pi, "wait").await.unwrap();

    let items = engine.get_process_data_instance("items", pi).await.unwrap();
    assert_eq!(
        items.value,
        Value::List(vec![Value::from("a"), Value::from("b"), Value::from("c")])
    );
}

#[tokio::test]
async fn test_xpath_update_through_engine() {
    init_tracing();
    let engine = started_engine().await;

    let task = FlowNodeDefinition::automatic_task("ship")
        .with_operation(Operation::xpath_update(
            "order",
            "/order/status",
            Expression::text("shipped"),
        ))
        .with_operation(Operation::assign_data(
            "status",
            Expression::xpath_read("/order/status", "order"),
        ));
    let definition = held_after("Shipping", task)
        .with_data(
            DataDefinition::new("order", DataType::Xml)
                .with_default(Expression::xml("<order><status>new</status></order>")),
        )
        .with_data(DataDefinition::new("status", DataType::Text));
    let id = deploy_enabled(&engine, definition).await;

    let pi = engine.start(id).await.unwrap();
    engine.wait_for_user_task(pi, "wait").await.unwrap();

    let status = engine.get_process_data_instance("status", pi).await.unwrap();
    assert_eq!(status.value, Value::from("shipped"));
    let order = engine.get_process_data_instance("order", pi).await.unwrap();
    assert!(matches!(order.value, Value::Xml(ref xml) if xml.contains("shipped") && !xml.contains("new")));
}

#[tokio::test]
async fn test_string_indexes_follow_operations() {
    init_tracing();
    let engine = started_engine().await;

    let mut task = FlowNodeDefinition::automatic_task("reindex");
    for slot in 1..=5 {
        task = task.with_operation(Operation::set_string_index(
            slot,
            Expression::text(format!("newValue{}", slot)),
        ));
    }
    let mut definition = ProcessDefinition::new("Indexed", "1.0");
    for slot in 1..=5 {
        definition = definition.with_string_index(
            slot,
            format!("label{}", slot),
            Some(Expression::text(format!("value{}", slot))),
        );
    }
    let start = definition.add_node(FlowNodeDefinition::start_event("start"));
    let before = definition.add_node(FlowNodeDefinition::user_task("before", "employee"));
    let task = definition.add_node(task);
    let after = definition.add_node(FlowNodeDefinition::user_task("after", "employee"));
    definition.connect(start, before);
    definition.connect(before, task);
    definition.connect(task, after);
    let id = deploy_enabled(&engine, definition).await;

    let labels = engine.list_string_index_labels(id).await.unwrap();
    for slot in 1..=5 {
        assert_eq!(labels[slot - 1].as_deref(), Some(format!("label{}", slot).as_str()));
    }

    let pi = engine.start(id).await.unwrap();
    let before = engine.wait_for_user_task(pi, "before").await.unwrap();
    let instance = engine.get_process_instance(pi).await.unwrap();
    for slot in 1..=5 {
        assert_eq!(
            instance.string_indexes[slot - 1].as_deref(),
            Some(format!("value{}", slot).as_str())
        );
    }

    engine.execute_user_task(before, 1, BTreeMap::new()).await.unwrap();
    engine.wait_for_user_task(pi, "after").await.unwrap();
    let instance = engine.get_process_instance(pi).await.unwrap();
    for slot in 1..=5 {
        assert_eq!(
            instance.string_indexes[slot - 1].as_deref(),
            Some(format!("newValue{}", slot).as_str())
        );
    }
}

#[tokio::test]
async fn test_documents_from_contract_inputs() {
    init_tracing();
    let engine = started_engine().await;

    let contract = ContractDefinition::new()
        .with_input(InputDefinition::new("file", InputType::File))
        .with_input(InputDefinition::new("files", InputType::File).multiple());
    let task = FlowNodeDefinition::automatic_task("noop");
    let definition = held_after("Filing", task)
        .with_contract(contract)
        .with_document(
            DocumentDefinition::single("contract")
                .with_initial_value(Expression::contract_input("file", DataType::Document)),
        )
        .with_document(
            DocumentDefinition::list("annexes")
                .with_initial_value(Expression::contract_input("files", DataType::DocumentList)),
        );
    let id = deploy_enabled(&engine, definition).await;

    let mut inputs = BTreeMap::new();
    inputs.insert("file".to_string(), file("contract.pdf", b"%PDF-main"));
    inputs.insert(
        "files".to_string(),
        Value::List(vec![
            file("a.pdf", b"%PDF-a"),
            file("b.pdf", b"%PDF-b"),
            file("c.pdf", b"%PDF-c"),
        ]),
    );
    let pi = engine.start_process(id, 1, inputs).await.unwrap();
    engine.wait_for_user_task(pi, "wait").await.unwrap();

    let document = engine.get_document(pi, "contract").await.unwrap();
    assert_eq!(document.content_file_name.as_deref(), Some("contract.pdf"));
    assert_eq!(document.content.as_deref(), Some(&b"%PDF-main"[..]));

    let annexes = engine.list_documents(pi, "annexes", 0..10).await.unwrap();
    let names: Vec<_> = annexes
        .iter()
        .map(|d| d.content_file_name.clone().unwrap_or_default())
        .collect();
    assert_eq!(names, vec!["a.pdf", "b.pdf", "c.pdf"]);

    let page = engine.list_documents(pi, "annexes", 1..2).await.unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0].content_file_name.as_deref(), Some("b.pdf"));

    assert!(engine.get_document(pi, "annexes").await.is_err());
    assert!(matches!(
        engine.get_document(pi, "missing").await.unwrap_err(),
        EngineError::NotFound(NotFound::Document { .. })
    ));
}

#[tokio::test]
async fn test_contract_violation_rejects_start() {
    init_tracing();
    let engine = started_engine().await;

    let contract = ContractDefinition::new()
        .with_input(InputDefinition::new("amount", InputType::Integer))
        .with_constraint(
            "positive",
            Expression::comparison(
                ">",
                Expression::contract_input("amount", DataType::Long),
                Expression::long(0),
            ),
            "amount must be positive",
        );
    let definition = held_after("Orders", FlowNodeDefinition::automatic_task("task"))
        .with_contract(contract);
    let id = deploy_enabled(&engine, definition).await;

    let err = engine.start_process(id, 1, BTreeMap::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let mut inputs = BTreeMap::new();
    inputs.insert("amount".to_string(), Value::Long(-3));
    let err = engine.start_process(id, 1, inputs).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));

    let mut inputs = BTreeMap::new();
    inputs.insert("amount".to_string(), Value::Long(3));
    assert!(engine.start_process(id, 1, inputs).await.is_ok());
}

#[tokio::test]
async fn test_deploy_rejects_operation_without_expression() {
    init_tracing();
    let engine = started_engine().await;

    let mut operation = Operation::assign_data("myData1", Expression::text("x"));
    operation.right_operand = None;
    let definition = held_after(
        "Broken",
        FlowNodeDefinition::automatic_task("task").with_operation(operation),
    )
    .with_data(DataDefinition::new("myData1", DataType::Text));

    let err = engine.deploy(definition).await.unwrap_err();
    assert!(matches!(err, EngineError::Validation(_)));
}

#[tokio::test]
async fn test_deploy_rejects_duplicate_version() {
    init_tracing();
    let engine = started_engine().await;

    let first = held_after("Twice", FlowNodeDefinition::automatic_task("task"));
    let second = held_after("Twice", FlowNodeDefinition::automatic_task("task"));
    engine.deploy(first).await.unwrap();
    assert!(matches!(
        engine.deploy(second).await.unwrap_err(),
        EngineError::Validation(_)
    ));
}

#[tokio::test]
async fn test_disabled_process_cannot_start() {
    init_tracing();
    let engine = started_engine().await;

    let id = deploy_enabled(
        &engine,
        held_after("Toggle", FlowNodeDefinition::automatic_task("task")),
    )
    .await;
    engine.disable_process(id).await.unwrap();
    assert!(engine.start(id).await.is_err());

    engine.enable_process(id).await.unwrap();
    assert!(engine.start(id).await.is_ok());
}

#[tokio::test]
async fn test_user_task_assignment_and_execution() {
    init_tracing();
    let engine = started_engine().await;

    let mut review = FlowNodeDefinition::user_task("review", "manager").with_operation(
        Operation::assign_data(
            "approved",
            Expression::contract_input("approved", DataType::Boolean),
        ),
    );
    if let bpmncore::FlowNodeDefinitionKind::UserTask(task) = &mut review.kind {
        task.contract = ContractDefinition::new()
            .with_input(InputDefinition::new("approved", InputType::Boolean));
    }
    let mut definition = ProcessDefinition::new("Review", "1.0")
        .with_data(DataDefinition::new("approved", DataType::Boolean));
    let start = definition.add_node(FlowNodeDefinition::start_event("start"));
    let review = definition.add_node(review);
    let end = definition.add_node(FlowNodeDefinition::end_event("end"));
    definition.connect(start, review);
    definition.connect(review, end);
    let id = deploy_enabled(&engine, definition).await;

    let pi = engine.start(id).await.unwrap();
    let task = engine.wait_for_user_task(pi, "review").await.unwrap();
    assert_eq!(
        engine.get_flow_node_instance(task).await.unwrap().state,
        FlowNodeState::Ready
    );

    engine.assign_user_task(task, Some(7)).await.unwrap();
    let mut inputs = BTreeMap::new();
    inputs.insert("approved".to_string(), Value::Bool(true));
    assert!(engine.execute_user_task(task, 8, inputs.clone()).await.is_err());
    assert!(engine.execute_user_task(task, 7, BTreeMap::new()).await.is_err());

    engine.execute_user_task(task, 7, inputs).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let archived = engine.get_archived_process_instance(pi).await.unwrap();
    assert_eq!(archived.state, ProcessInstanceState::Completed);
    let approved = engine
        .get_archived_process_data_instance("approved", pi)
        .await
        .unwrap();
    assert_eq!(approved.value, Value::Bool(true));
}

#[tokio::test]
async fn test_assignment_waits_for_a_held_task() {
    init_tracing();
    let engine = started_engine().await;

    let mut definition = ProcessDefinition::new("Assign", "1.0");
    let start = definition.add_node(FlowNodeDefinition::start_event("start"));
    let review = definition.add_node(FlowNodeDefinition::user_task("review", "manager"));
    let end = definition.add_node(FlowNodeDefinition::end_event("end"));
    definition.connect(start, review);
    definition.connect(review, end);
    let id = deploy_enabled(&engine, definition).await;

    let pi = engine.start(id).await.unwrap();
    let task = engine.wait_for_user_task(pi, "review").await.unwrap();

    engine.store().begin_execution(task).await.unwrap();
    let err = engine.assign_user_task(task, Some(3)).await.unwrap_err();
    assert!(err.is_conflict());
    assert!(engine.store().get_flow_node(task).await.unwrap().unwrap().state_executing);

    engine.store().reset_executing_flag(task).await.unwrap();
    engine.assign_user_task(task, Some(3)).await.unwrap();
    let node = engine.get_flow_node_instance(task).await.unwrap();
    assert_eq!(node.as_assignable().and_then(|t| t.assignee_id()), Some(3));

    engine.execute_user_task(task, 3, BTreeMap::new()).await.unwrap();
    engine.run_until_idle().await.unwrap();
    let err = engine.assign_user_task(task, None).await.unwrap_err();
    assert!(err.is_not_found());
}

#[tokio::test]
async fn test_update_data_is_type_checked() {
    init_tracing();
    let engine = started_engine().await;

    let definition = held_after("Typed", FlowNodeDefinition::automatic_task("task"))
        .with_data(DataDefinition::new("count", DataType::Long).with_default(Expression::long(1)));
    let id = deploy_enabled(&engine, definition).await;
    let pi = engine.start(id).await.unwrap();
    engine.wait_for_user_task(pi, "wait").await.unwrap();

    assert!(engine
        .update_process_data_instance("count", pi, Value::from("many"))
        .await
        .is_err());
    engine
        .update_process_data_instance("count", pi, Value::Long(5))
        .await
        .unwrap();
    assert_eq!(
        engine.get_process_data_instance("count", pi).await.unwrap().value,
        Value::Long(5)
    );
    assert!(matches!(
        engine.get_process_data_instance("nope", pi).await.unwrap_err(),
        EngineError::NotFound(NotFound::Data { .. })
    ));
}

#[tokio::test]
async fn test_external_data_operation() {
    init_tracing();
    let engine = started_engine().await;

    let task = FlowNodeDefinition::automatic_task("sync").with_operation(Operation::assign(
        LeftOperand::external_data("erp"),
        Expression::text("synced"),
    ));
    let id = deploy_enabled(&engine, held_after("External", task)).await;
    let pi = engine.start(id).await.unwrap();
    engine.wait_for_user_task(pi, "wait").await.unwrap();

    assert_eq!(
        engine.get_external_data(pi, "erp").await.unwrap(),
        Some(Value::from("synced"))
    );
    assert_eq!(engine.get_external_data(pi, "other").await.unwrap(), None);
}

#[tokio::test]
async fn test_failure_without_handler_ends_instance_in_error() {
    init_tracing();
    let engine = started_engine().await;

    let task = FlowNodeDefinition::automatic_task("broken").with_operation(Operation::assign_data(
        "size",
        Expression::script("length", vec![Expression::long(5)], DataType::Long),
    ));
    let definition =
        held_after("Failing", task).with_data(DataDefinition::new("size", DataType::Long));
    let id = deploy_enabled(&engine, definition).await;

    let pi = engine.start(id).await.unwrap();
    engine.run_until_idle().await.unwrap();

    let archived = engine.get_archived_process_instance(pi).await.unwrap();
    assert_eq!(archived.state, ProcessInstanceState::Error);
    assert_eq!(engine.failed_flow_node_count(pi).await.unwrap(), 1);
}

#[tokio::test]
async fn test_workers_drive_instances_in_background() {
    init_tracing();
    let engine = started_engine().await;

    let id = deploy_enabled(
        &engine,
        held_after("Background", FlowNodeDefinition::automatic_task("task")),
    )
    .await;
    let handle = engine.start_workers().unwrap();
    let pi = engine.start(id).await.unwrap();

    let mut ready = false;
    for _ in 0..100 {
        let found = engine
            .search_flow_nodes(&bpmnruntime::SearchOptions::new(
                bpmnruntime::FlowNodeFilter::user_tasks()
                    .in_process(pi)
                    .in_state(FlowNodeState::Ready),
            ))
            .await
            .unwrap();
        if !found.items.is_empty() {
            ready = true;
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
    }
    handle.shutdown().await;
    assert!(ready, "user task never became ready");
}
