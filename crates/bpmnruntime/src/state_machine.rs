//! Flow node state machine.
//!
//! A worker owns a node from `begin_execution` until the executing flag is
//! reset. Each step either commits in a single store call or can be redone
//! when recovery finds the node half way through.

use crate::context::{DeployedProcess, EngineContext};
use crate::correlation;
use crate::lifecycle::{self, StartCause};
use crate::scheduler::WorkItem;
use crate::store::{ExecutionClaim, Successor};
use crate::working_set::WorkingSet;
use bpmncore::{
    CallActivityDefinition, DataContainer, DataInstance, DataType, ElementId, EndEventResult,
    EngineError, EngineEvent, EvaluationContext, EventTarget, EventTrigger, ExpressionError,
    FlowNodeDefinition, FlowNodeDefinitionKind, FlowNodeExecutionError, FlowNodeInstance,
    FlowNodeInstanceId, FlowNodeInterruption, FlowNodeKind, FlowNodeState, GatewayType,
    HumanTask, Interruption, LoopCharacteristics, MultiInstanceDefinition, NotFound,
    OperationError, ProcessDefinition, ProcessInstance, ProcessInstanceId, ProcessInstanceState,
    Result, TransitionDefinition, Value, WaitingEventType,
};
use chrono::Utc;
use std::collections::BTreeMap;
use std::ops::Range;

/// Why a step stopped: the engine itself broke, or the node failed and the
/// process should handle it
enum Fault {
    Engine(EngineError),
    Failed {
        message: String,
        error_code: Option<String>,
    },
}

impl Fault {
    fn failed(message: impl Into<String>) -> Self {
        Fault::Failed {
            message: message.into(),
            error_code: None,
        }
    }

    fn into_engine_error(self, id: FlowNodeInstanceId) -> EngineError {
        match self {
            Fault::Engine(e) => e,
            Fault::Failed { message, .. } => FlowNodeExecutionError::new(id, message).into(),
        }
    }
}

impl From<EngineError> for Fault {
    fn from(e: EngineError) -> Self {
        Fault::Engine(e)
    }
}

impl From<NotFound> for Fault {
    fn from(e: NotFound) -> Self {
        Fault::Engine(e.into())
    }
}

impl From<OperationError> for Fault {
    fn from(e: OperationError) -> Self {
        Fault::failed(e.to_string())
    }
}

impl From<ExpressionError> for Fault {
    fn from(e: ExpressionError) -> Self {
        Fault::failed(e.to_string())
    }
}

type Step = std::result::Result<(), Fault>;

/// Drives a flow node until it waits, finishes or fails
pub async fn execute(ctx: &EngineContext, id: FlowNodeInstanceId) -> Result<()> {
    let node = match ctx.store.begin_execution(id).await? {
        ExecutionClaim::Claimed(node) => node,
        ExecutionClaim::Busy => {
            return Err(EngineError::Conflict(format!(
                "flow node {} is being executed",
                id
            )))
        }
        ExecutionClaim::Gone => {
            return Err(FlowNodeExecutionError::new(id, "flow node is deleted or unknown").into())
        }
    };

    let outcome = match step(ctx, node).await {
        Ok(()) => Ok(()),
        Err(Fault::Failed {
            message,
            error_code,
        }) => fail(ctx, id, message, error_code).await,
        Err(Fault::Engine(e)) => Err(e),
    };
    release(ctx, id, outcome.is_ok()).await?;
    outcome
}

/// Moves a ready or waiting node straight to skipped; it continues along
/// its outgoing transitions like a completed one
pub async fn skip(ctx: &EngineContext, id: FlowNodeInstanceId) -> Result<()> {
    let node = match ctx.store.begin_execution(id).await? {
        ExecutionClaim::Claimed(node) => node,
        ExecutionClaim::Busy => {
            return Err(EngineError::Conflict(format!(
                "flow node {} is being executed",
                id
            )))
        }
        ExecutionClaim::Gone => return Err(NotFound::FlowNode(id).into()),
    };
    let outcome = skip_claimed(ctx, node).await;
    release(ctx, id, false).await?;
    outcome
}

async fn skip_claimed(ctx: &EngineContext, mut node: FlowNodeInstance) -> Result<()> {
    if !node.stable || node.terminal || node.interrupt_request.is_some() {
        return Err(EngineError::validation(format!(
            "Flow node {} is {} and cannot be skipped",
            node.id, node.state
        )));
    }
    if matches!(
        node.kind,
        FlowNodeKind::MultiInstance { .. } | FlowNodeKind::Loop { .. }
    ) {
        return Err(EngineError::validation(format!(
            "Flow node {} has running instances and cannot be skipped",
            node.id
        )));
    }

    let deployed = ctx.deployed(node.process_definition_id).await?;
    let definition = deployed
        .definition
        .find_node(node.definition_id)
        .ok_or(NotFound::FlowNode(node.id))?;
    let (_, set) = ctx.working_set(&deployed, &node).await?;
    let taken = choose_transitions(ctx, &deployed, definition, &node, &set)
        .map_err(|fault| fault.into_engine_error(node.id))?;

    if let FlowNodeKind::CallActivity {
        called_process_instance_id: Some(child),
    } = node.kind
    {
        ctx.queue.push(WorkItem::Interrupt {
            process_instance_id: child,
            interruption: Interruption::Aborted,
        });
    }

    node.taken_transitions = Some(taken);
    node.set_state(FlowNodeState::Skipped);
    if !ctx.store.complete_flow_node(&node).await? {
        return Err(EngineError::Conflict(format!(
            "flow node {} was interrupted",
            node.id
        )));
    }
    tracing::info!(flow_node = node.id, "'{}' skipped", node.name);
    ctx.emit_state(&node);
    finish(ctx, &deployed, node, Vec::new()).await
}

/// Resets the executing flag; a node that received work while it was held
/// goes back to the queue
async fn release(ctx: &EngineContext, id: FlowNodeInstanceId, requeue: bool) -> Result<()> {
    match ctx.store.reset_executing_flag(id).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => return Err(e),
    }
    if requeue {
        if let Some(node) = ctx.store.get_flow_node(id).await? {
            if has_pending_work(&node) {
                ctx.queue.push(WorkItem::Execute(id));
            }
        }
    }
    Ok(())
}

fn has_pending_work(node: &FlowNodeInstance) -> bool {
    if node.deleted {
        return false;
    }
    match node.interrupt_request {
        Some(request) => node.state != request.transitional_state(),
        None => {
            node.triggered
                && matches!(node.state, FlowNodeState::Ready | FlowNodeState::Waiting)
                && !matches!(
                    node.kind,
                    FlowNodeKind::MultiInstance { .. } | FlowNodeKind::Loop { .. }
                )
        }
    }
}

async fn step(ctx: &EngineContext, node: FlowNodeInstance) -> Step {
    let deployed = ctx.deployed(node.process_definition_id).await?;
    if node.terminal {
        return Ok(finish(ctx, &deployed, node, Vec::new()).await?);
    }
    if node.interrupt_request.is_some() {
        return Ok(interrupt(ctx, &deployed, node).await?);
    }

    let definition = deployed.definition.find_node(node.definition_id).ok_or_else(|| {
        Fault::failed(format!(
            "Flow node definition {} is missing",
            node.definition_id
        ))
    })?;
    tracing::debug!(flow_node = node.id, state = %node.state, "stepping '{}'", node.name);

    match node.state {
        FlowNodeState::Initializing => initialize(ctx, &deployed, definition, node).await,
        FlowNodeState::Executing => run(ctx, &deployed, definition, node).await,
        FlowNodeState::Completing => complete(ctx, &deployed, node).await,
        FlowNodeState::Ready | FlowNodeState::Waiting if node.triggered => {
            resume(ctx, &deployed, definition, node).await
        }
        FlowNodeState::Ready | FlowNodeState::Waiting => {
            wake(ctx, &deployed, definition, node).await
        }
        _ => Ok(()),
    }
}

async fn initialize(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    mut node: FlowNodeInstance,
) -> Step {
    match node.kind {
        FlowNodeKind::MultiInstance { .. } => {
            return start_multi_instance(ctx, deployed, definition, node).await
        }
        FlowNodeKind::Loop { .. } => return start_loop(ctx, deployed, definition, node).await,
        _ => {}
    }

    if definition.is_activity() {
        create_activity_data(ctx, deployed, definition, &node).await?;
        if node.parent_activity_instance_id.is_none() {
            register_boundaries(ctx, deployed, definition, &node).await?;
        }
    }

    match &definition.kind {
        FlowNodeDefinitionKind::UserTask(task) => {
            if let FlowNodeKind::UserTask(human) = &mut node.kind {
                human.expected_end_date = match task.expected_duration_ms {
                    Some(ms) => Some(
                        i64::try_from(ms)
                            .ok()
                            .and_then(correlation::after_millis)
                            .ok_or_else(|| {
                                Fault::failed(format!(
                                    "Expected duration of '{}' ({} ms) is out of range",
                                    definition.name, ms
                                ))
                            })?,
                    ),
                    None => None,
                };
            }
            suspend(ctx, node, FlowNodeState::Ready).await
        }
        FlowNodeDefinitionKind::CallActivity(call) => {
            start_called_process(ctx, deployed, call, node).await
        }
        FlowNodeDefinitionKind::Gateway(_) => join(ctx, deployed, definition, node).await,
        FlowNodeDefinitionKind::IntermediateCatchEvent(trigger) => {
            ctx.store.delete_waiting_events_for_flow_node(node.id).await?;
            register_event(ctx, deployed, definition, &node, trigger).await?;
            suspend(ctx, node, FlowNodeState::Waiting).await
        }
        FlowNodeDefinitionKind::BoundaryEvent { .. } if node.triggered => {
            resume(ctx, deployed, definition, node).await
        }
        FlowNodeDefinitionKind::BoundaryEvent { .. } => {
            suspend(ctx, node, FlowNodeState::Waiting).await
        }
        _ => run(ctx, deployed, definition, node).await,
    }
}

async fn suspend(ctx: &EngineContext, mut node: FlowNodeInstance, state: FlowNodeState) -> Step {
    node.set_state(state);
    let node = ctx.store.save_flow_node(&node).await?;
    ctx.emit_state(&node);
    Ok(())
}

async fn save(ctx: &EngineContext, node: FlowNodeInstance) -> Step {
    ctx.store.save_flow_node(&node).await?;
    Ok(())
}

/// Activity data defaults, in declared order; data left by an earlier
/// attempt is kept
async fn create_activity_data(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    node: &FlowNodeInstance,
) -> Step {
    if definition.data.is_empty() {
        return Ok(());
    }
    let container = DataContainer::Activity(node.id);
    let existing = ctx.store.list_data(container).await?;
    let (_, mut set) = ctx.working_set(deployed, node).await?;

    let mut created = Vec::new();
    for data in &definition.data {
        if existing.iter().any(|d| d.name == data.name) {
            continue;
        }
        let value = match &data.default_value {
            Some(expression) => ctx.resolver.evaluate(expression, &set)?,
            None => Value::Null,
        };
        if !data.data_type.accepts(&value) {
            return Err(OperationError::TypeMismatch {
                name: data.name.clone(),
                expected: data.data_type.to_string(),
                actual: value.type_name().to_string(),
            }
            .into());
        }
        set.declare(container, data);
        set.set_data(&data.name, value.clone());

        let mut instance =
            DataInstance::new(&data.name, container, data.data_type.clone(), value);
        instance.transient = data.transient;
        created.push(instance);
    }
    if !created.is_empty() {
        ctx.store.create_data(created).await?;
    }
    Ok(())
}

/// Boundary events wait next to the activity. Error boundaries are only
/// looked up when the activity fails.
async fn register_boundaries(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    node: &FlowNodeInstance,
) -> Step {
    let open = ctx.store.list_flow_nodes(node.process_instance_id).await?;
    let registered = open.iter().any(|other| {
        matches!(other.kind, FlowNodeKind::BoundaryEvent { attached_to, .. } if attached_to == node.id)
    });
    if registered {
        return Ok(());
    }

    for boundary in deployed.definition.boundary_events_of(definition.id) {
        let FlowNodeDefinitionKind::BoundaryEvent {
            trigger,
            interrupting,
            ..
        } = &boundary.kind
        else {
            continue;
        };
        if matches!(trigger, EventTrigger::Error { .. }) {
            continue;
        }

        let mut instance = spawn(
            boundary,
            node.process_instance_id,
            node.root_process_instance_id,
            node.process_definition_id,
        );
        instance.kind = FlowNodeKind::BoundaryEvent {
            attached_to: node.id,
            interrupting: *interrupting,
        };
        instance.set_state(FlowNodeState::Waiting);
        let ids = ctx.store.create_flow_nodes(vec![instance.clone()]).await?;
        if let Some(id) = ids.first() {
            instance.id = *id;
            register_event(ctx, deployed, boundary, &instance, trigger).await?;
        }
    }
    Ok(())
}

async fn register_event(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    node: &FlowNodeInstance,
    trigger: &EventTrigger,
) -> Step {
    let (_, set) = ctx.working_set(deployed, node).await?;
    let event = correlation::waiting_event(
        &ctx.resolver,
        trigger,
        &deployed.definition.name,
        &definition.name,
        EventTarget::FlowNode {
            flow_node_id: node.id,
        },
        &set,
    )?;
    if let Some(event) = event {
        let is_message = event.event_type == WaitingEventType::Message;
        let id = ctx.store.add_waiting_event(event).await?;
        tracing::debug!(flow_node = node.id, waiting_event = id, "'{}' waits", definition.name);
        if is_message {
            ctx.queue.push(WorkItem::MatchMessages);
        }
    }
    Ok(())
}

async fn start_called_process(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    call: &CallActivityDefinition,
    mut node: FlowNodeInstance,
) -> Step {
    if let FlowNodeKind::CallActivity {
        called_process_instance_id: Some(_),
    } = node.kind
    {
        return suspend(ctx, node, FlowNodeState::Waiting).await;
    }

    let missing = || {
        Fault::failed(format!(
            "No enabled process '{}'{}",
            call.process_name,
            call.process_version
                .as_deref()
                .map(|v| format!(" version {}", v))
                .unwrap_or_default()
        ))
    };
    let target = ctx
        .store
        .find_definition(&call.process_name, call.process_version.as_deref())
        .await?
        .ok_or_else(missing)?;
    if !ctx.store.is_definition_enabled(target.id).await? {
        return Err(missing());
    }

    let (instance, set) = ctx.working_set(deployed, &node).await?;
    let mut data = BTreeMap::new();
    for mapping in &call.input_mappings {
        data.insert(
            mapping.name.clone(),
            ctx.resolver.evaluate(&mapping.expression, &set)?,
        );
    }

    let cause = StartCause::CallActivity {
        caller_id: node.id,
        root_process_instance_id: instance.root_process_instance_id,
        data,
    };
    let child = match lifecycle::start_process(
        ctx,
        target.id,
        instance.started_by,
        BTreeMap::new(),
        cause,
    )
    .await
    {
        Ok(child) => child,
        Err(EngineError::Validation(e)) => return Err(Fault::failed(e.to_string())),
        Err(e) => return Err(e.into()),
    };

    tracing::info!(
        flow_node = node.id,
        process_instance = child.id,
        "'{}' called '{}'",
        node.name,
        target.name
    );
    node.kind = FlowNodeKind::CallActivity {
        called_process_instance_id: Some(child.id),
    };
    suspend(ctx, node, FlowNodeState::Waiting).await
}

/// Gateways fire once enough incoming transitions arrived
async fn join(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    node: FlowNodeInstance,
) -> Step {
    let (gateway_type, all_hit) = match &node.kind {
        FlowNodeKind::Gateway {
            gateway_type,
            hit_by,
        } => (
            *gateway_type,
            deployed
                .definition
                .incoming(definition.id)
                .all(|t| hit_by.contains(&t.id)),
        ),
        _ => return run(ctx, deployed, definition, node).await,
    };

    let ready = match gateway_type {
        GatewayType::Exclusive => true,
        GatewayType::Parallel => all_hit,
        GatewayType::Inclusive => all_hit || !upstream_tokens(ctx, deployed, &node).await?,
    };
    if ready {
        tracing::debug!(flow_node = node.id, "gateway '{}' fires", node.name);
        run(ctx, deployed, definition, node).await
    } else if node.state != FlowNodeState::Waiting {
        suspend(ctx, node, FlowNodeState::Waiting).await
    } else {
        Ok(())
    }
}

/// Whether another open node could still bring a token to the gateway
async fn upstream_tokens(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    gateway: &FlowNodeInstance,
) -> Result<bool> {
    let open = ctx.store.list_flow_nodes(gateway.process_instance_id).await?;
    Ok(open.iter().any(|other| {
        other.id != gateway.id
            && other.definition_id != gateway.definition_id
            && deployed
                .graph
                .can_reach(other.definition_id, gateway.definition_id)
    }))
}

/// Runs the operations, picks the outgoing transitions and commits both
/// with the move to `Completing`, so a replay never sees half of it
async fn run(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    mut node: FlowNodeInstance,
) -> Step {
    if node.state != FlowNodeState::Executing {
        node.set_state(FlowNodeState::Executing);
        node = ctx.store.save_flow_node(&node).await?;
        ctx.emit_state(&node);
    }

    let (_, mut set) = ctx.working_set(deployed, &node).await?;
    ctx.operations.apply_all(&definition.operations, &mut set)?;
    match &definition.kind {
        FlowNodeDefinitionKind::IntermediateThrowEvent(message)
        | FlowNodeDefinitionKind::EndEvent(EndEventResult::Message(message)) => {
            let message = correlation::thrown_message(&ctx.resolver, message, &set)?;
            set.push_message(message);
        }
        _ => {}
    }
    let taken = choose_transitions(ctx, deployed, definition, &node, &set)?;

    let batch = set.into_batch();
    let throws = !batch.messages.is_empty();
    node.taken_transitions = Some(taken);
    node.set_state(FlowNodeState::Completing);
    let Some((node, _)) = ctx.store.commit_execution(&node, batch).await? else {
        return Err(EngineError::Conflict(format!(
            "flow node {} stopped executing before its operations were committed",
            node.id
        ))
        .into());
    };
    if throws {
        ctx.queue.push(WorkItem::MatchMessages);
    }
    complete(ctx, deployed, node).await
}

/// Parallel gateways take every transition and exclusive ones the first
/// that passes; anything else takes all that pass. The default transition is
/// taken when nothing else is.
fn choose_transitions(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    node: &FlowNodeInstance,
    set: &WorkingSet,
) -> std::result::Result<Vec<ElementId>, Fault> {
    if node.parent_activity_instance_id.is_some() {
        return Ok(Vec::new());
    }
    let gateway = match &definition.kind {
        FlowNodeDefinitionKind::Gateway(gateway_type) => Some(*gateway_type),
        _ => None,
    };

    let outgoing: Vec<&TransitionDefinition> = deployed.definition.outgoing(definition.id).collect();
    let mut taken = Vec::new();
    let mut default = None;
    for transition in &outgoing {
        if gateway == Some(GatewayType::Parallel) {
            taken.push(transition.id);
            continue;
        }
        if transition.default {
            default = Some(transition.id);
            continue;
        }
        let passes = match &transition.condition {
            Some(condition) => ctx.resolver.evaluate_condition(condition, set)?,
            None => true,
        };
        if passes {
            taken.push(transition.id);
            if gateway == Some(GatewayType::Exclusive) {
                break;
            }
        }
    }

    if taken.is_empty() && !outgoing.is_empty() {
        match default {
            Some(id) => taken.push(id),
            None => {
                return Err(Fault::failed(format!(
                    "No outgoing transition of '{}' can be taken",
                    definition.name
                )))
            }
        }
    }
    Ok(taken)
}

async fn complete(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    mut node: FlowNodeInstance,
) -> Step {
    node.set_state(FlowNodeState::Completed);
    if !ctx.store.complete_flow_node(&node).await? {
        return match ctx.store.get_flow_node(node.id).await? {
            Some(stored) if !stored.deleted => Ok(interrupt(ctx, deployed, stored).await?),
            _ => Ok(()),
        };
    }
    tracing::info!(flow_node = node.id, "'{}' completed", node.name);
    ctx.emit_state(&node);

    let result = deployed
        .definition
        .find_node(node.definition_id)
        .and_then(|d| match &d.kind {
            FlowNodeDefinitionKind::EndEvent(result) => Some(result),
            _ => None,
        });
    let interruption = match result {
        Some(EndEventResult::Terminate) => Some(Interruption::Terminated),
        Some(EndEventResult::Error { code }) => Some(Interruption::Failed {
            error_code: Some(code.clone()),
        }),
        _ => None,
    };
    if let Some(interruption) = interruption {
        lifecycle::interrupt_process(ctx, node.process_instance_id, interruption).await?;
    }
    Ok(finish(ctx, deployed, node, Vec::new()).await?)
}

/// Archives a terminal node and spawns what comes after it
async fn finish(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    node: FlowNodeInstance,
    mut successors: Vec<Successor>,
) -> Result<()> {
    if matches!(node.state, FlowNodeState::Completed | FlowNodeState::Skipped)
        && node.parent_activity_instance_id.is_none()
    {
        for id in node.taken_transitions.iter().flatten() {
            let transition = deployed
                .definition
                .find_transition(*id)
                .ok_or_else(|| EngineError::validation(format!("Unknown transition {}", id)))?;
            successors.push(successor(deployed, &node, transition)?);
        }
    }

    let next = ctx.store.finish_flow_node(node.id, successors).await?;
    for id in &next {
        ctx.queue.push(WorkItem::Execute(*id));
    }
    tracing::debug!(flow_node = node.id, next = next.len(), "'{}' archived as {}", node.name, node.state);
    wake_dependents(ctx, &node).await
}

fn successor(
    deployed: &DeployedProcess,
    from: &FlowNodeInstance,
    transition: &TransitionDefinition,
) -> Result<Successor> {
    let target = deployed.definition.find_node(transition.target).ok_or_else(|| {
        EngineError::validation(format!(
            "Transition {} leads to unknown node {}",
            transition.id, transition.target
        ))
    })?;
    let node = spawn(
        target,
        from.process_instance_id,
        from.root_process_instance_id,
        from.process_definition_id,
    );
    Ok(match target.kind {
        FlowNodeDefinitionKind::Gateway(GatewayType::Parallel | GatewayType::Inclusive) => {
            Successor::Join {
                node,
                transition: transition.id,
            }
        }
        _ => Successor::Node(node),
    })
}

/// Parents, boundary events and inclusive joins that may care about a node
/// having finished
async fn wake_dependents(ctx: &EngineContext, node: &FlowNodeInstance) -> Result<()> {
    if let Some(parent) = node.parent_activity_instance_id {
        ctx.queue.push(WorkItem::Execute(parent));
    }

    let open = ctx.store.list_flow_nodes(node.process_instance_id).await?;
    for other in &open {
        match &other.kind {
            FlowNodeKind::BoundaryEvent { attached_to, .. }
                if *attached_to == node.id && !other.triggered =>
            {
                if ctx
                    .store
                    .request_flow_node_interruption(other.id, FlowNodeInterruption::Abort)
                    .await?
                {
                    ctx.queue.push(WorkItem::Execute(other.id));
                }
            }
            FlowNodeKind::Gateway {
                gateway_type: GatewayType::Inclusive,
                ..
            } if other.state == FlowNodeState::Waiting => {
                ctx.queue.push(WorkItem::Execute(other.id));
            }
            _ => {}
        }
    }
    if open.is_empty() {
        ctx.queue.push(WorkItem::CheckCompletion(node.process_instance_id));
    }
    Ok(())
}

async fn resume(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    node: FlowNodeInstance,
) -> Step {
    match &node.kind {
        FlowNodeKind::BoundaryEvent {
            attached_to,
            interrupting: true,
        } => {
            if ctx
                .store
                .request_flow_node_interruption(*attached_to, FlowNodeInterruption::Abort)
                .await?
            {
                ctx.queue.push(WorkItem::Execute(*attached_to));
            }
            tracing::info!(flow_node = node.id, "'{}' interrupts {}", node.name, attached_to);
        }
        FlowNodeKind::CallActivity {
            called_process_instance_id: Some(child),
        } => {
            if let Some(archived) = ctx.store.get_archived_process_instance(*child).await? {
                if archived.state == ProcessInstanceState::Error {
                    return Err(Fault::Failed {
                        message: format!("Called process instance {} ended in error", child),
                        error_code: archived.error_code,
                    });
                }
            }
        }
        FlowNodeKind::MultiInstance { .. } | FlowNodeKind::Loop { .. } => {
            return wake(ctx, deployed, definition, node).await
        }
        _ => {}
    }
    run(ctx, deployed, definition, node).await
}

/// Re-checks a waiting node that was not triggered
async fn wake(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    node: FlowNodeInstance,
) -> Step {
    match node.kind {
        FlowNodeKind::Gateway { .. } => join(ctx, deployed, definition, node).await,
        FlowNodeKind::MultiInstance { .. } => {
            check_multi_instance(ctx, deployed, definition, node).await
        }
        FlowNodeKind::Loop { .. } => check_loop(ctx, deployed, definition, node).await,
        _ => Ok(()),
    }
}

async fn start_multi_instance(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    mut node: FlowNodeInstance,
) -> Step {
    let Some(LoopCharacteristics::MultiInstance(multi)) = &definition.loop_characteristics else {
        return Err(Fault::failed(format!(
            "'{}' is not a multi-instance activity",
            definition.name
        )));
    };
    register_boundaries(ctx, deployed, definition, &node).await?;

    let (_, set) = ctx.working_set(deployed, &node).await?;
    let items = collection_items(multi, &set)?;
    let total = match &items {
        Some(items) => u32::try_from(items.len()).map_err(|_| {
            Fault::failed(format!(
                "'{}' has too many items: {}",
                definition.name,
                items.len()
            ))
        })?,
        None => {
            let expression = multi.cardinality.as_ref().ok_or_else(|| {
                Fault::failed(format!(
                    "'{}' has neither a cardinality nor a collection",
                    definition.name
                ))
            })?;
            let value = ctx.resolver.evaluate(expression, &set)?;
            let cardinality = match &value {
                Value::Long(n) => u32::try_from(*n).ok(),
                _ => None,
            };
            cardinality.ok_or_else(|| {
                Fault::failed(format!(
                    "Cardinality of '{}' evaluated to {}",
                    definition.name, value
                ))
            })?
        }
    };

    let existing = ctx.store.list_child_flow_nodes(node.id).await?;
    let started = if existing.is_empty() {
        let started = if multi.sequential { total.min(1) } else { total };
        spawn_children(
            ctx,
            definition,
            &node,
            0..started,
            items.as_deref(),
            multi.input_item.as_deref(),
        )
        .await?;
        started
    } else {
        existing.len() as u32
    };

    node.kind = FlowNodeKind::MultiInstance {
        sequential: multi.sequential,
        total,
        started,
        completed: 0,
    };
    tracing::info!(flow_node = node.id, "'{}' runs {} instances", node.name, total);
    if total == 0 {
        return complete_parent(ctx, deployed, definition, node).await;
    }
    suspend(ctx, node, FlowNodeState::Waiting).await
}

fn collection_items(
    multi: &MultiInstanceDefinition,
    set: &WorkingSet,
) -> std::result::Result<Option<Vec<Value>>, Fault> {
    let Some(name) = &multi.collection_data else {
        return Ok(None);
    };
    match set.data(name) {
        Some(Value::List(items)) => Ok(Some(items)),
        Some(Value::Null) => Ok(Some(Vec::new())),
        Some(other) => Err(Fault::failed(format!(
            "Collection '{}' holds {}, not a list",
            name,
            other.type_name()
        ))),
        None => Err(ExpressionError::UnknownData(name.clone()).into()),
    }
}

/// Children carry the parent id and their loop counter; each gets its
/// collection item as activity data
async fn spawn_children(
    ctx: &EngineContext,
    definition: &FlowNodeDefinition,
    parent: &FlowNodeInstance,
    counters: Range<u32>,
    items: Option<&[Value]>,
    input_item: Option<&str>,
) -> Result<()> {
    let children = counters
        .clone()
        .map(|counter| {
            let mut child = FlowNodeInstance::new(
                definition.id,
                definition.name.clone(),
                activity_kind(definition),
                parent.process_instance_id,
                parent.root_process_instance_id,
                parent.process_definition_id,
            );
            child.parent_activity_instance_id = Some(parent.id);
            child.loop_counter = Some(counter);
            child
        })
        .collect();
    let ids = ctx.store.create_flow_nodes(children).await?;

    if let (Some(items), Some(input_item)) = (items, input_item) {
        let data_type = definition
            .find_data(input_item)
            .map_or(DataType::Any, |d| d.data_type.clone());
        let data = ids
            .iter()
            .zip(counters)
            .filter_map(|(id, counter)| {
                items.get(counter as usize).map(|item| {
                    DataInstance::new(
                        input_item,
                        DataContainer::Activity(*id),
                        data_type.clone(),
                        item.clone(),
                    )
                })
            })
            .collect();
        ctx.store.create_data(data).await?;
    }

    for id in ids {
        ctx.queue.push(WorkItem::Execute(id));
    }
    Ok(())
}

async fn check_multi_instance(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    mut node: FlowNodeInstance,
) -> Step {
    let FlowNodeKind::MultiInstance {
        sequential,
        total,
        started,
        ..
    } = node.kind
    else {
        return Ok(());
    };
    let Some(LoopCharacteristics::MultiInstance(multi)) = &definition.loop_characteristics else {
        return Ok(());
    };

    let open = ctx.store.list_child_flow_nodes(node.id).await?;
    if let Some(failure) = failed_child(ctx, &node).await? {
        if open.is_empty() {
            return Err(failure);
        }
        abort_all(ctx, &open).await?;
        return Ok(());
    }

    let completed = started.saturating_sub(open.len() as u32);
    let (_, set) = ctx.working_set(deployed, &node).await?;
    let done = match &multi.completion_condition {
        Some(condition) if completed > 0 => ctx.resolver.evaluate_condition(condition, &set)?,
        _ => false,
    };
    node.kind = FlowNodeKind::MultiInstance {
        sequential,
        total,
        started,
        completed,
    };

    if !open.is_empty() {
        if done {
            tracing::debug!(flow_node = node.id, "'{}' completion condition met", node.name);
            abort_all(ctx, &open).await?;
        }
        return save(ctx, node).await;
    }
    if !done && started < total {
        let items = collection_items(multi, &set)?;
        spawn_children(
            ctx,
            definition,
            &node,
            started..started + 1,
            items.as_deref(),
            multi.input_item.as_deref(),
        )
        .await?;
        node.kind = FlowNodeKind::MultiInstance {
            sequential,
            total,
            started: started + 1,
            completed,
        };
        return save(ctx, node).await;
    }
    complete_parent(ctx, deployed, definition, node).await
}

async fn start_loop(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    mut node: FlowNodeInstance,
) -> Step {
    let Some(LoopCharacteristics::StandardLoop(standard)) = &definition.loop_characteristics else {
        return Err(Fault::failed(format!(
            "'{}' is not a loop activity",
            definition.name
        )));
    };
    register_boundaries(ctx, deployed, definition, &node).await?;

    if ctx.store.list_child_flow_nodes(node.id).await?.is_empty() {
        let (_, set) = ctx.working_set(deployed, &node).await?;
        if standard.test_before && !ctx.resolver.evaluate_condition(&standard.condition, &set)? {
            return complete_parent(ctx, deployed, definition, node).await;
        }
        spawn_children(ctx, definition, &node, 0..1, None, None).await?;
    }
    node.kind = FlowNodeKind::Loop { iterations: 1 };
    suspend(ctx, node, FlowNodeState::Waiting).await
}

async fn check_loop(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    mut node: FlowNodeInstance,
) -> Step {
    let FlowNodeKind::Loop { iterations } = node.kind else {
        return Ok(());
    };
    let Some(LoopCharacteristics::StandardLoop(standard)) = &definition.loop_characteristics else {
        return Ok(());
    };
    if !ctx.store.list_child_flow_nodes(node.id).await?.is_empty() {
        return Ok(());
    }
    if let Some(failure) = failed_child(ctx, &node).await? {
        return Err(failure);
    }

    let (_, set) = ctx.working_set(deployed, &node).await?;
    let below_max = standard.max_iterations.map_or(true, |max| iterations < max);
    if below_max && ctx.resolver.evaluate_condition(&standard.condition, &set)? {
        spawn_children(ctx, definition, &node, iterations..iterations + 1, None, None).await?;
        node.kind = FlowNodeKind::Loop {
            iterations: iterations + 1,
        };
        return save(ctx, node).await;
    }
    tracing::debug!(flow_node = node.id, iterations, "'{}' loop ends", node.name);
    complete_parent(ctx, deployed, definition, node).await
}

async fn failed_child(
    ctx: &EngineContext,
    parent: &FlowNodeInstance,
) -> Result<Option<Fault>> {
    let archived = ctx
        .store
        .get_archived_flow_nodes(parent.process_instance_id)
        .await?;
    Ok(archived
        .into_iter()
        .find(|a| {
            a.node.parent_activity_instance_id == Some(parent.id)
                && a.node.state == FlowNodeState::Failed
        })
        .map(|a| Fault::Failed {
            message: format!(
                "Instance {} of '{}' failed: {}",
                a.node.loop_counter.unwrap_or_default(),
                parent.name,
                a.node.failure.unwrap_or_default()
            ),
            error_code: a.node.error_code,
        }))
}

async fn abort_all(ctx: &EngineContext, nodes: &[FlowNodeInstance]) -> Result<()> {
    for node in nodes {
        if ctx
            .store
            .request_flow_node_interruption(node.id, FlowNodeInterruption::Abort)
            .await?
        {
            ctx.queue.push(WorkItem::Execute(node.id));
        }
    }
    Ok(())
}

async fn complete_parent(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    definition: &FlowNodeDefinition,
    mut node: FlowNodeInstance,
) -> Step {
    let (_, set) = ctx.working_set(deployed, &node).await?;
    node.taken_transitions = Some(choose_transitions(ctx, deployed, definition, &node, &set)?);
    node.set_state(FlowNodeState::Completing);
    let node = ctx.store.save_flow_node(&node).await?;
    complete(ctx, deployed, node).await
}

/// Winds an interrupted node down. Parents wait for their children and
/// call activities for their called instance before reaching the final state.
async fn interrupt(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    mut node: FlowNodeInstance,
) -> Result<()> {
    let Some(request) = node.interrupt_request else {
        return Ok(());
    };
    if node.state != request.transitional_state() {
        node.set_state(request.transitional_state());
        node = ctx.store.save_flow_node(&node).await?;
        ctx.emit_state(&node);
    }

    let mut pending = false;
    match &node.kind {
        FlowNodeKind::MultiInstance { .. } | FlowNodeKind::Loop { .. } => {
            let children = ctx.store.list_child_flow_nodes(node.id).await?;
            pending = !children.is_empty();
            for child in children {
                if ctx
                    .store
                    .request_flow_node_interruption(child.id, request)
                    .await?
                {
                    ctx.queue.push(WorkItem::Execute(child.id));
                }
            }
        }
        FlowNodeKind::CallActivity {
            called_process_instance_id: Some(child),
        } => {
            if ctx.store.get_process_instance(*child).await?.is_some() {
                pending = true;
                let interruption = match request {
                    FlowNodeInterruption::Cancel => Interruption::Cancelled,
                    FlowNodeInterruption::Abort => Interruption::Aborted,
                };
                ctx.queue.push(WorkItem::Interrupt {
                    process_instance_id: *child,
                    interruption,
                });
            }
        }
        _ => {}
    }
    if pending {
        tracing::debug!(flow_node = node.id, "'{}' waits for its children", node.name);
        return Ok(());
    }

    node.set_state(request.final_state());
    let node = ctx.store.save_flow_node(&node).await?;
    tracing::info!(flow_node = node.id, "'{}' {}", node.name, node.state);
    ctx.emit_state(&node);
    finish(ctx, deployed, node, Vec::new()).await
}

/// Marks the node failed. An error boundary takes over when one matches;
/// otherwise the whole instance is interrupted.
async fn fail(
    ctx: &EngineContext,
    id: FlowNodeInstanceId,
    message: String,
    error_code: Option<String>,
) -> Result<()> {
    let Some(mut node) = ctx.store.get_flow_node(id).await? else {
        return Ok(());
    };
    if node.deleted || node.terminal {
        return Ok(());
    }
    let deployed = ctx.deployed(node.process_definition_id).await?;

    tracing::warn!(
        process_instance = node.process_instance_id,
        flow_node = id,
        "'{}' failed: {}",
        node.name,
        message
    );
    node.failure = Some(message.clone());
    node.error_code = error_code.clone();
    node.set_state(FlowNodeState::Failed);
    let node = ctx.store.save_flow_node(&node).await?;
    ctx.events.emit(EngineEvent::FlowNodeFailed {
        process_instance_id: node.process_instance_id,
        flow_node_id: id,
        error: message,
        timestamp: Utc::now(),
    });
    ctx.emit_state(&node);

    if node.parent_activity_instance_id.is_some() {
        return finish(ctx, &deployed, node, Vec::new()).await;
    }
    match error_handler(&deployed.definition, node.definition_id, error_code.as_deref()) {
        Some(handler) => {
            let mut boundary = spawn(
                handler,
                node.process_instance_id,
                node.root_process_instance_id,
                node.process_definition_id,
            );
            boundary.kind = FlowNodeKind::BoundaryEvent {
                attached_to: node.id,
                interrupting: true,
            };
            boundary.triggered = true;
            tracing::info!(flow_node = id, "failure caught by '{}'", handler.name);
            finish(ctx, &deployed, node, vec![Successor::Node(boundary)]).await
        }
        None => {
            lifecycle::interrupt_process(
                ctx,
                node.process_instance_id,
                Interruption::Failed { error_code },
            )
            .await?;
            finish(ctx, &deployed, node, Vec::new()).await
        }
    }
}

/// Error boundary of `activity` for `code`; a catch-all boundary applies
/// when no boundary names the code
fn error_handler<'a>(
    definition: &'a ProcessDefinition,
    activity: ElementId,
    code: Option<&str>,
) -> Option<&'a FlowNodeDefinition> {
    fn catches(boundary: &FlowNodeDefinition) -> Option<Option<&str>> {
        match &boundary.kind {
            FlowNodeDefinitionKind::BoundaryEvent {
                trigger: EventTrigger::Error { code },
                ..
            } => Some(code.as_deref()),
            _ => None,
        }
    }

    code.and_then(|code| {
        definition
            .boundary_events_of(activity)
            .find(|b| catches(b) == Some(Some(code)))
    })
    .or_else(|| {
        definition
            .boundary_events_of(activity)
            .find(|b| catches(b) == Some(None))
    })
}

/// Fresh instance of `definition` in `instance`
pub(crate) fn new_instance(
    definition: &FlowNodeDefinition,
    instance: &ProcessInstance,
) -> FlowNodeInstance {
    spawn(
        definition,
        instance.id,
        instance.root_process_instance_id,
        instance.definition_id,
    )
}

fn spawn(
    definition: &FlowNodeDefinition,
    process_instance_id: ProcessInstanceId,
    root_process_instance_id: ProcessInstanceId,
    process_definition_id: bpmncore::DefinitionId,
) -> FlowNodeInstance {
    let kind = match &definition.loop_characteristics {
        Some(LoopCharacteristics::MultiInstance(multi)) => FlowNodeKind::MultiInstance {
            sequential: multi.sequential,
            total: 0,
            started: 0,
            completed: 0,
        },
        Some(LoopCharacteristics::StandardLoop(_)) => FlowNodeKind::Loop { iterations: 0 },
        None => activity_kind(definition),
    };
    FlowNodeInstance::new(
        definition.id,
        definition.name.clone(),
        kind,
        process_instance_id,
        root_process_instance_id,
        process_definition_id,
    )
}

fn activity_kind(definition: &FlowNodeDefinition) -> FlowNodeKind {
    match &definition.kind {
        FlowNodeDefinitionKind::AutomaticTask => FlowNodeKind::AutomaticTask,
        FlowNodeDefinitionKind::UserTask(task) => FlowNodeKind::UserTask(HumanTask {
            actor: task.actor.clone(),
            assignee_id: None,
            claimed_date: None,
            priority: task.priority,
            expected_end_date: None,
        }),
        FlowNodeDefinitionKind::CallActivity(_) => FlowNodeKind::CallActivity {
            called_process_instance_id: None,
        },
        FlowNodeDefinitionKind::Gateway(gateway_type) => FlowNodeKind::Gateway {
            gateway_type: *gateway_type,
            hit_by: Vec::new(),
        },
        FlowNodeDefinitionKind::StartEvent(_) => FlowNodeKind::StartEvent,
        FlowNodeDefinitionKind::IntermediateCatchEvent(_) => FlowNodeKind::IntermediateCatchEvent,
        FlowNodeDefinitionKind::IntermediateThrowEvent(_) => FlowNodeKind::IntermediateThrowEvent,
        FlowNodeDefinitionKind::BoundaryEvent { interrupting, .. } => FlowNodeKind::BoundaryEvent {
            attached_to: 0,
            interrupting: *interrupting,
        },
        FlowNodeDefinitionKind::EndEvent(_) => FlowNodeKind::EndEvent,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmncore::{DataDefinition, MultiInstanceDefinition, StandardLoopDefinition, UserTaskDefinition};

    fn started() -> ProcessInstance {
        let mut instance = ProcessInstance::new("p", "1.0", uuid::Uuid::nil(), 1);
        instance.id = 12;
        instance.root_process_instance_id = 12;
        instance
    }

    #[test]
    fn test_new_instance_carries_the_kind() {
        let task = FlowNodeDefinition::new(
            "review",
            FlowNodeDefinitionKind::UserTask(UserTaskDefinition::new("reviewer")),
        );
        let node = new_instance(&task, &started());
        assert_eq!(node.definition_id, task.id);
        assert_eq!(node.process_instance_id, 12);
        assert_eq!(node.process_definition_id, uuid::Uuid::nil());
        assert_eq!(node.state, FlowNodeState::Initializing);
        assert!(matches!(&node.kind, FlowNodeKind::UserTask(h) if h.actor == "reviewer"));
    }

    #[test]
    fn test_loop_characteristics_make_a_parent() {
        let multi = FlowNodeDefinition::automatic_task("each").with_loop(
            LoopCharacteristics::MultiInstance(MultiInstanceDefinition {
                sequential: true,
                cardinality: None,
                collection_data: Some("items".to_string()),
                input_item: None,
                completion_condition: None,
            }),
        );
        assert!(matches!(
            new_instance(&multi, &started()).kind,
            FlowNodeKind::MultiInstance { sequential: true, total: 0, .. }
        ));

        let looped = FlowNodeDefinition::automatic_task("again").with_loop(
            LoopCharacteristics::StandardLoop(StandardLoopDefinition {
                condition: bpmncore::Expression::constant("false", DataType::Boolean),
                test_before: false,
                max_iterations: Some(3),
            }),
        );
        assert_eq!(
            new_instance(&looped, &started()).kind,
            FlowNodeKind::Loop { iterations: 0 }
        );
    }

    #[test]
    fn test_pending_work() {
        let mut node = new_instance(&FlowNodeDefinition::automatic_task("t"), &started());
        node.set_state(FlowNodeState::Waiting);
        assert!(!has_pending_work(&node));

        node.triggered = true;
        assert!(has_pending_work(&node));

        node.interrupt_request = Some(FlowNodeInterruption::Abort);
        assert!(has_pending_work(&node));
        node.set_state(FlowNodeState::Aborting);
        assert!(!has_pending_work(&node));

        node.deleted = true;
        assert!(!has_pending_work(&node));
    }

    #[test]
    fn test_error_handler_prefers_the_matching_code() {
        let mut definition = ProcessDefinition::new("p", "1.0");
        let task = definition.add_node(FlowNodeDefinition::automatic_task("t"));
        let any = definition.add_node(FlowNodeDefinition::boundary_event(
            "any",
            task,
            EventTrigger::error(None),
            true,
        ));
        let specific = definition.add_node(FlowNodeDefinition::boundary_event(
            "specific",
            task,
            EventTrigger::error(Some("E1")),
            true,
        ));
        definition.add_node(
            FlowNodeDefinition::automatic_task("other")
                .with_data(DataDefinition::new("x", DataType::Long)),
        );

        assert_eq!(error_handler(&definition, task, Some("E1")).map(|b| b.id), Some(specific));
        assert_eq!(error_handler(&definition, task, Some("E2")).map(|b| b.id), Some(any));
        assert_eq!(error_handler(&definition, task, None).map(|b| b.id), Some(any));
    }
}
