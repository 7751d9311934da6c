use crate::context::{DeployedProcess, EngineContext};
use crate::contract;
use crate::scheduler::WorkItem;
use crate::state_machine;
use crate::store::{FlowNodeTrigger, ProcessActivation};
use crate::working_set::WorkingSet;
use bpmncore::{
    DataContainer, DefinitionId, ElementId, EngineError, EngineEvent, FlowNodeInstanceId,
    Interruption, NotFound, Operation, OperationError, ProcessInstance, ProcessInstanceId,
    ProcessInstanceState, Result, UserId, ValidationError, Value,
};
use chrono::Utc;
use std::collections::BTreeMap;

/// What caused an instance to start
#[derive(Debug, Clone)]
pub enum StartCause {
    /// Started through the API; inputs are checked against the contract
    Api,
    /// Started by a call activity; `data` overrides the data defaults
    CallActivity {
        caller_id: FlowNodeInstanceId,
        root_process_instance_id: ProcessInstanceId,
        data: BTreeMap<String, Value>,
    },
    /// A message, signal or timer start event fired; inputs are its payload
    StartEvent(ElementId),
}

/// Creates the instance, evaluates its initial state and queues its first
/// flow nodes. An instance whose initial state cannot be built is removed.
pub async fn start_process(
    ctx: &EngineContext,
    definition_id: DefinitionId,
    started_by: UserId,
    inputs: BTreeMap<String, Value>,
    cause: StartCause,
) -> Result<ProcessInstance> {
    let deployed = ctx.deployed(definition_id).await?;
    let definition = &deployed.definition;
    if !ctx.store.is_definition_enabled(definition_id).await? {
        return Err(EngineError::validation(format!(
            "Process '{}' version {} is not enabled",
            definition.name, definition.version
        )));
    }

    let mut instance =
        ProcessInstance::new(&definition.name, &definition.version, definition.id, started_by);
    if let StartCause::CallActivity {
        caller_id,
        root_process_instance_id,
        ..
    } = &cause
    {
        instance.caller_id = Some(*caller_id);
        instance.root_process_instance_id = *root_process_instance_id;
    }
    if matches!(cause, StartCause::Api) {
        contract::validate_inputs(
            &ctx.resolver,
            &definition.contract,
            &inputs,
            &ctx.constants(&instance, None),
        )?;
    }

    let instance = ctx.store.create_process_instance(instance).await?;
    let activation = match initial_state(ctx, &deployed, &instance, inputs, cause) {
        Ok(activation) => activation,
        Err(e) => {
            ctx.store.delete_process_instance(instance.id).await?;
            return Err(e);
        }
    };
    let nodes = match ctx.store.activate_process_instance(activation).await {
        Ok(nodes) => nodes,
        Err(e) => {
            ctx.store.delete_process_instance(instance.id).await?;
            return Err(e);
        }
    };
    for id in nodes {
        ctx.queue.push(WorkItem::Execute(id));
    }

    tracing::info!(
        process_instance = instance.id,
        "started '{}' {}",
        definition.name,
        definition.version
    );
    ctx.events.emit(EngineEvent::ProcessStarted {
        process_instance_id: instance.id,
        definition_id: definition.id,
        name: definition.name.clone(),
        timestamp: Utc::now(),
    });

    ctx.store
        .get_process_instance(instance.id)
        .await?
        .ok_or_else(|| NotFound::ProcessInstance(instance.id).into())
}

/// Data defaults in declared order, each seeing the ones before it, then
/// documents and string indexes
fn initial_state(
    ctx: &EngineContext,
    deployed: &DeployedProcess,
    instance: &ProcessInstance,
    inputs: BTreeMap<String, Value>,
    cause: StartCause,
) -> Result<ProcessActivation> {
    let definition = &deployed.definition;
    let constants = ctx.constants(instance, None);
    let trigger_inputs = inputs.clone();
    let mut set = WorkingSet::for_new_instance(definition, instance.id, constants, inputs);
    let invalid = |what: String, e: OperationError| {
        EngineError::Validation(ValidationError::single(format!("{}: {}", what, e)))
    };

    let mut overrides = match &cause {
        StartCause::CallActivity { data, .. } => data.clone(),
        _ => BTreeMap::new(),
    };
    for data in &definition.data {
        match overrides.remove(&data.name) {
            Some(value) => {
                if !data.data_type.accepts(&value) {
                    return Err(invalid(
                        format!("Data '{}'", data.name),
                        OperationError::TypeMismatch {
                            name: data.name.clone(),
                            expected: data.data_type.to_string(),
                            actual: value.type_name().to_string(),
                        },
                    ));
                }
                set.set_data(&data.name, value);
            }
            None => {
                if let Some(default) = &data.default_value {
                    ctx.operations
                        .apply(&Operation::assign_data(&data.name, default.clone()), &mut set)
                        .map_err(|e| invalid(format!("Default value of data '{}'", data.name), e))?;
                }
            }
        }
    }
    if let Some(name) = overrides.keys().next() {
        return Err(EngineError::validation(format!(
            "Called process '{}' has no data named '{}'",
            definition.name, name
        )));
    }

    for document in &definition.documents {
        let Some(initial) = &document.initial_value else {
            continue;
        };
        let operation = if document.multiple {
            Operation::set_document_list(&document.name, initial.clone())
        } else {
            Operation::set_document(&document.name, initial.clone())
        };
        ctx.operations
            .apply(&operation, &mut set)
            .map_err(|e| invalid(format!("Initial value of document '{}'", document.name), e))?;
    }

    for (position, slot) in definition.string_indexes.iter().enumerate() {
        let Some(expression) = slot.as_ref().and_then(|s| s.value.as_ref()) else {
            continue;
        };
        ctx.operations
            .apply(
                &Operation::set_string_index(position + 1, expression.clone()),
                &mut set,
            )
            .map_err(|e| invalid(format!("String index {}", position + 1), e))?;
    }

    let seeds = match cause {
        StartCause::StartEvent(start_event) => {
            let node = definition.find_node(start_event).ok_or_else(|| {
                EngineError::validation(format!(
                    "Process '{}' has no start event {}",
                    definition.name, start_event
                ))
            })?;
            let mut seed = state_machine::new_instance(node, instance);
            seed.triggered = true;
            seed.trigger_inputs = trigger_inputs;
            vec![seed]
        }
        _ => definition
            .initial_nodes()
            .into_iter()
            .map(|node| state_machine::new_instance(node, instance))
            .collect(),
    };
    Ok(set.into_activation(seeds))
}

/// Archives the instance once no flow node is open and hands its final data
/// to the calling activity, if any
pub async fn check_completion(ctx: &EngineContext, id: ProcessInstanceId) -> Result<()> {
    let Some(instance) = ctx.store.get_process_instance(id).await? else {
        return Ok(());
    };
    if instance.state != ProcessInstanceState::Started
        || ctx.store.count_open_flow_nodes(id).await? > 0
    {
        return Ok(());
    }

    let state = instance
        .interruption
        .as_ref()
        .map_or(ProcessInstanceState::Completed, Interruption::final_state);
    let Some(archived) = ctx.store.finish_process_instance(id, state).await? else {
        return Ok(());
    };

    tracing::info!(process_instance = id, "'{}' finished {}", archived.name, state);
    ctx.events.emit(EngineEvent::ProcessFinished {
        process_instance_id: id,
        state,
        timestamp: Utc::now(),
    });

    if let Some(caller) = archived.caller_id {
        let outputs = ctx
            .store
            .list_archived_data(DataContainer::Process(id))
            .await?
            .into_iter()
            .map(|data| (data.name, data.value))
            .collect();
        let trigger = FlowNodeTrigger {
            inputs: outputs,
            executed_by: None,
            error_code: archived.error_code.clone(),
        };
        match ctx.store.trigger_flow_node(caller, trigger).await {
            Ok(_) => ctx.queue.push(WorkItem::Execute(caller)),
            Err(e) if e.is_not_found() => {
                tracing::warn!(process_instance = id, "calling activity {} is gone", caller)
            }
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// Records the interruption and asks every open flow node to wind down.
/// Returns `false` when the instance is gone or already interrupted.
pub async fn interrupt_process(
    ctx: &EngineContext,
    id: ProcessInstanceId,
    interruption: Interruption,
) -> Result<bool> {
    if ctx.store.get_process_instance(id).await?.is_none() {
        return Ok(false);
    }
    if !ctx
        .store
        .set_process_interruption(id, interruption.clone())
        .await?
    {
        return Ok(false);
    }

    tracing::info!(process_instance = id, "interrupting: {:?}", interruption);
    let request = interruption.flow_node_interruption();
    for node in ctx.store.list_flow_nodes(id).await? {
        if ctx
            .store
            .request_flow_node_interruption(node.id, request)
            .await?
        {
            ctx.queue.push(WorkItem::Execute(node.id));
        }
    }
    ctx.queue.push(WorkItem::CheckCompletion(id));
    Ok(true)
}

pub async fn cancel(ctx: &EngineContext, id: ProcessInstanceId) -> Result<()> {
    let instance = ctx
        .store
        .get_process_instance(id)
        .await?
        .ok_or(NotFound::ProcessInstance(id))?;
    if instance.state != ProcessInstanceState::Started {
        return Err(EngineError::validation(format!(
            "Process instance {} is {} and cannot be cancelled",
            id, instance.state
        )));
    }
    if !interrupt_process(ctx, id, Interruption::Cancelled).await? {
        tracing::debug!(process_instance = id, "already being interrupted");
    }
    Ok(())
}
