use crate::config::EngineConfig;
use crate::context::EngineContext;
use crate::contract;
use crate::correlation;
use crate::deployment::validate_definition;
use crate::lifecycle::{self, StartCause};
use crate::recovery::{self, RecoveryReport};
use crate::resolver::ExpressionResolver;
use crate::scheduler::{self, EngineHandle, WorkItem};
use crate::search::{paginate, FlowNodeFilter, SearchOptions, SearchResult};
use crate::state_machine;
use crate::store::{FlowNodeTrigger, MemoryStore, ProcessStore};
use crate::working_set::WorkingSet;
use bpmncore::{
    ArchivedDataInstance, ArchivedFlowNodeInstance, ArchivedProcessInstance, DataContainer,
    DataInstance, DefinitionId, Document, DocumentSlot, EngineError, EngineEvent,
    EvaluatorRegistry, FlowNodeDefinitionKind, FlowNodeInstance, FlowNodeInstanceId,
    FlowNodeState, FlowNodeType, MessageInstance, MessageInstanceId, NotFound, ProcessDefinition,
    ProcessInstance, ProcessInstanceId, Result, UserId, Value, STRING_INDEX_SLOTS,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::ops::Range;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Public entry point of the engine.
///
/// Nothing is accepted until [`ProcessEngine::after_services_start`] has run
/// the restart recovery.
pub struct ProcessEngine {
    ctx: Arc<EngineContext>,
    ready: AtomicBool,
}

impl ProcessEngine {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ProcessStore>,
        registry: Arc<EvaluatorRegistry>,
    ) -> Self {
        let resolver = Arc::new(ExpressionResolver::new(registry));
        Self {
            ctx: Arc::new(EngineContext::new(config, store, resolver)),
            ready: AtomicBool::new(false),
        }
    }

    /// Engine backed by a fresh [`MemoryStore`]
    pub fn in_memory(config: EngineConfig, registry: Arc<EvaluatorRegistry>) -> Self {
        Self::new(config, Arc::new(MemoryStore::new()), registry)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.ctx.config
    }

    pub fn store(&self) -> &Arc<dyn ProcessStore> {
        &self.ctx.store
    }

    /// Runs restart recovery, then opens the engine. Called once per startup.
    pub async fn after_services_start(&self) -> Result<RecoveryReport> {
        if self.ready.load(Ordering::SeqCst) {
            return Err(EngineError::validation("Engine services are already started"));
        }
        let report = recovery::recover(&self.ctx).await?;
        self.ready.store(true, Ordering::SeqCst);
        tracing::info!(tenant = self.ctx.config.tenant_id, "engine ready");
        Ok(report)
    }

    fn ensure_ready(&self) -> Result<()> {
        if self.ready.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(EngineError::NotReady)
        }
    }

    // ── Definitions ──

    /// Validates and stores a definition; it starts disabled
    pub async fn deploy(&self, definition: ProcessDefinition) -> Result<DefinitionId> {
        self.ensure_ready()?;
        let graph = validate_definition(&definition, &self.ctx.resolver)?;
        if self
            .ctx
            .store
            .find_definition(&definition.name, Some(&definition.version))
            .await?
            .is_some()
        {
            return Err(EngineError::validation(format!(
                "Process '{}' version {} is already deployed",
                definition.name, definition.version
            )));
        }

        self.ctx.store.save_definition(&definition).await?;
        let id = definition.id;
        tracing::info!(definition = %id, "deployed '{}' {}", definition.name, definition.version);
        self.ctx.remember(definition, graph);
        Ok(id)
    }

    /// Allows instances to start and arms the message, signal and timer start events
    pub async fn enable_process(&self, id: DefinitionId) -> Result<()> {
        self.ensure_ready()?;
        let deployed = self.ctx.deployed(id).await?;
        if self.ctx.store.is_definition_enabled(id).await? {
            return Ok(());
        }
        let definition = &deployed.definition;

        let system = ProcessInstance::new(
            &definition.name,
            &definition.version,
            id,
            self.ctx.config.system_user_id,
        );
        let set = WorkingSet::for_new_instance(
            definition,
            0,
            self.ctx.constants(&system, None),
            BTreeMap::new(),
        );
        let mut events = Vec::new();
        for node in &definition.flow_nodes {
            let FlowNodeDefinitionKind::StartEvent(Some(trigger)) = &node.kind else {
                continue;
            };
            let target = bpmncore::EventTarget::ProcessStart {
                definition_id: id,
                start_event: node.id,
            };
            let event = correlation::waiting_event(
                &self.ctx.resolver,
                trigger,
                &definition.name,
                &node.name,
                target,
                &set,
            )
            .map_err(|e| EngineError::validation(format!("Start event '{}': {}", node.name, e)))?;
            events.extend(event);
        }

        for event in events {
            self.ctx.store.add_waiting_event(event).await?;
        }
        self.ctx.store.set_definition_enabled(id, true).await?;
        tracing::info!(definition = %id, "enabled '{}'", definition.name);
        Ok(())
    }

    pub async fn disable_process(&self, id: DefinitionId) -> Result<()> {
        self.ensure_ready()?;
        self.ctx.deployed(id).await?;
        self.ctx.store.set_definition_enabled(id, false).await?;
        let removed = self.ctx.store.delete_start_events_for_definition(id).await?;
        tracing::info!(definition = %id, start_events = removed, "disabled");
        Ok(())
    }

    /// Disables the definition and removes it with every instance of it
    pub async fn disable_and_delete_process(&self, id: DefinitionId) -> Result<()> {
        self.disable_process(id).await?;
        self.ctx.store.delete_definition(id).await?;
        self.ctx.forget(id);
        tracing::info!(definition = %id, "deleted");
        Ok(())
    }

    pub async fn get_process_definition(&self, id: DefinitionId) -> Result<ProcessDefinition> {
        self.ensure_ready()?;
        Ok(self.ctx.deployed(id).await?.definition.clone())
    }

    pub async fn list_string_index_labels(
        &self,
        id: DefinitionId,
    ) -> Result<[Option<String>; STRING_INDEX_SLOTS]> {
        self.ensure_ready()?;
        Ok(self.ctx.deployed(id).await?.definition.string_index_labels())
    }

    // ── Process instances ──

    /// Starts an instance as the system user with no contract inputs
    pub async fn start(&self, definition_id: DefinitionId) -> Result<ProcessInstanceId> {
        self.start_process(definition_id, self.ctx.config.system_user_id, BTreeMap::new())
            .await
    }

    pub async fn start_process(
        &self,
        definition_id: DefinitionId,
        started_by: UserId,
        inputs: BTreeMap<String, Value>,
    ) -> Result<ProcessInstanceId> {
        self.ensure_ready()?;
        let instance =
            lifecycle::start_process(&self.ctx, definition_id, started_by, inputs, StartCause::Api)
                .await?;
        Ok(instance.id)
    }

    pub async fn get_process_instance(&self, id: ProcessInstanceId) -> Result<ProcessInstance> {
        self.ensure_ready()?;
        self.ctx
            .store
            .get_process_instance(id)
            .await?
            .ok_or_else(|| NotFound::ProcessInstance(id).into())
    }

    pub async fn get_archived_process_instance(
        &self,
        id: ProcessInstanceId,
    ) -> Result<ArchivedProcessInstance> {
        self.ensure_ready()?;
        self.ctx
            .store
            .get_archived_process_instance(id)
            .await?
            .ok_or_else(|| NotFound::ArchivedProcessInstance(id).into())
    }

    pub async fn cancel_process_instance(&self, id: ProcessInstanceId) -> Result<()> {
        self.ensure_ready()?;
        lifecycle::cancel(&self.ctx, id).await
    }

    /// Computed from the live nodes on every call
    pub async fn open_flow_node_count(&self, id: ProcessInstanceId) -> Result<usize> {
        self.ensure_ready()?;
        self.ctx.store.count_open_flow_nodes(id).await
    }

    /// Failed nodes, archived or still live
    pub async fn failed_flow_node_count(&self, id: ProcessInstanceId) -> Result<usize> {
        self.ensure_ready()?;
        let archived = self
            .ctx
            .store
            .get_archived_flow_nodes(id)
            .await?
            .iter()
            .filter(|a| a.node.state == FlowNodeState::Failed)
            .count();
        let live = self
            .ctx
            .store
            .list_flow_nodes(id)
            .await?
            .iter()
            .filter(|n| n.state == FlowNodeState::Failed)
            .count();
        Ok(archived + live)
    }

    // ── Flow nodes ──

    pub async fn get_flow_node_instance(&self, id: FlowNodeInstanceId) -> Result<FlowNodeInstance> {
        self.ensure_ready()?;
        match self.ctx.store.get_flow_node(id).await? {
            Some(node) if !node.deleted => Ok(node),
            _ => Err(NotFound::FlowNode(id).into()),
        }
    }

    pub async fn search_flow_nodes(
        &self,
        options: &SearchOptions,
    ) -> Result<SearchResult<FlowNodeInstance>> {
        self.ensure_ready()?;
        let nodes = self.ctx.store.search_flow_nodes(&options.filter).await?;
        Ok(paginate(nodes, options))
    }

    /// Drains the queue, then returns the ready user task of that name
    pub async fn wait_for_user_task(
        &self,
        process_instance_id: ProcessInstanceId,
        name: &str,
    ) -> Result<FlowNodeInstanceId> {
        self.run_until_idle().await?;
        let filter = FlowNodeFilter::user_tasks()
            .named(name)
            .in_state(FlowNodeState::Ready)
            .in_process(process_instance_id);
        let found = self.search_flow_nodes(&SearchOptions::new(filter).page(0, 1)).await?;
        found
            .items
            .first()
            .map(|task| task.id)
            .ok_or_else(|| {
                NotFound::UserTask {
                    name: name.to_string(),
                    process_instance_id,
                }
                .into()
            })
    }

    async fn user_task(&self, id: FlowNodeInstanceId) -> Result<FlowNodeInstance> {
        let node = self.get_flow_node_instance(id).await?;
        if node.node_type() != FlowNodeType::UserTask {
            return Err(EngineError::validation(format!(
                "Flow node {} is a {}, not a user task",
                id,
                node.node_type()
            )));
        }
        Ok(node)
    }

    /// `None` releases the task
    pub async fn assign_user_task(
        &self,
        id: FlowNodeInstanceId,
        user_id: Option<UserId>,
    ) -> Result<()> {
        self.ensure_ready()?;
        let task = self.user_task(id).await?;
        if self.ctx.store.assign_user_task(id, user_id).await?.is_none() {
            let current = self.user_task(id).await?;
            if current.state != FlowNodeState::Ready
                || current.triggered
                || current.interrupt_request.is_some()
            {
                return Err(EngineError::validation(format!(
                    "Task {} is {} and cannot be assigned",
                    id, current.state
                )));
            }
            return Err(EngineError::Conflict(format!(
                "task {} is being executed",
                id
            )));
        }
        tracing::info!(flow_node = id, assignee = ?user_id, "task '{}' assigned", task.name);
        Ok(())
    }

    /// Checks the inputs against the task contract and hands the task to a worker
    pub async fn execute_user_task(
        &self,
        id: FlowNodeInstanceId,
        user_id: UserId,
        inputs: BTreeMap<String, Value>,
    ) -> Result<()> {
        self.ensure_ready()?;
        let mut task = self.user_task(id).await?;
        if task.state != FlowNodeState::Ready || task.interrupt_request.is_some() {
            return Err(EngineError::validation(format!(
                "Task {} is {} and cannot be executed",
                id, task.state
            )));
        }
        let assignee = task.as_assignable().and_then(|t| t.assignee_id());
        if assignee.is_some_and(|assignee| assignee != user_id) {
            return Err(EngineError::validation(format!(
                "Task {} is assigned to another user",
                id
            )));
        }

        let deployed = self.ctx.deployed(task.process_definition_id).await?;
        if let Some(FlowNodeDefinitionKind::UserTask(definition)) = deployed
            .definition
            .find_node(task.definition_id)
            .map(|d| &d.kind)
        {
            let instance = self.get_process_instance(task.process_instance_id).await?;
            task.executed_by = Some(user_id);
            contract::validate_inputs(
                &self.ctx.resolver,
                &definition.contract,
                &inputs,
                &self.ctx.constants(&instance, Some(&task)),
            )?;
        }

        let trigger = FlowNodeTrigger {
            inputs,
            executed_by: Some(user_id),
            error_code: None,
        };
        if !self.ctx.store.trigger_flow_node(id, trigger).await? {
            return Err(EngineError::validation(format!(
                "Task {} was already executed",
                id
            )));
        }
        tracing::info!(flow_node = id, user = user_id, "task '{}' executed", task.name);
        self.ctx.queue.push(WorkItem::Execute(id));
        Ok(())
    }

    pub async fn skip_flow_node(&self, id: FlowNodeInstanceId) -> Result<()> {
        self.ensure_ready()?;
        state_machine::skip(&self.ctx, id).await
    }

    pub async fn get_archived_flow_node_instances(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedFlowNodeInstance>> {
        self.ensure_ready()?;
        self.ctx.store.get_archived_flow_nodes(process_instance_id).await
    }

    // ── Events ──

    /// Stores the message; it waits until a matching event exists
    pub async fn send_message(&self, message: MessageInstance) -> Result<MessageInstanceId> {
        self.ensure_ready()?;
        let name = message.name.clone();
        let id = self.ctx.store.add_message(message).await?;
        tracing::debug!(message = id, "message '{}' sent", name);
        self.ctx.queue.push(WorkItem::MatchMessages);
        Ok(id)
    }

    /// Returns how many waiting events received the signal
    pub async fn send_signal(
        &self,
        name: &str,
        payload: BTreeMap<String, Value>,
    ) -> Result<usize> {
        self.ensure_ready()?;
        correlation::send_signal(&self.ctx, name, payload).await
    }

    /// Fires every timer due at `now`
    pub async fn sweep_timers(&self, now: DateTime<Utc>) -> Result<usize> {
        self.ensure_ready()?;
        correlation::sweep_timers(&self.ctx, now).await
    }

    // ── Data ──

    pub async fn get_process_data_instance(
        &self,
        name: &str,
        process_instance_id: ProcessInstanceId,
    ) -> Result<DataInstance> {
        self.ensure_ready()?;
        self.data(DataContainer::Process(process_instance_id), name).await
    }

    pub async fn get_activity_data_instance(
        &self,
        name: &str,
        flow_node_id: FlowNodeInstanceId,
    ) -> Result<DataInstance> {
        self.ensure_ready()?;
        self.data(DataContainer::Activity(flow_node_id), name).await
    }

    pub async fn update_process_data_instance(
        &self,
        name: &str,
        process_instance_id: ProcessInstanceId,
        value: Value,
    ) -> Result<()> {
        self.ensure_ready()?;
        self.update_data(DataContainer::Process(process_instance_id), name, value)
            .await
    }

    pub async fn update_activity_data_instance(
        &self,
        name: &str,
        flow_node_id: FlowNodeInstanceId,
        value: Value,
    ) -> Result<()> {
        self.ensure_ready()?;
        self.update_data(DataContainer::Activity(flow_node_id), name, value)
            .await
    }

    async fn data(&self, container: DataContainer, name: &str) -> Result<DataInstance> {
        self.ctx
            .store
            .get_data(container, name)
            .await?
            .ok_or_else(|| missing_data(container, name))
    }

    async fn update_data(&self, container: DataContainer, name: &str, value: Value) -> Result<()> {
        let data = self.data(container, name).await?;
        if !data.data_type.accepts(&value) {
            return Err(EngineError::validation(format!(
                "Data '{}' is {}, cannot hold {}",
                name,
                data.data_type,
                value.type_name()
            )));
        }
        self.ctx.store.update_data_value(container, name, value).await?;
        tracing::debug!(%container, "data '{}' updated", name);
        Ok(())
    }

    pub async fn get_archived_process_data_instance(
        &self,
        name: &str,
        process_instance_id: ProcessInstanceId,
    ) -> Result<ArchivedDataInstance> {
        self.ensure_ready()?;
        let container = DataContainer::Process(process_instance_id);
        self.ctx
            .store
            .get_archived_data(container, name)
            .await?
            .ok_or_else(|| missing_data(container, name))
    }

    pub async fn get_archived_process_data_instances(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedDataInstance>> {
        self.ensure_ready()?;
        self.ctx
            .store
            .list_archived_data(DataContainer::Process(process_instance_id))
            .await
    }

    pub async fn get_archived_activity_data_instance(
        &self,
        name: &str,
        flow_node_id: FlowNodeInstanceId,
    ) -> Result<ArchivedDataInstance> {
        self.ensure_ready()?;
        let container = DataContainer::Activity(flow_node_id);
        self.ctx
            .store
            .get_archived_data(container, name)
            .await?
            .ok_or_else(|| missing_data(container, name))
    }

    /// Value written by an operation on external data, if any
    pub async fn get_external_data(
        &self,
        process_instance_id: ProcessInstanceId,
        name: &str,
    ) -> Result<Option<Value>> {
        self.ensure_ready()?;
        self.ctx.store.get_external_data(process_instance_id, name).await
    }

    // ── Documents ──

    pub async fn get_document(
        &self,
        process_instance_id: ProcessInstanceId,
        name: &str,
    ) -> Result<Document> {
        self.ensure_ready()?;
        match self.document_slot(process_instance_id, name).await? {
            DocumentSlot::Single(document) => Ok(document),
            DocumentSlot::List(_) => Err(EngineError::validation(format!(
                "'{}' is a document list",
                name
            ))),
        }
    }

    /// Entries of a document list whose index falls in `range`
    pub async fn list_documents(
        &self,
        process_instance_id: ProcessInstanceId,
        name: &str,
        range: Range<usize>,
    ) -> Result<Vec<Document>> {
        self.ensure_ready()?;
        let slot = self.document_slot(process_instance_id, name).await?;
        Ok(slot
            .documents()
            .iter()
            .enumerate()
            .filter(|(position, document)| range.contains(&document.index.unwrap_or(*position)))
            .map(|(_, document)| document.clone())
            .collect())
    }

    async fn document_slot(
        &self,
        process_instance_id: ProcessInstanceId,
        name: &str,
    ) -> Result<DocumentSlot> {
        self.ctx
            .store
            .get_document(process_instance_id, name)
            .await?
            .ok_or_else(|| {
                NotFound::Document {
                    name: name.to_string(),
                    process_instance_id,
                }
                .into()
            })
    }

    // ── Scheduling ──

    /// Processes queued work until none is left. Returns the number of items.
    pub async fn run_until_idle(&self) -> Result<usize> {
        self.ensure_ready()?;
        Ok(scheduler::run_until_idle(&self.ctx).await)
    }

    /// Background workers plus the timer sweep
    pub fn start_workers(&self) -> Result<EngineHandle> {
        self.ensure_ready()?;
        Ok(scheduler::start_workers(self.ctx.clone()))
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<EngineEvent> {
        self.ctx.events.subscribe()
    }
}

fn missing_data(container: DataContainer, name: &str) -> EngineError {
    NotFound::Data {
        name: name.to_string(),
        container: container.to_string(),
    }
    .into()
}
