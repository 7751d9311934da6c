use super::{
    DataUpdate, DocumentUpdate, ExecutionClaim, FlowNodeTrigger, MutationBatch, ProcessActivation,
    ProcessStore, Successor,
};
use crate::search::FlowNodeFilter;
use async_trait::async_trait;
use bpmncore::{
    ArchivedDataInstance, ArchivedFlowNodeInstance, ArchivedProcessInstance, DataContainer,
    DataInstance, DefinitionId, DocumentSlot, EngineError, EventTarget, FlowNodeInstance,
    FlowNodeInstanceId, FlowNodeInterruption, FlowNodeKind, FlowNodeState, Interruption,
    MessageInstance, MessageInstanceId, NotFound, ProcessDefinition, ProcessInstance,
    ProcessInstanceId, ProcessInstanceState, Result, UserId, Value, WaitingEvent, WaitingEventId,
    WaitingEventType,
};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap, HashSet};

struct StoredDefinition {
    definition: ProcessDefinition,
    enabled: bool,
    deployed_seq: u64,
}

#[derive(Default)]
struct Tables {
    sequence: u64,
    definitions: HashMap<DefinitionId, StoredDefinition>,
    process_instances: BTreeMap<ProcessInstanceId, ProcessInstance>,
    archived_process_instances: BTreeMap<ProcessInstanceId, ArchivedProcessInstance>,
    flow_nodes: BTreeMap<FlowNodeInstanceId, FlowNodeInstance>,
    archived_flow_nodes: Vec<ArchivedFlowNodeInstance>,
    data: BTreeMap<(DataContainer, String), DataInstance>,
    archived_data: Vec<ArchivedDataInstance>,
    documents: BTreeMap<(ProcessInstanceId, String), DocumentSlot>,
    external_data: BTreeMap<(ProcessInstanceId, String), Value>,
    waiting_events: BTreeMap<WaitingEventId, WaitingEvent>,
    messages: BTreeMap<MessageInstanceId, MessageInstance>,
}

impl Tables {
    fn next_id(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Keeps ids chosen by the caller so fixtures can be seeded as-is
    fn insert_flow_node(&mut self, mut node: FlowNodeInstance) -> FlowNodeInstanceId {
        if node.id == 0 {
            node.id = self.next_id();
        } else {
            self.sequence = self.sequence.max(node.id);
        }
        let id = node.id;
        self.flow_nodes.insert(id, node);
        id
    }

    fn insert_data(&mut self, mut data: DataInstance) {
        if data.id == 0 {
            data.id = self.next_id();
        }
        self.data.insert((data.container, data.name.clone()), data);
    }

    /// Moves the data of a container to the archive; transient data is dropped
    fn archive_data(&mut self, container: DataContainer) {
        let keys: Vec<_> = self
            .data
            .keys()
            .filter(|(c, _)| *c == container)
            .cloned()
            .collect();
        for key in keys {
            if let Some(data) = self.data.remove(&key) {
                if !data.transient {
                    self.archived_data.push(ArchivedDataInstance::from_instance(&data));
                }
            }
        }
    }

    fn apply_document_update(&mut self, update: DocumentUpdate) {
        match update {
            DocumentUpdate::Set {
                process_instance_id,
                name,
                document,
            } => match document {
                Some(mut document) => {
                    if document.id == 0 {
                        document.id = self.next_id();
                    }
                    self.documents
                        .insert((process_instance_id, name), DocumentSlot::Single(document));
                }
                None => {
                    self.documents.remove(&(process_instance_id, name));
                }
            },
            DocumentUpdate::SetList {
                process_instance_id,
                name,
                mut documents,
            } => {
                for (index, document) in documents.iter_mut().enumerate() {
                    if document.id == 0 {
                        document.id = self.next_id();
                    }
                    document.index = Some(index);
                }
                self.documents
                    .insert((process_instance_id, name), DocumentSlot::List(documents));
            }
        }
    }

    /// Checks every target before the first write
    fn check_batch(&self, batch: &MutationBatch) -> Result<()> {
        for DataUpdate { container, name, .. } in &batch.data {
            if !self.data.contains_key(&(*container, name.clone())) {
                return Err(NotFound::Data {
                    name: name.clone(),
                    container: container.to_string(),
                }
                .into());
            }
        }
        if let Some((pi, _)) = &batch.string_indexes {
            if !self.process_instances.contains_key(pi) {
                return Err(NotFound::ProcessInstance(*pi).into());
            }
        }
        Ok(())
    }

    fn apply_batch(&mut self, batch: MutationBatch) -> Vec<MessageInstanceId> {
        let now = Utc::now();
        for DataUpdate {
            container,
            name,
            value,
        } in batch.data
        {
            if let Some(data) = self.data.get_mut(&(container, name)) {
                data.value = value;
                data.last_update = now;
            }
        }
        if let Some((pi, indexes)) = batch.string_indexes {
            if let Some(instance) = self.process_instances.get_mut(&pi) {
                instance.string_indexes = indexes;
                instance.last_update = now;
            }
        }
        for update in batch.documents {
            self.apply_document_update(update);
        }
        for (pi, name, value) in batch.external_data {
            self.external_data.insert((pi, name), value);
        }
        let mut message_ids = Vec::with_capacity(batch.messages.len());
        for mut message in batch.messages {
            message.id = self.next_id();
            message_ids.push(message.id);
            self.messages.insert(message.id, message);
        }
        message_ids
    }

    fn open_gateway_for(
        &mut self,
        node: &FlowNodeInstance,
        transition: bpmncore::ElementId,
    ) -> Option<FlowNodeInstanceId> {
        let gateway = self.flow_nodes.values_mut().find(|g| {
            !g.deleted
                && matches!(g.state, FlowNodeState::Initializing | FlowNodeState::Waiting)
                && g.definition_id == node.definition_id
                && g.process_instance_id == node.process_instance_id
                && g.parent_activity_instance_id == node.parent_activity_instance_id
                && matches!(&g.kind, FlowNodeKind::Gateway { hit_by, .. } if !hit_by.contains(&transition))
        })?;
        if let FlowNodeKind::Gateway { hit_by, .. } = &mut gateway.kind {
            hit_by.push(transition);
        }
        gateway.last_update_date = Utc::now();
        Some(gateway.id)
    }

    fn remove_process_instance_rows(&mut self, id: ProcessInstanceId) {
        let node_ids: HashSet<_> = self
            .flow_nodes
            .values()
            .filter(|n| n.process_instance_id == id)
            .map(|n| n.id)
            .collect();
        self.flow_nodes.retain(|node_id, _| !node_ids.contains(node_id));
        self.archived_flow_nodes
            .retain(|a| a.node.process_instance_id != id);
        self.data.retain(|(container, _), _| match container {
            DataContainer::Process(pi) => *pi != id,
            DataContainer::Activity(node_id) => !node_ids.contains(node_id),
        });
        self.archived_data.retain(|a| match a.container {
            DataContainer::Process(pi) => pi != id,
            DataContainer::Activity(node_id) => !node_ids.contains(&node_id),
        });
        self.documents.retain(|(pi, _), _| *pi != id);
        self.external_data.retain(|(pi, _), _| *pi != id);
        self.waiting_events.retain(|_, e| {
            e.flow_node_id()
                .map_or(true, |node_id| !node_ids.contains(&node_id))
        });
        self.process_instances.remove(&id);
    }
}

/// Keeps the fields other writers own: the executing claim, interruption
/// requests, deletion, triggers and gateway hits
fn merge(stored: &FlowNodeInstance, node: &FlowNodeInstance) -> FlowNodeInstance {
    let mut merged = node.clone();
    merged.state_executing = stored.state_executing;
    merged.interrupt_request = stored.interrupt_request;
    merged.deleted = stored.deleted;
    if stored.triggered && !node.triggered {
        merged.triggered = true;
        merged.trigger_inputs = stored.trigger_inputs.clone();
        merged.executed_by = stored.executed_by;
        merged.error_code = stored.error_code.clone();
    }
    if let (
        FlowNodeKind::Gateway {
            hit_by: stored_hits,
            ..
        },
        FlowNodeKind::Gateway { hit_by, .. },
    ) = (&stored.kind, &mut merged.kind)
    {
        for hit in stored_hits {
            if !hit_by.contains(hit) {
                hit_by.push(*hit);
            }
        }
    }
    merged.last_update_date = Utc::now();
    merged
}

/// In-memory store; one lock over all tables makes every method atomic
#[derive(Default)]
pub struct MemoryStore {
    tables: RwLock<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ProcessStore for MemoryStore {
    // ── Definitions ──

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()> {
        let mut t = self.tables.write();
        let deployed_seq = t.next_id();
        t.definitions.insert(
            definition.id,
            StoredDefinition {
                definition: definition.clone(),
                enabled: false,
                deployed_seq,
            },
        );
        Ok(())
    }

    async fn get_definition(&self, id: DefinitionId) -> Result<Option<ProcessDefinition>> {
        Ok(self
            .tables
            .read()
            .definitions
            .get(&id)
            .map(|d| d.definition.clone()))
    }

    async fn find_definition(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<ProcessDefinition>> {
        let t = self.tables.read();
        let found = t
            .definitions
            .values()
            .filter(|d| d.definition.name == name)
            .filter(|d| match version {
                Some(version) => d.definition.version == version,
                None => d.enabled,
            })
            .max_by_key(|d| d.deployed_seq)
            .map(|d| d.definition.clone());
        Ok(found)
    }

    async fn set_definition_enabled(&self, id: DefinitionId, enabled: bool) -> Result<()> {
        let mut t = self.tables.write();
        let stored = t
            .definitions
            .get_mut(&id)
            .ok_or_else(|| NotFound::ProcessDefinition(id.to_string()))?;
        stored.enabled = enabled;
        Ok(())
    }

    async fn is_definition_enabled(&self, id: DefinitionId) -> Result<bool> {
        let t = self.tables.read();
        t.definitions
            .get(&id)
            .map(|d| d.enabled)
            .ok_or_else(|| NotFound::ProcessDefinition(id.to_string()).into())
    }

    async fn delete_definition(&self, id: DefinitionId) -> Result<()> {
        let mut t = self.tables.write();
        if t.definitions.remove(&id).is_none() {
            return Err(NotFound::ProcessDefinition(id.to_string()).into());
        }
        let instance_ids: Vec<_> = t
            .process_instances
            .values()
            .filter(|p| p.definition_id == id)
            .map(|p| p.id)
            .chain(
                t.archived_process_instances
                    .values()
                    .filter(|a| a.definition_id == id)
                    .map(|a| a.source_object_id),
            )
            .collect();
        for pi in instance_ids {
            t.remove_process_instance_rows(pi);
            t.archived_process_instances.remove(&pi);
        }
        t.waiting_events.retain(|_, e| {
            !matches!(e.target, EventTarget::ProcessStart { definition_id, .. } if definition_id == id)
        });
        Ok(())
    }

    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>> {
        let t = self.tables.read();
        let mut stored: Vec<_> = t.definitions.values().collect();
        stored.sort_by_key(|d| d.deployed_seq);
        Ok(stored.into_iter().map(|d| d.definition.clone()).collect())
    }

    // ── Process instances ──

    async fn create_process_instance(&self, mut instance: ProcessInstance) -> Result<ProcessInstance> {
        let mut t = self.tables.write();
        instance.id = t.next_id();
        if instance.root_process_instance_id == 0 {
            instance.root_process_instance_id = instance.id;
        }
        t.process_instances.insert(instance.id, instance.clone());
        Ok(instance)
    }

    async fn activate_process_instance(
        &self,
        activation: ProcessActivation,
    ) -> Result<Vec<FlowNodeInstanceId>> {
        let mut t = self.tables.write();
        let state = t
            .process_instances
            .get(&activation.id)
            .map(|p| p.state)
            .ok_or(NotFound::ProcessInstance(activation.id))?;
        if state != ProcessInstanceState::Initializing {
            return Err(EngineError::Conflict(format!(
                "process instance {} is already {}",
                activation.id, state
            )));
        }

        for data in activation.data {
            t.insert_data(data);
        }
        for update in activation.documents {
            t.apply_document_update(update);
        }
        let ids = activation
            .nodes
            .into_iter()
            .map(|node| t.insert_flow_node(node))
            .collect();

        let now = Utc::now();
        if let Some(instance) = t.process_instances.get_mut(&activation.id) {
            instance.string_indexes = activation.string_indexes;
            instance.state = ProcessInstanceState::Started;
            instance.start_date = Some(now);
            instance.last_update = now;
        }
        Ok(ids)
    }

    async fn delete_process_instance(&self, id: ProcessInstanceId) -> Result<()> {
        self.tables.write().remove_process_instance_rows(id);
        Ok(())
    }

    async fn get_process_instance(&self, id: ProcessInstanceId) -> Result<Option<ProcessInstance>> {
        Ok(self
            .tables
            .read()
            .process_instances
            .get(&id)
            .filter(|p| !p.deleted)
            .cloned())
    }

    async fn list_process_instances(
        &self,
        state: Option<ProcessInstanceState>,
    ) -> Result<Vec<ProcessInstance>> {
        Ok(self
            .tables
            .read()
            .process_instances
            .values()
            .filter(|p| !p.deleted)
            .filter(|p| state.map_or(true, |s| p.state == s))
            .cloned()
            .collect())
    }

    async fn set_process_interruption(
        &self,
        id: ProcessInstanceId,
        interruption: Interruption,
    ) -> Result<bool> {
        let mut t = self.tables.write();
        let Some(instance) = t.process_instances.get_mut(&id) else {
            return Ok(false);
        };
        if instance.deleted || instance.state.is_terminal() || instance.interruption.is_some() {
            return Ok(false);
        }
        instance.interruption = Some(interruption);
        instance.last_update = Utc::now();
        Ok(true)
    }

    async fn finish_process_instance(
        &self,
        id: ProcessInstanceId,
        state: ProcessInstanceState,
    ) -> Result<Option<ArchivedProcessInstance>> {
        let mut t = self.tables.write();
        let open = t.flow_nodes.values().any(|n| {
            !n.deleted && (n.process_instance_id == id || n.root_process_instance_id == id)
        });
        let Some(instance) = t.process_instances.get_mut(&id) else {
            return Ok(None);
        };
        if open || instance.deleted || instance.state != ProcessInstanceState::Started {
            return Ok(None);
        }

        let now = Utc::now();
        instance.state = state;
        instance.end_date = Some(now);
        instance.last_update = now;
        instance.deleted = true;
        let archived = ArchivedProcessInstance::from_instance(instance);

        t.archived_process_instances.insert(id, archived.clone());
        t.archive_data(DataContainer::Process(id));
        t.external_data.retain(|(pi, _), _| *pi != id);
        let node_ids: HashSet<_> = t
            .flow_nodes
            .values()
            .filter(|n| n.process_instance_id == id)
            .map(|n| n.id)
            .collect();
        t.flow_nodes.retain(|node_id, _| !node_ids.contains(node_id));
        t.waiting_events.retain(|_, e| {
            e.flow_node_id()
                .map_or(true, |node_id| !node_ids.contains(&node_id))
        });
        t.process_instances.remove(&id);
        Ok(Some(archived))
    }

    async fn get_archived_process_instance(
        &self,
        id: ProcessInstanceId,
    ) -> Result<Option<ArchivedProcessInstance>> {
        Ok(self.tables.read().archived_process_instances.get(&id).cloned())
    }

    // ── Flow nodes ──

    async fn create_flow_nodes(
        &self,
        nodes: Vec<FlowNodeInstance>,
    ) -> Result<Vec<FlowNodeInstanceId>> {
        let mut t = self.tables.write();
        Ok(nodes.into_iter().map(|n| t.insert_flow_node(n)).collect())
    }

    async fn get_flow_node(&self, id: FlowNodeInstanceId) -> Result<Option<FlowNodeInstance>> {
        Ok(self.tables.read().flow_nodes.get(&id).cloned())
    }

    async fn save_flow_node(&self, node: &FlowNodeInstance) -> Result<FlowNodeInstance> {
        let mut t = self.tables.write();
        let stored = t
            .flow_nodes
            .get_mut(&node.id)
            .ok_or(NotFound::FlowNode(node.id))?;
        *stored = merge(stored, node);
        Ok(stored.clone())
    }

    async fn assign_user_task(
        &self,
        id: FlowNodeInstanceId,
        user_id: Option<UserId>,
    ) -> Result<Option<FlowNodeInstance>> {
        let mut t = self.tables.write();
        let Some(node) = t.flow_nodes.get_mut(&id) else {
            return Ok(None);
        };
        if node.deleted
            || node.state_executing
            || node.triggered
            || node.state != FlowNodeState::Ready
            || node.interrupt_request.is_some()
        {
            return Ok(None);
        }
        let Some(task) = node.as_assignable_mut() else {
            return Ok(None);
        };
        task.assign(user_id);
        node.last_update_date = Utc::now();
        Ok(Some(node.clone()))
    }

    async fn begin_execution(&self, id: FlowNodeInstanceId) -> Result<ExecutionClaim> {
        let mut t = self.tables.write();
        Ok(match t.flow_nodes.get_mut(&id) {
            None => ExecutionClaim::Gone,
            Some(node) if node.deleted => ExecutionClaim::Gone,
            Some(node) if node.state_executing => ExecutionClaim::Busy,
            Some(node) => {
                node.state_executing = true;
                ExecutionClaim::Claimed(node.clone())
            }
        })
    }

    async fn complete_flow_node(&self, node: &FlowNodeInstance) -> Result<bool> {
        let mut t = self.tables.write();
        let stored = t
            .flow_nodes
            .get_mut(&node.id)
            .ok_or(NotFound::FlowNode(node.id))?;
        if stored.interrupt_request.is_some() || stored.deleted {
            return Ok(false);
        }
        *stored = merge(stored, node);
        Ok(true)
    }

    async fn request_flow_node_interruption(
        &self,
        id: FlowNodeInstanceId,
        interruption: FlowNodeInterruption,
    ) -> Result<bool> {
        let mut t = self.tables.write();
        let Some(node) = t.flow_nodes.get_mut(&id) else {
            return Ok(false);
        };
        if node.deleted || node.terminal || node.interrupt_request.is_some() {
            return Ok(false);
        }
        node.interrupt_request = Some(interruption);
        node.last_update_date = Utc::now();
        Ok(true)
    }

    async fn trigger_flow_node(
        &self,
        id: FlowNodeInstanceId,
        trigger: FlowNodeTrigger,
    ) -> Result<bool> {
        let mut t = self.tables.write();
        let node = t.flow_nodes.get_mut(&id).ok_or(NotFound::FlowNode(id))?;
        if node.deleted || node.terminal || node.triggered {
            return Ok(false);
        }
        node.triggered = true;
        node.trigger_inputs = trigger.inputs;
        node.executed_by = trigger.executed_by;
        node.error_code = trigger.error_code;
        node.last_update_date = Utc::now();
        Ok(true)
    }

    async fn finish_flow_node(
        &self,
        id: FlowNodeInstanceId,
        successors: Vec<Successor>,
    ) -> Result<Vec<FlowNodeInstanceId>> {
        let mut t = self.tables.write();
        let Some(node) = t.flow_nodes.get(&id) else {
            if t.archived_flow_nodes.iter().any(|a| a.node.id == id) {
                return Ok(Vec::new());
            }
            return Err(NotFound::FlowNode(id).into());
        };
        if node.deleted {
            return Ok(Vec::new());
        }
        if !node.terminal {
            return Err(EngineError::Conflict(format!(
                "flow node {} is {}, not terminal",
                id, node.state
            )));
        }

        let archived = ArchivedFlowNodeInstance::from_instance(node);
        t.archived_flow_nodes.push(archived);
        t.flow_nodes.remove(&id);
        t.archive_data(DataContainer::Activity(id));
        t.waiting_events
            .retain(|_, e| e.flow_node_id() != Some(id));

        let mut next = Vec::with_capacity(successors.len());
        for successor in successors {
            match successor {
                Successor::Node(node) => next.push(t.insert_flow_node(node)),
                Successor::Join { node, transition } => {
                    match t.open_gateway_for(&node, transition) {
                        Some(gateway_id) => next.push(gateway_id),
                        None => {
                            let mut node = node;
                            if let FlowNodeKind::Gateway { hit_by, .. } = &mut node.kind {
                                hit_by.push(transition);
                            }
                            next.push(t.insert_flow_node(node));
                        }
                    }
                }
            }
        }
        Ok(next)
    }

    async fn list_flow_nodes(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<FlowNodeInstance>> {
        Ok(self
            .tables
            .read()
            .flow_nodes
            .values()
            .filter(|n| !n.deleted && n.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    async fn list_child_flow_nodes(
        &self,
        parent_id: FlowNodeInstanceId,
    ) -> Result<Vec<FlowNodeInstance>> {
        Ok(self
            .tables
            .read()
            .flow_nodes
            .values()
            .filter(|n| !n.deleted && n.parent_activity_instance_id == Some(parent_id))
            .cloned()
            .collect())
    }

    async fn count_open_flow_nodes(&self, process_instance_id: ProcessInstanceId) -> Result<usize> {
        Ok(self
            .tables
            .read()
            .flow_nodes
            .values()
            .filter(|n| !n.deleted && n.process_instance_id == process_instance_id)
            .count())
    }

    async fn list_flow_nodes_to_restart(&self) -> Result<Vec<FlowNodeInstance>> {
        Ok(self
            .tables
            .read()
            .flow_nodes
            .values()
            .filter(|n| n.needs_restart())
            .cloned()
            .collect())
    }

    async fn reset_executing_flag(&self, id: FlowNodeInstanceId) -> Result<()> {
        let mut t = self.tables.write();
        let node = t.flow_nodes.get_mut(&id).ok_or(NotFound::FlowNode(id))?;
        node.state_executing = false;
        Ok(())
    }

    async fn search_flow_nodes(&self, filter: &FlowNodeFilter) -> Result<Vec<FlowNodeInstance>> {
        let t = self.tables.read();
        Ok(t.flow_nodes
            .values()
            .filter(|n| !n.deleted)
            .filter(|n| {
                let supervisors = t
                    .definitions
                    .get(&n.process_definition_id)
                    .map(|d| d.definition.supervisors.as_slice())
                    .unwrap_or_default();
                filter.matches(n, supervisors)
            })
            .cloned()
            .collect())
    }

    async fn get_archived_flow_nodes(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedFlowNodeInstance>> {
        Ok(self
            .tables
            .read()
            .archived_flow_nodes
            .iter()
            .filter(|a| a.node.process_instance_id == process_instance_id)
            .cloned()
            .collect())
    }

    // ── Data ──

    async fn get_data(&self, container: DataContainer, name: &str) -> Result<Option<DataInstance>> {
        Ok(self
            .tables
            .read()
            .data
            .get(&(container, name.to_string()))
            .cloned())
    }

    async fn list_data(&self, container: DataContainer) -> Result<Vec<DataInstance>> {
        Ok(self
            .tables
            .read()
            .data
            .iter()
            .filter(|((c, _), _)| *c == container)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn create_data(&self, data: Vec<DataInstance>) -> Result<()> {
        let mut t = self.tables.write();
        for d in data {
            t.insert_data(d);
        }
        Ok(())
    }

    async fn update_data_value(
        &self,
        container: DataContainer,
        name: &str,
        value: Value,
    ) -> Result<()> {
        let mut t = self.tables.write();
        let data = t
            .data
            .get_mut(&(container, name.to_string()))
            .ok_or_else(|| NotFound::Data {
                name: name.to_string(),
                container: container.to_string(),
            })?;
        data.value = value;
        data.last_update = Utc::now();
        Ok(())
    }

    async fn get_archived_data(
        &self,
        container: DataContainer,
        name: &str,
    ) -> Result<Option<ArchivedDataInstance>> {
        Ok(self
            .tables
            .read()
            .archived_data
            .iter()
            .rev()
            .find(|a| a.container == container && a.name == name)
            .cloned())
    }

    async fn list_archived_data(
        &self,
        container: DataContainer,
    ) -> Result<Vec<ArchivedDataInstance>> {
        Ok(self
            .tables
            .read()
            .archived_data
            .iter()
            .filter(|a| a.container == container)
            .cloned()
            .collect())
    }

    async fn commit_execution(
        &self,
        node: &FlowNodeInstance,
        batch: MutationBatch,
    ) -> Result<Option<(FlowNodeInstance, Vec<MessageInstanceId>)>> {
        let mut t = self.tables.write();
        match t.flow_nodes.get(&node.id) {
            Some(stored) if stored.state == FlowNodeState::Executing => {}
            _ => return Ok(None),
        }
        t.check_batch(&batch)?;

        let message_ids = t.apply_batch(batch);
        let Some(stored) = t.flow_nodes.get_mut(&node.id) else {
            return Ok(None);
        };
        *stored = merge(stored, node);
        Ok(Some((stored.clone(), message_ids)))
    }

    async fn get_external_data(
        &self,
        process_instance_id: ProcessInstanceId,
        name: &str,
    ) -> Result<Option<Value>> {
        Ok(self
            .tables
            .read()
            .external_data
            .get(&(process_instance_id, name.to_string()))
            .cloned())
    }

    // ── Documents ──

    async fn get_document(
        &self,
        process_instance_id: ProcessInstanceId,
        name: &str,
    ) -> Result<Option<DocumentSlot>> {
        Ok(self
            .tables
            .read()
            .documents
            .get(&(process_instance_id, name.to_string()))
            .cloned())
    }

    async fn list_documents(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<(String, DocumentSlot)>> {
        Ok(self
            .tables
            .read()
            .documents
            .iter()
            .filter(|((pi, _), _)| *pi == process_instance_id)
            .map(|((_, name), slot)| (name.clone(), slot.clone()))
            .collect())
    }

    // ── Waiting events ──

    async fn add_waiting_event(&self, mut event: WaitingEvent) -> Result<WaitingEventId> {
        let mut t = self.tables.write();
        if event.id == 0 {
            event.id = t.next_id();
        } else {
            t.sequence = t.sequence.max(event.id);
        }
        let id = event.id;
        t.waiting_events.insert(id, event);
        Ok(id)
    }

    async fn get_waiting_event(&self, id: WaitingEventId) -> Result<Option<WaitingEvent>> {
        Ok(self.tables.read().waiting_events.get(&id).cloned())
    }

    async fn find_waiting_events(
        &self,
        event_type: WaitingEventType,
        name: &str,
    ) -> Result<Vec<WaitingEvent>> {
        Ok(self
            .tables
            .read()
            .waiting_events
            .values()
            .filter(|e| e.event_type == event_type && e.name == name)
            .cloned()
            .collect())
    }

    async fn list_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<WaitingEvent>> {
        Ok(self
            .tables
            .read()
            .waiting_events
            .values()
            .filter(|e| !e.in_progress && e.is_due(now))
            .cloned()
            .collect())
    }

    async fn claim_waiting_event(&self, id: WaitingEventId) -> Result<bool> {
        let mut t = self.tables.write();
        Ok(match t.waiting_events.get_mut(&id) {
            Some(event) if !event.in_progress => {
                event.in_progress = true;
                true
            }
            _ => false,
        })
    }

    async fn release_waiting_event(&self, id: WaitingEventId) -> Result<()> {
        if let Some(event) = self.tables.write().waiting_events.get_mut(&id) {
            event.in_progress = false;
        }
        Ok(())
    }

    async fn delete_waiting_event(&self, id: WaitingEventId) -> Result<()> {
        self.tables.write().waiting_events.remove(&id);
        Ok(())
    }

    async fn delete_waiting_events_for_flow_node(&self, id: FlowNodeInstanceId) -> Result<usize> {
        let mut t = self.tables.write();
        let before = t.waiting_events.len();
        t.waiting_events.retain(|_, e| e.flow_node_id() != Some(id));
        Ok(before - t.waiting_events.len())
    }

    async fn delete_start_events_for_definition(&self, id: DefinitionId) -> Result<usize> {
        let mut t = self.tables.write();
        let before = t.waiting_events.len();
        t.waiting_events.retain(|_, e| {
            !matches!(e.target, EventTarget::ProcessStart { definition_id, .. } if definition_id == id)
        });
        Ok(before - t.waiting_events.len())
    }

    async fn list_in_progress_waiting_events(&self) -> Result<Vec<WaitingEventId>> {
        Ok(self
            .tables
            .read()
            .waiting_events
            .values()
            .filter(|e| e.in_progress)
            .map(|e| e.id)
            .collect())
    }

    async fn reset_in_progress_waiting_events(&self) -> Result<usize> {
        let mut t = self.tables.write();
        let mut count = 0;
        for event in t.waiting_events.values_mut().filter(|e| e.in_progress) {
            event.in_progress = false;
            count += 1;
        }
        Ok(count)
    }

    // ── Messages ──

    async fn add_message(&self, mut message: MessageInstance) -> Result<MessageInstanceId> {
        let mut t = self.tables.write();
        if message.id == 0 {
            message.id = t.next_id();
        } else {
            t.sequence = t.sequence.max(message.id);
        }
        let id = message.id;
        t.messages.insert(id, message);
        Ok(id)
    }

    async fn list_unhandled_messages(&self) -> Result<Vec<MessageInstance>> {
        Ok(self
            .tables
            .read()
            .messages
            .values()
            .filter(|m| !m.handled)
            .cloned()
            .collect())
    }

    async fn claim_message(&self, id: MessageInstanceId) -> Result<bool> {
        let mut t = self.tables.write();
        Ok(match t.messages.get_mut(&id) {
            Some(message) if !message.handled => {
                message.handled = true;
                true
            }
            _ => false,
        })
    }

    async fn release_message(&self, id: MessageInstanceId) -> Result<()> {
        if let Some(message) = self.tables.write().messages.get_mut(&id) {
            message.handled = false;
        }
        Ok(())
    }

    async fn delete_message(&self, id: MessageInstanceId) -> Result<()> {
        self.tables.write().messages.remove(&id);
        Ok(())
    }

    async fn list_handled_messages(&self) -> Result<Vec<MessageInstanceId>> {
        Ok(self
            .tables
            .read()
            .messages
            .values()
            .filter(|m| m.handled)
            .map(|m| m.id)
            .collect())
    }

    async fn reset_handled_messages(&self) -> Result<usize> {
        let mut t = self.tables.write();
        let mut count = 0;
        for message in t.messages.values_mut().filter(|m| m.handled) {
            message.handled = false;
            count += 1;
        }
        Ok(count)
    }
}
