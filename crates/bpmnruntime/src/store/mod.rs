//! Persistence for definitions, instances, data, documents, waiting events and messages
//!
//! Every conditional write (claims, execution flags, completion) is a single
//! compare-and-set against the backing store, never read-then-write.

mod memory;

pub use memory::MemoryStore;

use crate::search::FlowNodeFilter;
use async_trait::async_trait;
use bpmncore::{
    ArchivedDataInstance, ArchivedFlowNodeInstance, ArchivedProcessInstance, DataContainer,
    DataInstance, DefinitionId, Document, DocumentSlot, ElementId, FlowNodeInstance,
    FlowNodeInstanceId, FlowNodeInterruption, Interruption, MessageInstance, MessageInstanceId,
    ProcessDefinition, ProcessInstance, ProcessInstanceId, ProcessInstanceState, Result, UserId,
    Value, WaitingEvent, WaitingEventId, WaitingEventType, STRING_INDEX_SLOTS,
};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;

#[derive(Debug, Clone, PartialEq)]
pub struct DataUpdate {
    pub container: DataContainer,
    pub name: String,
    pub value: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DocumentUpdate {
    /// `None` removes the document
    Set {
        process_instance_id: ProcessInstanceId,
        name: String,
        document: Option<Document>,
    },
    SetList {
        process_instance_id: ProcessInstanceId,
        name: String,
        documents: Vec<Document>,
    },
}

/// Everything one operation batch writes, committed atomically
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MutationBatch {
    pub data: Vec<DataUpdate>,
    pub string_indexes: Option<(ProcessInstanceId, [Option<String>; STRING_INDEX_SLOTS])>,
    pub documents: Vec<DocumentUpdate>,
    pub external_data: Vec<(ProcessInstanceId, String, Value)>,
    pub messages: Vec<MessageInstance>,
}

impl MutationBatch {
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
            && self.string_indexes.is_none()
            && self.documents.is_empty()
            && self.external_data.is_empty()
            && self.messages.is_empty()
    }
}

/// Moves an initializing instance to started with its initial state
#[derive(Debug, Clone)]
pub struct ProcessActivation {
    pub id: ProcessInstanceId,
    pub data: Vec<DataInstance>,
    pub documents: Vec<DocumentUpdate>,
    pub string_indexes: [Option<String>; STRING_INDEX_SLOTS],
    pub nodes: Vec<FlowNodeInstance>,
}

/// What arrived for a node waiting on a human, a message, a timer or a called process
#[derive(Debug, Clone, Default)]
pub struct FlowNodeTrigger {
    pub inputs: BTreeMap<String, Value>,
    pub executed_by: Option<UserId>,
    pub error_code: Option<String>,
}

/// Node spawned when a flow node finishes
#[derive(Debug, Clone)]
pub enum Successor {
    Node(FlowNodeInstance),
    /// Joined into an open gateway of the same definition and scope that has
    /// not seen `transition` yet; `node` is created when there is none.
    Join {
        node: FlowNodeInstance,
        transition: ElementId,
    },
}

/// Result of trying to take a flow node for execution
#[derive(Debug, Clone)]
pub enum ExecutionClaim {
    Claimed(FlowNodeInstance),
    /// Another worker holds the node
    Busy,
    /// Missing or already archived
    Gone,
}

/// Persistence trait for all engine state.
///
/// The engine components operate exclusively through this trait.
#[async_trait]
pub trait ProcessStore: Send + Sync {
    // ── Definitions ──

    async fn save_definition(&self, definition: &ProcessDefinition) -> Result<()>;
    async fn get_definition(&self, id: DefinitionId) -> Result<Option<ProcessDefinition>>;
    /// Latest enabled version when `version` is `None`
    async fn find_definition(
        &self,
        name: &str,
        version: Option<&str>,
    ) -> Result<Option<ProcessDefinition>>;
    async fn set_definition_enabled(&self, id: DefinitionId, enabled: bool) -> Result<()>;
    async fn is_definition_enabled(&self, id: DefinitionId) -> Result<bool>;
    /// Removes the definition and every live or archived instance of it
    async fn delete_definition(&self, id: DefinitionId) -> Result<()>;
    async fn list_definitions(&self) -> Result<Vec<ProcessDefinition>>;

    // ── Process instances ──

    /// Assigns the id; a root instance becomes its own root
    async fn create_process_instance(&self, instance: ProcessInstance) -> Result<ProcessInstance>;
    /// Writes initial data, documents, string indexes and nodes, then marks the
    /// instance started. Returns the ids of the created nodes.
    async fn activate_process_instance(
        &self,
        activation: ProcessActivation,
    ) -> Result<Vec<FlowNodeInstanceId>>;
    /// Drops an instance whose start failed
    async fn delete_process_instance(&self, id: ProcessInstanceId) -> Result<()>;
    /// Live instances only
    async fn get_process_instance(&self, id: ProcessInstanceId) -> Result<Option<ProcessInstance>>;
    async fn list_process_instances(
        &self,
        state: Option<ProcessInstanceState>,
    ) -> Result<Vec<ProcessInstance>>;
    /// Set only when no interruption is recorded yet and the instance is not finished
    async fn set_process_interruption(
        &self,
        id: ProcessInstanceId,
        interruption: Interruption,
    ) -> Result<bool>;
    /// Succeeds only for a started instance with no open flow node: writes the
    /// final state, archives instance and data, removes the live row and its
    /// waiting events.
    async fn finish_process_instance(
        &self,
        id: ProcessInstanceId,
        state: ProcessInstanceState,
    ) -> Result<Option<ArchivedProcessInstance>>;
    async fn get_archived_process_instance(
        &self,
        id: ProcessInstanceId,
    ) -> Result<Option<ArchivedProcessInstance>>;

    // ── Flow nodes ──

    async fn create_flow_nodes(
        &self,
        nodes: Vec<FlowNodeInstance>,
    ) -> Result<Vec<FlowNodeInstanceId>>;
    /// Live rows only; archived nodes are read through `get_archived_flow_nodes`
    async fn get_flow_node(&self, id: FlowNodeInstanceId) -> Result<Option<FlowNodeInstance>>;
    /// Writes the node, keeping the stored executing flag, interruption
    /// request, deletion flag, trigger and gateway hits. Returns the row as stored.
    async fn save_flow_node(&self, node: &FlowNodeInstance) -> Result<FlowNodeInstance>;
    /// Sets the assignee of a ready user task that no worker holds.
    /// `None` when the task is missing, not ready or being executed.
    async fn assign_user_task(
        &self,
        id: FlowNodeInstanceId,
        user_id: Option<UserId>,
    ) -> Result<Option<FlowNodeInstance>>;
    /// Sets `state_executing` on an open node nobody else is executing
    async fn begin_execution(&self, id: FlowNodeInstanceId) -> Result<ExecutionClaim>;
    /// Saves a node that reached a terminal state through its normal flow;
    /// refused when an interruption was requested meanwhile.
    async fn complete_flow_node(&self, node: &FlowNodeInstance) -> Result<bool>;
    async fn request_flow_node_interruption(
        &self,
        id: FlowNodeInstanceId,
        interruption: FlowNodeInterruption,
    ) -> Result<bool>;
    /// Set once, on an open node that is not terminal
    async fn trigger_flow_node(&self, id: FlowNodeInstanceId, trigger: FlowNodeTrigger)
        -> Result<bool>;
    /// Archives a terminal node with its activity data and spawns its
    /// successors in the same step. The live row is removed. Returns the nodes
    /// to execute next; empty when the node was already finished.
    async fn finish_flow_node(
        &self,
        id: FlowNodeInstanceId,
        successors: Vec<Successor>,
    ) -> Result<Vec<FlowNodeInstanceId>>;
    /// Open nodes of a process instance
    async fn list_flow_nodes(&self, process_instance_id: ProcessInstanceId)
        -> Result<Vec<FlowNodeInstance>>;
    /// Open children of a multi-instance or loop parent
    async fn list_child_flow_nodes(
        &self,
        parent_id: FlowNodeInstanceId,
    ) -> Result<Vec<FlowNodeInstance>>;
    async fn count_open_flow_nodes(&self, process_instance_id: ProcessInstanceId) -> Result<usize>;
    /// Nodes with `!deleted && (state_executing || !stable || terminal)`
    async fn list_flow_nodes_to_restart(&self) -> Result<Vec<FlowNodeInstance>>;
    async fn reset_executing_flag(&self, id: FlowNodeInstanceId) -> Result<()>;
    async fn search_flow_nodes(&self, filter: &FlowNodeFilter) -> Result<Vec<FlowNodeInstance>>;
    async fn get_archived_flow_nodes(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<ArchivedFlowNodeInstance>>;

    // ── Data ──

    async fn get_data(&self, container: DataContainer, name: &str) -> Result<Option<DataInstance>>;
    async fn list_data(&self, container: DataContainer) -> Result<Vec<DataInstance>>;
    async fn create_data(&self, data: Vec<DataInstance>) -> Result<()>;
    async fn update_data_value(
        &self,
        container: DataContainer,
        name: &str,
        value: Value,
    ) -> Result<()>;
    /// Most recent archived value
    async fn get_archived_data(
        &self,
        container: DataContainer,
        name: &str,
    ) -> Result<Option<ArchivedDataInstance>>;
    async fn list_archived_data(&self, container: DataContainer)
        -> Result<Vec<ArchivedDataInstance>>;
    /// Applies every write of the batch together with the node leaving
    /// `Executing`, or nothing. `None` when the stored node is no longer
    /// executing. Returns the row as stored and the ids of added messages.
    async fn commit_execution(
        &self,
        node: &FlowNodeInstance,
        batch: MutationBatch,
    ) -> Result<Option<(FlowNodeInstance, Vec<MessageInstanceId>)>>;
    async fn get_external_data(
        &self,
        process_instance_id: ProcessInstanceId,
        name: &str,
    ) -> Result<Option<Value>>;

    // ── Documents ──

    async fn get_document(
        &self,
        process_instance_id: ProcessInstanceId,
        name: &str,
    ) -> Result<Option<DocumentSlot>>;
    async fn list_documents(
        &self,
        process_instance_id: ProcessInstanceId,
    ) -> Result<Vec<(String, DocumentSlot)>>;

    // ── Waiting events ──

    async fn add_waiting_event(&self, event: WaitingEvent) -> Result<WaitingEventId>;
    async fn get_waiting_event(&self, id: WaitingEventId) -> Result<Option<WaitingEvent>>;
    async fn find_waiting_events(
        &self,
        event_type: WaitingEventType,
        name: &str,
    ) -> Result<Vec<WaitingEvent>>;
    /// Unclaimed timers due at `now`
    async fn list_due_timers(&self, now: DateTime<Utc>) -> Result<Vec<WaitingEvent>>;
    /// `in_progress` false to true; `false` when already claimed or gone
    async fn claim_waiting_event(&self, id: WaitingEventId) -> Result<bool>;
    async fn release_waiting_event(&self, id: WaitingEventId) -> Result<()>;
    async fn delete_waiting_event(&self, id: WaitingEventId) -> Result<()>;
    async fn delete_waiting_events_for_flow_node(&self, id: FlowNodeInstanceId) -> Result<usize>;
    async fn delete_start_events_for_definition(&self, id: DefinitionId) -> Result<usize>;
    async fn list_in_progress_waiting_events(&self) -> Result<Vec<WaitingEventId>>;
    /// Clears every `in_progress` flag; returns how many were set
    async fn reset_in_progress_waiting_events(&self) -> Result<usize>;

    // ── Messages ──

    async fn add_message(&self, message: MessageInstance) -> Result<MessageInstanceId>;
    async fn list_unhandled_messages(&self) -> Result<Vec<MessageInstance>>;
    /// `handled` false to true; `false` when already claimed or gone
    async fn claim_message(&self, id: MessageInstanceId) -> Result<bool>;
    async fn release_message(&self, id: MessageInstanceId) -> Result<()>;
    async fn delete_message(&self, id: MessageInstanceId) -> Result<()>;
    async fn list_handled_messages(&self) -> Result<Vec<MessageInstanceId>>;
    /// Clears every `handled` flag; returns how many were set
    async fn reset_handled_messages(&self) -> Result<usize>;
}
