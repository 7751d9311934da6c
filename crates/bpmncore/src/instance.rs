use crate::definition::{DefinitionId, ElementId, GatewayType, TaskPriority};
use crate::operation::STRING_INDEX_SLOTS;
use crate::value::{DataType, Value};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub type ProcessInstanceId = u64;
pub type FlowNodeInstanceId = u64;
pub type DataInstanceId = u64;
pub type WaitingEventId = u64;
pub type MessageInstanceId = u64;
pub type UserId = u64;

// ── Process instances ──────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessInstanceState {
    Initializing,
    Started,
    Completed,
    Cancelled,
    Aborted,
    Error,
}

impl ProcessInstanceState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Aborted | Self::Error
        )
    }
}

impl fmt::Display for ProcessInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Initializing => write!(f, "initializing"),
            Self::Started => write!(f, "started"),
            Self::Completed => write!(f, "completed"),
            Self::Cancelled => write!(f, "cancelled"),
            Self::Aborted => write!(f, "aborted"),
            Self::Error => write!(f, "error"),
        }
    }
}

impl FromStr for ProcessInstanceState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "started" => Ok(Self::Started),
            "completed" => Ok(Self::Completed),
            "cancelled" => Ok(Self::Cancelled),
            "aborted" => Ok(Self::Aborted),
            "error" => Ok(Self::Error),
            _ => Err(format!("Invalid process instance state: {s}")),
        }
    }
}

/// Why a process instance is being wound down before its flow reached the end
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum Interruption {
    /// Cancelled through the API
    Cancelled,
    /// Aborted because the calling activity was aborted
    Aborted,
    /// A terminate end event was reached
    Terminated,
    /// A flow node failed without a handler, or an error end event was reached
    Failed { error_code: Option<String> },
}

impl Interruption {
    /// Final state once every open flow node has been wound down
    pub fn final_state(&self) -> ProcessInstanceState {
        match self {
            Interruption::Cancelled => ProcessInstanceState::Cancelled,
            Interruption::Aborted => ProcessInstanceState::Aborted,
            Interruption::Terminated => ProcessInstanceState::Completed,
            Interruption::Failed { .. } => ProcessInstanceState::Error,
        }
    }

    /// Flow node interruption applied to the remaining open nodes
    pub fn flow_node_interruption(&self) -> FlowNodeInterruption {
        match self {
            Interruption::Cancelled => FlowNodeInterruption::Cancel,
            _ => FlowNodeInterruption::Abort,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProcessInstance {
    pub id: ProcessInstanceId,
    pub name: String,
    pub version: String,
    pub definition_id: DefinitionId,
    pub state: ProcessInstanceState,
    pub started_by: UserId,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub last_update: DateTime<Utc>,
    pub string_indexes: [Option<String>; STRING_INDEX_SLOTS],
    pub root_process_instance_id: ProcessInstanceId,
    /// Call activity that started this instance
    pub caller_id: Option<FlowNodeInstanceId>,
    pub interruption: Option<Interruption>,
    pub deleted: bool,
}

impl ProcessInstance {
    pub fn new(name: &str, version: &str, definition_id: DefinitionId, started_by: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: 0,
            name: name.to_string(),
            version: version.to_string(),
            definition_id,
            state: ProcessInstanceState::Initializing,
            started_by,
            start_date: None,
            end_date: None,
            last_update: now,
            string_indexes: Default::default(),
            root_process_instance_id: 0,
            caller_id: None,
            interruption: None,
            deleted: false,
        }
    }

    pub fn is_root(&self) -> bool {
        self.caller_id.is_none()
    }

    pub fn error_code(&self) -> Option<&str> {
        match &self.interruption {
            Some(Interruption::Failed { error_code }) => error_code.as_deref(),
            _ => None,
        }
    }
}

/// Immutable snapshot written when a process instance finishes
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedProcessInstance {
    pub source_object_id: ProcessInstanceId,
    pub archive_date: DateTime<Utc>,
    pub name: String,
    pub version: String,
    pub definition_id: DefinitionId,
    pub state: ProcessInstanceState,
    pub started_by: UserId,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub string_indexes: [Option<String>; STRING_INDEX_SLOTS],
    pub root_process_instance_id: ProcessInstanceId,
    pub caller_id: Option<FlowNodeInstanceId>,
    pub error_code: Option<String>,
}

impl ArchivedProcessInstance {
    pub fn from_instance(instance: &ProcessInstance) -> Self {
        Self {
            source_object_id: instance.id,
            archive_date: Utc::now(),
            name: instance.name.clone(),
            version: instance.version.clone(),
            definition_id: instance.definition_id,
            state: instance.state,
            started_by: instance.started_by,
            start_date: instance.start_date,
            end_date: instance.end_date,
            string_indexes: instance.string_indexes.clone(),
            root_process_instance_id: instance.root_process_instance_id,
            caller_id: instance.caller_id,
            error_code: instance.error_code().map(str::to_string),
        }
    }
}

// ── Flow nodes ─────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowNodeState {
    Initializing,
    Ready,
    Executing,
    Waiting,
    Completing,
    Completed,
    CancellingSubtasks,
    Cancelled,
    Aborting,
    Aborted,
    Skipped,
    Failed,
}

impl FlowNodeState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Completed | Self::Cancelled | Self::Aborted | Self::Skipped | Self::Failed
        )
    }

    /// Suspended or finished states, safe to leave untouched across a restart
    pub fn is_stable(&self) -> bool {
        matches!(self, Self::Ready | Self::Waiting) || self.is_terminal()
    }
}

impl fmt::Display for FlowNodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Ready => "ready",
            Self::Executing => "executing",
            Self::Waiting => "waiting",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::CancellingSubtasks => "cancelling_subtasks",
            Self::Cancelled => "cancelled",
            Self::Aborting => "aborting",
            Self::Aborted => "aborted",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        };
        write!(f, "{}", name)
    }
}

impl FromStr for FlowNodeState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "initializing" => Ok(Self::Initializing),
            "ready" => Ok(Self::Ready),
            "executing" => Ok(Self::Executing),
            "waiting" => Ok(Self::Waiting),
            "completing" => Ok(Self::Completing),
            "completed" => Ok(Self::Completed),
            "cancelling_subtasks" => Ok(Self::CancellingSubtasks),
            "cancelled" => Ok(Self::Cancelled),
            "aborting" => Ok(Self::Aborting),
            "aborted" => Ok(Self::Aborted),
            "skipped" => Ok(Self::Skipped),
            "failed" => Ok(Self::Failed),
            _ => Err(format!("Invalid flow node state: {s}")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FlowNodeType {
    AutomaticTask,
    UserTask,
    CallActivity,
    Gateway,
    StartEvent,
    IntermediateCatchEvent,
    IntermediateThrowEvent,
    BoundaryEvent,
    EndEvent,
    MultiInstanceActivity,
    LoopActivity,
}

impl fmt::Display for FlowNodeType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AutomaticTask => "AUTOMATIC_TASK",
            Self::UserTask => "USER_TASK",
            Self::CallActivity => "CALL_ACTIVITY",
            Self::Gateway => "GATEWAY",
            Self::StartEvent => "START_EVENT",
            Self::IntermediateCatchEvent => "INTERMEDIATE_CATCH_EVENT",
            Self::IntermediateThrowEvent => "INTERMEDIATE_THROW_EVENT",
            Self::BoundaryEvent => "BOUNDARY_EVENT",
            Self::EndEvent => "END_EVENT",
            Self::MultiInstanceActivity => "MULTI_INSTANCE_ACTIVITY",
            Self::LoopActivity => "LOOP_ACTIVITY",
        };
        write!(f, "{}", name)
    }
}

/// Something a human can be assigned to
pub trait Assignable {
    fn actor(&self) -> &str;
    fn assignee_id(&self) -> Option<UserId>;
    fn assign(&mut self, user_id: Option<UserId>);
}

/// Something with a deadline
pub trait HasDueDate {
    fn due_date(&self) -> Option<DateTime<Utc>>;
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HumanTask {
    pub actor: String,
    pub assignee_id: Option<UserId>,
    pub claimed_date: Option<DateTime<Utc>>,
    pub priority: TaskPriority,
    pub expected_end_date: Option<DateTime<Utc>>,
}

impl Assignable for HumanTask {
    fn actor(&self) -> &str {
        &self.actor
    }

    fn assignee_id(&self) -> Option<UserId> {
        self.assignee_id
    }

    fn assign(&mut self, user_id: Option<UserId>) {
        self.assignee_id = user_id;
        self.claimed_date = user_id.map(|_| Utc::now());
    }
}

impl HasDueDate for HumanTask {
    fn due_date(&self) -> Option<DateTime<Utc>> {
        self.expected_end_date
    }
}

/// Kind-specific payload of a flow node instance
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind")]
pub enum FlowNodeKind {
    AutomaticTask,
    UserTask(HumanTask),
    CallActivity {
        called_process_instance_id: Option<ProcessInstanceId>,
    },
    Gateway {
        gateway_type: GatewayType,
        /// Incoming transitions taken so far
        hit_by: Vec<ElementId>,
    },
    StartEvent,
    IntermediateCatchEvent,
    IntermediateThrowEvent,
    BoundaryEvent {
        attached_to: FlowNodeInstanceId,
        interrupting: bool,
    },
    EndEvent,
    /// Parent of the instances of a multi-instance activity
    MultiInstance {
        sequential: bool,
        total: u32,
        started: u32,
        completed: u32,
    },
    /// Parent of the iterations of a standard loop
    Loop { iterations: u32 },
}

impl FlowNodeKind {
    pub fn node_type(&self) -> FlowNodeType {
        match self {
            FlowNodeKind::AutomaticTask => FlowNodeType::AutomaticTask,
            FlowNodeKind::UserTask(_) => FlowNodeType::UserTask,
            FlowNodeKind::CallActivity { .. } => FlowNodeType::CallActivity,
            FlowNodeKind::Gateway { .. } => FlowNodeType::Gateway,
            FlowNodeKind::StartEvent => FlowNodeType::StartEvent,
            FlowNodeKind::IntermediateCatchEvent => FlowNodeType::IntermediateCatchEvent,
            FlowNodeKind::IntermediateThrowEvent => FlowNodeType::IntermediateThrowEvent,
            FlowNodeKind::BoundaryEvent { .. } => FlowNodeType::BoundaryEvent,
            FlowNodeKind::EndEvent => FlowNodeType::EndEvent,
            FlowNodeKind::MultiInstance { .. } => FlowNodeType::MultiInstanceActivity,
            FlowNodeKind::Loop { .. } => FlowNodeType::LoopActivity,
        }
    }
}

/// Request to wind a flow node down, honoured once its current batch ends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowNodeInterruption {
    Cancel,
    Abort,
}

impl FlowNodeInterruption {
    pub fn transitional_state(&self) -> FlowNodeState {
        match self {
            FlowNodeInterruption::Cancel => FlowNodeState::CancellingSubtasks,
            FlowNodeInterruption::Abort => FlowNodeState::Aborting,
        }
    }

    pub fn final_state(&self) -> FlowNodeState {
        match self {
            FlowNodeInterruption::Cancel => FlowNodeState::Cancelled,
            FlowNodeInterruption::Abort => FlowNodeState::Aborted,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FlowNodeInstance {
    pub id: FlowNodeInstanceId,
    /// Flow node definition this instance runs
    pub definition_id: ElementId,
    pub name: String,
    pub kind: FlowNodeKind,
    pub state: FlowNodeState,
    /// Owning (parent container) process instance
    pub process_instance_id: ProcessInstanceId,
    pub root_process_instance_id: ProcessInstanceId,
    pub process_definition_id: DefinitionId,
    /// Multi-instance or loop parent
    pub parent_activity_instance_id: Option<FlowNodeInstanceId>,
    pub loop_counter: Option<u32>,
    pub state_executing: bool,
    pub stable: bool,
    pub terminal: bool,
    pub deleted: bool,
    pub interrupt_request: Option<FlowNodeInterruption>,
    /// The message, timer, human input or called process the node waits for has arrived
    pub triggered: bool,
    /// Outgoing transitions chosen when the node completed
    pub taken_transitions: Option<Vec<ElementId>>,
    /// Inputs handed in by whatever resumed the node: task contract inputs,
    /// message payload, called process data
    pub trigger_inputs: BTreeMap<String, Value>,
    pub error_code: Option<String>,
    pub failure: Option<String>,
    pub executed_by: Option<UserId>,
    pub reached_state_date: DateTime<Utc>,
    pub last_update_date: DateTime<Utc>,
}

impl FlowNodeInstance {
    pub fn new(
        definition_id: ElementId,
        name: impl Into<String>,
        kind: FlowNodeKind,
        process_instance_id: ProcessInstanceId,
        root_process_instance_id: ProcessInstanceId,
        process_definition_id: DefinitionId,
    ) -> Self {
        let now = Utc::now();
        let state = FlowNodeState::Initializing;
        Self {
            id: 0,
            definition_id,
            name: name.into(),
            kind,
            state,
            process_instance_id,
            root_process_instance_id,
            process_definition_id,
            parent_activity_instance_id: None,
            loop_counter: None,
            state_executing: false,
            stable: state.is_stable(),
            terminal: state.is_terminal(),
            deleted: false,
            interrupt_request: None,
            triggered: false,
            taken_transitions: None,
            trigger_inputs: BTreeMap::new(),
            error_code: None,
            failure: None,
            executed_by: None,
            reached_state_date: now,
            last_update_date: now,
        }
    }

    pub fn node_type(&self) -> FlowNodeType {
        self.kind.node_type()
    }

    /// Moves to `state`, keeping the stable and terminal flags in step
    pub fn set_state(&mut self, state: FlowNodeState) {
        let now = Utc::now();
        self.state = state;
        self.stable = state.is_stable();
        self.terminal = state.is_terminal();
        self.reached_state_date = now;
        self.last_update_date = now;
    }

    /// Left inconsistent by an interrupted worker or waiting for its terminal bookkeeping
    pub fn needs_restart(&self) -> bool {
        !self.deleted && (self.state_executing || !self.stable || self.terminal)
    }

    /// Neither finished nor logically removed
    pub fn is_open(&self) -> bool {
        !self.deleted
    }

    pub fn as_assignable(&self) -> Option<&dyn Assignable> {
        match &self.kind {
            FlowNodeKind::UserTask(task) => Some(task),
            _ => None,
        }
    }

    pub fn as_assignable_mut(&mut self) -> Option<&mut dyn Assignable> {
        match &mut self.kind {
            FlowNodeKind::UserTask(task) => Some(task),
            _ => None,
        }
    }

    pub fn as_due_dated(&self) -> Option<&dyn HasDueDate> {
        match &self.kind {
            FlowNodeKind::UserTask(task) => Some(task),
            _ => None,
        }
    }

    pub fn priority(&self) -> Option<TaskPriority> {
        match &self.kind {
            FlowNodeKind::UserTask(task) => Some(task.priority),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedFlowNodeInstance {
    pub source_object_id: FlowNodeInstanceId,
    pub archive_date: DateTime<Utc>,
    pub node: FlowNodeInstance,
}

impl ArchivedFlowNodeInstance {
    pub fn from_instance(node: &FlowNodeInstance) -> Self {
        Self {
            source_object_id: node.id,
            archive_date: Utc::now(),
            node: node.clone(),
        }
    }
}

// ── Data ───────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(tag = "container", content = "id", rename_all = "snake_case")]
pub enum DataContainer {
    Process(ProcessInstanceId),
    Activity(FlowNodeInstanceId),
}

impl fmt::Display for DataContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataContainer::Process(id) => write!(f, "process instance {}", id),
            DataContainer::Activity(id) => write!(f, "activity instance {}", id),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataInstance {
    pub id: DataInstanceId,
    pub name: String,
    pub container: DataContainer,
    pub data_type: DataType,
    pub value: Value,
    pub transient: bool,
    pub last_update: DateTime<Utc>,
}

impl DataInstance {
    pub fn new(
        name: impl Into<String>,
        container: DataContainer,
        data_type: DataType,
        value: Value,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            container,
            data_type,
            value,
            transient: false,
            last_update: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ArchivedDataInstance {
    pub source_object_id: DataInstanceId,
    pub name: String,
    pub container: DataContainer,
    pub data_type: DataType,
    pub value: Value,
    pub archive_date: DateTime<Utc>,
}

impl ArchivedDataInstance {
    pub fn from_instance(data: &DataInstance) -> Self {
        Self {
            source_object_id: data.id,
            name: data.name.clone(),
            container: data.container,
            data_type: data.data_type.clone(),
            value: data.value.clone(),
            archive_date: Utc::now(),
        }
    }
}

// ── Events and messages ────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaitingEventType {
    Message,
    Timer,
    Signal,
}

/// What a waiting event resumes once it fires
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "target", rename_all = "snake_case")]
pub enum EventTarget {
    /// Catch event or boundary event waiting in an instance
    FlowNode { flow_node_id: FlowNodeInstanceId },
    /// Start event of an enabled definition; firing starts a new instance
    ProcessStart {
        definition_id: DefinitionId,
        start_event: ElementId,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WaitingEvent {
    pub id: WaitingEventId,
    pub event_type: WaitingEventType,
    /// Message or signal name; the timer's flow node name for timers
    pub name: String,
    pub process_name: String,
    pub flow_node_name: String,
    pub target: EventTarget,
    pub correlations: BTreeMap<String, String>,
    pub due_date: Option<DateTime<Utc>>,
    pub in_progress: bool,
    pub creation_date: DateTime<Utc>,
}

impl WaitingEvent {
    pub fn new(
        event_type: WaitingEventType,
        name: impl Into<String>,
        process_name: impl Into<String>,
        flow_node_name: impl Into<String>,
        target: EventTarget,
    ) -> Self {
        Self {
            id: 0,
            event_type,
            name: name.into(),
            process_name: process_name.into(),
            flow_node_name: flow_node_name.into(),
            target,
            correlations: BTreeMap::new(),
            due_date: None,
            in_progress: false,
            creation_date: Utc::now(),
        }
    }

    pub fn flow_node_id(&self) -> Option<FlowNodeInstanceId> {
        match self.target {
            EventTarget::FlowNode { flow_node_id } => Some(flow_node_id),
            EventTarget::ProcessStart { .. } => None,
        }
    }

    /// Same name, same target process and flow node, identical correlation values
    pub fn matches(&self, message: &MessageInstance) -> bool {
        self.event_type == WaitingEventType::Message
            && self.name == message.name
            && self.process_name == message.target_process
            && self.flow_node_name == message.target_flow_node
            && self.correlations == message.correlations
    }

    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.event_type == WaitingEventType::Timer
            && self.due_date.map_or(false, |due| due <= now)
    }
}

impl HasDueDate for WaitingEvent {
    fn due_date(&self) -> Option<DateTime<Utc>> {
        self.due_date
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MessageInstance {
    pub id: MessageInstanceId,
    pub name: String,
    pub target_process: String,
    pub target_flow_node: String,
    pub correlations: BTreeMap<String, String>,
    pub payload: BTreeMap<String, Value>,
    pub handled: bool,
    pub creation_date: DateTime<Utc>,
}

impl MessageInstance {
    pub fn new(
        name: impl Into<String>,
        target_process: impl Into<String>,
        target_flow_node: impl Into<String>,
    ) -> Self {
        Self {
            id: 0,
            name: name.into(),
            target_process: target_process.into(),
            target_flow_node: target_flow_node.into(),
            correlations: BTreeMap::new(),
            payload: BTreeMap::new(),
            handled: false,
            creation_date: Utc::now(),
        }
    }

    pub fn with_correlation(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.correlations.insert(key.into(), value.into());
        self
    }

    pub fn with_payload(mut self, name: impl Into<String>, value: Value) -> Self {
        self.payload.insert(name.into(), value);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn node() -> FlowNodeInstance {
        FlowNodeInstance::new(Uuid::new_v4(), "step", FlowNodeKind::AutomaticTask, 1, 1, Uuid::new_v4())
    }

    #[test]
    fn test_state_drives_flags() {
        let mut n = node();
        assert!(!n.stable && !n.terminal);

        n.set_state(FlowNodeState::Ready);
        assert!(n.stable && !n.terminal);

        n.set_state(FlowNodeState::Executing);
        assert!(!n.stable);

        n.set_state(FlowNodeState::Failed);
        assert!(n.stable && n.terminal);
    }

    #[test]
    fn test_restart_predicate() {
        let mut n = node();
        n.set_state(FlowNodeState::Waiting);
        assert!(!n.needs_restart());

        n.state_executing = true;
        assert!(n.needs_restart());

        n.state_executing = false;
        n.set_state(FlowNodeState::Completed);
        assert!(n.needs_restart());

        n.deleted = true;
        assert!(!n.needs_restart());
    }

    #[test]
    fn test_state_names_round_trip() {
        for state in [
            FlowNodeState::Initializing,
            FlowNodeState::CancellingSubtasks,
            FlowNodeState::Skipped,
        ] {
            assert_eq!(state.to_string().parse::<FlowNodeState>().unwrap(), state);
        }
        assert_eq!(
            "error".parse::<ProcessInstanceState>().unwrap(),
            ProcessInstanceState::Error
        );
    }

    #[test]
    fn test_message_matching_requires_identical_correlations() {
        let mut event = WaitingEvent::new(
            WaitingEventType::Message,
            "paid",
            "Order",
            "Wait payment",
            EventTarget::FlowNode { flow_node_id: 7 },
        );
        event.correlations.insert("orderId".into(), "42".into());

        let message = MessageInstance::new("paid", "Order", "Wait payment").with_correlation("orderId", "42");
        assert!(event.matches(&message));

        let other = MessageInstance::new("paid", "Order", "Wait payment").with_correlation("orderId", "43");
        assert!(!event.matches(&other));

        let extra = message.clone().with_correlation("region", "eu");
        assert!(!event.matches(&extra));
    }
}
