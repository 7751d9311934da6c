use crate::contract::ContractDefinition;
use crate::expression::Expression;
use crate::instance::UserId;
use crate::operation::{Operation, STRING_INDEX_SLOTS};
use crate::value::DataType;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub type DefinitionId = Uuid;
pub type ElementId = Uuid;

/// Immutable process template: flow elements, data, documents, labels and contract
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessDefinition {
    pub id: DefinitionId,
    pub name: String,
    pub version: String,
    pub description: Option<String>,
    pub flow_nodes: Vec<FlowNodeDefinition>,
    pub transitions: Vec<TransitionDefinition>,
    #[serde(default)]
    pub data: Vec<DataDefinition>,
    #[serde(default)]
    pub documents: Vec<DocumentDefinition>,
    #[serde(default)]
    pub string_indexes: [Option<StringIndexDefinition>; STRING_INDEX_SLOTS],
    #[serde(default)]
    pub contract: ContractDefinition,
    #[serde(default)]
    pub supervisors: Vec<UserId>,
}

impl ProcessDefinition {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            version: version.into(),
            description: None,
            flow_nodes: Vec::new(),
            transitions: Vec::new(),
            data: Vec::new(),
            documents: Vec::new(),
            string_indexes: Default::default(),
            contract: ContractDefinition::default(),
            supervisors: Vec::new(),
        }
    }

    pub fn add_node(&mut self, node: FlowNodeDefinition) -> ElementId {
        let id = node.id;
        self.flow_nodes.push(node);
        id
    }

    pub fn connect(&mut self, source: ElementId, target: ElementId) -> ElementId {
        self.add_transition(TransitionDefinition::new(source, target))
    }

    pub fn connect_when(
        &mut self,
        source: ElementId,
        target: ElementId,
        condition: Expression,
    ) -> ElementId {
        let mut transition = TransitionDefinition::new(source, target);
        transition.condition = Some(condition);
        self.add_transition(transition)
    }

    pub fn connect_default(&mut self, source: ElementId, target: ElementId) -> ElementId {
        let mut transition = TransitionDefinition::new(source, target);
        transition.default = true;
        self.add_transition(transition)
    }

    pub fn add_transition(&mut self, transition: TransitionDefinition) -> ElementId {
        let id = transition.id;
        self.transitions.push(transition);
        id
    }

    pub fn with_data(mut self, data: DataDefinition) -> Self {
        self.data.push(data);
        self
    }

    pub fn with_document(mut self, document: DocumentDefinition) -> Self {
        self.documents.push(document);
        self
    }

    pub fn with_contract(mut self, contract: ContractDefinition) -> Self {
        self.contract = contract;
        self
    }

    pub fn with_supervisor(mut self, user_id: UserId) -> Self {
        self.supervisors.push(user_id);
        self
    }

    /// Slots are numbered 1 to 5; out-of-range slots are ignored.
    pub fn with_string_index(
        mut self,
        slot: usize,
        label: impl Into<String>,
        value: Option<Expression>,
    ) -> Self {
        if (1..=STRING_INDEX_SLOTS).contains(&slot) {
            self.string_indexes[slot - 1] = Some(StringIndexDefinition {
                label: label.into(),
                value,
            });
        }
        self
    }

    pub fn find_node(&self, id: ElementId) -> Option<&FlowNodeDefinition> {
        self.flow_nodes.iter().find(|n| n.id == id)
    }

    pub fn find_node_by_name(&self, name: &str) -> Option<&FlowNodeDefinition> {
        self.flow_nodes.iter().find(|n| n.name == name)
    }

    pub fn find_transition(&self, id: ElementId) -> Option<&TransitionDefinition> {
        self.transitions.iter().find(|t| t.id == id)
    }

    pub fn incoming(&self, node: ElementId) -> impl Iterator<Item = &TransitionDefinition> {
        self.transitions.iter().filter(move |t| t.target == node)
    }

    pub fn outgoing(&self, node: ElementId) -> impl Iterator<Item = &TransitionDefinition> {
        self.transitions.iter().filter(move |t| t.source == node)
    }

    pub fn boundary_events_of(
        &self,
        activity: ElementId,
    ) -> impl Iterator<Item = &FlowNodeDefinition> {
        self.flow_nodes.iter().filter(move |n| {
            matches!(n.kind, FlowNodeDefinitionKind::BoundaryEvent { attached_to, .. } if attached_to == activity)
        })
    }

    /// Nodes seeded when an instance starts without a trigger: no incoming
    /// transitions, not a boundary event, not a message/signal start event.
    pub fn initial_nodes(&self) -> Vec<&FlowNodeDefinition> {
        self.flow_nodes
            .iter()
            .filter(|n| self.incoming(n.id).next().is_none())
            .filter(|n| match &n.kind {
                FlowNodeDefinitionKind::BoundaryEvent { .. } => false,
                FlowNodeDefinitionKind::StartEvent(trigger) => trigger.is_none(),
                _ => true,
            })
            .collect()
    }

    pub fn find_data(&self, name: &str) -> Option<&DataDefinition> {
        self.data.iter().find(|d| d.name == name)
    }

    pub fn find_document(&self, name: &str) -> Option<&DocumentDefinition> {
        self.documents.iter().find(|d| d.name == name)
    }

    pub fn string_index_labels(&self) -> [Option<String>; STRING_INDEX_SLOTS] {
        std::array::from_fn(|i| self.string_indexes[i].as_ref().map(|s| s.label.clone()))
    }
}

/// Node specification in a process definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowNodeDefinition {
    pub id: ElementId,
    pub name: String,
    pub kind: FlowNodeDefinitionKind,
    #[serde(default)]
    pub operations: Vec<Operation>,
    /// Activity-scoped data
    #[serde(default)]
    pub data: Vec<DataDefinition>,
    pub loop_characteristics: Option<LoopCharacteristics>,
}

impl FlowNodeDefinition {
    pub fn new(name: impl Into<String>, kind: FlowNodeDefinitionKind) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            kind,
            operations: Vec::new(),
            data: Vec::new(),
            loop_characteristics: None,
        }
    }

    pub fn automatic_task(name: impl Into<String>) -> Self {
        Self::new(name, FlowNodeDefinitionKind::AutomaticTask)
    }

    pub fn user_task(name: impl Into<String>, actor: impl Into<String>) -> Self {
        Self::new(
            name,
            FlowNodeDefinitionKind::UserTask(UserTaskDefinition::new(actor)),
        )
    }

    pub fn call_activity(name: impl Into<String>, process_name: impl Into<String>) -> Self {
        Self::new(
            name,
            FlowNodeDefinitionKind::CallActivity(CallActivityDefinition {
                process_name: process_name.into(),
                process_version: None,
                input_mappings: Vec::new(),
            }),
        )
    }

    pub fn gateway(name: impl Into<String>, gateway_type: GatewayType) -> Self {
        Self::new(name, FlowNodeDefinitionKind::Gateway(gateway_type))
    }

    pub fn start_event(name: impl Into<String>) -> Self {
        Self::new(name, FlowNodeDefinitionKind::StartEvent(None))
    }

    pub fn triggered_start_event(name: impl Into<String>, trigger: EventTrigger) -> Self {
        Self::new(name, FlowNodeDefinitionKind::StartEvent(Some(trigger)))
    }

    pub fn catch_event(name: impl Into<String>, trigger: EventTrigger) -> Self {
        Self::new(name, FlowNodeDefinitionKind::IntermediateCatchEvent(trigger))
    }

    pub fn throw_message(name: impl Into<String>, message: ThrowMessage) -> Self {
        Self::new(name, FlowNodeDefinitionKind::IntermediateThrowEvent(message))
    }

    pub fn boundary_event(
        name: impl Into<String>,
        attached_to: ElementId,
        trigger: EventTrigger,
        interrupting: bool,
    ) -> Self {
        Self::new(
            name,
            FlowNodeDefinitionKind::BoundaryEvent {
                attached_to,
                trigger,
                interrupting,
            },
        )
    }

    pub fn end_event(name: impl Into<String>) -> Self {
        Self::new(name, FlowNodeDefinitionKind::EndEvent(EndEventResult::None))
    }

    pub fn terminate_end_event(name: impl Into<String>) -> Self {
        Self::new(name, FlowNodeDefinitionKind::EndEvent(EndEventResult::Terminate))
    }

    pub fn error_end_event(name: impl Into<String>, code: impl Into<String>) -> Self {
        Self::new(
            name,
            FlowNodeDefinitionKind::EndEvent(EndEventResult::Error { code: code.into() }),
        )
    }

    pub fn with_operation(mut self, operation: Operation) -> Self {
        self.operations.push(operation);
        self
    }

    pub fn with_data(mut self, data: DataDefinition) -> Self {
        self.data.push(data);
        self
    }

    pub fn with_loop(mut self, characteristics: LoopCharacteristics) -> Self {
        self.loop_characteristics = Some(characteristics);
        self
    }

    /// Activities can carry boundary events, loops and activity data
    pub fn is_activity(&self) -> bool {
        matches!(
            self.kind,
            FlowNodeDefinitionKind::AutomaticTask
                | FlowNodeDefinitionKind::UserTask(_)
                | FlowNodeDefinitionKind::CallActivity(_)
        )
    }

    pub fn find_data(&self, name: &str) -> Option<&DataDefinition> {
        self.data.iter().find(|d| d.name == name)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "spec")]
pub enum FlowNodeDefinitionKind {
    AutomaticTask,
    UserTask(UserTaskDefinition),
    CallActivity(CallActivityDefinition),
    Gateway(GatewayType),
    StartEvent(Option<EventTrigger>),
    IntermediateCatchEvent(EventTrigger),
    IntermediateThrowEvent(ThrowMessage),
    BoundaryEvent {
        attached_to: ElementId,
        trigger: EventTrigger,
        interrupting: bool,
    },
    EndEvent(EndEventResult),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserTaskDefinition {
    pub actor: String,
    #[serde(default)]
    pub priority: TaskPriority,
    pub expected_duration_ms: Option<u64>,
    #[serde(default)]
    pub contract: ContractDefinition,
}

impl UserTaskDefinition {
    pub fn new(actor: impl Into<String>) -> Self {
        Self {
            actor: actor.into(),
            priority: TaskPriority::default(),
            expected_duration_ms: None,
            contract: ContractDefinition::default(),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskPriority {
    Lowest,
    UnderNormal,
    #[default]
    Normal,
    AboveNormal,
    Highest,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallActivityDefinition {
    pub process_name: String,
    /// Latest enabled version when absent
    pub process_version: Option<String>,
    /// Initial values of the called process data, evaluated in the caller
    #[serde(default)]
    pub input_mappings: Vec<DataMapping>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataMapping {
    pub name: String,
    pub expression: Expression,
}

impl DataMapping {
    pub fn new(name: impl Into<String>, expression: Expression) -> Self {
        Self {
            name: name.into(),
            expression,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayType {
    Parallel,
    Exclusive,
    Inclusive,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "trigger")]
pub enum EventTrigger {
    Message(MessageTrigger),
    Timer(TimerDefinition),
    Signal { name: String },
    /// `None` catches every error code
    Error { code: Option<String> },
}

impl EventTrigger {
    pub fn message(name: impl Into<String>) -> Self {
        EventTrigger::Message(MessageTrigger {
            name: name.into(),
            correlations: Vec::new(),
        })
    }

    pub fn message_correlated(name: impl Into<String>, correlations: Vec<Correlation>) -> Self {
        EventTrigger::Message(MessageTrigger {
            name: name.into(),
            correlations,
        })
    }

    pub fn timer_duration(milliseconds: Expression) -> Self {
        EventTrigger::Timer(TimerDefinition {
            kind: TimerKind::Duration,
            expression: milliseconds,
        })
    }

    pub fn timer_date(date: Expression) -> Self {
        EventTrigger::Timer(TimerDefinition {
            kind: TimerKind::Date,
            expression: date,
        })
    }

    pub fn signal(name: impl Into<String>) -> Self {
        EventTrigger::Signal { name: name.into() }
    }

    pub fn error(code: Option<&str>) -> Self {
        EventTrigger::Error {
            code: code.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageTrigger {
    pub name: String,
    #[serde(default)]
    pub correlations: Vec<Correlation>,
}

/// Correlation key whose value is evaluated when the event is registered or thrown
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Correlation {
    pub key: String,
    pub value: Expression,
}

impl Correlation {
    pub fn new(key: impl Into<String>, value: Expression) -> Self {
        Self {
            key: key.into(),
            value,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerDefinition {
    pub kind: TimerKind,
    pub expression: Expression,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// Expression yields milliseconds from registration
    Duration,
    /// Expression yields an absolute date
    Date,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThrowMessage {
    pub name: String,
    pub target_process: String,
    pub target_flow_node: String,
    #[serde(default)]
    pub correlations: Vec<Correlation>,
    #[serde(default)]
    pub content: Vec<DataMapping>,
}

impl ThrowMessage {
    pub fn new(
        name: impl Into<String>,
        target_process: impl Into<String>,
        target_flow_node: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            target_process: target_process.into(),
            target_flow_node: target_flow_node.into(),
            correlations: Vec::new(),
            content: Vec::new(),
        }
    }

    pub fn with_correlation(mut self, key: impl Into<String>, value: Expression) -> Self {
        self.correlations.push(Correlation::new(key, value));
        self
    }

    pub fn with_content(mut self, name: impl Into<String>, value: Expression) -> Self {
        self.content.push(DataMapping::new(name, value));
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "result")]
pub enum EndEventResult {
    None,
    Terminate,
    Error { code: String },
    Message(ThrowMessage),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "loop")]
pub enum LoopCharacteristics {
    MultiInstance(MultiInstanceDefinition),
    StandardLoop(StandardLoopDefinition),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MultiInstanceDefinition {
    pub sequential: bool,
    /// Number of instances; ignored when `collection_data` is set
    pub cardinality: Option<Expression>,
    /// List data iterated over, one instance per item
    pub collection_data: Option<String>,
    /// Activity data receiving the current item
    pub input_item: Option<String>,
    /// Evaluated after each instance; when true the remaining instances are aborted
    pub completion_condition: Option<Expression>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StandardLoopDefinition {
    pub condition: Expression,
    #[serde(default)]
    pub test_before: bool,
    pub max_iterations: Option<u32>,
}

/// Connection between flow nodes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionDefinition {
    pub id: ElementId,
    pub name: Option<String>,
    pub source: ElementId,
    pub target: ElementId,
    pub condition: Option<Expression>,
    #[serde(default)]
    pub default: bool,
}

impl TransitionDefinition {
    pub fn new(source: ElementId, target: ElementId) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: None,
            source,
            target,
            condition: None,
            default: false,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataDefinition {
    pub name: String,
    pub data_type: DataType,
    pub default_value: Option<Expression>,
    #[serde(default)]
    pub transient: bool,
    pub description: Option<String>,
}

impl DataDefinition {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
            default_value: None,
            transient: false,
            description: None,
        }
    }

    pub fn with_default(mut self, expression: Expression) -> Self {
        self.default_value = Some(expression);
        self
    }

    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentDefinition {
    pub name: String,
    #[serde(default)]
    pub multiple: bool,
    pub initial_value: Option<Expression>,
    pub description: Option<String>,
}

impl DocumentDefinition {
    pub fn single(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            multiple: false,
            initial_value: None,
            description: None,
        }
    }

    pub fn list(name: impl Into<String>) -> Self {
        Self {
            multiple: true,
            ..Self::single(name)
        }
    }

    pub fn with_initial_value(mut self, expression: Expression) -> Self {
        self.initial_value = Some(expression);
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StringIndexDefinition {
    pub label: String,
    pub value: Option<Expression>,
}
