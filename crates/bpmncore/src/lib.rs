//! Core abstractions for the process engine
//!
//! This crate provides the definition, instance and expression types that
//! every other crate depends on. It has no runtime.

pub mod contract;
pub mod definition;
pub mod document;
mod error;
mod evaluator;
pub mod events;
pub mod expression;
pub mod instance;
pub mod operation;
mod registry;
mod value;
pub mod xml;

pub use contract::{ConstraintDefinition, ContractDefinition, InputDefinition, InputType};
pub use definition::{
    CallActivityDefinition, Correlation, DataDefinition, DataMapping, DefinitionId,
    DocumentDefinition, ElementId, EndEventResult, EventTrigger, FlowNodeDefinition,
    FlowNodeDefinitionKind, GatewayType, LoopCharacteristics, MessageTrigger,
    MultiInstanceDefinition, ProcessDefinition, StandardLoopDefinition, StringIndexDefinition,
    TaskPriority, ThrowMessage, TimerDefinition, TimerKind, TransitionDefinition,
    UserTaskDefinition,
};
pub use document::{Document, DocumentId, DocumentSlot, DocumentValue};
pub use error::{
    EngineError, ExecutionCause, ExpressionError, FlowNodeExecutionError, NotFound,
    OperationError, ValidationError,
};
pub use evaluator::{EvaluationContext, ExpressionEvaluator};
pub use events::{EngineEvent, EventBus};
pub use expression::{EngineConstant, EngineConstants, Expression, ExpressionKind};
pub use instance::{
    ArchivedDataInstance, ArchivedFlowNodeInstance, ArchivedProcessInstance, Assignable,
    DataContainer, DataInstance, DataInstanceId, EventTarget, FlowNodeInstance,
    FlowNodeInstanceId, FlowNodeInterruption, FlowNodeKind, FlowNodeState, FlowNodeType,
    HasDueDate, HumanTask, Interruption, MessageInstance, MessageInstanceId, ProcessInstance,
    ProcessInstanceId, ProcessInstanceState, UserId, WaitingEvent, WaitingEventId,
    WaitingEventType,
};
pub use operation::{LeftOperand, LeftOperandKind, Operation, OperatorType, STRING_INDEX_SLOTS};
pub use registry::{EvaluatorRegistry, MethodHandler, MethodSignature};
pub use value::{DataType, ObjectValue, Value};
pub use xml::{XmlDocument, XmlElement, XmlError, XmlNode, XmlReplacement};

/// Result type for engine operations
pub type Result<T> = std::result::Result<T, EngineError>;
