use crate::xml::XmlError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("Not found: {0}")]
    NotFound(#[from] NotFound),

    #[error("Validation failed: {0}")]
    Validation(#[from] ValidationError),

    #[error("Execution error: {0}")]
    Execution(#[from] FlowNodeExecutionError),

    #[error("Concurrent modification: {0}")]
    Conflict(String),

    #[error("Engine is not ready: startup recovery has not run")]
    NotReady,

    #[error("Store error: {0}")]
    Store(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl EngineError {
    pub fn validation(message: impl Into<String>) -> Self {
        EngineError::Validation(ValidationError::single(message))
    }

    /// Lost compare-and-set races are retried by the worker, never surfaced.
    pub fn is_conflict(&self) -> bool {
        matches!(self, EngineError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum NotFound {
    #[error("process definition {0}")]
    ProcessDefinition(String),

    #[error("process instance {0}")]
    ProcessInstance(u64),

    #[error("archived process instance {0}")]
    ArchivedProcessInstance(u64),

    #[error("flow node instance {0}")]
    FlowNode(u64),

    #[error("data '{name}' in {container}")]
    Data { name: String, container: String },

    #[error("document '{name}' in process instance {process_instance_id}")]
    Document {
        name: String,
        process_instance_id: u64,
    },

    #[error("ready user task '{name}' in process instance {process_instance_id}")]
    UserTask {
        name: String,
        process_instance_id: u64,
    },

    #[error("waiting event {0}")]
    WaitingEvent(u64),

    #[error("message instance {0}")]
    Message(u64),
}

/// Every rule that failed, never just the first one.
#[derive(Error, Debug, Clone, PartialEq)]
#[error("{}", violations.join("; "))]
pub struct ValidationError {
    pub violations: Vec<String>,
}

impl ValidationError {
    pub fn new(violations: Vec<String>) -> Self {
        Self { violations }
    }

    pub fn single(message: impl Into<String>) -> Self {
        Self {
            violations: vec![message.into()],
        }
    }

    /// `Ok(())` when nothing was collected.
    pub fn check(violations: Vec<String>) -> Result<(), ValidationError> {
        if violations.is_empty() {
            Ok(())
        } else {
            Err(Self { violations })
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
#[error("flow node {flow_node_id}: {message}")]
pub struct FlowNodeExecutionError {
    pub flow_node_id: u64,
    pub message: String,
    #[source]
    pub cause: Option<ExecutionCause>,
}

impl FlowNodeExecutionError {
    pub fn new(flow_node_id: u64, message: impl Into<String>) -> Self {
        Self {
            flow_node_id,
            message: message.into(),
            cause: None,
        }
    }

    pub fn caused_by(flow_node_id: u64, cause: impl Into<ExecutionCause>) -> Self {
        let cause = cause.into();
        Self {
            flow_node_id,
            message: cause.to_string(),
            cause: Some(cause),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExecutionCause {
    #[error(transparent)]
    Operation(#[from] OperationError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ExpressionError {
    #[error("No evaluator registered for expression kind '{0}'")]
    NoEvaluator(String),

    #[error("Unknown data '{0}'")]
    UnknownData(String),

    #[error("Unknown document '{0}'")]
    UnknownDocument(String),

    #[error("Engine constant '{0}' is not available in this context")]
    UnavailableConstant(String),

    #[error("Invalid constant '{content}' for type {expected}")]
    InvalidConstant { content: String, expected: String },

    #[error("Expression '{name}' returned {actual}, expected {expected}")]
    ReturnTypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("Unknown script function '{0}'")]
    UnknownFunction(String),

    #[error("Invalid expression '{name}': {reason}")]
    Invalid { name: String, reason: String },

    #[error("Evaluation of '{name}' failed: {reason}")]
    Failed { name: String, reason: String },

    #[error("XML error: {0}")]
    Xml(#[from] XmlError),
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum OperationError {
    #[error("Operation on '{target}' has no right-hand expression")]
    MissingExpression { target: String },

    #[error("Unknown {kind} '{name}'")]
    UnknownTarget { kind: String, name: String },

    #[error("Type mismatch on '{name}': expected {expected}, got {actual}")]
    TypeMismatch {
        name: String,
        expected: String,
        actual: String,
    },

    #[error("No method registered for signature {signature}")]
    UnknownMethod { signature: String },

    #[error("Method {signature} failed: {reason}")]
    MethodFailed { signature: String, reason: String },

    #[error("Operator {operator} cannot target {target}")]
    Unsupported { operator: String, target: String },

    #[error(transparent)]
    Xml(#[from] XmlError),

    #[error(transparent)]
    Expression(#[from] ExpressionError),
}
