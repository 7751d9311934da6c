use crate::definition::DefinitionId;
use crate::instance::{FlowNodeInstanceId, ProcessInstanceId, UserId};
use crate::value::{DataType, Value};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Evaluator family an expression is dispatched to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpressionKind {
    /// `content` parsed as `return_type`
    Constant,
    /// Current value of the data named by `content`
    Variable,
    /// Contract input (or trigger payload entry) named by `content`
    ContractInput,
    /// One of [`EngineConstant`], named by `content`
    EngineConstant,
    DocumentReference,
    DocumentListReference,
    /// Dependencies collected into a list, in declaration order
    List,
    /// `content` is the comparator, dependencies are the operands
    Comparison,
    /// `${name}` placeholders in `content` replaced by dependency values
    Pattern,
    /// `content` is an XPath evaluated against the first dependency
    XPathRead,
    /// `content` names a registered script function, dependencies are its arguments
    Script,
}

impl ExpressionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExpressionKind::Constant => "constant",
            ExpressionKind::Variable => "variable",
            ExpressionKind::ContractInput => "contract_input",
            ExpressionKind::EngineConstant => "engine_constant",
            ExpressionKind::DocumentReference => "document_reference",
            ExpressionKind::DocumentListReference => "document_list_reference",
            ExpressionKind::List => "list",
            ExpressionKind::Comparison => "comparison",
            ExpressionKind::Pattern => "pattern",
            ExpressionKind::XPathRead => "xpath_read",
            ExpressionKind::Script => "script",
        }
    }
}

impl fmt::Display for ExpressionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Expression {
    pub name: String,
    pub kind: ExpressionKind,
    pub content: String,
    pub return_type: DataType,
    /// Evaluated first, in order; results are handed to the evaluator by name
    #[serde(default)]
    pub dependencies: Vec<Expression>,
}

impl Expression {
    pub fn new(
        name: impl Into<String>,
        kind: ExpressionKind,
        content: impl Into<String>,
        return_type: DataType,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            content: content.into(),
            return_type,
            dependencies: Vec::new(),
        }
    }

    pub fn with_dependency(mut self, dependency: Expression) -> Self {
        self.dependencies.push(dependency);
        self
    }

    pub fn constant(content: impl Into<String>, return_type: DataType) -> Self {
        let content = content.into();
        Self::new(content.clone(), ExpressionKind::Constant, content, return_type)
    }

    pub fn text(value: impl Into<String>) -> Self {
        Self::constant(value, DataType::Text)
    }

    pub fn boolean(value: bool) -> Self {
        Self::constant(value.to_string(), DataType::Boolean)
    }

    pub fn long(value: i64) -> Self {
        Self::constant(value.to_string(), DataType::Long)
    }

    pub fn double(value: f64) -> Self {
        Self::constant(value.to_string(), DataType::Double)
    }

    pub fn xml(content: impl Into<String>) -> Self {
        Self::constant(content, DataType::Xml)
    }

    pub fn variable(name: impl Into<String>, return_type: DataType) -> Self {
        let name = name.into();
        Self::new(name.clone(), ExpressionKind::Variable, name, return_type)
    }

    pub fn contract_input(name: impl Into<String>, return_type: DataType) -> Self {
        let name = name.into();
        Self::new(name.clone(), ExpressionKind::ContractInput, name, return_type)
    }

    pub fn engine_constant(constant: EngineConstant) -> Self {
        Self::new(
            constant.as_str(),
            ExpressionKind::EngineConstant,
            constant.as_str(),
            constant.return_type(),
        )
    }

    pub fn document(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(name.clone(), ExpressionKind::DocumentReference, name, DataType::Document)
    }

    pub fn document_list(name: impl Into<String>) -> Self {
        let name = name.into();
        Self::new(
            name.clone(),
            ExpressionKind::DocumentListReference,
            name,
            DataType::DocumentList,
        )
    }

    pub fn list(name: impl Into<String>, items: Vec<Expression>, return_type: DataType) -> Self {
        let mut expression = Self::new(name, ExpressionKind::List, "", return_type);
        expression.dependencies = items;
        expression
    }

    pub fn comparison(comparator: impl Into<String>, left: Expression, right: Expression) -> Self {
        let comparator = comparator.into();
        let name = format!("{} {} {}", left.name, comparator, right.name);
        Self::new(name, ExpressionKind::Comparison, comparator, DataType::Boolean)
            .with_dependency(left)
            .with_dependency(right)
    }

    pub fn negate(operand: Expression) -> Self {
        let name = format!("!{}", operand.name);
        Self::new(name, ExpressionKind::Comparison, "!", DataType::Boolean).with_dependency(operand)
    }

    pub fn pattern(template: impl Into<String>, dependencies: Vec<Expression>) -> Self {
        let template = template.into();
        let mut expression =
            Self::new(template.clone(), ExpressionKind::Pattern, template, DataType::Text);
        expression.dependencies = dependencies;
        expression
    }

    pub fn xpath_read(xpath: impl Into<String>, xml_data: impl Into<String>) -> Self {
        let xpath = xpath.into();
        Self::new(xpath.clone(), ExpressionKind::XPathRead, xpath, DataType::Text)
            .with_dependency(Expression::variable(xml_data, DataType::Xml))
    }

    pub fn script(
        function: impl Into<String>,
        arguments: Vec<Expression>,
        return_type: DataType,
    ) -> Self {
        let function = function.into();
        let mut expression =
            Self::new(function.clone(), ExpressionKind::Script, function, return_type);
        expression.dependencies = arguments;
        expression
    }

    /// This expression and every nested dependency, depth first
    pub fn walk(&self) -> Vec<&Expression> {
        let mut out = Vec::new();
        let mut stack = vec![self];
        while let Some(expr) = stack.pop() {
            out.push(expr);
            stack.extend(expr.dependencies.iter().rev());
        }
        out
    }
}

/// Values the engine itself provides to expressions
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EngineConstant {
    LoggedUserId,
    ProcessInstanceId,
    RootProcessInstanceId,
    ActivityInstanceId,
    ProcessDefinitionId,
    ProcessInitiatorId,
    LoopCounter,
    TaskAssigneeId,
}

impl EngineConstant {
    pub fn as_str(&self) -> &'static str {
        match self {
            EngineConstant::LoggedUserId => "loggedUserId",
            EngineConstant::ProcessInstanceId => "processInstanceId",
            EngineConstant::RootProcessInstanceId => "rootProcessInstanceId",
            EngineConstant::ActivityInstanceId => "activityInstanceId",
            EngineConstant::ProcessDefinitionId => "processDefinitionId",
            EngineConstant::ProcessInitiatorId => "processInitiatorId",
            EngineConstant::LoopCounter => "loopCounter",
            EngineConstant::TaskAssigneeId => "taskAssigneeId",
        }
    }

    pub fn return_type(&self) -> DataType {
        match self {
            EngineConstant::ProcessDefinitionId => DataType::Text,
            _ => DataType::Long,
        }
    }
}

impl FromStr for EngineConstant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "loggedUserId" => Ok(Self::LoggedUserId),
            "processInstanceId" => Ok(Self::ProcessInstanceId),
            "rootProcessInstanceId" => Ok(Self::RootProcessInstanceId),
            "activityInstanceId" => Ok(Self::ActivityInstanceId),
            "processDefinitionId" => Ok(Self::ProcessDefinitionId),
            "processInitiatorId" => Ok(Self::ProcessInitiatorId),
            "loopCounter" => Ok(Self::LoopCounter),
            "taskAssigneeId" => Ok(Self::TaskAssigneeId),
            _ => Err(format!("Unknown engine constant: {s}")),
        }
    }
}

/// Engine-provided values for one evaluation
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConstants {
    pub logged_user_id: UserId,
    pub process_instance_id: ProcessInstanceId,
    pub root_process_instance_id: ProcessInstanceId,
    pub process_definition_id: DefinitionId,
    pub process_initiator_id: UserId,
    pub activity_instance_id: Option<FlowNodeInstanceId>,
    pub loop_counter: Option<u32>,
    pub task_assignee_id: Option<UserId>,
}

impl EngineConstants {
    pub fn value(&self, constant: EngineConstant) -> Option<Value> {
        let as_long = |n: u64| Value::Long(n as i64);
        match constant {
            EngineConstant::LoggedUserId => Some(as_long(self.logged_user_id)),
            EngineConstant::ProcessInstanceId => Some(as_long(self.process_instance_id)),
            EngineConstant::RootProcessInstanceId => Some(as_long(self.root_process_instance_id)),
            EngineConstant::ProcessDefinitionId => {
                Some(Value::String(self.process_definition_id.to_string()))
            }
            EngineConstant::ProcessInitiatorId => Some(as_long(self.process_initiator_id)),
            EngineConstant::ActivityInstanceId => self.activity_instance_id.map(as_long),
            EngineConstant::LoopCounter => self.loop_counter.map(|n| Value::Long(n as i64)),
            EngineConstant::TaskAssigneeId => self.task_assignee_id.map(as_long),
        }
    }
}
