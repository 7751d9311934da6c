use crate::expression::Expression;
use serde::{Deserialize, Serialize};
use std::fmt;

pub const STRING_INDEX_SLOTS: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LeftOperandKind {
    Data,
    TransientData,
    Document,
    DocumentList,
    StringIndex,
    ExternalData,
}

impl fmt::Display for LeftOperandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LeftOperandKind::Data => "data",
            LeftOperandKind::TransientData => "transient data",
            LeftOperandKind::Document => "document",
            LeftOperandKind::DocumentList => "document list",
            LeftOperandKind::StringIndex => "string index",
            LeftOperandKind::ExternalData => "external data",
        };
        write!(f, "{}", name)
    }
}

/// Named target of an operation
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LeftOperand {
    pub name: String,
    pub kind: LeftOperandKind,
}

impl LeftOperand {
    pub fn data(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: LeftOperandKind::Data,
        }
    }

    pub fn transient_data(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: LeftOperandKind::TransientData,
        }
    }

    pub fn document(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: LeftOperandKind::Document,
        }
    }

    pub fn document_list(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: LeftOperandKind::DocumentList,
        }
    }

    /// Slots are numbered 1 to 5
    pub fn string_index(slot: usize) -> Self {
        Self {
            name: slot.to_string(),
            kind: LeftOperandKind::StringIndex,
        }
    }

    pub fn external_data(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            kind: LeftOperandKind::ExternalData,
        }
    }

    /// Zero-based slot position for string-index operands
    pub fn string_index_position(&self) -> Option<usize> {
        match self.kind {
            LeftOperandKind::StringIndex => self
                .name
                .parse::<usize>()
                .ok()
                .filter(|slot| (1..=STRING_INDEX_SLOTS).contains(slot))
                .map(|slot| slot - 1),
            _ => None,
        }
    }
}

impl fmt::Display for LeftOperand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} '{}'", self.kind, self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatorType {
    Assignment,
    /// Registered method invoked on the current value, which is mutated in place
    #[serde(rename = "JAVA_METHOD")]
    MethodCall,
    XpathUpdateQuery,
    DocumentCreateUpdate,
    DocumentListSet,
}

impl fmt::Display for OperatorType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            OperatorType::Assignment => "ASSIGNMENT",
            OperatorType::MethodCall => "JAVA_METHOD",
            OperatorType::XpathUpdateQuery => "XPATH_UPDATE_QUERY",
            OperatorType::DocumentCreateUpdate => "DOCUMENT_CREATE_UPDATE",
            OperatorType::DocumentListSet => "DOCUMENT_LIST_SET",
        };
        write!(f, "{}", name)
    }
}

/// A single data mutation attached to a flow node definition
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Operation {
    pub left_operand: LeftOperand,
    pub operator_type: OperatorType,
    /// `"="` for assignments, the method name for method calls, the XPath for updates
    pub operator: String,
    /// Argument type of a method call
    pub operator_input_type: Option<String>,
    pub right_operand: Option<Expression>,
}

impl Operation {
    pub fn assign(left_operand: LeftOperand, expression: Expression) -> Self {
        Self {
            left_operand,
            operator_type: OperatorType::Assignment,
            operator: "=".to_string(),
            operator_input_type: None,
            right_operand: Some(expression),
        }
    }

    pub fn assign_data(name: impl Into<String>, expression: Expression) -> Self {
        Self::assign(LeftOperand::data(name), expression)
    }

    pub fn method_call(
        data: impl Into<String>,
        method: impl Into<String>,
        argument_type: Option<&str>,
        expression: Expression,
    ) -> Self {
        Self {
            left_operand: LeftOperand::data(data),
            operator_type: OperatorType::MethodCall,
            operator: method.into(),
            operator_input_type: argument_type.map(str::to_string),
            right_operand: Some(expression),
        }
    }

    pub fn xpath_update(
        data: impl Into<String>,
        xpath: impl Into<String>,
        expression: Expression,
    ) -> Self {
        Self {
            left_operand: LeftOperand::data(data),
            operator_type: OperatorType::XpathUpdateQuery,
            operator: xpath.into(),
            operator_input_type: None,
            right_operand: Some(expression),
        }
    }

    pub fn set_document(name: impl Into<String>, expression: Expression) -> Self {
        Self {
            left_operand: LeftOperand::document(name),
            operator_type: OperatorType::DocumentCreateUpdate,
            operator: "=".to_string(),
            operator_input_type: None,
            right_operand: Some(expression),
        }
    }

    pub fn set_document_list(name: impl Into<String>, expression: Expression) -> Self {
        Self {
            left_operand: LeftOperand::document_list(name),
            operator_type: OperatorType::DocumentListSet,
            operator: "=".to_string(),
            operator_input_type: None,
            right_operand: Some(expression),
        }
    }

    pub fn set_string_index(slot: usize, expression: Expression) -> Self {
        Self::assign(LeftOperand::string_index(slot), expression)
    }

    /// `receiver.method(argument)` rendering used in errors and method-table keys
    pub fn signature(&self, receiver: &str) -> String {
        format!(
            "{}.{}({})",
            receiver,
            self.operator,
            self.operator_input_type.as_deref().unwrap_or("")
        )
    }
}
