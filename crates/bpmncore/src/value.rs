use crate::document::DocumentValue;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Dynamic value held by data instances, contract inputs and expression results
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "value")]
pub enum Value {
    Null,
    Bool(bool),
    Long(i64),
    Double(f64),
    String(String),
    Date(DateTime<Utc>),
    Xml(String),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Object(ObjectValue),
    Document(DocumentValue),
}

/// Instance of a user-declared business type
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ObjectValue {
    pub class_name: String,
    pub fields: BTreeMap<String, Value>,
}

impl ObjectValue {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            fields: BTreeMap::new(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(name.into(), value.into());
        self
    }
}

impl Value {
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(s) | Value::Xml(s) => Some(s),
            _ => None,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Long(n) => Some(*n),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Double(n) => Some(*n),
            Value::Long(n) => Some(*n as f64),
            _ => None,
        }
    }

    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Value::Bool(b) => Some(*b),
            _ => None,
        }
    }

    pub fn as_list(&self) -> Option<&[Value]> {
        match self {
            Value::List(items) => Some(items),
            _ => None,
        }
    }

    pub fn as_document(&self) -> Option<&DocumentValue> {
        match self {
            Value::Document(doc) => Some(doc),
            _ => None,
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn type_name(&self) -> &str {
        match self {
            Value::Null => "null",
            Value::Bool(_) => "boolean",
            Value::Long(_) => "long",
            Value::Double(_) => "double",
            Value::String(_) => "text",
            Value::Date(_) => "date",
            Value::Xml(_) => "xml",
            Value::List(_) => "list",
            Value::Map(_) => "map",
            Value::Object(obj) => &obj.class_name,
            Value::Document(_) => "document",
        }
    }

    /// Text rendering used for string indexes, correlation keys and XML content.
    /// `Null` has no text.
    pub fn to_text(&self) -> Option<String> {
        match self {
            Value::Null => None,
            Value::Bool(b) => Some(b.to_string()),
            Value::Long(n) => Some(n.to_string()),
            Value::Double(n) => Some(n.to_string()),
            Value::String(s) | Value::Xml(s) => Some(s.clone()),
            Value::Date(d) => Some(d.to_rfc3339()),
            Value::Document(doc) => doc.file_name.clone(),
            other => serde_json::to_string(other).ok(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.to_text() {
            Some(text) => write!(f, "{}", text),
            None => write!(f, "null"),
        }
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

impl From<f64> for Value {
    fn from(n: f64) -> Self {
        Value::Double(n)
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Long(n)
    }
}

impl From<bool> for Value {
    fn from(b: bool) -> Self {
        Value::Bool(b)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(d: DateTime<Utc>) -> Self {
        Value::Date(d)
    }
}

impl From<Vec<Value>> for Value {
    fn from(items: Vec<Value>) -> Self {
        Value::List(items)
    }
}

impl From<ObjectValue> for Value {
    fn from(obj: ObjectValue) -> Self {
        Value::Object(obj)
    }
}

impl From<DocumentValue> for Value {
    fn from(doc: DocumentValue) -> Self {
        Value::Document(doc)
    }
}

impl From<serde_json::Value> for Value {
    fn from(json: serde_json::Value) -> Self {
        match json {
            serde_json::Value::Null => Value::Null,
            serde_json::Value::Bool(b) => Value::Bool(b),
            serde_json::Value::Number(n) => match n.as_i64() {
                Some(i) => Value::Long(i),
                None => Value::Double(n.as_f64().unwrap_or_default()),
            },
            serde_json::Value::String(s) => Value::String(s),
            serde_json::Value::Array(items) => {
                Value::List(items.into_iter().map(Value::from).collect())
            }
            serde_json::Value::Object(obj) => {
                Value::Map(obj.into_iter().map(|(k, v)| (k, Value::from(v))).collect())
            }
        }
    }
}

/// Declared type of a data definition, contract-free expression result or method receiver
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    Any,
    Text,
    Boolean,
    Long,
    Double,
    Date,
    Xml,
    List,
    Map,
    Object { class_name: String },
    Document,
    DocumentList,
}

impl DataType {
    pub fn object(class_name: impl Into<String>) -> Self {
        DataType::Object {
            class_name: class_name.into(),
        }
    }

    /// Name used as the receiver type in method-call signatures
    pub fn type_name(&self) -> &str {
        match self {
            DataType::Any => "any",
            DataType::Text => "text",
            DataType::Boolean => "boolean",
            DataType::Long => "long",
            DataType::Double => "double",
            DataType::Date => "date",
            DataType::Xml => "xml",
            DataType::List => "list",
            DataType::Map => "map",
            DataType::Object { class_name } => class_name,
            DataType::Document => "document",
            DataType::DocumentList => "document_list",
        }
    }

    /// Whether a value may be stored in data of this type. `Null` is always accepted.
    pub fn accepts(&self, value: &Value) -> bool {
        match (self, value) {
            (_, Value::Null) | (DataType::Any, _) => true,
            (DataType::Text, Value::String(_)) => true,
            (DataType::Boolean, Value::Bool(_)) => true,
            (DataType::Long, Value::Long(_)) => true,
            (DataType::Double, Value::Double(_)) => true,
            (DataType::Date, Value::Date(_)) => true,
            (DataType::Xml, Value::Xml(_) | Value::String(_)) => true,
            (DataType::List, Value::List(_)) => true,
            (DataType::Map, Value::Map(_)) => true,
            (DataType::Object { class_name }, Value::Object(obj)) => &obj.class_name == class_name,
            (DataType::Document, Value::Document(_)) => true,
            (DataType::DocumentList, Value::List(items)) => {
                items.iter().all(|item| matches!(item, Value::Document(_)))
            }
            _ => false,
        }
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.type_name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_null_accepted_by_every_type() {
        for data_type in [DataType::Text, DataType::Long, DataType::List, DataType::object("Invoice")] {
            assert!(data_type.accepts(&Value::Null));
        }
    }

    #[test]
    fn test_numeric_types_are_not_widened() {
        assert!(DataType::Long.accepts(&Value::Long(3)));
        assert!(!DataType::Double.accepts(&Value::Long(3)));
        assert!(!DataType::Text.accepts(&Value::Long(3)));
    }

    #[test]
    fn test_object_type_checks_class_name() {
        let invoice = Value::Object(ObjectValue::new("Invoice"));
        assert!(DataType::object("Invoice").accepts(&invoice));
        assert!(!DataType::object("Order").accepts(&invoice));
    }

    #[test]
    fn test_json_conversion_keeps_integers() {
        let value = Value::from(serde_json::json!({"count": 3, "ratio": 0.5}));
        let Value::Map(map) = value else {
            panic!("expected a map");
        };
        assert_eq!(map.get("count"), Some(&Value::Long(3)));
        assert_eq!(map.get("ratio"), Some(&Value::Double(0.5)));
    }
}
