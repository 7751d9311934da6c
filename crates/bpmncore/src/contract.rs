use crate::expression::Expression;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Typed, validated inputs required to start a process or complete a task
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ContractDefinition {
    #[serde(default)]
    pub inputs: Vec<InputDefinition>,
    #[serde(default)]
    pub constraints: Vec<ConstraintDefinition>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputType {
    Text,
    Boolean,
    Integer,
    Decimal,
    Date,
    File,
    Complex,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputDefinition {
    pub name: String,
    pub input_type: InputType,
    #[serde(default)]
    pub multiple: bool,
    #[serde(default)]
    pub optional: bool,
    pub description: Option<String>,
    /// Fields of a `Complex` input
    #[serde(default)]
    pub inputs: Vec<InputDefinition>,
}

impl InputDefinition {
    pub fn new(name: impl Into<String>, input_type: InputType) -> Self {
        Self {
            name: name.into(),
            input_type,
            multiple: false,
            optional: false,
            description: None,
            inputs: Vec::new(),
        }
    }

    pub fn complex(name: impl Into<String>, fields: Vec<InputDefinition>) -> Self {
        Self {
            inputs: fields,
            ..Self::new(name, InputType::Complex)
        }
    }

    pub fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    fn check(&self, path: &str, value: Option<&Value>, violations: &mut Vec<String>) {
        let value = match value {
            None | Some(Value::Null) => {
                if !self.optional {
                    violations.push(format!("Expected input [{}] is missing", path));
                }
                return;
            }
            Some(value) => value,
        };

        if self.multiple {
            match value {
                Value::List(items) => {
                    for (i, item) in items.iter().enumerate() {
                        self.check_single(&format!("{}[{}]", path, i), item, violations);
                    }
                }
                other => violations.push(format!(
                    "Input [{}] must be a list but is {}",
                    path,
                    other.type_name()
                )),
            }
        } else {
            self.check_single(path, value, violations);
        }
    }

    fn check_single(&self, path: &str, value: &Value, violations: &mut Vec<String>) {
        let accepted = match (self.input_type, value) {
            (InputType::Text, Value::String(_)) => true,
            (InputType::Boolean, Value::Bool(_)) => true,
            (InputType::Integer, Value::Long(_)) => true,
            (InputType::Decimal, Value::Double(_) | Value::Long(_)) => true,
            (InputType::Date, Value::Date(_)) => true,
            (InputType::File, Value::Document(_)) => true,
            (InputType::Complex, Value::Map(fields)) => {
                for field in &self.inputs {
                    field.check(
                        &format!("{}.{}", path, field.name),
                        fields.get(&field.name),
                        violations,
                    );
                }
                true
            }
            _ => false,
        };
        if !accepted {
            violations.push(format!(
                "Input [{}] has type {} but {:?} is expected",
                path,
                value.type_name(),
                self.input_type
            ));
        }
    }
}

/// Boolean rule over the inputs, reported with `explanation` when false
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConstraintDefinition {
    pub name: String,
    pub expression: Expression,
    pub explanation: String,
    #[serde(default)]
    pub input_names: Vec<String>,
}

impl ContractDefinition {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_input(mut self, input: InputDefinition) -> Self {
        self.inputs.push(input);
        self
    }

    pub fn with_constraint(
        mut self,
        name: impl Into<String>,
        expression: Expression,
        explanation: impl Into<String>,
    ) -> Self {
        self.constraints.push(ConstraintDefinition {
            name: name.into(),
            expression,
            explanation: explanation.into(),
            input_names: Vec::new(),
        });
        self
    }

    pub fn is_empty(&self) -> bool {
        self.inputs.is_empty() && self.constraints.is_empty()
    }

    /// Structural violations: missing mandatory inputs and type mismatches,
    /// collected across all inputs. Constraints are evaluated by the runtime.
    pub fn structural_violations(&self, inputs: &BTreeMap<String, Value>) -> Vec<String> {
        let mut violations = Vec::new();
        for input in &self.inputs {
            input.check(&input.name, inputs.get(&input.name), &mut violations);
        }
        violations
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn contract() -> ContractDefinition {
        ContractDefinition::new()
            .with_input(InputDefinition::new("firstName", InputType::Text))
            .with_input(InputDefinition::new("age", InputType::Integer))
            .with_input(InputDefinition::new("nickname", InputType::Text).optional())
            .with_input(InputDefinition::new("tags", InputType::Text).multiple())
            .with_input(InputDefinition::complex(
                "address",
                vec![InputDefinition::new("city", InputType::Text)],
            ))
    }

    #[test]
    fn test_all_violations_are_reported() {
        let mut inputs = BTreeMap::new();
        inputs.insert("age".to_string(), Value::String("forty".into()));
        inputs.insert("tags".to_string(), Value::String("single".into()));
        inputs.insert("address".to_string(), Value::Map(BTreeMap::new()));

        let violations = contract().structural_violations(&inputs);

        assert_eq!(violations.len(), 4, "{:?}", violations);
        assert!(violations.iter().any(|v| v.contains("[firstName] is missing")));
        assert!(violations.iter().any(|v| v.contains("[age]")));
        assert!(violations.iter().any(|v| v.contains("[tags] must be a list")));
        assert!(violations.iter().any(|v| v.contains("[address.city] is missing")));
    }

    #[test]
    fn test_valid_inputs_pass() {
        let mut address = BTreeMap::new();
        address.insert("city".to_string(), Value::from("Grenoble"));
        let mut inputs = BTreeMap::new();
        inputs.insert("firstName".to_string(), Value::from("Ada"));
        inputs.insert("age".to_string(), Value::Long(36));
        inputs.insert("tags".to_string(), Value::List(vec![Value::from("a")]));
        inputs.insert("address".to_string(), Value::Map(address));

        assert!(contract().structural_violations(&inputs).is_empty());
    }
}
