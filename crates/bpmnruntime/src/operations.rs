use crate::resolver::ExpressionResolver;
use crate::working_set::WorkingSet;
use bpmncore::{
    DataType, Document, LeftOperand, LeftOperandKind, MethodSignature, Operation, OperationError,
    OperatorType, Value, XmlDocument, XmlReplacement,
};
use std::sync::Arc;

/// Applies operation lists to a [`WorkingSet`].
///
/// Operations run strictly in declared order and each right-hand expression
/// sees the values written before it. Any error abandons the whole batch,
/// so a batch can always be replayed from its first operation.
pub struct OperationEvaluator {
    resolver: Arc<ExpressionResolver>,
}

impl OperationEvaluator {
    pub fn new(resolver: Arc<ExpressionResolver>) -> Self {
        Self { resolver }
    }

    pub fn apply_all(
        &self,
        operations: &[Operation],
        set: &mut WorkingSet,
    ) -> Result<(), OperationError> {
        for operation in operations {
            self.apply(operation, set)?;
        }
        Ok(())
    }

    pub fn apply(&self, operation: &Operation, set: &mut WorkingSet) -> Result<(), OperationError> {
        let target = &operation.left_operand;
        tracing::debug!(
            operator = %operation.operator_type,
            target = %target,
            "applying operation"
        );

        match operation.operator_type {
            OperatorType::Assignment => {
                let value = self.right_value(operation, set)?;
                self.assign(target, value, set)
            }
            OperatorType::MethodCall => self.call_method(operation, set),
            OperatorType::XpathUpdateQuery => self.update_xml(operation, set),
            OperatorType::DocumentCreateUpdate => {
                let value = self.right_value(operation, set)?;
                set_document(target, value, set)
            }
            OperatorType::DocumentListSet => {
                let value = self.right_value(operation, set)?;
                set_document_list(target, value, set)
            }
        }
    }

    fn right_value(&self, operation: &Operation, set: &WorkingSet) -> Result<Value, OperationError> {
        let expression =
            operation
                .right_operand
                .as_ref()
                .ok_or_else(|| OperationError::MissingExpression {
                    target: operation.left_operand.name.clone(),
                })?;
        Ok(self.resolver.evaluate(expression, set)?)
    }

    fn assign(
        &self,
        target: &LeftOperand,
        value: Value,
        set: &mut WorkingSet,
    ) -> Result<(), OperationError> {
        match target.kind {
            LeftOperandKind::Data | LeftOperandKind::TransientData => {
                let slot = data_slot(target, set)?;
                check_type(&target.name, &slot.data_type, &value)?;
                set.set_data(&target.name, value);
                Ok(())
            }
            LeftOperandKind::StringIndex => {
                let position = target.string_index_position().ok_or_else(|| unknown(target))?;
                set.set_string_index(position, value.to_text());
                Ok(())
            }
            LeftOperandKind::ExternalData => {
                set.set_external_data(&target.name, value);
                Ok(())
            }
            LeftOperandKind::Document => set_document(target, value, set),
            LeftOperandKind::DocumentList => set_document_list(target, value, set),
        }
    }

    /// Invokes the registered method on a copy of the current value and
    /// stores the mutated copy
    fn call_method(&self, operation: &Operation, set: &mut WorkingSet) -> Result<(), OperationError> {
        let target = &operation.left_operand;
        if !matches!(
            target.kind,
            LeftOperandKind::Data | LeftOperandKind::TransientData
        ) {
            return Err(unsupported(operation));
        }
        let slot = data_slot(target, set)?;
        let data_type = slot.data_type.clone();
        let signature = MethodSignature::new(
            data_type.type_name(),
            &operation.operator,
            operation.operator_input_type.as_deref(),
        );
        let handler = self
            .resolver
            .method(&signature)
            .ok_or_else(|| OperationError::UnknownMethod {
                signature: signature.to_string(),
            })?
            .clone();

        let argument = match &operation.right_operand {
            Some(expression) => Some(self.resolver.evaluate(expression, set)?),
            None => None,
        };
        let mut value = slot.value.clone();
        handler
            .invoke(&mut value, argument)
            .map_err(|reason| OperationError::MethodFailed {
                signature: signature.to_string(),
                reason,
            })?;

        check_type(&target.name, &data_type, &value)?;
        set.set_data(&target.name, value);
        Ok(())
    }

    /// Null XML is left alone and an XPath matching nothing changes nothing
    fn update_xml(&self, operation: &Operation, set: &mut WorkingSet) -> Result<(), OperationError> {
        let target = &operation.left_operand;
        if !matches!(
            target.kind,
            LeftOperandKind::Data | LeftOperandKind::TransientData
        ) {
            return Err(unsupported(operation));
        }
        let current = data_slot(target, set)?.value.clone();
        let (text, as_xml) = match &current {
            Value::Null => {
                tracing::debug!(data = %target.name, "XPath update on null data skipped");
                return Ok(());
            }
            Value::Xml(text) => (text.clone(), true),
            Value::String(text) => (text.clone(), false),
            other => {
                return Err(OperationError::TypeMismatch {
                    name: target.name.clone(),
                    expected: DataType::Xml.to_string(),
                    actual: other.type_name().to_string(),
                })
            }
        };

        let replacement = match self.right_value(operation, set)? {
            Value::Xml(fragment) => match XmlDocument::parse(&fragment) {
                Ok(doc) => XmlReplacement::Element(doc.root),
                Err(_) => XmlReplacement::Text(fragment),
            },
            other => XmlReplacement::Text(other.to_text().unwrap_or_default()),
        };

        let mut document = XmlDocument::parse(&text)?;
        let updated = document.update(&operation.operator, &replacement)?;
        if updated == 0 {
            tracing::debug!(data = %target.name, xpath = %operation.operator, "XPath matched nothing");
            return Ok(());
        }
        let rendered = document.to_string();
        set.set_data(
            &target.name,
            if as_xml {
                Value::Xml(rendered)
            } else {
                Value::String(rendered)
            },
        );
        Ok(())
    }
}

fn data_slot<'a>(
    target: &LeftOperand,
    set: &'a WorkingSet,
) -> Result<&'a crate::working_set::DataSlot, OperationError> {
    let slot = set.slot(&target.name).ok_or_else(|| unknown(target))?;
    if target.kind == LeftOperandKind::TransientData && !slot.transient {
        return Err(unknown(target));
    }
    Ok(slot)
}

fn check_type(name: &str, data_type: &DataType, value: &Value) -> Result<(), OperationError> {
    if data_type.accepts(value) {
        Ok(())
    } else {
        Err(OperationError::TypeMismatch {
            name: name.to_string(),
            expected: data_type.to_string(),
            actual: value.type_name().to_string(),
        })
    }
}

fn unknown(target: &LeftOperand) -> OperationError {
    OperationError::UnknownTarget {
        kind: target.kind.to_string(),
        name: target.name.clone(),
    }
}

fn unsupported(operation: &Operation) -> OperationError {
    OperationError::Unsupported {
        operator: operation.operator_type.to_string(),
        target: operation.left_operand.to_string(),
    }
}

/// A document value creates or replaces the document, null removes it
fn set_document(target: &LeftOperand, value: Value, set: &mut WorkingSet) -> Result<(), OperationError> {
    match set.document_declaration(&target.name) {
        Some(false) => {}
        Some(true) => {
            return Err(OperationError::Unsupported {
                operator: OperatorType::DocumentCreateUpdate.to_string(),
                target: format!("document list '{}'", target.name),
            })
        }
        None => {
            return Err(OperationError::UnknownTarget {
                kind: LeftOperandKind::Document.to_string(),
                name: target.name.clone(),
            })
        }
    }
    let document = match value {
        Value::Null => None,
        Value::Document(content) => {
            Some(Document::from_value(&target.name, None, &content, set.author()))
        }
        other => {
            return Err(OperationError::TypeMismatch {
                name: target.name.clone(),
                expected: DataType::Document.to_string(),
                actual: other.type_name().to_string(),
            })
        }
    };
    set.set_document(&target.name, document);
    Ok(())
}

/// Replaces the whole list; null empties it
fn set_document_list(
    target: &LeftOperand,
    value: Value,
    set: &mut WorkingSet,
) -> Result<(), OperationError> {
    if set.document_declaration(&target.name) != Some(true) {
        return Err(OperationError::UnknownTarget {
            kind: LeftOperandKind::DocumentList.to_string(),
            name: target.name.clone(),
        });
    }
    let mismatch = |actual: &str| OperationError::TypeMismatch {
        name: target.name.clone(),
        expected: DataType::DocumentList.to_string(),
        actual: actual.to_string(),
    };
    let items = match value {
        Value::Null => Vec::new(),
        Value::List(items) => items,
        other => return Err(mismatch(other.type_name())),
    };
    let author = set.author();
    let documents = items
        .into_iter()
        .enumerate()
        .map(|(index, item)| match item {
            Value::Document(content) => Ok(Document::from_value(
                &target.name,
                Some(index),
                &content,
                author,
            )),
            other => Err(mismatch(other.type_name())),
        })
        .collect::<Result<Vec<_>, _>>()?;
    set.set_document_list(&target.name, documents);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmncore::{
        DataDefinition, DocumentDefinition, DocumentValue, EngineConstants, EvaluationContext,
        Expression, ProcessDefinition,
    };
    use std::collections::BTreeMap;

    fn evaluator() -> OperationEvaluator {
        let registry = Arc::new(bpmnexpr::standard_registry());
        OperationEvaluator::new(Arc::new(ExpressionResolver::new(registry)))
    }

    fn working_set(definition: &ProcessDefinition, inputs: BTreeMap<String, Value>) -> WorkingSet {
        let constants = EngineConstants {
            logged_user_id: 7,
            process_instance_id: 1,
            root_process_instance_id: 1,
            process_definition_id: Default::default(),
            process_initiator_id: 7,
            activity_instance_id: None,
            loop_counter: None,
            task_assignee_id: None,
        };
        WorkingSet::for_new_instance(definition, 1, constants, inputs)
    }

    #[test]
    fn test_later_operations_see_earlier_writes() {
        let definition = ProcessDefinition::new("p", "1.0")
            .with_data(DataDefinition::new("myData1", DataType::Text));
        let mut set = working_set(&definition, BTreeMap::new());
        let operations = vec![
            Operation::assign_data("myData1", Expression::text("test1")),
            Operation::method_call(
                "myData1",
                "append",
                Some("text"),
                Expression::text("b"),
            ),
        ];

        evaluator().apply_all(&operations, &mut set).unwrap();
        assert_eq!(set.data("myData1"), Some(Value::from("test1b")));
    }

    #[test]
    fn test_assignment_rejects_wrong_type() {
        let definition = ProcessDefinition::new("p", "1.0")
            .with_data(DataDefinition::new("count", DataType::Long));
        let mut set = working_set(&definition, BTreeMap::new());

        let err = evaluator()
            .apply(&Operation::assign_data("count", Expression::text("x")), &mut set)
            .unwrap_err();
        assert!(matches!(err, OperationError::TypeMismatch { .. }));

        let err = evaluator()
            .apply(&Operation::assign_data("missing", Expression::long(1)), &mut set)
            .unwrap_err();
        assert!(matches!(err, OperationError::UnknownTarget { .. }));
    }

    #[test]
    fn test_missing_right_operand() {
        let definition = ProcessDefinition::new("p", "1.0")
            .with_data(DataDefinition::new("count", DataType::Long));
        let mut set = working_set(&definition, BTreeMap::new());
        let mut operation = Operation::assign_data("count", Expression::long(1));
        operation.right_operand = None;

        assert!(matches!(
            evaluator().apply(&operation, &mut set),
            Err(OperationError::MissingExpression { .. })
        ));
    }

    #[test]
    fn test_unknown_method() {
        let definition = ProcessDefinition::new("p", "1.0")
            .with_data(DataDefinition::new("count", DataType::Long));
        let mut set = working_set(&definition, BTreeMap::new());
        let operation =
            Operation::method_call("count", "frobnicate", None, Expression::long(1));

        assert!(matches!(
            evaluator().apply(&operation, &mut set),
            Err(OperationError::UnknownMethod { .. })
        ));
    }

    #[test]
    fn test_xpath_update_is_idempotent() {
        let definition = ProcessDefinition::new("p", "1.0")
            .with_data(DataDefinition::new("order", DataType::Xml));
        let mut set = working_set(&definition, BTreeMap::new());
        set.set_data("order", Value::Xml("<order><status>new</status></order>".into()));
        let operation =
            Operation::xpath_update("order", "/order/status", Expression::text("shipped"));

        evaluator().apply(&operation, &mut set).unwrap();
        let first = set.data("order");
        evaluator().apply(&operation, &mut set).unwrap();

        assert_eq!(set.data("order"), first);
        let Some(Value::Xml(text)) = first else {
            panic!("expected xml");
        };
        assert!(text.contains("<status>shipped</status>"));
    }

    #[test]
    fn test_xpath_update_on_null_is_skipped() {
        let definition = ProcessDefinition::new("p", "1.0")
            .with_data(DataDefinition::new("order", DataType::Xml));
        let mut set = working_set(&definition, BTreeMap::new());
        let operation =
            Operation::xpath_update("order", "/order/status", Expression::text("shipped"));

        evaluator().apply(&operation, &mut set).unwrap();
        assert_eq!(set.data("order"), Some(Value::Null));
    }

    #[test]
    fn test_document_and_list_updates() {
        let definition = ProcessDefinition::new("p", "1.0")
            .with_document(DocumentDefinition::single("contract"))
            .with_document(DocumentDefinition::list("annexes"));
        let file = Value::Document(DocumentValue::with_content("a.pdf", "application/pdf", b"%PDF".to_vec()));
        let inputs = BTreeMap::from([
            ("file".to_string(), file.clone()),
            ("files".to_string(), Value::List(vec![file.clone(), file])),
        ]);
        let mut set = working_set(&definition, inputs);

        let evaluator = evaluator();
        evaluator
            .apply(
                &Operation::set_document(
                    "contract",
                    Expression::contract_input("file", DataType::Document),
                ),
                &mut set,
            )
            .unwrap();
        evaluator
            .apply(
                &Operation::set_document_list(
                    "annexes",
                    Expression::contract_input("files", DataType::DocumentList),
                ),
                &mut set,
            )
            .unwrap();

        let contract = set.documents("contract").unwrap();
        assert_eq!(contract.len(), 1);
        assert_eq!(contract[0].author, 7);
        let annexes = set.documents("annexes").unwrap();
        assert_eq!(
            annexes.iter().map(|d| d.index).collect::<Vec<_>>(),
            vec![Some(0), Some(1)]
        );

        // single-document operator cannot target a list
        assert!(evaluator
            .apply(
                &Operation::set_document(
                    "annexes",
                    Expression::contract_input("file", DataType::Document),
                ),
                &mut set,
            )
            .is_err());
    }

    #[test]
    fn test_string_index_takes_text_form() {
        let definition = ProcessDefinition::new("p", "1.0");
        let mut set = working_set(&definition, BTreeMap::new());

        evaluator()
            .apply(&Operation::set_string_index(2, Expression::long(42)), &mut set)
            .unwrap();
        assert_eq!(set.string_indexes()[1].as_deref(), Some("42"));
    }
}
