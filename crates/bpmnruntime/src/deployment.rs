//! Static checks run before a definition is stored
//!
//! Everything that can be rejected without running an instance is rejected
//! here, and every problem is reported in one [`ValidationError`].

use crate::graph::FlowGraph;
use crate::resolver::ExpressionResolver;
use bpmncore::{
    xml, DataType, EndEventResult, EventTrigger, Expression, FlowNodeDefinition,
    FlowNodeDefinitionKind, LeftOperandKind, LoopCharacteristics, MethodSignature, Operation,
    OperatorType, ProcessDefinition, ThrowMessage, ValidationError,
};

pub fn validate_definition(
    definition: &ProcessDefinition,
    resolver: &ExpressionResolver,
) -> Result<FlowGraph, ValidationError> {
    let mut violations = Vec::new();

    if definition.name.trim().is_empty() {
        violations.push("Process definition has no name".to_string());
    }
    for node in &definition.flow_nodes {
        check_node(definition, node, resolver, &mut violations);
    }
    for transition in &definition.transitions {
        if let Some(condition) = &transition.condition {
            check_expression(
                &format!("condition of transition {}", transition.id),
                condition,
                resolver,
                &mut violations,
            );
        }
    }
    for data in &definition.data {
        if let Some(default) = &data.default_value {
            check_expression(&format!("default of data '{}'", data.name), default, resolver, &mut violations);
        }
    }
    for document in &definition.documents {
        if let Some(initial) = &document.initial_value {
            check_expression(
                &format!("initial value of document '{}'", document.name),
                initial,
                resolver,
                &mut violations,
            );
        }
    }
    for (slot, index) in definition.string_indexes.iter().enumerate() {
        if let Some(expression) = index.as_ref().and_then(|i| i.value.as_ref()) {
            check_expression(
                &format!("string index {}", slot + 1),
                expression,
                resolver,
                &mut violations,
            );
        }
    }
    for constraint in &definition.contract.constraints {
        check_expression(
            &format!("constraint '{}'", constraint.name),
            &constraint.expression,
            resolver,
            &mut violations,
        );
    }

    let graph = match FlowGraph::build(definition) {
        Ok(graph) => Some(graph),
        Err(problems) => {
            violations.extend(problems);
            None
        }
    };

    let has_start = !definition.initial_nodes().is_empty()
        || definition
            .flow_nodes
            .iter()
            .any(|n| matches!(n.kind, FlowNodeDefinitionKind::StartEvent(Some(_))));
    if !has_start {
        violations.push(format!("Process '{}' has no start", definition.name));
    } else if let Some(graph) = &graph {
        for id in graph.unreachable_nodes(definition) {
            if let Some(node) = definition.find_node(id) {
                violations.push(format!("Flow node '{}' cannot be reached from any start", node.name));
            }
        }
    }

    ValidationError::check(violations)?;
    graph.ok_or_else(|| ValidationError::single("invalid flow structure"))
}

fn check_expression(
    location: &str,
    expression: &Expression,
    resolver: &ExpressionResolver,
    violations: &mut Vec<String>,
) {
    for problem in resolver.validate(expression) {
        violations.push(format!("In {}: {}", location, problem));
    }
}

fn check_node(
    definition: &ProcessDefinition,
    node: &FlowNodeDefinition,
    resolver: &ExpressionResolver,
    violations: &mut Vec<String>,
) {
    let location = format!("flow node '{}'", node.name);

    for operation in &node.operations {
        check_operation(definition, node, operation, resolver, violations);
    }
    for data in &node.data {
        if let Some(default) = &data.default_value {
            check_expression(
                &format!("default of activity data '{}' on {}", data.name, location),
                default,
                resolver,
                violations,
            );
        }
    }
    if !node.is_activity() && (!node.data.is_empty() || node.loop_characteristics.is_some()) {
        violations.push(format!("{} is not an activity and cannot carry data or loops", location));
    }

    match &node.kind {
        FlowNodeDefinitionKind::CallActivity(call) => {
            if call.process_name.trim().is_empty() {
                violations.push(format!("{} does not name a process to call", location));
            }
            for mapping in &call.input_mappings {
                check_expression(
                    &format!("input mapping '{}' of {}", mapping.name, location),
                    &mapping.expression,
                    resolver,
                    violations,
                );
            }
        }
        FlowNodeDefinitionKind::UserTask(task) => {
            for constraint in &task.contract.constraints {
                check_expression(
                    &format!("constraint '{}' of {}", constraint.name, location),
                    &constraint.expression,
                    resolver,
                    violations,
                );
            }
        }
        FlowNodeDefinitionKind::StartEvent(Some(trigger))
        | FlowNodeDefinitionKind::IntermediateCatchEvent(trigger)
        | FlowNodeDefinitionKind::BoundaryEvent { trigger, .. } => {
            check_trigger(&location, node, trigger, resolver, violations);
        }
        FlowNodeDefinitionKind::IntermediateThrowEvent(message)
        | FlowNodeDefinitionKind::EndEvent(EndEventResult::Message(message)) => {
            check_throw(&location, message, resolver, violations);
        }
        _ => {}
    }

    if let Some(characteristics) = &node.loop_characteristics {
        check_loop(definition, node, characteristics, resolver, violations);
    }
}

fn check_trigger(
    location: &str,
    node: &FlowNodeDefinition,
    trigger: &EventTrigger,
    resolver: &ExpressionResolver,
    violations: &mut Vec<String>,
) {
    match trigger {
        EventTrigger::Message(message) => {
            for correlation in &message.correlations {
                check_expression(
                    &format!("correlation '{}' of {}", correlation.key, location),
                    &correlation.value,
                    resolver,
                    violations,
                );
            }
        }
        EventTrigger::Timer(timer) => {
            check_expression(&format!("timer of {}", location), &timer.expression, resolver, violations);
        }
        EventTrigger::Error { .. } => {
            if !matches!(node.kind, FlowNodeDefinitionKind::BoundaryEvent { .. }) {
                violations.push(format!("{} catches errors but is not a boundary event", location));
            }
        }
        EventTrigger::Signal { name } => {
            if name.trim().is_empty() {
                violations.push(format!("{} waits for a signal without a name", location));
            }
        }
    }
}

fn check_throw(
    location: &str,
    message: &ThrowMessage,
    resolver: &ExpressionResolver,
    violations: &mut Vec<String>,
) {
    for correlation in &message.correlations {
        check_expression(
            &format!("correlation '{}' of {}", correlation.key, location),
            &correlation.value,
            resolver,
            violations,
        );
    }
    for content in &message.content {
        check_expression(
            &format!("message content '{}' of {}", content.name, location),
            &content.expression,
            resolver,
            violations,
        );
    }
}

fn check_loop(
    definition: &ProcessDefinition,
    node: &FlowNodeDefinition,
    characteristics: &LoopCharacteristics,
    resolver: &ExpressionResolver,
    violations: &mut Vec<String>,
) {
    let location = format!("loop of flow node '{}'", node.name);
    match characteristics {
        LoopCharacteristics::StandardLoop(standard) => {
            check_expression(&location, &standard.condition, resolver, violations);
        }
        LoopCharacteristics::MultiInstance(multi) => {
            if multi.cardinality.is_none() && multi.collection_data.is_none() {
                violations.push(format!("{} has neither a cardinality nor a collection", location));
            }
            if let Some(cardinality) = &multi.cardinality {
                check_expression(&location, cardinality, resolver, violations);
            }
            if let Some(condition) = &multi.completion_condition {
                check_expression(&location, condition, resolver, violations);
            }
            if let Some(collection) = &multi.collection_data {
                match definition.find_data(collection) {
                    Some(data) if matches!(data.data_type, DataType::List | DataType::Any) => {}
                    Some(_) => violations.push(format!("{}: data '{}' is not a list", location, collection)),
                    None => violations.push(format!("{}: unknown data '{}'", location, collection)),
                }
            }
            if let Some(item) = &multi.input_item {
                if node.find_data(item).is_none() {
                    violations.push(format!("{}: input item '{}' is not activity data", location, item));
                }
            }
        }
    }
}

fn check_operation(
    definition: &ProcessDefinition,
    node: &FlowNodeDefinition,
    operation: &Operation,
    resolver: &ExpressionResolver,
    violations: &mut Vec<String>,
) {
    let target = &operation.left_operand;
    let location = format!("operation on {} in flow node '{}'", target, node.name);

    let needs_expression = match operation.operator_type {
        OperatorType::MethodCall => operation.operator_input_type.is_some(),
        _ => true,
    };
    match &operation.right_operand {
        None if needs_expression => {
            violations.push(format!("{} has no right-hand expression", location));
        }
        Some(expression) => check_expression(&location, expression, resolver, violations),
        None => {}
    }

    let data_type = node
        .find_data(&target.name)
        .or_else(|| definition.find_data(&target.name))
        .map(|d| (d.data_type.clone(), d.transient));

    match target.kind {
        LeftOperandKind::Data | LeftOperandKind::TransientData => match &data_type {
            None => violations.push(format!("{} targets undeclared data", location)),
            Some((_, transient)) if target.kind == LeftOperandKind::TransientData && !transient => {
                violations.push(format!("{} targets data that is not transient", location));
            }
            Some(_) => {}
        },
        LeftOperandKind::Document | LeftOperandKind::DocumentList => {
            let wants_list = target.kind == LeftOperandKind::DocumentList;
            match definition.find_document(&target.name) {
                None => violations.push(format!("{} targets an undeclared document", location)),
                Some(document) if document.multiple != wants_list => {
                    violations.push(format!("{} does not match the declared document kind", location));
                }
                Some(_) => {}
            }
        }
        LeftOperandKind::StringIndex => {
            if target.string_index_position().is_none() {
                violations.push(format!("{}: string index slots are numbered 1 to 5", location));
            }
        }
        LeftOperandKind::ExternalData => {}
    }

    match operation.operator_type {
        OperatorType::Assignment => {}
        OperatorType::MethodCall => {
            if let Some((data_type, _)) = &data_type {
                let signature = MethodSignature::new(
                    data_type.type_name(),
                    &operation.operator,
                    operation.operator_input_type.as_deref(),
                );
                if resolver.method(&signature).is_none() {
                    violations.push(format!("{}: no method registered for {}", location, signature));
                }
            }
        }
        OperatorType::XpathUpdateQuery => {
            if let Some((data_type, _)) = &data_type {
                if !matches!(data_type, DataType::Xml) {
                    violations.push(format!("{}: XPath update on {} data", location, data_type));
                }
            }
            if let Err(e) = xml::validate_xpath(&operation.operator) {
                violations.push(format!("{}: {}", location, e));
            }
        }
        OperatorType::DocumentCreateUpdate => {
            if target.kind != LeftOperandKind::Document {
                violations.push(format!("{}: document update needs a document target", location));
            }
        }
        OperatorType::DocumentListSet => {
            if target.kind != LeftOperandKind::DocumentList {
                violations.push(format!("{}: list update needs a document list target", location));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmncore::{DataDefinition, DocumentDefinition, GatewayType};
    use std::sync::Arc;

    fn resolver() -> ExpressionResolver {
        ExpressionResolver::new(Arc::new(bpmnexpr::standard_registry()))
    }

    fn simple(task: FlowNodeDefinition) -> ProcessDefinition {
        let mut definition = ProcessDefinition::new("p", "1.0")
            .with_data(DataDefinition::new("name", DataType::Text))
            .with_data(DataDefinition::new("order", DataType::Xml))
            .with_document(DocumentDefinition::single("contract"));
        let start = definition.add_node(FlowNodeDefinition::start_event("start"));
        let task = definition.add_node(task);
        let end = definition.add_node(FlowNodeDefinition::end_event("end"));
        definition.connect(start, task);
        definition.connect(task, end);
        definition
    }

    #[test]
    fn test_valid_definition_passes() {
        let definition = simple(
            FlowNodeDefinition::automatic_task("step")
                .with_operation(Operation::assign_data("name", Expression::text("x")))
                .with_operation(Operation::xpath_update("order", "/order/@id", Expression::text("1"))),
        );
        assert!(validate_definition(&definition, &resolver()).is_ok());
    }

    #[test]
    fn test_operation_without_expression_is_rejected() {
        let mut operation = Operation::assign_data("name", Expression::text("x"));
        operation.right_operand = None;
        let definition = simple(FlowNodeDefinition::automatic_task("step").with_operation(operation));

        let err = validate_definition(&definition, &resolver()).unwrap_err();
        assert_eq!(err.violations.len(), 1);
        assert!(err.violations[0].contains("no right-hand expression"));
    }

    #[test]
    fn test_all_operation_problems_are_listed() {
        let definition = simple(
            FlowNodeDefinition::automatic_task("step")
                .with_operation(Operation::assign_data("missing", Expression::text("x")))
                .with_operation(Operation::method_call("name", "explode", None, Expression::text("x")))
                .with_operation(Operation::xpath_update("name", "/a", Expression::text("x")))
                .with_operation(Operation::set_document_list("contract", Expression::document_list("contract")))
                .with_operation(Operation::set_string_index(6, Expression::text("x"))),
        );

        let err = validate_definition(&definition, &resolver()).unwrap_err();
        assert_eq!(err.violations.len(), 5, "{:#?}", err.violations);
    }

    #[test]
    fn test_unreachable_and_unknown_nodes() {
        let mut definition = ProcessDefinition::new("p", "1.0");
        let start = definition.add_node(FlowNodeDefinition::start_event("start"));
        let join = definition.add_node(FlowNodeDefinition::gateway("join", GatewayType::Parallel));
        let orphan = definition.add_node(FlowNodeDefinition::automatic_task("orphan"));
        definition.connect(start, join);
        definition.connect(orphan, orphan);
        definition.connect(join, uuid::Uuid::new_v4());

        let err = validate_definition(&definition, &resolver()).unwrap_err();
        assert!(err.violations.iter().any(|v| v.contains("unknown target")));
    }

    #[test]
    fn test_process_without_start() {
        let mut definition = ProcessDefinition::new("p", "1.0");
        let a = definition.add_node(FlowNodeDefinition::automatic_task("a"));
        let b = definition.add_node(FlowNodeDefinition::automatic_task("b"));
        definition.connect(a, b);
        definition.connect(b, a);

        let err = validate_definition(&definition, &resolver()).unwrap_err();
        assert!(err.violations.iter().any(|v| v.contains("has no start")));
    }
}
