use crate::resolver::ExpressionResolver;
use bpmncore::{
    ContractDefinition, Document, EngineConstants, EvaluationContext, ValidationError, Value,
};
use std::collections::BTreeMap;

/// Evaluation context exposing nothing but the submitted inputs
struct InputsOnly<'a> {
    inputs: &'a BTreeMap<String, Value>,
    constants: &'a EngineConstants,
}

impl EvaluationContext for InputsOnly<'_> {
    fn data(&self, _name: &str) -> Option<Value> {
        None
    }

    fn input(&self, name: &str) -> Option<Value> {
        self.inputs.get(name).cloned()
    }

    fn documents(&self, _name: &str) -> Option<Vec<Document>> {
        None
    }

    fn constants(&self) -> &EngineConstants {
        self.constants
    }
}

/// Checks inputs against a contract and reports every structural violation
/// and every failing constraint together
pub fn validate_inputs(
    resolver: &ExpressionResolver,
    contract: &ContractDefinition,
    inputs: &BTreeMap<String, Value>,
    constants: &EngineConstants,
) -> Result<(), ValidationError> {
    let mut violations = contract.structural_violations(inputs);

    let context = InputsOnly { inputs, constants };
    for constraint in &contract.constraints {
        match resolver.evaluate_condition(&constraint.expression, &context) {
            Ok(true) => {}
            Ok(false) => violations.push(format!(
                "Constraint [{}] violated: {}",
                constraint.name, constraint.explanation
            )),
            Err(e) => violations.push(format!(
                "Constraint [{}] could not be evaluated: {}",
                constraint.name, e
            )),
        }
    }

    ValidationError::check(violations)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmncore::{DataType, Expression, InputDefinition, InputType};
    use std::sync::Arc;

    fn resolver() -> ExpressionResolver {
        ExpressionResolver::new(Arc::new(bpmnexpr::standard_registry()))
    }

    fn constants() -> EngineConstants {
        EngineConstants {
            logged_user_id: 1,
            process_instance_id: 0,
            root_process_instance_id: 0,
            process_definition_id: Default::default(),
            process_initiator_id: 1,
            activity_instance_id: None,
            loop_counter: None,
            task_assignee_id: None,
        }
    }

    fn contract() -> ContractDefinition {
        ContractDefinition::new()
            .with_input(InputDefinition::new("amount", InputType::Integer))
            .with_input(InputDefinition::new("approved", InputType::Boolean))
            .with_constraint(
                "positive",
                Expression::comparison(
                    ">",
                    Expression::contract_input("amount", DataType::Long),
                    Expression::long(0),
                ),
                "amount must be positive",
            )
            .with_constraint(
                "approval",
                Expression::contract_input("approved", DataType::Boolean),
                "request must be approved",
            )
    }

    #[test]
    fn test_every_failing_constraint_is_reported() {
        let inputs = BTreeMap::from([
            ("amount".to_string(), Value::Long(-5)),
            ("approved".to_string(), Value::Bool(false)),
        ]);
        let err = validate_inputs(&resolver(), &contract(), &inputs, &constants()).unwrap_err();
        assert_eq!(err.violations.len(), 2, "{:?}", err.violations);
    }

    #[test]
    fn test_structural_and_constraint_violations_reported_together() {
        let err = validate_inputs(&resolver(), &contract(), &BTreeMap::new(), &constants())
            .unwrap_err();
        assert_eq!(err.violations.len(), 4, "{:?}", err.violations);
        assert_eq!(
            err.violations.iter().filter(|v| v.contains("is missing")).count(),
            2
        );
    }

    #[test]
    fn test_valid_inputs() {
        let inputs = BTreeMap::from([
            ("amount".to_string(), Value::Long(10)),
            ("approved".to_string(), Value::Bool(true)),
        ]);
        assert!(validate_inputs(&resolver(), &contract(), &inputs, &constants()).is_ok());
    }
}
