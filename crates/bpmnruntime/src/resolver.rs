use bpmncore::{
    EvaluationContext, EvaluatorRegistry, Expression, ExpressionError, MethodHandler,
    MethodSignature, Value,
};
use std::sync::Arc;

/// Evaluates expression trees against the registered evaluators
pub struct ExpressionResolver {
    registry: Arc<EvaluatorRegistry>,
}

impl ExpressionResolver {
    pub fn new(registry: Arc<EvaluatorRegistry>) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &Arc<EvaluatorRegistry> {
        &self.registry
    }

    /// Dependencies first, in order, then the expression itself; the result
    /// must fit the declared return type.
    pub fn evaluate(
        &self,
        expression: &Expression,
        context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        let dependencies = expression
            .dependencies
            .iter()
            .map(|dependency| self.evaluate(dependency, context))
            .collect::<Result<Vec<_>, _>>()?;

        let evaluator = self
            .registry
            .evaluator(expression.kind)
            .ok_or_else(|| ExpressionError::NoEvaluator(expression.kind.to_string()))?;
        let value = evaluator.evaluate(expression, &dependencies, context)?;

        if !expression.return_type.accepts(&value) {
            return Err(ExpressionError::ReturnTypeMismatch {
                name: expression.name.clone(),
                expected: expression.return_type.to_string(),
                actual: value.type_name().to_string(),
            });
        }
        tracing::trace!(expression = %expression.name, "evaluated to {}", value);
        Ok(value)
    }

    /// Null counts as false
    pub fn evaluate_condition(
        &self,
        expression: &Expression,
        context: &dyn EvaluationContext,
    ) -> Result<bool, ExpressionError> {
        match self.evaluate(expression, context)? {
            Value::Bool(b) => Ok(b),
            Value::Null => Ok(false),
            other => Err(ExpressionError::ReturnTypeMismatch {
                name: expression.name.clone(),
                expected: "boolean".to_string(),
                actual: other.type_name().to_string(),
            }),
        }
    }

    /// Every problem in the tree, without evaluating anything
    pub fn validate(&self, expression: &Expression) -> Vec<String> {
        expression
            .walk()
            .into_iter()
            .filter_map(|expr| {
                let result = match self.registry.evaluator(expr.kind) {
                    None => Err(ExpressionError::NoEvaluator(expr.kind.to_string())),
                    Some(evaluator) => evaluator.validate(expr),
                };
                result.err().map(|e| e.to_string())
            })
            .collect()
    }

    pub fn method(&self, signature: &MethodSignature) -> Option<&Arc<dyn MethodHandler>> {
        self.registry.method(signature)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmncore::{DataType, Document, EngineConstants, ExpressionEvaluator, ExpressionKind};

    struct Empty(EngineConstants);

    impl EvaluationContext for Empty {
        fn data(&self, _name: &str) -> Option<Value> {
            None
        }
        fn input(&self, _name: &str) -> Option<Value> {
            None
        }
        fn documents(&self, _name: &str) -> Option<Vec<Document>> {
            None
        }
        fn constants(&self) -> &EngineConstants {
            &self.0
        }
    }

    /// Echoes its content as text whatever the declared type
    struct Echo;

    impl ExpressionEvaluator for Echo {
        fn kind(&self) -> ExpressionKind {
            ExpressionKind::Constant
        }

        fn evaluate(
            &self,
            expression: &Expression,
            _dependencies: &[Value],
            _context: &dyn EvaluationContext,
        ) -> Result<Value, ExpressionError> {
            Ok(Value::String(expression.content.clone()))
        }
    }

    fn context() -> Empty {
        Empty(EngineConstants {
            logged_user_id: 1,
            process_instance_id: 1,
            root_process_instance_id: 1,
            process_definition_id: Default::default(),
            process_initiator_id: 1,
            activity_instance_id: None,
            loop_counter: None,
            task_assignee_id: None,
        })
    }

    #[test]
    fn test_return_type_is_enforced() {
        let mut registry = EvaluatorRegistry::new();
        registry.register(Arc::new(Echo));
        let resolver = ExpressionResolver::new(Arc::new(registry));

        assert_eq!(
            resolver.evaluate(&Expression::text("abc"), &context()).unwrap(),
            Value::from("abc")
        );
        assert!(matches!(
            resolver.evaluate(&Expression::constant("12", DataType::Long), &context()),
            Err(ExpressionError::ReturnTypeMismatch { .. })
        ));
    }

    #[test]
    fn test_missing_evaluator_is_reported_for_nested_expressions() {
        let resolver = ExpressionResolver::new(Arc::new(EvaluatorRegistry::new()));
        let expr = Expression::comparison("==", Expression::long(1), Expression::long(2));

        let problems = resolver.validate(&expr);
        assert_eq!(problems.len(), 3);
        assert!(matches!(
            resolver.evaluate(&expr, &context()),
            Err(ExpressionError::NoEvaluator(_))
        ));
    }
}
