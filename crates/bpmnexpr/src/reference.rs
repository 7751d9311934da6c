use bpmncore::{
    DocumentValue, EngineConstant, EvaluationContext, Expression, ExpressionError,
    ExpressionEvaluator, ExpressionKind, Value,
};

/// Current value of a process or activity data item
pub struct VariableEvaluator;

impl ExpressionEvaluator for VariableEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::Variable
    }

    fn evaluate(
        &self,
        expression: &Expression,
        _dependencies: &[Value],
        context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        context
            .data(&expression.content)
            .ok_or_else(|| ExpressionError::UnknownData(expression.content.clone()))
    }

    fn description(&self) -> &str {
        "Value of the named data, as seen by the running operation batch"
    }
}

/// Contract input or trigger payload entry; absent optional inputs read as null
pub struct ContractInputEvaluator;

impl ExpressionEvaluator for ContractInputEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::ContractInput
    }

    fn evaluate(
        &self,
        expression: &Expression,
        _dependencies: &[Value],
        context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        Ok(context.input(&expression.content).unwrap_or(Value::Null))
    }

    fn description(&self) -> &str {
        "Contract input, message payload entry or called process data"
    }
}

pub struct EngineConstantEvaluator;

impl ExpressionEvaluator for EngineConstantEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::EngineConstant
    }

    fn evaluate(
        &self,
        expression: &Expression,
        _dependencies: &[Value],
        context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        let constant = parse_constant(expression)?;
        context
            .constants()
            .value(constant)
            .ok_or_else(|| ExpressionError::UnavailableConstant(expression.content.clone()))
    }

    fn validate(&self, expression: &Expression) -> Result<(), ExpressionError> {
        parse_constant(expression).map(|_| ())
    }

    fn description(&self) -> &str {
        "Engine-provided value such as the logged user or process instance id"
    }
}

fn parse_constant(expression: &Expression) -> Result<EngineConstant, ExpressionError> {
    expression
        .content
        .parse::<EngineConstant>()
        .map_err(|reason| ExpressionError::Invalid {
            name: expression.name.clone(),
            reason,
        })
}

/// First document stored under a name, or null when none is set
pub struct DocumentReferenceEvaluator;

impl ExpressionEvaluator for DocumentReferenceEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::DocumentReference
    }

    fn evaluate(
        &self,
        expression: &Expression,
        _dependencies: &[Value],
        context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        let documents = context
            .documents(&expression.content)
            .ok_or_else(|| ExpressionError::UnknownDocument(expression.content.clone()))?;
        Ok(documents
            .first()
            .map(|doc| Value::Document(DocumentValue::from(doc)))
            .unwrap_or(Value::Null))
    }

    fn description(&self) -> &str {
        "Reference to a document already attached to the process instance"
    }
}

pub struct DocumentListReferenceEvaluator;

impl ExpressionEvaluator for DocumentListReferenceEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::DocumentListReference
    }

    fn evaluate(
        &self,
        expression: &Expression,
        _dependencies: &[Value],
        context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        let documents = context
            .documents(&expression.content)
            .ok_or_else(|| ExpressionError::UnknownDocument(expression.content.clone()))?;
        Ok(Value::List(
            documents
                .iter()
                .map(|doc| Value::Document(DocumentValue::from(doc)))
                .collect(),
        ))
    }

    fn description(&self) -> &str {
        "Every document of a document list, in index order"
    }
}
