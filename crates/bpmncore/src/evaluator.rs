use crate::document::Document;
use crate::error::ExpressionError;
use crate::expression::{EngineConstants, Expression, ExpressionKind};
use crate::value::Value;

/// Read-only view of the instance an expression is evaluated against
pub trait EvaluationContext {
    /// Current value of a data item, including values assigned earlier in the
    /// running operation batch. `None` when no such data is declared.
    fn data(&self, name: &str) -> Option<Value>;

    /// Contract input or trigger payload entry
    fn input(&self, name: &str) -> Option<Value>;

    /// Current documents stored under a declared document or document list name,
    /// empty when nothing is set. `None` when no such document is declared.
    fn documents(&self, name: &str) -> Option<Vec<Document>>;

    fn constants(&self) -> &EngineConstants;
}

/// Capability that evaluates one kind of expression.
///
/// Evaluators are pure: they read the context and return a value, and every
/// write goes through operations.
pub trait ExpressionEvaluator: Send + Sync {
    fn kind(&self) -> ExpressionKind;

    /// `dependencies` holds the values of `expression.dependencies`, in order
    fn evaluate(
        &self,
        expression: &Expression,
        dependencies: &[Value],
        context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError>;

    /// Optional: reject malformed expressions at deployment time
    fn validate(&self, _expression: &Expression) -> Result<(), ExpressionError> {
        Ok(())
    }

    fn description(&self) -> &str {
        ""
    }
}
