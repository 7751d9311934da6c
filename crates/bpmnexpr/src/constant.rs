use bpmncore::{
    DataType, EvaluationContext, Expression, ExpressionError, ExpressionEvaluator, ExpressionKind,
    Value, XmlDocument,
};
use chrono::{DateTime, Utc};

/// Literal parsed according to the expression's return type
pub struct ConstantEvaluator;

impl ConstantEvaluator {
    fn parse(expression: &Expression) -> Result<Value, ExpressionError> {
        let content = expression.content.trim();
        let invalid = || ExpressionError::InvalidConstant {
            content: expression.content.clone(),
            expected: expression.return_type.to_string(),
        };

        match &expression.return_type {
            DataType::Text => Ok(Value::String(expression.content.clone())),
            DataType::Boolean => content.parse::<bool>().map(Value::Bool).map_err(|_| invalid()),
            DataType::Long => content.parse::<i64>().map(Value::Long).map_err(|_| invalid()),
            DataType::Double => content.parse::<f64>().map(Value::Double).map_err(|_| invalid()),
            DataType::Date => content
                .parse::<DateTime<Utc>>()
                .map(Value::Date)
                .map_err(|_| invalid()),
            DataType::Xml => {
                XmlDocument::parse(content)?;
                Ok(Value::Xml(content.to_string()))
            }
            DataType::List | DataType::Map | DataType::Any => {
                let json: serde_json::Value = serde_json::from_str(content).map_err(|_| invalid())?;
                let value = Value::from(json);
                if expression.return_type.accepts(&value) {
                    Ok(value)
                } else {
                    Err(invalid())
                }
            }
            DataType::Object { .. } | DataType::Document | DataType::DocumentList => {
                if content.is_empty() || content == "null" {
                    Ok(Value::Null)
                } else {
                    Err(invalid())
                }
            }
        }
    }
}

impl ExpressionEvaluator for ConstantEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::Constant
    }

    fn evaluate(
        &self,
        expression: &Expression,
        _dependencies: &[Value],
        _context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        Self::parse(expression)
    }

    fn validate(&self, expression: &Expression) -> Result<(), ExpressionError> {
        Self::parse(expression).map(|_| ())
    }

    fn description(&self) -> &str {
        "Literal value parsed as the declared return type"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_by_return_type() {
        assert_eq!(ConstantEvaluator::parse(&Expression::long(123)).unwrap(), Value::Long(123));
        assert_eq!(
            ConstantEvaluator::parse(&Expression::boolean(false)).unwrap(),
            Value::Bool(false)
        );
        assert_eq!(
            ConstantEvaluator::parse(&Expression::constant("[1, 2]", DataType::List)).unwrap(),
            Value::List(vec![Value::Long(1), Value::Long(2)])
        );
    }

    #[test]
    fn test_rejects_malformed_literals() {
        let bad_long = Expression::constant("12a", DataType::Long);
        assert!(matches!(
            ConstantEvaluator.validate(&bad_long),
            Err(ExpressionError::InvalidConstant { .. })
        ));
        let bad_xml = Expression::xml("<a><b></a>");
        assert!(matches!(
            ConstantEvaluator.validate(&bad_xml),
            Err(ExpressionError::Xml(_))
        ));
    }
}
