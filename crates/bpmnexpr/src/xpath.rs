use bpmncore::xml::validate_xpath;
use bpmncore::{
    DataType, EvaluationContext, Expression, ExpressionError, ExpressionEvaluator, ExpressionKind,
    Value, XmlDocument,
};

/// Reads an XPath out of the XML held by the first dependency
pub struct XPathReadEvaluator;

impl XPathReadEvaluator {
    fn convert(expression: &Expression, text: String) -> Result<Value, ExpressionError> {
        let invalid = || ExpressionError::Failed {
            name: expression.name.clone(),
            reason: format!("'{}' is not a valid {}", text, expression.return_type),
        };
        match expression.return_type {
            DataType::Long => text.trim().parse().map(Value::Long).map_err(|_| invalid()),
            DataType::Double => text.trim().parse().map(Value::Double).map_err(|_| invalid()),
            DataType::Boolean => text.trim().parse().map(Value::Bool).map_err(|_| invalid()),
            _ => Ok(Value::String(text)),
        }
    }
}

impl ExpressionEvaluator for XPathReadEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::XPathRead
    }

    fn evaluate(
        &self,
        expression: &Expression,
        dependencies: &[Value],
        _context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        let xml = match dependencies.first() {
            Some(Value::Null) => return Ok(Value::Null),
            Some(value) => value.as_str().ok_or_else(|| ExpressionError::Failed {
                name: expression.name.clone(),
                reason: format!("expected XML, got {}", value.type_name()),
            })?,
            None => {
                return Err(ExpressionError::Invalid {
                    name: expression.name.clone(),
                    reason: "no XML source".to_string(),
                })
            }
        };

        let matches = XmlDocument::parse(xml)?.read(&expression.content)?;
        if expression.return_type == DataType::List {
            return Ok(Value::List(matches.into_iter().map(Value::String).collect()));
        }
        match matches.into_iter().next() {
            Some(text) => Self::convert(expression, text),
            None => Ok(Value::Null),
        }
    }

    fn validate(&self, expression: &Expression) -> Result<(), ExpressionError> {
        validate_xpath(&expression.content)?;
        if expression.dependencies.len() != 1 {
            return Err(ExpressionError::Invalid {
                name: expression.name.clone(),
                reason: "expects exactly one XML source".to_string(),
            });
        }
        Ok(())
    }

    fn description(&self) -> &str {
        "XPath read on XML data; a list return type yields every match"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticContext;

    #[test]
    fn test_reads_typed_values() {
        let xml = Value::Xml("<order><qty>3</qty><qty>4</qty></order>".to_string());
        let ctx = StaticContext::new();

        let mut expr = Expression::xpath_read("/order/qty", "order");
        expr.return_type = DataType::Long;
        assert_eq!(
            XPathReadEvaluator.evaluate(&expr, &[xml.clone()], &ctx).unwrap(),
            Value::Long(3)
        );

        expr.return_type = DataType::List;
        assert_eq!(
            XPathReadEvaluator.evaluate(&expr, &[xml], &ctx).unwrap(),
            Value::List(vec![Value::from("3"), Value::from("4")])
        );
    }

    #[test]
    fn test_invalid_xpath_is_rejected_at_validation() {
        let expr = Expression::xpath_read("order/qty", "order");
        assert!(matches!(
            XPathReadEvaluator.validate(&expr),
            Err(ExpressionError::Xml(_))
        ));
    }
}
