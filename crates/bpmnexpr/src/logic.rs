use bpmncore::{
    EvaluationContext, Expression, ExpressionError, ExpressionEvaluator, ExpressionKind, Value,
};
use std::cmp::Ordering;

/// Collects its dependencies into a list
pub struct ListEvaluator;

impl ExpressionEvaluator for ListEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::List
    }

    fn evaluate(
        &self,
        _expression: &Expression,
        dependencies: &[Value],
        _context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        Ok(Value::List(dependencies.to_vec()))
    }

    fn description(&self) -> &str {
        "List of the dependency values in declaration order"
    }
}

const BINARY_COMPARATORS: [&str; 8] = ["==", "!=", "<", "<=", ">", ">=", "&&", "||"];

/// Binary comparison or boolean connective; `!` negates a single operand
pub struct ComparisonEvaluator;

impl ComparisonEvaluator {
    fn compare(left: &Value, right: &Value) -> Option<Ordering> {
        match (left, right) {
            (Value::Long(a), Value::Long(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
            (a, b) => match (a.as_f64(), b.as_f64()) {
                (Some(a), Some(b)) => a.partial_cmp(&b),
                _ => None,
            },
        }
    }

    fn equals(left: &Value, right: &Value) -> bool {
        match Self::compare(left, right) {
            Some(ordering) => ordering == Ordering::Equal,
            None => left == right,
        }
    }
}

impl ExpressionEvaluator for ComparisonEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::Comparison
    }

    fn evaluate(
        &self,
        expression: &Expression,
        dependencies: &[Value],
        _context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        let failed = |reason: String| ExpressionError::Failed {
            name: expression.name.clone(),
            reason,
        };
        let as_bool = |value: &Value| {
            value
                .as_bool()
                .ok_or_else(|| failed(format!("expected a boolean operand, got {}", value.type_name())))
        };

        if expression.content == "!" {
            let [operand] = dependencies else {
                return Err(failed("negation takes one operand".to_string()));
            };
            return Ok(Value::Bool(!as_bool(operand)?));
        }

        let [left, right] = dependencies else {
            return Err(failed(format!(
                "'{}' takes two operands, got {}",
                expression.content,
                dependencies.len()
            )));
        };

        let result = match expression.content.as_str() {
            "==" => Self::equals(left, right),
            "!=" => !Self::equals(left, right),
            "&&" => as_bool(left)? && as_bool(right)?,
            "||" => as_bool(left)? || as_bool(right)?,
            comparator => {
                let ordering = Self::compare(left, right).ok_or_else(|| {
                    failed(format!(
                        "cannot order {} and {}",
                        left.type_name(),
                        right.type_name()
                    ))
                })?;
                match comparator {
                    "<" => ordering == Ordering::Less,
                    "<=" => ordering != Ordering::Greater,
                    ">" => ordering == Ordering::Greater,
                    ">=" => ordering != Ordering::Less,
                    other => return Err(failed(format!("unknown comparator '{}'", other))),
                }
            }
        };
        Ok(Value::Bool(result))
    }

    fn validate(&self, expression: &Expression) -> Result<(), ExpressionError> {
        let arity = match expression.content.as_str() {
            "!" => 1,
            c if BINARY_COMPARATORS.contains(&c) => 2,
            other => {
                return Err(ExpressionError::Invalid {
                    name: expression.name.clone(),
                    reason: format!("unknown comparator '{}'", other),
                })
            }
        };
        if expression.dependencies.len() != arity {
            return Err(ExpressionError::Invalid {
                name: expression.name.clone(),
                reason: format!(
                    "'{}' takes {} operand(s), got {}",
                    expression.content,
                    arity,
                    expression.dependencies.len()
                ),
            });
        }
        Ok(())
    }

    fn description(&self) -> &str {
        "Comparison (==, !=, <, <=, >, >=) or boolean connective (&&, ||, !)"
    }
}

/// `${name}` placeholders replaced by the text of the dependency of that name
pub struct PatternEvaluator;

impl ExpressionEvaluator for PatternEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::Pattern
    }

    fn evaluate(
        &self,
        expression: &Expression,
        dependencies: &[Value],
        _context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        let mut out = String::with_capacity(expression.content.len());
        let mut rest = expression.content.as_str();

        while let Some(start) = rest.find("${") {
            out.push_str(&rest[..start]);
            let after = &rest[start + 2..];
            let end = after.find('}').ok_or_else(|| ExpressionError::Invalid {
                name: expression.name.clone(),
                reason: "unterminated placeholder".to_string(),
            })?;
            let name = &after[..end];
            let position = expression
                .dependencies
                .iter()
                .position(|d| d.name == name)
                .ok_or_else(|| ExpressionError::Failed {
                    name: expression.name.clone(),
                    reason: format!("no dependency named '{}'", name),
                })?;
            if let Some(text) = dependencies.get(position).and_then(Value::to_text) {
                out.push_str(&text);
            }
            rest = &after[end + 1..];
        }
        out.push_str(rest);
        Ok(Value::String(out))
    }

    fn description(&self) -> &str {
        "Text template with ${name} placeholders"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticContext;
    use bpmncore::DataType;

    fn context() -> StaticContext {
        StaticContext::new()
    }

    #[test]
    fn test_comparisons() {
        let ctx = context();
        let cmp = |op: &str, l: Value, r: Value| {
            let expr = Expression::comparison(op, Expression::long(0), Expression::long(0));
            ComparisonEvaluator.evaluate(&expr, &[l, r], &ctx).unwrap()
        };
        assert_eq!(cmp(">", Value::Long(3), Value::Long(2)), Value::Bool(true));
        assert_eq!(cmp("<=", Value::Long(3), Value::Double(2.5)), Value::Bool(false));
        assert_eq!(cmp("==", Value::from("a"), Value::from("a")), Value::Bool(true));
        assert_eq!(cmp("!=", Value::Null, Value::Long(1)), Value::Bool(true));
        assert_eq!(cmp("&&", Value::Bool(true), Value::Bool(false)), Value::Bool(false));
    }

    #[test]
    fn test_unknown_comparator_is_rejected_at_validation() {
        let expr = Expression::comparison("=~", Expression::long(1), Expression::long(2));
        assert!(ComparisonEvaluator.validate(&expr).is_err());
    }

    #[test]
    fn test_pattern_substitution() {
        let expr = Expression::pattern(
            "Order ${id} for ${customer}",
            vec![
                Expression::variable("id", DataType::Long),
                Expression::variable("customer", DataType::Text),
            ],
        );
        let value = PatternEvaluator
            .evaluate(&expr, &[Value::Long(42), Value::from("Ada")], &context())
            .unwrap();
        assert_eq!(value, Value::from("Order 42 for Ada"));
    }
}
