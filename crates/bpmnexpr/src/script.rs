use bpmncore::{
    EvaluationContext, Expression, ExpressionError, ExpressionEvaluator, ExpressionKind, Value,
};
use chrono::{Duration, Utc};
use std::collections::HashMap;

/// Function callable from a script expression
pub type ScriptFunction = fn(&[Value]) -> Result<Value, String>;

/// Dispatches script expressions to registered functions by name.
///
/// Scripts never reach an interpreter; the function table is the whole language.
pub struct ScriptEvaluator {
    functions: HashMap<String, ScriptFunction>,
}

impl ScriptEvaluator {
    pub fn new() -> Self {
        Self {
            functions: HashMap::new(),
        }
    }

    pub fn with_standard_functions() -> Self {
        let mut evaluator = Self::new();
        evaluator.register("concat", concat);
        evaluator.register("length", length);
        evaluator.register("sum", sum);
        evaluator.register("multiply", multiply);
        evaluator.register("upper", upper);
        evaluator.register("lower", lower);
        evaluator.register("coalesce", coalesce);
        evaluator.register("to_text", to_text);
        evaluator.register("now", now);
        evaluator.register("add_days", add_days);
        evaluator.register("map", map);
        evaluator
    }

    pub fn register(&mut self, name: &str, function: ScriptFunction) {
        self.functions.insert(name.to_string(), function);
    }

    pub fn function_names(&self) -> Vec<&str> {
        let mut names: Vec<_> = self.functions.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

impl Default for ScriptEvaluator {
    fn default() -> Self {
        Self::with_standard_functions()
    }
}

impl ExpressionEvaluator for ScriptEvaluator {
    fn kind(&self) -> ExpressionKind {
        ExpressionKind::Script
    }

    fn evaluate(
        &self,
        expression: &Expression,
        dependencies: &[Value],
        _context: &dyn EvaluationContext,
    ) -> Result<Value, ExpressionError> {
        let function = self
            .functions
            .get(&expression.content)
            .ok_or_else(|| ExpressionError::UnknownFunction(expression.content.clone()))?;
        function(dependencies).map_err(|reason| ExpressionError::Failed {
            name: expression.name.clone(),
            reason,
        })
    }

    fn validate(&self, expression: &Expression) -> Result<(), ExpressionError> {
        if self.functions.contains_key(&expression.content) {
            Ok(())
        } else {
            Err(ExpressionError::UnknownFunction(expression.content.clone()))
        }
    }

    fn description(&self) -> &str {
        "Call of a registered script function with the dependencies as arguments"
    }
}

fn concat(args: &[Value]) -> Result<Value, String> {
    Ok(Value::String(
        args.iter().filter_map(Value::to_text).collect::<String>(),
    ))
}

fn length(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::String(s)] | [Value::Xml(s)] => Ok(Value::Long(s.chars().count() as i64)),
        [Value::List(items)] => Ok(Value::Long(items.len() as i64)),
        [Value::Map(entries)] => Ok(Value::Long(entries.len() as i64)),
        [Value::Null] => Ok(Value::Long(0)),
        [other] => Err(format!("length of {} is undefined", other.type_name())),
        _ => Err(format!("length takes one argument, got {}", args.len())),
    }
}

fn sum(args: &[Value]) -> Result<Value, String> {
    if args.iter().all(|v| matches!(v, Value::Long(_))) {
        let mut total: i64 = 0;
        for value in args {
            if let Value::Long(n) = value {
                total = total.checked_add(*n).ok_or("integer overflow")?;
            }
        }
        return Ok(Value::Long(total));
    }
    args.iter()
        .map(|v| v.as_f64().ok_or_else(|| format!("cannot add {}", v.type_name())))
        .sum::<Result<f64, String>>()
        .map(Value::Double)
}

fn multiply(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Long(a), Value::Long(b)] => a
            .checked_mul(*b)
            .map(Value::Long)
            .ok_or_else(|| "integer overflow".to_string()),
        [a, b] => match (a.as_f64(), b.as_f64()) {
            (Some(a), Some(b)) => Ok(Value::Double(a * b)),
            _ => Err(format!("cannot multiply {} by {}", a.type_name(), b.type_name())),
        },
        _ => Err(format!("multiply takes two arguments, got {}", args.len())),
    }
}

fn upper(args: &[Value]) -> Result<Value, String> {
    single_text(args).map(|s| Value::String(s.to_uppercase()))
}

fn lower(args: &[Value]) -> Result<Value, String> {
    single_text(args).map(|s| Value::String(s.to_lowercase()))
}

fn single_text(args: &[Value]) -> Result<String, String> {
    match args {
        [value] => value
            .to_text()
            .ok_or_else(|| "expected a non-null argument".to_string()),
        _ => Err(format!("expected one argument, got {}", args.len())),
    }
}

fn coalesce(args: &[Value]) -> Result<Value, String> {
    Ok(args
        .iter()
        .find(|v| !v.is_null())
        .cloned()
        .unwrap_or(Value::Null))
}

fn to_text(args: &[Value]) -> Result<Value, String> {
    match args {
        [value] => Ok(value.to_text().map(Value::String).unwrap_or(Value::Null)),
        _ => Err(format!("to_text takes one argument, got {}", args.len())),
    }
}

fn now(_args: &[Value]) -> Result<Value, String> {
    Ok(Value::Date(Utc::now()))
}

fn add_days(args: &[Value]) -> Result<Value, String> {
    match args {
        [Value::Date(date), Value::Long(days)] => Ok(Value::Date(*date + Duration::days(*days))),
        _ => Err("add_days expects (date, long)".to_string()),
    }
}

/// Builds a map from alternating key/value arguments
fn map(args: &[Value]) -> Result<Value, String> {
    if args.len() % 2 != 0 {
        return Err("map expects key/value pairs".to_string());
    }
    let mut out = std::collections::BTreeMap::new();
    for pair in args.chunks(2) {
        let key = pair[0]
            .to_text()
            .ok_or_else(|| "map keys cannot be null".to_string())?;
        out.insert(key, pair[1].clone());
    }
    Ok(Value::Map(out))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::StaticContext;
    use bpmncore::DataType;

    #[test]
    fn test_standard_functions() {
        let scripts = ScriptEvaluator::with_standard_functions();
        let ctx = StaticContext::new();
        let call = |name: &str, args: &[Value]| {
            let expr = Expression::script(name, vec![], DataType::Any);
            scripts.evaluate(&expr, args, &ctx)
        };

        assert_eq!(call("sum", &[Value::Long(2), Value::Long(3)]).unwrap(), Value::Long(5));
        assert_eq!(
            call("sum", &[Value::Long(2), Value::Double(0.5)]).unwrap(),
            Value::Double(2.5)
        );
        assert_eq!(
            call("concat", &[Value::from("a"), Value::Long(1)]).unwrap(),
            Value::from("a1")
        );
        assert_eq!(
            call("coalesce", &[Value::Null, Value::from("x")]).unwrap(),
            Value::from("x")
        );
        assert!(matches!(
            call("length", &[Value::Bool(true)]),
            Err(ExpressionError::Failed { .. })
        ));
    }

    #[test]
    fn test_unknown_function() {
        let expr = Expression::script("groovy", vec![], DataType::Any);
        assert!(matches!(
            ScriptEvaluator::new().validate(&expr),
            Err(ExpressionError::UnknownFunction(_))
        ));
    }
}
