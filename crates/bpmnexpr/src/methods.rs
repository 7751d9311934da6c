use bpmncore::{DataType, MethodHandler, MethodSignature, Value};

/// Built-in method on a value type, backed by a plain function
pub struct BuiltinMethod {
    signature: MethodSignature,
    apply: fn(&mut Value, Option<Value>) -> Result<(), String>,
    description: &'static str,
}

impl BuiltinMethod {
    pub fn new(
        receiver: &DataType,
        method: &str,
        argument: Option<&DataType>,
        apply: fn(&mut Value, Option<Value>) -> Result<(), String>,
        description: &'static str,
    ) -> Self {
        Self {
            signature: MethodSignature::new(
                receiver.type_name(),
                method,
                argument.map(DataType::type_name),
            ),
            apply,
            description,
        }
    }
}

impl MethodHandler for BuiltinMethod {
    fn signature(&self) -> MethodSignature {
        self.signature.clone()
    }

    fn invoke(&self, receiver: &mut Value, argument: Option<Value>) -> Result<(), String> {
        (self.apply)(receiver, argument)
    }

    fn description(&self) -> &str {
        self.description
    }
}

/// Methods every registry gets from [`crate::register_all`]
pub fn standard_methods() -> Vec<BuiltinMethod> {
    vec![
        BuiltinMethod::new(
            &DataType::List,
            "add",
            Some(&DataType::Any),
            list_add,
            "Append one element",
        ),
        BuiltinMethod::new(
            &DataType::List,
            "addAll",
            Some(&DataType::List),
            list_add_all,
            "Append every element of another list",
        ),
        BuiltinMethod::new(&DataType::List, "clear", None, list_clear, "Remove all elements"),
        BuiltinMethod::new(
            &DataType::Map,
            "putAll",
            Some(&DataType::Map),
            map_put_all,
            "Insert every entry of another map",
        ),
        BuiltinMethod::new(
            &DataType::Text,
            "append",
            Some(&DataType::Text),
            text_append,
            "Append text",
        ),
        BuiltinMethod::new(
            &DataType::Long,
            "add",
            Some(&DataType::Long),
            long_add,
            "Add to the current number",
        ),
    ]
}

fn list_add(receiver: &mut Value, argument: Option<Value>) -> Result<(), String> {
    match receiver {
        Value::Null => *receiver = Value::List(vec![argument.unwrap_or(Value::Null)]),
        Value::List(items) => items.push(argument.unwrap_or(Value::Null)),
        other => return Err(format!("cannot add to {}", other.type_name())),
    }
    Ok(())
}

fn list_add_all(receiver: &mut Value, argument: Option<Value>) -> Result<(), String> {
    let extra = match argument {
        Some(Value::List(items)) => items,
        Some(Value::Null) | None => Vec::new(),
        Some(other) => return Err(format!("expected a list argument, got {}", other.type_name())),
    };
    match receiver {
        Value::Null => *receiver = Value::List(extra),
        Value::List(items) => items.extend(extra),
        other => return Err(format!("cannot add to {}", other.type_name())),
    }
    Ok(())
}

fn list_clear(receiver: &mut Value, _argument: Option<Value>) -> Result<(), String> {
    match receiver {
        Value::Null => *receiver = Value::List(Vec::new()),
        Value::List(items) => items.clear(),
        other => return Err(format!("cannot clear {}", other.type_name())),
    }
    Ok(())
}

fn map_put_all(receiver: &mut Value, argument: Option<Value>) -> Result<(), String> {
    let entries = match argument {
        Some(Value::Map(entries)) => entries,
        Some(Value::Null) | None => Default::default(),
        Some(other) => return Err(format!("expected a map argument, got {}", other.type_name())),
    };
    match receiver {
        Value::Null => *receiver = Value::Map(entries),
        Value::Map(current) => current.extend(entries),
        other => return Err(format!("cannot put into {}", other.type_name())),
    }
    Ok(())
}

fn text_append(receiver: &mut Value, argument: Option<Value>) -> Result<(), String> {
    let suffix = argument.and_then(|v| v.to_text()).unwrap_or_default();
    match receiver {
        Value::Null => *receiver = Value::String(suffix),
        Value::String(text) => text.push_str(&suffix),
        other => return Err(format!("cannot append to {}", other.type_name())),
    }
    Ok(())
}

fn long_add(receiver: &mut Value, argument: Option<Value>) -> Result<(), String> {
    let delta = match argument {
        Some(Value::Long(n)) => n,
        Some(other) => return Err(format!("expected a long argument, got {}", other.type_name())),
        None => return Err("missing argument".to_string()),
    };
    match receiver {
        Value::Null => *receiver = Value::Long(delta),
        Value::Long(n) => *n = n.checked_add(delta).ok_or("integer overflow")?,
        other => return Err(format!("cannot add to {}", other.type_name())),
    }
    Ok(())
}

/// Setter on a business object: `Class.setField(type)` writes `field`
pub struct ObjectFieldSetter {
    class_name: String,
    method: String,
    field: String,
    field_type: DataType,
}

impl ObjectFieldSetter {
    pub fn new(class_name: &str, field: &str, field_type: DataType) -> Self {
        let mut chars = field.chars();
        let capitalized = match chars.next() {
            Some(first) => first.to_uppercase().chain(chars).collect::<String>(),
            None => String::new(),
        };
        Self {
            class_name: class_name.to_string(),
            method: format!("set{}", capitalized),
            field: field.to_string(),
            field_type,
        }
    }
}

impl MethodHandler for ObjectFieldSetter {
    fn signature(&self) -> MethodSignature {
        MethodSignature::new(
            &self.class_name,
            &self.method,
            Some(self.field_type.type_name()),
        )
    }

    fn invoke(&self, receiver: &mut Value, argument: Option<Value>) -> Result<(), String> {
        let value = argument.unwrap_or(Value::Null);
        if !self.field_type.accepts(&value) {
            return Err(format!(
                "field '{}' expects {}, got {}",
                self.field,
                self.field_type,
                value.type_name()
            ));
        }
        match receiver {
            Value::Object(object) if object.class_name == self.class_name => {
                object.fields.insert(self.field.clone(), value);
                Ok(())
            }
            other => Err(format!(
                "expected a {} receiver, got {}",
                self.class_name,
                other.type_name()
            )),
        }
    }

    fn description(&self) -> &str {
        "Business object field setter"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmncore::ObjectValue;

    fn method(receiver: &DataType, name: &str) -> BuiltinMethod {
        standard_methods()
            .into_iter()
            .find(|m| {
                m.signature.receiver_type == receiver.type_name() && m.signature.method == name
            })
            .unwrap()
    }

    #[test]
    fn test_list_methods_mutate_in_place() {
        let mut value = Value::List(vec![Value::Long(1)]);
        method(&DataType::List, "add")
            .invoke(&mut value, Some(Value::Long(2)))
            .unwrap();
        method(&DataType::List, "addAll")
            .invoke(&mut value, Some(Value::List(vec![Value::Long(3)])))
            .unwrap();
        assert_eq!(
            value,
            Value::List(vec![Value::Long(1), Value::Long(2), Value::Long(3)])
        );

        method(&DataType::List, "clear").invoke(&mut value, None).unwrap();
        assert_eq!(value, Value::List(vec![]));
    }

    #[test]
    fn test_text_append_on_null_starts_fresh() {
        let mut value = Value::Null;
        method(&DataType::Text, "append")
            .invoke(&mut value, Some(Value::from("abc")))
            .unwrap();
        assert_eq!(value, Value::from("abc"));
    }

    #[test]
    fn test_object_setter() {
        let setter = ObjectFieldSetter::new("Invoice", "amount", DataType::Long);
        assert_eq!(setter.signature().to_string(), "Invoice.setAmount(long)");

        let mut invoice = Value::Object(ObjectValue::new("Invoice"));
        setter.invoke(&mut invoice, Some(Value::Long(12))).unwrap();
        assert_eq!(
            invoice,
            Value::Object(ObjectValue::new("Invoice").with_field("amount", 12i64))
        );

        assert!(setter.invoke(&mut invoice, Some(Value::from("12"))).is_err());
        let mut order = Value::Object(ObjectValue::new("Order"));
        assert!(setter.invoke(&mut order, Some(Value::Long(1))).is_err());
    }
}
