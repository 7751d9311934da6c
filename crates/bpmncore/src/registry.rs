use crate::evaluator::ExpressionEvaluator;
use crate::expression::ExpressionKind;
use crate::value::Value;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// `(receiver type, method, argument type)` key of a method operation
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MethodSignature {
    pub receiver_type: String,
    pub method: String,
    pub argument_type: Option<String>,
}

impl MethodSignature {
    pub fn new(receiver_type: &str, method: &str, argument_type: Option<&str>) -> Self {
        Self {
            receiver_type: receiver_type.to_string(),
            method: method.to_string(),
            argument_type: argument_type.map(str::to_string),
        }
    }
}

impl fmt::Display for MethodSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}.{}({})",
            self.receiver_type,
            self.method,
            self.argument_type.as_deref().unwrap_or("")
        )
    }
}

/// Method invoked in place on the current value of a data item
pub trait MethodHandler: Send + Sync {
    fn signature(&self) -> MethodSignature;

    /// Mutates `receiver`; the error string becomes the operation failure reason
    fn invoke(&self, receiver: &mut Value, argument: Option<Value>) -> Result<(), String>;

    fn description(&self) -> &str {
        ""
    }
}

/// Registry of expression evaluators and method handlers
pub struct EvaluatorRegistry {
    evaluators: HashMap<ExpressionKind, Arc<dyn ExpressionEvaluator>>,
    methods: HashMap<MethodSignature, Arc<dyn MethodHandler>>,
}

impl EvaluatorRegistry {
    pub fn new() -> Self {
        Self {
            evaluators: HashMap::new(),
            methods: HashMap::new(),
        }
    }

    /// Register an evaluator, replacing any previous one of the same kind
    pub fn register(&mut self, evaluator: Arc<dyn ExpressionEvaluator>) {
        let kind = evaluator.kind();
        tracing::debug!("Registering evaluator: {}", kind);
        self.evaluators.insert(kind, evaluator);
    }

    pub fn register_method(&mut self, handler: Arc<dyn MethodHandler>) {
        let signature = handler.signature();
        tracing::debug!("Registering method: {}", signature);
        self.methods.insert(signature, handler);
    }

    pub fn evaluator(&self, kind: ExpressionKind) -> Option<&Arc<dyn ExpressionEvaluator>> {
        self.evaluators.get(&kind)
    }

    pub fn method(&self, signature: &MethodSignature) -> Option<&Arc<dyn MethodHandler>> {
        self.methods.get(signature)
    }

    pub fn list_kinds(&self) -> Vec<ExpressionKind> {
        let mut kinds: Vec<_> = self.evaluators.keys().copied().collect();
        kinds.sort_by_key(|k| k.as_str());
        kinds
    }

    pub fn list_methods(&self) -> Vec<MethodSignature> {
        let mut signatures: Vec<_> = self.methods.keys().cloned().collect();
        signatures.sort_by_key(|s| s.to_string());
        signatures
    }

    pub fn describe(&self, kind: ExpressionKind) -> Option<&str> {
        self.evaluators.get(&kind).map(|e| e.description())
    }
}

impl Default for EvaluatorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
