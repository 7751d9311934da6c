//! Standard expression library
//!
//! Built-in evaluators for every expression kind plus the common method handlers

mod constant;
mod logic;
mod methods;
mod reference;
mod script;
mod xpath;

#[cfg(test)]
mod testing;

pub use constant::ConstantEvaluator;
pub use logic::{ComparisonEvaluator, ListEvaluator, PatternEvaluator};
pub use methods::{standard_methods, BuiltinMethod, ObjectFieldSetter};
pub use reference::{
    ContractInputEvaluator, DocumentListReferenceEvaluator, DocumentReferenceEvaluator,
    EngineConstantEvaluator, VariableEvaluator,
};
pub use script::{ScriptEvaluator, ScriptFunction};
pub use xpath::XPathReadEvaluator;

use bpmncore::EvaluatorRegistry;
use std::sync::Arc;

/// Register all standard evaluators and methods with a registry
pub fn register_all(registry: &mut EvaluatorRegistry) {
    registry.register(Arc::new(ConstantEvaluator));
    registry.register(Arc::new(VariableEvaluator));
    registry.register(Arc::new(ContractInputEvaluator));
    registry.register(Arc::new(EngineConstantEvaluator));
    registry.register(Arc::new(DocumentReferenceEvaluator));
    registry.register(Arc::new(DocumentListReferenceEvaluator));
    registry.register(Arc::new(ListEvaluator));
    registry.register(Arc::new(ComparisonEvaluator));
    registry.register(Arc::new(PatternEvaluator));
    registry.register(Arc::new(XPathReadEvaluator));
    registry.register(Arc::new(ScriptEvaluator::with_standard_functions()));

    for method in standard_methods() {
        registry.register_method(Arc::new(method));
    }
}

/// Registry with every standard evaluator and method
pub fn standard_registry() -> EvaluatorRegistry {
    let mut registry = EvaluatorRegistry::new();
    register_all(&mut registry);
    registry
}
