use bpmncore::{Document, EngineConstants, EvaluationContext, Value};
use std::collections::BTreeMap;

/// Fixed evaluation context for evaluator unit tests
pub struct StaticContext {
    pub data: BTreeMap<String, Value>,
    pub inputs: BTreeMap<String, Value>,
    pub documents: BTreeMap<String, Vec<Document>>,
    pub constants: EngineConstants,
}

impl StaticContext {
    pub fn new() -> Self {
        Self {
            data: BTreeMap::new(),
            inputs: BTreeMap::new(),
            documents: BTreeMap::new(),
            constants: EngineConstants {
                logged_user_id: 7,
                process_instance_id: 100,
                root_process_instance_id: 100,
                process_definition_id: Default::default(),
                process_initiator_id: 7,
                activity_instance_id: None,
                loop_counter: None,
                task_assignee_id: None,
            },
        }
    }

    pub fn with_data(mut self, name: &str, value: Value) -> Self {
        self.data.insert(name.to_string(), value);
        self
    }
}

impl EvaluationContext for StaticContext {
    fn data(&self, name: &str) -> Option<Value> {
        self.data.get(name).cloned()
    }

    fn input(&self, name: &str) -> Option<Value> {
        self.inputs.get(name).cloned()
    }

    fn documents(&self, name: &str) -> Option<Vec<Document>> {
        self.documents.get(name).cloned()
    }

    fn constants(&self) -> &EngineConstants {
        &self.constants
    }
}
