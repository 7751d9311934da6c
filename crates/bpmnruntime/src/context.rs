use crate::config::EngineConfig;
use crate::graph::FlowGraph;
use crate::operations::OperationEvaluator;
use crate::resolver::ExpressionResolver;
use crate::scheduler::WorkQueue;
use crate::store::ProcessStore;
use crate::working_set::WorkingSet;
use bpmncore::{
    DefinitionId, EngineConstants, EngineError, EngineEvent, EventBus, FlowNodeInstance, NotFound,
    ProcessDefinition, ProcessInstance, Result, ValidationError,
};
use chrono::Utc;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// A definition together with its flow graph
#[derive(Debug)]
pub struct DeployedProcess {
    pub definition: ProcessDefinition,
    pub graph: FlowGraph,
}

/// State shared by every engine component
pub struct EngineContext {
    pub config: EngineConfig,
    pub store: Arc<dyn ProcessStore>,
    pub resolver: Arc<ExpressionResolver>,
    pub operations: OperationEvaluator,
    pub events: Arc<EventBus>,
    pub queue: WorkQueue,
    deployed: RwLock<HashMap<DefinitionId, Arc<DeployedProcess>>>,
}

impl EngineContext {
    pub fn new(
        config: EngineConfig,
        store: Arc<dyn ProcessStore>,
        resolver: Arc<ExpressionResolver>,
    ) -> Self {
        let events = Arc::new(EventBus::new(config.event_buffer_size));
        Self {
            operations: OperationEvaluator::new(resolver.clone()),
            config,
            store,
            resolver,
            events,
            queue: WorkQueue::new(),
            deployed: RwLock::new(HashMap::new()),
        }
    }

    /// Loads the definition on first use and keeps it with its graph
    pub async fn deployed(&self, id: DefinitionId) -> Result<Arc<DeployedProcess>> {
        let cached = self.deployed.read().get(&id).cloned();
        if let Some(deployed) = cached {
            return Ok(deployed);
        }

        let definition = self
            .store
            .get_definition(id)
            .await?
            .ok_or_else(|| NotFound::ProcessDefinition(id.to_string()))?;
        let graph = FlowGraph::build(&definition)
            .map_err(|problems| EngineError::Validation(ValidationError::new(problems)))?;
        Ok(self.remember(definition, graph))
    }

    pub fn remember(&self, definition: ProcessDefinition, graph: FlowGraph) -> Arc<DeployedProcess> {
        let deployed = Arc::new(DeployedProcess { definition, graph });
        self.deployed
            .write()
            .insert(deployed.definition.id, deployed.clone());
        deployed
    }

    pub fn forget(&self, id: DefinitionId) {
        self.deployed.write().remove(&id);
    }

    pub fn constants(
        &self,
        instance: &ProcessInstance,
        node: Option<&FlowNodeInstance>,
    ) -> EngineConstants {
        EngineConstants {
            logged_user_id: node
                .and_then(|n| n.executed_by)
                .unwrap_or(instance.started_by),
            process_instance_id: instance.id,
            root_process_instance_id: instance.root_process_instance_id,
            process_definition_id: instance.definition_id,
            process_initiator_id: instance.started_by,
            activity_instance_id: node.map(|n| n.id),
            loop_counter: node.and_then(|n| n.loop_counter),
            task_assignee_id: node
                .and_then(|n| n.as_assignable())
                .and_then(|task| task.assignee_id()),
        }
    }

    /// Data, documents and inputs visible from `node`
    pub async fn working_set(
        &self,
        deployed: &DeployedProcess,
        node: &FlowNodeInstance,
    ) -> Result<(ProcessInstance, WorkingSet)> {
        let instance = self
            .store
            .get_process_instance(node.process_instance_id)
            .await?
            .ok_or(NotFound::ProcessInstance(node.process_instance_id))?;
        let constants = self.constants(&instance, Some(node));
        let set = WorkingSet::for_flow_node(
            self.store.as_ref(),
            &deployed.definition,
            &instance,
            node,
            constants,
        )
        .await?;
        Ok((instance, set))
    }

    pub fn emit_state(&self, node: &FlowNodeInstance) {
        self.events.emit(EngineEvent::FlowNodeStateChanged {
            process_instance_id: node.process_instance_id,
            flow_node_id: node.id,
            name: node.name.clone(),
            node_type: node.node_type(),
            state: node.state,
            timestamp: Utc::now(),
        });
    }
}
