use crate::store::{DataUpdate, DocumentUpdate, MutationBatch, ProcessActivation, ProcessStore};
use bpmncore::{
    DataContainer, DataDefinition, DataInstance, DataType, Document, EngineConstants,
    EvaluationContext, FlowNodeInstance, MessageInstance, ProcessDefinition, ProcessInstance,
    ProcessInstanceId, Result, Value, STRING_INDEX_SLOTS,
};
use std::collections::BTreeMap;

#[derive(Debug, Clone)]
pub struct DataSlot {
    pub container: DataContainer,
    pub data_type: DataType,
    pub value: Value,
    pub transient: bool,
    dirty: bool,
}

/// Values one operation batch reads and writes.
///
/// Writes stay pending until [`WorkingSet::into_batch`], and every read sees
/// the writes made earlier in the batch. Activity data shadows process data of
/// the same name.
pub struct WorkingSet {
    process_instance_id: ProcessInstanceId,
    data: BTreeMap<String, DataSlot>,
    /// Declared document names; `true` for lists
    declared_documents: BTreeMap<String, bool>,
    documents: BTreeMap<String, Vec<Document>>,
    document_updates: BTreeMap<String, DocumentUpdate>,
    string_indexes: [Option<String>; STRING_INDEX_SLOTS],
    string_indexes_dirty: bool,
    external_data: BTreeMap<String, Value>,
    messages: Vec<MessageInstance>,
    inputs: BTreeMap<String, Value>,
    constants: EngineConstants,
}

impl WorkingSet {
    fn empty(
        definition: &ProcessDefinition,
        process_instance_id: ProcessInstanceId,
        constants: EngineConstants,
    ) -> Self {
        Self {
            process_instance_id,
            data: BTreeMap::new(),
            declared_documents: definition
                .documents
                .iter()
                .map(|d| (d.name.clone(), d.multiple))
                .collect(),
            documents: BTreeMap::new(),
            document_updates: BTreeMap::new(),
            string_indexes: Default::default(),
            string_indexes_dirty: false,
            external_data: BTreeMap::new(),
            messages: Vec::new(),
            inputs: BTreeMap::new(),
            constants,
        }
    }

    /// Instance being started: process data declared but not yet stored
    pub fn for_new_instance(
        definition: &ProcessDefinition,
        process_instance_id: ProcessInstanceId,
        constants: EngineConstants,
        inputs: BTreeMap<String, Value>,
    ) -> Self {
        let mut set = Self::empty(definition, process_instance_id, constants);
        set.inputs = inputs;
        for data in &definition.data {
            set.declare(DataContainer::Process(process_instance_id), data);
        }
        set
    }

    /// Everything visible from a flow node of a running instance
    pub async fn for_flow_node(
        store: &dyn ProcessStore,
        definition: &ProcessDefinition,
        instance: &ProcessInstance,
        node: &FlowNodeInstance,
        constants: EngineConstants,
    ) -> Result<Self> {
        let mut set = Self::empty(definition, instance.id, constants);
        set.string_indexes = instance.string_indexes.clone();
        set.inputs = node.trigger_inputs.clone();

        let process_data = store.list_data(DataContainer::Process(instance.id)).await?;
        let activity_data = store.list_data(DataContainer::Activity(node.id)).await?;
        for data in process_data.into_iter().chain(activity_data) {
            set.data.insert(
                data.name.clone(),
                DataSlot {
                    container: data.container,
                    data_type: data.data_type,
                    value: data.value,
                    transient: data.transient,
                    dirty: false,
                },
            );
        }
        for (name, slot) in store.list_documents(instance.id).await? {
            set.documents.insert(name, slot.documents().to_vec());
        }
        Ok(set)
    }

    /// Adds a data slot holding null
    pub fn declare(&mut self, container: DataContainer, definition: &DataDefinition) {
        self.data.insert(
            definition.name.clone(),
            DataSlot {
                container,
                data_type: definition.data_type.clone(),
                value: Value::Null,
                transient: definition.transient,
                dirty: false,
            },
        );
    }

    pub fn process_instance_id(&self) -> ProcessInstanceId {
        self.process_instance_id
    }

    pub fn author(&self) -> bpmncore::UserId {
        self.constants.logged_user_id
    }

    pub fn slot(&self, name: &str) -> Option<&DataSlot> {
        self.data.get(name)
    }

    /// The caller checks the declared type
    pub fn set_data(&mut self, name: &str, value: Value) -> bool {
        match self.data.get_mut(name) {
            Some(slot) => {
                slot.value = value;
                slot.dirty = true;
                true
            }
            None => false,
        }
    }

    pub fn string_indexes(&self) -> &[Option<String>; STRING_INDEX_SLOTS] {
        &self.string_indexes
    }

    pub fn set_string_index(&mut self, position: usize, value: Option<String>) {
        if let Some(slot) = self.string_indexes.get_mut(position) {
            *slot = value;
            self.string_indexes_dirty = true;
        }
    }

    /// `Some(true)` for a document list, `None` when undeclared
    pub fn document_declaration(&self, name: &str) -> Option<bool> {
        self.declared_documents.get(name).copied()
    }

    pub fn set_document(&mut self, name: &str, document: Option<Document>) {
        self.documents
            .insert(name.to_string(), document.iter().cloned().collect());
        self.document_updates.insert(
            name.to_string(),
            DocumentUpdate::Set {
                process_instance_id: self.process_instance_id,
                name: name.to_string(),
                document,
            },
        );
    }

    pub fn set_document_list(&mut self, name: &str, documents: Vec<Document>) {
        self.documents.insert(name.to_string(), documents.clone());
        self.document_updates.insert(
            name.to_string(),
            DocumentUpdate::SetList {
                process_instance_id: self.process_instance_id,
                name: name.to_string(),
                documents,
            },
        );
    }

    pub fn set_external_data(&mut self, name: &str, value: Value) {
        self.external_data.insert(name.to_string(), value);
    }

    pub fn push_message(&mut self, message: MessageInstance) {
        self.messages.push(message);
    }

    /// Pending writes, ready for [`ProcessStore::commit_execution`]
    pub fn into_batch(self) -> MutationBatch {
        let process_instance_id = self.process_instance_id;
        MutationBatch {
            data: self
                .data
                .into_iter()
                .filter(|(_, slot)| slot.dirty)
                .map(|(name, slot)| DataUpdate {
                    container: slot.container,
                    name,
                    value: slot.value,
                })
                .collect(),
            string_indexes: self
                .string_indexes_dirty
                .then_some((process_instance_id, self.string_indexes)),
            documents: self.document_updates.into_values().collect(),
            external_data: self
                .external_data
                .into_iter()
                .map(|(name, value)| (process_instance_id, name, value))
                .collect(),
            messages: self.messages,
        }
    }

    /// Initial state of an instance built with [`WorkingSet::for_new_instance`]
    pub fn into_activation(self, nodes: Vec<FlowNodeInstance>) -> ProcessActivation {
        ProcessActivation {
            id: self.process_instance_id,
            data: self
                .data
                .into_iter()
                .map(|(name, slot)| {
                    let mut data = DataInstance::new(name, slot.container, slot.data_type, slot.value);
                    data.transient = slot.transient;
                    data
                })
                .collect(),
            documents: self.document_updates.into_values().collect(),
            string_indexes: self.string_indexes,
            nodes,
        }
    }
}

impl EvaluationContext for WorkingSet {
    fn data(&self, name: &str) -> Option<Value> {
        self.data.get(name).map(|slot| slot.value.clone())
    }

    fn input(&self, name: &str) -> Option<Value> {
        self.inputs.get(name).cloned()
    }

    fn documents(&self, name: &str) -> Option<Vec<Document>> {
        self.declared_documents.get(name)?;
        Some(self.documents.get(name).cloned().unwrap_or_default())
    }

    fn constants(&self) -> &EngineConstants {
        &self.constants
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn constants() -> EngineConstants {
        EngineConstants {
            logged_user_id: 3,
            process_instance_id: 10,
            root_process_instance_id: 10,
            process_definition_id: Default::default(),
            process_initiator_id: 3,
            activity_instance_id: None,
            loop_counter: None,
            task_assignee_id: None,
        }
    }

    #[test]
    fn test_only_written_slots_reach_the_batch() {
        let definition = ProcessDefinition::new("p", "1.0")
            .with_data(DataDefinition::new("a", DataType::Long))
            .with_data(DataDefinition::new("b", DataType::Long));
        let mut set = WorkingSet::for_new_instance(&definition, 10, constants(), BTreeMap::new());

        assert!(set.set_data("b", Value::Long(2)));
        assert!(!set.set_data("missing", Value::Long(2)));
        assert_eq!(set.data("b"), Some(Value::Long(2)));

        let batch = set.into_batch();
        assert_eq!(batch.data.len(), 1);
        assert_eq!(batch.data[0].name, "b");
        assert!(batch.string_indexes.is_none());
    }

    #[test]
    fn test_declared_document_without_content_reads_empty() {
        let definition =
            ProcessDefinition::new("p", "1.0").with_document(bpmncore::DocumentDefinition::single("doc"));
        let set = WorkingSet::for_new_instance(&definition, 10, constants(), BTreeMap::new());
        assert_eq!(set.documents("doc"), Some(vec![]));
        assert_eq!(set.documents("other"), None);
    }
}
