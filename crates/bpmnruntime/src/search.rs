use bpmncore::{
    DefinitionId, FlowNodeInstance, FlowNodeInstanceId, FlowNodeState, FlowNodeType,
    ProcessInstanceId, UserId,
};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Criteria a flow node must all satisfy; unset fields match anything
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlowNodeFilter {
    pub name: Option<String>,
    pub state: Option<FlowNodeState>,
    pub node_type: Option<FlowNodeType>,
    pub process_definition_id: Option<DefinitionId>,
    pub process_instance_id: Option<ProcessInstanceId>,
    pub parent_activity_instance_id: Option<FlowNodeInstanceId>,
    pub assignee_id: Option<UserId>,
    /// User listed as supervisor of the node's process definition
    pub supervisor_id: Option<UserId>,
}

impl FlowNodeFilter {
    pub fn user_tasks() -> Self {
        Self {
            node_type: Some(FlowNodeType::UserTask),
            ..Default::default()
        }
    }

    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn in_state(mut self, state: FlowNodeState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn in_process(mut self, process_instance_id: ProcessInstanceId) -> Self {
        self.process_instance_id = Some(process_instance_id);
        self
    }

    /// `supervisors` are those of the node's process definition
    pub fn matches(&self, node: &FlowNodeInstance, supervisors: &[UserId]) -> bool {
        fn check<T: PartialEq>(wanted: &Option<T>, actual: T) -> bool {
            wanted.as_ref().map_or(true, |w| *w == actual)
        }

        check(&self.name.as_deref(), node.name.as_str())
            && check(&self.state, node.state)
            && check(&self.node_type, node.node_type())
            && check(&self.process_definition_id, node.process_definition_id)
            && check(&self.process_instance_id, node.process_instance_id)
            && self
                .parent_activity_instance_id
                .map_or(true, |p| node.parent_activity_instance_id == Some(p))
            && self.assignee_id.map_or(true, |user| {
                node.as_assignable()
                    .and_then(|task| task.assignee_id())
                    == Some(user)
            })
            && self
                .supervisor_id
                .map_or(true, |user| supervisors.contains(&user))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowNodeSort {
    #[default]
    NameAsc,
    NameDesc,
    PriorityAsc,
    PriorityDesc,
    DueDateAsc,
    DueDateDesc,
    LastUpdateAsc,
    LastUpdateDesc,
}

impl FlowNodeSort {
    /// Nodes without a priority or due date sort last in both directions
    pub fn compare(&self, a: &FlowNodeInstance, b: &FlowNodeInstance) -> Ordering {
        fn missing_last<T: Ord>(a: Option<T>, b: Option<T>, descending: bool) -> Ordering {
            match (a, b) {
                (Some(a), Some(b)) if descending => b.cmp(&a),
                (Some(a), Some(b)) => a.cmp(&b),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        }
        let due = |n: &FlowNodeInstance| n.as_due_dated().and_then(|d| d.due_date());

        let ordering = match self {
            FlowNodeSort::NameAsc => a.name.cmp(&b.name),
            FlowNodeSort::NameDesc => b.name.cmp(&a.name),
            FlowNodeSort::PriorityAsc => missing_last(a.priority(), b.priority(), false),
            FlowNodeSort::PriorityDesc => missing_last(a.priority(), b.priority(), true),
            FlowNodeSort::DueDateAsc => missing_last(due(a), due(b), false),
            FlowNodeSort::DueDateDesc => missing_last(due(a), due(b), true),
            FlowNodeSort::LastUpdateAsc => a.last_update_date.cmp(&b.last_update_date),
            FlowNodeSort::LastUpdateDesc => b.last_update_date.cmp(&a.last_update_date),
        };
        ordering.then(a.id.cmp(&b.id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchOptions {
    pub filter: FlowNodeFilter,
    pub sort: FlowNodeSort,
    pub offset: usize,
    pub limit: usize,
}

impl SearchOptions {
    pub fn new(filter: FlowNodeFilter) -> Self {
        Self {
            filter,
            sort: FlowNodeSort::default(),
            offset: 0,
            limit: 100,
        }
    }

    pub fn sorted_by(mut self, sort: FlowNodeSort) -> Self {
        self.sort = sort;
        self
    }

    pub fn page(mut self, offset: usize, limit: usize) -> Self {
        self.offset = offset;
        self.limit = limit;
        self
    }
}

/// One page of results plus the total number of matches
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchResult<T> {
    pub count: usize,
    pub items: Vec<T>,
}

/// Sorts and pages nodes that already passed the filter
pub fn paginate(
    mut nodes: Vec<FlowNodeInstance>,
    options: &SearchOptions,
) -> SearchResult<FlowNodeInstance> {
    nodes.sort_by(|a, b| options.sort.compare(a, b));
    let count = nodes.len();
    let items = nodes
        .into_iter()
        .skip(options.offset)
        .take(options.limit)
        .collect();
    SearchResult { count, items }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmncore::{FlowNodeKind, HumanTask, TaskPriority};
    use uuid::Uuid;

    fn task(id: u64, name: &str, priority: TaskPriority, assignee: Option<UserId>) -> FlowNodeInstance {
        let mut node = FlowNodeInstance::new(
            Uuid::nil(),
            name,
            FlowNodeKind::UserTask(HumanTask {
                actor: "clerk".to_string(),
                assignee_id: assignee,
                claimed_date: None,
                priority,
                expected_end_date: None,
            }),
            1,
            1,
            Uuid::nil(),
        );
        node.id = id;
        node
    }

    #[test]
    fn test_filter_on_assignee_and_supervisor() {
        let node = task(1, "Review", TaskPriority::Normal, Some(5));
        assert!(FlowNodeFilter::user_tasks().matches(&node, &[]));

        let by_assignee = FlowNodeFilter {
            assignee_id: Some(5),
            ..Default::default()
        };
        assert!(by_assignee.matches(&node, &[]));

        let by_supervisor = FlowNodeFilter {
            supervisor_id: Some(9),
            ..Default::default()
        };
        assert!(!by_supervisor.matches(&node, &[3]));
        assert!(by_supervisor.matches(&node, &[3, 9]));
    }

    #[test]
    fn test_sort_and_page() {
        let nodes = vec![
            task(1, "b", TaskPriority::Lowest, None),
            task(2, "a", TaskPriority::Highest, None),
            task(3, "c", TaskPriority::Normal, None),
        ];
        let options = SearchOptions::new(FlowNodeFilter::default())
            .sorted_by(FlowNodeSort::PriorityDesc)
            .page(1, 1);

        let result = paginate(nodes, &options);
        assert_eq!(result.count, 3);
        assert_eq!(result.items.len(), 1);
        assert_eq!(result.items[0].name, "c");
    }
}
