use bpmncore::{ElementId, FlowNodeDefinitionKind, ProcessDefinition};
use petgraph::algo::has_path_connecting;
use petgraph::graph::{DiGraph, NodeIndex};
use petgraph::visit::Dfs;
use std::collections::{HashMap, HashSet};

/// Flow structure of a definition: transitions plus an edge from every
/// activity to each of its boundary events
#[derive(Debug, Clone)]
pub struct FlowGraph {
    graph: DiGraph<ElementId, ()>,
    index: HashMap<ElementId, NodeIndex>,
}

impl FlowGraph {
    /// Problems with dangling references are returned together
    pub fn build(definition: &ProcessDefinition) -> Result<Self, Vec<String>> {
        let mut graph = DiGraph::new();
        let mut index = HashMap::new();
        let mut problems = Vec::new();

        for node in &definition.flow_nodes {
            if index.insert(node.id, graph.add_node(node.id)).is_some() {
                problems.push(format!("Duplicate flow node id {}", node.id));
            }
        }

        for transition in &definition.transitions {
            let source = index.get(&transition.source);
            let target = index.get(&transition.target);
            match (source, target) {
                (Some(source), Some(target)) => {
                    graph.add_edge(*source, *target, ());
                }
                _ => {
                    if source.is_none() {
                        problems.push(format!(
                            "Transition {} has unknown source {}",
                            transition.id, transition.source
                        ));
                    }
                    if target.is_none() {
                        problems.push(format!(
                            "Transition {} has unknown target {}",
                            transition.id, transition.target
                        ));
                    }
                }
            }
        }

        for node in &definition.flow_nodes {
            if let FlowNodeDefinitionKind::BoundaryEvent { attached_to, .. } = node.kind {
                match definition.find_node(attached_to) {
                    Some(activity) if activity.is_activity() => {
                        graph.add_edge(index[&attached_to], index[&node.id], ());
                    }
                    Some(other) => problems.push(format!(
                        "Boundary event '{}' is attached to '{}', which is not an activity",
                        node.name, other.name
                    )),
                    None => problems.push(format!(
                        "Boundary event '{}' is attached to unknown node {}",
                        node.name, attached_to
                    )),
                }
            }
        }

        if problems.is_empty() {
            Ok(Self { graph, index })
        } else {
            Err(problems)
        }
    }

    /// Whether a token at `from` can still arrive at `to`
    pub fn can_reach(&self, from: ElementId, to: ElementId) -> bool {
        match (self.index.get(&from), self.index.get(&to)) {
            (Some(from), Some(to)) => has_path_connecting(&self.graph, *from, *to, None),
            _ => false,
        }
    }

    /// Nodes no start event, triggered or not, leads to
    pub fn unreachable_nodes(&self, definition: &ProcessDefinition) -> Vec<ElementId> {
        let starts = definition.flow_nodes.iter().filter(|n| {
            matches!(n.kind, FlowNodeDefinitionKind::StartEvent(_))
                || (definition.incoming(n.id).next().is_none()
                    && !matches!(n.kind, FlowNodeDefinitionKind::BoundaryEvent { .. }))
        });

        let mut reached = HashSet::new();
        for start in starts {
            let Some(&start) = self.index.get(&start.id) else {
                continue;
            };
            let mut dfs = Dfs::new(&self.graph, start);
            while let Some(next) = dfs.next(&self.graph) {
                reached.insert(self.graph[next]);
            }
        }

        definition
            .flow_nodes
            .iter()
            .map(|n| n.id)
            .filter(|id| !reached.contains(id))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmncore::{EventTrigger, FlowNodeDefinition, GatewayType};

    #[test]
    fn test_reachability_includes_boundary_paths() {
        let mut definition = ProcessDefinition::new("p", "1.0");
        let start = definition.add_node(FlowNodeDefinition::start_event("start"));
        let task = definition.add_node(FlowNodeDefinition::user_task("task", "clerk"));
        let boundary = definition.add_node(FlowNodeDefinition::boundary_event(
            "late",
            task,
            EventTrigger::signal("late"),
            true,
        ));
        let join = definition.add_node(FlowNodeDefinition::gateway("join", GatewayType::Inclusive));
        definition.connect(start, task);
        definition.connect(task, join);
        definition.connect(boundary, join);

        let graph = FlowGraph::build(&definition).unwrap();
        assert!(graph.can_reach(start, join));
        assert!(graph.can_reach(task, boundary));
        assert!(!graph.can_reach(join, start));
        assert!(graph.unreachable_nodes(&definition).is_empty());
    }

    #[test]
    fn test_dangling_references_are_all_reported() {
        let mut definition = ProcessDefinition::new("p", "1.0");
        let start = definition.add_node(FlowNodeDefinition::start_event("start"));
        let gateway = definition.add_node(FlowNodeDefinition::gateway("g", GatewayType::Parallel));
        definition.connect(start, uuid::Uuid::new_v4());
        definition.add_node(FlowNodeDefinition::boundary_event(
            "b",
            gateway,
            EventTrigger::signal("s"),
            false,
        ));

        let problems = FlowGraph::build(&definition).unwrap_err();
        assert_eq!(problems.len(), 2, "{:?}", problems);
    }
}
