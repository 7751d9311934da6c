//! Restart recovery
//!
//! Runs once before the engine takes requests. Claims left by a dead worker
//! are cleared and every node that may have been interrupted mid-step is
//! queued again. Queuing a node twice is harmless: the executing flag lets
//! only one worker step it.

use crate::context::EngineContext;
use crate::scheduler::WorkItem;
use bpmncore::{
    EngineEvent, FlowNodeInstance, FlowNodeInstanceId, FlowNodeKind, FlowNodeState,
    ProcessInstanceState, Result,
};
use chrono::Utc;
use std::collections::HashSet;

/// What a recovery pass repaired
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecoveryReport {
    pub waiting_events_reset: usize,
    pub messages_reset: usize,
    pub flow_nodes_requeued: usize,
    /// Nodes left for the next restart, with the reason
    pub failures: Vec<(FlowNodeInstanceId, String)>,
}

pub async fn recover(ctx: &EngineContext) -> Result<RecoveryReport> {
    let mut report = RecoveryReport {
        waiting_events_reset: ctx.store.reset_in_progress_waiting_events().await?,
        messages_reset: ctx.store.reset_handled_messages().await?,
        ..Default::default()
    };
    tracing::info!(
        waiting_events = report.waiting_events_reset,
        messages = report.messages_reset,
        "released orphaned claims"
    );

    let mut queued = HashSet::new();
    for node in ctx.store.list_flow_nodes_to_restart().await? {
        match resubmit(ctx, &node).await {
            Ok(()) => {
                queued.insert(node.id);
            }
            Err(e) => {
                tracing::error!(flow_node = node.id, "cannot recover '{}': {}", node.name, e);
                report.failures.push((node.id, e.to_string()));
            }
        }
    }

    for instance in ctx
        .store
        .list_process_instances(Some(ProcessInstanceState::Started))
        .await?
    {
        let open = match ctx.store.list_flow_nodes(instance.id).await {
            Ok(open) => open,
            Err(e) => {
                tracing::error!(process_instance = instance.id, "cannot scan instance: {}", e);
                continue;
            }
        };
        if open.is_empty() {
            ctx.queue.push(WorkItem::CheckCompletion(instance.id));
            continue;
        }
        for node in open {
            if needs_wake(&node) && queued.insert(node.id) {
                ctx.queue.push(WorkItem::Execute(node.id));
            }
        }
    }
    ctx.queue.push(WorkItem::MatchMessages);

    report.flow_nodes_requeued = queued.len();
    tracing::info!(
        requeued = report.flow_nodes_requeued,
        failures = report.failures.len(),
        "recovery done"
    );
    ctx.events.emit(EngineEvent::RecoveryCompleted {
        waiting_events_reset: report.waiting_events_reset,
        messages_reset: report.messages_reset,
        flow_nodes_requeued: report.flow_nodes_requeued,
        failures: report.failures.len(),
        timestamp: Utc::now(),
    });
    Ok(report)
}

async fn resubmit(ctx: &EngineContext, node: &FlowNodeInstance) -> Result<()> {
    if node.state_executing {
        ctx.store.reset_executing_flag(node.id).await?;
    }
    tracing::debug!(flow_node = node.id, state = %node.state, "resubmitting '{}'", node.name);
    ctx.queue.push(WorkItem::Execute(node.id));
    Ok(())
}

/// Stable nodes whose wake-up may have been lost with the old queue
fn needs_wake(node: &FlowNodeInstance) -> bool {
    if node.interrupt_request.is_some() || node.triggered {
        return true;
    }
    node.state == FlowNodeState::Waiting
        && matches!(
            node.kind,
            FlowNodeKind::Gateway { .. } | FlowNodeKind::MultiInstance { .. } | FlowNodeKind::Loop { .. }
        )
}

#[cfg(test)]
mod tests {
    use super::*;
    use bpmncore::{FlowNodeInterruption, GatewayType};
    use uuid::Uuid;

    fn node(kind: FlowNodeKind, state: FlowNodeState) -> FlowNodeInstance {
        let mut node = FlowNodeInstance::new(Uuid::nil(), "n", kind, 1, 1, Uuid::nil());
        node.set_state(state);
        node
    }

    #[test]
    fn test_waiting_joins_are_woken() {
        let gateway = node(
            FlowNodeKind::Gateway {
                gateway_type: GatewayType::Parallel,
                hit_by: Vec::new(),
            },
            FlowNodeState::Waiting,
        );
        assert!(needs_wake(&gateway));

        let catch = node(FlowNodeKind::IntermediateCatchEvent, FlowNodeState::Waiting);
        assert!(!needs_wake(&catch));
    }

    #[test]
    fn test_triggered_or_interrupted_nodes_are_woken() {
        let mut task = node(FlowNodeKind::AutomaticTask, FlowNodeState::Ready);
        assert!(!needs_wake(&task));
        task.triggered = true;
        assert!(needs_wake(&task));

        let mut catch = node(FlowNodeKind::IntermediateCatchEvent, FlowNodeState::Waiting);
        catch.interrupt_request = Some(FlowNodeInterruption::Cancel);
        assert!(needs_wake(&catch));
    }
}
