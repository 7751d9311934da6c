use crate::definition::DefinitionId;
use crate::instance::{
    FlowNodeInstanceId, FlowNodeState, FlowNodeType, MessageInstanceId, ProcessInstanceId,
    ProcessInstanceState, WaitingEventId,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

/// Events emitted while the engine drives process instances
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum EngineEvent {
    ProcessStarted {
        process_instance_id: ProcessInstanceId,
        definition_id: DefinitionId,
        name: String,
        timestamp: DateTime<Utc>,
    },
    ProcessFinished {
        process_instance_id: ProcessInstanceId,
        state: ProcessInstanceState,
        timestamp: DateTime<Utc>,
    },
    FlowNodeStateChanged {
        process_instance_id: ProcessInstanceId,
        flow_node_id: FlowNodeInstanceId,
        name: String,
        node_type: FlowNodeType,
        state: FlowNodeState,
        timestamp: DateTime<Utc>,
    },
    FlowNodeFailed {
        process_instance_id: ProcessInstanceId,
        flow_node_id: FlowNodeInstanceId,
        error: String,
        timestamp: DateTime<Utc>,
    },
    MessageCorrelated {
        message_id: MessageInstanceId,
        waiting_event_id: WaitingEventId,
        timestamp: DateTime<Utc>,
    },
    TimerFired {
        waiting_event_id: WaitingEventId,
        timestamp: DateTime<Utc>,
    },
    SignalBroadcast {
        name: String,
        receivers: usize,
        timestamp: DateTime<Utc>,
    },
    RecoveryCompleted {
        waiting_events_reset: usize,
        messages_reset: usize,
        flow_nodes_requeued: usize,
        failures: usize,
        timestamp: DateTime<Utc>,
    },
}

/// Engine-wide event bus
pub struct EventBus {
    sender: broadcast::Sender<EngineEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.sender.subscribe()
    }

    /// Dropped silently when nobody listens
    pub fn emit(&self, event: EngineEvent) {
        let _ = self.sender.send(event);
    }
}
