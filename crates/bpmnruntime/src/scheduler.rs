use crate::context::EngineContext;
use crate::{correlation, lifecycle, state_machine};
use bpmncore::{
    EngineError, FlowNodeInstanceId, Interruption, ProcessInstanceId, Result, WaitingEventId,
};
use chrono::Utc;
use futures::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::{interval, Duration, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// Unit of work picked up by a worker
#[derive(Debug, Clone, PartialEq)]
pub enum WorkItem {
    /// Drive a flow node as far as it can go without waiting
    Execute(FlowNodeInstanceId),
    /// Wind a process instance down
    Interrupt {
        process_instance_id: ProcessInstanceId,
        interruption: Interruption,
    },
    CheckCompletion(ProcessInstanceId),
    MatchMessages,
    FireWaitingEvent(WaitingEventId),
}

#[derive(Debug, Clone)]
struct QueuedItem {
    item: WorkItem,
    attempts: u32,
}

/// Shared FIFO of pending work.
///
/// Items live in memory; after a restart the recovery pass rebuilds the queue
/// from the stored flags.
#[derive(Default)]
pub struct WorkQueue {
    items: Mutex<VecDeque<QueuedItem>>,
    notify: Notify,
}

impl WorkQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, item: WorkItem) {
        self.requeue(QueuedItem { item, attempts: 0 });
    }

    fn requeue(&self, item: QueuedItem) {
        self.items.lock().push_back(item);
        self.notify.notify_one();
    }

    fn pop(&self) -> Option<QueuedItem> {
        self.items.lock().pop_front()
    }

    async fn next(&self) -> QueuedItem {
        loop {
            if let Some(item) = self.pop() {
                return item;
            }
            self.notify.notified().await;
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.items.lock().len()
    }

    #[cfg(test)]
    fn is_empty(&self) -> bool {
        self.items.lock().is_empty()
    }
}

async fn dispatch(ctx: &EngineContext, item: &WorkItem) -> Result<()> {
    match item {
        WorkItem::Execute(id) => state_machine::execute(ctx, *id).await,
        WorkItem::Interrupt {
            process_instance_id,
            interruption,
        } => lifecycle::interrupt_process(ctx, *process_instance_id, interruption.clone())
            .await
            .map(|_| ()),
        WorkItem::CheckCompletion(id) => lifecycle::check_completion(ctx, *id).await,
        WorkItem::MatchMessages => correlation::match_messages(ctx).await.map(|_| ()),
        WorkItem::FireWaitingEvent(id) => correlation::fire_waiting_event(ctx, *id)
            .await
            .map(|_| ()),
    }
}

/// Runs one item; lost races go back to the queue
async fn handle(ctx: &EngineContext, queued: QueuedItem) {
    match dispatch(ctx, &queued.item).await {
        Ok(()) => {}
        Err(e) if e.is_conflict() => {
            if queued.attempts < ctx.config.conflict_retry_limit {
                tracing::debug!(item = ?queued.item, attempt = queued.attempts + 1, "requeued: {}", e);
                ctx.queue.requeue(QueuedItem {
                    item: queued.item,
                    attempts: queued.attempts + 1,
                });
            } else {
                tracing::warn!(item = ?queued.item, "gave up after {} attempts: {}", queued.attempts, e);
            }
        }
        Err(EngineError::Execution(e)) => {
            tracing::debug!(item = ?queued.item, "skipped: {}", e);
        }
        Err(e) => {
            tracing::error!(item = ?queued.item, "work item failed: {}", e);
        }
    }
}

/// Drains the queue, `max_parallel_nodes` items at a time, until nothing is
/// left to do. Returns the number of items processed.
pub async fn run_until_idle(ctx: &EngineContext) -> usize {
    let max_parallel = ctx.config.max_parallel_nodes.max(1);
    let mut running = FuturesUnordered::new();
    let mut processed = 0;

    loop {
        while running.len() < max_parallel {
            match ctx.queue.pop() {
                Some(queued) => running.push(handle(ctx, queued)),
                None => break,
            }
        }

        match running.next().await {
            Some(()) => processed += 1,
            None => break,
        }
    }

    tracing::debug!("queue idle after {} items", processed);
    processed
}

/// Background workers and timer sweep
pub struct EngineHandle {
    token: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl EngineHandle {
    /// Stops picking up new work and waits for running items to finish
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                tracing::error!("worker task ended abnormally: {}", e);
            }
        }
        tracing::info!("workers stopped");
    }
}

pub fn start_workers(ctx: Arc<EngineContext>) -> EngineHandle {
    let token = CancellationToken::new();
    let workers = ctx.config.max_parallel_nodes.max(1);
    let mut tasks = Vec::with_capacity(workers + 1);

    for worker in 0..workers {
        let ctx = ctx.clone();
        let token = token.clone();
        tasks.push(tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    queued = ctx.queue.next() => handle(&ctx, queued).await,
                }
            }
            tracing::debug!(worker, "worker stopped");
        }));
    }

    let sweep_ctx = ctx.clone();
    let sweep_token = token.clone();
    tasks.push(tokio::spawn(async move {
        let mut ticker = interval(Duration::from_millis(
            sweep_ctx.config.timer_sweep_interval_ms.max(1),
        ));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                _ = sweep_token.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = correlation::sweep_timers(&sweep_ctx, Utc::now()).await {
                        tracing::error!("timer sweep failed: {}", e);
                    }
                }
            }
        }
    }));

    tracing::info!("started {} workers", workers);
    EngineHandle { token, tasks }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_is_fifo() {
        let queue = WorkQueue::new();
        queue.push(WorkItem::Execute(1));
        queue.push(WorkItem::MatchMessages);
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().map(|q| q.item), Some(WorkItem::Execute(1)));
        assert_eq!(queue.pop().map(|q| q.item), Some(WorkItem::MatchMessages));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_next_wakes_on_push() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await.item })
        };
        tokio::task::yield_now().await;
        queue.push(WorkItem::CheckCompletion(3));
        assert_eq!(waiter.await.unwrap(), WorkItem::CheckCompletion(3));
    }
}
