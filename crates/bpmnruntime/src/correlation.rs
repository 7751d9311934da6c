//! Waiting events, message matching, timers and signals
//!
//! Every hand-off goes through a claim: the waiting event first, then the
//! message. Losing either claim means another worker owns the match.

use crate::context::EngineContext;
use crate::lifecycle::{self, StartCause};
use crate::resolver::ExpressionResolver;
use crate::scheduler::WorkItem;
use crate::store::FlowNodeTrigger;
use bpmncore::{
    Correlation, EngineEvent, EvaluationContext, EventTarget, EventTrigger, ExpressionError,
    MessageInstance, Result, ThrowMessage, TimerDefinition, TimerKind, Value, WaitingEvent,
    WaitingEventId, WaitingEventType,
};
use chrono::{DateTime, TimeDelta, Utc};
use std::collections::BTreeMap;

// ── Building events and messages ──

/// Waiting event for a catch, boundary or start event; `None` for error
/// triggers, which are matched when an activity fails.
pub fn waiting_event(
    resolver: &ExpressionResolver,
    trigger: &EventTrigger,
    process_name: &str,
    flow_node_name: &str,
    target: EventTarget,
    context: &dyn EvaluationContext,
) -> std::result::Result<Option<WaitingEvent>, ExpressionError> {
    let event = match trigger {
        EventTrigger::Message(message) => {
            let mut event = WaitingEvent::new(
                WaitingEventType::Message,
                &message.name,
                process_name,
                flow_node_name,
                target,
            );
            event.correlations = correlation_values(resolver, &message.correlations, context)?;
            event
        }
        EventTrigger::Timer(timer) => {
            let mut event = WaitingEvent::new(
                WaitingEventType::Timer,
                flow_node_name,
                process_name,
                flow_node_name,
                target,
            );
            event.due_date = Some(due_date(resolver, timer, context)?);
            event
        }
        EventTrigger::Signal { name } => WaitingEvent::new(
            WaitingEventType::Signal,
            name,
            process_name,
            flow_node_name,
            target,
        ),
        EventTrigger::Error { .. } => return Ok(None),
    };
    Ok(Some(event))
}

pub fn thrown_message(
    resolver: &ExpressionResolver,
    message: &ThrowMessage,
    context: &dyn EvaluationContext,
) -> std::result::Result<MessageInstance, ExpressionError> {
    let mut instance =
        MessageInstance::new(&message.name, &message.target_process, &message.target_flow_node);
    instance.correlations = correlation_values(resolver, &message.correlations, context)?;
    for mapping in &message.content {
        instance.payload.insert(
            mapping.name.clone(),
            resolver.evaluate(&mapping.expression, context)?,
        );
    }
    Ok(instance)
}

fn correlation_values(
    resolver: &ExpressionResolver,
    correlations: &[Correlation],
    context: &dyn EvaluationContext,
) -> std::result::Result<BTreeMap<String, String>, ExpressionError> {
    correlations
        .iter()
        .map(|correlation| {
            let value = resolver.evaluate(&correlation.value, context)?;
            let text = value.to_text().ok_or_else(|| ExpressionError::Failed {
                name: correlation.value.name.clone(),
                reason: format!("correlation key '{}' evaluated to null", correlation.key),
            })?;
            Ok((correlation.key.clone(), text))
        })
        .collect()
}

/// Now plus `ms`, or `None` when that is not a representable date
pub(crate) fn after_millis(ms: i64) -> Option<DateTime<Utc>> {
    TimeDelta::try_milliseconds(ms).and_then(|delta| Utc::now().checked_add_signed(delta))
}

fn due_date(
    resolver: &ExpressionResolver,
    timer: &TimerDefinition,
    context: &dyn EvaluationContext,
) -> std::result::Result<DateTime<Utc>, ExpressionError> {
    let value = resolver.evaluate(&timer.expression, context)?;
    match (timer.kind, value) {
        (TimerKind::Duration, Value::Long(ms)) => {
            after_millis(ms).ok_or_else(|| ExpressionError::Failed {
                name: timer.expression.name.clone(),
                reason: format!("a duration of {} ms is out of range", ms),
            })
        }
        (TimerKind::Date, Value::Date(date)) => Ok(date),
        (TimerKind::Date, Value::String(text)) => DateTime::parse_from_rfc3339(&text)
            .map(|date| date.with_timezone(&Utc))
            .map_err(|e| ExpressionError::Failed {
                name: timer.expression.name.clone(),
                reason: format!("'{}' is not an RFC 3339 date: {}", text, e),
            }),
        (kind, other) => Err(ExpressionError::Failed {
            name: timer.expression.name.clone(),
            reason: format!("{:?} timer cannot use a {} value", kind, other.type_name()),
        }),
    }
}

// ── Firing ──

/// Resumes what a claimed event targets. Returns `false` when the target
/// flow node is already gone.
async fn fire(
    ctx: &EngineContext,
    event: &WaitingEvent,
    payload: BTreeMap<String, Value>,
) -> Result<bool> {
    match event.target {
        EventTarget::FlowNode { flow_node_id } => {
            let trigger = FlowNodeTrigger {
                inputs: payload,
                ..Default::default()
            };
            let triggered = match ctx.store.trigger_flow_node(flow_node_id, trigger).await {
                Ok(triggered) => triggered,
                Err(e) if e.is_not_found() => false,
                Err(e) => return Err(e),
            };
            ctx.store.delete_waiting_event(event.id).await?;
            if triggered {
                ctx.queue.push(WorkItem::Execute(flow_node_id));
            }
            Ok(triggered)
        }
        EventTarget::ProcessStart {
            definition_id,
            start_event,
        } => {
            let started = lifecycle::start_process(
                ctx,
                definition_id,
                ctx.config.system_user_id,
                payload,
                StartCause::StartEvent(start_event),
            )
            .await;
            if event.event_type == WaitingEventType::Timer {
                ctx.store.delete_waiting_event(event.id).await?;
            } else {
                ctx.store.release_waiting_event(event.id).await?;
            }
            let instance = started?;
            tracing::info!(
                process_instance = instance.id,
                "'{}' started by event '{}'",
                instance.name,
                event.name
            );
            Ok(true)
        }
    }
}

async fn release_claims(
    ctx: &EngineContext,
    event_id: WaitingEventId,
    message: Option<&MessageInstance>,
) {
    if let Err(e) = ctx.store.release_waiting_event(event_id).await {
        tracing::warn!(waiting_event = event_id, "could not release claim: {}", e);
    }
    if let Some(message) = message {
        if let Err(e) = ctx.store.release_message(message.id).await {
            tracing::warn!(message = message.id, "could not release claim: {}", e);
        }
    }
}

/// Hands every unhandled message to at most one matching waiting event.
/// Returns the number of messages delivered.
pub async fn match_messages(ctx: &EngineContext) -> Result<usize> {
    let mut delivered = 0;

    for message in ctx.store.list_unhandled_messages().await? {
        let candidates = ctx
            .store
            .find_waiting_events(WaitingEventType::Message, &message.name)
            .await?;

        for event in candidates
            .iter()
            .filter(|e| !e.in_progress && e.matches(&message))
        {
            if !ctx.store.claim_waiting_event(event.id).await? {
                continue;
            }
            if !ctx.store.claim_message(message.id).await? {
                ctx.store.release_waiting_event(event.id).await?;
                break;
            }

            match fire(ctx, event, message.payload.clone()).await {
                Ok(true) => {
                    ctx.store.delete_message(message.id).await?;
                    tracing::debug!(
                        message = message.id,
                        waiting_event = event.id,
                        "message '{}' correlated",
                        message.name
                    );
                    ctx.events.emit(EngineEvent::MessageCorrelated {
                        message_id: message.id,
                        waiting_event_id: event.id,
                        timestamp: Utc::now(),
                    });
                    delivered += 1;
                    break;
                }
                Ok(false) => ctx.store.release_message(message.id).await?,
                Err(e) => {
                    release_claims(ctx, event.id, Some(&message)).await;
                    return Err(e);
                }
            }
        }
    }

    Ok(delivered)
}

/// Claims and fires one waiting event with an empty payload
pub async fn fire_waiting_event(ctx: &EngineContext, id: WaitingEventId) -> Result<bool> {
    if !ctx.store.claim_waiting_event(id).await? {
        return Ok(false);
    }
    let Some(event) = ctx.store.get_waiting_event(id).await? else {
        return Ok(false);
    };

    match fire(ctx, &event, BTreeMap::new()).await {
        Ok(fired) => {
            if event.event_type == WaitingEventType::Timer {
                tracing::info!(waiting_event = id, "timer '{}' fired", event.name);
                ctx.events.emit(EngineEvent::TimerFired {
                    waiting_event_id: id,
                    timestamp: Utc::now(),
                });
            }
            Ok(fired)
        }
        Err(e) => {
            release_claims(ctx, id, None).await;
            Err(e)
        }
    }
}

/// Fires every timer due at `now`; one failing timer does not stop the others
pub async fn sweep_timers(ctx: &EngineContext, now: DateTime<Utc>) -> Result<usize> {
    let mut fired = 0;
    for timer in ctx.store.list_due_timers(now).await? {
        match fire_waiting_event(ctx, timer.id).await {
            Ok(true) => fired += 1,
            Ok(false) => {}
            Err(e) => tracing::error!(waiting_event = timer.id, "timer could not fire: {}", e),
        }
    }
    if fired > 0 {
        tracing::debug!("{} timers fired", fired);
    }
    Ok(fired)
}

/// Delivers a signal to every event waiting for it. Signals are not stored:
/// nobody waiting means nobody receives it.
pub async fn send_signal(
    ctx: &EngineContext,
    name: &str,
    payload: BTreeMap<String, Value>,
) -> Result<usize> {
    let mut receivers = 0;
    for event in ctx
        .store
        .find_waiting_events(WaitingEventType::Signal, name)
        .await?
    {
        if !ctx.store.claim_waiting_event(event.id).await? {
            continue;
        }
        match fire(ctx, &event, payload.clone()).await {
            Ok(true) => receivers += 1,
            Ok(false) => {}
            Err(e) => {
                release_claims(ctx, event.id, None).await;
                tracing::error!(waiting_event = event.id, "signal '{}' not delivered: {}", name, e);
            }
        }
    }

    tracing::info!("signal '{}' reached {} receivers", name, receivers);
    ctx.events.emit(EngineEvent::SignalBroadcast {
        name: name.to_string(),
        receivers,
        timestamp: Utc::now(),
    });
    Ok(receivers)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::working_set::WorkingSet;
    use bpmncore::{DataDefinition, DataType, EngineConstants, Expression, ProcessDefinition};
    use std::sync::Arc;

    fn resolver() -> ExpressionResolver {
        ExpressionResolver::new(Arc::new(bpmnexpr::standard_registry()))
    }

    fn context() -> WorkingSet {
        let definition = ProcessDefinition::new("orders", "1.0")
            .with_data(DataDefinition::new("orderId", DataType::Long));
        let constants = EngineConstants {
            logged_user_id: 1,
            process_instance_id: 4,
            root_process_instance_id: 4,
            process_definition_id: definition.id,
            process_initiator_id: 1,
            activity_instance_id: None,
            loop_counter: None,
            task_assignee_id: None,
        };
        let mut set = WorkingSet::for_new_instance(&definition, 4, constants, BTreeMap::new());
        set.set_data("orderId", Value::Long(77));
        set
    }

    #[test]
    fn test_message_event_carries_evaluated_correlations() {
        let trigger = EventTrigger::message_correlated(
            "paid",
            vec![Correlation::new("order", Expression::variable("orderId", DataType::Long))],
        );
        let event = waiting_event(
            &resolver(),
            &trigger,
            "orders",
            "wait payment",
            EventTarget::FlowNode { flow_node_id: 9 },
            &context(),
        )
        .unwrap()
        .unwrap();

        let message = MessageInstance::new("paid", "orders", "wait payment").with_correlation("order", "77");
        assert!(event.matches(&message));
        let other = MessageInstance::new("paid", "orders", "wait payment").with_correlation("order", "78");
        assert!(!event.matches(&other));
    }

    #[test]
    fn test_timer_due_dates() {
        let now = Utc::now();
        let duration = EventTrigger::timer_duration(Expression::long(60_000));
        let event = waiting_event(
            &resolver(),
            &duration,
            "orders",
            "wait",
            EventTarget::FlowNode { flow_node_id: 1 },
            &context(),
        )
        .unwrap()
        .unwrap();
        assert!(event.due_date.unwrap() >= now + chrono::Duration::seconds(59));
        assert!(!event.is_due(now));

        let date = EventTrigger::timer_date(Expression::text("2030-01-01T00:00:00Z"));
        let event = waiting_event(
            &resolver(),
            &date,
            "orders",
            "wait",
            EventTarget::FlowNode { flow_node_id: 1 },
            &context(),
        )
        .unwrap()
        .unwrap();
        assert_eq!(event.due_date.unwrap().to_rfc3339(), "2030-01-01T00:00:00+00:00");

        let bad = EventTrigger::timer_date(Expression::long(5));
        assert!(waiting_event(
            &resolver(),
            &bad,
            "orders",
            "wait",
            EventTarget::FlowNode { flow_node_id: 1 },
            &context(),
        )
        .is_err());
    }

    #[test]
    fn test_error_triggers_do_not_wait() {
        let event = waiting_event(
            &resolver(),
            &EventTrigger::error(None),
            "orders",
            "oops",
            EventTarget::FlowNode { flow_node_id: 1 },
            &context(),
        )
        .unwrap();
        assert!(event.is_none());
    }

    #[test]
    fn test_thrown_message_payload() {
        let throw = ThrowMessage::new("paid", "billing", "receive")
            .with_correlation("order", Expression::variable("orderId", DataType::Long))
            .with_content("amount", Expression::long(12));
        let message = thrown_message(&resolver(), &throw, &context()).unwrap();
        assert_eq!(message.correlations.get("order").map(String::as_str), Some("77"));
        assert_eq!(message.payload.get("amount"), Some(&Value::Long(12)));
    }
}
