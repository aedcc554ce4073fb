//! Scheduled worker-health evaluation.
//!
//! A timer-driven task that watches the session bus for distress signals
//! from worker executions (stalls, doom loops, retries, failures) and
//! files escalation events when the recent window looks unhealthy. It
//! never touches the executions themselves; remediation is the queen's
//! and the operator's job.

use std::collections::VecDeque;
use std::time::Duration;

use serde_json::json;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{AgentEvent, EventBus, EventFilter, EventType};

/// Events kept for inspection between ticks.
const WINDOW_CAPACITY: usize = 256;
/// Distress events in one window that warrant an escalation ticket.
const TICKET_THRESHOLD: usize = 3;

pub struct HealthJudge {
    cancel: CancellationToken,
    handle: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl HealthJudge {
    pub fn spawn(bus: EventBus, interval: Duration) -> Self {
        let cancel = CancellationToken::new();
        let task_cancel = cancel.clone();

        let handle = tokio::spawn(async move {
            let mut subscription = bus.subscribe(EventFilter::any().with_types(vec![
                EventType::NodeStalled,
                EventType::NodeToolDoomLoop,
                EventType::NodeRetry,
                EventType::ExecutionFailed,
                EventType::EscalationRequested,
            ]));
            let mut window: VecDeque<AgentEvent> = VecDeque::with_capacity(WINDOW_CAPACITY);
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // The first tick completes immediately; skip it.
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    event = subscription.recv() => match event {
                        Some(event) => {
                            if window.len() == WINDOW_CAPACITY {
                                window.pop_front();
                            }
                            window.push_back(event);
                        }
                        None => break,
                    },
                    _ = ticker.tick() => {
                        Self::inspect(&bus, &mut window);
                    }
                }
            }
        });

        Self {
            cancel,
            handle: parking_lot::Mutex::new(Some(handle)),
        }
    }

    fn inspect(bus: &EventBus, window: &mut VecDeque<AgentEvent>) {
        if window.is_empty() {
            return;
        }

        let mut stalls = 0usize;
        let mut doom_loops = 0usize;
        let mut retries = 0usize;
        let mut failures = 0usize;
        let mut escalations = 0usize;
        for event in window.iter() {
            match event.event_type {
                EventType::NodeStalled => stalls += 1,
                EventType::NodeToolDoomLoop => doom_loops += 1,
                EventType::NodeRetry => retries += 1,
                EventType::ExecutionFailed => failures += 1,
                EventType::EscalationRequested => escalations += 1,
                _ => {}
            }
        }

        let distress = stalls + doom_loops + retries + failures + escalations;
        if distress >= TICKET_THRESHOLD || failures > 0 {
            bus.publish(
                AgentEvent::new(EventType::WorkerEscalationTicket)
                    .with_data("stalls", json!(stalls))
                    .with_data("doom_loops", json!(doom_loops))
                    .with_data("retries", json!(retries))
                    .with_data("failures", json!(failures))
                    .with_data("escalations", json!(escalations)),
            );
        }
        if failures > 0 || escalations > 0 {
            bus.publish(
                AgentEvent::new(EventType::QueenInterventionRequested).with_data(
                    "reason",
                    json!(format!(
                        "{failures} failed execution(s), {escalations} escalation(s) in the last window"
                    )),
                ),
            );
        }

        window.clear();
    }

    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }
}
