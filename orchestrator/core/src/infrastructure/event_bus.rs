// Copyright (c) 2026 100monkeys.ai
// SPDX-License-Identifier: AGPL-3.0

// Event Bus - Pub/Sub for Run and Task Events
//
// One tokio broadcast channel carries every event. Subscribers pick a view:
// everything, a single run, or dispatcher task events only. Events are lost
// on restart; the run repository is the durable record.

use crate::domain::events::{RunEvent, TaskEvent};
use crate::domain::run::RunId;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tracing::{debug, trace, warn};

const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DomainEvent {
    Run(RunEvent),
    Task(TaskEvent),
}

#[derive(Clone)]
pub struct EventBus {
    sender: Arc<broadcast::Sender<DomainEvent>>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl EventBus {
    /// Receivers that fall more than `capacity` events behind lose the
    /// oldest ones and see [`EventBusError::Lagged`].
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self {
            sender: Arc::new(sender),
        }
    }

    pub fn publish_run_event(&self, event: RunEvent) {
        self.publish(DomainEvent::Run(event));
    }

    pub fn publish_task_event(&self, event: TaskEvent) {
        self.publish(DomainEvent::Task(event));
    }

    fn publish(&self, event: DomainEvent) {
        trace!(?event, "Publishing event");
        if self.sender.send(event).is_err() {
            debug!("Event dropped, no subscribers");
        }
    }

    pub fn subscribe(&self) -> EventStream<DomainEvent> {
        EventStream::new(self.sender.subscribe(), Some)
    }

    /// Events of one run only.
    pub fn subscribe_run(&self, run_id: RunId) -> EventStream<RunEvent> {
        EventStream::new(self.sender.subscribe(), move |event| match event {
            DomainEvent::Run(run_event) if run_event.run_id() == run_id => Some(run_event),
            _ => None,
        })
    }

    /// Dispatcher and discussion events only.
    pub fn subscribe_tasks(&self) -> EventStream<TaskEvent> {
        EventStream::new(self.sender.subscribe(), |event| match event {
            DomainEvent::Task(task_event) => Some(task_event),
            DomainEvent::Run(_) => None,
        })
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EventBusError {
    #[error("Event bus is closed")]
    Closed,

    #[error("No events available")]
    Empty,

    #[error("Receiver lagged by {0} events (events were dropped)")]
    Lagged(u64),
}

type Filter<T> = Box<dyn Fn(DomainEvent) -> Option<T> + Send + Sync>;

/// A subscription that yields only the events its filter keeps.
pub struct EventStream<T> {
    receiver: broadcast::Receiver<DomainEvent>,
    filter: Filter<T>,
}

impl<T> EventStream<T> {
    fn new(
        receiver: broadcast::Receiver<DomainEvent>,
        filter: impl Fn(DomainEvent) -> Option<T> + Send + Sync + 'static,
    ) -> Self {
        Self {
            receiver,
            filter: Box::new(filter),
        }
    }

    pub async fn recv(&mut self) -> Result<T, EventBusError> {
        loop {
            let event = self.receiver.recv().await.map_err(|e| match e {
                RecvError::Closed => EventBusError::Closed,
                RecvError::Lagged(n) => lagged(n),
            })?;
            if let Some(kept) = (self.filter)(event) {
                return Ok(kept);
            }
        }
    }

    /// Next buffered event that passes the filter, without waiting.
    pub fn try_recv(&mut self) -> Result<T, EventBusError> {
        loop {
            let event = self.receiver.try_recv().map_err(|e| match e {
                TryRecvError::Empty => EventBusError::Empty,
                TryRecvError::Closed => EventBusError::Closed,
                TryRecvError::Lagged(n) => lagged(n),
            })?;
            if let Some(kept) = (self.filter)(event) {
                return Ok(kept);
            }
        }
    }

    /// Everything currently buffered that passes the filter.
    pub fn drain(&mut self) -> Vec<T> {
        let mut drained = Vec::new();
        loop {
            match self.try_recv() {
                Ok(event) => drained.push(event),
                Err(EventBusError::Lagged(_)) => continue,
                Err(_) => return drained,
            }
        }
    }
}

fn lagged(missed: u64) -> EventBusError {
    warn!(missed, "Event receiver lagged");
    EventBusError::Lagged(missed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn step(run_id: RunId, step: u32) -> RunEvent {
        RunEvent::StepStarted {
            run_id,
            step,
            started_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_subscribe_sees_every_event() {
        let bus = EventBus::new(10);
        let mut events = bus.subscribe();
        bus.publish_run_event(step(RunId::new(), 1));

        match events.recv().await.unwrap() {
            DomainEvent::Run(RunEvent::StepStarted { step, .. }) => assert_eq!(step, 1),
            other => panic!("unexpected event: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_run_stream_filters_other_runs() {
        let bus = EventBus::new(10);
        let wanted = RunId::new();
        let mut events = bus.subscribe_run(wanted);

        bus.publish_run_event(RunEvent::RunFailed {
            run_id: RunId::new(),
            error: "other".into(),
            failed_at: Utc::now(),
        });
        bus.publish_run_event(RunEvent::RunCompleted {
            run_id: wanted,
            step_count: 3,
            completed_at: Utc::now(),
        });

        let event = events.recv().await.unwrap();
        assert_eq!(event.run_id(), wanted);
        assert!(event.is_terminal());
    }

    #[test]
    fn test_task_stream_skips_run_events() {
        let bus = EventBus::new(10);
        let mut tasks = bus.subscribe_tasks();

        bus.publish_run_event(step(RunId::new(), 1));
        bus.publish_task_event(TaskEvent::TaskFailed {
            task_id: Uuid::new_v4(),
            reason: "boom".into(),
            failed_at: Utc::now(),
        });
        bus.publish_run_event(step(RunId::new(), 2));

        let drained = tasks.drain();
        assert_eq!(drained.len(), 1);
        assert!(matches!(drained[0], TaskEvent::TaskFailed { .. }));
        assert!(matches!(tasks.try_recv(), Err(EventBusError::Empty)));
    }

    #[test]
    fn test_lagging_receiver_keeps_newest_events() {
        let bus = EventBus::new(2);
        let run_id = RunId::new();
        let mut events = bus.subscribe_run(run_id);
        for n in 1..=5 {
            bus.publish_run_event(step(run_id, n));
        }

        let steps: Vec<u32> = events
            .drain()
            .into_iter()
            .filter_map(|e| match e {
                RunEvent::StepStarted { step, .. } => Some(step),
                _ => None,
            })
            .collect();
        assert_eq!(steps, vec![4, 5]);
    }

    #[test]
    fn test_publish_without_subscribers_is_silent() {
        let bus = EventBus::default();
        assert_eq!(bus.subscriber_count(), 0);
        bus.publish_run_event(RunEvent::RunCancelled {
            run_id: RunId::new(),
            reason: "nobody listening".into(),
            cancelled_at: Utc::now(),
        });
    }
}
