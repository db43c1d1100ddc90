//! This module provides the `StateMachine`, `Events`, `EventSubscriber` and `EventPublisher`
//! types.

use std::sync::Arc;

use fedfraud_core::WeightSet;
use tokio::sync::watch;

use crate::{history::RoundRecord, state_machine::phases::PhaseName};

/// An event emitted by the coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E> {
    /// Metadata that associates this event to the round in which it is emitted.
    pub round_id: u64,
    /// The event itself
    pub event: E,
}

/// Global model update event.
#[derive(Debug, Clone, PartialEq)]
pub enum ModelUpdate {
    Invalidate,
    New(Arc<WeightSet>),
}

/// Round metrics update event.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum MetricsUpdate {
    Invalidate,
    New(RoundRecord),
}

/// A convenience type to emit any coordinator event.
#[derive(Debug)]
pub struct EventPublisher {
    /// Round ID that is attached to all the events.
    round_id: u64,
    phase_tx: EventBroadcaster<PhaseName>,
    metrics_tx: EventBroadcaster<MetricsUpdate>,
    model_tx: EventBroadcaster<ModelUpdate>,
}

/// The `EventSubscriber` hands out `EventListener`s for any coordinator event.
#[derive(Debug)]
pub struct EventSubscriber {
    phase_rx: EventListener<PhaseName>,
    metrics_rx: EventListener<MetricsUpdate>,
    model_rx: EventListener<ModelUpdate>,
}

impl EventPublisher {
    /// Initialize a new event publisher with the given initial events.
    pub fn init(
        round_id: u64,
        phase: PhaseName,
        metrics: MetricsUpdate,
        model: ModelUpdate,
    ) -> (Self, EventSubscriber) {
        let (phase_tx, phase_rx) = watch::channel::<Event<PhaseName>>(Event {
            round_id,
            event: phase,
        });

        let (metrics_tx, metrics_rx) = watch::channel::<Event<MetricsUpdate>>(Event {
            round_id,
            event: metrics,
        });

        let (model_tx, model_rx) = watch::channel::<Event<ModelUpdate>>(Event {
            round_id,
            event: model,
        });

        let publisher = EventPublisher {
            round_id,
            phase_tx: phase_tx.into(),
            metrics_tx: metrics_tx.into(),
            model_tx: model_tx.into(),
        };

        let subscriber = EventSubscriber {
            phase_rx: phase_rx.into(),
            metrics_rx: metrics_rx.into(),
            model_rx: model_rx.into(),
        };

        (publisher, subscriber)
    }

    /// Set the round ID that is attached to the events the publisher broadcasts.
    pub fn set_round_id(&mut self, id: u64) {
        self.round_id = id;
    }

    fn event<T>(&self, event: T) -> Event<T> {
        Event {
            round_id: self.round_id,
            event,
        }
    }

    /// Emit a phase event
    pub fn broadcast_phase(&mut self, phase: PhaseName) {
        self.phase_tx.broadcast(self.event(phase));
    }

    /// Emit a round metrics event
    pub fn broadcast_metrics(&mut self, update: MetricsUpdate) {
        self.metrics_tx.broadcast(self.event(update));
    }

    /// Emit a model event
    pub fn broadcast_model(&mut self, update: ModelUpdate) {
        self.model_tx.broadcast(self.event(update));
    }
}

impl EventSubscriber {
    /// Get a listener for new phase events
    pub fn phase_listener(&self) -> EventListener<PhaseName> {
        self.phase_rx.clone()
    }

    /// Get a listener for round metrics events
    pub fn metrics_listener(&self) -> EventListener<MetricsUpdate> {
        self.metrics_rx.clone()
    }

    /// Get a listener for new model events
    pub fn model_listener(&self) -> EventListener<ModelUpdate> {
        self.model_rx.clone()
    }
}

/// A listener for coordinator events. It can be used to either retrieve the latest `Event<E>`
/// emitted by the coordinator (with `EventListener::get_latest`) or to wait for the next one
/// (with `EventListener::changed`).
#[derive(Debug, Clone)]
pub struct EventListener<E>(watch::Receiver<Event<E>>);

impl<E> From<watch::Receiver<Event<E>>> for EventListener<E> {
    fn from(receiver: watch::Receiver<Event<E>>) -> Self {
        EventListener(receiver)
    }
}

impl<E> EventListener<E>
where
    E: Clone,
{
    pub fn get_latest(&self) -> Event<E> {
        self.0.borrow().clone()
    }

    /// Waits for an event that has not been seen yet and returns it. Returns `None` once the
    /// publisher is gone.
    pub async fn changed(&mut self) -> Option<Event<E>> {
        self.0.changed().await.ok()?;
        Some(self.0.borrow_and_update().clone())
    }
}

/// A channel to send `Event<E>` to all the `EventListener<E>`.
#[derive(Debug)]
pub struct EventBroadcaster<E>(watch::Sender<Event<E>>);

impl<E> EventBroadcaster<E> {
    /// Send `event` to all the `EventListener<E>`. Events sent while nobody listens are kept as
    /// the latest event.
    fn broadcast(&self, event: Event<E>) {
        self.0.send_replace(event);
    }
}

impl<E> From<watch::Sender<Event<E>>> for EventBroadcaster<E> {
    fn from(sender: watch::Sender<Event<E>>) -> Self {
        Self(sender)
    }
}
