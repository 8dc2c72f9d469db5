//! Per-task publish/subscribe notifications
//!
//! Each [`AssemblyTask`](crate::lib::task::AssemblyTask) owns one bus.
//! Delivery is synchronous and follows registration order within a kind.

use crate::lib::task::TaskStatus;
use std::collections::{BTreeMap, HashMap};
use tracing::trace;

/// Notification category a handler subscribes to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    StatusUpdate,
    Step,
    MeshScale,
    PointClouds,
    FractureSurfaces,
    Metrics,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::StatusUpdate,
        EventKind::Step,
        EventKind::MeshScale,
        EventKind::PointClouds,
        EventKind::FractureSurfaces,
        EventKind::Metrics,
    ];
}

/// A notification emitted by an assembly task
#[derive(Debug, Clone, PartialEq)]
pub enum TaskEvent {
    /// Lifecycle change; `step`/`total_steps` are set while generating
    StatusUpdate {
        status: TaskStatus,
        step: Option<i64>,
        total_steps: Option<u32>,
    },
    /// The step cursor moved
    Step { index: i64, total_steps: u32 },
    MeshScale(f64),
    PointClouds(Vec<Vec<[f64; 3]>>),
    FractureSurfaces(Vec<Vec<[f64; 3]>>),
    Metrics(BTreeMap<String, f64>),
}

impl TaskEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            TaskEvent::StatusUpdate { .. } => EventKind::StatusUpdate,
            TaskEvent::Step { .. } => EventKind::Step,
            TaskEvent::MeshScale(_) => EventKind::MeshScale,
            TaskEvent::PointClouds(_) => EventKind::PointClouds,
            TaskEvent::FractureSurfaces(_) => EventKind::FractureSurfaces,
            TaskEvent::Metrics(_) => EventKind::Metrics,
        }
    }
}

/// Handle returned by [`EventBus::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(u64);

type Handler = Box<dyn FnMut(&TaskEvent)>;

/// Ordered handler lists keyed by event kind
#[derive(Default)]
pub struct EventBus {
    handlers: HashMap<EventKind, Vec<(SubscriptionId, Handler)>>,
    next_id: u64,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler for one kind of event
    pub fn subscribe<F>(&mut self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: FnMut(&TaskEvent) + 'static,
    {
        let id = SubscriptionId(self.next_id);
        self.next_id += 1;
        self.handlers
            .entry(kind)
            .or_default()
            .push((id, Box::new(handler)));
        id
    }

    /// Remove a handler. Returns `false` if the id was not registered.
    pub fn unsubscribe(&mut self, id: SubscriptionId) -> bool {
        for handlers in self.handlers.values_mut() {
            if let Some(pos) = handlers.iter().position(|(handle, _)| *handle == id) {
                handlers.remove(pos);
                return true;
            }
        }
        false
    }

    /// Deliver an event to every handler of its kind
    pub fn emit(&mut self, event: &TaskEvent) {
        let Some(handlers) = self.handlers.get_mut(&event.kind()) else {
            return;
        };
        trace!("Emitting {:?} to {} handlers", event.kind(), handlers.len());
        for (_, handler) in handlers.iter_mut() {
            handler(event);
        }
    }

    /// Number of handlers registered for a kind
    pub fn subscriber_count(&self, kind: EventKind) -> usize {
        self.handlers.get(&kind).map_or(0, Vec::len)
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut counts: Vec<_> = self
            .handlers
            .iter()
            .map(|(kind, handlers)| (format!("{kind:?}"), handlers.len()))
            .collect();
        counts.sort();
        f.debug_struct("EventBus").field("handlers", &counts).finish()
    }
}

/// Render metric values for display, four decimal places
pub fn format_metrics(metrics: &BTreeMap<String, f64>) -> Vec<(String, String)> {
    metrics
        .iter()
        .map(|(name, value)| (name.clone(), format!("{value:.4}")))
        .collect()
}
