//! Renderer lifecycle notifications.

use std::{
    fmt,
    panic::{catch_unwind, AssertUnwindSafe},
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::model::ModelMetadata;

#[derive(Debug, Clone, PartialEq)]
pub enum RendererEvent {
    Loaded(ModelMetadata),
    Error(String),
    ExpressionChanged { name: String, weight: f32 },
    MotionStarted { group: String, name: String },
    MotionEnded { group: String, name: String },
    Disposed,
}

impl RendererEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            RendererEvent::Loaded(_) => EventKind::Loaded,
            RendererEvent::Error(_) => EventKind::Error,
            RendererEvent::ExpressionChanged { .. } => EventKind::ExpressionChanged,
            RendererEvent::MotionStarted { .. } => EventKind::MotionStarted,
            RendererEvent::MotionEnded { .. } => EventKind::MotionEnded,
            RendererEvent::Disposed => EventKind::Disposed,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EventKind {
    Loaded,
    Error,
    ExpressionChanged,
    MotionStarted,
    MotionEnded,
    Disposed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

pub type EventHandler = Box<dyn FnMut(&RendererEvent)>;

/// Per-renderer observer list. A handler that panics is logged and skipped;
/// the remaining handlers still run.
#[derive(Default)]
pub struct EventHub {
    handlers: Vec<(SubscriptionId, EventKind, EventHandler)>,
    next_id: u64,
}

impl fmt::Debug for EventHub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventHub")
            .field("handlers", &self.handlers.len())
            .finish()
    }
}

impl EventHub {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn on(&mut self, kind: EventKind, handler: EventHandler) -> SubscriptionId {
        self.next_id += 1;
        let id = SubscriptionId(self.next_id);
        self.handlers.push((id, kind, handler));
        id
    }

    /// Returns whether `id` was subscribed.
    pub fn off(&mut self, id: SubscriptionId) -> bool {
        let before = self.handlers.len();
        self.handlers.retain(|(existing, _, _)| *existing != id);
        before != self.handlers.len()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn clear(&mut self) {
        self.handlers.clear();
    }

    pub fn emit(&mut self, event: &RendererEvent) {
        let kind = event.kind();
        debug!(?kind, "renderer event");
        for (id, _, handler) in self
            .handlers
            .iter_mut()
            .filter(|(_, subscribed, _)| *subscribed == kind)
        {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                warn!(?kind, subscription = id.0, "event handler panicked");
            }
        }
    }
}
