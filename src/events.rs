//! In-process event bus: typed publish/subscribe with per-kind and
//! wildcard subscribers. Dispatch is synchronous within the publishing
//! call and follows registration order, so subscribers observe state
//! transitions in the order they happened.

use crate::session::Tier;
use crate::workflow::schema::{WorkflowRun, WorkflowType};
use parking_lot::Mutex;
use serde_json::json;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

/// Events published by the core services. Every event carries the owning
/// session token as its routing key; the token is stripped before anything
/// leaves the process.
#[derive(Debug, Clone)]
pub enum ServerEvent {
    WorkflowProgress {
        token: String,
        workflow: WorkflowType,
        run: WorkflowRun,
    },
    TierChanged {
        token: String,
        tier: Tier,
        verified: bool,
        principal: Option<String>,
    },
    SessionExpired {
        token: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    WorkflowProgress,
    TierChanged,
    SessionExpired,
}

impl ServerEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerEvent::WorkflowProgress { .. } => EventKind::WorkflowProgress,
            ServerEvent::TierChanged { .. } => EventKind::TierChanged,
            ServerEvent::SessionExpired { .. } => EventKind::SessionExpired,
        }
    }

    /// Routing key: the session token that owns this event.
    pub fn token(&self) -> &str {
        match self {
            ServerEvent::WorkflowProgress { token, .. } => token,
            ServerEvent::TierChanged { token, .. } => token,
            ServerEvent::SessionExpired { token } => token,
        }
    }

    /// Client-facing payload. The token is the routing key only and is
    /// never included here.
    pub fn to_client_json(&self) -> serde_json::Value {
        match self {
            ServerEvent::WorkflowProgress { workflow, run, .. } => json!({
                "type": "workflow-progress",
                "data": { "workflow": workflow, "run": run },
            }),
            ServerEvent::TierChanged {
                tier,
                verified,
                principal,
                ..
            } => json!({
                "type": "tier-changed",
                "data": { "tier": tier, "verified": verified, "principal": principal },
            }),
            ServerEvent::SessionExpired { .. } => json!({
                "type": "session-expired",
            }),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionId(u64);

type Handler = Arc<dyn Fn(&ServerEvent) + Send + Sync>;

struct Subscriber {
    id: u64,
    /// None means wildcard: receives every event kind.
    filter: Option<EventKind>,
    handler: Handler,
}

/// Publish/subscribe hub. No buffering, no persistence: a publish invokes
/// the currently-registered handlers and returns.
pub struct EventBus {
    subscribers: Mutex<Vec<Subscriber>>,
    next_id: AtomicU64,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn subscribe<F>(&self, kind: EventKind, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.add(Some(kind), Arc::new(handler))
    }

    pub fn subscribe_all<F>(&self, handler: F) -> SubscriptionId
    where
        F: Fn(&ServerEvent) + Send + Sync + 'static,
    {
        self.add(None, Arc::new(handler))
    }

    fn add(&self, filter: Option<EventKind>, handler: Handler) -> SubscriptionId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.lock().push(Subscriber {
            id,
            filter,
            handler,
        });
        SubscriptionId(id)
    }

    pub fn unsubscribe(&self, id: SubscriptionId) {
        self.subscribers.lock().retain(|s| s.id != id.0);
    }

    /// Deliver to matching subscribers in registration order. Handlers are
    /// cloned out of the lock first so a handler may publish again without
    /// deadlocking.
    pub fn publish(&self, event: &ServerEvent) {
        let handlers: Vec<Handler> = {
            let subs = self.subscribers.lock();
            subs.iter()
                .filter(|s| s.filter.is_none() || s.filter == Some(event.kind()))
                .map(|s| Arc::clone(&s.handler))
                .collect()
        };
        for handler in handlers {
            handler(event);
        }
    }

    /// Drop every subscriber; used at process teardown.
    pub fn shutdown(&self) {
        self.subscribers.lock().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.lock().len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
