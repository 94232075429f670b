//! Invoke lifecycle management.
//!
//! Invoked services run concurrently with the interpreter and hand events
//! back through the external queue's [`EventSender`]. The manager tracks
//! one activation per logical invoke id; every activation gets a fresh
//! unique suffix so a cancelled-and-restarted invocation never collides
//! with a stale in-flight response. Cancellation is idempotent.

use crate::error::CommunicationError;
use crate::event::{Event, InvokeId};
use crate::queue::EventSender;
use dashmap::DashMap;
use stateflow_model::DocumentId;
use stateflow_value::Value;
use std::collections::HashMap;
use std::sync::Arc;

/// Everything a service factory needs to start one activation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub invoke_id: InvokeId,
    pub service_type: String,
    /// Resolved `src` expression, `Undefined` when absent.
    pub src: Value,
    /// Resolved inline content, `Undefined` when absent.
    pub content: Value,
    /// Resolved named params as an object, `Undefined` when none.
    pub params: Value,
}

/// An invoke declaration resolved against the current data model,
/// ready to start.
#[derive(Debug, Clone)]
pub struct StartInvoke {
    pub logical: String,
    /// State whose entry starts the service; exiting it cancels.
    pub state: DocumentId,
    pub auto_forward: bool,
    pub service_type: String,
    pub src: Value,
    pub content: Value,
    pub params: Value,
}

impl StartInvoke {
    pub fn new(logical: impl Into<String>, service_type: impl Into<String>, state: DocumentId) -> Self {
        Self {
            logical: logical.into(),
            state,
            auto_forward: false,
            service_type: service_type.into(),
            src: Value::Undefined,
            content: Value::Undefined,
            params: Value::Undefined,
        }
    }

    pub fn with_content(mut self, content: Value) -> Self {
        self.content = content;
        self
    }
}

/// A running external service.
pub trait InvokedService: Send + Sync {
    /// Delivers an event from the parent session (auto-forward or an
    /// explicit `#_invoke_<id>` send target).
    fn send(&self, event: Event);

    /// Stops the service. Must be idempotent and must not fail on a
    /// service that already completed.
    fn cancel(&self);
}

/// Starts external services for invoke declarations.
pub trait ServiceFactory: Send + Sync {
    fn start(
        &self,
        request: InvokeRequest,
        events: EventSender,
    ) -> Result<Box<dyn InvokedService>, CommunicationError>;
}

/// Dispatches to a factory per service type. Registers the built-in
/// `echo` service by default.
pub struct ServiceRegistry {
    factories: HashMap<String, Arc<dyn ServiceFactory>>,
}

impl ServiceRegistry {
    pub fn new() -> Self {
        let mut registry = Self {
            factories: HashMap::new(),
        };
        registry.register("echo", Arc::new(EchoFactory));
        registry
    }

    pub fn register(&mut self, service_type: impl Into<String>, factory: Arc<dyn ServiceFactory>) {
        self.factories.insert(service_type.into(), factory);
    }
}

impl Default for ServiceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceFactory for ServiceRegistry {
    fn start(
        &self,
        request: InvokeRequest,
        events: EventSender,
    ) -> Result<Box<dyn InvokedService>, CommunicationError> {
        let factory = self.factories.get(&request.service_type).ok_or_else(|| {
            CommunicationError::UnknownServiceType {
                service_type: request.service_type.clone(),
            }
        })?;
        factory.start(request, events)
    }
}

struct ActiveInvoke {
    id: InvokeId,
    state: DocumentId,
    auto_forward: bool,
    service: Box<dyn InvokedService>,
}

/// Tracks live activations keyed by logical invoke id.
pub struct InvokeManager {
    factory: Arc<dyn ServiceFactory>,
    active: DashMap<String, ActiveInvoke>,
}

impl InvokeManager {
    pub fn new(factory: Arc<dyn ServiceFactory>) -> Self {
        Self {
            factory,
            active: DashMap::new(),
        }
    }

    /// Starts a fresh activation. Any previous activation of the same
    /// logical id is cancelled first.
    pub fn start(
        &self,
        spec: StartInvoke,
        events: &EventSender,
    ) -> Result<InvokeId, CommunicationError> {
        self.cancel(&spec.logical);

        let id = InvokeId::fresh(&spec.logical);
        let request = InvokeRequest {
            invoke_id: id.clone(),
            service_type: spec.service_type.clone(),
            src: spec.src,
            content: spec.content,
            params: spec.params,
        };
        let service = self.factory.start(request, events.clone())?;
        tracing::debug!(invoke_id = %id, service_type = spec.service_type, "invoke started");

        self.active.insert(
            spec.logical,
            ActiveInvoke {
                id: id.clone(),
                state: spec.state,
                auto_forward: spec.auto_forward,
                service,
            },
        );
        Ok(id)
    }

    /// Cancels the activation of a logical id. Returns whether one was
    /// live; calling again is a no-op.
    pub fn cancel(&self, logical: &str) -> bool {
        match self.active.remove(logical) {
            Some((_, invoke)) => {
                invoke.service.cancel();
                tracing::debug!(invoke_id = %invoke.id, "invoke cancelled");
                true
            }
            None => false,
        }
    }

    /// Cancels every activation started by `state`.
    pub fn cancel_for_state(&self, state: DocumentId) {
        let logicals: Vec<String> = self
            .active
            .iter()
            .filter(|entry| entry.value().state == state)
            .map(|entry| entry.key().clone())
            .collect();
        for logical in logicals {
            self.cancel(&logical);
        }
    }

    pub fn cancel_all(&self) {
        let logicals: Vec<String> = self.active.iter().map(|e| e.key().clone()).collect();
        for logical in logicals {
            self.cancel(&logical);
        }
    }

    /// True when `state` already has a live activation.
    pub fn has_for_state(&self, state: DocumentId) -> bool {
        self.active.iter().any(|entry| entry.value().state == state)
    }

    /// Logical id owning a unique activation id, if still live.
    pub fn logical_for(&self, unique: &str) -> Option<String> {
        self.active
            .iter()
            .find(|entry| entry.value().id.unique == unique)
            .map(|entry| entry.key().clone())
    }

    /// Forwards an external event to every auto-forwarding service.
    pub fn forward(&self, event: &Event) {
        for entry in self.active.iter() {
            if entry.value().auto_forward {
                entry.value().service.send(event.clone());
            }
        }
    }

    /// Delivers an event to one logical service (`#_invoke_<id>` target).
    pub fn send_to(&self, logical: &str, event: Event) -> bool {
        match self.active.get(logical) {
            Some(entry) => {
                entry.value().service.send(event);
                true
            }
            None => false,
        }
    }

    /// Live bookkeeping for checkpointing: (logical, unique, state).
    pub fn snapshot(&self) -> Vec<(String, String, DocumentId)> {
        self.active
            .iter()
            .map(|entry| {
                (
                    entry.key().clone(),
                    entry.value().id.unique.clone(),
                    entry.value().state,
                )
            })
            .collect()
    }
}

// ============================================================================
// Built-in echo service
// ============================================================================

/// Starts [`EchoService`]: completes immediately, echoing its payload in
/// a `done.invoke.<id>` event.
pub struct EchoFactory;

impl ServiceFactory for EchoFactory {
    fn start(
        &self,
        request: InvokeRequest,
        events: EventSender,
    ) -> Result<Box<dyn InvokedService>, CommunicationError> {
        let payload = if request.content != Value::Undefined {
            request.content.clone()
        } else {
            request.params.clone()
        };
        let invoke_id = request.invoke_id.unique.clone();

        let task = tokio::spawn(async move {
            // Yield so the parent session finishes its macrostep first.
            tokio::task::yield_now().await;
            let done = Event::done_invoke(&invoke_id, payload);
            if events.send(done).is_err() {
                tracing::debug!(invoke_id, "echo completion dropped, session ended");
            }
        });

        Ok(Box::new(EchoService {
            task: task.abort_handle(),
        }))
    }
}

struct EchoService {
    task: tokio::task::AbortHandle,
}

impl InvokedService for EchoService {
    fn send(&self, _event: Event) {}

    fn cancel(&self) {
        self.task.abort();
    }
}
