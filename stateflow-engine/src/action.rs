//! Compiled executable content.
//!
//! Each action kind from the document compiles into one [`CompiledAction`]
//! variant holding pre-resolved evaluators; the closed set is dispatched
//! through a single `execute` match rather than per-kind trait objects.
//! A failing action stops its containing block; the interpreter converts
//! the failure into an `error.execution` platform event.

use crate::binding::{ConditionEvaluator, LocationEvaluator, ScriptEvaluator, ValueEvaluator};
use crate::datamodel::DataModel;
use crate::error::ExecutionError;
use crate::event::{Event, EventKind};
use crate::invoke::InvokeManager;
use crate::queue::{EventQueue, EventSender};
use dashmap::DashMap;
use stateflow_value::Value;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Where a `send` action delivers its event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendTarget {
    /// This session's external queue (the default).
    ExternalSelf,
    /// This session's internal queue (`#_internal`).
    Internal,
    /// A running invoked service (`#_invoke_<logical-id>`).
    Invoke(String),
}

impl SendTarget {
    /// Parses a document target string.
    pub fn parse(target: Option<&str>) -> Result<Self, String> {
        match target {
            None => Ok(SendTarget::ExternalSelf),
            Some("#_internal") => Ok(SendTarget::Internal),
            Some(t) => match t.strip_prefix("#_invoke_") {
                Some(logical) if !logical.is_empty() => {
                    Ok(SendTarget::Invoke(logical.to_string()))
                }
                _ => Err(format!("unsupported send target '{t}'")),
            },
        }
    }
}

/// One arm of a compiled `if`; `cond: None` is the `else` arm.
pub struct IfBranch {
    pub cond: Option<Arc<dyn ConditionEvaluator>>,
    pub actions: Vec<CompiledAction>,
}

/// An action with every expression surface resolved to an evaluator.
pub enum CompiledAction {
    Assign {
        location: Arc<dyn LocationEvaluator>,
        expr: Arc<dyn ValueEvaluator>,
    },
    Raise {
        event: String,
    },
    Send {
        event: String,
        data: Option<Arc<dyn ValueEvaluator>>,
        send_id: Option<String>,
        delay: Option<Duration>,
        target: SendTarget,
    },
    Cancel {
        send_id: String,
    },
    Log {
        label: Option<String>,
        expr: Option<Arc<dyn ValueEvaluator>>,
    },
    Script {
        script: Arc<dyn ScriptEvaluator>,
    },
    If {
        branches: Vec<IfBranch>,
    },
    ForEach {
        array: Arc<dyn ValueEvaluator>,
        item: String,
        index: Option<String>,
        actions: Vec<CompiledAction>,
    },
}

/// Delayed sends still waiting on their timer, keyed by send id.
#[derive(Default)]
pub struct PendingSends {
    tasks: Arc<DashMap<String, tokio::task::AbortHandle>>,
}

impl PendingSends {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedules delivery after `delay`. Auto-generates a send id when
    /// the document gave none.
    pub fn schedule(
        &self,
        send_id: Option<&str>,
        delay: Duration,
        event: Event,
        sender: EventSender,
    ) {
        let send_id = send_id
            .map(str::to_string)
            .unwrap_or_else(|| Uuid::new_v4().simple().to_string());
        // A re-used send id replaces the earlier pending delivery.
        self.cancel(&send_id);

        let tasks = Arc::clone(&self.tasks);
        let key = send_id.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            tasks.remove(&key);
            let _ = sender.send(event);
        });
        self.tasks.insert(send_id, task.abort_handle());
    }

    /// Cancels a pending delivery; a no-op when already delivered or
    /// never scheduled.
    pub fn cancel(&self, send_id: &str) -> bool {
        match self.tasks.remove(send_id) {
            Some((_, handle)) => {
                handle.abort();
                true
            }
            None => false,
        }
    }

    pub fn cancel_all(&self) {
        let ids: Vec<String> = self.tasks.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.cancel(&id);
        }
    }
}

/// Capabilities an executing action block sees.
pub(crate) struct ActionScope<'a> {
    pub data: &'a DataModel,
    pub queue: &'a mut EventQueue,
    pub sender: &'a EventSender,
    pub invokes: &'a InvokeManager,
    pub sends: &'a PendingSends,
}

/// Runs a block of actions in order, stopping at the first failure.
pub(crate) fn execute_block(
    actions: &[CompiledAction],
    scope: &mut ActionScope<'_>,
) -> Result<(), ExecutionError> {
    for action in actions {
        execute(action, scope)?;
    }
    Ok(())
}

fn execute(action: &CompiledAction, scope: &mut ActionScope<'_>) -> Result<(), ExecutionError> {
    match action {
        CompiledAction::Assign { location, expr } => {
            let value = expr.evaluate(scope.data)?;
            location.set(scope.data, value)
        }
        CompiledAction::Raise { event } => {
            scope
                .queue
                .push_internal(Event::new(event.clone(), EventKind::Internal));
            Ok(())
        }
        CompiledAction::Send {
            event,
            data,
            send_id,
            delay,
            target,
        } => {
            let payload = match data {
                Some(expr) => expr.evaluate(scope.data)?,
                None => Value::Undefined,
            };
            let mut outgoing = Event::new(event.clone(), kind_for(target)).with_data(payload);
            if let Some(id) = send_id {
                outgoing = outgoing.with_send_id(id.clone());
            }

            match (target, delay) {
                (SendTarget::Internal, _) => {
                    // Internal sends are immediate; delay is meaningless
                    // inside one session.
                    scope.queue.push_internal(outgoing);
                }
                (SendTarget::ExternalSelf, None) => {
                    let _ = scope.sender.send(outgoing);
                }
                (SendTarget::ExternalSelf, Some(delay)) => {
                    scope.sends.schedule(
                        send_id.as_deref(),
                        *delay,
                        outgoing,
                        scope.sender.clone(),
                    );
                }
                (SendTarget::Invoke(logical), _) => {
                    if !scope.invokes.send_to(logical, outgoing) {
                        return Err(ExecutionError::Evaluation {
                            expr: format!("#_invoke_{logical}"),
                            reason: "no such running invoke".to_string(),
                        });
                    }
                }
            }
            Ok(())
        }
        CompiledAction::Cancel { send_id } => {
            scope.sends.cancel(send_id);
            Ok(())
        }
        CompiledAction::Log { label, expr } => {
            let value = match expr {
                Some(expr) => expr.evaluate(scope.data)?.to_display_string(),
                None => String::new(),
            };
            tracing::info!(
                label = label.as_deref().unwrap_or(""),
                %value,
                "log action"
            );
            Ok(())
        }
        CompiledAction::Script { script } => script.execute(scope.data),
        CompiledAction::If { branches } => {
            for branch in branches {
                let taken = match &branch.cond {
                    Some(cond) => cond.evaluate(scope.data)?,
                    None => true,
                };
                if taken {
                    return execute_block(&branch.actions, scope);
                }
            }
            Ok(())
        }
        CompiledAction::ForEach {
            array,
            item,
            index,
            actions,
        } => {
            let collection = array.evaluate(scope.data)?;
            let values = collection.as_list().map_err(|_| ExecutionError::Evaluation {
                expr: collection.to_display_string(),
                reason: "foreach requires an object or array".to_string(),
            })?;
            for (i, value) in values.into_iter().enumerate() {
                scope.data.declare(item, value)?;
                if let Some(index_var) = index {
                    scope.data.declare(index_var, Value::from(i as i64))?;
                }
                execute_block(actions, scope)?;
            }
            Ok(())
        }
    }
}

fn kind_for(target: &SendTarget) -> EventKind {
    match target {
        SendTarget::Internal => EventKind::Internal,
        _ => EventKind::External,
    }
}
